//! Connection Handler
//!
//! Drives a single client connection: the opening `SessionInfo` frame
//! attaches a session, then each command frame is forwarded to the engine
//! thread and its reply written back. The session detaches when the
//! connection ends, which closes its handles and removes its notifications.

use std::net::TcpStream;
use std::time::Duration;

use crossbeam::channel::{bounded, Sender};

use crate::engine::EngineRequest;
use crate::error::{HiveError, Result};
use crate::protocol::{read_message, write_message, Command, Reply};
use crate::session::{SessionId, SessionInfo};

/// Handles a single client connection
pub struct Connection {
    stream: TcpStream,
    engine: Sender<EngineRequest>,
    write_timeout: Duration,
}

impl Connection {
    pub fn new(stream: TcpStream, engine: Sender<EngineRequest>, write_timeout: Duration) -> Self {
        Connection {
            stream,
            engine,
            write_timeout,
        }
    }

    /// Handle the connection (blocking until closed)
    pub fn handle(&mut self) -> Result<()> {
        self.stream.set_nodelay(true)?;
        self.stream.set_write_timeout(Some(self.write_timeout))?;
        // idle reads wake up periodically so a stopping server can reclaim
        // the worker
        self.stream
            .set_read_timeout(Some(Duration::from_secs(60)))?;

        let info: SessionInfo = read_message(&mut self.stream)?;
        let session = self.attach(info)?;
        let result = self.serve(session);
        let _ = self.engine.send(EngineRequest::Detach { session });
        result
    }

    fn attach(&mut self, info: SessionInfo) -> Result<SessionId> {
        let (reply_sender, reply_receiver) = bounded(1);
        self.engine
            .send(EngineRequest::Attach {
                info,
                reply: reply_sender,
            })
            .map_err(|_| HiveError::Network("engine is gone".to_string()))?;
        reply_receiver
            .recv()
            .map_err(|_| HiveError::Network("engine is gone".to_string()))
    }

    fn serve(&mut self, session: SessionId) -> Result<()> {
        loop {
            let command: Command = match read_message(&mut self.stream) {
                Ok(command) => command,
                Err(HiveError::Io(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof
                        || err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    return Ok(());
                }
                Err(HiveError::Io(err))
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => return Err(err),
            };

            let (reply_sender, reply_receiver) = bounded::<Reply>(1);
            self.engine
                .send(EngineRequest::Execute {
                    session,
                    command,
                    reply: reply_sender,
                })
                .map_err(|_| HiveError::Network("engine is gone".to_string()))?;
            let reply = reply_receiver
                .recv()
                .map_err(|_| HiveError::Network("engine is gone".to_string()))?;
            write_message(&mut self.stream, &reply)?;
        }
    }
}
