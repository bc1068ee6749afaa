//! TCP Server
//!
//! Accepts connections and dispatches to worker threads. Workers only do
//! framing; the engine itself stays single-threaded behind its request
//! channel.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};

use crate::config::Config;
use crate::engine::{Engine, EngineRequest};
use crate::error::{HiveError, Result};

use super::Connection;

/// Message sent to worker threads
enum WorkerMessage {
    /// New client connection to handle
    NewConnection(TcpStream),
    /// Signal to shutdown
    Shutdown,
}

/// TCP server for the configuration tree
pub struct Server {
    /// Server configuration
    config: Config,

    /// Worker thread handles
    workers: Vec<JoinHandle<()>>,

    /// Shutdown flag checked by the accept loop
    shutdown: Arc<AtomicBool>,

    /// Active connection count
    active_connections: Arc<AtomicUsize>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            workers: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Flag that stops the accept loop when set.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Start serving (blocking). Consumes the engine: it moves onto its own
    /// thread and is flushed and torn down when the server stops.
    pub fn run(&mut self, engine: Engine) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).map_err(|e| {
            HiveError::Network(format!(
                "failed to bind to {}: {}",
                self.config.listen_addr, e
            ))
        })?;

        // non-blocking so the shutdown flag is honored
        listener.set_nonblocking(true)?;
        tracing::info!("server listening on {}", self.config.listen_addr);

        let (engine_sender, engine_receiver) = unbounded::<EngineRequest>();
        let engine_thread = thread::Builder::new()
            .name("keyhive-engine".to_string())
            .spawn(move || engine.run(engine_receiver))
            .map_err(|e| HiveError::Network(format!("failed to spawn engine thread: {e}")))?;

        let num_workers = thread::available_parallelism().map_or(4, usize::from);
        let (work_sender, work_receiver) = bounded::<WorkerMessage>(self.config.max_connections);
        tracing::info!("starting {} worker threads", num_workers);

        for worker_id in 0..num_workers {
            let worker = Worker {
                id: worker_id,
                receiver: work_receiver.clone(),
                engine: engine_sender.clone(),
                active_connections: Arc::clone(&self.active_connections),
                write_timeout: Duration::from_millis(self.config.write_timeout_ms),
            };
            let handle = thread::Builder::new()
                .name(format!("keyhive-worker-{worker_id}"))
                .spawn(move || worker.run())
                .map_err(|e| HiveError::Network(format!("failed to spawn worker: {e}")))?;
            self.workers.push(handle);
        }

        self.accept_loop(&listener, &work_sender);

        // cleanup after shutdown
        for _ in &self.workers {
            let _ = work_sender.send(WorkerMessage::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        let _ = engine_sender.send(EngineRequest::Shutdown);
        let _ = engine_thread.join();
        tracing::info!("server stopped");
        Ok(())
    }

    fn accept_loop(&self, listener: &TcpListener, work_sender: &Sender<WorkerMessage>) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.active_connections.load(Ordering::Relaxed) >= self.config.max_connections
                    {
                        tracing::warn!(%peer, "connection limit reached, dropping");
                        continue;
                    }
                    tracing::debug!(%peer, "accepted connection");
                    if work_sender.send(WorkerMessage::NewConnection(stream)).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                }
            }
        }
    }
}

/// One worker: picks up a connection and drives it for its whole lifetime.
struct Worker {
    id: usize,
    receiver: Receiver<WorkerMessage>,
    engine: Sender<EngineRequest>,
    active_connections: Arc<AtomicUsize>,
    write_timeout: Duration,
}

impl Worker {
    fn run(self) {
        while let Ok(message) = self.receiver.recv() {
            match message {
                WorkerMessage::NewConnection(stream) => {
                    self.active_connections.fetch_add(1, Ordering::Relaxed);
                    let mut connection =
                        Connection::new(stream, self.engine.clone(), self.write_timeout);
                    if let Err(err) = connection.handle() {
                        tracing::debug!(worker = self.id, %err, "connection ended with error");
                    }
                    self.active_connections.fetch_sub(1, Ordering::Relaxed);
                }
                WorkerMessage::Shutdown => break,
            }
        }
    }
}
