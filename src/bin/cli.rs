//! KeyHive CLI Client
//!
//! Command-line client speaking the framed protocol over a single TCP
//! stream, sequential write-then-read.

use std::net::TcpStream;
use std::time::Duration;

use clap::{Parser, Subcommand};
use keyhive::access::{KEY_ALL_ACCESS, KEY_READ};
use keyhive::error::Status;
use keyhive::protocol::{
    command, read_message, write_message, Command, Reply, ReplyBody,
};
use keyhive::session::{HandleId, SessionInfo};
use keyhive::tree::{CreateOptions, ValueType, WString};
use keyhive::Arch;

/// KeyHive CLI
#[derive(Parser, Debug)]
#[command(name = "keyhive-cli")]
#[command(about = "CLI for the KeyHive configuration-tree server")]
#[command(version)]
struct Args {
    /// Server address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:6479")]
    server: String,

    /// Connection timeout in milliseconds
    #[arg(short, long, default_value = "5000")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a key (full \REGISTRY\... path)
    Create {
        path: String,

        /// Class string for the new key
        #[arg(long)]
        class: Option<String>,

        /// Create a volatile (non-persisted) key
        #[arg(long)]
        volatile: bool,
    },

    /// Open a key and report whether it exists
    Open { path: String },

    /// Delete a key
    Delete { path: String },

    /// List the subkeys and values of a key
    Enum { path: String },

    /// Set a value on a key
    Set {
        path: String,
        name: String,
        value: String,

        /// Value type: sz, expand, multi, dword, or hex
        #[arg(long, default_value = "sz")]
        r#type: String,
    },

    /// Read a value from a key
    Get { path: String, name: String },

    /// Delete a value from a key
    DelValue { path: String, name: String },

    /// Save a branch to a file (requires the backup privilege)
    Save { path: String, file: String },

    /// Ping the server
    Ping,
}

struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(server: &str, timeout: Duration) -> std::io::Result<Self> {
        let addr = server.parse().expect("Invalid server address");
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(Client { stream })
    }

    fn hello(&mut self) -> keyhive::Result<()> {
        let info = SessionInfo {
            arch: Arch::native(),
            privileges: u32::MAX,
        };
        write_message(&mut self.stream, &info)
    }

    fn call(&mut self, command: &Command) -> keyhive::Result<Reply> {
        write_message(&mut self.stream, command)?;
        read_message(&mut self.stream)
    }

    /// Open `path` and return its handle, exiting on failure.
    fn open(&mut self, path: &str, access: u32) -> HandleId {
        let reply = self
            .call(&Command::OpenKey {
                parent: None,
                path: WString::from(path),
                access,
                attributes: 0,
            })
            .unwrap_or_else(|err| fail(&format!("open failed: {err}")));
        check(&reply);
        match reply.body {
            ReplyBody::Opened { hkey } => hkey,
            _ => fail("unexpected reply"),
        }
    }
}

fn check(reply: &Reply) {
    if let Some(status) = reply.status {
        if status.is_failure() {
            fail(&format!("server error: {status}"));
        }
    }
}

fn fail(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn parse_value(kind: &str, value: &str) -> (ValueType, Vec<u8>) {
    match kind {
        "sz" | "expand" | "multi" => {
            let vtype = match kind {
                "expand" => ValueType::EXPAND_SZ,
                "multi" => ValueType::MULTI_SZ,
                _ => ValueType::SZ,
            };
            let mut units: Vec<u16> = value.encode_utf16().collect();
            units.push(0);
            let mut bytes = Vec::with_capacity(units.len() * 2);
            for unit in units {
                bytes.extend_from_slice(&unit.to_le_bytes());
            }
            (vtype, bytes)
        }
        "dword" => {
            let number = if let Some(hex) = value.strip_prefix("0x") {
                u32::from_str_radix(hex, 16)
            } else {
                value.parse()
            };
            match number {
                Ok(n) => (ValueType::DWORD, n.to_le_bytes().to_vec()),
                Err(_) => fail(&format!("invalid dword value {value:?}")),
            }
        }
        "hex" => {
            let cleaned: String = value.chars().filter(|c| !",: ".contains(*c)).collect();
            if cleaned.len() % 2 != 0 {
                fail("hex value must have an even number of digits");
            }
            let bytes = (0..cleaned.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16))
                .collect::<Result<Vec<u8>, _>>()
                .unwrap_or_else(|_| fail("invalid hex value"));
            (ValueType::BINARY, bytes)
        }
        other => fail(&format!("unknown value type {other:?}")),
    }
}

fn format_value(vtype: ValueType, data: &[u8]) -> String {
    match vtype {
        ValueType::SZ | ValueType::EXPAND_SZ => {
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            let mut s = String::from_utf16_lossy(&units);
            while s.ends_with('\0') {
                s.pop();
            }
            format!("{s:?}")
        }
        ValueType::DWORD if data.len() == 4 => {
            let n = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            format!("0x{n:08x}")
        }
        _ => data
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(","),
    }
}

fn main() {
    let args = Args::parse();

    let mut client = match Client::connect(&args.server, Duration::from_millis(args.timeout)) {
        Ok(client) => client,
        Err(err) => fail(&format!("failed to connect to {}: {err}", args.server)),
    };
    if let Err(err) = client.hello() {
        fail(&format!("handshake failed: {err}"));
    }

    match args.command {
        Commands::Create {
            path,
            class,
            volatile,
        } => {
            let reply = client
                .call(&Command::CreateKey {
                    parent: None,
                    path: WString::from(path.as_str()),
                    class: class.as_deref().map(WString::from),
                    options: CreateOptions {
                        volatile,
                        create_link: false,
                    },
                    access: KEY_ALL_ACCESS,
                    attributes: 0,
                    sd: None,
                })
                .unwrap_or_else(|err| fail(&format!("create failed: {err}")));
            check(&reply);
            match reply.body {
                ReplyBody::Created { created, .. } => {
                    println!("{}", if created { "created" } else { "already exists" });
                }
                _ => fail("unexpected reply"),
            }
        }

        Commands::Open { path } => {
            client.open(&path, KEY_READ);
            println!("ok");
        }

        Commands::Delete { path } => {
            let hkey = client.open(&path, keyhive::access::DELETE);
            let reply = client
                .call(&Command::DeleteKey { hkey })
                .unwrap_or_else(|err| fail(&format!("delete failed: {err}")));
            check(&reply);
            println!("deleted");
        }

        Commands::Enum { path } => {
            let hkey = client.open(&path, KEY_READ);
            let mut index = 0;
            loop {
                let reply = client
                    .call(&Command::EnumKey {
                        hkey,
                        index: Some(index),
                        info_class: command::KEY_BASIC_INFORMATION,
                    })
                    .unwrap_or_else(|err| fail(&format!("enum failed: {err}")));
                if reply.status == Some(Status::NoMoreEntries) {
                    break;
                }
                check(&reply);
                if let ReplyBody::KeyInfo(info) = reply.body {
                    if let Some(name) = info.name {
                        println!("[{name}]");
                    }
                }
                index += 1;
            }
            let mut index = 0;
            loop {
                let reply = client
                    .call(&Command::EnumKeyValue {
                        hkey,
                        index,
                        info_class: command::KEY_VALUE_FULL_INFORMATION,
                        max_data: 4096,
                    })
                    .unwrap_or_else(|err| fail(&format!("enum failed: {err}")));
                if reply.status == Some(Status::NoMoreEntries) {
                    break;
                }
                check(&reply);
                if let ReplyBody::ValueInfo(info) = reply.body {
                    let name = info.name.map(|n| n.to_string_lossy()).unwrap_or_default();
                    let shown = if name.is_empty() { "@".to_string() } else { name };
                    println!("{shown} = {}", format_value(info.vtype, &info.data));
                }
                index += 1;
            }
        }

        Commands::Set {
            path,
            name,
            value,
            r#type,
        } => {
            let hkey = client.open(&path, KEY_ALL_ACCESS);
            let (vtype, data) = parse_value(&r#type, &value);
            let reply = client
                .call(&Command::SetKeyValue {
                    hkey,
                    name: WString::from(name.as_str()),
                    vtype,
                    data,
                })
                .unwrap_or_else(|err| fail(&format!("set failed: {err}")));
            check(&reply);
            println!("ok");
        }

        Commands::Get { path, name } => {
            let hkey = client.open(&path, KEY_READ);
            let reply = client
                .call(&Command::GetKeyValue {
                    hkey,
                    name: WString::from(name.as_str()),
                    max_data: u32::MAX,
                })
                .unwrap_or_else(|err| fail(&format!("get failed: {err}")));
            check(&reply);
            if let ReplyBody::ValueData { vtype, data, .. } = reply.body {
                println!("{}", format_value(vtype, &data));
            }
        }

        Commands::DelValue { path, name } => {
            let hkey = client.open(&path, KEY_ALL_ACCESS);
            let reply = client
                .call(&Command::DeleteKeyValue {
                    hkey,
                    name: WString::from(name.as_str()),
                })
                .unwrap_or_else(|err| fail(&format!("delete failed: {err}")));
            check(&reply);
            println!("ok");
        }

        Commands::Save { path, file } => {
            let hkey = client.open(&path, KEY_READ);
            let reply = client
                .call(&Command::SaveRegistry { hkey, file })
                .unwrap_or_else(|err| fail(&format!("save failed: {err}")));
            check(&reply);
            println!("saved");
        }

        Commands::Ping => {
            let reply = client
                .call(&Command::Ping)
                .unwrap_or_else(|err| fail(&format!("ping failed: {err}")));
            check(&reply);
            println!("pong");
        }
    }
}
