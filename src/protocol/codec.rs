//! Protocol codec
//!
//! Length-prefixed frames over any byte stream: a 4-byte big-endian length
//! followed by a bincode body. One codec for both directions; the expected
//! body type picks the message.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{HiveError, Result};

/// Frame header size: 4-byte big-endian body length
pub const HEADER_SIZE: usize = 4;

/// Maximum frame body size (16 MB)
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Write one framed message.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let body = bincode::serialize(message)
        .map_err(|e| HiveError::Serialization(e.to_string()))?;
    if body.len() as u64 > u64::from(MAX_MESSAGE_SIZE) {
        return Err(HiveError::Protocol(format!(
            "message of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one framed message.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header);
    if len > MAX_MESSAGE_SIZE {
        return Err(HiveError::Protocol(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    bincode::deserialize(&body).map_err(|e| HiveError::Serialization(e.to_string()))
}
