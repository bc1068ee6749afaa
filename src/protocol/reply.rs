//! Reply definitions
//!
//! Every command is answered by one `Reply`. `status: None` is success;
//! `Some(Status::Pending)` reports a successfully armed notification; any
//! other status is the failure code. Some failures still carry a body
//! (a missed value read reports the invalid type marker).

use serde::{Deserialize, Serialize};

use crate::error::Status;
use crate::session::HandleId;
use crate::tree::{EnumKeyInfo, ValueInfo, ValueType};

/// A response to send to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// `None` on success
    pub status: Option<Status>,
    pub body: ReplyBody,
}

/// Payload of a reply, by command shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplyBody {
    None,

    /// create_key: the handle and whether the key is fresh
    Created { hkey: HandleId, created: bool },

    /// open_key
    Opened { hkey: HandleId },

    /// enum_key
    KeyInfo(EnumKeyInfo),

    /// get_key_value: type, full payload length, clipped payload
    ValueData {
        vtype: ValueType,
        total: u32,
        data: Vec<u8>,
    },

    /// enum_key_value
    ValueInfo(ValueInfo),

    /// create_event
    Event { handle: HandleId },

    /// poll_event
    EventState { signaled: bool },

    /// ping
    Pong,
}

impl Reply {
    /// Successful reply with a body
    pub fn ok(body: ReplyBody) -> Self {
        Reply { status: None, body }
    }

    /// Successful reply with no body
    pub fn none() -> Self {
        Reply::ok(ReplyBody::None)
    }

    /// Failure reply
    pub fn err(status: Status) -> Self {
        Reply {
            status: Some(status),
            body: ReplyBody::None,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.status.is_some_and(Status::is_failure)
    }
}
