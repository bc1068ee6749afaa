//! Protocol Module
//!
//! The request/reply surface between clients and the engine.
//!
//! ## Wire Format
//!
//! Every message is one frame:
//! ```text
//! ┌──────────────┬─────────────────────────────┐
//! │ Len (4, BE)  │  Body (bincode)             │
//! └──────────────┴─────────────────────────────┘
//! ```
//!
//! A connection starts with a [`crate::session::SessionInfo`] frame
//! declaring the client's architecture and privileges; after that, each
//! [`Command`] frame is answered with exactly one [`Reply`] frame.

mod codec;
pub mod command;
mod reply;

pub use codec::{read_message, write_message, HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use command::Command;
pub use reply::{Reply, ReplyBody};
