//! Command definitions
//!
//! Every request a client can issue. Key and event handles are session
//! scoped; `parent: None` on create/open/load denotes a rooted request whose
//! path must spell the full `\REGISTRY\...` name. Info classes travel as raw
//! integers so an unknown class reports `INVALID_PARAMETER` instead of a
//! framing error.

use serde::{Deserialize, Serialize};

use crate::access::SecurityDescriptor;
use crate::session::HandleId;
use crate::tree::{CreateOptions, ValueType, WString};

/// A parsed command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Create (or open, if present) a key
    CreateKey {
        parent: Option<HandleId>,
        path: WString,
        class: Option<WString>,
        options: CreateOptions,
        access: u32,
        attributes: u32,
        sd: Option<SecurityDescriptor>,
    },

    /// Open an existing key
    OpenKey {
        parent: Option<HandleId>,
        path: WString,
        access: u32,
        attributes: u32,
    },

    /// Delete a key (non-recursive)
    DeleteKey { hkey: HandleId },

    /// Flush a key. Reserved; validates the handle and does nothing else.
    FlushKey { hkey: HandleId },

    /// Query a key (`index: None`) or enumerate its `index`-th subkey
    EnumKey {
        hkey: HandleId,
        index: Option<u32>,
        info_class: u32,
    },

    /// Set a value
    SetKeyValue {
        hkey: HandleId,
        name: WString,
        vtype: ValueType,
        data: Vec<u8>,
    },

    /// Read a value; at most `max_data` payload bytes come back
    GetKeyValue {
        hkey: HandleId,
        name: WString,
        max_data: u32,
    },

    /// Enumerate the `index`-th value
    EnumKeyValue {
        hkey: HandleId,
        index: u32,
        info_class: u32,
        max_data: u32,
    },

    /// Delete a value
    DeleteKeyValue { hkey: HandleId, name: WString },

    /// Load a branch file under a new key (requires the restore privilege)
    LoadRegistry {
        parent: Option<HandleId>,
        path: WString,
        file: String,
    },

    /// Drop a previously loaded branch (requires the restore privilege)
    UnloadRegistry { hkey: HandleId },

    /// Write a branch to a file (requires the backup privilege)
    SaveRegistry { hkey: HandleId, file: String },

    /// Arm a change notification; replies `PENDING` on success
    SetNotification {
        hkey: HandleId,
        event: HandleId,
        subtree: bool,
        filter: u32,
    },

    /// Allocate a one-shot event for notifications
    CreateEvent,

    /// Report whether an event has been signaled
    PollEvent { event: HandleId },

    /// Close a key or event handle
    CloseHandle { handle: HandleId },

    /// Health check
    Ping,
}

// Info-class wire values.

pub const KEY_BASIC_INFORMATION: u32 = 0;
pub const KEY_NODE_INFORMATION: u32 = 1;
pub const KEY_FULL_INFORMATION: u32 = 2;
pub const KEY_NAME_INFORMATION: u32 = 3;
pub const KEY_CACHED_INFORMATION: u32 = 4;

pub const KEY_VALUE_BASIC_INFORMATION: u32 = 0;
pub const KEY_VALUE_FULL_INFORMATION: u32 = 1;
pub const KEY_VALUE_PARTIAL_INFORMATION: u32 = 2;

/// Attribute bit: return a symlink key itself instead of following it.
pub const ATTR_OPEN_LINK: u32 = 0x0001;
