//! Error types for KeyHive
//!
//! Two layers: `Status` is the closed set of operation status codes carried
//! back to clients in every reply, `HiveError` wraps everything else that can
//! go wrong inside the server process (I/O, framing, configuration).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using HiveError
pub type Result<T> = std::result::Result<T, HiveError>;

/// Result of a single tree operation, resolved into a reply status on the
/// dispatch boundary.
pub type OpResult<T> = std::result::Result<T, Status>;

/// Status codes reported to clients.
///
/// The numeric values are the NT status codes the on-wire clients expect;
/// success is represented by the absence of a status (`Option<Status>` in
/// replies), not by a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Status {
    // -------------------------------------------------------------------------
    // Informational / warning
    // -------------------------------------------------------------------------
    #[error("operation pending")]
    Pending,

    #[error("object name already exists")]
    ObjectNameExists,

    #[error("no more entries")]
    NoMoreEntries,

    // -------------------------------------------------------------------------
    // Lookup and naming
    // -------------------------------------------------------------------------
    #[error("object name not found")]
    ObjectNameNotFound,

    #[error("object name collision")]
    ObjectNameCollision,

    #[error("object name invalid")]
    ObjectNameInvalid,

    #[error("object path invalid")]
    ObjectPathInvalid,

    #[error("object path syntax bad")]
    ObjectPathSyntaxBad,

    #[error("name too long")]
    NameTooLong,

    // -------------------------------------------------------------------------
    // Operation validity
    // -------------------------------------------------------------------------
    #[error("invalid parameter")]
    InvalidParameter,

    #[error("invalid handle")]
    InvalidHandle,

    #[error("access denied")]
    AccessDenied,

    #[error("key has been deleted")]
    KeyDeleted,

    #[error("child must be volatile")]
    ChildMustBeVolatile,

    #[error("privilege not held")]
    PrivilegeNotHeld,

    // -------------------------------------------------------------------------
    // Resources and persistence
    // -------------------------------------------------------------------------
    #[error("out of memory")]
    NoMemory,

    #[error("not a registry file")]
    NotRegistryFile,
}

impl Status {
    /// Numeric wire code for this status.
    pub fn code(self) -> u32 {
        match self {
            Status::Pending => 0x0000_0103,
            Status::ObjectNameExists => 0x4000_0000,
            Status::NoMoreEntries => 0x8000_001A,
            Status::ObjectNameNotFound => 0xC000_0034,
            Status::ObjectNameCollision => 0xC000_0035,
            Status::ObjectNameInvalid => 0xC000_0033,
            Status::ObjectPathInvalid => 0xC000_0039,
            Status::ObjectPathSyntaxBad => 0xC000_003B,
            Status::NameTooLong => 0xC000_0106,
            Status::InvalidParameter => 0xC000_000D,
            Status::InvalidHandle => 0xC000_0008,
            Status::AccessDenied => 0xC000_0022,
            Status::KeyDeleted => 0xC000_017C,
            Status::ChildMustBeVolatile => 0xC000_0181,
            Status::PrivilegeNotHeld => 0xC000_0061,
            Status::NoMemory => 0xC000_0017,
            Status::NotRegistryFile => 0xC000_015C,
        }
    }

    /// True for codes that report a failed operation (severity bits set).
    pub fn is_failure(self) -> bool {
        self.code() & 0xC000_0000 == 0xC000_0000
    }
}

/// Unified error type for everything above the tree operations
#[derive(Debug, Error)]
pub enum HiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Status(#[from] Status),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("configuration error: {0}")]
    Config(String),
}
