//! Tree Module
//!
//! The hierarchical key/value data model: wide-string names, sorted child and
//! value arrays, the key arena, and every tree operation (lookup with symlink
//! and WoW64 resolution, create/open/delete, value access, notification and
//! dirty-marking walks).

use serde::{Deserialize, Serialize};

pub mod arena;
pub mod key;
pub mod name;
pub mod registry;

pub use arena::{KeyArena, KeyId};
pub use key::{KeyFlags, KeyNode, KeyValue, ValueType};
pub use name::{cmp_ci, eq_ci, PathCursor, WString};
pub use registry::{Attributes, EnumKeyInfo, KeyInfoClass, Registry, ValueInfo, ValueInfoClass};

// =============================================================================
// Limits
// =============================================================================

/// Minimum allocated capacity of child and value arrays.
pub const MIN_ENTRIES: usize = 8;

/// Maximum length of a single key-name segment, in UTF-16 units.
pub const MAX_NAME_LEN: usize = 256;

/// Maximum length of a value name, in UTF-16 units.
pub const MAX_VALUE_NAME_LEN: usize = 16383;

/// Maximum length of a full path, in UTF-16 units.
pub const MAX_PATH_LEN: usize = 65533;

/// Symlink hops allowed before lookup gives up on a chain or cycle.
pub const MAX_SYMLINK_HOPS: usize = 16;

// =============================================================================
// Well-known names
// =============================================================================

const fn wide<const N: usize>(s: &str) -> [u16; N] {
    let bytes = s.as_bytes();
    assert!(bytes.len() == N);
    let mut out = [0u16; N];
    let mut i = 0;
    while i < N {
        out[i] = bytes[i] as u16;
        i += 1;
    }
    out
}

/// Name of the root key; rooted paths are spelled `\REGISTRY\...`.
pub const ROOT_NAME: [u16; 8] = wide("REGISTRY");

/// Child that carries the 32-bit view of a WoW64-split key.
pub const WOW6432NODE: [u16; 11] = wide("Wow6432Node");

/// The single meaningful value of a symlink key.
pub const SYMLINK_VALUE: [u16; 17] = wide("SymbolicLinkValue");

// =============================================================================
// Change notification filter bits
// =============================================================================

/// A child was created, deleted, or renamed.
pub const CHANGE_NAME: u32 = 0x01;
/// Key attributes changed. Forwarded, never generated here.
pub const CHANGE_ATTRIBUTES: u32 = 0x02;
/// A value was set or deleted. Does not bubble past the key it happened on.
pub const CHANGE_LAST_SET: u32 = 0x04;
/// Security descriptor changed. Forwarded, never generated here.
pub const CHANGE_SECURITY: u32 = 0x08;

// =============================================================================
// Creation options
// =============================================================================

/// Options accepted by create requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Key lives only in memory and is never persisted.
    pub volatile: bool,
    /// Create the key as a symbolic link.
    pub create_link: bool,
}
