//! Access masks and security descriptors
//!
//! The tree itself does not evaluate ACLs; it maps generic rights to key
//! rights, filters the WoW64 view-selector bits out of effective masks, and
//! synthesizes the shared default security descriptor attached to keys
//! created without one.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

// =============================================================================
// Access mask bits
// =============================================================================

pub const KEY_QUERY_VALUE: u32 = 0x0001;
pub const KEY_SET_VALUE: u32 = 0x0002;
pub const KEY_CREATE_SUB_KEY: u32 = 0x0004;
pub const KEY_ENUMERATE_SUB_KEYS: u32 = 0x0008;
pub const KEY_NOTIFY: u32 = 0x0010;
pub const KEY_CREATE_LINK: u32 = 0x0020;

/// View selectors, not real access bits; stripped by [`map_access`].
pub const KEY_WOW64_64KEY: u32 = 0x0100;
pub const KEY_WOW64_32KEY: u32 = 0x0200;

pub const DELETE: u32 = 0x0001_0000;
pub const READ_CONTROL: u32 = 0x0002_0000;
pub const WRITE_DAC: u32 = 0x0004_0000;
pub const WRITE_OWNER: u32 = 0x0008_0000;
pub const SYNCHRONIZE: u32 = 0x0010_0000;

pub const STANDARD_RIGHTS_READ: u32 = READ_CONTROL;
pub const STANDARD_RIGHTS_WRITE: u32 = READ_CONTROL;
pub const STANDARD_RIGHTS_ALL: u32 = 0x001F_0000;

pub const KEY_READ: u32 = (STANDARD_RIGHTS_READ
    | KEY_QUERY_VALUE
    | KEY_ENUMERATE_SUB_KEYS
    | KEY_NOTIFY)
    & !SYNCHRONIZE;
pub const KEY_WRITE: u32 =
    (STANDARD_RIGHTS_WRITE | KEY_SET_VALUE | KEY_CREATE_SUB_KEY) & !SYNCHRONIZE;
pub const KEY_EXECUTE: u32 = KEY_READ & !SYNCHRONIZE;
pub const KEY_ALL_ACCESS: u32 = (STANDARD_RIGHTS_ALL
    | KEY_QUERY_VALUE
    | KEY_SET_VALUE
    | KEY_CREATE_SUB_KEY
    | KEY_ENUMERATE_SUB_KEYS
    | KEY_NOTIFY
    | KEY_CREATE_LINK)
    & !SYNCHRONIZE;

pub const GENERIC_READ: u32 = 0x8000_0000;
pub const GENERIC_WRITE: u32 = 0x4000_0000;
pub const GENERIC_EXECUTE: u32 = 0x2000_0000;
pub const GENERIC_ALL: u32 = 0x1000_0000;
pub const GENERIC_MASK: u32 = GENERIC_READ | GENERIC_WRITE | GENERIC_EXECUTE | GENERIC_ALL;

/// Map generic rights to key rights and drop the bits that are not real
/// access bits (the generic set and the WoW64 view selectors).
pub fn map_access(mut access: u32) -> u32 {
    if access & GENERIC_READ != 0 {
        access |= KEY_READ;
    }
    if access & GENERIC_WRITE != 0 {
        access |= KEY_WRITE;
    }
    if access & GENERIC_EXECUTE != 0 {
        access |= KEY_EXECUTE;
    }
    if access & GENERIC_ALL != 0 {
        access |= KEY_ALL_ACCESS;
    }
    access & !(GENERIC_MASK | KEY_WOW64_64KEY | KEY_WOW64_32KEY)
}

// =============================================================================
// Security identifiers
// =============================================================================

/// A security identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sid {
    pub revision: u8,
    pub authority: u64,
    pub sub_authorities: Vec<u32>,
}

impl Sid {
    pub fn new(authority: u64, sub_authorities: &[u32]) -> Self {
        Self {
            revision: 1,
            authority,
            sub_authorities: sub_authorities.to_vec(),
        }
    }

    /// BUILTIN\Users (S-1-5-32-545)
    pub fn builtin_users() -> Self {
        Sid::new(5, &[32, 545])
    }

    /// BUILTIN\Administrators (S-1-5-32-544)
    pub fn builtin_admins() -> Self {
        Sid::new(5, &[32, 544])
    }

    /// Default local user account
    pub fn local_user() -> Self {
        Sid::new(5, &[21, 0, 0, 0, 1000])
    }
}

impl fmt::Display for Sid {
    /// `S-<revision>-<authority>` followed by one `-<subauthority>` per entry.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}-{}", self.revision, self.authority)?;
        for sub in &self.sub_authorities {
            write!(f, "-{}", sub)?;
        }
        Ok(())
    }
}

// =============================================================================
// Security descriptors
// =============================================================================

/// ACE inheritance / shape flags.
pub const ACE_INHERIT_ONLY: u8 = 0x08;
pub const ACE_CONTAINER_INHERIT: u8 = 0x02;

/// An access-allowed ACE. Denied ACEs never occur in the default descriptor,
/// so the type tag is implicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessAllowedAce {
    pub flags: u8,
    pub mask: u32,
    pub sid: Sid,
}

/// A security descriptor: owner, group, and a discretionary ACL. No SACL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityDescriptor {
    pub owner: Sid,
    pub group: Sid,
    pub dacl: Vec<AccessAllowedAce>,
}

/// The descriptor shared by every key created without an explicit one:
/// read for built-in users (inherit-only, container-inherit), full access
/// for built-in administrators, which also own the key.
pub fn default_key_sd() -> Arc<SecurityDescriptor> {
    static DEFAULT_SD: OnceLock<Arc<SecurityDescriptor>> = OnceLock::new();
    DEFAULT_SD
        .get_or_init(|| {
            Arc::new(SecurityDescriptor {
                owner: Sid::builtin_admins(),
                group: Sid::builtin_admins(),
                dacl: vec![
                    AccessAllowedAce {
                        flags: ACE_INHERIT_ONLY | ACE_CONTAINER_INHERIT,
                        mask: GENERIC_READ,
                        sid: Sid::builtin_users(),
                    },
                    AccessAllowedAce {
                        flags: 0,
                        mask: KEY_ALL_ACCESS,
                        sid: Sid::builtin_admins(),
                    },
                ],
            })
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_read_maps_to_key_read() {
        let mapped = map_access(GENERIC_READ);
        assert_eq!(mapped, KEY_READ);
        assert_eq!(mapped & GENERIC_MASK, 0);
    }

    #[test]
    fn test_generic_all_maps_to_all_access() {
        assert_eq!(map_access(GENERIC_ALL), KEY_ALL_ACCESS);
    }

    #[test]
    fn test_wow64_selectors_are_stripped() {
        let mapped = map_access(KEY_READ | KEY_WOW64_64KEY | KEY_WOW64_32KEY);
        assert_eq!(mapped, KEY_READ);
    }

    #[test]
    fn test_specific_bits_pass_through() {
        assert_eq!(map_access(KEY_SET_VALUE | DELETE), KEY_SET_VALUE | DELETE);
    }

    #[test]
    fn test_sid_formatting() {
        assert_eq!(Sid::builtin_admins().to_string(), "S-1-5-32-544");
        assert_eq!(Sid::local_user().to_string(), "S-1-5-21-0-0-0-1000");
    }

    #[test]
    fn test_default_sd_is_shared() {
        let a = default_key_sd();
        let b = default_key_sd();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.dacl.len(), 2);
        assert_eq!(a.dacl[0].mask, GENERIC_READ);
        assert_eq!(a.dacl[1].mask, KEY_ALL_ACCESS);
    }
}
