//! Key nodes and values
//!
//! A key holds its name, optional class, sorted children (by id, names live
//! on the child nodes), sorted values, flags, a tick timestamp, and pending
//! notifications. The child and value arrays follow an explicit capacity
//! policy: start at 8 slots, grow by half when full, give a third back when
//! occupancy drops below half, never below 8.

use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::access::SecurityDescriptor;
use crate::clock::Ticks;
use crate::notify::Notification;
use crate::tree::name::{cmp_ci, WString};
use crate::tree::{arena::KeyId, MIN_ENTRIES};

bitflags! {
    /// Key state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyFlags: u32 {
        /// Not persisted; never dirty.
        const VOLATILE = 0x0001;
        /// Tombstone: unlinked from the tree but kept alive by handles.
        const DELETED  = 0x0002;
        /// Needs saving.
        const DIRTY    = 0x0004;
        /// Redirects lookups through its SymbolicLinkValue.
        const SYMLINK  = 0x0008;
        /// Owns a Wow6432Node child mirroring a 32-bit subspace.
        const WOW64    = 0x0010;
        /// Children are shared between the 32- and 64-bit views.
        const WOWSHARE = 0x0020;
    }
}

/// Type tag of a value payload.
///
/// The named constants cover the standard set; arbitrary tags round-trip
/// through the `hex(<tag>):` form of the text format, so this stays an open
/// newtype rather than a closed enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueType(pub u32);

impl Default for ValueType {
    fn default() -> Self {
        ValueType::NONE
    }
}

impl ValueType {
    pub const NONE: ValueType = ValueType(0);
    pub const SZ: ValueType = ValueType(1);
    pub const EXPAND_SZ: ValueType = ValueType(2);
    pub const BINARY: ValueType = ValueType(3);
    pub const DWORD: ValueType = ValueType(4);
    pub const DWORD_BIG_ENDIAN: ValueType = ValueType(5);
    pub const LINK: ValueType = ValueType(6);
    pub const MULTI_SZ: ValueType = ValueType(7);
    pub const QWORD: ValueType = ValueType(11);
    /// Reported when a get misses; never stored.
    pub const INVALID: ValueType = ValueType(u32::MAX);

    /// String-family types whose payload may print as a quoted string.
    pub fn is_string(self) -> bool {
        matches!(self, ValueType::SZ | ValueType::EXPAND_SZ | ValueType::MULTI_SZ)
    }
}

/// A named typed blob stored in a key. The unnamed "default" value has an
/// empty name and sorts first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub name: WString,
    pub vtype: ValueType,
    pub data: Vec<u8>,
}

/// A node of the configuration tree.
#[derive(Debug)]
pub struct KeyNode {
    /// Case-preserving name, compared case-insensitively.
    pub name: WString,
    /// Optional opaque class string.
    pub class: Option<WString>,
    /// Non-owning back reference; `None` for the root and for tombstones.
    pub parent: Option<KeyId>,
    /// Children sorted case-insensitively by name.
    pub children: Vec<KeyId>,
    /// Values sorted case-insensitively by name.
    pub values: Vec<KeyValue>,
    pub flags: KeyFlags,
    /// Last modification, in ticks since 1601. Zero means "not yet assigned"
    /// while a file load is in progress.
    pub modif: Ticks,
    /// Pending change subscriptions.
    pub notify: Vec<Notification>,
    /// Explicit security descriptor, if one was supplied at creation.
    pub sd: Option<Arc<SecurityDescriptor>>,
}

impl KeyNode {
    pub fn new(name: WString, modif: Ticks) -> Self {
        KeyNode {
            name,
            class: None,
            parent: None,
            children: Vec::new(),
            values: Vec::new(),
            flags: KeyFlags::empty(),
            modif,
            notify: Vec::new(),
            sd: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(KeyFlags::DELETED)
    }

    /// Binary-search the values for `name`. `Ok` carries the index of the
    /// match, `Err` the insertion point.
    pub fn find_value(&self, name: &[u16]) -> Result<usize, usize> {
        self.values
            .binary_search_by(|v| cmp_ci(v.name.as_units(), name))
    }

    /// Insert a value at the position `find_value` reported, applying the
    /// growth policy first.
    pub fn insert_value(&mut self, index: usize, value: KeyValue) {
        reserve_for_insert(&mut self.values);
        self.values.insert(index, value);
    }

    /// Remove the value at `index` and give back surplus capacity.
    pub fn remove_value(&mut self, index: usize) -> KeyValue {
        let value = self.values.remove(index);
        shrink_after_remove(&mut self.values);
        value
    }

    /// Overwrite or insert a value without touching timestamps or dirty
    /// state. Used by the file loader.
    pub fn install_value(&mut self, name: WString, vtype: ValueType, data: Vec<u8>) {
        match self.find_value(name.as_units()) {
            Ok(index) => {
                self.values[index].vtype = vtype;
                self.values[index].data = data;
            }
            Err(index) => self.insert_value(index, KeyValue { name, vtype, data }),
        }
    }
}

/// Grow to `cap + cap/2` when full; first allocation is `MIN_ENTRIES`.
pub(crate) fn reserve_for_insert<T>(vec: &mut Vec<T>) {
    if vec.len() == vec.capacity() {
        let new_cap = if vec.capacity() == 0 {
            MIN_ENTRIES
        } else {
            vec.capacity() + vec.capacity() / 2
        };
        vec.reserve_exact(new_cap - vec.len());
    }
}

/// Shrink to `cap - cap/3` once occupancy drops below half, floor 8.
pub(crate) fn shrink_after_remove<T>(vec: &mut Vec<T>) {
    let cap = vec.capacity();
    if cap > MIN_ENTRIES && vec.len() < cap / 2 {
        let new_cap = (cap - cap / 3).max(MIN_ENTRIES);
        vec.shrink_to(new_cap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_reserve_is_min_entries() {
        let mut v: Vec<u32> = Vec::new();
        reserve_for_insert(&mut v);
        assert!(v.capacity() >= MIN_ENTRIES);
    }

    #[test]
    fn test_grow_by_half() {
        let mut v: Vec<u32> = Vec::with_capacity(8);
        v.extend(0..8);
        reserve_for_insert(&mut v);
        assert!(v.capacity() >= 12);
    }

    #[test]
    fn test_shrink_keeps_floor() {
        let mut v: Vec<u32> = Vec::with_capacity(8);
        v.push(1);
        shrink_after_remove(&mut v);
        assert!(v.capacity() >= MIN_ENTRIES);
    }

    #[test]
    fn test_values_sorted_default_first() {
        let mut key = KeyNode::new(WString::from("K"), 1);
        for name in ["beta", "", "Alpha"] {
            let idx = key.find_value(WString::from(name).as_units()).unwrap_err();
            key.insert_value(
                idx,
                KeyValue {
                    name: WString::from(name),
                    vtype: ValueType::SZ,
                    data: vec![],
                },
            );
        }
        let names: Vec<String> = key.values.iter().map(|v| v.name.to_string_lossy()).collect();
        assert_eq!(names, vec!["", "Alpha", "beta"]);
    }
}
