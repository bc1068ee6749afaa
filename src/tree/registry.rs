//! Tree operations
//!
//! All structural operations on the key tree: lookup with symlink chasing and
//! WoW64 steering, recursive create, open, delete with tombstoning, key and
//! value enumeration, value access, and the mutation walks (dirty marking up,
//! clean sweeping down, notification matching up).

use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::access::SecurityDescriptor;
use crate::clock::{self, Ticks};
use crate::error::{OpResult, Status};
use crate::notify::{Notification, NotifyEvent};
use crate::session::{HandleId, SessionId};
use crate::tree::arena::{KeyArena, KeyId};
use crate::tree::key::{reserve_for_insert, shrink_after_remove, KeyFlags, KeyNode, KeyValue, ValueType};
use crate::tree::name::{cmp_ci, eq_ci, PathCursor, WString, BACKSLASH};
use crate::tree::{
    CreateOptions, CHANGE_LAST_SET, CHANGE_NAME, MAX_NAME_LEN, MAX_PATH_LEN, MAX_SYMLINK_HOPS,
    MAX_VALUE_NAME_LEN, ROOT_NAME, SYMLINK_VALUE, WOW6432NODE,
};

bitflags! {
    /// Per-request lookup attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Attributes: u32 {
        /// Return a symlink key itself instead of following it.
        const OPEN_LINK = 0x0001;
        /// Steer the walk through the 32-bit view. Derived per request from
        /// the client architecture, never set by clients directly.
        const WOW64 = 0x8000_0000;
    }
}

/// Info classes for key enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyInfoClass {
    /// Name only.
    Basic,
    /// Name and class.
    Node,
    /// Counts and maximum lengths only.
    Full,
    /// Counts, maximum lengths, and the name.
    Cached,
    /// Fully-qualified path reconstructed from the parent chain.
    Name,
}

/// Info classes for value enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueInfoClass {
    /// Name only.
    Basic,
    /// Name and data.
    Full,
    /// Data only.
    Partial,
}

/// Reply of a key enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumKeyInfo {
    pub subkeys: u32,
    pub values: u32,
    pub modif: Ticks,
    pub max_subkey: u32,
    pub max_class: u32,
    pub max_value: u32,
    pub max_data: u32,
    pub name: Option<WString>,
    pub class: Option<WString>,
}

/// Reply of a value read or enumeration. `total` is the byte length the
/// caller needs to fetch everything; `data` holds at most the requested
/// prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub vtype: ValueType,
    pub name: Option<WString>,
    pub total: u32,
    pub data: Vec<u8>,
}

/// The key tree. One instance per engine; the root is created up front and
/// held by a static reference for the lifetime of the registry.
pub struct Registry {
    arena: KeyArena,
    root: KeyId,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let mut arena = KeyArena::new();
        let root = arena.alloc(KeyNode::new(WString::from_units(&ROOT_NAME), clock::now()));
        Registry { arena, root }
    }

    pub fn root(&self) -> KeyId {
        self.root
    }

    pub fn node(&self, id: KeyId) -> &KeyNode {
        self.arena.node(id)
    }

    pub fn node_mut(&mut self, id: KeyId) -> &mut KeyNode {
        self.arena.node_mut(id)
    }

    /// Take a reference on a key (handles, save branches).
    pub fn grab(&mut self, id: KeyId) {
        self.arena.grab(id);
    }

    /// The security descriptor governing a key: the one supplied at
    /// creation, or the shared default.
    pub fn key_sd(&self, id: KeyId) -> Arc<SecurityDescriptor> {
        match &self.arena.node(id).sd {
            Some(sd) => sd.clone(),
            None => crate::access::default_key_sd(),
        }
    }

    /// Drop a reference; the last one destroys the key, firing its pending
    /// notifications and cascading into any children it still owns.
    pub fn release(&mut self, id: KeyId) {
        if let Some(node) = self.arena.release(id) {
            self.destroy(node);
        }
    }

    fn destroy(&mut self, mut node: KeyNode) {
        for notify in &mut node.notify {
            notify.fire();
        }
        for child in std::mem::take(&mut node.children) {
            let child_node = self.arena.node_mut(child);
            child_node.flags |= KeyFlags::DELETED;
            child_node.parent = None;
            self.release(child);
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Binary-search `parent`'s children for `name`. `Ok` carries the index
    /// and id of the match, `Err` the insertion point.
    fn find_child(&self, parent: KeyId, name: &[u16]) -> Result<(usize, KeyId), usize> {
        let children = &self.arena.node(parent).children;
        match children.binary_search_by(|&c| cmp_ci(self.arena.node(c).name.as_units(), name)) {
            Ok(i) => Ok((i, children[i])),
            Err(i) => Err(i),
        }
    }

    fn is_wow6432node(&self, key: KeyId) -> bool {
        eq_ci(self.arena.node(key).name.as_units(), &WOW6432NODE)
    }

    /// The Wow6432Node child of a shared key presents the parent's own
    /// children to 32-bit requests, so the search continues one level up.
    fn search_base(&self, key: KeyId, attr: Attributes) -> KeyId {
        if attr.contains(Attributes::WOW64) && self.is_wow6432node(key) {
            if let Some(parent) = self.arena.node(key).parent {
                if self.arena.node(parent).flags.contains(KeyFlags::WOWSHARE) {
                    return parent;
                }
            }
        }
        key
    }

    /// The WoW64 variant of `key` for a 32-bit request about to look up
    /// `next`, or `key` itself when no redirection applies.
    pub(crate) fn wow64_variant(&self, key: KeyId, next: Option<&[u16]>) -> KeyId {
        let node = self.arena.node(key);
        if !node.flags.contains(KeyFlags::WOW64) {
            return key;
        }
        let shared_parent = node
            .parent
            .filter(|&p| self.arena.node(p).flags.contains(KeyFlags::WOWSHARE));
        if let Some(parent) = shared_parent {
            // mirror of this key under the shared parent's Wow6432Node
            if let Ok((_, wow)) = self.find_child(parent, &WOW6432NODE) {
                if let Ok((_, mirror)) = self.find_child(wow, node.name.as_units()) {
                    return mirror;
                }
            }
            key
        } else if !next.is_some_and(|t| eq_ci(t, &WOW6432NODE)) {
            // the WOW64 flag implies the child exists
            match self.find_child(key, &WOW6432NODE) {
                Ok((_, wow)) => wow,
                Err(_) => key,
            }
        } else {
            key
        }
    }

    /// Read a symlink key's target and resolve it, without following further
    /// links at the target's final component. Returns `None` when the target
    /// does not resolve; the caller then keeps the link key itself.
    fn follow_symlink(&self, key: KeyId, attr: Attributes) -> Option<KeyId> {
        let node = self.arena.node(key);
        let index = node.find_value(&SYMLINK_VALUE).ok()?;
        let data = &node.values[index].data;
        let mut units: Vec<u16> = data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        while units.last() == Some(&0) {
            units.pop();
        }

        let attr = (attr | Attributes::OPEN_LINK) - Attributes::WOW64;
        if units.first() == Some(&BACKSLASH) {
            self.open_rooted(&units, attr).ok()
        } else {
            let parent = node.parent?;
            self.open_key(parent, &units, attr).ok()
        }
    }

    /// Resolve a chain of symlinks starting at `key`, bounded by the hop cap.
    fn chase_symlinks(&self, mut key: KeyId, attr: Attributes) -> OpResult<KeyId> {
        if attr.contains(Attributes::OPEN_LINK) {
            return Ok(key);
        }
        let mut hops = 0;
        while self.arena.node(key).flags.contains(KeyFlags::SYMLINK) {
            match self.follow_symlink(key, attr) {
                Some(target) => {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(Status::NameTooLong);
                    }
                    key = target;
                }
                None => break,
            }
        }
        Ok(key)
    }

    /// One step of the walk: find `token` under `current` and apply symlink
    /// and WoW64 resolution. `next` is the following token, if any.
    fn lookup_step(
        &self,
        current: KeyId,
        token: &[u16],
        next: Option<&[u16]>,
        attr: Attributes,
    ) -> OpResult<Option<KeyId>> {
        if token.len() > MAX_NAME_LEN {
            return Err(Status::InvalidParameter);
        }
        let base = self.search_base(current, attr);
        let Ok((_, found)) = self.find_child(base, token) else {
            return Ok(None);
        };
        let mut found = self.chase_symlinks(found, attr)?;
        if attr.contains(Attributes::WOW64) {
            found = self.wow64_variant(found, next);
            // a shared key's Wow6432Node is never the result of a walk
            if next.is_none() && self.is_wow6432node(found) {
                if let Some(parent) = self.arena.node(found).parent {
                    if self.arena.node(parent).flags.contains(KeyFlags::WOWSHARE) {
                        found = parent;
                    }
                }
            }
        }
        Ok(Some(found))
    }

    /// Open the key at `path` relative to `start`. Pure read; never mutates
    /// the tree.
    pub fn open_key(&self, start: KeyId, path: &[u16], attr: Attributes) -> OpResult<KeyId> {
        if path.len() > MAX_PATH_LEN {
            return Err(Status::ObjectNameInvalid);
        }
        let mut cursor = PathCursor::new(path)?;
        let mut current = start;
        while let Some(token) = cursor.next_token() {
            match self.lookup_step(current, token, cursor.peek_token(), attr)? {
                Some(found) => current = found,
                None => return Err(Status::ObjectNameNotFound),
            }
        }
        Ok(current)
    }

    /// Open an absolute `\REGISTRY\...` path.
    pub fn open_rooted(&self, path: &[u16], attr: Attributes) -> OpResult<KeyId> {
        let rest = self.strip_root(path)?;
        self.open_key(self.root, rest, attr)
    }

    /// Validate the `\REGISTRY` prefix of an absolute path and return the
    /// remainder, separators trimmed.
    pub(crate) fn strip_root<'a>(&self, path: &'a [u16]) -> OpResult<&'a [u16]> {
        if path.first() != Some(&BACKSLASH) {
            return Err(Status::ObjectPathSyntaxBad);
        }
        let mut cursor = PathCursor::new(&path[1..])?;
        match cursor.next_token() {
            Some(first) if eq_ci(first, &ROOT_NAME) => {}
            _ => return Err(Status::ObjectNameNotFound),
        }
        let mut rest = cursor.rest();
        while rest.first() == Some(&BACKSLASH) {
            rest = &rest[1..];
        }
        Ok(rest)
    }

    // =========================================================================
    // Create / delete
    // =========================================================================

    /// Link a freshly-built node under `parent` at the sorted position and
    /// report the change. A quiet link (file loads) reports the change
    /// without restamping the parent's modification time, so loaded
    /// timestamps survive the load of their subkeys.
    fn link_child(&mut self, parent: KeyId, index: usize, node: KeyNode, quiet: bool) -> KeyId {
        let id = self.arena.alloc(node);
        self.arena.node_mut(id).parent = Some(parent);
        let parent_node = self.arena.node_mut(parent);
        reserve_for_insert(&mut parent_node.children);
        parent_node.children.insert(index, id);
        if quiet {
            self.report_change(parent, CHANGE_NAME);
        } else {
            self.touch_key(parent, CHANGE_NAME);
        }
        id
    }

    /// Create the key at `path` relative to `start`, creating missing
    /// intermediate keys along the way. Missing intermediates inherit the
    /// volatility of the request; class and the link flag apply to the final
    /// key only. Returns the key and whether it was freshly created.
    #[allow(clippy::too_many_arguments)]
    pub fn create_key(
        &mut self,
        start: KeyId,
        path: &[u16],
        class: Option<WString>,
        options: CreateOptions,
        attr: Attributes,
        sd: Option<Arc<SecurityDescriptor>>,
        modif: Ticks,
    ) -> OpResult<(KeyId, bool)> {
        self.create_key_inner(start, path, class, options, attr, sd, modif, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_key_inner(
        &mut self,
        start: KeyId,
        path: &[u16],
        mut class: Option<WString>,
        options: CreateOptions,
        attr: Attributes,
        sd: Option<Arc<SecurityDescriptor>>,
        modif: Ticks,
        quiet: bool,
    ) -> OpResult<(KeyId, bool)> {
        if path.len() > MAX_PATH_LEN {
            return Err(Status::ObjectNameInvalid);
        }
        let mut cursor = PathCursor::new(path)?;
        let mut current = start;
        let mut created = false;
        while let Some(token) = cursor.next_token() {
            let next = cursor.peek_token();
            let is_last = next.is_none();
            match self.lookup_step(current, token, next, attr)? {
                Some(found) => {
                    if is_last && options.create_link {
                        return Err(Status::ObjectNameCollision);
                    }
                    current = found;
                }
                None => {
                    if self.arena.node(current).flags.contains(KeyFlags::VOLATILE)
                        && !options.volatile
                    {
                        return Err(Status::ChildMustBeVolatile);
                    }
                    let index = match self.find_child(current, token) {
                        Ok(_) => unreachable!("lookup_step missed an existing child"),
                        Err(index) => index,
                    };
                    let mut node = KeyNode::new(WString::from_units(token), modif);
                    node.flags = if options.volatile {
                        KeyFlags::VOLATILE
                    } else {
                        KeyFlags::DIRTY
                    };
                    if is_last {
                        if options.create_link {
                            node.flags |= KeyFlags::SYMLINK;
                        }
                        node.class = class.take();
                        node.sd = sd.clone();
                    }
                    current = self.link_child(current, index, node, quiet);
                    created = true;
                }
            }
        }
        Ok((current, created))
    }

    /// Recursive create used internally (init wiring): default options, no
    /// class, an explicit modification time.
    pub fn create_key_recursive(
        &mut self,
        start: KeyId,
        path: &[u16],
        modif: Ticks,
    ) -> OpResult<KeyId> {
        self.create_key(
            start,
            path,
            None,
            CreateOptions::default(),
            Attributes::empty(),
            None,
            modif,
        )
        .map(|(key, _)| key)
    }

    /// Recursive create for the file loader: created keys start with a zero
    /// modification time (assigned when their section finishes), and linking
    /// does not restamp parents.
    pub(crate) fn create_key_loading(&mut self, start: KeyId, path: &[u16]) -> OpResult<KeyId> {
        self.create_key_inner(
            start,
            path,
            None,
            CreateOptions::default(),
            Attributes::empty(),
            None,
            0,
            true,
        )
        .map(|(key, _)| key)
    }

    /// Unlink `key` from its parent's child array and tombstone it.
    fn unlink(&mut self, key: KeyId) {
        let Some(parent) = self.arena.node(key).parent else {
            return;
        };
        if let Ok((index, _)) = {
            let name = self.arena.node(key).name.clone();
            self.find_child(parent, name.as_units())
        } {
            let parent_node = self.arena.node_mut(parent);
            parent_node.children.remove(index);
            shrink_after_remove(&mut parent_node.children);
        }
        let node = self.arena.node_mut(key);
        node.flags |= KeyFlags::DELETED;
        node.parent = None;
    }

    /// Delete a key. The non-recursive form refuses keys with children; the
    /// recursive form deletes bottom-up, and a failure partway leaves the
    /// already-deleted descendants gone.
    pub fn delete_key(&mut self, key: KeyId, recurse: bool) -> OpResult<()> {
        if recurse {
            while let Some(&child) = self.arena.node(key).children.last() {
                self.delete_key(child, true)?;
            }
        }
        if !self.arena.node(key).children.is_empty() {
            return Err(Status::AccessDenied);
        }
        tracing::debug!(key = %self.full_path(key), "delete key");
        let parent = self.arena.node(key).parent;
        self.unlink(key);
        // the tree membership reference
        self.release(key);
        if let Some(parent) = parent {
            self.touch_key(parent, CHANGE_NAME);
        }
        Ok(())
    }

    // =========================================================================
    // Enumeration
    // =========================================================================

    /// Reconstruct the fully-qualified `\REGISTRY\...` path of a key.
    pub fn full_path(&self, key: KeyId) -> WString {
        let mut segments = Vec::new();
        let mut current = key;
        while current != self.root {
            let node = self.arena.node(current);
            segments.push(node.name.clone());
            match node.parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        let mut path = Vec::new();
        path.push(BACKSLASH);
        path.extend_from_slice(&ROOT_NAME);
        for segment in segments.iter().rev() {
            path.push(BACKSLASH);
            path.extend_from_slice(segment.as_units());
        }
        WString::from(path)
    }

    /// Query a key (`index` = `None`) or its `index`-th child.
    pub fn enum_key(
        &self,
        key: KeyId,
        index: Option<u32>,
        info_class: KeyInfoClass,
    ) -> OpResult<EnumKeyInfo> {
        let key = match index {
            None => key,
            Some(i) => {
                let children = &self.arena.node(key).children;
                match children.get(i as usize) {
                    Some(&child) => child,
                    None => return Err(Status::NoMoreEntries),
                }
            }
        };
        let node = self.arena.node(key);
        let mut info = EnumKeyInfo {
            subkeys: node.children.len() as u32,
            values: node.values.len() as u32,
            modif: node.modif,
            ..EnumKeyInfo::default()
        };
        match info_class {
            KeyInfoClass::Basic => {
                info.name = Some(node.name.clone());
            }
            KeyInfoClass::Node => {
                info.name = Some(node.name.clone());
                info.class = node.class.clone();
            }
            KeyInfoClass::Full | KeyInfoClass::Cached => {
                for &child in &node.children {
                    let child_node = self.arena.node(child);
                    info.max_subkey = info.max_subkey.max(child_node.name.len() as u32);
                    let class_len = child_node.class.as_ref().map_or(0, WString::len);
                    info.max_class = info.max_class.max(class_len as u32);
                }
                for value in &node.values {
                    info.max_value = info.max_value.max(value.name.len() as u32);
                    info.max_data = info.max_data.max(value.data.len() as u32);
                }
                if info_class == KeyInfoClass::Cached {
                    info.name = Some(node.name.clone());
                }
            }
            KeyInfoClass::Name => {
                info.name = Some(self.full_path(key));
            }
        }
        Ok(info)
    }

    // =========================================================================
    // Values
    // =========================================================================

    /// Set a value. Setting an identical `(type, data)` pair is a no-op that
    /// leaves the dirty state untouched.
    pub fn set_value(
        &mut self,
        key: KeyId,
        name: &[u16],
        vtype: ValueType,
        data: &[u8],
    ) -> OpResult<()> {
        let node = self.arena.node(key);
        let found = node.find_value(name);
        if let Ok(index) = found {
            let value = &node.values[index];
            if value.vtype == vtype && value.data == data {
                tracing::debug!(key = %self.full_path(key), "skip setting identical value");
                return Ok(());
            }
        }
        if node.flags.contains(KeyFlags::SYMLINK)
            && (vtype != ValueType::LINK || !eq_ci(name, &SYMLINK_VALUE))
        {
            return Err(Status::AccessDenied);
        }
        if name.len() > MAX_VALUE_NAME_LEN {
            return Err(Status::NameTooLong);
        }

        let node = self.arena.node_mut(key);
        match found {
            Ok(index) => {
                node.values[index].vtype = vtype;
                node.values[index].data = data.to_vec();
            }
            Err(index) => {
                node.insert_value(
                    index,
                    KeyValue {
                        name: WString::from_units(name),
                        vtype,
                        data: data.to_vec(),
                    },
                );
            }
        }
        self.touch_key(key, CHANGE_LAST_SET);
        Ok(())
    }

    /// Read a value: its type, full byte length, and at most `max_data`
    /// payload bytes.
    pub fn get_value(
        &self,
        key: KeyId,
        name: &[u16],
        max_data: usize,
    ) -> OpResult<(ValueType, u32, Vec<u8>)> {
        let node = self.arena.node(key);
        match node.find_value(name) {
            Ok(index) => {
                let value = &node.values[index];
                let clipped = value.data.len().min(max_data);
                Ok((
                    value.vtype,
                    value.data.len() as u32,
                    value.data[..clipped].to_vec(),
                ))
            }
            Err(_) => Err(Status::ObjectNameNotFound),
        }
    }

    /// Enumerate the `index`-th value of a key.
    pub fn enum_value(
        &self,
        key: KeyId,
        index: u32,
        info_class: ValueInfoClass,
        max_data: usize,
    ) -> OpResult<ValueInfo> {
        let node = self.arena.node(key);
        let Some(value) = node.values.get(index as usize) else {
            return Err(Status::NoMoreEntries);
        };
        let name_bytes = (value.name.len() * 2) as u32;
        let data_bytes = value.data.len() as u32;
        let mut info = ValueInfo {
            vtype: value.vtype,
            ..ValueInfo::default()
        };
        match info_class {
            ValueInfoClass::Basic => {
                info.total = name_bytes;
                info.name = Some(value.name.clone());
            }
            ValueInfoClass::Full => {
                info.total = name_bytes + data_bytes;
                info.name = Some(value.name.clone());
                let clipped = value.data.len().min(max_data);
                info.data = value.data[..clipped].to_vec();
            }
            ValueInfoClass::Partial => {
                info.total = data_bytes;
                let clipped = value.data.len().min(max_data);
                info.data = value.data[..clipped].to_vec();
            }
        }
        Ok(info)
    }

    /// Delete a value.
    pub fn delete_value(&mut self, key: KeyId, name: &[u16]) -> OpResult<()> {
        let node = self.arena.node_mut(key);
        match node.find_value(name) {
            Ok(index) => {
                node.remove_value(index);
                self.touch_key(key, CHANGE_LAST_SET);
                Ok(())
            }
            Err(_) => Err(Status::ObjectNameNotFound),
        }
    }

    // =========================================================================
    // Dirty marking and notifications
    // =========================================================================

    /// Mark a key and all its ancestors dirty. Stops early at an already
    /// dirty or volatile key.
    pub fn make_dirty(&mut self, key: KeyId) {
        let mut current = Some(key);
        while let Some(id) = current {
            let node = self.arena.node_mut(id);
            if node
                .flags
                .intersects(KeyFlags::DIRTY | KeyFlags::VOLATILE)
            {
                return;
            }
            node.flags |= KeyFlags::DIRTY;
            current = node.parent;
        }
    }

    /// Mark a key and its whole subtree clean after a successful save.
    pub fn make_clean(&mut self, key: KeyId) {
        let node = self.arena.node_mut(key);
        if node.flags.contains(KeyFlags::VOLATILE) || !node.flags.contains(KeyFlags::DIRTY) {
            return;
        }
        node.flags -= KeyFlags::DIRTY;
        let children = node.children.clone();
        for child in children {
            self.make_clean(child);
        }
    }

    /// Fire the subscriptions on `key` that match `change`. Direct changes
    /// (`not_subtree`) match every subscription; bubbled ones match only
    /// subtree subscriptions.
    fn check_notify(&mut self, key: KeyId, change: u32, not_subtree: bool) {
        for notify in &mut self.arena.node_mut(key).notify {
            if (not_subtree || notify.subtree) && change & notify.filter != 0 {
                notify.fire();
            }
        }
    }

    /// Record a mutation: stamp the modification time, mark the dirty chain,
    /// and run the notification walk. Value changes do not bubble past the
    /// key they happened on.
    pub fn touch_key(&mut self, key: KeyId, change: u32) {
        self.arena.node_mut(key).modif = clock::now();
        self.report_change(key, change);
    }

    /// The dirty-marking and notification half of a touch, without the
    /// timestamp.
    fn report_change(&mut self, key: KeyId, change: u32) {
        self.make_dirty(key);
        self.check_notify(key, change, true);
        let mut current = self.arena.node(key).parent;
        while let Some(id) = current {
            self.check_notify(id, change & !CHANGE_LAST_SET, false);
            current = self.arena.node(id).parent;
        }
    }

    /// Arm a subscription. An existing record for the same (session, handle)
    /// pair swaps its event in place instead of duplicating.
    pub fn arm_notify(
        &mut self,
        key: KeyId,
        session: SessionId,
        hkey: HandleId,
        filter: u32,
        subtree: bool,
        event: Arc<NotifyEvent>,
    ) {
        let node = self.arena.node_mut(key);
        match node
            .notify
            .iter_mut()
            .find(|n| n.session == session && n.hkey == hkey)
        {
            Some(existing) => {
                existing.event = Some(event);
            }
            None => node.notify.push(Notification {
                session,
                hkey,
                filter,
                subtree,
                event: Some(event),
            }),
        }
    }

    /// Remove the subscription identified by (session, handle), signaling it
    /// if still armed. Called when the owning handle closes.
    pub fn close_notify(&mut self, key: KeyId, session: SessionId, hkey: HandleId) {
        let node = self.arena.node_mut(key);
        if let Some(index) = node
            .notify
            .iter()
            .position(|n| n.session == session && n.hkey == hkey)
        {
            node.notify[index].fire();
            node.notify.remove(index);
        }
    }
}
