//! Client sessions and handle tables
//!
//! The engine does not trust clients with key ids; every request names its
//! keys through per-session handles. A session also carries the identity the
//! transport vouched for: the client's pointer width (driving WoW64
//! redirection) and the privileges it holds for the load/unload/save
//! commands.

use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::access;
use crate::config::Arch;
use crate::error::{OpResult, Status};
use crate::notify::NotifyEvent;
use crate::tree::KeyId;

/// Identifies a session for the lifetime of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// A handle valid within one session. Zero is never a valid handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u32);

bitflags! {
    /// Privileges a session may hold.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Privileges: u32 {
        /// Required by save_registry.
        const BACKUP  = 0x1;
        /// Required by load_registry and unload_registry.
        const RESTORE = 0x2;
    }
}

/// Identity a transport declares when attaching a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Client pointer width; 32-bit clients on a 64-bit prefix get the WoW64
    /// view.
    pub arch: Arch,
    /// Raw privilege bits, validated against [`Privileges`].
    pub privileges: u32,
}

/// An entry in a session's handle table.
#[derive(Debug, Clone)]
pub enum HandleObject {
    Key {
        key: KeyId,
        /// Effective access mask granted at open/create time.
        access: u32,
    },
    Event(Arc<NotifyEvent>),
}

/// One connected client: its identity plus its handle table. Handle slots
/// are recycled, lowest free slot first.
pub struct Session {
    pub id: SessionId,
    pub arch: Arch,
    pub privileges: Privileges,
    entries: Vec<Option<HandleObject>>,
    free: Vec<u32>,
}

impl Session {
    pub fn new(id: SessionId, info: SessionInfo) -> Self {
        Session {
            id,
            arch: info.arch,
            privileges: Privileges::from_bits_truncate(info.privileges),
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Store an object and hand out its handle.
    pub fn alloc(&mut self, object: HandleObject) -> HandleId {
        match self.free.pop() {
            Some(index) => {
                self.entries[index as usize] = Some(object);
                HandleId(index + 1)
            }
            None => {
                self.entries.push(Some(object));
                HandleId(self.entries.len() as u32)
            }
        }
    }

    pub fn get(&self, handle: HandleId) -> Option<&HandleObject> {
        if handle.0 == 0 {
            return None;
        }
        self.entries.get(handle.0 as usize - 1)?.as_ref()
    }

    /// Resolve a key handle, verifying the granted mask covers
    /// `required_access`.
    pub fn get_key(&self, handle: HandleId, required_access: u32) -> OpResult<KeyId> {
        match self.get(handle) {
            Some(&HandleObject::Key { key, access }) => {
                if access & required_access != required_access {
                    return Err(Status::AccessDenied);
                }
                Ok(key)
            }
            _ => Err(Status::InvalidHandle),
        }
    }

    /// Resolve an event handle.
    pub fn get_event(&self, handle: HandleId) -> OpResult<Arc<NotifyEvent>> {
        match self.get(handle) {
            Some(HandleObject::Event(event)) => Ok(event.clone()),
            _ => Err(Status::InvalidHandle),
        }
    }

    /// Remove an entry; the caller drops references and notifications.
    pub fn close(&mut self, handle: HandleId) -> Option<HandleObject> {
        if handle.0 == 0 {
            return None;
        }
        let index = handle.0 as usize - 1;
        let object = self.entries.get_mut(index)?.take()?;
        self.free.push(handle.0 - 1);
        Some(object)
    }

    /// All live handles, for session teardown.
    pub fn drain(&mut self) -> Vec<(HandleId, HandleObject)> {
        self.free.clear();
        self.entries
            .drain(..)
            .enumerate()
            .filter_map(|(i, entry)| entry.map(|obj| (HandleId(i as u32 + 1), obj)))
            .collect()
    }

    /// Grant a session access to a key, applying the generic-rights mapping.
    pub fn open_key_handle(&mut self, key: KeyId, requested_access: u32) -> HandleId {
        self.alloc(HandleObject::Key {
            key,
            access: access::map_access(requested_access),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{KEY_READ, KEY_SET_VALUE};

    fn session() -> Session {
        Session::new(
            SessionId(1),
            SessionInfo {
                arch: Arch::Win64,
                privileges: 0,
            },
        )
    }

    #[test]
    fn test_handles_start_at_one() {
        let mut s = session();
        let h = s.alloc(HandleObject::Event(NotifyEvent::new()));
        assert_eq!(h, HandleId(1));
        assert!(s.get(HandleId(0)).is_none());
    }

    #[test]
    fn test_access_check() {
        let mut s = session();
        let key = KeyId::default();
        let h = s.open_key_handle(key, KEY_READ);
        assert!(s.get_key(h, KEY_READ).is_ok());
        assert_eq!(s.get_key(h, KEY_SET_VALUE), Err(Status::AccessDenied));
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut s = session();
        let h = s.open_key_handle(KeyId::default(), KEY_READ);
        s.close(h);
        assert_eq!(s.get_key(h, 0), Err(Status::InvalidHandle));
    }

    #[test]
    fn test_slot_reuse() {
        let mut s = session();
        let h1 = s.alloc(HandleObject::Event(NotifyEvent::new()));
        s.close(h1);
        let h2 = s.alloc(HandleObject::Event(NotifyEvent::new()));
        assert_eq!(h1, h2);
    }
}
