//! Engine Module
//!
//! The engine is the process-wide singleton: it owns the tree, the save
//! branches, the prefix architecture, and the client sessions, and it runs
//! single-threaded. Transport threads decode frames and funnel every request
//! through one channel; the engine executes each command to completion
//! before the next, and the periodic save shares the same loop, so no part
//! of the tree ever needs a lock.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};

use crossbeam::channel::{tick, Receiver, Sender};

use crate::access::{KEY_ENUMERATE_SUB_KEYS, KEY_NOTIFY, KEY_QUERY_VALUE, KEY_SET_VALUE,
    KEY_WOW64_32KEY, KEY_WOW64_64KEY, DELETE};
use crate::clock;
use crate::config::{Arch, Config};
use crate::error::{HiveError, OpResult, Result, Status};
use crate::notify::NotifyEvent;
use crate::persist::{load_keys, save_all_subkeys, save_branch, SaveBranch};
use crate::protocol::{command, Command, Reply, ReplyBody};
use crate::session::{HandleId, HandleObject, Privileges, Session, SessionId, SessionInfo};
use crate::tree::{
    Attributes, CreateOptions, KeyFlags, KeyId, KeyInfoClass, PathCursor, Registry,
    ValueInfoClass, ValueType, WString, WOW6432NODE,
};

/// WoW64 mirror wiring under `Machine\Software\Classes` on 64-bit prefixes.
const CLASSES_WOW_ROOTS: &[&str] = &[
    "CLSID",
    "DirectShow",
    "Interface",
    "Media Type",
    "MediaFoundation",
];

/// A request posted to the engine thread.
pub enum EngineRequest {
    Attach {
        info: SessionInfo,
        reply: Sender<SessionId>,
    },
    Execute {
        session: SessionId,
        command: Command,
        reply: Sender<Reply>,
    },
    Detach {
        session: SessionId,
    },
    Shutdown,
}

/// The configuration-tree engine
pub struct Engine {
    config: Config,
    registry: Registry,
    branches: Vec<SaveBranch>,
    prefix: Option<Arch>,
    sessions: HashMap<u64, Session>,
    next_session_id: u64,
}

impl Engine {
    /// Open an engine: create the root, load the initial branch files,
    /// wire the WoW64 mirrors, and register the save branches.
    ///
    /// Missing branch files are tolerated; the prefix architecture then
    /// comes from the configuration, the `WINEARCH` environment variable,
    /// or the host pointer width, in that order.
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.config_dir)?;

        let forced = config.arch.or_else(|| {
            match std::env::var("WINEARCH") {
                Ok(v) if v == "win32" => Some(Arch::Win32),
                _ => None,
            }
        });

        let mut engine = Engine {
            config,
            registry: Registry::new(),
            branches: Vec::new(),
            prefix: forced,
            sessions: HashMap::new(),
            next_session_id: 1,
        };

        let root = engine.registry.root();
        let now = clock::now();

        let hklm = engine
            .registry
            .create_key_recursive(root, WString::from("Machine").as_units(), now)
            .map_err(HiveError::from)?;
        let system_present = engine.load_branch_file("system.reg", hklm)?;
        if engine.prefix.is_none() {
            engine.prefix = Some(if system_present {
                Arch::Win32
            } else {
                Arch::native()
            });
        }
        engine.add_branch(hklm, "system.reg");

        let default_user = engine
            .registry
            .create_key_recursive(root, WString::from("User\\.Default").as_units(), now)
            .map_err(HiveError::from)?;
        engine.load_branch_file("userdef.reg", default_user)?;
        engine.add_branch(default_user, "userdef.reg");

        let user_path = format!("User\\{}", engine.config.user_sid);
        let hkcu = engine
            .registry
            .create_key_recursive(root, WString::from(user_path.as_str()).as_units(), now)
            .map_err(HiveError::from)?;
        engine.load_branch_file("user.reg", hkcu)?;
        engine.add_branch(hkcu, "user.reg");

        if engine.prefix == Some(Arch::Win64) {
            engine.wire_wow64(hklm).map_err(HiveError::from)?;
        }

        tracing::info!(
            config_dir = %engine.config.config_dir.display(),
            prefix = ?engine.prefix,
            "engine initialized"
        );
        Ok(engine)
    }

    /// Load one initial branch file; reports whether the file existed.
    /// A rejected file (bad header or architecture) is logged and treated
    /// as present-but-empty.
    fn load_branch_file(&mut self, name: &str, key: KeyId) -> Result<bool> {
        let path = self.config.config_dir.join(name);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let reader = BufReader::new(file);
        if let Err(status) = load_keys(
            &mut self.registry,
            key,
            reader,
            name,
            Some(0),
            &mut self.prefix,
        ) {
            tracing::error!(file = name, %status, "not a valid registry file");
        }
        Ok(true)
    }

    /// Register a (key, file) pair as a persistence unit. The branch holds a
    /// reference to its key for the lifetime of the engine.
    fn add_branch(&mut self, key: KeyId, file: &str) {
        self.registry.grab(key);
        self.branches.push(SaveBranch {
            key,
            path: self.config.config_dir.join(file),
        });
    }

    /// On a 64-bit prefix, split `Software` into 64- and 32-bit views and
    /// mark the shared `Classes` subspace.
    fn wire_wow64(&mut self, hklm: KeyId) -> OpResult<()> {
        let now = clock::now();
        let software =
            self.registry
                .create_key_recursive(hklm, WString::from("Software").as_units(), now)?;
        let classes = self
            .registry
            .create_key_recursive(software, WString::from("Classes").as_units(), now)?;
        let classes_wow = self
            .registry
            .create_key_recursive(classes, &WOW6432NODE, now)?;

        self.registry.node_mut(software).flags |= KeyFlags::WOW64;
        self.registry.create_key_recursive(software, &WOW6432NODE, now)?;
        self.registry.node_mut(classes).flags |= KeyFlags::WOWSHARE;

        for name in CLASSES_WOW_ROOTS {
            let units = WString::from(*name);
            let key = self
                .registry
                .create_key_recursive(classes, units.as_units(), now)?;
            self.registry.node_mut(key).flags |= KeyFlags::WOW64;
            self.registry
                .create_key_recursive(classes_wow, units.as_units(), now)?;
        }
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn prefix(&self) -> Option<Arch> {
        self.prefix
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Attach a client session with the identity the transport vouches for.
    pub fn attach_session(&mut self, info: SessionInfo) -> SessionId {
        let id = SessionId(self.next_session_id);
        self.next_session_id += 1;
        self.sessions.insert(id.0, Session::new(id, info));
        tracing::debug!(session = id.0, arch = ?info.arch, "session attached");
        id
    }

    /// Detach a session, closing every handle it still holds.
    pub fn detach_session(&mut self, id: SessionId) {
        let Some(mut session) = self.sessions.remove(&id.0) else {
            return;
        };
        for (handle, object) in session.drain() {
            self.drop_handle(&session, handle, object);
        }
        tracing::debug!(session = id.0, "session detached");
    }

    fn drop_handle(&mut self, session: &Session, handle: HandleId, object: HandleObject) {
        match object {
            HandleObject::Key { key, .. } => {
                self.registry.close_notify(key, session.id, handle);
                self.registry.release(key);
            }
            HandleObject::Event(_) => {}
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Execute one command on behalf of a session.
    pub fn execute(&mut self, session: SessionId, command: Command) -> Reply {
        let Some(mut sess) = self.sessions.remove(&session.0) else {
            return Reply::err(Status::InvalidHandle);
        };
        let reply = match self.dispatch(&mut sess, command) {
            Ok(reply) => reply,
            Err(status) => Reply::err(status),
        };
        self.sessions.insert(session.0, sess);
        reply
    }

    fn dispatch(&mut self, sess: &mut Session, command: Command) -> OpResult<Reply> {
        match command {
            Command::CreateKey {
                parent,
                path,
                class,
                options,
                access,
                attributes,
                sd,
            } => self.create_key(sess, parent, &path, class, options, access, attributes, sd),
            Command::OpenKey {
                parent,
                path,
                access,
                attributes,
            } => self.open_key(sess, parent, &path, access, attributes),
            Command::DeleteKey { hkey } => {
                let key = self.get_hkey(sess, hkey, DELETE)?;
                self.registry.delete_key(key, false)?;
                Ok(Reply::none())
            }
            Command::FlushKey { hkey } => {
                // reserved: validates the handle, forces nothing
                self.get_hkey(sess, hkey, 0)?;
                Ok(Reply::none())
            }
            Command::EnumKey {
                hkey,
                index,
                info_class,
            } => {
                let required = if index.is_none() {
                    KEY_QUERY_VALUE
                } else {
                    KEY_ENUMERATE_SUB_KEYS
                };
                let key = self.get_hkey(sess, hkey, required)?;
                let info = self
                    .registry
                    .enum_key(key, index, key_info_class(info_class)?)?;
                Ok(Reply::ok(ReplyBody::KeyInfo(info)))
            }
            Command::SetKeyValue {
                hkey,
                name,
                vtype,
                data,
            } => {
                let key = self.get_hkey(sess, hkey, KEY_SET_VALUE)?;
                self.registry.set_value(key, name.as_units(), vtype, &data)?;
                Ok(Reply::none())
            }
            Command::GetKeyValue {
                hkey,
                name,
                max_data,
            } => {
                let key = self.get_hkey(sess, hkey, KEY_QUERY_VALUE)?;
                match self
                    .registry
                    .get_value(key, name.as_units(), max_data as usize)
                {
                    Ok((vtype, total, data)) => {
                        Ok(Reply::ok(ReplyBody::ValueData { vtype, total, data }))
                    }
                    Err(Status::ObjectNameNotFound) => Ok(Reply {
                        status: Some(Status::ObjectNameNotFound),
                        body: ReplyBody::ValueData {
                            vtype: ValueType::INVALID,
                            total: 0,
                            data: Vec::new(),
                        },
                    }),
                    Err(status) => Err(status),
                }
            }
            Command::EnumKeyValue {
                hkey,
                index,
                info_class,
                max_data,
            } => {
                let key = self.get_hkey(sess, hkey, KEY_QUERY_VALUE)?;
                let info = self.registry.enum_value(
                    key,
                    index,
                    value_info_class(info_class)?,
                    max_data as usize,
                )?;
                Ok(Reply::ok(ReplyBody::ValueInfo(info)))
            }
            Command::DeleteKeyValue { hkey, name } => {
                let key = self.get_hkey(sess, hkey, KEY_SET_VALUE)?;
                self.registry.delete_value(key, name.as_units())?;
                Ok(Reply::none())
            }
            Command::LoadRegistry { parent, path, file } => {
                self.load_registry(sess, parent, &path, &file)
            }
            Command::UnloadRegistry { hkey } => {
                if !sess.privileges.contains(Privileges::RESTORE) {
                    return Err(Status::PrivilegeNotHeld);
                }
                let key = self.get_hkey(sess, hkey, 0)?;
                self.registry.delete_key(key, true)?;
                Ok(Reply::none())
            }
            Command::SaveRegistry { hkey, file } => {
                if !sess.privileges.contains(Privileges::BACKUP) {
                    return Err(Status::PrivilegeNotHeld);
                }
                let key = self.get_hkey(sess, hkey, 0)?;
                let out = File::create(&file).map_err(|err| {
                    tracing::warn!(%err, file = %file, "save_registry failed to create file");
                    Status::AccessDenied
                })?;
                let mut writer = BufWriter::new(out);
                save_all_subkeys(&self.registry, key, self.prefix, &mut writer)
                    .and_then(|()| writer.flush())
                    .map_err(|_| Status::AccessDenied)?;
                Ok(Reply::none())
            }
            Command::SetNotification {
                hkey,
                event,
                subtree,
                filter,
            } => {
                let key = self.get_hkey(sess, hkey, KEY_NOTIFY)?;
                let event = sess.get_event(event)?;
                self.registry
                    .arm_notify(key, sess.id, hkey, filter, subtree, event.clone());
                event.reset();
                Ok(Reply {
                    status: Some(Status::Pending),
                    body: ReplyBody::None,
                })
            }
            Command::CreateEvent => {
                let handle = sess.alloc(HandleObject::Event(NotifyEvent::new()));
                Ok(Reply::ok(ReplyBody::Event { handle }))
            }
            Command::PollEvent { event } => {
                let event = sess.get_event(event)?;
                Ok(Reply::ok(ReplyBody::EventState {
                    signaled: event.is_signaled(),
                }))
            }
            Command::CloseHandle { handle } => {
                let object = sess.close(handle).ok_or(Status::InvalidHandle)?;
                self.drop_handle(sess, handle, object);
                Ok(Reply::none())
            }
            Command::Ping => Ok(Reply::ok(ReplyBody::Pong)),
        }
    }

    /// Resolve a key handle, rejecting tombstoned keys.
    fn get_hkey(&self, sess: &Session, handle: HandleId, access: u32) -> OpResult<KeyId> {
        let key = sess.get_key(handle, access)?;
        if self.registry.node(key).is_deleted() {
            return Err(Status::KeyDeleted);
        }
        Ok(key)
    }

    /// Derive the lookup attributes of a request: the client's explicit
    /// attribute bits, plus WoW64 steering for 32-bit clients on a 64-bit
    /// prefix unless the request pins the 64-bit view.
    fn request_attributes(&self, sess: &Session, access: u32, attributes: u32) -> Attributes {
        let mut attr = Attributes::empty();
        if attributes & command::ATTR_OPEN_LINK != 0 {
            attr |= Attributes::OPEN_LINK;
        }
        if self.prefix == Some(Arch::Win64)
            && sess.arch == Arch::Win32
            && access & KEY_WOW64_64KEY == 0
        {
            attr |= Attributes::WOW64;
        }
        attr
    }

    /// Resolve the (start key, relative path) of a request. A missing parent
    /// handle makes it a rooted request: the path must spell `\REGISTRY\...`.
    /// An explicit 32-bit view rewrites the parent to its WoW64 variant.
    fn resolve_start<'a>(
        &self,
        sess: &Session,
        parent: Option<HandleId>,
        path: &'a WString,
        access: u32,
    ) -> OpResult<(KeyId, &'a [u16])> {
        match parent {
            Some(handle) => {
                // no access rights are required on the parent handle
                let mut key = self.get_hkey(sess, handle, 0)?;
                if access & KEY_WOW64_32KEY != 0 {
                    let first = PathCursor::new(path.as_units())
                        .ok()
                        .and_then(|mut c| c.next_token());
                    key = self.registry.wow64_variant(key, first);
                }
                Ok((key, path.as_units()))
            }
            None => {
                let rest = self.registry.strip_root(path.as_units())?;
                Ok((self.registry.root(), rest))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_key(
        &mut self,
        sess: &mut Session,
        parent: Option<HandleId>,
        path: &WString,
        class: Option<WString>,
        options: CreateOptions,
        access: u32,
        attributes: u32,
        sd: Option<crate::access::SecurityDescriptor>,
    ) -> OpResult<Reply> {
        if parent.is_none() && path.is_empty() {
            return Err(Status::ObjectPathSyntaxBad);
        }
        let attr = self.request_attributes(sess, access, attributes);
        let (start, rel_path) = self.resolve_start(sess, parent, path, access)?;
        let (key, created) = self.registry.create_key(
            start,
            rel_path,
            class,
            options,
            attr,
            sd.map(std::sync::Arc::new),
            clock::now(),
        )?;
        self.registry.grab(key);
        let hkey = sess.open_key_handle(key, access);
        tracing::debug!(key = %self.registry.full_path(key), created, "create key");
        Ok(Reply::ok(ReplyBody::Created { hkey, created }))
    }

    fn open_key(
        &mut self,
        sess: &mut Session,
        parent: Option<HandleId>,
        path: &WString,
        access: u32,
        attributes: u32,
    ) -> OpResult<Reply> {
        if path.len() > crate::tree::MAX_PATH_LEN {
            return Err(Status::ObjectNameInvalid);
        }
        let attr = self.request_attributes(sess, access, attributes);
        let (start, rel_path) = self.resolve_start(sess, parent, path, access)?;
        let key = self.registry.open_key(start, rel_path, attr)?;
        self.registry.grab(key);
        let hkey = sess.open_key_handle(key, access);
        tracing::debug!(key = %self.registry.full_path(key), "open key");
        Ok(Reply::ok(ReplyBody::Opened { hkey }))
    }

    fn load_registry(
        &mut self,
        sess: &mut Session,
        parent: Option<HandleId>,
        path: &WString,
        file: &str,
    ) -> OpResult<Reply> {
        if !sess.privileges.contains(Privileges::RESTORE) {
            return Err(Status::PrivilegeNotHeld);
        }
        // the branch key is always created in the 64-bit view
        let (start, rel_path) = self.resolve_start(sess, parent, path, KEY_WOW64_64KEY)?;
        let (key, _) = self.registry.create_key(
            start,
            rel_path,
            None,
            CreateOptions::default(),
            Attributes::empty(),
            None,
            clock::now(),
        )?;
        let reader = match File::open(file) {
            Ok(f) => BufReader::new(f),
            Err(err) => {
                tracing::warn!(%err, file, "load_registry failed to open file");
                return Err(Status::ObjectNameNotFound);
            }
        };
        load_keys(&mut self.registry, key, reader, file, None, &mut self.prefix)?;
        Ok(Reply::none())
    }

    // =========================================================================
    // Saving and teardown
    // =========================================================================

    /// Persist every dirty save branch. Runs on the periodic tick and on
    /// shutdown; errors are logged per branch and do not stop the sweep.
    pub fn save_dirty_branches(&mut self) {
        let branches = self.branches.clone();
        for branch in branches {
            if let Err(err) = save_branch(&mut self.registry, branch.key, &branch.path, self.prefix)
            {
                tracing::error!(path = %branch.path.display(), %err, "could not save branch");
            }
        }
    }

    /// Flush all branches and tear the tree down.
    pub fn shutdown(mut self) {
        self.save_dirty_branches();
        let ids: Vec<SessionId> = self.sessions.values().map(|s| s.id).collect();
        for id in ids {
            self.detach_session(id);
        }
        for branch in std::mem::take(&mut self.branches) {
            self.registry.release(branch.key);
        }
        let root = self.registry.root();
        if let Err(status) = self.registry.delete_key(root, true) {
            tracing::error!(%status, "failed to delete registry root");
        }
        tracing::info!("engine shut down");
    }

    /// Single-threaded request loop: commands and the periodic save tick are
    /// multiplexed onto this one thread.
    pub fn run(mut self, requests: Receiver<EngineRequest>) {
        let save_tick = tick(self.config.save_interval);
        loop {
            crossbeam::select! {
                recv(requests) -> request => match request {
                    Ok(EngineRequest::Attach { info, reply }) => {
                        let id = self.attach_session(info);
                        let _ = reply.send(id);
                    }
                    Ok(EngineRequest::Execute { session, command, reply }) => {
                        let _ = reply.send(self.execute(session, command));
                    }
                    Ok(EngineRequest::Detach { session }) => self.detach_session(session),
                    Ok(EngineRequest::Shutdown) | Err(_) => break,
                },
                recv(save_tick) -> _ => self.save_dirty_branches(),
            }
        }
        self.shutdown();
    }
}

fn key_info_class(raw: u32) -> OpResult<KeyInfoClass> {
    match raw {
        command::KEY_BASIC_INFORMATION => Ok(KeyInfoClass::Basic),
        command::KEY_NODE_INFORMATION => Ok(KeyInfoClass::Node),
        command::KEY_FULL_INFORMATION => Ok(KeyInfoClass::Full),
        command::KEY_NAME_INFORMATION => Ok(KeyInfoClass::Name),
        command::KEY_CACHED_INFORMATION => Ok(KeyInfoClass::Cached),
        _ => Err(Status::InvalidParameter),
    }
}

fn value_info_class(raw: u32) -> OpResult<ValueInfoClass> {
    match raw {
        command::KEY_VALUE_BASIC_INFORMATION => Ok(ValueInfoClass::Basic),
        command::KEY_VALUE_FULL_INFORMATION => Ok(ValueInfoClass::Full),
        command::KEY_VALUE_PARTIAL_INFORMATION => Ok(ValueInfoClass::Partial),
        _ => Err(Status::InvalidParameter),
    }
}
