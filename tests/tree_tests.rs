//! Tree Tests
//!
//! Structural operations on the key tree: create/open/delete, ordering,
//! symlinks, WoW64 steering, volatile containment, and the boundary limits.

use keyhive::error::Status;
use keyhive::tree::{
    Attributes, CreateOptions, KeyFlags, KeyId, KeyInfoClass, Registry, ValueType,
    MAX_NAME_LEN, MAX_PATH_LEN, MAX_VALUE_NAME_LEN, SYMLINK_VALUE,
};

fn w(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

fn utf16z_bytes(s: &str) -> Vec<u8> {
    let mut units: Vec<u16> = s.encode_utf16().collect();
    units.push(0);
    units.iter().flat_map(|u| u.to_le_bytes()).collect()
}

fn utf16_bytes(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn create(registry: &mut Registry, path: &str, options: CreateOptions) -> Result<(KeyId, bool), Status> {
    let root = registry.root();
    registry.create_key(
        root,
        &w(path),
        None,
        options,
        Attributes::empty(),
        None,
        1,
    )
}

fn open(registry: &Registry, path: &str) -> Result<KeyId, Status> {
    registry.open_key(registry.root(), &w(path), Attributes::empty())
}

// =============================================================================
// Create / open
// =============================================================================

#[test]
fn test_create_then_open() {
    let mut registry = Registry::new();
    let (key, created) = create(&mut registry, "Machine\\Software\\Acme", CreateOptions::default()).unwrap();
    assert!(created);
    let (again, created) = create(&mut registry, "Machine\\Software\\Acme", CreateOptions::default()).unwrap();
    assert!(!created);
    assert_eq!(key, again);
    assert_eq!(open(&registry, "Machine\\Software\\Acme").unwrap(), key);
}

#[test]
fn test_open_is_case_insensitive() {
    let mut registry = Registry::new();
    let (key, _) = create(&mut registry, "Machine\\Software", CreateOptions::default()).unwrap();
    assert_eq!(open(&registry, "MACHINE\\software").unwrap(), key);
    // the stored name preserves the creation case
    assert_eq!(registry.node(key).name.to_string_lossy(), "Software");
}

#[test]
fn test_open_missing_key() {
    let registry = Registry::new();
    assert_eq!(open(&registry, "Nothing"), Err(Status::ObjectNameNotFound));
}

#[test]
fn test_miss_on_intermediate_segment() {
    let mut registry = Registry::new();
    create(&mut registry, "A", CreateOptions::default()).unwrap();
    assert_eq!(open(&registry, "A\\B\\C"), Err(Status::ObjectNameNotFound));
}

#[test]
fn test_leading_backslash_rejected() {
    let registry = Registry::new();
    assert_eq!(open(&registry, "\\A"), Err(Status::ObjectPathInvalid));
}

#[test]
fn test_separator_runs_collapse() {
    let mut registry = Registry::new();
    let (key, _) = create(&mut registry, "A\\B", CreateOptions::default()).unwrap();
    assert_eq!(open(&registry, "A\\\\\\B").unwrap(), key);
}

#[test]
fn test_empty_path_opens_start() {
    let registry = Registry::new();
    assert_eq!(open(&registry, "").unwrap(), registry.root());
}

#[test]
fn test_children_stay_sorted_and_unique() {
    let mut registry = Registry::new();
    for name in ["zeta", "Alpha", "beta", "ALPHA", "Beta"] {
        create(&mut registry, name, CreateOptions::default()).unwrap();
    }
    let root = registry.root();
    let names: Vec<String> = registry
        .node(root)
        .children
        .iter()
        .map(|&c| registry.node(c).name.to_string_lossy().to_lowercase())
        .collect();
    assert_eq!(names, vec!["alpha", "beta", "zeta"]);
    let mut sorted = names.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(names, sorted);
}

// =============================================================================
// Boundaries
// =============================================================================

#[test]
fn test_segment_length_boundary() {
    let mut registry = Registry::new();
    let just_fits = "a".repeat(MAX_NAME_LEN);
    assert!(create(&mut registry, &just_fits, CreateOptions::default()).is_ok());
    let too_long = "a".repeat(MAX_NAME_LEN + 1);
    assert_eq!(
        create(&mut registry, &too_long, CreateOptions::default()),
        Err(Status::InvalidParameter)
    );
}

#[test]
fn test_path_length_boundary() {
    let registry = Registry::new();
    let too_long = vec![u16::from(b'a'); MAX_PATH_LEN + 1];
    assert_eq!(
        registry.open_key(registry.root(), &too_long, Attributes::empty()),
        Err(Status::ObjectNameInvalid)
    );
}

#[test]
fn test_value_name_length_boundary() {
    let mut registry = Registry::new();
    let (key, _) = create(&mut registry, "K", CreateOptions::default()).unwrap();
    let just_fits = vec![u16::from(b'v'); MAX_VALUE_NAME_LEN];
    assert!(registry.set_value(key, &just_fits, ValueType::SZ, b"").is_ok());
    let too_long = vec![u16::from(b'v'); MAX_VALUE_NAME_LEN + 1];
    assert_eq!(
        registry.set_value(key, &too_long, ValueType::SZ, b""),
        Err(Status::NameTooLong)
    );
}

// =============================================================================
// Delete
// =============================================================================

#[test]
fn test_delete_requires_empty_key() {
    let mut registry = Registry::new();
    create(&mut registry, "A\\B", CreateOptions::default()).unwrap();
    let a = open(&registry, "A").unwrap();
    assert_eq!(registry.delete_key(a, false), Err(Status::AccessDenied));
    assert!(registry.delete_key(a, true).is_ok());
    assert_eq!(open(&registry, "A"), Err(Status::ObjectNameNotFound));
}

#[test]
fn test_deleted_key_is_tombstoned_while_referenced() {
    let mut registry = Registry::new();
    let (key, _) = create(&mut registry, "A", CreateOptions::default()).unwrap();
    registry.grab(key); // an outstanding handle
    registry.delete_key(key, false).unwrap();
    assert!(registry.node(key).is_deleted());
    assert!(registry.node(key).parent.is_none());
    registry.release(key);
}

#[test]
fn test_delete_touches_parent() {
    let mut registry = Registry::new();
    create(&mut registry, "A\\B", CreateOptions::default()).unwrap();
    let root = registry.root();
    registry.make_clean(root);
    let a = open(&registry, "A").unwrap();
    let b = open(&registry, "A\\B").unwrap();
    registry.delete_key(b, false).unwrap();
    assert!(registry.node(a).flags.contains(KeyFlags::DIRTY));
}

// =============================================================================
// Volatile containment
// =============================================================================

#[test]
fn test_non_volatile_under_volatile_fails() {
    let mut registry = Registry::new();
    let volatile = CreateOptions { volatile: true, create_link: false };
    create(&mut registry, "V", volatile).unwrap();
    assert_eq!(
        create(&mut registry, "V\\P", CreateOptions::default()),
        Err(Status::ChildMustBeVolatile)
    );
    assert!(create(&mut registry, "V\\P", volatile).is_ok());
}

#[test]
fn test_volatile_keys_never_dirty() {
    let mut registry = Registry::new();
    let volatile = CreateOptions { volatile: true, create_link: false };
    let (v, _) = create(&mut registry, "V", volatile).unwrap();
    registry.set_value(v, &w("x"), ValueType::SZ, &utf16z_bytes("y")).unwrap();
    assert!(!registry.node(v).flags.contains(KeyFlags::DIRTY));
}

// =============================================================================
// Values
// =============================================================================

#[test]
fn test_set_get_round_trip() {
    let mut registry = Registry::new();
    let (key, _) = create(&mut registry, "K", CreateOptions::default()).unwrap();
    let payload = utf16z_bytes("Widget");
    registry.set_value(key, &w("Name"), ValueType::SZ, &payload).unwrap();
    let (vtype, total, data) = registry.get_value(key, &w("Name"), usize::MAX).unwrap();
    assert_eq!(vtype, ValueType::SZ);
    assert_eq!(total as usize, payload.len());
    assert_eq!(data, payload);
}

#[test]
fn test_get_clips_to_requested_length() {
    let mut registry = Registry::new();
    let (key, _) = create(&mut registry, "K", CreateOptions::default()).unwrap();
    registry.set_value(key, &w("Blob"), ValueType::BINARY, &[1, 2, 3, 4]).unwrap();
    let (_, total, data) = registry.get_value(key, &w("Blob"), 2).unwrap();
    assert_eq!(total, 4);
    assert_eq!(data, vec![1, 2]);
}

#[test]
fn test_get_missing_value() {
    let mut registry = Registry::new();
    let (key, _) = create(&mut registry, "K", CreateOptions::default()).unwrap();
    assert_eq!(
        registry.get_value(key, &w("nope"), usize::MAX),
        Err(Status::ObjectNameNotFound)
    );
}

#[test]
fn test_identical_set_does_not_redirty() {
    let mut registry = Registry::new();
    let (key, _) = create(&mut registry, "K", CreateOptions::default()).unwrap();
    registry.set_value(key, &w("n"), ValueType::DWORD, &42u32.to_le_bytes()).unwrap();
    let root = registry.root();
    registry.make_clean(root);
    registry.set_value(key, &w("n"), ValueType::DWORD, &42u32.to_le_bytes()).unwrap();
    assert!(!registry.node(key).flags.contains(KeyFlags::DIRTY));
    registry.set_value(key, &w("n"), ValueType::DWORD, &43u32.to_le_bytes()).unwrap();
    assert!(registry.node(key).flags.contains(KeyFlags::DIRTY));
}

#[test]
fn test_default_value_sorts_first() {
    let mut registry = Registry::new();
    let (key, _) = create(&mut registry, "K", CreateOptions::default()).unwrap();
    registry.set_value(key, &w("alpha"), ValueType::SZ, b"").unwrap();
    registry.set_value(key, &[], ValueType::SZ, b"").unwrap();
    assert!(registry.node(key).values[0].name.is_empty());
    let (vtype, _, _) = registry.get_value(key, &[], usize::MAX).unwrap();
    assert_eq!(vtype, ValueType::SZ);
}

#[test]
fn test_delete_value() {
    let mut registry = Registry::new();
    let (key, _) = create(&mut registry, "K", CreateOptions::default()).unwrap();
    registry.set_value(key, &w("n"), ValueType::SZ, b"").unwrap();
    assert!(registry.delete_value(key, &w("N")).is_ok());
    assert_eq!(registry.delete_value(key, &w("n")), Err(Status::ObjectNameNotFound));
}

// =============================================================================
// Security descriptors
// =============================================================================

#[test]
fn test_default_sd_applies_when_none_supplied() {
    let mut registry = Registry::new();
    let (key, _) = create(&mut registry, "K", CreateOptions::default()).unwrap();
    let sd = registry.key_sd(key);
    assert_eq!(sd.owner, keyhive::access::Sid::builtin_admins());
    assert_eq!(sd.dacl.len(), 2);

    let custom = std::sync::Arc::new(keyhive::access::SecurityDescriptor {
        owner: keyhive::access::Sid::local_user(),
        group: keyhive::access::Sid::builtin_users(),
        dacl: vec![],
    });
    let root = registry.root();
    let (with_sd, _) = registry
        .create_key(
            root,
            &w("Secured"),
            None,
            CreateOptions::default(),
            Attributes::empty(),
            Some(custom.clone()),
            1,
        )
        .unwrap();
    assert!(std::sync::Arc::ptr_eq(&registry.key_sd(with_sd), &custom));
}

// =============================================================================
// Dirty propagation
// =============================================================================

#[test]
fn test_dirty_propagates_to_ancestors() {
    let mut registry = Registry::new();
    create(&mut registry, "A\\B\\C", CreateOptions::default()).unwrap();
    let root = registry.root();
    registry.make_clean(root);
    let c = open(&registry, "A\\B\\C").unwrap();
    registry.set_value(c, &w("v"), ValueType::SZ, b"").unwrap();
    for path in ["A", "A\\B", "A\\B\\C"] {
        let key = open(&registry, path).unwrap();
        assert!(
            registry.node(key).flags.contains(KeyFlags::DIRTY),
            "{path} should be dirty"
        );
    }
}

// =============================================================================
// Enumeration
// =============================================================================

#[test]
fn test_enum_children_and_bounds() {
    let mut registry = Registry::new();
    create(&mut registry, "P\\one", CreateOptions::default()).unwrap();
    create(&mut registry, "P\\two", CreateOptions::default()).unwrap();
    let p = open(&registry, "P").unwrap();
    let info = registry.enum_key(p, Some(0), KeyInfoClass::Basic).unwrap();
    assert_eq!(info.name.unwrap().to_string_lossy(), "one");
    assert_eq!(
        registry.enum_key(p, Some(2), KeyInfoClass::Basic),
        Err(Status::NoMoreEntries)
    );
    let stats = registry.enum_key(p, None, KeyInfoClass::Full).unwrap();
    assert_eq!(stats.subkeys, 2);
    assert!(stats.name.is_none());
}

#[test]
fn test_enum_name_reconstructs_full_path() {
    let mut registry = Registry::new();
    create(&mut registry, "Machine\\Software\\Acme", CreateOptions::default()).unwrap();
    let key = open(&registry, "Machine\\Software\\Acme").unwrap();
    let info = registry.enum_key(key, None, KeyInfoClass::Name).unwrap();
    assert_eq!(
        info.name.unwrap().to_string_lossy(),
        "\\REGISTRY\\Machine\\Software\\Acme"
    );
}

// =============================================================================
// Symlinks
// =============================================================================

fn make_link(registry: &mut Registry, path: &str, target: &str) {
    let options = CreateOptions { volatile: false, create_link: true };
    let root = registry.root();
    let (link, created) = registry
        .create_key(root, &w(path), None, options, Attributes::OPEN_LINK, None, 1)
        .unwrap();
    assert!(created);
    registry
        .set_value(link, &SYMLINK_VALUE, ValueType::LINK, &utf16_bytes(target))
        .unwrap();
}

#[test]
fn test_symlink_followed_by_default() {
    let mut registry = Registry::new();
    create(&mut registry, "A\\B", CreateOptions::default()).unwrap();
    let b = open(&registry, "A\\B").unwrap();
    registry.set_value(b, &w("v"), ValueType::SZ, &utf16z_bytes("hi")).unwrap();
    make_link(&mut registry, "L", "\\REGISTRY\\A\\B");

    let through = open(&registry, "L").unwrap();
    assert_eq!(through, b);
    let (_, _, data) = registry.get_value(through, &w("v"), usize::MAX).unwrap();
    assert_eq!(data, utf16z_bytes("hi"));
}

#[test]
fn test_open_link_returns_link_itself() {
    let mut registry = Registry::new();
    create(&mut registry, "A\\B", CreateOptions::default()).unwrap();
    make_link(&mut registry, "L", "\\REGISTRY\\A\\B");

    let link = registry
        .open_key(registry.root(), &w("L"), Attributes::OPEN_LINK)
        .unwrap();
    assert!(registry.node(link).flags.contains(KeyFlags::SYMLINK));
    assert_eq!(
        registry.get_value(link, &w("v"), usize::MAX),
        Err(Status::ObjectNameNotFound)
    );
}

#[test]
fn test_relative_symlink_resolves_from_parent() {
    let mut registry = Registry::new();
    create(&mut registry, "Dir\\Real", CreateOptions::default()).unwrap();
    make_link(&mut registry, "Dir\\Alias", "Real");
    let real = open(&registry, "Dir\\Real").unwrap();
    assert_eq!(open(&registry, "Dir\\Alias").unwrap(), real);
}

#[test]
fn test_symlink_key_rejects_other_values() {
    let mut registry = Registry::new();
    create(&mut registry, "T", CreateOptions::default()).unwrap();
    make_link(&mut registry, "L", "\\REGISTRY\\T");
    let link = registry
        .open_key(registry.root(), &w("L"), Attributes::OPEN_LINK)
        .unwrap();
    assert_eq!(
        registry.set_value(link, &w("other"), ValueType::SZ, b""),
        Err(Status::AccessDenied)
    );
    assert_eq!(
        registry.set_value(link, &SYMLINK_VALUE, ValueType::SZ, b""),
        Err(Status::AccessDenied)
    );
}

#[test]
fn test_symlink_chain_hop_limits() {
    let mut registry = Registry::new();
    create(&mut registry, "Target", CreateOptions::default()).unwrap();
    let target = open(&registry, "Target").unwrap();

    // L1 -> L2 -> ... -> L16 -> Target resolves in exactly 16 hops
    make_link(&mut registry, "L16", "\\REGISTRY\\Target");
    for i in (1..16).rev() {
        make_link(&mut registry, &format!("L{i}"), &format!("\\REGISTRY\\L{}", i + 1));
    }
    assert_eq!(open(&registry, "L1").unwrap(), target);

    // one more hop crosses the cap
    make_link(&mut registry, "L0", "\\REGISTRY\\L1");
    assert_eq!(open(&registry, "L0"), Err(Status::NameTooLong));
}

#[test]
fn test_symlink_cycle_terminates() {
    let mut registry = Registry::new();
    make_link(&mut registry, "X", "\\REGISTRY\\Y");
    make_link(&mut registry, "Y", "\\REGISTRY\\X");
    assert_eq!(open(&registry, "X"), Err(Status::NameTooLong));
}

// =============================================================================
// WoW64 redirection
// =============================================================================

/// Wire flags the way engine init does on a 64-bit prefix.
fn wire_wow64(registry: &mut Registry) {
    for path in [
        "Machine\\Software\\Wow6432Node",
        "Machine\\Software\\Classes\\Wow6432Node\\CLSID",
        "Machine\\Software\\Classes\\CLSID",
    ] {
        create(registry, path, CreateOptions::default()).unwrap();
    }
    let software = open(registry, "Machine\\Software").unwrap();
    registry.node_mut(software).flags |= KeyFlags::WOW64;
    let classes = open(registry, "Machine\\Software\\Classes").unwrap();
    registry.node_mut(classes).flags |= KeyFlags::WOWSHARE;
    let clsid = open(registry, "Machine\\Software\\Classes\\CLSID").unwrap();
    registry.node_mut(clsid).flags |= KeyFlags::WOW64;
}

#[test]
fn test_wow64_redirects_into_wow6432node() {
    let mut registry = Registry::new();
    wire_wow64(&mut registry);
    create(&mut registry, "Machine\\Software\\Wow6432Node\\OnlyIn32", CreateOptions::default()).unwrap();

    let expect = open(&registry, "Machine\\Software\\Wow6432Node\\OnlyIn32").unwrap();
    let found = registry
        .open_key(registry.root(), &w("Machine\\Software\\OnlyIn32"), Attributes::WOW64)
        .unwrap();
    assert_eq!(found, expect);

    // without the WoW64 attribute the 64-bit view misses it
    assert_eq!(
        open(&registry, "Machine\\Software\\OnlyIn32"),
        Err(Status::ObjectNameNotFound)
    );
}

#[test]
fn test_wowshare_children_visible_in_both_views() {
    let mut registry = Registry::new();
    wire_wow64(&mut registry);
    create(&mut registry, "Machine\\Software\\Classes\\myclass", CreateOptions::default()).unwrap();

    let expect = open(&registry, "Machine\\Software\\Classes\\myclass").unwrap();
    // a 32-bit request through the shared Wow6432Node sees the parent's children
    let found = registry
        .open_key(
            registry.root(),
            &w("Machine\\Software\\Classes\\Wow6432Node\\myclass"),
            Attributes::WOW64,
        )
        .unwrap();
    assert_eq!(found, expect);
}

#[test]
fn test_wowshare_wow6432node_terminal_resolves_to_parent() {
    let mut registry = Registry::new();
    wire_wow64(&mut registry);
    let classes = open(&registry, "Machine\\Software\\Classes").unwrap();
    let found = registry
        .open_key(
            registry.root(),
            &w("Machine\\Software\\Classes\\Wow6432Node"),
            Attributes::WOW64,
        )
        .unwrap();
    assert_eq!(found, classes);
}
