//! Saving branch files
//!
//! The emitter writes the canonical form: keys that carry values, a class,
//! the link flag, or no subkeys get a section of their own; purely
//! structural keys are implied by their descendants. `save_branch` wraps the
//! emitter in the atomic protocol: regular single-link destinations are
//! replaced through a tempfile and rename, everything else (multiple hard
//! links, symlinks, special files) is truncated and rewritten in place so
//! the aliasing is preserved.

use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::clock::ticks_to_epoch;
use crate::config::Arch;
use crate::error::Result;
use crate::persist::text::{bytes_to_units, dump_wstr};
use crate::persist::FILE_HEADER;
use crate::tree::{KeyFlags, KeyId, KeyValue, Registry, ValueType};

/// Column at which hex runs wrap to a continuation line.
const HEX_WRAP_COLUMN: usize = 76;

/// Emit the path of `key` relative to `base` (`None` = fully qualified),
/// segments escaped for a section header.
fn dump_path<W: Write>(
    registry: &Registry,
    key: KeyId,
    base: Option<KeyId>,
    w: &mut W,
) -> io::Result<()> {
    let node = registry.node(key);
    if let Some(parent) = node.parent {
        if Some(parent) != base {
            dump_path(registry, parent, base, w)?;
            w.write_all(b"\\\\")?;
        }
    }
    dump_wstr(w, node.name.as_units(), [b'[', b']'])?;
    Ok(())
}

/// Emit one value line.
fn dump_value<W: Write>(value: &KeyValue, w: &mut W) -> io::Result<()> {
    let mut count;
    if !value.name.is_empty() {
        w.write_all(b"\"")?;
        count = 1 + dump_wstr(w, value.name.as_units(), [b'"', b'"'])?;
        w.write_all(b"\"=")?;
        count += 2;
    } else {
        w.write_all(b"@=")?;
        count = 2;
    }

    if value.vtype.is_string() {
        // quoted form only for properly terminated UTF-16 payloads
        let data = &value.data;
        if data.len() >= 2 && data.len() % 2 == 0 && data[data.len() - 2..] == [0, 0] {
            if value.vtype != ValueType::SZ {
                write!(w, "str({:x}):", value.vtype.0)?;
            }
            w.write_all(b"\"")?;
            dump_wstr(w, &bytes_to_units(data), [b'"', b'"'])?;
            w.write_all(b"\"\n")?;
            return Ok(());
        }
    } else if value.vtype == ValueType::DWORD && value.data.len() == 4 {
        let dw = u32::from_le_bytes([value.data[0], value.data[1], value.data[2], value.data[3]]);
        writeln!(w, "dword:{:08x}", dw)?;
        return Ok(());
    }

    if value.vtype == ValueType::BINARY {
        w.write_all(b"hex:")?;
        count += 4;
    } else {
        let tag = format!("hex({:x}):", value.vtype.0);
        w.write_all(tag.as_bytes())?;
        count += tag.len();
    }
    for (i, byte) in value.data.iter().enumerate() {
        write!(w, "{:02x}", byte)?;
        count += 2;
        if i < value.data.len() - 1 {
            w.write_all(b",")?;
            count += 1;
            if count > HEX_WRAP_COLUMN {
                w.write_all(b"\\\n  ")?;
                count = 2;
            }
        }
    }
    w.write_all(b"\n")?;
    Ok(())
}

/// Emit `key` and all its subkeys relative to `base`. Volatile subtrees are
/// skipped entirely.
fn save_subkeys<W: Write>(
    registry: &Registry,
    key: KeyId,
    base: KeyId,
    w: &mut W,
) -> io::Result<()> {
    let node = registry.node(key);
    if node.flags.contains(KeyFlags::VOLATILE) {
        return Ok(());
    }
    // keys with no values but subkeys are implied by their subkeys
    if !node.values.is_empty()
        || node.children.is_empty()
        || node.class.is_some()
        || node.flags.contains(KeyFlags::SYMLINK)
    {
        w.write_all(b"\n[")?;
        if key != base {
            dump_path(registry, key, Some(base), w)?;
        }
        writeln!(w, "] {}", ticks_to_epoch(node.modif))?;
        writeln!(
            w,
            "#time={:x}{:08x}",
            node.modif >> 32,
            node.modif & 0xffff_ffff
        )?;
        if let Some(class) = &node.class {
            w.write_all(b"#class=\"")?;
            dump_wstr(w, class.as_units(), [b'"', b'"'])?;
            w.write_all(b"\"\n")?;
        }
        if node.flags.contains(KeyFlags::SYMLINK) {
            w.write_all(b"#link\n")?;
        }
        for value in &node.values {
            dump_value(value, w)?;
        }
    }
    for &child in &node.children {
        save_subkeys(registry, child, base, w)?;
    }
    Ok(())
}

/// Emit a whole branch: header, base-path comment, architecture tag, keys.
pub fn save_all_subkeys<W: Write>(
    registry: &Registry,
    key: KeyId,
    arch: Option<Arch>,
    w: &mut W,
) -> io::Result<()> {
    writeln!(w, "{}", FILE_HEADER)?;
    w.write_all(b";; All keys relative to ")?;
    dump_wstr(w, registry.full_path(key).as_units(), [b'[', b']'])?;
    w.write_all(b"\n")?;
    match arch {
        Some(Arch::Win32) => w.write_all(b"\n#arch=win32\n")?,
        Some(Arch::Win64) => w.write_all(b"\n#arch=win64\n")?,
        None => {}
    }
    save_subkeys(registry, key, key, w)
}

#[cfg(unix)]
fn link_count(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.nlink()
}

#[cfg(not(unix))]
fn link_count(_meta: &fs::Metadata) -> u64 {
    1
}

/// Save a branch to its file if dirty, then mark the subtree clean.
///
/// A destination that is not a plain single-link regular file is written in
/// place (truncate + write) so hard links and symlinks stay intact;
/// otherwise the new content lands in a `reg<pid><counter>.tmp` sibling that
/// is fsynced and renamed over the destination.
pub fn save_branch(registry: &mut Registry, key: KeyId, path: &Path, arch: Option<Arch>) -> Result<()> {
    if !registry.node(key).flags.contains(KeyFlags::DIRTY) {
        tracing::debug!(path = %path.display(), "branch clean, not saving");
        return Ok(());
    }
    tracing::info!(path = %path.display(), "saving branch");

    let written_in_place = match OpenOptions::new().write(true).open(path) {
        Ok(file) => {
            let meta = fs::symlink_metadata(path)?;
            if !meta.file_type().is_file() || link_count(&meta) > 1 {
                file.set_len(0)?;
                let mut writer = BufWriter::new(file);
                save_all_subkeys(registry, key, arch, &mut writer)?;
                let file = writer.into_inner().map_err(|e| e.into_error())?;
                file.sync_all()?;
                true
            } else {
                false
            }
        }
        Err(_) => false,
    };

    if !written_in_place {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let dir = dir.unwrap_or_else(|| Path::new("."));
        let pid = std::process::id();
        let mut counter = 0u32;
        let (file, tmp_path) = loop {
            let candidate = dir.join(format!("reg{:x}{:04x}.tmp", pid, counter));
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(file) => break (file, candidate),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => counter += 1,
                Err(err) => return Err(err.into()),
            }
        };
        let result = (|| {
            let mut writer = BufWriter::new(file);
            save_all_subkeys(registry, key, arch, &mut writer)?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            fs::rename(&tmp_path, path)
        })();
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
    }

    registry.make_clean(key);
    Ok(())
}
