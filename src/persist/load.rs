//! Loading branch files
//!
//! A tolerant line-oriented parser. Structural problems (missing header,
//! mismatched architecture) abort the load with `NOT_REGISTRY_FILE`;
//! anything else is logged with file, line, and the offending text, then
//! skipped.

use std::io::BufRead;

use crate::clock::{self, epoch_to_ticks, Ticks};
use crate::config::Arch;
use crate::error::{OpResult, Status};
use crate::persist::text::{parse_hex, parse_wstr, units_to_bytes};
use crate::persist::FILE_HEADER;
use crate::tree::name::{eq_ci, BACKSLASH};
use crate::tree::{KeyFlags, KeyId, Registry, ValueType, WString, MAX_VALUE_NAME_LEN};

/// Load a branch file into `branch`.
///
/// `prefix_len` is the number of leading path elements of each section name
/// that are already part of the branch key's own path; `None` autodetects it
/// from the first section. The prefix architecture slot is set by the first
/// `#arch=` tag seen and validated against by later ones.
pub fn load_keys<R: BufRead>(
    registry: &mut Registry,
    branch: KeyId,
    reader: R,
    filename: &str,
    prefix_len: Option<usize>,
    prefix_arch: &mut Option<Arch>,
) -> OpResult<()> {
    let mut loader = Loader {
        registry,
        branch,
        reader,
        filename,
        line_no: 0,
        prefix_len,
        prefix_arch,
    };
    loader.run()
}

struct Loader<'a, R: BufRead> {
    registry: &'a mut Registry,
    branch: KeyId,
    reader: R,
    filename: &'a str,
    line_no: usize,
    prefix_len: Option<usize>,
    prefix_arch: &'a mut Option<Arch>,
}

impl<R: BufRead> Loader<'_, R> {
    fn run(&mut self) -> OpResult<()> {
        match self.read_line() {
            Some(first) if first == FILE_HEADER.as_bytes() => {}
            _ => return Err(Status::NotRegistryFile),
        }

        let mut current: Option<KeyId> = None;
        let mut pending_modif: Ticks = clock::now();
        while let Some(line) = self.read_line() {
            let line = trim_leading(&line).to_vec();
            match line.first().copied() {
                Some(b'[') => {
                    if let Some(key) = current {
                        self.update_key_time(key, pending_modif);
                    }
                    let (key, modif) = self.load_key_line(&line[1..]);
                    current = key;
                    pending_modif = modif;
                }
                Some(b'@') | Some(b'"') => match current {
                    Some(key) => self.load_value_line(key, &line),
                    None => self.report("Value without key", &line),
                },
                Some(b'#') => match current {
                    Some(key) => self.load_key_option(key, &line),
                    None => self.load_global_option(&line)?,
                },
                Some(b';') | None => {}
                Some(_) => self.report("Unrecognized input", &line),
            }
        }
        if let Some(key) = current {
            self.update_key_time(key, pending_modif);
        }
        Ok(())
    }

    /// Next line with the trailing newline stripped, or `None` at EOF or on
    /// a read error.
    fn read_line(&mut self) -> Option<Vec<u8>> {
        let mut buffer = Vec::new();
        self.line_no += 1;
        match self.reader.read_until(b'\n', &mut buffer) {
            Ok(0) => None,
            Ok(_) => {
                if buffer.last() == Some(&b'\n') {
                    buffer.pop();
                }
                if buffer.last() == Some(&b'\r') {
                    buffer.pop();
                }
                Some(buffer)
            }
            Err(err) => {
                tracing::warn!(file = self.filename, line = self.line_no, %err, "read error");
                None
            }
        }
    }

    fn report(&self, message: &str, line: &[u8]) {
        tracing::warn!(
            file = self.filename,
            line = self.line_no,
            text = %String::from_utf8_lossy(line),
            "{message}"
        );
    }

    /// Assign a loaded modification time to a key and the ancestors the load
    /// created along with it (those still at time zero).
    fn update_key_time(&mut self, key: KeyId, modif: Ticks) {
        let mut current = Some(key);
        while let Some(id) = current {
            let node = self.registry.node_mut(id);
            if node.modif != 0 {
                break;
            }
            node.modif = modif;
            current = node.parent;
        }
    }

    /// Parse a `[section] epoch?` line; returns the section's key and the
    /// pending modification time.
    fn load_key_line(&mut self, content: &[u8]) -> (Option<KeyId>, Ticks) {
        let now = clock::now();
        let Some((path, consumed)) = parse_wstr(content, b']') else {
            self.report("Malformed key", content);
            return (None, now);
        };
        let modif = parse_epoch(&content[consumed..]).map_or(now, epoch_to_ticks);

        let prefix_len = match self.prefix_len {
            Some(len) => len,
            None => {
                let len = self.prefix_len_of(&path);
                self.prefix_len = Some(len);
                len
            }
        };
        let Some(rest) = skip_prefix(&path, prefix_len) else {
            self.report("Malformed key", content);
            return (None, now);
        };
        if rest.is_empty() {
            return (Some(self.branch), modif);
        }
        match self.registry.create_key_loading(self.branch, rest) {
            Ok(key) => (Some(key), modif),
            Err(err) => {
                self.report(&format!("Error creating key: {err}"), content);
                (None, now)
            }
        }
    }

    /// How many leading elements of a section path are part of the branch
    /// key's own path: match the first element against the branch and its
    /// ancestors, farthest match winning; no match means fully relative.
    fn prefix_len_of(&self, path: &[u16]) -> usize {
        let first: &[u16] = match path.iter().position(|&u| u == BACKSLASH) {
            Some(i) => &path[..i],
            None => path,
        };
        let mut key = self.branch;
        let mut distance = 1;
        while key != self.registry.root() {
            if eq_ci(self.registry.node(key).name.as_units(), first) {
                return distance;
            }
            match self.registry.node(key).parent {
                Some(parent) => key = parent,
                None => break,
            }
            distance += 1;
        }
        0
    }

    fn load_key_option(&mut self, key: KeyId, line: &[u8]) {
        if let Some(rest) = line.strip_prefix(b"#time=") {
            let mut ticks: Ticks = 0;
            for &b in rest {
                match (b as char).to_digit(16) {
                    Some(d) => ticks = ticks << 4 | u64::from(d),
                    None => break,
                }
            }
            self.update_key_time(key, ticks);
        } else if let Some(rest) = line.strip_prefix(b"#class=") {
            match rest.strip_prefix(b"\"").and_then(|r| parse_wstr(r, b'"')) {
                Some((class, _)) => {
                    self.registry.node_mut(key).class = Some(WString::from(class));
                }
                None => self.report("Malformed class", line),
            }
        } else if line.starts_with(b"#link") {
            self.registry.node_mut(key).flags |= KeyFlags::SYMLINK;
        }
        // unknown options are ignored
    }

    fn load_global_option(&mut self, line: &[u8]) -> OpResult<()> {
        if let Some(rest) = line.strip_prefix(b"#arch=") {
            let arch = match rest {
                b"win32" => Arch::Win32,
                b"win64" => Arch::Win64,
                _ => {
                    self.report("Unknown architecture", line);
                    return Err(Status::NotRegistryFile);
                }
            };
            match *self.prefix_arch {
                None => *self.prefix_arch = Some(arch),
                Some(existing) if existing != arch => {
                    self.report("Mismatched architecture", line);
                    return Err(Status::NotRegistryFile);
                }
                Some(_) => {}
            }
        }
        // unknown options are ignored
        Ok(())
    }

    /// Parse and install one value line.
    fn load_value_line(&mut self, key: KeyId, line: &[u8]) {
        let (name, mut pos) = if line[0] == b'@' {
            (Vec::new(), 1)
        } else {
            match parse_wstr(&line[1..], b'"') {
                Some((name, consumed)) => (name, consumed + 1),
                None => {
                    self.report("Malformed value name", line);
                    return;
                }
            }
        };
        if name.len() > MAX_VALUE_NAME_LEN {
            self.report("Malformed value name", line);
            return;
        }
        while line.get(pos).is_some_and(u8::is_ascii_whitespace) {
            pos += 1;
        }
        if line.get(pos) != Some(&b'=') {
            self.report("Malformed value name", line);
            return;
        }
        pos += 1;
        while line.get(pos).is_some_and(u8::is_ascii_whitespace) {
            pos += 1;
        }

        let Some((vtype, parse_type, consumed)) = data_type(&line[pos..]) else {
            self.report("Malformed value", line);
            return;
        };
        pos += consumed;

        let data = match parse_type {
            ParseType::Str => match parse_wstr(&line[pos..], b'"') {
                Some((mut units, _)) => {
                    units.push(0);
                    units_to_bytes(&units)
                }
                None => {
                    self.report("Malformed value", line);
                    return;
                }
            },
            ParseType::Dword => {
                let mut value: u32 = 0;
                let mut digits = 0;
                for &b in &line[pos..] {
                    match (b as char).to_digit(16) {
                        Some(d) => {
                            value = value.wrapping_shl(4) | d;
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    self.report("Malformed value", line);
                    return;
                }
                value.to_le_bytes().to_vec()
            }
            ParseType::Hex => match self.parse_hex_data(&line[pos..]) {
                Some(data) => data,
                None => {
                    self.report("Malformed value", line);
                    return;
                }
            },
        };

        self.registry
            .node_mut(key)
            .install_value(WString::from(name), vtype, data);
    }

    /// Parse a hex run, pulling continuation lines while each chunk ends
    /// with a backslash.
    fn parse_hex_data(&mut self, first: &[u8]) -> Option<Vec<u8>> {
        let mut data = Vec::new();
        let mut chunk = first.to_vec();
        loop {
            let consumed = parse_hex(&mut data, &chunk)?;
            let rest = trim_leading(&chunk[consumed..]);
            if rest.is_empty() {
                return Some(data);
            }
            if rest[0] != b'\\' {
                return None;
            }
            chunk = trim_leading(&self.read_line()?).to_vec();
        }
    }
}

enum ParseType {
    Str,
    Dword,
    Hex,
}

/// Recognize the typed-value syntax and return (stored type, parse shape,
/// bytes consumed). For string forms the consumed count includes the opening
/// quote.
fn data_type(buffer: &[u8]) -> Option<(ValueType, ParseType, usize)> {
    const TABLE: &[(&[u8], ValueType)] = &[
        (b"\"", ValueType::SZ),
        (b"str:\"", ValueType::SZ),
        (b"str(2):\"", ValueType::EXPAND_SZ),
        (b"str(7):\"", ValueType::MULTI_SZ),
        (b"hex:", ValueType::BINARY),
        (b"dword:", ValueType::DWORD),
    ];
    for &(tag, vtype) in TABLE {
        if buffer.starts_with(tag) {
            let parse_type = match vtype {
                ValueType::DWORD => ParseType::Dword,
                ValueType::BINARY => ParseType::Hex,
                _ => ParseType::Str,
            };
            return Some((vtype, parse_type, tag.len()));
        }
    }
    // "hex(<type>):" carries an arbitrary type tag
    let rest = buffer.strip_prefix(b"hex(")?;
    let digits = rest.iter().take_while(|b| b.is_ascii_hexdigit()).count();
    if digits == 0 || digits > 8 {
        return None;
    }
    let tag = std::str::from_utf8(&rest[..digits]).ok()?;
    let vtype = ValueType(u32::from_str_radix(tag, 16).ok()?);
    let rest = &rest[digits..];
    if !rest.starts_with(b"):") {
        return None;
    }
    Some((vtype, ParseType::Hex, 4 + digits + 2))
}

fn trim_leading(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    &line[start..]
}

/// Parse the optional decimal epoch after a section header.
fn parse_epoch(rest: &[u8]) -> Option<u64> {
    let rest = trim_leading(rest);
    let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    std::str::from_utf8(&rest[..digits]).ok()?.parse().ok()
}

/// Skip `prefix_len` leading elements of a section path. `None` when the
/// path names fewer elements than the prefix.
fn skip_prefix(path: &[u16], mut prefix_len: usize) -> Option<&[u16]> {
    let mut i = 0;
    while prefix_len > 0 && i < path.len() {
        if path[i] == BACKSLASH {
            prefix_len -= 1;
        }
        i += 1;
    }
    if i >= path.len() {
        if prefix_len > 1 {
            return None;
        }
        return Some(&[]);
    }
    Some(&path[i..])
}
