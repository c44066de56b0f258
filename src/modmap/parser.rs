//! Parser for the module-map blob.
//!
//! The blob is text with embedded raw bytes: a header line followed by one
//! comma-separated entry per module. The custom field leads each entry and
//! carries the module contents inline for images that cannot be mapped
//! offline (the vdso), plus an optional user blob handled by the
//! [CustomModuleHooks] seam. Because the contents are raw, the parser
//! advances by exact byte count rather than splitting on separators.
//!
//! Two legacy shapes are tolerated: entries with a user blob but no version
//! prefix, and entries with no custom field at all (recognized because the
//! next field looks like a path).

use crate::errors::ModuleTableError;
use crate::log::warn_msg;
use crate::modmap::{CustomModuleHooks, CUSTOM_MODULE_VERSION};
use std::any::Any;
use std::ops::Range;

/// One parsed module entry, before the mapping policy is applied.
pub(super) struct RawModule {
    pub(super) index: usize,
    pub(super) containing_index: usize,
    /// The address the module lived at when traced.
    pub(super) start: u64,
    pub(super) size: u64,
    pub(super) path: String,
    pub(super) custom: Option<CustomData>,
}

pub(super) struct CustomData {
    /// Byte range of the inline module contents within the blob.
    pub(super) contents: Range<usize>,
    pub(super) user: Option<Box<dyn Any>>,
}

pub(super) struct ParsedModuleMap {
    pub(super) modules: Vec<RawModule>,
    /// False once any entry fell back to a legacy custom-field shape.
    pub(super) has_custom_data: bool,
}

pub(super) fn parse_module_map(
    blob: &[u8],
    hooks: Option<&dyn CustomModuleHooks>,
) -> Result<ParsedModuleMap, ModuleTableError> {
    let mut crsr = Cursor { buf: blob, pos: 0 };
    let count = parse_header(&mut crsr)?;
    let mut state = ParseState {
        has_custom_data: true,
        warned_legacy: false,
    };
    let mut modules = Vec::with_capacity(count);
    for i in 0..count {
        modules.push(parse_entry(&mut crsr, hooks, &mut state, i)?);
    }
    Ok(ParsedModuleMap {
        modules,
        has_custom_data: state.has_custom_data,
    })
}

struct ParseState {
    has_custom_data: bool,
    warned_legacy: bool,
}

fn parse_header(crsr: &mut Cursor<'_>) -> Result<usize, ModuleTableError> {
    let line = std::str::from_utf8(crsr.take_line()).map_err(|_| ModuleTableError::MalformedHeader)?;
    let rest = line
        .strip_prefix("Module Table: version ")
        .ok_or(ModuleTableError::MalformedHeader)?;
    let (version, count) = rest
        .split_once(", count ")
        .ok_or(ModuleTableError::MalformedHeader)?;
    version
        .parse::<u64>()
        .map_err(|_| ModuleTableError::MalformedHeader)?;
    let count = count
        .trim_end()
        .parse::<usize>()
        .map_err(|_| ModuleTableError::MalformedHeader)?;
    if crsr.rest().starts_with(b"Columns:") {
        crsr.take_line();
    }
    Ok(count)
}

fn parse_entry(
    crsr: &mut Cursor<'_>,
    hooks: Option<&dyn CustomModuleHooks>,
    state: &mut ParseState,
    i: usize,
) -> Result<RawModule, ModuleTableError> {
    let malformed = || ModuleTableError::MalformedEntry(i);
    let custom = parse_custom_field(crsr, hooks, state)?;
    let path = std::str::from_utf8(crsr.take_field())
        .map_err(|_| malformed())?
        .to_owned();
    let index = parse_dec(crsr.take_field()).ok_or_else(malformed)?;
    if index != i {
        return Err(malformed());
    }
    let containing_index = parse_dec(crsr.take_field()).ok_or_else(malformed)?;
    let start = parse_hex(crsr.take_field()).ok_or_else(malformed)?;
    let size = parse_hex(crsr.take_field()).ok_or_else(malformed)?;
    crsr.eat(b'\n');
    Ok(RawModule {
        index,
        containing_index,
        start,
        size,
        path,
        custom,
    })
}

/// Parse the custom field at the cursor, trying the canonical
/// `v#<version>,<size>,<bytes><user_blob>` shape first and falling back to
/// the two legacy shapes.
fn parse_custom_field(
    crsr: &mut Cursor<'_>,
    hooks: Option<&dyn CustomModuleHooks>,
    state: &mut ParseState,
) -> Result<Option<CustomData>, ModuleTableError> {
    let field = crsr.peek_field();
    let version = field
        .strip_prefix(b"v#")
        .and_then(|v| parse_dec(v).map(|v| v as u64));
    if version != Some(CUSTOM_MODULE_VERSION) {
        state.has_custom_data = false;
        if !state.warned_legacy {
            warn_msg!(
                "incorrect module field version {}: attempting to handle legacy format",
                version.map_or(-1, |v| v as i64)
            );
            state.warned_legacy = true;
        }
        // Legacy format with a user blob but none of our own data.
        if let Some(hooks) = hooks {
            if let Some((user, remaining)) = hooks.parse(crsr.rest()) {
                crsr.advance_to_tail(remaining.len());
                if !crsr.eat(b',') {
                    return Err(ModuleTableError::CustomFieldMismatch);
                }
                return Ok(Some(CustomData {
                    contents: 0..0,
                    user: Some(user),
                }));
            }
        }
        // Legacy format with no custom field: the next field is the path.
        if field.starts_with(b"/") || field.starts_with(b"[vdso]") {
            return Ok(None);
        }
        warn_msg!("unable to parse module data: custom field mismatch");
        return Err(ModuleTableError::CustomFieldMismatch);
    }

    crsr.take_field();
    let contents_size = parse_dec(crsr.take_field()).ok_or(ModuleTableError::CustomFieldMismatch)?;
    let contents = crsr
        .take_byte_range(contents_size)
        .ok_or(ModuleTableError::CustomFieldMismatch)?;
    let user = match hooks {
        Some(hooks) => {
            let (user, remaining) = hooks
                .parse(crsr.rest())
                .ok_or(ModuleTableError::CustomFieldMismatch)?;
            crsr.advance_to_tail(remaining.len());
            Some(user)
        }
        None => None,
    };
    if !crsr.eat(b',') {
        return Err(ModuleTableError::CustomFieldMismatch);
    }
    Ok(Some(CustomData { contents, user }))
}

fn parse_dec(field: &[u8]) -> Option<usize> {
    std::str::from_utf8(field).ok()?.parse().ok()
}

fn parse_hex(field: &[u8]) -> Option<u64> {
    let s = std::str::from_utf8(field).ok()?;
    u64::from_str_radix(s.strip_prefix("0x")?, 16).ok()
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// The bytes up to (exclusive) the next `,` or newline.
    fn peek_field(&self) -> &'a [u8] {
        let rest = self.rest();
        let end = rest
            .iter()
            .position(|&b| b == b',' || b == b'\n')
            .unwrap_or(rest.len());
        &rest[..end]
    }

    /// Consumes one field plus its trailing `,` if present. A newline is
    /// left in place for [Cursor::eat].
    fn take_field(&mut self) -> &'a [u8] {
        let field = self.peek_field();
        self.pos += field.len();
        self.eat(b',');
        field
    }

    fn take_line(&mut self) -> &'a [u8] {
        let rest = self.rest();
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(rest.len());
        self.pos += end;
        self.eat(b'\n');
        &rest[..end]
    }

    /// Consumes exactly `n` raw bytes, returning their range within the
    /// blob.
    fn take_byte_range(&mut self, n: usize) -> Option<Range<usize>> {
        if self.rest().len() < n {
            return None;
        }
        let range = self.pos..self.pos + n;
        self.pos += n;
        Some(range)
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.rest().first() == Some(&b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Repositions the cursor so that `tail_len` bytes remain; used after a
    /// user hook consumed an arbitrary prefix of [Cursor::rest].
    fn advance_to_tail(&mut self, tail_len: usize) {
        debug_assert!(tail_len <= self.buf.len() - self.pos);
        self.pos = self.buf.len() - tail_len;
    }
}

#[cfg(test)]
pub(crate) use test_support::{encode_module_map, MapEntry};


#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    /// A hook which parses a `key=value` user blob terminated by the field
    /// separator.
    struct KvHooks;

    impl CustomModuleHooks for KvHooks {
        fn parse<'a>(&self, src: &'a [u8]) -> Option<(Box<dyn Any>, &'a [u8])> {
            let end = src.iter().position(|&b| b == b',')?;
            let s = std::str::from_utf8(&src[..end]).ok()?;
            let (_, v) = s.split_once('=')?;
            let v: u64 = v.parse().ok()?;
            Some((Box::new(v), &src[end..]))
        }

        fn process(
            &self,
            _module: &crate::modmap::ModuleInfo<'_>,
            _data: &dyn Any,
        ) -> Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn canonical_round_trip() {
        let contents = b"\x90\x90,embedded commas\nand newlines,\x00ok";
        let blob = encode_module_map(&[
            MapEntry {
                contents,
                ..MapEntry::new("/usr/lib/libc.so.6", 0x7f00_0000_0000)
            },
            MapEntry::new("/usr/bin/app", 0x40_0000),
        ]);
        let parsed = parse_module_map(&blob, None).unwrap();
        assert!(parsed.has_custom_data);
        assert_eq!(parsed.modules.len(), 2);
        let m = &parsed.modules[0];
        assert_eq!(m.path, "/usr/lib/libc.so.6");
        assert_eq!(m.start, 0x7f00_0000_0000);
        assert_eq!(m.size, 0x1000);
        assert_eq!(&blob[m.custom.as_ref().unwrap().contents.clone()], contents);
        let m = &parsed.modules[1];
        assert_eq!(m.path, "/usr/bin/app");
        assert!(m.custom.as_ref().unwrap().contents.is_empty());
    }

    #[test]
    fn canonical_with_user_blob() {
        let blob = encode_module_map(&[MapEntry {
            user: b"build=17",
            ..MapEntry::new("/usr/bin/app", 0x40_0000)
        }]);
        let parsed = parse_module_map(&blob, Some(&KvHooks)).unwrap();
        let user = parsed.modules[0].custom.as_ref().unwrap().user.as_ref().unwrap();
        assert_eq!(*user.downcast_ref::<u64>().unwrap(), 17);
    }

    #[test]
    fn legacy_with_user_blob() {
        let blob = b"Module Table: version 1, count 1\n\
                     build=9,/usr/bin/app,0,0,0x400000,0x1000\n"
            .to_vec();
        let parsed = parse_module_map(&blob, Some(&KvHooks)).unwrap();
        assert!(!parsed.has_custom_data);
        let m = &parsed.modules[0];
        assert_eq!(m.path, "/usr/bin/app");
        let user = m.custom.as_ref().unwrap().user.as_ref().unwrap();
        assert_eq!(*user.downcast_ref::<u64>().unwrap(), 9);
    }

    #[test]
    fn legacy_without_custom_field() {
        let blob = b"Module Table: version 1, count 2\n\
                     /usr/bin/app,0,0,0x400000,0x1000\n\
                     [vdso],1,1,0x7fff000,0x1000\n"
            .to_vec();
        let parsed = parse_module_map(&blob, None).unwrap();
        assert!(!parsed.has_custom_data);
        assert!(parsed.modules[0].custom.is_none());
        assert_eq!(parsed.modules[1].path, "[vdso]");
    }

    #[test]
    fn unparseable_custom_field_is_rejected() {
        let blob = b"Module Table: version 1, count 1\n\
                     garbage,/usr/bin/app,0,0,0x400000,0x1000\n"
            .to_vec();
        assert!(matches!(
            parse_module_map(&blob, None),
            Err(ModuleTableError::CustomFieldMismatch)
        ));
    }

    #[test]
    fn wrong_custom_version_without_hooks_is_rejected() {
        let blob = b"Module Table: version 1, count 1\n\
                     v#99,0,,/usr/bin/app,0,0,0x400000,0x1000\n"
            .to_vec();
        assert!(matches!(
            parse_module_map(&blob, None),
            Err(ModuleTableError::CustomFieldMismatch)
        ));
    }

    #[test]
    fn bad_header_is_rejected() {
        assert!(matches!(
            parse_module_map(b"Modules: 3\n", None),
            Err(ModuleTableError::MalformedHeader)
        ));
    }

    #[test]
    fn entry_index_must_match_position() {
        let blob = b"Module Table: version 1, count 1\n\
                     v#1,0,,/usr/bin/app,5,5,0x400000,0x1000\n"
            .to_vec();
        assert!(matches!(
            parse_module_map(&blob, None),
            Err(ModuleTableError::MalformedEntry(0))
        ));
    }
}
