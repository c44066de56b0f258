//! The module table: turning the module-map blob back into decodable code.
//!
//! The instrumentation runtime serializes the list of loaded code modules at
//! tracing time. To expand a `(module_index, module_offset)` pair into
//! instruction bytes, the loader re-materializes each module's code image:
//! either from bytes embedded in the blob itself (the vdso, whose backing
//! file cannot be mapped offline), or by mapping the module file and laying
//! its non-writable segments out at their load-time relative addresses.
//!
//! Offsets in the raw stream are relative to the address the module lived at
//! when traced (`orig_base`); decoding reads `image[offset]` while
//! reconstructed application PCs are `orig_base + offset`.

mod parser;

use crate::errors::ModuleTableError;
use crate::log::{vlog, warn_msg, Verbosity};
use memmap2::Mmap;
use object::{Object, ObjectSegment};
use std::any::Any;
use std::fs;
use std::ops::Range;

#[cfg(test)]
pub(crate) use parser::{encode_module_map, MapEntry};

/// Version of the canonical custom field shape.
pub const CUSTOM_MODULE_VERSION: u64 = 1;

/// Callbacks for application-specific data embedded in each module's custom
/// field. Installed on the converter at construction; without hooks the user
/// blob is assumed empty and custom data is otherwise skipped.
pub trait CustomModuleHooks {
    /// Parse user data from the front of `src`, returning the payload and
    /// the unconsumed tail of `src`. `None` means `src` is not in a format
    /// this hook understands.
    fn parse<'a>(&self, src: &'a [u8]) -> Option<(Box<dyn Any>, &'a [u8])>;

    /// Called once per module after the table has been parsed.
    fn process(&self, module: &ModuleInfo<'_>, data: &dyn Any) -> Result<(), String>;
}

/// A module entry as presented to [CustomModuleHooks::process].
#[derive(Debug)]
pub struct ModuleInfo<'a> {
    pub index: usize,
    pub containing_index: usize,
    pub path: &'a str,
    pub orig_base: u64,
    pub size: u64,
}

enum Backing {
    /// Code bytes live in the module-map blob itself.
    External(Range<usize>),
    /// No decodable image.
    Stub,
    /// Image shared with the primary segment at the given index.
    Secondary(usize),
    /// Non-writable segments of the module file, laid out at their relative
    /// virtual addresses.
    Mapped(Vec<u8>),
}

/// One loaded code module.
pub struct Module {
    path: String,
    orig_base: u64,
    map_size: usize,
    backing: Backing,
}

impl Module {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The address the module lived at when traced.
    pub fn orig_base(&self) -> u64 {
        self.orig_base
    }

    /// Size of the materialized image; 0 marks a secondary segment or an
    /// undecodable stub.
    pub fn map_size(&self) -> usize {
        self.map_size
    }

    /// True if the code bytes live inside the module-map blob.
    pub fn is_external(&self) -> bool {
        matches!(self.backing, Backing::External(_))
    }

    pub fn is_secondary(&self) -> bool {
        matches!(self.backing, Backing::Secondary(_))
    }
}

/// The indexed module table. Built once at startup; images are released on
/// drop.
pub struct ModuleTable {
    blob: Vec<u8>,
    modules: Vec<Module>,
}

impl ModuleTable {
    /// Parses `blob` and materializes every module image per the mapping
    /// policy.
    pub fn load(
        blob: Vec<u8>,
        hooks: Option<&dyn CustomModuleHooks>,
        verbosity: Verbosity,
    ) -> Result<Self, ModuleTableError> {
        vlog!(verbosity, Verbosity::Summary, "reading module map");
        let parsed = parser::parse_module_map(&blob, hooks)?;
        if let Some(hooks) = hooks {
            for raw in &parsed.modules {
                if let Some(user) = raw.custom.as_ref().and_then(|c| c.user.as_ref()) {
                    let info = ModuleInfo {
                        index: raw.index,
                        containing_index: raw.containing_index,
                        path: &raw.path,
                        orig_base: raw.start,
                        size: raw.size,
                    };
                    hooks
                        .process(&info, user.as_ref())
                        .map_err(ModuleTableError::ProcessCustom)?;
                }
            }
        }

        let mut modules: Vec<Module> = Vec::with_capacity(parsed.modules.len());
        for raw in parsed.modules {
            let idx = modules.len();
            let contents = raw
                .custom
                .as_ref()
                .map(|c| c.contents.clone())
                .filter(|c| !c.is_empty());
            let module = if let Some(contents) = contents {
                vlog!(
                    verbosity,
                    Verbosity::Summary,
                    "using module {idx} {} stored {}-byte contents",
                    raw.path,
                    contents.len()
                );
                Module {
                    path: raw.path,
                    orig_base: raw.start,
                    map_size: contents.len(),
                    backing: Backing::External(contents),
                }
            } else if raw.path == "<unknown>"
                || (!parsed.has_custom_data && raw.path == "[vdso]")
            {
                // Legacy trace data missing the vdso contents; undecodable.
                Module {
                    path: raw.path,
                    orig_base: raw.start,
                    map_size: 0,
                    backing: Backing::Stub,
                }
            } else if raw.containing_index != raw.index {
                let primary = raw.containing_index;
                if primary >= idx {
                    return Err(ModuleTableError::BadSecondary {
                        index: idx,
                        containing: primary,
                    });
                }
                // The single mapping of the first segment is assumed to
                // cover the later segments; offsets are from its low base.
                if let Some(img) = image_of(&modules, &blob, primary) {
                    let covered = raw
                        .start
                        .checked_sub(modules[primary].orig_base)
                        .and_then(|off| off.checked_add(raw.size))
                        .is_some_and(|end| end <= img.len() as u64);
                    if !covered {
                        warn_msg!(
                            "segment {:#x}+{:#x} of {} extends beyond its primary mapping",
                            raw.start,
                            raw.size,
                            raw.path
                        );
                    }
                }
                vlog!(
                    verbosity,
                    Verbosity::Summary,
                    "separate segment assumed covered: module {idx} seg {:#x} = {}",
                    raw.start,
                    raw.path
                );
                Module {
                    path: raw.path,
                    orig_base: modules[primary].orig_base,
                    map_size: 0,
                    backing: Backing::Secondary(primary),
                }
            } else {
                match map_module_image(&raw.path) {
                    Ok(image) => {
                        vlog!(
                            verbosity,
                            Verbosity::Summary,
                            "mapped module {idx} @{:p} = {}",
                            image.as_ptr(),
                            raw.path
                        );
                        Module {
                            path: raw.path,
                            orig_base: raw.start,
                            map_size: image.len(),
                            backing: Backing::Mapped(image),
                        }
                    }
                    // The instrumentation runtime's own image is built at a
                    // fixed address and is expected to fail to map.
                    Err(_) if raw.path.contains("dynamorio") => {
                        vlog!(
                            verbosity,
                            Verbosity::Summary,
                            "treating unmappable module {idx} as undecodable: {}",
                            raw.path
                        );
                        Module {
                            path: raw.path,
                            orig_base: raw.start,
                            map_size: 0,
                            backing: Backing::Stub,
                        }
                    }
                    Err(e) => return Err(e),
                }
            };
            modules.push(module);
        }
        vlog!(
            verbosity,
            Verbosity::Summary,
            "successfully read {} modules",
            modules.len()
        );
        Ok(Self { blob, modules })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn module(&self, modidx: usize) -> Option<&Module> {
        self.modules.get(modidx)
    }

    /// The materialized code image for `modidx`, or `None` for stubs.
    /// Secondary segments resolve to their primary's image.
    pub fn image(&self, modidx: usize) -> Option<&[u8]> {
        image_of(&self.modules, &self.blob, modidx)
    }

    /// The raw address the image for `modidx` is materialized at; decoding
    /// of `(modidx, offset)` is keyed on `map_base + offset`.
    pub fn map_base(&self, modidx: usize) -> Option<u64> {
        self.image(modidx).map(|img| img.as_ptr() as u64)
    }
}

fn image_of<'a>(modules: &'a [Module], blob: &'a [u8], modidx: usize) -> Option<&'a [u8]> {
    let module = modules.get(modidx)?;
    match &module.backing {
        Backing::Mapped(image) => Some(image),
        Backing::External(contents) => Some(&blob[contents.clone()]),
        Backing::Secondary(primary) => match &modules.get(*primary)?.backing {
            Backing::Mapped(image) => Some(image),
            Backing::External(contents) => Some(&blob[contents.clone()]),
            _ => None,
        },
        Backing::Stub => None,
    }
}

/// Maps `path` and materializes an image of its non-writable load segments,
/// laid out relative to the lowest segment address.
fn map_module_image(path: &str) -> Result<Vec<u8>, ModuleTableError> {
    let map_failed = |source| ModuleTableError::MapFailed {
        path: path.to_owned(),
        source,
    };
    let not_loadable = |reason: String| ModuleTableError::NotLoadable {
        path: path.to_owned(),
        reason,
    };
    let file = fs::File::open(path).map_err(map_failed)?;
    let mmap = unsafe { Mmap::map(&file) }.map_err(map_failed)?;
    let obj = object::File::parse(&*mmap).map_err(|e| not_loadable(e.to_string()))?;

    let mut lo = u64::MAX;
    let mut hi = 0;
    for seg in obj.segments() {
        if seg.size() == 0 {
            continue;
        }
        lo = lo.min(seg.address());
        hi = hi.max(seg.address() + seg.size());
    }
    if lo >= hi {
        return Err(not_loadable("no loadable segments".to_owned()));
    }
    let mut image = vec![0; usize::try_from(hi - lo).unwrap()];
    for seg in obj.segments() {
        let writable = match seg.flags() {
            object::SegmentFlags::Elf { p_flags } => p_flags & object::elf::PF_W != 0,
            _ => false,
        };
        if seg.size() == 0 || writable {
            continue;
        }
        let data = seg.data().map_err(|e| not_loadable(e.to_string()))?;
        let off = usize::try_from(seg.address() - lo).unwrap();
        image[off..off + data.len()].copy_from_slice(data);
    }
    Ok(image)
}
