//! An offline trace post-processor.
//!
//! A binary instrumentation runtime records each application thread into a
//! compact per-thread raw log: basic blocks as `(module_index, module_offset,
//! instr_count)` records with the memory-reference addresses interleaved in
//! execution order. Those logs are cheap to write but useless to a simulator,
//! which wants one self-describing stream of instruction fetches and data
//! references ordered by time across all threads.
//!
//! This crate performs that conversion offline. It:
//!
//!  - parses the module-map blob the runtime serialized at tracing time and
//!    maps each module's code image back into memory, so that a
//!    `(module_index, module_offset)` pair can be turned into decodable
//!    instruction bytes (the `modmap` module);
//!  - expands each basic-block record into individual instruction-fetch
//!    records, decoding each unique address exactly once, and pulls the
//!    matching memory-reference payloads out of the same stream in operand
//!    order;
//!  - merges the per-thread streams into a single output stream ordered by
//!    the microsecond timestamps embedded in each log, injecting thread-id,
//!    pid and thread-exit markers at stream boundaries;
//!  - frames the result with the fixed-size analysis record format that
//!    downstream simulators consume (the `output` module).
//!
//! The converter is single-threaded and synchronous: thread streams are read
//! cooperatively in lockstep, selected by smallest pending timestamp. Code
//! that was not part of any module at trace time (JIT, vsyscall) is passed
//! through as best-effort data references rather than decoded.

#![allow(clippy::new_without_default)]

mod convert;
mod decode;
pub mod errors;
mod log;
pub mod modmap;
pub mod output;
pub mod record;

pub use convert::{Converter, ConverterBuilder, MAX_COMBINED_ENTRIES};
pub use errors::{ConversionError, ModuleTableError, RecordError};
pub use log::Verbosity;
pub use modmap::{CustomModuleHooks, Module, ModuleInfo, ModuleTable, CUSTOM_MODULE_VERSION};
pub use output::{TraceRecord, TraceType, TRACE_ENTRY_VERSION};
pub use record::{OfflineRecord, OFFLINE_FILE_VERSION};
