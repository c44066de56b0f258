//! Error types for the conversion pipeline.
//!
//! Every failure surfaces as a human-readable diagnostic; callers are not
//! expected to dispatch on variants beyond deciding whether to retry.

use std::io;
use thiserror::Error;

/// Errors raised while parsing the module-map blob or mapping module images.
#[derive(Debug, Error)]
pub enum ModuleTableError {
    #[error("malformed module table header")]
    MalformedHeader,
    #[error("malformed module table entry {0}")]
    MalformedEntry(usize),
    #[error("unable to parse module data: custom field mismatch")]
    CustomFieldMismatch,
    #[error("custom module data processing failed: {0}")]
    ProcessCustom(String),
    #[error("failed to map module {path}: {source}")]
    MapFailed { path: String, source: io::Error },
    #[error("module {path} is not a loadable object: {reason}")]
    NotLoadable { path: String, reason: String },
    #[error("secondary segment {index} references invalid primary segment {containing}")]
    BadSecondary { index: usize, containing: usize },
}

/// Errors raised while decoding one 16-byte offline record from a thread log.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("unknown trace type {0:#x}")]
    UnknownTag(u8),
    #[error("invalid extension type {0}")]
    InvalidExtension(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors which abort a conversion.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    ModuleTable(#[from] ModuleTableError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("unable to read thread log file")]
    UnreadableThreadLog,
    #[error("thread log file is corrupted: missing version entry")]
    MissingVersionEntry,
    #[error("version mismatch: expect {expect} vs {got}")]
    VersionMismatch { expect: u64, got: u64 },
    #[error("missing timestamp entry")]
    MissingTimestamp,
    #[error("footer is not the final entry")]
    FooterNotLast,
    #[error("missing thread id")]
    MissingThreadId,
    #[error("invalid extension type {0}")]
    InvalidExtension(u8),
    #[error("memref entry found outside of a basic block")]
    MemrefOutsideBlock,
    #[error("control transfer instruction before the end of a basic block")]
    MidBlockCti,
    #[error("cannot mix 0-count and >1-count basic blocks")]
    MixedFilterModes,
    #[error("flush missing 2nd entry")]
    FlushMissingSecondEntry,
    #[error("too many combined entries for one instruction")]
    TooManyCombinedEntries,
    #[error("failed to write to output file: {0}")]
    Write(io::Error),
}
