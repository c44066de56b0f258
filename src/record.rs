//! The 16-byte offline record: the unit in which the instrumentation runtime
//! writes per-thread raw logs.
//!
//! On disk a record is two little-endian 64-bit words. The top byte of the
//! first word carries the tag; the second word carries the primary value
//! (thread id, timestamp, address, ...). The `PC` record additionally packs
//! the module index and instruction count into the first word:
//!
//! ```text
//! word0: [63:56] tag  [55:32] modidx  [31:0] instr_count
//! word1: modoffs
//! ```
//!
//! Extension records (tag 0) discriminate further on the low byte of word0:
//! a `HEADER` carrying the file version opens every thread log and a
//! `FOOTER` closes it.

use crate::errors::RecordError;
use std::io::{self, Read};

/// The file version every thread log's header record must carry.
pub const OFFLINE_FILE_VERSION: u64 = 2;

/// Size of one encoded record.
pub const RECORD_BYTES: usize = 16;

const TAG_EXTENDED: u8 = 0;
const TAG_THREAD: u8 = 1;
const TAG_PID: u8 = 2;
const TAG_TIMESTAMP: u8 = 3;
const TAG_PC: u8 = 4;
const TAG_MEMREF: u8 = 5;
const TAG_MEMREF_HIGH: u8 = 6;
const TAG_IFLUSH: u8 = 7;

const EXT_FOOTER: u8 = 0;
pub(crate) const EXT_HEADER: u8 = 1;

/// One record of a per-thread raw log.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OfflineRecord {
    /// The thread id of the log's thread, seen once near the start.
    Thread { tid: u64 },
    /// The process id of the traced process.
    Pid { pid: u64 },
    /// Microsecond timestamp; monotonic within one thread log.
    Timestamp { usec: u64 },
    /// A basic block: `instr_count` instructions starting at `modoffs` bytes
    /// into module `modidx`.
    Pc {
        modidx: u32,
        modoffs: u64,
        instr_count: u32,
    },
    /// Address of the next memory operand.
    Memref { addr: u64 },
    /// High address bits of the next memory operand.
    MemrefHigh { addr: u64 },
    /// One half of an instruction-flush range; always written in pairs.
    IFlush { addr: u64 },
    /// File header; the first record of every thread log.
    Header { version: u64 },
    /// End-of-thread sentinel; the last record of every thread log.
    Footer,
}

impl OfflineRecord {
    pub fn to_bytes(&self) -> [u8; RECORD_BYTES] {
        let (word0, word1) = match self {
            Self::Thread { tid } => (tag_word(TAG_THREAD), *tid),
            Self::Pid { pid } => (tag_word(TAG_PID), *pid),
            Self::Timestamp { usec } => (tag_word(TAG_TIMESTAMP), *usec),
            Self::Pc {
                modidx,
                modoffs,
                instr_count,
            } => (
                tag_word(TAG_PC)
                    | (u64::from(*modidx) & 0x00ff_ffff) << 32
                    | u64::from(*instr_count),
                *modoffs,
            ),
            Self::Memref { addr } => (tag_word(TAG_MEMREF), *addr),
            Self::MemrefHigh { addr } => (tag_word(TAG_MEMREF_HIGH), *addr),
            Self::IFlush { addr } => (tag_word(TAG_IFLUSH), *addr),
            Self::Header { version } => (tag_word(TAG_EXTENDED) | u64::from(EXT_HEADER), *version),
            Self::Footer => (tag_word(TAG_EXTENDED) | u64::from(EXT_FOOTER), 0),
        };
        let mut buf = [0; RECORD_BYTES];
        buf[..8].copy_from_slice(&word0.to_le_bytes());
        buf[8..].copy_from_slice(&word1.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: [u8; RECORD_BYTES]) -> Result<Self, RecordError> {
        let word0 = u64::from_le_bytes(buf[..8].try_into().unwrap());
        let word1 = u64::from_le_bytes(buf[8..].try_into().unwrap());
        let rec = match (word0 >> 56) as u8 {
            TAG_THREAD => Self::Thread { tid: word1 },
            TAG_PID => Self::Pid { pid: word1 },
            TAG_TIMESTAMP => Self::Timestamp { usec: word1 },
            TAG_PC => Self::Pc {
                modidx: ((word0 >> 32) & 0x00ff_ffff) as u32,
                modoffs: word1,
                instr_count: word0 as u32,
            },
            TAG_MEMREF => Self::Memref { addr: word1 },
            TAG_MEMREF_HIGH => Self::MemrefHigh { addr: word1 },
            TAG_IFLUSH => Self::IFlush { addr: word1 },
            TAG_EXTENDED => match word0 as u8 {
                EXT_HEADER => Self::Header { version: word1 },
                EXT_FOOTER => Self::Footer,
                ext => return Err(RecordError::InvalidExtension(ext)),
            },
            tag => return Err(RecordError::UnknownTag(tag)),
        };
        Ok(rec)
    }
}

fn tag_word(tag: u8) -> u64 {
    u64::from(tag) << 56
}

/// Reads [OfflineRecord]s off one thread log with a one-record lookahead
/// buffer.
///
/// The lookahead exists for predicated memory references: the runtime omits
/// a memref record when the predicate did not fire, so the block expander
/// peeks at the next record and only consumes it if it really is a memref.
///
/// The reader distinguishes a log that ends cleanly on a record boundary
/// from one that ends mid-record; the latter is reported via
/// [RecordReader::truncated] so the caller can warn and degrade.
pub(crate) struct RecordReader<R: Read> {
    inner: R,
    lookahead: Option<OfflineRecord>,
    eof: bool,
    truncated: bool,
}

impl<R: Read> RecordReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            lookahead: None,
            eof: false,
            truncated: false,
        }
    }

    /// Returns the next record without consuming it, or `None` at the end of
    /// the log.
    pub(crate) fn peek(&mut self) -> Result<Option<OfflineRecord>, RecordError> {
        self.fill()?;
        Ok(self.lookahead)
    }

    /// Returns the next record, or `None` at the end of the log.
    pub(crate) fn next_record(&mut self) -> Result<Option<OfflineRecord>, RecordError> {
        self.fill()?;
        Ok(self.lookahead.take())
    }

    /// True once the end of the log was reached mid-record.
    pub(crate) fn truncated(&self) -> bool {
        self.truncated
    }

    fn fill(&mut self) -> Result<(), RecordError> {
        if self.lookahead.is_some() || self.eof {
            return Ok(());
        }
        let mut buf = [0; RECORD_BYTES];
        let mut got = 0;
        while got < RECORD_BYTES {
            match self.inner.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(RecordError::Io(e)),
            }
        }
        if got < RECORD_BYTES {
            self.eof = true;
            self.truncated = got != 0;
            return Ok(());
        }
        self.lookahead = Some(OfflineRecord::from_bytes(buf)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(recs: &[OfflineRecord]) -> Vec<u8> {
        let mut buf = Vec::new();
        for r in recs {
            buf.extend_from_slice(&r.to_bytes());
        }
        buf
    }

    #[test]
    fn codec_round_trips() {
        let recs = [
            OfflineRecord::Thread { tid: 42 },
            OfflineRecord::Pid { pid: 7 },
            OfflineRecord::Timestamp { usec: 0x1234_5678_9abc },
            OfflineRecord::Pc {
                modidx: 0x00ab_cdef,
                modoffs: 0xdead_0000_beef,
                instr_count: 17,
            },
            OfflineRecord::Memref { addr: u64::MAX },
            OfflineRecord::MemrefHigh { addr: 1 },
            OfflineRecord::IFlush { addr: 0x7000 },
            OfflineRecord::Header {
                version: OFFLINE_FILE_VERSION,
            },
            OfflineRecord::Footer,
        ];
        for r in recs {
            assert_eq!(OfflineRecord::from_bytes(r.to_bytes()).unwrap(), r);
        }
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let mut buf = [0; RECORD_BYTES];
        buf[7] = 0x7f; // Top byte of little-endian word0.
        assert!(matches!(
            OfflineRecord::from_bytes(buf),
            Err(RecordError::UnknownTag(0x7f))
        ));
    }

    #[test]
    fn unknown_extension_is_an_error() {
        let mut buf = [0; RECORD_BYTES];
        buf[0] = 9;
        assert!(matches!(
            OfflineRecord::from_bytes(buf),
            Err(RecordError::InvalidExtension(9))
        ));
    }

    #[test]
    fn peek_does_not_consume() {
        let bytes = stream(&[
            OfflineRecord::Timestamp { usec: 100 },
            OfflineRecord::Footer,
        ]);
        let mut rd = RecordReader::new(std::io::Cursor::new(bytes));
        assert_eq!(
            rd.peek().unwrap(),
            Some(OfflineRecord::Timestamp { usec: 100 })
        );
        assert_eq!(
            rd.next_record().unwrap(),
            Some(OfflineRecord::Timestamp { usec: 100 })
        );
        assert_eq!(rd.next_record().unwrap(), Some(OfflineRecord::Footer));
        assert_eq!(rd.next_record().unwrap(), None);
        assert!(!rd.truncated());
    }

    #[test]
    fn partial_final_record_reports_truncation() {
        let mut bytes = stream(&[OfflineRecord::Timestamp { usec: 100 }]);
        bytes.extend_from_slice(&[1, 2, 3, 4, 5]);
        let mut rd = RecordReader::new(std::io::Cursor::new(bytes));
        assert!(rd.next_record().unwrap().is_some());
        assert_eq!(rd.next_record().unwrap(), None);
        assert!(rd.truncated());
    }
}
