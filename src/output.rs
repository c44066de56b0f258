//! The analysis-trace output format and its framed writer.
//!
//! Output records are fixed-size `(type, size, addr)` triples, little-endian,
//! 12 bytes each. The stream is bracketed by a single [TraceType::Header]
//! record carrying [TRACE_ENTRY_VERSION] and a single [TraceType::Footer].
//! The type taxonomy is a fixed contract with downstream simulators.

use crate::errors::ConversionError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use strum::FromRepr;

/// Version stamped into the output header record.
pub const TRACE_ENTRY_VERSION: u64 = 1;

/// Size of one encoded output record.
pub const TRACE_RECORD_BYTES: usize = 12;

/// The output record taxonomy.
#[repr(u16)]
#[derive(Clone, Copy, Debug, Eq, FromRepr, PartialEq)]
pub enum TraceType {
    Read = 0,
    Write,
    Prefetch,
    PrefetchT0,
    PrefetchT1,
    PrefetchT2,
    PrefetchNta,
    /// An instruction fetch with no control transfer.
    Instr,
    InstrDirectJump,
    InstrIndirectJump,
    InstrConditionalJump,
    InstrDirectCall,
    InstrIndirectCall,
    InstrReturn,
    /// An instruction cache flush; `addr` is the range start, `size` its
    /// length.
    InstrFlush,
    DataFlush,
    /// Marker: the records that follow belong to the thread id in `addr`.
    Thread,
    /// Marker: the thread id in `addr` exited.
    ThreadExit,
    /// Marker: the process id in `addr`.
    Pid,
    Header,
    Footer,
}

/// One record of the output stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TraceRecord {
    pub typ: TraceType,
    pub size: u16,
    pub addr: u64,
}

impl TraceRecord {
    /// A size-0 marker record.
    pub fn marker(typ: TraceType, addr: u64) -> Self {
        Self { typ, size: 0, addr }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u16::<LittleEndian>(self.typ as u16)?;
        w.write_u16::<LittleEndian>(self.size)?;
        w.write_u64::<LittleEndian>(self.addr)
    }

    /// Reads one record, or `None` at a clean end of stream.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Option<Self>> {
        let typ = match r.read_u16::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let typ = TraceType::from_repr(typ).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown output record type {typ}"),
            )
        })?;
        let size = r.read_u16::<LittleEndian>()?;
        let addr = r.read_u64::<LittleEndian>()?;
        Ok(Some(Self { typ, size, addr }))
    }
}

/// Sequential checked writer of [TraceRecord]s.
///
/// Any write failure aborts the conversion; there is no buffering beyond
/// what the underlying writer provides.
pub(crate) struct TraceWriter<W: Write> {
    inner: W,
}

impl<W: Write> TraceWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self { inner }
    }

    pub(crate) fn write(&mut self, rec: &TraceRecord) -> Result<(), ConversionError> {
        rec.write_to(&mut self.inner).map_err(ConversionError::Write)
    }

    pub(crate) fn write_all(&mut self, recs: &[TraceRecord]) -> Result<(), ConversionError> {
        for rec in recs {
            self.write(rec)?;
        }
        Ok(())
    }

    pub(crate) fn header(&mut self) -> Result<(), ConversionError> {
        self.write(&TraceRecord::marker(TraceType::Header, TRACE_ENTRY_VERSION))
    }

    pub(crate) fn footer(&mut self) -> Result<(), ConversionError> {
        self.write(&TraceRecord::marker(TraceType::Footer, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trips() {
        let recs = [
            TraceRecord::marker(TraceType::Header, TRACE_ENTRY_VERSION),
            TraceRecord {
                typ: TraceType::InstrReturn,
                size: 1,
                addr: 0x7fff_0000_1234,
            },
            TraceRecord {
                typ: TraceType::Write,
                size: 8,
                addr: 0xcafe_babe,
            },
            TraceRecord::marker(TraceType::Footer, 0),
        ];
        let mut buf = Vec::new();
        for r in &recs {
            r.write_to(&mut buf).unwrap();
        }
        assert_eq!(buf.len(), recs.len() * TRACE_RECORD_BYTES);
        let mut crsr = std::io::Cursor::new(buf);
        for r in &recs {
            assert_eq!(TraceRecord::read_from(&mut crsr).unwrap().unwrap(), *r);
        }
        assert_eq!(TraceRecord::read_from(&mut crsr).unwrap(), None);
    }

    #[test]
    fn unknown_type_is_invalid_data() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xffffu16.to_le_bytes());
        buf.extend_from_slice(&[0; 10]);
        let err = TraceRecord::read_from(&mut std::io::Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
