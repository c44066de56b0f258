//! Basic-block expansion.
//!
//! A `PC` record compresses a whole basic block into `(modidx, modoffs,
//! instr_count)`. Expansion walks the block's instruction bytes, decoding
//! each one through the cache, and interleaves the memory-reference payloads
//! pulled from the same thread stream: for each instruction that actually
//! touches memory, one memref record per source memory operand, then one per
//! destination memory operand.
//!
//! Two instruction-set quirks are folded away here. Repeated string
//! operations are expanded into internal loops by the instrumentation
//! runtime, so consecutive occurrences of the same rep-string instruction
//! collapse back to a single fetch record (the memrefs all survive).
//! Predicated operands whose predicate did not fire have no memref record
//! at all; the expander peeks before consuming and leaves whatever else it
//! finds for the demultiplexer.

use super::{Converter, MAX_COMBINED_ENTRIES};
use crate::decode::{DataKind, DecodedInstr};
use crate::errors::ConversionError;
use crate::log::{vlog, warn_msg, Verbosity};
use crate::output::{TraceRecord, TraceType};
use crate::record::{OfflineRecord, RecordReader};
use smallvec::SmallVec;
use std::io::{Read, Write};

/// Records staged for one instruction, flushed to the writer together.
type Staged = SmallVec<[TraceRecord; MAX_COMBINED_ENTRIES]>;

impl<R: Read, W: Write> Converter<R, W> {
    /// Expands one basic block. Returns `false`, consuming nothing, when the
    /// block's code is not decodable (not in any module); the demultiplexer
    /// then handles the trailing memrefs as best-effort guesses.
    pub(super) fn append_bb(
        &mut self,
        tidx: usize,
        modidx: u32,
        modoffs: u64,
        instr_count: u32,
    ) -> Result<bool, ConversionError> {
        let verbosity = self.verbosity;
        let not_in_module = modidx == 0 && modoffs == 0;
        let modidx = modidx as usize;
        let image = if not_in_module {
            None
        } else {
            self.modules.image(modidx)
        };
        let Some(image) = image else {
            vlog!(
                verbosity,
                Verbosity::Blocks,
                "skipping ifetch for {instr_count} instrs not in a module"
            );
            return Ok(false);
        };
        let map_base = image.as_ptr() as u64;
        // The image lookup above succeeded, so the module exists.
        let module = self.modules.module(modidx).unwrap();
        let orig_base = module.orig_base();
        let path = module.path();
        vlog!(
            verbosity,
            Verbosity::Blocks,
            "appending {instr_count} instrs in bb {:#x} in mod {modidx} +{modoffs:#x} = {path}",
            map_base.wrapping_add(modoffs)
        );

        let mut instr_count = instr_count;
        let mut skip_icache = false;
        if instr_count == 0 {
            // L0 filtering inserts a count-0 block before each memref; only
            // the data record is wanted.
            skip_icache = true;
            instr_count = 1;
            if !self.instrs_are_separate {
                self.instrs_are_separate = true;
            }
        }
        if self.instrs_are_separate && instr_count != 1 {
            return Err(ConversionError::MixedFilterModes);
        }

        let mut offs = modoffs;
        for i in 0..instr_count {
            let mut staged = Staged::new();
            let orig_pc = orig_base.wrapping_add(offs);
            let bytes = image.get(offs as usize..).unwrap_or(&[]);
            let decoded = self
                .cache
                .decode(map_base.wrapping_add(offs), bytes, orig_pc)
                .cloned();
            let Some(di) = decoded else {
                warn_msg!("encountered invalid/undecodable instr @ {path}+{offs:#x}");
                break;
            };
            if di.is_cti && i != instr_count - 1 {
                return Err(ConversionError::MidBlockCti);
            }
            // The runtime expands rep-string instructions into internal
            // loops; fold consecutive repeats back to a single record.
            let mut skip_instr = false;
            if di.rep_string {
                if !self.prev_instr_was_rep_string {
                    self.prev_instr_was_rep_string = true;
                } else {
                    skip_instr = true;
                }
            } else {
                self.prev_instr_was_rep_string = false;
            }
            if skip_instr {
                vlog!(
                    verbosity,
                    Verbosity::Blocks,
                    "skipping instr fetch for {orig_pc:#x}"
                );
            } else if !skip_icache {
                staged.push(TraceRecord {
                    typ: di.fetch_type,
                    size: di.len as u16,
                    addr: orig_pc,
                });
            }
            offs += di.len as u64;
            // No memref follows an icache-only entry in separate mode.
            if (!self.instrs_are_separate || skip_icache) && di.references_memory() {
                'memrefs: {
                    for &opsize in &di.mem_srcs {
                        if !Self::append_memref(
                            &mut self.threads[tidx].reader,
                            &mut staged,
                            &di,
                            opsize,
                            false,
                            verbosity,
                        )? {
                            break 'memrefs;
                        }
                    }
                    for &opsize in &di.mem_dsts {
                        if !Self::append_memref(
                            &mut self.threads[tidx].reader,
                            &mut staged,
                            &di,
                            opsize,
                            true,
                            verbosity,
                        )? {
                            break 'memrefs;
                        }
                    }
                }
            }
            if staged.len() >= MAX_COMBINED_ENTRIES {
                return Err(ConversionError::TooManyCombinedEntries);
            }
            self.out.write_all(&staged)?;
        }
        Ok(true)
    }

    /// Consumes one memref record for a memory operand and stages its data
    /// record. Returns `false` without consuming anything when the next
    /// record is not a memref: a predicated operand whose access did not
    /// fire, or a log that ends mid-block.
    fn append_memref(
        reader: &mut RecordReader<R>,
        staged: &mut Staged,
        di: &DecodedInstr,
        opsize: u16,
        write: bool,
        verbosity: Verbosity,
    ) -> Result<bool, ConversionError> {
        let addr = match reader.peek()? {
            Some(OfflineRecord::Memref { addr }) | Some(OfflineRecord::MemrefHigh { addr }) => {
                reader.next_record()?;
                addr
            }
            Some(other) => {
                // A predicated memref the runtime omitted. If the
                // instruction has several memory operands the instr and data
                // streams can desynchronize here; there is not enough
                // information in the log to tell which operand fired.
                vlog!(
                    verbosity,
                    Verbosity::Memrefs,
                    "missing memref (next record is {other:?})"
                );
                return Ok(false);
            }
            // Ran off the end of the log; the caller's next read warns.
            None => return Ok(false),
        };
        let (typ, size) = match di.data_kind {
            DataKind::Prefetch(typ) => (typ, 1),
            DataKind::Flush => (TraceType::DataFlush, opsize),
            DataKind::Plain if write => (TraceType::Write, opsize),
            DataKind::Plain => (TraceType::Read, opsize),
        };
        staged.push(TraceRecord {
            typ,
            size,
            addr,
        });
        vlog!(verbosity, Verbosity::Memrefs, "appended memref to {addr:#x}");
        Ok(true)
    }
}
