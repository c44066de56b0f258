//! The conversion driver.
//!
//! [Converter::convert] writes the output header, then merges the per-thread
//! raw logs until every thread has reached its footer, then writes the
//! output footer. The merge loop has two levels:
//!
//!  - *Selection*: every thread with no pending timestamp is advanced to its
//!    next TIMESTAMP record, then the thread with the smallest pending
//!    timestamp is selected (ties go to the lowest index). Selecting a
//!    thread clears its slot so a fresh timestamp is fetched on its next
//!    turn.
//!  - *Demultiplexing*: the selected thread's records are dispatched one at
//!    a time until one of them (a timestamp or the footer) requests
//!    reselection. Basic-block records hand off to the expander in `bb`.
//!
//! Thread-id and pid records that precede a thread's first timestamp are
//! queued and emitted when the thread is first selected, so that output
//! order remains governed solely by timestamps.

mod bb;

use crate::decode::DecodeCache;
use crate::errors::ConversionError;
use crate::log::{vlog, warn_msg, Verbosity};
use crate::modmap::{CustomModuleHooks, ModuleTable};
use crate::output::{TraceRecord, TraceType, TraceWriter};
use crate::record::{OfflineRecord, RecordReader, EXT_HEADER, OFFLINE_FILE_VERSION};
use std::io::{Read, Write};
use std::mem;

/// Upper bound on output records staged for one instruction.
pub const MAX_COMBINED_ENTRIES: usize = 32;

/// Configures and builds a [Converter].
pub struct ConverterBuilder<R: Read, W: Write> {
    module_map: Vec<u8>,
    thread_logs: Vec<R>,
    output: Option<W>,
    hooks: Option<Box<dyn CustomModuleHooks>>,
    verbosity: Verbosity,
    bitness: u32,
}

impl<R: Read, W: Write> ConverterBuilder<R, W> {
    pub fn new() -> Self {
        Self {
            module_map: Vec::new(),
            thread_logs: Vec::new(),
            output: None,
            hooks: None,
            verbosity: Verbosity::Disabled,
            bitness: 64,
        }
    }

    /// The module-map blob serialized by the instrumentation runtime.
    pub fn module_map(mut self, blob: Vec<u8>) -> Self {
        self.module_map = blob;
        self
    }

    /// Adds one per-thread raw log.
    pub fn thread_log(mut self, log: R) -> Self {
        self.thread_logs.push(log);
        self
    }

    pub fn output(mut self, output: W) -> Self {
        self.output = Some(output);
        self
    }

    /// Installs hooks for the user blob in each module's custom field.
    pub fn custom_hooks(mut self, hooks: Box<dyn CustomModuleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Bitness the traced application's code decodes in. Defaults to 64.
    pub fn bitness(mut self, bitness: u32) -> Self {
        self.bitness = bitness;
        self
    }

    /// Loads the module table and validates each thread log's version
    /// header.
    pub fn build(self) -> Result<Converter<R, W>, ConversionError> {
        let output = self
            .output
            .ok_or_else(|| ConversionError::Config("no output writer".to_owned()))?;
        if self.thread_logs.is_empty() {
            return Err(ConversionError::Config("no thread logs".to_owned()));
        }
        if !matches!(self.bitness, 16 | 32 | 64) {
            return Err(ConversionError::Config(format!(
                "invalid bitness {}",
                self.bitness
            )));
        }
        let modules = ModuleTable::load(self.module_map, self.hooks.as_deref(), self.verbosity)?;
        let mut threads = Vec::with_capacity(self.thread_logs.len());
        for log in self.thread_logs {
            let mut reader = RecordReader::new(log);
            check_thread_log(&mut reader)?;
            threads.push(ThreadState::new(reader));
        }
        Ok(Converter {
            modules,
            threads,
            out: TraceWriter::new(output),
            cache: DecodeCache::new(self.bitness),
            verbosity: self.verbosity,
            instrs_are_separate: false,
            prev_instr_was_rep_string: false,
        })
    }
}

/// Verifies the version header leading one thread log.
fn check_thread_log<R: Read>(reader: &mut RecordReader<R>) -> Result<(), ConversionError> {
    match reader.next_record() {
        Ok(Some(OfflineRecord::Header { version })) if version == OFFLINE_FILE_VERSION => Ok(()),
        Ok(Some(OfflineRecord::Header { version })) => Err(ConversionError::VersionMismatch {
            expect: OFFLINE_FILE_VERSION,
            got: version,
        }),
        Ok(Some(_)) => Err(ConversionError::MissingVersionEntry),
        Ok(None) | Err(_) => Err(ConversionError::UnreadableThreadLog),
    }
}

struct ThreadState<R: Read> {
    reader: RecordReader<R>,
    tid: Option<u64>,
    /// Pending timestamp; 0 means one must be fetched before selection.
    time: u64,
    done: bool,
    /// Markers seen before the thread's first timestamp, emitted when the
    /// thread is first selected.
    pending: Vec<TraceRecord>,
}

impl<R: Read> ThreadState<R> {
    fn new(reader: RecordReader<R>) -> Self {
        Self {
            reader,
            tid: None,
            time: 0,
            done: false,
            pending: Vec::new(),
        }
    }
}

/// What the demultiplexer wants the merge loop to do next.
enum Step {
    /// Keep reading the same thread.
    Continue,
    /// Re-run thread selection.
    Reselect,
    /// The thread reached its footer.
    Exited,
}

/// Converts a set of per-thread raw logs into one time-ordered analysis
/// trace. Built by [ConverterBuilder]; mapped module images and cached
/// decodings are released on drop.
pub struct Converter<R: Read, W: Write> {
    modules: ModuleTable,
    threads: Vec<ThreadState<R>>,
    out: TraceWriter<W>,
    cache: DecodeCache,
    verbosity: Verbosity,
    /// Latched once an L0-filtered (count 0) block is seen; from then on
    /// instruction and data records arrive separately.
    instrs_are_separate: bool,
    prev_instr_was_rep_string: bool,
}

impl<R: Read, W: Write> Converter<R, W> {
    /// Runs the conversion to completion. Call once.
    pub fn convert(&mut self) -> Result<(), ConversionError> {
        self.out.header()?;
        self.merge_thread_logs()?;
        self.out.footer()?;
        vlog!(
            self.verbosity,
            Verbosity::Summary,
            "successfully converted {} thread logs",
            self.threads.len()
        );
        Ok(())
    }

    fn merge_thread_logs(&mut self) -> Result<(), ConversionError> {
        let mut live = self.threads.len();
        let mut last_bb_handled = true;
        let mut cur = None;
        while live > 0 {
            let tidx = match cur {
                Some(tidx) => tidx,
                None => match self.select_next_thread(&mut live)? {
                    Some(tidx) => tidx,
                    // Every remaining thread exited during refill.
                    None => break,
                },
            };
            cur = match self.process_one(tidx, &mut last_bb_handled)? {
                Step::Continue => Some(tidx),
                Step::Reselect => None,
                Step::Exited => {
                    live -= 1;
                    None
                }
            };
        }
        Ok(())
    }

    /// Fetches a timestamp for every thread that needs one, then picks the
    /// thread with the smallest pending timestamp. Ties go to the lowest
    /// index.
    fn select_next_thread(&mut self, live: &mut usize) -> Result<Option<usize>, ConversionError> {
        for i in 0..self.threads.len() {
            while !self.threads[i].done && self.threads[i].time == 0 {
                match self.threads[i].reader.next_record()? {
                    Some(OfflineRecord::Timestamp { usec }) => {
                        vlog!(
                            self.verbosity,
                            Verbosity::Blocks,
                            "thread {} timestamp is @{usec:#x}",
                            self.thread_label(i)
                        );
                        self.threads[i].time = usec;
                    }
                    Some(OfflineRecord::Thread { tid }) => {
                        if self.threads[i].tid.is_none() {
                            self.threads[i].tid = Some(tid);
                        }
                        self.threads[i]
                            .pending
                            .push(TraceRecord::marker(TraceType::Thread, tid));
                    }
                    Some(OfflineRecord::Pid { pid }) => self.threads[i]
                        .pending
                        .push(TraceRecord::marker(TraceType::Pid, pid)),
                    Some(OfflineRecord::Footer) => {
                        if self.threads[i].reader.next_record()?.is_some() {
                            return Err(ConversionError::FooterNotLast);
                        }
                        self.finish_thread(i)?;
                        *live -= 1;
                    }
                    Some(_) => return Err(ConversionError::MissingTimestamp),
                    None => {
                        self.warn_truncated(i);
                        self.finish_thread(i)?;
                        *live -= 1;
                    }
                }
            }
        }

        let mut min_time = u64::MAX;
        let mut next = None;
        for (i, t) in self.threads.iter().enumerate() {
            if !t.done && t.time != 0 && t.time < min_time {
                min_time = t.time;
                next = Some(i);
            }
        }
        let Some(tidx) = next else {
            return Ok(None);
        };
        vlog!(
            self.verbosity,
            Verbosity::Threads,
            "next thread in timestamp order is {} @{min_time:#x}",
            self.thread_label(tidx)
        );
        // Force a fresh timestamp before this thread's next selection.
        self.threads[tidx].time = 0;
        let pending = mem::take(&mut self.threads[tidx].pending);
        if !pending.is_empty() {
            self.out.write_all(&pending)?;
        } else if let Some(tid) = self.threads[tidx].tid {
            self.out.write(&TraceRecord::marker(TraceType::Thread, tid))?;
        }
        Ok(Some(tidx))
    }

    /// Reads and dispatches one record of thread `tidx`.
    fn process_one(
        &mut self,
        tidx: usize,
        last_bb_handled: &mut bool,
    ) -> Result<Step, ConversionError> {
        let rec = match self.threads[tidx].reader.next_record()? {
            Some(rec) => rec,
            None => {
                // Keep what we have rather than failing the whole
                // conversion; the disk may simply have filled up.
                self.warn_truncated(tidx);
                OfflineRecord::Footer
            }
        };
        match rec {
            OfflineRecord::Footer => {
                if self.threads[tidx].reader.next_record()?.is_some() {
                    return Err(ConversionError::FooterNotLast);
                }
                self.finish_thread(tidx)?;
                Ok(Step::Exited)
            }
            OfflineRecord::Header { .. } => Err(ConversionError::InvalidExtension(EXT_HEADER)),
            OfflineRecord::Timestamp { usec } => {
                vlog!(
                    self.verbosity,
                    Verbosity::Threads,
                    "thread {} timestamp {usec:#x}",
                    self.thread_label(tidx)
                );
                self.threads[tidx].time = usec;
                Ok(Step::Reselect)
            }
            OfflineRecord::Pc {
                modidx,
                modoffs,
                instr_count,
            } => {
                *last_bb_handled = self.append_bb(tidx, modidx, modoffs, instr_count)?;
                Ok(Step::Continue)
            }
            OfflineRecord::Memref { addr } | OfflineRecord::MemrefHigh { addr } => {
                if *last_bb_handled {
                    // An instruction record should have come first.
                    return Err(ConversionError::MemrefOutsideBlock);
                }
                // Non-module code: no decodable block to attribute this to,
                // so emit a best-effort guess.
                vlog!(
                    self.verbosity,
                    Verbosity::Memrefs,
                    "appended non-module memref to {addr:#x}"
                );
                self.out.write(&TraceRecord {
                    typ: TraceType::Read,
                    size: 1,
                    addr,
                })?;
                Ok(Step::Continue)
            }
            OfflineRecord::Thread { tid } => {
                vlog!(self.verbosity, Verbosity::Threads, "thread {tid} entry");
                if self.threads[tidx].tid.is_none() {
                    self.threads[tidx].tid = Some(tid);
                }
                self.out.write(&TraceRecord::marker(TraceType::Thread, tid))?;
                Ok(Step::Continue)
            }
            OfflineRecord::Pid { pid } => {
                vlog!(self.verbosity, Verbosity::Threads, "process {pid} entry");
                self.out.write(&TraceRecord::marker(TraceType::Pid, pid))?;
                Ok(Step::Continue)
            }
            OfflineRecord::IFlush { addr: start } => {
                let Some(OfflineRecord::IFlush { addr: end }) =
                    self.threads[tidx].reader.next_record()?
                else {
                    return Err(ConversionError::FlushMissingSecondEntry);
                };
                vlog!(
                    self.verbosity,
                    Verbosity::Threads,
                    "flush {start:#x}-{end:#x}"
                );
                self.out.write(&TraceRecord {
                    typ: TraceType::InstrFlush,
                    size: end.wrapping_sub(start) as u16,
                    addr: start,
                })?;
                Ok(Step::Continue)
            }
        }
    }

    /// Emits the thread-exit marker for `tidx` and marks it done. Any
    /// still-queued start-of-thread markers go out first.
    fn finish_thread(&mut self, tidx: usize) -> Result<(), ConversionError> {
        let pending = mem::take(&mut self.threads[tidx].pending);
        self.out.write_all(&pending)?;
        let tid = self.threads[tidx]
            .tid
            .ok_or(ConversionError::MissingThreadId)?;
        vlog!(self.verbosity, Verbosity::Threads, "thread {tid} exit");
        self.out
            .write(&TraceRecord::marker(TraceType::ThreadExit, tid))?;
        self.threads[tidx].done = true;
        Ok(())
    }

    fn warn_truncated(&self, tidx: usize) {
        if self.threads[tidx].reader.truncated() {
            warn_msg!(
                "input file for thread {} ends mid-record",
                self.thread_label(tidx)
            );
        } else {
            warn_msg!("input file for thread {} is truncated", self.thread_label(tidx));
        }
    }

    fn thread_label(&self, tidx: usize) -> String {
        match self.threads[tidx].tid {
            Some(tid) => format!("{tid}"),
            None => format!("#{tidx}"),
        }
    }
}
