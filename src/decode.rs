//! One-shot instruction decoding with a per-address cache.
//!
//! Every unique decode address is decoded exactly once; the cache retains an
//! owned [DecodedInstr] summarizing everything the block expander needs
//! about the instruction (length, fetch classification, memory operands).
//! Since blocks repeat heavily in any real trace this avoids re-decoding the
//! same instruction on every one of its dynamic executions.

use crate::output::TraceType;
use iced_x86::{
    Code, Decoder, DecoderOptions, FlowControl, Instruction, InstructionInfoFactory, Mnemonic,
    OpAccess, OpKind,
};
use smallvec::SmallVec;
use std::collections::HashMap;

/// Pre-reserved cache capacity.
const DECODE_CACHE_BUCKETS: usize = 1 << 16;

/// How a memory reference from the stream should be typed in the output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DataKind {
    /// Plain load or store; typed by operand direction.
    Plain,
    /// A prefetch variant; emitted with size 1.
    Prefetch(TraceType),
    /// A cache line flush.
    Flush,
}

/// Everything the block expander needs to know about one decoded
/// instruction.
#[derive(Clone, Debug)]
pub(crate) struct DecodedInstr {
    pub(crate) len: usize,
    /// Output type of the instruction-fetch record.
    pub(crate) fetch_type: TraceType,
    pub(crate) is_cti: bool,
    /// A `rep`/`repne`-prefixed string primitive.
    pub(crate) rep_string: bool,
    pub(crate) data_kind: DataKind,
    /// Operand sizes in bytes of the memory operands read, in operand order.
    pub(crate) mem_srcs: SmallVec<[u16; 2]>,
    /// Operand sizes in bytes of the memory operands written.
    pub(crate) mem_dsts: SmallVec<[u16; 2]>,
}

impl DecodedInstr {
    /// True if executing the instruction reads or writes memory. Address
    /// computation without an access (`lea`, long `nop` forms) does not
    /// count.
    pub(crate) fn references_memory(&self) -> bool {
        !self.mem_srcs.is_empty() || !self.mem_dsts.is_empty()
    }
}

/// Maps a raw decode address to its retained [DecodedInstr].
pub(crate) struct DecodeCache {
    cache: HashMap<u64, DecodedInstr>,
    info_factory: InstructionInfoFactory,
    bitness: u32,
}

impl DecodeCache {
    pub(crate) fn new(bitness: u32) -> Self {
        Self {
            cache: HashMap::with_capacity(DECODE_CACHE_BUCKETS),
            info_factory: InstructionInfoFactory::new(),
            bitness,
        }
    }

    /// Decode the instruction starting at `bytes[0]`, memoized on `key` (the
    /// raw address the bytes were mapped at). `ip` is the original
    /// application address, so IP-relative operands resolve as they did when
    /// traced. Returns `None` for invalid or truncated instruction bytes.
    pub(crate) fn decode(&mut self, key: u64, bytes: &[u8], ip: u64) -> Option<&DecodedInstr> {
        if !self.cache.contains_key(&key) {
            let mut decoder = Decoder::with_ip(self.bitness, bytes, ip, DecoderOptions::NONE);
            let inst = decoder.decode();
            if inst.is_invalid() {
                return None;
            }
            self.cache.insert(key, classify(&inst, &mut self.info_factory));
        }
        self.cache.get(&key)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.cache.len()
    }
}

fn classify(inst: &Instruction, info_factory: &mut InstructionInfoFactory) -> DecodedInstr {
    let fetch_type = instr_fetch_type(inst);
    let is_cti = !matches!(fetch_type, TraceType::Instr);
    let rep_string =
        inst.is_string_instruction() && (inst.has_rep_prefix() || inst.has_repne_prefix());
    let data_kind = if let Some(t) = prefetch_type(inst.mnemonic()) {
        DataKind::Prefetch(t)
    } else if matches!(
        inst.mnemonic(),
        Mnemonic::Clflush | Mnemonic::Clflushopt | Mnemonic::Clwb
    ) {
        DataKind::Flush
    } else {
        DataKind::Plain
    };

    let mut mem_srcs = SmallVec::new();
    let mut mem_dsts = SmallVec::new();
    let info = info_factory.info(inst);
    for mem in info.used_memory() {
        let size = mem.memory_size().size() as u16;
        match mem.access() {
            OpAccess::Read | OpAccess::CondRead => mem_srcs.push(size),
            OpAccess::Write | OpAccess::CondWrite => mem_dsts.push(size),
            OpAccess::ReadWrite | OpAccess::ReadCondWrite => {
                mem_srcs.push(size);
                mem_dsts.push(size);
            }
            _ => (),
        }
    }
    // Prefetches and flushes touch a line without an architectural access;
    // the runtime still records a memref for them.
    if !matches!(data_kind, DataKind::Plain) && mem_srcs.is_empty() && mem_dsts.is_empty() {
        for i in 0..inst.op_count() {
            if op_kind_is_memory(inst.op_kind(i)) {
                mem_srcs.push(inst.memory_size().size() as u16);
            }
        }
    }

    DecodedInstr {
        len: inst.len(),
        fetch_type,
        is_cti,
        rep_string,
        data_kind,
        mem_srcs,
        mem_dsts,
    }
}

fn instr_fetch_type(inst: &Instruction) -> TraceType {
    // Syscalls decode with call flow control but do not end blocks the way
    // a cti does.
    if matches!(inst.code(), Code::Syscall | Code::Sysenter) {
        return TraceType::Instr;
    }
    match inst.flow_control() {
        FlowControl::UnconditionalBranch => TraceType::InstrDirectJump,
        FlowControl::IndirectBranch => TraceType::InstrIndirectJump,
        FlowControl::ConditionalBranch => TraceType::InstrConditionalJump,
        FlowControl::Call => TraceType::InstrDirectCall,
        FlowControl::IndirectCall => TraceType::InstrIndirectCall,
        FlowControl::Return => TraceType::InstrReturn,
        _ => TraceType::Instr,
    }
}

fn prefetch_type(mnemonic: Mnemonic) -> Option<TraceType> {
    match mnemonic {
        Mnemonic::Prefetcht0 => Some(TraceType::PrefetchT0),
        Mnemonic::Prefetcht1 => Some(TraceType::PrefetchT1),
        Mnemonic::Prefetcht2 => Some(TraceType::PrefetchT2),
        Mnemonic::Prefetchnta => Some(TraceType::PrefetchNta),
        Mnemonic::Prefetchw | Mnemonic::Prefetchwt1 => Some(TraceType::Prefetch),
        _ => None,
    }
}

fn op_kind_is_memory(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Memory
            | OpKind::MemorySegSI
            | OpKind::MemorySegESI
            | OpKind::MemorySegRSI
            | OpKind::MemorySegDI
            | OpKind::MemorySegEDI
            | OpKind::MemorySegRDI
            | OpKind::MemoryESDI
            | OpKind::MemoryESEDI
            | OpKind::MemoryESRDI
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> DecodedInstr {
        let mut cache = DecodeCache::new(64);
        cache.decode(0x1000, bytes, 0x40_0000).unwrap().clone()
    }

    #[test]
    fn load_has_one_source_memref() {
        // mov rax, [rcx]
        let di = decode_one(&[0x48, 0x8b, 0x01]);
        assert_eq!(di.len, 3);
        assert_eq!(di.fetch_type, TraceType::Instr);
        assert!(!di.is_cti);
        assert_eq!(di.mem_srcs.as_slice(), &[8]);
        assert!(di.mem_dsts.is_empty());
    }

    #[test]
    fn store_has_one_dest_memref() {
        // mov [rcx], rax
        let di = decode_one(&[0x48, 0x89, 0x01]);
        assert!(di.mem_srcs.is_empty());
        assert_eq!(di.mem_dsts.as_slice(), &[8]);
    }

    #[test]
    fn lea_references_no_memory() {
        // lea rax, [rcx]
        let di = decode_one(&[0x48, 0x8d, 0x01]);
        assert!(!di.references_memory());
    }

    #[test]
    fn push_writes_the_stack() {
        // push rax
        let di = decode_one(&[0x50]);
        assert!(di.mem_srcs.is_empty());
        assert_eq!(di.mem_dsts.as_slice(), &[8]);
    }

    #[test]
    fn cmps_reads_two_operands() {
        // cmpsb
        let di = decode_one(&[0xa6]);
        assert_eq!(di.mem_srcs.as_slice(), &[1, 1]);
        assert!(di.mem_dsts.is_empty());
        assert!(!di.rep_string);
    }

    #[test]
    fn rep_movs_is_a_rep_string_with_read_and_write() {
        // rep movsb
        let di = decode_one(&[0xf3, 0xa4]);
        assert!(di.rep_string);
        assert_eq!(di.mem_srcs.as_slice(), &[1]);
        assert_eq!(di.mem_dsts.as_slice(), &[1]);
    }

    #[test]
    fn cti_classification() {
        // ret
        let di = decode_one(&[0xc3]);
        assert!(di.is_cti);
        assert_eq!(di.fetch_type, TraceType::InstrReturn);
        // jz +2
        let di = decode_one(&[0x74, 0x02]);
        assert_eq!(di.fetch_type, TraceType::InstrConditionalJump);
        // jmp +2
        let di = decode_one(&[0xeb, 0x02]);
        assert_eq!(di.fetch_type, TraceType::InstrDirectJump);
        // call [rax]
        let di = decode_one(&[0xff, 0x10]);
        assert_eq!(di.fetch_type, TraceType::InstrIndirectCall);
    }

    #[test]
    fn prefetch_and_flush_consume_a_memref() {
        // prefetcht0 [rax]
        let di = decode_one(&[0x0f, 0x18, 0x08]);
        assert_eq!(di.data_kind, DataKind::Prefetch(TraceType::PrefetchT0));
        assert!(di.references_memory());
        // clflush [rax]
        let di = decode_one(&[0x0f, 0xae, 0x38]);
        assert_eq!(di.data_kind, DataKind::Flush);
        assert!(di.references_memory());
    }

    #[test]
    fn decodes_each_address_once() {
        let mut cache = DecodeCache::new(64);
        for _ in 0..10 {
            cache.decode(0x1000, &[0x48, 0x8b, 0x01], 0x40_0000).unwrap();
        }
        assert_eq!(cache.len(), 1);
        cache.decode(0x2000, &[0x48, 0x8b, 0x01], 0x40_0000).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalid_bytes_decode_to_none() {
        let mut cache = DecodeCache::new(64);
        // 0x06 is not a valid opcode in 64-bit mode.
        assert!(cache.decode(0x1000, &[0x06], 0x40_0000).is_none());
        assert!(cache.decode(0x1000, &[], 0x40_0000).is_none());
        assert_eq!(cache.len(), 0);
    }
}
