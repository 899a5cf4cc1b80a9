/// Stack frame layout.
///
///     [ ... variadic args ... ] [ header: 4 slots ] [ locals ... ]
///                                                   ^ frame base
///
/// Header slots, lowest first (the function MUST be first: a call site
/// stages the callee into that slot before the header is completed):
///
///   [0] function            raw TValue
///   [1] caller frame base   u64 slot index; ROOT_FRAME_SENTINEL at root
///   [2] (caller bytecode offset << 32) | return continuation
///   [3] number of variadic arguments
///
/// The return continuation is a closed sum type packed into 32 bits: a
/// tag plus an optional payload (the concat continuation's scan cursor).
/// Continuations replace raw return-address function pointers; the
/// interpreter trampoline matches on them exhaustively.

use crate::coroutine::{slot_ptr, CoroutineContext};
use crate::tvalue::TValue;

pub const FRAME_HEADER_SLOTS: u32 = 4;
pub const ROOT_FRAME_SENTINEL: u64 = u64::MAX;

/// Return values are nil-padded to at least this many slots, so callers
/// consuming a fixed small number of results never read stale memory.
pub const MIN_NIL_FILL_RETURN_VALUES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetCont {
    /// Returning from the launched function: leave the interpreter.
    Root,
    /// An ordinary call op; the continuation re-reads the op bytes at the
    /// recorded caller bytecode offset to place the results.
    CallOp,
    /// Metamethod of an arithmetic / unary / length op: store result 0
    /// into the op's destination and advance.
    ArithResume,
    /// Metamethod of a compare-and-branch op: branch on the truthiness of
    /// result 0 (negated for the IsN* forms).
    CompareResume,
    /// `__index` call: store result 0 into the get op's destination.
    IndexResume,
    /// `__newindex` call: discard results and advance.
    NewIndexResume,
    /// `__concat` call: result 0 becomes the running accumulator; the
    /// payload is the operand index the scan resumes from.
    ConcatResume(u32),
    /// pcall/xpcall: the callee returned without error.
    PcallSuccess,
    XpcallSuccess,
    /// An xpcall error handler returned.
    ErrorReturn,
}

const TAG_ROOT: u32 = 0;
const TAG_CALL_OP: u32 = 1;
const TAG_ARITH: u32 = 2;
const TAG_COMPARE: u32 = 3;
const TAG_INDEX: u32 = 4;
const TAG_NEWINDEX: u32 = 5;
const TAG_CONCAT: u32 = 6;
const TAG_PCALL: u32 = 7;
const TAG_XPCALL: u32 = 8;
const TAG_ERROR_RETURN: u32 = 9;

impl RetCont {
    #[inline(always)]
    pub fn encode(self) -> u32 {
        match self {
            RetCont::Root => TAG_ROOT,
            RetCont::CallOp => TAG_CALL_OP,
            RetCont::ArithResume => TAG_ARITH,
            RetCont::CompareResume => TAG_COMPARE,
            RetCont::IndexResume => TAG_INDEX,
            RetCont::NewIndexResume => TAG_NEWINDEX,
            RetCont::ConcatResume(i) => TAG_CONCAT | (i << 8),
            RetCont::PcallSuccess => TAG_PCALL,
            RetCont::XpcallSuccess => TAG_XPCALL,
            RetCont::ErrorReturn => TAG_ERROR_RETURN,
        }
    }

    #[inline(always)]
    pub fn decode(raw: u32) -> RetCont {
        match raw & 0xFF {
            TAG_ROOT => RetCont::Root,
            TAG_CALL_OP => RetCont::CallOp,
            TAG_ARITH => RetCont::ArithResume,
            TAG_COMPARE => RetCont::CompareResume,
            TAG_INDEX => RetCont::IndexResume,
            TAG_NEWINDEX => RetCont::NewIndexResume,
            TAG_CONCAT => RetCont::ConcatResume(raw >> 8),
            TAG_PCALL => RetCont::PcallSuccess,
            TAG_XPCALL => RetCont::XpcallSuccess,
            TAG_ERROR_RETURN => RetCont::ErrorReturn,
            _ => unreachable!("corrupt return continuation"),
        }
    }
}

/// Frame header accessor bound to a frame base (the slot index of local
/// 0). All reads and writes go straight to the coroutine stack.
#[derive(Clone, Copy)]
pub struct FrameHeader {
    pub base: u32,
}

impl FrameHeader {
    #[inline(always)]
    pub fn new(base: u32) -> Self {
        debug_assert!(base >= FRAME_HEADER_SLOTS);
        FrameHeader { base }
    }

    #[inline(always)]
    fn hdr_ptr(self, co: *const CoroutineContext, slot: u32) -> *mut u64 {
        slot_ptr(co, self.base - FRAME_HEADER_SLOTS + slot) as *mut u64
    }

    #[inline(always)]
    pub fn func(self, co: *const CoroutineContext) -> TValue {
        unsafe { TValue::from_raw(self.hdr_ptr(co, 0).read()) }
    }

    #[inline(always)]
    pub fn set_func(self, co: *const CoroutineContext, f: TValue) {
        unsafe { self.hdr_ptr(co, 0).write(f.raw()) }
    }

    #[inline(always)]
    pub fn caller_base(self, co: *const CoroutineContext) -> u64 {
        unsafe { self.hdr_ptr(co, 1).read() }
    }

    #[inline(always)]
    pub fn set_caller_base(self, co: *const CoroutineContext, b: u64) {
        unsafe { self.hdr_ptr(co, 1).write(b) }
    }

    #[inline(always)]
    pub fn ret_cont(self, co: *const CoroutineContext) -> RetCont {
        unsafe { RetCont::decode(self.hdr_ptr(co, 2).read() as u32) }
    }

    #[inline(always)]
    pub fn caller_bytecode_offset(self, co: *const CoroutineContext) -> u32 {
        unsafe { (self.hdr_ptr(co, 2).read() >> 32) as u32 }
    }

    #[inline(always)]
    pub fn set_return(self, co: *const CoroutineContext, cont: RetCont, caller_bcu: u32) {
        unsafe {
            self.hdr_ptr(co, 2)
                .write(((caller_bcu as u64) << 32) | cont.encode() as u64)
        }
    }

    #[inline(always)]
    pub fn num_varargs(self, co: *const CoroutineContext) -> u32 {
        unsafe { self.hdr_ptr(co, 3).read() as u32 }
    }

    #[inline(always)]
    pub fn set_num_varargs(self, co: *const CoroutineContext, n: u32) {
        unsafe { self.hdr_ptr(co, 3).write(n as u64) }
    }

    /// Slot index of the first variadic argument.
    #[inline(always)]
    pub fn varargs_start(self, co: *const CoroutineContext) -> u32 {
        self.base - FRAME_HEADER_SLOTS - self.num_varargs(co)
    }

    /// Lowest slot index occupied by this frame (variadic region start).
    #[inline(always)]
    pub fn frame_start(self, co: *const CoroutineContext) -> u32 {
        self.varargs_start(co)
    }

    #[inline(always)]
    pub fn is_root(self, co: *const CoroutineContext) -> bool {
        self.caller_base(co) == ROOT_FRAME_SENTINEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::VmArena;
    use crate::coroutine::coroutine_new;

    #[test]
    fn test_retcont_roundtrip() {
        let all = [
            RetCont::Root,
            RetCont::CallOp,
            RetCont::ArithResume,
            RetCont::CompareResume,
            RetCont::IndexResume,
            RetCont::NewIndexResume,
            RetCont::ConcatResume(0),
            RetCont::ConcatResume(12345),
            RetCont::PcallSuccess,
            RetCont::XpcallSuccess,
            RetCont::ErrorReturn,
        ];
        for c in all {
            assert_eq!(RetCont::decode(c.encode()), c);
        }
    }

    #[test]
    fn test_header_fields_roundtrip() {
        let arena = VmArena::new().unwrap();
        let co = coroutine_new(&arena, 0, 128);
        let h = FrameHeader::new(10);
        h.set_func(co, TValue::int32(7));
        h.set_caller_base(co, 4);
        h.set_return(co, RetCont::ConcatResume(3), 0xABCD);
        h.set_num_varargs(co, 2);
        assert_eq!(h.func(co), TValue::int32(7));
        assert_eq!(h.caller_base(co), 4);
        assert_eq!(h.ret_cont(co), RetCont::ConcatResume(3));
        assert_eq!(h.caller_bytecode_offset(co), 0xABCD);
        assert_eq!(h.num_varargs(co), 2);
        assert_eq!(h.varargs_start(co), 10 - 4 - 2);
        assert!(!h.is_root(co));
        h.set_caller_base(co, ROOT_FRAME_SENTINEL);
        assert!(h.is_root(co));
    }
}
