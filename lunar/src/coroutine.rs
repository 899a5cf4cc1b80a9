/// Per-coroutine runtime state.
///
/// One CoroutineContext per coroutine, allocated in the user heap next to
/// its stack buffer. The engine is single-threaded and cooperative; only
/// the root coroutine runs today, but everything that is per-flow lives
/// here rather than on the VM: the current code block, the staged
/// variadic-return window, the open-upvalue list, and the stack itself.

use crate::arena::VmArena;
use crate::tvalue::{HeapHeader, HeapKind, TValue};

/// `variadic_ret_count` value meaning "no variadic return staged".
pub const NO_VARIADIC_RET: u32 = u32::MAX;

pub const DEFAULT_STACK_SLOTS: u32 = 1 << 16;

#[repr(C)]
pub struct CoroutineContext {
    pub header: HeapHeader,
    /// CodeBlockId of the function currently executing (diagnostics; the
    /// interpreter state carries the authoritative copy).
    pub cur_code_block: u32,
    /// GeneralPtr raw of this coroutine's global object.
    pub global_object: i32,
    /// Number of staged variadic return values, or NO_VARIADIC_RET.
    pub variadic_ret_count: u32,
    /// Absolute stack slot index where the staged values start.
    pub variadic_ret_slot: u32,
    /// GeneralPtr raw of the highest-slot open upvalue; 0 when none.
    pub open_upvalues: i32,
    /// Address of stack slot 0.
    pub stack_base: u64,
    pub stack_capacity: u32,
    pub _pad: u32,
}

pub fn coroutine_new(arena: &VmArena, global_object: i32, stack_slots: u32) -> *mut CoroutineContext {
    let bytes = (std::mem::size_of::<CoroutineContext>() + 7) & !7;
    let co = arena.alloc_user_ptr(bytes) as *mut CoroutineContext;
    let stack = arena.alloc_user_ptr(stack_slots as usize * 8);
    HeapHeader::init(co as *mut HeapHeader, HeapKind::Thread, 0, 0);
    unsafe {
        (*co).cur_code_block = 0;
        (*co).global_object = global_object;
        (*co).variadic_ret_count = NO_VARIADIC_RET;
        (*co).variadic_ret_slot = 0;
        (*co).open_upvalues = 0;
        (*co).stack_base = stack as u64;
        (*co).stack_capacity = stack_slots;
        (*co)._pad = 0;
    }
    co
}

/// Address of absolute stack slot `i`.
#[inline(always)]
pub fn slot_ptr(co: *const CoroutineContext, i: u32) -> *mut TValue {
    unsafe { ((*co).stack_base as *mut TValue).add(i as usize) }
}

#[inline(always)]
pub fn slot_read(co: *const CoroutineContext, i: u32) -> TValue {
    unsafe { slot_ptr(co, i).read() }
}

#[inline(always)]
pub fn slot_write(co: *const CoroutineContext, i: u32, v: TValue) {
    unsafe { slot_ptr(co, i).write(v) }
}

/// Slot index of an in-stack address (the inverse of `slot_ptr`).
#[inline(always)]
pub fn slot_index_of(co: *const CoroutineContext, addr: usize) -> u32 {
    unsafe { ((addr - (*co).stack_base as usize) / 8) as u32 }
}
