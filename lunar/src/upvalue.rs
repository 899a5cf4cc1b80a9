/// Upvalues.
///
/// An open upvalue aliases a live stack slot; every open upvalue of a
/// coroutine is linked into one list sorted by strictly decreasing stack
/// slot, headed in the CoroutineContext. Closing copies the value into
/// the upvalue's inline storage, repoints the cell pointer at it, and
/// unlinks the node. A frame's upvalues are closed when the frame
/// returns (and on UCLO / tail calls); the sort order makes that a pop
/// loop from the head.
///
/// Immutable captures never materialize an Upvalue object at all: the
/// closure stores the value directly (decided by the compiler-provided
/// upvalue metadata).

use crate::arena::{GeneralPtr, VmArena};
use crate::coroutine::{slot_ptr, CoroutineContext};
use crate::tvalue::{HeapHeader, HeapKind, TValue};

const AUX_CLOSED: u16 = 1;

#[repr(C)]
pub struct Upvalue {
    /// aux bit 0: closed.
    pub header: HeapHeader,
    /// Address of the value cell: a stack slot while open, the inline
    /// storage after close.
    pub ptr: u64,
    pub closed_value: u64,
    /// GeneralPtr raw of the next open upvalue (strictly lower slot).
    pub next_open: i32,
    /// Absolute stack slot while open.
    pub stack_slot: u32,
}

impl Upvalue {
    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.header.aux & AUX_CLOSED != 0
    }

    #[inline(always)]
    pub fn value(&self) -> TValue {
        unsafe { (self.ptr as *const TValue).read() }
    }

    #[inline(always)]
    pub fn set_value(&mut self, v: TValue) {
        unsafe { (self.ptr as *mut TValue).write(v) }
    }
}

#[inline(always)]
fn resolve(arena: &VmArena, g: i32) -> *mut Upvalue {
    GeneralPtr::<Upvalue>::from_raw(g).resolve(arena)
}

/// Find the open upvalue for `slot`, creating and linking one if absent.
/// Returns its GeneralPtr raw.
pub fn upvalue_for_slot(arena: &VmArena, co: *mut CoroutineContext, slot: u32) -> i32 {
    unsafe {
        // The list is sorted by decreasing slot; find the insertion point.
        let mut prev_link: *mut i32 = std::ptr::addr_of_mut!((*co).open_upvalues);
        let mut cur = *prev_link;
        while cur != 0 {
            let uv = resolve(arena, cur);
            if (*uv).stack_slot == slot {
                return cur;
            }
            if (*uv).stack_slot < slot {
                break;
            }
            prev_link = std::ptr::addr_of_mut!((*uv).next_open);
            cur = *prev_link;
        }

        let bytes = (std::mem::size_of::<Upvalue>() + 7) & !7;
        let uv = arena.alloc_user_ptr(bytes) as *mut Upvalue;
        HeapHeader::init(uv as *mut HeapHeader, HeapKind::Upvalue, 0, 0);
        (*uv).ptr = slot_ptr(co, slot) as u64;
        (*uv).closed_value = TValue::nil().raw();
        (*uv).next_open = cur;
        (*uv).stack_slot = slot;
        let g = GeneralPtr::<Upvalue>::from_addr(arena, uv as usize).raw();
        *prev_link = g;
        g
    }
}

/// Close every open upvalue at or above `from_slot`.
pub fn close_upvalues(arena: &VmArena, co: *mut CoroutineContext, from_slot: u32) {
    unsafe {
        let mut head = (*co).open_upvalues;
        while head != 0 {
            let uv = resolve(arena, head);
            if (*uv).stack_slot < from_slot {
                break;
            }
            (*uv).closed_value = ((*uv).ptr as *const u64).read();
            (*uv).ptr = std::ptr::addr_of_mut!((*uv).closed_value) as u64;
            (*uv).header.aux |= AUX_CLOSED;
            head = (*uv).next_open;
            (*uv).next_open = 0;
        }
        (*co).open_upvalues = head;
    }
}
