/// Watchpoint sets: the dependency-tracking primitive used to invalidate
/// speculative assumptions (cached code specializations, metatable-absent
/// checks, ...).
///
/// A set is in one of three states: Clear, Watching, Invalidated. The
/// entire set is ONE word: an i32 byte offset from the VM base. Values 1
/// and 2 are the Clear / Invalidated sentinels; otherwise the word is the
/// head of an unordered doubly linked list of watchpoint nodes, with a
/// twist that keeps the head single-width:
///
///   * the `prev` link of the first element points one word (4 bytes)
///     before the head cell, so that cell's `next` slot IS the head;
///   * the `next` link of the last element points at the head cell, so
///     that cell's `prev` slot IS the head;
///   * the head itself points at either the first or the last element,
///     or at its own cell when the list is empty.
///
/// Removal is the standard two-store unlink and never needs to know which
/// end the head currently favors; insertion checks which invariant holds.
///
/// Nodes and sets live in the SPDS region (sets may also sit in the
/// system heap); links are 4-byte offsets either way. `invalidate`
/// unlinks every node, publishes the Invalidated sentinel with release
/// ordering, then fires; re-entrant invalidation during firing observes
/// the sentinel and is a no-op. Invalidated is terminal.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::arena::VmArena;

const HEAD_CLEAR: i32 = 1;
const HEAD_INVALIDATED: i32 = 2;

pub const WATCHPOINT_SET_SIZE: u32 = 8;
pub const WATCHPOINT_NODE_SIZE: u32 = 24;

/// Fired when a cached code specialization must be dropped. The payload
/// is the address of the owner's jettison flag; firing stores 1.
pub const WP_KIND_CODE_JETTISON: u32 = 1;
/// Firing increments the AtomicU32 at the payload address. Used by tests
/// and by hosts that only need a violation count.
pub const WP_KIND_COUNTER: u32 = 2;

#[repr(C)]
pub struct WatchpointSet {
    head: AtomicI32,
    _pad: u32,
}

#[repr(C)]
pub struct WatchpointNode {
    prev: i32,
    next: i32,
    kind: u32,
    _pad: u32,
    payload: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchpointState {
    Clear,
    Watching,
    Invalidated,
}

#[inline(always)]
fn cell(arena: &VmArena, off: i32) -> *mut i32 {
    (arena.base() as i64 + off as i64) as *mut i32
}

#[inline(always)]
fn node(arena: &VmArena, off: i32) -> *mut WatchpointNode {
    (arena.base() as i64 + off as i64) as *mut WatchpointNode
}

#[inline(always)]
fn set_ptr(arena: &VmArena, off: i32) -> *const AtomicI32 {
    (arena.base() as i64 + off as i64) as *const AtomicI32
}

/// Initialize a freshly allocated set (offset of an 8-byte SPDS or
/// system heap cell) into the Clear state.
pub fn wps_init(arena: &VmArena, set: i32) {
    unsafe {
        (*set_ptr(arena, set)).store(HEAD_CLEAR, Ordering::Release);
    }
}

/// Initialize a freshly allocated node.
pub fn wpn_init(arena: &VmArena, node_off: i32, kind: u32, payload: u64) {
    unsafe {
        node(arena, node_off).write(WatchpointNode {
            prev: 0,
            next: 0,
            kind,
            _pad: 0,
            payload,
        });
    }
}

pub fn wps_state(arena: &VmArena, set: i32) -> WatchpointState {
    let head = unsafe { (*set_ptr(arena, set)).load(Ordering::Acquire) };
    match head {
        HEAD_CLEAR => WatchpointState::Clear,
        HEAD_INVALIDATED => WatchpointState::Invalidated,
        _ => WatchpointState::Watching,
    }
}

/// Clear -> Watching (with an empty list). Watching is a no-op.
pub fn wps_start_watching(arena: &VmArena, set: i32) {
    let p = unsafe { &*set_ptr(arena, set) };
    let head = p.load(Ordering::Acquire);
    assert!(head != HEAD_INVALIDATED, "cannot re-watch an invalidated set");
    if head == HEAD_CLEAR {
        p.store(set, Ordering::Release);
    }
}

/// Install `node_off` into the set. The node must not currently be
/// installed anywhere. Transitions Clear -> Watching first if needed.
pub fn wps_add_watchpoint(arena: &VmArena, set: i32, node_off: i32) {
    wps_start_watching(arena, set);
    unsafe {
        let n = node(arena, node_off);
        debug_assert!((*n).prev == 0 && (*n).next == 0, "node already installed");
        let p = &*set_ptr(arena, set);
        let head = p.load(Ordering::Acquire);
        debug_assert!(head != HEAD_CLEAR && head != HEAD_INVALIDATED);
        if head == set {
            // Empty list: the node is both first and last.
            (*n).prev = set - 4;
            (*n).next = set;
        } else if (*node(arena, head)).prev == set - 4 {
            // Head points at the first element: prepend.
            (*n).prev = set - 4;
            (*n).next = head;
            (*node(arena, head)).prev = node_off;
        } else {
            // Head points at the last element: append.
            debug_assert!((*node(arena, head)).next == set);
            (*n).prev = head;
            (*n).next = set;
            (*node(arena, head)).next = node_off;
        }
        p.store(node_off, Ordering::Release);
    }
}

/// Unlink a node from whatever set it is installed in.
pub fn wpn_remove(arena: &VmArena, node_off: i32) {
    unsafe {
        let n = node(arena, node_off);
        let (prev, next) = ((*n).prev, (*n).next);
        debug_assert!(prev != 0 && next != 0, "node not installed");
        // Order matters: the first store repoints the head at the surviving
        // neighbor when this was the last element.
        cell(arena, next).write(prev);
        cell(arena, prev + 4).write(next);
        (*n).prev = 0;
        (*n).next = 0;
    }
}

fn collect_and_clear(arena: &VmArena, set: i32) -> Vec<(u32, u64)> {
    let p = unsafe { &*set_ptr(arena, set) };
    let head = p.load(Ordering::Acquire);
    let mut fired = Vec::new();
    if head != set && head != HEAD_CLEAR && head != HEAD_INVALIDATED {
        unsafe {
            if (*node(arena, head)).prev == set - 4 {
                // Forward walk from the first element.
                let mut cur = head;
                while cur != set {
                    let n = node(arena, cur);
                    fired.push(((*n).kind, (*n).payload));
                    let next = (*n).next;
                    (*n).prev = 0;
                    (*n).next = 0;
                    cur = next;
                }
            } else {
                // Backward walk from the last element.
                let mut cur = head;
                while cur != set - 4 {
                    let n = node(arena, cur);
                    fired.push(((*n).kind, (*n).payload));
                    let prev = (*n).prev;
                    (*n).prev = 0;
                    (*n).next = 0;
                    cur = prev;
                }
            }
        }
    }
    fired
}

fn fire(kind: u32, payload: u64) {
    match kind {
        WP_KIND_CODE_JETTISON => unsafe {
            (*(payload as *const AtomicU32)).store(1, Ordering::Release);
        },
        WP_KIND_COUNTER => unsafe {
            (*(payload as *const AtomicU32)).fetch_add(1, Ordering::AcqRel);
        },
        _ => unreachable!("unknown watchpoint kind {}", kind),
    }
}

/// Unlink every node, publish Invalidated, then fire each node once.
pub fn wps_invalidate(arena: &VmArena, set: i32) {
    let p = unsafe { &*set_ptr(arena, set) };
    let head = p.load(Ordering::Acquire);
    if head == HEAD_INVALIDATED {
        return;
    }
    if head == HEAD_CLEAR {
        p.store(HEAD_INVALIDATED, Ordering::Release);
        return;
    }
    let fired = collect_and_clear(arena, set);
    p.store(HEAD_INVALIDATED, Ordering::Release);
    for (kind, payload) in fired {
        fire(kind, payload);
    }
}

/// Like `wps_invalidate` but transfers the nodes to `deferred`; they fire
/// (in unspecified order) when the deferred object is dropped.
pub fn wps_invalidate_deferred(arena: &VmArena, set: i32, deferred: &mut DeferredWatchpointFire) {
    let p = unsafe { &*set_ptr(arena, set) };
    let head = p.load(Ordering::Acquire);
    if head == HEAD_INVALIDATED {
        return;
    }
    if head == HEAD_CLEAR {
        p.store(HEAD_INVALIDATED, Ordering::Release);
        return;
    }
    let fired = collect_and_clear(arena, set);
    p.store(HEAD_INVALIDATED, Ordering::Release);
    deferred.pending.extend(fired);
}

/// A slow path observed a violation of whatever this set guards.
pub fn wps_handle_slowpath_violation(arena: &VmArena, set: i32) {
    match wps_state(arena, set) {
        WatchpointState::Clear => {}
        _ => wps_invalidate(arena, set),
    }
}

/// Holds watchpoints whose firing was deferred by the caller; firing
/// happens on drop, after the caller has finished whatever mutation made
/// immediate firing unsafe.
#[derive(Default)]
pub struct DeferredWatchpointFire {
    pending: Vec<(u32, u64)>,
}

impl DeferredWatchpointFire {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Drop for DeferredWatchpointFire {
    fn drop(&mut self) {
        for (kind, payload) in self.pending.drain(..) {
            fire(kind, payload);
        }
    }
}
