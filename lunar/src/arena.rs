/// Virtual address arena.
///
/// One 18 GB reservation, aligned so the VM base address `V` is a multiple
/// of 32 GB. The reservation is carved into:
///
///   [ V-16GB .. V-4GB )   user heap    (grows DOWNWARD, bump allocated)
///   [ V-4GB  .. V-2GB )   padding      (never committed)
///   [ V-2GB  .. V     )   SPDS region  (4 KB pages handed out downward)
///   [ V      .. V+2GB )   system heap  (grows UPWARD, bump allocated)
///
/// Every heap object is 8-byte aligned, which makes three compressed
/// pointer encodings possible:
///
///   SystemPtr<T>  - u32 byte offset from V (system heap only)
///   SpdsPtr<T>    - negative i32 byte offset from V (SPDS region)
///   GeneralPtr<T> - i32 of (signed byte offset from V) >> 3; reaches
///                   every sub-heap because objects are 8-aligned
///
/// The compressed forms resolve through an explicit `&VmArena`; there is
/// no segment register or thread-local base. Memory is committed on
/// demand with chunk sizes that ramp 4K -> 8K -> 16K -> 32K -> 64K so a
/// short-lived VM touches only a few pages.
///
/// Region overflow is a fatal resource-exhaustion error and aborts.

use std::cell::Cell;
use std::marker::PhantomData;

use tracing::warn;

pub const PAGE_SIZE: usize = 4096;
pub const VM_LAYOUT_LENGTH: usize = 18 << 30;
pub const VM_LAYOUT_ALIGNMENT: usize = 32 << 30;
/// Offset of the VM base from the start of the reservation.
pub const VM_BASE_OFFSET: usize = 16 << 30;
pub const USER_HEAP_SIZE: usize = 12 << 30;
pub const SPDS_REGION_SIZE: usize = 2 << 30;
pub const SYSTEM_HEAP_SIZE: usize = 2 << 30;

/// The user heap occupies [V - 16GB, V - 4GB) and is bump-allocated from
/// the top (offset -4GB) downward.
const USER_HEAP_TOP_OFFSET: i64 = -((4usize << 30) as i64);
const USER_HEAP_BOTTOM_OFFSET: i64 = -(VM_BASE_OFFSET as i64);

const COMMIT_CHUNK_INITIAL: usize = 4 * 1024;
const COMMIT_CHUNK_MAX: usize = 64 * 1024;

/// The first system heap page is reserved: compressed offset 0 stays
/// invalid (doubles as the null SystemPtr) and offset 8 is free for use
/// as the poly-metatable sentinel.
pub const SYSTEM_HEAP_RESERVED: u32 = PAGE_SIZE as u32;

#[cold]
fn fatal_oom(what: &'static str) -> ! {
    eprintln!("resource limit exceeded: {}", what);
    std::process::abort();
}

// ---------------------------------------------------------------------------
// Compressed pointers
// ---------------------------------------------------------------------------

/// u32 byte offset from the VM base into the system heap. Offset 0 is null.
#[repr(transparent)]
pub struct SystemPtr<T> {
    off: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SystemPtr<T> {
    pub const NULL: SystemPtr<T> = SystemPtr { off: 0, _marker: PhantomData };

    #[inline(always)]
    pub fn from_raw(off: u32) -> Self {
        SystemPtr { off, _marker: PhantomData }
    }

    #[inline(always)]
    pub fn raw(self) -> u32 {
        self.off
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.off == 0
    }

    #[inline(always)]
    pub fn resolve(self, arena: &VmArena) -> *mut T {
        debug_assert!(!self.is_null());
        (arena.base + self.off as usize) as *mut T
    }

    /// Reinterpret as a pointer to a different system heap type.
    #[inline(always)]
    pub fn cast<U>(self) -> SystemPtr<U> {
        SystemPtr::from_raw(self.off)
    }
}

impl<T> Clone for SystemPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SystemPtr<T> {}
impl<T> PartialEq for SystemPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.off == other.off
    }
}
impl<T> Eq for SystemPtr<T> {}
impl<T> std::fmt::Debug for SystemPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sys@{:#x}", self.off)
    }
}

/// Negative i32 byte offset from the VM base into the SPDS region.
#[repr(transparent)]
pub struct SpdsPtr<T> {
    off: i32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SpdsPtr<T> {
    pub const NULL: SpdsPtr<T> = SpdsPtr { off: 0, _marker: PhantomData };

    #[inline(always)]
    pub fn from_raw(off: i32) -> Self {
        SpdsPtr { off, _marker: PhantomData }
    }

    #[inline(always)]
    pub fn raw(self) -> i32 {
        self.off
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.off == 0
    }

    #[inline(always)]
    pub fn resolve(self, arena: &VmArena) -> *mut T {
        debug_assert!(self.off < 0);
        (arena.base as i64 + self.off as i64) as *mut T
    }
}

impl<T> Clone for SpdsPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SpdsPtr<T> {}
impl<T> PartialEq for SpdsPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.off == other.off
    }
}
impl<T> Eq for SpdsPtr<T> {}

/// i32 of (signed byte offset from V) >> 3. Reaches any heap object in
/// the reservation since objects are 8-aligned. 0 is null; the value 1
/// (system heap offset 8, inside the reserved page) is available to
/// callers as an out-of-band sentinel.
#[repr(transparent)]
pub struct GeneralPtr<T> {
    val: i32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> GeneralPtr<T> {
    pub const NULL: GeneralPtr<T> = GeneralPtr { val: 0, _marker: PhantomData };

    #[inline(always)]
    pub fn from_raw(val: i32) -> Self {
        GeneralPtr { val, _marker: PhantomData }
    }

    #[inline(always)]
    pub fn from_addr(arena: &VmArena, addr: usize) -> Self {
        let off = addr as i64 - arena.base as i64;
        debug_assert!(off & 7 == 0, "heap objects must be 8-aligned");
        GeneralPtr { val: (off >> 3) as i32, _marker: PhantomData }
    }

    #[inline(always)]
    pub fn raw(self) -> i32 {
        self.val
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.val == 0
    }

    #[inline(always)]
    pub fn resolve(self, arena: &VmArena) -> *mut T {
        debug_assert!(!self.is_null());
        (arena.base as i64 + ((self.val as i64) << 3)) as *mut T
    }

    #[inline(always)]
    pub fn cast<U>(self) -> GeneralPtr<U> {
        GeneralPtr::from_raw(self.val)
    }
}

impl<T> Clone for GeneralPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GeneralPtr<T> {}
impl<T> PartialEq for GeneralPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.val == other.val
    }
}
impl<T> Eq for GeneralPtr<T> {}
impl<T> std::fmt::Debug for GeneralPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gptr@{:#x}", self.val)
    }
}

// ---------------------------------------------------------------------------
// The arena
// ---------------------------------------------------------------------------

pub struct VmArena {
    /// Start of the 18 GB reservation (V - 16GB).
    range_start: usize,
    /// The VM base address V, a multiple of 32 GB.
    base: usize,

    // User heap cursor state. Offsets are negative, relative to V.
    user_cur: Cell<i64>,
    user_commit: Cell<i64>,
    user_chunk: Cell<usize>,

    // System heap cursor state. Offsets are unsigned, relative to V.
    sys_cur: Cell<u32>,
    sys_commit: Cell<u32>,
    sys_chunk: Cell<usize>,

    // SPDS page cursor: the most negative page boundary handed out so far.
    spds_cur: Cell<i32>,
}

impl VmArena {
    pub fn new() -> Result<Box<VmArena>, crate::errors::VmError> {
        let map_len = VM_LAYOUT_LENGTH + VM_LAYOUT_ALIGNMENT * 2;
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(crate::errors::VmError::ResourceExhausted(
                "failed to reserve VM address range (is overcommit allowed?)",
            ));
        }
        let raw = raw as usize;

        // Carve out the aligned 18 GB window so that range_start + 16GB is a
        // multiple of 32 GB, then give the slack back to the OS.
        let aligned = (raw + VM_LAYOUT_ALIGNMENT - 1) & !(VM_LAYOUT_ALIGNMENT - 1);
        let range_start = aligned + VM_BASE_OFFSET;
        debug_assert!(range_start >= raw);
        debug_assert!(range_start + VM_LAYOUT_LENGTH <= raw + map_len);
        debug_assert!((range_start + VM_BASE_OFFSET) % VM_LAYOUT_ALIGNMENT == 0);

        unsafe {
            if range_start > raw {
                let r = libc::munmap(raw as *mut libc::c_void, range_start - raw);
                if r != 0 {
                    warn!("failed to unmap low slack of VM reservation");
                }
            }
            let range_end = range_start + VM_LAYOUT_LENGTH;
            let map_end = raw + map_len;
            if map_end > range_end {
                let r = libc::munmap(range_end as *mut libc::c_void, map_end - range_end);
                if r != 0 {
                    warn!("failed to unmap high slack of VM reservation");
                }
            }
        }

        let base = range_start + VM_BASE_OFFSET;
        let arena = Box::new(VmArena {
            range_start,
            base,
            user_cur: Cell::new(USER_HEAP_TOP_OFFSET),
            user_commit: Cell::new(USER_HEAP_TOP_OFFSET),
            user_chunk: Cell::new(COMMIT_CHUNK_INITIAL),
            sys_cur: Cell::new(SYSTEM_HEAP_RESERVED),
            sys_commit: Cell::new(0),
            sys_chunk: Cell::new(COMMIT_CHUNK_INITIAL),
            spds_cur: Cell::new(0),
        });
        // Commit the reserved first system page immediately; the sentinel
        // slots there must be mapped so resolve() of the poly sentinel
        // never faults in debug assertions.
        arena.commit(arena.base, PAGE_SIZE);
        arena.sys_commit.set(PAGE_SIZE as u32);
        Ok(arena)
    }

    #[inline(always)]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline(always)]
    pub fn range_start(&self) -> usize {
        self.range_start
    }

    /// True if `addr` lies anywhere inside the reservation.
    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.range_start && addr < self.range_start + VM_LAYOUT_LENGTH
    }

    fn commit(&self, addr: usize, len: usize) {
        debug_assert!(addr % PAGE_SIZE == 0 && len % PAGE_SIZE == 0);
        let r = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if r == libc::MAP_FAILED {
            fatal_oom("failed to commit VM heap memory");
        }
    }

    // ── User heap ────────────────────────────────────────────────────────────

    /// Bump-allocate `len` bytes (8-aligned) from the user heap. Returns the
    /// negative byte offset of the allocation from the VM base.
    pub fn alloc_user(&self, len: usize) -> i64 {
        debug_assert!(len > 0 && len % 8 == 0);
        let cur = self.user_cur.get() - len as i64;
        if cur < self.user_commit.get() {
            self.bump_user_commit(cur);
        }
        self.user_cur.set(cur);
        cur
    }

    #[cold]
    fn bump_user_commit(&self, want: i64) {
        if want < USER_HEAP_BOTTOM_OFFSET {
            fatal_oom("user heap overflowed its 12GB region");
        }
        let chunk = self.user_chunk.get();
        let new_commit = want & !((chunk as i64) - 1);
        let new_commit = new_commit.max(USER_HEAP_BOTTOM_OFFSET);
        let old_commit = self.user_commit.get();
        debug_assert!(new_commit < old_commit);
        let addr = (self.base as i64 + new_commit) as usize;
        self.commit(addr, (old_commit - new_commit) as usize);
        self.user_commit.set(new_commit);
        if chunk < COMMIT_CHUNK_MAX {
            self.user_chunk.set(chunk * 2);
        }
    }

    /// Allocate from the user heap and return the raw address.
    #[inline]
    pub fn alloc_user_ptr(&self, len: usize) -> *mut u8 {
        let off = self.alloc_user(len);
        (self.base as i64 + off) as *mut u8
    }

    // ── System heap ──────────────────────────────────────────────────────────

    /// Bump-allocate `len` bytes (8-aligned) from the system heap. Returns
    /// the unsigned byte offset from the VM base.
    pub fn alloc_system(&self, len: usize) -> u32 {
        debug_assert!(len > 0 && len % 8 == 0);
        let cur = self.sys_cur.get();
        let next = match cur.checked_add(len as u32) {
            Some(n) if (n as usize) <= SYSTEM_HEAP_SIZE => n,
            _ => fatal_oom("system heap overflowed its 2GB region"),
        };
        if next > self.sys_commit.get() {
            self.bump_sys_commit(next);
        }
        self.sys_cur.set(next);
        cur
    }

    #[cold]
    fn bump_sys_commit(&self, want: u32) {
        let chunk = self.sys_chunk.get();
        let new_commit = (want as usize + chunk - 1) & !(chunk - 1);
        let new_commit = new_commit.min(SYSTEM_HEAP_SIZE) as u32;
        let old_commit = self.sys_commit.get();
        debug_assert!(new_commit > old_commit);
        self.commit(
            self.base + old_commit as usize,
            (new_commit - old_commit) as usize,
        );
        self.sys_commit.set(new_commit);
        if chunk < COMMIT_CHUNK_MAX {
            self.sys_chunk.set(chunk * 2);
        }
    }

    #[inline]
    pub fn alloc_system_ptr(&self, len: usize) -> (u32, *mut u8) {
        let off = self.alloc_system(len);
        (off, (self.base + off as usize) as *mut u8)
    }

    // ── SPDS pages ───────────────────────────────────────────────────────────

    /// Carve one fresh 4 KB page out of the SPDS region. Returns the page's
    /// base offset (negative, page-aligned). The caller is the SPDS
    /// allocator's commit slow path, which serializes with a mutex.
    pub fn carve_spds_page(&self) -> i32 {
        let page = self.spds_cur.get() - PAGE_SIZE as i32;
        if (page as i64) < -(SPDS_REGION_SIZE as i64) {
            fatal_oom("SPDS region overflowed its 2GB region");
        }
        self.commit((self.base as i64 + page as i64) as usize, PAGE_SIZE);
        self.spds_cur.set(page);
        page
    }
}

impl Drop for VmArena {
    fn drop(&mut self) {
        let r = unsafe {
            libc::munmap(self.range_start as *mut libc::c_void, VM_LAYOUT_LENGTH)
        };
        if r != 0 {
            warn!("failed to unmap VM reservation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_alignment() {
        let arena = VmArena::new().unwrap();
        assert_eq!(arena.base() % VM_LAYOUT_ALIGNMENT, 0);
        assert_eq!(arena.base() - arena.range_start(), VM_BASE_OFFSET);
    }

    #[test]
    fn test_user_heap_grows_down() {
        let arena = VmArena::new().unwrap();
        let a = arena.alloc_user(64);
        let b = arena.alloc_user(64);
        assert!(b < a);
        assert_eq!(a - b, 64);
        // Committed memory is writable
        unsafe {
            let p = (arena.base() as i64 + b) as *mut u64;
            p.write(0xdead_beef);
            assert_eq!(p.read(), 0xdead_beef);
        }
    }

    #[test]
    fn test_system_heap_grows_up() {
        let arena = VmArena::new().unwrap();
        let a = arena.alloc_system(32);
        let b = arena.alloc_system(32);
        assert!(b > a);
        assert!(a >= SYSTEM_HEAP_RESERVED);
        unsafe {
            let p = (arena.base() + b as usize) as *mut u64;
            p.write(7);
            assert_eq!(p.read(), 7);
        }
    }

    #[test]
    fn test_general_ptr_roundtrip() {
        let arena = VmArena::new().unwrap();
        let addr = arena.alloc_user_ptr(48) as usize;
        let g: GeneralPtr<u64> = GeneralPtr::from_addr(&arena, addr);
        assert!(g.raw() < 0);
        assert_eq!(g.resolve(&arena) as usize, addr);

        let (off, p) = arena.alloc_system_ptr(16);
        let s: SystemPtr<u64> = SystemPtr::from_raw(off);
        assert_eq!(s.resolve(&arena) as usize, p as usize);
        let g2: GeneralPtr<u64> = GeneralPtr::from_addr(&arena, p as usize);
        assert!(g2.raw() > 0);
        assert_eq!(g2.resolve(&arena) as usize, p as usize);
    }

    #[test]
    fn test_spds_pages_grow_down() {
        let arena = VmArena::new().unwrap();
        let p1 = arena.carve_spds_page();
        let p2 = arena.carve_spds_page();
        assert_eq!(p1, -(PAGE_SIZE as i32));
        assert_eq!(p2, p1 - PAGE_SIZE as i32);
        unsafe {
            let p = (arena.base() as i64 + p2 as i64) as *mut u64;
            p.write(99);
            assert_eq!(p.read(), 99);
        }
    }
}
