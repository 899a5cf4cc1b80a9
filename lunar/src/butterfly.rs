/// Butterfly storage and the array-type state byte.
///
/// A butterfly is one contiguous user-heap allocation of
/// `named_capacity + 1 + array_capacity` 64-bit slots. The pointer kept
/// in the table object aims at the single header slot in the middle:
/// named property slots extend to the LEFT (negative indices), the
/// 1-based array part extends to the RIGHT, so Lua's `t[i]` is exactly
/// `butterfly[i]`.
///
/// The header packs the whole array state machine into 8 bytes:
///
///   array_length_if_continuous >= 1  : continuous; indices [1, len) are
///                                      non-nil, everything at/after len
///                                      is nil (len == 1 is the empty
///                                      continuous array)
///   array_length_if_continuous == 0  : not continuous, no sparse map
///   array_length_if_continuous <  0  : not continuous, and the value IS
///                                      the compressed GeneralPtr of the
///                                      ArraySparseMap
///
/// The sparse map itself is an outlined hash map keyed by f64 bits; well
/// behaved programs are not expected to touch it.

use std::collections::HashMap;

use crate::arena::{GeneralPtr, VmArena};
use crate::tvalue::{HeapHeader, HeapKind, TValue};

pub const ARRAY_BASE_ORD: i64 = 1;

// ── Array growth policy ──────────────────────────────────────────────────────

pub const ARRAY_INITIAL_VECTOR_CAPACITY: u32 = 4;
/// Indices up to this always qualify for vector storage.
pub const ARRAY_ALWAYS_VECTOR_CUTOFF: i64 = 1000;
/// Above this, a write goes to the vector only when it keeps the array
/// continuous.
pub const ARRAY_SPARSE_MAP_UNLESS_CONTINUOUS_CUTOFF: i64 = 100_000;
/// Above this, writes divert to the sparse map unconditionally.
pub const ARRAY_UNCONDITIONALLY_SPARSE_CUTOFF: i64 = 1 << 27;
/// Minimum (non-nil entries) / capacity ratio, in percent, for a vector
/// extension between the two lower cutoffs.
pub const ARRAY_DENSITY_CUTOFF_PERCENT: u64 = 30;

pub fn grow_array_capacity(cur: u32, needed: u32) -> u32 {
    let mut cap = cur.max(ARRAY_INITIAL_VECTOR_CAPACITY);
    while cap < needed {
        cap = cap + cap / 2 + 4;
    }
    cap.min(ARRAY_UNCONDITIONALLY_SPARSE_CUTOFF as u32)
}

// ── ArrayType ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArrayKind {
    NoArrayPart = 0,
    Int32 = 1,
    Double = 2,
    Any = 3,
}

const KIND_MASK: u8 = 0b0000_0011;
const CONTINUOUS_BIT: u8 = 0b0000_0100;
const SPARSE_BIT: u8 = 0b0000_1000;
const SPARSE_VECTOR_INDEX_BIT: u8 = 0b0001_0000;
const MAY_HAVE_METATABLE_BIT: u8 = 0b0010_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ArrayType(u8);

impl Default for ArrayType {
    fn default() -> Self {
        // Fresh tables: no array part, trivially continuous.
        ArrayType(CONTINUOUS_BIT)
    }
}

impl ArrayType {
    #[inline(always)]
    pub fn from_raw(raw: u8) -> Self {
        ArrayType(raw)
    }

    #[inline(always)]
    pub fn raw(self) -> u8 {
        self.0
    }

    #[inline(always)]
    pub fn kind(self) -> ArrayKind {
        match self.0 & KIND_MASK {
            0 => ArrayKind::NoArrayPart,
            1 => ArrayKind::Int32,
            2 => ArrayKind::Double,
            _ => ArrayKind::Any,
        }
    }

    #[inline(always)]
    pub fn with_kind(self, kind: ArrayKind) -> Self {
        ArrayType((self.0 & !KIND_MASK) | kind as u8)
    }

    #[inline(always)]
    pub fn is_continuous(self) -> bool {
        self.0 & CONTINUOUS_BIT != 0
    }

    #[inline(always)]
    pub fn with_continuous(self, c: bool) -> Self {
        if c { ArrayType(self.0 | CONTINUOUS_BIT) } else { ArrayType(self.0 & !CONTINUOUS_BIT) }
    }

    #[inline(always)]
    pub fn has_sparse_map(self) -> bool {
        self.0 & SPARSE_BIT != 0
    }

    #[inline(always)]
    pub fn with_sparse_map(self, s: bool) -> Self {
        if s { ArrayType(self.0 | SPARSE_BIT) } else { ArrayType(self.0 & !SPARSE_BIT) }
    }

    #[inline(always)]
    pub fn sparse_map_contains_vector_index(self) -> bool {
        self.0 & SPARSE_VECTOR_INDEX_BIT != 0
    }

    #[inline(always)]
    pub fn with_sparse_map_contains_vector_index(self, s: bool) -> Self {
        if s {
            ArrayType(self.0 | SPARSE_VECTOR_INDEX_BIT)
        } else {
            ArrayType(self.0 & !SPARSE_VECTOR_INDEX_BIT)
        }
    }

    #[inline(always)]
    pub fn may_have_metatable(self) -> bool {
        self.0 & MAY_HAVE_METATABLE_BIT != 0
    }

    #[inline(always)]
    pub fn with_may_have_metatable(self, s: bool) -> Self {
        if s {
            ArrayType(self.0 | MAY_HAVE_METATABLE_BIT)
        } else {
            ArrayType(self.0 & !MAY_HAVE_METATABLE_BIT)
        }
    }
}

// ── Butterfly ────────────────────────────────────────────────────────────────

#[repr(C)]
pub struct ButterflyHeader {
    pub array_length_if_continuous: i32,
    pub array_capacity: u32,
}

pub type Bfly = *mut ButterflyHeader;

impl ButterflyHeader {
    #[inline(always)]
    pub fn is_continuous(&self) -> bool {
        self.array_length_if_continuous >= ARRAY_BASE_ORD as i32
    }

    /// One past the last non-nil index of a continuous array.
    #[inline(always)]
    pub fn continuous_length(&self) -> i64 {
        debug_assert!(self.is_continuous());
        self.array_length_if_continuous as i64
    }

    #[inline(always)]
    pub fn has_sparse_map(&self) -> bool {
        self.array_length_if_continuous < (ARRAY_BASE_ORD - 1) as i32
    }

    #[inline(always)]
    pub fn sparse_map(&self) -> GeneralPtr<ArraySparseMap> {
        debug_assert!(self.has_sparse_map());
        GeneralPtr::from_raw(self.array_length_if_continuous)
    }

    #[inline(always)]
    pub fn index_in_vector_range(&self, idx: i64) -> bool {
        ARRAY_BASE_ORD <= idx && idx < self.array_capacity as i64 + ARRAY_BASE_ORD
    }
}

/// Allocate a butterfly with the given named and array capacities. All
/// value slots start nil; the array state is empty-continuous. Returns
/// the middle (header) pointer.
pub fn butterfly_alloc(arena: &VmArena, named_capacity: u32, array_capacity: u32) -> Bfly {
    let total_slots = named_capacity as usize + 1 + array_capacity as usize;
    let base = arena.alloc_user_ptr(total_slots * 8) as *mut u64;
    unsafe {
        let header = base.add(named_capacity as usize) as Bfly;
        for i in 0..named_capacity as usize {
            base.add(i).write(TValue::nil().raw());
        }
        (*header).array_length_if_continuous = ARRAY_BASE_ORD as i32;
        (*header).array_capacity = array_capacity;
        let arr = header as *mut u64;
        for i in 1..=array_capacity as usize {
            arr.add(i).write(TValue::nil().raw());
        }
        header
    }
}

/// Address of 1-based array slot `idx`.
#[inline(always)]
pub fn array_slot_ptr(b: Bfly, idx: i64) -> *mut TValue {
    debug_assert!(idx >= ARRAY_BASE_ORD);
    unsafe { (b as *mut TValue).offset(idx as isize) }
}

/// Address of the named slot at butterfly index `-(ord + 1)` where
/// `ord = slot - inline_capacity`.
#[inline(always)]
pub fn named_slot_ptr(b: Bfly, ord: u32) -> *mut TValue {
    unsafe { (b as *mut TValue).offset(-(ord as isize) - 1) }
}

// ── ArraySparseMap ───────────────────────────────────────────────────────────

/// Fallback store for array keys outside the vector range (or diverted by
/// the density policy). Keyed by the f64 bits of the index with -0.0
/// normalized, valued by raw TValues. Outlined std hash map, as the slow
/// path deserves no better.
#[repr(C)]
pub struct ArraySparseMap {
    pub header: HeapHeader,
    map: HashMap<u64, u64>,
}

fn sparse_key(key: f64) -> u64 {
    debug_assert!(!key.is_nan());
    if key == 0.0 { 0f64.to_bits() } else { key.to_bits() }
}

impl ArraySparseMap {
    pub fn get(&self, key: f64) -> TValue {
        match self.map.get(&sparse_key(key)) {
            Some(&raw) => TValue::from_raw(raw),
            None => TValue::nil(),
        }
    }

    pub fn put(&mut self, key: f64, value: TValue) {
        if value.is_nil() {
            self.map.remove(&sparse_key(key));
        } else {
            self.map.insert(sparse_key(key), value.raw());
        }
    }

    pub fn contains(&self, key: f64) -> bool {
        self.map.contains_key(&sparse_key(key))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Iterate raw (key bits, value raw) pairs; order is unspecified.
    pub fn iter(&self) -> impl Iterator<Item = (f64, TValue)> + '_ {
        self.map
            .iter()
            .map(|(&k, &v)| (f64::from_bits(k), TValue::from_raw(v)))
    }
}

pub fn sparse_map_alloc(arena: &VmArena) -> GeneralPtr<ArraySparseMap> {
    let bytes = (std::mem::size_of::<ArraySparseMap>() + 7) & !7;
    let ptr = arena.alloc_user_ptr(bytes) as *mut ArraySparseMap;
    HeapHeader::init(ptr as *mut HeapHeader, HeapKind::SparseMap, 0, 0);
    unsafe {
        std::ptr::addr_of_mut!((*ptr).map).write(HashMap::new());
    }
    GeneralPtr::from_addr(arena, ptr as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_type_bits() {
        let at = ArrayType::default();
        assert_eq!(at.kind(), ArrayKind::NoArrayPart);
        assert!(at.is_continuous());
        assert!(!at.has_sparse_map());
        let at = at.with_kind(ArrayKind::Int32).with_continuous(false).with_sparse_map(true);
        assert_eq!(at.kind(), ArrayKind::Int32);
        assert!(!at.is_continuous());
        assert!(at.has_sparse_map());
        assert!(!at.may_have_metatable());
        let at = at.with_may_have_metatable(true);
        assert!(at.may_have_metatable());
        assert_eq!(at.kind(), ArrayKind::Int32);
    }

    #[test]
    fn test_butterfly_layout() {
        let arena = VmArena::new().unwrap();
        let b = butterfly_alloc(&arena, 2, 4);
        unsafe {
            assert!((*b).is_continuous());
            assert_eq!((*b).continuous_length(), 1);
            assert_eq!((*b).array_capacity, 4);
            assert!((*b).index_in_vector_range(1));
            assert!((*b).index_in_vector_range(4));
            assert!(!(*b).index_in_vector_range(5));

            // Named slots sit below the header, array slots above.
            array_slot_ptr(b, 1).write(TValue::int32(11));
            array_slot_ptr(b, 4).write(TValue::int32(44));
            named_slot_ptr(b, 0).write(TValue::int32(-1));
            named_slot_ptr(b, 1).write(TValue::int32(-2));
            assert_eq!(array_slot_ptr(b, 1).read(), TValue::int32(11));
            assert_eq!(array_slot_ptr(b, 4).read(), TValue::int32(44));
            assert_eq!(named_slot_ptr(b, 0).read(), TValue::int32(-1));
            assert_eq!(named_slot_ptr(b, 1).read(), TValue::int32(-2));
            // The header was not clobbered by its neighbors.
            assert_eq!((*b).array_capacity, 4);
            assert_eq!((*b).array_length_if_continuous, 1);
        }
    }

    #[test]
    fn test_sparse_map_negative_zero_folds() {
        let arena = VmArena::new().unwrap();
        let g = sparse_map_alloc(&arena);
        let m = unsafe { &mut *g.resolve(&arena) };
        m.put(0.5, TValue::int32(1));
        m.put(-0.0, TValue::int32(2));
        assert_eq!(m.get(0.5), TValue::int32(1));
        assert_eq!(m.get(0.0), TValue::int32(2));
        m.put(0.5, TValue::nil());
        assert_eq!(m.get(0.5), TValue::nil());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_growth_policy_ramp() {
        let mut cap = 0;
        cap = grow_array_capacity(cap, 1);
        assert_eq!(cap, ARRAY_INITIAL_VECTOR_CAPACITY);
        let next = grow_array_capacity(cap, cap + 1);
        assert!(next > cap);
        assert!(next <= cap + cap / 2 + 4);
    }
}
