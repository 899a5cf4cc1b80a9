/// Hidden classes.
///
/// Every table points at a hidden class: a `Structure` while its shape is
/// still cacheable, or a per-object `Dictionary` once it outgrows the
/// Structure model. Structures are immutable after publication; adding a
/// property returns a successor Structure reached through a transition
/// edge. Edges live in a side map keyed by (structure handle, edge), not
/// in the Structure itself, which breaks the ownership cycle between
/// structures and their transition tables.
///
/// Property storage bookkeeping:
///   * slots `< inline_capacity` live in the object's inline storage;
///   * higher slots live in the butterfly's named region at index
///     `-(slot - inline_capacity + 1)`.
///
/// The property table of a Structure is split: a shared anchor hash table
/// covers the first `num_anchored` slots (always a multiple of the block
/// size 8), and the at-most-8 most recent keys are inlined in the
/// Structure. Anchors are memoized on the parent structure when the first
/// child crossing a block boundary is created, so a transition path of n
/// properties allocates O(n / 8) anchors in total, no matter how many
/// sibling branches the path sprouts.

use dashmap::DashMap;

use crate::arena::{SystemPtr, VmArena};
use crate::butterfly::ArrayType;
use crate::strings::{string_hash, StringRef};

pub const HIDDEN_CLASS_BLOCK_SIZE: u32 = 8;
pub const STRUCTURE_MAX_SLOTS: u32 = 253;

/// Butterfly named-part growth: 0 -> 4 -> 8 -> 16 -> ...
fn grow_outline_capacity(mut cap: u32, needed: u32) -> u32 {
    while cap < needed {
        cap = if cap == 0 { 4 } else { cap * 2 };
    }
    cap
}

pub const METATABLE_NONE: i32 = 0;
/// The structure has seen too many distinct metatables to pin one; IC
/// consumers must treat the metatable as unknown-but-possibly-present.
pub const METATABLE_POLY: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HiddenClassKind {
    Structure = 1,
    CacheableDictionary = 2,
    UncacheableDictionary = 3,
}

// ---------------------------------------------------------------------------
// Structure
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct Structure {
    pub kind: u8,
    pub inline_capacity: u8,
    pub num_slots: u8,
    /// Slots covered by `anchor`; always a multiple of the block size.
    pub num_anchored: u8,
    /// Named-slot capacity of the butterfly objects with this shape carry.
    pub outline_capacity: u32,
    /// GeneralPtr raw: METATABLE_NONE, METATABLE_POLY, or a table.
    pub metatable: i32,
    /// SystemPtr<AnchorTable> covering `num_anchored` slots; 0 if none.
    pub anchor: u32,
    /// Memoized anchor covering all `num_slots` slots. Built lazily when
    /// the first block-boundary child is created, shared by all children.
    pub full_anchor: u32,
    pub array_type: ArrayType,
    pub _pad: [u8; 3],
    /// Keys of slots [num_anchored, num_slots), newest last (StringRef raw).
    pub tail_keys: [u32; HIDDEN_CLASS_BLOCK_SIZE as usize],
}

pub type StructureRef = SystemPtr<Structure>;

#[inline(always)]
pub fn structure<'a>(arena: &'a VmArena, s: u32) -> &'a Structure {
    unsafe { &*((arena.base() + s as usize) as *const Structure) }
}

#[inline(always)]
fn structure_mut(arena: &VmArena, s: u32) -> *mut Structure {
    (arena.base() + s as usize) as *mut Structure
}

/// Kind byte shared by Structure and Dictionary layouts, so IC code can
/// classify any hidden class from its first byte.
#[inline(always)]
pub fn hidden_class_kind(arena: &VmArena, hc: u32) -> HiddenClassKind {
    match unsafe { *((arena.base() + hc as usize) as *const u8) } {
        1 => HiddenClassKind::Structure,
        2 => HiddenClassKind::CacheableDictionary,
        _ => HiddenClassKind::UncacheableDictionary,
    }
}

/// Inline capacity also sits at a common offset in both layouts.
#[inline(always)]
pub fn hidden_class_inline_capacity(arena: &VmArena, hc: u32) -> u8 {
    unsafe { *((arena.base() + hc as usize + 1) as *const u8) }
}

// ---------------------------------------------------------------------------
// Anchor hash tables
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct AnchorTable {
    pub num_props: u32,
    /// Hash table length - 1 (length is a power of two).
    pub mask: u32,
    // Layout after the header:
    //   props: [u32; num_props]      slot ordinal -> StringRef raw
    //   ht:    [u8; mask + 1]        0 = empty, else ordinal + 1
}

unsafe fn anchor_props(base: *const AnchorTable) -> *const u32 {
    base.add(1) as *const u32
}

unsafe fn anchor_ht(base: *const AnchorTable) -> *const u8 {
    let props = anchor_props(base);
    props.add((*base).num_props as usize) as *const u8
}

fn anchor_lookup(arena: &VmArena, anchor: u32, key: StringRef, hash: u64) -> Option<u8> {
    unsafe {
        let a = (arena.base() + anchor as usize) as *const AnchorTable;
        let mask = (*a).mask;
        let props = anchor_props(a);
        let ht = anchor_ht(a);
        let mut probe = (hash as u32) & mask;
        loop {
            let entry = *ht.add(probe as usize);
            if entry == 0 {
                return None;
            }
            let ord = (entry - 1) as usize;
            if *props.add(ord) == key.raw() {
                return Some(ord as u8);
            }
            probe = (probe + 1) & mask;
        }
    }
}

/// Build an anchor table over `keys` (slot i = keys[i]).
fn build_anchor(arena: &VmArena, keys: &[u32]) -> u32 {
    let n = keys.len();
    debug_assert!(n > 0 && n <= STRUCTURE_MAX_SLOTS as usize);
    let ht_len = (n * 2).next_power_of_two().max(16);
    let bytes = std::mem::size_of::<AnchorTable>() + n * 4 + ht_len;
    let bytes = (bytes + 7) & !7;
    let (off, ptr) = arena.alloc_system_ptr(bytes);
    unsafe {
        let a = ptr as *mut AnchorTable;
        (*a).num_props = n as u32;
        (*a).mask = (ht_len - 1) as u32;
        let props = anchor_props(a) as *mut u32;
        std::ptr::copy_nonoverlapping(keys.as_ptr(), props, n);
        let ht = anchor_ht(a) as *mut u8;
        std::ptr::write_bytes(ht, 0, ht_len);
        for (ord, &key) in keys.iter().enumerate() {
            let hash = string_hash(arena, StringRef::from_raw(key));
            let mut probe = (hash as u32) & (*a).mask;
            while *ht.add(probe as usize) != 0 {
                probe = (probe + 1) & (*a).mask;
            }
            *ht.add(probe as usize) = (ord + 1) as u8;
        }
    }
    off
}

// ---------------------------------------------------------------------------
// Transition side map and registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionEdge {
    AddProperty(u32),
    UpdateArrayType(u8),
    SetMetatable(i32),
    RemoveMetatable,
}

/// VM-wide structure bookkeeping: the transition side map and the cache
/// of initial (empty) structures per inline capacity.
pub struct StructureRegistry {
    transitions: DashMap<(u32, TransitionEdge), u32>,
    initial: DashMap<u8, u32>,
}

impl StructureRegistry {
    pub fn new() -> Self {
        StructureRegistry {
            transitions: DashMap::new(),
            initial: DashMap::new(),
        }
    }

    /// Number of distinct transition edges recorded (diagnostics).
    pub fn num_transitions(&self) -> usize {
        self.transitions.len()
    }
}

fn alloc_structure(arena: &VmArena, init: Structure) -> u32 {
    let bytes = (std::mem::size_of::<Structure>() + 7) & !7;
    let (off, ptr) = arena.alloc_system_ptr(bytes);
    unsafe {
        (ptr as *mut Structure).write(init);
    }
    off
}

/// The shared empty structure for a given inline capacity.
pub fn initial_structure(arena: &VmArena, registry: &StructureRegistry, inline_capacity: u8) -> u32 {
    if let Some(s) = registry.initial.get(&inline_capacity) {
        return *s;
    }
    let off = alloc_structure(
        arena,
        Structure {
            kind: HiddenClassKind::Structure as u8,
            inline_capacity,
            num_slots: 0,
            num_anchored: 0,
            outline_capacity: 0,
            metatable: METATABLE_NONE,
            anchor: 0,
            full_anchor: 0,
            array_type: ArrayType::default(),
            _pad: [0; 3],
            tail_keys: [0; 8],
        },
    );
    *registry.initial.entry(inline_capacity).or_insert(off)
}

/// Slot lookup on a Structure: the inlined tail first (newest keys), then
/// the shared anchor.
pub fn structure_find_slot(arena: &VmArena, s_off: u32, key: StringRef) -> Option<u8> {
    let s = structure(arena, s_off);
    let tail_len = (s.num_slots - s.num_anchored) as usize;
    for i in 0..tail_len {
        if s.tail_keys[i] == key.raw() {
            return Some(s.num_anchored + i as u8);
        }
    }
    if s.anchor != 0 {
        let hash = string_hash(arena, key);
        return anchor_lookup(arena, s.anchor, key, hash);
    }
    None
}

/// All keys of a Structure in slot order.
pub fn structure_keys(arena: &VmArena, s_off: u32) -> Vec<u32> {
    let s = structure(arena, s_off);
    let mut keys = Vec::with_capacity(s.num_slots as usize);
    if s.anchor != 0 {
        unsafe {
            let a = (arena.base() + s.anchor as usize) as *const AnchorTable;
            let props = anchor_props(a);
            for i in 0..(*a).num_props as usize {
                keys.push(*props.add(i));
            }
        }
    }
    debug_assert!(keys.len() == s.num_anchored as usize);
    for i in 0..(s.num_slots - s.num_anchored) as usize {
        keys.push(s.tail_keys[i]);
    }
    keys
}

/// Key of one slot ordinal (iteration support).
pub fn structure_key_at(arena: &VmArena, s_off: u32, slot: u8) -> u32 {
    let s = structure(arena, s_off);
    if slot >= s.num_anchored {
        s.tail_keys[(slot - s.num_anchored) as usize]
    } else {
        unsafe {
            let a = (arena.base() + s.anchor as usize) as *const AnchorTable;
            *anchor_props(a).add(slot as usize)
        }
    }
}

/// Anchor covering every slot of `s_off`, memoized on the structure.
fn full_anchor_of(arena: &VmArena, s_off: u32) -> u32 {
    let s = structure(arena, s_off);
    debug_assert!(s.num_slots > 0 && s.num_slots as u32 % HIDDEN_CLASS_BLOCK_SIZE == 0);
    if s.full_anchor != 0 {
        return s.full_anchor;
    }
    let keys = structure_keys(arena, s_off);
    let anchor = build_anchor(arena, &keys);
    unsafe {
        (*structure_mut(arena, s_off)).full_anchor = anchor;
    }
    anchor
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPropertyResult {
    /// The key already has a slot; no transition.
    Existing { slot: u8 },
    /// Transition to `new_structure`, writing the value at `slot`.
    Transition {
        new_structure: u32,
        slot: u8,
        grow_butterfly: bool,
        new_outline_capacity: u32,
    },
    /// The structure is at the slot cap; the object must be migrated to
    /// dictionary mode by the caller.
    PromoteToDictionary,
}

/// The add-property algorithm of the hidden class engine.
pub fn structure_add_property(
    arena: &VmArena,
    registry: &StructureRegistry,
    s_off: u32,
    key: StringRef,
) -> AddPropertyResult {
    if let Some(slot) = structure_find_slot(arena, s_off, key) {
        return AddPropertyResult::Existing { slot };
    }

    let (num_slots, inline_capacity, outline_capacity) = {
        let s = structure(arena, s_off);
        (s.num_slots as u32, s.inline_capacity as u32, s.outline_capacity)
    };
    if num_slots >= STRUCTURE_MAX_SLOTS {
        return AddPropertyResult::PromoteToDictionary;
    }

    let edge = (s_off, TransitionEdge::AddProperty(key.raw()));
    if let Some(next) = registry.transitions.get(&edge) {
        let n = structure(arena, *next);
        return AddPropertyResult::Transition {
            new_structure: *next,
            slot: num_slots as u8,
            grow_butterfly: n.outline_capacity != outline_capacity,
            new_outline_capacity: n.outline_capacity,
        };
    }

    // Build the successor.
    let slot = num_slots;
    let needs_outline = slot + 1 > inline_capacity;
    let grow_butterfly = needs_outline && (slot - inline_capacity) >= outline_capacity;
    let new_outline = if grow_butterfly {
        grow_outline_capacity(outline_capacity, slot - inline_capacity + 1)
    } else {
        outline_capacity
    };

    let crosses_block = num_slots > 0 && num_slots % HIDDEN_CLASS_BLOCK_SIZE == 0;
    let (anchor, num_anchored, tail) = if crosses_block {
        let anchor = full_anchor_of(arena, s_off);
        let mut tail = [0u32; 8];
        tail[0] = key.raw();
        (anchor, num_slots as u8, tail)
    } else {
        let s = structure(arena, s_off);
        let mut tail = s.tail_keys;
        tail[(num_slots - s.num_anchored as u32) as usize] = key.raw();
        (s.anchor, s.num_anchored, tail)
    };

    let (metatable, array_type) = {
        let s = structure(arena, s_off);
        (s.metatable, s.array_type)
    };
    let new_off = alloc_structure(
        arena,
        Structure {
            kind: HiddenClassKind::Structure as u8,
            inline_capacity: inline_capacity as u8,
            num_slots: (num_slots + 1) as u8,
            num_anchored,
            outline_capacity: new_outline,
            metatable,
            anchor,
            full_anchor: 0,
            array_type,
            _pad: [0; 3],
            tail_keys: tail,
        },
    );
    registry.transitions.insert(edge, new_off);
    AddPropertyResult::Transition {
        new_structure: new_off,
        slot: slot as u8,
        grow_butterfly,
        new_outline_capacity: new_outline,
    }
}

/// Clone-with-tweak used by the non-property transitions below.
fn derive_structure(
    arena: &VmArena,
    registry: &StructureRegistry,
    s_off: u32,
    edge: TransitionEdge,
    tweak: impl FnOnce(&mut Structure),
) -> u32 {
    let key = (s_off, edge);
    if let Some(next) = registry.transitions.get(&key) {
        return *next;
    }
    let mut copy = unsafe { std::ptr::read(structure(arena, s_off)) };
    copy.full_anchor = 0;
    tweak(&mut copy);
    let new_off = alloc_structure(arena, copy);
    registry.transitions.insert(key, new_off);
    new_off
}

/// Array-kind transition (e.g. NoArrayPart -> continuous Int32).
pub fn structure_update_array_type(
    arena: &VmArena,
    registry: &StructureRegistry,
    s_off: u32,
    new_type: ArrayType,
) -> u32 {
    if structure(arena, s_off).array_type == new_type {
        return s_off;
    }
    derive_structure(
        arena,
        registry,
        s_off,
        TransitionEdge::UpdateArrayType(new_type.raw()),
        |s| s.array_type = new_type,
    )
}

/// `setmetatable` transition. `mt_gptr` is the GeneralPtr raw of the new
/// metatable; METATABLE_NONE removes it.
pub fn structure_set_metatable(
    arena: &VmArena,
    registry: &StructureRegistry,
    s_off: u32,
    mt_gptr: i32,
) -> u32 {
    if structure(arena, s_off).metatable == mt_gptr {
        return s_off;
    }
    let edge = if mt_gptr == METATABLE_NONE {
        TransitionEdge::RemoveMetatable
    } else {
        TransitionEdge::SetMetatable(mt_gptr)
    };
    derive_structure(arena, registry, s_off, edge, |s| {
        s.metatable = mt_gptr;
        s.array_type = s.array_type.with_may_have_metatable(mt_gptr != METATABLE_NONE);
    })
}

// ---------------------------------------------------------------------------
// Dictionaries
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct Dictionary {
    pub kind: u8,
    pub inline_capacity: u8,
    pub _pad0: u16,
    pub num_slots: u32,
    pub outline_capacity: u32,
    pub metatable: i32,
    /// SystemPtr<DictTable>.
    pub table: u32,
    pub _pad1: u32,
}

#[repr(C)]
struct DictTable {
    mask: u32,
    used: u32,
    // entries follow: [(u32 key, u32 slot); mask + 1], key 0 = empty
}

unsafe fn dict_entries(t: *const DictTable) -> *const (u32, u32) {
    t.add(1) as *const (u32, u32)
}

fn alloc_dict_table(arena: &VmArena, mask: u32) -> u32 {
    let len = (mask + 1) as usize;
    let bytes = std::mem::size_of::<DictTable>() + len * 8;
    let (off, ptr) = arena.alloc_system_ptr(bytes);
    unsafe {
        let t = ptr as *mut DictTable;
        (*t).mask = mask;
        (*t).used = 0;
        std::ptr::write_bytes(dict_entries(t) as *mut u8, 0, len * 8);
    }
    off
}

#[inline(always)]
pub fn dictionary<'a>(arena: &'a VmArena, d: u32) -> &'a Dictionary {
    unsafe { &*((arena.base() + d as usize) as *const Dictionary) }
}

#[inline(always)]
fn dictionary_mut(arena: &VmArena, d: u32) -> *mut Dictionary {
    (arena.base() + d as usize) as *mut Dictionary
}

pub fn dict_find_slot(arena: &VmArena, d_off: u32, key: StringRef) -> Option<u32> {
    let d = dictionary(arena, d_off);
    unsafe {
        let t = (arena.base() + d.table as usize) as *const DictTable;
        let mask = (*t).mask;
        let entries = dict_entries(t);
        let mut probe = (string_hash(arena, key) as u32) & mask;
        loop {
            let (k, slot) = *entries.add(probe as usize);
            if k == 0 {
                return None;
            }
            if k == key.raw() {
                return Some(slot);
            }
            probe = (probe + 1) & mask;
        }
    }
}

fn dict_table_insert(arena: &VmArena, table_off: u32, key: u32, slot: u32) {
    unsafe {
        let t = (arena.base() + table_off as usize) as *mut DictTable;
        let mask = (*t).mask;
        let entries = dict_entries(t) as *mut (u32, u32);
        let hash = string_hash(arena, StringRef::from_raw(key));
        let mut probe = (hash as u32) & mask;
        while (*entries.add(probe as usize)).0 != 0 {
            probe = (probe + 1) & mask;
        }
        *entries.add(probe as usize) = (key, slot);
        (*t).used += 1;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DictAddResult {
    pub slot: u32,
    pub grow_butterfly: bool,
    pub new_outline_capacity: u32,
}

/// Add a property to a dictionary in place (the dictionary is 1:1 with
/// its object, so this is not a transition).
pub fn dict_add_slot(arena: &VmArena, d_off: u32, key: StringRef) -> DictAddResult {
    debug_assert!(dict_find_slot(arena, d_off, key).is_none());
    let (slot, inline_capacity, outline_capacity, table_off, used, mask) = {
        let d = dictionary(arena, d_off);
        let t = unsafe { &*((arena.base() + d.table as usize) as *const DictTable) };
        (
            d.num_slots,
            d.inline_capacity as u32,
            d.outline_capacity,
            d.table,
            t.used,
            t.mask,
        )
    };

    // Rehash at 70% load.
    if (used + 1) * 10 > (mask + 1) * 7 {
        let new_mask = (mask + 1) * 2 - 1;
        let new_table = alloc_dict_table(arena, new_mask);
        unsafe {
            let t = (arena.base() + table_off as usize) as *const DictTable;
            let entries = dict_entries(t);
            for i in 0..=mask {
                let (k, s) = *entries.add(i as usize);
                if k != 0 {
                    dict_table_insert(arena, new_table, k, s);
                }
            }
            (*dictionary_mut(arena, d_off)).table = new_table;
        }
    }

    let d = dictionary(arena, d_off);
    dict_table_insert(arena, d.table, key.raw(), slot);

    let needs_outline = slot + 1 > inline_capacity;
    let grow_butterfly = needs_outline && (slot - inline_capacity) >= outline_capacity;
    let new_outline = if grow_butterfly {
        grow_outline_capacity(outline_capacity, slot - inline_capacity + 1)
    } else {
        outline_capacity
    };
    unsafe {
        let dm = dictionary_mut(arena, d_off);
        (*dm).num_slots = slot + 1;
        (*dm).outline_capacity = new_outline;
    }
    DictAddResult {
        slot,
        grow_butterfly,
        new_outline_capacity: new_outline,
    }
}

/// Keys of a dictionary ordered by slot (iteration support).
pub fn dict_keys(arena: &VmArena, d_off: u32) -> Vec<(u32, u32)> {
    let d = dictionary(arena, d_off);
    let mut out = Vec::with_capacity(d.num_slots as usize);
    unsafe {
        let t = (arena.base() + d.table as usize) as *const DictTable;
        let entries = dict_entries(t);
        for i in 0..=(*t).mask {
            let (k, s) = *entries.add(i as usize);
            if k != 0 {
                out.push((k, s));
            }
        }
    }
    out.sort_by_key(|&(_, s)| s);
    out
}

pub fn dict_set_metatable(arena: &VmArena, d_off: u32, mt_gptr: i32) {
    unsafe {
        (*dictionary_mut(arena, d_off)).metatable = mt_gptr;
    }
}

/// Materialize a dictionary from a structure at its slot cap, appending
/// `extra_key` as the newest slot. The caller re-points the object's
/// hidden class (and grows the butterfly if asked); object identity is
/// untouched.
pub fn promote_to_dictionary(
    arena: &VmArena,
    s_off: u32,
    extra_key: StringRef,
) -> (u32, DictAddResult) {
    let keys = structure_keys(arena, s_off);
    let s = structure(arena, s_off);
    let mask = ((keys.len() + 1) * 2).next_power_of_two().max(16) as u32 - 1;
    let table = alloc_dict_table(arena, mask);
    let bytes = (std::mem::size_of::<Dictionary>() + 7) & !7;
    let (d_off, ptr) = arena.alloc_system_ptr(bytes);
    unsafe {
        (ptr as *mut Dictionary).write(Dictionary {
            kind: HiddenClassKind::CacheableDictionary as u8,
            inline_capacity: s.inline_capacity,
            _pad0: 0,
            num_slots: keys.len() as u32,
            outline_capacity: s.outline_capacity,
            metatable: s.metatable,
            table,
            _pad1: 0,
        });
    }
    for (slot, &key) in keys.iter().enumerate() {
        dict_table_insert(arena, table, key, slot as u32);
    }
    let add = dict_add_slot(arena, d_off, extra_key);
    (d_off, add)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::StringInterner;

    struct Fx {
        arena: Box<VmArena>,
        registry: StructureRegistry,
        interner: StringInterner,
    }

    impl Fx {
        fn new() -> Self {
            Fx {
                arena: VmArena::new().unwrap(),
                registry: StructureRegistry::new(),
                interner: StringInterner::new(),
            }
        }

        fn key(&self, name: &str) -> StringRef {
            self.interner.intern(&self.arena, name.as_bytes())
        }
    }

    fn add(fx: &Fx, s: u32, name: &str) -> (u32, u8) {
        match structure_add_property(&fx.arena, &fx.registry, s, fx.key(name)) {
            AddPropertyResult::Transition { new_structure, slot, .. } => (new_structure, slot),
            other => panic!("expected transition, got {:?}", other),
        }
    }

    #[test]
    fn test_slots_follow_insertion_order() {
        let fx = Fx::new();
        let s0 = initial_structure(&fx.arena, &fx.registry, 2);
        let (s1, slot_a) = add(&fx, s0, "a");
        let (s2, slot_b) = add(&fx, s1, "b");
        let (s3, slot_c) = add(&fx, s2, "c");
        assert_eq!((slot_a, slot_b, slot_c), (0, 1, 2));
        assert_eq!(structure_find_slot(&fx.arena, s3, fx.key("a")), Some(0));
        assert_eq!(structure_find_slot(&fx.arena, s3, fx.key("b")), Some(1));
        assert_eq!(structure_find_slot(&fx.arena, s3, fx.key("c")), Some(2));
        assert_eq!(structure_find_slot(&fx.arena, s3, fx.key("d")), None);
        // Ancestors are unchanged.
        assert_eq!(structure_find_slot(&fx.arena, s1, fx.key("b")), None);
    }

    #[test]
    fn test_transitions_are_shared() {
        let fx = Fx::new();
        let s0 = initial_structure(&fx.arena, &fx.registry, 0);
        let (s1a, _) = add(&fx, s0, "x");
        let (s1b, _) = add(&fx, s0, "x");
        assert_eq!(s1a, s1b, "same edge must reach the same successor");
        let (s2a, _) = add(&fx, s1a, "y");
        let (s2b, _) = add(&fx, s1a, "y");
        assert_eq!(s2a, s2b);
        assert_ne!(s1a, s2a);
    }

    #[test]
    fn test_existing_property_reports_slot() {
        let fx = Fx::new();
        let s0 = initial_structure(&fx.arena, &fx.registry, 0);
        let (s1, _) = add(&fx, s0, "x");
        match structure_add_property(&fx.arena, &fx.registry, s1, fx.key("x")) {
            AddPropertyResult::Existing { slot } => assert_eq!(slot, 0),
            other => panic!("expected existing, got {:?}", other),
        }
    }

    #[test]
    fn test_anchor_kicks_in_past_one_block() {
        let fx = Fx::new();
        let mut s = initial_structure(&fx.arena, &fx.registry, 0);
        let names: Vec<String> = (0..20).map(|i| format!("p{}", i)).collect();
        for name in &names {
            s = add(&fx, s, name).0;
        }
        let st = structure(&fx.arena, s);
        assert_eq!(st.num_slots, 20);
        assert_eq!(st.num_anchored, 16);
        assert!(st.anchor != 0);
        for (i, name) in names.iter().enumerate() {
            assert_eq!(
                structure_find_slot(&fx.arena, s, fx.key(name)),
                Some(i as u8),
                "slot of {}",
                name
            );
        }
        assert_eq!(
            structure_keys(&fx.arena, s),
            names.iter().map(|n| fx.key(n).raw()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_outline_growth_decision() {
        let fx = Fx::new();
        let s0 = initial_structure(&fx.arena, &fx.registry, 1);
        // Slot 0 is inline, slot 1 is the first outlined slot.
        let (s1, _) = add(&fx, s0, "a");
        match structure_add_property(&fx.arena, &fx.registry, s1, fx.key("b")) {
            AddPropertyResult::Transition { grow_butterfly, new_outline_capacity, .. } => {
                assert!(grow_butterfly);
                assert_eq!(new_outline_capacity, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_promotion_at_slot_cap() {
        let fx = Fx::new();
        let mut s = initial_structure(&fx.arena, &fx.registry, 0);
        for i in 0..STRUCTURE_MAX_SLOTS {
            s = add(&fx, s, &format!("k{}", i)).0;
        }
        let overflow = fx.key("overflow");
        assert_eq!(
            structure_add_property(&fx.arena, &fx.registry, s, overflow),
            AddPropertyResult::PromoteToDictionary
        );
        let (d, added) = promote_to_dictionary(&fx.arena, s, overflow);
        assert_eq!(added.slot, STRUCTURE_MAX_SLOTS);
        assert_eq!(hidden_class_kind(&fx.arena, d), HiddenClassKind::CacheableDictionary);
        assert_eq!(dict_find_slot(&fx.arena, d, fx.key("k0")), Some(0));
        assert_eq!(dict_find_slot(&fx.arena, d, fx.key("k252")), Some(252));
        assert_eq!(dict_find_slot(&fx.arena, d, overflow), Some(253));
    }

    #[test]
    fn test_metatable_transitions() {
        let fx = Fx::new();
        let s0 = initial_structure(&fx.arena, &fx.registry, 0);
        let s_mt = structure_set_metatable(&fx.arena, &fx.registry, s0, 1234);
        assert_ne!(s_mt, s0);
        assert_eq!(structure(&fx.arena, s_mt).metatable, 1234);
        assert!(structure(&fx.arena, s_mt).array_type.may_have_metatable());
        // Cached edge.
        assert_eq!(structure_set_metatable(&fx.arena, &fx.registry, s0, 1234), s_mt);
        let s_back = structure_set_metatable(&fx.arena, &fx.registry, s_mt, METATABLE_NONE);
        assert_eq!(structure(&fx.arena, s_back).metatable, METATABLE_NONE);
    }
}
