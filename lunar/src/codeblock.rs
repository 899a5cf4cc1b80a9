/// Executable code containers.
///
/// An UnlinkedCodeBlock is the immutable per-source-function record the
/// loader produces: bytecode template, constants, upvalue metadata, and
/// a lazy map from global object to the CodeBlock specialized for it. A
/// CodeBlock owns the mutable bytecode one (UnlinkedCodeBlock, global
/// object) pair executes: mutable because iterator-call sites patch
/// their own opcode byte, plus per-site inline caches. The baseline and
/// FLO code block slots exist for a tiered engine and stay empty here.
///
/// CodeBlocks and UnlinkedCodeBlocks hold Rust-owned buffers, so they
/// live in boxed registries addressed by u32 handles; everything the IC
/// contracts key on (hidden classes, strings) stays raw in the arena.
/// The handle plays the role a system-heap pointer would.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;

use crate::arena::VmArena;
use crate::table::{
    GetByIdIcInfo, GetByIntIcInfo, PutByIdIcInfo, PutByIntIcInfo,
};
use crate::tvalue::{HeapHeader, HeapKind, TValue};

#[derive(Debug, Clone, Copy)]
pub struct UpvalueMeta {
    pub is_parent_local: bool,
    pub is_immutable: bool,
    /// Parent local ordinal or parent upvalue ordinal, per the flag.
    pub ordinal: u32,
}

/// Table-constructor template (TDUP object constant).
#[derive(Debug, Clone, Default)]
pub struct TableTemplate {
    /// 1-based array part values (nil raw = hole).
    pub array: Vec<u64>,
    /// (StringRef raw, value raw) named entries in insertion order.
    pub named: Vec<(u32, u64)>,
    /// (f64 key bits, value raw) entries outside the array range.
    pub doubles: Vec<(u64, u64)>,
}

pub struct UnlinkedCodeBlock {
    pub num_fixed_params: u32,
    pub takes_varargs: bool,
    pub stack_frame_slots: u32,
    pub upvalues: Vec<UpvalueMeta>,
    /// Slot -k reads constants[k-1]. Entries are raw TValues except where
    /// the owning op says otherwise (function templates hold an
    /// UnlinkedCodeBlock handle, TDUP holds a template index).
    pub constants: Vec<u64>,
    pub templates: Vec<TableTemplate>,
    pub bytecode: Vec<u8>,
    pub num_ic_sites: u32,
    /// Enclosing prototype; wired by the loader once the parent exists.
    pub parent: Option<u32>,
    /// global object gptr -> CodeBlockId.
    specializations: RefCell<HashMap<i32, u32>>,
}

impl UnlinkedCodeBlock {
    pub fn new(
        num_fixed_params: u32,
        takes_varargs: bool,
        stack_frame_slots: u32,
        upvalues: Vec<UpvalueMeta>,
        constants: Vec<u64>,
        templates: Vec<TableTemplate>,
        bytecode: Vec<u8>,
        num_ic_sites: u32,
        parent: Option<u32>,
    ) -> Self {
        UnlinkedCodeBlock {
            num_fixed_params,
            takes_varargs,
            stack_frame_slots,
            upvalues,
            constants,
            templates,
            bytecode,
            num_ic_sites,
            parent,
            specializations: RefCell::new(HashMap::new()),
        }
    }
}

/// One interpreter inline-cache site, keyed on a hidden class and replayed
/// while the key matches.
#[derive(Debug, Clone, Copy, Default)]
pub enum IcSite {
    #[default]
    Empty,
    GetById(GetByIdIcInfo),
    PutById(PutByIdIcInfo),
    GetByInt(GetByIntIcInfo),
    PutByInt(PutByIntIcInfo),
}

pub struct CodeBlock {
    pub owner: u32,
    /// GeneralPtr raw of the global object this block is specialized for.
    pub global_object: i32,
    /// Mutable: iterator-validation sites patch opcode bytes in place.
    pub code: Vec<u8>,
    pub constants: Vec<u64>,
    pub num_fixed_params: u32,
    pub takes_varargs: bool,
    pub stack_frame_slots: u32,
    pub upvalues: Vec<UpvalueMeta>,
    pub ic_sites: Vec<IcSite>,
    /// Set (via watchpoint fire) when the global object may have grown a
    /// metatable; global accesses then take the metatable-aware path.
    pub globals_mt_flag: AtomicU32,
    /// Reserved tier slots; opaque to this engine.
    pub baseline_code_block: u32,
    pub flo_code_block: u32,
}

pub struct CodeRegistry {
    ucbs: Vec<Box<UnlinkedCodeBlock>>,
    blocks: Vec<Box<CodeBlock>>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        CodeRegistry {
            ucbs: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn add_unlinked(&mut self, ucb: UnlinkedCodeBlock) -> u32 {
        self.ucbs.push(Box::new(ucb));
        (self.ucbs.len() - 1) as u32
    }

    #[inline(always)]
    pub fn unlinked(&self, id: u32) -> &UnlinkedCodeBlock {
        &self.ucbs[id as usize]
    }

    pub fn set_parent(&mut self, child: u32, parent: u32) {
        self.ucbs[child as usize].parent = Some(parent);
    }

    #[inline(always)]
    pub fn block(&self, id: u32) -> &CodeBlock {
        &self.blocks[id as usize]
    }

    #[inline(always)]
    pub fn block_mut(&mut self, id: u32) -> &mut CodeBlock {
        &mut self.blocks[id as usize]
    }

    /// The CodeBlock of (ucb, global object), creating it on first use.
    pub fn code_block_for(&mut self, ucb_id: u32, global_object: i32) -> u32 {
        if let Some(&id) = self.ucbs[ucb_id as usize]
            .specializations
            .borrow()
            .get(&global_object)
        {
            return id;
        }
        let ucb = &self.ucbs[ucb_id as usize];
        let cb = CodeBlock {
            owner: ucb_id,
            global_object,
            code: ucb.bytecode.clone(),
            constants: ucb.constants.clone(),
            num_fixed_params: ucb.num_fixed_params,
            takes_varargs: ucb.takes_varargs,
            stack_frame_slots: ucb.stack_frame_slots,
            upvalues: ucb.upvalues.clone(),
            ic_sites: vec![IcSite::Empty; ucb.num_ic_sites as usize],
            globals_mt_flag: AtomicU32::new(0),
            baseline_code_block: 0,
            flo_code_block: 0,
        };
        self.blocks.push(Box::new(cb));
        let id = (self.blocks.len() - 1) as u32;
        self.ucbs[ucb_id as usize]
            .specializations
            .borrow_mut()
            .insert(global_object, id);
        id
    }
}

// ---------------------------------------------------------------------------
// Function objects
// ---------------------------------------------------------------------------

/// What a FunctionObject executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executable {
    Code(u32),
    Native(u32),
}

impl Executable {
    #[inline(always)]
    pub fn encode(self) -> u64 {
        match self {
            Executable::Code(id) => (id as u64) << 2,
            Executable::Native(id) => ((id as u64) << 2) | 1,
        }
    }

    #[inline(always)]
    pub fn decode(raw: u64) -> Self {
        if raw & 1 == 0 {
            Executable::Code((raw >> 2) as u32)
        } else {
            Executable::Native((raw >> 2) as u32)
        }
    }
}

#[repr(C)]
pub struct FunctionObject {
    /// aux = number of upvalue slots.
    pub header: HeapHeader,
    pub executable: u64,
    // upvalue slots follow: raw TValue of an Upvalue object for mutable
    // captures, the captured value itself for immutable ones
}

pub fn function_new(arena: &VmArena, executable: Executable, upvalues: &[u64]) -> *mut FunctionObject {
    let bytes = std::mem::size_of::<FunctionObject>() + upvalues.len() * 8;
    let f = arena.alloc_user_ptr((bytes + 7) & !7) as *mut FunctionObject;
    HeapHeader::init(f as *mut HeapHeader, HeapKind::Function, 0, upvalues.len() as u16);
    unsafe {
        (*f).executable = executable.encode();
        let slots = f.add(1) as *mut u64;
        for (i, &uv) in upvalues.iter().enumerate() {
            slots.add(i).write(uv);
        }
    }
    f
}

#[inline(always)]
pub fn function_upvalue_slot(f: *mut FunctionObject, i: u32) -> *mut u64 {
    unsafe { (f.add(1) as *mut u64).add(i as usize) }
}

#[inline(always)]
pub fn as_function(arena: &VmArena, v: TValue) -> Option<*mut FunctionObject> {
    if v.is_pointer() {
        let p = v.as_ptr(arena);
        if unsafe { (*p).kind } == HeapKind::Function {
            return Some(p as *mut FunctionObject);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_encoding() {
        for e in [Executable::Code(0), Executable::Code(77), Executable::Native(3)] {
            assert_eq!(Executable::decode(e.encode()), e);
        }
    }

    #[test]
    fn test_specialization_is_per_global_object() {
        let mut reg = CodeRegistry::new();
        let ucb = reg.add_unlinked(UnlinkedCodeBlock::new(
            0,
            false,
            4,
            vec![],
            vec![],
            vec![],
            vec![0u8],
            0,
            None,
        ));
        let a = reg.code_block_for(ucb, -100);
        let a2 = reg.code_block_for(ucb, -100);
        let b = reg.code_block_for(ucb, -200);
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(reg.block(a).owner, ucb);
        assert_eq!(reg.block(b).global_object, -200);
    }

    #[test]
    fn test_function_object_upvalue_slots() {
        let arena = VmArena::new().unwrap();
        let f = function_new(&arena, Executable::Native(1), &[11, 22, 33]);
        unsafe {
            assert_eq!((*f).header.aux, 3);
            assert_eq!(function_upvalue_slot(f, 0).read(), 11);
            assert_eq!(function_upvalue_slot(f, 2).read(), 33);
            assert_eq!(Executable::decode((*f).executable), Executable::Native(1));
        }
    }
}
