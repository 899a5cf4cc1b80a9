/// The VM.
///
/// One `Vm` owns the whole world: the address arena, the interned string
/// table, the hidden-class registries, the SPDS allocators, the code
/// registries, the metamethod name table, the global object, and the
/// root coroutine. There is no process-global state and no segment
/// register; everything threads an explicit `&mut Vm` reference. One Vm
/// must stay on one OS thread; separate Vms on separate threads are
/// independent.

use std::sync::atomic::Ordering;

use tracing::debug;

use crate::arena::VmArena;
use crate::codeblock::CodeRegistry;
use crate::coroutine::{coroutine_new, CoroutineContext, DEFAULT_STACK_SLOTS};
use crate::errors::VmError;
use crate::interpreter::run_function;
use crate::intrinsics;
use crate::metamethod::MetamethodNames;
use crate::spds::{SpdsAlloc, SpdsPageAllocator};
use crate::strings::{string_bytes, StringInterner, StringRef};
use crate::structure::{StructureRegistry, METATABLE_NONE};
use crate::table::{
    as_table, prepare_get_by_id, prepare_put_by_id, get_by_id, put_by_id, table_metatable,
    table_new, TableObject,
};
use crate::tvalue::{format_number, HeapKind, TValue};
use crate::watchpoint::{
    wpn_init, wps_add_watchpoint, wps_init, wps_state, WatchpointState, WATCHPOINT_NODE_SIZE,
    WATCHPOINT_SET_SIZE, WP_KIND_CODE_JETTISON,
};

/// Per-primitive-type metatable slots (tables carry their own).
const NUM_TYPE_METATABLES: usize = 7;

pub enum VmOutput {
    Inherit,
    Capture(Vec<u8>),
}

pub struct Vm {
    pub arena: Box<VmArena>,
    pub interner: StringInterner,
    pub structures: StructureRegistry,
    pub spds_pages: SpdsPageAllocator,
    pub spds_exec: SpdsAlloc,
    /// Reserved for a compiler thread; same shape as the execution one.
    pub spds_compiler: SpdsAlloc,
    pub code: CodeRegistry,
    pub metamethods: MetamethodNames,
    /// GeneralPtr raw of the global object table.
    pub global_object: i32,
    /// Raw TValue of the builtin `next` (pairs hands it out; the
    /// iterator-validation opcode compares against it).
    pub next_function: u64,
    /// Optional metatables for non-table value types, indexed by
    /// `type_metatable_index`.
    pub type_metatables: [i32; NUM_TYPE_METATABLES],
    /// Watchpoint set guarding "the global object has no metatable".
    pub globals_mt_wp: i32,
    pub main_co: *mut CoroutineContext,
    pub stdout: VmOutput,
}

impl Vm {
    pub fn new() -> Result<Box<Vm>, VmError> {
        Vm::with_stack_slots(DEFAULT_STACK_SLOTS)
    }

    pub fn with_stack_slots(stack_slots: u32) -> Result<Box<Vm>, VmError> {
        let arena = VmArena::new()?;
        let interner = StringInterner::new();
        let metamethods = MetamethodNames::build(&arena, &interner);
        let structures = StructureRegistry::new();
        let spds_pages = SpdsPageAllocator::new();
        let spds_exec = SpdsAlloc::new();

        let global_table = table_new(&arena, &structures, 8, 0);
        let global_object =
            ((global_table as usize as i64 - arena.base() as i64) >> 3) as i32;

        let globals_mt_wp = spds_exec.alloc(&arena, &spds_pages, WATCHPOINT_SET_SIZE);
        wps_init(&arena, globals_mt_wp);

        let main_co = coroutine_new(&arena, global_object, stack_slots);

        let mut vm = Box::new(Vm {
            arena,
            interner,
            structures,
            spds_pages,
            spds_exec,
            spds_compiler: SpdsAlloc::new(),
            code: CodeRegistry::new(),
            metamethods,
            global_object,
            next_function: 0,
            type_metatables: [METATABLE_NONE; NUM_TYPE_METATABLES],
            globals_mt_wp,
            main_co,
            stdout: VmOutput::Inherit,
        });
        intrinsics::install(&mut vm);
        debug!(strings = vm.interner.len(), "VM bootstrapped");
        Ok(vm)
    }

    // ── Strings ──────────────────────────────────────────────────────────────

    pub fn intern(&self, s: &str) -> StringRef {
        self.interner.intern(&self.arena, s.as_bytes())
    }

    pub fn make_string_value(&self, s: &str) -> TValue {
        self.make_string_value_from_bytes(s.as_bytes())
    }

    pub fn make_string_value_from_bytes(&self, bytes: &[u8]) -> TValue {
        let sref = self.interner.intern(&self.arena, bytes);
        let addr = self.arena.base() + sref.raw() as usize;
        TValue::pointer(&self.arena, addr)
    }

    pub fn as_string_ref(&self, v: TValue) -> Option<StringRef> {
        if v.is_pointer() {
            let p = v.as_ptr(&self.arena);
            if unsafe { (*p).kind } == HeapKind::String {
                return Some(StringRef::from_raw(
                    (p as usize - self.arena.base()) as u32,
                ));
            }
        }
        None
    }

    // ── Globals ──────────────────────────────────────────────────────────────

    pub fn global_table(&self) -> *mut TableObject {
        (self.arena.base() as i64 + ((self.global_object as i64) << 3)) as *mut TableObject
    }

    pub fn set_global(&self, name: &str, v: TValue) {
        let t = self.global_table();
        let key = self.intern(name);
        let ic = prepare_put_by_id(&self.arena, &self.structures, t, key);
        put_by_id(&self.arena, &self.structures, t, &ic, v);
    }

    pub fn get_global(&self, name: &str) -> TValue {
        let t = self.global_table();
        let key = self.intern(name);
        let ic = prepare_get_by_id(&self.arena, t, key);
        get_by_id(&self.arena, t, &ic)
    }

    // ── Values ───────────────────────────────────────────────────────────────

    pub fn gptr_of(&self, addr: usize) -> i32 {
        ((addr as i64 - self.arena.base() as i64) >> 3) as i32
    }

    /// Metatable (gptr raw) applying to any value: tables carry their
    /// own, other types share a per-type slot.
    pub fn metatable_for_value(&self, v: TValue) -> i32 {
        if let Some(t) = as_table(&self.arena, v) {
            return table_metatable(&self.arena, t);
        }
        self.type_metatables[type_metatable_index(&self.arena, v)]
    }

    /// `tostring` without the `__tostring` hook (the hook belongs to the
    /// string library, which is out of scope).
    pub fn tostring_value(&self, v: TValue) -> String {
        if v.is_nil() {
            return "nil".to_string();
        }
        if v.is_boolean() {
            return if v.as_boolean() { "true" } else { "false" }.to_string();
        }
        if v.is_int32() {
            return format!("{}", v.as_int32());
        }
        if v.is_double() {
            return format_number(v.as_double());
        }
        if let Some(sref) = self.as_string_ref(v) {
            return String::from_utf8_lossy(string_bytes(&self.arena, sref)).into_owned();
        }
        let kind = v.heap_kind(&self.arena).unwrap_or(HeapKind::Userdata);
        format!(
            "{}: {:#x}",
            intrinsics::heap_kind_name(kind),
            v.as_ptr(&self.arena) as usize
        )
    }

    // ── Output ───────────────────────────────────────────────────────────────

    pub fn capture_stdout(&mut self) {
        self.stdout = VmOutput::Capture(Vec::new());
    }

    pub fn take_stdout(&mut self) -> Vec<u8> {
        match &mut self.stdout {
            VmOutput::Capture(buf) => std::mem::take(buf),
            VmOutput::Inherit => Vec::new(),
        }
    }

    pub fn write_stdout(&mut self, bytes: &[u8]) {
        match &mut self.stdout {
            VmOutput::Inherit => {
                use std::io::Write;
                let _ = std::io::stdout().write_all(bytes);
            }
            VmOutput::Capture(buf) => buf.extend_from_slice(bytes),
        }
    }

    // ── Code blocks ──────────────────────────────────────────────────────────

    /// Specialize (or fetch) the CodeBlock of `ucb` for a global object,
    /// wiring the fresh block's global-access assumption into the
    /// globals watchpoint.
    pub fn code_block_for(&mut self, ucb: u32, global_object: i32) -> u32 {
        let before = self.code.num_blocks();
        let id = self.code.code_block_for(ucb, global_object);
        if self.code.num_blocks() == before {
            return id;
        }

        let gobj = (self.arena.base() as i64 + ((global_object as i64) << 3)) as *mut TableObject;
        let has_mt = table_metatable(&self.arena, gobj) != METATABLE_NONE;
        let watchable =
            wps_state(&self.arena, self.globals_mt_wp) != WatchpointState::Invalidated;
        if has_mt || !watchable {
            self.code
                .block(id)
                .globals_mt_flag
                .store(1, Ordering::Release);
        } else {
            let flag_addr =
                &self.code.block(id).globals_mt_flag as *const _ as u64;
            let node = self
                .spds_exec
                .alloc(&self.arena, &self.spds_pages, WATCHPOINT_NODE_SIZE);
            wpn_init(&self.arena, node, WP_KIND_CODE_JETTISON, flag_addr);
            wps_add_watchpoint(&self.arena, self.globals_mt_wp, node);
        }
        id
    }

    // ── Entry point ──────────────────────────────────────────────────────────

    /// Run a loaded script module's entry function to completion.
    pub fn launch_script(&mut self, module: &crate::loader::ScriptModule) -> Result<Vec<TValue>, VmError> {
        run_function(self, module.entry_point, &[])
    }

    /// Run an arbitrary function value (tests and embedders).
    pub fn call(&mut self, func: TValue, args: &[TValue]) -> Result<Vec<TValue>, VmError> {
        run_function(self, func, args)
    }
}

fn type_metatable_index(arena: &VmArena, v: TValue) -> usize {
    if v.is_nil() {
        0
    } else if v.is_boolean() {
        1
    } else if v.is_number() {
        2
    } else {
        match v.heap_kind(arena) {
            Some(HeapKind::String) => 3,
            Some(HeapKind::Function) => 4,
            Some(HeapKind::Thread) => 5,
            _ => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_bootstrap_installs_globals() {
        let vm = Vm::new().unwrap();
        for name in ["print", "pcall", "xpcall", "error", "pairs", "next", "setmetatable"] {
            assert!(
                !vm.get_global(name).is_nil(),
                "global '{}' must be installed",
                name
            );
        }
        assert_ne!(vm.next_function, 0);
        assert_eq!(vm.get_global("next").raw(), vm.next_function);
    }

    #[test]
    fn test_set_get_global_roundtrip() {
        let vm = Vm::new().unwrap();
        vm.set_global("answer", TValue::int32(42));
        assert_eq!(vm.get_global("answer"), TValue::int32(42));
        assert!(vm.get_global("missing").is_nil());
    }

    #[test]
    fn test_tostring_values() {
        let vm = Vm::new().unwrap();
        assert_eq!(vm.tostring_value(TValue::nil()), "nil");
        assert_eq!(vm.tostring_value(TValue::boolean(true)), "true");
        assert_eq!(vm.tostring_value(TValue::int32(7)), "7");
        assert_eq!(vm.tostring_value(TValue::double(610.0)), "610");
        let s = vm.make_string_value("hey");
        assert_eq!(vm.tostring_value(s), "hey");
    }
}
