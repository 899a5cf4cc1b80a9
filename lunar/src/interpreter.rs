/// The interpreter.
///
/// Dispatch is a trampoline: one loop plus an explicit `State` (current
/// code block, bytecode offset, frame base). Calls, returns, tail calls,
/// metamethod invocation and error propagation all just redirect the
/// state and continue the loop, so none of them grow the native stack.
/// The flat-loop discipline is what guaranteed-tail-call dispatch looks
/// like without `musttail`.
///
/// Metamethod-capable ops synthesize a call frame at the top of the
/// current frame whose return continuation (a closed enum, see stack.rs)
/// resumes the op: the continuation re-reads the op bytes at the
/// recorded caller bytecode offset, places the result, and picks the
/// next bytecode offset.
///
/// Protected calls (pcall/xpcall) and `error` are frame-walks over the
/// return continuations; see the comments on `throw_error`.

use tracing::trace;

use crate::bytecode::{read_i16, read_i32, read_u16, read_u8, Op};
use crate::codeblock::{
    as_function, function_new, function_upvalue_slot, Executable, FunctionObject, IcSite,
};
use crate::coroutine::{slot_ptr, slot_read, slot_write, CoroutineContext, NO_VARIADIC_RET};
use crate::errors::VmError;
use crate::intrinsics::{self, NativeId};
use crate::metamethod::MetamethodKind;
use crate::stack::{
    FrameHeader, RetCont, FRAME_HEADER_SLOTS, MIN_NIL_FILL_RETURN_VALUES, ROOT_FRAME_SENTINEL,
};
use crate::strings::{string_bytes, StringRef};
use crate::structure::{hidden_class_kind, HiddenClassKind, METATABLE_NONE};
use crate::table::{
    as_table, get_by_double, get_by_id, get_by_integer_index, prepare_get_by_id,
    prepare_get_by_integer_index, prepare_put_by_id, prepare_put_by_integer_index, put_by_double,
    put_by_id, put_by_integer_index_slow, table_length, table_new, try_put_by_integer_index_fast,
    tvalue_integer_index, GetByIdIcKind, GetByIdIcInfo, TableIterator, NextResult, TableObject,
};
use crate::tvalue::{format_number, HeapKind, TValue};
use crate::runtime::Vm;
use crate::upvalue::{close_upvalues, upvalue_for_slot, Upvalue};

/// Nesting bound for `__index`/`__newindex` table chains.
const INDEX_CHAIN_LIMIT: u32 = 2000;
/// Nested error handler bound for the protected-call walk.
const MAX_NESTED_ERRORS: u32 = 50;
/// Slack slots kept free above every frame for metamethod frames.
const STACK_SLACK: u32 = 48;

pub struct State {
    pub cb: u32,
    code: *const u8,
    pub bcu: usize,
    pub base: u32,
}

impl State {
    fn activate(&mut self, vm: &Vm) {
        self.code = vm.code.block(self.cb).code.as_ptr();
    }

    #[inline(always)]
    fn op_at(&self, off: usize) -> Op {
        unsafe { Op::from_u8(read_u8(self.code, off)) }
    }
}

struct SavedCaller {
    frame_start: u32,
    caller_base: u64,
    ret_cont: RetCont,
    caller_bcu: u32,
}

/// Execute `func(args...)` on the VM's root coroutine to completion.
pub fn run_function(vm: &mut Vm, func: TValue, args: &[TValue]) -> Result<Vec<TValue>, VmError> {
    let co = vm.main_co;
    slot_write(co, 0, func);
    for (i, &a) in args.iter().enumerate() {
        slot_write(co, FRAME_HEADER_SLOTS + i as u32, a);
    }
    let mut st = State {
        cb: 0,
        code: std::ptr::null(),
        bcu: 0,
        base: FRAME_HEADER_SLOTS,
    };
    match enter_call(
        vm,
        &mut st,
        0,
        args.len() as u32,
        RetCont::Root,
        ROOT_FRAME_SENTINEL,
        0,
        false,
        None,
    ) {
        Ok(Some(done)) => return Ok(done),
        Ok(None) => {}
        Err(e) => {
            return Err(VmError::Uncaught(vm.tostring_value(e)));
        }
    }
    dispatch_loop(vm, &mut st)
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

#[inline(always)]
fn slotv(vm: &Vm, st: &State, s: i32) -> TValue {
    if s >= 0 {
        slot_read(vm.main_co, st.base + s as u32)
    } else {
        TValue::from_raw(vm.code.block(st.cb).constants[(-s - 1) as usize])
    }
}

#[inline(always)]
fn const_raw(vm: &Vm, st: &State, s: i32) -> u64 {
    debug_assert!(s < 0);
    vm.code.block(st.cb).constants[(-s - 1) as usize]
}

#[inline(always)]
fn set_local(vm: &Vm, st: &State, idx: i32, v: TValue) {
    debug_assert!(idx >= 0);
    slot_write(vm.main_co, st.base + idx as u32, v);
}

fn int_result(i: i64) -> TValue {
    if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
        TValue::int32(i as i32)
    } else {
        TValue::double(i as f64)
    }
}

/// Lua 5.1 number coercion for arithmetic: numbers pass, strings parse.
fn coerce_number(vm: &Vm, v: TValue) -> Option<f64> {
    if let Some(n) = v.as_number() {
        return Some(n);
    }
    if v.is_pointer() {
        let p = v.as_ptr(&vm.arena);
        if unsafe { (*p).kind } == HeapKind::String {
            let sref = StringRef::from_raw((p as usize - vm.arena.base()) as u32);
            let s = std::str::from_utf8(string_bytes(&vm.arena, sref)).ok()?;
            return s.trim().parse::<f64>().ok();
        }
    }
    None
}

fn value_as_string_ref(vm: &Vm, v: TValue) -> Option<StringRef> {
    if v.is_pointer() {
        let p = v.as_ptr(&vm.arena);
        if unsafe { (*p).kind } == HeapKind::String {
            return Some(StringRef::from_raw((p as usize - vm.arena.base()) as u32));
        }
    }
    None
}

fn make_error(vm: &Vm, msg: &str) -> TValue {
    vm.make_string_value(msg)
}

fn bad_arith(vm: &Vm, a: TValue, b: TValue) -> TValue {
    let offender = if coerce_number(vm, a).is_none() { a } else { b };
    make_error(
        vm,
        &format!(
            "bad type: attempt to perform arithmetic on a {} value",
            offender.type_name(&vm.arena)
        ),
    )
}

// ---------------------------------------------------------------------------
// Metamethod resolution
// ---------------------------------------------------------------------------

/// Raw lookup of a metamethod on a metatable (gptr raw). Metamethod
/// lookup never recurses through the metatable's own metatable.
fn metamethod_of(vm: &Vm, mt_gptr: i32, kind: MetamethodKind) -> TValue {
    if mt_gptr == METATABLE_NONE {
        return TValue::nil();
    }
    debug_assert!(mt_gptr != crate::structure::METATABLE_POLY);
    let mt = (vm.arena.base() as i64 + ((mt_gptr as i64) << 3)) as *mut TableObject;
    let name = vm.metamethods.name_of(kind);
    let ic = prepare_get_by_id(&vm.arena, mt, name);
    get_by_id(&vm.arena, mt, &ic)
}

fn metamethod_for_value(vm: &Vm, v: TValue, kind: MetamethodKind) -> TValue {
    metamethod_of(vm, vm.metatable_for_value(v), kind)
}

/// Binary-op handler: first operand's metamethod, else the second's.
fn binary_metamethod(vm: &Vm, a: TValue, b: TValue, kind: MetamethodKind) -> TValue {
    let h = metamethod_for_value(vm, a, kind);
    if !h.is_nil() {
        return h;
    }
    metamethod_for_value(vm, b, kind)
}

/// Synthesize a call frame for a metamethod at the top of the current
/// frame and enter it. `st.bcu` must still point at the op being
/// resumed.
fn call_metamethod(
    vm: &mut Vm,
    st: &mut State,
    mm: TValue,
    args: &[TValue],
    cont: RetCont,
) -> Result<Option<Vec<TValue>>, TValue> {
    let co = vm.main_co;
    let fs = st.base + vm.code.block(st.cb).stack_frame_slots;
    slot_write(co, fs, mm);
    for (i, &a) in args.iter().enumerate() {
        slot_write(co, fs + FRAME_HEADER_SLOTS + i as u32, a);
    }
    enter_call(
        vm,
        st,
        fs,
        args.len() as u32,
        cont,
        st.base as u64,
        st.bcu as u32,
        false,
        None,
    )
}

// ---------------------------------------------------------------------------
// Call protocol
// ---------------------------------------------------------------------------

/// Build a frame for the callee at `func_slot` (absolute) and transfer
/// control. Mirrors the non-tail/tail frame layouts: args sit
/// at `func_slot + 4`; a variadic callee with surplus gets the header
/// relocated past the argument block; a tail call additionally slides
/// the finished frame down over the caller.
///
/// Returns Ok(Some(results)) only when a native callee completed the
/// whole program (root return), Ok(None) to continue the loop, Err on a
/// guest error to be thrown.
#[allow(clippy::too_many_arguments)]
fn enter_call(
    vm: &mut Vm,
    st: &mut State,
    func_slot: u32,
    mut num_args: u32,
    ret_cont: RetCont,
    caller_base: u64,
    caller_bcu: u32,
    pass_varret: bool,
    tail: Option<SavedCaller>,
) -> Result<Option<Vec<TValue>>, TValue> {
    let co = vm.main_co;
    let mut target_v = slot_read(co, func_slot);

    // __call fixup: shift args right, insert the original value as the
    // first argument, call the handler instead.
    let target = match as_function(&vm.arena, target_v) {
        Some(f) => f,
        None => {
            let mm = metamethod_for_value(vm, target_v, MetamethodKind::Call);
            match as_function(&vm.arena, mm) {
                Some(f) => {
                    unsafe {
                        let args_p = slot_ptr(co, func_slot + FRAME_HEADER_SLOTS);
                        std::ptr::copy(args_p, args_p.add(1), num_args as usize);
                        args_p.write(target_v);
                    }
                    slot_write(co, func_slot, mm);
                    num_args += 1;
                    target_v = mm;
                    f
                }
                None => {
                    return Err(make_error(
                        vm,
                        &format!("attempt to call a {} value", target_v.type_name(&vm.arena)),
                    ));
                }
            }
        }
    };

    if pass_varret {
        let count = unsafe { (*co).variadic_ret_count };
        debug_assert!(count != NO_VARIADIC_RET);
        let dst = func_slot + FRAME_HEADER_SLOTS + num_args;
        if dst + count + STACK_SLACK > unsafe { (*co).stack_capacity } {
            return Err(make_error(vm, "stack overflow"));
        }
        let from = unsafe { (*co).variadic_ret_slot };
        unsafe {
            std::ptr::copy(slot_ptr(co, from), slot_ptr(co, dst), count as usize);
        }
        num_args += count;
    }

    match Executable::decode(unsafe { (*target).executable }) {
        Executable::Native(id) => {
            // Native frames take all arguments as variadics: the header
            // lands right after the argument block.
            let arg_end = func_slot + FRAME_HEADER_SLOTS + num_args;
            let base = arg_end + FRAME_HEADER_SLOTS;
            if base + STACK_SLACK > unsafe { (*co).stack_capacity } {
                return Err(make_error(vm, "stack overflow"));
            }
            let hdr = FrameHeader::new(base);
            hdr.set_func(co, target_v);
            hdr.set_num_varargs(co, num_args);
            match tail {
                Some(saved) => {
                    hdr.set_caller_base(co, saved.caller_base);
                    hdr.set_return(co, saved.ret_cont, saved.caller_bcu);
                }
                None => {
                    hdr.set_caller_base(co, caller_base);
                    hdr.set_return(co, ret_cont, caller_bcu);
                }
            }
            dispatch_native(vm, st, NativeId::from_u32(id), base)
        }
        Executable::Code(cb_id) => {
            let (fixed, takes_varargs, frame_slots) = {
                let cb = vm.code.block(cb_id);
                (cb.num_fixed_params, cb.takes_varargs, cb.stack_frame_slots)
            };

            let mut arg_end = func_slot + FRAME_HEADER_SLOTS + num_args;
            let arg_needed = func_slot + FRAME_HEADER_SLOTS + fixed;
            while arg_end < arg_needed {
                slot_write(co, arg_end, TValue::nil());
                arg_end += 1;
            }

            let need_relocate = takes_varargs && num_args > fixed;
            let (mut base, num_varargs) = if need_relocate {
                (arg_end + FRAME_HEADER_SLOTS, num_args - fixed)
            } else {
                (func_slot + FRAME_HEADER_SLOTS, 0)
            };

            if base + frame_slots + STACK_SLACK > unsafe { (*co).stack_capacity } {
                return Err(make_error(vm, "stack overflow"));
            }

            if need_relocate {
                // Header goes after the full argument block (the surplus
                // args directly below it become the variadic region) and
                // the fixed args are copied above it.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        slot_ptr(co, func_slot + FRAME_HEADER_SLOTS),
                        slot_ptr(co, base),
                        fixed as usize,
                    );
                }
            }

            let (final_caller_base, final_cont, final_bcu) = match &tail {
                Some(saved) => (saved.caller_base, saved.ret_cont, saved.caller_bcu),
                None => (caller_base, ret_cont, caller_bcu),
            };

            if let Some(saved) = tail {
                // Slide the finished frame down over the caller frame
                // (including the caller's variadic region).
                let frame_start = base - FRAME_HEADER_SLOTS - num_varargs;
                let frame_len = (num_varargs + FRAME_HEADER_SLOTS + fixed) as usize;
                let dest = saved.frame_start;
                unsafe {
                    std::ptr::copy(
                        slot_ptr(co, frame_start),
                        slot_ptr(co, dest),
                        frame_len,
                    );
                }
                base = dest + num_varargs + FRAME_HEADER_SLOTS;
            }

            let hdr = FrameHeader::new(base);
            hdr.set_func(co, target_v);
            hdr.set_caller_base(co, final_caller_base);
            hdr.set_return(co, final_cont, final_bcu);
            hdr.set_num_varargs(co, num_varargs);

            // Locals beyond the parameters start out nil.
            for i in fixed..frame_slots {
                slot_write(co, base + i, TValue::nil());
            }

            st.base = base;
            st.cb = cb_id;
            st.activate(vm);
            st.bcu = 0;
            unsafe {
                (*co).cur_code_block = cb_id;
            }
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Returns
// ---------------------------------------------------------------------------

/// Return `nrets` values starting at absolute slot `ret_start` from the
/// frame at `st.base`, running the stored continuation chain until the
/// interpreter can resume (or the root frame finishes).
fn perform_return(
    vm: &mut Vm,
    st: &mut State,
    mut ret_start: u32,
    mut nrets: u32,
) -> Result<Option<Vec<TValue>>, TValue> {
    let co = vm.main_co;
    loop {
        // Close what the dying frame still holds open, then pad.
        close_upvalues(&vm.arena, co, st.base);
        for i in nrets..MIN_NIL_FILL_RETURN_VALUES {
            slot_write(co, ret_start + i, TValue::nil());
        }

        let hdr = FrameHeader::new(st.base);
        let cont = hdr.ret_cont(co);
        let caller_base = hdr.caller_base(co);
        let caller_bcu = hdr.caller_bytecode_offset(co) as usize;

        match cont {
            RetCont::Root => {
                let mut out = Vec::with_capacity(nrets as usize);
                for i in 0..nrets {
                    out.push(slot_read(co, ret_start + i));
                }
                return Ok(Some(out));
            }

            RetCont::CallOp => {
                st.base = caller_base as u32;
                restore_code_block(vm, st);
                let op = st.op_at(caller_bcu);
                match op {
                    Op::Call | Op::CallM => unsafe {
                        let base = read_i32(st.code, caller_bcu + 1);
                        let want = read_i16(st.code, caller_bcu + 7);
                        if want < 0 {
                            (*co).variadic_ret_count = nrets;
                            (*co).variadic_ret_slot = ret_start;
                        } else {
                            copy_results(co, ret_start, nrets, st.base + base as u32, want as u32);
                        }
                    },
                    Op::IterCall | Op::IterNext => unsafe {
                        let base = read_i32(st.code, caller_bcu + 1);
                        let want = read_u16(st.code, caller_bcu + 5) as u32;
                        copy_results(co, ret_start, nrets, st.base + base as u32, want);
                    },
                    other => unreachable!("CallOp continuation at non-call op {:?}", other),
                }
                st.bcu = caller_bcu + op.len();
                return Ok(None);
            }

            RetCont::ArithResume => {
                st.base = caller_base as u32;
                restore_code_block(vm, st);
                let op = st.op_at(caller_bcu);
                let dst = unsafe { read_i32(st.code, caller_bcu + 1) };
                set_local(vm, st, dst, slot_read(co, ret_start));
                st.bcu = caller_bcu + op.len();
                return Ok(None);
            }

            RetCont::IndexResume => {
                st.base = caller_base as u32;
                restore_code_block(vm, st);
                let op = st.op_at(caller_bcu);
                let dst = unsafe { read_i32(st.code, caller_bcu + 1) };
                set_local(vm, st, dst, slot_read(co, ret_start));
                st.bcu = caller_bcu + op.len();
                return Ok(None);
            }

            RetCont::NewIndexResume => {
                st.base = caller_base as u32;
                restore_code_block(vm, st);
                let op = st.op_at(caller_bcu);
                st.bcu = caller_bcu + op.len();
                return Ok(None);
            }

            RetCont::CompareResume => {
                st.base = caller_base as u32;
                restore_code_block(vm, st);
                let op = st.op_at(caller_bcu);
                let truth = slot_read(co, ret_start).is_truthy();
                let negate = matches!(op, Op::IsNeq | Op::IsNLt | Op::IsNLe);
                let jump = unsafe { read_i32(st.code, caller_bcu + 9) };
                if truth != negate {
                    st.bcu = (caller_bcu as i64 + jump as i64) as usize;
                } else {
                    st.bcu = caller_bcu + op.len();
                }
                return Ok(None);
            }

            RetCont::ConcatResume(pos) => {
                st.base = caller_base as u32;
                restore_code_block(vm, st);
                let acc = slot_read(co, ret_start);
                st.bcu = caller_bcu;
                return concat_continue(vm, st, pos as i64 - 1, acc);
            }

            RetCont::PcallSuccess | RetCont::XpcallSuccess => {
                // Prefix `true` and return again from the protecting
                // frame itself (its slot 0 guarantees ret_start >= base+1).
                debug_assert!(ret_start >= 1);
                slot_write(co, ret_start - 1, TValue::boolean(true));
                st.base = caller_base as u32;
                ret_start -= 1;
                nrets += 1;
            }

            RetCont::ErrorReturn => {
                // An xpcall error handler returned: unwind to just past
                // the xpcall frame and produce (false, handler_result).
                let result = if nrets == 0 {
                    TValue::nil()
                } else {
                    slot_read(co, ret_start)
                };
                let mut walk = FrameHeader::new(caller_base as u32);
                loop {
                    match walk.ret_cont(co) {
                        RetCont::PcallSuccess | RetCont::XpcallSuccess => break,
                        _ => {
                            debug_assert!(!walk.is_root(co));
                            walk = FrameHeader::new(walk.caller_base(co) as u32);
                        }
                    }
                }
                let protected_base = walk.caller_base(co) as u32;
                slot_write(co, protected_base, TValue::boolean(false));
                slot_write(co, protected_base + 1, result);
                st.base = protected_base;
                ret_start = protected_base;
                nrets = 2;
            }
        }
    }
}

fn restore_code_block(vm: &Vm, st: &mut State) {
    let co = vm.main_co;
    let func = FrameHeader::new(st.base).func(co);
    let f = as_function(&vm.arena, func).expect("caller frame holds a non-function");
    match Executable::decode(unsafe { (*f).executable }) {
        Executable::Code(cb) => {
            st.cb = cb;
            st.activate(vm);
            unsafe {
                (*co).cur_code_block = cb;
            }
        }
        Executable::Native(_) => unreachable!("bytecode continuation under a native frame"),
    }
}

unsafe fn copy_results(co: *mut CoroutineContext, from: u32, have: u32, to: u32, want: u32) {
    let n = have.min(want);
    std::ptr::copy(slot_ptr(co, from), slot_ptr(co, to), n as usize);
    for i in n..want {
        slot_write(co, to + i, TValue::nil());
    }
}

// ---------------------------------------------------------------------------
// Error propagation
// ---------------------------------------------------------------------------

/// The protected-call walk. Finds the nearest frame whose return
/// continuation is the pcall/xpcall success sentinel, counting crossed
/// error-handler frames; past the bound the error collapses to the fixed
/// "error in error handling" string and the frame is treated as a plain
/// pcall. For xpcall a handler frame is synthesized; for pcall (or a
/// degenerate xpcall) `(false, err)` returns directly.
fn throw_error(
    vm: &mut Vm,
    st: &mut State,
    mut err: TValue,
) -> Result<Option<Vec<TValue>>, VmError> {
    let co = vm.main_co;
    let mut nested: u32 = 0;
    let mut hdr = FrameHeader::new(st.base);
    let found = loop {
        match hdr.ret_cont(co) {
            RetCont::PcallSuccess | RetCont::XpcallSuccess => break Some(hdr),
            RetCont::ErrorReturn => nested += 1,
            _ => {}
        }
        if hdr.is_root(co) {
            break None;
        }
        hdr = FrameHeader::new(hdr.caller_base(co) as u32);
    };

    let hdr = match found {
        Some(h) => h,
        None => return Err(VmError::Uncaught(vm.tostring_value(err))),
    };

    let protected_base = hdr.caller_base(co) as u32;
    let protected_hdr = FrameHeader::new(protected_base);
    let is_xpcall = {
        let d = slot_read(co, protected_base);
        d.is_boolean() && d.as_boolean()
    };

    if nested > MAX_NESTED_ERRORS {
        // Too deep in error handlers: collapse to the fixed message and
        // treat the frame as a plain pcall.
        err = make_error(vm, "error in error handling");
    } else if is_xpcall {
        // xpcall(f, handler): the handler is the second variadic arg of
        // the protecting native frame. A non-function handler would
        // recurse forever, so it degrades like the nested-error case.
        let handler = slot_read(co, protected_hdr.varargs_start(co) + 1);
        if as_function(&vm.arena, handler).is_some() {
            let fs = st.base + vm.code.block(st.cb).stack_frame_slots;
            slot_write(co, fs, handler);
            slot_write(co, fs + FRAME_HEADER_SLOTS, err);
            match enter_call(
                vm,
                st,
                fs,
                1,
                RetCont::ErrorReturn,
                st.base as u64,
                st.bcu as u32,
                false,
                None,
            ) {
                Ok(done) => return Ok(done),
                Err(_) => err = make_error(vm, "error in error handling"),
            }
        } else {
            err = make_error(vm, "error in error handling");
        }
    }

    slot_write(co, protected_base, TValue::boolean(false));
    slot_write(co, protected_base + 1, err);
    st.base = protected_base;
    match perform_return(vm, st, protected_base, 2) {
        Ok(done) => Ok(done),
        Err(e) => throw_error(vm, st, e),
    }
}

// ---------------------------------------------------------------------------
// Native dispatch
// ---------------------------------------------------------------------------

/// Run a native function whose frame is already built at `base`. Simple
/// natives compute values and return through the normal machinery;
/// pcall/xpcall/error manipulate frames directly.
fn dispatch_native(
    vm: &mut Vm,
    st: &mut State,
    id: NativeId,
    base: u32,
) -> Result<Option<Vec<TValue>>, TValue> {
    let co = vm.main_co;
    let hdr = FrameHeader::new(base);
    let nargs = hdr.num_varargs(co);
    let va = hdr.varargs_start(co);

    match id {
        NativeId::Error => {
            let err = if nargs == 0 {
                TValue::nil()
            } else {
                slot_read(co, va)
            };
            Err(err)
        }

        NativeId::Pcall => {
            if nargs == 0 {
                // Not protected by this pcall itself.
                return Err(make_error(vm, "bad argument #1 to 'pcall' (value expected)"));
            }
            slot_write(co, base, TValue::boolean(false));
            let call_start = base + 1;
            slot_write(co, call_start, slot_read(co, va));
            let fwd = nargs - 1;
            unsafe {
                std::ptr::copy(
                    slot_ptr(co, va + 1),
                    slot_ptr(co, call_start + FRAME_HEADER_SLOTS),
                    fwd as usize,
                );
            }
            match enter_call(
                vm,
                st,
                call_start,
                fwd,
                RetCont::PcallSuccess,
                base as u64,
                0,
                false,
                None,
            ) {
                Ok(done) => Ok(done),
                Err(e) => {
                    // Errors raised while even entering the callee are
                    // protected by this pcall.
                    slot_write(co, base, TValue::boolean(false));
                    slot_write(co, base + 1, e);
                    st.base = base;
                    perform_return(vm, st, base, 2)
                }
            }
        }

        NativeId::Xpcall => {
            if nargs < 2 {
                return Err(make_error(
                    vm,
                    "bad argument #2 to 'xpcall' (value expected)",
                ));
            }
            slot_write(co, base, TValue::boolean(true));
            let call_start = base + 1;
            slot_write(co, call_start, slot_read(co, va));
            match enter_call(
                vm,
                st,
                call_start,
                0,
                RetCont::XpcallSuccess,
                base as u64,
                0,
                false,
                None,
            ) {
                Ok(done) => Ok(done),
                Err(e) => {
                    // The callee was not callable (or the stack is gone).
                    // The error is still protected: run the handler if it
                    // is a function, via a dummy success frame so the
                    // error-return walk can find this xpcall.
                    let handler = slot_read(co, va + 1);
                    if as_function(&vm.arena, handler).is_some() {
                        let dummy_base = base + 1 + FRAME_HEADER_SLOTS;
                        let dummy = FrameHeader::new(dummy_base);
                        dummy.set_func(co, hdr.func(co));
                        dummy.set_caller_base(co, base as u64);
                        dummy.set_return(co, RetCont::XpcallSuccess, 0);
                        dummy.set_num_varargs(co, 0);
                        let h_slot = dummy_base;
                        slot_write(co, h_slot, handler);
                        slot_write(co, h_slot + FRAME_HEADER_SLOTS, e);
                        let saved_base = st.base;
                        st.base = dummy_base;
                        let r = enter_call(
                            vm,
                            st,
                            h_slot,
                            1,
                            RetCont::ErrorReturn,
                            dummy_base as u64,
                            0,
                            false,
                            None,
                        );
                        match r {
                            Ok(done) => Ok(done),
                            Err(_) => {
                                st.base = saved_base;
                                slot_write(co, base, TValue::boolean(false));
                                slot_write(
                                    co,
                                    base + 1,
                                    make_error(vm, "error in error handling"),
                                );
                                st.base = base;
                                perform_return(vm, st, base, 2)
                            }
                        }
                    } else {
                        slot_write(co, base, TValue::boolean(false));
                        slot_write(co, base + 1, make_error(vm, "error in error handling"));
                        st.base = base;
                        perform_return(vm, st, base, 2)
                    }
                }
            }
        }

        _ => {
            let args: Vec<TValue> = (0..nargs).map(|i| slot_read(co, va + i)).collect();
            let rets = intrinsics::invoke_simple(vm, id, &args)?;
            for (i, &r) in rets.iter().enumerate() {
                slot_write(co, base + i as u32, r);
            }
            st.base = base;
            perform_return(vm, st, base, rets.len() as u32)
        }
    }
}

// ---------------------------------------------------------------------------
// Inline cache plumbing
// ---------------------------------------------------------------------------

fn cached_get_by_id(
    vm: &mut Vm,
    st: &State,
    ic_idx: u16,
    obj: *mut TableObject,
    key: StringRef,
) -> GetByIdIcInfo {
    let hc = unsafe { (*obj).header.hidden_class };
    if let IcSite::GetById(info) = vm.code.block(st.cb).ic_sites[ic_idx as usize] {
        if info.hidden_class == hc && info.key == key.raw() {
            return refresh_dict_mt(vm, info);
        }
    }
    let info = prepare_get_by_id(&vm.arena, obj, key);
    if !matches!(
        info.kind,
        GetByIdIcKind::MustBeNilButUncacheable | GetByIdIcKind::UncacheableDictionary
    ) {
        vm.code.block_mut(st.cb).ic_sites[ic_idx as usize] = IcSite::GetById(info);
    }
    info
}

/// Dictionary hidden classes mutate in place; re-read the metatable bit
/// so a cached record cannot go stale on setmetatable.
fn refresh_dict_mt(vm: &Vm, mut info: GetByIdIcInfo) -> GetByIdIcInfo {
    if hidden_class_kind(&vm.arena, info.hidden_class) != HiddenClassKind::Structure {
        let d = crate::structure::dictionary(&vm.arena, info.hidden_class);
        info.may_have_metatable = d.metatable != METATABLE_NONE;
    }
    info
}

// ---------------------------------------------------------------------------
// Table access with metamethod protocol
// ---------------------------------------------------------------------------

enum Access {
    Value(TValue),
    CallHandler { mm: TValue, args: [TValue; 2] },
    Error(TValue),
}

/// The `__index` chain. Returns the value, a pending handler call, or an
/// error. Raw reads go through the prepared IC records.
fn index_value(vm: &mut Vm, st: &State, ic_idx: u16, mut obj_v: TValue, key: TValue) -> Access {
    for _ in 0..INDEX_CHAIN_LIMIT {
        if let Some(t) = as_table(&vm.arena, obj_v) {
            let raw = raw_table_get(vm, st, ic_idx, t, key);
            let (v, may_mt) = match raw {
                Ok(pair) => pair,
                Err(e) => return Access::Error(e),
            };
            if !v.is_nil() || !may_mt {
                return Access::Value(v);
            }
            let h = metamethod_of(vm, crate::table::table_metatable(&vm.arena, t), MetamethodKind::Index);
            if h.is_nil() {
                return Access::Value(TValue::nil());
            }
            if as_table(&vm.arena, h).is_some() {
                obj_v = h;
                continue;
            }
            return Access::CallHandler { mm: h, args: [obj_v, key] };
        } else {
            let mt = vm.metatable_for_value(obj_v);
            if mt == METATABLE_NONE {
                return Access::Error(make_error(
                    vm,
                    &format!(
                        "bad type: attempt to index a {} value",
                        obj_v.type_name(&vm.arena)
                    ),
                ));
            }
            let h = metamethod_of(vm, mt, MetamethodKind::Index);
            if h.is_nil() {
                return Access::Error(make_error(
                    vm,
                    &format!(
                        "bad type: attempt to index a {} value",
                        obj_v.type_name(&vm.arena)
                    ),
                ));
            }
            if as_table(&vm.arena, h).is_some() {
                obj_v = h;
                continue;
            }
            return Access::CallHandler { mm: h, args: [obj_v, key] };
        }
    }
    Access::Error(make_error(vm, "loop in gettable"))
}

/// Raw table read of any key; also reports whether the nil result must
/// consult a metatable.
fn raw_table_get(
    vm: &mut Vm,
    st: &State,
    ic_idx: u16,
    t: *mut TableObject,
    key: TValue,
) -> Result<(TValue, bool), TValue> {
    if let Some(sref) = value_as_string_ref(vm, key) {
        let info = cached_get_by_id(vm, st, ic_idx, t, sref);
        return Ok((get_by_id(&vm.arena, t, &info), info.may_have_metatable));
    }
    if let Some(idx) = tvalue_integer_index(key) {
        let hc = unsafe { (*t).header.hidden_class };
        let info = match vm.code.block(st.cb).ic_sites[ic_idx as usize] {
            IcSite::GetByInt(info) if info.hidden_class == hc => info,
            _ => {
                let info = prepare_get_by_integer_index(&vm.arena, t);
                // Dictionary hidden classes mutate their array state in
                // place, so only structure-keyed records are cacheable.
                if hidden_class_kind(&vm.arena, hc) == HiddenClassKind::Structure {
                    vm.code.block_mut(st.cb).ic_sites[ic_idx as usize] = IcSite::GetByInt(info);
                }
                info
            }
        };
        return Ok((
            get_by_integer_index(&vm.arena, t, idx, &info),
            info.may_have_metatable,
        ));
    }
    if key.is_double() {
        let d = key.as_double();
        if d.is_nan() {
            let may = crate::table::table_metatable(&vm.arena, t) != METATABLE_NONE;
            return Ok((TValue::nil(), may));
        }
        let may = crate::table::table_metatable(&vm.arena, t) != METATABLE_NONE;
        return Ok((get_by_double(&vm.arena, t, d), may));
    }
    if key.is_nil() {
        let may = crate::table::table_metatable(&vm.arena, t) != METATABLE_NONE;
        return Ok((TValue::nil(), may));
    }
    Err(make_error(vm, "unsupported table key kind"))
}

/// The `__newindex` chain; performs the raw write when no handler takes
/// over. Returns Ok(None) when done, Ok(Some(pending handler call)).
fn newindex_store(
    vm: &mut Vm,
    st: &State,
    ic_idx: u16,
    mut obj_v: TValue,
    key: TValue,
    value: TValue,
) -> Result<Option<(TValue, [TValue; 3])>, TValue> {
    for _ in 0..INDEX_CHAIN_LIMIT {
        if let Some(t) = as_table(&vm.arena, obj_v) {
            let may_mt = crate::table::table_metatable(&vm.arena, t) != METATABLE_NONE;
            if may_mt {
                let (cur, _) = raw_table_get(vm, st, ic_idx, t, key)?;
                if cur.is_nil() {
                    let h = metamethod_of(
                        vm,
                        crate::table::table_metatable(&vm.arena, t),
                        MetamethodKind::NewIndex,
                    );
                    if !h.is_nil() {
                        if as_table(&vm.arena, h).is_some() {
                            obj_v = h;
                            continue;
                        }
                        return Ok(Some((h, [obj_v, key, value])));
                    }
                }
            }
            raw_table_put(vm, st, ic_idx, t, key, value)?;
            return Ok(None);
        } else {
            let mt = vm.metatable_for_value(obj_v);
            let h = metamethod_of(vm, mt, MetamethodKind::NewIndex);
            if h.is_nil() {
                return Err(make_error(
                    vm,
                    &format!(
                        "bad type: attempt to index a {} value",
                        obj_v.type_name(&vm.arena)
                    ),
                ));
            }
            if as_table(&vm.arena, h).is_some() {
                obj_v = h;
                continue;
            }
            return Ok(Some((h, [obj_v, key, value])));
        }
    }
    Err(make_error(vm, "loop in settable"))
}

/// Raw write of any key, with the PutById IC for string keys and the
/// PutByIntegerIndex fast/slow pair for integer keys.
fn raw_table_put(
    vm: &mut Vm,
    st: &State,
    ic_idx: u16,
    t: *mut TableObject,
    key: TValue,
    value: TValue,
) -> Result<(), TValue> {
    if let Some(sref) = value_as_string_ref(vm, key) {
        let hc = unsafe { (*t).header.hidden_class };
        let info = match vm.code.block(st.cb).ic_sites[ic_idx as usize] {
            IcSite::PutById(info) if info.hidden_class == hc && info.key == sref.raw() => info,
            _ => {
                let info = prepare_put_by_id(&vm.arena, &vm.structures, t, sref);
                if matches!(
                    info.kind,
                    crate::table::PutByIdIcKind::InlinedStorage
                        | crate::table::PutByIdIcKind::OutlinedStorage
                ) {
                    vm.code.block_mut(st.cb).ic_sites[ic_idx as usize] = IcSite::PutById(info);
                }
                info
            }
        };
        put_by_id(&vm.arena, &vm.structures, t, &info, value);
        return Ok(());
    }
    if let Some(idx) = tvalue_integer_index(key) {
        let hc = unsafe { (*t).header.hidden_class };
        let info = match vm.code.block(st.cb).ic_sites[ic_idx as usize] {
            IcSite::PutByInt(info) if info.hidden_class == hc => info,
            _ => {
                let info = prepare_put_by_integer_index(&vm.arena, &vm.structures, t, value);
                vm.code.block_mut(st.cb).ic_sites[ic_idx as usize] = IcSite::PutByInt(info);
                info
            }
        };
        if !try_put_by_integer_index_fast(t, idx, value, &info) {
            put_by_integer_index_slow(&vm.arena, &vm.structures, t, idx, value);
        }
        return Ok(());
    }
    if key.is_nil() {
        return Err(make_error(vm, "table index is nil"));
    }
    if key.is_double() {
        let d = key.as_double();
        if d.is_nan() {
            return Err(make_error(vm, "table index is NaN"));
        }
        put_by_double(&vm.arena, &vm.structures, t, d, value);
        return Ok(());
    }
    Err(make_error(vm, "unsupported table key kind"))
}

// ---------------------------------------------------------------------------
// Concat
// ---------------------------------------------------------------------------

fn concat_primitive(vm: &mut Vm, a: TValue, b: TValue) -> Option<TValue> {
    let part = |vm: &Vm, v: TValue| -> Option<Vec<u8>> {
        if let Some(s) = value_as_string_ref(vm, v) {
            return Some(string_bytes(&vm.arena, s).to_vec());
        }
        v.as_number().map(|n| format_number(n).into_bytes())
    };
    let mut bytes = part(vm, a)?;
    bytes.extend_from_slice(&part(vm, b)?);
    Some(vm.make_string_value_from_bytes(&bytes))
}

/// Fold the concat operands right-to-left from operand index `i`, with
/// `acc` holding the already-folded suffix. Suspends into `__concat`
/// when a pair is not primitive-concatenable.
fn concat_continue(
    vm: &mut Vm,
    st: &mut State,
    mut i: i64,
    mut acc: TValue,
) -> Result<Option<Vec<TValue>>, TValue> {
    let op_start = st.bcu;
    debug_assert_eq!(st.op_at(op_start), Op::Concat);
    let (dst, base) = unsafe {
        (
            read_i32(st.code, op_start + 1),
            read_i32(st.code, op_start + 5),
        )
    };
    while i >= 0 {
        let x = slotv(vm, st, base + i as i32);
        match concat_primitive(vm, x, acc) {
            Some(s) => {
                acc = s;
                i -= 1;
            }
            None => {
                let h = binary_metamethod(vm, x, acc, MetamethodKind::Concat);
                if h.is_nil() {
                    let offender = if value_as_string_ref(vm, x).is_none() && x.as_number().is_none()
                    {
                        x
                    } else {
                        acc
                    };
                    return Err(make_error(
                        vm,
                        &format!(
                            "bad type: attempt to concatenate a {} value",
                            offender.type_name(&vm.arena)
                        ),
                    ));
                }
                return call_metamethod(vm, st, h, &[x, acc], RetCont::ConcatResume(i as u32));
            }
        }
    }
    set_local(vm, st, dst, acc);
    st.bcu = op_start + Op::Concat.len();
    Ok(None)
}

// ---------------------------------------------------------------------------
// The dispatch loop
// ---------------------------------------------------------------------------

macro_rules! throw {
    ($vm:expr, $st:expr, $err:expr) => {
        match throw_error($vm, $st, $err)? {
            Some(done) => return Ok(done),
            None => continue,
        }
    };
}

macro_rules! resolve {
    ($vm:expr, $st:expr, $r:expr) => {
        match $r {
            Ok(Some(done)) => return Ok(done),
            Ok(None) => continue,
            Err(e) => throw!($vm, $st, e),
        }
    };
}

fn dispatch_loop(vm: &mut Vm, st: &mut State) -> Result<Vec<TValue>, VmError> {
    let co = vm.main_co;
    loop {
        let op_start = st.bcu;
        let op = st.op_at(op_start);
        trace!(bcu = op_start, ?op, base = st.base, "dispatch");
        match op {
            Op::Nop => st.bcu = op_start + Op::Nop.len(),

            Op::Mov => {
                let (dst, src) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i32(st.code, op_start + 5))
                };
                let v = slotv(vm, st, src);
                set_local(vm, st, dst, v);
                st.bcu = op_start + Op::Mov.len();
            }

            Op::KShort => {
                let (dst, val) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i16(st.code, op_start + 5))
                };
                set_local(vm, st, dst, TValue::int32(val as i32));
                st.bcu = op_start + Op::KShort.len();
            }

            Op::FillNil => {
                let (base, count) = unsafe {
                    (read_i32(st.code, op_start + 1), read_u16(st.code, op_start + 5))
                };
                for i in 0..count as i32 {
                    set_local(vm, st, base + i, TValue::nil());
                }
                st.bcu = op_start + Op::FillNil.len();
            }

            Op::UvGet => {
                let (dst, idx) = unsafe {
                    (read_i32(st.code, op_start + 1), read_u16(st.code, op_start + 5))
                };
                let f = current_function(vm, st);
                let raw = unsafe { function_upvalue_slot(f, idx as u32).read() };
                let v = read_upvalue_cell(vm, raw);
                set_local(vm, st, dst, v);
                st.bcu = op_start + Op::UvGet.len();
            }

            Op::UvPut => {
                let (idx, src) = unsafe {
                    (read_u16(st.code, op_start + 1), read_i32(st.code, op_start + 3))
                };
                let v = slotv(vm, st, src);
                let f = current_function(vm, st);
                let raw = unsafe { function_upvalue_slot(f, idx as u32).read() };
                write_upvalue_cell(vm, raw, v);
                st.bcu = op_start + Op::UvPut.len();
            }

            Op::UvClose => {
                let (base, jump) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i32(st.code, op_start + 5))
                };
                close_upvalues(&vm.arena, co, st.base + base as u32);
                st.bcu = (op_start as i64 + jump as i64) as usize;
            }

            Op::GGet => {
                let (dst, key, ic) = unsafe {
                    (
                        read_i32(st.code, op_start + 1),
                        read_i32(st.code, op_start + 5),
                        read_u16(st.code, op_start + 9),
                    )
                };
                let (gobj, globals_plain) = {
                    let cb = vm.code.block(st.cb);
                    (
                        cb.global_object,
                        cb.globals_mt_flag.load(std::sync::atomic::Ordering::Acquire) == 0,
                    )
                };
                let gaddr = (vm.arena.base() as i64 + ((gobj as i64) << 3)) as usize;
                let gtab = TValue::pointer(&vm.arena, gaddr);
                let kv = TValue::from_raw(const_raw(vm, st, key));
                if globals_plain {
                    // The watchpoint guarantees the global object carries
                    // no metatable; a nil read needs no __index fallback.
                    let t = gaddr as *mut TableObject;
                    match raw_table_get(vm, st, ic, t, kv) {
                        Ok((v, _)) => {
                            set_local(vm, st, dst, v);
                            st.bcu = op_start + Op::GGet.len();
                        }
                        Err(e) => throw!(vm, st, e),
                    }
                } else {
                    match index_value(vm, st, ic, gtab, kv) {
                        Access::Value(v) => {
                            set_local(vm, st, dst, v);
                            st.bcu = op_start + Op::GGet.len();
                        }
                        Access::CallHandler { mm, args } => {
                            resolve!(vm, st, call_metamethod(vm, st, mm, &args, RetCont::IndexResume));
                        }
                        Access::Error(e) => throw!(vm, st, e),
                    }
                }
            }

            Op::GPut => {
                let (key, src, ic) = unsafe {
                    (
                        read_i32(st.code, op_start + 1),
                        read_i32(st.code, op_start + 5),
                        read_u16(st.code, op_start + 9),
                    )
                };
                let gobj = vm.code.block(st.cb).global_object;
                let gtab = TValue::pointer(&vm.arena, (vm.arena.base() as i64 + ((gobj as i64) << 3)) as usize);
                let kv = TValue::from_raw(const_raw(vm, st, key));
                let v = slotv(vm, st, src);
                match newindex_store(vm, st, ic, gtab, kv, v) {
                    Ok(None) => st.bcu = op_start + Op::GPut.len(),
                    Ok(Some((mm, args))) => {
                        resolve!(
                            vm,
                            st,
                            call_metamethod(vm, st, mm, &args, RetCont::NewIndexResume)
                        );
                    }
                    Err(e) => throw!(vm, st, e),
                }
            }

            Op::TNew => {
                let (dst, inline_cap, hint) = unsafe {
                    (
                        read_i32(st.code, op_start + 1),
                        read_u8(st.code, op_start + 5),
                        read_u16(st.code, op_start + 6),
                    )
                };
                let t = table_new(&vm.arena, &vm.structures, inline_cap, hint as u32);
                let v = TValue::pointer(&vm.arena, t as usize);
                set_local(vm, st, dst, v);
                st.bcu = op_start + Op::TNew.len();
            }

            Op::TDup => {
                let (dst, tpl) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i32(st.code, op_start + 5))
                };
                let tpl_idx = const_raw(vm, st, tpl) as usize;
                let v = instantiate_template(vm, st, tpl_idx);
                set_local(vm, st, dst, v);
                st.bcu = op_start + Op::TDup.len();
            }

            Op::TGetById | Op::TGetByVal => {
                let (dst, base, key, ic) = unsafe {
                    (
                        read_i32(st.code, op_start + 1),
                        read_i32(st.code, op_start + 5),
                        read_i32(st.code, op_start + 9),
                        read_u16(st.code, op_start + 13),
                    )
                };
                let obj = slotv(vm, st, base);
                let kv = slotv(vm, st, key);
                match index_value(vm, st, ic, obj, kv) {
                    Access::Value(v) => {
                        set_local(vm, st, dst, v);
                        st.bcu = op_start + op.len();
                    }
                    Access::CallHandler { mm, args } => {
                        resolve!(vm, st, call_metamethod(vm, st, mm, &args, RetCont::IndexResume));
                    }
                    Access::Error(e) => throw!(vm, st, e),
                }
            }

            Op::TPutById | Op::TPutByVal => {
                let (base, key, src, ic) = unsafe {
                    (
                        read_i32(st.code, op_start + 1),
                        read_i32(st.code, op_start + 5),
                        read_i32(st.code, op_start + 9),
                        read_u16(st.code, op_start + 13),
                    )
                };
                let obj = slotv(vm, st, base);
                let kv = slotv(vm, st, key);
                let v = slotv(vm, st, src);
                match newindex_store(vm, st, ic, obj, kv, v) {
                    Ok(None) => st.bcu = op_start + op.len(),
                    Ok(Some((mm, args))) => {
                        resolve!(
                            vm,
                            st,
                            call_metamethod(vm, st, mm, &args, RetCont::NewIndexResume)
                        );
                    }
                    Err(e) => throw!(vm, st, e),
                }
            }

            Op::TGetByInt => {
                let (dst, base, idx, ic) = unsafe {
                    (
                        read_i32(st.code, op_start + 1),
                        read_i32(st.code, op_start + 5),
                        read_i16(st.code, op_start + 9),
                        read_u16(st.code, op_start + 11),
                    )
                };
                let obj = slotv(vm, st, base);
                match index_value(vm, st, ic, obj, TValue::int32(idx as i32)) {
                    Access::Value(v) => {
                        set_local(vm, st, dst, v);
                        st.bcu = op_start + Op::TGetByInt.len();
                    }
                    Access::CallHandler { mm, args } => {
                        resolve!(vm, st, call_metamethod(vm, st, mm, &args, RetCont::IndexResume));
                    }
                    Access::Error(e) => throw!(vm, st, e),
                }
            }

            Op::TPutByInt => {
                let (base, idx, src, ic) = unsafe {
                    (
                        read_i32(st.code, op_start + 1),
                        read_i16(st.code, op_start + 5),
                        read_i32(st.code, op_start + 7),
                        read_u16(st.code, op_start + 11),
                    )
                };
                let obj = slotv(vm, st, base);
                let v = slotv(vm, st, src);
                match newindex_store(vm, st, ic, obj, TValue::int32(idx as i32), v) {
                    Ok(None) => st.bcu = op_start + Op::TPutByInt.len(),
                    Ok(Some((mm, args))) => {
                        resolve!(
                            vm,
                            st,
                            call_metamethod(vm, st, mm, &args, RetCont::NewIndexResume)
                        );
                    }
                    Err(e) => throw!(vm, st, e),
                }
            }

            Op::TPutSeq => {
                let (table_s, start_s) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i32(st.code, op_start + 5))
                };
                let tv = slotv(vm, st, table_s);
                let t = match as_table(&vm.arena, tv) {
                    Some(t) => t,
                    None => throw!(vm, st, make_error(vm, "bad type: attempt to index a non-table value")),
                };
                let start = TValue::from_raw(const_raw(vm, st, start_s))
                    .as_number()
                    .unwrap_or(1.0) as i64;
                let count = unsafe { (*co).variadic_ret_count };
                let from = unsafe { (*co).variadic_ret_slot };
                debug_assert!(count != NO_VARIADIC_RET);
                // All array writes complete before anything else runs;
                // constructor targets are fresh tables with no metatable.
                for i in 0..count as i64 {
                    let v = slot_read(co, from + i as u32);
                    let info = prepare_put_by_integer_index(&vm.arena, &vm.structures, t, v);
                    if !try_put_by_integer_index_fast(t, start + i, v, &info) {
                        put_by_integer_index_slow(&vm.arena, &vm.structures, t, start + i, v);
                    }
                }
                st.bcu = op_start + Op::TPutSeq.len();
            }

            Op::NewClosure => {
                let (dst, proto) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i32(st.code, op_start + 5))
                };
                let ucb_id = const_raw(vm, st, proto) as u32;
                let v = new_closure(vm, st, ucb_id);
                set_local(vm, st, dst, v);
                st.bcu = op_start + Op::NewClosure.len();
            }

            Op::Call | Op::CallM => {
                let (base, nargs) = unsafe {
                    (read_i32(st.code, op_start + 1), read_u16(st.code, op_start + 5))
                };
                let r = enter_call(
                    vm,
                    st,
                    st.base + base as u32,
                    nargs as u32,
                    RetCont::CallOp,
                    st.base as u64,
                    op_start as u32,
                    op == Op::CallM,
                    None,
                );
                resolve!(vm, st, r);
            }

            Op::TailCall | Op::TailCallM => {
                let (base, nargs) = unsafe {
                    (read_i32(st.code, op_start + 1), read_u16(st.code, op_start + 5))
                };
                let hdr = FrameHeader::new(st.base);
                let saved = SavedCaller {
                    frame_start: hdr.frame_start(co),
                    caller_base: hdr.caller_base(co),
                    ret_cont: hdr.ret_cont(co),
                    caller_bcu: hdr.caller_bytecode_offset(co),
                };
                close_upvalues(&vm.arena, co, st.base);
                let r = enter_call(
                    vm,
                    st,
                    st.base + base as u32,
                    nargs as u32,
                    RetCont::CallOp,
                    st.base as u64,
                    op_start as u32,
                    op == Op::TailCallM,
                    Some(saved),
                );
                resolve!(vm, st, r);
            }

            Op::Ret => {
                let (base, nrets) = unsafe {
                    (read_i32(st.code, op_start + 1), read_u16(st.code, op_start + 5))
                };
                let r = perform_return(vm, st, st.base + base as u32, nrets as u32);
                resolve!(vm, st, r);
            }

            Op::RetM => {
                let (base, nfixed) = unsafe {
                    (read_i32(st.code, op_start + 1), read_u16(st.code, op_start + 5))
                };
                let ret_start = st.base + base as u32;
                let count = unsafe { (*co).variadic_ret_count };
                let from = unsafe { (*co).variadic_ret_slot };
                debug_assert!(count != NO_VARIADIC_RET);
                let append_at = ret_start + nfixed as u32;
                if from != append_at {
                    unsafe {
                        std::ptr::copy(
                            slot_ptr(co, from),
                            slot_ptr(co, append_at),
                            count as usize,
                        );
                    }
                }
                let r = perform_return(vm, st, ret_start, nfixed as u32 + count);
                resolve!(vm, st, r);
            }

            Op::Ret0 => {
                let r = perform_return(vm, st, st.base, 0);
                resolve!(vm, st, r);
            }

            Op::VarArgsToRegs => {
                let (base, count) = unsafe {
                    (read_i32(st.code, op_start + 1), read_u16(st.code, op_start + 5))
                };
                let hdr = FrameHeader::new(st.base);
                let n = hdr.num_varargs(co);
                let start = hdr.varargs_start(co);
                for i in 0..count as u32 {
                    let v = if i < n {
                        slot_read(co, start + i)
                    } else {
                        TValue::nil()
                    };
                    set_local(vm, st, base + i as i32, v);
                }
                st.bcu = op_start + Op::VarArgsToRegs.len();
            }

            Op::VarArgsToVarRet => {
                let hdr = FrameHeader::new(st.base);
                unsafe {
                    (*co).variadic_ret_count = hdr.num_varargs(co);
                    (*co).variadic_ret_slot = hdr.varargs_start(co);
                }
                st.bcu = op_start + Op::VarArgsToVarRet.len();
            }

            Op::IterValidate => {
                let (base, jump) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i32(st.code, op_start + 5))
                };
                let b = st.base + base as u32;
                let is_next_triple = slot_read(co, b - 3).raw() == vm.next_function
                    && as_table(&vm.arena, slot_read(co, b - 2)).is_some()
                    && slot_read(co, b - 1).is_nil();
                let target = (op_start as i64 + jump as i64) as usize;
                let patched = if is_next_triple { Op::IterNext } else { Op::IterCall };
                {
                    let cb = vm.code.block_mut(st.cb);
                    debug_assert!(matches!(
                        Op::from_u8(cb.code[target]),
                        Op::IterCall | Op::IterNext
                    ));
                    cb.code[target] = patched as u8;
                }
                st.bcu = target;
            }

            Op::IterCall => {
                let (base, _nrets) = unsafe {
                    (read_i32(st.code, op_start + 1), read_u16(st.code, op_start + 5))
                };
                let b = st.base + base as u32;
                slot_write(co, b, slot_read(co, b - 3));
                slot_write(co, b + FRAME_HEADER_SLOTS, slot_read(co, b - 2));
                slot_write(co, b + FRAME_HEADER_SLOTS + 1, slot_read(co, b - 1));
                let r = enter_call(
                    vm,
                    st,
                    b,
                    2,
                    RetCont::CallOp,
                    st.base as u64,
                    op_start as u32,
                    false,
                    None,
                );
                resolve!(vm, st, r);
            }

            Op::IterNext => {
                let (base, nrets) = unsafe {
                    (read_i32(st.code, op_start + 1), read_u16(st.code, op_start + 5))
                };
                let b = st.base + base as u32;
                let tab = slot_read(co, b - 2);
                let valid = slot_read(co, b - 3).raw() == vm.next_function;
                match (valid, as_table(&vm.arena, tab)) {
                    (true, Some(t)) => {
                        let key = slot_read(co, b - 1);
                        match TableIterator::next_from_key(&vm.arena, t, key) {
                            NextResult::Entry(k, v) => {
                                slot_write(co, b, k);
                                if nrets >= 2 {
                                    slot_write(co, b + 1, v);
                                }
                                for i in 2..nrets as u32 {
                                    slot_write(co, b + i, TValue::nil());
                                }
                            }
                            NextResult::End => {
                                for i in 0..nrets.max(1) as u32 {
                                    slot_write(co, b + i, TValue::nil());
                                }
                            }
                            NextResult::InvalidKey => {
                                throw!(vm, st, make_error(vm, "invalid key to 'next'"))
                            }
                        }
                        st.bcu = op_start + Op::IterNext.len();
                    }
                    _ => {
                        // Despecialize: behave as the generic iterator call.
                        vm.code.block_mut(st.cb).code[op_start] = Op::IterCall as u8;
                        // Re-dispatch the same instruction.
                    }
                }
            }

            Op::IterLoopBranch => {
                let (ctrl, jump) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i32(st.code, op_start + 5))
                };
                let c = st.base + ctrl as u32;
                let v = slot_read(co, c);
                if !v.is_nil() {
                    slot_write(co, c - 1, v);
                    st.bcu = (op_start as i64 + jump as i64) as usize;
                } else {
                    st.bcu = op_start + Op::IterLoopBranch.len();
                }
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Pow => {
                let (dst, lhs, rhs) = unsafe {
                    (
                        read_i32(st.code, op_start + 1),
                        read_i32(st.code, op_start + 5),
                        read_i32(st.code, op_start + 9),
                    )
                };
                let a = slotv(vm, st, lhs);
                let b = slotv(vm, st, rhs);
                match (coerce_number(vm, a), coerce_number(vm, b)) {
                    (Some(x), Some(y)) => {
                        let r = match op {
                            Op::Add => x + y,
                            Op::Sub => x - y,
                            Op::Mul => x * y,
                            Op::Div => x / y,
                            Op::Mod => x - (x / y).floor() * y,
                            _ => x.powf(y),
                        };
                        set_local(vm, st, dst, TValue::double(r));
                        st.bcu = op_start + op.len();
                    }
                    _ => {
                        let kind = match op {
                            Op::Add => MetamethodKind::Add,
                            Op::Sub => MetamethodKind::Sub,
                            Op::Mul => MetamethodKind::Mul,
                            Op::Div => MetamethodKind::Div,
                            Op::Mod => MetamethodKind::Mod,
                            _ => MetamethodKind::Pow,
                        };
                        let h = binary_metamethod(vm, a, b, kind);
                        if h.is_nil() {
                            throw!(vm, st, bad_arith(vm, a, b));
                        }
                        resolve!(
                            vm,
                            st,
                            call_metamethod(vm, st, h, &[a, b], RetCont::ArithResume)
                        );
                    }
                }
            }

            Op::Concat => {
                let (_, base, count) = unsafe {
                    (
                        read_i32(st.code, op_start + 1),
                        read_i32(st.code, op_start + 5),
                        read_u16(st.code, op_start + 9),
                    )
                };
                debug_assert!(count >= 2);
                let acc = slotv(vm, st, base + count as i32 - 1);
                let r = concat_continue(vm, st, count as i64 - 2, acc);
                resolve!(vm, st, r);
            }

            Op::UnaryMinus => {
                let (dst, src) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i32(st.code, op_start + 5))
                };
                let v = slotv(vm, st, src);
                match coerce_number(vm, v) {
                    Some(n) => {
                        set_local(vm, st, dst, TValue::double(-n));
                        st.bcu = op_start + Op::UnaryMinus.len();
                    }
                    None => {
                        let h = metamethod_for_value(vm, v, MetamethodKind::Unm);
                        if h.is_nil() {
                            throw!(vm, st, bad_arith(vm, v, v));
                        }
                        resolve!(
                            vm,
                            st,
                            call_metamethod(vm, st, h, &[v, v], RetCont::ArithResume)
                        );
                    }
                }
            }

            Op::IsFalsy => {
                let (dst, src) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i32(st.code, op_start + 5))
                };
                let v = slotv(vm, st, src);
                set_local(vm, st, dst, TValue::boolean(!v.is_truthy()));
                st.bcu = op_start + Op::IsFalsy.len();
            }

            Op::Length => {
                let (dst, src) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i32(st.code, op_start + 5))
                };
                let v = slotv(vm, st, src);
                if let Some(s) = value_as_string_ref(vm, v) {
                    let n = string_bytes(&vm.arena, s).len();
                    set_local(vm, st, dst, int_result(n as i64));
                    st.bcu = op_start + Op::Length.len();
                } else if let Some(t) = as_table(&vm.arena, v) {
                    let n = table_length(&vm.arena, t);
                    set_local(vm, st, dst, int_result(n));
                    st.bcu = op_start + Op::Length.len();
                } else {
                    let h = metamethod_for_value(vm, v, MetamethodKind::Len);
                    if h.is_nil() {
                        throw!(
                            vm,
                            st,
                            make_error(
                                vm,
                                &format!(
                                    "bad type: attempt to get length of a {} value",
                                    v.type_name(&vm.arena)
                                )
                            )
                        );
                    }
                    resolve!(
                        vm,
                        st,
                        call_metamethod(vm, st, h, &[v], RetCont::ArithResume)
                    );
                }
            }

            Op::IsEq | Op::IsNeq | Op::IsLt | Op::IsNLt | Op::IsLe | Op::IsNLe => {
                let (lhs, rhs, jump) = unsafe {
                    (
                        read_i32(st.code, op_start + 1),
                        read_i32(st.code, op_start + 5),
                        read_i32(st.code, op_start + 9),
                    )
                };
                let a = slotv(vm, st, lhs);
                let b = slotv(vm, st, rhs);
                let negate = matches!(op, Op::IsNeq | Op::IsNLt | Op::IsNLe);
                match compare_values(vm, a, b, op) {
                    CompareOutcome::Value(cond) => {
                        if cond != negate {
                            st.bcu = (op_start as i64 + jump as i64) as usize;
                        } else {
                            st.bcu = op_start + op.len();
                        }
                    }
                    CompareOutcome::Metamethod(h) => {
                        resolve!(
                            vm,
                            st,
                            call_metamethod(vm, st, h, &[a, b], RetCont::CompareResume)
                        );
                    }
                    CompareOutcome::Error(e) => throw!(vm, st, e),
                }
            }

            Op::BranchIfTruthy | Op::BranchIfFalsy => {
                let (src, jump) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i32(st.code, op_start + 5))
                };
                let truth = slotv(vm, st, src).is_truthy();
                let take = truth == (op == Op::BranchIfTruthy);
                if take {
                    st.bcu = (op_start as i64 + jump as i64) as usize;
                } else {
                    st.bcu = op_start + op.len();
                }
            }

            Op::CopyBranchIfTruthy | Op::CopyBranchIfFalsy => {
                let (dst, src, jump) = unsafe {
                    (
                        read_i32(st.code, op_start + 1),
                        read_i32(st.code, op_start + 5),
                        read_i32(st.code, op_start + 9),
                    )
                };
                let v = slotv(vm, st, src);
                let take = v.is_truthy() == (op == Op::CopyBranchIfTruthy);
                if take {
                    set_local(vm, st, dst, v);
                    st.bcu = (op_start as i64 + jump as i64) as usize;
                } else {
                    st.bcu = op_start + op.len();
                }
            }

            Op::Jump => {
                let jump = unsafe { read_i32(st.code, op_start + 1) };
                st.bcu = (op_start as i64 + jump as i64) as usize;
            }

            Op::ForLoopInit => {
                let (base, jump) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i32(st.code, op_start + 5))
                };
                let b = base;
                let vals: Vec<Option<f64>> = (0..3)
                    .map(|i| coerce_number(vm, slotv(vm, st, b + i)))
                    .collect();
                match (vals[0], vals[1], vals[2]) {
                    (Some(start), Some(limit), Some(step)) => {
                        set_local(vm, st, b, TValue::double(start));
                        set_local(vm, st, b + 1, TValue::double(limit));
                        set_local(vm, st, b + 2, TValue::double(step));
                        let enter = if step > 0.0 { start <= limit } else { limit <= start };
                        if enter {
                            set_local(vm, st, b + 3, TValue::double(start));
                            st.bcu = op_start + Op::ForLoopInit.len();
                        } else {
                            st.bcu = (op_start as i64 + jump as i64) as usize;
                        }
                    }
                    (None, _, _) => {
                        throw!(vm, st, make_error(vm, "'for' initial value must be a number"))
                    }
                    (_, None, _) => throw!(vm, st, make_error(vm, "'for' limit must be a number")),
                    _ => throw!(vm, st, make_error(vm, "'for' step must be a number")),
                }
            }

            Op::ForLoopStep => {
                let (base, jump) = unsafe {
                    (read_i32(st.code, op_start + 1), read_i32(st.code, op_start + 5))
                };
                let b = base;
                let (idx, limit, step) = match (
                    slotv(vm, st, b).as_number(),
                    slotv(vm, st, b + 1).as_number(),
                    slotv(vm, st, b + 2).as_number(),
                ) {
                    (Some(i), Some(l), Some(s)) => (i, l, s),
                    _ => throw!(vm, st, make_error(vm, "'for' control variables corrupted")),
                };
                let next = idx + step;
                set_local(vm, st, b, TValue::double(next));
                let cont = if step > 0.0 { next <= limit } else { limit <= next };
                if cont {
                    set_local(vm, st, b + 3, TValue::double(next));
                    st.bcu = (op_start as i64 + jump as i64) as usize;
                } else {
                    st.bcu = op_start + Op::ForLoopStep.len();
                }
            }
        }
    }
}

enum CompareOutcome {
    Value(bool),
    Metamethod(TValue),
    Error(TValue),
}

/// Lua 5.1 comparison semantics. Eq: numeric for numbers, bitwise (i.e.
/// identity; strings are interned) otherwise, with `__eq` only for two
/// values of the same non-primitive type resolving to the same handler.
/// Lt/Le: numbers, strings, or the shared metamethod.
fn compare_values(vm: &mut Vm, a: TValue, b: TValue, op: Op) -> CompareOutcome {
    let eqish = matches!(op, Op::IsEq | Op::IsNeq);
    if eqish {
        if a.is_number() && b.is_number() {
            return CompareOutcome::Value(a.as_number().unwrap() == b.as_number().unwrap());
        }
        if a.raw() == b.raw() {
            return CompareOutcome::Value(true);
        }
        // __eq fires only for same-typed heap values with one shared handler.
        if let Some(h) = shared_comparison_handler(vm, a, b, MetamethodKind::Eq) {
            return CompareOutcome::Metamethod(h);
        }
        return CompareOutcome::Value(false);
    }

    if a.is_number() && b.is_number() {
        let (x, y) = (a.as_number().unwrap(), b.as_number().unwrap());
        let r = match op {
            Op::IsLt | Op::IsNLt => x < y,
            _ => x <= y,
        };
        return CompareOutcome::Value(r);
    }
    if let (Some(sa), Some(sb)) = (value_as_string_ref(vm, a), value_as_string_ref(vm, b)) {
        let (ba, bb) = (string_bytes(&vm.arena, sa), string_bytes(&vm.arena, sb));
        let r = match op {
            Op::IsLt | Op::IsNLt => ba < bb,
            _ => ba <= bb,
        };
        return CompareOutcome::Value(r);
    }
    let kind = match op {
        Op::IsLt | Op::IsNLt => MetamethodKind::Lt,
        _ => MetamethodKind::Le,
    };
    if let Some(h) = shared_comparison_handler(vm, a, b, kind) {
        return CompareOutcome::Metamethod(h);
    }
    CompareOutcome::Error(make_error(
        vm,
        &format!(
            "bad type: attempt to compare {} with {}",
            a.type_name(&vm.arena),
            b.type_name(&vm.arena)
        ),
    ))
}

/// Both operands must be the same non-number/non-string type AND resolve
/// to the same metamethod value for the handler to apply.
fn shared_comparison_handler(
    vm: &Vm,
    a: TValue,
    b: TValue,
    kind: MetamethodKind,
) -> Option<TValue> {
    let (ka, kb) = (a.heap_kind(&vm.arena)?, b.heap_kind(&vm.arena)?);
    if ka != kb || ka == HeapKind::String {
        return None;
    }
    let ha = metamethod_for_value(vm, a, kind);
    let hb = metamethod_for_value(vm, b, kind);
    if ha.is_nil() || hb.is_nil() {
        return None;
    }
    let same = ha.raw() == hb.raw()
        || (ha.is_double() && hb.is_double() && ha.as_double() == hb.as_double());
    if same {
        Some(ha)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Closures and upvalue cells
// ---------------------------------------------------------------------------

fn current_function(vm: &Vm, st: &State) -> *mut FunctionObject {
    let f = FrameHeader::new(st.base).func(vm.main_co);
    as_function(&vm.arena, f).expect("frame function slot corrupt")
}

/// An upvalue slot holds either an Upvalue object (mutable capture) or
/// the captured value itself (immutable capture); the heap kind
/// disambiguates, since guest code can never hold an Upvalue pointer.
fn read_upvalue_cell(vm: &Vm, raw: u64) -> TValue {
    let v = TValue::from_raw(raw);
    if v.is_pointer() {
        let p = v.as_ptr(&vm.arena);
        if unsafe { (*p).kind } == HeapKind::Upvalue {
            return unsafe { (*(p as *mut Upvalue)).value() };
        }
    }
    v
}

fn write_upvalue_cell(vm: &Vm, raw: u64, value: TValue) {
    let v = TValue::from_raw(raw);
    debug_assert!(v.is_pointer());
    let p = v.as_ptr(&vm.arena);
    debug_assert_eq!(unsafe { (*p).kind }, HeapKind::Upvalue);
    unsafe {
        (*(p as *mut Upvalue)).set_value(value);
    }
}

fn new_closure(vm: &mut Vm, st: &State, ucb_id: u32) -> TValue {
    let global = vm.code.block(st.cb).global_object;
    let cb_id = vm.code_block_for(ucb_id, global);
    let metas = vm.code.unlinked(ucb_id).upvalues.clone();
    let parent = current_function(vm, st);
    let co = vm.main_co;
    let mut slots = Vec::with_capacity(metas.len());
    for meta in &metas {
        if meta.is_parent_local {
            if meta.is_immutable {
                slots.push(slot_read(co, st.base + meta.ordinal).raw());
            } else {
                let g = upvalue_for_slot(&vm.arena, co, st.base + meta.ordinal);
                let addr = (vm.arena.base() as i64 + ((g as i64) << 3)) as usize;
                slots.push(TValue::pointer(&vm.arena, addr).raw());
            }
        } else {
            slots.push(unsafe { function_upvalue_slot(parent, meta.ordinal).read() });
        }
    }
    let f = function_new(&vm.arena, Executable::Code(cb_id), &slots);
    TValue::pointer(&vm.arena, f as usize)
}

// ---------------------------------------------------------------------------
// Table templates (TDUP)
// ---------------------------------------------------------------------------

fn instantiate_template(vm: &mut Vm, st: &State, tpl_idx: usize) -> TValue {
    let ucb_id = vm.code.block(st.cb).owner;
    let (array, named, doubles) = {
        let tpl = &vm.code.unlinked(ucb_id).templates[tpl_idx];
        (tpl.array.clone(), tpl.named.clone(), tpl.doubles.clone())
    };
    let inline_cap = named.len().min(250) as u8;
    let t = table_new(&vm.arena, &vm.structures, inline_cap, array.len() as u32);
    for &(key, raw) in &named {
        let sref = StringRef::from_raw(key);
        let info = prepare_put_by_id(&vm.arena, &vm.structures, t, sref);
        put_by_id(&vm.arena, &vm.structures, t, &info, TValue::from_raw(raw));
    }
    for (i, &raw) in array.iter().enumerate() {
        let v = TValue::from_raw(raw);
        if v.is_nil() {
            continue;
        }
        let idx = i as i64 + 1;
        let info = prepare_put_by_integer_index(&vm.arena, &vm.structures, t, v);
        if !try_put_by_integer_index_fast(t, idx, v, &info) {
            put_by_integer_index_slow(&vm.arena, &vm.structures, t, idx, v);
        }
    }
    for &(kbits, raw) in &doubles {
        let k = f64::from_bits(kbits);
        let v = TValue::from_raw(raw);
        if k.fract() == 0.0 {
            put_by_integer_index_slow(&vm.arena, &vm.structures, t, k as i64, v);
        } else {
            crate::table::put_by_double(&vm.arena, &vm.structures, t, k, v);
        }
    }
    TValue::pointer(&vm.arena, t as usize)
}
