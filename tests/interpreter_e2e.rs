/// End-to-end interpreter scenarios.
///
/// These tests verify:
///   • Recursive fib through explicit bytecode (calls, compare-branch)
///   • `__index` function metamethod dispatch with rawget untouched
///   • pcall catching a bad-type error
///   • xpcall handler chains collapsing to "error in error handling"
///   • Variadic table-constructor puts completing before anything else
///   • The iterator-call site rewriting itself to the specialized form
use lunar::bytecode::{BytecodeBuilder, Op};
use lunar::codeblock::{function_new, Executable, UnlinkedCodeBlock};
use lunar::intrinsics;
use lunar::table::{table_length, table_new, table_set_metatable, TableObject};
use lunar::tvalue::TValue;
use lunar::Vm;

fn add_ucb(
    vm: &mut Vm,
    fixed: u32,
    varargs: bool,
    frame: u32,
    b: BytecodeBuilder,
    constants: Vec<u64>,
) -> u32 {
    let (code, ics) = b.finish();
    vm.code.add_unlinked(UnlinkedCodeBlock::new(
        fixed,
        varargs,
        frame,
        vec![],
        constants,
        vec![],
        code,
        ics,
        None,
    ))
}

fn consts(vm: &Vm, strings: &[&str], numbers: &[f64]) -> Vec<u64> {
    let mut c = vec![
        TValue::nil().raw(),
        TValue::boolean(false).raw(),
        TValue::boolean(true).raw(),
    ];
    for s in strings {
        c.push(vm.make_string_value(s).raw());
    }
    for &n in numbers {
        c.push(TValue::double(n).raw());
    }
    c
}

fn make_function(vm: &mut Vm, ucb: u32) -> TValue {
    let cb = vm.code_block_for(ucb, vm.global_object);
    let f = function_new(&vm.arena, Executable::Code(cb), &[]);
    TValue::pointer(&vm.arena, f as usize)
}

fn table_value(vm: &Vm, t: *mut TableObject) -> TValue {
    TValue::pointer(&vm.arena, t as usize)
}

fn string_of(vm: &Vm, v: TValue) -> String {
    vm.tostring_value(v)
}

// ── Scenario 1: fib ──────────────────────────────────────────────────────────

#[test]
fn test_fib_via_explicit_bytecode() {
    let mut vm = Vm::new().unwrap();

    // fib(n) = n < 3 and 1 or fib(n-1) + fib(n-2)
    let mut b = BytecodeBuilder::new();
    b.kshort(1, 3);
    let base_case = b.compare(Op::IsLt, 0, 1);
    b.gget(4, -4); // "fib"
    b.kshort(2, 1);
    b.arith(Op::Sub, 8, 0, 2);
    b.call(4, 1, 1);
    b.gget(5, -4);
    b.kshort(2, 2);
    b.arith(Op::Sub, 9, 0, 2);
    b.call(5, 1, 1);
    b.arith(Op::Add, 3, 4, 5);
    b.ret(3, 1);
    let target = b.here();
    b.kshort(3, 1);
    b.ret(3, 1);
    b.patch_jump(base_case, target);

    let c = consts(&vm, &["fib"], &[]);
    let ucb = add_ucb(&mut vm, 1, false, 12, b, c);
    let fib = make_function(&mut vm, ucb);
    vm.set_global("fib", fib);

    let rets = vm.call(fib, &[TValue::int32(15)]).unwrap();
    assert_eq!(rets[0].as_number(), Some(610.0));
}

// ── Scenario 2: tables and metatables ────────────────────────────────────────

#[test]
fn test_index_metamethod_function() {
    let mut vm = Vm::new().unwrap();

    // t = {1, 2, 3}
    let t = table_new(&vm.arena, &vm.structures, 0, 4);
    for i in 1..=3 {
        intrinsics::raw_set(&vm, t, TValue::int32(i), TValue::int32(i)).unwrap();
    }

    // mt.__index = function(_, k) return k * 10 end
    let mut b = BytecodeBuilder::new();
    b.kshort(2, 10);
    b.arith(Op::Mul, 3, 1, 2);
    b.ret(3, 1);
    let c = consts(&vm, &[], &[]);
    let ucb = add_ucb(&mut vm, 2, false, 8, b, c);
    let index_fn = make_function(&mut vm, ucb);

    let mt = table_new(&vm.arena, &vm.structures, 2, 0);
    intrinsics::raw_set(&vm, mt, vm.make_string_value("__index"), index_fn).unwrap();
    table_set_metatable(&vm.arena, &vm.structures, t, vm.gptr_of(mt as usize));

    // rawget(t, 5) stays nil while t[5] routes through the handler.
    assert!(intrinsics::raw_get(&vm, t, TValue::int32(5)).is_nil());
    assert_eq!(table_length(&vm.arena, t), 3);

    // main(t) = t[5]
    let mut b = BytecodeBuilder::new();
    b.kshort(1, 5);
    b.tget_by_val(2, 0, 1);
    b.ret(2, 1);
    let c = consts(&vm, &[], &[]);
    let ucb = add_ucb(&mut vm, 1, false, 8, b, c);
    let main = make_function(&mut vm, ucb);

    let rets = vm.call(main, &[table_value(&vm, t)]).unwrap();
    assert_eq!(rets[0].as_number(), Some(50.0));

    // Raw array reads are unaffected by the metatable.
    let mut b = BytecodeBuilder::new();
    b.kshort(1, 2);
    b.tget_by_val(2, 0, 1);
    b.ret(2, 1);
    let c = consts(&vm, &[], &[]);
    let ucb = add_ucb(&mut vm, 1, false, 8, b, c);
    let main2 = make_function(&mut vm, ucb);
    let rets = vm.call(main2, &[table_value(&vm, t)]).unwrap();
    assert_eq!(rets[0], TValue::int32(2));
}

// ── Scenario 3: pcall of a failing op ────────────────────────────────────────

fn erroring_function(vm: &mut Vm) -> TValue {
    // local x = nil; return x.y
    let mut b = BytecodeBuilder::new();
    b.mov(0, -1);
    b.tget_by_id(1, 0, -4); // "y"
    b.ret(1, 1);
    let c = consts(vm, &["y"], &[]);
    let ucb = add_ucb(vm, 0, false, 8, b, c);
    make_function(vm, ucb)
}

#[test]
fn test_pcall_catches_bad_type() {
    let mut vm = Vm::new().unwrap();
    let f = erroring_function(&mut vm);
    let pcall = vm.get_global("pcall");

    let rets = vm.call(pcall, &[f]).unwrap();
    assert_eq!(rets[0], TValue::boolean(false));
    let msg = string_of(&vm, rets[1]);
    assert!(msg.contains("bad type"), "unexpected message: {}", msg);
    assert!(
        vm.as_string_ref(rets[1]).is_some(),
        "error object must be a string"
    );
}

#[test]
fn test_pcall_success_prepends_true() {
    let mut vm = Vm::new().unwrap();
    let mut b = BytecodeBuilder::new();
    b.kshort(0, 11);
    b.kshort(1, 22);
    b.ret(0, 2);
    let c = consts(&vm, &[], &[]);
    let ucb = add_ucb(&mut vm, 0, false, 4, b, c);
    let f = make_function(&mut vm, ucb);
    let pcall = vm.get_global("pcall");
    let rets = vm.call(pcall, &[f]).unwrap();
    assert_eq!(rets[0], TValue::boolean(true));
    assert_eq!(rets[1], TValue::int32(11));
    assert_eq!(rets[2], TValue::int32(22));
}

// ── Scenario 4: xpcall with an erroring handler chain ────────────────────────

#[test]
fn test_xpcall_nested_error_handlers_collapse() {
    let mut vm = Vm::new().unwrap();
    let f = erroring_function(&mut vm);
    let handler = erroring_function(&mut vm);
    let xpcall = vm.get_global("xpcall");

    let rets = vm.call(xpcall, &[f, handler]).unwrap();
    assert_eq!(rets[0], TValue::boolean(false));
    assert_eq!(string_of(&vm, rets[1]), "error in error handling");
}

#[test]
fn test_xpcall_handler_receives_error() {
    let mut vm = Vm::new().unwrap();
    let f = erroring_function(&mut vm);

    // handler(e) = 99 (discards the error object)
    let mut b = BytecodeBuilder::new();
    b.kshort(1, 99);
    b.ret(1, 1);
    let c = consts(&vm, &[], &[]);
    let ucb = add_ucb(&mut vm, 1, false, 4, b, c);
    let handler = make_function(&mut vm, ucb);

    let xpcall = vm.get_global("xpcall");
    let rets = vm.call(xpcall, &[f, handler]).unwrap();
    assert_eq!(rets[0], TValue::boolean(false));
    assert_eq!(rets[1], TValue::int32(99));
}

// ── Scenario 5: variadic constructor puts ────────────────────────────────────

#[test]
fn test_variadic_table_constructor_completes_before_read() {
    let mut vm = Vm::new().unwrap();

    // function(...) local t = {...}; return t[1], t[2], t[3] end
    let mut b = BytecodeBuilder::new();
    b.tnew(0, 0, 4);
    b.varargs_to_varret();
    b.tput_seq(0, -4); // start index constant 1
    b.tget_by_int(1, 0, 1);
    b.tget_by_int(2, 0, 2);
    b.tget_by_int(3, 0, 3);
    b.ret(1, 3);
    let c = consts(&vm, &[], &[1.0]);
    let ucb = add_ucb(&mut vm, 0, true, 8, b, c);
    let f = make_function(&mut vm, ucb);

    let rets = vm
        .call(f, &[TValue::int32(7), TValue::int32(8)])
        .unwrap();
    assert_eq!(rets[0], TValue::int32(7));
    assert_eq!(rets[1], TValue::int32(8));
    assert_eq!(rets[2], TValue::nil());
}

// ── Scenario 6: iterator-call self-rewrite ───────────────────────────────────

/// Builds `function(t) local n = 0; for k, v in pairs(t) do n = n + 1 end;
/// return n end` and reports the byte offset of the iterator-call op.
fn pairs_loop(vm: &mut Vm) -> (TValue, u32, usize) {
    let mut b = BytecodeBuilder::new();
    b.gget(1, -4); // "pairs"
    b.mov(5, 0);
    b.call(1, 1, 3); // slots 1,2,3 = next, t, nil
    b.kshort(12, 0); // counter
    let validate = b.iter_validate(4);
    let body = b.here();
    b.kshort(13, 1);
    b.arith(Op::Add, 12, 12, 13);
    let iter_site = b.here();
    b.iter_call(4, 2);
    let loop_branch = b.iter_loop_branch(4);
    b.ret(12, 1);
    b.patch_jump(validate, iter_site);
    b.patch_jump(loop_branch, body);

    let c = consts(vm, &["pairs"], &[]);
    let ucb = add_ucb(vm, 1, false, 16, b, c);
    let cb = vm.code_block_for(ucb, vm.global_object);
    let f = function_new(&vm.arena, Executable::Code(cb), &[]);
    (TValue::pointer(&vm.arena, f as usize), cb, iter_site)
}

#[test]
fn test_iterator_call_rewrites_to_next_form() {
    let mut vm = Vm::new().unwrap();
    let (f, cb, iter_site) = pairs_loop(&mut vm);

    let t = table_new(&vm.arena, &vm.structures, 2, 4);
    intrinsics::raw_set(&vm, t, TValue::int32(1), TValue::int32(10)).unwrap();
    intrinsics::raw_set(&vm, t, TValue::int32(2), TValue::int32(20)).unwrap();
    intrinsics::raw_set(&vm, t, vm.make_string_value("a"), TValue::int32(30)).unwrap();

    assert_eq!(
        Op::from_u8(vm.code.block(cb).code[iter_site]),
        Op::IterCall,
        "site starts generic"
    );
    let rets = vm.call(f, &[table_value(&vm, t)]).unwrap();
    assert_eq!(rets[0].as_number(), Some(3.0));
    assert_eq!(
        Op::from_u8(vm.code.block(cb).code[iter_site]),
        Op::IterNext,
        "a provably-next loop must specialize its call opcode"
    );

    // Running again keeps the specialized form and the same result.
    let rets = vm.call(f, &[table_value(&vm, t)]).unwrap();
    assert_eq!(rets[0].as_number(), Some(3.0));
    assert_eq!(Op::from_u8(vm.code.block(cb).code[iter_site]), Op::IterNext);
}

#[test]
fn test_iterator_with_custom_function_stays_generic() {
    let mut vm = Vm::new().unwrap();

    // function(t) local n = 0; for k in myiter, t, nil do n = n + 1 end;
    // return n end -- where myiter always returns nil
    let mut b = BytecodeBuilder::new();
    b.gget(1, -4); // "myiter"
    b.mov(2, 0);
    b.mov(3, -1); // nil
    b.kshort(12, 0);
    let validate = b.iter_validate(4);
    let body = b.here();
    b.kshort(13, 1);
    b.arith(Op::Add, 12, 12, 13);
    let iter_site = b.here();
    b.iter_call(4, 2);
    let loop_branch = b.iter_loop_branch(4);
    b.ret(12, 1);
    b.patch_jump(validate, iter_site);
    b.patch_jump(loop_branch, body);
    let c = consts(&vm, &["myiter"], &[]);
    let ucb = add_ucb(&mut vm, 1, false, 16, b, c);
    let cb = vm.code_block_for(ucb, vm.global_object);
    let f = function_new(&vm.arena, Executable::Code(cb), &[]);
    let f = TValue::pointer(&vm.arena, f as usize);

    // myiter() = nil
    let mut b = BytecodeBuilder::new();
    b.ret0();
    let c = consts(&vm, &[], &[]);
    let it_ucb = add_ucb(&mut vm, 0, true, 4, b, c);
    let myiter = make_function(&mut vm, it_ucb);
    vm.set_global("myiter", myiter);

    let t = table_new(&vm.arena, &vm.structures, 0, 0);
    let rets = vm.call(f, &[table_value(&vm, t)]).unwrap();
    assert_eq!(rets[0].as_number(), Some(0.0));
    assert_eq!(
        Op::from_u8(vm.code.block(cb).code[iter_site]),
        Op::IterCall,
        "a non-next iterator must keep the generic call"
    );
}

// ── Closures and upvalues ────────────────────────────────────────────────────

#[test]
fn test_counter_closure_shares_upvalue_across_close() {
    let mut vm = Vm::new().unwrap();

    // inner() = (uv0 = uv0 + 1; return uv0), capturing the parent's
    // local 0 mutably.
    let mut b = BytecodeBuilder::new();
    b.uv_get(0, 0);
    b.kshort(1, 1);
    b.arith(Op::Add, 2, 0, 1);
    b.uv_put(0, 2);
    b.ret(2, 1);
    let (code, ics) = b.finish();
    let inner_ucb = vm.code.add_unlinked(UnlinkedCodeBlock::new(
        0,
        false,
        4,
        vec![lunar::codeblock::UpvalueMeta {
            is_parent_local: true,
            is_immutable: false,
            ordinal: 0,
        }],
        consts(&vm, &[], &[]),
        vec![],
        code,
        ics,
        None,
    ));

    // make_counter() = (local n = 0; return function() ... end)
    let mut b = BytecodeBuilder::new();
    b.kshort(0, 0);
    b.new_closure(1, -4); // constant 3 holds the inner prototype handle
    b.ret(1, 1);
    let mut c = consts(&vm, &[], &[]);
    c.push(inner_ucb as u64);
    let make_ucb = add_ucb(&mut vm, 0, false, 8, b, c);
    let make_counter = make_function(&mut vm, make_ucb);

    let counter = vm.call(make_counter, &[]).unwrap()[0];
    // The enclosing frame is gone, so the upvalue must have closed.
    let r1 = vm.call(counter, &[]).unwrap();
    let r2 = vm.call(counter, &[]).unwrap();
    let r3 = vm.call(counter, &[]).unwrap();
    assert_eq!(r1[0].as_number(), Some(1.0));
    assert_eq!(r2[0].as_number(), Some(2.0));
    assert_eq!(r3[0].as_number(), Some(3.0));

    // Two counters do not share state.
    let counter2 = vm.call(make_counter, &[]).unwrap()[0];
    let r = vm.call(counter2, &[]).unwrap();
    assert_eq!(r[0].as_number(), Some(1.0));
    let r = vm.call(counter, &[]).unwrap();
    assert_eq!(r[0].as_number(), Some(4.0));
}

#[test]
fn test_immutable_capture_copies_value() {
    let mut vm = Vm::new().unwrap();

    // inner() = uv0 (an immutable capture of the parent's local 0)
    let mut b = BytecodeBuilder::new();
    b.uv_get(0, 0);
    b.ret(0, 1);
    let (code, ics) = b.finish();
    let inner_ucb = vm.code.add_unlinked(UnlinkedCodeBlock::new(
        0,
        false,
        2,
        vec![lunar::codeblock::UpvalueMeta {
            is_parent_local: true,
            is_immutable: true,
            ordinal: 0,
        }],
        consts(&vm, &[], &[]),
        vec![],
        code,
        ics,
        None,
    ));

    // parent(x) = (local v = x; f = closure; v = 999 <- not observed; return f)
    let mut b = BytecodeBuilder::new();
    b.new_closure(1, -4);
    b.kshort(0, 999);
    b.ret(1, 1);
    let mut c = consts(&vm, &[], &[]);
    c.push(inner_ucb as u64);
    let parent_ucb = add_ucb(&mut vm, 1, false, 8, b, c);
    let parent = make_function(&mut vm, parent_ucb);

    let f = vm.call(parent, &[TValue::int32(5)]).unwrap()[0];
    let r = vm.call(f, &[]).unwrap();
    assert_eq!(r[0], TValue::int32(5), "immutable capture is by value");
}

#[test]
fn test_uvclose_op_closes_before_frame_exit() {
    let mut vm = Vm::new().unwrap();

    // inner() = uv0
    let mut b = BytecodeBuilder::new();
    b.uv_get(0, 0);
    b.ret(0, 1);
    let (code, ics) = b.finish();
    let inner_ucb = vm.code.add_unlinked(UnlinkedCodeBlock::new(
        0,
        false,
        2,
        vec![lunar::codeblock::UpvalueMeta {
            is_parent_local: true,
            is_immutable: false,
            ordinal: 0,
        }],
        consts(&vm, &[], &[]),
        vec![],
        code,
        ics,
        None,
    ));

    // parent() = (local v = 7; f = closure over v; close v; v = 1000;
    // return f) -- f must still see 7.
    let mut b = BytecodeBuilder::new();
    b.kshort(0, 7);
    b.new_closure(1, -4);
    let j = b.uv_close(0);
    let after = b.here();
    b.patch_jump(j, after);
    b.kshort(0, 1000);
    b.ret(1, 1);
    let mut c = consts(&vm, &[], &[]);
    c.push(inner_ucb as u64);
    let parent_ucb = add_ucb(&mut vm, 0, false, 8, b, c);
    let parent = make_function(&mut vm, parent_ucb);

    let f = vm.call(parent, &[]).unwrap()[0];
    let r = vm.call(f, &[]).unwrap();
    assert_eq!(r[0], TValue::int32(7), "UvClose must snapshot the slot");
}

// ── Metamethod arithmetic through continuations ──────────────────────────────

#[test]
fn test_add_metamethod_on_tables() {
    let mut vm = Vm::new().unwrap();

    // mt.__add = function(a, b) return 123 end
    let mut b = BytecodeBuilder::new();
    b.kshort(2, 123);
    b.ret(2, 1);
    let c = consts(&vm, &[], &[]);
    let ucb = add_ucb(&mut vm, 2, false, 8, b, c);
    let add_fn = make_function(&mut vm, ucb);

    let mt = table_new(&vm.arena, &vm.structures, 2, 0);
    intrinsics::raw_set(&vm, mt, vm.make_string_value("__add"), add_fn).unwrap();
    let ta = table_new(&vm.arena, &vm.structures, 0, 0);
    let tb = table_new(&vm.arena, &vm.structures, 0, 0);
    table_set_metatable(&vm.arena, &vm.structures, ta, vm.gptr_of(mt as usize));

    // main(a, b) = a + b
    let mut b = BytecodeBuilder::new();
    b.arith(Op::Add, 2, 0, 1);
    b.ret(2, 1);
    let c = consts(&vm, &[], &[]);
    let ucb = add_ucb(&mut vm, 2, false, 8, b, c);
    let main = make_function(&mut vm, ucb);

    let rets = vm
        .call(main, &[table_value(&vm, ta), table_value(&vm, tb)])
        .unwrap();
    assert_eq!(rets[0], TValue::int32(123));

    // Without any handler the op raises, and pcall catches it.
    let pcall = vm.get_global("pcall");
    let mut b = BytecodeBuilder::new();
    b.arith(Op::Add, 2, 0, 1);
    b.ret(2, 1);
    let c = consts(&vm, &[], &[]);
    let ucb = add_ucb(&mut vm, 2, false, 8, b, c);
    let main2 = make_function(&mut vm, ucb);
    let rets = vm
        .call(pcall, &[main2, table_value(&vm, tb), table_value(&vm, tb)])
        .unwrap();
    assert_eq!(rets[0], TValue::boolean(false));
    assert!(string_of(&vm, rets[1]).contains("bad type"));
}
