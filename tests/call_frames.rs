/// Call protocol faithfulness.
///
/// These tests verify:
///   • Fixed-arity callees see exactly min(n, k) caller args, nil padding
///     for missing params, and surplus silently discarded
///   • Variadic callees see the surplus in their variadic region
///   • Variadic-return forwarding (CallM) appends staged results
///   • Caller locals are byte-identical across a call
///   • Self tail calls run in O(1) stack (a million iterations on a tiny
///     stack)
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use lunar::bytecode::{BytecodeBuilder, Op};
use lunar::codeblock::{function_new, Executable, UnlinkedCodeBlock};
use lunar::tvalue::TValue;
use lunar::Vm;

fn add_ucb(vm: &mut Vm, fixed: u32, varargs: bool, frame: u32, b: BytecodeBuilder, constants: Vec<u64>) -> u32 {
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

fn base_constants(vm: &Vm, extra: &[&str]) -> Vec<u64> {
    let mut c = vec![
        TValue::nil().raw(),
        TValue::boolean(false).raw(),
        TValue::boolean(true).raw(),
    ];
    for s in extra {
        c.push(vm.make_string_value(s).raw());
    }
    c
}

fn make_function(vm: &mut Vm, ucb: u32) -> TValue {
    let cb = vm.code_block_for(ucb, vm.global_object);
    let f = function_new(&vm.arena, Executable::Code(cb), &[]);
    TValue::pointer(&vm.arena, f as usize)
}

/// Callee with k fixed params returning them all.
fn fixed_callee(vm: &mut Vm, k: u32) -> TValue {
    let mut b = BytecodeBuilder::new();
    b.ret(0, k as u16);
    let ucb = add_ucb(vm, k, false, k + 2, b, base_constants(vm, &[]));
    make_function(vm, ucb)
}

/// Variadic callee with k fixed params returning params then varargs.
fn variadic_callee(vm: &mut Vm, k: u32) -> TValue {
    let mut b = BytecodeBuilder::new();
    b.varargs_to_varret();
    b.ret_m(0, k as u16);
    let ucb = add_ucb(vm, k, true, k + 2, b, base_constants(vm, &[]));
    make_function(vm, ucb)
}

#[test]
fn test_call_frame_faithfulness_randomized() {
    let mut vm = Vm::new().unwrap();
    let mut rng = StdRng::seed_from_u64(0xca11);
    let mut cases: Vec<(u32, u32, bool)> = vec![
        (0, 0, false),
        (0, 0, true),
        (0, 5, false),
        (5, 0, false),
        (5, 0, true),
        (30, 49, true),
        (30, 2, true),
        (30, 2, false),
    ];
    for _ in 0..60 {
        cases.push((rng.gen_range(0..=30), rng.gen_range(0..50), rng.gen_bool(0.5)));
    }

    for (n, k, variadic) in cases {
        let f = if variadic {
            variadic_callee(&mut vm, k)
        } else {
            fixed_callee(&mut vm, k)
        };
        let args: Vec<TValue> = (0..n).map(|i| TValue::int32(1000 + i as i32)).collect();
        let rets = vm.call(f, &args).unwrap();

        let surplus = if variadic { n.saturating_sub(k) } else { 0 };
        assert_eq!(
            rets.len(),
            (k + surplus) as usize,
            "n={} k={} variadic={}",
            n,
            k,
            variadic
        );
        for i in 0..k {
            let expect = if i < n {
                TValue::int32(1000 + i as i32)
            } else {
                TValue::nil()
            };
            assert_eq!(rets[i as usize], expect, "param {} (n={} k={})", i, n, k);
        }
        for i in 0..surplus {
            assert_eq!(
                rets[(k + i) as usize],
                TValue::int32(1000 + (k + i) as i32),
                "vararg {} (n={} k={})",
                i,
                n,
                k
            );
        }
    }
}

#[test]
fn test_caller_locals_survive_calls() {
    let mut vm = Vm::new().unwrap();
    for &(n, k, variadic) in &[(0u32, 3u32, false), (3, 3, false), (8, 2, true), (6, 0, true), (2, 7, false)] {
        let callee = if variadic {
            variadic_callee(&mut vm, k)
        } else {
            fixed_callee(&mut vm, k)
        };
        vm.set_global("callee", callee);

        // Caller: marker locals 0..9, call at base 12, return the markers.
        let mut b = BytecodeBuilder::new();
        for i in 0..10 {
            b.kshort(i, (100 + i) as i16);
        }
        b.gget(12, -4); // "callee"
        for i in 0..n {
            b.kshort(16 + i as i32, (1000 + i) as i16);
        }
        b.call(12, n as u16, 0);
        b.ret(0, 10);
        let consts = base_constants(&vm, &["callee"]);
        let ucb = add_ucb(&mut vm, 0, false, 20 + n, b, consts);
        let caller = make_function(&mut vm, ucb);

        let rets = vm.call(caller, &[]).unwrap();
        assert_eq!(rets.len(), 10);
        for i in 0..10 {
            assert_eq!(
                rets[i],
                TValue::int32(100 + i as i32),
                "caller local {} scribbled (n={} k={} variadic={})",
                i,
                n,
                k,
                variadic
            );
        }
    }
}

#[test]
fn test_variadic_return_forwarding() {
    let mut vm = Vm::new().unwrap();
    // Producer returns (7, 8, 9).
    let mut b = BytecodeBuilder::new();
    b.kshort(0, 7);
    b.kshort(1, 8);
    b.kshort(2, 9);
    b.ret(0, 3);
    let prod_consts = base_constants(&vm, &[]);
    let prod_ucb = add_ucb(&mut vm, 0, false, 4, b, prod_consts);
    let prod = make_function(&mut vm, prod_ucb);
    vm.set_global("prod", prod);

    let sink = variadic_callee(&mut vm, 1);
    vm.set_global("sink", sink);

    // Caller: rets = sink(42, prod()) -> returns them.
    let mut b = BytecodeBuilder::new();
    b.gget(0, -5); // "prod"
    b.gget(4, -4); // "sink"
    b.kshort(8, 42);
    // Call prod with all results kept as variadic rets; note the call
    // base sits above sink's fixed arg.
    b.gget(9, -5);
    b.call(9, 0, -1);
    b.call_m(4, 1, -1);
    // Forward sink's variadic results as our own returns.
    b.ret_m(0, 0);
    let consts = base_constants(&vm, &["sink", "prod"]);
    let ucb = add_ucb(&mut vm, 0, false, 24, b, consts);
    let caller = make_function(&mut vm, ucb);

    let rets = vm.call(caller, &[]).unwrap();
    // sink(42, 7, 8, 9): fixed param 42, varargs (7, 8, 9).
    assert_eq!(
        rets,
        vec![
            TValue::int32(42),
            TValue::int32(7),
            TValue::int32(8),
            TValue::int32(9)
        ]
    );
}

#[test]
fn test_tail_call_stack_is_constant() {
    // A 256-slot stack survives a million self tail calls only if each
    // call reuses the frame.
    let mut vm = Vm::with_stack_slots(256).unwrap();

    let mut b = BytecodeBuilder::new();
    b.kshort(1, 0);
    let done = b.compare(Op::IsEq, 0, 1);
    b.gget(4, -4); // "loopf"
    b.kshort(2, 1);
    b.arith(Op::Sub, 8, 0, 2);
    b.tail_call(4, 1);
    let exit = b.here();
    b.kshort(3, 42);
    b.ret(3, 1);
    b.patch_jump(done, exit);
    let consts = base_constants(&vm, &["loopf"]);
    let ucb = add_ucb(&mut vm, 1, false, 12, b, consts);
    let f = make_function(&mut vm, ucb);
    vm.set_global("loopf", f);

    let rets = vm.call(f, &[TValue::double(1_000_000.0)]).unwrap();
    assert_eq!(rets, vec![TValue::int32(42)]);
}
