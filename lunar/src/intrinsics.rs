/// Built-in functions.
///
/// Only the surface the call protocol and the test suite require: the
/// protected-call family, metatable manipulation, raw access, the
/// iteration pair, and a few conveniences. Native functions receive all
/// arguments as the variadic region of their frame; `pcall`, `xpcall`
/// and `error` manipulate frames directly and live in the interpreter,
/// everything else goes through `invoke_simple`.

use crate::codeblock::{function_new, Executable};
use crate::metamethod::MetamethodKind;
use crate::runtime::Vm;
use crate::strings::StringRef;
use crate::structure::METATABLE_NONE;
use crate::table::{
    as_table, get_by_double, get_by_id, get_by_integer_index, prepare_get_by_id,
    prepare_get_by_integer_index, prepare_put_by_id, prepare_put_by_integer_index, put_by_double,
    put_by_id, put_by_integer_index_slow, table_metatable, table_set_metatable,
    try_put_by_integer_index_fast, tvalue_integer_index, NextResult, TableIterator, TableObject,
};
use crate::tvalue::{HeapKind, TValue};
use crate::watchpoint::wps_handle_slowpath_violation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NativeId {
    Print = 0,
    Error = 1,
    Pcall = 2,
    Xpcall = 3,
    SetMetatable = 4,
    GetMetatable = 5,
    RawGet = 6,
    RawSet = 7,
    Pairs = 8,
    Next = 9,
    Type = 10,
    ToString = 11,
    Assert = 12,
    RawEqual = 13,
}

const ALL_NATIVES: [(NativeId, &str); 14] = [
    (NativeId::Print, "print"),
    (NativeId::Error, "error"),
    (NativeId::Pcall, "pcall"),
    (NativeId::Xpcall, "xpcall"),
    (NativeId::SetMetatable, "setmetatable"),
    (NativeId::GetMetatable, "getmetatable"),
    (NativeId::RawGet, "rawget"),
    (NativeId::RawSet, "rawset"),
    (NativeId::Pairs, "pairs"),
    (NativeId::Next, "next"),
    (NativeId::Type, "type"),
    (NativeId::ToString, "tostring"),
    (NativeId::Assert, "assert"),
    (NativeId::RawEqual, "rawequal"),
];

impl NativeId {
    pub fn from_u32(v: u32) -> NativeId {
        ALL_NATIVES[v as usize].0
    }
}

/// Populate the global object and remember the `next` function (pairs
/// hands it out, and the iterator-validation opcode compares against it).
pub fn install(vm: &mut Vm) {
    for (id, name) in ALL_NATIVES {
        let f = function_new(&vm.arena, Executable::Native(id as u32), &[]);
        let fv = TValue::pointer(&vm.arena, f as usize);
        vm.set_global(name, fv);
        if id == NativeId::Next {
            vm.next_function = fv.raw();
        }
    }
}

fn arg(args: &[TValue], i: usize) -> TValue {
    args.get(i).copied().unwrap_or(TValue::nil())
}

fn want_table(vm: &Vm, args: &[TValue], i: usize, who: &str) -> Result<*mut TableObject, TValue> {
    match as_table(&vm.arena, arg(args, i)) {
        Some(t) => Ok(t),
        None => Err(vm.make_string_value(&format!(
            "bad argument #{} to '{}' (table expected)",
            i + 1,
            who
        ))),
    }
}

/// Raw (metamethod-free) table read for any key kind.
pub fn raw_get(vm: &Vm, t: *mut TableObject, key: TValue) -> TValue {
    if let Some(sref) = vm.as_string_ref(key) {
        let ic = prepare_get_by_id(&vm.arena, t, sref);
        return get_by_id(&vm.arena, t, &ic);
    }
    if let Some(idx) = tvalue_integer_index(key) {
        let ic = prepare_get_by_integer_index(&vm.arena, t);
        return get_by_integer_index(&vm.arena, t, idx, &ic);
    }
    if key.is_double() && !key.as_double().is_nan() {
        return get_by_double(&vm.arena, t, key.as_double());
    }
    TValue::nil()
}

/// Raw (metamethod-free) table write; rejects nil and NaN keys.
pub fn raw_set(vm: &Vm, t: *mut TableObject, key: TValue, value: TValue) -> Result<(), TValue> {
    if key.is_nil() {
        return Err(vm.make_string_value("table index is nil"));
    }
    if let Some(sref) = vm.as_string_ref(key) {
        let ic = prepare_put_by_id(&vm.arena, &vm.structures, t, sref);
        put_by_id(&vm.arena, &vm.structures, t, &ic, value);
        return Ok(());
    }
    if let Some(idx) = tvalue_integer_index(key) {
        let ic = prepare_put_by_integer_index(&vm.arena, &vm.structures, t, value);
        if !try_put_by_integer_index_fast(t, idx, value, &ic) {
            put_by_integer_index_slow(&vm.arena, &vm.structures, t, idx, value);
        }
        return Ok(());
    }
    if key.is_double() {
        let d = key.as_double();
        if d.is_nan() {
            return Err(vm.make_string_value("table index is NaN"));
        }
        put_by_double(&vm.arena, &vm.structures, t, d, value);
        return Ok(());
    }
    Err(vm.make_string_value("unsupported table key kind"))
}

/// Frame-free natives: compute return values from arguments. Errors are
/// thrown values.
pub fn invoke_simple(vm: &mut Vm, id: NativeId, args: &[TValue]) -> Result<Vec<TValue>, TValue> {
    match id {
        NativeId::Print => {
            let mut line = Vec::new();
            for (i, &a) in args.iter().enumerate() {
                if i > 0 {
                    line.push(b'\t');
                }
                line.extend_from_slice(vm.tostring_value(a).as_bytes());
            }
            line.push(b'\n');
            vm.write_stdout(&line);
            Ok(vec![])
        }

        NativeId::Type => {
            let name = arg(args, 0).type_name(&vm.arena);
            Ok(vec![vm.make_string_value(name)])
        }

        NativeId::ToString => {
            let s = vm.tostring_value(arg(args, 0));
            Ok(vec![vm.make_string_value(&s)])
        }

        NativeId::Assert => {
            if arg(args, 0).is_truthy() {
                Ok(args.to_vec())
            } else if args.len() >= 2 {
                Err(args[1])
            } else {
                Err(vm.make_string_value("assertion failed!"))
            }
        }

        NativeId::RawEqual => {
            let (a, b) = (arg(args, 0), arg(args, 1));
            let eq = a.raw() == b.raw()
                || (a.is_number() && b.is_number() && a.as_number() == b.as_number());
            Ok(vec![TValue::boolean(eq)])
        }

        NativeId::RawGet => {
            let t = want_table(vm, args, 0, "rawget")?;
            Ok(vec![raw_get(vm, t, arg(args, 1))])
        }

        NativeId::RawSet => {
            let t = want_table(vm, args, 0, "rawset")?;
            raw_set(vm, t, arg(args, 1), arg(args, 2))?;
            Ok(vec![arg(args, 0)])
        }

        NativeId::Pairs => {
            want_table(vm, args, 0, "pairs")?;
            Ok(vec![
                TValue::from_raw(vm.next_function),
                arg(args, 0),
                TValue::nil(),
            ])
        }

        NativeId::Next => {
            let t = want_table(vm, args, 0, "next")?;
            match TableIterator::next_from_key(&vm.arena, t, arg(args, 1)) {
                NextResult::Entry(k, v) => Ok(vec![k, v]),
                NextResult::End => Ok(vec![TValue::nil()]),
                NextResult::InvalidKey => Err(vm.make_string_value("invalid key to 'next'")),
            }
        }

        NativeId::SetMetatable => {
            let t = want_table(vm, args, 0, "setmetatable")?;
            let mt_v = arg(args, 1);
            let mt_gptr = if mt_v.is_nil() {
                METATABLE_NONE
            } else {
                match as_table(&vm.arena, mt_v) {
                    Some(mt) => vm.gptr_of(mt as usize),
                    None => {
                        return Err(vm.make_string_value(
                            "bad argument #2 to 'setmetatable' (nil or table expected)",
                        ))
                    }
                }
            };
            let cur = table_metatable(&vm.arena, t);
            if cur != METATABLE_NONE {
                let protected = metamethod_raw(vm, cur, MetamethodKind::ProtectedMt);
                if !protected.is_nil() {
                    return Err(vm.make_string_value("cannot change a protected metatable"));
                }
            }
            table_set_metatable(&vm.arena, &vm.structures, t, mt_gptr);
            // Cached global accesses assume a metatable-free global
            // object; giving it one fires the dependency.
            if vm.gptr_of(t as usize) == vm.global_object {
                wps_handle_slowpath_violation(&vm.arena, vm.globals_mt_wp);
            }
            Ok(vec![arg(args, 0)])
        }

        NativeId::GetMetatable => {
            let v = arg(args, 0);
            let mt = vm.metatable_for_value(v);
            if mt == METATABLE_NONE {
                return Ok(vec![TValue::nil()]);
            }
            let protected = metamethod_raw(vm, mt, MetamethodKind::ProtectedMt);
            if !protected.is_nil() {
                return Ok(vec![protected]);
            }
            let addr = (vm.arena.base() as i64 + ((mt as i64) << 3)) as usize;
            Ok(vec![TValue::pointer(&vm.arena, addr)])
        }

        NativeId::Error | NativeId::Pcall | NativeId::Xpcall => {
            unreachable!("frame-manipulating natives dispatch in the interpreter")
        }
    }
}

fn metamethod_raw(vm: &Vm, mt_gptr: i32, kind: MetamethodKind) -> TValue {
    let mt = (vm.arena.base() as i64 + ((mt_gptr as i64) << 3)) as *mut TableObject;
    let name: StringRef = vm.metamethods.name_of(kind);
    let ic = prepare_get_by_id(&vm.arena, mt, name);
    get_by_id(&vm.arena, mt, &ic)
}

/// Used by `type` error messages and `tostring`.
pub fn heap_kind_name(kind: HeapKind) -> &'static str {
    match kind {
        HeapKind::String => "string",
        HeapKind::Table => "table",
        HeapKind::Function => "function",
        HeapKind::Thread => "thread",
        _ => "userdata",
    }
}
