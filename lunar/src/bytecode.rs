/// Bytecode Instruction Set - Variable-Width, Byte-Aligned
///
/// INSTRUCTION FORMAT:
///
///   | OP: 8 | operands... |
///
/// Operands are packed little-endian with no padding. A "slot" operand
/// is a 32-bit signed integer: non-negative values index a frame local,
/// negative values index the constant table (-1 is the first constant,
/// -2 the second, ...). Branch operands are 32-bit signed byte deltas
/// relative to the START of the branching instruction.
///
/// CALL CONVENTION: a call site reserves the stack-frame-header gap
/// between the callee slot and the arguments, i.e. for `Call base` the
/// callee sits at R[base] and the arguments at R[base+4..]. The frame
/// header is built in the gap, so a non-relocating call never copies an
/// argument.
///
/// SELF-MODIFICATION: `IterValidate` patches the opcode byte of the
/// iterator-call instruction it targets (IterCall <-> IterNext), which
/// is why CodeBlocks own a mutable bytecode buffer. The two iterator
/// call forms share one operand layout by construction.

use crate::errors::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    Nop = 0,

    // ── Moves and constants ──────────────────────────────────────────────────
    Mov = 1,        // dst s, src s          R[dst] = slot(src)
    KShort = 2,     // dst s, val i16        R[dst] = int32(val)
    FillNil = 3,    // base s, count u16     R[base..base+count] = nil

    // ── Upvalues ─────────────────────────────────────────────────────────────
    UvGet = 4,      // dst s, idx u16
    UvPut = 5,      // idx u16, src s
    UvClose = 6,    // base s, jump j        close upvalues >= base, jump

    // ── Globals ──────────────────────────────────────────────────────────────
    GGet = 7,       // dst s, key s, ic u16
    GPut = 8,       // key s, src s, ic u16

    // ── Tables ───────────────────────────────────────────────────────────────
    TNew = 9,       // dst s, inline u8, array_hint u16
    TDup = 10,      // dst s, template s
    TGetById = 11,  // dst s, base s, key s, ic u16
    TPutById = 12,  // base s, key s, src s, ic u16
    TGetByVal = 13, // dst s, base s, key s, ic u16
    TPutByVal = 14, // base s, key s, src s, ic u16
    TGetByInt = 15, // dst s, base s, idx i16, ic u16
    TPutByInt = 16, // base s, idx i16, src s, ic u16
    TPutSeq = 17,   // table s, start s      staged variadic rets into array

    // ── Closures and calls ───────────────────────────────────────────────────
    NewClosure = 18, // dst s, proto s
    Call = 19,       // base s, nargs u16, nrets i16 (-1 = keep variadic)
    CallM = 20,      // base s, nargs u16, nrets i16; appends staged varrets
    TailCall = 21,   // base s, nargs u16
    TailCallM = 22,  // base s, nargs u16
    Ret = 23,        // base s, nrets u16
    RetM = 24,       // base s, nfixed u16; appends staged varrets
    Ret0 = 25,       //

    // ── Variadics ────────────────────────────────────────────────────────────
    VarArgsToRegs = 26,   // base s, count u16
    VarArgsToVarRet = 27, //

    // ── Iterator protocol ────────────────────────────────────────────────────
    IterValidate = 28,   // base s, jump j; patches the op at the target
    IterCall = 29,       // base s, nrets u16
    IterNext = 30,       // base s, nrets u16 (same layout as IterCall)
    IterLoopBranch = 31, // ctrl s, jump j

    // ── Arithmetic ───────────────────────────────────────────────────────────
    Add = 32,  // dst s, lhs s, rhs s
    Sub = 33,
    Mul = 34,
    Div = 35,
    Mod = 36,
    Pow = 37,
    Concat = 38,     // dst s, base s, count u16
    UnaryMinus = 39, // dst s, src s
    IsFalsy = 40,    // dst s, src s
    Length = 41,     // dst s, src s

    // ── Compare-and-branch (six variants; NLT/NLE differ from LE/LT on NaN) ──
    IsEq = 42,  // lhs s, rhs s, jump j
    IsNeq = 43,
    IsLt = 44,
    IsNLt = 45,
    IsLe = 46,
    IsNLe = 47,

    // ── Branches and loops ───────────────────────────────────────────────────
    BranchIfTruthy = 48,     // src s, jump j
    BranchIfFalsy = 49,      // src s, jump j
    CopyBranchIfTruthy = 50, // dst s, src s, jump j
    CopyBranchIfFalsy = 51,  // dst s, src s, jump j
    Jump = 52,               // jump j
    ForLoopInit = 53,        // base s, jump j
    ForLoopStep = 54,        // base s, jump j
}

pub const NUM_OPS: u8 = 55;

impl Op {
    #[inline(always)]
    pub fn from_u8(b: u8) -> Op {
        debug_assert!(b < NUM_OPS);
        unsafe { std::mem::transmute(b) }
    }

    /// Total instruction length in bytes, opcode included.
    pub fn len(self) -> usize {
        use Op::*;
        1 + match self {
            Nop | Ret0 | VarArgsToVarRet => 0,
            KShort | FillNil | UvGet | UvPut | TailCall | TailCallM | Ret | RetM
            | VarArgsToRegs | IterCall | IterNext => 6,
            Mov | UvClose | TDup | TPutSeq | NewClosure | UnaryMinus | IsFalsy | Length
            | BranchIfTruthy | BranchIfFalsy | IterValidate | IterLoopBranch | ForLoopInit
            | ForLoopStep => 8,
            TNew => 7,
            GGet | GPut | Concat => 10,
            Call | CallM => 8,
            TGetById | TPutById | TGetByVal | TPutByVal => 14,
            TGetByInt | TPutByInt => 12,
            Add | Sub | Mul | Div | Mod | Pow | IsEq | IsNeq | IsLt | IsNLt | IsLe | IsNLe
            | CopyBranchIfTruthy | CopyBranchIfFalsy => 12,
            Jump => 4,
        }
    }
}

// ── Raw operand readers (interpreter side) ───────────────────────────────────

#[inline(always)]
pub unsafe fn read_u8(p: *const u8, off: usize) -> u8 {
    p.add(off).read()
}

#[inline(always)]
pub unsafe fn read_u16(p: *const u8, off: usize) -> u16 {
    u16::from_le_bytes([p.add(off).read(), p.add(off + 1).read()])
}

#[inline(always)]
pub unsafe fn read_i16(p: *const u8, off: usize) -> i16 {
    read_u16(p, off) as i16
}

#[inline(always)]
pub unsafe fn read_u32(p: *const u8, off: usize) -> u32 {
    u32::from_le_bytes([
        p.add(off).read(),
        p.add(off + 1).read(),
        p.add(off + 2).read(),
        p.add(off + 3).read(),
    ])
}

#[inline(always)]
pub unsafe fn read_i32(p: *const u8, off: usize) -> i32 {
    read_u32(p, off) as i32
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Position of a branch operand awaiting its target.
#[derive(Debug, Clone, Copy)]
pub struct JumpRef {
    pub op_start: usize,
    pub operand_pos: usize,
}

/// Append-only bytecode assembler used by the loader and by tests.
pub struct BytecodeBuilder {
    pub code: Vec<u8>,
    pub num_ic_sites: u32,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        BytecodeBuilder {
            code: Vec::new(),
            num_ic_sites: 0,
        }
    }

    #[inline]
    pub fn here(&self) -> usize {
        self.code.len()
    }

    fn op(&mut self, op: Op) -> usize {
        let start = self.code.len();
        self.code.push(op as u8);
        start
    }

    fn i32(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn i16(&mut self, v: i16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn u8(&mut self, v: u8) {
        self.code.push(v);
    }

    fn jump_operand(&mut self) -> usize {
        let pos = self.code.len();
        self.i32(0);
        pos
    }

    pub fn alloc_ic(&mut self) -> u16 {
        let id = self.num_ic_sites;
        assert!(id < u16::MAX as u32, "too many IC sites in one function");
        self.num_ic_sites += 1;
        id as u16
    }

    /// Resolve a branch operand to `target` (a bytecode offset).
    pub fn patch_jump(&mut self, j: JumpRef, target: usize) {
        let delta = target as i64 - j.op_start as i64;
        let delta = i32::try_from(delta).expect("branch delta overflow");
        self.code[j.operand_pos..j.operand_pos + 4].copy_from_slice(&delta.to_le_bytes());
    }

    // Straight-line ops.

    pub fn nop(&mut self) {
        self.op(Op::Nop);
    }

    pub fn mov(&mut self, dst: i32, src: i32) {
        self.op(Op::Mov);
        self.i32(dst);
        self.i32(src);
    }

    pub fn kshort(&mut self, dst: i32, val: i16) {
        self.op(Op::KShort);
        self.i32(dst);
        self.i16(val);
    }

    pub fn fill_nil(&mut self, base: i32, count: u16) {
        self.op(Op::FillNil);
        self.i32(base);
        self.u16(count);
    }

    pub fn uv_get(&mut self, dst: i32, idx: u16) {
        self.op(Op::UvGet);
        self.i32(dst);
        self.u16(idx);
    }

    pub fn uv_put(&mut self, idx: u16, src: i32) {
        self.op(Op::UvPut);
        self.u16(idx);
        self.i32(src);
    }

    pub fn uv_close(&mut self, base: i32) -> JumpRef {
        let op_start = self.op(Op::UvClose);
        self.i32(base);
        let operand_pos = self.jump_operand();
        JumpRef { op_start, operand_pos }
    }

    pub fn gget(&mut self, dst: i32, key: i32) {
        let ic = self.alloc_ic();
        self.op(Op::GGet);
        self.i32(dst);
        self.i32(key);
        self.u16(ic);
    }

    pub fn gput(&mut self, key: i32, src: i32) {
        let ic = self.alloc_ic();
        self.op(Op::GPut);
        self.i32(key);
        self.i32(src);
        self.u16(ic);
    }

    pub fn tnew(&mut self, dst: i32, inline_cap: u8, array_hint: u16) {
        self.op(Op::TNew);
        self.i32(dst);
        self.u8(inline_cap);
        self.u16(array_hint);
    }

    pub fn tdup(&mut self, dst: i32, template: i32) {
        self.op(Op::TDup);
        self.i32(dst);
        self.i32(template);
    }

    pub fn tget_by_id(&mut self, dst: i32, base: i32, key: i32) {
        let ic = self.alloc_ic();
        self.op(Op::TGetById);
        self.i32(dst);
        self.i32(base);
        self.i32(key);
        self.u16(ic);
    }

    pub fn tput_by_id(&mut self, base: i32, key: i32, src: i32) {
        let ic = self.alloc_ic();
        self.op(Op::TPutById);
        self.i32(base);
        self.i32(key);
        self.i32(src);
        self.u16(ic);
    }

    pub fn tget_by_val(&mut self, dst: i32, base: i32, key: i32) {
        let ic = self.alloc_ic();
        self.op(Op::TGetByVal);
        self.i32(dst);
        self.i32(base);
        self.i32(key);
        self.u16(ic);
    }

    pub fn tput_by_val(&mut self, base: i32, key: i32, src: i32) {
        let ic = self.alloc_ic();
        self.op(Op::TPutByVal);
        self.i32(base);
        self.i32(key);
        self.i32(src);
        self.u16(ic);
    }

    pub fn tget_by_int(&mut self, dst: i32, base: i32, idx: i16) {
        let ic = self.alloc_ic();
        self.op(Op::TGetByInt);
        self.i32(dst);
        self.i32(base);
        self.i16(idx);
        self.u16(ic);
    }

    pub fn tput_by_int(&mut self, base: i32, idx: i16, src: i32) {
        let ic = self.alloc_ic();
        self.op(Op::TPutByInt);
        self.i32(base);
        self.i16(idx);
        self.i32(src);
        self.u16(ic);
    }

    pub fn tput_seq(&mut self, table: i32, start: i32) {
        self.op(Op::TPutSeq);
        self.i32(table);
        self.i32(start);
    }

    pub fn new_closure(&mut self, dst: i32, proto: i32) {
        self.op(Op::NewClosure);
        self.i32(dst);
        self.i32(proto);
    }

    pub fn call(&mut self, base: i32, nargs: u16, nrets: i16) {
        self.op(Op::Call);
        self.i32(base);
        self.u16(nargs);
        self.i16(nrets);
    }

    pub fn call_m(&mut self, base: i32, nargs: u16, nrets: i16) {
        self.op(Op::CallM);
        self.i32(base);
        self.u16(nargs);
        self.i16(nrets);
    }

    pub fn tail_call(&mut self, base: i32, nargs: u16) {
        self.op(Op::TailCall);
        self.i32(base);
        self.u16(nargs);
    }

    pub fn tail_call_m(&mut self, base: i32, nargs: u16) {
        self.op(Op::TailCallM);
        self.i32(base);
        self.u16(nargs);
    }

    pub fn ret(&mut self, base: i32, nrets: u16) {
        self.op(Op::Ret);
        self.i32(base);
        self.u16(nrets);
    }

    pub fn ret_m(&mut self, base: i32, nfixed: u16) {
        self.op(Op::RetM);
        self.i32(base);
        self.u16(nfixed);
    }

    pub fn ret0(&mut self) {
        self.op(Op::Ret0);
    }

    pub fn varargs_to_regs(&mut self, base: i32, count: u16) {
        self.op(Op::VarArgsToRegs);
        self.i32(base);
        self.u16(count);
    }

    pub fn varargs_to_varret(&mut self) {
        self.op(Op::VarArgsToVarRet);
    }

    pub fn iter_validate(&mut self, base: i32) -> JumpRef {
        let op_start = self.op(Op::IterValidate);
        self.i32(base);
        let operand_pos = self.jump_operand();
        JumpRef { op_start, operand_pos }
    }

    pub fn iter_call(&mut self, base: i32, nrets: u16) {
        self.op(Op::IterCall);
        self.i32(base);
        self.u16(nrets);
    }

    pub fn iter_loop_branch(&mut self, ctrl: i32) -> JumpRef {
        let op_start = self.op(Op::IterLoopBranch);
        self.i32(ctrl);
        let operand_pos = self.jump_operand();
        JumpRef { op_start, operand_pos }
    }

    pub fn arith(&mut self, op: Op, dst: i32, lhs: i32, rhs: i32) {
        debug_assert!(matches!(op, Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Pow));
        self.op(op);
        self.i32(dst);
        self.i32(lhs);
        self.i32(rhs);
    }

    pub fn concat(&mut self, dst: i32, base: i32, count: u16) {
        self.op(Op::Concat);
        self.i32(dst);
        self.i32(base);
        self.u16(count);
    }

    pub fn unary_minus(&mut self, dst: i32, src: i32) {
        self.op(Op::UnaryMinus);
        self.i32(dst);
        self.i32(src);
    }

    pub fn is_falsy(&mut self, dst: i32, src: i32) {
        self.op(Op::IsFalsy);
        self.i32(dst);
        self.i32(src);
    }

    pub fn length(&mut self, dst: i32, src: i32) {
        self.op(Op::Length);
        self.i32(dst);
        self.i32(src);
    }

    pub fn compare(&mut self, op: Op, lhs: i32, rhs: i32) -> JumpRef {
        debug_assert!(matches!(
            op,
            Op::IsEq | Op::IsNeq | Op::IsLt | Op::IsNLt | Op::IsLe | Op::IsNLe
        ));
        let op_start = self.op(op);
        self.i32(lhs);
        self.i32(rhs);
        let operand_pos = self.jump_operand();
        JumpRef { op_start, operand_pos }
    }

    pub fn branch_if(&mut self, truthy: bool, src: i32) -> JumpRef {
        let op_start = self.op(if truthy { Op::BranchIfTruthy } else { Op::BranchIfFalsy });
        self.i32(src);
        let operand_pos = self.jump_operand();
        JumpRef { op_start, operand_pos }
    }

    pub fn copy_branch_if(&mut self, truthy: bool, dst: i32, src: i32) -> JumpRef {
        let op_start = self.op(if truthy {
            Op::CopyBranchIfTruthy
        } else {
            Op::CopyBranchIfFalsy
        });
        self.i32(dst);
        self.i32(src);
        let operand_pos = self.jump_operand();
        JumpRef { op_start, operand_pos }
    }

    pub fn jump(&mut self) -> JumpRef {
        let op_start = self.op(Op::Jump);
        let operand_pos = self.jump_operand();
        JumpRef { op_start, operand_pos }
    }

    pub fn for_loop_init(&mut self, base: i32) -> JumpRef {
        let op_start = self.op(Op::ForLoopInit);
        self.i32(base);
        let operand_pos = self.jump_operand();
        JumpRef { op_start, operand_pos }
    }

    pub fn for_loop_step(&mut self, base: i32) -> JumpRef {
        let op_start = self.op(Op::ForLoopStep);
        self.i32(base);
        let operand_pos = self.jump_operand();
        JumpRef { op_start, operand_pos }
    }

    pub fn finish(self) -> (Vec<u8>, u32) {
        (self.code, self.num_ic_sites)
    }
}

/// Validate that `target` starts an instruction in `code` (loader-side
/// branch sanity check).
pub fn is_instruction_boundary(code: &[u8], target: usize) -> Result<(), LoadError> {
    let mut off = 0;
    while off < code.len() {
        if off == target {
            return Ok(());
        }
        if off > target {
            break;
        }
        off += Op::from_u8(code[off]).len();
    }
    if target == code.len() {
        return Ok(());
    }
    Err(LoadError::BadJumpTarget(target as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_lengths_match_builder_output() {
        let mut b = BytecodeBuilder::new();
        b.mov(0, -1);
        assert_eq!(b.here(), Op::Mov.len());
        b.kshort(1, 42);
        assert_eq!(b.here(), Op::Mov.len() + Op::KShort.len());
        b.tget_by_id(0, 1, -2);
        b.call(3, 2, 1);
        b.ret(0, 1);
        b.ret0();
        let mut off = 0;
        let expect = [Op::Mov, Op::KShort, Op::TGetById, Op::Call, Op::Ret, Op::Ret0];
        for (i, op) in expect.iter().enumerate() {
            assert_eq!(Op::from_u8(b.code[off]), *op, "op {}", i);
            off += op.len();
        }
        assert_eq!(off, b.code.len());
    }

    #[test]
    fn test_jump_patching_is_relative_to_op_start() {
        let mut b = BytecodeBuilder::new();
        b.nop();
        let j = b.jump();
        b.nop();
        let target = b.here();
        b.ret0();
        b.patch_jump(j, target);
        unsafe {
            let p = b.code.as_ptr();
            let delta = read_i32(p, j.operand_pos);
            assert_eq!(j.op_start as i64 + delta as i64, target as i64);
        }
    }

    #[test]
    fn test_iter_call_and_next_share_layout() {
        assert_eq!(Op::IterCall.len(), Op::IterNext.len());
        // The self-rewrite patches only the opcode byte.
        let mut b = BytecodeBuilder::new();
        b.iter_call(3, 2);
        b.code[0] = Op::IterNext as u8;
        unsafe {
            assert_eq!(read_i32(b.code.as_ptr(), 1), 3);
            assert_eq!(read_u16(b.code.as_ptr(), 5), 2);
        }
    }

    #[test]
    fn test_instruction_boundary_check() {
        let mut b = BytecodeBuilder::new();
        b.nop();
        b.mov(0, 1);
        b.ret0();
        assert!(is_instruction_boundary(&b.code, 0).is_ok());
        assert!(is_instruction_boundary(&b.code, 1).is_ok());
        assert!(is_instruction_boundary(&b.code, 2).is_err());
        assert!(is_instruction_boundary(&b.code, b.code.len()).is_ok());
    }
}
