//! VCODE units: control-flow graphs of basic blocks containing typed ops.
//!
//! A [`Unit`] is built once through a [`UnitBuilder`] and is immutable
//! afterwards. The read side is a flat query surface over `(block, op)`
//! indices; there is deliberately no process-global "selected block"
//! cursor, the builder keeps its own.

use crate::types::{TypeKind, VType};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Identifiers
// =============================================================================

/// Process-unique identity of a unit, stamped at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

impl UnitId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        UnitId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// A virtual register within one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegId(pub u32);

impl RegId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for RegId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A basic block within one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A variable within one unit's stack frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

impl VarId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

// =============================================================================
// Ops
// =============================================================================

/// VCODE operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Const,
    Add,
    Addi,
    Sub,
    Mul,
    Cast,
    Select,
    Unwrap,
    RangeNull,
    Load,
    Store,
    LoadIndirect,
    StoreIndirect,
    Alloca,
    UarrayLeft,
    UarrayRight,
    UarrayDir,
    UarrayLen,
    Cmp,
    Cond,
    Jump,
    Return,
    Bounds,
    DynamicBounds,
    IndexCheck,
    Comment,
}

impl Opcode {
    /// Lower-case mnemonic for dumps.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Const => "const",
            Opcode::Add => "add",
            Opcode::Addi => "addi",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Cast => "cast",
            Opcode::Select => "select",
            Opcode::Unwrap => "unwrap",
            Opcode::RangeNull => "range_null",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::LoadIndirect => "load_indirect",
            Opcode::StoreIndirect => "store_indirect",
            Opcode::Alloca => "alloca",
            Opcode::UarrayLeft => "uarray_left",
            Opcode::UarrayRight => "uarray_right",
            Opcode::UarrayDir => "uarray_dir",
            Opcode::UarrayLen => "uarray_len",
            Opcode::Cmp => "cmp",
            Opcode::Cond => "cond",
            Opcode::Jump => "jump",
            Opcode::Return => "return",
            Opcode::Bounds => "bounds",
            Opcode::DynamicBounds => "dynamic_bounds",
            Opcode::IndexCheck => "index_check",
            Opcode::Comment => "comment",
        }
    }
}

/// Comparison predicate of a `Cmp` op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VCmp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl VCmp {
    pub const fn mnemonic(self) -> &'static str {
        match self {
            VCmp::Eq => "eq",
            VCmp::Ne => "ne",
            VCmp::Gt => "gt",
            VCmp::Lt => "lt",
            VCmp::Ge => "ge",
            VCmp::Le => "le",
        }
    }
}

/// One VCODE instruction.
#[derive(Debug, Clone)]
pub(crate) struct Op {
    pub opcode: Opcode,
    pub args: SmallVec<[RegId; 2]>,
    pub result: Option<RegId>,
    pub ty: Option<VType>,
    pub value: i64,
    pub cmp: Option<VCmp>,
    pub targets: SmallVec<[BlockId; 2]>,
    pub var: Option<VarId>,
    pub comment: Option<Box<str>>,
}

impl Op {
    fn new(opcode: Opcode) -> Self {
        Op {
            opcode,
            args: SmallVec::new(),
            result: None,
            ty: None,
            value: 0,
            cmp: None,
            targets: SmallVec::new(),
            var: None,
            comment: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Block {
    ops: Vec<Op>,
}

#[derive(Debug, Clone, Copy)]
struct RegInfo {
    ty: VType,
}

// =============================================================================
// Unit
// =============================================================================

/// What a unit is for. Only functions take parameters in registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Function,
    Process,
}

/// An immutable VCODE compilation unit.
#[derive(Debug)]
pub struct Unit {
    id: UnitId,
    kind: UnitKind,
    name: Box<str>,
    blocks: Vec<Block>,
    vars: Vec<VType>,
    regs: Vec<RegInfo>,
    nparams: u32,
}

impl Unit {
    /// Unique identity of this unit.
    #[inline]
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Unit kind.
    #[inline]
    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Unit name, for diagnostics.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of basic blocks.
    #[inline]
    pub fn count_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of ops in a block.
    #[inline]
    pub fn count_ops(&self, block: BlockId) -> usize {
        self.blocks[block.index()].ops.len()
    }

    /// Number of frame variables.
    #[inline]
    pub fn count_vars(&self) -> usize {
        self.vars.len()
    }

    /// Number of virtual registers.
    #[inline]
    pub fn count_regs(&self) -> usize {
        self.regs.len()
    }

    /// Number of leading registers that are parameters.
    #[inline]
    pub fn count_params(&self) -> usize {
        self.nparams as usize
    }

    /// Number of register arguments of an op.
    #[inline]
    pub fn count_args(&self, block: BlockId, op: usize) -> usize {
        self.op(block, op).args.len()
    }

    /// Opcode of an op.
    #[inline]
    pub fn get_op(&self, block: BlockId, op: usize) -> Opcode {
        self.op(block, op).opcode
    }

    /// The `k`th register argument of an op.
    #[inline]
    pub fn get_arg(&self, block: BlockId, op: usize, k: usize) -> RegId {
        self.op(block, op).args[k]
    }

    /// Result register of an op, if it defines one.
    #[inline]
    pub fn get_result(&self, block: BlockId, op: usize) -> Option<RegId> {
        self.op(block, op).result
    }

    /// Result or operand type attached to an op.
    #[inline]
    pub fn get_type(&self, block: BlockId, op: usize) -> Option<VType> {
        self.op(block, op).ty
    }

    /// Constant value of a `Const` op (or immediate of `Addi`).
    #[inline]
    pub fn get_value(&self, block: BlockId, op: usize) -> i64 {
        self.op(block, op).value
    }

    /// Predicate of a `Cmp` op.
    ///
    /// # Panics
    /// Panics if the op carries no predicate.
    #[inline]
    pub fn get_cmp(&self, block: BlockId, op: usize) -> VCmp {
        match self.op(block, op).cmp {
            Some(cmp) => cmp,
            None => panic!("op {}.{op} has no comparison predicate", block.0),
        }
    }

    /// The `k`th block target of a branch op.
    #[inline]
    pub fn get_target(&self, block: BlockId, op: usize, k: usize) -> BlockId {
        self.op(block, op).targets[k]
    }

    /// Variable referenced by a `Load`/`Store` op.
    ///
    /// # Panics
    /// Panics if the op references no variable.
    #[inline]
    pub fn get_address(&self, block: BlockId, op: usize) -> VarId {
        match self.op(block, op).var {
            Some(var) => var,
            None => panic!("op {}.{op} references no variable", block.0),
        }
    }

    /// Comment text of a `Comment` op.
    #[inline]
    pub fn get_comment(&self, block: BlockId, op: usize) -> Option<&str> {
        self.op(block, op).comment.as_deref()
    }

    /// Type of a frame variable.
    #[inline]
    pub fn var_type(&self, var: VarId) -> VType {
        self.vars[var.index()]
    }

    /// Type of a virtual register.
    #[inline]
    pub fn reg_type(&self, reg: RegId) -> VType {
        self.regs[reg.index()].ty
    }

    /// Type kind of a virtual register's type.
    #[inline]
    pub fn reg_kind(&self, reg: RegId) -> TypeKind {
        self.reg_type(reg).kind()
    }

    #[inline]
    fn op(&self, block: BlockId, op: usize) -> &Op {
        &self.blocks[block.index()].ops[op]
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Constructs a [`Unit`] imperatively, with a block cursor.
///
/// Ops append to the selected block; each value-producing emitter returns
/// the fresh result register.
pub struct UnitBuilder {
    unit: Unit,
    cursor: BlockId,
}

impl UnitBuilder {
    /// Start a new unit. Block 0 exists and is selected.
    pub fn new(kind: UnitKind, name: &str) -> Self {
        UnitBuilder {
            unit: Unit {
                id: UnitId::next(),
                kind,
                name: name.into(),
                blocks: vec![Block::default()],
                vars: Vec::new(),
                regs: Vec::new(),
                nparams: 0,
            },
            cursor: BlockId(0),
        }
    }

    /// Declare the next function parameter. Parameters must be declared
    /// before any other register is created.
    pub fn add_param(&mut self, ty: VType) -> RegId {
        assert_eq!(
            self.unit.nparams as usize,
            self.unit.regs.len(),
            "parameters must precede all other registers"
        );
        self.unit.nparams += 1;
        self.new_reg(ty)
    }

    /// Declare a frame variable.
    pub fn add_var(&mut self, ty: VType) -> VarId {
        self.unit.vars.push(ty);
        VarId(self.unit.vars.len() as u32 - 1)
    }

    /// Append a new empty block.
    pub fn add_block(&mut self) -> BlockId {
        self.unit.blocks.push(Block::default());
        BlockId(self.unit.blocks.len() as u32 - 1)
    }

    /// Move the cursor.
    pub fn select_block(&mut self, block: BlockId) {
        assert!(block.index() < self.unit.blocks.len());
        self.cursor = block;
    }

    /// The block ops currently append to.
    #[inline]
    pub fn active_block(&self) -> BlockId {
        self.cursor
    }

    fn new_reg(&mut self, ty: VType) -> RegId {
        self.unit.regs.push(RegInfo { ty });
        RegId(self.unit.regs.len() as u32 - 1)
    }

    fn push(&mut self, op: Op) {
        self.unit.blocks[self.cursor.index()].ops.push(op);
    }

    fn push_result(&mut self, mut op: Op, ty: VType) -> RegId {
        let result = self.new_reg(ty);
        op.result = Some(result);
        op.ty = Some(ty);
        self.push(op);
        result
    }

    pub fn emit_const(&mut self, ty: VType, value: i64) -> RegId {
        let mut op = Op::new(Opcode::Const);
        op.value = value;
        self.push_result(op, ty)
    }

    pub fn emit_add(&mut self, lhs: RegId, rhs: RegId) -> RegId {
        let ty = self.unit.reg_type(lhs);
        let mut op = Op::new(Opcode::Add);
        op.args.push(lhs);
        op.args.push(rhs);
        self.push_result(op, ty)
    }

    pub fn emit_addi(&mut self, lhs: RegId, imm: i64) -> RegId {
        let ty = self.unit.reg_type(lhs);
        let mut op = Op::new(Opcode::Addi);
        op.args.push(lhs);
        op.value = imm;
        self.push_result(op, ty)
    }

    pub fn emit_sub(&mut self, lhs: RegId, rhs: RegId) -> RegId {
        let ty = self.unit.reg_type(lhs);
        let mut op = Op::new(Opcode::Sub);
        op.args.push(lhs);
        op.args.push(rhs);
        self.push_result(op, ty)
    }

    pub fn emit_mul(&mut self, lhs: RegId, rhs: RegId) -> RegId {
        let ty = self.unit.reg_type(lhs);
        let mut op = Op::new(Opcode::Mul);
        op.args.push(lhs);
        op.args.push(rhs);
        self.push_result(op, ty)
    }

    pub fn emit_cmp(&mut self, cmp: VCmp, lhs: RegId, rhs: RegId) -> RegId {
        let mut op = Op::new(Opcode::Cmp);
        op.cmp = Some(cmp);
        op.args.push(lhs);
        op.args.push(rhs);
        self.push_result(op, VType::BOOL)
    }

    pub fn emit_cast(&mut self, ty: VType, src: RegId) -> RegId {
        let mut op = Op::new(Opcode::Cast);
        op.args.push(src);
        self.push_result(op, ty)
    }

    pub fn emit_select(&mut self, cond: RegId, if_true: RegId, if_false: RegId) -> RegId {
        let ty = self.unit.reg_type(if_true);
        let mut op = Op::new(Opcode::Select);
        op.args.push(cond);
        op.args.push(if_true);
        op.args.push(if_false);
        self.push_result(op, ty)
    }

    pub fn emit_unwrap(&mut self, uarr: RegId) -> RegId {
        let mut op = Op::new(Opcode::Unwrap);
        op.args.push(uarr);
        self.push_result(op, VType::Pointer)
    }

    pub fn emit_range_null(&mut self, left: RegId, right: RegId, dir: RegId) -> RegId {
        let mut op = Op::new(Opcode::RangeNull);
        op.args.push(left);
        op.args.push(right);
        op.args.push(dir);
        self.push_result(op, VType::BOOL)
    }

    pub fn emit_load(&mut self, var: VarId) -> RegId {
        let ty = self.unit.var_type(var);
        let mut op = Op::new(Opcode::Load);
        op.var = Some(var);
        self.push_result(op, ty)
    }

    pub fn emit_store(&mut self, value: RegId, var: VarId) {
        let mut op = Op::new(Opcode::Store);
        op.args.push(value);
        op.var = Some(var);
        self.push(op);
    }

    pub fn emit_load_indirect(&mut self, ty: VType, ptr: RegId) -> RegId {
        let mut op = Op::new(Opcode::LoadIndirect);
        op.args.push(ptr);
        self.push_result(op, ty)
    }

    pub fn emit_store_indirect(&mut self, value: RegId, ptr: RegId) {
        let mut op = Op::new(Opcode::StoreIndirect);
        op.args.push(value);
        op.args.push(ptr);
        self.push(op);
    }

    pub fn emit_alloca(&mut self, ty: VType) -> RegId {
        let mut op = Op::new(Opcode::Alloca);
        op.ty = Some(ty);
        let result = self.new_reg(VType::Pointer);
        op.result = Some(result);
        self.push(op);
        result
    }

    pub fn emit_uarray_left(&mut self, uarr: RegId) -> RegId {
        let mut op = Op::new(Opcode::UarrayLeft);
        op.args.push(uarr);
        self.push_result(op, VType::Offset)
    }

    pub fn emit_uarray_right(&mut self, uarr: RegId) -> RegId {
        let mut op = Op::new(Opcode::UarrayRight);
        op.args.push(uarr);
        self.push_result(op, VType::Offset)
    }

    pub fn emit_uarray_dir(&mut self, uarr: RegId) -> RegId {
        let mut op = Op::new(Opcode::UarrayDir);
        op.args.push(uarr);
        self.push_result(op, VType::BOOL)
    }

    pub fn emit_uarray_len(&mut self, uarr: RegId) -> RegId {
        let mut op = Op::new(Opcode::UarrayLen);
        op.args.push(uarr);
        self.push_result(op, VType::Offset)
    }

    pub fn emit_cond(&mut self, value: RegId, if_true: BlockId, if_false: BlockId) {
        let mut op = Op::new(Opcode::Cond);
        op.args.push(value);
        op.targets.push(if_true);
        op.targets.push(if_false);
        self.push(op);
    }

    pub fn emit_jump(&mut self, target: BlockId) {
        let mut op = Op::new(Opcode::Jump);
        op.targets.push(target);
        self.push(op);
    }

    pub fn emit_return(&mut self, value: Option<RegId>) {
        let mut op = Op::new(Opcode::Return);
        if let Some(value) = value {
            op.args.push(value);
        }
        self.push(op);
    }

    pub fn emit_bounds(&mut self, value: RegId) {
        let mut op = Op::new(Opcode::Bounds);
        op.args.push(value);
        self.push(op);
    }

    pub fn emit_dynamic_bounds(&mut self, value: RegId, low: RegId, high: RegId) {
        let mut op = Op::new(Opcode::DynamicBounds);
        op.args.push(value);
        op.args.push(low);
        op.args.push(high);
        self.push(op);
    }

    pub fn emit_index_check(&mut self, index: RegId, length: RegId) {
        let mut op = Op::new(Opcode::IndexCheck);
        op.args.push(index);
        op.args.push(length);
        self.push(op);
    }

    pub fn emit_comment(&mut self, text: &str) {
        let mut op = Op::new(Opcode::Comment);
        op.comment = Some(text.into());
        self.push(op);
    }

    /// Seal the unit.
    pub fn finish(self) -> Unit {
        self.unit
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_query() {
        let mut b = UnitBuilder::new(UnitKind::Function, "add_one");
        let p = b.add_param(VType::INT64);
        let one = b.emit_const(VType::INT64, 1);
        let sum = b.emit_add(p, one);
        b.emit_return(Some(sum));
        let u = b.finish();

        assert_eq!(u.kind(), UnitKind::Function);
        assert_eq!(u.count_blocks(), 1);
        assert_eq!(u.count_params(), 1);
        assert_eq!(u.count_regs(), 3);
        assert_eq!(u.count_ops(BlockId(0)), 3);

        assert_eq!(u.get_op(BlockId(0), 0), Opcode::Const);
        assert_eq!(u.get_value(BlockId(0), 0), 1);
        assert_eq!(u.get_result(BlockId(0), 0), Some(one));

        assert_eq!(u.get_op(BlockId(0), 1), Opcode::Add);
        assert_eq!(u.get_arg(BlockId(0), 1, 0), p);
        assert_eq!(u.get_arg(BlockId(0), 1, 1), one);

        assert_eq!(u.get_op(BlockId(0), 2), Opcode::Return);
        assert_eq!(u.count_args(BlockId(0), 2), 1);
    }

    #[test]
    fn test_branches_and_targets() {
        let mut b = UnitBuilder::new(UnitKind::Function, "branchy");
        let p = b.add_param(VType::BOOL);
        let t = b.add_block();
        let f = b.add_block();
        b.emit_cond(p, t, f);
        b.select_block(t);
        assert_eq!(b.active_block(), t);
        b.emit_jump(f);
        let u = b.finish();

        assert_eq!(u.get_op(BlockId(0), 0), Opcode::Cond);
        assert_eq!(u.get_target(BlockId(0), 0, 0), t);
        assert_eq!(u.get_target(BlockId(0), 0, 1), f);
        assert_eq!(u.get_target(t, 0, 0), f);
    }

    #[test]
    fn test_unit_ids_are_unique() {
        let a = UnitBuilder::new(UnitKind::Process, "a").finish();
        let b = UnitBuilder::new(UnitKind::Process, "b").finish();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_reg_kind_follows_type() {
        let mut b = UnitBuilder::new(UnitKind::Function, "kinds");
        let arr = b.add_param(VType::Uarray { ndims: 1 });
        let ptr = b.emit_unwrap(arr);
        let u = b.finish();
        assert_eq!(u.reg_kind(arr), TypeKind::Uarray);
        assert_eq!(u.reg_kind(ptr), TypeKind::Pointer);
    }
}
