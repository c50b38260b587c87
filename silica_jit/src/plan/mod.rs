//! Storage planning for VCODE registers.
//!
//! Planning runs in three passes before any code is emitted:
//! 1. Frame layout ([`frame`]): place variables and ALLOCA space at fixed
//!    negative frame offsets and fix the frame budget.
//! 2. Analysis ([`analyse`]): per-register liveness facts — definition
//!    block, block locality, last use, use counts — plus worst-case
//!    spill reservations.
//! 3. Assignment ([`assign`]): decide where each register's value lives.

pub mod analyse;
pub mod assign;
pub mod frame;

use crate::regs::Gpr;
use rustc_hash::FxHashMap;
use silica_vcode::{types::WORD_SIZE, BlockId, Opcode, RegId, Unit};

// =============================================================================
// Register Flags
// =============================================================================

/// The register is a function parameter, live on entry in block 0.
pub const F_PARAMETER: u8 = 1 << 0;
/// The register's value is returned by some `Return` op.
pub const F_RETURNED: u8 = 1 << 1;
/// Every use of the register sits in its definition block.
pub const F_BLOCK_LOCAL: u8 = 1 << 2;
/// The register is a compare result feeding the immediately following
/// conditional branch.
pub const F_COND_INPUT: u8 = 1 << 3;

// =============================================================================
// Storage
// =============================================================================

/// Where a VCODE register's value lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Not decided yet (or the op produces no materialized value).
    Unassigned,
    /// A machine register for the register's whole lifetime.
    Reg(Gpr),
    /// An owned frame slot at this RBP-relative offset.
    Stack(i32),
    /// A compile-time constant folded into consumers.
    Const(i64),
    /// The CPU flags, valid only until the next flag-writing instruction;
    /// the consumer is the immediately following conditional branch.
    Flags,
    /// An address aliasing another object's storage (a uarray field or a
    /// cast source); owns no slot of its own.
    Alias(i32),
}

impl Storage {
    /// Frame offset for storage kinds that denote frame memory.
    #[inline]
    pub fn frame_offset(self) -> Option<i32> {
        match self {
            Storage::Stack(offset) | Storage::Alias(offset) => Some(offset),
            _ => None,
        }
    }
}

// =============================================================================
// Planner State
// =============================================================================

/// Per-VCODE-register planning facts.
#[derive(Debug, Clone, Copy)]
pub struct RegState {
    pub flags: u8,
    /// Value width in bytes, from the register's type.
    pub size: u32,
    /// Block holding the single definition.
    pub defn_block: Option<BlockId>,
    /// Op index of the last use within the definition block; only
    /// meaningful while `F_BLOCK_LOCAL` is set.
    pub lifetime: u32,
    pub use_count: u32,
    pub storage: Storage,
}

impl Default for RegState {
    fn default() -> Self {
        RegState {
            flags: 0,
            size: 0,
            defn_block: None,
            lifetime: 0,
            use_count: 0,
            storage: Storage::Unassigned,
        }
    }
}

/// Per-variable frame placement, fixed by pass 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarState {
    pub size: u32,
    pub offset: i32,
}

/// The complete storage plan for one unit.
#[derive(Debug)]
pub struct Plan {
    pub regs: Vec<RegState>,
    pub vars: Vec<VarState>,
    /// Frame budget in bytes.
    pub stack_size: u32,
    /// High-water mark of temporary slot allocation; never exceeds
    /// `stack_size`.
    pub stack_wptr: u32,
    /// Frame offset of each `Alloca` op's reserved space.
    pub alloca_offsets: FxHashMap<(u32, u32), i32>,
}

impl Plan {
    /// An empty plan sized for `unit`.
    pub fn new(unit: &Unit) -> Self {
        Plan {
            regs: vec![RegState::default(); unit.count_regs()],
            vars: vec![VarState::default(); unit.count_vars()],
            stack_size: 0,
            stack_wptr: 0,
            alloca_offsets: FxHashMap::default(),
        }
    }

    #[inline]
    pub fn reg(&self, reg: RegId) -> &RegState {
        &self.regs[reg.index()]
    }

    #[inline]
    pub fn reg_mut(&mut self, reg: RegId) -> &mut RegState {
        &mut self.regs[reg.index()]
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Padding needed to align an object of `size` bytes at frame position
/// `ptr`. Objects align to the smaller of their size and the word size.
pub fn align_pad(size: u32, ptr: u32) -> u32 {
    let align = size.min(WORD_SIZE as u32);
    let pad = align - ptr % align;
    if pad == align { 0 } else { pad }
}

/// Does this op contribute nothing to execution?
#[inline]
pub fn is_no_op(unit: &Unit, block: BlockId, op: usize) -> bool {
    unit.get_op(block, op) == Opcode::Comment
}

/// Index of the next op that is not a comment (may be one past the end).
pub fn next_real_op(unit: &Unit, block: BlockId, mut op: usize) -> usize {
    let nops = unit.count_ops(block);
    loop {
        op += 1;
        if op >= nops || !is_no_op(unit, block, op) {
            return op;
        }
    }
}

/// Index of the previous op that is not a comment.
pub fn prev_real_op(unit: &Unit, block: BlockId, mut op: usize) -> Option<usize> {
    loop {
        op = op.checked_sub(1)?;
        if !is_no_op(unit, block, op) {
            return Some(op);
        }
    }
}

// =============================================================================
// Dump Annotations
// =============================================================================

/// Annotates unit dumps with the plan's storage decisions.
pub struct PlanAnnotator<'a> {
    plan: &'a Plan,
}

impl<'a> PlanAnnotator<'a> {
    pub fn new(plan: &'a Plan) -> Self {
        PlanAnnotator { plan }
    }
}

impl silica_vcode::DumpAnnotator for PlanAnnotator<'_> {
    fn annotate_reg(&mut self, out: &mut dyn std::fmt::Write, reg: RegId) -> std::fmt::Result {
        if reg.index() >= self.plan.regs.len() {
            return Ok(());
        }
        let signed_hex = |offset: i32| {
            let sign = if offset < 0 { "-" } else { "+" };
            format!("{sign}{:#x}", offset.unsigned_abs())
        };
        match self.plan.reg(reg).storage {
            Storage::Unassigned => Ok(()),
            Storage::Reg(gpr) => write!(out, "[{gpr}]"),
            Storage::Stack(offset) => write!(out, "[{}]", signed_hex(offset)),
            Storage::Const(value) => write!(out, "[#{value}]"),
            Storage::Flags => write!(out, "[flags]"),
            Storage::Alias(offset) => write!(out, "[@{}]", signed_hex(offset)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use silica_vcode::{UnitBuilder, UnitKind, VType};

    #[test]
    fn test_align_pad() {
        assert_eq!(align_pad(4, 0), 0);
        assert_eq!(align_pad(4, 2), 2);
        assert_eq!(align_pad(4, 4), 0);
        assert_eq!(align_pad(1, 7), 0);
        assert_eq!(align_pad(8, 4), 4);
        // Objects wider than a word align to the word.
        assert_eq!(align_pad(24, 8), 0);
        assert_eq!(align_pad(24, 12), 4);
    }

    #[test]
    fn test_real_op_stepping_skips_comments() {
        let mut b = UnitBuilder::new(UnitKind::Function, "commented");
        let p = b.add_param(VType::INT64);
        b.emit_comment("one");
        b.emit_comment("two");
        b.emit_return(Some(p));
        let u = b.finish();
        let b0 = BlockId(0);

        assert_eq!(next_real_op(&u, b0, 0), 2);
        assert_eq!(prev_real_op(&u, b0, 2), None);
        assert_eq!(next_real_op(&u, b0, 2), 3);
    }

    #[test]
    fn test_storage_frame_offset() {
        assert_eq!(Storage::Stack(-8).frame_offset(), Some(-8));
        assert_eq!(Storage::Alias(-16).frame_offset(), Some(-16));
        assert_eq!(Storage::Reg(Gpr::Rax).frame_offset(), None);
        assert_eq!(Storage::Const(1).frame_offset(), None);
    }
}
