//! Pass 3: storage assignment.
//!
//! Walks every op in program order and decides where its result lives.
//! Constants stay symbolic, an ephemeral compare feeding a branch stays
//! in the CPU flags, uarray field reads and integer casts alias their
//! source's frame memory when they can, and everything else gets a
//! machine register if one is free or a frame slot otherwise.

use super::analyse::is_ephemeral;
use super::{align_pad, Plan, Storage, F_BLOCK_LOCAL, F_COND_INPUT, F_RETURNED};
use crate::fatal;
use crate::regs::{Gpr, RegisterFile, MACH_REGS, REG_CALLEE_SAVE, REG_RESULT, REG_SCRATCH};
use silica_vcode::{uarray, BlockId, Opcode, RegId, TypeKind, Unit};
use smallvec::SmallVec;

/// Assign storage for every register in `unit`.
pub fn assign_storage(unit: &Unit, plan: &mut Plan, file: &mut RegisterFile) {
    for b in 0..unit.count_blocks() {
        let block = BlockId(b as u32);
        for j in 0..unit.count_ops(block) {
            assign_op(unit, plan, file, block, j);
        }
    }
}

fn assign_op(unit: &Unit, plan: &mut Plan, file: &mut RegisterFile, block: BlockId, j: usize) {
    match unit.get_op(block, j) {
        Opcode::Comment
        | Opcode::Store
        | Opcode::StoreIndirect
        | Opcode::Cond
        | Opcode::Jump
        | Opcode::Return
        | Opcode::Bounds
        | Opcode::IndexCheck
        | Opcode::DynamicBounds => {}

        Opcode::UarrayLeft | Opcode::UarrayRight | Opcode::UarrayDir => {
            assign_uarray_field(unit, plan, file, block, j);
        }

        Opcode::Const => {
            let result = result_of(unit, plan, block, j);
            plan.reg_mut(result).storage = Storage::Const(unit.get_value(block, j));
        }

        Opcode::Cmp => {
            let result = result_of(unit, plan, block, j);
            let state = plan.reg(result);
            if state.flags & F_COND_INPUT != 0 && is_ephemeral(unit, plan, result, block, j) {
                // The consumer is the branch right behind us; the value
                // can stay in the flags.
                plan.reg_mut(result).storage = Storage::Flags;
            } else {
                assign_result(unit, plan, file, block, j);
            }
        }

        Opcode::Load => {
            let result = result_of(unit, plan, block, j);
            if unit.reg_kind(result) == TypeKind::Uarray {
                // Aggregates never move: the load aliases the variable's
                // memory and field reads index into it.
                let var = unit.get_address(block, j);
                plan.reg_mut(result).storage = Storage::Alias(plan.vars[var.index()].offset);
            } else {
                assign_result(unit, plan, file, block, j);
            }
        }

        Opcode::Mul
        | Opcode::Add
        | Opcode::Addi
        | Opcode::RangeNull
        | Opcode::Select
        | Opcode::Sub
        | Opcode::Unwrap
        | Opcode::LoadIndirect
        | Opcode::UarrayLen
        | Opcode::Alloca => {
            assign_result(unit, plan, file, block, j);
        }

        Opcode::Cast => assign_cast(unit, plan, file, block, j),
    }
}

fn result_of(unit: &Unit, plan: &Plan, block: BlockId, j: usize) -> RegId {
    match unit.get_result(block, j) {
        Some(result) => result,
        None => fatal(
            unit,
            Some(plan),
            Some((block, j)),
            "op unexpectedly has no result".to_string(),
        ),
    }
}

// =============================================================================
// Machine-register selection
// =============================================================================

/// Try to find a machine register for `usage` at op `j`.
///
/// Only block-local values are register candidates; anything longer-lived
/// would pin the register across blocks the walk has not reached yet.
/// Dead block-local tenants are evicted on the way. Preference order:
/// the RESULT register for returned values, then caller-saved registers
/// (a callee-save costs a prologue spill), then the first candidate.
fn alloc_reg(
    plan: &Plan,
    file: &mut RegisterFile,
    block: BlockId,
    j: usize,
    usage: RegId,
) -> Option<Gpr> {
    if plan.reg(usage).flags & F_BLOCK_LOCAL == 0 {
        return None;
    }

    let mut candidates: SmallVec<[Gpr; 16]> = SmallVec::new();
    for desc in &MACH_REGS {
        if desc.flags & REG_SCRATCH != 0 {
            continue;
        }
        match file.usage(desc.reg) {
            Some(owner) => {
                let state = plan.reg(owner);
                let dead = state.flags & F_BLOCK_LOCAL != 0
                    && (state.defn_block != Some(block) || (state.lifetime as usize) < j);
                if dead {
                    file.release(desc.reg);
                    candidates.push(desc.reg);
                }
            }
            None => candidates.push(desc.reg),
        }
    }

    let returned = plan.reg(usage).flags & F_RETURNED != 0;
    let mut best: Option<Gpr> = None;
    for &cand in &candidates {
        let cand_flags = MACH_REGS[cand.encoding() as usize].flags;
        match best {
            None => best = Some(cand),
            Some(cur) => {
                let cur_flags = MACH_REGS[cur.encoding() as usize].flags;
                if returned && cand_flags & REG_RESULT != 0 {
                    best = Some(cand);
                } else if cur_flags & REG_CALLEE_SAVE != 0 && cand_flags & REG_CALLEE_SAVE == 0 {
                    best = Some(cand);
                }
            }
        }
    }

    let best = best?;
    file.assign(best, usage);
    Some(best)
}

/// Register-else-spill for a general op result.
fn assign_result(unit: &Unit, plan: &mut Plan, file: &mut RegisterFile, block: BlockId, j: usize) {
    let result = result_of(unit, plan, block, j);

    if let Some(gpr) = alloc_reg(plan, file, block, j, result) {
        plan.reg_mut(result).storage = Storage::Reg(gpr);
        return;
    }

    let size = plan.reg(result).size;
    let pad = align_pad(size, plan.stack_wptr);
    let base = plan.stack_wptr + pad;
    plan.stack_wptr = base + size;
    assert!(
        plan.stack_wptr <= plan.stack_size,
        "frame budget exceeded: wptr {} > size {}",
        plan.stack_wptr,
        plan.stack_size
    );
    plan.reg_mut(result).storage = Storage::Stack(-((base + size) as i32));
}

// =============================================================================
// Special cases
// =============================================================================

fn assign_uarray_field(
    unit: &Unit,
    plan: &mut Plan,
    file: &mut RegisterFile,
    block: BlockId,
    j: usize,
) {
    let src = unit.get_arg(block, j, 0);
    let src_offset = match plan.reg(src).storage.frame_offset() {
        Some(offset) => offset,
        None => fatal(
            unit,
            Some(plan),
            Some((block, j)),
            format!("uarray source {src} is not in frame memory"),
        ),
    };

    let field = match unit.get_op(block, j) {
        Opcode::UarrayLeft => uarray::left_offset(0),
        Opcode::UarrayRight => uarray::right_offset(0),
        Opcode::UarrayDir => uarray::dir_offset(0),
        _ => unreachable!("not a uarray field op"),
    };

    let result = result_of(unit, plan, block, j);
    if plan.reg(result).use_count >= 2 {
        if let Some(gpr) = alloc_reg(plan, file, block, j, result) {
            plan.reg_mut(result).storage = Storage::Reg(gpr);
            return;
        }
    }
    plan.reg_mut(result).storage = Storage::Alias(src_offset + field);
}

fn assign_cast(unit: &Unit, plan: &mut Plan, file: &mut RegisterFile, block: BlockId, j: usize) {
    let src = unit.get_arg(block, j, 0);
    let result = result_of(unit, plan, block, j);

    let to_kind = match unit.get_type(block, j) {
        Some(ty) => ty.kind(),
        None => unit.reg_kind(result),
    };
    let from_kind = unit.reg_kind(src);

    let integer_conversion = matches!(to_kind, TypeKind::Offset | TypeKind::Int)
        && matches!(from_kind, TypeKind::Offset | TypeKind::Int);

    if integer_conversion && plan.reg(result).use_count <= 2 {
        if let Some(offset) = plan.reg(src).storage.frame_offset() {
            // Reread the source's memory; no storage of our own.
            plan.reg_mut(result).storage = Storage::Alias(offset);
            return;
        }
    }

    assign_result(unit, plan, file, block, j);
}

// =============================================================================
// Tests
// =============================================================================
