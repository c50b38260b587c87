//! Pass 2: per-register analysis.
//!
//! Establishes the liveness facts assignment needs: where each register
//! is defined (exactly once), whether all uses stay in that block, the
//! last use index within it, and use counts. Ops whose results must be
//! materialized also grow the frame budget here, so a later spill can
//! never run out of reserved space.

use super::{next_real_op, prev_real_op, Plan, F_BLOCK_LOCAL, F_COND_INPUT, F_PARAMETER, F_RETURNED};
use super::align_pad;
use crate::fatal;
use silica_vcode::{BlockId, Opcode, RegId, Unit};

/// Must this op's result end up in a register or frame slot of its own?
/// Constants fold into consumers, loads and uarray field reads can read
/// their source directly.
fn must_store_result(opcode: Opcode) -> bool {
    !matches!(
        opcode,
        Opcode::Const
            | Opcode::Load
            | Opcode::UarrayDir
            | Opcode::UarrayLeft
            | Opcode::UarrayRight
    )
}

/// Analyse every op of `unit` into `plan`.
pub fn analyse(unit: &Unit, plan: &mut Plan) {
    for i in 0..unit.count_regs() {
        let reg = RegId(i as u32);
        let size = unit.reg_type(reg).size_of() as u32;
        let state = plan.reg_mut(reg);
        state.flags |= F_BLOCK_LOCAL;
        state.size = size;
        state.defn_block = if state.flags & F_PARAMETER != 0 {
            Some(BlockId(0))
        } else {
            None
        };
    }

    for b in 0..unit.count_blocks() {
        let block = BlockId(b as u32);
        for j in 0..unit.count_ops(block) {
            analyse_op(unit, plan, block, j);

            for k in 0..unit.count_args(block, j) {
                let arg = unit.get_arg(block, j, k);
                match plan.reg(arg).defn_block {
                    None => fatal(
                        unit,
                        Some(plan),
                        Some((block, j)),
                        format!("{arg} has no definition"),
                    ),
                    Some(defn) if defn != block => {
                        plan.reg_mut(arg).flags &= !F_BLOCK_LOCAL;
                    }
                    Some(_) => {
                        let state = plan.reg_mut(arg);
                        state.lifetime = j as u32;
                        state.use_count += 1;
                    }
                }
            }
        }
    }
}

fn analyse_op(unit: &Unit, plan: &mut Plan, block: BlockId, j: usize) {
    match unit.get_op(block, j) {
        Opcode::Return => {
            if unit.count_args(block, j) > 0 {
                let arg = unit.get_arg(block, j, 0);
                plan.reg_mut(arg).flags |= F_RETURNED;
            }
        }

        Opcode::Addi
        | Opcode::Const
        | Opcode::Alloca
        | Opcode::LoadIndirect
        | Opcode::Load
        | Opcode::Cmp
        | Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::Unwrap
        | Opcode::UarrayDir
        | Opcode::UarrayLeft
        | Opcode::UarrayRight
        | Opcode::UarrayLen
        | Opcode::Select
        | Opcode::Cast
        | Opcode::RangeNull => {
            let opcode = unit.get_op(block, j);
            let result = match unit.get_result(block, j) {
                Some(result) => result,
                None => fatal(
                    unit,
                    Some(plan),
                    Some((block, j)),
                    format!("op {} has no result", opcode.mnemonic()),
                ),
            };

            if plan.reg(result).defn_block.is_some() {
                fatal(
                    unit,
                    Some(plan),
                    Some((block, j)),
                    format!("{result} defined more than once"),
                );
            }
            plan.reg_mut(result).defn_block = Some(block);

            if must_store_result(opcode) {
                let size = plan.reg(result).size;
                plan.stack_size += size;
                plan.stack_size += align_pad(size, plan.stack_size);
            }
        }

        Opcode::Cond => {
            let input = unit.get_arg(block, j, 0);
            if plan.reg(input).defn_block == Some(block) && j > 0 {
                let feeds_branch = prev_real_op(unit, block, j).is_some_and(|p| {
                    unit.get_op(block, p) == Opcode::Cmp
                        && unit.get_result(block, p) == Some(input)
                });
                if feeds_branch {
                    plan.reg_mut(input).flags |= F_COND_INPUT;
                }
            }
        }

        Opcode::Store
        | Opcode::StoreIndirect
        | Opcode::Jump
        | Opcode::Comment
        | Opcode::Bounds
        | Opcode::DynamicBounds
        | Opcode::IndexCheck => {}
    }
}

/// Is `reg`'s value dead immediately after `op` (its last use is the next
/// non-comment op)?
pub fn is_ephemeral(unit: &Unit, plan: &Plan, reg: RegId, block: BlockId, op: usize) -> bool {
    let state = plan.reg(reg);
    state.flags & F_BLOCK_LOCAL != 0 && state.lifetime as usize == next_real_op(unit, block, op)
}

// =============================================================================
// Tests
// =============================================================================
