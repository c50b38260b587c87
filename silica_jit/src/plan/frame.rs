//! Pass 1: stack frame layout.
//!
//! Variables live below the frame pointer at fixed negative offsets,
//! padded so each is aligned to the smaller of its size and the word
//! size. Every `Alloca` op gets its space reserved here too, keyed by
//! `(block, op)` so the emitter can materialize the address later.
//! Temporary spill slots are carved out above this region during
//! assignment, so the write pointer starts at the laid-out size.

use super::{align_pad, Plan, VarState};
use silica_vcode::{BlockId, Opcode, VarId};
use silica_vcode::Unit;

/// Lay out the frame for `unit` into `plan`.
pub fn layout_frame(unit: &Unit, plan: &mut Plan) {
    plan.stack_size = 0;

    for i in 0..unit.count_vars() {
        let size = unit.var_type(VarId(i as u32)).size_of() as u32;
        plan.stack_size += align_pad(size, plan.stack_size);
        plan.vars[i] = VarState {
            size,
            offset: -((plan.stack_size + size) as i32),
        };
        plan.stack_size += size;
    }

    for b in 0..unit.count_blocks() {
        let block = BlockId(b as u32);
        for j in 0..unit.count_ops(block) {
            if unit.get_op(block, j) != Opcode::Alloca {
                continue;
            }
            let size = match unit.get_type(block, j) {
                Some(ty) => ty.size_of() as u32,
                None => continue,
            };
            plan.stack_size += align_pad(size, plan.stack_size);
            let offset = -((plan.stack_size + size) as i32);
            plan.alloca_offsets.insert((block.0, j as u32), offset);
            plan.stack_size += size;
        }
    }

    plan.stack_wptr = plan.stack_size;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use silica_vcode::{UnitBuilder, UnitKind, VType};

    #[test]
    fn test_vars_get_distinct_negative_offsets() {
        let mut b = UnitBuilder::new(UnitKind::Function, "vars");
        b.add_var(VType::Int { low: 0, high: 100 }); // 1 byte
        b.add_var(VType::Offset); // 4 bytes, needs padding
        b.add_var(VType::INT64); // 8 bytes
        let u = b.finish();

        let mut plan = Plan::new(&u);
        layout_frame(&u, &mut plan);

        assert_eq!(plan.vars[0].offset, -1);
        // Padded from 1 to 4 before the offset slot.
        assert_eq!(plan.vars[1].offset, -8);
        assert_eq!(plan.vars[2].offset, -16);
        assert_eq!(plan.stack_size, 16);
        assert_eq!(plan.stack_wptr, plan.stack_size);
    }

    #[test]
    fn test_alloca_space_reserved_per_op() {
        let mut b = UnitBuilder::new(UnitKind::Function, "allocas");
        b.add_var(VType::Offset);
        b.emit_alloca(VType::INT64);
        b.emit_alloca(VType::Offset);
        b.emit_return(None);
        let u = b.finish();

        let mut plan = Plan::new(&u);
        layout_frame(&u, &mut plan);

        // var: 4 bytes; first alloca padded to 8, second follows.
        assert_eq!(plan.vars[0].offset, -4);
        assert_eq!(plan.alloca_offsets[&(0, 0)], -16);
        assert_eq!(plan.alloca_offsets[&(0, 1)], -20);
        assert_eq!(plan.stack_size, 20);
    }

    #[test]
    fn test_empty_unit_has_empty_frame() {
        let u = UnitBuilder::new(UnitKind::Function, "empty").finish();
        let mut plan = Plan::new(&u);
        layout_frame(&u, &mut plan);
        assert_eq!(plan.stack_size, 0);
        assert_eq!(plan.stack_wptr, 0);
    }
}
