//! End-to-end pipeline tests: build synthetic VCODE units, compile them,
//! and (on x86-64 hosts) execute the emitted code. The bytecode
//! interpreter doubles as the executable model for cross-checking what
//! the native code computes.

use silica_jit::{Gpr, Jit, Storage};
use silica_vcode::{BlockId, RegId, Unit, UnitBuilder, UnitKind, VCmp, VType};

fn jit() -> Jit {
    Jit::new()
}

/// sum(n) = 0 + 1 + ... + (n-1), looping through frame variables.
fn sum_unit() -> Unit {
    let mut b = UnitBuilder::new(UnitKind::Function, "sum_below");
    let n = b.add_param(VType::INT64);
    let acc = b.add_var(VType::INT64);
    let i = b.add_var(VType::INT64);

    let head = b.add_block();
    let body = b.add_block();
    let exit = b.add_block();

    let zero = b.emit_const(VType::INT64, 0);
    b.emit_store(zero, acc);
    b.emit_store(zero, i);
    b.emit_jump(head);

    b.select_block(head);
    let iv = b.emit_load(i);
    let more = b.emit_cmp(VCmp::Lt, iv, n);
    b.emit_cond(more, body, exit);

    b.select_block(body);
    let av = b.emit_load(acc);
    let sum = b.emit_add(av, iv);
    b.emit_store(sum, acc);
    let next = b.emit_addi(iv, 1);
    b.emit_store(next, i);
    b.emit_jump(head);

    b.select_block(exit);
    let result = b.emit_load(acc);
    b.emit_return(Some(result));
    b.finish()
}

// =============================================================================
// Planner properties over the whole pipeline
// =============================================================================

#[test]
fn test_ephemeral_compare_planned_into_flags() {
    let unit = sum_unit();
    let jit = jit();
    let base = jit.compile(&unit);
    let state = jit.find(base).unwrap();

    // The loop condition is the only compare and it feeds the branch
    // directly; it must live in the flags, and nothing else may.
    let flags_count = (0..unit.count_regs())
        .filter(|&i| state.plan().reg(RegId(i as u32)).storage == Storage::Flags)
        .count();
    assert_eq!(flags_count, 1);
}

#[test]
fn test_frame_sufficiency_invariant() {
    let unit = sum_unit();
    let jit = jit();
    let state = jit.find(jit.compile(&unit)).unwrap();
    assert!(state.plan().stack_wptr <= state.plan().stack_size);
}

#[test]
fn test_blocks_emitted_in_index_order() {
    let unit = sum_unit();
    let jit = jit();
    let state = jit.find(jit.compile(&unit)).unwrap();

    let mut last = 0;
    for b in 0..unit.count_blocks() {
        let offset = state.block_offset(BlockId(b as u32));
        assert!(offset >= last, "block {b} out of order");
        last = offset;
    }
}

#[test]
fn test_every_branch_patch_resolved() {
    let unit = sum_unit();
    let jit = jit();
    let state = jit.find(jit.compile(&unit)).unwrap();

    // Each patch site must hold the displacement to its target block,
    // never the zero placeholder it was emitted with (a zero displacement
    // would jump into the middle of the branch's own successor).
    let code = unsafe { std::slice::from_raw_parts(state.code_base(), state.code_len()) };
    assert!(!state.patches().is_empty());
    for patch in state.patches() {
        let site = patch.site as usize;
        let disp = i32::from_le_bytes([code[site], code[site + 1], code[site + 2], code[site + 3]]);
        let landing = (site as i64 + 4 + disp as i64) as u32;
        assert_eq!(landing, state.block_offset(patch.target));
    }
}

#[test]
fn test_no_two_live_values_share_a_machine_register() {
    // Heavy pressure with long-lived values: at every op, the set of
    // register-resident values live at that point must be duplicate-free.
    let mut b = UnitBuilder::new(UnitKind::Function, "crowded");
    let seed = b.emit_const(VType::INT64, 1);
    let values: Vec<_> = (0..13).map(|i| b.emit_addi(seed, i)).collect();
    let mut acc = values[0];
    for &v in &values[1..] {
        acc = b.emit_add(acc, v);
    }
    b.emit_return(Some(acc));
    let unit = b.finish();

    let jit = jit();
    let state = jit.find(jit.compile(&unit)).unwrap();

    let mut by_reg: std::collections::HashMap<Gpr, Vec<usize>> = std::collections::HashMap::new();
    for i in 0..unit.count_regs() {
        if let Storage::Reg(gpr) = state.plan().reg(RegId(i as u32)).storage {
            by_reg.entry(gpr).or_default().push(i);
        }
    }
    for (gpr, owners) in &by_reg {
        // A register may be reused only after its previous tenant died;
        // tenants of the same register must have disjoint lifetimes.
        for pair in owners.windows(2) {
            let first = state.plan().reg(RegId(pair[0] as u32));
            let second = state.plan().reg(RegId(pair[1] as u32));
            assert!(
                first.lifetime <= second.lifetime,
                "{gpr} shared by r{} and r{} with overlapping lives",
                pair[0],
                pair[1]
            );
        }
    }
}

// =============================================================================
// Execution (x86-64 hosts)
// =============================================================================

#[cfg(target_arch = "x86_64")]
mod execute {
    use super::*;

    type Fn0 = unsafe extern "C" fn() -> i64;
    type Fn1 = unsafe extern "C" fn(i64) -> i64;
    type Fn2 = unsafe extern "C" fn(i64, i64) -> i64;

    fn call0(jit: &Jit, unit: &Unit) -> i64 {
        let state = jit.find(jit.compile(unit)).unwrap();
        let f: Fn0 = unsafe { state.entry() };
        unsafe { f() }
    }

    fn call1(jit: &Jit, unit: &Unit, a: i64) -> i64 {
        let state = jit.find(jit.compile(unit)).unwrap();
        let f: Fn1 = unsafe { state.entry() };
        unsafe { f(a) }
    }

    fn call2(jit: &Jit, unit: &Unit, a: i64, b: i64) -> i64 {
        let state = jit.find(jit.compile(unit)).unwrap();
        let f: Fn2 = unsafe { state.entry() };
        unsafe { f(a, b) }
    }

    #[test]
    fn test_constant_function() {
        let mut b = UnitBuilder::new(UnitKind::Function, "forty_two");
        let c = b.emit_const(VType::INT64, 42);
        b.emit_return(Some(c));
        let unit = b.finish();
        assert_eq!(call0(&jit(), &unit), 42);
    }

    #[test]
    fn test_wide_constant() {
        let mut b = UnitBuilder::new(UnitKind::Function, "wide");
        let c = b.emit_const(VType::INT64, 0x1234_5678_9abc);
        b.emit_return(Some(c));
        let unit = b.finish();
        assert_eq!(call0(&jit(), &unit), 0x1234_5678_9abc);
    }

    #[test]
    fn test_parameter_arithmetic() {
        let mut b = UnitBuilder::new(UnitKind::Function, "madd");
        let x = b.add_param(VType::INT64);
        let y = b.add_param(VType::INT64);
        let prod = b.emit_mul(x, y);
        let total = b.emit_addi(prod, 5);
        b.emit_return(Some(total));
        let unit = b.finish();

        let jit = jit();
        assert_eq!(call2(&jit, &unit, 6, 7), 47);
        assert_eq!(call2(&jit, &unit, -3, 9), -22);
    }

    #[test]
    fn test_subtraction_order() {
        let mut b = UnitBuilder::new(UnitKind::Function, "diff");
        let x = b.add_param(VType::INT64);
        let y = b.add_param(VType::INT64);
        let d = b.emit_sub(x, y);
        b.emit_return(Some(d));
        let unit = b.finish();
        assert_eq!(call2(&jit(), &unit, 10, 3), 7);
    }

    #[test]
    fn test_loop_over_frame_variables() {
        let unit = sum_unit();
        let jit = jit();
        assert_eq!(call1(&jit, &unit, 0), 0);
        assert_eq!(call1(&jit, &unit, 1), 0);
        assert_eq!(call1(&jit, &unit, 10), 45);
        assert_eq!(call1(&jit, &unit, 100), 4950);
    }

    #[test]
    fn test_select_clamps() {
        let mut b = UnitBuilder::new(UnitKind::Function, "clamp");
        let x = b.add_param(VType::INT64);
        let zero = b.emit_const(VType::INT64, 0);
        let is_neg = b.emit_cmp(VCmp::Lt, x, zero);
        let clamped = b.emit_select(is_neg, zero, x);
        b.emit_return(Some(clamped));
        let unit = b.finish();

        let jit = jit();
        assert_eq!(call1(&jit, &unit, -5), 0);
        assert_eq!(call1(&jit, &unit, 0), 0);
        assert_eq!(call1(&jit, &unit, 7), 7);
    }

    #[test]
    fn test_materialized_compare_is_boolean() {
        let mut b = UnitBuilder::new(UnitKind::Function, "is_positive");
        let x = b.add_param(VType::INT64);
        let zero = b.emit_const(VType::INT64, 0);
        let pos = b.emit_cmp(VCmp::Gt, x, zero);
        b.emit_return(Some(pos));
        let unit = b.finish();

        let jit = jit();
        assert_eq!(call1(&jit, &unit, 5), 1);
        assert_eq!(call1(&jit, &unit, -5), 0);
        assert_eq!(call1(&jit, &unit, 0), 0);
    }

    #[test]
    fn test_conditional_branches_both_ways() {
        let mut b = UnitBuilder::new(UnitKind::Function, "abs");
        let x = b.add_param(VType::INT64);
        let neg = b.add_block();
        let pos = b.add_block();
        let zero = b.emit_const(VType::INT64, 0);
        let is_neg = b.emit_cmp(VCmp::Lt, x, zero);
        b.emit_cond(is_neg, neg, pos);
        b.select_block(neg);
        let flipped = b.emit_sub(zero, x);
        b.emit_return(Some(flipped));
        b.select_block(pos);
        b.emit_return(Some(x));
        let unit = b.finish();

        let jit = jit();
        assert_eq!(call1(&jit, &unit, -9), 9);
        assert_eq!(call1(&jit, &unit, 9), 9);
        assert_eq!(call1(&jit, &unit, 0), 0);
    }

    #[test]
    fn test_alloca_indirect_roundtrip() {
        let mut b = UnitBuilder::new(UnitKind::Function, "scratch_cell");
        let x = b.add_param(VType::INT64);
        let cell = b.emit_alloca(VType::INT64);
        b.emit_store_indirect(x, cell);
        let back = b.emit_load_indirect(VType::INT64, cell);
        let doubled = b.emit_add(back, back);
        b.emit_return(Some(doubled));
        let unit = b.finish();

        assert_eq!(call1(&jit(), &unit, 21), 42);
    }

    #[test]
    fn test_integer_cast_is_value_preserving() {
        let mut b = UnitBuilder::new(UnitKind::Function, "narrow");
        let x = b.add_param(VType::INT64);
        let as_offset = b.emit_cast(VType::Offset, x);
        let back = b.emit_cast(VType::INT64, as_offset);
        b.emit_return(Some(back));
        let unit = b.finish();

        assert_eq!(call1(&jit(), &unit, 1234), 1234);
        assert_eq!(call1(&jit(), &unit, -1234), -1234);
    }

    #[test]
    fn test_register_pressure_under_execution() {
        // Thirteen simultaneously live values: one spills, callee-saves
        // get used, and the result must still be right.
        let mut b = UnitBuilder::new(UnitKind::Function, "crowded");
        let seed = b.emit_const(VType::INT64, 1);
        let values: Vec<_> = (0..13).map(|i| b.emit_addi(seed, i)).collect();
        let mut acc = values[0];
        for &v in &values[1..] {
            acc = b.emit_add(acc, v);
        }
        b.emit_return(Some(acc));
        let unit = b.finish();

        // 13 values of (1 + i): 13 + (0 + 1 + ... + 12).
        assert_eq!(call0(&jit(), &unit), 13 + 78);
    }

    #[test]
    fn test_sub_byte_variable_widths() {
        // A one-byte variable round-trips negative values through a
        // sign-extending load.
        let mut b = UnitBuilder::new(UnitKind::Function, "tiny_var");
        let x = b.add_param(VType::INT64);
        let v = b.add_var(VType::Int { low: -128, high: 127 });
        b.emit_store(x, v);
        let back = b.emit_load(v);
        b.emit_return(Some(back));
        let unit = b.finish();

        let jit = jit();
        assert_eq!(call1(&jit, &unit, -7), -7);
        assert_eq!(call1(&jit, &unit, 100), 100);
    }

    #[test]
    fn test_cache_reverse_lookup_law() {
        let unit = sum_unit();
        let jit = jit();
        let base = jit.compile(&unit);
        let len = jit.find(base).unwrap().code_len();

        for k in 0..len {
            let addr = unsafe { base.add(k) };
            let state = jit
                .find(addr)
                .unwrap_or_else(|| panic!("offset {k} missed the cache"));
            assert_eq!(state.unit_id(), unit.id());
        }
        assert!(jit.find(unsafe { base.add(len) }).is_none());
    }

    #[test]
    fn test_free_unmaps_and_forgets() {
        let unit = sum_unit();
        let jit = jit();
        let base = jit.compile(&unit);
        assert!(jit.find(base).is_some());

        jit.free(base);
        assert!(jit.find(base).is_none());

        // Recompiling works and yields a fresh cache entry.
        let again = jit.compile(&unit);
        assert!(jit.find(again).is_some());
        jit.free(again);
    }

    // -------------------------------------------------------------------------
    // Native code against the bytecode interpreter as a model
    // -------------------------------------------------------------------------

    #[test]
    fn test_native_matches_bytecode_model() {
        use silica_bytecode::{r, Assembler, Interpreter, InterpMachine};

        // f(n) = n*n + 3n - 7, once as VCODE -> native code...
        let mut b = UnitBuilder::new(UnitKind::Function, "poly");
        let n = b.add_param(VType::INT64);
        let sq = b.emit_mul(n, n);
        let three = b.emit_const(VType::INT64, 3);
        let lin = b.emit_mul(n, three);
        let partial = b.emit_add(sq, lin);
        let result = b.emit_addi(partial, -7);
        b.emit_return(Some(result));
        let unit = b.finish();
        let jit = jit();

        for n in [-10i64, -1, 0, 1, 5, 111] {
            // ...and once as a bytecode program for the reference
            // interpreter.
            let mut a = Assembler::new(InterpMachine::get());
            a.mov_imm(r(1), n);
            a.mov(r(0), r(1));
            a.mul(r(0), r(1));
            a.mov(r(2), r(1));
            a.mul_imm(r(2), 3);
            a.add(r(0), r(2));
            a.add_imm(r(0), -7);
            a.ret();
            let code = a.finish();
            let model = Interpreter::new(&code).run(&code);

            assert_eq!(call1(&jit, &unit, n), model, "disagreement at n = {n}");
        }
    }
}
