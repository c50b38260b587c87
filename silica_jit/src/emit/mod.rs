//! Two-phase native code emission.
//!
//! Phase one walks the blocks in index order, stamping each block's start
//! offset, lowering every op against the storage plan, and recording a
//! patch for each branch. Phase two resolves the patches once all block
//! addresses are known. Reads fold according to storage: constants become
//! immediates, frame storage becomes RBP-relative memory operands, flags
//! are consumed only by the branch directly behind their producer.

pub mod x64;

use crate::buffer::CodeBuffer;
use crate::fatal;
use crate::plan::{prev_real_op, Plan, Storage};
use crate::regs::{Gpr, RegisterFile, SCRATCH0, SCRATCH1};
use silica_vcode::{uarray, BlockId, Opcode, RegId, Unit};
use x64::{cc_of, ALU_ADD, ALU_CMP, ALU_SUB, CC_E, CC_NE};

// =============================================================================
// Patches
// =============================================================================

/// A deferred branch displacement write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch {
    /// Offset of the rel32 displacement in the code buffer.
    pub site: u32,
    /// Block whose start address the displacement must reach.
    pub target: BlockId,
}

/// Everything emission produces besides the code bytes themselves.
#[derive(Debug)]
pub struct Emitted {
    /// Start offset of each block, in block-index order.
    pub block_ptrs: Vec<u32>,
    /// All branch patches, already applied.
    pub patches: Vec<Patch>,
    /// Per-block, per-op code offsets for dump annotation.
    pub op_offsets: Vec<Vec<u32>>,
}

/// Lower `unit` into `code` according to `plan`.
pub fn emit_unit(
    unit: &Unit,
    plan: &Plan,
    file: &RegisterFile,
    code: &mut CodeBuffer,
) -> Emitted {
    let emitter = Emitter {
        unit,
        plan,
        code,
        saves: file.used_callee_saves().collect(),
        block_ptrs: Vec::with_capacity(unit.count_blocks()),
        patches: Vec::new(),
        op_offsets: Vec::with_capacity(unit.count_blocks()),
        cur: (BlockId(0), 0),
    };
    emitter.run()
}

// =============================================================================
// Emitter
// =============================================================================

struct Emitter<'a> {
    unit: &'a Unit,
    plan: &'a Plan,
    code: &'a mut CodeBuffer,
    saves: Vec<Gpr>,
    block_ptrs: Vec<u32>,
    patches: Vec<Patch>,
    op_offsets: Vec<Vec<u32>>,
    cur: (BlockId, usize),
}

impl Emitter<'_> {
    fn run(mut self) -> Emitted {
        self.prologue();

        for b in 0..self.unit.count_blocks() {
            let block = BlockId(b as u32);
            self.block_ptrs.push(self.code.len() as u32);
            self.op_offsets.push(Vec::with_capacity(self.unit.count_ops(block)));

            for j in 0..self.unit.count_ops(block) {
                self.cur = (block, j);
                let offset = self.code.len() as u32;
                self.op_offsets[b].push(offset);
                self.op(block, j);
            }
        }

        self.fixup_jumps();

        Emitted {
            block_ptrs: self.block_ptrs,
            patches: self.patches,
            op_offsets: self.op_offsets,
        }
    }

    fn put(&mut self, bytes: &[u8]) {
        if self.code.emit(bytes).is_err() {
            fatal(
                self.unit,
                Some(self.plan),
                Some(self.cur),
                format!("JIT code buffer too small ({} bytes)", self.code.capacity()),
            );
        }
    }

    fn bail(&self, msg: String) -> ! {
        fatal(self.unit, Some(self.plan), Some(self.cur), msg)
    }

    // -------------------------------------------------------------------------
    // Prologue / epilogue
    // -------------------------------------------------------------------------

    fn frame_bytes(&self) -> i32 {
        ((self.plan.stack_size + 15) & !15) as i32
    }

    fn prologue(&mut self) {
        self.put(&x64::push(Gpr::Rbp));
        self.put(&x64::mov_rr(Gpr::Rbp, Gpr::Rsp));
        let frame = self.frame_bytes();
        if frame > 0 {
            self.put(&x64::alu_ri(ALU_SUB, Gpr::Rsp, frame));
        }
        for i in 0..self.saves.len() {
            self.put(&x64::push(self.saves[i]));
        }
    }

    fn epilogue(&mut self) {
        for i in (0..self.saves.len()).rev() {
            self.put(&x64::pop(self.saves[i]));
        }
        self.put(&x64::leave());
        self.put(&x64::ret());
    }

    // -------------------------------------------------------------------------
    // Operand handling
    // -------------------------------------------------------------------------

    /// Get the value of `reg` into some machine register, loading into
    /// `scratch` only when it does not already live in one.
    fn operand_reg(&mut self, reg: RegId, scratch: Gpr) -> Gpr {
        let state = *self.plan.reg(reg);
        match state.storage {
            Storage::Reg(gpr) => gpr,
            Storage::Const(value) => {
                self.put(&x64::mov_ri(scratch, value));
                scratch
            }
            Storage::Stack(offset) | Storage::Alias(offset) => {
                self.put(&x64::load(scratch, Gpr::Rbp, offset, state.size));
                scratch
            }
            Storage::Flags => self.bail(format!("{reg} consumed from flags outside a branch")),
            Storage::Unassigned => self.bail(format!("{reg} has no storage")),
        }
    }

    /// Force the value of `reg` into `dst`.
    fn load_into(&mut self, dst: Gpr, reg: RegId) {
        let state = *self.plan.reg(reg);
        match state.storage {
            Storage::Reg(gpr) => {
                if gpr != dst {
                    self.put(&x64::mov_rr(dst, gpr));
                }
            }
            Storage::Const(value) => self.put(&x64::mov_ri(dst, value)),
            Storage::Stack(offset) | Storage::Alias(offset) => {
                self.put(&x64::load(dst, Gpr::Rbp, offset, state.size));
            }
            Storage::Flags => self.bail(format!("{reg} consumed from flags outside a branch")),
            Storage::Unassigned => self.bail(format!("{reg} has no storage")),
        }
    }

    /// The register a result is computed in: its own if it has one, the
    /// first scratch otherwise.
    fn result_target(&self, reg: RegId) -> Gpr {
        match self.plan.reg(reg).storage {
            Storage::Reg(gpr) => gpr,
            Storage::Stack(_) => SCRATCH0,
            other => self.bail(format!("{reg} is not a computed result ({other:?})")),
        }
    }

    /// Write a computed value back to a spilled result's slot.
    fn store_result(&mut self, reg: RegId, from: Gpr) {
        let state = *self.plan.reg(reg);
        if let Storage::Stack(offset) = state.storage {
            self.put(&x64::store(Gpr::Rbp, offset, from, state.size));
        }
    }

    fn result(&self, block: BlockId, j: usize) -> RegId {
        match self.unit.get_result(block, j) {
            Some(result) => result,
            None => self.bail("op has no result".to_string()),
        }
    }

    fn frame_offset_of(&self, reg: RegId) -> i32 {
        match self.plan.reg(reg).storage.frame_offset() {
            Some(offset) => offset,
            None => self.bail(format!("{reg} is not in frame memory")),
        }
    }

    // -------------------------------------------------------------------------
    // Branch helpers
    // -------------------------------------------------------------------------

    fn branch(&mut self, encoded: (x64::Bytes, usize), target: BlockId) {
        let (bytes, disp_offset) = encoded;
        let site = (self.code.len() + disp_offset) as u32;
        self.put(&bytes);
        self.patches.push(Patch { site, target });
    }

    fn fixup_jumps(&mut self) {
        for i in 0..self.patches.len() {
            let patch = self.patches[i];
            let target = self.block_ptrs[patch.target.index()];
            let disp = target as i64 - (patch.site as i64 + 4);
            self.code.patch_i32(patch.site as usize, disp as i32);
        }
    }

    // -------------------------------------------------------------------------
    // Op lowering
    // -------------------------------------------------------------------------

    fn op(&mut self, block: BlockId, j: usize) {
        let unit = self.unit;
        match unit.get_op(block, j) {
            // No code: values fold into consumers, checks are elided at
            // this tier.
            Opcode::Const
            | Opcode::Comment
            | Opcode::Bounds
            | Opcode::DynamicBounds
            | Opcode::IndexCheck => {}

            Opcode::Add | Opcode::Sub | Opcode::Mul => self.arith(block, j),
            Opcode::Addi => self.addi(block, j),
            Opcode::Cmp => self.cmp(block, j),
            Opcode::Cond => self.cond(block, j),
            Opcode::Jump => {
                let target = unit.get_target(block, j, 0);
                self.branch(x64::jmp_rel32(), target);
            }
            Opcode::Return => self.return_(block, j),
            Opcode::Load => self.load_var(block, j),
            Opcode::Store => self.store_var(block, j),
            Opcode::LoadIndirect => self.load_indirect(block, j),
            Opcode::StoreIndirect => self.store_indirect(block, j),
            Opcode::Cast => self.cast(block, j),
            Opcode::Select => self.select(block, j),
            Opcode::Alloca => self.alloca(block, j),
            Opcode::Unwrap => self.unwrap_(block, j),
            Opcode::UarrayLeft | Opcode::UarrayRight | Opcode::UarrayDir => {
                self.uarray_field(block, j)
            }
            Opcode::UarrayLen => self.uarray_len(block, j),
            Opcode::RangeNull => self.range_null(block, j),
        }
    }

    fn arith(&mut self, block: BlockId, j: usize) {
        let opcode = self.unit.get_op(block, j);
        let result = self.result(block, j);
        let dst = self.result_target(result);

        self.load_into(dst, self.unit.get_arg(block, j, 0));
        let rhs = self.unit.get_arg(block, j, 1);
        self.arith_rhs(opcode, dst, rhs);
        self.store_result(result, dst);
    }

    fn addi(&mut self, block: BlockId, j: usize) {
        let result = self.result(block, j);
        let dst = self.result_target(result);

        self.load_into(dst, self.unit.get_arg(block, j, 0));
        let imm = self.unit.get_value(block, j);
        match i32::try_from(imm) {
            Ok(imm32) => self.put(&x64::alu_ri(ALU_ADD, dst, imm32)),
            Err(_) => {
                self.put(&x64::mov_ri(SCRATCH1, imm));
                self.put(&x64::add_rr(dst, SCRATCH1));
            }
        }
        self.store_result(result, dst);
    }

    fn arith_rhs(&mut self, opcode: Opcode, dst: Gpr, rhs: RegId) {
        let rhs_storage = self.plan.reg(rhs).storage;
        match (opcode, rhs_storage) {
            (Opcode::Add, Storage::Const(v)) if i32::try_from(v).is_ok() => {
                self.put(&x64::alu_ri(ALU_ADD, dst, v as i32));
            }
            (Opcode::Sub, Storage::Const(v)) if i32::try_from(v).is_ok() => {
                self.put(&x64::alu_ri(ALU_SUB, dst, v as i32));
            }
            (Opcode::Mul, Storage::Const(v)) if i32::try_from(v).is_ok() => {
                self.put(&x64::imul_rri(dst, dst, v as i32));
            }
            _ => {
                let rhs_reg = self.operand_reg(rhs, SCRATCH1);
                match opcode {
                    Opcode::Add => self.put(&x64::add_rr(dst, rhs_reg)),
                    Opcode::Sub => self.put(&x64::sub_rr(dst, rhs_reg)),
                    Opcode::Mul => self.put(&x64::imul_rr(dst, rhs_reg)),
                    _ => unreachable!("not an arithmetic op"),
                }
            }
        }
    }

    fn cmp(&mut self, block: BlockId, j: usize) {
        let result = self.result(block, j);
        let lhs = self.operand_reg(self.unit.get_arg(block, j, 0), SCRATCH0);

        let rhs = self.unit.get_arg(block, j, 1);
        match self.plan.reg(rhs).storage {
            Storage::Const(v) if i32::try_from(v).is_ok() => {
                self.put(&x64::alu_ri(ALU_CMP, lhs, v as i32));
            }
            _ => {
                let rhs_reg = self.operand_reg(rhs, SCRATCH1);
                self.put(&x64::cmp_rr(lhs, rhs_reg));
            }
        }

        // An ephemeral compare leaves its value in the flags for the
        // branch right behind it; anything else materializes a 0/1.
        if self.plan.reg(result).storage != Storage::Flags {
            let cc = cc_of(self.unit.get_cmp(block, j));
            let dst = self.result_target(result);
            self.put(&x64::setcc(cc, dst));
            self.store_result(result, dst);
        }
    }

    fn cond(&mut self, block: BlockId, j: usize) {
        let input = self.unit.get_arg(block, j, 0);
        let if_true = self.unit.get_target(block, j, 0);
        let if_false = self.unit.get_target(block, j, 1);

        if self.plan.reg(input).storage == Storage::Flags {
            let producer = match prev_real_op(self.unit, block, j) {
                Some(p) if self.unit.get_op(block, p) == Opcode::Cmp => p,
                _ => self.bail(format!("{input} in flags has no producing compare")),
            };
            let cc = cc_of(self.unit.get_cmp(block, producer));
            self.branch(x64::jcc_rel32(cc), if_true);
        } else {
            let value = self.operand_reg(input, SCRATCH0);
            self.put(&x64::alu_ri(ALU_CMP, value, 0));
            self.branch(x64::jcc_rel32(CC_NE), if_true);
        }
        self.branch(x64::jmp_rel32(), if_false);
    }

    fn return_(&mut self, block: BlockId, j: usize) {
        if self.unit.count_args(block, j) > 0 {
            self.load_into(Gpr::Rax, self.unit.get_arg(block, j, 0));
        }
        self.epilogue();
    }

    fn load_var(&mut self, block: BlockId, j: usize) {
        let result = self.result(block, j);
        // Aggregate loads alias the variable's memory; nothing to do.
        if matches!(self.plan.reg(result).storage, Storage::Alias(_)) {
            return;
        }
        let var = self.unit.get_address(block, j);
        let slot = self.plan.vars[var.index()];
        let dst = self.result_target(result);
        self.put(&x64::load(dst, Gpr::Rbp, slot.offset, slot.size));
        self.store_result(result, dst);
    }

    fn store_var(&mut self, block: BlockId, j: usize) {
        let var = self.unit.get_address(block, j);
        let slot = self.plan.vars[var.index()];
        let value = self.unit.get_arg(block, j, 0);
        match self.plan.reg(value).storage {
            Storage::Const(v) if i32::try_from(v).is_ok() => {
                self.put(&x64::store_imm(Gpr::Rbp, slot.offset, v as i32, slot.size));
            }
            _ => {
                let src = self.operand_reg(value, SCRATCH0);
                self.put(&x64::store(Gpr::Rbp, slot.offset, src, slot.size));
            }
        }
    }

    fn load_indirect(&mut self, block: BlockId, j: usize) {
        let result = self.result(block, j);
        let ptr = self.operand_reg(self.unit.get_arg(block, j, 0), SCRATCH0);
        let dst = self.result_target(result);
        let size = self.plan.reg(result).size;
        self.put(&x64::load(dst, ptr, 0, size));
        self.store_result(result, dst);
    }

    fn store_indirect(&mut self, block: BlockId, j: usize) {
        let value = self.unit.get_arg(block, j, 0);
        let ptr = self.operand_reg(self.unit.get_arg(block, j, 1), SCRATCH0);
        let size = self.plan.reg(value).size;
        match self.plan.reg(value).storage {
            Storage::Const(v) if i32::try_from(v).is_ok() => {
                self.put(&x64::store_imm(ptr, 0, v as i32, size));
            }
            _ => {
                let src = self.operand_reg(value, SCRATCH1);
                self.put(&x64::store(ptr, 0, src, size));
            }
        }
    }

    fn cast(&mut self, block: BlockId, j: usize) {
        let result = self.result(block, j);
        // A cast aliasing its source rereads the same memory.
        if matches!(self.plan.reg(result).storage, Storage::Alias(_)) {
            return;
        }
        let dst = self.result_target(result);
        self.load_into(dst, self.unit.get_arg(block, j, 0));
        self.store_result(result, dst);
    }

    fn select(&mut self, block: BlockId, j: usize) {
        let result = self.result(block, j);
        let cond = self.unit.get_arg(block, j, 0);
        let if_true = self.unit.get_arg(block, j, 1);
        let if_false = self.unit.get_arg(block, j, 2);
        let dst = self.result_target(result);

        if let Storage::Const(v) = self.plan.reg(cond).storage {
            let chosen = if v != 0 { if_true } else { if_false };
            self.load_into(dst, chosen);
            self.store_result(result, dst);
            return;
        }

        // Latch the truth test first: plain moves preserve the flags.
        let cond_reg = self.operand_reg(cond, SCRATCH0);
        self.put(&x64::alu_ri(ALU_CMP, cond_reg, 0));
        self.load_into(dst, if_true);
        self.load_into(SCRATCH1, if_false);
        self.put(&x64::cmovcc(CC_E, dst, SCRATCH1));
        self.store_result(result, dst);
    }

    fn alloca(&mut self, block: BlockId, j: usize) {
        let result = self.result(block, j);
        let offset = match self.plan.alloca_offsets.get(&(block.0, j as u32)) {
            Some(&offset) => offset,
            None => self.bail("alloca has no reserved frame space".to_string()),
        };
        let dst = self.result_target(result);
        self.put(&x64::lea(dst, Gpr::Rbp, offset));
        self.store_result(result, dst);
    }

    fn unwrap_(&mut self, block: BlockId, j: usize) {
        let result = self.result(block, j);
        let src = self.frame_offset_of(self.unit.get_arg(block, j, 0));
        let dst = self.result_target(result);
        self.put(&x64::load(dst, Gpr::Rbp, src + uarray::PTR_OFFSET, 8));
        self.store_result(result, dst);
    }

    fn uarray_field(&mut self, block: BlockId, j: usize) {
        let result = self.result(block, j);
        // An aliased field is read in place by its consumers.
        if matches!(self.plan.reg(result).storage, Storage::Alias(_)) {
            return;
        }
        let src = self.frame_offset_of(self.unit.get_arg(block, j, 0));
        let field = match self.unit.get_op(block, j) {
            Opcode::UarrayLeft => uarray::left_offset(0),
            Opcode::UarrayRight => uarray::right_offset(0),
            Opcode::UarrayDir => uarray::dir_offset(0),
            _ => unreachable!(),
        };
        let dst = self.result_target(result);
        self.put(&x64::load(dst, Gpr::Rbp, src + field, 4));
        self.store_result(result, dst);
    }

    fn uarray_len(&mut self, block: BlockId, j: usize) {
        let result = self.result(block, j);
        let src = self.frame_offset_of(self.unit.get_arg(block, j, 0));
        let dst = self.result_target(result);

        // dst = right - left, negated for descending ranges, plus one.
        self.put(&x64::load(dst, Gpr::Rbp, src + uarray::right_offset(0), 4));
        self.put(&x64::load(SCRATCH1, Gpr::Rbp, src + uarray::left_offset(0), 4));
        self.put(&x64::sub_rr(dst, SCRATCH1));
        self.put(&x64::mov_rr(SCRATCH1, dst));
        self.put(&x64::neg(SCRATCH1));
        self.put(&x64::cmp_mem_imm8(Gpr::Rbp, src + uarray::dir_offset(0), 4, 0));
        self.put(&x64::cmovcc(CC_NE, dst, SCRATCH1));
        self.put(&x64::alu_ri(ALU_ADD, dst, 1));
        self.store_result(result, dst);
    }

    fn range_null(&mut self, block: BlockId, j: usize) {
        let result = self.result(block, j);
        let left = self.unit.get_arg(block, j, 0);
        let right = self.unit.get_arg(block, j, 1);
        let dir = self.unit.get_arg(block, j, 2);
        let dst = self.result_target(result);

        self.load_into(dst, left);
        let right_reg = self.operand_reg(right, SCRATCH1);
        self.put(&x64::cmp_rr(dst, right_reg));

        // Ascending ranges are null when left > right, descending when
        // right > left.
        match self.plan.reg(dir).storage {
            Storage::Const(v) => {
                let cc = if v == 0 { 0xf } else { 0xc };
                self.put(&x64::setcc(cc, dst));
            }
            dir_storage => {
                self.put(&x64::setcc(0xf, dst));
                self.put(&x64::setcc(0xc, SCRATCH1));
                match dir_storage {
                    Storage::Reg(gpr) => self.put(&x64::alu_ri(ALU_CMP, gpr, 0)),
                    Storage::Stack(offset) | Storage::Alias(offset) => {
                        let size = self.plan.reg(dir).size;
                        self.put(&x64::cmp_mem_imm8(Gpr::Rbp, offset, size, 0));
                    }
                    _ => self.bail(format!("{dir} has no readable storage")),
                }
                self.put(&x64::cmovcc(CC_NE, dst, SCRATCH1));
            }
        }
        self.store_result(result, dst);
    }
}
