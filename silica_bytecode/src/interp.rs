//! Reference interpreter for bytecode programs.
//!
//! This is the executable model of the virtual machine: registers are
//! 64-bit, memory is the program's stack frame addressed from zero, and
//! LDR/STR move `word_size`-byte little-endian scalars. Tests use it to
//! check that emitted programs compute what their source ops mean.

use crate::asm::{Bytecode, Cond};
use crate::dump::Instr;

/// Flag bits produced by a comparison outcome.
fn flags_for_ordering(ord: std::cmp::Ordering) -> u8 {
    use std::cmp::Ordering::*;
    match ord {
        Less => (Cond::NZ.bits() | Cond::LT.bits() | Cond::LE.bits()),
        Equal => (Cond::Z.bits() | Cond::GE.bits() | Cond::LE.bits()),
        Greater => (Cond::NZ.bits() | Cond::GT.bits() | Cond::GE.bits()),
    }
}

/// Executes one bytecode program at a time.
pub struct Interpreter {
    regs: Vec<i64>,
    flags: u8,
    frame: Vec<u8>,
}

impl Interpreter {
    /// Execution fuel: an interpreted program that retires more
    /// instructions than this is assumed to be stuck.
    const FUEL: usize = 1 << 20;

    /// Create an interpreter sized for `code`. Registers start at zero,
    /// so the stack pointer addresses the frame from offset 0.
    pub fn new(code: &Bytecode) -> Self {
        Interpreter {
            regs: vec![0; code.machine().num_regs() as usize],
            flags: 0,
            frame: vec![0; code.frame_size() as usize],
        }
    }

    /// Set a register before execution (e.g. to pass arguments).
    pub fn set_reg(&mut self, reg: u8, value: i64) {
        self.regs[reg as usize] = value;
    }

    /// Read a register after execution.
    pub fn reg(&self, reg: u8) -> i64 {
        self.regs[reg as usize]
    }

    /// Raw frame memory.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// Run `code` to its RET and return the value of the machine's result
    /// register.
    ///
    /// # Panics
    /// Panics on undecodable bytes, out-of-frame memory access, a jump
    /// outside the program, or fuel exhaustion. These are all bugs in the
    /// program under test.
    pub fn run(&mut self, code: &Bytecode) -> i64 {
        let machine = *code.machine();
        let bytes = code.bytes();
        let word = machine.word_size() as usize;
        let mut pc = 0usize;

        for _ in 0..Self::FUEL {
            if pc >= bytes.len() {
                panic!("execution ran off the end at offset {pc}");
            }
            let (instr, len) = match Instr::decode(&machine, &bytes[pc..]) {
                Some(decoded) => decoded,
                None => panic!("undecodable instruction at offset {pc}"),
            };
            let next = pc + len;

            match instr {
                Instr::Nop => {}
                Instr::Ret => return self.regs[machine.result_reg() as usize],

                Instr::Mov { dst, src } => self.regs[dst.0 as usize] = self.regs[src.0 as usize],
                Instr::MovB { dst, imm } => self.regs[dst.0 as usize] = imm as i64,
                Instr::MovW { dst, imm } => self.regs[dst.0 as usize] = imm as i64,

                Instr::Add { dst, src } => self.add(dst.0, self.regs[src.0 as usize]),
                Instr::AddB { dst, imm } => self.add(dst.0, imm as i64),
                Instr::AddW { dst, imm } => self.add(dst.0, imm as i64),

                Instr::Sub { dst, src } => {
                    let value = self.regs[dst.0 as usize].wrapping_sub(self.regs[src.0 as usize]);
                    self.regs[dst.0 as usize] = value;
                    self.flags = flags_for_ordering(value.cmp(&0));
                }

                Instr::Mul { dst, src } => {
                    self.regs[dst.0 as usize] =
                        self.regs[dst.0 as usize].wrapping_mul(self.regs[src.0 as usize]);
                }
                Instr::MulB { dst, imm } => {
                    self.regs[dst.0 as usize] = self.regs[dst.0 as usize].wrapping_mul(imm as i64);
                }
                Instr::MulW { dst, imm } => {
                    self.regs[dst.0 as usize] = self.regs[dst.0 as usize].wrapping_mul(imm as i64);
                }

                Instr::AndB { dst, imm } => {
                    self.regs[dst.0 as usize] &= imm as i64;
                }
                Instr::AndW { dst, imm } => {
                    self.regs[dst.0 as usize] &= imm as i64;
                }

                Instr::TestB { dst, imm } => {
                    let value = self.regs[dst.0 as usize] & (imm as i64);
                    self.flags = flags_for_ordering(value.cmp(&0));
                }
                Instr::TestW { dst, imm } => {
                    let value = self.regs[dst.0 as usize] & (imm as i64);
                    self.flags = flags_for_ordering(value.cmp(&0));
                }

                Instr::Cmp { lhs, rhs } => {
                    let lhs = self.regs[lhs.0 as usize];
                    let rhs = self.regs[rhs.0 as usize];
                    self.flags = flags_for_ordering(lhs.cmp(&rhs));
                }

                Instr::Cset { dst, cond } => {
                    self.regs[dst.0 as usize] = ((self.flags & cond.bits()) != 0) as i64;
                }

                Instr::Str { base, offset, src } => {
                    let addr = self.address(base.0, offset, word);
                    let value = self.regs[src.0 as usize];
                    self.frame[addr..addr + word].copy_from_slice(&value.to_le_bytes()[..word]);
                }

                Instr::Ldr { dst, base, offset } => {
                    let addr = self.address(base.0, offset, word);
                    let mut raw = [0u8; 8];
                    raw[..word].copy_from_slice(&self.frame[addr..addr + word]);
                    let wide = i64::from_le_bytes(raw);
                    // Sign-extend from the word width.
                    let shift = 64 - word * 8;
                    self.regs[dst.0 as usize] = (wide << shift) >> shift;
                }

                Instr::Jmp { disp } => {
                    pc = Self::branch_target(pc + len, disp, bytes.len());
                    continue;
                }
                Instr::Jmpc { cond, disp } => {
                    if (self.flags & cond.bits()) != 0 {
                        pc = Self::branch_target(pc + len, disp, bytes.len());
                        continue;
                    }
                }
            }
            pc = next;
        }
        panic!("interpreter fuel exhausted (runaway loop?)");
    }

    fn add(&mut self, dst: u8, value: i64) {
        let sum = self.regs[dst as usize].wrapping_add(value);
        self.regs[dst as usize] = sum;
        self.flags = flags_for_ordering(sum.cmp(&0));
    }

    fn address(&self, base: u8, offset: i16, word: usize) -> usize {
        let addr = self.regs[base as usize] + offset as i64;
        let addr = usize::try_from(addr)
            .unwrap_or_else(|_| panic!("negative frame address {addr}"));
        assert!(
            addr + word <= self.frame.len(),
            "frame access at {addr} outside {} bytes",
            self.frame.len()
        );
        addr
    }

    fn branch_target(after: usize, disp: i16, len: usize) -> usize {
        let target = after as i64 + disp as i64;
        let target = usize::try_from(target)
            .unwrap_or_else(|_| panic!("jump to negative offset {target}"));
        assert!(target <= len, "jump outside program to {target}");
        target
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{r, Assembler, Cond, Label};
    use crate::machine::InterpMachine;

    fn asm() -> Assembler {
        Assembler::new(InterpMachine::get())
    }

    #[test]
    fn test_constant_return() {
        let mut a = asm();
        a.mov_imm(r(0), 42);
        a.ret();
        let code = a.finish();
        assert_eq!(Interpreter::new(&code).run(&code), 42);
    }

    #[test]
    fn test_arithmetic() {
        let mut a = asm();
        a.mov_imm(r(1), 6);
        a.mov_imm(r(2), 7);
        a.mov(r(0), r(1));
        a.mul(r(0), r(2));
        a.add_imm(r(0), -2);
        a.ret();
        let code = a.finish();
        assert_eq!(Interpreter::new(&code).run(&code), 40);
    }

    #[test]
    fn test_cset_after_cmp() {
        let mut a = asm();
        a.cmp(r(1), r(2));
        a.cset(r(0), Cond::GT);
        a.ret();
        let code = a.finish();

        let mut interp = Interpreter::new(&code);
        interp.set_reg(1, 10);
        interp.set_reg(2, 3);
        assert_eq!(interp.run(&code), 1);

        let mut interp = Interpreter::new(&code);
        interp.set_reg(1, 3);
        interp.set_reg(2, 10);
        assert_eq!(interp.run(&code), 0);
    }

    #[test]
    fn test_frame_store_load_roundtrip() {
        let mut a = asm();
        a.set_frame_size(16);
        let sp = a.sp();
        a.mov_imm(r(1), -123);
        a.str_(sp, 8, r(1));
        a.ldr(r(0), sp, 8);
        a.ret();
        let code = a.finish();
        assert_eq!(Interpreter::new(&code).run(&code), -123);
    }

    #[test]
    fn test_countdown_loop() {
        // r0 = sum of 1..=5 via a backward conditional jump.
        let mut a = asm();
        a.mov_imm(r(0), 0);
        a.mov_imm(r(1), 5);
        let mut top = Label::new();
        a.bind(&mut top);
        a.add(r(0), r(1));
        a.add_imm(r(1), -1);
        a.test(r(1), -1);
        a.jmpc(&mut top, Cond::NZ);
        a.ret();
        let code = a.finish();
        assert_eq!(Interpreter::new(&code).run(&code), 15);
    }

    #[test]
    fn test_unconditional_jump_skips() {
        let mut a = asm();
        a.mov_imm(r(0), 1);
        let mut over = Label::new();
        a.jmp(&mut over);
        a.mov_imm(r(0), 99);
        a.bind(&mut over);
        a.ret();
        let code = a.finish();
        assert_eq!(Interpreter::new(&code).run(&code), 1);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_out_of_frame_access_panics() {
        let mut a = asm();
        a.set_frame_size(4);
        a.str_(a.sp(), 8, r(0));
        a.ret();
        let code = a.finish();
        Interpreter::new(&code).run(&code);
    }

    #[test]
    fn test_word_sized_truncation() {
        // The 4-byte word loses the high bits of a 64-bit register on a
        // store/load round trip.
        let mut a = asm();
        a.set_frame_size(8);
        let sp = a.sp();
        a.mov_imm(r(1), 1);
        a.mov_imm(r(2), 32);
        // r1 = 1 << 32 via repeated doubling.
        let mut top = Label::new();
        a.bind(&mut top);
        a.add(r(1), r(1));
        a.add_imm(r(2), -1);
        a.test(r(2), -1);
        a.jmpc(&mut top, Cond::NZ);
        a.str_(sp, 0, r(1));
        a.ldr(r(0), sp, 0);
        a.ret();
        let code = a.finish();
        assert_eq!(Interpreter::new(&code).run(&code), 0);
    }
}
