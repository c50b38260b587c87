//! Bytecode decoding and disassembly dumps.
//!
//! [`Instr::decode`] is a byte-accurate decoder over the wire format; the
//! dump renderer drives it instruction by instruction. One byte offset
//! may be highlighted, used to point at the interpreter PC or at an error
//! location.

use crate::asm::{Bytecode, Cond, Opcode, Register};
use crate::machine::Machine;
use std::fmt;

// =============================================================================
// Decoded Instructions
// =============================================================================

/// A decoded bytecode instruction with its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    Nop,
    Ret,
    Mov { dst: Register, src: Register },
    MovB { dst: Register, imm: i8 },
    MovW { dst: Register, imm: i32 },
    Add { dst: Register, src: Register },
    AddB { dst: Register, imm: i8 },
    AddW { dst: Register, imm: i32 },
    Sub { dst: Register, src: Register },
    Mul { dst: Register, src: Register },
    MulB { dst: Register, imm: i8 },
    MulW { dst: Register, imm: i32 },
    AndB { dst: Register, imm: i8 },
    AndW { dst: Register, imm: i32 },
    TestB { dst: Register, imm: i8 },
    TestW { dst: Register, imm: i32 },
    Str { base: Register, offset: i16, src: Register },
    Ldr { dst: Register, base: Register, offset: i16 },
    Cmp { lhs: Register, rhs: Register },
    Cset { dst: Register, cond: Cond },
    Jmp { disp: i16 },
    Jmpc { cond: Cond, disp: i16 },
}

impl Instr {
    /// Decode one instruction from the front of `bytes`.
    ///
    /// Returns the instruction and its encoded length, or `None` when the
    /// bytes do not form a valid instruction.
    pub fn decode(machine: &Machine, bytes: &[u8]) -> Option<(Instr, usize)> {
        let opcode = Opcode::from_u8(*bytes.first()?)?;

        let reg = |i: usize| bytes.get(i).copied().map(Register);
        let imm8 = |i: usize| bytes.get(i).map(|&b| b as i8);
        let imm16 = |i: usize| {
            let slice = bytes.get(i..i + 2)?;
            Some(machine.read_i16(slice))
        };
        let imm32 = |i: usize| {
            let slice = bytes.get(i..i + 4)?;
            Some(machine.read_i32(slice))
        };

        let decoded = match opcode {
            Opcode::Nop => (Instr::Nop, 1),
            Opcode::Ret => (Instr::Ret, 1),
            Opcode::Mov => (Instr::Mov { dst: reg(1)?, src: reg(2)? }, 3),
            Opcode::Movb => (Instr::MovB { dst: reg(1)?, imm: imm8(2)? }, 3),
            Opcode::Movw => (Instr::MovW { dst: reg(1)?, imm: imm32(2)? }, 6),
            Opcode::Add => (Instr::Add { dst: reg(1)?, src: reg(2)? }, 3),
            Opcode::Addb => (Instr::AddB { dst: reg(1)?, imm: imm8(2)? }, 3),
            Opcode::Addw => (Instr::AddW { dst: reg(1)?, imm: imm32(2)? }, 6),
            Opcode::Sub => (Instr::Sub { dst: reg(1)?, src: reg(2)? }, 3),
            Opcode::Mul => (Instr::Mul { dst: reg(1)?, src: reg(2)? }, 3),
            Opcode::Mulb => (Instr::MulB { dst: reg(1)?, imm: imm8(2)? }, 3),
            Opcode::Mulw => (Instr::MulW { dst: reg(1)?, imm: imm32(2)? }, 6),
            Opcode::Andb => (Instr::AndB { dst: reg(1)?, imm: imm8(2)? }, 3),
            Opcode::Andw => (Instr::AndW { dst: reg(1)?, imm: imm32(2)? }, 6),
            Opcode::Testb => (Instr::TestB { dst: reg(1)?, imm: imm8(2)? }, 3),
            Opcode::Testw => (Instr::TestW { dst: reg(1)?, imm: imm32(2)? }, 6),
            Opcode::Str => (
                Instr::Str {
                    base: reg(1)?,
                    offset: imm16(2)?,
                    src: reg(4)?,
                },
                5,
            ),
            Opcode::Ldr => (
                Instr::Ldr {
                    dst: reg(1)?,
                    base: reg(2)?,
                    offset: imm16(3)?,
                },
                5,
            ),
            Opcode::Cmp => (Instr::Cmp { lhs: reg(1)?, rhs: reg(2)? }, 3),
            Opcode::Cset => (
                Instr::Cset {
                    dst: reg(1)?,
                    cond: Cond::from_bits(*bytes.get(2)?),
                },
                3,
            ),
            Opcode::Jmp => (Instr::Jmp { disp: imm16(1)? }, 3),
            Opcode::Jmpc => (
                Instr::Jmpc {
                    cond: Cond::from_bits(*bytes.get(1)?),
                    disp: imm16(2)?,
                },
                4,
            ),
        };
        Some(decoded)
    }

    /// Render with the machine's register names.
    pub fn write(&self, machine: &Machine, out: &mut dyn fmt::Write) -> fmt::Result {
        let r = |reg: Register| machine.fmt_reg(reg.0);
        match *self {
            Instr::Nop => write!(out, "NOP"),
            Instr::Ret => write!(out, "RET"),
            Instr::Mov { dst, src } => write!(out, "MOV {}, {}", r(dst), r(src)),
            Instr::MovB { dst, imm } => write!(out, "MOVB {}, {}", r(dst), imm),
            Instr::MovW { dst, imm } => write!(out, "MOVW {}, {}", r(dst), imm),
            Instr::Add { dst, src } => write!(out, "ADD {}, {}", r(dst), r(src)),
            Instr::AddB { dst, imm } => write!(out, "ADDB {}, {}", r(dst), imm),
            Instr::AddW { dst, imm } => write!(out, "ADDW {}, {}", r(dst), imm),
            Instr::Sub { dst, src } => write!(out, "SUB {}, {}", r(dst), r(src)),
            Instr::Mul { dst, src } => write!(out, "MUL {}, {}", r(dst), r(src)),
            Instr::MulB { dst, imm } => write!(out, "MULB {}, {}", r(dst), imm),
            Instr::MulW { dst, imm } => write!(out, "MULW {}, {}", r(dst), imm),
            Instr::AndB { dst, imm } => write!(out, "ANDB {}, {}", r(dst), imm),
            Instr::AndW { dst, imm } => write!(out, "ANDW {}, {}", r(dst), imm),
            Instr::TestB { dst, imm } => write!(out, "TESTB {}, {}", r(dst), imm),
            Instr::TestW { dst, imm } => write!(out, "TESTW {}, {}", r(dst), imm),
            Instr::Str { base, offset, src } => {
                write!(out, "STR [{}{offset:+}], {}", r(base), r(src))
            }
            Instr::Ldr { dst, base, offset } => {
                write!(out, "LDR {}, [{}{offset:+}]", r(dst), r(base))
            }
            Instr::Cmp { lhs, rhs } => write!(out, "CMP {}, {}", r(lhs), r(rhs)),
            Instr::Cset { dst, cond } => write!(out, "CSET {}, {cond}", r(dst)),
            Instr::Jmp { disp } => write!(out, "JMP {disp:+}"),
            Instr::Jmpc { cond, disp } => write!(out, "JMPC {cond}, {disp:+}"),
        }
    }
}

// =============================================================================
// Dump
// =============================================================================

impl Bytecode {
    /// Disassemble into `out`, marking the instruction at byte offset
    /// `mark` with an arrow.
    pub fn dump_into(&self, out: &mut dyn fmt::Write, mark: Option<u32>) -> fmt::Result {
        let machine = *self.machine();
        writeln!(
            out,
            "bytecode for {} ({} bytes, frame {})",
            machine.name(),
            self.len(),
            self.frame_size()
        )?;

        let bytes = self.bytes();
        let mut offset = 0usize;
        while offset < bytes.len() {
            let arrow = if mark == Some(offset as u32) { "==>" } else { "   " };
            write!(out, "{arrow}{offset:5}: ")?;

            match Instr::decode(&machine, &bytes[offset..]) {
                Some((instr, len)) => {
                    instr.write(&machine, out)?;
                    if let Some(text) = self.comment(offset as u32) {
                        write!(out, "    ; {text}")?;
                    }
                    writeln!(out)?;
                    offset += len;
                }
                None => {
                    writeln!(out, "??? {:#04x}", bytes[offset])?;
                    offset += 1;
                }
            }
        }
        Ok(())
    }

    /// Disassemble to stderr.
    pub fn dump(&self, mark: Option<u32>) {
        let mut text = String::new();
        let _ = self.dump_into(&mut text, mark);
        eprint!("{text}");
    }
}

// =============================================================================
// Tests
// =============================================================================
