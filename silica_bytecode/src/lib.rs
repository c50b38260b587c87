//! Bytecode for a small virtual register machine.
//!
//! The machine is an interpretable, testable lowering target: a fixed
//! register file, byte-addressed frame memory and a compact variable
//! length encoding. This crate provides:
//! - Target descriptors (`machine`)
//! - The assembler with labels and forward-reference patching (`asm`)
//! - A byte-accurate decoder and disassembly dumps (`dump`)
//! - A reference interpreter used as the executable model (`interp`)

pub mod asm;
pub mod dump;
pub mod interp;
pub mod machine;

pub use asm::{r, Assembler, Bytecode, Cond, Label, Opcode, Register};
pub use dump::Instr;
pub use interp::Interpreter;
pub use machine::{InterpMachine, Machine};
