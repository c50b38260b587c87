//! Human-readable unit dumps.
//!
//! The renderer invites the client to annotate what it knows and the IR
//! does not: a JIT prints storage assignments next to registers and code
//! offsets next to ops. One op may be marked with an arrow, used by fatal
//! diagnostics to point at the offending instruction.

use crate::unit::{BlockId, Opcode, RegId, Unit, UnitKind};
use std::fmt;

/// Client hooks for dump annotations. All methods default to "nothing".
pub trait DumpAnnotator {
    /// Called after each register reference.
    fn annotate_reg(&mut self, _out: &mut dyn fmt::Write, _reg: RegId) -> fmt::Result {
        Ok(())
    }

    /// Called at the end of each op line.
    fn annotate_op(&mut self, _out: &mut dyn fmt::Write, _block: BlockId, _op: usize) -> fmt::Result {
        Ok(())
    }
}

/// Annotator that adds nothing.
pub struct NoAnnotations;

impl DumpAnnotator for NoAnnotations {}

impl Unit {
    /// Dump the unit to `out`, marking `mark` with an arrow if given.
    pub fn dump_with(
        &self,
        out: &mut dyn fmt::Write,
        mark: Option<(BlockId, usize)>,
        annot: &mut dyn DumpAnnotator,
    ) -> fmt::Result {
        let kind = match self.kind() {
            UnitKind::Function => "function",
            UnitKind::Process => "process",
        };
        writeln!(out, "{} {} (unit #{})", kind, self.name(), self.id().as_u64())?;

        for i in 0..self.count_vars() {
            writeln!(out, "  var v{} : {}", i, self.var_type(crate::VarId(i as u32)))?;
        }

        for b in 0..self.count_blocks() {
            let block = BlockId(b as u32);
            writeln!(out, "block {b}:")?;
            for j in 0..self.count_ops(block) {
                let arrow = if mark == Some((block, j)) { "==>" } else { "   " };
                write!(out, "{arrow}{j:3}: ")?;
                self.write_op(out, block, j, annot)?;
                annot.annotate_op(out, block, j)?;
                writeln!(out)?;
            }
        }
        Ok(())
    }

    /// Dump to stderr with no annotations.
    pub fn dump(&self) {
        let mut text = String::new();
        let _ = self.dump_with(&mut text, None, &mut NoAnnotations);
        eprint!("{text}");
    }

    fn write_op(
        &self,
        out: &mut dyn fmt::Write,
        block: BlockId,
        j: usize,
        annot: &mut dyn DumpAnnotator,
    ) -> fmt::Result {
        let mut reg = |out: &mut dyn fmt::Write, r: RegId| -> fmt::Result {
            write!(out, "{r}")?;
            annot.annotate_reg(out, r)
        };

        let opcode = self.get_op(block, j);
        if let Some(result) = self.get_result(block, j) {
            reg(out, result)?;
            write!(out, " := ")?;
        }

        match opcode {
            Opcode::Const => write!(out, "const {}", self.get_value(block, j))?,
            Opcode::Addi => {
                write!(out, "addi ")?;
                reg(out, self.get_arg(block, j, 0))?;
                write!(out, ", {}", self.get_value(block, j))?;
            }
            Opcode::Cmp => {
                write!(out, "cmp {} ", self.get_cmp(block, j).mnemonic())?;
                reg(out, self.get_arg(block, j, 0))?;
                write!(out, ", ")?;
                reg(out, self.get_arg(block, j, 1))?;
            }
            Opcode::Load => write!(out, "load v{}", self.get_address(block, j).0)?,
            Opcode::Store => {
                write!(out, "store ")?;
                reg(out, self.get_arg(block, j, 0))?;
                write!(out, ", v{}", self.get_address(block, j).0)?;
            }
            Opcode::Alloca => match self.get_type(block, j) {
                Some(ty) => write!(out, "alloca {ty}")?,
                None => write!(out, "alloca")?,
            },
            Opcode::Cast => {
                write!(out, "cast ")?;
                reg(out, self.get_arg(block, j, 0))?;
                if let Some(ty) = self.get_type(block, j) {
                    write!(out, " : {ty}")?;
                }
            }
            Opcode::Jump => write!(out, "jump block {}", self.get_target(block, j, 0).0)?,
            Opcode::Cond => {
                write!(out, "cond ")?;
                reg(out, self.get_arg(block, j, 0))?;
                write!(
                    out,
                    ", block {}, block {}",
                    self.get_target(block, j, 0).0,
                    self.get_target(block, j, 1).0
                )?;
            }
            Opcode::Comment => {
                write!(out, "; {}", self.get_comment(block, j).unwrap_or(""))?;
            }
            _ => {
                write!(out, "{}", opcode.mnemonic())?;
                for k in 0..self.count_args(block, j) {
                    write!(out, "{}", if k == 0 { " " } else { ", " })?;
                    reg(out, self.get_arg(block, j, k))?;
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
