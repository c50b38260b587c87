//! x86-64 physical registers and the per-compilation register file.
//!
//! The descriptor table is static: encoding, rendering and role flags for
//! each register under the System V ABI. Ownership is not: a
//! [`RegisterFile`] tracks which VCODE register currently occupies each
//! physical register and is owned by exactly one compilation at a time.

use silica_vcode::RegId;
use std::fmt;

// =============================================================================
// General-Purpose Registers
// =============================================================================

/// x86-64 general-purpose register with its hardware encoding.
///
/// Bits 0-2 go into ModR/M, bit 3 into the REX prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// Hardware encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Bits 0-2 for ModR/M.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Bit 3 for the REX prefix.
    #[inline(always)]
    pub const fn high_bit(self) -> bool {
        self.encoding() >= 8
    }

    /// Register name for dumps.
    pub const fn name(self) -> &'static str {
        match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Role Flags
// =============================================================================

/// Never owned by the planner; reserved for the stack frame or as emitter
/// scratch.
pub const REG_SCRATCH: u8 = 1 << 0;
/// Holds function results under the ABI.
pub const REG_RESULT: u8 = 1 << 1;
/// Callee-saved; using it costs a prologue spill.
pub const REG_CALLEE_SAVE: u8 = 1 << 2;

/// Static description of one physical register.
#[derive(Debug, Clone, Copy)]
pub struct MachRegDesc {
    pub reg: Gpr,
    pub flags: u8,
    /// Position in the integer argument sequence, if any.
    pub arg_index: Option<u8>,
}

/// The System V x86-64 register table, in encoding order.
///
/// RSP/RBP anchor the frame; R10/R11 are the emitter's scratch pair.
pub const MACH_REGS: [MachRegDesc; 16] = [
    MachRegDesc { reg: Gpr::Rax, flags: REG_RESULT, arg_index: None },
    MachRegDesc { reg: Gpr::Rcx, flags: 0, arg_index: Some(3) },
    MachRegDesc { reg: Gpr::Rdx, flags: 0, arg_index: Some(2) },
    MachRegDesc { reg: Gpr::Rbx, flags: REG_CALLEE_SAVE, arg_index: None },
    MachRegDesc { reg: Gpr::Rsp, flags: REG_SCRATCH, arg_index: None },
    MachRegDesc { reg: Gpr::Rbp, flags: REG_SCRATCH, arg_index: None },
    MachRegDesc { reg: Gpr::Rsi, flags: 0, arg_index: Some(1) },
    MachRegDesc { reg: Gpr::Rdi, flags: 0, arg_index: Some(0) },
    MachRegDesc { reg: Gpr::R8, flags: 0, arg_index: Some(4) },
    MachRegDesc { reg: Gpr::R9, flags: 0, arg_index: Some(5) },
    MachRegDesc { reg: Gpr::R10, flags: REG_SCRATCH, arg_index: None },
    MachRegDesc { reg: Gpr::R11, flags: REG_SCRATCH, arg_index: None },
    MachRegDesc { reg: Gpr::R12, flags: REG_CALLEE_SAVE, arg_index: None },
    MachRegDesc { reg: Gpr::R13, flags: REG_CALLEE_SAVE, arg_index: None },
    MachRegDesc { reg: Gpr::R14, flags: REG_CALLEE_SAVE, arg_index: None },
    MachRegDesc { reg: Gpr::R15, flags: REG_CALLEE_SAVE, arg_index: None },
];

/// Scratch registers the emitter may clobber between ops.
pub const SCRATCH0: Gpr = Gpr::R10;
pub const SCRATCH1: Gpr = Gpr::R11;

/// The `index`th integer argument register, if the ABI has that many.
pub fn arg_reg(index: usize) -> Option<Gpr> {
    MACH_REGS
        .iter()
        .find(|desc| desc.arg_index == Some(index as u8))
        .map(|desc| desc.reg)
}

// =============================================================================
// Register File
// =============================================================================

/// Mutable ownership state of the physical registers during one
/// compilation.
#[derive(Debug)]
pub struct RegisterFile {
    usage: [Option<RegId>; 16],
    used_callee_save: u16,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    /// A file with every register unowned.
    pub fn new() -> Self {
        RegisterFile {
            usage: [None; 16],
            used_callee_save: 0,
        }
    }

    /// Clear all ownership (start of a unit compilation).
    pub fn reset(&mut self) {
        self.usage = [None; 16];
        self.used_callee_save = 0;
    }

    /// The VCODE register currently resident in `reg`.
    #[inline]
    pub fn usage(&self, reg: Gpr) -> Option<RegId> {
        self.usage[reg.encoding() as usize]
    }

    /// Hand `reg` to `vreg`. Remembers callee-save use for the prologue.
    pub fn assign(&mut self, reg: Gpr, vreg: RegId) {
        self.usage[reg.encoding() as usize] = Some(vreg);
        if MACH_REGS[reg.encoding() as usize].flags & REG_CALLEE_SAVE != 0 {
            self.used_callee_save |= 1 << reg.encoding();
        }
    }

    /// Evict whatever occupies `reg`.
    pub fn release(&mut self, reg: Gpr) {
        self.usage[reg.encoding() as usize] = None;
    }

    /// Callee-save registers that were ever assigned, in encoding order.
    /// These must be spilled by the prologue and restored on return.
    pub fn used_callee_saves(&self) -> impl Iterator<Item = Gpr> + '_ {
        MACH_REGS
            .iter()
            .filter(move |desc| self.used_callee_save & (1 << desc.reg.encoding()) != 0)
            .map(|desc| desc.reg)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_bits() {
        assert_eq!(Gpr::Rax.encoding(), 0);
        assert_eq!(Gpr::R8.low_bits(), 0);
        assert!(Gpr::R8.high_bit());
        assert!(!Gpr::Rdi.high_bit());
        assert_eq!(Gpr::R15.low_bits(), 7);
    }

    #[test]
    fn test_sysv_argument_order() {
        let args: Vec<_> = (0..6).map(|i| arg_reg(i).unwrap()).collect();
        assert_eq!(
            args,
            [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9]
        );
        assert_eq!(arg_reg(6), None);
    }

    #[test]
    fn test_table_roles() {
        let rax = &MACH_REGS[Gpr::Rax.encoding() as usize];
        assert!(rax.flags & REG_RESULT != 0);

        for scratch in [Gpr::Rsp, Gpr::Rbp, SCRATCH0, SCRATCH1] {
            let desc = &MACH_REGS[scratch.encoding() as usize];
            assert!(desc.flags & REG_SCRATCH != 0, "{scratch} must be scratch");
        }

        for saved in [Gpr::Rbx, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15] {
            let desc = &MACH_REGS[saved.encoding() as usize];
            assert!(desc.flags & REG_CALLEE_SAVE != 0);
        }
    }

    #[test]
    fn test_file_ownership_and_callee_save_tracking() {
        let mut file = RegisterFile::new();
        assert_eq!(file.usage(Gpr::Rax), None);

        file.assign(Gpr::Rax, RegId(3));
        file.assign(Gpr::R12, RegId(4));
        assert_eq!(file.usage(Gpr::Rax), Some(RegId(3)));

        let saves: Vec<_> = file.used_callee_saves().collect();
        assert_eq!(saves, vec![Gpr::R12]);

        file.release(Gpr::Rax);
        assert_eq!(file.usage(Gpr::Rax), None);
        // A released callee-save still needs its prologue spill.
        file.release(Gpr::R12);
        assert_eq!(file.used_callee_saves().count(), 1);

        file.reset();
        assert_eq!(file.used_callee_saves().count(), 0);
    }
}
