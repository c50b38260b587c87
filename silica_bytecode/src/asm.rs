//! Bytecode assembler for the virtual register machine.
//!
//! Instructions are variable length: a one-byte opcode followed by
//! register bytes and little-endian two's-complement immediates. Ops with
//! an immediate operand come in a narrow form (`*B`, one sign-extended
//! byte) and a wide form (`*W`, four bytes); the assembler picks the
//! narrow form exactly when the signed value fits `[-128, 127]`.
//!
//! Jump displacements are signed 16-bit values relative to the byte after
//! the displacement. Forward references go through [`Label`]: the
//! assembler encodes a placeholder and records the patch site, and
//! binding the label resolves every pending site.

use crate::machine::Machine;
use smallvec::SmallVec;
use std::fmt;

#[cfg(debug_assertions)]
use rustc_hash::FxHashMap;

// =============================================================================
// Wire Format
// =============================================================================

/// Bytecode opcodes. The wire values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x00,
    Movw = 0x01,
    Ret = 0x02,
    Add = 0x03,
    Mov = 0x04,
    Addw = 0x05,
    Str = 0x06,
    Ldr = 0x07,
    Mul = 0x08,
    Cmp = 0x09,
    Cset = 0x0a,
    Jmp = 0x0b,
    // 0x0c and 0x0d are reserved
    Movb = 0x0e,
    Addb = 0x0f,
    Jmpc = 0x10,
    Sub = 0x11,
    Andb = 0x12,
    Andw = 0x13,
    Testb = 0x14,
    Testw = 0x15,
    Mulb = 0x16,
    Mulw = 0x17,
}

impl Opcode {
    /// Decode a wire byte.
    pub const fn from_u8(byte: u8) -> Option<Opcode> {
        match byte {
            0x00 => Some(Opcode::Nop),
            0x01 => Some(Opcode::Movw),
            0x02 => Some(Opcode::Ret),
            0x03 => Some(Opcode::Add),
            0x04 => Some(Opcode::Mov),
            0x05 => Some(Opcode::Addw),
            0x06 => Some(Opcode::Str),
            0x07 => Some(Opcode::Ldr),
            0x08 => Some(Opcode::Mul),
            0x09 => Some(Opcode::Cmp),
            0x0a => Some(Opcode::Cset),
            0x0b => Some(Opcode::Jmp),
            0x0e => Some(Opcode::Movb),
            0x0f => Some(Opcode::Addb),
            0x10 => Some(Opcode::Jmpc),
            0x11 => Some(Opcode::Sub),
            0x12 => Some(Opcode::Andb),
            0x13 => Some(Opcode::Andw),
            0x14 => Some(Opcode::Testb),
            0x15 => Some(Opcode::Testw),
            0x16 => Some(Opcode::Mulb),
            0x17 => Some(Opcode::Mulw),
            _ => None,
        }
    }
}

/// Condition codes. These are a bit set: `cset`/`jmpc` fire when any of
/// the requested bits is set in the flags register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cond(u8);

impl Cond {
    pub const Z: Cond = Cond(0x01);
    pub const NZ: Cond = Cond(0x02);
    pub const GT: Cond = Cond(0x04);
    pub const LT: Cond = Cond(0x08);
    pub const GE: Cond = Cond(0x10);
    pub const LE: Cond = Cond(0x20);
    pub const EQ: Cond = Cond::Z;
    pub const NE: Cond = Cond::NZ;

    /// Raw bit pattern.
    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Reconstruct from a wire byte.
    #[inline]
    pub const fn from_bits(bits: u8) -> Cond {
        Cond(bits & 0x3f)
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Cond::Z => write!(f, "Z"),
            Cond::NZ => write!(f, "NZ"),
            Cond::GT => write!(f, "GT"),
            Cond::LT => write!(f, "LT"),
            Cond::GE => write!(f, "GE"),
            Cond::LE => write!(f, "LE"),
            other => write!(f, "#{:#04x}", other.0),
        }
    }
}

/// A bytecode register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register(pub u8);

/// Shorthand constructor.
#[inline]
pub const fn r(num: u8) -> Register {
    Register(num)
}

// =============================================================================
// Labels
// =============================================================================

/// A jump target within one assembler.
///
/// A label may be bound exactly once. Jumps to an unbound label record
/// their displacement site here; binding resolves all of them. Dropping a
/// label that still has unresolved sites is a programming error.
#[derive(Debug, Default)]
pub struct Label {
    bound: Option<u32>,
    patches: SmallVec<[u32; 4]>,
}

impl Label {
    pub fn new() -> Self {
        Label::default()
    }

    /// Has this label been bound yet?
    #[inline]
    pub fn bound(&self) -> bool {
        self.bound.is_some()
    }

    /// Absolute byte offset of the bound target.
    ///
    /// # Panics
    /// Panics if the label is unbound.
    #[inline]
    pub fn target(&self) -> u32 {
        match self.bound {
            Some(target) => target,
            None => panic!("label is not bound"),
        }
    }
}

impl Drop for Label {
    fn drop(&mut self) {
        if !self.patches.is_empty() && !std::thread::panicking() {
            panic!(
                "label dropped with {} unresolved patch(es)",
                self.patches.len()
            );
        }
    }
}

// =============================================================================
// Assembler
// =============================================================================

/// Emits bytecode for one function of a [`Machine`].
pub struct Assembler {
    machine: Machine,
    bytes: Vec<u8>,
    frame_size: u32,
    #[cfg(debug_assertions)]
    comments: FxHashMap<u32, String>,
}

impl Assembler {
    pub fn new(machine: Machine) -> Self {
        Assembler {
            machine,
            bytes: Vec::new(),
            frame_size: 0,
            #[cfg(debug_assertions)]
            comments: FxHashMap::default(),
        }
    }

    /// The machine this assembler targets.
    #[inline]
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Bytes emitted so far.
    #[inline]
    pub fn code_size(&self) -> usize {
        self.bytes.len()
    }

    /// Stack frame size carried into the finished program.
    pub fn set_frame_size(&mut self, bytes: u32) {
        self.frame_size = bytes;
    }

    /// The machine's stack pointer register.
    #[inline]
    pub fn sp(&self) -> Register {
        Register(self.machine.sp_reg())
    }

    /// Attach a diagnostic note to the current write offset. Debug builds
    /// only; release builds discard the text.
    pub fn comment(&mut self, args: fmt::Arguments<'_>) {
        #[cfg(debug_assertions)]
        {
            use std::fmt::Write;
            let offset = self.bytes.len() as u32;
            let entry = self.comments.entry(offset).or_default();
            if !entry.is_empty() {
                entry.push_str("; ");
            }
            let _ = entry.write_fmt(args);
        }
        #[cfg(not(debug_assertions))]
        let _ = args;
    }

    // -------------------------------------------------------------------------
    // Instructions
    // -------------------------------------------------------------------------

    pub fn nop(&mut self) {
        self.emit_u8(Opcode::Nop as u8);
    }

    pub fn ret(&mut self) {
        self.emit_u8(Opcode::Ret as u8);
    }

    pub fn mov(&mut self, dst: Register, src: Register) {
        self.emit_u8(Opcode::Mov as u8);
        self.emit_reg(dst);
        self.emit_reg(src);
    }

    pub fn mov_imm(&mut self, dst: Register, value: i64) {
        self.imm_op(Opcode::Movb, Opcode::Movw, dst, value);
    }

    pub fn add(&mut self, dst: Register, src: Register) {
        self.emit_u8(Opcode::Add as u8);
        self.emit_reg(dst);
        self.emit_reg(src);
    }

    pub fn add_imm(&mut self, dst: Register, value: i64) {
        self.imm_op(Opcode::Addb, Opcode::Addw, dst, value);
    }

    pub fn sub(&mut self, dst: Register, src: Register) {
        self.emit_u8(Opcode::Sub as u8);
        self.emit_reg(dst);
        self.emit_reg(src);
    }

    pub fn mul(&mut self, dst: Register, src: Register) {
        self.emit_u8(Opcode::Mul as u8);
        self.emit_reg(dst);
        self.emit_reg(src);
    }

    pub fn mul_imm(&mut self, dst: Register, value: i64) {
        self.imm_op(Opcode::Mulb, Opcode::Mulw, dst, value);
    }

    pub fn andr(&mut self, dst: Register, value: i64) {
        self.imm_op(Opcode::Andb, Opcode::Andw, dst, value);
    }

    pub fn test(&mut self, dst: Register, value: i64) {
        self.imm_op(Opcode::Testb, Opcode::Testw, dst, value);
    }

    pub fn str_(&mut self, base: Register, offset: i16, src: Register) {
        self.emit_u8(Opcode::Str as u8);
        self.emit_reg(base);
        self.emit_i16(offset);
        self.emit_reg(src);
    }

    pub fn ldr(&mut self, dst: Register, base: Register, offset: i16) {
        self.emit_u8(Opcode::Ldr as u8);
        self.emit_reg(dst);
        self.emit_reg(base);
        self.emit_i16(offset);
    }

    pub fn cmp(&mut self, lhs: Register, rhs: Register) {
        self.emit_u8(Opcode::Cmp as u8);
        self.emit_reg(lhs);
        self.emit_reg(rhs);
    }

    pub fn cset(&mut self, dst: Register, cond: Cond) {
        self.emit_u8(Opcode::Cset as u8);
        self.emit_reg(dst);
        self.emit_u8(cond.bits());
    }

    pub fn jmp(&mut self, label: &mut Label) {
        self.emit_u8(Opcode::Jmp as u8);
        self.emit_branch(label);
    }

    pub fn jmpc(&mut self, label: &mut Label, cond: Cond) {
        self.emit_u8(Opcode::Jmpc as u8);
        self.emit_u8(cond.bits());
        self.emit_branch(label);
    }

    // -------------------------------------------------------------------------
    // Labels and patching
    // -------------------------------------------------------------------------

    /// Bind `label` to the current write offset and resolve every pending
    /// patch.
    ///
    /// # Panics
    /// Panics if the label was already bound.
    pub fn bind(&mut self, label: &mut Label) {
        assert!(!label.bound(), "label bound twice");
        let target = self.bytes.len() as u32;
        label.bound = Some(target);
        for site in label.patches.drain(..) {
            patch_branch(&mut self.bytes, site, target);
        }
    }

    /// Rewrite the displacement at `offset` to land on absolute offset
    /// `abs`.
    pub fn patch_branch(&mut self, offset: u32, abs: u32) {
        patch_branch(&mut self.bytes, offset, abs);
    }

    /// Move the emitted program out, resetting the assembler.
    pub fn finish(&mut self) -> Bytecode {
        Bytecode {
            bytes: std::mem::take(&mut self.bytes).into_boxed_slice(),
            frame_size: std::mem::take(&mut self.frame_size),
            machine: self.machine,
            #[cfg(debug_assertions)]
            comments: std::mem::take(&mut self.comments),
        }
    }

    // -------------------------------------------------------------------------
    // Encoding helpers
    // -------------------------------------------------------------------------

    fn imm_op(&mut self, narrow: Opcode, wide: Opcode, reg: Register, value: i64) {
        if let Ok(byte) = i8::try_from(value) {
            self.emit_u8(narrow as u8);
            self.emit_reg(reg);
            self.emit_u8(byte as u8);
        } else {
            let word = i32::try_from(value)
                .unwrap_or_else(|_| panic!("immediate {value} does not fit 32 bits"));
            self.emit_u8(wide as u8);
            self.emit_reg(reg);
            self.emit_i32(word);
        }
    }

    fn emit_branch(&mut self, label: &mut Label) {
        let site = self.bytes.len() as u32;
        match label.bound {
            Some(target) => {
                let disp = displacement(site, target);
                self.emit_i16(disp);
            }
            None => {
                label.patches.push(site);
                self.emit_i16(-1);
            }
        }
    }

    fn emit_reg(&mut self, reg: Register) {
        assert!(
            reg.0 < self.machine.num_regs(),
            "register R{} out of range for {}",
            reg.0,
            self.machine.name()
        );
        self.bytes.push(reg.0);
    }

    #[inline]
    fn emit_u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    #[inline]
    fn emit_i16(&mut self, value: i16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn emit_i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }
}

/// Signed displacement from the byte after the 16-bit slot at `site` to
/// `target`.
fn displacement(site: u32, target: u32) -> i16 {
    let disp = target as i64 - (site as i64 + 2);
    i16::try_from(disp).unwrap_or_else(|_| panic!("jump displacement {disp} exceeds 16 bits"))
}

fn patch_branch(bytes: &mut [u8], site: u32, target: u32) {
    let disp = displacement(site, target);
    bytes[site as usize..site as usize + 2].copy_from_slice(&disp.to_le_bytes());
}

// =============================================================================
// Bytecode
// =============================================================================

/// A finished, read-only bytecode program.
pub struct Bytecode {
    bytes: Box<[u8]>,
    frame_size: u32,
    machine: Machine,
    #[cfg(debug_assertions)]
    comments: FxHashMap<u32, String>,
}

impl Bytecode {
    /// The encoded instruction stream.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the instruction stream in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Is the program empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Stack frame size in bytes.
    #[inline]
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// The machine this program targets.
    #[inline]
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Diagnostic comment attached at `offset`, if any (debug builds).
    #[cfg(debug_assertions)]
    pub fn comment(&self, offset: u32) -> Option<&str> {
        self.comments.get(&offset).map(String::as_str)
    }

    #[cfg(not(debug_assertions))]
    pub fn comment(&self, _offset: u32) -> Option<&str> {
        None
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::InterpMachine;

    fn asm() -> Assembler {
        Assembler::new(InterpMachine::get())
    }

    #[test]
    fn test_mov_small_immediate_uses_byte_form() {
        let mut a = asm();
        a.mov_imm(r(3), 5);
        a.ret();
        assert_eq!(a.finish().bytes(), &[0x0e, 0x03, 0x05, 0x02]);
    }

    #[test]
    fn test_mov_large_immediate_uses_word_form() {
        let mut a = asm();
        a.mov_imm(r(0), 1000);
        a.ret();
        assert_eq!(
            a.finish().bytes(),
            &[0x01, 0x00, 0xe8, 0x03, 0x00, 0x00, 0x02]
        );
    }

    #[test]
    fn test_forward_jump_patches_to_bind_point() {
        let mut a = asm();
        let mut l = Label::new();
        a.jmp(&mut l);
        a.nop();
        a.bind(&mut l);
        a.ret();
        assert_eq!(a.finish().bytes(), &[0x0b, 0x01, 0x00, 0x00, 0x02]);
        assert_eq!(l.target(), 4);
    }

    #[test]
    fn test_conditional_jump_encoding() {
        let mut a = asm();
        let mut l = Label::new();
        a.cmp(r(0), r(1));
        a.jmpc(&mut l, Cond::EQ);
        a.nop();
        a.bind(&mut l);
        a.ret();
        assert_eq!(
            a.finish().bytes(),
            &[0x09, 0x00, 0x01, 0x10, 0x01, 0x01, 0x00, 0x00, 0x02]
        );
    }

    #[test]
    fn test_add_negative_byte_immediate() {
        let mut a = asm();
        a.add_imm(r(2), -1);
        assert_eq!(a.finish().bytes(), &[0x0f, 0x02, 0xff]);
    }

    #[test]
    fn test_store_load_pair() {
        let mut a = asm();
        let sp = a.sp();
        a.str_(sp, 8, r(0));
        a.ldr(r(1), sp, 8);
        assert_eq!(
            a.finish().bytes(),
            &[0x06, 0x1f, 0x08, 0x00, 0x00, 0x07, 0x01, 0x1f, 0x08, 0x00]
        );
    }

    #[test]
    fn test_width_selection_boundaries() {
        for value in [-128i64, 127] {
            let mut a = asm();
            a.add_imm(r(0), value);
            assert_eq!(a.finish().bytes()[0], Opcode::Addb as u8, "value {value}");
        }
        for value in [-129i64, 128] {
            let mut a = asm();
            a.add_imm(r(0), value);
            assert_eq!(a.finish().bytes()[0], Opcode::Addw as u8, "value {value}");
        }
    }

    #[test]
    fn test_backward_jump() {
        let mut a = asm();
        let mut top = Label::new();
        a.bind(&mut top);
        a.nop();
        a.jmp(&mut top);
        let code = a.finish();
        // Displacement from offset 4 back to offset 0.
        assert_eq!(code.bytes(), &[0x00, 0x0b, 0xfc, 0xff]);
    }

    #[test]
    fn test_multiple_patches_one_label() {
        let mut a = asm();
        let mut l = Label::new();
        a.jmp(&mut l);
        a.jmp(&mut l);
        a.bind(&mut l);
        a.ret();
        let code = a.finish();
        // First jump: target 6 from site 1 -> +3; second: from site 4 -> 0.
        assert_eq!(code.bytes(), &[0x0b, 0x03, 0x00, 0x0b, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_placeholder_overwritten_after_bind() {
        let mut a = asm();
        let mut l = Label::new();
        a.jmp(&mut l);
        assert_eq!(&a.bytes[1..3], &[0xff, 0xff]);
        a.bind(&mut l);
        let code = a.finish();
        assert_ne!(&code.bytes()[1..3], &[0xff, 0xff]);
    }

    #[test]
    #[should_panic(expected = "bound twice")]
    fn test_double_bind_panics() {
        let mut a = asm();
        let mut l = Label::new();
        a.bind(&mut l);
        a.bind(&mut l);
    }

    #[test]
    #[should_panic(expected = "unresolved patch")]
    fn test_dropping_unbound_label_with_patches_panics() {
        let mut a = asm();
        let mut l = Label::new();
        a.jmp(&mut l);
        drop(l);
    }

    #[test]
    fn test_finish_resets_assembler() {
        let mut a = asm();
        a.set_frame_size(16);
        a.nop();
        let first = a.finish();
        assert_eq!(first.len(), 1);
        assert_eq!(first.frame_size(), 16);
        assert_eq!(a.code_size(), 0);
        let second = a.finish();
        assert_eq!(second.len(), 0);
        assert_eq!(second.frame_size(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_comments_attach_to_offset() {
        let mut a = asm();
        a.nop();
        a.comment(format_args!("loop head"));
        a.nop();
        let code = a.finish();
        assert_eq!(code.comment(1), Some("loop head"));
        assert_eq!(code.comment(0), None);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_register_range_checked() {
        let mut a = asm();
        a.mov(r(32), r(0));
    }
}
