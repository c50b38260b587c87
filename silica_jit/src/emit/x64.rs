//! x86-64 instruction encoding.
//!
//! Small pure functions that return the byte sequence of one
//! instruction. Values are kept sign-extended in 64-bit registers, so
//! loads narrower than a word sign-extend and arithmetic runs at full
//! width; stores truncate to the operand size.

use crate::regs::Gpr;
use silica_vcode::VCmp;
use smallvec::SmallVec;

/// One encoded instruction.
pub type Bytes = SmallVec<[u8; 16]>;

// =============================================================================
// Prefix and ModR/M helpers
// =============================================================================

/// Encode a REX prefix.
#[inline]
pub const fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8)
}

/// Encode a ModR/M byte.
#[inline]
pub const fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
    (mod_ << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// x86 condition-code nibble for a VCODE predicate (signed compares).
pub const fn cc_of(cmp: VCmp) -> u8 {
    match cmp {
        VCmp::Eq => 0x4,
        VCmp::Ne => 0x5,
        VCmp::Lt => 0xc,
        VCmp::Ge => 0xd,
        VCmp::Le => 0xe,
        VCmp::Gt => 0xf,
    }
}

/// `Jcc`/`SETcc` nibble for "not equal"; used for truthiness tests.
pub const CC_NE: u8 = 0x5;
/// Nibble for "equal / zero".
pub const CC_E: u8 = 0x4;

/// Append a `[base + disp]` memory operand (ModR/M, optional SIB,
/// displacement) with `reg_field` in the reg slot.
fn mem(out: &mut Bytes, reg_field: u8, base: Gpr, disp: i32) {
    let rm = base.low_bits();
    // RSP-class bases need a SIB escape; RBP-class bases need an explicit
    // displacement even when zero.
    let need_sib = rm == 4;
    if disp == 0 && rm != 5 {
        out.push(modrm(0b00, reg_field, rm));
        if need_sib {
            out.push(0x24);
        }
    } else if (-128..=127).contains(&disp) {
        out.push(modrm(0b01, reg_field, rm));
        if need_sib {
            out.push(0x24);
        }
        out.push(disp as i8 as u8);
    } else {
        out.push(modrm(0b10, reg_field, rm));
        if need_sib {
            out.push(0x24);
        }
        out.extend_from_slice(&disp.to_le_bytes());
    }
}

// =============================================================================
// Moves
// =============================================================================

/// `mov dst, src` (64-bit).
pub fn mov_rr(dst: Gpr, src: Gpr) -> Bytes {
    let mut out = Bytes::new();
    out.push(rex(true, src.high_bit(), false, dst.high_bit()));
    out.push(0x89);
    out.push(modrm(0b11, src.low_bits(), dst.low_bits()));
    out
}

/// `mov dst, imm` choosing the shortest 64-bit-correct form.
pub fn mov_ri(dst: Gpr, imm: i64) -> Bytes {
    let mut out = Bytes::new();
    if let Ok(imm32) = i32::try_from(imm) {
        out.push(rex(true, false, false, dst.high_bit()));
        out.push(0xc7);
        out.push(modrm(0b11, 0, dst.low_bits()));
        out.extend_from_slice(&imm32.to_le_bytes());
    } else {
        out.push(rex(true, false, false, dst.high_bit()));
        out.push(0xb8 + dst.low_bits());
        out.extend_from_slice(&imm.to_le_bytes());
    }
    out
}

/// Sign-extending load of `size` bytes from `[base + disp]`.
pub fn load(dst: Gpr, base: Gpr, disp: i32, size: u32) -> Bytes {
    let mut out = Bytes::new();
    out.push(rex(true, dst.high_bit(), false, base.high_bit()));
    match size {
        8 => out.push(0x8b),
        4 => out.push(0x63), // movsxd
        2 => {
            out.push(0x0f);
            out.push(0xbf);
        }
        1 => {
            out.push(0x0f);
            out.push(0xbe);
        }
        other => panic!("unsupported load width {other}"),
    }
    mem(&mut out, dst.low_bits(), base, disp);
    out
}

/// Store the low `size` bytes of `src` to `[base + disp]`.
pub fn store(base: Gpr, disp: i32, src: Gpr, size: u32) -> Bytes {
    let mut out = Bytes::new();
    match size {
        8 => {
            out.push(rex(true, src.high_bit(), false, base.high_bit()));
            out.push(0x89);
        }
        4 => {
            if src.high_bit() || base.high_bit() {
                out.push(rex(false, src.high_bit(), false, base.high_bit()));
            }
            out.push(0x89);
        }
        2 => {
            out.push(0x66);
            if src.high_bit() || base.high_bit() {
                out.push(rex(false, src.high_bit(), false, base.high_bit()));
            }
            out.push(0x89);
        }
        1 => {
            // REX always, so SIL/DIL-class encodings mean the low byte.
            out.push(rex(false, src.high_bit(), false, base.high_bit()));
            out.push(0x88);
        }
        other => panic!("unsupported store width {other}"),
    }
    mem(&mut out, src.low_bits(), base, disp);
    out
}

/// Store an immediate to `[base + disp]` at the given width.
pub fn store_imm(base: Gpr, disp: i32, imm: i32, size: u32) -> Bytes {
    let mut out = Bytes::new();
    match size {
        8 => {
            out.push(rex(true, false, false, base.high_bit()));
            out.push(0xc7);
        }
        4 => {
            if base.high_bit() {
                out.push(rex(false, false, false, true));
            }
            out.push(0xc7);
        }
        2 => {
            out.push(0x66);
            if base.high_bit() {
                out.push(rex(false, false, false, true));
            }
            out.push(0xc7);
        }
        1 => {
            if base.high_bit() {
                out.push(rex(false, false, false, true));
            }
            out.push(0xc6);
        }
        other => panic!("unsupported store width {other}"),
    }
    mem(&mut out, 0, base, disp);
    match size {
        8 | 4 => out.extend_from_slice(&imm.to_le_bytes()),
        2 => out.extend_from_slice(&(imm as i16).to_le_bytes()),
        1 => out.push(imm as i8 as u8),
        _ => unreachable!(),
    }
    out
}

/// `lea dst, [base + disp]`.
pub fn lea(dst: Gpr, base: Gpr, disp: i32) -> Bytes {
    let mut out = Bytes::new();
    out.push(rex(true, dst.high_bit(), false, base.high_bit()));
    out.push(0x8d);
    mem(&mut out, dst.low_bits(), base, disp);
    out
}

// =============================================================================
// Arithmetic and compares
// =============================================================================

/// Extension field values for the `81/83` immediate group.
pub const ALU_ADD: u8 = 0;
pub const ALU_SUB: u8 = 5;
pub const ALU_CMP: u8 = 7;

/// `add dst, src` (64-bit).
pub fn add_rr(dst: Gpr, src: Gpr) -> Bytes {
    alu_rr(0x01, dst, src)
}

/// `sub dst, src` (64-bit).
pub fn sub_rr(dst: Gpr, src: Gpr) -> Bytes {
    alu_rr(0x29, dst, src)
}

/// `cmp lhs, rhs` (64-bit).
pub fn cmp_rr(lhs: Gpr, rhs: Gpr) -> Bytes {
    alu_rr(0x39, lhs, rhs)
}

fn alu_rr(opcode: u8, rm: Gpr, reg: Gpr) -> Bytes {
    let mut out = Bytes::new();
    out.push(rex(true, reg.high_bit(), false, rm.high_bit()));
    out.push(opcode);
    out.push(modrm(0b11, reg.low_bits(), rm.low_bits()));
    out
}

/// `add/sub/cmp dst, imm` via the shortest immediate group form.
pub fn alu_ri(ext: u8, dst: Gpr, imm: i32) -> Bytes {
    let mut out = Bytes::new();
    out.push(rex(true, false, false, dst.high_bit()));
    if let Ok(imm8) = i8::try_from(imm) {
        out.push(0x83);
        out.push(modrm(0b11, ext, dst.low_bits()));
        out.push(imm8 as u8);
    } else {
        out.push(0x81);
        out.push(modrm(0b11, ext, dst.low_bits()));
        out.extend_from_slice(&imm.to_le_bytes());
    }
    out
}

/// `imul dst, src` (64-bit).
pub fn imul_rr(dst: Gpr, src: Gpr) -> Bytes {
    let mut out = Bytes::new();
    out.push(rex(true, dst.high_bit(), false, src.high_bit()));
    out.push(0x0f);
    out.push(0xaf);
    out.push(modrm(0b11, dst.low_bits(), src.low_bits()));
    out
}

/// `imul dst, src, imm`.
pub fn imul_rri(dst: Gpr, src: Gpr, imm: i32) -> Bytes {
    let mut out = Bytes::new();
    out.push(rex(true, dst.high_bit(), false, src.high_bit()));
    if let Ok(imm8) = i8::try_from(imm) {
        out.push(0x6b);
        out.push(modrm(0b11, dst.low_bits(), src.low_bits()));
        out.push(imm8 as u8);
    } else {
        out.push(0x69);
        out.push(modrm(0b11, dst.low_bits(), src.low_bits()));
        out.extend_from_slice(&imm.to_le_bytes());
    }
    out
}

/// `neg dst` (64-bit).
pub fn neg(dst: Gpr) -> Bytes {
    let mut out = Bytes::new();
    out.push(rex(true, false, false, dst.high_bit()));
    out.push(0xf7);
    out.push(modrm(0b11, 3, dst.low_bits()));
    out
}

/// Compare `size`-wide memory at `[base + disp]` against a byte
/// immediate.
pub fn cmp_mem_imm8(base: Gpr, disp: i32, size: u32, imm: i8) -> Bytes {
    let mut out = Bytes::new();
    match size {
        8 => {
            out.push(rex(true, false, false, base.high_bit()));
            out.push(0x83);
        }
        4 => {
            if base.high_bit() {
                out.push(rex(false, false, false, true));
            }
            out.push(0x83);
        }
        2 => {
            out.push(0x66);
            if base.high_bit() {
                out.push(rex(false, false, false, true));
            }
            out.push(0x83);
        }
        1 => {
            if base.high_bit() {
                out.push(rex(false, false, false, true));
            }
            out.push(0x80);
        }
        other => panic!("unsupported compare width {other}"),
    }
    mem(&mut out, ALU_CMP, base, disp);
    out.push(imm as u8);
    out
}

// =============================================================================
// Conditionals
// =============================================================================

/// `setcc dst` followed by a zero-extension of the byte result.
pub fn setcc(cc: u8, dst: Gpr) -> Bytes {
    let mut out = Bytes::new();
    // REX so encodings 4-7 mean SPL/BPL/SIL/DIL rather than AH-DH.
    out.push(rex(false, false, false, dst.high_bit()));
    out.push(0x0f);
    out.push(0x90 + cc);
    out.push(modrm(0b11, 0, dst.low_bits()));
    // movzx dst, dst8
    out.push(rex(true, dst.high_bit(), false, dst.high_bit()));
    out.push(0x0f);
    out.push(0xb6);
    out.push(modrm(0b11, dst.low_bits(), dst.low_bits()));
    out
}

/// `cmovcc dst, src` (64-bit).
pub fn cmovcc(cc: u8, dst: Gpr, src: Gpr) -> Bytes {
    let mut out = Bytes::new();
    out.push(rex(true, dst.high_bit(), false, src.high_bit()));
    out.push(0x0f);
    out.push(0x40 + cc);
    out.push(modrm(0b11, dst.low_bits(), src.low_bits()));
    out
}

// =============================================================================
// Control flow
// =============================================================================

/// `jmp rel32` with a placeholder displacement. Returns the bytes and
/// the offset of the displacement within them.
pub fn jmp_rel32() -> (Bytes, usize) {
    let mut out = Bytes::new();
    out.push(0xe9);
    out.extend_from_slice(&[0; 4]);
    (out, 1)
}

/// `jcc rel32` with a placeholder displacement.
pub fn jcc_rel32(cc: u8) -> (Bytes, usize) {
    let mut out = Bytes::new();
    out.push(0x0f);
    out.push(0x80 + cc);
    out.extend_from_slice(&[0; 4]);
    (out, 2)
}

/// `push reg`.
pub fn push(reg: Gpr) -> Bytes {
    let mut out = Bytes::new();
    if reg.high_bit() {
        out.push(rex(false, false, false, true));
    }
    out.push(0x50 + reg.low_bits());
    out
}

/// `pop reg`.
pub fn pop(reg: Gpr) -> Bytes {
    let mut out = Bytes::new();
    if reg.high_bit() {
        out.push(rex(false, false, false, true));
    }
    out.push(0x58 + reg.low_bits());
    out
}

/// `leave` (restore RSP/RBP).
pub fn leave() -> Bytes {
    let mut out = Bytes::new();
    out.push(0xc9);
    out
}

/// `ret`.
pub fn ret() -> Bytes {
    let mut out = Bytes::new();
    out.push(0xc3);
    out
}

// =============================================================================
// Tests
// =============================================================================
