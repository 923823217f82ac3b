// This module implements the encoding-step machinery behind every x86 instruction the
// back end emits. A Template is a mnemonic name plus a static slice of Steps; encoding
// runs the steps twice. The first pass ORs together each step's REX contribution (W for
// wide forms, R for a register in the ModRM reg field, X for an extended index, B for an
// extended base or rm register, plus a forced empty REX for the byte registers spl, bpl,
// sil and dil). The second pass emits bytes. Register and condition steps do not emit on
// their own: they accumulate into an "or-byte" that the next byte literal or ModRM step
// absorbs, which is how `B8+r`, `0F 80+cc` and ModRM reg fields are all expressed with
// the same step. Stack steps address [ebp+disp] with an 8- or 32-bit displacement,
// memory steps handle the forced-SIB (base low bits 100) and forced-disp8 (base low bits
// 101) cases, and absolute steps use mod=00 rm=101 on x86-32 and the SIB no-base form on
// x86-64. Immediates are little-endian two's complement in 1, 2, 4 or 8 bytes.

//! Template-driven x86 instruction encoding.

use byteorder::{LittleEndian, WriteBytesExt};
use log::trace;

use crate::core::error::EncodingError;
use crate::core::location::{Location, Reg, Target};

use super::Cond;

const REX_W: u8 = 8;
const REX_R: u8 = 4;
const REX_X: u8 = 2;
const REX_B: u8 = 1;

/// Width of an immediate field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmWidth {
    /// 1 byte.
    B,
    /// 2 bytes.
    H,
    /// 4 bytes.
    I,
    /// 8 bytes, x86-64 only.
    Q,
}

impl ImmWidth {
    pub const fn bytes(self) -> u8 {
        match self {
            ImmWidth::B => 1,
            ImmWidth::H => 2,
            ImmWidth::I => 4,
            ImmWidth::Q => 8,
        }
    }
}

/// Which ModRM field a register step fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Bits 0-2, extended by REX.B. Also used for `op+r` opcodes.
    Rm,
    /// Bits 3-5, extended by REX.R.
    Reg,
}

impl Field {
    const fn shift(self) -> u8 {
        match self {
            Field::Rm => 0,
            Field::Reg => 3,
        }
    }

    const fn rex_bit(self) -> u8 {
        match self {
            Field::Rm => REX_B,
            Field::Reg => REX_R,
        }
    }
}

/// One encoding step. `arg` indexes the operand list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// REX prefix slot. Emits nothing on x86-32 or when no bit is needed.
    Rex { wide: bool },
    /// Byte literal, ORed with the pending or-byte.
    Byte(u8),
    /// Opcode extension `/digit` in the ModRM reg field.
    Ext(u8),
    /// Register operand packed into the or-byte.
    Reg { arg: usize, field: Field },
    /// Like `Reg`, for an 8-bit register operand.
    ByteReg { arg: usize, field: Field },
    /// Condition code of the instruction, packed into the or-byte.
    Cond,
    Imm { arg: usize, width: ImmWidth },
    /// ModRM for `[ebp + disp]`.
    Stack { arg: usize },
    /// ModRM (+SIB) for `[base + index*scale + disp]`.
    Mem { arg: usize },
    /// ModRM (+SIB) for an absolute 32-bit address.
    Abs { arg: usize },
}

/// A statically defined instruction encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    pub name: &'static str,
    pub steps: &'static [Step],
}

impl Template {
    pub const fn new(name: &'static str, steps: &'static [Step]) -> Self {
        Self { name, steps }
    }

    /// Number of operands the template consumes.
    pub fn arity(&self) -> usize {
        self.steps
            .iter()
            .filter_map(|step| match *step {
                Step::Reg { arg, .. }
                | Step::ByteReg { arg, .. }
                | Step::Imm { arg, .. }
                | Step::Stack { arg }
                | Step::Mem { arg }
                | Step::Abs { arg } => Some(arg + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Encode with `args` and append the bytes to `out`. Nothing is appended
    /// on error.
    pub fn encode(
        &self,
        target: Target,
        cond: Option<Cond>,
        args: &[Location],
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        if args.len() != self.arity() {
            return Err(EncodingError::NoEncoding {
                mnemonic: self.name,
                operands: operand_codes(args),
            });
        }

        let rex = self.rex(target, args)?;
        let start = out.len();
        if let Err(e) = self.emit(target, cond, args, rex, out) {
            out.truncate(start);
            return Err(e);
        }
        trace!("{}: {:02x?}", self.name, &out[start..]);
        Ok(())
    }

    /// First pass: the REX byte, or `None` when no prefix is needed.
    fn rex(&self, target: Target, args: &[Location]) -> Result<Option<u8>, EncodingError> {
        if !target.is_64() {
            return Ok(None);
        }
        let mut bits = 0u8;
        let mut force = false;
        for step in self.steps {
            match *step {
                Step::Rex { wide: true } => bits |= REX_W,
                Step::Reg { arg, field } => {
                    if self.reg(args, arg)?.is_extended() {
                        bits |= field.rex_bit();
                    }
                }
                Step::ByteReg { arg, field } => {
                    let reg = self.reg(args, arg)?;
                    if reg.is_extended() {
                        bits |= field.rex_bit();
                    } else if reg.num >= 4 {
                        force = true;
                    }
                }
                Step::Mem { arg } => {
                    if let Location::Memory(m) = self.arg(args, arg)? {
                        if m.base.is_extended() {
                            bits |= REX_B;
                        }
                        if m.index.is_some_and(|i| i.is_extended()) {
                            bits |= REX_X;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok((bits != 0 || force).then_some(0x40 | bits))
    }

    /// Second pass: the bytes themselves.
    fn emit(
        &self,
        target: Target,
        cond: Option<Cond>,
        args: &[Location],
        rex: Option<u8>,
        out: &mut Vec<u8>,
    ) -> Result<(), EncodingError> {
        let mut orbyte = 0u8;
        for step in self.steps {
            match *step {
                Step::Rex { .. } => {
                    if let Some(rex) = rex {
                        out.push(rex);
                    }
                }
                Step::Byte(b) => {
                    out.push(b | orbyte);
                    orbyte = 0;
                }
                Step::Ext(digit) => orbyte |= digit << 3,
                Step::Reg { arg, field } => {
                    orbyte |= self.reg(args, arg)?.low_bits() << field.shift();
                }
                Step::ByteReg { arg, field } => {
                    let reg = self.reg(args, arg)?;
                    if !target.is_64() && reg.num >= 4 {
                        return Err(EncodingError::NoByteRegister { reg, target });
                    }
                    orbyte |= reg.low_bits() << field.shift();
                }
                Step::Cond => {
                    let cc = cond.ok_or(EncodingError::NoEncoding {
                        mnemonic: self.name,
                        operands: operand_codes(args),
                    })?;
                    orbyte |= cc as u8;
                }
                Step::Imm { arg, width } => {
                    let value = match self.arg(args, arg)? {
                        Location::Immediate(v) => v,
                        other => return Err(self.mismatch(arg, "immediate", other)),
                    };
                    write_imm(out, target, value, width)?;
                }
                Step::Stack { arg } => {
                    let offset = match self.arg(args, arg)? {
                        Location::StackSlot(s) => s.offset,
                        other => return Err(self.mismatch(arg, "stack slot", other)),
                    };
                    encode_stack(out, offset, orbyte);
                    orbyte = 0;
                }
                Step::Mem { arg } => {
                    let m = match self.arg(args, arg)? {
                        Location::Memory(m) => m,
                        other => return Err(self.mismatch(arg, "memory operand", other)),
                    };
                    match m.index {
                        None => encode_mem_base(out, m.base, m.offset, orbyte),
                        Some(index) => {
                            if index.num == 4 {
                                return Err(EncodingError::InvalidIndexRegister { reg: index });
                            }
                            encode_mem_indexed(out, m.base, index, m.scale_shift, m.offset, orbyte)
                        }
                    }
                    orbyte = 0;
                }
                Step::Abs { arg } => {
                    let addr = match self.arg(args, arg)? {
                        Location::Absolute(a) => a,
                        other => return Err(self.mismatch(arg, "absolute address", other)),
                    };
                    encode_absolute(out, target, addr, orbyte)?;
                    orbyte = 0;
                }
            }
        }
        debug_assert_eq!(orbyte, 0, "{}: dangling or-byte", self.name);
        Ok(())
    }

    fn arg(&self, args: &[Location], index: usize) -> Result<Location, EncodingError> {
        args.get(index).copied().ok_or(EncodingError::NoEncoding {
            mnemonic: self.name,
            operands: operand_codes(args),
        })
    }

    fn reg(&self, args: &[Location], index: usize) -> Result<Reg, EncodingError> {
        match self.arg(args, index)? {
            Location::Register(r) => Ok(r),
            other => Err(self.mismatch(index, "register", other)),
        }
    }

    fn mismatch(&self, index: usize, expected: &'static str, actual: Location) -> EncodingError {
        EncodingError::OperandMismatch {
            template: self.name,
            index,
            expected,
            actual: actual.to_string(),
        }
    }
}

/// Location codes of `args`, comma separated, for diagnostics.
pub fn operand_codes(args: &[Location]) -> String {
    args.iter()
        .map(|a| a.code().as_char().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub const fn fits_i8(value: i64) -> bool {
    value >= i8::MIN as i64 && value <= i8::MAX as i64
}

pub const fn fits_i32(value: i64) -> bool {
    value >= i32::MIN as i64 && value <= i32::MAX as i64
}

fn write_imm(out: &mut Vec<u8>, target: Target, value: i64, width: ImmWidth) -> Result<(), EncodingError> {
    let out_of_range = || EncodingError::ImmediateOutOfRange {
        value,
        width: width.bytes(),
    };
    // Writing into a Vec cannot fail.
    let _ = match width {
        ImmWidth::B => {
            if !(-128..=255).contains(&value) {
                return Err(out_of_range());
            }
            out.write_u8(value as u8)
        }
        ImmWidth::H => {
            if !(-32768..=65535).contains(&value) {
                return Err(out_of_range());
            }
            out.write_u16::<LittleEndian>(value as u16)
        }
        ImmWidth::I => {
            // x86-32 also accepts unsigned 32-bit values, x86-64 sign-extends.
            let fits = fits_i32(value) || (!target.is_64() && (0..=u32::MAX as i64).contains(&value));
            if !fits {
                return Err(out_of_range());
            }
            out.write_u32::<LittleEndian>(value as u32)
        }
        ImmWidth::Q => {
            if !target.is_64() {
                return Err(out_of_range());
            }
            out.write_i64::<LittleEndian>(value)
        }
    };
    Ok(())
}

fn write_disp32(out: &mut Vec<u8>, disp: i32) {
    let _ = out.write_i32::<LittleEndian>(disp);
}

/// `[ebp + offset]`, picking the short displacement when it fits.
fn encode_stack(out: &mut Vec<u8>, offset: i32, orbyte: u8) {
    const EBP: u8 = 5;
    if fits_i8(offset as i64) {
        out.push(0x40 | orbyte | EBP);
        out.push(offset as i8 as u8);
    } else {
        out.push(0x80 | orbyte | EBP);
        write_disp32(out, offset);
    }
}

/// `[base + offset]`. Base low bits 100 need a SIB byte, base low bits 101
/// cannot use the no-displacement form.
fn encode_mem_base(out: &mut Vec<u8>, base: Reg, offset: i32, orbyte: u8) {
    let rm = base.low_bits();
    let sib = (rm == 4).then_some(0x24u8);
    let no_offset = offset == 0 && rm != 5;
    let (mode, disp8) = if no_offset {
        (0x00, false)
    } else if fits_i8(offset as i64) {
        (0x40, true)
    } else {
        (0x80, false)
    };
    out.push(mode | orbyte | rm);
    if let Some(sib) = sib {
        out.push(sib);
    }
    if no_offset {
        return;
    }
    if disp8 {
        out.push(offset as i8 as u8);
    } else {
        write_disp32(out, offset);
    }
}

/// `[base + index << shift + offset]`. Base low bits 101 force a displacement.
fn encode_mem_indexed(out: &mut Vec<u8>, base: Reg, index: Reg, shift: u8, offset: i32, orbyte: u8) {
    let sib = (shift << 6) | (index.low_bits() << 3) | base.low_bits();
    let no_offset = offset == 0 && base.low_bits() != 5;
    if no_offset {
        out.push(0x04 | orbyte);
        out.push(sib);
    } else if fits_i8(offset as i64) {
        out.push(0x44 | orbyte);
        out.push(sib);
        out.push(offset as i8 as u8);
    } else {
        out.push(0x84 | orbyte);
        out.push(sib);
        write_disp32(out, offset);
    }
}

/// Absolute `[disp32]`. x86-64 needs the SIB no-base form because
/// mod=00 rm=101 means rip-relative there.
fn encode_absolute(out: &mut Vec<u8>, target: Target, addr: u64, orbyte: u8) -> Result<(), EncodingError> {
    if target.is_64() {
        let disp = addr as i64;
        if !fits_i32(disp) {
            return Err(EncodingError::DisplacementOutOfRange { value: disp });
        }
        out.push(0x04 | orbyte);
        out.push(0x25);
        write_disp32(out, disp as i32);
    } else {
        let disp = u32::try_from(addr).map_err(|_| EncodingError::DisplacementOutOfRange { value: addr as i64 })?;
        out.push(0x05 | orbyte);
        let _ = out.write_u32::<LittleEndian>(disp);
    }
    Ok(())
}
