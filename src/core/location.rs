// This module defines the location model shared by every back-end stage: where an operand
// lives at a given program point. A Location is a register (general-purpose or xmm), a
// frame-pointer-relative stack slot, an immediate constant, a base/index/scale memory
// operand, or an absolute address. Each variant maps to a single-character location code
// that the encoder's form table dispatches on. Target selects the word size and how many
// general registers exist; validate() enforces that extended registers only appear on
// x86-64 and that stack slots are word aligned. Reg mirrors the hardware numbering, so the
// low three bits go into ModRM/SIB fields and bit 3 goes into REX.

//! Operand locations for the x86 back end.

use std::fmt;

use super::error::EncodingError;

/// Code generation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    X86_32,
    X86_64,
}

impl Target {
    /// Machine word size in bytes.
    pub const fn word_size(self) -> i32 {
        match self {
            Target::X86_32 => 4,
            Target::X86_64 => 8,
        }
    }

    /// Address width in bits, as understood by decoders.
    pub const fn bitness(self) -> u32 {
        match self {
            Target::X86_32 => 32,
            Target::X86_64 => 64,
        }
    }

    /// Number of addressable general-purpose (and xmm) registers.
    pub const fn register_count(self) -> u8 {
        match self {
            Target::X86_32 => 8,
            Target::X86_64 => 16,
        }
    }

    pub const fn is_64(self) -> bool {
        matches!(self, Target::X86_64)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::X86_32 => write!(f, "x86-32"),
            Target::X86_64 => write!(f, "x86-64"),
        }
    }
}

/// Register file a register belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegClass {
    Gpr,
    Xmm,
}

/// A hardware register, numbered as in the instruction encoding (0-15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg {
    pub num: u8,
    pub class: RegClass,
}

impl Reg {
    pub const fn gpr(num: u8) -> Self {
        Self { num, class: RegClass::Gpr }
    }

    pub const fn xmm(num: u8) -> Self {
        Self { num, class: RegClass::Xmm }
    }

    /// The three bits that go into a ModRM or SIB field.
    pub const fn low_bits(self) -> u8 {
        self.num & 7
    }

    /// Registers 8-15 need a REX extension bit.
    pub const fn is_extended(self) -> bool {
        self.num >= 8
    }

    pub const fn is_float(self) -> bool {
        matches!(self.class, RegClass::Xmm)
    }

    pub const fn is_gpr(self) -> bool {
        matches!(self.class, RegClass::Gpr)
    }

    pub fn validate(self, target: Target) -> Result<(), EncodingError> {
        if self.num >= target.register_count() {
            return Err(EncodingError::RegisterOutOfRange { reg: self, target });
        }
        Ok(())
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
        match self.class {
            RegClass::Xmm => write!(f, "xmm{}", self.num),
            RegClass::Gpr if self.num < 8 => f.write_str(NAMES[self.num as usize]),
            RegClass::Gpr => write!(f, "r{}", self.num),
        }
    }
}

/// Register constants in hardware order. The 32-bit names double as the
/// 64-bit registers with the same number.
pub mod regs {
    use super::Reg;

    pub const EAX: Reg = Reg::gpr(0);
    pub const ECX: Reg = Reg::gpr(1);
    pub const EDX: Reg = Reg::gpr(2);
    pub const EBX: Reg = Reg::gpr(3);
    pub const ESP: Reg = Reg::gpr(4);
    pub const EBP: Reg = Reg::gpr(5);
    pub const ESI: Reg = Reg::gpr(6);
    pub const EDI: Reg = Reg::gpr(7);

    pub const RAX: Reg = EAX;
    pub const RCX: Reg = ECX;
    pub const RDX: Reg = EDX;
    pub const RBX: Reg = EBX;
    pub const RSP: Reg = ESP;
    pub const RBP: Reg = EBP;
    pub const RSI: Reg = ESI;
    pub const RDI: Reg = EDI;
    pub const R8: Reg = Reg::gpr(8);
    pub const R9: Reg = Reg::gpr(9);
    pub const R10: Reg = Reg::gpr(10);
    pub const R11: Reg = Reg::gpr(11);
    pub const R12: Reg = Reg::gpr(12);
    pub const R13: Reg = Reg::gpr(13);
    pub const R14: Reg = Reg::gpr(14);
    pub const R15: Reg = Reg::gpr(15);

    pub const XMM0: Reg = Reg::xmm(0);
    pub const XMM1: Reg = Reg::xmm(1);
    pub const XMM2: Reg = Reg::xmm(2);
    pub const XMM3: Reg = Reg::xmm(3);
    pub const XMM4: Reg = Reg::xmm(4);
    pub const XMM5: Reg = Reg::xmm(5);
    pub const XMM6: Reg = Reg::xmm(6);
    pub const XMM7: Reg = Reg::xmm(7);
    pub const XMM8: Reg = Reg::xmm(8);
    pub const XMM15: Reg = Reg::xmm(15);

    /// Stack pointer, always register 4.
    pub const SP: Reg = ESP;
    /// Frame pointer, always register 5.
    pub const FP: Reg = EBP;
}

/// A frame-pointer-relative slot. `offset` is in bytes and word aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackSlot {
    pub offset: i32,
    pub width_words: u8,
}

impl StackSlot {
    pub const fn new(offset: i32, width_words: u8) -> Self {
        Self { offset, width_words }
    }

    /// The slot holding frame word `position` (0-based, growing downwards
    /// below the frame pointer).
    pub const fn at_position(position: i32, width_words: u8, target: Target) -> Self {
        let word = target.word_size();
        Self {
            offset: -word * (position + width_words as i32),
            width_words,
        }
    }
}

/// `[base + index*scale + offset]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemOperand {
    pub base: Reg,
    pub index: Option<Reg>,
    /// log2 of the scale factor (0..=3).
    pub scale_shift: u8,
    pub offset: i32,
}

impl MemOperand {
    pub const fn base_offset(base: Reg, offset: i32) -> Self {
        Self {
            base,
            index: None,
            scale_shift: 0,
            offset,
        }
    }

    /// `scale` must be 1, 2, 4 or 8.
    pub fn indexed(base: Reg, index: Reg, scale: u8, offset: i32) -> Result<Self, EncodingError> {
        let scale_shift = match scale {
            1 => 0,
            2 => 1,
            4 => 2,
            8 => 3,
            _ => return Err(EncodingError::InvalidScale(scale)),
        };
        Ok(Self {
            base,
            index: Some(index),
            scale_shift,
            offset,
        })
    }

    pub const fn scale(&self) -> u8 {
        1 << self.scale_shift
    }
}

/// Single-character code the encoder's form table dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocationCode {
    /// `r`: general register.
    Register,
    /// `b`: ebp-relative stack slot.
    Stack,
    /// `m`: base register plus displacement.
    Memory,
    /// `a`: base plus scaled index plus displacement.
    Indexed,
    /// `j`: absolute address.
    Absolute,
    /// `i`: immediate.
    Immediate,
    /// `x`: xmm register.
    Xmm,
}

impl LocationCode {
    pub const fn as_char(self) -> char {
        match self {
            LocationCode::Register => 'r',
            LocationCode::Stack => 'b',
            LocationCode::Memory => 'm',
            LocationCode::Indexed => 'a',
            LocationCode::Absolute => 'j',
            LocationCode::Immediate => 'i',
            LocationCode::Xmm => 'x',
        }
    }
}

impl fmt::Display for LocationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Where an operand lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Register(Reg),
    StackSlot(StackSlot),
    Immediate(i64),
    Memory(MemOperand),
    Absolute(u64),
}

impl Location {
    pub const fn reg(reg: Reg) -> Self {
        Location::Register(reg)
    }

    /// One-word stack slot at `offset` bytes from the frame pointer.
    pub const fn stack(offset: i32) -> Self {
        Location::StackSlot(StackSlot::new(offset, 1))
    }

    pub const fn imm(value: i64) -> Self {
        Location::Immediate(value)
    }

    pub const fn mem(base: Reg, offset: i32) -> Self {
        Location::Memory(MemOperand::base_offset(base, offset))
    }

    pub const fn code(&self) -> LocationCode {
        match self {
            Location::Register(r) if r.is_float() => LocationCode::Xmm,
            Location::Register(_) => LocationCode::Register,
            Location::StackSlot(_) => LocationCode::Stack,
            Location::Immediate(_) => LocationCode::Immediate,
            Location::Memory(m) if m.index.is_some() => LocationCode::Indexed,
            Location::Memory(_) => LocationCode::Memory,
            Location::Absolute(_) => LocationCode::Absolute,
        }
    }

    pub const fn as_reg(&self) -> Option<Reg> {
        match self {
            Location::Register(r) => Some(*r),
            _ => None,
        }
    }

    pub const fn is_reg(&self) -> bool {
        matches!(self, Location::Register(_))
    }

    pub const fn is_stack(&self) -> bool {
        matches!(self, Location::StackSlot(_))
    }

    pub const fn is_immediate(&self) -> bool {
        matches!(self, Location::Immediate(_))
    }

    /// True for every operand that addresses memory.
    pub const fn is_memory_reference(&self) -> bool {
        matches!(
            self,
            Location::StackSlot(_) | Location::Memory(_) | Location::Absolute(_)
        )
    }

    /// Registers this operand reads to form its value or address.
    pub fn registers(&self) -> impl Iterator<Item = Reg> {
        let (a, b) = match self {
            Location::Register(r) => (Some(*r), None),
            Location::StackSlot(_) => (Some(regs::FP), None),
            Location::Memory(m) => (Some(m.base), m.index),
            Location::Immediate(_) | Location::Absolute(_) => (None, None),
        };
        a.into_iter().chain(b)
    }

    /// Check the invariants every location must satisfy for `target`.
    pub fn validate(&self, target: Target) -> Result<(), EncodingError> {
        match self {
            Location::Register(r) => r.validate(target),
            Location::StackSlot(s) => {
                if s.offset % target.word_size() != 0 {
                    return Err(EncodingError::MisalignedStackSlot { offset: s.offset });
                }
                Ok(())
            }
            Location::Memory(m) => {
                if m.base.is_float() {
                    return Err(EncodingError::OperandMismatch {
                        template: "address",
                        index: 0,
                        expected: "general base register",
                        actual: m.base.to_string(),
                    });
                }
                m.base.validate(target)?;
                if let Some(index) = m.index {
                    index.validate(target)?;
                    if index.is_float() || index == regs::SP {
                        return Err(EncodingError::InvalidIndexRegister { reg: index });
                    }
                }
                Ok(())
            }
            Location::Absolute(addr) => {
                if !target.is_64() && *addr > u32::MAX as u64 {
                    return Err(EncodingError::DisplacementOutOfRange { value: *addr as i64 });
                }
                Ok(())
            }
            Location::Immediate(_) => Ok(()),
        }
    }
}

impl From<Reg> for Location {
    fn from(reg: Reg) -> Self {
        Location::Register(reg)
    }
}

impl From<StackSlot> for Location {
    fn from(slot: StackSlot) -> Self {
        Location::StackSlot(slot)
    }
}

impl From<MemOperand> for Location {
    fn from(mem: MemOperand) -> Self {
        Location::Memory(mem)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Register(r) => write!(f, "{r}"),
            Location::StackSlot(s) if s.width_words == 1 => write!(f, "stack{}", s.offset),
            Location::StackSlot(s) => write!(f, "stack{}x{}", s.offset, s.width_words),
            Location::Immediate(v) => write!(f, "${v}"),
            Location::Memory(m) => {
                write!(f, "[{}", m.base)?;
                if let Some(index) = m.index {
                    write!(f, "+{}*{}", index, m.scale())?;
                }
                if m.offset != 0 {
                    write!(f, "{:+}", m.offset)?;
                }
                write!(f, "]")
            }
            Location::Absolute(addr) => write!(f, "[{addr:#x}]"),
        }
    }
}
