// This module is the instruction form table. Every supported (mnemonic, operand code,
// operand code) combination is one arm of a single match in select(), which returns the
// static Template to encode with. Size-dependent choices are made in the same place:
// the ALU group and PUSH pick the sign-extended imm8 form when the immediate fits a byte,
// and MOV reg, imm picks `B8+r imm32` on x86-32, `REX.W C7 /0 imm32` on x86-64 when the
// value fits 32 bits and `REX.W B8+r imm64` otherwise. Combinations without an arm are an
// EncodingError, never a truncated encoding. Condition codes live on the mnemonic
// (Jcc/Setcc) and are folded into the opcode by the template's Cond step.

//! Mnemonics, condition codes and the (mnemonic, operands) → template table.

use std::fmt;

use log::trace;

use crate::core::error::EncodingError;
use crate::core::location::{Location, LocationCode, Target};

use super::template::{fits_i32, fits_i8, operand_codes, Field, ImmWidth, Step, Template};

/// x86 condition codes, numbered as in the `0F 80+cc` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    O = 0,
    NO = 1,
    B = 2,
    AE = 3,
    E = 4,
    NE = 5,
    BE = 6,
    A = 7,
    S = 8,
    NS = 9,
    P = 10,
    NP = 11,
    L = 12,
    GE = 13,
    LE = 14,
    G = 15,
}

impl Cond {
    pub const ALL: [Cond; 16] = [
        Cond::O,
        Cond::NO,
        Cond::B,
        Cond::AE,
        Cond::E,
        Cond::NE,
        Cond::BE,
        Cond::A,
        Cond::S,
        Cond::NS,
        Cond::P,
        Cond::NP,
        Cond::L,
        Cond::GE,
        Cond::LE,
        Cond::G,
    ];

    /// The condition that holds exactly when `self` does not.
    pub const fn negate(self) -> Cond {
        Cond::ALL[(self as u8 ^ 1) as usize]
    }

    /// AT&T suffix (`e` in `je`).
    pub const fn suffix(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::NO => "no",
            Cond::B => "b",
            Cond::AE => "ae",
            Cond::E => "e",
            Cond::NE => "ne",
            Cond::BE => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::NS => "ns",
            Cond::P => "p",
            Cond::NP => "np",
            Cond::L => "l",
            Cond::GE => "ge",
            Cond::LE => "le",
            Cond::G => "g",
        }
    }
}

/// Instructions the encoder knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mnemonic {
    Mov,
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
    Lea,
    Imul,
    Xchg,
    Neg,
    Not,
    Shl,
    Shr,
    Sar,
    Movzx8,
    Setcc(Cond),
    Push,
    Pop,
    Call,
    Jmp,
    Jcc(Cond),
    Ret,
    Nop,
    Movsd,
    Addsd,
    Subsd,
    Mulsd,
    Divsd,
    Ucomisd,
    Cvtsi2sd,
    Cvttsd2si,
}

impl Mnemonic {
    pub const fn condition(self) -> Option<Cond> {
        match self {
            Mnemonic::Setcc(cc) | Mnemonic::Jcc(cc) => Some(cc),
            _ => None,
        }
    }

    /// Lower-case base name, without condition or size suffix.
    pub const fn name(self) -> &'static str {
        match self {
            Mnemonic::Mov => "mov",
            Mnemonic::Add => "add",
            Mnemonic::Or => "or",
            Mnemonic::And => "and",
            Mnemonic::Sub => "sub",
            Mnemonic::Xor => "xor",
            Mnemonic::Cmp => "cmp",
            Mnemonic::Test => "test",
            Mnemonic::Lea => "lea",
            Mnemonic::Imul => "imul",
            Mnemonic::Xchg => "xchg",
            Mnemonic::Neg => "neg",
            Mnemonic::Not => "not",
            Mnemonic::Shl => "shl",
            Mnemonic::Shr => "shr",
            Mnemonic::Sar => "sar",
            Mnemonic::Movzx8 => "movzb",
            Mnemonic::Setcc(_) => "set",
            Mnemonic::Push => "push",
            Mnemonic::Pop => "pop",
            Mnemonic::Call => "call",
            Mnemonic::Jmp => "jmp",
            Mnemonic::Jcc(_) => "j",
            Mnemonic::Ret => "ret",
            Mnemonic::Nop => "nop",
            Mnemonic::Movsd => "movsd",
            Mnemonic::Addsd => "addsd",
            Mnemonic::Subsd => "subsd",
            Mnemonic::Mulsd => "mulsd",
            Mnemonic::Divsd => "divsd",
            Mnemonic::Ucomisd => "ucomisd",
            Mnemonic::Cvtsi2sd => "cvtsi2sd",
            Mnemonic::Cvttsd2si => "cvttsd2si",
        }
    }
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        if let Some(cc) = self.condition() {
            f.write_str(cc.suffix())?;
        }
        Ok(())
    }
}

use Field::{Reg as R, Rm as M};

const fn rex() -> Step {
    Step::Rex { wide: true }
}

const fn rex_nw() -> Step {
    Step::Rex { wide: false }
}

const fn reg(arg: usize, field: Field) -> Step {
    Step::Reg { arg, field }
}

const fn imm(arg: usize, width: ImmWidth) -> Step {
    Step::Imm { arg, width }
}

/// The common ModRM modes of one ALU group (`ADD`=0 ... `CMP`=7).
struct AluForms {
    rr: Template,
    ri8: Template,
    ri32: Template,
    rb: Template,
    br: Template,
    bi8: Template,
    bi32: Template,
    rm: Template,
    mr: Template,
    mi8: Template,
    mi32: Template,
    rj: Template,
    jr: Template,
}

macro_rules! alu_forms {
    ($name:ident, $mn:literal, $group:literal) => {
        const $name: AluForms = AluForms {
            rr: Template { name: concat!($mn, "_rr"), steps: &[rex(), Step::Byte($group * 8 + 1), reg(1, R), reg(0, M), Step::Byte(0xC0)] },
            ri8: Template { name: concat!($mn, "_ri8"), steps: &[rex(), Step::Byte(0x83), Step::Ext($group), reg(0, M), Step::Byte(0xC0), imm(1, ImmWidth::B)] },
            ri32: Template { name: concat!($mn, "_ri32"), steps: &[rex(), Step::Byte(0x81), Step::Ext($group), reg(0, M), Step::Byte(0xC0), imm(1, ImmWidth::I)] },
            rb: Template { name: concat!($mn, "_rb"), steps: &[rex(), Step::Byte($group * 8 + 3), reg(0, R), Step::Stack { arg: 1 }] },
            br: Template { name: concat!($mn, "_br"), steps: &[rex(), Step::Byte($group * 8 + 1), reg(1, R), Step::Stack { arg: 0 }] },
            bi8: Template { name: concat!($mn, "_bi8"), steps: &[rex(), Step::Byte(0x83), Step::Ext($group), Step::Stack { arg: 0 }, imm(1, ImmWidth::B)] },
            bi32: Template { name: concat!($mn, "_bi32"), steps: &[rex(), Step::Byte(0x81), Step::Ext($group), Step::Stack { arg: 0 }, imm(1, ImmWidth::I)] },
            rm: Template { name: concat!($mn, "_rm"), steps: &[rex(), Step::Byte($group * 8 + 3), reg(0, R), Step::Mem { arg: 1 }] },
            mr: Template { name: concat!($mn, "_mr"), steps: &[rex(), Step::Byte($group * 8 + 1), reg(1, R), Step::Mem { arg: 0 }] },
            mi8: Template { name: concat!($mn, "_mi8"), steps: &[rex(), Step::Byte(0x83), Step::Ext($group), Step::Mem { arg: 0 }, imm(1, ImmWidth::B)] },
            mi32: Template { name: concat!($mn, "_mi32"), steps: &[rex(), Step::Byte(0x81), Step::Ext($group), Step::Mem { arg: 0 }, imm(1, ImmWidth::I)] },
            rj: Template { name: concat!($mn, "_rj"), steps: &[rex(), Step::Byte($group * 8 + 3), reg(0, R), Step::Abs { arg: 1 }] },
            jr: Template { name: concat!($mn, "_jr"), steps: &[rex(), Step::Byte($group * 8 + 1), reg(1, R), Step::Abs { arg: 0 }] },
        };
    };
}

alu_forms!(ADD, "ADD", 0);
alu_forms!(OR, "OR", 1);
alu_forms!(AND, "AND", 4);
alu_forms!(SUB, "SUB", 5);
alu_forms!(XOR, "XOR", 6);
alu_forms!(CMP, "CMP", 7);

const MOV_RR: Template = Template { name: "MOV_rr", steps: &[rex(), Step::Byte(0x89), reg(1, R), reg(0, M), Step::Byte(0xC0)] };
const MOV_RI_SHORT: Template = Template { name: "MOV_ri32", steps: &[rex_nw(), reg(0, M), Step::Byte(0xB8), imm(1, ImmWidth::I)] };
const MOV_RI_SX: Template = Template { name: "MOV_ri32sx", steps: &[rex(), Step::Byte(0xC7), reg(0, M), Step::Byte(0xC0), imm(1, ImmWidth::I)] };
const MOV_RI64: Template = Template { name: "MOV_ri64", steps: &[rex(), reg(0, M), Step::Byte(0xB8), imm(1, ImmWidth::Q)] };
const MOV_RB: Template = Template { name: "MOV_rb", steps: &[rex(), Step::Byte(0x8B), reg(0, R), Step::Stack { arg: 1 }] };
const MOV_BR: Template = Template { name: "MOV_br", steps: &[rex(), Step::Byte(0x89), reg(1, R), Step::Stack { arg: 0 }] };
const MOV_BI: Template = Template { name: "MOV_bi", steps: &[rex(), Step::Byte(0xC7), Step::Stack { arg: 0 }, imm(1, ImmWidth::I)] };
const MOV_RM: Template = Template { name: "MOV_rm", steps: &[rex(), Step::Byte(0x8B), reg(0, R), Step::Mem { arg: 1 }] };
const MOV_MR: Template = Template { name: "MOV_mr", steps: &[rex(), Step::Byte(0x89), reg(1, R), Step::Mem { arg: 0 }] };
const MOV_MI: Template = Template { name: "MOV_mi", steps: &[rex(), Step::Byte(0xC7), Step::Mem { arg: 0 }, imm(1, ImmWidth::I)] };
const MOV_RJ: Template = Template { name: "MOV_rj", steps: &[rex(), Step::Byte(0x8B), reg(0, R), Step::Abs { arg: 1 }] };
const MOV_JR: Template = Template { name: "MOV_jr", steps: &[rex(), Step::Byte(0x89), reg(1, R), Step::Abs { arg: 0 }] };
const MOV_JI: Template = Template { name: "MOV_ji", steps: &[rex(), Step::Byte(0xC7), Step::Abs { arg: 0 }, imm(1, ImmWidth::I)] };

const TEST_RR: Template = Template { name: "TEST_rr", steps: &[rex(), Step::Byte(0x85), reg(1, R), reg(0, M), Step::Byte(0xC0)] };
const TEST_RI: Template = Template { name: "TEST_ri", steps: &[rex(), Step::Byte(0xF7), Step::Ext(0), reg(0, M), Step::Byte(0xC0), imm(1, ImmWidth::I)] };

const LEA_RB: Template = Template { name: "LEA_rb", steps: &[rex(), Step::Byte(0x8D), reg(0, R), Step::Stack { arg: 1 }] };
const LEA_RM: Template = Template { name: "LEA_rm", steps: &[rex(), Step::Byte(0x8D), reg(0, R), Step::Mem { arg: 1 }] };

const IMUL_RR: Template = Template { name: "IMUL_rr", steps: &[rex(), Step::Byte(0x0F), Step::Byte(0xAF), reg(0, R), reg(1, M), Step::Byte(0xC0)] };
const IMUL_RB: Template = Template { name: "IMUL_rb", steps: &[rex(), Step::Byte(0x0F), Step::Byte(0xAF), reg(0, R), Step::Stack { arg: 1 }] };

const XCHG_RR: Template = Template { name: "XCHG_rr", steps: &[rex(), Step::Byte(0x87), reg(1, R), reg(0, M), Step::Byte(0xC0)] };
const XCHG_RM: Template = Template { name: "XCHG_rm", steps: &[rex(), Step::Byte(0x87), reg(0, R), Step::Mem { arg: 1 }] };
const XCHG_MR: Template = Template { name: "XCHG_mr", steps: &[rex(), Step::Byte(0x87), reg(1, R), Step::Mem { arg: 0 }] };

const NEG_R: Template = Template { name: "NEG_r", steps: &[rex(), Step::Byte(0xF7), Step::Ext(3), reg(0, M), Step::Byte(0xC0)] };
const NOT_R: Template = Template { name: "NOT_r", steps: &[rex(), Step::Byte(0xF7), Step::Ext(2), reg(0, M), Step::Byte(0xC0)] };
const SHL_RI: Template = Template { name: "SHL_ri", steps: &[rex(), Step::Byte(0xC1), Step::Ext(4), reg(0, M), Step::Byte(0xC0), imm(1, ImmWidth::B)] };
const SHR_RI: Template = Template { name: "SHR_ri", steps: &[rex(), Step::Byte(0xC1), Step::Ext(5), reg(0, M), Step::Byte(0xC0), imm(1, ImmWidth::B)] };
const SAR_RI: Template = Template { name: "SAR_ri", steps: &[rex(), Step::Byte(0xC1), Step::Ext(7), reg(0, M), Step::Byte(0xC0), imm(1, ImmWidth::B)] };

const MOVZX8_RR: Template = Template { name: "MOVZX8_rr", steps: &[rex(), Step::Byte(0x0F), Step::Byte(0xB6), reg(0, R), Step::ByteReg { arg: 1, field: M }, Step::Byte(0xC0)] };
const SETCC_R: Template = Template { name: "SETcc_r", steps: &[rex_nw(), Step::Byte(0x0F), Step::Cond, Step::Byte(0x90), Step::ByteReg { arg: 0, field: M }, Step::Byte(0xC0)] };

const PUSH_R: Template = Template { name: "PUSH_r", steps: &[rex_nw(), reg(0, M), Step::Byte(0x50)] };
const PUSH_B: Template = Template { name: "PUSH_b", steps: &[rex_nw(), Step::Byte(0xFF), Step::Ext(6), Step::Stack { arg: 0 }] };
const PUSH_M: Template = Template { name: "PUSH_m", steps: &[rex_nw(), Step::Byte(0xFF), Step::Ext(6), Step::Mem { arg: 0 }] };
const PUSH_I8: Template = Template { name: "PUSH_i8", steps: &[Step::Byte(0x6A), imm(0, ImmWidth::B)] };
const PUSH_I32: Template = Template { name: "PUSH_i32", steps: &[Step::Byte(0x68), imm(0, ImmWidth::I)] };
const POP_R: Template = Template { name: "POP_r", steps: &[rex_nw(), reg(0, M), Step::Byte(0x58)] };
const POP_B: Template = Template { name: "POP_b", steps: &[rex_nw(), Step::Byte(0x8F), Step::Ext(0), Step::Stack { arg: 0 }] };
const POP_M: Template = Template { name: "POP_m", steps: &[rex_nw(), Step::Byte(0x8F), Step::Ext(0), Step::Mem { arg: 0 }] };

const CALL_R: Template = Template { name: "CALL_r", steps: &[rex_nw(), Step::Byte(0xFF), Step::Ext(2), reg(0, M), Step::Byte(0xC0)] };
const CALL_B: Template = Template { name: "CALL_b", steps: &[rex_nw(), Step::Byte(0xFF), Step::Ext(2), Step::Stack { arg: 0 }] };
const CALL_L: Template = Template { name: "CALL_l", steps: &[Step::Byte(0xE8), imm(0, ImmWidth::I)] };
const JMP_R: Template = Template { name: "JMP_r", steps: &[rex_nw(), Step::Byte(0xFF), Step::Ext(4), reg(0, M), Step::Byte(0xC0)] };
const JMP_L: Template = Template { name: "JMP_l", steps: &[Step::Byte(0xE9), imm(0, ImmWidth::I)] };
const JCC_L: Template = Template { name: "Jcc_l", steps: &[Step::Byte(0x0F), Step::Cond, Step::Byte(0x80), imm(0, ImmWidth::I)] };
const RET: Template = Template { name: "RET", steps: &[Step::Byte(0xC3)] };
const NOP: Template = Template { name: "NOP", steps: &[Step::Byte(0x90)] };

macro_rules! sse_forms {
    ($xx:ident, $xb:ident, $prefix:literal, $op:literal, $mn:literal) => {
        const $xx: Template = Template { name: concat!($mn, "_xx"), steps: &[Step::Byte($prefix), rex_nw(), Step::Byte(0x0F), Step::Byte($op), reg(0, R), reg(1, M), Step::Byte(0xC0)] };
        const $xb: Template = Template { name: concat!($mn, "_xb"), steps: &[Step::Byte($prefix), rex_nw(), Step::Byte(0x0F), Step::Byte($op), reg(0, R), Step::Stack { arg: 1 }] };
    };
}

sse_forms!(MOVSD_XX, MOVSD_XB, 0xF2, 0x10, "MOVSD");
sse_forms!(ADDSD_XX, ADDSD_XB, 0xF2, 0x58, "ADDSD");
sse_forms!(MULSD_XX, MULSD_XB, 0xF2, 0x59, "MULSD");
sse_forms!(SUBSD_XX, SUBSD_XB, 0xF2, 0x5C, "SUBSD");
sse_forms!(DIVSD_XX, DIVSD_XB, 0xF2, 0x5E, "DIVSD");
sse_forms!(UCOMISD_XX, UCOMISD_XB, 0x66, 0x2E, "UCOMISD");

const MOVSD_BX: Template = Template { name: "MOVSD_bx", steps: &[Step::Byte(0xF2), rex_nw(), Step::Byte(0x0F), Step::Byte(0x11), reg(1, R), Step::Stack { arg: 0 }] };
const MOVSD_XM: Template = Template { name: "MOVSD_xm", steps: &[Step::Byte(0xF2), rex_nw(), Step::Byte(0x0F), Step::Byte(0x10), reg(0, R), Step::Mem { arg: 1 }] };
const MOVSD_MX: Template = Template { name: "MOVSD_mx", steps: &[Step::Byte(0xF2), rex_nw(), Step::Byte(0x0F), Step::Byte(0x11), reg(1, R), Step::Mem { arg: 0 }] };
const MOVSD_XJ: Template = Template { name: "MOVSD_xj", steps: &[Step::Byte(0xF2), rex_nw(), Step::Byte(0x0F), Step::Byte(0x10), reg(0, R), Step::Abs { arg: 1 }] };
const MOVSD_JX: Template = Template { name: "MOVSD_jx", steps: &[Step::Byte(0xF2), rex_nw(), Step::Byte(0x0F), Step::Byte(0x11), reg(1, R), Step::Abs { arg: 0 }] };
const CVTSI2SD_XR: Template = Template { name: "CVTSI2SD_xr", steps: &[Step::Byte(0xF2), rex(), Step::Byte(0x0F), Step::Byte(0x2A), reg(0, R), reg(1, M), Step::Byte(0xC0)] };
const CVTSI2SD_XB: Template = Template { name: "CVTSI2SD_xb", steps: &[Step::Byte(0xF2), rex(), Step::Byte(0x0F), Step::Byte(0x2A), reg(0, R), Step::Stack { arg: 1 }] };
const CVTTSD2SI_RX: Template = Template { name: "CVTTSD2SI_rx", steps: &[Step::Byte(0xF2), rex(), Step::Byte(0x0F), Step::Byte(0x2C), reg(0, R), reg(1, M), Step::Byte(0xC0)] };

fn alu(forms: &'static AluForms, c0: LocationCode, c1: LocationCode, args: &[Location]) -> Option<&'static Template> {
    use LocationCode::*;
    let short = imm_at(args, 1).is_some_and(fits_i8);
    Some(match (c0, c1) {
        (Register, Register) => &forms.rr,
        (Register, Immediate) if short => &forms.ri8,
        (Register, Immediate) => &forms.ri32,
        (Register, Stack) => &forms.rb,
        (Stack, Register) => &forms.br,
        (Stack, Immediate) if short => &forms.bi8,
        (Stack, Immediate) => &forms.bi32,
        (Register, Memory | Indexed) => &forms.rm,
        (Memory | Indexed, Register) => &forms.mr,
        (Memory | Indexed, Immediate) if short => &forms.mi8,
        (Memory | Indexed, Immediate) => &forms.mi32,
        (Register, Absolute) => &forms.rj,
        (Absolute, Register) => &forms.jr,
        _ => return None,
    })
}

fn imm_at(args: &[Location], index: usize) -> Option<i64> {
    match args.get(index) {
        Some(Location::Immediate(v)) => Some(*v),
        _ => None,
    }
}

/// Pick the template for `mnemonic` applied to `args`.
pub fn select(target: Target, mnemonic: Mnemonic, args: &[Location]) -> Result<&'static Template, EncodingError> {
    use LocationCode::*;
    use Mnemonic as I;

    let no_encoding = || EncodingError::NoEncoding {
        mnemonic: mnemonic.name(),
        operands: operand_codes(args),
    };

    let codes: Vec<LocationCode> = args.iter().map(Location::code).collect();
    let template: Option<&'static Template> = match (mnemonic, codes.as_slice()) {
        (I::Mov, [Register, Register]) => Some(&MOV_RR),
        (I::Mov, [Register, Immediate]) => {
            let value = imm_at(args, 1).unwrap_or(0);
            Some(match target {
                Target::X86_32 => &MOV_RI_SHORT,
                Target::X86_64 if fits_i32(value) => &MOV_RI_SX,
                Target::X86_64 => &MOV_RI64,
            })
        }
        (I::Mov, [Register, Stack]) => Some(&MOV_RB),
        (I::Mov, [Stack, Register]) => Some(&MOV_BR),
        (I::Mov, [Stack, Immediate]) => Some(&MOV_BI),
        (I::Mov, [Register, Memory | Indexed]) => Some(&MOV_RM),
        (I::Mov, [Memory | Indexed, Register]) => Some(&MOV_MR),
        (I::Mov, [Memory | Indexed, Immediate]) => Some(&MOV_MI),
        (I::Mov, [Register, Absolute]) => Some(&MOV_RJ),
        (I::Mov, [Absolute, Register]) => Some(&MOV_JR),
        (I::Mov, [Absolute, Immediate]) => Some(&MOV_JI),

        (I::Add, [c0, c1]) => alu(&ADD, *c0, *c1, args),
        (I::Or, [c0, c1]) => alu(&OR, *c0, *c1, args),
        (I::And, [c0, c1]) => alu(&AND, *c0, *c1, args),
        (I::Sub, [c0, c1]) => alu(&SUB, *c0, *c1, args),
        (I::Xor, [c0, c1]) => alu(&XOR, *c0, *c1, args),
        (I::Cmp, [c0, c1]) => alu(&CMP, *c0, *c1, args),

        (I::Test, [Register, Register]) => Some(&TEST_RR),
        (I::Test, [Register, Immediate]) => Some(&TEST_RI),
        (I::Lea, [Register, Stack]) => Some(&LEA_RB),
        (I::Lea, [Register, Memory | Indexed]) => Some(&LEA_RM),
        (I::Imul, [Register, Register]) => Some(&IMUL_RR),
        (I::Imul, [Register, Stack]) => Some(&IMUL_RB),
        (I::Xchg, [Register, Register]) => Some(&XCHG_RR),
        (I::Xchg, [Register, Memory | Indexed]) => Some(&XCHG_RM),
        (I::Xchg, [Memory | Indexed, Register]) => Some(&XCHG_MR),
        (I::Neg, [Register]) => Some(&NEG_R),
        (I::Not, [Register]) => Some(&NOT_R),
        (I::Shl, [Register, Immediate]) => Some(&SHL_RI),
        (I::Shr, [Register, Immediate]) => Some(&SHR_RI),
        (I::Sar, [Register, Immediate]) => Some(&SAR_RI),
        (I::Movzx8, [Register, Register]) => Some(&MOVZX8_RR),
        (I::Setcc(_), [Register]) => Some(&SETCC_R),

        (I::Push, [Register]) => Some(&PUSH_R),
        (I::Push, [Stack]) => Some(&PUSH_B),
        (I::Push, [Memory | Indexed]) => Some(&PUSH_M),
        (I::Push, [Immediate]) if imm_at(args, 0).is_some_and(fits_i8) => Some(&PUSH_I8),
        (I::Push, [Immediate]) => Some(&PUSH_I32),
        (I::Pop, [Register]) => Some(&POP_R),
        (I::Pop, [Stack]) => Some(&POP_B),
        (I::Pop, [Memory | Indexed]) => Some(&POP_M),

        (I::Call, [Register]) => Some(&CALL_R),
        (I::Call, [Stack]) => Some(&CALL_B),
        (I::Call, [Immediate]) => Some(&CALL_L),
        (I::Jmp, [Register]) => Some(&JMP_R),
        (I::Jmp, [Immediate]) => Some(&JMP_L),
        (I::Jcc(_), [Immediate]) => Some(&JCC_L),
        (I::Ret, []) => Some(&RET),
        (I::Nop, []) => Some(&NOP),

        (I::Movsd, [Xmm, Xmm]) => Some(&MOVSD_XX),
        (I::Movsd, [Xmm, Stack]) => Some(&MOVSD_XB),
        (I::Movsd, [Stack, Xmm]) => Some(&MOVSD_BX),
        (I::Movsd, [Xmm, Memory | Indexed]) => Some(&MOVSD_XM),
        (I::Movsd, [Memory | Indexed, Xmm]) => Some(&MOVSD_MX),
        (I::Movsd, [Xmm, Absolute]) => Some(&MOVSD_XJ),
        (I::Movsd, [Absolute, Xmm]) => Some(&MOVSD_JX),
        (I::Addsd, [Xmm, Xmm]) => Some(&ADDSD_XX),
        (I::Addsd, [Xmm, Stack]) => Some(&ADDSD_XB),
        (I::Subsd, [Xmm, Xmm]) => Some(&SUBSD_XX),
        (I::Subsd, [Xmm, Stack]) => Some(&SUBSD_XB),
        (I::Mulsd, [Xmm, Xmm]) => Some(&MULSD_XX),
        (I::Mulsd, [Xmm, Stack]) => Some(&MULSD_XB),
        (I::Divsd, [Xmm, Xmm]) => Some(&DIVSD_XX),
        (I::Divsd, [Xmm, Stack]) => Some(&DIVSD_XB),
        (I::Ucomisd, [Xmm, Xmm]) => Some(&UCOMISD_XX),
        (I::Ucomisd, [Xmm, Stack]) => Some(&UCOMISD_XB),
        (I::Cvtsi2sd, [Xmm, Register]) => Some(&CVTSI2SD_XR),
        (I::Cvtsi2sd, [Xmm, Stack]) => Some(&CVTSI2SD_XB),
        (I::Cvttsd2si, [Register, Xmm]) => Some(&CVTTSD2SI_RX),
        _ => None,
    };

    let template = template.ok_or_else(no_encoding)?;
    trace!("{mnemonic} ({}) -> {}", operand_codes(args), template.name);
    Ok(template)
}

/// Encode one instruction into `out`.
pub fn encode(target: Target, mnemonic: Mnemonic, args: &[Location], out: &mut Vec<u8>) -> Result<(), EncodingError> {
    for arg in args {
        arg.validate(target)?;
    }
    let template = select(target, mnemonic, args)?;
    template.encode(target, mnemonic.condition(), args, out)
}
