//! Encoder checks against the iced-x86 decoder.
//!
//! Every encoded form is decoded independently; the decoder must consume
//! exactly the emitted bytes and report the requested instruction and
//! operands.

use asmgcroot::core::location::regs::*;
use asmgcroot::core::{EncodingError, Location, MemOperand, Reg, RegClass, StackSlot, Target};
use asmgcroot::x64::{disasm, encode, Cond, Mnemonic};
use iced_x86::{Instruction, Mnemonic as Iced, OpKind, Register};
use proptest::prelude::*;

const GPR64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];
const GPR32: [Register; 8] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
];
const XMM: [Register; 16] = [
    Register::XMM0,
    Register::XMM1,
    Register::XMM2,
    Register::XMM3,
    Register::XMM4,
    Register::XMM5,
    Register::XMM6,
    Register::XMM7,
    Register::XMM8,
    Register::XMM9,
    Register::XMM10,
    Register::XMM11,
    Register::XMM12,
    Register::XMM13,
    Register::XMM14,
    Register::XMM15,
];

fn iced_reg(reg: Reg, target: Target) -> Register {
    match (reg.class, target) {
        (RegClass::Xmm, _) => XMM[reg.num as usize],
        (RegClass::Gpr, Target::X86_64) => GPR64[reg.num as usize],
        (RegClass::Gpr, Target::X86_32) => GPR32[reg.num as usize],
    }
}

fn encode_one(target: Target, mnemonic: Mnemonic, args: &[Location]) -> (Vec<u8>, Instruction) {
    let mut code = Vec::new();
    encode(target, mnemonic, args, &mut code).unwrap_or_else(|e| panic!("{mnemonic} {args:?} on {target}: {e}"));
    let insn = disasm::decode_one(target, &code);
    assert_eq!(insn.len(), code.len(), "{mnemonic} {args:?} on {target}: {code:02x?}");
    (code, insn)
}

fn immediate_matches(insn: &Instruction, operand: u32, expected: i64) -> bool {
    let value = insn.immediate(operand);
    value as i64 == expected || value as u32 as i32 as i64 == expected || value as u8 as i8 as i64 == expected
}

/// Compare operand `i` of the decoded instruction with `arg`.
fn check_operand(target: Target, insn: &Instruction, i: u32, arg: &Location) {
    let fp = iced_reg(FP, target);
    match arg {
        Location::Register(r) => {
            assert_eq!(insn.op_kind(i), OpKind::Register);
            assert_eq!(insn.op_register(i), iced_reg(*r, target));
        }
        Location::StackSlot(s) => {
            assert_eq!(insn.op_kind(i), OpKind::Memory);
            assert_eq!(insn.memory_base(), fp);
            assert_eq!(insn.memory_index(), Register::None);
            assert_eq!(insn.memory_displacement32() as i32, s.offset);
        }
        Location::Memory(m) => {
            assert_eq!(insn.op_kind(i), OpKind::Memory);
            assert_eq!(insn.memory_base(), iced_reg(m.base, target));
            match m.index {
                Some(index) => {
                    assert_eq!(insn.memory_index(), iced_reg(index, target));
                    assert_eq!(insn.memory_index_scale(), u32::from(m.scale()));
                }
                None => assert_eq!(insn.memory_index(), Register::None),
            }
            assert_eq!(insn.memory_displacement32() as i32, m.offset);
        }
        Location::Absolute(addr) => {
            assert_eq!(insn.op_kind(i), OpKind::Memory);
            assert_eq!(insn.memory_base(), Register::None);
            assert_eq!(insn.memory_index(), Register::None);
            assert_eq!(insn.memory_displacement32(), *addr as u32);
        }
        Location::Immediate(v) => {
            assert!(immediate_matches(insn, i, *v), "immediate {v} decoded as {:#x}", insn.immediate(i));
        }
    }
}

fn check(target: Target, mnemonic: Mnemonic, args: &[Location], expected: Iced) {
    let (code, insn) = encode_one(target, mnemonic, args);
    assert_eq!(insn.mnemonic(), expected, "{mnemonic} {args:?} on {target}: {code:02x?}");
    assert_eq!(insn.op_count() as usize, args.len());
    for (i, arg) in args.iter().enumerate() {
        check_operand(target, &insn, i as u32, arg);
    }
}

fn both(mnemonic: Mnemonic, args: &[Location], expected: Iced) {
    check(Target::X86_32, mnemonic, args, expected);
    check(Target::X86_64, mnemonic, args, expected);
}

fn r(reg: Reg) -> Location {
    reg.into()
}

#[test]
fn test_mov_forms() {
    let _ = env_logger::builder().is_test(true).try_init();
    both(Mnemonic::Mov, &[r(EAX), r(EDI)], Iced::Mov);
    both(Mnemonic::Mov, &[r(EBX), Location::imm(-5)], Iced::Mov);
    both(Mnemonic::Mov, &[r(ESI), Location::stack(-8)], Iced::Mov);
    both(Mnemonic::Mov, &[Location::stack(-400), r(EDX)], Iced::Mov);
    both(Mnemonic::Mov, &[Location::stack(-12), Location::imm(7)], Iced::Mov);
    both(Mnemonic::Mov, &[r(ECX), Location::mem(EBX, 16)], Iced::Mov);
    both(Mnemonic::Mov, &[Location::mem(EDI, -4), r(EAX)], Iced::Mov);
    both(Mnemonic::Mov, &[Location::mem(ESI, 0), Location::imm(1000)], Iced::Mov);
    both(Mnemonic::Mov, &[r(EAX), Location::Absolute(0x1234)], Iced::Mov);
    both(Mnemonic::Mov, &[Location::Absolute(0x7fff_0000), r(EBX)], Iced::Mov);

    check(Target::X86_64, Mnemonic::Mov, &[r(R9), r(R15)], Iced::Mov);
    check(Target::X86_64, Mnemonic::Mov, &[r(RAX), Location::imm(0x1234_5678_9abc)], Iced::Mov);
    check(Target::X86_64, Mnemonic::Mov, &[r(R10), Location::imm(-1)], Iced::Mov);
}

#[test]
fn test_esp_and_ebp_aliasing_bases() {
    for base in [ESP, EBP] {
        both(Mnemonic::Mov, &[r(EAX), Location::mem(base, 0)], Iced::Mov);
        both(Mnemonic::Mov, &[Location::mem(base, 8), r(ECX)], Iced::Mov);
    }
    for base in [R12, R13] {
        check(Target::X86_64, Mnemonic::Mov, &[r(RAX), Location::mem(base, 0)], Iced::Mov);
        check(Target::X86_64, Mnemonic::Mov, &[r(R8), Location::mem(base, -200)], Iced::Mov);
        check(Target::X86_64, Mnemonic::Lea, &[r(R8), Location::mem(base, 0)], Iced::Lea);
    }
    let indexed = MemOperand::indexed(R13, R12, 8, 0).unwrap();
    check(Target::X86_64, Mnemonic::Mov, &[r(RDX), indexed.into()], Iced::Mov);
}

#[test]
fn test_indexed_memory() {
    for scale in [1, 2, 4, 8] {
        let m = MemOperand::indexed(EBX, ESI, scale, -24).unwrap();
        both(Mnemonic::Mov, &[r(EAX), m.into()], Iced::Mov);
        both(Mnemonic::Lea, &[r(EDI), m.into()], Iced::Lea);
    }
    let m = MemOperand::indexed(R8, R11, 4, 0x1000).unwrap();
    check(Target::X86_64, Mnemonic::Mov, &[m.into(), r(R14)], Iced::Mov);
    assert!(matches!(
        MemOperand::indexed(EBX, ESI, 3, 0),
        Err(EncodingError::InvalidScale(3))
    ));
}

#[test]
fn test_alu_forms() {
    let alu = [
        (Mnemonic::Add, Iced::Add),
        (Mnemonic::Or, Iced::Or),
        (Mnemonic::And, Iced::And),
        (Mnemonic::Sub, Iced::Sub),
        (Mnemonic::Xor, Iced::Xor),
        (Mnemonic::Cmp, Iced::Cmp),
    ];
    for (mnemonic, expected) in alu {
        both(mnemonic, &[r(EAX), r(EBX)], expected);
        both(mnemonic, &[r(ECX), Location::imm(5)], expected);
        both(mnemonic, &[r(EDX), Location::imm(-1000)], expected);
        both(mnemonic, &[r(ESI), Location::stack(-4)], expected);
        both(mnemonic, &[Location::stack(-8), r(EDI)], expected);
        both(mnemonic, &[Location::stack(-16), Location::imm(100)], expected);
        check(Target::X86_64, mnemonic, &[r(R11), Location::imm(127)], expected);
    }
}

#[test]
fn test_unary_shift_and_misc() {
    both(Mnemonic::Test, &[r(EAX), r(ECX)], Iced::Test);
    both(Mnemonic::Test, &[r(EBX), Location::imm(0x100)], Iced::Test);
    both(Mnemonic::Lea, &[r(EAX), Location::stack(-32)], Iced::Lea);
    both(Mnemonic::Imul, &[r(EDX), r(ESI)], Iced::Imul);
    both(Mnemonic::Imul, &[r(EDX), Location::stack(-4)], Iced::Imul);
    both(Mnemonic::Xchg, &[r(EBX), r(ECX)], Iced::Xchg);
    both(Mnemonic::Neg, &[r(EDI)], Iced::Neg);
    both(Mnemonic::Not, &[r(ESI)], Iced::Not);
    both(Mnemonic::Shl, &[r(EAX), Location::imm(3)], Iced::Shl);
    both(Mnemonic::Shr, &[r(EBX), Location::imm(31)], Iced::Shr);
    both(Mnemonic::Sar, &[r(ECX), Location::imm(1)], Iced::Sar);
    both(Mnemonic::Ret, &[], Iced::Ret);
    both(Mnemonic::Nop, &[], Iced::Nop);
    check(Target::X86_64, Mnemonic::Neg, &[r(R13)], Iced::Neg);
}

#[test]
fn test_push_pop() {
    both(Mnemonic::Push, &[r(EBX)], Iced::Push);
    both(Mnemonic::Push, &[Location::stack(-8)], Iced::Push);
    both(Mnemonic::Push, &[Location::imm(-3)], Iced::Push);
    both(Mnemonic::Push, &[Location::imm(0x10000)], Iced::Push);
    both(Mnemonic::Pop, &[r(ESI)], Iced::Pop);
    both(Mnemonic::Pop, &[Location::stack(-128)], Iced::Pop);
    check(Target::X86_64, Mnemonic::Push, &[r(R12)], Iced::Push);
    check(Target::X86_64, Mnemonic::Pop, &[r(R15)], Iced::Pop);
}

#[test]
fn test_byte_register_forms() {
    for cond in Cond::ALL {
        let (_, insn) = encode_one(Target::X86_64, Mnemonic::Setcc(cond), &[r(RSI)]);
        assert_eq!(insn.op_register(0), Register::SIL);
        assert!(format!("{:?}", insn.mnemonic()).starts_with("Set"));
    }
    let (code, insn) = encode_one(Target::X86_64, Mnemonic::Movzx8, &[r(RAX), r(RDI)]);
    assert_eq!(insn.mnemonic(), Iced::Movzx);
    assert_eq!(insn.op_register(1), Register::DIL);
    assert_eq!(code[0] & 0xF0, 0x40);

    let (_, insn) = encode_one(Target::X86_32, Mnemonic::Setcc(Cond::E), &[r(EBX)]);
    assert_eq!(insn.mnemonic(), Iced::Sete);
    assert_eq!(insn.op_register(0), Register::BL);
}

#[test]
fn test_sse_forms() {
    let xmm = |reg: Reg| -> Location { reg.into() };
    both(Mnemonic::Movsd, &[xmm(XMM0), xmm(XMM7)], Iced::Movsd);
    both(Mnemonic::Movsd, &[xmm(XMM1), Location::stack(-16)], Iced::Movsd);
    both(Mnemonic::Movsd, &[Location::stack(-24), xmm(XMM2)], Iced::Movsd);
    both(Mnemonic::Movsd, &[xmm(XMM3), Location::mem(ESP, 0)], Iced::Movsd);
    both(Mnemonic::Movsd, &[Location::mem(EBX, 8), xmm(XMM4)], Iced::Movsd);
    both(Mnemonic::Addsd, &[xmm(XMM0), xmm(XMM1)], Iced::Addsd);
    both(Mnemonic::Subsd, &[xmm(XMM2), Location::stack(-8)], Iced::Subsd);
    both(Mnemonic::Mulsd, &[xmm(XMM5), xmm(XMM6)], Iced::Mulsd);
    both(Mnemonic::Divsd, &[xmm(XMM7), Location::stack(-40)], Iced::Divsd);
    both(Mnemonic::Ucomisd, &[xmm(XMM0), xmm(XMM1)], Iced::Ucomisd);
    both(Mnemonic::Cvtsi2sd, &[xmm(XMM1), r(EAX)], Iced::Cvtsi2sd);
    both(Mnemonic::Cvttsd2si, &[r(ECX), xmm(XMM2)], Iced::Cvttsd2si);
    check(Target::X86_64, Mnemonic::Movsd, &[xmm(XMM15), xmm(XMM8)], Iced::Movsd);
    check(Target::X86_64, Mnemonic::Addsd, &[xmm(XMM8), Location::stack(-8)], Iced::Addsd);
}

#[test]
fn test_rejected_requests() {
    let mut code = Vec::new();
    assert!(matches!(
        encode(Target::X86_32, Mnemonic::Mov, &[r(R8), r(EAX)], &mut code),
        Err(EncodingError::RegisterOutOfRange { .. })
    ));
    assert!(matches!(
        encode(Target::X86_64, Mnemonic::Mov, &[Location::stack(-8), Location::stack(-16)], &mut code),
        Err(EncodingError::NoEncoding { .. })
    ));
    assert!(matches!(
        encode(Target::X86_32, Mnemonic::Setcc(Cond::E), &[r(ESI)], &mut code),
        Err(EncodingError::NoByteRegister { .. })
    ));
    assert!(matches!(
        encode(
            Target::X86_64,
            Mnemonic::Mov,
            &[r(RAX), Location::StackSlot(StackSlot::new(-6, 1))],
            &mut code
        ),
        Err(EncodingError::MisalignedStackSlot { offset: -6 })
    ));
    assert!(code.is_empty());
}

fn gpr(target: Target) -> impl Strategy<Value = Reg> {
    (0..target.register_count()).prop_map(Reg::gpr)
}

proptest! {
    #[test]
    fn prop_mov_register_stack(
        wide in any::<bool>(),
        dst in 0u8..16,
        offset in -4096i32..4096,
        load in any::<bool>(),
    ) {
        let target = if wide { Target::X86_64 } else { Target::X86_32 };
        let reg = Reg::gpr(dst % target.register_count());
        let slot = Location::stack(offset & !(target.word_size() - 1));
        let args = if load { [r(reg), slot] } else { [slot, r(reg)] };
        check(target, Mnemonic::Mov, &args, Iced::Mov);
    }

    #[test]
    fn prop_alu_immediates(
        reg in gpr(Target::X86_64),
        value in any::<i32>(),
        sub in any::<bool>(),
    ) {
        let (mnemonic, expected) = if sub { (Mnemonic::Sub, Iced::Sub) } else { (Mnemonic::Add, Iced::Add) };
        check(Target::X86_64, mnemonic, &[r(reg), Location::imm(i64::from(value))], expected);
        check(Target::X86_32, mnemonic, &[r(Reg::gpr(reg.num % 8)), Location::imm(i64::from(value))], expected);
    }

    #[test]
    fn prop_mov_immediate_64(reg in gpr(Target::X86_64), value in any::<i64>()) {
        check(Target::X86_64, Mnemonic::Mov, &[r(reg), Location::imm(value)], Iced::Mov);
    }

    #[test]
    fn prop_memory_operands(
        base in gpr(Target::X86_64),
        index in gpr(Target::X86_64),
        scale in prop::sample::select(vec![1u8, 2, 4, 8]),
        offset in any::<i32>(),
        dst in gpr(Target::X86_64),
    ) {
        prop_assume!(index.num != 4);
        let m = MemOperand::indexed(base, index, scale, offset).unwrap();
        check(Target::X86_64, Mnemonic::Mov, &[r(dst), m.into()], Iced::Mov);
        check(Target::X86_64, Mnemonic::Mov, &[r(dst), Location::mem(base, offset)], Iced::Mov);
    }

    #[test]
    fn prop_encoding_is_deterministic(reg in gpr(Target::X86_64), offset in -512i32..512) {
        let args = [r(reg), Location::stack(offset * 8)];
        let (first, _) = encode_one(Target::X86_64, Mnemonic::Add, &args);
        let (second, _) = encode_one(Target::X86_64, Mnemonic::Add, &args);
        prop_assert_eq!(first, second);
    }
}
