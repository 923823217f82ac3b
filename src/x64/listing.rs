// This module renders instructions in AT&T syntax for the assembly listing that the
// code builder writes alongside the machine code. The listing is what the GC root
// tracker re-parses, so it follows the conventions the tracker expects: `%esp`/`%ebp`
// register names with an `l` suffix on x86-32, `%rsp`/`%rbp` with a `q` suffix on x86-64,
// source operand first, `*` before indirect branch targets, and the STORE/LOAD GCROOT
// sentinels written as C comments naming a frame slot.

//! AT&T syntax rendering.

use crate::core::location::{Location, Reg, RegClass, StackSlot, Target};

use super::forms::Mnemonic;

const GPR64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];
const GPR32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
const GPR8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b", "r13b", "r14b", "r15b",
];

/// Register name without the `%`.
pub fn reg_name(reg: Reg, target: Target) -> String {
    match reg.class {
        RegClass::Xmm => format!("xmm{}", reg.num),
        RegClass::Gpr => {
            let table: &[&str] = if target.is_64() { &GPR64 } else { &GPR32 };
            table
                .get(reg.num as usize)
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("r{}", reg.num))
        }
    }
}

fn byte_reg_name(reg: Reg) -> String {
    GPR8.get(reg.num as usize)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("r{}b", reg.num))
}

/// Stack pointer name for `target`, with the `%`.
pub fn sp_name(target: Target) -> &'static str {
    if target.is_64() {
        "%rsp"
    } else {
        "%esp"
    }
}

/// Frame pointer name for `target`, with the `%`.
pub fn fp_name(target: Target) -> &'static str {
    if target.is_64() {
        "%rbp"
    } else {
        "%ebp"
    }
}

/// `-8(%rbp)` for a frame slot.
pub fn stack_slot(slot: StackSlot, target: Target) -> String {
    format!("{}({})", slot.offset, fp_name(target))
}

/// One operand in AT&T syntax.
pub fn operand(loc: &Location, target: Target) -> String {
    match loc {
        Location::Register(r) => format!("%{}", reg_name(*r, target)),
        Location::StackSlot(s) => stack_slot(*s, target),
        Location::Immediate(v) => format!("${v}"),
        Location::Absolute(a) => format!("{a:#x}"),
        Location::Memory(m) => {
            let disp = if m.offset != 0 { m.offset.to_string() } else { String::new() };
            match m.index {
                None => format!("{disp}(%{})", reg_name(m.base, target)),
                Some(index) => format!(
                    "{disp}(%{},%{},{})",
                    reg_name(m.base, target),
                    reg_name(index, target),
                    m.scale()
                ),
            }
        }
    }
}

fn suffix(target: Target) -> &'static str {
    if target.is_64() {
        "q"
    } else {
        "l"
    }
}

/// A full listing line for a non-branch instruction, operands in Intel
/// order (destination first).
pub fn instruction(target: Target, mnemonic: Mnemonic, args: &[Location]) -> String {
    let name = match mnemonic {
        Mnemonic::Movsd
        | Mnemonic::Addsd
        | Mnemonic::Subsd
        | Mnemonic::Mulsd
        | Mnemonic::Divsd
        | Mnemonic::Ucomisd
        | Mnemonic::Cvttsd2si
        | Mnemonic::Ret
        | Mnemonic::Nop
        | Mnemonic::Setcc(_)
        | Mnemonic::Jcc(_)
        | Mnemonic::Jmp
        | Mnemonic::Call => mnemonic.to_string(),
        _ => format!("{mnemonic}{}", suffix(target)),
    };

    let indirect = matches!(mnemonic, Mnemonic::Jmp | Mnemonic::Call);
    let rendered: Vec<String> = args
        .iter()
        .enumerate()
        .rev()
        .map(|(i, arg)| match (mnemonic, arg) {
            (Mnemonic::Setcc(_), Location::Register(r)) => format!("%{}", byte_reg_name(*r)),
            (Mnemonic::Movzx8, Location::Register(r)) if i == 1 => format!("%{}", byte_reg_name(*r)),
            (_, Location::Immediate(v)) if indirect => format!("{v:#x}"),
            _ if indirect => format!("*{}", operand(arg, target)),
            _ => operand(arg, target),
        })
        .collect();

    if rendered.is_empty() {
        format!("\t{name}")
    } else {
        format!("\t{name}\t{}", rendered.join(", "))
    }
}

/// A branch or call to a named target.
pub fn branch(mnemonic: Mnemonic, target_name: &str) -> String {
    format!("\t{mnemonic}\t{target_name}")
}

/// Which GC root sentinel to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootMarker {
    Store,
    Load,
}

/// `\t/* STORE GCROOT -8(%rbp) */`.
pub fn root_marker(kind: RootMarker, slot: StackSlot, target: Target) -> String {
    let verb = match kind {
        RootMarker::Store => "STORE",
        RootMarker::Load => "LOAD",
    };
    format!("\t/* {verb} GCROOT {} */", stack_slot(slot, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::location::{regs::*, MemOperand};
    use crate::x64::forms::Cond;

    #[test]
    fn test_operands() {
        assert_eq!(operand(&Location::reg(R9), Target::X86_64), "%r9");
        assert_eq!(operand(&Location::stack(-8), Target::X86_32), "-8(%ebp)");
        let m = MemOperand::indexed(EBX, ECX, 4, 12).unwrap();
        assert_eq!(operand(&m.into(), Target::X86_32), "12(%ebx,%ecx,4)");
        assert_eq!(operand(&Location::mem(RSP, 0), Target::X86_64), "(%rsp)");
    }

    #[test]
    fn test_instructions() {
        assert_eq!(
            instruction(Target::X86_64, Mnemonic::Mov, &[Location::stack(-16), RAX.into()]),
            "\tmovq\t%rax, -16(%rbp)"
        );
        assert_eq!(
            instruction(Target::X86_32, Mnemonic::Sub, &[ESP.into(), Location::imm(12)]),
            "\tsubl\t$12, %esp"
        );
        assert_eq!(instruction(Target::X86_32, Mnemonic::Push, &[EBP.into()]), "\tpushl\t%ebp");
        assert_eq!(instruction(Target::X86_64, Mnemonic::Call, &[RAX.into()]), "\tcall\t*%rax");
        assert_eq!(instruction(Target::X86_64, Mnemonic::Setcc(Cond::E), &[RSI.into()]), "\tsete\t%sil");
        assert_eq!(instruction(Target::X86_64, Mnemonic::Ret, &[]), "\tret");
    }

    #[test]
    fn test_markers() {
        assert_eq!(
            root_marker(RootMarker::Store, StackSlot::new(-8, 1), Target::X86_64),
            "\t/* STORE GCROOT -8(%rbp) */"
        );
        assert_eq!(branch(Mnemonic::Jcc(Cond::NE), ".L2"), "\tjne\t.L2");
    }
}
