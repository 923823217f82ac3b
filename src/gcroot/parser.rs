// This module classifies the lines of an AT&T assembly listing for the GC root tracker.
// It knows the function markers (`.type NAME, @function` / `.size NAME, .-NAME`), label
// definitions, `.globl` declarations, jump-table entries, the `#APP`/`#NO_APP` brackets
// around inline assembly and the STORE/LOAD GCROOT comment sentinels. Instruction lines
// are split into a mnemonic and operands, and each operand is parsed just far enough for
// the tracker to tell registers, immediates, memory references and branch targets apart.
// Nothing here interprets the instructions; that is the tracker's job.

use crate::core::error::FrameErrorKind;
use crate::x64::RootMarker;

/// Base register of a GC root sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameReg {
    Fp,
    Sp,
}

/// Slot named by a GC root sentinel: byte displacement from a frame register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootSlot {
    pub base: FrameReg,
    pub disp: i64,
}

/// One parsed instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand<'a> {
    /// Register name without the `%`.
    Reg(&'a str),
    Imm(i64),
    /// `disp(base, index, scale)`. `disp` is `None` when symbolic.
    Mem {
        disp: Option<i64>,
        base: Option<&'a str>,
        index: Option<&'a str>,
    },
    /// Bare symbol or label, or a symbolic `$imm`.
    Symbol(&'a str),
    /// `*operand` branch target.
    Indirect(&'a str),
}

impl<'a> Operand<'a> {
    pub fn parse(text: &'a str) -> Self {
        let text = text.trim();
        if let Some(rest) = text.strip_prefix('*') {
            return Operand::Indirect(rest);
        }
        if let Some(reg) = text.strip_prefix('%') {
            return Operand::Reg(reg);
        }
        if let Some(imm) = text.strip_prefix('$') {
            return parse_int(imm).map_or(Operand::Symbol(imm), Operand::Imm);
        }
        if let Some(open) = text.find('(') {
            let disp = &text[..open];
            let inner = text[open + 1..].trim_end_matches(')');
            let mut parts = inner.split(',').map(str::trim);
            let reg = |s: Option<&'a str>| s.and_then(|s| s.strip_prefix('%'));
            let base = reg(parts.next());
            let index = reg(parts.next());
            let disp = if disp.is_empty() { Some(0) } else { parse_int(disp) };
            return Operand::Mem { disp, base, index };
        }
        Operand::Symbol(text)
    }

    /// Whether this is a register listed in `names`.
    pub fn is_reg_in(&self, names: &[&str]) -> bool {
        matches!(self, Operand::Reg(r) if names.contains(r))
    }
}

/// Every name of the stack pointer.
pub const SP_NAMES: &[&str] = &["rsp", "esp", "sp", "spl"];
/// Every name of the frame pointer.
pub const FP_NAMES: &[&str] = &["rbp", "ebp", "bp", "bpl"];

/// An instruction line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn<'a> {
    pub mnemonic: &'a str,
    pub operands: Vec<Operand<'a>>,
}

impl<'a> Insn<'a> {
    /// The last operand, which AT&T syntax makes the destination.
    pub fn destination(&self) -> Option<&Operand<'a>> {
        self.operands.last()
    }
}

/// What one listing line is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line<'a> {
    FunctionStart(&'a str),
    FunctionEnd(&'a str),
    Label(&'a str),
    Globl(&'a str),
    Marker(RootMarker, RootSlot),
    /// `.long LABEL` or `.quad LABEL` in a jump table; `None` for a 0 entry.
    TableEntry(Option<&'a str>),
    InlineAsmStart,
    InlineAsmEnd,
    /// Any other assembler directive.
    Directive,
    Insn(Insn<'a>),
    /// Blank line or comment.
    Blank,
}

impl<'a> Line<'a> {
    pub fn parse(text: &'a str) -> Result<Self, FrameErrorKind> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Line::Blank);
        }
        if trimmed.starts_with("#APP") {
            return Ok(Line::InlineAsmStart);
        }
        if trimmed.starts_with("#NO_APP") {
            return Ok(Line::InlineAsmEnd);
        }
        if trimmed.starts_with('#') {
            return Ok(Line::Blank);
        }
        if let Some(comment) = trimmed.strip_prefix("/*") {
            return parse_comment(comment);
        }

        let indented = text.starts_with(char::is_whitespace);
        if !indented {
            return Ok(match trimmed.strip_suffix(':') {
                Some(name) if is_label(name) => Line::Label(name),
                _ => Line::Directive,
            });
        }

        if let Some(directive) = trimmed.strip_prefix('.') {
            return Ok(parse_directive(directive));
        }

        let code = trimmed.split('#').next().unwrap_or_default().trim_end();
        let (mnemonic, rest) = match code.find(char::is_whitespace) {
            Some(at) => (&code[..at], code[at..].trim()),
            None => (code, ""),
        };
        let operands = split_operands(rest).map(Operand::parse).collect();
        Ok(Line::Insn(Insn { mnemonic, operands }))
    }
}

fn parse_comment(comment: &str) -> Result<Line<'_>, FrameErrorKind> {
    let body = comment.trim_end().trim_end_matches("*/").trim();
    if !body.contains("GCROOT") {
        return Ok(Line::Blank);
    }
    let mut words = body.split_whitespace();
    let kind = match words.next() {
        Some("STORE") => RootMarker::Store,
        Some("LOAD") => RootMarker::Load,
        _ => return Err(FrameErrorKind::MalformedMarker),
    };
    if words.next() != Some("GCROOT") {
        return Err(FrameErrorKind::MalformedMarker);
    }
    let slot = words.next().ok_or(FrameErrorKind::MalformedMarker)?;
    if words.next().is_some() {
        return Err(FrameErrorKind::MalformedMarker);
    }
    match Operand::parse(slot) {
        Operand::Mem {
            disp: Some(disp),
            base: Some(base),
            index: None,
        } => {
            let base = if FP_NAMES.contains(&base) {
                FrameReg::Fp
            } else if SP_NAMES.contains(&base) {
                FrameReg::Sp
            } else {
                return Err(FrameErrorKind::MalformedMarker);
            };
            Ok(Line::Marker(kind, RootSlot { base, disp }))
        }
        _ => Err(FrameErrorKind::MalformedMarker),
    }
}

fn parse_directive(directive: &str) -> Line<'_> {
    let (name, args) = match directive.find(char::is_whitespace) {
        Some(at) => (&directive[..at], directive[at..].trim()),
        None => (directive, ""),
    };
    match name {
        "type" => {
            let mut parts = args.split(',').map(str::trim);
            match (parts.next(), parts.next()) {
                (Some(sym), Some("@function")) => Line::FunctionStart(sym),
                _ => Line::Directive,
            }
        }
        "size" => {
            let mut parts = args.split(',').map(str::trim);
            match (parts.next(), parts.next()) {
                (Some(sym), Some(expr)) if expr.strip_prefix(".-") == Some(sym) => Line::FunctionEnd(sym),
                _ => Line::Directive,
            }
        }
        "globl" | "global" if is_label(args) => Line::Globl(args),
        "long" | "quad" if args == "0" => Line::TableEntry(None),
        "long" | "quad" if is_label(args) => Line::TableEntry(Some(args)),
        _ => Line::Directive,
    }
}

fn is_label(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '_' | '$' | '.'))
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '@' | '.'))
}

/// Split on the commas that are not inside parentheses.
fn split_operands(text: &str) -> impl Iterator<Item = &str> {
    let mut depth = 0i32;
    let mut start = 0;
    let mut parts = Vec::new();
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if !text.is_empty() {
        parts.push(&text[start..]);
    }
    parts.into_iter().map(str::trim)
}

fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}
