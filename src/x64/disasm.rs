// This module decodes emitted machine code with iced-x86, independently of the
// template encoder. The builder uses it to log a disassembly of finished code at trace
// level, and the test suites use it to check that every encoded form decodes to the
// instruction, registers, memory operand and immediate that were requested.

//! Independent decoding of emitted bytes.

use iced_x86::{Decoder, DecoderOptions, Formatter, GasFormatter, Instruction};

use crate::core::location::Target;

/// Decode every instruction in `code`, assuming it is loaded at `ip`.
/// Undecodable bytes show up as `Code::INVALID` instructions.
pub fn decode(target: Target, code: &[u8], ip: u64) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(target.bitness(), code, ip, DecoderOptions::NONE);
    let mut out = Vec::new();
    let mut instruction = Instruction::default();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        out.push(instruction);
    }
    out
}

/// Decode the first instruction of `code`.
pub fn decode_one(target: Target, code: &[u8]) -> Instruction {
    let mut decoder = Decoder::with_ip(target.bitness(), code, 0, DecoderOptions::NONE);
    decoder.decode()
}

/// AT&T disassembly, one `offset: text` line per instruction.
pub fn disassemble(target: Target, code: &[u8], ip: u64) -> String {
    let mut formatter = GasFormatter::new();
    let mut text = String::new();
    let mut line = String::new();
    for instruction in decode(target, code, ip) {
        line.clear();
        formatter.format(&instruction, &mut line);
        text.push_str(&format!("{:08x}: {}\n", instruction.ip(), line));
    }
    text
}
