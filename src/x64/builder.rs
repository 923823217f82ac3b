// This module provides CodeBuilder, the machine-code buffer every emitting stage writes
// into. Each instruction goes through the form table and template encoder and is also
// appended, in AT&T syntax, to a parallel assembly listing. The listing carries the
// `.type`/`.size` function markers, label definitions, a `.globl` return-address label
// after every call and the STORE/LOAD GCROOT sentinels, which is exactly the input the
// GC root tracker consumes. Branches to local labels are emitted with rel32 placeholders
// and patched by finish(); calls to named symbols leave a relocation. Operands that do
// not fit an x86-64 encoding (immediates wider than a sign-extended 32-bit field and
// absolute addresses above 2 GiB) are materialised in the configured scratch register
// first; when both operands need it a second general register is borrowed around the
// instruction with push/pop. CodeBuilder also implements MoveEmitter so the frame
// reconciler can drive it directly.

//! Machine-code buffer with labels, relocations and an assembly listing.

use hashbrown::HashMap;
use log::{debug, trace};

use crate::core::config::BackendConfig;
use crate::core::error::EncodingError;
use crate::core::location::{regs, Location, LocationCode, MemOperand, Reg, StackSlot, Target};
use crate::reconciler::MoveEmitter;

use super::disasm;
use super::forms::{self, Cond, Mnemonic};
use super::listing::{self, RootMarker};
use super::template::fits_i32;

/// Handle to a label created by a [`CodeBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(usize);

#[derive(Debug, Clone)]
struct LabelInfo {
    name: String,
    offset: Option<usize>,
}

/// A rel32 field waiting for its label.
#[derive(Debug, Clone, Copy)]
struct Fixup {
    field: usize,
    label: LabelId,
}

/// A call to an external symbol. `offset` is the position of the rel32
/// field; the displacement is relative to `offset + 4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRelocation {
    pub offset: usize,
    pub symbol: String,
}

/// A function emitted between `begin_function` and `end_function`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// Result of [`CodeBuilder::finish`].
#[derive(Debug, Clone)]
pub struct AssembledCode {
    pub target: Target,
    pub code: Vec<u8>,
    /// The AT&T listing, one line per instruction, label or marker.
    pub listing: String,
    pub functions: Vec<FunctionSymbol>,
    pub relocations: Vec<CallRelocation>,
    labels: HashMap<String, usize>,
}

impl AssembledCode {
    /// Code offset of a bound label or function.
    pub fn label_offset(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// Every bound label with its address when the code is loaded at `base`.
    pub fn label_addresses(&self, base: u64) -> HashMap<String, u64> {
        self.labels
            .iter()
            .map(|(name, offset)| (name.clone(), base + *offset as u64))
            .collect()
    }
}

/// Incremental x86 code emitter.
pub struct CodeBuilder {
    target: Target,
    scratch: Option<Reg>,
    label_prefix: String,
    code: Vec<u8>,
    listing: Vec<String>,
    labels: Vec<LabelInfo>,
    fixups: Vec<Fixup>,
    relocations: Vec<CallRelocation>,
    functions: Vec<FunctionSymbol>,
    /// Open function: name and start offset.
    current: Option<(String, usize)>,
    /// Return-address labels emitted in the open function.
    call_sites: usize,
}

impl CodeBuilder {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            target: config.target,
            scratch: config.scratch,
            label_prefix: config.label_prefix.clone(),
            code: Vec::new(),
            listing: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            relocations: Vec::new(),
            functions: Vec::new(),
            current: None,
            call_sites: 0,
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn scratch(&self) -> Option<Reg> {
        self.scratch
    }

    /// Current code offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Emit one instruction, synthesizing wide operands through the scratch
    /// register when needed. Nothing is appended when this fails.
    pub fn emit(&mut self, mnemonic: Mnemonic, args: &[Location]) -> Result<(), EncodingError> {
        let (code_len, listing_len) = (self.code.len(), self.listing.len());
        let result = self.emit_synthesized(mnemonic, args);
        if result.is_err() {
            self.code.truncate(code_len);
            self.listing.truncate(listing_len);
        }
        result
    }

    fn emit_synthesized(&mut self, mnemonic: Mnemonic, args: &[Location]) -> Result<(), EncodingError> {
        let wide: Vec<usize> = (0..args.len())
            .filter(|&i| self.needs_scratch(mnemonic, args, i))
            .collect();

        match wide.as_slice() {
            [] => self.emit_direct(mnemonic, args),
            [i] => {
                let scratch = self.reserve_scratch(args)?;
                let mut rewritten = args.to_vec();
                rewritten[*i] = self.materialize(args[*i], scratch)?;
                self.emit_direct(mnemonic, &rewritten)
            }
            [i, j] => {
                let scratch = self.reserve_scratch(args)?;
                let spare = self.spare_register(args, scratch)?;
                trace!("borrowing {spare} for a second wide operand");
                self.emit_direct(Mnemonic::Push, &[spare.into()])?;
                let mut rewritten = args.to_vec();
                rewritten[*i] = self.materialize(args[*i], spare)?;
                rewritten[*j] = self.materialize(args[*j], scratch)?;
                self.emit_direct(mnemonic, &rewritten)?;
                self.emit_direct(Mnemonic::Pop, &[spare.into()])
            }
            _ => Err(EncodingError::NoEncoding {
                mnemonic: mnemonic.name(),
                operands: super::template::operand_codes(args),
            }),
        }
    }

    fn emit_direct(&mut self, mnemonic: Mnemonic, args: &[Location]) -> Result<(), EncodingError> {
        forms::encode(self.target, mnemonic, args, &mut self.code)?;
        self.listing.push(listing::instruction(self.target, mnemonic, args));
        Ok(())
    }

    /// Whether operand `i` has no direct encoding on this target.
    fn needs_scratch(&self, mnemonic: Mnemonic, args: &[Location], i: usize) -> bool {
        if !self.target.is_64() {
            return false;
        }
        match args[i] {
            // `mov reg, imm64` has its own form.
            Location::Immediate(v) => {
                let direct = mnemonic == Mnemonic::Mov && i == 1 && args[0].code() == LocationCode::Register;
                !fits_i32(v) && !direct
            }
            Location::Absolute(a) => !fits_i32(a as i64),
            _ => false,
        }
    }

    fn reserve_scratch(&self, args: &[Location]) -> Result<Reg, EncodingError> {
        let scratch = self.scratch.ok_or(EncodingError::NoScratchRegister)?;
        if args.iter().flat_map(Location::registers).any(|r| r == scratch) {
            return Err(EncodingError::ScratchClobbered { reg: scratch });
        }
        Ok(scratch)
    }

    /// A general register that is neither an operand, the scratch register,
    /// nor the stack or frame pointer.
    fn spare_register(&self, args: &[Location], scratch: Reg) -> Result<Reg, EncodingError> {
        (0..self.target.register_count())
            .map(Reg::gpr)
            .find(|r| {
                *r != scratch
                    && *r != regs::SP
                    && *r != regs::FP
                    && !args.iter().flat_map(Location::registers).any(|u| u == *r)
            })
            .ok_or(EncodingError::NoScratchRegister)
    }

    /// Load a wide operand into `reg` and return what replaces it.
    fn materialize(&mut self, arg: Location, reg: Reg) -> Result<Location, EncodingError> {
        match arg {
            Location::Immediate(v) => {
                self.emit_direct(Mnemonic::Mov, &[reg.into(), Location::imm(v)])?;
                Ok(reg.into())
            }
            Location::Absolute(a) => {
                self.emit_direct(Mnemonic::Mov, &[reg.into(), Location::imm(a as i64)])?;
                Ok(MemOperand::base_offset(reg, 0).into())
            }
            other => Ok(other),
        }
    }

    pub fn mov(&mut self, dst: impl Into<Location>, src: impl Into<Location>) -> Result<(), EncodingError> {
        self.emit(Mnemonic::Mov, &[dst.into(), src.into()])
    }

    pub fn add(&mut self, dst: impl Into<Location>, src: impl Into<Location>) -> Result<(), EncodingError> {
        self.emit(Mnemonic::Add, &[dst.into(), src.into()])
    }

    pub fn sub(&mut self, dst: impl Into<Location>, src: impl Into<Location>) -> Result<(), EncodingError> {
        self.emit(Mnemonic::Sub, &[dst.into(), src.into()])
    }

    pub fn cmp(&mut self, a: impl Into<Location>, b: impl Into<Location>) -> Result<(), EncodingError> {
        self.emit(Mnemonic::Cmp, &[a.into(), b.into()])
    }

    pub fn push(&mut self, src: impl Into<Location>) -> Result<(), EncodingError> {
        self.emit(Mnemonic::Push, &[src.into()])
    }

    pub fn pop(&mut self, dst: impl Into<Location>) -> Result<(), EncodingError> {
        self.emit(Mnemonic::Pop, &[dst.into()])
    }

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.emit(Mnemonic::Ret, &[])
    }

    /// Create an unbound label named `.L<n>`.
    pub fn new_label(&mut self) -> LabelId {
        let name = format!(".L{}", self.labels.len());
        self.named_label(name)
    }

    pub fn named_label(&mut self, name: impl Into<String>) -> LabelId {
        let id = LabelId(self.labels.len());
        self.labels.push(LabelInfo {
            name: name.into(),
            offset: None,
        });
        id
    }

    pub fn label_name(&self, label: LabelId) -> &str {
        &self.labels[label.0].name
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: LabelId) -> Result<(), EncodingError> {
        let offset = self.code.len();
        let info = &mut self.labels[label.0];
        if info.offset.is_some() {
            return Err(EncodingError::LabelRebound(label.0));
        }
        info.offset = Some(offset);
        self.listing.push(format!("{}:", info.name));
        Ok(())
    }

    fn branch_to(&mut self, mnemonic: Mnemonic, label: LabelId) -> Result<(), EncodingError> {
        forms::encode(self.target, mnemonic, &[Location::imm(0)], &mut self.code)?;
        self.fixups.push(Fixup {
            field: self.code.len() - 4,
            label,
        });
        let line = listing::branch(mnemonic, &self.labels[label.0].name);
        self.listing.push(line);
        Ok(())
    }

    pub fn jmp(&mut self, label: LabelId) -> Result<(), EncodingError> {
        self.branch_to(Mnemonic::Jmp, label)
    }

    pub fn jcc(&mut self, cond: Cond, label: LabelId) -> Result<(), EncodingError> {
        self.branch_to(Mnemonic::Jcc(cond), label)
    }

    /// Call a local label.
    pub fn call_label(&mut self, label: LabelId) -> Result<(), EncodingError> {
        self.branch_to(Mnemonic::Call, label)?;
        self.return_label();
        Ok(())
    }

    /// Call an external symbol through a relocation.
    pub fn call_symbol(&mut self, symbol: &str) -> Result<(), EncodingError> {
        forms::encode(self.target, Mnemonic::Call, &[Location::imm(0)], &mut self.code)?;
        self.relocations.push(CallRelocation {
            offset: self.code.len() - 4,
            symbol: symbol.to_string(),
        });
        self.listing.push(listing::branch(Mnemonic::Call, symbol));
        self.return_label();
        Ok(())
    }

    /// Indirect call through a register or stack slot.
    pub fn call_indirect(&mut self, target: impl Into<Location>) -> Result<(), EncodingError> {
        self.emit(Mnemonic::Call, &[target.into()])?;
        self.return_label();
        Ok(())
    }

    /// Label the return address of the call just emitted, so the GC map
    /// can refer to it.
    fn return_label(&mut self) {
        let Some((function, _)) = &self.current else {
            return;
        };
        let name = format!("{}{}_{}", self.label_prefix, function, self.call_sites);
        self.call_sites += 1;
        self.listing.push(format!("\t.globl\t{name}"));
        let id = self.named_label(name);
        self.labels[id.0].offset = Some(self.code.len());
        self.listing.push(format!("{}:", self.labels[id.0].name));
    }

    /// Start a function. An open function is closed first.
    pub fn begin_function(&mut self, name: &str) {
        if self.current.is_some() {
            self.end_function();
        }
        debug!("begin function {name} at {:#x}", self.code.len());
        self.listing.push(format!("\t.type\t{name}, @function"));
        self.listing.push(format!("{name}:"));
        let id = self.named_label(name);
        self.labels[id.0].offset = Some(self.code.len());
        self.current = Some((name.to_string(), self.code.len()));
        self.call_sites = 0;
    }

    pub fn end_function(&mut self) {
        if let Some((name, start)) = self.current.take() {
            self.listing.push(format!("\t.size\t{name}, .-{name}"));
            let size = self.code.len() - start;
            debug!("end function {name}: {size} bytes, {} call sites", self.call_sites);
            self.functions.push(FunctionSymbol {
                name,
                offset: start,
                size,
            });
        }
    }

    /// `push fp; mov fp, sp; sub sp, frame_words*word`.
    pub fn prologue(&mut self, frame_words: u32) -> Result<(), EncodingError> {
        self.push(regs::FP)?;
        self.mov(regs::FP, regs::SP)?;
        if frame_words > 0 {
            let bytes = i64::from(frame_words) * i64::from(self.target.word_size());
            self.sub(regs::SP, Location::imm(bytes))?;
        }
        Ok(())
    }

    /// `mov sp, fp; pop fp; ret`.
    pub fn epilogue(&mut self) -> Result<(), EncodingError> {
        self.mov(regs::SP, regs::FP)?;
        self.pop(regs::FP)?;
        self.ret()
    }

    /// Note that `slot` now holds a live GC pointer.
    pub fn store_gcroot(&mut self, slot: StackSlot) {
        self.listing.push(listing::root_marker(RootMarker::Store, slot, self.target));
    }

    /// Note that `slot` no longer holds a live GC pointer.
    pub fn load_gcroot(&mut self, slot: StackSlot) {
        self.listing.push(listing::root_marker(RootMarker::Load, slot, self.target));
    }

    /// Patch every branch and hand out the finished code.
    pub fn finish(mut self) -> Result<AssembledCode, EncodingError> {
        self.end_function();

        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0]
                .offset
                .ok_or(EncodingError::UnboundLabel(fixup.label.0))?;
            let rel = target as i64 - (fixup.field as i64 + 4);
            let rel = i32::try_from(rel).map_err(|_| EncodingError::BranchOutOfRange(rel))?;
            self.code[fixup.field..fixup.field + 4].copy_from_slice(&rel.to_le_bytes());
        }

        if log::log_enabled!(log::Level::Trace) {
            trace!("finished code:\n{}", disasm::disassemble(self.target, &self.code, 0));
        }

        let labels = self
            .labels
            .into_iter()
            .filter_map(|info| info.offset.map(|offset| (info.name, offset)))
            .collect();

        let mut listing = self.listing.join("\n");
        listing.push('\n');

        Ok(AssembledCode {
            target: self.target,
            code: self.code,
            listing,
            functions: self.functions,
            relocations: self.relocations,
            labels,
        })
    }
}

impl MoveEmitter for CodeBuilder {
    fn emit_move(&mut self, src: Location, dst: Location) -> Result<(), EncodingError> {
        trace!("move {src} -> {dst}");
        let float = src.as_reg().is_some_and(Reg::is_float) || dst.as_reg().is_some_and(Reg::is_float);
        if float {
            self.emit(Mnemonic::Movsd, &[dst, src])
        } else {
            self.emit(Mnemonic::Mov, &[dst, src])
        }
    }

    fn emit_push(&mut self, src: Location) -> Result<(), EncodingError> {
        let word = self.target.word_size();
        match src {
            Location::Register(r) if r.is_float() => {
                self.sub(regs::SP, Location::imm(8))?;
                self.emit(Mnemonic::Movsd, &[Location::mem(regs::SP, 0), src])
            }
            Location::StackSlot(s) if s.width_words > 1 => {
                for k in (0..i32::from(s.width_words)).rev() {
                    self.push(Location::stack(s.offset + k * word))?;
                }
                Ok(())
            }
            _ => self.push(src),
        }
    }

    fn emit_pop(&mut self, dst: Location) -> Result<(), EncodingError> {
        let word = self.target.word_size();
        match dst {
            Location::Register(r) if r.is_float() => {
                self.emit(Mnemonic::Movsd, &[dst, Location::mem(regs::SP, 0)])?;
                self.add(regs::SP, Location::imm(8))
            }
            Location::StackSlot(s) if s.width_words > 1 => {
                for k in 0..i32::from(s.width_words) {
                    self.pop(Location::stack(s.offset + k * word))?;
                }
                Ok(())
            }
            _ => self.pop(dst),
        }
    }

    /// Wide constants and far addresses are materialised in the scratch
    /// register on x86-64.
    fn reserved_scratch(&self) -> Option<Reg> {
        self.scratch.filter(|_| self.target.is_64())
    }
}
