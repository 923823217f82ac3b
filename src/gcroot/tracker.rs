// This module implements the GC root tracker: a re-walk of an assembly listing that
// reconstructs, at every call, how large the frame is and which stack slots hold live GC
// pointers. Each function between its `.type`/`.size` markers is parsed into an arena,
// its labels are indexed, and the body is walked from the entry with a worklist. Labels
// are seeded by the first edge that reaches them; every later edge, whether a jump or a
// fall-through, must arrive with exactly the same state. push/pop, constant add/sub on
// the stack pointer, the frame-pointer prologue and the usual epilogue forms are the only
// stack-pointer writes understood; anything else that writes it is rejected. An indirect
// jump through a local `.long`/`.quad` table reaches every label in the table, while any
// other jump to a non-local target is a tail call. Calls to non-exempt targets record
// the state before the call under a label placed right after it (an existing `.globl`
// label is reused, otherwise one is inserted into the rewritten listing), and a call the
// walk never reached is an error. The module driver collects the
// descriptors of all functions, in order, and builds the GC map from them.

//! Frame-size and live-root tracking over assembly listings.

use bumpalo::{collections::Vec as BumpVec, Bump};
use hashbrown::HashMap;
use log::{debug, trace};

use crate::core::config::{BackendConfig, CallPolicy};
use crate::core::error::{BackendResult, FrameAnalysisError, FrameErrorKind};
use crate::x64::RootMarker;

use super::gcmap::{CallSiteDescriptor, FrameState, GcMap};
use super::labels::LabelGenerator;
use super::parser::{FrameReg, Insn, Line, Operand, RootSlot, FP_NAMES, SP_NAMES};

/// State carried along one path through a function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct WalkState {
    frame: FrameState,
    /// Frame size when the frame pointer was set from the stack pointer.
    fp_base: Option<u32>,
}

/// One listing line of the function being tracked.
#[derive(Debug)]
struct Parsed<'a> {
    /// 1-based line number in the module listing.
    number: usize,
    text: &'a str,
    line: Line<'a>,
}

/// What became of a `call` line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CallOutcome {
    Recorded(FrameState),
    Exempt,
}

/// How a walk leaves an instruction.
enum Flow<'a> {
    Next,
    Stop,
    Propagate { target: &'a str, stop: bool },
}

/// Tracker for a single function.
struct FunctionTracker<'a, 'b> {
    name: &'a str,
    word: i64,
    policy: &'b CallPolicy,
    lines: BumpVec<'b, Parsed<'a>>,
    labels: HashMap<&'a str, usize>,
    seeded: HashMap<usize, WalkState>,
    worklist: Vec<(usize, WalkState)>,
    calls: HashMap<usize, CallOutcome>,
}

impl<'a, 'b> FunctionTracker<'a, 'b> {
    fn new(arena: &'b Bump, name: &'a str, word: i64, policy: &'b CallPolicy) -> Self {
        Self {
            name,
            word,
            policy,
            lines: BumpVec::new_in(arena),
            labels: HashMap::new(),
            seeded: HashMap::new(),
            worklist: Vec::new(),
            calls: HashMap::new(),
        }
    }

    fn error(&self, at: usize, state: Option<&WalkState>, kind: FrameErrorKind) -> FrameAnalysisError {
        let line = &self.lines[at];
        FrameAnalysisError {
            function: self.name.to_string(),
            line: line.number,
            text: line.text.to_string(),
            state: state.map(|s| s.frame.clone()),
            kind,
        }
    }

    /// Add a line. Inline assembly and its brackets never reach here.
    fn push(&mut self, number: usize, text: &'a str, line: Line<'a>) -> Result<(), FrameAnalysisError> {
        let at = self.lines.len();
        if let Line::Label(name) = line {
            if self.labels.insert(name, at).is_some() {
                self.lines.push(Parsed { number, text, line });
                return Err(self.error(at, None, FrameErrorKind::DuplicateLabel(name.to_string())));
            }
        }
        self.lines.push(Parsed { number, text, line });
        Ok(())
    }

    /// Walk every path from the entry until nothing new is reached.
    fn run(&mut self) -> Result<(), FrameAnalysisError> {
        self.walk(0, WalkState::default(), false)?;
        while let Some((start, state)) = self.worklist.pop() {
            self.walk(start, state, true)?;
        }

        for (at, parsed) in self.lines.iter().enumerate() {
            if let Line::Insn(insn) = &parsed.line {
                if is_call(insn.mnemonic) && !self.calls.contains_key(&at) && !self.exempt(insn) {
                    return Err(self.error(at, None, FrameErrorKind::UnreachedCall));
                }
            }
        }
        Ok(())
    }

    /// Seed `target` with `state` or check it against the seed. Returns
    /// whether the label was new.
    fn merge(&mut self, target: usize, state: &WalkState, from: usize) -> Result<bool, FrameAnalysisError> {
        match self.seeded.get(&target) {
            None => {
                self.seeded.insert(target, state.clone());
                Ok(true)
            }
            Some(seed) if seed == state => Ok(false),
            Some(seed) => {
                let label = match self.lines[target].line {
                    Line::Label(name) => name.to_string(),
                    _ => String::new(),
                };
                let kind = FrameErrorKind::DivergentJoin {
                    label,
                    first: seed.frame.clone(),
                    second: state.frame.clone(),
                };
                Err(self.error(from, Some(&*state), kind))
            }
        }
    }

    /// Walk straight-line code from `start`. When `entered` is set the
    /// walk begins at a label already seeded with `state`.
    fn walk(&mut self, start: usize, mut state: WalkState, entered: bool) -> Result<(), FrameAnalysisError> {
        trace!("{}: walk from line {} with {}", self.name, self.lines[start].number, state.frame);
        for at in start..self.lines.len() {
            let flow = match &self.lines[at].line {
                Line::Label(_) if entered && at == start => Flow::Next,
                Line::Label(_) => {
                    if self.merge(at, &state, at)? {
                        Flow::Next
                    } else {
                        Flow::Stop
                    }
                }
                Line::Marker(kind, slot) => {
                    let (kind, slot) = (*kind, *slot);
                    self.marker(at, &mut state, kind, slot)?;
                    Flow::Next
                }
                Line::Insn(insn) => {
                    let insn = insn.clone();
                    self.instruction(at, &mut state, &insn)?
                }
                _ => Flow::Next,
            };

            match flow {
                Flow::Next => {}
                Flow::Stop => return Ok(()),
                Flow::Propagate { target, stop } => {
                    self.propagate(at, &state, target)?;
                    if stop {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Hand `state` to the label `target` along the edge from `at`.
    fn propagate(&mut self, at: usize, state: &WalkState, target: &str) -> Result<(), FrameAnalysisError> {
        let Some(&to) = self.labels.get(target) else {
            return Err(self.error(at, Some(state), FrameErrorKind::UnknownLabel(target.to_string())));
        };
        if self.merge(to, state, at)? {
            self.worklist.push((to, state.clone()));
        }
        Ok(())
    }

    /// Position of the local table label in a `*TABLE(,%reg,N)` jump.
    fn jump_table(&self, target: &str) -> Option<usize> {
        let Operand::Mem { disp: None, .. } = Operand::parse(target) else {
            return None;
        };
        let table = &target[..target.find('(')?];
        self.labels.get(table).copied()
    }

    /// A table-based switch: every entry after the table label is a
    /// successor, and the jump itself ends the block.
    fn switch(&mut self, at: usize, state: &WalkState, table: usize) -> Result<Flow<'a>, FrameAnalysisError> {
        let mut targets = Vec::new();
        for parsed in &self.lines[table + 1..] {
            match parsed.line {
                Line::Blank | Line::TableEntry(None) => {}
                Line::TableEntry(Some(label)) => targets.push(label),
                _ => break,
            }
        }
        if targets.is_empty() {
            return Err(self.error(at, Some(state), FrameErrorKind::UnrecognizedOperation));
        }
        debug!("{}: switch at line {} with {} targets", self.name, self.lines[at].number, targets.len());
        for target in targets {
            self.propagate(at, state, target)?;
        }
        Ok(Flow::Stop)
    }

    /// Entry-relative word offset of the slot a sentinel names.
    fn root_offset(&self, at: usize, state: &WalkState, slot: RootSlot) -> Result<i32, FrameAnalysisError> {
        if slot.disp % self.word != 0 {
            return Err(self.error(at, Some(&*state), FrameErrorKind::MalformedMarker));
        }
        let words = slot.disp / self.word;
        let root = match slot.base {
            FrameReg::Fp => {
                let base = state
                    .fp_base
                    .ok_or_else(|| self.error(at, Some(&*state), FrameErrorKind::NoFramePointer))?;
                words - i64::from(base)
            }
            FrameReg::Sp => words - i64::from(state.frame.frame_size),
        };
        let root = i32::try_from(root).map_err(|_| self.error(at, Some(&*state), FrameErrorKind::MalformedMarker))?;
        if !state.frame.contains(root) {
            let kind = FrameErrorKind::RootOutsideFrame {
                offset: root,
                frame_size: state.frame.frame_size,
            };
            return Err(self.error(at, Some(&*state), kind));
        }
        Ok(root)
    }

    fn marker(&self, at: usize, state: &mut WalkState, kind: RootMarker, slot: RootSlot) -> Result<(), FrameAnalysisError> {
        let root = self.root_offset(at, state, slot)?;
        match kind {
            RootMarker::Store => {
                if state.frame.roots.contains(&root) {
                    return Err(self.error(at, Some(&*state), FrameErrorKind::DoubleStore { offset: root }));
                }
                state.frame.roots.insert(root);
            }
            RootMarker::Load => {
                if !state.frame.roots.contains(&root) {
                    return Err(self.error(at, Some(&*state), FrameErrorKind::LoadOfDeadRoot { offset: root }));
                }
                state.frame.roots.remove(&root);
            }
        }
        trace!("{}: {:?} {} -> {}", self.name, kind, root, state.frame);
        Ok(())
    }

    fn exempt(&self, insn: &Insn<'_>) -> bool {
        match insn.operands.first() {
            Some(Operand::Symbol(name)) => self.policy.is_exempt(name),
            _ => false,
        }
    }

    /// Set the frame size to `words`, which must not be negative.
    fn set_frame(&self, at: usize, state: &mut WalkState, words: i64) -> Result<(), FrameAnalysisError> {
        let size = u32::try_from(words).map_err(|_| self.error(at, Some(&*state), FrameErrorKind::StackUnderflow))?;
        state.frame.frame_size = size;
        Ok(())
    }

    /// Byte adjustment as whole words.
    fn words(&self, at: usize, state: &WalkState, bytes: i64) -> Result<i64, FrameAnalysisError> {
        if bytes % self.word != 0 {
            return Err(self.error(at, Some(&*state), FrameErrorKind::MisalignedAdjustment(bytes)));
        }
        Ok(bytes / self.word)
    }

    fn fp_base(&self, at: usize, state: &WalkState) -> Result<i64, FrameAnalysisError> {
        state
            .fp_base
            .map(i64::from)
            .ok_or_else(|| self.error(at, Some(&*state), FrameErrorKind::NoFramePointer))
    }

    fn instruction(&mut self, at: usize, state: &mut WalkState, insn: &Insn<'a>) -> Result<Flow<'a>, FrameAnalysisError> {
        let frame = i64::from(state.frame.frame_size);
        let ops = insn.operands.as_slice();
        let writes_sp = insn.destination().is_some_and(|d| d.is_reg_in(SP_NAMES));
        let writes_fp = insn.destination().is_some_and(|d| d.is_reg_in(FP_NAMES));

        match insn.mnemonic {
            "push" | "pushl" | "pushq" | "pushf" | "pushfl" | "pushfq" => {
                if ops.iter().any(|op| op.is_reg_in(SP_NAMES)) {
                    return Err(self.error(at, Some(&*state), FrameErrorKind::UnrecognizedOperation));
                }
                self.set_frame(at, state, frame + 1)?;
            }
            "pop" | "popl" | "popq" | "popf" | "popfl" | "popfq" => {
                if writes_sp {
                    return Err(self.error(at, Some(&*state), FrameErrorKind::UnrecognizedOperation));
                }
                self.set_frame(at, state, frame - 1)?;
                if writes_fp {
                    state.fp_base = None;
                }
            }
            "add" | "addl" | "addq" | "sub" | "subl" | "subq" if writes_sp => {
                let [Operand::Imm(bytes), _] = ops else {
                    return Err(self.error(at, Some(&*state), FrameErrorKind::UnrecognizedOperation));
                };
                let words = self.words(at, state, *bytes)?;
                let words = if insn.mnemonic.starts_with("sub") { words } else { -words };
                self.set_frame(at, state, frame + words)?;
            }
            "mov" | "movl" | "movq" if writes_sp || writes_fp => match ops {
                [src, _] if writes_fp && src.is_reg_in(SP_NAMES) => state.fp_base = Some(state.frame.frame_size),
                [src, _] if writes_sp && src.is_reg_in(FP_NAMES) => {
                    let base = self.fp_base(at, state)?;
                    self.set_frame(at, state, base)?;
                }
                _ if writes_sp => return Err(self.error(at, Some(&*state), FrameErrorKind::UnrecognizedOperation)),
                _ => state.fp_base = None,
            },
            "lea" | "leal" | "leaq" if writes_sp => match ops {
                [Operand::Mem {
                    disp: Some(disp),
                    base: Some(base),
                    index: None,
                }, _]
                    if FP_NAMES.contains(base) =>
                {
                    let words = self.words(at, state, *disp)?;
                    let base = self.fp_base(at, state)?;
                    self.set_frame(at, state, base - words)?;
                }
                _ => return Err(self.error(at, Some(&*state), FrameErrorKind::UnrecognizedOperation)),
            },
            "leave" | "leavel" | "leaveq" => {
                let base = self.fp_base(at, state)?;
                self.set_frame(at, state, base - 1)?;
                state.fp_base = None;
            }
            "ret" | "retl" | "retq" => return Ok(Flow::Stop),
            "jmp" | "jmpl" | "jmpq" => {
                if let Some(Operand::Indirect(target)) = ops.first() {
                    if let Some(table) = self.jump_table(target) {
                        return self.switch(at, state, table);
                    }
                }
                return Ok(match ops.first() {
                    Some(Operand::Symbol(target)) if self.labels.contains_key(target) => Flow::Propagate {
                        target: *target,
                        stop: true,
                    },
                    _ => {
                        debug!("{}: tail call at line {}", self.name, self.lines[at].number);
                        Flow::Stop
                    }
                })
            }
            m if is_conditional_jump(m) => {
                return match ops.first() {
                    Some(Operand::Symbol(target)) => Ok(Flow::Propagate {
                        target: *target,
                        stop: false,
                    }),
                    _ => Err(self.error(at, Some(&*state), FrameErrorKind::UnrecognizedOperation)),
                }
            }
            m if is_call(m) => return self.call(at, state, insn),
            m if is_implicit_sp_write(m) => {
                return Err(self.error(at, Some(&*state), FrameErrorKind::UnrecognizedOperation));
            }
            m if writes_sp && !m.starts_with("cmp") && !m.starts_with("test") => {
                return Err(self.error(at, Some(&*state), FrameErrorKind::UnrecognizedOperation));
            }
            m if m.starts_with("xchg") && ops.iter().any(|op| op.is_reg_in(SP_NAMES)) => {
                return Err(self.error(at, Some(&*state), FrameErrorKind::UnrecognizedOperation));
            }
            _ => {
                if writes_fp {
                    state.fp_base = None;
                }
            }
        }
        trace!("{}: {} -> frame {}", self.name, self.lines[at].text.trim(), state.frame.frame_size);
        Ok(Flow::Next)
    }

    fn call(&mut self, at: usize, state: &WalkState, insn: &Insn<'a>) -> Result<Flow<'a>, FrameAnalysisError> {
        if let Some(Operand::Symbol(name)) = insn.operands.first() {
            if self.policy.is_noreturn(name) {
                self.calls.insert(at, CallOutcome::Exempt);
                return Ok(Flow::Stop);
            }
            if self.policy.is_no_gc(name) {
                self.calls.insert(at, CallOutcome::Exempt);
                return Ok(Flow::Next);
            }
        }
        if let Some(&root) = state.frame.roots.iter().find(|&&r| !state.frame.contains(r)) {
            let kind = FrameErrorKind::RootOutsideFrame {
                offset: root,
                frame_size: state.frame.frame_size,
            };
            return Err(self.error(at, Some(&*state), kind));
        }
        debug!("{}: call at line {} with {}", self.name, self.lines[at].number, state.frame);
        self.calls.insert(at, CallOutcome::Recorded(state.frame.clone()));
        Ok(Flow::Next)
    }

    /// Label the return address of every recorded call and write the
    /// function back out.
    fn finish(
        &self,
        labels: &mut LabelGenerator,
        out: &mut Vec<String>,
        descriptors: &mut Vec<CallSiteDescriptor>,
    ) {
        for (at, parsed) in self.lines.iter().enumerate() {
            out.push(parsed.text.to_string());
            let Some(CallOutcome::Recorded(state)) = self.calls.get(&at) else {
                continue;
            };
            let label = match self.existing_return_label(at) {
                Some(name) => name.to_string(),
                None => {
                    let name = labels.next_for(self.name);
                    out.push(format!("\t.globl\t{name}"));
                    out.push(format!("{name}:"));
                    name
                }
            };
            descriptors.push(CallSiteDescriptor {
                label,
                state: state.clone(),
            });
        }
    }

    /// A `.globl NAME` / `NAME:` pair directly after the call at `at`.
    fn existing_return_label(&self, at: usize) -> Option<&'a str> {
        let mut rest = self.lines[at + 1..]
            .iter()
            .filter(|p| !matches!(p.line, Line::Blank));
        match (rest.next().map(|p| &p.line), rest.next().map(|p| &p.line)) {
            (Some(Line::Globl(g)), Some(Line::Label(l))) if g == l => Some(*l),
            _ => None,
        }
    }
}

fn is_call(mnemonic: &str) -> bool {
    matches!(mnemonic, "call" | "calll" | "callq")
}

fn is_conditional_jump(mnemonic: &str) -> bool {
    mnemonic.starts_with('j') && !mnemonic.starts_with("jmp")
}

fn is_implicit_sp_write(mnemonic: &str) -> bool {
    mnemonic.starts_with("push")
        || mnemonic.starts_with("pop")
        || mnemonic.starts_with("enter")
        || mnemonic.starts_with("leave")
        || mnemonic.starts_with("ret")
}

/// Result of tracking a whole listing.
#[derive(Debug, Clone)]
pub struct TrackedModule {
    /// The input listing with return-address labels added after calls.
    pub listing: String,
    /// Call sites of every function, in listing order.
    pub descriptors: Vec<CallSiteDescriptor>,
    /// Names of the functions tracked.
    pub functions: Vec<String>,
    pub gcmap: GcMap,
}

/// Runs the tracker over assembly listings.
#[derive(Debug, Clone)]
pub struct GcRootTracker {
    config: BackendConfig,
}

impl GcRootTracker {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Track every function in `listing` and build its GC map.
    pub fn run(&self, listing: &str) -> BackendResult<TrackedModule> {
        let mut labels = LabelGenerator::new(self.config.label_prefix.clone());
        for text in listing.lines() {
            if let Ok(Line::Label(name)) = Line::parse(text) {
                labels.reserve(name);
            }
        }

        let mut out = Vec::new();
        let mut descriptors = Vec::new();
        let mut functions = Vec::new();
        let word = i64::from(self.config.target.word_size());
        let policy = &self.config.call_policy;

        let mut lines = listing.lines().enumerate().map(|(i, text)| (i + 1, text));
        while let Some((number, text)) = lines.next() {
            let line = Line::parse(text).map_err(|kind| outside_function(number, text, kind))?;
            match line {
                Line::FunctionStart(name) => {
                    out.push(text.to_string());
                    let arena = Bump::new();
                    let mut tracker = FunctionTracker::new(&arena, name, word, policy);
                    collect_function(&mut tracker, &mut lines)?;
                    tracker.run()?;
                    let before = descriptors.len();
                    tracker.finish(&mut labels, &mut out, &mut descriptors);
                    debug!("tracked {name}: {} call sites", descriptors.len() - before);
                    functions.push(name.to_string());
                }
                Line::FunctionEnd(_) => {
                    return Err(outside_function(number, text, FrameErrorKind::UnbalancedFunction).into());
                }
                _ => out.push(text.to_string()),
            }
        }

        let mut listing_out = out.join("\n");
        if listing.ends_with('\n') {
            listing_out.push('\n');
        }
        let gcmap = GcMap::new(self.config.target, descriptors.clone())?;
        Ok(TrackedModule {
            listing: listing_out,
            descriptors,
            functions,
            gcmap,
        })
    }
}

fn outside_function(number: usize, text: &str, kind: FrameErrorKind) -> FrameAnalysisError {
    FrameAnalysisError {
        function: String::new(),
        line: number,
        text: text.to_string(),
        state: None,
        kind,
    }
}

/// Feed the lines up to the matching `.size` into `tracker`, leaving
/// inline assembly out. The `.size` line itself is kept as the last line.
fn collect_function<'a, I>(tracker: &mut FunctionTracker<'a, '_>, lines: &mut I) -> Result<(), FrameAnalysisError>
where
    I: Iterator<Item = (usize, &'a str)>,
{
    let mut inline_asm = false;
    let mut last = 0;
    for (number, text) in lines.by_ref() {
        last = number;
        let line = Line::parse(text).map_err(|kind| FrameAnalysisError {
            function: tracker.name.to_string(),
            line: number,
            text: text.to_string(),
            state: None,
            kind,
        });
        let line = match line {
            Ok(line) => line,
            Err(_) if inline_asm => Line::Blank,
            Err(e) => return Err(e),
        };
        match line {
            Line::InlineAsmStart => {
                inline_asm = true;
                tracker.push(number, text, Line::Blank)?;
            }
            Line::InlineAsmEnd => {
                inline_asm = false;
                tracker.push(number, text, Line::Blank)?;
            }
            _ if inline_asm => tracker.push(number, text, Line::Blank)?,
            Line::FunctionEnd(name) if name == tracker.name => {
                tracker.push(number, text, Line::Directive)?;
                return Ok(());
            }
            Line::FunctionStart(_) | Line::FunctionEnd(_) => {
                tracker.push(number, text, Line::Blank)?;
                let at = tracker.lines.len() - 1;
                return Err(tracker.error(at, None, FrameErrorKind::UnbalancedFunction));
            }
            line => tracker.push(number, text, line)?,
        }
    }
    Err(FrameAnalysisError {
        function: tracker.name.to_string(),
        line: last,
        text: String::new(),
        state: None,
        kind: FrameErrorKind::UnbalancedFunction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::BackendError;
    use crate::core::location::Target;
    use crate::gcroot::gcmap::Shape;

    fn tracker(target: Target) -> GcRootTracker {
        GcRootTracker::new(BackendConfig::for_target(target))
    }

    fn frame_error(result: BackendResult<TrackedModule>) -> FrameAnalysisError {
        match result {
            Err(BackendError::FrameAnalysis(e)) => e,
            other => panic!("expected a frame analysis error, got {other:?}"),
        }
    }

    const SIMPLE_32: &str = "\
\t.text
\t.type\tf, @function
f:
\tpushl\t%ebp
\tmovl\t%esp, %ebp
\tsubl\t$8, %esp
\tmovl\t%eax, -4(%ebp)
\t/* STORE GCROOT -4(%ebp) */
\tpushl\t$1
\tcall\tg
\taddl\t$4, %esp
\t/* LOAD GCROOT -4(%ebp) */
\tleave
\tret
\t.size\tf, .-f
";

    #[test]
    fn test_simple_function() {
        let _ = env_logger::builder().is_test(true).try_init();
        let module = tracker(Target::X86_32).run(SIMPLE_32).unwrap();
        assert_eq!(module.functions, ["f"]);
        assert_eq!(module.descriptors.len(), 1);
        let d = &module.descriptors[0];
        assert_eq!(d.label, "__gcmap_IN_f_0");
        // push ebp, two locals, one argument
        assert_eq!(d.state.frame_size, 4);
        assert_eq!(
            d.state.shape(),
            Shape {
                frame_size: 4,
                offsets: vec![2]
            }
        );
        assert!(module
            .listing
            .contains("\tcall\tg\n\t.globl\t__gcmap_IN_f_0\n__gcmap_IN_f_0:\n\taddl\t$4, %esp\n"));
        assert!(module.listing.ends_with(".size\tf, .-f\n"));
        assert_eq!(module.gcmap.len(), 1);
    }

    #[test]
    fn test_existing_return_label_is_reused() {
        let _ = env_logger::builder().is_test(true).try_init();
        let listing = "\
\t.type\tf, @function
f:
\tpushq\t%rbp
\tmovq\t%rsp, %rbp
\tcall\tg
\t.globl\t__gcmap_IN_f_0
__gcmap_IN_f_0:
\tcall\th
\tpopq\t%rbp
\tret
\t.size\tf, .-f
";
        let module = tracker(Target::X86_64).run(listing).unwrap();
        let labels: Vec<&str> = module.descriptors.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, ["__gcmap_IN_f_0", "__gcmap_IN_f_1"]);
        assert_eq!(module.listing.matches("__gcmap_IN_f_0:").count(), 1);
        assert!(module.listing.contains("\tcall\th\n\t.globl\t__gcmap_IN_f_1\n__gcmap_IN_f_1:\n"));
    }

    #[test]
    fn test_branches_join_with_same_state() {
        let _ = env_logger::builder().is_test(true).try_init();
        let listing = "\
\t.type\tf, @function
f:
\tpushq\t%rbp
\tmovq\t%rsp, %rbp
\tsubq\t$16, %rsp
\t/* STORE GCROOT -8(%rbp) */
\tcmpq\t$0, %rdi
\tje\t.L1
\tcall\tg
\tjmp\t.L2
.L1:
\tcall\th
.L2:
\t/* LOAD GCROOT -8(%rbp) */
\tmovq\t%rbp, %rsp
\tpopq\t%rbp
\tret
\t.size\tf, .-f
";
        let module = tracker(Target::X86_64).run(listing).unwrap();
        assert_eq!(module.descriptors.len(), 2);
        for d in &module.descriptors {
            assert_eq!(d.state.frame_size, 3);
            assert_eq!(d.state.shape().offsets, vec![1]);
        }
        assert_eq!(module.gcmap.shapes().len(), 1);
    }

    #[test]
    fn test_loop_reaches_fixed_point() {
        let listing = "\
\t.type\tf, @function
f:
\tpushl\t%ebx
.Lloop:
\tcall\tg
\tdecl\t%ebx
\tjne\t.Lloop
\tpopl\t%ebx
\tret
\t.size\tf, .-f
";
        let module = tracker(Target::X86_32).run(listing).unwrap();
        assert_eq!(module.descriptors.len(), 1);
        assert_eq!(module.descriptors[0].state.frame_size, 1);
    }

    #[test]
    fn test_double_store() {
        let listing = "\
\t.type\tf, @function
f:
\tpushl\t%ebp
\tmovl\t%esp, %ebp
\tsubl\t$4, %esp
\t/* STORE GCROOT -4(%ebp) */
\t/* STORE GCROOT -4(%ebp) */
\tleave
\tret
\t.size\tf, .-f
";
        let err = frame_error(tracker(Target::X86_32).run(listing));
        assert_eq!(err.kind, FrameErrorKind::DoubleStore { offset: -2 });
        assert_eq!(err.function, "f");
        assert_eq!(err.line, 7);
        assert_eq!(err.state.unwrap().roots.len(), 1);
    }

    #[test]
    fn test_divergent_join() {
        let listing = "\
\t.type\tf, @function
f:
\ttestl\t%eax, %eax
\tje\t.L1
\tpushl\t%eax
.L1:
\tret
\t.size\tf, .-f
";
        let err = frame_error(tracker(Target::X86_32).run(listing));
        match err.kind {
            FrameErrorKind::DivergentJoin { label, first, second } => {
                assert_eq!(label, ".L1");
                assert_eq!(first.frame_size, 0);
                assert_eq!(second.frame_size, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tail_call_and_noreturn() {
        let listing = "\
\t.type\tf, @function
f:
\ttestq\t%rdi, %rdi
\tje\t.L1
\tjmp\tother
.L1:
\tcall\tabort
\t.size\tf, .-f
";
        let module = tracker(Target::X86_64).run(listing).unwrap();
        assert!(module.descriptors.is_empty());
        assert!(!module.listing.contains(".globl"));
    }

    #[test]
    fn test_unreached_call() {
        let listing = "\
\t.type\tf, @function
f:
\tret
\tcall\tg
\t.size\tf, .-f
";
        let err = frame_error(tracker(Target::X86_64).run(listing));
        assert_eq!(err.kind, FrameErrorKind::UnreachedCall);
        assert_eq!(err.line, 4);
        assert_eq!(err.text, "\tcall\tg");
    }

    #[test]
    fn test_no_gc_call_is_not_recorded() {
        let config = BackendConfig::for_target(Target::X86_64)
            .with_call_policy(CallPolicy::default().with_no_gc(["memcpy"]));
        let listing = "\
\t.type\tf, @function
f:
\tcall\tmemcpy
\tcall\tg
\tret
\t.size\tf, .-f
";
        let module = GcRootTracker::new(config).run(listing).unwrap();
        let labels: Vec<&str> = module.descriptors.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, ["__gcmap_IN_f_0"]);
        assert!(module.listing.contains("\tcall\tg\n\t.globl\t__gcmap_IN_f_0\n"));
    }
}
