// This module defines the error families of the back end using thiserror. EncodingError
// covers requests the instruction encoder has no form for, operands that violate the
// location invariants, and label or branch fixups that cannot be resolved.
// FrameAnalysisError is raised by the GC root tracker and always carries the function,
// the offending assembly line and the partial frame state it had reached, with the
// specific violation in FrameErrorKind. ReconciliationError reports malformed move sets
// handed to the frame reconciler, and GcMapError reports failures while building,
// resolving or decoding the GC map artifact. BackendError wraps all of them so a
// pipeline can propagate any stage failure with `?`; BackendResult<T> is the alias.
// Every one of these aborts the stage: there is no partial GC map on error.

//! Error types for the back end.

use thiserror::Error;

use super::location::{Location, Reg, Target};
use crate::gcroot::gcmap::FrameState;

/// The encoder cannot produce bytes for a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("no encoding for {mnemonic} with operand codes ({operands})")]
    NoEncoding {
        mnemonic: &'static str,
        operands: String,
    },

    #[error("register {reg} does not exist on {target}")]
    RegisterOutOfRange { reg: Reg, target: Target },

    #[error("immediate {value} does not fit in {width} bytes")]
    ImmediateOutOfRange { value: i64, width: u8 },

    #[error("displacement {value} does not fit in a signed 32-bit field")]
    DisplacementOutOfRange { value: i64 },

    #[error("{reg} cannot be used as an index register")]
    InvalidIndexRegister { reg: Reg },

    #[error("invalid scale factor {0}")]
    InvalidScale(u8),

    #[error("{reg} has no byte-sized form on {target}")]
    NoByteRegister { reg: Reg, target: Target },

    #[error("a scratch register is required but none is configured")]
    NoScratchRegister,

    #[error("scratch register {reg} is also an operand")]
    ScratchClobbered { reg: Reg },

    #[error("{template}: operand {index} should be {expected}, got {actual}")]
    OperandMismatch {
        template: &'static str,
        index: usize,
        expected: &'static str,
        actual: String,
    },

    #[error("stack slot offset {offset} is not word aligned")]
    MisalignedStackSlot { offset: i32 },

    #[error("label {0} was never bound")]
    UnboundLabel(usize),

    #[error("label {0} is bound twice")]
    LabelRebound(usize),

    #[error("branch displacement {0} does not fit in 32 bits")]
    BranchOutOfRange(i64),
}

/// What the tracker found wrong.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameErrorKind {
    #[error("label `{label}` is reached with {first} and with {second}")]
    DivergentJoin {
        label: String,
        first: FrameState,
        second: FrameState,
    },

    #[error("stack pointer moves above the function entry")]
    StackUnderflow,

    #[error("root slot {offset} stored twice without an intervening load")]
    DoubleStore { offset: i32 },

    #[error("root slot {offset} loaded but it is not live")]
    LoadOfDeadRoot { offset: i32 },

    #[error("unrecognized operation on the stack pointer")]
    UnrecognizedOperation,

    #[error("call is not reachable from the function entry")]
    UnreachedCall,

    #[error("branch to unknown label `{0}`")]
    UnknownLabel(String),

    #[error("label `{0}` is defined twice")]
    DuplicateLabel(String),

    #[error("stack adjustment of {0} bytes is not a whole number of words")]
    MisalignedAdjustment(i64),

    #[error("root slot {offset} is outside the {frame_size}-word frame")]
    RootOutsideFrame { offset: i32, frame_size: u32 },

    #[error("frame-pointer access before the prologue")]
    NoFramePointer,

    #[error("function start and end markers do not match")]
    UnbalancedFunction,

    #[error("malformed GC root marker")]
    MalformedMarker,
}

/// A tracker failure with enough context to find the offending line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("in `{function}` at line {line} (`{text}`): {kind}")]
pub struct FrameAnalysisError {
    pub function: String,
    /// 1-based line number in the input listing.
    pub line: usize,
    pub text: String,
    /// State reached just before the offending line, when known.
    pub state: Option<FrameState>,
    #[source]
    pub kind: FrameErrorKind,
}

/// Malformed input to the frame reconciler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationError {
    #[error("{sources} sources but {destinations} destinations")]
    LengthMismatch { sources: usize, destinations: usize },

    #[error("{dest} is assigned both {first} and {second}")]
    ConflictingSources {
        dest: Location,
        first: Location,
        second: Location,
    },

    #[error("{0} cannot be a move destination")]
    InvalidDestination(Location),

    #[error("{0} cannot be a move source")]
    InvalidSource(Location),

    #[error("scratch register {0} holds a live value")]
    ScratchInUse(Reg),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Building, resolving or decoding the GC map failed.
#[derive(Error, Debug)]
pub enum GcMapError {
    #[error("return address {0:#x} appears twice")]
    DuplicateAddress(u64),

    #[error("label `{0}` has no resolved address")]
    UnresolvedLabel(String),

    #[error("label `{0}` is recorded twice")]
    DuplicateLabel(String),

    #[error("GC map blob is truncated")]
    Truncated,

    #[error("entry {entry} points at shape offset {offset}, which is not a shape")]
    BadShapeOffset { entry: usize, offset: u32 },

    #[error("negative count {0} in shape table")]
    NegativeCount(i32),

    #[error("object writer failed: {0}")]
    Object(#[from] object::write::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Any back-end failure.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    FrameAnalysis(#[from] FrameAnalysisError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    #[error(transparent)]
    GcMap(#[from] GcMapError),
}

/// Result type alias for back-end operations.
pub type BackendResult<T> = Result<T, BackendError>;
