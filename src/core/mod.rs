// This module gathers the target-independent pieces every back-end stage depends on:
// the location model (registers, stack slots, immediates, memory operands and the
// single-character location codes the encoder dispatches on), the error families
// together with the BackendError wrapper, and the BackendConfig/CallPolicy pair that
// selects the target, the reserved scratch register and the safe-point whitelist.

//! Core back-end infrastructure
//!
//! # Key Components
//!
//! ## Locations (`location`)
//! - `Location` and its `LocationCode`
//! - `Reg`, `StackSlot`, `MemOperand`, `Target`
//!
//! ## Errors (`error`)
//! - One `thiserror` enum per stage plus `BackendError`
//!
//! ## Configuration (`config`)
//! - `BackendConfig` with environment overlay
//! - `CallPolicy` for calls exempt from safe-point recording

pub mod config;
pub mod error;
pub mod location;

pub use config::{BackendConfig, CallPolicy};

pub use error::{
    BackendError,
    BackendResult,
    EncodingError,
    FrameAnalysisError,
    FrameErrorKind,
    GcMapError,
    ReconciliationError,
};

pub use location::{
    regs,
    Location,
    LocationCode,
    MemOperand,
    Reg,
    RegClass,
    StackSlot,
    Target,
};
