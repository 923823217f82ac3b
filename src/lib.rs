//! asmgcroot - x86 back end with precise GC stack maps.
//!
//! Encodes abstract operations into x86-32/x86-64 machine code, reconciles
//! register/stack assignments at control-flow joins, and re-walks the
//! emitted assembly to build the table a garbage collector consults to find
//! live pointers on the native stack at every call.
//!
//! # Primary Usage
//!
//! ```ignore
//! use asmgcroot::core::{regs, BackendConfig, Location, StackSlot};
//! use asmgcroot::x64::CodeBuilder;
//! use asmgcroot::gcroot::GcRootTracker;
//!
//! let config = BackendConfig::default();
//! let mut code = CodeBuilder::new(&config);
//! code.begin_function("f");
//! code.prologue(1)?;
//! code.mov(Location::stack(-8), regs::RDI)?;
//! code.store_gcroot(StackSlot::new(-8, 1));
//! code.call_symbol("g")?;
//! code.load_gcroot(StackSlot::new(-8, 1));
//! code.epilogue()?;
//! let asm = code.finish()?;
//!
//! let module = GcRootTracker::new(config).run(&asm.listing)?;
//! let table = module.gcmap.resolve(|label| asm.label_addresses(0x40_0000).get(label).copied())?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Locations, errors and configuration
//! - [`x64`] - Instruction templates, encoder and code builder
//! - [`reconciler`] - Parallel move resolution at control-flow joins
//! - [`gcroot`] - GC root tracker, GC map and its emission

pub mod core;
pub mod gcroot;
pub mod reconciler;
pub mod x64;

pub use core::{
    // Locations
    Location, LocationCode, MemOperand, Reg, RegClass, StackSlot, Target,
    // Errors
    BackendError, BackendResult, EncodingError, FrameAnalysisError, FrameErrorKind, GcMapError,
    ReconciliationError,
    // Configuration
    BackendConfig, CallPolicy,
};
pub use gcroot::{CallSiteDescriptor, FrameState, GcMap, GcMapTable, GcRootTracker, Shape, TrackedModule};
pub use reconciler::{remap_frame_layout, MoveEmitter};
pub use x64::{AssembledCode, CodeBuilder};
