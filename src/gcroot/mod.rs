// This module is the GC root tracking stage. `parser` classifies the lines of an AT&T
// listing, `tracker` walks each function to a fixed point and records the frame state
// at every call, `labels` names the return addresses it has to synthesize, `gcmap`
// holds the resulting shapes and the runtime lookup table, and `emit` writes the map
// back out as assembly text or as an ELF object.

//! GC root tracking and the GC map.

pub mod emit;
pub mod gcmap;
pub mod labels;
pub mod parser;
pub mod tracker;

pub use gcmap::{CallSiteDescriptor, FrameState, GcMap, GcMapEntry, GcMapTable, Shape};
pub use labels::LabelGenerator;
pub use tracker::{GcRootTracker, TrackedModule};
