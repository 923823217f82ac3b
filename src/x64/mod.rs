// This module groups the x86-32/x86-64 code generation pieces. Templates and their
// encoding steps live in `template`, the static (mnemonic, operand codes) → template
// match table in `forms`, AT&T rendering for the assembly listing in `listing`, the
// byte buffer with labels, relocations and wide-operand synthesis in `builder`, and an
// iced-x86 based decoder used to cross-check emitted bytes in `disasm`.

//! x86 instruction encoding and code emission.

pub mod builder;
pub mod disasm;
pub mod forms;
pub mod listing;
pub mod template;

pub use builder::{AssembledCode, CallRelocation, CodeBuilder, FunctionSymbol, LabelId};
pub use forms::{encode, select, Cond, Mnemonic};
pub use listing::RootMarker;
pub use template::{ImmWidth, Step, Template};
