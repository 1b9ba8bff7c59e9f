//! URCL Code Generator - Backend Targets
//!
//! Four lowering strategies over a finished [`Program`]:
//!
//! - [`UrclTarget`]: canonical re-serialization
//! - [`PythonTarget`]: interpreted virtual machine as Python source
//! - [`CTarget`]: fixed-array simulator as C source
//! - [`X86Target`]: macro-expanded NASM assembly
//!
//! All targets preserve label positions (including the end-of-stream
//! sentinel) and the same arithmetic/branch/stack semantics; only the
//! surface representation differs. The one deliberate divergence is
//! integer division rounding: the Python output floors, the C output
//! truncates toward zero.

pub mod c;
pub mod python;
pub mod urcl;
pub mod x86;

use thiserror::Error;
use urcl_core::Program;

pub use c::{COptions, CTarget};
pub use python::{PythonOptions, PythonTarget};
pub use urcl::UrclTarget;
pub use x86::{X86Options, X86Target};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TargetError {
    #[error("Word width of {0} is not valid")]
    UnsupportedWidth(u16),

    #[error("Argument {index} of macro {name} is an unresolved placeholder")]
    RecursiveArgument { name: String, index: u8 },

    #[error("Macro {name} invokes itself recursively")]
    RecursiveMacro { name: String },
}

/// A backend lowering strategy
///
/// Consumes the finished emitter state and produces text. Unsupported
/// operand counts are non-fatal: the target leaves a visible comment
/// marker in its output and keeps going.
pub trait Target {
    fn emit(&mut self, program: &Program) -> Result<String, TargetError>;
}
