//! URCL Code Generator - Native Interpreter
//!
//! Executes a finished instruction/label stream directly, without going
//! through a generated text form. The [`Machine`] owns all run state and
//! exposes the step/run surface a debugger front end drives.

pub mod machine;

pub use machine::{Machine, VmError};
