//! Common types for the URCL code generator
//!
//! Shared error and diagnostic types used by the instruction model, the
//! backend targets, and the driver.

pub mod diagnostics;
pub mod error;

pub use diagnostics::{Diagnostic, DiagnosticSink, Severity};
pub use error::UrclError;
