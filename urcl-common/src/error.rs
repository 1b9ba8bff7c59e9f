//! Error handling for the URCL code generator
//!
//! This module defines the top-level error type that the driver uses to
//! unify failures from the individual phases.

use thiserror::Error;

/// Main error type that encompasses all phases of code generation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UrclError {
    #[error("Parse error at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Layout error: {message}")]
    LayoutError { message: String },

    #[error("Target error: {message}")]
    TargetError { message: String },

    #[error("Runtime error: {message}")]
    RuntimeError { message: String },

    #[error("IO error: {message}")]
    IoError { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl UrclError {
    /// Create a parse error for a source line
    pub fn parse_error(message: String, line: usize) -> Self {
        UrclError::ParseError { line, message }
    }

    /// Create a runtime error
    pub fn runtime_error(message: String) -> Self {
        UrclError::RuntimeError { message }
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for UrclError {
    fn from(err: std::io::Error) -> Self {
        UrclError::IoError {
            message: err.to_string(),
        }
    }
}

/// Convert from String (for simple error cases)
impl From<String> for UrclError {
    fn from(message: String) -> Self {
        UrclError::InternalError { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = UrclError::parse_error("bad operand".to_string(), 3);
        assert_eq!(err.to_string(), "Parse error at line 3: bad operand");
    }

    #[test]
    fn test_from_string() {
        let err: UrclError = "oops".to_string().into();
        assert_eq!(
            err,
            UrclError::InternalError {
                message: "oops".to_string()
            }
        );
    }
}
