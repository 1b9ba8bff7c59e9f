//! Passthrough target
//!
//! Re-serializes the stream in canonical URCL text form, interleaving
//! each label line before the instruction at its bound position.

use crate::{Target, TargetError};
use urcl_core::Program;

/// The default target: prints the stream back out as URCL
#[derive(Debug, Default)]
pub struct UrclTarget;

impl UrclTarget {
    pub fn new() -> Self {
        Self
    }
}

impl Target for UrclTarget {
    fn emit(&mut self, program: &Program) -> Result<String, TargetError> {
        let mut out = String::new();
        for (position, inst) in program.instructions.iter().enumerate() {
            for label in program.labels_at(position) {
                out.push_str(&format!("{}\n", label));
            }
            out.push_str(&format!("{}\n", inst));
        }
        for label in program.labels_at(program.len()) {
            out.push_str(&format!("{}\n", label));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use urcl_common::DiagnosticSink;
    use urcl_core::{parse_source, Emitter, EmitterOptions, Label};

    fn lower(source: &str) -> String {
        let mut emitter = Emitter::new(EmitterOptions::default());
        let mut sink = DiagnosticSink::new();
        parse_source(source, &mut emitter, &mut sink);
        match UrclTarget::new().emit(&emitter.finish()) {
            Ok(text) => text,
            Err(err) => panic!("passthrough failed: {}", err),
        }
    }

    #[test]
    fn test_label_before_instruction() {
        let out = lower(".loop\nINC R1 R1\nBRZ .loop R1\n");
        assert_eq!(out, ".loop\nINC R1 R1\nBRZ .loop R1\n");
    }

    #[test]
    fn test_sentinel_label_at_end() {
        let mut emitter = Emitter::new(EmitterOptions::default());
        let mut sink = DiagnosticSink::new();
        parse_source("HLT\n", &mut emitter, &mut sink);
        emitter.mark_label(&Label::new("end"));

        let out = match UrclTarget::new().emit(&emitter.finish()) {
            Ok(text) => text,
            Err(err) => panic!("passthrough failed: {}", err),
        };
        assert_eq!(out, "HLT\n.end\n");
    }

    #[test]
    fn test_round_trip_is_stable() {
        let source = ".start\nIMM R1 10\nADD R2 R1 R1\nHLT\n.start2\n";
        let first = lower(source);
        let second = lower(&first);
        assert_eq!(first, second);
    }

    #[test]
    fn test_comma_input_normalizes() {
        let out = lower("ADD R1, R2, R3 // sum\n");
        assert_eq!(out, "ADD R1 R2 R3\n");
    }
}
