//! URCL source line parser
//!
//! One instruction or label per line. Blank lines and `//` lines produce
//! nothing; a lone whitespace-free `.token` is a label; otherwise commas
//! count as whitespace, a trailing `//` starts a comment, the first token
//! is the case-normalized opcode and up to three tokens follow as
//! operands. Operand-count mismatches against the opcode are not checked
//! here; that stays a backend concern.

use crate::emitter::Emitter;
use crate::inst::{Instruction, Label, Operand, Reg};
use crate::opcode::Opcode;
use thiserror::Error;
use urcl_common::{Diagnostic, DiagnosticSink};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("\"{0}\" is not a valid operation")]
    UnknownOpcode(String),

    #[error("\"{0}\" is not a valid operand")]
    BadOperand(String),
}

/// One parsed source line
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Instruction(Instruction),
    Label(Label),
}

fn parse_operand(token: &str) -> Result<Operand, ParseError> {
    if let Some(reg) = Reg::parse(token) {
        return Ok(Operand::Reg(reg));
    }
    if token.starts_with('.') && token.len() > 1 {
        return Ok(Operand::Label(Label::new(token)));
    }
    token
        .parse::<i64>()
        .map(Operand::Imm)
        .map_err(|_| ParseError::BadOperand(token.to_string()))
}

/// Parse one source line
///
/// `Ok(None)` means the line carries nothing (blank or comment); errors
/// mark the line malformed and are skippable by the caller.
pub fn parse_line(text: &str) -> Result<Option<Line>, ParseError> {
    let text = text.trim();
    if text.is_empty() || text.starts_with("//") {
        return Ok(None);
    }
    if text.starts_with('.') && !text.contains(char::is_whitespace) {
        return Ok(Some(Line::Label(Label::new(text))));
    }

    let code = text.replace(',', " ");
    let code = match code.find("//") {
        Some(position) => &code[..position],
        None => &code[..],
    };

    let mut tokens = code.split_whitespace();
    let mnemonic = match tokens.next() {
        Some(token) => token,
        None => return Ok(None),
    };
    let opcode = Opcode::from_mnemonic(mnemonic)
        .ok_or_else(|| ParseError::UnknownOpcode(mnemonic.to_string()))?;

    // Opcodes never take more than three operands; extra tokens are dropped.
    let mut operands = Vec::new();
    for token in tokens.take(3) {
        operands.push(parse_operand(token)?);
    }

    match Instruction::from_operands(opcode, operands) {
        Some(inst) => Ok(Some(Line::Instruction(inst))),
        None => Ok(None),
    }
}

/// Parse a whole source text into an emitter
///
/// Malformed lines are skipped with a warning diagnostic; blank and
/// comment lines are skipped silently.
pub fn parse_source(source: &str, emitter: &mut Emitter, sink: &mut DiagnosticSink) {
    for (index, text) in source.lines().enumerate() {
        match parse_line(text) {
            Ok(Some(Line::Label(label))) => emitter.mark_label(&label),
            Ok(Some(Line::Instruction(inst))) => emitter.emit(inst),
            Ok(None) => {}
            Err(err) => {
                log::warn!("skipping line {}: {}", index + 1, err);
                sink.warning(Diagnostic::warning(err.to_string()).at_line(index + 1));
            }
        }
    }
}
