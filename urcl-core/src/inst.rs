//! URCL instruction and operand model
//!
//! Instructions encode their arity structurally: a nullary instruction has
//! no operand slots at all, so "trailing absent operand" states are not
//! representable. Canonical text form is `OP [A [B [C]]]` with labels
//! printed as `.name`.

use crate::opcode::Opcode;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref REGISTER_RE: Regex = Regex::new(r"^[Rr]([0-9]+)$").unwrap();
}

/// URCL register reference
///
/// `R0` always reads as zero and is never backed by storage; `SP` is the
/// stack pointer; every other register is a numbered general register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reg {
    Zero,
    Sp,
    General(u32),
}

impl Reg {
    /// Parse a register token (`R0`, `SP`, `R7`, case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("SP") {
            return Some(Reg::Sp);
        }
        let caps = REGISTER_RE.captures(s)?;
        let n: u32 = caps[1].parse().ok()?;
        if n == 0 {
            Some(Reg::Zero)
        } else {
            Some(Reg::General(n))
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Zero => write!(f, "R0"),
            Reg::Sp => write!(f, "SP"),
            Reg::General(n) => write!(f, "R{}", n),
        }
    }
}

/// Symbolic label name, stored without the leading `.`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label(String);

impl Label {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        match name.strip_prefix('.') {
            Some(stripped) => Label(stripped.to_string()),
            None => Label(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".{}", self.0)
    }
}

/// One instruction operand
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    Reg(Reg),
    Label(Label),
    Imm(i64),
}

impl From<Reg> for Operand {
    fn from(reg: Reg) -> Self {
        Operand::Reg(reg)
    }
}

impl From<Label> for Operand {
    fn from(label: Label) -> Self {
        Operand::Label(label)
    }
}

impl From<&Label> for Operand {
    fn from(label: &Label) -> Self {
        Operand::Label(label.clone())
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Operand::Imm(value)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{}", reg),
            Operand::Label(label) => write!(f, "{}", label),
            Operand::Imm(value) => write!(f, "{}", value),
        }
    }
}

/// One URCL instruction with structurally encoded arity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    Nullary(Opcode),
    Unary(Opcode, Operand),
    Binary(Opcode, Operand, Operand),
    Ternary(Opcode, Operand, Operand, Operand),
}

impl Instruction {
    pub fn nullary(op: Opcode) -> Self {
        Instruction::Nullary(op)
    }

    pub fn unary(op: Opcode, a: impl Into<Operand>) -> Self {
        Instruction::Unary(op, a.into())
    }

    pub fn binary(op: Opcode, a: impl Into<Operand>, b: impl Into<Operand>) -> Self {
        Instruction::Binary(op, a.into(), b.into())
    }

    pub fn ternary(
        op: Opcode,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
        c: impl Into<Operand>,
    ) -> Self {
        Instruction::Ternary(op, a.into(), b.into(), c.into())
    }

    /// Build an instruction from an opcode and an operand list
    ///
    /// Fails if more than three operands are supplied. The operand count
    /// does not have to match the opcode's expected arity; that check is a
    /// backend concern.
    pub fn from_operands(op: Opcode, mut operands: Vec<Operand>) -> Option<Self> {
        match operands.len() {
            0 => Some(Instruction::Nullary(op)),
            1 => Some(Instruction::Unary(op, operands.remove(0))),
            2 => {
                let b = operands.pop()?;
                let a = operands.pop()?;
                Some(Instruction::Binary(op, a, b))
            }
            3 => {
                let c = operands.pop()?;
                let b = operands.pop()?;
                let a = operands.pop()?;
                Some(Instruction::Ternary(op, a, b, c))
            }
            _ => None,
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Nullary(op)
            | Instruction::Unary(op, _)
            | Instruction::Binary(op, _, _)
            | Instruction::Ternary(op, _, _, _) => *op,
        }
    }

    /// Number of operands actually present
    pub fn arity(&self) -> usize {
        match self {
            Instruction::Nullary(_) => 0,
            Instruction::Unary(_, _) => 1,
            Instruction::Binary(_, _, _) => 2,
            Instruction::Ternary(_, _, _, _) => 3,
        }
    }

    /// Whether the operand count matches the opcode's expected arity
    pub fn arity_matches(&self) -> bool {
        self.arity() == self.opcode().arity()
    }

    /// The operands present, left to right
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Instruction::Nullary(_) => vec![],
            Instruction::Unary(_, a) => vec![a],
            Instruction::Binary(_, a, b) => vec![a, b],
            Instruction::Ternary(_, a, b, c) => vec![a, b, c],
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode())?;
        for operand in self.operands() {
            write!(f, " {}", operand)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_register_parse() {
        assert_eq!(Reg::parse("R0"), Some(Reg::Zero));
        assert_eq!(Reg::parse("r0"), Some(Reg::Zero));
        assert_eq!(Reg::parse("SP"), Some(Reg::Sp));
        assert_eq!(Reg::parse("R12"), Some(Reg::General(12)));
        assert_eq!(Reg::parse("RX"), None);
        assert_eq!(Reg::parse("X3"), None);
    }

    #[test]
    fn test_register_display() {
        assert_eq!(Reg::Zero.to_string(), "R0");
        assert_eq!(Reg::Sp.to_string(), "SP");
        assert_eq!(Reg::General(3).to_string(), "R3");
    }

    #[test]
    fn test_label_strips_dot() {
        let label = Label::new(".loop");
        assert_eq!(label.name(), "loop");
        assert_eq!(label.to_string(), ".loop");
        assert_eq!(Label::new("loop"), label);
    }

    #[test]
    fn test_instruction_display() {
        let inst = Instruction::ternary(
            Opcode::Add,
            Reg::General(1),
            Reg::General(2),
            Reg::General(3),
        );
        assert_eq!(inst.to_string(), "ADD R1 R2 R3");

        let inst = Instruction::unary(Opcode::Jmp, Label::new("loop"));
        assert_eq!(inst.to_string(), "JMP .loop");

        assert_eq!(Instruction::nullary(Opcode::Hlt).to_string(), "HLT");
    }

    #[test]
    fn test_arity_matches() {
        assert!(Instruction::ternary(Opcode::Add, Reg::Sp, Reg::Sp, 1i64).arity_matches());
        assert!(!Instruction::binary(Opcode::Add, Reg::Sp, Reg::Sp).arity_matches());
    }

    #[test]
    fn test_from_operands() {
        let inst = Instruction::from_operands(
            Opcode::Brz,
            vec![Operand::Label(Label::new("loop")), Operand::Reg(Reg::General(1))],
        )
        .unwrap();
        assert_eq!(inst.arity(), 2);
        assert_eq!(inst.opcode(), Opcode::Brz);
    }
}
