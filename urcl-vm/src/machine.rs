//! Direct execution of a finished instruction stream
//!
//! The machine decodes a [`Program`] once: labels collapse to position
//! constants and each step dispatches over the instruction union. All
//! mutable run state lives in one explicit context value, which is also
//! the surface a debugger drives: instruction pointer, halt and break
//! flags, stack, memory and named register values, with `step` and `run`
//! as the only entry points.
//!
//! Semantics follow the interpreted-VM target: division floors, negative
//! addresses index the stack (address `-n-1` is stack slot `n`), popping
//! below the stack's depth is a runtime fault.

use log::warn;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use urcl_core::{Instruction, Opcode, Operand, Program, Reg};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    #[error("Stack underflow occurred")]
    StackUnderflow,

    #[error("Instruction pointer is out of bounds: {0}")]
    IpOutOfBounds(i64),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Unknown label .{0}")]
    UnknownLabel(String),
}

fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

fn shift_left(value: i64, amount: i64) -> i64 {
    value.wrapping_shl(amount.clamp(0, 63) as u32)
}

fn shift_right(value: i64, amount: i64) -> i64 {
    value >> amount.clamp(0, 63)
}

/// Execution context for one program
pub struct Machine {
    program: Vec<Instruction>,
    sources: Vec<String>,
    labels: HashMap<String, i64>,
    registers: BTreeMap<u32, i64>,
    sp: i64,
    ip: i64,
    halt: bool,
    brk: bool,
    ram: BTreeMap<i64, i64>,
    stack: Vec<i64>,
}

impl Machine {
    /// Decode a program into a fresh machine
    pub fn load(program: &Program) -> Self {
        let labels = program
            .label_positions()
            .into_iter()
            .map(|(name, position)| (name, position as i64))
            .collect();
        let sources = program
            .instructions
            .iter()
            .map(|inst| inst.to_string())
            .collect();

        // Every referenced general register gets a named slot up front so
        // a debugger sees the full register file from the start.
        let mut registers = BTreeMap::new();
        for inst in &program.instructions {
            for operand in inst.operands() {
                if let Operand::Reg(Reg::General(n)) = operand {
                    registers.insert(*n, 0);
                }
            }
        }

        Self {
            program: program.instructions.clone(),
            sources,
            labels,
            registers,
            sp: 0,
            ip: 0,
            halt: false,
            brk: false,
            ram: BTreeMap::new(),
            stack: Vec::new(),
        }
    }

    pub fn ip(&self) -> i64 {
        self.ip
    }

    pub fn halted(&self) -> bool {
        self.halt
    }

    /// Whether the last run stopped at a BRK
    pub fn interrupted(&self) -> bool {
        self.brk
    }

    pub fn stack(&self) -> &[i64] {
        &self.stack
    }

    pub fn ram(&self) -> &BTreeMap<i64, i64> {
        &self.ram
    }

    pub fn register(&self, reg: Reg) -> i64 {
        match reg {
            Reg::Zero => 0,
            Reg::Sp => self.sp,
            Reg::General(n) => self.registers.get(&n).copied().unwrap_or(0),
        }
    }

    /// Named register values in numeric order, stack pointer first
    pub fn registers(&self) -> Vec<(String, i64)> {
        let mut result = vec![("SP".to_string(), self.sp)];
        for (&n, &value) in &self.registers {
            result.push((format!("R{}", n), value));
        }
        result
    }

    pub fn set_register(&mut self, reg: Reg, value: i64) {
        self.write_reg(reg, value);
    }

    /// Canonical source text of the instruction at a position
    pub fn source_at(&self, position: usize) -> Option<&str> {
        self.sources.get(position).map(String::as_str)
    }

    fn get(&self, addr: i64) -> i64 {
        if addr < 0 {
            let index = (-addr - 1) as usize;
            self.stack.get(index).copied().unwrap_or(0)
        } else {
            self.ram.get(&addr).copied().unwrap_or(0)
        }
    }

    fn set(&mut self, addr: i64, value: i64) {
        if addr < 0 {
            let index = (-addr - 1) as usize;
            while self.stack.len() <= index {
                self.stack.push(0);
            }
            self.stack[index] = value;
        } else {
            self.ram.insert(addr, value);
        }
    }

    fn value(&self, operand: &Operand) -> Result<i64, VmError> {
        match operand {
            Operand::Reg(reg) => Ok(self.register(*reg)),
            Operand::Label(label) => self
                .labels
                .get(label.name())
                .copied()
                .ok_or_else(|| VmError::UnknownLabel(label.name().to_string())),
            Operand::Imm(value) => Ok(*value),
        }
    }

    fn write_reg(&mut self, reg: Reg, value: i64) {
        match reg {
            // Writes to R0 are discarded
            Reg::Zero => {}
            Reg::Sp => self.sp = value,
            Reg::General(n) => {
                self.registers.insert(n, value);
            }
        }
    }

    fn write_operand(&mut self, operand: &Operand, value: i64) {
        match operand {
            Operand::Reg(reg) => self.write_reg(*reg, value),
            other => warn!("destination {} is not a register, result discarded", other),
        }
    }

    fn push(&mut self, value: i64) {
        self.sp -= 1;
        let sp = self.sp;
        self.set(sp, value);
    }

    fn pop(&mut self) -> Result<i64, VmError> {
        if self.sp >= 0 {
            return Err(VmError::StackUnderflow);
        }
        let value = self.get(self.sp);
        self.sp += 1;
        Ok(value)
    }

    fn unsupported(&self, inst: &Instruction) {
        warn!(
            "\"{}\" does not take {} operands, treating as NOP",
            inst.opcode(),
            inst.arity()
        );
    }

    /// Execute exactly one instruction
    ///
    /// Advances the instruction pointer by one unless the instruction
    /// redirected it (jumps account for the increment themselves).
    pub fn step(&mut self) -> Result<(), VmError> {
        if self.ip < 0 || self.ip >= self.program.len() as i64 {
            return Err(VmError::IpOutOfBounds(self.ip));
        }
        let inst = self.program[self.ip as usize].clone();
        self.execute(&inst)?;
        self.ip += 1;
        Ok(())
    }

    /// Run until halt, break or error
    pub fn run(&mut self) -> Result<(), VmError> {
        self.brk = false;
        while !self.halt {
            self.step()?;
            if self.brk {
                break;
            }
        }
        Ok(())
    }

    fn execute(&mut self, inst: &Instruction) -> Result<(), VmError> {
        match inst {
            Instruction::Nullary(op) => match op {
                Opcode::Nop => {}
                Opcode::Hlt => self.halt = true,
                Opcode::Brk => self.brk = true,
                Opcode::Ret => {
                    // The stored value is the CAL position; the step
                    // increment resumes right after it.
                    self.ip = self.pop()?;
                }
                _ => self.unsupported(inst),
            },

            Instruction::Unary(op, a) => match op {
                Opcode::Psh => {
                    self.sp -= 1;
                    let value = self.value(a)?;
                    let sp = self.sp;
                    self.set(sp, value);
                }
                Opcode::Pop => {
                    let value = self.pop()?;
                    self.write_operand(a, value);
                }
                Opcode::Jmp => {
                    self.ip = self.value(a)? - 1;
                }
                Opcode::Cal => {
                    let target = self.value(a)?;
                    let ip = self.ip;
                    self.push(ip);
                    self.ip = target - 1;
                }
                _ => self.unsupported(inst),
            },

            Instruction::Binary(op, a, b) => match op {
                Opcode::Lod => {
                    let addr = self.value(b)?;
                    let value = self.get(addr);
                    self.write_operand(a, value);
                }
                Opcode::Str => {
                    let addr = self.value(a)?;
                    let value = self.value(b)?;
                    self.set(addr, value);
                }
                Opcode::Mov | Opcode::Imm => {
                    let value = self.value(b)?;
                    self.write_operand(a, value);
                }
                Opcode::Lsh => {
                    let value = shift_left(self.value(b)?, 1);
                    self.write_operand(a, value);
                }
                Opcode::Rsh => {
                    let value = shift_right(self.value(b)?, 1);
                    self.write_operand(a, value);
                }
                Opcode::Inc => {
                    let value = self.value(b)?.wrapping_add(1);
                    self.write_operand(a, value);
                }
                Opcode::Dec => {
                    let value = self.value(b)?.wrapping_sub(1);
                    self.write_operand(a, value);
                }
                Opcode::Not => {
                    let value = !self.value(b)?;
                    self.write_operand(a, value);
                }
                Opcode::Brz => {
                    if self.value(b)? == 0 {
                        self.ip = self.value(a)? - 1;
                    }
                }
                Opcode::Bnz => {
                    if self.value(b)? != 0 {
                        self.ip = self.value(a)? - 1;
                    }
                }
                Opcode::Cpy => {
                    let source = self.value(b)?;
                    let target = self.value(a)?;
                    let value = self.get(source);
                    self.set(target, value);
                }
                _ => self.unsupported(inst),
            },

            Instruction::Ternary(op, a, b, c) => {
                let is_branch = matches!(
                    op,
                    Opcode::Bre | Opcode::Bne | Opcode::Brl | Opcode::Ble | Opcode::Brg | Opcode::Bge
                );
                if is_branch {
                    let x = self.value(b)?;
                    let y = self.value(c)?;
                    let taken = match op {
                        Opcode::Bre => x == y,
                        Opcode::Bne => x != y,
                        Opcode::Brl => x < y,
                        Opcode::Ble => x <= y,
                        Opcode::Brg => x > y,
                        _ => x >= y,
                    };
                    if taken {
                        self.ip = self.value(a)? - 1;
                    }
                    return Ok(());
                }

                let x = self.value(b)?;
                let y = self.value(c)?;
                let result = match op {
                    Opcode::Add => x.wrapping_add(y),
                    Opcode::Sub => x.wrapping_sub(y),
                    Opcode::Mlt => x.wrapping_mul(y),
                    Opcode::Div => {
                        if y == 0 {
                            return Err(VmError::DivisionByZero);
                        }
                        floor_div(x, y)
                    }
                    Opcode::Mod => {
                        if y == 0 {
                            return Err(VmError::DivisionByZero);
                        }
                        floor_mod(x, y)
                    }
                    Opcode::And => x & y,
                    Opcode::Or => x | y,
                    Opcode::Xor => x ^ y,
                    Opcode::Bsl => shift_left(x, y),
                    Opcode::Bsr => shift_right(x, y),
                    _ => {
                        self.unsupported(inst);
                        return Ok(());
                    }
                };
                self.write_operand(a, result);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use urcl_common::DiagnosticSink;
    use urcl_core::{parse_source, Emitter, EmitterOptions};

    fn machine(source: &str) -> Machine {
        let mut emitter = Emitter::new(EmitterOptions::default());
        let mut sink = DiagnosticSink::new();
        parse_source(source, &mut emitter, &mut sink);
        Machine::load(&emitter.finish())
    }

    #[test]
    fn test_add_sets_destination() {
        let mut m = machine("IMM R2 2\nIMM R3 3\nADD R1 R2 R3\nHLT\n");
        m.run().unwrap();
        assert_eq!(m.register(Reg::General(1)), 5);
        assert!(m.halted());
    }

    #[test]
    fn test_division_floors_toward_negative_infinity() {
        let mut m = machine("IMM R2 -7\nIMM R3 2\nDIV R1 R2 R3\nMOD R4 R2 R3\nHLT\n");
        m.run().unwrap();
        assert_eq!(m.register(Reg::General(1)), -4);
        assert_eq!(m.register(Reg::General(4)), 1);
    }

    #[test]
    fn test_division_by_zero_faults() {
        let mut m = machine("DIV R1 R2 R3\nHLT\n");
        assert_eq!(m.run(), Err(VmError::DivisionByZero));
    }

    #[test]
    fn test_branch_loop() {
        let mut m = machine(".loop\nINC R1 R1\nBRL .loop R1 5\nHLT\n");
        m.run().unwrap();
        assert_eq!(m.register(Reg::General(1)), 5);
    }

    #[test]
    fn test_label_binds_position_zero() {
        let m = machine(".loop\nINC R1 R1\nBRZ .loop R1\n");
        assert_eq!(m.value(&Operand::Label(urcl_core::Label::new("loop"))), Ok(0));
    }

    #[test]
    fn test_stack_push_pop() {
        let mut m = machine("IMM R1 9\nPSH R1\nPSH 4\nPOP R2\nPOP R3\nHLT\n");
        m.run().unwrap();
        assert_eq!(m.register(Reg::General(2)), 4);
        assert_eq!(m.register(Reg::General(3)), 9);
        assert_eq!(m.register(Reg::Sp), 0);
    }

    #[test]
    fn test_pop_underflow_faults() {
        let mut m = machine("POP R1\nHLT\n");
        assert_eq!(m.run(), Err(VmError::StackUnderflow));
    }

    #[test]
    fn test_call_and_return() {
        let mut m = machine("JMP .main\n.f\nIMM R1 7\nRET\n.main\nCAL .f\nHLT\n");
        m.run().unwrap();
        assert_eq!(m.register(Reg::General(1)), 7);
        assert!(m.halted());
    }

    #[test]
    fn test_memory_store_load_copy() {
        let mut m = machine("STR 10 42\nCPY 11 10\nLOD R1 11\nHLT\n");
        m.run().unwrap();
        assert_eq!(m.register(Reg::General(1)), 42);
        assert_eq!(m.ram().get(&10), Some(&42));
        assert_eq!(m.ram().get(&11), Some(&42));
    }

    #[test]
    fn test_run_without_halt_faults_at_end() {
        let mut m = machine("NOP\n");
        assert_eq!(m.run(), Err(VmError::IpOutOfBounds(1)));
    }

    #[test]
    fn test_break_suspends_and_resumes() {
        let mut m = machine("IMM R1 1\nBRK\nIMM R1 2\nHLT\n");
        m.run().unwrap();
        assert!(m.interrupted());
        assert!(!m.halted());
        assert_eq!(m.register(Reg::General(1)), 1);
        assert_eq!(m.ip(), 2);

        m.run().unwrap();
        assert!(m.halted());
        assert_eq!(m.register(Reg::General(1)), 2);
    }

    #[test]
    fn test_single_step_drive() {
        let mut m = machine("IMM R1 3\nINC R1 R1\nHLT\n");
        m.step().unwrap();
        assert_eq!(m.ip(), 1);
        assert_eq!(m.register(Reg::General(1)), 3);
        m.step().unwrap();
        assert_eq!(m.register(Reg::General(1)), 4);
        assert_eq!(m.source_at(1), Some("INC R1 R1"));
    }

    #[test]
    fn test_unknown_label_faults() {
        let mut m = machine("JMP .nowhere\nHLT\n");
        assert_eq!(
            m.run(),
            Err(VmError::UnknownLabel("nowhere".to_string()))
        );
    }

    #[test]
    fn test_writes_to_r0_are_discarded() {
        let mut m = machine("MOV R0 5\nADD R1 R0 3\nHLT\n");
        m.run().unwrap();
        assert_eq!(m.register(Reg::Zero), 0);
        assert_eq!(m.register(Reg::General(1)), 3);
    }

    #[test]
    fn test_registers_listing() {
        let mut m = machine("IMM R2 5\nHLT\n");
        m.run().unwrap();
        let registers = m.registers();
        assert_eq!(registers[0], ("SP".to_string(), 0));
        assert!(registers.contains(&("R2".to_string(), 5)));
    }

    #[test]
    fn test_floor_helpers() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-7, 2), -4);
        assert_eq!(floor_div(7, -2), -4);
        assert_eq!(floor_div(-7, -2), 3);
        assert_eq!(floor_mod(-7, 2), 1);
        assert_eq!(floor_mod(7, -2), -1);
    }
}
