//! Interpreted-VM target
//!
//! Lowers the stream to Python source: global register/flag/stack state,
//! one callable unit per instruction position with the original source
//! text attached as metadata, a position-indexed dispatch table, and a
//! run routine. The run routine may be invoked on load or left for an
//! external debugger to drive instruction by instruction.
//!
//! Integer division floors here; the array target truncates toward zero.
//! The divergence is deliberate and covered by tests.

use crate::{Target, TargetError};
use log::warn;
use urcl_core::{Opcode, Operand, Program, Reg};

/// Options for the generated Python program
#[derive(Debug, Clone, Default)]
pub struct PythonOptions {
    /// Leave the run loop for an external debugger instead of invoking
    /// it on load
    pub use_debugger: bool,

    /// Print each instruction's source text before executing it
    pub print_instructions: bool,

    /// Print the referenced registers before and after each instruction
    pub print_register_states: bool,

    /// Wait for console input before each instruction
    pub single_step: bool,
}

/// Interpreted-VM lowering to Python source
pub struct PythonTarget {
    options: PythonOptions,
}

impl PythonTarget {
    pub fn new(options: PythonOptions) -> Self {
        Self { options }
    }
}

fn register_name(reg: Reg) -> Option<String> {
    match reg {
        Reg::Zero => None,
        Reg::Sp => Some("SP".to_string()),
        Reg::General(n) => Some(format!("R{}", n)),
    }
}

fn stringify(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn write_prelude(out: &mut String) {
    out.push_str(
        "RAM = {}\nROM = {}\nIP = 0\nHALT = False\nBREAK = False\nSTEP = False\nSTACK = []\n",
    );
    out.push_str("ERR_UNDERFLOW = ValueError(\"Stack underflow occurred.\")\n\n");
    out.push_str(
        "def Get(addr):\n\tglobal RAM\n\tglobal STACK\n\tif addr < 0:\n\t\tif (-addr - 1) < len(STACK):\n\t\t\treturn STACK[-addr - 1]\n\t\telse:\n\t\t\treturn 0\n\telif addr in RAM:\n\t\treturn RAM[addr]\n\telse:\n\t\treturn 0\n\n",
    );
    out.push_str(
        "def Set(addr, value):\n\tglobal RAM\n\tglobal STACK\n\tif addr < 0:\n\t\twhile (-addr - 1) >= len(STACK):\n\t\t\tSTACK += [0]\n\t\tSTACK[-addr - 1] = value\n\telse:\n\t\tRAM[addr] = value\n\n",
    );
    out.push_str(
        "def Execute():\n\tglobal ROM\n\tglobal IP\n\tglobal HALT\n\tglobal BREAK\n\tglobal STEP\n\n\tBREAK = False\n\twhile not HALT:\n\t\tif not IP in ROM:\n\t\t\traise ValueError(\"Instruction pointer is out of bounds.\")\n\t\tROM[IP]()\n\t\tIP += 1\n\t\tif STEP or BREAK:\n\t\t\treturn\n\n",
    );
}

/// Writer for one generated instruction unit
struct UnitWriter<'a> {
    out: &'a mut String,
    used_registers: Vec<String>,
}

impl UnitWriter<'_> {
    fn global(&mut self, name: &str) {
        self.out.push_str(&format!("\tglobal {}\n", name));
    }

    /// Resolve an operand to a Python expression, declaring globals for
    /// registers and label constants as the original operand demands
    fn resolve(&mut self, operand: &Operand) -> String {
        match operand {
            Operand::Reg(reg) => match register_name(*reg) {
                Some(name) => {
                    self.global(&name);
                    if !self.used_registers.contains(&name) {
                        self.used_registers.push(name.clone());
                    }
                    name
                }
                None => "0".to_string(),
            },
            Operand::Label(label) => {
                let name = format!("LABEL_{}", label.name());
                self.global(&name);
                name
            }
            Operand::Imm(value) => value.to_string(),
        }
    }

    fn operation(&mut self, target: &str, a: &str, op: &str, b: &str) {
        if target == "0" {
            // Writes to R0 are discarded
            self.out.push_str("\tpass\n");
        } else if target == a {
            self.out.push_str(&format!("\t{} {}= {}\n", target, op, b));
        } else {
            self.out
                .push_str(&format!("\t{} = {} {} {}\n", target, a, op, b));
        }
    }

    fn assignment(&mut self, target: &str, source: &str) {
        self.operation(target, target, "", source);
    }

    fn conditional(&mut self, a: &str, op: &str, b: &str) {
        self.out.push_str(&format!("\tif {} {} {}:\n\t", a, op, b));
    }

    fn branch(&mut self, target: &str, a: &str, op: &str, b: &str) {
        self.conditional(a, op, b);
        self.operation("IP", target, "-", "1");
    }

    fn exception(&mut self, value: &str) {
        self.out.push_str(&format!("\traise {}\n", value));
    }

    fn load(&mut self, target: &str, address: &str) {
        if target == "0" {
            self.out.push_str("\tpass\n");
        } else {
            self.out
                .push_str(&format!("\t{} = Get({})\n", target, address));
        }
    }

    fn store(&mut self, address: &str, source: &str) {
        self.out
            .push_str(&format!("\tSet({}, {})\n", address, source));
    }

    fn copy(&mut self, target: &str, source: &str) {
        self.out
            .push_str(&format!("\tSet({}, Get({}))\n", target, source));
    }

    fn push(&mut self, source: &str) {
        self.operation("SP", "SP", "-", "1");
        self.store("SP", source);
    }

    fn pop(&mut self, target: &str) {
        self.conditional("SP", ">=", "0");
        self.exception("ERR_UNDERFLOW");
        self.load(target, "SP");
        self.operation("SP", "SP", "+", "1");
    }

    fn print_text(&mut self, text: &str) {
        self.out
            .push_str(&format!("\tprint(\"{}\")\n", stringify(text)));
    }

    fn print_value(&mut self, name: &str) {
        self.out
            .push_str(&format!("\tprint(\"{} = \" + str({}))\n", name, name));
    }
}

impl PythonTarget {
    fn emit_unit(&self, out: &mut String, program: &Program, position: usize) {
        let inst = &program.instructions[position];
        let source_text = inst.to_string();

        out.push_str(&format!("def INST_{}():\n", position));

        let mut writer = UnitWriter {
            out: &mut *out,
            used_registers: Vec::new(),
        };

        if self.options.print_instructions {
            writer.print_text(&format!("\n{}", source_text));
        }

        let exprs: Vec<String> = inst
            .operands()
            .iter()
            .map(|operand| writer.resolve(operand))
            .collect();

        if self.options.print_register_states && !writer.used_registers.is_empty() {
            writer.print_text("Pre-operation registers:");
            for name in writer.used_registers.clone() {
                writer.print_value(&name);
            }
        }

        if self.options.single_step {
            writer
                .out
                .push_str("\tinput(\"Press enter to execute...\")\n");
        }

        let op = inst.opcode();
        match (op, exprs.as_slice()) {
            (Opcode::Nop, []) => {}
            (Opcode::Hlt, []) => {
                writer.global("HALT");
                writer.assignment("HALT", "True");
            }
            (Opcode::Brk, []) => {
                writer.global("BREAK");
                writer.assignment("BREAK", "True");
            }
            (Opcode::Ret, []) => {
                writer.global("IP");
                writer.global("SP");
                writer.pop("IP");
            }

            (Opcode::Psh, [a]) => {
                writer.global("SP");
                writer.push(a);
            }
            (Opcode::Pop, [a]) => {
                writer.global("SP");
                writer.global("ERR_UNDERFLOW");
                writer.pop(a);
            }
            (Opcode::Jmp, [a]) => {
                writer.global("IP");
                writer.operation("IP", a, "-", "1");
            }
            (Opcode::Cal, [a]) => {
                writer.global("IP");
                writer.global("SP");
                writer.push("IP");
                writer.operation("IP", a, "-", "1");
            }

            (Opcode::Lod, [a, b]) => writer.load(a, b),
            (Opcode::Str, [a, b]) => writer.store(a, b),
            (Opcode::Mov, [a, b]) | (Opcode::Imm, [a, b]) => writer.assignment(a, b),
            (Opcode::Lsh, [a, b]) => writer.operation(a, b, "<<", "1"),
            (Opcode::Rsh, [a, b]) => writer.operation(a, b, ">>", "1"),
            (Opcode::Inc, [a, b]) => writer.operation(a, b, "+", "1"),
            (Opcode::Dec, [a, b]) => writer.operation(a, b, "-", "1"),
            (Opcode::Not, [a, b]) => {
                let negated = format!("~{}", b);
                writer.assignment(a, &negated);
            }
            (Opcode::Brz, [a, b]) => {
                writer.global("IP");
                writer.branch(a, b, "==", "0");
            }
            (Opcode::Bnz, [a, b]) => {
                writer.global("IP");
                writer.branch(a, b, "!=", "0");
            }
            (Opcode::Cpy, [a, b]) => writer.copy(a, b),

            (Opcode::Add, [a, b, c]) => writer.operation(a, b, "+", c),
            (Opcode::Sub, [a, b, c]) => writer.operation(a, b, "-", c),
            (Opcode::Mlt, [a, b, c]) => writer.operation(a, b, "*", c),
            (Opcode::Div, [a, b, c]) => writer.operation(a, b, "//", c),
            (Opcode::Mod, [a, b, c]) => writer.operation(a, b, "%", c),
            (Opcode::And, [a, b, c]) => writer.operation(a, b, "&", c),
            (Opcode::Or, [a, b, c]) => writer.operation(a, b, "|", c),
            (Opcode::Xor, [a, b, c]) => writer.operation(a, b, "^", c),
            (Opcode::Bsl, [a, b, c]) => writer.operation(a, b, "<<", c),
            (Opcode::Bsr, [a, b, c]) => writer.operation(a, b, ">>", c),
            (Opcode::Bre, [a, b, c]) => {
                writer.global("IP");
                writer.branch(a, b, "==", c);
            }
            (Opcode::Bne, [a, b, c]) => {
                writer.global("IP");
                writer.branch(a, b, "!=", c);
            }
            (Opcode::Brl, [a, b, c]) => {
                writer.global("IP");
                writer.branch(a, b, "<", c);
            }
            (Opcode::Brg, [a, b, c]) => {
                writer.global("IP");
                writer.branch(a, b, ">", c);
            }
            (Opcode::Ble, [a, b, c]) => {
                writer.global("IP");
                writer.branch(a, b, "<=", c);
            }
            (Opcode::Bge, [a, b, c]) => {
                writer.global("IP");
                writer.branch(a, b, ">=", c);
            }

            (op, exprs) => {
                warn!(
                    "\"{}\" does not take {} operands, emitting error marker",
                    op,
                    exprs.len()
                );
                writer.out.push_str(&format!(
                    "#ERROR: \"{}\" does not take {} operands.\n",
                    op,
                    exprs.len()
                ));
            }
        }

        if self.options.print_register_states && !writer.used_registers.is_empty() {
            writer.print_text("Post-operation registers:");
            for name in writer.used_registers.clone() {
                writer.print_value(&name);
            }
        }

        out.push_str(&format!(
            "\treturn\nINST_{}.Source = \"{}\"\nROM[{}] = INST_{}\n\n",
            position,
            stringify(&source_text),
            position,
            position
        ));
    }
}

impl Target for PythonTarget {
    fn emit(&mut self, program: &Program) -> Result<String, TargetError> {
        let mut out = String::new();
        write_prelude(&mut out);

        // Every distinct register referenced anywhere in the stream gets
        // one named mutable slot; the stack pointer always exists.
        let mut registers = vec!["SP".to_string()];
        for inst in &program.instructions {
            for operand in inst.operands() {
                if let Operand::Reg(reg) = operand {
                    if let Some(name) = register_name(*reg) {
                        if !registers.contains(&name) {
                            registers.push(name);
                        }
                    }
                }
            }
        }
        for name in &registers {
            out.push_str(&format!("{} = 0\n", name));
        }

        // Labels become integer constants equal to their bound position.
        for (&position, labels) in &program.labels {
            for label in labels {
                out.push_str(&format!("LABEL_{} = {}\n", label.name(), position));
            }
        }

        out.push('\n');

        for position in 0..program.len() {
            self.emit_unit(&mut out, program, position);
        }

        if self.options.use_debugger {
            Ok(out)
        } else {
            out.push_str("Execute()");
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use urcl_common::DiagnosticSink;
    use urcl_core::{parse_source, Emitter, EmitterOptions, Instruction};

    fn program(source: &str) -> Program {
        let mut emitter = Emitter::new(EmitterOptions::default());
        let mut sink = DiagnosticSink::new();
        parse_source(source, &mut emitter, &mut sink);
        emitter.finish()
    }

    fn lower(source: &str, options: PythonOptions) -> String {
        match PythonTarget::new(options).emit(&program(source)) {
            Ok(text) => text,
            Err(err) => panic!("python target failed: {}", err),
        }
    }

    #[test]
    fn test_add_unit_sets_destination() {
        let out = lower("ADD R1 R2 R3\n", PythonOptions::default());
        assert!(out.contains("def INST_0():"));
        assert!(out.contains("\tR1 = R2 + R3\n"));
        assert!(out.contains("\tglobal R1\n"));
        assert!(out.contains("ROM[0] = INST_0"));
    }

    #[test]
    fn test_label_constant_is_position() {
        let out = lower(".loop\nINC R1 R1\nBRZ .loop R1\n", PythonOptions::default());
        assert!(out.contains("LABEL_loop = 0\n"));
        // The branch offsets the run loop's own increment
        assert!(out.contains("\tif R1 == 0:\n\t\tIP = LABEL_loop - 1\n"));
    }

    #[test]
    fn test_division_floors() {
        let out = lower("DIV R1 R2 R3\n", PythonOptions::default());
        assert!(out.contains("\tR1 = R2 // R3\n"));
    }

    #[test]
    fn test_register_declarations() {
        let out = lower("ADD R1 R2 R3\n", PythonOptions::default());
        assert!(out.starts_with("RAM = {}\n"));
        assert!(out.contains("SP = 0\n"));
        assert!(out.contains("R1 = 0\n"));
        assert!(out.contains("R3 = 0\n"));
        // R0 is a literal zero, never a declared slot
        assert!(!out.contains("R0 = 0\n"));
    }

    #[test]
    fn test_auto_invoke_and_debugger_modes() {
        let auto = lower("HLT\n", PythonOptions::default());
        assert!(auto.ends_with("Execute()"));

        let debugged = lower(
            "HLT\n",
            PythonOptions {
                use_debugger: true,
                ..PythonOptions::default()
            },
        );
        assert!(!debugged.ends_with("Execute()"));
        assert!(debugged.contains("def Execute():"));
    }

    #[test]
    fn test_pop_guards_underflow() {
        let out = lower("POP R1\n", PythonOptions::default());
        assert!(out.contains("\tif SP >= 0:\n\t\traise ERR_UNDERFLOW\n"));
        assert!(out.contains("\tR1 = Get(SP)\n"));
        assert!(out.contains("\tSP += 1\n"));
    }

    #[test]
    fn test_source_metadata() {
        let out = lower("IMM R1 42\n", PythonOptions::default());
        assert!(out.contains("INST_0.Source = \"IMM R1 42\""));
    }

    #[test]
    fn test_arity_mismatch_is_nonfatal() {
        let mut emitter = Emitter::new(EmitterOptions::default());
        emitter.emit(Instruction::binary(
            Opcode::Add,
            Reg::General(1),
            Reg::General(2),
        ));
        emitter.emit0(Opcode::Hlt);
        let out = match PythonTarget::new(PythonOptions::default()).emit(&emitter.finish()) {
            Ok(text) => text,
            Err(err) => panic!("python target failed: {}", err),
        };
        assert!(out.contains("#ERROR: \"ADD\" does not take 2 operands."));
        // Lowering continues after the bad instruction
        assert!(out.contains("def INST_1():"));
    }

    #[test]
    fn test_instrumentation_hooks() {
        let out = lower(
            "INC R1 R1\n",
            PythonOptions {
                print_instructions: true,
                print_register_states: true,
                single_step: true,
                ..PythonOptions::default()
            },
        );
        assert!(out.contains("\tprint(\"\\nINC R1 R1\")\n"));
        assert!(out.contains("\tprint(\"Pre-operation registers:\")\n"));
        assert!(out.contains("\tprint(\"R1 = \" + str(R1))\n"));
        assert!(out.contains("\tinput(\"Press enter to execute...\")\n"));
        assert!(out.contains("\tprint(\"Post-operation registers:\")\n"));
    }
}
