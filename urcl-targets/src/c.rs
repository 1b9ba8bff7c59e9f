//! Transpiled-array target
//!
//! Lowers the stream to C source over fixed-capacity arrays for main
//! memory and the stack. Out-of-range accesses set a sticky status
//! string instead of raising; the run loop checks the status after every
//! instruction and returns early without crashing.
//!
//! Integer division truncates toward zero here, unlike the Python
//! output's floor. The divergence is deliberate and covered by tests.

use crate::{Target, TargetError};
use log::warn;
use urcl_core::{Opcode, Operand, Program, Reg};

/// Fixed array capacities for the generated simulator
#[derive(Debug, Clone)]
pub struct COptions {
    pub ram_size: usize,
    pub stack_size: usize,
}

impl Default for COptions {
    fn default() -> Self {
        Self {
            ram_size: 4096,
            stack_size: 1024,
        }
    }
}

/// Transpiled-array lowering to C source
pub struct CTarget {
    options: COptions,
}

impl CTarget {
    pub fn new(options: COptions) -> Self {
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

fn write_prelude(out: &mut String, options: &COptions) {
    out.push_str("#define False 0\n#define True 1\n");
    out.push_str("#define sizeof(x) (sizeof(x) / sizeof(int))\n");
    out.push_str(&format!("int RAM[{}];\n", options.ram_size));
    out.push_str(&format!("int STACK[{}];\n", options.stack_size));
    out.push_str("static const char* SUCCESS = \"Success.\";\n");
    out.push_str("static const char* ERR_UNDERFLOW = \"Stack underflow.\";\n");
    out.push_str("int IP = 0;\nint HALT = False;\nint BREAK = False;\nconst char* STATUS = 0;\n\n");
    out.push_str("void Error(const char* msg)\n{\n\tSTATUS = msg;\n}\n\n");
    out.push_str(
        "int Get(int addr)\n{\n\tif (addr < 0)\n\t{\n\t\tif ((-addr - 1) < sizeof(STACK)) return STACK[-addr - 1];\n\t\telse return 0;\n\t}\n\telse if (addr < sizeof(RAM))\n\t{\n\t\treturn RAM[addr];\n\t}\n\telse\n\t{\n\t\tError(\"Data segfault.\");\n\t\treturn 0;\n\t}\n}\n\n",
    );
    out.push_str(
        "void Set(int addr, int value)\n{\n\tif (addr < 0)\n\t{\n\t\tif ((-addr - 1) >= sizeof(STACK)) Error(\"Stack overflow.\");\n\t\tSTACK[-addr - 1] = value;\n\t}\n\telse\n\t{\n\t\tif (addr >= sizeof(RAM)) Error(\"Data segfault.\");\n\t\tRAM[addr] = value;\n\t}\n}\n\n",
    );
}

fn executor() -> &'static str {
    "void Execute()\n{\n\tBREAK = False;\n\tSTATUS = SUCCESS;\n\twhile (!HALT)\n\t{\n\t\tif (IP < 0 || IP >= sizeof(ROM)) Error(\"Code segfault.\");\n\t\tROM[IP]();\n\t\tif (STATUS != SUCCESS) return;\n\t\tIP += 1;\n\t\tif (BREAK) return;\n\t}\n}\n#undef sizeof\n#undef True\n#undef False"
}

/// Writer for one generated instruction unit
struct UnitWriter<'a> {
    out: &'a mut String,
}

impl UnitWriter<'_> {
    fn resolve(&mut self, operand: &Operand) -> String {
        match operand {
            Operand::Reg(reg) => match register_name(*reg) {
                Some(name) => name,
                None => "0".to_string(),
            },
            Operand::Label(label) => format!("LABEL_{}", label.name()),
            Operand::Imm(value) => value.to_string(),
        }
    }

    fn operation(&mut self, target: &str, a: &str, op: &str, b: &str) {
        if target == "0" {
            // Writes to R0 are discarded
            self.out.push_str("\t/* write to R0 ignored */\n");
        } else if target == a {
            self.out.push_str(&format!("\t{} {}= {};\n", target, op, b));
        } else {
            self.out
                .push_str(&format!("\t{} = {} {} {};\n", target, a, op, b));
        }
    }

    fn assignment(&mut self, target: &str, source: &str) {
        self.operation(target, target, "", source);
    }

    fn conditional(&mut self, a: &str, op: &str, b: &str) {
        self.out.push_str(&format!("\tif ({} {} {})\n\t", a, op, b));
    }

    fn branch(&mut self, target: &str, a: &str, op: &str, b: &str) {
        self.conditional(a, op, b);
        self.operation("IP", target, "-", "1");
    }

    fn exception(&mut self, value: &str) {
        self.out
            .push_str(&format!("{{\n\t\tError({});\n\t\treturn;\n\t}}\n", value));
    }

    fn load(&mut self, target: &str, address: &str) {
        if target == "0" {
            self.out.push_str("\t/* write to R0 ignored */\n");
        } else {
            self.out
                .push_str(&format!("\t{} = Get({});\n", target, address));
        }
    }

    fn store(&mut self, address: &str, source: &str) {
        self.out
            .push_str(&format!("\tSet({}, {});\n", address, source));
    }

    fn copy(&mut self, target: &str, source: &str) {
        self.out
            .push_str(&format!("\tSet({}, Get({}));\n", target, source));
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
}

impl CTarget {
    fn emit_unit(&self, out: &mut String, program: &Program, position: usize) {
        let inst = &program.instructions[position];

        out.push_str(&format!("static void INST_{}()\n{{\n", position));

        let mut writer = UnitWriter { out: &mut *out };
        let exprs: Vec<String> = inst
            .operands()
            .iter()
            .map(|operand| writer.resolve(operand))
            .collect();

        let op = inst.opcode();
        match (op, exprs.as_slice()) {
            (Opcode::Nop, []) => {}
            (Opcode::Hlt, []) => writer.assignment("HALT", "True"),
            (Opcode::Brk, []) => writer.assignment("BREAK", "True"),
            (Opcode::Ret, []) => writer.pop("IP"),

            (Opcode::Psh, [a]) => writer.push(a),
            (Opcode::Pop, [a]) => writer.pop(a),
            (Opcode::Jmp, [a]) => writer.operation("IP", a, "-", "1"),
            (Opcode::Cal, [a]) => {
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
            (Opcode::Brz, [a, b]) => writer.branch(a, b, "==", "0"),
            (Opcode::Bnz, [a, b]) => writer.branch(a, b, "!=", "0"),
            (Opcode::Cpy, [a, b]) => writer.copy(a, b),

            (Opcode::Add, [a, b, c]) => writer.operation(a, b, "+", c),
            (Opcode::Sub, [a, b, c]) => writer.operation(a, b, "-", c),
            (Opcode::Mlt, [a, b, c]) => writer.operation(a, b, "*", c),
            (Opcode::Div, [a, b, c]) => writer.operation(a, b, "/", c),
            (Opcode::Mod, [a, b, c]) => writer.operation(a, b, "%", c),
            (Opcode::And, [a, b, c]) => writer.operation(a, b, "&", c),
            (Opcode::Or, [a, b, c]) => writer.operation(a, b, "|", c),
            (Opcode::Xor, [a, b, c]) => writer.operation(a, b, "^", c),
            (Opcode::Bsl, [a, b, c]) => writer.operation(a, b, "<<", c),
            (Opcode::Bsr, [a, b, c]) => writer.operation(a, b, ">>", c),
            (Opcode::Bre, [a, b, c]) => writer.branch(a, b, "==", c),
            (Opcode::Bne, [a, b, c]) => writer.branch(a, b, "!=", c),
            (Opcode::Brl, [a, b, c]) => writer.branch(a, b, "<", c),
            (Opcode::Brg, [a, b, c]) => writer.branch(a, b, ">", c),
            (Opcode::Ble, [a, b, c]) => writer.branch(a, b, "<=", c),
            (Opcode::Bge, [a, b, c]) => writer.branch(a, b, ">=", c),

            (op, exprs) => {
                warn!(
                    "\"{}\" does not take {} operands, emitting error marker",
                    op,
                    exprs.len()
                );
                writer.out.push_str(&format!(
                    "//ERROR: \"{}\" does not take {} operands.\n",
                    op,
                    exprs.len()
                ));
            }
        }

        out.push_str("}\n\n");
    }
}

impl Target for CTarget {
    fn emit(&mut self, program: &Program) -> Result<String, TargetError> {
        let mut out = String::new();
        write_prelude(&mut out, &self.options);

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
            out.push_str(&format!("int {} = 0;\n", name));
        }

        for (&position, labels) in &program.labels {
            for label in labels {
                out.push_str(&format!(
                    "const int LABEL_{} = {};\n",
                    label.name(),
                    position
                ));
            }
        }

        out.push('\n');

        for position in 0..program.len() {
            self.emit_unit(&mut out, program, position);
        }

        // Position-indexed function-pointer dispatch table
        out.push_str("void (*ROM[])() = { ");
        for position in 0..program.len() {
            if position > 0 {
                out.push_str(", ");
            }
            out.push_str(&format!("INST_{}", position));
        }
        out.push_str(" };\n\n");
        out.push_str(executor());

        Ok(out)
    }
}
