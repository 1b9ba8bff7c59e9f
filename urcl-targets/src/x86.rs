//! Macro-assembly target
//!
//! Lowers the stream to NASM x86 assembly through a fixed library of
//! parameterized macros, one per opcode. URCL registers become sized
//! memory references into per-register backing words collected into a
//! data section; labels are sanitized symbols. The same macro bodies
//! serve 16/32/64-bit output by upgrading bare host registers and the
//! word-shift constant at render time.
//!
//! Expansion substitutes an explicit operand-binding environment instead
//! of rewriting text: each frame gets a fresh local label, arguments
//! resolve through the bindings, and an argument that is still an
//! unresolved placeholder is a hard error. Call/return and push/pop go
//! through a software stack pointer word and indirect jumps so the
//! semantics match the other targets.

use crate::{Target, TargetError};
use lazy_static::lazy_static;
use log::warn;
use std::collections::HashMap;
use urcl_core::{Instruction, Opcode, Operand, Program, Reg};

/// Options for the generated assembly
#[derive(Debug, Clone)]
pub struct X86Options {
    /// Register width: 16, 32 or 64
    pub bits: u16,

    /// Wrap code and data in `section` directives
    pub use_sections: bool,

    /// Inline every macro body instead of emitting the library once
    pub expand_macros: bool,
}

impl Default for X86Options {
    fn default() -> Self {
        Self {
            bits: 32,
            use_sections: false,
            expand_macros: false,
        }
    }
}

/// Host registers usable inside macro bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostReg {
    Ax,
    Bx,
    Cx,
    Dx,
}

impl HostReg {
    fn base(self) -> &'static str {
        match self {
            HostReg::Ax => "ax",
            HostReg::Bx => "bx",
            HostReg::Cx => "cx",
            HostReg::Dx => "dx",
        }
    }

    /// Width-polymorphic register name (`ax` / `eax` / `rax`)
    fn name(self, bits: u16) -> String {
        match bits {
            16 => self.base().to_string(),
            64 => format!("r{}", self.base()),
            _ => format!("e{}", self.base()),
        }
    }
}

/// One operand slot inside a macro body or invocation
#[derive(Debug, Clone, PartialEq)]
enum MacroOperand {
    /// Bare host register, width-upgraded at render time
    Host(HostReg),

    /// Integer literal
    Imm(i64),

    /// Sized memory reference through a host register
    MemHost(HostReg),

    /// Sized memory reference to a data-section symbol
    MemSym(String),

    /// Bare symbol: label, `R0`, `cl`, `$`
    Sym(String),

    /// Macro argument placeholder, 1-based
    Arg(u8),

    /// The expansion frame's hygienic local label
    LocalLabel,

    /// Expands to the word shift for the width (1/2/3)
    WordShift,
}

/// One line of a macro body
#[derive(Debug, Clone)]
enum MacroInst {
    /// Host instruction with 0..2 operands
    Op(&'static str, Vec<MacroOperand>),

    /// Definition site of the frame's local label
    LocalLabelDef,

    /// Nested invocation of another library macro
    Invoke(Opcode, Vec<MacroOperand>),
}

/// A parameterized macro, written against placeholder argument positions
struct MacroDef {
    name: String,
    argc: usize,
    local: &'static str,
    body: Vec<MacroInst>,
}

fn refsize(bits: u16) -> &'static str {
    match bits {
        16 => "word",
        64 => "qword",
        _ => "dword",
    }
}

fn data_word(bits: u16) -> &'static str {
    match bits {
        16 => "dw",
        64 => "dq",
        _ => "dd",
    }
}

fn word_shift(bits: u16) -> u32 {
    match bits {
        16 => 1,
        64 => 3,
        _ => 2,
    }
}

fn sanitize_label(name: &str) -> String {
    name.trim().replace(' ', "_").replace('.', "_")
}

// Body construction helpers

fn ax() -> MacroOperand {
    MacroOperand::Host(HostReg::Ax)
}

fn bx() -> MacroOperand {
    MacroOperand::Host(HostReg::Bx)
}

fn cx() -> MacroOperand {
    MacroOperand::Host(HostReg::Cx)
}

fn dx() -> MacroOperand {
    MacroOperand::Host(HostReg::Dx)
}

fn mem_bx() -> MacroOperand {
    MacroOperand::MemHost(HostReg::Bx)
}

fn mem_sp() -> MacroOperand {
    MacroOperand::MemSym("REG_SP".to_string())
}

fn imm(value: i64) -> MacroOperand {
    MacroOperand::Imm(value)
}

fn sym(name: &str) -> MacroOperand {
    MacroOperand::Sym(name.to_string())
}

fn arg(index: u8) -> MacroOperand {
    MacroOperand::Arg(index)
}

fn local_ref() -> MacroOperand {
    MacroOperand::LocalLabel
}

fn shift() -> MacroOperand {
    MacroOperand::WordShift
}

fn op0(name: &'static str) -> MacroInst {
    MacroInst::Op(name, vec![])
}

fn op1(name: &'static str, a: MacroOperand) -> MacroInst {
    MacroInst::Op(name, vec![a])
}

fn op2(name: &'static str, a: MacroOperand, b: MacroOperand) -> MacroInst {
    MacroInst::Op(name, vec![a, b])
}

fn invoke(op: Opcode, args: Vec<MacroOperand>) -> MacroInst {
    MacroInst::Invoke(op, args)
}

fn local_def() -> MacroInst {
    MacroInst::LocalLabelDef
}

fn def(op: Opcode, local: &'static str, body: Vec<MacroInst>) -> (Opcode, MacroDef) {
    (
        op,
        MacroDef {
            name: format!("URCL_{}", op.mnemonic()),
            argc: op.arity(),
            local,
            body,
        },
    )
}

/// Three-operand ALU template: op through AX into the destination
fn alu3(op: Opcode, host_op: &'static str) -> (Opcode, MacroDef) {
    def(
        op,
        "skip",
        vec![
            op2("mov", ax(), arg(2)),
            op2(host_op, ax(), arg(3)),
            op2("mov", arg(1), ax()),
        ],
    )
}

/// Two-operand unary template through AX
fn alu2(op: Opcode, body_op: MacroInst) -> (Opcode, MacroDef) {
    def(
        op,
        "skip",
        vec![op2("mov", ax(), arg(2)), body_op, op2("mov", arg(1), ax())],
    )
}

/// Compare-branch template: inverted conditional jump over the real jump
fn compare_branch(op: Opcode, rhs: MacroOperand, inverted_jump: &'static str) -> (Opcode, MacroDef) {
    def(
        op,
        "skip",
        vec![
            op2("mov", ax(), arg(2)),
            op2("cmp", ax(), rhs),
            op1(inverted_jump, local_ref()),
            invoke(Opcode::Jmp, vec![arg(1)]),
            local_def(),
        ],
    )
}

fn build_library() -> HashMap<Opcode, MacroDef> {
    let mut macros = HashMap::new();
    let mut add = |entry: (Opcode, MacroDef)| {
        macros.insert(entry.0, entry.1);
    };

    add(def(Opcode::Nop, "skip", vec![op0("nop")]));
    add(def(
        Opcode::Hlt,
        "skip",
        vec![op0("hlt"), op1("jmp", sym("$"))],
    ));
    add(def(Opcode::Brk, "skip", vec![op0("int3")]));

    add(alu3(Opcode::Add, "add"));
    add(alu3(Opcode::Sub, "sub"));
    add(alu3(Opcode::And, "and"));
    add(alu3(Opcode::Or, "or"));
    add(alu3(Opcode::Xor, "xor"));

    add(def(
        Opcode::Mlt,
        "skip",
        vec![
            op2("mov", ax(), arg(2)),
            op1("mul", arg(3)),
            op2("mov", arg(1), ax()),
        ],
    ));
    add(def(
        Opcode::Div,
        "skip",
        vec![
            op2("xor", dx(), dx()),
            op2("mov", ax(), arg(2)),
            op1("div", arg(3)),
            op2("mov", arg(1), ax()),
        ],
    ));
    add(def(
        Opcode::Mod,
        "skip",
        vec![
            op2("xor", dx(), dx()),
            op2("mov", ax(), arg(2)),
            op1("div", arg(3)),
            op2("mov", arg(1), dx()),
        ],
    ));

    add(alu2(Opcode::Not, op1("not", ax())));
    add(alu2(Opcode::Inc, op2("add", ax(), imm(1))));
    add(alu2(Opcode::Dec, op2("sub", ax(), imm(1))));
    add(alu2(Opcode::Lsh, op2("shl", ax(), imm(1))));
    add(alu2(Opcode::Rsh, op2("shr", ax(), imm(1))));

    add(def(
        Opcode::Bsl,
        "skip",
        vec![
            op2("mov", ax(), arg(2)),
            op2("mov", cx(), arg(3)),
            op2("shl", ax(), sym("cl")),
            op2("mov", arg(1), ax()),
        ],
    ));
    add(def(
        Opcode::Bsr,
        "skip",
        vec![
            op2("mov", ax(), arg(2)),
            op2("mov", cx(), arg(3)),
            op2("shr", ax(), sym("cl")),
            op2("mov", arg(1), ax()),
        ],
    ));

    add(def(
        Opcode::Lod,
        "skip",
        vec![
            op2("mov", bx(), arg(2)),
            op2("shl", bx(), shift()),
            op2("add", bx(), sym("URCL_MEMORY")),
            op2("mov", bx(), mem_bx()),
            op2("mov", arg(1), bx()),
        ],
    ));
    add(def(
        Opcode::Str,
        "skip",
        vec![
            op2("mov", ax(), arg(2)),
            op2("mov", bx(), arg(1)),
            op2("shl", bx(), shift()),
            op2("add", bx(), sym("URCL_MEMORY")),
            op2("mov", mem_bx(), ax()),
        ],
    ));
    add(def(
        Opcode::Cpy,
        "skip",
        vec![
            op2("mov", bx(), arg(2)),
            op2("shl", bx(), shift()),
            op2("add", bx(), sym("URCL_MEMORY")),
            op2("mov", ax(), mem_bx()),
            op2("mov", bx(), arg(1)),
            op2("shl", bx(), shift()),
            op2("add", bx(), sym("URCL_MEMORY")),
            op2("mov", mem_bx(), ax()),
        ],
    ));

    add(def(
        Opcode::Mov,
        "skip",
        vec![op2("mov", ax(), arg(2)), op2("mov", arg(1), ax())],
    ));
    add(def(Opcode::Imm, "skip", vec![op2("mov", arg(1), arg(2))]));

    add(def(
        Opcode::Psh,
        "skip",
        vec![
            invoke(Opcode::Dec, vec![mem_sp(), mem_sp()]),
            invoke(Opcode::Str, vec![mem_sp(), arg(1)]),
        ],
    ));
    add(def(
        Opcode::Pop,
        "skip",
        vec![
            invoke(Opcode::Lod, vec![arg(1), mem_sp()]),
            invoke(Opcode::Inc, vec![mem_sp(), mem_sp()]),
        ],
    ));

    add(def(Opcode::Jmp, "skip", vec![op1("jmp", arg(1))]));

    add(compare_branch(Opcode::Brz, imm(0), "jnz"));
    add(compare_branch(Opcode::Bnz, imm(0), "jz"));
    add(compare_branch(Opcode::Bre, arg(3), "jnz"));
    add(compare_branch(Opcode::Bne, arg(3), "jz"));
    add(compare_branch(Opcode::Brl, arg(3), "jae"));
    add(compare_branch(Opcode::Brg, arg(3), "jbe"));
    add(compare_branch(Opcode::Ble, arg(3), "ja"));
    add(compare_branch(Opcode::Bge, arg(3), "jb"));

    add(def(
        Opcode::Cal,
        "retAddr",
        vec![
            invoke(Opcode::Dec, vec![mem_sp(), mem_sp()]),
            op2("mov", ax(), local_ref()),
            invoke(Opcode::Str, vec![mem_sp(), ax()]),
            invoke(Opcode::Jmp, vec![arg(1)]),
            local_def(),
        ],
    ));
    add(def(
        Opcode::Ret,
        "skip",
        vec![
            op2("mov", bx(), mem_sp()),
            op2("shl", bx(), shift()),
            op2("add", bx(), sym("URCL_MEMORY")),
            op2("mov", ax(), mem_bx()),
            invoke(Opcode::Inc, vec![mem_sp(), mem_sp()]),
            op1("jmp", ax()),
        ],
    ));

    macros
}

lazy_static! {
    static ref MACROS: HashMap<Opcode, MacroDef> = build_library();
}

/// Render a concrete operand or a library placeholder
///
/// `local` is the text printed for local-label references: the NASM
/// macro-local name inside the library, the frame's fresh label when
/// expanding.
fn render_operand(operand: &MacroOperand, bits: u16, local: &str) -> String {
    match operand {
        MacroOperand::Host(reg) => reg.name(bits),
        MacroOperand::Imm(value) => value.to_string(),
        MacroOperand::MemHost(reg) => format!("{} [{}]", refsize(bits), reg.name(bits)),
        MacroOperand::MemSym(name) => format!("{} [{}]", refsize(bits), name),
        MacroOperand::Sym(name) => name.clone(),
        MacroOperand::Arg(index) => format!("%{}", index),
        MacroOperand::LocalLabel => local.to_string(),
        MacroOperand::WordShift => word_shift(bits).to_string(),
    }
}

fn render_line(name: &str, operands: &[String], out: &mut String) {
    out.push_str(name);
    for (index, operand) in operands.iter().enumerate() {
        if index == 0 {
            out.push(' ');
        } else {
            out.push_str(", ");
        }
        out.push_str(operand);
    }
    out.push('\n');
}

/// Render one macro definition for the library section
fn render_macro_def(macro_def: &MacroDef, bits: u16) -> String {
    let mut out = format!("%macro {} {}\n", macro_def.name, macro_def.argc);
    let local = format!("%%{}", macro_def.local);
    for inst in &macro_def.body {
        match inst {
            MacroInst::Op(name, operands) => {
                let rendered: Vec<String> = operands
                    .iter()
                    .map(|operand| render_operand(operand, bits, &local))
                    .collect();
                render_line(name, &rendered, &mut out);
            }
            MacroInst::LocalLabelDef => out.push_str(&format!("{}:\n", local)),
            MacroInst::Invoke(child, args) => {
                if let Some(child_def) = MACROS.get(child) {
                    let rendered: Vec<String> = args
                        .iter()
                        .map(|operand| render_operand(operand, bits, &local))
                        .collect();
                    render_line(&child_def.name, &rendered, &mut out);
                }
            }
        }
    }
    out.push_str("%endmacro\n");
    out
}

/// One lowered stream entry; errors keep their slot so label positions
/// stay aligned
enum Entry {
    Call { op: Opcode, args: Vec<MacroOperand> },
    Comment(String),
}

/// Macro-assembly lowering to NASM source
pub struct X86Target {
    options: X86Options,
    next_label_id: u32,
}

impl X86Target {
    pub fn new(options: X86Options) -> Self {
        Self {
            options,
            next_label_id: 0,
        }
    }

    fn next_local_label(&mut self) -> String {
        let label = format!("x86_lbl_{}", self.next_label_id);
        self.next_label_id += 1;
        label
    }

    fn lower_operand(operand: &Operand, registers: &mut Vec<String>) -> MacroOperand {
        match operand {
            Operand::Reg(Reg::Zero) => MacroOperand::Sym("R0".to_string()),
            Operand::Reg(Reg::Sp) => MacroOperand::MemSym("REG_SP".to_string()),
            Operand::Reg(Reg::General(n)) => {
                let name = format!("REG_R{}", n);
                if !registers.contains(&name) {
                    registers.push(name.clone());
                }
                MacroOperand::MemSym(name)
            }
            Operand::Label(label) => MacroOperand::Sym(sanitize_label(label.name())),
            Operand::Imm(value) => MacroOperand::Imm(*value),
        }
    }

    fn lower_instruction(inst: &Instruction, registers: &mut Vec<String>) -> Entry {
        let op = inst.opcode();
        match MACROS.get(&op) {
            Some(_) if inst.arity_matches() => {
                let args = inst
                    .operands()
                    .iter()
                    .map(|operand| Self::lower_operand(operand, registers))
                    .collect();
                Entry::Call { op, args }
            }
            Some(_) => {
                warn!(
                    "{} does not take {} operands, emitting error marker",
                    op.mnemonic(),
                    inst.arity()
                );
                Entry::Comment(format!(
                    "ERROR: {} does not take {} operands.",
                    op.mnemonic(),
                    inst.arity()
                ))
            }
            None => {
                warn!("{} is not a valid instruction here", op.mnemonic());
                Entry::Comment(format!("ERROR: {} is not a valid instruction.", op.mnemonic()))
            }
        }
    }

    /// Bind a nested invocation's argument through the current frame
    fn bind(
        operand: &MacroOperand,
        bindings: &[MacroOperand],
        local: &str,
        name: &str,
    ) -> Result<MacroOperand, TargetError> {
        match operand {
            MacroOperand::Arg(index) => {
                match bindings.get(*index as usize - 1) {
                    // A binding that is still a placeholder never resolves
                    Some(MacroOperand::Arg(_)) | None => Err(TargetError::RecursiveArgument {
                        name: name.to_string(),
                        index: *index,
                    }),
                    Some(bound) => Ok(bound.clone()),
                }
            }
            MacroOperand::LocalLabel => Ok(MacroOperand::Sym(local.to_string())),
            other => Ok(other.clone()),
        }
    }

    /// Inline one macro invocation with a fresh local label
    fn expand_call(
        &mut self,
        op: Opcode,
        args: &[MacroOperand],
        bits: u16,
        visited: &mut Vec<String>,
        out: &mut String,
    ) -> Result<(), TargetError> {
        let macro_def = match MACROS.get(&op) {
            Some(found) => found,
            None => return Ok(()),
        };
        if visited.contains(&macro_def.name) {
            return Err(TargetError::RecursiveMacro {
                name: macro_def.name.clone(),
            });
        }
        visited.push(macro_def.name.clone());
        let local = self.next_local_label();

        for inst in &macro_def.body {
            match inst {
                MacroInst::Op(name, operands) => {
                    let mut rendered = Vec::new();
                    for operand in operands {
                        let bound = Self::bind(operand, args, &local, &macro_def.name)?;
                        rendered.push(render_operand(&bound, bits, &local));
                    }
                    render_line(name, &rendered, out);
                }
                MacroInst::LocalLabelDef => out.push_str(&format!("{}:\n", local)),
                MacroInst::Invoke(child, child_args) => {
                    let mut resolved = Vec::new();
                    for operand in child_args {
                        resolved.push(Self::bind(operand, args, &local, &macro_def.name)?);
                    }
                    self.expand_call(*child, &resolved, bits, visited, out)?;
                }
            }
        }

        visited.pop();
        Ok(())
    }
}

impl Target for X86Target {
    fn emit(&mut self, program: &Program) -> Result<String, TargetError> {
        let bits = self.options.bits;
        if !matches!(bits, 16 | 32 | 64) {
            return Err(TargetError::UnsupportedWidth(bits));
        }

        // Collect per-register backing words while lowering; the stack
        // pointer word always exists.
        let mut registers = vec!["REG_SP".to_string()];
        let entries: Vec<Entry> = program
            .instructions
            .iter()
            .map(|inst| Self::lower_instruction(inst, &mut registers))
            .collect();

        let mut out = String::from("R0 equ 0\n\n");
        if self.options.use_sections {
            out.push_str("section .text\n");
        }

        if !self.options.expand_macros {
            for op in Opcode::all() {
                if let Some(macro_def) = MACROS.get(op) {
                    out.push_str(&render_macro_def(macro_def, bits));
                    out.push('\n');
                }
            }
        }

        for (position, entry) in entries.iter().enumerate() {
            for label in program.labels_at(position) {
                out.push_str(&format!("{}:\n", sanitize_label(label.name())));
            }
            match entry {
                Entry::Call { op, args } => {
                    if self.options.expand_macros {
                        let mut visited = Vec::new();
                        self.expand_call(*op, args, bits, &mut visited, &mut out)?;
                    } else if let Some(macro_def) = MACROS.get(op) {
                        let rendered: Vec<String> = args
                            .iter()
                            .map(|operand| render_operand(operand, bits, ""))
                            .collect();
                        render_line(&macro_def.name, &rendered, &mut out);
                    }
                }
                Entry::Comment(text) => out.push_str(&format!("; {}\n", text)),
            }
        }
        for label in program.labels_at(program.len()) {
            out.push_str(&format!("{}:\n", sanitize_label(label.name())));
        }

        if self.options.use_sections {
            out.push_str("\nsection .data\n");
        }
        for register in &registers {
            out.push_str(&format!("{}:\n{} 0\n", register, data_word(bits)));
        }
        out.push_str("URCL_MEMORY:\n");

        Ok(out)
    }
}
