//! URCL instruction emitter
//!
//! Accumulates the instruction/label stream and layers higher-level
//! services on top of the primitive `emit` call: function framing,
//! argument/local access, object field access, and free-list memory
//! allocation expressed as generated code. The finished stream is handed
//! to exactly one backend target as a [`Program`].

use crate::inst::{Instruction, Label, Operand, Reg};
use crate::layout::{ClassId, LayoutError, TypeRegistry};
use crate::opcode::Opcode;
use crate::program::Program;
use crate::regmap::RegisterMap;
use log::debug;
use std::collections::BTreeMap;

/// Emitter configuration
#[derive(Debug, Clone)]
pub struct EmitterOptions {
    /// Bind R1 as the stack base pointer up front instead of allocating
    /// one lazily on first use
    pub use_r1_as_base_pointer: bool,

    /// Lowest address the generated allocator may scan
    pub memory_min_address: i64,

    /// Address the generated allocator must stay below
    pub memory_max_address: i64,

    /// Re-emit the allocator at every call site instead of sharing two
    /// subroutines
    pub inline_memory_management: bool,
}

impl Default for EmitterOptions {
    fn default() -> Self {
        Self {
            use_r1_as_base_pointer: false,
            memory_min_address: 0,
            memory_max_address: i64::MAX,
            inline_memory_management: true,
        }
    }
}

/// Shared allocate/free subroutines for out-of-line memory management
#[derive(Debug, Clone)]
struct SharedMemoryRoutines {
    allocate: Label,
    free: Label,
    /// Size in, pointer out; also the pointer argument for free
    transfer: Reg,
}

/// An emitter for URCL instructions
pub struct Emitter {
    instructions: Vec<Instruction>,
    labels: BTreeMap<usize, Vec<Label>>,
    registers: RegisterMap,
    base_pointer: Option<Reg>,
    next_anon_label: u32,
    memory_min: i64,
    memory_max: i64,
    inline_memory: bool,
    push_registers_on_memory_ops: bool,
    shared_memory: Option<SharedMemoryRoutines>,
}

impl Emitter {
    pub fn new(options: EmitterOptions) -> Self {
        let (memory_min, memory_max) = if options.memory_max_address < options.memory_min_address {
            (options.memory_max_address, options.memory_min_address)
        } else {
            (options.memory_min_address, options.memory_max_address)
        };

        let mut emitter = Self {
            instructions: Vec::new(),
            labels: BTreeMap::new(),
            registers: RegisterMap::new(),
            base_pointer: None,
            next_anon_label: 0,
            memory_min,
            memory_max,
            inline_memory: true,
            push_registers_on_memory_ops: false,
            shared_memory: None,
        };

        if options.use_r1_as_base_pointer {
            emitter.base_pointer = Some(emitter.registers.alloc());
        }

        if !options.inline_memory_management {
            emitter.emit_shared_memory_routines();
        }

        emitter
    }

    /// Emit the allocate/free logic once as two shared subroutines
    ///
    /// Call sites pass the size or pointer through one transfer register
    /// and reach the routines with CAL. The routines save and restore
    /// their scratch registers since every call site shares them. The
    /// preamble also writes the end-of-region sentinel at the minimum
    /// address.
    fn emit_shared_memory_routines(&mut self) {
        self.push_registers_on_memory_ops = true;

        let entry = self.new_label();
        let allocate = self.new_label();
        let free = self.new_label();
        let transfer = self.new_register();

        self.emit2(Opcode::Str, Operand::Imm(self.memory_min), Reg::Zero);
        self.emit1(Opcode::Jmp, &entry);

        self.mark_label(&allocate);
        self.emit_inline_allocate(Operand::Reg(transfer), transfer);
        self.emit0(Opcode::Ret);

        self.mark_label(&free);
        self.emit_inline_free(Operand::Reg(transfer));
        self.emit0(Opcode::Ret);

        self.mark_label(&entry);

        self.shared_memory = Some(SharedMemoryRoutines {
            allocate,
            free,
            transfer,
        });
        self.inline_memory = false;
    }

    /// Append one instruction
    pub fn emit(&mut self, inst: Instruction) {
        self.instructions.push(inst);
    }

    pub fn emit0(&mut self, op: Opcode) {
        self.emit(Instruction::nullary(op));
    }

    pub fn emit1(&mut self, op: Opcode, a: impl Into<Operand>) {
        self.emit(Instruction::unary(op, a));
    }

    pub fn emit2(&mut self, op: Opcode, a: impl Into<Operand>, b: impl Into<Operand>) {
        self.emit(Instruction::binary(op, a, b));
    }

    pub fn emit3(
        &mut self,
        op: Opcode,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
        c: impl Into<Operand>,
    ) {
        self.emit(Instruction::ternary(op, a, b, c));
    }

    /// Number of instructions emitted so far
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Bind a label at the current emit position
    ///
    /// Binding past the last instruction (the end-of-stream sentinel) is
    /// valid, and several labels may share one position. Duplicate names
    /// are not rejected here; resolution is a backend concern.
    pub fn mark_label(&mut self, label: &Label) {
        self.labels
            .entry(self.instructions.len())
            .or_default()
            .push(label.clone());
    }

    /// Create a fresh anonymous label
    pub fn new_label(&mut self) -> Label {
        let label = Label::new(format!("_anonlabel_{}", self.next_anon_label));
        self.next_anon_label += 1;
        label
    }

    /// Allocate a register for use
    pub fn new_register(&mut self) -> Reg {
        self.registers.alloc()
    }

    /// Make a register available for use again
    pub fn free_register(&mut self, reg: Reg) {
        self.registers.free(reg);
    }

    /// Get or allocate the register designated as the stack base pointer
    pub fn base_pointer(&mut self) -> Reg {
        match self.base_pointer {
            Some(reg) => reg,
            None => {
                let reg = self.registers.alloc();
                self.base_pointer = Some(reg);
                reg
            }
        }
    }

    /// Emit a function that runs the body emitted by `body`
    ///
    /// The body receives a fresh return label to jump to for early
    /// returns; the epilogue restores the caller's frame and returns.
    /// Arguments lie above the saved frame (positive base-pointer
    /// offsets), locals below it (negative offsets).
    pub fn emit_function(
        &mut self,
        label: &Label,
        local_count: i64,
        body: impl FnOnce(&mut Emitter, &Label),
    ) {
        debug!("Emitting function {} with {} locals", label, local_count);
        self.mark_label(label);
        let bp = self.base_pointer();
        self.emit1(Opcode::Psh, bp);
        self.emit2(Opcode::Mov, bp, Reg::Sp);
        self.emit3(Opcode::Sub, Reg::Sp, Reg::Sp, local_count);

        let return_label = self.new_label();
        body(self, &return_label);
        self.mark_label(&return_label);

        self.emit2(Opcode::Mov, Reg::Sp, bp);
        self.emit1(Opcode::Pop, bp);
        self.emit0(Opcode::Ret);
    }

    /// Emit a call that passes stack arguments pushed by `emit_args`
    ///
    /// `emit_args` returns the number of argument words it pushed;
    /// `out_count` words are reserved below them for return values.
    pub fn call_function(
        &mut self,
        label: &Label,
        out_count: i64,
        emit_args: impl FnOnce(&mut Emitter) -> i64,
    ) {
        self.emit3(Opcode::Sub, Reg::Sp, Reg::Sp, out_count);
        let in_count = emit_args(self);
        self.emit1(Opcode::Cal, label);
        self.emit3(Opcode::Add, Reg::Sp, Reg::Sp, in_count);
    }

    /// Load the function argument with the given index into `out`
    pub fn get_argument(&mut self, argument_count: i64, argument_index: i64, out: Reg) {
        let bp = self.base_pointer();
        self.emit3(
            Opcode::Add,
            out,
            bp,
            (argument_count - argument_index) + 1,
        );
        self.emit2(Opcode::Lod, out, out);
    }

    /// Load the function local with the given index into `out`
    pub fn get_local(&mut self, local_index: i64, out: Reg) {
        let bp = self.base_pointer();
        self.emit3(Opcode::Sub, out, bp, local_index);
        self.emit2(Opcode::Lod, out, out);
    }

    /// Store a value into the function local with the given index
    pub fn set_local(&mut self, local_index: i64, value: impl Into<Operand>) {
        let bp = self.base_pointer();
        let pointer = self.new_register();
        self.emit3(Opcode::Sub, pointer, bp, local_index);
        self.emit2(Opcode::Str, pointer, value);
        self.free_register(pointer);
    }

    /// Load an object field through a pointer register
    pub fn get_object_field(&mut self, pointer: impl Into<Operand>, field_index: i64, out: Reg) {
        let field_pointer = self.new_register();
        self.emit3(Opcode::Add, field_pointer, pointer, field_index);
        self.emit2(Opcode::Lod, out, field_pointer);
        self.free_register(field_pointer);
    }

    /// Store a value into an object field through a pointer register
    pub fn set_object_field(
        &mut self,
        pointer: impl Into<Operand>,
        field_index: i64,
        value: impl Into<Operand>,
    ) {
        let field_pointer = self.new_register();
        self.emit3(Opcode::Add, field_pointer, pointer, field_index);
        self.emit2(Opcode::Str, field_pointer, value);
        self.free_register(field_pointer);
    }

    /// Allocate a block of memory, leaving the data pointer in `out`
    ///
    /// A null pointer (0) is left in `out` when no block fits below the
    /// configured maximum address.
    pub fn new_pointer(&mut self, size: impl Into<Operand>, out: Reg) {
        let size = size.into();
        match (self.inline_memory, self.shared_memory.clone()) {
            (false, Some(routines)) => {
                debug!("Emitting shared allocation call for size {}", size);
                if matches!(size, Operand::Reg(_)) {
                    self.emit2(Opcode::Mov, routines.transfer, size);
                } else {
                    self.emit2(Opcode::Imm, routines.transfer, size);
                }
                self.emit1(Opcode::Cal, &routines.allocate);
                self.emit2(Opcode::Mov, out, routines.transfer);
            }
            _ => self.emit_inline_allocate(size, out),
        }
    }

    /// Free the block whose data pointer is `pointer`
    ///
    /// Only the in-use bit of the preceding header is cleared; adjacent
    /// free blocks are not coalesced.
    pub fn free_pointer(&mut self, pointer: impl Into<Operand>) {
        let pointer = pointer.into();
        match (self.inline_memory, self.shared_memory.clone()) {
            (false, Some(routines)) => {
                if matches!(pointer, Operand::Reg(_)) {
                    self.emit2(Opcode::Mov, routines.transfer, pointer);
                } else {
                    self.emit2(Opcode::Imm, routines.transfer, pointer);
                }
                self.emit1(Opcode::Cal, &routines.free);
            }
            _ => self.emit_inline_free(pointer),
        }
    }

    /// Allocate a block sized for the given class
    pub fn new_object(
        &mut self,
        registry: &TypeRegistry,
        class: ClassId,
        out: Reg,
    ) -> Result<(), LayoutError> {
        let size = registry.size_of(class)?;
        self.new_pointer(size, out);
        Ok(())
    }

    /// First-fit scan over length/in-use headers, emitted at a call site
    fn emit_inline_allocate(&mut self, size: Operand, out: Reg) {
        let search_loop = self.new_label();
        let create_new = self.new_label();
        let out_of_memory = self.new_label();
        let finish = self.new_label();
        let current_block = self.new_register();
        let length = self.new_register();
        let value = self.new_register();

        if self.push_registers_on_memory_ops {
            self.emit1(Opcode::Psh, current_block);
            self.emit1(Opcode::Psh, length);
            self.emit1(Opcode::Psh, value);
        }

        self.emit2(Opcode::Imm, current_block, Operand::Imm(self.memory_min));
        self.emit2(Opcode::Mov, length, Reg::Zero);

        self.mark_label(&search_loop);
        // Offset to the next block based on the previous block's length.
        self.emit3(Opcode::Add, current_block, current_block, length);
        self.emit2(Opcode::Lod, length, current_block);
        // A zero header is the end of the managed region.
        self.emit2(Opcode::Brz, &create_new, length);
        // Split the header into in-use bit and length.
        self.emit3(Opcode::And, value, length, 1i64);
        self.emit2(Opcode::Rsh, length, length);
        self.emit2(Opcode::Bnz, &search_loop, value);
        // Too small, keep scanning.
        self.emit3(Opcode::Brl, &search_loop, length, size.clone());
        // Mark the block in use, keeping its length.
        self.emit2(Opcode::Lsh, length, length);
        self.emit3(Opcode::Or, length, length, 1i64);
        self.emit2(Opcode::Str, current_block, length);
        self.emit3(Opcode::Add, out, current_block, 1i64);
        self.emit1(Opcode::Jmp, &finish);

        self.mark_label(&out_of_memory);
        self.emit2(Opcode::Mov, out, Reg::Zero);
        self.emit1(Opcode::Jmp, &finish);

        self.mark_label(&create_new);
        // Block size including the header word.
        self.emit3(Opcode::Add, length, size, 1i64);
        self.emit1(Opcode::Psh, length);
        // Highest address the block may start at without overflowing.
        self.emit3(Opcode::Sub, value, Operand::Imm(self.memory_max), length);
        self.emit3(Opcode::Brl, &out_of_memory, value, current_block);
        self.emit2(Opcode::Lsh, length, length);
        self.emit3(Opcode::Or, length, length, 1i64);
        self.emit2(Opcode::Str, current_block, length);
        self.emit3(Opcode::Add, out, current_block, 1i64);
        self.emit1(Opcode::Pop, length);
        // Re-establish the end sentinel after the fresh block.
        self.emit3(Opcode::Add, current_block, current_block, length);
        self.emit2(Opcode::Str, current_block, Reg::Zero);

        self.mark_label(&finish);
        if self.push_registers_on_memory_ops {
            self.emit1(Opcode::Pop, value);
            self.emit1(Opcode::Pop, length);
            self.emit1(Opcode::Pop, current_block);
        }

        self.free_register(current_block);
        self.free_register(length);
        self.free_register(value);
    }

    fn emit_inline_free(&mut self, pointer: Operand) {
        let finish = self.new_label();
        let current_block = self.new_register();
        let length = self.new_register();

        if self.push_registers_on_memory_ops {
            self.emit1(Opcode::Psh, current_block);
            self.emit1(Opcode::Psh, length);
        }

        // Null pointers are ignored.
        self.emit2(Opcode::Brz, &finish, pointer.clone());
        self.emit3(Opcode::Sub, current_block, pointer, 1i64);
        self.emit2(Opcode::Lod, length, current_block);
        // Clear the in-use bit, nothing else.
        self.emit3(Opcode::And, length, length, -2i64);
        self.emit2(Opcode::Str, current_block, length);
        self.mark_label(&finish);

        if self.push_registers_on_memory_ops {
            self.emit1(Opcode::Pop, length);
            self.emit1(Opcode::Pop, current_block);
        }

        self.free_register(current_block);
        self.free_register(length);
    }

    /// Hand the finished stream to a backend target
    pub fn finish(self) -> Program {
        Program {
            instructions: self.instructions,
            labels: self.labels,
        }
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new(EmitterOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_function_framing() {
        let mut emitter = Emitter::new(EmitterOptions::default());
        let label = Label::new("main");
        emitter.emit_function(&label, 2, |emitter, _ret| {
            emitter.emit0(Opcode::Nop);
        });

        let program = emitter.finish();
        let bp = Reg::General(1);
        assert_eq!(
            program.instructions,
            vec![
                Instruction::unary(Opcode::Psh, bp),
                Instruction::binary(Opcode::Mov, bp, Reg::Sp),
                Instruction::ternary(Opcode::Sub, Reg::Sp, Reg::Sp, 2i64),
                Instruction::nullary(Opcode::Nop),
                Instruction::binary(Opcode::Mov, Reg::Sp, bp),
                Instruction::unary(Opcode::Pop, bp),
                Instruction::nullary(Opcode::Ret),
            ]
        );
        assert_eq!(program.labels_at(0), &[Label::new("main")]);
        // The return label sits between the body and the epilogue
        assert_eq!(program.labels_at(4), &[Label::new("_anonlabel_0")]);
    }

    #[test]
    fn test_early_return_label() {
        let mut emitter = Emitter::new(EmitterOptions::default());
        let label = Label::new("f");
        emitter.emit_function(&label, 0, |emitter, ret| {
            emitter.emit1(Opcode::Jmp, ret);
        });

        let program = emitter.finish();
        assert_eq!(
            program.instructions[3],
            Instruction::unary(Opcode::Jmp, Label::new("_anonlabel_0"))
        );
    }

    #[test]
    fn test_sentinel_label() {
        let mut emitter = Emitter::new(EmitterOptions::default());
        emitter.emit0(Opcode::Hlt);
        emitter.mark_label(&Label::new("end"));

        let program = emitter.finish();
        assert_eq!(program.labels_at(1), &[Label::new("end")]);
    }

    #[test]
    fn test_argument_access() {
        let mut emitter = Emitter::new(EmitterOptions {
            use_r1_as_base_pointer: true,
            ..EmitterOptions::default()
        });
        let out = emitter.new_register();
        emitter.get_argument(2, 0, out);

        let program = emitter.finish();
        assert_eq!(
            program.instructions,
            vec![
                Instruction::ternary(Opcode::Add, out, Reg::General(1), 3i64),
                Instruction::binary(Opcode::Lod, out, out),
            ]
        );
    }

    #[test]
    fn test_set_local_frees_scratch() {
        let mut emitter = Emitter::new(EmitterOptions::default());
        emitter.set_local(1, 7i64);
        // The scratch pointer register is free again afterwards
        let reused = emitter.new_register();
        assert_eq!(reused, Reg::General(2));
    }

    #[test]
    fn test_inline_allocation_shape() {
        let mut emitter = Emitter::new(EmitterOptions {
            memory_min_address: 16,
            memory_max_address: 64,
            ..EmitterOptions::default()
        });
        let out = emitter.new_register();
        emitter.new_pointer(3i64, out);

        let program = emitter.finish();
        // The scan starts at the configured minimum address
        assert_eq!(
            program.instructions[0],
            Instruction::binary(Opcode::Imm, Reg::General(2), 16i64)
        );
        // No shared-routine call sites in inline mode
        assert!(!program
            .instructions
            .iter()
            .any(|inst| inst.opcode() == Opcode::Cal));
        // Allocator scratch registers are released afterwards
        assert_eq!(program.instructions.len(), 27);
    }

    #[test]
    fn test_swapped_memory_window() {
        let mut emitter = Emitter::new(EmitterOptions {
            memory_min_address: 64,
            memory_max_address: 16,
            ..EmitterOptions::default()
        });
        let out = emitter.new_register();
        emitter.new_pointer(1i64, out);

        let program = emitter.finish();
        assert_eq!(
            program.instructions[0],
            Instruction::binary(Opcode::Imm, Reg::General(2), 16i64)
        );
    }

    #[test]
    fn test_out_of_line_memory_management() {
        let mut emitter = Emitter::new(EmitterOptions {
            inline_memory_management: false,
            ..EmitterOptions::default()
        });
        let preamble_len = emitter.len();
        let out = emitter.new_register();
        emitter.new_pointer(5i64, out);
        emitter.free_pointer(out);
        let program = emitter.finish();

        // The preamble writes the heap sentinel and jumps over the routines
        assert_eq!(
            program.instructions[0],
            Instruction::binary(Opcode::Str, Operand::Imm(0), Reg::Zero)
        );
        assert_eq!(program.instructions[1].opcode(), Opcode::Jmp);

        // Each call site is three instructions for allocate...
        let transfer = Reg::General(1);
        assert_eq!(
            &program.instructions[preamble_len..preamble_len + 3],
            &[
                Instruction::binary(Opcode::Imm, transfer, 5i64),
                Instruction::unary(Opcode::Cal, Label::new("_anonlabel_1")),
                Instruction::binary(Opcode::Mov, out, transfer),
            ]
        );
        // ...and two for free
        assert_eq!(
            &program.instructions[preamble_len + 3..preamble_len + 5],
            &[
                Instruction::binary(Opcode::Mov, transfer, out),
                Instruction::unary(Opcode::Cal, Label::new("_anonlabel_2")),
            ]
        );
        // Both shared routines return
        let rets = program
            .instructions
            .iter()
            .filter(|inst| inst.opcode() == Opcode::Ret)
            .count();
        assert_eq!(rets, 2);
    }
}
