//! End-to-end tests: emitter services lowered to instructions, then
//! executed directly on the machine.

use urcl_core::{Emitter, EmitterOptions, Label, Opcode, Reg};
use urcl_vm::Machine;

fn window_options(min: i64, max: i64) -> EmitterOptions {
    EmitterOptions {
        memory_min_address: min,
        memory_max_address: max,
        ..EmitterOptions::default()
    }
}

#[test]
fn first_fit_reuses_freed_block() {
    // Allocate 3, allocate 5, free the first, allocate 3 again: the
    // third allocation reuses the first block's address instead of
    // extending past the second.
    let mut emitter = Emitter::new(window_options(0, 100));
    let a = emitter.new_register();
    emitter.new_pointer(3i64, a);
    let b = emitter.new_register();
    emitter.new_pointer(5i64, b);
    emitter.free_pointer(a);
    let c = emitter.new_register();
    emitter.new_pointer(3i64, c);
    emitter.emit0(Opcode::Hlt);

    let mut machine = Machine::load(&emitter.finish());
    machine.run().unwrap();

    assert_eq!(machine.register(a), 1);
    assert_eq!(machine.register(b), 5);
    assert_eq!(machine.register(c), machine.register(a));
}

#[test]
fn allocation_past_window_returns_null() {
    let mut emitter = Emitter::new(window_options(0, 10));
    let a = emitter.new_register();
    emitter.new_pointer(8i64, a);
    let b = emitter.new_register();
    emitter.new_pointer(5i64, b);
    emitter.emit0(Opcode::Hlt);

    let mut machine = Machine::load(&emitter.finish());
    machine.run().unwrap();

    assert_eq!(machine.register(a), 1);
    assert_eq!(machine.register(b), 0);
}

#[test]
fn live_blocks_never_overlap() {
    let mut emitter = Emitter::new(window_options(0, 100));
    let a = emitter.new_register();
    emitter.new_pointer(2i64, a);
    let b = emitter.new_register();
    emitter.new_pointer(3i64, b);
    let c = emitter.new_register();
    emitter.new_pointer(4i64, c);
    emitter.emit0(Opcode::Hlt);

    let mut machine = Machine::load(&emitter.finish());
    machine.run().unwrap();

    // Each block is its payload plus one header word
    assert_eq!(machine.register(a), 1);
    assert_eq!(machine.register(b), 4);
    assert_eq!(machine.register(c), 8);
}

#[test]
fn shared_allocator_routines_behave_like_inline() {
    let mut emitter = Emitter::new(EmitterOptions {
        inline_memory_management: false,
        memory_min_address: 0,
        memory_max_address: 100,
        ..EmitterOptions::default()
    });
    let a = emitter.new_register();
    emitter.new_pointer(3i64, a);
    let b = emitter.new_register();
    emitter.new_pointer(5i64, b);
    emitter.free_pointer(a);
    let c = emitter.new_register();
    emitter.new_pointer(3i64, c);
    emitter.emit0(Opcode::Hlt);

    let mut machine = Machine::load(&emitter.finish());
    machine.run().unwrap();

    assert_eq!(machine.register(a), 1);
    assert_eq!(machine.register(b), 5);
    assert_eq!(machine.register(c), 1);
    // The shared routines restored their scratch registers; nothing is
    // left on the stack after the run.
    assert_eq!(machine.register(Reg::Sp), 0);
}

#[test]
fn object_allocation_uses_class_size() {
    let mut registry = urcl_core::TypeRegistry::new();
    let word = registry.word();
    let node = registry.declare("Node");
    registry
        .define(
            node,
            None,
            vec![
                urcl_core::FieldDef::new(node, "Next"),
                urcl_core::FieldDef::new(word, "Value"),
            ],
            false,
        )
        .unwrap();

    let mut emitter = Emitter::new(window_options(0, 100));
    let a = emitter.new_register();
    emitter.new_object(&registry, node, a).unwrap();
    let b = emitter.new_register();
    emitter.new_object(&registry, node, b).unwrap();
    emitter.set_object_field(a, 0, b);
    emitter.set_object_field(a, 1, 41i64);
    let field = emitter.new_register();
    emitter.get_object_field(a, 1, field);
    emitter.emit0(Opcode::Hlt);

    let mut machine = Machine::load(&emitter.finish());
    machine.run().unwrap();

    // Two-word objects: header at 0 and 3, data at 1 and 4
    assert_eq!(machine.register(a), 1);
    assert_eq!(machine.register(b), 4);
    assert_eq!(machine.ram().get(&1), Some(&4));
    assert_eq!(machine.register(field), 41);
}

#[test]
fn function_frame_arguments_and_return_value() {
    let mut emitter = Emitter::new(EmitterOptions::default());
    let main = Label::new("main");
    let add_one = Label::new("add_one");

    emitter.emit1(Opcode::Jmp, &main);

    // One argument, one output slot written through the frame
    emitter.emit_function(&add_one, 0, |emitter, _ret| {
        let value = emitter.new_register();
        emitter.get_argument(1, 0, value);
        emitter.emit2(Opcode::Inc, value, value);
        let bp = emitter.base_pointer();
        emitter.set_object_field(bp, 3, value);
        emitter.free_register(value);
    });

    emitter.mark_label(&main);
    emitter.call_function(&add_one, 1, |emitter| {
        emitter.emit1(Opcode::Psh, 41i64);
        1
    });
    let result = emitter.new_register();
    emitter.emit1(Opcode::Pop, result);
    emitter.emit0(Opcode::Hlt);

    let mut machine = Machine::load(&emitter.finish());
    machine.run().unwrap();

    assert_eq!(machine.register(result), 42);
    assert_eq!(machine.register(Reg::Sp), 0);
}

#[test]
fn function_locals_round_trip() {
    let mut emitter = Emitter::new(EmitterOptions::default());
    let main = Label::new("main");
    let f = Label::new("f");
    let result = Reg::General(10);

    emitter.emit1(Opcode::Jmp, &main);
    emitter.emit_function(&f, 1, |emitter, _ret| {
        emitter.set_local(1, 99i64);
        emitter.get_local(1, result);
    });
    emitter.mark_label(&main);
    emitter.call_function(&f, 0, |_| 0);
    emitter.emit0(Opcode::Hlt);

    let mut machine = Machine::load(&emitter.finish());
    machine.run().unwrap();

    assert_eq!(machine.register(result), 99);
}

#[test]
fn early_return_skips_rest_of_body() {
    let mut emitter = Emitter::new(EmitterOptions::default());
    let main = Label::new("main");
    let f = Label::new("f");
    let result = Reg::General(10);

    emitter.emit1(Opcode::Jmp, &main);
    emitter.emit_function(&f, 0, |emitter, ret| {
        emitter.emit2(Opcode::Imm, result, 1i64);
        emitter.emit1(Opcode::Jmp, ret);
        emitter.emit2(Opcode::Imm, result, 2i64);
    });
    emitter.mark_label(&main);
    emitter.call_function(&f, 0, |_| 0);
    emitter.emit0(Opcode::Hlt);

    let mut machine = Machine::load(&emitter.finish());
    machine.run().unwrap();

    assert_eq!(machine.register(result), 1);
}
