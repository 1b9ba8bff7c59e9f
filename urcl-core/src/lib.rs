//! URCL Code Generator - Core
//!
//! The instruction/label data model for the URCL register machine
//! language, the source line parser, the free-list register allocator,
//! the class layout arena, and the emitter with its high-level services.
//! Backend lowering lives in `urcl-targets`; direct execution lives in
//! `urcl-vm`.

pub mod emitter;
pub mod inst;
pub mod layout;
pub mod opcode;
pub mod parser;
pub mod program;
pub mod regmap;

pub use emitter::{Emitter, EmitterOptions};
pub use inst::{Instruction, Label, Operand, Reg};
pub use layout::{ClassId, FieldDef, LayoutError, TypeRegistry};
pub use opcode::Opcode;
pub use parser::{parse_line, parse_source, Line, ParseError};
pub use program::Program;
pub use regmap::RegisterMap;
