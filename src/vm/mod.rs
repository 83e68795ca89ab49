//! Register-based bytecode VM: compiles the AST to fixed-width instructions
//! and executes them against a flat register file and a collected heap.

pub mod chunk;
pub mod compiler;
pub mod compiler_exprs;
pub mod compiler_patterns;
pub mod compiler_stmts;
pub mod disassembler;
pub mod frame;
pub mod heap;
pub mod natives;
pub mod opcode;
pub mod scheduler;
pub mod upvalue;
pub mod value;
#[allow(clippy::module_inception)]
pub mod vm;
pub mod vm_calls;

pub use chunk::{Chunk, ChunkStats, CompiledModule, Constant};
pub use compiler::Compiler;
pub use disassembler::disassemble;
pub use frame::TraceFrame;
pub use heap::{Heap, HeapStats, ObjKind};
pub use natives::{NativeContext, NativeFn};
pub use opcode::{Instruction, OpCode};
pub use value::{GcRef, Value};
pub use vm::{Vm, VmConfig, VmResult};
