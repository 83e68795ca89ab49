//! Bytecode chunk: one compiled function body.

use std::rc::Rc;

use serde::Serialize;

use super::opcode::{Instruction, OpCode};
use super::upvalue::UpvalueDescriptor;

/// A constant value stored in a chunk's constant pool.
#[derive(Debug, Clone)]
pub enum Constant {
    Int(i64),
    Float(f64),
    String(String),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Int(a), Constant::Int(b)) => a == b,
            // Bitwise so that 0.0 and -0.0 (and NaNs) get separate slots.
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::String(a), Constant::String(b)) => a == b,
            _ => false,
        }
    }
}

/// A compiled function body (or the implicit top-level function).
///
/// Built once by the compiler and never mutated afterwards; the VM shares it
/// through `Rc` between every function object created from it.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    /// Function name (`<script>` for the top level).
    pub name: String,
    /// Encoded instructions.
    pub code: Vec<Instruction>,
    /// Source line numbers, parallel to `code`.
    pub lines: Vec<usize>,
    /// Constant pool.
    pub constants: Vec<Constant>,
    /// Nested function literals, indexed by the `Closure` opcode.
    pub prototypes: Vec<Rc<Chunk>>,
    /// Size of the register window a frame running this chunk needs.
    pub max_registers: usize,
    /// Number of declared parameters.
    pub arity: u8,
    /// Where each captured cell comes from when a closure is built.
    pub upvalues: Vec<UpvalueDescriptor>,
}

impl Chunk {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Append an instruction and record its source line.
    pub fn emit(&mut self, instruction: Instruction, line: usize) -> usize {
        let offset = self.code.len();
        self.code.push(instruction);
        self.lines.push(line);
        offset
    }

    /// Add a constant to the pool, reusing an identical entry, and return its index.
    pub fn add_constant(&mut self, constant: Constant) -> usize {
        if let Some(idx) = self.constants.iter().position(|c| *c == constant) {
            return idx;
        }
        self.constants.push(constant);
        self.constants.len() - 1
    }

    /// Number of captured-variable slots a closure of this chunk carries.
    pub fn upvalue_count(&self) -> usize {
        self.upvalues.len()
    }

    /// Get the current offset (next instruction index).
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn line_at(&self, ip: usize) -> usize {
        self.lines.get(ip).copied().unwrap_or(0)
    }

    /// Rewrite the offset of the jump at `at`.
    pub fn set_jump_offset(&mut self, at: usize, offset: i16) {
        self.code[at] = self.code[at].with_sbx(offset);
    }

    /// Absolute target of the jump at `at`, or `None` if it is not a jump.
    pub fn jump_target(&self, at: usize) -> Option<isize> {
        let ins = self.code.get(at)?;
        match ins.opcode() {
            Some(op) if op.is_jump() => Some(at as isize + 1 + ins.sbx() as isize),
            _ => None,
        }
    }

    /// Collect statistics over this chunk and every nested prototype.
    pub fn stats(&self) -> ChunkStats {
        let mut stats = ChunkStats {
            instructions: self.code.len(),
            constants: self.constants.len(),
            prototypes: self.prototypes.len(),
            max_registers: self.max_registers,
        };
        for proto in &self.prototypes {
            let inner = proto.stats();
            stats.instructions += inner.instructions;
            stats.constants += inner.constants;
            stats.prototypes += inner.prototypes;
            stats.max_registers = stats.max_registers.max(inner.max_registers);
        }
        stats
    }

    /// Count of a given opcode in this chunk only. Handy for diagnostics and tests.
    pub fn count_op(&self, op: OpCode) -> usize {
        self.code.iter().filter(|i| i.opcode() == Some(op)).count()
    }
}

/// Summary of a compiled chunk tree, suitable for diagnostic display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkStats {
    /// Instructions across the whole prototype tree.
    pub instructions: usize,
    /// Constant-pool entries across the whole prototype tree.
    pub constants: usize,
    /// Nested prototypes at any depth.
    pub prototypes: usize,
    /// Largest register window of any chunk in the tree.
    pub max_registers: usize,
}

impl ChunkStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A compiled module: the top-level chunk and its statistics.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub main: Rc<Chunk>,
    pub stats: ChunkStats,
}

impl CompiledModule {
    pub fn new(main: Chunk) -> Self {
        let stats = main.stats();
        Self {
            main: Rc::new(main),
            stats,
        }
    }
}
