//! Closure and captured-variable cell types.

use super::value::{GcRef, Value};

/// A closure: a function object paired with its captured cells.
#[derive(Debug, Clone)]
pub struct Closure {
    /// Heap handle of the `ObjKind::Function` this closure instantiates.
    pub function: GcRef,
    /// Handles of `ObjKind::Upvalue` cells, one per descriptor in the chunk.
    pub upvalues: Vec<GcRef>,
}

impl Closure {
    pub fn new(function: GcRef, upvalues: Vec<GcRef>) -> Self {
        Self { function, upvalues }
    }
}

/// A captured-variable cell.
///
/// While the captured local's scope is still active, the cell is "open" and
/// aliases that local's absolute register. When the scope exits (or its frame
/// returns) the cell is "closed": the value moves out of the register file and
/// into the cell. Every closure over the variable shares the same cell.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueCell {
    /// Points to a live register.
    Open(usize),
    /// Holds the captured value after the scope exits.
    Closed(Value),
}

/// Descriptor emitted by the compiler for each upvalue a closure captures.
/// Used at runtime when creating the closure to wire up the cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDescriptor {
    /// If true, the upvalue captures a register of the immediately enclosing function.
    /// If false, it shares an upvalue from the enclosing closure's list.
    pub is_local: bool,
    /// Register index (if `is_local`) or upvalue index in the enclosing closure.
    pub index: u8,
}
