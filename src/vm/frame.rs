//! Call frames: one activation record per executing closure.

use std::rc::Rc;

use super::chunk::Chunk;
use super::value::GcRef;

/// Default bound on the frame stack.
pub const MAX_FRAMES: usize = 256;

/// Registers reserved per frame when sizing the register file.
pub const REGISTERS_PER_FRAME: usize = 256;

/// A call frame on the VM call stack.
///
/// The frame owns the register window `[base, base + chunk.max_registers)`.
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// The closure being executed (a GC root while the frame is live).
    pub closure: GcRef,
    /// The chunk that closure runs, cached to avoid a heap lookup per instruction.
    pub chunk: Rc<Chunk>,
    /// Index of the next instruction to execute.
    pub ip: usize,
    /// Absolute index of register 0 of this frame.
    pub base: usize,
    /// Absolute register that receives this frame's return value.
    pub return_register: usize,
    /// When set, returning from this frame leaves the dispatch loop instead
    /// of resuming the caller (host calls and spawned tasks).
    pub exits_run: bool,
}

impl CallFrame {
    /// One past the last register this frame may touch.
    pub fn window_end(&self) -> usize {
        self.base + self.chunk.max_registers
    }

    /// Source line of the instruction that is currently executing.
    pub fn current_line(&self) -> usize {
        self.chunk.line_at(self.ip.saturating_sub(1))
    }
}

/// One line of a fault backtrace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub line: usize,
}
