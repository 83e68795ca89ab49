//! Function call dispatch for the VM: frames, natives, closures, tasks and
//! fault unwinding.

use std::rc::Rc;

use tracing::{trace, warn};

use crate::error::RuntimeError;
use crate::span::Span;

use super::chunk::Chunk;
use super::frame::{CallFrame, TraceFrame};
use super::heap::ObjKind;
use super::natives::NativeContext;
use super::upvalue::{Closure, UpvalueCell};
use super::value::{GcRef, Value};
use super::vm::{Vm, VmResult};

impl Vm {
    /// Call a closure, function or native from the host.
    ///
    /// On a fault the frames this call pushed are discarded and the backtrace
    /// is kept in `last_trace`, so the VM can run the next call.
    pub fn call(&mut self, callee: Value, args: &[Value]) -> VmResult<Value> {
        let depth = self.frames.len();
        let result = self.invoke(callee, args);
        if let Err(error) = &result {
            self.unwind(depth, error);
        }
        result
    }

    /// Place `args` above the active window and run `callee` to completion.
    pub(crate) fn invoke(&mut self, callee: Value, args: &[Value]) -> VmResult<Value> {
        let base = self.frames.last().map_or(0, CallFrame::window_end);
        let span = Span::at_line(self.frames.last().map_or(0, CallFrame::current_line));
        if base + args.len() > self.registers.len() {
            return Err(RuntimeError::StackOverflow {
                depth: self.frames.len(),
                span,
            });
        }
        self.registers[base..base + args.len()].copy_from_slice(args);

        match self.call_value(callee, base, args.len(), base, true, span)? {
            Some(result) => Ok(result),
            None => self.run(),
        }
    }

    /// Call `callee` with `argc` arguments starting at absolute register `args_base`.
    ///
    /// Natives complete immediately and their result is returned; bytecode
    /// callees get a new frame and `None` is returned.
    pub(crate) fn call_value(
        &mut self,
        callee: Value,
        args_base: usize,
        argc: usize,
        return_register: usize,
        exits_run: bool,
        span: Span,
    ) -> VmResult<Option<Value>> {
        let Some(r) = callee.as_obj() else {
            return Err(RuntimeError::not_callable(self.heap.type_name(&callee), span));
        };
        if matches!(self.heap.kind(r), Some(ObjKind::Native(_))) {
            return self.call_native(r, args_base, argc, span).map(Some);
        }
        let chunk = match self.heap.kind(r) {
            Some(ObjKind::Closure(closure)) => match self.heap.kind(closure.function) {
                Some(ObjKind::Function(chunk)) => Rc::clone(chunk),
                _ => return Err(RuntimeError::invalid_bytecode("closure without a function", span)),
            },
            // A bare function has nowhere to keep captured cells.
            Some(ObjKind::Function(chunk)) if chunk.upvalues.is_empty() => Rc::clone(chunk),
            _ => return Err(RuntimeError::not_callable(self.heap.type_name(&callee), span)),
        };
        self.push_frame(r, chunk, args_base, argc, return_register, exits_run, span)?;
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    fn push_frame(
        &mut self,
        closure: GcRef,
        chunk: Rc<Chunk>,
        base: usize,
        argc: usize,
        return_register: usize,
        exits_run: bool,
        span: Span,
    ) -> VmResult<()> {
        let arity = chunk.arity as usize;
        if argc > arity {
            return Err(RuntimeError::wrong_arity(arity, argc, span));
        }
        let depth = self.frames.len();
        let window_end = base + chunk.max_registers.max(arity);
        if depth >= self.config.max_frames || window_end > self.registers.len() {
            return Err(RuntimeError::StackOverflow { depth, span });
        }
        // Missing arguments read as null; so does every other fresh register.
        self.registers[base + argc..window_end].fill(Value::Null);

        trace!(function = %chunk.name, depth = depth + 1, "call");
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            base,
            return_register,
            exits_run,
        });
        Ok(())
    }

    fn call_native(
        &mut self,
        native: GcRef,
        args_base: usize,
        argc: usize,
        span: Span,
    ) -> VmResult<Value> {
        let (func, arity) = match self.heap.kind(native) {
            Some(ObjKind::Native(n)) => (n.func, n.arity),
            _ => return Err(RuntimeError::invalid_bytecode("not a native function", span)),
        };
        if let Some(expected) = arity {
            if argc != expected {
                return Err(RuntimeError::wrong_arity(expected, argc, span));
            }
        }

        let args = &self.registers[args_base..args_base + argc];
        let mut ctx = NativeContext {
            heap: &mut self.heap,
            output: &mut self.output,
        };
        let result = func(&mut ctx, args);
        result.map_err(|message| RuntimeError::Native {
            name: self.native_name(native),
            message,
            span,
        })
    }

    fn native_name(&self, native: GcRef) -> String {
        match self.heap.kind(native) {
            Some(ObjKind::Native(n)) => n.name.clone(),
            _ => String::from("<native>"),
        }
    }

    /// Pop the current frame and deliver `value` to the caller.
    ///
    /// Returns `Some(value)` when the frame was entered from the host (or a
    /// task), meaning the dispatch loop should stop.
    pub(crate) fn return_from_frame(
        &mut self,
        value: Value,
        span: Span,
    ) -> VmResult<Option<Value>> {
        let Some(frame) = self.frames.pop() else {
            return Err(RuntimeError::invalid_bytecode("return with no active frame", span));
        };
        self.close_upvalues(frame.base);
        trace!(function = %frame.chunk.name, depth = self.frames.len(), "return");

        if frame.exits_run {
            return Ok(Some(value));
        }
        self.registers[frame.return_register] = value;
        Ok(None)
    }

    // --- Closures ---

    /// Instantiate `proto` as a closure inside the frame running `enclosing`.
    pub(crate) fn make_closure(
        &mut self,
        proto: &Rc<Chunk>,
        enclosing: GcRef,
        base: usize,
        span: Span,
    ) -> VmResult<GcRef> {
        let mut upvalues = Vec::with_capacity(proto.upvalues.len());
        for desc in &proto.upvalues {
            let cell = if desc.is_local {
                self.capture_upvalue(base + desc.index as usize)
            } else {
                self.closure_upvalue(enclosing, desc.index, span)?
            };
            upvalues.push(cell);
        }
        let function = self.heap.alloc(ObjKind::Function(Rc::clone(proto)));
        trace!(function = %proto.name, cells = upvalues.len(), "closure");
        Ok(self.heap.alloc(ObjKind::Closure(Closure::new(function, upvalues))))
    }

    /// Find or create the open cell aliasing absolute `register`.
    fn capture_upvalue(&mut self, register: usize) -> GcRef {
        match self.open_upvalues.binary_search_by_key(&register, |&(r, _)| r) {
            Ok(pos) => self.open_upvalues[pos].1,
            Err(pos) => {
                let cell = self.heap.alloc(ObjKind::Upvalue(UpvalueCell::Open(register)));
                self.open_upvalues.insert(pos, (register, cell));
                cell
            }
        }
    }

    /// Close every open cell at or above absolute register `from`.
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        let split = self.open_upvalues.partition_point(|&(r, _)| r < from);
        for (register, cell) in self.open_upvalues.drain(split..) {
            if let Some(kind) = self.heap.kind_mut(cell) {
                *kind = ObjKind::Upvalue(UpvalueCell::Closed(self.registers[register]));
            }
        }
    }

    // --- Tasks ---

    /// Run queued tasks to completion.
    pub(crate) fn run_tasks(&mut self) -> VmResult<()> {
        while let Some(task) = self.scheduler.next_ready() {
            self.invoke(Value::Obj(task.closure), &[])?;
            self.scheduler.complete(task.id);
        }
        Ok(())
    }

    // --- Faults ---

    /// Drop the frames above `depth` after a fault, recording a backtrace.
    fn unwind(&mut self, depth: usize, error: &RuntimeError) {
        let unwound = self.frames.get(depth..).unwrap_or(&[]);
        self.last_trace = unwound
            .iter()
            .rev()
            .map(|f| TraceFrame {
                function: f.chunk.name.clone(),
                line: f.current_line(),
            })
            .collect();
        if !unwound.is_empty() {
            warn!(%error, frames = unwound.len(), "runtime fault, unwinding");
        }
        let lowest_base = unwound.first().map(|f| f.base);

        if let Some(base) = lowest_base {
            self.close_upvalues(base);
        }
        self.frames.truncate(depth);
        if depth == 0 {
            self.scheduler.clear();
            self.open_upvalues.clear();
        }
    }
}
