//! The bytecode virtual machine: a register-based execution engine.

use std::cmp::Ordering;
use std::rc::Rc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::span::Span;

use super::chunk::{Chunk, Constant};
use super::frame::{CallFrame, TraceFrame, MAX_FRAMES, REGISTERS_PER_FRAME};
use super::heap::{Heap, NativeFunction, ObjKind, ValueMap, INITIAL_GC_THRESHOLD};
use super::natives::{prelude, NativeFn};
use super::opcode::OpCode;
use super::scheduler::Scheduler;
use super::upvalue::{Closure, UpvalueCell};
use super::value::{GcRef, Value};

/// Result type for execution.
pub type VmResult<T> = Result<T, RuntimeError>;

/// Engine limits and collector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Deepest call stack allowed before a stack-overflow fault.
    pub max_frames: usize,
    /// Live-object count that triggers the first collection.
    pub gc_threshold: usize,
    /// Collect before every instruction (slow; for tests).
    pub gc_stress: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_frames: MAX_FRAMES,
            gc_threshold: INITIAL_GC_THRESHOLD,
            gc_stress: false,
        }
    }
}

/// The bytecode VM.
pub struct Vm {
    /// Flat register file; each frame owns a window of it.
    pub(crate) registers: Vec<Value>,
    /// Call frame stack.
    pub(crate) frames: Vec<CallFrame>,
    /// Global variables.
    pub(crate) globals: AHashMap<String, Value>,
    /// Open cells as (absolute register, cell), sorted by register.
    pub(crate) open_upvalues: Vec<(usize, GcRef)>,
    pub(crate) heap: Heap,
    pub(crate) scheduler: Scheduler,
    /// Values the host asked to keep alive.
    extra_roots: Vec<GcRef>,
    /// Output buffer for print (for testing/capture).
    pub(crate) output: Vec<String>,
    pub(crate) last_trace: Vec<TraceFrame>,
    pub(crate) config: VmConfig,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut vm = Self {
            registers: vec![Value::Null; config.max_frames * REGISTERS_PER_FRAME],
            frames: Vec::with_capacity(64),
            globals: AHashMap::new(),
            open_upvalues: Vec::new(),
            heap: Heap::with_threshold(config.gc_threshold),
            scheduler: Scheduler::new(),
            extra_roots: Vec::new(),
            output: Vec::new(),
            last_trace: Vec::new(),
            config,
        };
        for (name, arity, func) in prelude() {
            vm.define_native(name, arity, func);
        }
        vm
    }

    /// Run a top-level chunk and return its value.
    pub fn execute(&mut self, chunk: &Rc<Chunk>) -> VmResult<Value> {
        if chunk.upvalue_count() > 0 {
            return Err(RuntimeError::invalid_bytecode(
                format!("top-level chunk '{}' expects captured cells", chunk.name),
                Span::default(),
            ));
        }
        let function = self.heap.alloc(ObjKind::Function(Rc::clone(chunk)));
        let closure = self.heap.alloc(ObjKind::Closure(Closure::new(function, Vec::new())));
        self.call(Value::Obj(closure), &[])
    }

    /// Register a host function as a global.
    pub fn define_native(&mut self, name: &str, arity: Option<usize>, func: NativeFn) {
        let native = self.heap.alloc(ObjKind::Native(NativeFunction {
            name: name.to_string(),
            arity,
            func,
        }));
        self.globals.insert(name.to_string(), Value::Obj(native));
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).copied()
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Lines written by `print`.
    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    /// Backtrace of the most recent fault, innermost frame first.
    pub fn last_trace(&self) -> &[TraceFrame] {
        &self.last_trace
    }

    pub fn display(&self, value: &Value) -> String {
        self.heap.display(value)
    }

    /// Keep `value` alive across collections until `remove_root`.
    pub fn add_root(&mut self, value: Value) {
        if let Some(r) = value.as_obj() {
            self.extra_roots.push(r);
        }
    }

    pub fn remove_root(&mut self, value: Value) {
        if let Some(r) = value.as_obj() {
            if let Some(pos) = self.extra_roots.iter().rposition(|&x| x == r) {
                self.extra_roots.swap_remove(pos);
            }
        }
    }

    /// Run a full collection now; returns the number of objects freed.
    pub fn collect_garbage(&mut self) -> usize {
        let roots = self.roots();
        self.heap.collect(roots)
    }

    fn roots(&self) -> Vec<GcRef> {
        let mut roots = Vec::new();
        for frame in &self.frames {
            roots.push(frame.closure);
            let window = &self.registers[frame.base..frame.window_end()];
            roots.extend(window.iter().filter_map(Value::as_obj));
        }
        roots.extend(self.globals.values().filter_map(Value::as_obj));
        roots.extend(self.open_upvalues.iter().map(|&(_, cell)| cell));
        roots.extend(self.scheduler.roots());
        roots.extend(self.extra_roots.iter().copied());
        roots
    }

    /// Run the dispatch loop until a frame marked `exits_run` returns.
    pub(crate) fn run(&mut self) -> VmResult<Value> {
        loop {
            if (self.config.gc_stress && self.heap.live_count() > 0) || self.heap.should_collect() {
                self.collect_garbage();
            }

            let Some(frame) = self.frames.last_mut() else {
                return Err(RuntimeError::invalid_bytecode("no active frame", Span::default()));
            };
            let Some(&ins) = frame.chunk.code.get(frame.ip) else {
                return Err(RuntimeError::invalid_bytecode(
                    format!("ran off the end of '{}'", frame.chunk.name),
                    Span::at_line(frame.current_line()),
                ));
            };
            let span = Span::at_line(frame.chunk.line_at(frame.ip));
            frame.ip += 1;
            let base = frame.base;
            let closure = frame.closure;
            let chunk = Rc::clone(&frame.chunk);

            let Some(op) = ins.opcode() else {
                return Err(RuntimeError::invalid_bytecode(
                    format!("unknown opcode {}", ins.op_byte()),
                    span,
                ));
            };
            let a = base + ins.a() as usize;

            match op {
                OpCode::LoadConst => {
                    let value = match chunk.constants.get(ins.bx() as usize) {
                        Some(Constant::Int(n)) => Value::Int(*n),
                        Some(Constant::Float(n)) => Value::Float(*n),
                        Some(Constant::String(s)) => self.heap.alloc_string(s.as_str()),
                        None => {
                            let msg = "constant index out of range";
                            return Err(RuntimeError::invalid_bytecode(msg, span));
                        }
                    };
                    self.registers[a] = value;
                }
                OpCode::LoadInt => self.registers[a] = Value::Int(ins.sbx() as i64),
                OpCode::LoadNull => self.registers[a] = Value::Null,
                OpCode::LoadTrue => self.registers[a] = Value::Bool(true),
                OpCode::LoadFalse => self.registers[a] = Value::Bool(false),
                OpCode::Move => self.registers[a] = self.registers[base + ins.b() as usize],

                // --- Arithmetic ---
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
                    let x = self.registers[base + ins.b() as usize];
                    let y = self.registers[base + ins.c() as usize];
                    self.registers[a] = self.op_arith(op, x, y, span)?;
                }
                OpCode::Neg => {
                    let value = match self.registers[base + ins.b() as usize] {
                        Value::Int(n) => {
                            let negated = n
                                .checked_neg()
                                .ok_or_else(|| RuntimeError::overflow("negation", span))?;
                            Value::Int(negated)
                        }
                        Value::Float(n) => Value::Float(-n),
                        other => {
                            return Err(RuntimeError::type_error(
                                format!("Cannot negate {}", self.heap.type_name(&other)),
                                span,
                            ));
                        }
                    };
                    self.registers[a] = value;
                }

                // --- Comparison ---
                OpCode::Eq | OpCode::NotEq => {
                    let x = self.registers[base + ins.b() as usize];
                    let y = self.registers[base + ins.c() as usize];
                    let equal = self.heap.values_equal(&x, &y);
                    self.registers[a] = Value::Bool(equal == (op == OpCode::Eq));
                }
                OpCode::Lt | OpCode::LtEq | OpCode::Gt | OpCode::GtEq => {
                    let x = self.registers[base + ins.b() as usize];
                    let y = self.registers[base + ins.c() as usize];
                    let result = match self.op_compare(&x, &y, span)? {
                        None => false,
                        Some(ord) => match op {
                            OpCode::Lt => ord == Ordering::Less,
                            OpCode::LtEq => ord != Ordering::Greater,
                            OpCode::Gt => ord == Ordering::Greater,
                            _ => ord != Ordering::Less,
                        },
                    };
                    self.registers[a] = Value::Bool(result);
                }
                OpCode::Not => {
                    let truthy = self.registers[base + ins.b() as usize].is_truthy();
                    self.registers[a] = Value::Bool(!truthy);
                }
                OpCode::Truth => {
                    let truthy = self.registers[base + ins.b() as usize].is_truthy();
                    self.registers[a] = Value::Bool(truthy);
                }

                // --- Variables ---
                OpCode::GetGlobal => {
                    let name = constant_str(&chunk, ins.bx(), span)?;
                    match self.globals.get(name) {
                        Some(value) => self.registers[a] = *value,
                        None => return Err(RuntimeError::undefined_variable(name, span)),
                    }
                }
                OpCode::SetGlobal => {
                    let name = constant_str(&chunk, ins.bx(), span)?;
                    self.globals.insert(name.to_string(), self.registers[a]);
                }
                OpCode::GetUpvalue => {
                    let cell = self.closure_upvalue(closure, ins.b(), span)?;
                    self.registers[a] = self.read_upvalue(cell, span)?;
                }
                OpCode::SetUpvalue => {
                    let cell = self.closure_upvalue(closure, ins.a(), span)?;
                    let value = self.registers[base + ins.b() as usize];
                    self.write_upvalue(cell, value, span)?;
                }

                // --- Collections ---
                OpCode::NewArray => {
                    let start = base + ins.b() as usize;
                    let items = self.registers[start..start + ins.c() as usize].to_vec();
                    self.registers[a] = self.heap.alloc_array(items);
                }
                OpCode::NewMap => {
                    let start = base + ins.b() as usize;
                    let mut map = ValueMap::default();
                    let end = start + 2 * ins.c() as usize;
                    for pair in self.registers[start..end].chunks_exact(2) {
                        let Some(key) = self.heap.as_str(&pair[0]) else {
                            return Err(RuntimeError::type_error(
                                format!(
                                    "Map keys must be strings, got {}",
                                    self.heap.type_name(&pair[0])
                                ),
                                span,
                            ));
                        };
                        map.insert(key.to_string(), pair[1]);
                    }
                    self.registers[a] = Value::Obj(self.heap.alloc(ObjKind::Map(map)));
                }
                OpCode::GetField => {
                    let name = constant_str(&chunk, ins.c() as u16, span)?;
                    let object = self.registers[base + ins.b() as usize];
                    self.registers[a] = self.get_field(object, name, span)?;
                }
                OpCode::SetField => {
                    let name = constant_str(&chunk, ins.b() as u16, span)?;
                    let value = self.registers[base + ins.c() as usize];
                    self.set_field(self.registers[a], name, value, span)?;
                }
                OpCode::GetIndex => {
                    let object = self.registers[base + ins.b() as usize];
                    let index = self.registers[base + ins.c() as usize];
                    self.registers[a] = self.get_index(object, index, span)?;
                }
                OpCode::SetIndex => {
                    let index = self.registers[base + ins.b() as usize];
                    let value = self.registers[base + ins.c() as usize];
                    self.set_index(self.registers[a], index, value, span)?;
                }
                OpCode::Len => {
                    let value = self.registers[base + ins.b() as usize];
                    let len = self.length_of(&value).ok_or_else(|| {
                        let type_name = self.heap.type_name(&value);
                        RuntimeError::type_error(format!("{} has no length", type_name), span)
                    })?;
                    self.registers[a] = Value::Int(len as i64);
                }
                OpCode::Concat => {
                    let mut text = self.heap.display(&self.registers[base + ins.b() as usize]);
                    text.push_str(&self.heap.display(&self.registers[base + ins.c() as usize]));
                    self.registers[a] = self.heap.alloc_string(text);
                }
                OpCode::Interpolate => {
                    let start = base + ins.b() as usize;
                    let text: String = self.registers[start..start + ins.c() as usize]
                        .iter()
                        .map(|v| self.heap.display(v))
                        .collect();
                    self.registers[a] = self.heap.alloc_string(text);
                }

                // --- Control flow ---
                OpCode::Jump | OpCode::Loop => self.jump_by(ins.sbx()),
                OpCode::JumpIfFalse => {
                    if !self.registers[a].is_truthy() {
                        self.jump_by(ins.sbx());
                    }
                }
                OpCode::JumpIfTrue => {
                    if self.registers[a].is_truthy() {
                        self.jump_by(ins.sbx());
                    }
                }

                // --- Functions ---
                OpCode::Call => {
                    let callee = self.registers[a];
                    let dst = base + ins.c() as usize;
                    let argc = ins.b() as usize;
                    if let Some(result) = self.call_value(callee, a + 1, argc, dst, false, span)? {
                        self.registers[dst] = result;
                    }
                }
                OpCode::Return => {
                    let value = self.registers[a];
                    if let Some(result) = self.return_from_frame(value, span)? {
                        return Ok(result);
                    }
                }
                OpCode::ReturnNull => {
                    if let Some(result) = self.return_from_frame(Value::Null, span)? {
                        return Ok(result);
                    }
                }
                OpCode::Closure => {
                    let Some(proto) = chunk.prototypes.get(ins.bx() as usize) else {
                        let msg = "prototype index out of range";
                        return Err(RuntimeError::invalid_bytecode(msg, span));
                    };
                    let made = self.make_closure(proto, closure, base, span)?;
                    self.registers[a] = Value::Obj(made);
                }
                OpCode::Close => self.close_upvalues(a),

                // --- Results ---
                OpCode::WrapOk => {
                    let value = self.registers[base + ins.b() as usize];
                    self.registers[a] = Value::Obj(self.heap.alloc(ObjKind::ResultOk(value)));
                }
                OpCode::WrapErr => {
                    let value = self.registers[base + ins.b() as usize];
                    self.registers[a] = Value::Obj(self.heap.alloc(ObjKind::ResultErr(value)));
                }
                OpCode::TestResult => {
                    let value = self.registers[base + ins.b() as usize];
                    let want_err = ins.c() != 0;
                    let matches = match value.as_obj().and_then(|r| self.heap.kind(r)) {
                        Some(ObjKind::ResultOk(_)) => !want_err,
                        Some(ObjKind::ResultErr(_)) => want_err,
                        _ => false,
                    };
                    self.registers[a] = Value::Bool(matches);
                }
                OpCode::Unwrap => {
                    let value = self.registers[base + ins.b() as usize];
                    self.registers[a] = match value.as_obj().and_then(|r| self.heap.kind(r)) {
                        Some(ObjKind::ResultOk(payload) | ObjKind::ResultErr(payload)) => *payload,
                        _ => {
                            return Err(RuntimeError::type_error(
                                format!("Cannot unwrap {}", self.heap.type_name(&value)),
                                span,
                            ));
                        }
                    };
                }
                OpCode::Try => {
                    let value = self.registers[base + ins.b() as usize];
                    let payload = match value.as_obj().and_then(|r| self.heap.kind(r)) {
                        Some(ObjKind::ResultOk(payload)) => Some(*payload),
                        Some(ObjKind::ResultErr(_)) => None,
                        _ => {
                            return Err(RuntimeError::type_error(
                                format!(
                                    "'?' expects a Result, got {}",
                                    self.heap.type_name(&value)
                                ),
                                span,
                            ));
                        }
                    };
                    match payload {
                        Some(payload) => self.registers[a] = payload,
                        // Propagate the error result out of this frame.
                        None => {
                            if let Some(result) = self.return_from_frame(value, span)? {
                                return Ok(result);
                            }
                        }
                    }
                }

                // --- Tasks ---
                OpCode::Spawn => {
                    let task = self.registers[a];
                    match task.as_obj() {
                        Some(r) if matches!(self.heap.kind(r), Some(ObjKind::Closure(_))) => {
                            self.scheduler.spawn(r);
                            self.run_tasks()?;
                        }
                        _ => {
                            return Err(RuntimeError::type_error(
                                format!("Cannot spawn {}", self.heap.type_name(&task)),
                                span,
                            ));
                        }
                    }
                }
            }
        }
    }

    fn jump_by(&mut self, offset: i16) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = (frame.ip as isize + offset as isize) as usize;
        }
    }

    // --- Arithmetic ---

    fn op_arith(&mut self, op: OpCode, x: Value, y: Value, span: Span) -> VmResult<Value> {
        if let (Value::Int(p), Value::Int(q)) = (x, y) {
            return int_arith(op, p, q, span).map(Value::Int);
        }
        if let Some((p, q)) = x.as_f64().zip(y.as_f64()) {
            return float_arith(op, p, q, span).map(Value::Float);
        }
        if op == OpCode::Add {
            if let (Some(p), Some(q)) = (self.heap.as_str(&x), self.heap.as_str(&y)) {
                let joined = format!("{}{}", p, q);
                return Ok(self.heap.alloc_string(joined));
            }
        }
        Err(RuntimeError::type_error(
            format!(
                "Cannot apply {} to {} and {}",
                op.mnemonic(),
                self.heap.type_name(&x),
                self.heap.type_name(&y)
            ),
            span,
        ))
    }

    /// Ordering for `<`-family opcodes. `None` means unordered (NaN).
    fn op_compare(&self, x: &Value, y: &Value, span: Span) -> VmResult<Option<Ordering>> {
        if let (Value::Int(p), Value::Int(q)) = (x, y) {
            return Ok(Some(p.cmp(q)));
        }
        if let Some((p, q)) = x.as_f64().zip(y.as_f64()) {
            return Ok(p.partial_cmp(&q));
        }
        match (self.heap.as_str(x), self.heap.as_str(y)) {
            (Some(p), Some(q)) => Ok(Some(p.cmp(q))),
            _ => Err(RuntimeError::type_error(
                format!(
                    "Cannot compare {} and {}",
                    self.heap.type_name(x),
                    self.heap.type_name(y)
                ),
                span,
            )),
        }
    }

    // --- Index and field operations ---

    fn length_of(&self, value: &Value) -> Option<usize> {
        match self.heap.kind(value.as_obj()?)? {
            ObjKind::String(s) => Some(s.chars().count()),
            ObjKind::Array(items) => Some(items.len()),
            ObjKind::Map(map) => Some(map.len()),
            _ => None,
        }
    }

    fn get_index(&mut self, object: Value, index: Value, span: Span) -> VmResult<Value> {
        let kind = object.as_obj().and_then(|r| self.heap.kind(r));
        match kind {
            Some(ObjKind::Array(items)) => {
                let i = self.int_index(&index, span)?;
                usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i).copied())
                    .ok_or_else(|| RuntimeError::index_out_of_bounds(i, items.len(), span))
            }
            Some(ObjKind::String(s)) => {
                let i = self.int_index(&index, span)?;
                let ch = usize::try_from(i).ok().and_then(|i| s.chars().nth(i));
                match ch {
                    Some(ch) => Ok(self.heap.alloc_string(ch.to_string())),
                    None => Err(RuntimeError::index_out_of_bounds(i, s.chars().count(), span)),
                }
            }
            Some(ObjKind::Map(map)) => {
                let Some(key) = self.heap.as_str(&index) else {
                    return Err(RuntimeError::type_error(
                        format!("Map keys must be strings, got {}", self.heap.type_name(&index)),
                        span,
                    ));
                };
                Ok(map.get(key).copied().unwrap_or(Value::Null))
            }
            _ => Err(RuntimeError::type_error(
                format!("Cannot index into {}", self.heap.type_name(&object)),
                span,
            )),
        }
    }

    fn set_index(&mut self, object: Value, index: Value, value: Value, span: Span) -> VmResult<()> {
        let type_name = self.heap.type_name(&object);
        let key = self.heap.as_str(&index).map(str::to_owned);
        let int_index = index.as_int();
        let index_type = self.heap.type_name(&index);

        match self.heap.obj_mut(&object) {
            Some(ObjKind::Array(items)) => {
                let Some(i) = int_index else {
                    return Err(RuntimeError::type_error(
                        format!("Array index must be Int, got {}", index_type),
                        span,
                    ));
                };
                let len = items.len();
                match usize::try_from(i).ok().and_then(|i| items.get_mut(i)) {
                    Some(slot) => *slot = value,
                    None => return Err(RuntimeError::index_out_of_bounds(i, len, span)),
                }
            }
            Some(ObjKind::Map(map)) => {
                let Some(key) = key else {
                    return Err(RuntimeError::type_error(
                        format!("Map keys must be strings, got {}", index_type),
                        span,
                    ));
                };
                map.insert(key, value);
            }
            _ => {
                return Err(RuntimeError::type_error(
                    format!("Cannot assign by index into {}", type_name),
                    span,
                ));
            }
        }
        Ok(())
    }

    fn int_index(&self, index: &Value, span: Span) -> VmResult<i64> {
        index.as_int().ok_or_else(|| {
            let type_name = self.heap.type_name(index);
            RuntimeError::type_error(format!("Index must be Int, got {}", type_name), span)
        })
    }

    /// `obj.name`: map entries first, then the built-in `len` property.
    fn get_field(&self, object: Value, name: &str, span: Span) -> VmResult<Value> {
        if let Some(ObjKind::Map(map)) = object.as_obj().and_then(|r| self.heap.kind(r)) {
            if let Some(value) = map.get(name) {
                return Ok(*value);
            }
        }
        if name == "len" {
            if let Some(len) = self.length_of(&object) {
                return Ok(Value::Int(len as i64));
            }
        }
        Err(RuntimeError::no_such_property(self.heap.type_name(&object), name, span))
    }

    fn set_field(&mut self, object: Value, name: &str, value: Value, span: Span) -> VmResult<()> {
        let type_name = self.heap.type_name(&object);
        match self.heap.obj_mut(&object) {
            Some(ObjKind::Map(map)) => {
                map.insert(name.to_string(), value);
                Ok(())
            }
            _ => Err(RuntimeError::type_error(
                format!("Cannot set property '{}' on {}", name, type_name),
                span,
            )),
        }
    }

    // --- Captured cells ---

    pub(crate) fn closure_upvalue(&self, closure: GcRef, index: u8, span: Span) -> VmResult<GcRef> {
        let cell = match self.heap.kind(closure) {
            Some(ObjKind::Closure(c)) => c.upvalues.get(index as usize).copied(),
            _ => None,
        };
        cell.ok_or_else(|| {
            RuntimeError::invalid_bytecode(format!("no captured cell {}", index), span)
        })
    }

    fn read_upvalue(&self, cell: GcRef, span: Span) -> VmResult<Value> {
        match self.heap.kind(cell) {
            Some(ObjKind::Upvalue(UpvalueCell::Open(register))) => Ok(self.registers[*register]),
            Some(ObjKind::Upvalue(UpvalueCell::Closed(value))) => Ok(*value),
            _ => Err(RuntimeError::invalid_bytecode("not a captured cell", span)),
        }
    }

    fn write_upvalue(&mut self, cell: GcRef, value: Value, span: Span) -> VmResult<()> {
        match self.heap.kind_mut(cell) {
            Some(ObjKind::Upvalue(UpvalueCell::Open(register))) => {
                let register = *register;
                self.registers[register] = value;
            }
            Some(ObjKind::Upvalue(UpvalueCell::Closed(slot))) => *slot = value,
            _ => return Err(RuntimeError::invalid_bytecode("not a captured cell", span)),
        }
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn constant_str(chunk: &Chunk, index: u16, span: Span) -> VmResult<&str> {
    match chunk.constants.get(index as usize) {
        Some(Constant::String(s)) => Ok(s),
        _ => Err(RuntimeError::invalid_bytecode(
            format!("constant {} is not a name", index),
            span,
        )),
    }
}

fn int_arith(op: OpCode, p: i64, q: i64, span: Span) -> VmResult<i64> {
    match op {
        OpCode::Add => p.checked_add(q).ok_or_else(|| RuntimeError::overflow("addition", span)),
        OpCode::Sub => p.checked_sub(q).ok_or_else(|| RuntimeError::overflow("subtraction", span)),
        OpCode::Mul => p
            .checked_mul(q)
            .ok_or_else(|| RuntimeError::overflow("multiplication", span)),
        OpCode::Div if q == 0 => Err(RuntimeError::division_by_zero(span)),
        OpCode::Div => p.checked_div(q).ok_or_else(|| RuntimeError::overflow("division", span)),
        OpCode::Mod if q == 0 => Err(RuntimeError::division_by_zero(span)),
        OpCode::Mod => p.checked_rem(q).ok_or_else(|| RuntimeError::overflow("modulo", span)),
        _ => Err(RuntimeError::invalid_bytecode("not an arithmetic opcode", span)),
    }
}

fn float_arith(op: OpCode, p: f64, q: f64, span: Span) -> VmResult<f64> {
    match op {
        OpCode::Add => Ok(p + q),
        OpCode::Sub => Ok(p - q),
        OpCode::Mul => Ok(p * q),
        OpCode::Div | OpCode::Mod if q == 0.0 => Err(RuntimeError::division_by_zero(span)),
        OpCode::Div => Ok(p / q),
        OpCode::Mod => Ok(p % q),
        _ => Err(RuntimeError::invalid_bytecode("not an arithmetic opcode", span)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::ast::{BinaryOp, Expr, MatchPattern, Program, Stmt, StmtKind};
    use crate::vm::frame::TraceFrame;
    use crate::vm::Compiler;
    use pretty_assertions::assert_eq;

    fn run_with(vm: &mut Vm, stmts: Vec<Stmt>) -> VmResult<Value> {
        let module = Compiler::compile(&program(stmts)).unwrap();
        vm.execute(&module.main)
    }

    fn run(stmts: Vec<Stmt>) -> VmResult<Value> {
        run_with(&mut Vm::new(), stmts)
    }

    fn add(l: Expr, r: Expr) -> Expr {
        binary(l, BinaryOp::Add, r)
    }

    fn sub(l: Expr, r: Expr) -> Expr {
        binary(l, BinaryOp::Subtract, r)
    }

    fn factorial() -> Stmt {
        // fn fact(n) { if n <= 1 { return 1; } return n * fact(n - 1); }
        func(
            "fact",
            &["n"],
            vec![
                if_(binary(var("n"), BinaryOp::LessEqual, int(1)), vec![ret(int(1))], None),
                ret(binary(
                    var("n"),
                    BinaryOp::Multiply,
                    call("fact", vec![sub(var("n"), int(1))]),
                )),
            ],
        )
    }

    #[test]
    fn test_vm_arithmetic() {
        let result = run(vec![
            let_("x", add(int(2), binary(int(3), BinaryOp::Multiply, int(4)))),
            expr_stmt(var("x")),
        ]);
        assert_eq!(result.unwrap(), Value::Int(14));
    }

    #[test]
    fn test_int_float_promotion_both_orders() {
        assert!(matches!(run(vec![expr_stmt(add(int(1), int(2)))]).unwrap(), Value::Int(3)));
        let mixed = run(vec![expr_stmt(add(int(1), float(2.5)))]).unwrap();
        assert!(matches!(mixed, Value::Float(f) if f == 3.5));
        let swapped = run(vec![expr_stmt(add(float(2.5), int(1)))]).unwrap();
        assert!(matches!(swapped, Value::Float(f) if f == 3.5));
        assert!(matches!(
            run(vec![expr_stmt(binary(int(7), BinaryOp::Divide, float(2.0)))]).unwrap(),
            Value::Float(f) if f == 3.5
        ));
    }

    #[test]
    fn test_integer_faults() {
        let div = run(vec![expr_stmt(binary(int(1), BinaryOp::Divide, int(0)))]);
        assert!(matches!(div, Err(RuntimeError::DivisionByZero(_))));

        let fdiv = run(vec![expr_stmt(binary(float(1.0), BinaryOp::Modulo, float(0.0)))]);
        assert!(matches!(fdiv, Err(RuntimeError::DivisionByZero(_))));

        let overflow = run(vec![expr_stmt(add(int(i64::MAX), int(1)))]);
        assert!(matches!(
            overflow,
            Err(RuntimeError::IntegerOverflow { operation: "addition", .. })
        ));
    }

    #[test]
    fn test_string_ops() {
        let mut vm = Vm::new();
        let joined = run_with(&mut vm, vec![expr_stmt(add(string("ab"), string("cd")))]).unwrap();
        assert_eq!(vm.display(&joined), "abcd");

        let concat_expr = binary(string("n="), BinaryOp::Concat, int(3));
        let concat = run_with(&mut vm, vec![expr_stmt(concat_expr)]).unwrap();
        assert_eq!(vm.display(&concat), "n=3");

        let interp = run_with(
            &mut vm,
            vec![expr_stmt(interpolate(vec![text("x = "), hole(add(int(1), int(1))), text("!")]))],
        )
        .unwrap();
        assert_eq!(vm.display(&interp), "x = 2!");

        let less_expr = binary(string("apple"), BinaryOp::Less, string("banana"));
        let less = run_with(&mut vm, vec![expr_stmt(less_expr)]);
        assert_eq!(less.unwrap(), Value::Bool(true));

        let bad = run_with(&mut vm, vec![expr_stmt(sub(string("a"), int(1)))]);
        assert!(matches!(bad, Err(RuntimeError::TypeError { .. })));
    }

    #[test]
    fn test_logical_operators_yield_booleans() {
        assert_eq!(run(vec![expr_stmt(and(int(1), int(2)))]).unwrap(), Value::Bool(true));
        assert_eq!(run(vec![expr_stmt(and(null(), int(2)))]).unwrap(), Value::Bool(false));
        assert_eq!(run(vec![expr_stmt(or(boolean(false), int(0)))]).unwrap(), Value::Bool(true));
        assert_eq!(run(vec![expr_stmt(not(int(0)))]).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_counter_closure_increases() {
        // fn make_counter() {
        //     let mut count = 0;
        //     return fn() { count = count + 1; return count; };
        // }
        let mut vm = Vm::new();
        let result = run_with(
            &mut vm,
            vec![
                func(
                    "make_counter",
                    &[],
                    vec![
                        let_mut("count", int(0)),
                        ret(lambda(
                            &[],
                            vec![
                                expr_stmt(assign("count", add(var("count"), int(1)))),
                                ret(var("count")),
                            ],
                        )),
                    ],
                ),
                let_("c", call("make_counter", vec![])),
                let_("a", call("c", vec![])),
                let_("b", call("c", vec![])),
                expr_stmt(array(vec![var("a"), var("b")])),
            ],
        )
        .unwrap();
        assert_eq!(vm.display(&result), "[1, 2]");
    }

    #[test]
    fn test_sibling_closures_share_a_cell() {
        // let mut n = 0; let inc = fn() { n = n + 1; }; inc(); inc(); n
        let result = run(vec![
            let_mut("n", int(0)),
            let_("inc", lambda(&[], vec![expr_stmt(assign("n", add(var("n"), int(1))))])),
            expr_stmt(call("inc", vec![])),
            expr_stmt(call("inc", vec![])),
            expr_stmt(var("n")),
        ]);
        assert_eq!(result.unwrap(), Value::Int(2));
    }

    #[test]
    fn test_loop_closures_capture_fresh_cells() {
        // let fs = []; for x in [1, 2, 3] { push(fs, fn() { return x; }); } fs[0]() + fs[2]()
        let result = run(vec![
            let_("fs", array(vec![])),
            for_(
                "x",
                array(vec![int(1), int(2), int(3)]),
                vec![expr_stmt(call("push", vec![var("fs"), lambda(&[], vec![ret(var("x"))])]))],
            ),
            expr_stmt(add(
                call_expr(index(var("fs"), int(0)), vec![]),
                call_expr(index(var("fs"), int(2)), vec![]),
            )),
        ]);
        assert_eq!(result.unwrap(), Value::Int(4));
    }

    #[test]
    fn test_recursive_factorial() {
        let result = run(vec![factorial(), expr_stmt(call("fact", vec![int(10)]))]);
        assert_eq!(result.unwrap(), Value::Int(3628800));
    }

    #[test]
    fn test_factorial_with_collections_mid_recursion() {
        let mut vm = Vm::with_config(VmConfig {
            gc_stress: true,
            ..VmConfig::default()
        });
        let result = run_with(&mut vm, vec![factorial(), expr_stmt(call("fact", vec![int(10)]))]);
        assert_eq!(result.unwrap(), Value::Int(3628800));
        assert!(vm.heap().stats().collections > 10);
    }

    #[test]
    fn test_stack_overflow_is_a_fault() {
        let mut vm = Vm::with_config(VmConfig {
            max_frames: 32,
            ..VmConfig::default()
        });
        let result = run_with(
            &mut vm,
            vec![
                func("down", &["n"], vec![ret(call("down", vec![add(var("n"), int(1))]))]),
                expr_stmt(call("down", vec![int(0)])),
            ],
        );
        assert!(matches!(result, Err(RuntimeError::StackOverflow { depth: 32, .. })));
        // The engine is reusable after the fault.
        assert_eq!(run_with(&mut vm, vec![expr_stmt(int(5))]).unwrap(), Value::Int(5));
    }

    #[test]
    fn test_index_one_past_end_is_out_of_bounds() {
        let result = run(vec![
            let_("a", array(vec![int(1), int(2), int(3)])),
            expr_stmt(index(var("a"), int(3))),
        ]);
        assert_eq!(
            result.unwrap_err(),
            RuntimeError::index_out_of_bounds(3, 3, Span::at_line(1))
        );

        let negative = run(vec![
            let_("a", array(vec![int(1)])),
            expr_stmt(assign_to(index(var("a"), int(-1)), int(0))),
        ]);
        assert!(matches!(
            negative,
            Err(RuntimeError::IndexOutOfBounds { index: -1, length: 1, .. })
        ));
    }

    #[test]
    fn test_maps_fields_and_len() {
        let mut vm = Vm::new();
        let stmts = |tail: Expr| {
            vec![
                let_("m", map(vec![("a", int(1)), ("b", string("x"))])),
                expr_stmt(assign_to(member(var("m"), "c"), int(3))),
                expr_stmt(tail),
            ]
        };
        assert_eq!(run_with(&mut vm, stmts(member(var("m"), "a"))).unwrap(), Value::Int(1));
        assert_eq!(run_with(&mut vm, stmts(member(var("m"), "len"))).unwrap(), Value::Int(3));
        assert_eq!(run_with(&mut vm, stmts(index(var("m"), string("zz")))).unwrap(), Value::Null);
        assert!(matches!(
            run_with(&mut vm, stmts(member(var("m"), "zz"))),
            Err(RuntimeError::NoSuchProperty { .. })
        ));
        let shown = run_with(&mut vm, stmts(var("m"))).unwrap();
        assert_eq!(vm.display(&shown), r#"{ "a": 1, "b": "x", "c": 3 }"#);
    }

    #[test]
    fn test_undefined_global() {
        let result = run(vec![expr_stmt(var("nope"))]);
        assert_eq!(
            result.unwrap_err(),
            RuntimeError::undefined_variable("nope", Span::at_line(1))
        );
    }

    #[test]
    fn test_loops_with_break_and_continue() {
        // let mut s = 0; let mut i = 0;
        // while true { i = i + 1; if i > 10 { break; } if i % 2 == 0 { continue; } s = s + i; }
        let result = run(vec![
            let_mut("s", int(0)),
            let_mut("i", int(0)),
            while_(
                boolean(true),
                vec![
                    expr_stmt(assign("i", add(var("i"), int(1)))),
                    if_(binary(var("i"), BinaryOp::Greater, int(10)), vec![brk()], None),
                    if_(
                        binary(binary(var("i"), BinaryOp::Modulo, int(2)), BinaryOp::Equal, int(0)),
                        vec![cont()],
                        None,
                    ),
                    expr_stmt(assign("s", add(var("s"), var("i")))),
                ],
            ),
            expr_stmt(var("s")),
        ]);
        assert_eq!(result.unwrap(), Value::Int(25));

        let summed = run(vec![
            let_mut("s", int(0)),
            for_("x", array(vec![int(1), int(2), int(3), int(4)]), vec![
                if_(binary(var("x"), BinaryOp::Equal, int(2)), vec![cont()], None),
                expr_stmt(assign("s", add(var("s"), var("x")))),
            ]),
            expr_stmt(var("s")),
        ]);
        assert_eq!(summed.unwrap(), Value::Int(8));
    }

    #[test]
    fn test_break_and_continue_close_body_captures() {
        // for x in [0, 1, 2, 3] {
        //     let v = x * 10; push(fs, fn() { return v; });
        //     if x == 2 { break; }
        // }
        let for_break = run(vec![
            let_("fs", array(vec![])),
            for_("x", array(vec![int(0), int(1), int(2), int(3)]), vec![
                let_("v", binary(var("x"), BinaryOp::Multiply, int(10))),
                expr_stmt(call("push", vec![var("fs"), lambda(&[], vec![ret(var("v"))])])),
                if_(binary(var("x"), BinaryOp::Equal, int(2)), vec![brk()], None),
            ]),
            let_("p", int(1000)),
            let_("q", int(2000)),
            let_("r", int(3000)),
            let_("s", int(4000)),
            expr_stmt(add(
                add(
                    call_expr(index(var("fs"), int(0)), vec![]),
                    call_expr(index(var("fs"), int(1)), vec![]),
                ),
                call_expr(index(var("fs"), int(2)), vec![]),
            )),
        ]);
        assert_eq!(for_break.unwrap(), Value::Int(30));

        // while i < 3 { let v = i * 10; i = i + 1; push(fs, fn() { return v; }); continue; }
        let while_continue = run(vec![
            let_("fs", array(vec![])),
            let_mut("i", int(0)),
            while_(binary(var("i"), BinaryOp::Less, int(3)), vec![
                let_("v", binary(var("i"), BinaryOp::Multiply, int(10))),
                expr_stmt(assign("i", add(var("i"), int(1)))),
                expr_stmt(call("push", vec![var("fs"), lambda(&[], vec![ret(var("v"))])])),
                cont(),
            ]),
            let_("junk", int(99)),
            expr_stmt(add(
                add(
                    call_expr(index(var("fs"), int(0)), vec![]),
                    call_expr(index(var("fs"), int(1)), vec![]),
                ),
                call_expr(index(var("fs"), int(2)), vec![]),
            )),
        ]);
        assert_eq!(while_continue.unwrap(), Value::Int(30));
    }

    #[test]
    fn test_local_operand_read_before_later_operand_reassigns_it() {
        // let mut n = 0; let bump = fn() { n = 10; return 1; }; n + bump()
        let through_closure = run(vec![
            let_mut("n", int(0)),
            let_("bump", lambda(&[], vec![expr_stmt(assign("n", int(10))), ret(int(1))])),
            expr_stmt(add(var("n"), call("bump", vec![]))),
        ]);
        assert_eq!(through_closure.unwrap(), Value::Int(1));

        // let mut i = 0; i + (i = 5)
        let through_assign = run(vec![
            let_mut("i", int(0)),
            expr_stmt(add(var("i"), assign("i", int(5)))),
        ]);
        assert_eq!(through_assign.unwrap(), Value::Int(5));

        // let mut a = [1, 2]; let old = a; let swap = fn() { a = [7, 8]; return 0; };
        let swapping = || {
            vec![
                let_mut("a", array(vec![int(1), int(2)])),
                let_("old", var("a")),
                let_(
                    "swap",
                    lambda(
                        &[],
                        vec![expr_stmt(assign("a", array(vec![int(7), int(8)]))), ret(int(0))],
                    ),
                ),
            ]
        };
        // a[swap()] reads the array held before the call.
        let mut read = swapping();
        read.push(expr_stmt(index(var("a"), call("swap", vec![]))));
        assert_eq!(run(read).unwrap(), Value::Int(1));

        // a[swap()] = 9 stores into that same array.
        let mut write = swapping();
        write.push(expr_stmt(assign_to(index(var("a"), call("swap", vec![])), int(9))));
        write.push(expr_stmt(add(index(var("old"), int(0)), index(var("a"), int(0)))));
        assert_eq!(run(write).unwrap(), Value::Int(16));
    }

    #[test]
    fn test_logical_assignment_reads_target_after_left_operand() {
        // let mut x = true; x = false || x; x
        let plain = run(vec![
            let_mut("x", boolean(true)),
            expr_stmt(assign("x", or(boolean(false), var("x")))),
            expr_stmt(var("x")),
        ]);
        assert_eq!(plain.unwrap(), Value::Bool(true));

        // let mut x = true; x = match 1 { _ => false || x }; x
        let in_match = run(vec![
            let_mut("x", boolean(true)),
            expr_stmt(assign(
                "x",
                match_(int(1), vec![arm(MatchPattern::Wildcard, or(boolean(false), var("x")))]),
            )),
            expr_stmt(var("x")),
        ]);
        assert_eq!(in_match.unwrap(), Value::Bool(true));

        // let mut y = 1; y = y && false; y
        let and_local = run(vec![
            let_mut("y", int(1)),
            expr_stmt(assign("y", and(var("y"), boolean(false)))),
            expr_stmt(var("y")),
        ]);
        assert_eq!(and_local.unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_pipeline_calls_function_with_value() {
        let twice = ret(binary(var("x"), BinaryOp::Multiply, int(2)));
        let double = func("double", &["x"], vec![twice]);
        let piped = run(vec![double.clone(), expr_stmt(pipe(int(21), var("double")))]);
        assert_eq!(piped.unwrap(), Value::Int(42));

        // The value side runs before the function side.
        let mut vm = Vm::new();
        let order = run_with(
            &mut vm,
            vec![
                double,
                let_mut("s", int(0)),
                let_(
                    "r",
                    pipe(
                        block_expr(vec![expr_stmt(assign("s", int(1))), expr_stmt(int(5))]),
                        block_expr(vec![
                            expr_stmt(assign(
                                "s",
                                add(binary(var("s"), BinaryOp::Multiply, int(10)), int(2)),
                                )),
                            expr_stmt(var("double")),
                        ]),
                    ),
                ),
                expr_stmt(array(vec![var("r"), var("s")])),
            ],
        )
        .unwrap();
        assert_eq!(vm.display(&order), "[10, 12]");
    }

    #[test]
    fn test_struct_literal_is_a_tagged_map() {
        let mut vm = Vm::new();
        let point = || let_("p", struct_lit("Point", vec![("x", int(1)), ("y", int(2))]));
        let shown = run_with(&mut vm, vec![point(), expr_stmt(var("p"))]).unwrap();
        assert_eq!(vm.display(&shown), r#"{ "__type__": "Point", "x": 1, "y": 2 }"#);

        let tag_expr = member(var("p"), "__type__");
        let tag = run_with(&mut vm, vec![point(), expr_stmt(tag_expr)]).unwrap();
        assert_eq!(vm.display(&tag), "Point");

        let sum = run_with(
            &mut vm,
            vec![point(), expr_stmt(add(member(var("p"), "x"), member(var("p"), "y")))],
        );
        assert_eq!(sum.unwrap(), Value::Int(3));
    }

    #[test]
    fn test_block_expression_values() {
        // let v = { let a = 2; a * 21 }; v
        let valued = run(vec![
            let_(
                "v",
                block_expr(vec![
                    let_("a", int(2)),
                    expr_stmt(binary(var("a"), BinaryOp::Multiply, int(21))),
                ]),
            ),
            expr_stmt(var("v")),
        ]);
        assert_eq!(valued.unwrap(), Value::Int(42));

        assert_eq!(run(vec![expr_stmt(block_expr(vec![]))]).unwrap(), Value::Null);
        assert_eq!(
            run(vec![expr_stmt(block_expr(vec![let_("a", int(1))]))]).unwrap(),
            Value::Null
        );

        // let f = { let c = 5; fn() { return c; } }; let j = 1; let k = 2; f()
        let captured = run(vec![
            let_(
                "f",
                block_expr(vec![let_("c", int(5)), expr_stmt(lambda(&[], vec![ret(var("c"))]))]),
            ),
            let_("j", int(1)),
            let_("k", int(2)),
            expr_stmt(call("f", vec![])),
        ]);
        assert_eq!(captured.unwrap(), Value::Int(5));
    }

    #[test]
    fn test_when_runs_first_matching_arm() {
        // let mut out = 0; when subject { < 5 => out = 1, == 7 => out = 2, else => out = 3 }; out
        let pick = |subject: i64| {
            run(vec![
                let_mut("out", int(0)),
                when_(int(subject), vec![
                    when_arm(BinaryOp::Less, int(5), assign("out", int(1))),
                    when_arm(BinaryOp::Equal, int(7), assign("out", int(2))),
                    when_else(assign("out", int(3))),
                ]),
                expr_stmt(var("out")),
            ])
            .unwrap()
        };
        assert_eq!(pick(1), Value::Int(1));
        assert_eq!(pick(7), Value::Int(2));
        assert_eq!(pick(9), Value::Int(3));

        // Without an else arm nothing runs.
        let none = run(vec![
            let_mut("out", int(0)),
            when_(int(3), vec![when_arm(BinaryOp::Greater, int(5), assign("out", int(1)))]),
            expr_stmt(var("out")),
        ]);
        assert_eq!(none.unwrap(), Value::Int(0));
    }

    #[test]
    fn test_results_match_and_try() {
        // fn check(x) { if x > 0 { return Ok(x); } return Err("neg"); }
        // fn double(x) { let v = check(x)?; return Ok(v * 2); }
        let defs = || {
            vec![
                func(
                    "check",
                    &["x"],
                    vec![
                        if_(
                            binary(var("x"), BinaryOp::Greater, int(0)),
                            vec![ret(ok(var("x")))],
                            None,
                        ),
                        ret(err(string("neg"))),
                    ],
                ),
                func(
                    "double",
                    &["x"],
                    vec![
                        let_("v", try_(call("check", vec![var("x")]))),
                        ret(ok(binary(var("v"), BinaryOp::Multiply, int(2)))),
                    ],
                ),
            ]
        };
        let unwrap_or_reason = |arg: i64| {
            match_(
                call("double", vec![int(arg)]),
                vec![
                    arm(MatchPattern::Ok("v".into()), var("v")),
                    arm(MatchPattern::Err("e".into()), var("e")),
                ],
            )
        };

        let mut vm = Vm::new();
        let mut stmts = defs();
        stmts.push(expr_stmt(unwrap_or_reason(4)));
        assert_eq!(run_with(&mut vm, stmts).unwrap(), Value::Int(8));

        let mut stmts = defs();
        stmts.push(expr_stmt(unwrap_or_reason(-1)));
        let reason = run_with(&mut vm, stmts).unwrap();
        assert_eq!(vm.display(&reason), "neg");
    }

    #[test]
    fn test_match_literals_guards_and_fallthrough() {
        let classify = |subject: Expr| {
            vec![expr_stmt(match_(
                subject,
                vec![
                    arm(MatchPattern::Literal(int(0)), string("zero")),
                    arm(MatchPattern::Literal(string("hi")), string("greeting")),
                    guarded_arm(
                        MatchPattern::Variable("n".into()),
                        binary(var("n"), BinaryOp::Greater, int(100)),
                        string("big"),
                    ),
                ],
            ))]
        };
        let mut vm = Vm::new();
        let zero = run_with(&mut vm, classify(int(0))).unwrap();
        assert_eq!(vm.display(&zero), "zero");
        let big = run_with(&mut vm, classify(int(500))).unwrap();
        assert_eq!(vm.display(&big), "big");
        let greeting = run_with(&mut vm, classify(string("hi"))).unwrap();
        assert_eq!(vm.display(&greeting), "greeting");
        assert_eq!(run_with(&mut vm, classify(int(5))).unwrap(), Value::Null);
    }

    #[test]
    fn test_spawn_runs_task_before_continuing() {
        let mut vm = Vm::new();
        run_with(
            &mut vm,
            vec![
                spawn(vec![expr_stmt(call("print", vec![string("task")]))]),
                expr_stmt(call("print", vec![string("main")])),
            ],
        )
        .unwrap();
        assert_eq!(vm.output(), &["task".to_string(), "main".to_string()]);
        assert_eq!(vm.scheduler.completed_count(), 1);
    }

    #[test]
    fn test_natives_and_method_calls() {
        let mut vm = Vm::new();
        let n = run_with(&mut vm, vec![expr_stmt(call("len", vec![string("héllo")]))]).unwrap();
        assert_eq!(n, Value::Int(5));

        let pushed = run_with(
            &mut vm,
            vec![
                let_("a", array(vec![int(1)])),
                expr_stmt(method(var("a"), "push", vec![int(2)])),
                expr_stmt(call("len", vec![var("a")])),
            ],
        )
        .unwrap();
        assert_eq!(pushed, Value::Int(2));

        let ty = run_with(&mut vm, vec![expr_stmt(call("type_of", vec![float(1.5)]))]).unwrap();
        assert_eq!(vm.display(&ty), "Float");
    }

    #[test]
    fn test_gc_keeps_reachable_objects() {
        // let keep = [1, 2, 3]; let mut i = 0; while i < 300 { let tmp = [i, i]; i = i + 1; }
        // let s = "held"; let get = fn() { return s; }; keep_fn = get; keep
        let mut vm = Vm::with_config(VmConfig {
            gc_threshold: 8,
            ..VmConfig::default()
        });
        let result = run_with(
            &mut vm,
            vec![
                let_("keep", array(vec![int(1), int(2), int(3)])),
                let_mut("i", int(0)),
                while_(
                    binary(var("i"), BinaryOp::Less, int(300)),
                    vec![
                        let_("tmp", array(vec![var("i"), string("garbage")])),
                        expr_stmt(assign("i", add(var("i"), int(1)))),
                    ],
                ),
                let_("s", string("held")),
                expr_stmt(assign("keep_fn", lambda(&[], vec![ret(var("s"))]))),
                expr_stmt(var("keep")),
            ],
        )
        .unwrap();

        assert!(vm.heap().stats().collections > 0);
        assert!(vm.heap().stats().frees > 0);
        assert_eq!(vm.display(&result), "[1, 2, 3]");

        vm.add_root(result);
        vm.collect_garbage();
        assert_eq!(vm.display(&result), "[1, 2, 3]");
        let keep_fn = vm.get_global("keep_fn").unwrap();
        let held = vm.call(keep_fn, &[]).unwrap();
        assert_eq!(vm.display(&held), "held");
    }

    #[test]
    fn test_fault_reports_line_and_backtrace() {
        // line 1: fn inner() {
        // line 2:     return 1 / 0;
        //         }
        // line 5: inner();
        let at = Span::at_line;
        let inner = Stmt::new(
            StmtKind::Function(crate::ast::FunctionDecl {
                name: "inner".into(),
                params: vec![],
                body: vec![Stmt::ret(
                    Some(Expr::binary(
                        Expr::int(1, at(2)),
                        BinaryOp::Divide,
                        Expr::int(0, at(2)),
                        at(2),
                        )),
                    at(2),
                )],
                span: at(1),
            }),
            at(1),
        );
        let call_inner = Stmt::expr(Expr::call(Expr::var("inner", at(5)), vec![], at(5)));
        let module = Compiler::compile(&Program::new(vec![inner, call_inner])).unwrap();

        let mut vm = Vm::new();
        let err = vm.execute(&module.main).unwrap_err();
        assert_eq!(err.line(), 2);
        assert_eq!(
            vm.last_trace(),
            &[
                TraceFrame {
                    function: "inner".into(),
                    line: 2
                },
                TraceFrame {
                    function: "<script>".into(),
                    line: 5
                },
            ]
        );
    }

    #[test]
    fn test_config_loads_from_json() {
        let json = r#"{"max_frames": 16, "gc_stress": true}"#;
        let config: VmConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config,
            VmConfig {
                max_frames: 16,
                gc_threshold: INITIAL_GC_THRESHOLD,
                gc_stress: true,
            }
        );
    }
}
