//! The object heap and its mark-sweep collector.
//!
//! Objects live in an arena of slots addressed by [`GcRef`] index. A slot is
//! either empty (its index sits on the free list) or holds one object with a
//! mark bit. The heap knows object shapes but nothing about bytecode: the VM
//! hands it a root set and it reclaims everything those roots cannot reach.

use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

use super::chunk::Chunk;
use super::natives::NativeFn;
use super::upvalue::{Closure, UpvalueCell};
use super::value::{GcRef, Value};

/// Default number of live objects that triggers the first collection.
pub const INITIAL_GC_THRESHOLD: usize = 256;

/// Display/equality stop descending past this depth (cyclic structures).
const MAX_NESTING: usize = 64;

/// Insertion-ordered map with string keys.
pub type ValueMap = IndexMap<String, Value, ahash::RandomState>;

/// A host function callable from bytecode.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    /// Exact argument count, or `None` for variadic.
    pub arity: Option<usize>,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<native {}>", self.name)
    }
}

/// Heap object payloads.
#[derive(Debug, Clone)]
pub enum ObjKind {
    String(String),
    Array(Vec<Value>),
    Map(ValueMap),
    /// A function prototype made callable.
    Function(Rc<Chunk>),
    Closure(Closure),
    Native(NativeFunction),
    Upvalue(UpvalueCell),
    ResultOk(Value),
    ResultErr(Value),
}

impl ObjKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjKind::String(_) => "String",
            ObjKind::Array(_) => "Array",
            ObjKind::Map(_) => "Map",
            ObjKind::Function(_) | ObjKind::Closure(_) => "Function",
            ObjKind::Native(_) => "NativeFunction",
            ObjKind::Upvalue(_) => "Upvalue",
            ObjKind::ResultOk(_) | ObjKind::ResultErr(_) => "Result",
        }
    }

    /// Push every heap reference this object holds.
    fn trace(&self, worklist: &mut Vec<GcRef>) {
        match self {
            ObjKind::Array(items) => worklist.extend(items.iter().filter_map(Value::as_obj)),
            ObjKind::Map(map) => worklist.extend(map.values().filter_map(Value::as_obj)),
            ObjKind::Closure(c) => {
                worklist.push(c.function);
                worklist.extend(c.upvalues.iter().copied());
            }
            ObjKind::Upvalue(UpvalueCell::Closed(v))
            | ObjKind::ResultOk(v)
            | ObjKind::ResultErr(v) => worklist.extend(v.as_obj()),
            ObjKind::String(_)
            | ObjKind::Function(_)
            | ObjKind::Native(_)
            | ObjKind::Upvalue(UpvalueCell::Open(_)) => {}
        }
    }
}

#[derive(Debug)]
pub struct HeapObject {
    pub kind: ObjKind,
    pub marked: bool,
}

/// Running totals, mostly for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub allocations: usize,
    pub frees: usize,
    pub collections: usize,
}

pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    free_list: Vec<usize>,
    live: usize,
    threshold: usize,
    initial_threshold: usize,
    stats: HeapStats,
}

impl Heap {
    pub fn new() -> Self {
        Self::with_threshold(INITIAL_GC_THRESHOLD)
    }

    pub fn with_threshold(initial_threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
            threshold: initial_threshold,
            initial_threshold,
            stats: HeapStats::default(),
        }
    }

    /// Store an object, reusing a free slot when one exists.
    pub fn alloc(&mut self, kind: ObjKind) -> GcRef {
        let obj = HeapObject {
            kind,
            marked: false,
        };
        let index = match self.free_list.pop() {
            Some(index) => {
                self.slots[index] = Some(obj);
                index
            }
            None => {
                self.slots.push(Some(obj));
                self.slots.len() - 1
            }
        };
        self.live += 1;
        self.stats.allocations += 1;
        GcRef(index)
    }

    pub fn alloc_string(&mut self, s: impl Into<String>) -> Value {
        Value::Obj(self.alloc(ObjKind::String(s.into())))
    }

    pub fn alloc_array(&mut self, items: Vec<Value>) -> Value {
        Value::Obj(self.alloc(ObjKind::Array(items)))
    }

    pub fn get(&self, r: GcRef) -> Option<&HeapObject> {
        self.slots.get(r.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut HeapObject> {
        self.slots.get_mut(r.0).and_then(Option::as_mut)
    }

    pub fn kind(&self, r: GcRef) -> Option<&ObjKind> {
        self.get(r).map(|o| &o.kind)
    }

    pub fn kind_mut(&mut self, r: GcRef) -> Option<&mut ObjKind> {
        self.get_mut(r).map(|o| &mut o.kind)
    }

    /// Mutable payload behind `value`, if it is a live heap reference.
    pub fn obj_mut(&mut self, value: &Value) -> Option<&mut ObjKind> {
        match value {
            Value::Obj(r) => self.kind_mut(*r),
            _ => None,
        }
    }

    pub fn is_live(&self, r: GcRef) -> bool {
        self.get(r).is_some()
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// True once the live count has crossed the current trigger.
    #[inline]
    pub fn should_collect(&self) -> bool {
        self.live > self.threshold
    }

    /// Run one full mark-sweep cycle and return the number of objects freed.
    ///
    /// The caller must supply every root; anything not reachable from them is
    /// released. Marking finishes before sweeping starts.
    pub(crate) fn collect<I>(&mut self, roots: I) -> usize
    where
        I: IntoIterator<Item = GcRef>,
    {
        let before = self.live;
        self.mark(roots);
        let freed = self.sweep();
        self.threshold = (self.live * 2).max(self.initial_threshold);
        self.stats.collections += 1;
        self.stats.frees += freed;
        debug!(
            before,
            after = self.live,
            freed,
            next_threshold = self.threshold,
            "gc cycle"
        );
        freed
    }

    fn mark<I>(&mut self, roots: I)
    where
        I: IntoIterator<Item = GcRef>,
    {
        let mut worklist: Vec<GcRef> = roots.into_iter().collect();
        while let Some(r) = worklist.pop() {
            let Some(obj) = self.slots.get_mut(r.0).and_then(Option::as_mut) else {
                continue;
            };
            if obj.marked {
                continue;
            }
            obj.marked = true;
            obj.kind.trace(&mut worklist);
        }
    }

    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(obj) if obj.marked => obj.marked = false,
                Some(_) => {
                    *slot = None;
                    self.free_list.push(index);
                    freed += 1;
                }
                None => {}
            }
        }
        self.live -= freed;
        freed
    }

    // --- Value helpers that need to look through heap references ---

    pub fn type_name(&self, value: &Value) -> &'static str {
        match value {
            Value::Obj(r) => self.kind(*r).map_or("Null", ObjKind::type_name),
            other => other.primitive_type_name().unwrap_or("Null"),
        }
    }

    pub fn as_str(&self, value: &Value) -> Option<&str> {
        match value {
            Value::Obj(r) => match self.kind(*r) {
                Some(ObjKind::String(s)) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    /// Human-readable rendering used by `print`, `Concat` and `Interpolate`.
    pub fn display(&self, value: &Value) -> String {
        let mut out = String::new();
        self.write_display(value, &mut out, 0, false);
        out
    }

    fn write_display(&self, value: &Value, out: &mut String, depth: usize, quoted: bool) {
        use std::fmt::Write;

        match value {
            Value::Int(n) => {
                let _ = write!(out, "{}", n);
            }
            Value::Float(n) => {
                if n.is_finite() && n.fract() == 0.0 {
                    let _ = write!(out, "{:.1}", n);
                } else {
                    let _ = write!(out, "{}", n);
                }
            }
            Value::Bool(b) => {
                let _ = write!(out, "{}", b);
            }
            Value::Null => out.push_str("null"),
            Value::Obj(r) => {
                if depth > MAX_NESTING {
                    out.push_str("...");
                    return;
                }
                let Some(kind) = self.kind(*r) else {
                    out.push_str("<freed>");
                    return;
                };
                match kind {
                    ObjKind::String(s) if quoted => {
                        let _ = write!(out, "\"{}\"", s);
                    }
                    ObjKind::String(s) => out.push_str(s),
                    ObjKind::Array(items) => {
                        out.push('[');
                        for (i, item) in items.iter().enumerate() {
                            if i > 0 {
                                out.push_str(", ");
                            }
                            self.write_display(item, out, depth + 1, true);
                        }
                        out.push(']');
                    }
                    ObjKind::Map(map) => {
                        out.push('{');
                        for (i, (k, v)) in map.iter().enumerate() {
                            if i > 0 {
                                out.push(',');
                            }
                            let _ = write!(out, " \"{}\": ", k);
                            self.write_display(v, out, depth + 1, true);
                        }
                        out.push_str(if map.is_empty() { "}" } else { " }" });
                    }
                    ObjKind::Function(chunk) => {
                        let _ = write!(out, "<fn {}>", chunk.name);
                    }
                    ObjKind::Closure(c) => match self.kind(c.function) {
                        Some(ObjKind::Function(chunk)) => {
                            let _ = write!(out, "<fn {}>", chunk.name);
                        }
                        _ => out.push_str("<fn>"),
                    },
                    ObjKind::Native(n) => {
                        let _ = write!(out, "<native {}>", n.name);
                    }
                    ObjKind::Upvalue(_) => out.push_str("<upvalue>"),
                    ObjKind::ResultOk(v) => {
                        out.push_str("Ok(");
                        self.write_display(v, out, depth + 1, true);
                        out.push(')');
                    }
                    ObjKind::ResultErr(v) => {
                        out.push_str("Err(");
                        self.write_display(v, out, depth + 1, true);
                        out.push(')');
                    }
                }
            }
        }
    }

    /// Language-level equality: numbers across int/float, strings by content,
    /// arrays/maps/results structurally, everything else by identity.
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        self.equal_at_depth(a, b, 0)
    }

    fn equal_at_depth(&self, a: &Value, b: &Value, depth: usize) -> bool {
        let (ra, rb) = match (a, b) {
            (Value::Obj(ra), Value::Obj(rb)) => (*ra, *rb),
            _ => return a == b,
        };
        if ra == rb {
            return true;
        }
        if depth > MAX_NESTING {
            return false;
        }
        match (self.kind(ra), self.kind(rb)) {
            (Some(ObjKind::String(x)), Some(ObjKind::String(y))) => x == y,
            (Some(ObjKind::Array(x)), Some(ObjKind::Array(y))) => {
                x.len() == y.len()
                    && x
                        .iter()
                        .zip(y.iter())
                        .all(|(p, q)| self.equal_at_depth(p, q, depth + 1))
            }
            (Some(ObjKind::Map(x)), Some(ObjKind::Map(y))) => {
                x.len() == y.len()
                    && x.iter().all(|(k, v)| {
                        y.get(k)
                            .is_some_and(|w| self.equal_at_depth(v, w, depth + 1))
                    })
            }
            (Some(ObjKind::ResultOk(x)), Some(ObjKind::ResultOk(y)))
            | (Some(ObjKind::ResultErr(x)), Some(ObjKind::ResultErr(y))) => {
                self.equal_at_depth(x, y, depth + 1)
            }
            _ => false,
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
