//! Runtime values held in registers, globals and heap objects.

use std::fmt;

/// Opaque handle to a heap slot. Stable for the lifetime of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef(pub(crate) usize);

impl GcRef {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Runtime value. Primitives inline; everything else lives on the heap.
#[derive(Clone, Copy, Default)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    #[default]
    Null,
    Obj(GcRef),
}

impl Value {
    /// Only `false` and `null` are falsy.
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Bool(false) | Value::Null)
    }

    pub fn as_obj(&self) -> Option<GcRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view with int-to-float promotion.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Type name for values that need no heap lookup.
    pub fn primitive_type_name(&self) -> Option<&'static str> {
        match self {
            Value::Int(_) => Some("Int"),
            Value::Float(_) => Some("Float"),
            Value::Bool(_) => Some("Bool"),
            Value::Null => Some("Null"),
            Value::Obj(_) => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{:?}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Null => write!(f, "null"),
            Value::Obj(r) => write!(f, "Obj({})", r.0),
        }
    }
}

/// Structural equality for primitives; heap references compare by handle.
/// Use `Heap::values_equal` for language-level equality.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) => (*a as f64) == *b,
            (Value::Float(a), Value::Int(b)) => *a == (*b as f64),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            _ => false,
        }
    }
}
