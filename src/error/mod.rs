//! Error types for compilation and execution.

use crate::span::Span;
use thiserror::Error;

/// Compile-time faults. Any of these aborts the chunk being built.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error("'break' outside of a loop at {0}")]
    BreakOutsideLoop(Span),

    #[error("'continue' outside of a loop at {0}")]
    ContinueOutsideLoop(Span),

    #[error("Cannot reassign immutable variable '{name}' at {span}")]
    ImmutableAssignment { name: String, span: Span },

    #[error("Invalid assignment target at {0}")]
    InvalidAssignmentTarget(Span),

    #[error("Too many registers in function '{function}' at {span}")]
    TooManyRegisters { function: String, span: Span },

    #[error("Too many constants in function '{function}' at {span}")]
    TooManyConstants { function: String, span: Span },

    #[error("Too many captured variables in function '{function}' at {span}")]
    TooManyUpvalues { function: String, span: Span },

    #[error("Too many nested functions in function '{function}' at {span}")]
    TooManyPrototypes { function: String, span: Span },

    #[error("Too many {what} (limit {limit}) at {span}")]
    TooManyOperands {
        what: &'static str,
        limit: usize,
        span: Span,
    },

    #[error("Jump distance too large at {0}")]
    JumpOutOfRange(Span),

    #[error("Internal compiler error: jump at {offset} in '{function}' was never patched")]
    UnpatchedJump { function: String, offset: usize },

    #[error("{message} at {span}")]
    General { message: String, span: Span },
}

impl CompileError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self::General {
            message: message.into(),
            span,
        }
    }

    pub fn immutable_assignment(name: impl Into<String>, span: Span) -> Self {
        Self::ImmutableAssignment {
            name: name.into(),
            span,
        }
    }

    pub fn too_many_operands(what: &'static str, limit: usize, span: Span) -> Self {
        Self::TooManyOperands { what, limit, span }
    }

    pub fn span(&self) -> Span {
        match self {
            Self::BreakOutsideLoop(span) => *span,
            Self::ContinueOutsideLoop(span) => *span,
            Self::ImmutableAssignment { span, .. } => *span,
            Self::InvalidAssignmentTarget(span) => *span,
            Self::TooManyRegisters { span, .. } => *span,
            Self::TooManyConstants { span, .. } => *span,
            Self::TooManyUpvalues { span, .. } => *span,
            Self::TooManyPrototypes { span, .. } => *span,
            Self::TooManyOperands { span, .. } => *span,
            Self::JumpOutOfRange(span) => *span,
            Self::UnpatchedJump { .. } => Span::default(),
            Self::General { span, .. } => *span,
        }
    }
}

/// Runtime faults. These unwind to the host; the VM never resumes the faulting chunk.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Division by zero at {0}")]
    DivisionByZero(Span),

    #[error("Integer overflow in {operation} at {span}")]
    IntegerOverflow { operation: &'static str, span: Span },

    #[error("Undefined variable '{0}' at {1}")]
    UndefinedVariable(String, Span),

    #[error("Cannot call non-function value of type {value_type} at {span}")]
    NotCallable { value_type: String, span: Span },

    #[error("Wrong number of arguments: expected {expected}, got {got} at {span}")]
    WrongArity {
        expected: usize,
        got: usize,
        span: Span,
    },

    #[error("Type error: {message} at {span}")]
    TypeError { message: String, span: Span },

    #[error("Index out of bounds: {index} (length {length}) at {span}")]
    IndexOutOfBounds {
        index: i64,
        length: usize,
        span: Span,
    },

    #[error("Cannot access property '{property}' on {value_type} at {span}")]
    NoSuchProperty {
        value_type: String,
        property: String,
        span: Span,
    },

    #[error("Stack overflow: call depth exceeded {depth} at {span}")]
    StackOverflow { depth: usize, span: Span },

    #[error("Native function '{name}' failed: {message} at {span}")]
    Native {
        name: String,
        message: String,
        span: Span,
    },

    #[error("Invalid bytecode: {message} at {span}")]
    InvalidBytecode { message: String, span: Span },
}

impl RuntimeError {
    pub fn division_by_zero(span: Span) -> Self {
        Self::DivisionByZero(span)
    }

    pub fn overflow(operation: &'static str, span: Span) -> Self {
        Self::IntegerOverflow { operation, span }
    }

    pub fn undefined_variable(name: impl Into<String>, span: Span) -> Self {
        Self::UndefinedVariable(name.into(), span)
    }

    pub fn not_callable(value_type: impl Into<String>, span: Span) -> Self {
        Self::NotCallable {
            value_type: value_type.into(),
            span,
        }
    }

    pub fn wrong_arity(expected: usize, got: usize, span: Span) -> Self {
        Self::WrongArity {
            expected,
            got,
            span,
        }
    }

    pub fn type_error(message: impl Into<String>, span: Span) -> Self {
        Self::TypeError {
            message: message.into(),
            span,
        }
    }

    pub fn index_out_of_bounds(index: i64, length: usize, span: Span) -> Self {
        Self::IndexOutOfBounds {
            index,
            length,
            span,
        }
    }

    pub fn no_such_property(
        value_type: impl Into<String>,
        property: impl Into<String>,
        span: Span,
    ) -> Self {
        Self::NoSuchProperty {
            value_type: value_type.into(),
            property: property.into(),
            span,
        }
    }

    pub fn invalid_bytecode(message: impl Into<String>, span: Span) -> Self {
        Self::InvalidBytecode {
            message: message.into(),
            span,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Self::DivisionByZero(span) => *span,
            Self::IntegerOverflow { span, .. } => *span,
            Self::UndefinedVariable(_, span) => *span,
            Self::NotCallable { span, .. } => *span,
            Self::WrongArity { span, .. } => *span,
            Self::TypeError { span, .. } => *span,
            Self::IndexOutOfBounds { span, .. } => *span,
            Self::NoSuchProperty { span, .. } => *span,
            Self::StackOverflow { span, .. } => *span,
            Self::Native { span, .. } => *span,
            Self::InvalidBytecode { span, .. } => *span,
        }
    }

    /// Source line of the faulting instruction.
    pub fn line(&self) -> usize {
        self.span().line
    }
}

/// A unified error type for a compile-then-run pipeline.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}
