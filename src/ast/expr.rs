//! Expression AST nodes.

use crate::ast::stmt::{Parameter, Stmt};
use crate::span::Span;

/// An expression in the AST.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn int(value: i64, span: Span) -> Self {
        Self::new(ExprKind::IntLiteral(value), span)
    }

    pub fn float(value: f64, span: Span) -> Self {
        Self::new(ExprKind::FloatLiteral(value), span)
    }

    pub fn string(value: impl Into<String>, span: Span) -> Self {
        Self::new(ExprKind::StringLiteral(value.into()), span)
    }

    pub fn bool(value: bool, span: Span) -> Self {
        Self::new(ExprKind::BoolLiteral(value), span)
    }

    pub fn null(span: Span) -> Self {
        Self::new(ExprKind::Null, span)
    }

    pub fn var(name: impl Into<String>, span: Span) -> Self {
        Self::new(ExprKind::Variable(name.into()), span)
    }

    pub fn binary(left: Expr, operator: BinaryOp, right: Expr, span: Span) -> Self {
        Self::new(
            ExprKind::Binary {
                left: Box::new(left),
                operator,
                right: Box::new(right),
            },
            span,
        )
    }

    pub fn unary(operator: UnaryOp, operand: Expr, span: Span) -> Self {
        Self::new(
            ExprKind::Unary {
                operator,
                operand: Box::new(operand),
            },
            span,
        )
    }

    pub fn call(callee: Expr, arguments: Vec<Expr>, span: Span) -> Self {
        Self::new(
            ExprKind::Call {
                callee: Box::new(callee),
                arguments,
            },
            span,
        )
    }

    pub fn assign(target: Expr, value: Expr, span: Span) -> Self {
        Self::new(
            ExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            span,
        )
    }

    pub fn index(object: Expr, index: Expr, span: Span) -> Self {
        Self::new(
            ExprKind::Index {
                object: Box::new(object),
                index: Box::new(index),
            },
            span,
        )
    }

    pub fn member(object: Expr, name: impl Into<String>, span: Span) -> Self {
        Self::new(
            ExprKind::Member {
                object: Box::new(object),
                name: name.into(),
            },
            span,
        )
    }

    /// True for expressions that need no register work beyond a load.
    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::IntLiteral(_)
                | ExprKind::FloatLiteral(_)
                | ExprKind::StringLiteral(_)
                | ExprKind::BoolLiteral(_)
                | ExprKind::Null
        )
    }
}

/// Expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    IntLiteral(i64),
    FloatLiteral(f64),
    StringLiteral(String),
    BoolLiteral(bool),
    Null,

    /// "text {expr} text"
    InterpolatedString(Vec<InterpolatedPart>),

    Variable(String),

    Binary {
        left: Box<Expr>,
        operator: BinaryOp,
        right: Box<Expr>,
    },

    Unary {
        operator: UnaryOp,
        operand: Box<Expr>,
    },

    /// a && b
    LogicalAnd {
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// a || b
    LogicalOr {
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Call {
        callee: Box<Expr>,
        arguments: Vec<Expr>,
    },

    /// recv.name(args), dispatched to the global function `name` with `recv` first.
    MethodCall {
        object: Box<Expr>,
        method: String,
        arguments: Vec<Expr>,
    },

    /// obj.name
    Member {
        object: Box<Expr>,
        name: String,
    },

    /// obj[index]
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },

    /// [a, b, c]
    Array(Vec<Expr>),

    /// { key: value, ... }
    Hash(Vec<(Expr, Expr)>),

    /// target = value, where target is a variable, member or index expression.
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },

    /// fn(params) { body }
    Lambda {
        params: Vec<Parameter>,
        body: Vec<Stmt>,
    },

    Match {
        expression: Box<Expr>,
        arms: Vec<MatchArm>,
    },

    /// Ok(value)
    WrapOk(Box<Expr>),

    /// Err(value)
    WrapErr(Box<Expr>),

    /// value? -- unwraps an Ok, returns an Err from the enclosing function.
    Try(Box<Expr>),

    /// value |> function, a one-argument call with the value evaluated first.
    Pipeline {
        value: Box<Expr>,
        function: Box<Expr>,
    },

    /// Name { field: value, ... }, a map tagged with its type name under `__type__`.
    StructLiteral {
        name: String,
        fields: Vec<(String, Expr)>,
    },

    /// { stmts; expr }, yielding the trailing expression statement or null.
    Block(Vec<Stmt>),
}

/// Piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpolatedPart {
    Literal(String),
    Expression(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    /// `++`: display-concatenation of any two values.
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

/// One arm of a match expression.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub pattern: MatchPattern,
    pub guard: Option<Expr>,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchPattern {
    /// `_`
    Wildcard,
    /// Literal expression compared with `==`.
    Literal(Expr),
    /// Binds the subject to a name.
    Variable(String),
    /// `Ok(name)`
    Ok(String),
    /// `Err(name)`
    Err(String),
}
