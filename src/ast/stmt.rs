//! Statement AST nodes.

use crate::ast::expr::{BinaryOp, Expr};
use crate::span::Span;

/// A statement in the AST.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn expr(expr: Expr) -> Self {
        let span = expr.span;
        Self::new(StmtKind::Expression(expr), span)
    }

    pub fn let_(name: impl Into<String>, initializer: Expr, span: Span) -> Self {
        Self::new(
            StmtKind::Let {
                name: name.into(),
                mutable: false,
                initializer: Some(initializer),
            },
            span,
        )
    }

    pub fn let_mut(name: impl Into<String>, initializer: Expr, span: Span) -> Self {
        Self::new(
            StmtKind::Let {
                name: name.into(),
                mutable: true,
                initializer: Some(initializer),
            },
            span,
        )
    }

    pub fn ret(value: Option<Expr>, span: Span) -> Self {
        Self::new(StmtKind::Return(value), span)
    }
}

/// Statement variants.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// Expression statement: expr;
    Expression(Expr),

    /// Variable declaration: let x = expr; / let mut x = expr;
    Let {
        name: String,
        mutable: bool,
        initializer: Option<Expr>,
    },

    /// Block: { statements }
    Block(Vec<Stmt>),

    /// If statement: if (cond) { ... } else { ... }
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },

    /// While loop: while (cond) { ... }
    While { condition: Expr, body: Box<Stmt> },

    /// Infinite loop, left with `break` or `return`.
    Loop(Box<Stmt>),

    /// For loop: for (x in iter) { ... }
    For {
        variable: String,
        iterable: Expr,
        body: Box<Stmt>,
    },

    Break,
    Continue,

    /// Return statement: return expr;
    Return(Option<Expr>),

    /// Function declaration
    Function(FunctionDecl),

    /// spawn { ... }
    Spawn(Vec<Stmt>),

    /// when subject { < 10 => ..., == 10 => ..., else => ... }
    When { subject: Expr, arms: Vec<WhenArm> },
}

/// One arm of a `when` statement. A missing test makes it the `else` arm.
#[derive(Debug, Clone, PartialEq)]
pub struct WhenArm {
    pub test: Option<(BinaryOp, Expr)>,
    pub body: Expr,
}

/// A named function declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Parameter>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// A function parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub mutable: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mutable: false,
        }
    }
}

/// A complete program: the body of the implicit top-level function.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn new(statements: Vec<Stmt>) -> Self {
        Self { statements }
    }
}
