//! Syntax tree consumed by the bytecode compiler.
//!
//! The tree is produced by an external parser; only the node types live here.

pub mod build;
pub mod expr;
pub mod stmt;

pub use expr::{BinaryOp, Expr, ExprKind, InterpolatedPart, MatchArm, MatchPattern, UnaryOp};
pub use stmt::{FunctionDecl, Parameter, Program, Stmt, StmtKind, WhenArm};
