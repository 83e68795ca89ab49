//! Shorthand constructors for assembling trees by hand.
//!
//! Every node gets a line-1 span. Hosts that care about diagnostics should
//! build nodes with explicit spans through `Expr::new` / `Stmt::new`.

use crate::span::Span;

use super::expr::{BinaryOp, Expr, ExprKind, InterpolatedPart, MatchArm, MatchPattern, UnaryOp};
use super::stmt::{FunctionDecl, Parameter, Program, Stmt, StmtKind, WhenArm};

fn sp() -> Span {
    Span::at_line(1)
}

pub fn program(statements: Vec<Stmt>) -> Program {
    Program::new(statements)
}

// --- Expressions ---

pub fn int(value: i64) -> Expr {
    Expr::int(value, sp())
}

pub fn float(value: f64) -> Expr {
    Expr::float(value, sp())
}

pub fn string(value: &str) -> Expr {
    Expr::string(value, sp())
}

pub fn boolean(value: bool) -> Expr {
    Expr::bool(value, sp())
}

pub fn null() -> Expr {
    Expr::null(sp())
}

pub fn var(name: &str) -> Expr {
    Expr::var(name, sp())
}

pub fn binary(left: Expr, operator: BinaryOp, right: Expr) -> Expr {
    Expr::binary(left, operator, right, sp())
}

pub fn not(operand: Expr) -> Expr {
    Expr::unary(UnaryOp::Not, operand, sp())
}

pub fn neg(operand: Expr) -> Expr {
    Expr::unary(UnaryOp::Negate, operand, sp())
}

pub fn and(left: Expr, right: Expr) -> Expr {
    Expr::new(
        ExprKind::LogicalAnd {
            left: Box::new(left),
            right: Box::new(right),
        },
        sp(),
    )
}

pub fn or(left: Expr, right: Expr) -> Expr {
    Expr::new(
        ExprKind::LogicalOr {
            left: Box::new(left),
            right: Box::new(right),
        },
        sp(),
    )
}

/// Call a function by name.
pub fn call(name: &str, arguments: Vec<Expr>) -> Expr {
    Expr::call(var(name), arguments, sp())
}

pub fn call_expr(callee: Expr, arguments: Vec<Expr>) -> Expr {
    Expr::call(callee, arguments, sp())
}

pub fn method(object: Expr, name: &str, arguments: Vec<Expr>) -> Expr {
    Expr::new(
        ExprKind::MethodCall {
            object: Box::new(object),
            method: name.to_string(),
            arguments,
        },
        sp(),
    )
}

pub fn index(object: Expr, index: Expr) -> Expr {
    Expr::index(object, index, sp())
}

pub fn member(object: Expr, name: &str) -> Expr {
    Expr::member(object, name, sp())
}

pub fn array(elements: Vec<Expr>) -> Expr {
    Expr::new(ExprKind::Array(elements), sp())
}

pub fn map(entries: Vec<(&str, Expr)>) -> Expr {
    let pairs = entries.into_iter().map(|(k, v)| (string(k), v)).collect();
    Expr::new(ExprKind::Hash(pairs), sp())
}

pub fn assign(name: &str, value: Expr) -> Expr {
    Expr::assign(var(name), value, sp())
}

pub fn assign_to(target: Expr, value: Expr) -> Expr {
    Expr::assign(target, value, sp())
}

pub fn lambda(params: &[&str], body: Vec<Stmt>) -> Expr {
    Expr::new(
        ExprKind::Lambda {
            params: params.iter().map(|p| Parameter::new(*p)).collect(),
            body,
        },
        sp(),
    )
}

pub fn ok(value: Expr) -> Expr {
    Expr::new(ExprKind::WrapOk(Box::new(value)), sp())
}

pub fn err(value: Expr) -> Expr {
    Expr::new(ExprKind::WrapErr(Box::new(value)), sp())
}

pub fn try_(value: Expr) -> Expr {
    Expr::new(ExprKind::Try(Box::new(value)), sp())
}

/// `"text {expr} text"`
pub fn interpolate(parts: Vec<InterpolatedPart>) -> Expr {
    Expr::new(ExprKind::InterpolatedString(parts), sp())
}

pub fn text(s: &str) -> InterpolatedPart {
    InterpolatedPart::Literal(s.to_string())
}

pub fn hole(expr: Expr) -> InterpolatedPart {
    InterpolatedPart::Expression(expr)
}

pub fn match_(subject: Expr, arms: Vec<MatchArm>) -> Expr {
    Expr::new(
        ExprKind::Match {
            expression: Box::new(subject),
            arms,
        },
        sp(),
    )
}

pub fn arm(pattern: MatchPattern, body: Expr) -> MatchArm {
    MatchArm {
        pattern,
        guard: None,
        body,
    }
}

pub fn guarded_arm(pattern: MatchPattern, guard: Expr, body: Expr) -> MatchArm {
    MatchArm {
        pattern,
        guard: Some(guard),
        body,
    }
}

/// `value |> function`
pub fn pipe(value: Expr, function: Expr) -> Expr {
    Expr::new(
        ExprKind::Pipeline {
            value: Box::new(value),
            function: Box::new(function),
        },
        sp(),
    )
}

pub fn struct_lit(name: &str, fields: Vec<(&str, Expr)>) -> Expr {
    Expr::new(
        ExprKind::StructLiteral {
            name: name.to_string(),
            fields: fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        },
        sp(),
    )
}

pub fn block_expr(statements: Vec<Stmt>) -> Expr {
    Expr::new(ExprKind::Block(statements), sp())
}

// --- Statements ---

pub fn expr_stmt(expr: Expr) -> Stmt {
    Stmt::expr(expr)
}

pub fn let_(name: &str, value: Expr) -> Stmt {
    Stmt::let_(name, value, sp())
}

pub fn let_mut(name: &str, value: Expr) -> Stmt {
    Stmt::let_mut(name, value, sp())
}

pub fn ret(value: Expr) -> Stmt {
    Stmt::ret(Some(value), sp())
}

pub fn ret_null() -> Stmt {
    Stmt::ret(None, sp())
}

pub fn block(statements: Vec<Stmt>) -> Stmt {
    Stmt::new(StmtKind::Block(statements), sp())
}

pub fn if_(condition: Expr, then_branch: Vec<Stmt>, else_branch: Option<Vec<Stmt>>) -> Stmt {
    Stmt::new(
        StmtKind::If {
            condition,
            then_branch: Box::new(block(then_branch)),
            else_branch: else_branch.map(|b| Box::new(block(b))),
        },
        sp(),
    )
}

pub fn while_(condition: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::new(
        StmtKind::While {
            condition,
            body: Box::new(block(body)),
        },
        sp(),
    )
}

pub fn loop_(body: Vec<Stmt>) -> Stmt {
    Stmt::new(StmtKind::Loop(Box::new(block(body))), sp())
}

pub fn for_(variable: &str, iterable: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::new(
        StmtKind::For {
            variable: variable.to_string(),
            iterable,
            body: Box::new(block(body)),
        },
        sp(),
    )
}

pub fn brk() -> Stmt {
    Stmt::new(StmtKind::Break, sp())
}

pub fn cont() -> Stmt {
    Stmt::new(StmtKind::Continue, sp())
}

pub fn func(name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
    Stmt::new(
        StmtKind::Function(FunctionDecl {
            name: name.to_string(),
            params: params.iter().map(|p| Parameter::new(*p)).collect(),
            body,
            span: sp(),
        }),
        sp(),
    )
}

pub fn spawn(body: Vec<Stmt>) -> Stmt {
    Stmt::new(StmtKind::Spawn(body), sp())
}

pub fn when_(subject: Expr, arms: Vec<WhenArm>) -> Stmt {
    Stmt::new(StmtKind::When { subject, arms }, sp())
}

pub fn when_arm(operator: BinaryOp, value: Expr, body: Expr) -> WhenArm {
    WhenArm {
        test: Some((operator, value)),
        body,
    }
}

pub fn when_else(body: Expr) -> WhenArm {
    WhenArm { test: None, body }
}
