//! Expression compilation: AST expressions to bytecode.
//!
//! Every expression is compiled into a destination register chosen by the
//! caller. `compile_expr_any` lets the callee pick: locals are read in place,
//! everything else lands in a fresh temporary.

use crate::ast::expr::{BinaryOp, ExprKind, InterpolatedPart, UnaryOp};
use crate::ast::stmt::{Parameter, Stmt, StmtKind};
use crate::ast::Expr;
use crate::error::CompileError;
use crate::span::Span;

use super::chunk::Constant;
use super::compiler::{CompileResult, Compiler, FunctionType, VariableAccess};
use super::opcode::OpCode;

impl Compiler {
    /// Compile an expression, leaving the result in `dst`.
    pub fn compile_expr_into(&mut self, expr: &Expr, dst: u8) -> CompileResult<()> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::IntLiteral(n) => self.emit_load_int(dst, *n, span)?,
            ExprKind::FloatLiteral(n) => {
                let idx = self.add_constant(Constant::Float(*n), span)?;
                self.emit_abx(OpCode::LoadConst, dst, idx, span);
            }
            ExprKind::StringLiteral(s) => {
                let idx = self.add_string_constant(s, span)?;
                self.emit_abx(OpCode::LoadConst, dst, idx, span);
            }
            ExprKind::BoolLiteral(b) => {
                let op = if *b { OpCode::LoadTrue } else { OpCode::LoadFalse };
                self.emit_abc(op, dst, 0, 0, span);
            }
            ExprKind::Null => {
                self.emit_abc(OpCode::LoadNull, dst, 0, 0, span);
            }
            ExprKind::InterpolatedString(parts) => {
                self.compile_interpolated_string(parts, dst, span)?;
            }
            ExprKind::Variable(name) => self.compile_variable_get(name, dst, span)?,
            ExprKind::Binary {
                left,
                operator,
                right,
            } => {
                let mark = self.next_register;
                let l = self.compile_operand(left, &[&**right])?;
                let r = self.compile_expr_any(right)?;
                self.free_to(mark);
                self.emit_abc(binary_opcode(*operator), dst, l, r, span);
            }
            ExprKind::Unary { operator, operand } => {
                let mark = self.next_register;
                let src = self.compile_expr_any(operand)?;
                self.free_to(mark);
                let op = match operator {
                    UnaryOp::Negate => OpCode::Neg,
                    UnaryOp::Not => OpCode::Not,
                };
                self.emit_abc(op, dst, src, 0, span);
            }
            ExprKind::LogicalAnd { left, right } => {
                self.compile_logical(left, right, dst, OpCode::JumpIfFalse, span)?;
            }
            ExprKind::LogicalOr { left, right } => {
                self.compile_logical(left, right, dst, OpCode::JumpIfTrue, span)?;
            }
            ExprKind::Call { callee, arguments } => {
                let mark = self.next_register;
                let func = self.alloc_register(span)?;
                self.compile_expr_into(callee, func)?;
                self.compile_call_args(func, None, arguments, dst, span)?;
                self.free_to(mark);
            }
            ExprKind::MethodCall {
                object,
                method,
                arguments,
            } => {
                let mark = self.next_register;
                let func = self.alloc_register(span)?;
                let name = self.add_string_constant(method, span)?;
                self.emit_abx(OpCode::GetGlobal, func, name, span);
                self.compile_call_args(func, Some(object), arguments, dst, span)?;
                self.free_to(mark);
            }
            ExprKind::Member { object, name } => {
                let mark = self.next_register;
                let obj = self.compile_expr_any(object)?;
                let key = self.add_string_constant(name, span)?;
                match u8::try_from(key) {
                    Ok(key) => {
                        self.emit_abc(OpCode::GetField, dst, obj, key, span);
                    }
                    Err(_) => {
                        let key_reg = self.alloc_register(span)?;
                        self.emit_abx(OpCode::LoadConst, key_reg, key, span);
                        self.emit_abc(OpCode::GetIndex, dst, obj, key_reg, span);
                    }
                }
                self.free_to(mark);
            }
            ExprKind::Index { object, index } => {
                let mark = self.next_register;
                let obj = self.compile_operand(object, &[&**index])?;
                let idx = self.compile_expr_any(index)?;
                self.free_to(mark);
                self.emit_abc(OpCode::GetIndex, dst, obj, idx, span);
            }
            ExprKind::Array(elements) => {
                let mark = self.next_register;
                let start = self.compile_operand_list(elements, "array elements", span)?;
                self.emit_abc(OpCode::NewArray, dst, start, elements.len() as u8, span);
                self.free_to(mark);
            }
            ExprKind::Hash(pairs) => {
                if pairs.len() > u8::MAX as usize {
                    let limit = u8::MAX as usize;
                    return Err(CompileError::too_many_operands("map entries", limit, span));
                }
                let mark = self.next_register;
                let start = self.next_register as u8;
                for (key, value) in pairs {
                    let k = self.alloc_register(span)?;
                    self.compile_expr_into(key, k)?;
                    let v = self.alloc_register(span)?;
                    self.compile_expr_into(value, v)?;
                }
                self.emit_abc(OpCode::NewMap, dst, start, pairs.len() as u8, span);
                self.free_to(mark);
            }
            ExprKind::Assign { target, value } => self.compile_assign(target, value, dst, span)?,
            ExprKind::Lambda { params, body } => {
                let proto =
                    self.compile_function(FunctionType::Lambda, "<lambda>", params, body, span)?;
                self.emit_abx(OpCode::Closure, dst, proto, span);
            }
            ExprKind::Match { expression, arms } => {
                self.compile_match(expression, arms, dst, span)?;
            }
            ExprKind::WrapOk(inner) => self.compile_unary_form(OpCode::WrapOk, inner, dst, span)?,
            ExprKind::WrapErr(inner) => self.compile_unary_form(OpCode::WrapErr, inner, dst, span)?,
            ExprKind::Try(inner) => self.compile_unary_form(OpCode::Try, inner, dst, span)?,
            ExprKind::Pipeline { value, function } => {
                let mark = self.next_register;
                let func = self.alloc_register(span)?;
                let arg = self.alloc_register(value.span)?;
                self.compile_expr_into(value, arg)?;
                self.compile_expr_into(function, func)?;
                self.emit_abc(OpCode::Call, func, 1, dst, span);
                self.free_to(mark);
            }
            ExprKind::StructLiteral { name, fields } => {
                self.compile_struct_literal(name, fields, dst, span)?;
            }
            ExprKind::Block(statements) => self.compile_block_expr(statements, dst, span)?,
        }
        Ok(())
    }

    /// Compile an expression into whatever register is cheapest and return it.
    /// Locals are used in place; anything else goes to a new temporary.
    pub fn compile_expr_any(&mut self, expr: &Expr) -> CompileResult<u8> {
        if let ExprKind::Variable(name) = &expr.kind {
            if let Some(idx) = self.resolve_local(name) {
                return Ok(self.locals[idx].register);
            }
        }
        let reg = self.alloc_register(expr.span)?;
        self.compile_expr_into(expr, reg)?;
        Ok(reg)
    }

    /// Like `compile_expr_any`, but a local is copied into a temporary when
    /// one of the `later` operands could reassign it before the instruction
    /// reads its operands.
    fn compile_operand(&mut self, expr: &Expr, later: &[&Expr]) -> CompileResult<u8> {
        if later.iter().all(|e| is_inert(e)) {
            return self.compile_expr_any(expr);
        }
        let reg = self.alloc_register(expr.span)?;
        self.compile_expr_into(expr, reg)?;
        Ok(reg)
    }

    /// True when `reg` currently holds a live local.
    fn is_local_register(&self, reg: u8) -> bool {
        self.locals.iter().any(|l| l.register == reg)
    }

    fn compile_variable_get(&mut self, name: &str, dst: u8, span: Span) -> CompileResult<()> {
        match self.resolve_variable(name, span)? {
            VariableAccess::Local { register, .. } => {
                if register != dst {
                    self.emit_abc(OpCode::Move, dst, register, 0, span);
                }
            }
            VariableAccess::Upvalue { index, .. } => {
                self.emit_abc(OpCode::GetUpvalue, dst, index, 0, span);
            }
            VariableAccess::Global(name) => {
                let idx = self.add_string_constant(&name, span)?;
                self.emit_abx(OpCode::GetGlobal, dst, idx, span);
            }
        }
        Ok(())
    }

    fn compile_assign(
        &mut self,
        target: &Expr,
        value: &Expr,
        dst: u8,
        span: Span,
    ) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Variable(name) => match self.resolve_variable(name, span)? {
                VariableAccess::Local { register, mutable } => {
                    if !mutable {
                        return Err(CompileError::immutable_assignment(name.clone(), span));
                    }
                    self.compile_expr_into(value, register)?;
                    if register != dst {
                        self.emit_abc(OpCode::Move, dst, register, 0, span);
                    }
                }
                VariableAccess::Upvalue { index, mutable } => {
                    if !mutable {
                        return Err(CompileError::immutable_assignment(name.clone(), span));
                    }
                    self.compile_expr_into(value, dst)?;
                    self.emit_abc(OpCode::SetUpvalue, index, dst, 0, span);
                }
                VariableAccess::Global(name) => {
                    self.compile_expr_into(value, dst)?;
                    let idx = self.add_string_constant(&name, span)?;
                    self.emit_abx(OpCode::SetGlobal, dst, idx, span);
                }
            },
            ExprKind::Member { object, name } => {
                let mark = self.next_register;
                let obj = self.compile_operand(object, &[value])?;
                self.compile_expr_into(value, dst)?;
                let key = self.add_string_constant(name, span)?;
                match u8::try_from(key) {
                    Ok(key) => {
                        self.emit_abc(OpCode::SetField, obj, key, dst, span);
                    }
                    Err(_) => {
                        let key_reg = self.alloc_register(span)?;
                        self.emit_abx(OpCode::LoadConst, key_reg, key, span);
                        self.emit_abc(OpCode::SetIndex, obj, key_reg, dst, span);
                    }
                }
                self.free_to(mark);
            }
            ExprKind::Index { object, index } => {
                let mark = self.next_register;
                let obj = self.compile_operand(object, &[&**index, value])?;
                let idx = self.compile_operand(index, &[value])?;
                self.compile_expr_into(value, dst)?;
                self.emit_abc(OpCode::SetIndex, obj, idx, dst, span);
                self.free_to(mark);
            }
            _ => return Err(CompileError::InvalidAssignmentTarget(target.span)),
        }
        Ok(())
    }

    /// A map whose first entry is `__type__: name`, followed by the fields in order.
    fn compile_struct_literal(
        &mut self,
        name: &str,
        fields: &[(String, Expr)],
        dst: u8,
        span: Span,
    ) -> CompileResult<()> {
        if fields.len() >= u8::MAX as usize {
            let limit = u8::MAX as usize - 1;
            return Err(CompileError::too_many_operands("struct fields", limit, span));
        }
        let mark = self.next_register;
        let start = self.next_register as u8;
        let entries = std::iter::once(("__type__", None))
            .chain(fields.iter().map(|(key, value)| (key.as_str(), Some(value))));
        for (key, value) in entries {
            let k = self.alloc_register(span)?;
            let key_idx = self.add_string_constant(key, span)?;
            self.emit_abx(OpCode::LoadConst, k, key_idx, span);
            let v = self.alloc_register(span)?;
            match value {
                Some(value) => self.compile_expr_into(value, v)?,
                None => {
                    let name_idx = self.add_string_constant(name, span)?;
                    self.emit_abx(OpCode::LoadConst, v, name_idx, span);
                }
            }
        }
        self.emit_abc(OpCode::NewMap, dst, start, (fields.len() + 1) as u8, span);
        self.free_to(mark);
        Ok(())
    }

    /// Statements in their own scope; the trailing expression statement is
    /// the value, anything else yields null.
    fn compile_block_expr(
        &mut self,
        statements: &[Stmt],
        dst: u8,
        span: Span,
    ) -> CompileResult<()> {
        self.begin_scope();
        let (last, init) = match statements.split_last() {
            Some((last, init)) => (Some(last), init),
            None => (None, statements),
        };
        for stmt in init {
            self.compile_stmt(stmt)?;
        }
        match last {
            Some(Stmt {
                kind: StmtKind::Expression(expr),
                ..
            }) => self.compile_expr_into(expr, dst)?,
            Some(stmt) => {
                self.compile_stmt(stmt)?;
                self.emit_abc(OpCode::LoadNull, dst, 0, 0, span);
            }
            None => {
                self.emit_abc(OpCode::LoadNull, dst, 0, 0, span);
            }
        }
        self.end_scope(span);
        Ok(())
    }

    /// `a && b` / `a || b`: short-circuit, then coerce to a boolean.
    fn compile_logical(
        &mut self,
        left: &Expr,
        right: &Expr,
        dst: u8,
        jump_op: OpCode,
        span: Span,
    ) -> CompileResult<()> {
        // The left value lands in the target before the right side runs, so a
        // local target must not be overwritten until both sides are done.
        let mark = self.next_register;
        let target = if self.is_local_register(dst) {
            self.alloc_register(span)?
        } else {
            dst
        };
        self.compile_expr_into(left, target)?;
        let short_circuit = self.emit_jump(jump_op, target, span);
        self.compile_expr_into(right, target)?;
        self.patch_jump(short_circuit, span)?;
        self.emit_abc(OpCode::Truth, dst, target, 0, span);
        self.free_to(mark);
        Ok(())
    }

    /// Place arguments after `func` and emit the call. `receiver`, when given,
    /// becomes the first argument.
    fn compile_call_args(
        &mut self,
        func: u8,
        receiver: Option<&Expr>,
        arguments: &[Expr],
        dst: u8,
        span: Span,
    ) -> CompileResult<()> {
        let argc = arguments.len() + usize::from(receiver.is_some());
        if argc > u8::MAX as usize {
            return Err(CompileError::too_many_operands("arguments", u8::MAX as usize, span));
        }
        for arg in receiver.into_iter().chain(arguments) {
            let reg = self.alloc_register(arg.span)?;
            self.compile_expr_into(arg, reg)?;
        }
        self.emit_abc(OpCode::Call, func, argc as u8, dst, span);
        Ok(())
    }

    /// Evaluate `items` into consecutive fresh registers; returns the first one.
    fn compile_operand_list(
        &mut self,
        items: &[Expr],
        what: &'static str,
        span: Span,
    ) -> CompileResult<u8> {
        if items.len() > u8::MAX as usize {
            return Err(CompileError::too_many_operands(what, u8::MAX as usize, span));
        }
        let start = self.next_register as u8;
        for item in items {
            let reg = self.alloc_register(item.span)?;
            self.compile_expr_into(item, reg)?;
        }
        Ok(start)
    }

    fn compile_interpolated_string(
        &mut self,
        parts: &[InterpolatedPart],
        dst: u8,
        span: Span,
    ) -> CompileResult<()> {
        if parts.len() > u8::MAX as usize {
            let limit = u8::MAX as usize;
            return Err(CompileError::too_many_operands("interpolated parts", limit, span));
        }
        let mark = self.next_register;
        let start = self.next_register as u8;
        for part in parts {
            let reg = self.alloc_register(span)?;
            match part {
                InterpolatedPart::Literal(text) => {
                    let idx = self.add_string_constant(text, span)?;
                    self.emit_abx(OpCode::LoadConst, reg, idx, span);
                }
                InterpolatedPart::Expression(expr) => self.compile_expr_into(expr, reg)?,
            }
        }
        self.emit_abc(OpCode::Interpolate, dst, start, parts.len() as u8, span);
        self.free_to(mark);
        Ok(())
    }

    fn compile_unary_form(
        &mut self,
        op: OpCode,
        inner: &Expr,
        dst: u8,
        span: Span,
    ) -> CompileResult<()> {
        let mark = self.next_register;
        let src = self.compile_expr_any(inner)?;
        self.free_to(mark);
        self.emit_abc(op, dst, src, 0, span);
        Ok(())
    }

    /// Compile a function body into a new prototype of the current chunk.
    pub fn compile_function(
        &mut self,
        function_type: FunctionType,
        name: &str,
        params: &[Parameter],
        body: &[Stmt],
        span: Span,
    ) -> CompileResult<u16> {
        self.begin_function(function_type, name, params, span)?;
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        self.end_function(span)
    }
}

/// Evaluating these cannot run code that writes a register.
fn is_inert(expr: &Expr) -> bool {
    expr.is_literal() || matches!(expr.kind, ExprKind::Variable(_))
}

pub(super) fn binary_opcode(op: BinaryOp) -> OpCode {
    match op {
        BinaryOp::Add => OpCode::Add,
        BinaryOp::Subtract => OpCode::Sub,
        BinaryOp::Multiply => OpCode::Mul,
        BinaryOp::Divide => OpCode::Div,
        BinaryOp::Modulo => OpCode::Mod,
        BinaryOp::Equal => OpCode::Eq,
        BinaryOp::NotEqual => OpCode::NotEq,
        BinaryOp::Less => OpCode::Lt,
        BinaryOp::LessEqual => OpCode::LtEq,
        BinaryOp::Greater => OpCode::Gt,
        BinaryOp::GreaterEqual => OpCode::GtEq,
        BinaryOp::Concat => OpCode::Concat,
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::{BinaryOp, Expr, ExprKind, Parameter, Program, Stmt, StmtKind};
    use crate::error::CompileError;
    use crate::span::Span;
    use crate::vm::compiler::Compiler;
    use crate::vm::opcode::OpCode;
    use crate::vm::upvalue::UpvalueDescriptor;
    use pretty_assertions::assert_eq;

    fn sp(line: usize) -> Span {
        Span::at_line(line)
    }

    #[test]
    fn test_arithmetic_uses_three_registers() {
        // let x = 2 + 3 * 4
        let expr = Expr::binary(
            Expr::int(2, sp(1)),
            BinaryOp::Add,
            Expr::binary(Expr::int(3, sp(1)), BinaryOp::Multiply, Expr::int(4, sp(1)), sp(1)),
            sp(1),
        );
        let module = Compiler::compile(&Program::new(vec![Stmt::let_("x", expr, sp(1))])).unwrap();
        let chunk = &module.main;
        assert_eq!(chunk.count_op(OpCode::Mul), 1);
        let add = chunk
            .code
            .iter()
            .find(|i| i.opcode() == Some(OpCode::Add))
            .unwrap();
        assert_eq!(add.a(), 0, "result lands in x's register");
        assert!(chunk.max_registers <= 5);
    }

    #[test]
    fn test_lines_follow_spans() {
        let program = Program::new(vec![
            Stmt::let_("a", Expr::int(1, sp(10)), sp(10)),
            Stmt::let_("b", Expr::string("s", sp(11)), sp(11)),
        ]);
        let module = Compiler::compile(&program).unwrap();
        assert_eq!(&module.main.lines[..2], &[10, 11]);
    }

    #[test]
    fn test_closure_captures_enclosing_local() {
        // let mut count = 0; let inc = fn() { count = count + 1; return count; }
        let body = vec![
            Stmt::expr(Expr::assign(
                Expr::var("count", sp(2)),
                Expr::binary(Expr::var("count", sp(2)), BinaryOp::Add, Expr::int(1, sp(2)), sp(2)),
                sp(2),
            )),
            Stmt::ret(Some(Expr::var("count", sp(3))), sp(3)),
        ];
        let lambda = Expr::new(ExprKind::Lambda { params: vec![], body }, sp(2));
        let program = Program::new(vec![
            Stmt::let_mut("count", Expr::int(0, sp(1)), sp(1)),
            Stmt::let_("inc", lambda, sp(2)),
        ]);
        let module = Compiler::compile(&program).unwrap();
        let inner = &module.main.prototypes[0];
        assert_eq!(
            inner.upvalues,
            vec![UpvalueDescriptor {
                is_local: true,
                index: 0
            }]
        );
        assert_eq!(inner.count_op(OpCode::SetUpvalue), 1);
        assert_eq!(inner.count_op(OpCode::GetUpvalue), 2);
    }

    #[test]
    fn test_nested_capture_goes_through_intermediate_function() {
        // fn outer() { let x = 1; let mid = fn() { return fn() { return x; }; }; }
        let innermost = Expr::new(
            ExprKind::Lambda {
                params: vec![],
                body: vec![Stmt::ret(Some(Expr::var("x", sp(3))), sp(3))],
            },
            sp(3),
        );
        let mid = Expr::new(
            ExprKind::Lambda {
                params: vec![],
                body: vec![Stmt::ret(Some(innermost), sp(3))],
            },
            sp(2),
        );
        let outer = crate::ast::FunctionDecl {
            name: "outer".into(),
            params: vec![Parameter::new("unused")],
            body: vec![
                Stmt::let_("x", Expr::int(1, sp(2)), sp(2)),
                Stmt::let_("mid", mid, sp(2)),
            ],
            span: sp(1),
        };
        let stmts = vec![Stmt::new(StmtKind::Function(outer), sp(1))];
        let module = Compiler::compile(&Program::new(stmts)).unwrap();
        let outer = &module.main.prototypes[0];
        let mid = &outer.prototypes[0];
        let innermost = &mid.prototypes[0];
        assert_eq!(mid.upvalues, vec![UpvalueDescriptor { is_local: true, index: 1 }]);
        assert_eq!(innermost.upvalues, vec![UpvalueDescriptor { is_local: false, index: 0 }]);
    }

    #[test]
    fn test_assign_to_captured_immutable_is_rejected() {
        let assign_x = Expr::assign(Expr::var("x", sp(2)), Expr::int(2, sp(2)), sp(2));
        let body = vec![Stmt::expr(assign_x)];
        let program = Program::new(vec![
            Stmt::let_("x", Expr::int(1, sp(1)), sp(1)),
            Stmt::expr(Expr::new(ExprKind::Lambda { params: vec![], body }, sp(2))),
        ]);
        assert_eq!(
            Compiler::compile(&program).unwrap_err(),
            CompileError::immutable_assignment("x", sp(2))
        );
    }

    #[test]
    fn test_invalid_assignment_target() {
        let program = Program::new(vec![Stmt::expr(Expr::assign(
            Expr::int(1, sp(4)),
            Expr::int(2, sp(4)),
            sp(4),
        ))]);
        assert_eq!(
            Compiler::compile(&program).unwrap_err(),
            CompileError::InvalidAssignmentTarget(sp(4))
        );
    }
}
