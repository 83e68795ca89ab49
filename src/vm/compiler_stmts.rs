//! Statement compilation: AST statements to bytecode.

use crate::ast::expr::{BinaryOp, Expr};
use crate::ast::stmt::{FunctionDecl, Stmt, StmtKind, WhenArm};
use crate::error::CompileError;
use crate::span::Span;

use super::compiler::{CompileResult, Compiler, FunctionType};
use super::compiler_exprs::binary_opcode;
use super::opcode::OpCode;

impl Compiler {
    /// Compile a statement. Temporaries are released afterwards.
    pub fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Expression(expr) => {
                let dst = self.alloc_register(span)?;
                self.compile_expr_into(expr, dst)?;
            }
            StmtKind::Let {
                name,
                mutable,
                initializer,
            } => {
                let reg = self.alloc_register(span)?;
                match initializer {
                    Some(init) => self.compile_expr_into(init, reg)?,
                    None => {
                        self.emit_abc(OpCode::LoadNull, reg, 0, 0, span);
                    }
                }
                // Declared after the initializer so `let x = x + 1` sees the outer `x`.
                self.add_local(name.clone(), reg, *mutable);
            }
            StmtKind::Block(statements) => {
                self.begin_scope();
                for s in statements {
                    self.compile_stmt(s)?;
                }
                self.end_scope(span);
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_if(condition, then_branch, else_branch.as_deref(), span)?;
            }
            StmtKind::While { condition, body } => {
                self.compile_while(condition, body, span)?;
            }
            StmtKind::Loop(body) => {
                let start = self.current_offset();
                self.begin_loop(Some(start));
                self.compile_stmt(body)?;
                self.emit_loop(start, span)?;
                self.end_loop(span)?;
            }
            StmtKind::For {
                variable,
                iterable,
                body,
            } => {
                self.compile_for(variable, iterable, body, span)?;
            }
            StmtKind::Break => self.compile_break(span)?,
            StmtKind::Continue => self.compile_continue(span)?,
            StmtKind::Return(value) => match value {
                Some(expr) => {
                    let reg = self.compile_expr_any(expr)?;
                    self.emit_abc(OpCode::Return, reg, 0, 0, span);
                }
                None => {
                    self.emit_abc(OpCode::ReturnNull, 0, 0, 0, span);
                }
            },
            StmtKind::Function(decl) => self.compile_function_decl(decl)?,
            StmtKind::Spawn(body) => {
                let proto = self.compile_function(FunctionType::Task, "<task>", &[], body, span)?;
                let reg = self.alloc_register(span)?;
                self.emit_abx(OpCode::Closure, reg, proto, span);
                self.emit_abc(OpCode::Spawn, reg, 0, 0, span);
            }
            StmtKind::When { subject, arms } => self.compile_when(subject, arms, span)?,
        }
        let top = self.locals_top();
        self.free_to(top);
        Ok(())
    }

    fn compile_if(
        &mut self,
        condition: &Expr,
        then_branch: &Stmt,
        else_branch: Option<&Stmt>,
        span: Span,
    ) -> CompileResult<()> {
        let mark = self.next_register;
        let cond = self.compile_expr_any(condition)?;
        let else_jump = self.emit_jump(OpCode::JumpIfFalse, cond, span);
        self.free_to(mark);

        self.compile_stmt(then_branch)?;

        match else_branch {
            Some(else_branch) => {
                let end_jump = self.emit_jump(OpCode::Jump, 0, span);
                self.patch_jump(else_jump, span)?;
                self.compile_stmt(else_branch)?;
                self.patch_jump(end_jump, span)?;
            }
            None => self.patch_jump(else_jump, span)?,
        }
        Ok(())
    }

    /// `when subject { op value => body, ..., else => body }`: the first arm
    /// whose comparison against the subject holds runs; an `else` arm always
    /// runs and ends the chain.
    fn compile_when(&mut self, subject: &Expr, arms: &[WhenArm], span: Span) -> CompileResult<()> {
        let mark = self.next_register;
        let subject_reg = self.alloc_register(subject.span)?;
        self.compile_expr_into(subject, subject_reg)?;

        let mut end_jumps = Vec::new();
        for arm in arms {
            let arm_mark = self.next_register;
            let Some((operator, value)) = &arm.test else {
                let result = self.alloc_register(arm.body.span)?;
                self.compile_expr_into(&arm.body, result)?;
                self.free_to(arm_mark);
                break;
            };
            let op = comparison_opcode(*operator)
                .ok_or_else(|| {
                    CompileError::new("when arm needs a comparison operator", value.span)
                })?;
            let cond = self.alloc_register(value.span)?;
            self.compile_expr_into(value, cond)?;
            self.emit_abc(op, cond, subject_reg, cond, span);
            let skip = self.emit_jump(OpCode::JumpIfFalse, cond, span);
            self.free_to(arm_mark);

            let result = self.alloc_register(arm.body.span)?;
            self.compile_expr_into(&arm.body, result)?;
            self.free_to(arm_mark);
            end_jumps.push(self.emit_jump(OpCode::Jump, 0, span));
            self.patch_jump(skip, span)?;
        }
        for at in end_jumps {
            self.patch_jump(at, span)?;
        }
        self.free_to(mark);
        Ok(())
    }

    fn compile_while(&mut self, condition: &Expr, body: &Stmt, span: Span) -> CompileResult<()> {
        let start = self.current_offset();
        let mark = self.next_register;
        let cond = self.compile_expr_any(condition)?;
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse, cond, span);
        self.free_to(mark);

        self.begin_loop(Some(start));
        self.compile_stmt(body)?;
        self.emit_loop(start, span)?;
        self.patch_jump(exit_jump, span)?;
        self.end_loop(span)
    }

    /// `for x in xs { body }` over an array, lowered to an index loop:
    ///
    /// ```text
    ///   iter = xs; index = 0
    /// start:
    ///   t = len(iter); t = index < t; if !t goto exit
    ///   x = iter[index]; body
    /// continue:
    ///   index = index + 1; goto start
    /// exit:
    /// ```
    fn compile_for(
        &mut self,
        variable: &str,
        iterable: &Expr,
        body: &Stmt,
        span: Span,
    ) -> CompileResult<()> {
        self.begin_scope();

        let iter = self.alloc_register(span)?;
        self.compile_expr_into(iterable, iter)?;
        self.add_local("(for iterable)", iter, false);

        let index = self.alloc_register(span)?;
        self.emit_load_int(index, 0, span)?;
        self.add_local("(for index)", index, true);

        let start = self.current_offset();
        let test = self.alloc_register(span)?;
        self.emit_abc(OpCode::Len, test, iter, 0, span);
        self.emit_abc(OpCode::Lt, test, index, test, span);
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse, test, span);
        self.free_to(test as usize);

        self.begin_loop(None);
        self.begin_scope();
        let item = self.alloc_register(span)?;
        self.emit_abc(OpCode::GetIndex, item, iter, index, span);
        self.add_local(variable, item, false);
        self.compile_stmt(body)?;
        self.end_scope(span);

        self.patch_continues(span)?;
        let one = self.alloc_register(span)?;
        self.emit_load_int(one, 1, span)?;
        self.emit_abc(OpCode::Add, index, index, one, span);
        self.free_to(one as usize);
        self.emit_loop(start, span)?;

        self.patch_jump(exit_jump, span)?;
        self.end_loop(span)?;
        self.end_scope(span);
        Ok(())
    }

    /// Close any cells the loop body opened before leaving it.
    fn close_loop_body(&mut self, span: Span) {
        let Some(body_register) = self.loops.last().map(|ctx| ctx.body_register) else {
            return;
        };
        let has_body_locals = self
            .locals
            .iter()
            .any(|l| l.register as usize >= body_register);
        if has_body_locals {
            self.emit_abc(OpCode::Close, body_register as u8, 0, 0, span);
        }
    }

    fn compile_break(&mut self, span: Span) -> CompileResult<()> {
        if self.loops.is_empty() {
            return Err(CompileError::BreakOutsideLoop(span));
        }
        self.close_loop_body(span);
        let jump = self.emit_jump(OpCode::Jump, 0, span);
        if let Some(ctx) = self.loops.last_mut() {
            ctx.break_patches.push(jump);
        }
        Ok(())
    }

    fn compile_continue(&mut self, span: Span) -> CompileResult<()> {
        let Some(target) = self.loops.last().map(|ctx| ctx.continue_target) else {
            return Err(CompileError::ContinueOutsideLoop(span));
        };
        self.close_loop_body(span);
        match target {
            Some(start) => self.emit_loop(start, span)?,
            None => {
                let jump = self.emit_jump(OpCode::Jump, 0, span);
                if let Some(ctx) = self.loops.last_mut() {
                    ctx.continue_patches.push(jump);
                }
            }
        }
        Ok(())
    }

    /// Top-level functions become globals so they can call each other and
    /// recurse; nested ones are locals, declared before the body so they can
    /// recurse through an upvalue.
    fn compile_function_decl(&mut self, decl: &FunctionDecl) -> CompileResult<()> {
        let span = decl.span;
        let is_global = self.function_type == FunctionType::Script && self.scope_depth == 0;

        if is_global {
            let proto = self.compile_function(
                FunctionType::Function,
                &decl.name,
                &decl.params,
                &decl.body,
                span,
            )?;
            let reg = self.alloc_register(span)?;
            self.emit_abx(OpCode::Closure, reg, proto, span);
            let name = self.add_string_constant(&decl.name, span)?;
            self.emit_abx(OpCode::SetGlobal, reg, name, span);
        } else {
            let reg = self.alloc_register(span)?;
            self.add_local(decl.name.clone(), reg, false);
            let proto = self.compile_function(
                FunctionType::Function,
                &decl.name,
                &decl.params,
                &decl.body,
                span,
            )?;
            self.emit_abx(OpCode::Closure, reg, proto, span);
        }
        Ok(())
    }
}

fn comparison_opcode(op: BinaryOp) -> Option<OpCode> {
    match op {
        BinaryOp::Equal
        | BinaryOp::NotEqual
        | BinaryOp::Less
        | BinaryOp::LessEqual
        | BinaryOp::Greater
        | BinaryOp::GreaterEqual => Some(binary_opcode(op)),
        _ => None,
    }
}
