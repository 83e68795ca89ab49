//! Pattern matching compilation for match expressions.
//!
//! Each arm tests the subject register, binds names into fresh registers and
//! evaluates its body into the match destination. A failed test jumps to the
//! next arm; falling off the last arm yields null.

use crate::ast::expr::{MatchArm, MatchPattern};
use crate::ast::Expr;
use crate::error::CompileError;
use crate::span::Span;

use super::compiler::{CompileResult, Compiler};
use super::opcode::OpCode;

impl Compiler {
    /// Compile a match expression into `dst`.
    pub fn compile_match(
        &mut self,
        subject: &Expr,
        arms: &[MatchArm],
        dst: u8,
        span: Span,
    ) -> CompileResult<()> {
        let mark = self.next_register;
        let subject_reg = self.alloc_register(subject.span)?;
        self.compile_expr_into(subject, subject_reg)?;

        let mut end_jumps = Vec::new();
        for arm in arms {
            self.begin_scope();
            let mut fail_jumps = self.compile_pattern(&arm.pattern, subject_reg, span)?;

            if let Some(guard) = &arm.guard {
                let g = self.compile_expr_any(guard)?;
                fail_jumps.push(self.emit_jump(OpCode::JumpIfFalse, g, guard.span));
            }

            self.compile_expr_into(&arm.body, dst)?;

            let captured_floor = self
                .locals
                .iter()
                .filter(|l| l.depth == self.scope_depth && l.is_captured)
                .map(|l| l.register)
                .min();
            self.end_scope(span);
            end_jumps.push(self.emit_jump(OpCode::Jump, 0, span));

            for at in fail_jumps {
                self.patch_jump(at, span)?;
            }
            // The guard may have captured a binding before failing.
            if let Some(reg) = captured_floor {
                self.emit_abc(OpCode::Close, reg, 0, 0, span);
            }
        }

        self.emit_abc(OpCode::LoadNull, dst, 0, 0, span);
        for at in end_jumps {
            self.patch_jump(at, span)?;
        }
        self.free_to(mark);
        Ok(())
    }

    /// Emit the test and bindings for one pattern; returns the jumps taken on mismatch.
    fn compile_pattern(
        &mut self,
        pattern: &MatchPattern,
        subject: u8,
        span: Span,
    ) -> CompileResult<Vec<usize>> {
        let mut fail_jumps = Vec::new();
        match pattern {
            MatchPattern::Wildcard => {}
            MatchPattern::Literal(expr) => {
                if !expr.is_literal() {
                    return Err(CompileError::new("match pattern must be a literal", expr.span));
                }
                let test = self.alloc_register(expr.span)?;
                self.compile_expr_into(expr, test)?;
                self.emit_abc(OpCode::Eq, test, subject, test, span);
                fail_jumps.push(self.emit_jump(OpCode::JumpIfFalse, test, span));
            }
            MatchPattern::Variable(name) => {
                let reg = self.alloc_register(span)?;
                self.emit_abc(OpCode::Move, reg, subject, 0, span);
                self.add_local(name.clone(), reg, false);
            }
            MatchPattern::Ok(name) | MatchPattern::Err(name) => {
                let want_err = u8::from(matches!(pattern, MatchPattern::Err(_)));
                let reg = self.alloc_register(span)?;
                self.emit_abc(OpCode::TestResult, reg, subject, want_err, span);
                fail_jumps.push(self.emit_jump(OpCode::JumpIfFalse, reg, span));
                self.emit_abc(OpCode::Unwrap, reg, subject, 0, span);
                self.add_local(name.clone(), reg, false);
            }
        }
        Ok(fail_jumps)
    }
}
