//! AST-to-bytecode compiler.
//!
//! Single-pass compilation: walks the AST once, emitting register-based
//! instructions into a `Chunk`. Variables are resolved at compile time:
//! locals become registers, names from enclosing functions become upvalues,
//! everything else is a global looked up by name.

use std::rc::Rc;

use crate::ast::stmt::{Parameter, Program, StmtKind};
use crate::error::CompileError;
use crate::span::Span;

use super::chunk::{Chunk, CompiledModule, Constant};
use super::opcode::{Instruction, OpCode};
use super::upvalue::UpvalueDescriptor;

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Registers addressable by an 8-bit operand.
pub const MAX_REGISTERS: usize = 255;

/// Highest index reachable through a 16-bit operand.
const MAX_WIDE_INDEX: usize = u16::MAX as usize;

/// A local variable tracked during compilation.
#[derive(Debug, Clone)]
pub struct Local {
    pub name: String,
    pub depth: usize,
    pub register: u8,
    pub mutable: bool,
    pub is_captured: bool,
}

/// An upvalue of the function being compiled.
#[derive(Debug, Clone, Copy)]
pub struct Capture {
    pub descriptor: UpvalueDescriptor,
    pub mutable: bool,
}

/// Tracks what kind of function is being compiled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FunctionType {
    Script,
    Function,
    Lambda,
    Task,
}

#[derive(Debug, Clone)]
pub struct LoopContext {
    /// Where `continue` jumps back to; `None` when it must be patched forward.
    pub continue_target: Option<usize>,
    pub continue_patches: Vec<usize>,
    pub break_patches: Vec<usize>,
    /// First register owned by the loop body.
    pub body_register: usize,
}

/// The compiler: transforms AST into bytecode.
pub struct Compiler {
    /// The chunk being built.
    pub chunk: Chunk,
    /// Local variables in scope, in declaration (and register) order.
    pub locals: Vec<Local>,
    /// Current scope depth (0 = function body).
    pub scope_depth: usize,
    /// Register counter at the start of each open scope.
    scope_registers: Vec<usize>,
    /// Next free register (high-water mark lives in `chunk.max_registers`).
    pub next_register: usize,
    /// Upvalues for the current function.
    pub upvalues: Vec<Capture>,
    /// Forward jumps still waiting for a target.
    pending_jumps: Vec<usize>,
    /// Innermost loop last.
    pub loops: Vec<LoopContext>,
    /// Enclosing compiler (for nested functions/closures).
    pub enclosing: Option<Box<Compiler>>,
    /// What kind of function we're compiling.
    pub function_type: FunctionType,
}

/// How a variable is accessed at runtime.
#[derive(Debug, Clone)]
pub enum VariableAccess {
    Local { register: u8, mutable: bool },
    Upvalue { index: u8, mutable: bool },
    Global(String),
}

impl Compiler {
    pub fn new(function_type: FunctionType, name: impl Into<String>) -> Self {
        Self {
            chunk: Chunk::new(name),
            locals: Vec::new(),
            scope_depth: 0,
            scope_registers: Vec::new(),
            next_register: 0,
            upvalues: Vec::new(),
            pending_jumps: Vec::new(),
            loops: Vec::new(),
            enclosing: None,
            function_type,
        }
    }

    /// Compile a full program into its top-level chunk.
    ///
    /// A trailing expression statement becomes the program's return value.
    pub fn compile(program: &Program) -> CompileResult<CompiledModule> {
        let mut compiler = Compiler::new(FunctionType::Script, "<script>");
        let (last, init) = match program.statements.split_last() {
            Some((last, init)) => (Some(last), init),
            None => (None, &[][..]),
        };
        for stmt in init {
            compiler.compile_stmt(stmt)?;
        }

        let mut end_span = Span::default();
        if let Some(stmt) = last {
            end_span = stmt.span;
            if let StmtKind::Expression(expr) = &stmt.kind {
                let dst = compiler.alloc_register(stmt.span)?;
                compiler.compile_expr_into(expr, dst)?;
                compiler.emit_abc(OpCode::Return, dst, 0, 0, stmt.span);
            } else {
                compiler.compile_stmt(stmt)?;
            }
        }

        let chunk = compiler.finish(end_span)?;
        Ok(CompiledModule::new(chunk))
    }

    // --- Emission helpers ---

    pub fn emit(&mut self, instruction: Instruction, span: Span) -> usize {
        self.chunk.emit(instruction, span.line)
    }

    pub fn emit_abc(&mut self, op: OpCode, a: u8, b: u8, c: u8, span: Span) -> usize {
        self.emit(Instruction::abc(op, a, b, c), span)
    }

    pub fn emit_abx(&mut self, op: OpCode, a: u8, bx: u16, span: Span) -> usize {
        self.emit(Instruction::abx(op, a, bx), span)
    }

    /// Load an integer, inline when it fits the immediate field.
    pub fn emit_load_int(&mut self, dst: u8, value: i64, span: Span) -> CompileResult<()> {
        match i16::try_from(value) {
            Ok(imm) => {
                self.emit(Instruction::asbx(OpCode::LoadInt, dst, imm), span);
            }
            Err(_) => {
                let idx = self.add_constant(Constant::Int(value), span)?;
                self.emit_abx(OpCode::LoadConst, dst, idx, span);
            }
        }
        Ok(())
    }

    pub fn add_constant(&mut self, constant: Constant, span: Span) -> CompileResult<u16> {
        let idx = self.chunk.add_constant(constant);
        if idx > MAX_WIDE_INDEX {
            return Err(CompileError::TooManyConstants {
                function: self.chunk.name.clone(),
                span,
            });
        }
        Ok(idx as u16)
    }

    pub fn add_string_constant(&mut self, s: &str, span: Span) -> CompileResult<u16> {
        self.add_constant(Constant::String(s.to_string()), span)
    }

    pub fn current_offset(&self) -> usize {
        self.chunk.len()
    }

    /// Emit a forward jump with a placeholder offset; patch it with `patch_jump`.
    pub fn emit_jump(&mut self, op: OpCode, a: u8, span: Span) -> usize {
        let at = self.emit(Instruction::asbx(op, a, 0), span);
        self.pending_jumps.push(at);
        at
    }

    /// Point the jump at `at` to the next instruction to be emitted.
    pub fn patch_jump(&mut self, at: usize, span: Span) -> CompileResult<()> {
        let distance = self.current_offset() as isize - (at as isize + 1);
        let offset = i16::try_from(distance).map_err(|_| CompileError::JumpOutOfRange(span))?;
        self.chunk.set_jump_offset(at, offset);
        if let Some(pos) = self.pending_jumps.iter().position(|&p| p == at) {
            self.pending_jumps.swap_remove(pos);
        }
        Ok(())
    }

    /// Emit a backward jump to `target` (already emitted, so no patching needed).
    pub fn emit_loop(&mut self, target: usize, span: Span) -> CompileResult<()> {
        let distance = target as isize - (self.current_offset() as isize + 1);
        let offset = i16::try_from(distance).map_err(|_| CompileError::JumpOutOfRange(span))?;
        self.emit(Instruction::asbx(OpCode::Loop, 0, offset), span);
        Ok(())
    }

    // --- Registers ---

    pub fn alloc_register(&mut self, span: Span) -> CompileResult<u8> {
        if self.next_register >= MAX_REGISTERS {
            return Err(CompileError::TooManyRegisters {
                function: self.chunk.name.clone(),
                span,
            });
        }
        let reg = self.next_register;
        self.next_register += 1;
        self.chunk.max_registers = self.chunk.max_registers.max(self.next_register);
        Ok(reg as u8)
    }

    /// Release every register at or above `mark`.
    pub fn free_to(&mut self, mark: usize) {
        self.next_register = mark;
    }

    /// First register above the live locals.
    pub fn locals_top(&self) -> usize {
        let scope_floor = self.scope_registers.last().copied().unwrap_or(0);
        self.locals
            .last()
            .map_or(scope_floor, |l| l.register as usize + 1)
            .max(scope_floor)
    }

    // --- Scope management ---

    pub fn begin_scope(&mut self) {
        self.scope_depth += 1;
        self.scope_registers.push(self.next_register);
    }

    pub fn end_scope(&mut self, span: Span) {
        self.scope_depth -= 1;
        let mut lowest_captured = None;
        while let Some(local) = self.locals.last() {
            if local.depth <= self.scope_depth {
                break;
            }
            if local.is_captured {
                lowest_captured = Some(local.register);
            }
            self.locals.pop();
        }
        if let Some(reg) = lowest_captured {
            self.emit_abc(OpCode::Close, reg, 0, 0, span);
        }
        if let Some(mark) = self.scope_registers.pop() {
            self.free_to(mark);
        }
    }

    // --- Local variables ---

    /// Bind `name` to `register` in the current scope. Shadowing is allowed.
    pub fn add_local(&mut self, name: impl Into<String>, register: u8, mutable: bool) {
        self.locals.push(Local {
            name: name.into(),
            depth: self.scope_depth,
            register,
            mutable,
            is_captured: false,
        });
    }

    pub fn resolve_local(&self, name: &str) -> Option<usize> {
        self.locals.iter().rposition(|local| local.name == name)
    }

    pub fn resolve_upvalue(&mut self, name: &str, span: Span) -> CompileResult<Option<u8>> {
        let Some(enclosing) = self.enclosing.as_mut() else {
            return Ok(None);
        };
        // Local in the enclosing function: promote it to a captured cell.
        if let Some(idx) = enclosing.resolve_local(name) {
            let local = &mut enclosing.locals[idx];
            local.is_captured = true;
            let (register, mutable) = (local.register, local.mutable);
            return self.add_upvalue(true, register, mutable, span).map(Some);
        }
        // Upvalue of the enclosing function (recursive).
        if let Some(index) = enclosing.resolve_upvalue(name, span)? {
            let mutable = enclosing.upvalues[index as usize].mutable;
            return self.add_upvalue(false, index, mutable, span).map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(
        &mut self,
        is_local: bool,
        index: u8,
        mutable: bool,
        span: Span,
    ) -> CompileResult<u8> {
        if let Some(i) = self
            .upvalues
            .iter()
            .position(|c| c.descriptor.index == index && c.descriptor.is_local == is_local)
        {
            return Ok(i as u8);
        }
        if self.upvalues.len() > u8::MAX as usize {
            return Err(CompileError::TooManyUpvalues {
                function: self.chunk.name.clone(),
                span,
            });
        }
        self.upvalues.push(Capture {
            descriptor: UpvalueDescriptor { is_local, index },
            mutable,
        });
        Ok((self.upvalues.len() - 1) as u8)
    }

    /// Resolve a variable name to the appropriate get/set operations.
    pub fn resolve_variable(&mut self, name: &str, span: Span) -> CompileResult<VariableAccess> {
        if let Some(idx) = self.resolve_local(name) {
            let local = &self.locals[idx];
            return Ok(VariableAccess::Local {
                register: local.register,
                mutable: local.mutable,
            });
        }
        if let Some(index) = self.resolve_upvalue(name, span)? {
            let mutable = self.upvalues[index as usize].mutable;
            return Ok(VariableAccess::Upvalue { index, mutable });
        }
        Ok(VariableAccess::Global(name.to_string()))
    }

    // --- Function compilation ---

    /// Start compiling a nested function: the current compiler becomes the
    /// enclosing one and parameters take the first registers.
    pub fn begin_function(
        &mut self,
        function_type: FunctionType,
        name: &str,
        params: &[Parameter],
        span: Span,
    ) -> CompileResult<()> {
        if params.len() > u8::MAX as usize {
            return Err(CompileError::too_many_operands("parameters", u8::MAX as usize, span));
        }
        let fresh = Compiler::new(function_type, name);
        let old = std::mem::replace(self, fresh);
        self.enclosing = Some(Box::new(old));

        self.chunk.arity = params.len() as u8;
        for param in params {
            let reg = self.alloc_register(span)?;
            self.add_local(param.name.clone(), reg, param.mutable);
        }
        Ok(())
    }

    /// Finish the current nested function, restore the enclosing compiler and
    /// return the index of the new prototype in its chunk.
    pub fn end_function(&mut self, span: Span) -> CompileResult<u16> {
        let Some(enclosing) = self.enclosing.take() else {
            return Err(CompileError::new("no enclosing function", span));
        };
        let inner = std::mem::replace(self, *enclosing);
        let chunk = inner.finish(span)?;

        let idx = self.chunk.prototypes.len();
        if idx > MAX_WIDE_INDEX {
            return Err(CompileError::TooManyPrototypes {
                function: self.chunk.name.clone(),
                span,
            });
        }
        self.chunk.prototypes.push(Rc::new(chunk));
        Ok(idx as u16)
    }

    /// Terminate the chunk with an implicit `return null` and check it.
    fn finish(mut self, span: Span) -> CompileResult<Chunk> {
        self.emit_abc(OpCode::ReturnNull, 0, 0, 0, span);
        if let Some(&offset) = self.pending_jumps.first() {
            return Err(CompileError::UnpatchedJump {
                function: self.chunk.name.clone(),
                offset,
            });
        }
        self.chunk.upvalues = self.upvalues.iter().map(|c| c.descriptor).collect();
        Ok(self.chunk)
    }

    // --- Loop context ---

    pub fn begin_loop(&mut self, continue_target: Option<usize>) {
        self.loops.push(LoopContext {
            continue_target,
            continue_patches: Vec::new(),
            break_patches: Vec::new(),
            body_register: self.next_register,
        });
    }

    /// Patch pending `continue` jumps to the current offset.
    pub fn patch_continues(&mut self, span: Span) -> CompileResult<()> {
        let patches = match self.loops.last_mut() {
            Some(ctx) => std::mem::take(&mut ctx.continue_patches),
            None => Vec::new(),
        };
        for at in patches {
            self.patch_jump(at, span)?;
        }
        Ok(())
    }

    /// Pop the innermost loop and patch its `break` jumps to the current offset.
    pub fn end_loop(&mut self, span: Span) -> CompileResult<()> {
        if let Some(ctx) = self.loops.pop() {
            for at in ctx.break_patches {
                self.patch_jump(at, span)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, Expr, Stmt};
    use pretty_assertions::assert_eq;

    fn sp(line: usize) -> Span {
        Span::at_line(line)
    }

    #[test]
    fn test_register_high_water_mark() {
        let mut c = Compiler::new(FunctionType::Script, "t");
        let a = c.alloc_register(sp(1)).unwrap();
        let b = c.alloc_register(sp(1)).unwrap();
        c.free_to(a as usize);
        let again = c.alloc_register(sp(1)).unwrap();
        assert_eq!((a, b, again), (0, 1, 0));
        assert_eq!(c.chunk.max_registers, 2);
    }

    #[test]
    fn test_register_exhaustion_is_compile_error() {
        let mut c = Compiler::new(FunctionType::Script, "t");
        for _ in 0..MAX_REGISTERS {
            c.alloc_register(sp(1)).unwrap();
        }
        assert!(matches!(
            c.alloc_register(sp(9)),
            Err(CompileError::TooManyRegisters { .. })
        ));
    }

    #[test]
    fn test_scope_pops_locals_and_registers() {
        let mut c = Compiler::new(FunctionType::Script, "t");
        let outer = c.alloc_register(sp(1)).unwrap();
        c.add_local("x", outer, false);
        c.begin_scope();
        let inner = c.alloc_register(sp(2)).unwrap();
        c.add_local("x", inner, true);
        assert_eq!(c.resolve_local("x"), Some(1));
        c.end_scope(sp(3));
        assert_eq!(c.resolve_local("x"), Some(0));
        assert_eq!(c.next_register, 1);
        assert!(c.chunk.is_empty(), "no captured locals, no Close");
    }

    #[test]
    fn test_unpatched_jump_refuses_to_finish() {
        let mut c = Compiler::new(FunctionType::Script, "t");
        c.emit_jump(OpCode::Jump, 0, sp(1));
        assert!(matches!(
            c.finish(sp(1)),
            Err(CompileError::UnpatchedJump { offset: 0, .. })
        ));
    }

    #[test]
    fn test_jump_offsets_are_relative_to_next_instruction() {
        let mut c = Compiler::new(FunctionType::Script, "t");
        let jump = c.emit_jump(OpCode::JumpIfFalse, 0, sp(1));
        c.emit_abc(OpCode::LoadNull, 0, 0, 0, sp(1));
        c.emit_abc(OpCode::LoadNull, 1, 0, 0, sp(1));
        c.patch_jump(jump, sp(1)).unwrap();
        assert_eq!(c.chunk.code[jump].sbx(), 2);

        c.emit_loop(0, sp(2)).unwrap();
        let back = c.chunk.len() - 1;
        assert_eq!(c.chunk.jump_target(back), Some(0));
    }

    #[test]
    fn test_small_ints_are_immediates() {
        let mut c = Compiler::new(FunctionType::Script, "t");
        c.emit_load_int(0, 42, sp(1)).unwrap();
        c.emit_load_int(0, 1 << 20, sp(1)).unwrap();
        c.emit_load_int(0, 1 << 20, sp(1)).unwrap();
        assert_eq!(c.chunk.count_op(OpCode::LoadInt), 1);
        assert_eq!(c.chunk.count_op(OpCode::LoadConst), 2);
        assert_eq!(c.chunk.constants, vec![Constant::Int(1 << 20)]);
    }

    #[test]
    fn test_compile_returns_trailing_expression() {
        let program = Program::new(vec![Stmt::expr(Expr::binary(
            Expr::int(1, sp(1)),
            BinaryOp::Add,
            Expr::int(2, sp(1)),
            sp(1),
        ))]);
        let module = Compiler::compile(&program).unwrap();
        assert_eq!(module.main.count_op(OpCode::Return), 1);
        assert_eq!(module.main.count_op(OpCode::Add), 1);
    }
}
