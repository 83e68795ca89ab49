//! Forge: the execution core of a small dynamically-typed scripting language.
//!
//! This is the library root that exports all modules.
//!
//! # Pipeline
//!
//! A parsed [`ast::Program`] is compiled in a single pass into register-based
//! bytecode ([`vm::Chunk`]), which the [`vm::Vm`] executes. Heap objects are
//! reclaimed by a mark-sweep collector rooted in the VM's registers, globals
//! and captured-variable cells.

// Allow some clippy lints that are stylistic and not critical
#![allow(clippy::module_inception)]
#![allow(clippy::result_large_err)]
#![allow(clippy::new_without_default)]
#![allow(clippy::unnecessary_cast)]
#![allow(clippy::too_many_arguments)]

pub mod ast;
pub mod error;
pub mod span;
pub mod vm;

use error::{CompileError, ForgeError};
use vm::{CompiledModule, Value, Vm};

/// Compile a program into its top-level chunk plus statistics.
pub fn compile(program: &ast::Program) -> Result<CompiledModule, CompileError> {
    vm::Compiler::compile(program)
}

/// Compile and run a program on `vm`, returning the value of its trailing expression.
pub fn run(vm: &mut Vm, program: &ast::Program) -> Result<Value, ForgeError> {
    let module = compile(program)?;
    Ok(vm.execute(&module.main)?)
}

/// Disassemble compiled bytecode to a string.
pub fn disassemble(module: &CompiledModule) -> String {
    vm::disassemble(&module.main)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::ast::BinaryOp;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_reports_compile_and_runtime_errors() {
        let mut vm = Vm::new();
        let bad = program(vec![brk()]);
        assert!(matches!(run(&mut vm, &bad), Err(ForgeError::Compile(_))));

        let faulty = program(vec![expr_stmt(binary(int(1), BinaryOp::Modulo, int(0)))]);
        assert!(matches!(run(&mut vm, &faulty), Err(ForgeError::Runtime(_))));

        let fine = program(vec![expr_stmt(binary(int(6), BinaryOp::Multiply, int(7)))]);
        assert_eq!(run(&mut vm, &fine).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_compiled_module_stats() {
        let module = compile(&program(vec![
            func("f", &["a"], vec![ret(lambda(&[], vec![ret(var("a"))]))]),
            expr_stmt(call("f", vec![string("s")])),
        ]))
        .unwrap();
        assert_eq!(module.stats.prototypes, 2);
        assert_eq!(module.stats, module.main.stats());
        let json = module.stats.to_json();
        assert!(json.contains("\"prototypes\":2"));
        assert!(disassemble(&module).contains("== f (arity=1, upvalues=0"));
    }
}
