//! Bytecode disassembler for debug output.

use std::fmt::Write;

use super::chunk::{Chunk, Constant};
use super::opcode::{Format, Instruction, OpCode};

/// Disassemble a chunk and, after it, every nested prototype.
pub fn disassemble(chunk: &Chunk) -> String {
    let mut out = String::new();
    disassemble_into(chunk, &mut out);
    out
}

fn disassemble_into(chunk: &Chunk, out: &mut String) {
    let _ = writeln!(
        out,
        "== {} (arity={}, upvalues={}, registers={}) ==",
        chunk.name,
        chunk.arity,
        chunk.upvalue_count(),
        chunk.max_registers
    );
    for (offset, ins) in chunk.code.iter().enumerate() {
        let line = chunk.line_at(offset);
        let line_str = if offset > 0 && chunk.line_at(offset - 1) == line {
            "   |".to_string()
        } else {
            format!("{:4}", line)
        };
        let _ = write!(out, "{:04} {} ", offset, line_str);
        disassemble_instruction(*ins, offset, chunk, out);
        out.push('\n');
    }

    for nested in &chunk.prototypes {
        out.push('\n');
        disassemble_into(nested, out);
    }
}

fn disassemble_instruction(ins: Instruction, offset: usize, chunk: &Chunk, out: &mut String) {
    let Some(op) = ins.opcode() else {
        let _ = write!(out, "UNKNOWN({})", ins.op_byte());
        return;
    };
    let _ = match op.format() {
        Format::Abc => write!(
            out,
            "{:<14} {:>3} {:>3} {:>3}",
            op.mnemonic(),
            ins.a(),
            ins.b(),
            ins.c()
        ),
        Format::ABx => write!(out, "{:<14} {:>3} {:>5}", op.mnemonic(), ins.a(), ins.bx()),
        Format::AsBx => write!(out, "{:<14} {:>3} {:>5}", op.mnemonic(), ins.a(), ins.sbx()),
    };

    match op {
        OpCode::LoadConst | OpCode::GetGlobal | OpCode::SetGlobal => {
            let _ = write!(out, " ({})", format_constant(chunk.constants.get(ins.bx() as usize)));
        }
        OpCode::GetField => {
            let _ = write!(out, " ({})", format_constant(chunk.constants.get(ins.c() as usize)));
        }
        OpCode::SetField => {
            let _ = write!(out, " ({})", format_constant(chunk.constants.get(ins.b() as usize)));
        }
        OpCode::Closure => {
            let name = chunk
                .prototypes
                .get(ins.bx() as usize)
                .map_or("?", |p| p.name.as_str());
            let _ = write!(out, " (<fn {}>)", name);
        }
        _ if op.is_jump() => {
            if let Some(target) = chunk.jump_target(offset) {
                let _ = write!(out, " -> {:04}", target);
            }
        }
        _ => {}
    }
}

fn format_constant(constant: Option<&Constant>) -> String {
    match constant {
        Some(Constant::Int(n)) => n.to_string(),
        Some(Constant::Float(n)) => format!("{:?}", n),
        Some(Constant::String(s)) => format!("\"{}\"", s),
        None => "???".to_string(),
    }
}
