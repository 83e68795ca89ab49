//! Instruction set: the opcode catalog and the fixed-width 32-bit encoding.
//!
//! Every instruction is one `u32` in one of three formats:
//!
//! ```text
//!   ABC   | op:8 | A:8 | B:8 | C:8 |
//!   ABx   | op:8 | A:8 |   Bx:16   |   unsigned wide operand
//!   AsBx  | op:8 | A:8 |  sBx:16   |   signed wide operand
//! ```
//!
//! Jump offsets are relative to the instruction immediately following the jump.

use std::fmt;

/// Operand layout of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Abc,
    ABx,
    AsBx,
}

/// Opcodes for the register VM. `R[x]` is register `x` of the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // ============ Loads ============
    /// R[A] = K[Bx]
    LoadConst = 0,
    /// R[A] = sBx as an integer
    LoadInt,
    /// R[A] = null
    LoadNull,
    /// R[A] = true
    LoadTrue,
    /// R[A] = false
    LoadFalse,
    /// R[A] = R[B]
    Move,

    // ============ Arithmetic ============
    /// R[A] = R[B] + R[C]
    Add,
    /// R[A] = R[B] - R[C]
    Sub,
    /// R[A] = R[B] * R[C]
    Mul,
    /// R[A] = R[B] / R[C]
    Div,
    /// R[A] = R[B] % R[C]
    Mod,
    /// R[A] = -R[B]
    Neg,

    // ============ Comparison ============
    /// R[A] = R[B] == R[C]
    Eq,
    /// R[A] = R[B] != R[C]
    NotEq,
    /// R[A] = R[B] < R[C]
    Lt,
    /// R[A] = R[B] <= R[C]
    LtEq,
    /// R[A] = R[B] > R[C]
    Gt,
    /// R[A] = R[B] >= R[C]
    GtEq,

    // ============ Boolean ============
    /// R[A] = !truthy(R[B])
    Not,
    /// R[A] = truthy(R[B])
    Truth,

    // ============ Variables ============
    /// R[A] = globals[K[Bx]]
    GetGlobal,
    /// globals[K[Bx]] = R[A]
    SetGlobal,
    /// R[A] = upvalue[B]
    GetUpvalue,
    /// upvalue[A] = R[B]
    SetUpvalue,

    // ============ Structures ============
    /// R[A] = [R[B], ..., R[B+C-1]]
    NewArray,
    /// R[A] = { R[B]: R[B+1], ... } with C key/value pairs
    NewMap,
    /// R[A] = R[B].K[C]
    GetField,
    /// R[A].K[B] = R[C]
    SetField,
    /// R[A] = R[B][R[C]]
    GetIndex,
    /// R[A][R[B]] = R[C]
    SetIndex,
    /// R[A] = length of R[B]
    Len,
    /// R[A] = display(R[B]) ++ display(R[C])
    Concat,
    /// R[A] = display(R[B]) ++ ... ++ display(R[B+C-1])
    Interpolate,

    // ============ Control flow ============
    /// ip += sBx
    Jump,
    /// if !truthy(R[A]) then ip += sBx
    JumpIfFalse,
    /// if truthy(R[A]) then ip += sBx
    JumpIfTrue,
    /// ip += sBx (always backward)
    Loop,

    // ============ Functions ============
    /// R[C] = R[A](R[A+1], ..., R[A+B])
    Call,
    /// return R[A]
    Return,
    /// return null
    ReturnNull,
    /// R[A] = closure(prototypes[Bx])
    Closure,

    // ============ Special forms ============
    /// R[A] = Ok(R[B])
    WrapOk,
    /// R[A] = Err(R[B])
    WrapErr,
    /// R[A] = R[B] is Ok (C = 0) or Err (C = 1)
    TestResult,
    /// R[A] = payload of the result in R[B]
    Unwrap,
    /// R[A] = payload if R[B] is Ok, otherwise return R[B] from this frame
    Try,
    /// run the closure in R[A] as a task
    Spawn,
    /// close captured cells for registers >= A
    Close,
}

impl OpCode {
    const LAST: OpCode = OpCode::Close;

    /// The single encoding format used by this opcode.
    pub fn format(self) -> Format {
        match self {
            OpCode::LoadConst | OpCode::GetGlobal | OpCode::SetGlobal | OpCode::Closure => {
                Format::ABx
            }
            OpCode::LoadInt
            | OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::JumpIfTrue
            | OpCode::Loop => Format::AsBx,
            _ => Format::Abc,
        }
    }

    /// True for instructions whose sBx operand is a jump offset.
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue | OpCode::Loop
        )
    }

    /// Convert from u8 to OpCode.
    pub fn from_u8(byte: u8) -> Option<OpCode> {
        if byte <= OpCode::LAST as u8 {
            // SAFETY: `OpCode` is `repr(u8)` with contiguous discriminants from 0 to `LAST`.
            Some(unsafe { std::mem::transmute::<u8, OpCode>(byte) })
        } else {
            None
        }
    }

    /// Upper-case mnemonic used by the disassembler.
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::LoadConst => "LOAD_CONST",
            OpCode::LoadInt => "LOAD_INT",
            OpCode::LoadNull => "LOAD_NULL",
            OpCode::LoadTrue => "LOAD_TRUE",
            OpCode::LoadFalse => "LOAD_FALSE",
            OpCode::Move => "MOVE",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Neg => "NEG",
            OpCode::Eq => "EQ",
            OpCode::NotEq => "NOT_EQ",
            OpCode::Lt => "LT",
            OpCode::LtEq => "LT_EQ",
            OpCode::Gt => "GT",
            OpCode::GtEq => "GT_EQ",
            OpCode::Not => "NOT",
            OpCode::Truth => "TRUTH",
            OpCode::GetGlobal => "GET_GLOBAL",
            OpCode::SetGlobal => "SET_GLOBAL",
            OpCode::GetUpvalue => "GET_UPVALUE",
            OpCode::SetUpvalue => "SET_UPVALUE",
            OpCode::NewArray => "NEW_ARRAY",
            OpCode::NewMap => "NEW_MAP",
            OpCode::GetField => "GET_FIELD",
            OpCode::SetField => "SET_FIELD",
            OpCode::GetIndex => "GET_INDEX",
            OpCode::SetIndex => "SET_INDEX",
            OpCode::Len => "LEN",
            OpCode::Concat => "CONCAT",
            OpCode::Interpolate => "INTERPOLATE",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::JumpIfTrue => "JUMP_IF_TRUE",
            OpCode::Loop => "LOOP",
            OpCode::Call => "CALL",
            OpCode::Return => "RETURN",
            OpCode::ReturnNull => "RETURN_NULL",
            OpCode::Closure => "CLOSURE",
            OpCode::WrapOk => "WRAP_OK",
            OpCode::WrapErr => "WRAP_ERR",
            OpCode::TestResult => "TEST_RESULT",
            OpCode::Unwrap => "UNWRAP",
            OpCode::Try => "TRY",
            OpCode::Spawn => "SPAWN",
            OpCode::Close => "CLOSE",
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

/// One encoded instruction word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction(pub u32);

impl Instruction {
    pub fn abc(op: OpCode, a: u8, b: u8, c: u8) -> Self {
        debug_assert_eq!(op.format(), Format::Abc, "{:?} is not an ABC opcode", op);
        Self((op as u32) << 24 | (a as u32) << 16 | (b as u32) << 8 | c as u32)
    }

    pub fn abx(op: OpCode, a: u8, bx: u16) -> Self {
        debug_assert_eq!(op.format(), Format::ABx, "{:?} is not an ABx opcode", op);
        Self((op as u32) << 24 | (a as u32) << 16 | bx as u32)
    }

    pub fn asbx(op: OpCode, a: u8, sbx: i16) -> Self {
        debug_assert_eq!(op.format(), Format::AsBx, "{:?} is not an AsBx opcode", op);
        Self((op as u32) << 24 | (a as u32) << 16 | (sbx as u16) as u32)
    }

    /// Raw opcode byte; decode with [`OpCode::from_u8`].
    #[inline]
    pub fn op_byte(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn opcode(self) -> Option<OpCode> {
        OpCode::from_u8(self.op_byte())
    }

    #[inline]
    pub fn a(self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[inline]
    pub fn b(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline]
    pub fn c(self) -> u8 {
        self.0 as u8
    }

    #[inline]
    pub fn bx(self) -> u16 {
        self.0 as u16
    }

    #[inline]
    pub fn sbx(self) -> i16 {
        self.0 as u16 as i16
    }

    /// Same instruction with its wide field replaced. Used for jump patching.
    pub fn with_sbx(self, sbx: i16) -> Self {
        Self((self.0 & 0xFFFF_0000) | (sbx as u16) as u32)
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Some(op) => match op.format() {
                Format::Abc => write!(
                    f,
                    "{} {} {} {}",
                    op.mnemonic(),
                    self.a(),
                    self.b(),
                    self.c()
                ),
                Format::ABx => write!(f, "{} {} {}", op.mnemonic(), self.a(), self.bx()),
                Format::AsBx => write!(f, "{} {} {}", op.mnemonic(), self.a(), self.sbx()),
            },
            None => write!(f, "<invalid {:#010x}>", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_opcode_roundtrip() {
        for i in 0..=OpCode::LAST as u8 {
            let op = OpCode::from_u8(i).expect("valid opcode");
            assert_eq!(i, op as u8);
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert!(OpCode::from_u8(OpCode::LAST as u8 + 1).is_none());
        assert!(OpCode::from_u8(255).is_none());
    }

    #[test]
    fn test_abc_fields() {
        let ins = Instruction::abc(OpCode::Add, 3, 200, 255);
        assert_eq!(ins.opcode(), Some(OpCode::Add));
        assert_eq!((ins.a(), ins.b(), ins.c()), (3, 200, 255));
    }

    #[test]
    fn test_wide_fields() {
        let ins = Instruction::abx(OpCode::LoadConst, 9, 65_535);
        assert_eq!(ins.a(), 9);
        assert_eq!(ins.bx(), 65_535);

        let back = Instruction::asbx(OpCode::Loop, 0, -300);
        assert_eq!(back.sbx(), -300);
        assert_eq!(back.opcode(), Some(OpCode::Loop));
    }

    #[test]
    fn test_patch_keeps_opcode_and_a() {
        let jump = Instruction::asbx(OpCode::JumpIfFalse, 7, 0).with_sbx(i16::MIN);
        assert_eq!(jump.opcode(), Some(OpCode::JumpIfFalse));
        assert_eq!(jump.a(), 7);
        assert_eq!(jump.sbx(), i16::MIN);
    }

    #[test]
    fn test_every_opcode_has_one_format() {
        let wide: Vec<OpCode> = (0..=OpCode::LAST as u8)
            .filter_map(OpCode::from_u8)
            .filter(|op| op.format() != Format::Abc)
            .collect();
        assert_eq!(
            wide,
            vec![
                OpCode::LoadConst,
                OpCode::LoadInt,
                OpCode::GetGlobal,
                OpCode::SetGlobal,
                OpCode::Jump,
                OpCode::JumpIfFalse,
                OpCode::JumpIfTrue,
                OpCode::Loop,
                OpCode::Closure,
            ]
        );
    }
}
