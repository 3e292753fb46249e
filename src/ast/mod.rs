use serde::Serialize;

use crate::value::Value;

pub type Opcode = u64;

// ---- Span infrastructure ----

/// Byte range within source text, plus the 1-based line it starts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0, line: 0 };
}

// ---- Operands ----

/// How an instruction reads or writes one value. Exactly one kind is active.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Constant(Value),
    /// `$N`: slot N of the innermost call frame.
    Local(usize),
    /// `$tmp`: the current frame's scratch value.
    Temp,
    StackPush,
    StackPop,
    StackPeek,
    /// `$drop` / `_`
    Discard,
    Debug,
    /// `$pln`: writes print a line.
    Print,
    /// `$seq`
    Sequence,
    /// `$clip`
    Clipboard,
    /// A label that was not defined when the operand was parsed.
    Label(String),
    /// A label resolved at parse time.
    Address(usize),
    /// `:+N` / `:-N`, relative to the instruction pointer at read time.
    Relative(i64),
    Element {
        base: Box<Operand>,
        index: Box<Operand>,
        default: Option<Box<Operand>>,
    },
    Slice {
        base: Box<Operand>,
        start: Box<Operand>,
        end: Box<Operand>,
    },
    MapEntry {
        base: Box<Operand>,
        key: Box<Operand>,
    },
    /// `@expr` / `@@expr`. Stored, never evaluated.
    Deferred { flexible: bool, text: String },
}

impl Operand {
    pub fn text(s: impl Into<String>) -> Operand {
        Operand::Constant(Value::Str(s.into()))
    }
}

// ---- Instructions ----

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: Vec<Operand>) -> Self {
        Instruction { opcode, operands }
    }

    pub fn arity(&self) -> usize {
        self.operands.len()
    }
}

/// Dense stack-machine form produced by the lowering pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoweredOp {
    /// Push `constants[idx]`.
    PushConst(usize),
    PushLocal(usize),
    StoreLocal(usize),
    AddInt,
}
