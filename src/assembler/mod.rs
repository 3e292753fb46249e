use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::ast::{Instruction, LoweredOp, Opcode, Operand, Span};
use crate::lexer;
use crate::parser;
use crate::value::Value;

// ── Opcodes ──────────────────────────────────────────────────────────
//
// The numeric values are part of the language surface: scripts and tools
// may depend on them, so entries are only ever added.

pub const OP_INVALID: Opcode = 12;
pub const OP_VERSION: Opcode = 100;
pub const OP_PASS: Opcode = 101;
pub const OP_TEST_BY_TEXT: Opcode = 122;
pub const OP_GOTO: Opcode = 180;
pub const OP_ON_ERROR: Opcode = 190;
pub const OP_DEFER: Opcode = 195;
pub const OP_EXIT: Opcode = 199;
pub const OP_PUSH: Opcode = 220;
pub const OP_PEEK: Opcode = 222;
pub const OP_POP: Opcode = 224;
pub const OP_ASSIGN: Opcode = 401;
pub const OP_IF: Opcode = 610;
pub const OP_LT: Opcode = 703;
pub const OP_CALL: Opcode = 1010;
pub const OP_RET: Opcode = 1020;
pub const OP_GET_ITEM: Opcode = 1123;
pub const OP_NOW: Opcode = 1910;
pub const OP_PLN: Opcode = 10410;
pub const OP_PLO: Opcode = 10411;
pub const OP_SLEEP: Opcode = 20501;
pub const OP_GET_CLIP: Opcode = 20511;
pub const OP_SET_CLIP: Opcode = 20512;
pub const OP_GET_ENV: Opcode = 20521;
pub const OP_SET_ENV: Opcode = 20522;
pub const OP_REMOVE_ENV: Opcode = 20523;
pub const OP_GET_ARGS: Opcode = 20530;
pub const OP_GET_INPUT: Opcode = 20540;
pub const OP_SYSTEM_CMD: Opcode = 20601;
pub const OP_INC_INT: Opcode = 9999900011;
pub const OP_DEC_INT: Opcode = 9999900015;
pub const OP_ADD_INT: Opcode = 9999900101;
pub const OP_SUB_TIME: Opcode = 9999900701;

/// Mnemonic → opcode. Aliases share an opcode; the first entry for an
/// opcode is its canonical name.
pub static MNEMONICS: &[(&str, Opcode)] = &[
    ("invalidInstr", OP_INVALID),
    ("version", OP_VERSION),
    ("pass", OP_PASS),
    ("testByText", OP_TEST_BY_TEXT),
    ("goto", OP_GOTO),
    ("onError", OP_ON_ERROR),
    ("defer", OP_DEFER),
    ("exit", OP_EXIT),
    ("push", OP_PUSH),
    ("peek", OP_PEEK),
    ("pop", OP_POP),
    ("=", OP_ASSIGN),
    ("if", OP_IF),
    ("<", OP_LT),
    ("call", OP_CALL),
    ("ret", OP_RET),
    ("getArrayItem", OP_GET_ITEM),
    ("[]", OP_GET_ITEM),
    ("now", OP_NOW),
    ("pln", OP_PLN),
    ("plo", OP_PLO),
    ("sleep", OP_SLEEP),
    ("getClipText", OP_GET_CLIP),
    ("setClipText", OP_SET_CLIP),
    ("getEnv", OP_GET_ENV),
    ("setEnv", OP_SET_ENV),
    ("removeEnv", OP_REMOVE_ENV),
    ("getArgs", OP_GET_ARGS),
    ("getInput", OP_GET_INPUT),
    ("systemCmd", OP_SYSTEM_CMD),
    ("++i", OP_INC_INT),
    ("--i", OP_DEC_INT),
    ("+i", OP_ADD_INT),
    ("-t", OP_SUB_TIME),
];

pub fn opcode_for(mnemonic: &str) -> Option<Opcode> {
    MNEMONICS.iter().find(|(m, _)| *m == mnemonic).map(|(_, op)| *op)
}

pub fn mnemonic_for(opcode: Opcode) -> Option<&'static str> {
    MNEMONICS.iter().find(|(_, op)| *op == opcode).map(|(m, _)| *m)
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("duplicate label ':{name}' ({span})")]
    DuplicateLabel { name: String, span: Span },
    #[error("unterminated backtick literal ({span})")]
    UnterminatedLiteral { span: Span },
    #[error("unclosed quote in '{snippet}' ({span})")]
    UnclosedQuote { snippet: String, span: Span },
    #[error("unknown instruction '{mnemonic}' ({span})")]
    UnknownInstruction { mnemonic: String, span: Span },
}

impl CompileError {
    pub fn span(&self) -> Span {
        match self {
            CompileError::DuplicateLabel { span, .. }
            | CompileError::UnterminatedLiteral { span }
            | CompileError::UnclosedQuote { span, .. }
            | CompileError::UnknownInstruction { span, .. } => *span,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CompileError::DuplicateLabel { .. } => "QX-C001",
            CompileError::UnterminatedLiteral { .. } => "QX-C002",
            CompileError::UnclosedQuote { .. } => "QX-C003",
            CompileError::UnknownInstruction { .. } => "QX-C004",
        }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}", self.line)
    }
}

// ── Compiled program ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompiledProgram {
    pub labels: BTreeMap<String, usize>,
    pub instructions: Vec<Instruction>,
    /// Present once `lower` has run.
    pub lowered: Option<Vec<LoweredOp>>,
    /// Constant pool; only lowered code refers to it.
    pub constants: Vec<Value>,
    /// Addresses the lowering pass could not rewrite.
    pub skipped: Vec<usize>,
    #[serde(skip)]
    pub spans: Vec<Span>,
    #[serde(skip)]
    pub source: String,
}

impl CompiledProgram {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn label(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    pub fn span_of(&self, address: usize) -> Span {
        self.spans.get(address).copied().unwrap_or(Span::UNKNOWN)
    }

    pub(crate) fn add_const(&mut self, val: Value) -> usize {
        let idx = self.constants.len();
        self.constants.push(val);
        idx
    }
}

// ── Assembler ────────────────────────────────────────────────────────

/// Compile source text. Any error aborts the whole compilation.
pub fn assemble(source: &str) -> Result<CompiledProgram, CompileError> {
    let read = lexer::read_lines(source)?;
    let mut instructions = Vec::with_capacity(read.lines.len());
    let mut spans = Vec::with_capacity(read.lines.len());

    for line in &read.lines {
        let tokens = lexer::tokenize(line)?;
        let unknown = |mnemonic: &str| CompileError::UnknownInstruction {
            mnemonic: mnemonic.to_string(),
            span: line.span,
        };

        let (mnemonic, rest) = tokens.split_first().ok_or_else(|| unknown(""))?;
        let opcode = opcode_for(mnemonic).ok_or_else(|| unknown(mnemonic))?;

        let operands = if opcode == OP_DEFER {
            // `defer <mnemonic> operands...`: the target is kept as text and
            // must itself be a known instruction.
            let (target, args) = rest.split_first().ok_or_else(|| unknown("defer"))?;
            if opcode_for(target).is_none_or(|op| op == OP_DEFER) {
                return Err(unknown(target));
            }
            std::iter::once(Operand::text(target.as_str()))
                .chain(args.iter().map(|t| parser::parse_operand(t, &read.labels)))
                .collect()
        } else {
            rest.iter().map(|t| parser::parse_operand(t, &read.labels)).collect()
        };

        instructions.push(Instruction::new(opcode, operands));
        spans.push(line.span);
    }

    debug!(instructions = instructions.len(), labels = read.labels.len(), "assembled program");

    Ok(CompiledProgram {
        labels: read.labels,
        instructions,
        lowered: None,
        constants: Vec::new(),
        skipped: Vec::new(),
        spans,
        source: source.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonic_table_unique_names() {
        let mut names: Vec<&str> = MNEMONICS.iter().map(|(m, _)| *m).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(names.len(), before, "duplicate mnemonic in table");
    }

    #[test]
    fn aliases_share_opcode() {
        assert_eq!(opcode_for("[]"), opcode_for("getArrayItem"));
        assert_eq!(mnemonic_for(OP_GET_ITEM), Some("getArrayItem"));
        assert_eq!(opcode_for("+i"), Some(9999900101));
    }

    #[test]
    fn assemble_arithmetic_program() {
        let prog = assemble("= $1 #i10\n= $2 #i20\n+i $3 $1 $2\npln $3").unwrap();
        assert_eq!(prog.len(), 4);
        assert_eq!(prog.instructions[2].opcode, OP_ADD_INT);
        assert_eq!(prog.instructions[2].arity(), 3);
        assert_eq!(prog.instructions[0].operands[1], Operand::Constant(Value::Int(10)));
        assert_eq!(prog.span_of(3).line, 4);
    }

    #[test]
    fn labels_resolve_forward_and_backward() {
        let src = "goto :end\n:back\npass\n:end\ngoto :back";
        let prog = assemble(src).unwrap();
        assert_eq!(prog.instructions[0].operands[0], Operand::Address(2));
        assert_eq!(prog.instructions[2].operands[0], Operand::Address(1));
    }

    #[test]
    fn undefined_label_kept_unresolved() {
        let prog = assemble("if #btrue :nowhere").unwrap();
        assert_eq!(prog.instructions[0].operands[1], Operand::Label("nowhere".into()));
    }

    #[test]
    fn unknown_instruction_aborts() {
        let err = assemble("pass\nfrobnicate $1\npass").unwrap_err();
        assert_eq!(
            err,
            CompileError::UnknownInstruction { mnemonic: "frobnicate".into(), span: err.span() }
        );
        assert_eq!(err.span().line, 2);
        assert_eq!(err.code(), "QX-C004");
    }

    #[test]
    fn duplicate_label_in_any_position() {
        for src in [":a\n:a\npass", ":a\npass\n:a", "pass\n:a\npass\npass\n:a\npass"] {
            let err = assemble(src).unwrap_err();
            assert!(matches!(err, CompileError::DuplicateLabel { .. }), "{src:?}");
        }
    }

    #[test]
    fn unterminated_literal_fails_compile() {
        let err = assemble("pln `never closed\npass").unwrap_err();
        assert!(matches!(err, CompileError::UnterminatedLiteral { .. }));
    }

    #[test]
    fn unclosed_quote_fails_compile() {
        let err = assemble("pln 'oops").unwrap_err();
        assert!(matches!(err, CompileError::UnclosedQuote { .. }));
    }

    #[test]
    fn defer_target_validated() {
        let prog = assemble("defer pln \"bye\"").unwrap();
        assert_eq!(prog.instructions[0].operands[0], Operand::text("pln"));
        assert_eq!(prog.instructions[0].operands[1], Operand::text("bye"));

        let err = assemble("defer nothing $1").unwrap_err();
        assert!(matches!(err, CompileError::UnknownInstruction { ref mnemonic, .. } if mnemonic == "nothing"));
        assert!(assemble("defer").is_err());
    }

    #[test]
    fn empty_source_is_empty_program() {
        let prog = assemble("// only a comment\n").unwrap();
        assert!(prog.is_empty());
    }
}
