pub mod ansi;
pub mod json;
pub mod registry;

use crate::assembler::{CompileError, CompiledProgram};
use crate::ast::Span;
use crate::vm::{RunError, VmError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<&'static str>,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Diagnostic::error(message) }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: true });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Runtime error located at its instruction's source line.
    pub fn runtime(err: &RunError, program: &CompiledProgram) -> Self {
        let mut d = Diagnostic::from(err);
        if let Some(addr) = err.address {
            let span = program.span_of(addr);
            if span != Span::UNKNOWN {
                d = d.with_span(span, "raised here").with_source(program.source.clone());
            }
        }
        d
    }
}

/// 1-based line and column of a byte offset, plus the text of that line.
pub fn locate(source: &str, offset: usize) -> (usize, usize, &str) {
    let offset = offset.min(source.len());
    let line_start = source[..offset].rfind('\n').map_or(0, |i| i + 1);
    let line_end = source[offset..].find('\n').map_or(source.len(), |i| offset + i);
    let line = source[..line_start].matches('\n').count() + 1;
    let col = source[line_start..offset].chars().count() + 1;
    (line, col, source[line_start..line_end].trim_end_matches('\r'))
}

// ---- From impls for error types ----

impl From<&CompileError> for Diagnostic {
    fn from(e: &CompileError) -> Self {
        let d = Diagnostic::error(e.to_string())
            .with_code(e.code())
            .with_span(e.span(), "here");
        match e {
            CompileError::DuplicateLabel { .. } => {
                d.with_suggestion("rename one of the labels; each label may be defined once")
            }
            CompileError::UnterminatedLiteral { .. } => d.with_note("a backtick literal runs until the next backtick"),
            CompileError::UnknownInstruction { mnemonic, .. } if mnemonic.is_empty() => d,
            CompileError::UnknownInstruction { .. } => {
                d.with_suggestion("run `qxlang --explain QX-C004` for the list of instructions")
            }
            CompileError::UnclosedQuote { .. } => d,
        }
    }
}

impl From<&VmError> for Diagnostic {
    fn from(e: &VmError) -> Self {
        let d = Diagnostic::error(e.to_string()).with_code(e.code());
        match e {
            VmError::IndexOutOfRange { .. } => d.with_suggestion("pass a default operand to fall back instead of failing"),
            VmError::UnresolvedLabel(name) => d.with_note(format!("no line defines ':{}'", name)),
            VmError::PartialLowering { .. } => d.with_suggestion("run without --lowered"),
            _ => d,
        }
    }
}

impl From<&RunError> for Diagnostic {
    fn from(e: &RunError) -> Self {
        let mut d = Diagnostic::from(&e.error)
            .with_note(format!("at [{}](qxlang)", e.timestamp.format("%Y-%m-%d %H:%M:%S")));
        if let Some(addr) = e.address {
            d = d.with_note(format!("instruction {}", addr));
        }
        d
    }
}
