use std::collections::BTreeMap;

use logos::Logos;

use crate::assembler::CompileError;
use crate::ast::Span;

/// One whitespace-separated token of an instruction line. Quote regions
/// (backtick, single, double) may start anywhere inside a token and keep
/// their delimiters; only double quotes honor backslash escapes.
#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r]+")]
enum Piece {
    #[regex(r#"([^ \t\r`'"]|`[^`]*`|'[^']*'|"([^"\\]|\\[^\x00])*")+"#, |lex| lex.slice().to_string())]
    Word(String),
}

/// A source line after comment stripping and literal joining.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalLine {
    pub text: String,
    pub span: Span,
}

#[derive(Debug, Clone, Default)]
pub struct SourceLines {
    pub lines: Vec<LogicalLine>,
    /// Label name → address of the next instruction line.
    pub labels: BTreeMap<String, usize>,
}

/// Physical lines with their byte offsets, `\r` stripped.
fn physical_lines(source: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut offset = 0;
    for raw in source.split('\n') {
        out.push((offset, raw.strip_suffix('\r').unwrap_or(raw)));
        offset += raw.len() + 1;
    }
    out
}

fn backticks(s: &str) -> usize {
    s.matches('`').count()
}

/// Split source into logical instruction lines and collect labels.
pub fn read_lines(source: &str) -> Result<SourceLines, CompileError> {
    let physical = physical_lines(source);
    let mut out = SourceLines::default();

    let mut i = 0;
    while i < physical.len() {
        let (start, raw) = physical[i];
        let trimmed = raw.trim();
        let span = Span { start, end: start + raw.len(), line: i + 1 };

        if trimmed.is_empty() || trimmed.starts_with("//") || trimmed.starts_with('#') {
            i += 1;
            continue;
        }

        if let Some(name) = trimmed.strip_prefix(':') {
            let name = name.trim().to_string();
            if out.labels.contains_key(&name) {
                return Err(CompileError::DuplicateLabel { name, span });
            }
            out.labels.insert(name, out.lines.len());
            i += 1;
            continue;
        }

        // An odd backtick count opens a literal that continues on later lines.
        let mut text = raw.to_string();
        let mut end = span.end;
        let mut ticks = backticks(raw);
        while ticks % 2 != 0 {
            i += 1;
            let Some(&(next_start, next)) = physical.get(i) else {
                return Err(CompileError::UnterminatedLiteral { span: Span { end, ..span } });
            };
            text.push('\n');
            text.push_str(next);
            ticks += backticks(next);
            end = next_start + next.len();
        }

        out.lines.push(LogicalLine {
            text: text.trim().to_string(),
            span: Span { end, ..span },
        });
        i += 1;
    }

    Ok(out)
}

/// Split one logical line into tokens.
pub fn tokenize(line: &LogicalLine) -> Result<Vec<String>, CompileError> {
    let mut lexer = Piece::lexer(&line.text);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        match result {
            Ok(Piece::Word(word)) => tokens.push(word),
            Err(()) => {
                return Err(CompileError::UnclosedQuote {
                    snippet: line.text[lexer.span().start..].to_string(),
                    span: line.span,
                });
            }
        }
    }

    Ok(tokens)
}
