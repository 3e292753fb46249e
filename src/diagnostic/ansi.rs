use super::{Diagnostic, Severity, locate};

pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn bold(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold_red(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1;31m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold_yellow(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1;33m{s}\x1b[0m") } else { s.to_string() }
    }

    fn cyan(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[36m{s}\x1b[0m") } else { s.to_string() }
    }

    fn dim(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[2m{s}\x1b[0m") } else { s.to_string() }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        // "error[QX-C004]: message"
        let severity = match d.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        let heading = match d.code {
            Some(code) => format!("{severity}[{code}]"),
            None => severity.to_string(),
        };
        let heading = match d.severity {
            Severity::Error => self.bold_red(&heading),
            Severity::Warning => self.bold_yellow(&heading),
        };
        out.push_str(&format!("{}: {}\n", heading, self.bold(&d.message)));

        let primary = d.labels.iter().find(|l| l.is_primary);
        if let (Some(label), Some(source)) = (primary, &d.source) {
            let (line, col, line_text) = locate(source, label.span.start);

            out.push_str(&format!("  {} line {}:{}\n", self.cyan("-->"), line, col));

            let gutter = line.to_string().len();
            let pipe = self.cyan("|");
            let pad = " ".repeat(gutter);

            out.push_str(&format!("{pad} {pipe}\n"));
            let line_num = self.cyan(&format!("{line:>gutter$}"));
            out.push_str(&format!("{line_num} {pipe} {line_text}\n"));

            // carets stop at the end of the first line of a multi-line span
            let indent = col.saturating_sub(1);
            let room = line_text.chars().count().saturating_sub(indent);
            let span_len = label.span.end.saturating_sub(label.span.start).min(room).max(1);
            let carets = self.bold_red(&"^".repeat(span_len));
            let indent = " ".repeat(indent);
            if label.message.is_empty() {
                out.push_str(&format!("{pad} {pipe} {indent}{carets}\n"));
            } else {
                out.push_str(&format!("{pad} {pipe} {indent}{carets} {}\n", self.bold_red(&label.message)));
            }
            out.push_str(&format!("{pad} {pipe}\n"));
        }

        for note in &d.notes {
            out.push_str(&format!("  {} note: {}\n", self.dim("="), note));
        }

        if let Some(suggestion) = &d.suggestion {
            out.push_str(&format!("  {} suggestion: {}\n", self.dim("="), suggestion));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    const SOURCE: &str = "= $1 #i10\n+i $3 $1 $2\npln $3";

    fn make_diag() -> Diagnostic {
        Diagnostic::error("type mismatch")
            .with_code("QX-R004")
            .with_span(Span { start: 10, end: 21, line: 2 }, "here")
            .with_source(SOURCE)
            .with_note("instruction 1")
            .with_suggestion("use int operands")
    }

    #[test]
    fn render_heading_with_code() {
        let out = AnsiRenderer { use_color: false }.render(&make_diag());
        assert!(out.starts_with("error[QX-R004]: type mismatch"), "{out}");
    }

    #[test]
    fn render_points_at_source_line() {
        let out = AnsiRenderer { use_color: false }.render(&make_diag());
        assert!(out.contains("--> line 2:1"), "{out}");
        assert!(out.contains("2 | +i $3 $1 $2"), "{out}");
        assert!(out.contains(&"^".repeat(11)), "{out}");
    }

    #[test]
    fn render_notes_and_suggestion() {
        let out = AnsiRenderer { use_color: false }.render(&make_diag());
        assert!(out.contains("note: instruction 1"), "{out}");
        assert!(out.contains("suggestion: use int operands"), "{out}");
    }

    #[test]
    fn render_without_source() {
        let out = AnsiRenderer { use_color: false }.render(&Diagnostic::error("something bad"));
        assert!(out.contains("error: something bad"));
        assert!(!out.contains("-->"));
    }

    #[test]
    fn carets_clamped_to_line() {
        let d = Diagnostic::error("unterminated")
            .with_span(Span { start: 4, end: 30, line: 1 }, "")
            .with_source("pln `abc\ndef`");
        let out = AnsiRenderer { use_color: false }.render(&d);
        assert!(out.contains("    ^^^^\n"), "{out}");
        assert!(!out.contains("^^^^^"), "{out}");
    }

    #[test]
    fn color_toggle() {
        let colored = AnsiRenderer { use_color: true }.render(&make_diag());
        let plain = AnsiRenderer { use_color: false }.render(&make_diag());
        assert!(colored.contains("\x1b["));
        assert!(!plain.contains("\x1b["));
        assert!(AnsiRenderer { use_color: false }.render(&Diagnostic::warning("w")).starts_with("warning: w"));
    }
}
