use super::{Diagnostic, Severity, locate};

pub fn render(d: &Diagnostic) -> String {
    let severity = match d.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
    };

    let labels: Vec<serde_json::Value> = d.labels.iter().map(|l| {
        let mut obj = serde_json::json!({
            "start": l.span.start,
            "end": l.span.end,
            "message": l.message,
            "primary": l.is_primary,
        });
        if let Some(source) = d.source.as_deref() {
            let (line, col, _) = locate(source, l.span.start);
            obj["line"] = serde_json::Value::from(line);
            obj["col"] = serde_json::Value::from(col);
        } else if l.span.line > 0 {
            obj["line"] = serde_json::Value::from(l.span.line);
        }
        obj
    }).collect();

    let mut obj = serde_json::json!({
        "severity": severity,
        "message": d.message,
        "labels": labels,
        "notes": d.notes,
    });

    if let Some(code) = d.code {
        obj["code"] = serde_json::Value::String(code.to_string());
    }

    if let Some(s) = &d.suggestion {
        obj["suggestion"] = serde_json::Value::String(s.clone());
    }

    serde_json::to_string(&obj).unwrap_or_else(|_| r#"{"severity":"error","message":"internal error serializing diagnostic"}"#.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;
    use crate::ast::Span;

    fn parse_json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn render_basic_error() {
        let v = parse_json(&render(&Diagnostic::error("type mismatch")));
        assert_eq!(v["severity"], "error");
        assert_eq!(v["message"], "type mismatch");
        assert!(v["labels"].as_array().unwrap().is_empty());
        assert!(v.get("code").is_none());
        assert!(v.get("suggestion").is_none());
    }

    #[test]
    fn render_compile_error() {
        let e = assemble("pass\n:a\n:a").unwrap_err();
        let d = Diagnostic::from(&e).with_source("pass\n:a\n:a");
        let v = parse_json(&render(&d));
        assert_eq!(v["code"], "QX-C001");
        assert_eq!(v["labels"][0]["line"], 3);
        assert_eq!(v["labels"][0]["col"], 1);
        assert!(v["suggestion"].is_string());
    }

    #[test]
    fn render_label_without_source_keeps_line() {
        let d = Diagnostic::error("bad").with_span(Span { start: 5, end: 8, line: 4 }, "here");
        let v = parse_json(&render(&d));
        assert_eq!(v["labels"][0]["line"], 4);
        assert!(v["labels"][0].get("col").is_none());
    }

    #[test]
    fn render_notes_and_warning() {
        let d = Diagnostic::warning("partial").with_note("one").with_note("two");
        let v = parse_json(&render(&d));
        assert_eq!(v["severity"], "warning");
        assert_eq!(v["notes"].as_array().unwrap().len(), 2);
    }
}
