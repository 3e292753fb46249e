use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};
use regex::Regex;

use crate::ast::Operand;
use crate::value::Value;

use super::unquote;

static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+$").expect("valid regex"));

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M",
];

const ZONED_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f %z", "%Y-%m-%d %H:%M:%S%.f %:z"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d"];

/// Decode a `#<tag><payload>` token. Anything malformed becomes the whole
/// token as a string constant.
pub fn parse_typed(token: &str, rest: &str) -> Operand {
    let mut chars = rest.chars();
    let Some(tag) = chars.next() else {
        return Operand::text(token);
    };
    let payload = chars.as_str();

    let value = match tag {
        'i' => payload.trim().parse::<i64>().ok().map(Value::Int),
        'f' => payload.trim().parse::<f64>().ok().map(Value::Float),
        'b' => parse_bool(payload.trim()).map(Value::Bool),
        'y' => payload.trim().parse::<u8>().ok().map(Value::Byte),
        'x' => parse_hex_byte(payload.trim()).map(Value::Byte),
        'B' => payload.chars().next().map(Value::Rune),
        'r' => parse_rune(payload),
        's' => strip_wrapping(payload).map(Value::Str),
        'e' => strip_wrapping(payload).map(Value::Error),
        't' => strip_wrapping(payload).and_then(|s| {
            let s = s.trim();
            if s.is_empty() || s == "now" {
                Some(Value::Time(Local::now()))
            } else {
                parse_time(s).map(Value::Time)
            }
        }),
        'J' => strip_wrapping(payload)
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            .map(Value::from_json),
        'L' => strip_wrapping(payload)
            .and_then(|s| serde_json::from_str::<Vec<serde_json::Value>>(&s).ok())
            .map(|items| Value::List(items.into_iter().map(Value::from_json).collect())),
        'Y' => strip_wrapping(payload)
            .and_then(|s| serde_json::from_str::<Vec<u8>>(&s).ok())
            .map(Value::Bytes),
        'R' => strip_wrapping(payload)
            .and_then(|s| serde_json::from_str::<Vec<u32>>(&s).ok())
            .and_then(|codes| codes.into_iter().map(char::from_u32).collect::<Option<Vec<_>>>())
            .map(|chars| Value::List(chars.into_iter().map(Value::Rune).collect())),
        'S' => strip_wrapping(payload)
            .and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
            .map(|items| Value::List(items.into_iter().map(Value::Str).collect())),
        'M' => strip_wrapping(payload)
            .and_then(|s| serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&s).ok())
            .map(|fields| Value::Map(fields.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())),
        _ => None,
    };

    match value {
        Some(v) => Operand::Constant(v),
        None => Operand::text(token),
    }
}

/// Strip one layer of backtick, single or double quotes. Double quotes are
/// unescaped; `None` if that fails.
pub fn strip_wrapping(s: &str) -> Option<String> {
    if s.len() >= 2 {
        if (s.starts_with('`') && s.ends_with('`')) || (s.starts_with('\'') && s.ends_with('\'')) {
            return Some(s[1..s.len() - 1].to_string());
        }
        if s.starts_with('"') && s.ends_with('"') {
            return unquote(s);
        }
    }
    Some(s.to_string())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Some(true),
        "false" | "0" | "no" | "n" | "off" | "" => Some(false),
        _ => None,
    }
}

fn parse_hex_byte(s: &str) -> Option<u8> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u8::from_str_radix(digits, 16).ok()
}

fn parse_rune(s: &str) -> Option<Value> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(Value::Rune(c)),
        _ => s.trim().parse::<u32>().ok().and_then(char::from_u32).map(Value::Rune),
    }
}

fn local(naive: NaiveDateTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(&naive).earliest()
}

/// Flexible date parser behind `#t`.
pub fn parse_time(s: &str) -> Option<DateTime<Local>> {
    let s = s.trim();

    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Local));
    }
    if let Ok(t) = DateTime::parse_from_rfc2822(s) {
        return Some(t.with_timezone(&Local));
    }

    if DIGITS.is_match(s) {
        return match s.len() {
            14 => NaiveDateTime::parse_from_str(s, "%Y%m%d%H%M%S").ok().and_then(local),
            8 => NaiveDate::parse_from_str(s, "%Y%m%d").ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .and_then(local),
            13 => s.parse::<i64>().ok()
                .and_then(|ms| Local.timestamp_millis_opt(ms).single()),
            _ => s.parse::<i64>().ok()
                .and_then(|secs| Local.timestamp_opt(secs, 0).single()),
        };
    }

    for fmt in ZONED_FORMATS {
        if let Ok(t) = DateTime::parse_from_str(s, fmt) {
            return Some(t.with_timezone(&Local));
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return local(naive);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).and_then(local);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn typed(token: &str) -> Operand {
        parse_typed(token, &token[1..])
    }

    fn constant(token: &str) -> Value {
        match typed(token) {
            Operand::Constant(v) => v,
            other => panic!("expected constant, got {:?}", other),
        }
    }

    #[test]
    fn scalar_tags() {
        assert_eq!(constant("#i42"), Value::Int(42));
        assert_eq!(constant("#i-7"), Value::Int(-7));
        assert_eq!(constant("#f3.5"), Value::Float(3.5));
        assert_eq!(constant("#btrue"), Value::Bool(true));
        assert_eq!(constant("#bfalse"), Value::Bool(false));
        assert_eq!(constant("#y200"), Value::Byte(200));
        assert_eq!(constant("#xff"), Value::Byte(255));
        assert_eq!(constant("#Babc"), Value::Rune('a'));
        assert_eq!(constant("#rz"), Value::Rune('z'));
        assert_eq!(constant("#r65"), Value::Rune('A'));
    }

    #[test]
    fn string_and_error_tags_strip_quotes() {
        assert_eq!(constant("#s'hello'"), Value::Str("hello".into()));
        assert_eq!(constant("#s`a b`"), Value::Str("a b".into()));
        assert_eq!(constant(r#"#s"tab\there""#), Value::Str("tab\there".into()));
        assert_eq!(constant("#sbare"), Value::Str("bare".into()));
        assert_eq!(constant("#e'failed'"), Value::Error("failed".into()));
    }

    #[test]
    fn json_tags() {
        assert_eq!(constant("#L[1,2,3]"), Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
        assert_eq!(constant("#Y[1,255]"), Value::Bytes(vec![1, 255]));
        assert_eq!(constant("#R[97,98]"), Value::List(vec![Value::Rune('a'), Value::Rune('b')]));
        assert_eq!(constant("#S['a']").to_string(), "#S['a']");
        assert_eq!(constant(r#"#S`["a","b"]`"#), Value::List(vec![Value::Str("a".into()), Value::Str("b".into())]));
        let Value::Map(m) = constant(r#"#M`{"k":1}`"#) else { panic!("expected map") };
        assert_eq!(m["k"], Value::Int(1));
        assert_eq!(constant("#Jtrue"), Value::Bool(true));
    }

    #[test]
    fn malformed_payload_keeps_whole_token() {
        assert_eq!(constant("#iabc"), Value::Str("#iabc".into()));
        assert_eq!(constant("#f1.2.3"), Value::Str("#f1.2.3".into()));
        assert_eq!(constant("#y300"), Value::Str("#y300".into()));
        assert_eq!(constant("#L[1,"), Value::Str("#L[1,".into()));
        assert_eq!(constant("#bmaybe"), Value::Str("#bmaybe".into()));
        assert_eq!(constant("#q1"), Value::Str("#q1".into()));
        assert_eq!(constant("#"), Value::Str("#".into()));
    }

    #[test]
    fn time_now() {
        assert!(matches!(constant("#t"), Value::Time(_)));
        assert!(matches!(constant("#tnow"), Value::Time(_)));
    }

    #[test]
    fn time_formats() {
        let t = parse_time("2024-03-05 10:20:30").unwrap();
        assert_eq!((t.year(), t.month(), t.day()), (2024, 3, 5));
        assert_eq!((t.hour(), t.minute(), t.second()), (10, 20, 30));

        let t = parse_time("20240305102030").unwrap();
        assert_eq!((t.day(), t.hour()), (5, 10));

        let t = parse_time("2024/03/05").unwrap();
        assert_eq!((t.month(), t.hour()), (3, 0));

        assert!(parse_time("2024-03-05T10:20:30Z").is_some());
        assert!(parse_time("1700000000").is_some());
        assert!(parse_time("not a date").is_none());
    }

    #[test]
    fn quoted_time_payload() {
        let Value::Time(t) = constant("#t'2020-01-02 03:04:05'") else { panic!("expected time") };
        assert_eq!(t.year(), 2020);
        assert_eq!(constant("#tyesterday"), Value::Str("#tyesterday".into()));
    }
}
