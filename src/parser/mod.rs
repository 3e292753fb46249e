pub mod literal;

use std::collections::BTreeMap;

use crate::ast::Operand;

pub type Labels = BTreeMap<String, usize>;

/// Map one token to an operand. Never fails: anything that does not match a
/// more specific form is kept as a string constant.
pub fn parse_operand(token: &str, labels: &Labels) -> Operand {
    let s = token.trim();

    if s.len() >= 2 && s.starts_with('`') && s.ends_with('`') {
        return Operand::text(&s[1..s.len() - 1]);
    }

    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        return Operand::text(unquote(s).unwrap_or_else(|| s.to_string()));
    }

    if let Some(name) = s.strip_prefix('$') {
        return parse_dollar(name).unwrap_or_else(|| Operand::text(s));
    }

    if s == "_" {
        return Operand::Discard;
    }

    if let Some(name) = s.strip_prefix(':') {
        return parse_label(s, name, labels);
    }

    if let Some(rest) = s.strip_prefix('#') {
        return literal::parse_typed(s, rest);
    }

    if let Some(rest) = s.strip_prefix('@') {
        return parse_deferred(s, rest);
    }

    if s.len() >= 2 && s.starts_with('[') && s.ends_with(']') {
        return parse_bracket(s, labels);
    }

    if s.len() >= 2 && s.starts_with('{') && s.ends_with('}') {
        return parse_brace(s, labels);
    }

    Operand::text(s)
}

fn parse_dollar(name: &str) -> Option<Operand> {
    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
        return name.parse::<usize>().ok().map(Operand::Local);
    }
    let op = match name {
        "drop" => Operand::Discard,
        "debug" => Operand::Debug,
        "pln" => Operand::Print,
        "pop" => Operand::StackPop,
        "peek" => Operand::StackPeek,
        "push" => Operand::StackPush,
        "tmp" => Operand::Temp,
        "seq" => Operand::Sequence,
        "clip" => Operand::Clipboard,
        "in" => Operand::Local(crate::vm::SLOT_ARGS),
        "out" => Operand::Local(crate::vm::SLOT_RETURN),
        _ => return None,
    };
    Some(op)
}

fn parse_label(token: &str, name: &str, labels: &Labels) -> Operand {
    if name.is_empty() {
        return Operand::text(token);
    }
    if let Some(&addr) = labels.get(name) {
        return Operand::Address(addr);
    }
    let signed = name.starts_with('+') || name.starts_with('-');
    if signed && name.len() > 1 && name[1..].bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(offset) = name.parse::<i64>() {
            return Operand::Relative(offset);
        }
    }
    Operand::Label(name.to_string())
}

fn parse_deferred(token: &str, rest: &str) -> Operand {
    let (flexible, body) = match rest.strip_prefix('@') {
        Some(body) => (true, body),
        None => (false, rest),
    };
    let body = body.trim();
    if body.is_empty() {
        return Operand::text(token);
    }
    let text = literal::strip_wrapping(body).unwrap_or_else(|| body.to_string());
    Operand::Deferred { flexible, text }
}

/// Index and key fields may be quoted; the quotes are removed before the
/// field is parsed as an operand.
fn parse_key(field: &str, labels: &Labels) -> Operand {
    let field = field.trim();
    let stripped = literal::strip_wrapping(field).unwrap_or_else(|| field.to_string());
    parse_operand(&stripped, labels)
}

fn parse_bracket(token: &str, labels: &Labels) -> Operand {
    let inner = token[1..token.len() - 1].trim();
    if inner.is_empty() {
        return Operand::text(token);
    }

    let fields: Vec<&str> = inner.split(',').collect();
    if fields.len() >= 3 {
        return Operand::Slice {
            base: Box::new(parse_operand(fields[0], labels)),
            start: Box::new(parse_key(fields[1], labels)),
            end: Box::new(parse_key(fields[2], labels)),
        };
    }
    if fields.len() == 2 {
        return Operand::Element {
            base: Box::new(parse_operand(fields[0], labels)),
            index: Box::new(parse_key(fields[1], labels)),
            default: None,
        };
    }

    let fields: Vec<&str> = inner.splitn(3, '|').collect();
    match fields.as_slice() {
        [base, index] => Operand::Element {
            base: Box::new(parse_operand(base, labels)),
            index: Box::new(parse_key(index, labels)),
            default: None,
        },
        [base, index, default] => Operand::Element {
            base: Box::new(parse_operand(base, labels)),
            index: Box::new(parse_key(index, labels)),
            default: Some(Box::new(parse_operand(default, labels))),
        },
        _ => Operand::text(token),
    }
}

fn parse_brace(token: &str, labels: &Labels) -> Operand {
    let inner = token[1..token.len() - 1].trim();
    let pair = inner.split_once(',').or_else(|| inner.split_once('|'));
    match pair {
        Some((base, key)) => Operand::MapEntry {
            base: Box::new(parse_operand(base, labels)),
            key: Box::new(parse_key(key, labels)),
        },
        None => Operand::text(token),
    }
}

/// Unescape a double-quoted literal (quotes included). `None` when the
/// escape syntax is malformed or the body holds a raw newline or quote.
pub fn unquote(s: &str) -> Option<String> {
    let body = s.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();

    while let Some(c) = chars.next() {
        match c {
            '\n' | '"' => return None,
            '\\' => {}
            _ => {
                out.push(c);
                continue;
            }
        }
        let escaped = match chars.next()? {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'a' => '\x07',
            'b' => '\x08',
            'f' => '\x0c',
            'v' => '\x0b',
            '\\' => '\\',
            '"' => '"',
            '\'' => '\'',
            'x' => hex_escape(&mut chars, 2)?,
            'u' => hex_escape(&mut chars, 4)?,
            'U' => hex_escape(&mut chars, 8)?,
            d @ '0'..='7' => {
                let mut code = d.to_digit(8)?;
                for _ in 0..2 {
                    code = code * 8 + chars.next()?.to_digit(8)?;
                }
                char::from_u32(code).filter(|_| code <= 0xFF)?
            }
            _ => return None,
        };
        out.push(escaped);
    }

    Some(out)
}

fn hex_escape(chars: &mut std::str::Chars<'_>, digits: usize) -> Option<char> {
    let mut code = 0u32;
    for _ in 0..digits {
        code = code * 16 + chars.next()?.to_digit(16)?;
    }
    char::from_u32(code)
}
