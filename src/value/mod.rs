use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};

/// Every value a script can hold. The VM never sees anything else.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Undefined,
    Int(i64),
    Float(f64),
    Bool(bool),
    Byte(u8),
    Rune(char),
    Str(String),
    Time(DateTime<Local>),
    Error(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("cannot convert {from} to {to}")]
    Conversion { from: &'static str, to: &'static str },
    #[error("cannot compare {left} with {right}")]
    Incomparable { left: &'static str, right: &'static str },
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Byte(_) => "byte",
            Value::Rune(_) => "rune",
            Value::Str(_) => "string",
            Value::Time(_) => "time",
            Value::Error(_) => "error",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Bytes(_) => "bytes",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    fn conversion(&self, to: &'static str) -> ValueError {
        ValueError::Conversion { from: self.type_name(), to }
    }

    pub fn to_int(&self) -> Result<i64, ValueError> {
        match self {
            Value::Int(n) => Ok(*n),
            Value::Float(f) if f.is_finite() => Ok(f.trunc() as i64),
            Value::Bool(b) => Ok(*b as i64),
            Value::Byte(b) => Ok(*b as i64),
            Value::Rune(c) => Ok(*c as i64),
            Value::Str(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                    .ok_or_else(|| self.conversion("int"))
            }
            _ => Err(self.conversion("int")),
        }
    }

    pub fn to_float(&self) -> Result<f64, ValueError> {
        match self {
            Value::Int(n) => Ok(*n as f64),
            Value::Float(f) => Ok(*f),
            Value::Byte(b) => Ok(*b as f64),
            Value::Str(s) => s.trim().parse::<f64>().map_err(|_| self.conversion("float")),
            _ => Err(self.conversion("float")),
        }
    }

    /// Text form used by printing, string comparison and host calls.
    pub fn to_text(&self) -> String {
        self.to_string()
    }

    /// Strict "less than" over ordered scalar pairs.
    pub fn less_than(&self, other: &Value) -> Result<bool, ValueError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(a < b),
            (Value::Float(a), Value::Float(b)) => Ok(a < b),
            (Value::Int(a), Value::Float(b)) => Ok((*a as f64) < *b),
            (Value::Float(a), Value::Int(b)) => Ok(*a < (*b as f64)),
            (Value::Byte(a), Value::Byte(b)) => Ok(a < b),
            (Value::Rune(a), Value::Rune(b)) => Ok(a < b),
            (Value::Str(a), Value::Str(b)) => Ok(a < b),
            (Value::Time(a), Value::Time(b)) => Ok(a < b),
            _ => Err(ValueError::Incomparable { left: self.type_name(), right: other.type_name() }),
        }
    }

    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Undefined,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from_json).collect()),
            serde_json::Value::Object(fields) => {
                Value::Map(fields.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Undefined => Json::Null,
            Value::Int(n) => Json::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Value::Bool(b) => Json::Bool(*b),
            Value::Byte(b) => Json::from(*b),
            Value::Rune(c) => Json::String(c.to_string()),
            Value::Str(s) => Json::String(s.clone()),
            Value::Time(t) => Json::String(t.to_rfc3339()),
            Value::Error(e) => serde_json::json!({ "error": e }),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(fields) => Json::Object(fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Value::Bytes(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Byte(b) => write!(f, "{}", b),
            Value::Rune(c) => write!(f, "{}", c),
            Value::Str(s) => write!(f, "{}", s),
            Value::Time(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S%.3f")),
            Value::Error(e) => write!(f, "{}", e),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Bytes(bytes) => {
                write!(f, "[")?;
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", b)?;
                }
                write!(f, "]")
            }
        }
    }
}
