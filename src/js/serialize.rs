//! Native values rendered as script literals.

use std::fmt::Write as _;

use serde_json::Value;

/// A value that can be written into script text.
///
/// `Undefined` has no JSON counterpart; it is used for declared component
/// events, which the script side replaces with native-call proxies.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Undefined,
    Json(Value),
    /// Text that is already valid script and is emitted verbatim.
    Raw(String),
}

impl From<Value> for ScriptValue {
    fn from(value: Value) -> Self {
        ScriptValue::Json(value)
    }
}

impl ScriptValue {
    pub fn to_literal(&self) -> String {
        let mut out = String::new();
        self.write_literal(&mut out);
        out
    }

    fn write_literal(&self, out: &mut String) {
        match self {
            ScriptValue::Undefined => out.push_str("undefined"),
            ScriptValue::Raw(text) => out.push_str(text),
            ScriptValue::Json(value) => write_json(value, out),
        }
    }
}

/// Serialize one value as a script literal.
pub fn to_literal(value: &Value) -> String {
    let mut out = String::new();
    write_json(value, &mut out);
    out
}

/// Serialize an object literal, keeping the members in the given order.
pub fn serialize_object(entries: &[(String, ScriptValue)]) -> String {
    let mut out = String::from("{");
    for (index, (key, value)) in entries.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(&encode_string(key));
        out.push(':');
        value.write_literal(&mut out);
    }
    out.push('}');
    out
}

/// Render `name(arg1,arg2,...)`. With `serialize` false the arguments are
/// taken to be script text already.
pub fn function_call(name: &str, serialize: bool, args: &[Value]) -> String {
    let rendered: Vec<String> = args
        .iter()
        .map(|arg| match (serialize, arg) {
            (false, Value::String(text)) => text.clone(),
            _ => to_literal(arg),
        })
        .collect();
    format!("{}({})", name, rendered.join(","))
}

/// Script-facing member name: first character lower-cased.
pub fn script_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Quote and escape `text` so that it is safe inside script and HTML.
pub fn encode_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        match ch {
            '\u{8}' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\u{c}' => out.push_str("\\f"),
            '\r' => out.push_str("\\r"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20
                || matches!(c, '<' | '>' | '&' | '\'' | '\u{85}' | '\u{2028}' | '\u{2029}') =>
            {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn write_json(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => write_number(number, out),
        Value::String(text) => out.push_str(&encode_string(text)),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_json(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&encode_string(key));
                out.push(':');
                write_json(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_number(number: &serde_json::Number, out: &mut String) {
    match number.as_f64() {
        Some(float) if !number.is_i64() && !number.is_u64() => {
            if float.is_finite() && float.fract() == 0.0 && float.abs() < 1e15 {
                let _ = write!(out, "{}", float as i64);
            } else {
                let _ = write!(out, "{number}");
            }
        }
        _ => {
            let _ = write!(out, "{number}");
        }
    }
}
