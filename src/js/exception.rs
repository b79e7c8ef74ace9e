//! Error wrapping for submitted script text and parsing of the resulting
//! fault payloads back into [`JsException`].

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::{JsException, StackFrame};

/// Suffix appended to payloads thrown by our own wrapper.
pub const INTERNAL_EXCEPTION_MARKER: &str = "|ViewHostInternalException";

const EVAL_SOURCE: &str = "eval";
/// Source name the engine gives to the submission wrapper.
const WRAPPER_SOURCE: &str = "eval_script";
const FOREIGN_FAULT_NAME: &str = "Javascript Error";

/// A fault as reported by a script engine, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFault {
    pub payload: String,
}

impl RawFault {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Whether the payload came from the submission wrapper rather than an
    /// out-of-band error.
    pub fn is_internal(&self) -> bool {
        self.payload.ends_with(INTERNAL_EXCEPTION_MARKER)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FaultPayload {
    name: Option<String>,
    message: Option<String>,
    stack: Option<String>,
}

/// Wrap `script` so that a thrown error leaves the engine as a JSON payload
/// tagged with [`INTERNAL_EXCEPTION_MARKER`]. The completion value of the
/// script is preserved.
pub fn wrap_script(script: &str) -> String {
    let encoded = serde_json::to_string(script).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "(function() {{\n\
         try {{\n\
         return (0, eval)({encoded});\n\
         }} catch (e) {{\n\
         throw JSON.stringify({{\n\
         stack: e && e.stack,\n\
         message: e && e.message !== undefined ? e.message : String(e),\n\
         name: e && e.name\n\
         }}) + '{INTERNAL_EXCEPTION_MARKER}';\n\
         }}\n\
         }})()"
    )
}

/// Turn an engine fault into a structured exception. `functions` are the
/// names of the functions the failing submission evaluated; they are
/// prepended to the parsed stack as `eval` frames.
pub fn parse_fault(fault: &RawFault, functions: &[String]) -> JsException {
    let payload = fault
        .payload
        .strip_suffix(INTERNAL_EXCEPTION_MARKER)
        .unwrap_or(&fault.payload);

    let mut exception = match json_section(payload)
        .and_then(|json| serde_json::from_str::<FaultPayload>(json).ok())
    {
        Some(parsed) => {
            let name = parsed.name.unwrap_or_default();
            let message = parsed.message.unwrap_or_default();
            let frames = parsed
                .stack
                .as_deref()
                .map(|stack| parse_stack(strip_stack_header(stack, &name, &message)))
                .unwrap_or_default()
                .into_iter()
                .filter(|frame| frame.source_name != WRAPPER_SOURCE)
                .collect();
            JsException::new(name, message).with_frames(frames)
        }
        None => JsException::new(FOREIGN_FAULT_NAME, payload),
    };

    if functions.iter().any(|function| !function.is_empty()) {
        let mut frames: Vec<StackFrame> = functions
            .iter()
            .filter(|function| !function.is_empty())
            .map(|function| StackFrame {
                function_name: function.clone(),
                source_name: EVAL_SOURCE.to_string(),
                line: 0,
                column: 0,
            })
            .collect();
        frames.append(&mut exception.frames);
        exception.frames = frames;
    }

    exception
}

/// Parse `at <fn> (<file>:<line>:<col>)` lines. Lines that do not match are
/// dropped.
pub fn parse_stack(stack: &str) -> Vec<StackFrame> {
    stack
        .lines()
        .filter_map(|line| {
            let captures = stack_line_regex().captures(line)?;
            Some(StackFrame {
                function_name: captures
                    .name("method")
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default(),
                source_name: captures["location"].to_string(),
                line: captures["line"].parse().unwrap_or(0),
                column: captures["column"].parse().unwrap_or(0),
            })
        })
        .collect()
}

fn stack_line_regex() -> &'static Regex {
    static STACK_LINE: OnceLock<Regex> = OnceLock::new();
    STACK_LINE.get_or_init(|| {
        Regex::new(r"at\s*(?P<method>.*?)\s\(?(?P<location>[^\s()]+):(?P<line>\d+):(?P<column>\d+)")
            .expect("stack line regex")
    })
}

fn json_section(payload: &str) -> Option<&str> {
    let start = payload.find('{')?;
    let end = payload.rfind('}')?;
    (start < end).then(|| &payload[start..=end])
}

fn strip_stack_header<'a>(stack: &'a str, name: &str, message: &str) -> &'a str {
    let header = if name.is_empty() {
        message.to_string()
    } else {
        format!("{name}: {message}")
    };
    stack
        .strip_prefix(header.as_str())
        .map(|rest| rest.trim_start_matches('\n'))
        .unwrap_or(stack)
}
