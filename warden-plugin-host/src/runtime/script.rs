//! Restricted line interpreter.
//!
//! One instruction per line:
//!
//! ```text
//! # comment
//! call <method> [<json-array>] [because <reason>]
//! try call <method> [<json-array>] [because <reason>]
//! request <capability> [because <reason>]
//! sleep <ms>
//! spin
//! fail <message>
//! return [<json> | $last]
//! ```
//!
//! `$last` holds the result of the previous `call`, `try call` or
//! `request`; a string argument equal to `"$last"` is replaced by it. A
//! failed `call` that is not prefixed by `try` faults the context; `try
//! call` stores `{"error": {...}}` in `$last` instead.
//!
//! The interpreter has no primitives besides the proxy.

use super::{GuestContext, GuestFault, Interrupter, IsolationRuntime, RuntimeKind};
use crate::capability::Capability;
use crate::error::PluginHostResult;
use crate::proxy::ApiProxy;
use serde_json::{Value, json};
use std::time::Duration;
use warden_types::PluginId;

#[derive(Debug, Default)]
pub struct ScriptRuntime;

impl ScriptRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl IsolationRuntime for ScriptRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Script
    }

    fn create_context(&self, _plugin_id: &PluginId) -> PluginHostResult<Box<dyn GuestContext>> {
        Ok(Box::new(ScriptContext {
            interrupter: Interrupter::new(),
        }))
    }
}

struct ScriptContext {
    interrupter: Interrupter,
}

impl GuestContext for ScriptContext {
    fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    fn run(self: Box<Self>, code: &str, mut proxy: ApiProxy) -> Result<Value, GuestFault> {
        let program = parse(code).map_err(GuestFault::Raised)?;
        let mut last = Value::Null;

        for instruction in program {
            proxy.check_interrupted()?;
            match instruction {
                Instruction::Call {
                    method,
                    args,
                    reason,
                    catch,
                } => {
                    let args = args.into_iter().map(|a| substitute(a, &last)).collect();
                    last = match proxy.call(&method, args, reason)? {
                        Ok(value) => value,
                        Err(error) if catch => json!({ "error": error }),
                        Err(error) => return Err(GuestFault::Uncaught(error)),
                    };
                }
                Instruction::Request { capability, reason } => {
                    let granted = proxy.request_permission(capability, &reason)?;
                    last = json!({ "granted": granted });
                }
                Instruction::Sleep(duration) => proxy.pause(duration)?,
                Instruction::Spin => loop {
                    proxy.check_interrupted()?;
                    std::thread::yield_now();
                },
                Instruction::Fail(message) => return Err(GuestFault::Raised(message)),
                Instruction::Return(Operand::Last) => return Ok(last),
                Instruction::Return(Operand::Literal(value)) => return Ok(value),
            }
        }
        Ok(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(Value),
    Last,
}

#[derive(Debug, Clone, PartialEq)]
enum Instruction {
    Call {
        method: String,
        args: Vec<Value>,
        reason: Option<String>,
        catch: bool,
    },
    Request {
        capability: Capability,
        reason: String,
    },
    Sleep(Duration),
    Spin,
    Fail(String),
    Return(Operand),
}

fn substitute(arg: Value, last: &Value) -> Value {
    match arg {
        Value::String(s) if s == "$last" => last.clone(),
        other => other,
    }
}

/// Parses the whole program before anything runs.
fn parse(code: &str) -> Result<Vec<Instruction>, String> {
    code.lines()
        .enumerate()
        .filter_map(|(n, line)| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                None
            } else {
                Some(parse_line(line).map_err(|e| format!("line {}: {e}", n + 1)))
            }
        })
        .collect()
}

fn parse_line(line: &str) -> Result<Instruction, String> {
    let (op, rest) = split_word(line);
    match op {
        "call" => parse_call(rest, false),
        "try" => match split_word(rest) {
            ("call", rest) => parse_call(rest, true),
            _ => Err("'try' must be followed by 'call'".to_string()),
        },
        "request" => {
            let (name, rest) = split_word(rest);
            let capability = name.parse::<Capability>()?;
            let reason = parse_reason(rest)?.unwrap_or_default();
            Ok(Instruction::Request { capability, reason })
        }
        "sleep" => rest
            .parse::<u64>()
            .map(|ms| Instruction::Sleep(Duration::from_millis(ms)))
            .map_err(|e| format!("bad sleep duration '{rest}': {e}")),
        "spin" if rest.is_empty() => Ok(Instruction::Spin),
        "fail" => Ok(Instruction::Fail(if rest.is_empty() {
            "plugin failed".to_string()
        } else {
            rest.to_string()
        })),
        "return" => match rest {
            "" => Ok(Instruction::Return(Operand::Literal(Value::Null))),
            "$last" => Ok(Instruction::Return(Operand::Last)),
            json => serde_json::from_str(json)
                .map(|v| Instruction::Return(Operand::Literal(v)))
                .map_err(|e| format!("bad return value: {e}")),
        },
        other => Err(format!("unknown instruction '{other}'")),
    }
}

fn parse_call(rest: &str, catch: bool) -> Result<Instruction, String> {
    let (method, rest) = split_word(rest);
    if method.is_empty() {
        return Err("missing method name".to_string());
    }

    let (args, rest) = if rest.starts_with('[') {
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
        let value = match stream.next() {
            Some(Ok(value)) => value,
            Some(Err(e)) => return Err(format!("bad arguments: {e}")),
            None => return Err("missing arguments".to_string()),
        };
        let consumed = stream.byte_offset();
        match value {
            Value::Array(args) => (args, rest[consumed..].trim_start()),
            _ => return Err("arguments must be a JSON array".to_string()),
        }
    } else {
        (Vec::new(), rest)
    };

    Ok(Instruction::Call {
        method: method.to_string(),
        args,
        reason: parse_reason(rest)?,
        catch,
    })
}

fn parse_reason(rest: &str) -> Result<Option<String>, String> {
    match split_word(rest) {
        ("", _) => Ok(None),
        ("because", reason) if !reason.is_empty() => Ok(Some(reason.to_string())),
        _ => Err(format!("unexpected trailing text '{rest}'")),
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim()),
        None => (s, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_with_args_and_reason() {
        let program =
            parse(r#"call storage.set ["k", {"a": [1, 2]}] because remember the draft"#).unwrap();
        assert_eq!(
            program,
            vec![Instruction::Call {
                method: "storage.set".into(),
                args: vec![json!("k"), json!({"a": [1, 2]})],
                reason: Some("remember the draft".into()),
                catch: false,
            }]
        );
    }

    #[test]
    fn parses_call_without_args() {
        let program = parse("try call storage.keys").unwrap();
        assert_eq!(
            program,
            vec![Instruction::Call {
                method: "storage.keys".into(),
                args: vec![],
                reason: None,
                catch: true,
            }]
        );
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let program = parse("# setup\n\n  sleep 5\nspin\nreturn $last\n").unwrap();
        assert_eq!(
            program,
            vec![
                Instruction::Sleep(Duration::from_millis(5)),
                Instruction::Spin,
                Instruction::Return(Operand::Last),
            ]
        );
    }

    #[test]
    fn parses_request() {
        let program = parse("request network because fetch feeds").unwrap();
        assert_eq!(
            program,
            vec![Instruction::Request {
                capability: Capability::Network,
                reason: "fetch feeds".into(),
            }]
        );
    }

    #[test]
    fn syntax_errors_name_the_line() {
        let err = parse("return 1\nexec rm -rf /").unwrap_err();
        assert!(err.starts_with("line 2:"), "{err}");
        assert!(parse("call storage.get {\"k\": 1}").is_err());
        assert!(parse("call storage.get [\"k\"] please").is_err());
        assert!(parse("request filesystem").is_err());
        assert!(parse("try return 1").is_err());
    }

    #[test]
    fn last_substitution_only_replaces_exact_marker() {
        let last = json!({"v": 1});
        assert_eq!(substitute(json!("$last"), &last), last);
        assert_eq!(substitute(json!("$lastly"), &last), json!("$lastly"));
    }
}
