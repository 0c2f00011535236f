//! Wire protocol for the supervisor control socket.
//!
//! Every connection opens with a greeting line naming the sub-protocol,
//! followed by line-delimited JSON:
//!
//! - RPC mode: `{"method", "params": [..], "id"}` requests answered by
//!   `{"id", "result", "error"}` responses.
//! - Run mode: one `RunRequest`, then a stream of frames. From the
//!   supervisor each line is `null` (ack / peer closing), a base64 string
//!   (output chunk) or an integer (exit code). From the client each line is
//!   a base64 string of stdin data, with `""` marking end of input.

use crate::error::ControlError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const GREETING_RPC: &str = "NOVM RPC";
pub const GREETING_RUN: &str = "NOVM RUN";

/// Namespace under which the supervisor registers its RPC verbs.
pub const RPC_NAMESPACE: &str = "Rpc";

/// Largest stdin chunk forwarded in one frame.
pub const MAX_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    Rpc,
    Run,
}

impl Greeting {
    pub fn line(self) -> &'static str {
        match self {
            Greeting::Rpc => GREETING_RPC,
            Greeting::Run => GREETING_RUN,
        }
    }

    pub fn parse(line: &str) -> Option<Greeting> {
        match line.trim_end() {
            GREETING_RPC => Some(Greeting::Rpc),
            GREETING_RUN => Some(Greeting::Run),
            _ => None,
        }
    }
}

/// Map a short verb such as `vcpu` to its wire name, `Rpc.Vcpu`.
pub fn wire_method(name: &str) -> String {
    let verb = match name.rsplit_once('.') {
        Some((_, verb)) => verb,
        None => name,
    };
    let mut chars = verb.chars();
    let normalized: String = match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(|c| c.to_lowercase()))
            .collect(),
        None => String::new(),
    };
    format!("{}.{}", RPC_NAMESPACE, normalized)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Vec<Value>,
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A command to start inside the guest.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunRequest {
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub cwd: String,
    pub terminal: bool,
}

/// On the wire the environment travels as `KEY=VALUE` strings.
#[derive(Debug, Serialize, Deserialize)]
struct WireRunRequest {
    command: Vec<String>,
    #[serde(default)]
    environment: Vec<String>,
    #[serde(default)]
    cwd: String,
    #[serde(default)]
    terminal: bool,
}

impl Serialize for RunRequest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireRunRequest {
            command: self.command.clone(),
            environment: self
                .environment
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            cwd: self.cwd.clone(),
            terminal: self.terminal,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RunRequest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireRunRequest::deserialize(deserializer)?;
        let environment = wire
            .environment
            .into_iter()
            .map(|entry| match entry.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (entry, String::new()),
            })
            .collect();
        Ok(RunRequest {
            command: wire.command,
            environment,
            cwd: wire.cwd,
            terminal: wire.terminal,
        })
    }
}

/// One unit of the run stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Ack,
    Data(Vec<u8>),
    ExitCode(i32),
}

impl StreamFrame {
    pub fn decode(line: &str) -> Result<StreamFrame, ControlError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| ControlError::Protocol(format!("malformed frame {:?}: {}", line, e)))?;
        match value {
            Value::Null => Ok(StreamFrame::Ack),
            Value::String(text) => BASE64
                .decode(text.as_bytes())
                .map(StreamFrame::Data)
                .map_err(|e| ControlError::Protocol(format!("invalid base64 in frame: {}", e))),
            Value::Number(n) => n
                .as_i64()
                .and_then(|code| i32::try_from(code).ok())
                .map(StreamFrame::ExitCode)
                .ok_or_else(|| ControlError::Protocol(format!("invalid exit code {}", n))),
            other => Err(ControlError::Protocol(format!(
                "unexpected frame type: {}",
                other
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            StreamFrame::Ack => "null".to_string(),
            StreamFrame::Data(bytes) => Value::String(BASE64.encode(bytes)).to_string(),
            StreamFrame::ExitCode(code) => code.to_string(),
        }
    }
}

/// First line of a run session: `null` on success, otherwise an error string.
pub fn decode_start_reply(line: &str) -> Result<Option<String>, ControlError> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Null) => Ok(None),
        Ok(Value::String(message)) => Ok(Some(message)),
        Ok(other) => Ok(Some(other.to_string())),
        Err(e) => Err(ControlError::Protocol(format!(
            "malformed start reply {:?}: {}",
            line, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_method_normalizes_case() {
        assert_eq!(wire_method("vcpu"), "Rpc.Vcpu");
        assert_eq!(wire_method("TRACE"), "Rpc.Trace");
        assert_eq!(wire_method("Rpc.pause"), "Rpc.Pause");
    }

    #[test]
    fn test_greeting_parse() {
        assert_eq!(Greeting::parse("NOVM RPC\n"), Some(Greeting::Rpc));
        assert_eq!(Greeting::parse("NOVM RUN"), Some(Greeting::Run));
        assert_eq!(Greeting::parse("NOVM EXEC"), None);
    }

    #[test]
    fn test_run_request_environment_on_the_wire() {
        let mut environment = BTreeMap::new();
        environment.insert("PATH".to_string(), "/bin".to_string());
        environment.insert("EMPTY".to_string(), String::new());
        let request = RunRequest {
            command: vec!["/bin/echo".to_string(), "hi".to_string()],
            environment,
            cwd: "/".to_string(),
            terminal: false,
        };

        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire,
            serde_json::json!({
                "command": ["/bin/echo", "hi"],
                "environment": ["EMPTY=", "PATH=/bin"],
                "cwd": "/",
                "terminal": false,
            })
        );

        let back: RunRequest = serde_json::from_value(wire).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_frame_decoding() {
        assert_eq!(StreamFrame::decode("null").unwrap(), StreamFrame::Ack);
        assert_eq!(
            StreamFrame::decode("\"aGkK\"").unwrap(),
            StreamFrame::Data(b"hi\n".to_vec())
        );
        assert_eq!(StreamFrame::decode("0").unwrap(), StreamFrame::ExitCode(0));
        assert_eq!(StreamFrame::decode("-1").unwrap(), StreamFrame::ExitCode(-1));
    }

    #[test]
    fn test_frame_rejects_garbage() {
        assert!(matches!(
            StreamFrame::decode("{\"stderr\": true}"),
            Err(ControlError::Protocol(_))
        ));
        assert!(matches!(
            StreamFrame::decode("\"not base64!\""),
            Err(ControlError::Protocol(_))
        ));
        assert!(matches!(
            StreamFrame::decode("1.5"),
            Err(ControlError::Protocol(_))
        ));
        assert!(matches!(
            StreamFrame::decode("{truncated"),
            Err(ControlError::Protocol(_))
        ));
    }

    #[test]
    fn test_empty_data_frame_marks_eof() {
        assert_eq!(StreamFrame::Data(Vec::new()).encode(), "\"\"");
        assert_eq!(
            StreamFrame::decode("\"\"").unwrap(),
            StreamFrame::Data(Vec::new())
        );
    }

    #[test]
    fn test_start_reply() {
        assert_eq!(decode_start_reply("null").unwrap(), None);
        assert_eq!(
            decode_start_reply("\"no such file\"").unwrap().as_deref(),
            Some("no such file")
        );
        assert!(decode_start_reply("").is_err());
    }
}
