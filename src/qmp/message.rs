//! QMP wire shapes.
//!
//! Every message is one JSON object per line. Requests carry `execute`,
//! optional `arguments` and a string `id`; responses echo the `id` with either
//! `return` or `error`; anything without an `id` is an asynchronous event.

use serde::Serialize;
use serde_json::Value;

/// Client → emulator command.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<&'a str>,
}

/// Capabilities this client knows how to use, in preference order.
pub const SUPPORTED_CAPABILITIES: &[&str] = &["oob"];

/// Parsed `{"QMP": {...}}` greeting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Greeting {
    pub version: Option<Value>,
    pub capabilities: Vec<String>,
}

impl Greeting {
    /// Returns `None` if `obj` is not a greeting.
    pub fn parse(obj: &Value) -> Option<Self> {
        let qmp = obj.get("QMP")?;
        let capabilities = qmp
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|caps| {
                caps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            version: qmp.get("version").cloned(),
            capabilities,
        })
    }

    /// The subset of offered capabilities to enable.
    pub fn negotiate(&self) -> Vec<String> {
        SUPPORTED_CAPABILITIES
            .iter()
            .filter(|cap| self.capabilities.iter().any(|c| c == *cap))
            .map(|cap| cap.to_string())
            .collect()
    }
}

/// An unsolicited message from the emulator.
#[derive(Debug, Clone, PartialEq)]
pub struct QmpEvent {
    /// The `event` field, when present.
    pub name: Option<String>,
    /// The whole object as received.
    pub raw: Value,
}

/// A decoded incoming object.
#[derive(Debug)]
pub enum Incoming {
    Response {
        id: String,
        result: Result<Value, String>,
    },
    Event(QmpEvent),
}

impl Incoming {
    pub fn classify(obj: Value) -> Self {
        let id = match obj.get("id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let Some(id) = id else {
            return Incoming::Event(QmpEvent {
                name: obj.get("event").and_then(Value::as_str).map(str::to_string),
                raw: obj,
            });
        };

        let result = match obj.get("return") {
            Some(ret) => Ok(ret.clone()),
            None => Err(obj
                .get("error")
                .and_then(|e| e.get("desc"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| obj.to_string())),
        };
        Incoming::Response { id, result }
    }
}

/// Result of `query-vnc`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VncInfo {
    pub enabled: bool,
    /// Listening address family (`ipv4`, `ipv6`, `unix`).
    pub family: String,
    pub host: String,
    /// Listening port, 0 when the server is not listening on TCP.
    pub port: u16,
}

impl VncInfo {
    pub fn from_return(ret: &Value) -> Self {
        let text = |key: &str| {
            ret.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            enabled: ret.get("enabled").and_then(Value::as_bool).unwrap_or(false),
            family: text("family"),
            host: text("host"),
            port: ret
                .get("service")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        }
    }

    /// `host:port` suitable for connecting, bracketing IPv6 hosts.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
