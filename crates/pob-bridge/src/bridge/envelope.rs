//! Protocol envelopes: one compact JSON object per line.
//!
//! ```text
//! child  -> {"ready": true}                          (once, before anything else)
//! parent -> {"command": "alloc_node", "params": {"node_id": 123}}
//! child  -> {"ok": true, "result": {...}}  |  {"ok": false, "error": "..."}
//! ```
//!
//! There are no request ids. Responses are matched to requests purely by
//! order, which is why the channel keeps exactly one request in flight.

use serde::Serialize;
use serde_json::Value;

use crate::JsonMap;
use crate::error::BridgeError;

/// Fallback message when an error response carries no `error` text.
pub const UNKNOWN_ERROR: &str = "Unknown error from bridge";

/// A request line. `params` is omitted entirely when empty.
#[derive(Debug, Serialize)]
pub struct RequestEnvelope<'a> {
    pub command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a JsonMap>,
}

impl<'a> RequestEnvelope<'a> {
    pub fn new(command: &'a str, params: Option<&'a JsonMap>) -> Self {
        Self {
            command,
            params: params.filter(|p| !p.is_empty()),
        }
    }

    /// Serialize to a single line of compact JSON, without the terminator.
    ///
    /// Newlines inside string values are escaped by the encoder, so the
    /// output never contains a raw line break.
    pub fn encode(&self) -> Result<String, BridgeError> {
        serde_json::to_string(self).map_err(|source| BridgeError::Encode {
            command: self.command.to_owned(),
            source,
        })
    }
}

/// A parsed response line.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub ok: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Parse one response line.
    pub fn parse(line: &str) -> Result<Self, BridgeError> {
        let value: Value = serde_json::from_str(line).map_err(|source| {
            BridgeError::InvalidResponse {
                line: line.to_owned(),
                source,
            }
        })?;
        let Value::Object(mut obj) = value else {
            return Err(BridgeError::NotAnEnvelope {
                line: line.to_owned(),
            });
        };

        let ok = obj.get("ok").is_some_and(is_truthy);
        let error = match obj.remove("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };
        Ok(Self {
            ok,
            result: obj.remove("result"),
            error,
        })
    }

    /// Turn the envelope into the command's result mapping.
    ///
    /// `ok: false` becomes [`BridgeError::Remote`] with the child's message.
    /// A missing or null result is an empty mapping; so is an empty array,
    /// which is how Lua JSON encoders render an empty table.
    pub fn into_result(self, command: &str) -> Result<JsonMap, BridgeError> {
        if !self.ok {
            return Err(BridgeError::Remote(
                self.error
                    .filter(|msg| !msg.is_empty())
                    .unwrap_or_else(|| UNKNOWN_ERROR.to_owned()),
            ));
        }
        match self.result {
            None | Some(Value::Null) => Ok(JsonMap::new()),
            Some(Value::Object(map)) => Ok(map),
            Some(Value::Array(items)) if items.is_empty() => Ok(JsonMap::new()),
            Some(other) => Err(BridgeError::UnexpectedResult {
                command: command.to_owned(),
                found: other.to_string(),
            }),
        }
    }
}

/// Validate the one-time ready line.
pub fn parse_ready(line: &str) -> Result<(), BridgeError> {
    let value: Value = serde_json::from_str(line).map_err(|source| BridgeError::InvalidReady {
        line: line.to_owned(),
        source,
    })?;
    if value.get("ready").is_some_and(is_truthy) {
        Ok(())
    } else {
        Err(BridgeError::UnexpectedReady(value.to_string()))
    }
}

/// Loose truthiness, the way the engine's host language treats flags:
/// `null`, `false`, `0`, `""`, `[]` and `{}` are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
