//! Newline-delimited JSON-RPC 2.0 envelopes for the app-server adapter.
//!
//! Inbound messages are classified by the presence of `method` and `id`:
//! both → server request, method only → notification, id only → response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sb_domain::{Error, Result};

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Serialize)]
pub struct OutboundRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl<'a> OutboundRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// Reply to a server-initiated request (their `id` echoed back verbatim).
#[derive(Debug, Serialize)]
pub struct OutboundResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl OutboundResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug)]
pub enum Inbound {
    /// `(method, id)` — the server wants an answer from us.
    ServerRequest {
        id: Value,
        method: String,
        params: Value,
    },
    /// `(method, no id)`.
    Notification { method: String, params: Value },
    /// `(no method, id)` — resolves one of our outbound requests.
    Response {
        id: u64,
        result: std::result::Result<Value, RpcErrorObject>,
    },
}

pub fn classify(line: &str) -> Result<Inbound> {
    let raw: RawMessage = serde_json::from_str(line)?;
    match (raw.method, raw.id) {
        (Some(method), Some(id)) => Ok(Inbound::ServerRequest {
            id,
            method,
            params: raw.params.unwrap_or(Value::Null),
        }),
        (Some(method), None) => Ok(Inbound::Notification {
            method,
            params: raw.params.unwrap_or(Value::Null),
        }),
        (None, Some(id)) => {
            let id = id
                .as_u64()
                .ok_or_else(|| Error::Rpc(format!("non-numeric response id: {id}")))?;
            let result = match raw.error {
                Some(err) => Err(err),
                None => Ok(raw.result.unwrap_or(Value::Null)),
            };
            Ok(Inbound::Response { id, result })
        }
        (None, None) => Err(Error::Rpc("message has neither method nor id".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_server_request() {
        let inbound =
            classify(r#"{"jsonrpc":"2.0","id":7,"method":"item/tool/requestUserInput","params":{}}"#)
                .unwrap();
        assert!(matches!(
            inbound,
            Inbound::ServerRequest { method, .. } if method == "item/tool/requestUserInput"
        ));
    }

    #[test]
    fn classifies_notification() {
        let inbound =
            classify(r#"{"jsonrpc":"2.0","method":"turn/completed","params":{"turn":{}}}"#)
                .unwrap();
        assert!(matches!(
            inbound,
            Inbound::Notification { method, .. } if method == "turn/completed"
        ));
    }

    #[test]
    fn classifies_success_and_error_responses() {
        let ok = classify(r#"{"jsonrpc":"2.0","id":3,"result":{"threadId":"t"}}"#).unwrap();
        assert!(matches!(ok, Inbound::Response { id: 3, result: Ok(_) }));

        let err =
            classify(r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32000,"message":"nope"}}"#)
                .unwrap();
        match err {
            Inbound::Response { id: 4, result } => {
                assert_eq!(result.unwrap_err().message, "nope");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_shapeless_message() {
        assert!(classify(r#"{"jsonrpc":"2.0"}"#).is_err());
    }
}
