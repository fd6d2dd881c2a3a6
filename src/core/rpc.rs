use crate::utils::error::{FetchError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_TOOLS_LIST: &str = "tools/list";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One JSON-RPC 2.0 message: request, notification or response.
///
/// Unknown members are kept in `extra` so a response can be written back out
/// without losing anything the server sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present_member",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// `"result": null` 仍是成功回應，只有缺少欄位才是 None
fn present_member<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl RpcMessage {
    fn empty() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Some(Value::from(id)),
            method: Some(method.into()),
            params: Some(params),
            ..Self::empty()
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id: Some(Value::from(id)),
            result: Some(result),
            ..Self::empty()
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id: Some(Value::from(id)),
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
            ..Self::empty()
        }
    }

    /// 回應（非請求）才有 id 可供對應
    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// Numeric id of a response, used for correlation.
    pub fn response_id(&self) -> Option<u64> {
        if !self.is_response() {
            return None;
        }
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// Numeric id of a request, if this is one.
    pub fn request_id(&self) -> Option<u64> {
        self.method.as_ref()?;
        self.id.as_ref().and_then(Value::as_u64)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

pub fn initialize_params(client_name: &str, client_version: &str) -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": client_name,
            "version": client_version,
        }
    })
}

pub fn tool_call_params(tool: &str, arguments: Value) -> Value {
    serde_json::json!({
        "name": tool,
        "arguments": arguments,
    })
}

/// Newline-delimited framing: one compact JSON document per line.
pub fn encode_line(message: &RpcMessage) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line(line: &str) -> Result<RpcMessage> {
    let message: RpcMessage =
        serde_json::from_str(line.trim()).map_err(|e| FetchError::TransportError {
            message: format!("malformed frame from server: {}", e),
        })?;

    if message.jsonrpc != JSONRPC_VERSION {
        return Err(FetchError::TransportError {
            message: format!("unsupported jsonrpc version '{}'", message.jsonrpc),
        });
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        let request = RpcMessage::request(
            3,
            METHOD_TOOLS_CALL,
            tool_call_params("list-trial-balance", serde_json::json!({"date": "2025-08-19"})),
        );
        let line = encode_line(&request).unwrap();

        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "list-trial-balance", "arguments": {"date": "2025-08-19"}}
            })
        );
    }

    #[test]
    fn test_notification_has_no_id() {
        let line = encode_line(&RpcMessage::notification(METHOD_INITIALIZED, None)).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
        );
    }

    #[test]
    fn test_decode_success_response_keeps_unknown_members() {
        let message = decode_line(
            r#"{"jsonrpc":"2.0","id":1,"result":{"content":[{"type":"text","text":"..."}]},"_meta":{"trace":"x"}}"#,
        )
        .unwrap();

        assert_eq!(message.response_id(), Some(1));
        assert_eq!(
            message.result,
            Some(serde_json::json!({"content":[{"type":"text","text":"..."}]}))
        );
        assert_eq!(
            message.to_value().unwrap(),
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"content": [{"type": "text", "text": "..."}]},
                "_meta": {"trace": "x"}
            })
        );
    }

    #[test]
    fn test_decode_error_response() {
        let message = decode_line(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"insufficient scope"}}"#,
        )
        .unwrap();
        let error = message.error.clone().unwrap();
        assert_eq!(message.response_id(), Some(1));
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "insufficient scope");
    }

    #[test]
    fn test_null_result_is_still_a_response() {
        let message = decode_line(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert_eq!(message.result, Some(Value::Null));
        assert_eq!(message.response_id(), Some(1));
        assert_eq!(
            message.to_value().unwrap(),
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": null})
        );

        let notification =
            decode_line(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#).unwrap();
        assert_eq!(notification.result, None);
    }

    #[test]
    fn test_server_request_is_not_a_response() {
        let message =
            decode_line(r#"{"jsonrpc":"2.0","id":7,"method":"ping","params":{}}"#).unwrap();
        assert_eq!(message.response_id(), None);
        assert_eq!(message.request_id(), Some(7));
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(matches!(
            decode_line("npm WARN exec The following package was not found"),
            Err(FetchError::TransportError { .. })
        ));
        assert!(matches!(
            decode_line(r#"{"jsonrpc":"1.0","id":1,"result":{}}"#),
            Err(FetchError::TransportError { .. })
        ));
    }
}
