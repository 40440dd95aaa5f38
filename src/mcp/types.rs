use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<JsonRpcId>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 ID (string or number; absent for notifications)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    String(String),
    Number(i64),
}

impl From<JsonRpcId> for Value {
    fn from(id: JsonRpcId) -> Self {
        match id {
            JsonRpcId::String(s) => Value::String(s),
            JsonRpcId::Number(n) => Value::Number(n.into()),
        }
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(flatten)]
    pub payload: JsonRpcResponsePayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JsonRpcResponsePayload {
    Result { result: Value },
    Error { error: JsonRpcError },
}

/// JSON-RPC 2.0 error
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// MCP Initialize response
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Value,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// MCP Tool definition
#[derive(Debug, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// MCP Tools/List response
#[derive(Debug, Serialize)]
pub struct ToolsListResult {
    pub tools: Vec<Tool>,
}

/// MCP Tools/Call request parameters
#[derive(Debug, Deserialize)]
pub struct ToolsCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// MCP Tools/Call response
#[derive(Debug, Serialize)]
pub struct ToolsCallResult {
    pub content: Vec<ContentItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolsCallResult {
    pub fn text(text: String) -> Self {
        Self {
            content: vec![ContentItem {
                content_type: "text".to_string(),
                text,
            }],
            is_error: None,
        }
    }

    pub fn error(text: String) -> Self {
        Self {
            content: vec![ContentItem {
                content_type: "text".to_string(),
                text,
            }],
            is_error: Some(true),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

/// JSON-RPC error codes
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parse() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;
        let request: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.method, "tools/list");
        assert!(matches!(request.id, Some(JsonRpcId::Number(1))));
        assert!(request.params.is_none());
    }

    #[test]
    fn test_notification_has_no_id() {
        let raw = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let request: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert!(request.id.is_none());
    }

    #[test]
    fn test_response_payload_shapes() {
        let ok = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Value::from(1),
            payload: JsonRpcResponsePayload::Result {
                result: serde_json::json!({"ok": true}),
            },
        };
        let json = serde_json::to_string(&ok).unwrap();
        assert!(json.contains("\"result\""));
        assert!(!json.contains("\"error\""));

        let err = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Value::from("abc"),
            payload: JsonRpcResponsePayload::Error {
                error: JsonRpcError {
                    code: error_codes::METHOD_NOT_FOUND,
                    message: "no such method".to_string(),
                    data: None,
                },
            },
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"error\""));
        assert!(json.contains("-32601"));
    }

    #[test]
    fn test_tool_call_result_helpers() {
        let ok = ToolsCallResult::text("done".to_string());
        assert!(ok.is_error.is_none());
        let err = ToolsCallResult::error("boom".to_string());
        assert_eq!(err.is_error, Some(true));
    }
}
