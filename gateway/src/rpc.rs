//! Minimal JSON-RPC 2.0 wire types for the conductor facade. Messages are
//! newline-delimited JSON objects over the gateway socket.

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_REQUEST: &str = "conductor.request";
pub const METHOD_RESOLVE: &str = "conductor.resolve";
pub const METHOD_STATUS: &str = "conductor.status";
pub const METHOD_HISTORY: &str = "conductor.history";

pub const NOTIFY_REQUESTED: &str = "conductor.requested";
pub const NOTIFY_RESOLVED: &str = "conductor.resolved";

pub const PARSE_ERROR_CODE: i64 = -32700;
pub const METHOD_NOT_FOUND_CODE: i64 = -32601;
pub const INVALID_PARAMS_CODE: i64 = -32602;
pub const INTERNAL_ERROR_CODE: i64 = -32603;
/// Conductor-specific: `conductor.resolve` named an id that is not pending.
pub const UNKNOWN_REQUEST_ID_CODE: i64 = -32001;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: String,
    pub id: RequestId,
    pub error: JsonRpcErrorObject,
}

/// Outgoing message from the gateway to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Error(JsonRpcError),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    pub fn response(id: RequestId, result: serde_json::Value) -> Self {
        Self::Response(JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        })
    }

    pub fn error(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self::Error(JsonRpcError {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error: JsonRpcErrorObject {
                code,
                message: message.into(),
                data: None,
            },
        })
    }

    pub fn notification(method: &str, params: serde_json::Value) -> Self {
        Self::Notification(JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: Some(params),
        })
    }
}

/// Params of `conductor.request`.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParams {
    pub kind: Option<String>,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub service: Option<String>,
    pub data_needed: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Params of `conductor.resolve`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveParams {
    pub id: Uuid,
    pub decision: String,
    pub instructions: Option<String>,
}

/// Params of `conductor.history`.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    pub limit: Option<usize>,
}
