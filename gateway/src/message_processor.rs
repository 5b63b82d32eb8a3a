use std::sync::Arc;

use conductor_core::conductor::Conductor;
use conductor_core::conductor::GatewayRequestParams;
use conductor_core::error::ConductorErr;
use conductor_protocol::protocol::Decision;
use conductor_protocol::protocol::RequestKind;
use serde_json::Value as JsonValue;
use serde_json::json;
use tokio::sync::mpsc;

use crate::rpc::HistoryParams;
use crate::rpc::INTERNAL_ERROR_CODE;
use crate::rpc::INVALID_PARAMS_CODE;
use crate::rpc::JsonRpcMessage;
use crate::rpc::JsonRpcRequest;
use crate::rpc::METHOD_HISTORY;
use crate::rpc::METHOD_NOT_FOUND_CODE;
use crate::rpc::METHOD_REQUEST;
use crate::rpc::METHOD_RESOLVE;
use crate::rpc::METHOD_STATUS;
use crate::rpc::RequestParams;
use crate::rpc::ResolveParams;
use crate::rpc::UNKNOWN_REQUEST_ID_CODE;

type RpcError = (i64, String);

pub(crate) struct MessageProcessor {
    conductor: Arc<Conductor>,
    outgoing_tx: mpsc::Sender<JsonRpcMessage>,
    client_id: u64,
}

impl MessageProcessor {
    pub(crate) fn new(
        conductor: Arc<Conductor>,
        outgoing_tx: mpsc::Sender<JsonRpcMessage>,
        client_id: u64,
    ) -> Self {
        Self {
            conductor,
            outgoing_tx,
            client_id,
        }
    }

    /// Dispatch one request. Each request runs in its own task so a waiting
    /// `conductor.request` never blocks a `conductor.resolve` arriving on
    /// the same connection.
    pub(crate) fn process_request(&self, request: JsonRpcRequest) {
        let conductor = Arc::clone(&self.conductor);
        let outgoing_tx = self.outgoing_tx.clone();
        let client_id = self.client_id;
        tokio::spawn(async move {
            let JsonRpcRequest {
                id, method, params, ..
            } = request;
            let msg = match handle_request(conductor, client_id, &method, params).await {
                Ok(result) => JsonRpcMessage::response(id, result),
                Err((code, message)) => JsonRpcMessage::error(id, code, message),
            };
            let _ = outgoing_tx.send(msg).await;
        });
    }
}

async fn handle_request(
    conductor: Arc<Conductor>,
    client_id: u64,
    method: &str,
    params: Option<JsonValue>,
) -> Result<JsonValue, RpcError> {
    match method {
        METHOD_REQUEST => {
            let params: RequestParams = optional_params(params)?;
            let auth = conductor
                .request(GatewayRequestParams {
                    kind: params.kind.as_deref().map(parse_kind),
                    summary: params.summary,
                    url: params.url,
                    service: params.service,
                    data_needed: params.data_needed,
                    timeout_ms: params.timeout_ms,
                })
                .await
                .map_err(rpc_error)?;
            serde_json::to_value(&auth).map_err(internal)
        }
        METHOD_RESOLVE => {
            let params: ResolveParams = required_params(params)?;
            let decision = parse_decision(&params.decision).ok_or_else(|| {
                (
                    INVALID_PARAMS_CODE,
                    format!("invalid decision `{}`", params.decision),
                )
            })?;
            conductor
                .resolve(
                    params.id,
                    decision,
                    params.instructions,
                    format!("gateway:client-{client_id}"),
                )
                .await
                .map_err(rpc_error)?;
            Ok(json!({ "ok": true }))
        }
        METHOD_STATUS => {
            let status = conductor.status().await.map_err(rpc_error)?;
            serde_json::to_value(&status).map_err(internal)
        }
        METHOD_HISTORY => {
            let params: HistoryParams = optional_params(params)?;
            let history = conductor.history(params.limit).await.map_err(rpc_error)?;
            serde_json::to_value(&history).map_err(internal)
        }
        other => Err((
            METHOD_NOT_FOUND_CODE,
            format!("unknown method `{other}`"),
        )),
    }
}

fn optional_params<T: serde::de::DeserializeOwned + Default>(
    params: Option<JsonValue>,
) -> Result<T, RpcError> {
    match params {
        None => Ok(T::default()),
        Some(value) => serde_json::from_value(value)
            .map_err(|e| (INVALID_PARAMS_CODE, format!("invalid params: {e}"))),
    }
}

fn required_params<T: serde::de::DeserializeOwned>(
    params: Option<JsonValue>,
) -> Result<T, RpcError> {
    let value = params.ok_or_else(|| (INVALID_PARAMS_CODE, "missing params".to_string()))?;
    serde_json::from_value(value).map_err(|e| (INVALID_PARAMS_CODE, format!("invalid params: {e}")))
}

fn parse_kind(s: &str) -> RequestKind {
    serde_json::from_value(JsonValue::String(s.trim().to_lowercase())).unwrap_or_default()
}

fn parse_decision(s: &str) -> Option<Decision> {
    serde_json::from_value(JsonValue::String(s.trim().to_lowercase())).ok()
}

fn rpc_error(err: ConductorErr) -> RpcError {
    match &err {
        ConductorErr::UnknownRequestId(_) => (UNKNOWN_REQUEST_ID_CODE, err.to_string()),
        ConductorErr::InvalidRequest(_) => (INVALID_PARAMS_CODE, err.to_string()),
        _ => (INTERNAL_ERROR_CODE, err.to_string()),
    }
}

fn internal(err: serde_json::Error) -> RpcError {
    (INTERNAL_ERROR_CODE, err.to_string())
}
