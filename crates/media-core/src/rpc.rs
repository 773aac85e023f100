//! JSON request dispatcher for out-of-process relay nodes
//!
//! Requests look like `{"id": 1, "method": "rtp.handleSDP", "params": {...}}`
//! and carry the same parameters as [`RelayManager::handle_sdp`]. The carrier
//! of these JSON documents is up to the embedding process.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{MediaError, Result};
use crate::manager::RelayManager;
use crate::session::{RequestType, SdpAttributes, SignalingAddresses};

pub const METHOD_HANDLE_SDP: &str = "rtp.handleSDP";
pub const METHOD_REMOVE_SESSION: &str = "rtp.removeSession";

#[derive(Debug, Clone, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Parameters of `rtp.handleSDP`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleSdpParams {
    #[serde(default)]
    pub log_id: String,
    pub session_id: String,
    #[serde(flatten)]
    pub addresses: SignalingAddresses,
    pub request_type: RequestType,
    pub sdp: String,
    #[serde(default)]
    pub attributes: SdpAttributes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveSessionParams {
    pub session_id: String,
}

pub struct RpcDispatcher {
    manager: Arc<RelayManager>,
}

impl RpcDispatcher {
    pub fn new(manager: Arc<RelayManager>) -> Self {
        Self { manager }
    }

    /// Handle one JSON document and produce the JSON reply
    pub fn dispatch(&self, request: &str) -> String {
        let reply = match serde_json::from_str::<RpcRequest>(request) {
            Ok(request) => {
                let id = request.id.clone();
                match self.call(&request.method, request.params) {
                    Ok(result) => json!({ "id": id, "result": result }),
                    Err(e) => error_reply(id, &e),
                }
            }
            Err(e) => error_reply(Value::Null, &MediaError::Rpc(format!("malformed request: {e}"))),
        };
        reply.to_string()
    }

    /// Invoke `method` with already-decoded parameters
    pub fn call(&self, method: &str, params: Value) -> Result<Value> {
        debug!(method, "rpc call");
        match method {
            METHOD_HANDLE_SDP => {
                let params: HandleSdpParams = decode(params)?;
                let mut sdp = params.sdp;
                self.manager.handle_sdp(
                    &params.log_id,
                    &params.session_id,
                    &params.addresses,
                    params.request_type,
                    &mut sdp,
                    &params.attributes,
                )?;
                Ok(json!({ "sdp": sdp }))
            }
            METHOD_REMOVE_SESSION => {
                let params: RemoveSessionParams = decode(params)?;
                let removed = self.manager.remove_session(&params.session_id);
                Ok(json!({ "removed": removed }))
            }
            other => {
                warn!(method = other, "unknown rpc method");
                Err(MediaError::Rpc(format!("unknown method {other}")))
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| MediaError::Rpc(format!("invalid params: {e}")))
}

fn error_reply(id: Value, error: &MediaError) -> Value {
    let kind = match error {
        MediaError::BindError { .. } => "BindError",
        MediaError::TooManySessions { .. } => "TooManySessions",
        MediaError::SessionNotFound(_) => "SessionNotFound",
        MediaError::RelayUnavailable(_) => "RelayUnavailable",
        MediaError::ProtocolViolation(_) => "ProtocolViolation",
        MediaError::Rpc(_) => "Rpc",
        MediaError::Io(_) => "Io",
    };
    json!({ "id": id, "error": { "kind": kind, "message": error.to_string() } })
}
