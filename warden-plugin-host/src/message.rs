//! Wire protocol between the host and an isolation context.
//!
//! Every message is `{id, type, payload, timestamp}`. Requests carry a new
//! correlation id; replies (`response` / `error`) reuse the id of the
//! request they answer.

use crate::capability::Capability;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use warden_storage::StorageError;
use warden_types::{CorrelationId, PluginId, UnixMillis, now_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Execute,
    ApiCall,
    Response,
    Error,
    PermissionRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: CorrelationId,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: UnixMillis,
}

impl Message {
    fn new(id: CorrelationId, kind: MessageType, payload: Value) -> Self {
        Self {
            id,
            kind,
            payload,
            timestamp: now_millis(),
        }
    }

    fn request<T: Serialize>(kind: MessageType, payload: &T) -> serde_json::Result<Self> {
        Ok(Self::new(CorrelationId::new(), kind, serde_json::to_value(payload)?))
    }

    pub fn execute(payload: &ExecutePayload) -> serde_json::Result<Self> {
        Self::request(MessageType::Execute, payload)
    }

    pub fn api_call(payload: &ApiCallPayload) -> serde_json::Result<Self> {
        Self::request(MessageType::ApiCall, payload)
    }

    pub fn permission_request(payload: &PermissionRequestPayload) -> serde_json::Result<Self> {
        Self::request(MessageType::PermissionRequest, payload)
    }

    /// A successful reply to request `id`.
    pub fn response(id: CorrelationId, value: Value) -> Self {
        Self::new(id, MessageType::Response, value)
    }

    /// A failed reply to request `id`.
    pub fn error(id: CorrelationId, error: &ErrorPayload) -> Self {
        let payload = serde_json::to_value(error).unwrap_or_else(|_| {
            serde_json::json!({"code": error.code, "message": error.message})
        });
        Self::new(id, MessageType::Error, payload)
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, MessageType::Response | MessageType::Error)
    }

    /// Decodes the payload into its typed form.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.payload)
    }

    /// Reads a reply as `Ok(value)` for `response` or `Err(payload)` for `error`.
    pub fn into_reply(self) -> Result<Value, ErrorPayload> {
        match self.kind {
            MessageType::Response => Ok(self.payload),
            MessageType::Error => Err(ErrorPayload::deserialize(&self.payload).unwrap_or_else(
                |e| ErrorPayload::new(ErrorCode::InvalidArguments, format!("malformed error reply: {e}")),
            )),
            other => Err(ErrorPayload::new(
                ErrorCode::InvalidArguments,
                format!("expected a reply, got {other:?}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    pub code: String,
    pub permissions: Vec<Capability>,
    pub plugin_id: PluginId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallPayload {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Justification shown to the user if this call needs consent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequestPayload {
    pub capability: Capability,
    #[serde(default)]
    pub reason: String,
}

/// Machine-readable error category carried by `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    QuotaExceeded,
    AuthenticationFailure,
    ExecutionTimeout,
    SandboxFaulted,
    PermissionDenied,
    NetworkNotPermitted,
    NetworkError,
    UnknownMethod,
    InvalidArguments,
    StorageError,
    Unavailable,
    Terminated,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaExceeded => "quota-exceeded",
            Self::AuthenticationFailure => "authentication-failure",
            Self::ExecutionTimeout => "execution-timeout",
            Self::SandboxFaulted => "sandbox-faulted",
            Self::PermissionDenied => "permission-denied",
            Self::NetworkNotPermitted => "network-not-permitted",
            Self::NetworkError => "network-error",
            Self::UnknownMethod => "unknown-method",
            Self::InvalidArguments => "invalid-arguments",
            Self::StorageError => "storage-error",
            Self::Unavailable => "unavailable",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed body of an `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    /// Structured context, e.g. which capability or which quota limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArguments, message)
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<&StorageError> for ErrorPayload {
    fn from(err: &StorageError) -> Self {
        match err {
            StorageError::QuotaExceeded { limit, .. } => {
                Self::new(ErrorCode::QuotaExceeded, err.to_string())
                    .with_detail(serde_json::to_value(limit).unwrap_or(Value::Null))
            }
            StorageError::AuthenticationFailure { key, .. } => {
                Self::new(ErrorCode::AuthenticationFailure, err.to_string())
                    .with_detail(serde_json::json!({ "key": key }))
            }
            StorageError::InvalidKey { .. } => Self::new(ErrorCode::InvalidArguments, err.to_string()),
            _ => Self::new(ErrorCode::StorageError, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_uses_kebab_case_type() {
        let msg = Message::api_call(&ApiCallPayload {
            method: "storage.get".into(),
            args: vec![json!("k")],
            reason: None,
        })
        .unwrap();
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["type"], "api-call");
        assert_eq!(wire["payload"]["method"], "storage.get");
        assert!(wire["payload"].get("reason").is_none());
        assert!(wire["id"].is_string());
        assert!(wire["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn execute_payload_is_camel_case() {
        let msg = Message::execute(&ExecutePayload {
            code: "return 1".into(),
            permissions: vec![Capability::Storage, Capability::Logger],
            plugin_id: PluginId::new("demo").unwrap(),
        })
        .unwrap();
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["type"], "execute");
        assert_eq!(wire["payload"]["pluginId"], "demo");
        assert_eq!(wire["payload"]["permissions"], json!(["storage", "logger"]));
    }

    #[test]
    fn replies_reuse_request_id() {
        let request = Message::permission_request(&PermissionRequestPayload {
            capability: Capability::Network,
            reason: "sync feeds".into(),
        })
        .unwrap();
        let reply = Message::response(request.id, json!({"granted": true}));
        assert_eq!(reply.id, request.id);
        assert!(reply.is_reply());
        assert!(!request.is_reply());
    }

    #[test]
    fn error_reply_decodes_to_payload() {
        let id = CorrelationId::new();
        let payload = ErrorPayload::new(ErrorCode::PermissionDenied, "no")
            .with_detail(json!({"capability": "network"}));
        let msg = Message::error(id, &payload);
        assert_eq!(msg.payload["code"], "permission-denied");
        assert_eq!(msg.into_reply().unwrap_err(), payload);
    }

    #[test]
    fn quota_error_names_the_limit() {
        let err = StorageError::QuotaExceeded {
            plugin_id: "p".into(),
            limit: warden_storage::QuotaLimit::Keys {
                max_keys: 3,
                current_keys: 3,
            },
        };
        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.code, ErrorCode::QuotaExceeded);
        assert_eq!(payload.detail.unwrap()["limit"], "keys");
    }
}
