//! Request/response envelope for the wire protocol.
//!
//! Every action is a POST carrying a versioned envelope; every reply mirrors
//! the action and request id back with either `data` or a stable error code.
//! Validation order is fixed: bearer → envelope shape → action dispatch.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::memory::service::{RequestContext, ServiceError};

pub const PROTOCOL_VERSION: &str = "mcp.v1";
pub const SERVICE_NAME: &str = "user-memory";

/// Incoming envelope, before validation.
#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    pub version: Option<String>,
    pub service: Option<String>,
    pub action: Option<String>,
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub context: RequestContext,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// An envelope that passed shape validation.
#[derive(Debug)]
pub struct ValidEnvelope {
    pub action: String,
    pub request_id: String,
    pub context: RequestContext,
    pub payload: serde_json::Value,
}

impl RequestEnvelope {
    pub fn validate(self) -> Result<ValidEnvelope, ServiceError> {
        let version = self.version.as_deref().unwrap_or("");
        if version != PROTOCOL_VERSION {
            return Err(ServiceError::InvalidRequest(format!(
                "unsupported envelope version {version:?}, expected {PROTOCOL_VERSION:?}"
            )));
        }
        let service = self.service.as_deref().unwrap_or("");
        if service != SERVICE_NAME {
            return Err(ServiceError::InvalidRequest(format!(
                "unknown service {service:?}, expected {SERVICE_NAME:?}"
            )));
        }
        let action = self
            .action
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| ServiceError::InvalidRequest("missing action".into()))?;
        let request_id = self
            .request_id
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| ServiceError::InvalidRequest("missing requestId".into()))?;

        Ok(ValidEnvelope {
            action: action.to_string(),
            request_id: request_id.to_string(),
            context: self.context,
            payload: self.payload,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ResponseMetrics {
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
}

/// Outgoing envelope.
#[derive(Debug, Serialize)]
pub struct ResponseEnvelope {
    pub version: &'static str,
    pub service: &'static str,
    pub action: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub status: &'static str,
    pub data: Option<serde_json::Value>,
    pub error: Option<ErrorBody>,
    pub metrics: ResponseMetrics,
}

impl ResponseEnvelope {
    pub fn ok(
        action: &str,
        request_id: &str,
        data: serde_json::Value,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            service: SERVICE_NAME,
            action: action.to_string(),
            request_id: request_id.to_string(),
            status: "ok",
            data: Some(data),
            error: None,
            metrics: ResponseMetrics { elapsed_ms },
        }
    }

    pub fn error(
        action: &str,
        request_id: &str,
        code: &str,
        message: &str,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            service: SERVICE_NAME,
            action: action.to_string(),
            request_id: request_id.to_string(),
            status: "error",
            data: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            }),
            metrics: ResponseMetrics { elapsed_ms },
        }
    }
}

/// HTTP status for a stable error code.
pub fn status_for_code(code: &str) -> StatusCode {
    match code {
        "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
        "INVALID_REQUEST" => StatusCode::BAD_REQUEST,
        "PAYLOAD_TOO_LARGE" => StatusCode::PAYLOAD_TOO_LARGE,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
