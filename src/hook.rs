//! Pipeline integration seams and the rejection payload.
//!
//! The limiter plugs into any middleware chain that can expose a caller
//! address, a response-injection point, and a "continue pipeline"
//! continuation. The two traits here are the only contract the host
//! framework has to satisfy.

use serde::{Deserialize, Serialize};

/// HTTP status set by the default exceeded handler.
pub const HTTP_TOO_MANY_REQUESTS: u16 = 429;

/// Stable error kind carried in the default rejection payload.
pub const RATE_LIMIT_ERROR_TYPE: &str = "rate_limit_error";

/// Message carried in the default rejection payload.
pub const RATE_LIMIT_MESSAGE: &str = "Too many requests, please try again later";

/// Read-only view of an inbound request.
pub trait RequestMeta: Send + Sync {
    /// Remote network address of the caller.
    fn remote_addr(&self) -> String;

    /// Authenticated user id, when the host framework has established one.
    fn user_id(&self) -> Option<String> {
        None
    }
}

/// Write access to the host framework's response.
pub trait ResponseWriter {
    /// Set the HTTP status code.
    fn set_status(&mut self, status: u16);

    /// Set a structured JSON body.
    fn set_json_body(&mut self, body: serde_json::Value);
}

/// The default rejection payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    /// Error detail.
    pub error: RejectionDetail,
}

/// Error detail inside a rejection payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionDetail {
    /// Stable error kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl RejectionBody {
    /// Payload for a quota-exhausted rejection.
    pub fn too_many_requests() -> Self {
        Self {
            error: RejectionDetail {
                kind: RATE_LIMIT_ERROR_TYPE.to_string(),
                message: RATE_LIMIT_MESSAGE.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_body_shape() {
        let body = RejectionBody::too_many_requests();
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(value["error"]["type"], "rate_limit_error");
        assert_eq!(
            value["error"]["message"],
            "Too many requests, please try again later"
        );
    }

    #[test]
    fn test_rejection_body_round_trip() {
        let body = RejectionBody::too_many_requests();
        let json = serde_json::to_string(&body).unwrap();
        let parsed: RejectionBody = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, body);
    }
}
