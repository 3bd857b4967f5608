// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// HTTP-facing error: a status code, a message, and optionally structured
/// data (e.g. the redirect hint on bandwidth rejections).
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl ToString) -> Self {
        Self {
            status,
            message: message.to_string(),
            data: None,
        }
    }

    /// 400: malformed request or auth-key replay.
    pub fn bad_request(message: impl ToString) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// 401: signature or timestamp failure.
    pub fn unauthorized(message: impl ToString) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    /// 402: requester cannot cover the escrow.
    pub fn payment_required(message: impl ToString) -> Self {
        Self::new(StatusCode::PAYMENT_REQUIRED, message)
    }

    /// 404: unknown participant.
    pub fn not_found(message: impl ToString) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// 429: bandwidth admission denied, with a hint to go elsewhere.
    pub fn too_many_requests(message: impl ToString, hint: serde_json::Value) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: message.to_string(),
            data: Some(hint),
        }
    }

    /// 502: the executor or a worker failed.
    pub fn bad_gateway(message: impl ToString) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    /// 503: no executor or worker available.
    pub fn unavailable(message: impl ToString) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl ToString) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal(format!("{value:#}"))
    }
}

impl From<inferd_chain_rpc::ChainRpcError> for ApiError {
    fn from(value: inferd_chain_rpc::ChainRpcError) -> Self {
        Self::bad_gateway(format!("chain query failed: {value}"))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (status: {})", self.message, self.status)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self.data {
            Some(data) => json!({ "error": self.message, "hint": data }),
            None => json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use crate::error::ApiError;

    #[test]
    fn statuses() {
        assert_eq!(ApiError::bad_request("x").status, StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::unauthorized("x").status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::payment_required("x").status,
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(ApiError::not_found("x").status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn response_carries_json_error_body() {
        let res = ApiError::bad_request("nope").into_response();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let ct = res.headers().get("content-type").unwrap();
        assert!(ct.to_str().unwrap().starts_with("application/json"));
    }
}
