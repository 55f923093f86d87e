//! Uniform action envelope
//!
//! Every action returns the same shape: `{success: true, ...payload}` or
//! `{success: false, error, details?}`. A rejection caused by a canceled
//! request gets `{success: false, canceled: true, message}` so callers can
//! tell it apart from retryable errors. HTTP status mirrors the error class
//! but the payload shape never varies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{CallbackDisposition, RebalanceRequest};
use crate::engine::ActionOutcome;
use crate::error::RebalanceError;

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Set on analysis-completed: whether the callback was applied or
    /// discarded as a duplicate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RebalanceRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set on worker and synthesis failures worth re-running via the
    /// retry action
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canceled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Envelope {
    fn empty(success: bool) -> Self {
        Self {
            success,
            request_id: None,
            status: None,
            applied: None,
            request: None,
            error: None,
            retryable: None,
            details: None,
            canceled: None,
            message: None,
        }
    }

    pub fn ok(outcome: &ActionOutcome) -> Self {
        Self {
            request_id: Some(outcome.request_id),
            status: Some(outcome.status.to_string()),
            applied: outcome
                .disposition
                .map(|d| d == CallbackDisposition::Applied),
            ..Self::empty(true)
        }
    }

    pub fn with_request(request: RebalanceRequest) -> Self {
        Self {
            request_id: Some(request.id),
            status: Some(request.status.to_string()),
            request: Some(request),
            ..Self::empty(true)
        }
    }
}

/// Transport wrapper: carries the HTTP status alongside the envelope
pub struct ApiResult(pub Result<Envelope, RebalanceError>);

fn error_status(err: &RebalanceError) -> StatusCode {
    match err {
        RebalanceError::Validation(_) | RebalanceError::Json(_) => StatusCode::BAD_REQUEST,
        RebalanceError::Configuration(_) => StatusCode::FORBIDDEN,
        RebalanceError::RequestNotFound(_) => StatusCode::NOT_FOUND,
        RebalanceError::InvalidState { .. }
        | RebalanceError::InvalidStateTransition { .. }
        | RebalanceError::Canceled(_) => StatusCode::CONFLICT,
        RebalanceError::ExternalWorker(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiResult {
    fn into_response(self) -> Response {
        match self.0 {
            Ok(envelope) => (StatusCode::OK, Json(envelope)).into_response(),
            Err(RebalanceError::Canceled(message)) => {
                let envelope = Envelope {
                    canceled: Some(true),
                    message: Some(message),
                    ..Envelope::empty(false)
                };
                (StatusCode::CONFLICT, Json(envelope)).into_response()
            }
            Err(err) => {
                let envelope = Envelope {
                    error: Some(err.to_string()),
                    retryable: err.is_retryable().then_some(true),
                    ..Envelope::empty(false)
                };
                (error_status(&err), Json(envelope)).into_response()
            }
        }
    }
}
