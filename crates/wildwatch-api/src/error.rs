use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use wildwatch_core::kobo::GatewayError;
use wildwatch_core::FieldErrors;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Option<FieldErrors>,
    },
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    SyncInProgress(String),
    #[error("Kobo is unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Kobo rejected the request: {0}")]
    UpstreamRejected(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
    status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<FieldErrors>,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::SyncInProgress(_) => StatusCode::CONFLICT,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamRejected(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::Unauthorized(_) => "Unauthorized",
            Self::NotFound(_) => "NotFound",
            Self::SyncInProgress(_) => "SyncInProgress",
            Self::UpstreamUnavailable(_) => "UpstreamUnavailable",
            Self::UpstreamRejected(_) => "UpstreamRejected",
            Self::Internal(_) => "InternalError",
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::Unavailable(message) => Self::UpstreamUnavailable(message),
            GatewayError::Rejected { status, message } => {
                Self::UpstreamRejected(format!("{message} (HTTP {status})"))
            }
            GatewayError::InvalidPayload(message) => Self::UpstreamRejected(message),
        }
    }
}

impl From<wildwatch_core::Error> for AppError {
    fn from(error: wildwatch_core::Error) -> Self {
        use wildwatch_core::Error;

        match error {
            Error::Validation(details) => Self::Validation {
                message: "Submission failed validation".to_string(),
                details: Some(details),
            },
            Error::InvalidInput(message) => Self::bad_request(message),
            Error::NotFound(message) => Self::NotFound(message),
            Error::SyncInProgress(form_id) => {
                Self::SyncInProgress(format!("Sync already running for form {form_id}"))
            }
            Error::Gateway(error) => error.into(),
            other => {
                tracing::error!("Internal error: {other}");
                Self::Internal(wildwatch_core::util::sanitize(&other))
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let message = self.to_string();
        let details = match self {
            Self::Validation { details, .. } => details,
            _ => None,
        };
        let body = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                kind,
                message,
                status_code: status.as_u16(),
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Success envelope wrapping every handler payload.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    status_code: u16,
    message: String,
    data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self::with_status(StatusCode::OK, message, data)
    }

    pub fn with_status(status: StatusCode, message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            status_code: status.as_u16(),
            message: message.into(),
            data,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK);
        (status, Json(self)).into_response()
    }
}
