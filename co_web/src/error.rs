//! ABOUTME: JSON error responder mapping core errors to HTTP statuses
//! ABOUTME: Producers see validation errors; everything else is asynchronous

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use co_core::Error;
use serde_json::json;
use std::fmt;

/// API error wrapper with a stable JSON body
#[derive(Debug)]
pub struct ApiError(pub Error);

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::TemplateNotFound(_) | Error::TemplateInactive(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Request failed");
            // Internals are not leaked to producers
            HttpResponse::build(status).json(json!({ "error": "internal error" }))
        } else {
            HttpResponse::build(status).json(json!({ "error": self.0.to_string() }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError(Error::InvalidInput("x".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(Error::TemplateNotFound("t".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(Error::NotFound("n".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(Error::Database("d".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
