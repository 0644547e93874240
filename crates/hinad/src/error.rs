//! HTTP error responses.

use crate::engine::EngineError;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hina_core::ClassifyError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("missing multipart field 'file'")]
    MissingFile,
    #[error("invalid upload: {message}")]
    Upload { status: StatusCode, message: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<MultipartError> for ServiceError {
    fn from(e: MultipartError) -> Self {
        ServiceError::Upload {
            status: e.status(),
            message: e.body_text(),
        }
    }
}

/// JSON body returned on error.
#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    error: String,
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::MissingFile => StatusCode::BAD_REQUEST,
            ServiceError::Upload { status, .. } => *status,
            ServiceError::Engine(EngineError::Classify(ClassifyError::Image(_))) => StatusCode::BAD_REQUEST,
            ServiceError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, %status, "request rejected");
        }

        let body = ErrorBody {
            status: "error",
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hina_core::GalleryError;
    use hina_imaging::PreprocessError;

    #[test]
    fn test_status_codes() {
        assert_eq!(ServiceError::MissingFile.status_code(), StatusCode::BAD_REQUEST);

        let decode = ServiceError::Engine(EngineError::Classify(ClassifyError::Image(
            PreprocessError::ImageDecode("bad".into()),
        )));
        assert_eq!(decode.status_code(), StatusCode::BAD_REQUEST);

        let corrupt = ServiceError::Engine(EngineError::Gallery(GalleryError::Corrupt("x".into())));
        assert_eq!(corrupt.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let gone = ServiceError::Engine(EngineError::ChannelClosed);
        assert_eq!(gone.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let big = ServiceError::Upload {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: "too big".into(),
        };
        assert_eq!(big.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
