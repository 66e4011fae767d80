use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not Found")]
    NotFound,

    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("Malformed message: {0}")]
    Protocol(#[from] serde_json::Error),
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Protocol(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Internal(_) | AppError::Io(_) | AppError::Watcher(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::NotFound.into_response().status(), StatusCode::NOT_FOUND);
        let malformed = serde_json::from_str::<u64>("not json").unwrap_err();
        assert_eq!(
            AppError::from(malformed).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        assert_eq!(
            AppError::from(io).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
