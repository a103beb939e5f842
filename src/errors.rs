use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("camera not found: {id}")]
    UnknownCamera { id: String },

    #[error("camera with ID {id} already exists")]
    DuplicateId { id: String },

    #[error("camera is disabled: {id}")]
    Disabled { id: String },

    #[error("stream not found for camera: {id}")]
    NotRunning { id: String },

    #[error("{message}")]
    BadInput { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl StreamError {
    pub fn unknown_camera(id: impl Into<String>) -> Self {
        Self::UnknownCamera { id: id.into() }
    }

    pub fn duplicate_id(id: impl Into<String>) -> Self {
        Self::DuplicateId { id: id.into() }
    }

    pub fn disabled(id: impl Into<String>) -> Self {
        Self::Disabled { id: id.into() }
    }

    pub fn not_running(id: impl Into<String>) -> Self {
        Self::NotRunning { id: id.into() }
    }

    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::BadInput { message: message.into() }
    }

    /// Status code this error maps to at the HTTP boundary.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::BadInput { .. } | Self::DuplicateId { .. } | Self::Disabled { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::UnknownCamera { .. } | Self::NotRunning { .. } => StatusCode::NOT_FOUND,
            Self::Io { .. } | Self::Json { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
