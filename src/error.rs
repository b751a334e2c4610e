use serde::Serialize;
use thiserror::Error;

/// Error codes reported to the host through the `error` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    Unsupported,
    InvalidArgument,
    DecodeError,
    EncodeError,
    GenericError,
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("{0}")]
    Generic(String),
}

impl CodecError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CodecError::Unsupported(_) => ErrorCode::Unsupported,
            CodecError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            CodecError::Decode(_) => ErrorCode::DecodeError,
            CodecError::Encode(_) => ErrorCode::EncodeError,
            CodecError::Generic(_) => ErrorCode::GenericError,
        }
    }
}

/// Failures reported by the hardware codec service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    #[error("hardware codec service unavailable")]
    Unavailable,

    #[error("failed to create codec for {0}")]
    Create(String),

    #[error("codec failed to start")]
    Start,

    #[error("native conversion failed: {0}")]
    Convert(String),
}

/// Failures while turning a raw hardware buffer into planes (or back).
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("{plane} plane needs {needed} bytes but the buffer holds {actual}")]
    ShortBuffer {
        plane: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("plane allocation failed: {0}")]
    Allocation(String),

    #[error(transparent)]
    Native(#[from] HalError),
}
