//! Custom error types for promptshift.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the promptshift library.
#[derive(Error, Debug)]
pub enum Error {
    /// The input path does not name a readable file.
    #[error("input file not found: {}", path.display())]
    InputNotFound { path: PathBuf },

    /// The input file exists but could not be decoded as an image.
    #[error("failed to decode image from {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {}: {source}", path.display())]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Image dimensions are not supported.
    #[error("unsupported image dimensions {width}x{height}: {reason}")]
    UnsupportedDimensions {
        width: u32,
        height: u32,
        reason: String,
    },

    /// Failed to download a model file.
    #[error("failed to download model {name}: {source}")]
    ModelDownload {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    /// The model registry answered with a non-success status.
    #[error("model registry returned {status} for {name}")]
    ModelStatus { name: String, status: u16 },

    /// Failed to load an ONNX model.
    #[error("failed to load ONNX model {name}: {source}")]
    ModelLoad {
        name: String,
        #[source]
        source: ort::Error,
    },

    /// A model loaded but does not have the inputs the pipeline needs.
    #[error("model {name} is incompatible: {reason}")]
    IncompatibleModel { name: String, reason: String },

    /// Failed to load or apply the prompt tokenizer.
    #[error("tokenizer error: {reason}")]
    Tokenizer { reason: String },

    /// Model inference failed.
    #[error("model inference failed: {source}")]
    Inference {
        #[source]
        source: ort::Error,
    },

    /// Failed to create cache directory.
    #[error("failed to create cache directory {}: {source}", path.display())]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
}

/// Coarse failure classes reported to callers of the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Input path missing or unreadable.
    InputNotFound,
    /// Input exists but is not a decodable image.
    Decode,
    /// Conditioning model, base pipeline or tokenizer could not be fetched or initialized.
    ModelLoad,
    /// Anything else during preprocessing, generation or saving.
    Inference,
}

impl Error {
    /// Classify this error into one of the runner's failure classes.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::InputNotFound { .. } => FailureKind::InputNotFound,
            Self::Decode { .. } => FailureKind::Decode,
            Self::ModelDownload { .. }
            | Self::ModelStatus { .. }
            | Self::ModelLoad { .. }
            | Self::IncompatibleModel { .. }
            | Self::Tokenizer { .. }
            | Self::CacheDir { .. } => FailureKind::ModelLoad,
            Self::ImageSave { .. }
            | Self::UnsupportedDimensions { .. }
            | Self::Inference { .. }
            | Self::InvalidParameter { .. }
            | Self::Io(_)
            | Self::ShapeMismatch { .. } => FailureKind::Inference,
        }
    }
}

/// Result type alias for promptshift operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_errors_classify_as_model_load() {
        let err = Error::ModelStatus {
            name: "unet/model.onnx".to_string(),
            status: 404,
        };
        assert_eq!(err.kind(), FailureKind::ModelLoad);

        let err = Error::IncompatibleModel {
            name: "unet/model.onnx".to_string(),
            reason: "no ControlNet residual inputs".to_string(),
        };
        assert_eq!(err.kind(), FailureKind::ModelLoad);

        let err = Error::Tokenizer {
            reason: "missing vocab".to_string(),
        };
        assert_eq!(err.kind(), FailureKind::ModelLoad);
    }

    #[test]
    fn test_catch_all_is_inference() {
        let err = Error::ShapeMismatch {
            expected: "4D tensor".to_string(),
            actual: "2D tensor".to_string(),
        };
        assert_eq!(err.kind(), FailureKind::Inference);
        assert_eq!(
            Error::Io(std::io::Error::other("disk full")).kind(),
            FailureKind::Inference
        );
    }

    #[test]
    fn test_input_not_found_message_names_path() {
        let err = Error::InputNotFound {
            path: PathBuf::from("/tmp/missing.png"),
        };
        assert_eq!(err.kind(), FailureKind::InputNotFound);
        assert!(err.to_string().contains("/tmp/missing.png"));
    }
}
