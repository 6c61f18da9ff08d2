//! 错误类型
//! Error types for the analysis pipeline.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for analysis operations.
pub type PipelineResult<T> = Result<T, AnalysisError>;

/// Which input artifact is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Video,
    Model,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputKind::Video => f.write_str("input video"),
            InputKind::Model => f.write_str("model file"),
        }
    }
}

/// Per-frame processing stage, recorded on `FrameProcessing` failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    Read,
    Detect,
    Track,
    Write,
}

impl fmt::Display for FrameStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameStage::Read => "read",
            FrameStage::Detect => "detect",
            FrameStage::Track => "track",
            FrameStage::Write => "write",
        };
        f.write_str(name)
    }
}

/// Errors raised by a video backend (decoder or encoder).
#[derive(Debug, Error)]
pub enum VideoError {
    #[error("failed to open video source {}: {message}", path.display())]
    OpenSource { path: PathBuf, message: String },

    #[error("failed to open video writer {} with codec {codec}: {message}", path.display())]
    OpenSink {
        path: PathBuf,
        codec: String,
        message: String,
    },

    #[error("failed to read frame: {0}")]
    Read(String),

    #[error("failed to write frame: {0}")]
    Write(String),

    #[error("failed to release video writer: {0}")]
    Release(String),

    #[error("frame is {actual_width}x{actual_height}, writer expects {width}x{height}")]
    FrameSize {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },
}

/// Errors that can occur while analysing a match video.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("{kind} not found: {}", path.display())]
    InputMissing { kind: InputKind, path: PathBuf },

    #[error("failed to load detector model: {0}")]
    ModelLoad(String),

    #[error("invalid video: {0}")]
    InvalidVideo(String),

    #[error("no writable codec for {}; tried {}", path.display(), tried.join(", "))]
    NoWritableCodec { path: PathBuf, tried: Vec<String> },

    #[error("frame {frame} failed during {stage}: {source}")]
    FrameProcessing {
        frame: u64,
        stage: FrameStage,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to persist statistics to {}: {message}", path.display())]
    StatsPersist { path: PathBuf, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("analysis cancelled before frame {frame}")]
    Cancelled { frame: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable error kind, used as `exc_type` in job failure payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputMissing,
    ModelLoad,
    InvalidVideo,
    NoWritableCodec,
    FrameProcessing,
    StatsPersist,
    Config,
    Cancelled,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InputMissing => "InputMissingError",
            ErrorKind::ModelLoad => "ModelLoadError",
            ErrorKind::InvalidVideo => "InvalidVideoError",
            ErrorKind::NoWritableCodec => "NoWritableCodecError",
            ErrorKind::FrameProcessing => "FrameProcessingError",
            ErrorKind::StatsPersist => "StatsPersistError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Cancelled => "CancelledError",
            ErrorKind::Io => "IoError",
        }
    }

    /// Whether the run must be considered failed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorKind::StatsPersist)
    }
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::InputMissing { .. } => ErrorKind::InputMissing,
            AnalysisError::ModelLoad(_) => ErrorKind::ModelLoad,
            AnalysisError::InvalidVideo(_) => ErrorKind::InvalidVideo,
            AnalysisError::NoWritableCodec { .. } => ErrorKind::NoWritableCodec,
            AnalysisError::FrameProcessing { .. } => ErrorKind::FrameProcessing,
            AnalysisError::StatsPersist { .. } => ErrorKind::StatsPersist,
            AnalysisError::Config(_) => ErrorKind::Config,
            AnalysisError::Cancelled { .. } => ErrorKind::Cancelled,
            AnalysisError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn input_missing(kind: InputKind, path: impl Into<PathBuf>) -> Self {
        Self::InputMissing {
            kind,
            path: path.into(),
        }
    }

    pub fn model_load(message: impl Into<String>) -> Self {
        Self::ModelLoad(message.into())
    }

    pub fn invalid_video(message: impl Into<String>) -> Self {
        Self::InvalidVideo(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Wrap a stage failure with the frame it happened on.
    pub fn frame(
        frame: u64,
        stage: FrameStage,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::FrameProcessing {
            frame,
            stage,
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        let err = AnalysisError::input_missing(InputKind::Model, "models/best.onnx");
        assert_eq!(err.kind().as_str(), "InputMissingError");
        assert!(err.to_string().contains("model file not found"));

        let err = AnalysisError::NoWritableCodec {
            path: PathBuf::from("out.mp4"),
            tried: vec!["H264/mp4".into(), "XVID/avi".into()],
        };
        assert_eq!(err.kind(), ErrorKind::NoWritableCodec);
        assert!(err.to_string().contains("H264/mp4, XVID/avi"));
    }

    #[test]
    fn test_frame_error_keeps_source() {
        let err = AnalysisError::frame(7, FrameStage::Write, VideoError::Write("disk full".into()));
        assert_eq!(err.kind(), ErrorKind::FrameProcessing);
        assert!(err.to_string().starts_with("frame 7 failed during write"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("failed to write frame: disk full"));
    }

    #[test]
    fn test_only_stats_persist_is_soft() {
        assert!(!ErrorKind::StatsPersist.is_fatal());
        assert!(ErrorKind::InvalidVideo.is_fatal());
        assert!(ErrorKind::Cancelled.is_fatal());
    }
}
