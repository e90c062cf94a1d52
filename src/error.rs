//! 错误类型
//! 内容生成管线的统一错误分类

use std::time::Duration;

/// 管线错误
///
/// 单个分块、单次出题或单次偏好分析内部的失败都在本地降级处理，
/// 只有管线级故障（`PipelineFatal`、`Cancelled`）会传递给调用方。
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 平台缺少模型后端，生命周期直接进入降级模式
    #[error("model backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("model not initialized")]
    ModelNotInitialized,

    #[error("model download failed: {0}")]
    DownloadFailed(String),

    #[error("completion failed: {0}")]
    CompletionFailed(String),

    #[error("completion timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    /// 所有修复候选都无法解析
    #[error("malformed model output: {0}")]
    MalformedOutput(String),

    #[error("pipeline failure: {0}")]
    PipelineFatal(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// 是否属于单次调用范围内可降级的失败
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CompletionFailed(_) | Self::Timeout(_) | Self::MalformedOutput(_)
        )
    }

    /// 日志用的简短分类名
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::ModelNotInitialized => "model_not_initialized",
            Self::DownloadFailed(_) => "download_failed",
            Self::CompletionFailed(_) => "completion_failed",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::MalformedOutput(_) => "malformed_output",
            Self::PipelineFatal(_) => "pipeline_fatal",
            Self::Storage(_) => "storage",
            Self::Json(_) => "json",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
