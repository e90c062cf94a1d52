//! 模型后端接口
//! 把本地模型视为不透明的文本补全能力，生命周期管理只依赖这里的契约

use crate::config::ModelConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 聊天消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// 采样参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    pub stop_sequences: Vec<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 1024,
            stop_sequences: Vec::new(),
        }
    }
}

/// 补全请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub options: CompletionOptions,
}

/// 补全结果，`success == false` 表示后端自身报告失败
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub success: bool,
    pub response: String,
}

/// 已创建的模型句柄
///
/// 不假定实现线程安全，生命周期管理会串行化补全调用。
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// 下载/准备模型，`on_progress` 接收 0..=1 的进度
    async fn download(&self, on_progress: &(dyn Fn(f64) + Send + Sync)) -> Result<()>;

    async fn init(&self) -> Result<()>;

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResult>;

    async fn destroy(&self) -> Result<()>;
}

/// 平台能力探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Available,
    Unavailable { reason: String },
}

impl Capability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// 模型运行时：负责探测后端是否存在，并按配置构造句柄
pub trait ModelRuntime: Send + Sync {
    /// 探测本地是否具备模型能力，不得返回错误
    fn probe(&self) -> Capability;

    /// 按配置的上下文长度构造句柄
    fn create_handle(&self, config: &ModelConfig) -> Result<Arc<dyn ModelBackend>>;
}

/// 没有任何后端的运行时，始终进入降级模式
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackend;

impl ModelRuntime for NoBackend {
    fn probe(&self) -> Capability {
        Capability::Unavailable {
            reason: "no model runtime compiled in".to_string(),
        }
    }

    fn create_handle(&self, _config: &ModelConfig) -> Result<Arc<dyn ModelBackend>> {
        anyhow::bail!("no model runtime compiled in")
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => f.write_str("available"),
            Self::Unavailable { reason } => write!(f, "unavailable ({reason})"),
        }
    }
}
