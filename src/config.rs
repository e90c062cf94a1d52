//! 配置
//! 模型与管线配置，支持 JSON 文件与环境变量覆盖

use crate::error::{Error, Result};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "FACTDECK_CONFIG";
pub const CONTEXT_SIZE_ENV: &str = "FACTDECK_CONTEXT_SIZE";
pub const PRELOAD_MODEL_ENV: &str = "FACTDECK_PRELOAD_MODEL";
pub const MODEL_URL_ENV: &str = "FACTDECK_MODEL_URL";
pub const SERVER_BINARY_ENV: &str = "FACTDECK_SERVER_BINARY";

/// 默认模型文件名
pub const DEFAULT_MODEL_FILE: &str = "qwen2.5-1.5b-instruct.Q4_K_M.gguf";

/// 模型配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    #[serde(alias = "contextSize")]
    pub context_size: u32,
    /// 初始化时是否先下载模型
    #[serde(alias = "preloadModel")]
    pub preload_model: bool,
    #[serde(alias = "modelUrl")]
    pub model_url: Option<String>,
    #[serde(alias = "modelPath")]
    pub model_path: PathBuf,
    /// llama-server 可执行文件，缺省时按平台在 sidecars 目录查找
    #[serde(alias = "serverBinary")]
    pub server_binary: Option<PathBuf>,
    pub port: u16,
    pub gpu_layers: i32,
    pub threads: u32,
    pub batch_size: u32,
    pub use_flash_attn: bool,
    pub completion_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            context_size: 4096,
            preload_model: false,
            model_url: None,
            model_path: utils::get_models_dir().join(DEFAULT_MODEL_FILE),
            server_binary: None,
            port: 8080,
            gpu_layers: -1,
            threads: 8,
            batch_size: 512,
            use_flash_attn: true,
            completion_timeout_secs: 120,
        }
    }
}

impl ModelConfig {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs.max(1))
    }
}

/// 抽取与出题配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// 单个分块的最大字符数
    pub chunk_size: usize,
    /// 降级模式下最多返回的事实数
    pub fallback_fact_cap: usize,
    /// 单次出题最多使用的事实数
    pub quiz_batch_size: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            chunk_size: 6000,
            fallback_fact_cap: 120,
            quiz_batch_size: 8,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub extraction: ExtractionConfig,
    pub database_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            extraction: ExtractionConfig::default(),
            database_path: utils::get_database_path(),
        }
    }
}

impl AppConfig {
    /// 从 JSON 文件加载
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 读取 `FACTDECK_CONFIG` 指向的文件（若有），再叠加环境变量
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(CONTEXT_SIZE_ENV) {
            self.model.context_size = value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{CONTEXT_SIZE_ENV}={value}")))?;
        }
        if let Some(value) = lookup(PRELOAD_MODEL_ENV) {
            self.model.preload_model = matches!(
                value.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(value) = lookup(MODEL_URL_ENV) {
            self.model.model_url = Some(value);
        }
        if let Some(value) = lookup(SERVER_BINARY_ENV) {
            self.model.server_binary = Some(PathBuf::from(value));
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.context_size == 0 {
            return Err(Error::Config("context_size must be positive".into()));
        }
        if self.extraction.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.extraction.quiz_batch_size == 0 {
            return Err(Error::Config("quiz_batch_size must be positive".into()));
        }
        Ok(())
    }
}
