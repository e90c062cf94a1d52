//! Llama.cpp 推理后端
//! 以 sidecar 方式运行 llama-server，通过 HTTP 提供模型下载、补全与销毁

use crate::config::ModelConfig;
use crate::services::backend::{
    Capability, ChatMessage, CompletionRequest, CompletionResult, ModelBackend, ModelRuntime,
};
use crate::utils;
use anyhow::{Context, Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Duration;

/// ChatML 模板的默认停止符
const DEFAULT_STOP_TOKENS: [&str; 2] = ["<|im_end|>", "</s>"];

/// 等待服务器就绪的最长时间
const HEALTH_WAIT_SECS: u64 = 60;

/// Completion 请求
#[derive(Debug, Serialize)]
struct CompletionBody {
    prompt: String,
    n_predict: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    stop: Vec<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_prompt: Option<bool>,
}

/// Completion 响应
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    content: String,
}

/// 获取平台特定的二进制名称
pub fn get_platform_binary_name() -> &'static str {
    let target_os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;

    match (target_os, arch) {
        ("macos", "aarch64") => "llama-server-aarch64-apple-darwin",
        ("macos", "x86_64") => "llama-server-x86_64-apple-darwin",
        ("windows", "x86_64") => "llama-server-x86_64-pc-windows-msvc.exe",
        ("linux", "x86_64") => "llama-server-x86_64-unknown-linux-gnu",
        ("linux", "aarch64") => "llama-server-aarch64-unknown-linux-gnu",
        _ => "llama-server",
    }
}

/// 解析 sidecar 路径：优先使用配置，否则在数据目录的 sidecars 下查找
pub fn resolve_binary_path(config: &ModelConfig) -> PathBuf {
    config
        .server_binary
        .clone()
        .unwrap_or_else(|| utils::get_sidecars_dir().join(get_platform_binary_name()))
}

/// 构建 llama-server 启动参数
pub fn build_server_args(config: &ModelConfig) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        config.model_path.to_string_lossy().to_string(),
        "--host".to_string(),
        "127.0.0.1".to_string(),
        "--port".to_string(),
        config.port.to_string(),
        "--ctx-size".to_string(),
        config.context_size.to_string(),
        "--batch-size".to_string(),
        config.batch_size.to_string(),
        "--n-gpu-layers".to_string(),
        config.gpu_layers.to_string(),
        "--threads".to_string(),
        config.threads.to_string(),
        "--no-mmap".to_string(), // 禁用内存映射，避免 macOS 上的问题
    ];

    if config.use_flash_attn {
        args.push("--flash-attn".to_string());
    }

    args
}

/// 构建 ChatML 聊天提示词
pub fn build_chat_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();

    for message in messages {
        match message.role.as_str() {
            "system" | "user" | "assistant" => {
                prompt.push_str(&format!(
                    "<|im_start|>{}\n{}\n<|im_end|>\n",
                    message.role, message.content
                ));
            }
            other => log::debug!("skipping chat message with unknown role {:?}", other),
        }
    }

    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

/// llama-server 运行时
#[derive(Debug, Clone)]
pub struct LlamaRuntime {
    binary_path: PathBuf,
}

impl LlamaRuntime {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            binary_path: resolve_binary_path(config),
        }
    }

    /// 固定 sidecar 路径，忽略配置
    pub fn with_binary(path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: path.into(),
        }
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }
}

impl ModelRuntime for LlamaRuntime {
    fn probe(&self) -> Capability {
        probe_binary(&self.binary_path)
    }

    fn create_handle(&self, config: &ModelConfig) -> Result<Arc<dyn ModelBackend>> {
        if let Capability::Unavailable { reason } = probe_binary(&self.binary_path) {
            anyhow::bail!(reason);
        }
        let sidecar: Arc<dyn ModelBackend> =
            Arc::new(LlamaSidecar::new(config.clone(), self.binary_path.clone()));
        Ok(sidecar)
    }
}

fn probe_binary(binary: &Path) -> Capability {
    if binary.is_file() {
        Capability::Available
    } else {
        Capability::Unavailable {
            reason: format!("llama-server binary not found at {}", binary.display()),
        }
    }
}

/// Llama Sidecar 进程管理器
pub struct LlamaSidecar {
    config: ModelConfig,
    binary_path: PathBuf,
    child_process: Mutex<Option<Child>>,
    server_url: String,
    http_client: reqwest::Client,
}

impl LlamaSidecar {
    pub fn new(config: ModelConfig, binary_path: PathBuf) -> Self {
        let server_url = format!("http://127.0.0.1:{}", config.port);
        Self {
            config,
            binary_path,
            child_process: Mutex::new(None),
            server_url,
            http_client: reqwest::Client::new(),
        }
    }

    /// 指向已在运行的服务器
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// 健康检查
    pub async fn is_healthy(&self) -> bool {
        let url = format!("{}/health", self.server_url);

        match self.http_client.get(&url).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    /// 等待服务器健康
    pub async fn wait_for_healthy(&self, max_wait_secs: u64) -> Result<()> {
        let start = std::time::Instant::now();
        let check_interval = Duration::from_millis(500);
        let max_wait = Duration::from_secs(max_wait_secs);

        while start.elapsed() < max_wait {
            if self.is_healthy().await {
                return Ok(());
            }
            if let Some(child) = self.child_process.lock().await.as_mut() {
                if let Some(status) = child.try_wait()? {
                    anyhow::bail!("llama-server exited during startup: {status}");
                }
            }
            tokio::time::sleep(check_interval).await;
        }

        Err(Error::msg("Server health check timeout"))
    }

    async fn download_to(
        &self,
        url: &str,
        target: &Path,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()?;

        let total = response.content_length().filter(|len| *len > 0);
        let partial = target.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut downloaded: u64 = 0;
        let mut body = response.bytes_stream();

        on_progress(0.0);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("model download interrupted")?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(total) = total {
                on_progress(downloaded as f64 / total as f64);
            }
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, target).await?;
        on_progress(1.0);
        log::info!("downloaded model to {} ({} bytes)", target.display(), downloaded);
        Ok(())
    }
}

#[async_trait]
impl ModelBackend for LlamaSidecar {
    async fn download(&self, on_progress: &(dyn Fn(f64) + Send + Sync)) -> Result<()> {
        if self.config.model_path.is_file() {
            on_progress(1.0);
            return Ok(());
        }

        let url = self
            .config
            .model_url
            .as_deref()
            .context("model file missing and no model_url configured")?;

        self.download_to(url, &self.config.model_path, on_progress).await
    }

    async fn init(&self) -> Result<()> {
        if self.is_healthy().await {
            return Ok(());
        }

        if !self.config.model_path.is_file() {
            anyhow::bail!("model not found at: {}", self.config.model_path.display());
        }

        let args = build_server_args(&self.config);
        let mut command = Command::new(&self.binary_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // macOS Metal 优化
        if std::env::consts::OS == "macos" {
            command.env("METAL_DEVICE_WRAPPER_TYPE", "1");
        }

        let child = command
            .spawn()
            .with_context(|| format!("spawning {}", self.binary_path.display()))?;
        *self.child_process.lock().await = Some(child);

        self.wait_for_healthy(HEALTH_WAIT_SECS).await
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResult> {
        let url = format!("{}/completion", self.server_url);
        let options = &request.options;

        let mut stop: Vec<String> = DEFAULT_STOP_TOKENS.iter().map(|s| s.to_string()).collect();
        stop.extend(options.stop_sequences.iter().cloned());

        let body = CompletionBody {
            prompt: build_chat_prompt(&request.messages),
            n_predict: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
            stop,
            stream: false,
            cache_prompt: Some(true),
        };

        let response = self.http_client.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            log::warn!("llama-server returned {}: {}", status, text);
            return Ok(CompletionResult {
                success: false,
                response: text,
            });
        }

        let parsed = response.json::<CompletionResponse>().await?;
        Ok(CompletionResult {
            success: true,
            response: parsed.content,
        })
    }

    async fn destroy(&self) -> Result<()> {
        let mut child_guard = self.child_process.lock().await;

        if let Some(mut child) = child_guard.take() {
            child.kill().await?;
        }

        Ok(())
    }
}
