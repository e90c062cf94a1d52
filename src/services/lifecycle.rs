//! 模型生命周期管理
//! 持有模型句柄，负责一次性初始化、下载进度上报、补全串行化与销毁

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::services::backend::{
    Capability, ChatMessage, CompletionOptions, CompletionRequest, ModelBackend, ModelRuntime,
};
use crate::services::events::{ProgressBus, ProgressEvent};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, OnceLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid think-block pattern"));

/// 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Uninitialized,
    Initializing,
    Ready,
    FallbackEnabled,
    Destroyed,
}

impl ModelState {
    /// `Ready` 与 `FallbackEnabled` 都是稳定终态
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Ready | Self::FallbackEnabled)
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::FallbackEnabled => "fallback_enabled",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// 模型生命周期管理器
///
/// 并发的 `initialize` 调用合并为一次底层尝试，其余调用者等待状态广播。
pub struct ModelLifecycle {
    runtime: Arc<dyn ModelRuntime>,
    config: ModelConfig,
    bus: ProgressBus,
    state: watch::Sender<ModelState>,
    capability: OnceLock<Capability>,
    handle: Mutex<Option<Arc<dyn ModelBackend>>>,
    completion_gate: tokio::sync::Mutex<()>,
    init_attempts: AtomicUsize,
}

impl ModelLifecycle {
    pub fn new(runtime: Arc<dyn ModelRuntime>, config: ModelConfig, bus: ProgressBus) -> Self {
        let (state, _) = watch::channel(ModelState::Uninitialized);
        Self {
            runtime,
            config,
            bus,
            state,
            capability: OnceLock::new(),
            handle: Mutex::new(None),
            completion_gate: tokio::sync::Mutex::new(()),
            init_attempts: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> ModelState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ModelState::Ready
    }

    pub fn is_fallback(&self) -> bool {
        self.state() == ModelState::FallbackEnabled
    }

    /// 订阅状态变化
    pub fn watch_state(&self) -> watch::Receiver<ModelState> {
        self.state.subscribe()
    }

    /// 已发起的底层初始化次数
    pub fn init_attempts(&self) -> usize {
        self.init_attempts.load(Ordering::SeqCst)
    }

    /// 首次初始化时探测到的平台能力
    pub fn capability(&self) -> Option<&Capability> {
        self.capability.get()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn bus(&self) -> &ProgressBus {
        &self.bus
    }

    /// 初始化模型，幂等
    ///
    /// 返回时状态必为 `Ready` 或 `FallbackEnabled`。
    pub async fn initialize(&self) -> ModelState {
        loop {
            let mut rx = self.state.subscribe();
            let current = *rx.borrow_and_update();

            match current {
                ModelState::Ready | ModelState::FallbackEnabled => return current,
                ModelState::Initializing => {
                    if rx
                        .wait_for(|state| *state != ModelState::Initializing)
                        .await
                        .is_err()
                    {
                        return self.state();
                    }
                }
                ModelState::Uninitialized | ModelState::Destroyed => {
                    let claimed = self.state.send_if_modified(|state| {
                        if matches!(*state, ModelState::Uninitialized | ModelState::Destroyed) {
                            *state = ModelState::Initializing;
                            true
                        } else {
                            false
                        }
                    });
                    if claimed {
                        return self.run_attempt().await;
                    }
                }
            }
        }
    }

    async fn run_attempt(&self) -> ModelState {
        let mut guard = AttemptGuard {
            state: &self.state,
            armed: true,
        };
        self.init_attempts.fetch_add(1, Ordering::SeqCst);
        log::info!("initializing model (context size {})", self.config.context_size);

        let outcome = match self.bring_up().await {
            Ok(handle) => {
                *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                ModelState::Ready
            }
            Err(Error::BackendUnavailable(reason)) => {
                log::info!("model backend unavailable, using fallback mode: {}", reason);
                ModelState::FallbackEnabled
            }
            Err(err) => {
                log::error!("model initialization failed ({}): {}", err.kind(), err);
                ModelState::FallbackEnabled
            }
        };

        guard.armed = false;
        self.state.send_replace(outcome);
        log::info!("model lifecycle settled: {}", outcome);
        outcome
    }

    async fn bring_up(&self) -> Result<Arc<dyn ModelBackend>> {
        let capability = self.capability.get_or_init(|| self.runtime.probe()).clone();
        if let Capability::Unavailable { reason } = capability {
            return Err(Error::BackendUnavailable(reason));
        }

        let handle = self
            .runtime
            .create_handle(&self.config)
            .map_err(|e| Error::BackendUnavailable(format!("handle construction failed: {e:#}")))?;

        if let Err(err) = self.prepare(handle.as_ref()).await {
            if let Err(cleanup) = handle.destroy().await {
                log::warn!("failed to release partially initialized model: {cleanup:#}");
            }
            return Err(err);
        }

        Ok(handle)
    }

    async fn prepare(&self, handle: &dyn ModelBackend) -> Result<()> {
        if self.config.preload_model {
            let reporter = DownloadReporter::new(self.bus.clone());
            handle
                .download(&|progress| reporter.report(progress))
                .await
                .map_err(|e| Error::DownloadFailed(format!("{e:#}")))?;
        }

        handle
            .init()
            .await
            .map_err(|e| Error::PipelineFatal(format!("model init failed: {e:#}")))
    }

    /// 释放模型句柄，之后可以重新初始化
    ///
    /// 句柄销毁失败只记录日志。
    pub async fn destroy(&self) {
        loop {
            let mut rx = self.state.subscribe();
            if rx
                .wait_for(|state| *state != ModelState::Initializing)
                .await
                .is_err()
            {
                break;
            }
            let claimed = self.state.send_if_modified(|state| {
                if *state == ModelState::Initializing {
                    false
                } else {
                    *state = ModelState::Destroyed;
                    true
                }
            });
            if claimed {
                break;
            }
        }

        // 等待正在进行的补全结束
        let _gate = self.completion_gate.lock().await;
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();

        if let Some(handle) = handle {
            match handle.destroy().await {
                Ok(()) => log::info!("model destroyed"),
                Err(err) => log::error!("model destroy failed: {err:#}"),
            }
        }
    }

    /// 运行一次补全，仅在 `Ready` 状态可用
    pub async fn run_completion(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<String> {
        self.run_completion_with_cancel(messages, options, &CancellationToken::new())
            .await
    }

    /// 运行一次补全，等待期间可被取消，超时视为普通失败
    pub async fn run_completion_with_cancel(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if self.state() != ModelState::Ready {
            return Err(Error::ModelNotInitialized);
        }
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::ModelNotInitialized)?;

        let request = CompletionRequest { messages, options };
        let timeout = self.config.completion_timeout();

        let call = async {
            let _gate = self.completion_gate.lock().await;
            tokio::time::timeout(timeout, handle.complete(&request)).await
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = call => outcome,
        };

        let result = match outcome {
            Err(_) => return Err(Error::Timeout(timeout)),
            Ok(Err(err)) => return Err(Error::CompletionFailed(format!("{err:#}"))),
            Ok(Ok(result)) => result,
        };

        if !result.success {
            return Err(Error::CompletionFailed(
                "backend reported an unsuccessful completion".to_string(),
            ));
        }

        Ok(strip_thinking(&result.response))
    }
}

/// 去掉 `<think>...</think>` 推理块
pub fn strip_thinking(text: &str) -> String {
    THINK_BLOCK.replace_all(text, "").trim().to_string()
}

/// 初始化中途被丢弃时把状态退回 `Uninitialized`，让等待者重新竞争
struct AttemptGuard<'a> {
    state: &'a watch::Sender<ModelState>,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("model initialization abandoned before completion");
            self.state.send_replace(ModelState::Uninitialized);
        }
    }
}

/// 每个整数百分比最多上报一次
struct DownloadReporter {
    bus: ProgressBus,
    last_percent: AtomicI64,
}

impl DownloadReporter {
    fn new(bus: ProgressBus) -> Self {
        Self {
            bus,
            last_percent: AtomicI64::new(-1),
        }
    }

    fn report(&self, progress: f64) {
        if !progress.is_finite() {
            return;
        }
        let progress = progress.clamp(0.0, 1.0);
        let percent = (progress * 100.0).floor() as i64;
        let previous = self.last_percent.fetch_max(percent, Ordering::SeqCst);
        if percent > previous {
            self.bus.emit(ProgressEvent::ModelDownload { progress });
        }
    }
}
