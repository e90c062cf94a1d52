//! 测试用的脚本化模型后端

use crate::config::ModelConfig;
use crate::services::backend::{
    Capability, CompletionRequest, CompletionResult, ModelBackend, ModelRuntime,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 预设的补全响应
pub enum MockReply {
    Text(String),
    /// 后端返回 `success: false`
    Unsuccessful,
    Fail(String),
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

#[derive(Default)]
pub struct MockBackend {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    progress_steps: Vec<f64>,
    fail_download: bool,
    fail_init: bool,
    fail_destroy: bool,
    init_delay: Duration,
    pub download_calls: AtomicUsize,
    pub init_calls: AtomicUsize,
    pub complete_calls: AtomicUsize,
    pub destroy_calls: AtomicUsize,
}

impl MockBackend {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, steps: &[f64]) -> Self {
        self.progress_steps = steps.to_vec();
        self
    }

    pub fn failing_download(mut self) -> Self {
        self.fail_download = true;
        self
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    async fn download(&self, on_progress: &(dyn Fn(f64) + Send + Sync)) -> Result<()> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        for step in &self.progress_steps {
            on_progress(*step);
        }
        if self.fail_download {
            anyhow::bail!("mock download failed");
        }
        Ok(())
    }

    async fn init(&self) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        if self.fail_init {
            anyhow::bail!("mock init failed");
        }
        Ok(())
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResult> {
        let idx = self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let mut reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("MockBackend: no response configured for call {idx}"))?;

        loop {
            match reply {
                MockReply::Text(text) => {
                    return Ok(CompletionResult {
                        success: true,
                        response: text,
                    })
                }
                MockReply::Unsuccessful => {
                    return Ok(CompletionResult {
                        success: false,
                        response: String::new(),
                    })
                }
                MockReply::Fail(message) => anyhow::bail!(message),
                MockReply::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }

    async fn destroy(&self) -> Result<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy {
            anyhow::bail!("mock destroy failed");
        }
        Ok(())
    }
}

/// 返回同一个 `MockBackend` 的运行时
pub struct MockRuntime {
    available: bool,
    fail_create: bool,
    backend: Arc<MockBackend>,
    pub probe_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub last_context_size: Mutex<Option<u32>>,
}

impl MockRuntime {
    pub fn available(backend: MockBackend) -> Self {
        Self {
            available: true,
            fail_create: false,
            backend: Arc::new(backend),
            probe_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            last_context_size: Mutex::new(None),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::available(MockBackend::default())
        }
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn backend(&self) -> Arc<MockBackend> {
        Arc::clone(&self.backend)
    }
}

impl ModelRuntime for MockRuntime {
    fn probe(&self) -> Capability {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.available {
            Capability::Available
        } else {
            Capability::Unavailable {
                reason: "mock runtime disabled".to_string(),
            }
        }
    }

    fn create_handle(&self, config: &ModelConfig) -> Result<Arc<dyn ModelBackend>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_context_size.lock().unwrap() = Some(config.context_size);
        if self.fail_create {
            anyhow::bail!("mock handle construction failed");
        }
        let backend: Arc<dyn ModelBackend> = self.backend.clone();
        Ok(backend)
    }
}
