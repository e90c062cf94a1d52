//! 进度事件总线
//! 管线各阶段通过总线广播进度，UI 或日志订阅者按发出顺序接收

use async_stream::stream;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;

/// 进度事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProgressEvent {
    /// 下载进度，取值 0..=1
    ModelDownload { progress: f64 },
    ParseStart {
        topic: String,
        total_chunks: usize,
    },
    ChunkStart {
        topic: String,
        chunk_index: usize,
        total_chunks: usize,
    },
    ChunkComplete {
        topic: String,
        chunk_index: usize,
        total_chunks: usize,
        facts_extracted: usize,
    },
    ParseComplete {
        topic: String,
        total_facts: usize,
    },
    ParseError {
        topic: String,
        message: String,
    },
    StorageSaveProgress {
        topic: String,
        saved: usize,
        total: usize,
    },
    StorageSaveComplete {
        topic: String,
        saved: usize,
    },
    QuizStart {
        topic: String,
        total_facts: usize,
    },
    QuizProgress {
        topic: String,
        batch_index: usize,
        total_batches: usize,
        questions_generated: usize,
    },
    QuizComplete {
        topic: String,
        total_questions: usize,
    },
}

impl ProgressEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ModelDownload { .. } => "model-download",
            Self::ParseStart { .. } => "parse-start",
            Self::ChunkStart { .. } => "chunk-start",
            Self::ChunkComplete { .. } => "chunk-complete",
            Self::ParseComplete { .. } => "parse-complete",
            Self::ParseError { .. } => "parse-error",
            Self::StorageSaveProgress { .. } => "storage-save-progress",
            Self::StorageSaveComplete { .. } => "storage-save-complete",
            Self::QuizStart { .. } => "quiz-start",
            Self::QuizProgress { .. } => "quiz-progress",
            Self::QuizComplete { .. } => "quiz-complete",
        }
    }

    /// 事件所属主题，下载事件没有主题
    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::ModelDownload { .. } => None,
            Self::ParseStart { topic, .. }
            | Self::ChunkStart { topic, .. }
            | Self::ChunkComplete { topic, .. }
            | Self::ParseComplete { topic, .. }
            | Self::ParseError { topic, .. }
            | Self::StorageSaveProgress { topic, .. }
            | Self::StorageSaveComplete { topic, .. }
            | Self::QuizStart { topic, .. }
            | Self::QuizProgress { topic, .. }
            | Self::QuizComplete { topic, .. } => Some(topic),
        }
    }
}

type Listener = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

struct BusInner {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<ProgressEvent>,
}

impl BusInner {
    fn remove(&self, id: u64) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|(listener_id, _)| *listener_id != id);
    }
}

/// 进度事件总线
///
/// 克隆后共享同一组订阅者。监听器在发出方的调用栈上同步执行，
/// 单个监听器 panic 只记录日志，不影响其余监听器和发出方。
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<BusInner>,
}

impl ProgressBus {
    /// `capacity` 为异步流订阅者的缓冲长度
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                sender,
            }),
        }
    }

    /// 注册监听器，返回的句柄被丢弃或调用 `unsubscribe` 时注销
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            active: true,
        }
    }

    /// 广播事件
    pub fn emit(&self, event: ProgressEvent) {
        log::debug!("progress event: {:?}", event);

        let listeners: Vec<(u64, Listener)> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        for (id, listener) in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                log::error!(
                    "progress listener {} panicked on {}: {}",
                    id,
                    event.event_type(),
                    panic_message(payload.as_ref())
                );
            }
        }

        // 没有流订阅者时发送失败是正常情况
        let _ = self.inner.sender.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// 以异步流订阅后续事件，落后的订阅者丢弃旧事件而不阻塞发出方
    pub fn stream(&self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        let mut rx = self.inner.sender.subscribe();

        stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("progress stream lagged, dropped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// 订阅句柄
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
