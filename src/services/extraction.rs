//! 事实抽取管线
//! 文本分块后逐块调用模型；模型不可用时退化为确定性的分句器

use crate::config::ExtractionConfig;
use crate::error::{Error, Result};
use crate::models::{truncate_chars, Fact, MAX_FACT_CHARS};
use crate::services::events::{ProgressBus, ProgressEvent};
use crate::services::lifecycle::{ModelLifecycle, ModelState};
use crate::services::prompts::{extraction_options, ContentPrompt};
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;

/// 行首编号或列表符号
static LIST_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*•]\s*|\d+[.)]\s+)").expect("valid list-prefix pattern")
});

/// 句子，保留结尾标点
static SENTENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]*").expect("valid sentence pattern"));

static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*•]+\s*").expect("valid bullet pattern"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// 事实抽取器
pub struct FactExtractor {
    lifecycle: Arc<ModelLifecycle>,
    bus: ProgressBus,
    config: ExtractionConfig,
}

impl FactExtractor {
    pub fn new(lifecycle: Arc<ModelLifecycle>, config: ExtractionConfig) -> Self {
        let bus = lifecycle.bus().clone();
        Self {
            lifecycle,
            bus,
            config,
        }
    }

    pub async fn extract(&self, text: &str, topic: &str) -> Result<Vec<Fact>> {
        self.extract_with_cancel(text, topic, &CancellationToken::new())
            .await
    }

    /// 抽取事实
    ///
    /// 单块补全失败只跳过该块；取消或模型在运行中被销毁时发出 `parse-error` 并返回错误。
    pub async fn extract_with_cancel(
        &self,
        text: &str,
        topic: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fact>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        match self.lifecycle.initialize().await {
            ModelState::Ready => self.extract_with_model(text, topic, cancel).await,
            _ => Ok(self.extract_with_fallback(text, topic)),
        }
    }

    async fn extract_with_model(
        &self,
        text: &str,
        topic: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fact>> {
        let chunks = split_chunks(text, self.config.chunk_size);
        let total_chunks = chunks.len();
        log::info!("extracting facts for '{}' from {} chunk(s)", topic, total_chunks);

        self.bus.emit(ProgressEvent::ParseStart {
            topic: topic.to_string(),
            total_chunks,
        });

        let mut seen = HashSet::new();
        let mut facts = Vec::new();

        for (chunk_index, chunk) in chunks.iter().enumerate() {
            self.bus.emit(ProgressEvent::ChunkStart {
                topic: topic.to_string(),
                chunk_index,
                total_chunks,
            });

            let messages = ContentPrompt::extract_facts(chunk, topic);
            let extracted = match self
                .lifecycle
                .run_completion_with_cancel(messages, extraction_options(), cancel)
                .await
            {
                Ok(response) => parse_fact_lines(&response, topic, &mut seen),
                Err(err) if err.is_recoverable() => {
                    log::warn!("chunk {}/{} of '{}' skipped: {}", chunk_index + 1, total_chunks, topic, err);
                    Vec::new()
                }
                Err(err) => return Err(self.fail(topic, err)),
            };

            self.bus.emit(ProgressEvent::ChunkComplete {
                topic: topic.to_string(),
                chunk_index,
                total_chunks,
                facts_extracted: extracted.len(),
            });
            facts.extend(extracted);
        }

        self.bus.emit(ProgressEvent::ParseComplete {
            topic: topic.to_string(),
            total_facts: facts.len(),
        });
        log::info!("extracted {} fact(s) for '{}'", facts.len(), topic);

        Ok(facts)
    }

    fn fail(&self, topic: &str, err: Error) -> Error {
        log::error!("fact extraction for '{}' aborted: {}", topic, err);
        self.bus.emit(ProgressEvent::ParseError {
            topic: topic.to_string(),
            message: err.to_string(),
        });
        match err {
            Error::Cancelled => Error::Cancelled,
            other => Error::PipelineFatal(other.to_string()),
        }
    }

    /// 降级路径，事件序列与单块模型运行一致
    fn extract_with_fallback(&self, text: &str, topic: &str) -> Vec<Fact> {
        self.bus.emit(ProgressEvent::ParseStart {
            topic: topic.to_string(),
            total_chunks: 1,
        });
        self.bus.emit(ProgressEvent::ChunkStart {
            topic: topic.to_string(),
            chunk_index: 0,
            total_chunks: 1,
        });

        let facts = fallback_facts(text, topic, self.config.fallback_fact_cap);
        log::debug!("fallback splitter produced {} fact(s) for '{}'", facts.len(), topic);

        self.bus.emit(ProgressEvent::ChunkComplete {
            topic: topic.to_string(),
            chunk_index: 0,
            total_chunks: 1,
            facts_extracted: facts.len(),
        });
        self.bus.emit(ProgressEvent::ParseComplete {
            topic: topic.to_string(),
            total_facts: facts.len(),
        });

        facts
    }
}

/// 按字符数切块，块边界可能落在句子中间
pub fn split_chunks(text: &str, chunk_size: usize) -> Vec<&str> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;

    for (idx, _) in text.char_indices() {
        if count == chunk_size {
            chunks.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        chunks.push(&text[start..]);
    }

    chunks
}

/// 解析模型返回的逐行事实，`seen` 在整个运行中做大小写无关去重
pub fn parse_fact_lines(response: &str, topic: &str, seen: &mut HashSet<String>) -> Vec<Fact> {
    response
        .lines()
        .filter_map(|line| {
            let line = LIST_PREFIX.replace(line, "");
            let line = line.trim();
            if line.is_empty() || line.chars().count() > MAX_FACT_CHARS {
                return None;
            }
            let content = truncate_chars(line, MAX_FACT_CHARS);
            seen.insert(content.to_lowercase())
                .then(|| Fact::new(&content, topic))
        })
        .collect()
}

/// 确定性分句
///
/// 先截断再按小写去重，结果最多 `cap` 条。
pub fn fallback_facts(text: &str, topic: &str, cap: usize) -> Vec<Fact> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut seen = HashSet::new();
    let mut facts = Vec::new();

    for line in normalized.lines() {
        for sentence in SENTENCE.find_iter(line) {
            if facts.len() >= cap {
                return facts;
            }

            let stripped = BULLET.replace(sentence.as_str(), "");
            let collapsed = WHITESPACE.replace_all(stripped.trim(), " ");
            if !collapsed.chars().any(char::is_alphanumeric) {
                continue;
            }

            let content = truncate_chars(&collapsed, MAX_FACT_CHARS);
            if seen.insert(content.to_lowercase()) {
                facts.push(Fact::new(&content, topic));
            }
        }
    }

    facts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::services::mock::{MockBackend, MockReply, MockRuntime};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Harness {
        extractor: FactExtractor,
        runtime: Arc<MockRuntime>,
        events: Arc<Mutex<Vec<ProgressEvent>>>,
        _subscription: crate::services::events::Subscription,
    }

    fn harness(runtime: MockRuntime, chunk_size: usize) -> Harness {
        let runtime = Arc::new(runtime);
        let config = ModelConfig {
            completion_timeout_secs: 5,
            ..ModelConfig::default()
        };
        let lifecycle = Arc::new(ModelLifecycle::new(runtime.clone(), config, ProgressBus::default()));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = lifecycle
            .bus()
            .subscribe(move |event| sink.lock().unwrap().push(event.clone()));

        let extractor = FactExtractor::new(
            lifecycle,
            ExtractionConfig {
                chunk_size,
                ..ExtractionConfig::default()
            },
        );

        Harness {
            extractor,
            runtime,
            events,
            _subscription: subscription,
        }
    }

    fn event_types(events: &Mutex<Vec<ProgressEvent>>) -> Vec<&'static str> {
        events.lock().unwrap().iter().map(|e| e.event_type()).collect()
    }

    fn contents(facts: &[Fact]) -> Vec<&str> {
        facts.iter().map(|f| f.content.as_str()).collect()
    }

    #[tokio::test]
    async fn test_empty_input_emits_nothing() {
        let h = harness(MockRuntime::unavailable(), 6000);

        let facts = h.extractor.extract("   \n\t ", "science").await.unwrap();

        assert!(facts.is_empty());
        assert!(h.events.lock().unwrap().is_empty());
        assert_eq!(MockBackend::count(&h.runtime.probe_calls), 0);
    }

    #[tokio::test]
    async fn test_fallback_splits_sentences() {
        let h = harness(MockRuntime::unavailable(), 6000);

        let facts = h
            .extractor
            .extract("Water boils at 100C. Salt lowers freezing point!", "science")
            .await
            .unwrap();

        assert_eq!(
            contents(&facts),
            vec!["Water boils at 100C.", "Salt lowers freezing point!"]
        );
        assert!(facts.iter().all(|f| f.topic == "science" && f.source == "default" && f.id == 0));
        assert_eq!(
            event_types(&h.events),
            vec!["parse-start", "chunk-start", "chunk-complete", "parse-complete"]
        );
        assert_eq!(
            h.events.lock().unwrap()[2],
            ProgressEvent::ChunkComplete {
                topic: "science".to_string(),
                chunk_index: 0,
                total_chunks: 1,
                facts_extracted: 2,
            }
        );
    }

    #[test]
    fn test_fallback_is_deterministic_and_deduplicated() {
        let text = "- Cells divide.\r\n* cells   DIVIDE.\r\nMitosis has   four phases? Yes!\n...\n";

        let first = fallback_facts(text, "bio", 120);
        let second = fallback_facts(text, "bio", 120);

        assert_eq!(contents(&first), vec!["Cells divide.", "Mitosis has four phases?", "Yes!"]);
        assert_eq!(contents(&first), contents(&second));
    }

    #[test]
    fn test_fallback_truncates_and_caps() {
        let long = format!("{}.", "a".repeat(300));
        let facts = fallback_facts(&long, "t", 120);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content.chars().count(), MAX_FACT_CHARS);

        let many: String = (0..200).map(|i| format!("Fact number {i}. ")).collect();
        assert_eq!(fallback_facts(&many, "t", 120).len(), 120);
    }

    #[test]
    fn test_split_chunks_respects_char_boundaries() {
        assert_eq!(split_chunks("short", 6000), vec!["short"]);
        assert_eq!(split_chunks("abcdefg", 3), vec!["abc", "def", "g"]);
        assert_eq!(split_chunks("日本語テキスト", 3), vec!["日本語", "テキス", "ト"]);
    }

    #[test]
    fn test_parse_fact_lines() {
        let mut seen = HashSet::new();
        let response = format!(
            "1. The sun is a star.\n- Water is wet\n\n  2) the sun is a star.\n{}\n3.14 is close to pi",
            "x".repeat(201)
        );

        let facts = parse_fact_lines(&response, "science", &mut seen);

        assert_eq!(
            contents(&facts),
            vec!["The sun is a star.", "Water is wet", "3.14 is close to pi"]
        );
    }

    #[tokio::test]
    async fn test_model_path_processes_chunks_in_order() {
        let backend = MockBackend::new(vec![
            MockReply::text("<think>plan</think>1. Alpha fact\n2. Beta fact"),
            MockReply::text("- alpha FACT\n- Gamma fact"),
        ]);
        let h = harness(MockRuntime::available(backend), 10);

        let facts = h
            .extractor
            .extract("0123456789abcdefghij", "letters")
            .await
            .unwrap();

        assert_eq!(contents(&facts), vec!["Alpha fact", "Beta fact", "Gamma fact"]);
        assert_eq!(
            event_types(&h.events),
            vec![
                "parse-start",
                "chunk-start",
                "chunk-complete",
                "chunk-start",
                "chunk-complete",
                "parse-complete"
            ]
        );

        let events = h.events.lock().unwrap();
        assert_eq!(
            events[0],
            ProgressEvent::ParseStart {
                topic: "letters".to_string(),
                total_chunks: 2,
            }
        );
        assert_eq!(
            events[4],
            ProgressEvent::ChunkComplete {
                topic: "letters".to_string(),
                chunk_index: 1,
                total_chunks: 2,
                facts_extracted: 1,
            }
        );

        let requests = h.runtime.backend().requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].messages[1].content.contains("0123456789"));
        assert!(requests[1].messages[1].content.contains("abcdefghij"));
    }

    #[tokio::test]
    async fn test_failed_chunk_is_skipped() {
        let backend = MockBackend::new(vec![
            MockReply::Fail("backend crashed".to_string()),
            MockReply::Unsuccessful,
            MockReply::text("Survivor fact"),
        ]);
        let h = harness(MockRuntime::available(backend), 4);

        let facts = h.extractor.extract("aaaabbbbcccc", "t").await.unwrap();

        assert_eq!(contents(&facts), vec!["Survivor fact"]);
        let counts: Vec<usize> = h
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::ChunkComplete { facts_extracted, .. } => Some(*facts_extracted),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![0, 0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_chunk_is_skipped() {
        let backend = MockBackend::new(vec![
            MockReply::delayed(Duration::from_secs(30), MockReply::text("too late")),
            MockReply::text("On time"),
        ]);
        let h = harness(MockRuntime::available(backend), 2);

        let facts = h.extractor.extract("aabb", "t").await.unwrap();

        assert_eq!(contents(&facts), vec!["On time"]);
        assert_eq!(event_types(&h.events).last(), Some(&"parse-complete"));
    }

    #[tokio::test]
    async fn test_cancellation_emits_parse_error() {
        let backend = MockBackend::new(vec![MockReply::text("never used")]);
        let h = harness(MockRuntime::available(backend), 6000);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .extractor
            .extract_with_cancel("Some text.", "t", &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(
            event_types(&h.events),
            vec!["parse-start", "chunk-start", "parse-error"]
        );
    }

    #[tokio::test]
    async fn test_facts_respect_length_and_uniqueness() {
        let long_line = "y".repeat(250);
        let backend = MockBackend::new(vec![MockReply::Text(format!(
            "Fact one\nFACT ONE\n{long_line}\nFact two"
        ))]);
        let h = harness(MockRuntime::available(backend), 6000);

        let facts = h.extractor.extract("source", "t").await.unwrap();

        let mut lowered: Vec<String> = facts.iter().map(|f| f.content.to_lowercase()).collect();
        assert!(facts.iter().all(|f| f.content.chars().count() <= MAX_FACT_CHARS));
        lowered.dedup();
        assert_eq!(lowered.len(), facts.len());
        assert_eq!(contents(&facts), vec!["Fact one", "Fact two"]);
    }
}
