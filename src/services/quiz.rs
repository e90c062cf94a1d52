//! 选择题生成
//! 每批最多 `quiz_batch_size` 条事实，失败时返回空或部分结果，不做启发式降级

use crate::config::ExtractionConfig;
use crate::error::{Error, Result};
use crate::models::QuizQuestion;
use crate::services::events::{ProgressBus, ProgressEvent};
use crate::services::lifecycle::{ModelLifecycle, ModelState};
use crate::services::output_parser::parse_quiz_batch;
use crate::services::prompts::{quiz_options, ContentPrompt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct QuizGenerator {
    lifecycle: Arc<ModelLifecycle>,
    bus: ProgressBus,
    batch_size: usize,
}

impl QuizGenerator {
    pub fn new(lifecycle: Arc<ModelLifecycle>, config: &ExtractionConfig) -> Self {
        let bus = lifecycle.bus().clone();
        Self {
            lifecycle,
            bus,
            batch_size: config.quiz_batch_size.max(1),
        }
    }

    /// 单批出题，只使用前 `quiz_batch_size` 条事实
    pub async fn generate<S: AsRef<str>>(&self, topic: &str, facts: &[S]) -> Vec<QuizQuestion> {
        let batch = &facts[..facts.len().min(self.batch_size)];
        self.run(topic, &[batch], &CancellationToken::new()).await
    }

    /// 按批处理全部事实
    pub async fn generate_deck<S: AsRef<str>>(&self, topic: &str, facts: &[S]) -> Vec<QuizQuestion> {
        self.generate_deck_with_cancel(topic, facts, &CancellationToken::new())
            .await
    }

    /// 取消后不再处理剩余批次，已生成的题目照常返回
    pub async fn generate_deck_with_cancel<S: AsRef<str>>(
        &self,
        topic: &str,
        facts: &[S],
        cancel: &CancellationToken,
    ) -> Vec<QuizQuestion> {
        let batches: Vec<&[S]> = facts.chunks(self.batch_size).collect();
        self.run(topic, &batches, cancel).await
    }

    async fn run<S: AsRef<str>>(
        &self,
        topic: &str,
        batches: &[&[S]],
        cancel: &CancellationToken,
    ) -> Vec<QuizQuestion> {
        if batches.iter().all(|batch| batch.is_empty()) {
            return Vec::new();
        }
        if self.lifecycle.initialize().await != ModelState::Ready {
            log::debug!("model unavailable, skipping quiz generation for '{}'", topic);
            return Vec::new();
        }

        let total_batches = batches.len();
        self.bus.emit(ProgressEvent::QuizStart {
            topic: topic.to_string(),
            total_facts: batches.iter().map(|batch| batch.len()).sum(),
        });

        let mut questions = Vec::new();
        for (batch_index, batch) in batches.iter().enumerate() {
            let generated = match self.generate_batch(topic, batch, cancel).await {
                Ok(generated) => generated,
                Err(Error::Cancelled) => {
                    log::info!("quiz generation for '{}' cancelled after {} batch(es)", topic, batch_index);
                    break;
                }
                Err(err) => {
                    log::warn!(
                        "quiz batch {}/{} for '{}' produced nothing: {}",
                        batch_index + 1,
                        total_batches,
                        topic,
                        err
                    );
                    Vec::new()
                }
            };

            self.bus.emit(ProgressEvent::QuizProgress {
                topic: topic.to_string(),
                batch_index,
                total_batches,
                questions_generated: generated.len(),
            });
            questions.extend(generated);
        }

        self.bus.emit(ProgressEvent::QuizComplete {
            topic: topic.to_string(),
            total_questions: questions.len(),
        });
        log::info!("generated {} question(s) for '{}'", questions.len(), topic);

        questions
    }

    async fn generate_batch<S: AsRef<str>>(
        &self,
        topic: &str,
        batch: &[S],
        cancel: &CancellationToken,
    ) -> Result<Vec<QuizQuestion>> {
        let messages = ContentPrompt::generate_quiz(topic, batch);
        let response = self
            .lifecycle
            .run_completion_with_cancel(messages, quiz_options(), cancel)
            .await?;

        let questions = parse_quiz_batch(&response, batch.len());
        if questions.is_empty() {
            return Err(Error::MalformedOutput(format!(
                "no valid questions in {} chars of output",
                response.len()
            )));
        }
        Ok(questions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::services::events::Subscription;
    use crate::services::mock::{MockBackend, MockReply, MockRuntime};
    use std::sync::Mutex;

    fn question_json(name: &str, answer: i64) -> String {
        format!(r#"{{"question": "{name}?", "options": ["a", "b", "c", "d"], "correct_answer": {answer}}}"#)
    }

    type Events = Arc<Mutex<Vec<ProgressEvent>>>;

    fn generator(runtime: MockRuntime, batch_size: usize) -> (QuizGenerator, Arc<MockRuntime>, Events, Subscription) {
        let runtime = Arc::new(runtime);
        let lifecycle = Arc::new(ModelLifecycle::new(
            runtime.clone(),
            ModelConfig::default(),
            ProgressBus::default(),
        ));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = lifecycle
            .bus()
            .subscribe(move |event| sink.lock().unwrap().push(event.clone()));

        let config = ExtractionConfig {
            quiz_batch_size: batch_size,
            ..ExtractionConfig::default()
        };
        (QuizGenerator::new(lifecycle, &config), runtime, events, subscription)
    }

    fn facts(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("fact {i}")).collect()
    }

    #[tokio::test]
    async fn test_empty_facts_skip_model() {
        let (quiz, runtime, events, _subscription) = generator(MockRuntime::available(MockBackend::default()), 8);

        assert!(quiz.generate::<String>("t", &[]).await.is_empty());
        assert_eq!(MockBackend::count(&runtime.create_calls), 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_mode_returns_empty() {
        let (quiz, runtime, events, _subscription) = generator(MockRuntime::unavailable(), 8);

        assert!(quiz.generate("t", &facts(3)).await.is_empty());
        assert_eq!(MockBackend::count(&runtime.backend().complete_calls), 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generate_uses_first_eight_facts() {
        let reply = format!("[{}]", (0..8).map(|i| question_json(&format!("q{i}"), 1)).collect::<Vec<_>>().join(","));
        let backend = MockBackend::new(vec![MockReply::Text(reply)]);
        let (quiz, runtime, events, _subscription) = generator(MockRuntime::available(backend), 8);

        let questions = quiz.generate("science", &facts(10)).await;

        assert_eq!(questions.len(), 8);
        let prompt = &runtime.backend().requests()[0].messages[1].content;
        assert!(prompt.contains("8. fact 8"));
        assert!(!prompt.contains("fact 9"));

        let types: Vec<&str> = events.lock().unwrap().iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["quiz-start", "quiz-progress", "quiz-complete"]);
    }

    #[tokio::test]
    async fn test_partial_results_are_kept() {
        let reply = format!(
            "Questions:\n[{}, {{\"question\": \"broken\", \"options\": [\"a\"]}}, {}]",
            question_json("first", 0),
            question_json("second", 9)
        );
        let backend = MockBackend::new(vec![MockReply::Text(reply)]);
        let (quiz, _runtime, _events, _subscription) = generator(MockRuntime::available(backend), 8);

        let questions = quiz.generate("t", &facts(3)).await;

        assert_eq!(questions.len(), 2);
        assert!(questions
            .iter()
            .all(|q| q.options.len() == 4 && q.correct_answer < 4));
        assert_eq!(questions[1].correct_answer, 3);
    }

    #[tokio::test]
    async fn test_failed_completion_returns_empty() {
        let backend = MockBackend::new(vec![MockReply::Fail("boom".to_string())]);
        let (quiz, _runtime, events, _subscription) = generator(MockRuntime::available(backend), 8);

        assert!(quiz.generate("t", &facts(2)).await.is_empty());
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&ProgressEvent::QuizComplete {
                topic: "t".to_string(),
                total_questions: 0,
            })
        );
    }

    #[tokio::test]
    async fn test_deck_processes_every_batch() {
        let backend = MockBackend::new(vec![
            MockReply::Text(format!("[{}, {}]", question_json("a", 0), question_json("b", 1))),
            MockReply::text("not json at all"),
            MockReply::Text(format!("[{}]", question_json("e", 2))),
        ]);
        let (quiz, runtime, events, _subscription) = generator(MockRuntime::available(backend), 2);

        let questions = quiz.generate_deck("t", &facts(5)).await;

        assert_eq!(questions.len(), 3);
        assert_eq!(MockBackend::count(&runtime.backend().complete_calls), 3);

        let progress: Vec<(usize, usize)> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::QuizProgress {
                    batch_index,
                    questions_generated,
                    total_batches: 3,
                    ..
                } => Some((*batch_index, *questions_generated)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(0, 2), (1, 0), (2, 1)]);
        assert_eq!(
            events.lock().unwrap()[0],
            ProgressEvent::QuizStart {
                topic: "t".to_string(),
                total_facts: 5,
            }
        );
    }

    #[tokio::test]
    async fn test_cancelled_deck_stops_early() {
        let backend = MockBackend::new(vec![MockReply::text("unused")]);
        let (quiz, runtime, _events, _subscription) = generator(MockRuntime::available(backend), 2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let questions = quiz.generate_deck_with_cancel("t", &facts(4), &cancel).await;

        assert!(questions.is_empty());
        assert_eq!(MockBackend::count(&runtime.backend().complete_calls), 0);
    }
}
