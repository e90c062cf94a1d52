//! 内容生成命令
//! 供应用外壳调用的接口，错误统一转成字符串

use crate::config::AppConfig;
use crate::error::Result as CoreResult;
use crate::models::{Fact, Interaction, PreferenceAnalysis, QuizQuestion, SwipeDirection};
use crate::services::{
    DatabaseService, FactExtractor, ModelLifecycle, ModelRuntime, ModelState,
    PreferenceAnalyzer, ProgressBus, QuizGenerator, TopicSummary,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 应用状态：总线、模型生命周期、各服务与数据库
pub struct ContentState {
    pub bus: ProgressBus,
    pub lifecycle: Arc<ModelLifecycle>,
    extractor: FactExtractor,
    quiz: QuizGenerator,
    preferences: PreferenceAnalyzer,
    db: DatabaseService,
}

impl ContentState {
    /// 按配置打开数据库文件
    pub fn new(config: &AppConfig, runtime: Arc<dyn ModelRuntime>) -> CoreResult<Self> {
        Self::build(config, runtime, |bus| {
            DatabaseService::open(&config.database_path, bus)
        })
    }

    pub fn in_memory(config: &AppConfig, runtime: Arc<dyn ModelRuntime>) -> CoreResult<Self> {
        Self::build(config, runtime, DatabaseService::open_in_memory)
    }

    fn build<F>(config: &AppConfig, runtime: Arc<dyn ModelRuntime>, open_db: F) -> CoreResult<Self>
    where
        F: FnOnce(ProgressBus) -> CoreResult<DatabaseService>,
    {
        let bus = ProgressBus::default();
        let lifecycle = Arc::new(ModelLifecycle::new(
            runtime,
            config.model.clone(),
            bus.clone(),
        ));
        let db = open_db(bus.clone())?;

        Ok(Self {
            extractor: FactExtractor::new(Arc::clone(&lifecycle), config.extraction.clone()),
            quiz: QuizGenerator::new(Arc::clone(&lifecycle), &config.extraction),
            preferences: PreferenceAnalyzer::new(Arc::clone(&lifecycle)),
            bus,
            lifecycle,
            db,
        })
    }

    pub fn database(&self) -> &DatabaseService {
        &self.db
    }
}

/// 模型状态传输对象
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatusDto {
    pub state: ModelState,
    pub capability: Option<String>,
    pub init_attempts: usize,
    pub context_size: u32,
}

/// 事实传输对象
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactDto {
    pub id: i64,
    pub content: String,
    pub topic: String,
    pub source: String,
    pub created_at: String,
}

impl From<Fact> for FactDto {
    fn from(fact: Fact) -> Self {
        Self {
            id: fact.id,
            content: fact.content,
            topic: fact.topic,
            source: fact.source,
            created_at: fact.created_at.to_rfc3339(),
        }
    }
}

/// 导入结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResultDto {
    pub topic: String,
    pub extracted: usize,
    pub saved: usize,
    pub facts: Vec<FactDto>,
}

/// 出题结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizDto {
    pub topic: String,
    pub questions: Vec<QuizQuestion>,
}

fn status_of(state: &ContentState) -> ModelStatusDto {
    let lifecycle = &state.lifecycle;
    ModelStatusDto {
        state: lifecycle.state(),
        capability: lifecycle.capability().map(ToString::to_string),
        init_attempts: lifecycle.init_attempts(),
        context_size: lifecycle.config().context_size,
    }
}

fn require_topic(topic: &str) -> Result<&str, String> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err("主题不能为空".to_string());
    }
    Ok(topic)
}

/// 初始化模型，返回最终状态
pub async fn init_model(state: &ContentState) -> Result<ModelStatusDto, String> {
    state.lifecycle.initialize().await;
    Ok(status_of(state))
}

pub async fn model_status(state: &ContentState) -> Result<ModelStatusDto, String> {
    Ok(status_of(state))
}

/// 导入文档文本：抽取事实并保存
pub async fn import_document(
    state: &ContentState,
    text: String,
    topic: String,
) -> Result<ImportResultDto, String> {
    let topic = require_topic(&topic)?;

    let facts = state
        .extractor
        .extract(&text, topic)
        .await
        .map_err(|e| e.to_string())?;
    let extracted = facts.len();

    let saved = state.db.save_facts(&facts).map_err(|e| e.to_string())?;

    Ok(ImportResultDto {
        topic: topic.to_string(),
        extracted,
        saved: saved.len(),
        facts: saved.into_iter().map(FactDto::from).collect(),
    })
}

/// 按主题已保存的事实出题，`limit` 限制使用的事实数
pub async fn generate_quiz(
    state: &ContentState,
    topic: String,
    limit: Option<usize>,
) -> Result<QuizDto, String> {
    let topic = require_topic(&topic)?;

    let facts = state
        .db
        .get_facts_by_topic(topic)
        .map_err(|e| e.to_string())?;
    let take = limit.unwrap_or(facts.len()).min(facts.len());
    let contents: Vec<&str> = facts[..take].iter().map(|f| f.content.as_str()).collect();

    let questions = state.quiz.generate_deck(topic, &contents).await;
    state
        .db
        .save_quiz_questions(topic, &questions)
        .map_err(|e| e.to_string())?;

    Ok(QuizDto {
        topic: topic.to_string(),
        questions,
    })
}

/// 记录一次滑动，返回记录 id
pub async fn record_swipe(
    state: &ContentState,
    fact_id: i64,
    direction: String,
) -> Result<i64, String> {
    let direction = SwipeDirection::from(direction);
    if let SwipeDirection::Other(tag) = &direction {
        if tag.trim().is_empty() {
            return Err("滑动方向不能为空".to_string());
        }
    }

    state
        .db
        .record_interaction(fact_id, &direction)
        .map_err(|e| e.to_string())
}

/// 基于最近 `limit` 条滑动记录分析偏好
pub async fn analyze_preferences(
    state: &ContentState,
    limit: usize,
) -> Result<PreferenceAnalysis, String> {
    let interactions: Vec<Interaction> = state
        .db
        .recent_interactions(limit)
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(Interaction::from)
        .collect();

    Ok(state.preferences.analyze(&interactions).await)
}

pub async fn list_topics(state: &ContentState) -> Result<Vec<TopicSummary>, String> {
    state.db.list_topics().map_err(|e| e.to_string())
}

/// 释放模型
pub async fn shutdown_model(state: &ContentState) -> Result<(), String> {
    state.lifecycle.destroy().await;
    Ok(())
}
