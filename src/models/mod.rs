use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 单条事实的最大字符数
pub const MAX_FACT_CHARS: usize = 200;

/// 默认来源标签
pub const DEFAULT_SOURCE: &str = "default";

/// 偏好分析的通用主题
pub const GENERAL_TOPIC: &str = "general";

/// 知识卡片上的一条事实
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// 由存储层分配，未持久化时为 0
    pub id: i64,
    pub content: String,
    pub topic: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Fact {
    /// 创建尚未持久化的事实，内容按字符截断到 200
    pub fn new(content: &str, topic: &str) -> Self {
        Self {
            id: 0,
            content: truncate_chars(content, MAX_FACT_CHARS),
            topic: topic.to_string(),
            source: DEFAULT_SOURCE.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// 选择题
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: usize,
}

impl QuizQuestion {
    pub fn correct_option(&self) -> Option<&str> {
        self.options.get(self.correct_answer).map(String::as_str)
    }
}

/// 滑动方向
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SwipeDirection {
    Left,
    Right,
    Other(String),
}

impl From<String> for SwipeDirection {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "left" => Self::Left,
            "right" => Self::Right,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for SwipeDirection {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<SwipeDirection> for String {
    fn from(value: SwipeDirection) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SwipeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => f.write_str("left"),
            Self::Right => f.write_str("right"),
            Self::Other(tag) => f.write_str(tag),
        }
    }
}

/// 用户对卡片的一次交互
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub direction: SwipeDirection,
}

impl Interaction {
    pub fn new(direction: impl Into<SwipeDirection>) -> Self {
        Self {
            direction: direction.into(),
        }
    }
}

/// 主题偏好分析结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferenceAnalysis {
    pub preferred_topics: Vec<String>,
    pub disliked_topics: Vec<String>,
    pub neutral_topics: Vec<String>,
    pub overall_scores: BTreeMap<String, f64>,
}

/// 按字符（而非字节）截断
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
