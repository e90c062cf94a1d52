//! 提示词构建
//! 事实抽取、出题与偏好分析三类提示词，以及对应的采样参数

use crate::models::MAX_FACT_CHARS;
use crate::services::backend::{ChatMessage, CompletionOptions};

/// 内容生成提示词
pub struct ContentPrompt;

impl ContentPrompt {
    /// 事实抽取：每行一条事实
    pub fn extract_facts(chunk: &str, topic: &str) -> Vec<ChatMessage> {
        let system = format!(
            r#"You extract short standalone facts from study material.

## Rules:
1. Output one fact per line
2. Each fact must be at most {} characters
3. Do not number the facts and do not use bullet points
4. No meta-commentary, no introductions, no summaries
5. Every fact must make sense on its own without the surrounding text"#,
            MAX_FACT_CHARS
        );

        let user = format!(
            r#"## Topic:
{}

## Material:
{}

Output only the facts, one per line."#,
            topic, chunk
        );

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }

    /// 出题：每条事实一道四选一
    pub fn generate_quiz<S: AsRef<str>>(topic: &str, facts: &[S]) -> Vec<ChatMessage> {
        let numbered = facts
            .iter()
            .enumerate()
            .map(|(i, fact)| format!("{}. {}", i + 1, fact.as_ref()))
            .collect::<Vec<_>>()
            .join("\n");

        let system = r#"You are an expert exam question designer. You write one multiple-choice question per fact.

## Requirements:
1. Exactly one question for each numbered fact, in the same order
2. Exactly 4 options per question, each shorter than 80 characters
3. Wrong options must be plausible and in the same category as the correct one
4. "correct_answer" is the 0-based index of the correct option

## Output format (JSON array):
[
  {"question": "...", "options": ["...", "...", "...", "..."], "correct_answer": 0}
]

Output only the JSON, no other text."#;

        let user = format!(
            r#"## Topic:
{}

## Facts:
{}"#,
            topic, numbered
        );

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }

    /// 偏好分析：给出左右滑动统计，返回偏好 JSON
    pub fn analyze_preferences(right: usize, left: usize, other: usize) -> Vec<ChatMessage> {
        let system = r#"You analyze how a learner reacts to study cards. A right swipe means the learner liked the card, a left swipe means they did not.

## Output format (JSON):
{
  "preferred_topics": ["..."],
  "disliked_topics": ["..."],
  "neutral_topics": ["..."],
  "overall_scores": {"topic": 0.0}
}

Scores range from -1.0 (strongly disliked) to 1.0 (strongly preferred).
Output only the JSON, no other text."#;

        let user = format!(
            r#"## Interaction summary:
- Right swipes: {}
- Left swipes: {}
- Other interactions: {}"#,
            right, left, other
        );

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }
}

/// 抽取偏向确定性输出
pub fn extraction_options() -> CompletionOptions {
    CompletionOptions {
        temperature: 0.3,
        max_tokens: 1024,
        ..CompletionOptions::default()
    }
}

pub fn quiz_options() -> CompletionOptions {
    CompletionOptions {
        temperature: 0.7,
        max_tokens: 2048,
        ..CompletionOptions::default()
    }
}

pub fn preference_options() -> CompletionOptions {
    CompletionOptions {
        temperature: 0.2,
        max_tokens: 512,
        ..CompletionOptions::default()
    }
}
