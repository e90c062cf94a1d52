//! 偏好分析
//! 基于左右滑动比例的基线启发式；模型可用时尝试让模型给出更细的结果

use crate::error::{Error, Result};
use crate::models::{Interaction, PreferenceAnalysis, SwipeDirection, GENERAL_TOPIC};
use crate::services::lifecycle::{ModelLifecycle, ModelState};
use crate::services::output_parser::parse_json_object;
use crate::services::prompts::{preference_options, ContentPrompt};
use std::sync::Arc;

const PREFERRED_RATIO: f64 = 0.6;
const DISLIKED_RATIO: f64 = 0.4;

/// 左右滑动计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwipeCounts {
    pub right: usize,
    pub left: usize,
    pub other: usize,
}

impl SwipeCounts {
    pub fn tally(interactions: &[Interaction]) -> Self {
        interactions
            .iter()
            .fold(Self::default(), |mut counts, interaction| {
                match interaction.direction {
                    SwipeDirection::Right => counts.right += 1,
                    SwipeDirection::Left => counts.left += 1,
                    SwipeDirection::Other(_) => counts.other += 1,
                }
                counts
            })
    }

    pub fn ratio(&self) -> f64 {
        self.right as f64 / (self.right + self.left).max(1) as f64
    }
}

pub struct PreferenceAnalyzer {
    lifecycle: Arc<ModelLifecycle>,
}

impl PreferenceAnalyzer {
    pub fn new(lifecycle: Arc<ModelLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// 分析交互记录，任何失败都退回基线结果
    pub async fn analyze(&self, interactions: &[Interaction]) -> PreferenceAnalysis {
        if interactions.is_empty() {
            return PreferenceAnalysis::default();
        }

        let counts = SwipeCounts::tally(interactions);
        let fallback = baseline(&counts);

        if self.lifecycle.initialize().await != ModelState::Ready {
            return fallback;
        }

        match self.analyze_with_model(&counts).await {
            Ok(analysis) => analysis,
            Err(err) => {
                log::warn!("preference analysis fell back to baseline: {}", err);
                fallback
            }
        }
    }

    async fn analyze_with_model(&self, counts: &SwipeCounts) -> Result<PreferenceAnalysis> {
        let messages = ContentPrompt::analyze_preferences(counts.right, counts.left, counts.other);
        let response = self
            .lifecycle
            .run_completion(messages, preference_options())
            .await?;

        parse_json_object(&response).ok_or_else(|| {
            Error::MalformedOutput("response does not match the preference shape".to_string())
        })
    }
}

/// 基线启发式
///
/// 只有一个通用主题；比例落在 [0.4, 0.6] 时不归入任何列表，只记分数。
pub fn baseline(counts: &SwipeCounts) -> PreferenceAnalysis {
    let ratio = counts.ratio();
    let mut analysis = PreferenceAnalysis::default();
    let topic = GENERAL_TOPIC.to_string();

    if ratio > PREFERRED_RATIO {
        analysis.preferred_topics.push(topic.clone());
    } else if ratio < DISLIKED_RATIO {
        analysis.disliked_topics.push(topic.clone());
    }

    let score = ((ratio - 0.5) * 2.0 * 100.0).round() / 100.0;
    analysis.overall_scores.insert(topic, score);
    analysis
}
