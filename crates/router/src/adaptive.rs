//! Feature-keyed adaptive learner.
//!
//! Tracks per-model EMAs of success, latency, cost, and feedback quality,
//! keyed by coarse request features. A feature key participates in
//! scoring only after it has accumulated enough observations; until then
//! the static model attributes govern alone.

use dashmap::DashMap;
use serde::Serialize;

use llmrouter_core::request::InferenceRequest;

const ALPHA: f64 = 0.1;
/// Observations a feature key needs before its stats apply.
pub const MIN_OBSERVATIONS: u64 = 20;

/// Coarse request features used as learner keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RequestFeatures {
    pub length_bucket: LengthBucket,
    pub complexity: Complexity,
    pub domain_tag: String,
    pub has_code: bool,
    pub has_math: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthBucket {
    Short,
    Medium,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl RequestFeatures {
    pub fn of(request: &InferenceRequest) -> Self {
        let tokens = request.estimated_prompt_tokens();
        let length_bucket = match tokens {
            0..=500 => LengthBucket::Short,
            501..=2_000 => LengthBucket::Medium,
            _ => LengthBucket::Long,
        };

        let text: String = match &request.prompt {
            Some(p) => p.clone(),
            None => request
                .messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        };

        let has_code = text.contains("```")
            || text.contains("fn ")
            || text.contains("def ")
            || text.contains("class ");
        let has_math = text.contains('∑')
            || text.contains("\\frac")
            || text
                .split_whitespace()
                .filter(|w| w.chars().all(|c| c.is_ascii_digit() || "+-*/=^()".contains(c)))
                .filter(|w| w.len() > 2)
                .count()
                > 2;

        let complexity = match (length_bucket, !request.tools.is_empty()) {
            (LengthBucket::Long, _) | (_, true) => Complexity::High,
            (LengthBucket::Medium, false) => Complexity::Medium,
            _ => Complexity::Low,
        };

        let domain_tag = request
            .metadata
            .get("domain")
            .cloned()
            .unwrap_or_else(|| "general".into());

        Self {
            length_bucket,
            complexity,
            domain_tag,
            has_code,
            has_math,
        }
    }
}

/// Learned per-(features, model) statistics.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnedStats {
    pub success_rate: f64,
    pub latency_ema_ms: f64,
    pub cost_ema: f64,
    pub quality_from_feedback: f64,
    pub observations: u64,
}

impl Default for LearnedStats {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            latency_ema_ms: 0.0,
            cost_ema: 0.0,
            quality_from_feedback: 0.5,
            observations: 0,
        }
    }
}

/// One request outcome fed back into the learner.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub success: bool,
    pub latency_ms: f64,
    pub cost: f64,
    /// Optional explicit quality feedback in [0, 1].
    pub quality_feedback: Option<f64>,
}

/// The adaptive learner. Keys are `(features, "provider:model")`.
pub struct AdaptiveLearner {
    stats: DashMap<(RequestFeatures, String), LearnedStats>,
}

impl AdaptiveLearner {
    pub fn new() -> Self {
        Self {
            stats: DashMap::new(),
        }
    }

    pub fn observe(&self, features: &RequestFeatures, model_key: &str, obs: Observation) {
        let mut entry = self
            .stats
            .entry((features.clone(), model_key.to_string()))
            .or_default();

        let success_sample = if obs.success { 1.0 } else { 0.0 };
        entry.success_rate += ALPHA * (success_sample - entry.success_rate);
        if obs.success {
            entry.latency_ema_ms = if entry.observations == 0 {
                obs.latency_ms
            } else {
                entry.latency_ema_ms + ALPHA * (obs.latency_ms - entry.latency_ema_ms)
            };
            entry.cost_ema = if entry.observations == 0 {
                obs.cost
            } else {
                entry.cost_ema + ALPHA * (obs.cost - entry.cost_ema)
            };
        }
        if let Some(quality) = obs.quality_feedback {
            entry.quality_from_feedback +=
                ALPHA * (quality - entry.quality_from_feedback);
        }
        entry.observations += 1;
    }

    /// Learned stats for a key, once it has crossed the observation
    /// threshold. Under-observed keys return `None` and the static
    /// model attributes govern.
    pub fn stats_for(&self, features: &RequestFeatures, model_key: &str) -> Option<LearnedStats> {
        let entry = self
            .stats
            .get(&(features.clone(), model_key.to_string()))?;
        (entry.observations >= MIN_OBSERVATIONS).then(|| *entry)
    }
}

impl Default for AdaptiveLearner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> RequestFeatures {
        RequestFeatures::of(&InferenceRequest::from_prompt("hello there"))
    }

    fn success(latency_ms: f64) -> Observation {
        Observation {
            success: true,
            latency_ms,
            cost: 0.001,
            quality_feedback: None,
        }
    }

    #[test]
    fn feature_extraction_buckets() {
        let short = RequestFeatures::of(&InferenceRequest::from_prompt("hi"));
        assert_eq!(short.length_bucket, LengthBucket::Short);
        assert_eq!(short.complexity, Complexity::Low);
        assert_eq!(short.domain_tag, "general");

        let long = RequestFeatures::of(&InferenceRequest::from_prompt("x".repeat(20_000)));
        assert_eq!(long.length_bucket, LengthBucket::Long);
        assert_eq!(long.complexity, Complexity::High);

        let code = RequestFeatures::of(&InferenceRequest::from_prompt(
            "```rust\nfn main() {}\n```",
        ));
        assert!(code.has_code);
    }

    #[test]
    fn domain_tag_from_metadata() {
        let mut request = InferenceRequest::from_prompt("diagnose this");
        request
            .metadata
            .insert("domain".into(), "medical".into());
        assert_eq!(RequestFeatures::of(&request).domain_tag, "medical");
    }

    #[test]
    fn under_observed_keys_stay_silent() {
        let learner = AdaptiveLearner::new();
        let f = features();
        for _ in 0..(MIN_OBSERVATIONS - 1) {
            learner.observe(&f, "p:m", success(100.0));
        }
        assert!(learner.stats_for(&f, "p:m").is_none());

        learner.observe(&f, "p:m", success(100.0));
        let stats = learner.stats_for(&f, "p:m").unwrap();
        assert_eq!(stats.observations, MIN_OBSERVATIONS);
        assert!(stats.latency_ema_ms > 0.0);
    }

    #[test]
    fn failures_pull_success_rate_down() {
        let learner = AdaptiveLearner::new();
        let f = features();
        for _ in 0..30 {
            learner.observe(
                &f,
                "p:m",
                Observation {
                    success: false,
                    latency_ms: 0.0,
                    cost: 0.0,
                    quality_feedback: None,
                },
            );
        }
        let stats = learner.stats_for(&f, "p:m").unwrap();
        assert!(stats.success_rate < 0.1);
    }

    #[test]
    fn keys_are_isolated_by_features_and_model() {
        let learner = AdaptiveLearner::new();
        let f = features();
        for _ in 0..MIN_OBSERVATIONS {
            learner.observe(&f, "p:a", success(50.0));
        }
        assert!(learner.stats_for(&f, "p:a").is_some());
        assert!(learner.stats_for(&f, "p:b").is_none());
    }
}
