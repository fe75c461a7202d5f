//! # Keyword Classification
//!
//! The classifier is the opaque step of the pipeline: it takes a 16 kHz
//! sample window and returns a confidence score per keyword.
//!
//! ## Key Components:
//! - **Classifier**: one stateful instance per session, never shared
//! - **ClassifierFactory**: builds classifier instances from loaded models
//! - **ModelRegistry**: startup-loaded, read-only model set shared by all
//!   sessions through an `Arc`
//! - **openWakeWord backend**: the ONNX pipeline (cargo feature `onnx`)

pub mod registry;

#[cfg(feature = "onnx")]
pub mod openwakeword;

pub use registry::ModelRegistry;

use crate::error::AppResult;

/// Scores one sample window per keyword.
///
/// Implementations keep whatever rolling state they need between calls. The
/// key set and its order never change for the life of an instance.
pub trait Classifier: Send {
    fn classify(&mut self, window: &[i16]) -> AppResult<ActivationResult>;
}

/// Builds per-session classifiers.
pub trait ClassifierFactory: Send + Sync {
    /// Keyword names in the order every classifier reports them
    fn keywords(&self) -> &[String];

    /// Short backend name for logs and the HTTP surface
    fn backend(&self) -> &str;

    fn create(&self) -> AppResult<Box<dyn Classifier>>;
}

/// Keyword scores for a single window, in classifier order.
///
/// Scores are stored as reported, without clamping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivationResult {
    scores: Vec<(String, f32)>,
}

impl ActivationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, keyword: impl Into<String>, score: f32) {
        self.scores.push((keyword.into(), score));
    }

    pub fn get(&self, keyword: &str) -> Option<f32> {
        self.scores
            .iter()
            .find(|(name, _)| name == keyword)
            .map(|(_, score)| *score)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.scores.iter().map(|(name, score)| (name.as_str(), *score))
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Keywords scoring at or above `threshold`, in result order.
    pub fn activations(&self, threshold: f32) -> Vec<String> {
        self.scores
            .iter()
            .filter(|(_, score)| *score >= threshold)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl<K: Into<String>> FromIterator<(K, f32)> for ActivationResult {
    fn from_iter<I: IntoIterator<Item = (K, f32)>>(iter: I) -> Self {
        Self {
            scores: iter.into_iter().map(|(k, s)| (k.into(), s)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activations_keep_result_order() {
        let result: ActivationResult =
            [("zeta", 0.9), ("alpha", 0.1), ("mid", 0.5), ("beta", 0.75)]
                .into_iter()
                .collect();

        assert_eq!(result.activations(0.5), vec!["zeta", "mid", "beta"]);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let result: ActivationResult = [("hey_test", 0.5)].into_iter().collect();
        assert_eq!(result.activations(0.5), vec!["hey_test"]);

        let result: ActivationResult = [("hey_test", 0.499_99)].into_iter().collect();
        assert!(result.activations(0.5).is_empty());
    }

    #[test]
    fn test_scores_are_not_clamped() {
        let mut result = ActivationResult::new();
        result.push("loud", 1.7);
        result.push("negative", -0.2);

        assert_eq!(result.get("loud"), Some(1.7));
        assert_eq!(result.get("negative"), Some(-0.2));
        assert_eq!(result.get("missing"), None);
        assert_eq!(result.len(), 2);
        assert_eq!(result.activations(0.5), vec!["loud"]);
    }
}
