//! Episodic outcome events.
//!
//! An [`EpisodicEvent`] records what the engine predicted for an action in a
//! context and what actually happened. Events are immutable once written and
//! are the only input the learned components train on.

use super::{HeadScores, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of executing an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The action achieved its purpose.
    Success,
    /// The action failed.
    Failure,
}

impl Outcome {
    /// Returns the outcome as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    /// Parses an outcome from a string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }

    /// Returns 1.0 for success and 0.0 for failure.
    #[must_use]
    pub const fn as_f32(&self) -> f32 {
        match self {
            Self::Success => 1.0,
            Self::Failure => 0.0,
        }
    }

    /// Returns `true` for success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Prediction details attached to an event's auxiliary payload.
///
/// Present when the outcome matches a recent scoring call for the same
/// context and action. Training needs it to replay the prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionAux {
    /// Goal embedding used for the semantic head, if any.
    #[serde(default)]
    pub goal_embedding: Option<Vec<f32>>,
    /// Head scores at prediction time.
    pub head_scores: HeadScores,
    /// Context nodes at prediction time.
    #[serde(default)]
    pub context_nodes: Vec<NodeId>,
}

impl PredictionAux {
    /// Decodes the typed view from an auxiliary payload.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        value
            .get("prediction")
            .and_then(|p| serde_json::from_value(p.clone()).ok())
    }

    /// Encodes into an auxiliary payload object.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "prediction": self })
    }
}

/// A single recorded outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicEvent {
    /// Time-ordered unique id.
    pub id: Uuid,
    /// Context the action ran in.
    pub context_id: String,
    /// Action that ran.
    pub action_id: NodeId,
    /// Confidence the engine predicted, in `[0, 1]`.
    pub predicted_confidence: f32,
    /// What actually happened.
    pub actual_outcome: Outcome,
    /// When the outcome was reported.
    pub timestamp: DateTime<Utc>,
    /// Additional structured data.
    #[serde(default)]
    pub aux_payload: serde_json::Value,
}

impl EpisodicEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(
        context_id: impl Into<String>,
        action_id: impl Into<NodeId>,
        predicted_confidence: f32,
        actual_outcome: Outcome,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            context_id: context_id.into(),
            action_id: action_id.into(),
            predicted_confidence: predicted_confidence.clamp(0.0, 1.0),
            actual_outcome,
            timestamp: Utc::now(),
            aux_payload: serde_json::Value::Null,
        }
    }

    /// Overrides the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the auxiliary payload.
    #[must_use]
    pub fn with_aux_payload(mut self, aux_payload: serde_json::Value) -> Self {
        self.aux_payload = aux_payload;
        self
    }

    /// Absolute prediction error in `[0, 1]`.
    #[must_use]
    pub fn prediction_error(&self) -> f32 {
        (self.predicted_confidence - self.actual_outcome.as_f32()).abs()
    }

    /// Returns the typed prediction details, if attached.
    #[must_use]
    pub fn prediction(&self) -> Option<PredictionAux> {
        PredictionAux::from_value(&self.aux_payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_error() {
        let event = EpisodicEvent::new("ctx", "tool", 0.9, Outcome::Failure);
        assert!((event.prediction_error() - 0.9).abs() < 1e-6);

        let event = EpisodicEvent::new("ctx", "tool", 0.9, Outcome::Success);
        assert!((event.prediction_error() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_predicted_confidence_is_clamped() {
        let event = EpisodicEvent::new("ctx", "tool", 1.7, Outcome::Success);
        assert!((event.predicted_confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_prediction_aux_roundtrip_through_payload() {
        let aux = PredictionAux {
            goal_embedding: Some(vec![0.1, 0.2]),
            head_scores: HeadScores {
                semantic: Some(0.7),
                structural: 0.4,
                temporal: 0.5,
            },
            context_nodes: vec![NodeId::new("a")],
        };
        let event = EpisodicEvent::new("ctx", "tool", 0.5, Outcome::Success)
            .with_aux_payload(aux.to_value());
        assert_eq!(event.prediction(), Some(aux));
    }

    #[test]
    fn test_event_ids_are_time_ordered() {
        let first = EpisodicEvent::new("ctx", "a", 0.5, Outcome::Success);
        let second = EpisodicEvent::new("ctx", "b", 0.5, Outcome::Success);
        assert!(first.id <= second.id);
    }
}
