//! Structural and temporal scoring heads.

use super::DecayScope;
use crate::models::{EpisodicEvent, NodeId};
use crate::storage::GraphSnapshot;
use chrono::{DateTime, Utc};

/// Centrality share of the structural head.
const CENTRALITY_WEIGHT: f32 = 0.6;

/// Success-rate share of the temporal head when context nodes exist.
const RATE_WEIGHT: f32 = 0.7;

/// Structural head: `0.6 × centrality + 0.4 × community signal`.
///
/// Centrality is PageRank for tools and hypergraph centrality for
/// capabilities. The community signal is the fraction of context nodes in
/// the candidate's community, or 0.5 without context.
#[must_use]
pub fn structural_head(snapshot: &GraphSnapshot, candidate: &NodeId, context: &[NodeId]) -> f32 {
    let centrality = snapshot.centrality(candidate).unwrap_or(0.0).clamp(0.0, 1.0);
    let community = if context.is_empty() {
        0.5
    } else {
        snapshot.community_of(candidate).map_or(0.0, |community| {
            let shared = context
                .iter()
                .filter(|c| snapshot.community_of(c) == Some(community))
                .count();
            #[allow(clippy::cast_precision_loss)]
            let fraction = shared as f32 / context.len() as f32;
            fraction
        })
    };
    CENTRALITY_WEIGHT.mul_add(centrality, (1.0 - CENTRALITY_WEIGHT) * community)
}

/// Temporal head over a context's recent events.
///
/// `events` may be in any order. The decayed success rate of `candidate` is
/// Laplace-smoothed, so an action never seen scores 0.5. With context nodes
/// the rate is blended with decayed co-occurrence: how often `candidate`
/// came right after one of the context nodes.
#[must_use]
pub fn temporal_head(
    events: &[EpisodicEvent],
    candidate: &NodeId,
    context: &[NodeId],
    scope: DecayScope,
    half_life_secs: f64,
    now: DateTime<Utc>,
) -> f32 {
    let mut ordered: Vec<&EpisodicEvent> = events.iter().collect();
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    let reference = match scope {
        DecayScope::Global => now,
        DecayScope::PerContext => ordered.last().map_or(now, |e| e.timestamp),
    };
    let decay = |at: DateTime<Utc>| -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let age = (reference - at).num_milliseconds().max(0) as f64 / 1000.0;
        if half_life_secs <= 0.0 {
            return 1.0;
        }
        0.5f64.powf(age / half_life_secs)
    };

    let mut weighted_success = 0.0;
    let mut weight_total = 0.0;
    for event in ordered.iter().filter(|e| e.action_id == *candidate) {
        let w = decay(event.timestamp);
        weighted_success += w * f64::from(event.actual_outcome.as_f32());
        weight_total += w;
    }
    let rate = (weighted_success + 1.0) / (weight_total + 2.0);
    #[allow(clippy::cast_possible_truncation)]
    let rate = rate as f32;

    if context.is_empty() {
        return rate;
    }

    let mut followed = 0.0;
    let mut transitions = 0.0;
    for pair in ordered.windows(2) {
        if !context.contains(&pair[0].action_id) {
            continue;
        }
        let w = decay(pair[1].timestamp);
        transitions += w;
        if pair[1].action_id == *candidate {
            followed += w;
        }
    }
    #[allow(clippy::cast_possible_truncation)]
    let co_occurrence = if transitions > 0.0 {
        (followed / transitions) as f32
    } else {
        0.0
    };
    RATE_WEIGHT.mul_add(rate, (1.0 - RATE_WEIGHT) * co_occurrence)
}
