//! Business logic services.
//!
//! Services sit on top of the storage layer. Each owns one decision the
//! engine makes: what is similar, what route is cheapest, how confident to
//! be, when confidence is enough. [`CapabilityEngine`] wires them together.

mod engine;
mod hybrid_search;
pub mod planner;
pub mod scorer;
mod sync;
mod threshold;
mod training;

pub use engine::{BackgroundHandle, CapabilityEngine};
pub use hybrid_search::{HybridSearch, SearchConfig, blend_alpha, structural_score};
pub use planner::{HyperpathPlanner, PlannerConfig, StrategyKind};
pub use scorer::{DecayScope, MultiHeadScorer, ScoreContext, ScorerConfig, ScorerModel, TrainingReport};
pub use sync::{
    ActionCatalog, ActionDescriptor, ActionInvoker, ActionKind, ObservedExecution, StaticCatalog,
    SyncService, SyncStats,
};
pub use threshold::{ThresholdConfig, ThresholdManager, apply_batch};
pub use training::{TrainingConfig, TrainingPass, TrainingService};
