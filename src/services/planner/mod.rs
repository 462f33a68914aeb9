//! Incremental hyperpath planner.
//!
//! Plans are minimum-cost routes over planner arcs: top-level `provides`
//! edges, `provides` relations inside capabilities, and zero-cost exits from
//! a capability's exit members to the capability. Arc cost is the reciprocal
//! of the edge weight, so observed edges are always cheaper than template
//! ones.
//!
//! # State
//!
//! | Piece | Guarded by | Readers |
//! |-------|------------|---------|
//! | Published tables (`Arc<PlannerState>`) | `RwLock`, pointer swap only | Clone the `Arc` |
//! | Strategy selector | Writer `Mutex` | Commit path only |
//!
//! Each graph commit is delivered inside the graph's writer section. The
//! planner clones the published tables, repairs them with the selected
//! [`UpdateStrategy`], and publishes the result tagged with the commit's
//! version. Readers never wait: a query whose snapshot is newer than the
//! published tables computes its own table, and offers it back only if the
//! writer is idle and the version still matches.
//!
//! # Deadlines
//!
//! A from-scratch computation checks its deadline before each node. On expiry
//! the labels computed so far are still exact, so the query returns the best
//! plan that enters that settled region as [`PlanResult::Partial`]. Expired
//! tables are never cached.

mod labels;
mod selector;
mod strategy;

pub use labels::{Label, LabelTable};
pub use selector::StrategySelector;
pub use strategy::{EdgeCentric, PathCentric, StrategyKind, UpdateStrategy, strategy_for};

use crate::models::{NextStepCandidate, NodeId, Plan, PlanResult, PlanStep};
use crate::storage::locks::{acquire_lock, read_lock, try_acquire_lock, write_lock};
use crate::storage::{GraphCommit, GraphListener, GraphSnapshot, GraphStore};
use crate::{Error, Result};
use labels::Computation;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Structural prior of a fellow member of a containing capability.
const CO_MEMBER_PRIOR: f32 = 0.5;

/// Structural prior of a capability containing a context node.
const CONTAINER_PRIOR: f32 = 0.4;

/// Planner configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Maximum number of cached per-goal label tables.
    pub max_cached_tables: usize,
    /// Number of recent arc changes the strategy selector remembers.
    pub strategy_window: usize,
    /// Samples required before the selector may leave edge-centric.
    pub min_strategy_samples: usize,
    /// How far the tree-hit rate must exceed chance to go path-centric.
    pub path_centric_margin: f64,
    /// Deadline used when callers do not supply one.
    pub default_deadline_ms: u64,
    /// Pins the update strategy, bypassing the selector.
    pub strategy: Option<StrategyKind>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_cached_tables: 64,
            strategy_window: 32,
            min_strategy_samples: 8,
            path_centric_margin: 0.1,
            default_deadline_ms: 50,
            strategy: None,
        }
    }
}

impl PlannerConfig {
    /// Sets the table cache size.
    #[must_use]
    pub const fn with_max_cached_tables(mut self, max: usize) -> Self {
        self.max_cached_tables = max;
        self
    }

    /// Pins the update strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Sets the selector window and warm-up sample count.
    #[must_use]
    pub const fn with_strategy_window(mut self, window: usize, min_samples: usize) -> Self {
        self.strategy_window = window;
        self.min_strategy_samples = min_samples;
        self
    }

    /// Returns the default deadline.
    #[must_use]
    pub const fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `CAPGRAPH_PLANNER_MAX_TABLES` | Cached label tables |
    /// | `CAPGRAPH_PLANNER_STRATEGY` | `edge_centric` or `path_centric` |
    /// | `CAPGRAPH_PLANNER_DEADLINE_MS` | Default deadline |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CAPGRAPH_PLANNER_MAX_TABLES")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.max_cached_tables = parsed;
        }
        if let Ok(v) = std::env::var("CAPGRAPH_PLANNER_STRATEGY") {
            self.strategy = StrategyKind::parse(&v);
        }
        if let Ok(v) = std::env::var("CAPGRAPH_PLANNER_DEADLINE_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.default_deadline_ms = parsed;
        }
        self
    }
}

#[derive(Debug, Default)]
struct PlannerState {
    version: u64,
    tables: HashMap<NodeId, Arc<LabelTable>>,
}

/// Shared planner state, registered with the graph store as a listener.
struct PlannerCore {
    config: PlannerConfig,
    state: RwLock<Arc<PlannerState>>,
    writer: Mutex<StrategySelector>,
    clock: AtomicU64,
}

impl PlannerCore {
    fn published(&self) -> Arc<PlannerState> {
        Arc::clone(&read_lock(&self.state, "planner.state"))
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Offers a read-path table to the cache. Skipped if a commit is in
    /// flight or the graph moved on.
    fn offer(&self, version: u64, table: LabelTable) -> Arc<LabelTable> {
        let table = Arc::new(table);
        if self.config.max_cached_tables == 0 {
            return table;
        }
        let Some(_writer) = try_acquire_lock(&self.writer, "planner.writer") else {
            return table;
        };
        let current = self.published();
        if current.version != version {
            return table;
        }
        let mut tables = current.tables.clone();
        if tables.len() >= self.config.max_cached_tables
            && !tables.contains_key(table.goal())
            && let Some(victim) = tables
                .iter()
                .min_by(|a, b| a.1.last_used().cmp(&b.1.last_used()).then_with(|| a.0.cmp(b.0)))
                .map(|(goal, _)| goal.clone())
        {
            tables.remove(&victim);
            metrics::counter!("planner_cache_evictions_total").increment(1);
        }
        tables.insert(table.goal().clone(), Arc::clone(&table));
        *write_lock(&self.state, "planner.state") = Arc::new(PlannerState { version, tables });
        table
    }
}

impl GraphListener for PlannerCore {
    fn on_commit(&self, snapshot: &Arc<GraphSnapshot>, commit: &GraphCommit) {
        let mut selector = acquire_lock(&self.writer, "planner.writer");
        let current = self.published();

        let mut tables = if commit.version == current.version + 1 {
            current.tables.clone()
        } else {
            if !current.tables.is_empty() {
                debug!(
                    published = current.version,
                    commit = commit.version,
                    "Planner missed a commit, dropping cached tables"
                );
            }
            HashMap::new()
        };
        tables.retain(|goal, _| snapshot.contains(goal));

        if !commit.arc_changes.is_empty() && !tables.is_empty() {
            let kind = selector.choose();
            let strategy = strategy_for(kind);
            let arc_count = crate::gc::usize_to_f64(snapshot.arc_count().max(1));
            let mut recomputed = 0usize;

            for table in tables.values_mut() {
                let chance = crate::gc::usize_to_f64(table.tree_arc_count()) / arc_count;
                for change in &commit.arc_changes {
                    selector.record(table.is_tree_arc(&strategy::change_key(change)), chance);
                }
                let mut updated = LabelTable::clone(table);
                recomputed += strategy.update(&mut updated, snapshot, &commit.arc_changes);
                *table = Arc::new(updated);
            }

            metrics::counter!(
                "planner_incremental_updates_total",
                "strategy" => kind.as_str()
            )
            .increment(1);
            metrics::histogram!("planner_labels_recomputed")
                .record(crate::gc::usize_to_f64(recomputed));
            debug!(
                version = commit.version,
                strategy = kind.as_str(),
                tables = tables.len(),
                changes = commit.arc_changes.len(),
                recomputed,
                "Planner tables updated"
            );
        }

        *write_lock(&self.state, "planner.state") = Arc::new(PlannerState {
            version: commit.version,
            tables,
        });
    }
}

/// A start position: the node and the capability that supplied it.
type StartEntry = (NodeId, Option<NodeId>);

/// Incremental hyperpath planner.
pub struct HyperpathPlanner {
    graph: Arc<GraphStore>,
    core: Arc<PlannerCore>,
}

impl std::fmt::Debug for HyperpathPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.published();
        f.debug_struct("HyperpathPlanner")
            .field("version", &state.version)
            .field("cached_tables", &state.tables.len())
            .finish_non_exhaustive()
    }
}

impl HyperpathPlanner {
    /// Creates a planner and subscribes it to the store's commits.
    #[must_use]
    pub fn new(graph: Arc<GraphStore>, config: PlannerConfig) -> Self {
        let selector = StrategySelector::new(
            config.strategy_window,
            config.min_strategy_samples,
            config.path_centric_margin,
            config.strategy,
        );
        let core = Arc::new(PlannerCore {
            state: RwLock::new(Arc::new(PlannerState {
                version: graph.version(),
                tables: HashMap::new(),
            })),
            writer: Mutex::new(selector),
            clock: AtomicU64::new(0),
            config,
        });
        graph.subscribe(Arc::clone(&core) as Arc<dyn GraphListener>);
        Self { graph, core }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PlannerConfig {
        &self.core.config
    }

    /// Returns the graph version the cached tables reflect.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.core.published().version
    }

    /// Returns the cached table for a goal, if it is current.
    #[must_use]
    pub fn cached_labels(&self, goal: &NodeId) -> Option<Arc<LabelTable>> {
        let state = self.core.published();
        (state.version == self.graph.version())
            .then(|| state.tables.get(goal).cloned())
            .flatten()
    }

    /// Returns the goals with cached tables.
    #[must_use]
    pub fn cached_goals(&self) -> Vec<NodeId> {
        let mut goals: Vec<NodeId> = self.core.published().tables.keys().cloned().collect();
        goals.sort();
        goals
    }

    /// Returns the strategy the next commit will be repaired with.
    #[must_use]
    pub fn current_strategy(&self) -> StrategyKind {
        acquire_lock(&self.core.writer, "planner.writer").choose()
    }

    /// Finds a minimum-cost plan from any of `starts` to `goal`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the goal is unknown or none of the
    /// start nodes exist. Unreachable goals and expired deadlines are
    /// results, not errors.
    #[instrument(
        name = "capgraph.planner.suggest_path",
        skip(self, starts),
        fields(
            query_id = tracing::field::Empty,
            component = "planner",
            operation = "suggest_path",
            goal = %goal,
            starts = starts.len(),
            result = tracing::field::Empty
        )
    )]
    pub fn suggest_path(
        &self,
        goal: &NodeId,
        starts: &[NodeId],
        deadline: Duration,
    ) -> Result<PlanResult> {
        if let Some(query_id) = crate::observability::current_query_id() {
            tracing::Span::current().record("query_id", query_id.as_str());
        }
        let started = Instant::now();
        let snapshot = self.graph.snapshot();
        let result = self.plan_on(&snapshot, goal, starts, started + deadline)?;

        tracing::Span::current().record("result", result.as_str());
        metrics::counter!("planner_queries_total", "result" => result.as_str()).increment(1);
        metrics::histogram!("planner_query_duration_ms").record(crate::gc::u64_to_f64(
            crate::gc::duration_to_millis(started.elapsed()),
        ));
        Ok(result)
    }

    fn plan_on(
        &self,
        snapshot: &GraphSnapshot,
        goal: &NodeId,
        starts: &[NodeId],
        deadline: Instant,
    ) -> Result<PlanResult> {
        if !snapshot.contains(goal) {
            return Err(Error::InvalidInput(format!("unknown goal node: {goal}")));
        }
        let entries = Self::start_entries(snapshot, starts)?;

        if let Some((node, via)) = entries.iter().find(|(node, _)| node == goal) {
            return Ok(PlanResult::Found(Plan {
                steps: vec![PlanStep {
                    node_id: node.clone(),
                    via: via.clone(),
                }],
                total_cost: 0.0,
            }));
        }

        let state = self.core.published();
        let cached = (state.version == snapshot.version())
            .then(|| state.tables.get(goal).cloned())
            .flatten();
        let table = if let Some(table) = cached {
            table.touch(self.core.tick());
            metrics::counter!("planner_cache_hits_total").increment(1);
            table
        } else {
            match LabelTable::compute_until(snapshot, goal, Some(deadline)) {
                Computation::Complete(table) => {
                    table.touch(self.core.tick());
                    self.core.offer(snapshot.version(), table)
                },
                Computation::Expired(table) => {
                    warn!(goal = %goal, labeled = table.len(), "Planner deadline expired");
                    return Ok(PlanResult::Partial(Self::partial_plan(
                        snapshot, &table, &entries,
                    )));
                },
            }
        };

        Ok(Self::best_entry(&table, &entries).map_or(PlanResult::NotFound, |(entry, _)| {
            PlanResult::Found(Self::trace(&table, entry))
        }))
    }

    /// Expands starts with the members of capability starts.
    fn start_entries(snapshot: &GraphSnapshot, starts: &[NodeId]) -> Result<Vec<StartEntry>> {
        let mut entries: Vec<StartEntry> = Vec::new();
        for start in starts {
            let Some(node) = snapshot.node(start) else {
                warn!(start = %start, "Skipping unknown start node");
                continue;
            };
            entries.push((start.clone(), None));
            if let Some(spec) = node.kind.capability() {
                for member in &spec.members {
                    entries.push((member.clone(), Some(start.clone())));
                }
            }
        }
        if entries.is_empty() {
            return Err(Error::InvalidInput(
                "no valid start nodes for planning".to_string(),
            ));
        }
        Ok(entries)
    }

    fn best_entry<'a>(table: &LabelTable, entries: &'a [StartEntry]) -> Option<(&'a StartEntry, f64)> {
        entries
            .iter()
            .filter_map(|entry| table.distance(&entry.0).map(|d| (entry, d)))
            .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.0.cmp(&b.0.0)))
    }

    /// Follows successor arcs from a labeled start.
    fn trace(table: &LabelTable, entry: &StartEntry) -> Plan {
        let (start, via) = entry;
        let mut steps = vec![PlanStep {
            node_id: start.clone(),
            via: via.clone(),
        }];
        let total_cost = table.distance(start).unwrap_or(0.0);
        let mut current = start.clone();
        while let Some(successor) = table.label(&current).and_then(|l| l.successor.clone()) {
            if steps.len() > table.len() {
                break;
            }
            steps.push(PlanStep {
                node_id: successor.to.clone(),
                via: successor.via,
            });
            current = successor.to;
        }
        Plan { steps, total_cost }
    }

    /// Best plan entering the settled region of an expired computation.
    fn partial_plan(snapshot: &GraphSnapshot, table: &LabelTable, entries: &[StartEntry]) -> Plan {
        if let Some((entry, _)) = Self::best_entry(table, entries) {
            return Self::trace(table, entry);
        }

        let mut best: Option<(f64, &StartEntry, &crate::storage::PlannerArc)> = None;
        for entry in entries {
            for arc in snapshot.arcs_out(&entry.0) {
                let Some(rest) = table.distance(&arc.to) else {
                    continue;
                };
                let total = arc.cost + rest;
                if best.is_none_or(|(d, e, _)| total < d || (total <= d && entry.0 < e.0)) {
                    best = Some((total, entry, arc));
                }
            }
        }

        let Some((total, entry, arc)) = best else {
            return Plan::default();
        };
        let mut plan = Self::trace(
            table,
            &(arc.to.clone(), arc.via.clone()),
        );
        plan.steps.insert(
            0,
            PlanStep {
                node_id: entry.0.clone(),
                via: entry.1.clone(),
            },
        );
        plan.total_cost = total;
        plan
    }

    /// Candidates one hyperedge hop from the context, by descending prior.
    ///
    /// Unknown context nodes are ignored.
    #[must_use]
    pub fn next_step(&self, context_nodes: &[NodeId]) -> Vec<NextStepCandidate> {
        let snapshot = self.graph.snapshot();
        Self::next_step_on(&snapshot, context_nodes)
    }

    pub(crate) fn next_step_on(
        snapshot: &GraphSnapshot,
        context_nodes: &[NodeId],
    ) -> Vec<NextStepCandidate> {
        let mut best: HashMap<NodeId, NextStepCandidate> = HashMap::new();
        let mut offer = |node_id: &NodeId, via: Option<&NodeId>, prior: f32| {
            if context_nodes.contains(node_id) {
                return;
            }
            let candidate = NextStepCandidate {
                node_id: node_id.clone(),
                via: via.cloned(),
                prior,
            };
            match best.get(node_id) {
                Some(existing) if existing.prior >= prior => {},
                _ => {
                    best.insert(node_id.clone(), candidate);
                },
            }
        };

        for ctx in context_nodes {
            if !snapshot.contains(ctx) {
                continue;
            }
            for arc in snapshot.arcs_out(ctx) {
                if arc.via.as_ref() == Some(&arc.to) {
                    continue;
                }
                #[allow(clippy::cast_possible_truncation)]
                let prior = arc.strength.clamp(0.0, 1.0) as f32;
                offer(&arc.to, arc.via.as_ref(), prior);
            }
            for capability in snapshot.capabilities_containing(ctx) {
                offer(capability, None, CONTAINER_PRIOR);
                let Some(spec) = snapshot.node(capability).and_then(|n| n.kind.capability())
                else {
                    continue;
                };
                for member in &spec.members {
                    offer(member, Some(capability), CO_MEMBER_PRIOR);
                }
            }
        }

        let mut candidates: Vec<NextStepCandidate> = best.into_values().collect();
        candidates.sort_by(|a, b| {
            b.prior
                .total_cmp(&a.prior)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        candidates
    }
}
