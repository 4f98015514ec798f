//! Consolidation cycles
//!
//! Two periodic passes over the full record set:
//! - SWS: re-evaluate importance, blend weight toward it, apply decay
//! - REM: the same pass, then reinforce relationships whose endpoints were
//!   recalled together since the previous REM run, and optionally re-route
//!   records whose classification changed
//!
//! Each record is updated through the primary store's atomic update, so a
//! cancelled cycle leaves every record either fully updated or untouched.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConsolidationConfig;
use crate::engine::Engine;
use crate::error::{EideticError, Result};
use crate::memory::importance::ImportanceEvaluator;
use crate::memory::types::MemoryRecord;
use crate::memory::weight::WeightEngine;
use crate::router::CategoryClassifier;
use crate::storage::registry::VECTOR_INDEX;
use crate::storage::{BackendKind, BackendRegistry, MemoryEvent, RecordFilter, VectorEntry};

/// Which consolidation pass to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleKind {
    /// Consolidation: importance blend and decay
    Sws,
    /// Deep consolidation: SWS plus relationship reinforcement and re-routing
    Rem,
}

impl CycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleKind::Sws => "sws",
            CycleKind::Rem => "rem",
        }
    }
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CycleKind {
    type Err = EideticError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sws" => Ok(CycleKind::Sws),
            "rem" => Ok(CycleKind::Rem),
            other => Err(EideticError::Validation(format!(
                "Unknown consolidation cycle: {other} (expected sws or rem)"
            ))),
        }
    }
}

/// Outcome of one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub kind: CycleKind,
    pub started_at: DateTime<Utc>,
    pub records_scanned: usize,
    pub records_updated: usize,
    /// Records at dormant weight after the pass
    pub dormant_count: usize,
    pub edges_reinforced: usize,
    pub records_rerouted: usize,
    /// Records whose update failed and were skipped
    pub failures: usize,
    pub duration_ms: u64,
    pub cancelled: bool,
}

impl ConsolidationReport {
    fn new(kind: CycleKind) -> Self {
        Self {
            kind,
            started_at: Utc::now(),
            records_scanned: 0,
            records_updated: 0,
            dormant_count: 0,
            edges_reinforced: 0,
            records_rerouted: 0,
            failures: 0,
            duration_ms: 0,
            cancelled: false,
        }
    }

    pub fn to_event(&self) -> MemoryEvent {
        MemoryEvent::ConsolidationCompleted {
            cycle: self.kind.as_str().to_string(),
            records_scanned: self.records_scanned,
            records_updated: self.records_updated,
            edges_reinforced: self.edges_reinforced,
            cancelled: self.cancelled,
            duration_ms: self.duration_ms,
        }
    }
}

/// Unordered pairs of records returned together by a recall, drained by
/// the next REM cycle
#[derive(Debug)]
pub struct CoRecallTracker {
    window: usize,
    pairs: Mutex<HashSet<(Uuid, Uuid)>>,
}

impl CoRecallTracker {
    /// Track pairs among the first `window` ids of each recall
    pub fn new(window: usize) -> Self {
        Self {
            window,
            pairs: Mutex::new(HashSet::new()),
        }
    }

    fn pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
        if a <= b { (a, b) } else { (b, a) }
    }

    pub fn record(&self, ids: &[Uuid]) {
        let top = &ids[..ids.len().min(self.window)];
        if top.len() < 2 {
            return;
        }
        let Ok(mut pairs) = self.pairs.lock() else {
            warn!("Co-recall tracker lock poisoned, dropping pairs");
            return;
        };
        for (i, a) in top.iter().enumerate() {
            for b in &top[i + 1..] {
                if a != b {
                    pairs.insert(Self::pair(*a, *b));
                }
            }
        }
    }

    pub fn contains(&self, a: Uuid, b: Uuid) -> bool {
        self.pairs
            .lock()
            .map(|p| p.contains(&Self::pair(a, b)))
            .unwrap_or(false)
    }

    /// Drain all pairs
    pub fn take(&self) -> HashSet<(Uuid, Uuid)> {
        self.pairs
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default()
    }

    /// Put pairs back after a cycle that did not get to use them
    pub fn restore(&self, pairs: HashSet<(Uuid, Uuid)>) {
        if let Ok(mut current) = self.pairs.lock() {
            current.extend(pairs);
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One consolidation pass over borrowed engine components
pub struct Consolidator<'a> {
    registry: &'a BackendRegistry,
    evaluator: &'a ImportanceEvaluator,
    weights: &'a WeightEngine,
    classifier: &'a dyn CategoryClassifier,
    co_recall: &'a CoRecallTracker,
    config: &'a ConsolidationConfig,
}

impl<'a> Consolidator<'a> {
    pub fn new(
        registry: &'a BackendRegistry,
        evaluator: &'a ImportanceEvaluator,
        weights: &'a WeightEngine,
        classifier: &'a dyn CategoryClassifier,
        co_recall: &'a CoRecallTracker,
        config: &'a ConsolidationConfig,
    ) -> Self {
        Self {
            registry,
            evaluator,
            weights,
            classifier,
            co_recall,
            config,
        }
    }

    /// Run one cycle. `cancel` is checked between records; once it reads
    /// `true` the cycle stops and reports `cancelled`.
    pub async fn run(
        &self,
        kind: CycleKind,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ConsolidationReport> {
        let started = Instant::now();
        let mut report = ConsolidationReport::new(kind);
        let now = report.started_at;

        let records = self.registry.primary().query(&RecordFilter::new()).await?;
        report.records_scanned = records.len();
        info!("Starting {} consolidation over {} records", kind, records.len());

        let evaluator = self.evaluator;
        let weights = self.weights;
        let consolidate = move |r: &mut MemoryRecord| {
            let components = evaluator.evaluate(r, None, now);
            let transform = weights.consolidation_transform(r, components.normalized(), now);
            r.importance = components;
            r.set_weight(transform.apply(r.weight()));
            r.consolidated_at = Some(now);
        };

        for record in &records {
            let stop = *cancel.borrow();
            if stop {
                report.cancelled = true;
                break;
            }

            match self.registry.primary().update_record(record.id, &consolidate).await {
                Ok(Some(updated)) => {
                    report.records_updated += 1;
                    if updated.is_dormant() {
                        report.dormant_count += 1;
                    }
                    if kind == CycleKind::Rem
                        && self.config.reroute_enabled
                        && self.reroute(&updated).await
                    {
                        report.records_rerouted += 1;
                    }
                }
                Ok(None) => debug!("Record {} vanished during consolidation", record.id),
                Err(e) => {
                    warn!("Failed to consolidate record {}: {e}", record.id);
                    report.failures += 1;
                }
            }
        }

        if kind == CycleKind::Rem && !report.cancelled {
            report.edges_reinforced = self.reinforce(cancel).await?;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "{} consolidation finished: {} updated, {} dormant, {} edges reinforced, {} rerouted{}",
            kind,
            report.records_updated,
            report.dormant_count,
            report.edges_reinforced,
            report.records_rerouted,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }

    /// Strengthen edges between co-recalled records
    async fn reinforce(&self, cancel: &watch::Receiver<bool>) -> Result<usize> {
        let pairs = self.co_recall.take();
        if pairs.is_empty() {
            return Ok(0);
        }

        let primary = self.registry.primary();
        let relationships = match primary.all_relationships().await {
            Ok(relationships) => relationships,
            Err(e) => {
                self.co_recall.restore(pairs);
                return Err(e);
            }
        };

        let mut reinforced = 0;
        for edge in relationships {
            let stop = *cancel.borrow();
            if stop {
                break;
            }
            if !pairs.contains(&CoRecallTracker::pair(edge.from_id, edge.to_id)) {
                continue;
            }
            match primary
                .reinforce_relationship(edge.id, self.config.reinforcement)
                .await
            {
                Ok(Some(updated)) => {
                    reinforced += 1;
                    if let Some(graph) = self.registry.graph() {
                        graph.link(&updated).await;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to reinforce relationship {}: {e}", edge.id),
            }
        }
        Ok(reinforced)
    }

    /// Re-classify one record and move it when the category changed.
    /// Returns whether it moved.
    async fn reroute(&self, record: &MemoryRecord) -> bool {
        let target = self.classifier.classify(&record.content_type, &record.content);
        if target == record.category {
            return false;
        }

        let previous = match self.registry.primary().reroute(record.id, target).await {
            Ok(Some(previous)) => previous,
            Ok(None) => return false,
            Err(e) => {
                warn!("Failed to re-route record {}: {e}", record.id);
                return false;
            }
        };
        info!("Re-routed {} from {} to {}", record.id, previous, target);

        let mut moved = record.clone();
        moved.category = target;

        if let Some(events) = self.registry.events() {
            let audit = MemoryEvent::Rerouted {
                id: record.id,
                from: previous,
                to: target,
                timestamp: Utc::now(),
            };
            if let Err(e) = events.append(audit) {
                warn!("Failed to audit re-route of {}: {e}", record.id);
            }
        }

        if let Some(index) = self.registry.vector_index() {
            match index.upsert(VectorEntry::from(&moved)).await {
                Ok(()) => self
                    .registry
                    .availability()
                    .mark_ok(VECTOR_INDEX, BackendKind::VectorIndex),
                Err(e) => self.registry.availability().mark_failed(
                    VECTOR_INDEX,
                    BackendKind::VectorIndex,
                    &e,
                ),
            }
        }

        if let Some(backend) = self.registry.category_backend(target) {
            if let Err(e) = backend.put(&moved).await {
                self.registry
                    .availability()
                    .mark_failed(target.as_str(), backend.kind(), &e);
            }
        }
        true
    }
}

/// Background tasks driving both cycles until shutdown
pub struct ConsolidationScheduler {
    handles: Vec<JoinHandle<()>>,
}

impl ConsolidationScheduler {
    /// Spawn one task per cycle kind. The tasks stop when the engine's
    /// shutdown signal fires.
    pub fn spawn(engine: Arc<Engine>) -> Self {
        let config = engine.config().consolidation.clone();
        let handles = [
            (CycleKind::Sws, config.sws_interval_secs),
            (CycleKind::Rem, config.rem_interval_secs),
        ]
        .into_iter()
        .map(|(kind, secs)| {
            let engine = Arc::clone(&engine);
            tokio::spawn(run_cycle_loop(engine, kind, Duration::from_secs(secs.max(1))))
        })
        .collect();

        info!(
            "Consolidation scheduler started (sws every {}s, rem every {}s)",
            config.sws_interval_secs, config.rem_interval_secs
        );
        Self { handles }
    }

    /// Wait for both tasks to finish
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Consolidation task panicked: {e}");
            }
        }
    }
}

async fn run_cycle_loop(engine: Arc<Engine>, kind: CycleKind, period: Duration) {
    let mut shutdown = engine.shutdown_signal();
    // First run one period after startup
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let stop = *shutdown.borrow();
        if stop {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                match engine.consolidate(kind).await {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!("{kind} cycle still running, tick skipped"),
                    Err(e) => error!("{kind} consolidation failed: {e}"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("{kind} consolidation loop stopped");
}
