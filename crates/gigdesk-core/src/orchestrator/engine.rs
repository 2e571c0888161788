use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use super::bounded;
use super::guard::AutoExecutionGuard;
use super::locks::EntityLocks;
use super::records::NextAction;
use super::registry::{ActionOutcome, DetectionOutcome, Registry};
use super::scheduler::{start_engine, EngineHandle};
use crate::classifier::{StallCandidate, StallClassifier};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::delivery::DeliveryChannel;
use crate::entity::Snapshot;
use crate::error::Result;
use crate::store::EntityStore;
use crate::types::{EntityKey, StallType};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectionReport {
    pub users_scanned: usize,
    pub users_failed: usize,
    pub candidates: usize,
    pub detections_created: usize,
    pub detections_refreshed: usize,
    pub detections_resolved: usize,
    pub actions_created: usize,
    pub actions_already_active: usize,
    pub no_recommendation: usize,
    pub actions_expired: usize,
    pub entity_errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub users_considered: usize,
    pub users_active: usize,
    pub users_failed: usize,
    pub actions_executed: usize,
    pub delivery_failures: usize,
    pub skipped_cooldown: usize,
    pub entity_errors: usize,
}

/// An active action joined with the detection that raised it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionView {
    #[serde(flatten)]
    pub action: NextAction,
    pub stall_type: Option<StallType>,
    pub money_at_risk: i64,
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    classifier: StallClassifier,
    registry: Registry,
    guard: AutoExecutionGuard,
    locks: Arc<EntityLocks>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn EntityStore>,
        delivery: Arc<dyn DeliveryChannel>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let locks = Arc::new(EntityLocks::new());
        let registry = Registry::new(
            store.clone(),
            locks.clone(),
            clock.clone(),
            config.action_ttl(),
            config.call_timeout(),
        );
        let guard = AutoExecutionGuard::new(
            store.clone(),
            delivery,
            locks.clone(),
            clock.clone(),
            config.inactivity_gate(),
            config.cooldown(),
            config.call_timeout(),
        );
        Self {
            store,
            clock,
            classifier: StallClassifier::new(config.thresholds.clone()),
            registry,
            guard,
            locks,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start both sweeps on `interval` tickers.
    pub fn start(self: &Arc<Self>, interval: std::time::Duration) -> EngineHandle {
        start_engine(Arc::clone(self), interval)
    }

    // -----------------------------------------------------------------------
    // Detection sweep
    // -----------------------------------------------------------------------

    pub async fn run_detection_sweep(&self) -> Result<DetectionReport> {
        let started = Instant::now();
        let mut report = DetectionReport::default();

        match self.registry.expire_actions().await {
            Ok(n) => report.actions_expired = n,
            Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
        }

        let users = bounded(
            "list_users",
            self.config.call_timeout(),
            self.store.list_users(),
        )
        .await?;

        for user in &users {
            match self.scan_user(&user.id, &mut report).await {
                Ok(()) => report.users_scanned += 1,
                Err(e) => {
                    report.users_failed += 1;
                    tracing::warn!(user = %user.id, error = %e, "detection skipped for user");
                }
            }
        }
        self.locks.prune();

        tracing::info!(
            users = report.users_scanned,
            failed = report.users_failed,
            candidates = report.candidates,
            created = report.actions_created,
            resolved = report.detections_resolved,
            expired = report.actions_expired,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "detection sweep complete"
        );
        Ok(report)
    }

    /// Classify one user's entities and register the results.
    async fn scan_user(&self, user_id: &str, report: &mut DetectionReport) -> Result<()> {
        let limit = self.config.call_timeout();
        let leads = bounded("get_leads", limit, self.store.get_leads(user_id)).await?;
        let jobs = bounded("get_jobs", limit, self.store.get_jobs(user_id)).await?;
        let invoices = bounded("get_invoices", limit, self.store.get_invoices(user_id)).await?;

        let now = self.clock.now();
        let snapshots = leads
            .iter()
            .map(Snapshot::Lead)
            .chain(jobs.iter().map(Snapshot::Job))
            .chain(invoices.iter().map(Snapshot::Invoice));

        let mut candidates: BTreeMap<EntityKey, StallCandidate> = BTreeMap::new();
        for snapshot in snapshots {
            let Some(candidate) = self.classifier.classify(snapshot, now) else {
                continue;
            };
            match candidates.get(&candidate.key()) {
                Some(existing) if existing.confidence >= candidate.confidence => {}
                _ => {
                    candidates.insert(candidate.key(), candidate);
                }
            }
        }
        report.candidates += candidates.len();

        for (key, candidate) in &candidates {
            match self.registry.process_stall_candidate(candidate).await {
                Ok(outcome) => {
                    match outcome.detection {
                        DetectionOutcome::Created => report.detections_created += 1,
                        DetectionOutcome::Refreshed => report.detections_refreshed += 1,
                    }
                    match outcome.action {
                        ActionOutcome::Created { .. } => report.actions_created += 1,
                        ActionOutcome::AlreadyActive => report.actions_already_active += 1,
                        ActionOutcome::NoRecommendation => report.no_recommendation += 1,
                    }
                }
                Err(e) => {
                    report.entity_errors += 1;
                    tracing::warn!(entity = %key, error = %e, "failed to register stall");
                }
            }
        }

        let stalled: HashSet<EntityKey> = candidates.into_keys().collect();
        report.detections_resolved += self.registry.resolve_recovered(user_id, &stalled).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution sweep
    // -----------------------------------------------------------------------

    pub async fn run_execution_sweep(&self) -> Result<ExecutionReport> {
        let started = Instant::now();
        let mut report = ExecutionReport::default();
        let users = bounded(
            "list_users",
            self.config.call_timeout(),
            self.store.list_users(),
        )
        .await?;

        for user in &users {
            report.users_considered += 1;
            match self.guard.run_for_user(user).await {
                Ok(r) => {
                    if r.user_active {
                        report.users_active += 1;
                    }
                    report.actions_executed += r.executed;
                    report.delivery_failures += r.delivery_failures;
                    report.skipped_cooldown += r.skipped_cooldown;
                    report.entity_errors += r.errors;
                }
                Err(e) => {
                    report.users_failed += 1;
                    tracing::warn!(user = %user.id, error = %e, "execution skipped for user");
                }
            }
        }
        self.locks.prune();

        tracing::info!(
            users = report.users_considered,
            executed = report.actions_executed,
            failed_deliveries = report.delivery_failures,
            cooldown = report.skipped_cooldown,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execution sweep complete"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Host operations
    // -----------------------------------------------------------------------

    /// Active actions for `user_id`, highest money at risk first, then
    /// highest confidence.
    pub async fn get_next_actions_for_user(&self, user_id: &str) -> Result<Vec<ActionView>> {
        let limit = self.config.call_timeout();
        let now = self.clock.now();
        let actions = bounded(
            "list_next_actions_for_user",
            limit,
            self.store.list_next_actions_for_user(user_id),
        )
        .await?;

        let mut views = Vec::new();
        for action in actions.into_iter().filter(|a| a.is_active(now)) {
            let detection = bounded(
                "get_stall_detection",
                limit,
                self.store.get_stall_detection(action.stall_detection_id),
            )
            .await?;
            views.push(ActionView {
                stall_type: detection.as_ref().map(|d| d.stall_type),
                money_at_risk: detection.as_ref().map_or(0, |d| d.money_at_risk),
                confidence: detection.as_ref().map_or(0.0, |d| d.confidence),
                action,
            });
        }
        views.sort_by(|a, b| {
            b.money_at_risk
                .cmp(&a.money_at_risk)
                .then(b.confidence.total_cmp(&a.confidence))
                .then(a.action.created_at.cmp(&b.action.created_at))
        });
        Ok(views)
    }

    pub async fn act_on_action(&self, id: Uuid) -> Result<NextAction> {
        self.registry.act_on_action(id).await
    }

    pub async fn dismiss_action(&self, id: Uuid) -> Result<NextAction> {
        self.registry.dismiss_action(id).await
    }

    pub async fn record_respond_tap(&self, lead_id: &str) -> Result<u32> {
        bounded(
            "record_respond_tap",
            self.config.call_timeout(),
            self.store.record_respond_tap(lead_id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GigError;
    use crate::orchestrator::testing::{
        draft_invoice, harness, harness_with, job, lead, sent_invoice, t0, user, FaultyStore,
        RecordingDelivery,
    };
    use crate::store::MemoryStore;
    use crate::types::{EntityType, InvoiceStatus, LeadStatus};
    use chrono::Duration as CDur;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.upsert_user(user("u1", Some(t0() - CDur::hours(7))));
        store.upsert_lead(lead("lead-1", "u1", t0() - CDur::hours(30)));
        store.upsert_job(job("job-1", "u1", t0() - CDur::hours(3), 15000));
        store.upsert_invoice(draft_invoice("inv-d", "u1", t0() - CDur::hours(30), 12500));
        store.upsert_invoice(sent_invoice("inv-s", "u1", t0() - CDur::hours(100), 40000));
        store
    }

    #[tokio::test]
    async fn detection_sweep_creates_one_action_per_stalled_entity() {
        let h = harness(seeded());
        let report = h.engine.run_detection_sweep().await.unwrap();
        assert_eq!(report.users_scanned, 1);
        assert_eq!(report.candidates, 4);
        assert_eq!(report.detections_created, 4);
        assert_eq!(report.actions_created, 4);

        let again = h.engine.run_detection_sweep().await.unwrap();
        assert_eq!(again.detections_refreshed, 4);
        assert_eq!(again.actions_created, 0);
        assert_eq!(again.actions_already_active, 4);
    }

    #[tokio::test]
    async fn next_actions_ranked_by_money_then_confidence() {
        let h = harness(seeded());
        h.engine.run_detection_sweep().await.unwrap();
        let views = h.engine.get_next_actions_for_user("u1").await.unwrap();
        let order: Vec<&str> = views.iter().map(|v| v.action.entity_id.as_str()).collect();
        assert_eq!(order, ["inv-s", "job-1", "inv-d", "lead-1"]);
        assert_eq!(views[1].money_at_risk, 15000);
    }

    #[tokio::test]
    async fn overdue_job_scores_from_formula() {
        let h = harness(seeded());
        h.engine.run_detection_sweep().await.unwrap();
        let views = h.engine.get_next_actions_for_user("u1").await.unwrap();
        let job = views.iter().find(|v| v.action.entity_type == EntityType::Job).unwrap();
        assert!((job.confidence - 0.64375).abs() < 1e-9, "{}", job.confidence);
    }

    #[tokio::test]
    async fn cooldown_holds_across_fifteen_minute_scans() {
        let h = harness(MemoryStore::new());
        h.store.upsert_user(user("u1", None));
        h.store
            .upsert_invoice(sent_invoice("inv-1", "u1", t0() - CDur::hours(100), 40000));

        // 48h of 15-minute cycles: detect then execute each time.
        for _ in 0..(48 * 4) {
            h.engine.run_detection_sweep().await.unwrap();
            h.engine.run_execution_sweep().await.unwrap();
            h.clock.advance(CDur::minutes(15));
        }
        assert_eq!(h.delivery.count(), 1);

        h.engine.run_detection_sweep().await.unwrap();
        h.engine.run_execution_sweep().await.unwrap();
        assert_eq!(h.delivery.count(), 2);
    }

    #[tokio::test]
    async fn paid_invoice_recovers_and_is_never_sent() {
        let h = harness(MemoryStore::new());
        h.store.upsert_user(user("u1", Some(t0() - CDur::hours(1))));
        let mut inv = sent_invoice("inv-1", "u1", t0() - CDur::hours(100), 40000);
        h.store.upsert_invoice(inv.clone());
        h.engine.run_detection_sweep().await.unwrap();

        inv.status = InvoiceStatus::Paid;
        h.store.upsert_invoice(inv);
        h.store.upsert_user(user("u1", None));
        let report = h.engine.run_detection_sweep().await.unwrap();
        assert_eq!(report.detections_resolved, 1);

        let exec = h.engine.run_execution_sweep().await.unwrap();
        assert_eq!(exec.actions_executed, 0);
        assert_eq!(h.delivery.count(), 0);
        assert!(h.engine.get_next_actions_for_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acted_lead_resurfaces_next_sweep_if_still_stalled() {
        let h = harness(MemoryStore::new());
        h.store.upsert_user(user("u1", None));
        h.store.upsert_lead(lead("lead-1", "u1", t0() - CDur::hours(30)));
        h.engine.run_detection_sweep().await.unwrap();
        let id = h.engine.get_next_actions_for_user("u1").await.unwrap()[0].action.id;

        h.engine.act_on_action(id).await.unwrap();
        assert!(h.engine.get_next_actions_for_user("u1").await.unwrap().is_empty());
        assert!(matches!(
            h.engine.act_on_action(id).await,
            Err(GigError::ActionClosed { .. })
        ));

        h.clock.advance(CDur::minutes(15));
        let report = h.engine.run_detection_sweep().await.unwrap();
        assert_eq!(report.detections_created, 1);
        assert_eq!(report.actions_created, 1);
    }

    #[tokio::test]
    async fn contacted_lead_stops_stalling() {
        let h = harness(MemoryStore::new());
        h.store.upsert_user(user("u1", None));
        let mut l = lead("lead-1", "u1", t0() - CDur::hours(30));
        h.store.upsert_lead(l.clone());
        h.engine.run_detection_sweep().await.unwrap();

        l.status = LeadStatus::Contacted;
        h.store.upsert_lead(l);
        let report = h.engine.run_detection_sweep().await.unwrap();
        assert_eq!(report.candidates, 0);
        assert_eq!(report.detections_resolved, 1);
    }

    #[tokio::test]
    async fn one_failing_user_does_not_abort_the_sweep() {
        let store = FaultyStore::default();
        store.inner.upsert_user(user("bad", None));
        store.inner.upsert_user(user("good", None));
        store
            .inner
            .upsert_lead(lead("lead-g", "good", t0() - CDur::hours(30)));
        store.fail_for("bad");

        let h = harness_with(store, RecordingDelivery::default(), EngineConfig::default());
        let report = h.engine.run_detection_sweep().await.unwrap();
        assert_eq!(report.users_failed, 1);
        assert_eq!(report.users_scanned, 1);
        assert_eq!(report.actions_created, 1);

        let exec = h.engine.run_execution_sweep().await.unwrap();
        assert_eq!(exec.users_failed, 1);
        assert_eq!(exec.users_considered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_store_call_skips_user_after_timeout() {
        let store = FaultyStore::default();
        store.inner.upsert_user(user("slow", None));
        store.inner.upsert_user(user("fast", None));
        store
            .inner
            .upsert_lead(lead("lead-f", "fast", t0() - CDur::hours(30)));
        store.hang_for("slow");

        let h = harness_with(store, RecordingDelivery::default(), EngineConfig::default());
        let report = h.engine.run_detection_sweep().await.unwrap();
        assert_eq!(report.users_failed, 1);
        assert_eq!(report.actions_created, 1);
        assert_eq!(h.store.lead_reads.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn respond_tap_reaches_store() {
        let h = harness(seeded());
        assert_eq!(h.engine.record_respond_tap("lead-1").await.unwrap(), 1);
        assert_eq!(h.engine.record_respond_tap("lead-1").await.unwrap(), 2);
        assert!(matches!(
            h.engine.record_respond_tap("missing").await,
            Err(GigError::NotFound { .. })
        ));
    }
}
