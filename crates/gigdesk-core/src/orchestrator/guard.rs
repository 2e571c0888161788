//! Guardrails for autonomous execution.
//!
//! An auto-executable action is only delivered when the user has been away
//! for at least the inactivity gate and nothing was sent for the same entity
//! within the cooldown window. Every attempt first writes an
//! `AutoExecutionLog` claim row, then delivers, then closes the action and
//! fills in the outcome. A failed claim write means no send.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::bounded;
use super::locks::EntityLocks;
use super::records::{AutoExecutionLog, NextAction};
use crate::clock::Clock;
use crate::delivery::{DeliveryChannel, DeliveryReceipt, DeliveryRequest};
use crate::entity::User;
use crate::error::Result;
use crate::store::EntityStore;
use crate::types::EntityKey;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuardReport {
    /// The user was active inside the inactivity gate; nothing was tried.
    pub user_active: bool,
    pub executed: usize,
    pub delivery_failures: usize,
    pub skipped_cooldown: usize,
    pub errors: usize,
}

/// Left on a claim row whose delivery outcome was never written back.
const UNRECORDED_OUTCOME: &str = "delivery outcome not recorded";

enum Attempt {
    Delivered { success: bool, bookkeeping_failed: bool },
    Cooldown,
    NoLongerActive,
}

pub struct AutoExecutionGuard {
    store: Arc<dyn EntityStore>,
    delivery: Arc<dyn DeliveryChannel>,
    locks: Arc<EntityLocks>,
    clock: Arc<dyn Clock>,
    inactivity_gate: chrono::Duration,
    cooldown: chrono::Duration,
    call_timeout: Duration,
}

impl AutoExecutionGuard {
    pub fn new(
        store: Arc<dyn EntityStore>,
        delivery: Arc<dyn DeliveryChannel>,
        locks: Arc<EntityLocks>,
        clock: Arc<dyn Clock>,
        inactivity_gate: chrono::Duration,
        cooldown: chrono::Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            delivery,
            locks,
            clock,
            inactivity_gate,
            cooldown,
            call_timeout,
        }
    }

    /// Users with no recorded activity count as away.
    pub fn is_user_active(&self, user: &User, now: DateTime<Utc>) -> bool {
        user.last_active_at
            .is_some_and(|last| now - last < self.inactivity_gate)
    }

    pub async fn in_cooldown(&self, key: &EntityKey, now: DateTime<Utc>) -> Result<bool> {
        let last = bounded(
            "get_last_auto_execution_for_entity",
            self.call_timeout,
            self.store.get_last_auto_execution_for_entity(key),
        )
        .await?;
        Ok(last.is_some_and(|log| now - log.executed_at < self.cooldown))
    }

    /// Deliver every eligible auto-executable action of `user`.
    pub async fn run_for_user(&self, user: &User) -> Result<GuardReport> {
        let mut report = GuardReport::default();
        let now = self.clock.now();
        if self.is_user_active(user, now) {
            tracing::debug!(user = %user.id, "user active inside gate; skipping auto-execution");
            report.user_active = true;
            return Ok(report);
        }

        let actions = bounded(
            "list_next_actions_for_user",
            self.call_timeout,
            self.store.list_next_actions_for_user(&user.id),
        )
        .await?;

        for action in actions
            .into_iter()
            .filter(|a| a.auto_executable && a.is_active(now))
        {
            match self.attempt(action.id, &action.key()).await {
                Ok(Attempt::Delivered {
                    success,
                    bookkeeping_failed,
                }) => {
                    report.executed += 1;
                    if !success {
                        report.delivery_failures += 1;
                    }
                    if bookkeeping_failed {
                        report.errors += 1;
                    }
                }
                Ok(Attempt::Cooldown) => report.skipped_cooldown += 1,
                Ok(Attempt::NoLongerActive) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(entity = %action.key(), error = %e, "auto-execution failed");
                }
            }
        }
        Ok(report)
    }

    async fn attempt(&self, id: Uuid, key: &EntityKey) -> Result<Attempt> {
        let _guard = self.locks.lock(key).await;
        let now = self.clock.now();
        let limit = self.call_timeout;

        // Re-read under the lock: the user may have acted meanwhile.
        let current = bounded("get_next_action", limit, self.store.get_next_action(id)).await?;
        let Some(mut action) = current.filter(|a| a.is_active(now)) else {
            return Ok(Attempt::NoLongerActive);
        };
        if self.in_cooldown(key, now).await? {
            tracing::debug!(entity = %key, "inside cooldown; not sending");
            return Ok(Attempt::Cooldown);
        }

        // The claim row starts the cooldown before anything is sent. If it
        // cannot be stored, nothing is sent.
        let mut log = AutoExecutionLog {
            id: Uuid::new_v4(),
            user_id: action.user_id.clone(),
            next_action_id: action.id,
            entity_type: action.entity_type,
            entity_id: action.entity_id.clone(),
            action_type: action.recommended_action,
            message_content: None,
            delivery_channel: None,
            executed_at: now,
            success: false,
            error_message: Some(UNRECORDED_OUTCOME.into()),
        };
        bounded(
            "create_auto_execution_log",
            limit,
            self.store.create_auto_execution_log(&log),
        )
        .await?;

        let receipt = self.deliver(&action).await;
        log.message_content = receipt.message_content;
        log.delivery_channel = receipt.channel;
        log.success = receipt.success;
        log.error_message = receipt.error;

        action.mark_auto_executed(now);
        let closed = bounded(
            "update_next_action",
            limit,
            self.store.update_next_action(&action),
        )
        .await;
        let recorded = bounded(
            "update_auto_execution_log",
            limit,
            self.store.update_auto_execution_log(&log),
        )
        .await;
        let mut bookkeeping_failed = false;
        for (step, result) in [("close action", closed), ("record outcome", recorded)] {
            if let Err(e) = result {
                bookkeeping_failed = true;
                tracing::warn!(entity = %key, step, error = %e, "sent, but bookkeeping failed");
            }
        }

        if log.success {
            tracing::info!(entity = %key, action = %log.action_type, "auto-executed");
        } else {
            tracing::warn!(
                entity = %key,
                action = %log.action_type,
                error = log.error_message.as_deref().unwrap_or(""),
                "auto-execution delivery failed"
            );
        }
        Ok(Attempt::Delivered {
            success: log.success,
            bookkeeping_failed,
        })
    }

    /// Transport errors and timeouts become an unsuccessful receipt.
    async fn deliver(&self, action: &NextAction) -> DeliveryReceipt {
        let request = DeliveryRequest {
            user_id: action.user_id.clone(),
            entity_type: action.entity_type,
            entity_id: action.entity_id.clone(),
            action: action.recommended_action,
        };
        match bounded("deliver", self.call_timeout, self.delivery.deliver(&request)).await {
            Ok(receipt) => receipt,
            Err(e) => DeliveryReceipt {
                success: false,
                message_content: None,
                channel: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::orchestrator::records::StallDetection;
    use crate::orchestrator::testing::{
        t0, user, FaultyStore, HangingDelivery, RecordingDelivery,
    };
    use std::sync::atomic::Ordering;
    use crate::classifier::StallCandidate;
    use crate::store::MemoryStore;
    use crate::types::{ActionType, EntityType, StallType};
    use chrono::Duration as CDur;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        delivery: Arc<RecordingDelivery>,
        guard: AutoExecutionGuard,
    }

    fn fixture_with(delivery: RecordingDelivery) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let delivery = Arc::new(delivery);
        let guard = AutoExecutionGuard::new(
            store.clone(),
            delivery.clone(),
            Arc::new(EntityLocks::new()),
            clock.clone(),
            CDur::hours(6),
            CDur::hours(48),
            Duration::from_secs(30),
        );
        Fixture {
            store,
            clock,
            delivery,
            guard,
        }
    }

    async fn seed(
        store: &dyn EntityStore,
        now: DateTime<Utc>,
        entity_id: &str,
        auto: bool,
    ) -> NextAction {
        let det = StallDetection::from_candidate(
            &StallCandidate {
                entity_type: EntityType::Invoice,
                entity_id: entity_id.into(),
                user_id: "u1".into(),
                client_name: "Acme".into(),
                stall_type: StallType::Idle,
                money_at_risk: 40000,
                confidence: 0.7,
                hours_stalled: 80.0,
            },
            now,
        );
        store.create_stall_detection(&det).await.unwrap();
        let action = NextAction::new(
            &det,
            ActionType::SendInvoiceReminder,
            "remind",
            auto,
            now,
            CDur::hours(24),
        );
        store.create_next_action(&action, now).await.unwrap();
        action
    }

    async fn seed_action(f: &Fixture, entity_id: &str, auto: bool) -> NextAction {
        seed(f.store.as_ref(), f.clock.now(), entity_id, auto).await
    }

    fn faulty_fixture() -> (
        Arc<FaultyStore>,
        Arc<ManualClock>,
        Arc<RecordingDelivery>,
        AutoExecutionGuard,
    ) {
        let store = Arc::new(FaultyStore::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let delivery = Arc::new(RecordingDelivery::default());
        let guard = AutoExecutionGuard::new(
            store.clone(),
            delivery.clone(),
            Arc::new(EntityLocks::new()),
            clock.clone(),
            CDur::hours(6),
            CDur::hours(48),
            Duration::from_secs(30),
        );
        (store, clock, delivery, guard)
    }

    #[tokio::test]
    async fn inactivity_gate_three_vs_seven_hours() {
        let f = fixture_with(RecordingDelivery::default());
        seed_action(&f, "inv-1", true).await;

        let recent = user("u1", Some(t0() - CDur::hours(3)));
        let report = f.guard.run_for_user(&recent).await.unwrap();
        assert!(report.user_active);
        assert_eq!(f.delivery.count(), 0);

        let away = user("u1", Some(t0() - CDur::hours(7)));
        let report = f.guard.run_for_user(&away).await.unwrap();
        assert!(!report.user_active);
        assert_eq!(report.executed, 1);
        assert_eq!(f.delivery.count(), 1);
    }

    #[tokio::test]
    async fn never_seen_user_is_away() {
        let f = fixture_with(RecordingDelivery::default());
        seed_action(&f, "inv-1", true).await;
        let report = f.guard.run_for_user(&user("u1", None)).await.unwrap();
        assert_eq!(report.executed, 1);
    }

    #[tokio::test]
    async fn only_auto_executable_actions_are_sent() {
        let f = fixture_with(RecordingDelivery::default());
        seed_action(&f, "inv-1", false).await;
        let report = f.guard.run_for_user(&user("u1", None)).await.unwrap();
        assert_eq!(report.executed, 0);
        assert_eq!(f.delivery.count(), 0);
    }

    #[tokio::test]
    async fn execution_closes_action_and_logs() {
        let f = fixture_with(RecordingDelivery::default());
        let action = seed_action(&f, "inv-1", true).await;
        f.guard.run_for_user(&user("u1", None)).await.unwrap();

        let stored = f.store.get_next_action(action.id).await.unwrap().unwrap();
        assert_eq!(stored.auto_executed_at, Some(t0()));
        let logs = f.store.list_auto_execution_logs("u1").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);
        assert_eq!(logs[0].error_message, None);
        assert!(logs[0].message_content.is_some());
        assert_eq!(logs[0].next_action_id, action.id);
        assert_eq!(logs[0].delivery_channel.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn cooldown_blocks_a_new_action_for_same_entity() {
        let f = fixture_with(RecordingDelivery::default());
        seed_action(&f, "inv-1", true).await;
        f.guard.run_for_user(&user("u1", None)).await.unwrap();

        f.clock.advance(CDur::hours(47));
        let key = EntityKey::new(EntityType::Invoice, "inv-1");
        assert!(f.guard.in_cooldown(&key, f.clock.now()).await.unwrap());
        f.clock.advance(CDur::hours(1));
        assert!(!f.guard.in_cooldown(&key, f.clock.now()).await.unwrap());
    }

    #[tokio::test]
    async fn delivery_error_is_logged_and_action_closed() {
        let f = fixture_with(RecordingDelivery::failing());
        let action = seed_action(&f, "inv-1", true).await;
        let report = f.guard.run_for_user(&user("u1", None)).await.unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(report.delivery_failures, 1);

        let logs = f.store.list_auto_execution_logs("u1").await.unwrap();
        assert!(!logs[0].success);
        assert!(logs[0].error_message.as_deref().unwrap().contains("gateway down"));
        assert_eq!(logs[0].message_content, None);
        let stored = f.store.get_next_action(action.id).await.unwrap().unwrap();
        assert!(stored.auto_executed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_timeout_counts_as_failure() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let guard = AutoExecutionGuard::new(
            store.clone(),
            Arc::new(HangingDelivery),
            Arc::new(EntityLocks::new()),
            clock.clone(),
            CDur::hours(6),
            CDur::hours(48),
            Duration::from_secs(30),
        );
        let f = Fixture {
            store,
            clock,
            delivery: Arc::new(RecordingDelivery::default()),
            guard,
        };
        seed_action(&f, "inv-1", true).await;

        let report = f.guard.run_for_user(&user("u1", None)).await.unwrap();
        assert_eq!(report.delivery_failures, 1);
        let logs = f.store.list_auto_execution_logs("u1").await.unwrap();
        assert!(logs[0].error_message.as_deref().unwrap().contains("timed out"));
        assert_eq!(logs[0].message_content, None);
    }

    #[tokio::test]
    async fn failed_claim_write_sends_nothing() {
        let (store, clock, delivery, guard) = faulty_fixture();
        let action = seed(&store.inner, clock.now(), "inv-1", true).await;
        store.fail_log_create.store(true, Ordering::SeqCst);

        for _ in 0..4 {
            let report = guard.run_for_user(&user("u1", None)).await.unwrap();
            assert_eq!(report.executed, 0);
            assert_eq!(report.errors, 1);
            clock.advance(CDur::minutes(15));
        }
        assert_eq!(delivery.count(), 0);
        let stored = store.inner.get_next_action(action.id).await.unwrap().unwrap();
        assert!(stored.is_active(clock.now()));
    }

    #[tokio::test]
    async fn lost_bookkeeping_after_send_still_holds_cooldown() {
        let (store, clock, delivery, guard) = faulty_fixture();
        seed(&store.inner, clock.now(), "inv-1", true).await;
        store.fail_log_update.store(true, Ordering::SeqCst);
        store.fail_action_update.store(true, Ordering::SeqCst);

        let first = guard.run_for_user(&user("u1", None)).await.unwrap();
        assert_eq!(first.executed, 1);
        assert_eq!(first.errors, 1);
        for _ in 0..3 {
            clock.advance(CDur::minutes(15));
            let report = guard.run_for_user(&user("u1", None)).await.unwrap();
            assert_eq!(report.executed, 0);
            assert_eq!(report.skipped_cooldown, 1);
        }
        assert_eq!(delivery.count(), 1);

        let logs = store.inner.list_auto_execution_logs("u1").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].success);
        assert_eq!(logs[0].error_message.as_deref(), Some(UNRECORDED_OUTCOME));
    }
}
