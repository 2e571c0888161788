//! Fixtures shared by the orchestrator tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use crate::clock::ManualClock;
use crate::config::EngineConfig;
use crate::delivery::{DeliveryChannel, DeliveryReceipt, DeliveryRequest};
use crate::entity::{Invoice, Job, Lead, User};
use crate::error::{GigError, Result};
use crate::orchestrator::records::{AutoExecutionLog, NextAction, StallDetection};
use crate::store::{EntityStore, MemoryStore};
use crate::types::{EntityKey, InvoiceStatus, JobStatus, LeadStatus};

use super::Engine;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap()
}

pub fn user(id: &str, last_active_at: Option<DateTime<Utc>>) -> User {
    User {
        id: id.into(),
        name: format!("User {id}"),
        last_active_at,
    }
}

pub fn lead(id: &str, user_id: &str, created_at: DateTime<Utc>) -> Lead {
    Lead {
        id: id.into(),
        user_id: user_id.into(),
        client_name: "Dana".into(),
        status: LeadStatus::New,
        created_at,
        last_contacted_at: None,
        response_copied_at: None,
        converted_job_id: None,
        respond_tap_count: 0,
    }
}

pub fn job(id: &str, user_id: &str, scheduled_at: DateTime<Utc>, price: i64) -> Job {
    Job {
        id: id.into(),
        user_id: user_id.into(),
        client_name: "Priya".into(),
        status: JobStatus::Scheduled,
        scheduled_date: Some(scheduled_at.format("%Y-%m-%d").to_string()),
        scheduled_time: Some(scheduled_at.format("%H:%M").to_string()),
        price: Some(price),
        created_at: scheduled_at - Duration::days(3),
    }
}

pub fn sent_invoice(id: &str, user_id: &str, sent_at: DateTime<Utc>, amount: i64) -> Invoice {
    Invoice {
        id: id.into(),
        user_id: user_id.into(),
        client_name: "Acme".into(),
        status: InvoiceStatus::Sent,
        amount,
        created_at: sent_at - Duration::days(1),
        sent_at: Some(sent_at),
    }
}

pub fn draft_invoice(id: &str, user_id: &str, created_at: DateTime<Utc>, amount: i64) -> Invoice {
    Invoice {
        id: id.into(),
        user_id: user_id.into(),
        client_name: "Acme".into(),
        status: InvoiceStatus::Draft,
        amount,
        created_at,
        sent_at: None,
    }
}

// ---------------------------------------------------------------------------
// Delivery doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingDelivery {
    pub sent: Mutex<Vec<DeliveryRequest>>,
    pub fail: bool,
}

impl RecordingDelivery {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingDelivery {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt> {
        self.sent.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(GigError::Delivery("gateway down".into()));
        }
        Ok(DeliveryReceipt {
            success: true,
            message_content: Some(request.message()),
            channel: Some("test".into()),
            error: None,
        })
    }
}

/// Never answers.
pub struct HangingDelivery;

#[async_trait]
impl DeliveryChannel for HangingDelivery {
    async fn deliver(&self, _request: &DeliveryRequest) -> Result<DeliveryReceipt> {
        std::future::pending().await
    }
}

// ---------------------------------------------------------------------------
// FaultyStore
// ---------------------------------------------------------------------------

/// `MemoryStore` with injectable failures on the entity reads and on the
/// execution bookkeeping writes.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    pub fail_users: Mutex<HashSet<String>>,
    pub hang_users: Mutex<HashSet<String>>,
    pub lead_reads: AtomicUsize,
    pub fail_log_create: AtomicBool,
    pub fail_log_update: AtomicBool,
    pub fail_action_update: AtomicBool,
}

impl FaultyStore {
    pub fn fail_for(&self, user_id: &str) {
        self.fail_users.lock().unwrap().insert(user_id.into());
    }

    pub fn hang_for(&self, user_id: &str) {
        self.hang_users.lock().unwrap().insert(user_id.into());
    }

    fn disk_full(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(GigError::Store("disk full".into()));
        }
        Ok(())
    }

    async fn check(&self, user_id: &str) -> Result<()> {
        if self.fail_users.lock().unwrap().contains(user_id) {
            return Err(GigError::Store(format!("injected failure for {user_id}")));
        }
        let hang = self.hang_users.lock().unwrap().contains(user_id);
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for FaultyStore {
    async fn list_users(&self) -> Result<Vec<User>> {
        self.inner.list_users().await
    }
    async fn get_leads(&self, user_id: &str) -> Result<Vec<Lead>> {
        self.lead_reads.fetch_add(1, Ordering::SeqCst);
        self.check(user_id).await?;
        self.inner.get_leads(user_id).await
    }
    async fn get_jobs(&self, user_id: &str) -> Result<Vec<Job>> {
        self.inner.get_jobs(user_id).await
    }
    async fn get_invoices(&self, user_id: &str) -> Result<Vec<Invoice>> {
        self.inner.get_invoices(user_id).await
    }
    async fn record_respond_tap(&self, lead_id: &str) -> Result<u32> {
        self.inner.record_respond_tap(lead_id).await
    }
    async fn get_active_stall_for_entity(
        &self,
        key: &EntityKey,
    ) -> Result<Option<StallDetection>> {
        self.inner.get_active_stall_for_entity(key).await
    }
    async fn list_open_stall_detections(&self, user_id: &str) -> Result<Vec<StallDetection>> {
        self.inner.list_open_stall_detections(user_id).await
    }
    async fn list_stall_detections(&self, user_id: &str) -> Result<Vec<StallDetection>> {
        self.inner.list_stall_detections(user_id).await
    }
    async fn get_stall_detection(&self, id: Uuid) -> Result<Option<StallDetection>> {
        self.inner.get_stall_detection(id).await
    }
    async fn create_stall_detection(&self, detection: &StallDetection) -> Result<()> {
        self.inner.create_stall_detection(detection).await
    }
    async fn update_stall_detection(&self, detection: &StallDetection) -> Result<()> {
        self.inner.update_stall_detection(detection).await
    }
    async fn resolve_stall_detection(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.inner.resolve_stall_detection(id, at).await
    }
    async fn get_active_next_action_for_entity(
        &self,
        key: &EntityKey,
        now: DateTime<Utc>,
    ) -> Result<Option<NextAction>> {
        self.inner.get_active_next_action_for_entity(key, now).await
    }
    async fn get_next_action(&self, id: Uuid) -> Result<Option<NextAction>> {
        self.inner.get_next_action(id).await
    }
    async fn list_next_actions_for_user(&self, user_id: &str) -> Result<Vec<NextAction>> {
        self.check(user_id).await?;
        self.inner.list_next_actions_for_user(user_id).await
    }
    async fn create_next_action(&self, action: &NextAction, now: DateTime<Utc>) -> Result<()> {
        self.inner.create_next_action(action, now).await
    }
    async fn update_next_action(&self, action: &NextAction) -> Result<()> {
        Self::disk_full(&self.fail_action_update)?;
        self.inner.update_next_action(action).await
    }
    async fn act_on_next_action(&self, id: Uuid, now: DateTime<Utc>) -> Result<NextAction> {
        self.inner.act_on_next_action(id, now).await
    }
    async fn dismiss_next_action(&self, id: Uuid, now: DateTime<Utc>) -> Result<NextAction> {
        self.inner.dismiss_next_action(id, now).await
    }
    async fn expire_next_actions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.expire_next_actions(now).await
    }
    async fn get_last_auto_execution_for_entity(
        &self,
        key: &EntityKey,
    ) -> Result<Option<AutoExecutionLog>> {
        self.inner.get_last_auto_execution_for_entity(key).await
    }
    async fn create_auto_execution_log(&self, log: &AutoExecutionLog) -> Result<()> {
        Self::disk_full(&self.fail_log_create)?;
        self.inner.create_auto_execution_log(log).await
    }
    async fn update_auto_execution_log(&self, log: &AutoExecutionLog) -> Result<()> {
        Self::disk_full(&self.fail_log_update)?;
        self.inner.update_auto_execution_log(log).await
    }
    async fn list_auto_execution_logs(&self, user_id: &str) -> Result<Vec<AutoExecutionLog>> {
        self.inner.list_auto_execution_logs(user_id).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness<S: EntityStore + 'static> {
    pub store: Arc<S>,
    pub clock: Arc<ManualClock>,
    pub delivery: Arc<RecordingDelivery>,
    pub engine: Arc<Engine>,
}

pub fn harness_with<S: EntityStore + 'static>(
    store: S,
    delivery: RecordingDelivery,
    config: EngineConfig,
) -> Harness<S> {
    let store = Arc::new(store);
    let clock = Arc::new(ManualClock::new(t0()));
    let delivery = Arc::new(delivery);
    let engine = Arc::new(Engine::new(
        store.clone(),
        delivery.clone(),
        clock.clone(),
        config,
    ));
    Harness {
        store,
        clock,
        delivery,
        engine,
    }
}

pub fn harness(store: MemoryStore) -> Harness<MemoryStore> {
    harness_with(store, RecordingDelivery::default(), EngineConfig::default())
}
