//! Persistence boundary for the engine.
//!
//! Entity rows (users, leads, jobs, invoices) are owned by whoever fills the
//! store; the engine only reads them. Detections, next actions and execution
//! logs are owned by the engine. Both implementations enforce the two
//! uniqueness rules at the repository layer:
//!
//! - at most one open `StallDetection` per entity key
//! - at most one active `NextAction` per entity key
//!
//! A second insert for a key returns `GigError::Conflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entity::{Invoice, Job, Lead, User};
use crate::error::Result;
use crate::orchestrator::records::{AutoExecutionLog, NextAction, StallDetection};
use crate::types::EntityKey;

pub mod db;
pub mod memory;

pub use self::db::RedbStore;
pub use self::memory::MemoryStore;

#[async_trait]
pub trait EntityStore: Send + Sync {
    // -- entities -----------------------------------------------------------

    async fn list_users(&self) -> Result<Vec<User>>;
    async fn get_leads(&self, user_id: &str) -> Result<Vec<Lead>>;
    async fn get_jobs(&self, user_id: &str) -> Result<Vec<Job>>;
    async fn get_invoices(&self, user_id: &str) -> Result<Vec<Invoice>>;

    /// Bump the lead's respond-tap counter; returns the new count.
    async fn record_respond_tap(&self, lead_id: &str) -> Result<u32>;

    // -- stall detections ---------------------------------------------------

    async fn get_active_stall_for_entity(&self, key: &EntityKey)
        -> Result<Option<StallDetection>>;
    async fn list_open_stall_detections(&self, user_id: &str) -> Result<Vec<StallDetection>>;
    /// Open and resolved, newest first.
    async fn list_stall_detections(&self, user_id: &str) -> Result<Vec<StallDetection>>;
    async fn get_stall_detection(&self, id: Uuid) -> Result<Option<StallDetection>>;
    async fn create_stall_detection(&self, detection: &StallDetection) -> Result<()>;
    async fn update_stall_detection(&self, detection: &StallDetection) -> Result<()>;
    /// Sets `resolved_at` and frees the entity key. Resolving twice is a no-op.
    async fn resolve_stall_detection(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    // -- next actions -------------------------------------------------------

    async fn get_active_next_action_for_entity(
        &self,
        key: &EntityKey,
        now: DateTime<Utc>,
    ) -> Result<Option<NextAction>>;
    async fn get_next_action(&self, id: Uuid) -> Result<Option<NextAction>>;
    /// Every row for the user regardless of state.
    async fn list_next_actions_for_user(&self, user_id: &str) -> Result<Vec<NextAction>>;
    async fn create_next_action(&self, action: &NextAction, now: DateTime<Utc>) -> Result<()>;
    async fn update_next_action(&self, action: &NextAction) -> Result<()>;
    /// Refused with `ActionClosed` unless the action is active at `now`.
    async fn act_on_next_action(&self, id: Uuid, now: DateTime<Utc>) -> Result<NextAction>;
    /// Refused with `ActionClosed` unless the action is active at `now`.
    async fn dismiss_next_action(&self, id: Uuid, now: DateTime<Utc>) -> Result<NextAction>;
    /// Delete rows past `expires_at` that were never closed; returns how many.
    async fn expire_next_actions(&self, now: DateTime<Utc>) -> Result<usize>;

    // -- execution log ------------------------------------------------------

    async fn get_last_auto_execution_for_entity(
        &self,
        key: &EntityKey,
    ) -> Result<Option<AutoExecutionLog>>;
    async fn create_auto_execution_log(&self, log: &AutoExecutionLog) -> Result<()>;
    /// Replace an existing row, matched by id; `executed_at` must not change.
    async fn update_auto_execution_log(&self, log: &AutoExecutionLog) -> Result<()>;
    /// Newest first.
    async fn list_auto_execution_logs(&self, user_id: &str) -> Result<Vec<AutoExecutionLog>>;
}

/// Shared transition check for act/dismiss.
pub(crate) fn ensure_active(action: &NextAction, now: DateTime<Utc>) -> Result<()> {
    let state = action.state(now);
    if state == crate::orchestrator::records::ActionState::Active {
        Ok(())
    } else {
        Err(crate::error::GigError::ActionClosed {
            id: action.id,
            state,
        })
    }
}
