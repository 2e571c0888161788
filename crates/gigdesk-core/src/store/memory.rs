use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{ensure_active, EntityStore};
use crate::entity::{Dataset, Invoice, Job, Lead, User};
use crate::error::{GigError, Result};
use crate::orchestrator::records::{AutoExecutionLog, NextAction, StallDetection};
use crate::types::EntityKey;

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    leads: Vec<Lead>,
    jobs: Vec<Job>,
    invoices: Vec<Invoice>,
    detections: HashMap<Uuid, StallDetection>,
    actions: HashMap<Uuid, NextAction>,
    logs: Vec<AutoExecutionLog>,
    open_stalls: HashMap<EntityKey, Uuid>,
    active_actions: HashMap<EntityKey, Uuid>,
}

impl Tables {
    fn active_action(&self, key: &EntityKey, now: DateTime<Utc>) -> Option<&NextAction> {
        let id = self.active_actions.get(key)?;
        self.actions.get(id).filter(|a| a.is_active(now))
    }
}

/// In-process store. Every operation runs under one mutex, so the
/// check-and-insert paths are atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace entity rows by id.
    pub fn import(&self, dataset: &Dataset) {
        let mut t = self.tables();
        for u in &dataset.users {
            upsert_by(&mut t.users, u.clone(), |x| &x.id);
        }
        for l in &dataset.leads {
            upsert_by(&mut t.leads, l.clone(), |x| &x.id);
        }
        for j in &dataset.jobs {
            upsert_by(&mut t.jobs, j.clone(), |x| &x.id);
        }
        for i in &dataset.invoices {
            upsert_by(&mut t.invoices, i.clone(), |x| &x.id);
        }
    }

    pub fn upsert_user(&self, user: User) {
        upsert_by(&mut self.tables().users, user, |x| &x.id);
    }

    pub fn upsert_lead(&self, lead: Lead) {
        upsert_by(&mut self.tables().leads, lead, |x| &x.id);
    }

    pub fn upsert_job(&self, job: Job) {
        upsert_by(&mut self.tables().jobs, job, |x| &x.id);
    }

    pub fn upsert_invoice(&self, invoice: Invoice) {
        upsert_by(&mut self.tables().invoices, invoice, |x| &x.id);
    }
}

fn upsert_by<T>(rows: &mut Vec<T>, row: T, id: impl Fn(&T) -> &String) {
    match rows.iter().position(|r| id(r) == id(&row)) {
        Some(i) => rows[i] = row,
        None => rows.push(row),
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.tables().users.clone())
    }

    async fn get_leads(&self, user_id: &str) -> Result<Vec<Lead>> {
        let t = self.tables();
        Ok(t.leads.iter().filter(|l| l.user_id == user_id).cloned().collect())
    }

    async fn get_jobs(&self, user_id: &str) -> Result<Vec<Job>> {
        let t = self.tables();
        Ok(t.jobs.iter().filter(|j| j.user_id == user_id).cloned().collect())
    }

    async fn get_invoices(&self, user_id: &str) -> Result<Vec<Invoice>> {
        let t = self.tables();
        Ok(t.invoices.iter().filter(|i| i.user_id == user_id).cloned().collect())
    }

    async fn record_respond_tap(&self, lead_id: &str) -> Result<u32> {
        let mut t = self.tables();
        let lead = t
            .leads
            .iter_mut()
            .find(|l| l.id == lead_id)
            .ok_or_else(|| GigError::not_found("lead", lead_id))?;
        lead.respond_tap_count += 1;
        Ok(lead.respond_tap_count)
    }

    async fn get_active_stall_for_entity(
        &self,
        key: &EntityKey,
    ) -> Result<Option<StallDetection>> {
        let t = self.tables();
        Ok(t
            .open_stalls
            .get(key)
            .and_then(|id| t.detections.get(id))
            .cloned())
    }

    async fn list_open_stall_detections(&self, user_id: &str) -> Result<Vec<StallDetection>> {
        let t = self.tables();
        Ok(t
            .detections
            .values()
            .filter(|d| d.user_id == user_id && d.is_open())
            .cloned()
            .collect())
    }

    async fn list_stall_detections(&self, user_id: &str) -> Result<Vec<StallDetection>> {
        let t = self.tables();
        let mut rows: Vec<_> = t
            .detections
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        Ok(rows)
    }

    async fn get_stall_detection(&self, id: Uuid) -> Result<Option<StallDetection>> {
        Ok(self.tables().detections.get(&id).cloned())
    }

    async fn create_stall_detection(&self, detection: &StallDetection) -> Result<()> {
        let mut t = self.tables();
        let key = detection.key();
        if t.open_stalls.contains_key(&key) {
            return Err(GigError::Conflict {
                kind: "stall detection",
                key: key.to_string(),
            });
        }
        if detection.is_open() {
            t.open_stalls.insert(key, detection.id);
        }
        t.detections.insert(detection.id, detection.clone());
        Ok(())
    }

    async fn update_stall_detection(&self, detection: &StallDetection) -> Result<()> {
        let mut t = self.tables();
        let Some(row) = t.detections.get_mut(&detection.id) else {
            return Err(GigError::not_found("stall detection", detection.id));
        };
        *row = detection.clone();
        if !detection.is_open() {
            let key = detection.key();
            if t.open_stalls.get(&key) == Some(&detection.id) {
                t.open_stalls.remove(&key);
            }
        }
        Ok(())
    }

    async fn resolve_stall_detection(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables();
        let Some(row) = t.detections.get_mut(&id) else {
            return Err(GigError::not_found("stall detection", id));
        };
        if row.resolved_at.is_some() {
            return Ok(());
        }
        row.resolved_at = Some(at);
        let key = row.key();
        if t.open_stalls.get(&key) == Some(&id) {
            t.open_stalls.remove(&key);
        }
        Ok(())
    }

    async fn get_active_next_action_for_entity(
        &self,
        key: &EntityKey,
        now: DateTime<Utc>,
    ) -> Result<Option<NextAction>> {
        Ok(self.tables().active_action(key, now).cloned())
    }

    async fn get_next_action(&self, id: Uuid) -> Result<Option<NextAction>> {
        Ok(self.tables().actions.get(&id).cloned())
    }

    async fn list_next_actions_for_user(&self, user_id: &str) -> Result<Vec<NextAction>> {
        let t = self.tables();
        let mut rows: Vec<_> = t
            .actions
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn create_next_action(&self, action: &NextAction, now: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables();
        let key = action.key();
        if t.active_action(&key, now).is_some() {
            return Err(GigError::Conflict {
                kind: "next action",
                key: key.to_string(),
            });
        }
        t.active_actions.insert(key, action.id);
        t.actions.insert(action.id, action.clone());
        Ok(())
    }

    async fn update_next_action(&self, action: &NextAction) -> Result<()> {
        let mut t = self.tables();
        let Some(row) = t.actions.get_mut(&action.id) else {
            return Err(GigError::not_found("next action", action.id));
        };
        *row = action.clone();
        if action.is_closed() {
            let key = action.key();
            if t.active_actions.get(&key) == Some(&action.id) {
                t.active_actions.remove(&key);
            }
        }
        Ok(())
    }

    async fn act_on_next_action(&self, id: Uuid, now: DateTime<Utc>) -> Result<NextAction> {
        let mut t = self.tables();
        let Some(action) = t.actions.get_mut(&id) else {
            return Err(GigError::not_found("next action", id));
        };
        ensure_active(action, now)?;
        action.mark_acted(now);
        let action = action.clone();
        t.active_actions.remove(&action.key());
        Ok(action)
    }

    async fn dismiss_next_action(&self, id: Uuid, now: DateTime<Utc>) -> Result<NextAction> {
        let mut t = self.tables();
        let Some(action) = t.actions.get_mut(&id) else {
            return Err(GigError::not_found("next action", id));
        };
        ensure_active(action, now)?;
        action.mark_dismissed(now);
        let action = action.clone();
        t.active_actions.remove(&action.key());
        Ok(action)
    }

    async fn expire_next_actions(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut t = self.tables();
        let expired: Vec<(Uuid, EntityKey)> = t
            .actions
            .values()
            .filter(|a| !a.is_closed() && a.expires_at <= now)
            .map(|a| (a.id, a.key()))
            .collect();
        for (id, key) in &expired {
            t.actions.remove(id);
            if t.active_actions.get(key) == Some(id) {
                t.active_actions.remove(key);
            }
        }
        Ok(expired.len())
    }

    async fn get_last_auto_execution_for_entity(
        &self,
        key: &EntityKey,
    ) -> Result<Option<AutoExecutionLog>> {
        let t = self.tables();
        Ok(t
            .logs
            .iter()
            .filter(|l| &l.key() == key)
            .max_by_key(|l| l.executed_at)
            .cloned())
    }

    async fn create_auto_execution_log(&self, log: &AutoExecutionLog) -> Result<()> {
        self.tables().logs.push(log.clone());
        Ok(())
    }

    async fn update_auto_execution_log(&self, log: &AutoExecutionLog) -> Result<()> {
        let mut t = self.tables();
        let row = t
            .logs
            .iter_mut()
            .find(|l| l.id == log.id)
            .ok_or_else(|| GigError::not_found("auto execution log", log.id))?;
        *row = log.clone();
        Ok(())
    }

    async fn list_auto_execution_logs(&self, user_id: &str) -> Result<Vec<AutoExecutionLog>> {
        let t = self.tables();
        let mut rows: Vec<_> = t
            .logs
            .iter()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        Ok(rows)
    }
}
