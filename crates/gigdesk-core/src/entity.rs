//! Read-only entity snapshots owned by the store.
//!
//! The engine only reads these rows. The single exception is the lead's
//! `respond_tap_count`, bumped through `EntityStore::record_respond_tap`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EntityKey, EntityType, InvoiceStatus, JobStatus, LeadStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    /// Last time the user touched the app. `None` means never seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub user_id: String,
    pub client_name: String,
    pub status: LeadStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_contacted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_copied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converted_job_id: Option<String>,
    #[serde(default)]
    pub respond_tap_count: u32,
}

impl Lead {
    /// Most recent moment anyone acted on this lead.
    pub fn last_action_at(&self) -> DateTime<Utc> {
        [self.last_contacted_at, self.response_copied_at]
            .into_iter()
            .flatten()
            .fold(self.created_at, |latest, ts| latest.max(ts))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub client_name: String,
    pub status: JobStatus,
    /// `YYYY-MM-DD`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<String>,
    /// `14:30`, `14:30:00`, `2:30 PM` or `2 PM`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<String>,
    /// Cents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub user_id: String,
    pub client_name: String,
    pub status: InvoiceStatus,
    /// Cents.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

/// Borrowed view over any of the three entity kinds.
#[derive(Debug, Clone, Copy)]
pub enum Snapshot<'a> {
    Lead(&'a Lead),
    Job(&'a Job),
    Invoice(&'a Invoice),
}

impl Snapshot<'_> {
    fn entity_type(&self) -> EntityType {
        match self {
            Snapshot::Lead(_) => EntityType::Lead,
            Snapshot::Job(_) => EntityType::Job,
            Snapshot::Invoice(_) => EntityType::Invoice,
        }
    }

    fn id(&self) -> &str {
        match self {
            Snapshot::Lead(l) => &l.id,
            Snapshot::Job(j) => &j.id,
            Snapshot::Invoice(i) => &i.id,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type(), self.id())
    }
}

/// A batch of entity rows, as loaded by `gigdesk import`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub leads: Vec<Lead>,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub invoices: Vec<Invoice>,
}

impl Dataset {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.leads.is_empty()
            && self.jobs.is_empty()
            && self.invoices.is_empty()
    }
}
