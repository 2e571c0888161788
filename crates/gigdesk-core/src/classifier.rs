use crate::config::StallThresholds;
use crate::entity::{Invoice, Job, Lead, Snapshot};
use crate::types::{EntityKey, EntityType, InvoiceStatus, JobStatus, LeadStatus, StallType};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// StallCandidate (output)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StallCandidate {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub user_id: String,
    pub client_name: String,
    pub stall_type: StallType,
    /// Cents.
    pub money_at_risk: i64,
    pub confidence: f64,
    pub hours_stalled: f64,
}

impl StallCandidate {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

// ---------------------------------------------------------------------------
// Confidence curves
// ---------------------------------------------------------------------------
//
// Linear ramps with per-stall ceilings. The constants are carried over as-is
// and are pending product review.

fn lead_no_response_confidence(hours: f64) -> f64 {
    (0.5 + (hours / 48.0) * 0.4).min(0.9)
}

fn job_overdue_confidence(hours: f64) -> f64 {
    (0.6 + (hours / 24.0) * 0.35).min(0.95)
}

fn invoice_draft_confidence(hours: f64) -> f64 {
    (0.5 + (hours / 72.0) * 0.35).min(0.85)
}

fn invoice_idle_confidence(hours: f64) -> f64 {
    (0.6 + (hours / 168.0) * 0.3).min(0.9)
}

/// Wall-clock hours from `from` to `to` (negative if `from` is later).
pub fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 3_600_000.0
}

// ---------------------------------------------------------------------------
// Schedule parsing
// ---------------------------------------------------------------------------

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{1,2})(?::(\d{2}))?(?::(\d{2}))?\s*([AaPp])\.?\s*[Mm]?\.?$|^(\d{1,2}):(\d{2})(?::(\d{2}))?$")
            .expect("valid regex")
    })
}

/// Parse `14:30`, `14:30:15`, `2:30 PM`, `2:30pm`, `2 PM` or `12 a.m.`.
pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    let caps = time_re().captures(raw.trim())?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

    if let Some(meridiem) = caps.get(4) {
        let hour12 = num(1)?;
        if !(1..=12).contains(&hour12) {
            return None;
        }
        let pm = meridiem.as_str().eq_ignore_ascii_case("p");
        let hour = match (hour12, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, false) => h,
            (h, true) => h + 12,
        };
        NaiveTime::from_hms_opt(hour, num(2).unwrap_or(0), num(3).unwrap_or(0))
    } else {
        NaiveTime::from_hms_opt(num(5)?, num(6)?, num(7).unwrap_or(0))
    }
}

/// Combine a `YYYY-MM-DD` date and a time-of-day string into a UTC instant.
pub fn parse_schedule(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()?;
    let time = parse_time_of_day(time)?;
    Some(date.and_time(time).and_utc())
}

// ---------------------------------------------------------------------------
// StallClassifier
// ---------------------------------------------------------------------------

/// Decides whether a single entity snapshot is stalled at `now`.
#[derive(Debug, Clone, Default)]
pub struct StallClassifier {
    thresholds: StallThresholds,
}

impl StallClassifier {
    pub fn new(thresholds: StallThresholds) -> Self {
        Self { thresholds }
    }

    pub fn classify(&self, snapshot: Snapshot<'_>, now: DateTime<Utc>) -> Option<StallCandidate> {
        match snapshot {
            Snapshot::Lead(lead) => self.classify_lead(lead, now),
            Snapshot::Job(job) => self.classify_job(job, now),
            Snapshot::Invoice(invoice) => self.classify_invoice(invoice, now),
        }
    }

    pub fn classify_lead(&self, lead: &Lead, now: DateTime<Utc>) -> Option<StallCandidate> {
        match lead.status {
            LeadStatus::New | LeadStatus::ResponseSent => {}
            LeadStatus::Contacted | LeadStatus::Quoted => return None,
            LeadStatus::Converted | LeadStatus::Cold | LeadStatus::Lost => return None,
        }
        if lead.converted_job_id.is_some() {
            return None;
        }

        let hours = hours_between(lead.last_action_at(), now);
        if hours < self.thresholds.lead_no_response_hours {
            return None;
        }
        Some(StallCandidate {
            entity_type: EntityType::Lead,
            entity_id: lead.id.clone(),
            user_id: lead.user_id.clone(),
            client_name: lead.client_name.clone(),
            stall_type: StallType::NoResponse,
            money_at_risk: 0,
            confidence: lead_no_response_confidence(hours),
            hours_stalled: hours,
        })
    }

    pub fn classify_job(&self, job: &Job, now: DateTime<Utc>) -> Option<StallCandidate> {
        match job.status {
            JobStatus::Scheduled => {}
            JobStatus::InProgress | JobStatus::Completed | JobStatus::Cancelled => return None,
        }

        let (Some(date), Some(time)) = (job.scheduled_date.as_deref(), job.scheduled_time.as_deref())
        else {
            tracing::debug!(job = %job.id, "scheduled job has no date/time; skipping");
            return None;
        };
        let Some(scheduled_at) = parse_schedule(date, time) else {
            tracing::debug!(job = %job.id, date, time, "unparsable schedule; skipping");
            return None;
        };

        let hours = hours_between(scheduled_at, now);
        if hours < self.thresholds.job_overdue_hours {
            return None;
        }
        Some(StallCandidate {
            entity_type: EntityType::Job,
            entity_id: job.id.clone(),
            user_id: job.user_id.clone(),
            client_name: job.client_name.clone(),
            stall_type: StallType::Overdue,
            money_at_risk: job.price.unwrap_or(0),
            confidence: job_overdue_confidence(hours),
            hours_stalled: hours,
        })
    }

    pub fn classify_invoice(&self, invoice: &Invoice, now: DateTime<Utc>) -> Option<StallCandidate> {
        let (stall_type, hours, confidence) = match invoice.status {
            InvoiceStatus::Paid => return None,
            InvoiceStatus::Draft => {
                let hours = hours_between(invoice.created_at, now);
                if hours < self.thresholds.invoice_draft_hours {
                    return None;
                }
                (StallType::DraftAging, hours, invoice_draft_confidence(hours))
            }
            InvoiceStatus::Sent | InvoiceStatus::Viewed => {
                let hours = hours_between(invoice.sent_at?, now);
                if hours < self.thresholds.invoice_idle_hours {
                    return None;
                }
                let stall_type = if invoice.status == InvoiceStatus::Viewed {
                    StallType::ViewedUnpaid
                } else {
                    StallType::Idle
                };
                (stall_type, hours, invoice_idle_confidence(hours))
            }
        };

        Some(StallCandidate {
            entity_type: EntityType::Invoice,
            entity_id: invoice.id.clone(),
            user_id: invoice.user_id.clone(),
            client_name: invoice.client_name.clone(),
            stall_type,
            money_at_risk: invoice.amount,
            confidence,
            hours_stalled: hours,
        })
    }
}
