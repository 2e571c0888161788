use crate::classifier::StallCandidate;
use crate::types::{format_cents, ActionType, EntityType, StallType};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Recommendation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub action: ActionType,
    pub reason: String,
    pub auto_executable: bool,
}

// ---------------------------------------------------------------------------
// RecommendationRule
// ---------------------------------------------------------------------------

/// One row of the recommendation table. First match wins.
pub struct RecommendationRule {
    pub id: &'static str,
    pub entity_type: EntityType,
    pub stall_type: StallType,
    pub action: ActionType,
    pub auto_executable: bool,
    pub reason: fn(&StallCandidate) -> String,
}

impl RecommendationRule {
    fn matches(&self, candidate: &StallCandidate) -> bool {
        self.entity_type == candidate.entity_type && self.stall_type == candidate.stall_type
    }
}

// ---------------------------------------------------------------------------
// Reason helpers
// ---------------------------------------------------------------------------

/// `30 hours` below two days, `3 days` above.
fn describe_delay(hours: f64) -> String {
    let whole = hours.floor().max(0.0) as i64;
    if whole < 48 {
        let unit = if whole == 1 { "hour" } else { "hours" };
        format!("{whole} {unit}")
    } else {
        format!("{} days", whole / 24)
    }
}

fn draft_reason(c: &StallCandidate) -> String {
    format!(
        "Invoice for {} ({}) has been sitting in drafts for {}.",
        c.client_name,
        format_cents(c.money_at_risk),
        describe_delay(c.hours_stalled)
    )
}

fn idle_reason(c: &StallCandidate) -> String {
    format!(
        "{} hasn't paid the {} invoice sent {} ago.",
        c.client_name,
        format_cents(c.money_at_risk),
        describe_delay(c.hours_stalled)
    )
}

fn viewed_reason(c: &StallCandidate) -> String {
    format!(
        "{} opened the {} invoice but it is still unpaid after {}.",
        c.client_name,
        format_cents(c.money_at_risk),
        describe_delay(c.hours_stalled)
    )
}

fn overdue_reason(c: &StallCandidate) -> String {
    format!(
        "The job for {} was scheduled {} ago and hasn't been started.",
        c.client_name,
        describe_delay(c.hours_stalled)
    )
}

fn no_response_reason(c: &StallCandidate) -> String {
    format!(
        "{} hasn't heard back in {}.",
        c.client_name,
        describe_delay(c.hours_stalled)
    )
}

// ---------------------------------------------------------------------------
// Default rule table
// ---------------------------------------------------------------------------

pub fn default_rules() -> Vec<RecommendationRule> {
    vec![
        RecommendationRule {
            id: "invoice_draft_aging",
            entity_type: EntityType::Invoice,
            stall_type: StallType::DraftAging,
            action: ActionType::SendInvoiceReminder,
            auto_executable: false,
            reason: draft_reason,
        },
        RecommendationRule {
            id: "invoice_idle",
            entity_type: EntityType::Invoice,
            stall_type: StallType::Idle,
            action: ActionType::SendInvoiceReminder,
            auto_executable: true,
            reason: idle_reason,
        },
        RecommendationRule {
            id: "invoice_viewed_unpaid",
            entity_type: EntityType::Invoice,
            stall_type: StallType::ViewedUnpaid,
            action: ActionType::AutoSendGentleNudge,
            auto_executable: true,
            reason: viewed_reason,
        },
        RecommendationRule {
            id: "job_overdue",
            entity_type: EntityType::Job,
            stall_type: StallType::Overdue,
            action: ActionType::SuggestStatusUpdate,
            auto_executable: false,
            reason: overdue_reason,
        },
        RecommendationRule {
            id: "lead_no_response",
            entity_type: EntityType::Lead,
            stall_type: StallType::NoResponse,
            action: ActionType::SendFollowUpText,
            auto_executable: false,
            reason: no_response_reason,
        },
    ]
}

// ---------------------------------------------------------------------------
// ActionRecommender
// ---------------------------------------------------------------------------

pub struct ActionRecommender {
    rules: Vec<RecommendationRule>,
}

impl Default for ActionRecommender {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl ActionRecommender {
    pub fn new(rules: Vec<RecommendationRule>) -> Self {
        Self { rules }
    }

    /// `None` when no rule covers the candidate's `(entity_type, stall_type)`.
    pub fn recommend(&self, candidate: &StallCandidate) -> Option<Recommendation> {
        let rule = self.rules.iter().find(|r| r.matches(candidate))?;
        tracing::debug!(rule = rule.id, entity = %candidate.key(), "recommendation matched");
        Some(Recommendation {
            action: rule.action,
            reason: (rule.reason)(candidate),
            auto_executable: rule.auto_executable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(entity_type: EntityType, stall_type: StallType) -> StallCandidate {
        StallCandidate {
            entity_type,
            entity_id: "e1".into(),
            user_id: "u1".into(),
            client_name: "Jordan".into(),
            stall_type,
            money_at_risk: 12500,
            confidence: 0.7,
            hours_stalled: 30.0,
        }
    }

    #[test]
    fn table_maps_every_supported_pair() {
        let r = ActionRecommender::default();
        let cases = [
            (EntityType::Invoice, StallType::DraftAging, ActionType::SendInvoiceReminder, false),
            (EntityType::Invoice, StallType::Idle, ActionType::SendInvoiceReminder, true),
            (EntityType::Invoice, StallType::ViewedUnpaid, ActionType::AutoSendGentleNudge, true),
            (EntityType::Job, StallType::Overdue, ActionType::SuggestStatusUpdate, false),
            (EntityType::Lead, StallType::NoResponse, ActionType::SendFollowUpText, false),
        ];
        for (et, st, action, auto) in cases {
            let rec = r.recommend(&candidate(et, st)).expect("rule");
            assert_eq!(rec.action, action, "{et}/{st}");
            assert_eq!(rec.auto_executable, auto, "{et}/{st}");
            assert!(rec.reason.contains("Jordan"));
        }
    }

    #[test]
    fn unmatched_pair_yields_none() {
        let r = ActionRecommender::default();
        assert!(r.recommend(&candidate(EntityType::Lead, StallType::Overdue)).is_none());
        assert!(r.recommend(&candidate(EntityType::Job, StallType::Idle)).is_none());
    }

    #[test]
    fn reasons_name_amount_and_delay() {
        let r = ActionRecommender::default();
        let rec = r
            .recommend(&candidate(EntityType::Invoice, StallType::DraftAging))
            .unwrap();
        assert_eq!(
            rec.reason,
            "Invoice for Jordan ($125.00) has been sitting in drafts for 30 hours."
        );

        let mut c = candidate(EntityType::Invoice, StallType::Idle);
        c.hours_stalled = 100.0;
        let rec = r.recommend(&c).unwrap();
        assert!(rec.reason.contains("4 days"), "{}", rec.reason);
    }

    #[test]
    fn describe_delay_singular_hour() {
        assert_eq!(describe_delay(1.5), "1 hour");
        assert_eq!(describe_delay(47.9), "47 hours");
        assert_eq!(describe_delay(48.0), "2 days");
    }
}
