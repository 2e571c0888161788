//! Engine-owned rows: stall detections, next actions and the execution log.
//!
//! A `NextAction` is the atomic unit the user sees: one recommended step for
//! one stalled entity. Its lifecycle is derived from four timestamps rather
//! than stored as a status:
//!
//! ```text
//! Active ──act──────▶ Acted
//!    │   ──dismiss──▶ Dismissed
//!    │   ──guard────▶ AutoExecuted
//!    └── expires_at ▶ Expired
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::classifier::StallCandidate;
use crate::types::{ActionType, EntityKey, EntityType, StallType};

// ---------------------------------------------------------------------------
// StallDetection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StallDetection {
    pub id: Uuid,
    pub user_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub stall_type: StallType,
    /// Cents.
    pub money_at_risk: i64,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl StallDetection {
    pub fn from_candidate(candidate: &StallCandidate, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: candidate.user_id.clone(),
            entity_type: candidate.entity_type,
            entity_id: candidate.entity_id.clone(),
            stall_type: candidate.stall_type,
            money_at_risk: candidate.money_at_risk,
            confidence: candidate.confidence,
            detected_at: now,
            resolved_at: None,
        }
    }

    /// Copy the latest scores onto an open detection. The stall type follows
    /// the entity too (a sent invoice that gets viewed moves to `viewed_unpaid`).
    pub fn refresh(&mut self, candidate: &StallCandidate) {
        self.stall_type = candidate.stall_type;
        self.money_at_risk = candidate.money_at_risk;
        self.confidence = candidate.confidence;
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// ActionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Active,
    Acted,
    Dismissed,
    AutoExecuted,
    Expired,
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionState::Active => "active",
            ActionState::Acted => "acted",
            ActionState::Dismissed => "dismissed",
            ActionState::AutoExecuted => "auto_executed",
            ActionState::Expired => "expired",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// NextAction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextAction {
    pub id: Uuid,
    pub user_id: String,
    pub stall_detection_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub recommended_action: ActionType,
    pub reason: String,
    pub auto_executable: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dismissed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_executed_at: Option<DateTime<Utc>>,
}

impl NextAction {
    pub fn new(
        detection: &StallDetection,
        recommended_action: ActionType,
        reason: impl Into<String>,
        auto_executable: bool,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: detection.user_id.clone(),
            stall_detection_id: detection.id,
            entity_type: detection.entity_type,
            entity_id: detection.entity_id.clone(),
            recommended_action,
            reason: reason.into(),
            auto_executable,
            created_at: now,
            expires_at: now + ttl,
            acted_at: None,
            dismissed_at: None,
            auto_executed_at: None,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// Closed means a terminal timestamp is set; expiry is checked separately.
    pub fn is_closed(&self) -> bool {
        self.acted_at.is_some() || self.dismissed_at.is_some() || self.auto_executed_at.is_some()
    }

    pub fn state(&self, now: DateTime<Utc>) -> ActionState {
        if self.acted_at.is_some() {
            ActionState::Acted
        } else if self.dismissed_at.is_some() {
            ActionState::Dismissed
        } else if self.auto_executed_at.is_some() {
            ActionState::AutoExecuted
        } else if self.expires_at <= now {
            ActionState::Expired
        } else {
            ActionState::Active
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == ActionState::Active
    }

    pub fn mark_acted(&mut self, now: DateTime<Utc>) {
        self.acted_at = Some(now);
    }

    pub fn mark_dismissed(&mut self, now: DateTime<Utc>) {
        self.dismissed_at = Some(now);
    }

    pub fn mark_auto_executed(&mut self, now: DateTime<Utc>) {
        self.auto_executed_at = Some(now);
    }
}

// ---------------------------------------------------------------------------
// AutoExecutionLog
// ---------------------------------------------------------------------------

/// One autonomous send attempt. Rows are never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoExecutionLog {
    pub id: Uuid,
    pub user_id: String,
    pub next_action_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_channel: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AutoExecutionLog {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}
