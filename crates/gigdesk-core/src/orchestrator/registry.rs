//! Stall and action registries.
//!
//! `Registry` is the only writer of detections and next actions. Each entry
//! point takes the entity's lock before reading, so check-then-insert never
//! races inside one process; the store's conflict check covers the rest.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use super::bounded;
use super::locks::EntityLocks;
use super::records::{NextAction, StallDetection};
use crate::classifier::StallCandidate;
use crate::clock::Clock;
use crate::error::{GigError, Result};
use crate::recommender::ActionRecommender;
use crate::store::EntityStore;
use crate::types::EntityKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionOutcome {
    Created,
    Refreshed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionOutcome {
    Created { id: Uuid },
    AlreadyActive,
    NoRecommendation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOutcome {
    pub detection_id: Uuid,
    pub detection: DetectionOutcome,
    pub action: ActionOutcome,
}

pub struct Registry {
    store: Arc<dyn EntityStore>,
    recommender: ActionRecommender,
    locks: Arc<EntityLocks>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    call_timeout: Duration,
}

impl Registry {
    pub fn new(
        store: Arc<dyn EntityStore>,
        locks: Arc<EntityLocks>,
        clock: Arc<dyn Clock>,
        ttl: chrono::Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            recommender: ActionRecommender::default(),
            locks,
            clock,
            ttl,
            call_timeout,
        }
    }

    /// Register one candidate: upsert its detection, then add a next action
    /// unless one is already active for the entity.
    pub async fn process_stall_candidate(
        &self,
        candidate: &StallCandidate,
    ) -> Result<ProcessOutcome> {
        let key = candidate.key();
        let _guard = self.locks.lock(&key).await;
        let now = self.clock.now();
        let limit = self.call_timeout;

        let (detection, detection_outcome) = self.upsert_detection(candidate, &key).await?;

        let active = bounded(
            "get_active_next_action_for_entity",
            limit,
            self.store.get_active_next_action_for_entity(&key, now),
        )
        .await?;
        if active.is_some() {
            return Ok(ProcessOutcome {
                detection_id: detection.id,
                detection: detection_outcome,
                action: ActionOutcome::AlreadyActive,
            });
        }

        let Some(rec) = self.recommender.recommend(candidate) else {
            tracing::debug!(entity = %key, stall = %candidate.stall_type, "no recommendation");
            return Ok(ProcessOutcome {
                detection_id: detection.id,
                detection: detection_outcome,
                action: ActionOutcome::NoRecommendation,
            });
        };

        let action = NextAction::new(
            &detection,
            rec.action,
            rec.reason,
            rec.auto_executable,
            now,
            self.ttl,
        );
        let action_outcome = match bounded(
            "create_next_action",
            limit,
            self.store.create_next_action(&action, now),
        )
        .await
        {
            Ok(()) => {
                tracing::debug!(entity = %key, action = %action.recommended_action, "next action created");
                ActionOutcome::Created { id: action.id }
            }
            Err(GigError::Conflict { .. }) => ActionOutcome::AlreadyActive,
            Err(e) => return Err(e),
        };

        Ok(ProcessOutcome {
            detection_id: detection.id,
            detection: detection_outcome,
            action: action_outcome,
        })
    }

    async fn upsert_detection(
        &self,
        candidate: &StallCandidate,
        key: &EntityKey,
    ) -> Result<(StallDetection, DetectionOutcome)> {
        let limit = self.call_timeout;
        if let Some(existing) = self.refresh_open(candidate, key).await? {
            return Ok((existing, DetectionOutcome::Refreshed));
        }

        let detection = StallDetection::from_candidate(candidate, self.clock.now());
        match bounded(
            "create_stall_detection",
            limit,
            self.store.create_stall_detection(&detection),
        )
        .await
        {
            Ok(()) => {
                tracing::debug!(entity = %key, stall = %detection.stall_type, "stall detected");
                Ok((detection, DetectionOutcome::Created))
            }
            // Another writer opened one between our read and insert.
            Err(e @ GigError::Conflict { .. }) => match self.refresh_open(candidate, key).await? {
                Some(existing) => Ok((existing, DetectionOutcome::Refreshed)),
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn refresh_open(
        &self,
        candidate: &StallCandidate,
        key: &EntityKey,
    ) -> Result<Option<StallDetection>> {
        let limit = self.call_timeout;
        let open = bounded(
            "get_active_stall_for_entity",
            limit,
            self.store.get_active_stall_for_entity(key),
        )
        .await?;
        let Some(mut detection) = open else {
            return Ok(None);
        };
        detection.refresh(candidate);
        bounded(
            "update_stall_detection",
            limit,
            self.store.update_stall_detection(&detection),
        )
        .await?;
        Ok(Some(detection))
    }

    async fn load_action(&self, id: Uuid) -> Result<NextAction> {
        bounded(
            "get_next_action",
            self.call_timeout,
            self.store.get_next_action(id),
        )
        .await?
        .ok_or_else(|| GigError::not_found("next action", id))
    }

    /// Mark the action acted on and resolve its detection.
    pub async fn act_on_action(&self, id: Uuid) -> Result<NextAction> {
        let key = self.load_action(id).await?.key();
        let _guard = self.locks.lock(&key).await;
        let now = self.clock.now();
        let limit = self.call_timeout;

        let action = bounded(
            "act_on_next_action",
            limit,
            self.store.act_on_next_action(id, now),
        )
        .await?;
        bounded(
            "resolve_stall_detection",
            limit,
            self.store.resolve_stall_detection(action.stall_detection_id, now),
        )
        .await?;
        tracing::info!(entity = %key, action = %action.recommended_action, "action taken");
        Ok(action)
    }

    /// Mark the action dismissed. The detection stays open, so a still-stalled
    /// entity gets a fresh action on the next sweep.
    pub async fn dismiss_action(&self, id: Uuid) -> Result<NextAction> {
        let key = self.load_action(id).await?.key();
        let _guard = self.locks.lock(&key).await;
        let action = bounded(
            "dismiss_next_action",
            self.call_timeout,
            self.store.dismiss_next_action(id, self.clock.now()),
        )
        .await?;
        tracing::info!(entity = %key, action = %action.recommended_action, "action dismissed");
        Ok(action)
    }

    pub async fn expire_actions(&self) -> Result<usize> {
        bounded(
            "expire_next_actions",
            self.call_timeout,
            self.store.expire_next_actions(self.clock.now()),
        )
        .await
    }

    /// Resolve every open detection of `user_id` whose entity is not in
    /// `still_stalled`, retiring its active action. Returns how many were
    /// resolved; per-entity failures are logged and skipped.
    pub async fn resolve_recovered(
        &self,
        user_id: &str,
        still_stalled: &HashSet<EntityKey>,
    ) -> Result<usize> {
        let open = bounded(
            "list_open_stall_detections",
            self.call_timeout,
            self.store.list_open_stall_detections(user_id),
        )
        .await?;

        let mut resolved = 0;
        for detection in open {
            let key = detection.key();
            if still_stalled.contains(&key) {
                continue;
            }
            match self.resolve_one(&detection).await {
                Ok(()) => resolved += 1,
                Err(e) => tracing::warn!(entity = %key, error = %e, "failed to resolve recovered entity"),
            }
        }
        Ok(resolved)
    }

    async fn resolve_one(&self, detection: &StallDetection) -> Result<()> {
        let key = detection.key();
        let _guard = self.locks.lock(&key).await;
        let now = self.clock.now();
        let limit = self.call_timeout;

        let active = bounded(
            "get_active_next_action_for_entity",
            limit,
            self.store.get_active_next_action_for_entity(&key, now),
        )
        .await?;
        if let Some(mut action) = active {
            action.expires_at = now;
            bounded(
                "update_next_action",
                limit,
                self.store.update_next_action(&action),
            )
            .await?;
        }
        bounded(
            "resolve_stall_detection",
            limit,
            self.store.resolve_stall_detection(detection.id, now),
        )
        .await?;
        tracing::debug!(entity = %key, "entity recovered; detection resolved");
        Ok(())
    }
}
