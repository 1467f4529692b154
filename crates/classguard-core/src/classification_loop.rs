//! Periodic capture, classify and decide cycle.
//!
//! Every tick appends exactly one attention event, whatever happened. The
//! loop never waits on the network and a failing classifier only degrades
//! the decision to ALLOW.

use chrono::Utc;
use classguard_integrations::Proximity;
use classguard_storage::{AttentionEvent, Category, Decision, OutboxPayload};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::device::DeviceSet;
use crate::enforcement::GuardHandle;
use crate::error::{CoreError, CoreResult};
use crate::event_buffer::EventBuffer;
use crate::policy::SessionPolicy;

pub struct ClassificationLoop {
    device_id: String,
    session_id: Uuid,
    policy: SessionPolicy,
    devices: DeviceSet,
    buffer: Arc<EventBuffer>,
    guard: GuardHandle,
}

impl ClassificationLoop {
    #[must_use]
    pub const fn new(
        device_id: String,
        session_id: Uuid,
        policy: SessionPolicy,
        devices: DeviceSet,
        buffer: Arc<EventBuffer>,
        guard: GuardHandle,
    ) -> Self {
        Self {
            device_id,
            session_id,
            policy,
            devices,
            buffer,
            guard,
        }
    }

    async fn classify(&self) -> CoreResult<(Category, f32)> {
        let image = self
            .devices
            .capture
            .capture()
            .await
            .map_err(|e| CoreError::Classification(format!("capture: {e:#}")))?;
        let result = self
            .devices
            .classifier
            .classify(&image)
            .await
            .map_err(|e| CoreError::Classification(format!("{e:#}")))?;
        if !(0.0..=1.0).contains(&result.confidence) {
            return Err(CoreError::Classification(format!(
                "confidence {} outside 0..=1",
                result.confidence
            )));
        }

        // Labels outside the known set count as UNKNOWN
        let category = result.label.parse().unwrap_or_else(|_| {
            log::debug!("Unrecognized label {:?}", result.label);
            Category::Unknown
        });
        Ok((category, result.confidence))
    }

    async fn is_away(&self) -> bool {
        if !self.policy.relax_when_away {
            return false;
        }
        match &self.devices.proximity {
            Some(hub) => hub.proximity().await == Some(Proximity::Away),
            None => false,
        }
    }

    /// Run one cycle and return the event that was appended
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the event could not be written; the
    /// decision is still forwarded to the guard
    pub async fn tick(&self) -> CoreResult<AttentionEvent> {
        let captured_at = Utc::now();
        let mut event = AttentionEvent {
            device_id: self.device_id.clone(),
            sequence_number: 0,
            session_id: self.session_id,
            category: Category::Unknown,
            raw_category: None,
            confidence: 0.0,
            decision: Decision::Allow,
            classification_error: false,
            away_from_hub: false,
            captured_at,
        };

        match self.classify().await {
            Ok((category, confidence)) if confidence < self.policy.confidence_threshold => {
                event.raw_category = Some(category);
                event.confidence = confidence;
            }
            Ok((category, confidence)) => {
                event.category = category;
                event.confidence = confidence;
                event.decision = self.policy.table.decide(category);
            }
            Err(e) => {
                log::warn!("{e}");
                event.classification_error = true;
            }
        }

        if event.decision == Decision::Block && self.is_away().await {
            event.decision = Decision::Allow;
            event.away_from_hub = true;
        }

        let stored = self.buffer.enqueue(OutboxPayload::Attention(event.clone()));

        if event.decision == Decision::Block {
            self.guard.lock().await.on_decision(Decision::Block).await?;
        }

        let entry = stored?;
        event.sequence_number = entry.payload.sequence_number().unwrap_or_default();
        log::debug!(
            "Tick #{}: {} {:.2} -> {}",
            event.sequence_number,
            event.category,
            event.confidence,
            event.decision
        );
        Ok(event)
    }

    /// Tick on the policy interval until the task is aborted
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.policy.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.tick().await {
                    log::error!("Classification tick failed: {e}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassificationConfig, EnforcementConfig};
    use crate::device::{FocusObserver, OverlaySurface, ScreenClassifier};
    use crate::enforcement::{EnforcementGuard, GuardState};
    use crate::testing::{
        device_set, entries, memory_buffer, FixedProximity, RecordingOverlay, ScriptedClassifier,
        ToggleFocus,
    };
    use classguard_storage::Partition;

    fn setup(
        script: Vec<Option<(&str, f32)>>,
    ) -> (ClassificationLoop, Arc<EventBuffer>, GuardHandle) {
        let buffer = memory_buffer();
        let session_id = Uuid::new_v4();
        let overlay: Arc<dyn OverlaySurface> = Arc::new(RecordingOverlay::default());
        let guard = EnforcementGuard::new(
            "dev-1".to_string(),
            session_id,
            Arc::clone(&buffer),
            Arc::clone(&overlay),
            &EnforcementConfig::default(),
        )
        .into_handle();
        let classifier: Arc<dyn ScreenClassifier> = Arc::new(ScriptedClassifier::new(script));
        let focus: Arc<dyn FocusObserver> = Arc::new(ToggleFocus::default());
        let lp = ClassificationLoop::new(
            "dev-1".to_string(),
            session_id,
            SessionPolicy::resolve(&ClassificationConfig::default(), None),
            device_set(classifier, focus, overlay),
            Arc::clone(&buffer),
            Arc::clone(&guard),
        );
        (lp, buffer, guard)
    }

    #[tokio::test]
    async fn test_block_category_locks_guard() {
        let (lp, buffer, guard) = setup(vec![Some(("GAME", 0.9))]);

        let event = lp.tick().await.unwrap();
        assert_eq!(event.category, Category::Game);
        assert_eq!(event.decision, Decision::Block);
        assert_eq!(event.sequence_number, 1);

        assert_eq!(entries(&buffer, Partition::Attention).len(), 1);
        assert_eq!(guard.lock().await.state(), GuardState::Locked);
        assert_eq!(entries(&buffer, Partition::Enforcement).len(), 1);
    }

    #[tokio::test]
    async fn test_allow_is_still_recorded() {
        let (lp, buffer, guard) = setup(vec![Some(("EDUCATION", 0.95))]);

        let event = lp.tick().await.unwrap();
        assert_eq!(event.decision, Decision::Allow);
        assert_eq!(entries(&buffer, Partition::Attention).len(), 1);
        assert_eq!(guard.lock().await.state(), GuardState::Inactive);
    }

    #[tokio::test]
    async fn test_low_confidence_is_unknown_and_allowed() {
        let (lp, _buffer, guard) = setup(vec![Some(("GAME", 0.3))]);

        let event = lp.tick().await.unwrap();
        assert_eq!(event.category, Category::Unknown);
        assert_eq!(event.raw_category, Some(Category::Game));
        assert_eq!(event.decision, Decision::Allow);
        assert!(!event.classification_error);
        assert_eq!(guard.lock().await.state(), GuardState::Inactive);
    }

    #[tokio::test]
    async fn test_classifier_failure_degrades_to_allow() {
        let (lp, buffer, _guard) = setup(vec![None, Some(("SOCIAL", 0.8))]);

        let failed = lp.tick().await.unwrap();
        assert!(failed.classification_error);
        assert_eq!(failed.decision, Decision::Allow);
        assert_eq!(failed.category, Category::Unknown);

        // The loop keeps going
        let next = lp.tick().await.unwrap();
        assert_eq!(next.decision, Decision::Block);
        assert_eq!(next.sequence_number, failed.sequence_number + 1);
        assert_eq!(entries(&buffer, Partition::Attention).len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_confidence_degrades_to_allow() {
        let (lp, buffer, guard) = setup(vec![
            Some(("GAME", f32::NAN)),
            Some(("GAME", 1.5)),
            Some(("EDUCATION", 0.9)),
        ]);

        for _ in 0..2 {
            let event = lp.tick().await.unwrap();
            assert!(event.classification_error);
            assert_eq!(event.category, Category::Unknown);
            assert_eq!(event.decision, Decision::Allow);
            assert!(event.confidence.is_finite());
        }
        assert_eq!(guard.lock().await.state(), GuardState::Inactive);

        lp.tick().await.unwrap();
        let lease = buffer.claim(Partition::Attention).unwrap();
        assert_eq!(buffer.dequeue_batch(&lease, 10).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unrecognized_label_is_unknown() {
        let (lp, _buffer, _guard) = setup(vec![Some(("SPREADSHEET", 0.99))]);
        let event = lp.tick().await.unwrap();
        assert_eq!(event.category, Category::Unknown);
        assert_eq!(event.decision, Decision::Allow);
    }

    #[tokio::test]
    async fn test_away_from_hub_relaxes_block() {
        let (mut lp, buffer, guard) = setup(vec![Some(("VIDEO", 0.9))]);
        lp.devices.proximity = Some(Arc::new(FixedProximity(Proximity::Away)));

        let event = lp.tick().await.unwrap();
        assert_eq!(event.category, Category::Video);
        assert_eq!(event.decision, Decision::Allow);
        assert!(event.away_from_hub);
        assert_eq!(guard.lock().await.state(), GuardState::Inactive);
        assert!(entries(&buffer, Partition::Enforcement).is_empty());
    }

    #[tokio::test]
    async fn test_present_at_hub_keeps_policy() {
        let (mut lp, _buffer, guard) = setup(vec![Some(("VIDEO", 0.9))]);
        lp.devices.proximity = Some(Arc::new(FixedProximity(Proximity::Present)));

        let event = lp.tick().await.unwrap();
        assert_eq!(event.decision, Decision::Block);
        assert!(!event.away_from_hub);
        assert_eq!(guard.lock().await.state(), GuardState::Locked);
    }
}
