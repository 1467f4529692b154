//! Fake collaborators shared by the unit tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use classguard_integrations::{
    BackendError, CommandSource, IngestItem, IngestionBackend, ItemResult, ItemStatus, Proximity,
    ProximitySource, PushCommand, RejectReason,
};
use classguard_storage::{Database, OutboxState, Partition};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::config::BufferConfig;
use crate::device::{
    Classification, DeviceSet, FocusObserver, OverlaySurface, PermissionProbe, ScreenCapture,
    ScreenClassifier, ScreenImage, Unconfigured,
};
use crate::event_buffer::EventBuffer;

pub fn memory_buffer() -> Arc<EventBuffer> {
    Arc::new(EventBuffer::new(
        Arc::new(Database::new_in_memory().unwrap()),
        &BufferConfig::default(),
    ))
}

/// All entries of a partition, in append order
pub fn entries(buffer: &EventBuffer, partition: Partition) -> Vec<classguard_storage::OutboxEntry> {
    buffer
        .database()
        .list_outbox(partition, None, 10_000)
        .unwrap()
}

pub fn states(buffer: &EventBuffer, partition: Partition) -> Vec<OutboxState> {
    entries(buffer, partition).iter().map(|e| e.state).collect()
}

#[derive(Default)]
pub struct RecordingOverlay {
    pub shows: AtomicUsize,
    pub reasserts: AtomicUsize,
    pub hides: AtomicUsize,
}

#[async_trait]
impl OverlaySurface for RecordingOverlay {
    async fn show(&self) -> Result<()> {
        self.shows.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reassert(&self) -> Result<()> {
        self.reasserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn hide(&self) -> Result<()> {
        self.hides.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct StaticCapture;

#[async_trait]
impl ScreenCapture for StaticCapture {
    async fn capture(&self) -> Result<ScreenImage> {
        Ok(ScreenImage {
            bytes: vec![0x89, 0x50, 0x4e, 0x47],
            captured_at: Utc::now(),
        })
    }
}

/// Answers from a script, then errors once the script runs out
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Option<(String, f32)>>>,
}

impl ScriptedClassifier {
    /// `None` in the script is a classifier failure
    pub fn new(script: Vec<Option<(&str, f32)>>) -> Self {
        Self {
            script: Mutex::new(
                script
                    .into_iter()
                    .map(|step| step.map(|(label, confidence)| (label.to_string(), confidence)))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl ScreenClassifier for ScriptedClassifier {
    async fn classify(&self, _image: &ScreenImage) -> Result<Classification> {
        match self.script.lock().unwrap().pop_front() {
            Some(Some((label, confidence))) => Ok(Classification { label, confidence }),
            Some(None) => anyhow::bail!("model unavailable"),
            None => anyhow::bail!("script exhausted"),
        }
    }
}

#[derive(Default)]
pub struct ToggleFocus {
    background: AtomicBool,
}

impl ToggleFocus {
    pub fn set_foreground(&self, foreground: bool) {
        self.background.store(!foreground, Ordering::SeqCst);
    }
}

#[async_trait]
impl FocusObserver for ToggleFocus {
    async fn is_foreground(&self) -> Result<bool> {
        Ok(!self.background.load(Ordering::SeqCst))
    }
}

pub struct TogglePermission(pub AtomicBool);

#[async_trait]
impl PermissionProbe for TogglePermission {
    async fn granted(&self) -> Result<bool> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

pub struct FixedProximity(pub Proximity);

#[async_trait]
impl ProximitySource for FixedProximity {
    async fn proximity(&self) -> Option<Proximity> {
        Some(self.0)
    }
}

pub fn device_set(
    classifier: Arc<dyn ScreenClassifier>,
    focus: Arc<dyn FocusObserver>,
    overlay: Arc<dyn OverlaySurface>,
) -> DeviceSet {
    DeviceSet {
        capture: Arc::new(StaticCapture),
        classifier,
        focus,
        overlay,
        permissions: Arc::new(Unconfigured("permission probe")),
        proximity: None,
    }
}

/// One scripted reply to `send_batch`
pub enum BatchReply {
    AcceptAll,
    /// Every item comes back rejected with this reason
    RejectAll(RejectReason),
    /// The first `n` items are accepted, the rest rejected
    AcceptFirst(usize),
    Fail(BackendError),
}

/// Backend that follows a script and accepts everything after it
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<BatchReply>>,
    finalize_replies: Mutex<VecDeque<Result<(), BackendError>>>,
    pub batches: Mutex<Vec<Vec<IngestItem>>>,
    pub finalize_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn with_replies(replies: Vec<BatchReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn script_finalize(&self, replies: Vec<Result<(), BackendError>>) {
        self.finalize_replies.lock().unwrap().extend(replies);
    }

    /// Every idempotency key sent, in order, including resends
    pub fn sent_keys(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(IngestItem::key)
            .collect()
    }
}

fn verdict(item: &IngestItem, status: ItemStatus, reason: Option<RejectReason>) -> ItemResult {
    ItemResult {
        key: item.key(),
        status,
        reason,
        detail: None,
    }
}

#[async_trait]
impl IngestionBackend for ScriptedBackend {
    async fn send_batch(&self, items: &[IngestItem]) -> Result<Vec<ItemResult>, BackendError> {
        self.batches.lock().unwrap().push(items.to_vec());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(BatchReply::AcceptAll);

        match reply {
            BatchReply::AcceptAll => Ok(items
                .iter()
                .map(|item| verdict(item, ItemStatus::Accepted, None))
                .collect()),
            BatchReply::RejectAll(reason) => Ok(items
                .iter()
                .map(|item| verdict(item, ItemStatus::Rejected, Some(reason.clone())))
                .collect()),
            BatchReply::AcceptFirst(n) => Ok(items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    if i < n {
                        verdict(item, ItemStatus::Accepted, None)
                    } else {
                        verdict(item, ItemStatus::Rejected, Some(RejectReason::Other))
                    }
                })
                .collect()),
            BatchReply::Fail(err) => Err(err),
        }
    }

    async fn finalize_session(
        &self,
        _device_id: &str,
        _session_id: Uuid,
    ) -> Result<(), BackendError> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        self.finalize_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

/// Push channel that hands out scripted polls, then idles
#[derive(Default)]
pub struct ScriptedCommands {
    polls: Mutex<VecDeque<Result<Vec<PushCommand>, BackendError>>>,
    pub acknowledged: Mutex<Vec<String>>,
}

impl ScriptedCommands {
    pub fn new(polls: Vec<Vec<PushCommand>>) -> Self {
        Self::with_results(polls.into_iter().map(Ok).collect())
    }

    /// Polls that may fail, answered in order
    pub fn with_results(polls: Vec<Result<Vec<PushCommand>, BackendError>>) -> Self {
        Self {
            polls: Mutex::new(polls.into()),
            acknowledged: Mutex::default(),
        }
    }
}

#[async_trait]
impl CommandSource for ScriptedCommands {
    async fn poll(&self) -> Result<Vec<PushCommand>, BackendError> {
        let next = self.polls.lock().unwrap().pop_front();
        match next {
            Some(polled) => polled,
            None => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn acknowledge(&self, command_ids: &[String]) -> Result<(), BackendError> {
        self.acknowledged
            .lock()
            .unwrap()
            .extend_from_slice(command_ids);
        Ok(())
    }
}
