use super::*;
use crate::testing::{entries, memory_buffer, RecordingOverlay, ToggleFocus};
use classguard_storage::Partition;
use std::sync::atomic::Ordering;

fn config() -> EnforcementConfig {
    EnforcementConfig {
        grace_period_secs: 10,
        reassert_interval_secs: 3,
        focus_poll_ms: 10,
        ..EnforcementConfig::default()
    }
}

fn guard(buffer: &Arc<EventBuffer>, overlay: &Arc<RecordingOverlay>) -> EnforcementGuard {
    EnforcementGuard::new(
        "dev-1".to_string(),
        Uuid::new_v4(),
        Arc::clone(buffer),
        Arc::clone(overlay) as Arc<dyn OverlaySurface>,
        &config(),
    )
}

fn kinds(buffer: &EventBuffer) -> Vec<EnforcementKind> {
    entries(buffer, Partition::Enforcement)
        .into_iter()
        .filter_map(|entry| match entry.payload {
            OutboxPayload::Enforcement(event) => Some(event.kind),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_block_decision_locks_once() {
    let buffer = memory_buffer();
    let overlay = Arc::new(RecordingOverlay::default());
    let mut guard = guard(&buffer, &overlay);

    assert_eq!(
        guard.on_decision(Decision::Block).await.unwrap(),
        Some(EnforcementKind::Locked)
    );
    assert_eq!(guard.on_decision(Decision::Block).await.unwrap(), None);
    assert_eq!(guard.on_decision(Decision::Allow).await.unwrap(), None);

    assert_eq!(guard.state(), GuardState::Locked);
    assert_eq!(kinds(&buffer), vec![EnforcementKind::Locked]);
    assert_eq!(overlay.shows.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_allow_does_not_lock() {
    let buffer = memory_buffer();
    let overlay = Arc::new(RecordingOverlay::default());
    let mut guard = guard(&buffer, &overlay);

    assert_eq!(guard.on_decision(Decision::Allow).await.unwrap(), None);
    assert_eq!(guard.state(), GuardState::Inactive);
    assert!(kinds(&buffer).is_empty());
}

#[tokio::test]
async fn test_focus_is_ignored_while_inactive() {
    let buffer = memory_buffer();
    let overlay = Arc::new(RecordingOverlay::default());
    let mut guard = guard(&buffer, &overlay);

    assert_eq!(guard.on_focus(false, Instant::now()).await.unwrap(), None);
    assert_eq!(guard.state(), GuardState::Inactive);
}

#[tokio::test]
async fn test_return_within_grace_restores() {
    let buffer = memory_buffer();
    let overlay = Arc::new(RecordingOverlay::default());
    let mut guard = guard(&buffer, &overlay);
    let start = Instant::now();

    guard.lock().await.unwrap();
    guard.on_focus(false, start).await.unwrap();
    assert_eq!(guard.next_deadline(), Some(start + Duration::from_secs(10)));

    // Timer fires early: nothing yet
    assert_eq!(
        guard.on_timer(start + Duration::from_secs(5)).await.unwrap(),
        None
    );
    assert_eq!(
        guard
            .on_focus(true, start + Duration::from_secs(6))
            .await
            .unwrap(),
        Some(EnforcementKind::Restored)
    );
    // Focus readings while locked and in front are no-ops
    assert_eq!(
        guard
            .on_focus(true, start + Duration::from_secs(7))
            .await
            .unwrap(),
        None
    );

    assert_eq!(
        kinds(&buffer),
        vec![
            EnforcementKind::Locked,
            EnforcementKind::Escaped,
            EnforcementKind::Restored
        ]
    );
    assert_eq!(overlay.reasserts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_grace_expiry_escalates_without_restore() {
    let buffer = memory_buffer();
    let overlay = Arc::new(RecordingOverlay::default());
    let mut guard = guard(&buffer, &overlay);
    let start = Instant::now();

    guard.lock().await.unwrap();
    guard.on_focus(false, start).await.unwrap();
    // Repeated background readings do not re-emit
    assert_eq!(
        guard
            .on_focus(false, start + Duration::from_secs(2))
            .await
            .unwrap(),
        None
    );
    assert_eq!(
        guard.on_timer(start + Duration::from_secs(10)).await.unwrap(),
        Some(EnforcementKind::Escalated)
    );

    assert_eq!(
        kinds(&buffer),
        vec![
            EnforcementKind::Locked,
            EnforcementKind::Escaped,
            EnforcementKind::Escalated
        ]
    );
}

#[tokio::test]
async fn test_escalated_reasserts_every_interval() {
    let buffer = memory_buffer();
    let overlay = Arc::new(RecordingOverlay::default());
    let mut guard = guard(&buffer, &overlay);
    let start = Instant::now();

    guard.lock().await.unwrap();
    guard.on_focus(false, start).await.unwrap();
    let escalated_at = start + Duration::from_secs(10);
    guard.on_timer(escalated_at).await.unwrap();
    assert_eq!(overlay.reasserts.load(Ordering::SeqCst), 1);

    // Too soon
    guard
        .on_timer(escalated_at + Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(overlay.reasserts.load(Ordering::SeqCst), 1);

    guard
        .on_timer(escalated_at + Duration::from_secs(3))
        .await
        .unwrap();
    guard
        .on_timer(escalated_at + Duration::from_secs(6))
        .await
        .unwrap();
    assert_eq!(overlay.reasserts.load(Ordering::SeqCst), 3);

    // Reasserting is not a transition
    assert_eq!(kinds(&buffer).len(), 3);

    assert_eq!(
        guard
            .on_focus(true, escalated_at + Duration::from_secs(7))
            .await
            .unwrap(),
        Some(EnforcementKind::Restored)
    );
    assert_eq!(guard.state(), GuardState::Locked);
}

#[tokio::test]
async fn test_restored_always_follows_escaped() {
    let buffer = memory_buffer();
    let overlay = Arc::new(RecordingOverlay::default());
    let mut guard = guard(&buffer, &overlay);
    let mut now = Instant::now();

    guard.lock().await.unwrap();
    for foreground in [false, true, true, false, false, true, true] {
        now += Duration::from_secs(1);
        guard.on_focus(foreground, now).await.unwrap();
        guard.on_timer(now).await.unwrap();
    }

    let kinds = kinds(&buffer);
    for pair in kinds.windows(2) {
        if pair[1] == EnforcementKind::Restored {
            assert_ne!(pair[0], EnforcementKind::Restored);
            assert_ne!(pair[0], EnforcementKind::Locked);
        }
    }
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == EnforcementKind::Restored)
            .count(),
        2
    );
}

#[tokio::test]
async fn test_release_closes_the_lock() {
    let buffer = memory_buffer();
    let overlay = Arc::new(RecordingOverlay::default());
    let mut guard = guard(&buffer, &overlay);

    assert_eq!(guard.release().await.unwrap(), None);
    guard.lock().await.unwrap();
    guard.on_focus(false, Instant::now()).await.unwrap();
    assert_eq!(
        guard.release().await.unwrap(),
        Some(EnforcementKind::Released)
    );

    assert_eq!(guard.state(), GuardState::Inactive);
    assert_eq!(guard.next_deadline(), None);
    assert_eq!(overlay.hides.load(Ordering::SeqCst), 1);
    assert_eq!(
        kinds(&buffer).last().copied(),
        Some(EnforcementKind::Released)
    );
}

#[tokio::test]
async fn test_sequence_numbers_increase() {
    let buffer = memory_buffer();
    let overlay = Arc::new(RecordingOverlay::default());
    let mut guard = guard(&buffer, &overlay);
    let start = Instant::now();

    guard.lock().await.unwrap();
    guard.on_focus(false, start).await.unwrap();
    guard.on_timer(start + Duration::from_secs(11)).await.unwrap();

    let sequences: Vec<u64> = entries(&buffer, Partition::Enforcement)
        .iter()
        .filter_map(|entry| entry.payload.sequence_number())
        .collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_reactor_detects_escape() {
    let buffer = memory_buffer();
    let overlay = Arc::new(RecordingOverlay::default());
    let handle = guard(&buffer, &overlay).into_handle();
    handle.lock().await.lock().await.unwrap();

    let focus = Arc::new(ToggleFocus::default());
    let reactor = spawn_reactor(
        Arc::clone(&handle),
        Arc::clone(&focus) as Arc<dyn FocusObserver>,
        Duration::from_millis(10),
    );

    focus.set_foreground(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        handle.lock().await.state(),
        GuardState::Escaped { .. }
    ));

    focus.set_foreground(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.lock().await.state(), GuardState::Locked);

    reactor.abort();
    assert_eq!(
        kinds(&buffer),
        vec![
            EnforcementKind::Locked,
            EnforcementKind::Escaped,
            EnforcementKind::Restored
        ]
    );
}
