use super::*;
use crate::config::BufferConfig;
use crate::testing::{entries, states, BatchReply, ScriptedBackend, ScriptedCommands};
use classguard_integrations::{CommandKind, CommandSource, RejectReason};
use classguard_storage::{
    AttentionEvent, Category, Database, Decision, EmergencyRequest, EnforcementEvent,
    EnforcementKind, OutboxState,
};

struct Harness {
    engine: SyncEngine,
    buffer: Arc<EventBuffer>,
    backend: Arc<ScriptedBackend>,
    messages: mpsc::Receiver<ControllerMessage>,
    online: watch::Sender<bool>,
}

fn harness(replies: Vec<BatchReply>) -> Harness {
    harness_with(replies, BufferConfig {
        retry_base_ms: 0,
        ..BufferConfig::default()
    })
}

fn harness_with(replies: Vec<BatchReply>, buffer_config: BufferConfig) -> Harness {
    let buffer = Arc::new(EventBuffer::new(
        Arc::new(Database::new_in_memory().unwrap()),
        &buffer_config,
    ));
    let backend = Arc::new(ScriptedBackend::with_replies(replies));
    let (tx, messages) = mpsc::channel(64);
    let (online, connectivity) = watch::channel(true);
    let config = SyncConfig {
        batch_size: 10,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        finalize_attempts: 3,
        ..SyncConfig::default()
    };
    let engine = SyncEngine::new(
        "dev-1".to_string(),
        Arc::clone(&buffer),
        Arc::clone(&backend) as Arc<dyn IngestionBackend>,
        config,
        tx,
        connectivity,
    );
    Harness {
        engine,
        buffer,
        backend,
        messages,
        online,
    }
}

fn attention(session_id: Uuid) -> OutboxPayload {
    OutboxPayload::Attention(AttentionEvent {
        device_id: "dev-1".to_string(),
        sequence_number: 0,
        session_id,
        category: Category::Game,
        raw_category: None,
        confidence: 0.9,
        decision: Decision::Block,
        classification_error: false,
        away_from_hub: false,
        captured_at: Utc::now(),
    })
}

fn enforcement(session_id: Uuid) -> OutboxPayload {
    OutboxPayload::Enforcement(EnforcementEvent {
        device_id: "dev-1".to_string(),
        session_id,
        sequence_number: 0,
        kind: EnforcementKind::Locked,
        at: Utc::now(),
    })
}

fn emergency(session_id: Option<Uuid>) -> OutboxPayload {
    OutboxPayload::Emergency(EmergencyRequest {
        device_id: "dev-1".to_string(),
        session_id,
        request_id: Uuid::new_v4(),
        reason: "help".to_string(),
        raised_at: Utc::now(),
        acknowledged_at: None,
    })
}

fn drain_messages(rx: &mut mpsc::Receiver<ControllerMessage>) -> Vec<ControllerMessage> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

#[tokio::test]
async fn test_three_failures_then_success_acks_once() {
    let h = harness(vec![
        BatchReply::Fail(BackendError::Transient("503".into())),
        BatchReply::Fail(BackendError::Transient("503".into())),
        BatchReply::Fail(BackendError::Transient("timeout".into())),
    ]);
    let entry = h.buffer.enqueue(attention(Uuid::new_v4())).unwrap();

    for _ in 0..3 {
        assert!(matches!(
            h.engine.run_cycle().await,
            Err(CoreError::TransientNetwork(_))
        ));
    }
    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.acked, 1);

    let stored = h.buffer.database().get_outbox_entry(entry.id).unwrap().unwrap();
    assert_eq!(stored.state, OutboxState::Acked);
    assert_eq!(stored.attempts, 4);
    assert_eq!(states(&h.buffer, Partition::Attention), vec![OutboxState::Acked]);
    assert_eq!(h.backend.sent_keys(), vec!["seq:1"; 4]);

    // Nothing left to resend
    assert_eq!(h.engine.run_cycle().await.unwrap(), SyncReport::default());
    assert!(h.engine.status().borrow().last_success_at.is_some());
}

#[tokio::test]
async fn test_duplicate_reply_counts_as_delivered() {
    let h = harness(vec![BatchReply::RejectAll(RejectReason::Duplicate)]);
    h.buffer.enqueue(attention(Uuid::new_v4())).unwrap();
    h.buffer.enqueue(attention(Uuid::new_v4())).unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.acked, 2);
    assert_eq!(report.duplicates, 2);
    assert_eq!(
        states(&h.buffer, Partition::Attention),
        vec![OutboxState::Acked, OutboxState::Acked]
    );
}

#[tokio::test]
async fn test_emergency_is_sent_first() {
    let h = harness(Vec::new());
    let session = Uuid::new_v4();
    h.buffer.enqueue(attention(session)).unwrap();
    h.buffer.enqueue(enforcement(session)).unwrap();
    h.buffer.enqueue(emergency(Some(session))).unwrap();

    h.engine.run_cycle().await.unwrap();

    let batches = h.backend.batches.lock().unwrap();
    let kinds: Vec<&str> = batches.iter().map(|b| b[0].kind.as_str()).collect();
    assert_eq!(kinds, vec!["emergency", "enforcement", "attention"]);
}

#[tokio::test]
async fn test_emergency_ack_is_reported() {
    let mut h = harness(Vec::new());
    let payload = emergency(None);
    let request_id = payload.request_id().unwrap();
    h.buffer.enqueue(payload).unwrap();

    h.engine.run_cycle().await.unwrap();

    let messages = drain_messages(&mut h.messages);
    assert!(matches!(
        messages.as_slice(),
        [ControllerMessage::EmergencyAcknowledged { request_id: id, .. }] if *id == request_id
    ));
    let stored = entries(&h.buffer, Partition::Emergency);
    let OutboxPayload::Emergency(request) = &stored[0].payload else {
        panic!("expected emergency payload");
    };
    assert!(request.acknowledged_at.is_some());
}

#[tokio::test]
async fn test_partial_failure_resends_only_failed_items() {
    let h = harness(vec![BatchReply::AcceptFirst(1)]);
    let session = Uuid::new_v4();
    for _ in 0..3 {
        h.buffer.enqueue(attention(session)).unwrap();
    }

    let first = h.engine.run_cycle().await.unwrap();
    assert_eq!(first.acked, 1);
    assert_eq!(first.failed, 2);

    let second = h.engine.run_cycle().await.unwrap();
    assert_eq!(second.acked, 2);
    assert_eq!(
        h.backend.sent_keys(),
        vec!["seq:1", "seq:2", "seq:3", "seq:2", "seq:3"]
    );
}

#[tokio::test]
async fn test_invalid_session_is_not_retried() {
    let mut h = harness(vec![BatchReply::RejectAll(RejectReason::InvalidSession)]);
    let payload = emergency(Some(Uuid::new_v4()));
    let request_id = payload.request_id().unwrap();
    h.buffer.enqueue(payload).unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.permanent, 1);
    assert_eq!(h.buffer.permanent_failures(10).unwrap().len(), 1);

    let messages = drain_messages(&mut h.messages);
    assert!(messages.contains(&ControllerMessage::EmergencyUndeliverable {
        request_id,
        reason: "invalid-session".to_string(),
    }));
    assert!(messages
        .iter()
        .any(|m| matches!(m, ControllerMessage::SyncDegraded(_))));

    // Not sent again
    h.engine.run_cycle().await.unwrap();
    assert_eq!(h.backend.sent_keys().len(), 1);
}

#[tokio::test]
async fn test_retry_budget_exhaustion_is_permanent() {
    let mut h = harness_with(
        vec![
            BatchReply::Fail(BackendError::Protocol("400".into())),
            BatchReply::Fail(BackendError::Protocol("400".into())),
        ],
        BufferConfig {
            retry_base_ms: 0,
            max_attempts: 2,
            ..BufferConfig::default()
        },
    );
    h.buffer.enqueue(attention(Uuid::new_v4())).unwrap();

    assert!(h.engine.run_cycle().await.is_err());
    assert!(h.engine.run_cycle().await.is_err());

    let failures = h.buffer.permanent_failures(10).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].attempts, 2);
    assert!(drain_messages(&mut h.messages)
        .iter()
        .any(|m| matches!(m, ControllerMessage::SyncDegraded(_))));

    // Never retried again
    h.engine.run_cycle().await.unwrap();
    assert_eq!(h.backend.sent_keys().len(), 2);
}

#[tokio::test]
async fn test_auth_expired_suspends_without_using_attempts() {
    let mut h = harness(vec![BatchReply::Fail(BackendError::AuthExpired { status: 401 })]);
    let entry = h.buffer.enqueue(attention(Uuid::new_v4())).unwrap();

    assert!(matches!(
        h.engine.run_cycle().await,
        Err(CoreError::AuthExpired)
    ));
    let stored = h.buffer.database().get_outbox_entry(entry.id).unwrap().unwrap();
    assert_eq!(stored.state, OutboxState::Pending);
    assert_eq!(stored.attempts, 0);
    assert!(h.engine.status().borrow().auth_suspended);
    assert_eq!(
        drain_messages(&mut h.messages),
        vec![ControllerMessage::AuthExpired]
    );

    // Buffer keeps accumulating; the next accepted send clears the suspension
    h.buffer.enqueue(attention(Uuid::new_v4())).unwrap();
    assert_eq!(h.engine.run_cycle().await.unwrap().acked, 2);
    assert!(!h.engine.status().borrow().auth_suspended);
    assert_eq!(
        drain_messages(&mut h.messages),
        vec![ControllerMessage::AuthRestored]
    );

    // Later successes stay quiet
    h.buffer.enqueue(attention(Uuid::new_v4())).unwrap();
    h.engine.run_cycle().await.unwrap();
    assert!(drain_messages(&mut h.messages).is_empty());
}

#[tokio::test]
async fn test_offline_suspends_sends() {
    let h = harness(Vec::new());
    h.online.send(false).unwrap();
    h.buffer.enqueue(attention(Uuid::new_v4())).unwrap();

    assert_eq!(h.engine.run_cycle().await.unwrap(), SyncReport::default());
    assert!(h.backend.sent_keys().is_empty());
    assert!(!h.engine.status().borrow().online);

    h.online.send(true).unwrap();
    assert_eq!(h.engine.run_cycle().await.unwrap().acked, 1);
}

#[tokio::test]
async fn test_finalize_drains_emergencies_first() {
    let h = harness(Vec::new());
    let session = Uuid::new_v4();
    h.buffer.enqueue(emergency(Some(session))).unwrap();

    assert!(h.engine.finalize(session).await);
    assert_eq!(h.backend.finalize_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(h.buffer.unsettled(Partition::Emergency, Some(session)).unwrap(), 0);
    assert_eq!(h.backend.sent_keys().len(), 1);
}

#[tokio::test]
async fn test_finalize_gives_up_after_budget() {
    let h = harness(Vec::new());
    h.backend.script_finalize(vec![
        Err(BackendError::Transient("503".into())),
        Err(BackendError::Transient("503".into())),
        Err(BackendError::Transient("503".into())),
    ]);

    assert!(!h.engine.finalize(Uuid::new_v4()).await);
    assert_eq!(h.backend.finalize_calls.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_run_loop_serves_finalize_and_stops() {
    let mut h = harness(Vec::new());
    let session = Uuid::new_v4();
    h.buffer.enqueue(attention(session)).unwrap();

    let (requests_tx, requests_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = watch::channel(false);
    let buffer = Arc::clone(&h.buffer);
    let task = tokio::spawn(h.engine.run(requests_rx, stop_rx));

    requests_tx
        .send(SyncRequest::Finalize { session_id: session })
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), h.messages.recv())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Some(ControllerMessage::FinalizeOutcome {
            session_id: session,
            confirmed: true
        })
    );

    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while states(&buffer, Partition::Attention) != vec![OutboxState::Acked] {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok());

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
}

#[test]
fn test_backoff_is_bounded() {
    let base = Duration::from_millis(100);
    let max = Duration::from_secs(2);
    for failures in 1..10 {
        let delay = backoff_delay(base, max, failures);
        let ceiling = base.saturating_mul(1 << (failures - 1)).min(max);
        assert!(delay <= ceiling);
        assert!(delay >= ceiling / 2);
    }
    assert_eq!(backoff_delay(Duration::ZERO, max, 3), Duration::ZERO);
}

fn command(id: &str, session_id: Uuid, kind: CommandKind) -> PushCommand {
    PushCommand {
        command_id: id.to_string(),
        session_id,
        command: kind,
        issued_at: Utc::now(),
        policy: None,
    }
}

#[tokio::test]
async fn test_push_listener_forwards_in_order_without_repeats() {
    let db = Arc::new(Database::new_in_memory().unwrap());
    let session = Uuid::new_v4();
    let source = Arc::new(ScriptedCommands::new(vec![
        vec![
            command("c1", session, CommandKind::Start),
            command("c2", session, CommandKind::Pause),
        ],
        vec![
            command("c2", session, CommandKind::Pause),
            command("c3", session, CommandKind::Resume),
        ],
    ]));
    let (tx, mut rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = watch::channel(false);
    let (online, connectivity) = watch::channel(false);

    let listener = spawn_push_listener(
        Arc::clone(&source) as Arc<dyn CommandSource>,
        CommandDeduper::new(Arc::clone(&db), 16).unwrap(),
        tx,
        online,
        &SyncConfig::default(),
        stop_rx,
    );

    let mut ids = Vec::new();
    for _ in 0..3 {
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        if let Some(ControllerMessage::Command(cmd)) = message {
            ids.push(cmd.command_id);
        }
    }
    assert_eq!(ids, vec!["c1", "c2", "c3"]);
    // An answered poll marks the device online
    assert!(*connectivity.borrow());

    tokio::time::sleep(Duration::from_millis(50)).await;
    stop_tx.send(true).unwrap();
    listener.await.unwrap();

    // Every delivery is acknowledged, repeats included
    assert_eq!(
        *source.acknowledged.lock().unwrap(),
        vec!["c1", "c2", "c2", "c3"]
    );

    // The ledger survives a fresh deduper
    let deduper = CommandDeduper::new(db, 16).unwrap();
    assert!(!deduper.is_new("c2"));
    assert!(deduper.is_new("c4"));
}

#[tokio::test]
async fn test_push_listener_reports_auth_recovery() {
    let db = Arc::new(Database::new_in_memory().unwrap());
    let session = Uuid::new_v4();
    let source = Arc::new(ScriptedCommands::with_results(vec![
        Err(BackendError::AuthExpired { status: 401 }),
        Ok(vec![command("c1", session, CommandKind::Start)]),
    ]));
    let (tx, mut rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = watch::channel(false);
    let (online, _connectivity) = watch::channel(true);
    let config = SyncConfig {
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..SyncConfig::default()
    };

    let listener = spawn_push_listener(
        source as Arc<dyn CommandSource>,
        CommandDeduper::new(db, 16).unwrap(),
        tx,
        online,
        &config,
        stop_rx,
    );

    let mut received = Vec::new();
    for _ in 0..3 {
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        received.push(message);
    }
    assert_eq!(received[0], ControllerMessage::AuthExpired);
    assert_eq!(received[1], ControllerMessage::AuthRestored);
    assert!(matches!(&received[2], ControllerMessage::Command(cmd) if cmd.command_id == "c1"));

    stop_tx.send(true).unwrap();
    listener.await.unwrap();
}
