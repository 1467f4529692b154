pub mod db;
pub mod migrations;
pub mod models;

pub use db::{Database, RecoveryReport, UndecodableRow};
pub use models::{
    AppendOutcome, AttentionEvent, CapacityPolicy, Category, ControllerSnapshot, Decision,
    EmergencyRequest, EnforcementEvent, EnforcementKind, FailureOutcome, OutboxEntry,
    OutboxPayload, OutboxState, Partition, PartitionStats, ReceivedCommand, RetryPolicy, Role,
    SequenceGap, Session, SessionState,
};
