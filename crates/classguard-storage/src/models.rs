use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Who owns the device inside a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Student,
    Teacher,
}

impl Role {
    /// Only student devices are classified and locked
    #[must_use]
    pub const fn is_monitored(self) -> bool {
        matches!(self, Self::Student)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Student => write!(f, "student"),
            Self::Teacher => write!(f, "teacher"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "student" => Ok(Self::Student),
            "teacher" => Ok(Self::Teacher),
            _ => Err(format!("Unknown role: {s}. Use: student, teacher")),
        }
    }
}

/// Lifecycle state of the device-local session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Joining,
    Active,
    Paused,
    Finalizing,
    Finalized,
}

impl SessionState {
    /// States counted by the one-live-session-per-device invariant
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Joining | Self::Active | Self::Paused)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Finalizing => "finalizing",
            Self::Finalized => "finalized",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "joining" => Ok(Self::Joining),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "finalizing" => Ok(Self::Finalizing),
            "finalized" => Ok(Self::Finalized),
            _ => Err(format!("Unknown session state: {s}")),
        }
    }
}

/// Classroom session as seen by this device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub owner_role: Role,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub device_id: String,
    pub ended_at: Option<DateTime<Utc>>,
    /// Set once the backend accepted the finalize request.
    /// A finalized session with `false` here still needs reconciliation.
    pub finalize_confirmed: bool,
}

impl Session {
    #[must_use]
    pub fn new(session_id: Uuid, owner_role: Role, device_id: String) -> Self {
        Self {
            session_id,
            owner_role,
            state: SessionState::Joining,
            started_at: Utc::now(),
            device_id,
            ended_at: None,
            finalize_confirmed: false,
        }
    }
}

/// Persisted view of the session controller, restored at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ControllerSnapshot {
    pub state: SessionState,
    pub session_id: Option<Uuid>,
    pub sync_degraded: bool,
}

/// Screen content category produced by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Education,
    Messaging,
    Social,
    Video,
    Game,
    Unknown,
}

impl Category {
    pub const ALL: [Self; 6] = [
        Self::Education,
        Self::Messaging,
        Self::Social,
        Self::Video,
        Self::Game,
        Self::Unknown,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Education => "EDUCATION",
            Self::Messaging => "MESSAGING",
            Self::Social => "SOCIAL",
            Self::Video => "VIDEO",
            Self::Game => "GAME",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "EDUCATION" => Ok(Self::Education),
            "MESSAGING" => Ok(Self::Messaging),
            "SOCIAL" => Ok(Self::Social),
            "VIDEO" => Ok(Self::Video),
            "GAME" => Ok(Self::Game),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(format!("Unknown category: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Block,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ALLOW" => Ok(Self::Allow),
            "BLOCK" => Ok(Self::Block),
            _ => Err(format!("Unknown decision: {s}. Use: allow, block")),
        }
    }
}

/// One classification tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionEvent {
    pub device_id: String,
    /// Assigned by the outbox when the event is appended
    pub sequence_number: u64,
    pub session_id: Uuid,
    pub category: Category,
    /// What the classifier said before low-confidence results were
    /// rewritten to `UNKNOWN`
    #[serde(default)]
    pub raw_category: Option<Category>,
    pub confidence: f32,
    pub decision: Decision,
    #[serde(default)]
    pub classification_error: bool,
    #[serde(default)]
    pub away_from_hub: bool,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementKind {
    Locked,
    Escaped,
    Restored,
    Escalated,
    /// Guard stopped while a lock was held
    Released,
}

impl std::fmt::Display for EnforcementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "LOCKED"),
            Self::Escaped => write!(f, "ESCAPED"),
            Self::Restored => write!(f, "RESTORED"),
            Self::Escalated => write!(f, "ESCALATED"),
            Self::Released => write!(f, "RELEASED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementEvent {
    pub device_id: String,
    pub session_id: Uuid,
    pub sequence_number: u64,
    pub kind: EnforcementKind,
    pub at: DateTime<Utc>,
}

/// Help request raised by the student. Outlives session boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyRequest {
    pub device_id: String,
    pub session_id: Option<Uuid>,
    pub request_id: Uuid,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Outbox partitions, ordered from highest to lowest priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Emergency,
    Enforcement,
    Attention,
}

impl Partition {
    /// Drain order used by the sync engine
    pub const BY_PRIORITY: [Self; 3] = [Self::Emergency, Self::Enforcement, Self::Attention];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::Enforcement => "enforcement",
            Self::Attention => "attention",
        }
    }

    /// Ordered partitions are delivered strictly FIFO.
    /// Emergency requests bypass ordering and batching.
    #[must_use]
    pub const fn is_ordered(self) -> bool {
        !matches!(self, Self::Emergency)
    }

    /// Only the attention partition may lose entries on overflow
    #[must_use]
    pub const fn is_droppable(self) -> bool {
        matches!(self, Self::Attention)
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Partition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "emergency" => Ok(Self::Emergency),
            "enforcement" => Ok(Self::Enforcement),
            "attention" => Ok(Self::Attention),
            _ => Err(format!("Unknown partition: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Pending,
    InFlight,
    Acked,
    Failed,
}

impl OutboxState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Acked => "acked",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OutboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "acked" => Ok(Self::Acked),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown outbox state: {s}")),
        }
    }
}

/// Anything the device reports to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboxPayload {
    Attention(AttentionEvent),
    Enforcement(EnforcementEvent),
    Emergency(EmergencyRequest),
}

impl OutboxPayload {
    #[must_use]
    pub const fn partition(&self) -> Partition {
        match self {
            Self::Attention(_) => Partition::Attention,
            Self::Enforcement(_) => Partition::Enforcement,
            Self::Emergency(_) => Partition::Emergency,
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        match self {
            Self::Attention(e) => &e.device_id,
            Self::Enforcement(e) => &e.device_id,
            Self::Emergency(e) => &e.device_id,
        }
    }

    #[must_use]
    pub const fn session_id(&self) -> Option<Uuid> {
        match self {
            Self::Attention(e) => Some(e.session_id),
            Self::Enforcement(e) => Some(e.session_id),
            Self::Emergency(e) => e.session_id,
        }
    }

    #[must_use]
    pub const fn sequence_number(&self) -> Option<u64> {
        match self {
            Self::Attention(e) => Some(e.sequence_number),
            Self::Enforcement(e) => Some(e.sequence_number),
            Self::Emergency(_) => None,
        }
    }

    #[must_use]
    pub const fn request_id(&self) -> Option<Uuid> {
        match self {
            Self::Emergency(e) => Some(e.request_id),
            _ => None,
        }
    }

    /// Key the backend deduplicates on, unique per device
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        match self {
            Self::Attention(e) => format!("seq:{}", e.sequence_number),
            Self::Enforcement(e) => format!("seq:{}", e.sequence_number),
            Self::Emergency(e) => format!("req:{}", e.request_id),
        }
    }

    #[must_use]
    pub const fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::Attention(e) => e.captured_at,
            Self::Enforcement(e) => e.at,
            Self::Emergency(e) => e.raised_at,
        }
    }

    pub(crate) fn assign_sequence(&mut self, sequence_number: u64) {
        match self {
            Self::Attention(e) => e.sequence_number = sequence_number,
            Self::Enforcement(e) => e.sequence_number = sequence_number,
            Self::Emergency(_) => {}
        }
    }
}

/// Durable envelope around a payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub partition: Partition,
    pub payload: OutboxPayload,
    pub state: OutboxState,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When a `Failed` entry becomes `Pending` again.
    /// `None` on a `Failed` entry means the failure is permanent.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub acked_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    #[must_use]
    pub fn is_permanently_failed(&self) -> bool {
        self.state == OutboxState::Failed && self.next_attempt_at.is_none()
    }

    #[must_use]
    pub fn idempotency_key(&self) -> String {
        self.payload.idempotency_key()
    }
}

/// Per-partition bounds applied atomically with every append
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityPolicy {
    pub attention: u32,
    pub enforcement: u32,
    pub emergency: u32,
}

impl CapacityPolicy {
    #[must_use]
    pub const fn limit(&self, partition: Partition) -> u32 {
        match partition {
            Partition::Attention => self.attention,
            Partition::Enforcement => self.enforcement,
            Partition::Emergency => self.emergency,
        }
    }
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            attention: 5000,
            enforcement: 2000,
            emergency: 500,
        }
    }
}

/// Retry budget for failed sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Exponential delay before the next attempt, capped at `max_delay`
    #[must_use]
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Result of appending to the outbox
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub entry: OutboxEntry,
    /// Attention entries evicted to make room
    pub dropped: Vec<SequenceGap>,
    /// The target partition is over its bound and nothing could be evicted
    pub over_capacity: bool,
}

/// Tagged hole in the device sequence left by an overflow drop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceGap {
    pub device_id: String,
    pub partition: Partition,
    pub sequence_number: Option<u64>,
    pub idempotency_key: String,
    pub dropped_at: DateTime<Utc>,
}

/// What happened to one entry passed to `mark_outbox_failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub id: i64,
    pub attempts: u32,
    pub permanent: bool,
}

/// Entry counts for one partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub pending: u64,
    pub in_flight: u64,
    pub acked: u64,
    /// Failed and waiting for a retry
    pub retrying: u64,
    pub permanently_failed: u64,
}

impl PartitionStats {
    /// Entries that still count against the partition bound
    #[must_use]
    pub const fn live(&self) -> u64 {
        self.pending + self.in_flight + self.retrying
    }
}

/// Command delivered through the backend push channel and recorded for dedup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedCommand {
    pub command_id: String,
    pub session_id: Uuid,
    pub command: String,
    pub received_at: DateTime<Utc>,
}
