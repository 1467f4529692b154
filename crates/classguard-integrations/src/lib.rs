pub mod backend;
pub mod error;
pub mod http;
pub mod hub;
pub mod push;

pub use backend::{
    BackendClient, IngestItem, IngestionBackend, ItemOutcome, ItemResult, ItemStatus,
    RejectReason,
};
pub use error::BackendError;
pub use hub::{HubClient, Proximity, ProximitySource};
pub use push::{
    verify_command_signature, CommandKind, CommandSource, PushClient, PushCommand,
    SessionPolicyOverride,
};
