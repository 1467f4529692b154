pub mod classification_loop;
pub mod config;
pub mod daemon_control;
pub mod device;
pub mod emergency;
pub mod enforcement;
pub mod error;
pub mod event_buffer;
pub mod ipc;
pub mod policy;
pub mod runtime;
pub mod session_controller;
pub mod sync_engine;

#[cfg(test)]
mod testing;

pub use emergency::{EmergencyChannel, EmergencyHandle, EmergencyStatus, RaiseError};
pub use error::{CoreError, CoreResult};
pub use event_buffer::EventBuffer;
pub use runtime::{AppContext, Daemon, SystemStatus};
pub use session_controller::{SessionController, SessionStatus};
pub use sync_engine::{SyncEngine, SyncReport, SyncStatus};
