//! Process wiring: the shared context built at startup and the daemon loop
//! that owns the session controller.

mod context;
mod daemon;

pub use context::{AppContext, Clients, SystemStatus};
pub use daemon::{spawn_permission_watch, Daemon};
