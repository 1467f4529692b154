pub mod config;
pub mod daemon;
pub mod helpers;
pub mod init;
pub mod outbox;
pub mod sessions;
pub mod status;
