//! Session history on this device

use anyhow::{Context, Result};
use chrono::Local;
use classguard_storage::{Database, Session};
use std::path::Path;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "Session")]
    session_id: String,
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Ended")]
    ended: String,
    #[tabled(rename = "Finalize")]
    finalize: String,
}

impl From<&Session> for SessionRow {
    fn from(session: &Session) -> Self {
        let finalize = if session.state.is_live() {
            "-"
        } else if session.finalize_confirmed {
            "confirmed"
        } else {
            "unconfirmed"
        };
        Self {
            session_id: session.session_id.to_string(),
            role: session.owner_role.to_string(),
            state: session.state.to_string(),
            started: session
                .started_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
                .to_string(),
            ended: session.ended_at.map_or_else(
                || "-".to_string(),
                |t| t.with_timezone(&Local).format("%H:%M").to_string(),
            ),
            finalize: finalize.to_string(),
        }
    }
}

/// List recent sessions, or only finalized sessions awaiting reconciliation
pub fn list_sessions(data_dir: &Path, unconfirmed: bool, limit: usize) -> Result<()> {
    let db_path = data_dir.join("classguard.db");
    let db = Database::new(Some(db_path)).context("Failed to open database")?;

    let sessions = if unconfirmed {
        db.unconfirmed_finalized_sessions()?
    } else {
        db.list_sessions(limit)?
    };

    if sessions.is_empty() {
        if unconfirmed {
            println!("Every finalized session was confirmed by the backend.");
        } else {
            println!("No sessions recorded yet.");
        }
        return Ok(());
    }

    let rows: Vec<SessionRow> = sessions.iter().map(SessionRow::from).collect();
    println!("{}", Table::new(rows));
    Ok(())
}
