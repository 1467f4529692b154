use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::helpers::{
    format_datetime, parse_datetime, parse_enum, parse_optional_datetime, parse_uuid,
};
use super::Database;
use crate::models::{ControllerSnapshot, Session, SessionState};

pub(super) const SESSION_COLUMNS: &str =
    "session_id, owner_role, state, started_at, device_id, ended_at, finalize_confirmed";

impl Database {
    /// Record a newly joined session
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails, including when the device already
    /// has a live session
    pub fn insert_session(&self, session: &Session) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO sessions (session_id, owner_role, state, started_at, device_id,
                                       ended_at, finalize_confirmed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session.session_id.to_string(),
                    session.owner_role.to_string(),
                    session.state.as_str(),
                    format_datetime(session.started_at),
                    session.device_id,
                    session.ended_at.map(format_datetime),
                    session.finalize_confirmed,
                ],
            )
            .context("Failed to insert session")?;
        Ok(())
    }

    /// Update the lifecycle state of a session.
    /// Leaving the live states stamps `ended_at` once.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails
    pub fn update_session_state(&self, session_id: Uuid, state: SessionState) -> Result<()> {
        let ended_at = (!state.is_live()).then(|| format_datetime(Utc::now()));
        self.conn().execute(
            "UPDATE sessions SET state = ?1, ended_at = COALESCE(ended_at, ?2)
             WHERE session_id = ?3",
            params![state.as_str(), ended_at, session_id.to_string()],
        )?;
        Ok(())
    }

    /// Record that the backend confirmed finalization
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails
    pub fn set_finalize_confirmed(&self, session_id: Uuid, confirmed: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE sessions SET finalize_confirmed = ?1 WHERE session_id = ?2",
            params![confirmed, session_id.to_string()],
        )?;
        Ok(())
    }

    /// Get a session by id
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    pub fn get_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        let session = self
            .conn()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                params![session_id.to_string()],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Recent sessions, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY started_at DESC LIMIT ?1"
        ))?;
        let sessions = stmt
            .query_map(
                params![i64::try_from(limit).unwrap_or(i64::MAX)],
                row_to_session,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Finalized sessions whose finalize was never confirmed by the backend
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    pub fn unconfirmed_finalized_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE state = 'finalized' AND finalize_confirmed = 0
             ORDER BY started_at ASC"
        ))?;
        let sessions = stmt
            .query_map([], row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Persist the controller snapshot
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails
    pub fn save_controller_state(&self, snapshot: &ControllerSnapshot) -> Result<()> {
        self.conn().execute(
            "INSERT INTO controller_state (id, state, session_id, sync_degraded, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                session_id = excluded.session_id,
                sync_degraded = excluded.sync_degraded,
                updated_at = excluded.updated_at",
            params![
                snapshot.state.as_str(),
                snapshot.session_id.map(|id| id.to_string()),
                snapshot.sync_degraded,
                format_datetime(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Load the controller snapshot, if one was ever saved
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded
    pub fn load_controller_state(&self) -> Result<Option<(ControllerSnapshot, DateTime<Utc>)>> {
        let row = self
            .conn()
            .query_row(
                "SELECT state, session_id, sync_degraded, updated_at
                 FROM controller_state WHERE id = 1",
                [],
                |row| {
                    let session_id: Option<String> = row.get(1)?;
                    Ok((
                        ControllerSnapshot {
                            state: parse_enum(&row.get::<_, String>(0)?)?,
                            session_id: session_id.as_deref().map(parse_uuid).transpose()?,
                            sync_degraded: row.get(2)?,
                        },
                        parse_datetime(&row.get::<_, String>(3)?)?,
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }
}

pub(super) fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: parse_uuid(&row.get::<_, String>(0)?)?,
        owner_role: parse_enum(&row.get::<_, String>(1)?)?,
        state: parse_enum(&row.get::<_, String>(2)?)?,
        started_at: parse_datetime(&row.get::<_, String>(3)?)?,
        device_id: row.get(4)?,
        ended_at: parse_optional_datetime(row.get(5)?)?,
        finalize_confirmed: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[test]
    fn test_session_lifecycle_roundtrip() {
        let db = Database::new_in_memory().unwrap();
        let session = Session::new(Uuid::new_v4(), Role::Student, "dev-1".to_string());
        db.insert_session(&session).unwrap();

        db.update_session_state(session.session_id, SessionState::Active)
            .unwrap();
        let loaded = db.get_session(session.session_id).unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Active);
        assert!(loaded.ended_at.is_none());

        db.update_session_state(session.session_id, SessionState::Finalized)
            .unwrap();
        let loaded = db.get_session(session.session_id).unwrap().unwrap();
        assert!(loaded.ended_at.is_some());
        assert_eq!(db.unconfirmed_finalized_sessions().unwrap().len(), 1);

        db.set_finalize_confirmed(session.session_id, true).unwrap();
        assert!(db.unconfirmed_finalized_sessions().unwrap().is_empty());
    }

    #[test]
    fn test_second_live_session_rejected() {
        let db = Database::new_in_memory().unwrap();
        let first = Session::new(Uuid::new_v4(), Role::Student, "dev-1".to_string());
        db.insert_session(&first).unwrap();

        let second = Session::new(Uuid::new_v4(), Role::Student, "dev-1".to_string());
        assert!(db.insert_session(&second).is_err());

        db.update_session_state(first.session_id, SessionState::Idle)
            .unwrap();
        db.insert_session(&second).unwrap();
        assert_eq!(db.list_sessions(10).unwrap().len(), 2);
    }

    #[test]
    fn test_controller_snapshot_upsert() {
        let db = Database::new_in_memory().unwrap();
        assert!(db.load_controller_state().unwrap().is_none());

        let snapshot = ControllerSnapshot {
            state: SessionState::Paused,
            session_id: Some(Uuid::new_v4()),
            sync_degraded: true,
        };
        db.save_controller_state(&snapshot).unwrap();
        db.save_controller_state(&snapshot).unwrap();

        let (loaded, _) = db.load_controller_state().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }
}
