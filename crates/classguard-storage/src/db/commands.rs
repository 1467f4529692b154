use anyhow::Result;
use rusqlite::params;

use super::helpers::format_datetime;
use super::Database;
use crate::models::ReceivedCommand;

impl Database {
    /// Record a push command.
    /// Returns `false` when the command id was already recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails
    pub fn record_command(&self, command: &ReceivedCommand) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO seen_commands (command_id, session_id, command, received_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                command.command_id,
                command.session_id.to_string(),
                command.command,
                format_datetime(command.received_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Ids of the most recently received commands, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    pub fn recent_command_ids(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT command_id FROM seen_commands ORDER BY received_at DESC, rowid DESC LIMIT ?1",
        )?;
        let ids = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                row.get(0)
            })?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Keep only the newest `keep` command records
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails
    pub fn prune_commands(&self, keep: usize) -> Result<usize> {
        let deleted = self.conn().execute(
            "DELETE FROM seen_commands WHERE command_id NOT IN (
                SELECT command_id FROM seen_commands
                ORDER BY received_at DESC, rowid DESC LIMIT ?1
             )",
            params![i64::try_from(keep).unwrap_or(i64::MAX)],
        )?;
        Ok(deleted)
    }
}
