//! Startup integrity check and salvage of a damaged database file.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::helpers::{format_datetime, parse_enum, parse_uuid};
use super::outbox::{row_to_outbox_entry, ENTRY_COLUMNS};
use super::sessions::{row_to_session, SESSION_COLUMNS};
use super::Database;
use crate::models::{ControllerSnapshot, OutboxEntry, OutboxState, Partition};

/// What survived a recovery
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    /// Where the damaged file was moved
    pub quarantined_file: PathBuf,
    pub salvaged: BTreeMap<Partition, usize>,
    pub lost: BTreeMap<Partition, usize>,
    /// Partitions whose rows could not be read at all
    pub unreadable: Vec<Partition>,
    pub sessions_salvaged: usize,
}

impl RecoveryReport {
    fn empty(quarantined_file: PathBuf) -> Self {
        Self {
            quarantined_file,
            salvaged: BTreeMap::new(),
            lost: BTreeMap::new(),
            unreadable: Vec::new(),
            sessions_salvaged: 0,
        }
    }

    /// Partitions that lost at least one entry
    #[must_use]
    pub fn damaged_partitions(&self) -> Vec<Partition> {
        Partition::BY_PRIORITY
            .iter()
            .copied()
            .filter(|p| {
                self.unreadable.contains(p) || self.lost.get(p).copied().unwrap_or(0) > 0
            })
            .collect()
    }
}

impl Database {
    /// Open the database, recovering from a damaged file.
    ///
    /// A file that cannot be opened or fails `quick_check` is renamed aside and
    /// a fresh database is created in its place. Readable rows are copied over
    /// in priority order: emergencies first, then enforcement, then attention,
    /// then session history.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be moved aside or the fresh
    /// database cannot be created
    pub fn open_or_recover(db_path: Option<PathBuf>) -> Result<(Self, Option<RecoveryReport>)> {
        let path = db_path.unwrap_or_else(Self::default_db_path);

        match Self::new(Some(path.clone())) {
            Ok(db) => match db.integrity_ok() {
                Ok(true) => return Ok((db, None)),
                Ok(false) => log::error!("Integrity check failed for {}", path.display()),
                Err(e) => log::error!("Integrity check could not run on {}: {e:#}", path.display()),
            },
            Err(e) if path.exists() => log::error!("Failed to open {}: {e:#}", path.display()),
            Err(e) => return Err(e),
        }

        let aside = set_aside(&path)?;
        log::warn!("Moved damaged database to {}", aside.display());

        let fresh = Self::new(Some(path))?;
        let report = match Connection::open_with_flags(&aside, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(old) => fresh.salvage_from(&old, aside),
            Err(e) => {
                log::error!("Damaged database is unreadable: {e}");
                let mut report = RecoveryReport::empty(aside);
                report.unreadable = Partition::BY_PRIORITY.to_vec();
                report
            }
        };

        for partition in report.damaged_partitions() {
            log::error!("Outbox partition {partition} lost entries during recovery");
        }
        Ok((fresh, Some(report)))
    }

    /// Check every partition and move undecodable rows into quarantine.
    /// Returns the number of rows quarantined per affected partition.
    ///
    /// # Errors
    ///
    /// Returns an error if a partition cannot be read
    pub fn verify_outbox(&self) -> Result<Vec<(Partition, usize)>> {
        let mut affected = Vec::new();
        for partition in Partition::BY_PRIORITY {
            let bad = self.scan_outbox_partition(partition)?;
            if bad.is_empty() {
                continue;
            }
            log::error!(
                "Quarantining {} undecodable {partition} entries",
                bad.len()
            );
            affected.push((partition, self.quarantine_outbox_rows(partition, &bad)?));
        }
        Ok(affected)
    }

    /// Copy readable rows of `old` into this database
    pub(crate) fn salvage_from(&self, old: &Connection, quarantined_file: PathBuf) -> RecoveryReport {
        let mut report = RecoveryReport::empty(quarantined_file);

        if let Err(e) = self.salvage_sequences(old) {
            log::warn!("Could not salvage device sequences: {e:#}");
        }

        for partition in Partition::BY_PRIORITY {
            match self.salvage_partition(old, partition) {
                Ok((salvaged, lost)) => {
                    report.salvaged.insert(partition, salvaged);
                    report.lost.insert(partition, lost);
                }
                Err(e) => {
                    log::error!("Could not read {partition} entries: {e:#}");
                    report.unreadable.push(partition);
                }
            }
        }

        match self.salvage_sessions(old) {
            Ok(count) => report.sessions_salvaged = count,
            Err(e) => log::warn!("Could not salvage session history: {e:#}"),
        }
        if let Err(e) = self.salvage_controller_state(old) {
            log::warn!("Could not salvage controller state: {e:#}");
        }

        report
    }

    fn salvage_sequences(&self, old: &Connection) -> Result<()> {
        let mut stmt = old.prepare("SELECT device_id, last_sequence FROM device_sequences")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let conn = self.conn();
        for (device_id, last_sequence) in rows {
            conn.execute(
                "INSERT INTO device_sequences (device_id, last_sequence) VALUES (?1, ?2)
                 ON CONFLICT(device_id) DO UPDATE
                 SET last_sequence = MAX(last_sequence, excluded.last_sequence)",
                params![device_id, last_sequence],
            )?;
        }
        Ok(())
    }

    fn salvage_partition(&self, old: &Connection, partition: Partition) -> Result<(usize, usize)> {
        let mut stmt = old.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox
             WHERE partition = ?1
             ORDER BY id ASC"
        ))?;
        let mut rows = stmt.query(params![partition.as_str()])?;

        let mut salvaged = 0;
        let mut lost = 0;
        loop {
            match rows.next() {
                Ok(Some(row)) => match row_to_outbox_entry(row) {
                    Ok(entry) => {
                        self.insert_salvaged_entry(&entry)?;
                        salvaged += 1;
                    }
                    Err(_) => lost += 1,
                },
                Ok(None) => break,
                Err(e) => {
                    // A damaged page ends the scan; keep what was read so far
                    log::warn!("Stopped reading {partition} entries: {e}");
                    lost += 1;
                    break;
                }
            }
        }
        Ok((salvaged, lost))
    }

    fn insert_salvaged_entry(&self, entry: &OutboxEntry) -> Result<()> {
        let state = match entry.state {
            OutboxState::InFlight => OutboxState::Pending,
            other => other,
        };
        self.conn().execute(
            "INSERT OR IGNORE INTO outbox (partition, device_id, session_id, idempotency_key,
                                           payload, state, attempts, last_attempt_at,
                                           next_attempt_at, last_error, acked_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.partition.as_str(),
                entry.payload.device_id(),
                entry.payload.session_id().map(|id| id.to_string()),
                entry.idempotency_key(),
                serde_json::to_string(&entry.payload)?,
                state.as_str(),
                entry.attempts,
                entry.last_attempt_at.map(format_datetime),
                entry.next_attempt_at.map(format_datetime),
                entry.last_error,
                entry.acked_at.map(format_datetime),
                format_datetime(entry.created_at),
            ],
        )?;
        Ok(())
    }

    fn salvage_sessions(&self, old: &Connection) -> Result<usize> {
        let mut stmt = old.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY started_at ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut count = 0;
        while let Ok(Some(row)) = rows.next() {
            let Ok(session) = row_to_session(row) else {
                continue;
            };
            if self.insert_session(&session).is_ok() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn salvage_controller_state(&self, old: &Connection) -> Result<()> {
        let snapshot = old
            .query_row(
                "SELECT state, session_id, sync_degraded FROM controller_state WHERE id = 1",
                [],
                |row| {
                    let session_id: Option<String> = row.get(1)?;
                    Ok(ControllerSnapshot {
                        state: parse_enum(&row.get::<_, String>(0)?)?,
                        session_id: session_id.as_deref().map(parse_uuid).transpose()?,
                        sync_degraded: row.get(2)?,
                    })
                },
            )
            .context("Failed to read controller state")?;
        self.save_controller_state(&snapshot)
    }
}

fn set_aside(path: &Path) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let aside = PathBuf::from(format!("{}.corrupt-{stamp}", path.display()));
    std::fs::rename(path, &aside)
        .with_context(|| format!("Failed to move damaged database {}", path.display()))?;

    for suffix in ["-wal", "-shm"] {
        let side = PathBuf::from(format!("{}{suffix}", path.display()));
        if side.exists() {
            let target = PathBuf::from(format!("{}{suffix}", aside.display()));
            if let Err(e) = std::fs::rename(&side, &target) {
                log::warn!("Failed to move {}: {e}", side.display());
            }
        }
    }
    Ok(aside)
}
