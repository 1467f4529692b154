use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::helpers::{format_datetime, parse_datetime, parse_enum, parse_optional_datetime};
use super::Database;
use crate::models::{
    AppendOutcome, CapacityPolicy, FailureOutcome, OutboxEntry, OutboxPayload, OutboxState,
    Partition, PartitionStats, RetryPolicy, SequenceGap,
};

pub(super) const ENTRY_COLUMNS: &str = "id, partition, payload, state, attempts, last_attempt_at,
     next_attempt_at, last_error, created_at, acked_at";

/// Live = still counted against the partition bound
const LIVE_PREDICATE: &str =
    "(state IN ('pending', 'in_flight') OR (state = 'failed' AND next_attempt_at IS NOT NULL))";

const DROP_COUNTER: &str = "dropped_attention";

/// Raw outbox row that could not be decoded
#[derive(Debug, Clone)]
pub struct UndecodableRow {
    pub id: i64,
    pub raw_payload: Option<String>,
    pub error: String,
}

impl Database {
    /// Append a payload to its partition.
    ///
    /// Sequenced payloads get the next device sequence number inside the same
    /// transaction, so numbers are never reused. When the attention partition
    /// is over its bound, its oldest pending entry is evicted and a gap is
    /// recorded. The other partitions never evict.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails
    pub fn append_outbox(
        &self,
        mut payload: OutboxPayload,
        capacity: &CapacityPolicy,
    ) -> Result<AppendOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = Utc::now();
        let partition = payload.partition();
        let device_id = payload.device_id().to_string();

        if payload.sequence_number().is_some() {
            let next: i64 = tx.query_row(
                "INSERT INTO device_sequences (device_id, last_sequence) VALUES (?1, 1)
                 ON CONFLICT(device_id) DO UPDATE SET last_sequence = last_sequence + 1
                 RETURNING last_sequence",
                params![device_id],
                |row| row.get(0),
            )?;
            payload.assign_sequence(u64::try_from(next).context("Negative sequence counter")?);
        }

        tx.execute(
            "INSERT INTO outbox (partition, device_id, session_id, idempotency_key, payload,
                                 state, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6)",
            params![
                partition.as_str(),
                device_id,
                payload.session_id().map(|id| id.to_string()),
                payload.idempotency_key(),
                serde_json::to_string(&payload)?,
                format_datetime(now),
            ],
        )?;
        let id = tx.last_insert_rowid();

        let live = count_live(&tx, partition)?;
        let mut dropped = Vec::new();
        let mut over_capacity = false;

        if live > u64::from(capacity.limit(partition)) {
            if partition.is_droppable() {
                match evict_oldest_pending(&tx, partition, id, now)? {
                    Some(gap) => dropped.push(gap),
                    None => over_capacity = true,
                }
            } else {
                over_capacity = true;
            }
        }

        tx.commit()?;

        for gap in &dropped {
            log::warn!(
                "Outbox {} over capacity, dropped {} (sequence {:?})",
                gap.partition,
                gap.idempotency_key,
                gap.sequence_number
            );
        }
        if over_capacity {
            log::warn!("Outbox {partition} holds {live} live entries, above its bound");
        }

        Ok(AppendOutcome {
            entry: OutboxEntry {
                id,
                partition,
                payload,
                state: OutboxState::Pending,
                attempts: 0,
                last_attempt_at: None,
                next_attempt_at: None,
                last_error: None,
                created_at: now,
                acked_at: None,
            },
            dropped,
            over_capacity,
        })
    }

    /// Move up to `max` pending entries of a partition to `InFlight`.
    ///
    /// Ordered partitions are only claimed when nothing of theirs is in flight
    /// or waiting for a retry, which keeps delivery FIFO and makes a second
    /// concurrent claim return nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails or a row cannot be decoded
    pub fn claim_outbox_batch(
        &self,
        partition: Partition,
        max: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if partition.is_ordered() {
            let blocked: i64 = tx.query_row(
                "SELECT COUNT(*) FROM outbox
                 WHERE partition = ?1
                   AND (state = 'in_flight' OR (state = 'failed' AND next_attempt_at IS NOT NULL))",
                params![partition.as_str()],
                |row| row.get(0),
            )?;
            if blocked > 0 {
                return Ok(Vec::new());
            }
        }

        let mut entries = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM outbox
                 WHERE partition = ?1 AND state = 'pending'
                 ORDER BY id ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(
                params![partition.as_str(), i64::try_from(max).unwrap_or(i64::MAX)],
                row_to_outbox_entry,
            )?;
            for row in rows {
                entries.push(row?);
            }
        }

        let stamp = format_datetime(now);
        for entry in &mut entries {
            tx.execute(
                "UPDATE outbox SET state = 'in_flight', attempts = attempts + 1, last_attempt_at = ?1
                 WHERE id = ?2",
                params![stamp, entry.id],
            )?;
            entry.state = OutboxState::InFlight;
            entry.attempts += 1;
            entry.last_attempt_at = Some(now);
        }

        tx.commit()?;
        Ok(entries)
    }

    /// Mark in-flight entries as delivered
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails
    pub fn mark_outbox_acked(&self, ids: &[i64], now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let stamp = format_datetime(now);
        let mut changed = 0;
        for id in ids {
            changed += tx.execute(
                "UPDATE outbox
                 SET state = 'acked', acked_at = ?1, next_attempt_at = NULL, last_error = NULL
                 WHERE id = ?2 AND state = 'in_flight'",
                params![stamp, id],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Mark in-flight entries as failed.
    ///
    /// Entries below the retry budget get a `next_attempt_at`; entries that
    /// used it up become permanently failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails
    pub fn mark_outbox_failed(
        &self,
        ids: &[i64],
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<Vec<FailureOutcome>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut outcomes = Vec::with_capacity(ids.len());

        for id in ids {
            let attempts: Option<u32> = tx
                .query_row(
                    "SELECT attempts FROM outbox WHERE id = ?1 AND state = 'in_flight'",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(attempts) = attempts else {
                continue;
            };

            let permanent = attempts >= policy.max_attempts;
            let next_attempt_at = if permanent {
                None
            } else {
                let delay = chrono::Duration::from_std(policy.delay_after(attempts))
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
                Some(format_datetime(now + delay))
            };

            tx.execute(
                "UPDATE outbox SET state = 'failed', next_attempt_at = ?1, last_error = ?2
                 WHERE id = ?3",
                params![next_attempt_at, error, id],
            )?;
            outcomes.push(FailureOutcome {
                id: *id,
                attempts,
                permanent,
            });
        }

        tx.commit()?;
        Ok(outcomes)
    }

    /// Fail in-flight entries permanently, without retry
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails
    pub fn mark_outbox_rejected(&self, ids: &[i64], reason: &str) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut changed = 0;
        for id in ids {
            changed += tx.execute(
                "UPDATE outbox SET state = 'failed', next_attempt_at = NULL, last_error = ?1
                 WHERE id = ?2 AND state = 'in_flight'",
                params![reason, id],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Return in-flight entries to pending and take back the attempt they used
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails
    pub fn requeue_outbox(&self, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut changed = 0;
        for id in ids {
            changed += tx.execute(
                "UPDATE outbox SET state = 'pending', attempts = MAX(attempts - 1, 0)
                 WHERE id = ?1 AND state = 'in_flight'",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Return failed entries whose backoff elapsed to pending
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails
    pub fn promote_due_retries(&self, now: DateTime<Utc>) -> Result<usize> {
        let changed = self.conn().execute(
            "UPDATE outbox SET state = 'pending', next_attempt_at = NULL
             WHERE state = 'failed' AND next_attempt_at IS NOT NULL AND next_attempt_at <= ?1",
            params![format_datetime(now)],
        )?;
        Ok(changed)
    }

    /// Return every in-flight entry to pending.
    ///
    /// Run at startup: anything in flight when the process died may or may not
    /// have reached the backend, and resending it is safe.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails
    pub fn recover_in_flight(&self) -> Result<usize> {
        let changed = self.conn().execute(
            "UPDATE outbox SET state = 'pending' WHERE state = 'in_flight'",
            [],
        )?;
        Ok(changed)
    }

    /// Delete acked entries older than `before`
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails
    pub fn purge_acked_outbox(&self, before: DateTime<Utc>) -> Result<usize> {
        let deleted = self.conn().execute(
            "DELETE FROM outbox WHERE state = 'acked' AND acked_at < ?1",
            params![format_datetime(before)],
        )?;
        Ok(deleted)
    }

    /// Entry counts per partition
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    pub fn outbox_stats(&self) -> Result<BTreeMap<Partition, PartitionStats>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT partition, state, next_attempt_at IS NOT NULL, COUNT(*)
             FROM outbox
             GROUP BY partition, state, next_attempt_at IS NOT NULL",
        )?;

        let mut stats: BTreeMap<Partition, PartitionStats> = Partition::BY_PRIORITY
            .iter()
            .map(|p| (*p, PartitionStats::default()))
            .collect();

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    parse_enum::<Partition>(&row.get::<_, String>(0)?)?,
                    parse_enum::<OutboxState>(&row.get::<_, String>(1)?)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for (partition, state, retrying, count) in rows {
            let count = u64::try_from(count).unwrap_or_default();
            let entry = stats.entry(partition).or_default();
            match state {
                OutboxState::Pending => entry.pending += count,
                OutboxState::InFlight => entry.in_flight += count,
                OutboxState::Acked => entry.acked += count,
                OutboxState::Failed if retrying => entry.retrying += count,
                OutboxState::Failed => entry.permanently_failed += count,
            }
        }

        Ok(stats)
    }

    /// Total attention entries dropped on overflow
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    pub fn dropped_count(&self) -> Result<u64> {
        let value: Option<i64> = self
            .conn()
            .query_row(
                "SELECT value FROM counters WHERE name = ?1",
                params![DROP_COUNTER],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0))
    }

    /// Most recent sequence gaps, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    pub fn sequence_gaps(&self, limit: usize) -> Result<Vec<SequenceGap>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT device_id, partition, sequence_number, idempotency_key, dropped_at
             FROM outbox_gaps
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let gaps = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok(SequenceGap {
                    device_id: row.get(0)?,
                    partition: parse_enum(&row.get::<_, String>(1)?)?,
                    sequence_number: row
                        .get::<_, Option<i64>>(2)?
                        .and_then(|n| u64::try_from(n).ok()),
                    idempotency_key: row.get(3)?,
                    dropped_at: parse_datetime(&row.get::<_, String>(4)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(gaps)
    }

    /// List entries of a partition, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded
    pub fn list_outbox(
        &self,
        partition: Partition,
        state: Option<OutboxState>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox
             WHERE partition = ?1 AND (?2 IS NULL OR state = ?2)
             ORDER BY id ASC
             LIMIT ?3"
        ))?;
        let entries = stmt
            .query_map(
                params![
                    partition.as_str(),
                    state.map(OutboxState::as_str),
                    i64::try_from(limit).unwrap_or(i64::MAX)
                ],
                row_to_outbox_entry,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Entries that exhausted their retries or were rejected
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded
    pub fn permanent_outbox_failures(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox
             WHERE state = 'failed' AND next_attempt_at IS NULL
             ORDER BY id ASC
             LIMIT ?1"
        ))?;
        let entries = stmt
            .query_map(
                params![i64::try_from(limit).unwrap_or(i64::MAX)],
                row_to_outbox_entry,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Get one entry by row id
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded
    pub fn get_outbox_entry(&self, id: i64) -> Result<Option<OutboxEntry>> {
        let entry = self
            .conn()
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM outbox WHERE id = ?1"),
                params![id],
                row_to_outbox_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Entries of a partition that are neither delivered nor permanently failed.
    /// With a session id, only that session's entries are counted.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    pub fn unsettled_outbox_count(
        &self,
        partition: Partition,
        session_id: Option<Uuid>,
    ) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            &format!(
                "SELECT COUNT(*) FROM outbox
                 WHERE partition = ?1 AND {LIVE_PREDICATE} AND (?2 IS NULL OR session_id = ?2)"
            ),
            params![partition.as_str(), session_id.map(|id| id.to_string())],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Unsettled emergency requests, used to rebuild pending handles at startup
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded
    pub fn unsettled_emergency_entries(&self) -> Result<Vec<OutboxEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox
             WHERE partition = 'emergency' AND {LIVE_PREDICATE}
             ORDER BY id ASC"
        ))?;
        let entries = stmt
            .query_map([], row_to_outbox_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Last sequence number handed out for a device
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    pub fn last_sequence(&self, device_id: &str) -> Result<Option<u64>> {
        let value: Option<i64> = self
            .conn()
            .query_row(
                "SELECT last_sequence FROM device_sequences WHERE device_id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| u64::try_from(v).ok()))
    }

    /// Decode every live row of a partition and report the ones that fail
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read at all
    pub fn scan_outbox_partition(&self, partition: Partition) -> Result<Vec<UndecodableRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox WHERE partition = ?1 AND state != 'acked'"
        ))?;
        let mut rows = stmt.query(params![partition.as_str()])?;
        let mut bad = Vec::new();
        while let Some(row) = rows.next()? {
            if let Err(e) = row_to_outbox_entry(row) {
                bad.push(UndecodableRow {
                    id: row.get(0)?,
                    raw_payload: row.get::<_, Option<String>>(2).ok().flatten(),
                    error: e.to_string(),
                });
            }
        }
        Ok(bad)
    }

    /// Move undecodable rows out of the outbox
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails
    pub fn quarantine_outbox_rows(
        &self,
        partition: Partition,
        rows: &[UndecodableRow],
    ) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let stamp = format_datetime(Utc::now());
        for row in rows {
            tx.execute(
                "INSERT OR REPLACE INTO outbox_quarantine (id, partition, raw_payload, quarantined_at, error)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![row.id, partition.as_str(), row.raw_payload, stamp, row.error],
            )?;
            tx.execute("DELETE FROM outbox WHERE id = ?1", params![row.id])?;
        }
        tx.commit()?;
        Ok(rows.len())
    }
}

fn count_live(tx: &Transaction<'_>, partition: Partition) -> Result<u64> {
    let count: i64 = tx.query_row(
        &format!("SELECT COUNT(*) FROM outbox WHERE partition = ?1 AND {LIVE_PREDICATE}"),
        params![partition.as_str()],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Evict the oldest pending entry other than `keep`, the row being appended
fn evict_oldest_pending(
    tx: &Transaction<'_>,
    partition: Partition,
    keep: i64,
    now: DateTime<Utc>,
) -> Result<Option<SequenceGap>> {
    let victim: Option<(i64, String, String, String)> = tx
        .query_row(
            "SELECT id, device_id, idempotency_key, payload FROM outbox
             WHERE partition = ?1 AND state = 'pending' AND id != ?2
             ORDER BY id ASC
             LIMIT 1",
            params![partition.as_str(), keep],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let Some((id, device_id, idempotency_key, raw)) = victim else {
        return Ok(None);
    };

    let sequence_number = serde_json::from_str::<OutboxPayload>(&raw)
        .ok()
        .and_then(|p| p.sequence_number());

    tx.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
    tx.execute(
        "INSERT INTO outbox_gaps (device_id, partition, sequence_number, idempotency_key, dropped_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            device_id,
            partition.as_str(),
            sequence_number.and_then(|n| i64::try_from(n).ok()),
            idempotency_key,
            format_datetime(now),
        ],
    )?;
    tx.execute(
        "INSERT INTO counters (name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1",
        params![DROP_COUNTER],
    )?;

    Ok(Some(SequenceGap {
        device_id,
        partition,
        sequence_number,
        idempotency_key,
        dropped_at: now,
    }))
}

/// Parse an `OutboxEntry` from a row selected with `ENTRY_COLUMNS`
pub(super) fn row_to_outbox_entry(row: &rusqlite::Row) -> rusqlite::Result<OutboxEntry> {
    let raw: String = row.get(2)?;
    let mut payload: OutboxPayload = serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let acked_at = parse_optional_datetime(row.get(9)?)?;
    if let OutboxPayload::Emergency(request) = &mut payload {
        request.acknowledged_at = acked_at;
    }

    Ok(OutboxEntry {
        id: row.get(0)?,
        partition: parse_enum(&row.get::<_, String>(1)?)?,
        payload,
        state: parse_enum(&row.get::<_, String>(3)?)?,
        attempts: row.get(4)?,
        last_attempt_at: parse_optional_datetime(row.get(5)?)?,
        next_attempt_at: parse_optional_datetime(row.get(6)?)?,
        last_error: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?)?,
        acked_at,
    })
}
