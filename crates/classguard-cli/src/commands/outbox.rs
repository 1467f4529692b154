/// Local outbox inspection; reads the database directly so it works with the
/// daemon stopped
use anyhow::Result;
use classguard_storage::{Database, OutboxEntry};
use std::path::Path;
use tabled::{Table, Tabled};

use super::helpers::truncate_str;
use super::status::partition_table;

#[derive(Tabled)]
struct FailedRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Partition")]
    partition: String,
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Last error")]
    last_error: String,
    #[tabled(rename = "Created")]
    created: String,
}

impl From<&OutboxEntry> for FailedRow {
    fn from(entry: &OutboxEntry) -> Self {
        Self {
            id: entry.id,
            partition: entry.partition.to_string(),
            key: truncate_str(&entry.idempotency_key(), 24),
            attempts: entry.attempts,
            last_error: truncate_str(entry.last_error.as_deref().unwrap_or("-"), 40),
            created: entry.created_at.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

pub fn show_outbox(data_dir: &Path, failed: bool, limit: usize) -> Result<()> {
    let db = Database::new(Some(data_dir.join("classguard.db")))?;

    if failed {
        let entries = db.permanent_outbox_failures(limit)?;
        if entries.is_empty() {
            println!("No permanently failed entries.");
            return Ok(());
        }
        let rows: Vec<FailedRow> = entries.iter().map(FailedRow::from).collect();
        println!("{}", Table::new(rows));
        return Ok(());
    }

    println!("{}", partition_table(&db.outbox_stats()?));

    let dropped = db.dropped_count()?;
    if dropped > 0 {
        println!("\nDropped attention events: {dropped}");
        for gap in db.sequence_gaps(limit)? {
            println!(
                "  {} seq {} dropped at {}",
                gap.partition,
                gap.sequence_number
                    .map_or_else(|| "-".to_string(), |n| n.to_string()),
                gap.dropped_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}
