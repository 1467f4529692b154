use chrono::{DateTime, Local, Utc};
use classguard_core::ipc::DaemonStatus;
use classguard_storage::{Partition, PartitionStats};
use std::collections::BTreeMap;
use tabled::{Table, Tabled};

#[derive(Tabled)]
pub struct PartitionRow {
    #[tabled(rename = "Partition")]
    partition: String,
    #[tabled(rename = "Pending")]
    pending: u64,
    #[tabled(rename = "In flight")]
    in_flight: u64,
    #[tabled(rename = "Retrying")]
    retrying: u64,
    #[tabled(rename = "Failed")]
    permanently_failed: u64,
    #[tabled(rename = "Acked")]
    acked: u64,
}

pub fn partition_table(stats: &BTreeMap<Partition, PartitionStats>) -> Table {
    let rows: Vec<PartitionRow> = Partition::BY_PRIORITY
        .iter()
        .map(|partition| {
            let s = stats.get(partition).cloned().unwrap_or_default();
            PartitionRow {
                partition: partition.to_string(),
                pending: s.pending,
                in_flight: s.in_flight,
                retrying: s.retrying,
                permanently_failed: s.permanently_failed,
                acked: s.acked,
            }
        })
        .collect();
    Table::new(rows)
}

fn local(time: DateTime<Utc>, format: &str) -> String {
    time.with_timezone(&Local).format(format).to_string()
}

fn or_none<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "None".to_string(), |v| v.to_string())
}

pub fn print_status(status: &DaemonStatus) {
    println!("Daemon Status: Running (PID: {})", status.pid);
    println!("Health: {}", status.system);

    let session = &status.session;
    println!("\nSession:");
    println!("  State: {}", session.state);
    println!("  Role: {}", session.role);
    println!("  Session: {}", or_none(session.session_id));
    println!(
        "  Started: {}",
        or_none(session.started_at.map(|t| local(t, "%Y-%m-%d %H:%M:%S")))
    );
    println!(
        "  Enforcement: {}",
        session.enforcement.as_deref().unwrap_or("not monitoring")
    );
    if let Some(confirmed) = session.finalize_confirmed {
        println!(
            "  Finalize: {}",
            if confirmed { "confirmed" } else { "not confirmed by backend" }
        );
    }

    println!("\nSync:");
    match &status.sync {
        Some(sync) => {
            println!("  Online: {}", if sync.online { "yes" } else { "no" });
            if sync.auth_suspended || session.auth_expired {
                println!("  Suspended: credentials expired");
            }
            println!(
                "  Last success: {}",
                or_none(sync.last_success_at.map(|t| local(t, "%H:%M:%S")))
            );
            if let Some(error) = &sync.last_error {
                println!("  Last error: {error} ({} in a row)", sync.consecutive_failures);
            }
        }
        None => println!("  Backend not configured"),
    }
    if session.sync_degraded {
        println!("  Degraded: some entries could not be delivered");
    }

    println!("\nOutbox:");
    println!("{}", partition_table(&status.outbox));
    if status.dropped > 0 {
        println!("Dropped attention events: {}", status.dropped);
    }
    if status.pending_help > 0 {
        println!("Help requests awaiting acknowledgement: {}", status.pending_help);
    }
}
