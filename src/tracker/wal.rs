//! Write-ahead log for critical task transitions (spec §4.7.1).
//!
//! One append-only JSON-lines file per project, `recovery.wal.jsonl`.
//! The Tracker appends to it synchronously before queuing the debounced
//! consolidation write, the same `save_current`-before-`finish_run`
//! discipline the reference audit logger uses to guarantee a durable
//! on-disk record of in-flight state always exists.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use forge_common::Task;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const WAL_FILE: &str = "recovery.wal.jsonl";

/// A durable intent recorded ahead of the debounced consolidation write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Transition {
    TaskDone { task_id: Uuid, output_files: Vec<String> },
    StepDone { task_id: Uuid, step_ordinal: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub project_id: Uuid,
    pub transition: Transition,
}

/// Append one entry, assigning it the next sequence number. Opens and
/// flushes the file synchronously on the calling task — this is the
/// "durable before we move on" step, so it deliberately does not go
/// through the debounced writer.
pub async fn append(dir: &Path, project_id: Uuid, transition: Transition) -> Result<()> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(WAL_FILE);
        let sequence = last_sequence(&path)?.map(|s| s + 1).unwrap_or(1);
        let entry = WalEntry {
            sequence,
            timestamp: Utc::now(),
            project_id,
            transition,
        };
        let line = serde_json::to_string(&entry).context("failed to serialize WAL entry")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
        file.sync_data().ok();
        Ok(())
    })
    .await
    .context("WAL append task panicked")?
}

fn last_sequence(path: &Path) -> Result<Option<u64>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|l| serde_json::from_str::<WalEntry>(l).ok())
        .map(|e| e.sequence)
        .max())
}

/// On startup, if the WAL's last sequence is newer than the sidecar's
/// recorded state implies, return the tail entries the consolidated
/// store hasn't absorbed yet so the caller can replay them. We treat
/// every WAL entry whose `TaskDone` task is not already `Done` in the
/// loaded sidecar as unabsorbed.
pub async fn replay_if_newer(dir: &Path, sidecar_tasks: &[Task]) -> Result<Vec<WalEntry>> {
    let path = dir.join(WAL_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let done: std::collections::HashSet<Uuid> = sidecar_tasks
        .iter()
        .filter(|t| t.status == forge_common::TaskStatus::Done)
        .map(|t| t.id)
        .collect();

    let content = std::fs::read_to_string(&path)?;
    let tail: Vec<WalEntry> = content
        .lines()
        .filter_map(|l| serde_json::from_str::<WalEntry>(l).ok())
        .filter(|e| match &e.transition {
            Transition::TaskDone { task_id, .. } => !done.contains(task_id),
            Transition::StepDone { .. } => false,
        })
        .collect();
    Ok(tail)
}
