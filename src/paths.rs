use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

use crate::events::LabeledEvent;

/// The labels one user visited on one calendar day, in time order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRecord {
    pub user_id: String,
    pub date: NaiveDate,
    pub labels: Vec<String>,
}

impl PathRecord {
    pub fn key(&self) -> (&str, NaiveDate) {
        (self.user_id.as_str(), self.date)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PathRow {
    #[serde(rename = "UID")]
    uid: String,
    #[serde(rename = "Date")]
    date: NaiveDate,
    #[serde(rename = "Path")]
    path: String,
}

/// Group labeled events into one path per (user, calendar date).
///
/// Output is ordered by user then date. Events sharing a timestamp keep
/// their input order.
pub fn build_paths(events: &[LabeledEvent]) -> Vec<PathRecord> {
    let mut ordered: Vec<&LabeledEvent> = events.iter().collect();
    // stable: ties on (user, timestamp) keep input order
    ordered.sort_by(|a, b| {
        a.user_id
            .cmp(&b.user_id)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });

    let mut paths: Vec<PathRecord> = Vec::new();
    for event in ordered {
        let date = event.timestamp.date();
        if let Some(current) = paths.last_mut() {
            if current.user_id == event.user_id && current.date == date {
                current.labels.push(event.label.clone());
                continue;
            }
        }
        paths.push(PathRecord {
            user_id: event.user_id.clone(),
            date,
            labels: vec![event.label.clone()],
        });
    }

    if paths.is_empty() {
        warn!(
            action = "complete",
            component = "path_building",
            "No labeled events, no paths were built"
        );
    } else {
        info!(
            action = "complete",
            component = "path_building",
            path_count = paths.len(),
            event_count = events.len(),
            "Built user paths"
        );
    }
    paths
}

const PATHS_HEADER: [&str; 3] = ["UID", "Date", "Path"];

pub fn write_paths(file_path: &Path, paths: &[PathRecord]) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_path(file_path)
        .with_context(|| format!("Failed to create {:?}", file_path))?;
    writer.write_record(PATHS_HEADER)?;

    for record in paths {
        writer.serialize(PathRow {
            uid: record.user_id.clone(),
            date: record.date,
            path: serde_json::to_string(&record.labels)?,
        })?;
    }

    writer.flush()?;
    info!(action = "write", component = "paths_table", file_path = ?file_path, row_count = paths.len(), "Wrote paths table");
    Ok(())
}

pub fn read_paths(file_path: &Path) -> Result<Vec<PathRecord>> {
    let start_time = Instant::now();
    if !file_path.exists() {
        anyhow::bail!("Paths file not found: {:?}", file_path);
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(file_path)
        .with_context(|| format!("Failed to open {:?}", file_path))?;

    let mut paths = Vec::new();
    for (index, row) in reader.deserialize::<PathRow>().enumerate() {
        let row = row.with_context(|| format!("Invalid paths row {}", index + 1))?;
        let labels: Vec<String> = serde_json::from_str(&row.path)
            .with_context(|| format!("Invalid Path value in paths row {}", index + 1))?;
        paths.push(PathRecord {
            user_id: row.uid,
            date: row.date,
            labels,
        });
    }

    info!(
        action = "loaded",
        component = "paths_table",
        file_path = ?file_path,
        row_count = paths.len(),
        duration_ms = start_time.elapsed().as_millis(),
        "Read paths table"
    );
    Ok(paths)
}
