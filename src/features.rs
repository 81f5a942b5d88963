use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::{ReaderBuilder, WriterBuilder};
use std::path::Path;
use tracing::info;

use crate::paths::PathRecord;
use crate::vocabulary::TagVocabulary;

const KEY_COLUMNS: [&str; 2] = ["UID", "Date"];
const OUTCOME_COLUMN: &str = "y";

/// Per-path feature counts and the conversion outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureVector {
    pub user_id: String,
    pub date: NaiveDate,
    /// One count per vocabulary feature, in feature order.
    pub counts: Vec<u32>,
    pub outcome: bool,
}

impl FeatureVector {
    pub fn key(&self) -> (&str, NaiveDate) {
        (self.user_id.as_str(), self.date)
    }

    pub fn y(&self) -> u8 {
        u8::from(self.outcome)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureTable {
    pub feature_names: Vec<String>,
    pub rows: Vec<FeatureVector>,
}

impl FeatureTable {
    pub fn positive_count(&self) -> usize {
        self.rows.iter().filter(|row| row.outcome).count()
    }
}

/// How many times `feature` occurs in a label sequence.
pub fn count_feature(labels: &[String], feature: &str) -> u32 {
    labels.iter().filter(|label| *label == feature).count() as u32
}

/// Whether any purchase-intent tag occurs in a label sequence.
pub fn has_purchase_intent(labels: &[String], vocabulary: &TagVocabulary) -> bool {
    labels.iter().any(|label| vocabulary.is_purchase_intent(label))
}

pub fn feature_vector(path: &PathRecord, vocabulary: &TagVocabulary) -> FeatureVector {
    FeatureVector {
        user_id: path.user_id.clone(),
        date: path.date,
        counts: vocabulary
            .features()
            .iter()
            .map(|feature| count_feature(&path.labels, feature))
            .collect(),
        outcome: has_purchase_intent(&path.labels, vocabulary),
    }
}

pub fn build_feature_table(paths: &[PathRecord], vocabulary: &TagVocabulary) -> FeatureTable {
    let rows: Vec<FeatureVector> = paths
        .iter()
        .map(|path| feature_vector(path, vocabulary))
        .collect();

    let table = FeatureTable {
        feature_names: vocabulary.features().to_vec(),
        rows,
    };
    info!(
        action = "complete",
        component = "feature_table",
        row_count = table.rows.len(),
        feature_count = table.feature_names.len(),
        positive_count = table.positive_count(),
        "Built feature table"
    );
    table
}

pub fn write_feature_table(file_path: &Path, table: &FeatureTable) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_path(file_path)
        .with_context(|| format!("Failed to create {:?}", file_path))?;

    let mut header: Vec<&str> = KEY_COLUMNS.to_vec();
    header.extend(table.feature_names.iter().map(String::as_str));
    header.push(OUTCOME_COLUMN);
    writer.write_record(&header)?;

    for row in &table.rows {
        let mut record = Vec::with_capacity(row.counts.len() + 3);
        record.push(row.user_id.clone());
        record.push(row.date.format("%Y-%m-%d").to_string());
        record.extend(row.counts.iter().map(u32::to_string));
        record.push(row.y().to_string());
        writer.write_record(&record)?;
    }

    writer.flush()?;
    info!(action = "write", component = "feature_table", file_path = ?file_path, row_count = table.rows.len(), "Wrote feature table");
    Ok(())
}

/// Read a feature table back, rejecting any header that does not match the
/// vocabulary's feature columns exactly.
pub fn read_feature_table(file_path: &Path, vocabulary: &TagVocabulary) -> Result<FeatureTable> {
    if !file_path.exists() {
        anyhow::bail!("Feature table not found: {:?}", file_path);
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(file_path)
        .with_context(|| format!("Failed to open {:?}", file_path))?;

    let headers = reader.headers()?.clone();
    let expected: Vec<&str> = KEY_COLUMNS
        .iter()
        .copied()
        .chain(vocabulary.features().iter().map(String::as_str))
        .chain(std::iter::once(OUTCOME_COLUMN))
        .collect();
    if headers.iter().ne(expected.iter().copied()) {
        anyhow::bail!(
            "Feature table {:?} has columns [{}], expected [{}]",
            file_path,
            headers.iter().collect::<Vec<_>>().join(","),
            expected.join(",")
        );
    }

    let feature_count = vocabulary.features().len();
    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Invalid feature row {}", index + 1))?;
        let date = NaiveDate::parse_from_str(&record[1], "%Y-%m-%d")
            .with_context(|| format!("Invalid Date in feature row {}", index + 1))?;
        let counts = (0..feature_count)
            .map(|i| {
                record[i + 2]
                    .parse::<u32>()
                    .with_context(|| format!("Invalid count in feature row {}", index + 1))
            })
            .collect::<Result<Vec<u32>>>()?;
        let outcome = match &record[feature_count + 2] {
            "0" => false,
            "1" => true,
            other => anyhow::bail!("Invalid outcome '{}' in feature row {}", other, index + 1),
        };
        rows.push(FeatureVector {
            user_id: record[0].to_string(),
            date,
            counts,
            outcome,
        });
    }

    info!(action = "loaded", component = "feature_table", file_path = ?file_path, row_count = rows.len(), "Read feature table");
    Ok(FeatureTable {
        feature_names: vocabulary.features().to_vec(),
        rows,
    })
}
