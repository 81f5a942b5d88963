use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::WriterBuilder;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

use crate::features::{count_feature, FeatureVector};
use crate::paths::PathRecord;

pub const DEFAULT_MAX_COUNT: u32 = 8;

/// Conversion rate among paths where a feature occurs exactly `count` times.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateSample {
    pub feature: String,
    pub count: u32,
    /// Percentage in [0, 100]; 0 when `sample_size` is 0.
    pub conversion_rate: f64,
    pub sample_size: usize,
}

/// A path paired with the outcome recorded for the same (user, date).
#[derive(Debug, Clone, Copy)]
pub struct JoinedPath<'a> {
    pub path: &'a PathRecord,
    pub outcome: bool,
}

/// Pair every path with its outcome row by (user, date).
///
/// The tables must have the same length and the same key set with no
/// duplicates; anything else is an error rather than a partial join.
pub fn join_outcomes<'a>(
    paths: &'a [PathRecord],
    outcomes: &[FeatureVector],
) -> Result<Vec<JoinedPath<'a>>> {
    if paths.len() != outcomes.len() {
        anyhow::bail!(
            "Paths table has {} rows but outcome table has {}; refusing to join",
            paths.len(),
            outcomes.len()
        );
    }

    let mut by_key: HashMap<(&str, NaiveDate), bool> = HashMap::with_capacity(outcomes.len());
    for row in outcomes {
        if by_key.insert(row.key(), row.outcome).is_some() {
            anyhow::bail!(
                "Duplicate outcome row for user '{}' on {}",
                row.user_id,
                row.date
            );
        }
    }

    let mut seen: HashSet<(&str, NaiveDate)> = HashSet::with_capacity(paths.len());
    let mut joined = Vec::with_capacity(paths.len());
    for path in paths {
        if !seen.insert(path.key()) {
            anyhow::bail!(
                "Duplicate path row for user '{}' on {}",
                path.user_id,
                path.date
            );
        }
        let outcome = by_key.get(&path.key()).copied().with_context(|| {
            format!(
                "No outcome row for user '{}' on {}",
                path.user_id, path.date
            )
        })?;
        joined.push(JoinedPath { path, outcome });
    }
    Ok(joined)
}

/// `converted / total * 100`, or 0 for an empty partition.
pub fn conversion_rate(converted: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    converted as f64 / total as f64 * 100.0
}

pub fn rate_sample(joined: &[JoinedPath<'_>], feature: &str, count: u32) -> RateSample {
    let partition = joined
        .iter()
        .filter(|j| count_feature(&j.path.labels, feature) == count);
    let (total, converted) = partition.fold((0, 0), |(total, converted), j| {
        (total + 1, converted + usize::from(j.outcome))
    });

    RateSample {
        feature: feature.to_string(),
        count,
        conversion_rate: conversion_rate(converted, total),
        sample_size: total,
    }
}

/// One sample per (feature, k) for k in 0..=max_count, feature-major in the
/// order given.
pub fn aggregate_rates(
    joined: &[JoinedPath<'_>],
    features: &[String],
    max_count: u32,
) -> Vec<RateSample> {
    let samples: Vec<RateSample> = features
        .iter()
        .flat_map(|feature| (0..=max_count).map(move |k| rate_sample(joined, feature, k)))
        .collect();

    info!(
        action = "complete",
        component = "rate_aggregation",
        feature_count = features.len(),
        max_count,
        path_count = joined.len(),
        sample_count = samples.len(),
        "Aggregated conversion rates"
    );
    samples
}

const RATE_HEADER: [&str; 4] = ["feature", "count", "conversion_rate", "sample_size"];

pub fn write_rates(file_path: &Path, samples: &[RateSample]) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_path(file_path)
        .with_context(|| format!("Failed to create {:?}", file_path))?;
    writer.write_record(RATE_HEADER)?;
    for sample in samples {
        writer.serialize(sample)?;
    }
    writer.flush()?;
    info!(action = "write", component = "rate_table", file_path = ?file_path, row_count = samples.len(), "Wrote rate table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn path(user: &str, d: u32, labels: &[&str]) -> PathRecord {
        PathRecord {
            user_id: user.into(),
            date: day(d),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn outcome(user: &str, d: u32, y: bool) -> FeatureVector {
        FeatureVector {
            user_id: user.into(),
            date: day(d),
            counts: Vec::new(),
            outcome: y,
        }
    }

    #[test]
    fn empty_partition_is_zero_not_an_error() {
        let paths = vec![path("U1", 1, &["events"])];
        let outcomes = vec![outcome("U1", 1, true)];
        let joined = join_outcomes(&paths, &outcomes).unwrap();
        let sample = rate_sample(&joined, "events", 3);
        assert_eq!(sample.conversion_rate, 0.0);
        assert_eq!(sample.sample_size, 0);
    }

    #[test]
    fn rates_per_exact_count() {
        let paths = vec![
            path("U1", 1, &["events", "channel=online"]),
            path("U2", 1, &["events"]),
            path("U3", 1, &["events", "events"]),
            path("U4", 1, &["news"]),
        ];
        let outcomes = vec![
            outcome("U1", 1, true),
            outcome("U2", 1, false),
            outcome("U3", 1, true),
            outcome("U4", 1, false),
        ];
        let joined = join_outcomes(&paths, &outcomes).unwrap();
        let samples = aggregate_rates(&joined, &["events".to_string()], 3);
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].sample_size, 1);
        assert_eq!(samples[0].conversion_rate, 0.0);
        assert_eq!(samples[1].sample_size, 2);
        assert_eq!(samples[1].conversion_rate, 50.0);
        assert_eq!(samples[2].sample_size, 1);
        assert_eq!(samples[2].conversion_rate, 100.0);
        assert_eq!(samples[3].sample_size, 0);
        assert!(samples
            .iter()
            .all(|s| (0.0..=100.0).contains(&s.conversion_rate)));
    }

    #[test]
    fn samples_are_feature_major() {
        let paths = vec![path("U1", 1, &["vip"])];
        let outcomes = vec![outcome("U1", 1, false)];
        let joined = join_outcomes(&paths, &outcomes).unwrap();
        let features = vec!["vip".to_string(), "tags".to_string()];
        let samples = aggregate_rates(&joined, &features, DEFAULT_MAX_COUNT);
        assert_eq!(samples.len(), 18);
        assert_eq!(samples[0].feature, "vip");
        assert_eq!(samples[8].count, 8);
        assert_eq!(samples[9].feature, "tags");
        assert_eq!(samples[9].count, 0);
        assert_eq!(samples[9].sample_size, 1);
    }

    #[test]
    fn row_count_mismatch_is_fatal() {
        let paths: Vec<PathRecord> = (1..=10).map(|d| path("U1", d, &["events"])).collect();
        let outcomes: Vec<FeatureVector> = (1..=9).map(|d| outcome("U1", d, false)).collect();
        let err = join_outcomes(&paths, &outcomes).unwrap_err();
        assert!(err.to_string().contains("10 rows"));
        assert!(err.to_string().contains("has 9"));
    }

    #[test]
    fn join_is_by_key_not_position() {
        let paths = vec![path("U1", 1, &["events"]), path("U2", 1, &["events"])];
        let outcomes = vec![outcome("U2", 1, true), outcome("U1", 1, false)];
        let joined = join_outcomes(&paths, &outcomes).unwrap();
        assert!(!joined[0].outcome);
        assert!(joined[1].outcome);
    }

    #[test]
    fn empty_rate_table_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rates.csv");
        write_rates(&file, &[]).unwrap();
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "feature,count,conversion_rate,sample_size\n"
        );
    }

    #[test]
    fn missing_or_duplicate_keys_are_fatal() {
        let paths = vec![path("U1", 1, &["events"]), path("U2", 1, &["events"])];
        let mismatched = vec![outcome("U1", 1, true), outcome("U3", 1, true)];
        assert!(join_outcomes(&paths, &mismatched).is_err());

        let duplicated = vec![outcome("U1", 1, true), outcome("U1", 1, false)];
        assert!(join_outcomes(&paths, &duplicated).is_err());
    }
}
