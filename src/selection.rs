use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

use crate::features::FeatureTable;
use crate::forest::{ForestParams, RandomForest};
use crate::vocabulary::TagVocabulary;

pub const TEST_FRACTION: f64 = 0.2;
pub const CV_FOLDS: usize = 5;
pub const DEFAULT_SEED: u64 = 11;

const GRID_MAX_DEPTH: [usize; 2] = [10, 20];
const GRID_MIN_SAMPLES_LEAF: [usize; 2] = [1, 10];
const GRID_N_ESTIMATORS: [usize; 2] = [100, 200];

#[derive(Debug, Clone)]
pub struct SelectionConfig {
    pub seed: u64,
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

/// Macro-averaged test-set scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationReport {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

#[derive(Debug, Clone)]
pub struct SelectionResult {
    pub best_params: ForestParams,
    pub best_cv_score: f64,
    pub report: ClassificationReport,
    /// Every feature, most important first.
    pub ranking: Vec<FeatureImportance>,
}

impl SelectionResult {
    pub fn top(&self, k: usize) -> &[FeatureImportance] {
        &self.ranking[..k.min(self.ranking.len())]
    }
}

/// The hyperparameter grid in search order; the last parameter varies fastest.
pub fn parameter_grid() -> Vec<ForestParams> {
    let mut grid = Vec::new();
    for &max_depth in &GRID_MAX_DEPTH {
        for &min_samples_leaf in &GRID_MIN_SAMPLES_LEAF {
            for &n_estimators in &GRID_N_ESTIMATORS {
                grid.push(ForestParams {
                    n_estimators,
                    max_depth,
                    min_samples_leaf,
                });
            }
        }
    }
    grid
}

/// Shuffle row indices and hold out `ceil(test_fraction * n)` of them.
pub fn train_test_split(n: usize, test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let test_len = ((n as f64) * test_fraction).ceil() as usize;
    let test = order[..test_len].to_vec();
    let train = order[test_len..].to_vec();
    (train, test)
}

/// Stratified k-fold test sets over `rows`: each class is cut into `k`
/// contiguous chunks in row order, and fold `i` takes chunk `i` of every class.
pub fn stratified_folds(rows: &[usize], y: &[bool], k: usize) -> Vec<Vec<usize>> {
    let mut folds = vec![Vec::new(); k];
    for class in [false, true] {
        let members: Vec<usize> = rows.iter().copied().filter(|&r| y[r] == class).collect();
        let base = members.len() / k;
        let extra = members.len() % k;
        let mut start = 0;
        for (i, fold) in folds.iter_mut().enumerate() {
            let len = base + usize::from(i < extra);
            fold.extend_from_slice(&members[start..start + len]);
            start += len;
        }
    }
    folds
}

pub fn accuracy(actual: &[bool], predicted: &[bool]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let correct = actual
        .iter()
        .zip(predicted)
        .filter(|(a, p)| a == p)
        .count();
    correct as f64 / actual.len() as f64
}

/// Macro precision/recall/F1 over the classes present in either input.
/// A class nobody predicted (or nobody has) scores 0 on that metric.
pub fn classification_report(actual: &[bool], predicted: &[bool]) -> ClassificationReport {
    let classes: Vec<bool> = [false, true]
        .into_iter()
        .filter(|c| actual.contains(c) || predicted.contains(c))
        .collect();
    if classes.is_empty() {
        return ClassificationReport {
            precision: 0.0,
            recall: 0.0,
            f1: 0.0,
        };
    }

    let (mut precision, mut recall, mut f1) = (0.0, 0.0, 0.0);
    for &class in &classes {
        let true_positive = actual
            .iter()
            .zip(predicted)
            .filter(|&(&a, &p)| a == class && p == class)
            .count() as f64;
        let predicted_count = predicted.iter().filter(|&&p| p == class).count() as f64;
        let actual_count = actual.iter().filter(|&&a| a == class).count() as f64;

        let p = if predicted_count > 0.0 {
            true_positive / predicted_count
        } else {
            0.0
        };
        let r = if actual_count > 0.0 {
            true_positive / actual_count
        } else {
            0.0
        };
        precision += p;
        recall += r;
        f1 += if p + r > 0.0 { 2.0 * p * r / (p + r) } else { 0.0 };
    }

    let n = classes.len() as f64;
    ClassificationReport {
        precision: precision / n,
        recall: recall / n,
        f1: f1 / n,
    }
}

fn cross_val_accuracy(
    x: &[Vec<u32>],
    y: &[bool],
    train: &[usize],
    params: &ForestParams,
    seed: u64,
) -> Result<f64> {
    let folds = stratified_folds(train, y, CV_FOLDS);
    let mut scores = Vec::with_capacity(CV_FOLDS);

    for fold in folds.iter().filter(|f| !f.is_empty()) {
        let held_out: HashSet<usize> = fold.iter().copied().collect();
        let fit_rows: Vec<usize> = train
            .iter()
            .copied()
            .filter(|r| !held_out.contains(r))
            .collect();
        let forest = RandomForest::fit(x, y, &fit_rows, params, seed)?;

        let actual: Vec<bool> = fold.iter().map(|&r| y[r]).collect();
        let predicted: Vec<bool> = fold.iter().map(|&r| forest.predict(&x[r])).collect();
        scores.push(accuracy(&actual, &predicted));
    }

    if scores.is_empty() {
        anyhow::bail!("Cross-validation produced no non-empty folds");
    }
    Ok(scores.iter().sum::<f64>() / scores.len() as f64)
}

/// Pick forest hyperparameters by cross-validated grid search, refit on the
/// training split, score on the test split and rank features by importance.
pub fn rank_features(table: &FeatureTable, config: &SelectionConfig) -> Result<SelectionResult> {
    let start_time = Instant::now();
    info!(
        action = "start",
        component = "model_ranking",
        row_count = table.rows.len(),
        worker_count = config.workers,
        seed = config.seed,
        "Starting feature ranking"
    );

    if table.rows.is_empty() {
        anyhow::bail!("Feature table is empty, nothing to train on");
    }

    let x: Vec<Vec<u32>> = table.rows.iter().map(|r| r.counts.clone()).collect();
    let y: Vec<bool> = table.rows.iter().map(|r| r.outcome).collect();

    let (train, test) = train_test_split(x.len(), TEST_FRACTION, config.seed);
    if train.len() < CV_FOLDS {
        anyhow::bail!(
            "Only {} training rows, need at least {} for {}-fold cross-validation",
            train.len(),
            CV_FOLDS,
            CV_FOLDS
        );
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .context("Failed to build worker pool")?;

    pool.install(|| {
        let mut best: Option<(ForestParams, f64)> = None;
        for params in parameter_grid() {
            let score = cross_val_accuracy(&x, &y, &train, &params, config.seed)?;
            info!(
                action = "evaluate",
                component = "grid_search",
                n_estimators = params.n_estimators,
                max_depth = params.max_depth,
                min_samples_leaf = params.min_samples_leaf,
                cv_accuracy = score,
                "Evaluated parameter set"
            );
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((params, score));
            }
        }
        let Some((best_params, best_cv_score)) = best else {
            anyhow::bail!("Parameter grid is empty");
        };

        let forest = RandomForest::fit(&x, &y, &train, &best_params, config.seed)?;
        let actual: Vec<bool> = test.iter().map(|&r| y[r]).collect();
        let predicted: Vec<bool> = test.iter().map(|&r| forest.predict(&x[r])).collect();
        let report = classification_report(&actual, &predicted);

        let mut ranking: Vec<FeatureImportance> = table
            .feature_names
            .iter()
            .zip(forest.feature_importances())
            .map(|(feature, importance)| FeatureImportance {
                feature: feature.clone(),
                importance,
            })
            .collect();
        // stable: equal importances keep feature column order
        ranking.sort_by(|a, b| b.importance.total_cmp(&a.importance));

        if ranking.iter().all(|f| f.importance == 0.0) {
            warn!(
                action = "complete",
                component = "model_ranking",
                "No tree made a split, all importances are zero"
            );
        }

        info!(
            action = "complete",
            component = "model_ranking",
            best_n_estimators = best_params.n_estimators,
            best_max_depth = best_params.max_depth,
            best_min_samples_leaf = best_params.min_samples_leaf,
            best_cv_accuracy = best_cv_score,
            precision = report.precision,
            recall = report.recall,
            f1 = report.f1,
            duration_ms = start_time.elapsed().as_millis(),
            "Feature ranking completed"
        );

        Ok(SelectionResult {
            best_params,
            best_cv_score,
            report,
            ranking,
        })
    })
}

pub fn write_importance(file_path: &Path, ranking: &[FeatureImportance]) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_path(file_path)
        .with_context(|| format!("Failed to create {:?}", file_path))?;
    writer.write_record(["feature", "importance"])?;
    for entry in ranking {
        writer.serialize(entry)?;
    }
    writer.flush()?;
    info!(action = "write", component = "importance_table", file_path = ?file_path, row_count = ranking.len(), "Wrote feature importance");
    Ok(())
}

/// Read an importance file; every name must be a vocabulary feature.
pub fn read_importance(
    file_path: &Path,
    vocabulary: &TagVocabulary,
) -> Result<Vec<FeatureImportance>> {
    if !file_path.exists() {
        anyhow::bail!("Feature importance file not found: {:?}", file_path);
    }
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(file_path)
        .with_context(|| format!("Failed to open {:?}", file_path))?;

    let mut ranking = Vec::new();
    for (index, row) in reader.deserialize::<FeatureImportance>().enumerate() {
        let row = row.with_context(|| format!("Invalid importance row {}", index + 1))?;
        if !vocabulary.is_feature(&row.feature) {
            anyhow::bail!(
                "Importance row {} names '{}', which is not a feature tag",
                index + 1,
                row.feature
            );
        }
        ranking.push(row);
    }
    info!(action = "loaded", component = "importance_table", file_path = ?file_path, row_count = ranking.len(), "Read feature importance");
    Ok(ranking)
}
