use std::path::PathBuf;

use crate::rates::RateSample;
use crate::selection::{FeatureImportance, SelectionResult};

#[derive(Debug)]
pub struct PathsSummary {
    pub event_count: usize,
    pub root_excluded: usize,
    pub unmatched: usize,
    pub labeled: usize,
    pub path_count: usize,
}

#[derive(Debug)]
pub struct SelectionSummary {
    pub row_count: usize,
    pub positive_count: usize,
    pub result: SelectionResult,
    pub top: Vec<FeatureImportance>,
}

#[derive(Debug)]
pub struct AnalysisSummary {
    pub features: Vec<String>,
    pub samples: Vec<RateSample>,
}

/// File names of one `run`, all under the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifacts {
    pub paths: PathBuf,
    pub conversion: PathBuf,
    pub importance: PathBuf,
    pub rates: PathBuf,
    pub chart: PathBuf,
}

#[derive(Debug)]
pub struct RunSummary {
    pub data_name: String,
    pub paths: PathsSummary,
    pub selection: SelectionSummary,
    pub analysis: AnalysisSummary,
    pub artifacts: RunArtifacts,
}
