pub mod args;
pub mod chart;
pub mod events;
pub mod features;
pub mod forest;
pub mod labeler;
pub mod paths;
pub mod pipeline;
pub mod rates;
pub mod selection;
pub mod stats;
pub mod utils;
pub mod vocabulary;

pub use args::{Args, Command};
pub use pipeline::{execute, run_pipeline, PipelineContext, RunOptions};
pub use stats::{AnalysisSummary, PathsSummary, RunSummary, SelectionSummary};
pub use vocabulary::{init_default_vocabulary, TagVocabulary};
