use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::labeler::DEFAULT_SITE_ROOT;
use crate::rates::DEFAULT_MAX_COUNT;
use crate::selection::DEFAULT_SEED;

#[derive(Parser, Debug)]
#[command(
    name = "clickpath",
    about = "Turn clickstream logs into daily user paths and find which page visits predict conversion",
    version,
    long_about = None
)]
pub struct Args {
    /// Path to a tag vocabulary file
    #[arg(long, global = true)]
    pub vocabulary: Option<PathBuf>,

    /// Site root URL; visits to exactly this URL are ignored
    #[arg(long, global = true, default_value = DEFAULT_SITE_ROOT)]
    pub site_root: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Number of worker threads for model training
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    /// Random seed for the train/test split and the forest
    #[arg(long, global = true, default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Label raw events and build per-user daily paths
    Paths {
        /// Raw (UserID, Timestamp, URL) CSV
        #[arg(long)]
        input: PathBuf,

        /// Paths CSV to write
        #[arg(long)]
        output: PathBuf,

        /// Skip a header row in the raw input
        #[arg(long)]
        has_headers: bool,
    },

    /// Build the feature table and rank features with a random forest
    Select {
        /// Paths CSV produced by `paths`
        #[arg(long)]
        paths: PathBuf,

        /// Feature table CSV to write
        #[arg(long)]
        features_out: PathBuf,

        /// Feature importance CSV to write
        #[arg(long)]
        importance_out: PathBuf,

        /// Number of top features to keep
        #[arg(long, default_value_t = 5)]
        top: usize,
    },

    /// Compute conversion rate by click count and draw the chart
    Analyze {
        /// Paths CSV produced by `paths`
        #[arg(long)]
        paths: PathBuf,

        /// Feature table CSV produced by `select`
        #[arg(long)]
        features: PathBuf,

        /// Feature importance CSV produced by `select`
        #[arg(long)]
        importance: PathBuf,

        /// Rate table CSV to write
        #[arg(long)]
        rates_out: PathBuf,

        /// HTML chart to write
        #[arg(long)]
        chart_out: PathBuf,

        /// Highest click count to report
        #[arg(long, default_value_t = DEFAULT_MAX_COUNT)]
        max_count: u32,
    },

    /// Run every stage on <data-dir>/<data>.csv
    Run {
        /// Dataset name, without the .csv extension
        #[arg(long)]
        data: String,

        /// Directory holding the raw dataset
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        /// Directory for every generated artifact
        #[arg(long, default_value = "outputs")]
        output_dir: PathBuf,

        /// Number of top features to keep
        #[arg(long, default_value_t = 5)]
        top: usize,

        /// Highest click count to report
        #[arg(long, default_value_t = DEFAULT_MAX_COUNT)]
        max_count: u32,

        /// Skip a header row in the raw input
        #[arg(long)]
        has_headers: bool,
    },

    /// Write the default tag vocabulary to tag_vocabulary.txt
    Init,
}
