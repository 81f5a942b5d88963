use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use crate::args::{Args, Command};
use crate::stats::{
    AnalysisSummary, PathsSummary, RunArtifacts, RunSummary, SelectionSummary,
};
use crate::utils::{format_number, resolve_workers};
use crate::vocabulary::{load_vocabulary, TagVocabulary};
use crate::{chart, events, features, paths, rates, selection};

/// Everything the stages share for one invocation.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub vocabulary: TagVocabulary,
    pub site_root: String,
    pub workers: usize,
    pub seed: u64,
}

impl PipelineContext {
    pub fn from_args(args: &Args) -> Result<Self> {
        Ok(Self {
            vocabulary: load_vocabulary(args.vocabulary.as_deref())?,
            site_root: args.site_root.clone(),
            workers: resolve_workers(args.workers),
            seed: args.seed,
        })
    }
}

impl RunArtifacts {
    pub fn for_dataset(output_dir: &Path, data_name: &str, top: usize) -> Self {
        Self {
            paths: output_dir.join(format!("{}_paths.csv", data_name)),
            conversion: output_dir.join(format!("{}_conversion.csv", data_name)),
            importance: output_dir.join(format!("{}_top{}_features.csv", data_name, top)),
            rates: output_dir.join(format!("{}_rates.csv", data_name)),
            chart: output_dir.join(format!("{}_conversion_rate.html", data_name)),
        }
    }
}

/// Raw events to the paths table.
pub fn build_paths_stage(
    ctx: &PipelineContext,
    input: &Path,
    output: &Path,
    has_headers: bool,
) -> Result<PathsSummary> {
    let start_time = Instant::now();
    info!(action = "start", component = "paths_stage", input = ?input, output = ?output, "Starting path construction");

    let raw = events::read_events(input, has_headers)?;
    let (labeled, labeling) = events::label_events(&raw, &ctx.vocabulary, &ctx.site_root);
    let built = paths::build_paths(&labeled);
    paths::write_paths(output, &built)?;

    info!(
        action = "complete",
        component = "paths_stage",
        duration_ms = start_time.elapsed().as_millis(),
        "Path construction completed"
    );
    Ok(PathsSummary {
        event_count: raw.len(),
        root_excluded: labeling.root_excluded,
        unmatched: labeling.unmatched,
        labeled: labeled.len(),
        path_count: built.len(),
    })
}

/// Paths table to the feature table and the top-k importance table.
pub fn select_stage(
    ctx: &PipelineContext,
    paths_file: &Path,
    features_out: &Path,
    importance_out: &Path,
    top: usize,
) -> Result<SelectionSummary> {
    let start_time = Instant::now();
    info!(action = "start", component = "select_stage", input = ?paths_file, "Starting feature selection");

    let path_rows = paths::read_paths(paths_file)?;
    let table = features::build_feature_table(&path_rows, &ctx.vocabulary);
    features::write_feature_table(features_out, &table)?;

    let config = selection::SelectionConfig {
        seed: ctx.seed,
        workers: ctx.workers,
    };
    let result = selection::rank_features(&table, &config)?;
    let top_features = result.top(top).to_vec();
    selection::write_importance(importance_out, &top_features)?;

    info!(
        action = "complete",
        component = "select_stage",
        duration_ms = start_time.elapsed().as_millis(),
        "Feature selection completed"
    );
    Ok(SelectionSummary {
        row_count: table.rows.len(),
        positive_count: table.positive_count(),
        result,
        top: top_features,
    })
}

/// Paths, outcomes and importance to the rate table and chart.
pub fn analyze_stage(
    ctx: &PipelineContext,
    paths_file: &Path,
    features_file: &Path,
    importance_file: &Path,
    rates_out: &Path,
    chart_out: &Path,
    max_count: u32,
) -> Result<AnalysisSummary> {
    let start_time = Instant::now();
    info!(action = "start", component = "analyze_stage", "Starting conversion analysis");

    let path_rows = paths::read_paths(paths_file)?;
    let table = features::read_feature_table(features_file, &ctx.vocabulary)?;
    let ranking = selection::read_importance(importance_file, &ctx.vocabulary)?;
    let selected: Vec<String> = ranking.into_iter().map(|f| f.feature).collect();
    if selected.is_empty() {
        anyhow::bail!("Importance file {:?} lists no features to analyze", importance_file);
    }

    let joined = rates::join_outcomes(&path_rows, &table.rows)?;
    let samples = rates::aggregate_rates(&joined, &selected, max_count);
    rates::write_rates(rates_out, &samples)?;
    chart::write_chart(chart_out, &samples, &selected)?;

    info!(
        action = "complete",
        component = "analyze_stage",
        duration_ms = start_time.elapsed().as_millis(),
        "Conversion analysis completed"
    );
    Ok(AnalysisSummary {
        features: selected,
        samples,
    })
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub data_name: String,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub top: usize,
    pub max_count: u32,
    pub has_headers: bool,
}

/// Every stage in order, each reading what the previous one wrote.
pub fn run_pipeline(ctx: &PipelineContext, options: &RunOptions) -> Result<RunSummary> {
    let total_start_time = Instant::now();
    info!(action = "start", component = "pipeline", data = %options.data_name, "Starting pipeline run");

    let input = options.data_dir.join(format!("{}.csv", options.data_name));
    if !input.exists() {
        anyhow::bail!("Input file not found: {:?}", input);
    }
    fs::create_dir_all(&options.output_dir)
        .with_context(|| format!("Failed to create {:?}", options.output_dir))?;
    let artifacts = RunArtifacts::for_dataset(&options.output_dir, &options.data_name, options.top);

    let paths_summary = build_paths_stage(ctx, &input, &artifacts.paths, options.has_headers)?;
    let selection_summary = select_stage(
        ctx,
        &artifacts.paths,
        &artifacts.conversion,
        &artifacts.importance,
        options.top,
    )?;
    let analysis_summary = analyze_stage(
        ctx,
        &artifacts.paths,
        &artifacts.conversion,
        &artifacts.importance,
        &artifacts.rates,
        &artifacts.chart,
        options.max_count,
    )?;

    info!(
        action = "complete",
        component = "pipeline",
        duration_ms = total_start_time.elapsed().as_millis(),
        "Pipeline run completed"
    );
    Ok(RunSummary {
        data_name: options.data_name.clone(),
        paths: paths_summary,
        selection: selection_summary,
        analysis: analysis_summary,
        artifacts,
    })
}

/// Dispatch a parsed command line (other than `init`).
pub fn execute(args: &Args) -> Result<()> {
    let ctx = PipelineContext::from_args(args)?;

    match &args.command {
        Command::Paths {
            input,
            output,
            has_headers,
        } => {
            let summary = build_paths_stage(&ctx, input, output, *has_headers)?;
            print_paths_summary(&summary);
            println!("\nWrote {}", output.display());
        }
        Command::Select {
            paths,
            features_out,
            importance_out,
            top,
        } => {
            let summary = select_stage(&ctx, paths, features_out, importance_out, *top)?;
            print_selection_summary(&summary);
            println!("\nWrote {} and {}", features_out.display(), importance_out.display());
        }
        Command::Analyze {
            paths,
            features,
            importance,
            rates_out,
            chart_out,
            max_count,
        } => {
            let summary = analyze_stage(
                &ctx, paths, features, importance, rates_out, chart_out, *max_count,
            )?;
            print_analysis_summary(&summary);
            println!("\nWrote {} and {}", rates_out.display(), chart_out.display());
        }
        Command::Run {
            data,
            data_dir,
            output_dir,
            top,
            max_count,
            has_headers,
        } => {
            let options = RunOptions {
                data_name: data.clone(),
                data_dir: data_dir.clone(),
                output_dir: output_dir.clone(),
                top: *top,
                max_count: *max_count,
                has_headers: *has_headers,
            };
            let summary = run_pipeline(&ctx, &options)?;
            print_run_summary(&summary);
        }
        Command::Init => anyhow::bail!("init is handled before the pipeline starts"),
    }
    Ok(())
}

pub fn print_paths_summary(summary: &PathsSummary) {
    println!("\n--- Paths ---");
    println!("Events read: {}", format_number(summary.event_count));
    println!("Site root visits dropped: {}", format_number(summary.root_excluded));
    println!("Unlabeled visits dropped: {}", format_number(summary.unmatched));
    println!("Labeled visits: {}", format_number(summary.labeled));
    println!("Paths built: {}", format_number(summary.path_count));
}

pub fn print_selection_summary(summary: &SelectionSummary) {
    let result = &summary.result;
    println!("\n--- Feature selection ---");
    println!(
        "Paths: {} ({} converted)",
        format_number(summary.row_count),
        format_number(summary.positive_count)
    );
    println!(
        "Best parameters: n_estimators={}, max_depth={}, min_samples_leaf={}",
        result.best_params.n_estimators,
        result.best_params.max_depth,
        result.best_params.min_samples_leaf
    );
    println!("Best cross-validation accuracy: {:.4}", result.best_cv_score);
    println!("Precision: {:.4}", result.report.precision);
    println!("Recall:    {:.4}", result.report.recall);
    println!("F1-score:  {:.4}", result.report.f1);

    println!("\nTop {} most important features:", summary.top.len());
    for entry in &summary.top {
        println!("- {}: {:.4}", entry.feature, entry.importance);
    }
}

pub fn print_analysis_summary(summary: &AnalysisSummary) {
    println!("\n--- Conversion rate by click count ---");
    for feature in &summary.features {
        let cells: Vec<String> = summary
            .samples
            .iter()
            .filter(|s| &s.feature == feature)
            .map(|s| {
                format!(
                    "{}: {} (n={})",
                    s.count,
                    chart::point_label(s.conversion_rate),
                    format_number(s.sample_size)
                )
            })
            .collect();
        println!("- {}: {}", feature, cells.join(", "));
    }
}

pub fn print_run_summary(summary: &RunSummary) {
    println!("\n=== {} ===", summary.data_name);
    print_paths_summary(&summary.paths);
    print_selection_summary(&summary.selection);
    print_analysis_summary(&summary.analysis);

    let artifacts = &summary.artifacts;
    println!("\nArtifacts:");
    for path in [
        &artifacts.paths,
        &artifacts.conversion,
        &artifacts.importance,
        &artifacts.rates,
        &artifacts.chart,
    ] {
        println!("- {}", path.display());
    }
}
