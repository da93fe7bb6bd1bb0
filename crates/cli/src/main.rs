use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use collector::{Collector, CollectorOptions, DateWindow, SearchClient};
use narrative_core::analysis::{build_analysis_records, decline_share_by_party, normalize_handle};
use narrative_core::classify::{propagate_labels, run_bench, FittedPipeline};
use narrative_core::clean::clean_posts;
use narrative_core::config::StudyConfig;
use narrative_core::stats::{run_cascade, run_robustness, ModelOutcome, RobustnessReport};
use narrative_core::topic::TopicFilter;
use narrative_core::{db, io, CancelFlag};
use schemars::schema_for;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "narrative")]
#[command(about = "Narrative framing pipeline: collect, clean, classify, model", long_about = None)]
struct Cli {
    /// Directory holding study.toml and the optional YAML lists
    #[arg(long, global = true, default_value = "config")]
    config_dir: PathBuf,

    /// Directory for stage inputs and outputs
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Retrieve posts for every handle in politicians.csv into raw.sqlite
    Collect,
    /// Export raw.sqlite to raw_posts.csv
    ExportRaw,
    /// Drop replies and reposts, flatten timestamps and counters
    Clean,
    /// Keep posts mentioning the topic stem
    Filter,
    /// Compare classifiers on annotations.csv and save the best pipeline
    Bench {
        /// Markdown report directory
        #[arg(long, default_value = "report")]
        report_dir: PathBuf,
    },
    /// Label every topic post with the saved pipeline
    Label,
    /// Build analysis records, fit the cascade, run robustness checks
    Analyze {
        /// Markdown report directory
        #[arg(long, default_value = "report")]
        report_dir: PathBuf,
    },
    /// Export JSON Schemas for the pipeline's record types
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },
}

#[derive(Subcommand)]
enum SchemaCommands {
    /// Export JSON Schema files for record types
    Export {
        /// Output directory (default: ./schemas)
        #[arg(long, default_value = "schemas")]
        out_dir: PathBuf,
    },
}

/// Everything `analyze` produces besides the markdown report.
#[derive(Serialize)]
struct FitsFile<'a> {
    observations: usize,
    legislators: usize,
    models: &'a [ModelOutcome],
    robustness: &'a RobustnessReport,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("narrative=info".parse()?)
                .add_directive("narrative_core=info".parse()?)
                .add_directive("collector=info".parse()?)
                .add_directive("report=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; stopping after the current step");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Schema { command } => match command {
            SchemaCommands::Export { out_dir } => schema_export(out_dir),
        },
        command => {
            let config = StudyConfig::load_from_dir(&cli.config_dir)?;
            fs::create_dir_all(&cli.data_dir)?;
            let data = cli.data_dir.as_path();
            match command {
                Commands::Collect => runtime.block_on(collect(&config, data, &cancel)),
                Commands::ExportRaw => export_raw(data),
                Commands::Clean => clean(data),
                Commands::Filter => filter(&config, data),
                Commands::Bench { report_dir } => bench(&config, data, &report_dir),
                Commands::Label => label(data),
                Commands::Analyze { report_dir } => analyze(&config, data, &report_dir, &cancel),
                Commands::Schema { .. } => Ok(()),
            }
        }
    }
}

fn raw_store(data: &Path) -> Result<rusqlite::Connection> {
    let path = data.join("raw.sqlite");
    let path = path
        .to_str()
        .ok_or_else(|| anyhow!("Non UTF-8 path: {}", path.display()))?;
    Ok(db::open(path)?)
}

async fn collect(config: &StudyConfig, data: &Path, cancel: &CancelFlag) -> Result<()> {
    let politicians = io::read_politicians(&data.join("politicians.csv"))?;
    let mut seen = HashSet::new();
    let handles: Vec<String> = politicians
        .iter()
        .map(|p| normalize_handle(&p.handle))
        .filter(|h| seen.insert(h.clone()))
        .collect();

    let collection = &config.collection;
    let client = SearchClient::from_env(&collection.bearer_env, collection.base_url.clone())?;
    let options = CollectorOptions {
        window: DateWindow {
            start: collection.start_date,
            end: collection.end_date,
        },
        page_size: collection.page_size,
        max_posts: collection.max_posts,
        page_delay: Duration::from_millis(collection.page_delay_ms),
    };

    let conn = raw_store(data)?;
    let report = Collector::new(client, options)
        .collect(&handles, &conn, cancel)
        .await?;

    println!(
        "Collected {} posts from {} handles ({} skipped, {} failed)",
        report.posts(),
        report.handles.len(),
        report.skipped.len(),
        report.failures.len()
    );
    for failure in &report.failures {
        println!("  failed {}: {}", failure.handle, failure.error);
    }
    if report.cap_reached {
        println!("Stopped at the post cap.");
    }
    if report.cancelled {
        println!("Cancelled; rerun to resume.");
    }
    Ok(())
}

fn export_raw(data: &Path) -> Result<()> {
    let conn = raw_store(data)?;
    let posts = db::load_posts(&conn)?;
    let out = data.join("raw_posts.csv");
    io::write_raw_posts(&out, &posts)?;
    println!("Exported {} raw posts to {}", posts.len(), out.display());
    Ok(())
}

fn clean(data: &Path) -> Result<()> {
    let conn = raw_store(data)?;
    let (posts, summary) = clean_posts(db::load_posts(&conn)?)?;
    let out = data.join("clean_posts.csv");
    io::write_csv(&out, &posts)?;
    println!(
        "Kept {} of {} posts ({} replies, {} reposts dropped) -> {}",
        summary.output,
        summary.input,
        summary.replies_dropped,
        summary.reposts_dropped,
        out.display()
    );
    Ok(())
}

fn filter(config: &StudyConfig, data: &Path) -> Result<()> {
    let posts = io::read_clean_posts(&data.join("clean_posts.csv"))?;
    let total = posts.len();
    let kept = TopicFilter::from_config(&config.topic)?.apply(posts);
    let out = data.join("topic_posts.csv");
    io::write_csv(&out, &kept)?;
    println!("{} of {} posts mention '{}' -> {}", kept.len(), total, config.topic.stem, out.display());
    Ok(())
}

fn bench(config: &StudyConfig, data: &Path, report_dir: &Path) -> Result<()> {
    let examples = io::read_annotations(&data.join("annotations.csv"))?;
    let results = run_bench(&examples, &config.classifiers, &config.classification)?;
    let best = results.require_best()?;

    println!("{:<28} {:>8} {:>8} {:>9} {:>8}", "classifier", "accuracy", "recall", "precision", "f1");
    for model in &results.ranked {
        let m = &model.metrics;
        println!(
            "{:<28} {:>8.3} {:>8.3} {:>9.3} {:>8.3}",
            model.name, m.accuracy, m.recall, m.precision, m.f1
        );
    }
    for failed in &results.failed {
        println!("{:<28} failed: {}", failed.name, failed.error);
    }

    let out = data.join("best_pipeline.json");
    best.pipeline.save(&out)?;
    report::write_bench_report(report_dir, &results)?;
    println!("Best: {} ({}) -> {}", best.name, best.params, out.display());
    Ok(())
}

fn label(data: &Path) -> Result<()> {
    let pipeline = FittedPipeline::load(&data.join("best_pipeline.json"))
        .context("Run `narrative bench` first")?;
    let posts = io::read_clean_posts(&data.join("topic_posts.csv"))?;
    let annotations = io::read_annotations(&data.join("annotations.csv"))?;
    let labeled = propagate_labels(&pipeline, &posts, &annotations)?;
    let out = data.join("labeled_posts.csv");
    io::write_csv(&out, &labeled)?;
    println!("Labeled {} posts with {} -> {}", labeled.len(), pipeline.name, out.display());
    Ok(())
}

fn analyze(config: &StudyConfig, data: &Path, report_dir: &Path, cancel: &CancelFlag) -> Result<()> {
    let posts = io::read_labeled_posts(&data.join("labeled_posts.csv"))?;
    let politicians = io::read_politicians(&data.join("politicians.csv"))?;
    let set = build_analysis_records(&posts, &politicians, &config.calendar, &config.trigger_states)?;
    io::write_analysis_records(&data.join("analysis_records.csv"), &set.records)?;
    for (party, (n, share)) in decline_share_by_party(&set.records) {
        println!("{party:?}: {n} posts, {:.1}% decline", share * 100.0);
    }

    let cascade = run_cascade(&set.records, &config.cascade, config.modeling.significance)?;
    let robustness = run_robustness(&cascade, &set.records, &config.modeling, cancel);
    let models = cascade.outcomes();

    let fits = FitsFile {
        observations: cascade.observations,
        legislators: set.legislator_count(),
        models: &models,
        robustness: &robustness,
    };
    let out = data.join("fits.json");
    fs::write(&out, serde_json::to_string_pretty(&fits)?)?;
    report::write_analysis_report(report_dir, &models, &robustness)?;

    for outcome in &models {
        match outcome {
            ModelOutcome::Fitted(fit) => println!("{:<40} AIC {:>10.2}", fit.name, fit.aic),
            ModelOutcome::Failed { name, failure, .. } => println!("{name:<40} failed: {}", failure.message),
        }
    }
    if robustness.bootstrap.as_ref().is_some_and(|b| b.cancelled) {
        println!("Bootstrap cancelled; results are partial.");
    }
    println!("Wrote {} and report to {}", out.display(), report_dir.display());
    Ok(())
}

fn schema_export(out_dir: PathBuf) -> Result<()> {
    fs::create_dir_all(&out_dir)?;

    write_schema(&out_dir, "RawPost", &schema_for!(narrative_core::schema::RawPost))?;
    write_schema(&out_dir, "CleanPost", &schema_for!(narrative_core::schema::CleanPost))?;
    write_schema(&out_dir, "Politician", &schema_for!(narrative_core::schema::Politician))?;
    write_schema(&out_dir, "LabeledExample", &schema_for!(narrative_core::schema::LabeledExample))?;
    write_schema(&out_dir, "LabeledPost", &schema_for!(narrative_core::schema::LabeledPost))?;
    write_schema(&out_dir, "AnalysisRecord", &schema_for!(narrative_core::schema::AnalysisRecord))?;
    write_schema(&out_dir, "ModelSpec", &schema_for!(narrative_core::stats::ModelSpec))?;
    write_schema(&out_dir, "ModelOutcome", &schema_for!(narrative_core::stats::ModelOutcome))?;
    write_schema(&out_dir, "RobustnessReport", &schema_for!(narrative_core::stats::RobustnessReport))?;

    println!("Exported schemas to {}", out_dir.display());
    Ok(())
}

fn write_schema(out_dir: &Path, name: &str, schema: &schemars::schema::RootSchema) -> Result<()> {
    let json = serde_json::to_string_pretty(schema)?;
    fs::write(out_dir.join(format!("{name}.schema.json")), json)?;
    Ok(())
}
