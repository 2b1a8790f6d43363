use anyhow::{bail, Context, Result};
use bulk_loader::config::LoaderConfig;
use bulk_loader::runner::{CsvRowSource, ProcessRunner, RowSource, RunSummary};
use bulk_loader::sink::{CsvResultSink, ResultPaths, ResultSink};
use bulk_loader::system;
use bulk_loader::task::Command;
use bulk_loader::totals::TotalsSnapshot;
use bulk_loader::{EntityRegistry, HttpRestApi, RestApi};
use chrono::Local;
use clap::Parser;
use glob::glob;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::macros::format_description;

#[derive(Parser, Clone)]
#[command(name = "Bulk Loader")]
#[command(about = "Loads, deletes or exports entity records described by CSV files through a REST API.")]
#[command(version = "1.1.0")]
struct Cli {
    #[arg(value_enum, help = "Operation to perform for every row")]
    command: Command,
    #[arg(help = "CSV file (plain or .csv.gz) or a directory of CSV files")]
    input: PathBuf,
    #[arg(short, long, help = "Entity name; inferred from the file name when omitted")]
    entity: Option<String>,
    #[arg(short, long, default_value = "bulk-loader.yaml", help = "Path to the loader configuration YAML file")]
    config: PathBuf,
    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
    #[arg(short, long, help = "Number of worker threads (0 for auto, at most 15)")]
    threads: Option<usize>,
    #[arg(short, long, help = "Directory for the success/failure result files")]
    results_dir: Option<PathBuf>,
}

fn find_csv_files(input: &Path) -> Result<Vec<PathBuf>> {
    if !input.is_dir() {
        return Ok(vec![input.to_path_buf()]);
    }
    let pattern = input.join("*.csv");
    let pattern_str = pattern.to_string_lossy();
    info!("Searching for files matching pattern: {}", pattern_str);
    let mut paths: Vec<PathBuf> = glob(&pattern_str)?.filter_map(Result::ok).collect();
    paths.sort();
    if paths.is_empty() {
        warn!("No files found matching the pattern: {}", pattern_str);
    }
    Ok(paths)
}

fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = elapsed.subsec_millis();
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, millis)
    }
}

fn get_current_timestamp_str() -> String {
    Local::now().format("%Y-%m-%d_%H.%M.%S").to_string()
}

fn process_file(
    cli: &Cli,
    path: &Path,
    config: &Arc<LoaderConfig>,
    registry: &Arc<EntityRegistry>,
    api: &Arc<dyn RestApi>,
    timestamp: &str,
) -> Result<RunSummary> {
    let entity = match &cli.entity {
        Some(entity) => entity.clone(),
        None => registry
            .for_file_name(path)
            .map(|schema| schema.name().to_string())
            .with_context(|| format!("Cannot infer an entity from file name: {}", path.display()))?,
    };
    let source = CsvRowSource::open(path)?;
    let paths = ResultPaths::new(&config.results_dir, path, cli.command.name(), timestamp);
    info!("Results for {} will be written to {}", path.display(), paths.success.display());
    let sink: Arc<dyn ResultSink> = Arc::new(CsvResultSink::new(paths, source.headers().to_vec())?);

    let progress_bar = ProgressBar::new_spinner();
    progress_bar.set_style(
        ProgressStyle::default_spinner()
            .template("[{elapsed_precise}] {spinner:.cyan} {pos} rows ({per_sec}) {msg}")
            .context("Failed to create progress bar template")?,
    );
    progress_bar.enable_steady_tick(Duration::from_millis(200));
    progress_bar.set_message(format!("{} {}", cli.command, entity));

    let runner = ProcessRunner::new(cli.command, Arc::clone(config), Arc::clone(registry), Arc::clone(api))
        .with_progress(progress_bar.clone());
    let result = runner.run(&entity, source, Arc::clone(&sink));
    match &result {
        Ok(summary) => progress_bar.finish_with_message(format!("{} {}: {}", cli.command, summary.entity, summary.totals)),
        Err(_) => {
            progress_bar.abandon_with_message(format!("ERR: {}", path.display()));
            if let Err(e) = sink.finish() {
                error!("Failed to close result files for {}: {}", path.display(), e);
            }
        }
    }
    result
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => { eprintln!("Invalid log level '{}', defaulting to INFO.", cli.log_level); LevelFilter::Info }
    };
    SimpleLogger::new()
        .with_level(log_level)
        .with_timestamp_format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .init()?;

    info!("Starting Bulk Loader ({})", cli.command);
    system::log_memory_usage("initial");

    let mut config = LoaderConfig::load(&cli.config)?;
    if let Some(threads) = cli.threads {
        config.num_threads = threads;
    }
    if let Some(results_dir) = &cli.results_dir {
        config.results_dir = results_dir.clone();
    }
    config.validate()?;
    let config = Arc::new(config);
    let registry = Arc::new(EntityRegistry::from_config(&config)?);
    let api: Arc<dyn RestApi> = Arc::new(HttpRestApi::new(&config.rest)?);

    let timestamp = get_current_timestamp_str();
    info!("Run Timestamp: {}", timestamp);

    if !cli.input.exists() {
        bail!("Input path does not exist: {}", cli.input.display());
    }
    let files = find_csv_files(&cli.input)?;
    if files.is_empty() {
        warn!("No CSV files found. Exiting.");
        return Ok(());
    }
    info!("Total files to process: {}", files.len());

    let mut totals = TotalsSnapshot::default();
    let mut rows_read = 0;
    let mut files_with_errors = Vec::new();
    for path in &files {
        let file_start = Instant::now();
        match process_file(&cli, path, &config, &registry, &api, &timestamp) {
            Ok(summary) => {
                info!(
                    "OK: {} ({} rows, {}; cache hits {}, misses {}, entries {})",
                    path.display(),
                    summary.rows,
                    format_elapsed(file_start.elapsed()),
                    summary.cache.hits,
                    summary.cache.misses,
                    summary.cache.entries
                );
                rows_read += summary.rows;
                totals.merge(&summary.totals);
            }
            Err(e) => {
                error!("Error processing file {}: {:#}", path.display(), e);
                files_with_errors.push(path.clone());
            }
        }
    }

    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    info!("Total input files found: {}", files.len());
    info!("Files processed successfully: {}", files.len() - files_with_errors.len());
    if !files_with_errors.is_empty() {
        warn!("Files with processing errors: {}", files_with_errors.len());
        for err_file in files_with_errors.iter().take(10) {
            warn!("  - {}", err_file.display());
        }
        if files_with_errors.len() > 10 {
            warn!("  ... (and {} more)", files_with_errors.len() - 10);
        }
    }
    info!("Rows read: {}", rows_read);
    info!("Rows succeeded: {} of {}", totals.succeeded(), totals.processed());
    info!("Totals: {}", totals);
    system::log_memory_usage("final");
    info!("Bulk Loader finished.");
    info!("-------------------------------------------------------");

    if !files_with_errors.is_empty() {
        std::process::exit(1);
    }

    Ok(())
}
