//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use larder_core::bundle::HeuristicBundleDetector;
use larder_core::enrichment::OpenRouterClient;
use larder_core::rules::RuleBasedValidator;
use larder_core::{
    Collaborators, ProgressReporter, RunMode, RunSummary, StageController, StageReport, Stores,
    stage_status,
};
use larder_crawler::{CATEGORY_AXES, HttpAssetStore, HttpSource};
use larder_shared::{
    AppConfig, BundleDetector, FailureLedger, NameValidator, PipelineConfig, RecordStore,
    RevalidatorKind, Stage, ValidatorKind, init_config, load_config, load_config_from,
    validate_api_key,
};
use larder_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// larder: resumable recipe harvesting.
#[derive(Parser)]
#[command(
    name = "larder",
    version,
    about = "Harvest, enrich and validate recipes into a JSONL dataset, resumably.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.larder/larder.toml).
    #[arg(long, global = true, env = "LARDER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Start a fresh run, discarding checkpoints from `--from` onward.
    Run {
        /// First stage to run (fetch, enrich, validate, revalidate, asset_fetch, filter).
        #[arg(long, default_value = "fetch")]
        from: Stage,
    },

    /// Continue from the last checkpoints.
    Resume,

    /// Re-attempt the failed items of one stage, then continue downstream.
    RetryFailed {
        /// Stage whose failed items are retried.
        #[arg(long)]
        stage: Stage,
    },

    /// Show per-stage progress, the failure ledger and recent runs.
    Status {
        /// Print every ledger entry instead of a per-reason count.
        #[arg(long)]
        failures: bool,
    },

    /// List the category values the source offers, per axis.
    Categories,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "larder=info",
        1 => "larder=debug",
        _ => "larder=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command and return the process exit code.
pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run { from } => cmd_run(config_path, RunMode::Fresh, from).await,
        Command::Resume => cmd_run(config_path, RunMode::Resume, Stage::Fetch).await,
        Command::RetryFailed { stage } => {
            cmd_run(config_path, RunMode::RetryFailed(stage), stage).await
        }
        Command::Status { failures } => cmd_status(config_path, failures).await,
        Command::Categories => cmd_categories(config_path).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn load_app_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

// ---------------------------------------------------------------------------
// run / resume / retry-failed
// ---------------------------------------------------------------------------

/// Exit code for a run stopped by a signal before it finished.
const EXIT_INTERRUPTED: u8 = 130;

async fn cmd_run(config_path: Option<&Path>, mode: RunMode, from: Stage) -> Result<ExitCode> {
    let app = load_app_config(config_path)?;
    let pipeline = PipelineConfig::from_app(&app)?;

    let storage = Arc::new(
        Storage::open(&pipeline.database_path())
            .await
            .wrap_err("failed to open pipeline database")?,
    );
    let (collab, llm) = build_collaborators(&app, &pipeline, storage.clone())?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let controller =
        StageController::new(pipeline.clone(), collab, Stores::shared(storage.clone()))
            .with_progress(Arc::new(CliProgress::new()))
            .with_cancellation(cancel);

    info!(
        mode = mode.as_str(),
        from = %from,
        data_dir = %pipeline.data_dir.display(),
        model = llm.model(),
        "starting run"
    );
    let run_id = storage.start_run(mode.as_str()).await?;

    let summary = match controller.run(mode, from).await {
        Ok(summary) => summary,
        Err(e) => {
            let record = serde_json::json!({ "error": e.to_string() }).to_string();
            if let Err(history) = storage.finish_run(&run_id, &record).await {
                warn!(error = %history, "failed to record run history");
            }
            return Err(e).wrap_err("pipeline run aborted");
        }
    };
    storage
        .finish_run(&run_id, &serde_json::to_string(&summary)?)
        .await?;

    let (hits, misses) = llm.cache_stats();
    print_summary(&summary, &pipeline);
    println!("  Cache:    {hits} hits, {misses} calls");
    println!();

    if summary.interrupted {
        println!("  Interrupted. Run `larder resume` to continue.");
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    if summary.has_unresolved_failures() {
        println!(
            "  {} unresolved failures. See `larder status --failures`.",
            summary.ledger_entries
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Wire the HTTP source, asset store and transform-service strategies.
fn build_collaborators(
    app: &AppConfig,
    pipeline: &PipelineConfig,
    storage: Arc<Storage>,
) -> Result<(Collaborators, Arc<OpenRouterClient>)> {
    let api_key = validate_api_key(app)?;
    let llm = Arc::new(OpenRouterClient::new(&app.openrouter, api_key)?.with_cache(storage));

    let validator: Arc<dyn NameValidator> = match app.strategy.validator {
        ValidatorKind::Llm => llm.clone(),
        ValidatorKind::Rules => Arc::new(RuleBasedValidator),
    };
    let bundles: Arc<dyn BundleDetector> = match app.strategy.revalidator {
        RevalidatorKind::Llm => llm.clone(),
        RevalidatorKind::Heuristic => Arc::new(HeuristicBundleDetector),
    };

    let collab = Collaborators {
        source: Arc::new(HttpSource::new(&app.source)?),
        transform: llm.clone(),
        validator,
        bundles,
        assets: Arc::new(HttpAssetStore::new(
            pipeline.assets_dir(),
            Duration::from_secs(app.source.timeout_secs),
        )?),
    };
    Ok((collab, llm))
}

/// Cancel `token` on Ctrl-C or SIGTERM. Work in flight finishes; the current
/// batch is committed before the run stops.
async fn shutdown_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    warn!("shutdown requested, finishing current batch");
    token.cancel();
}

fn print_summary(summary: &RunSummary, pipeline: &PipelineConfig) {
    println!();
    println!("  Run ({})", summary.mode);
    print_stage_table(&summary.stages);
    if let Some(size) = summary.dataset_size {
        println!();
        println!("  Dataset:  {size} records");
        println!("  Path:     {}", pipeline.dataset_path().display());
    }
    println!("  Ledger:   {} unresolved", summary.ledger_entries);
}

fn print_stage_table(reports: &[StageReport]) {
    println!(
        "  {:<12} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "stage", "done", "failed", "deleted", "pending", "cursor"
    );
    for r in reports {
        let cursor = r.cursor.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "  {:<12} {:>8} {:>8} {:>8} {:>8} {:>8}{}",
            r.stage.as_str(),
            r.done,
            r.failed,
            r.deleted,
            r.pending,
            cursor,
            if r.interrupted { "  (interrupted)" } else { "" }
        );
        for (reason, count) in &r.exclusions {
            println!("  {:<12} excluded {reason}: {count}", "");
        }
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using one indicatif bar per stage.
struct CliProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliProgress {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn bar(&self) -> std::sync::MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, stage: Stage, total: usize) {
        let bar = if total == 0 {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::with_template("{spinner:.cyan} {prefix:<12} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
            spinner.enable_steady_tick(Duration::from_millis(80));
            spinner
        } else {
            let bar = ProgressBar::new(total as u64);
            bar.set_style(
                ProgressStyle::with_template(
                    "{prefix:<12} [{bar:30.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
            );
            bar
        };
        bar.set_prefix(stage.as_str());
        if let Some(old) = self.bar().replace(bar) {
            old.finish_and_clear();
        }
    }

    fn batch_committed(&self, _stage: Stage, processed: usize, total: usize) {
        if let Some(bar) = self.bar().as_ref() {
            if total == 0 {
                bar.set_message(format!("{processed} items"));
            } else {
                bar.set_position(processed as u64);
            }
        }
    }

    fn stage_finished(&self, _report: &StageReport) {
        if let Some(bar) = self.bar().take() {
            bar.finish_and_clear();
        }
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

async fn cmd_status(config_path: Option<&Path>, show_failures: bool) -> Result<ExitCode> {
    let app = load_app_config(config_path)?;
    let pipeline = PipelineConfig::from_app(&app)?;
    let db_path = pipeline.database_path();
    if !db_path.exists() {
        println!("No pipeline state at {}", db_path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let storage = Storage::open_readonly(&db_path).await?;
    let reports = stage_status(&storage).await?;
    let ledger = storage.entries(None).await?;
    let raw = storage.raw_ids().await?.len();
    let enriched = storage.enriched_ids().await?.len();

    println!();
    println!("  Data dir: {}", pipeline.data_dir.display());
    print_stage_table(&reports);
    println!();
    println!("  Records:  {raw} raw, {enriched} enriched");
    println!("  Ledger:   {} unresolved", ledger.len());

    if show_failures {
        for entry in &ledger {
            println!(
                "    {:<12} {:<12} {:<18} x{} {}",
                entry.stage.as_str(),
                entry.id,
                entry.reason.as_str(),
                entry.retry_count,
                entry.detail
            );
        }
    } else {
        let mut by_reason = std::collections::BTreeMap::new();
        for entry in &ledger {
            *by_reason
                .entry((entry.stage, entry.reason))
                .or_insert(0usize) += 1;
        }
        for ((stage, reason), count) in by_reason {
            println!("    {:<12} {:<18} {count}", stage.as_str(), reason.as_str());
        }
    }

    let runs = storage.recent_runs(5).await?;
    if !runs.is_empty() {
        println!();
        println!("  Recent runs");
        for run in runs {
            let finished = run
                .finished_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "unfinished".into());
            println!(
                "    {}  {:<12} {}",
                run.started_at.format("%Y-%m-%d %H:%M:%S"),
                run.mode,
                finished
            );
        }
    }
    println!();
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// categories
// ---------------------------------------------------------------------------

async fn cmd_categories(config_path: Option<&Path>) -> Result<ExitCode> {
    let app = load_app_config(config_path)?;
    let source = HttpSource::new(&app.source)?;
    let catalog = source
        .fetch_categories()
        .await
        .wrap_err("failed to fetch the category list")?;

    for (_, axis) in CATEGORY_AXES {
        let entries = catalog.get(axis).map(Vec::as_slice).unwrap_or_default();
        println!("{axis} ({})", entries.len());
        for entry in entries {
            println!("  {:<6} {}", entry.code, entry.name);
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init(config_path: Option<&Path>) -> Result<ExitCode> {
    let path = match config_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .wrap_err_with(|| format!("cannot create {}", parent.display()))?;
            }
            let content = toml::to_string_pretty(&AppConfig::default())?;
            std::fs::write(path, content)
                .wrap_err_with(|| format!("cannot write {}", path.display()))?;
            path.to_path_buf()
        }
        None => init_config()?,
    };
    println!("Config initialized at: {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<ExitCode> {
    let config = load_app_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(ExitCode::SUCCESS)
}
