//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use changewatch_core::{
    CycleOutcome, CycleReport, ProcessingReport, Scheduler, WorkerReport, WorkerStatus,
};
use changewatch_shared::{AppConfig, init_config_at, load_config, load_config_from};
use changewatch_storage::{MemoryGateway, PersistenceGateway, Storage};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// changewatch: detect new items on listing pages and trigger extraction.
#[derive(Parser)]
#[command(
    name = "changewatch",
    version,
    about = "Poll listing pages for new items and launch an extraction worker when they appear.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.changewatch/changewatch.toml).
    #[arg(long, global = true, env = "CHANGEWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
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
    /// Poll every enabled source until interrupted.
    Run {
        /// Keep state in memory instead of the database.
        #[arg(long)]
        ephemeral: bool,
    },

    /// Run a single detection cycle for one source.
    Once {
        /// Source id from the config file.
        source: String,

        /// Poll even if the source is backing off.
        #[arg(long)]
        force: bool,

        /// Keep state in memory instead of the database.
        #[arg(long)]
        ephemeral: bool,
    },

    /// List configured sources.
    Sources,

    /// Show persisted detection state.
    State {
        /// Only this source; also lists its recent publish times.
        source: Option<String>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,

        /// Number of publish times to show for a single source.
        #[arg(long, default_value = "10")]
        limit: u32,
    },

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
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Show resolved configuration.
    Show,
    /// Validate the config file and every source in it.
    Check,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "changewatch=info",
        1 => "changewatch=debug",
        _ => "changewatch=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run { ephemeral } => cmd_run(config_path, ephemeral).await,
        Command::Once {
            source,
            force,
            ephemeral,
        } => cmd_once(config_path, &source, force, ephemeral).await,
        Command::Sources => cmd_sources(config_path),
        Command::State {
            source,
            json,
            limit,
        } => cmd_state(config_path, source.as_deref(), json, limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init { force } => cmd_config_init(config_path, force),
            ConfigAction::Show => cmd_config_show(config_path),
            ConfigAction::Check => cmd_config_check(config_path),
        },
    }
}

fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let config = match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

async fn open_gateway(config: &AppConfig, ephemeral: bool) -> Result<Arc<dyn PersistenceGateway>> {
    if ephemeral {
        info!("using in-memory state; nothing will be persisted");
        return Ok(Arc::new(MemoryGateway::new()));
    }
    let path = config.database_path()?;
    info!(path = %path.display(), "opening state database");
    Ok(Arc::new(Storage::open(&path).await?))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, ephemeral: bool) -> Result<()> {
    let config = load(config_path)?;
    let gateway = open_gateway(&config, ephemeral).await?;
    let scheduler = Arc::new(Scheduler::from_config(&config, gateway)?);

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current round");
            let _ = tx.send(true);
        }
    });

    Arc::clone(&scheduler).run(rx).await;

    let in_flight = scheduler.trigger().in_flight();
    if !in_flight.is_empty() {
        warn!(sources = ?in_flight, "exiting with workers in flight; they will be killed");
    }
    Ok(())
}

async fn cmd_once(
    config_path: Option<&Path>,
    source_id: &str,
    force: bool,
    ephemeral: bool,
) -> Result<()> {
    let config = load(config_path)?;
    let gateway = open_gateway(&config, ephemeral).await?;
    let scheduler = Scheduler::from_config(&config, gateway)?;

    let source = scheduler
        .source(source_id)
        .ok_or_else(|| eyre!("unknown source '{source_id}'; see `changewatch sources`"))?
        .clone();

    let poll_spinner = new_spinner(format!("Polling {}", source.listing_url));
    let report = scheduler.run_cycle(&source, force).await;
    poll_spinner.finish_and_clear();

    print_cycle(&report);

    if let CycleOutcome::Triggered { run_id, worker, .. } = report.outcome {
        let wait_spinner = new_spinner(format!("Waiting for extraction worker {run_id}"));
        let mut worker_report = worker
            .await
            .map_err(|e| eyre!("worker task failed: {e}"))?;
        wait_spinner.finish_and_clear();

        print_worker(&worker_report);
        if worker_report.status != WorkerStatus::Succeeded {
            return Err(eyre!(
                "extraction worker {}: {}",
                worker_report.status,
                worker_report.error.unwrap_or_default()
            ));
        }

        if let Some(processing) = worker_report.processing.take() {
            let processing_spinner = new_spinner(format!("Waiting for processing of {run_id}"));
            let outcome = processing
                .await
                .map_err(|e| eyre!("processing task failed: {e}"))?;
            processing_spinner.finish_and_clear();

            print_processing(&outcome);
            if let Some(e) = outcome.error {
                return Err(eyre!("processing: {e}"));
            }
        }
    }

    Ok(())
}

fn cmd_sources(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let sources = config.resolve_sources()?;

    if sources.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!();
    for source in &sources {
        let status = if source.enabled { "enabled" } else { "disabled" };
        println!("  {:<20} {:<9} {}", source.source_id, status, source.listing_url);
        println!(
            "  {:<20} {:<9} items: {}",
            "",
            "",
            source.extraction_rule.item_selector
        );
    }
    println!();
    Ok(())
}

async fn cmd_state(
    config_path: Option<&Path>,
    source_id: Option<&str>,
    json: bool,
    limit: u32,
) -> Result<()> {
    let config = load(config_path)?;
    let storage = Storage::open_readonly(&config.database_path()?).await?;

    let mut states = storage.list_source_states().await?;
    if let Some(id) = source_id {
        states.retain(|s| s.source_id == id);
        if states.is_empty() {
            return Err(eyre!("no state recorded for source '{id}'"));
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&states)?);
        return Ok(());
    }

    if states.is_empty() {
        println!("No state recorded yet.");
        return Ok(());
    }

    println!();
    for state in &states {
        println!("  Source:      {}", state.source_id);
        println!(
            "  Baseline:    {}",
            state.last_known_item_id.as_deref().unwrap_or("(none)")
        );
        if let Some(url) = &state.last_known_item_url {
            println!("  URL:         {url}");
        }
        println!("  Last check:  {}", state.last_check_at.to_rfc3339());
        if let Some(at) = state.last_item_at {
            println!("  Last item:   {}", at.to_rfc3339());
        }
        println!("  Items seen:  {}", state.total_items_seen);
        println!();
    }

    if let Some(id) = source_id {
        let patterns = storage.list_publish_patterns(id, limit).await?;
        if !patterns.is_empty() {
            println!("  Recent publish times:");
            for p in &patterns {
                println!("    {}", p.observed_publish_time.to_rfc3339());
            }
            println!();
        }
    }

    Ok(())
}

fn cmd_config_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => changewatch_shared::config_file_path()?,
    };
    if path.exists() && !force {
        return Err(eyre!(
            "config already exists at {}; pass --force to overwrite",
            path.display()
        ));
    }
    let path = init_config_at(&path)?;
    println!("Config initialized at: {}", path.display());
    println!("Add a [worker] command and at least one [[sources]] entry before running.");
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn cmd_config_check(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let sources = config.validate()?;
    // compiles every selector, same as at scheduler start
    changewatch_core::Scheduler::from_config(&config, Arc::new(MemoryGateway::new()))?;

    let enabled = sources.iter().filter(|s| s.enabled).count();
    println!(
        "Config OK: {} source(s), {enabled} enabled, worker `{}`",
        sources.len(),
        config.worker.command.join(" ")
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn new_spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(message);
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

fn print_cycle(report: &CycleReport) {
    println!();
    println!("  Source:   {}", report.source_id);
    println!("  Outcome:  {}", report.outcome.label());
    match &report.outcome {
        CycleOutcome::Skipped { remaining } => {
            println!("  Backoff:  {}s remaining (use --force to poll anyway)", remaining.as_secs());
        }
        CycleOutcome::Blocked { diagnostic, backoff } => {
            println!("  Reason:   {diagnostic}");
            println!("  Backoff:  {}s", backoff.as_secs());
        }
        CycleOutcome::Failed { diagnostic } => println!("  Reason:   {diagnostic}"),
        CycleOutcome::NoChange { listed } => println!("  Listed:   {listed} item(s), none new"),
        CycleOutcome::Triggered {
            run_id, new_items, ..
        } => {
            println!("  New:      {new_items} item(s)");
            println!("  Run:      {run_id}");
        }
        CycleOutcome::InFlight { new_items } => {
            println!("  New:      {new_items} item(s), worker already running");
        }
        CycleOutcome::LaunchFailed { new_items, error } => {
            println!("  New:      {new_items} item(s)");
            println!("  Error:    {error}");
        }
    }
    if report.persistence_errors > 0 {
        println!("  Warning:  {} state write(s) failed", report.persistence_errors);
    }
    println!("  Time:     {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

fn print_worker(report: &WorkerReport) {
    println!("  Worker:   {} in {:.1}s", report.status, report.elapsed.as_secs_f64());
    if let Some(e) = &report.error {
        println!("  Error:    {e}");
    }
    println!();
}

fn print_processing(report: &ProcessingReport) {
    match &report.error {
        None => println!("  Processing: done in {:.1}s", report.elapsed.as_secs_f64()),
        Some(e) => println!("  Processing: failed ({e})"),
    }
    println!();
}
