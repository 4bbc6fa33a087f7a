// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use reelpool::cache::ContentCache;
use reelpool::config::{self, Config};
use reelpool::download::{format_bytes, Callbacks, DownloadCoordinator, DownloadIndex, DownloadState};
use reelpool::engine::{CachedEngineFactory, EngineStatus};
use reelpool::error::describe_download_error;
use reelpool::pool::EnginePool;
use reelpool::scheduler::{PreloadPolicy, PreloadScheduler};
use reelpool::transport::{HttpTransport, MemoryTransport, Transport};
use reelpool::types::{ContentLocator, Feed, SlotIndex};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const BLUE: &str = "\x1b[34m";
    pub const BRIGHT_CYAN: &str = "\x1b[96m";
}

use colors::*;

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

/// Spinner helpers for consistent progress indicators
mod spinner {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    /// Create a spinner with consistent styling
    pub fn create(message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .tick_chars("\u{28FB}\u{28F9}\u{28FC}\u{28F8}\u{28FE}\u{28F6}\u{28F7}\u{28E7}\u{28CF}\u{28DF} ")
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    }

    /// Finish spinner with success message
    pub fn finish_success(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        println!("\x1b[32m[OK]\x1b[0m {}", message);
    }

    /// Finish spinner with warning message
    pub fn finish_warning(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        println!("\x1b[33m[!]\x1b[0m {}", message);
    }
}

/// reelpool - engine pool, preloading and download coordination for video feeds
#[derive(Parser)]
#[command(name = "reelpool")]
#[command(version = VERSION)]
#[command(about = "Engine pool, preload window and download coordinator for swipeable video feeds.")]
#[command(long_about = "reelpool - playback plumbing for swipeable video feeds\n\n\
    Watch the pool work:   reelpool simulate --path 0,1,2,5,4\n\
    Pre-fetch content:     reelpool download https://cdn.example.com/a.mp4\n\
    Check downloads:       reelpool status\n\
    Forget a download:     reelpool remove <locator>\n\
    Configure:             reelpool config show")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose mode: debug logging for the reelpool crate
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scripted swipe path against an in-memory feed
    ///
    /// Examples:
    ///   reelpool simulate
    ///   reelpool simulate --items 20 --path 0,1,2,3,9,8
    ///   reelpool simulate --pool-size 4 --prefetch
    #[command(alias = "sim")]
    Simulate {
        /// Number of items in the generated feed
        #[arg(long, default_value_t = 10)]
        items: usize,
        /// Settled slots, in order
        #[arg(long, value_delimiter = ',', default_value = "0,1,2,5,4,3")]
        path: Vec<SlotIndex>,
        /// Override pool.pool_size from the config
        #[arg(long)]
        pool_size: Option<usize>,
        /// Also pre-fetch the window ahead through the download coordinator
        #[arg(long)]
        prefetch: bool,
        /// Size of each generated item in KiB
        #[arg(long, default_value_t = 512)]
        item_kib: usize,
    },

    /// Download content into the cache with progress bars
    ///
    /// Examples:
    ///   reelpool download https://cdn.example.com/a.mp4 https://cdn.example.com/b.mp4
    ///   reelpool download --parallel 1 https://cdn.example.com/a.mp4
    #[command(alias = "dl")]
    Download {
        /// Locators (URLs) to fetch
        #[arg(required = true)]
        locators: Vec<String>,
        /// Override download.max_parallel_downloads from the config
        #[arg(long)]
        parallel: Option<usize>,
    },

    /// Show the persisted download index
    ///
    /// Examples:
    ///   reelpool status
    ///   reelpool s
    #[command(alias = "s")]
    Status,

    /// Remove download records from the index
    ///
    /// Examples:
    ///   reelpool remove https://cdn.example.com/a.mp4
    ///   reelpool remove --all
    Remove {
        /// Locator to remove
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        locator: Option<String>,
        /// Remove every record
        #[arg(long)]
        all: bool,
    },

    /// Configure settings
    ///
    /// Examples:
    ///   reelpool config show
    ///   reelpool config init
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the current configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "reelpool=debug" } else { "reelpool=info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{RED}[✗]{RESET} Invalid configuration: {:#}", e);
            if let Ok(path) = config::config_path() {
                eprintln!("    Fix or delete {}", path.display());
            }
            std::process::exit(exit_codes::CONFIG);
        }
    };

    match cli.command {
        Commands::Simulate {
            items,
            path,
            pool_size,
            prefetch,
            item_kib,
        } => {
            let mut config = config;
            if let Some(size) = pool_size {
                config.pool.pool_size = size;
            }
            config.validate()?;
            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            runtime.block_on(simulate(&config, items, &path, prefetch, item_kib * 1024))
        }
        Commands::Download { locators, parallel } => {
            let mut config = config;
            if let Some(parallel) = parallel {
                config.download.max_parallel_downloads = parallel;
            }
            config.validate()?;
            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            let failed = runtime.block_on(download(&config, locators))?;
            if failed > 0 {
                std::process::exit(exit_codes::ERROR);
            }
            Ok(())
        }
        Commands::Status => show_status(&config),
        Commands::Remove { locator, all } => handle_remove(&config, locator, all),
        Commands::Config { command } => handle_config(&config, command.unwrap_or(ConfigCommands::Show)),
    }
}

fn index_path(config: &Config) -> Result<std::path::PathBuf> {
    match &config.download.index_path {
        Some(path) => Ok(path.clone()),
        None => config::default_index_path(),
    }
}

// =============================================================================
// simulate
// =============================================================================

async fn simulate(
    config: &Config,
    items: usize,
    path: &[SlotIndex],
    prefetch: bool,
    item_bytes: usize,
) -> Result<()> {
    if items == 0 {
        bail!("--items must be at least 1");
    }

    let transport = Arc::new(MemoryTransport::new(64 * 1024).with_chunk_delay(Duration::from_millis(2)));
    let feed = Feed::new((0..items).map(|i| format!("mem://clip-{}", i)));
    for (i, locator) in feed.iter().enumerate() {
        transport.insert(locator.clone(), vec![i as u8; item_bytes]);
    }

    let cache = Arc::new(ContentCache::new(config.pool.cache_size_bytes));
    let upstream: Arc<dyn Transport> = transport.clone();
    let pool = Arc::new(EnginePool::with_cache(
        &config.pool,
        config.engine.clone(),
        Some(Arc::clone(&cache)),
        Arc::new(CachedEngineFactory::new(Some(Arc::clone(&upstream)))),
    ));

    let coordinator = if prefetch {
        Some(DownloadCoordinator::new(
            Arc::clone(&cache),
            Arc::clone(&upstream),
            &reelpool::config::DownloadConfig {
                index_path: None,
                ..config.download.clone()
            },
        )?)
    } else {
        None
    };

    println!();
    println!("{BRIGHT_CYAN}{BOLD}=== reelpool simulation ==={RESET}");
    println!(
        "{BLUE}[i]{RESET} Feed: {} items of {}, pool size {}, cache budget {}",
        items,
        format_bytes(item_bytes as u64),
        config.pool.pool_size,
        format_bytes(config.pool.cache_size_bytes)
    );
    println!();

    let scheduler = PreloadScheduler::spawn(PreloadPolicy::new(Arc::clone(&pool), feed.clone()));
    print_pool("warm start", &pool);
    let mut processed = scheduler.subscribe_processed();

    let mut current: Option<SlotIndex> = None;
    for &slot in path {
        if feed.get(slot).is_none() {
            println!("{YELLOW}[!]{RESET} slot {} is outside the feed, skipped", slot);
            continue;
        }
        if current == Some(slot) {
            continue;
        }

        scheduler.settle(slot);
        let settled = tokio::time::timeout(
            Duration::from_secs(5),
            processed.wait_for(|p| p.as_ref().is_some_and(|p| p.slot == slot)),
        )
        .await;
        let report = match settled {
            Ok(Ok(p)) => p.as_ref().map(|p| p.report.clone()),
            _ => bail!("Scheduler did not process slot {}", slot),
        };

        // Only the visible slot plays.
        if let Some(previous) = current.and_then(|s| pool.engine_for_slot(s)) {
            previous.set_play_when_ready(false);
        }
        if let Some(engine) = pool.engine_for_slot(slot) {
            engine.set_play_when_ready(true);
        }
        current = Some(slot);

        if let (Some(coordinator), Some(report)) = (&coordinator, &report) {
            for ahead in &report.preloaded {
                if let Some(locator) = feed.get(*ahead) {
                    coordinator.prefetch(locator.clone());
                }
            }
        }

        if let Some(report) = report {
            println!(
                "{DIM}released {:?}, preloaded {:?}{RESET}",
                report.released, report.preloaded
            );
        }
        print_pool(&format!("settled on {}", slot), &pool);
    }

    let spinner = spinner::create("Waiting for engines to buffer...");
    let ready = wait_until_ready(&pool).await;
    if ready {
        spinner::finish_success(&spinner, "Every bound engine is ready");
    } else {
        spinner::finish_warning(&spinner, "Some engines are still preparing");
    }
    print_pool("final", &pool);

    if let Some(coordinator) = &coordinator {
        let stats = coordinator.stats();
        println!(
            "{BLUE}[i]{RESET} Downloads: {} completed, {} active",
            stats.completed,
            stats.queued + stats.downloading
        );
    }
    let cache_stats = cache.stats();
    println!(
        "{BLUE}[i]{RESET} Cache: {} entries, {} of {}, {} evictions",
        cache_stats.entries,
        format_bytes(cache_stats.total_bytes),
        format_bytes(cache_stats.budget_bytes),
        cache_stats.evictions
    );

    scheduler.shutdown().await;
    if let Some(coordinator) = coordinator {
        coordinator.shutdown();
    }
    let stats = pool.stats();
    println!(
        "{GREEN}[✓]{RESET} Pool torn down ({} engines allocated in total)",
        stats.allocated
    );
    println!();
    Ok(())
}

async fn wait_until_ready(pool: &EnginePool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let pending = pool
            .in_use_slots()
            .into_iter()
            .filter_map(|slot| pool.engine_for_slot(slot))
            .any(|engine| engine.status() == EngineStatus::Preparing);
        if !pending {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn print_pool(label: &str, pool: &EnginePool) {
    let stats = pool.stats();
    let slots: Vec<String> = pool
        .in_use_slots()
        .into_iter()
        .filter_map(|slot| pool.engine_for_slot(slot).map(|engine| (slot, engine)))
        .map(|(slot, engine)| {
            let status = match engine.status() {
                EngineStatus::Ready => "ready".green(),
                EngineStatus::Preparing => "preparing".yellow(),
                EngineStatus::Error => "error".red(),
                EngineStatus::Idle => "idle".dimmed(),
                EngineStatus::Released => "released".dimmed(),
            };
            let playing = if engine.play_when_ready() { " ▶" } else { "" };
            format!("{}={}:{}{}", slot, engine.id(), status, playing)
        })
        .collect();
    println!(
        "{:<14} {} {DIM}({} in use, {} idle){RESET}",
        label.bold(),
        if slots.is_empty() { "-".to_string() } else { slots.join("  ") },
        stats.in_use,
        stats.idle
    );
}

// =============================================================================
// download
// =============================================================================

/// Returns the number of failed downloads.
async fn download(config: &Config, locators: Vec<String>) -> Result<usize> {
    let cache = Arc::new(ContentCache::new(config.pool.cache_size_bytes));
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(
        config.download.request_timeout_secs,
    ))?);

    let mut download_config = config.download.clone();
    if download_config.index_path.is_none() {
        download_config.index_path = Some(config::default_index_path()?);
    }
    let coordinator = DownloadCoordinator::new(cache, transport, &download_config)?;

    let multi = MultiProgress::new();
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% | {msg}")
        .context("Invalid progress bar template")?
        .progress_chars("█▓░");

    let mut handles = Vec::with_capacity(locators.len());
    for raw in locators {
        let locator = ContentLocator::new(raw);
        let pb = multi.add(ProgressBar::new(100));
        pb.set_style(style.clone());
        pb.set_message(locator.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        let on_progress = pb.clone();
        let on_complete = pb.clone();
        let on_error = pb.clone();
        let handle = coordinator.download(
            locator,
            Callbacks::new()
                .with_progress(move |fraction| {
                    on_progress.set_position((fraction * 100.0).round() as u64);
                })
                .with_complete(move || {
                    on_complete.set_position(100);
                    on_complete.finish();
                })
                .with_error(move |error| {
                    on_error.abandon_with_message(format!("{}", error).red().to_string());
                }),
        );
        handles.push((handle, pb));
    }

    let mut failed = 0;
    let mut failures = Vec::new();
    for (mut handle, pb) in handles {
        let progress = handle.wait().await;
        match progress.state {
            DownloadState::Completed => {
                pb.finish_with_message(format!("{} ({})", progress.locator, progress.bytes_string()));
            }
            _ => {
                failed += 1;
                pb.abandon();
                if let Some(error) = progress.error {
                    failures.push(describe_download_error(&progress.locator, &error));
                }
            }
        }
    }

    coordinator.shutdown();

    println!();
    for failure in failures {
        eprintln!("{}", failure);
    }
    let stats = coordinator.stats();
    println!(
        "{GREEN}[✓]{RESET} {} completed, {RED}{}{RESET} failed",
        stats.completed, failed
    );
    Ok(failed)
}

// =============================================================================
// status / remove / config
// =============================================================================

fn show_status(config: &Config) -> Result<()> {
    let path = index_path(config)?;
    let index = DownloadIndex::open(&path)?;

    println!();
    println!("{BRIGHT_CYAN}{BOLD}=== reelpool downloads ==={RESET}");
    println!();

    let counts = index.status_counts();
    println!(
        "{BLUE}[i]{RESET} {} records: {} completed, {} queued, {} downloading, {} stopped, {} failed",
        index.len(),
        counts.completed,
        counts.queued,
        counts.downloading,
        counts.stopped,
        counts.failed
    );
    println!();

    for record in index.records_by_age() {
        let state = match record.state {
            DownloadState::Completed => record.state.name().green(),
            DownloadState::Failed => record.state.name().red(),
            DownloadState::Stopped => record.state.name().yellow(),
            DownloadState::Queued | DownloadState::Downloading => record.state.name().cyan(),
        };
        let size = match record.content_length {
            Some(total) => format!("{} / {}", format_bytes(record.bytes_downloaded), format_bytes(total)),
            None => format_bytes(record.bytes_downloaded),
        };
        println!("  {:<12} {:>5.1}%  {:<22} {}", state, record.percent(), size, record.locator);
        if let Some(error) = &record.error {
            println!("               {DIM}{}{RESET}", error);
        }
    }

    println!();
    println!("Index file: {}", path.display());
    println!();
    Ok(())
}

fn handle_remove(config: &Config, locator: Option<String>, all: bool) -> Result<()> {
    let path = index_path(config)?;
    let mut index = DownloadIndex::open(&path)?;

    if all {
        let count = index.len();
        index.clear();
        index.save()?;
        println!("{GREEN}[✓]{RESET} Removed {} records", count);
        return Ok(());
    }

    let Some(locator) = locator else {
        bail!("Nothing to remove: pass a locator or --all");
    };
    let locator = ContentLocator::new(locator);
    match index.remove(&locator) {
        Some(_) => {
            index.save()?;
            println!("{GREEN}[✓]{RESET} Removed {}", locator);
        }
        None => println!("{YELLOW}[!]{RESET} No record for {}", locator),
    }
    Ok(())
}

fn handle_config(config: &Config, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            println!();
            println!("{BRIGHT_CYAN}{BOLD}=== reelpool configuration ==={RESET}");
            println!();
            println!("  Pool size:          {}", config.pool.pool_size);
            println!("  Cache budget:       {}", format_bytes(config.pool.cache_size_bytes));
            println!("  Repeat one:         {}", config.engine.repeat_one);
            println!("  Volume:             {}", config.engine.volume);
            println!("  Play when ready:    {}", config.engine.play_when_ready);
            println!("  Prefetch:           {}", format_bytes(config.engine.prefetch_bytes));
            println!("  Parallel downloads: {}", config.download.max_parallel_downloads);
            println!("  Request timeout:    {}s", config.download.request_timeout_secs);
            let index = index_path(config)?;
            println!("  Download index:     {}", index.display());
            println!();
            println!("Config file: {}", config::config_path()?.display());
            println!();
        }
        ConfigCommands::Init { force } => {
            let path = config::config_path()?;
            if path.exists() && !force {
                println!(
                    "{YELLOW}[!]{RESET} {} already exists (use --force to overwrite)",
                    path.display()
                );
                return Ok(());
            }
            config::save_config(&Config::default())?;
            println!("{GREEN}[✓]{RESET} Wrote {}", path.display());
        }
    }
    Ok(())
}
