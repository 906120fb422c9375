//! CLI entry point for `mboxsync`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use mboxsync::config::{self, CachePolicy, Config};
use mboxsync::ingest::{IngestService, RunHandle, RunSummary};
use mboxsync::model::thread::ThreadStatus;

#[derive(Parser)]
#[command(
    name = "mboxsync",
    version,
    about = "Ingest mailing list MBOX archives into a thread database"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and ingest every month since the newest stored message
    Sync {
        /// Reuse archive files that were already downloaded
        #[arg(long)]
        reuse: bool,
        /// Number of concurrent downloads
        #[arg(short, long)]
        workers: Option<usize>,
        /// Delete each archive file once it has been ingested
        #[arg(long)]
        cleanup: bool,
        #[arg(long)]
        json: bool,
    },
    /// Ingest a local MBOX file
    Import {
        path: PathBuf,
        /// Copy the file into the data directory before ingesting it
        #[arg(long)]
        copy: bool,
        #[arg(long)]
        json: bool,
    },
    /// List threads by most recent activity
    Threads {
        /// Only threads in this state (in-progress, discussion, stalled, abandoned)
        #[arg(short, long)]
        status: Option<ThreadStatus>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Show one thread and its messages
    Show {
        /// Thread id or a unique prefix of it
        thread_id: String,
        /// Print full message bodies
        #[arg(long)]
        bodies: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show store totals
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Delete all ingested threads and messages
    Reset {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Print the effective configuration
    Config {
        /// Write it to the config file location
        #[arg(long)]
        save: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::load_config();

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Sync {
            reuse,
            workers,
            cleanup,
            json,
        } => {
            let mut config = config;
            if reuse {
                config.sync.cache_policy = CachePolicy::Reuse;
            }
            if let Some(workers) = workers {
                config.sync.workers = workers;
            }
            config.sync.cleanup_after_ingest |= cleanup;
            cmd_sync(config, json).await
        }
        Commands::Import { path, copy, json } => cmd_import(config, &path, copy, json).await,
        Commands::Threads {
            status,
            limit,
            json,
        } => cmd_threads(config, status, limit, json).await,
        Commands::Show {
            thread_id,
            bodies,
            json,
        } => cmd_show(config, thread_id, bodies, json).await,
        Commands::Stats { json } => cmd_stats(config, json).await,
        Commands::Reset { yes } => cmd_reset(config, yes).await,
        Commands::Config { save } => cmd_config(&config, save),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_path = config::log_file_path(config);
    let log_dir = log_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config::data_dir(config));
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mboxsync.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

async fn cmd_sync(config: Config, json: bool) -> anyhow::Result<()> {
    let service = IngestService::open(config)?;
    let start = Instant::now();
    let handle = service.start_remote_sync()?;
    let summary = wait_with_progress(&service, handle, "Syncing").await?;
    print_summary(&summary, start.elapsed(), json)
}

async fn cmd_import(config: Config, path: &Path, copy: bool, json: bool) -> anyhow::Result<()> {
    if !path.is_file() {
        anyhow::bail!("Archive file not found: {}", path.display());
    }
    let service = IngestService::open(config)?;

    let path = if copy {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = tokio::fs::read(path).await?;
        service.save_upload(&file_name, &bytes).await?
    } else {
        path.to_path_buf()
    };

    let start = Instant::now();
    let handle = service.start_local_import(path)?;
    let summary = wait_with_progress(&service, handle, "Importing").await?;
    print_summary(&summary, start.elapsed(), json)
}

/// Poll the tracker into a progress bar until the run ends.
async fn wait_with_progress(
    service: &IngestService,
    mut handle: RunHandle,
    label: &str,
) -> anyhow::Result<RunSummary> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} {label} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} months {{msg}}"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let result = loop {
        tokio::select! {
            result = &mut handle => break result,
            _ = ticker.tick() => {
                let progress = service.progress();
                pb.set_length(progress.months_total as u64);
                pb.set_position(progress.months_done as u64);
                pb.set_message(progress.current_unit.unwrap_or_default());
            }
        }
    };
    pb.finish_and_clear();

    Ok(result??)
}

async fn cmd_threads(
    config: Config,
    status: Option<ThreadStatus>,
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    let service = IngestService::open(config)?;
    let threads = service
        .with_store(move |store| store.list_threads(status, limit))
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&threads)?);
        return Ok(());
    }

    println!();
    println!("  {} thread(s)", threads.len());
    println!();
    if threads.is_empty() {
        return Ok(());
    }

    println!(
        "  {:<8} {:<17} {:<16} {:>5} {:>4} {:<20} {:<40}",
        "ID", "Last message", "Status", "Msgs", "Auth", "Started by", "Subject"
    );
    println!("  {}", "-".repeat(116));
    for thread in &threads {
        let id: String = thread.id.chars().take(8).collect();
        let last = thread
            .last_message_at
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let author: String = thread.first_author.chars().take(19).collect();
        let subject: String = thread.subject.chars().take(39).collect();
        println!(
            "  {:<8} {:<17} {:<16} {:>5} {:>4} {:<20} {:<40}",
            id,
            last,
            thread.status.as_str(),
            thread.message_count,
            thread.unique_authors,
            author,
            subject
        );
    }
    println!();
    Ok(())
}

async fn cmd_show(config: Config, thread_id: String, bodies: bool, json: bool) -> anyhow::Result<()> {
    let service = IngestService::open(config)?;
    let (thread, activity, messages) = service
        .with_store(move |store| {
            let id = store.resolve_thread_id(&thread_id)?;
            let thread = store
                .get_thread(&id)?
                .ok_or(mboxsync::error::SyncError::ThreadNotFound(id.clone()))?;
            let activity = store.get_activity(&id)?;
            let messages = store.thread_messages(&id)?;
            Ok((thread, activity, messages))
        })
        .await?;

    if json {
        let output = serde_json::json!({
            "thread": thread,
            "activity": activity,
            "messages": messages,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!();
    println!("  {:<20} {}", "Thread", thread.id);
    println!("  {:<20} {}", "Subject", thread.subject);
    println!(
        "  {:<20} {} <{}>",
        "Started by", thread.first_author, thread.first_author_email
    );
    println!("  {:<20} {}", "Status", thread.status);
    println!("  {:<20} {}", "Messages", thread.message_count);
    println!("  {:<20} {}", "Authors", thread.unique_authors);
    if let Some(activity) = &activity {
        println!(
            "  {:<20} patch: {}, review: {}, idle {} day(s)",
            "Activity", activity.has_patch, activity.has_review, activity.days_since_last_message
        );
    }
    println!();

    for (i, message) in messages.iter().enumerate() {
        let patch = match (message.has_patch, message.patch_status) {
            (true, Some(status)) => format!(" [patch: {status}]"),
            (true, None) => " [patch]".to_string(),
            _ => String::new(),
        };
        println!(
            "  {:>3}. {}  {} <{}>{}",
            i + 1,
            message.created_at.format("%Y-%m-%d %H:%M"),
            message.author,
            message.author_email,
            patch
        );
        println!("       {}", message.subject);
        if bodies {
            println!();
            for line in message.body.lines() {
                println!("       {line}");
            }
            println!();
        }
    }
    println!();
    Ok(())
}

async fn cmd_stats(config: Config, json: bool) -> anyhow::Result<()> {
    let db_path = config::database_path(&config);
    let service = IngestService::open(config)?;
    let stats = service.with_store(|store| store.stats()).await?;
    let db_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    if json {
        let output = serde_json::json!({
            "database": db_path.to_string_lossy(),
            "database_size": db_size,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    use humansize::{format_size, BINARY};
    println!();
    println!("  {:<25} {}", "Database", db_path.display());
    println!("  {:<25} {}", "Database size", format_size(db_size, BINARY));
    println!("  {:<25} {}", "Threads", stats.threads);
    println!("  {:<25} {}", "Messages", stats.messages);
    println!("  {:<25} {}", "Authors", stats.authors);
    println!("  {:<25} {}", "Messages with patches", stats.patches);
    if let Some(latest) = stats.latest_message_at {
        println!("  {:<25} {}", "Newest message", latest.format("%Y-%m-%d %H:%M"));
    }
    if let Some(updated) = stats.last_updated_at {
        println!("  {:<25} {}", "Last ingested", updated.format("%Y-%m-%d %H:%M"));
    }
    println!();
    println!("  Threads by status:");
    for (status, count) in &stats.by_status {
        println!("    {count:>6}  {status}");
    }
    println!();
    Ok(())
}

async fn cmd_reset(config: Config, yes: bool) -> anyhow::Result<()> {
    if !yes {
        eprint!("Delete all threads and messages? [y/N] ");
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("  Aborted.");
            return Ok(());
        }
    }
    let service = IngestService::open(config)?;
    service.reset().await?;
    println!("  Store reset.");
    Ok(())
}

fn cmd_config(config: &Config, save: bool) -> anyhow::Result<()> {
    if save {
        config::save_config(config)?;
        if let Some(path) = config::config_file_path() {
            println!("  Saved configuration to {}", path.display());
        }
        return Ok(());
    }
    print!("{}", toml::to_string_pretty(&config.redacted())?);
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mboxsync", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

/// Print a finished run as a table or JSON.
fn print_summary(summary: &RunSummary, elapsed: Duration, json: bool) -> anyhow::Result<()> {
    if json {
        let output = serde_json::json!({
            "elapsed_ms": elapsed.as_millis(),
            "summary": summary,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    use humansize::{format_size, BINARY};
    let parse = &summary.parse;
    let report = &summary.reconcile;
    println!();
    println!(
        "  {:<25} {}/{} ({} failed)",
        "Units ingested", summary.units_ingested, summary.units_total, summary.units_failed
    );
    if summary.bytes_downloaded > 0 {
        println!(
            "  {:<25} {}",
            "Downloaded",
            format_size(summary.bytes_downloaded, BINARY)
        );
    }
    println!("  {:<25} {}", "Messages parsed", parse.parsed);
    println!(
        "  {:<25} {} (id {}, from {}, date {})",
        "Messages skipped",
        parse.skipped,
        parse.invalid_message_id,
        parse.invalid_from,
        parse.invalid_date
    );
    println!("  {:<25} {}", "Repaired Message-IDs", parse.malformed_message_id);
    println!("  {:<25} {}", "Patches detected", parse.patches);
    println!("  {:<25} {}", "Messages inserted", report.inserted);
    println!("  {:<25} {}", "Messages updated", report.updated);
    println!("  {:<25} {}", "Threads created", report.threads_created);
    if report.threads_deleted > 0 {
        println!("  {:<25} {}", "Threads emptied", report.threads_deleted);
    }
    println!("  {:<25} {:.2?}", "Elapsed", elapsed);

    if !summary.failures.is_empty() {
        println!();
        println!("  Failed units:");
        for (unit, error) in &summary.failures {
            println!("    {unit:<12} {error}");
        }
    }
    println!();
    Ok(())
}
