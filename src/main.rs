use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use taskd::{
    config::TaskdConfig,
    rest,
    search::{projector::Projector, SearchIndex},
    service::TaskService,
    storage::TaskStore,
    AppContext,
};
use tokio::sync::Notify;
use tracing::info;

#[derive(Parser)]
#[command(name = "taskd", about = "taskd — task list REST backend", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// REST API server port
    #[arg(long, env = "TASKD_PORT")]
    port: Option<u16>,

    /// Data directory for the SQLite databases and config
    #[arg(long, env = "TASKD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TASKD_LOG")]
    log: Option<String>,

    /// Bind address for the HTTP server (default: 127.0.0.1; use 0.0.0.0 for LAN access)
    #[arg(long, env = "TASKD_BIND")]
    bind_address: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "TASKD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server (default when no subcommand given).
    ///
    /// Runs taskd in the foreground. When invoked with no subcommand, this is the default.
    ///
    /// Examples:
    ///   taskd serve
    ///   taskd
    Serve,
    /// Rebuild the search index from the primary task database.
    ///
    /// Drops every indexed document and re-inserts one per stored task, then
    /// drains any pending outbox entries. Use this after restoring a backup
    /// of the primary database or if search results look wrong.
    ///
    /// Examples:
    ///   taskd reindex
    Reindex,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ── Config + logging setup ───────────────────────────────────────────────
    // Config resolves first so the TOML `log` / `log_format` keys reach the
    // subscriber; logging init must still precede any tracing calls.
    let config = Arc::new(TaskdConfig::new(
        args.port,
        args.data_dir,
        args.log,
        args.bind_address,
    ));
    let _file_guard = setup_logging(&config.log, args.log_file.as_deref(), &config.log_format);

    match args.command {
        Some(Command::Reindex) => {
            run_reindex(config).await?;
        }
        None | Some(Command::Serve) => {
            run_server(config).await?;
        }
    }

    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators like Loki/Elasticsearch).
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("taskd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            // Fall back to stdout-only — don't panic on a bad log path.
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt().json().with_env_filter(log_level).init();
            } else {
                tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt().json().with_env_filter(log_level).init();
        None
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}

// ── Panic hook + crash log ────────────────────────────────────────────────────

/// Install a custom panic hook that writes panic info + backtrace to `{data_dir}/crash.log`.
///
/// The crash log is checked and removed on the next startup (`check_crash_log`).
fn install_panic_hook(data_dir: std::path::PathBuf) {
    let original = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        // Call the original hook first (prints to stderr).
        original(info);

        let crash_path = data_dir.join("crash.log");
        let msg = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("unknown panic");

        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        let backtrace = std::backtrace::Backtrace::capture();
        let content = format!(
            "taskd panic at {location}\n\
             message: {msg}\n\
             version: {}\n\
             backtrace:\n{backtrace:#}\n",
            env!("CARGO_PKG_VERSION")
        );

        // Best-effort write — if this fails, we can't do much.
        let _ = std::fs::write(&crash_path, &content);
    }));
}

/// Check for a crash log from the previous run, log it at error level, then delete it.
///
/// Called early in `run_server()` after logging is initialized.
fn check_crash_log(data_dir: &std::path::Path) {
    let crash_path = data_dir.join("crash.log");
    match std::fs::read_to_string(&crash_path) {
        Ok(content) => {
            tracing::error!(
                crash_report = %content.trim(),
                "previous run ended with a panic — see crash report above"
            );
            let _ = std::fs::remove_file(&crash_path);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(err = %e, "could not read crash.log");
        }
    }
}

async fn run_server(config: Arc<TaskdConfig>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "taskd starting");
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        "config loaded"
    );

    // ── Panic hook: write crash.log on panic ─────────────────────────────────
    install_panic_hook(config.data_dir.clone());
    // If previous run panicked, log the crash report and delete it.
    check_crash_log(&config.data_dir);

    let store = TaskStore::new_with_slow_query(
        &config.data_dir,
        config.observability.slow_query_threshold_ms,
    )
    .await?;
    let index = SearchIndex::new(&config.data_dir).await?;

    // The service signals this after every mutation; the projector sleeps on it.
    let wake = Arc::new(Notify::new());
    let tasks = TaskService::new(store.clone(), index.clone(), wake.clone());

    // The projector is the only writer to the search index. It reports its
    // own backlog depth on startup, so a crash with pending entries is
    // visible in the log before the first drain.
    Projector::new(store, index, &config.search, wake).spawn();

    let ctx = Arc::new(AppContext {
        config: config.clone(),
        tasks,
        started_at: std::time::Instant::now(),
    });

    rest::start_rest_server(ctx).await
}

async fn run_reindex(config: Arc<TaskdConfig>) -> Result<()> {
    let store = TaskStore::new(&config.data_dir).await?;
    let index = SearchIndex::new(&config.data_dir).await?;

    // No spawn: rebuild runs in the foreground and the process exits after.
    let projector = Projector::new(store, index, &config.search, Arc::new(Notify::new()));
    let count = projector.rebuild_index().await?;
    println!("reindexed {count} tasks");

    Ok(())
}
