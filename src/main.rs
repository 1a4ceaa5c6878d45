//! lite-tutor entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Open the knowledge base (selects the embedding strategy)
//!   6. Run the subcommand: `serve` (default), `ingest` or `search`
//!
//! `serve` builds the session store and tutor, spawns the session sweeper and
//! the Ctrl-C watcher, then drives the HTTP channel until shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lite_tutor::config::{self, Config};
use lite_tutor::error::AppError;
use lite_tutor::logger;
use lite_tutor::subsystems::knowledge::{KnowledgeBase, SearchMode};
use lite_tutor::subsystems::tutor::{InMemorySessionStore, SessionStore, TutorFsm};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Load .env if present; the file is optional.
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();

    let config = config::load(args.config_path.as_deref())?;

    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    let force_cli_level = args.log_level.is_some();

    logger::init(effective_log_level, force_cli_level)?;

    info!(
        name = %config.name,
        work_dir = %config.work_dir.display(),
        db_dir = %config.knowledge.db_dir.display(),
        embedding_mode = %config.embedding.mode,
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    // Strategy selection may probe the network with the blocking client.
    let knowledge = {
        let knowledge_cfg = config.knowledge.clone();
        let embedding_cfg = config.embedding.clone();
        blocking(move || KnowledgeBase::open(&knowledge_cfg, &embedding_cfg)).await?
    };
    let knowledge = Arc::new(knowledge);

    match args.command {
        Command::Serve => serve(&config, knowledge).await,
        Command::Ingest { file, chunk_size } => {
            let chunk_size = chunk_size.unwrap_or(config.knowledge.chunk_size);
            let report = blocking(move || knowledge.ingest(&file, chunk_size)).await?;
            println!("ingested {} chunk(s) from {}", report.chunks, report.source);
            Ok(())
        }
        Command::Search { query, mode, n_results } => {
            let n_results = n_results.unwrap_or(config.knowledge.n_results);
            let context = blocking(move || knowledge.search(&query, mode, n_results)).await?;
            println!("{context}");
            Ok(())
        }
    }
}

async fn serve(config: &Config, knowledge: Arc<KnowledgeBase>) -> Result<(), AppError> {
    let store = Arc::new(InMemorySessionStore::from_config(&config.sessions)?);
    let tutor = Arc::new(
        TutorFsm::new(store.clone(), knowledge.clone()).with_n_results(config.knowledge.n_results),
    );

    // Shared shutdown token; Ctrl-C cancels it, all tasks watch it.
    let shutdown = CancellationToken::new();

    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    let sweeper = spawn_session_sweeper(store, config.sessions.ttl_seconds, shutdown.clone());

    print_startup_summary(config, &knowledge);

    run_channels(config, knowledge, tutor, shutdown.clone()).await?;

    // Channel may exit on its own (bind error already returned above).
    shutdown.cancel();
    sweeper.await.ok();

    info!("shutdown complete");
    Ok(())
}

#[cfg(feature = "channel-axum")]
async fn run_channels(
    config: &Config,
    knowledge: Arc<KnowledgeBase>,
    tutor: Arc<TutorFsm>,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    use lite_tutor::subsystems::comms::axum_channel::{AxumChannel, AxumState};

    if !config.http.enabled {
        warn!("http channel disabled in config; waiting for ctrl-c");
        shutdown.cancelled().await;
        return Ok(());
    }

    let state = AxumState::new(knowledge, tutor)
        .with_defaults(config.knowledge.chunk_size, config.knowledge.n_results);
    AxumChannel::new(config.http.bind.clone(), state).run(shutdown).await
}

#[cfg(not(feature = "channel-axum"))]
async fn run_channels(
    config: &Config,
    _knowledge: Arc<KnowledgeBase>,
    _tutor: Arc<TutorFsm>,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    if config.http.enabled {
        warn!("http channel configured but not compiled in; waiting for ctrl-c");
    }
    shutdown.cancelled().await;
    Ok(())
}

/// Periodically drop expired tutor sessions until `shutdown` fires.
fn spawn_session_sweeper(
    store: Arc<InMemorySessionStore>,
    ttl_seconds: u64,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs((ttl_seconds / 4).clamp(1, 60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match store.expire() {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "session sweep"),
                    Err(e) => warn!("session sweep failed: {e}"),
                },
            }
        }
        debug!("session sweeper stopped");
    })
}

async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Io(std::io::Error::other(e)))?
}

fn print_startup_summary(config: &Config, knowledge: &KnowledgeBase) {
    let chunks = knowledge
        .collection()
        .count()
        .map(|n| n.to_string())
        .unwrap_or_else(|_| "?".to_string());

    #[cfg(feature = "channel-axum")]
    let http_line = if config.http.enabled {
        format!("http: {}", config.http.bind)
    } else {
        "http: disabled".to_string()
    };
    #[cfg(not(feature = "channel-axum"))]
    let http_line = "http: not compiled in".to_string();

    println!("lite-tutor `{}` (pid {})", config.name, std::process::id());
    println!("  knowledge : {} ({chunks} chunks) in {}", knowledge.collection().name(), config.knowledge.db_dir.display());
    println!("  embedding : {} (mode {})", knowledge.strategy(), config.embedding.mode);
    println!("  sessions  : ttl {}s, capacity {}", config.sessions.ttl_seconds, config.sessions.capacity);
    println!("  {http_line}");
}

enum Command {
    Serve,
    Ingest { file: PathBuf, chunk_size: Option<usize> },
    Search { query: String, mode: SearchMode, n_results: Option<usize> },
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
    command: Command,
}

fn usage() {
    println!("Usage: lite-tutor [OPTIONS] [COMMAND]");
    println!();
    println!("Commands:");
    println!("  serve                                  Run the HTTP API (default)");
    println!("  ingest <FILE> [--chunk-size N]         Chunk, embed and store a text file");
    println!("  search <QUERY> [--mode M] [-n N]       Query the knowledge base (M: vector|hybrid)");
    println!();
    println!("Options:");
    println!("  -h, --help                 Print help");
    println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
    println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
}

fn cli_error(msg: &str) -> ! {
    eprintln!("error: {msg}");
    std::process::exit(1);
}

fn parse_number(flag: &str, value: Option<String>) -> usize {
    match value.as_deref().map(str::parse::<usize>) {
        Some(Ok(n)) if n > 0 => n,
        _ => cli_error(&format!("{flag} requires a positive integer")),
    }
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;
    let mut positional: Vec<String> = Vec::new();
    let mut chunk_size = None;
    let mut mode = SearchMode::default();
    let mut n_results = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            positional.extend(iter.by_ref());
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                usage();
                std::process::exit(0);
            }
            "-f" | "--config" => match iter.next() {
                Some(path) => config_path = Some(path),
                None => cli_error("-f/--config requires a path argument"),
            },
            "--chunk-size" => chunk_size = Some(parse_number("--chunk-size", iter.next())),
            "-n" | "--n-results" => n_results = Some(parse_number("-n/--n-results", iter.next())),
            "--mode" => match iter.next().map(|m| m.parse::<SearchMode>()) {
                Some(Ok(m)) => mode = m,
                Some(Err(e)) => cli_error(&e),
                None => cli_error("--mode requires vector or hybrid"),
            },
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            a if a.starts_with('-') && a.len() > 1 => cli_error(&format!("unknown option '{a}'")),
            _ => positional.push(arg),
        }
    }

    // Each -v raises verbosity one tier from the config default:
    //   -v      → warn
    //   -vv     → info
    //   -vvv    → debug
    //   -vvvv+  → trace
    let log_level = match verbosity {
        0 => None,
        1 => Some("warn"),
        2 => Some("info"),
        3 => Some("debug"),
        _ => Some("trace"),
    };

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None | Some("serve") => Command::Serve,
        Some("ingest") => match positional.next() {
            Some(file) => Command::Ingest { file: PathBuf::from(file), chunk_size },
            None => cli_error("ingest requires a file path"),
        },
        Some("search") => {
            let query = positional.collect::<Vec<_>>().join(" ");
            if query.trim().is_empty() {
                cli_error("search requires a query");
            }
            Command::Search { query, mode, n_results }
        }
        Some(other) => cli_error(&format!("unknown command '{other}' (see --help)")),
    };

    CliArgs { log_level, config_path, command }
}
