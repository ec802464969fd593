// Loomcast broker - main entry point
//
// This file contains only the application bootstrap logic, CLI commands,
// and initialization. All handlers, routes, and business logic are in
// separate modules.

pub use loomcast_server::*;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
#[cfg(debug_assertions)]
use console_subscriber::ConsoleLayer;
use dotenvy::{Error as DotenvError, dotenv, from_filename};
use logfire::config::SendToLogfire;
use loomcast_core::{config::AppConfig, db::Database, ids::UserId, token::TokenStore, user::UserStore};
use pprof::{ProfilerGuard, protos::Message as _};
use std::{
    env,
    fs::File,
    path::{Path, PathBuf},
    sync::OnceLock,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_appender::non_blocking;
use tracing_subscriber::EnvFilter;
#[cfg(debug_assertions)]
use tracing_subscriber::registry::Registry;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

static TRACING_FALLBACK_GUARD: OnceLock<non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(author, version, about = "Loomcast collaboration broker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the broker
    Serve,
    /// Run database migrations
    Migrate,
    /// Create a user the application tier can issue tokens for
    CreateUser(CreateUserArgs),
    /// Mint a connection token for an existing user
    IssueToken(IssueTokenArgs),
}

#[derive(Args, Debug)]
struct CreateUserArgs {
    /// Display name for the user
    #[arg(long, value_name = "NAME")]
    name: String,
    /// Optional avatar URL
    #[arg(long = "avatar-url", value_name = "URL")]
    avatar_url: Option<String>,
}

#[derive(Args, Debug)]
struct IssueTokenArgs {
    /// User ID to mint the token for
    #[arg(long = "user-id", value_name = "ID")]
    user_id: String,
    /// Token lifetime in seconds (defaults to the configured TTL)
    #[arg(long, value_name = "SECONDS")]
    ttl: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tokio_console();
    let env_status = load_env_file();
    let _observability_guard = init_observability();
    observability::log_sampling_summary();
    report_env_status(&env_status);

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(config).await,
        Command::Migrate => run_migrate(config).await,
        Command::CreateUser(args) => run_create_user(config, args).await,
        Command::IssueToken(args) => run_issue_token(config, args).await,
    }
}

fn init_tokio_console() {
    #[cfg(debug_assertions)]
    {
        if env::var("TOKIO_CONSOLE_ADDR").is_ok()
            || env::var("TOKIO_CONSOLE_BIND").is_ok()
            || env::var("TOKIO_CONSOLE_RETENTION").is_ok()
        {
            let _ = ConsoleLayer::builder()
                .with_default_env()
                .spawn::<Registry>();
            warn!(
                "tokio-console enabled (set RUSTFLAGS=\"--cfg tokio_unstable\" and run `tokio-console` to attach)"
            );
        }
    }
}

async fn run_serve(config: AppConfig) -> anyhow::Result<()> {
    let profiler = HttpProfiler::maybe_start();
    info!(
        database_path = %config.database_path,
        token_ttl_secs = config.token_ttl_secs,
        tombstone_ttl_secs = config.tombstone_ttl_secs,
        "Starting broker with configuration"
    );
    let database = Database::connect(&config).await?;
    let state = build_state(&database, &config);
    info!(
        compatibility = %state.metadata.compatibility,
        deployment_type = %state.metadata.deployment_type,
        flavor = %state.metadata.flavor,
        "Loaded server metadata"
    );

    let app = router::build_router(state);

    let listener = TcpListener::bind(config.bind_address)
        .await
        .context("failed to bind socket")?;
    let actual_addr = listener
        .local_addr()
        .context("failed to read local address")?;

    info!("listening on {actual_addr}");

    if let Err(error) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(?error, "server terminated with error");
    }

    if let Some(profiler) = profiler {
        profiler.finish();
    }

    Ok(())
}

async fn run_migrate(config: AppConfig) -> anyhow::Result<()> {
    let _database = Database::connect(&config).await?;
    info!("migrations completed");
    Ok(())
}

async fn run_create_user(config: AppConfig, args: CreateUserArgs) -> anyhow::Result<()> {
    let trimmed = args.name.trim();
    if trimmed.is_empty() {
        bail!("user name must not be empty");
    }

    let database = Database::connect(&config).await?;
    let user_store = UserStore::new(&database);
    let user = user_store
        .create(trimmed, args.avatar_url.as_deref())
        .await?;

    info!(user_id = %user.id, "created user");
    println!("Created user '{}' ({})", user.name, user.id);

    Ok(())
}

async fn run_issue_token(config: AppConfig, args: IssueTokenArgs) -> anyhow::Result<()> {
    let trimmed = args.user_id.trim();
    if trimmed.is_empty() {
        bail!("user-id must not be empty");
    }

    let ttl = args.ttl.unwrap_or(config.token_ttl_secs);
    let database = Database::connect(&config).await?;
    let token_store = TokenStore::new(&database);
    let token = token_store.issue(&UserId::from(trimmed), ttl).await?;

    info!(user_id = %trimmed, ttl, "issued connection token");
    println!("{token}");

    Ok(())
}

fn init_observability() -> Option<logfire::ShutdownGuard> {
    // Check if LOGFIRE_TOKEN is empty/missing, if so, directly use fallback
    if let Ok(token) = std::env::var("LOGFIRE_TOKEN") {
        if token.trim().is_empty() {
            observability::set_otel_layers_enabled(false);
            init_tracing_fallback();
            return None;
        }
    } else {
        observability::set_otel_layers_enabled(false);
        init_tracing_fallback();
        return None;
    }

    let mut builder = logfire::configure()
        .send_to_logfire(SendToLogfire::IfTokenPresent)
        .with_service_name("loomcast-server")
        .with_service_version(env!("CARGO_PKG_VERSION"));

    if let Ok(environment) = std::env::var("LOOMCAST_ENVIRONMENT") {
        builder = builder.with_environment(environment);
    }

    match builder.finish() {
        Ok(logfire) => {
            observability::set_otel_layers_enabled(true);
            Some(logfire.shutdown_guard())
        }
        Err(error) => {
            eprintln!(
                "failed to initialize logfire: {error:?}; falling back to tracing_subscriber"
            );
            init_tracing_fallback();
            tracing::error!(
                ?error,
                "failed to initialize logfire; using tracing_subscriber fallback"
            );
            observability::set_otel_layers_enabled(false);
            None
        }
    }
}

fn init_tracing_fallback() {
    // Fallback logger: emit compact JSON to a rolling file, not stdout.
    // Use RUST_LOG to control level.
    use std::fs;
    observability::set_otel_layers_enabled(false);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Optional override: when LOOMCAST_LOG_TO_STDOUT is set (and not "0"),
    // send logs to stdout instead of a file.
    let log_to_stdout = std::env::var("LOOMCAST_LOG_TO_STDOUT")
        .map(|v| !v.trim().is_empty() && v.trim() != "0")
        .unwrap_or(false);

    if log_to_stdout {
        if tracing_subscriber::fmt()
            .with_env_filter(env_filter.clone())
            .with_ansi(false)
            .json()
            .with_writer(std::io::stdout)
            .try_init()
            .is_ok()
        {
            return;
        }
    }

    let log_dir = std::env::var("LOOMCAST_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    if let Err(err) = fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log dir '{}': {err}", log_dir);
        std::process::exit(1);
    }
    let file_appender = tracing_appender::rolling::daily(&log_dir, "server.log");
    let (writer, guard) = non_blocking(file_appender);

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .json()
        .with_writer(writer)
        .try_init()
        .is_ok()
    {
        let _ = TRACING_FALLBACK_GUARD.set(guard);
    }
}

struct HttpProfiler {
    guard: ProfilerGuard<'static>,
    output_path: PathBuf,
    format: ProfileOutputFormat,
    frequency: i32,
}

impl HttpProfiler {
    fn maybe_start() -> Option<Self> {
        let path = env::var_os("LOOMCAST_PROFILE_PPROF")?;
        let frequency = env::var("LOOMCAST_PROFILE_PPROF_FREQ")
            .ok()
            .and_then(|freq| freq.parse::<i32>().ok())
            .unwrap_or(99)
            .max(1);
        let format = ProfileOutputFormat::from_env();

        match pprof::ProfilerGuardBuilder::default()
            .frequency(frequency)
            .build()
        {
            Ok(guard) => {
                let profiler = Self {
                    guard,
                    output_path: PathBuf::from(path),
                    format,
                    frequency,
                };
                info!(
                    path = %profiler.output_path.display(),
                    frequency = profiler.frequency,
                    format = %profiler.format.as_str(),
                    "pprof profiler enabled"
                );
                Some(profiler)
            }
            Err(err) => {
                warn!(?err, "failed to start pprof profiler");
                None
            }
        }
    }

    fn finish(self) {
        match self.guard.report().build() {
            Ok(report) => {
                if let Err(err) = self.format.write(report, &self.output_path) {
                    warn!(
                        ?err,
                        path = %self.output_path.display(),
                        "failed to write pprof report"
                    );
                } else {
                    info!(
                        path = %self.output_path.display(),
                        format = %self.format.as_str(),
                        "pprof report written"
                    );
                }
            }
            Err(err) => warn!(?err, "failed to build pprof report"),
        }
    }
}

enum ProfileOutputFormat {
    Flamegraph,
    Protobuf,
}

impl ProfileOutputFormat {
    fn from_env() -> Self {
        match env::var("LOOMCAST_PROFILE_PPROF_FORMAT")
            .unwrap_or_else(|_| "flamegraph".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "proto" | "protobuf" | "pprof" => Self::Protobuf,
            _ => Self::Flamegraph,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Flamegraph => "flamegraph",
            Self::Protobuf => "protobuf",
        }
    }

    fn write(&self, report: pprof::Report, path: &Path) -> anyhow::Result<()> {
        match self {
            Self::Flamegraph => {
                let mut file = File::create(path)?;
                report.flamegraph(&mut file)?;
            }
            Self::Protobuf => {
                let profile = report.pprof()?;
                let mut file = File::create(path)?;
                profile.write_to_writer(&mut file)?;
            }
        }
        Ok(())
    }
}

enum EnvLoadStatus {
    Loaded(PathBuf),
    NotFound,
    Failed(DotenvError),
}

fn load_env_file() -> EnvLoadStatus {
    if let Ok(env_file) = std::env::var("LOOMCAST_ENV_FILE") {
        let trimmed = env_file.trim();
        if !trimmed.is_empty() {
            let path = PathBuf::from(trimmed);
            return match from_filename(&path) {
                Ok(_) => {
                    let display_path = make_relative(&path).unwrap_or_else(|| path.clone());
                    EnvLoadStatus::Loaded(display_path)
                }
                Err(err) => EnvLoadStatus::Failed(err),
            };
        }
    }

    match dotenv() {
        Ok(path) => {
            let display_path = make_relative(&path).unwrap_or_else(|| path.clone());
            EnvLoadStatus::Loaded(display_path)
        }
        Err(DotenvError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            EnvLoadStatus::NotFound
        }
        Err(err) => EnvLoadStatus::Failed(err),
    }
}

fn report_env_status(status: &EnvLoadStatus) {
    match status {
        EnvLoadStatus::Loaded(path) => {
            info!("Loaded environment variables from {}", path.display());
        }
        EnvLoadStatus::NotFound => {
            info!("No .env file found; using process environment only");
        }
        EnvLoadStatus::Failed(err) => {
            warn!("Failed to load .env file: {err:?}");
        }
    }
}

fn make_relative(path: &Path) -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    path.strip_prefix(&cwd).map(|p| p.to_path_buf()).ok()
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = term.recv() => {},
            _ = int.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
