use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use qgcp::config::EngineConfig;
use qgcp::engine::{Engine, TableRegistry};
use qgcp::gcp::client::ApiClient;
use qgcp::gcp::scopes::{self, Scope, ScopeCatalog};
use qgcp::gcp::auth;
use qgcp::plugin;
use qgcp::tables;

/// Version injected at compile time via QGCP_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("QGCP_VERSION") {
    Some(v) => v,
    None => "dev",
};

/// GCP resource-catalog query engine plugin
#[derive(Parser, Debug)]
#[command(name = "qgcp", version, about, long_about = None)]
struct Args {
    /// Restrict the fan-out to a single GCP project (skips discovery)
    #[arg(short, long)]
    project: Option<String>,

    /// Path to the engine config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off")]
    log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

/// Logging goes to a file; stdout carries the host protocol.
fn setup_logging(level: LogLevel) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let tracing_level = level.to_tracing_level()?;

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .expect("Failed to open log file");

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_max_level(tracing_level)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("qgcp {} started with log level: {:?}", VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Some(guard)
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("qgcp").join("qgcp.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".qgcp").join("qgcp.log");
    }
    PathBuf::from("qgcp.log")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level);

    let config = EngineConfig::load(args.config.as_deref());

    // Step 1: credentials
    let client = Arc::new(ApiClient::new().await?);

    // Step 2: resolve the scope set for this connection
    let catalog = Arc::new(ScopeCatalog::new());
    if let Some(project) = &args.project {
        catalog.prime(vec![Scope::new(project)]).await;
        tracing::info!("Using explicit project: {}", project);
    } else {
        match scopes::discover(&client).await {
            Ok(discovered) if !discovered.is_empty() => {
                catalog.prime(discovered).await;
            },
            Ok(_) | Err(_) => {
                // Discovery can fail on restricted credentials; fall back to
                // the configured default project.
                let Some(project) = auth::get_default_project() else {
                    anyhow::bail!(
                        "No accessible projects found. Set GOOGLE_CLOUD_PROJECT or use --project"
                    );
                };
                tracing::warn!(
                    "Project discovery failed, falling back to default project {}",
                    project
                );
                catalog.prime(vec![Scope::new(&project)]).await;
            },
        }
    }

    // Step 3: register table schemas
    let mut registry = TableRegistry::new();
    tables::register_all(&client, &mut registry)?;
    tracing::info!("Registered tables: {:?}", registry.names());

    // Step 4: serve the host connection
    let engine = Engine::new(config, Arc::new(registry), catalog);
    plugin::serve(engine).await
}
