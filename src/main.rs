//! Tollgate CLI - run the metered LLM gateway.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tollgate::admission::{InMemoryWindowStore, RedisWindowStore, SlidingWindowStore};
use tollgate::api::{create_router_with_state, AppState};
use tollgate::config::{AdmissionConfig, Config, LogFormat, LogVerbosity};
use tollgate::secrets::{CredentialCipher, CredentialDecryptor, NoCredentialKey};
use tollgate::store::GatewayDb;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(about = "Metered LLM gateway with admission control and usage billing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Usage log verbosity (defaults to the config file setting)
        #[arg(short, long, value_enum)]
        log_level: Option<LogLevel>,

        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show current configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Print the stored form of a BYOM credential under the configured key
    EncryptCredential {
        /// Plaintext upstream credential
        plaintext: String,

        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogLevel {
    Minimal,
    Compact,
    Verbose,
}

impl From<LogLevel> for LogVerbosity {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Minimal => LogVerbosity::Minimal,
            LogLevel::Compact => LogVerbosity::Compact,
            LogLevel::Verbose => LogVerbosity::Verbose,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { port, log_level, config }) => {
            run_server(port, log_level, config).await?;
        }
        Some(Commands::Config { path }) => {
            show_config(path)?;
        }
        Some(Commands::EncryptCredential { plaintext, config }) => {
            encrypt_credential(&plaintext, config)?;
        }
        None => {
            run_server(None, None, None).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    Ok(config.with_env_overrides())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }
}

async fn run_server(
    port_override: Option<u16>,
    log_level: Option<LogLevel>,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(level) = log_level {
        config.logging.verbosity = level.into();
    }
    init_tracing(config.logging.format);

    let port = port_override.unwrap_or(config.gateway.port);

    let db = GatewayDb::open(&config.storage.database_path).with_context(|| {
        format!("opening database at {}", config.storage.database_path.display())
    })?;
    let window_store = select_window_store(&config.admission).await;
    let decryptor = credential_decryptor(&config)?;
    let backend = window_store.backend();

    let state = AppState::new(&config, Arc::new(db), window_store, decryptor)?;
    let app = create_router_with_state(state);

    let listener = tokio::net::TcpListener::bind((config.gateway.host.as_str(), port)).await?;
    let addr = listener.local_addr()?;

    match config.logging.verbosity {
        LogVerbosity::Minimal => {
            println!("tollgate:{}", addr.port());
        }
        LogVerbosity::Compact => {
            println!("→ Tollgate starting on http://{}", addr);
            println!("→ Gateway API: http://{}/llm", addr);
        }
        LogVerbosity::Verbose => {
            println!("────────────────────────────────────────");
            println!("Tollgate v{}", env!("CARGO_PKG_VERSION"));
            println!("────────────────────────────────────────");
            println!("Gateway:    http://{}", addr);
            println!("Chat:       http://{}/llm/chat/completions", addr);
            println!("Embeddings: http://{}/llm/embeddings", addr);
            println!("Usage:      http://{}/llm/usage", addr);
            println!("Health:     http://{}/health", addr);
            println!("────────────────────────────────────────");
            println!("Upstream:   {}", config.upstream.base_url);
            println!("Database:   {}", config.storage.database_path.display());
            println!("Window:     {}", backend);
            println!("────────────────────────────────────────");
        }
    }

    tracing::info!(%addr, window_store = backend, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    println!("\nGateway stopped.");
    Ok(())
}

/// Redis when configured and reachable, otherwise the in-process window.
async fn select_window_store(config: &AdmissionConfig) -> Arc<dyn SlidingWindowStore> {
    let Some(url) = config.redis_url.as_deref() else {
        tracing::info!("No redis_url configured; using in-memory rate-limit window");
        return Arc::new(InMemoryWindowStore::new());
    };

    let store = match RedisWindowStore::new(url) {
        Ok(store) => store.with_prefix(config.redis_prefix.clone()),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid redis_url; falling back to in-memory rate-limit window");
            return Arc::new(InMemoryWindowStore::new());
        }
    };

    match store.ping().await {
        Ok(()) => {
            tracing::info!("Using Redis rate-limit window");
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redis unreachable; falling back to in-memory rate-limit window");
            Arc::new(InMemoryWindowStore::new())
        }
    }
}

fn credential_decryptor(config: &Config) -> anyhow::Result<Arc<dyn CredentialDecryptor>> {
    match config.secrets.credential_key.as_deref() {
        Some(key) => {
            let cipher = CredentialCipher::from_base64(key).context("loading [secrets] credential_key")?;
            Ok(Arc::new(cipher))
        }
        None => {
            tracing::warn!("No credential_key configured; external models with credentials will fail");
            Ok(Arc::new(NoCredentialKey))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

fn show_config(show_path: bool) -> anyhow::Result<()> {
    if show_path {
        println!("{}", Config::default_path().display());
        return Ok(());
    }

    let mut config = Config::load()?.with_env_overrides();
    if config.secrets.credential_key.is_some() {
        config.secrets.credential_key = Some("<redacted>".to_string());
    }
    if config.upstream.api_key.is_some() {
        config.upstream.api_key = Some("<redacted>".to_string());
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn encrypt_credential(plaintext: &str, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let key = config
        .secrets
        .credential_key
        .as_deref()
        .context("no [secrets] credential_key configured (set TOLLGATE_CREDENTIAL_KEY)")?;
    let cipher = CredentialCipher::from_base64(key)?;
    println!("{}", cipher.encrypt(plaintext)?);
    Ok(())
}
