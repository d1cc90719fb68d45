//! LocalBlobs - Local Blob Storage Emulation Server
//!
//! Serves a hosted blob store's HTTP API from a local directory.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use localblobs::config::{LocalBlobsConfig, LoggingConfig, Secret, ServerConfig};
use localblobs::error::Result;
use localblobs::server::BlobsServer;

/// LocalBlobs - Local Blob Storage Emulation Server
#[derive(Parser)]
#[command(name = "localblobs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "LOCALBLOBS_CONFIG")]
    config: Option<PathBuf>,

    /// Storage root directory
    #[arg(short, long, env = "LOCALBLOBS_DIRECTORY")]
    directory: Option<PathBuf>,

    /// Host to bind
    #[arg(long, env = "LOCALBLOBS_HOST")]
    host: Option<String>,

    /// Port to listen on (0 = ephemeral)
    #[arg(short, long, env = "LOCALBLOBS_PORT")]
    port: Option<u16>,

    /// Shared secret clients must present
    #[arg(long, env = "LOCALBLOBS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log every request
    #[arg(long, env = "LOCALBLOBS_DEBUG")]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOCALBLOBS_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, env = "LOCALBLOBS_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the blob server (default)
    Start,

    /// Write a starter configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "localblobs.toml")]
        output: PathBuf,
    },

    /// Validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init { ref output }) => run_init(output),
        Some(Commands::Validate) => run_validate(&cli),
        Some(Commands::Start) | None => run_start(&cli).await,
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Merge the optional config file with command line overrides
fn load_config(cli: &Cli) -> Result<LocalBlobsConfig> {
    let mut config = match &cli.config {
        Some(path) => LocalBlobsConfig::from_file(path)?,
        None => LocalBlobsConfig {
            server: ServerConfig::new(".blobs"),
            logging: LoggingConfig::default(),
        },
    };

    if let Some(directory) = &cli.directory {
        config.server.directory = directory.clone();
    }
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(token) = &cli.token {
        config.server.token = Some(Secret::new(token.clone()));
    }
    if cli.debug {
        config.server.debug = true;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Start the blob server and run until Ctrl-C
async fn run_start(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    init_logging(&config.logging);

    let authenticated = config.server.token.is_some();
    let mut server = BlobsServer::new(config.server);
    let info = server.start().await?;

    tracing::info!(
        "LocalBlobs ready at {} ({}, port {}, {})",
        info.url,
        info.family,
        info.port,
        if authenticated { "token required" } else { "anonymous" }
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    tracing::info!("Shutting down...");
    server.stop().await
}

/// Write a starter configuration file
fn run_init(output: &PathBuf) -> Result<()> {
    let config_content = r#"# LocalBlobs Configuration
# Generated configuration file

[server]
directory = ".blobs"
host = "0.0.0.0"
port = 0
# token = "changeme"
debug = false
max_body_bytes = 536870912

[logging]
level = "info"
format = "pretty"
"#;

    std::fs::write(output, config_content)?;
    println!("✓ Configuration written to {:?}", output);
    println!("  Edit the file to set the storage directory and token");
    Ok(())
}

/// Validate the merged configuration
fn run_validate(cli: &Cli) -> Result<()> {
    match load_config(cli) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Directory: {}", config.server.directory.display());
            println!("  Listen: {}:{}", config.server.host, config.server.port);
            println!(
                "  Auth: {}",
                if config.server.token.is_some() { "token" } else { "anonymous" }
            );
            println!("  Logging: {} ({})", config.logging.level, config.logging.format);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
