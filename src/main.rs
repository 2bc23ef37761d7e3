use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docwire::config::Config;
use docwire::ConfigError;
use docwire::utils::{format_bytes, format_duration};
use docwire::{Client, Operation, OperationResult, ServerState};
use serde_json::json;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

#[derive(Parser)]
#[command(name = "docwire")]
#[command(about = "Client core for a document database wire protocol")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where a command takes its client settings from
#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct Source {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Connection string, e.g. mongodb://db1,db2:27018/?appName=cli
    #[arg(short, long)]
    uri: Option<String>,
}

impl Source {
    fn load(&self) -> Result<Config> {
        match (&self.config, &self.uri) {
            (Some(path), _) => Config::load_from_file(path)
                .with_context(|| format!("Failed to load config from {:?}", path)),
            (None, Some(uri)) => Config::from_uri(uri).context("Invalid connection string"),
            (None, None) => bail!("either --config or --uri is required"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Send a ping command and report the round trip
    Ping {
        #[command(flatten)]
        source: Source,
        /// Database to run the ping against
        #[arg(short, long, default_value = "admin")]
        database: String,
    },
    /// Probe every endpoint and print the server table
    Status {
        #[command(flatten)]
        source: Source,
    },
    /// Generate example configuration files
    Config {
        /// Configuration mode (single or replica-set)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ping { source, database } => ping(source.load()?, database).await,
        Commands::Status { source } => status(source.load()?).await,
        Commands::Config { mode, output } => generate_config(mode, output),
        Commands::Validate { config } => validate_config(config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

async fn ping(config: Config, database: String) -> Result<()> {
    init_logging(&config)?;

    let client = Client::new(config)?;
    client.startup().await?;

    let operation = Operation::Command {
        database,
        command: json!({ "ping": 1 }),
        retryable: true,
    };
    let started = Instant::now();
    let result = client.execute(&operation, None).await;
    let elapsed = started.elapsed();
    client.shutdown();

    match result? {
        OperationResult::Command(reply) => {
            println!("✓ ping ok in {} ({})", format_duration(elapsed), reply);
            Ok(())
        }
        other => bail!("unexpected ping result: {:?}", other),
    }
}

async fn status(config: Config) -> Result<()> {
    init_logging(&config)?;

    let client = Client::new(config)?;
    client.startup().await?;

    println!("{:<28} {:<12} {:<10} {:>10}  {}", "ENDPOINT", "STATE", "ROLE", "RTT", "ERROR");
    for server in client.topology().descriptions() {
        let rtt = server
            .round_trip_time
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<28} {:<12} {:<10} {:>10}  {}",
            server.endpoint.to_string(),
            format!("{:?}", server.state),
            format!("{:?}", server.role),
            rtt,
            server.last_error.as_deref().unwrap_or("")
        );
    }

    let reachable = client
        .topology()
        .descriptions()
        .iter()
        .any(|server| server.state == ServerState::Connected);
    client.shutdown();

    if !reachable {
        bail!("no endpoint is reachable");
    }
    Ok(())
}

fn generate_config(mode: String, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, &mode).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  docwire status --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  App name: {}", config.client.app_name);
            println!("  Read preference: {}", config.client.read_preference);
            println!(
                "  Pool size: {}..{}",
                config.pool.min_pool_size, config.pool.max_pool_size
            );
            println!(
                "  Max message size: {}",
                format_bytes(config.client.max_message_size_bytes as u64)
            );
            println!("  Endpoints: {} instances", config.client.endpoints.len());
            for (i, endpoint) in config.client.endpoints.iter().enumerate() {
                println!("    {}: {}", i + 1, endpoint);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
                ConfigError::UnknownOption { section, key } => {
                    eprintln!("  Unknown option '{}' in {}", key, section)
                }
            }
            Err(e.into())
        }
    }
}

fn show_version() {
    println!("docwire v{}", env!("CARGO_PKG_VERSION"));
    println!("Client core for a document database wire protocol");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Bounded connection pools with FIFO wait queues");
    println!("  • Background server monitoring and latency-aware selection");
    println!("  • Single retry of transient failures");
}

fn init_logging(config: &Config) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.compact().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
