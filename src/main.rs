use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relevo::config::Config;
use relevo::protocol::tcp::TcpConnector;
use relevo::{FailoverSession, SessionStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relevo")]
#[command(about = "Client-side failover engine for MariaDB/MySQL style database topologies")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Relevo Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a failover session against a topology and report what was found
    Probe {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        /// Comma-separated host list overriding the configured one
        #[arg(long)]
        hosts: Option<String>,
        /// Keep the session open and report its status every second for this many seconds
        #[arg(short, long, default_value_t = 0)]
        watch: u64,
    },
    /// Generate example configuration files
    Config {
        /// HA mode (master-only, replication or aurora)
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
        Commands::Probe {
            config,
            hosts,
            watch,
        } => probe(config, hosts, watch).await,
        Commands::Config { mode, output } => generate_config(&mode, output),
        Commands::Validate { config } => validate_config(config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

async fn probe(config_path: PathBuf, hosts: Option<String>, watch: u64) -> Result<()> {
    let mut config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    if let Some(hosts) = hosts {
        config.topology.hosts = relevo::utils::parse_host_list(&hosts).context("Invalid --hosts")?;
    }

    init_logging(&config)?;

    info!("Starting relevo v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!(
        "HA mode: {}, {} candidate hosts",
        config.topology.mode,
        config.topology.hosts.len()
    );

    let connector = Arc::new(TcpConnector::new(config.connect_timeout()));
    let session = relevo::connect(&config, connector)
        .await
        .context("Failed to open a failover session")?;

    print_status(&session.status());
    print_blacklist(&session).await;

    if watch > 0 {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await;
        for _ in 0..watch {
            ticker.tick().await;
            if session.should_reconnect() {
                if let Err(e) = session.reconnect().await {
                    info!("Reconnection attempt failed: {}", e);
                }
            }
            print_status(&session.status());
        }
        print_blacklist(&session).await;
    }

    session.close().await;
    Ok(())
}

fn print_status(status: &SessionStatus) {
    let host = |h: &Option<relevo::HostAddress>| {
        h.as_ref()
            .map(|h| h.to_string())
            .unwrap_or_else(|| "-".to_string())
    };

    println!("Session ({})", status.mode);
    println!("  Current:   {} ({})", host(&status.current_host), status.active);
    println!(
        "  Primary:   {}{}",
        host(&status.primary_host),
        if status.primary_failed { " [failed]" } else { "" }
    );
    println!(
        "  Secondary: {}{}",
        host(&status.secondary_host),
        if status.secondary_failed { " [failed]" } else { "" }
    );
    println!("  Read-only: {}", status.read_only);
    println!(
        "  Attempts:  {}, failover loop {}",
        status.connection_attempts,
        if status.fail_loop_armed { "armed" } else { "idle" }
    );
}

async fn print_blacklist(session: &FailoverSession) {
    let blacklisted = session.blacklist().snapshot().await;
    if blacklisted.is_empty() {
        println!("  Blacklist: empty");
    } else {
        println!("  Blacklist: {} hosts", blacklisted.len());
        for (i, host) in blacklisted.iter().enumerate() {
            println!("    {}: {}", i + 1, host);
        }
    }
}

fn generate_config(mode: &str, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, mode).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  relevo probe --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    let config = match Config::load_from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            eprintln!("  {}", e);
            return Err(e.into());
        }
    };

    println!("✓ Configuration file is valid");
    println!("  HA mode: {}", config.topology.mode);
    println!("  Connect timeout: {}ms", config.topology.connect_timeout_ms);
    println!("  Candidate hosts: {} instances", config.topology.hosts.len());
    for (i, host) in config.topology().hosts().iter().enumerate() {
        println!("    {}: {} ({})", i + 1, host, host.role);
    }

    let failover = &config.failover;
    println!("  Auto reconnect: {}", failover.auto_reconnect);
    println!(
        "  Retry primary after: {}s or {} queries",
        failover.seconds_before_retry_master, failover.queries_before_retry_master
    );
    println!("  Blacklist timeout: {}s", failover.blacklist_timeout_sec);

    Ok(())
}

fn show_version() {
    println!("relevo v{}", env!("CARGO_PKG_VERSION"));
    println!("Client-side failover engine for MariaDB/MySQL style database topologies");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Master-only failover across multi-primary clusters");
    println!("  • Primary/replica read-write splitting with transparent failover");
    println!("  • Aurora-style live role discovery");
    println!("  • Process-wide host blacklist");
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("relevo={}", config.logging.level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
