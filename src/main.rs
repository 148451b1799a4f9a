use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcpchain::{Config, DhcpServer, LeaseAllocator, LeaseState, LeaseStore, Result};

#[derive(Parser)]
#[command(name = "dhcpchain")]
#[command(author, version, about = "A DHCP server driven by a chain of option backends", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve DHCP on port 67 (default)
    Run,
    /// Print the effective configuration
    ShowConfig,
    /// Print the lease file
    ListLeases,
    /// Delete expired dynamic leases
    CleanupLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);
            let mut server = DhcpServer::new(config).await?;

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let store = LeaseStore::open(&config.leases_file).await?;

            if store.is_empty() {
                println!("No leases.");
                return Ok(());
            }

            println!(
                "{:<18} {:<16} {:<8} {:<24} {:<10}",
                "MAC Address", "IP Address", "State", "Expires At", "Remaining"
            );
            println!("{}", "-".repeat(80));

            let mut leases: Vec<_> = store.leases().collect();
            leases.sort_by_key(|lease| lease.ip);

            for lease in leases {
                let state = match (lease.state, lease.static_binding) {
                    (_, true) => "static",
                    (LeaseState::Offered, false) => "offered",
                    (LeaseState::Bound, false) => "bound",
                    (LeaseState::Released, false) => "released",
                };
                let (expires, remaining) = match (lease.expires_at, lease.remaining_seconds()) {
                    (Some(expires_at), Some(remaining)) => (
                        expires_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                        if remaining > 0 {
                            format!("{}s", remaining)
                        } else {
                            "expired".to_string()
                        },
                    ),
                    _ => ("never".to_string(), "-".to_string()),
                };

                println!(
                    "{:<18} {:<16} {:<8} {:<24} {:<10}",
                    lease.mac.to_string(),
                    lease.ip.to_string(),
                    state,
                    expires,
                    remaining
                );
            }

            Ok(())
        }
        Commands::CleanupLeases => {
            let store = LeaseStore::open(&config.leases_file).await?;
            let mut allocator = LeaseAllocator::new(store, config.offer_timeout_seconds);
            let count = allocator.sweep_expired().await?;
            println!("Cleaned up {} expired lease(s).", count);
            Ok(())
        }
    }
}
