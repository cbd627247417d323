//! chronosctl - Chronos control utility

mod ipc;

use crate::ipc::IpcClient;
use anyhow::Result;
use clap::{Parser, Subcommand};

/// Chronos control utility
#[derive(Parser)]
#[command(name = "chronosctl", version, about = "Control the Chronos time daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Socket path
    #[arg(long, default_value = "/run/chronos/chronos.sock")]
    socket: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current tracking (reference) status
    Tracking,

    /// Show per-source statistics
    Sources,

    /// Force an immediate poll cycle on every source
    Sync,

    /// Request an immediate time step if the offset is at least `threshold` seconds
    MakeStep {
        #[arg(default_value_t = 1.0)]
        threshold: f64,
    },

    /// Show full daemon status
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = IpcClient::new(&cli.socket);

    match cli.command {
        Commands::Tracking => {
            let status = client.get_tracking_status().await?;
            println!("Tracking Status");
            println!("===============");
            println!(
                "Synchronised:    {}",
                if status.is_synchronised { "yes" } else { "no" }
            );
            println!("Leap:            {}", status.leap);
            println!("Stratum:         {}", status.stratum);
            println!("Reference ID:    {:08x}", status.ref_id);
            println!("Reference time:  {:.3}", status.ref_time_unix);
            println!("Root delay:      {:.6} s", status.root_delay);
            println!("Root dispersion: {:.6} s", status.root_dispersion);
        }

        Commands::Sources => {
            let sources = client.get_sources().await?;
            println!("{:<24} {:>7} {:>6} {:>12} {:>12}", "Address", "Stratum", "Reach", "Offset", "Dispersion");
            for s in &sources {
                println!(
                    "{:<24} {:>7} {:>06b} {:>12.6} {:>12.6}",
                    s.address, s.stratum, s.reach, s.offset, s.dispersion
                );
            }
        }

        Commands::Sync => {
            println!("Forcing synchronization cycle...");
            client.force_sync().await?;
            let status = client.get_tracking_status().await?;
            println!(
                "Synchronised: {} stratum={}",
                if status.is_synchronised { "yes" } else { "no" },
                status.stratum
            );
        }

        Commands::MakeStep { threshold } => match client.make_step(threshold).await {
            Ok(()) => println!("Step requested"),
            Err(e) => println!("Step not performed: {e}"),
        },

        Commands::Info => {
            let status = client.get_daemon_status().await?;
            println!("Chronos Daemon Status");
            println!("=====================");
            println!("Version:         {}", status.version);
            println!();
            println!("Tracking:");
            println!(
                "  Synchronised:  {}",
                if status.tracking.is_synchronised { "yes" } else { "no" }
            );
            println!("  Stratum:       {}", status.tracking.stratum);
            println!("  Reference ID:  {:08x}", status.tracking.ref_id);
            println!("  Root delay:    {:.6} s", status.tracking.root_delay);
            println!();
            println!("Sources: {}", status.sources.len());
            for s in &status.sources {
                println!("  {} (stratum {})", s.address, s.stratum);
            }
        }
    }

    Ok(())
}
