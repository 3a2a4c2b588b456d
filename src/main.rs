use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ip6cfgd::daemon::{Daemon, DaemonOptions};
use tracing::{error, info};

/// Per-interface IPv6 address-configuration daemon.
#[derive(Parser)]
#[command(name = "ip6cfgd", version)]
struct Args {
    /// Preferences file seeded into the dynamic store at startup.
    #[arg(long)]
    preferences: Option<PathBuf>,

    /// Kernel poll interval in seconds (link status, address lists).
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("starting ip6cfgd");

    let daemon = match Daemon::new(DaemonOptions {
        preferences: args.preferences,
        poll_interval: Duration::from_secs(args.poll_interval),
    }) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to initialize");
            error!("Do you have root privileges? Try running with 'sudo'.");
            std::process::exit(1);
        }
    };

    // Everything runs on one thread; socket readers and resolver tasks are
    // local tasks on this set.
    let local = tokio::task::LocalSet::new();
    if let Err(e) = local.run_until(daemon.run()).await {
        error!(error = %e, "daemon error");
    }

    info!("stopped");
}
