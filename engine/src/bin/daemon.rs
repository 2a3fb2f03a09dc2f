//! Container metrics gateway daemon.
//!
//! Boots the peer-authenticated intake listener and the Prometheus scrape
//! server, then runs until a signal or fatal server error triggers graceful
//! shutdown.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gateway_engine::config::{warn_if_deprecated_flag_used, CliArgs};
use gateway_engine::host_info::HostInfo;

/// Root-check failure and non-root launch both exit with this code, per the
/// daemon's documented exit status (`-1` as a signed byte, `255` unsigned).
const EXIT_PERMISSION_DENIED: i32 = 255;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    if !is_effective_root() {
        tracing::error!("metric-gatewayd must run as root; refusing to start");
        std::process::exit(EXIT_PERMISSION_DENIED);
    }

    let raw_args: Vec<String> = std::env::args().collect();
    warn_if_deprecated_flag_used(&raw_args);

    let args = CliArgs::parse();
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(EXIT_PERMISSION_DENIED);
        }
    };

    let host = match HostInfo::read() {
        Ok(host) => host,
        Err(e) => {
            tracing::error!(error = %e, "failed to read host memory totals");
            std::process::exit(EXIT_PERMISSION_DENIED);
        }
    };

    tracing::info!(
        socket = %config.socket_path.display(),
        scrape = %config.web_listen_address,
        "starting metric gateway daemon"
    );

    match gateway_engine::daemon::run(config, host).await {
        Ok(()) => {
            tracing::info!("shutdown complete");
            std::process::exit(0);
        }
        Err(e) => {
            tracing::error!(error = %e, "daemon exited with error");
            std::process::exit(1);
        }
    }
}

/// Whether the effective user of this process is root. Checked once at
/// startup; the daemon never re-checks privileges afterward.
fn is_effective_root() -> bool {
    // SAFETY: geteuid takes no arguments and cannot fail.
    unsafe { libc::geteuid() == 0 }
}
