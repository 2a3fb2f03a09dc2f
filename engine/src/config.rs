//! CLI argument parsing and validated runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::listener::trust::parse_allow_list;

const DEFAULT_SOCKET_PATH: &str = "/run/apptheus/gateway.sock";

/// Mirrors the flag table verbatim, including the deprecated
/// `--monitor.inverval` alias (the upstream flag's original, misspelled
/// name).
#[derive(Parser, Debug, Clone)]
#[command(name = "metric-gatewayd")]
#[command(about = "Container metrics gateway: cgroup sampling and a Prometheus scrape endpoint")]
pub struct CliArgs {
    #[arg(long = "web.listen-address", default_value = ":9091")]
    pub web_listen_address: String,

    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    pub web_telemetry_path: String,

    #[arg(long = "web.external-url", default_value = "")]
    pub web_external_url: String,

    #[arg(long = "web.route-prefix", default_value = "")]
    pub web_route_prefix: String,

    #[arg(long = "persistence.file", default_value = "")]
    pub persistence_file: String,

    #[arg(long = "persistence.interval", default_value = "5m")]
    pub persistence_interval: String,

    #[arg(long = "socket.path", default_value = DEFAULT_SOCKET_PATH)]
    pub socket_path: String,

    #[arg(long = "trust.path", default_value = "")]
    pub trust_path: String,

    #[arg(long = "monitor.interval", alias = "monitor.inverval", default_value = "500ms")]
    pub monitor_interval: String,
}

/// The daemon's fully validated runtime configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub web_listen_address: String,
    pub web_telemetry_path: String,
    pub route_prefix: String,
    pub persistence_file: Option<PathBuf>,
    pub persistence_interval: Duration,
    pub socket_path: PathBuf,
    pub allow_list: Vec<String>,
    pub monitor_interval: Duration,
    pub cgroup_root: PathBuf,
}

/// Overrides the cgroup v2 mount point the daemon manages containers under.
/// Not a documented CLI flag — the production default is always
/// [`crate::cgroup::linux::DEFAULT_CGROUP_ROOT`]. Black-box e2e tests set
/// this to point the daemon at a disposable tempdir instead of the host's
/// real cgroup hierarchy.
const CGROUP_ROOT_ENV_VAR: &str = "METRIC_GATEWAY_CGROUP_ROOT";

impl CliArgs {
    pub fn into_config(self) -> Result<GatewayConfig> {
        let monitor_interval = humantime::parse_duration(&self.monitor_interval)
            .map_err(|e| GatewayError::ServerError(format!("invalid --monitor.interval: {e}")))?;
        let persistence_interval = humantime::parse_duration(&self.persistence_interval)
            .map_err(|e| GatewayError::ServerError(format!("invalid --persistence.interval: {e}")))?;

        let persistence_file = if self.persistence_file.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(self.persistence_file.trim()))
        };

        let socket_path = PathBuf::from(self.socket_path.trim());
        if socket_path.as_os_str().is_empty() {
            return Err(GatewayError::ServerError("--socket.path must not be empty".to_string()));
        }

        let allow_list = parse_allow_list(&self.trust_path);

        let route_prefix = normalize_route_prefix(&self.web_route_prefix, &self.web_external_url);

        let cgroup_root = std::env::var(CGROUP_ROOT_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(crate::cgroup::linux::DEFAULT_CGROUP_ROOT));

        Ok(GatewayConfig {
            web_listen_address: self.web_listen_address,
            web_telemetry_path: self.web_telemetry_path,
            route_prefix,
            persistence_file,
            persistence_interval,
            socket_path,
            allow_list,
            monitor_interval,
            cgroup_root,
        })
    }
}

/// If `route_prefix` is empty, falls back to `external_url`'s path. A
/// prefix equal to `"/"` becomes empty; any other non-empty prefix is
/// normalized to start with `/` but not end with one.
fn normalize_route_prefix(route_prefix: &str, external_url: &str) -> String {
    let raw = if route_prefix.is_empty() {
        external_url_path(external_url)
    } else {
        route_prefix.to_string()
    };

    if raw.is_empty() || raw == "/" {
        return String::new();
    }

    let mut prefix = if raw.starts_with('/') {
        raw
    } else {
        format!("/{raw}")
    };
    while prefix.len() > 1 && prefix.ends_with('/') {
        prefix.pop();
    }
    prefix
}

fn external_url_path(external_url: &str) -> String {
    if external_url.is_empty() {
        return String::new();
    }
    match external_url.find("://") {
        Some(scheme_end) => {
            let rest = &external_url[scheme_end + 3..];
            match rest.find('/') {
                Some(path_start) => rest[path_start..].to_string(),
                None => String::new(),
            }
        }
        None => external_url.to_string(),
    }
}

/// Logs a one-time deprecation warning if the caller's raw arguments used
/// the misspelled `--monitor.inverval` flag.
pub fn warn_if_deprecated_flag_used(raw_args: &[String]) {
    if raw_args.iter().any(|a| a.starts_with("--monitor.inverval")) {
        warn!("--monitor.inverval is deprecated, use --monitor.interval instead");
    }
}
