//! Wires every component together: intake and scrape HTTP servers,
//! signal-driven graceful shutdown, and the aggregated error channel.

use std::io::Read;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use hyper::server::accept;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::host_info::HostInfo;
use crate::listener::{ListenerConfig, PeerAuthListener};
use crate::store::{PersistenceConfig, StoreHandle};

/// Runs the daemon to completion: binds both servers, waits for a shutdown
/// signal or a fatal server error, then tears everything down in the order
/// documented in the concurrency model (servers, then socket file, then
/// store).
pub async fn run(config: GatewayConfig, host: HostInfo) -> Result<()> {
    let persistence = config.persistence_file.clone().map(|file| PersistenceConfig {
        file,
        min_interval: config.persistence_interval,
    });
    let store = crate::store::spawn(persistence)?;

    let listener_config = ListenerConfig {
        allow_list: config.allow_list.clone(),
        cgroup_root: config.cgroup_root.clone(),
        store: store.clone(),
        host,
        monitor_interval: config.monitor_interval,
    };

    let peer_listener = PeerAuthListener::bind(&config.socket_path, listener_config).await?;

    // Split outcome channels out before handing the listener to the intake
    // server (it only needs the authenticated-connection stream from here).
    let (conn_stream, mut done_rx, mut err_rx) = peer_listener.into_parts();

    let shutdown = CancellationToken::new();
    let (server_err_tx, mut server_err_rx) = tokio::sync::mpsc::channel::<GatewayError>(4);

    let intake_shutdown = shutdown.clone();
    let intake_err_tx = server_err_tx.clone();
    let intake_handle = tokio::spawn(async move {
        let app = build_app(None);
        let result = axum::Server::builder(accept::from_stream(conn_stream))
            .http1_header_read_timeout(Duration::from_secs(1))
            .serve(app.into_make_service())
            .with_graceful_shutdown(intake_shutdown.cancelled())
            .await;
        if let Err(e) = result {
            let _ = intake_err_tx.send(GatewayError::ServerError(e.to_string())).await;
        }
    });

    let scrape_registry = build_process_registry()?;
    let scrape_state = ScrapeState {
        store: store.clone(),
        registry: scrape_registry,
    };
    let scrape_addr = resolve_listen_address(&config.web_listen_address)?;
    let scrape_listener = TcpListener::bind(scrape_addr)
        .await
        .map_err(|e| GatewayError::ServerError(e.to_string()))?;
    info!(addr = %scrape_addr, "scrape server listening");

    let scrape_shutdown = shutdown.clone();
    let scrape_err_tx = server_err_tx.clone();
    let route_prefix = config.route_prefix.clone();
    let telemetry_path = config.web_telemetry_path.clone();
    let scrape_handle = tokio::spawn(async move {
        let app = build_app(Some((route_prefix, telemetry_path, scrape_state)));
        let result = axum::Server::from_tcp(scrape_listener.into_std().expect("tcp listener"))
            .expect("axum server from std listener")
            .http1_header_read_timeout(Duration::from_secs(1))
            .serve(app.into_make_service())
            .with_graceful_shutdown(scrape_shutdown.cancelled())
            .await;
        if let Err(e) = result {
            let _ = scrape_err_tx.send(GatewayError::ServerError(e.to_string())).await;
        }
    });
    drop(server_err_tx);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| GatewayError::ServerError(e.to_string()))?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
        Some(error) = server_err_rx.recv() => {
            error!(error = %error, "fatal server error, shutting down");
        }
        Some(descriptor) = done_rx.recv() => {
            info!(id = %descriptor.id, "monitor worker completed (lifecycle event, not fatal)");
            // Lifecycle events don't trigger shutdown; keep waiting.
            wait_for_real_shutdown(&shutdown, &mut done_rx, &mut err_rx, &mut server_err_rx, &mut sigterm).await;
        }
        Some((descriptor, error)) = err_rx.recv() => {
            error!(id = %descriptor.id, error = %error, "monitor worker failed (not fatal to the daemon)");
            wait_for_real_shutdown(&shutdown, &mut done_rx, &mut err_rx, &mut server_err_rx, &mut sigterm).await;
        }
    }

    // 1. stop both HTTP servers
    shutdown.cancel();
    let _ = intake_handle.await;
    let _ = scrape_handle.await;

    // 2. remove the UNIX socket file
    let _ = std::fs::remove_file(&config.socket_path);

    // 3. shut down the metric store (final persistence flush)
    store.shutdown().await
}

/// Waits out worker lifecycle events forever until an actual shutdown
/// trigger (signal or fatal server error) arrives.
async fn wait_for_real_shutdown(
    _shutdown: &CancellationToken,
    done_rx: &mut tokio::sync::mpsc::Receiver<crate::domain::ContainerDescriptor>,
    err_rx: &mut tokio::sync::mpsc::Receiver<(crate::domain::ContainerDescriptor, GatewayError)>,
    server_err_rx: &mut tokio::sync::mpsc::Receiver<GatewayError>,
    sigterm: &mut tokio::signal::unix::Signal,
) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => { info!("received SIGINT, shutting down"); return; }
            _ = sigterm.recv() => { info!("received SIGTERM, shutting down"); return; }
            Some(error) = server_err_rx.recv() => { error!(error = %error, "fatal server error, shutting down"); return; }
            Some(descriptor) = done_rx.recv() => {
                info!(id = %descriptor.id, "monitor worker completed");
            }
            Some((descriptor, error)) = err_rx.recv() => {
                error!(id = %descriptor.id, error = %error, "monitor worker failed");
            }
        }
    }
}

fn resolve_listen_address(raw: &str) -> Result<std::net::SocketAddr> {
    let normalized = if let Some(port) = raw.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        raw.to_string()
    };
    normalized
        .parse()
        .map_err(|e: std::net::AddrParseError| GatewayError::ServerError(e.to_string()))
}

fn build_process_registry() -> Result<Registry> {
    let registry = Registry::new();
    let process_collector = prometheus::process_collector::ProcessCollector::for_self();
    registry
        .register(Box::new(process_collector))
        .map_err(|e| GatewayError::ServerError(e.to_string()))?;
    Ok(registry)
}

#[derive(Clone)]
struct ScrapeState {
    store: StoreHandle,
    registry: Registry,
}

fn build_app(scrape: Option<(String, String, ScrapeState)>) -> Router {
    let router = match scrape {
        Some((prefix, path, state)) => {
            let route = format!("{prefix}{path}");
            Router::new().route(&route, get(scrape_handler)).with_state(state)
        }
        None => Router::new().fallback(intake_fallback),
    };
    router.layer(middleware::from_fn(decode_content_encoding))
}

async fn intake_fallback() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn scrape_handler(State(state): State<ScrapeState>) -> impl IntoResponse {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "failed to encode process metrics");
    }

    let snapshot = state.store.gather().await;
    buffer.extend_from_slice(snapshot.render().as_bytes());

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer)
}

/// Decompresses a request body whose `Content-Encoding` is `gzip` or
/// `snappy` (case-insensitive) before handing it to the router.
async fn decode_content_encoding(req: Request<Body>, next: Next<Body>) -> std::result::Result<Response, StatusCode> {
    let encoding = req
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase());

    let (mut parts, body) = req.into_parts();
    let bytes = hyper::body::to_bytes(body)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let decoded = match encoding.as_deref() {
        Some("gzip") => decode_gzip(&bytes).map_err(|_| StatusCode::BAD_REQUEST)?,
        Some("snappy") => decode_snappy(&bytes).map_err(|_| StatusCode::BAD_REQUEST)?,
        _ => bytes.to_vec(),
    };

    parts.headers.remove(header::CONTENT_ENCODING);
    let new_req = Request::from_parts(parts, Body::from(decoded));
    Ok(next.run(new_req).await)
}

fn decode_gzip(bytes: &Bytes) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(&bytes[..]);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn decode_snappy(bytes: &Bytes) -> std::io::Result<Vec<u8>> {
    let mut decoder = snap::read::FrameDecoder::new(&bytes[..]);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_bare_port_to_all_interfaces() {
        let addr = resolve_listen_address(":9091").unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:9091");
    }

    #[test]
    fn resolves_explicit_host_and_port() {
        let addr = resolve_listen_address("127.0.0.1:9091").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:9091");
    }
}
