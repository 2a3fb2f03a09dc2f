//! Peer-authenticated UNIX-socket listener: identifies the connecting
//! process, checks it against the trust allow-list, and spawns a
//! [`crate::monitor::MonitorWorker`] for every accepted, trusted peer.

pub mod peer;
pub mod trust;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::cgroup::linux::LinuxCGroup;
use crate::domain::ContainerDescriptor;
use crate::error::{GatewayError, Result};
use crate::host_info::HostInfo;
use crate::monitor::{IntervalTickSource, MonitorWorker, Outcome};
use crate::store::StoreHandle;

/// Dependencies a listener needs to authenticate peers and spawn workers.
#[derive(Clone)]
pub struct ListenerConfig {
    pub allow_list: Vec<String>,
    pub cgroup_root: PathBuf,
    pub store: StoreHandle,
    pub host: HostInfo,
    pub monitor_interval: Duration,
}

/// Wraps a credential-carrying UNIX-socket listener. Accepted connections
/// that pass authentication are forwarded on `conn_rx` for the HTTP server
/// fronting this listener to consume; every spawned worker's terminal
/// outcome is forwarded on `done_rx` or `err_rx`.
pub struct PeerAuthListener {
    conn_rx: mpsc::Receiver<UnixStream>,
    pub done_rx: mpsc::Receiver<ContainerDescriptor>,
    pub err_rx: mpsc::Receiver<(ContainerDescriptor, GatewayError)>,
}

impl PeerAuthListener {
    /// Binds `socket_path`, removing any stale socket file first, and spawns
    /// the accept loop as a background task.
    pub async fn bind(socket_path: &Path, config: ListenerConfig) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GatewayError::PermissionDenied(e.to_string()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755));
            }
        }
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .map_err(|e| GatewayError::PermissionDenied(e.to_string()))?;
        }

        let listener = UnixListener::bind(socket_path)
            .map_err(|e| GatewayError::PermissionDenied(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o777))
                .map_err(|e| GatewayError::PermissionDenied(e.to_string()))?;
        }

        let (conn_tx, conn_rx) = mpsc::channel(128);
        let (done_tx, done_rx) = mpsc::channel(128);
        let (err_tx, err_rx) = mpsc::channel(128);

        tokio::spawn(accept_loop(listener, config, conn_tx, done_tx, err_tx));

        Ok(Self {
            conn_rx,
            done_rx,
            err_rx,
        })
    }

    /// Splits this listener into its authenticated-connection stream and its
    /// two worker-outcome receivers, for callers that need all three.
    ///
    /// The connection stream's items are wrapped in `io::Result` (always
    /// `Ok` — the channel only ever carries already-accepted streams) so it
    /// satisfies the `Stream<Item = Result<IO, E>>` bound `hyper`'s
    /// `accept::from_stream` requires.
    pub fn into_parts(
        self,
    ) -> (
        impl Stream<Item = std::io::Result<UnixStream>> + Send + 'static,
        mpsc::Receiver<ContainerDescriptor>,
        mpsc::Receiver<(ContainerDescriptor, GatewayError)>,
    ) {
        let conn_stream = tokio_stream::wrappers::ReceiverStream::new(self.conn_rx)
            .map(Ok::<UnixStream, std::io::Error>);
        (conn_stream, self.done_rx, self.err_rx)
    }
}

async fn accept_loop(
    listener: UnixListener,
    config: ListenerConfig,
    conn_tx: mpsc::Sender<UnixStream>,
    done_tx: mpsc::Sender<ContainerDescriptor>,
    err_tx: mpsc::Sender<(ContainerDescriptor, GatewayError)>,
) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                warn!(error = %e, "failed to accept connection on intake socket");
                continue;
            }
        };

        match authenticate(&stream, &config.allow_list) {
            Ok(exe_path) => {
                let pid = match peer::peer_pid(&stream) {
                    Ok(pid) => pid,
                    Err(e) => {
                        warn!(error = %e, "failed to re-read peer pid after authentication");
                        continue;
                    }
                };
                let descriptor = ContainerDescriptor::new(pid, exe_path);
                spawn_worker(descriptor, &config, done_tx.clone(), err_tx.clone());

                // The connection is handed to the HTTP server purely as a
                // liveness channel; the intake pipeline never reads from it.
                if conn_tx.send(stream).await.is_err() {
                    break;
                }
            }
            Err(AuthFailure::Untrusted(exe_path)) => {
                info!(exe = %exe_path, "closing connection from untrusted peer");
                drop(stream);
            }
            Err(AuthFailure::Fatal(e)) => {
                warn!(error = %e, "closing connection after authentication failure");
                drop(stream);
            }
        }
    }
}

enum AuthFailure {
    Untrusted(String),
    Fatal(GatewayError),
}

fn authenticate(stream: &UnixStream, allow_list: &[String]) -> std::result::Result<String, AuthFailure> {
    let pid = peer::peer_pid(stream).map_err(AuthFailure::Fatal)?;
    let _proc_dir = peer::open_proc_dir(pid).map_err(AuthFailure::Fatal)?;
    peer::verify_peer_alive(pid).map_err(AuthFailure::Fatal)?;
    let exe_path = peer::read_exe_path(pid).map_err(AuthFailure::Fatal)?;

    if trust::is_trusted(allow_list, &exe_path) {
        Ok(exe_path)
    } else {
        Err(AuthFailure::Untrusted(exe_path))
    }
}

fn spawn_worker(
    descriptor: ContainerDescriptor,
    config: &ListenerConfig,
    done_tx: mpsc::Sender<ContainerDescriptor>,
    err_tx: mpsc::Sender<(ContainerDescriptor, GatewayError)>,
) {
    let cgroup = Arc::new(LinuxCGroup::new(&config.cgroup_root, &descriptor.id));
    let tick_source = IntervalTickSource::new(config.monitor_interval);
    let worker = MonitorWorker::new(
        descriptor,
        cgroup,
        tick_source,
        config.store.clone(),
        config.host,
    );

    tokio::spawn(async move {
        match worker.run().await {
            Outcome::Completed(descriptor) => {
                info!(id = %descriptor.id, "monitor worker completed");
                let _ = done_tx.send(descriptor).await;
            }
            Outcome::Failed(descriptor, error) => {
                tracing::error!(id = %descriptor.id, error = %error, "monitor worker failed");
                let _ = err_tx.send((descriptor, error)).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_rejects_untrusted_current_process_path() {
        // The allow-list never contains this test binary's own exe path, so
        // authenticate() must classify it as untrusted rather than fatal.
        let pid = std::process::id();
        let exe = peer::read_exe_path(pid).unwrap();
        assert!(!trust::is_trusted(&[], &exe));
    }
}
