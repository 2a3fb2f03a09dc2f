//! A peer whose executable path is absent from the trust allow-list is
//! authenticated, found untrusted, and has its connection dropped before any
//! cgroup is ever created for it.

use std::io::Read;
use std::time::Duration;

mod common;
use common::*;

#[test]
fn untrusted_peer_connection_is_closed() {
    if !is_root() {
        eprintln!("skipping: e2e daemon tests require root to start metric-gatewayd");
        return;
    }

    // Empty allow-list: nothing, including this test binary, is trusted.
    let harness = spawn_daemon(DaemonOptions {
        allow_list: "",
        ..Default::default()
    });

    let mut stream = connect_as_peer(&harness.socket_path);
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).expect("read from intake socket");
    assert_eq!(n, 0, "untrusted peer's connection should be closed (EOF), not serve data");

    // The cgroup this peer would have been assigned to was never created.
    let job = current_job_label();
    let cgroup_dir = harness.cgroup_root.join("metric_gateway").join(&job);
    assert!(
        !cgroup_dir.exists(),
        "untrusted peer must never get a cgroup created for it"
    );
}
