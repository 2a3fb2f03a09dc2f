//! Shared test harness for the metric gateway's black-box e2e tests.
//!
//! ## Daemon binary selection
//!
//! Tests exec the built `metric-gatewayd` binary, resolved relative to the
//! workspace's `target/debug` directory. Override with the
//! `METRIC_GATEWAY_DAEMON_BINARY` environment variable to point at a
//! different build.
//!
//! ## Fake cgroup filesystem
//!
//! The daemon's cgroup handling is a thin filesystem adapter over whatever
//! directory `METRIC_GATEWAY_CGROUP_ROOT` points at (see
//! `gateway_engine::config`); the real production default is the host's
//! cgroup v2 mount. Tests point this at a disposable tempdir and run a
//! background thread that plays the part of the kernel: once the daemon
//! creates a container's cgroup directory, the thread drops in the handful
//! of accounting files `LinuxCGroup::read_counters` expects
//! (`cpu.stat`, `memory.current`, ...), then later empties `cgroup.procs`
//! to simulate the peer process exiting.
//!
//! ## Root requirement
//!
//! The daemon refuses to start unless its effective user is root (see
//! §6/§7 of the spec it implements). Tests that need the daemon to run
//! successfully check [`is_root`] and skip with a message if not; the
//! root-check test itself works either way by dropping privileges with
//! `Command::uid` when running as root.
//!
//! ## Automatic daemon log printing on test failure
//!
//! A panic hook installed once via `#[ctor::ctor]` when this library loads
//! checks thread-local storage for the current test's daemon log paths and,
//! if set, prints the last 50 lines of stdout/stderr before handing off to
//! the default hook. Every e2e test file links against this module, so the
//! hook is active for all of them without any per-test setup.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

static PORT_COUNTER: AtomicU32 = AtomicU32::new(0);
const BASE_PORT: u32 = 52_000;

thread_local! {
    static DAEMON_LOG_FILES: RefCell<Option<(PathBuf, PathBuf)>> = const { RefCell::new(None) };
}

static PANIC_HOOK_INIT: Once = Once::new();

#[ctor::ctor]
fn init_panic_hook() {
    install_panic_hook();
}

fn install_panic_hook() {
    PANIC_HOOK_INIT.call_once(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            DAEMON_LOG_FILES.with(|logs| {
                if let Some((stdout_path, stderr_path)) = logs.borrow().as_ref() {
                    eprintln!("\n========== DAEMON LOGS (test failed) ==========");
                    print_log_tail("stdout", stdout_path, 50);
                    print_log_tail("stderr", stderr_path, 50);
                    eprintln!("================================================\n");
                }
            });
            default_hook(panic_info);
        }));
    });
}

fn print_log_tail(label: &str, path: &Path, lines: usize) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(lines);
    eprintln!("--- last {lines} lines of {label} ({path:?}) ---");
    for line in &all[start..] {
        eprintln!("{line}");
    }
}

/// Whether this test process's effective user is root.
pub fn is_root() -> bool {
    // SAFETY: geteuid takes no arguments and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Resolves the daemon binary, defaulting to the workspace's debug build.
pub fn daemon_binary() -> PathBuf {
    if let Ok(path) = std::env::var("METRIC_GATEWAY_DAEMON_BINARY") {
        return PathBuf::from(path);
    }
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../target/debug/metric-gatewayd")
}

/// A unique TCP port per test, avoiding collisions between parallel tests.
fn unique_port() -> u32 {
    BASE_PORT + (PORT_COUNTER.fetch_add(1, Ordering::SeqCst) % 4_000)
}

/// Options for [`spawn_daemon`].
pub struct DaemonOptions<'a> {
    pub allow_list: &'a str,
    pub monitor_interval: &'a str,
    pub persistence_file: Option<&'a Path>,
    /// When dropping privileges for a test daemon, the uid to drop to.
    /// `None` runs the daemon as whatever user spawned the test.
    pub drop_to_uid: Option<u32>,
}

impl Default for DaemonOptions<'_> {
    fn default() -> Self {
        Self {
            allow_list: "",
            monitor_interval: "50ms",
            persistence_file: None,
            drop_to_uid: None,
        }
    }
}

/// A running daemon instance plus everything a test needs to talk to it.
/// Killed and its socket/cgroup tempdir removed when dropped.
pub struct DaemonHarness {
    child: Child,
    pub socket_path: PathBuf,
    pub scrape_addr: String,
    pub cgroup_root: PathBuf,
    _tempdir: tempfile::TempDir,
}

impl DaemonHarness {
    /// Sends `SIGTERM` and waits (with a timeout) for the process to exit,
    /// returning its exit status. Used to exercise the documented graceful
    /// shutdown path (servers stop, socket removed, store flushed) rather
    /// than a hard kill.
    pub fn terminate_gracefully(&mut self, timeout: Duration) -> std::process::ExitStatus {
        // SAFETY: kill(2) with a valid pid and SIGTERM performs no memory access.
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return status;
            }
            if Instant::now() >= deadline {
                panic!("daemon did not exit within {timeout:?} of SIGTERM");
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for DaemonHarness {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Starts the daemon against a fresh tempdir (socket and cgroup root live
/// under it, plus a persistence file unless the caller points elsewhere),
/// and waits for the intake socket to come up. Panics on failure — every
/// e2e test needs a live daemon to proceed.
pub fn spawn_daemon(opts: DaemonOptions) -> DaemonHarness {
    let tempdir = tempfile::tempdir().expect("create tempdir for daemon harness");
    let socket_path = tempdir.path().join("gateway.sock");
    let cgroup_root = tempdir.path().join("cgroup");
    std::fs::create_dir_all(&cgroup_root).unwrap();
    let port = unique_port();

    let stdout_log = tempdir.path().join("daemon.stdout.log");
    let stderr_log = tempdir.path().join("daemon.stderr.log");
    DAEMON_LOG_FILES.with(|logs| {
        *logs.borrow_mut() = Some((stdout_log.clone(), stderr_log.clone()));
    });

    let mut cmd = Command::new(daemon_binary());
    cmd.arg("--web.listen-address")
        .arg(format!("127.0.0.1:{port}"))
        .arg("--socket.path")
        .arg(&socket_path)
        .arg("--trust.path")
        .arg(opts.allow_list)
        .arg("--monitor.interval")
        .arg(opts.monitor_interval)
        .env("METRIC_GATEWAY_CGROUP_ROOT", &cgroup_root)
        .env("RUST_LOG", "debug")
        .stdout(Stdio::from(std::fs::File::create(&stdout_log).expect("create daemon stdout log")))
        .stderr(Stdio::from(std::fs::File::create(&stderr_log).expect("create daemon stderr log")));

    if let Some(file) = opts.persistence_file {
        cmd.arg("--persistence.file").arg(file);
        cmd.arg("--persistence.interval").arg("100ms");
    }

    if let Some(uid) = opts.drop_to_uid {
        use std::os::unix::process::CommandExt;
        cmd.uid(uid);
    }

    let child = cmd.spawn().expect("spawn metric-gatewayd");

    let harness = DaemonHarness {
        child,
        socket_path,
        scrape_addr: format!("127.0.0.1:{port}"),
        cgroup_root,
        _tempdir: tempdir,
    };
    wait_for_socket(&harness.socket_path, Duration::from_secs(5));
    harness
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if UnixStream::connect(path).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("intake socket {path:?} never came up within {timeout:?}");
}

/// Connects to the daemon's intake socket as a peer, simulating a
/// container runtime announcing itself. Kernel-reported `SO_PEERCRED`
/// identifies the peer as this test process, so the caller's allow-list
/// must include [`current_exe_path`] for the connection to be trusted.
pub fn connect_as_peer(socket_path: &Path) -> UnixStream {
    UnixStream::connect(socket_path).expect("connect to intake socket")
}

/// This test binary's own absolute executable path, suitable for an
/// allow-list entry or for deriving the expected `job` label
/// (`"{basename}_{pid}"`).
pub fn current_exe_path() -> String {
    std::env::current_exe()
        .unwrap()
        .canonicalize()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

/// The `job` label this test process would be assigned if connected as a
/// trusted peer: `"{exe_basename}_{pid}"`.
pub fn current_job_label() -> String {
    let exe = current_exe_path();
    let basename = exe.rsplit('/').next().unwrap_or(&exe);
    format!("{basename}_{}", std::process::id())
}

/// Issues a bare-bones HTTP/1.1 GET and returns the response body. Good
/// enough for polling the scrape endpoint without pulling in an HTTP
/// client dependency purely for test plumbing. Panics on failure; use
/// [`try_http_get`] when the server may not be up yet.
pub fn http_get(addr: &str, path: &str) -> String {
    try_http_get(addr, path).expect("GET against scrape server")
}

fn try_http_get(addr: &str, path: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").as_bytes())?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response.split("\r\n\r\n").nth(1).unwrap_or("").to_string())
}

/// Polls the scrape endpoint until `predicate` matches the response body
/// or `timeout` elapses, returning the last body seen. Tolerates the
/// server not accepting connections yet (retries instead of panicking).
pub fn wait_for_scrape(addr: &str, path: &str, timeout: Duration, predicate: impl Fn(&str) -> bool) -> String {
    let deadline = Instant::now() + timeout;
    let mut last = String::new();
    while Instant::now() < deadline {
        if let Ok(body) = try_http_get(addr, path) {
            last = body;
            if predicate(&last) {
                return last;
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    last
}

/// Background "fake kernel" for one container's cgroup: waits for the
/// daemon to create `{cgroup_root}/metric_gateway/{job_id}`, seeds it with
/// a plausible accounting snapshot, then (after two rounds of
/// `present_for`) empties `cgroup.procs` so the next sampling tick
/// observes the peer as gone and tombstones its series.
pub fn simulate_fake_cgroup(cgroup_root: PathBuf, job_id: String, present_for: Duration) {
    std::thread::spawn(move || {
        let dir = cgroup_root.join("metric_gateway").join(&job_id);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !dir.is_dir() {
            if Instant::now() >= deadline {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        write_counter_files(&dir, 12_345);
        std::thread::sleep(present_for);
        // Bump the cpu counter once more so a second sampling tick, if one
        // lands before the exit write below, observes a nonzero rate.
        write_counter_files(&dir, 54_321);
        std::thread::sleep(present_for);
        let _ = std::fs::write(dir.join("cgroup.procs"), "");
    });
}

fn write_counter_files(dir: &Path, cpu_usage_usec: u64) {
    let _ = std::fs::write(dir.join("cpu.stat"), format!("usage_usec {cpu_usage_usec}\n"));
    let _ = std::fs::write(dir.join("memory.current"), "1048576\n");
    let _ = std::fs::write(dir.join("memory.max"), "max\n");
    let _ = std::fs::write(dir.join("memory.swap.current"), "0\n");
    let _ = std::fs::write(dir.join("memory.swap.max"), "max\n");
    let _ = std::fs::write(dir.join("memory.stat"), "slab 4096\nkernel_stack 8192\n");
    let _ = std::fs::write(dir.join("pids.current"), "3\n");
    let _ = std::fs::write(dir.join("pids.max"), "64\n");
}
