//! Identity of a connected container, as established at accept time.

/// An authenticated peer, identified once when its connection is accepted.
///
/// `id` is the cgroup leaf name and the store's `job` label for the
/// lifetime of the corresponding monitor worker. Two live peers can never
/// collide on `id` because the kernel guarantees PID uniqueness among live
/// processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub pid: u32,
    pub full_path: String,
    pub exe: String,
    pub id: String,
}

impl ContainerDescriptor {
    /// Builds a descriptor from a peer's PID and its resolved `exe` symlink target.
    pub fn new(pid: u32, full_path: String) -> Self {
        let exe = full_path
            .rsplit('/')
            .next()
            .unwrap_or(&full_path)
            .to_string();
        let id = format!("{exe}_{pid}");
        Self {
            pid,
            full_path,
            exe,
            id,
        }
    }
}
