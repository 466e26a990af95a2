use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the SQLite database file inside the store directory. Kept stable
/// so binary backups can read the file directly.
pub const SQLITE_FILE: &str = "db.sqlite";

/// Subdirectory holding the consensus log and stable state.
pub const RAFT_DIR: &str = "raft";

/// Subdirectory holding binary snapshots.
pub const SNAPSHOT_DIR: &str = "snapshots";

/// Per-node store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Cluster-unique node id. Any non-empty string.
    pub id: String,
    /// Network endpoint advertised to peers.
    pub addr: String,
    /// Root directory for the raft log, snapshots and (file mode) the
    /// SQLite database.
    pub dir: PathBuf,
    /// Keep the SQL state in memory instead of on disk. The raft log is
    /// always durable.
    pub in_memory: bool,
    /// Minimum number of uncompacted log entries before a snapshot is
    /// eligible.
    pub snapshot_threshold: u64,
    /// Minimum pause between snapshot checks.
    pub snapshot_interval: Duration,
    /// How long a proposal may wait for commit + apply.
    pub apply_timeout: Duration,
    /// Raft heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
    /// Raft election timeout bounds in milliseconds.
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
}

impl StoreConfig {
    pub fn new(id: &str, addr: &str, dir: &Path) -> Self {
        Self {
            id: id.to_string(),
            addr: addr.to_string(),
            dir: dir.to_path_buf(),
            in_memory: false,
            snapshot_threshold: 8192,
            snapshot_interval: Duration::from_secs(30),
            apply_timeout: Duration::from_secs(10),
            heartbeat_interval: 100,
            election_timeout_min: 200,
            election_timeout_max: 300,
        }
    }

    pub fn in_memory(mut self, yes: bool) -> Self {
        self.in_memory = yes;
        self
    }

    pub fn sqlite_path(&self) -> Option<PathBuf> {
        if self.in_memory {
            None
        } else {
            Some(self.dir.join(SQLITE_FILE))
        }
    }

    pub fn raft_path(&self) -> PathBuf {
        self.dir.join(RAFT_DIR)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_DIR)
    }
}
