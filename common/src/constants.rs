//! Shared paths and tuning knobs.
//!
//! Everything under `~/.raleigh/` on a node is owned by the reconciler; the
//! workload only ever reads `rendezvous.json`.

pub const STATE_DIR: &str = "~/.raleigh";

pub const INSTALL_VERSION_FILE: &str = "~/.raleigh/install-version";
pub const REPO_VERSION_FILE: &str = "~/.raleigh/repo-version";
pub const PID_FILE: &str = "~/.raleigh/running.pid";
pub const WORKLOAD_LOG_FILE: &str = "~/.raleigh/nohup.log";
pub const RENDEZVOUS_FILE: &str = "~/.raleigh/rendezvous.json";
pub const RENDEZVOUS_TMP_FILE: &str = "~/.raleigh/rendezvous.json.tmp";

/// Default delay between reconcile cycles, milliseconds.
pub const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 5_000;

/// Interval between repeated kill attempts while waiting for a remote
/// process to exit.
pub const KILL_RETRY_INTERVAL_MS: u64 = 1_000;

/// Kill attempts before giving up on a remote process.
pub const KILL_RETRY_BUDGET: u32 = 30;

/// Group ids are drawn uniformly from `1..=MAX_GROUP_ID`; zero means no
/// group is live.
pub const MAX_GROUP_ID: i32 = 1_000_000;
