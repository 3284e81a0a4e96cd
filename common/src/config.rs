use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_RECONCILE_INTERVAL_MS;

/// Operator configuration for one fleet. Immutable once the watcher starts.
///
/// Persisted as JSON at `~/.raleigh/config.json`; missing fields take the
/// defaults below, unknown fields are ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub project: String,
    pub zone: String,
    pub instance_type: String,
    /// Fleet size; node ids range over `[0, num_nodes)`.
    pub num_nodes: usize,
    /// Quorum required to form an active group.
    pub num_active: usize,
    pub node_prefix: String,
    pub username: String,
    /// Local source tree to mirror onto each node.
    pub repo_path: String,
    pub remote_repo_path: String,
    pub install_command: String,
    pub run_command: String,
    pub installer_version: String,
    pub preemptible: bool,
    pub spot: bool,
    /// Delay between reconcile cycles, in milliseconds.
    pub reconcile_interval_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            project: String::new(),
            zone: "us-central2-b".into(),
            instance_type: "v4-8".into(),
            num_nodes: 2,
            num_active: 2,
            node_prefix: "hobby".into(),
            username: "raleigh".into(),
            repo_path: "./workload".into(),
            remote_repo_path: "~/workload".into(),
            install_command: "~/.local/bin/uv sync".into(),
            run_command: "~/.local/bin/uv run -m workload".into(),
            installer_version: "0.0.1".into(),
            preemptible: false,
            spot: false,
            reconcile_interval_ms: DEFAULT_RECONCILE_INTERVAL_MS,
        }
    }
}

impl FleetConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_nodes == 0 {
            bail!("num_nodes must be positive");
        }
        if self.num_active == 0 {
            bail!("num_active must be positive");
        }
        if self.num_active > self.num_nodes {
            bail!(
                "num_active ({}) cannot exceed num_nodes ({})",
                self.num_active,
                self.num_nodes
            );
        }
        if self.project.is_empty() {
            bail!("project is not set");
        }
        Ok(())
    }

    /// Node name for a numeric id, e.g. `hobby3`.
    pub fn node_name(&self, id: usize) -> String {
        format!("{}{}", self.node_prefix, id)
    }

    /// `repo_path` with a leading `~` expanded against the local home
    /// directory. Remote paths are left for the remote shell to expand.
    pub fn local_repo_path(&self) -> PathBuf {
        expand_home(&self.repo_path)
    }

    pub fn load(path: &Path) -> anyhow::Result<FleetConfig> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: FleetConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }

    /// Load the config at `path`, or write the defaults there when absent.
    pub fn load_or_init(path: &Path) -> anyhow::Result<FleetConfig> {
        if path.exists() {
            Self::load(path)
        } else {
            let cfg = FleetConfig::default();
            cfg.save(path)?;
            Ok(cfg)
        }
    }
}

/// Default config location: `~/.raleigh/config.json`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine home directory")?;
    Ok(home.join(".raleigh").join("config.json"))
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
