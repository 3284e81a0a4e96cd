//! Per-node state inspector and mutator.
//!
//! An installer is rebuilt every reconcile cycle: construction observes the
//! node (describe + remote file reads) and derives `installed`, `cloned` and
//! `running_pid`; the mutators move the node toward the desired state. There
//! is no persistent in-process state machine.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use common::config::FleetConfig;
use common::constants::{
    INSTALL_VERSION_FILE, KILL_RETRY_BUDGET, KILL_RETRY_INTERVAL_MS, PID_FILE,
    RENDEZVOUS_FILE, RENDEZVOUS_TMP_FILE, REPO_VERSION_FILE, STATE_DIR, WORKLOAD_LOG_FILE,
};
use common::error::DriverError;
use common::fingerprint::dir_fingerprint;
use common::schemas::RendezvousInfo;

use crate::driver::NodeDriver;
use crate::node::{NodeInfo, NodeLifecycle};
use crate::runner::CommandRunner;

pub struct NodeInstaller {
    cfg: FleetConfig,
    driver: NodeDriver,
    pub lifecycle: NodeLifecycle,
    pub info: NodeInfo,
    pub installed: bool,
    pub cloned: bool,
    /// Fingerprint currently recorded on the node; empty when none.
    pub repo_hash: String,
    pub running_pid: Option<i32>,
}

impl NodeInstaller {
    /// Observe one node and derive its state. Fails when the node cannot be
    /// described; a `Ready` node additionally has its remote files read.
    pub fn observe(
        cfg: &FleetConfig,
        id: usize,
        runner: Arc<dyn CommandRunner>,
    ) -> anyhow::Result<NodeInstaller> {
        let driver = NodeDriver::new(
            &cfg.project,
            &cfg.zone,
            &cfg.instance_type,
            &cfg.node_name(id),
            cfg.preemptible,
            cfg.spot,
            runner,
        );
        let (node_info, lifecycle) = driver
            .describe()
            .with_context(|| format!("describing {}", cfg.node_name(id)))?;

        let mut installer = NodeInstaller {
            cfg: cfg.clone(),
            driver,
            lifecycle,
            info: node_info,
            installed: false,
            cloned: false,
            repo_hash: String::new(),
            running_pid: None,
        };

        if lifecycle == NodeLifecycle::Ready {
            installer.installed = installer.check_installed()?;
            let (repo_hash, cloned) = installer.check_cloned()?;
            installer.repo_hash = repo_hash;
            installer.cloned = cloned;
            installer.running_pid = installer.check_running_pid()?;
        }

        Ok(installer)
    }

    pub fn driver(&self) -> &NodeDriver {
        &self.driver
    }

    fn check_installed(&self) -> anyhow::Result<bool> {
        match self
            .driver
            .read_remote_file(&self.cfg.username, INSTALL_VERSION_FILE)
        {
            Ok(version) => Ok(version == self.cfg.installer_version),
            Err(err) if err.is_no_file() => Ok(false),
            Err(err) => Err(err).context("checking installed version"),
        }
    }

    fn check_cloned(&self) -> anyhow::Result<(String, bool)> {
        let local = self.local_fingerprint()?;
        match self
            .driver
            .read_remote_file(&self.cfg.username, REPO_VERSION_FILE)
        {
            Ok(remote) => {
                let matches = remote == local;
                Ok((remote, matches))
            }
            Err(err) if err.is_no_file() => Ok((String::new(), false)),
            Err(err) => Err(err).context("checking repo fingerprint"),
        }
    }

    fn check_running_pid(&self) -> anyhow::Result<Option<i32>> {
        match self.driver.read_remote_file(&self.cfg.username, PID_FILE) {
            Ok(text) => {
                let pid = text
                    .trim()
                    .parse::<i32>()
                    .with_context(|| format!("parsing pid file contents {text:?}"))?;
                Ok(Some(pid))
            }
            Err(err) if err.is_no_file() => Ok(None),
            Err(err) => Err(err).context("reading pid file"),
        }
    }

    /// Fingerprint of the operator's local source tree.
    pub fn local_fingerprint(&self) -> anyhow::Result<String> {
        dir_fingerprint(&self.cfg.local_repo_path())
    }

    /// Install the base toolchain, forward the wandb credential when one is
    /// present locally, and record the installer version. Safe to re-run.
    pub fn install_basics(&mut self) -> anyhow::Result<()> {
        self.driver
            .run_remote_checked(
                &self.cfg.username,
                "curl -LsSf https://astral.sh/uv/install.sh | sh",
            )
            .context("installing toolchain")?;

        if let Some(key) = local_wandb_key() {
            let mut tmp = tempfile::NamedTempFile::new().context("creating temp netrc")?;
            write!(
                tmp,
                "machine api.wandb.ai\n  login user\n  password {key}"
            )
            .context("writing temp netrc")?;
            tmp.flush()?;
            let tmp_path = tmp.path().to_string_lossy().to_string();
            self.driver
                .copy_to(&self.cfg.username, &tmp_path, "~/.netrc", false)
                .context("copying netrc")?;
        }

        self.driver
            .run_remote_checked(
                &self.cfg.username,
                &format!(
                    "mkdir -p {STATE_DIR} && echo '{}' > {}",
                    self.cfg.installer_version, INSTALL_VERSION_FILE
                ),
            )
            .context("writing install version")?;

        self.installed = true;
        info!(node = %self.driver.node_name(), "base toolchain installed");
        Ok(())
    }

    /// Mirror the local tree, run the install command, record the
    /// fingerprint.
    pub fn clone_repo(&mut self) -> anyhow::Result<()> {
        let local = self.cfg.local_repo_path();
        self.driver
            .rsync_tree(
                &self.cfg.username,
                &local.to_string_lossy(),
                &self.cfg.remote_repo_path,
                &self.info.external_ip,
            )
            .context("mirroring source tree")?;

        self.driver
            .run_remote_checked(
                &self.cfg.username,
                &format!("cd {} && {}", self.cfg.remote_repo_path, self.cfg.install_command),
            )
            .context("running install command")?;

        let fingerprint = self.local_fingerprint()?;
        self.driver
            .run_remote_checked(
                &self.cfg.username,
                &format!("echo '{fingerprint}' > {REPO_VERSION_FILE}"),
            )
            .context("writing repo fingerprint")?;

        self.repo_hash = fingerprint;
        self.cloned = true;
        info!(node = %self.driver.node_name(), "source tree mirrored");
        Ok(())
    }

    /// Signal the recorded pid until the process is gone, then remove the
    /// pid file. Idempotent when nothing is running.
    pub fn kill_running_process(&mut self) -> anyhow::Result<()> {
        if let Some(pid) = self.running_pid {
            self.driver
                .signal_process(
                    &self.cfg.username,
                    pid,
                    Duration::from_millis(KILL_RETRY_INTERVAL_MS),
                    KILL_RETRY_BUDGET,
                )
                .context("killing workload process")?;
        }
        self.driver
            .run_remote_checked(&self.cfg.username, &format!("rm -f {PID_FILE}"))
            .context("removing pid file")?;
        self.running_pid = None;
        Ok(())
    }

    /// Launch the configured run command detached, logging to the node and
    /// recording the pid. Absence of the pid file afterwards is a start
    /// failure.
    pub fn start_process(&mut self) -> anyhow::Result<()> {
        let command = format!(
            "cd {} && nohup {} > {} 2>&1 & echo $! > {}",
            self.cfg.remote_repo_path, self.cfg.run_command, WORKLOAD_LOG_FILE, PID_FILE
        );
        self.driver
            .run_remote_checked(&self.cfg.username, &command)
            .context("starting workload")?;

        match self.check_running_pid()? {
            Some(pid) => {
                self.running_pid = Some(pid);
                info!(node = %self.driver.node_name(), pid, "workload started");
                Ok(())
            }
            None => anyhow::bail!(
                "workload on {} failed to start: no pid file",
                self.driver.node_name()
            ),
        }
    }

    /// Ask the node for `k` currently-unused port numbers by binding and
    /// releasing ephemeral sockets remotely.
    pub fn get_unused_ports(&self, k: usize) -> anyhow::Result<Vec<u16>> {
        let probe = format!(
            "python3 -c 'import socket; socks=[socket.socket() for _ in range({k})]; \
             [s.bind((\"\", 0)) for s in socks]; \
             print(\"\\n\".join(str(s.getsockname()[1]) for s in socks)); \
             [s.close() for s in socks]'"
        );
        let out = self
            .driver
            .run_remote(&self.cfg.username, &probe)
            .context("probing for unused ports")?;
        if !out.success() {
            anyhow::bail!(
                "port probe on {} failed: {}",
                self.driver.node_name(),
                out.stderr
            );
        }
        let ports: Vec<u16> = out
            .stdout
            .split_whitespace()
            .map(|line| line.parse::<u16>().context("parsing port number"))
            .collect::<anyhow::Result<_>>()?;
        if ports.len() != k {
            anyhow::bail!(
                "port probe on {} returned {} ports, wanted {k}",
                self.driver.node_name(),
                ports.len()
            );
        }
        Ok(ports)
    }

    /// Serialise the rendezvous record and move it into place atomically:
    /// stage locally, scp to a temp sibling, rename on the node.
    pub fn write_rendezvous_info(&self, rendezvous: &RendezvousInfo) -> anyhow::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new().context("creating temp rendezvous file")?;
        serde_json::to_writer(&mut tmp, rendezvous).context("serialising rendezvous info")?;
        tmp.flush()?;
        let tmp_path = tmp.path().to_string_lossy().to_string();

        self.driver
            .copy_to(&self.cfg.username, &tmp_path, RENDEZVOUS_TMP_FILE, false)
            .context("copying rendezvous file")?;
        self.driver
            .run_remote_checked(
                &self.cfg.username,
                &format!("mv {RENDEZVOUS_TMP_FILE} {RENDEZVOUS_FILE}"),
            )
            .context("renaming rendezvous file")?;
        Ok(())
    }
}

/// Password for `api.wandb.ai` from the local `~/.netrc`, when both exist.
fn local_wandb_key() -> Option<String> {
    let netrc = dirs::home_dir()?.join(".netrc");
    let text = std::fs::read_to_string(netrc).ok()?;
    wandb_key_from_netrc(&text)
}

fn wandb_key_from_netrc(text: &str) -> Option<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut in_machine = false;
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            "machine" => {
                in_machine = tokens.get(i + 1).copied() == Some("api.wandb.ai");
                i += 2;
            }
            "password" if in_machine => return tokens.get(i + 1).map(|s| s.to_string()),
            _ => i += 1,
        }
    }
    None
}
