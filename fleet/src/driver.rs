//! Thin synchronous adapter over the `gcloud compute tpus tpu-vm` CLI.
//!
//! Every operation blocks until the CLI returns and surfaces a classified
//! `DriverError`. The driver never retries; recovery belongs to the
//! reconciler's next cycle.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::debug;

use common::error::DriverError;
use common::schemas::DescribeRaw;

use crate::node::{NodeInfo, NodeLifecycle};
use crate::runner::{CommandOutput, CommandRunner};

const NOT_FOUND_PREFIX: &str = "ERROR: (gcloud.compute.tpus.tpu-vm.describe) NOT_FOUND:";
const NO_FILE_MARKER: &str = "No such file or directory";
const NO_PROCESS_MARKER: &str = "No such process";

pub struct NodeDriver {
    project: String,
    zone: String,
    instance_type: String,
    node_name: String,
    preemptible: bool,
    spot: bool,
    runner: Arc<dyn CommandRunner>,
}

impl NodeDriver {
    pub fn new(
        project: &str,
        zone: &str,
        instance_type: &str,
        node_name: &str,
        preemptible: bool,
        spot: bool,
        runner: Arc<dyn CommandRunner>,
    ) -> NodeDriver {
        NodeDriver {
            project: project.into(),
            zone: zone.into(),
            instance_type: instance_type.into(),
            node_name: node_name.into(),
            preemptible,
            spot,
            runner,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    fn gcloud(&self, args: Vec<String>) -> Result<CommandOutput, DriverError> {
        Ok(self.runner.run("gcloud", &args)?)
    }

    fn base_args(&self, verb: &str) -> Vec<String> {
        vec![
            "compute".into(),
            "tpus".into(),
            "tpu-vm".into(),
            verb.into(),
        ]
    }

    fn scope_args(&self) -> Vec<String> {
        vec![
            "--project".into(),
            self.project.clone(),
            "--zone".into(),
            self.zone.clone(),
        ]
    }

    /// Describe the node. A NOT_FOUND answer is the `Nonexistent` lifecycle,
    /// not an error.
    pub fn describe(&self) -> Result<(NodeInfo, NodeLifecycle), DriverError> {
        let mut args = self.base_args("describe");
        args.push(self.node_name.clone());
        args.extend(self.scope_args());
        args.extend(["--format".into(), "json".into()]);

        let out = self.gcloud(args)?;
        if !out.success() {
            if out.stderr.starts_with(NOT_FOUND_PREFIX) {
                return Ok((NodeInfo::default(), NodeLifecycle::Nonexistent));
            }
            return Err(DriverError::failed(
                format!("describe {}", self.node_name),
                out.code,
                out.stderr,
            ));
        }

        let raw: DescribeRaw = serde_json::from_str(&out.stdout)
            .map_err(|e| DriverError::Any(anyhow::anyhow!("parsing describe output: {e}")))?;
        let lifecycle = NodeLifecycle::from_state(&raw.state);
        Ok((NodeInfo::from_describe(&raw), lifecycle))
    }

    /// Issue the create call. Returns when the CLI returns, which is before
    /// the node reaches `Ready`.
    pub fn create(&self) -> Result<(), DriverError> {
        let mut args = self.base_args("create");
        args.push(self.node_name.clone());
        args.extend(self.scope_args());
        args.extend([
            "--accelerator-type".into(),
            self.instance_type.clone(),
            "--version".into(),
            "tpu-ubuntu2204-base".into(),
        ]);
        if self.preemptible {
            args.push("--preemptible".into());
        }
        if self.spot {
            args.push("--spot".into());
        }

        debug!(node = %self.node_name, "creating node");
        let out = self.gcloud(args)?;
        if !out.success() {
            return Err(DriverError::failed(
                format!("create {}", self.node_name),
                out.code,
                out.stderr,
            ));
        }
        Ok(())
    }

    /// Idempotent teardown.
    pub fn delete(&self) -> Result<(), DriverError> {
        let mut args = self.base_args("delete");
        args.push(self.node_name.clone());
        args.extend(self.scope_args());
        args.push("--quiet".into());

        debug!(node = %self.node_name, "deleting node");
        let out = self.gcloud(args)?;
        if !out.success() && !out.stderr.contains("NOT_FOUND") {
            return Err(DriverError::failed(
                format!("delete {}", self.node_name),
                out.code,
                out.stderr,
            ));
        }
        Ok(())
    }

    /// Synchronous remote command execution over `gcloud ssh`.
    pub fn run_remote(&self, user: &str, command: &str) -> Result<CommandOutput, DriverError> {
        let mut args = self.base_args("ssh");
        args.push(format!("{user}@{}", self.node_name));
        args.extend(self.scope_args());
        args.extend(["--command".into(), command.into()]);
        self.gcloud(args)
    }

    /// Like `run_remote`, but a non-zero exit becomes a `CommandFailed`.
    pub fn run_remote_checked(&self, user: &str, command: &str) -> Result<(), DriverError> {
        let out = self.run_remote(user, command)?;
        if !out.success() {
            return Err(DriverError::failed(
                format!("remote command on {}", self.node_name),
                out.code,
                out.stderr,
            ));
        }
        Ok(())
    }

    /// Remote `cat`, with the missing-file case classified separately so
    /// callers can branch on it. Trailing newline is trimmed.
    pub fn read_remote_file(&self, user: &str, path: &str) -> Result<String, DriverError> {
        let out = self.run_remote(user, &format!("cat {path}"))?;
        if !out.success() {
            if out.stderr.contains(NO_FILE_MARKER) {
                return Err(DriverError::NoFile(path.into()));
            }
            return Err(DriverError::failed(
                format!("read {path} on {}", self.node_name),
                out.code,
                out.stderr,
            ));
        }
        let mut text = out.stdout;
        if text.ends_with('\n') {
            text.pop();
        }
        Ok(text)
    }

    /// Copy a local file or tree to the node via `gcloud scp`.
    pub fn copy_to(&self, user: &str, local: &str, remote: &str, recurse: bool) -> Result<(), DriverError> {
        let mut args = self.base_args("scp");
        if recurse {
            args.push("--recurse".into());
        }
        args.push(local.into());
        args.push(format!("{user}@{}:{remote}", self.node_name));
        args.extend(self.scope_args());

        let out = self.gcloud(args)?;
        if !out.success() {
            return Err(DriverError::failed(
                format!("scp to {}", self.node_name),
                out.code,
                out.stderr,
            ));
        }
        Ok(())
    }

    /// Copy a remote file back to the operator machine.
    pub fn copy_from(&self, user: &str, remote: &str, local: &str) -> Result<(), DriverError> {
        let mut args = self.base_args("scp");
        args.push(format!("{user}@{}:{remote}", self.node_name));
        args.push(local.into());
        args.extend(self.scope_args());

        let out = self.gcloud(args)?;
        if !out.success() {
            return Err(DriverError::failed(
                format!("scp from {}", self.node_name),
                out.code,
                out.stderr,
            ));
        }
        Ok(())
    }

    /// Mirror a directory tree over rsync/ssh. Requires the node's external
    /// IP, so the node must be `Ready`.
    pub fn rsync_tree(&self, user: &str, local: &str, remote: &str, external_ip: &str) -> Result<(), DriverError> {
        if external_ip.is_empty() {
            return Err(DriverError::Any(anyhow::anyhow!(
                "node {} has no external ip; cannot rsync",
                self.node_name
            )));
        }
        let args = vec![
            "-avz".to_string(),
            format!("{}/", local.trim_end_matches('/')),
            format!("{user}@{external_ip}:{remote}"),
            "-e".into(),
            "ssh -i ~/.ssh/google_compute_engine -o StrictHostKeyChecking=no".into(),
        ];
        let out = self.runner.run("rsync", &args)?;
        if !out.success() {
            return Err(DriverError::failed(
                format!("rsync to {}", self.node_name),
                out.code,
                out.stderr,
            ));
        }
        Ok(())
    }

    /// Send a termination signal and poll until the process is gone.
    /// "No such process" at any point reads as success.
    pub fn signal_process(
        &self,
        user: &str,
        pid: i32,
        retry_interval: Duration,
        retry_budget: u32,
    ) -> Result<(), DriverError> {
        for attempt in 0..=retry_budget {
            let out = self.run_remote(user, &format!("kill {pid}"))?;
            if !out.success() {
                if out.stderr.contains(NO_PROCESS_MARKER) {
                    return Ok(());
                }
                return Err(DriverError::failed(
                    format!("kill {pid} on {}", self.node_name),
                    out.code,
                    out.stderr,
                ));
            }
            if attempt < retry_budget {
                thread::sleep(retry_interval);
            }
        }
        Err(DriverError::Any(anyhow::anyhow!(
            "process {pid} on {} survived {} kill attempts",
            self.node_name,
            retry_budget
        )))
    }
}
