#![allow(dead_code)]

//! In-memory cloud for reconciler tests.
//!
//! `FakeCloud` implements `CommandRunner` by interpreting the gcloud / rsync
//! command lines the driver emits: nodes are rows in a map, remote files are
//! per-node string maps, and workload processes are pid counters. Tests
//! mutate the fake (stop a node, fail a start) and poll the reconciler's
//! observable effects with `wait_until`.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tempfile::TempDir;

use common::config::FleetConfig;
use fleet::runner::{CommandOutput, CommandRunner};
use fleet::watcher::FleetWatcher;

const NOT_FOUND_STDERR: &str = "ERROR: (gcloud.compute.tpus.tpu-vm.describe) NOT_FOUND: node absent";

#[derive(Clone, Debug, Default)]
pub struct FakeNode {
    /// gcloud state string; `None` means the node does not exist.
    pub state: Option<String>,
    /// Describes remaining before a CREATING node flips to READY.
    pub creating_countdown: u32,
    pub external_ip: String,
    pub internal_ip: String,
    pub files: HashMap<String, String>,
    pub running_pid: Option<i32>,
    /// Force the next describe to fail with this stderr.
    pub describe_error: Option<String>,
    /// Swallow the next workload launch without writing a pid file.
    pub fail_next_start: bool,
    pub started_pids: Vec<i32>,
    pub killed_pids: Vec<i32>,
}

struct CloudState {
    nodes: HashMap<String, FakeNode>,
    next_pid: i32,
    next_port: u16,
}

pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Arc<FakeCloud> {
        Arc::new(FakeCloud {
            state: Mutex::new(CloudState {
                nodes: HashMap::new(),
                next_pid: 4000,
                next_port: 42000,
            }),
        })
    }

    pub fn node(&self, name: &str) -> FakeNode {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn file(&self, name: &str, path: &str) -> Option<String> {
        self.node(name).files.get(path).cloned()
    }

    pub fn with_node(&self, name: &str, f: impl FnOnce(&mut FakeNode)) {
        let mut state = self.state.lock().unwrap();
        let node = state.nodes.entry(name.to_string()).or_default();
        f(node);
    }

    pub fn set_state(&self, name: &str, state_str: &str) {
        self.with_node(name, |node| {
            node.state = Some(state_str.to_string());
        });
    }

    pub fn set_describe_error(&self, name: &str, stderr: Option<&str>) {
        self.with_node(name, |node| {
            node.describe_error = stderr.map(|s| s.to_string());
        });
    }

    pub fn fail_next_start(&self, name: &str) {
        self.with_node(name, |node| node.fail_next_start = true);
    }

    fn describe(&self, name: &str) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        let host_octet = name
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse::<u32>()
            .unwrap_or(0)
            + 1;
        let Some(node) = state.nodes.get_mut(name) else {
            return CommandOutput::err(1, NOT_FOUND_STDERR);
        };
        if let Some(stderr) = node.describe_error.clone() {
            return CommandOutput::err(1, stderr);
        }
        let Some(node_state) = node.state.clone() else {
            return CommandOutput::err(1, NOT_FOUND_STDERR);
        };
        if node_state == "CREATING" {
            if node.creating_countdown == 0 {
                node.state = Some("READY".into());
                if node.external_ip.is_empty() {
                    node.external_ip = format!("34.100.0.{host_octet}");
                    node.internal_ip = format!("10.0.0.{host_octet}");
                }
            } else {
                node.creating_countdown -= 1;
            }
        }
        let node = state.nodes.get(name).unwrap();
        let current = node.state.clone().unwrap_or_default();
        let endpoints = if current == "READY" {
            serde_json::json!([{
                "accessConfig": {"externalIp": node.external_ip},
                "ipAddress": node.internal_ip,
                "port": 8470
            }])
        } else {
            serde_json::json!([])
        };
        let body = serde_json::json!({
            "state": current,
            "acceleratorType": "v4-8",
            "version": "tpu-ubuntu2204-base",
            "health": "HEALTHY",
            "networkEndpoints": endpoints,
            "schedulingConfig": {"preemptible": false}
        });
        CommandOutput::ok(body.to_string())
    }

    fn create(&self, name: &str) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        let node = state.nodes.entry(name.to_string()).or_default();
        if node.state.is_some() {
            return CommandOutput::err(1, "ERROR: already exists");
        }
        node.state = Some("CREATING".into());
        node.creating_countdown = 1;
        CommandOutput::ok("")
    }

    fn delete(&self, name: &str) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        state.nodes.remove(name);
        CommandOutput::ok("")
    }

    fn exec_remote(&self, name: &str, command: &str) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        if !state.nodes.contains_key(name) {
            return CommandOutput::err(255, "ssh: connect failed");
        }

        if command.starts_with("python3 -c") {
            let k = parse_probe_count(command).unwrap_or(0);
            let base = state.next_port;
            state.next_port += k as u16;
            let lines: Vec<String> = (0..k as u16).map(|i| (base + i).to_string()).collect();
            return CommandOutput::ok(lines.join("\n"));
        }

        if command.contains("nohup") {
            let pid = state.next_pid;
            state.next_pid += 1;
            let node = state.nodes.get_mut(name).unwrap();
            if node.fail_next_start {
                node.fail_next_start = false;
                return CommandOutput::ok("");
            }
            node.files
                .insert("~/.raleigh/running.pid".to_string(), pid.to_string());
            node.running_pid = Some(pid);
            node.started_pids.push(pid);
            return CommandOutput::ok("");
        }

        let node = state.nodes.get_mut(name).unwrap();

        if let Some(path) = command.strip_prefix("cat ") {
            return match node.files.get(path.trim()) {
                Some(contents) => CommandOutput::ok(format!("{contents}\n")),
                None => CommandOutput::err(
                    1,
                    format!("cat: {}: No such file or directory", path.trim()),
                ),
            };
        }

        if command.contains("install.sh") {
            return CommandOutput::ok("");
        }

        // `mkdir -p ~/.raleigh && echo 'v' > path` and `echo 'v' > path`
        if let Some(echo_at) = command.find("echo '") {
            if let Some((value, path)) = parse_echo_redirect(&command[echo_at..]) {
                node.files.insert(path, value);
                return CommandOutput::ok("");
            }
        }

        if let Some(path) = command.strip_prefix("rm -f ") {
            node.files.remove(path.trim());
            return CommandOutput::ok("");
        }

        if let Some(rest) = command.strip_prefix("kill ") {
            let pid: i32 = rest.trim().parse().unwrap_or(-1);
            return if node.running_pid == Some(pid) {
                node.running_pid = None;
                node.killed_pids.push(pid);
                CommandOutput::ok("")
            } else {
                CommandOutput::err(1, format!("kill: ({pid}) - No such process"))
            };
        }

        if command.starts_with("mv ") {
            let parts: Vec<&str> = command.split_whitespace().collect();
            if parts.len() == 3 {
                if let Some(contents) = node.files.remove(parts[1]) {
                    node.files.insert(parts[2].to_string(), contents);
                    return CommandOutput::ok("");
                }
                return CommandOutput::err(1, format!("mv: {}: No such file or directory", parts[1]));
            }
        }

        // install command and other `cd &&` shells succeed silently
        if command.starts_with("cd ") {
            return CommandOutput::ok("");
        }

        CommandOutput::err(127, format!("fake cloud: unhandled command {command:?}"))
    }

    fn scp(&self, args: &[String]) -> CommandOutput {
        let positional: Vec<&String> = args
            .iter()
            .skip(4)
            .take_while(|a| *a != "--project")
            .filter(|a| !a.starts_with("--"))
            .collect();
        if positional.len() != 2 {
            return CommandOutput::err(1, "scp: bad arguments");
        }
        // local -> remote when the destination holds the colon
        if let Some((target, remote_path)) = split_remote(positional[1]) {
            let contents = match std::fs::read_to_string(positional[0]) {
                Ok(c) => c,
                Err(e) => return CommandOutput::err(1, format!("scp: {e}")),
            };
            let mut state = self.state.lock().unwrap();
            let Some(node) = state.nodes.get_mut(&target) else {
                return CommandOutput::err(1, "scp: no such node");
            };
            node.files.insert(remote_path, contents);
            return CommandOutput::ok("");
        }
        if let Some((target, remote_path)) = split_remote(positional[0]) {
            let state = self.state.lock().unwrap();
            let Some(node) = state.nodes.get(&target) else {
                return CommandOutput::err(1, "scp: no such node");
            };
            let Some(contents) = node.files.get(&remote_path) else {
                return CommandOutput::err(1, "scp: No such file or directory");
            };
            if let Err(e) = std::fs::write(positional[1], contents) {
                return CommandOutput::err(1, format!("scp: {e}"));
            }
            return CommandOutput::ok("");
        }
        CommandOutput::err(1, "scp: neither side is remote")
    }

    fn rsync(&self, args: &[String]) -> CommandOutput {
        let Some(dest) = args.get(2) else {
            return CommandOutput::err(1, "rsync: bad arguments");
        };
        let Some((user_ip, _path)) = dest.split_once(':') else {
            return CommandOutput::err(1, "rsync: bad destination");
        };
        let Some((_user, ip)) = user_ip.split_once('@') else {
            return CommandOutput::err(1, "rsync: bad destination");
        };
        let state = self.state.lock().unwrap();
        let reachable = state
            .nodes
            .values()
            .any(|n| n.external_ip == ip && n.state.as_deref() == Some("READY"));
        if reachable {
            CommandOutput::ok("")
        } else {
            CommandOutput::err(255, format!("rsync: connection to {ip} refused"))
        }
    }
}

impl CommandRunner for FakeCloud {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        if program == "rsync" {
            return Ok(self.rsync(args));
        }
        if program != "gcloud" {
            return Ok(CommandOutput::err(127, format!("{program}: not found")));
        }
        let verb = args.get(3).map(String::as_str).unwrap_or("");
        let out = match verb {
            "describe" => self.describe(&args[4]),
            "create" => self.create(&args[4]),
            "delete" => self.delete(&args[4]),
            "ssh" => {
                let target = args[4].split('@').nth(1).unwrap_or_default().to_string();
                let command = args
                    .iter()
                    .position(|a| a == "--command")
                    .and_then(|i| args.get(i + 1))
                    .cloned()
                    .unwrap_or_default();
                self.exec_remote(&target, &command)
            }
            "scp" => self.scp(args),
            _ => CommandOutput::err(1, format!("gcloud: unknown verb {verb}")),
        };
        Ok(out)
    }
}

fn split_remote(spec: &str) -> Option<(String, String)> {
    let (user_host, path) = spec.split_once(':')?;
    let (_user, host) = user_host.split_once('@')?;
    Some((host.to_string(), path.to_string()))
}

fn parse_echo_redirect(command: &str) -> Option<(String, String)> {
    let rest = command.strip_prefix("echo '")?;
    let (value, rest) = rest.split_once('\'')?;
    let path = rest.trim().strip_prefix('>')?.trim();
    Some((value.to_string(), path.to_string()))
}

fn parse_probe_count(command: &str) -> Option<usize> {
    let start = command.find("range(")? + "range(".len();
    let end = command[start..].find(')')? + start;
    command[start..end].parse().ok()
}

/// A watcher over a fake cloud, with its update channel drained in the
/// background so reconcilers never block on the rendezvous send.
pub struct TestFleet {
    pub cloud: Arc<FakeCloud>,
    pub watcher: FleetWatcher,
    pub cfg: FleetConfig,
    pub repo: TempDir,
}

impl TestFleet {
    pub fn launch(num_nodes: usize, num_active: usize) -> Result<TestFleet> {
        let repo = TempDir::new()?;
        std::fs::write(repo.path().join("main.py"), "print('workload')\n")?;
        let cfg = FleetConfig {
            project: "test-project".into(),
            num_nodes,
            num_active,
            repo_path: repo.path().to_string_lossy().to_string(),
            reconcile_interval_ms: 10,
            ..FleetConfig::default()
        };
        let cloud = FakeCloud::new();
        let watcher = FleetWatcher::new(cfg.clone(), cloud.clone())?;
        let drain = watcher.updates().clone();
        std::thread::spawn(move || for _ in drain.iter() {});
        Ok(TestFleet {
            cloud,
            watcher,
            cfg,
            repo,
        })
    }

    pub fn node_name(&self, id: usize) -> String {
        self.cfg.node_name(id)
    }

    pub fn rendezvous(&self, id: usize) -> Option<common::schemas::RendezvousInfo> {
        let text = self.cloud.file(&self.node_name(id), "~/.raleigh/rendezvous.json")?;
        serde_json::from_str(&text).ok()
    }

    pub fn pid_file(&self, id: usize) -> Option<String> {
        self.cloud.file(&self.node_name(id), "~/.raleigh/running.pid")
    }

    /// Wait for every node to be running a workload with a consistent group:
    /// pid files present and all rendezvous records carrying the same
    /// non-zero group id.
    pub fn wait_for_group(&self, timeout_ms: u64) -> Result<i32> {
        let mut group_id = 0;
        wait_until(timeout_ms, || {
            let ids: Vec<i32> = (0..self.cfg.num_nodes)
                .filter_map(|id| self.rendezvous(id).map(|r| r.group_id))
                .collect();
            let pids_present = (0..self.cfg.num_nodes).all(|id| self.pid_file(id).is_some());
            if ids.len() == self.cfg.num_nodes
                && pids_present
                && ids.iter().all(|&g| g > 0 && g == ids[0])
            {
                group_id = ids[0];
                Ok(true)
            } else {
                Ok(false)
            }
        })?;
        Ok(group_id)
    }
}

/// Fingerprint of the fleet's local source tree, as the reconciler computes
/// it.
pub fn local_fingerprint(fleet: &TestFleet) -> Result<String> {
    common::fingerprint::dir_fingerprint(fleet.repo.path())
}

pub fn wait_until(timeout_ms: u64, mut check: impl FnMut() -> Result<bool>) -> Result<()> {
    let start = Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    loop {
        if check()? {
            return Ok(());
        }
        if start.elapsed() > timeout {
            anyhow::bail!("wait_until timed out after {timeout_ms}ms");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
