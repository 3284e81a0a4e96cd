//! Per-node control loop.
//!
//! One worker per node id. The outer loop reconciles the node toward ready
//! (exists, installed, cloned); once a quorum of nodes is ready the workers
//! rendezvous on the synchroniser and cooperatively drive the group state
//! machine: assign a group id, allocate ports, exchange hosts, start the
//! workload atomically, and tear it down when membership is lost.
//!
//! Barrier discipline: every code path through the inner loop crosses the
//! same collectives in the same order on every member, so no member can
//! strand a peer inside a barrier. Branches are taken uniformly because the
//! counts they branch on are read between fences and errors are agreed on
//! through `check_err`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use rand::Rng;
use tracing::{debug, info, warn};

use common::config::FleetConfig;
use common::constants::MAX_GROUP_ID;
use common::error::DriverError;
use common::schemas::RendezvousInfo;

use crate::installer::NodeInstaller;
use crate::node::{NodeLifecycle, NodeSlot, StatusUpdate};
use crate::runner::CommandRunner;
use crate::sync::{GatherPayload, QuorumGate, Synchronizer};

/// Shared handles threaded into every worker.
#[derive(Clone)]
pub struct NodeContext {
    pub cfg: FleetConfig,
    pub statuses: Arc<Vec<NodeSlot>>,
    pub updates: Sender<StatusUpdate>,
    pub group_gate: Arc<QuorumGate>,
    pub active_sync: Arc<Synchronizer>,
    pub group_id: Arc<AtomicI32>,
    pub runner: Arc<dyn CommandRunner>,
}

/// Worker entry point: reconcile node `id` forever. Returns only when the
/// update channel is closed (the consumer is gone).
pub fn run_node(ctx: &NodeContext, id: usize) {
    let interval = Duration::from_millis(ctx.cfg.reconcile_interval_ms);
    let mut first = true;
    loop {
        if !first {
            thread::sleep(interval);
        }
        first = false;
        if !outer_cycle(ctx, id, interval) {
            debug!(node = id, "update channel closed; worker exiting");
            return;
        }
    }
}

/// One outer reconcile cycle. Returns `false` when the update channel has
/// closed.
fn outer_cycle(ctx: &NodeContext, id: usize, interval: Duration) -> bool {
    let mut installer = match NodeInstaller::observe(&ctx.cfg, id, ctx.runner.clone()) {
        Ok(installer) => installer,
        Err(err) => return publish_error(ctx, id, format!("{err:#}")),
    };

    if !publish_state(ctx, id, &installer) {
        return false;
    }

    if installer.lifecycle != NodeLifecycle::Ready {
        let result: Result<(), DriverError> = match installer.lifecycle {
            NodeLifecycle::Nonexistent => installer.driver().create(),
            NodeLifecycle::Stopped => installer.driver().delete(),
            _ => Ok(()),
        };
        if let Err(err) = result {
            return publish_error(ctx, id, err.to_string());
        }
        return true;
    }

    if !installer.installed {
        let err = installer.install_basics().err().map(|e| format!("{e:#}"));
        if !publish(ctx, id, &installer, err.clone()) {
            return false;
        }
        if err.is_some() {
            return true;
        }
    }

    if !installer.cloned {
        if !installer.repo_hash.is_empty() {
            // The source changed underneath a workload that may still be
            // running against the old tree.
            let err = installer.kill_running_process().err().map(|e| format!("{e:#}"));
            if !publish(ctx, id, &installer, err.clone()) {
                return false;
            }
            if err.is_some() {
                return true;
            }
            installer.repo_hash.clear();
        }
        let err = installer.clone_repo().err().map(|e| format!("{e:#}"));
        if !publish(ctx, id, &installer, err.clone()) {
            return false;
        }
        if err.is_some() {
            return true;
        }
    }

    // Quorum check: only manage the fleet once enough nodes are fully ready.
    let ready = count_all(&ctx.statuses, |s| s.is_ready());
    if ready < ctx.cfg.num_active {
        return true;
    }

    // Exactly num_active workers pass this fence per formation; the fence is
    // re-armed after the first barrier inside.
    ctx.group_gate.arrive();
    ctx.group_gate.wait();

    info!(node = id, "entering active group");

    ctx.active_sync.sync();
    ctx.group_gate.add(1);
    ctx.active_sync.sync();

    inner_loop(ctx, id, &mut installer, interval)
}

/// The group-coordinated loop. Every step is a collective. Returns `false`
/// when the update channel has closed; `true` hands control back to the
/// outer loop after membership is lost.
fn inner_loop(
    ctx: &NodeContext,
    id: usize,
    installer: &mut NodeInstaller,
    interval: Duration,
) -> bool {
    let num_active = ctx.cfg.num_active;
    let sync = &ctx.active_sync;
    let mut first = true;

    loop {
        if !first {
            thread::sleep(interval);
        }
        first = false;

        // Fenced read of the live group id: every member observes the same
        // value this cycle.
        sync.sync();
        let loaded_group_id = ctx.group_id.load(Ordering::SeqCst);
        sync.sync();

        // Re-observe the node so membership and health reflect the world,
        // not the last outer cycle. Any member's failure aborts the cycle
        // for all.
        let observe_err = match NodeInstaller::observe(&ctx.cfg, id, ctx.runner.clone()) {
            Ok(fresh) => {
                *installer = fresh;
                None
            }
            Err(err) => Some(format!("{err:#}")),
        };
        let err = check_err(sync, observe_err);
        if !publish(ctx, id, installer, err.clone()) {
            return false;
        }
        if err.is_some() {
            continue;
        }

        // Membership check. All members count between fences, so they agree
        // on whether the group still holds.
        sync.sync();
        let not_ready = count_all(&ctx.statuses, |s| !s.is_ready());
        if not_ready > 0 {
            info!(node = id, not_ready, "group membership lost; leaving active group");
            sync.sync();
            return true;
        }
        sync.sync();

        if loaded_group_id > 0 {
            // Health check on a live group: if any member's workload is
            // gone, zero the group id; the next cycle tears down stragglers.
            let running = count_all(&ctx.statuses, |s| s.is_ready() && s.running);
            if running < num_active {
                warn!(
                    node = id,
                    running, num_active, "group degraded; scheduling teardown"
                );
                sync.sync();
                ctx.group_id.store(0, Ordering::SeqCst);
                continue;
            }
        } else {
            let not_running = count_all(&ctx.statuses, |s| s.is_ready() && !s.running);
            if not_running >= num_active {
                if !form_group(ctx, id, installer) {
                    return false;
                }
            } else {
                // Quorum of idle members lost but stale workloads may
                // remain: each member kills its own.
                sync.sync();
                let err = installer.kill_running_process().err().map(|e| format!("{e:#}"));
                let err = check_err(sync, err);
                if !publish(ctx, id, installer, err.clone()) {
                    return false;
                }
                if err.is_some() {
                    continue;
                }
                installer.repo_hash.clear();
            }
        }
    }
}

/// One formation attempt: agree on a fresh group id, exchange rendezvous
/// information, and start the workload on every member atomically. Returns
/// `false` when the update channel has closed.
///
/// The group id is stored, read back, then reset to zero before the port
/// exchange: inside that commit window every member holds the id locally
/// while the global stays zero, so a crash mid-exchange leaves the group
/// unformed instead of half-formed. The id is only re-published after the
/// rendezvous files are in place.
fn form_group(ctx: &NodeContext, id: usize, installer: &mut NodeInstaller) -> bool {
    let num_active = ctx.cfg.num_active;
    let sync = &ctx.active_sync;

    sync.sync();
    // Every member proposes a candidate; the last write wins and the fenced
    // read below makes all members adopt the same survivor.
    let candidate = rand::thread_rng().gen_range(1..=MAX_GROUP_ID);
    ctx.group_id.store(candidate, Ordering::SeqCst);
    sync.sync();
    let attempted_group_id = ctx.group_id.load(Ordering::SeqCst);
    sync.sync();
    ctx.group_id.store(0, Ordering::SeqCst);

    let my_index = sync.sync();
    debug!(node = id, my_index, attempted_group_id, "forming group");

    let (my_ports, ports_err) = match installer.get_unused_ports(num_active - 1) {
        Ok(ports) => (ports, None),
        Err(err) => (Vec::new(), Some(format!("{err:#}"))),
    };
    let err = check_err(sync, ports_err);
    if !publish(ctx, id, installer, err.clone()) {
        return false;
    }
    if err.is_some() {
        return true;
    }

    sync.sync();
    let all_ports = sync.all_gather(GatherPayload::Ports(my_ports.clone()));
    sync.sync();
    debug!(node = id, ?all_ports, "gathered port allocations");

    sync.sync();
    let my_endpoints: Vec<(String, u16)> = my_ports
        .iter()
        .map(|port| (installer.info.external_ip.clone(), *port))
        .collect();
    let gathered = sync.all_gather(GatherPayload::Endpoints(my_endpoints));
    let all_hosts: Vec<Vec<(String, u16)>> = gathered
        .into_iter()
        .map(|payload| match payload {
            GatherPayload::Endpoints(endpoints) => endpoints,
            _ => Vec::new(),
        })
        .collect();

    let other_hosts = ring_peers(&all_hosts, my_index);

    sync.sync();
    let rendezvous = RendezvousInfo {
        seed: my_ports.first().copied().unwrap_or_default(),
        ports: my_ports,
        group_id: attempted_group_id,
        hosts: other_hosts,
    };
    let write_err = installer
        .write_rendezvous_info(&rendezvous)
        .err()
        .map(|e| format!("{e:#}"));
    let err = check_err(sync, write_err);
    if !publish(ctx, id, installer, err.clone()) {
        return false;
    }
    if err.is_some() {
        return true;
    }

    sync.sync();
    ctx.group_id.store(attempted_group_id, Ordering::SeqCst);
    sync.sync();

    let start_err = installer.start_process().err().map(|e| format!("{e:#}"));
    let err = check_err(sync, start_err);
    if !publish(ctx, id, installer, err.clone()) {
        return false;
    }
    if err.is_none() {
        info!(node = id, group_id = attempted_group_id, "group formed and workload started");
    }
    true
}

/// Ring-symmetric peer assignment: member `my_index`'s peer at offset `d`
/// is member `(my_index + d) % n`, reached through slot `d - 1` of that
/// peer's port list. Every `(member, peer)` ordered pair resolves to a
/// distinct slot on the peer's side, and each member's slots are claimed by
/// exactly one peer, so both endpoints agree on which port is theirs.
pub fn ring_peers(all_hosts: &[Vec<(String, u16)>], my_index: usize) -> Vec<(String, u16)> {
    let n = all_hosts.len();
    let mut peers = Vec::with_capacity(n.saturating_sub(1));
    for offset in 1..n {
        let peer = (my_index + offset) % n;
        let endpoint = all_hosts[peer]
            .get(offset - 1)
            .cloned()
            .unwrap_or_default();
        peers.push(endpoint);
    }
    peers
}

/// Collective error agreement: all members exchange their error (or lack of
/// one) and adopt the first, in caller-index order. A formation step aborts
/// for everyone when it fails for anyone.
fn check_err(sync: &Synchronizer, err: Option<String>) -> Option<String> {
    sync.sync();
    let gathered = sync.all_gather(GatherPayload::Error(err));
    let first = gathered.into_iter().find_map(|payload| match payload {
        GatherPayload::Error(Some(message)) => Some(message),
        _ => None,
    });
    sync.sync();
    first
}

/// Snapshot-count the whole table. Guards are taken in ascending index order
/// and held only for the count itself.
fn count_all(statuses: &[NodeSlot], pred: impl Fn(&StatusUpdate) -> bool) -> usize {
    let guards: Vec<_> = statuses.iter().map(|slot| slot.lock()).collect();
    guards.iter().filter(|guard| pred(guard)).count()
}

/// Publish the installer-derived state (or an error against the previous
/// state) to the slot, then send on the unbuffered channel. The slot lock is
/// dropped before the send so the consumer can walk the table freely.
/// Returns `false` when the channel has closed.
fn publish(ctx: &NodeContext, id: usize, installer: &NodeInstaller, err: Option<String>) -> bool {
    match err {
        Some(message) => publish_error(ctx, id, message),
        None => publish_state(ctx, id, installer),
    }
}

fn publish_state(ctx: &NodeContext, id: usize, installer: &NodeInstaller) -> bool {
    let update = StatusUpdate {
        id,
        lifecycle: installer.lifecycle,
        info: installer.info.clone(),
        installed: installer.installed,
        cloned: installer.cloned,
        running: installer.running_pid.is_some(),
        error: None,
    };
    {
        let mut slot = ctx.statuses[id].lock();
        *slot = update.clone();
    }
    ctx.updates.send(update).is_ok()
}

fn publish_error(ctx: &NodeContext, id: usize, message: String) -> bool {
    let update = {
        let mut slot = ctx.statuses[id].lock();
        slot.id = id;
        slot.error = Some(message);
        slot.clone()
    };
    ctx.updates.send(update).is_ok()
}
