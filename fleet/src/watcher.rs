//! Fleet watcher: owns the worker threads, the status table and the update
//! stream the UI consumes.

use std::sync::Arc;
use std::sync::atomic::AtomicI32;
use std::thread;

use anyhow::Context;
use crossbeam_channel::{Receiver, bounded};

use common::config::FleetConfig;

use crate::node::{NodeLifecycle, NodeSlot, StatusUpdate};
use crate::reconciler::{NodeContext, run_node};
use crate::runner::CommandRunner;
use crate::sync::{QuorumGate, Synchronizer};

pub struct FleetWatcher {
    statuses: Arc<Vec<NodeSlot>>,
    updates: Receiver<StatusUpdate>,
}

impl FleetWatcher {
    /// Validate the config and spawn one reconciler thread per node id.
    /// Workers run until the process exits or the update receiver is
    /// dropped.
    pub fn new(cfg: FleetConfig, runner: Arc<dyn CommandRunner>) -> anyhow::Result<FleetWatcher> {
        cfg.validate().context("invalid fleet config")?;

        let statuses: Arc<Vec<NodeSlot>> = Arc::new(
            (0..cfg.num_nodes)
                .map(|id| {
                    let slot = NodeSlot::default();
                    slot.lock().id = id;
                    slot
                })
                .collect(),
        );
        // Capacity zero: every send rendezvouses with a receive. The UI
        // draining promptly is the backpressure contract.
        let (tx, rx) = bounded(0);
        let group_gate = Arc::new(QuorumGate::new(cfg.num_active));
        let active_sync = Arc::new(Synchronizer::new(cfg.num_active));
        let group_id = Arc::new(AtomicI32::new(0));

        for id in 0..cfg.num_nodes {
            let ctx = NodeContext {
                cfg: cfg.clone(),
                statuses: statuses.clone(),
                updates: tx.clone(),
                group_gate: group_gate.clone(),
                active_sync: active_sync.clone(),
                group_id: group_id.clone(),
                runner: runner.clone(),
            };
            thread::Builder::new()
                .name(format!("node-{id}"))
                .spawn(move || run_node(&ctx, id))
                .with_context(|| format!("spawning worker for node {id}"))?;
        }

        Ok(FleetWatcher {
            statuses,
            updates: rx,
        })
    }

    pub fn updates(&self) -> &Receiver<StatusUpdate> {
        &self.updates
    }

    pub fn statuses(&self) -> &Arc<Vec<NodeSlot>> {
        &self.statuses
    }
}

/// Aggregate view recomputed on every update, for the UI.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FleetStats {
    pub active: usize,
    pub installed: usize,
    pub cloned: usize,
    pub running: usize,
    pub last_error: Option<(usize, String)>,
}

impl FleetStats {
    pub fn collect(statuses: &[NodeSlot], latest: &StatusUpdate) -> FleetStats {
        let mut stats = FleetStats {
            last_error: latest.error.clone().map(|message| (latest.id, message)),
            ..FleetStats::default()
        };
        for slot in statuses {
            let status = slot.snapshot();
            if status.lifecycle == NodeLifecycle::Ready {
                stats.active += 1;
            }
            if status.installed {
                stats.installed += 1;
            }
            if status.cloned {
                stats.cloned += 1;
            }
            if status.running {
                stats.running += 1;
            }
        }
        stats
    }
}
