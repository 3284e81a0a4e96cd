use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use common::schemas::DescribeRaw;

/// Where a node is in its cloud lifecycle, as last observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeLifecycle {
    #[default]
    Nonexistent,
    Creating,
    Ready,
    Stopping,
    Stopped,
    Deleting,
    Error,
}

impl NodeLifecycle {
    /// Map the gcloud `state` string; unknown states read as `Error`.
    pub fn from_state(state: &str) -> NodeLifecycle {
        match state {
            "CREATING" => NodeLifecycle::Creating,
            "READY" => NodeLifecycle::Ready,
            "STOPPING" => NodeLifecycle::Stopping,
            "STOPPED" => NodeLifecycle::Stopped,
            "DELETING" => NodeLifecycle::Deleting,
            _ => NodeLifecycle::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLifecycle::Nonexistent => "nonexistent",
            NodeLifecycle::Creating => "creating",
            NodeLifecycle::Ready => "ready",
            NodeLifecycle::Stopping => "stopping",
            NodeLifecycle::Stopped => "stopped",
            NodeLifecycle::Deleting => "deleting",
            NodeLifecycle::Error => "error",
        }
    }
}

/// Network and hardware facts from a `describe` call. Only meaningful while
/// the lifecycle is `Ready`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub external_ip: String,
    pub internal_ip: String,
    pub port: u16,
    pub accelerator_type: String,
    pub version: String,
    pub health: String,
    pub preemptible: bool,
}

impl NodeInfo {
    pub fn from_describe(raw: &DescribeRaw) -> NodeInfo {
        let endpoint = raw.network_endpoints.first();
        NodeInfo {
            external_ip: endpoint
                .map(|e| e.access_config.external_ip.clone())
                .unwrap_or_default(),
            internal_ip: endpoint.map(|e| e.ip_address.clone()).unwrap_or_default(),
            port: endpoint.map(|e| e.port).unwrap_or_default(),
            accelerator_type: raw.accelerator_type.clone(),
            version: raw.version.clone(),
            health: raw.health.clone(),
            preemptible: raw.scheduling_config.preemptible,
        }
    }
}

/// One node's published state. `installed`, `cloned` and `running` are only
/// meaningful when `lifecycle == Ready`; a transition away invalidates them
/// and the next cycle re-derives them.
#[derive(Clone, Debug, Default)]
pub struct StatusUpdate {
    pub id: usize,
    pub lifecycle: NodeLifecycle,
    pub info: NodeInfo,
    pub installed: bool,
    pub cloned: bool,
    pub running: bool,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn is_ready(&self) -> bool {
        self.lifecycle == NodeLifecycle::Ready && self.installed && self.cloned
    }
}

/// Slot in the shared status table. Locked only for single reads and writes;
/// the reconciler's count snapshots take every slot in ascending order and
/// hold them for pure-CPU counting only.
#[derive(Default)]
pub struct NodeSlot {
    inner: Mutex<StatusUpdate>,
}

impl NodeSlot {
    pub fn lock(&self) -> std::sync::MutexGuard<'_, StatusUpdate> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> StatusUpdate {
        self.lock().clone()
    }
}
