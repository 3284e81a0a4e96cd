use serde::{Deserialize, Serialize};

/// Rendezvous record written to `~/.raleigh/rendezvous.json` on each node.
/// The workload reads it to discover its peers; the reconciler treats the
/// contents as opaque beyond writing them atomically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RendezvousInfo {
    pub ports: Vec<u16>,
    pub group_id: i32,
    pub seed: u16,
    /// `(host, port)` endpoint per peer, one slot per ring offset.
    pub hosts: Vec<(String, u16)>,
}

/// Raw shape of `gcloud compute tpus tpu-vm describe --format json`.
/// Only the fields the driver reads; everything else is ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DescribeRaw {
    pub state: String,
    pub network_endpoints: Vec<NetworkEndpointRaw>,
    pub accelerator_type: String,
    pub version: String,
    pub health: String,
    pub scheduling_config: SchedulingConfigRaw,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkEndpointRaw {
    pub access_config: AccessConfigRaw,
    pub ip_address: String,
    pub port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessConfigRaw {
    pub external_ip: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulingConfigRaw {
    pub preemptible: bool,
}

/// One entry of `gcloud auth list --format json`.
#[derive(Debug, Deserialize)]
pub struct AuthEntry {
    pub account: String,
    pub status: String,
}
