mod util;

use anyhow::Result;
use util::{TestFleet, local_fingerprint, wait_until};

/// Cold start with two nonexistent nodes: both get created, installed and
/// cloned, a group forms with a non-zero id, and each node's rendezvous file
/// names the other as its peer.
#[test]
fn cold_start_forms_a_two_node_group() -> Result<()> {
    let fleet = TestFleet::launch(2, 2)?;

    // Nodes start nonexistent; the reconcilers must create them.
    wait_until(10_000, || {
        Ok((0..2).all(|id| fleet.cloud.node(&fleet.node_name(id)).state.is_some()))
    })?;

    let group_id = fleet.wait_for_group(20_000)?;
    assert!(group_id > 0);

    let fingerprint = local_fingerprint(&fleet)?;
    for id in 0..2 {
        let name = fleet.node_name(id);
        let node = fleet.cloud.node(&name);
        assert_eq!(node.state.as_deref(), Some("READY"));

        // Install and clone both recorded on the node.
        assert_eq!(
            fleet.cloud.file(&name, "~/.raleigh/install-version").as_deref(),
            Some(fleet.cfg.installer_version.as_str())
        );
        assert_eq!(
            fleet.cloud.file(&name, "~/.raleigh/repo-version").as_deref(),
            Some(fingerprint.as_str())
        );

        // Workload started and recorded.
        let pid: i32 = fleet.pid_file(id).unwrap().parse()?;
        assert_eq!(node.running_pid, Some(pid));

        // Rendezvous record carries the group id and the other node's ip.
        let rendezvous = fleet.rendezvous(id).unwrap();
        assert_eq!(rendezvous.group_id, group_id);
        assert_eq!(rendezvous.ports.len(), 1);
        assert_eq!(rendezvous.seed, rendezvous.ports[0]);
        assert_eq!(rendezvous.hosts.len(), 1);
        let other = fleet.cloud.node(&fleet.node_name(1 - id));
        assert_eq!(rendezvous.hosts[0].0, other.external_ip);
    }
    Ok(())
}
