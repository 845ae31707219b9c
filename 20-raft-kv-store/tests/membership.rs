//! Integration tests for joining nodes and reading the topology.

use anyhow::Result;
use raft_kv_store::consensus::{ConsensusError, Server};
use raft_kv_store::error::StoreError;
use raft_kv_store::testing::LocalCluster;
use raft_kv_store::topology::Node;

fn entries_for(cluster: &LocalCluster, id: &str) -> Vec<Server> {
    cluster
        .configuration()
        .into_iter()
        .filter(|server| server.id == id)
        .collect()
}

#[test]
fn test_rejoin_with_new_address_keeps_single_entry() -> Result<()> {
    let cluster = LocalCluster::new(3);
    let leader = cluster.store(0);

    leader.join("nodeX", "10.0.1.1:14000")?;
    leader.join("nodeX", "10.0.1.2:14000")?;

    assert_eq!(
        entries_for(&cluster, "nodeX"),
        vec![Server::voter("nodeX", "10.0.1.2:14000")]
    );
    assert!(!cluster
        .configuration()
        .iter()
        .any(|server| server.address == "10.0.1.1:14000"));
    assert_eq!(cluster.configuration().len(), 4);
    Ok(())
}

#[test]
fn test_repeated_join_is_idempotent() -> Result<()> {
    let cluster = LocalCluster::new(1);
    let leader = cluster.store(0);

    for _ in 0..3 {
        leader.join("node2", "10.0.0.2:14000")?;
    }
    assert_eq!(entries_for(&cluster, "node2").len(), 1);
    assert_eq!(cluster.configuration().len(), 2);
    Ok(())
}

#[test]
fn test_status_after_joins() -> Result<()> {
    let cluster = LocalCluster::new(1);
    let leader = cluster.store(0);
    leader.join("node2", "10.0.0.2:14000")?;
    leader.join("node3", "10.0.0.3:14000")?;

    let status = leader.status()?;
    assert_eq!(status.me, Node::new("node1", "10.0.0.1:14000"));
    assert_eq!(status.leader, status.me);
    assert_eq!(
        status.followers,
        vec![
            Node::new("node2", "10.0.0.2:14000"),
            Node::new("node3", "10.0.0.3:14000"),
        ]
    );
    Ok(())
}

#[test]
fn test_status_on_follower_lists_itself() -> Result<()> {
    let cluster = LocalCluster::new(3);
    let status = cluster.store(1).status()?;

    assert_eq!(status.leader, Node::new("node1", "10.0.0.1:14000"));
    assert_eq!(status.me, Node::new("node2", "10.0.0.2:14000"));
    assert!(status.followers.contains(&status.me));
    assert!(!status.degraded);
    Ok(())
}

#[test]
fn test_status_without_leader() -> Result<()> {
    let cluster = LocalCluster::new(3);
    cluster.depose();

    let status = cluster.store(1).status()?;
    assert_eq!(status.leader, Node::default());
    assert_eq!(status.followers.len(), 3);
    Ok(())
}

#[test]
fn test_failed_add_after_removal_is_visible() {
    let cluster = LocalCluster::new(3);
    cluster.fail_next_add_voter(ConsensusError::Timeout(std::time::Duration::from_millis(5)));

    let err = cluster
        .store(0)
        .join("node2", "10.0.0.22:14000")
        .unwrap_err();

    assert!(err.is_partial_membership_change());
    assert!(matches!(err, StoreError::AddVoter { ref removed, .. } if removed.len() == 1));
    assert!(entries_for(&cluster, "node2").is_empty());

    // Retrying the join finishes the replacement.
    cluster.store(0).join("node2", "10.0.0.22:14000").unwrap();
    assert_eq!(
        entries_for(&cluster, "node2"),
        vec![Server::voter("node2", "10.0.0.22:14000")]
    );
}

#[test]
fn test_join_on_new_leader() -> Result<()> {
    let cluster = LocalCluster::new(3);
    cluster.elect(1);

    let err = cluster.store(0).join("node4", "10.0.0.4:14000").unwrap_err();
    assert!(matches!(err, StoreError::NotLeader));

    cluster.store(1).join("node4", "10.0.0.4:14000")?;
    assert_eq!(cluster.configuration().len(), 4);
    Ok(())
}
