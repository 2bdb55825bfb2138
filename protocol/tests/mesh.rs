//! Multi-node scenarios over the in-process transport.
//!
//! Each test builds its own `MemoryNetwork` and a handful of nodes with a
//! short maintenance tick and a trivial mining difficulty, then waits on
//! node snapshots rather than sleeping for fixed periods.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use kestrel_protocol::chain::{address_of, OutPoint, Transaction, TxOutput};
use kestrel_protocol::config::{now_ms, BootstrapPeer, NodeConfig};
use kestrel_protocol::crypto::{NodeKeypair, PeerId};
use kestrel_protocol::network::{
    MemoryNetwork, Node, NodeError, NodeHandle, NodeQuery, NodeSnapshot, NodeStatus, PeerStatus, QueryAnswer,
};
use kestrel_protocol::storage::MemoryBlockStore;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestNode {
    keypair: Arc<NodeKeypair>,
    handle: NodeHandle,
    task: JoinHandle<Result<(), NodeError>>,
}

impl TestNode {
    async fn stop(self, net: &MemoryNetwork) {
        self.handle.shutdown();
        self.task.await.unwrap().unwrap();
        net.remove(self.handle.peer_id());
    }
}

fn config(target: usize, mining: bool) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.is_public = true;
    config.maintenance_interval_ms = 50;
    config.validation_workers = 0;
    config.topology.target_neighbors = target;
    config.topology.backoff_base_ms = 50;
    config.mining.enabled = mining;
    config.mining.difficulty = 4;
    config
}

fn start(net: &Arc<MemoryNetwork>, seed: u8, mut config: NodeConfig, bootstrap: &[&PeerId]) -> TestNode {
    let keypair = Arc::new(NodeKeypair::from_seed(&[seed; 32]));
    config.bootstrap = bootstrap
        .iter()
        .map(|peer| BootstrapPeer {
            peer_id: (*peer).clone(),
            address: None,
        })
        .collect();
    let (transport, events) = net.endpoint(keypair.peer_id());
    let node = Node::new(
        config,
        Arc::clone(&keypair),
        Arc::new(transport),
        events,
        Arc::new(MemoryBlockStore::new()),
    )
    .expect("node config");
    let (handle, task) = node.spawn();
    TestNode { keypair, handle, task }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn snapshots(nodes: &[TestNode]) -> Vec<NodeSnapshot> {
    nodes.iter().map(|n| n.handle.snapshot()).collect()
}

async fn block_hash(handle: &NodeHandle, index: u64) -> Option<String> {
    match handle.query(NodeQuery::BlockByIndex(index)).await {
        Ok(QueryAnswer::Block(block)) => block.map(|b| hex::encode(b.hash)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mesh_settles_near_target_and_heals_after_churn() {
    let net = MemoryNetwork::new();
    let seed = start(&net, 1, config(3, false), &[]);
    let seed_id = seed.handle.peer_id().clone();
    let mut nodes = vec![seed];
    for i in 2..=8u8 {
        nodes.push(start(&net, i, config(3, false), &[&seed_id]));
    }

    eventually("every node to hold 2..=4 neighbors", || {
        snapshots(&nodes)
            .iter()
            .all(|s| (2..=4).contains(&s.connected_peers) && s.status == NodeStatus::Active)
    })
    .await;

    let gone: Vec<TestNode> = nodes.drain(6..).collect();
    let gone_ids: Vec<PeerId> = gone.iter().map(|n| n.handle.peer_id().clone()).collect();
    for node in gone {
        node.stop(&net).await;
    }

    eventually("survivors to refill their neighbor sets", || {
        snapshots(&nodes).iter().all(|s| s.connected_peers >= 2)
    })
    .await;

    for node in &nodes {
        let QueryAnswer::Peers(peers) = node.handle.query(NodeQuery::Peers).await.unwrap() else {
            panic!("expected peers");
        };
        for record in peers.iter().filter(|r| gone_ids.contains(&r.id)) {
            assert_ne!(record.status, PeerStatus::Connected, "departed peer still connected");
        }
    }
}

// ---------------------------------------------------------------------------
// Gossip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn blocks_reach_every_node_once_in_a_full_mesh() {
    let net = MemoryNetwork::new();
    let miner = start(&net, 1, config(3, true), &[]);
    let miner_id = miner.handle.peer_id().clone();
    let mut nodes = vec![miner];
    for i in 2..=4u8 {
        nodes.push(start(&net, i, config(3, false), &[&miner_id]));
    }

    eventually("a full mesh of four", || {
        snapshots(&nodes).iter().all(|s| s.connected_peers == 3)
    })
    .await;
    eventually("every node to reach height 3", || {
        snapshots(&nodes).iter().all(|s| s.height >= 3)
    })
    .await;

    for index in 1..=3 {
        let expected = block_hash(&nodes[0].handle, index).await;
        assert!(expected.is_some());
        for node in &nodes[1..] {
            assert_eq!(block_hash(&node.handle, index).await, expected, "block {index} differs");
        }
    }

    // Relays around the mesh's cycles arrive more than once and are absorbed.
    let stats = snapshots(&nodes);
    assert!(stats.iter().map(|s| s.gossip.duplicates).sum::<u64>() > 0);
    assert!(stats.iter().all(|s| s.sync.rejected == 0));
}

#[tokio::test]
async fn transaction_submitted_anywhere_gets_mined() {
    let net = MemoryNetwork::new();
    let miner = start(&net, 1, config(3, true), &[]);
    let miner_id = miner.handle.peer_id().clone();
    let relay = start(&net, 2, config(3, false), &[&miner_id]);

    eventually("the relay to follow block 1", || relay.handle.snapshot().height >= 1).await;
    let QueryAnswer::Block(Some(block)) = relay.handle.query(NodeQuery::BlockByIndex(1)).await.unwrap() else {
        panic!("block 1 missing");
    };
    let reward = &block.transactions[0];
    let recipient = address_of(&[42; 32]);
    let spend = Transaction::new_signed(
        &miner.keypair,
        vec![OutPoint {
            tx_id: reward.id(),
            output: 0,
        }],
        vec![TxOutput {
            address: recipient,
            amount: reward.outputs[0].amount,
        }],
        now_ms(),
    );
    relay.handle.submit_transaction(spend).await.unwrap();

    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let funded = matches!(
                miner.handle.query(NodeQuery::Balance(recipient)).await,
                Ok(QueryAnswer::Balance(b)) if b > 0
            ) && matches!(
                relay.handle.query(NodeQuery::Balance(recipient)).await,
                Ok(QueryAnswer::Balance(b)) if b > 0
            );
            if funded {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("transaction never confirmed on both nodes");
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_outlives_its_miner() {
    let net = MemoryNetwork::new();
    let miner = start(&net, 1, config(3, true), &[]);
    let miner_id = miner.handle.peer_id().clone();
    let keeper = start(&net, 2, config(3, false), &[&miner_id]);

    eventually("the keeper to reach height 4", || keeper.handle.snapshot().height >= 4).await;
    miner.stop(&net).await;

    eventually("the keeper to notice", || keeper.handle.snapshot().status == NodeStatus::Offline).await;

    let keeper_id = keeper.handle.peer_id().clone();
    let newcomer = start(&net, 3, config(3, false), &[&keeper_id]);
    eventually("the newcomer to catch up", || {
        let s = newcomer.handle.snapshot();
        s.status == NodeStatus::Active && s.head_hash == keeper.handle.snapshot().head_hash
    })
    .await;
    let kept = keeper.handle.snapshot();
    assert!(kept.height >= 4);
    for index in 0..=kept.height {
        assert_eq!(
            block_hash(&newcomer.handle, index).await,
            block_hash(&keeper.handle, index).await
        );
    }
}
