/*
    Shared helpers for the node-level integration tests.

    Nodes talk over MemoryTransport pairs and run their real timers, so every
    assertion about replication goes through `wait_until`.
*/

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tessera_core::core_identity::MyIdentity;
use tessera_core::core_router::{JoinState, MemoryTransport};
use tessera_core::core_store::{MemoryStore, Storage};
use tessera_core::{Config, Node};

pub const PROTOCOL_VERSION: u32 = 1;

/// Default config with timers short enough for tests
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.sync.interval = Duration::from_millis(100);
    config.sync.jitter = Duration::from_millis(20);
    config.sync.pending_interval = Duration::from_millis(100);
    config.sync.force_sync_quiet_period = Duration::from_millis(300);
    config.handshake.gc_interval = Duration::from_millis(50);
    config.node.shutdown_timeout = Duration::from_secs(2);
    config
}

pub fn identity() -> Arc<MyIdentity> {
    Arc::new(MyIdentity::generate())
}

pub async fn start_node(config: Config) -> Node {
    start_node_as(config, identity(), Arc::new(MemoryStore::new())).await
}

pub async fn start_node_as(config: Config, me: Arc<MyIdentity>, storage: Arc<dyn Storage>) -> Node {
    Node::start(config, me, storage).await.unwrap()
}

/// Connect two nodes with an in-memory transport
pub async fn link(a: &Node, b: &Node) {
    let (ta, tb) = MemoryTransport::pair();
    a.connect(Arc::new(ta), b.peer_id(), PROTOCOL_VERSION).await.unwrap();
    b.connect(Arc::new(tb), a.peer_id(), PROTOCOL_VERSION).await.unwrap();
}

/// Poll `cond` every 10ms; false if it never held within `timeout`
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub const WAIT: Duration = Duration::from_secs(5);

/// Both nodes know who the other one is
pub async fn wait_identified(a: &Node, b: &Node) {
    let (ua, ub) = (a.me().user_id(), b.me().user_id());
    let ok = wait_until(WAIT, || {
        a.router().peer_by_user(&ub).is_some() && b.router().peer_by_user(&ua).is_some()
    })
    .await;
    assert!(ok, "nodes never identified each other");
}

/// Ask `owner` to let `joiner` into `entity` and wait for the outcome
pub async fn join(owner: &Node, joiner: &Node, entity: &tessera_core::core_oplog::EntityId) -> JoinState {
    let pm = owner.entity(entity).unwrap();
    let hash = joiner
        .router()
        .join_entity(*entity, pm.join_key().unwrap(), owner.peer_id())
        .unwrap();
    let router = joiner.router();
    wait_until(WAIT, || {
        router.join_state(&hash).is_some_and(|s| s.is_terminal())
    })
    .await;
    router.join_state(&hash).unwrap()
}
