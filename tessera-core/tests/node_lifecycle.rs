/*
    node_lifecycle.rs - Start, stop and restart of full nodes

    Restart keeps storage and entities but drops every connection; peers have
    to reconnect before replication resumes.
*/

mod common;

use std::sync::Arc;

use common::*;
use tessera_core::core_entity::{Entity, EntityType, ProtocolManager};
use tessera_core::core_oplog::LogCategory;
use tessera_core::core_router::{JoinState, MemoryTransport};
use tessera_core::core_store::{MemoryStore, Storage};
use tessera_core::shutdown::ShutdownState;
use tessera_core::NodeError;

#[tokio::test]
async fn test_stop_disconnects_peers() {
    let alice = start_node(fast_config()).await;
    let bob = start_node(fast_config()).await;
    link(&alice, &bob).await;
    wait_identified(&alice, &bob).await;

    assert!(alice.stop().await);
    assert_eq!(alice.state(), ShutdownState::Shutdown);
    assert!(alice.router().peers().is_empty());

    let dropped = wait_until(WAIT, || bob.router().peers().is_empty()).await;
    assert!(dropped, "bob never noticed the closed connection");

    let (t, _other) = MemoryTransport::pair();
    let err = alice
        .connect(Arc::new(t), bob.peer_id(), PROTOCOL_VERSION)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, NodeError::ShuttingDown));

    bob.stop().await;
}

#[tokio::test]
async fn test_second_stop_is_harmless() {
    let node = start_node(fast_config()).await;
    assert!(node.stop().await);
    assert!(node.stop().await);
    assert_eq!(node.state(), ShutdownState::Shutdown);
}

/// Scenario: an owner restarts, its member reconnects, and replication picks
/// up where it left off
#[tokio::test]
async fn test_restart_resumes_replication() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let owner = start_node_as(fast_config(), identity(), storage).await;
    let member = start_node(fast_config()).await;
    link(&owner, &member).await;
    wait_identified(&owner, &member).await;

    let entity = owner.create_entity(EntityType::Group).unwrap();
    let id = entity.id();
    assert_eq!(join(&owner, &member, &id).await, JoinState::Approved);

    owner.restart().await.unwrap();
    assert_eq!(owner.state(), ShutdownState::Running);
    assert!(owner.router().peers().is_empty());
    let reloaded = owner.entity(&id).expect("entity reloaded from storage");
    assert!(reloaded.is_member(&member.me().user_id()));
    assert!(wait_until(WAIT, || member.router().peers().is_empty()).await);

    link(&owner, &member).await;
    wait_identified(&owner, &member).await;

    reloaded.create_object(b"after restart".to_vec()).unwrap();
    let replica = member.entity(&id).unwrap();
    let converged = wait_until(WAIT, || {
        let root = reloaded.merkle_root(LogCategory::Object);
        root.count == 1 && replica.merkle_root(LogCategory::Object) == root
    })
    .await;
    assert!(converged, "replication did not resume after restart");

    owner.stop().await;
    member.stop().await;
}

#[tokio::test]
async fn test_seen_markers_survive_restart() -> anyhow::Result<()> {
    let node = start_node(fast_config()).await;
    let id = node.create_entity(EntityType::Group)?.id();
    let marked = node.mark_oplog_seen(&id, LogCategory::Object)?;

    node.restart().await?;
    assert_eq!(node.oplog_seen(&id, LogCategory::Object)?, marked);
    assert!(node.oplog_seen(&id, LogCategory::Member)?.is_zero());

    node.stop().await;
    Ok(())
}
