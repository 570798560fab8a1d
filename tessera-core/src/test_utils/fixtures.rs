//! Test fixtures for identities, entities and connected routers

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::core_entity::{EntityConfig, EntityProtocolManager, EntityType};
use crate::core_identity::MyIdentity;
use crate::core_router::{Outbound, Peer, Router, RouterError};
use crate::core_store::{MemoryStore, Storage};

pub fn identity() -> Arc<MyIdentity> {
    Arc::new(MyIdentity::generate())
}

pub fn memory_storage() -> Arc<dyn Storage> {
    Arc::new(MemoryStore::new())
}

/// Default config without identify-on-connect, so tests drive handshakes
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.node.identify_on_connect = false;
    config
}

/// Builder for an entity owned by `owner`, with extra members
pub struct TestEntityBuilder {
    owner: Arc<MyIdentity>,
    entity_type: EntityType,
    members: Vec<Arc<MyIdentity>>,
    objects: Vec<Vec<u8>>,
}

impl TestEntityBuilder {
    pub fn new(owner: &Arc<MyIdentity>) -> Self {
        Self {
            owner: owner.clone(),
            entity_type: EntityType::Group,
            members: Vec::new(),
            objects: Vec::new(),
        }
    }

    pub fn with_member(mut self, member: &Arc<MyIdentity>) -> Self {
        self.members.push(member.clone());
        self
    }

    pub fn with_object(mut self, data: &[u8]) -> Self {
        self.objects.push(data.to_vec());
        self
    }

    pub fn build(self) -> EntityProtocolManager {
        let pm = EntityProtocolManager::create(
            self.owner,
            memory_storage(),
            EntityConfig::default(),
            self.entity_type,
        )
        .unwrap();
        for member in &self.members {
            pm.add_member(member.user_id(), member.user_public_key()).unwrap();
        }
        for data in self.objects {
            pm.create_object(data).unwrap();
        }
        pm
    }
}

/// One side of a hand-pumped router connection
pub struct RouterEnd {
    pub router: Arc<Router>,
    /// This router's handle for the other side
    pub peer: Arc<Peer>,
    pub rx: mpsc::Receiver<Outbound>,
}

pub fn router(me: &Arc<MyIdentity>, config: &Arc<Config>) -> Arc<Router> {
    Arc::new(Router::new(me.clone(), config.clone(), memory_storage()))
}

/// Connect two routers; messages only move when `pump` is called.
/// A router may take part in several connections.
pub fn connect(a: Arc<Router>, b: Arc<Router>) -> (RouterEnd, RouterEnd) {
    let (to_b, rx_a) = Peer::new(b.me().peer_id(), 1, 1024);
    let (to_a, rx_b) = Peer::new(a.me().peer_id(), 1, 1024);
    let (to_b, to_a) = (Arc::new(to_b), Arc::new(to_a));
    a.on_peer_connected(&to_b).unwrap();
    b.on_peer_connected(&to_a).unwrap();
    (
        RouterEnd { router: a, peer: to_b, rx: rx_a },
        RouterEnd { router: b, peer: to_a, rx: rx_b },
    )
}

/// Deliver queued messages both ways until both queues are empty.
/// Returns every handling error in delivery order.
pub fn pump(a: &mut RouterEnd, b: &mut RouterEnd) -> Vec<RouterError> {
    let mut errors = Vec::new();
    loop {
        let mut moved = false;
        while let Ok(msg) = a.rx.try_recv() {
            moved = true;
            if let Err(e) = b.router.handle_message(&b.peer, msg.code, &msg.bytes) {
                errors.push(e);
            }
        }
        while let Ok(msg) = b.rx.try_recv() {
            moved = true;
            if let Err(e) = a.router.handle_message(&a.peer, msg.code, &msg.bytes) {
                errors.push(e);
            }
        }
        if !moved {
            return errors;
        }
    }
}

/// Run identify in both directions and assert it went through
pub fn identify_both(a: &mut RouterEnd, b: &mut RouterEnd) {
    a.router.identify_peer(&a.peer).unwrap();
    b.router.identify_peer(&b.peer).unwrap();
    let errors = pump(a, b);
    assert!(errors.is_empty(), "identify failed: {:?}", errors);
}

/// Two identified routers with the given identities
pub fn identified_pair(
    a: &Arc<MyIdentity>,
    b: &Arc<MyIdentity>,
    config: &Arc<Config>,
) -> (RouterEnd, RouterEnd) {
    let (mut x, mut y) = connect(router(a, config), router(b, config));
    identify_both(&mut x, &mut y);
    (x, y)
}
