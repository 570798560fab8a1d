/*
    node - A running replication node

    Node
     ├── Router            (peers, entities, key tables, handshakes)
     ├── ShutdownCoordinator
     │     ├── Sync group:  one timer per log category, pending retry,
     │     │                force sync, housekeeping
     │     └── Peers group: one supervised task per connection
     └── Storage           (shared with every entity)

    Per-connection task:

        select! {
            reader:  transport.read_message -> router.handle_message
            writer:  outbound queue -> transport.write_message
            peer.closed()        (evicted / duplicate identity)
            shutdown token
        }
        -> transport.close(), router.remove_peer()

    Only transport failures end a connection. Every other error is logged by
    class and the loop keeps reading.
*/

use rand::Rng;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{Config, ConfigError};
use crate::core_entity::{EntityError, EntityProtocolManager, EntityType};
use crate::core_identity::{MyIdentity, PeerId};
use crate::core_oplog::{EntityId, LogCategory, Timestamp};
use crate::core_router::{ErrorClass, Outbound, Peer, Router, RouterError, Transport};
use crate::core_store::Storage;
use crate::metrics;
use crate::shutdown::{run_until_cancelled, ShutdownCoordinator, ShutdownState, TaskGroup};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("Peer {0} is already connected")]
    AlreadyConnected(PeerId),

    #[error("Node is shutting down")]
    ShuttingDown,
}

pub type NodeResult<T> = Result<T, NodeError>;

/// Router and task supervisor of one run; replaced on restart
#[derive(Clone)]
struct Running {
    router: Arc<Router>,
    shutdown: Arc<ShutdownCoordinator>,
}

pub struct Node {
    me: Arc<MyIdentity>,
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    running: RwLock<Running>,
}

impl Node {
    /// Validate the configuration, load every persisted entity and start the
    /// timers. Corrupted persisted state aborts startup.
    pub async fn start(config: Config, me: Arc<MyIdentity>, storage: Arc<dyn Storage>) -> NodeResult<Self> {
        config.validate()?;
        metrics::init_metrics();
        let config = Arc::new(config);
        let running = boot(&me, &config, &storage)?;
        info!(
            peer = %me.peer_id(),
            user = %me.user_id(),
            entities = running.router.node_info().entity_count,
            "Node started"
        );
        Ok(Self {
            me,
            config,
            storage,
            running: RwLock::new(running),
        })
    }

    fn running(&self) -> Running {
        self.running
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn router(&self) -> Arc<Router> {
        self.running().router
    }

    pub fn me(&self) -> &Arc<MyIdentity> {
        &self.me
    }

    pub fn peer_id(&self) -> PeerId {
        self.me.peer_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ShutdownState {
        self.running().shutdown.state()
    }

    /// Hand a freshly established connection to the node.
    ///
    /// The peer is admitted at Random and served by its own task until the
    /// transport fails, the peer is evicted or the node stops.
    pub async fn connect(&self, transport: Arc<dyn Transport>, peer_id: PeerId, version: u32) -> NodeResult<Arc<Peer>> {
        let Running { router, shutdown } = self.running();
        if shutdown.is_shutting_down() {
            transport.close().await;
            return Err(NodeError::ShuttingDown);
        }
        if router.peers().get(&peer_id).is_some() {
            transport.close().await;
            return Err(NodeError::AlreadyConnected(peer_id));
        }

        let (peer, outbound) = Peer::new(peer_id, version, self.config.node.outbound_queue);
        let peer = Arc::new(peer);
        if let Err(e) = router.on_peer_connected(&peer) {
            warn!(peer = %peer_id, error = %e, "Refusing connection");
            router.remove_peer(&peer_id);
            peer.close();
            transport.close().await;
            return Err(e.into());
        }

        let span = info_span!("peer", peer = %peer_id);
        let task = serve_peer(
            router.clone(),
            peer.clone(),
            transport.clone(),
            outbound,
            shutdown.token(TaskGroup::Peers),
        )
        .instrument(span);
        if !shutdown.spawn(TaskGroup::Peers, task) {
            router.remove_peer(&peer_id);
            peer.close();
            transport.close().await;
            return Err(NodeError::ShuttingDown);
        }
        Ok(peer)
    }

    pub fn create_entity(&self, entity_type: EntityType) -> NodeResult<Arc<EntityProtocolManager>> {
        Ok(self.router().create_entity(entity_type)?)
    }

    pub fn entity(&self, id: &EntityId) -> Option<Arc<EntityProtocolManager>> {
        self.router().entity(id)
    }

    pub fn mark_oplog_seen(&self, entity_id: &EntityId, category: LogCategory) -> NodeResult<Timestamp> {
        let pm = self
            .entity(entity_id)
            .ok_or(RouterError::UnknownEntity(*entity_id))?;
        Ok(pm.mark_oplog_seen(category)?)
    }

    /// Zero when the category was never marked
    pub fn oplog_seen(&self, entity_id: &EntityId, category: LogCategory) -> NodeResult<Timestamp> {
        let pm = self
            .entity(entity_id)
            .ok_or(RouterError::UnknownEntity(*entity_id))?;
        Ok(pm.oplog_seen(category)?)
    }

    /// Stop timers, close every connection and wait for all tasks.
    /// Returns false if some task outlived the shutdown timeout.
    pub async fn stop(&self) -> bool {
        let Running { router, shutdown } = self.running();
        router.stop_sync();
        let clean = shutdown.shutdown(|| router.close_all_peers()).await;
        info!(peer = %self.me.peer_id(), clean, "Node stopped");
        clean
    }

    /// Stop everything and come back up with an empty peer registry.
    /// Entities are reloaded from storage; peers must reconnect.
    pub async fn restart(&self) -> NodeResult<()> {
        self.stop().await;
        let running = boot(&self.me, &self.config, &self.storage)?;
        let entities = running.router.node_info().entity_count;
        *self.running.write().unwrap_or_else(PoisonError::into_inner) = running;
        info!(peer = %self.me.peer_id(), entities, "Node restarted");
        Ok(())
    }
}

/// Build a router, load persisted entities and spawn the timers
fn boot(me: &Arc<MyIdentity>, config: &Arc<Config>, storage: &Arc<dyn Storage>) -> NodeResult<Running> {
    let router = Arc::new(Router::new(me.clone(), config.clone(), storage.clone()));
    for id in EntityProtocolManager::list_persisted(storage.as_ref())? {
        match router.load_entity(id) {
            Ok(pm) => debug!(entity = %id, status = ?pm.status(), "Loaded entity"),
            Err(e) if e.class() == ErrorClass::Fatal => {
                error!(entity = %id, error = %e, "Persisted state is corrupted");
                return Err(e.into());
            }
            Err(e) => warn!(entity = %id, error = %e, "Skipping entity"),
        }
    }

    let shutdown = Arc::new(ShutdownCoordinator::new(config.node.shutdown_timeout));
    spawn_timers(&router, &shutdown, config);
    Ok(Running { router, shutdown })
}

fn spawn_timers(router: &Arc<Router>, shutdown: &ShutdownCoordinator, config: &Config) {
    let sync = &config.sync;
    let token = || shutdown.token(TaskGroup::Sync);

    for category in LogCategory::ALL {
        let router = router.clone();
        let tick = ticker(sync.interval, sync.jitter, move || router.sync_category(category));
        shutdown.spawn(
            TaskGroup::Sync,
            run_until_cancelled("sync", token(), tick).instrument(info_span!("sync", category = %category)),
        );
    }

    let r = router.clone();
    let tick = ticker(sync.pending_interval, sync.jitter, move || r.sync_pending());
    shutdown.spawn(TaskGroup::Sync, run_until_cancelled("pending sync", token(), tick));

    let r = router.clone();
    let quiet = sync.force_sync_quiet_period;
    let tick = ticker(sync.interval, sync.jitter, move || r.force_sync(quiet));
    shutdown.spawn(TaskGroup::Sync, run_until_cancelled("force sync", token(), tick));

    let r = router.clone();
    let tick = ticker(config.handshake.gc_interval, Duration::ZERO, move || {
        r.housekeeping(Instant::now())
    });
    shutdown.spawn(TaskGroup::Sync, run_until_cancelled("housekeeping", token(), tick));
}

fn jitter_delay(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::rng().random_range(0..=millis))
}

/// Run `tick` every `period` plus up to `jitter`, forever
async fn ticker<F>(period: Duration, jitter: Duration, tick: F)
where
    F: Fn(),
{
    loop {
        tokio::time::sleep(period + jitter_delay(jitter)).await;
        tick();
    }
}

/// Log a message the router refused. Returns false when the connection
/// must close.
fn report_dropped(peer: &PeerId, code: u64, e: &RouterError) -> bool {
    let class = e.class();
    metrics::message_dropped(class.as_str());
    match class {
        ErrorClass::Fatal => {
            warn!(peer = %peer, code, error = %e, "Closing peer after fatal error");
            return false;
        }
        ErrorClass::Protocol | ErrorClass::Admission => {
            warn!(code, class = class.as_str(), error = %e, "Dropped message")
        }
        ErrorClass::Validation | ErrorClass::TransientSync => {
            debug!(code, class = class.as_str(), error = %e, "Dropped message")
        }
    }
    true
}

async fn serve_peer(
    router: Arc<Router>,
    peer: Arc<Peer>,
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::Receiver<Outbound>,
    shutdown: CancellationToken,
) {
    let reader = async {
        loop {
            let (code, bytes) = match transport.read_message().await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "Transport read ended");
                    return;
                }
            };
            let Err(e) = router.handle_message(&peer, code, &bytes) else {
                continue;
            };
            if !report_dropped(&peer.id(), code, &e) {
                return;
            }
        }
    };

    let writer = async {
        while let Some(Outbound { code, bytes }) = outbound.recv().await {
            if let Err(e) = transport.write_message(code, bytes).await {
                debug!(error = %e, "Transport write failed");
                return;
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = writer => {}
        _ = peer.closed() => debug!("Peer closed locally"),
        _ = shutdown.cancelled() => {}
    }

    transport.close().await;
    peer.close();
    router.remove_peer(&peer.id());
    info!("Peer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_entity::Entity;
    use crate::core_router::MemoryTransport;
    use crate::core_store::{MemoryStore, StoreError};

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.node.shutdown_timeout = Duration::from_secs(1);
        config
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let node = Node::start(quiet_config(), Arc::new(MyIdentity::generate()), storage)
            .await
            .unwrap();
        assert_eq!(node.state(), ShutdownState::Running);
        assert!(node.stop().await);
        assert_eq!(node.state(), ShutdownState::Shutdown);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = quiet_config();
        config.peers.max_random_peers = 0;
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let err = Node::start(config, Arc::new(MyIdentity::generate()), storage)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_after_stop_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let node = Node::start(quiet_config(), Arc::new(MyIdentity::generate()), storage)
            .await
            .unwrap();
        node.stop().await;

        let (a, _b) = MemoryTransport::pair();
        let a = Arc::new(a);
        let err = node
            .connect(a.clone(), MyIdentity::generate().peer_id(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::ShuttingDown));
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_duplicate_connection_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let node = Node::start(quiet_config(), Arc::new(MyIdentity::generate()), storage)
            .await
            .unwrap();
        let remote = MyIdentity::generate().peer_id();
        let (a, _b) = MemoryTransport::pair();
        node.connect(Arc::new(a), remote, 1).await.unwrap();

        let (c, _d) = MemoryTransport::pair();
        let err = node.connect(Arc::new(c), remote, 1).await.unwrap_err();
        assert!(matches!(err, NodeError::AlreadyConnected(id) if id == remote));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_restart_reloads_entities() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let node = Node::start(quiet_config(), Arc::new(MyIdentity::generate()), storage)
            .await
            .unwrap();
        let pm = node.create_entity(EntityType::Group).unwrap();
        pm.create_object(b"kept".to_vec()).unwrap();

        node.restart().await.unwrap();
        assert_eq!(node.state(), ShutdownState::Running);
        let reloaded = node.entity(&pm.id()).unwrap();
        assert!(!Arc::ptr_eq(&reloaded, &pm));
        assert_eq!(reloaded.objects().unwrap().len(), 1);
        node.stop().await;
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_fatal_error_closes_peer_and_names_it() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let peer = MyIdentity::generate().peer_id();
        let corrupted = RouterError::from(EntityError::Store(StoreError::Corrupted("bad record".into())));
        let bad_hash = RouterError::from(crate::core_router::CodecError::HashMismatch);

        tracing::subscriber::with_default(subscriber, || {
            assert!(report_dropped(&peer, 7, &bad_hash));
            assert!(!report_dropped(&peer, 9, &corrupted));
        });

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line = logs
            .lines()
            .find(|l| l.contains("Closing peer after fatal error"))
            .unwrap();
        assert!(line.contains("WARN"));
        assert!(line.contains(&peer.to_string()));
        assert!(line.contains("code=9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_jitter_bounds() {
        for _ in 0..100 {
            assert!(jitter_delay(Duration::from_millis(50)) <= Duration::from_millis(50));
        }
        assert_eq!(jitter_delay(Duration::ZERO), Duration::ZERO);
    }
}
