//! Node context and service router
//!
//! A [`NodeContext`] owns the peer map, the installed services, the key store
//! and the task pool for the lifetime of the node. Inbound commands are routed
//! to the first service that is able to handle them; the router itself only
//! answers `Capabilities` and `NodeStatistics` and fails closed with an ERROR
//! reply otherwise.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, ServiceConfig};
use crate::error::MixnetError;
use crate::executor::{RetryPolicy, RetryTask, TaskPool};
use crate::keys::KeyManager;
use crate::messages::{Capability, Command, MessageReply, NodeName, NodeStatistics, ReplyPayload};
use crate::peer::{ConnectionError, PeerChannel, PeerMap};
use crate::services::{
    BoardService, DecryptionService, KeyGenerationService, ShuffleService, SigningService,
};

/// A pluggable protocol service
#[async_trait]
pub trait Service: Send + Sync {
    fn capability(&self) -> Capability;

    fn is_able_to_handle(&self, command: &Command) -> bool {
        command.kind().service() == Some(self.capability().service)
    }

    /// Handle one command. Every failure must come back as an ERROR reply.
    async fn handle(&self, node: &NodeHandle, command: Command) -> MessageReply;

    /// Named counters describing the service's current state
    fn statistics(&self) -> BTreeMap<String, u64> {
        BTreeMap::new()
    }
}

/// Cloneable view of a node handed to services and their tasks
#[derive(Clone)]
pub struct NodeHandle {
    name: NodeName,
    config: Arc<NodeConfig>,
    peers: Arc<PeerMap>,
    pool: Arc<TaskPool>,
    keys: Arc<KeyManager>,
    router: Weak<NodeContext>,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn get_peer(&self, name: &str) -> Option<Arc<dyn PeerChannel>> {
        self.peers.get(name).cloned()
    }

    /// Sends a command to `target`, looping back through the local router
    /// when the target is this node.
    pub async fn request(&self, target: &str, command: Command) -> Result<MessageReply, ConnectionError> {
        if target == self.name {
            let router = self
                .router
                .upgrade()
                .ok_or_else(|| ConnectionError::Disconnected(self.name.clone()))?;
            return Ok(router.dispatch(command).await);
        }
        let peer = self
            .get_peer(target)
            .ok_or_else(|| ConnectionError::UnknownPeer(target.to_string()))?;
        peer.send(command).await
    }

    pub fn execute<F>(&self, task: F) -> Result<(), MixnetError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pool.execute(task)
    }

    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<(), MixnetError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pool.schedule(delay, task)
    }

    fn retry_policy(&self, interval: Duration) -> RetryPolicy {
        RetryPolicy {
            interval,
            max_attempts: self.config.max_retry_attempts,
        }
    }

    /// Starts a retry chain on the shared pool, bounded by the configured budget.
    pub fn start_retry<T: RetryTask>(&self, task: T, interval: Duration) -> Result<(), MixnetError> {
        self.pool.start_retry(task, self.retry_policy(interval))
    }

    /// Like [`NodeHandle::start_retry`], but the first attempt is delayed too.
    pub fn defer_retry<T: RetryTask>(&self, task: T, interval: Duration) -> Result<(), MixnetError> {
        self.pool.schedule_retry(task, self.retry_policy(interval))
    }
}

pub struct NodeContext {
    handle: NodeHandle,
    services: Vec<Arc<dyn Service>>,
    accepting: AtomicBool,
}

impl NodeContext {
    /// Builds a node with the services named in its configuration.
    pub fn new(config: NodeConfig, peers: PeerMap) -> Result<Arc<Self>, MixnetError> {
        let services = build_services(&config.services);
        Self::with_services(config, peers, services)
    }

    pub fn with_services(
        config: NodeConfig,
        mut peers: PeerMap,
        services: Vec<Arc<dyn Service>>,
    ) -> Result<Arc<Self>, MixnetError> {
        config.validate()?;

        // A node never addresses itself through its peer map
        peers.remove(&config.name);

        let pool = TaskPool::new(config.max_concurrent_tasks);
        let keys = Arc::new(KeyManager::new(config.name.clone()));
        let config = Arc::new(config);
        let peers = Arc::new(peers);

        info!(
            node = %config.name,
            peers = peers.len(),
            services = services.len(),
            "node context created"
        );

        Ok(Arc::new_cyclic(|router| Self {
            handle: NodeHandle {
                name: config.name.clone(),
                config,
                peers,
                pool,
                keys,
                router: router.clone(),
            },
            services,
            accepting: AtomicBool::new(true),
        }))
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        self.handle.keys()
    }

    pub fn get_peer(&self, name: &str) -> Option<Arc<dyn PeerChannel>> {
        self.handle.get_peer(name)
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.services.iter().map(|s| s.capability()).collect()
    }

    pub fn statistics(&self) -> NodeStatistics {
        let pool = &self.handle.pool;
        NodeStatistics {
            node: self.name().to_string(),
            accepting: self.accepting.load(Ordering::SeqCst),
            tasks_running: pool.running(),
            tasks_queued: pool.queued(),
            keys: self.key_manager().states(),
            services: self
                .services
                .iter()
                .map(|s| (s.capability().service, s.statistics()))
                .collect(),
        }
    }

    pub fn execute<F>(&self, task: F) -> Result<(), MixnetError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.execute(task)
    }

    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<(), MixnetError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.schedule(delay, task)
    }

    /// Routes a command to the first service able to handle it.
    pub async fn dispatch(&self, command: Command) -> MessageReply {
        if !self.accepting.load(Ordering::SeqCst) {
            return MessageReply::error("node is shutting down");
        }

        let kind = command.kind();
        match command {
            Command::Capabilities => {
                return MessageReply::with(ReplyPayload::Capabilities(self.capabilities()))
            }
            Command::NodeStatistics => {
                return MessageReply::with(ReplyPayload::Statistics(self.statistics()))
            }
            _ => {}
        }

        match self.services.iter().find(|s| s.is_able_to_handle(&command)) {
            Some(service) => {
                debug!(node = %self.name(), command = ?kind, "dispatching");
                service.handle(&self.handle, command).await
            }
            None => {
                warn!(node = %self.name(), command = ?kind, "no service for command");
                MessageReply::error(format!("Unknown command: {:?}", kind))
            }
        }
    }

    /// Stops accepting commands and drains the task pool. Queued retries are
    /// abandoned. Returns whether running tasks finished within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        let drained = self.handle.pool.shutdown(timeout).await;
        info!(node = %self.name(), drained, "node shut down");
        drained
    }
}

/// Instantiates the configured services in dispatch order.
pub fn build_services(configs: &[ServiceConfig]) -> Vec<Arc<dyn Service>> {
    configs
        .iter()
        .map(|config| -> Arc<dyn Service> {
            match config {
                ServiceConfig::KeyGeneration => Arc::new(KeyGenerationService::new()),
                ServiceConfig::Board => Arc::new(BoardService::new()),
                ServiceConfig::Shuffle => Arc::new(ShuffleService::new()),
                ServiceConfig::Decryption => Arc::new(DecryptionService::new()),
                ServiceConfig::Signing => Arc::new(SigningService::new()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::elgamal::encode_u64;
    use crate::crypto::{CiphertextRow, Curve, G1};
    use crate::messages::ServiceType;
    use crate::utils::to_bytes;
    use ark_ec::PrimeGroup;
    use std::collections::HashMap;

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        fn capability(&self) -> Capability {
            Capability {
                service: ServiceType::Board,
                parameters: vec!["echo".into()],
            }
        }

        async fn handle(&self, node: &NodeHandle, _command: Command) -> MessageReply {
            MessageReply::error(format!("echo from {}", node.name()))
        }
    }

    struct SelfChannel;

    #[async_trait]
    impl PeerChannel for SelfChannel {
        fn name(&self) -> &str {
            "A"
        }

        async fn send(&self, _command: Command) -> Result<MessageReply, ConnectionError> {
            Err(ConnectionError::Transport("must not be used".into()))
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_first_matching_service() {
        let node = NodeContext::with_services(
            NodeConfig::new("A"),
            HashMap::new(),
            vec![Arc::new(Echo), Arc::new(BoardService::new())],
        )
        .unwrap();

        let reply = node
            .dispatch(Command::BoardDownload { board: "X".into() })
            .await;
        assert_eq!(reply, MessageReply::error("echo from A"));
    }

    #[tokio::test]
    async fn test_unmatched_command_is_error() {
        let node =
            NodeContext::with_services(NodeConfig::new("A"), HashMap::new(), vec![Arc::new(Echo)])
                .unwrap();

        let reply = node
            .dispatch(Command::FetchPublicKey { key_id: "k".into() })
            .await;
        match reply {
            MessageReply::Error(reason) => assert!(reason.contains("Unknown command")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_capabilities_and_self_removed() {
        let mut peers: PeerMap = HashMap::new();
        peers.insert("A".into(), Arc::new(SelfChannel));
        let node = NodeContext::new(NodeConfig::new("A"), peers).unwrap();

        assert!(node.get_peer("A").is_none());
        match node.dispatch(Command::Capabilities).await {
            MessageReply::Okay(Some(ReplyPayload::Capabilities(caps))) => {
                assert_eq!(caps.len(), 5);
                assert_eq!(caps[0].service, ServiceType::KeyGeneration);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        // Requests to self loop back through the router
        let reply = node
            .handle()
            .request("A", Command::BoardDownload { board: "none".into() })
            .await
            .unwrap();
        assert!(!reply.is_ok());

        let missing = node.handle().request("B", Command::Capabilities).await;
        assert!(matches!(missing, Err(ConnectionError::UnknownPeer(_))));
    }

    #[tokio::test]
    async fn test_statistics_report_keys_and_services() {
        let node = NodeContext::new(NodeConfig::new("A"), HashMap::new()).unwrap();
        let mut rng = ark_std::test_rng();
        let row = CiphertextRow::<Curve>::encrypt(G1::generator(), &[encode_u64::<Curve>(7)], &mut rng);
        let upload = node
            .dispatch(Command::BoardUpload {
                board: "X".into(),
                data: to_bytes(&row).unwrap(),
            })
            .await;
        assert!(upload.is_ok());

        let stats = match node.dispatch(Command::NodeStatistics).await {
            MessageReply::Okay(Some(ReplyPayload::Statistics(stats))) => stats,
            other => panic!("unexpected reply {:?}", other),
        };
        assert_eq!(stats.node, "A");
        assert!(stats.accepting);
        assert!(stats.keys.is_empty());
        assert_eq!(stats.services.len(), 5);

        let (_, board) = stats
            .services
            .iter()
            .find(|(service, _)| *service == ServiceType::Board)
            .unwrap();
        assert_eq!(board.get("boards"), Some(&1));
        assert_eq!(board.get("entries"), Some(&1));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_commands() {
        let node = NodeContext::new(NodeConfig::new("A"), HashMap::new()).unwrap();
        assert!(node.shutdown(Duration::from_secs(1)).await);
        assert!(!node.dispatch(Command::Capabilities).await.is_ok());
        assert!(node.execute(async {}).is_err());
    }
}
