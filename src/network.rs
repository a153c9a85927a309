//! In-process network connecting node contexts
//!
//! Used by the tests and the demo binary in place of a socket transport. Every
//! command crosses the codec in both directions so that what travels between
//! nodes is exactly the wire format. Nodes can be disconnected to exercise
//! the retry paths.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tracing::debug;

use crate::codec;
use crate::config::NodeConfig;
use crate::error::MixnetError;
use crate::messages::{Command, Message, MessageReply, NodeName};
use crate::node::NodeContext;
use crate::peer::{ConnectionError, PeerChannel, PeerMap};

/// Default time a request may take before the channel reports a timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct InMemoryNetwork {
    nodes: RwLock<HashMap<NodeName, Weak<NodeContext>>>,
    disconnected: RwLock<HashSet<NodeName>>,
    request_timeout: Duration,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            disconnected: RwLock::new(HashSet::new()),
            request_timeout,
        })
    }

    /// Channel to `name`; resolution happens per request, so the target does
    /// not need to exist yet.
    pub fn channel(self: &Arc<Self>, name: &str) -> Arc<dyn PeerChannel> {
        Arc::new(InMemoryChannel {
            network: Arc::clone(self),
            target: name.to_string(),
        })
    }

    pub fn peer_map(self: &Arc<Self>, names: &[NodeName]) -> PeerMap {
        names
            .iter()
            .map(|name| (name.clone(), self.channel(name)))
            .collect()
    }

    pub fn register(&self, node: &Arc<NodeContext>) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.insert(node.name().to_string(), Arc::downgrade(node));
    }

    /// Creates and registers one node per config, fully meshed.
    pub fn spawn_nodes(
        self: &Arc<Self>,
        configs: Vec<NodeConfig>,
    ) -> Result<Vec<Arc<NodeContext>>, MixnetError> {
        let names: Vec<NodeName> = configs.iter().map(|c| c.name.clone()).collect();
        let mut nodes = Vec::with_capacity(configs.len());
        for config in configs {
            let node = NodeContext::new(config, self.peer_map(&names))?;
            self.register(&node);
            nodes.push(node);
        }
        Ok(nodes)
    }

    pub fn disconnect(&self, name: &str) {
        let mut disconnected = self.disconnected.write().unwrap_or_else(|e| e.into_inner());
        disconnected.insert(name.to_string());
        debug!(node = name, "disconnected");
    }

    pub fn reconnect(&self, name: &str) {
        let mut disconnected = self.disconnected.write().unwrap_or_else(|e| e.into_inner());
        disconnected.remove(name);
        debug!(node = name, "reconnected");
    }

    fn resolve(&self, name: &str) -> Result<Arc<NodeContext>, ConnectionError> {
        let disconnected = self.disconnected.read().unwrap_or_else(|e| e.into_inner());
        if disconnected.contains(name) {
            return Err(ConnectionError::Disconnected(name.to_string()));
        }
        drop(disconnected);

        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes
            .get(name)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ConnectionError::Disconnected(name.to_string()))
    }

    async fn deliver(&self, target: &str, command: Command) -> Result<MessageReply, ConnectionError> {
        let node = self.resolve(target)?;
        let transport = |e: MixnetError| ConnectionError::Transport(e.to_string());

        let request = codec::encode(&Message::Command(command)).map_err(transport)?;
        let command = match codec::decode(&request).map_err(transport)? {
            Message::Command(command) => command,
            Message::Reply(_) => {
                return Err(ConnectionError::Transport("expected a command".to_string()))
            }
        };

        let reply = tokio::time::timeout(self.request_timeout, node.dispatch(command))
            .await
            .map_err(|_| ConnectionError::Timeout(target.to_string()))?;

        let response = codec::encode(&Message::Reply(reply)).map_err(transport)?;
        match codec::decode(&response).map_err(transport)? {
            Message::Reply(reply) => Ok(reply),
            Message::Command(_) => Err(ConnectionError::Transport("expected a reply".to_string())),
        }
    }
}

struct InMemoryChannel {
    network: Arc<InMemoryNetwork>,
    target: NodeName,
}

#[async_trait]
impl PeerChannel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.target
    }

    async fn send(&self, command: Command) -> Result<MessageReply, ConnectionError> {
        self.network.deliver(&self.target, command).await
    }
}
