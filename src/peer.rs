//! Peer channel abstraction
//!
//! The only network primitive the node uses: send a command to one named
//! peer and wait for its reply. Retry and backoff live above this seam.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::messages::{Command, MessageReply, NodeName};

/// Failures to reach a peer. Always worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("peer {0} is not connected")]
    Disconnected(NodeName),
    #[error("peer {0} did not answer in time")]
    Timeout(NodeName),
    #[error("no channel to peer {0}")]
    UnknownPeer(NodeName),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Connection to one named peer
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Name of the node at the other end
    fn name(&self) -> &str;

    async fn send(&self, command: Command) -> Result<MessageReply, ConnectionError>;
}

/// Peers of a node by name; never contains the node itself
pub type PeerMap = HashMap<NodeName, Arc<dyn PeerChannel>>;
