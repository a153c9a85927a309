//! Threshold key generation service (GENERATE / STORE)
//!
//! On GENERATE a participant deals a Pedersen sharing to every participant,
//! applies its own share immediately and pushes the others out as STORE
//! commands, one retry chain per peer. On STORE the share is verified and
//! accumulated; a STORE that overtakes this node's own GENERATE is deferred
//! and re-processed later rather than rejected.

use ark_std::rand::{rngs::StdRng, SeedableRng};
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use super::{into_reply, unknown_command};
use crate::crypto::SUPPORTED_PARAMETERS;
use crate::error::MixnetError;
use crate::executor::{Attempt, RetryTask};
use crate::keys::{deal_shares, ApplyOutcome, Begin, KeyState};
use crate::messages::{
    Algorithm, Capability, Command, MessageReply, NodeName, ReplyPayload, ServiceType,
    StoreMessage, ThresholdKeyGenParams,
};
use crate::node::{NodeHandle, Service};

#[derive(Default)]
pub struct KeyGenerationService;

impl KeyGenerationService {
    pub fn new() -> Self {
        Self
    }

    fn generate(&self, node: &NodeHandle, params: ThresholdKeyGenParams) -> Result<MessageReply, MixnetError> {
        validate_params(&params)?;

        if params.index_of(node.name()).is_none() {
            debug!(node = %node.name(), key_id = %params.key_id, "not a participant, ignoring");
            return Ok(MessageReply::ok());
        }

        if node.keys().begin(&params)? == Begin::AlreadyOpen {
            debug!(node = %node.name(), key_id = %params.key_id, "round already open, GENERATE repeated");
            return Ok(MessageReply::ok());
        }

        // A round that cannot reach every peer must not stay pending
        if let Err(e) = self.deal(node, &params) {
            node.keys().fail(&params.key_id, &e.to_string());
            return Err(e);
        }

        info!(
            node = %node.name(),
            key_id = %params.key_id,
            algorithm = ?params.algorithm,
            threshold = params.threshold,
            participants = params.nodes.len(),
            "generated shares"
        );
        Ok(MessageReply::ok())
    }

    /// Applies this node's own share and starts one delivery chain per peer.
    fn deal(&self, node: &NodeHandle, params: &ThresholdKeyGenParams) -> Result<(), MixnetError> {
        let mut rng = StdRng::from_entropy();
        let messages = deal_shares(params, node.name(), &mut rng)?;

        for (target, message) in messages {
            if target == node.name() {
                node.keys().apply_share(&message)?;
                continue;
            }
            node.start_retry(
                SendShareTask {
                    node: node.clone(),
                    target,
                    message,
                },
                node.config().share_retry_interval(),
            )?;
        }
        Ok(())
    }

    fn store(&self, node: &NodeHandle, message: StoreMessage) -> Result<MessageReply, MixnetError> {
        match node.keys().apply_share(&message)? {
            ApplyOutcome::NotReady => {
                debug!(
                    node = %node.name(),
                    key_id = %message.key_id,
                    dealer = %message.dealer,
                    "share arrived before GENERATE, deferring"
                );
                node.defer_retry(
                    DeferredStoreTask {
                        node: node.clone(),
                        message,
                    },
                    node.config().store_retry_interval(),
                )?;
            }
            ApplyOutcome::Duplicate => {
                debug!(node = %node.name(), key_id = %message.key_id, dealer = %message.dealer, "duplicate share ignored");
            }
            ApplyOutcome::Applied { .. } | ApplyOutcome::Completed => {}
        }
        Ok(MessageReply::ok())
    }

    fn fetch_public_key(&self, node: &NodeHandle, key_id: &str) -> Result<MessageReply, MixnetError> {
        match node.keys().state(key_id) {
            None => Err(MixnetError::UnknownKey(key_id.to_string())),
            Some(KeyState::Failed(reason)) => Err(MixnetError::Protocol(format!(
                "key {} failed: {}",
                key_id, reason
            ))),
            Some(KeyState::Pending) => Ok(MessageReply::ok()),
            Some(KeyState::Complete) => Ok(match node.keys().fetch_public_key(key_id) {
                Some(pk) => MessageReply::with(ReplyPayload::PublicKey(pk)),
                None => MessageReply::ok(),
            }),
        }
    }
}

fn validate_params(params: &ThresholdKeyGenParams) -> Result<(), MixnetError> {
    if params.key_id.is_empty() {
        return Err(MixnetError::InvalidParameter("key id must not be empty".to_string()));
    }
    if params.parameters != SUPPORTED_PARAMETERS {
        return Err(MixnetError::Protocol(format!(
            "unsupported parameter set {}",
            params.parameters
        )));
    }
    if params.threshold == 0 || params.threshold > params.nodes.len() {
        return Err(MixnetError::InvalidParameter(format!(
            "threshold {} invalid for {} participants",
            params.threshold,
            params.nodes.len()
        )));
    }
    let mut seen = HashSet::new();
    if !params.nodes.iter().all(|n| seen.insert(n)) {
        return Err(MixnetError::InvalidParameter(
            "participant list contains duplicates".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl Service for KeyGenerationService {
    fn capability(&self) -> Capability {
        Capability {
            service: ServiceType::KeyGeneration,
            parameters: vec![
                format!("{:?}", Algorithm::EcElGamal),
                format!("{:?}", Algorithm::Bls),
                SUPPORTED_PARAMETERS.to_string(),
            ],
        }
    }

    async fn handle(&self, node: &NodeHandle, command: Command) -> MessageReply {
        match command {
            Command::Generate(params) => into_reply("GENERATE", self.generate(node, params)),
            Command::Store(message) => into_reply("STORE", self.store(node, message)),
            Command::FetchPublicKey { key_id } => {
                into_reply("FETCH_PUBLIC_KEY", self.fetch_public_key(node, &key_id))
            }
            other => unknown_command(&other),
        }
    }
}

/// Delivers one dealer share; retried while the peer is unreachable
struct SendShareTask {
    node: NodeHandle,
    target: NodeName,
    message: StoreMessage,
}

#[async_trait]
impl RetryTask for SendShareTask {
    fn describe(&self) -> String {
        format!("share of {} for {}", self.message.key_id, self.target)
    }

    async fn attempt(&self, attempt: u32) -> Attempt {
        match self
            .node
            .request(&self.target, Command::Store(self.message.clone()))
            .await
        {
            Ok(MessageReply::Okay(_)) => {
                debug!(node = %self.node.name(), target = %self.target, key_id = %self.message.key_id, "share delivered");
                Attempt::Done
            }
            Ok(MessageReply::Error(reason)) => {
                error!(
                    node = %self.node.name(),
                    target = %self.target,
                    key_id = %self.message.key_id,
                    "share rejected: {}", reason
                );
                Attempt::Done
            }
            Err(e) => {
                if attempt == 1 {
                    warn!(node = %self.node.name(), target = %self.target, "peer unavailable, will retry: {}", e);
                } else {
                    debug!(node = %self.node.name(), target = %self.target, attempt, "peer still unavailable: {}", e);
                }
                Attempt::Retry
            }
        }
    }
}

/// Re-processes a STORE once this node has opened the round
struct DeferredStoreTask {
    node: NodeHandle,
    message: StoreMessage,
}

#[async_trait]
impl RetryTask for DeferredStoreTask {
    fn describe(&self) -> String {
        format!("deferred share of {} from {}", self.message.key_id, self.message.dealer)
    }

    async fn attempt(&self, _attempt: u32) -> Attempt {
        match self.node.keys().apply_share(&self.message) {
            Ok(ApplyOutcome::NotReady) => Attempt::Retry,
            Ok(_) => {
                debug!(node = %self.node.name(), key_id = %self.message.key_id, dealer = %self.message.dealer, "deferred share applied");
                Attempt::Done
            }
            Err(e) => {
                error!(
                    node = %self.node.name(),
                    key_id = %self.message.key_id,
                    dealer = %self.message.dealer,
                    "deferred share rejected: {}", e
                );
                Attempt::Done
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::network::InMemoryNetwork;
    use std::time::Duration;

    fn params(key_id: &str, threshold: usize, nodes: &[&str]) -> ThresholdKeyGenParams {
        ThresholdKeyGenParams {
            key_id: key_id.into(),
            algorithm: Algorithm::EcElGamal,
            parameters: SUPPORTED_PARAMETERS.into(),
            threshold,
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
        }
    }

    fn fast(name: &str) -> NodeConfig {
        NodeConfig::new(name)
            .with_retry_intervals(Duration::from_millis(20), Duration::from_millis(10))
    }

    #[test]
    fn test_param_validation() {
        assert!(validate_params(&params("k", 2, &["A", "B"])).is_ok());
        assert!(validate_params(&params("k", 3, &["A", "B"])).is_err());
        assert!(validate_params(&params("k", 0, &["A"])).is_err());
        assert!(validate_params(&params("k", 1, &["A", "A"])).is_err());
        assert!(validate_params(&params("", 1, &["A"])).is_err());

        let mut p = params("k", 1, &["A"]);
        p.parameters = "P-256".into();
        assert!(matches!(validate_params(&p), Err(MixnetError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_generate_is_noop_for_outsiders_and_rejects_reuse() {
        let network = InMemoryNetwork::new();
        let nodes = network.spawn_nodes(vec![fast("A"), fast("Z")]).unwrap();

        let reply = nodes[1].dispatch(Command::Generate(params("k", 1, &["A"]))).await;
        assert_eq!(reply, MessageReply::ok());
        assert_eq!(nodes[1].key_manager().state("k"), None);

        let reply = nodes[0].dispatch(Command::Generate(params("k", 1, &["A"]))).await;
        assert_eq!(reply, MessageReply::ok());
        assert!(nodes[0].key_manager().has_private_key("k"));
        let pk = nodes[0].key_manager().fetch_public_key("k");

        // A repeated GENERATE is acknowledged without dealing again
        let again = nodes[0].dispatch(Command::Generate(params("k", 1, &["A"]))).await;
        assert_eq!(again, MessageReply::ok());
        assert_eq!(nodes[0].key_manager().fetch_public_key("k"), pk);

        let other = nodes[0].dispatch(Command::Generate(params("k", 1, &["A", "Z"]))).await;
        assert!(matches!(other, MessageReply::Error(reason) if reason.contains("already exists")));
        // The complete entry is untouched
        assert!(nodes[0].key_manager().has_private_key("k"));
    }

    #[tokio::test]
    async fn test_fetch_public_key_distinguishes_unknown_and_pending() {
        let network = InMemoryNetwork::new();
        let nodes = network.spawn_nodes(vec![fast("A"), fast("B")]).unwrap();

        let unknown = nodes[0]
            .dispatch(Command::FetchPublicKey { key_id: "k".into() })
            .await;
        assert!(matches!(unknown, MessageReply::Error(reason) if reason.contains("unknown key")));

        network.disconnect("B");
        assert!(nodes[0]
            .dispatch(Command::Generate(params("k", 2, &["A", "B"])))
            .await
            .is_ok());
        let pending = nodes[0]
            .dispatch(Command::FetchPublicKey { key_id: "k".into() })
            .await;
        assert_eq!(pending, MessageReply::ok());
    }

    #[tokio::test]
    async fn test_generate_fails_round_when_pool_is_closed() {
        let network = InMemoryNetwork::new();
        let node = network.spawn_nodes(vec![fast("A"), fast("B")]).unwrap().remove(0);
        let handle = node.handle();
        assert!(node.shutdown(Duration::from_secs(1)).await);

        let result = KeyGenerationService::new().generate(&handle, params("k", 2, &["A", "B"]));
        assert!(matches!(result, Err(MixnetError::ShuttingDown)));
        assert!(matches!(handle.keys().state("k"), Some(KeyState::Failed(_))));
        assert!(!handle.keys().has_private_key("k"));
    }

    #[tokio::test]
    async fn test_share_fan_out_retries_until_peer_returns() {
        let network = InMemoryNetwork::new();
        let nodes = network.spawn_nodes(vec![fast("A"), fast("B")]).unwrap();
        let p = params("k", 2, &["A", "B"]);

        network.disconnect("B");
        assert!(nodes[0].dispatch(Command::Generate(p.clone())).await.is_ok());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(nodes[0].key_manager().state("k"), Some(KeyState::Pending));

        network.reconnect("B");
        assert!(nodes[1].dispatch(Command::Generate(p)).await.is_ok());

        for _ in 0..200 {
            if nodes.iter().all(|n| n.key_manager().has_private_key("k")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(nodes.iter().all(|n| n.key_manager().has_private_key("k")));
        assert_eq!(
            nodes[0].key_manager().fetch_public_key("k"),
            nodes[1].key_manager().fetch_public_key("k")
        );
    }
}
