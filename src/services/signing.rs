//! Partial BLS signing

use async_trait::async_trait;
use tracing::info;

use super::{into_reply, unknown_command};
use crate::crypto::bls;
use crate::error::MixnetError;
use crate::messages::{
    Algorithm, Capability, Command, MessageReply, ReplyPayload, ServiceType, SignatureShare,
};
use crate::node::{NodeHandle, Service};
use crate::utils::to_bytes;

#[derive(Default)]
pub struct SigningService;

impl SigningService {
    pub fn new() -> Self {
        Self
    }

    fn partial_sign(
        &self,
        node: &NodeHandle,
        key_id: &str,
        message: &[u8],
    ) -> Result<MessageReply, MixnetError> {
        let key = node.keys().get_partial_private_key(key_id)?;
        if key.algorithm != Algorithm::Bls {
            return Err(MixnetError::Protocol(format!("key {} is not a BLS key", key_id)));
        }

        let signature = bls::partial_sign(key.share.expose_secret(), message);
        info!(node = %node.name(), key_id, index = key.index, "partial signature");
        Ok(MessageReply::with(ReplyPayload::PartialSignature(SignatureShare {
            node: node.name().to_string(),
            index: key.index,
            verification_key: key.verification_key().to_bytes()?,
            signature: to_bytes(&signature)?,
        })))
    }
}

#[async_trait]
impl Service for SigningService {
    fn capability(&self) -> Capability {
        Capability {
            service: ServiceType::Signing,
            parameters: vec![format!("{:?}", Algorithm::Bls)],
        }
    }

    async fn handle(&self, node: &NodeHandle, command: Command) -> MessageReply {
        match command {
            Command::PartialSign { key_id, message } => {
                into_reply("SIGN", self.partial_sign(node, &key_id, &message))
            }
            other => unknown_command(&other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::crypto::{G1, G1Affine, G2, G2Affine};
    use crate::messages::ThresholdKeyGenParams;
    use crate::network::InMemoryNetwork;
    use crate::utils::from_bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn test_partial_signatures_combine() {
        let network = InMemoryNetwork::new();
        let configs = ["A", "B", "C"]
            .iter()
            .map(|n| NodeConfig::new(*n).with_retry_intervals(Duration::from_millis(20), Duration::from_millis(10)))
            .collect();
        let nodes = network.spawn_nodes(configs).unwrap();
        let params = ThresholdKeyGenParams {
            key_id: "sig".into(),
            algorithm: Algorithm::Bls,
            parameters: "BLS12-381".into(),
            threshold: 2,
            nodes: vec!["A".into(), "B".into(), "C".into()],
        };
        for node in &nodes {
            assert!(node.dispatch(Command::Generate(params.clone())).await.is_ok());
        }
        for _ in 0..300 {
            if nodes.iter().all(|n| n.key_manager().has_private_key("sig")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let pk = nodes[0].key_manager().public_key("sig").unwrap().as_g2().unwrap();

        let message = b"board X shuffled".to_vec();
        let mut partials = Vec::new();
        for node in [&nodes[0], &nodes[2]] {
            let share = match node
                .dispatch(Command::PartialSign {
                    key_id: "sig".into(),
                    message: message.clone(),
                })
                .await
            {
                MessageReply::Okay(Some(ReplyPayload::PartialSignature(s))) => s,
                other => panic!("unexpected reply {:?}", other),
            };
            let sigma: G1 = from_bytes::<G1Affine>(&share.signature).unwrap().into();
            let vk: G2 = from_bytes::<G2Affine>(&share.verification_key).unwrap().into();
            bls::verify(sigma, &message, vk).unwrap();
            partials.push((share.index, sigma));
        }

        let signature = bls::combine(&partials).unwrap();
        bls::verify(signature, &message, pk).unwrap();
        assert!(bls::verify(signature, b"other message", pk).is_err());

        // Only complete keys sign
        let reply = nodes[0]
            .dispatch(Command::PartialSign {
                key_id: "missing".into(),
                message,
            })
            .await;
        assert!(!reply.is_ok());
    }
}
