//! Partial decryption with proofs
//!
//! For every requested row and column the node returns `d = c1^x` under its
//! key share `x`, together with a Chaum-Pedersen proof against its
//! verification key `g^x`. Combining is left to the caller.

use ark_ec::PrimeGroup;
use ark_std::rand::{rngs::StdRng, SeedableRng};
use async_trait::async_trait;
use rayon::prelude::*;
use tracing::{debug, info};

use super::{into_reply, unknown_command};
use crate::crypto::dleq::DleqProof;
use crate::crypto::{CiphertextRow, Curve, Fr, G1};
use crate::error::MixnetError;
use crate::messages::{
    Algorithm, Capability, Command, DecryptionShares, MessageReply, PartialFactor, ReplyPayload,
    ServiceType,
};
use crate::node::{NodeHandle, Service};
use crate::utils::{from_bytes, to_bytes};

#[derive(Default)]
pub struct DecryptionService;

/// Partial factors and proofs for one row
pub fn partial_decrypt_row(
    row: &CiphertextRow<Curve>,
    share: &Fr,
    verification_key: G1,
) -> Result<Vec<PartialFactor>, MixnetError> {
    let mut rng = StdRng::from_entropy();
    row.columns
        .iter()
        .map(|column| {
            let factor = column.partial_decrypt(share);
            let proof =
                DleqProof::<Curve>::prove(share, column.c1, verification_key, factor, &mut rng)?;
            Ok(PartialFactor {
                factor: to_bytes(&factor)?,
                proof: to_bytes(&proof)?,
            })
        })
        .collect()
}

impl DecryptionService {
    pub fn new() -> Self {
        Self
    }

    fn partial_decrypt(
        &self,
        node: &NodeHandle,
        key_id: &str,
        rows: Vec<Vec<u8>>,
    ) -> Result<MessageReply, MixnetError> {
        let key = node.keys().get_partial_private_key(key_id)?;
        if key.algorithm != Algorithm::EcElGamal {
            return Err(MixnetError::Protocol(format!(
                "key {} is not an EC-ElGamal key",
                key_id
            )));
        }

        let share = key.share.expose_secret();
        let verification_key = G1::generator() * share;
        let rows = rows
            .par_iter()
            .map(|bytes| {
                let row = from_bytes::<CiphertextRow<Curve>>(bytes)?;
                partial_decrypt_row(&row, share, verification_key)
            })
            .collect::<Result<Vec<_>, MixnetError>>()?;

        debug!(node = %node.name(), key_id, rows = rows.len(), "partial decryption");
        Ok(MessageReply::with(ReplyPayload::PartialDecryptions(
            DecryptionShares {
                node: node.name().to_string(),
                index: key.index,
                verification_key: to_bytes(&verification_key)?,
                rows,
            },
        )))
    }
}

#[async_trait]
impl Service for DecryptionService {
    fn capability(&self) -> Capability {
        Capability {
            service: ServiceType::Decryption,
            parameters: vec![format!("{:?}", Algorithm::EcElGamal)],
        }
    }

    async fn handle(&self, node: &NodeHandle, command: Command) -> MessageReply {
        match command {
            Command::PartialDecrypt { key_id, rows } => {
                info!(node = %node.name(), key_id = %key_id, rows = rows.len(), "decrypt request");
                into_reply("DECRYPT", self.partial_decrypt(node, &key_id, rows))
            }
            other => unknown_command(&other),
        }
    }
}
