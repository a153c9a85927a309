//! Node-local threshold key store
//!
//! Tracks every key generation round this node takes part in. An entry is
//! created when the node processes GENERATE (`Pending`), accumulates one
//! verified share per dealer and becomes `Complete` once every participant's
//! share has been applied. A bad share moves the entry to `Failed`; complete
//! entries are never modified again.

use ark_ec::{CurveGroup, PrimeGroup};
use ark_ff::Zero;
use ark_std::rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::crypto::vss::{verify_share, PedersenDealer, PedersenShare};
use crate::crypto::{Curve, Fr, G1Affine, G2Affine, G1, G2};
use crate::error::MixnetError;
use crate::messages::{Algorithm, KeyId, NodeName, SecretShareMessage, StoreMessage, ThresholdKeyGenParams};
use crate::security::SensitiveScalar;
use crate::utils::{from_bytes, pedersen_h, to_bytes};

/// Public key material: G1 for EC-ElGamal, G2 for BLS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicPoint {
    G1(G1),
    G2(G2),
}

impl PublicPoint {
    pub fn identity(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::EcElGamal => PublicPoint::G1(G1::zero()),
            Algorithm::Bls => PublicPoint::G2(G2::zero()),
        }
    }

    /// `g^x` in the group the algorithm publishes keys in
    pub fn from_scalar(algorithm: Algorithm, x: &Fr) -> Self {
        match algorithm {
            Algorithm::EcElGamal => PublicPoint::G1(G1::generator() * x),
            Algorithm::Bls => PublicPoint::G2(G2::generator() * x),
        }
    }

    pub fn from_bytes(algorithm: Algorithm, bytes: &[u8]) -> Result<Self, MixnetError> {
        Ok(match algorithm {
            Algorithm::EcElGamal => PublicPoint::G1(from_bytes::<G1Affine>(bytes)?.into()),
            Algorithm::Bls => PublicPoint::G2(from_bytes::<G2Affine>(bytes)?.into()),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MixnetError> {
        match self {
            PublicPoint::G1(p) => to_bytes(&p.into_affine()),
            PublicPoint::G2(p) => to_bytes(&p.into_affine()),
        }
    }

    fn add(self, other: PublicPoint) -> Result<Self, MixnetError> {
        match (self, other) {
            (PublicPoint::G1(a), PublicPoint::G1(b)) => Ok(PublicPoint::G1(a + b)),
            (PublicPoint::G2(a), PublicPoint::G2(b)) => Ok(PublicPoint::G2(a + b)),
            _ => Err(MixnetError::InvalidShare(
                "public point in the wrong group".to_string(),
            )),
        }
    }

    pub fn as_g1(&self) -> Result<G1, MixnetError> {
        match self {
            PublicPoint::G1(p) => Ok(*p),
            PublicPoint::G2(_) => Err(MixnetError::Protocol(
                "key is not an EC-ElGamal key".to_string(),
            )),
        }
    }

    pub fn as_g2(&self) -> Result<G2, MixnetError> {
        match self {
            PublicPoint::G2(p) => Ok(*p),
            PublicPoint::G1(_) => Err(MixnetError::Protocol("key is not a BLS key".to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum KeyState {
    /// Own share generated, waiting for the other dealers
    Pending,
    Complete,
    Failed(String),
}

/// This node's share of a completed key
#[derive(Debug, Clone)]
pub struct KeyShare {
    pub key_id: KeyId,
    pub algorithm: Algorithm,
    pub index: u64,
    pub threshold: usize,
    pub nodes: Vec<NodeName>,
    pub share: SensitiveScalar<Fr>,
}

impl KeyShare {
    pub fn verification_key(&self) -> PublicPoint {
        PublicPoint::from_scalar(self.algorithm, self.share.expose_secret())
    }
}

/// Result of opening a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    /// New entry, carrying this node's share index
    Opened(u64),
    /// A round with identical parameters is already open or complete
    AlreadyOpen,
}

/// Result of offering a share to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// No entry yet for the key: defer and try again later
    NotReady,
    /// This dealer's share was already applied
    Duplicate,
    Applied { remaining: usize },
    Completed,
}

struct KeyEntry {
    params: ThresholdKeyGenParams,
    own_index: u64,
    state: KeyState,
    share: SensitiveScalar<Fr>,
    public_key: PublicPoint,
    dealers: BTreeSet<NodeName>,
}

/// Key share store of one node
pub struct KeyManager {
    node: NodeName,
    g: G1,
    h: G1,
    entries: Mutex<HashMap<KeyId, KeyEntry>>,
}

impl KeyManager {
    pub fn new(node: impl Into<NodeName>) -> Self {
        Self {
            node: node.into(),
            g: G1::generator(),
            h: pedersen_h(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<KeyId, KeyEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Opens a round for `params.key_id`.
    ///
    /// Repeating GENERATE with identical parameters is harmless while the
    /// round has not failed; anything else on an existing key id is a
    /// protocol error.
    pub fn begin(&self, params: &ThresholdKeyGenParams) -> Result<Begin, MixnetError> {
        let own_index = params.index_of(&self.node).ok_or_else(|| {
            MixnetError::Protocol(format!("{} is not a participant", self.node))
        })?;

        let mut entries = self.entries();
        if let Some(existing) = entries.get(&params.key_id) {
            return match &existing.state {
                KeyState::Failed(reason) => Err(MixnetError::Protocol(format!(
                    "key {} failed: {}",
                    params.key_id, reason
                ))),
                _ if existing.params == *params => Ok(Begin::AlreadyOpen),
                _ => Err(MixnetError::Protocol(format!(
                    "key {} already exists",
                    params.key_id
                ))),
            };
        }
        entries.insert(
            params.key_id.clone(),
            KeyEntry {
                params: params.clone(),
                own_index,
                state: KeyState::Pending,
                share: SensitiveScalar::zero(),
                public_key: PublicPoint::identity(params.algorithm),
                dealers: BTreeSet::new(),
            },
        );
        debug!(node = %self.node, key_id = %params.key_id, index = own_index, "key generation pending");
        Ok(Begin::Opened(own_index))
    }

    /// Moves a pending round to `Failed`. Complete entries are left alone.
    pub fn fail(&self, key_id: &str, reason: &str) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(key_id) {
            if entry.state == KeyState::Pending {
                warn!(node = %self.node, key_id, "key generation failed: {}", reason);
                entry.state = KeyState::Failed(reason.to_string());
            }
        }
    }

    /// Verifies a dealer's share and folds it into the local key share.
    pub fn apply_share(&self, message: &StoreMessage) -> Result<ApplyOutcome, MixnetError> {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&message.key_id) else {
            return Ok(ApplyOutcome::NotReady);
        };

        match &entry.state {
            KeyState::Complete => return Ok(ApplyOutcome::Duplicate),
            KeyState::Failed(reason) => {
                return Err(MixnetError::Protocol(format!(
                    "key {} failed: {}",
                    message.key_id, reason
                )))
            }
            KeyState::Pending => {}
        }
        if !entry.params.nodes.contains(&message.dealer) {
            return Err(MixnetError::Protocol(format!(
                "{} is not a participant of key {}",
                message.dealer, message.key_id
            )));
        }
        if entry.dealers.contains(&message.dealer) {
            return Ok(ApplyOutcome::Duplicate);
        }

        let (value, point) = match self.check_share(entry, &message.share) {
            Ok(checked) => checked,
            Err(err) => {
                warn!(
                    node = %self.node,
                    key_id = %message.key_id,
                    dealer = %message.dealer,
                    "rejecting share: {}", err
                );
                entry.state = KeyState::Failed(err.to_string());
                return Err(err);
            }
        };

        entry.public_key = entry.public_key.add(point)?;
        entry.share = SensitiveScalar::new(*entry.share.expose_secret() + value);
        entry.dealers.insert(message.dealer.clone());

        let remaining = entry.params.nodes.len() - entry.dealers.len();
        if remaining == 0 {
            entry.state = KeyState::Complete;
            info!(node = %self.node, key_id = %message.key_id, "key generation complete");
            Ok(ApplyOutcome::Completed)
        } else {
            debug!(
                node = %self.node,
                key_id = %message.key_id,
                dealer = %message.dealer,
                remaining,
                "share applied"
            );
            Ok(ApplyOutcome::Applied { remaining })
        }
    }

    fn check_share(
        &self,
        entry: &KeyEntry,
        message: &SecretShareMessage,
    ) -> Result<(Fr, PublicPoint), MixnetError> {
        let malformed = |e: MixnetError| MixnetError::InvalidShare(format!("malformed share: {}", e));

        if message.index != entry.own_index {
            return Err(MixnetError::InvalidShare(format!(
                "share index {} addressed to index {}",
                message.index, entry.own_index
            )));
        }
        if message.commitment_factors.len() != entry.params.threshold {
            return Err(MixnetError::InvalidShare(format!(
                "{} commitment factors for threshold {}",
                message.commitment_factors.len(),
                entry.params.threshold
            )));
        }

        let share = PedersenShare::<Curve> {
            index: message.index,
            value: from_bytes(&message.value).map_err(malformed)?,
            witness: from_bytes(&message.witness).map_err(malformed)?,
        };
        let commitments = message
            .commitment_factors
            .iter()
            .map(|c| from_bytes::<G1Affine>(c).map(G1::from))
            .collect::<Result<Vec<_>, _>>()
            .map_err(malformed)?;
        let point = PublicPoint::from_bytes(entry.params.algorithm, &message.public_point)
            .map_err(malformed)?;

        verify_share::<Curve>(&share, &commitments, self.g, self.h)?;
        Ok((share.value, point))
    }

    pub fn state(&self, key_id: &str) -> Option<KeyState> {
        self.entries().get(key_id).map(|e| e.state.clone())
    }

    pub fn params(&self, key_id: &str) -> Option<ThresholdKeyGenParams> {
        self.entries().get(key_id).map(|e| e.params.clone())
    }

    /// State of every round this node knows, by key id
    pub fn states(&self) -> BTreeMap<KeyId, KeyState> {
        self.entries()
            .iter()
            .map(|(key_id, entry)| (key_id.clone(), entry.state.clone()))
            .collect()
    }

    pub fn has_private_key(&self, key_id: &str) -> bool {
        matches!(self.state(key_id), Some(KeyState::Complete))
    }

    /// Public key of a complete round
    pub fn public_key(&self, key_id: &str) -> Option<PublicPoint> {
        self.entries()
            .get(key_id)
            .filter(|e| e.state == KeyState::Complete)
            .map(|e| e.public_key)
    }

    /// Compressed public key of a complete round
    pub fn fetch_public_key(&self, key_id: &str) -> Option<Vec<u8>> {
        self.public_key(key_id).and_then(|pk| pk.to_bytes().ok())
    }

    pub fn get_partial_private_key(&self, key_id: &str) -> Result<KeyShare, MixnetError> {
        let entries = self.entries();
        let entry = entries
            .get(key_id)
            .filter(|e| e.state == KeyState::Complete)
            .ok_or_else(|| MixnetError::UnknownKey(key_id.to_string()))?;

        Ok(KeyShare {
            key_id: key_id.to_string(),
            algorithm: entry.params.algorithm,
            index: entry.own_index,
            threshold: entry.params.threshold,
            nodes: entry.params.nodes.clone(),
            share: entry.share.clone(),
        })
    }
}

/// Deals one round: a fresh Pedersen sharing from `dealer` to every participant.
pub fn deal_shares<R: RngCore>(
    params: &ThresholdKeyGenParams,
    dealer: &str,
    rng: &mut R,
) -> Result<Vec<(NodeName, StoreMessage)>, MixnetError> {
    let g = G1::generator();
    let dealing = PedersenDealer::<Curve>::new(params.threshold, g, pedersen_h(), rng)?;

    let commitment_factors = G1::normalize_batch(dealing.commitments())
        .iter()
        .map(to_bytes)
        .collect::<Result<Vec<_>, _>>()?;
    let public_point = PublicPoint::from_scalar(params.algorithm, &dealing.secret()).to_bytes()?;

    let shares = dealing.deal_all(params.nodes.len())?;
    let mut messages = Vec::with_capacity(params.nodes.len());
    for (node, share) in params.nodes.iter().zip(shares) {
        messages.push((
            node.clone(),
            StoreMessage {
                key_id: params.key_id.clone(),
                dealer: dealer.to_string(),
                share: SecretShareMessage {
                    index: share.index,
                    value: to_bytes(&share.value)?,
                    witness: to_bytes(&share.witness)?,
                    commitment_factors: commitment_factors.clone(),
                    public_point: public_point.clone(),
                },
            },
        ));
    }
    Ok(messages)
}
