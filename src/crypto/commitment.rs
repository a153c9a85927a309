//! Hash commitments to shuffle seed contributions
//!
//! Each shuffle hop commits to a random 32-byte contribution before any hop
//! reveals anything. Once every commitment is published, the contributions are
//! revealed, checked and XOR-combined into a value no single hop controls.

use blake2::{Blake2b512, Digest};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::MixnetError;
use crate::security::{constant_time_eq, SensitiveBytes};

const COMMITMENT_DOMAIN: &[u8] = b"mixnet-node/seed-commitment/v1";

/// Length of seed contributions and commitment witnesses
pub const SEED_LENGTH: usize = 32;

/// Published commitment `H(tag || len(seed) || seed || witness)`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SeedCommitment {
    pub digest: Vec<u8>,
}

/// Opening of a [`SeedCommitment`]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SeedReveal {
    pub seed: Vec<u8>,
    pub witness: Vec<u8>,
}

impl SeedCommitment {
    pub fn commit(seed: &[u8], witness: &[u8]) -> Self {
        let mut hasher = Blake2b512::new();
        hasher.update(COMMITMENT_DOMAIN);
        hasher.update((seed.len() as u64).to_le_bytes());
        hasher.update(seed);
        hasher.update(witness);
        Self {
            digest: hasher.finalize().to_vec(),
        }
    }

    /// Checks the opening in constant time.
    ///
    /// A mismatch is a verification failure and must not be retried.
    pub fn verify(&self, reveal: &SeedReveal) -> Result<(), MixnetError> {
        let recomputed = Self::commit(&reveal.seed, &reveal.witness);
        if constant_time_eq(&recomputed.digest, &self.digest) {
            Ok(())
        } else {
            Err(MixnetError::CommitmentMismatch(
                "revealed seed does not open the commitment".to_string(),
            ))
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

/// Fresh 32-byte secret seed
pub fn random_seed() -> SensitiveBytes {
    let mut seed = vec![0u8; SEED_LENGTH];
    rand::rng().fill_bytes(&mut seed);
    SensitiveBytes::new(seed)
}

/// Fresh seed contribution and commitment witness
pub struct SeedContribution {
    pub seed: SensitiveBytes,
    pub witness: SensitiveBytes,
}

impl SeedContribution {
    pub fn generate() -> Self {
        Self {
            seed: random_seed(),
            witness: random_seed(),
        }
    }

    pub fn commitment(&self) -> SeedCommitment {
        SeedCommitment::commit(self.seed.expose_secret(), self.witness.expose_secret())
    }

    pub fn reveal(&self) -> SeedReveal {
        SeedReveal {
            seed: self.seed.expose_secret().to_vec(),
            witness: self.witness.expose_secret().to_vec(),
        }
    }
}

/// XOR of all revealed seeds; independent of the order of reveals.
pub fn combine_seeds<S: AsRef<[u8]>>(seeds: &[S]) -> Result<Vec<u8>, MixnetError> {
    let first = seeds
        .first()
        .ok_or_else(|| MixnetError::InvalidParameter("no seeds to combine".to_string()))?;
    let mut combined = vec![0u8; first.as_ref().len()];

    for seed in seeds {
        let seed = seed.as_ref();
        if seed.len() != combined.len() {
            return Err(MixnetError::InvalidParameter(format!(
                "seed length {} differs from {}",
                seed.len(),
                combined.len()
            )));
        }
        for (acc, byte) in combined.iter_mut().zip(seed.iter()) {
            *acc ^= byte;
        }
    }
    Ok(combined)
}
