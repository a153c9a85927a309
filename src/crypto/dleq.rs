//! Chaum-Pedersen proofs of discrete log equality
//!
//! Proves `log_g(vk) == log_c1(d)` without revealing the exponent, which is
//! what a verifier needs to trust a partial decryption factor `d = c1^x`
//! against the published verification key `vk = g^x`. Non-interactive via
//! Fiat-Shamir over BLAKE2b-512.

use ark_ec::{pairing::Pairing, CurveGroup, PrimeGroup};
use ark_ff::{PrimeField, UniformRand};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::rand::RngCore;
use blake2::{Blake2b512, Digest};

use crate::error::MixnetError;

const DLEQ_DOMAIN: &[u8] = b"mixnet-node/dleq/v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct DleqProof<E: Pairing> {
    pub challenge: E::ScalarField,
    pub response: E::ScalarField,
}

fn challenge_scalar<E: Pairing>(points: &[E::G1]) -> Result<E::ScalarField, MixnetError> {
    let mut hasher = Blake2b512::new();
    hasher.update(DLEQ_DOMAIN);
    let mut buffer = Vec::new();
    for point in E::G1::normalize_batch(points) {
        buffer.clear();
        point.serialize_compressed(&mut buffer)?;
        hasher.update(&buffer);
    }
    Ok(E::ScalarField::from_le_bytes_mod_order(&hasher.finalize()))
}

impl<E: Pairing> DleqProof<E> {
    /// Proves that `vk = g^secret` and `factor = base^secret`.
    pub fn prove<R: RngCore>(
        secret: &E::ScalarField,
        base: E::G1,
        vk: E::G1,
        factor: E::G1,
        rng: &mut R,
    ) -> Result<Self, MixnetError> {
        let g = E::G1::generator();
        let nonce = E::ScalarField::rand(rng);
        let a1 = g * nonce;
        let a2 = base * nonce;

        let challenge = challenge_scalar::<E>(&[g, vk, base, factor, a1, a2])?;
        Ok(Self {
            challenge,
            response: nonce + challenge * secret,
        })
    }

    /// Recomputes the commitments from the response and checks the challenge.
    pub fn verify(&self, base: E::G1, vk: E::G1, factor: E::G1) -> Result<(), MixnetError> {
        let g = E::G1::generator();
        let a1 = g * self.response - vk * self.challenge;
        let a2 = base * self.response - factor * self.challenge;

        let expected = challenge_scalar::<E>(&[g, vk, base, factor, a1, a2])?;
        if expected == self.challenge {
            Ok(())
        } else {
            Err(MixnetError::DecryptionProof(
                "partial decryption factor does not match verification key".to_string(),
            ))
        }
    }
}
