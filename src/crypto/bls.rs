//! Threshold BLS signatures on BLS12-381
//!
//! Signatures live in G1 and public keys in G2. A key share `x_i` signs as
//! `sigma_i = H(m)^{x_i}`; each partial is checked against the signer's
//! verification key `g2^{x_i}` with a pairing before the partials are combined
//! by Lagrange interpolation.

use ark_ec::{pairing::Pairing, PrimeGroup};
use ark_ff::Zero;

use super::{Curve, Fr, G1, G2};
use crate::error::MixnetError;
use crate::utils::{hash_to_g1, lagrange_coefficients_at_zero};

const SIGNATURE_DOMAIN: &[u8] = b"mixnet-node/bls-signature/v1";

pub fn hash_message(message: &[u8]) -> G1 {
    hash_to_g1(SIGNATURE_DOMAIN, message)
}

pub fn partial_sign(share: &Fr, message: &[u8]) -> G1 {
    hash_message(message) * share
}

/// `e(sigma, g2) == e(H(m), pk)`
pub fn verify(signature: G1, message: &[u8], public_key: G2) -> Result<(), MixnetError> {
    let lhs = Curve::pairing(signature, G2::generator());
    let rhs = Curve::pairing(hash_message(message), public_key);
    if lhs == rhs {
        Ok(())
    } else {
        Err(MixnetError::DecryptionProof(
            "signature does not verify under the given key".to_string(),
        ))
    }
}

/// Combines at least threshold `(index, partial)` pairs into the group signature.
pub fn combine(partials: &[(u64, G1)]) -> Result<G1, MixnetError> {
    let indices: Vec<u64> = partials.iter().map(|(i, _)| *i).collect();
    let lambdas = lagrange_coefficients_at_zero::<Fr>(&indices)?;

    let mut signature = G1::zero();
    for ((_, partial), lambda) in partials.iter().zip(lambdas.iter()) {
        signature += *partial * lambda;
    }
    Ok(signature)
}
