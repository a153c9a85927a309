//! EC-ElGamal over G1 with re-encryption and threshold decryption
//!
//! A ciphertext of the point `m` under public key `pk = g^x` is
//! `(c1, c2) = (g^r, m + pk^r)`. Re-encrypting with fresh `s` gives
//! `(c1 + g^s, c2 + pk^s)`, an encryption of the same `m` that cannot be
//! linked to its input without knowing `s`.
//!
//! Threshold decryption: each share holder publishes `d_i = c1^{x_i}`; any `t`
//! of them combine to `c1^x` by Lagrange interpolation in the exponent.

use ark_ec::{pairing::Pairing, PrimeGroup};
use ark_ff::{UniformRand, Zero};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::rand::RngCore;

use crate::error::MixnetError;
use crate::utils::lagrange_coefficients_at_zero;

/// Single ElGamal ciphertext
#[derive(Clone, Copy, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct Ciphertext<E: Pairing> {
    pub c1: E::G1,
    pub c2: E::G1,
}

impl<E: Pairing> Ciphertext<E> {
    /// Encrypts a point with explicit randomness.
    pub fn encrypt_with(pk: E::G1, message: E::G1, r: E::ScalarField) -> Self {
        Self {
            c1: E::G1::generator() * r,
            c2: message + pk * r,
        }
    }

    /// Re-randomizes the ciphertext; the plaintext is unchanged.
    pub fn reencrypt(&self, pk: E::G1, r: E::ScalarField) -> Self {
        Self {
            c1: self.c1 + E::G1::generator() * r,
            c2: self.c2 + pk * r,
        }
    }

    /// Partial decryption factor for one key share
    pub fn partial_decrypt(&self, share: &E::ScalarField) -> E::G1 {
        self.c1 * share
    }

    /// Full decryption with the whole private key (tests and single-node keys)
    pub fn decrypt(&self, sk: &E::ScalarField) -> E::G1 {
        self.c2 - self.c1 * sk
    }
}

/// Encrypts `message` under `pk` with fresh randomness.
pub fn encrypt<E: Pairing, R: RngCore>(pk: E::G1, message: E::G1, rng: &mut R) -> Ciphertext<E> {
    Ciphertext::encrypt_with(pk, message, E::ScalarField::rand(rng))
}

/// Maps a small integer onto the curve as `g^m`.
pub fn encode_u64<E: Pairing>(m: u64) -> E::G1 {
    E::G1::generator() * E::ScalarField::from(m)
}

/// Inverse of [`encode_u64`] by search over `0..bound`; only for small values.
pub fn decode_u64<E: Pairing>(point: E::G1, bound: u64) -> Option<u64> {
    let g = E::G1::generator();
    let mut candidate = E::G1::zero();
    for m in 0..bound {
        if candidate == point {
            return Some(m);
        }
        candidate += g;
    }
    None
}

/// One board entry: a row of ciphertexts that are shuffled together
#[derive(Clone, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct CiphertextRow<E: Pairing> {
    pub columns: Vec<Ciphertext<E>>,
}

impl<E: Pairing> CiphertextRow<E> {
    pub fn new(columns: Vec<Ciphertext<E>>) -> Self {
        Self { columns }
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Encrypts each plaintext point as its own column.
    pub fn encrypt<R: RngCore>(pk: E::G1, messages: &[E::G1], rng: &mut R) -> Self {
        Self {
            columns: messages.iter().map(|m| encrypt(pk, *m, rng)).collect(),
        }
    }

    /// Re-encrypts every column with its own randomness.
    pub fn reencrypt(&self, pk: E::G1, randomness: &[E::ScalarField]) -> Result<Self, MixnetError> {
        if randomness.len() != self.columns.len() {
            return Err(MixnetError::InvalidParameter(format!(
                "{} randomness values for {} columns",
                randomness.len(),
                self.columns.len()
            )));
        }
        Ok(Self {
            columns: self
                .columns
                .iter()
                .zip(randomness.iter())
                .map(|(c, r)| c.reencrypt(pk, *r))
                .collect(),
        })
    }
}

/// Recovers the plaintext from `(share index, partial factor)` pairs.
///
/// `m = c2 - sum_i lambda_i d_i`. The caller must supply at least threshold
/// factors from distinct indices; fewer silently produce garbage.
pub fn combine_partials<E: Pairing>(
    ciphertext: &Ciphertext<E>,
    partials: &[(u64, E::G1)],
) -> Result<E::G1, MixnetError> {
    let indices: Vec<u64> = partials.iter().map(|(i, _)| *i).collect();
    let lambdas = lagrange_coefficients_at_zero::<E::ScalarField>(&indices)?;

    let mut blinding = E::G1::zero();
    for ((_, d), lambda) in partials.iter().zip(lambdas.iter()) {
        blinding += *d * lambda;
    }
    Ok(ciphertext.c2 - blinding)
}
