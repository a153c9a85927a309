//! Pedersen Verifiable Secret Sharing for distributed key generation
//!
//! Every participant of a key generation round acts as a dealer: it samples a
//! random polynomial `f` of degree `t - 1` together with a blinding polynomial
//! `f'`, publishes `C_j = g^{a_j} h^{b_j}` for every coefficient pair and sends
//! `(f(i), f'(i))` to participant `i`. The commitments are perfectly hiding, so
//! nothing about `f(0)` leaks before the shares are combined.
//!
//! The joint secret is the sum of all dealers' constant terms; a participant's
//! key share is the sum of the values it received.

use ark_ec::pairing::Pairing;
use ark_ff::{UniformRand, Zero};
use ark_poly::{univariate::DensePolynomial, DenseUVPolynomial, Polynomial};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::rand::RngCore;
use std::marker::PhantomData;

use crate::error::MixnetError;

/// Share sent from a dealer to one participant
#[derive(Clone, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct PedersenShare<E: Pairing> {
    /// Participant index (1-based)
    pub index: u64,
    /// `f(index)`
    pub value: E::ScalarField,
    /// `f'(index)`, the blinding evaluation
    pub witness: E::ScalarField,
}

/// VSS dealer (party creating shares)
pub struct PedersenDealer<E: Pairing> {
    polynomial: DensePolynomial<E::ScalarField>,
    blinding: DensePolynomial<E::ScalarField>,
    commitments: Vec<E::G1>,
    _phantom: PhantomData<E>,
}

impl<E: Pairing> PedersenDealer<E> {
    /// Create a new dealer with a random secret
    ///
    /// # Arguments
    /// * `threshold` - Number of shares needed to reconstruct (degree is t-1)
    /// * `g` - The group generator
    /// * `h` - Second generator with unknown discrete log relative to `g`
    /// * `rng` - Random number generator
    pub fn new<R: RngCore>(
        threshold: usize,
        g: E::G1,
        h: E::G1,
        rng: &mut R,
    ) -> Result<Self, MixnetError> {
        if threshold == 0 {
            return Err(MixnetError::InvalidParameter(
                "threshold must be at least 1".to_string(),
            ));
        }

        let coefficients: Vec<E::ScalarField> =
            (0..threshold).map(|_| E::ScalarField::rand(rng)).collect();
        let blinding: Vec<E::ScalarField> =
            (0..threshold).map(|_| E::ScalarField::rand(rng)).collect();

        let commitments = coefficients
            .iter()
            .zip(blinding.iter())
            .map(|(a, b)| g * a + h * b)
            .collect();

        Ok(Self {
            polynomial: DensePolynomial::from_coefficients_vec(coefficients),
            blinding: DensePolynomial::from_coefficients_vec(blinding),
            commitments,
            _phantom: PhantomData,
        })
    }

    /// The dealer's contribution to the joint secret
    pub fn secret(&self) -> E::ScalarField {
        self.polynomial
            .coeffs()
            .first()
            .copied()
            .unwrap_or_else(E::ScalarField::zero)
    }

    pub fn commitments(&self) -> &[E::G1] {
        &self.commitments
    }

    /// Generate the share for participant `index` (1-indexed)
    pub fn deal(&self, index: u64) -> Result<PedersenShare<E>, MixnetError> {
        if index == 0 {
            return Err(MixnetError::InvalidParameter(
                "participant index must be >= 1".to_string(),
            ));
        }

        let x = E::ScalarField::from(index);
        Ok(PedersenShare {
            index,
            value: self.polynomial.evaluate(&x),
            witness: self.blinding.evaluate(&x),
        })
    }

    /// Generate shares for participants `1..=n`
    pub fn deal_all(&self, n: usize) -> Result<Vec<PedersenShare<E>>, MixnetError> {
        (1..=n as u64).map(|i| self.deal(i)).collect()
    }
}

/// Checks `g^{value} h^{witness} == prod_j C_j^{index^j}`.
///
/// Returns an error (never `Ok(false)`) so callers can surface the reason.
pub fn verify_share<E: Pairing>(
    share: &PedersenShare<E>,
    commitments: &[E::G1],
    g: E::G1,
    h: E::G1,
) -> Result<(), MixnetError> {
    if commitments.is_empty() {
        return Err(MixnetError::InvalidShare(
            "no commitment factors provided".to_string(),
        ));
    }
    if share.index == 0 {
        return Err(MixnetError::InvalidShare("share index 0".to_string()));
    }

    let x = E::ScalarField::from(share.index);
    let mut x_power = E::ScalarField::from(1u64);
    let mut expected = commitments[0];
    for commitment in commitments.iter().skip(1) {
        x_power *= x;
        expected += *commitment * x_power;
    }

    if g * share.value + h * share.witness == expected {
        Ok(())
    } else {
        Err(MixnetError::InvalidShare(format!(
            "share {} does not match its commitment factors",
            share.index
        )))
    }
}
