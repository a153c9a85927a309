use ark_ec::AffineRepr;
use ark_ff::{Field, PrimeField};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use blake2::{Blake2b512, Digest};

use crate::crypto::{Fq, G1Affine, G1};
use crate::error::MixnetError;

/// Domain tag for the second Pedersen generator
const PEDERSEN_H_DOMAIN: &[u8] = b"mixnet-node/pedersen-h/v1";

/// Computes the Lagrange coefficients at zero for the given evaluation points.
///
/// `lambda_i = prod_{j != i} x_j / (x_j - x_i)`, so that
/// `f(0) = sum_i lambda_i * f(x_i)` for any polynomial of degree `< points.len()`.
///
/// # Arguments
/// * `points` - Distinct, non-zero share indices (1-based participant positions)
pub fn lagrange_coefficients_at_zero<F: Field>(points: &[u64]) -> Result<Vec<F>, MixnetError> {
    if points.is_empty() {
        return Err(MixnetError::InvalidParameter(
            "at least one point is required".to_string(),
        ));
    }
    for (i, p) in points.iter().enumerate() {
        if *p == 0 {
            return Err(MixnetError::InvalidParameter(
                "share index 0 is reserved for the secret".to_string(),
            ));
        }
        if points[..i].contains(p) {
            return Err(MixnetError::InvalidParameter(format!(
                "duplicate share index {}",
                p
            )));
        }
    }

    let xs: Vec<F> = points.iter().map(|p| F::from(*p)).collect();
    let mut coefficients = Vec::with_capacity(xs.len());
    for (i, xi) in xs.iter().enumerate() {
        let mut numerator = F::one();
        let mut denominator = F::one();
        for (j, xj) in xs.iter().enumerate() {
            if i == j {
                continue;
            }
            numerator *= xj;
            denominator *= *xj - xi;
        }
        let inverse = denominator.inverse().ok_or_else(|| {
            MixnetError::InvalidParameter("degenerate interpolation points".to_string())
        })?;
        coefficients.push(numerator * inverse);
    }
    Ok(coefficients)
}

/// Evaluates `sum_j coeffs[j] * x^j` by Horner's rule.
pub fn evaluate_at<F: Field>(coeffs: &[F], x: F) -> F {
    coeffs.iter().rev().fold(F::zero(), |acc, c| acc * x + c)
}

/// Hashes a message to a G1 point in the prime-order subgroup.
///
/// Try-and-increment: the counter is bumped until the digest reduced into
/// the base field is the x-coordinate of a curve point, then the cofactor is
/// cleared. The discrete log of the result is unknown to everybody.
pub fn hash_to_g1(domain: &[u8], message: &[u8]) -> G1 {
    let mut counter: u32 = 0;
    loop {
        let mut hasher = Blake2b512::new();
        hasher.update((domain.len() as u64).to_le_bytes());
        hasher.update(domain);
        hasher.update(counter.to_le_bytes());
        hasher.update(message);
        let digest = hasher.finalize();

        let x = Fq::from_le_bytes_mod_order(&digest[..]);
        let greatest = digest[0] & 1 == 1;
        if let Some(point) = G1Affine::get_point_from_x_unchecked(x, greatest) {
            let point = point.clear_cofactor();
            if !point.is_zero() {
                return point.into_group();
            }
        }
        counter = counter.wrapping_add(1);
    }
}

/// Second Pedersen generator `h`, independent of the group generator.
pub fn pedersen_h() -> G1 {
    hash_to_g1(PEDERSEN_H_DOMAIN, b"commitment generator")
}

/// Compressed canonical encoding of curve material.
pub fn to_bytes<T: CanonicalSerialize>(value: &T) -> Result<Vec<u8>, MixnetError> {
    let mut bytes = Vec::with_capacity(value.compressed_size());
    value.serialize_compressed(&mut bytes)?;
    Ok(bytes)
}

/// Decodes compressed canonical bytes, validating subgroup membership.
pub fn from_bytes<T: CanonicalDeserialize>(bytes: &[u8]) -> Result<T, MixnetError> {
    Ok(T::deserialize_compressed(bytes)?)
}
