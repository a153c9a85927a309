//! Security utilities for protecting sensitive protocol data
//!
//! This module provides:
//! - Zeroizing wrappers for key shares, shuffle seeds and commitment witnesses
//! - Constant-time comparison for byte strings

use ark_ff::Field;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Wrapper for sensitive scalar field elements that ensures zeroization on drop
///
/// Used for a node's accumulated key share and for shuffle re-encryption
/// randomness held until a witness transcript is produced.
#[derive(Clone)]
pub struct SensitiveScalar<F: Field> {
    value: F,
}

impl<F: Field> SensitiveScalar<F> {
    pub fn new(value: F) -> Self {
        Self { value }
    }

    /// Get a reference to the inner value
    pub fn expose_secret(&self) -> &F {
        &self.value
    }

    pub fn zero() -> Self {
        Self { value: F::zero() }
    }
}

impl<F: Field> Zeroize for SensitiveScalar<F> {
    fn zeroize(&mut self) {
        self.value = F::zero();
    }
}

impl<F: Field> ZeroizeOnDrop for SensitiveScalar<F> {}

impl<F: Field> Drop for SensitiveScalar<F> {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl<F: Field> std::fmt::Debug for SensitiveScalar<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SensitiveScalar([REDACTED])")
    }
}

/// Byte string that is wiped when dropped (seeds, commitment witnesses)
#[derive(Clone, PartialEq, Eq)]
pub struct SensitiveBytes {
    inner: Vec<u8>,
}

impl SensitiveBytes {
    pub fn new(inner: Vec<u8>) -> Self {
        Self { inner }
    }

    pub fn expose_secret(&self) -> &[u8] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Zeroize for SensitiveBytes {
    fn zeroize(&mut self) {
        self.inner.zeroize();
    }
}

impl ZeroizeOnDrop for SensitiveBytes {}

impl Drop for SensitiveBytes {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl std::fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SensitiveBytes(len={}, [REDACTED])", self.inner.len())
    }
}

/// Constant-time byte slice comparison
///
/// The length is not secret and is compared first.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}
