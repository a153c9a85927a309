//! Cryptographic building blocks used by the node services
//!
//! - [`vss`]: Pedersen verifiable secret sharing for the key generation round
//! - [`elgamal`]: EC-ElGamal over G1 with re-encryption and threshold decryption
//! - [`commitment`]: hash commitments to shuffle seeds and seed combination
//! - [`dleq`]: Chaum-Pedersen proofs for partial decryptions
//! - [`bls`]: threshold BLS signatures
//!
//! The generic pieces work over any [`Pairing`]; the node itself runs on BLS12-381.

use ark_ec::pairing::Pairing;

pub mod bls;
pub mod commitment;
pub mod dleq;
pub mod elgamal;
pub mod vss;

pub use ark_bls12_381::Bls12_381 as Curve;

pub type Fr = <Curve as Pairing>::ScalarField;
pub type Fq = ark_bls12_381::Fq;
pub type G1 = <Curve as Pairing>::G1;
pub type G1Affine = <Curve as Pairing>::G1Affine;
pub type G2 = <Curve as Pairing>::G2;
pub type G2Affine = <Curve as Pairing>::G2Affine;

/// The only named parameter set this node supports
pub const SUPPORTED_PARAMETERS: &str = "BLS12-381";

pub use commitment::{combine_seeds, SeedCommitment, SeedReveal};
pub use elgamal::{Ciphertext, CiphertextRow};
pub use vss::{PedersenDealer, PedersenShare};
