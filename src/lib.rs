//! Verifiable Mix Network Node
//!
//! This library implements a node of a verifiable mix network on BLS12-381:
//! threshold key generation without a dealer, bulletin boards of ElGamal
//! ciphertexts, a multi-hop re-encryption shuffle with committed seeds and
//! challengeable transcripts, threshold decryption with auditable challenge
//! logs, and threshold BLS signing.
//!
//! ## Overview
//!
//! A node is a [`node::NodeContext`] hosting a set of services. Commands from
//! peers and from the admin are dispatched to the first service able to
//! handle them; protocol work that has to wait (an unreachable peer, a share
//! that overtook its round) is retried on the node's bounded task pool.
//!
//! ## Key Components
//!
//! - **Key generation**: Pedersen VSS dealt by every participant (GENERATE / STORE)
//! - **Boards**: append-only ciphertext rows with dense indices
//! - **Shuffle**: permute and re-encrypt per hop, commit to a seed, reveal on request,
//!   open links against a public challenge
//! - **Decryption**: partial factors with Chaum-Pedersen proofs, challenge log verifier
//! - **Signing**: partial BLS signatures combined by the admin
//!
//! ## Example
//!
//! ```rust,no_run
//! use mixnet_node::admin::MixnetAdmin;
//! use mixnet_node::config::NodeConfig;
//! use mixnet_node::crypto::{elgamal::encode_u64, CiphertextRow, Curve};
//! use mixnet_node::messages::Algorithm;
//! use mixnet_node::network::InMemoryNetwork;
//!
//! # async fn run() -> Result<(), mixnet_node::MixnetError> {
//! let names: Vec<String> = ["A", "B", "C"].iter().map(|n| n.to_string()).collect();
//! let network = InMemoryNetwork::new();
//! let _nodes = network.spawn_nodes(names.iter().map(NodeConfig::new).collect())?;
//! let admin = MixnetAdmin::new(network.peer_map(&names));
//!
//! // Key generation
//! let pk = admin.generate_key("k", Algorithm::EcElGamal, 2, &names).await?.as_g1()?;
//!
//! // Upload, shuffle along every node, decrypt
//! let mut rng = ark_std::test_rng();
//! let rows: Vec<_> = (0..10u64)
//!     .map(|m| CiphertextRow::<Curve>::encrypt(pk, &[encode_u64::<Curve>(m)], &mut rng))
//!     .collect();
//! admin.upload("X", "A", &rows).await?;
//! let receipt = admin.shuffle("X", "A", "k", &names).await?;
//! let audit = admin.verify_shuffle(&receipt, true).await?;
//! let plaintexts = admin.download("X", "A", "k").await?;
//! # let _ = (audit, plaintexts);
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod challenge;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod keys;
pub mod messages;
pub mod network;
pub mod node;
pub mod peer;
pub mod security;
pub mod services;
pub mod transcript;
pub mod utils;

pub use error::MixnetError;
