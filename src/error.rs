//! Error types for the mix network node

use crate::peer::ConnectionError;

/// Errors raised by the node services, the admin client and the verifiers.
///
/// Variants fall into the four classes the protocol distinguishes:
/// connectivity (retried), protocol/state (reported as an ERROR reply),
/// cryptographic verification (hard failure, never retried) and local
/// readiness (handled by deferral, so it never surfaces here).
#[derive(Debug, thiserror::Error)]
pub enum MixnetError {
    /// Invalid parameter provided (e.g. threshold of zero, duplicate nodes)
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Message that makes no sense in the current protocol state
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer could not be reached
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Encoding or decoding failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Key material requested for a key this node does not hold
    #[error("unknown key: {0}")]
    UnknownKey(String),

    /// Seed reveal does not open its commitment
    #[error("commitment check failed: {0}")]
    CommitmentMismatch(String),

    /// Secret share inconsistent with its commitment factors
    #[error("share verification failed: {0}")]
    InvalidShare(String),

    /// Shuffle witness does not prove the step relation
    #[error("transcript verification failed: {0}")]
    TranscriptProof(String),

    /// Partial decryption or signature proof does not hold
    #[error("decryption verification failed: {0}")]
    DecryptionProof(String),

    /// ERROR reply returned by a remote node
    #[error("remote error from {node}: {reason}")]
    Remote { node: String, reason: String },

    /// The task pool no longer accepts work
    #[error("node is shutting down")]
    ShuttingDown,
}

impl MixnetError {
    /// Cryptographic verification failures are final; retrying cannot fix them.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            MixnetError::CommitmentMismatch(_)
                | MixnetError::InvalidShare(_)
                | MixnetError::TranscriptProof(_)
                | MixnetError::DecryptionProof(_)
        )
    }

    /// Only connectivity problems are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MixnetError::Connection(_))
    }
}

impl From<ark_serialize::SerializationError> for MixnetError {
    fn from(err: ark_serialize::SerializationError) -> Self {
        MixnetError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for MixnetError {
    fn from(err: bincode::Error) -> Self {
        MixnetError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for MixnetError {
    fn from(err: std::io::Error) -> Self {
        MixnetError::Serialization(format!("io: {}", err))
    }
}

pub type Result<T, E = MixnetError> = std::result::Result<T, E>;
