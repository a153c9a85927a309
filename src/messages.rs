//! Protocol message types exchanged between nodes and the admin client

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::commitment::{SeedCommitment, SeedReveal};
use crate::keys::KeyState;
use crate::transcript::{StepTranscript, WitnessTranscript};

/// Node identifier (unique name within the network)
pub type NodeName = String;

/// Threshold key identifier, unique for the lifetime of the network
pub type KeyId = String;

/// Threshold algorithms a key can be generated for
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Threshold EC-ElGamal over G1 (board decryption)
    EcElGamal,
    /// Threshold BLS signatures (public key in G2)
    Bls,
}

/// Kinds of services a node can host
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    KeyGeneration,
    Board,
    Shuffle,
    Decryption,
    Signing,
}

/// What a service advertises; used for dispatch, not identity
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub service: ServiceType,
    pub parameters: Vec<String>,
}

/// Parameters of one key generation round; immutable once the round starts
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ThresholdKeyGenParams {
    pub key_id: KeyId,
    pub algorithm: Algorithm,
    /// Named parameter set, e.g. "BLS12-381"
    pub parameters: String,
    pub threshold: usize,
    /// Ordered participants; a node's share index is its position plus one
    pub nodes: Vec<NodeName>,
}

impl ThresholdKeyGenParams {
    /// 1-based share index of `node`, if it participates
    pub fn index_of(&self, node: &str) -> Option<u64> {
        self.nodes
            .iter()
            .position(|n| n == node)
            .map(|p| p as u64 + 1)
    }
}

/// One dealer's output for one participant. Group elements and scalars are
/// compressed canonical encodings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SecretShareMessage {
    pub index: u64,
    pub value: Vec<u8>,
    pub witness: Vec<u8>,
    pub commitment_factors: Vec<Vec<u8>>,
    pub public_point: Vec<u8>,
}

/// STORE payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub key_id: KeyId,
    /// Node that dealt this share; a dealer's share is applied at most once
    pub dealer: NodeName,
    pub share: SecretShareMessage,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BoardUploadIndexedMessage {
    pub board_name: String,
    pub index: u64,
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BoardEntry {
    pub index: u64,
    pub data: Vec<u8>,
}

/// A shuffle of one board along a path of hops
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShuffleOperation {
    /// Unique per shuffle command
    pub number: u64,
    pub board: String,
    /// Node hosting the board
    pub board_host: NodeName,
    pub transform: String,
    pub key_id: KeyId,
    /// Hop `k` (1-based) is performed by `path[k - 1]`
    pub path: Vec<NodeName>,
}

/// Partial decryption of one ciphertext column
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartialFactor {
    pub factor: Vec<u8>,
    pub proof: Vec<u8>,
}

/// One node's partial decryptions for a batch of rows
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DecryptionShares {
    pub node: NodeName,
    pub index: u64,
    pub verification_key: Vec<u8>,
    /// One entry per requested row, one factor per column
    pub rows: Vec<Vec<PartialFactor>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignatureShare {
    pub node: NodeName,
    pub index: u64,
    pub verification_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Status of one node as reported to the admin
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeStatistics {
    pub node: NodeName,
    pub accepting: bool,
    /// Pool tasks holding a worker
    pub tasks_running: usize,
    /// Pool tasks waiting for a worker or for their delay
    pub tasks_queued: usize,
    pub keys: BTreeMap<KeyId, KeyState>,
    /// Counters reported by each installed service
    pub services: Vec<(ServiceType, BTreeMap<String, u64>)>,
}

/// Commands understood by the node services
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Answered by the router itself
    Capabilities,
    /// Answered by the router itself
    NodeStatistics,

    /// Key generation: start a round
    Generate(ThresholdKeyGenParams),
    /// Key generation: deliver one dealer's share
    Store(StoreMessage),
    /// Key generation: public key of a completed round
    FetchPublicKey { key_id: KeyId },

    /// Board: append at the next free index
    BoardUpload { board: String, data: Vec<u8> },
    /// Board: append at an explicit index, which must be the next free one
    BoardUploadIndexed(BoardUploadIndexedMessage),
    BoardDownload { board: String },
    /// Board: replace the first `consumed` rows, the input the shuffle took,
    /// with a shuffle step's output. Rows appended since stay behind it.
    BoardAdopt {
        board: String,
        operation: u64,
        step: u32,
        source: NodeName,
        consumed: u64,
    },

    /// Shuffle: perform hop `step` of the operation
    ShuffleStep {
        operation: ShuffleOperation,
        step: u32,
    },
    FetchCommitment { operation: u64, step: u32 },
    RevealSeed { operation: u64, step: u32 },
    /// General transcript: step 0 is the input board, step k the output of hop k
    FetchTranscript { operation: u64, step: u32 },
    /// Witness transcript for the link `step - 1 -> step`
    FetchWitness {
        operation: u64,
        step: u32,
        challenge: Vec<u8>,
        pairing: bool,
    },

    /// Decryption: partial factors for compressed `CiphertextRow`s
    PartialDecrypt { key_id: KeyId, rows: Vec<Vec<u8>> },

    /// Signing: partial BLS signature
    PartialSign { key_id: KeyId, message: Vec<u8> },
}

/// Payload-free discriminant of [`Command`], matched exhaustively by services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Capabilities,
    NodeStatistics,
    Generate,
    Store,
    FetchPublicKey,
    BoardUpload,
    BoardUploadIndexed,
    BoardDownload,
    BoardAdopt,
    ShuffleStep,
    FetchCommitment,
    RevealSeed,
    FetchTranscript,
    FetchWitness,
    PartialDecrypt,
    PartialSign,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Capabilities => CommandKind::Capabilities,
            Command::NodeStatistics => CommandKind::NodeStatistics,
            Command::Generate(_) => CommandKind::Generate,
            Command::Store(_) => CommandKind::Store,
            Command::FetchPublicKey { .. } => CommandKind::FetchPublicKey,
            Command::BoardUpload { .. } => CommandKind::BoardUpload,
            Command::BoardUploadIndexed(_) => CommandKind::BoardUploadIndexed,
            Command::BoardDownload { .. } => CommandKind::BoardDownload,
            Command::BoardAdopt { .. } => CommandKind::BoardAdopt,
            Command::ShuffleStep { .. } => CommandKind::ShuffleStep,
            Command::FetchCommitment { .. } => CommandKind::FetchCommitment,
            Command::RevealSeed { .. } => CommandKind::RevealSeed,
            Command::FetchTranscript { .. } => CommandKind::FetchTranscript,
            Command::FetchWitness { .. } => CommandKind::FetchWitness,
            Command::PartialDecrypt { .. } => CommandKind::PartialDecrypt,
            Command::PartialSign { .. } => CommandKind::PartialSign,
        }
    }
}

impl CommandKind {
    /// The service type that handles this command; `None` for router commands.
    pub fn service(self) -> Option<ServiceType> {
        match self {
            CommandKind::Capabilities | CommandKind::NodeStatistics => None,
            CommandKind::Generate | CommandKind::Store | CommandKind::FetchPublicKey => {
                Some(ServiceType::KeyGeneration)
            }
            CommandKind::BoardUpload
            | CommandKind::BoardUploadIndexed
            | CommandKind::BoardDownload
            | CommandKind::BoardAdopt => Some(ServiceType::Board),
            CommandKind::ShuffleStep
            | CommandKind::FetchCommitment
            | CommandKind::RevealSeed
            | CommandKind::FetchTranscript
            | CommandKind::FetchWitness => Some(ServiceType::Shuffle),
            CommandKind::PartialDecrypt => Some(ServiceType::Decryption),
            CommandKind::PartialSign => Some(ServiceType::Signing),
        }
    }
}

/// Typed reply payloads
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ReplyPayload {
    Capabilities(Vec<Capability>),
    Statistics(NodeStatistics),
    PublicKey(Vec<u8>),
    BoardIndex(u64),
    Board(Vec<BoardEntry>),
    Commitment(SeedCommitment),
    SeedReveal(SeedReveal),
    Transcript(StepTranscript),
    Witness(WitnessTranscript),
    PartialDecryptions(DecryptionShares),
    PartialSignature(SignatureShare),
}

/// Reply status with optional payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum MessageReply {
    Okay(Option<ReplyPayload>),
    Error(String),
}

impl MessageReply {
    pub fn ok() -> Self {
        MessageReply::Okay(None)
    }

    pub fn with(payload: ReplyPayload) -> Self {
        MessageReply::Okay(Some(payload))
    }

    pub fn error(reason: impl Into<String>) -> Self {
        MessageReply::Error(reason.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, MessageReply::Okay(_))
    }
}

/// Top-level wire message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Command(Command),
    Reply(MessageReply),
}
