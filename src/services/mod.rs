//! Protocol services installed on a node
//!
//! Each service owns its protocol state and translates every internal failure
//! into an ERROR reply; nothing crosses the dispatch boundary as a panic.

pub mod board;
pub mod decryption;
pub mod keygen;
pub mod shuffle;
pub mod signing;

pub use board::BoardService;
pub use decryption::DecryptionService;
pub use keygen::KeyGenerationService;
pub use shuffle::ShuffleService;
pub use signing::SigningService;

use crate::error::MixnetError;
use crate::messages::{Command, MessageReply};

/// Reply for a command that reached a service that does not handle it
pub(crate) fn unknown_command(command: &Command) -> MessageReply {
    MessageReply::error(format!("Unknown command: {:?}", command.kind()))
}

/// `Ok` replies pass through; errors become `"<what> failure: <reason>"`
pub(crate) fn into_reply(what: &str, result: Result<MessageReply, MixnetError>) -> MessageReply {
    result.unwrap_or_else(|e| MessageReply::error(format!("{} failure: {}", what, e)))
}
