//! Binary encoding of protocol messages and challenge log records
//!
//! Messages travel as a bincode-encoded `(version, Message)` pair with a size
//! limit on both directions. Log records are length-prefixed bincode values.

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use std::io::{ErrorKind, Read, Write};

use crate::error::MixnetError;
use crate::messages::Message;

/// Wire format version carried in every envelope
pub const WIRE_VERSION: u8 = 1;

/// Maximum encoded message size (10 MB)
pub const MAX_MESSAGE_SIZE: u64 = 10 * 1024 * 1024;

fn options() -> impl Options {
    bincode::options().with_limit(MAX_MESSAGE_SIZE)
}

pub fn encode(message: &Message) -> Result<Vec<u8>, MixnetError> {
    Ok(options().serialize(&(WIRE_VERSION, message))?)
}

pub fn decode(bytes: &[u8]) -> Result<Message, MixnetError> {
    let (version, message): (u8, Message) = options().deserialize(bytes)?;
    if version != WIRE_VERSION {
        return Err(MixnetError::Serialization(format!(
            "unsupported wire version {} (expected {})",
            version, WIRE_VERSION
        )));
    }
    Ok(message)
}

/// Writes one length-prefixed record.
pub fn write_record<W: Write, T: Serialize>(writer: &mut W, record: &T) -> Result<(), MixnetError> {
    let bytes = options().serialize(record)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| MixnetError::Serialization("record too large".to_string()))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&bytes)?;
    Ok(())
}

/// Reads the next record, or `None` at a clean end of stream.
pub fn read_record<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, MixnetError> {
    read_frame(reader)?
        .map(|frame| decode_record(&frame))
        .transpose()
}

/// Reads the next length-prefixed frame without decoding it.
///
/// Only an end of stream before the first prefix byte is clean; a cut in the
/// prefix or the body is an error.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, MixnetError> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(MixnetError::Serialization(format!(
                    "record length cut after {} bytes",
                    filled
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_le_bytes(len_bytes) as u64;
    if len > MAX_MESSAGE_SIZE {
        return Err(MixnetError::Serialization(format!(
            "record of {} bytes exceeds limit",
            len
        )));
    }

    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    Ok(Some(bytes))
}

pub fn decode_record<T: DeserializeOwned>(frame: &[u8]) -> Result<T, MixnetError> {
    Ok(options().deserialize(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{BoardUploadIndexedMessage, Command, MessageReply, ReplyPayload};
    use std::io::Cursor;

    #[test]
    fn test_command_encoding() {
        let message = Message::Command(Command::BoardUploadIndexed(BoardUploadIndexedMessage {
            board_name: "X".into(),
            index: 3,
            data: vec![1, 2, 3],
        }));
        let bytes = encode(&message).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let message = Message::Reply(MessageReply::with(ReplyPayload::BoardIndex(7)));
        let mut bytes = encode(&message).unwrap();
        bytes[0] = WIRE_VERSION + 1;
        assert!(matches!(decode(&bytes), Err(MixnetError::Serialization(_))));
    }

    #[test]
    fn test_rejects_truncated_message() {
        let message = Message::Reply(MessageReply::error("no such board"));
        let bytes = encode(&message).unwrap();
        assert!(decode(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_records_stream() {
        let mut log = Vec::new();
        write_record(&mut log, &(1u64, "first".to_string())).unwrap();
        write_record(&mut log, &(2u64, "second".to_string())).unwrap();

        let mut reader = Cursor::new(log);
        let first: Option<(u64, String)> = read_record(&mut reader).unwrap();
        let second: Option<(u64, String)> = read_record(&mut reader).unwrap();
        let end: Option<(u64, String)> = read_record(&mut reader).unwrap();

        assert_eq!(first, Some((1, "first".to_string())));
        assert_eq!(second, Some((2, "second".to_string())));
        assert_eq!(end, None);
    }

    #[test]
    fn test_cut_length_prefix_is_an_error() {
        let mut log = Vec::new();
        write_record(&mut log, &7u64).unwrap();
        log.extend_from_slice(&[3, 0]);

        let mut reader = Cursor::new(log);
        assert_eq!(read_record::<_, u64>(&mut reader).unwrap(), Some(7));
        assert!(matches!(
            read_record::<_, u64>(&mut reader),
            Err(MixnetError::Serialization(_))
        ));

        let mut empty = Cursor::new(Vec::new());
        assert_eq!(read_record::<_, u64>(&mut empty).unwrap(), None);

        let mut cut_body = Cursor::new(vec![8, 0, 0, 0, 1, 2]);
        assert!(read_record::<_, u64>(&mut cut_body).is_err());
    }
}
