//! Bulletin board hosting
//!
//! A board is an append-only list of ciphertext rows with dense indices
//! starting at 0. Index assignment happens under the board lock, so concurrent
//! uploads never produce gaps or duplicates. Adopting a shuffle output only
//! replaces the rows the shuffle consumed; later uploads keep their indices.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::{debug, info};

use super::{into_reply, unknown_command};
use crate::crypto::{CiphertextRow, Curve};
use crate::error::MixnetError;
use crate::messages::{
    BoardEntry, BoardUploadIndexedMessage, Capability, Command, MessageReply, NodeName,
    ReplyPayload, ServiceType,
};
use crate::node::{NodeHandle, Service};
use crate::utils::from_bytes;

#[derive(Default)]
pub struct BoardService {
    boards: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

fn check_row(data: &[u8]) -> Result<(), MixnetError> {
    from_bytes::<CiphertextRow<Curve>>(data)
        .map(|_| ())
        .map_err(|e| MixnetError::Protocol(format!("malformed board entry: {}", e)))
}

impl BoardService {
    pub fn new() -> Self {
        Self::default()
    }

    fn boards(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Vec<u8>>>> {
        self.boards.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn upload(&self, board: String, data: Vec<u8>) -> Result<MessageReply, MixnetError> {
        check_row(&data)?;
        let mut boards = self.boards();
        let entries = boards.entry(board).or_default();
        let index = entries.len() as u64;
        entries.push(data);
        Ok(MessageReply::with(ReplyPayload::BoardIndex(index)))
    }

    fn upload_indexed(&self, message: BoardUploadIndexedMessage) -> Result<MessageReply, MixnetError> {
        check_row(&message.data)?;
        let mut boards = self.boards();
        let entries = boards.entry(message.board_name).or_default();
        let next = entries.len() as u64;
        if message.index != next {
            return Err(MixnetError::Protocol(format!(
                "index {} is not the next free index {}",
                message.index, next
            )));
        }
        entries.push(message.data);
        Ok(MessageReply::with(ReplyPayload::BoardIndex(next)))
    }

    fn download(&self, board: &str) -> Result<MessageReply, MixnetError> {
        let boards = self.boards();
        let entries = boards
            .get(board)
            .ok_or_else(|| MixnetError::Protocol(format!("no such board {}", board)))?;
        Ok(MessageReply::with(ReplyPayload::Board(
            entries
                .iter()
                .enumerate()
                .map(|(index, data)| BoardEntry {
                    index: index as u64,
                    data: data.clone(),
                })
                .collect(),
        )))
    }

    /// Replaces the first `consumed` rows by the output of a finished shuffle step.
    async fn adopt(
        &self,
        node: &NodeHandle,
        board: String,
        operation: u64,
        step: u32,
        source: NodeName,
        consumed: u64,
    ) -> Result<MessageReply, MixnetError> {
        if !self.boards().contains_key(&board) {
            return Err(MixnetError::Protocol(format!("no such board {}", board)));
        }

        let reply = node
            .request(&source, Command::FetchTranscript { operation, step })
            .await?;
        let transcript = match reply {
            MessageReply::Okay(Some(ReplyPayload::Transcript(t)))
                if t.operation == operation && t.step == step =>
            {
                t
            }
            MessageReply::Okay(_) => {
                return Err(MixnetError::Protocol(format!(
                    "{} has no transcript for step {} of operation {}",
                    source, step, operation
                )))
            }
            MessageReply::Error(reason) => {
                return Err(MixnetError::Remote {
                    node: source,
                    reason,
                })
            }
        };
        if transcript.rows.len() as u64 != consumed {
            return Err(MixnetError::Protocol(format!(
                "step {} of operation {} has {} rows, the shuffle consumed {}",
                step,
                operation,
                transcript.rows.len(),
                consumed
            )));
        }
        for row in &transcript.rows {
            check_row(row)?;
        }

        let mut boards = self.boards();
        let entries = boards
            .get_mut(&board)
            .ok_or_else(|| MixnetError::Protocol(format!("no such board {}", board)))?;
        if (entries.len() as u64) < consumed {
            return Err(MixnetError::Protocol(format!(
                "board {} has {} rows, fewer than the {} the shuffle consumed",
                board,
                entries.len(),
                consumed
            )));
        }
        let kept = entries.len() - transcript.rows.len();
        entries.splice(..transcript.rows.len(), transcript.rows);
        info!(node = %node.name(), board = %board, operation, step, consumed, kept, "board prefix replaced by shuffle output");
        Ok(MessageReply::ok())
    }
}

#[async_trait]
impl Service for BoardService {
    fn capability(&self) -> Capability {
        Capability {
            service: ServiceType::Board,
            parameters: Vec::new(),
        }
    }

    fn statistics(&self) -> BTreeMap<String, u64> {
        let boards = self.boards();
        BTreeMap::from([
            ("boards".to_string(), boards.len() as u64),
            (
                "entries".to_string(),
                boards.values().map(|rows| rows.len() as u64).sum(),
            ),
        ])
    }

    async fn handle(&self, node: &NodeHandle, command: Command) -> MessageReply {
        match command {
            Command::BoardUpload { board, data } => {
                debug!(node = %node.name(), board = %board, "upload");
                into_reply("UPLOAD", self.upload(board, data))
            }
            Command::BoardUploadIndexed(message) => {
                into_reply("UPLOAD_INDEXED", self.upload_indexed(message))
            }
            Command::BoardDownload { board } => into_reply("DOWNLOAD", self.download(&board)),
            Command::BoardAdopt {
                board,
                operation,
                step,
                source,
                consumed,
            } => into_reply(
                "ADOPT",
                self.adopt(node, board, operation, step, source, consumed).await,
            ),
            other => unknown_command(&other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::crypto::elgamal::encode_u64;
    use crate::crypto::G1;
    use crate::messages::{Algorithm, ShuffleOperation, ThresholdKeyGenParams};
    use crate::node::NodeContext;
    use crate::transcript::MULTI_COLUMN_ROW;
    use crate::utils::to_bytes;
    use ark_ec::PrimeGroup;
    use std::collections::{HashMap as Map, HashSet};
    use std::sync::Arc;

    fn row(m: u64) -> Vec<u8> {
        let mut rng = ark_std::test_rng();
        let pk = G1::generator();
        to_bytes(&CiphertextRow::<Curve>::encrypt(pk, &[encode_u64::<Curve>(m)], &mut rng)).unwrap()
    }

    fn index_of(reply: MessageReply) -> u64 {
        match reply {
            MessageReply::Okay(Some(ReplyPayload::BoardIndex(i))) => i,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_uploads_get_dense_indices() {
        let node = NodeContext::new(NodeConfig::new("A"), Map::new()).unwrap();
        let data = row(1);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let node = Arc::clone(&node);
            let data = data.clone();
            handles.push(tokio::spawn(async move {
                node.dispatch(Command::BoardUpload {
                    board: "X".into(),
                    data,
                })
                .await
            }));
        }

        let mut indices = HashSet::new();
        for handle in handles {
            assert!(indices.insert(index_of(handle.await.unwrap())));
        }
        assert_eq!(indices, (0..50).collect::<HashSet<u64>>());

        match node.dispatch(Command::BoardDownload { board: "X".into() }).await {
            MessageReply::Okay(Some(ReplyPayload::Board(entries))) => {
                assert_eq!(entries.len(), 50);
                assert!(entries.iter().enumerate().all(|(i, e)| e.index == i as u64));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_indexed_upload_must_be_next() {
        let service = BoardService::new();
        let upload = |index| BoardUploadIndexedMessage {
            board_name: "Y".into(),
            index,
            data: row(index),
        };

        assert!(service.upload_indexed(upload(0)).is_ok());
        assert!(service.upload_indexed(upload(2)).is_err());
        assert!(service.upload_indexed(upload(0)).is_err());
        assert!(service.upload_indexed(upload(1)).is_ok());
    }

    fn entries_of(reply: MessageReply) -> Vec<BoardEntry> {
        match reply {
            MessageReply::Okay(Some(ReplyPayload::Board(entries))) => entries,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_adopt_keeps_rows_uploaded_during_the_shuffle() {
        let node = NodeContext::new(NodeConfig::new("A"), Map::new()).unwrap();
        let params = ThresholdKeyGenParams {
            key_id: "k".into(),
            algorithm: Algorithm::EcElGamal,
            parameters: "BLS12-381".into(),
            threshold: 1,
            nodes: vec!["A".into()],
        };
        assert!(node.dispatch(Command::Generate(params)).await.is_ok());
        while node.key_manager().public_key("k").is_none() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        for m in 0..3 {
            node.dispatch(Command::BoardUpload {
                board: "X".into(),
                data: row(m),
            })
            .await;
        }
        let reply = node
            .dispatch(Command::ShuffleStep {
                operation: ShuffleOperation {
                    number: 1,
                    board: "X".into(),
                    board_host: "A".into(),
                    transform: MULTI_COLUMN_ROW.into(),
                    key_id: "k".into(),
                    path: vec!["A".into()],
                },
                step: 1,
            })
            .await;
        assert!(reply.is_ok(), "{:?}", reply);
        loop {
            match node.dispatch(Command::FetchCommitment { operation: 1, step: 1 }).await {
                MessageReply::Okay(Some(ReplyPayload::Commitment(_))) => break,
                MessageReply::Okay(_) => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
                MessageReply::Error(reason) => panic!("hop failed: {}", reason),
            }
        }

        // Arrives after the first hop took its input
        let late = row(99);
        let index = index_of(
            node.dispatch(Command::BoardUpload {
                board: "X".into(),
                data: late.clone(),
            })
            .await,
        );
        assert_eq!(index, 3);

        let adopt = Command::BoardAdopt {
            board: "X".into(),
            operation: 1,
            step: 1,
            source: "A".into(),
            consumed: 3,
        };
        assert!(node.dispatch(adopt.clone()).await.is_ok());
        let entries = entries_of(node.dispatch(Command::BoardDownload { board: "X".into() }).await);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[3].data, late);

        // Repeating the adoption changes nothing
        assert!(node.dispatch(adopt).await.is_ok());
        let again = entries_of(node.dispatch(Command::BoardDownload { board: "X".into() }).await);
        assert_eq!(again, entries);

        let wrong_size = Command::BoardAdopt {
            board: "X".into(),
            operation: 1,
            step: 1,
            source: "A".into(),
            consumed: 4,
        };
        assert!(!node.dispatch(wrong_size).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_malformed_rows_and_unknown_boards() {
        let service = BoardService::new();
        assert!(service.upload("X".into(), vec![1, 2, 3]).is_err());
        assert!(service.download("X").is_err());
    }
}
