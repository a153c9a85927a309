//! Shuffle and commitment coordinator
//!
//! A node performs the hops of a shuffle operation that name it in the path.
//! For hop `k` it fetches the step `k - 1` board (the input board from the
//! board host for the first hop, otherwise the previous hop's general
//! transcript), shuffles it with a private seed, records the result as the
//! step `k` transcript and commits to a fresh seed contribution. Seeds are
//! revealed on request; witnesses are released only after the reveal and for
//! a single challenge per step.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use super::{into_reply, unknown_command};
use crate::crypto::commitment::{random_seed, SeedContribution};
use crate::crypto::{G1Affine, G1, SeedCommitment};
use crate::error::MixnetError;
use crate::executor::{Attempt, RetryTask};
use crate::messages::{
    Capability, Command, MessageReply, ReplyPayload, ServiceType, ShuffleOperation,
};
use crate::node::{NodeHandle, Service};
use crate::peer::ConnectionError;
use crate::transcript::{reveal_links, transform_by_name, transform_names, ShuffleOutcome, StepTranscript};
use crate::utils::from_bytes;

struct CompletedHop {
    output: StepTranscript,
    outcome: ShuffleOutcome,
    contribution: SeedContribution,
    commitment: SeedCommitment,
    revealed: bool,
    challenge: Option<(Vec<u8>, bool)>,
}

enum HopState {
    Running,
    Ready(Box<CompletedHop>),
    Failed(String),
}

struct OperationRecord {
    operation: ShuffleOperation,
    /// Step 0 transcript, kept by the node performing the first hop
    input: Option<StepTranscript>,
    hops: BTreeMap<u32, HopState>,
}

type Operations = Arc<Mutex<HashMap<u64, OperationRecord>>>;

fn lock(operations: &Operations) -> std::sync::MutexGuard<'_, HashMap<u64, OperationRecord>> {
    operations.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub struct ShuffleService {
    operations: Operations,
}

impl ShuffleService {
    pub fn new() -> Self {
        Self::default()
    }

    fn start_step(
        &self,
        node: &NodeHandle,
        operation: ShuffleOperation,
        step: u32,
    ) -> Result<MessageReply, MixnetError> {
        if step == 0 || step as usize > operation.path.len() {
            return Err(MixnetError::InvalidParameter(format!(
                "step {} outside path of {} hops",
                step,
                operation.path.len()
            )));
        }
        if operation.path[step as usize - 1] != node.name() {
            return Err(MixnetError::Protocol(format!(
                "hop {} belongs to {}",
                step,
                operation.path[step as usize - 1]
            )));
        }
        if transform_by_name(&operation.transform).is_none() {
            return Err(MixnetError::Protocol(format!(
                "unknown transform {}",
                operation.transform
            )));
        }

        {
            let mut operations = lock(&self.operations);
            let record = operations
                .entry(operation.number)
                .or_insert_with(|| OperationRecord {
                    operation: operation.clone(),
                    input: None,
                    hops: BTreeMap::new(),
                });
            if record.operation != operation {
                return Err(MixnetError::Protocol(format!(
                    "operation number {} already used for another shuffle",
                    operation.number
                )));
            }
            if record.hops.contains_key(&step) {
                debug!(node = %node.name(), operation = operation.number, step, "hop already started");
                return Ok(MessageReply::ok());
            }
            record.hops.insert(step, HopState::Running);
        }

        debug!(node = %node.name(), operation = operation.number, step, "starting shuffle hop");
        node.start_retry(
            ShuffleHopTask {
                node: node.clone(),
                operations: Arc::clone(&self.operations),
                operation,
                step,
            },
            node.config().shuffle_retry_interval(),
        )?;
        Ok(MessageReply::ok())
    }

    /// Runs `f` on a completed hop; `Ok(None)` while the hop is still running.
    fn with_hop<T>(
        &self,
        operation: u64,
        step: u32,
        f: impl FnOnce(&mut CompletedHop) -> Result<T, MixnetError>,
    ) -> Result<Option<T>, MixnetError> {
        let mut operations = lock(&self.operations);
        let record = operations
            .get_mut(&operation)
            .ok_or_else(|| MixnetError::Protocol(format!("unknown operation {}", operation)))?;
        match record.hops.get_mut(&step) {
            Some(HopState::Ready(hop)) => f(hop).map(Some),
            Some(HopState::Running) => Ok(None),
            Some(HopState::Failed(reason)) => Err(MixnetError::Protocol(format!(
                "step {} failed: {}",
                step, reason
            ))),
            None => Err(MixnetError::Protocol(format!(
                "step {} of operation {} is not performed here",
                step, operation
            ))),
        }
    }

    fn fetch_commitment(&self, operation: u64, step: u32) -> Result<MessageReply, MixnetError> {
        Ok(self
            .with_hop(operation, step, |hop| Ok(hop.commitment.clone()))?
            .map(|c| MessageReply::with(ReplyPayload::Commitment(c)))
            .unwrap_or_else(MessageReply::ok))
    }

    fn reveal_seed(&self, operation: u64, step: u32) -> Result<MessageReply, MixnetError> {
        let reveal = self.with_hop(operation, step, |hop| {
            hop.revealed = true;
            Ok(hop.contribution.reveal())
        })?;
        reveal
            .map(|r| MessageReply::with(ReplyPayload::SeedReveal(r)))
            .ok_or_else(|| MixnetError::Protocol(format!("step {} is not complete", step)))
    }

    fn fetch_transcript(&self, operation: u64, step: u32) -> Result<MessageReply, MixnetError> {
        if step == 0 {
            let operations = lock(&self.operations);
            let record = operations
                .get(&operation)
                .ok_or_else(|| MixnetError::Protocol(format!("unknown operation {}", operation)))?;
            return match (&record.input, record.hops.get(&1)) {
                (Some(input), _) => Ok(MessageReply::with(ReplyPayload::Transcript(input.clone()))),
                (None, Some(HopState::Running)) => Ok(MessageReply::ok()),
                _ => Err(MixnetError::Protocol(format!(
                    "no input transcript for operation {}",
                    operation
                ))),
            };
        }

        Ok(self
            .with_hop(operation, step, |hop| Ok(hop.output.clone()))?
            .map(|t| MessageReply::with(ReplyPayload::Transcript(t)))
            .unwrap_or_else(MessageReply::ok))
    }

    fn fetch_witness(
        &self,
        operation: u64,
        step: u32,
        challenge: Vec<u8>,
        pairing: bool,
    ) -> Result<MessageReply, MixnetError> {
        let witness = self.with_hop(operation, step, |hop| {
            if !hop.revealed {
                return Err(MixnetError::Protocol(format!(
                    "seed for step {} has not been revealed",
                    step
                )));
            }
            match &hop.challenge {
                Some((answered, answered_pairing))
                    if *answered != challenge || *answered_pairing != pairing =>
                {
                    return Err(MixnetError::Protocol(format!(
                        "step {} already answered a different challenge",
                        step
                    )));
                }
                Some(_) => {}
                None => hop.challenge = Some((challenge.clone(), pairing)),
            }
            reveal_links(&hop.outcome, operation, step, &challenge, pairing)
        })?;
        witness
            .map(|w| MessageReply::with(ReplyPayload::Witness(w)))
            .ok_or_else(|| MixnetError::Protocol(format!("step {} is not complete", step)))
    }
}

#[async_trait]
impl Service for ShuffleService {
    fn capability(&self) -> Capability {
        Capability {
            service: ServiceType::Shuffle,
            parameters: transform_names(),
        }
    }

    fn statistics(&self) -> BTreeMap<String, u64> {
        let operations = lock(&self.operations);
        let mut stats = BTreeMap::from([
            ("operations".to_string(), operations.len() as u64),
            ("hops_running".to_string(), 0),
            ("hops_ready".to_string(), 0),
            ("hops_failed".to_string(), 0),
        ]);
        for hop in operations.values().flat_map(|record| record.hops.values()) {
            let name = match hop {
                HopState::Running => "hops_running",
                HopState::Ready(_) => "hops_ready",
                HopState::Failed(_) => "hops_failed",
            };
            *stats.entry(name.to_string()).or_default() += 1;
        }
        stats
    }

    async fn handle(&self, node: &NodeHandle, command: Command) -> MessageReply {
        match command {
            Command::ShuffleStep { operation, step } => {
                into_reply("SHUFFLE", self.start_step(node, operation, step))
            }
            Command::FetchCommitment { operation, step } => {
                into_reply("FETCH_COMMITMENT", self.fetch_commitment(operation, step))
            }
            Command::RevealSeed { operation, step } => {
                into_reply("REVEAL_SEED", self.reveal_seed(operation, step))
            }
            Command::FetchTranscript { operation, step } => {
                into_reply("FETCH_TRANSCRIPT", self.fetch_transcript(operation, step))
            }
            Command::FetchWitness {
                operation,
                step,
                challenge,
                pairing,
            } => into_reply(
                "FETCH_WITNESS",
                self.fetch_witness(operation, step, challenge, pairing),
            ),
            other => unknown_command(&other),
        }
    }
}

/// Performs one hop; retried while the input or key is not yet reachable
struct ShuffleHopTask {
    node: NodeHandle,
    operations: Operations,
    operation: ShuffleOperation,
    step: u32,
}

impl ShuffleHopTask {
    /// Unwraps a reply, mapping connectivity and "not ready" to `None`.
    async fn request(&self, target: &str, command: Command) -> Result<Option<ReplyPayload>, MixnetError> {
        match self.node.request(target, command).await {
            Ok(MessageReply::Okay(payload)) => Ok(payload),
            Ok(MessageReply::Error(reason)) => Err(MixnetError::Remote {
                node: target.to_string(),
                reason,
            }),
            Err(e @ ConnectionError::UnknownPeer(_)) => Err(e.into()),
            Err(e) => {
                debug!(node = %self.node.name(), target, "waiting for peer: {}", e);
                Ok(None)
            }
        }
    }

    /// The shuffle key, from the local store or the board host. A key the
    /// host does not know fails the hop; one still being generated is waited for.
    async fn public_key(&self) -> Result<Option<G1>, MixnetError> {
        let key_id = &self.operation.key_id;
        if let Some(pk) = self.node.keys().public_key(key_id) {
            return pk.as_g1().map(Some);
        }
        let host = &self.operation.board_host;
        let command = Command::FetchPublicKey {
            key_id: key_id.clone(),
        };
        match self.request(host, command).await {
            Ok(Some(ReplyPayload::PublicKey(bytes))) => Ok(Some(from_bytes::<G1Affine>(&bytes)?.into())),
            Ok(Some(other)) => Err(MixnetError::Protocol(format!(
                "{} answered a key request with {:?}",
                host, other
            ))),
            Ok(None) => Ok(None),
            Err(MixnetError::Remote { reason, .. }) => Err(MixnetError::UnknownKey(format!(
                "{} on {}: {}",
                key_id, host, reason
            ))),
            Err(e) => Err(e),
        }
    }

    async fn input(&self) -> Result<Option<StepTranscript>, MixnetError> {
        let number = self.operation.number;
        if self.step == 1 {
            let command = Command::BoardDownload {
                board: self.operation.board.clone(),
            };
            return match self.request(&self.operation.board_host, command).await? {
                Some(ReplyPayload::Board(mut entries)) => {
                    entries.sort_by_key(|e| e.index);
                    Ok(Some(StepTranscript {
                        operation: number,
                        step: 0,
                        rows: entries.into_iter().map(|e| e.data).collect(),
                    }))
                }
                _ => Ok(None),
            };
        }

        let previous = self.step - 1;
        let source = &self.operation.path[previous as usize - 1];
        let command = Command::FetchTranscript {
            operation: number,
            step: previous,
        };
        match self.request(source, command).await? {
            Some(ReplyPayload::Transcript(t)) if t.operation == number && t.step == previous => Ok(Some(t)),
            Some(_) => Err(MixnetError::Protocol(format!(
                "{} returned an unexpected transcript",
                source
            ))),
            None => Ok(None),
        }
    }

    async fn run(&self) -> Result<bool, MixnetError> {
        let Some(pk) = self.public_key().await? else {
            return Ok(false);
        };
        let Some(input) = self.input().await? else {
            return Ok(false);
        };

        let transform = transform_by_name(&self.operation.transform).ok_or_else(|| {
            MixnetError::Protocol(format!("unknown transform {}", self.operation.transform))
        })?;
        let rows = input.decode_rows()?;
        let outcome = transform.apply(&rows, pk, &random_seed())?;
        let output = StepTranscript::from_rows(self.operation.number, self.step, &outcome.output)?;

        let contribution = SeedContribution::generate();
        let commitment = contribution.commitment();
        info!(
            node = %self.node.name(),
            operation = self.operation.number,
            step = self.step,
            rows = output.rows.len(),
            commitment = %&commitment.to_hex()[..16],
            "shuffle hop complete"
        );

        let mut operations = lock(&self.operations);
        if let Some(record) = operations.get_mut(&self.operation.number) {
            if self.step == 1 {
                record.input = Some(input);
            }
            record.hops.insert(
                self.step,
                HopState::Ready(Box::new(CompletedHop {
                    output,
                    outcome,
                    contribution,
                    commitment,
                    revealed: false,
                    challenge: None,
                })),
            );
        }
        Ok(true)
    }

    fn fail(&self, reason: String) {
        let mut operations = lock(&self.operations);
        if let Some(record) = operations.get_mut(&self.operation.number) {
            record.hops.insert(self.step, HopState::Failed(reason));
        }
    }
}

#[async_trait]
impl RetryTask for ShuffleHopTask {
    fn describe(&self) -> String {
        format!("shuffle {} step {}", self.operation.number, self.step)
    }

    async fn attempt(&self, _attempt: u32) -> Attempt {
        match self.run().await {
            Ok(true) => Attempt::Done,
            Ok(false) => Attempt::Retry,
            Err(e) => {
                error!(
                    node = %self.node.name(),
                    operation = self.operation.number,
                    step = self.step,
                    "shuffle hop failed: {}", e
                );
                self.fail(e.to_string());
                Attempt::Done
            }
        }
    }

    fn on_abandoned(&self, attempts: u32) {
        self.fail(format!("input unavailable after {} attempts", attempts));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::crypto::elgamal::encode_u64;
    use crate::crypto::{CiphertextRow, Curve};
    use crate::messages::{Algorithm, ThresholdKeyGenParams};
    use crate::network::InMemoryNetwork;
    use crate::node::NodeContext;
    use crate::transcript::MULTI_COLUMN_ROW;
    use crate::utils::to_bytes;
    use std::time::Duration;

    async fn single_node_with_board(rows: u64) -> Arc<NodeContext> {
        let network = InMemoryNetwork::new();
        let config = NodeConfig::new("A")
            .with_retry_intervals(Duration::from_millis(10), Duration::from_millis(10));
        let node = network.spawn_nodes(vec![config]).unwrap().remove(0);

        let params = ThresholdKeyGenParams {
            key_id: "k".into(),
            algorithm: Algorithm::EcElGamal,
            parameters: "BLS12-381".into(),
            threshold: 1,
            nodes: vec!["A".into()],
        };
        assert!(node.dispatch(Command::Generate(params)).await.is_ok());
        let pk = node.key_manager().public_key("k").unwrap().as_g1().unwrap();

        let mut rng = ark_std::test_rng();
        for m in 0..rows {
            let row = CiphertextRow::<Curve>::encrypt(pk, &[encode_u64::<Curve>(m)], &mut rng);
            let reply = node
                .dispatch(Command::BoardUpload {
                    board: "X".into(),
                    data: to_bytes(&row).unwrap(),
                })
                .await;
            assert!(reply.is_ok());
        }
        node
    }

    fn operation(path: &[&str]) -> ShuffleOperation {
        ShuffleOperation {
            number: 1,
            board: "X".into(),
            board_host: "A".into(),
            transform: MULTI_COLUMN_ROW.into(),
            key_id: "k".into(),
            path: path.iter().map(|p| p.to_string()).collect(),
        }
    }

    async fn wait_for_commitment(node: &NodeContext, step: u32) -> SeedCommitment {
        for _ in 0..500 {
            match node.dispatch(Command::FetchCommitment { operation: 1, step }).await {
                MessageReply::Okay(Some(ReplyPayload::Commitment(c))) => return c,
                MessageReply::Okay(None) => tokio::time::sleep(Duration::from_millis(10)).await,
                other => panic!("unexpected reply {:?}", other),
            }
        }
        panic!("step {} never completed", step);
    }

    #[tokio::test]
    async fn test_hops_on_one_node_and_reveal_gating() {
        let node = single_node_with_board(6).await;
        let op = operation(&["A", "A"]);

        for step in 1..=2 {
            let reply = node
                .dispatch(Command::ShuffleStep {
                    operation: op.clone(),
                    step,
                })
                .await;
            assert!(reply.is_ok());
            wait_for_commitment(&node, step).await;
        }

        // Repeating a step is acknowledged and keeps the committed result
        let first = wait_for_commitment(&node, 1).await;
        let again = node
            .dispatch(Command::ShuffleStep {
                operation: op.clone(),
                step: 1,
            })
            .await;
        assert!(again.is_ok());
        assert_eq!(wait_for_commitment(&node, 1).await, first);

        // The same number for a different shuffle is refused
        let mut other = op.clone();
        other.board = "Y".into();
        let reused = node
            .dispatch(Command::ShuffleStep {
                operation: other,
                step: 1,
            })
            .await;
        assert!(!reused.is_ok());

        let stats = node.statistics();
        let (_, stats) = stats
            .services
            .iter()
            .find(|(service, _)| *service == ServiceType::Shuffle)
            .unwrap();
        assert_eq!(stats.get("operations"), Some(&1));
        assert_eq!(stats.get("hops_ready"), Some(&2));
        assert_eq!(stats.get("hops_failed"), Some(&0));

        let witness_request = |challenge: Vec<u8>| Command::FetchWitness {
            operation: 1,
            step: 2,
            challenge,
            pairing: true,
        };

        // No witness before the seed is revealed
        assert!(!node.dispatch(witness_request(vec![1; 64])).await.is_ok());

        let reveal = node.dispatch(Command::RevealSeed { operation: 1, step: 2 }).await;
        let commitment = wait_for_commitment(&node, 2).await;
        match reveal {
            MessageReply::Okay(Some(ReplyPayload::SeedReveal(r))) => commitment.verify(&r).unwrap(),
            other => panic!("unexpected reply {:?}", other),
        }

        assert!(node.dispatch(witness_request(vec![1; 64])).await.is_ok());
        // The same challenge may be asked again, a different one may not
        assert!(node.dispatch(witness_request(vec![1; 64])).await.is_ok());
        assert!(!node.dispatch(witness_request(vec![2; 64])).await.is_ok());

        // Step 0 is the input board, held by the first hop
        match node.dispatch(Command::FetchTranscript { operation: 1, step: 0 }).await {
            MessageReply::Okay(Some(ReplyPayload::Transcript(t))) => {
                assert_eq!(t.step, 0);
                assert_eq!(t.rows.len(), 6);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejects_foreign_hops_and_unknown_transforms() {
        let node = single_node_with_board(2).await;

        let reply = node
            .dispatch(Command::ShuffleStep {
                operation: operation(&["B"]),
                step: 1,
            })
            .await;
        assert!(matches!(reply, MessageReply::Error(r) if r.contains("belongs to B")));

        let mut op = operation(&["A"]);
        op.transform = "rotate".into();
        let reply = node.dispatch(Command::ShuffleStep { operation: op, step: 1 }).await;
        assert!(matches!(reply, MessageReply::Error(r) if r.contains("unknown transform")));

        let reply = node
            .dispatch(Command::ShuffleStep {
                operation: operation(&["A"]),
                step: 2,
            })
            .await;
        assert!(!reply.is_ok());
    }

    #[tokio::test]
    async fn test_missing_board_fails_the_hop() {
        let node = single_node_with_board(1).await;
        let mut op = operation(&["A"]);
        op.board = "missing".into();

        assert!(node
            .dispatch(Command::ShuffleStep { operation: op, step: 1 })
            .await
            .is_ok());

        let mut failed = false;
        for _ in 0..100 {
            match node.dispatch(Command::FetchCommitment { operation: 1, step: 1 }).await {
                MessageReply::Error(reason) => {
                    assert!(reason.contains("no such board"));
                    failed = true;
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_unknown_key_fails_the_hop() {
        let node = single_node_with_board(2).await;
        let mut op = operation(&["A"]);
        op.key_id = "missing".into();

        assert!(node
            .dispatch(Command::ShuffleStep { operation: op, step: 1 })
            .await
            .is_ok());

        let mut reason = None;
        for _ in 0..100 {
            match node.dispatch(Command::FetchCommitment { operation: 1, step: 1 }).await {
                MessageReply::Error(r) => {
                    reason = Some(r);
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        let reason = reason.expect("hop never failed");
        assert!(reason.contains("unknown key"));
    }
}
