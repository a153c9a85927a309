//! Admin client driving the nodes
//!
//! The admin is not a node: it holds one [`PeerChannel`](crate::peer::PeerChannel) per node and drives
//! every multi-node operation from the outside. Key generation, shuffles and
//! decryption are started with single commands and then polled; the admin
//! checks everything a node hands back (identical public keys, commitments
//! before reveals, witness transcripts, decryption and signature proofs).

use rayon::prelude::*;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::challenge::{ChallengeParticipant, ChallengeRecord, ChallengeShare, DecryptionChallengeSpec};
use crate::crypto::dleq::DleqProof;
use crate::crypto::elgamal::combine_partials;
use crate::crypto::{
    bls, combine_seeds, CiphertextRow, Curve, Fr, G1Affine, G2Affine, SeedCommitment, SeedReveal,
    G1, G2, SUPPORTED_PARAMETERS,
};
use crate::error::MixnetError;
use crate::keys::PublicPoint;
use crate::messages::{
    Algorithm, BoardEntry, Command, DecryptionShares, KeyId, MessageReply, NodeName,
    NodeStatistics, ReplyPayload, ShuffleOperation, ThresholdKeyGenParams,
};
use crate::peer::{ConnectionError, PeerMap};
use crate::transcript::{challenge_seed, verify_witness, StepTranscript, MULTI_COLUMN_ROW};
use crate::utils::{from_bytes, lagrange_coefficients_at_zero, to_bytes};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// What the admin keeps after a successful shuffle
#[derive(Debug, Clone)]
pub struct ShuffleReceipt {
    pub operation: ShuffleOperation,
    /// Seed commitment of hop `k` at position `k - 1`
    pub commitments: Vec<SeedCommitment>,
    /// Digest of the step 0 transcript, checked against the served board
    pub input_digest: Vec<u8>,
    /// Board rows the first hop took as input
    pub consumed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleAudit {
    pub combined_seed: Vec<u8>,
    pub challenge: Vec<u8>,
    pub links_checked: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedRow {
    pub index: u64,
    pub plaintext: Vec<G1>,
}

#[derive(Clone)]
struct KnownKey {
    params: ThresholdKeyGenParams,
    public_key: PublicPoint,
}

/// Partial decryptions collected for one board, already checked
struct DecryptionRun {
    entries: Vec<BoardEntry>,
    shares: Vec<DecryptionShares>,
    public_key: G1,
    rows: Vec<DecryptedRow>,
}

struct Deadline {
    until: Instant,
    interval: Duration,
}

impl Deadline {
    async fn wait(&self, what: &str) -> Result<(), MixnetError> {
        if Instant::now() >= self.until {
            return Err(MixnetError::Protocol(format!("timed out waiting for {}", what)));
        }
        tokio::time::sleep(self.interval).await;
        Ok(())
    }
}

fn decode_g1(bytes: &[u8]) -> Result<G1, MixnetError> {
    Ok(from_bytes::<G1Affine>(bytes)?.into())
}

pub struct MixnetAdmin {
    peers: PeerMap,
    poll_interval: Duration,
    poll_timeout: Duration,
    keys: Mutex<HashMap<KeyId, KnownKey>>,
    next_operation: AtomicU64,
}

impl MixnetAdmin {
    pub fn new(peers: PeerMap) -> Self {
        Self {
            peers,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            keys: Mutex::new(HashMap::new()),
            next_operation: AtomicU64::new(u64::from(rand::random::<u32>())),
        }
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    fn deadline(&self) -> Deadline {
        Deadline {
            until: Instant::now() + self.poll_timeout,
            interval: self.poll_interval,
        }
    }

    fn known_keys(&self) -> std::sync::MutexGuard<'_, HashMap<KeyId, KnownKey>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn known_key(&self, key_id: &str) -> Result<KnownKey, MixnetError> {
        self.known_keys()
            .get(key_id)
            .cloned()
            .ok_or_else(|| MixnetError::UnknownKey(key_id.to_string()))
    }

    /// Sends one command; ERROR replies become [`MixnetError::Remote`].
    async fn call(&self, node: &str, command: Command) -> Result<Option<ReplyPayload>, MixnetError> {
        let peer = self
            .peers
            .get(node)
            .ok_or_else(|| ConnectionError::UnknownPeer(node.to_string()))?;
        match peer.send(command).await? {
            MessageReply::Okay(payload) => Ok(payload),
            MessageReply::Error(reason) => Err(MixnetError::Remote {
                node: node.to_string(),
                reason,
            }),
        }
    }

    /// Like [`MixnetAdmin::call`], but waits out a node that is unreachable for
    /// now. Only for commands a node may safely receive twice.
    async fn call_until_reachable(
        &self,
        node: &str,
        command: Command,
    ) -> Result<Option<ReplyPayload>, MixnetError> {
        let deadline = self.deadline();
        loop {
            match self.call(node, command.clone()).await {
                Err(e @ MixnetError::Connection(ConnectionError::UnknownPeer(_))) => return Err(e),
                Err(e) if e.is_retryable() => debug!(node = %node, "waiting for node: {}", e),
                other => return other,
            }
            deadline.wait(&format!("{} to become reachable", node)).await?;
        }
    }

    /// Runs a key generation round and waits until every participant reports
    /// the same public key.
    pub async fn generate_key(
        &self,
        key_id: &str,
        algorithm: Algorithm,
        threshold: usize,
        nodes: &[NodeName],
    ) -> Result<PublicPoint, MixnetError> {
        if self.known_keys().contains_key(key_id) {
            return Err(MixnetError::InvalidParameter(format!("key {} already exists", key_id)));
        }
        let params = ThresholdKeyGenParams {
            key_id: key_id.to_string(),
            algorithm,
            parameters: SUPPORTED_PARAMETERS.to_string(),
            threshold,
            nodes: nodes.to_vec(),
        };

        for node in nodes {
            self.call_until_reachable(node, Command::Generate(params.clone()))
                .await?;
        }

        let mut agreed: Option<Vec<u8>> = None;
        for node in nodes {
            let deadline = self.deadline();
            let bytes = loop {
                match self.fetch_public_key(node, key_id).await {
                    Ok(Some(bytes)) => break bytes,
                    Ok(None) => {}
                    Err(e) if e.is_retryable() => debug!(node = %node, "waiting for node: {}", e),
                    Err(e) => return Err(e),
                }
                deadline.wait(&format!("public key {} on {}", key_id, node)).await?;
            };
            match &agreed {
                Some(previous) if *previous != bytes => {
                    return Err(MixnetError::Protocol(format!(
                        "{} reports a different public key for {}",
                        node, key_id
                    )))
                }
                Some(_) => {}
                None => agreed = Some(bytes),
            }
        }

        let bytes = agreed
            .ok_or_else(|| MixnetError::InvalidParameter("no participants".to_string()))?;
        let public_key = PublicPoint::from_bytes(algorithm, &bytes)?;
        info!(key_id, ?algorithm, threshold, public_key = %hex::encode(&bytes), "key generated");
        self.known_keys().insert(key_id.to_string(), KnownKey { params, public_key });
        Ok(public_key)
    }

    /// Public key bytes as reported by one node; `None` while incomplete.
    pub async fn fetch_public_key(&self, node: &str, key_id: &str) -> Result<Option<Vec<u8>>, MixnetError> {
        let command = Command::FetchPublicKey {
            key_id: key_id.to_string(),
        };
        match self.call(node, command).await? {
            Some(ReplyPayload::PublicKey(bytes)) => Ok(Some(bytes)),
            _ => Ok(None),
        }
    }

    /// Public key of a round this admin ran
    pub fn public_key(&self, key_id: &str) -> Result<PublicPoint, MixnetError> {
        Ok(self.known_key(key_id)?.public_key)
    }

    pub async fn upload(
        &self,
        board: &str,
        host: &str,
        rows: &[CiphertextRow<Curve>],
    ) -> Result<Vec<u64>, MixnetError> {
        let mut indices = Vec::with_capacity(rows.len());
        for row in rows {
            let command = Command::BoardUpload {
                board: board.to_string(),
                data: to_bytes(row)?,
            };
            match self.call(host, command).await? {
                Some(ReplyPayload::BoardIndex(index)) => indices.push(index),
                other => {
                    return Err(MixnetError::Protocol(format!(
                        "unexpected upload reply {:?}",
                        other
                    )))
                }
            }
        }
        Ok(indices)
    }

    /// Shuffles `board` along `path`, one hop at a time, collecting each
    /// hop's seed commitment before starting the next. The host then adopts
    /// the last hop's output as the board.
    pub async fn shuffle(
        &self,
        board: &str,
        host: &str,
        key_id: &str,
        path: &[NodeName],
    ) -> Result<ShuffleReceipt, MixnetError> {
        let last = path
            .last()
            .ok_or_else(|| MixnetError::InvalidParameter("empty shuffle path".to_string()))?;
        let operation = ShuffleOperation {
            number: self.next_operation.fetch_add(1, Ordering::SeqCst),
            board: board.to_string(),
            board_host: host.to_string(),
            transform: MULTI_COLUMN_ROW.to_string(),
            key_id: key_id.to_string(),
            path: path.to_vec(),
        };

        let mut commitments = Vec::with_capacity(path.len());
        for (position, hop) in path.iter().enumerate() {
            let step = position as u32 + 1;
            self.call_until_reachable(
                hop,
                Command::ShuffleStep {
                    operation: operation.clone(),
                    step,
                },
            )
            .await?;

            let deadline = self.deadline();
            let commitment = loop {
                let command = Command::FetchCommitment {
                    operation: operation.number,
                    step,
                };
                match self.call(hop, command).await {
                    Ok(Some(ReplyPayload::Commitment(c))) => break c,
                    Ok(_) => {}
                    Err(e) if e.is_retryable() => debug!(hop = %hop, "waiting for hop: {}", e),
                    Err(e) => return Err(e),
                }
                deadline.wait(&format!("step {} on {}", step, hop)).await?;
            };
            info!(
                operation = operation.number,
                step,
                hop = %hop,
                commitment = %&commitment.to_hex()[..16],
                "hop committed"
            );
            commitments.push(commitment);
        }

        let input = self.checked_input(&operation).await?;
        let consumed = input.rows.len() as u64;
        self.call_until_reachable(
            host,
            Command::BoardAdopt {
                board: board.to_string(),
                operation: operation.number,
                step: path.len() as u32,
                source: last.clone(),
                consumed,
            },
        )
        .await?;

        Ok(ShuffleReceipt {
            operation,
            commitments,
            input_digest: input.digest(),
            consumed,
        })
    }

    /// The step 0 transcript of the first hop. It must be a prefix of the
    /// board the host serves; rows uploaded after the hop read it may follow.
    async fn checked_input(&self, operation: &ShuffleOperation) -> Result<StepTranscript, MixnetError> {
        let first = &operation.path[0];
        let command = Command::FetchTranscript {
            operation: operation.number,
            step: 0,
        };
        let input = match self.call_until_reachable(first, command).await? {
            Some(ReplyPayload::Transcript(t)) if t.operation == operation.number && t.step == 0 => t,
            other => {
                return Err(MixnetError::Protocol(format!(
                    "{} answered an input request with {:?}",
                    first, other
                )))
            }
        };

        let host = &operation.board_host;
        let command = Command::BoardDownload {
            board: operation.board.clone(),
        };
        let mut served = match self.call_until_reachable(host, command).await? {
            Some(ReplyPayload::Board(entries)) => entries,
            other => {
                return Err(MixnetError::Protocol(format!(
                    "unexpected download reply {:?}",
                    other
                )))
            }
        };
        served.sort_by_key(|e| e.index);
        if served.len() < input.rows.len()
            || served.iter().zip(&input.rows).any(|(entry, row)| entry.data != *row)
        {
            return Err(MixnetError::TranscriptProof(format!(
                "input of operation {} on {} is not board {} as served by {}",
                operation.number, first, operation.board, host
            )));
        }
        Ok(input)
    }

    pub async fn reveal_seeds(&self, receipt: &ShuffleReceipt) -> Result<Vec<SeedReveal>, MixnetError> {
        let operation = &receipt.operation;
        let mut reveals = Vec::with_capacity(operation.path.len());
        for (position, hop) in operation.path.iter().enumerate() {
            let command = Command::RevealSeed {
                operation: operation.number,
                step: position as u32 + 1,
            };
            match self.call(hop, command).await? {
                Some(ReplyPayload::SeedReveal(reveal)) => reveals.push(reveal),
                other => {
                    return Err(MixnetError::Protocol(format!(
                        "{} answered a reveal with {:?}",
                        hop, other
                    )))
                }
            }
        }
        Ok(reveals)
    }

    async fn fetch_transcript(
        &self,
        node: &str,
        operation: u64,
        step: u32,
    ) -> Result<StepTranscript, MixnetError> {
        match self.call(node, Command::FetchTranscript { operation, step }).await? {
            Some(ReplyPayload::Transcript(t)) if t.operation == operation && t.step == step => Ok(t),
            _ => Err(MixnetError::Protocol(format!(
                "{} has no transcript for step {}",
                node, step
            ))),
        }
    }

    /// Checks every reveal against its commitment, derives the public
    /// challenge and verifies every hop's witness.
    pub async fn audit_shuffle(
        &self,
        receipt: &ShuffleReceipt,
        reveals: &[SeedReveal],
        pairing: bool,
    ) -> Result<ShuffleAudit, MixnetError> {
        let operation = &receipt.operation;
        if reveals.len() != receipt.commitments.len() {
            return Err(MixnetError::InvalidParameter(format!(
                "{} reveals for {} commitments",
                reveals.len(),
                receipt.commitments.len()
            )));
        }
        for (position, (commitment, reveal)) in receipt.commitments.iter().zip(reveals).enumerate() {
            commitment.verify(reveal).map_err(|_| {
                MixnetError::CommitmentMismatch(format!(
                    "seed revealed by {} for step {} does not open its commitment",
                    operation.path[position],
                    position + 1
                ))
            })?;
        }
        let seeds: Vec<&[u8]> = reveals.iter().map(|r| r.seed.as_slice()).collect();
        let combined_seed = combine_seeds(&seeds)?;

        let mut transcripts = Vec::with_capacity(operation.path.len() + 1);
        let input = self.fetch_transcript(&operation.path[0], operation.number, 0).await?;
        if input.digest() != receipt.input_digest {
            return Err(MixnetError::TranscriptProof(format!(
                "{} changed the input of operation {} after the shuffle",
                operation.path[0], operation.number
            )));
        }
        transcripts.push(input);
        for (position, hop) in operation.path.iter().enumerate() {
            transcripts.push(
                self.fetch_transcript(hop, operation.number, position as u32 + 1)
                    .await?,
            );
        }
        let challenge = challenge_seed(&transcripts, &combined_seed)?;

        let pk = self.public_key(&operation.key_id)?.as_g1()?;
        let mut links_checked = 0;
        for (position, hop) in operation.path.iter().enumerate() {
            let step = position as u32 + 1;
            let command = Command::FetchWitness {
                operation: operation.number,
                step,
                challenge: challenge.clone(),
                pairing,
            };
            let witness = match self.call(hop, command).await? {
                Some(ReplyPayload::Witness(w)) => w,
                other => {
                    return Err(MixnetError::Protocol(format!(
                        "{} answered a witness request with {:?}",
                        hop, other
                    )))
                }
            };
            links_checked += verify_witness(
                &transcripts[position],
                &transcripts[position + 1],
                &witness,
                pk,
                &challenge,
                pairing,
            )?;
        }

        info!(
            operation = operation.number,
            links_checked,
            challenge = %hex::encode(&challenge[..16]),
            "shuffle verified"
        );
        Ok(ShuffleAudit {
            combined_seed,
            challenge,
            links_checked,
        })
    }

    /// Reveals the seeds of a finished shuffle and audits it.
    pub async fn verify_shuffle(
        &self,
        receipt: &ShuffleReceipt,
        pairing: bool,
    ) -> Result<ShuffleAudit, MixnetError> {
        let reveals = self.reveal_seeds(receipt).await?;
        self.audit_shuffle(receipt, &reveals, pairing).await
    }

    pub async fn node_statistics(&self, node: &str) -> Result<NodeStatistics, MixnetError> {
        match self.call(node, Command::NodeStatistics).await? {
            Some(ReplyPayload::Statistics(stats)) => Ok(stats),
            other => Err(MixnetError::Protocol(format!(
                "{} answered a statistics request with {:?}",
                node, other
            ))),
        }
    }

    /// Statistics of every reachable node, sorted by name. Nodes that cannot
    /// be reached are logged and left out.
    pub async fn network_statistics(&self) -> Vec<NodeStatistics> {
        let mut names: Vec<&NodeName> = self.peers.keys().collect();
        names.sort();
        let mut all = Vec::with_capacity(names.len());
        for node in names {
            match self.node_statistics(node).await {
                Ok(stats) => all.push(stats),
                Err(e) => warn!(node = %node, "no statistics: {}", e),
            }
        }
        all
    }

    /// Threshold-decrypts a board.
    pub async fn download(
        &self,
        board: &str,
        host: &str,
        key_id: &str,
    ) -> Result<Vec<DecryptedRow>, MixnetError> {
        Ok(self.decrypt_board(board, host, key_id).await?.rows)
    }

    /// Threshold-decrypts a board and logs the indices `spec` selects.
    pub async fn download_challenged<W: Write>(
        &self,
        board: &str,
        host: &str,
        key_id: &str,
        spec: &mut DecryptionChallengeSpec<W>,
    ) -> Result<Vec<DecryptedRow>, MixnetError> {
        let run = self.decrypt_board(board, host, key_id).await?;

        let participants = run
            .shares
            .iter()
            .map(|s| ChallengeParticipant {
                node: s.node.clone(),
                index: s.index,
                verification_key: s.verification_key.clone(),
            })
            .collect();
        spec.write(&ChallengeRecord::Header {
            board: board.to_string(),
            key_id: key_id.to_string(),
            participants,
            public_key: to_bytes(&run.public_key)?,
        })?;

        let mut logged = 0;
        for (position, (entry, row)) in run.entries.iter().zip(&run.rows).enumerate() {
            if !spec.selects(entry.index) {
                continue;
            }
            let shares = run
                .shares
                .iter()
                .map(|s| ChallengeShare {
                    participant_index: s.index,
                    factors: s.rows[position].iter().map(|f| f.factor.clone()).collect(),
                    proofs: s.rows[position].iter().map(|f| f.proof.clone()).collect(),
                })
                .collect();
            spec.write(&ChallengeRecord::Entry {
                index: entry.index,
                row: entry.data.clone(),
                shares,
                plaintext: row
                    .plaintext
                    .iter()
                    .map(to_bytes)
                    .collect::<Result<_, _>>()?,
            })?;
            logged += 1;
        }
        info!(board, logged, "decryption challenge logged");
        Ok(run.rows)
    }

    async fn decrypt_board(
        &self,
        board: &str,
        host: &str,
        key_id: &str,
    ) -> Result<DecryptionRun, MixnetError> {
        let key = self.known_key(key_id)?;
        let public_key = key.public_key.as_g1()?;

        let mut entries = match self
            .call(host, Command::BoardDownload { board: board.to_string() })
            .await?
        {
            Some(ReplyPayload::Board(entries)) => entries,
            other => {
                return Err(MixnetError::Protocol(format!(
                    "unexpected download reply {:?}",
                    other
                )))
            }
        };
        entries.sort_by_key(|e| e.index);
        let rows = entries
            .par_iter()
            .map(|e| from_bytes::<CiphertextRow<Curve>>(&e.data))
            .collect::<Result<Vec<_>, _>>()?;
        let request: Vec<Vec<u8>> = entries.iter().map(|e| e.data.clone()).collect();

        let threshold = key.params.threshold;
        let mut shares = Vec::with_capacity(threshold);
        let mut factors = Vec::with_capacity(threshold);
        for node in &key.params.nodes {
            if shares.len() == threshold {
                break;
            }
            let command = Command::PartialDecrypt {
                key_id: key_id.to_string(),
                rows: request.clone(),
            };
            match self.call(node, command).await {
                Ok(Some(ReplyPayload::PartialDecryptions(s))) => {
                    if key.params.index_of(node) != Some(s.index) {
                        return Err(MixnetError::DecryptionProof(format!(
                            "{} answered with share index {}",
                            node, s.index
                        )));
                    }
                    factors.push(check_partials(&rows, &s)?);
                    shares.push(s);
                }
                Ok(other) => warn!(node = %node, "unexpected decryption reply {:?}", other),
                Err(e) if e.is_verification_failure() => return Err(e),
                Err(e) => warn!(node = %node, "skipping node for decryption: {}", e),
            }
        }
        if shares.len() < threshold {
            return Err(MixnetError::Protocol(format!(
                "only {} of {} partial decryptions available",
                shares.len(),
                threshold
            )));
        }

        let verification_keys = factors.iter().map(|(vk, _)| *vk).collect::<Vec<_>>();
        let indices: Vec<u64> = shares.iter().map(|s| s.index).collect();
        check_interpolation(&indices, &verification_keys, public_key)?;

        let decrypted = rows
            .par_iter()
            .enumerate()
            .map(|(position, row)| {
                let plaintext = row
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(column, ciphertext)| {
                        let partials: Vec<(u64, G1)> = indices
                            .iter()
                            .zip(&factors)
                            .map(|(index, (_, f))| (*index, f[position][column]))
                            .collect();
                        combine_partials(ciphertext, &partials)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(DecryptedRow {
                    index: entries[position].index,
                    plaintext,
                })
            })
            .collect::<Result<Vec<_>, MixnetError>>()?;

        info!(board, rows = decrypted.len(), participants = ?indices, "board decrypted");
        Ok(DecryptionRun {
            entries,
            shares,
            public_key,
            rows: decrypted,
        })
    }

    /// Collects threshold partial signatures, checks each with a pairing and
    /// returns the combined signature.
    pub async fn sign(&self, key_id: &str, message: &[u8]) -> Result<G1, MixnetError> {
        let key = self.known_key(key_id)?;
        let public_key = key.public_key.as_g2()?;

        let mut partials = Vec::with_capacity(key.params.threshold);
        for node in &key.params.nodes {
            if partials.len() == key.params.threshold {
                break;
            }
            let command = Command::PartialSign {
                key_id: key_id.to_string(),
                message: message.to_vec(),
            };
            match self.call(node, command).await {
                Ok(Some(ReplyPayload::PartialSignature(share))) => {
                    let sigma = decode_g1(&share.signature)?;
                    let vk: G2 = from_bytes::<G2Affine>(&share.verification_key)?.into();
                    bls::verify(sigma, message, vk).map_err(|_| {
                        MixnetError::DecryptionProof(format!("partial signature of {} is invalid", node))
                    })?;
                    partials.push((share.index, sigma));
                }
                Ok(other) => warn!(node = %node, "unexpected signing reply {:?}", other),
                Err(e) => warn!(node = %node, "skipping node for signing: {}", e),
            }
        }
        if partials.len() < key.params.threshold {
            return Err(MixnetError::Protocol(format!(
                "only {} of {} partial signatures available",
                partials.len(),
                key.params.threshold
            )));
        }

        let signature = bls::combine(&partials)?;
        bls::verify(signature, message, public_key)?;
        Ok(signature)
    }
}

/// Decodes one node's partial factors and checks every proof. Returns the
/// verification key and factors per row and column.
fn check_partials(
    rows: &[CiphertextRow<Curve>],
    shares: &DecryptionShares,
) -> Result<(G1, Vec<Vec<G1>>), MixnetError> {
    let fail = |reason: String| MixnetError::DecryptionProof(format!("{}: {}", shares.node, reason));
    if shares.rows.len() != rows.len() {
        return Err(fail(format!("{} rows for a board of {}", shares.rows.len(), rows.len())));
    }
    let vk = decode_g1(&shares.verification_key)?;

    let factors = rows
        .par_iter()
        .zip(shares.rows.par_iter())
        .map(|(row, partials)| {
            if partials.len() != row.width() {
                return Err(fail(format!(
                    "{} factors for a row of width {}",
                    partials.len(),
                    row.width()
                )));
            }
            row.columns
                .iter()
                .zip(partials)
                .map(|(ciphertext, partial)| {
                    let factor = decode_g1(&partial.factor)?;
                    let proof: DleqProof<Curve> = from_bytes(&partial.proof)?;
                    proof
                        .verify(ciphertext.c1, vk, factor)
                        .map_err(|e| fail(e.to_string()))?;
                    Ok(factor)
                })
                .collect::<Result<Vec<_>, MixnetError>>()
        })
        .collect::<Result<Vec<_>, MixnetError>>()?;
    Ok((vk, factors))
}

fn check_interpolation(indices: &[u64], keys: &[G1], public_key: G1) -> Result<(), MixnetError> {
    let lambdas = lagrange_coefficients_at_zero::<Fr>(indices)?;
    let interpolated: G1 = keys.iter().zip(&lambdas).map(|(vk, l)| *vk * l).sum();
    if interpolated != public_key {
        return Err(MixnetError::DecryptionProof(
            "verification keys do not interpolate to the public key".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::DecryptionChallengeVerifier;
    use crate::config::NodeConfig;
    use crate::crypto::elgamal::{decode_u64, encode_u64};
    use crate::keys::KeyState;
    use crate::network::InMemoryNetwork;
    use crate::node::NodeContext;
    use crate::peer::PeerChannel;
    use ark_ec::PrimeGroup;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn names(names: &[&str]) -> Vec<NodeName> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn network_of(nodes: &[&str]) -> (Arc<InMemoryNetwork>, Vec<Arc<NodeContext>>, MixnetAdmin) {
        let network = InMemoryNetwork::new();
        let configs = nodes
            .iter()
            .map(|n| {
                NodeConfig::new(*n)
                    .with_retry_intervals(Duration::from_millis(20), Duration::from_millis(10))
            })
            .collect();
        let contexts = network.spawn_nodes(configs).unwrap();
        let admin = MixnetAdmin::new(network.peer_map(&names(nodes)))
            .with_polling(Duration::from_millis(10), Duration::from_secs(30));
        (network, contexts, admin)
    }

    async fn board_of(admin: &MixnetAdmin, key_id: &str, host: &str, size: u64) {
        let pk = admin.public_key(key_id).unwrap().as_g1().unwrap();
        let mut rng = ark_std::test_rng();
        let rows: Vec<_> = (0..size)
            .map(|m| CiphertextRow::<Curve>::encrypt(pk, &[encode_u64::<Curve>(m)], &mut rng))
            .collect();
        let indices = admin.upload("X", host, &rows).await.unwrap();
        assert_eq!(indices, (0..size).collect::<Vec<_>>());
    }

    fn plaintexts(rows: &[DecryptedRow], bound: u64) -> Vec<u64> {
        let mut values: Vec<u64> = rows
            .iter()
            .map(|r| decode_u64::<Curve>(r.plaintext[0], bound).unwrap())
            .collect();
        values.sort();
        values
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_five_node_bls_key_generation() {
        let all = ["A", "B", "C", "D", "E"];
        let (_network, nodes, admin) = network_of(&all);

        let pk = admin
            .generate_key("bls-key", Algorithm::Bls, 3, &names(&all))
            .await
            .unwrap();
        assert!(pk.as_g2().is_ok());

        let expected = pk.to_bytes().unwrap();
        for node in &nodes {
            assert!(node.key_manager().has_private_key("bls-key"));
            assert_eq!(node.key_manager().fetch_public_key("bls-key"), Some(expected.clone()));
        }

        // Any three verification keys interpolate to the public key
        let shares: Vec<(u64, G2)> = nodes
            .iter()
            .map(|n| {
                let share = n.key_manager().get_partial_private_key("bls-key").unwrap();
                (share.index, share.verification_key().as_g2().unwrap())
            })
            .collect();
        for subset in [[0usize, 1, 2], [1, 3, 4], [0, 2, 4]] {
            let indices: Vec<u64> = subset.iter().map(|i| shares[*i].0).collect();
            let lambdas = lagrange_coefficients_at_zero::<Fr>(&indices).unwrap();
            let interpolated: G2 = subset.iter().zip(&lambdas).map(|(i, l)| shares[*i].1 * l).sum();
            assert_eq!(interpolated, pk.as_g2().unwrap());
        }

        let again = admin.generate_key("bls-key", Algorithm::Bls, 3, &names(&all)).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_store_before_generate_is_applied_once() {
        let (_network, nodes, _admin) = network_of(&["A", "B", "C"]);
        let params = ThresholdKeyGenParams {
            key_id: "late".into(),
            algorithm: Algorithm::EcElGamal,
            parameters: SUPPORTED_PARAMETERS.into(),
            threshold: 2,
            nodes: names(&["A", "B", "C"]),
        };

        assert!(nodes[0].dispatch(Command::Generate(params.clone())).await.is_ok());
        // A's shares reach B and C before they have opened the round
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(nodes[1].key_manager().state("late"), None);

        for node in &nodes[1..] {
            assert!(node.dispatch(Command::Generate(params.clone())).await.is_ok());
        }
        for _ in 0..300 {
            if nodes.iter().all(|n| n.key_manager().has_private_key("late")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let keys: Vec<_> = nodes
            .iter()
            .map(|n| n.key_manager().fetch_public_key("late"))
            .collect();
        assert!(keys[0].is_some());
        assert!(keys.iter().all(|k| *k == keys[0]));

        // Shares combine to the public key, so no dealer was counted twice
        let pk = nodes[0].key_manager().public_key("late").unwrap().as_g1().unwrap();
        let partials: Vec<(u64, G1)> = nodes[..2]
            .iter()
            .map(|n| {
                let share = n.key_manager().get_partial_private_key("late").unwrap();
                (share.index, share.verification_key().as_g1().unwrap())
            })
            .collect();
        let indices: Vec<u64> = partials.iter().map(|(i, _)| *i).collect();
        let keys: Vec<G1> = partials.iter().map(|(_, k)| *k).collect();
        check_interpolation(&indices, &keys, pk).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shuffle_decrypt_and_audit() {
        let path = names(&["A", "B", "C"]);
        let (_network, _nodes, admin) = network_of(&["A", "B", "C"]);
        admin
            .generate_key("elgamal", Algorithm::EcElGamal, 2, &path)
            .await
            .unwrap();
        board_of(&admin, "elgamal", "A", 100).await;

        let receipt = admin.shuffle("X", "A", "elgamal", &path).await.unwrap();
        assert_eq!(receipt.commitments.len(), 3);
        assert_eq!(receipt.consumed, 100);

        let mut spec = DecryptionChallengeSpec::every_nth(7, Vec::new()).unwrap();
        let rows = admin
            .download_challenged("X", "A", "elgamal", &mut spec)
            .await
            .unwrap();
        assert_eq!(rows.len(), 100);
        assert_eq!(plaintexts(&rows, 100), (0..100).collect::<Vec<_>>());

        // The board really moved
        let original: Vec<u64> = rows
            .iter()
            .map(|r| decode_u64::<Curve>(r.plaintext[0], 100).unwrap())
            .collect();
        assert_ne!(original, (0..100).collect::<Vec<_>>());

        let pk = admin.public_key("elgamal").unwrap().as_g1().unwrap();
        let report = DecryptionChallengeVerifier::new(pk)
            .verify(spec.into_sink().as_slice())
            .unwrap();
        assert_eq!(report.verdicts.len(), 15);
        assert!(report.all_passed());

        let audit = admin.verify_shuffle(&receipt, true).await.unwrap();
        assert_eq!(audit.combined_seed.len(), 32);
        assert!(audit.links_checked >= 150);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tampered_reveal_is_a_hard_failure() {
        let path = names(&["A", "B", "C"]);
        let (_network, _nodes, admin) = network_of(&["A", "B", "C"]);
        admin
            .generate_key("elgamal", Algorithm::EcElGamal, 2, &path)
            .await
            .unwrap();
        board_of(&admin, "elgamal", "B", 10).await;

        let receipt = admin.shuffle("X", "B", "elgamal", &path).await.unwrap();
        let mut reveals = admin.reveal_seeds(&receipt).await.unwrap();
        reveals[1].witness[0] ^= 1;

        let err = admin.audit_shuffle(&receipt, &reveals, true).await.unwrap_err();
        assert!(matches!(err, MixnetError::CommitmentMismatch(_)));
        assert!(err.is_verification_failure());
        assert!(!err.is_retryable());

        // The honest reveals still verify
        let honest = admin.reveal_seeds(&receipt).await.unwrap();
        let mut altered = receipt.clone();
        altered.input_digest[0] ^= 1;
        assert!(matches!(
            admin.audit_shuffle(&altered, &honest, false).await,
            Err(MixnetError::TranscriptProof(_))
        ));
        assert!(admin.audit_shuffle(&receipt, &honest, false).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_download_skips_unreachable_nodes() {
        let path = names(&["A", "B", "C"]);
        let (network, _nodes, admin) = network_of(&["A", "B", "C"]);
        admin
            .generate_key("elgamal", Algorithm::EcElGamal, 2, &path)
            .await
            .unwrap();
        board_of(&admin, "elgamal", "B", 5).await;

        network.disconnect("A");
        let rows = admin.download("X", "B", "elgamal").await.unwrap();
        assert_eq!(plaintexts(&rows, 5), vec![0, 1, 2, 3, 4]);

        network.disconnect("C");
        let err = admin.download("X", "B", "elgamal").await.unwrap_err();
        assert!(matches!(err, MixnetError::Protocol(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_threshold_signature() {
        let all = names(&["A", "B", "C"]);
        let (_network, _nodes, admin) = network_of(&["A", "B", "C"]);
        let pk = admin.generate_key("sig", Algorithm::Bls, 2, &all).await.unwrap();

        let signature = admin.sign("sig", b"final board").await.unwrap();
        bls::verify(signature, b"final board", pk.as_g2().unwrap()).unwrap();

        assert!(matches!(
            admin.sign("missing", b"final board").await,
            Err(MixnetError::UnknownKey(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_generate_waits_for_a_disconnected_node() {
        let all = names(&["A", "B", "C"]);
        let (network, nodes, admin) = network_of(&["A", "B", "C"]);
        let impatient = MixnetAdmin::new(network.peer_map(&all))
            .with_polling(Duration::from_millis(10), Duration::from_millis(500));

        network.disconnect("C");
        let err = impatient
            .generate_key("elgamal", Algorithm::EcElGamal, 2, &all)
            .await
            .unwrap_err();
        assert!(matches!(err, MixnetError::Protocol(_)), "{:?}", err);

        // Repeating the round once C is back completes it on every node
        network.reconnect("C");
        let pk = impatient
            .generate_key("elgamal", Algorithm::EcElGamal, 2, &all)
            .await
            .unwrap();
        for node in &nodes {
            assert_eq!(node.key_manager().public_key("elgamal"), Some(pk));
        }

        // A node that comes back while the admin waits is picked up
        network.disconnect("B");
        let reconnecting = Arc::clone(&network);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            reconnecting.reconnect("B");
        });
        assert!(admin.generate_key("sig", Algorithm::Bls, 2, &all).await.is_ok());
    }

    /// Forwards everything but serves its own rows for any board download
    struct SubstitutedBoard {
        inner: Arc<dyn PeerChannel>,
        rows: Vec<BoardEntry>,
    }

    #[async_trait]
    impl PeerChannel for SubstitutedBoard {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn send(&self, command: Command) -> Result<MessageReply, ConnectionError> {
            match command {
                Command::BoardDownload { .. } => Ok(MessageReply::with(ReplyPayload::Board(self.rows.clone()))),
                other => self.inner.send(other).await,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shuffle_rejects_input_that_is_not_the_board() {
        let all = names(&["A", "B", "C"]);
        let network = InMemoryNetwork::new();
        let config = |name: &str| {
            NodeConfig::new(name).with_retry_intervals(Duration::from_millis(20), Duration::from_millis(10))
        };
        let _honest = network.spawn_nodes(vec![config("B"), config("C")]).unwrap();

        // A shuffles its own rows instead of what B hosts
        let mut rng = ark_std::test_rng();
        let forged = (0..5)
            .map(|m| BoardEntry {
                index: m,
                data: to_bytes(&CiphertextRow::<Curve>::encrypt(
                    G1::generator(),
                    &[encode_u64::<Curve>(m + 100)],
                    &mut rng,
                ))
                .unwrap(),
            })
            .collect();
        let mut peers = network.peer_map(&all);
        let host = Arc::clone(&peers["B"]);
        peers.insert("B".into(), Arc::new(SubstitutedBoard { inner: host, rows: forged }));
        let dishonest = NodeContext::new(config("A"), peers).unwrap();
        network.register(&dishonest);

        let admin = MixnetAdmin::new(network.peer_map(&all))
            .with_polling(Duration::from_millis(10), Duration::from_secs(30));
        admin
            .generate_key("elgamal", Algorithm::EcElGamal, 2, &all)
            .await
            .unwrap();
        board_of(&admin, "elgamal", "B", 5).await;

        let err = admin
            .shuffle("X", "B", "elgamal", &names(&["A", "C"]))
            .await
            .unwrap_err();
        assert!(matches!(err, MixnetError::TranscriptProof(_)), "{:?}", err);

        // The hosted board is not replaced
        let rows = admin.download("X", "B", "elgamal").await.unwrap();
        assert_eq!(plaintexts(&rows, 5), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_network_statistics_skip_unreachable_nodes() {
        let all = names(&["A", "B", "C"]);
        let (network, _nodes, admin) = network_of(&["A", "B", "C"]);
        admin
            .generate_key("elgamal", Algorithm::EcElGamal, 2, &all)
            .await
            .unwrap();

        network.disconnect("B");
        let stats = admin.network_statistics().await;
        let reporting: Vec<&str> = stats.iter().map(|s| s.node.as_str()).collect();
        assert_eq!(reporting, vec!["A", "C"]);
        for node in &stats {
            assert!(node.accepting);
            assert_eq!(node.keys.get("elgamal"), Some(&KeyState::Complete));
        }
        assert!(admin.node_statistics("B").await.is_err());
    }
}
