//! Decryption challenge logs and their verifier
//!
//! While downloading a board, the admin writes a log for the indices a
//! [`DecryptionChallengeSpec`] selects: a header naming the participants and
//! their verification keys, then one entry per selected index carrying the
//! ciphertext row, every participant's partial factors and proofs, and the
//! plaintext the download reported. [`DecryptionChallengeVerifier`] replays
//! such a log against nothing but the public key.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use tracing::{debug, warn};

use crate::codec::{decode_record, read_frame, read_record, write_record};
use crate::crypto::dleq::DleqProof;
use crate::crypto::elgamal::combine_partials;
use crate::crypto::{CiphertextRow, Curve, Fr, G1Affine, G1};
use crate::error::MixnetError;
use crate::messages::{KeyId, NodeName};
use crate::utils::{from_bytes, lagrange_coefficients_at_zero, to_bytes};

/// Selects board indices for the challenge and receives the log
pub struct DecryptionChallengeSpec<W: Write> {
    predicate: Box<dyn Fn(u64) -> bool + Send + Sync>,
    sink: W,
}

impl<W: Write> DecryptionChallengeSpec<W> {
    pub fn new(predicate: impl Fn(u64) -> bool + Send + Sync + 'static, sink: W) -> Self {
        Self {
            predicate: Box::new(predicate),
            sink,
        }
    }

    /// Challenges every index divisible by `modulus`.
    pub fn every_nth(modulus: u64, sink: W) -> Result<Self, MixnetError> {
        if modulus == 0 {
            return Err(MixnetError::InvalidParameter(
                "challenge modulus must be positive".to_string(),
            ));
        }
        Ok(Self::new(move |index| index % modulus == 0, sink))
    }

    pub fn selects(&self, index: u64) -> bool {
        (self.predicate)(index)
    }

    pub fn write(&mut self, record: &ChallengeRecord) -> Result<(), MixnetError> {
        write_record(&mut self.sink, record)
    }

    pub fn into_sink(self) -> W {
        self.sink
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChallengeParticipant {
    pub node: NodeName,
    pub index: u64,
    pub verification_key: Vec<u8>,
}

/// One participant's contribution to one challenged row
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChallengeShare {
    pub participant_index: u64,
    /// One factor and one proof per column
    pub factors: Vec<Vec<u8>>,
    pub proofs: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ChallengeRecord {
    Header {
        board: String,
        key_id: KeyId,
        participants: Vec<ChallengeParticipant>,
        public_key: Vec<u8>,
    },
    Entry {
        index: u64,
        row: Vec<u8>,
        shares: Vec<ChallengeShare>,
        /// Plaintext point per column as reported by the download
        plaintext: Vec<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexVerdict {
    pub index: u64,
    pub verdict: Verdict,
}

/// A log record that could not be decoded, so its index is unknown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableRecord {
    /// Position in the log; the header is record 0
    pub position: usize,
    pub reason: String,
}

/// Per-index outcome of a challenge log check
#[derive(Debug, Clone, Default)]
pub struct ChallengeReport {
    pub board: String,
    pub verdicts: Vec<IndexVerdict>,
    pub unreadable: Vec<UnreadableRecord>,
}

impl ChallengeReport {
    pub fn all_passed(&self) -> bool {
        self.unreadable.is_empty() && self.verdicts.iter().all(|v| v.verdict == Verdict::Passed)
    }

    pub fn failures(&self) -> Vec<&IndexVerdict> {
        self.verdicts
            .iter()
            .filter(|v| v.verdict != Verdict::Passed)
            .collect()
    }
}

impl fmt::Display for ChallengeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "board {}: {} indices checked, {} failed",
            self.board,
            self.verdicts.len(),
            self.failures().len()
        )?;
        if !self.unreadable.is_empty() {
            write!(f, ", {} unreadable records", self.unreadable.len())?;
        }
        Ok(())
    }
}

fn decode_g1(bytes: &[u8]) -> Result<G1, MixnetError> {
    Ok(from_bytes::<G1Affine>(bytes)?.into())
}

/// Replays challenge logs against a public key
pub struct DecryptionChallengeVerifier {
    public_key: G1,
}

impl DecryptionChallengeVerifier {
    pub fn new(public_key: G1) -> Self {
        Self { public_key }
    }

    /// Checks a whole log.
    ///
    /// A header that does not match the public key makes the log worthless
    /// and is an error; a bad entry only fails its own index, and a record
    /// that cannot be decoded is listed as unreadable.
    pub fn verify<R: Read>(&self, mut reader: R) -> Result<ChallengeReport, MixnetError> {
        let (board, participants) = match read_record::<_, ChallengeRecord>(&mut reader)? {
            Some(ChallengeRecord::Header {
                board,
                participants,
                public_key,
                ..
            }) => {
                if decode_g1(&public_key)? != self.public_key {
                    return Err(MixnetError::DecryptionProof(
                        "log was written for another public key".to_string(),
                    ));
                }
                (board, self.check_participants(&participants)?)
            }
            Some(ChallengeRecord::Entry { .. }) => {
                return Err(MixnetError::Protocol(
                    "challenge log does not start with a header".to_string(),
                ))
            }
            None => return Err(MixnetError::Protocol("empty challenge log".to_string())),
        };

        let mut report = ChallengeReport {
            board,
            ..ChallengeReport::default()
        };
        let mut position = 1;
        loop {
            let frame = match read_frame(&mut reader) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(position, "challenge log cut short: {}", e);
                    report.unreadable.push(UnreadableRecord {
                        position,
                        reason: e.to_string(),
                    });
                    break;
                }
            };

            match decode_record::<ChallengeRecord>(&frame) {
                Ok(ChallengeRecord::Entry {
                    index,
                    row,
                    shares,
                    plaintext,
                }) => {
                    let verdict = match check_entry(&participants, &row, &shares, &plaintext) {
                        Ok(()) => Verdict::Passed,
                        Err(e) => {
                            warn!(index, "challenged index failed: {}", e);
                            Verdict::Failed(e.to_string())
                        }
                    };
                    report.verdicts.push(IndexVerdict { index, verdict });
                }
                Ok(ChallengeRecord::Header { .. }) => {
                    return Err(MixnetError::Protocol(
                        "second header in challenge log".to_string(),
                    ))
                }
                Err(e) => {
                    warn!(position, "unreadable challenge record: {}", e);
                    report.unreadable.push(UnreadableRecord {
                        position,
                        reason: e.to_string(),
                    });
                }
            }
            position += 1;
        }

        debug!(board = %report.board, checked = report.verdicts.len(), "challenge log replayed");
        Ok(report)
    }

    /// Verification keys of the participants must interpolate to the public key.
    fn check_participants(
        &self,
        participants: &[ChallengeParticipant],
    ) -> Result<HashMap<u64, G1>, MixnetError> {
        let keys = participants
            .iter()
            .map(|p| Ok((p.index, decode_g1(&p.verification_key)?)))
            .collect::<Result<Vec<_>, MixnetError>>()?;

        let indices: Vec<u64> = keys.iter().map(|(i, _)| *i).collect();
        let lambdas = lagrange_coefficients_at_zero::<Fr>(&indices)
            .map_err(|e| MixnetError::DecryptionProof(e.to_string()))?;
        let interpolated: G1 = keys
            .iter()
            .zip(lambdas.iter())
            .map(|((_, vk), lambda)| *vk * lambda)
            .sum();
        if interpolated != self.public_key {
            return Err(MixnetError::DecryptionProof(
                "verification keys do not interpolate to the public key".to_string(),
            ));
        }
        Ok(keys.into_iter().collect())
    }
}

fn check_entry(
    participants: &HashMap<u64, G1>,
    row: &[u8],
    shares: &[ChallengeShare],
    plaintext: &[Vec<u8>],
) -> Result<(), MixnetError> {
    let row = from_bytes::<CiphertextRow<Curve>>(row)?;
    if plaintext.len() != row.width() {
        return Err(MixnetError::DecryptionProof(format!(
            "{} plaintext columns for a row of width {}",
            plaintext.len(),
            row.width()
        )));
    }
    if shares.len() != participants.len() {
        return Err(MixnetError::DecryptionProof(format!(
            "{} shares logged for {} participants",
            shares.len(),
            participants.len()
        )));
    }

    let mut partials: Vec<Vec<(u64, G1)>> = vec![Vec::new(); row.width()];
    for share in shares {
        let vk = participants.get(&share.participant_index).ok_or_else(|| {
            MixnetError::DecryptionProof(format!(
                "share from unknown participant {}",
                share.participant_index
            ))
        })?;
        if share.factors.len() != row.width() || share.proofs.len() != row.width() {
            return Err(MixnetError::DecryptionProof(format!(
                "participant {} logged the wrong number of columns",
                share.participant_index
            )));
        }
        for (column, ciphertext) in row.columns.iter().enumerate() {
            let factor = decode_g1(&share.factors[column])?;
            let proof: DleqProof<Curve> = from_bytes(&share.proofs[column])?;
            proof.verify(ciphertext.c1, *vk, factor)?;
            partials[column].push((share.participant_index, factor));
        }
    }

    for (column, ciphertext) in row.columns.iter().enumerate() {
        let recomputed = combine_partials(ciphertext, &partials[column])?;
        if to_bytes(&recomputed)? != plaintext[column] {
            return Err(MixnetError::DecryptionProof(format!(
                "column {} does not decrypt to the reported plaintext",
                column
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::elgamal::encode_u64;
    use crate::services::decryption::partial_decrypt_row;
    use ark_ec::PrimeGroup;
    use ark_ff::UniformRand;
    use ark_std::rand::RngCore;

    /// Shamir shares of a fresh key at indices 1..=n, threshold 2
    fn shared_key<R: RngCore>(rng: &mut R, n: u64) -> (G1, Vec<(u64, Fr)>) {
        let a0 = Fr::rand(rng);
        let a1 = Fr::rand(rng);
        let shares = (1..=n).map(|i| (i, a0 + a1 * Fr::from(i))).collect();
        (G1::generator() * a0, shares)
    }

    /// Writes a log for `rows`, lying about the plaintext of index `liar`
    fn write_log(pk: G1, shares: &[(u64, Fr)], rows: &[CiphertextRow<Curve>], liar: Option<u64>) -> Vec<u8> {
        let mut spec = DecryptionChallengeSpec::new(|_| true, Vec::new());
        let participants = shares
            .iter()
            .map(|(i, x)| ChallengeParticipant {
                node: format!("node-{}", i),
                index: *i,
                verification_key: to_bytes(&(G1::generator() * x)).unwrap(),
            })
            .collect();
        spec.write(&ChallengeRecord::Header {
            board: "X".into(),
            key_id: "k".into(),
            participants,
            public_key: to_bytes(&pk).unwrap(),
        })
        .unwrap();

        for (index, row) in rows.iter().enumerate() {
            let index = index as u64;
            let mut logged = Vec::new();
            let mut partials = Vec::new();
            for (i, x) in shares {
                let factors = partial_decrypt_row(row, x, G1::generator() * x).unwrap();
                partials.push((*i, decode_g1(&factors[0].factor).unwrap()));
                logged.push(ChallengeShare {
                    participant_index: *i,
                    factors: factors.iter().map(|f| f.factor.clone()).collect(),
                    proofs: factors.iter().map(|f| f.proof.clone()).collect(),
                });
            }
            let mut plain = combine_partials(&row.columns[0], &partials).unwrap();
            if liar == Some(index) {
                plain += G1::generator();
            }
            spec.write(&ChallengeRecord::Entry {
                index,
                row: to_bytes(row).unwrap(),
                shares: logged,
                plaintext: vec![to_bytes(&plain).unwrap()],
            })
            .unwrap();
        }
        spec.into_sink()
    }

    fn rows(pk: G1, count: u64) -> Vec<CiphertextRow<Curve>> {
        let mut rng = ark_std::test_rng();
        (0..count)
            .map(|m| CiphertextRow::encrypt(pk, &[encode_u64::<Curve>(m)], &mut rng))
            .collect()
    }

    #[test]
    fn test_honest_log_passes() {
        let mut rng = ark_std::test_rng();
        let (pk, shares) = shared_key(&mut rng, 3);
        let log = write_log(pk, &shares[..2], &rows(pk, 4), None);

        let report = DecryptionChallengeVerifier::new(pk).verify(log.as_slice()).unwrap();
        assert_eq!(report.verdicts.len(), 4);
        assert!(report.all_passed());
    }

    #[test]
    fn test_wrong_plaintext_fails_only_its_index() {
        let mut rng = ark_std::test_rng();
        let (pk, shares) = shared_key(&mut rng, 3);
        let log = write_log(pk, &shares[1..], &rows(pk, 5), Some(2));

        let report = DecryptionChallengeVerifier::new(pk).verify(log.as_slice()).unwrap();
        assert_eq!(report.verdicts.len(), 5);
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 2);
        assert!(report.to_string().contains("1 failed"));
    }

    #[test]
    fn test_header_must_match_public_key() {
        let mut rng = ark_std::test_rng();
        let (pk, shares) = shared_key(&mut rng, 3);
        let log = write_log(pk, &shares[..2], &rows(pk, 1), None);

        let other = G1::generator() * Fr::rand(&mut rng);
        let err = DecryptionChallengeVerifier::new(other).verify(log.as_slice()).unwrap_err();
        assert!(err.is_verification_failure());

        // Verification keys below the threshold interpolate to something else
        let short = write_log(pk, &shares[..1], &rows(pk, 1), None);
        let err = DecryptionChallengeVerifier::new(pk).verify(short.as_slice()).unwrap_err();
        assert!(matches!(err, MixnetError::DecryptionProof(_)));

        assert!(DecryptionChallengeVerifier::new(pk).verify(std::io::empty()).is_err());
    }

    #[test]
    fn test_unreadable_records_do_not_stop_the_check() {
        let mut rng = ark_std::test_rng();
        let (pk, shares) = shared_key(&mut rng, 3);
        let log = write_log(pk, &shares[..2], &rows(pk, 3), None);

        // Garbage frame right after the header, a cut length prefix at the end
        let header_end = 4 + u32::from_le_bytes([log[0], log[1], log[2], log[3]]) as usize;
        let mut damaged = log[..header_end].to_vec();
        damaged.extend_from_slice(&[5, 0, 0, 0, 9, 9, 9, 9, 9]);
        damaged.extend_from_slice(&log[header_end..]);
        damaged.extend_from_slice(&[7, 0]);

        let report = DecryptionChallengeVerifier::new(pk).verify(damaged.as_slice()).unwrap();
        assert_eq!(report.verdicts.len(), 3);
        assert!(report.failures().is_empty());
        assert_eq!(report.unreadable.len(), 2);
        assert_eq!(report.unreadable[0].position, 1);
        assert_eq!(report.unreadable[1].position, 5);
        assert!(!report.all_passed());
        assert!(report.to_string().contains("2 unreadable records"));
    }

    #[test]
    fn test_every_nth_selection() {
        let spec = DecryptionChallengeSpec::every_nth(3, Vec::new()).unwrap();
        let selected: Vec<u64> = (0..10).filter(|i| spec.selects(*i)).collect();
        assert_eq!(selected, vec![0, 3, 6, 9]);
        assert!(DecryptionChallengeSpec::every_nth(0, Vec::new()).is_err());
    }
}
