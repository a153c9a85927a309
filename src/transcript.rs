//! Shuffle transforms, transcripts and witness verification
//!
//! A shuffle hop turns the board of step `k - 1` into the board of step `k`
//! by permuting rows and re-encrypting every column. The boards themselves are
//! the *general transcripts*. Correctness is checked by randomized partial
//! checking: once a public challenge exists, each hop opens about half of its
//! links `(input position, output position, randomness)` and the verifier
//! re-encrypts the input rows to compare against the outputs.
//!
//! With pairing, consecutive links `2p` and `2p + 1` share one random half
//! `S_p` of the board between them: link `2p` opens the outputs in `S_p` and
//! link `2p + 1` opens the inputs outside `S_p`, so no row can be followed
//! through both links of a pair.

use ark_ff::UniformRand;
use ark_std::rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use blake2::{Blake2b512, Digest};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use zeroize::Zeroize;

use crate::crypto::{CiphertextRow, Curve, Fr, G1};
use crate::error::MixnetError;
use crate::security::SensitiveBytes;
use crate::utils::{from_bytes, to_bytes};

/// Name of the row-preserving multi-column shuffle
pub const MULTI_COLUMN_ROW: &str = "multi-column-row";

const CHALLENGE_DOMAIN: &[u8] = b"mixnet-node/shuffle-challenge/v1";
const SELECTION_DOMAIN: &[u8] = b"mixnet-node/link-selection/v1";

/// Board contents after a shuffle step; step 0 is the input board
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StepTranscript {
    pub operation: u64,
    pub step: u32,
    /// Compressed `CiphertextRow`s in board order
    pub rows: Vec<Vec<u8>>,
}

impl StepTranscript {
    pub fn from_rows(
        operation: u64,
        step: u32,
        rows: &[CiphertextRow<Curve>],
    ) -> Result<Self, MixnetError> {
        Ok(Self {
            operation,
            step,
            rows: rows.par_iter().map(to_bytes).collect::<Result<_, _>>()?,
        })
    }

    pub fn decode_rows(&self) -> Result<Vec<CiphertextRow<Curve>>, MixnetError> {
        self.rows.par_iter().map(|r| from_bytes(r)).collect()
    }

    /// Blake2b-512 over the operation, step and every row
    pub fn digest(&self) -> Vec<u8> {
        let mut hasher = Blake2b512::new();
        self.absorb(&mut hasher);
        hasher.finalize().to_vec()
    }

    fn absorb(&self, hasher: &mut Blake2b512) {
        hasher.update(self.operation.to_le_bytes());
        hasher.update(self.step.to_le_bytes());
        hasher.update((self.rows.len() as u64).to_le_bytes());
        for row in &self.rows {
            hasher.update((row.len() as u64).to_le_bytes());
            hasher.update(row);
        }
    }
}

/// One opened link of a shuffle step
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RevealedLink {
    pub input_index: u64,
    pub output_index: u64,
    /// Compressed re-encryption scalar per column
    pub randomness: Vec<Vec<u8>>,
}

/// Links opened for one step in answer to a challenge
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WitnessTranscript {
    pub operation: u64,
    pub step: u32,
    pub challenge: Vec<u8>,
    pub pairing: bool,
    pub links: Vec<RevealedLink>,
}

/// Secret result of one hop; wiped on drop
pub struct ShuffleOutcome {
    pub output: Vec<CiphertextRow<Curve>>,
    /// Output row `j` is the re-encryption of input row `permutation[j]`
    pub permutation: Vec<usize>,
    /// Per output row, per column randomness
    pub randomness: Vec<Vec<Fr>>,
}

impl Drop for ShuffleOutcome {
    fn drop(&mut self) {
        self.permutation.zeroize();
        for row in self.randomness.iter_mut() {
            row.zeroize();
        }
    }
}

/// A board transform a hop can apply
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Shuffles `input` with randomness derived from the private `seed`.
    fn apply(
        &self,
        input: &[CiphertextRow<Curve>],
        pk: G1,
        seed: &SensitiveBytes,
    ) -> Result<ShuffleOutcome, MixnetError>;
}

/// Permutes whole rows and re-encrypts every column
pub struct MultiColumnRowTransform;

impl Transform for MultiColumnRowTransform {
    fn name(&self) -> &'static str {
        MULTI_COLUMN_ROW
    }

    fn apply(
        &self,
        input: &[CiphertextRow<Curve>],
        pk: G1,
        seed: &SensitiveBytes,
    ) -> Result<ShuffleOutcome, MixnetError> {
        let seed: [u8; 32] = seed.expose_secret().try_into().map_err(|_| {
            MixnetError::InvalidParameter("shuffle seed must be 32 bytes".to_string())
        })?;
        let mut rng = StdRng::from_seed(seed);

        let mut permutation: Vec<usize> = (0..input.len()).collect();
        permutation.shuffle(&mut rng);

        let randomness: Vec<Vec<Fr>> = permutation
            .iter()
            .map(|&i| (0..input[i].width()).map(|_| Fr::rand(&mut rng)).collect())
            .collect();

        let output = permutation
            .par_iter()
            .zip(randomness.par_iter())
            .map(|(&i, r)| input[i].reencrypt(pk, r))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ShuffleOutcome {
            output,
            permutation,
            randomness,
        })
    }
}

pub fn transform_by_name(name: &str) -> Option<Box<dyn Transform>> {
    match name {
        MULTI_COLUMN_ROW => Some(Box::new(MultiColumnRowTransform)),
        _ => None,
    }
}

pub fn transform_names() -> Vec<String> {
    vec![MULTI_COLUMN_ROW.to_string()]
}

/// Public challenge: `H(general transcripts in step order || combined seed)`
pub fn challenge_seed(
    transcripts: &[StepTranscript],
    combined_seed: &[u8],
) -> Result<Vec<u8>, MixnetError> {
    for (expected, transcript) in transcripts.iter().enumerate() {
        if transcript.step as usize != expected {
            return Err(MixnetError::InvalidParameter(format!(
                "transcript for step {} found at position {}",
                transcript.step, expected
            )));
        }
    }

    let mut hasher = Blake2b512::new();
    hasher.update(CHALLENGE_DOMAIN);
    for transcript in transcripts {
        transcript.absorb(&mut hasher);
    }
    hasher.update(combined_seed);
    Ok(hasher.finalize().to_vec())
}

/// Half-size subset `S_pair` of board positions derived from the challenge
pub fn selection(challenge: &[u8], pair: u32, size: usize) -> Vec<bool> {
    let mut hasher = Blake2b512::new();
    hasher.update(SELECTION_DOMAIN);
    hasher.update(challenge);
    hasher.update(pair.to_le_bytes());
    let digest = hasher.finalize();

    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest[..32]);
    let mut rng = StdRng::from_seed(seed);

    let mut positions: Vec<usize> = (0..size).collect();
    positions.shuffle(&mut rng);

    let mut selected = vec![false; size];
    for &p in &positions[..(size + 1) / 2] {
        selected[p] = true;
    }
    selected
}

/// Which side of link `link` (0-based) is opened, and which positions
enum OpenedSide {
    Outputs(Vec<bool>),
    InputsOutside(Vec<bool>),
}

fn opened_side(challenge: &[u8], link: u32, pairing: bool, size: usize) -> OpenedSide {
    if !pairing {
        return OpenedSide::Outputs(selection(challenge, link, size));
    }
    let subset = selection(challenge, link / 2, size);
    if link % 2 == 0 {
        OpenedSide::Outputs(subset)
    } else {
        OpenedSide::InputsOutside(subset)
    }
}

/// Opens the links of step `step` (link `step - 1`) selected by the challenge.
pub fn reveal_links(
    outcome: &ShuffleOutcome,
    operation: u64,
    step: u32,
    challenge: &[u8],
    pairing: bool,
) -> Result<WitnessTranscript, MixnetError> {
    if step == 0 {
        return Err(MixnetError::InvalidParameter(
            "step 0 has no witness".to_string(),
        ));
    }
    let size = outcome.permutation.len();
    let side = opened_side(challenge, step - 1, pairing, size);

    let mut links = Vec::new();
    for (output_index, &input_index) in outcome.permutation.iter().enumerate() {
        let open = match &side {
            OpenedSide::Outputs(subset) => subset[output_index],
            OpenedSide::InputsOutside(subset) => !subset[input_index],
        };
        if open {
            links.push(RevealedLink {
                input_index: input_index as u64,
                output_index: output_index as u64,
                randomness: outcome.randomness[output_index]
                    .iter()
                    .map(to_bytes)
                    .collect::<Result<_, _>>()?,
            });
        }
    }

    Ok(WitnessTranscript {
        operation,
        step,
        challenge: challenge.to_vec(),
        pairing,
        links,
    })
}

/// Checks a witness transcript against the two general transcripts it links.
///
/// Returns the number of links checked. Any discrepancy is a hard failure.
pub fn verify_witness(
    input: &StepTranscript,
    output: &StepTranscript,
    witness: &WitnessTranscript,
    pk: G1,
    challenge: &[u8],
    pairing: bool,
) -> Result<usize, MixnetError> {
    let fail = |reason: String| MixnetError::TranscriptProof(reason);
    let step = output.step;

    if input.step + 1 != step || witness.step != step {
        return Err(fail(format!(
            "witness for step {} does not link steps {} and {}",
            witness.step, input.step, output.step
        )));
    }
    if witness.challenge != challenge || witness.pairing != pairing {
        return Err(fail(format!(
            "witness for step {} answers a different challenge",
            step
        )));
    }
    if input.rows.len() != output.rows.len() {
        return Err(fail(format!(
            "step {} changed the board size from {} to {}",
            step,
            input.rows.len(),
            output.rows.len()
        )));
    }

    let size = input.rows.len();
    let mut inputs = HashSet::new();
    let mut outputs = HashSet::new();
    for link in &witness.links {
        let (i, o) = (link.input_index as usize, link.output_index as usize);
        if i >= size || o >= size || !inputs.insert(i) || !outputs.insert(o) {
            return Err(fail(format!(
                "step {} opens an invalid or repeated link {} -> {}",
                step, i, o
            )));
        }
    }

    let (expected, opened): (HashSet<usize>, _) = match opened_side(challenge, step - 1, pairing, size) {
        OpenedSide::Outputs(subset) => ((0..size).filter(|&j| subset[j]).collect(), &outputs),
        OpenedSide::InputsOutside(subset) => ((0..size).filter(|&i| !subset[i]).collect(), &inputs),
    };
    if *opened != expected {
        return Err(fail(format!(
            "step {} opens {} links, challenge selects {}",
            step,
            opened.len(),
            expected.len()
        )));
    }

    let input_rows = input.decode_rows()?;
    let output_rows = output.decode_rows()?;

    witness
        .links
        .par_iter()
        .try_for_each(|link| -> Result<(), MixnetError> {
            let randomness = link
                .randomness
                .iter()
                .map(|r| from_bytes::<Fr>(r))
                .collect::<Result<Vec<_>, _>>()?;
            let source = &input_rows[link.input_index as usize];
            let target = &output_rows[link.output_index as usize];
            let reencrypted = source.reencrypt(pk, &randomness).map_err(|e| fail(e.to_string()))?;
            if reencrypted != *target {
                return Err(fail(format!(
                    "link {} -> {} of step {} is not a re-encryption",
                    link.input_index, link.output_index, step
                )));
            }
            Ok(())
        })?;

    Ok(witness.links.len())
}
