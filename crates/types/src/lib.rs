//! Shared type definitions for the zkbridge relay.
//!
//! This crate provides the data model passed between the relay components: the lock
//! event observed on the source chain, the commitment derived from it, the proof
//! produced by the external prover and the job record the coordinator tracks per
//! source transaction.
//!
//! ## Overview
//!
//! - [`LockEvent`] - A normalized `Locked` log from the source bridge contract
//! - [`Commitment`] - The 256-bit Merkle root and its eight 32-bit limbs
//! - [`ProofArtifact`] - A Groth16 proof, its public inputs and its content hash
//! - [`RelayJob`] - The unit of work moving through the [`Stage`] state machine
//!
//! All types are serde-serializable; [`RelayJob`] snapshots are what the relay persists
//! in its job log.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use alloy_primitives::{B256, U256};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Number of 32-bit limbs a 256-bit value is split into.
pub const LIMB_COUNT: usize = 8;

/// A `Locked` event emitted by the source bridge contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvent {
    /// Opaque value emitted by the source contract.
    pub encrypted_data: U256,
    /// Source block height recorded by the contract at emission.
    pub block_number: u64,
    /// Source block timestamp (seconds) recorded by the contract at emission.
    pub timestamp: u64,
    /// Unique value per lock action, used for replay protection on the destination.
    pub nonce_hash: B256,
    /// Hash of the source transaction that emitted the log.
    pub source_tx_hash: B256,
    /// Block in which the log was included.
    pub log_block_number: u64,
    /// Position of the log within its block.
    pub log_index: u64,
}

impl LockEvent {
    /// Returns the low 32 bits of `encrypted_data`, the only part the commitment and the
    /// proof circuit consume.
    pub fn value1_u32(&self) -> u32 {
        self.encrypted_data.as_limbs()[0] as u32
    }

    /// Returns `true` if `encrypted_data` has bits above the low 32 that the commitment
    /// drops.
    pub fn truncates_encrypted_data(&self) -> bool {
        self.encrypted_data > U256::from(u32::MAX)
    }
}

/// Deterministic commitment over the fields of a [`LockEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment {
    /// The Merkle root.
    pub root: B256,
    /// Big-endian 32-bit limbs of `root`, `0x`-prefixed and zero-padded to 8 hex digits.
    pub limbs: [String; LIMB_COUNT],
}

impl Commitment {
    /// Builds the commitment for an already computed root.
    pub fn from_root(root: B256) -> Self {
        Self {
            limbs: split_limbs(&root.0),
            root,
        }
    }

    /// Returns the limbs as decimal strings, the form the prover expects.
    pub fn limbs_as_decimal(&self) -> [String; LIMB_COUNT] {
        limb_words(&self.root.0).map(|word| word.to_string())
    }

    /// Reassembles a root from its hex limbs.
    ///
    /// Returns `None` if there are not exactly eight limbs or a limb is not a 32-bit hex
    /// word.
    pub fn root_from_limbs<S: AsRef<str>>(limbs: &[S]) -> Option<B256> {
        if limbs.len() != LIMB_COUNT {
            return None;
        }

        let mut root = [0u8; 32];
        for (chunk, limb) in root.chunks_exact_mut(4).zip(limbs) {
            let limb = limb.as_ref();
            let digits = limb.strip_prefix("0x").unwrap_or(limb);
            let word = u32::from_str_radix(digits, 16).ok()?;
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        Some(B256::from(root))
    }
}

/// Splits 32 bytes into eight `0x`-prefixed big-endian 32-bit hex limbs.
pub fn split_limbs(bytes: &[u8; 32]) -> [String; LIMB_COUNT] {
    limb_words(bytes).map(|word| format!("0x{word:08x}"))
}

fn limb_words(bytes: &[u8; 32]) -> [u32; LIMB_COUNT] {
    let mut words = [0u32; LIMB_COUNT];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

/// Groth16 proof points as emitted by the prover, field elements hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Groth16Proof {
    /// G1 point `a`.
    pub a: [String; 2],
    /// G2 point `b`.
    pub b: [[String; 2]; 2],
    /// G1 point `c`.
    pub c: [String; 2],
}

/// Proof produced for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofArtifact {
    /// The proof points.
    pub proof: Groth16Proof,
    /// Public inputs of the circuit, hex-encoded field elements.
    pub public_inputs: Vec<String>,
    /// SHA-256 of the compact JSON serialization of the proof document.
    pub proof_hash: B256,
}

/// Pipeline stage of a [`RelayJob`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    /// Event received, nothing computed yet.
    Observed,
    /// Commitment computed.
    CommitmentReady,
    /// Proof generated.
    ProofReady,
    /// Mint transaction sent, waiting for inclusion.
    Submitted,
    /// Mint transaction included and confirmed.
    Confirmed,
    /// Given up.
    Failed,
}

impl Stage {
    /// Returns `true` for [`Stage::Confirmed`] and [`Stage::Failed`].
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

/// Classification of a stage fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The event could not be turned into a commitment.
    MalformedEvent,
    /// The prover binary could not be located or started.
    ProverUnavailable,
    /// Witness computation exited with a non-zero status.
    WitnessError,
    /// Proof generation failed or produced no usable artifact.
    ProofGenerationError,
    /// The destination node refused the transaction before inclusion.
    SubmissionRejected,
    /// No receipt arrived within the wait window.
    TimedOut,
    /// The mint transaction was included with a failed status.
    Reverted,
    /// The service shut down while the job was in flight.
    InterruptedShutdown,
}

/// Terminal failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// What went wrong.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
}

/// Unit of work tracked by the coordinator, one per source transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayJob {
    /// Identity key of the job.
    pub source_tx_hash: B256,
    /// The observed event.
    pub event: LockEvent,
    /// Current stage.
    pub stage: Stage,
    /// Attempts made in the current step, reset whenever the job advances.
    pub attempts: u32,
    /// Error of the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Set from [`Stage::CommitmentReady`] on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commitment: Option<Commitment>,
    /// Set from [`Stage::ProofReady`] on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<ProofArtifact>,
    /// Hash of the latest mint transaction sent for this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_tx_hash: Option<B256>,
    /// Nonce of the latest mint transaction, reused when it has to be replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_nonce: Option<u64>,
    /// Set when the job ends in [`Stage::Failed`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    /// Unix seconds at creation.
    pub created_at: u64,
    /// Unix seconds at the last change.
    pub updated_at: u64,
}

impl RelayJob {
    /// Creates a job in [`Stage::Observed`].
    pub fn new(event: LockEvent, now: u64) -> Self {
        Self {
            source_tx_hash: event.source_tx_hash,
            event,
            stage: Stage::Observed,
            attempts: 0,
            last_error: None,
            commitment: None,
            proof: None,
            destination_tx_hash: None,
            pending_nonce: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` once the job reached [`Stage::Confirmed`] or [`Stage::Failed`].
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Moves to [`Stage::CommitmentReady`].
    pub fn commitment_ready(&mut self, commitment: Commitment, now: u64) {
        self.commitment = Some(commitment);
        self.advance(Stage::CommitmentReady, now);
    }

    /// Moves to [`Stage::ProofReady`].
    pub fn proof_ready(&mut self, proof: ProofArtifact, now: u64) {
        self.proof = Some(proof);
        self.advance(Stage::ProofReady, now);
    }

    /// Moves to [`Stage::Submitted`], keeping the attempt count of the submission step.
    pub fn submitted(&mut self, tx_hash: B256, nonce: u64, now: u64) {
        self.destination_tx_hash = Some(tx_hash);
        self.pending_nonce = Some(nonce);
        self.stage = Stage::Submitted;
        self.updated_at = now;
    }

    /// Moves to [`Stage::Confirmed`].
    pub fn confirmed(&mut self, tx_hash: B256, now: u64) {
        self.destination_tx_hash = Some(tx_hash);
        self.pending_nonce = None;
        self.advance(Stage::Confirmed, now);
    }

    /// Records a failed attempt without changing the stage.
    pub fn attempt_failed(&mut self, error: impl Into<String>, now: u64) {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.updated_at = now;
    }

    /// Moves to [`Stage::Failed`].
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>, now: u64) {
        let message = message.into();
        self.last_error = Some(message.clone());
        self.failure = Some(JobFailure { kind, message });
        self.stage = Stage::Failed;
        self.updated_at = now;
    }

    fn advance(&mut self, stage: Stage, now: u64) {
        self.stage = stage;
        self.attempts = 0;
        self.last_error = None;
        self.updated_at = now;
    }
}
