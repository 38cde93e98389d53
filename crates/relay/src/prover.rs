//! Proof pipeline client.
//!
//! Drives the external ZoKrates CLI through its two phases:
//!
//! 1. `compute-witness` with the decimal public inputs
//! 2. `generate-proof` with the proving key
//!
//! and turns the proof document it writes into a [`ProofArtifact`].

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
};

use alloy_primitives::B256;
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tracing::{debug, info, warn};
use zkbridge_types::{
    Commitment, FailureKind, Groth16Proof, LIMB_COUNT, ProofArtifact, RelayJob, split_limbs,
};

use crate::{commitment::limb_to_decimal, config::ProverConfig};

/// Errors from a proof run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProverError {
    /// The prover binary could not be started.
    #[error("prover unavailable: {0}")]
    Unavailable(String),

    /// Witness computation failed.
    #[error("witness computation failed: {0}")]
    Witness(String),

    /// Proof generation failed or its output is unusable.
    #[error("proof generation failed: {0}")]
    ProofGeneration(String),
}

impl ProverError {
    /// Failure classification recorded on the job.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Unavailable(_) => FailureKind::ProverUnavailable,
            Self::Witness(_) => FailureKind::WitnessError,
            Self::ProofGeneration(_) => FailureKind::ProofGenerationError,
        }
    }
}

/// Inputs of one proof run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofRequest {
    /// Source transaction the proof is for; names the work directory.
    pub job_id: B256,
    /// Low 32 bits of `encryptedData`.
    pub value1_u32: u32,
    /// Event block number.
    pub block_number: u64,
    /// Event timestamp.
    pub timestamp: u64,
    /// Hex limbs of the nonce hash.
    pub nonce_limbs: [String; LIMB_COUNT],
    /// Hex limbs of the commitment root.
    pub commitment_limbs: [String; LIMB_COUNT],
}

impl ProofRequest {
    /// Build the request for a job whose commitment is known.
    pub fn for_job(job: &RelayJob, commitment: &Commitment) -> Self {
        Self {
            job_id: job.source_tx_hash,
            value1_u32: job.event.value1_u32(),
            block_number: job.event.block_number,
            timestamp: job.event.timestamp,
            nonce_limbs: split_limbs(&job.event.nonce_hash.0),
            commitment_limbs: commitment.limbs.clone(),
        }
    }

    /// Circuit arguments in decimal: value, block, timestamp, nonce limbs, root limbs.
    pub fn arguments(&self) -> Result<Vec<String>, ProverError> {
        let mut args = vec![
            self.value1_u32.to_string(),
            self.block_number.to_string(),
            self.timestamp.to_string(),
        ];
        for limb in self.nonce_limbs.iter().chain(&self.commitment_limbs) {
            let decimal = limb_to_decimal(limb)
                .map_err(|e| ProverError::Witness(format!("invalid input limb: {e}")))?;
            args.push(decimal);
        }
        Ok(args)
    }
}

/// Something that turns a [`ProofRequest`] into a proof.
#[async_trait]
pub trait Prover: Send + Sync {
    async fn generate_proof(&self, request: &ProofRequest) -> Result<ProofArtifact, ProverError>;
}

/// Document written by `generate-proof`.
#[derive(Debug, Deserialize)]
struct ProofDocument {
    proof: Groth16Proof,
    inputs: Vec<String>,
}

/// Parse a proof document and hash it.
///
/// The hash is the SHA-256 of the compact JSON re-serialization with the document's
/// key order kept.
pub fn parse_proof_document(raw: &str) -> Result<ProofArtifact, ProverError> {
    let document: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ProverError::ProofGeneration(format!("proof document is not JSON: {e}")))?;
    let proof_hash = proof_hash(&document)?;

    let ProofDocument { proof, inputs } = serde_json::from_value(document)
        .map_err(|e| ProverError::ProofGeneration(format!("malformed proof document: {e}")))?;

    Ok(ProofArtifact {
        proof,
        public_inputs: inputs,
        proof_hash,
    })
}

/// SHA-256 of the compact serialization of a JSON document.
pub fn proof_hash(document: &serde_json::Value) -> Result<B256, ProverError> {
    let compact = serde_json::to_vec(document)
        .map_err(|e| ProverError::ProofGeneration(format!("failed to serialize proof: {e}")))?;
    Ok(B256::from(<[u8; 32]>::from(Sha256::digest(&compact))))
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Witness,
    Proof,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Self::Witness => "compute-witness",
            Self::Proof => "generate-proof",
        }
    }

    fn error(self, message: String) -> ProverError {
        match self {
            Self::Witness => ProverError::Witness(message),
            Self::Proof => ProverError::ProofGeneration(message),
        }
    }
}

/// [`Prover`] running the ZoKrates CLI as a child process.
#[derive(Debug, Clone)]
pub struct ZokratesProver {
    config: ProverConfig,
}

impl ZokratesProver {
    pub fn new(config: ProverConfig) -> Self {
        Self { config }
    }

    /// Work directory of a job.
    pub fn job_dir(&self, job_id: &B256) -> PathBuf {
        self.config.work_dir.join(job_id.to_string())
    }

    async fn run_phase(
        &self,
        phase: Phase,
        job_id: &B256,
        args: Vec<OsString>,
    ) -> Result<(), ProverError> {
        let binary = &self.config.binary;
        debug!(source_tx = %job_id, phase = phase.name(), ?args, "Starting prover");

        let mut child = Command::new(binary)
            .arg(phase.name())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProverError::Unavailable(format!("failed to start {}: {e}", binary.display()))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, _, stderr_tail) = tokio::join!(
            child.wait(),
            forward_output(stdout, phase, job_id, "stdout"),
            forward_output(stderr, phase, job_id, "stderr"),
        );

        let status = status.map_err(|e| phase.error(format!("failed to wait for prover: {e}")))?;
        if !status.success() {
            let detail = stderr_tail.unwrap_or_default();
            return Err(phase.error(format!("{} exited with {status}: {detail}", phase.name())));
        }
        Ok(())
    }
}

#[async_trait]
impl Prover for ZokratesProver {
    async fn generate_proof(&self, request: &ProofRequest) -> Result<ProofArtifact, ProverError> {
        let job_dir = self.job_dir(&request.job_id);
        tokio::fs::create_dir_all(&job_dir).await.map_err(|e| {
            ProverError::Unavailable(format!(
                "failed to create work dir {}: {e}",
                job_dir.display()
            ))
        })?;

        let witness_path = job_dir.join("witness");
        let proof_path = job_dir.join("proof.json");

        let mut witness_args: Vec<OsString> = vec![
            "--input".into(),
            self.config.program.clone().into(),
            "--output".into(),
            witness_path.clone().into(),
            "--arguments".into(),
        ];
        witness_args.extend(request.arguments()?.into_iter().map(OsString::from));
        self.run_phase(Phase::Witness, &request.job_id, witness_args)
            .await?;

        // A document left by an earlier attempt must not stand in for this one.
        if let Err(e) = tokio::fs::remove_file(&proof_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            return Err(ProverError::Unavailable(format!(
                "failed to clear stale proof {}: {e}",
                proof_path.display()
            )));
        }

        let proof_args: Vec<OsString> = vec![
            "--input".into(),
            self.config.program.clone().into(),
            "--witness".into(),
            witness_path.into(),
            "--proving-key-path".into(),
            self.config.proving_key.clone().into(),
            "--proof-path".into(),
            proof_path.clone().into(),
        ];
        self.run_phase(Phase::Proof, &request.job_id, proof_args)
            .await?;

        let raw = tokio::fs::read_to_string(&proof_path).await.map_err(|e| {
            ProverError::ProofGeneration(format!(
                "missing proof document {}: {e}",
                proof_path.display()
            ))
        })?;
        let artifact = parse_proof_document(&raw)?;

        info!(
            source_tx = %request.job_id,
            proof_hash = %artifact.proof_hash,
            "Proof generated"
        );

        remove_work_dir(&job_dir).await;
        Ok(artifact)
    }
}

/// Relay the lines of a child stream into the log, returning the last non-empty one.
async fn forward_output<R>(
    stream: Option<R>,
    phase: Phase,
    job_id: &B256,
    name: &'static str,
) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream?).lines();
    let mut last = None;
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(source_tx = %job_id, phase = phase.name(), stream = name, "{line}");
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    last
}

async fn remove_work_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(dir = %dir.display(), error = %e, "Failed to remove prover work dir");
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{B256, b256};

    use super::{ProofRequest, ProverError, parse_proof_document, proof_hash};

    const DOCUMENT: &str = r#"{
  "scheme": "g16",
  "curve": "bn128",
  "proof": {
    "a": ["0x01", "0x02"],
    "b": [["0x03", "0x04"], ["0x05", "0x06"]],
    "c": ["0x07", "0x08"]
  },
  "inputs": ["0x09", "0x0a"]
}"#;

    #[test]
    fn test_proof_hash_of_compact_json() {
        let doc: serde_json::Value = serde_json::from_str(r#"{ "a": 1 }"#).unwrap();
        assert_eq!(
            proof_hash(&doc).unwrap(),
            b256!("015abd7f5cc57a2dd94b7590f04ad8084273905ee33ec5cebeae62276a97f862")
        );
    }

    #[test]
    fn test_parse_proof_document_keeps_key_order() {
        let artifact = parse_proof_document(DOCUMENT).unwrap();

        assert_eq!(artifact.proof.a, ["0x01", "0x02"]);
        assert_eq!(artifact.proof.b[1], ["0x05", "0x06"]);
        assert_eq!(artifact.public_inputs, ["0x09", "0x0a"]);
        assert_eq!(
            artifact.proof_hash,
            b256!("3b72927c86bd3a47cfc9f715abe7633ab288f94650d4b3b2f0be9298e8a83d7b")
        );
    }

    #[test]
    fn test_parse_rejects_incomplete_document() {
        assert!(matches!(
            parse_proof_document(r#"{"proof": {"a": ["0x01", "0x02"]}}"#),
            Err(ProverError::ProofGeneration(_))
        ));
        assert!(matches!(
            parse_proof_document("not json"),
            Err(ProverError::ProofGeneration(_))
        ));
    }

    #[test]
    fn test_arguments_are_decimal() {
        let request = ProofRequest {
            job_id: B256::ZERO,
            value1_u32: 0xd4f45b59,
            block_number: 5000,
            timestamp: 1_700_000_000,
            nonce_limbs: std::array::from_fn(|i| format!("0x{:08x}", i)),
            commitment_limbs: std::array::from_fn(|_| "0xffffffff".to_string()),
        };
        let args = request.arguments().unwrap();

        assert_eq!(args.len(), 19);
        assert_eq!(&args[..4], ["3572783961", "5000", "1700000000", "0"]);
        assert_eq!(args[10], "7");
        assert_eq!(args[18], "4294967295");
    }
}
