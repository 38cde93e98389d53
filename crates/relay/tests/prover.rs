#![cfg(unix)]

use std::{fs, os::unix::fs::PermissionsExt, path::Path};

use alloy_primitives::{B256, b256};
use tempfile::TempDir;
use zkbridge_relay::{ProofRequest, Prover, ProverError, ZokratesProver, config::ProverConfig};

const PROOF_DOCUMENT: &str = r#"{"scheme":"g16","curve":"bn128","proof":{"a":["0x1","0x2"],"b":[["0x3","0x4"],["0x5","0x6"]],"c":["0x7","0x8"]},"inputs":["0x9"]}"#;

fn request() -> ProofRequest {
    ProofRequest {
        job_id: B256::repeat_byte(0xab),
        value1_u32: 0xd4f45b59,
        block_number: 5000,
        timestamp: 1_700_000_000,
        nonce_limbs: [
            "0x47e179ec", "0x19748859", "0x3b187f80", "0xa00eb0da", "0x91f1b9d0", "0xb13f8733",
            "0x639f19c3", "0x0a34926a",
        ]
        .map(String::from),
        commitment_limbs: [
            "0x86b44157", "0xb2f313eb", "0xd67cd01e", "0xbf5bbfef", "0xe3d1fedd", "0xc72f52a6",
            "0x0c0731f9", "0x912b958f",
        ]
        .map(String::from),
    }
}

/// Write an executable stand-in for the ZoKrates CLI whose `generate-proof` runs `proof_step`.
fn prover_with_script(dir: &TempDir, proof_step: &str) -> ZokratesProver {
    let log = dir.path().join("witness-args");
    let witness_step = format!("echo \"$@\" > \"{}\"", log.display());
    prover_with_steps(dir, &witness_step, proof_step)
}

fn prover_with_steps(dir: &TempDir, witness_step: &str, proof_step: &str) -> ZokratesProver {
    let script = format!(
        r#"#!/bin/sh
phase="$1"
shift
case "$phase" in
  compute-witness)
    {witness_step}
    ;;
  generate-proof)
    while [ $# -gt 0 ]; do
      if [ "$1" = "--proof-path" ]; then out="$2"; fi
      shift
    done
    {proof_step}
    ;;
  *)
    exit 2
    ;;
esac
"#
    );

    let binary = dir.path().join("zokrates");
    fs::write(&binary, script).unwrap();
    fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();

    ZokratesProver::new(ProverConfig {
        binary,
        program: dir.path().join("out"),
        proving_key: dir.path().join("proving.key"),
        work_dir: dir.path().join("work"),
        concurrency: 1,
    })
}

fn witness_args(dir: &Path) -> String {
    fs::read_to_string(dir.join("witness-args")).unwrap()
}

#[tokio::test]
async fn test_generates_and_hashes_proof() {
    let dir = tempfile::tempdir().unwrap();
    let step = format!("printf '%s' '{PROOF_DOCUMENT}' > \"$out\"");
    let prover = prover_with_script(&dir, &step);

    let artifact = prover.generate_proof(&request()).await.unwrap();

    assert_eq!(artifact.proof.a, ["0x1".to_string(), "0x2".to_string()]);
    assert_eq!(artifact.proof.b[1][0], "0x5");
    assert_eq!(artifact.public_inputs, vec!["0x9".to_string()]);
    assert_eq!(
        artifact.proof_hash,
        b256!("965e660adabb0f565d727d474db952881e56df2d9de2d9a684da3df6126cc0ef")
    );

    let args = witness_args(dir.path());
    assert!(args.contains("--arguments 3572783961 5000 1700000000 1205959148"));
    assert!(args.trim_end().ends_with("2435552655"));

    assert!(!prover.job_dir(&request().job_id).exists());
}

#[tokio::test]
async fn test_failed_proof_step_is_proof_generation_error() {
    let dir = tempfile::tempdir().unwrap();
    let prover = prover_with_script(&dir, "echo 'proving key mismatch' >&2; exit 1");

    let error = prover.generate_proof(&request()).await.unwrap_err();

    match error {
        ProverError::ProofGeneration(message) => {
            assert!(message.contains("generate-proof"));
            assert!(message.contains("proving key mismatch"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_unparsable_proof_is_proof_generation_error() {
    let dir = tempfile::tempdir().unwrap();
    let prover = prover_with_script(&dir, "echo '{\"proof\":{}}' > \"$out\"");

    let error = prover.generate_proof(&request()).await.unwrap_err();
    assert!(matches!(error, ProverError::ProofGeneration(_)));
}

#[tokio::test]
async fn test_failed_witness_step_is_witness_error() {
    let dir = tempfile::tempdir().unwrap();
    let prover = prover_with_steps(
        &dir,
        "echo 'unsatisfied constraint' >&2; exit 1",
        "echo 'generate-proof ran' >&2; exit 1",
    );

    let error = prover.generate_proof(&request()).await.unwrap_err();

    match error {
        ProverError::Witness(message) => {
            assert!(message.contains("compute-witness"));
            assert!(message.contains("unsatisfied constraint"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_proof_step_without_document_ignores_stale_proof() {
    let dir = tempfile::tempdir().unwrap();
    let prover = prover_with_script(&dir, "exit 0");

    // A complete document from an earlier attempt is still in the work dir.
    let job_dir = prover.job_dir(&request().job_id);
    fs::create_dir_all(&job_dir).unwrap();
    fs::write(job_dir.join("proof.json"), PROOF_DOCUMENT).unwrap();

    let error = prover.generate_proof(&request()).await.unwrap_err();

    match error {
        ProverError::ProofGeneration(message) => {
            assert!(message.contains("missing proof document"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_binary_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let prover = ZokratesProver::new(ProverConfig {
        binary: dir.path().join("does-not-exist"),
        program: dir.path().join("out"),
        proving_key: dir.path().join("proving.key"),
        work_dir: dir.path().join("work"),
        concurrency: 1,
    });

    let error = prover.generate_proof(&request()).await.unwrap_err();
    assert!(matches!(error, ProverError::Unavailable(_)));
}
