//! zkbridge relay - watches a source-chain bridge for `Locked` events, proves them and
//! mints on the destination chain.
//!
//! This crate provides functionality to:
//! - Poll the source chain for confirmed `Locked` logs
//! - Derive the Merkle commitment of a lock event
//! - Drive the external ZoKrates prover
//! - Submit and follow `mintTokens` transactions
//! - Persist every job so a restart resumes where it stopped
//!
//! ## Example
//!
//! ```ignore
//! use zkbridge_relay::compute_commitment;
//!
//! let commitment = compute_commitment(
//!     "0x690184dd639cd4f45b59",
//!     5000,
//!     1_700_000_000,
//!     "47e179ec197488593b187f80a00eb0da91f1b9d0b13f8733639f19c30a34926a",
//! )?;
//! println!("{}", commitment.root);
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod commitment;
pub mod config;
pub mod error;
pub mod metrics;
pub mod prover;
pub mod rpc;
pub mod service;
pub mod storage;
pub mod submitter;
pub mod util;
pub mod watcher;

// Re-export main types at crate root for convenience.
pub use commitment::{CommitmentError, commitment_for_event, compute_commitment};
pub use config::Config;
pub use error::{Error, Result};
pub use prover::{ProofRequest, Prover, ProverError, ZokratesProver};
pub use rpc::SourceRpcClient;
pub use service::{
    coordinator::{Admission, Coordinator, CoordinatorConfig, CoordinatorMessage, JobRegistry},
    status::{StatusServer, StatusState},
};
pub use storage::{JobStore, WatchCursor};
pub use submitter::{
    EvmMintSubmitter, MintRequest, MintSubmitter, PendingMint, SubmitError, submit_mint,
};
pub use watcher::{LockWatcher, SourceChain, WatchError};

// Re-export types that appear in our public API.
pub use zkbridge_types::{Commitment, LockEvent, ProofArtifact, RelayJob, Stage};
