//! # Relay Coordinator
//!
//! [`Coordinator`] owns every [`RelayJob`] and drives each one through
//!
//! ```text
//! Observed -> CommitmentReady -> ProofReady -> Submitted -> Confirmed
//!     \              \                \            \
//!      +--------------+----------------+------------+--> Failed
//! ```
//!
//! One task per job runs the stages in order. A failed attempt never advances the
//! stage; it is retried with exponential backoff until the ceiling of its failure kind
//! is reached. Jobs are keyed by source transaction: a second observation of a job in
//! flight is coalesced, one of a finished job is dropped. Every change is written to the
//! job store when one is configured, and [`Coordinator::resume`] picks unfinished jobs
//! back up from their persisted stage.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use alloy_primitives::B256;
use lru::LruCache;
use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zkbridge_types::{FailureKind, LockEvent, RelayJob, Stage};

use crate::{
    commitment::commitment_for_event,
    config::{Config, RetryConfig},
    error::Result,
    metrics,
    prover::{ProofRequest, Prover},
    storage::JobStore,
    submitter::{MintRequest, MintSubmitter, PendingMint, SubmitError, encode_mint_call},
    util::unix_now,
};

/// Messages accepted by the coordinator.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// A confirmed lock event from the watcher.
    Observed(LockEvent),
}

/// What happened to an observed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A pipeline was started (or restarted from the job log).
    Started,
    /// A pipeline for the same source transaction is already running.
    Coalesced,
    /// The source transaction was already relayed or given up on.
    AlreadyTerminal(Stage),
}

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Maximum number of jobs running a pipeline at the same time.
    pub max_in_flight: usize,
    /// Number of prover runs allowed at the same time.
    pub prover_concurrency: usize,
    /// Number of terminal jobs kept in memory.
    pub terminal_cache_size: usize,
    /// Retry policy.
    pub retry: RetryConfig,
    /// Revert reasons worth another submission.
    pub transient_revert_reasons: Vec<String>,
}

impl From<&Config> for CoordinatorConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_in_flight: config.relay.max_in_flight,
            prover_concurrency: config.prover.concurrency,
            terminal_cache_size: config.relay.terminal_cache_size,
            retry: config.retry.clone(),
            transient_revert_reasons: config.destination.transient_revert_reasons.clone(),
        }
    }
}

struct Registry {
    in_flight: HashMap<B256, RelayJob>,
    terminal: LruCache<B256, RelayJob>,
}

/// In-memory view of the jobs, shared with the status server.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl JobRegistry {
    pub fn new(terminal_cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(terminal_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(Registry {
                in_flight: HashMap::new(),
                terminal: LruCache::new(capacity),
            })),
        }
    }

    /// Latest snapshot of a job known in memory.
    pub async fn get(&self, source_tx_hash: &B256) -> Option<RelayJob> {
        let registry = self.inner.lock().await;
        registry
            .in_flight
            .get(source_tx_hash)
            .or_else(|| registry.terminal.peek(source_tx_hash))
            .cloned()
    }

    /// Number of jobs that have not finished.
    pub async fn in_flight(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    async fn update(&self, job: &RelayJob) {
        let mut registry = self.inner.lock().await;
        if job.is_terminal() {
            registry.in_flight.remove(&job.source_tx_hash);
            registry.terminal.put(job.source_tx_hash, job.clone());
        } else {
            registry.in_flight.insert(job.source_tx_hash, job.clone());
        }
        metrics::set_in_flight(registry.in_flight.len());
    }

    async fn release(&self, source_tx_hash: &B256) {
        let mut registry = self.inner.lock().await;
        registry.in_flight.remove(source_tx_hash);
        metrics::set_in_flight(registry.in_flight.len());
    }
}

/// The job task was cancelled by shutdown.
struct Interrupted;

struct Timings {
    started: Instant,
    proof: Duration,
    mint: Duration,
}

/// State shared by all job tasks.
struct JobContext {
    prover: Arc<dyn Prover>,
    submitter: Arc<dyn MintSubmitter>,
    store: Option<JobStore>,
    registry: JobRegistry,
    retry: RetryConfig,
    transient_revert_reasons: Vec<String>,
    pipeline_slots: Semaphore,
    prover_slots: Semaphore,
}

/// Admits lock events and runs their pipelines.
pub struct Coordinator {
    ctx: Arc<JobContext>,
    coordinator_rx: mpsc::Receiver<CoordinatorMessage>,
    jobs: JoinSet<()>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        prover: Arc<dyn Prover>,
        submitter: Arc<dyn MintSubmitter>,
        store: Option<JobStore>,
        coordinator_rx: mpsc::Receiver<CoordinatorMessage>,
    ) -> Self {
        let ctx = JobContext {
            prover,
            submitter,
            store,
            registry: JobRegistry::new(config.terminal_cache_size),
            retry: config.retry,
            transient_revert_reasons: config.transient_revert_reasons,
            pipeline_slots: Semaphore::new(config.max_in_flight.max(1)),
            prover_slots: Semaphore::new(config.prover_concurrency.max(1)),
        };
        Self {
            ctx: Arc::new(ctx),
            coordinator_rx,
            jobs: JoinSet::new(),
        }
    }

    /// Handle to the in-memory job view.
    pub fn registry(&self) -> JobRegistry {
        self.ctx.registry.clone()
    }

    pub async fn run(mut self, shutdown_token: CancellationToken) {
        match self.resume(&shutdown_token).await {
            Ok(0) => {}
            Ok(resumed) => info!(resumed, "Resumed unfinished jobs from the job log"),
            Err(e) => error!(error = %e, "Failed to load the job log"),
        }

        info!("Coordinator started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => {
                    info!("Coordinator received shutdown signal");
                    break;
                }

                Some(result) = self.jobs.join_next(), if !self.jobs.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "Job task failed");
                    }
                }

                message = self.coordinator_rx.recv() => match message {
                    Some(CoordinatorMessage::Observed(event)) => {
                        self.handle_observed(event, &shutdown_token).await;
                    }
                    None => {
                        info!("Event channel closed, finishing running jobs");
                        break;
                    }
                }
            }
        }

        while let Some(result) = self.jobs.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Job task failed");
            }
        }

        info!("Coordinator stopped");
    }

    async fn handle_observed(&mut self, event: LockEvent, shutdown_token: &CancellationToken) {
        let source_tx = event.source_tx_hash;
        match self.admit(event, shutdown_token).await {
            Ok(Admission::Started) => {}
            Ok(Admission::Coalesced) => {
                debug!(source_tx = %source_tx, "Job already in flight, coalesced");
            }
            Ok(Admission::AlreadyTerminal(stage)) => {
                info!(source_tx = %source_tx, stage = %stage, "Job already finished, ignoring");
            }
            Err(e) => error!(source_tx = %source_tx, error = %e, "Failed to admit lock event"),
        }
    }

    /// Admit an observed event, starting its pipeline unless it is a duplicate.
    pub async fn admit(
        &mut self,
        event: LockEvent,
        shutdown_token: &CancellationToken,
    ) -> Result<Admission> {
        metrics::record_observed();
        let source_tx = event.source_tx_hash;

        {
            let mut registry = self.ctx.registry.inner.lock().await;
            if registry.in_flight.contains_key(&source_tx) {
                metrics::record_duplicate("coalesced");
                return Ok(Admission::Coalesced);
            }
            if let Some(job) = registry.terminal.get(&source_tx) {
                metrics::record_duplicate("terminal");
                return Ok(Admission::AlreadyTerminal(job.stage));
            }
        }

        let persisted = match &self.ctx.store {
            Some(store) => store.load(&source_tx)?,
            None => None,
        };

        let job = match persisted {
            Some(job) if job.is_terminal() => {
                metrics::record_duplicate("terminal");
                let stage = job.stage;
                self.ctx.registry.update(&job).await;
                return Ok(Admission::AlreadyTerminal(stage));
            }
            Some(job) => job,
            None => {
                let job = RelayJob::new(event, unix_now());
                info!(
                    source_tx = %source_tx,
                    block = job.event.log_block_number,
                    "Job observed"
                );
                metrics::record_transition(Stage::Observed);
                self.ctx.persist(&job).await;
                job
            }
        };

        self.spawn(job, shutdown_token).await;
        Ok(Admission::Started)
    }

    /// Restart every unfinished job of the job log; returns how many were restarted.
    pub async fn resume(&mut self, shutdown_token: &CancellationToken) -> Result<usize> {
        let Some(store) = &self.ctx.store else {
            return Ok(0);
        };

        let mut resumed = 0;
        for job in store.load_all()? {
            if job.is_terminal() {
                self.ctx.registry.update(&job).await;
                continue;
            }

            info!(
                source_tx = %job.source_tx_hash,
                stage = %job.stage,
                attempts = job.attempts,
                "Resuming job"
            );
            self.spawn(job, shutdown_token).await;
            resumed += 1;
        }
        Ok(resumed)
    }

    async fn spawn(&mut self, job: RelayJob, shutdown_token: &CancellationToken) {
        self.ctx.registry.update(&job).await;
        let ctx = self.ctx.clone();
        let shutdown_token = shutdown_token.clone();
        self.jobs.spawn(ctx.run_job(job, shutdown_token));
    }
}

impl JobContext {
    async fn run_job(self: Arc<Self>, mut job: RelayJob, shutdown_token: CancellationToken) {
        let permit = shutdown_token
            .run_until_cancelled(self.pipeline_slots.acquire())
            .await
            .and_then(|permit| permit.ok());
        let Some(_permit) = permit else {
            self.interrupted(job).await;
            return;
        };

        let mut timings = Timings {
            started: Instant::now(),
            proof: Duration::ZERO,
            mint: Duration::ZERO,
        };

        if self.drive(&mut job, &shutdown_token, &mut timings).await.is_err() {
            self.interrupted(job).await;
        }
    }

    async fn drive(
        &self,
        job: &mut RelayJob,
        shutdown_token: &CancellationToken,
        timings: &mut Timings,
    ) -> std::result::Result<(), Interrupted> {
        loop {
            match job.stage {
                Stage::Observed => self.build_commitment(job).await,
                Stage::CommitmentReady => self.generate_proof(job, shutdown_token, timings).await?,
                Stage::ProofReady | Stage::Submitted => {
                    self.submit(job, shutdown_token, timings).await?
                }
                Stage::Confirmed | Stage::Failed => return Ok(()),
            }
        }
    }

    async fn build_commitment(&self, job: &mut RelayJob) {
        match commitment_for_event(&job.event) {
            Ok(commitment) => {
                if job.event.truncates_encrypted_data() {
                    debug!(
                        source_tx = %job.source_tx_hash,
                        encrypted_data = %job.event.encrypted_data,
                        "Only the low 32 bits of encryptedData are committed"
                    );
                }
                job.commitment_ready(commitment, unix_now());
                self.transition(job).await;
            }
            Err(e) => self.finish_failed(job, FailureKind::MalformedEvent, e.to_string()).await,
        }
    }

    async fn generate_proof(
        &self,
        job: &mut RelayJob,
        shutdown_token: &CancellationToken,
        timings: &mut Timings,
    ) -> std::result::Result<(), Interrupted> {
        let Some(commitment) = job.commitment.clone() else {
            self.finish_failed(job, FailureKind::MalformedEvent, "job has no commitment".into())
                .await;
            return Ok(());
        };
        let request = ProofRequest::for_job(job, &commitment);

        let result = {
            let _slot = shutdown_token
                .run_until_cancelled(self.prover_slots.acquire())
                .await
                .and_then(|permit| permit.ok())
                .ok_or(Interrupted)?;

            let started = Instant::now();
            let result = shutdown_token
                .run_until_cancelled(self.prover.generate_proof(&request))
                .await
                .ok_or(Interrupted)?;
            timings.proof += started.elapsed();
            result
        };

        match result {
            Ok(artifact) => {
                job.proof_ready(artifact, unix_now());
                self.transition(job).await;
            }
            Err(e) => {
                let kind = e.kind();
                let max_attempts = match kind {
                    FailureKind::ProofGenerationError => self.retry.proof_generation_max_attempts,
                    _ => self.retry.prover_max_attempts,
                };
                self.retry_or_fail(job, kind, e.to_string(), max_attempts, shutdown_token)
                    .await?;
            }
        }
        Ok(())
    }

    async fn submit(
        &self,
        job: &mut RelayJob,
        shutdown_token: &CancellationToken,
        timings: &mut Timings,
    ) -> std::result::Result<(), Interrupted> {
        let (Some(commitment), Some(proof)) = (job.commitment.clone(), job.proof.clone()) else {
            self.finish_failed(job, FailureKind::ProofGenerationError, "job has no proof".into())
                .await;
            return Ok(());
        };

        let request = MintRequest {
            job_id: job.source_tx_hash,
            encrypted_data: job.event.encrypted_data,
            commitment,
            proof,
            attempt: job.attempts,
            replace_nonce: job.pending_nonce,
        };
        let calldata = match encode_mint_call(&request) {
            Ok(calldata) => calldata,
            Err(e) => {
                self.finish_failed(job, e.kind(), e.to_string()).await;
                return Ok(());
            }
        };

        let started = Instant::now();

        // The transaction holding the pending nonce may have landed after we stopped
        // waiting for it.
        let previous = match (job.stage, job.destination_tx_hash, job.pending_nonce) {
            (Stage::Submitted, Some(tx_hash), Some(nonce)) => Some(PendingMint {
                tx_hash,
                nonce,
                calldata,
            }),
            _ => None,
        };
        if let Some(previous) = &previous {
            let included = shutdown_token
                .run_until_cancelled(self.submitter.check_inclusion(previous))
                .await
                .ok_or(Interrupted)?;

            match included {
                Ok(Some(_)) => {
                    return self
                        .settle_previous(job, previous, shutdown_token, timings, started)
                        .await;
                }
                Ok(None) => {
                    debug!(
                        source_tx = %job.source_tx_hash,
                        dest_tx = %previous.tx_hash,
                        nonce = previous.nonce,
                        "Replacing mint transaction"
                    );
                }
                Err(e) => return self.submission_failed(job, e, shutdown_token).await,
            }
        }

        let sent = shutdown_token
            .run_until_cancelled(self.submitter.send_mint(&request))
            .await
            .ok_or(Interrupted)?;
        let pending = match sent {
            Ok(pending) => pending,
            Err(error) => {
                // The replacement reverts once the transaction it replaces is mined.
                if let (SubmitError::Reverted { tx_hash: None, .. }, Some(previous)) =
                    (&error, &previous)
                {
                    let included = shutdown_token
                        .run_until_cancelled(self.submitter.check_inclusion(previous))
                        .await
                        .ok_or(Interrupted)?;
                    if let Ok(Some(_)) = included {
                        return self
                            .settle_previous(job, previous, shutdown_token, timings, started)
                            .await;
                    }
                }
                return self.submission_failed(job, error, shutdown_token).await;
            }
        };

        job.submitted(pending.tx_hash, pending.nonce, unix_now());
        info!(
            source_tx = %job.source_tx_hash,
            dest_tx = %pending.tx_hash,
            nonce = pending.nonce,
            attempt = job.attempts + 1,
            "Mint submitted"
        );
        metrics::record_transition(Stage::Submitted);
        self.persist(job).await;

        let outcome = shutdown_token
            .run_until_cancelled(self.submitter.await_inclusion(&pending))
            .await
            .ok_or(Interrupted)?;
        timings.mint += started.elapsed();
        self.settle(job, outcome, shutdown_token, timings).await
    }

    async fn settle_previous(
        &self,
        job: &mut RelayJob,
        previous: &PendingMint,
        shutdown_token: &CancellationToken,
        timings: &mut Timings,
        started: Instant,
    ) -> std::result::Result<(), Interrupted> {
        info!(
            source_tx = %job.source_tx_hash,
            dest_tx = %previous.tx_hash,
            "Earlier mint transaction was included"
        );
        let outcome = shutdown_token
            .run_until_cancelled(self.submitter.await_inclusion(previous))
            .await
            .ok_or(Interrupted)?;
        timings.mint += started.elapsed();
        self.settle(job, outcome, shutdown_token, timings).await
    }

    async fn settle(
        &self,
        job: &mut RelayJob,
        outcome: std::result::Result<B256, SubmitError>,
        shutdown_token: &CancellationToken,
        timings: &Timings,
    ) -> std::result::Result<(), Interrupted> {
        match outcome {
            Ok(tx_hash) => {
                job.confirmed(tx_hash, unix_now());
                let total = timings.started.elapsed();
                info!(
                    source_tx = %job.source_tx_hash,
                    dest_tx = %tx_hash,
                    total_ms = total.as_millis() as u64,
                    proof_ms = timings.proof.as_millis() as u64,
                    mint_ms = timings.mint.as_millis() as u64,
                    "Mint confirmed"
                );
                metrics::record_timings(timings.proof, timings.mint, total);
                metrics::record_transition(Stage::Confirmed);
                metrics::record_finished(None);
                self.persist(job).await;
                Ok(())
            }
            Err(e) => self.submission_failed(job, e, shutdown_token).await,
        }
    }

    async fn submission_failed(
        &self,
        job: &mut RelayJob,
        error: SubmitError,
        shutdown_token: &CancellationToken,
    ) -> std::result::Result<(), Interrupted> {
        let kind = error.kind();
        let message = error.to_string();
        let max_attempts = self.retry.submission_max_attempts;

        match &error {
            SubmitError::Reverted { reason, .. } => {
                job.pending_nonce = None;
                if self.is_transient(reason) {
                    self.retry_or_fail(job, kind, message, max_attempts, shutdown_token)
                        .await
                } else {
                    self.finish_failed(job, kind, message).await;
                    Ok(())
                }
            }
            SubmitError::Rejected(_) | SubmitError::TimedOut { .. } => {
                self.retry_or_fail(job, kind, message, max_attempts, shutdown_token)
                    .await
            }
            SubmitError::MalformedProof(_) => {
                self.finish_failed(job, kind, message).await;
                Ok(())
            }
        }
    }

    fn is_transient(&self, reason: &str) -> bool {
        self.transient_revert_reasons
            .iter()
            .any(|pattern| reason.contains(pattern.as_str()))
    }

    async fn retry_or_fail(
        &self,
        job: &mut RelayJob,
        kind: FailureKind,
        message: String,
        max_attempts: u32,
        shutdown_token: &CancellationToken,
    ) -> std::result::Result<(), Interrupted> {
        job.attempt_failed(message.clone(), unix_now());
        if job.attempts >= max_attempts {
            self.finish_failed(job, kind, message).await;
            return Ok(());
        }

        let delay = self.retry.backoff(job.attempts);
        warn!(
            source_tx = %job.source_tx_hash,
            stage = %job.stage,
            attempt = job.attempts,
            max_attempts,
            kind = %kind,
            error = %message,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, retrying"
        );
        metrics::record_retry(kind);
        self.persist(job).await;

        shutdown_token
            .run_until_cancelled(tokio::time::sleep(delay))
            .await
            .ok_or(Interrupted)
    }

    async fn transition(&self, job: &RelayJob) {
        info!(source_tx = %job.source_tx_hash, stage = %job.stage, "Job advanced");
        metrics::record_transition(job.stage);
        self.persist(job).await;
    }

    async fn finish_failed(&self, job: &mut RelayJob, kind: FailureKind, message: String) {
        error!(
            source_tx = %job.source_tx_hash,
            stage = %job.stage,
            attempts = job.attempts,
            kind = %kind,
            error = %message,
            "Job failed"
        );
        job.fail(kind, message, unix_now());
        metrics::record_transition(Stage::Failed);
        metrics::record_finished(Some(kind));
        self.persist(job).await;
    }

    async fn interrupted(&self, mut job: RelayJob) {
        if self.store.is_some() {
            info!(
                source_tx = %job.source_tx_hash,
                stage = %job.stage,
                "Shutting down, job left in the job log for resume"
            );
            self.registry.release(&job.source_tx_hash).await;
            return;
        }

        warn!(source_tx = %job.source_tx_hash, stage = %job.stage, "Job interrupted by shutdown");
        job.fail(
            FailureKind::InterruptedShutdown,
            format!("service shut down at stage {}", job.stage),
            unix_now(),
        );
        metrics::record_finished(Some(FailureKind::InterruptedShutdown));
        self.persist(&job).await;
    }

    async fn persist(&self, job: &RelayJob) {
        if let Some(store) = &self.store
            && let Err(e) = store.save(job)
        {
            error!(source_tx = %job.source_tx_hash, error = %e, "Failed to write job snapshot");
        }
        self.registry.update(job).await;
    }
}
