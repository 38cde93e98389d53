//! # Source Event Watcher
//!
//! [`LockWatcher`] polls the source chain for `Locked` logs of the bridge contract and
//! forwards them to the coordinator once they are `confirmations` blocks deep.
//!
//! Each tick reads the head, then scans `[cursor, head - confirmations]` in chunks of at
//! most `max_block_range` blocks. The cursor only moves past a chunk after every event of
//! it was handed to the coordinator. With a job store, every forwarded event is first
//! recorded there as an `Observed` job and the cursor is persisted, so an event still
//! queued when the relay stops is resumed from the job log. Logs that cannot be decoded
//! are reported and skipped.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{B256, U256};
use alloy_rpc_types_eth::Log;
use alloy_sol_types::SolEvent;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zkbridge_types::{LockEvent, RelayJob};

use crate::{
    config::SourceConfig,
    metrics,
    rpc::Locked,
    service::coordinator::CoordinatorMessage,
    storage::{JobStore, WatchCursor},
    util::{SeenSet, unix_now},
};

/// Errors raised while watching the source chain.
#[derive(Debug, Error)]
pub enum WatchError {
    /// A log could not be turned into a [`LockEvent`].
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The source node could not be queried.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// The coordinator stopped receiving events.
    #[error("event channel closed")]
    ChannelClosed,

    /// The job log or the cursor could not be read or written.
    #[error(transparent)]
    Storage(#[from] crate::error::Error),
}

/// Read access to the source chain.
#[async_trait]
pub trait SourceChain: Send + Sync {
    /// Current head block number.
    async fn head_number(&self) -> Result<u64, WatchError>;

    /// `Locked` logs of the bridge contract in the inclusive block range.
    async fn locked_logs(&self, from: u64, to: u64) -> Result<Vec<Log>, WatchError>;
}

/// Decode a raw `Locked` log.
pub fn decode_locked_log(log: &Log) -> Result<LockEvent, WatchError> {
    let source_tx_hash = log
        .transaction_hash
        .ok_or_else(|| WatchError::MalformedEvent("log has no transaction hash".into()))?;
    let log_block_number = log
        .block_number
        .ok_or_else(|| WatchError::MalformedEvent("log has no block number".into()))?;
    let log_index = log
        .log_index
        .ok_or_else(|| WatchError::MalformedEvent("log has no log index".into()))?;

    let locked = Locked::decode_log_data(log.data())
        .map_err(|e| WatchError::MalformedEvent(format!("undecodable Locked data: {e}")))?;

    Ok(LockEvent {
        encrypted_data: locked.encryptedData,
        block_number: to_u64("blockNumber", locked.blockNumber)?,
        timestamp: to_u64("timestamp", locked.timestamp)?,
        nonce_hash: locked.nonceHash,
        source_tx_hash,
        log_block_number,
        log_index,
    })
}

fn to_u64(field: &str, value: U256) -> Result<u64, WatchError> {
    u64::try_from(value)
        .map_err(|_| WatchError::MalformedEvent(format!("{field} {value} does not fit in 64 bits")))
}

/// Polls the source chain and forwards confirmed lock events.
pub struct LockWatcher {
    source: Arc<dyn SourceChain>,
    config: SourceConfig,
    store: Option<JobStore>,
    coordinator_tx: mpsc::Sender<CoordinatorMessage>,
    seen: SeenSet<B256>,
    next_block: Option<u64>,
}

impl LockWatcher {
    pub fn new(
        source: Arc<dyn SourceChain>,
        config: SourceConfig,
        store: Option<JobStore>,
        coordinator_tx: mpsc::Sender<CoordinatorMessage>,
    ) -> Self {
        let seen = SeenSet::new(config.dedup_retention_blocks);
        Self {
            source,
            config,
            store,
            coordinator_tx,
            seen,
            next_block: None,
        }
    }

    /// Next block the watcher scans, once known.
    pub fn next_block(&self) -> Option<u64> {
        self.next_block
    }

    pub async fn run(mut self, shutdown_token: CancellationToken) {
        let mut poll_interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            bridge = %self.config.bridge_address,
            confirmations = self.config.confirmations,
            interval_ms = self.config.poll_interval_ms,
            "LockWatcher started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => {
                    info!("LockWatcher received shutdown signal");
                    break;
                }

                _ = poll_interval.tick() => {
                    tokio::select! {
                        biased;

                        _ = shutdown_token.cancelled() => {
                            info!("LockWatcher received shutdown signal");
                            break;
                        }

                        result = self.poll() => match result {
                            Ok(()) => {}
                            Err(WatchError::ChannelClosed) => {
                                warn!("Coordinator is gone, stopping LockWatcher");
                                break;
                            }
                            Err(e) => warn!(error = %e, "Source poll failed, retrying next tick"),
                        }
                    }
                }
            }
        }

        info!("LockWatcher stopped");
    }

    /// Run one scan over the newly confirmed block range.
    pub async fn poll(&mut self) -> Result<(), WatchError> {
        let head = self.source.head_number().await?;
        let Some(confirmed) = head.checked_sub(self.config.confirmations) else {
            debug!(head, "Chain shorter than confirmation depth");
            return Ok(());
        };

        let mut from = match self.next_block {
            Some(next) => next,
            None => {
                let start = self.initial_block(confirmed)?;
                self.advance_cursor(start)?;
                start
            }
        };

        while from <= confirmed {
            let to = confirmed.min(from.saturating_add(self.config.max_block_range - 1));
            let mut logs = self.source.locked_logs(from, to).await?;
            logs.sort_by_key(|log| (log.block_number, log.log_index));

            debug!(from, to, logs = logs.len(), "Scanned source range");

            for log in &logs {
                self.handle_log(log, head).await?;
            }

            from = to + 1;
            self.advance_cursor(from)?;
        }

        self.seen.prune(confirmed);
        debug!(next_block = from, seen = self.seen.len(), "Source scan caught up");
        Ok(())
    }

    async fn handle_log(&mut self, log: &Log, head: u64) -> Result<(), WatchError> {
        let event = match decode_locked_log(log) {
            Ok(event) => event,
            Err(e) => {
                metrics::record_malformed_log();
                warn!(
                    tx = ?log.transaction_hash,
                    block = ?log.block_number,
                    error = %e,
                    "Skipping malformed Locked log"
                );
                return Ok(());
            }
        };

        if event.log_block_number.saturating_add(self.config.confirmations) > head {
            return Ok(());
        }

        if self.seen.contains(&event.source_tx_hash) {
            debug!(source_tx = %event.source_tx_hash, "Lock event already forwarded");
            return Ok(());
        }

        // The job must be in the log before the cursor can move past its block.
        if let Some(store) = &self.store
            && store.insert_new(&RelayJob::new(event.clone(), unix_now()))?
        {
            debug!(source_tx = %event.source_tx_hash, "Job recorded in the job log");
        }
        self.seen.insert(event.source_tx_hash, event.log_block_number);

        info!(
            source_tx = %event.source_tx_hash,
            block = event.log_block_number,
            nonce_hash = %event.nonce_hash,
            "Lock event confirmed"
        );

        self.coordinator_tx
            .send(CoordinatorMessage::Observed(event))
            .await
            .map_err(|_| WatchError::ChannelClosed)
    }

    fn initial_block(&self, confirmed: u64) -> Result<u64, WatchError> {
        if let Some(store) = &self.store
            && let Some(cursor) = store.load_cursor()?
        {
            info!(next_block = cursor.next_block, "Resuming from persisted cursor");
            return Ok(cursor.next_block);
        }

        let start = self.config.start_block.unwrap_or(confirmed + 1);
        info!(start_block = start, "Starting source scan");
        Ok(start)
    }

    fn advance_cursor(&mut self, next_block: u64) -> Result<(), WatchError> {
        self.next_block = Some(next_block);
        metrics::set_source_cursor(next_block);
        if let Some(store) = &self.store {
            store.save_cursor(WatchCursor { next_block })?;
        }
        Ok(())
    }
}
