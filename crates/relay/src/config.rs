//! Configuration types for the zkbridge relay.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Source (lock side) chain.
    pub source: SourceConfig,
    /// Destination (mint side) chain.
    pub destination: DestinationConfig,
    /// External prover.
    pub prover: ProverConfig,
    /// Coordinator settings.
    #[serde(default)]
    pub relay: RelayConfig,
    /// Retry and backoff policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Source chain configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SourceConfig {
    /// HTTP JSON-RPC URL.
    pub rpc_url: Url,
    /// Address of the bridge contract emitting `Locked`.
    pub bridge_address: Address,
    /// Blocks a log must be buried under before it is relayed.
    #[serde(default = "default_source_confirmations")]
    pub confirmations: u64,
    /// Interval between head polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// First block to scan when no cursor has been persisted yet.
    ///
    /// Defaults to the confirmed head at startup.
    pub start_block: Option<u64>,
    /// Largest block range requested per `eth_getLogs` call.
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    /// Number of confirmed blocks the watcher remembers relayed transactions for.
    #[serde(default = "default_dedup_retention_blocks")]
    pub dedup_retention_blocks: u64,
}

/// Destination chain configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DestinationConfig {
    /// HTTP JSON-RPC URL.
    pub rpc_url: Url,
    /// Address of the bridge contract exposing `mintTokens`.
    pub bridge_address: Address,
    /// Environment variable holding the hex-encoded signer key.
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
    /// Blocks the mint receipt must be buried under before the job is confirmed.
    #[serde(default = "default_destination_confirmations")]
    pub confirmations: u64,
    /// How long to wait for a receipt before the submission counts as timed out.
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
    /// Interval between receipt polls.
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
    /// Fixed gas limit; estimated by the node when unset.
    pub gas_limit: Option<u64>,
    /// Revert reasons (matched as substrings) that are worth another attempt.
    #[serde(default = "default_transient_revert_reasons")]
    pub transient_revert_reasons: Vec<String>,
}

/// External prover configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProverConfig {
    /// Prover executable, looked up in `PATH` when not absolute.
    #[serde(default = "default_prover_binary")]
    pub binary: PathBuf,
    /// Compiled circuit.
    pub program: PathBuf,
    /// Groth16 proving key.
    pub proving_key: PathBuf,
    /// Directory in which per-job witness and proof files are written.
    #[serde(default = "default_prover_work_dir")]
    pub work_dir: PathBuf,
    /// Number of prover runs allowed at the same time.
    #[serde(default = "default_prover_concurrency")]
    pub concurrency: usize,
}

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Maximum number of jobs running a pipeline at the same time.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Directory of the persisted job log; jobs only live in memory when unset.
    pub state_dir: Option<PathBuf>,
    /// Number of terminal outcomes kept in memory for duplicate detection.
    #[serde(default = "default_terminal_cache_size")]
    pub terminal_cache_size: usize,
    /// Port of the status HTTP server; disabled when unset.
    pub status_port: Option<u16>,
    /// Capacity of the watcher to coordinator queue.
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            state_dir: None,
            terminal_cache_size: default_terminal_cache_size(),
            status_port: None,
            event_queue_size: default_event_queue_size(),
        }
    }
}

/// Retry and backoff policy of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Attempt ceiling for `ProverUnavailable` and `WitnessError`.
    #[serde(default = "default_prover_max_attempts")]
    pub prover_max_attempts: u32,
    /// Attempt ceiling for `ProofGenerationError`.
    #[serde(default = "default_proof_generation_max_attempts")]
    pub proof_generation_max_attempts: u32,
    /// Attempt ceiling for `TimedOut`, `SubmissionRejected` and transient reverts.
    #[serde(default = "default_submission_max_attempts")]
    pub submission_max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound of the exponential backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Fee increase applied per submission retry, in percent.
    #[serde(default = "default_fee_bump_percent")]
    pub fee_bump_percent: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            prover_max_attempts: default_prover_max_attempts(),
            proof_generation_max_attempts: default_proof_generation_max_attempts(),
            submission_max_attempts: default_submission_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            fee_bump_percent: default_fee_bump_percent(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling from `initial_backoff_ms`
    /// and capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

fn default_source_confirmations() -> u64 {
    2
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_dedup_retention_blocks() -> u64 {
    10_000
}

fn default_private_key_env() -> String {
    "DESTINATION_PRIVATE_KEY".to_string()
}

fn default_destination_confirmations() -> u64 {
    1
}

fn default_receipt_timeout_secs() -> u64 {
    120
}

fn default_receipt_poll_interval_ms() -> u64 {
    1000
}

fn default_transient_revert_reasons() -> Vec<String> {
    vec!["nonce race".to_string()]
}

fn default_prover_binary() -> PathBuf {
    PathBuf::from("zokrates")
}

fn default_prover_work_dir() -> PathBuf {
    std::env::temp_dir().join("zkbridge-prover")
}

fn default_prover_concurrency() -> usize {
    1
}

fn default_max_in_flight() -> usize {
    4
}

fn default_terminal_cache_size() -> usize {
    4096
}

fn default_event_queue_size() -> usize {
    1024
}

fn default_prover_max_attempts() -> u32 {
    5
}

fn default_proof_generation_max_attempts() -> u32 {
    2
}

fn default_submission_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_fee_bump_percent() -> u64 {
    12
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml_edit::de::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.prover.concurrency == 0 {
            return Err(Error::Config("prover.concurrency must be at least 1".into()));
        }
        if self.relay.max_in_flight == 0 {
            return Err(Error::Config("relay.max_in_flight must be at least 1".into()));
        }
        if self.relay.terminal_cache_size == 0 {
            return Err(Error::Config(
                "relay.terminal_cache_size must be at least 1".into(),
            ));
        }
        if self.relay.event_queue_size == 0 {
            return Err(Error::Config("relay.event_queue_size must be at least 1".into()));
        }
        if self.source.max_block_range == 0 {
            return Err(Error::Config("source.max_block_range must be at least 1".into()));
        }
        if self.retry.prover_max_attempts == 0
            || self.retry.proof_generation_max_attempts == 0
            || self.retry.submission_max_attempts == 0
        {
            return Err(Error::Config("retry attempt ceilings must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{path::PathBuf, time::Duration};

    use alloy_primitives::address;

    use crate::config::{Config, RetryConfig};

    const MINIMAL: &str = r#"
        [source]
        rpc_url = "http://127.0.0.1:8545"
        bridge_address = "0x311Ab7A24412cfc9e110A8ac17dFFbFf60EccDCE"

        [destination]
        rpc_url = "https://rpc-amoy.polygon.technology"
        bridge_address = "0x0000000000000000000000000000000000000001"

        [prover]
        program = "zokrates/artifacts/lock_proof"
        proving_key = "zokrates/artifacts/proving.key"
    "#;

    #[test]
    fn test_from_toml_str_applies_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();

        assert_eq!(
            config.source.bridge_address,
            address!("311Ab7A24412cfc9e110A8ac17dFFbFf60EccDCE")
        );
        assert_eq!(config.source.confirmations, 2);
        assert_eq!(config.source.start_block, None);
        assert_eq!(config.destination.private_key_env, "DESTINATION_PRIVATE_KEY");
        assert_eq!(config.destination.transient_revert_reasons, vec!["nonce race"]);
        assert_eq!(config.prover.binary, PathBuf::from("zokrates"));
        assert_eq!(config.prover.concurrency, 1);
        assert_eq!(config.relay.max_in_flight, 4);
        assert_eq!(config.relay.state_dir, None);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_from_toml_str_overrides() {
        let toml = format!(
            "{MINIMAL}\n{}",
            r#"
            [relay]
            max_in_flight = 16
            state_dir = "/var/lib/zkbridge"
            status_port = 3005

            [retry]
            prover_max_attempts = 3
            fee_bump_percent = 25
            "#
        );
        let config = Config::from_toml_str(&toml).unwrap();

        assert_eq!(config.relay.max_in_flight, 16);
        assert_eq!(config.relay.state_dir, Some(PathBuf::from("/var/lib/zkbridge")));
        assert_eq!(config.relay.status_port, Some(3005));
        assert_eq!(config.retry.prover_max_attempts, 3);
        assert_eq!(config.retry.fee_bump_percent, 25);
        assert_eq!(config.retry.submission_max_attempts, 5);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let toml = MINIMAL.replace(
            "proving_key = \"zokrates/artifacts/proving.key\"",
            "proving_key = \"zokrates/artifacts/proving.key\"\nconcurrency = 0",
        );
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            ..RetryConfig::default()
        };

        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(4), Duration::from_millis(800));
        assert_eq!(retry.backoff(5), Duration::from_millis(1000));
        assert_eq!(retry.backoff(200), Duration::from_millis(1000));
    }
}
