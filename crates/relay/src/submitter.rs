//! Destination submitter.
//!
//! Encodes `mintTokens` calls, sends them from the relay's signer and follows them until
//! they are buried under the configured number of confirmations.

use std::time::{Duration, Instant};

use alloy_network::{EthereumWallet, ReceiptResponse as _, TransactionBuilder};
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::{BlockId, TransactionRequest};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{SolCall, decode_revert_reason};
use alloy_transport::TransportError;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zkbridge_types::{Commitment, FailureKind, ProofArtifact};

use crate::{
    config::DestinationConfig,
    error::{Error, Result},
    rpc::{G1Point, G2Point, Proof, mintTokensCall},
};

/// Errors from a mint submission.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The node refused the transaction before inclusion.
    #[error("submission rejected: {0}")]
    Rejected(String),

    /// No receipt arrived within the wait window.
    #[error("no receipt for {tx_hash} within the wait window")]
    TimedOut {
        /// The transaction waited for.
        tx_hash: B256,
    },

    /// The call reverted, either when included or already during gas estimation.
    #[error("mint reverted: {reason}")]
    Reverted {
        /// The reverted transaction, if it was included.
        tx_hash: Option<B256>,
        /// Decoded revert reason.
        reason: String,
    },

    /// The proof artifact cannot be encoded into calldata.
    #[error("malformed proof artifact: {0}")]
    MalformedProof(String),
}

impl SubmitError {
    /// Failure classification recorded on the job.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Rejected(_) => FailureKind::SubmissionRejected,
            Self::TimedOut { .. } => FailureKind::TimedOut,
            Self::Reverted { .. } => FailureKind::Reverted,
            Self::MalformedProof(_) => FailureKind::ProofGenerationError,
        }
    }
}

/// Everything a mint needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintRequest {
    /// Source transaction being relayed.
    pub job_id: B256,
    /// Value forwarded from the `Locked` event.
    pub encrypted_data: U256,
    /// Commitment the proof attests to.
    pub commitment: Commitment,
    /// The proof.
    pub proof: ProofArtifact,
    /// Number of earlier failed submission attempts, drives the fee bump.
    pub attempt: u32,
    /// Nonce of an earlier transaction to replace.
    pub replace_nonce: Option<u64>,
}

/// A sent mint transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMint {
    /// Transaction hash.
    pub tx_hash: B256,
    /// Sender nonce used.
    pub nonce: u64,
    /// Encoded `mintTokens` call, replayed to recover a revert reason.
    pub calldata: Bytes,
}

/// Submits mints on the destination chain.
#[async_trait]
pub trait MintSubmitter: Send + Sync {
    /// Sign and send the mint transaction.
    async fn send_mint(&self, request: &MintRequest) -> std::result::Result<PendingMint, SubmitError>;

    /// Wait until the transaction is included and confirmed; returns its hash.
    async fn await_inclusion(&self, pending: &PendingMint) -> std::result::Result<B256, SubmitError>;

    /// Look up the transaction once.
    ///
    /// Returns `None` while it is not included and [`SubmitError::Reverted`] if it
    /// failed.
    async fn check_inclusion(
        &self,
        pending: &PendingMint,
    ) -> std::result::Result<Option<B256>, SubmitError>;
}

/// Send a mint and wait for its confirmation.
pub async fn submit_mint(
    submitter: &dyn MintSubmitter,
    request: &MintRequest,
) -> std::result::Result<B256, SubmitError> {
    let pending = submitter.send_mint(request).await?;
    submitter.await_inclusion(&pending).await
}

/// ABI-encode the `mintTokens` call of a request.
pub fn encode_mint_call(request: &MintRequest) -> std::result::Result<Bytes, SubmitError> {
    let groth16 = &request.proof.proof;
    let call = mintTokensCall {
        encryptedData: request.encrypted_data,
        inputs: request
            .proof
            .public_inputs
            .iter()
            .map(|input| field_element(input))
            .collect::<std::result::Result<_, _>>()?,
        proof: Proof {
            a: G1Point {
                X: field_element(&groth16.a[0])?,
                Y: field_element(&groth16.a[1])?,
            },
            b: G2Point {
                X: [
                    field_element(&groth16.b[0][0])?,
                    field_element(&groth16.b[0][1])?,
                ],
                Y: [
                    field_element(&groth16.b[1][0])?,
                    field_element(&groth16.b[1][1])?,
                ],
            },
            c: G1Point {
                X: field_element(&groth16.c[0])?,
                Y: field_element(&groth16.c[1])?,
            },
        },
        zkProofHash: request.proof.proof_hash,
    };
    Ok(call.abi_encode().into())
}

fn field_element(value: &str) -> std::result::Result<U256, SubmitError> {
    value
        .parse::<U256>()
        .map_err(|e| SubmitError::MalformedProof(format!("{value}: {e}")))
}

/// Scale a fee by `100 + bump_percent * attempt` percent.
pub fn bumped_fee(fee: u128, bump_percent: u64, attempt: u32) -> u128 {
    let percent = 100u128 + u128::from(bump_percent) * u128::from(attempt);
    fee.saturating_mul(percent) / 100
}

/// Hands out sender nonces, one at a time.
///
/// The next nonce is cached after the first lookup and dropped whenever a send fails,
/// so the following allocation re-reads the pending count from the node.
#[derive(Debug, Default)]
pub struct NonceAllocator {
    next: Mutex<Option<u64>>,
}

/// [`MintSubmitter`] signing with a local key over JSON-RPC.
pub struct EvmMintSubmitter {
    provider: DynProvider,
    signer_address: Address,
    bridge_address: Address,
    chain_id: u64,
    config: DestinationConfig,
    fee_bump_percent: u64,
    nonces: NonceAllocator,
}

impl EvmMintSubmitter {
    /// Build the submitter, reading the signer key from `private_key_env`.
    pub async fn connect(config: DestinationConfig, fee_bump_percent: u64) -> Result<Self> {
        let key = std::env::var(&config.private_key_env)
            .map_err(|_| Error::Signer(format!("{} is not set", config.private_key_env)))?;
        let signer: PrivateKeySigner = key.trim().parse().map_err(|e| {
            Error::Signer(format!("invalid key in {}: {e}", config.private_key_env))
        })?;
        let signer_address = signer.address();

        let provider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .wallet(EthereumWallet::from(signer))
            .connect_http(config.rpc_url.clone())
            .erased();

        let chain_id = provider
            .get_chain_id()
            .await
            .map_err(|e| Error::Rpc(format!("eth_chainId failed: {e}")))?;

        info!(
            signer = %signer_address,
            bridge = %config.bridge_address,
            chain_id,
            "Destination submitter ready"
        );

        Ok(Self {
            provider,
            signer_address,
            bridge_address: config.bridge_address,
            chain_id,
            config,
            fee_bump_percent,
            nonces: NonceAllocator::default(),
        })
    }

    fn base_request(&self, calldata: Bytes) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(self.signer_address)
            .with_to(self.bridge_address)
            .with_input(calldata)
    }

    async fn pending_nonce(&self) -> std::result::Result<u64, SubmitError> {
        self.provider
            .get_transaction_count(self.signer_address)
            .pending()
            .await
            .map_err(|e| SubmitError::Rejected(format!("failed to read nonce: {e}")))
    }

    async fn prepare(
        &self,
        request: &MintRequest,
        calldata: Bytes,
        nonce: u64,
    ) -> std::result::Result<TransactionRequest, SubmitError> {
        let fees = self
            .provider
            .estimate_eip1559_fees()
            .await
            .map_err(|e| SubmitError::Rejected(format!("fee estimation failed: {e}")))?;

        let mut tx = self
            .base_request(calldata)
            .with_chain_id(self.chain_id)
            .with_nonce(nonce)
            .with_max_fee_per_gas(bumped_fee(
                fees.max_fee_per_gas,
                self.fee_bump_percent,
                request.attempt,
            ))
            .with_max_priority_fee_per_gas(bumped_fee(
                fees.max_priority_fee_per_gas,
                self.fee_bump_percent,
                request.attempt,
            ));

        let gas_limit = match self.config.gas_limit {
            Some(limit) => limit,
            None => self.provider.estimate_gas(tx.clone()).await.map_err(|e| {
                match revert_reason(&e) {
                    Some(reason) => SubmitError::Reverted {
                        tx_hash: None,
                        reason,
                    },
                    None => SubmitError::Rejected(format!("gas estimation failed: {e}")),
                }
            })?,
        };
        tx.set_gas_limit(gas_limit);
        Ok(tx)
    }

    async fn revert_reason_at(&self, pending: &PendingMint, block: u64) -> String {
        let replay = self.base_request(pending.calldata.clone());
        match self.provider.call(replay).block(BlockId::number(block)).await {
            Ok(_) => "execution reverted".to_string(),
            Err(e) => revert_reason(&e).unwrap_or_else(|| e.to_string()),
        }
    }
}

#[async_trait]
impl MintSubmitter for EvmMintSubmitter {
    async fn send_mint(&self, request: &MintRequest) -> std::result::Result<PendingMint, SubmitError> {
        let calldata = encode_mint_call(request)?;

        let mut next = self.nonces.next.lock().await;
        let nonce = match (request.replace_nonce, *next) {
            (Some(nonce), _) => nonce,
            (None, Some(nonce)) => nonce,
            (None, None) => self.pending_nonce().await?,
        };

        let sent = match self.prepare(request, calldata.clone(), nonce).await {
            Ok(tx) => self
                .provider
                .send_transaction(tx)
                .await
                .map_err(|e| SubmitError::Rejected(e.to_string())),
            Err(e) => Err(e),
        };

        match sent {
            Ok(pending) => {
                if request.replace_nonce.is_none() {
                    *next = Some(nonce + 1);
                }
                let tx_hash = *pending.tx_hash();
                debug!(source_tx = %request.job_id, %tx_hash, nonce, "Mint transaction sent");
                Ok(PendingMint {
                    tx_hash,
                    nonce,
                    calldata,
                })
            }
            Err(e) => {
                *next = None;
                Err(e)
            }
        }
    }

    async fn await_inclusion(&self, pending: &PendingMint) -> std::result::Result<B256, SubmitError> {
        let timeout = Duration::from_secs(self.config.receipt_timeout_secs);
        let poll_interval = Duration::from_millis(self.config.receipt_poll_interval_ms);
        let deadline = Instant::now() + timeout;

        loop {
            match self.provider.get_transaction_receipt(pending.tx_hash).await {
                Ok(Some(receipt)) => {
                    let block = receipt.block_number.unwrap_or_default();
                    if !receipt.status() {
                        return Err(SubmitError::Reverted {
                            tx_hash: Some(pending.tx_hash),
                            reason: self.revert_reason_at(pending, block).await,
                        });
                    }

                    match self.provider.get_block_number().await {
                        Ok(head) if head + 1 >= block + self.config.confirmations => {
                            return Ok(pending.tx_hash);
                        }
                        Ok(head) => {
                            debug!(tx_hash = %pending.tx_hash, block, head, "Waiting for mint confirmations");
                        }
                        Err(e) => warn!(error = %e, "Failed to read destination head"),
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(tx_hash = %pending.tx_hash, error = %e, "Failed to fetch receipt"),
            }

            if Instant::now() >= deadline {
                return Err(SubmitError::TimedOut {
                    tx_hash: pending.tx_hash,
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn check_inclusion(
        &self,
        pending: &PendingMint,
    ) -> std::result::Result<Option<B256>, SubmitError> {
        let receipt = self
            .provider
            .get_transaction_receipt(pending.tx_hash)
            .await
            .map_err(|e| SubmitError::Rejected(format!("failed to fetch receipt: {e}")))?;

        match receipt {
            None => Ok(None),
            Some(receipt) if receipt.status() => Ok(Some(pending.tx_hash)),
            Some(receipt) => Err(SubmitError::Reverted {
                tx_hash: Some(pending.tx_hash),
                reason: self
                    .revert_reason_at(pending, receipt.block_number.unwrap_or_default())
                    .await,
            }),
        }
    }
}

/// Revert reason carried by a JSON-RPC error, if the error is a revert.
fn revert_reason(error: &TransportError) -> Option<String> {
    let payload = error.as_error_resp()?;
    let is_revert = payload.code == 3 || payload.message.to_lowercase().contains("revert");
    if !is_revert {
        return None;
    }

    Some(
        payload
            .as_revert_data()
            .and_then(|data| decode_revert_reason(&data))
            .unwrap_or_else(|| payload.message.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use alloy_network::EthereumWallet;
    use alloy_primitives::{Address, B256, U64, U256};
    use alloy_provider::{Provider, ProviderBuilder};
    use alloy_rpc_types_eth::FeeHistory;
    use alloy_signer_local::PrivateKeySigner;
    use alloy_sol_types::SolCall;
    use alloy_transport::mock::Asserter;
    use zkbridge_types::{Commitment, Groth16Proof, ProofArtifact};

    use super::{
        EvmMintSubmitter, MintRequest, MintSubmitter, NonceAllocator, SubmitError, bumped_fee,
        encode_mint_call,
    };
    use crate::{config::DestinationConfig, rpc::mintTokensCall};

    const SIGNER_KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    fn mocked_submitter(asserter: &Asserter) -> EvmMintSubmitter {
        let signer: PrivateKeySigner = SIGNER_KEY.parse().unwrap();
        let signer_address = signer.address();
        let provider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .wallet(EthereumWallet::from(signer))
            .connect_mocked_client(asserter.clone())
            .erased();
        let bridge_address = Address::repeat_byte(0xbb);

        EvmMintSubmitter {
            provider,
            signer_address,
            bridge_address,
            chain_id: 31337,
            config: DestinationConfig {
                rpc_url: "http://localhost:8545".parse().unwrap(),
                bridge_address,
                private_key_env: "RELAYER_PRIVATE_KEY".to_string(),
                confirmations: 1,
                receipt_timeout_secs: 1,
                receipt_poll_interval_ms: 10,
                gas_limit: Some(500_000),
                transient_revert_reasons: Vec::new(),
            },
            fee_bump_percent: 12,
            nonces: NonceAllocator::default(),
        }
    }

    fn push_fee_history(asserter: &Asserter) {
        asserter.push_success(&FeeHistory {
            base_fee_per_gas: vec![1_000_000_000, 1_000_000_000],
            gas_used_ratio: vec![0.5],
            oldest_block: 1,
            reward: Some(vec![vec![1_000_000_000]]),
            ..Default::default()
        });
    }

    fn request(inputs: Vec<String>) -> MintRequest {
        MintRequest {
            job_id: B256::ZERO,
            encrypted_data: U256::from(0x690184dd639cd4f45b59u128),
            commitment: Commitment::from_root(B256::ZERO),
            proof: ProofArtifact {
                proof: Groth16Proof {
                    a: ["0x01".into(), "0x02".into()],
                    b: [["0x03".into(), "0x04".into()], ["0x05".into(), "0x06".into()]],
                    c: ["0x07".into(), "0x08".into()],
                },
                public_inputs: inputs,
                proof_hash: B256::repeat_byte(0x33),
            },
            attempt: 0,
            replace_nonce: None,
        }
    }

    #[test]
    fn test_encode_mint_call() {
        let calldata = encode_mint_call(&request(vec!["0x09".into(), "10".into()])).unwrap();
        let call = mintTokensCall::abi_decode(&calldata).unwrap();

        assert_eq!(call.encryptedData, U256::from(0x690184dd639cd4f45b59u128));
        assert_eq!(call.inputs, vec![U256::from(9u64), U256::from(10u64)]);
        assert_eq!(call.proof.b.X, [U256::from(3u64), U256::from(4u64)]);
        assert_eq!(call.proof.b.Y, [U256::from(5u64), U256::from(6u64)]);
        assert_eq!(call.proof.c.Y, U256::from(8u64));
        assert_eq!(call.zkProofHash, B256::repeat_byte(0x33));
    }

    #[test]
    fn test_encode_rejects_bad_field_element() {
        assert!(matches!(
            encode_mint_call(&request(vec!["0xnope".into()])),
            Err(SubmitError::MalformedProof(_))
        ));
    }

    #[test]
    fn test_bumped_fee() {
        assert_eq!(bumped_fee(1000, 12, 0), 1000);
        assert_eq!(bumped_fee(1000, 12, 1), 1120);
        assert_eq!(bumped_fee(1000, 12, 3), 1360);
    }

    #[tokio::test]
    async fn test_concurrent_sends_get_consecutive_nonces() {
        let asserter = Asserter::new();
        let submitter = mocked_submitter(&asserter);

        asserter.push_success(&U64::from(7));
        push_fee_history(&asserter);
        asserter.push_success(&B256::repeat_byte(0xa1));
        push_fee_history(&asserter);
        asserter.push_success(&B256::repeat_byte(0xa2));

        let first = request(vec!["0x09".into()]);
        let second = MintRequest {
            job_id: B256::repeat_byte(0x01),
            ..request(vec!["0x09".into()])
        };
        let (first, second) = tokio::join!(submitter.send_mint(&first), submitter.send_mint(&second));

        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.nonce, 7);
        assert_eq!(first.tx_hash, B256::repeat_byte(0xa1));
        assert_eq!(second.nonce, 8);
        assert_eq!(second.tx_hash, B256::repeat_byte(0xa2));
        // The pending count was read from the node only once.
        assert!(asserter.read_q().is_empty());
        assert_eq!(*submitter.nonces.next.lock().await, Some(9));
    }

    #[tokio::test]
    async fn test_failed_send_drops_cached_nonce() {
        let asserter = Asserter::new();
        let submitter = mocked_submitter(&asserter);
        *submitter.nonces.next.lock().await = Some(7);

        push_fee_history(&asserter);
        asserter.push_failure_msg("nonce too low");
        let error = submitter
            .send_mint(&request(vec!["0x09".into()]))
            .await
            .unwrap_err();
        assert!(matches!(error, SubmitError::Rejected(_)));
        assert_eq!(*submitter.nonces.next.lock().await, None);

        asserter.push_success(&U64::from(9));
        push_fee_history(&asserter);
        asserter.push_success(&B256::repeat_byte(0xa3));
        let pending = submitter
            .send_mint(&request(vec!["0x09".into()]))
            .await
            .unwrap();

        assert_eq!(pending.nonce, 9);
        assert_eq!(*submitter.nonces.next.lock().await, Some(10));
    }

    #[tokio::test]
    async fn test_replacement_keeps_cached_nonce() {
        let asserter = Asserter::new();
        let submitter = mocked_submitter(&asserter);
        *submitter.nonces.next.lock().await = Some(8);

        push_fee_history(&asserter);
        asserter.push_success(&B256::repeat_byte(0xa4));
        let replacement = MintRequest {
            attempt: 1,
            replace_nonce: Some(5),
            ..request(vec!["0x09".into()])
        };
        let pending = submitter.send_mint(&replacement).await.unwrap();

        assert_eq!(pending.nonce, 5);
        assert_eq!(*submitter.nonces.next.lock().await, Some(8));
    }
}
