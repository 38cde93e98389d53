//! Contract bindings and the JSON-RPC client for the source chain.

use alloy_primitives::Address;
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::{Filter, Log};
use alloy_sol_types::{SolEvent, sol};
use async_trait::async_trait;
use url::Url;

use crate::watcher::{SourceChain, WatchError};

sol! {
    /// Emitted by the source bridge for every lock action.
    #[derive(Debug, PartialEq, Eq)]
    event Locked(uint256 encryptedData, uint256 blockNumber, uint256 timestamp, bytes32 nonceHash);

    #[derive(Debug, PartialEq, Eq)]
    struct G1Point {
        uint256 X;
        uint256 Y;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct G2Point {
        uint256[2] X;
        uint256[2] Y;
    }

    /// Groth16 proof in the layout the generated verifier expects.
    #[derive(Debug, PartialEq, Eq)]
    struct Proof {
        G1Point a;
        G2Point b;
        G1Point c;
    }

    /// Verifies the proof and mints on the destination bridge.
    function mintTokens(uint256 encryptedData, uint256[] inputs, Proof proof, bytes32 zkProofHash);
}

/// Source chain client reading `Locked` logs of the bridge contract.
#[derive(Debug, Clone)]
pub struct SourceRpcClient {
    provider: DynProvider,
    bridge_address: Address,
}

impl SourceRpcClient {
    /// Create a new source client over HTTP.
    pub fn new(rpc_url: Url, bridge_address: Address) -> Self {
        let provider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .connect_http(rpc_url)
            .erased();
        Self {
            provider,
            bridge_address,
        }
    }
}

#[async_trait]
impl SourceChain for SourceRpcClient {
    async fn head_number(&self) -> Result<u64, WatchError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| WatchError::Rpc(format!("eth_blockNumber failed: {e}")))
    }

    async fn locked_logs(&self, from: u64, to: u64) -> Result<Vec<Log>, WatchError> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .event_signature(Locked::SIGNATURE_HASH)
            .from_block(from)
            .to_block(to);

        self.provider
            .get_logs(&filter)
            .await
            .map_err(|e| WatchError::Rpc(format!("eth_getLogs [{from}, {to}] failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{B256, U256, keccak256};
    use alloy_sol_types::{SolCall, SolEvent};

    use super::{Locked, mintTokensCall};

    #[test]
    fn test_locked_signature() {
        assert_eq!(
            Locked::SIGNATURE_HASH,
            keccak256("Locked(uint256,uint256,uint256,bytes32)")
        );
    }

    #[test]
    fn test_mint_selector() {
        let selector = keccak256(
            "mintTokens(uint256,uint256[],((uint256,uint256),(uint256[2],uint256[2]),(uint256,uint256)),bytes32)",
        );
        assert_eq!(mintTokensCall::SELECTOR, selector[..4]);
    }

    #[test]
    fn test_locked_log_data_roundtrip() {
        let event = Locked {
            encryptedData: U256::from(0xd4f45b59u64),
            blockNumber: U256::from(5000u64),
            timestamp: U256::from(1_700_000_000u64),
            nonceHash: B256::repeat_byte(0x47),
        };
        let decoded = Locked::decode_log_data(&event.encode_log_data()).unwrap();
        assert_eq!(decoded, event);
    }
}
