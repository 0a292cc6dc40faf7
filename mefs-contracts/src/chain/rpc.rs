use alloy::eips::BlockNumberOrTag;
use alloy::network::TransactionBuilder;
use alloy::primitives::Address;
use alloy::primitives::Bytes;
use alloy::primitives::TxHash;
use alloy::primitives::U256;
use alloy::providers::Provider;
use alloy::providers::RootProvider;
use alloy::rpc::types::BlockTransactionsKind;
use alloy::rpc::types::TransactionRequest;
use alloy::transports::RpcError;
use alloy::transports::TransportErrorKind;
use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::ChainClient;
use super::ChainError;
use super::SignedTx;
use super::TxReceipt;

/// [`ChainClient`] over JSON-RPC.
#[derive(Clone, Debug)]
pub struct RpcChainClient<P = RootProvider> {
    provider: P,
}

impl RpcChainClient<RootProvider> {
    /// Connect to an HTTP endpoint.
    pub fn connect(rpc_url: &str) -> Result<Self, ChainError> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| ChainError::Transport(format!("invalid rpc url `{rpc_url}`: {e}")))?;
        debug!("connecting to {}", url);
        Ok(Self {
            provider: RootProvider::new_http(url),
        })
    }
}

impl<P> RpcChainClient<P> {
    pub fn with_provider(provider: P) -> Self {
        Self { provider }
    }
}

fn map_rpc_error(err: RpcError<TransportErrorKind>) -> ChainError {
    match err.as_error_resp() {
        Some(payload) => ChainError::classify(payload.code, payload.message.as_ref()),
        None => ChainError::Transport(err.to_string()),
    }
}

#[async_trait]
impl<P> ChainClient for RpcChainClient<P>
where
    P: Provider + Send + Sync,
{
    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.provider.get_chain_id().await.map_err(map_rpc_error)
    }

    async fn pending_nonce(
        &self,
        account: Address,
    ) -> Result<u64, ChainError> {
        self.provider
            .get_transaction_count(account)
            .pending()
            .await
            .map_err(map_rpc_error)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.provider.get_gas_price().await.map_err(map_rpc_error)
    }

    async fn send_raw_transaction(
        &self,
        tx: &SignedTx,
    ) -> Result<TxHash, ChainError> {
        let pending = self
            .provider
            .send_raw_transaction(&tx.raw)
            .await
            .map_err(map_rpc_error)?;
        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TxReceipt>, ChainError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(map_rpc_error)?;

        Ok(receipt.map(|receipt| {
            TxReceipt {
                hash,
                success: receipt.status(),
                block_number: receipt.block_number.unwrap_or_default(),
                contract_address: receipt.contract_address,
                gas_used: u64::try_from(receipt.gas_used).unwrap_or(u64::MAX),
            }
        }))
    }

    async fn call(
        &self,
        from: Option<Address>,
        to: Address,
        input: Bytes,
    ) -> Result<Bytes, ChainError> {
        let mut request = TransactionRequest::default()
            .with_to(to)
            .with_input(input);
        if let Some(from) = from {
            request = request.with_from(from);
        }
        self.provider.call(&request).await.map_err(map_rpc_error)
    }

    async fn balance(
        &self,
        account: Address,
    ) -> Result<U256, ChainError> {
        self.provider
            .get_balance(account)
            .await
            .map_err(map_rpc_error)
    }

    async fn code_at(
        &self,
        account: Address,
    ) -> Result<Bytes, ChainError> {
        self.provider
            .get_code_at(account)
            .await
            .map_err(map_rpc_error)
    }

    async fn latest_timestamp(&self) -> Result<u64, ChainError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest, BlockTransactionsKind::Hashes)
            .await
            .map_err(map_rpc_error)?
            .ok_or_else(|| ChainError::Transport("latest block not available".to_string()))?;
        Ok(block.header.timestamp)
    }
}
