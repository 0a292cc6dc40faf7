//! The ledger boundary.
//!
//! Everything the orchestration layer needs from an Ethereum-compatible node
//! goes through [`ChainClient`]. RPC error strings are turned into
//! [`ChainError`] variants here and nowhere else.

use alloy::primitives::Address;
use alloy::primitives::Bytes;
use alloy::primitives::TxHash;
use alloy::primitives::U256;
use async_trait::async_trait;
use thiserror::Error;

pub mod rpc;
#[cfg(any(test, feature = "testing"))]
pub mod simulated;

pub use rpc::RpcChainClient;
#[cfg(any(test, feature = "testing"))]
pub use simulated::SimulatedChain;

/// An unsigned legacy transaction with every field filled in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    /// `None` deploys a contract.
    pub to: Option<Address>,
    pub input: Bytes,
    pub value: U256,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
}

/// A transaction signed locally, so its hash is known before it is sent.
#[derive(Clone, Debug)]
pub struct SignedTx {
    pub hash: TxHash,
    /// EIP-2718 encoding, as handed to `eth_sendRawTransaction`.
    pub raw: Bytes,
    pub request: TxRequest,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxReceipt {
    pub hash: TxHash,
    pub success: bool,
    pub block_number: u64,
    pub contract_address: Option<Address>,
    pub gas_used: u64,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("nonce too low")]
    NonceTooLow,

    #[error("replacement transaction underpriced")]
    Underpriced,

    #[error("transaction already known")]
    AlreadyKnown,

    #[error("insufficient funds for gas * price + value")]
    InsufficientFunds,

    #[error("execution reverted: {0}")]
    Execution(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("transport: {0}")]
    Transport(String),

    #[error("signing transaction: {0}")]
    Signing(String),
}

impl ChainError {
    /// Map a JSON-RPC error payload onto a variant.
    ///
    /// Node implementations disagree on codes, so the message is what gets
    /// matched; this is the only place it is.
    pub fn classify(
        code: i64,
        message: &str,
    ) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("nonce too low") || lower.contains("nonce is too low") {
            ChainError::NonceTooLow
        } else if lower.contains("replacement transaction underpriced")
            || lower.contains("transaction underpriced")
        {
            ChainError::Underpriced
        } else if lower.contains("already known") || lower.contains("known transaction") {
            ChainError::AlreadyKnown
        } else if lower.contains("insufficient funds") {
            ChainError::InsufficientFunds
        } else if lower.contains("execution reverted") || code == 3 {
            ChainError::Execution(message.to_string())
        } else {
            ChainError::Rpc {
                code,
                message: message.to_string(),
            }
        }
    }

    /// Errors worth retrying verbatim: the node was unreachable or lagging.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transport(_) | ChainError::Rpc { .. })
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ChainError>;

    /// Next nonce for `account`, counting pending transactions.
    async fn pending_nonce(
        &self,
        account: Address,
    ) -> Result<u64, ChainError>;

    /// The node's suggested gas price, in wei.
    async fn gas_price(&self) -> Result<u128, ChainError>;

    async fn send_raw_transaction(
        &self,
        tx: &SignedTx,
    ) -> Result<TxHash, ChainError>;

    /// `Ok(None)` while the transaction is not mined.
    async fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TxReceipt>, ChainError>;

    /// `eth_call` against the latest block.
    async fn call(
        &self,
        from: Option<Address>,
        to: Address,
        input: Bytes,
    ) -> Result<Bytes, ChainError>;

    async fn balance(
        &self,
        account: Address,
    ) -> Result<U256, ChainError>;

    /// Empty once a contract self-destructed, or if none was ever deployed.
    async fn code_at(
        &self,
        account: Address,
    ) -> Result<Bytes, ChainError>;

    /// Timestamp of the latest block, in seconds.
    async fn latest_timestamp(&self) -> Result<u64, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            ChainError::classify(-32000, "nonce too low: next nonce 5, tx nonce 4"),
            ChainError::NonceTooLow
        );
        assert_eq!(
            ChainError::classify(-32000, "replacement transaction underpriced"),
            ChainError::Underpriced
        );
        assert_eq!(
            ChainError::classify(-32000, "already known"),
            ChainError::AlreadyKnown
        );
        assert_eq!(
            ChainError::classify(-32000, "insufficient funds for gas * price + value"),
            ChainError::InsufficientFunds
        );
        assert!(matches!(
            ChainError::classify(3, "execution reverted: not owner"),
            ChainError::Execution(_)
        ));
        assert!(matches!(
            ChainError::classify(-32603, "header not found"),
            ChainError::Rpc { code: -32603, .. }
        ));
    }

    #[test]
    fn test_transient() {
        assert!(ChainError::Transport("connection reset".into()).is_transient());
        assert!(!ChainError::NonceTooLow.is_transient());
        assert!(!ChainError::Execution("revert".into()).is_transient());
    }
}
