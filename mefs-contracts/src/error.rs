use alloy::primitives::Address;
use alloy::primitives::TxHash;
use alloy::primitives::U256;
use mefs_auth::SignatureError;
use thiserror::Error;

use crate::chain::ChainError;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Mined, but the receipt status is failure. Triggers a fresh submission cycle.
    #[error("transaction {0} was mined but failed")]
    TxFail(TxHash),

    /// The nonce was consumed, yet none of the transactions sent for it has a
    /// receipt. Never resubmitted, the payment may already have landed.
    #[error("nonce {nonce} was consumed but none of our transactions has a receipt")]
    Unconfirmed { nonce: u64 },

    #[error("{operation} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last: String,
    },

    #[error("operation cancelled: deadline elapsed")]
    Cancelled,

    #[error("no resolver published under key `{0}`")]
    NotDeployedResolver(String),

    #[error("no mapper for owner {owner} under key `{key}`")]
    NotDeployedMapper { key: String, owner: Address },

    #[error("no upkeeping order for user {user} and query {query}")]
    NotDeployedUk { user: Address, query: Address },

    #[error("no open payment channel from {payer} to {payee}")]
    NotDeployedChannel { payer: Address, payee: Address },

    #[error("no root contract for owner {0}")]
    NotDeployedRoot(Address),

    #[error("no `{0}` contract registered in the indexer")]
    NotDeployedRole(String),

    #[error("the zero address is published under `{0}`")]
    ZeroAddress(String),

    #[error("deployment {0} produced no contract address")]
    NoContractAddress(TxHash),

    #[error("{caller} is not the admin {admin}")]
    Unauthorized { caller: Address, admin: Address },

    #[error("{0} is banned")]
    Banned(Address),

    #[error("deposit {deposit} is below the required {required}")]
    InsufficientDeposit { deposit: U256, required: U256 },

    #[error("{0} has not advertised a unit price")]
    PriceNotSet(Address),

    #[error("invalid pledge: {0}")]
    InvalidPledge(String),

    #[error("merkle root not found for key {0:?}")]
    MerkleRootNotFound(Option<i64>),

    #[error("root for key {0} is already set to a different value")]
    RootExists(i64),

    #[error("refusing to publish the all-zero root for key {0}")]
    ZeroRoot(i64),

    #[error("channel {0} is closed")]
    ChannelClosed(Address),

    #[error("channel {channel} expires at {expiry}, now {now}")]
    ChannelNotExpired {
        channel: Address,
        expiry: u64,
        now: u64,
    },

    #[error("{caller} is not the payee {payee} of channel {channel}")]
    NotPayee {
        channel: Address,
        caller: Address,
        payee: Address,
    },

    #[error("voucher value {value} exceeds channel balance {balance}")]
    VoucherExceedsBalance { value: U256, balance: U256 },

    #[error("order {0} has been destructed")]
    OrderClosed(Address),

    #[error("order {order} runs until {end}, now {now}")]
    OrderNotExpired { order: Address, end: u64, now: u64 },

    #[error("provider {provider} is already paid up to {paid_until}, period starting at {start} is settled")]
    AlreadySettled {
        provider: Address,
        start: u64,
        paid_until: u64,
    },

    #[error("period starting at {start} leaves a gap after {paid_until} for provider {provider}")]
    PeriodGap {
        provider: Address,
        start: u64,
        paid_until: u64,
    },

    #[error("paying {value} would bring the total to {total}, above the committed {committed}")]
    ExceedsCommitted {
        value: U256,
        total: U256,
        committed: U256,
    },

    #[error("{0} is not an active provider of the order")]
    UnknownProvider(Address),

    #[error("{0} is not an active keeper of the order")]
    UnknownKeeper(Address),

    #[error("invalid order parameters: {0}")]
    InvalidOrder(String),

    #[error("proposed {field} {proposed} does not match the computed {computed}")]
    ProposalMismatch {
        field: &'static str,
        proposed: String,
        computed: String,
    },

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("decoding `{method}` return data: {reason}")]
    Decode {
        method: &'static str,
        reason: String,
    },

    #[error("storage proof `{id}` unavailable: {reason}")]
    ProofUnavailable { id: String, reason: String },

    #[error("contract artifacts: {0}")]
    Artifacts(String),
}

impl ContractError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ContractError::Chain(err) => err.is_transient(),
            _ => false,
        }
    }

    /// The directory or a lookup found nothing provisioned yet.
    pub fn is_not_deployed(&self) -> bool {
        matches!(
            self,
            ContractError::NotDeployedResolver(_)
                | ContractError::NotDeployedMapper { .. }
                | ContractError::NotDeployedUk { .. }
                | ContractError::NotDeployedChannel { .. }
                | ContractError::NotDeployedRoot(_)
                | ContractError::NotDeployedRole(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ContractError::Chain(ChainError::Transport("timeout".into())).is_transient());
        assert!(!ContractError::Chain(ChainError::InsufficientFunds).is_transient());
        assert!(!ContractError::Cancelled.is_transient());
    }

    #[test]
    fn test_not_deployed_classification() {
        assert!(ContractError::NotDeployedResolver("keeper".into()).is_not_deployed());
        assert!(ContractError::NotDeployedMapper {
            key: "query".into(),
            owner: Address::ZERO,
        }
        .is_not_deployed());
        assert!(!ContractError::TxFail(TxHash::ZERO).is_not_deployed());
    }
}
