use alloy::primitives::Address;
use alloy::primitives::U256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signing failed: {0}")]
    Signing(#[from] alloy::signers::Error),

    #[error("malformed signature: {0}")]
    Malformed(#[from] alloy::primitives::SignatureError),

    #[error("signed by {recovered}, expected {expected}")]
    WrongSigner {
        recovered: Address,
        expected: Address,
    },

    #[error("voucher for channel {got} presented for channel {expected}")]
    WrongChannel { got: Address, expected: Address },

    #[error("voucher value {value} does not exceed {current} already issued for channel {channel}")]
    NotIncreasing {
        channel: Address,
        value: U256,
        current: U256,
    },

    #[error("voucher value {value} exceeds channel deposit {deposit}")]
    ExceedsDeposit { value: U256, deposit: U256 },

    #[error("{0} is not an active keeper of this order")]
    NotKeeper(Address),

    #[error("keeper {0} already signed")]
    Duplicate(Address),

    #[error("{have} keeper signatures collected, {need} required")]
    BelowQuorum { have: usize, need: usize },

    #[error("decoding voucher: {0}")]
    Encoding(String),
}
