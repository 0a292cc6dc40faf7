//! Payment channel vouchers.
//!
//! A voucher authorises the payee to withdraw a cumulative `value` from a
//! channel. The payer signs `keccak256(channel ‖ leftPad32(value))`, the same
//! bytes the channel contract hashes before `ecrecover`.

use std::collections::HashMap;

use alloy::primitives::keccak256;
use alloy::primitives::Address;
use alloy::primitives::Bytes;
use alloy::primitives::B256;
use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use serde::Serialize;

use crate::recover_signer;
use crate::sign_digest;
use crate::SignatureError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentVoucher {
    pub channel: Address,
    /// Cumulative amount transferred so far, not a delta.
    pub value: U256,
    pub signature: Bytes,
}

/// The digest the payer signs for `(channel, value)`.
pub fn voucher_digest(
    channel: Address,
    value: U256,
) -> B256 {
    let mut preimage = Vec::with_capacity(20 + 32);
    preimage.extend_from_slice(channel.as_slice());
    preimage.extend_from_slice(&value.to_be_bytes::<32>());
    keccak256(preimage)
}

impl PaymentVoucher {
    /// Sign a new voucher with the payer key.
    pub fn sign(
        payer: &PrivateKeySigner,
        channel: Address,
        value: U256,
    ) -> Result<Self, SignatureError> {
        let signature = sign_digest(payer, voucher_digest(channel, value))?;
        Ok(Self {
            channel,
            value,
            signature,
        })
    }

    pub fn digest(&self) -> B256 {
        voucher_digest(self.channel, self.value)
    }

    /// Recovers the address which signed this voucher.
    pub fn recover_payer(&self) -> Result<Address, SignatureError> {
        recover_signer(self.digest(), &self.signature)
    }

    /// Check the voucher was signed by `payer`.
    pub fn verify(
        &self,
        payer: Address,
    ) -> Result<(), SignatureError> {
        let recovered = self.recover_payer()?;
        if recovered != payer {
            return Err(SignatureError::WrongSigner {
                recovered,
                expected: payer,
            });
        }
        Ok(())
    }

    /// Encode to a URL safe Base64 string, for handing over out of band.
    pub fn encode(&self) -> Result<String, SignatureError> {
        let json_bytes =
            serde_json::to_vec(self).map_err(|e| SignatureError::Encoding(e.to_string()))?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(json_bytes))
    }

    /// Decode from a Base64 string produced by [`PaymentVoucher::encode`].
    pub fn decode(s: &str) -> Result<Self, SignatureError> {
        let json_bytes = BASE64_URL_SAFE_NO_PAD
            .decode(s.trim())
            .map_err(|e| SignatureError::Encoding(e.to_string()))?;
        serde_json::from_slice(&json_bytes).map_err(|e| SignatureError::Encoding(e.to_string()))
    }
}

/// Payer side bookkeeping: never sign a voucher that is not strictly larger
/// than the last one for the same channel.
#[derive(Debug, Default)]
pub struct VoucherIssuer {
    issued: HashMap<Address, U256>,
}

impl VoucherIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_issued(
        &self,
        channel: Address,
    ) -> Option<U256> {
        self.issued.get(&channel).copied()
    }

    pub fn issue(
        &mut self,
        payer: &PrivateKeySigner,
        channel: Address,
        value: U256,
        deposit: U256,
    ) -> Result<PaymentVoucher, SignatureError> {
        if value > deposit {
            return Err(SignatureError::ExceedsDeposit { value, deposit });
        }
        if let Some(current) = self.last_issued(channel) {
            if value <= current {
                return Err(SignatureError::NotIncreasing {
                    channel,
                    value,
                    current,
                });
            }
        }

        let voucher = PaymentVoucher::sign(payer, channel, value)?;
        self.issued.insert(channel, value);
        Ok(voucher)
    }
}

/// Payee side bookkeeping: keeps the best verified voucher per channel.
#[derive(Debug, Default)]
pub struct VoucherBook {
    best: HashMap<Address, PaymentVoucher>,
}

impl VoucherBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies `voucher` against the channel's payer and deposit and keeps it
    /// if it beats the one already held.
    ///
    /// Returns `Ok(false)` for a valid voucher that is not an improvement.
    pub fn accept(
        &mut self,
        voucher: PaymentVoucher,
        payer: Address,
        deposit: U256,
    ) -> Result<bool, SignatureError> {
        voucher.verify(payer)?;
        if voucher.value > deposit {
            return Err(SignatureError::ExceedsDeposit {
                value: voucher.value,
                deposit,
            });
        }

        match self.best.get(&voucher.channel) {
            Some(current) if current.value >= voucher.value => Ok(false),
            _ => {
                self.best.insert(voucher.channel, voucher);
                Ok(true)
            },
        }
    }

    pub fn best(
        &self,
        channel: Address,
    ) -> Option<&PaymentVoucher> {
        self.best.get(&channel)
    }

    /// Drop the voucher once the channel is settled.
    pub fn forget(
        &mut self,
        channel: Address,
    ) -> Option<PaymentVoucher> {
        self.best.remove(&channel)
    }
}
