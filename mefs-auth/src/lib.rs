//! Off-chain signatures shared by payers, payees and keepers.
//!
//! Everything in here is pure: hashing, signing and recovering. Nothing talks
//! to the ledger.

pub mod error;
pub mod multisig;
pub mod voucher;

pub use error::SignatureError;
pub use multisig::Authorization;
pub use multisig::SignatureCollector;
pub use voucher::PaymentVoucher;
pub use voucher::VoucherBook;
pub use voucher::VoucherIssuer;

use alloy::primitives::Address;
use alloy::primitives::Bytes;
use alloy::primitives::PrimitiveSignature;
use alloy::primitives::B256;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;

/// Sign a 32 byte digest without any message prefix.
///
/// The result is the 65 byte `r ‖ s ‖ v` layout contracts feed to `ecrecover`.
pub fn sign_digest(
    signer: &PrivateKeySigner,
    digest: B256,
) -> Result<Bytes, SignatureError> {
    let signature = signer.sign_hash_sync(&digest)?;
    Ok(Bytes::from(signature.as_bytes().to_vec()))
}

/// Recover the address that produced `signature` over `digest`.
pub fn recover_signer(
    digest: B256,
    signature: &[u8],
) -> Result<Address, SignatureError> {
    let signature = PrimitiveSignature::try_from(signature)?;
    Ok(signature.recover_address_from_prehash(&digest)?)
}

#[cfg(test)]
mod tests {
    use alloy::primitives::keccak256;

    use super::*;

    #[test]
    fn test_sign_and_recover_digest() -> anyhow::Result<()> {
        let signer = PrivateKeySigner::random();
        let digest = keccak256(b"settlement");

        let signature = sign_digest(&signer, digest)?;
        assert_eq!(signature.len(), 65);
        assert_eq!(recover_signer(digest, &signature)?, signer.address());

        Ok(())
    }

    #[test]
    fn test_recover_rejects_truncated_signature() {
        let digest = keccak256(b"settlement");
        assert!(recover_signer(digest, &[0u8; 12]).is_err());
    }
}
