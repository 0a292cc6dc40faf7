//! Submitting and confirming mutating transactions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use alloy::network::EthereumWallet;
use alloy::network::TransactionBuilder;
use alloy::primitives::Address;
use alloy::primitives::Bytes;
use alloy::primitives::TxHash;
use alloy::primitives::U256;
use alloy::eips::eip2718::Encodable2718;
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use tokio::sync::OwnedMutexGuard;

use crate::chain::ChainError;
use crate::chain::SignedTx;
use crate::chain::TxRequest;

pub mod policy;
pub mod receipt;
pub mod submitter;
pub mod transactor;

pub use policy::GasPolicy;
pub use policy::RetryPolicy;
pub use receipt::ReceiptWaiter;
pub use submitter::SubmitOutcome;
pub use submitter::TxSubmitter;
pub use transactor::Transactor;

/// What to send: target, calldata and attached value. Nonce and gas are
/// decided by the submitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallDescriptor {
    /// Human readable method, for logs and metrics.
    pub method: &'static str,
    /// `None` deploys `input` as creation code.
    pub to: Option<Address>,
    pub input: Bytes,
    pub value: U256,
}

impl CallDescriptor {
    pub fn call<C: SolCall>(
        to: Address,
        call: &C,
    ) -> Self {
        Self {
            method: C::SIGNATURE,
            to: Some(to),
            input: call.abi_encode().into(),
            value: U256::ZERO,
        }
    }

    /// Creation code followed by the ABI encoded constructor arguments.
    pub fn deploy(
        contract: &'static str,
        bytecode: &Bytes,
        constructor_args: Vec<u8>,
    ) -> Self {
        let mut input = bytecode.to_vec();
        input.extend(constructor_args);
        Self {
            method: contract,
            to: None,
            input: input.into(),
            value: U256::ZERO,
        }
    }

    pub fn with_value(
        mut self,
        value: U256,
    ) -> Self {
        self.value = value;
        self
    }

    pub fn is_deploy(&self) -> bool {
        self.to.is_none()
    }
}

/// A private key able to sign transactions for one chain.
#[derive(Clone)]
pub struct TxSigner {
    signer: PrivateKeySigner,
    wallet: EthereumWallet,
    chain_id: u64,
}

impl fmt::Debug for TxSigner {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TxSigner")
            .field("address", &self.signer.address())
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

impl TxSigner {
    pub fn new(
        signer: PrivateKeySigner,
        chain_id: u64,
    ) -> Self {
        let wallet = EthereumWallet::from(signer.clone());
        Self {
            signer,
            wallet,
            chain_id,
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// The underlying key, for off-chain signatures (vouchers, keeper digests).
    pub fn key(&self) -> &PrivateKeySigner {
        &self.signer
    }

    /// Sign a legacy transaction.
    pub async fn sign(
        &self,
        request: TxRequest,
    ) -> Result<SignedTx, ChainError> {
        let tx = TransactionRequest::default()
            .with_from(request.from)
            .with_nonce(request.nonce)
            .with_gas_price(request.gas_price)
            .with_gas_limit(request.gas_limit)
            .with_value(request.value)
            .with_input(request.input.clone())
            .with_chain_id(self.chain_id);
        let tx = match request.to {
            Some(to) => tx.with_to(to),
            None => tx.into_create(),
        };

        let envelope = tx
            .build(&self.wallet)
            .await
            .map_err(|e| ChainError::Signing(e.to_string()))?;

        Ok(SignedTx {
            hash: *envelope.tx_hash(),
            raw: envelope.encoded_2718().into(),
            request,
        })
    }
}

/// One lock per signing key: nonce selection assumes a single logical
/// transaction in flight per key.
#[derive(Clone, Default)]
pub struct KeyLocks {
    locks: Arc<Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyLocks {
    pub async fn acquire(
        &self,
        key: Address,
    ) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// State of one logical submission: the nonce it is pinned to and the gas
/// price of the next resubmission.
#[derive(Clone, Debug)]
pub struct TxAttempt {
    pub nonce: Option<u64>,
    pub base_gas_price: u128,
    pub gas_price: u128,
    /// Every hash signed and sent for this nonce, oldest first.
    pub sent: Vec<TxHash>,
    pub last_error: Option<ChainError>,
    pub submissions: u32,
}

impl TxAttempt {
    pub fn new(gas_price: u128) -> Self {
        Self {
            nonce: None,
            base_gas_price: gas_price,
            gas_price,
            sent: Vec::new(),
            last_error: None,
            submissions: 0,
        }
    }

    pub fn escalated(&self) -> bool {
        self.gas_price > self.base_gas_price
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::address;

    use super::*;
    use crate::bindings::Mapper;

    #[test]
    fn test_call_descriptor_encodes_selector() {
        let target = address!("00000000000000000000000000000000000000aa");
        let call = CallDescriptor::call(
            target,
            &Mapper::addCall {
                addr: Address::ZERO,
            },
        );

        assert_eq!(call.method, "add(address)");
        assert_eq!(call.to, Some(target));
        assert_eq!(&call.input[..4], Mapper::addCall::SELECTOR.as_slice());
        assert!(!call.is_deploy());
    }

    #[test]
    fn test_deploy_descriptor_appends_constructor_args() {
        let code = Bytes::from_static(b"\x60\x80");
        let call = CallDescriptor::deploy("Mapper", &code, vec![1, 2, 3])
            .with_value(U256::from(5u64));

        assert!(call.is_deploy());
        assert_eq!(call.input.as_ref(), &[0x60, 0x80, 1, 2, 3]);
        assert_eq!(call.value, U256::from(5u64));
    }

    #[tokio::test]
    async fn test_signing_yields_stable_hash() {
        let signer = TxSigner::new(PrivateKeySigner::random(), 1337);
        let request = TxRequest {
            from: signer.address(),
            to: Some(Address::ZERO),
            input: Bytes::new(),
            value: U256::from(1u64),
            nonce: 0,
            gas_price: 1_000,
            gas_limit: 21_000,
        };

        let first = signer.sign(request.clone()).await.unwrap();
        let second = signer.sign(request).await.unwrap();
        assert_eq!(first.hash, second.hash);
        assert!(!first.raw.is_empty());
    }

    #[tokio::test]
    async fn test_key_locks_serialize_same_key() {
        let locks = KeyLocks::default();
        let key = Address::ZERO;

        let guard = locks.acquire(key).await;
        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.acquire(key).await;
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
