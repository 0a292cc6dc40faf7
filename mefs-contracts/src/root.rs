//! Per-owner Merkle root store: an append-only `int64 key → bytes32` map.
//!
//! The all-zero hash is what the contract returns for keys it has never
//! seen, so it is never published and always read back as "not found".

use alloy::primitives::Address;
use alloy::primitives::B256;
use tracing::info;

use crate::bindings::Root;
use crate::chain::TxReceipt;
use crate::directory::ROOT_KEY;
use crate::tx::CallDescriptor;
use crate::tx::TxSigner;
use crate::ContractError;
use crate::DirectoryResolver;

#[derive(Clone)]
pub struct MerkleRoots {
    directory: DirectoryResolver,
}

impl MerkleRoots {
    pub fn new(directory: DirectoryResolver) -> Self {
        Self { directory }
    }

    /// The owner's root contract, deployed on first use.
    pub async fn deploy(
        &self,
        owner: &TxSigner,
    ) -> Result<Address, ContractError> {
        match self.find(owner.address()).await {
            Ok(contract) => return Ok(contract),
            Err(ContractError::NotDeployedRoot(_)) => {},
            Err(err) => return Err(err),
        }

        self.directory.prepare_publish(ROOT_KEY, owner).await?;
        let call = CallDescriptor::deploy("Root", &self.directory.artifacts().root, Vec::new());
        let contract = self.directory.ledger().deploy(owner, call).await?;
        self.directory.publish(ROOT_KEY, owner, contract).await?;
        info!("deployed root contract {} for {}", contract, owner.address());
        Ok(contract)
    }

    pub async fn find(
        &self,
        owner: Address,
    ) -> Result<Address, ContractError> {
        let latest = match self.directory.latest(ROOT_KEY, owner).await {
            Ok(latest) => latest,
            Err(err) if err.is_not_deployed() => None,
            Err(err) => return Err(err),
        };
        match latest {
            Some(contract) if self.directory.ledger().has_code(contract).await? => Ok(contract),
            _ => Err(ContractError::NotDeployedRoot(owner)),
        }
    }

    /// Publish `root` under `key`. Returns `None` when exactly this root is
    /// already published; a different root under the same key is an error.
    pub async fn set_root(
        &self,
        signer: &TxSigner,
        contract: Address,
        key: i64,
        root: B256,
    ) -> Result<Option<TxReceipt>, ContractError> {
        if root.is_zero() {
            return Err(ContractError::ZeroRoot(key));
        }

        let ledger = self.directory.ledger();
        let result = ledger
            .transact_with(signer, || {
                async move {
                    match self.stored(contract, key).await? {
                        Some(_) => Err(ContractError::RootExists(key)),
                        None => Ok(CallDescriptor::call(contract, &Root::setRootCall { key, root })),
                    }
                }
            })
            .await;

        match result {
            Ok(receipt) => {
                info!("published root {} under key {} in {}", root, key, contract);
                Ok(Some(receipt))
            },
            // Either published before, or a submission we lost track of landed.
            Err(ContractError::RootExists(_)) if self.stored(contract, key).await? == Some(root) => {
                Ok(None)
            },
            Err(err) => Err(err),
        }
    }

    pub async fn get_root(
        &self,
        contract: Address,
        key: i64,
    ) -> Result<B256, ContractError> {
        self.stored(contract, key)
            .await?
            .ok_or(ContractError::MerkleRootNotFound(Some(key)))
    }

    /// The entry with the highest key.
    pub async fn latest(
        &self,
        contract: Address,
    ) -> Result<(i64, B256), ContractError> {
        let latest = self
            .directory
            .ledger()
            .read(contract, &Root::getLatestCall {})
            .await?;
        if latest.root.is_zero() {
            return Err(ContractError::MerkleRootNotFound(None));
        }
        Ok((latest.key, latest.root))
    }

    async fn stored(
        &self,
        contract: Address,
        key: i64,
    ) -> Result<Option<B256>, ContractError> {
        let root = self
            .directory
            .ledger()
            .read(contract, &Root::getRootCall { key })
            .await?
            .root;
        Ok((!root.is_zero()).then_some(root))
    }
}
