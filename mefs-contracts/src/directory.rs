//! The Indexer → Resolver → Mapper directory.
//!
//! The indexer maps a key to a resolver, a resolver maps an owner to a
//! mapper, and a mapper holds the owner's deployments for that key, oldest
//! first. Every level is published at most once: writes are optimistic and
//! always followed by a re-read, so losing a race to another deployer simply
//! means adopting the address they published.

use alloy::primitives::Address;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::bindings::Indexer;
use crate::bindings::Mapper;
use crate::bindings::Resolver;
use crate::tx::CallDescriptor;
use crate::tx::TxSigner;
use crate::ContractArtifacts;
use crate::ContractError;
use crate::Ledger;

/// Directory key of a user's upkeeping orders.
pub const UPKEEPING_KEY: &str = "upkeeping";
/// Directory key of a payer's payment channels.
pub const CHANNEL_KEY: &str = "channel";
/// Directory key of a provider's Merkle root store.
pub const ROOT_KEY: &str = "root";

#[derive(Clone)]
pub struct DirectoryResolver {
    ledger: Ledger,
    indexer: Address,
    artifacts: ContractArtifacts,
}

impl DirectoryResolver {
    pub fn new(
        ledger: Ledger,
        indexer: Address,
        artifacts: ContractArtifacts,
    ) -> Self {
        Self {
            ledger,
            indexer,
            artifacts,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn indexer(&self) -> Address {
        self.indexer
    }

    pub fn artifacts(&self) -> &ContractArtifacts {
        &self.artifacts
    }

    /// Raw indexer entry: who published under `key`, and what.
    pub async fn indexer_entry(
        &self,
        key: &str,
    ) -> Result<(Address, Address), ContractError> {
        let entry = self
            .ledger
            .read(
                self.indexer,
                &Indexer::getCall {
                    key: key.to_string(),
                },
            )
            .await?;
        if entry.owner != Address::ZERO && entry.addr == Address::ZERO {
            return Err(ContractError::ZeroAddress(key.to_string()));
        }
        Ok((entry.owner, entry.addr))
    }

    /// A contract published directly in the indexer, with its publisher.
    pub async fn registered(
        &self,
        key: &str,
    ) -> Result<(Address, Address), ContractError> {
        match self.indexer_entry(key).await? {
            (_, Address::ZERO) => Err(ContractError::NotDeployedRole(key.to_string())),
            entry => Ok(entry),
        }
    }

    /// The resolver published under `key`.
    pub async fn resolver(
        &self,
        key: &str,
    ) -> Result<Address, ContractError> {
        match self.indexer_entry(key).await? {
            (_, Address::ZERO) => Err(ContractError::NotDeployedResolver(key.to_string())),
            (_, resolver) => Ok(resolver),
        }
    }

    /// Find `owner`'s mapper under `key`, deploying the missing levels with
    /// `deployer` when `allow_deploy` is set.
    pub async fn resolve_or_deploy(
        &self,
        key: &str,
        owner: Address,
        deployer: &TxSigner,
        allow_deploy: bool,
    ) -> Result<Address, ContractError> {
        let resolver = match self.resolver(key).await {
            Ok(resolver) => resolver,
            Err(ContractError::NotDeployedResolver(_)) if allow_deploy => {
                self.deploy_resolver(key, deployer).await?
            },
            Err(err) => return Err(err),
        };

        let mapper = self.mapper_of(resolver, owner).await?;
        if mapper != Address::ZERO {
            return Ok(mapper);
        }
        if !allow_deploy {
            return Err(ContractError::NotDeployedMapper {
                key: key.to_string(),
                owner,
            });
        }
        self.deploy_mapper(key, resolver, owner, deployer).await
    }

    /// Make sure `signer` can publish under `key` before anything is deployed
    /// on its behalf: the path to its mapper exists and it is not banned.
    pub async fn prepare_publish(
        &self,
        key: &str,
        signer: &TxSigner,
    ) -> Result<Address, ContractError> {
        let owner = signer.address();
        let mapper = self.resolve_or_deploy(key, owner, signer, true).await?;
        if self.is_banned(key, owner).await? {
            return Err(ContractError::Banned(owner));
        }
        Ok(mapper)
    }

    /// Append `addr` to the signer's mapper under `key`, creating the path to
    /// it first. A no-op when `addr` is already listed.
    pub async fn publish(
        &self,
        key: &str,
        signer: &TxSigner,
        addr: Address,
    ) -> Result<Address, ContractError> {
        let mapper = self
            .resolve_or_deploy(key, signer.address(), signer, true)
            .await?;

        let listed = self.ledger.read(mapper, &Mapper::getCall {}).await?.addrs;
        if listed.contains(&addr) {
            debug!("{} already listed under `{}` for {}", addr, key, signer.address());
            return Ok(mapper);
        }

        self.ledger
            .transact(signer, CallDescriptor::call(mapper, &Mapper::addCall { addr }))
            .await?;

        let ledger = &self.ledger;
        ledger
            .policy()
            .publish_policy()
            .poll("mapper publish", move || {
                async move {
                    let listed = ledger.read(mapper, &Mapper::getCall {}).await?.addrs;
                    Ok(listed.contains(&addr).then_some(()))
                }
            })
            .await?;

        info!("published {} under `{}` for {}", addr, key, signer.address());
        Ok(mapper)
    }

    /// Every address `owner` published under `key`, oldest first.
    pub async fn history(
        &self,
        key: &str,
        owner: Address,
    ) -> Result<Vec<Address>, ContractError> {
        let resolver = self.resolver(key).await?;
        let mapper = self.mapper_of(resolver, owner).await?;
        if mapper == Address::ZERO {
            return Err(ContractError::NotDeployedMapper {
                key: key.to_string(),
                owner,
            });
        }
        Ok(self.ledger.read(mapper, &Mapper::getCall {}).await?.addrs)
    }

    /// The most recent address `owner` published under `key`.
    pub async fn latest(
        &self,
        key: &str,
        owner: Address,
    ) -> Result<Option<Address>, ContractError> {
        Ok(self.history(key, owner).await?.last().copied())
    }

    pub async fn is_banned(
        &self,
        key: &str,
        owner: Address,
    ) -> Result<bool, ContractError> {
        let resolver = self.resolver(key).await?;
        Ok(self
            .ledger
            .read(resolver, &Resolver::isBannedCall { owner })
            .await?
            .banned)
    }

    /// Ban `owner` from publishing under `key`. Only the resolver's owner
    /// may do this.
    pub async fn set_banned(
        &self,
        signer: &TxSigner,
        key: &str,
        owner: Address,
        banned: bool,
    ) -> Result<(), ContractError> {
        let resolver = self.resolver(key).await?;
        self.ledger
            .transact(
                signer,
                CallDescriptor::call(resolver, &Resolver::setBannedCall { owner, banned }),
            )
            .await?;
        info!("set banned={} for {} under `{}`", banned, owner, key);
        Ok(())
    }

    /// Hand the resolver under `key` over to `new_owner`.
    pub async fn alter_owner(
        &self,
        signer: &TxSigner,
        key: &str,
        new_owner: Address,
    ) -> Result<(), ContractError> {
        let resolver = self.resolver(key).await?;
        self.ledger
            .transact(
                signer,
                CallDescriptor::call(
                    resolver,
                    &Resolver::alterOwnerCall {
                        newOwner: new_owner,
                    },
                ),
            )
            .await?;
        Ok(())
    }

    async fn mapper_of(
        &self,
        resolver: Address,
        owner: Address,
    ) -> Result<Address, ContractError> {
        Ok(self
            .ledger
            .read(resolver, &Resolver::getCall { owner })
            .await?
            .mapper)
    }

    async fn deploy_resolver(
        &self,
        key: &str,
        deployer: &TxSigner,
    ) -> Result<Address, ContractError> {
        let ours = self
            .ledger
            .deploy(
                deployer,
                CallDescriptor::deploy("Resolver", &self.artifacts.resolver, Vec::new()),
            )
            .await?;
        info!("deployed resolver {} for `{}`", ours, key);

        self.ledger
            .transact(
                deployer,
                CallDescriptor::call(
                    self.indexer,
                    &Indexer::addCall {
                        key: key.to_string(),
                        addr: ours,
                    },
                ),
            )
            .await?;

        let ledger = &self.ledger;
        let indexer = self.indexer;
        let published = ledger
            .policy()
            .publish_policy()
            .poll("indexer publish", move || {
                let call = Indexer::getCall {
                    key: key.to_string(),
                };
                async move {
                    let entry = ledger.read(indexer, &call).await?;
                    Ok((entry.addr != Address::ZERO).then_some(entry.addr))
                }
            })
            .await?;

        if published != ours {
            warn!(
                "another resolver was published under `{}` first, using {} instead of {}",
                key, published, ours
            );
        }
        Ok(published)
    }

    async fn deploy_mapper(
        &self,
        key: &str,
        resolver: Address,
        owner: Address,
        deployer: &TxSigner,
    ) -> Result<Address, ContractError> {
        let banned = self
            .ledger
            .read(resolver, &Resolver::isBannedCall { owner })
            .await?
            .banned;
        if banned {
            return Err(ContractError::Banned(owner));
        }

        let ours = self
            .ledger
            .deploy(
                deployer,
                CallDescriptor::deploy("Mapper", &self.artifacts.mapper, Vec::new()),
            )
            .await?;
        info!("deployed mapper {} for {} under `{}`", ours, owner, key);

        self.ledger
            .transact(
                deployer,
                CallDescriptor::call(resolver, &Resolver::addCall { owner, mapper: ours }),
            )
            .await?;

        let ledger = &self.ledger;
        let published = ledger
            .policy()
            .publish_policy()
            .poll("resolver publish", move || {
                async move {
                    let mapper = ledger
                        .read(resolver, &Resolver::getCall { owner })
                        .await?
                        .mapper;
                    Ok((mapper != Address::ZERO).then_some(mapper))
                }
            })
            .await?;

        if published != ours {
            warn!(
                "another mapper was published for {} under `{}` first, using {} instead of {}",
                owner, key, published, ours
            );
        }
        Ok(published)
    }
}
