//! Keeper and provider staking, flags and the keeper-provider map.
//!
//! The registries are published straight in the indexer under their role
//! key; whoever published them is their admin. Admin-only operations are
//! checked against that address before anything is sent.

use std::fmt;

use alloy::primitives::Address;
use alloy::primitives::U256;
use serde::Serialize;
use tracing::info;

use crate::bindings::KeeperProviderMap;
use crate::bindings::KeeperRegistry;
use crate::bindings::ProviderRegistry;
use crate::tx::CallDescriptor;
use crate::tx::TxSigner;
use crate::ContractError;
use crate::DirectoryResolver;

/// Indexer key of the keeper-provider map.
pub const KPMAP_KEY: &str = "kpmap";

/// Provider pledge ratios are expressed in basis points.
pub const PLEDGE_RATIO_DENOMINATOR: u64 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Keeper,
    Provider,
}

impl Role {
    pub fn key(&self) -> &'static str {
        match self {
            Role::Keeper => "keeper",
            Role::Provider => "provider",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// How much to stake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PledgeAmount {
    /// A fixed deposit, keepers only.
    Fixed(U256),
    /// Storage size to back; the deposit is derived from the provider's
    /// advertised price and the registry's pledge ratio at send time.
    Size(U256),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoleRecord {
    pub address: Address,
    pub registered: bool,
    pub banned: bool,
    pub staked: U256,
    /// First pledge, unix seconds. Zero if never pledged.
    pub time: u64,
    /// Advertised unit price.
    pub price: U256,
}

/// Provider deposit for backing `size` units at `price`.
pub fn provider_pledge(
    price: U256,
    size: U256,
    ratio: U256,
) -> U256 {
    price.saturating_mul(size).saturating_mul(ratio) / U256::from(PLEDGE_RATIO_DENOMINATOR)
}

#[derive(Clone)]
pub struct RoleRegistry {
    directory: DirectoryResolver,
}

impl RoleRegistry {
    pub fn new(directory: DirectoryResolver) -> Self {
        Self { directory }
    }

    /// Registry contract of `role`.
    pub async fn contract(
        &self,
        role: Role,
    ) -> Result<Address, ContractError> {
        Ok(self.directory.registered(role.key()).await?.1)
    }

    /// The admin of the contract published under `key`.
    pub async fn admin(
        &self,
        key: &str,
    ) -> Result<Address, ContractError> {
        Ok(self.directory.registered(key).await?.0)
    }

    /// Resolve the contract under `key` and make sure `caller` administers it.
    async fn authorize(
        &self,
        key: &str,
        caller: Address,
    ) -> Result<Address, ContractError> {
        let (admin, contract) = self.directory.registered(key).await?;
        if caller != admin {
            return Err(ContractError::Unauthorized { caller, admin });
        }
        Ok(contract)
    }

    /// Advertise `price` and stake, in one go. Enabling the holder is left
    /// to the admin.
    pub async fn register(
        &self,
        signer: &TxSigner,
        role: Role,
        price: U256,
        amount: PledgeAmount,
    ) -> Result<RoleRecord, ContractError> {
        let record = self.get_info(role, signer.address()).await?;
        if record.banned {
            return Err(ContractError::Banned(signer.address()));
        }
        if record.price != price {
            self.set_price(signer, role, price).await?;
        }
        self.pledge(signer, role, amount).await?;

        let record = self.get_info(role, signer.address()).await?;
        info!(
            "registered {} {}. staked: {} price: {}",
            role, record.address, record.staked, record.price
        );
        Ok(record)
    }

    pub async fn pledge(
        &self,
        signer: &TxSigner,
        role: Role,
        amount: PledgeAmount,
    ) -> Result<(), ContractError> {
        let contract = self.contract(role).await?;
        let holder = signer.address();
        let ledger = self.directory.ledger();

        match (role, amount) {
            (Role::Keeper, PledgeAmount::Fixed(value)) => {
                ledger
                    .transact_with(signer, || {
                        async move {
                            let floor = self.pledge_price(Role::Keeper).await?;
                            let staked = self.get_info(Role::Keeper, holder).await?.staked;
                            if value.is_zero() || staked + value < floor {
                                return Err(ContractError::InsufficientDeposit {
                                    deposit: staked + value,
                                    required: floor,
                                });
                            }
                            Ok(CallDescriptor::call(contract, &KeeperRegistry::pledgeCall {})
                                .with_value(value))
                        }
                    })
                    .await?;
            },
            (Role::Provider, PledgeAmount::Size(size)) => {
                ledger
                    .transact_with(signer, || {
                        async move {
                            // Price and ratio may move between cycles.
                            let ratio = self.pledge_price(Role::Provider).await?;
                            let price = self.get_info(Role::Provider, holder).await?.price;
                            if price.is_zero() {
                                return Err(ContractError::PriceNotSet(holder));
                            }
                            let value = provider_pledge(price, size, ratio);
                            Ok(CallDescriptor::call(
                                contract,
                                &ProviderRegistry::pledgeCall { size },
                            )
                            .with_value(value))
                        }
                    })
                    .await?;
            },
            (role, amount) => {
                return Err(ContractError::InvalidPledge(format!(
                    "{amount:?} does not apply to a {role}"
                )));
            },
        }
        Ok(())
    }

    /// Enable or disable `holder` in the `role` registry. Admin only.
    pub async fn set_flag(
        &self,
        admin: &TxSigner,
        role: Role,
        holder: Address,
        enabled: bool,
    ) -> Result<(), ContractError> {
        let contract = self.authorize(role.key(), admin.address()).await?;
        let call = match role {
            Role::Keeper => {
                CallDescriptor::call(
                    contract,
                    &KeeperRegistry::setCall {
                        keeper: holder,
                        isKeeper: enabled,
                    },
                )
            },
            Role::Provider => {
                CallDescriptor::call(
                    contract,
                    &ProviderRegistry::setCall {
                        provider: holder,
                        isProvider: enabled,
                    },
                )
            },
        };
        self.directory.ledger().transact(admin, call).await?;
        info!("set {} {} enabled={}", role, holder, enabled);
        Ok(())
    }

    /// Admin only.
    pub async fn set_banned(
        &self,
        admin: &TxSigner,
        role: Role,
        holder: Address,
        banned: bool,
    ) -> Result<(), ContractError> {
        let contract = self.authorize(role.key(), admin.address()).await?;
        let call = match role {
            Role::Keeper => {
                CallDescriptor::call(
                    contract,
                    &KeeperRegistry::setBannedCall {
                        keeper: holder,
                        banned,
                    },
                )
            },
            Role::Provider => {
                CallDescriptor::call(
                    contract,
                    &ProviderRegistry::setBannedCall {
                        provider: holder,
                        banned,
                    },
                )
            },
        };
        self.directory.ledger().transact(admin, call).await?;
        info!("set {} {} banned={}", role, holder, banned);
        Ok(())
    }

    /// Advertise the signer's unit price.
    pub async fn set_price(
        &self,
        signer: &TxSigner,
        role: Role,
        price: U256,
    ) -> Result<(), ContractError> {
        let contract = self.contract(role).await?;
        let call = match role {
            Role::Keeper => CallDescriptor::call(contract, &KeeperRegistry::setPriceCall { price }),
            Role::Provider => {
                CallDescriptor::call(contract, &ProviderRegistry::setPriceCall { price })
            },
        };
        self.directory.ledger().transact(signer, call).await?;
        Ok(())
    }

    /// Keeper deposit floor, or provider pledge ratio. Admin only.
    pub async fn set_pledge_price(
        &self,
        admin: &TxSigner,
        role: Role,
        price: U256,
    ) -> Result<(), ContractError> {
        let contract = self.authorize(role.key(), admin.address()).await?;
        let call = match role {
            Role::Keeper => {
                CallDescriptor::call(contract, &KeeperRegistry::setPledgePriceCall { price })
            },
            Role::Provider => {
                CallDescriptor::call(
                    contract,
                    &ProviderRegistry::setPledgePriceCall { ratio: price },
                )
            },
        };
        self.directory.ledger().transact(admin, call).await?;
        Ok(())
    }

    pub async fn pledge_price(
        &self,
        role: Role,
    ) -> Result<U256, ContractError> {
        let contract = self.contract(role).await?;
        let ledger = self.directory.ledger();
        Ok(match role {
            Role::Keeper => {
                ledger
                    .read(contract, &KeeperRegistry::getPledgePriceCall {})
                    .await?
                    .price
            },
            Role::Provider => {
                ledger
                    .read(contract, &ProviderRegistry::getPledgePriceCall {})
                    .await?
                    .ratio
            },
        })
    }

    pub async fn get_info(
        &self,
        role: Role,
        holder: Address,
    ) -> Result<RoleRecord, ContractError> {
        let contract = self.contract(role).await?;
        let ledger = self.directory.ledger();
        let (registered, banned, staked, time, price) = match role {
            Role::Keeper => {
                let info = ledger
                    .read(contract, &KeeperRegistry::infoCall { keeper: holder })
                    .await?;
                (info.isKeeper, info.isBanned, info.staked, info.time, info.price)
            },
            Role::Provider => {
                let info = ledger
                    .read(contract, &ProviderRegistry::infoCall { provider: holder })
                    .await?;
                (info.isProvider, info.isBanned, info.staked, info.time, info.price)
            },
        };
        Ok(RoleRecord {
            address: holder,
            registered,
            banned,
            staked,
            time: time.saturating_to(),
            price,
        })
    }

    /// Everyone who ever pledged or was flagged in `role`.
    pub async fn all_addresses(
        &self,
        role: Role,
    ) -> Result<Vec<Address>, ContractError> {
        let contract = self.contract(role).await?;
        let ledger = self.directory.ledger();
        Ok(match role {
            Role::Keeper => {
                ledger
                    .read(contract, &KeeperRegistry::getAllAddressCall {})
                    .await?
                    .addrs
            },
            Role::Provider => {
                ledger
                    .read(contract, &ProviderRegistry::getAllAddressCall {})
                    .await?
                    .addrs
            },
        })
    }

    /// Associate `providers` with `keeper`, reactivating soft-deleted entries.
    pub async fn add_keeper_providers(
        &self,
        admin: &TxSigner,
        keeper: Address,
        providers: Vec<Address>,
    ) -> Result<(), ContractError> {
        let kpmap = self.authorize(KPMAP_KEY, admin.address()).await?;
        self.directory
            .ledger()
            .transact(
                admin,
                CallDescriptor::call(kpmap, &KeeperProviderMap::addCall { keeper, providers }),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_keeper(
        &self,
        admin: &TxSigner,
        keeper: Address,
    ) -> Result<(), ContractError> {
        let kpmap = self.authorize(KPMAP_KEY, admin.address()).await?;
        self.directory
            .ledger()
            .transact(
                admin,
                CallDescriptor::call(kpmap, &KeeperProviderMap::deleteKeeperCall { keeper }),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_provider(
        &self,
        admin: &TxSigner,
        keeper: Address,
        provider: Address,
    ) -> Result<(), ContractError> {
        let kpmap = self.authorize(KPMAP_KEY, admin.address()).await?;
        self.directory
            .ledger()
            .transact(
                admin,
                CallDescriptor::call(
                    kpmap,
                    &KeeperProviderMap::deleteProviderCall { keeper, provider },
                ),
            )
            .await?;
        Ok(())
    }

    /// Active providers of `keeper`.
    pub async fn providers_of(
        &self,
        keeper: Address,
    ) -> Result<Vec<Address>, ContractError> {
        let (_, kpmap) = self.directory.registered(KPMAP_KEY).await?;
        Ok(self
            .directory
            .ledger()
            .read(kpmap, &KeeperProviderMap::getProvidersCall { keeper })
            .await?
            .providers)
    }

    /// Active keepers.
    pub async fn keepers(&self) -> Result<Vec<Address>, ContractError> {
        let (_, kpmap) = self.directory.registered(KPMAP_KEY).await?;
        Ok(self
            .directory
            .ledger()
            .read(kpmap, &KeeperProviderMap::getKeepersCall {})
            .await?
            .keepers)
    }
}
