//! Upkeeping orders: one contract per (user, query) deal binding the user's
//! prepaid funds to a set of keepers and providers.
//!
//! Every change to a live order is authorised by a quorum of its live
//! keepers. Providers are paid per period: the keepers agree on the value
//! and a Merkle root over the blocks the provider proved, co-sign, and any
//! one of them submits. Periods must be contiguous per provider, which is
//! what makes a settlement impossible to replay.

use alloy::primitives::Address;
use alloy::primitives::Bytes;
use alloy::primitives::U256;
use alloy::sol_types::SolConstructor;
use mefs_auth::multisig::verify_quorum;
use mefs_auth::Authorization;
use serde::Serialize;
use tracing::info;

use crate::bindings::UpKeeping;
use crate::chain::TxReceipt;
use crate::directory::UPKEEPING_KEY;
use crate::proofs::proof_root;
use crate::proofs::BlockSource;
use crate::tx::CallDescriptor;
use crate::tx::TxSigner;
use crate::ContractError;
use crate::DirectoryResolver;

/// Percentage of every payment split among the keepers.
pub const KEEPER_SHARE_PERCENT: u8 = 10;

/// What a user commits to when deploying an order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderTerms {
    pub query: Address,
    pub keepers: Vec<Address>,
    pub providers: Vec<Address>,
    /// Seconds.
    pub duration: u64,
    pub size: U256,
    /// Per unit of size per second.
    pub price: U256,
    /// Settlement period, seconds.
    pub cycle: u64,
    pub prepaid: U256,
}

impl OrderTerms {
    /// `size × duration × price`.
    pub fn committed(&self) -> U256 {
        self.size
            .saturating_mul(U256::from(self.duration))
            .saturating_mul(self.price)
    }

    fn validate(&self) -> Result<(), ContractError> {
        if self.keepers.is_empty() {
            return Err(ContractError::InvalidOrder("no keepers".into()));
        }
        if self.providers.is_empty() {
            return Err(ContractError::InvalidOrder("no providers".into()));
        }
        if self.duration == 0 || self.cycle == 0 || self.size.is_zero() || self.price.is_zero() {
            return Err(ContractError::InvalidOrder(
                "duration, cycle, size and price must be positive".into(),
            ));
        }
        let committed = self.committed();
        if self.prepaid < committed {
            return Err(ContractError::InsufficientDeposit {
                deposit: self.prepaid,
                required: committed,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeeperSlot {
    pub address: Address,
    pub stopped: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProviderSlot {
    pub address: Address,
    pub stopped: bool,
    pub paid: U256,
    /// End of the last settled period, unix seconds.
    pub paid_until: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OrderInfo {
    pub address: Address,
    pub query: Address,
    pub user: Address,
    pub duration: u64,
    pub size: U256,
    pub price: U256,
    pub cycle: u64,
    pub create_date: u64,
    pub paid: U256,
    pub keepers: Vec<KeeperSlot>,
    pub providers: Vec<ProviderSlot>,
}

impl OrderInfo {
    pub fn end(&self) -> u64 {
        self.create_date.saturating_add(self.duration)
    }

    pub fn committed(&self) -> U256 {
        self.size
            .saturating_mul(U256::from(self.duration))
            .saturating_mul(self.price)
    }

    pub fn live_keepers(&self) -> Vec<Address> {
        self.keepers
            .iter()
            .filter(|k| !k.stopped)
            .map(|k| k.address)
            .collect()
    }

    /// What `length` seconds of storage are worth: `size × length × price`.
    pub fn period_value(
        &self,
        length: u64,
    ) -> U256 {
        self.size
            .saturating_mul(U256::from(length))
            .saturating_mul(self.price)
    }

    /// A provider still being paid.
    pub fn live_provider(
        &self,
        provider: Address,
    ) -> Option<&ProviderSlot> {
        self.providers
            .iter()
            .find(|p| p.address == provider && !p.stopped)
    }
}

/// Percentages over `[provider, keeper_1, .., keeper_n]`: the keepers split
/// [`KEEPER_SHARE_PERCENT`] evenly, the provider takes the rest.
pub fn default_share(keepers: usize) -> Vec<u8> {
    let per_keeper = match keepers {
        0 => 0,
        n => (KEEPER_SHARE_PERCENT as usize / n) as u8,
    };
    let keepers_total = per_keeper as usize * keepers;
    let mut share = Vec::with_capacity(keepers + 1);
    share.push(100 - keepers_total as u8);
    share.extend(std::iter::repeat(per_keeper).take(keepers));
    share
}

fn mismatch(
    field: &'static str,
    proposed: impl ToString,
    computed: impl ToString,
) -> ContractError {
    ContractError::ProposalMismatch {
        field,
        proposed: proposed.to_string(),
        computed: computed.to_string(),
    }
}

#[derive(Clone)]
pub struct UpkeepingOrders {
    directory: DirectoryResolver,
}

impl UpkeepingOrders {
    pub fn new(directory: DirectoryResolver) -> Self {
        Self { directory }
    }

    /// Deploy the order for `(user, terms.query)` unless one already exists.
    pub async fn deploy(
        &self,
        user: &TxSigner,
        terms: &OrderTerms,
    ) -> Result<Address, ContractError> {
        match self.find(user.address(), terms.query).await {
            Ok(order) => {
                info!(
                    "order for query {} already deployed at {}",
                    terms.query, order
                );
                return Ok(order);
            },
            Err(ContractError::NotDeployedUk { .. }) => {},
            Err(err) => return Err(err),
        }
        terms.validate()?;
        self.directory.prepare_publish(UPKEEPING_KEY, user).await?;

        let args = UpKeeping::constructorCall {
            query: terms.query,
            keepers: terms.keepers.clone(),
            providers: terms.providers.clone(),
            duration: U256::from(terms.duration),
            size: terms.size,
            price: terms.price,
            cycle: U256::from(terms.cycle),
        }
        .abi_encode();
        let call = CallDescriptor::deploy("UpKeeping", &self.directory.artifacts().upkeeping, args)
            .with_value(terms.prepaid);
        let order = self.directory.ledger().deploy(user, call).await?;
        self.directory.publish(UPKEEPING_KEY, user, order).await?;

        info!(
            "deployed order {} for query {}. keepers: {} providers: {} prepaid: {}",
            order,
            terms.query,
            terms.keepers.len(),
            terms.providers.len(),
            terms.prepaid
        );
        Ok(order)
    }

    /// The user's latest live order for `query`.
    pub async fn find(
        &self,
        user: Address,
        query: Address,
    ) -> Result<Address, ContractError> {
        let history = match self.directory.history(UPKEEPING_KEY, user).await {
            Ok(history) => history,
            Err(err) if err.is_not_deployed() => {
                return Err(ContractError::NotDeployedUk { user, query });
            },
            Err(err) => return Err(err),
        };

        let ledger = self.directory.ledger();
        for order in history.into_iter().rev() {
            if !ledger.has_code(order).await? {
                continue;
            }
            if ledger.read(order, &UpKeeping::getOrderCall {}).await?.query == query {
                return Ok(order);
            }
        }
        Err(ContractError::NotDeployedUk { user, query })
    }

    pub async fn info(
        &self,
        order: Address,
    ) -> Result<OrderInfo, ContractError> {
        let ledger = self.directory.ledger();
        if !ledger.has_code(order).await? {
            return Err(ContractError::OrderClosed(order));
        }
        let terms = ledger.read(order, &UpKeeping::getOrderCall {}).await?;
        let keepers = ledger.read(order, &UpKeeping::getKeepersCall {}).await?;
        let providers = ledger.read(order, &UpKeeping::getProvidersCall {}).await?;

        Ok(OrderInfo {
            address: order,
            query: terms.query,
            user: terms.user,
            duration: terms.duration.saturating_to(),
            size: terms.size,
            price: terms.price,
            cycle: terms.cycle.saturating_to(),
            create_date: terms.createDate.saturating_to(),
            paid: terms.paid,
            keepers: keepers
                .keepers
                .into_iter()
                .zip(keepers.stopped)
                .map(|(address, stopped)| KeeperSlot { address, stopped })
                .collect(),
            providers: providers
                .providers
                .into_iter()
                .zip(providers.stopped)
                .zip(providers.paid.into_iter().zip(providers.paidUntil))
                .map(|((address, stopped), (paid, paid_until))| {
                    ProviderSlot {
                        address,
                        stopped,
                        paid,
                        paid_until: paid_until.saturating_to(),
                    }
                })
                .collect(),
        })
    }

    /// Build the next payment for `provider`, for keepers to co-sign.
    ///
    /// The period starts where the provider was last paid and lasts `length`
    /// seconds, one cycle by default, clipped to the end of the order.
    pub async fn propose_settlement(
        &self,
        order: Address,
        provider: Address,
        length: Option<u64>,
        source: &dyn BlockSource,
        block_ids: &[String],
        share: Option<Vec<u8>>,
    ) -> Result<Authorization, ContractError> {
        let info = self.info(order).await?;
        let slot = info
            .live_provider(provider)
            .ok_or(ContractError::UnknownProvider(provider))?;

        let start = slot.paid_until;
        let length = length
            .unwrap_or(info.cycle)
            .min(info.end().saturating_sub(start));
        if length == 0 {
            return Err(ContractError::InvalidOrder(format!(
                "provider {provider} is paid until the end of the order"
            )));
        }

        let value = info.period_value(length);
        let root = proof_root(source, block_ids).await?;
        let share = share.unwrap_or_else(|| default_share(info.keepers.len()));

        Ok(Authorization::SpaceTimePay {
            order,
            provider,
            start: U256::from(start),
            length: U256::from(length),
            value,
            root,
            share,
        })
    }

    /// Recompute a proposed space-time payment from this keeper's own view of
    /// the order and the proven blocks, and refuse it on any difference.
    /// `share` is what the keeper expects, the default split when `None`.
    pub async fn check_proposal(
        &self,
        keeper: Address,
        authorization: &Authorization,
        source: &dyn BlockSource,
        block_ids: &[String],
        share: Option<Vec<u8>>,
    ) -> Result<(), ContractError> {
        let Authorization::SpaceTimePay {
            order,
            provider,
            start,
            length,
            value,
            root,
            share: proposed_share,
        } = authorization
        else {
            return Err(ContractError::InvalidOrder(
                "not a space-time payment".into(),
            ));
        };

        let info = self.info(*order).await?;
        if !info.live_keepers().contains(&keeper) {
            return Err(ContractError::UnknownKeeper(keeper));
        }
        let slot = info
            .live_provider(*provider)
            .ok_or(ContractError::UnknownProvider(*provider))?;

        let start: u64 = start.saturating_to();
        if start < slot.paid_until {
            return Err(ContractError::AlreadySettled {
                provider: *provider,
                start,
                paid_until: slot.paid_until,
            });
        }
        if start > slot.paid_until {
            return Err(ContractError::PeriodGap {
                provider: *provider,
                start,
                paid_until: slot.paid_until,
            });
        }
        let length: u64 = length.saturating_to();
        if length == 0 || start.saturating_add(length) > info.end() {
            return Err(ContractError::InvalidOrder(format!(
                "period {start}+{length} is outside the order ending at {}",
                info.end()
            )));
        }

        let computed = info.period_value(length);
        if *value != computed {
            return Err(mismatch("value", value, computed));
        }
        let total = info.paid.saturating_add(computed);
        if total > info.committed() {
            return Err(ContractError::ExceedsCommitted {
                value: computed,
                total,
                committed: info.committed(),
            });
        }
        let computed = proof_root(source, block_ids).await?;
        if *root != computed {
            return Err(mismatch("root", root, computed));
        }
        let computed = share.unwrap_or_else(|| default_share(info.keepers.len()));
        if *proposed_share != computed {
            return Err(mismatch(
                "share",
                format!("{proposed_share:?}"),
                format!("{computed:?}"),
            ));
        }
        Ok(())
    }

    /// Submit a co-signed space-time payment.
    pub async fn space_time_pay(
        &self,
        signer: &TxSigner,
        authorization: &Authorization,
        signatures: &[Bytes],
    ) -> Result<TxReceipt, ContractError> {
        let Authorization::SpaceTimePay {
            order,
            provider,
            start,
            length,
            value,
            root,
            share,
        } = authorization
        else {
            return Err(ContractError::InvalidOrder(
                "not a space-time payment".into(),
            ));
        };

        let receipt = self
            .directory
            .ledger()
            .transact_with(signer, || {
                async move {
                    let info = self.info(*order).await?;
                    let slot = info
                        .live_provider(*provider)
                        .ok_or(ContractError::UnknownProvider(*provider))?;
                    let start_secs: u64 = start.saturating_to();
                    if start_secs < slot.paid_until {
                        return Err(ContractError::AlreadySettled {
                            provider: *provider,
                            start: start_secs,
                            paid_until: slot.paid_until,
                        });
                    }
                    if start_secs > slot.paid_until {
                        return Err(ContractError::PeriodGap {
                            provider: *provider,
                            start: start_secs,
                            paid_until: slot.paid_until,
                        });
                    }
                    if length.is_zero() || start.saturating_add(*length) > U256::from(info.end()) {
                        return Err(ContractError::InvalidOrder(
                            "period outside the order term".into(),
                        ));
                    }

                    let committed = info.committed();
                    let total = info.paid.saturating_add(*value);
                    if total > committed {
                        return Err(ContractError::ExceedsCommitted {
                            value: *value,
                            total,
                            committed,
                        });
                    }
                    if share.len() != info.keepers.len() + 1
                        || share.iter().map(|s| *s as u32).sum::<u32>() != 100
                    {
                        return Err(ContractError::InvalidOrder(format!(
                            "share {share:?} must cover the provider and {} keepers and sum to 100",
                            info.keepers.len()
                        )));
                    }
                    verify_quorum(authorization.digest(), &info.live_keepers(), signatures)?;

                    Ok(CallDescriptor::call(
                        *order,
                        &UpKeeping::spaceTimePayCall {
                            provider: *provider,
                            start: *start,
                            length: *length,
                            value: *value,
                            root: *root,
                            share: share.clone(),
                            signs: signatures.to_vec(),
                        },
                    ))
                }
            })
            .await?;

        info!(
            "paid provider {} of order {}. start: {} length: {} value: {} root: {}",
            provider, order, start, length, value, root
        );
        Ok(receipt)
    }

    pub async fn add_provider(
        &self,
        signer: &TxSigner,
        order: Address,
        providers: Vec<Address>,
        signatures: &[Bytes],
    ) -> Result<TxReceipt, ContractError> {
        let authorization = Authorization::AddProvider {
            order,
            providers: providers.clone(),
        };
        let receipt = self
            .authorized(signer, order, &authorization, signatures, |info| {
                if let Some(existing) = providers
                    .iter()
                    .find(|p| info.providers.iter().any(|slot| slot.address == **p))
                {
                    return Err(ContractError::InvalidOrder(format!(
                        "{existing} already serves the order"
                    )));
                }
                Ok(CallDescriptor::call(
                    order,
                    &UpKeeping::addProviderCall {
                        providers: providers.clone(),
                        signs: signatures.to_vec(),
                    },
                ))
            })
            .await?;
        info!("added {} providers to order {}", providers.len(), order);
        Ok(receipt)
    }

    /// Extend the term by `add_time` seconds, paying for it up front.
    pub async fn extend_time(
        &self,
        signer: &TxSigner,
        order: Address,
        add_time: u64,
        signatures: &[Bytes],
    ) -> Result<TxReceipt, ContractError> {
        let authorization = Authorization::ExtendTime {
            order,
            add_time: U256::from(add_time),
        };
        let receipt = self
            .authorized(signer, order, &authorization, signatures, |info| {
                if add_time == 0 {
                    return Err(ContractError::InvalidOrder("nothing to extend".into()));
                }
                let value = info
                    .size
                    .saturating_mul(U256::from(add_time))
                    .saturating_mul(info.price);
                Ok(CallDescriptor::call(
                    order,
                    &UpKeeping::extendTimeCall {
                        addTime: U256::from(add_time),
                        signs: signatures.to_vec(),
                    },
                )
                .with_value(value))
            })
            .await?;
        info!("extended order {} by {}s", order, add_time);
        Ok(receipt)
    }

    pub async fn stop_keeper(
        &self,
        signer: &TxSigner,
        order: Address,
        keeper: Address,
        signatures: &[Bytes],
    ) -> Result<TxReceipt, ContractError> {
        let authorization = Authorization::KeeperStop { order, keeper };
        self.authorized(signer, order, &authorization, signatures, |info| {
            if !info.live_keepers().contains(&keeper) {
                return Err(ContractError::UnknownKeeper(keeper));
            }
            Ok(CallDescriptor::call(
                order,
                &UpKeeping::setKeeperStopCall {
                    keeper,
                    signs: signatures.to_vec(),
                },
            ))
        })
        .await
    }

    pub async fn stop_provider(
        &self,
        signer: &TxSigner,
        order: Address,
        provider: Address,
        signatures: &[Bytes],
    ) -> Result<TxReceipt, ContractError> {
        let authorization = Authorization::ProviderStop { order, provider };
        self.authorized(signer, order, &authorization, signatures, |info| {
            if info.live_provider(provider).is_none() {
                return Err(ContractError::UnknownProvider(provider));
            }
            Ok(CallDescriptor::call(
                order,
                &UpKeeping::setProviderStopCall {
                    provider,
                    signs: signatures.to_vec(),
                },
            ))
        })
        .await
    }

    /// Refund whatever is left to the user once the term is over. Anyone may.
    pub async fn destruct(
        &self,
        signer: &TxSigner,
        order: Address,
    ) -> Result<TxReceipt, ContractError> {
        let ledger = self.directory.ledger();
        let receipt = ledger
            .transact_with(signer, || {
                async move {
                    let info = self.info(order).await?;
                    let now = ledger.now().await?;
                    if now < info.end() {
                        return Err(ContractError::OrderNotExpired {
                            order,
                            end: info.end(),
                            now,
                        });
                    }
                    Ok(CallDescriptor::call(order, &UpKeeping::destructCall {}))
                }
            })
            .await?;
        info!("destructed order {}", order);
        Ok(receipt)
    }

    /// Send a keeper-authorised change: every cycle re-reads the order,
    /// checks the signatures still form a quorum of its live keepers and
    /// lets `build` check the change itself.
    async fn authorized<F>(
        &self,
        signer: &TxSigner,
        order: Address,
        authorization: &Authorization,
        signatures: &[Bytes],
        build: F,
    ) -> Result<TxReceipt, ContractError>
    where
        F: Fn(&OrderInfo) -> Result<CallDescriptor, ContractError>,
    {
        let build = &build;
        self.directory
            .ledger()
            .transact_with(signer, || {
                async move {
                    let info = self.info(order).await?;
                    verify_quorum(authorization.digest(), &info.live_keepers(), signatures)?;
                    build(&info)
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use alloy::signers::local::PrivateKeySigner;
    use mefs_auth::SignatureError;

    use super::*;
    use crate::chain::simulated::ContractKind;
    use crate::chain::SimulatedChain;
    use crate::proofs::MemoryBlockSource;
    use crate::tx::GasPolicy;
    use crate::Ledger;

    struct Setup {
        chain: Arc<SimulatedChain>,
        orders: UpkeepingOrders,
        user: TxSigner,
        keepers: Vec<PrivateKeySigner>,
        provider: Address,
        source: MemoryBlockSource,
    }

    fn funded(chain: &SimulatedChain) -> TxSigner {
        let signer = TxSigner::new(PrivateKeySigner::random(), chain.chain_id_value());
        chain.fund(signer.address(), U256::from(1_000_000u64));
        signer
    }

    fn setup() -> Setup {
        let chain = Arc::new(SimulatedChain::new());
        let indexer = chain.install_indexer();
        let ledger = Ledger::new(chain.clone(), GasPolicy::default());
        let directory = DirectoryResolver::new(ledger, indexer, SimulatedChain::artifacts());
        let mut source = MemoryBlockSource::new();
        source.insert("b0", b"block zero".to_vec());
        source.insert("b1", b"block one".to_vec());
        Setup {
            user: funded(&chain),
            keepers: (0..3).map(|_| PrivateKeySigner::random()).collect(),
            provider: Address::repeat_byte(0xaa),
            orders: UpkeepingOrders::new(directory),
            source,
            chain,
        }
    }

    fn terms(
        keepers: &[PrivateKeySigner],
        provider: Address,
    ) -> OrderTerms {
        OrderTerms {
            query: Address::repeat_byte(0x99),
            keepers: keepers.iter().map(|k| k.address()).collect(),
            providers: vec![provider],
            duration: 1_000,
            size: U256::from(10u64),
            price: U256::from(2u64),
            cycle: 100,
            prepaid: U256::from(20_000u64),
        }
    }

    fn sign(
        authorization: &Authorization,
        keepers: &[PrivateKeySigner],
    ) -> Vec<Bytes> {
        keepers
            .iter()
            .map(|k| authorization.sign(k).unwrap())
            .collect()
    }

    fn altered(
        authorization: &Authorization,
        change: impl FnOnce(&mut Authorization),
    ) -> Authorization {
        let mut altered = authorization.clone();
        change(&mut altered);
        altered
    }

    fn blocks() -> Vec<String> {
        vec!["b0".to_string(), "b1".to_string()]
    }

    #[test]
    fn test_default_share() {
        assert_eq!(default_share(0), vec![100]);
        assert_eq!(default_share(3), vec![91, 3, 3, 3]);
        assert_eq!(default_share(20), {
            let mut share = vec![100];
            share.extend([0; 20]);
            share
        });
        for n in 1..30 {
            assert_eq!(default_share(n).iter().map(|s| *s as u32).sum::<u32>(), 100);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_is_idempotent_per_query() {
        let Setup {
            chain,
            orders,
            user,
            keepers,
            provider,
            ..
        } = setup();
        let terms = terms(&keepers, provider);

        let first = orders.deploy(&user, &terms).await.unwrap();
        let second = orders.deploy(&user, &terms).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(chain.deployments(ContractKind::UpKeeping), 1);
        assert_eq!(chain.balance_of(first), U256::from(20_000u64));
        assert_eq!(orders.find(user.address(), terms.query).await.unwrap(), first);
        assert!(matches!(
            orders.find(user.address(), Address::repeat_byte(1)).await,
            Err(ContractError::NotDeployedUk { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_underfunded_order_is_refused() {
        let Setup {
            chain,
            orders,
            user,
            keepers,
            provider,
            ..
        } = setup();
        let terms = OrderTerms {
            prepaid: U256::from(19_999u64),
            ..terms(&keepers, provider)
        };

        assert!(matches!(
            orders.deploy(&user, &terms).await,
            Err(ContractError::InsufficientDeposit { .. })
        ));
        assert_eq!(chain.deployments(ContractKind::UpKeeping), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_banned_user_keeps_prepaid() {
        let Setup {
            chain,
            orders,
            user,
            keepers,
            provider,
            ..
        } = setup();
        let admin = funded(&chain);
        orders
            .directory
            .resolve_or_deploy(UPKEEPING_KEY, admin.address(), &admin, true)
            .await
            .unwrap();
        orders
            .directory
            .set_banned(&admin, UPKEEPING_KEY, user.address(), true)
            .await
            .unwrap();
        let terms = terms(&keepers, provider);
        let before = chain.balance_of(user.address());

        for _ in 0..2 {
            assert!(matches!(
                orders.deploy(&user, &terms).await,
                Err(ContractError::Banned(addr)) if addr == user.address()
            ));
        }
        assert_eq!(chain.deployments(ContractKind::UpKeeping), 0);
        assert_eq!(chain.balance_of(user.address()), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_space_time_pay_splits_value() {
        let Setup {
            chain,
            orders,
            user,
            keepers,
            provider,
            source,
        } = setup();
        let order = orders.deploy(&user, &terms(&keepers, provider)).await.unwrap();
        let submitter = funded(&chain);

        let proposal = orders
            .propose_settlement(order, provider, None, &source, &blocks(), None)
            .await
            .unwrap();
        let signatures = sign(&proposal, &keepers[..2]);
        orders
            .space_time_pay(&submitter, &proposal, &signatures)
            .await
            .unwrap();

        // 10 units × 100s × 2 = 2000, keepers take 3% each.
        assert_eq!(chain.balance_of(provider), U256::from(1_820u64));
        for keeper in &keepers {
            assert_eq!(chain.balance_of(keeper.address()), U256::from(60u64));
        }
        let info = orders.info(order).await.unwrap();
        assert_eq!(info.paid, U256::from(2_000u64));
        assert_eq!(info.providers[0].paid_until, info.create_date + 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeper_recomputes_before_cosigning() {
        let Setup {
            chain,
            orders,
            user,
            keepers,
            provider,
            source,
        } = setup();
        let order = orders.deploy(&user, &terms(&keepers, provider)).await.unwrap();
        let keeper = keepers[1].address();
        let proposal = orders
            .propose_settlement(order, provider, None, &source, &blocks(), None)
            .await
            .unwrap();

        orders
            .check_proposal(keeper, &proposal, &source, &blocks(), None)
            .await
            .unwrap();

        let Authorization::SpaceTimePay {
            start,
            length,
            value,
            root,
            share,
            ..
        } = proposal.clone()
        else {
            unreachable!()
        };
        let inflated = altered(&proposal, |a| {
            if let Authorization::SpaceTimePay { value: v, .. } = a {
                *v = value + U256::from(1u8);
            }
        });
        assert!(matches!(
            orders.check_proposal(keeper, &inflated, &source, &blocks(), None).await,
            Err(ContractError::ProposalMismatch { field: "value", .. })
        ));

        let greedy = altered(&proposal, |a| {
            if let Authorization::SpaceTimePay { share: s, .. } = a {
                *s = vec![100, 0, 0, 0];
            }
        });
        assert!(matches!(
            orders.check_proposal(keeper, &greedy, &source, &blocks(), None).await,
            Err(ContractError::ProposalMismatch { field: "share", .. })
        ));

        let early = altered(&proposal, |a| {
            if let Authorization::SpaceTimePay { start: s, .. } = a {
                *s = start + U256::from(5u8);
            }
        });
        assert!(matches!(
            orders.check_proposal(keeper, &early, &source, &blocks(), None).await,
            Err(ContractError::PeriodGap { .. })
        ));

        let overlong = altered(&proposal, |a| {
            if let Authorization::SpaceTimePay {
                length: l,
                value: v,
                ..
            } = a
            {
                *l = length * U256::from(20u8);
                *v = value * U256::from(20u8);
            }
        });
        assert!(matches!(
            orders.check_proposal(keeper, &overlong, &source, &blocks(), None).await,
            Err(ContractError::InvalidOrder(_))
        ));

        // A keeper that proved fewer blocks computes a different root.
        assert!(matches!(
            orders
                .check_proposal(keeper, &proposal, &source, &["b0".to_string()], None)
                .await,
            Err(ContractError::ProposalMismatch { field: "root", .. })
        ));
        assert_ne!(root, proof_root(&source, &["b0".to_string()]).await.unwrap());
        assert_eq!(share, default_share(3));

        let outsider = PrivateKeySigner::random().address();
        assert!(matches!(
            orders.check_proposal(outsider, &proposal, &source, &blocks(), None).await,
            Err(ContractError::UnknownKeeper(addr)) if addr == outsider
        ));
        assert_eq!(chain.deployments(ContractKind::UpKeeping), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_settlement_is_rejected() {
        let Setup {
            chain,
            orders,
            user,
            keepers,
            provider,
            source,
        } = setup();
        let order = orders.deploy(&user, &terms(&keepers, provider)).await.unwrap();
        let submitter = funded(&chain);
        let proposal = orders
            .propose_settlement(order, provider, None, &source, &blocks(), None)
            .await
            .unwrap();
        let signatures = sign(&proposal, &keepers);

        orders
            .space_time_pay(&submitter, &proposal, &signatures)
            .await
            .unwrap();
        let before = chain.submissions();
        let replay = orders.space_time_pay(&submitter, &proposal, &signatures).await;

        assert!(matches!(replay, Err(ContractError::AlreadySettled { .. })));
        assert_eq!(chain.submissions(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settlement_below_quorum() {
        let Setup {
            chain,
            orders,
            user,
            keepers,
            provider,
            source,
        } = setup();
        let order = orders.deploy(&user, &terms(&keepers, provider)).await.unwrap();
        let proposal = orders
            .propose_settlement(order, provider, None, &source, &blocks(), None)
            .await
            .unwrap();

        let result = orders
            .space_time_pay(&funded(&chain), &proposal, &sign(&proposal, &keepers[..1]))
            .await;

        assert!(matches!(
            result,
            Err(ContractError::Signature(SignatureError::BelowQuorum { have: 1, need: 2 }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settlement_beyond_commitment() {
        let Setup {
            chain,
            orders,
            user,
            keepers,
            provider,
            ..
        } = setup();
        let order = orders.deploy(&user, &terms(&keepers, provider)).await.unwrap();
        let info = orders.info(order).await.unwrap();
        let greedy = Authorization::SpaceTimePay {
            order,
            provider,
            start: U256::from(info.create_date),
            length: U256::from(100u64),
            value: U256::from(20_001u64),
            root: Default::default(),
            share: default_share(3),
        };

        let result = orders
            .space_time_pay(&funded(&chain), &greedy, &sign(&greedy, &keepers))
            .await;

        assert!(matches!(result, Err(ContractError::ExceedsCommitted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_stop_and_destruct() {
        let Setup {
            chain,
            orders,
            user,
            keepers,
            provider,
            ..
        } = setup();
        let order = orders.deploy(&user, &terms(&keepers, provider)).await.unwrap();

        let extend = Authorization::ExtendTime {
            order,
            add_time: U256::from(500u64),
        };
        orders
            .extend_time(&user, order, 500, &sign(&extend, &keepers))
            .await
            .unwrap();
        let info = orders.info(order).await.unwrap();
        assert_eq!(info.duration, 1_500);
        assert_eq!(chain.balance_of(order), U256::from(30_000u64));

        let stop = Authorization::KeeperStop {
            order,
            keeper: keepers[2].address(),
        };
        orders
            .stop_keeper(&user, order, keepers[2].address(), &sign(&stop, &keepers))
            .await
            .unwrap();
        assert_eq!(orders.info(order).await.unwrap().live_keepers().len(), 2);

        assert!(matches!(
            orders.destruct(&user, order).await,
            Err(ContractError::OrderNotExpired { .. })
        ));

        chain.advance_time(1_500);
        let before = chain.balance_of(user.address());
        orders.destruct(&user, order).await.unwrap();
        assert_eq!(chain.balance_of(user.address()), before + U256::from(30_000u64));
        assert!(matches!(
            orders.info(order).await,
            Err(ContractError::OrderClosed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_provider() {
        let Setup {
            chain,
            orders,
            user,
            keepers,
            provider,
            ..
        } = setup();
        let order = orders.deploy(&user, &terms(&keepers, provider)).await.unwrap();
        let newcomer = Address::repeat_byte(0xbb);
        let add = Authorization::AddProvider {
            order,
            providers: vec![newcomer],
        };

        orders
            .add_provider(&user, order, vec![newcomer], &sign(&add, &keepers))
            .await
            .unwrap();

        let info = orders.info(order).await.unwrap();
        let slot = info.live_provider(newcomer).unwrap();
        assert_eq!(slot.paid_until, chain.now());

        let again = Authorization::AddProvider {
            order,
            providers: vec![provider],
        };
        assert!(matches!(
            orders
                .add_provider(&user, order, vec![provider], &sign(&again, &keepers))
                .await,
            Err(ContractError::InvalidOrder(_))
        ));
    }
}
