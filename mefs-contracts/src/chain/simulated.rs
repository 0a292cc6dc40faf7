//! An in-memory ledger executing the contract surface of [`crate::bindings`].
//!
//! Transactions are mined the moment they are accepted. Sender addresses are
//! taken from the signed request rather than recovered from the raw bytes,
//! and no gas is charged. Deployments are recognised by the marker creation
//! code handed out by [`SimulatedChain::artifacts`].
//!
//! Faults are injected through counters: each call to e.g.
//! [`SimulatedChain::lose_responses`] affects the next `n` matching requests.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::MutexGuard;

use alloy::primitives::address;
use alloy::primitives::Address;
use alloy::primitives::Bytes;
use alloy::primitives::TxHash;
use alloy::primitives::B256;
use alloy::primitives::U256;
use alloy::sol_types::SolCall;
use alloy::sol_types::SolInterface;
use alloy::sol_types::SolValue;
use async_trait::async_trait;
use mefs_auth::multisig::verify_quorum;
use mefs_auth::voucher::voucher_digest;
use mefs_auth::Authorization;
use tracing::debug;

use super::ChainClient;
use super::ChainError;
use super::SignedTx;
use super::TxReceipt;
use crate::bindings::Channel;
use crate::bindings::Indexer;
use crate::bindings::KeeperProviderMap;
use crate::bindings::KeeperRegistry;
use crate::bindings::Mapper;
use crate::bindings::ProviderRegistry;
use crate::bindings::Resolver;
use crate::bindings::Root;
use crate::bindings::UpKeeping;
use crate::ContractArtifacts;

pub const SIMULATED_CHAIN_ID: u64 = 1337;

/// Block time the simulation starts at.
pub const GENESIS_TIME: u64 = 1_700_000_000;

/// Keeper deposit floor of freshly installed registries.
pub const DEFAULT_KEEPER_PLEDGE: u64 = 1_000;

/// Provider pledge ratio of freshly installed registries, in basis points.
pub const DEFAULT_PROVIDER_RATIO: u64 = 10_000;

const RATIO_DENOMINATOR: u64 = 10_000;

const GAS_USED: u64 = 21_000;

const GENESIS: Address = address!("00000000000000000000000000000000000000ee");

const RESOLVER_CODE: &[u8] = b"\x60\x80sim:Resolver;";
const MAPPER_CODE: &[u8] = b"\x60\x80sim:Mapper;";
const UPKEEPING_CODE: &[u8] = b"\x60\x80sim:UpKeeping;";
const CHANNEL_CODE: &[u8] = b"\x60\x80sim:Channel;";
const ROOT_CODE: &[u8] = b"\x60\x80sim:Root;";
const INSTALLED_CODE: &[u8] = b"\x60\x80sim:installed;";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContractKind {
    Indexer,
    Resolver,
    Mapper,
    KeeperRegistry,
    ProviderRegistry,
    KeeperProviderMap,
    Channel,
    UpKeeping,
    Root,
}

/// Addresses of the contracts set up by
/// [`SimulatedChain::install_role_contracts`].
#[derive(Clone, Copy, Debug)]
pub struct InstalledRoles {
    pub indexer: Address,
    pub keepers: Address,
    pub providers: Address,
    pub kpmap: Address,
}

type Revert = String;

#[derive(Clone, Debug, Default)]
struct Account {
    balance: U256,
    nonce: u64,
}

#[derive(Clone, Debug, Default)]
struct RoleEntry {
    registered: bool,
    banned: bool,
    staked: U256,
    time: u64,
    price: U256,
}

#[derive(Clone, Debug)]
struct RoleTable {
    admin: Address,
    pledge_price: U256,
    entries: BTreeMap<Address, RoleEntry>,
    addresses: Vec<Address>,
}

impl RoleTable {
    fn new(
        admin: Address,
        pledge_price: U256,
    ) -> Self {
        Self {
            admin,
            pledge_price,
            entries: BTreeMap::new(),
            addresses: Vec::new(),
        }
    }

    fn entry(
        &mut self,
        holder: Address,
    ) -> &mut RoleEntry {
        if !self.entries.contains_key(&holder) {
            self.addresses.push(holder);
        }
        self.entries.entry(holder).or_default()
    }

    fn only_admin(
        &self,
        caller: Address,
    ) -> Result<(), Revert> {
        if caller != self.admin {
            return Err(format!("{caller} is not the admin"));
        }
        Ok(())
    }

    fn info(
        &self,
        holder: Address,
    ) -> (bool, bool, U256, U256, U256) {
        let entry = self.entries.get(&holder).cloned().unwrap_or_default();
        (
            entry.registered,
            entry.banned,
            entry.staked,
            U256::from(entry.time),
            entry.price,
        )
    }

    fn add_stake(
        &mut self,
        holder: Address,
        amount: U256,
        now: u64,
    ) -> Result<(), Revert> {
        let entry = self.entry(holder);
        if entry.banned {
            return Err(format!("{holder} is banned"));
        }
        entry.staked += amount;
        if entry.time == 0 {
            entry.time = now;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct KpEntry {
    keeper: Address,
    active: bool,
    providers: Vec<(Address, bool)>,
}

#[derive(Clone, Debug)]
struct ProviderSlot {
    provider: Address,
    stopped: bool,
    paid: U256,
    paid_until: U256,
}

#[derive(Clone, Debug)]
struct Order {
    query: Address,
    user: Address,
    keepers: Vec<(Address, bool)>,
    providers: Vec<ProviderSlot>,
    duration: U256,
    size: U256,
    price: U256,
    cycle: U256,
    create_date: U256,
    paid: U256,
}

impl Order {
    fn live_keepers(&self) -> Vec<Address> {
        self.keepers
            .iter()
            .filter(|(_, stopped)| !stopped)
            .map(|(keeper, _)| *keeper)
            .collect()
    }

    fn committed(&self) -> Result<U256, Revert> {
        self.size
            .checked_mul(self.duration)
            .and_then(|v| v.checked_mul(self.price))
            .ok_or_else(|| "committed total overflows".to_string())
    }

    fn authorize(
        &self,
        authorization: Authorization,
        signs: &[Bytes],
    ) -> Result<(), Revert> {
        verify_quorum(authorization.digest(), &self.live_keepers(), signs)
            .map_err(|e| format!("bad signatures: {e}"))
    }
}

#[derive(Clone, Debug)]
enum Contract {
    Indexer {
        entries: HashMap<String, (Address, Address)>,
    },
    Resolver {
        admin: Address,
        entries: HashMap<Address, Address>,
        banned: HashSet<Address>,
    },
    Mapper {
        owner: Address,
        addrs: Vec<Address>,
    },
    Keepers(RoleTable),
    Providers(RoleTable),
    KpMap {
        admin: Address,
        entries: Vec<KpEntry>,
    },
    Channel {
        payer: Address,
        payee: Address,
        expiry: u64,
    },
    UpKeeping(Box<Order>),
    Root {
        owner: Address,
        roots: BTreeMap<i64, B256>,
    },
    Destroyed,
}

impl Contract {
    fn code(&self) -> &'static [u8] {
        match self {
            Contract::Resolver { .. } => RESOLVER_CODE,
            Contract::Mapper { .. } => MAPPER_CODE,
            Contract::Channel { .. } => CHANNEL_CODE,
            Contract::UpKeeping(_) => UPKEEPING_CODE,
            Contract::Root { .. } => ROOT_CODE,
            Contract::Indexer { .. }
            | Contract::Keepers(_)
            | Contract::Providers(_)
            | Contract::KpMap { .. } => INSTALLED_CODE,
            Contract::Destroyed => &[],
        }
    }
}

/// Who is calling, with what, when.
struct Ctx {
    this: Address,
    from: Address,
    value: U256,
    now: u64,
}

#[derive(Debug, Default)]
struct Faults {
    reject_sends: u32,
    lose_responses: u32,
    revert_next: u32,
    delay_receipts: u32,
    fail_reads: u32,
    fail_gas_price: u32,
    read_lag: u32,
    lagging: u32,
}

#[derive(Debug)]
struct ChainState {
    time: u64,
    block: u64,
    installs: u64,
    accounts: HashMap<Address, Account>,
    contracts: HashMap<Address, Contract>,
    receipts: HashMap<TxHash, TxReceipt>,
    landed: Vec<(Address, u64)>,
    deployments: Vec<ContractKind>,
    submissions: usize,
    faults: Faults,
}

pub struct SimulatedChain {
    chain_id: u64,
    state: Mutex<ChainState>,
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedChain {
    pub fn new() -> Self {
        Self {
            chain_id: SIMULATED_CHAIN_ID,
            state: Mutex::new(ChainState {
                time: GENESIS_TIME,
                block: 0,
                installs: 0,
                accounts: HashMap::new(),
                contracts: HashMap::new(),
                receipts: HashMap::new(),
                landed: Vec::new(),
                deployments: Vec::new(),
                submissions: 0,
                faults: Faults::default(),
            }),
        }
    }

    /// Creation code this chain knows how to deploy.
    pub fn artifacts() -> ContractArtifacts {
        ContractArtifacts {
            resolver: Bytes::from_static(RESOLVER_CODE),
            mapper: Bytes::from_static(MAPPER_CODE),
            upkeeping: Bytes::from_static(UPKEEPING_CODE),
            channel: Bytes::from_static(CHANNEL_CODE),
            root: Bytes::from_static(ROOT_CODE),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn chain_id_value(&self) -> u64 {
        self.chain_id
    }

    /// Install an empty indexer at a fresh address.
    pub fn install_indexer(&self) -> Address {
        self.state().install(Contract::Indexer {
            entries: HashMap::new(),
        })
    }

    /// Install an indexer plus keeper, provider and keeper-provider-map
    /// contracts administered by `admin`, published as `keeper`, `provider`
    /// and `kpmap`.
    pub fn install_role_contracts(
        &self,
        admin: Address,
    ) -> InstalledRoles {
        let mut state = self.state();
        let keepers = state.install(Contract::Keepers(RoleTable::new(
            admin,
            U256::from(DEFAULT_KEEPER_PLEDGE),
        )));
        let providers = state.install(Contract::Providers(RoleTable::new(
            admin,
            U256::from(DEFAULT_PROVIDER_RATIO),
        )));
        let kpmap = state.install(Contract::KpMap {
            admin,
            entries: Vec::new(),
        });

        let mut entries = HashMap::new();
        entries.insert("keeper".to_string(), (admin, keepers));
        entries.insert("provider".to_string(), (admin, providers));
        entries.insert("kpmap".to_string(), (admin, kpmap));
        let indexer = state.install(Contract::Indexer { entries });

        InstalledRoles {
            indexer,
            keepers,
            providers,
            kpmap,
        }
    }

    pub fn fund(
        &self,
        account: Address,
        amount: U256,
    ) {
        self.state().accounts.entry(account).or_default().balance += amount;
    }

    pub fn balance_of(
        &self,
        account: Address,
    ) -> U256 {
        self.state().balance(account)
    }

    /// Consume a nonce of `account` behind the client's back.
    pub fn bump_nonce(
        &self,
        account: Address,
    ) {
        let mut state = self.state();
        let account_state = state.accounts.entry(account).or_default();
        let nonce = account_state.nonce;
        account_state.nonce += 1;
        state.landed.push((account, nonce));
    }

    /// Reject the next `n` sends without accepting them.
    pub fn reject_sends(
        &self,
        n: u32,
    ) {
        self.state().faults.reject_sends = n;
    }

    /// Mine the next `n` accepted transactions but answer with a transport error.
    pub fn lose_responses(
        &self,
        n: u32,
    ) {
        self.state().faults.lose_responses = n;
    }

    /// Mine the next `n` transactions with a failure status.
    pub fn revert_next(
        &self,
        n: u32,
    ) {
        self.state().faults.revert_next = n;
    }

    /// Answer the next `n` receipt lookups with "not mined yet".
    pub fn delay_receipts(
        &self,
        n: u32,
    ) {
        self.state().faults.delay_receipts = n;
    }

    /// Fail the next `n` `eth_call`s with a transport error.
    pub fn fail_reads(
        &self,
        n: u32,
    ) {
        self.state().faults.fail_reads = n;
    }

    /// Fail the next `n` gas price queries with a transport error.
    pub fn fail_gas_price(
        &self,
        n: u32,
    ) {
        self.state().faults.fail_gas_price = n;
    }

    /// After every directory write, serve `n` stale (empty) directory reads.
    pub fn set_read_lag(
        &self,
        n: u32,
    ) {
        self.state().faults.read_lag = n;
    }

    pub fn now(&self) -> u64 {
        self.state().time
    }

    pub fn set_time(
        &self,
        time: u64,
    ) {
        self.state().time = time;
    }

    pub fn advance_time(
        &self,
        seconds: u64,
    ) {
        self.state().time += seconds;
    }

    /// Nonces of every transaction from `account` that made it into a block,
    /// reverted ones included.
    pub fn landed_nonces(
        &self,
        account: Address,
    ) -> Vec<u64> {
        self.state()
            .landed
            .iter()
            .filter(|(from, _)| *from == account)
            .map(|(_, nonce)| *nonce)
            .collect()
    }

    /// Every `eth_sendRawTransaction` received, accepted or not.
    pub fn submissions(&self) -> usize {
        self.state().submissions
    }

    /// Successful deployments of `kind`.
    pub fn deployments(
        &self,
        kind: ContractKind,
    ) -> usize {
        self.state()
            .deployments
            .iter()
            .filter(|deployed| **deployed == kind)
            .count()
    }

    pub fn is_live(
        &self,
        contract: Address,
    ) -> bool {
        self.state()
            .contracts
            .get(&contract)
            .is_some_and(|c| !matches!(c, Contract::Destroyed))
    }
}

impl ChainState {
    fn install(
        &mut self,
        contract: Contract,
    ) -> Address {
        let address = GENESIS.create(self.installs);
        self.installs += 1;
        self.contracts.insert(address, contract);
        address
    }

    fn balance(
        &self,
        account: Address,
    ) -> U256 {
        self.accounts
            .get(&account)
            .map(|a| a.balance)
            .unwrap_or_default()
    }

    fn transfer(
        &mut self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), Revert> {
        if amount.is_zero() {
            return Ok(());
        }
        let source = self.accounts.entry(from).or_default();
        if source.balance < amount {
            return Err(format!("{from} cannot pay {amount}"));
        }
        source.balance -= amount;
        self.accounts.entry(to).or_default().balance += amount;
        Ok(())
    }

    fn mine(
        &mut self,
        tx: &SignedTx,
    ) {
        let request = &tx.request;
        let snapshot = (self.accounts.clone(), self.contracts.clone());
        self.block += 1;

        let outcome = if self.faults.revert_next > 0 {
            self.faults.revert_next -= 1;
            Err("forced revert".to_string())
        } else {
            self.execute(tx)
        };

        let (success, contract_address) = match outcome {
            Ok((address, kind)) => {
                if let Some(kind) = kind {
                    self.deployments.push(kind);
                }
                (true, address)
            },
            Err(reason) => {
                debug!("simulated transaction {} reverted: {}", tx.hash, reason);
                self.accounts = snapshot.0;
                self.contracts = snapshot.1;
                (false, None)
            },
        };

        self.accounts.entry(request.from).or_default().nonce = request.nonce + 1;
        self.landed.push((request.from, request.nonce));
        self.receipts.insert(
            tx.hash,
            TxReceipt {
                hash: tx.hash,
                success,
                block_number: self.block,
                contract_address,
                gas_used: GAS_USED,
            },
        );
    }

    fn execute(
        &mut self,
        tx: &SignedTx,
    ) -> Result<(Option<Address>, Option<ContractKind>), Revert> {
        let request = &tx.request;
        match request.to {
            None => {
                let this = request.from.create(request.nonce);
                let ctx = Ctx {
                    this,
                    from: request.from,
                    value: request.value,
                    now: self.time,
                };
                let (kind, contract) = construct(&ctx, &request.input)?;
                self.transfer(request.from, this, request.value)?;
                self.contracts.insert(this, contract);
                Ok((Some(this), Some(kind)))
            },
            Some(to) => {
                self.transfer(request.from, to, request.value)?;
                let Some(mut contract) = self.contracts.remove(&to) else {
                    return Ok((None, None));
                };
                let ctx = Ctx {
                    this: to,
                    from: request.from,
                    value: request.value,
                    now: self.time,
                };
                let result = self.dispatch(&ctx, &mut contract, &request.input);
                self.contracts.insert(to, contract);
                result.map(|_| (None, None))
            },
        }
    }

    fn directory_written(&mut self) {
        self.faults.lagging = self.faults.read_lag;
    }

    fn lagging(&mut self) -> bool {
        if self.faults.lagging > 0 {
            self.faults.lagging -= 1;
            return true;
        }
        false
    }

    fn dispatch(
        &mut self,
        ctx: &Ctx,
        contract: &mut Contract,
        input: &[u8],
    ) -> Result<(), Revert> {
        let decode_err = |e: alloy::sol_types::Error| format!("bad calldata: {e}");
        match contract {
            Contract::Indexer { entries } => {
                match Indexer::IndexerCalls::abi_decode(input, true).map_err(decode_err)? {
                    Indexer::IndexerCalls::add(call) => {
                        if call.addr == Address::ZERO {
                            return Err("zero address".into());
                        }
                        if entries.contains_key(&call.key) {
                            debug!("indexer: {} has already been published", call.key);
                        } else {
                            entries.insert(call.key, (ctx.from, call.addr));
                            self.directory_written();
                        }
                        Ok(())
                    },
                    Indexer::IndexerCalls::get(_) => Ok(()),
                }
            },
            Contract::Resolver {
                admin,
                entries,
                banned,
            } => {
                match Resolver::ResolverCalls::abi_decode(input, true).map_err(decode_err)? {
                    Resolver::ResolverCalls::add(call) => {
                        if banned.contains(&call.owner) {
                            return Err(format!("{} is banned", call.owner));
                        }
                        if call.mapper == Address::ZERO {
                            return Err("zero address".into());
                        }
                        if let std::collections::hash_map::Entry::Vacant(slot) =
                            entries.entry(call.owner)
                        {
                            slot.insert(call.mapper);
                            self.directory_written();
                        }
                        Ok(())
                    },
                    Resolver::ResolverCalls::alterOwner(call) => {
                        if ctx.from != *admin {
                            return Err("not the resolver owner".into());
                        }
                        *admin = call.newOwner;
                        Ok(())
                    },
                    Resolver::ResolverCalls::setBanned(call) => {
                        if ctx.from != *admin {
                            return Err("not the resolver owner".into());
                        }
                        if call.banned {
                            banned.insert(call.owner);
                        } else {
                            banned.remove(&call.owner);
                        }
                        Ok(())
                    },
                    Resolver::ResolverCalls::get(_) | Resolver::ResolverCalls::isBanned(_) => {
                        Ok(())
                    },
                }
            },
            Contract::Mapper { owner, addrs } => {
                match Mapper::MapperCalls::abi_decode(input, true).map_err(decode_err)? {
                    Mapper::MapperCalls::add(call) => {
                        if ctx.from != *owner {
                            return Err("not the mapper owner".into());
                        }
                        addrs.push(call.addr);
                        self.directory_written();
                        Ok(())
                    },
                    Mapper::MapperCalls::get(_) => Ok(()),
                }
            },
            Contract::Keepers(table) => {
                use KeeperRegistry::KeeperRegistryCalls as Call;
                match Call::abi_decode(input, true).map_err(decode_err)? {
                    Call::set(call) => {
                        table.only_admin(ctx.from)?;
                        table.entry(call.keeper).registered = call.isKeeper;
                        Ok(())
                    },
                    Call::setBanned(call) => {
                        table.only_admin(ctx.from)?;
                        table.entry(call.keeper).banned = call.banned;
                        Ok(())
                    },
                    Call::pledge(_) => {
                        let staked = table
                            .entries
                            .get(&ctx.from)
                            .map(|e| e.staked)
                            .unwrap_or_default();
                        if ctx.value.is_zero() || staked + ctx.value < table.pledge_price {
                            return Err(format!(
                                "pledge {} below floor {}",
                                ctx.value, table.pledge_price
                            ));
                        }
                        table.add_stake(ctx.from, ctx.value, ctx.now)
                    },
                    Call::setPrice(call) => {
                        table.entry(ctx.from).price = call.price;
                        Ok(())
                    },
                    Call::setPledgePrice(call) => {
                        table.only_admin(ctx.from)?;
                        table.pledge_price = call.price;
                        Ok(())
                    },
                    Call::getPledgePrice(_) | Call::info(_) | Call::getAllAddress(_) => Ok(()),
                }
            },
            Contract::Providers(table) => {
                use ProviderRegistry::ProviderRegistryCalls as Call;
                match Call::abi_decode(input, true).map_err(decode_err)? {
                    Call::set(call) => {
                        table.only_admin(ctx.from)?;
                        table.entry(call.provider).registered = call.isProvider;
                        Ok(())
                    },
                    Call::setBanned(call) => {
                        table.only_admin(ctx.from)?;
                        table.entry(call.provider).banned = call.banned;
                        Ok(())
                    },
                    Call::pledge(call) => {
                        let price = table
                            .entries
                            .get(&ctx.from)
                            .map(|e| e.price)
                            .unwrap_or_default();
                        let required = price * call.size * table.pledge_price
                            / U256::from(RATIO_DENOMINATOR);
                        if ctx.value.is_zero() || ctx.value < required {
                            return Err(format!("pledge {} below required {required}", ctx.value));
                        }
                        table.add_stake(ctx.from, ctx.value, ctx.now)
                    },
                    Call::setPrice(call) => {
                        table.entry(ctx.from).price = call.price;
                        Ok(())
                    },
                    Call::setPledgePrice(call) => {
                        table.only_admin(ctx.from)?;
                        table.pledge_price = call.ratio;
                        Ok(())
                    },
                    Call::getPledgePrice(_) | Call::info(_) | Call::getAllAddress(_) => Ok(()),
                }
            },
            Contract::KpMap { admin, entries } => {
                use KeeperProviderMap::KeeperProviderMapCalls as Call;
                let call = Call::abi_decode(input, true).map_err(decode_err)?;
                if matches!(call, Call::getProviders(_) | Call::getKeepers(_)) {
                    return Ok(());
                }
                if ctx.from != *admin {
                    return Err(format!("{} is not the admin", ctx.from));
                }
                match call {
                    Call::add(call) => {
                        let index = match entries.iter().position(|e| e.keeper == call.keeper) {
                            Some(index) => index,
                            None => {
                                entries.push(KpEntry {
                                    keeper: call.keeper,
                                    active: true,
                                    providers: Vec::new(),
                                });
                                entries.len() - 1
                            },
                        };
                        let entry = &mut entries[index];
                        entry.active = true;
                        for provider in call.providers {
                            match entry.providers.iter_mut().find(|(p, _)| *p == provider) {
                                Some(slot) => slot.1 = true,
                                None => entry.providers.push((provider, true)),
                            }
                        }
                        Ok(())
                    },
                    Call::deleteKeeper(call) => {
                        let entry = entries
                            .iter_mut()
                            .find(|e| e.keeper == call.keeper)
                            .ok_or("unknown keeper")?;
                        entry.active = false;
                        Ok(())
                    },
                    Call::deleteProvider(call) => {
                        let entry = entries
                            .iter_mut()
                            .find(|e| e.keeper == call.keeper)
                            .ok_or("unknown keeper")?;
                        let slot = entry
                            .providers
                            .iter_mut()
                            .find(|(p, _)| *p == call.provider)
                            .ok_or("unknown provider")?;
                        slot.1 = false;
                        Ok(())
                    },
                    Call::getProviders(_) | Call::getKeepers(_) => Ok(()),
                }
            },
            Contract::Channel {
                payer,
                payee,
                expiry,
            } => {
                let (payer, payee, expiry) = (*payer, *payee, *expiry);
                let balance = self.balance(ctx.this);
                match Channel::ChannelCalls::abi_decode(input, true).map_err(decode_err)? {
                    Channel::ChannelCalls::closeChannel(call) => {
                        if ctx.from != payee {
                            return Err("only the payee may close".into());
                        }
                        let signer =
                            mefs_auth::recover_signer(voucher_digest(ctx.this, call.value), &call.sig)
                                .map_err(|e| e.to_string())?;
                        if signer != payer {
                            return Err(format!("voucher signed by {signer}, not the payer"));
                        }
                        if call.value > balance {
                            return Err("voucher exceeds balance".into());
                        }
                        self.transfer(ctx.this, payee, call.value)?;
                        self.transfer(ctx.this, payer, balance - call.value)?;
                        *contract = Contract::Destroyed;
                        Ok(())
                    },
                    Channel::ChannelCalls::channelTimeout(_) => {
                        if ctx.now < expiry {
                            return Err("channel not expired".into());
                        }
                        self.transfer(ctx.this, payer, balance)?;
                        *contract = Contract::Destroyed;
                        Ok(())
                    },
                    Channel::ChannelCalls::getInfo(_) => Ok(()),
                }
            },
            Contract::UpKeeping(order) => {
                let destroy = self.dispatch_order(ctx, order, input)?;
                if destroy {
                    *contract = Contract::Destroyed;
                }
                Ok(())
            },
            Contract::Root { owner, roots } => {
                match Root::RootCalls::abi_decode(input, true).map_err(decode_err)? {
                    Root::RootCalls::setRoot(call) => {
                        if ctx.from != *owner {
                            return Err("not the root owner".into());
                        }
                        if roots.contains_key(&call.key) {
                            return Err(format!("root {} already set", call.key));
                        }
                        roots.insert(call.key, call.root);
                        Ok(())
                    },
                    Root::RootCalls::getRoot(_) | Root::RootCalls::getLatest(_) => Ok(()),
                }
            },
            Contract::Destroyed => Err("contract destroyed".into()),
        }
    }

    /// Returns whether the order destroyed itself.
    fn dispatch_order(
        &mut self,
        ctx: &Ctx,
        order: &mut Order,
        input: &[u8],
    ) -> Result<bool, Revert> {
        use UpKeeping::UpKeepingCalls as Call;
        let call = Call::abi_decode(input, true).map_err(|e| format!("bad calldata: {e}"))?;
        match call {
            Call::addProvider(call) => {
                order.authorize(
                    Authorization::AddProvider {
                        order: ctx.this,
                        providers: call.providers.clone(),
                    },
                    &call.signs,
                )?;
                for provider in call.providers {
                    if order.providers.iter().any(|p| p.provider == provider) {
                        return Err(format!("{provider} already serves the order"));
                    }
                    order.providers.push(ProviderSlot {
                        provider,
                        stopped: false,
                        paid: U256::ZERO,
                        paid_until: U256::from(ctx.now),
                    });
                }
                Ok(false)
            },
            Call::spaceTimePay(call) => {
                order.authorize(
                    Authorization::SpaceTimePay {
                        order: ctx.this,
                        provider: call.provider,
                        start: call.start,
                        length: call.length,
                        value: call.value,
                        root: call.root,
                        share: call.share.clone(),
                    },
                    &call.signs,
                )?;

                let committed = order.committed()?;
                let end = order.create_date + order.duration;
                let slot = order
                    .providers
                    .iter()
                    .position(|p| p.provider == call.provider && !p.stopped)
                    .ok_or("unknown provider")?;
                if call.start != order.providers[slot].paid_until {
                    return Err(format!(
                        "period starts at {}, provider paid until {}",
                        call.start, order.providers[slot].paid_until
                    ));
                }
                if call.length.is_zero() || call.start + call.length > end {
                    return Err("period outside the order term".into());
                }
                if order.paid + call.value > committed {
                    return Err("payment exceeds committed total".into());
                }
                if call.share.len() != order.keepers.len() + 1
                    || call.share.iter().map(|s| *s as u32).sum::<u32>() != 100
                {
                    return Err("bad share split".into());
                }

                let mut recipients = vec![call.provider];
                recipients.extend(order.keepers.iter().map(|(keeper, _)| *keeper));
                let mut remaining = call.value;
                for (recipient, share) in recipients.iter().zip(&call.share).skip(1) {
                    let cut = call.value * U256::from(*share) / U256::from(100u8);
                    self.transfer(ctx.this, *recipient, cut)?;
                    remaining -= cut;
                }
                self.transfer(ctx.this, call.provider, remaining)?;

                let slot = &mut order.providers[slot];
                slot.paid += call.value;
                slot.paid_until = call.start + call.length;
                order.paid += call.value;
                Ok(false)
            },
            Call::extendTime(call) => {
                order.authorize(
                    Authorization::ExtendTime {
                        order: ctx.this,
                        add_time: call.addTime,
                    },
                    &call.signs,
                )?;
                let required = order.size * call.addTime * order.price;
                if ctx.value < required {
                    return Err(format!("extension needs {required}, got {}", ctx.value));
                }
                order.duration += call.addTime;
                Ok(false)
            },
            Call::setKeeperStop(call) => {
                order.authorize(
                    Authorization::KeeperStop {
                        order: ctx.this,
                        keeper: call.keeper,
                    },
                    &call.signs,
                )?;
                let slot = order
                    .keepers
                    .iter_mut()
                    .find(|(k, stopped)| *k == call.keeper && !stopped)
                    .ok_or("unknown keeper")?;
                slot.1 = true;
                Ok(false)
            },
            Call::setProviderStop(call) => {
                order.authorize(
                    Authorization::ProviderStop {
                        order: ctx.this,
                        provider: call.provider,
                    },
                    &call.signs,
                )?;
                let slot = order
                    .providers
                    .iter_mut()
                    .find(|p| p.provider == call.provider && !p.stopped)
                    .ok_or("unknown provider")?;
                slot.stopped = true;
                Ok(false)
            },
            Call::destruct(_) => {
                if U256::from(ctx.now) < order.create_date + order.duration {
                    return Err("order has not expired".into());
                }
                let balance = self.balance(ctx.this);
                self.transfer(ctx.this, order.user, balance)?;
                Ok(true)
            },
            Call::getOrder(_) | Call::getKeepers(_) | Call::getProviders(_) => Ok(false),
        }
    }

    fn view(
        &mut self,
        to: Address,
        input: &[u8],
    ) -> Result<Vec<u8>, Revert> {
        let Some(contract) = self.contracts.get(&to).cloned() else {
            return Ok(Vec::new());
        };
        let decode_err = |e: alloy::sol_types::Error| format!("bad calldata: {e}");
        let encoded = match contract {
            Contract::Indexer { entries } => {
                match Indexer::IndexerCalls::abi_decode(input, true).map_err(decode_err)? {
                    Indexer::IndexerCalls::get(call) => {
                        let entry = match self.lagging() {
                            true => (Address::ZERO, Address::ZERO),
                            false => entries.get(&call.key).copied().unwrap_or_default(),
                        };
                        Indexer::getCall::abi_encode_returns(&entry)
                    },
                    _ => return Err("not a view".into()),
                }
            },
            Contract::Resolver {
                entries, banned, ..
            } => {
                match Resolver::ResolverCalls::abi_decode(input, true).map_err(decode_err)? {
                    Resolver::ResolverCalls::get(call) => {
                        let mapper = match self.lagging() {
                            true => Address::ZERO,
                            false => entries.get(&call.owner).copied().unwrap_or_default(),
                        };
                        Resolver::getCall::abi_encode_returns(&(mapper,))
                    },
                    Resolver::ResolverCalls::isBanned(call) => {
                        Resolver::isBannedCall::abi_encode_returns(&(banned.contains(&call.owner),))
                    },
                    _ => return Err("not a view".into()),
                }
            },
            Contract::Mapper { addrs, .. } => {
                match Mapper::MapperCalls::abi_decode(input, true).map_err(decode_err)? {
                    Mapper::MapperCalls::get(_) => {
                        let addrs = match self.lagging() {
                            true => Vec::new(),
                            false => addrs,
                        };
                        Mapper::getCall::abi_encode_returns(&(addrs,))
                    },
                    _ => return Err("not a view".into()),
                }
            },
            Contract::Keepers(table) => {
                use KeeperRegistry::KeeperRegistryCalls as Call;
                match Call::abi_decode(input, true).map_err(decode_err)? {
                    Call::getPledgePrice(_) => {
                        KeeperRegistry::getPledgePriceCall::abi_encode_returns(&(table.pledge_price,))
                    },
                    Call::info(call) => {
                        KeeperRegistry::infoCall::abi_encode_returns(&table.info(call.keeper))
                    },
                    Call::getAllAddress(_) => {
                        KeeperRegistry::getAllAddressCall::abi_encode_returns(&(table.addresses,))
                    },
                    _ => return Err("not a view".into()),
                }
            },
            Contract::Providers(table) => {
                use ProviderRegistry::ProviderRegistryCalls as Call;
                match Call::abi_decode(input, true).map_err(decode_err)? {
                    Call::getPledgePrice(_) => {
                        ProviderRegistry::getPledgePriceCall::abi_encode_returns(&(table.pledge_price,))
                    },
                    Call::info(call) => {
                        ProviderRegistry::infoCall::abi_encode_returns(&table.info(call.provider))
                    },
                    Call::getAllAddress(_) => {
                        ProviderRegistry::getAllAddressCall::abi_encode_returns(&(table.addresses,))
                    },
                    _ => return Err("not a view".into()),
                }
            },
            Contract::KpMap { entries, .. } => {
                use KeeperProviderMap::KeeperProviderMapCalls as Call;
                match Call::abi_decode(input, true).map_err(decode_err)? {
                    Call::getProviders(call) => {
                        let providers: Vec<Address> = entries
                            .iter()
                            .find(|e| e.keeper == call.keeper && e.active)
                            .map(|e| {
                                e.providers
                                    .iter()
                                    .filter(|(_, active)| *active)
                                    .map(|(p, _)| *p)
                                    .collect()
                            })
                            .unwrap_or_default();
                        KeeperProviderMap::getProvidersCall::abi_encode_returns(&(providers,))
                    },
                    Call::getKeepers(_) => {
                        let keepers: Vec<Address> = entries
                            .iter()
                            .filter(|e| e.active)
                            .map(|e| e.keeper)
                            .collect();
                        KeeperProviderMap::getKeepersCall::abi_encode_returns(&(keepers,))
                    },
                    _ => return Err("not a view".into()),
                }
            },
            Contract::Channel {
                payer,
                payee,
                expiry,
            } => {
                match Channel::ChannelCalls::abi_decode(input, true).map_err(decode_err)? {
                    Channel::ChannelCalls::getInfo(_) => {
                        Channel::getInfoCall::abi_encode_returns(&(
                            payer,
                            payee,
                            self.balance(to),
                            U256::from(expiry),
                        ))
                    },
                    _ => return Err("not a view".into()),
                }
            },
            Contract::UpKeeping(order) => {
                use UpKeeping::UpKeepingCalls as Call;
                match Call::abi_decode(input, true).map_err(decode_err)? {
                    Call::getOrder(_) => {
                        UpKeeping::getOrderCall::abi_encode_returns(&(
                            order.query,
                            order.user,
                            order.duration,
                            order.size,
                            order.price,
                            order.cycle,
                            order.create_date,
                            order.paid,
                        ))
                    },
                    Call::getKeepers(_) => {
                        let (keepers, stopped): (Vec<Address>, Vec<bool>) =
                            order.keepers.iter().copied().unzip();
                        UpKeeping::getKeepersCall::abi_encode_returns(&(keepers, stopped))
                    },
                    Call::getProviders(_) => {
                        UpKeeping::getProvidersCall::abi_encode_returns(&(
                            order.providers.iter().map(|p| p.provider).collect::<Vec<_>>(),
                            order.providers.iter().map(|p| p.stopped).collect::<Vec<_>>(),
                            order.providers.iter().map(|p| p.paid).collect::<Vec<_>>(),
                            order.providers.iter().map(|p| p.paid_until).collect::<Vec<_>>(),
                        ))
                    },
                    _ => return Err("not a view".into()),
                }
            },
            Contract::Root { roots, .. } => {
                match Root::RootCalls::abi_decode(input, true).map_err(decode_err)? {
                    Root::RootCalls::getRoot(call) => {
                        let root = roots.get(&call.key).copied().unwrap_or_default();
                        Root::getRootCall::abi_encode_returns(&(root,))
                    },
                    Root::RootCalls::getLatest(_) => {
                        let (key, root) = roots
                            .last_key_value()
                            .map(|(k, r)| (*k, *r))
                            .unwrap_or_default();
                        Root::getLatestCall::abi_encode_returns(&(key, root))
                    },
                    _ => return Err("not a view".into()),
                }
            },
            Contract::Destroyed => Vec::new(),
        };
        Ok(encoded)
    }
}

fn construct(
    ctx: &Ctx,
    input: &[u8],
) -> Result<(ContractKind, Contract), Revert> {
    let decode_err = |e: alloy::sol_types::Error| format!("bad constructor arguments: {e}");

    if input.starts_with(RESOLVER_CODE) {
        return Ok((
            ContractKind::Resolver,
            Contract::Resolver {
                admin: ctx.from,
                entries: HashMap::new(),
                banned: HashSet::new(),
            },
        ));
    }
    if input.starts_with(MAPPER_CODE) {
        return Ok((
            ContractKind::Mapper,
            Contract::Mapper {
                owner: ctx.from,
                addrs: Vec::new(),
            },
        ));
    }
    if input.starts_with(ROOT_CODE) {
        return Ok((
            ContractKind::Root,
            Contract::Root {
                owner: ctx.from,
                roots: BTreeMap::new(),
            },
        ));
    }
    if let Some(args) = input.strip_prefix(CHANNEL_CODE) {
        let (payee, duration) =
            <(Address, U256)>::abi_decode_params(args, true).map_err(decode_err)?;
        let expiry = ctx.now.saturating_add(duration.saturating_to::<u64>());
        return Ok((
            ContractKind::Channel,
            Contract::Channel {
                payer: ctx.from,
                payee,
                expiry,
            },
        ));
    }
    if let Some(args) = input.strip_prefix(UPKEEPING_CODE) {
        let (query, keepers, providers, duration, size, price, cycle) =
            <(Address, Vec<Address>, Vec<Address>, U256, U256, U256, U256)>::abi_decode_params(
                args, true,
            )
            .map_err(decode_err)?;
        if keepers.is_empty() || providers.is_empty() {
            return Err("order needs keepers and providers".into());
        }
        if duration.is_zero() || size.is_zero() || price.is_zero() || cycle.is_zero() {
            return Err("order terms must be positive".into());
        }

        let order = Order {
            query,
            user: ctx.from,
            keepers: keepers.into_iter().map(|k| (k, false)).collect(),
            providers: providers
                .into_iter()
                .map(|provider| ProviderSlot {
                    provider,
                    stopped: false,
                    paid: U256::ZERO,
                    paid_until: U256::from(ctx.now),
                })
                .collect(),
            duration,
            size,
            price,
            cycle,
            create_date: U256::from(ctx.now),
            paid: U256::ZERO,
        };
        if ctx.value < order.committed()? {
            return Err("deposit below committed total".into());
        }
        return Ok((ContractKind::UpKeeping, Contract::UpKeeping(Box::new(order))));
    }

    Err("unknown creation code".into())
}

#[async_trait]
impl ChainClient for SimulatedChain {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.chain_id)
    }

    async fn pending_nonce(
        &self,
        account: Address,
    ) -> Result<u64, ChainError> {
        Ok(self
            .state()
            .accounts
            .get(&account)
            .map(|a| a.nonce)
            .unwrap_or_default())
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        let mut state = self.state();
        if state.faults.fail_gas_price > 0 {
            state.faults.fail_gas_price -= 1;
            return Err(ChainError::Transport("gas price unavailable".to_string()));
        }
        Ok(1_000_000_000)
    }

    async fn send_raw_transaction(
        &self,
        tx: &SignedTx,
    ) -> Result<TxHash, ChainError> {
        let mut state = self.state();
        state.submissions += 1;

        if state.faults.reject_sends > 0 {
            state.faults.reject_sends -= 1;
            return Err(ChainError::Rpc {
                code: -32000,
                message: "txpool is full".to_string(),
            });
        }

        let request = &tx.request;
        let account = state
            .accounts
            .get(&request.from)
            .cloned()
            .unwrap_or_default();
        if request.nonce < account.nonce {
            return Err(ChainError::NonceTooLow);
        }
        if request.nonce > account.nonce {
            return Err(ChainError::Rpc {
                code: -32000,
                message: format!("nonce gap: expected {}", account.nonce),
            });
        }
        if account.balance < request.value {
            return Err(ChainError::InsufficientFunds);
        }

        state.mine(tx);

        if state.faults.lose_responses > 0 {
            state.faults.lose_responses -= 1;
            return Err(ChainError::Transport("connection reset by peer".to_string()));
        }
        Ok(tx.hash)
    }

    async fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TxReceipt>, ChainError> {
        let mut state = self.state();
        if state.faults.delay_receipts > 0 {
            state.faults.delay_receipts -= 1;
            return Ok(None);
        }
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn call(
        &self,
        _from: Option<Address>,
        to: Address,
        input: Bytes,
    ) -> Result<Bytes, ChainError> {
        let mut state = self.state();
        if state.faults.fail_reads > 0 {
            state.faults.fail_reads -= 1;
            return Err(ChainError::Transport("read timed out".to_string()));
        }
        state
            .view(to, &input)
            .map(Bytes::from)
            .map_err(ChainError::Execution)
    }

    async fn balance(
        &self,
        account: Address,
    ) -> Result<U256, ChainError> {
        Ok(self.state().balance(account))
    }

    async fn code_at(
        &self,
        account: Address,
    ) -> Result<Bytes, ChainError> {
        Ok(self
            .state()
            .contracts
            .get(&account)
            .map(|c| Bytes::from_static(c.code()))
            .unwrap_or_default())
    }

    async fn latest_timestamp(&self) -> Result<u64, ChainError> {
        Ok(self.state().time)
    }
}

#[cfg(test)]
mod tests {
    use alloy::signers::local::PrivateKeySigner;

    use super::*;
    use crate::chain::TxRequest;
    use crate::tx::TxSigner;

    async fn send(
        chain: &SimulatedChain,
        signer: &TxSigner,
        to: Option<Address>,
        input: Vec<u8>,
    ) -> TxReceipt {
        let nonce = chain.pending_nonce(signer.address()).await.unwrap();
        let signed = signer
            .sign(TxRequest {
                from: signer.address(),
                to,
                input: input.into(),
                value: U256::ZERO,
                nonce,
                gas_price: 1,
                gas_limit: 1_000_000,
            })
            .await
            .unwrap();
        let hash = chain.send_raw_transaction(&signed).await.unwrap();
        chain.transaction_receipt(hash).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_indexer_first_write_wins() {
        let chain = SimulatedChain::new();
        let indexer = chain.install_indexer();
        let first = TxSigner::new(PrivateKeySigner::random(), SIMULATED_CHAIN_ID);
        let second = TxSigner::new(PrivateKeySigner::random(), SIMULATED_CHAIN_ID);

        for (signer, addr) in [(&first, Address::repeat_byte(1)), (&second, Address::repeat_byte(2))] {
            let call = Indexer::addCall {
                key: "query".to_string(),
                addr,
            };
            assert!(send(&chain, signer, Some(indexer), call.abi_encode()).await.success);
        }

        let data = chain
            .call(
                None,
                indexer,
                Indexer::getCall {
                    key: "query".to_string(),
                }
                .abi_encode()
                .into(),
            )
            .await
            .unwrap();
        let entry = Indexer::getCall::abi_decode_returns(&data, true).unwrap();
        assert_eq!(entry.owner, first.address());
        assert_eq!(entry.addr, Address::repeat_byte(1));
    }

    #[tokio::test]
    async fn test_deploy_and_revert_restores_state() {
        let chain = SimulatedChain::new();
        let owner = TxSigner::new(PrivateKeySigner::random(), SIMULATED_CHAIN_ID);
        let stranger = TxSigner::new(PrivateKeySigner::random(), SIMULATED_CHAIN_ID);

        let receipt = send(&chain, &owner, None, MAPPER_CODE.to_vec()).await;
        let mapper = receipt.contract_address.unwrap();
        assert_eq!(mapper, owner.address().create(0));
        assert_eq!(chain.deployments(ContractKind::Mapper), 1);

        let call = Mapper::addCall {
            addr: Address::repeat_byte(7),
        };
        let receipt = send(&chain, &stranger, Some(mapper), call.abi_encode()).await;
        assert!(!receipt.success);
        assert_eq!(chain.landed_nonces(stranger.address()), vec![0]);

        let data = chain
            .call(None, mapper, Mapper::getCall {}.abi_encode().into())
            .await
            .unwrap();
        assert!(Mapper::getCall::abi_decode_returns(&data, true)
            .unwrap()
            .addrs
            .is_empty());
    }

    #[tokio::test]
    async fn test_read_lag_serves_stale_directory() {
        let chain = SimulatedChain::new();
        let indexer = chain.install_indexer();
        let signer = TxSigner::new(PrivateKeySigner::random(), SIMULATED_CHAIN_ID);
        chain.set_read_lag(2);

        let call = Indexer::addCall {
            key: "root".to_string(),
            addr: Address::repeat_byte(3),
        };
        send(&chain, &signer, Some(indexer), call.abi_encode()).await;

        let get: Bytes = Indexer::getCall {
            key: "root".to_string(),
        }
        .abi_encode()
        .into();
        let mut seen = Vec::new();
        for _ in 0..3 {
            let data = chain.call(None, indexer, get.clone()).await.unwrap();
            seen.push(Indexer::getCall::abi_decode_returns(&data, true).unwrap().addr);
        }
        assert_eq!(
            seen,
            vec![Address::ZERO, Address::ZERO, Address::repeat_byte(3)]
        );
    }

    #[tokio::test]
    async fn test_unknown_creation_code_reverts() {
        let chain = SimulatedChain::new();
        let signer = TxSigner::new(PrivateKeySigner::random(), SIMULATED_CHAIN_ID);

        let receipt = send(&chain, &signer, None, b"not a contract".to_vec()).await;

        assert!(!receipt.success);
        assert!(receipt.contract_address.is_none());
    }
}
