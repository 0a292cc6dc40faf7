use std::sync::Arc;

use alloy::primitives::Address;
use alloy::primitives::B256;
use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use mefs_auth::Authorization;
use mefs_auth::PaymentVoucher;
use mefs_contracts::bindings::UpKeeping;
use mefs_contracts::chain::simulated::ContractKind;
use mefs_contracts::chain::SimulatedChain;
use mefs_contracts::proofs::MemoryBlockSource;
use mefs_contracts::tx::CallDescriptor;
use mefs_contracts::upkeeping::default_share;
use mefs_contracts::ContractError;
use mefs_contracts::DirectoryResolver;
use mefs_contracts::GasPolicy;
use mefs_contracts::Ledger;
use mefs_contracts::MerkleRoots;
use mefs_contracts::OrderTerms;
use mefs_contracts::PaymentChannels;
use mefs_contracts::Role;
use mefs_contracts::RoleRegistry;
use mefs_contracts::TxSigner;
use mefs_contracts::UpkeepingOrders;

struct Network {
    chain: Arc<SimulatedChain>,
    directory: DirectoryResolver,
}

impl Network {
    fn new(policy: GasPolicy) -> Self {
        let chain = Arc::new(SimulatedChain::new());
        let indexer = chain.install_indexer();
        let ledger = Ledger::new(chain.clone(), policy);
        let directory = DirectoryResolver::new(ledger, indexer, SimulatedChain::artifacts());
        Self { chain, directory }
    }

    fn account(&self) -> TxSigner {
        let signer = TxSigner::new(PrivateKeySigner::random(), self.chain.chain_id_value());
        self.chain.fund(signer.address(), U256::from(10_000_000u64));
        signer
    }
}

#[tokio::test(start_paused = true)]
async fn provider_directory_resolves_without_second_deploy() -> anyhow::Result<()> {
    let network = Network::new(GasPolicy::default());
    let owner = network.account();
    let published = Address::repeat_byte(0xaa);

    network
        .directory
        .publish("provider", &owner, published)
        .await?;
    let deployed = network.chain.deployments(ContractKind::Resolver)
        + network.chain.deployments(ContractKind::Mapper);
    let submissions = network.chain.submissions();

    network
        .directory
        .resolve_or_deploy("provider", owner.address(), &owner, true)
        .await?;
    let latest = network.directory.latest("provider", owner.address()).await?;

    assert_eq!(latest, Some(published));
    assert_eq!(deployed, 2);
    assert_eq!(
        network.chain.deployments(ContractKind::Resolver)
            + network.chain.deployments(ContractKind::Mapper),
        2
    );
    assert_eq!(network.chain.submissions(), submissions);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn nonce_too_low_after_escalation_stops_submitting() -> anyhow::Result<()> {
    let network = Network::new(GasPolicy::default());
    let sender = network.account();
    let recipient = Address::repeat_byte(0x42);
    // The first send is mined, but the node's answer never arrives. The
    // replacement at a higher price then bounces with "nonce too low".
    network.chain.lose_responses(1);

    let receipt = network
        .directory
        .ledger()
        .transact(
            &sender,
            CallDescriptor {
                method: "transfer",
                to: Some(recipient),
                input: Default::default(),
                value: U256::from(7u64),
            },
        )
        .await?;

    assert!(receipt.success);
    assert_eq!(network.chain.submissions(), 2);
    assert_eq!(network.chain.landed_nonces(sender.address()), vec![0]);
    assert_eq!(network.chain.balance_of(recipient), U256::from(7u64));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn closed_channel_pays_voucher_and_is_terminal() -> anyhow::Result<()> {
    let network = Network::new(GasPolicy::default());
    let channels = PaymentChannels::new(network.directory.clone());
    let payer = network.account();
    let payee = network.account();

    let channel = channels
        .open(&payer, payee.address(), 3_600, U256::from(1_000u64))
        .await?;
    let voucher = PaymentVoucher::sign(payer.key(), channel, U256::from(400u64))?;
    let before = network.chain.balance_of(payee.address());

    channels.close(&payee, &voucher).await?;

    assert_eq!(
        network.chain.balance_of(payee.address()),
        before + U256::from(400u64)
    );
    assert!(matches!(
        channels.close(&payee, &voucher).await,
        Err(ContractError::ChannelClosed(_))
    ));
    network.chain.advance_time(7_200);
    assert!(matches!(
        channels.timeout(&payer, channel).await,
        Err(ContractError::ChannelClosed(_))
    ));
    Ok(())
}

struct Deal {
    network: Network,
    orders: UpkeepingOrders,
    user: TxSigner,
    keepers: Vec<PrivateKeySigner>,
    provider: Address,
    order: Address,
}

async fn deal() -> anyhow::Result<Deal> {
    let network = Network::new(GasPolicy::default());
    let orders = UpkeepingOrders::new(network.directory.clone());
    let user = network.account();
    let keepers: Vec<_> = (0..4).map(|_| PrivateKeySigner::random()).collect();
    let provider = Address::repeat_byte(0xaa);

    let order = orders
        .deploy(
            &user,
            &OrderTerms {
                query: Address::repeat_byte(0x51),
                keepers: keepers.iter().map(|k| k.address()).collect(),
                providers: vec![provider],
                duration: 300,
                size: U256::from(5u64),
                price: U256::from(3u64),
                cycle: 100,
                prepaid: U256::from(4_500u64),
            },
        )
        .await?;

    Ok(Deal {
        network,
        orders,
        user,
        keepers,
        provider,
        order,
    })
}

fn cosign(
    authorization: &Authorization,
    keepers: &[PrivateKeySigner],
) -> Vec<alloy::primitives::Bytes> {
    keepers
        .iter()
        .map(|k| authorization.sign(k).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn cumulative_paid_never_exceeds_commitment() -> anyhow::Result<()> {
    let Deal {
        network,
        orders,
        user,
        keepers,
        provider,
        order,
    } = deal().await?;
    let mut source = MemoryBlockSource::new();
    source.insert("proof", b"sealed sector".to_vec());
    let ids = vec!["proof".to_string()];

    // Three full cycles use up the commitment exactly.
    for _ in 0..3 {
        let proposal = orders
            .propose_settlement(order, provider, None, &source, &ids, None)
            .await?;
        orders
            .space_time_pay(&user, &proposal, &cosign(&proposal, &keepers[..3]))
            .await?;
    }
    let info = orders.info(order).await?;
    assert_eq!(info.paid, info.committed());

    // Nothing is left to propose.
    assert!(matches!(
        orders
            .propose_settlement(order, provider, None, &source, &ids, None)
            .await,
        Err(ContractError::InvalidOrder(_))
    ));

    // A hand-made payment past the commitment is refused.
    let over = Authorization::SpaceTimePay {
        order,
        provider,
        start: U256::from(info.end()),
        length: U256::from(1u64),
        value: U256::from(1u64),
        root: B256::repeat_byte(1),
        share: default_share(keepers.len()),
    };
    assert!(orders
        .space_time_pay(&user, &over, &cosign(&over, &keepers))
        .await
        .is_err());
    assert_eq!(orders.info(order).await?.paid, info.committed());
    assert_eq!(network.chain.balance_of(order), U256::ZERO);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn replayed_space_time_pay_is_rejected() -> anyhow::Result<()> {
    let Deal {
        network,
        orders,
        user,
        keepers,
        provider,
        order,
    } = deal().await?;
    let mut source = MemoryBlockSource::new();
    source.insert("p0", b"first".to_vec());
    source.insert("p1", b"second".to_vec());
    let ids = vec!["p0".to_string(), "p1".to_string()];

    let proposal = orders
        .propose_settlement(order, provider, None, &source, &ids, None)
        .await?;
    let signatures = cosign(&proposal, &keepers[..3]);
    orders.space_time_pay(&user, &proposal, &signatures).await?;
    let paid = orders.info(order).await?.paid;
    let provider_balance = network.chain.balance_of(provider);

    // Through the client the replay never leaves the process.
    let submissions = network.chain.submissions();
    assert!(matches!(
        orders.space_time_pay(&user, &proposal, &signatures).await,
        Err(ContractError::AlreadySettled { .. })
    ));
    assert_eq!(network.chain.submissions(), submissions);

    // Sent raw, the contract reverts it.
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
    let replay = CallDescriptor::call(
        order,
        &UpKeeping::spaceTimePayCall {
            provider,
            start,
            length,
            value,
            root,
            share,
            signs: signatures,
        },
    );
    assert!(network.directory.ledger().transact(&user, replay).await.is_err());

    assert_eq!(orders.info(order).await?.paid, paid);
    assert_eq!(network.chain.balance_of(provider), provider_balance);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn latest_merkle_root_has_highest_key() -> anyhow::Result<()> {
    let network = Network::new(GasPolicy::default());
    let roots = MerkleRoots::new(network.directory.clone());
    let owner = network.account();
    let contract = roots.deploy(&owner).await?;

    assert!(matches!(
        roots.latest(contract).await,
        Err(ContractError::MerkleRootNotFound(None))
    ));
    for key in [20, 40, 30] {
        roots
            .set_root(&owner, contract, key, B256::repeat_byte(key as u8))
            .await?;
    }

    assert_eq!(roots.latest(contract).await?, (40, B256::repeat_byte(40)));
    assert_eq!(roots.find(owner.address()).await?, contract);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unauthorized_ban_sends_nothing() -> anyhow::Result<()> {
    let network = Network::new(GasPolicy::default());
    let admin = network.account();
    let stranger = network.account();
    let provider = network.account();
    network.chain.install_role_contracts(admin.address());
    let registry = RoleRegistry::new(network.directory.clone());
    let submissions = network.chain.submissions();

    let result = registry
        .set_banned(&stranger, Role::Provider, provider.address(), true)
        .await;

    assert!(matches!(result, Err(ContractError::Unauthorized { .. })));
    assert_eq!(network.chain.submissions(), submissions);

    registry
        .set_banned(&admin, Role::Provider, provider.address(), true)
        .await?;
    assert!(
        registry
            .get_info(Role::Provider, provider.address())
            .await?
            .banned
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn publish_tolerates_lagging_reads() -> anyhow::Result<()> {
    let network = Network::new(GasPolicy::default());
    let owner = network.account();
    network.chain.set_read_lag(4);

    network
        .directory
        .publish("query", &owner, Address::repeat_byte(0x0b))
        .await?;

    network.chain.set_read_lag(0);
    assert_eq!(
        network.directory.history("query", owner.address()).await?,
        vec![Address::repeat_byte(0x0b)]
    );
    Ok(())
}
