use std::env;
use std::fs;
use std::sync::Arc;

use alloy::primitives::Address;
use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use mefs_contracts::chain::SimulatedChain;
use mefs_contracts::proofs::DirBlockSource;
use mefs_contracts::DirectoryResolver;
use mefs_contracts::GasPolicy;
use mefs_contracts::Ledger;
use mefs_contracts::OrderTerms;
use mefs_contracts::TxSigner;
use mefs_worker::context::Settlement;
use mefs_worker::proposal::SettlementProposal;

fn participant(
    chain: &Arc<SimulatedChain>,
    directory: &DirectoryResolver,
) -> Settlement {
    let signer = TxSigner::new(PrivateKeySigner::random(), chain.chain_id_value());
    chain.fund(signer.address(), U256::from(1_000_000u64));
    Settlement::new(signer, directory.clone())
}

#[tokio::test(start_paused = true)]
async fn keepers_cosign_a_proposal_file() -> anyhow::Result<()> {
    let chain = Arc::new(SimulatedChain::new());
    let indexer = chain.install_indexer();
    let ledger = Ledger::new(chain.clone(), GasPolicy::default());
    let directory = DirectoryResolver::new(ledger, indexer, SimulatedChain::artifacts());

    let user = participant(&chain, &directory);
    let keepers: Vec<_> = (0..3).map(|_| participant(&chain, &directory)).collect();
    let provider = Address::repeat_byte(0xaa);

    let order = user
        .orders()
        .deploy(
            user.signer(),
            &OrderTerms {
                query: Address::repeat_byte(0x77),
                keepers: keepers.iter().map(|k| k.signer().address()).collect(),
                providers: vec![provider],
                duration: 200,
                size: U256::from(4u64),
                price: U256::from(5u64),
                cycle: 100,
                prepaid: U256::from(4_000u64),
            },
        )
        .await?;

    let work = env::temp_dir().join(format!("mefs-flow-{}", std::process::id()));
    let blocks = work.join("blocks");
    fs::create_dir_all(&blocks)?;
    fs::write(blocks.join("sector-1"), b"sector one")?;
    let proposal_path = work.join("proposal.json");

    // The first keeper proposes and signs.
    let authorization = keepers[0]
        .orders()
        .propose_settlement(
            order,
            provider,
            None,
            &DirBlockSource::new(blocks.clone()),
            &["sector-1".to_string()],
            None,
        )
        .await?;
    let mut proposal = SettlementProposal::try_from(authorization.clone())?;
    proposal.add_signature(authorization.sign(keepers[0].signer().key())?);
    proposal.write(&proposal_path)?;

    // A second keeper recomputes the payment, co-signs the file and submits.
    let mut proposal = SettlementProposal::read(&proposal_path)?;
    keepers[1]
        .orders()
        .check_proposal(
            keepers[1].signer().address(),
            &proposal.authorization(),
            &DirBlockSource::new(blocks.clone()),
            &["sector-1".to_string()],
            None,
        )
        .await?;
    proposal.add_signature(proposal.authorization().sign(keepers[1].signer().key())?);
    proposal.write(&proposal_path)?;
    let proposal = SettlementProposal::read(&proposal_path)?;
    assert_eq!(proposal.signatures.len(), 2);

    keepers[1]
        .orders()
        .space_time_pay(
            keepers[1].signer(),
            &proposal.authorization(),
            &proposal.signatures,
        )
        .await?;

    let info = user.orders().info(order).await?;
    assert_eq!(info.paid, U256::from(2_000u64));
    assert_eq!(info.providers[0].paid_until, info.create_date + 100);
    fs::remove_dir_all(&work)?;
    Ok(())
}
