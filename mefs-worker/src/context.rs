use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use mefs_contracts::chain::ChainClient;
use mefs_contracts::chain::RpcChainClient;
use mefs_contracts::ContractArtifacts;
use mefs_contracts::DirectoryResolver;
use mefs_contracts::Ledger;
use mefs_contracts::MerkleRoots;
use mefs_contracts::PaymentChannels;
use mefs_contracts::RoleRegistry;
use mefs_contracts::TxSigner;
use mefs_contracts::UpkeepingOrders;
use tracing::info;

use crate::config::Config;
use crate::keys::load_signer;

/// Everything a command needs: who signs, and how to reach the contracts.
#[derive(Clone)]
pub struct Settlement {
    signer: TxSigner,
    directory: DirectoryResolver,
}

impl Settlement {
    /// Connect to the configured node and load the signer and artifacts.
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = Arc::new(
            RpcChainClient::connect(&config.chain.rpc_url).context("connecting to the node")?,
        );
        let chain_id = client.chain_id().await.context("fetching chain id")?;
        if let Some(expected) = config.chain.chain_id {
            if expected != chain_id {
                bail!("node reports chain id {chain_id}, configured {expected}");
            }
        }
        info!("connected to {}. chain_id: {}", config.chain.rpc_url, chain_id);

        let signer = load_signer(&config.signer, chain_id).context("loading signer")?;
        let artifacts = ContractArtifacts::load(&config.artifacts.dir)
            .with_context(|| format!("loading artifacts from `{}`", config.artifacts.dir))?;
        let ledger = Ledger::new(client, config.gas.clone());
        let directory = DirectoryResolver::new(ledger, config.chain.indexer()?, artifacts);
        Ok(Self::new(signer, directory))
    }

    pub fn new(
        signer: TxSigner,
        directory: DirectoryResolver,
    ) -> Self {
        Self { signer, directory }
    }

    pub fn signer(&self) -> &TxSigner {
        &self.signer
    }

    pub fn ledger(&self) -> &Ledger {
        self.directory.ledger()
    }

    pub fn client(&self) -> &Arc<dyn ChainClient> {
        self.directory.ledger().client()
    }

    pub fn directory(&self) -> &DirectoryResolver {
        &self.directory
    }

    pub fn roles(&self) -> RoleRegistry {
        RoleRegistry::new(self.directory.clone())
    }

    pub fn channels(&self) -> PaymentChannels {
        PaymentChannels::new(self.directory.clone())
    }

    pub fn orders(&self) -> UpkeepingOrders {
        UpkeepingOrders::new(self.directory.clone())
    }

    pub fn roots(&self) -> MerkleRoots {
        MerkleRoots::new(self.directory.clone())
    }
}
