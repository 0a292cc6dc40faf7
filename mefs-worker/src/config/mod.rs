use alloy::primitives::Address;
use anyhow::Context;
use config::FileFormat;
use lazy_static_include::*;
use mefs_contracts::GasPolicy;
use redact::Secret;
use serde_derive::Deserialize;
use tracing::debug;

lazy_static_include_str! {
    DEFAULT_CONFIG => "src/config/default.toml",
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub chain: ChainConfig,
    #[serde(default)]
    pub signer: SignerConfig,
    pub gas: GasPolicy,
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// Well-known address of the root directory contract.
    pub indexer_address: String,
    /// When set, the node must report this chain id.
    pub chain_id: Option<u64>,
}

impl ChainConfig {
    pub fn validate(&self) {
        assert!(!self.rpc_url.is_empty(), "RPC URL is required");
        assert!(
            !self.indexer_address.is_empty(),
            "Indexer address is required"
        );
    }

    pub fn indexer(&self) -> anyhow::Result<Address> {
        self.indexer_address
            .parse()
            .with_context(|| format!("parsing indexer address `{}`", self.indexer_address))
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SignerConfig {
    pub private_key: Option<Secret<String>>,
    pub keystore: Option<String>,
    pub password: Option<Secret<String>>,
}

impl SignerConfig {
    pub fn validate(&self) {
        match (&self.keystore, &self.password, &self.private_key) {
            (Some(path), _, None) => {
                assert!(!path.is_empty(), "Keystore path is empty");
            },
            (None, _, Some(key)) => {
                assert!(!key.expose_secret().is_empty(), "Private key value is empty");
            },
            (Some(_), _, Some(_)) => {
                panic!("Set either a private key or a keystore, not both")
            },
            (None, _, None) => (),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ArtifactsConfig {
    /// Holds `Resolver.hex`, `Mapper.hex`, `UpKeeping.hex`, `Channel.hex`
    /// and `Root.hex`.
    pub dir: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PrometheusConfig {
    pub port: Option<u16>,
}

impl Config {
    pub fn load(local_file: Option<String>) -> anyhow::Result<Config> {
        let mut config_builder = config::Config::builder();
        config_builder =
            config_builder.add_source(config::File::from_str(&DEFAULT_CONFIG, FileFormat::Toml));

        if let Some(local_file) = local_file {
            debug!("Loading local configuration from {}", local_file);
            config_builder = config_builder.add_source(config::File::with_name(&local_file));
        }

        config_builder
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .ignore_empty(true),
            )
            .build()
            .context("loading configuration")?
            .try_deserialize()
            .context("deserializing configuration")
    }

    pub fn validate(&self) {
        self.chain.validate();
        self.signer.validate();
        assert!(!self.artifacts.dir.is_empty(), "Artifacts directory is required");
        assert!(
            self.gas.gas_limit > 0,
            "Gas limit must be positive"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_gas_policy() {
        let config = Config::load(None).unwrap();

        assert_eq!(config.gas, GasPolicy::default());
        assert_eq!(config.chain.chain_id, None);
        assert!(config.signer.private_key.is_none());
        assert!(config.prometheus.port.is_none());
    }

    #[test]
    #[should_panic(expected = "Indexer address is required")]
    fn test_indexer_is_required() {
        Config::load(None).unwrap().validate();
    }

    #[test]
    fn test_indexer_parses() {
        let chain = ChainConfig {
            rpc_url: "http://localhost:8545".into(),
            indexer_address: "0x00000000000000000000000000000000000000aa".into(),
            chain_id: Some(1337),
        };
        chain.validate();
        assert_eq!(chain.indexer().unwrap(), Address::with_last_byte(0xaa));
    }
}
