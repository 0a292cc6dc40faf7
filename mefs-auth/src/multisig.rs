//! Keeper co-signatures for upkeeping orders.
//!
//! Every change to a live order (adding providers, paying for a period,
//! extending the term, stopping a participant) must carry signatures from a
//! quorum of the order's keepers over a digest of the change.

use std::collections::BTreeMap;

use alloy::primitives::keccak256;
use alloy::primitives::Address;
use alloy::primitives::Bytes;
use alloy::primitives::B256;
use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolValue;

use crate::recover_signer;
use crate::sign_digest;
use crate::SignatureError;

/// Number of distinct keeper signatures needed out of `keepers` live keepers.
pub fn quorum(keepers: usize) -> usize {
    keepers / 2 + 1
}

/// A change to an order that needs keeper authorization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Authorization {
    AddProvider {
        order: Address,
        providers: Vec<Address>,
    },
    SpaceTimePay {
        order: Address,
        provider: Address,
        start: U256,
        length: U256,
        value: U256,
        root: B256,
        share: Vec<u8>,
    },
    ExtendTime {
        order: Address,
        add_time: U256,
    },
    KeeperStop {
        order: Address,
        keeper: Address,
    },
    ProviderStop {
        order: Address,
        provider: Address,
    },
}

impl Authorization {
    /// `keccak256(abi.encodePacked(tag, order, ...))`; the tag keeps digests of
    /// different operations apart.
    pub fn digest(&self) -> B256 {
        let packed = match self {
            Authorization::AddProvider { order, providers } => {
                ("addProvider".to_string(), *order, providers.clone()).abi_encode_packed()
            },
            Authorization::SpaceTimePay {
                order,
                provider,
                start,
                length,
                value,
                root,
                share,
            } => {
                (
                    "spaceTimePay".to_string(),
                    *order,
                    *provider,
                    *start,
                    *length,
                    *value,
                    *root,
                    Bytes::from(share.clone()),
                )
                    .abi_encode_packed()
            },
            Authorization::ExtendTime { order, add_time } => {
                ("extendTime".to_string(), *order, *add_time).abi_encode_packed()
            },
            Authorization::KeeperStop { order, keeper } => {
                ("setKeeperStop".to_string(), *order, *keeper).abi_encode_packed()
            },
            Authorization::ProviderStop { order, provider } => {
                ("setProviderStop".to_string(), *order, *provider).abi_encode_packed()
            },
        };
        keccak256(packed)
    }

    pub fn sign(
        &self,
        keeper: &PrivateKeySigner,
    ) -> Result<Bytes, SignatureError> {
        sign_digest(keeper, self.digest())
    }
}

/// Gathers keeper signatures for one digest until quorum is reached.
#[derive(Debug, Clone)]
pub struct SignatureCollector {
    digest: B256,
    keepers: Vec<Address>,
    collected: BTreeMap<Address, Bytes>,
}

impl SignatureCollector {
    /// `keepers` are the live (not stopped) keepers of the order.
    pub fn new(
        authorization: &Authorization,
        keepers: Vec<Address>,
    ) -> Self {
        Self {
            digest: authorization.digest(),
            keepers,
            collected: BTreeMap::new(),
        }
    }

    pub fn digest(&self) -> B256 {
        self.digest
    }

    pub fn quorum(&self) -> usize {
        quorum(self.keepers.len())
    }

    /// Verify and record one keeper signature. Returns the keeper address.
    pub fn add(
        &mut self,
        signature: Bytes,
    ) -> Result<Address, SignatureError> {
        let keeper = recover_signer(self.digest, &signature)?;
        if !self.keepers.contains(&keeper) {
            return Err(SignatureError::NotKeeper(keeper));
        }
        if self.collected.contains_key(&keeper) {
            return Err(SignatureError::Duplicate(keeper));
        }
        self.collected.insert(keeper, signature);
        Ok(keeper)
    }

    pub fn is_complete(&self) -> bool {
        self.collected.len() >= self.quorum()
    }

    /// The collected signatures, ordered as the keepers are listed on the order.
    pub fn finish(self) -> Result<Vec<Bytes>, SignatureError> {
        if !self.is_complete() {
            return Err(SignatureError::BelowQuorum {
                have: self.collected.len(),
                need: self.quorum(),
            });
        }
        let mut collected = self.collected;
        Ok(self
            .keepers
            .iter()
            .filter_map(|keeper| collected.remove(keeper))
            .collect())
    }
}

/// Check `signatures` hold a quorum of distinct `keepers` over `digest`.
///
/// This is the same rule the order contract applies on chain.
pub fn verify_quorum(
    digest: B256,
    keepers: &[Address],
    signatures: &[Bytes],
) -> Result<(), SignatureError> {
    let mut seen = Vec::with_capacity(signatures.len());
    for signature in signatures {
        let keeper = recover_signer(digest, signature)?;
        if !keepers.contains(&keeper) {
            return Err(SignatureError::NotKeeper(keeper));
        }
        if seen.contains(&keeper) {
            return Err(SignatureError::Duplicate(keeper));
        }
        seen.push(keeper);
    }

    let need = quorum(keepers.len());
    if seen.len() < need {
        return Err(SignatureError::BelowQuorum {
            have: seen.len(),
            need,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use alloy::primitives::address;

    use super::*;

    const ORDER: Address = address!("00000000000000000000000000000000000000c0");

    fn keepers(n: usize) -> Vec<PrivateKeySigner> {
        (0..n).map(|_| PrivateKeySigner::random()).collect()
    }

    #[test]
    fn test_quorum() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
    }

    #[test]
    fn test_digests_differ_per_operation() {
        let who = address!("00000000000000000000000000000000000000b1");
        let keeper_stop = Authorization::KeeperStop {
            order: ORDER,
            keeper: who,
        };
        let provider_stop = Authorization::ProviderStop {
            order: ORDER,
            provider: who,
        };
        assert_ne!(keeper_stop.digest(), provider_stop.digest());
    }

    #[test]
    fn test_collector_reaches_quorum() -> anyhow::Result<()> {
        let signers = keepers(3);
        let addresses: Vec<_> = signers.iter().map(|s| s.address()).collect();
        let auth = Authorization::ExtendTime {
            order: ORDER,
            add_time: U256::from(3600u64),
        };

        let mut collector = SignatureCollector::new(&auth, addresses.clone());
        collector.add(auth.sign(&signers[2])?)?;
        assert!(!collector.is_complete());

        assert!(matches!(
            collector.add(auth.sign(&signers[2])?),
            Err(SignatureError::Duplicate(_))
        ));
        assert!(matches!(
            collector.add(auth.sign(&PrivateKeySigner::random())?),
            Err(SignatureError::NotKeeper(_))
        ));

        collector.add(auth.sign(&signers[0])?)?;
        assert!(collector.is_complete());

        let signatures = collector.finish()?;
        assert_eq!(signatures.len(), 2);
        verify_quorum(auth.digest(), &addresses, &signatures)?;

        Ok(())
    }

    #[test]
    fn test_verify_quorum_rejects_short_set() -> anyhow::Result<()> {
        let signers = keepers(4);
        let addresses: Vec<_> = signers.iter().map(|s| s.address()).collect();
        let auth = Authorization::KeeperStop {
            order: ORDER,
            keeper: addresses[3],
        };
        let signatures = vec![auth.sign(&signers[0])?, auth.sign(&signers[1])?];

        assert!(matches!(
            verify_quorum(auth.digest(), &addresses, &signatures),
            Err(SignatureError::BelowQuorum { have: 2, need: 3 })
        ));

        Ok(())
    }
}
