//! A space-time payment as passed between keepers: one proposes, each
//! co-signs, any one submits.

use std::fs;
use std::path::Path;

use alloy::primitives::Address;
use alloy::primitives::Bytes;
use alloy::primitives::B256;
use alloy::primitives::U256;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use mefs_auth::Authorization;
use serde_derive::Deserialize;
use serde_derive::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementProposal {
    pub order: Address,
    pub provider: Address,
    pub start: U256,
    pub length: U256,
    pub value: U256,
    pub root: B256,
    pub share: Vec<u8>,
    /// Keeper signatures gathered so far.
    #[serde(default)]
    pub signatures: Vec<Bytes>,
}

impl SettlementProposal {
    pub fn authorization(&self) -> Authorization {
        Authorization::SpaceTimePay {
            order: self.order,
            provider: self.provider,
            start: self.start,
            length: self.length,
            value: self.value,
            root: self.root,
            share: self.share.clone(),
        }
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read(path).with_context(|| format!("reading `{}`", path.display()))?;
        serde_json::from_slice(&json).with_context(|| format!("parsing `{}`", path.display()))
    }

    pub fn write(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("writing `{}`", path.display()))
    }

    /// Add a signature unless it is already present.
    pub fn add_signature(
        &mut self,
        signature: Bytes,
    ) {
        if !self.signatures.contains(&signature) {
            self.signatures.push(signature);
        }
    }
}

impl TryFrom<Authorization> for SettlementProposal {
    type Error = anyhow::Error;

    fn try_from(authorization: Authorization) -> Result<Self> {
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
            bail!("not a space-time payment");
        };
        Ok(Self {
            order,
            provider,
            start,
            length,
            value,
            root,
            share,
            signatures: Vec::new(),
        })
    }
}
