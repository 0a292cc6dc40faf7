//! Access to the raw blocks a settlement's Merkle root commits to.

use std::collections::HashMap;
use std::path::PathBuf;

use alloy::primitives::Bytes;
use alloy::primitives::B256;
use async_trait::async_trait;
use tracing::debug;

use crate::merkle::merkle_root_of;
use crate::ContractError;

/// Read-only view of the storage node's block store.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn get_block(
        &self,
        id: &str,
    ) -> Result<Bytes, ContractError>;
}

/// Fetch every block in `ids`, in order, and return their Merkle root.
pub async fn proof_root(
    source: &dyn BlockSource,
    ids: &[String],
) -> Result<B256, ContractError> {
    if ids.is_empty() {
        return Err(ContractError::ProofUnavailable {
            id: String::new(),
            reason: "no blocks to prove".to_string(),
        });
    }

    let mut blobs = Vec::with_capacity(ids.len());
    for id in ids {
        blobs.push(source.get_block(id).await?);
    }
    let root = merkle_root_of(&blobs);
    debug!("computed proof root {} over {} blocks", root, ids.len());
    Ok(root)
}

/// Blocks stored one file per id under a directory.
#[derive(Clone, Debug)]
pub struct DirBlockSource {
    dir: PathBuf,
}

impl DirBlockSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl BlockSource for DirBlockSource {
    async fn get_block(
        &self,
        id: &str,
    ) -> Result<Bytes, ContractError> {
        if id.is_empty() || id.contains(|c: char| c == '/' || c == '\\') || id == ".." {
            return Err(ContractError::ProofUnavailable {
                id: id.to_string(),
                reason: "invalid block id".to_string(),
            });
        }
        tokio::fs::read(self.dir.join(id))
            .await
            .map(Bytes::from)
            .map_err(|e| {
                ContractError::ProofUnavailable {
                    id: id.to_string(),
                    reason: e.to_string(),
                }
            })
    }
}

/// Blocks held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryBlockSource {
    blocks: HashMap<String, Bytes>,
}

impl MemoryBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        id: impl Into<String>,
        block: impl Into<Bytes>,
    ) {
        self.blocks.insert(id.into(), block.into());
    }
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    async fn get_block(
        &self,
        id: &str,
    ) -> Result<Bytes, ContractError> {
        self.blocks.get(id).cloned().ok_or_else(|| {
            ContractError::ProofUnavailable {
                id: id.to_string(),
                reason: "block not stored".to_string(),
            }
        })
    }
}
