use std::fs;
use std::path::Path;

use alloy::primitives::Bytes;
use tracing::debug;

use crate::ContractError;

/// Creation bytecode of the contracts this client deploys itself. Role
/// registries and the indexer are deployed out of band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractArtifacts {
    pub resolver: Bytes,
    pub mapper: Bytes,
    pub upkeeping: Bytes,
    pub channel: Bytes,
    pub root: Bytes,
}

impl ContractArtifacts {
    /// Read `<Name>.hex` files (optionally `0x` prefixed) from `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ContractError> {
        let dir = dir.as_ref();
        Ok(Self {
            resolver: read_artifact(dir, "Resolver")?,
            mapper: read_artifact(dir, "Mapper")?,
            upkeeping: read_artifact(dir, "UpKeeping")?,
            channel: read_artifact(dir, "Channel")?,
            root: read_artifact(dir, "Root")?,
        })
    }
}

fn read_artifact(
    dir: &Path,
    name: &str,
) -> Result<Bytes, ContractError> {
    let path = dir.join(format!("{name}.hex"));
    let text = fs::read_to_string(&path)
        .map_err(|e| ContractError::Artifacts(format!("reading {}: {e}", path.display())))?;
    let code = decode_hex(&text)
        .map_err(|e| ContractError::Artifacts(format!("decoding {}: {e}", path.display())))?;
    if code.is_empty() {
        return Err(ContractError::Artifacts(format!(
            "{} holds no bytecode",
            path.display()
        )));
    }

    debug!("loaded {} artifact, {} bytes", name, code.len());
    Ok(code.into())
}

fn decode_hex(text: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let text = text.trim();
    hex::decode(text.strip_prefix("0x").unwrap_or(text))
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = env::temp_dir().join(format!("mefs-artifacts-{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_load_artifacts() {
        let dir = scratch_dir("ok");
        for name in ["Resolver", "Mapper", "UpKeeping", "Channel", "Root"] {
            fs::write(dir.join(format!("{name}.hex")), "0x6080\n").unwrap();
        }

        let artifacts = ContractArtifacts::load(&dir).unwrap();
        assert_eq!(artifacts.channel.as_ref(), &[0x60, 0x80]);

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_missing_artifact() {
        let dir = scratch_dir("missing");
        fs::write(dir.join("Resolver.hex"), "6080").unwrap();

        assert!(matches!(
            ContractArtifacts::load(&dir),
            Err(ContractError::Artifacts(_))
        ));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_bad_hex() {
        assert!(decode_hex("0xzz").is_err());
        assert_eq!(decode_hex(" 0a0b ").unwrap(), vec![0x0a, 0x0b]);
    }
}
