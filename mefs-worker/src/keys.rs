use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use alloy::signers::local::PrivateKeySigner;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use mefs_contracts::TxSigner;
use rand::thread_rng;
use redact::Secret;
use tracing::info;

use crate::config::SignerConfig;

/// Consulted for a keystore password the config does not carry.
pub const PASSWORD_ENV_VAR: &str = "SIGNER__PASSWORD";

/// Asks the operator for a password, given a prompt.
pub type Prompt<'a> = &'a mut dyn FnMut(&str) -> Result<String>;

/// Prompt on the terminal without echoing.
pub fn terminal_prompt(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).context("reading password from the terminal")
}

/// Password unlocking `keystore`: the configured one, then
/// [`PASSWORD_ENV_VAR`], then the operator.
pub fn keystore_password(
    configured: Option<&Secret<String>>,
    keystore: &str,
    prompt: Prompt<'_>,
) -> Result<String> {
    if let Some(password) = configured {
        return Ok(password.expose_secret().clone());
    }
    match env::var(PASSWORD_ENV_VAR) {
        Ok(password) if !password.is_empty() => Ok(password),
        _ => prompt(&format!("Password for keystore `{keystore}`: ")),
    }
}

/// Password for a keystore about to be created. Taken from
/// [`PASSWORD_ENV_VAR`] when set, otherwise typed twice.
pub fn new_keystore_password(
    keystore: &str,
    prompt: Prompt<'_>,
) -> Result<String> {
    if let Ok(password) = env::var(PASSWORD_ENV_VAR) {
        if !password.is_empty() {
            return Ok(password);
        }
    }
    let password = prompt(&format!("New password for `{keystore}`: "))?;
    if password.is_empty() {
        bail!("refusing to encrypt `{keystore}` with an empty password");
    }
    if prompt("Repeat the password: ")? != password {
        bail!("passwords for `{keystore}` do not match");
    }
    Ok(password)
}

/// Decrypt a JSON keystore.
pub fn read_keystore<P: AsRef<Path>, S: AsRef<[u8]>>(
    key_path: P,
    password: S,
) -> Result<PrivateKeySigner> {
    let secret = eth_keystore::decrypt_key(&key_path, password)
        .with_context(|| anyhow!("trying to open `{}`", key_path.as_ref().display()))?;
    PrivateKeySigner::from_slice(&secret)
        .with_context(|| anyhow!("`{}` holds an invalid key", key_path.as_ref().display()))
}

/// Generate a random key and store it encrypted at `path`.
pub fn new_keystore<P: AsRef<Path>, S: AsRef<[u8]>>(
    path: P,
    password: S,
) -> Result<PrivateKeySigner> {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or(Path::new(""));
    fs::create_dir_all(dir)?;
    let filename = path.file_name().and_then(|s| s.to_str());

    let (secret, _) = eth_keystore::new(dir, &mut thread_rng(), password, filename)
        .with_context(|| anyhow!("writing keystore `{}`", path.display()))?;
    let signer = PrivateKeySigner::from_slice(&secret)?;
    info!("new keystore stored under {}", path.display());
    Ok(signer)
}

/// The transaction signer described by `config`.
pub fn load_signer(
    config: &SignerConfig,
    chain_id: u64,
) -> Result<TxSigner> {
    let key = match (&config.private_key, &config.keystore) {
        (Some(private_key), None) => {
            PrivateKeySigner::from_str(private_key.expose_secret().trim_start_matches("0x"))
                .context("parsing signer private key")?
        },
        (None, Some(keystore)) => {
            let password =
                keystore_password(config.password.as_ref(), keystore, &mut terminal_prompt)?;
            read_keystore(keystore, password)?
        },
        (Some(_), Some(_)) => bail!("set either signer.private_key or signer.keystore, not both"),
        (None, None) => bail!("no signer configured, set signer.private_key or signer.keystore"),
    };
    info!("signing as {}", key.address());
    Ok(TxSigner::new(key, chain_id))
}
