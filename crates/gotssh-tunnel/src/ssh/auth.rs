//! Client authentication against a handshaken session

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::client::Handle;
use russh_keys::key::KeyPair;

use gotssh_core::{AuthMethod, ConnectionError};

use super::handler::ClientHandler;
use super::map_russh_error;

/// Key files tried by [`AuthMethod::Auto`], in order
const DEFAULT_KEY_FILES: &[&str] = &["id_rsa", "id_ecdsa", "id_ed25519"];

pub(crate) fn default_key_paths() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    DEFAULT_KEY_FILES
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .collect()
}

/// Authenticate `user`. `Ok(false)` means every credential was refused.
pub(crate) async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    method: &AuthMethod,
) -> Result<bool, ConnectionError> {
    match method {
        AuthMethod::Password(password) => handle
            .authenticate_password(user, password.as_str())
            .await
            .map_err(map_russh_error),
        AuthMethod::PrivateKey { path, passphrase } => {
            let key = load_key(path, passphrase.as_deref())?;
            with_key(handle, user, key).await
        }
        AuthMethod::Agent => with_agent(handle, user).await,
        AuthMethod::Auto => {
            if std::env::var_os("SSH_AUTH_SOCK").is_some() {
                match with_agent(handle, user).await {
                    Ok(true) => return Ok(true),
                    Ok(false) => {}
                    Err(ConnectionError::Auth(e)) => tracing::debug!("Skipping agent: {}", e),
                    Err(e) => return Err(e),
                }
            }
            for path in default_key_paths() {
                if !path.exists() {
                    continue;
                }
                match load_key(&path, None) {
                    Ok(key) => {
                        if with_key(handle, user, key).await? {
                            return Ok(true);
                        }
                    }
                    Err(e) => tracing::debug!("Skipping {}: {}", path.display(), e),
                }
            }
            Ok(false)
        }
    }
}

fn load_key(path: &Path, passphrase: Option<&str>) -> Result<KeyPair, ConnectionError> {
    russh_keys::load_secret_key(path, passphrase).map_err(|e| {
        ConnectionError::Auth(format!("failed to load key {}: {}", path.display(), e))
    })
}

async fn with_key(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    key: KeyPair,
) -> Result<bool, ConnectionError> {
    handle
        .authenticate_publickey(user, Arc::new(key))
        .await
        .map_err(map_russh_error)
}

#[cfg(unix)]
async fn with_agent(
    handle: &mut Handle<ClientHandler>,
    user: &str,
) -> Result<bool, ConnectionError> {
    use russh_keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| ConnectionError::Auth(format!("SSH agent unavailable: {}", e)))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| ConnectionError::Auth(format!("SSH agent refused to list keys: {}", e)))?;

    for key in identities {
        let fingerprint = key.fingerprint();
        let (returned, result) = handle.authenticate_future(user, key, agent).await;
        agent = returned;
        if let Ok(true) = result {
            return Ok(true);
        }
        tracing::debug!("Agent key {} not accepted", fingerprint);
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn with_agent(
    _handle: &mut Handle<ClientHandler>,
    _user: &str,
) -> Result<bool, ConnectionError> {
    Err(ConnectionError::Auth(
        "SSH agent authentication is only supported on unix".into(),
    ))
}
