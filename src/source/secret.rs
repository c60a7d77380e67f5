//! Where the credentials document comes from.

use crate::error::SecretStoreError;
use futures::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

pub trait SecretStore: Send + Sync {
    /// Fetch the secret called `name` as text.
    fn read_value<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String, SecretStoreError>>;

    /// Local file backing `name`, if the store is filesystem based.
    fn local_path(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}

/// Secrets are files in one directory (e.g. a mounted Kubernetes secret).
#[derive(Clone, Debug)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SecretStore for FileSecretStore {
    fn read_value<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String, SecretStoreError>> {
        Box::pin(async move {
            let path = self.dir.join(name);
            debug!(path = %path.display(), "reading secret file");

            tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| SecretStoreError::Io {
                    name: name.to_string(),
                    source,
                })
        })
    }

    fn local_path(&self, name: &str) -> Option<PathBuf> {
        Some(self.dir.join(name))
    }
}

/// Secrets live in a Vault KV v2 mount. The document is one string field of
/// the secret.
#[derive(Clone, Debug)]
pub struct VaultSecretStore {
    client: reqwest::Client,
    addr: Url,
    token: SecretString,
    mount: String,
    field: String,
}

impl VaultSecretStore {
    /// # Errors
    ///
    /// Returns [`SecretStoreError::Url`] if `addr` is not a valid URL.
    pub fn new(
        addr: &str,
        token: SecretString,
        mount: impl Into<String>,
        field: impl Into<String>,
    ) -> Result<Self, SecretStoreError> {
        Ok(Self {
            client: reqwest::Client::new(),
            addr: Url::parse(addr)?,
            token,
            mount: mount.into(),
            field: field.into(),
        })
    }

    fn secret_url(&self, name: &str) -> Result<Url, SecretStoreError> {
        let path = format!(
            "v1/{}/data/{}",
            self.mount.trim_matches('/'),
            name.trim_start_matches('/')
        );
        Ok(self.addr.join(&path)?)
    }
}

impl SecretStore for VaultSecretStore {
    fn read_value<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String, SecretStoreError>> {
        Box::pin(async move {
            let url = self.secret_url(name)?;
            debug!(%url, "reading secret from vault");

            let response = self
                .client
                .get(url)
                .header("X-Vault-Token", self.token.expose_secret())
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(SecretStoreError::Status {
                    name: name.to_string(),
                    status: response.status().as_u16(),
                });
            }

            let body: Value = response.json().await?;
            extract_field(&body, name, &self.field)
        })
    }
}

/// Pick `data.data.<field>` out of a KV v2 read response.
fn extract_field(body: &Value, name: &str, field: &str) -> Result<String, SecretStoreError> {
    body.pointer("/data/data")
        .and_then(|data| data.get(field))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SecretStoreError::MissingField {
            name: name.to_string(),
            field: field.to_string(),
        })
}
