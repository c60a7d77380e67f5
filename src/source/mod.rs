//! Configuration inputs: the secret store holding the credentials document,
//! the query catalogue, and the watchers that signal changes to either.

pub mod secret;
pub mod watch;

pub use secret::{FileSecretStore, SecretStore, VaultSecretStore};
pub use watch::{ConsulWatcher, FileWatcher};

use crate::error::{ConfigError, ReloadError};
use std::{path::PathBuf, sync::Arc};
use tracing::debug;

/// A request to rebuild the active configuration.
#[derive(Clone, PartialEq, Eq)]
pub enum Change {
    /// Re-read every document.
    Reload,
    /// A new query catalogue delivered by the KV store.
    Catalogue(String),
}

impl std::fmt::Debug for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reload => f.write_str("Reload"),
            Self::Catalogue(text) => write!(f, "Catalogue({} bytes)", text.len()),
        }
    }
}

/// Where the query catalogue is read from.
#[derive(Clone, Debug)]
pub enum Catalogue {
    File(PathBuf),
    /// Last value delivered by the KV watcher.
    Kv(String),
}

/// Both documents of one reconciliation.
#[derive(Clone, Debug)]
pub struct Documents {
    pub credentials: String,
    pub catalogue: String,
}

pub struct ConfigSource {
    secrets: Arc<dyn SecretStore>,
    secret_name: String,
    catalogue: Catalogue,
}

impl ConfigSource {
    #[must_use]
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        secret_name: impl Into<String>,
        catalogue: Catalogue,
    ) -> Self {
        Self {
            secrets,
            secret_name: secret_name.into(),
            catalogue,
        }
    }

    /// Files whose changes should trigger a reload.
    #[must_use]
    pub fn watched_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if let Catalogue::File(path) = &self.catalogue {
            files.push(path.clone());
        }
        if let Some(path) = self.secrets.local_path(&self.secret_name) {
            files.push(path);
        }
        files
    }

    /// Read both documents, taking `change` into account.
    ///
    /// # Errors
    ///
    /// Returns [`ReloadError::Secret`] if the secret store fails and
    /// [`ReloadError::Config`] if the catalogue file cannot be read.
    pub async fn load(&mut self, change: Change) -> Result<Documents, ReloadError> {
        if let Change::Catalogue(text) = change {
            self.catalogue = Catalogue::Kv(text);
        }

        let credentials = self.secrets.read_value(&self.secret_name).await?;

        let catalogue = match &self.catalogue {
            Catalogue::File(path) => {
                debug!(path = %path.display(), "reading query catalogue");
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| ConfigError::Read {
                        document: path.display().to_string(),
                        source,
                    })?
            }
            Catalogue::Kv(text) => text.clone(),
        };

        Ok(Documents {
            credentials,
            catalogue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_from_files() -> Result<(), ReloadError> {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("databases.yaml"), "- id: db1\n").expect("write");
        std::fs::write(dir.path().join("config.yaml"), "- id: db1\n  queries: []\n")
            .expect("write");

        let mut source = ConfigSource::new(
            Arc::new(FileSecretStore::new(dir.path())),
            "databases.yaml",
            Catalogue::File(dir.path().join("config.yaml")),
        );

        let documents = source.load(Change::Reload).await?;
        assert_eq!(documents.credentials, "- id: db1\n");
        assert_eq!(documents.catalogue, "- id: db1\n  queries: []\n");

        assert_eq!(
            source.watched_files(),
            vec![
                dir.path().join("config.yaml"),
                dir.path().join("databases.yaml")
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_kv_catalogue_is_kept() -> Result<(), ReloadError> {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("databases.yaml"), "- id: db1\n").expect("write");

        let mut source = ConfigSource::new(
            Arc::new(FileSecretStore::new(dir.path())),
            "databases.yaml",
            Catalogue::Kv(String::new()),
        );

        let documents = source.load(Change::Catalogue("- id: db1\n".to_string())).await?;
        assert_eq!(documents.catalogue, "- id: db1\n");

        // A plain reload reuses the last delivered value.
        let documents = source.load(Change::Reload).await?;
        assert_eq!(documents.catalogue, "- id: db1\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_catalogue_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("databases.yaml"), "").expect("write");

        let mut source = ConfigSource::new(
            Arc::new(FileSecretStore::new(dir.path())),
            "databases.yaml",
            Catalogue::File(dir.path().join("missing.yaml")),
        );

        let err = source.load(Change::Reload).await;
        assert!(matches!(err, Err(ReloadError::Config(ConfigError::Read { .. }))));
    }

    #[test]
    fn test_change_debug_hides_document() {
        let change = Change::Catalogue("password: x".to_string());
        assert_eq!(format!("{change:?}"), "Catalogue(11 bytes)");
    }
}
