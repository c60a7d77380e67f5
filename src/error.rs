//! Error classes, one per failure scope.
//!
//! Only [`SecretStoreError`] at startup is allowed to stop the process; every
//! other error degrades the smallest scope it describes (a column, a query or a
//! target) and is logged where it happens.

use std::time::Duration;
use thiserror::Error;

/// A configuration document could not be turned into a generation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {document}: {source}")]
    Read {
        document: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {document}: {source}")]
    Parse {
        document: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("target #{index} has no id")]
    MissingId { index: usize },

    #[error("duplicate target id '{0}'")]
    DuplicateTarget(String),

    #[error("duplicate query catalogue entry for target '{0}'")]
    DuplicateCatalogueEntry(String),

    #[error("target '{target}': query #{index} has no {field}")]
    MissingQueryField {
        target: String,
        index: usize,
        field: &'static str,
    },

    #[error("target '{target}': duplicate query name '{query}'")]
    DuplicateQuery { target: String, query: String },

    #[error("target '{target}': {reason}")]
    Invalid { target: String, reason: String },
}

/// Opening or reaching a target's pool failed.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("driver '{0}' has no client library linked")]
    UnsupportedDriver(String),

    #[error("invalid connection options: {0}")]
    Options(#[source] sqlx::Error),

    #[error("invalid DSN: {0}")]
    Dsn(String),

    #[error("ping failed: {0}")]
    Ping(#[source] sqlx::Error),

    #[error("ping timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// Executing a query or reading its rows failed.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query failed: {0}")]
    Execute(#[source] sqlx::Error),

    #[error("cannot read column '{column}': {source}")]
    Scan {
        column: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// A single column value could not be turned into a float.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot convert '{raw}' to float")]
pub struct CoercionError {
    pub raw: String,
}

/// The credentials document could not be fetched from the secret store.
#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("failed to read secret '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("secret store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("secret store answered {status} for '{name}'")]
    Status { name: String, status: u16 },

    #[error("secret '{name}' has no field '{field}'")]
    MissingField { name: String, field: String },

    #[error("invalid secret store url: {0}")]
    Url(#[from] url::ParseError),
}

/// A change source failed to start or to deliver.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("file watch failed: {0}")]
    Notify(#[from] notify::Error),

    #[error("kv request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("kv store answered {0}")]
    Status(u16),

    #[error("kv value is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("kv value is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid kv url: {0}")]
    Url(#[from] url::ParseError),
}

/// A reload could not produce a new generation. The active one is kept.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Secret(#[from] SecretStoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coercion_error_display() {
        let err = CoercionError {
            raw: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "cannot convert 'abc' to float");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::DuplicateQuery {
            target: "db1".to_string(),
            query: "rowcount".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "target 'db1': duplicate query name 'rowcount'"
        );
    }

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::UnsupportedDriver("oracle".to_string());
        assert_eq!(err.to_string(), "driver 'oracle' has no client library linked");
    }
}
