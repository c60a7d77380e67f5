//! Configuration generations.
//!
//! A [`Configuration`] is assembled from two documents: the credentials
//! document (from the secret store) and the query catalogue (file or KV). The
//! two are matched by target `id`. A generation is immutable once built and
//! replaces the previous one wholesale.

pub mod document;

use crate::error::ConfigError;
use document::{CatalogueEntry, QueryDocument, TargetDocument, parse_catalogue, parse_targets};
use secrecy::SecretString;
use std::{collections::HashSet, fmt, time::Duration};
use tracing::warn;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DRIVER: &str = "postgres";
pub const DEFAULT_MAX_IDLE_CONS: u32 = 5;
pub const DEFAULT_MAX_OPEN_CONS: u32 = 5;
pub const DEFAULT_INTERVAL_MINUTES: u64 = 1;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Values that depend on process flags rather than on the documents.
#[derive(Clone, Copy, Debug)]
pub struct Defaults {
    pub query_timeout: Duration,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Driver {
    Postgres,
    MySql,
    Oracle,
    /// Anything else; uses the generic DSN form.
    Generic(String),
}

impl Driver {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pgx" => Self::Postgres,
            "mysql" | "mariadb" => Self::MySql,
            "oracle" => Self::Oracle,
            other => Self::Generic(other.to_string()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Oracle => "oracle",
            Self::Generic(name) => name,
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A named SQL statement scheduled against one target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryDefinition {
    pub name: String,
    pub sql: String,
    pub interval_minutes: u64,
    pub timeout: Duration,
}

impl QueryDefinition {
    /// Schedule period: the declared interval, but never shorter than the
    /// timeout plus `margin`.
    #[must_use]
    pub fn effective_period(&self, margin: Duration) -> Duration {
        let declared = Duration::from_secs(self.interval_minutes.saturating_mul(60));
        declared.max(self.timeout.saturating_add(margin))
    }
}

/// A configured database connection and the queries it runs.
#[derive(Clone, Debug)]
pub struct Target {
    pub id: String,
    pub database: String,
    pub driver: Driver,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: SecretString,
    pub max_idle_cons: u32,
    pub max_open_cons: u32,
    pub connect_string: Option<SecretString>,
    pub max_lifetime: Option<Duration>,
    pub queries: Vec<QueryDefinition>,
}

impl Target {
    /// `host:port/database`, used in log lines.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// One immutable generation of targets.
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub targets: Vec<Target>,
}

impl Configuration {
    /// Parse both documents, apply defaults, validate and match them by id.
    ///
    /// Targets present in only one of the two documents are left out of the
    /// generation with a warning.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if either document is malformed or fails
    /// validation. Nothing is partially applied.
    pub fn assemble(
        credentials: &str,
        catalogue: &str,
        defaults: &Defaults,
    ) -> Result<Self, ConfigError> {
        let raw_targets = parse_targets(credentials)?;
        let mut entries = parse_catalogue(catalogue)?;

        let mut catalogued = HashSet::new();
        let ids = entries
            .iter()
            .filter_map(|entry| entry.id.as_deref().map(str::trim))
            .filter(|id| !id.is_empty());
        for id in ids {
            if !catalogued.insert(id) {
                return Err(ConfigError::DuplicateCatalogueEntry(id.to_string()));
            }
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(raw_targets.len());

        for (index, raw) in raw_targets.into_iter().enumerate() {
            let id = raw
                .id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .ok_or(ConfigError::MissingId { index })?;

            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateTarget(id));
            }

            let Some(position) = entries
                .iter()
                .position(|entry| entry.id.as_deref().map(str::trim) == Some(id.as_str()))
            else {
                warn!(target_id = %id, "target has no entry in the query catalogue, skipping");
                continue;
            };

            let entry = entries.swap_remove(position);
            let queries = build_queries(&id, entry, defaults)?;

            targets.push(build_target(id, raw, queries)?);
        }

        for entry in entries {
            warn!(
                target_id = entry.id.as_deref().unwrap_or_default(),
                "query catalogue entry has no credentials, skipping"
            );
        }

        Ok(Self { targets })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Longest query timeout in the generation.
    #[must_use]
    pub fn max_timeout(&self) -> Duration {
        self.targets
            .iter()
            .flat_map(|t| t.queries.iter().map(|q| q.timeout))
            .max()
            .unwrap_or_default()
    }
}

fn build_target(
    id: String,
    raw: TargetDocument,
    queries: Vec<QueryDefinition>,
) -> Result<Target, ConfigError> {
    let max_open_cons = raw.max_open_cons.unwrap_or(DEFAULT_MAX_OPEN_CONS);
    if max_open_cons == 0 {
        return Err(ConfigError::Invalid {
            target: id,
            reason: "maxOpenCons must be greater than zero".to_string(),
        });
    }

    Ok(Target {
        database: raw.database.unwrap_or_default(),
        driver: Driver::from_name(raw.driver.as_deref().unwrap_or(DEFAULT_DRIVER)),
        host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: raw.port.unwrap_or(DEFAULT_PORT),
        user: raw.user.unwrap_or_default(),
        password: SecretString::from(raw.password.unwrap_or_default()),
        max_idle_cons: raw.max_idle_cons.unwrap_or(DEFAULT_MAX_IDLE_CONS),
        max_open_cons,
        connect_string: raw
            .connect_string
            .filter(|s| !s.trim().is_empty())
            .map(SecretString::from),
        max_lifetime: raw.max_lifetime.map(Duration::from_secs),
        queries,
        id,
    })
}

fn build_queries(
    target: &str,
    entry: CatalogueEntry,
    defaults: &Defaults,
) -> Result<Vec<QueryDefinition>, ConfigError> {
    let mut names = HashSet::new();

    entry
        .queries
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let query = build_query(target, index, raw, defaults)?;
            if names.insert(query.name.clone()) {
                Ok(query)
            } else {
                Err(ConfigError::DuplicateQuery {
                    target: target.to_string(),
                    query: query.name,
                })
            }
        })
        .collect()
}

fn build_query(
    target: &str,
    index: usize,
    raw: QueryDocument,
    defaults: &Defaults,
) -> Result<QueryDefinition, ConfigError> {
    let missing = |field| ConfigError::MissingQueryField {
        target: target.to_string(),
        index,
        field,
    };

    let name = raw
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| missing("name"))?;
    let sql = raw
        .sql
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| missing("sql"))?;

    let interval_minutes = raw.interval.unwrap_or(DEFAULT_INTERVAL_MINUTES);
    if interval_minutes == 0 {
        return Err(ConfigError::Invalid {
            target: target.to_string(),
            reason: format!("query '{name}': interval must be at least 1 minute"),
        });
    }

    let timeout = raw.timeout.map_or(defaults.query_timeout, Duration::from_secs);
    if timeout.is_zero() {
        return Err(ConfigError::Invalid {
            target: target.to_string(),
            reason: format!("query '{name}': timeout must be greater than zero"),
        });
    }

    Ok(QueryDefinition {
        name,
        sql,
        interval_minutes,
        timeout,
    })
}
