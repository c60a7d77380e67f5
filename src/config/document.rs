//! Raw shapes of the two YAML documents.
//!
//! Every field is optional here; defaults are applied afterwards by
//! [`super::Configuration::assemble`] so that "missing" and "explicitly set"
//! stay distinguishable while parsing.

use crate::error::ConfigError;
use serde::Deserialize;

/// One entry of the credentials document.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDocument {
    pub id: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub port: Option<u16>,
    pub driver: Option<String>,
    pub max_idle_cons: Option<u32>,
    pub max_open_cons: Option<u32>,
    pub connect_string: Option<String>,
    /// Connection max lifetime in seconds.
    pub max_lifetime: Option<u64>,
}

/// One entry of the query catalogue, matched to a target by `id`.
#[derive(Debug, Default, Deserialize)]
pub struct CatalogueEntry {
    pub id: Option<String>,
    #[serde(default)]
    pub queries: Vec<QueryDocument>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryDocument {
    pub sql: Option<String>,
    pub name: Option<String>,
    /// Minutes.
    pub interval: Option<u64>,
    /// Seconds.
    pub timeout: Option<u64>,
}

/// Parse the credentials document.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] if the text is not a YAML list of targets.
pub fn parse_targets(text: &str) -> Result<Vec<TargetDocument>, ConfigError> {
    parse_list(text, "credentials document")
}

/// Parse the query catalogue.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] if the text is not a YAML list of entries.
pub fn parse_catalogue(text: &str) -> Result<Vec<CatalogueEntry>, ConfigError> {
    parse_list(text, "query catalogue")
}

fn parse_list<T>(text: &str, document: &'static str) -> Result<Vec<T>, ConfigError>
where
    T: for<'de> Deserialize<'de>,
{
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let parsed: Option<Vec<T>> =
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse { document, source })?;

    Ok(parsed.unwrap_or_default())
}
