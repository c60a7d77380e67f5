use crate::{
    app::Settings,
    cli::actions::{Action, RunSettings, SecretStoreKind, WatchKind},
    config::Defaults,
};
use anyhow::{Result, anyhow};
use clap::ArgMatches;
use secrecy::SecretString;
use std::{path::PathBuf, time::Duration};

fn string(matches: &ArgMatches, name: &str) -> Result<String> {
    matches
        .get_one::<String>(name)
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("--{name} is required"))
}

fn seconds(matches: &ArgMatches, name: &str) -> Result<Duration> {
    matches
        .get_one::<u64>(name)
        .copied()
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow!("--{name} is required"))
}

fn count(matches: &ArgMatches, name: &str) -> Result<usize> {
    matches
        .get_one::<usize>(name)
        .copied()
        .ok_or_else(|| anyhow!("--{name} is required"))
}

/// Turn parsed flags into an [`Action`].
///
/// # Errors
///
/// Returns an error if a required value is missing.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    let port = matches
        .get_one::<u16>("port")
        .copied()
        .ok_or_else(|| anyhow!("Port is required. Please provide it using the --port flag."))?;

    // None means auto-detect
    let listen = matches.get_one::<String>("listen").map(ToString::to_string);

    let secret_store = match string(matches, "secret-store")?.as_str() {
        "vault" => SecretStoreKind::Vault {
            addr: string(matches, "vault-addr")?,
            token: SecretString::from(string(matches, "vault-token").map_err(|_| {
                anyhow!("Vault token is required. Please provide it using --vault-token or VAULT_TOKEN.")
            })?),
            mount: string(matches, "vault-mount")?,
            field: string(matches, "vault-field")?,
        },
        _ => SecretStoreKind::File {
            dir: PathBuf::from(string(matches, "secret-dir")?),
        },
    };

    let watch = match string(matches, "watch")?.as_str() {
        "consul" => WatchKind::Consul {
            addr: string(matches, "consul-addr")?,
            key: string(matches, "consul-key")?,
        },
        _ => WatchKind::File,
    };

    let app = Settings {
        namespace: string(matches, "namespace")?,
        subsystem: string(matches, "subsystem")?,
        queue_capacity: count(matches, "queue-capacity")?,
        max_concurrent_jobs: count(matches, "max-concurrent-jobs")?,
        ping_timeout: seconds(matches, "ping-timeout")?,
        health_interval: seconds(matches, "health-interval")?,
        timeout_margin: seconds(matches, "timeout-margin")?,
        defaults: Defaults {
            query_timeout: seconds(matches, "query-timeout")?,
        },
    };

    Ok(Action::Run(RunSettings {
        port,
        listen,
        catalogue: PathBuf::from(string(matches, "config")?),
        secret_name: string(matches, "secret-name")?,
        secret_store,
        watch,
        app,
    }))
}
