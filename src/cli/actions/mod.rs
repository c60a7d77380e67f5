pub mod run;

use crate::app::Settings;
use secrecy::SecretString;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Action {
    Run(RunSettings),
}

#[derive(Debug)]
pub enum SecretStoreKind {
    File {
        dir: PathBuf,
    },
    Vault {
        addr: String,
        token: SecretString,
        mount: String,
        field: String,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum WatchKind {
    File,
    Consul { addr: String, key: String },
}

#[derive(Debug)]
pub struct RunSettings {
    pub port: u16,
    pub listen: Option<String>,
    /// Query catalogue file, used when watching files.
    pub catalogue: PathBuf,
    pub secret_name: String,
    pub secret_store: SecretStoreKind,
    pub watch: WatchKind,
    pub app: Settings,
}
