use crate::{
    app::AppContext,
    cli::{
        actions::{Action, RunSettings, SecretStoreKind, WatchKind},
        telemetry::shutdown_tracer,
    },
    error::ReloadError,
    exporter,
    pool::driver::SqlxConnector,
    reconciler::Reconciler,
    source::{
        Catalogue, Change, ConfigSource, ConsulWatcher, FileSecretStore, FileWatcher, SecretStore,
        VaultSecretStore,
    },
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const CHANGE_QUEUE: usize = 16;

/// Handle the run action
///
/// # Errors
///
/// Returns an error if the credentials cannot be read at startup or the
/// server cannot bind.
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Run(settings) => run(settings).await,
    }
}

fn secret_store(kind: SecretStoreKind) -> Result<Arc<dyn SecretStore>> {
    Ok(match kind {
        SecretStoreKind::File { dir } => Arc::new(FileSecretStore::new(dir)),
        SecretStoreKind::Vault {
            addr,
            token,
            mount,
            field,
        } => Arc::new(
            VaultSecretStore::new(&addr, token, mount, field)
                .context("Failed to configure the Vault secret store")?,
        ),
    })
}

async fn run(settings: RunSettings) -> Result<()> {
    let (ctx, writer) =
        AppContext::new(settings.app.clone()).context("Invalid metric namespace or subsystem")?;
    let writer = writer.spawn();

    let secrets = secret_store(settings.secret_store)?;

    let mut consul = None;
    let catalogue = match &settings.watch {
        WatchKind::File => Catalogue::File(settings.catalogue.clone()),
        WatchKind::Consul { addr, key } => {
            let mut watcher =
                ConsulWatcher::new(addr, key).context("Failed to configure the Consul watch")?;
            let initial = match watcher.poll().await {
                Ok(value) => value.unwrap_or_default(),
                Err(e) => {
                    warn!(error = %e, "cannot read the query catalogue from consul yet");
                    String::new()
                }
            };
            consul = Some(watcher);
            Catalogue::Kv(initial)
        }
    };

    let mut source = ConfigSource::new(secrets, settings.secret_name.clone(), catalogue);
    let mut reconciler = Reconciler::new(&ctx, Arc::new(SqlxConnector));

    // Credentials are mandatory to start; a bad document is not.
    match reconciler.apply(&mut source, Change::Reload).await {
        Ok(summary) => info!(targets = ?summary.active, skipped = ?summary.skipped, "initial configuration applied"),
        Err(ReloadError::Secret(e)) => {
            return Err(e).context("Failed to read database credentials");
        }
        Err(ReloadError::Config(e)) => {
            error!(error = %e, "initial configuration rejected, waiting for a change");
        }
    }

    let (changes_tx, changes_rx) = mpsc::channel(CHANGE_QUEUE);

    let files = source.watched_files();
    let file_watcher = if files.is_empty() {
        None
    } else {
        Some(FileWatcher::spawn(&files, changes_tx.clone()).context("Failed to watch configuration files")?)
    };
    let consul_task = consul.map(|watcher| tokio::spawn(watcher.run(changes_tx.clone())));
    drop(changes_tx);

    let status = reconciler.subscribe();
    let reconcile_task = tokio::spawn(reconciler.run(source, changes_rx));

    let served = exporter::new(settings.port, settings.listen, ctx.registry.clone(), status).await;

    info!("shutting down");

    // Closing every change sender ends the reconciler, which stops jobs and pools.
    drop(file_watcher);
    if let Some(task) = consul_task {
        task.abort();
        let _ = task.await;
    }
    if let Err(e) = reconcile_task.await {
        error!(error = %e, "reconciler task failed");
    }

    ctx.emitter.flush().await;
    writer.abort();

    shutdown_tracer();

    served
}
