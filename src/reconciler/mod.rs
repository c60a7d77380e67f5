//! Swaps one configuration generation for the next.
//!
//! The reconciler is the only writer of the active pools and the job set.
//! It runs as a single task ([`Reconciler::run`]) fed by change
//! notifications, so reconciliations never overlap.
//!
//! Replacing a generation:
//! 1. assemble and validate the new documents (a failure changes nothing);
//! 2. stop the scheduler and wait for running jobs, cancelling stragglers
//!    after `max timeout + margin`;
//! 3. clear the jobs and close the old pools;
//! 4. reset every metric family;
//! 5. open one pool per target, schedule its health check and queries;
//! 6. start the scheduler.

use crate::{
    app::AppContext,
    config::{Configuration, Defaults, QueryDefinition},
    error::{ConfigError, ReloadError},
    executor::QueryExecutor,
    metrics::{MetricEmitter, TargetLabels},
    pool::{ConnectionPool, Connector, PoolSettings},
    scheduler::{Job, Scheduler},
    source::{Change, ConfigSource},
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// What the HTTP layer reports about the active generation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Status {
    /// Number of successful reconciliations so far.
    pub generation: u64,
    /// Ids of the targets with an open pool.
    pub targets: Vec<String>,
}

impl Status {
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.generation > 0
    }
}

/// Outcome of one successful reconciliation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub generation: u64,
    pub active: Vec<String>,
    /// Targets whose pool could not be opened.
    pub skipped: Vec<String>,
    pub jobs: usize,
}

pub struct Reconciler {
    scheduler: Scheduler,
    executor: QueryExecutor,
    emitter: MetricEmitter,
    connector: Arc<dyn Connector>,
    defaults: Defaults,
    health_interval: Duration,
    timeout_margin: Duration,
    pools: Vec<Arc<ConnectionPool>>,
    grace: Duration,
    status: watch::Sender<Status>,
}

impl Reconciler {
    #[must_use]
    pub fn new(ctx: &AppContext, connector: Arc<dyn Connector>) -> Self {
        Self {
            scheduler: ctx.scheduler.clone(),
            executor: ctx.executor(),
            emitter: ctx.emitter.clone(),
            connector,
            defaults: ctx.settings.defaults,
            health_interval: ctx.settings.health_interval,
            timeout_margin: ctx.settings.timeout_margin,
            pools: Vec::new(),
            grace: ctx.settings.timeout_margin,
            status: watch::channel(Status::default()).0,
        }
    }

    /// Follow the active generation.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Replace the active generation with one built from the two documents.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the documents are malformed or invalid.
    /// In that case pools, jobs and metrics are left exactly as they were.
    #[instrument(skip_all, level = "info", err)]
    pub async fn reconcile(
        &mut self,
        credentials: &str,
        catalogue: &str,
    ) -> Result<Summary, ConfigError> {
        let config = Configuration::assemble(credentials, catalogue, &self.defaults)?;

        self.teardown().await;
        self.emitter.reset().await;

        let summary = self.build(&config).await;

        self.grace = config.max_timeout().saturating_add(self.timeout_margin);
        self.scheduler.start();

        self.status.send_replace(Status {
            generation: summary.generation,
            targets: summary.active.clone(),
        });

        info!(
            generation = summary.generation,
            active = summary.active.len(),
            skipped = summary.skipped.len(),
            jobs = summary.jobs,
            "configuration applied"
        );

        Ok(summary)
    }

    /// Stop every job and close every pool.
    pub async fn shutdown(&mut self) {
        self.teardown().await;
        self.emitter.flush().await;
    }

    async fn teardown(&mut self) {
        self.scheduler.stop();
        if !self.scheduler.drain(self.grace).await {
            warn!(grace = ?self.grace, "jobs of the previous generation were cancelled");
        }
        self.scheduler.clear();

        for pool in self.pools.drain(..) {
            if let Err(e) = pool.close().await {
                warn!(target_id = %pool.labels().id, error = %e, "failed to close pool");
            }
        }
    }

    async fn build(&mut self, config: &Configuration) -> Summary {
        let mut summary = Summary {
            generation: self.status.borrow().generation + 1,
            ..Summary::default()
        };

        for target in &config.targets {
            let settings = PoolSettings::from(target);
            let labels = settings.labels.clone();

            let pool = match ConnectionPool::open(settings, Arc::clone(&self.connector)) {
                Ok(pool) => Arc::new(pool),
                Err(e) => {
                    error!(target_id = %target.id, endpoint = %target.endpoint(), error = %e, "failed to open pool, skipping target");
                    self.executor.health_check(&labels, None).await;
                    summary.skipped.push(target.id.clone());
                    continue;
                }
            };

            debug!(target_id = %target.id, driver = %target.driver, endpoint = %target.endpoint(), "pool opened");

            self.scheduler.schedule(
                format!("{labels}/health"),
                self.health_interval,
                self.health_job(&pool, labels.clone()),
            );
            summary.jobs += 1;

            for query in &target.queries {
                let period = query.effective_period(self.timeout_margin);
                debug!(target_id = %target.id, query = %query.name, ?period, "scheduling query");

                self.scheduler.schedule(
                    format!("{labels}/{}", query.name),
                    period,
                    self.query_job(&pool, query),
                );
                summary.jobs += 1;
            }

            summary.active.push(target.id.clone());
            self.pools.push(pool);
        }

        summary
    }

    fn health_job(&self, pool: &Arc<ConnectionPool>, labels: TargetLabels) -> Job {
        let executor = self.executor.clone();
        let pool = Arc::clone(pool);
        let labels = Arc::new(labels);

        Arc::new(move || {
            let executor = executor.clone();
            let pool = Arc::clone(&pool);
            let labels = Arc::clone(&labels);
            Box::pin(async move { executor.health_check(&labels, Some(pool.as_ref())).await })
        })
    }

    fn query_job(&self, pool: &Arc<ConnectionPool>, query: &QueryDefinition) -> Job {
        let executor = self.executor.clone();
        let pool = Arc::clone(pool);
        let query = Arc::new(query.clone());

        Arc::new(move || {
            let executor = executor.clone();
            let pool = Arc::clone(&pool);
            let query = Arc::clone(&query);
            Box::pin(async move { executor.run(&pool, &query).await })
        })
    }

    /// Reconcile on every change until the channel closes, then shut down.
    ///
    /// Failures are logged and leave the active generation running.
    pub async fn run(mut self, mut source: ConfigSource, mut changes: mpsc::Receiver<Change>) {
        while let Some(change) = changes.recv().await {
            debug!(?change, "configuration change");

            if let Err(e) = self.apply(&mut source, change).await {
                error!(error = %e, "reload failed, keeping the active configuration");
            }
        }

        info!("configuration watch closed, stopping jobs");
        self.shutdown().await;
    }

    /// Load both documents for `change` and reconcile.
    ///
    /// # Errors
    ///
    /// Returns a [`ReloadError`] if a document cannot be read or is invalid.
    pub async fn apply(
        &mut self,
        source: &mut ConfigSource,
        change: Change,
    ) -> Result<Summary, ReloadError> {
        let documents = source.load(change).await?;
        Ok(self
            .reconcile(&documents.credentials, &documents.catalogue)
            .await?)
    }
}
