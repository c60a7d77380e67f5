//! Runs one query (or one health check) against one pool.
//!
//! Outcomes are never returned: they are published as metric events.

pub mod coerce;

use crate::{
    config::QueryDefinition,
    metrics::{MetricEmitter, MetricEvent, QueryLabels, Series, TargetLabels},
    pool::ConnectionPool,
};
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct QueryExecutor {
    emitter: MetricEmitter,
    ping_timeout: Duration,
}

impl QueryExecutor {
    #[must_use]
    pub const fn new(emitter: MetricEmitter, ping_timeout: Duration) -> Self {
        Self {
            emitter,
            ping_timeout,
        }
    }

    /// Execute `query` once and publish its samples.
    ///
    /// Exactly one duration sample is published per call, whatever happens.
    #[instrument(skip_all, level = "info", fields(target_id = %pool.labels().id, query = %query.name))]
    pub async fn run(&self, pool: &ConnectionPool, query: &QueryDefinition) {
        let started = Instant::now();
        let labels = pool.labels().query(&query.name);

        self.execute(pool, query, &labels).await;

        self.emitter
            .emit(MetricEvent::QueryDuration {
                labels,
                seconds: started.elapsed().as_secs_f64(),
            })
            .await;
    }

    async fn execute(&self, pool: &ConnectionPool, query: &QueryDefinition, labels: &QueryLabels) {
        if !pool.ensure_healthy(self.ping_timeout).await {
            self.up(&labels.target, false).await;
            self.emitter
                .emit(MetricEvent::QueryError {
                    labels: labels.error_scope(),
                    value: 1.0,
                })
                .await;
            return;
        }

        self.up(&labels.target, true).await;

        let result = match pool.query(&query.sql, query.timeout).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "query failed");
                self.emitter
                    .emit(MetricEvent::QueryError {
                        labels: labels.error_scope(),
                        value: 1.0,
                    })
                    .await;
                return;
            }
        };

        self.emitter
            .emit(MetricEvent::QueryError {
                labels: labels.error_scope(),
                value: 0.0,
            })
            .await;

        debug!(rows = result.rows.len(), columns = result.columns.len(), "query succeeded");

        for row in &result.rows {
            for (column, value) in result.columns.iter().zip(row) {
                let series = labels.column(column.as_str());

                match coerce::to_f64(value) {
                    Ok(value) => {
                        self.emitter
                            .emit(MetricEvent::QueryValue {
                                labels: series.clone(),
                                value,
                            })
                            .await;
                        self.emitter.delete(Series::QueryError(series)).await;
                    }
                    Err(e) => {
                        warn!(column = %column, error = %e, "cannot convert value");
                        self.emitter
                            .emit(MetricEvent::QueryError {
                                labels: series.clone(),
                                value: 1.0,
                            })
                            .await;
                        self.emitter.delete(Series::QueryValue(series)).await;
                    }
                }
            }
        }
    }

    /// Ping the target and publish `up`. A target without a pool is down.
    #[instrument(skip_all, level = "debug", fields(target_id = %labels.id))]
    pub async fn health_check(&self, labels: &TargetLabels, pool: Option<&ConnectionPool>) {
        let healthy = match pool {
            Some(pool) => match pool.ping(self.ping_timeout).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "health check failed");
                    false
                }
            },
            None => false,
        };

        self.up(labels, healthy).await;
    }

    async fn up(&self, labels: &TargetLabels, healthy: bool) {
        self.emitter
            .emit(MetricEvent::Up {
                labels: labels.clone(),
                value: if healthy { 1.0 } else { 0.0 },
            })
            .await;
    }
}
