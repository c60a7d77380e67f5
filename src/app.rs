//! Process-wide state, built once and handed to every component.

use crate::{
    config::Defaults,
    executor::{DEFAULT_PING_TIMEOUT, QueryExecutor},
    metrics::{self, MetricEmitter, MetricSink, MetricWriter},
    scheduler::Scheduler,
};
use prometheus::Registry;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "sql";
pub const DEFAULT_SUBSYSTEM: &str = "exporter";
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Tunables that do not come from the configuration documents.
#[derive(Clone, Debug)]
pub struct Settings {
    pub namespace: String,
    pub subsystem: String,
    pub queue_capacity: usize,
    /// Global cap on running job bodies, `0` for none.
    pub max_concurrent_jobs: usize,
    pub ping_timeout: Duration,
    pub health_interval: Duration,
    /// Added to a query timeout to get the shortest allowed period.
    pub timeout_margin: Duration,
    pub defaults: Defaults,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            subsystem: DEFAULT_SUBSYSTEM.to_string(),
            queue_capacity: metrics::queue::DEFAULT_CAPACITY,
            max_concurrent_jobs: 0,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            timeout_margin: DEFAULT_TIMEOUT_MARGIN,
            defaults: Defaults::default(),
        }
    }
}

#[derive(Clone)]
pub struct AppContext {
    pub registry: Registry,
    pub sink: MetricSink,
    pub emitter: MetricEmitter,
    pub scheduler: Scheduler,
    pub settings: Settings,
}

impl AppContext {
    /// Build the registry, metric families and queue.
    ///
    /// The returned [`MetricWriter`] must be spawned for emitted events to
    /// reach the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace or subsystem produce invalid metric
    /// names.
    pub fn new(settings: Settings) -> prometheus::Result<(Self, MetricWriter)> {
        let registry = Registry::new();
        let sink = MetricSink::new(&settings.namespace, &settings.subsystem)?;
        sink.register(&registry)?;

        let (emitter, writer) = metrics::queue::channel(sink.clone(), settings.queue_capacity);

        Ok((
            Self {
                registry,
                sink,
                emitter,
                scheduler: Scheduler::with_limit(settings.max_concurrent_jobs),
                settings,
            },
            writer,
        ))
    }

    #[must_use]
    pub fn executor(&self) -> QueryExecutor {
        QueryExecutor::new(self.emitter.clone(), self.settings.ping_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_registers_families() -> prometheus::Result<()> {
        let (ctx, _writer) = AppContext::new(Settings::default())?;

        ctx.sink.set(&crate::metrics::MetricEvent::Up {
            labels: crate::metrics::TargetLabels::new("db1", "orders"),
            value: 1.0,
        });

        let names: Vec<String> = ctx
            .registry
            .gather()
            .iter()
            .map(|family| family.name().to_string())
            .collect();
        assert_eq!(names, vec!["sql_exporter_up".to_string()]);
        Ok(())
    }

    #[test]
    fn test_invalid_namespace() {
        let settings = Settings {
            namespace: "not valid".to_string(),
            ..Settings::default()
        };
        assert!(AppContext::new(settings).is_err());
    }
}
