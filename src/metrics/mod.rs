//! Exported metric families.
//!
//! The four families are plain `prometheus` gauge vectors: each label tuple
//! keeps only its last value. `GaugeVec` is internally synchronized, so every
//! operation here is safe to call from any number of running jobs at once.
//!
//! | family | labels |
//! |---|---|
//! | `<ns>_<sub>_query_value` | id, database, query, column |
//! | `<ns>_<sub>_query_error` | id, database, query, column (empty = whole query) |
//! | `<ns>_<sub>_query_duration_seconds` | id, database, query |
//! | `<ns>_<sub>_up` | id, database |

pub mod event;
pub mod queue;

pub use event::{ColumnLabels, MetricEvent, QueryLabels, Series, TargetLabels};
pub use queue::{MetricEmitter, MetricWriter};

use prometheus::{GaugeVec, Opts, Registry, core::Collector as _};

const COLUMN_LABELS: &[&str] = &["id", "database", "query", "column"];
const QUERY_LABELS: &[&str] = &["id", "database", "query"];
const TARGET_LABELS: &[&str] = &["id", "database"];

#[derive(Clone)]
pub struct MetricSink {
    query_value: GaugeVec,
    query_error: GaugeVec,
    query_duration: GaugeVec,
    up: GaugeVec,
}

impl MetricSink {
    /// Build the four families under `<namespace>_<subsystem>_`.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace or subsystem make an invalid metric name.
    pub fn new(namespace: &str, subsystem: &str) -> prometheus::Result<Self> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(namespace)
                .subsystem(subsystem)
        };

        Ok(Self {
            query_value: GaugeVec::new(
                opts("query_value", "Value of business metrics from the database"),
                COLUMN_LABELS,
            )?,
            query_error: GaugeVec::new(
                opts(
                    "query_error",
                    "Result of the last query run, 1 if the query or a column failed",
                ),
                COLUMN_LABELS,
            )?,
            query_duration: GaugeVec::new(
                opts(
                    "query_duration_seconds",
                    "Duration of the last query run in seconds",
                ),
                QUERY_LABELS,
            )?,
            up: GaugeVec::new(opts("up", "Database status, 1 if reachable"), TARGET_LABELS)?,
        })
    }

    /// Register all families with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a family with the same name is already registered.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.query_value.clone()))?;
        registry.register(Box::new(self.query_error.clone()))?;
        registry.register(Box::new(self.query_duration.clone()))?;
        registry.register(Box::new(self.up.clone()))?;
        Ok(())
    }

    fn family(&self, series: &Series) -> &GaugeVec {
        match series {
            Series::QueryValue(_) => &self.query_value,
            Series::QueryError(_) => &self.query_error,
            Series::QueryDuration(_) => &self.query_duration,
            Series::Up(_) => &self.up,
        }
    }

    /// Overwrite the series the event belongs to.
    pub fn set(&self, event: &MetricEvent) {
        let series = event.series();
        self.family(&series)
            .with_label_values(series.label_values().as_slice())
            .set(event.value());
    }

    /// Remove exactly one series. Returns `false` if it did not exist.
    pub fn delete(&self, series: &Series) -> bool {
        self.family(series)
            .remove_label_values(series.label_values().as_slice())
            .is_ok()
    }

    /// Drop every series of every family.
    pub fn reset_all(&self) {
        self.query_value.reset();
        self.query_error.reset();
        self.query_duration.reset();
        self.up.reset();
    }

    /// Current value of a series, without creating it.
    #[must_use]
    pub fn get(&self, series: &Series) -> Option<f64> {
        let names = match series {
            Series::QueryValue(_) | Series::QueryError(_) => COLUMN_LABELS,
            Series::QueryDuration(_) => QUERY_LABELS,
            Series::Up(_) => TARGET_LABELS,
        };
        let wanted = series.label_values();

        self.family(series)
            .collect()
            .iter()
            .flat_map(|family| family.get_metric().iter())
            .find(|metric| {
                names.iter().zip(&wanted).all(|(name, value)| {
                    metric
                        .get_label()
                        .iter()
                        .any(|pair| pair.name() == *name && pair.value() == *value)
                })
            })
            .map(|metric| metric.get_gauge().value())
    }

    /// Number of series currently held across all families.
    #[must_use]
    pub fn len(&self) -> usize {
        [
            &self.query_value,
            &self.query_error,
            &self.query_duration,
            &self.up,
        ]
        .iter()
        .flat_map(|vec| vec.collect())
        .map(|family| family.get_metric().len())
        .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
