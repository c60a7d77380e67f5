use std::fmt;

/// Labels of the `up` family.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TargetLabels {
    pub id: String,
    pub database: String,
}

impl TargetLabels {
    #[must_use]
    pub fn new(id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            database: database.into(),
        }
    }

    #[must_use]
    pub fn query(&self, name: impl Into<String>) -> QueryLabels {
        QueryLabels {
            target: self.clone(),
            query: name.into(),
        }
    }
}

impl fmt::Display for TargetLabels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.database)
    }
}

/// Labels of the `query_duration_seconds` family.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryLabels {
    pub target: TargetLabels,
    pub query: String,
}

impl QueryLabels {
    #[must_use]
    pub fn column(&self, column: impl Into<String>) -> ColumnLabels {
        ColumnLabels {
            query: self.clone(),
            column: column.into(),
        }
    }

    /// Query-scoped error series: the column label is empty.
    #[must_use]
    pub fn error_scope(&self) -> ColumnLabels {
        self.column(String::new())
    }
}

/// Labels of the `query_value` and `query_error` families.
///
/// For `query_error` an empty column means the flag covers the whole query.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ColumnLabels {
    pub query: QueryLabels,
    pub column: String,
}

/// A sample produced by a query or health-check run.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricEvent {
    QueryValue { labels: ColumnLabels, value: f64 },
    QueryError { labels: ColumnLabels, value: f64 },
    QueryDuration { labels: QueryLabels, seconds: f64 },
    Up { labels: TargetLabels, value: f64 },
}

impl MetricEvent {
    #[must_use]
    pub fn series(&self) -> Series {
        match self {
            Self::QueryValue { labels, .. } => Series::QueryValue(labels.clone()),
            Self::QueryError { labels, .. } => Series::QueryError(labels.clone()),
            Self::QueryDuration { labels, .. } => Series::QueryDuration(labels.clone()),
            Self::Up { labels, .. } => Series::Up(labels.clone()),
        }
    }

    #[must_use]
    pub const fn value(&self) -> f64 {
        match self {
            Self::QueryValue { value, .. }
            | Self::QueryError { value, .. }
            | Self::Up { value, .. } => *value,
            Self::QueryDuration { seconds, .. } => *seconds,
        }
    }
}

/// Identity of one series, without a value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Series {
    QueryValue(ColumnLabels),
    QueryError(ColumnLabels),
    QueryDuration(QueryLabels),
    Up(TargetLabels),
}

impl Series {
    /// Label values in family label order.
    #[must_use]
    pub fn label_values(&self) -> Vec<&str> {
        match self {
            Self::QueryValue(l) | Self::QueryError(l) => vec![
                l.query.target.id.as_str(),
                l.query.target.database.as_str(),
                l.query.query.as_str(),
                l.column.as_str(),
            ],
            Self::QueryDuration(l) => vec![
                l.target.id.as_str(),
                l.target.database.as_str(),
                l.query.as_str(),
            ],
            Self::Up(l) => vec![l.id.as_str(), l.database.as_str()],
        }
    }
}
