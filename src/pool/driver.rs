//! `sqlx` backends for postgres and mysql.
//!
//! Operator SQL goes through `sqlx::raw_sql`, i.e. the simple/text protocol,
//! so values arrive as text and are decoded by column type name. Pools are
//! created lazily: opening never touches the network.

use super::{
    Backend, ColumnValue, Connector, PoolSettings, QueryRows,
    dsn::{self, TcpDsn},
};
use crate::{
    config::Driver,
    error::{ConnectionError, QueryError},
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::future::BoxFuture;
use secrecy::ExposeSecret;
use sqlx::{
    Column, Connection, Database, Row, TypeInfo, ValueRef,
    mysql::{MySqlConnectOptions, MySqlPool, MySqlRow},
    pool::PoolOptions,
    postgres::{PgConnectOptions, PgPool, PgRow, PgSslMode},
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::{debug, info_span};
use tracing_futures::Instrument as _;

/// Opens real pools for postgres and mysql targets.
#[derive(Clone, Copy, Debug, Default)]
pub struct SqlxConnector;

impl Connector for SqlxConnector {
    fn open(&self, settings: &PoolSettings) -> Result<Arc<dyn Backend>, ConnectionError> {
        match &settings.driver {
            Driver::Postgres => Ok(Arc::new(PostgresBackend::open(settings)?)),
            Driver::MySql => Ok(Arc::new(MySqlBackend::open(settings)?)),
            other => Err(ConnectionError::UnsupportedDriver(other.name().to_string())),
        }
    }
}

/// Idle connections are closed after this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);
/// `maxIdleCons: 0` keeps nothing warm between runs.
const NO_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

// sqlx has no idle cap, only a floor (`min_connections`) that the maintenance
// task refills. The floor stays at zero and `maxIdleCons` only decides how long
// a released connection may linger.
const fn idle_timeout(settings: &PoolSettings) -> Duration {
    if settings.max_idle == 0 {
        NO_IDLE_TIMEOUT
    } else {
        IDLE_TIMEOUT
    }
}

fn pool_options<DB: Database>(settings: &PoolSettings) -> PoolOptions<DB> {
    PoolOptions::new()
        .max_connections(settings.max_open)
        .min_connections(0)
        .idle_timeout(idle_timeout(settings))
        .max_lifetime(settings.max_lifetime)
}

/// Connection options from a postgres DSN: a `postgres://` URL or libpq
/// `key=value` pairs.
///
/// # Errors
///
/// Returns [`ConnectionError::Options`] for an invalid URL or `sslmode`, and
/// [`ConnectionError::Dsn`] for malformed pairs.
pub fn pg_options(dsn: &str) -> Result<PgConnectOptions, ConnectionError> {
    if dsn::has_scheme(dsn, &["postgres", "postgresql"]) {
        return PgConnectOptions::from_str(dsn).map_err(ConnectionError::Options);
    }

    let mut options = PgConnectOptions::new();

    for (key, value) in dsn::key_values(dsn)? {
        options = match key.as_str() {
            _ if value.is_empty() => options,
            "host" => options.host(&value),
            "port" => options.port(
                value
                    .parse()
                    .map_err(|_| ConnectionError::Dsn(format!("invalid port '{value}'")))?,
            ),
            "user" => options.username(&value),
            "password" => options.password(&value),
            "dbname" => options.database(&value),
            "sslmode" => {
                options.ssl_mode(PgSslMode::from_str(&value).map_err(ConnectionError::Options)?)
            }
            "application_name" => options.application_name(&value),
            other => {
                debug!(key = other, "ignoring postgres DSN key");
                options
            }
        };
    }

    Ok(options)
}

/// Connection options from a mysql DSN: a `mysql://` URL or the
/// `user:pass@tcp(host:port)/db` form.
///
/// # Errors
///
/// Returns [`ConnectionError::Options`] for an invalid URL and
/// [`ConnectionError::Dsn`] for a malformed tcp form.
pub fn mysql_options(dsn: &str) -> Result<MySqlConnectOptions, ConnectionError> {
    if dsn::has_scheme(dsn, &["mysql"]) {
        return MySqlConnectOptions::from_str(dsn).map_err(ConnectionError::Options);
    }

    let parsed = TcpDsn::parse(dsn)?;
    let mut options = MySqlConnectOptions::new();

    if !parsed.host.is_empty() {
        options = options.host(&parsed.host);
    }
    if let Some(port) = parsed.port {
        options = options.port(port);
    }
    if !parsed.user.is_empty() {
        options = options.username(&parsed.user);
    }
    if !parsed.password.is_empty() {
        options = options.password(&parsed.password);
    }
    if !parsed.database.is_empty() {
        options = options.database(&parsed.database);
    }
    for (key, _) in &parsed.params {
        debug!(key = %key, "ignoring mysql DSN parameter");
    }

    Ok(options)
}

pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Create a lazy pool from the stored DSN.
    ///
    /// # Errors
    ///
    /// Returns the [`ConnectionError`] of [`pg_options`].
    pub fn open(settings: &PoolSettings) -> Result<Self, ConnectionError> {
        let options = pg_options(settings.dsn.expose_secret())?;
        let pool = pool_options(settings).connect_lazy_with(options);

        Ok(Self { pool })
    }
}

impl Backend for PostgresBackend {
    fn ping(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(ConnectionError::Ping)?;
            conn.ping().await.map_err(ConnectionError::Ping)
        })
    }

    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<QueryRows, QueryError>> {
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.statement = sql,
            otel.kind = "client"
        );

        Box::pin(
            async move {
                let rows = sqlx::raw_sql(sql)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(QueryError::Execute)?;
                collect_rows(&rows, decode_pg_row)
            }
            .instrument(span),
        )
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            self.pool.close().await;
            Ok(())
        })
    }
}

pub struct MySqlBackend {
    pool: MySqlPool,
}

impl MySqlBackend {
    /// Create a lazy pool from the stored DSN.
    ///
    /// # Errors
    ///
    /// Returns the [`ConnectionError`] of [`mysql_options`].
    pub fn open(settings: &PoolSettings) -> Result<Self, ConnectionError> {
        let options = mysql_options(settings.dsn.expose_secret())?;
        let pool = pool_options(settings).connect_lazy_with(options);

        Ok(Self { pool })
    }
}

impl Backend for MySqlBackend {
    fn ping(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(ConnectionError::Ping)?;
            conn.ping().await.map_err(ConnectionError::Ping)
        })
    }

    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<QueryRows, QueryError>> {
        let span = info_span!(
            "db.query",
            db.system = "mysql",
            db.statement = sql,
            otel.kind = "client"
        );

        Box::pin(
            async move {
                let rows = sqlx::raw_sql(sql)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(QueryError::Execute)?;
                collect_rows(&rows, decode_mysql_row)
            }
            .instrument(span),
        )
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            self.pool.close().await;
            Ok(())
        })
    }
}

fn collect_rows<R: Row>(
    rows: &[R],
    decode: fn(&R) -> Result<Vec<ColumnValue>, QueryError>,
) -> Result<QueryRows, QueryError> {
    let columns = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|column| column.name().to_string())
                .collect()
        })
        .unwrap_or_default();

    let rows = rows.iter().map(decode).collect::<Result<_, _>>()?;

    Ok(QueryRows { columns, rows })
}

fn scan_error(column: &impl Column) -> impl FnOnce(sqlx::Error) -> QueryError + '_ {
    move |source| QueryError::Scan {
        column: column.name().to_string(),
        source,
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn decode_pg_row(row: &PgRow) -> Result<Vec<ColumnValue>, QueryError> {
    row.columns()
        .iter()
        .map(|column| {
            let i = column.ordinal();

            if row.try_get_raw(i).map_err(scan_error(column))?.is_null() {
                return Ok(ColumnValue::Null);
            }

            let value = match column.type_info().name() {
                "INT2" => ColumnValue::Int(i64::from(
                    row.try_get_unchecked::<i16, _>(i).map_err(scan_error(column))?,
                )),
                "INT4" => ColumnValue::Int(i64::from(
                    row.try_get_unchecked::<i32, _>(i).map_err(scan_error(column))?,
                )),
                "INT8" => ColumnValue::Int(
                    row.try_get_unchecked::<i64, _>(i).map_err(scan_error(column))?,
                ),
                "FLOAT4" => ColumnValue::Float(f64::from(
                    row.try_get_unchecked::<f32, _>(i).map_err(scan_error(column))?,
                )),
                "FLOAT8" => ColumnValue::Float(
                    row.try_get_unchecked::<f64, _>(i).map_err(scan_error(column))?,
                ),
                "BOOL" => ColumnValue::Bool(
                    row.try_get_unchecked::<bool, _>(i).map_err(scan_error(column))?,
                ),
                "TIMESTAMPTZ" => ColumnValue::Timestamp(
                    row.try_get_unchecked::<DateTime<Utc>, _>(i)
                        .map_err(scan_error(column))?,
                ),
                "TIMESTAMP" => ColumnValue::Timestamp(
                    row.try_get_unchecked::<NaiveDateTime, _>(i)
                        .map_err(scan_error(column))?
                        .and_utc(),
                ),
                "DATE" => ColumnValue::Timestamp(midnight(
                    row.try_get_unchecked::<NaiveDate, _>(i)
                        .map_err(scan_error(column))?,
                )),
                "BYTEA" => ColumnValue::Bytes(
                    row.try_get_unchecked::<Vec<u8>, _>(i)
                        .map_err(scan_error(column))?,
                ),
                "NUMERIC" | "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UNKNOWN" => {
                    ColumnValue::Text(
                        row.try_get_unchecked::<String, _>(i)
                            .map_err(scan_error(column))?,
                    )
                }
                other => ColumnValue::Unsupported(other.to_string()),
            };

            Ok(value)
        })
        .collect()
}

fn decode_mysql_row(row: &MySqlRow) -> Result<Vec<ColumnValue>, QueryError> {
    row.columns()
        .iter()
        .map(|column| {
            let i = column.ordinal();

            if row.try_get_raw(i).map_err(scan_error(column))?.is_null() {
                return Ok(ColumnValue::Null);
            }

            let value = match column.type_info().name() {
                "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
                    ColumnValue::Int(
                        row.try_get_unchecked::<i64, _>(i)
                            .map_err(scan_error(column))?,
                    )
                }
                "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED"
                | "INT UNSIGNED" | "BIGINT UNSIGNED" => ColumnValue::UInt(
                    row.try_get_unchecked::<u64, _>(i)
                        .map_err(scan_error(column))?,
                ),
                "FLOAT" | "DOUBLE" => ColumnValue::Float(
                    row.try_get_unchecked::<f64, _>(i)
                        .map_err(scan_error(column))?,
                ),
                "BOOLEAN" => ColumnValue::Bool(
                    row.try_get_unchecked::<bool, _>(i)
                        .map_err(scan_error(column))?,
                ),
                "DATETIME" | "TIMESTAMP" => ColumnValue::Timestamp(
                    row.try_get_unchecked::<NaiveDateTime, _>(i)
                        .map_err(scan_error(column))?
                        .and_utc(),
                ),
                "DATE" => ColumnValue::Timestamp(midnight(
                    row.try_get_unchecked::<NaiveDate, _>(i)
                        .map_err(scan_error(column))?,
                )),
                "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
                    ColumnValue::Bytes(
                        row.try_get_unchecked::<Vec<u8>, _>(i)
                            .map_err(scan_error(column))?,
                    )
                }
                "DECIMAL" | "CHAR" | "VARCHAR" | "TINYTEXT" | "TEXT" | "MEDIUMTEXT"
                | "LONGTEXT" | "ENUM" => ColumnValue::Text(
                    row.try_get_unchecked::<String, _>(i)
                        .map_err(scan_error(column))?,
                ),
                other => ColumnValue::Unsupported(other.to_string()),
            };

            Ok(value)
        })
        .collect()
}
