//! Per-driver connection strings.
//!
//! [`build`] renders the DSN stored in [`super::PoolSettings`]. The backends
//! open (and reopen) pools from that string only, so the two non-URL forms
//! are parsed back here: [`key_values`] for postgres and [`TcpDsn::parse`] for
//! the `user:pass@tcp(host:port)/db` form.

use crate::{
    config::{Driver, Target},
    error::ConnectionError,
};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

/// Build the DSN for `target`.
///
/// An explicit `connectString` always wins. Otherwise postgres gets the
/// `key=value` form, oracle a URL, and everything else (mysql included) the
/// `user:pass@tcp(host:port)/db` form.
#[must_use]
pub fn build(target: &Target) -> SecretString {
    if let Some(connect_string) = &target.connect_string {
        return connect_string.clone();
    }

    let password = target.password.expose_secret();

    let dsn = match &target.driver {
        Driver::Postgres => format!(
            "user={} password={} host={} port={} dbname={} sslmode=disable",
            quote(&target.user),
            quote(password),
            quote(&target.host),
            target.port,
            quote(&target.database)
        ),
        Driver::Oracle => oracle_url(target, password),
        Driver::MySql | Driver::Generic(_) => format!(
            "{}:{}@tcp({}:{})/{}",
            target.user, password, target.host, target.port, target.database
        ),
    };

    SecretString::from(dsn)
}

/// `true` if `dsn` is a URL with one of `schemes`.
#[must_use]
pub fn has_scheme(dsn: &str, schemes: &[&str]) -> bool {
    dsn.split_once("://")
        .is_some_and(|(scheme, _)| schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme)))
}

// libpq quoting: empty values and values with spaces, quotes or backslashes
// are wrapped in single quotes.
fn quote(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\t', '\'', '\\']) {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// Split a postgres `key=value` connection string into its pairs.
///
/// # Errors
///
/// Returns [`ConnectionError::Dsn`] for a key without `=` or an unterminated
/// quoted value. Values never appear in the error.
pub fn key_values(dsn: &str) -> Result<Vec<(String, String)>, ConnectionError> {
    let mut pairs = Vec::new();
    let mut chars = dsn.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            return Ok(pairs);
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some('=') {
            return Err(ConnectionError::Dsn(format!("missing '=' after '{key}'")));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\'') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => break,
                    },
                    Some(c) => value.push(c),
                    None => {
                        return Err(ConnectionError::Dsn(format!(
                            "unterminated quoted value for '{key}'"
                        )));
                    }
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                } else {
                    value.push(c);
                }
            }
        }

        pairs.push((key, value));
    }
}

/// The parts of a `user:pass@tcp(host:port)/db?k=v` connection string.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TcpDsn {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    pub params: Vec<(String, String)>,
}

impl TcpDsn {
    /// Parse the form the way the go mysql driver does: the database starts
    /// after the last `/`, credentials end at the last `@` before it.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Dsn`] if there is no `/`, the address is
    /// not wrapped in `tcp(...)`, or the port is not a number.
    pub fn parse(dsn: &str) -> Result<Self, ConnectionError> {
        let slash = dsn
            .rfind('/')
            .ok_or_else(|| ConnectionError::Dsn("missing '/' before the database".to_string()))?;
        let (head, tail) = dsn.split_at(slash);
        let tail = tail.trim_start_matches('/');

        let (database, query) = tail.split_once('?').unwrap_or((tail, ""));
        let params = query
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| {
                let (k, v) = p.split_once('=').unwrap_or((p, ""));
                (k.to_string(), v.to_string())
            })
            .collect();

        let (credentials, address) = match head.rfind('@') {
            Some(at) => (head.get(..at).unwrap_or_default(), head.get(at + 1..).unwrap_or_default()),
            None => ("", head),
        };
        let (user, password) = credentials.split_once(':').unwrap_or((credentials, ""));

        let (host, port) = if address.is_empty() {
            (String::new(), None)
        } else {
            let inner = address
                .strip_prefix("tcp(")
                .and_then(|a| a.strip_suffix(')'))
                .ok_or_else(|| ConnectionError::Dsn("address must be tcp(host:port)".to_string()))?;
            match inner.rsplit_once(':') {
                Some((host, port)) => (
                    host.trim_start_matches('[').trim_end_matches(']').to_string(),
                    Some(port.parse::<u16>().map_err(|_| {
                        ConnectionError::Dsn(format!("invalid port '{port}'"))
                    })?),
                ),
                None => (inner.to_string(), None),
            }
        };

        Ok(Self {
            user: user.to_string(),
            password: password.to_string(),
            host,
            port,
            database: database.to_string(),
            params,
        })
    }
}

fn oracle_url(target: &Target, password: &str) -> String {
    let fallback = || {
        format!(
            "oracle://{}:{}@{}:{}/{}",
            target.user, password, target.host, target.port, target.database
        )
    };

    let Ok(mut url) = Url::parse(&format!("oracle://{}:{}", target.host, target.port)) else {
        return fallback();
    };

    if url.set_username(&target.user).is_err() || url.set_password(Some(password)).is_err() {
        return fallback();
    }
    url.set_path(&format!("/{}", target.database));

    url.to_string()
}
