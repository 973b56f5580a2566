// Copyright 2023 Xayn AG
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::hash_map::DefaultHasher,
    fmt::Display,
    hash::{Hash, Hasher},
    str::FromStr,
    time::Duration,
};

use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sqlx::{
    pool::PoolOptions,
    postgres::PgConnectOptions,
    Pool,
    Postgres,
    Transaction,
    Type,
};
use thiserror::Error;
use tracing::debug;

use crate::serde::{serde_duration_as_millis, serde_opt_duration_as_millis, serialize_redacted};

pub type Client = Pool<Postgres>;

/// Configuration for connections to postgres.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
#[cfg_attr(test, serde(deny_unknown_fields))]
pub struct Config {
    /// The default base url.
    ///
    /// Passwords in the URL will be ignored, do not set the
    /// db password with the db url.
    base_url: String,

    /// Override port from base url.
    port: Option<u16>,

    /// Override user from base url.
    user: Option<String>,

    /// Sets the password.
    #[serde(serialize_with = "serialize_redacted")]
    password: Secret<String>,

    /// Override db from base url.
    db: Option<String>,

    /// Override default application name from base url.
    application_name: Option<String>,

    /// Max number of connections per pool.
    pub max_pool_size: u8,

    /// Number of connections a pool keeps open even when idle.
    pub min_pool_size: u8,

    /// How long acquiring a connection may take before it counts as failed.
    #[serde(with = "serde_duration_as_millis")]
    pub connect_timeout: Duration,

    /// How long an unused connection is kept around.
    #[serde(with = "serde_duration_as_millis")]
    pub idle_timeout: Duration,

    /// Server side statement timeout, unset by default.
    #[serde(with = "serde_opt_duration_as_millis")]
    pub statement_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "postgres://user:pw@localhost:5432/silo".into(),
            port: None,
            user: None,
            password: String::from("pw").into(),
            db: None,
            application_name: None,
            max_pool_size: 10,
            min_pool_size: 0,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            statement_timeout: None,
        }
    }
}

impl Config {
    pub fn to_connection_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        let Self {
            base_url,
            port,
            user,
            password,
            db,
            application_name,
            statement_timeout,
            ..
        } = self;

        let mut options = base_url
            .parse::<PgConnectOptions>()?
            .password(password.expose_secret());

        if let Some(user) = user {
            options = options.username(user);
        }
        if let Some(port) = port {
            options = options.port(*port);
        }
        if let Some(db) = db {
            options = options.database(db);
        }
        if let Some(application_name) = application_name {
            options = options.application_name(application_name);
        }
        if let Some(statement_timeout) = statement_timeout {
            options = options.options([(
                "statement_timeout",
                statement_timeout.as_millis().to_string(),
            )]);
        }

        Ok(options)
    }

    /// Pool options with this config's tuning applied.
    pub fn to_pool_options(&self) -> PoolOptions<Postgres> {
        PoolOptions::new()
            .max_connections(u32::from(self.max_pool_size))
            .min_connections(u32::from(self.min_pool_size))
            .acquire_timeout(self.connect_timeout)
            .idle_timeout(self.idle_timeout)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Secret::new(password.into());
        self
    }
}

/// A quoted postgres identifier.
///
/// If displayed (e.g. `.to_string()`) quotes (`"`) will be included.
///
/// This can be used for cases where a SQL query is build
/// dynamically and is parameterized over an identifier in
/// a position where postgres doesn't allow `$` bindings.
///
/// For example in `CREATE SCHEMA "name";`
///
/// Be aware that quoted identifiers are case-sensitive and limited to 63 bytes.
/// Moreover, we only allow printable us-ascii characters excluding `"`; this is stricter than [postgres](https://www.postgresql.org/docs/15/sql-syntax-lexical.html#SQL-SYNTAX-IDENTIFIERS).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Type)]
#[sqlx(transparent)]
pub struct QuotedIdentifier(String);

impl QuotedIdentifier {
    pub fn as_unquoted_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for QuotedIdentifier {
    type Err = InvalidQuotedIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_owned().try_into()
    }
}

impl TryFrom<String> for QuotedIdentifier {
    type Error = InvalidQuotedIdentifier;

    fn try_from(identifier: String) -> Result<Self, Self::Error> {
        static RE: Lazy<Regex> = Lazy::new(|| {
            // printable us-ascii excluding `"`
            Regex::new(r#"^[[:print:]&&[^"]]{1,63}$"#).unwrap()
        });
        if RE.is_match(&identifier) {
            Ok(Self(identifier))
        } else {
            Err(InvalidQuotedIdentifier { identifier })
        }
    }
}

impl Display for QuotedIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

#[derive(Debug, Error)]
#[error("String is not a supported quoted identifier: {identifier:?}")]
pub struct InvalidQuotedIdentifier {
    identifier: String,
}

/// Lock id reserved for coordination outside of per-schema locking.
const RESERVED_LOCK_ID: i64 = 0;

/// Generate a `i64` postgres advisory lock id from a schema name.
///
/// **There can be collisions**, but less collisions are preferable.
pub fn schema_lock_id(schema: &QuotedIdentifier) -> i64 {
    let mut hasher = DefaultHasher::new();
    schema.as_unquoted_str().hash(&mut hasher);
    let id = hasher.finish() as i64;
    if id == RESERVED_LOCK_ID {
        // Avoid accidentally colliding with the reserved lock id, which
        // could dead lock code holding it while migrating a schema.
        id + 1
    } else {
        id
    }
}

/// Use a xact lock on given `id`.
///
/// # Warning
///
/// The lock id namespace is per-database global
/// and 64bit. This means this lock functions
/// shares the id-space with any other transaction
/// lock space.
pub async fn lock_id_until_end_of_transaction(
    tx: &'_ mut Transaction<'_, Postgres>,
    lock_id: i64,
) -> Result<(), sqlx::Error> {
    debug!({ lock_id }, "pg_advisory_xact_lock");
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(lock_id)
        .execute(tx)
        .await?;
    Ok(())
}

/// True if the error is worth retrying on a fresh connection.
///
/// Retryable are network level failures (refused, reset, unreachable, dns),
/// pool acquire timeouts and the server telling us it is going away or
/// cancelling statements: SQLSTATE class `08`, `57P01` (admin_shutdown),
/// `57P03` (cannot_connect_now) and `57014` (query_canceled, which is what
/// a statement timeout raises).
///
/// Everything else (auth failures, permission denied, syntax errors,
/// constraint violations, ...) is fatal.
pub fn is_transient_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(error) => error.code().map_or(false, |code| {
            code.starts_with("08") || code == "57P01" || code == "57P03" || code == "57014"
        }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::str;

    use super::*;

    #[test]
    fn test_quoted_identifier_parsing() {
        assert!(QuotedIdentifier::from_str("").is_err());
        assert!(QuotedIdentifier::from_str(str::from_utf8(&[0x41; 63]).unwrap()).is_ok());
        assert!(QuotedIdentifier::from_str(str::from_utf8(&[0x41; 64]).unwrap()).is_err());
        assert!(QuotedIdentifier::from_str("a").is_ok());
        for chr in ' '..='~' {
            assert_eq!(
                QuotedIdentifier::try_from(format!("{chr}")).is_ok(),
                chr != '"'
            );
        }
    }

    #[test]
    fn test_format_quoted_identifier() {
        assert_eq!(
            QuotedIdentifier::from_str("a").unwrap().to_string(),
            "\"a\""
        );
    }

    #[test]
    fn test_schema_lock_id_is_deterministic() {
        let schema = QuotedIdentifier::from_str("tenant_acme").unwrap();
        assert_eq!(schema_lock_id(&schema), schema_lock_id(&schema));
        assert_ne!(schema_lock_id(&schema), RESERVED_LOCK_ID);
    }

    #[test]
    fn test_config_redacts_password() {
        let config = Config::default().with_password("super-secret");
        let serialized = serde_json::to_value(&config).unwrap();
        assert_eq!(serialized["password"], "[REDACTED]");
    }
}
