//! Durable record of the messages which have already been handled.
//!
//! Every backend stores one row per `(folder, message_id)` pair in a `processed_messages` table.
//! Rows are only ever inserted, inserting an existing pair is a no-op.

use crate::scheduler::Shutdown;
#[cfg(test)]
use mockall::automock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub mod memory;
pub mod postgres;
pub mod sqlite;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Postgres: {0}")]
    Postgres(#[from] ::postgres::Error),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("Unsupported database url '{0}'")]
    UnsupportedUrl(String),
    #[error("Table processed_messages has an incompatible schema: {0}")]
    Schema(String),
}

impl Error {
    /// Whether the error is caused by a temporary condition, such as a lost connection or a
    /// locked database, and the operation may succeed when retried later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Sqlite(e) => sqlite::is_transient(e),
            Error::Postgres(e) => postgres::is_transient(e),
            Error::Io(_) => true,
            Error::Tls(_) | Error::UnsupportedUrl(_) | Error::Schema(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Set of processed messages, scoped by folder.
#[cfg_attr(test, automock)]
pub trait SeenStore: Send + Sync {
    /// Return the backend's name.
    fn name(&self) -> &str;

    /// Check whether `message_id` in `folder` has been processed.
    ///
    /// # Errors
    ///
    /// Returns error if the query failed.
    fn contains(&self, folder: &str, message_id: &str) -> Result<bool>;

    /// Record `message_id` in `folder` as processed. Recording an existing pair succeeds
    /// without changes.
    ///
    /// # Errors
    ///
    /// Returns error if the write failed.
    fn insert(&self, folder: &str, message_id: &str) -> Result<()>;

    /// Number of processed messages recorded for `folder`.
    ///
    /// # Errors
    ///
    /// Returns error if the query failed.
    fn count(&self, folder: &str) -> Result<usize>;
}

/// Backend selected by a database connection string.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DatabaseUrl {
    /// SQLite database file.
    Sqlite(PathBuf),
    /// Private in-memory SQLite database.
    SqliteMemory,
    /// PostgreSQL connection string, normalized to the `postgresql://` scheme.
    Postgres(String),
    /// Process local set without persistence.
    Memory,
}

impl DatabaseUrl {
    /// Parse a connection string.
    ///
    /// SQLite urls follow the SQLAlchemy layout, `sqlite:///relative.db` and
    /// `sqlite:////absolute/path.db`. Postgres urls may carry a `+driver` suffix on the scheme,
    /// which is ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the scheme is not supported.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let Some((scheme, rest)) = url.split_once("://") else {
            return Err(Error::UnsupportedUrl(url.to_owned()));
        };

        let dialect = scheme
            .split_once('+')
            .map_or(scheme, |(dialect, _)| dialect)
            .to_ascii_lowercase();

        match dialect.as_str() {
            "sqlite" => {
                let path = rest.strip_prefix('/').unwrap_or(rest);
                if path.is_empty() || path == ":memory:" {
                    Ok(Self::SqliteMemory)
                } else {
                    Ok(Self::Sqlite(PathBuf::from(path)))
                }
            }
            "postgres" | "postgresql" => Ok(Self::Postgres(format!("postgresql://{rest}"))),
            "memory" => Ok(Self::Memory),
            _ => Err(Error::UnsupportedUrl(url.to_owned())),
        }
    }
}

/// Open the store selected by the connection string `url` and make sure its schema exists.
///
/// `folders` are the monitored folders, records of a folder-less table are migrated into each
/// of them.
///
/// # Errors
///
/// Returns error if the url is not supported, the database can not be reached or the schema is
/// not usable.
pub fn open(url: &str, folders: &[String]) -> Result<Arc<dyn SeenStore>> {
    let store: Arc<dyn SeenStore> = match DatabaseUrl::parse(url)? {
        DatabaseUrl::Sqlite(path) => sqlite::SqliteStore::open(path, folders)?,
        DatabaseUrl::SqliteMemory => sqlite::SqliteStore::in_memory()?,
        DatabaseUrl::Postgres(url) => postgres::PostgresStore::open(&url, folders)?,
        DatabaseUrl::Memory => Arc::new(memory::MemoryStore::default()),
    };
    info!("Seen message store initialized: {}", store.name());
    Ok(store)
}

/// Like [`open`], but transient failures are retried every `delay` until the store opens or
/// shutdown is requested, in which case `None` is returned.
///
/// # Errors
///
/// Returns the first error which is not transient.
pub fn open_with_retry(
    url: &str,
    folders: &[String],
    delay: Duration,
    shutdown: &Shutdown,
) -> Result<Option<Arc<dyn SeenStore>>> {
    retry_transient(|| open(url, folders), delay, shutdown)
}

fn retry_transient<T>(
    mut operation: impl FnMut() -> Result<T>,
    delay: Duration,
    shutdown: &Shutdown,
) -> Result<Option<T>> {
    loop {
        match operation() {
            Ok(value) => return Ok(Some(value)),
            Err(e) if e.is_transient() => {
                warn!(
                    "Seen message store unavailable, retrying in {} seconds: {e}",
                    delay.as_secs()
                );
                if shutdown.wait(delay) {
                    return Ok(None);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sqlite_urls() {
        assert_eq!(
            DatabaseUrl::parse("sqlite:///messages.db").unwrap(),
            DatabaseUrl::Sqlite(PathBuf::from("messages.db"))
        );
        assert_eq!(
            DatabaseUrl::parse("sqlite:////var/lib/imap-ntfy/messages.db").unwrap(),
            DatabaseUrl::Sqlite(PathBuf::from("/var/lib/imap-ntfy/messages.db"))
        );
        assert_eq!(
            DatabaseUrl::parse("sqlite://").unwrap(),
            DatabaseUrl::SqliteMemory
        );
        assert_eq!(
            DatabaseUrl::parse("sqlite:///:memory:").unwrap(),
            DatabaseUrl::SqliteMemory
        );
    }

    #[test]
    fn parse_postgres_urls() {
        assert_eq!(
            DatabaseUrl::parse("postgres://user:pw@db:5432/mail").unwrap(),
            DatabaseUrl::Postgres("postgresql://user:pw@db:5432/mail".to_owned())
        );
        assert_eq!(
            DatabaseUrl::parse("postgresql+psycopg2://user@db/mail").unwrap(),
            DatabaseUrl::Postgres("postgresql://user@db/mail".to_owned())
        );
    }

    #[test]
    fn parse_other_urls() {
        assert_eq!(DatabaseUrl::parse("memory://").unwrap(), DatabaseUrl::Memory);
        assert!(matches!(
            DatabaseUrl::parse("mysql://db/mail"),
            Err(Error::UnsupportedUrl(_))
        ));
        assert!(matches!(
            DatabaseUrl::parse("messages.db"),
            Err(Error::UnsupportedUrl(_))
        ));
    }

    #[test]
    fn unsupported_url_is_not_transient() {
        let err = open("mysql://db/mail", &[]).err().unwrap();
        assert!(!err.is_transient());
    }

    fn unavailable() -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ))
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let mut attempts = 0;
        let value = retry_transient(
            || {
                attempts += 1;
                if attempts < 3 {
                    Err(unavailable())
                } else {
                    Ok(attempts)
                }
            },
            Duration::from_millis(1),
            &Shutdown::new(),
        )
        .unwrap();
        assert_eq!(value, Some(3));
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut attempts = 0;
        let err = retry_transient(
            || -> Result<()> {
                attempts += 1;
                Err(Error::Schema("no folder column".to_owned()))
            },
            Duration::from_millis(1),
            &Shutdown::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn shutdown_stops_retrying() {
        let shutdown = Shutdown::new();
        shutdown.request();
        let mut attempts = 0;
        let value = retry_transient(
            || -> Result<()> {
                attempts += 1;
                Err(unavailable())
            },
            Duration::from_secs(60),
            &shutdown,
        )
        .unwrap();
        assert!(value.is_none());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn unreachable_postgres_is_retried_until_shutdown() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        let requester = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            trigger.request();
        });

        let store = open_with_retry(
            "postgresql://user@127.0.0.1:1/mail?connect_timeout=1",
            &[],
            Duration::from_millis(20),
            &shutdown,
        )
        .unwrap();
        requester.join().unwrap();
        assert!(store.is_none());
    }
}
