//! PostgreSQL backed [`SeenStore`].

use crate::store::{Error, Result, SeenStore};
use chrono::Utc;
use parking_lot::Mutex;
use postgres::error::SqlState;
use postgres::Client;
use postgres_native_tls::MakeTlsConnector;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CREATE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS processed_messages (
    folder TEXT NOT NULL,
    message_id TEXT NOT NULL,
    processed_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (folder, message_id)
)
";

/// Holds a single connection which is re-established on the next use after it was lost.
///
/// TLS is negotiated as requested by the `sslmode` parameter of the url, `prefer` by default.
pub struct PostgresStore {
    config: postgres::Config,
    tls: MakeTlsConnector,
    client: Mutex<Option<Client>>,
}

impl PostgresStore {
    /// Connect to the database at `url` and create the table if needed.
    ///
    /// A table from the folder-less layout is migrated by copying every record into each of
    /// `folders`.
    ///
    /// # Errors
    ///
    /// Returns error if the url is invalid, the server can not be reached or the schema is not
    /// usable.
    pub fn open(url: &str, folders: &[String]) -> Result<Arc<Self>> {
        let config = postgres::Config::from_str(url)?;
        let connector = native_tls::TlsConnector::new()?;
        let store = Self {
            config,
            tls: MakeTlsConnector::new(connector),
            client: Mutex::new(None),
        };

        store.with_client(|client| {
            let mut tx = client.transaction()?;
            migrate_legacy(&mut tx, folders)?;
            tx.batch_execute(CREATE_TABLE)?;
            tx.commit()
        })?;

        store
            .with_client(|client| {
                client.prepare(
                    "SELECT folder, message_id, processed_at FROM processed_messages LIMIT 0",
                )
            })
            .map_err(|e| match e {
                Error::Postgres(e) if e.as_db_error().is_some() => Error::Schema(e.to_string()),
                e => e,
            })?;

        Ok(Arc::new(store))
    }

    fn with_client<T>(
        &self,
        closure: impl FnOnce(&mut Client) -> std::result::Result<T, postgres::Error>,
    ) -> Result<T> {
        let mut guard = self.client.lock();
        let client = match guard.take() {
            Some(client) if !client.is_closed() => client,
            previous => {
                if previous.is_some() {
                    warn!("Postgres connection was closed, reconnecting");
                }
                debug!("Connecting to postgres");
                self.config.connect(self.tls.clone())?
            }
        };

        let client = guard.insert(client);
        Ok(closure(client)?)
    }
}

impl SeenStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    fn contains(&self, folder: &str, message_id: &str) -> Result<bool> {
        self.with_client(|client| {
            client
                .query_opt(
                    "SELECT 1 FROM processed_messages WHERE folder=$1 AND message_id=$2 LIMIT 1",
                    &[&folder, &message_id],
                )
                .map(|row| row.is_some())
        })
    }

    fn insert(&self, folder: &str, message_id: &str) -> Result<()> {
        self.with_client(|client| {
            client.execute(
                "INSERT INTO processed_messages (folder, message_id, processed_at) VALUES ($1,$2,$3) ON CONFLICT DO NOTHING",
                &[&folder, &message_id, &Utc::now()],
            )
        })?;
        Ok(())
    }

    fn count(&self, folder: &str) -> Result<usize> {
        let count: i64 = self.with_client(|client| {
            client
                .query_one(
                    "SELECT count(*) FROM processed_messages WHERE folder=$1",
                    &[&folder],
                )
                .map(|row| row.get(0))
        })?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

/// Rewrite a table without the `folder` column into the current layout.
fn migrate_legacy(
    tx: &mut postgres::Transaction<'_>,
    folders: &[String],
) -> std::result::Result<(), postgres::Error> {
    if folders.is_empty() {
        return Ok(());
    }

    let row = tx.query_one(
        r"
SELECT
    COUNT(*) FILTER (WHERE column_name = 'message_id') > 0,
    COUNT(*) FILTER (WHERE column_name = 'folder') > 0
FROM information_schema.columns
WHERE table_schema = current_schema() AND table_name = 'processed_messages'
",
        &[],
    )?;
    let (has_message_id, has_folder): (bool, bool) = (row.get(0), row.get(1));
    if !has_message_id || has_folder {
        return Ok(());
    }

    info!("Migrating processed_messages to per folder records for {folders:?}");
    tx.batch_execute("ALTER TABLE processed_messages RENAME TO processed_messages_legacy")?;
    tx.batch_execute(CREATE_TABLE)?;
    for folder in folders {
        let copied = tx.execute(
            "INSERT INTO processed_messages (folder, message_id, processed_at) SELECT $1, message_id, COALESCE(processed_at::timestamptz, now()) FROM processed_messages_legacy WHERE message_id IS NOT NULL ON CONFLICT DO NOTHING",
            &[folder],
        )?;
        debug!("Copied {copied} legacy records into {folder}");
    }
    tx.batch_execute("DROP TABLE processed_messages_legacy")?;
    Ok(())
}

pub(crate) fn is_transient(error: &postgres::Error) -> bool {
    if error.is_closed() {
        return true;
    }

    match error.code() {
        // Errors without a server side code stem from the connection itself.
        None => error.as_db_error().is_none(),
        Some(code) => {
            let code = code.code();
            code.starts_with("08")
                || code.starts_with("53")
                || code.starts_with("57P")
                || code == SqlState::T_R_SERIALIZATION_FAILURE.code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_url_is_rejected() {
        let err = PostgresStore::open("postgresql://db:notaport/mail", &[])
            .err()
            .unwrap();
        assert!(matches!(err, Error::Postgres(_)));
    }

    #[test]
    fn unreachable_server_is_transient() {
        let err = PostgresStore::open("postgresql://user@127.0.0.1:1/mail?connect_timeout=1", &[])
            .err()
            .unwrap();
        assert!(err.is_transient());
    }

    #[test]
    fn required_tls_fails_against_plain_server() {
        // The server declines TLS, `sslmode=require` must not continue in plain text.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            use std::io::{Read, Write};
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0_u8; 8];
            stream.read_exact(&mut request).unwrap();
            // SSLRequest code 80877103, refused with 'N'.
            assert_eq!(request, [0, 0, 0, 8, 4, 210, 22, 47]);
            stream.write_all(b"N").unwrap();
        });

        let err = PostgresStore::open(
            &format!("postgresql://user@127.0.0.1:{port}/mail?sslmode=require&connect_timeout=5"),
            &[],
        )
        .err()
        .unwrap();
        server.join().unwrap();
        assert!(matches!(err, Error::Postgres(_)));
    }
}
