//! SQLite backed [`SeenStore`].

use crate::db::{Pool, Target, Transaction};
use crate::store::{Error, Result, SeenStore};
use chrono::Utc;
use rusqlite::{ErrorCode, OptionalExtension};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub struct SqliteStore {
    pool: Arc<Pool>,
}

impl SqliteStore {
    /// Open or create the database file at `path`.
    ///
    /// A table from the folder-less layout, keyed by `message_id` alone, is migrated by copying
    /// every record into each of `folders`.
    ///
    /// # Errors
    ///
    /// Returns error if the file can not be opened or the schema is not usable.
    pub fn open(path: PathBuf, folders: &[String]) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        debug!("Opening sqlite database at {}", path.display());
        Self::with_target(Target::File(path), folders)
    }

    /// Create a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns error if the database can not be created.
    pub fn in_memory() -> Result<Arc<Self>> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let name = format!(
            "imap-ntfy-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        Self::with_target(Target::Memory(name), &[])
    }

    fn with_target(target: Target, folders: &[String]) -> Result<Arc<Self>> {
        let pool = Pool::new(target);
        pool.with_transaction(|tx| {
            migrate_legacy(tx, folders)?;
            create_tables(tx)
        })?;
        pool.with_connection(|conn| {
            conn.prepare("SELECT folder, message_id, processed_at FROM processed_messages LIMIT 0")
                .map(|_| ())
                .map_err(|e| Error::Schema(e.to_string()))
        })?;
        Ok(Arc::new(Self { pool }))
    }
}

impl SeenStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn contains(&self, folder: &str, message_id: &str) -> Result<bool> {
        self.pool.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM processed_messages WHERE folder=? AND message_id=? LIMIT 1",
                    (folder, message_id),
                    |r| r.get::<usize, i32>(0),
                )
                .optional()?
                .is_some())
        })
    }

    fn insert(&self, folder: &str, message_id: &str) -> Result<()> {
        self.pool.with_transaction(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO processed_messages (folder, message_id, processed_at) VALUES (?,?,?)",
                (folder, message_id, Utc::now()),
            )?;
            Ok(())
        })
    }

    fn count(&self, folder: &str) -> Result<usize> {
        self.pool.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT count(*) FROM processed_messages WHERE folder=?",
                [folder],
                |r| r.get(0),
            )?)
        })
    }
}

fn create_tables(tx: &mut Transaction) -> rusqlite::Result<()> {
    tx.execute(
        r"
CREATE TABLE IF NOT EXISTS processed_messages (
    folder TEXT NOT NULL,
    message_id TEXT NOT NULL,
    processed_at TEXT NOT NULL,
    PRIMARY KEY (folder, message_id)
)
",
        (),
    )?;
    Ok(())
}

/// Rewrite a table without the `folder` column into the current layout.
fn migrate_legacy(tx: &mut Transaction, folders: &[String]) -> rusqlite::Result<()> {
    if folders.is_empty() {
        return Ok(());
    }

    let (has_message_id, has_folder): (bool, bool) = tx.query_row(
        "SELECT COALESCE(SUM(name='message_id'),0), COALESCE(SUM(name='folder'),0) FROM pragma_table_info('processed_messages')",
        (),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if !has_message_id || has_folder {
        return Ok(());
    }

    info!("Migrating processed_messages to per folder records for {folders:?}");
    tx.execute(
        "ALTER TABLE processed_messages RENAME TO processed_messages_legacy",
        (),
    )?;
    create_tables(tx)?;
    let now = Utc::now();
    for folder in folders {
        let copied = tx.execute(
            "INSERT OR IGNORE INTO processed_messages (folder, message_id, processed_at) SELECT ?1, message_id, COALESCE(processed_at, ?2) FROM processed_messages_legacy WHERE message_id IS NOT NULL",
            (folder, now),
        )?;
        debug!("Copied {copied} legacy records into {folder}");
    }
    tx.execute("DROP TABLE processed_messages_legacy", ())?;
    Ok(())
}

pub(crate) fn is_transient(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
                | ErrorCode::DiskFull
        )
    )
}
