use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{Connection, params};

use crate::error::StoreError;
use crate::feed::CanonicalUpdate;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS updates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        origin_timestamp INTEGER NOT NULL,
        batch_seq INTEGER NOT NULL DEFAULT 0,
        record_json TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS updates_by_timestamp ON updates (origin_timestamp);
";

/// Append-only SQLite log of canonical updates, indexed by origin timestamp.
/// Records sharing a timestamp read back newest batch first and in input
/// order within a batch, the same order the in-memory window keeps.
/// Each call opens its own connection on a blocking thread, so reads see a
/// consistent snapshot while appends continue.
#[derive(Clone, Debug)]
pub struct UpdateStore {
    path: Arc<PathBuf>,
}

impl UpdateStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = Arc::new(path.as_ref().to_path_buf());
        let init_path = Arc::clone(&path);
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&*init_path)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
            conn.execute_batch(SCHEMA)?;
            add_batch_column(&conn)?;
            Ok::<(), StoreError>(())
        })
        .await??;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the batches, oldest first, in one transaction.
    pub async fn append(&self, batches: Vec<Vec<CanonicalUpdate>>) -> Result<(), StoreError> {
        if batches.iter().all(Vec::is_empty) {
            return Ok(());
        }
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || append_blocking(&path, &batches)).await?
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<CanonicalUpdate>, StoreError> {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || recent_blocking(&path, limit)).await?
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&*path)?;
            conn.execute("DELETE FROM updates", [])?;
            Ok::<(), StoreError>(())
        })
        .await?
    }
}

/// Files written before batches were numbered get one batch per record.
fn add_batch_column(conn: &Connection) -> Result<(), StoreError> {
    let numbered: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM pragma_table_info('updates') WHERE name = 'batch_seq')",
        [],
        |row| row.get(0),
    )?;
    if !numbered {
        conn.execute_batch(
            "ALTER TABLE updates ADD COLUMN batch_seq INTEGER NOT NULL DEFAULT 0;
             UPDATE updates SET batch_seq = id;",
        )?;
    }
    Ok(())
}

fn append_blocking(path: &Path, batches: &[Vec<CanonicalUpdate>]) -> Result<(), StoreError> {
    let mut conn = Connection::open(path)?;
    let tx = conn.transaction()?;
    {
        let mut batch_seq: i64 =
            tx.query_row("SELECT COALESCE(MAX(batch_seq), 0) FROM updates", [], |row| {
                row.get(0)
            })?;
        let mut insert = tx.prepare(
            "INSERT INTO updates (origin_timestamp, batch_seq, record_json) VALUES (?1, ?2, ?3)",
        )?;
        for batch in batches.iter().filter(|batch| !batch.is_empty()) {
            batch_seq += 1;
            for update in batch {
                insert.execute(params![
                    update.origin_timestamp,
                    batch_seq,
                    serde_json::to_string(update)?
                ])?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}

fn recent_blocking(path: &Path, limit: usize) -> Result<Vec<CanonicalUpdate>, StoreError> {
    let conn = Connection::open(path)?;
    let mut query = conn.prepare(
        "SELECT record_json FROM updates
         ORDER BY origin_timestamp DESC, batch_seq DESC, id ASC LIMIT ?1",
    )?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = query.query_map(params![limit], |row| row.get::<_, String>(0))?;

    let mut updates = Vec::new();
    for row in rows {
        updates.push(serde_json::from_str(&row?)?);
    }
    Ok(updates)
}
