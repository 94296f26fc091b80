mod memory;
mod store;

use std::collections::VecDeque;
use std::path::Path;

use tracing::{debug, info};

use crate::error::StoreError;
use crate::feed::CanonicalUpdate;

pub use memory::DEFAULT_WINDOW_LIMIT;
use memory::MemoryWindow;
use store::UpdateStore;

/// The bounded set of recent updates the graph is derived from. The durable
/// variant keeps an in-memory mirror so a failing store never loses the live
/// window, only the replay across restarts.
pub enum UpdateWindow {
    Memory(MemoryWindow),
    Durable {
        store: UpdateStore,
        mirror: MemoryWindow,
        /// Batches, oldest first, that the store refused. Retried ahead of
        /// the next append; while any remain the mirror is authoritative.
        unsynced: VecDeque<Vec<CanonicalUpdate>>,
    },
}

impl UpdateWindow {
    pub fn in_memory(limit: usize) -> Self {
        Self::Memory(MemoryWindow::new(limit))
    }

    /// Opens the store and replays its most recent records.
    pub async fn durable(path: impl AsRef<Path>, limit: usize) -> Result<Self, StoreError> {
        let store = UpdateStore::open(path).await?;
        let mut mirror = MemoryWindow::new(limit);
        mirror.replace(store.recent(mirror.limit()).await?);
        info!(
            path = %store.path().display(),
            replayed = mirror.len(),
            "durable update window opened"
        );
        Ok(Self::Durable {
            store,
            mirror,
            unsynced: VecDeque::new(),
        })
    }

    fn mirror(&self) -> &MemoryWindow {
        match self {
            Self::Memory(window) => window,
            Self::Durable { mirror, .. } => mirror,
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Durable { .. })
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.mirror().is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.mirror().len()
    }

    /// Adds a normalized batch. On a store error the batch is still in the
    /// in-memory window and is written again with the next append.
    pub async fn append(&mut self, batch: Vec<CanonicalUpdate>) -> Result<(), StoreError> {
        match self {
            Self::Memory(window) => {
                window.push_batch(&batch);
                Ok(())
            }
            Self::Durable {
                store,
                mirror,
                unsynced,
            } => {
                mirror.push_batch(&batch);
                unsynced.push_back(batch);
                match store.append(unsynced.iter().cloned().collect()).await {
                    Ok(()) => {
                        if unsynced.len() > 1 {
                            debug!(batches = unsynced.len(), "store caught up");
                        }
                        unsynced.clear();
                        Ok(())
                    }
                    Err(err) => {
                        keep_newest(unsynced, mirror.limit());
                        Err(err)
                    }
                }
            }
        }
    }

    /// Newest-first contents, at most `limit` long.
    pub async fn current(&self) -> Result<Vec<CanonicalUpdate>, StoreError> {
        match self {
            Self::Memory(window) => Ok(window.snapshot()),
            Self::Durable {
                mirror, unsynced, ..
            } if !unsynced.is_empty() => Ok(mirror.snapshot()),
            Self::Durable { store, mirror, .. } => store.recent(mirror.limit()).await,
        }
    }

    /// In-memory contents, used when the store cannot be read.
    pub fn fallback(&self) -> Vec<CanonicalUpdate> {
        self.mirror().snapshot()
    }

    pub async fn clear(&mut self) -> Result<(), StoreError> {
        match self {
            Self::Memory(window) => {
                window.clear();
                Ok(())
            }
            Self::Durable {
                store,
                mirror,
                unsynced,
            } => {
                mirror.clear();
                unsynced.clear();
                store.clear().await
            }
        }
    }
}

/// Drops the oldest pending updates beyond `limit`; they would have left the
/// window anyway.
fn keep_newest(pending: &mut VecDeque<Vec<CanonicalUpdate>>, limit: usize) {
    let mut excess = pending.iter().map(Vec::len).sum::<usize>().saturating_sub(limit);
    while excess > 0 {
        let Some(oldest) = pending.front_mut() else {
            break;
        };
        if oldest.len() <= excess {
            excess -= oldest.len();
            pending.pop_front();
        } else {
            oldest.truncate(oldest.len() - excess);
            excess = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::feed::UpdateKind;

    use super::*;

    fn update(origin_timestamp: i64) -> CanonicalUpdate {
        CanonicalUpdate {
            kind: UpdateKind::Withdraw,
            origin_timestamp,
            received_at: origin_timestamp,
            prefix: format!("192.0.2.{origin_timestamp}/32"),
            peer: "192.0.2.1".to_owned(),
            host: None,
            peer_asn: None,
            origin_as: None,
            next_hop: None,
            as_path: None,
        }
    }

    #[tokio::test]
    async fn memory_window_reads_back_newest_first() {
        let mut window = UpdateWindow::in_memory(2);
        window.append(vec![update(1)]).await.unwrap();
        window.append(vec![update(2)]).await.unwrap();
        window.append(vec![update(3)]).await.unwrap();

        let current = window.current().await.unwrap();
        assert_eq!(current, [update(3), update(2)]);
        assert!(!window.is_durable());
    }

    #[tokio::test]
    async fn durable_window_replays_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("window.sqlite");

        let mut window = UpdateWindow::durable(&path, 2).await.unwrap();
        window.append(vec![update(10), update(30)]).await.unwrap();
        window.append(vec![update(20)]).await.unwrap();
        drop(window);

        let window = UpdateWindow::durable(&path, 2).await.unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window.current().await.unwrap(), [update(30), update(20)]);
    }

    #[tokio::test]
    async fn refused_batches_stay_visible_and_are_written_later() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("window.sqlite");
        let mut window = UpdateWindow::durable(&path, 5).await.unwrap();
        window.append(vec![update(1)]).await.unwrap();

        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER refuse_inserts BEFORE INSERT ON updates
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

        assert!(window.append(vec![update(2)]).await.is_err());
        assert_eq!(window.current().await.unwrap(), [update(2), update(1)]);

        conn.execute_batch("DROP TRIGGER refuse_inserts;").unwrap();
        window.append(vec![update(3)]).await.unwrap();
        assert_eq!(
            window.current().await.unwrap(),
            [update(3), update(2), update(1)]
        );
        drop(window);

        let reopened = UpdateWindow::durable(&path, 5).await.unwrap();
        assert_eq!(reopened.len(), 3);
    }

    #[test]
    fn pending_batches_are_bounded_by_the_window() {
        let mut pending = VecDeque::from([
            vec![update(1), update(2)],
            vec![update(3), update(4)],
            vec![update(5)],
        ]);
        keep_newest(&mut pending, 2);
        assert_eq!(pending, [vec![update(3)], vec![update(5)]]);
    }

    #[tokio::test]
    async fn clear_empties_store_and_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let mut window = UpdateWindow::durable(dir.path().join("window.sqlite"), 5)
            .await
            .unwrap();
        window.append(vec![update(1)]).await.unwrap();

        window.clear().await.unwrap();
        assert!(window.is_empty());
        assert!(window.current().await.unwrap().is_empty());
        assert!(window.fallback().is_empty());
    }
}
