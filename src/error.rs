use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("malformed feed frame: {0}")]
    MalformedJson(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("update store failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("could not encode stored update: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("update store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("could not start {name} worker: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{name} worker is no longer running")]
    Gone { name: &'static str },
}
