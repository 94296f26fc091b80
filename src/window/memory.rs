use std::collections::VecDeque;

use crate::feed::CanonicalUpdate;

pub const DEFAULT_WINDOW_LIMIT: usize = 50;

/// Newest-first sliding window over the most recent `limit` updates.
#[derive(Clone, Debug)]
pub struct MemoryWindow {
    limit: usize,
    updates: VecDeque<CanonicalUpdate>,
}

impl MemoryWindow {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            updates: VecDeque::with_capacity(limit),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Prepends a batch, keeping the batch's own order at the front.
    pub fn push_batch(&mut self, batch: &[CanonicalUpdate]) {
        for update in batch.iter().rev() {
            self.updates.push_front(update.clone());
        }
        self.updates.truncate(self.limit);
    }

    /// Replaces the contents with records that are already newest-first.
    pub fn replace(&mut self, newest_first: Vec<CanonicalUpdate>) {
        self.updates = newest_first.into_iter().take(self.limit).collect();
    }

    pub fn snapshot(&self) -> Vec<CanonicalUpdate> {
        self.updates.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.updates.clear();
    }
}
