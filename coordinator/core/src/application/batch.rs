// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Batching primitive shared by the command pipelines.
//!
//! A [`Batch`] is owned by exactly one task. Items accumulate keyed by id,
//! so the same command or action received twice is handled once, and the
//! batch is flushed when it reaches `max_batch` items or when `flush_after`
//! has passed since its first item, whichever comes first.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::scheduler_config::BatchingConfig;

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub max_batch: usize,
    pub flush_after: Duration,
}

impl From<&BatchingConfig> for BatchSettings {
    fn from(config: &BatchingConfig) -> Self {
        Self {
            max_batch: config.max_batch.max(1),
            flush_after: config.flush_after,
        }
    }
}

pub struct Batch<K, T> {
    items: HashMap<K, T>,
    deadline: Option<Instant>,
    settings: BatchSettings,
}

impl<K: Eq + Hash, T> Batch<K, T> {
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            items: HashMap::new(),
            deadline: None,
            settings,
        }
    }

    /// Adds an item, replacing any previous item with the same key.
    /// Returns `true` once the batch is full.
    pub fn push(&mut self, key: K, item: T) -> bool {
        if self.items.is_empty() {
            self.deadline = Some(Instant::now() + self.settings.flush_after);
        }
        self.items.insert(key, item);
        self.items.len() >= self.settings.max_batch
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn take(&mut self) -> Vec<T> {
        self.deadline = None;
        self.items.drain().map(|(_, item)| item).collect()
    }

    async fn expired(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

/// Drains `rx` into batches and hands each one to `flush`. Whatever is
/// pending when the channel closes or `cancel` fires is flushed before
/// returning.
pub async fn run_batches<K, T, F, Fut>(
    name: &'static str,
    mut rx: mpsc::Receiver<T>,
    settings: BatchSettings,
    cancel: CancellationToken,
    key_of: impl Fn(&T) -> K,
    mut flush: F,
) where
    K: Eq + Hash,
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut batch = Batch::new(settings);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(item) => {
                    if batch.push(key_of(&item), item) {
                        debug!(batcher = name, size = batch.len(), "batch full, flushing");
                        flush(batch.take()).await;
                    }
                }
                None => break,
            },
            _ = batch.expired() => {
                debug!(batcher = name, size = batch.len(), "flush timer elapsed");
                flush(batch.take()).await;
            }
        }
    }
    if !batch.is_empty() {
        flush(batch.take()).await;
    }
    debug!(batcher = name, "batcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    fn settings(max_batch: usize, flush_after_ms: u64) -> BatchSettings {
        BatchSettings {
            max_batch,
            flush_after: Duration::from_millis(flush_after_ms),
        }
    }

    #[test]
    fn test_push_deduplicates_by_key() {
        let mut batch = Batch::new(settings(10, 1000));
        assert!(!batch.push(1, "a"));
        assert!(!batch.push(1, "b"));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.take(), vec!["b"]);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_flushes_when_full() {
        let (tx, rx) = mpsc::channel(16);
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = flushed.clone();
        let cancel = CancellationToken::new();

        for i in 0..4u32 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        run_batches("test", rx, settings(2, 60_000), cancel, |i| *i, move |items| {
            let sink = sink.clone();
            async move {
                sink.lock().push(items.len());
            }
        })
        .await;

        assert_eq!(*flushed.lock(), vec![2, 2]);
    }

    #[tokio::test]
    async fn test_flushes_after_quiescence() {
        let (tx, rx) = mpsc::channel(16);
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = flushed.clone();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_batches(
            "test",
            rx,
            settings(100, 20),
            cancel.clone(),
            |i: &u32| *i,
            move |items| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(items.len());
                }
            },
        ));

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*flushed.lock(), vec![2]);

        cancel.cancel();
        task.await.unwrap();
    }
}
