//! Usage statistics: a bounded fire-and-forget queue in front of the
//! document store.
//!
//! Every terminal request offers one [`StatsRecord`]. The queue never blocks
//! the response path: when it is full the record is dropped and a counter
//! incremented. One background task drains the queue into the `searches`
//! collection; write failures are logged and forgotten.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::docstore::DocStore;

/// Queue capacity; overflow drops the newest record.
pub const QUEUE_BOUND: usize = 4096;

/// One terminal request, as stored in the `searches` collection.
#[derive(Clone, Debug, Serialize)]
pub struct StatsRecord {
    pub timestamp: DateTime<Utc>,
    pub route: String,
    pub principal: Option<String>,
    pub flavour: String,
    pub facets: BTreeMap<String, Vec<String>>,
    pub result_count: u64,
    pub duration_ms: u64,
}

/// Producer handle. Cheap to clone; all clones share the queue and the drop
/// counter.
#[derive(Clone)]
pub struct StatsSink {
    tx: mpsc::Sender<StatsRecord>,
    dropped: Arc<AtomicU64>,
}

impl StatsSink {
    /// Start the background writer and hand back the producer side.
    pub fn spawn(store: DocStore) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_BOUND);
        tokio::spawn(writer(store, rx));
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A sink without a writer, for code paths that must not touch the
    /// document store.
    #[cfg(test)]
    pub fn disconnected() -> (Self, mpsc::Receiver<StatsRecord>) {
        let (tx, rx) = mpsc::channel(2);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Offer a record. Never blocks; a full queue drops the record.
    pub fn record(&self, record: StatsRecord) {
        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records dropped so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn writer(store: DocStore, mut rx: mpsc::Receiver<StatsRecord>) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = store.insert_one("searches", &record).await {
            // Statistics are best-effort; a dead store must not take the
            // service with it.
            warn!("statistics write failed: {e}");
        } else {
            debug!(route = %record.route, "statistics record stored");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(route: &str) -> StatsRecord {
        StatsRecord {
            timestamp: Utc::now(),
            route: route.into(),
            principal: None,
            flavour: "freva".into(),
            facets: BTreeMap::new(),
            result_count: 0,
            duration_ms: 1,
        }
    }

    #[tokio::test]
    async fn overflow_drops_newest_and_counts() {
        let (sink, mut rx) = StatsSink::disconnected();
        sink.record(sample("a"));
        sink.record(sample("b"));
        // Queue bound is 2 in the disconnected sink; this one is dropped.
        sink.record(sample("c"));
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.recv().await.unwrap().route, "a");
        assert_eq!(rx.recv().await.unwrap().route, "b");
    }

    #[test]
    fn records_serialise_for_the_store() {
        let mut rec = sample("databrowser/data-search");
        rec.facets.insert("variable".into(), vec!["pr".into()]);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["flavour"], "freva");
        assert_eq!(json["facets"]["variable"][0], "pr");
        assert!(json["principal"].is_null());
    }
}
