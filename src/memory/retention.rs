//! Age-based retention.
//!
//! The controller keeps the dataset within a bounded time window: when the
//! span between the oldest and newest record exceeds `max_days`, the oldest
//! `purge_days` worth of records is removed and the vector index rebuilt.
//! Purges are resumable — an interrupted purge simply continues from the new
//! `min(created_at)` on the next check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use super::store::MemoryStore;
use crate::config::RetentionConfig;

/// Lifetime counters for the retention loop.
#[derive(Debug, Default)]
pub struct RetentionCounters {
    total_purged: AtomicU64,
    last_purge: Mutex<Option<String>>,
}

/// Snapshot of the retention counters.
#[derive(Debug, Clone, Serialize)]
pub struct RetentionStats {
    #[serde(rename = "totalPurged")]
    pub total_purged: u64,
    #[serde(rename = "lastPurge", skip_serializing_if = "Option::is_none")]
    pub last_purge: Option<String>,
}

impl RetentionCounters {
    fn record_purge(&self, purged: u64) {
        self.total_purged.fetch_add(purged, Ordering::Relaxed);
        if let Ok(mut last) = self.last_purge.lock() {
            *last = Some(super::now_rfc3339());
        }
    }

    pub fn snapshot(&self) -> RetentionStats {
        RetentionStats {
            total_purged: self.total_purged.load(Ordering::Relaxed),
            last_purge: self.last_purge.lock().ok().and_then(|l| l.clone()),
        }
    }
}

/// Periodic loop that bounds the dataset's age window.
#[derive(Clone)]
pub struct RetentionController {
    store: MemoryStore,
    config: RetentionConfig,
    counters: Arc<RetentionCounters>,
}

impl RetentionController {
    pub fn new(store: MemoryStore, config: RetentionConfig) -> Self {
        Self {
            store,
            config,
            counters: Arc::new(RetentionCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<RetentionCounters> {
        self.counters.clone()
    }

    /// Run one retention check. Returns the number of records purged.
    pub fn check_once(&self) -> Result<u64> {
        let Some((oldest, newest)) = self.store.created_at_range()? else {
            return Ok(0);
        };

        let oldest_ts = parse_ts(&oldest)?;
        let newest_ts = parse_ts(&newest)?;
        let age_days = (newest_ts - oldest_ts).num_days();

        if age_days <= self.config.max_days {
            return Ok(0);
        }

        let cutoff = oldest_ts + ChronoDuration::days(self.config.purge_days);
        info!(
            age_days,
            max_days = self.config.max_days,
            cutoff = %cutoff.to_rfc3339(),
            "dataset exceeds retention window, purging"
        );

        let purged = self.store.purge_created_before(&cutoff.to_rfc3339())?;
        self.store.compact_index()?;
        self.store.checkpoint()?;
        self.store.rebuild_index()?;

        self.counters.record_purge(purged);
        info!(purged, "retention purge complete");
        Ok(purged)
    }

    /// Background loop: an immediate check on start, then one per interval,
    /// and a final check on graceful stop (important for short-lived
    /// sessions).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        self.check_blocking().await;

        let period =
            std::time::Duration::from_secs(self.config.check_interval_hours.max(1) * 3600);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_blocking().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.check_blocking().await;
                        info!("retention controller stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn check_blocking(&self) {
        let controller = self.clone();
        let result = tokio::task::spawn_blocking(move || controller.check_once()).await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "retention check failed"),
            Err(e) => warn!(error = %e, "retention task failed"),
        }
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| anyhow::anyhow!("bad timestamp {value:?}: {e}"))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{Record, RecordType};
    use crate::memory::{mint_record_id, now_rfc3339};

    fn spike(seed: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 384];
        v[seed % 384] = 1.0;
        v
    }

    fn insert_at(store: &MemoryStore, text: &str, created_at: &str, seed: usize) -> String {
        let record = Record {
            id: mint_record_id(),
            user_id: "u1".into(),
            record_type: RecordType::UserMemory,
            source_text: text.into(),
            metadata: None,
            screenshot: None,
            extracted_text: None,
            embedding: Some(spike(seed)),
            created_at: created_at.into(),
            updated_at: now_rfc3339(),
        };
        let id = record.id.clone();
        store.insert(&record, &[]).unwrap();
        id
    }

    fn config(max_days: i64, purge_days: i64) -> RetentionConfig {
        RetentionConfig {
            enabled: true,
            max_days,
            purge_days,
            check_interval_hours: 24,
        }
    }

    #[test]
    fn check_is_noop_on_empty_store() {
        let store = MemoryStore::open_in_memory().unwrap();
        let controller = RetentionController::new(store, config(10, 5));
        assert_eq!(controller.check_once().unwrap(), 0);
    }

    #[test]
    fn check_is_noop_within_window() {
        let store = MemoryStore::open_in_memory().unwrap();
        insert_at(&store, "recent", &now_rfc3339(), 0);
        let controller = RetentionController::new(store, config(10, 5));
        assert_eq!(controller.check_once().unwrap(), 0);
    }

    #[test]
    fn purge_removes_oldest_slice() {
        let store = MemoryStore::open_in_memory().unwrap();
        let now = Utc::now();
        let old = insert_at(
            &store,
            "ancient",
            &(now - ChronoDuration::days(30)).to_rfc3339(),
            0,
        );
        let mid = insert_at(
            &store,
            "middle",
            &(now - ChronoDuration::days(10)).to_rfc3339(),
            1,
        );
        let fresh = insert_at(&store, "fresh", &now.to_rfc3339(), 2);

        // window 20 days, purge the oldest 15 days worth
        let controller = RetentionController::new(store.clone(), config(20, 15));
        let purged = controller.check_once().unwrap();
        assert_eq!(purged, 1);

        assert!(store.get_by_id(&old, "u1").unwrap().is_none());
        assert!(store.get_by_id(&mid, "u1").unwrap().is_some());
        assert!(store.get_by_id(&fresh, "u1").unwrap().is_some());

        let stats = controller.counters().snapshot();
        assert_eq!(stats.total_purged, 1);
        assert!(stats.last_purge.is_some());
    }

    #[test]
    fn dataset_age_stays_bounded_after_repeated_checks() {
        let store = MemoryStore::open_in_memory().unwrap();
        let now = Utc::now();
        for day in [40i64, 35, 30, 20, 10, 0] {
            insert_at(
                &store,
                &format!("day {day}"),
                &(now - ChronoDuration::days(day)).to_rfc3339(),
                day as usize,
            );
        }

        let controller = RetentionController::new(store.clone(), config(15, 10));
        // Run until stable; each pass trims the oldest slice.
        for _ in 0..5 {
            controller.check_once().unwrap();
        }

        let (oldest, newest) = store.created_at_range().unwrap().unwrap();
        let span = parse_ts(&newest).unwrap() - parse_ts(&oldest).unwrap();
        assert!(
            span.num_days() <= 15,
            "dataset age {} exceeds max_days",
            span.num_days()
        );
    }

    #[test]
    fn purge_keeps_search_consistent() {
        let store = MemoryStore::open_in_memory().unwrap();
        let now = Utc::now();
        let ancient = insert_at(
            &store,
            "ancient",
            &(now - ChronoDuration::days(100)).to_rfc3339(),
            0,
        );
        let fresh = insert_at(&store, "fresh", &now.to_rfc3339(), 1);

        let controller = RetentionController::new(store.clone(), config(30, 50));
        controller.check_once().unwrap();

        // Searching the purged range returns nothing; the survivor is intact.
        let results = store
            .vector_search("u1", &spike(0), 5, &Default::default())
            .unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.record.id.as_str()).collect();
        assert!(!ids.contains(&ancient.as_str()));
        assert!(ids.contains(&fresh.as_str()));
    }
}
