// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Query parameter that asks a handler on this process to suppress hit/miss
/// accounting for a request. Protocols that redirect a client to another local
/// handler for the bulk transfer add it to the redirect URL so one logical
/// lookup is not counted twice.
pub const SKIP_HIT_MISS_PARAM: &str = "omni_cache_skip_hit_miss";

/// Append the stats-skip marker to a URL.
pub fn append_skip_marker(url: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{SKIP_HIT_MISS_PARAM}=1")
}

/// Whether a raw query string carries the stats-skip marker. The marker may
/// appear at any position in the query.
pub fn has_skip_marker(query: Option<&str>) -> bool {
    let query = match query {
        Some(q) => q,
        None => return false,
    };
    query.split('&').any(|pair| match pair.split_once('=') {
        Some((name, value)) => name == SKIP_HIT_MISS_PARAM && value == "1",
        None => false,
    })
}

#[derive(Default)]
struct TransferCounters {
    count: AtomicU64,
    bytes: AtomicU64,
    duration_micros: AtomicU64,
}

impl TransferCounters {
    fn record(&self, bytes: u64, duration: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            count: self.count.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            duration: Duration::from_micros(self.duration_micros.load(Ordering::Relaxed)),
        }
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.duration_micros.store(0, Ordering::Relaxed);
    }
}

/// Cache hit/miss and transfer counters for the whole process. Every counter
/// is an atomic integer; there are no locks on any recording path.
#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    downloads: TransferCounters,
    uploads: TransferCounters,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: u64, duration: Duration) {
        self.downloads.record(bytes, duration);
    }

    pub fn record_upload(&self, bytes: u64, duration: Duration) {
        self.uploads.record(bytes, duration);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            downloads: self.downloads.snapshot(),
            uploads: self.uploads.snapshot(),
        }
    }

    /// Reset all counters to zero and return the post-reset snapshot.
    pub fn reset(&self) -> Snapshot {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.downloads.reset();
        self.uploads.reset();
        self.snapshot()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransferSnapshot {
    pub count: u64,
    pub bytes: u64,
    pub duration: Duration,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Snapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub downloads: TransferSnapshot,
    pub uploads: TransferSnapshot,
}

impl Snapshot {
    /// Whether nothing has been recorded since the last reset.
    pub fn is_idle(&self) -> bool {
        self.cache_hits == 0
            && self.cache_misses == 0
            && self.downloads.count == 0
            && self.uploads.count == 0
    }

    pub fn summarize(&self) -> Summary {
        Summary {
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            cache_hit_rate_percent: hit_rate_percent(self.cache_hits, self.cache_misses),
            downloads: TransferSummary::from(self.downloads),
            uploads: TransferSummary::from(self.uploads),
        }
    }
}

fn hit_rate_percent(hits: u64, misses: u64) -> f64 {
    let lookups = hits + misses;
    if lookups == 0 {
        return 0.0;
    }
    (hits as f64) * 100.0 / (lookups as f64)
}

/// Snapshot with derived averages and rates, in the shape exposed by the
/// `/metrics/cache` endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate_percent: f64,
    pub downloads: TransferSummary,
    pub uploads: TransferSummary,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct TransferSummary {
    pub count: u64,
    pub bytes: u64,
    pub duration_ms: u64,
    pub avg_bytes: u64,
    pub avg_duration_ms: u64,
    pub bytes_per_sec: u64,
}

impl From<TransferSnapshot> for TransferSummary {
    fn from(snapshot: TransferSnapshot) -> Self {
        let duration_ms = snapshot.duration.as_millis() as u64;
        let (avg_bytes, avg_duration_ms) = if snapshot.count == 0 {
            (0, 0)
        } else {
            (snapshot.bytes / snapshot.count, duration_ms / snapshot.count)
        };
        let bytes_per_sec = if snapshot.duration.is_zero() {
            0
        } else {
            ((snapshot.bytes as f64) / snapshot.duration.as_secs_f64()) as u64
        };
        TransferSummary {
            count: snapshot.count,
            bytes: snapshot.bytes,
            duration_ms,
            avg_bytes,
            avg_duration_ms,
            bytes_per_sec,
        }
    }
}
