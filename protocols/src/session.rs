// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Server-side state for multi-step client uploads (GitHub Actions cache v1
//! and the Tuist module cache). A session is created on reserve, accumulates
//! parts, and is removed when the backend commit succeeds. A session that
//! fails commit stays in the map so the client can retry; the reaper removes
//! sessions after five minutes without activity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;

/// Inactivity TTL after which a session is reaped.
pub const SESSION_TTL: Duration = Duration::from_secs(5 * 60);

/// Session ids stay below 2^53 so JavaScript clients can round-trip them
/// through a JSON number without loss.
const MAX_SESSION_ID: u64 = (1 << 53) - 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartState {
    pub etag: String,
    pub size: u64,
}

#[derive(Debug)]
pub struct UploadSession {
    pub key: String,
    pub version: String,
    pub upload_id: String,
    parts: BTreeMap<u32, PartState>,
    ranges: HashMap<(u64, u64), u32>,
    started_at: Instant,
    last_touched: Instant,
}

impl UploadSession {
    pub fn new(key: String, version: String, upload_id: String) -> Self {
        let now = Instant::now();
        UploadSession {
            key,
            version,
            upload_id,
            parts: BTreeMap::new(),
            ranges: HashMap::new(),
            started_at: now,
            last_touched: now,
        }
    }

    /// Map a byte range to a part number. Clients send ranges, not part
    /// numbers: numbers are assigned 1, 2, 3, ... in the order a range is
    /// first seen, and a repeated range (a client retry) keeps its number.
    /// Non-contiguous and overlapping ranges are accepted; the blob is
    /// assembled in part-number order at commit.
    pub fn resolve_part(&mut self, start: u64, end: u64) -> u32 {
        let next = (self.ranges.len() + 1) as u32;
        *self.ranges.entry((start, end)).or_insert(next)
    }

    /// Record the backend's ETag for a part. A later upload for the same part
    /// number replaces the earlier one.
    pub fn record_part(&mut self, part_number: u32, etag: String, size: u64) {
        self.parts.insert(part_number, PartState { etag, size });
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Parts in ascending part-number order plus the total size.
    pub fn finalize(&self) -> (Vec<(u32, String)>, u64) {
        let mut total = 0;
        let parts = self
            .parts
            .iter()
            .map(|(number, state)| {
                total += state.size;
                (*number, state.etag.clone())
            })
            .collect();
        (parts, total)
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    fn touch(&mut self) {
        self.last_touched = Instant::now();
    }
}

/// Insertion-ordered is not needed here: sessions are keyed by id and reaped
/// by age, so a plain map behind one mutex does the job.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<u64, UploadSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        SessionStore {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Draw an unused session id uniformly from `[0, 2^53 - 1]`.
    pub fn new_session_id(&self) -> u64 {
        let mut rng = rand::thread_rng();
        let sessions = self.inner.lock();
        loop {
            let id = rng.gen_range(0..=MAX_SESSION_ID);
            if !sessions.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn insert(&self, id: u64, session: UploadSession) {
        self.inner.lock().insert(id, session);
    }

    /// Run `f` against the session, updating its activity timestamp. Returns
    /// `None` when the session does not exist (expired or never created).
    pub fn with_session<R>(&self, id: u64, f: impl FnOnce(&mut UploadSession) -> R) -> Option<R> {
        let mut sessions = self.inner.lock();
        let session = sessions.get_mut(&id)?;
        session.touch();
        Some(f(session))
    }

    pub fn remove(&self, id: u64) -> Option<UploadSession> {
        self.inner.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Periodically drop sessions whose last activity is older than `ttl`.
    pub fn spawn_reaper(&self, ttl: Duration) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl / 4);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let now = Instant::now();
                let mut sessions = inner.lock();
                let before = sessions.len();
                sessions.retain(|_, session| now.duration_since(session.last_touched) < ttl);
                let reaped = before - sessions.len();
                if reaped > 0 {
                    tracing::info!(reaped, "reaped idle upload sessions");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{SessionStore, UploadSession, SESSION_TTL};

    fn session() -> UploadSession {
        UploadSession::new("key".to_owned(), "v1".to_owned(), "upload-1".to_owned())
    }

    #[test]
    fn ranges_get_monotonic_part_numbers() {
        let mut session = session();
        assert_eq!(session.resolve_part(0, 4), 1);
        assert_eq!(session.resolve_part(5, 10), 2);
        // duplicate range (client retry) keeps its part number
        assert_eq!(session.resolve_part(0, 4), 1);
        // non-contiguous and overlapping ranges are accepted
        assert_eq!(session.resolve_part(100, 200), 3);
        assert_eq!(session.resolve_part(3, 7), 4);
    }

    #[test]
    fn finalize_orders_by_part_number_and_sums_sizes() {
        let mut session = session();
        let second = session.resolve_part(5, 10);
        session.record_part(second, "b".to_owned(), 6);
        let first = session.resolve_part(0, 4);
        session.record_part(first, "a".to_owned(), 5);

        let (parts, total) = session.finalize();
        assert_eq!(parts, vec![(1, "b".to_owned()), (2, "a".to_owned())]);
        assert_eq!(total, 11);
    }

    #[test]
    fn later_part_upload_overrides_earlier() {
        let mut session = session();
        session.record_part(1, "a".to_owned(), 5);
        session.record_part(1, "a2".to_owned(), 7);
        let (parts, total) = session.finalize();
        assert_eq!(parts, vec![(1, "a2".to_owned())]);
        assert_eq!(total, 7);
    }

    #[test]
    fn session_ids_fit_in_json_numbers() {
        let store = SessionStore::new();
        for _ in 0..1000 {
            assert!(store.new_session_id() < (1 << 53));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_drops_idle_sessions() {
        let store = SessionStore::new();
        let id = store.new_session_id();
        store.insert(id, session());
        let reaper = store.spawn_reaper(SESSION_TTL);

        // Activity keeps the session alive past one TTL.
        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        tokio::task::yield_now().await;
        assert!(store.with_session(id, |_| ()).is_some());

        tokio::time::advance(SESSION_TTL + Duration::from_secs(80)).await;
        tokio::task::yield_now().await;
        assert!(store.with_session(id, |_| ()).is_none());
        reaper.abort();
    }
}
