// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! On-disk cache for the helper session. Files are named by the hex action
//! id; writes go to a `.tmp-*` file first and are renamed into place so a
//! crashed write never leaves a half-written entry visible.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Clone, Debug)]
pub struct Entry {
    pub output_id: Vec<u8>,
    pub disk_path: PathBuf,
    pub size: u64,
    pub put_time: DateTime<Utc>,
}

pub struct LocalCache {
    dir: PathBuf,
    // The request loop is single threaded; the mutex is for background
    // diagnostics that read the map.
    entries: Mutex<HashMap<String, Entry>>,
}

impl LocalCache {
    /// Open (creating if needed) the cache directory. Without an explicit
    /// directory a fresh session directory is created under the user cache
    /// dir: `<user-cache-dir>/omni-cache/gocacheprog/session-XXXXXX/`.
    pub fn open(dir: Option<PathBuf>) -> io::Result<LocalCache> {
        let dir = match dir {
            Some(dir) => dir,
            None => {
                let base = dirs::cache_dir().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no user cache directory")
                })?;
                base.join("omni-cache")
                    .join("gocacheprog")
                    .join(format!("session-{:06x}", rand::random::<u32>() & 0xff_ffff))
            }
        };
        std::fs::create_dir_all(&dir)?;
        Ok(LocalCache {
            dir,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, action_hex: &str) -> Option<Entry> {
        self.entries.lock().get(action_hex).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Store a body under the action id and remember the entry for the rest
    /// of the session.
    pub async fn put(
        &self,
        action_hex: &str,
        output_id: Vec<u8>,
        body: Bytes,
    ) -> io::Result<Entry> {
        let final_path = self.dir.join(action_hex);
        let tmp_path = self
            .dir
            .join(format!(".tmp-{action_hex}-{:08x}", rand::random::<u32>()));

        tokio::fs::write(&tmp_path, &body).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;

        let entry = Entry {
            output_id,
            disk_path: final_path,
            size: body.len() as u64,
            put_time: Utc::now(),
        };
        self.entries
            .lock()
            .insert(action_hex.to_owned(), entry.clone());
        Ok(entry)
    }

    /// Drop in-progress markers left in the session directory. Cached entry
    /// files stay: the build that spawned this session may still read them.
    pub async fn remove_incomplete_files(&self) {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) => {
                tracing::warn!(dir = %self.dir.display(), error = %err, "cache dir scan failed");
                return;
            }
        };
        while let Ok(Some(file)) = dir.next_entry().await {
            let name = file.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(".tmp-") || name.starts_with(".download-") {
                if let Err(err) = tokio::fs::remove_file(file.path()).await {
                    tracing::warn!(file = %file.path().display(), error = %err, "failed to remove stale file");
                }
            }
        }
    }
}
