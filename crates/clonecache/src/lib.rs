//! tb_clonecache
//!
//! A bounded, concurrency-safe cache of shallow git clones keyed by repo
//! spec (`owner/repo`). Multiple concurrent requests for the same repo
//! collapse into a single clone (per-repo mutex, single-flight); a clone
//! is either fully present or entirely absent on disk — callers never see
//! a half-written checkout, because we clone into a temp directory and
//! rename it into place only on success.
//!
//! Handles are refcounted: holding a `CloneHandle` keeps the underlying
//! directory pinned so an eviction sweep running concurrently can't pull
//! the rug out from under an in-flight code-analysis pass.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tb_safecmd::{clone_repo, CloneOptions, SafeCmdError};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Error)]
pub enum CloneCacheError {
    #[error("clone failed: {0}")]
    Clone(#[from] SafeCmdError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct CacheEntry {
    path: PathBuf,
    size_bytes: u64,
    last_access: StdMutex<Instant>,
}

/// A pinned reference to a cached clone. The directory is guaranteed to
/// exist and stay put for as long as any handle for it is alive.
#[derive(Clone)]
pub struct CloneHandle {
    entry: Arc<CacheEntry>,
}

impl CloneHandle {
    pub fn path(&self) -> &Path {
        &self.entry.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.entry.size_bytes
    }
}

pub struct CloneCache {
    base_dir: PathBuf,
    ttl: Duration,
    max_total_bytes: u64,
    entries: StdMutex<HashMap<String, Arc<CacheEntry>>>,
    repo_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    next_tmp_id: AtomicU64,
}

impl CloneCache {
    pub fn new(base_dir: impl Into<PathBuf>, ttl: Duration, max_total_bytes: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            ttl,
            max_total_bytes,
            entries: StdMutex::new(HashMap::new()),
            repo_locks: StdMutex::new(HashMap::new()),
            next_tmp_id: AtomicU64::new(0),
        }
    }

    fn repo_lock(&self, repo_spec: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.repo_locks.lock().expect("clone cache mutex poisoned");
        locks.entry(repo_spec.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    fn lookup(&self, repo_spec: &str) -> Option<Arc<CacheEntry>> {
        let entries = self.entries.lock().expect("clone cache mutex poisoned");
        entries.get(repo_spec).cloned()
    }

    /// Acquire a handle for `repo_spec`, cloning `clone_url` if it isn't
    /// already cached (or evicted since last use). Concurrent callers for
    /// the same repo serialize on a per-repo lock; callers for different
    /// repos proceed in parallel.
    pub async fn acquire(
        &self,
        repo_spec: &str,
        clone_url: &str,
        clone_opts: &CloneOptions,
    ) -> Result<CloneHandle, CloneCacheError> {
        if let Some(entry) = self.lookup(repo_spec) {
            *entry.last_access.lock().expect("clone cache mutex poisoned") = Instant::now();
            return Ok(CloneHandle { entry });
        }

        let lock = self.repo_lock(repo_spec);
        let _guard = lock.lock().await;

        // Double-check: another task may have finished cloning while we
        // waited for the per-repo lock.
        if let Some(entry) = self.lookup(repo_spec) {
            *entry.last_access.lock().expect("clone cache mutex poisoned") = Instant::now();
            return Ok(CloneHandle { entry });
        }

        tokio::fs::create_dir_all(&self.base_dir).await?;
        let tmp_id = self.next_tmp_id.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self.base_dir.join(format!(".tmp-{tmp_id}"));
        if tmp_path.exists() {
            tokio::fs::remove_dir_all(&tmp_path).await?;
        }

        clone_repo(clone_url, &tmp_path, clone_opts).await?;

        let final_path = self.base_dir.join(sanitize_dirname(repo_spec));
        if final_path.exists() {
            tokio::fs::remove_dir_all(&final_path).await?;
        }
        tokio::fs::rename(&tmp_path, &final_path).await?;

        let size_bytes = directory_size(&final_path)?;
        let entry = Arc::new(CacheEntry {
            path: final_path,
            size_bytes,
            last_access: StdMutex::new(Instant::now()),
        });

        let mut entries = self.entries.lock().expect("clone cache mutex poisoned");
        entries.insert(repo_spec.to_string(), entry.clone());

        Ok(CloneHandle { entry })
    }

    /// Remove entries that are both past TTL and not currently held by any
    /// handle (`Arc::strong_count` is 1 — only the cache map's own
    /// reference). If the cache is still over `max_total_bytes` after that
    /// pass, evict further by least-recently-used among what remains
    /// evictable, oldest first.
    pub fn sweep(&self) -> Vec<String> {
        let mut evicted = Vec::new();
        let mut entries = self.entries.lock().expect("clone cache mutex poisoned");

        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| {
                Arc::strong_count(e) == 1
                    && now.duration_since(*e.last_access.lock().expect("poisoned")) > self.ttl
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = entries.remove(&key) {
                let _ = std::fs::remove_dir_all(&entry.path);
                evicted.push(key);
            }
        }

        let mut total: u64 = entries.values().map(|e| e.size_bytes).sum();
        if total > self.max_total_bytes {
            let mut candidates: Vec<(String, Instant, u64)> = entries
                .iter()
                .filter(|(_, e)| Arc::strong_count(e) == 1)
                .map(|(k, e)| (k.clone(), *e.last_access.lock().expect("poisoned"), e.size_bytes))
                .collect();
            candidates.sort_by_key(|(_, last_access, _)| *last_access);

            for (key, _, size) in candidates {
                if total <= self.max_total_bytes {
                    break;
                }
                if let Some(entry) = entries.remove(&key) {
                    let _ = std::fs::remove_dir_all(&entry.path);
                    total = total.saturating_sub(size);
                    evicted.push(key);
                }
            }
        }

        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("clone cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sanitize_dirname(repo_spec: &str) -> String {
    repo_spec.replace('/', "__")
}

fn directory_size(path: &Path) -> Result<u64, std::io::Error> {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_dirname_has_no_path_separators() {
        let d = sanitize_dirname("octocat/hello-world");
        assert!(!d.contains('/'));
    }

    #[tokio::test]
    async fn empty_cache_reports_len_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CloneCache::new(tmp.path(), Duration::from_secs(300), 1 << 30);
        assert_eq!(cache.len(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_on_empty_cache_evicts_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CloneCache::new(tmp.path(), Duration::from_millis(1), 1 << 30);
        assert!(cache.sweep().is_empty());
    }
}
