//! Continuous subtree mirror between remote peer drives and the local
//! drive.
//!
//! One coroutine per `(remote key, folder)` with the states
//! `idle → running → (idle | pending)`: a change request arriving while
//! a run is active sets a pending flag, and the finishing run schedules
//! exactly one follow-up — a burst of changes coalesces into a single
//! rerun. After a run completes with no further changes, the local
//! subtree is byte-equal to the remote subtree for all filtered keys,
//! deletions included (pruning).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::drive::{subtree_matches, Drive, DriveStore};

/// Mirror tunables.
#[derive(Debug, Clone, Default)]
pub struct MirrorOptions {
    /// Minimum wall-clock a run occupies. A non-zero hold widens the
    /// window in which change bursts coalesce into one follow-up run.
    pub run_hold: Duration,
}

struct MirrorJob {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    runs: Arc<AtomicU64>,
}

/// Manager of mirror coroutines. `ensure_remote_mirror` is idempotent
/// per `(remote key, folder)`; concurrent mirrors for different keys run
/// in parallel, a second mirror for the same key is never started.
pub struct DriveMirror {
    store: Arc<DriveStore>,
    options: MirrorOptions,
    jobs: Mutex<HashMap<(String, String), MirrorJob>>,
}

impl DriveMirror {
    pub fn new(store: Arc<DriveStore>, options: MirrorOptions) -> Self {
        Self {
            store,
            options,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Start mirroring `folder` from the remote drive `remote_key` into
    /// the local drive. A mirror already running for this pair is left
    /// alone.
    pub fn ensure_remote_mirror(&self, remote_key: &str, folder: &str) {
        let job_key = (remote_key.to_string(), folder.to_string());
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job_key) {
            return;
        }

        let remote = self.store.open_remote(remote_key);
        let local = self.store.local();
        let topic = self.store.join_topic(remote_key);
        let (stop_tx, stop_rx) = watch::channel(false);
        let runs = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(mirror_loop(
            remote,
            local,
            folder.to_string(),
            topic,
            stop_rx,
            Arc::clone(&runs),
            self.options.clone(),
        ));
        tracing::info!(remote = %remote_key, folder = %folder, "mirror started");
        jobs.insert(
            job_key,
            MirrorJob {
                stop_tx,
                task,
                runs,
            },
        );
    }

    /// Stop one mirror: the watcher is cancelled and the topic released.
    /// The remote drive handle stays dormant — the underlying store is
    /// shared with other mirrors.
    pub fn stop(&self, remote_key: &str, folder: &str) {
        let job = self
            .jobs
            .lock()
            .remove(&(remote_key.to_string(), folder.to_string()));
        if let Some(job) = job {
            let _ = job.stop_tx.send(true);
            job.task.abort();
            tracing::info!(remote = %remote_key, folder = %folder, "mirror stopped");
        }
    }

    /// Stop every mirror (orderly shutdown).
    pub fn stop_all(&self) {
        let jobs: Vec<_> = {
            let mut map = self.jobs.lock();
            map.drain().collect()
        };
        for (_, job) in jobs {
            let _ = job.stop_tx.send(true);
            job.task.abort();
        }
    }

    /// How many runs a mirror has completed (quiescence checks).
    pub fn completed_runs(&self, remote_key: &str, folder: &str) -> u64 {
        self.jobs
            .lock()
            .get(&(remote_key.to_string(), folder.to_string()))
            .map(|j| j.runs.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn active_mirrors(&self) -> usize {
        self.jobs.lock().len()
    }
}

async fn mirror_loop(
    remote: Arc<Drive>,
    local: Arc<Drive>,
    folder: String,
    // Held for the life of the loop; dropping it releases the topic.
    _topic: crate::drive::TopicHandle,
    mut stop_rx: watch::Receiver<bool>,
    runs: Arc<AtomicU64>,
    options: MirrorOptions,
) {
    // One update wait before the initial mirror, so a freshly opened
    // remote has its first sync behind it.
    remote.update().await;

    // Subscribe before the initial run: changes landing during it are
    // picked up by the coalesced follow-up instead of being lost.
    let mut watcher = remote.watch();

    run_with_coalescing(&remote, &local, &folder, &mut watcher, &runs, &options).await;

    loop {
        let key = tokio::select! {
            _ = stop_rx.changed() => return,
            key = watcher.recv() => key,
        };
        match key {
            Ok(key) if !subtree_matches(&folder, &key) => continue,
            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
        run_with_coalescing(&remote, &local, &folder, &mut watcher, &runs, &options).await;
    }
}

/// Run the mirror, then keep rerunning while changes arrived during the
/// run — each drain coalesces a whole burst into one follow-up.
async fn run_with_coalescing(
    remote: &Drive,
    local: &Drive,
    folder: &str,
    watcher: &mut tokio::sync::broadcast::Receiver<String>,
    runs: &AtomicU64,
    options: &MirrorOptions,
) {
    loop {
        let started = tokio::time::Instant::now();
        if let Err(e) = run_mirror(remote, local, folder) {
            // Mirror errors are not fatal: the coroutine stays alive and
            // the next watcher event retries.
            tracing::warn!(folder = %folder, "mirror run failed: {e}");
        }
        if options.run_hold > Duration::ZERO {
            tokio::time::sleep_until(started + options.run_hold).await;
        }
        runs.fetch_add(1, Ordering::SeqCst);

        let mut pending = false;
        loop {
            match watcher.try_recv() {
                Ok(key) if subtree_matches(folder, &key) => pending = true,
                Ok(_) => {}
                Err(TryRecvError::Lagged(_)) => pending = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        if !pending {
            return;
        }
    }
}

/// One mirror pass: copy every filtered remote entry whose content hash
/// differs, then prune local entries the remote no longer has.
fn run_mirror(remote: &Drive, local: &Drive, folder: &str) -> anyhow::Result<()> {
    let remote_entries = remote.list_subtree(folder);
    let mut copied = 0usize;
    for entry in &remote_entries {
        let unchanged = local
            .entry(&entry.key)
            .is_some_and(|l| l.hash == entry.hash);
        if unchanged {
            continue;
        }
        let Some(data) = remote.get(&entry.key) else {
            // Deleted between list and read; pruning below handles it.
            continue;
        };
        local.put(&entry.key, data.as_ref().clone());
        copied += 1;
    }

    let mut pruned = 0usize;
    for entry in local.list_subtree(folder) {
        if !remote_entries.iter().any(|r| r.key == entry.key) {
            local.remove(&entry.key);
            pruned += 1;
        }
    }
    if copied > 0 || pruned > 0 {
        tracing::debug!(folder = %folder, copied, pruned, "mirror pass");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<DriveStore>, Arc<Drive>) {
        let store = DriveStore::new("local-key");
        let remote = Arc::new(Drive::new("remote-key"));
        store.insert_remote(Arc::clone(&remote));
        (store, remote)
    }

    #[test]
    fn run_mirror_copies_and_prunes() {
        let (store, remote) = setup();
        let local = store.local();
        remote.put("shared/a", b"one".to_vec());
        remote.put("shared/sub/b", b"two".to_vec());
        remote.put("other/c", b"outside".to_vec());
        local.put("shared/stale", b"gone upstream".to_vec());

        run_mirror(&remote, &local, "shared").unwrap();

        assert_eq!(local.get("shared/a").unwrap().as_slice(), b"one");
        assert_eq!(local.get("shared/sub/b").unwrap().as_slice(), b"two");
        assert!(local.get("other/c").is_none(), "filter excludes siblings");
        assert!(local.get("shared/stale").is_none(), "pruned");
    }

    #[test]
    fn run_mirror_skips_unchanged_entries() {
        let (store, remote) = setup();
        let local = store.local();
        remote.put("shared/a", b"same".to_vec());
        run_mirror(&remote, &local, "shared").unwrap();
        let seq_after_first = local.version();
        run_mirror(&remote, &local, "shared").unwrap();
        assert_eq!(local.version(), seq_after_first, "no redundant writes");
    }

    #[tokio::test]
    async fn ensure_is_idempotent_per_key() {
        let (store, _remote) = setup();
        let mirror = DriveMirror::new(Arc::clone(&store), MirrorOptions::default());
        mirror.ensure_remote_mirror("remote-key", "shared");
        mirror.ensure_remote_mirror("remote-key", "shared");
        assert_eq!(mirror.active_mirrors(), 1);
        mirror.ensure_remote_mirror("remote-key", "pfp");
        assert_eq!(mirror.active_mirrors(), 2);
        mirror.stop_all();
        assert_eq!(mirror.active_mirrors(), 0);
    }

    #[tokio::test]
    async fn stop_releases_topic_but_keeps_remote() {
        let (store, remote) = setup();
        let mirror = DriveMirror::new(Arc::clone(&store), MirrorOptions::default());
        mirror.ensure_remote_mirror("remote-key", "shared");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.topic_members("remote-key"), 1);

        mirror.stop("remote-key", "shared");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.topic_members("remote-key"), 0);

        // The remote handle stays usable for future mirrors.
        remote.put("shared/later", vec![1]);
        assert!(store.open_remote("remote-key").get("shared/later").is_some());
    }
}
