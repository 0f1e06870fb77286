//! Drive mirror end-to-end behavior: convergence, pruning, coalescing.

use std::sync::Arc;
use std::time::Duration;

use hypertuna_relay::drive::{Drive, DriveStore};
use hypertuna_relay::mirror::{DriveMirror, MirrorOptions};

const REMOTE: &str = "remote-peer-key";
const FOLDER: &str = "groups/grp1";

fn setup() -> (Arc<DriveStore>, Arc<Drive>) {
    let store = DriveStore::new("local-key");
    let remote = Arc::new(Drive::new(REMOTE));
    store.insert_remote(Arc::clone(&remote));
    (store, remote)
}

/// Wait until the mirror has been idle for one poll interval.
async fn settle(mirror: &DriveMirror, remote_key: &str, folder: &str) {
    let mut last = mirror.completed_runs(remote_key, folder);
    loop {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let now = mirror.completed_runs(remote_key, folder);
        if now == last && now > 0 {
            return;
        }
        last = now;
    }
}

fn assert_subtree_equal(remote: &Drive, local: &Drive, folder: &str) {
    let remote_entries = remote.list_subtree(folder);
    let local_entries = local.list_subtree(folder);
    assert_eq!(
        remote_entries.len(),
        local_entries.len(),
        "entry counts differ"
    );
    for entry in remote_entries {
        let local_data = local
            .get(&entry.key)
            .unwrap_or_else(|| panic!("missing local entry {}", entry.key));
        assert_eq!(
            local_data.as_slice(),
            remote.get(&entry.key).unwrap().as_slice(),
            "bytes differ for {}",
            entry.key
        );
    }
}

#[tokio::test]
async fn initial_mirror_converges_with_prune() {
    let (store, remote) = setup();
    remote.put(&format!("{FOLDER}/a.txt"), b"alpha".to_vec());
    remote.put(&format!("{FOLDER}/sub/b.txt"), b"beta".to_vec());
    remote.put("elsewhere/c.txt", b"outside".to_vec());
    store.local().put(&format!("{FOLDER}/stale"), b"old".to_vec());

    let mirror = DriveMirror::new(Arc::clone(&store), MirrorOptions::default());
    mirror.ensure_remote_mirror(REMOTE, FOLDER);
    settle(&mirror, REMOTE, FOLDER).await;

    assert_subtree_equal(&remote, &store.local(), FOLDER);
    assert!(store.local().get("elsewhere/c.txt").is_none());
    assert!(store.local().get(&format!("{FOLDER}/stale")).is_none());
    mirror.stop_all();
}

#[tokio::test]
async fn remote_deletion_propagates() {
    let (store, remote) = setup();
    remote.put(&format!("{FOLDER}/keep"), b"keep".to_vec());
    remote.put(&format!("{FOLDER}/drop"), b"drop".to_vec());

    let mirror = DriveMirror::new(Arc::clone(&store), MirrorOptions::default());
    mirror.ensure_remote_mirror(REMOTE, FOLDER);
    settle(&mirror, REMOTE, FOLDER).await;
    assert!(store.local().get(&format!("{FOLDER}/drop")).is_some());

    remote.remove(&format!("{FOLDER}/drop"));
    settle(&mirror, REMOTE, FOLDER).await;
    assert!(store.local().get(&format!("{FOLDER}/drop")).is_none());
    assert!(store.local().get(&format!("{FOLDER}/keep")).is_some());
    mirror.stop_all();
}

#[tokio::test]
async fn change_burst_during_run_coalesces_into_one_rerun() {
    let (store, remote) = setup();
    remote.put(&format!("{FOLDER}/seed"), b"seed".to_vec());

    // Hold each run open long enough that the whole burst lands inside
    // the initial run's window.
    let mirror = DriveMirror::new(
        Arc::clone(&store),
        MirrorOptions {
            run_hold: Duration::from_millis(300),
        },
    );
    mirror.ensure_remote_mirror(REMOTE, FOLDER);

    // Let the initial run start, then touch 50 files while it holds.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for i in 0..50 {
        remote.put(&format!("{FOLDER}/burst-{i}"), format!("v{i}").into_bytes());
    }

    // Past both held runs plus margin; nothing further is changing.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(
        mirror.completed_runs(REMOTE, FOLDER),
        2,
        "burst during a run must schedule exactly one follow-up"
    );
    assert_subtree_equal(&remote, &store.local(), FOLDER);
    mirror.stop_all();
}

#[tokio::test]
async fn changes_outside_folder_do_not_rerun() {
    let (store, remote) = setup();
    remote.put(&format!("{FOLDER}/a"), b"a".to_vec());

    let mirror = DriveMirror::new(Arc::clone(&store), MirrorOptions::default());
    mirror.ensure_remote_mirror(REMOTE, FOLDER);
    settle(&mirror, REMOTE, FOLDER).await;
    let runs = mirror.completed_runs(REMOTE, FOLDER);

    remote.put("other/tree", b"irrelevant".to_vec());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mirror.completed_runs(REMOTE, FOLDER), runs);
    mirror.stop_all();
}

#[tokio::test]
async fn parallel_mirrors_for_different_keys() {
    // Different peers mirror disjoint subtrees; each converges without
    // pruning the other's.
    let store = DriveStore::new("local-key");
    let peer_a = Arc::new(Drive::new("peer-a"));
    let peer_b = Arc::new(Drive::new("peer-b"));
    peer_a.put("peers/a/file", b"from a".to_vec());
    peer_b.put("peers/b/file", b"from b".to_vec());
    store.insert_remote(Arc::clone(&peer_a));
    store.insert_remote(Arc::clone(&peer_b));

    let mirror = DriveMirror::new(Arc::clone(&store), MirrorOptions::default());
    mirror.ensure_remote_mirror("peer-a", "peers/a");
    mirror.ensure_remote_mirror("peer-b", "peers/b");
    settle(&mirror, "peer-a", "peers/a").await;
    settle(&mirror, "peer-b", "peers/b").await;

    assert!(store.local().get("peers/a/file").is_some());
    assert!(store.local().get("peers/b/file").is_some());
    mirror.stop_all();
}
