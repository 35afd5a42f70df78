use tempfile::tempdir;

use hopcache_graph::{DeathMark, Distance, HopError, JobId, TrackingMethod};

use crate::{GraphStore, StoreConfig, StoreError};

const JOB: JobId = JobId::new(7);

fn legal() -> Vec<String> {
    vec!["link".to_string()]
}

fn config(dir: &std::path::Path) -> StoreConfig {
    StoreConfig {
        fsync: false,
        ..StoreConfig::at(dir)
    }
}

fn record(store: &GraphStore, source: &str, target: &str) {
    store
        .record_reference(
            JOB,
            &legal(),
            source,
            target,
            "link",
            TrackingMethod::Accurate,
            "p1",
        )
        .unwrap();
}

fn drain(store: &GraphStore) {
    while !store
        .process_queue(JOB, &legal(), TrackingMethod::Accurate)
        .unwrap()
    {}
}

/// root -> a -> b, all typed "link": a at 1, b at 2.
fn build_chain(store: &GraphStore) {
    record(store, "", "a");
    record(store, "a", "b");
    drain(store);
}

#[test]
fn distances_survive_reopen_via_log_replay() {
    let dir = tempdir().unwrap();

    {
        let store = GraphStore::open(config(dir.path())).unwrap();
        build_chain(&store);
        let found = store.find_hop_counts(JOB, &["a".to_string(), "b".to_string()], "link");
        assert_eq!(found, vec![Distance::Finite(1), Distance::Finite(2)]);
        // No checkpoint: recovery must come from the command log alone.
    }

    {
        let store = GraphStore::open(config(dir.path())).unwrap();
        let found = store.find_hop_counts(JOB, &["a".to_string(), "b".to_string()], "link");
        assert_eq!(found, vec![Distance::Finite(1), Distance::Finite(2)]);
    }
}

#[test]
fn checkpoint_truncates_log_and_reopens_from_snapshot() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());

    {
        let store = GraphStore::open(cfg.clone()).unwrap();
        build_chain(&store);
        store.checkpoint().unwrap();
    }

    let wal_len = std::fs::metadata(dir.path().join("hopcache.wal"))
        .unwrap()
        .len();
    assert_eq!(wal_len, 0, "checkpoint should leave an empty log");

    let store = GraphStore::open(cfg).unwrap();
    let found = store.find_hop_counts(JOB, &["b".to_string()], "link");
    assert_eq!(found, vec![Distance::Finite(2)]);
}

#[test]
fn interrupted_pass_rolls_back_and_stays_resumable() {
    let dir = tempdir().unwrap();
    let store = GraphStore::open(config(dir.path())).unwrap();
    build_chain(&store);

    // A direct root edge to b makes the stored distance improvable, which
    // queues the existing row.
    record(&store, "", "b");
    let queued_before = store
        .with_job(JOB, |graph| graph.hops.queued_len())
        .unwrap();
    assert!(queued_before > 0);

    store.cancel_token().cancel();
    let err = store
        .process_queue(JOB, &legal(), TrackingMethod::Accurate)
        .unwrap_err();
    assert!(matches!(err, StoreError::Hop(HopError::Interrupted)));

    // The transaction rolled back: same rows still queued.
    let queued_after = store
        .with_job(JOB, |graph| graph.hops.queued_len())
        .unwrap();
    assert_eq!(queued_before, queued_after);

    // Resume after clearing the token.
    store.cancel_token().clear();
    drain(&store);
    let found = store.find_hop_counts(JOB, &["b".to_string()], "link");
    assert_eq!(found, vec![Distance::Finite(1)]);
}

#[test]
fn restart_requeues_rows_left_mid_invalidation() {
    let dir = tempdir().unwrap();
    let store = GraphStore::open(config(dir.path())).unwrap();
    build_chain(&store);

    // Forge the state a process dying between marking and requeue would
    // leave behind: a row stuck in `Deleting`.
    {
        let mut jobs = store.jobs.write();
        let graph = jobs.get_mut(&JOB).unwrap();
        let id = graph
            .hops
            .iter()
            .find(|(_, row)| row.node == "b")
            .map(|(id, _)| id)
            .unwrap();
        graph.hops.update(id, Distance::Infinite, DeathMark::Deleting);
    }

    store.restart("p1").unwrap();
    let queued = store
        .with_job(JOB, |graph| graph.hops.queued_len())
        .unwrap();
    assert_eq!(queued, 1);

    drain(&store);
    let found = store.find_hop_counts(JOB, &["b".to_string()], "link");
    assert_eq!(found, vec![Distance::Finite(2)]);
}

#[test]
fn delete_job_removes_all_state() {
    let dir = tempdir().unwrap();
    let store = GraphStore::open(config(dir.path())).unwrap();
    build_chain(&store);

    store.delete_job(JOB).unwrap();
    assert!(store.with_job(JOB, |_| ()).is_none());
    let found = store.find_hop_counts(JOB, &["a".to_string()], "link");
    assert_eq!(found, vec![Distance::Infinite]);
}

#[test]
fn delete_matching_documents_resolves_criteria() {
    let dir = tempdir().unwrap();
    let store = GraphStore::open(config(dir.path())).unwrap();
    build_chain(&store);

    let removed = store
        .delete_matching_documents(JOB, &legal(), TrackingMethod::Accurate, |doc| {
            doc.starts_with('a')
        })
        .unwrap();
    assert_eq!(removed, vec!["a".to_string()]);

    drain(&store);
    // b relied on a's outgoing edge; with it gone, b is unreachable.
    let found = store.find_hop_counts(JOB, &["b".to_string()], "link");
    assert_eq!(found, vec![Distance::Infinite]);
}

#[test]
fn corrupt_snapshot_is_rejected() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    {
        let store = GraphStore::open(cfg.clone()).unwrap();
        build_chain(&store);
        store.checkpoint().unwrap();
    }
    std::fs::write(dir.path().join("hopcache.snap"), b"NOTASNAPxxxxxxxx").unwrap();
    match GraphStore::open(cfg) {
        Err(StoreError::Format(_)) | Err(StoreError::Codec(_)) => {}
        other => panic!("expected format rejection, got {other:?}"),
    }
}

#[test]
fn config_round_trips_through_json() {
    let cfg = StoreConfig::at("/tmp/x");
    let text = serde_json::to_string(&cfg).unwrap();
    let back: StoreConfig = serde_json::from_str(&text).unwrap();
    assert_eq!(back.data_dir, cfg.data_dir);
    assert_eq!(back.max_in_terms, cfg.max_in_terms);
    assert_eq!(back.queue_batch, cfg.queue_batch);
}
