//! Workspace integration tests: a simulated crawl driving the storage facade
//! end to end: seeding, discovery, re-scan sweeps, document removal,
//! interruption and crash recovery.
//!
//! Run with: cargo test --test integration_tests

use tempfile::tempdir;

use hopcache_graph::{Distance, JobId, TrackingMethod};
use hopcache_store::{GraphStore, StoreConfig};

const JOB: JobId = JobId::new(1);
const METHOD: TrackingMethod = TrackingMethod::Accurate;
const PROCESS: &str = "crawler-1";

fn legal() -> Vec<String> {
    vec!["link".to_string(), "redirect".to_string()]
}

fn open(dir: &std::path::Path) -> GraphStore {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = StoreConfig {
        fsync: false,
        ..StoreConfig::at(dir)
    };
    GraphStore::open(config).expect("store opens")
}

fn drain(store: &GraphStore) {
    while !store.process_queue(JOB, &legal(), METHOD).unwrap() {}
}

fn hops(store: &GraphStore, nodes: &[&str]) -> Vec<Distance> {
    let nodes: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
    store.find_hop_counts(JOB, &nodes, "link")
}

/// One full "document processed" round: record the document's current link
/// set, then finish it so edges not reconfirmed are swept.
fn process_document(store: &GraphStore, source: &str, links: &[(&str, &str)]) {
    for (link_type, target) in links {
        store
            .record_reference(JOB, &legal(), source, target, link_type, METHOD, PROCESS)
            .unwrap();
    }
    store
        .finish_parents(JOB, &legal(), &[source.to_string()], METHOD)
        .unwrap();
}

#[test]
fn crawl_rescan_and_removal_lifecycle() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    // Initial crawl: root -> home; home -> {about, blog}; blog -> post.
    process_document(&store, "", &[("link", "home")]);
    process_document(&store, "home", &[("link", "about"), ("link", "blog")]);
    process_document(&store, "blog", &[("link", "post")]);
    drain(&store);

    assert_eq!(
        hops(&store, &["home", "about", "blog", "post"]),
        vec![
            Distance::Finite(1),
            Distance::Finite(2),
            Distance::Finite(2),
            Distance::Finite(3)
        ]
    );

    // Re-scan of home: the about link is gone, a news link appeared.
    process_document(&store, "home", &[("link", "news"), ("link", "blog")]);
    drain(&store);

    assert_eq!(
        hops(&store, &["about", "news", "blog", "post"]),
        vec![
            Distance::Infinite,
            Distance::Finite(2),
            Distance::Finite(2),
            Distance::Finite(3)
        ]
    );

    // blog leaves the index entirely; post becomes unreachable, and its
    // cache row must not linger.
    store
        .delete_document_identifiers(JOB, &legal(), &["blog".to_string()], METHOD)
        .unwrap();
    drain(&store);

    assert_eq!(hops(&store, &["post"]), vec![Distance::Infinite]);
    let post_rows = store
        .with_job(JOB, |graph| {
            graph
                .hops
                .iter()
                .filter(|(_, row)| row.node == "post")
                .count()
        })
        .unwrap();
    assert_eq!(post_rows, 0);
}

#[test]
fn redirect_hops_are_counted_independently() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    process_document(&store, "", &[("link", "home")]);
    process_document(&store, "home", &[("redirect", "moved")]);
    drain(&store);

    let nodes = vec!["moved".to_string()];
    assert_eq!(
        store.find_hop_counts(JOB, &nodes, "link"),
        vec![Distance::Finite(1)],
        "a redirect hop does not count as a link hop"
    );
    assert_eq!(
        store.find_hop_counts(JOB, &nodes, "redirect"),
        vec![Distance::Finite(1)]
    );
}

#[test]
fn crash_recovery_resumes_pending_work() {
    let dir = tempdir().unwrap();

    {
        let store = open(dir.path());
        process_document(&store, "", &[("link", "home")]);
        process_document(&store, "home", &[("link", "deep")]);
        // A direct root edge to deep improves it, queueing the row...
        store
            .record_reference(JOB, &legal(), "", "deep", "link", METHOD, PROCESS)
            .unwrap();
        // ...and the process dies before the queue is drained.
    }

    {
        let store = open(dir.path());
        store.restart(PROCESS).unwrap();

        // The queued work survived; draining converges as if nothing
        // happened.
        drain(&store);
        assert_eq!(hops(&store, &["deep"]), vec![Distance::Finite(1)]);

        store.checkpoint().unwrap();
    }

    // And the checkpoint alone is enough to reopen.
    {
        let store = open(dir.path());
        assert_eq!(hops(&store, &["deep"]), vec![Distance::Finite(1)]);
    }
}

#[test]
fn seeds_and_seed_finish_round_trip() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    let flags = store
        .record_seed_references(
            JOB,
            &legal(),
            &["s1".to_string(), "s2".to_string()],
            METHOD,
            PROCESS,
        )
        .unwrap();
    assert_eq!(flags.len(), 2);
    store
        .finish_seed_references(JOB, &legal(), METHOD)
        .unwrap();
    drain(&store);

    // Seed edges are typeless: distance zero for every counted type.
    assert_eq!(
        hops(&store, &["s1", "s2"]),
        vec![Distance::Finite(0), Distance::Finite(0)]
    );

    // A later seeding pass that drops s2 sweeps it.
    store
        .record_seed_references(JOB, &legal(), &["s1".to_string()], METHOD, PROCESS)
        .unwrap();
    store
        .finish_seed_references(JOB, &legal(), METHOD)
        .unwrap();
    drain(&store);

    assert_eq!(
        hops(&store, &["s1", "s2"]),
        vec![Distance::Finite(0), Distance::Infinite]
    );
}
