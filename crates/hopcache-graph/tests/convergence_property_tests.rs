//! Convergence of the incremental engine against a reference shortest-path
//! computation.
//!
//! Random acyclic graphs (edges only ever point from a lower-numbered node
//! to a higher-numbered one, so the documented cycle approximation cannot
//! come into play) are fed through the engine in crawl order: a document's
//! outgoing references are recorded only after every edge into it has been.
//! After draining the queue, every cached distance must equal the true
//! minimum hop count from the root, and must still do so after a random set
//! of documents is deleted and the queue drained again.

use proptest::prelude::*;

use hopcache_graph::{BatchLimits, CancelToken, Distance, JobGraph, JobOps, TrackingMethod};

const LINK_TYPE: &str = "link";

/// An edge: `None` as source means the root.
type Edge = (Option<usize>, usize);

fn node_name(i: usize) -> String {
    format!("n{i}")
}

/// Minimum hop count from the root, by repeated relaxation.  `None` means
/// unreachable.
fn reference_distances(node_count: usize, edges: &[Edge]) -> Vec<Option<u32>> {
    let mut dist: Vec<Option<u32>> = vec![None; node_count];
    loop {
        let mut changed = false;
        for &(source, target) in edges {
            let base = match source {
                None => Some(0),
                Some(s) => dist[s],
            };
            let Some(base) = base else { continue };
            let candidate = base + 1;
            if dist[target].map_or(true, |d| candidate < d) {
                dist[target] = Some(candidate);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    dist
}

fn legal() -> Vec<String> {
    vec![LINK_TYPE.to_string()]
}

fn drain(graph: &mut JobGraph, legal: &[String]) {
    let cancel = CancelToken::new();
    loop {
        let mut ops = JobOps::new(
            graph,
            legal,
            TrackingMethod::Accurate,
            BatchLimits::default(),
            &cancel,
        );
        if ops.process_queue().unwrap() {
            break;
        }
    }
}

/// Record edges grouped by source, sources in discovery order: the root
/// first, then nodes in index order (every edge into node `i` comes from the
/// root or a lower index, so `i`'s own references are recorded only after
/// `i` itself could have been discovered).
fn feed_graph(graph: &mut JobGraph, legal: &[String], node_count: usize, edges: &[Edge]) {
    let cancel = CancelToken::new();
    let mut record = |source: Option<usize>| {
        let targets: Vec<String> = edges
            .iter()
            .filter(|(s, _)| *s == source)
            .map(|(_, t)| node_name(*t))
            .collect();
        if targets.is_empty() {
            return;
        }
        let source_name = source.map(node_name).unwrap_or_default();
        let mut ops = JobOps::new(
            graph,
            legal,
            TrackingMethod::Accurate,
            BatchLimits::default(),
            &cancel,
        );
        ops.record_references(&source_name, &targets, LINK_TYPE, "proc-1")
            .unwrap();
    };

    record(None);
    for source in 0..node_count {
        record(Some(source));
    }
}

fn engine_distances(graph: &JobGraph, node_count: usize) -> Vec<Option<u32>> {
    let nodes: Vec<String> = (0..node_count).map(node_name).collect();
    graph
        .hops
        .distances(&nodes, LINK_TYPE, &BatchLimits::default())
        .into_iter()
        .map(Distance::finite)
        .collect()
}

fn graph_strategy() -> impl Strategy<Value = (usize, Vec<Edge>, Vec<usize>)> {
    (2usize..10).prop_flat_map(|node_count| {
        let raw_edges =
            prop::collection::vec((0..node_count, 0..node_count), 0..=3 * node_count);
        let roots = prop::collection::vec(0..node_count, 0..=4);
        let deletions = prop::collection::vec(0..node_count, 0..=3);
        (Just(node_count), raw_edges, roots, deletions).prop_map(
            |(node_count, raw_edges, roots, deletions)| {
                let mut edges: Vec<Edge> = Vec::new();
                for root_target in roots {
                    edges.push((None, root_target));
                }
                for (a, b) in raw_edges {
                    // Orient every edge low-to-high to keep the graph acyclic.
                    if a != b {
                        edges.push((Some(a.min(b)), a.max(b)));
                    }
                }
                (node_count, edges, deletions)
            },
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn drained_cache_matches_reference_distances(
        (node_count, edges, deletions) in graph_strategy()
    ) {
        let legal = legal();
        let mut graph = JobGraph::default();

        feed_graph(&mut graph, &legal, node_count, &edges);
        drain(&mut graph, &legal);

        let expected = reference_distances(node_count, &edges);
        prop_assert_eq!(&engine_distances(&graph, node_count), &expected);

        // Delete some documents: their outgoing edges disappear and every
        // distance that relied on one must be re-derived or dropped.
        let doomed: Vec<String> = {
            let mut d: Vec<usize> = deletions;
            d.sort_unstable();
            d.dedup();
            d.into_iter().map(node_name).collect()
        };
        if !doomed.is_empty() {
            let cancel = CancelToken::new();
            let mut ops = JobOps::new(
                &mut graph,
                &legal,
                TrackingMethod::Accurate,
                BatchLimits::default(),
                &cancel,
            );
            ops.delete_document_identifiers(&doomed).unwrap();
            drain(&mut graph, &legal);

            let remaining: Vec<Edge> = edges
                .iter()
                .copied()
                .filter(|(source, _)| {
                    source.map_or(true, |s| !doomed.contains(&node_name(s)))
                })
                .collect();
            let expected = reference_distances(node_count, &remaining);
            prop_assert_eq!(&engine_distances(&graph, node_count), &expected);
        }
    }

    #[test]
    fn recording_more_edges_never_worsens_a_distance(
        (node_count, edges, _) in graph_strategy()
    ) {
        let legal = legal();
        let mut graph = JobGraph::default();

        // Feed and drain in stages, watching every intermediate state.
        let mut previous = vec![None; node_count];
        let stage = edges.len().max(1).div_ceil(3);
        for part in edges.chunks(stage) {
            feed_graph(&mut graph, &legal, node_count, part);
            drain(&mut graph, &legal);
            let current = engine_distances(&graph, node_count);
            for (now, before) in current.iter().zip(&previous) {
                if let (Some(now), Some(before)) = (now, before) {
                    prop_assert!(now <= before, "a distance increased as edges were added");
                }
            }
            previous = current;
        }
    }
}
