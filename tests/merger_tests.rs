//! Merger resolution through the full pipeline
//!
//! Two objects merge into one blob for a frame and separate again; the
//! resolver must split the blob into two sub-objects with distinct
//! re-derived links.

use constrack::mergers::resolver::TimestepIdCoordinateMap;
use constrack::{
    ConsTracking, DetectionPrior, EventKind, SolverType, TrackingOptions, Traxel, TraxelKey,
    TraxelStore,
};
use nalgebra::DVector;
use rand::SeedableRng;

fn merger_store() -> TraxelStore {
    let mut store = TraxelStore::new();
    let mut add = |id: u32, t: u32, x: f64, y: f64, det: Vec<f64>| {
        store.add(
            Traxel::new(id, t)
                .with_feature("com", vec![x, y])
                .with_feature("detProb", det)
                .with_feature("divProb", vec![0.01]),
        );
    };
    let single = vec![0.05, 0.9, 0.05];
    let double = vec![0.05, 0.15, 0.8];
    add(1, 0, 0.0, 0.0, single.clone());
    add(2, 0, 0.0, 4.0, single.clone());
    add(3, 1, 1.0, 2.0, double); // the merged blob
    add(4, 2, 2.0, 0.0, single.clone());
    add(5, 2, 2.0, 4.0, single);
    store
}

fn blob_coordinates() -> TimestepIdCoordinateMap {
    let mut coordinates = TimestepIdCoordinateMap::new();
    let mut samples = Vec::new();
    for i in 0..5 {
        samples.push(DVector::from_vec(vec![1.0 + 0.05 * i as f64, 0.5]));
        samples.push(DVector::from_vec(vec![1.0 + 0.05 * i as f64, 3.5]));
    }
    coordinates.insert(TraxelKey::new(1, 3), samples);
    coordinates
}

fn merger_options() -> TrackingOptions {
    TrackingOptions {
        max_number_objects: 2,
        with_divisions: true,
        detection_prior: DetectionPrior::Classifier,
        appearance_cost: 50.0,
        disappearance_cost: 50.0,
        with_merger_resolution: true,
        solver: SolverType::Exact,
        ..Default::default()
    }
}

#[test]
fn test_merger_detected_and_resolved() {
    let mut store = merger_store();
    let coordinates = blob_coordinates();
    let mut tracker = ConsTracking::new(merger_options()).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(17);

    let output = tracker
        .track_with_coordinates(&mut store, Some(&coordinates), &mut rng)
        .unwrap();

    // the main solve flags the blob as a two-object merger
    let all: Vec<_> = output.events.iter().flatten().collect();
    assert!(all
        .iter()
        .any(|e| e.kind == EventKind::Merger && e.traxel_ids == vec![3, 2]));

    // resolution produced exactly two sub-objects
    assert_eq!(output.resolved.len(), 1);
    assert!(output.unresolved.is_empty());
    let resolved = &output.resolved[0];
    assert_eq!(resolved.original, TraxelKey::new(1, 3));
    assert_eq!(resolved.new_ids.len(), 2);

    let resolved_to = all
        .iter()
        .find(|e| e.kind == EventKind::ResolvedTo)
        .expect("ResolvedTo event present");
    assert_eq!(resolved_to.traxel_ids[0], 3);
    assert_eq!(resolved_to.traxel_ids.len(), 3);

    // two in-links and two out-links, re-derived across the blob frame
    let multi_frame_moves: Vec<_> = all
        .iter()
        .filter(|e| e.kind == EventKind::MultiFrameMove)
        .collect();
    assert_eq!(multi_frame_moves.len(), 4);

    // the sub-objects link to distinct successors at t=2
    let graph = tracker.hypotheses_graph().unwrap();
    let subs: Vec<_> = graph
        .nodes_at(1)
        .filter(|n| resolved.new_ids.contains(&graph.first_traxel(*n).id))
        .collect();
    assert_eq!(subs.len(), 2);
    let successors: Vec<_> = subs
        .iter()
        .flat_map(|&s| graph.out_arcs(s).map(|a| graph.first_traxel(graph.target(a)).id))
        .collect();
    assert_eq!(successors.len(), 2);
    assert_ne!(successors[0], successors[1]);

    // new sub-object traxels were minted into the store
    for id in &resolved.new_ids {
        assert!(store.get(TraxelKey::new(1, *id)).is_some());
    }
}

#[test]
fn test_degenerate_blob_stays_unresolved() {
    let mut store = merger_store();
    // all coordinate samples collapse onto one point
    let mut coordinates = TimestepIdCoordinateMap::new();
    coordinates.insert(
        TraxelKey::new(1, 3),
        vec![DVector::from_vec(vec![1.0, 2.0]); 8],
    );

    let mut tracker = ConsTracking::new(merger_options()).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(17);
    let output = tracker
        .track_with_coordinates(&mut store, Some(&coordinates), &mut rng)
        .unwrap();

    assert!(output.resolved.is_empty());
    assert_eq!(output.unresolved.len(), 1);
    let (key, error) = &output.unresolved[0];
    assert_eq!(*key, TraxelKey::new(1, 3));
    assert!(!error.is_fatal());

    // the merger event is still reported, never silently dropped
    let all: Vec<_> = output.events.iter().flatten().collect();
    assert!(all
        .iter()
        .any(|e| e.kind == EventKind::Merger && e.traxel_ids == vec![3, 2]));
}

#[test]
fn test_without_coordinates_merger_stays_an_event() {
    let mut store = merger_store();
    let mut tracker = ConsTracking::new(merger_options()).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(17);
    let output = tracker.track(&mut store, &mut rng).unwrap();

    assert!(output.resolved.is_empty());
    let all: Vec<_> = output.events.iter().flatten().collect();
    assert!(all.iter().any(|e| e.kind == EventKind::Merger));
    assert!(!all.iter().any(|e| e.kind == EventKind::ResolvedTo));
}
