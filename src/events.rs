//! Structured tracking events
//!
//! The solution writer reduces a labeled graph to an ordered sequence of
//! plain event records. These are the crate's language-neutral output;
//! encoding them is owned by an external serialization layer.

use serde::Serialize;

/// Kind of a tracking event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum EventKind {
    /// A track starts at a detection with no active predecessor
    Appearance,
    /// A track ends at a detection with no active successor
    Disappearance,
    /// One object moves along an active arc
    Move,
    /// A parent splits into two daughters
    Division,
    /// A detection holds more than one object (unresolved)
    Merger,
    /// A merger was split into distinct sub-objects
    ResolvedTo,
    /// A re-derived link spanning resolved frames
    MultiFrameMove,
}

/// One tracking event.
///
/// `traxel_ids` are ids within `timestep` conventions per kind:
/// - Appearance/Disappearance: `[id]`
/// - Move: `[from_id, to_id]`
/// - Division: `[parent_id, child_id, child_id]`
/// - Merger: `[id, object_count]`
/// - ResolvedTo: `[id, new_id, new_id, ..]`
/// - MultiFrameMove: `[from_id, .., to_id]`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Kind of the event
    pub kind: EventKind,
    /// Timestep the event is anchored at (target frame for moves)
    pub timestep: u32,
    /// Involved traxel ids, layout depending on the kind
    pub traxel_ids: Vec<u32>,
    /// Energy attributed to the event's decision variables
    pub energy: f64,
}

impl Event {
    /// Create a new event
    pub fn new(kind: EventKind, timestep: u32, traxel_ids: Vec<u32>, energy: f64) -> Self {
        Self {
            kind,
            timestep,
            traxel_ids,
            energy,
        }
    }
}

/// Events of one timestep, deterministically ordered
pub type EventVector = Vec<Event>;

/// Events of a whole sequence, one vector per timestep
pub type EventVectorVector = Vec<EventVector>;

/// Sort a timestep's events into their canonical order: kind first, then
/// involved ids.
pub fn sort_events(events: &mut EventVector) {
    events.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| a.traxel_ids.cmp(&b.traxel_ids))
    });
}

/// Merge two per-timestep event streams, keeping each timestep sorted.
///
/// Used to combine the main solve's events with the merger resolver's
/// refinement events.
pub fn merge_event_vectors(
    base: &EventVectorVector,
    extra: &EventVectorVector,
) -> EventVectorVector {
    let len = base.len().max(extra.len());
    let mut merged = Vec::with_capacity(len);
    for t in 0..len {
        let mut events = EventVector::new();
        if let Some(v) = base.get(t) {
            events.extend(v.iter().cloned());
        }
        if let Some(v) = extra.get(t) {
            events.extend(v.iter().cloned());
        }
        sort_events(&mut events);
        merged.push(events);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_orders_by_kind_then_ids() {
        let mut events = vec![
            Event::new(EventKind::Move, 1, vec![2, 3], 0.0),
            Event::new(EventKind::Appearance, 1, vec![5], 0.0),
            Event::new(EventKind::Move, 1, vec![1, 2], 0.0),
        ];
        sort_events(&mut events);
        assert_eq!(events[0].kind, EventKind::Appearance);
        assert_eq!(events[1].traxel_ids, vec![1, 2]);
        assert_eq!(events[2].traxel_ids, vec![2, 3]);
    }

    #[test]
    fn test_merge_pads_shorter_stream() {
        let base = vec![
            vec![Event::new(EventKind::Appearance, 0, vec![1], 0.0)],
            vec![],
        ];
        let extra = vec![
            vec![],
            vec![],
            vec![Event::new(EventKind::MultiFrameMove, 2, vec![1, 2, 3], 0.0)],
        ];
        let merged = merge_event_vectors(&base, &extra);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].len(), 1);
        assert_eq!(merged[2].len(), 1);
    }
}
