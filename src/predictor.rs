use anyhow::Result;
use log::{debug, trace, warn};
use std::collections::HashSet;

use crate::road::RoadSegment;
use crate::source::RoadSource;

/// Segments occupied during this drive, in order of first visit.
///
/// Append-only; a new drive starts with a new history.
#[derive(Debug, Default, Clone)]
pub struct VisitedHistory {
    order: Vec<u64>,
    ids: HashSet<u64>,
}

impl VisitedHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a visit; returns false if the segment was already known
    pub fn record(&mut self, segment_id: u64) -> bool {
        if self.ids.insert(segment_id) {
            self.order.push(segment_id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, segment_id: u64) -> bool {
        self.ids.contains(&segment_id)
    }

    pub fn ids(&self) -> &[u64] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Drop candidates that were already driven
    pub fn exclude_visited(&self, candidates: Vec<RoadSegment>) -> Vec<RoadSegment> {
        candidates
            .into_iter()
            .filter(|segment| !self.contains(segment.id))
            .collect()
    }
}

/// Same-named segments sharing an endpoint node with `current`.
///
/// An unnamed segment has no continuation by name.
pub async fn continuation_candidates<S: RoadSource>(
    source: &S,
    current: &RoadSegment,
) -> Result<Vec<RoadSegment>> {
    let Some(name) = current.name.as_deref() else {
        debug!("Segment {} has no name, skipping continuation lookup", current.id);
        return Ok(Vec::new());
    };
    source
        .ways_by_nodes(&current.endpoint_node_ids(), name)
        .await
}

/// Predicts which segment follows the current one.
///
/// Owns the drive's visited history. The lookup itself is async and may
/// outlive the segment it was asked for, so entering a segment and resolving
/// its lookup are separate steps.
#[derive(Debug, Default)]
pub struct ContinuationPredictor {
    history: VisitedHistory,
    current: Option<u64>,
}

impl ContinuationPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &VisitedHistory {
        &self.history
    }

    /// Segment the vehicle was last seen on
    pub fn current(&self) -> Option<u64> {
        self.current
    }

    /// Record `segment` as occupied. Returns true when it differs from the
    /// previous one and its continuations should be looked up.
    pub fn enter(&mut self, segment: &RoadSegment) -> bool {
        if self.current == Some(segment.id) {
            return false;
        }
        self.history.record(segment.id);
        self.current = Some(segment.id);
        true
    }

    /// Unvisited continuations from a lookup made for `segment_id`.
    ///
    /// `None` if the vehicle has left that segment since, or the lookup
    /// failed.
    pub fn resolve(
        &self,
        segment_id: u64,
        result: Result<Vec<RoadSegment>>,
    ) -> Option<Vec<RoadSegment>> {
        if self.current != Some(segment_id) {
            trace!("Dropping continuations for segment {}", segment_id);
            return None;
        }

        match result {
            Ok(candidates) => {
                let next = self.history.exclude_visited(candidates);
                debug!("Segment {}: {} possible continuations", segment_id, next.len());
                Some(next)
            }
            Err(e) => {
                warn!("Continuation lookup for segment {} failed: {}", segment_id, e);
                None
            }
        }
    }

    /// Enter `current` and look up its unvisited continuations in one go.
    /// An empty result, including after a failed lookup, means no
    /// continuation is known.
    pub async fn predict<S: RoadSource>(
        &mut self,
        source: &S,
        current: &RoadSegment,
    ) -> Vec<RoadSegment> {
        self.enter(current);
        let result = continuation_candidates(source, current).await;
        self.resolve(current.id, result).unwrap_or_default()
    }
}
