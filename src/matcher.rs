use log::{debug, trace, warn};
use ordered_float::OrderedFloat;
use serde::Deserialize;

use crate::geometry::{
    GeoPoint, angle_difference, closest_point_on_segment, haversine_distance, normalize_degrees,
    planar_bearing,
};
use crate::road::RoadSegment;
use crate::sensor::Fix;

/// Offset between the `atan2(dlat, dlon)` segment bearing and the vehicle
/// heading it is compared with. Geometry and heading sources have been seen
/// to need both 90 and 0 here.
pub const SEGMENT_BEARING_OFFSET_DEG: f64 = 90.0;

/// Road matcher configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Radius of the per-fix candidate query (meters)
    pub search_radius_m: f64,
    /// Candidates at most this much farther from the fix than the nearest
    /// one compete on heading (meters)
    pub plausible_margin_m: f64,
    /// Fixes farther than this from every candidate are not matched (meters)
    pub max_match_distance_m: Option<f64>,
    /// Subtracted from the averaged segment bearing before comparing it with
    /// the fix heading (degrees)
    pub segment_bearing_offset_deg: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            search_radius_m: 50.0,
            plausible_margin_m: 15.0,
            max_match_distance_m: None,
            segment_bearing_offset_deg: SEGMENT_BEARING_OFFSET_DEG,
        }
    }
}

/// Projection of a fix onto one segment
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub segment: RoadSegment,
    pub projected_point: GeoPoint,
    pub perpendicular_distance_m: f64,
}

/// Both selections for one fix.
///
/// `nearest` is what the marker snaps to; `by_heading` is the carriageway
/// whose attributes are shown.
#[derive(Debug, Clone, PartialEq)]
pub struct RoadMatch {
    pub nearest: MatchResult,
    pub by_heading: MatchResult,
}

pub struct RoadMatcher {
    config: MatcherConfig,
}

impl RoadMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Run both selections for a fix. `None` if there is nothing to match
    /// against or the nearest road is beyond the configured cut-off.
    pub fn match_fix(&self, fix: &Fix, candidates: &[RoadSegment]) -> Option<RoadMatch> {
        let projections = project_all(fix.point, candidates);
        let nearest = closest(&projections)?.clone();

        if let Some(max) = self.config.max_match_distance_m {
            if nearest.perpendicular_distance_m > max {
                debug!(
                    "Nearest road {} is {:.1}m away (limit {:.1}m)",
                    nearest.segment.id, nearest.perpendicular_distance_m, max
                );
                return None;
            }
        }

        let by_heading = match fix.heading {
            Some(heading) => {
                let plausible = self.plausible_candidates(&nearest, projections);
                trace!("{} candidates compete on heading", plausible.len());
                self.by_heading(fix.point, heading, plausible)
                    .unwrap_or_else(|| nearest.clone())
            }
            None => nearest.clone(),
        };

        debug!(
            "Matched fix to segment {} ({:.1}m), heading-consistent segment {}",
            nearest.segment.id, nearest.perpendicular_distance_m, by_heading.segment.id
        );

        Some(RoadMatch {
            nearest,
            by_heading,
        })
    }

    /// Globally nearest projection across every sub-segment of every candidate
    pub fn nearest(&self, point: GeoPoint, candidates: &[RoadSegment]) -> Option<MatchResult> {
        closest(&project_all(point, candidates)).cloned()
    }

    /// Projection whose segment's travel heading best agrees with `heading`.
    /// Headings are compared on the circle, so 359 and 1 are 2 degrees apart.
    pub fn by_heading(
        &self,
        point: GeoPoint,
        heading: f64,
        candidates: Vec<MatchResult>,
    ) -> Option<MatchResult> {
        candidates
            .into_iter()
            .map(|projection| {
                let candidate_heading = self.travel_heading(point, &projection.segment);
                let diff = angle_difference(candidate_heading, heading);
                trace!(
                    "Segment {} heading {:.1} vs fix {:.1} (diff {:.1})",
                    projection.segment.id, candidate_heading, heading, diff
                );
                (projection, diff)
            })
            .min_by_key(|(_, diff)| OrderedFloat(*diff))
            .map(|(projection, _)| projection)
    }

    /// Travel heading of a segment as seen from `point`, in the vehicle's
    /// heading convention
    pub fn travel_heading(&self, point: GeoPoint, segment: &RoadSegment) -> f64 {
        let bearing = directional_heading(point, segment);
        normalize_degrees(bearing - self.config.segment_bearing_offset_deg)
    }

    fn plausible_candidates(
        &self,
        nearest: &MatchResult,
        projections: Vec<MatchResult>,
    ) -> Vec<MatchResult> {
        let limit = nearest.perpendicular_distance_m + self.config.plausible_margin_m;
        projections
            .into_iter()
            .filter(|m| m.perpendicular_distance_m <= limit)
            .collect()
    }
}

fn project_all(point: GeoPoint, candidates: &[RoadSegment]) -> Vec<MatchResult> {
    candidates
        .iter()
        .filter_map(|segment| project_onto(point, segment))
        .collect()
}

fn closest(projections: &[MatchResult]) -> Option<&MatchResult> {
    projections
        .iter()
        .min_by_key(|m| OrderedFloat(m.perpendicular_distance_m))
}

/// Nearest projection of `point` onto one segment
fn project_onto(point: GeoPoint, segment: &RoadSegment) -> Option<MatchResult> {
    segment
        .geometry
        .windows(2)
        .map(|pair| {
            let projected = closest_point_on_segment(pair[0], pair[1], point);
            (projected, haversine_distance(point, projected))
        })
        .filter(|(_, distance)| distance.is_finite())
        .min_by_key(|(_, distance)| OrderedFloat(*distance))
        .map(|(projected_point, perpendicular_distance_m)| MatchResult {
            segment: segment.clone(),
            projected_point,
            perpendicular_distance_m,
        })
}

/// Whether the segment is travelled against its geometry order, judged by
/// which endpoint lies closer to `point`
pub fn is_reversed(point: GeoPoint, segment: &RoadSegment) -> bool {
    match (segment.first_point(), segment.last_point()) {
        (Some(first), Some(last)) => {
            haversine_distance(point, last) < haversine_distance(point, first)
        }
        _ => false,
    }
}

/// Mean `atan2(dlat, dlon)` bearing of the segment's sub-segments in
/// traversal order, degrees in `[0, 360)`, 0 = east.
///
/// Segments too short to have a direction yield 0.
pub fn directional_heading(point: GeoPoint, segment: &RoadSegment) -> f64 {
    if segment.geometry.len() < 2 {
        warn!(
            "Segment {} has {} points, using heading 0",
            segment.id,
            segment.geometry.len()
        );
        return 0.0;
    }

    let reversed = is_reversed(point, segment);
    let bearings: Vec<f64> = segment
        .geometry
        .windows(2)
        .map(|pair| {
            if reversed {
                planar_bearing(pair[1], pair[0])
            } else {
                planar_bearing(pair[0], pair[1])
            }
        })
        .collect();

    bearings.iter().sum::<f64>() / bearings.len() as f64
}
