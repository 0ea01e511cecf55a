use log::{debug, info, trace, warn};

use crate::matcher::MatchResult;
use crate::road::{OvertakingBan, RoadSegment, SpeedLimit};
use crate::smoother::Pose;
use crate::stabilizer::AttributeUpdate;

/// Soft, non-blocking engine status for the HUD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Matching normally
    Tracking,
    /// The last road query failed; previous road state is kept
    RoadDataUnavailable,
    /// Road data arrived but no road is close enough
    NoRoadNearby,
}

/// Receives everything the HUD displays
pub trait HudRenderer: Send {
    /// Once per frame while the marker moves
    fn render_pose(&mut self, pose: &Pose);

    /// Nearest point on the road network for the latest fix
    fn road_position(&mut self, _nearest: &MatchResult) {}

    fn speed_limit_changed(&mut self, update: AttributeUpdate<SpeedLimit>);

    fn overtaking_changed(&mut self, update: AttributeUpdate<OvertakingBan>);

    /// Advisory: segments the vehicle may continue onto
    fn continuations(&mut self, _segments: &[RoadSegment]) {}

    fn status(&mut self, status: EngineStatus);
}

/// Distance beyond which the road point is worth showing next to the fix
const OFF_ROAD_MARKER_M: f64 = 10.0;

/// Renderer that writes the HUD state to the log
#[derive(Debug, Default)]
pub struct LogRenderer {
    last_status: Option<EngineStatus>,
}

impl HudRenderer for LogRenderer {
    fn render_pose(&mut self, pose: &Pose) {
        let speed = pose
            .speed
            .map(|s| format!("{:.0} km/h", s * 3.6))
            .unwrap_or_else(|| "-".to_string());
        let heading = pose
            .heading
            .map(|h| format!("{:.0}°", h))
            .unwrap_or_else(|| "-".to_string());
        trace!(
            "Pose {:.6},{:.6} heading {} speed {} ({:.0}%)",
            pose.point.lat,
            pose.point.lon,
            heading,
            speed,
            pose.progress * 100.0
        );
    }

    fn road_position(&mut self, nearest: &MatchResult) {
        if nearest.perpendicular_distance_m > OFF_ROAD_MARKER_M {
            debug!(
                "Fix is {:.0}m off way {}, road point {:.6},{:.6}",
                nearest.perpendicular_distance_m,
                nearest.segment.id,
                nearest.projected_point.lat,
                nearest.projected_point.lon
            );
        }
    }

    fn speed_limit_changed(&mut self, update: AttributeUpdate<SpeedLimit>) {
        match update {
            AttributeUpdate::Show(limit) => info!(
                "Speed limit: {} (sign {})",
                limit,
                limit.sign_code().unwrap_or_else(|| "-".to_string())
            ),
            AttributeUpdate::Clear => info!("Speed limit: unknown"),
        }
    }

    fn overtaking_changed(&mut self, update: AttributeUpdate<OvertakingBan>) {
        match update {
            AttributeUpdate::Show(OvertakingBan::None) | AttributeUpdate::Clear => {
                info!("No overtaking ban")
            }
            AttributeUpdate::Show(ban) => info!(
                "Overtaking ban: {:?} (sign {})",
                ban,
                ban.sign_code().unwrap_or("-")
            ),
        }
    }

    fn continuations(&mut self, segments: &[RoadSegment]) {
        let ids: Vec<u64> = segments.iter().map(|s| s.id).collect();
        debug!("Possible next ways: {:?}", ids);
    }

    fn status(&mut self, status: EngineStatus) {
        if self.last_status == Some(status) {
            return;
        }
        self.last_status = Some(status);
        match status {
            EngineStatus::Tracking => info!("Tracking road"),
            EngineStatus::RoadDataUnavailable => warn!("Road data unavailable, keeping last state"),
            EngineStatus::NoRoadNearby => warn!("Too far away from any road"),
        }
    }
}
