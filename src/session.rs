use anyhow::Result;
use log::{debug, info, trace, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};

use crate::config::EngineConfig;
use crate::debug::match_to_geojson;
use crate::matcher::{RoadMatch, RoadMatcher};
use crate::predictor::{ContinuationPredictor, VisitedHistory, continuation_candidates};
use crate::render::{EngineStatus, HudRenderer};
use crate::road::{OvertakingBan, RoadSegment, SpeedLimit};
use crate::sensor::Fix;
use crate::source::RoadSource;
use crate::smoother::TrajectorySmoother;
use crate::stabilizer::AttributeStabilizer;

/// What happened to a road query response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Matched and attributes updated
    Matched,
    /// Answered an older fix; dropped
    Stale,
    /// The query failed; previous state kept
    Unavailable,
    /// No road close enough
    NoRoad,
}

type RoadQueryResult = (u64, Result<Vec<RoadSegment>>);
type ContinuationResult = (u64, Result<Vec<RoadSegment>>);

/// Drive session context: owns every piece of per-drive state and applies
/// sensor fixes, road query completions and frame ticks to it.
///
/// Each fix starts a new generation; a road query answers the generation it
/// was issued for and is discarded if a newer fix has arrived since. At most
/// one road query is outstanding: fixes arriving meanwhile only bump the
/// generation, and a stale answer immediately triggers a query for the
/// newest fix.
pub struct DriveSession<S, R> {
    config: EngineConfig,
    source: Arc<S>,
    renderer: R,
    matcher: RoadMatcher,
    smoother: TrajectorySmoother,
    predictor: ContinuationPredictor,
    speed_limit: AttributeStabilizer<SpeedLimit>,
    overtaking: AttributeStabilizer<OvertakingBan>,
    generation: u64,
    current_fix: Option<Fix>,
    last_match: Option<RoadMatch>,
    pending_continuation: Option<RoadSegment>,
    query_in_flight: Option<u64>,
    road_queries: JoinSet<RoadQueryResult>,
    continuation_queries: JoinSet<ContinuationResult>,
}

impl<S, R> DriveSession<S, R>
where
    S: RoadSource,
    R: HudRenderer,
{
    pub fn new(config: EngineConfig, source: Arc<S>, renderer: R) -> Self {
        Self {
            matcher: RoadMatcher::new(config.matcher.clone()),
            smoother: TrajectorySmoother::new(config.smoother.clone()),
            predictor: ContinuationPredictor::new(),
            speed_limit: AttributeStabilizer::new(&config.stabilizer),
            overtaking: AttributeStabilizer::new(&config.stabilizer),
            config,
            source,
            renderer,
            generation: 0,
            current_fix: None,
            last_match: None,
            pending_continuation: None,
            query_in_flight: None,
            road_queries: JoinSet::new(),
            continuation_queries: JoinSet::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_match(&self) -> Option<&RoadMatch> {
        self.last_match.as_ref()
    }

    pub fn history(&self) -> &VisitedHistory {
        self.predictor.history()
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn committed_speed_limit(&self) -> Option<&SpeedLimit> {
        self.speed_limit.committed()
    }

    pub fn committed_overtaking_ban(&self) -> Option<&OvertakingBan> {
        self.overtaking.committed()
    }

    /// Apply a new sensor fix. Returns the generation a road query should be
    /// issued for, or `None` if the fix was rejected.
    pub fn accept_fix(&mut self, fix: Fix, now: std::time::Instant) -> Option<u64> {
        if !fix.is_valid() {
            warn!("Ignoring malformed fix {:?}", fix.point);
            return None;
        }

        self.generation += 1;
        trace!("Fix {} at {:.6},{:.6}", self.generation, fix.point.lat, fix.point.lon);
        self.smoother.push_fix(fix.clone(), now);
        self.current_fix = Some(fix);
        Some(self.generation)
    }

    /// Apply the candidates of a road query issued for `generation`
    pub fn apply_road_data(
        &mut self,
        generation: u64,
        result: Result<Vec<RoadSegment>>,
    ) -> CycleOutcome {
        if generation != self.generation {
            trace!(
                "Dropping road data for fix {} (current {})",
                generation, self.generation
            );
            return CycleOutcome::Stale;
        }

        let candidates = match result {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Road query for fix {} failed: {}", generation, e);
                self.renderer.status(EngineStatus::RoadDataUnavailable);
                return CycleOutcome::Unavailable;
            }
        };

        let Some(fix) = self.current_fix.as_ref() else {
            return CycleOutcome::Stale;
        };

        let road_match = self.matcher.match_fix(fix, &candidates);
        if self.config.debug_geojson {
            trace!(
                "Matching cycle {}: {}",
                generation,
                match_to_geojson(fix, road_match.as_ref(), &candidates)
            );
        }

        let Some(road_match) = road_match else {
            debug!("No road near fix {} ({} candidates)", generation, candidates.len());
            self.renderer.status(EngineStatus::NoRoadNearby);
            return CycleOutcome::NoRoad;
        };

        self.renderer.status(EngineStatus::Tracking);
        self.renderer.road_position(&road_match.nearest);

        let segment = &road_match.by_heading.segment;
        if let Some(update) = self.speed_limit.push(segment.speed_limit()) {
            self.renderer.speed_limit_changed(update);
        }
        if let Some(update) = self.overtaking.push(Some(segment.overtaking_ban())) {
            self.renderer.overtaking_changed(update);
        }

        if self.config.predict_continuations && self.predictor.enter(segment) {
            self.pending_continuation = Some(segment.clone());
        }

        self.last_match = Some(road_match);
        CycleOutcome::Matched
    }

    /// Segment whose continuations should be looked up next, if any
    pub fn take_continuation_request(&mut self) -> Option<RoadSegment> {
        self.pending_continuation.take()
    }

    /// Apply continuation candidates looked up for `segment_id`
    pub fn apply_continuations(&mut self, segment_id: u64, result: Result<Vec<RoadSegment>>) {
        if let Some(next) = self.predictor.resolve(segment_id, result) {
            self.renderer.continuations(&next);
        }
    }

    /// Render the pose for `now`; returns whether more frames are needed
    pub fn render_frame(&mut self, now: std::time::Instant) -> bool {
        if let Some(pose) = self.smoother.evaluate(now) {
            self.renderer.render_pose(&pose);
        }
        self.smoother.is_animating(now)
    }

    /// Query candidates around the current fix unless a query is already
    /// outstanding
    fn spawn_road_query(&mut self) {
        if let Some(pending) = self.query_in_flight {
            trace!(
                "Road query for fix {} still pending, not querying for fix {}",
                pending, self.generation
            );
            return;
        }
        let Some(center) = self.current_fix.as_ref().map(|fix| fix.point) else {
            return;
        };
        let generation = self.generation;
        self.query_in_flight = Some(generation);
        let source = Arc::clone(&self.source);
        let radius = self.config.matcher.search_radius_m;
        self.road_queries
            .spawn(async move { (generation, source.ways_around(center, radius).await) });
    }

    fn spawn_continuation_query(&mut self) {
        let Some(segment) = self.take_continuation_request() else {
            return;
        };
        let source = Arc::clone(&self.source);
        self.continuation_queries.spawn(async move {
            let result = continuation_candidates(source.as_ref(), &segment).await;
            (segment.id, result)
        });
    }

    /// Drive the session until the fix channel closes, then return the
    /// renderer
    pub async fn run(mut self, mut fixes: mpsc::Receiver<Fix>) -> R {
        info!("Drive session started");
        let mut frames = time::interval(self.smoother.frame_interval());
        frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut animating = false;

        loop {
            tokio::select! {
                maybe_fix = fixes.recv() => {
                    let Some(fix) = maybe_fix else {
                        break;
                    };
                    let now = time::Instant::now().into_std();
                    if self.accept_fix(fix, now).is_some() {
                        self.spawn_road_query();
                        animating = self.render_frame(now);
                        frames.reset();
                    }
                }
                Some(joined) = self.road_queries.join_next(), if !self.road_queries.is_empty() => {
                    self.query_in_flight = None;
                    match joined {
                        Ok((generation, result)) => {
                            if self.apply_road_data(generation, result) == CycleOutcome::Stale {
                                // Newer fixes arrived meanwhile; query for the latest one
                                self.spawn_road_query();
                            }
                            self.spawn_continuation_query();
                        }
                        Err(e) => warn!("Road query task failed: {}", e),
                    }
                }
                Some(joined) = self.continuation_queries.join_next(), if !self.continuation_queries.is_empty() => {
                    match joined {
                        Ok((segment_id, result)) => self.apply_continuations(segment_id, result),
                        Err(e) => warn!("Continuation task failed: {}", e),
                    }
                }
                _ = frames.tick(), if animating => {
                    animating = self.render_frame(time::Instant::now().into_std());
                }
            }
        }

        self.road_queries.abort_all();
        self.continuation_queries.abort_all();
        info!(
            "Drive session ended after {} fixes, {} segments visited",
            self.generation,
            self.history().len()
        );
        self.renderer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeoPoint;
    use crate::matcher::MatchResult;
    use crate::road::tests::segment;
    use crate::smoother::Pose;
    use crate::source::StaticRoadSource;
    use crate::stabilizer::AttributeUpdate;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Pose(Pose),
        RoadPosition(u64),
        Speed(AttributeUpdate<SpeedLimit>),
        Overtaking(AttributeUpdate<OvertakingBan>),
        Continuations(Vec<u64>),
        Status(EngineStatus),
    }

    #[derive(Debug, Default)]
    struct Recorder {
        events: Vec<Event>,
    }

    impl Recorder {
        fn speed_updates(&self) -> Vec<AttributeUpdate<SpeedLimit>> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Speed(u) => Some(*u),
                    _ => None,
                })
                .collect()
        }

        fn poses(&self) -> Vec<Pose> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Pose(p) => Some(*p),
                    _ => None,
                })
                .collect()
        }

        fn last_status(&self) -> Option<EngineStatus> {
            self.events.iter().rev().find_map(|e| match e {
                Event::Status(s) => Some(*s),
                _ => None,
            })
        }
    }

    impl HudRenderer for Recorder {
        fn render_pose(&mut self, pose: &Pose) {
            self.events.push(Event::Pose(*pose));
        }

        fn road_position(&mut self, nearest: &MatchResult) {
            self.events.push(Event::RoadPosition(nearest.segment.id));
        }

        fn speed_limit_changed(&mut self, update: AttributeUpdate<SpeedLimit>) {
            self.events.push(Event::Speed(update));
        }

        fn overtaking_changed(&mut self, update: AttributeUpdate<OvertakingBan>) {
            self.events.push(Event::Overtaking(update));
        }

        fn continuations(&mut self, segments: &[RoadSegment]) {
            let mut ids: Vec<u64> = segments.iter().map(|s| s.id).collect();
            ids.sort();
            self.events.push(Event::Continuations(ids));
        }

        fn status(&mut self, status: EngineStatus) {
            self.events.push(Event::Status(status));
        }
    }

    fn limited(id: u64, maxspeed: &str, coords: &[(f64, f64)]) -> RoadSegment {
        let mut seg = segment(id, Some("Main St"), coords);
        seg.tags.insert("maxspeed".into(), maxspeed.into());
        seg
    }

    fn road() -> Vec<RoadSegment> {
        let a = limited(1, "50", &[(0.0, 0.0), (0.0, 0.002)]);
        let mut b = limited(2, "70", &[(0.0, 0.002), (0.0, 0.004)]);
        b.node_ids[0] = a.node_ids[1];
        vec![a, b]
    }

    fn session() -> DriveSession<StaticRoadSource, Recorder> {
        DriveSession::new(
            EngineConfig::default(),
            Arc::new(StaticRoadSource::new(road())),
            Recorder::default(),
        )
    }

    fn fix(lon: f64) -> Fix {
        Fix::new(GeoPoint::new(0.00001, lon), Some(270.0), Some(13.9), Instant::now())
    }

    #[test]
    fn speed_limit_commits_after_three_cycles() {
        let mut s = session();
        let t0 = Instant::now();
        for i in 0..4u64 {
            let generation = s.accept_fix(fix(0.0005), t0 + Duration::from_secs(i)).unwrap();
            let outcome = s.apply_road_data(generation, Ok(road()));
            assert_eq!(outcome, CycleOutcome::Matched);
        }
        assert_eq!(
            s.renderer().speed_updates(),
            vec![AttributeUpdate::Show(SpeedLimit::Kmh(50))]
        );
        assert_eq!(s.committed_speed_limit(), Some(&SpeedLimit::Kmh(50)));
        assert_eq!(s.committed_overtaking_ban(), Some(&OvertakingBan::None));
    }

    #[test]
    fn stale_response_is_discarded() {
        let mut s = session();
        let t0 = Instant::now();
        let first = s.accept_fix(fix(0.0005), t0).unwrap();
        let second = s.accept_fix(fix(0.0006), t0 + Duration::from_secs(1)).unwrap();
        assert!(second > first);

        assert_eq!(s.apply_road_data(first, Ok(road())), CycleOutcome::Stale);
        assert!(s.last_match().is_none());
        assert!(s.renderer().events.is_empty());

        assert_eq!(s.apply_road_data(second, Ok(road())), CycleOutcome::Matched);
        assert_eq!(s.last_match().unwrap().nearest.segment.id, 1);
    }

    #[test]
    fn failed_query_keeps_previous_state() {
        let mut s = session();
        let t0 = Instant::now();
        for i in 0..3u64 {
            let generation = s.accept_fix(fix(0.0005), t0 + Duration::from_secs(i)).unwrap();
            s.apply_road_data(generation, Ok(road()));
        }
        let before = s.last_match().cloned();

        let generation = s.accept_fix(fix(0.0005), t0 + Duration::from_secs(3)).unwrap();
        let outcome = s.apply_road_data(generation, Err(anyhow!("HTTP 504")));
        assert_eq!(outcome, CycleOutcome::Unavailable);
        assert_eq!(s.last_match().cloned(), before);
        assert_eq!(s.committed_speed_limit(), Some(&SpeedLimit::Kmh(50)));
        assert_eq!(s.renderer().last_status(), Some(EngineStatus::RoadDataUnavailable));
    }

    #[test]
    fn empty_candidates_report_no_road() {
        let mut s = session();
        let generation = s.accept_fix(fix(0.0005), Instant::now()).unwrap();
        assert_eq!(s.apply_road_data(generation, Ok(vec![])), CycleOutcome::NoRoad);
        assert_eq!(s.renderer().last_status(), Some(EngineStatus::NoRoadNearby));
    }

    #[test]
    fn malformed_fix_is_skipped() {
        let mut s = session();
        let bad = Fix::new(GeoPoint::new(f64::NAN, 0.0), None, None, Instant::now());
        assert!(s.accept_fix(bad, Instant::now()).is_none());
        assert_eq!(s.generation(), 0);
    }

    #[test]
    fn continuation_requested_once_per_segment() {
        let mut s = session();
        let t0 = Instant::now();
        let generation = s.accept_fix(fix(0.0005), t0).unwrap();
        s.apply_road_data(generation, Ok(road()));
        let request = s.take_continuation_request().unwrap();
        assert_eq!(request.id, 1);
        assert!(s.history().contains(1));

        let generation = s.accept_fix(fix(0.0006), t0 + Duration::from_secs(1)).unwrap();
        s.apply_road_data(generation, Ok(road()));
        assert!(s.take_continuation_request().is_none());

        s.apply_continuations(1, Ok(road()));
        assert!(s.renderer().events.contains(&Event::Continuations(vec![2])));

        // Answer for a segment we are no longer on
        s.apply_continuations(7, Ok(road()));
        let count = s
            .renderer()
            .events
            .iter()
            .filter(|e| matches!(e, Event::Continuations(_)))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn frames_follow_the_smoother() {
        let mut s = session();
        let t0 = Instant::now();
        s.accept_fix(fix(0.0), t0);
        s.accept_fix(fix(0.001), t0 + Duration::from_millis(1000));
        assert!(s.render_frame(t0 + Duration::from_millis(1500)));
        assert!(!s.render_frame(t0 + Duration::from_millis(2000)));

        let poses = s.renderer().poses();
        assert!((poses[0].point.lon - 0.0005).abs() < 1e-12);
        assert_eq!(poses[1].point.lon, 0.001);
    }

    #[tokio::test(start_paused = true)]
    async fn run_drives_the_whole_pipeline() {
        let (tx, rx) = mpsc::channel(8);
        let session = session();

        let sensor = tokio::spawn(async move {
            for lon in [0.0004, 0.0006, 0.0008, 0.0010] {
                tx.send(fix(lon)).await.unwrap();
                time::sleep(Duration::from_secs(1)).await;
            }
            // Let the last animation finish before the sensor goes away
            time::sleep(Duration::from_secs(2)).await;
        });

        let recorder = session.run(rx).await;
        sensor.await.unwrap();

        assert_eq!(recorder.speed_updates(), vec![AttributeUpdate::Show(SpeedLimit::Kmh(50))]);
        assert!(recorder.events.contains(&Event::Continuations(vec![2])));
        assert!(recorder.events.contains(&Event::RoadPosition(1)));

        let poses = recorder.poses();
        assert!(poses.len() > 4);
        let last = poses.last().unwrap();
        assert_eq!(last.point, GeoPoint::new(0.00001, 0.0010));
        assert_eq!(last.progress, 1.0);
    }

    /// Answers radius queries after a fixed delay and counts overlap
    struct Slow {
        roads: StaticRoadSource,
        delay: Duration,
        issued: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl RoadSource for Slow {
        async fn ways_around(&self, center: GeoPoint, radius_m: f64) -> Result<Vec<RoadSegment>> {
            self.issued.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.roads.ways_around(center, radius_m).await
        }

        async fn ways_by_nodes(&self, node_ids: &[u64], name: &str) -> Result<Vec<RoadSegment>> {
            self.roads.ways_by_nodes(node_ids, name).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_keeps_one_query_outstanding() {
        let source = Arc::new(Slow {
            roads: StaticRoadSource::new(road()),
            delay: Duration::from_millis(1300),
            issued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let session = DriveSession::new(
            EngineConfig::default(),
            Arc::clone(&source),
            Recorder::default(),
        );
        let (tx, rx) = mpsc::channel(8);

        // 1 Hz fixes, slower than the source, then the vehicle stops reporting
        let sensor = tokio::spawn(async move {
            for _ in 0..6 {
                tx.send(fix(0.0005)).await.unwrap();
                time::sleep(Duration::from_secs(1)).await;
            }
            time::sleep(Duration::from_secs(4)).await;
        });

        let recorder = session.run(rx).await;
        sensor.await.unwrap();

        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
        // One query per answer: 0 -> 1.3 -> 2.6 -> 3.9 -> 5.2 -> 6.5s, the
        // last one answering the final fix
        assert_eq!(source.issued.load(Ordering::SeqCst), 5);
        assert!(recorder.events.contains(&Event::RoadPosition(1)));
        assert_eq!(recorder.last_status(), Some(EngineStatus::Tracking));
    }
}
