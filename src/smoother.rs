use log::trace;
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::geometry::GeoPoint;
use crate::sensor::Fix;

/// Shape of the interpolation between two fixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ease {
    /// `t`
    #[default]
    Linear,
    /// `t * (2 - t)`, decelerating into the new fix
    EaseOut,
}

impl Ease {
    pub fn apply(self, t: f64) -> f64 {
        match self {
            Ease::Linear => t,
            Ease::EaseOut => t * (2.0 - t),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    pub ease: Ease,
    /// Number of recent inter-fix intervals averaged into the animation duration
    pub duration_window: usize,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    /// Duration used until a second fix has arrived
    pub initial_duration_ms: f64,
    /// Frame scheduler period while an animation is running
    pub frame_interval_ms: u64,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            ease: Ease::Linear,
            duration_window: 5,
            min_duration_ms: 300.0,
            max_duration_ms: 5000.0,
            initial_duration_ms: 1000.0,
            frame_interval_ms: 16,
        }
    }
}

/// Interpolated pose handed to the renderer once per frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub point: GeoPoint,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    /// Eased progress from the previous fix to the current one, `[0, 1]`
    pub progress: f64,
}

/// Turns irregular fixes into a continuous, frame-rate independent pose.
///
/// Fixes are applied with [`push_fix`](Self::push_fix); frames call
/// [`evaluate`](Self::evaluate), which never mutates state.
#[derive(Debug, Clone)]
pub struct TrajectorySmoother {
    config: SmootherConfig,
    last_fix: Option<Fix>,
    current_fix: Option<Fix>,
    last_arrival: Option<Instant>,
    segment_start_time: Option<Instant>,
    segment_duration_ms: f64,
    duration_samples: VecDeque<f64>,
}

impl TrajectorySmoother {
    pub fn new(config: SmootherConfig) -> Self {
        let segment_duration_ms = config
            .initial_duration_ms
            .clamp(config.min_duration_ms, config.max_duration_ms);
        Self {
            duration_samples: VecDeque::with_capacity(config.duration_window.max(1)),
            config,
            last_fix: None,
            current_fix: None,
            last_arrival: None,
            segment_start_time: None,
            segment_duration_ms,
        }
    }

    pub fn segment_duration_ms(&self) -> f64 {
        self.segment_duration_ms
    }

    pub fn segment_start_time(&self) -> Option<Instant> {
        self.segment_start_time
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.config.frame_interval_ms.max(1))
    }

    /// Start a new animation segment towards `fix`, which arrived at `now`
    pub fn push_fix(&mut self, fix: Fix, now: Instant) {
        match self.current_fix.take() {
            Some(previous) => self.last_fix = Some(previous),
            // Nothing to animate from yet: start and end at the first fix
            None => self.last_fix = Some(fix.clone()),
        }
        self.current_fix = Some(fix);

        if let Some(arrival) = self.last_arrival {
            let interval_ms = now.saturating_duration_since(arrival).as_secs_f64() * 1000.0;
            self.record_interval(interval_ms);
        }
        self.last_arrival = Some(now);
        self.segment_start_time = Some(now);
    }

    /// Add an inter-fix interval to the moving average
    pub fn record_interval(&mut self, interval_ms: f64) {
        if self.duration_samples.len() >= self.config.duration_window.max(1) {
            self.duration_samples.pop_front();
        }
        self.duration_samples.push_back(interval_ms);

        let mean = self.duration_samples.iter().sum::<f64>() / self.duration_samples.len() as f64;
        self.segment_duration_ms = mean.clamp(self.config.min_duration_ms, self.config.max_duration_ms);
        trace!(
            "Inter-fix interval {:.0}ms, animation duration {:.0}ms",
            interval_ms, self.segment_duration_ms
        );
    }

    fn progress(&self, now: Instant) -> Option<f64> {
        let start = self.segment_start_time?;
        let elapsed_ms = now.saturating_duration_since(start).as_secs_f64() * 1000.0;
        Some((elapsed_ms / self.segment_duration_ms).clamp(0.0, 1.0))
    }

    /// Pose at `now`; `None` before the first fix
    pub fn evaluate(&self, now: Instant) -> Option<Pose> {
        let current = self.current_fix.as_ref()?;
        let last = self.last_fix.as_ref().unwrap_or(current);
        let t = self.progress(now)?;

        let point = if t >= 1.0 {
            current.point
        } else {
            let eased = self.config.ease.apply(t);
            GeoPoint {
                lat: last.point.lat + (current.point.lat - last.point.lat) * eased,
                lon: last.point.lon + (current.point.lon - last.point.lon) * eased,
            }
        };

        Some(Pose {
            point,
            heading: current.heading,
            speed: current.speed,
            progress: self.config.ease.apply(t),
        })
    }

    /// Whether frames still need to be rendered at `now`
    pub fn is_animating(&self, now: Instant) -> bool {
        self.progress(now).is_some_and(|t| t < 1.0)
    }
}
