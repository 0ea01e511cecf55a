use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use std::path::Path;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::geometry::{GeoPoint, normalize_degrees};

/// Shown when no sensor data is available: the middle of Germany
pub const FALLBACK_POINT: GeoPoint = GeoPoint::new(51.1657, 10.4515);

/// One timestamped sensor reading
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub point: GeoPoint,
    /// Compass heading in degrees, `[0, 360)`
    pub heading: Option<f64>,
    /// Ground speed in m/s
    pub speed: Option<f64>,
    pub timestamp: Instant,
}

impl Fix {
    pub fn new(point: GeoPoint, heading: Option<f64>, speed: Option<f64>, timestamp: Instant) -> Self {
        Self {
            point,
            heading: heading.filter(|h| h.is_finite()).map(normalize_degrees),
            speed,
            timestamp,
        }
    }

    /// Whether the fix can be fed to the engine at all
    pub fn is_valid(&self) -> bool {
        self.point.is_valid() && self.speed.is_none_or(|s| s.is_finite() && s >= 0.0)
    }

    pub fn speed_kmh(&self) -> Option<f64> {
        self.speed.map(|s| s * 3.6)
    }
}

/// Best-effort position when permission is denied or no sensor exists
pub fn fallback_fix() -> Fix {
    Fix::new(FALLBACK_POINT, None, None, Instant::now())
}

/// Recorded fix in a JSON trace file
#[derive(Debug, Clone, Deserialize)]
pub struct TraceFix {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    pub time: DateTime<Utc>,
}

pub async fn load_trace(path: impl AsRef<Path>) -> Result<Vec<TraceFix>> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .await
        .map_err(|e| anyhow!("Failed to open trace {}: {}", path.display(), e))?;

    let mut contents = vec![];
    file.read_to_end(&mut contents).await?;

    let trace: Vec<TraceFix> = serde_json::from_slice(&contents)
        .map_err(|e| anyhow!("Invalid trace {}: {}", path.display(), e))?;
    info!("Loaded {} recorded fixes from {}", trace.len(), path.display());
    Ok(trace)
}

/// Push recorded fixes into the fix channel, keeping their recorded spacing.
///
/// Returns the number of fixes delivered; stops early when the receiver is
/// gone.
pub async fn replay_trace(trace: Vec<TraceFix>, fixes: mpsc::Sender<Fix>) -> usize {
    let mut previous: Option<DateTime<Utc>> = None;
    let mut delivered = 0;

    for entry in trace {
        if let Some(prev) = previous {
            match (entry.time - prev).to_std() {
                Ok(gap) => tokio::time::sleep(gap).await,
                Err(_) => warn!("Trace goes back in time at {}, not waiting", entry.time),
            }
        }
        previous = Some(entry.time);

        let fix = Fix::new(
            GeoPoint::new(entry.lat, entry.lon),
            entry.heading,
            entry.speed,
            Instant::now(),
        );
        if fixes.send(fix).await.is_err() {
            debug!("Fix receiver closed, stopping replay");
            break;
        }
        delivered += 1;
    }

    delivered
}
