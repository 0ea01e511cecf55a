use anyhow::{Result, anyhow, bail};
use log::{debug, trace};
use rstar::{AABB, RTree, RTreeObject};
use serde::Deserialize;
use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::geometry::{GeoPoint, closest_point_on_segment, haversine_distance};
use crate::road::{OverpassResponse, RoadSegment};

/// Road classes the HUD matches against
pub const DEFAULT_HIGHWAY_FILTER: &str = "motorway|trunk|primary|secondary|tertiary|unclassified|residential|motorway_link|trunk_link|primary_link|secondary_link|tertiary_link";

/// Asynchronous road-graph queries.
///
/// Both queries may fail for any reason (network, payload); callers treat a
/// failure as "no candidates this cycle".
pub trait RoadSource: Send + Sync + 'static {
    /// Segments within `radius_m` of `center`
    fn ways_around(
        &self,
        center: GeoPoint,
        radius_m: f64,
    ) -> impl Future<Output = Result<Vec<RoadSegment>>> + Send;

    /// Segments touching any of `node_ids` and named `name`
    fn ways_by_nodes(
        &self,
        node_ids: &[u64],
        name: &str,
    ) -> impl Future<Output = Result<Vec<RoadSegment>>> + Send;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverpassConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
    /// Regex on the `highway` tag
    pub highway_filter: String,
}

impl Default for OverpassConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://overpass-api.de/api/interpreter".to_string(),
            timeout_secs: 10,
            highway_filter: DEFAULT_HIGHWAY_FILTER.to_string(),
        }
    }
}

/// Road source backed by the Overpass API
pub struct OverpassClient {
    config: OverpassConfig,
    client: reqwest::Client,
}

impl OverpassClient {
    pub fn new(config: OverpassConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { config, client })
    }

    async fn run_query(&self, query: String) -> Result<Vec<RoadSegment>> {
        let started = Instant::now();
        trace!("Overpass query: {}", query);

        let response = self
            .client
            .post(&self.config.endpoint)
            .form(&[("data", query)])
            .send()
            .await
            .map_err(|e| anyhow!("Overpass request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Overpass returned {}", status);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| anyhow!("Failed to read Overpass response: {}", e))?;
        let parsed: OverpassResponse = serde_json::from_slice(&body)
            .map_err(|e| anyhow!("Malformed Overpass payload: {}", e))?;

        let segments = parsed.into_segments();
        debug!(
            "Overpass returned {} ways in {:?}",
            segments.len(),
            started.elapsed()
        );
        Ok(segments)
    }
}

impl RoadSource for OverpassClient {
    async fn ways_around(&self, center: GeoPoint, radius_m: f64) -> Result<Vec<RoadSegment>> {
        self.run_query(around_query(center, radius_m, &self.config.highway_filter))
            .await
    }

    async fn ways_by_nodes(&self, node_ids: &[u64], name: &str) -> Result<Vec<RoadSegment>> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.run_query(by_nodes_query(node_ids, name)).await
    }
}

pub fn around_query(center: GeoPoint, radius_m: f64, highway_filter: &str) -> String {
    format!(
        "[out:json];\nway(around:{},{},{})[\"highway\"~\"{}\"];\nout body geom;",
        radius_m,
        center.lat,
        center.lon,
        escape_ql(highway_filter)
    )
}

pub fn by_nodes_query(node_ids: &[u64], name: &str) -> String {
    let ids: Vec<String> = node_ids.iter().map(u64::to_string).collect();
    format!(
        "[out:json];\nnode(id:{});\nway(bn)[\"name\"=\"{}\"];\nout body geom;",
        ids.join(","),
        escape_ql(name)
    )
}

fn escape_ql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

struct IndexedSegment {
    segment: RoadSegment,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

impl IndexedSegment {
    fn new(segment: RoadSegment) -> Option<Self> {
        let bbox = segment.bounding_box()?;
        Some(Self {
            envelope: AABB::from_corners(
                [bbox.min().x, bbox.min().y],
                [bbox.max().x, bbox.max().y],
            ),
            segment,
        })
    }
}

/// In-memory road source over a fixed set of segments
pub struct StaticRoadSource {
    rtree: RTree<IndexedSegment>,
}

impl StaticRoadSource {
    pub fn new(segments: Vec<RoadSegment>) -> Self {
        let indexed: Vec<IndexedSegment> = segments.into_iter().filter_map(IndexedSegment::new).collect();
        Self {
            rtree: RTree::bulk_load(indexed),
        }
    }

    /// Load segments from a saved Overpass JSON response
    pub fn from_overpass_json(bytes: &[u8]) -> Result<Self> {
        let parsed: OverpassResponse = serde_json::from_slice(bytes)
            .map_err(|e| anyhow!("Malformed road data: {}", e))?;
        Ok(Self::new(parsed.into_segments()))
    }

    pub fn len(&self) -> usize {
        self.rtree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn around(&self, center: GeoPoint, radius_m: f64) -> Vec<RoadSegment> {
        let d_lat = radius_m / 110_540.0;
        let d_lon = radius_m / (111_320.0 * center.lat.to_radians().cos()).max(1.0);
        let query = AABB::from_corners(
            [center.lon - d_lon, center.lat - d_lat],
            [center.lon + d_lon, center.lat + d_lat],
        );

        self.rtree
            .locate_in_envelope_intersecting(&query)
            .map(|indexed| &indexed.segment)
            .filter(|segment| {
                segment.geometry.windows(2).any(|pair| {
                    let projected = closest_point_on_segment(pair[0], pair[1], center);
                    haversine_distance(center, projected) <= radius_m
                })
            })
            .cloned()
            .collect()
    }

    fn by_nodes(&self, node_ids: &[u64], name: &str) -> Vec<RoadSegment> {
        let wanted: HashSet<u64> = node_ids.iter().copied().collect();
        self.rtree
            .iter()
            .map(|indexed| &indexed.segment)
            .filter(|segment| segment.name.as_deref() == Some(name))
            .filter(|segment| segment.node_ids.iter().any(|id| wanted.contains(id)))
            .cloned()
            .collect()
    }
}

impl RoadSource for StaticRoadSource {
    async fn ways_around(&self, center: GeoPoint, radius_m: f64) -> Result<Vec<RoadSegment>> {
        Ok(self.around(center, radius_m))
    }

    async fn ways_by_nodes(&self, node_ids: &[u64], name: &str) -> Result<Vec<RoadSegment>> {
        Ok(self.by_nodes(node_ids, name))
    }
}
