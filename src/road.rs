use anyhow::{Result, bail};
use geo::{BoundingRect, LineString, Rect};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::geometry::GeoPoint;

/// One named stretch of road as delivered by the road-data collaborator.
///
/// The geometry direction says nothing about the direction of travel.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoadSegment {
    pub id: u64,
    pub geometry: Vec<GeoPoint>,
    pub name: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub node_ids: Vec<u64>,
}

impl RoadSegment {
    /// Validating constructor.
    ///
    /// Rejects geometry with fewer than two points and node lists that do not
    /// line up with the geometry.
    pub fn new(
        id: u64,
        geometry: Vec<GeoPoint>,
        node_ids: Vec<u64>,
        tags: BTreeMap<String, String>,
    ) -> Result<Self> {
        if geometry.len() < 2 {
            bail!("Segment {} has {} geometry points", id, geometry.len());
        }
        if node_ids.len() != geometry.len() {
            bail!(
                "Segment {} has {} node ids for {} geometry points",
                id,
                node_ids.len(),
                geometry.len()
            );
        }
        if let Some(bad) = geometry.iter().find(|p| !p.is_valid()) {
            bail!("Segment {} has invalid coordinate {:?}", id, bad);
        }

        let name = tags.get("name").cloned();
        Ok(Self {
            id,
            geometry,
            name,
            tags,
            node_ids,
        })
    }

    pub fn first_point(&self) -> Option<GeoPoint> {
        self.geometry.first().copied()
    }

    pub fn last_point(&self) -> Option<GeoPoint> {
        self.geometry.last().copied()
    }

    /// Node ids at both ends of the way
    pub fn endpoint_node_ids(&self) -> Vec<u64> {
        match (self.node_ids.first(), self.node_ids.last()) {
            (Some(&first), Some(&last)) if first != last => vec![first, last],
            (Some(&first), _) => vec![first],
            _ => Vec::new(),
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn bounding_box(&self) -> Option<Rect<f64>> {
        let line: LineString<f64> = self.geometry.iter().map(|p| geo::Coord::from(*p)).collect();
        line.bounding_rect()
    }

    /// Speed limit reading for this segment, `None` when unknown
    pub fn speed_limit(&self) -> Option<SpeedLimit> {
        self.tag("maxspeed").and_then(SpeedLimit::parse)
    }

    /// Overtaking restriction reading for this segment
    pub fn overtaking_ban(&self) -> OvertakingBan {
        if self.tag("overtaking") == Some("no") {
            OvertakingBan::All
        } else if self.tag("overtaking:hgv") == Some("no") {
            OvertakingBan::HeavyGoodsVehicles
        } else {
            OvertakingBan::None
        }
    }
}

/// Posted speed limit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SpeedLimit {
    Kmh(u16),
    Mph(u16),
    /// Explicitly no limit (`maxspeed=none`)
    Unrestricted,
}

impl SpeedLimit {
    /// Parse an OSM `maxspeed` value. Values that are not a number (zone
    /// codes, `signals`, `walk`) are unknown.
    pub fn parse(raw: &str) -> Option<Self> {
        // Conditional or lane-separated values: the first one applies
        let value = raw.split(';').next()?.trim();

        if value == "none" {
            return Some(SpeedLimit::Unrestricted);
        }
        if let Some(mph) = value.strip_suffix("mph") {
            return mph.trim().parse().ok().map(SpeedLimit::Mph);
        }
        let kmh = value.strip_suffix("km/h").unwrap_or(value).trim();
        kmh.parse().ok().map(SpeedLimit::Kmh)
    }

    /// StVO sign code for the HUD, when a matching sign exists
    pub fn sign_code(&self) -> Option<String> {
        match self {
            SpeedLimit::Kmh(v) if *v == 5 || (*v > 0 && v % 10 == 0) => Some(format!("274-{}", v)),
            SpeedLimit::Unrestricted => Some("282".to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for SpeedLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeedLimit::Kmh(v) => write!(f, "{} km/h", v),
            SpeedLimit::Mph(v) => write!(f, "{} mph", v),
            SpeedLimit::Unrestricted => write!(f, "none"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum OvertakingBan {
    None,
    All,
    HeavyGoodsVehicles,
}

impl OvertakingBan {
    pub fn sign_code(&self) -> Option<&'static str> {
        match self {
            OvertakingBan::None => None,
            OvertakingBan::All => Some("276"),
            OvertakingBan::HeavyGoodsVehicles => Some("277"),
        }
    }
}

/// Raw Overpass `out body geom` response
#[derive(Debug, Deserialize)]
pub struct OverpassResponse {
    #[serde(default)]
    pub elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
pub struct OverpassElement {
    #[serde(rename = "type")]
    pub element_type: String,
    pub id: u64,
    #[serde(default)]
    pub nodes: Vec<u64>,
    #[serde(default)]
    pub geometry: Vec<Option<GeoPoint>>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl OverpassResponse {
    /// Convert way elements into segments, skipping ones that break the
    /// segment invariants.
    pub fn into_segments(self) -> Vec<RoadSegment> {
        self.elements
            .into_iter()
            .filter(|e| e.element_type == "way")
            .filter_map(|e| {
                let id = e.id;
                // Overpass emits null for nodes outside the query bbox
                let geometry: Option<Vec<GeoPoint>> = e.geometry.into_iter().collect();
                let Some(geometry) = geometry else {
                    warn!("Skipping way {}: incomplete geometry", id);
                    return None;
                };
                match RoadSegment::new(id, geometry, e.nodes, e.tags) {
                    Ok(segment) => Some(segment),
                    Err(err) => {
                        warn!("Skipping way {}: {}", id, err);
                        None
                    }
                }
            })
            .collect()
    }
}
