use serde_json::{Value, json};

use crate::matcher::RoadMatch;
use crate::road::RoadSegment;
use crate::sensor::Fix;

/// GeoJSON FeatureCollection of one matching cycle: the candidates, the fix
/// and both projections
pub fn match_to_geojson(
    fix: &Fix,
    road_match: Option<&RoadMatch>,
    candidates: &[RoadSegment],
) -> Value {
    let mut features = Vec::new();

    for segment in candidates {
        let coordinates: Vec<[f64; 2]> = segment.geometry.iter().map(|p| [p.lon, p.lat]).collect();
        let selected = road_match.is_some_and(|m| m.by_heading.segment.id == segment.id);
        let color = if selected { "#0000ff" } else { "#888888" };
        features.push(json!({
            "type": "Feature",
            "properties": {
                "type": "candidate",
                "way_id": segment.id,
                "name": segment.name,
                "maxspeed": segment.tag("maxspeed"),
                "color": color,
            },
            "geometry": {
                "type": "LineString",
                "coordinates": coordinates
            }
        }));
    }

    features.push(json!({
        "type": "Feature",
        "properties": {
            "type": "fix",
            "heading": fix.heading,
            "speed": fix.speed,
            "color": "#3388ff",
        },
        "geometry": {
            "type": "Point",
            "coordinates": [fix.point.lon, fix.point.lat]
        }
    }));

    if let Some(m) = road_match {
        for (kind, result, color) in [
            ("nearest", &m.nearest, "#ff0000"),
            ("by_heading", &m.by_heading, "#00aa00"),
        ] {
            features.push(json!({
                "type": "Feature",
                "properties": {
                    "type": kind,
                    "way_id": result.segment.id,
                    "distance_m": result.perpendicular_distance_m,
                    "color": color,
                },
                "geometry": {
                    "type": "Point",
                    "coordinates": [result.projected_point.lon, result.projected_point.lat]
                }
            }));
        }
    }

    json!({
        "type": "FeatureCollection",
        "features": features
    })
}
