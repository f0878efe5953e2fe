use anyhow::{anyhow, Result};
use egui::{Pos2, Rect};
use serde_json::Value;

/// Outline of one country, in degrees (longitude, latitude).
#[derive(Debug, Clone)]
pub struct CountryShape {
    pub name: String,
    pub rings: Vec<Vec<[f64; 2]>>,
    bbox: [f64; 4], // min lon, min lat, max lon, max lat
}

impl CountryShape {
    fn new(name: String, rings: Vec<Vec<[f64; 2]>>) -> Self {
        let mut bbox = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
        for point in rings.iter().flatten() {
            bbox[0] = bbox[0].min(point[0]);
            bbox[1] = bbox[1].min(point[1]);
            bbox[2] = bbox[2].max(point[0]);
            bbox[3] = bbox[3].max(point[1]);
        }
        Self { name, rings, bbox }
    }

    /// Even-odd test over every ring, so holes and islands both work
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        if lon < self.bbox[0] || lon > self.bbox[2] || lat < self.bbox[1] || lat > self.bbox[3] {
            return false;
        }

        let mut inside = false;
        for ring in &self.rings {
            if ring.len() < 3 {
                continue;
            }
            let mut j = ring.len() - 1;
            for i in 0..ring.len() {
                let [xi, yi] = ring[i];
                let [xj, yj] = ring[j];
                if (yi > lat) != (yj > lat) && lon < (xj - xi) * (lat - yi) / (yj - yi) + xi {
                    inside = !inside;
                }
                j = i;
            }
        }
        inside
    }
}

/// Reads country outlines from a GeoJSON `FeatureCollection`.
///
/// Features without a usable name or with a geometry other than `Polygon`
/// and `MultiPolygon` are skipped.
pub fn parse_countries(geojson: &str) -> Result<Vec<CountryShape>> {
    let doc: Value = serde_json::from_str(geojson)?;
    let features = doc
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("GeoJSON document has no features"))?;

    let mut countries = Vec::with_capacity(features.len());
    for feature in features {
        let Some(name) = feature.get("properties").and_then(feature_name) else {
            continue;
        };
        let Some(geometry) = feature.get("geometry") else {
            continue;
        };

        let rings = match geometry.get("type").and_then(Value::as_str) {
            Some("Polygon") => geometry
                .get("coordinates")
                .map(parse_polygon)
                .unwrap_or_default(),
            Some("MultiPolygon") => geometry
                .get("coordinates")
                .and_then(Value::as_array)
                .map(|polygons| polygons.iter().flat_map(parse_polygon).collect())
                .unwrap_or_default(),
            _ => continue,
        };

        if !rings.is_empty() {
            countries.push(CountryShape::new(name, rings));
        }
    }

    log::info!("Loaded {} country outlines", countries.len());
    Ok(countries)
}

fn feature_name(properties: &Value) -> Option<String> {
    ["NAME", "name", "ADMIN"]
        .iter()
        .filter_map(|field| properties.get(field).and_then(Value::as_str))
        .find(|name| !name.is_empty())
        .map(str::to_string)
}

fn parse_polygon(coordinates: &Value) -> Vec<Vec<[f64; 2]>> {
    let Some(rings) = coordinates.as_array() else {
        return Vec::new();
    };

    rings
        .iter()
        .filter_map(Value::as_array)
        .map(|ring| {
            ring.iter()
                .filter_map(|point| {
                    let point = point.as_array()?;
                    Some([point.first()?.as_f64()?, point.get(1)?.as_f64()?])
                })
                .collect::<Vec<_>>()
        })
        .filter(|ring| ring.len() >= 3)
        .collect()
}

pub fn country_at(countries: &[CountryShape], lon: f64, lat: f64) -> Option<&CountryShape> {
    countries.iter().find(|c| c.contains(lon, lat))
}

/// Sorted, deduplicated country names for the list view
pub fn country_names(countries: &[CountryShape]) -> Vec<String> {
    let mut names: Vec<String> = countries.iter().map(|c| c.name.clone()).collect();
    names.sort();
    names.dedup();
    names
}

/// Equirectangular projection of the whole world onto `rect`.
pub fn project(lon: f64, lat: f64, rect: Rect) -> Pos2 {
    let x = rect.left() + ((lon + 180.0) / 360.0) as f32 * rect.width();
    let y = rect.top() + ((90.0 - lat) / 180.0) as f32 * rect.height();
    Pos2::new(x, y)
}

pub fn unproject(pos: Pos2, rect: Rect) -> (f64, f64) {
    let lon = ((pos.x - rect.left()) / rect.width()) as f64 * 360.0 - 180.0;
    let lat = 90.0 - ((pos.y - rect.top()) / rect.height()) as f64 * 180.0;
    (lon, lat)
}
