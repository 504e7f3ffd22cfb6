use anyhow::{Context, Result};
use async_trait::async_trait;
use geo::{Geometry, MultiPolygon};
use geojson::GeoJson;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use super::boundary::{Boundary, BoundaryKind, BoundingBox};

const RECTANGLE_PATTERN: &str =
    r"^(-?\d{1,3}(\.\d+)?),\s?(-?\d{1,3}(\.\d+)?)#(-?\d{1,3}(\.\d+)?),\s?(-?\d{1,3}(\.\d+)?)$";

/// Declared coordinate system of user input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateSystem {
    Gcj02,
    Wgs84,
    Bd09,
}

/// Where the crawl region comes from
#[derive(Debug, Clone, PartialEq)]
pub enum RegionSpec {
    /// `lng,lat#lng,lat`, top-left then bottom-right
    Rectangle { text: String, crs: CoordinateSystem },
    GeoJsonFile { path: PathBuf, crs: CoordinateSystem },
    AdCode(String),
}

/// Turns a region request into a boundary
#[async_trait]
pub trait BoundaryResolver: Send + Sync {
    async fn resolve(&self, spec: &RegionSpec) -> Result<Boundary>;
}

/// Resolves rectangles locally, files from disk and administrative codes
/// through the DataV boundary service.
pub struct DefaultResolver {
    client: Client,
    boundary_url: String,
}

impl DefaultResolver {
    pub fn new(boundary_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            boundary_url: boundary_url.into(),
        })
    }

    async fn administrative(&self, ad_code: &str) -> Result<Boundary> {
        let url = format!("{}/{}.json", self.boundary_url.trim_end_matches('/'), ad_code);
        debug!("Fetching administrative boundary from {}", url);

        let body = self
            .client
            .get(&url)
            .send()
            .await
            .context(format!("Failed to fetch boundary for {}", ad_code))?
            .error_for_status()
            .context(format!("Boundary service rejected {}", ad_code))?
            .text()
            .await
            .context(format!("Failed to read boundary for {}", ad_code))?;
        let document: GeoJson = body
            .parse()
            .context(format!("Boundary for {} is not valid GeoJSON", ad_code))?;

        let name = feature_name(&document).unwrap_or_else(|| ad_code.to_string());
        let label = format!("{}:{}", ad_code, name);

        Boundary::from_shape(BoundaryKind::Administrative, label, multipolygon(document)?)
    }
}

#[async_trait]
impl BoundaryResolver for DefaultResolver {
    async fn resolve(&self, spec: &RegionSpec) -> Result<Boundary> {
        match spec {
            RegionSpec::Rectangle { text, crs } => {
                ensure_native(*crs)?;
                Ok(Boundary::rectangle(parse_rectangle(text)?, text.clone()))
            }
            RegionSpec::GeoJsonFile { path, crs } => {
                ensure_native(*crs)?;
                let contents = tokio::fs::read_to_string(path)
                    .await
                    .context(format!("Failed to read boundary file: {}", path.display()))?;
                let document: GeoJson = contents
                    .parse()
                    .context(format!("Failed to parse boundary file: {}", path.display()))?;
                Boundary::from_shape(BoundaryKind::Custom, path.display().to_string(), multipolygon(document)?)
            }
            RegionSpec::AdCode(code) => self.administrative(code).await,
        }
    }
}

/// Coordinates are handed to the service untouched, so they must already be GCJ-02
fn ensure_native(crs: CoordinateSystem) -> Result<()> {
    if crs != CoordinateSystem::Gcj02 {
        anyhow::bail!("Coordinate system {:?} needs conversion to GCJ-02, which is not supported", crs);
    }
    Ok(())
}

/// Parse `lng,lat#lng,lat` into a box
pub fn parse_rectangle(text: &str) -> Result<BoundingBox> {
    let pattern = Regex::new(RECTANGLE_PATTERN)?;
    let captures = pattern
        .captures(text.trim())
        .ok_or_else(|| anyhow::anyhow!("Invalid rectangle '{}', expected e.g. 114.12,30.53#115.28,29.59", text))?;

    let number = |index: usize| -> Result<f64> {
        Ok(captures
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("Missing coordinate in '{}'", text))?
            .as_str()
            .parse()?)
    };
    let (lng1, lat1, lng2, lat2) = (number(1)?, number(3)?, number(5)?, number(7)?);

    if lng1 == lng2 || lat1 == lat2 {
        anyhow::bail!("Rectangle '{}' has no area", text);
    }

    Ok(BoundingBox::new(
        lng1.min(lng2),
        lat1.min(lat2),
        lng1.max(lng2),
        lat1.max(lat2),
    ))
}

fn feature_name(document: &GeoJson) -> Option<String> {
    let feature = match document {
        GeoJson::FeatureCollection(collection) => collection.features.first()?,
        GeoJson::Feature(feature) => feature,
        GeoJson::Geometry(_) => return None,
    };
    feature.property("name")?.as_str().map(str::to_string)
}

/// Every Polygon/MultiPolygon in a GeoJSON document, holes included
fn multipolygon(document: GeoJson) -> Result<MultiPolygon<f64>> {
    let geometries = match document {
        GeoJson::FeatureCollection(collection) => collection
            .features
            .into_iter()
            .filter_map(|feature| feature.geometry)
            .collect(),
        GeoJson::Feature(feature) => feature.geometry.into_iter().collect(),
        GeoJson::Geometry(geometry) => vec![geometry],
    };

    let mut polygons = Vec::new();
    for geometry in geometries {
        let geometry: Geometry<f64> = geometry.try_into().context("Invalid boundary geometry")?;
        match geometry {
            Geometry::Polygon(polygon) => polygons.push(polygon),
            Geometry::MultiPolygon(multi) => polygons.extend(multi),
            other => anyhow::bail!("Unsupported geometry type: {:?}", other),
        }
    }

    if polygons.is_empty() {
        anyhow::bail!("No polygon found in boundary document");
    }
    Ok(MultiPolygon(polygons))
}
