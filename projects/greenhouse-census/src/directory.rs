//! Location and classification context for a session.

use crate::error::{PipelineError, Result};
use crate::pipeline::estimation::DensityParameters;
use anyhow::Context;
use geo::Contains;
use geo_types::{LineString, Point as GeoPoint, Polygon};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    pub fn validate(&self) -> Result<()> {
        let ok = self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude);
        if ok {
            Ok(())
        } else {
            Err(PipelineError::validation(format!(
                "gps coordinate out of range: ({}, {})",
                self.latitude, self.longitude
            )))
        }
    }
}

/// Physical location results are attached to.
#[derive(Debug, Clone, Serialize)]
pub struct LocationContext {
    pub id: i64,
    pub code: String,
    pub name: String,
    /// Stored calibration, if the directory carries one.
    pub density: Option<DensityParameters>,
}

/// What a location is expected to hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub product: String,
    pub product_state: String,
    #[serde(default)]
    pub packaging: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
}

impl Default for Classification {
    fn default() -> Self {
        Self {
            product: "unclassified".to_string(),
            product_state: "unknown".to_string(),
            packaging: None,
            size: None,
        }
    }
}

impl Classification {
    /// Key used in the per-category count map.
    pub fn category(&self) -> String {
        format!("{}:{}", self.product, self.product_state)
    }
}

pub trait LocationResolver: Send + Sync {
    /// Location whose boundary contains `gps`, or `ResourceNotFound`.
    fn resolve(&self, gps: &GpsPoint) -> Result<LocationContext>;

    fn by_id(&self, id: i64) -> Result<LocationContext>;
}

pub trait ClassificationLookup: Send + Sync {
    fn expected_classification(&self, location_id: i64) -> Option<Classification>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationEntry {
    pub id: i64,
    pub code: String,
    #[serde(default)]
    pub name: String,
    /// Boundary ring, in order.
    #[serde(default)]
    pub bounds: Vec<GpsPoint>,
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub density: Option<DensityParameters>,
}

impl LocationEntry {
    fn contains(&self, gps: &GpsPoint) -> bool {
        if self.bounds.len() < 3 {
            return false;
        }
        let ring: Vec<(f64, f64)> = self.bounds.iter().map(|p| (p.longitude, p.latitude)).collect();
        let polygon = Polygon::new(LineString::from(ring), vec![]);
        polygon.contains(&GeoPoint::new(gps.longitude, gps.latitude))
    }

    fn context(&self) -> LocationContext {
        LocationContext {
            id: self.id,
            code: self.code.clone(),
            name: self.name.clone(),
            density: self.density.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    locations: Vec<LocationEntry>,
}

/// Directory backed by a JSON file loaded at start-up.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: Vec<LocationEntry>,
}

impl StaticDirectory {
    pub fn new(entries: Vec<LocationEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read location directory {}", path.display()))?;
        let file: DirectoryFile = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse location directory {}", path.display()))?;
        tracing::info!("Loaded {} locations from {}", file.locations.len(), path.display());
        Ok(Self::new(file.locations))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LocationResolver for StaticDirectory {
    fn resolve(&self, gps: &GpsPoint) -> Result<LocationContext> {
        gps.validate()?;
        self.entries
            .iter()
            .find(|e| e.contains(gps))
            .map(LocationEntry::context)
            .ok_or_else(|| {
                PipelineError::not_found(format!(
                    "no location contains ({}, {})",
                    gps.latitude, gps.longitude
                ))
            })
    }

    fn by_id(&self, id: i64) -> Result<LocationContext> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(LocationEntry::context)
            .ok_or_else(|| PipelineError::not_found(format!("location {id}")))
    }
}

impl ClassificationLookup for StaticDirectory {
    fn expected_classification(&self, location_id: i64) -> Option<Classification> {
        self.entries
            .iter()
            .find(|e| e.id == location_id)
            .and_then(|e| e.classification.clone())
    }
}
