use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Result, TrackError};
use crate::tracking::genet::GenetId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContourPoint {
    pub x: f64,
    pub y: f64,
}

impl ContourPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f64, f64)> for ContourPoint {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounding box, min corner inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn from_points(points: &[ContourPoint]) -> Option<Self> {
        let first = points.first()?;
        let mut bbox = BoundingBox::new(first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            bbox.min_x = bbox.min_x.min(p.x);
            bbox.min_y = bbox.min_y.min(p.y);
            bbox.max_x = bbox.max_x.max(p.x);
            bbox.max_y = bbox.max_y.max(p.y);
        }
        Some(bbox)
    }

    pub fn scaled(&self, factor: f64) -> Self {
        BoundingBox::new(
            self.min_x * factor,
            self.min_y * factor,
            self.max_x * factor,
            self.max_y * factor,
        )
    }
}

/// A segmented region ("blob") of one image, as handed over by the
/// annotation store. Coordinates are in pixels until normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: u32,
    pub contour: Vec<ContourPoint>,
    pub bbox: BoundingBox,
    pub area: f64,
    pub class_name: String,
    /// Lineage slot, written by the genet engine only.
    #[serde(default)]
    pub genet: Option<GenetId>,
}

impl Region {
    pub fn new(
        id: u32,
        contour: Vec<ContourPoint>,
        bbox: BoundingBox,
        area: f64,
        class_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            contour,
            bbox,
            area,
            class_name: class_name.into(),
            genet: None,
        }
    }

    /// Builds a region whose bounding box and area are derived from the contour.
    pub fn from_contour(id: u32, contour: Vec<ContourPoint>, class_name: impl Into<String>) -> Self {
        let bbox = BoundingBox::from_points(&contour)
            .unwrap_or_else(|| BoundingBox::new(0.0, 0.0, 0.0, 0.0));
        let area = shoelace_area(&contour);
        Self::new(id, contour, bbox, area, class_name)
    }
}

pub fn shoelace_area(points: &[ContourPoint]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }

    let mut sum = 0.0_f64;
    for i in 0..n {
        let p1 = &points[i];
        let p2 = &points[(i + 1) % n];
        sum += p1.x * p2.y - p2.x * p1.y;
    }
    0.5 * sum.abs()
}

/// An annotated image, referenced by identity only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    /// Physical units (e.g. mm) per pixel.
    pub scale_factor: f64,
    pub acquisition_date: NaiveDate,
}

impl ImageInfo {
    pub fn new(id: impl Into<String>, scale_factor: f64, acquisition_date: NaiveDate) -> Result<Self> {
        if !(scale_factor.is_finite() && scale_factor > 0.0) {
            return Err(TrackError::InvalidScaleFactor(scale_factor));
        }
        Ok(Self {
            id: id.into(),
            scale_factor,
            acquisition_date,
        })
    }
}

/// Region and image exports come comma- or tab-separated; whichever
/// occurs more often in the header line wins.
fn detect_delimiter<P: AsRef<Path>>(path: P) -> anyhow::Result<u8> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut header = String::new();
    BufReader::new(file)
        .read_line(&mut header)
        .with_context(|| format!("failed to read the header of {}", path.display()))?;

    Ok(if header.matches('\t').count() > header.matches(',').count() {
        b'\t'
    } else {
        b','
    })
}

#[derive(Debug, Deserialize)]
struct RegionPointRecord {
    image_id: String,
    region_id: u32,
    class_name: String,
    x: f64,
    y: f64,
}

/// Reads region contours from a CSV with the header
/// `image_id, region_id, class_name, x, y`, one row per contour vertex in
/// drawing order. Returns the regions grouped by image, sorted by id.
pub fn read_regions_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<BTreeMap<String, Vec<Region>>> {
    let delimiter = detect_delimiter(&path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_path(&path)
        .with_context(|| format!("failed to open region file {:?}", path.as_ref()))?;

    let mut groups: BTreeMap<String, BTreeMap<u32, (String, Vec<ContourPoint>)>> = BTreeMap::new();
    for (line, result) in reader.deserialize::<RegionPointRecord>().enumerate() {
        let record = result.with_context(|| format!("malformed region row {}", line + 2))?;
        let entry = groups
            .entry(record.image_id)
            .or_default()
            .entry(record.region_id)
            .or_insert_with(|| (record.class_name.clone(), Vec::new()));
        if entry.0 != record.class_name {
            return Err(anyhow!(
                "region {} has conflicting class names '{}' and '{}'",
                record.region_id,
                entry.0,
                record.class_name
            ));
        }
        entry.1.push(ContourPoint::new(record.x, record.y));
    }

    Ok(groups
        .into_iter()
        .map(|(image, regions)| {
            let regions = regions
                .into_iter()
                .map(|(id, (class_name, contour))| Region::from_contour(id, contour, class_name))
                .collect();
            (image, regions)
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct ImageRecord {
    image_id: String,
    scale_factor: f64,
    acquisition_date: NaiveDate,
}

/// Reads image metadata from a CSV with the header
/// `image_id, scale_factor, acquisition_date` (dates as `YYYY-MM-DD`).
pub fn read_images_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<ImageInfo>> {
    let delimiter = detect_delimiter(&path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_path(&path)
        .with_context(|| format!("failed to open image file {:?}", path.as_ref()))?;

    let mut images = Vec::new();
    for (line, result) in reader.deserialize::<ImageRecord>().enumerate() {
        let record = result.with_context(|| format!("malformed image row {}", line + 2))?;
        let image = ImageInfo::new(record.image_id, record.scale_factor, record.acquisition_date)
            .with_context(|| format!("invalid image row {}", line + 2))?;
        images.push(image);
    }
    Ok(images)
}
