use geo::{Area, Coord, LineString, Polygon};

use crate::error::{Result, TrackError};
use crate::io::input::{ContourPoint, Region};

/// A region expressed in physical units, ready for overlap computation.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRegion {
    /// Scaled copy of the input; `area` is in the project's areal unit.
    pub region: Region,
    /// Contour as a closed polygon in physical units.
    pub polygon: Polygon<f64>,
    /// Geometric area of `polygon`, in squared physical units.
    pub polygon_area: f64,
}

impl NormalizedRegion {
    pub fn id(&self) -> u32 {
        self.region.id
    }

    /// True when the contour cannot enclose any area: fewer than three
    /// vertices, non-finite coordinates or a zero-area outline.
    pub fn is_degenerate(&self) -> bool {
        self.region.contour.len() < 3
            || !self.region.contour.iter().all(ContourPoint::is_finite)
            || !(self.polygon_area > 0.0)
    }
}

fn validate_scale(scale_factor: f64) -> Result<()> {
    if scale_factor.is_finite() && scale_factor > 0.0 {
        Ok(())
    } else {
        Err(TrackError::InvalidScaleFactor(scale_factor))
    }
}

/// Converts a region from pixels into physical units.
///
/// Contour and bounding box are multiplied by `scale_factor`, the declared
/// area by `scale_factor²` and then divided by `areal_divisor`
/// (100.0 turns mm² into cm²).
pub fn normalize(region: &Region, scale_factor: f64, areal_divisor: f64) -> Result<NormalizedRegion> {
    validate_scale(scale_factor)?;
    if !(areal_divisor.is_finite() && areal_divisor > 0.0) {
        return Err(TrackError::Config(format!(
            "areal divisor must be positive, got {}",
            areal_divisor
        )));
    }

    let contour: Vec<ContourPoint> = region
        .contour
        .iter()
        .map(|p| ContourPoint::new(p.x * scale_factor, p.y * scale_factor))
        .collect();
    let polygon = to_polygon(&contour);
    let polygon_area = polygon.unsigned_area();

    let scaled = Region {
        id: region.id,
        contour,
        bbox: region.bbox.scaled(scale_factor),
        area: region.area * scale_factor * scale_factor / areal_divisor,
        class_name: region.class_name.clone(),
        genet: region.genet,
    };

    Ok(NormalizedRegion {
        region: scaled,
        polygon,
        polygon_area,
    })
}

/// Normalizes a whole region set with one image scale.
pub fn normalize_all(
    regions: &[Region],
    scale_factor: f64,
    areal_divisor: f64,
) -> Result<Vec<NormalizedRegion>> {
    regions
        .iter()
        .map(|r| normalize(r, scale_factor, areal_divisor))
        .collect()
}

pub fn to_polygon(contour: &[ContourPoint]) -> Polygon<f64> {
    let coords: Vec<Coord<f64>> = contour.iter().map(|p| Coord { x: p.x, y: p.y }).collect();
    // LineString is closed by Polygon::new
    Polygon::new(LineString::new(coords), vec![])
}

#[cfg(test)]
mod geometry_tests {
    use super::*;
    use crate::io::input::BoundingBox;
    use crate::utils::test_utils::rect_region;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalize_scales_contour_bbox_and_area() {
        let region = rect_region(3, 0.0, 0.0, 10.0, 20.0);
        let n = normalize(&region, 2.0, 100.0).unwrap();

        assert_eq!(n.id(), 3);
        assert_eq!(n.region.bbox, BoundingBox::new(0.0, 0.0, 20.0, 40.0));
        assert_eq!(n.region.contour[2], ContourPoint::new(20.0, 40.0));
        // 200 px² * 4 / 100
        assert_relative_eq!(n.region.area, 8.0, epsilon = 1e-12);
        assert_relative_eq!(n.polygon_area, 800.0, epsilon = 1e-9);
        assert_eq!(n.region.class_name, region.class_name);
        assert!(!n.is_degenerate());
    }

    #[test]
    fn test_normalize_rejects_bad_scale() {
        let region = rect_region(1, 0.0, 0.0, 1.0, 1.0);
        for scale in [0.0, -2.0, f64::INFINITY, f64::NAN] {
            let err = normalize(&region, scale, 100.0).unwrap_err();
            assert!(matches!(err, TrackError::InvalidScaleFactor(_)));
        }
    }

    #[test]
    fn test_normalize_does_not_touch_input() {
        let region = rect_region(1, 1.0, 1.0, 2.0, 2.0);
        let before = region.clone();
        let _ = normalize(&region, 0.5, 1.0).unwrap();
        assert_eq!(region, before);
    }

    #[test]
    fn test_degenerate_contours() {
        let line = Region::from_contour(
            1,
            vec![ContourPoint::new(0.0, 0.0), ContourPoint::new(1.0, 1.0)],
            "x",
        );
        assert!(normalize(&line, 1.0, 1.0).unwrap().is_degenerate());

        let collinear = Region::from_contour(
            2,
            vec![
                ContourPoint::new(0.0, 0.0),
                ContourPoint::new(1.0, 0.0),
                ContourPoint::new(2.0, 0.0),
            ],
            "x",
        );
        assert!(normalize(&collinear, 1.0, 1.0).unwrap().is_degenerate());

        let mut nan = rect_region(3, 0.0, 0.0, 1.0, 1.0);
        nan.contour[1].x = f64::NAN;
        assert!(normalize(&nan, 1.0, 1.0).unwrap().is_degenerate());
    }
}
