use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::io::input::{ContourPoint, Region};

/// Axis-aligned rectangle region, counter-clockwise.
pub fn rect_region(id: u32, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Region {
    Region::from_contour(
        id,
        vec![
            ContourPoint::new(min_x, min_y),
            ContourPoint::new(max_x, min_y),
            ContourPoint::new(max_x, max_y),
            ContourPoint::new(min_x, max_y),
        ],
        "Acropora",
    )
}

/// `n` x `n` squares of edge `side`, spaced `2 * side` apart and shifted by
/// `offset` along x. Ids run from `id_base` row by row.
pub fn square_grid(n: u32, side: f64, offset: f64, id_base: u32) -> Vec<Region> {
    let mut regions = Vec::with_capacity((n * n) as usize);
    for row in 0..n {
        for col in 0..n {
            let x = col as f64 * 2.0 * side + offset;
            let y = row as f64 * 2.0 * side;
            regions.push(rect_region(id_base + row * n + col, x, y, x + side, y + side));
        }
    }
    regions
}

/// Random rectangles in a 100 x 100 field, overlapping each other freely.
pub fn scattered_regions(count: u32, seed: u64, id_base: u32) -> Vec<Region> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|k| {
            let x = rng.random_range(0.0..90.0);
            let y = rng.random_range(0.0..90.0);
            let w = rng.random_range(1.0..12.0);
            let h = rng.random_range(1.0..12.0);
            rect_region(id_base + k, x, y, x + w, y + h)
        })
        .collect()
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid test date")
}
