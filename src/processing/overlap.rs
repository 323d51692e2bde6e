use geo::{Area, BooleanOps};
use log::{debug, warn};
use rayon::prelude::*;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{RTree, AABB};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{MatchConfig, OverlapNormalization};
use crate::error::{Result, TrackError};
use crate::processing::geometry::NormalizedRegion;
use crate::tracking::table::Side;

/// Cooperative cancellation flag shared between a caller and a running match.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapEdge {
    pub source: u32,
    pub target: u32,
    /// Normalized overlap in (min_overlap, 1].
    pub weight: f64,
    /// Intersection area in squared physical units.
    pub intersection: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// Contour encloses no area; the region is kept without overlaps.
    DegenerateContour,
    /// Same id seen twice on one side; later occurrences are ignored.
    DuplicateId,
}

/// A region that could not take part in matching as given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDiagnostic {
    pub side: Side,
    pub id: u32,
    pub kind: DiagnosticKind,
}

impl fmt::Display for RegionDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DiagnosticKind::DegenerateContour => {
                write!(f, "{} region {} has a degenerate contour", self.side, self.id)
            }
            DiagnosticKind::DuplicateId => {
                write!(f, "{} region id {} appears more than once", self.side, self.id)
            }
        }
    }
}

/// Weighted bipartite overlap graph between two region sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlapGraph {
    /// Every source id, ascending, including regions without overlap.
    pub sources: Vec<u32>,
    /// Every target id, ascending, including regions without overlap.
    pub targets: Vec<u32>,
    /// Retained edges sorted by (source, target).
    pub edges: Vec<OverlapEdge>,
    pub diagnostics: Vec<RegionDiagnostic>,
}

type BoxEntry = GeomWithData<Rectangle<[f64; 2]>, usize>;

pub struct OverlapMatcher {
    config: MatchConfig,
}

impl OverlapMatcher {
    pub fn new(config: &MatchConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Builds the overlap graph between `sources` and `targets`.
    ///
    /// Candidate pairs come from an R-tree over target bounding boxes; the
    /// weight of each candidate is computed from the exact polygon
    /// intersection. The result does not depend on whether evaluation ran
    /// in parallel.
    pub fn match_regions(
        &self,
        sources: &[NormalizedRegion],
        targets: &[NormalizedRegion],
        cancel: &CancelToken,
    ) -> Result<OverlapGraph> {
        if cancel.is_cancelled() {
            return Err(TrackError::Cancelled);
        }
        let mut diagnostics = Vec::new();
        let (source_ids, valid_sources) = screen(sources, Side::Source, &mut diagnostics);
        let (target_ids, valid_targets) = screen(targets, Side::Target, &mut diagnostics);

        let tree: RTree<BoxEntry> = RTree::bulk_load(
            valid_targets
                .iter()
                .enumerate()
                .map(|(j, t)| {
                    let b = &t.region.bbox;
                    GeomWithData::new(
                        Rectangle::from_corners([b.min_x, b.min_y], [b.max_x, b.max_y]),
                        j,
                    )
                })
                .collect(),
        );

        let mut candidates: Vec<(usize, usize)> = Vec::new();
        for (i, s) in valid_sources.iter().enumerate() {
            let b = &s.region.bbox;
            let envelope = AABB::from_corners([b.min_x, b.min_y], [b.max_x, b.max_y]);
            candidates.extend(
                tree.locate_in_envelope_intersecting(&envelope)
                    .map(|entry| (i, entry.data)),
            );
        }
        candidates.sort_by_key(|&(i, j)| (valid_sources[i].id(), valid_targets[j].id()));

        let evaluated = self.evaluate(&candidates, cancel, |&(i, j)| {
            self.overlap(valid_sources[i], valid_targets[j])
        })?;

        let mut edges: Vec<OverlapEdge> = evaluated.into_iter().flatten().collect();
        edges.sort_by_key(|e| (e.source, e.target));

        debug!(
            "{} sources x {} targets: {} candidate pairs, {} edges retained",
            source_ids.len(),
            target_ids.len(),
            candidates.len(),
            edges.len()
        );

        Ok(OverlapGraph {
            sources: source_ids,
            targets: target_ids,
            edges,
            diagnostics,
        })
    }

    /// Runs `overlap` over every candidate, in parallel from
    /// `parallel_min_pairs` candidates on. The token is checked before each
    /// candidate.
    fn evaluate<T, F>(
        &self,
        candidates: &[T],
        cancel: &CancelToken,
        overlap: F,
    ) -> Result<Vec<Option<OverlapEdge>>>
    where
        T: Sync,
        F: Fn(&T) -> Option<OverlapEdge> + Sync,
    {
        let checked = |candidate: &T| -> Result<Option<OverlapEdge>> {
            if cancel.is_cancelled() {
                return Err(TrackError::Cancelled);
            }
            Ok(overlap(candidate))
        };

        if candidates.len() >= self.config.parallel_min_pairs {
            candidates.par_iter().map(checked).collect()
        } else {
            candidates.iter().map(checked).collect()
        }
    }

    fn overlap(&self, source: &NormalizedRegion, target: &NormalizedRegion) -> Option<OverlapEdge> {
        let intersection = source
            .polygon
            .intersection(&target.polygon)
            .unsigned_area();
        if !(intersection > 0.0) {
            return None;
        }

        let denominator = match self.config.normalization {
            OverlapNormalization::Union => {
                source.polygon_area + target.polygon_area - intersection
            }
            OverlapNormalization::Smaller => source.polygon_area.min(target.polygon_area),
        };
        let weight = (intersection / denominator).min(1.0);

        (weight > self.config.min_overlap).then(|| OverlapEdge {
            source: source.id(),
            target: target.id(),
            weight,
            intersection,
        })
    }
}

/// Drops duplicate ids and sets degenerate regions aside. Returns all kept
/// ids in ascending order together with the regions usable for overlap.
fn screen<'a>(
    regions: &'a [NormalizedRegion],
    side: Side,
    diagnostics: &mut Vec<RegionDiagnostic>,
) -> (Vec<u32>, Vec<&'a NormalizedRegion>) {
    let mut seen = HashSet::new();
    let mut ids = Vec::with_capacity(regions.len());
    let mut valid = Vec::with_capacity(regions.len());

    for region in regions {
        let id = region.id();
        let kind = if !seen.insert(id) {
            Some(DiagnosticKind::DuplicateId)
        } else if region.is_degenerate() {
            ids.push(id);
            Some(DiagnosticKind::DegenerateContour)
        } else {
            ids.push(id);
            valid.push(region);
            None
        };

        if let Some(kind) = kind {
            let diagnostic = RegionDiagnostic { side, id, kind };
            warn!("skipping overlap for {}", diagnostic);
            diagnostics.push(diagnostic);
        }
    }

    ids.sort_unstable();
    (ids, valid)
}
