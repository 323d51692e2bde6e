use crossbeam::thread;
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::TrackConfig;
use crate::error::{Result, TrackError};
use crate::io::input::{ImageInfo, Region};
use crate::processing::classify::{classify, AmbiguousMatch};
use crate::processing::geometry::{normalize, normalize_all};
use crate::processing::overlap::{CancelToken, OverlapMatcher, RegionDiagnostic};
use crate::tracking::genet::{GenetId, GenetLineageEngine, RegionKey};
use crate::tracking::table::{ConsistencyReport, CorrespondenceRow, CorrespondenceTable, Side, TableKey};

/// Outcome of one automatic match, for the caller to review.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondenceReport {
    pub key: TableKey,
    pub rows: usize,
    pub diagnostics: Vec<RegionDiagnostic>,
    pub ambiguities: Vec<AmbiguousMatch>,
}

/// Matching result not yet written into a table.
struct PairMatch {
    key: TableKey,
    rows: Vec<CorrespondenceRow>,
    diagnostics: Vec<RegionDiagnostic>,
    ambiguities: Vec<AmbiguousMatch>,
    sources: Vec<Region>,
    targets: Vec<Region>,
}

/// Registry of images, correspondence tables and genets of one site.
#[derive(Debug, Clone)]
pub struct Project {
    config: TrackConfig,
    /// Sorted by acquisition date, then id.
    images: Vec<ImageInfo>,
    tables: BTreeMap<TableKey, CorrespondenceTable>,
    genets: GenetLineageEngine,
}

impl Project {
    pub fn new(config: TrackConfig) -> Self {
        Self {
            config,
            images: Vec::new(),
            tables: BTreeMap::new(),
            genets: GenetLineageEngine::new(),
        }
    }

    pub fn config(&self) -> &TrackConfig {
        &self.config
    }

    pub fn images(&self) -> &[ImageInfo] {
        &self.images
    }

    pub fn image(&self, id: &str) -> Result<&ImageInfo> {
        self.images
            .iter()
            .find(|i| i.id == id)
            .ok_or_else(|| TrackError::UnknownImage(id.to_string()))
    }

    /// Adds an image, or replaces the one with the same id.
    pub fn add_image(&mut self, image: ImageInfo) {
        self.images.retain(|i| i.id != image.id);
        self.images.push(image);
        self.images
            .sort_by(|a, b| (a.acquisition_date, &a.id).cmp(&(b.acquisition_date, &b.id)));
    }

    /// Removes an image together with every table it takes part in.
    pub fn remove_image(&mut self, id: &str) -> Result<ImageInfo> {
        let position = self
            .images
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| TrackError::UnknownImage(id.to_string()))?;
        let image = self.images.remove(position);

        for key in self.keys_of(id) {
            self.tables.remove(&key);
            self.genets.forget_table(&key);
        }
        info!("removed image {}", id);
        Ok(image)
    }

    pub fn table(&self, source: &str, target: &str) -> Option<&CorrespondenceTable> {
        self.tables.get(&TableKey::new(source, target))
    }

    pub fn tables(&self) -> impl Iterator<Item = &CorrespondenceTable> {
        self.tables.values()
    }

    /// The table of an image pair, created empty on first request.
    pub fn table_or_create(&mut self, source: &str, target: &str) -> Result<&mut CorrespondenceTable> {
        self.image(source)?;
        self.image(target)?;
        let key = TableKey::new(source, target);
        Ok(self
            .tables
            .entry(key.clone())
            .or_insert_with(|| CorrespondenceTable::new(key)))
    }

    /// Every table where `image` is the source or the target.
    pub fn find_correspondences(&self, image: &str) -> Vec<&CorrespondenceTable> {
        self.tables
            .values()
            .filter(|t| t.key().side_of(image).is_some())
            .collect()
    }

    fn keys_of(&self, image: &str) -> Vec<TableKey> {
        self.tables
            .keys()
            .filter(|k| k.side_of(image).is_some())
            .cloned()
            .collect()
    }

    /// Runs matching and classification between two images and stores the
    /// result in their table. Manual rows are kept when configured so.
    pub fn compute_correspondences(
        &mut self,
        source: &str,
        target: &str,
        source_regions: &[Region],
        target_regions: &[Region],
        cancel: &CancelToken,
    ) -> Result<CorrespondenceReport> {
        let matched = self.match_pair(source, target, source_regions, target_regions, cancel)?;
        Ok(self.commit(matched))
    }

    /// Matches every pair of chronologically consecutive images found in
    /// `regions`. Pairs are matched concurrently, then stored in
    /// chronological order; nothing is stored if any pair fails.
    pub fn compute_consecutive(
        &mut self,
        regions: &BTreeMap<String, Vec<Region>>,
        cancel: &CancelToken,
    ) -> Result<Vec<CorrespondenceReport>> {
        let pairs: Vec<(&str, &str, &[Region], &[Region])> = self
            .images
            .windows(2)
            .filter_map(|w| {
                let source = regions.get(&w[0].id)?;
                let target = regions.get(&w[1].id)?;
                Some((w[0].id.as_str(), w[1].id.as_str(), source.as_slice(), target.as_slice()))
            })
            .collect();

        let this = &*self;
        let matched = thread::scope(|s| {
            let handles: Vec<_> = pairs
                .iter()
                .map(|&(source, target, source_regions, target_regions)| {
                    s.spawn(move |_| {
                        this.match_pair(source, target, source_regions, target_regions, cancel)
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(Err(TrackError::WorkerPanicked)))
                .collect::<Result<Vec<_>>>()
        })
        .map_err(|_| TrackError::WorkerPanicked)??;

        Ok(matched.into_iter().map(|m| self.commit(m)).collect())
    }

    fn match_pair(
        &self,
        source: &str,
        target: &str,
        source_regions: &[Region],
        target_regions: &[Region],
        cancel: &CancelToken,
    ) -> Result<PairMatch> {
        let divisor = self.config.units.areal_divisor;
        let sources = normalize_all(source_regions, self.image(source)?.scale_factor, divisor)?;
        let targets = normalize_all(target_regions, self.image(target)?.scale_factor, divisor)?;

        let graph = OverlapMatcher::new(&self.config.matching).match_regions(&sources, &targets, cancel)?;
        let classification = classify(&graph)?;

        Ok(PairMatch {
            key: TableKey::new(source, target),
            rows: classification.rows,
            diagnostics: graph.diagnostics,
            ambiguities: classification.ambiguities,
            sources: sources.into_iter().map(|n| n.region).collect(),
            targets: targets.into_iter().map(|n| n.region).collect(),
        })
    }

    fn commit(&mut self, matched: PairMatch) -> CorrespondenceReport {
        let key = matched.key;
        let table = self
            .tables
            .entry(key.clone())
            .or_insert_with(|| CorrespondenceTable::new(key.clone()));

        if self.config.table.keep_manual_rows {
            table.merge_auto_match(matched.rows);
        } else {
            table.from_auto_match(matched.rows);
        }
        table.refresh_areas(Side::Source, &matched.sources);
        table.refresh_areas(Side::Target, &matched.targets);
        table.sort_rows();
        self.genets.update_incremental(table);

        info!(
            "matched {}: {} rows, {} ambiguous, {} skipped regions",
            key,
            table.len(),
            matched.ambiguities.len(),
            matched.diagnostics.len()
        );
        CorrespondenceReport {
            rows: table.len(),
            key,
            diagnostics: matched.diagnostics,
            ambiguities: matched.ambiguities,
        }
    }

    /// Manual link between regions of two images.
    pub fn add_correspondence(
        &mut self,
        source: &str,
        target: &str,
        sources: &[u32],
        targets: &[u32],
    ) -> Result<()> {
        self.table_or_create(source, target)?.set(sources, targets)?;
        if let Some(table) = self.tables.get_mut(&TableKey::new(source, target)) {
            table.sort_rows();
            self.genets.update_incremental(table);
        }
        Ok(())
    }

    /// A region drawn on `image` after matching; it enters every table of
    /// the image as a birth or a death.
    pub fn add_region(&mut self, image: &str, region: &Region) -> Result<()> {
        let scaled = self.normalized(image, region)?;
        let slots = self.slots_of(image);
        for (key, side) in &slots {
            if self.tables[key].known(*side).contains(&region.id) {
                return Err(TrackError::DuplicateRegion { side: *side, id: region.id });
            }
        }
        for (key, side) in &slots {
            if let Some(table) = self.tables.get_mut(key) {
                table.add_region(*side, &scaled)?;
            }
        }
        self.resync(slots.into_iter().map(|(key, _)| key));
        Ok(())
    }

    /// Drops a region from every table of its image. Returns false if no
    /// table referred to it.
    pub fn remove_region(&mut self, image: &str, id: u32) -> Result<bool> {
        self.image(image)?;
        let mut touched = Vec::new();
        for (key, side) in self.slots_of(image) {
            if let Some(table) = self.tables.get_mut(&key) {
                if table.remove_region(side, id) {
                    touched.push(key);
                }
            }
        }
        let found = !touched.is_empty();
        self.resync(touched);
        Ok(found)
    }

    /// Replaces a region in every table of its image, possibly under a new
    /// id. The region keeps its genet.
    pub fn update_region(&mut self, image: &str, old_id: u32, region: &Region) -> Result<()> {
        let scaled = self.normalized(image, region)?;
        let slots = self.slots_of(image);
        let holding: Vec<(TableKey, Side)> = slots
            .iter()
            .filter(|(key, side)| self.tables[key].known(*side).contains(&old_id))
            .cloned()
            .collect();
        if holding.is_empty() {
            return Err(TrackError::NotFound {
                image: image.to_string(),
                region: old_id,
            });
        }
        if region.id != old_id {
            if let Some((_, side)) = slots
                .iter()
                .find(|(key, side)| self.tables[key].known(*side).contains(&region.id))
            {
                return Err(TrackError::DuplicateRegion { side: *side, id: region.id });
            }
        }

        for (key, side) in &holding {
            if let Some(table) = self.tables.get_mut(key) {
                table.update_region(*side, old_id, &scaled)?;
            }
        }
        self.genets.rename(image, old_id, region.id);
        self.resync(holding.into_iter().map(|(key, _)| key));
        Ok(())
    }

    /// Changes the physical scale of an image and refreshes the areas its
    /// tables hold. Correspondences are not recomputed.
    pub fn update_image_scale(&mut self, image: &str, scale_factor: f64, regions: &[Region]) -> Result<()> {
        let position = self
            .images
            .iter()
            .position(|i| i.id == image)
            .ok_or_else(|| TrackError::UnknownImage(image.to_string()))?;
        let updated = ImageInfo::new(image, scale_factor, self.images[position].acquisition_date)?;
        let scaled: Vec<Region> = normalize_all(regions, scale_factor, self.config.units.areal_divisor)?
            .into_iter()
            .map(|n| n.region)
            .collect();
        self.images[position] = updated;

        for (key, side) in self.slots_of(image) {
            if let Some(table) = self.tables.get_mut(&key) {
                table.refresh_areas(side, &scaled);
            }
        }
        Ok(())
    }

    /// Checks every table, flagging the inconsistent ones. Returns their reports.
    pub fn check_consistency(&mut self) -> Vec<(TableKey, ConsistencyReport)> {
        let mut problems = Vec::new();
        for (key, table) in self.tables.iter_mut() {
            let report = table.check_consistency();
            if !report.is_consistent() {
                problems.push((key.clone(), report));
            }
        }
        if !problems.is_empty() {
            warn!("{} correspondence tables are inconsistent", problems.len());
        }
        problems
    }

    pub fn rebuild_genets(&mut self) {
        self.genets.rebuild_from(self.tables.values());
    }

    /// Installs persisted genet ids so the next rebuild keeps them.
    pub fn seed_genets(&mut self, entries: impl IntoIterator<Item = (RegionKey, GenetId)>) {
        self.genets.seed_previous(entries);
    }

    pub fn genets(&self) -> &GenetLineageEngine {
        &self.genets
    }

    pub fn genet_of(&self, image: &str, region: u32) -> Result<GenetId> {
        self.genets.genet_of(image, region)
    }

    fn normalized(&self, image: &str, region: &Region) -> Result<Region> {
        let scale = self.image(image)?.scale_factor;
        Ok(normalize(region, scale, self.config.units.areal_divisor)?.region)
    }

    /// Every (table, side) where `image` takes part; a self-pair yields both
    /// sides of its table.
    fn slots_of(&self, image: &str) -> Vec<(TableKey, Side)> {
        self.keys_of(image)
            .into_iter()
            .flat_map(|key| {
                key.sides_of(image)
                    .into_iter()
                    .map(move |side| (key.clone(), side))
            })
            .collect()
    }

    /// Restores canonical row order of the edited tables and updates the
    /// genets they touch.
    fn resync(&mut self, keys: impl IntoIterator<Item = TableKey>) {
        let keys: BTreeSet<TableKey> = keys.into_iter().collect();
        for key in keys {
            if let Some(table) = self.tables.get_mut(&key) {
                table.sort_rows();
                self.genets.update_incremental(table);
            }
        }
    }
}
