use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryFrom;
use std::fmt;

use crate::error::{Result, TrackError};
use crate::io::input::Region;

/// Which image of an ordered pair a region belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Target => write!(f, "target"),
        }
    }
}

/// Event kinds in canonical display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Persist,
    Split,
    Fuse,
    Death,
    Birth,
}

impl fmt::Display for RowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                RowKind::Persist => "persist",
                RowKind::Split => "split",
                RowKind::Fuse => "fuse",
                RowKind::Death => "death",
                RowKind::Birth => "birth",
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrespondenceRow {
    Persist { source: u32, target: u32 },
    Split { source: u32, targets: BTreeSet<u32> },
    Fuse { sources: BTreeSet<u32>, target: u32 },
    Birth { target: u32 },
    Death { source: u32 },
}

impl CorrespondenceRow {
    pub fn kind(&self) -> RowKind {
        match self {
            CorrespondenceRow::Persist { .. } => RowKind::Persist,
            CorrespondenceRow::Split { .. } => RowKind::Split,
            CorrespondenceRow::Fuse { .. } => RowKind::Fuse,
            CorrespondenceRow::Birth { .. } => RowKind::Birth,
            CorrespondenceRow::Death { .. } => RowKind::Death,
        }
    }

    pub fn sources(&self) -> Vec<u32> {
        match self {
            CorrespondenceRow::Persist { source, .. }
            | CorrespondenceRow::Split { source, .. }
            | CorrespondenceRow::Death { source } => vec![*source],
            CorrespondenceRow::Fuse { sources, .. } => sources.iter().copied().collect(),
            CorrespondenceRow::Birth { .. } => Vec::new(),
        }
    }

    pub fn targets(&self) -> Vec<u32> {
        match self {
            CorrespondenceRow::Persist { target, .. }
            | CorrespondenceRow::Fuse { target, .. }
            | CorrespondenceRow::Birth { target } => vec![*target],
            CorrespondenceRow::Split { targets, .. } => targets.iter().copied().collect(),
            CorrespondenceRow::Death { .. } => Vec::new(),
        }
    }

    pub fn ids(&self, side: Side) -> Vec<u32> {
        match side {
            Side::Source => self.sources(),
            Side::Target => self.targets(),
        }
    }

    pub fn mentions(&self, side: Side, id: u32) -> bool {
        self.ids(side).contains(&id)
    }

    /// True for rows that tie a source to a target (and so propagate a genet).
    pub fn is_link(&self) -> bool {
        matches!(
            self.kind(),
            RowKind::Persist | RowKind::Split | RowKind::Fuse
        )
    }

    /// Smallest id used to order rows: source side first, target side for births.
    pub fn sort_id(&self) -> u32 {
        let sources = self.sources();
        match sources.first() {
            Some(s) => *s,
            None => self.targets().first().copied().unwrap_or(0),
        }
    }

    /// The rows expressing "these sources become these targets".
    ///
    /// An empty side yields one birth or death per region; a many-to-many
    /// request cannot be expressed by a single row and is rejected.
    pub fn link(sources: &[u32], targets: &[u32]) -> Result<Vec<CorrespondenceRow>> {
        let sources: BTreeSet<u32> = sources.iter().copied().collect();
        let targets: BTreeSet<u32> = targets.iter().copied().collect();

        let rows = match (sources.len(), targets.len()) {
            (0, _) => targets
                .into_iter()
                .map(|target| CorrespondenceRow::Birth { target })
                .collect(),
            (_, 0) => sources
                .into_iter()
                .map(|source| CorrespondenceRow::Death { source })
                .collect(),
            (1, _) | (_, 1) => vec![Self::from_sets(sources, targets)?],
            (n, m) => return Err(TrackError::AmbiguousMatch { sources: n, targets: m }),
        };
        Ok(rows)
    }

    /// Builds the single row for a one-to-one, one-to-many or many-to-one set.
    fn from_sets(sources: BTreeSet<u32>, targets: BTreeSet<u32>) -> Result<CorrespondenceRow> {
        let single = |set: &BTreeSet<u32>| set.iter().next().copied();
        match (sources.len(), targets.len()) {
            (1, 1) => Ok(CorrespondenceRow::Persist {
                source: single(&sources).unwrap_or_default(),
                target: single(&targets).unwrap_or_default(),
            }),
            (1, m) if m >= 2 => Ok(CorrespondenceRow::Split {
                source: single(&sources).unwrap_or_default(),
                targets,
            }),
            (n, 1) if n >= 2 => Ok(CorrespondenceRow::Fuse {
                sources,
                target: single(&targets).unwrap_or_default(),
            }),
            (0, 1) => Ok(CorrespondenceRow::Birth {
                target: single(&targets).unwrap_or_default(),
            }),
            (1, 0) => Ok(CorrespondenceRow::Death {
                source: single(&sources).unwrap_or_default(),
            }),
            (n, m) => Err(TrackError::AmbiguousMatch { sources: n, targets: m }),
        }
    }

    /// Rows left once `id` is taken out of this row.
    ///
    /// Split and fuse groups shrink and degrade to a persist at one member;
    /// counterparts left alone become births or deaths; a row whose only
    /// member goes away disappears.
    pub fn without(&self, side: Side, id: u32) -> Vec<CorrespondenceRow> {
        if !self.mentions(side, id) {
            return vec![self.clone()];
        }

        let mut sources: BTreeSet<u32> = self.sources().into_iter().collect();
        let mut targets: BTreeSet<u32> = self.targets().into_iter().collect();
        match side {
            Side::Source => sources.remove(&id),
            Side::Target => targets.remove(&id),
        };

        match (sources.is_empty(), targets.is_empty()) {
            (true, true) => Vec::new(),
            (true, false) => targets
                .into_iter()
                .map(|target| CorrespondenceRow::Birth { target })
                .collect(),
            (false, true) => sources
                .into_iter()
                .map(|source| CorrespondenceRow::Death { source })
                .collect(),
            // still one-to-many or many-to-one: cannot fail
            (false, false) => Self::from_sets(sources, targets).into_iter().collect(),
        }
    }

    /// Replaces `old` by `new` on one side, keeping the event kind.
    pub fn renamed(&self, side: Side, old: u32, new: u32) -> CorrespondenceRow {
        let swap = |id: u32| if id == old { new } else { id };
        let swap_set = |set: &BTreeSet<u32>| set.iter().map(|&id| swap(id)).collect();
        match (self, side) {
            (CorrespondenceRow::Persist { source, target }, Side::Source) => {
                CorrespondenceRow::Persist { source: swap(*source), target: *target }
            }
            (CorrespondenceRow::Persist { source, target }, Side::Target) => {
                CorrespondenceRow::Persist { source: *source, target: swap(*target) }
            }
            (CorrespondenceRow::Split { source, targets }, Side::Source) => {
                CorrespondenceRow::Split { source: swap(*source), targets: targets.clone() }
            }
            (CorrespondenceRow::Split { source, targets }, Side::Target) => {
                CorrespondenceRow::Split { source: *source, targets: swap_set(targets) }
            }
            (CorrespondenceRow::Fuse { sources, target }, Side::Source) => {
                CorrespondenceRow::Fuse { sources: swap_set(sources), target: *target }
            }
            (CorrespondenceRow::Fuse { sources, target }, Side::Target) => {
                CorrespondenceRow::Fuse { sources: sources.clone(), target: swap(*target) }
            }
            (CorrespondenceRow::Death { source }, Side::Source) => {
                CorrespondenceRow::Death { source: swap(*source) }
            }
            (CorrespondenceRow::Birth { target }, Side::Target) => {
                CorrespondenceRow::Birth { target: swap(*target) }
            }
            (row, _) => row.clone(),
        }
    }
}

impl fmt::Display for CorrespondenceRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?} -> {:?})", self.kind(), self.sources(), self.targets())
    }
}

/// Persisted shape of a row: `{source: [ids], target: [ids], kind}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRecord {
    pub source: Vec<u32>,
    pub target: Vec<u32>,
    pub kind: RowKind,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub manual: bool,
}

impl TryFrom<&RowRecord> for CorrespondenceRow {
    type Error = TrackError;

    fn try_from(record: &RowRecord) -> Result<Self> {
        let sources: BTreeSet<u32> = record.source.iter().copied().collect();
        let targets: BTreeSet<u32> = record.target.iter().copied().collect();
        if sources.len() != record.source.len() || targets.len() != record.target.len() {
            return Err(TrackError::InvalidRow(format!(
                "repeated id in {} row {:?} -> {:?}",
                record.kind, record.source, record.target
            )));
        }

        let row = Self::from_sets(sources, targets).map_err(|_| {
            TrackError::InvalidRow(format!(
                "{} -> {} regions cannot form a {} row",
                record.source.len(),
                record.target.len(),
                record.kind
            ))
        })?;
        if row.kind() != record.kind {
            return Err(TrackError::InvalidRow(format!(
                "row {:?} -> {:?} is a {}, not a {}",
                record.source,
                record.target,
                row.kind(),
                record.kind
            )));
        }
        Ok(row)
    }
}

/// Ordered image pair owning a table. `A -> B` and `B -> A` are distinct.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub source: String,
    pub target: String,
}

impl TableKey {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    pub fn image(&self, side: Side) -> &str {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }

    /// Side on which `image` takes part in this pair, source first.
    pub fn side_of(&self, image: &str) -> Option<Side> {
        if self.source == image {
            Some(Side::Source)
        } else if self.target == image {
            Some(Side::Target)
        } else {
            None
        }
    }

    /// Every side on which `image` takes part; both for a self-pair.
    pub fn sides_of(&self, image: &str) -> Vec<Side> {
        [Side::Source, Side::Target]
            .into_iter()
            .filter(|&side| self.image(side) == image)
            .collect()
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.source, self.target)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub row: CorrespondenceRow,
    /// Entered by hand; kept when the automatic matcher is re-run.
    pub manual: bool,
}

impl TableRow {
    fn auto(row: CorrespondenceRow) -> Self {
        Self { row, manual: false }
    }

    pub fn record(&self) -> RowRecord {
        RowRecord {
            source: self.row.sources(),
            target: self.row.targets(),
            kind: self.row.kind(),
            manual: self.manual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSummary {
    /// Area in the project's areal unit.
    pub area: f64,
    pub class_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Grow,
    Shrink,
    Same,
}

/// Outcome of a coverage check. Each entry is `(side, region id)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Known regions no row refers to.
    pub missing: Vec<(Side, u32)>,
    /// Regions referred to by more than one row.
    pub duplicated: Vec<(Side, u32)>,
    /// Ids referred to by rows but not known to the table.
    pub unknown: Vec<(Side, u32)>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.duplicated.is_empty() && self.unknown.is_empty()
    }

    pub fn into_error(self, table: impl Into<String>) -> Result<()> {
        if self.is_consistent() {
            return Ok(());
        }
        Err(TrackError::InconsistentTable {
            table: table.into(),
            missing: self.missing.len(),
            duplicated: self.duplicated.len() + self.unknown.len(),
        })
    }
}

/// Checks that every known id is referenced exactly once on its side.
pub fn coverage<'a>(
    rows: impl IntoIterator<Item = &'a CorrespondenceRow>,
    known_sources: &BTreeSet<u32>,
    known_targets: &BTreeSet<u32>,
) -> ConsistencyReport {
    let mut counts: BTreeMap<(Side, u32), usize> = BTreeMap::new();
    for row in rows {
        for side in [Side::Source, Side::Target] {
            for id in row.ids(side) {
                *counts.entry((side, id)).or_default() += 1;
            }
        }
    }

    let mut report = ConsistencyReport::default();
    for (side, known) in [(Side::Source, known_sources), (Side::Target, known_targets)] {
        for &id in known {
            if !counts.contains_key(&(side, id)) {
                report.missing.push((side, id));
            }
        }
    }
    for (&(side, id), &n) in &counts {
        if n > 1 {
            report.duplicated.push((side, id));
        }
        let known = match side {
            Side::Source => known_sources,
            Side::Target => known_targets,
        };
        if !known.contains(&id) {
            report.unknown.push((side, id));
        }
    }
    report
}

/// Sorts rows by kind (persist, split, fuse, death, birth), then by id.
pub fn canonical_sort(rows: &mut [CorrespondenceRow]) {
    rows.sort_by_key(|r| (r.kind(), r.sort_id()));
}

/// The per image pair record of transition events.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondenceTable {
    key: TableKey,
    rows: Vec<TableRow>,
    known_sources: BTreeSet<u32>,
    known_targets: BTreeSet<u32>,
    summaries: BTreeMap<(Side, u32), RegionSummary>,
    flagged: bool,
}

impl CorrespondenceTable {
    pub fn new(key: TableKey) -> Self {
        Self {
            key,
            rows: Vec::new(),
            known_sources: BTreeSet::new(),
            known_targets: BTreeSet::new(),
            summaries: BTreeMap::new(),
            flagged: false,
        }
    }

    pub fn key(&self) -> &TableKey {
        &self.key
    }

    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Set by the last `check_consistency` that found a problem.
    pub fn is_flagged(&self) -> bool {
        self.flagged
    }

    pub fn known(&self, side: Side) -> &BTreeSet<u32> {
        match side {
            Side::Source => &self.known_sources,
            Side::Target => &self.known_targets,
        }
    }

    fn known_mut(&mut self, side: Side) -> &mut BTreeSet<u32> {
        match side {
            Side::Source => &mut self.known_sources,
            Side::Target => &mut self.known_targets,
        }
    }

    pub fn row_of(&self, side: Side, id: u32) -> Option<&TableRow> {
        self.rows.iter().find(|r| r.row.mentions(side, id))
    }

    pub fn summary(&self, side: Side, id: u32) -> Option<&RegionSummary> {
        self.summaries.get(&(side, id))
    }

    /// Replaces the content with freshly classified rows; manual flags are
    /// cleared.
    pub fn from_auto_match(&mut self, rows: Vec<CorrespondenceRow>) {
        self.known_sources = rows.iter().flat_map(|r| r.sources()).collect();
        self.known_targets = rows.iter().flat_map(|r| r.targets()).collect();
        self.rows = rows.into_iter().map(TableRow::auto).collect();
        self.flagged = false;
        self.prune_summaries();
    }

    /// Takes freshly classified rows while keeping every manual row. Auto
    /// rows lose the regions already claimed by a manual row.
    pub fn merge_auto_match(&mut self, rows: Vec<CorrespondenceRow>) {
        let manual: Vec<TableRow> = self.rows.iter().filter(|r| r.manual).cloned().collect();
        if manual.is_empty() {
            self.from_auto_match(rows);
            return;
        }

        let claimed: Vec<(Side, u32)> = manual
            .iter()
            .flat_map(|r| {
                let sources = r.row.sources().into_iter().map(|id| (Side::Source, id));
                let targets = r.row.targets().into_iter().map(|id| (Side::Target, id));
                sources.chain(targets).collect::<Vec<_>>()
            })
            .collect();

        let mut merged = manual;
        for row in rows {
            let mut pieces = vec![row];
            for &(side, id) in &claimed {
                pieces = pieces.iter().flat_map(|p| p.without(side, id)).collect();
            }
            merged.extend(pieces.into_iter().map(TableRow::auto));
        }

        self.known_sources = merged.iter().flat_map(|r| r.row.sources()).collect();
        self.known_targets = merged.iter().flat_map(|r| r.row.targets()).collect();
        self.rows = merged;
        self.flagged = false;
        self.prune_summaries();
    }

    /// Manual correspondence between `sources` and `targets`.
    ///
    /// Every row touching one of the ids is taken apart first; counterparts
    /// losing their partner become births or deaths. The new rows are
    /// flagged manual.
    pub fn set(&mut self, sources: &[u32], targets: &[u32]) -> Result<()> {
        let new_rows = CorrespondenceRow::link(sources, targets)?;

        for &id in sources {
            self.strip(Side::Source, id);
            self.known_sources.insert(id);
        }
        for &id in targets {
            self.strip(Side::Target, id);
            self.known_targets.insert(id);
        }
        self.rows.extend(
            new_rows
                .into_iter()
                .map(|row| TableRow { row, manual: true }),
        );
        Ok(())
    }

    /// Replaces every row with caller-provided ones, all flagged manual.
    pub fn replace_with_manual(&mut self, rows: Vec<CorrespondenceRow>) {
        self.from_auto_match(rows);
        for row in self.rows.iter_mut() {
            row.manual = true;
        }
    }

    /// A region created after matching: a death on the source side, a
    /// birth on the target side.
    pub fn add_region(&mut self, side: Side, region: &Region) -> Result<()> {
        if self.known(side).contains(&region.id) {
            return Err(TrackError::DuplicateRegion { side, id: region.id });
        }
        self.known_mut(side).insert(region.id);
        self.record_summary(side, region);
        let row = match side {
            Side::Source => CorrespondenceRow::Death { source: region.id },
            Side::Target => CorrespondenceRow::Birth { target: region.id },
        };
        self.rows.push(TableRow::auto(row));
        Ok(())
    }

    /// Removes every reference to `id`. Returns false if nothing referred to it.
    pub fn remove_region(&mut self, side: Side, id: u32) -> bool {
        let known = self.known_mut(side).remove(&id);
        self.summaries.remove(&(side, id));
        self.strip(side, id) || known
    }

    /// Swaps the id of a region in place and refreshes its area and class.
    /// Event kinds are left alone.
    pub fn update_region(&mut self, side: Side, old_id: u32, region: &Region) -> Result<()> {
        if !self.known(side).contains(&old_id) {
            return Err(TrackError::NotFound {
                image: self.key.image(side).to_string(),
                region: old_id,
            });
        }
        if region.id != old_id && self.known(side).contains(&region.id) {
            return Err(TrackError::DuplicateRegion { side, id: region.id });
        }

        for row in self.rows.iter_mut() {
            row.row = row.row.renamed(side, old_id, region.id);
        }
        let known = self.known_mut(side);
        known.remove(&old_id);
        known.insert(region.id);
        self.summaries.remove(&(side, old_id));
        self.record_summary(side, region);
        Ok(())
    }

    /// Stores area and class of regions, e.g. after the image scale changed.
    /// Regions the table does not know are ignored.
    pub fn refresh_areas(&mut self, side: Side, regions: &[Region]) {
        for region in regions {
            if self.known(side).contains(&region.id) {
                self.record_summary(side, region);
            }
        }
    }

    fn record_summary(&mut self, side: Side, region: &Region) {
        self.summaries.insert(
            (side, region.id),
            RegionSummary {
                area: region.area,
                class_name: region.class_name.clone(),
            },
        );
    }

    /// Drops area summaries of regions the table no longer knows.
    fn prune_summaries(&mut self) {
        let (sources, targets) = (&self.known_sources, &self.known_targets);
        self.summaries.retain(|&(side, id), _| match side {
            Side::Source => sources.contains(&id),
            Side::Target => targets.contains(&id),
        });
    }

    /// Declares the regions the annotation store currently holds on one
    /// side, so `check_consistency` can spot regions without a row.
    pub fn sync_known(&mut self, side: Side, ids: impl IntoIterator<Item = u32>) {
        *self.known_mut(side) = ids.into_iter().collect();
    }

    fn strip(&mut self, side: Side, id: u32) -> bool {
        if !self.rows.iter().any(|r| r.row.mentions(side, id)) {
            return false;
        }
        let rows = std::mem::take(&mut self.rows);
        self.rows = rows
            .into_iter()
            .flat_map(|r| {
                let manual = r.manual;
                r.row
                    .without(side, id)
                    .into_iter()
                    .map(move |row| TableRow { row, manual })
            })
            .collect();
        true
    }

    pub fn report(&self) -> ConsistencyReport {
        coverage(
            self.rows.iter().map(|r| &r.row),
            &self.known_sources,
            &self.known_targets,
        )
    }

    /// Flags the table when an id is referenced zero or several times.
    /// Nothing is repaired.
    pub fn check_consistency(&mut self) -> ConsistencyReport {
        let report = self.report();
        self.flagged = !report.is_consistent();
        if self.flagged {
            warn!(
                "correspondence table {} is inconsistent: missing {:?}, duplicated {:?}, unknown {:?}",
                self.key, report.missing, report.duplicated, report.unknown
            );
        }
        report
    }

    pub fn validate(&self) -> Result<()> {
        self.report().into_error(self.key.to_string())
    }

    /// Rows in canonical order, for display and serialization.
    pub fn reorder(&self) -> Vec<TableRow> {
        let mut rows = self.rows.clone();
        rows.sort_by_key(|r| (r.row.kind(), r.row.sort_id()));
        rows
    }

    pub fn sort_rows(&mut self) {
        self.rows.sort_by_key(|r| (r.row.kind(), r.row.sort_id()));
    }

    /// Area change across a link row. `None` for births, deaths and rows
    /// with a region whose area is not known.
    pub fn trend(&self, row: &CorrespondenceRow, tolerance: f64) -> Option<Trend> {
        if !row.is_link() {
            return None;
        }
        let before = self.total_area(Side::Source, &row.sources())?;
        let after = self.total_area(Side::Target, &row.targets())?;

        let change = after - before;
        if change.abs() <= tolerance * before.abs() {
            Some(Trend::Same)
        } else if change > 0.0 {
            Some(Trend::Grow)
        } else {
            Some(Trend::Shrink)
        }
    }

    pub fn total_area(&self, side: Side, ids: &[u32]) -> Option<f64> {
        ids.iter()
            .map(|&id| self.summary(side, id).map(|s| s.area))
            .sum()
    }

    pub fn records(&self) -> Vec<RowRecord> {
        self.reorder().iter().map(TableRow::record).collect()
    }

    /// Rebuilds the table from persisted rows, keeping their manual flags.
    pub fn load_records(&mut self, records: &[RowRecord]) -> Result<()> {
        let rows = records
            .iter()
            .map(|record| {
                CorrespondenceRow::try_from(record).map(|row| TableRow {
                    row,
                    manual: record.manual,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.known_sources = rows.iter().flat_map(|r| r.row.sources()).collect();
        self.known_targets = rows.iter().flat_map(|r| r.row.targets()).collect();
        self.rows = rows;
        self.flagged = false;
        self.prune_summaries();
        Ok(())
    }
}

#[cfg(test)]
mod table_tests {
    use super::*;
    use crate::utils::test_utils::rect_region;

    fn set(ids: &[u32]) -> BTreeSet<u32> {
        ids.iter().copied().collect()
    }

    fn table_with(rows: Vec<CorrespondenceRow>) -> CorrespondenceTable {
        let mut table = CorrespondenceTable::new(TableKey::new("A", "B"));
        table.from_auto_match(rows);
        table
    }

    fn kinds(table: &CorrespondenceTable) -> Vec<CorrespondenceRow> {
        let mut rows: Vec<_> = table.rows().iter().map(|r| r.row.clone()).collect();
        canonical_sort(&mut rows);
        rows
    }

    #[test]
    fn test_removing_source_of_persist_leaves_birth() {
        let mut table = table_with(vec![CorrespondenceRow::Persist { source: 1, target: 10 }]);
        assert!(table.remove_region(Side::Source, 1));

        assert_eq!(kinds(&table), vec![CorrespondenceRow::Birth { target: 10 }]);
        assert!(table.rows().iter().all(|r| !r.row.mentions(Side::Source, 1)));
        assert!(table.report().is_consistent());
    }

    #[test]
    fn test_split_degrades_to_persist_then_to_death() {
        let mut table = table_with(vec![CorrespondenceRow::Split {
            source: 1,
            targets: set(&[10, 11, 12]),
        }]);

        table.remove_region(Side::Target, 12);
        assert_eq!(
            kinds(&table),
            vec![CorrespondenceRow::Split { source: 1, targets: set(&[10, 11]) }]
        );

        table.remove_region(Side::Target, 10);
        assert_eq!(kinds(&table), vec![CorrespondenceRow::Persist { source: 1, target: 11 }]);

        table.remove_region(Side::Target, 11);
        assert_eq!(kinds(&table), vec![CorrespondenceRow::Death { source: 1 }]);

        table.remove_region(Side::Source, 1);
        assert!(table.is_empty());
        assert!(table.report().is_consistent());
    }

    #[test]
    fn test_removing_fuse_target_leaves_deaths() {
        let mut table = table_with(vec![CorrespondenceRow::Fuse {
            sources: set(&[1, 2]),
            target: 10,
        }]);
        table.remove_region(Side::Target, 10);
        assert_eq!(
            kinds(&table),
            vec![
                CorrespondenceRow::Death { source: 1 },
                CorrespondenceRow::Death { source: 2 }
            ]
        );
    }

    #[test]
    fn test_remove_unknown_region_is_noop() {
        let mut table = table_with(vec![CorrespondenceRow::Persist { source: 1, target: 10 }]);
        assert!(!table.remove_region(Side::Source, 99));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_add_region_defaults_to_birth_or_death() {
        let mut table = table_with(vec![]);
        table.add_region(Side::Source, &rect_region(1, 0.0, 0.0, 1.0, 1.0)).unwrap();
        table.add_region(Side::Target, &rect_region(2, 0.0, 0.0, 1.0, 1.0)).unwrap();
        assert_eq!(
            kinds(&table),
            vec![
                CorrespondenceRow::Death { source: 1 },
                CorrespondenceRow::Birth { target: 2 }
            ]
        );

        let err = table
            .add_region(Side::Source, &rect_region(1, 0.0, 0.0, 1.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, TrackError::DuplicateRegion { id: 1, .. }));
    }

    #[test]
    fn test_update_region_renames_in_place() {
        let mut table = table_with(vec![
            CorrespondenceRow::Fuse { sources: set(&[1, 2]), target: 10 },
            CorrespondenceRow::Birth { target: 11 },
        ]);
        let replacement = rect_region(5, 0.0, 0.0, 3.0, 3.0);
        table.update_region(Side::Source, 2, &replacement).unwrap();

        assert_eq!(
            table.rows()[0].row,
            CorrespondenceRow::Fuse { sources: set(&[1, 5]), target: 10 }
        );
        assert_eq!(table.summary(Side::Source, 5).unwrap().area, 9.0);
        assert!(table.report().is_consistent());

        let err = table.update_region(Side::Source, 2, &replacement).unwrap_err();
        assert!(matches!(err, TrackError::NotFound { region: 2, .. }));
    }

    #[test]
    fn test_set_rewires_and_orphans_counterparts() {
        let mut table = table_with(vec![
            CorrespondenceRow::Split { source: 1, targets: set(&[10, 11]) },
            CorrespondenceRow::Persist { source: 2, target: 12 },
        ]);

        table.set(&[2], &[11]).unwrap();
        let rows = kinds(&table);
        assert_eq!(
            rows,
            vec![
                CorrespondenceRow::Persist { source: 1, target: 10 },
                CorrespondenceRow::Persist { source: 2, target: 11 },
                CorrespondenceRow::Birth { target: 12 },
            ]
        );
        let manual: Vec<_> = table.rows().iter().filter(|r| r.manual).collect();
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].row, CorrespondenceRow::Persist { source: 2, target: 11 });
        assert!(table.report().is_consistent());
    }

    #[test]
    fn test_set_rejects_many_to_many() {
        let mut table = table_with(vec![]);
        let err = table.set(&[1, 2], &[10, 11]).unwrap_err();
        assert!(matches!(err, TrackError::AmbiguousMatch { sources: 2, targets: 2 }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_manual_rows_survive_merge() {
        let mut table = table_with(vec![
            CorrespondenceRow::Persist { source: 1, target: 10 },
            CorrespondenceRow::Persist { source: 2, target: 11 },
        ]);
        table.set(&[1], &[11]).unwrap();

        table.merge_auto_match(vec![
            CorrespondenceRow::Persist { source: 1, target: 10 },
            CorrespondenceRow::Persist { source: 2, target: 11 },
        ]);

        assert_eq!(
            kinds(&table),
            vec![
                CorrespondenceRow::Persist { source: 1, target: 11 },
                CorrespondenceRow::Death { source: 2 },
                CorrespondenceRow::Birth { target: 10 },
            ]
        );
        assert!(table.report().is_consistent());

        table.from_auto_match(vec![CorrespondenceRow::Persist { source: 1, target: 10 }]);
        assert!(table.rows().iter().all(|r| !r.manual));
    }

    #[test]
    fn test_rematch_drops_summaries_of_vanished_regions() {
        let mut table = table_with(vec![
            CorrespondenceRow::Persist { source: 1, target: 10 },
            CorrespondenceRow::Persist { source: 2, target: 11 },
        ]);
        table.refresh_areas(
            Side::Source,
            &[rect_region(1, 0.0, 0.0, 1.0, 1.0), rect_region(2, 0.0, 0.0, 2.0, 2.0)],
        );
        table.refresh_areas(Side::Target, &[rect_region(10, 0.0, 0.0, 1.0, 1.0)]);

        table.from_auto_match(vec![CorrespondenceRow::Persist { source: 1, target: 10 }]);
        assert!(table.summary(Side::Source, 1).is_some());
        assert!(table.summary(Side::Target, 10).is_some());
        assert!(table.summary(Side::Source, 2).is_none());

        table.set(&[1], &[10]).unwrap();
        table.merge_auto_match(vec![CorrespondenceRow::Death { source: 3 }]);
        assert!(table.summary(Side::Source, 1).is_some());
        assert!(table.summary(Side::Target, 10).is_some());

        table.replace_with_manual(vec![CorrespondenceRow::Birth { target: 12 }]);
        assert!(table.summary(Side::Source, 1).is_none());
        assert!(table.summary(Side::Target, 10).is_none());
    }

    #[test]
    fn test_sides_of_self_pair() {
        assert_eq!(TableKey::new("A", "A").sides_of("A"), vec![Side::Source, Side::Target]);
        assert_eq!(TableKey::new("A", "B").sides_of("B"), vec![Side::Target]);
        assert!(TableKey::new("A", "B").sides_of("C").is_empty());
    }

    #[test]
    fn test_check_consistency_flags_without_repair() {
        let mut table = table_with(vec![
            CorrespondenceRow::Persist { source: 1, target: 10 },
            CorrespondenceRow::Death { source: 1 },
        ]);
        table.sync_known(Side::Target, [10, 11]);

        let report = table.check_consistency();
        assert!(!report.is_consistent());
        assert_eq!(report.duplicated, vec![(Side::Source, 1)]);
        assert_eq!(report.missing, vec![(Side::Target, 11)]);
        assert!(table.is_flagged());
        assert_eq!(table.len(), 2);
        assert!(matches!(
            table.validate(),
            Err(TrackError::InconsistentTable { missing: 1, duplicated: 1, .. })
        ));
    }

    #[test]
    fn test_reorder_canonical_kind_order() {
        let table = table_with(vec![
            CorrespondenceRow::Birth { target: 20 },
            CorrespondenceRow::Death { source: 3 },
            CorrespondenceRow::Fuse { sources: set(&[4, 5]), target: 13 },
            CorrespondenceRow::Persist { source: 2, target: 11 },
            CorrespondenceRow::Split { source: 6, targets: set(&[14, 15]) },
            CorrespondenceRow::Persist { source: 1, target: 10 },
        ]);
        let order: Vec<(RowKind, u32)> = table
            .reorder()
            .iter()
            .map(|r| (r.row.kind(), r.row.sort_id()))
            .collect();
        assert_eq!(
            order,
            vec![
                (RowKind::Persist, 1),
                (RowKind::Persist, 2),
                (RowKind::Split, 6),
                (RowKind::Fuse, 4),
                (RowKind::Death, 3),
                (RowKind::Birth, 20),
            ]
        );
    }

    #[test]
    fn test_trend_with_tolerance() {
        let mut table = table_with(vec![
            CorrespondenceRow::Persist { source: 1, target: 10 },
            CorrespondenceRow::Fuse { sources: set(&[2, 3]), target: 11 },
        ]);
        table.refresh_areas(
            Side::Source,
            &[
                rect_region(1, 0.0, 0.0, 10.0, 10.0),
                rect_region(2, 0.0, 0.0, 2.0, 2.0),
                rect_region(3, 0.0, 0.0, 2.0, 2.0),
            ],
        );
        table.refresh_areas(
            Side::Target,
            &[
                rect_region(10, 0.0, 0.0, 10.0, 10.5),
                rect_region(11, 0.0, 0.0, 2.0, 3.0),
            ],
        );

        let persist = table.rows()[0].row.clone();
        let fuse = table.rows()[1].row.clone();
        assert_eq!(table.trend(&persist, 0.0), Some(Trend::Grow));
        assert_eq!(table.trend(&persist, 0.1), Some(Trend::Same));
        assert_eq!(table.trend(&fuse, 0.0), Some(Trend::Shrink));
        assert_eq!(table.trend(&CorrespondenceRow::Birth { target: 10 }, 0.0), None);
    }

    #[test]
    fn test_records_round_trip_and_validation() {
        let mut table = table_with(vec![
            CorrespondenceRow::Split { source: 1, targets: set(&[10, 11]) },
            CorrespondenceRow::Birth { target: 12 },
        ]);
        table.set(&[2], &[]).unwrap();
        let records = table.records();
        assert!(records.iter().any(|r| r.manual && r.kind == RowKind::Death));

        let mut restored = CorrespondenceTable::new(TableKey::new("A", "B"));
        restored.load_records(&records).unwrap();
        assert_eq!(restored.records(), records);

        let bad = RowRecord {
            source: vec![1],
            target: vec![10],
            kind: RowKind::Split,
            manual: false,
        };
        assert!(matches!(
            CorrespondenceRow::try_from(&bad),
            Err(TrackError::InvalidRow(_))
        ));
    }
}
