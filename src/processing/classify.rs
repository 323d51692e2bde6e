use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::Result;
use crate::processing::overlap::{OverlapEdge, OverlapGraph};
use crate::tracking::table::{canonical_sort, coverage, CorrespondenceRow, Side};

/// How an ambiguous region ended up in its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Committed by the highest-weight-first pass over many-to-many overlaps.
    Greedy,
    /// Every overlap went to a region already claimed by another row, so the
    /// region was left as a birth or a death.
    Orphaned,
}

/// Soft signal for a row produced from ambiguous overlaps, meant for manual
/// review. Not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct AmbiguousMatch {
    pub row: CorrespondenceRow,
    pub resolution: Resolution,
    /// Overlaps of the row's regions that the row does not keep.
    pub dropped: Vec<OverlapEdge>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// Rows in canonical order.
    pub rows: Vec<CorrespondenceRow>,
    pub ambiguities: Vec<AmbiguousMatch>,
}

/// Edges still open, indexed from both sides.
#[derive(Default)]
struct Open {
    by_source: BTreeMap<u32, BTreeMap<u32, f64>>,
    by_target: BTreeMap<u32, BTreeMap<u32, f64>>,
}

impl Open {
    fn new(edges: &[OverlapEdge]) -> Self {
        let mut open = Open::default();
        for e in edges {
            open.by_source.entry(e.source).or_default().insert(e.target, e.weight);
            open.by_target.entry(e.target).or_default().insert(e.source, e.weight);
        }
        open
    }

    fn neighbours(&self, side: Side, id: u32) -> Option<&BTreeMap<u32, f64>> {
        match side {
            Side::Source => self.by_source.get(&id),
            Side::Target => self.by_target.get(&id),
        }
    }

    fn degree(&self, side: Side, id: u32) -> usize {
        self.neighbours(side, id).map_or(0, |n| n.len())
    }

    /// Counterpart with the heaviest open edge; ties go to the lower id.
    fn heaviest(&self, side: Side, id: u32) -> Option<u32> {
        let mut best: Option<(u32, f64)> = None;
        for (&other, &w) in self.neighbours(side, id)? {
            if best.map_or(true, |(_, bw)| w > bw) {
                best = Some((other, w));
            }
        }
        best.map(|(other, _)| other)
    }

    /// Drops `id` and all its open edges.
    fn close(&mut self, side: Side, id: u32) {
        let (own, other) = match side {
            Side::Source => (&mut self.by_source, &mut self.by_target),
            Side::Target => (&mut self.by_target, &mut self.by_source),
        };
        if let Some(neighbours) = own.remove(&id) {
            for n in neighbours.keys() {
                if let Some(back) = other.get_mut(n) {
                    back.remove(&id);
                    if back.is_empty() {
                        other.remove(n);
                    }
                }
            }
        }
    }

    fn edges(&self) -> Vec<(u32, u32, f64)> {
        self.by_source
            .iter()
            .flat_map(|(&s, targets)| targets.iter().map(move |(&t, &w)| (s, t, w)))
            .collect()
    }
}

#[derive(Debug, Default)]
struct Group {
    sources: BTreeSet<u32>,
    targets: BTreeSet<u32>,
}

/// Turns an overlap graph into transition rows.
///
/// Order of the rules: births and deaths, one-to-one persists, splits (a
/// source that is the heaviest match of each of its targets), fuses (the
/// symmetric case on what is left), then a greedy highest-weight-first pass
/// over the remaining edges. Every region of the graph ends up in exactly
/// one row; this is verified before returning.
pub fn classify(graph: &OverlapGraph) -> Result<Classification> {
    let mut open = Open::new(&graph.edges);
    let mut rows: Vec<CorrespondenceRow> = Vec::new();
    let mut done_sources: BTreeSet<u32> = BTreeSet::new();
    let mut done_targets: BTreeSet<u32> = BTreeSet::new();

    // 1. no overlap at all
    for &s in &graph.sources {
        if open.degree(Side::Source, s) == 0 {
            rows.push(CorrespondenceRow::Death { source: s });
            done_sources.insert(s);
        }
    }
    for &t in &graph.targets {
        if open.degree(Side::Target, t) == 0 {
            rows.push(CorrespondenceRow::Birth { target: t });
            done_targets.insert(t);
        }
    }

    // 2. isolated pairs
    for &s in &graph.sources {
        if open.degree(Side::Source, s) != 1 {
            continue;
        }
        let Some(t) = open.heaviest(Side::Source, s) else {
            continue;
        };
        if open.degree(Side::Target, t) == 1 {
            rows.push(CorrespondenceRow::Persist { source: s, target: t });
            commit(&mut open, &mut done_sources, &mut done_targets, [s], [t]);
        }
    }

    // 3. splits dominate fuses
    for &s in &graph.sources {
        if done_sources.contains(&s) || open.degree(Side::Source, s) < 2 {
            continue;
        }
        let targets: BTreeSet<u32> = open
            .neighbours(Side::Source, s)
            .map(|n| n.keys().copied().collect())
            .unwrap_or_default();
        if targets
            .iter()
            .all(|&t| open.heaviest(Side::Target, t) == Some(s))
        {
            commit(&mut open, &mut done_sources, &mut done_targets, [s], targets.clone());
            rows.push(CorrespondenceRow::Split { source: s, targets });
        }
    }

    // 4. fuses on what is left
    for &t in &graph.targets {
        if done_targets.contains(&t) || open.degree(Side::Target, t) < 2 {
            continue;
        }
        let sources: BTreeSet<u32> = open
            .neighbours(Side::Target, t)
            .map(|n| n.keys().copied().collect())
            .unwrap_or_default();
        if sources
            .iter()
            .all(|&s| open.heaviest(Side::Source, s) == Some(t))
        {
            commit(&mut open, &mut done_sources, &mut done_targets, sources.clone(), [t]);
            rows.push(CorrespondenceRow::Fuse { sources, target: t });
        }
    }

    // 5. greedy pass
    let mut ambiguities = Vec::new();
    let resolved = greedy(&open);
    for group in resolved {
        let row = match (group.sources.len(), group.targets.len()) {
            (1, 1) => CorrespondenceRow::Persist {
                source: first(&group.sources),
                target: first(&group.targets),
            },
            (1, _) => CorrespondenceRow::Split {
                source: first(&group.sources),
                targets: group.targets.clone(),
            },
            _ => CorrespondenceRow::Fuse {
                sources: group.sources.clone(),
                target: first(&group.targets),
            },
        };
        done_sources.extend(group.sources.iter().copied());
        done_targets.extend(group.targets.iter().copied());
        ambiguities.push(AmbiguousMatch {
            dropped: dropped_edges(graph, &group.sources, &group.targets),
            row: row.clone(),
            resolution: Resolution::Greedy,
        });
        rows.push(row);
    }

    // regions whose overlaps all went elsewhere
    for &s in &graph.sources {
        if done_sources.insert(s) {
            let row = CorrespondenceRow::Death { source: s };
            ambiguities.push(orphan(graph, row.clone()));
            rows.push(row);
        }
    }
    for &t in &graph.targets {
        if done_targets.insert(t) {
            let row = CorrespondenceRow::Birth { target: t };
            ambiguities.push(orphan(graph, row.clone()));
            rows.push(row);
        }
    }

    let known_sources: BTreeSet<u32> = graph.sources.iter().copied().collect();
    let known_targets: BTreeSet<u32> = graph.targets.iter().copied().collect();
    coverage(&rows, &known_sources, &known_targets).into_error("automatic match")?;

    canonical_sort(&mut rows);
    debug!(
        "classified {} rows, {} flagged for review",
        rows.len(),
        ambiguities.len()
    );
    Ok(Classification { rows, ambiguities })
}

fn commit(
    open: &mut Open,
    done_sources: &mut BTreeSet<u32>,
    done_targets: &mut BTreeSet<u32>,
    sources: impl IntoIterator<Item = u32>,
    targets: impl IntoIterator<Item = u32>,
) {
    for s in sources {
        open.close(Side::Source, s);
        done_sources.insert(s);
    }
    for t in targets {
        open.close(Side::Target, t);
        done_targets.insert(t);
    }
}

/// Highest weight first; ties by ascending source then target. An edge
/// joins an existing group only if the group stays one-to-many or
/// many-to-one.
fn greedy(open: &Open) -> Vec<Group> {
    let mut edges = open.edges();
    edges.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)).then(a.1.cmp(&b.1)));

    let mut groups: Vec<Group> = Vec::new();
    let mut group_of_source: HashMap<u32, usize> = HashMap::new();
    let mut group_of_target: HashMap<u32, usize> = HashMap::new();

    for (s, t, _) in edges {
        match (group_of_source.get(&s).copied(), group_of_target.get(&t).copied()) {
            (None, None) => {
                let mut group = Group::default();
                group.sources.insert(s);
                group.targets.insert(t);
                group_of_source.insert(s, groups.len());
                group_of_target.insert(t, groups.len());
                groups.push(group);
            }
            (Some(g), None) if groups[g].sources.len() == 1 => {
                groups[g].targets.insert(t);
                group_of_target.insert(t, g);
            }
            (None, Some(g)) if groups[g].targets.len() == 1 => {
                groups[g].sources.insert(s);
                group_of_source.insert(s, g);
            }
            _ => {}
        }
    }
    groups
}

fn first(set: &BTreeSet<u32>) -> u32 {
    set.iter().next().copied().unwrap_or_default()
}

fn dropped_edges(
    graph: &OverlapGraph,
    sources: &BTreeSet<u32>,
    targets: &BTreeSet<u32>,
) -> Vec<OverlapEdge> {
    graph
        .edges
        .iter()
        .filter(|e| sources.contains(&e.source) != targets.contains(&e.target))
        .cloned()
        .collect()
}

fn orphan(graph: &OverlapGraph, row: CorrespondenceRow) -> AmbiguousMatch {
    let sources: BTreeSet<u32> = row.sources().into_iter().collect();
    let targets: BTreeSet<u32> = row.targets().into_iter().collect();
    AmbiguousMatch {
        dropped: dropped_edges(graph, &sources, &targets),
        row,
        resolution: Resolution::Orphaned,
    }
}
