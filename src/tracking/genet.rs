use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use crate::error::{Result, TrackError};
use crate::io::input::Region;
use crate::tracking::table::{CorrespondenceTable, Side, TableKey};
use crate::tracking::union_find::UnionFind;

/// Lineage identifier shared by every region descending from the same
/// physical individual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenetId(pub u32);

impl fmt::Display for GenetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A region addressed across the whole time series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionKey {
    pub image: String,
    pub region: u32,
}

impl RegionKey {
    pub fn new(image: impl Into<String>, region: u32) -> Self {
        Self {
            image: image.into(),
            region,
        }
    }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.image, self.region)
    }
}

/// What one table contributes to the lineage graph.
#[derive(Debug, Clone, Default, PartialEq)]
struct TableLinks {
    nodes: BTreeSet<RegionKey>,
    edges: Vec<(RegionKey, RegionKey)>,
}

impl TableLinks {
    fn from_table(table: &CorrespondenceTable) -> Self {
        let key = table.key();
        let mut links = TableLinks::default();
        for side in [Side::Source, Side::Target] {
            for &id in table.known(side) {
                links.nodes.insert(RegionKey::new(key.image(side), id));
            }
        }

        for row in table.rows() {
            let members: Vec<RegionKey> = row
                .row
                .sources()
                .into_iter()
                .map(|id| RegionKey::new(&key.source, id))
                .chain(
                    row.row
                        .targets()
                        .into_iter()
                        .map(|id| RegionKey::new(&key.target, id)),
                )
                .collect();
            links.nodes.extend(members.iter().cloned());

            if row.row.is_link() {
                if let Some((hub, rest)) = members.split_first() {
                    links
                        .edges
                        .extend(rest.iter().map(|m| (hub.clone(), m.clone())));
                }
            }
        }
        links
    }
}

/// Keeps one genet per observed region, consistent with the union of all
/// correspondence tables.
///
/// Persist, split and fuse rows connect their members; births and deaths
/// only make a region observed. Identifiers are reused across recomputation:
/// a component takes the smallest previous genet of its members that no
/// other component has claimed, and only falls back to a fresh id.
#[derive(Debug, Clone, PartialEq)]
pub struct GenetLineageEngine {
    links: BTreeMap<TableKey, TableLinks>,
    /// Undirected adjacency, with the number of tables contributing each edge.
    adjacency: BTreeMap<RegionKey, BTreeMap<RegionKey, usize>>,
    /// Number of tables observing each region.
    observed: BTreeMap<RegionKey, usize>,
    genets: BTreeMap<RegionKey, GenetId>,
    members: BTreeMap<GenetId, BTreeSet<RegionKey>>,
    next_id: u32,
}

impl Default for GenetLineageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GenetLineageEngine {
    pub fn new() -> Self {
        Self {
            links: BTreeMap::new(),
            adjacency: BTreeMap::new(),
            observed: BTreeMap::new(),
            genets: BTreeMap::new(),
            members: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Installs genets known from an earlier session. They are only used as
    /// the "previous" ids of the next `rebuild_from`.
    pub fn seed_previous(&mut self, entries: impl IntoIterator<Item = (RegionKey, GenetId)>) {
        for (key, genet) in entries {
            self.next_id = self.next_id.max(genet.0.saturating_add(1));
            self.set_genet(key, genet);
        }
    }

    /// Recomputes every genet from scratch.
    pub fn rebuild_from<'a>(&mut self, tables: impl IntoIterator<Item = &'a CorrespondenceTable>) {
        let previous = std::mem::take(&mut self.genets);
        self.members.clear();
        self.links.clear();
        self.adjacency.clear();
        self.observed.clear();

        for table in tables {
            self.insert_links(table.key().clone(), TableLinks::from_table(table));
        }

        let nodes: Vec<RegionKey> = self.observed.keys().cloned().collect();
        let index: BTreeMap<&RegionKey, usize> =
            nodes.iter().enumerate().map(|(i, k)| (k, i)).collect();
        let mut uf = UnionFind::new(nodes.len());
        for (a, neighbours) in &self.adjacency {
            for b in neighbours.keys() {
                if let (Some(&i), Some(&j)) = (index.get(a), index.get(b)) {
                    uf.union(i, j);
                }
            }
        }

        let components: Vec<Vec<RegionKey>> = uf
            .groups()
            .into_iter()
            .map(|group| group.into_iter().map(|i| nodes[i].clone()).collect())
            .collect();

        let mut claimed = BTreeSet::new();
        self.assign(components, &previous, &mut claimed);
        debug!(
            "rebuilt {} genets over {} regions from {} tables",
            self.members.len(),
            self.genets.len(),
            self.links.len()
        );
    }

    /// Replaces the links of one table and recomputes the components they
    /// reach, before or after the change. Other genets are untouched.
    pub fn update_incremental(&mut self, table: &CorrespondenceTable) {
        self.relink(table.key().clone(), Some(TableLinks::from_table(table)));
    }

    /// Drops the links of a table, e.g. when one of its images is deleted.
    pub fn forget_table(&mut self, key: &TableKey) {
        self.relink(key.clone(), None);
    }

    fn relink(&mut self, key: TableKey, links: Option<TableLinks>) {
        let mut seeds: BTreeSet<RegionKey> = BTreeSet::new();
        if let Some(old) = self.remove_links(&key) {
            seeds.extend(old.nodes);
        }
        if let Some(new) = links {
            seeds.extend(new.nodes.iter().cloned());
            self.insert_links(key, new);
        }

        let components = self.components_reaching(&seeds);
        let mut previous = BTreeMap::new();
        for member in seeds.iter().chain(components.iter().flatten()) {
            if let Some(genet) = self.clear_genet(member) {
                previous.insert(member.clone(), genet);
            }
        }

        let mut claimed: BTreeSet<GenetId> = self.members.keys().copied().collect();
        debug!(
            "recomputing {} components around {} touched regions",
            components.len(),
            seeds.len()
        );
        self.assign(components, &previous, &mut claimed);
    }

    /// Gives a region a new id within its image. Its genet, links and
    /// observation counts move along, so the next `update_incremental` of
    /// the renamed tables keeps every id.
    pub fn rename(&mut self, image: &str, old_id: u32, new_id: u32) {
        if old_id == new_id {
            return;
        }
        let old = RegionKey::new(image, old_id);
        let new = RegionKey::new(image, new_id);
        let relabel = |key: &RegionKey| if *key == old { new.clone() } else { key.clone() };

        for links in self.links.values_mut() {
            if links.nodes.remove(&old) {
                links.nodes.insert(new.clone());
            }
            for (a, b) in links.edges.iter_mut() {
                *a = relabel(a);
                *b = relabel(b);
            }
        }

        let adjacency = std::mem::take(&mut self.adjacency);
        for (a, neighbours) in adjacency {
            let entry = self.adjacency.entry(relabel(&a)).or_default();
            for (b, count) in neighbours {
                *entry.entry(relabel(&b)).or_default() += count;
            }
        }

        if let Some(count) = self.observed.remove(&old) {
            *self.observed.entry(new.clone()).or_default() += count;
        }
        if let Some(genet) = self.clear_genet(&old) {
            debug!("{} renamed to {}, keeps genet {}", old, new, genet);
            self.set_genet(new, genet);
        }
    }

    /// Connected components containing a seed, each sorted, ordered by their
    /// smallest member. Seeds no longer observed are skipped.
    fn components_reaching(&self, seeds: &BTreeSet<RegionKey>) -> Vec<Vec<RegionKey>> {
        let mut visited: BTreeSet<&RegionKey> = BTreeSet::new();
        let mut components = Vec::new();

        for seed in seeds {
            let Some((start, _)) = self.observed.get_key_value(seed) else {
                continue;
            };
            if !visited.insert(start) {
                continue;
            }

            let mut component = vec![start.clone()];
            let mut queue = VecDeque::from([start]);
            while let Some(node) = queue.pop_front() {
                for next in self.adjacency.get(node).into_iter().flat_map(|n| n.keys()) {
                    if visited.insert(next) {
                        component.push(next.clone());
                        queue.push_back(next);
                    }
                }
            }
            component.sort();
            components.push(component);
        }

        components.sort();
        components
    }

    fn assign(
        &mut self,
        components: Vec<Vec<RegionKey>>,
        previous: &BTreeMap<RegionKey, GenetId>,
        claimed: &mut BTreeSet<GenetId>,
    ) {
        for component in components {
            let reused = component
                .iter()
                .filter_map(|m| previous.get(m))
                .filter(|g| !claimed.contains(g))
                .min()
                .copied();
            let genet = match reused {
                Some(genet) => genet,
                None => self.fresh_id(),
            };
            claimed.insert(genet);
            for member in component {
                self.set_genet(member, genet);
            }
        }
    }

    fn fresh_id(&mut self) -> GenetId {
        let id = GenetId(self.next_id);
        self.next_id += 1;
        id
    }

    fn set_genet(&mut self, key: RegionKey, genet: GenetId) {
        self.clear_genet(&key);
        self.members.entry(genet).or_default().insert(key.clone());
        self.genets.insert(key, genet);
    }

    fn clear_genet(&mut self, key: &RegionKey) -> Option<GenetId> {
        let genet = self.genets.remove(key)?;
        if let Some(members) = self.members.get_mut(&genet) {
            members.remove(key);
            if members.is_empty() {
                self.members.remove(&genet);
            }
        }
        Some(genet)
    }

    fn insert_links(&mut self, key: TableKey, links: TableLinks) {
        for node in &links.nodes {
            *self.observed.entry(node.clone()).or_default() += 1;
        }
        for (a, b) in &links.edges {
            *self
                .adjacency
                .entry(a.clone())
                .or_default()
                .entry(b.clone())
                .or_default() += 1;
            *self
                .adjacency
                .entry(b.clone())
                .or_default()
                .entry(a.clone())
                .or_default() += 1;
        }
        self.links.insert(key, links);
    }

    fn remove_links(&mut self, key: &TableKey) -> Option<TableLinks> {
        let links = self.links.remove(key)?;
        for node in &links.nodes {
            if let Some(count) = self.observed.get_mut(node) {
                *count -= 1;
                if *count == 0 {
                    self.observed.remove(node);
                }
            }
        }
        for (a, b) in &links.edges {
            self.unlink(a, b);
            self.unlink(b, a);
        }
        Some(links)
    }

    fn unlink(&mut self, from: &RegionKey, to: &RegionKey) {
        if let Some(neighbours) = self.adjacency.get_mut(from) {
            if let Some(count) = neighbours.get_mut(to) {
                *count -= 1;
                if *count == 0 {
                    neighbours.remove(to);
                }
            }
            if neighbours.is_empty() {
                self.adjacency.remove(from);
            }
        }
    }

    pub fn genet_of(&self, image: &str, region: u32) -> Result<GenetId> {
        self.genets
            .get(&RegionKey::new(image, region))
            .copied()
            .ok_or_else(|| TrackError::NotFound {
                image: image.to_string(),
                region,
            })
    }

    /// Writes the lineage slot of each region; unobserved regions get `None`.
    pub fn assign_to(&self, image: &str, regions: &mut [Region]) {
        for region in regions.iter_mut() {
            region.genet = self.genets.get(&RegionKey::new(image, region.id)).copied();
        }
    }

    pub fn snapshot(&self) -> BTreeMap<RegionKey, GenetId> {
        self.genets.clone()
    }

    pub fn members(&self, genet: GenetId) -> Vec<RegionKey> {
        self.members
            .get(&genet)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn genet_count(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod genet_tests {
    use super::*;
    use crate::tracking::table::CorrespondenceRow;
    use crate::utils::test_utils::rect_region;

    fn table(source: &str, target: &str, rows: Vec<CorrespondenceRow>) -> CorrespondenceTable {
        let mut t = CorrespondenceTable::new(TableKey::new(source, target));
        t.from_auto_match(rows);
        t
    }

    fn persist(source: u32, target: u32) -> CorrespondenceRow {
        CorrespondenceRow::Persist { source, target }
    }

    #[test]
    fn test_fuse_shares_one_genet() {
        let t = table(
            "A",
            "B",
            vec![CorrespondenceRow::Fuse {
                sources: [1, 2].into_iter().collect(),
                target: 1,
            }],
        );
        let mut engine = GenetLineageEngine::new();
        engine.rebuild_from([&t]);

        let g = engine.genet_of("B", 1).unwrap();
        assert_eq!(engine.genet_of("A", 1).unwrap(), g);
        assert_eq!(engine.genet_of("A", 2).unwrap(), g);
        assert_eq!(engine.members(g).len(), 3);
    }

    #[test]
    fn test_birth_and_death_get_their_own_genet() {
        let t = table(
            "A",
            "B",
            vec![
                persist(1, 1),
                CorrespondenceRow::Death { source: 2 },
                CorrespondenceRow::Birth { target: 2 },
            ],
        );
        let mut engine = GenetLineageEngine::new();
        engine.rebuild_from([&t]);

        let a1 = engine.genet_of("A", 1).unwrap();
        let a2 = engine.genet_of("A", 2).unwrap();
        let b2 = engine.genet_of("B", 2).unwrap();
        assert_eq!(engine.genet_of("B", 1).unwrap(), a1);
        assert_ne!(a2, b2);
        assert_ne!(a1, a2);
        assert_eq!(engine.genet_count(), 3);
    }

    #[test]
    fn test_chain_across_three_images() {
        let ab = table("A", "B", vec![persist(4, 7)]);
        let bc = table(
            "B",
            "C",
            vec![CorrespondenceRow::Split {
                source: 7,
                targets: [1, 2].into_iter().collect(),
            }],
        );
        let mut engine = GenetLineageEngine::new();
        engine.rebuild_from([&ab, &bc]);

        let g = engine.genet_of("A", 4).unwrap();
        for (image, id) in [("B", 7), ("C", 1), ("C", 2)] {
            assert_eq!(engine.genet_of(image, id).unwrap(), g);
        }
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let ab = table("A", "B", vec![persist(1, 1), persist(2, 3)]);
        let mut engine = GenetLineageEngine::new();
        engine.rebuild_from([&ab]);
        let first = engine.snapshot();
        engine.rebuild_from([&ab]);
        assert_eq!(engine.snapshot(), first);
    }

    #[test]
    fn test_unknown_region_is_not_found() {
        let mut engine = GenetLineageEngine::new();
        engine.rebuild_from([&table("A", "B", vec![persist(1, 1)])]);
        let err = engine.genet_of("A", 99).unwrap_err();
        assert!(matches!(err, TrackError::NotFound { region: 99, .. }));
        assert!(engine.genet_of("Z", 1).is_err());
    }

    #[test]
    fn test_incremental_matches_full_rebuild() {
        let ab = table("A", "B", vec![persist(1, 1), persist(2, 2)]);
        let bc = table("B", "C", vec![persist(1, 1), persist(2, 2)]);
        let mut incremental = GenetLineageEngine::new();
        incremental.rebuild_from([&ab, &bc]);
        let mut full = incremental.clone();

        let fused = table(
            "A",
            "B",
            vec![
                CorrespondenceRow::Fuse {
                    sources: [1, 2].into_iter().collect(),
                    target: 1,
                },
                CorrespondenceRow::Birth { target: 2 },
            ],
        );
        incremental.update_incremental(&fused);
        full.rebuild_from([&fused, &bc]);

        assert_eq!(incremental.snapshot(), full.snapshot());
        assert_eq!(
            incremental.genet_of("A", 2).unwrap(),
            incremental.genet_of("C", 1).unwrap()
        );
    }

    #[test]
    fn test_ids_survive_a_split_of_the_lineage() {
        let ab = table("A", "B", vec![persist(1, 1), persist(2, 2)]);
        let mut engine = GenetLineageEngine::new();
        engine.rebuild_from([&ab]);
        let g1 = engine.genet_of("A", 1).unwrap();
        let g2 = engine.genet_of("A", 2).unwrap();

        let mut edited = ab.clone();
        edited.remove_region(Side::Target, 1);
        engine.update_incremental(&edited);

        // A1 lost its partner but keeps its id; B1 is no longer observed
        assert_eq!(engine.genet_of("A", 1).unwrap(), g1);
        assert_eq!(engine.genet_of("B", 2).unwrap(), g2);
        assert!(engine.genet_of("B", 1).is_err());
    }

    #[test]
    fn test_forget_table_drops_unobserved_regions() {
        let ab = table("A", "B", vec![persist(1, 1)]);
        let bc = table("B", "C", vec![persist(1, 5)]);
        let mut engine = GenetLineageEngine::new();
        engine.rebuild_from([&ab, &bc]);
        let g = engine.genet_of("B", 1).unwrap();

        engine.forget_table(ab.key());
        assert!(engine.genet_of("A", 1).is_err());
        assert_eq!(engine.genet_of("B", 1).unwrap(), g);
        assert_eq!(engine.genet_of("C", 5).unwrap(), g);
    }

    #[test]
    fn test_seeded_ids_are_reused() {
        let ab = table("A", "B", vec![persist(1, 1)]);
        let mut engine = GenetLineageEngine::new();
        engine.seed_previous([(RegionKey::new("B", 1), GenetId(42))]);
        engine.rebuild_from([&ab]);
        assert_eq!(engine.genet_of("A", 1).unwrap(), GenetId(42));

        engine.update_incremental(&table(
            "A",
            "B",
            vec![persist(1, 1), CorrespondenceRow::Birth { target: 2 }],
        ));
        assert_eq!(engine.genet_of("B", 2).unwrap(), GenetId(43));
    }

    #[test]
    fn test_rename_keeps_genets_of_linked_and_unlinked_regions() {
        let ab = table(
            "A",
            "B",
            vec![persist(1, 1), CorrespondenceRow::Birth { target: 7 }],
        );
        let bc = table("B", "C", vec![persist(1, 3), CorrespondenceRow::Death { source: 7 }]);
        let mut engine = GenetLineageEngine::new();
        engine.rebuild_from([&ab, &bc]);
        let linked = engine.genet_of("B", 1).unwrap();
        let born = engine.genet_of("B", 7).unwrap();

        let mut ab2 = ab.clone();
        let mut bc2 = bc.clone();
        for (old, new) in [(1, 11), (7, 17)] {
            let region = rect_region(new, 0.0, 0.0, 1.0, 1.0);
            ab2.update_region(Side::Target, old, &region).unwrap();
            bc2.update_region(Side::Source, old, &region).unwrap();
            engine.rename("B", old, new);
        }
        engine.update_incremental(&ab2);
        engine.update_incremental(&bc2);

        assert_eq!(engine.genet_of("B", 11).unwrap(), linked);
        assert_eq!(engine.genet_of("C", 3).unwrap(), linked);
        assert_eq!(engine.genet_of("B", 17).unwrap(), born);
        assert!(engine.genet_of("B", 7).is_err());
        assert_eq!(engine.genet_count(), 2);

        let mut full = GenetLineageEngine::new();
        full.rebuild_from([&ab2, &bc2]);
        assert_eq!(full.members(GenetId(1)).len(), engine.members(linked).len());
    }

    #[test]
    fn test_assign_to_writes_lineage_slots() {
        let mut engine = GenetLineageEngine::new();
        engine.rebuild_from([&table("A", "B", vec![persist(3, 1)])]);
        let mut regions = vec![rect_region(3, 0.0, 0.0, 1.0, 1.0), rect_region(8, 0.0, 0.0, 1.0, 1.0)];
        engine.assign_to("A", &mut regions);
        assert_eq!(regions[0].genet, Some(engine.genet_of("B", 1).unwrap()));
        assert_eq!(regions[1].genet, None);
    }
}
