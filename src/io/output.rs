use csv::Writer;
use std::io::Write;
use std::path::Path;

use crate::error::Result;
use crate::tracking::genet::GenetLineageEngine;
use crate::tracking::table::{CorrespondenceTable, Side, Trend};

fn join_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_area(area: Option<f64>) -> String {
    area.map_or(String::new(), |a| format!("{:.4}", a))
}

pub fn write_correspondences<W: Write>(
    wtr: &mut Writer<W>,
    table: &CorrespondenceTable,
    same_area_tolerance: f64,
) -> Result<()> {
    wtr.write_record([
        "source_image",
        "target_image",
        "source_ids",
        "target_ids",
        "kind",
        "manual",
        "source_area",
        "target_area",
        "trend",
    ])?;

    let key = table.key();
    for row in table.reorder() {
        let sources = row.row.sources();
        let targets = row.row.targets();
        let trend = match table.trend(&row.row, same_area_tolerance) {
            Some(Trend::Grow) => "grow",
            Some(Trend::Shrink) => "shrink",
            Some(Trend::Same) => "same",
            None => "",
        };
        wtr.write_record([
            key.source.clone(),
            key.target.clone(),
            join_ids(&sources),
            join_ids(&targets),
            row.row.kind().to_string(),
            row.manual.to_string(),
            format_area(table.total_area(Side::Source, &sources).filter(|_| !sources.is_empty())),
            format_area(table.total_area(Side::Target, &targets).filter(|_| !targets.is_empty())),
            trend.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes one correspondence table as CSV, rows in canonical order.
/// Multi-region cells list ids separated by spaces.
pub fn write_correspondences_csv<P: AsRef<Path>>(
    path: P,
    table: &CorrespondenceTable,
    same_area_tolerance: f64,
) -> Result<()> {
    let mut wtr = Writer::from_path(path)?;
    write_correspondences(&mut wtr, table, same_area_tolerance)
}

pub fn write_genets<W: Write>(wtr: &mut Writer<W>, engine: &GenetLineageEngine) -> Result<()> {
    wtr.write_record(["image_id", "region_id", "genet"])?;
    for (key, genet) in engine.snapshot() {
        wtr.write_record([key.image, key.region.to_string(), genet.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_genets_csv<P: AsRef<Path>>(path: P, engine: &GenetLineageEngine) -> Result<()> {
    let mut wtr = Writer::from_path(path)?;
    write_genets(&mut wtr, engine)
}

#[cfg(test)]
mod output_tests {
    use super::*;
    use crate::tracking::table::{CorrespondenceRow, TableKey};
    use crate::utils::test_utils::rect_region;

    fn written(f: impl FnOnce(&mut Writer<Vec<u8>>) -> Result<()>) -> Vec<String> {
        let mut wtr = Writer::from_writer(Vec::new());
        f(&mut wtr).unwrap();
        let bytes = wtr.into_inner().unwrap();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_correspondence_export() {
        let mut table = CorrespondenceTable::new(TableKey::new("2019", "2020"));
        table.from_auto_match(vec![
            CorrespondenceRow::Birth { target: 9 },
            CorrespondenceRow::Fuse {
                sources: [1, 2].into_iter().collect(),
                target: 4,
            },
        ]);
        table.refresh_areas(
            Side::Source,
            &[rect_region(1, 0.0, 0.0, 1.0, 1.0), rect_region(2, 0.0, 0.0, 1.0, 1.0)],
        );
        table.refresh_areas(Side::Target, &[rect_region(4, 0.0, 0.0, 3.0, 1.0)]);

        let lines = written(|w| write_correspondences(w, &table, 0.0));
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "source_image,target_image,source_ids,target_ids,kind,manual,source_area,target_area,trend"
        );
        assert_eq!(lines[1], "2019,2020,1 2,4,fuse,false,2.0000,3.0000,grow");
        assert_eq!(lines[2], "2019,2020,,9,birth,false,,,");
    }

    #[test]
    fn test_genet_export() {
        let mut table = CorrespondenceTable::new(TableKey::new("A", "B"));
        table.from_auto_match(vec![CorrespondenceRow::Persist { source: 1, target: 2 }]);
        let mut engine = GenetLineageEngine::new();
        engine.rebuild_from([&table]);

        let lines = written(|w| write_genets(w, &engine));
        assert_eq!(lines, vec!["image_id,region_id,genet", "A,1,1", "B,2,1"]);
    }
}
