use anyhow::{Context, Result};
use log::info;
use std::path::Path;

use crate::config::TrackConfig;
use crate::io::input::{read_images_csv, read_regions_csv};
use crate::io::output::{write_correspondences_csv, write_genets_csv};
use crate::io::{load_project, save_project};
use crate::processing::overlap::CancelToken;
use crate::tracking::project::Project;

/// Matches every consecutive image pair of a time series and writes one
/// correspondence CSV per pair, a genet CSV and the project JSON to
/// `output_dir`.
pub fn run_tracking(
    images_path: &str,
    regions_path: &str,
    config_path: Option<&str>,
    output_dir: &str,
) -> Result<Project> {
    let config = match config_path {
        Some(path) => TrackConfig::from_file(path)
            .with_context(|| format!("failed to read configuration {}", path))?,
        None => TrackConfig::default(),
    };

    let images = read_images_csv(images_path)
        .with_context(|| format!("failed to read images from {}", images_path))?;
    let regions = read_regions_csv(regions_path)
        .with_context(|| format!("failed to read regions from {}", regions_path))?;

    let mut project = Project::new(config);
    for image in images {
        project.add_image(image);
    }
    let reports = project
        .compute_consecutive(&regions, &CancelToken::new())
        .context("matching consecutive images failed")?;
    for report in &reports {
        for ambiguity in &report.ambiguities {
            info!("{}: review {} ({:?})", report.key, ambiguity.row, ambiguity.resolution);
        }
    }

    write_outputs(&mut project, output_dir)?;
    Ok(project)
}

/// Re-matches one image pair of a saved project, keeping manual rows when
/// the project is configured to, and saves it back in place.
pub fn rematch_pair(
    project_path: &str,
    regions_path: &str,
    source: &str,
    target: &str,
    output_dir: &str,
) -> Result<Project> {
    let mut project = load_project(project_path)
        .with_context(|| format!("failed to load project {}", project_path))?;
    let regions = read_regions_csv(regions_path)
        .with_context(|| format!("failed to read regions from {}", regions_path))?;

    let empty = Vec::new();
    let source_regions = regions.get(source).unwrap_or(&empty);
    let target_regions = regions.get(target).unwrap_or(&empty);
    let report = project
        .compute_correspondences(source, target, source_regions, target_regions, &CancelToken::new())
        .with_context(|| format!("matching {} against {} failed", source, target))?;
    info!(
        "{}: {} rows, {} need review",
        report.key,
        report.rows,
        report.ambiguities.len()
    );

    save_project(&mut project, project_path)
        .with_context(|| format!("failed to save project {}", project_path))?;
    write_outputs(&mut project, output_dir)?;
    Ok(project)
}

fn write_outputs(project: &mut Project, output_dir: &str) -> Result<()> {
    let dir = Path::new(output_dir);
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", output_dir))?;

    let tolerance = project.config().table.same_area_tolerance;
    for table in project.tables() {
        let key = table.key();
        let path = dir.join(format!("{}_{}_correspondences.csv", key.source, key.target));
        write_correspondences_csv(&path, table, tolerance)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    let genets_path = dir.join("genets.csv");
    write_genets_csv(&genets_path, project.genets())
        .with_context(|| format!("failed to write {}", genets_path.display()))?;

    let project_path = dir.join("project.json");
    save_project(project, &project_path)
        .with_context(|| format!("failed to write {}", project_path.display()))?;

    info!("wrote {} tables to {}", project.tables().count(), output_dir);
    Ok(())
}
