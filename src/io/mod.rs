pub mod input;
pub mod output;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::config::TrackConfig;
use crate::error::Result;
use crate::tracking::genet::{GenetId, RegionKey};
use crate::tracking::project::Project;
use crate::tracking::table::RowRecord;
use input::ImageInfo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableFile {
    pub source: String,
    pub target: String,
    pub rows: Vec<RowRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenetEntry {
    pub image: String,
    pub region: u32,
    pub genet: GenetId,
}

/// On-disk form of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub images: Vec<ImageInfo>,
    #[serde(default)]
    pub config: TrackConfig,
    #[serde(default)]
    pub tables: Vec<TableFile>,
    #[serde(default)]
    pub genets: Vec<GenetEntry>,
}

impl ProjectFile {
    pub fn from_project(project: &Project) -> Self {
        Self {
            images: project.images().to_vec(),
            config: project.config().clone(),
            tables: project
                .tables()
                .map(|t| TableFile {
                    source: t.key().source.clone(),
                    target: t.key().target.clone(),
                    rows: t.records(),
                })
                .collect(),
            genets: project
                .genets()
                .snapshot()
                .into_iter()
                .map(|(key, genet)| GenetEntry {
                    image: key.image,
                    region: key.region,
                    genet,
                })
                .collect(),
        }
    }

    /// Rebuilds the project. Rows keep their manual flags and genets keep
    /// their stored ids wherever the tables still support them.
    pub fn into_project(self) -> Result<Project> {
        self.config.validate()?;
        let mut project = Project::new(self.config);
        for image in self.images {
            project.add_image(ImageInfo::new(image.id, image.scale_factor, image.acquisition_date)?);
        }
        for table in &self.tables {
            project
                .table_or_create(&table.source, &table.target)?
                .load_records(&table.rows)?;
        }
        project.seed_genets(
            self.genets
                .into_iter()
                .map(|g| (RegionKey::new(g.image, g.region), g.genet)),
        );
        project.rebuild_genets();
        Ok(project)
    }
}

/// Writes the project as JSON. Inconsistent tables are saved as they are,
/// with a warning.
pub fn save_project<P: AsRef<Path>>(project: &mut Project, path: P) -> Result<()> {
    for (key, report) in project.check_consistency() {
        warn!(
            "saving inconsistent table {} ({} missing, {} duplicated)",
            key,
            report.missing.len(),
            report.duplicated.len()
        );
    }
    let writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(writer, &ProjectFile::from_project(project))?;
    info!("project saved to {:?}", path.as_ref());
    Ok(())
}

pub fn load_project<P: AsRef<Path>>(path: P) -> Result<Project> {
    let reader = BufReader::new(File::open(&path)?);
    let file: ProjectFile = serde_json::from_reader(reader)?;
    let project = file.into_project()?;
    info!(
        "project loaded from {:?}: {} images, {} tables",
        path.as_ref(),
        project.images().len(),
        project.tables().count()
    );
    Ok(project)
}
