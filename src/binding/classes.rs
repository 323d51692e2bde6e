use chrono::NaiveDate;
use pyo3::exceptions::{PyKeyError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::config::TrackConfig;
use crate::error::TrackError;
use crate::io::input::{ContourPoint, ImageInfo, Region};
use crate::io::{load_project, save_project};
use crate::processing::overlap::CancelToken;
use crate::tracking::project::Project;
use crate::tracking::table::{Side, TableRow};

pub(crate) fn to_py_err(err: TrackError) -> PyErr {
    match err {
        TrackError::NotFound { .. } | TrackError::UnknownImage(_) => PyKeyError::new_err(err.to_string()),
        TrackError::InvalidScaleFactor(_)
        | TrackError::AmbiguousMatch { .. }
        | TrackError::DuplicateRegion { .. }
        | TrackError::InvalidRow(_)
        | TrackError::Config(_) => PyValueError::new_err(err.to_string()),
        _ => PyRuntimeError::new_err(err.to_string()),
    }
}

fn parse_side(side: &str) -> PyResult<Side> {
    match side {
        "source" => Ok(Side::Source),
        "target" => Ok(Side::Target),
        other => Err(PyValueError::new_err(format!(
            "side must be 'source' or 'target', got '{}'",
            other
        ))),
    }
}

/// Python representation of a segmented region
///
/// Attributes:
///     id (int): Region id, unique within its image
///     contour (list[tuple[float, float]]): Outline in pixels
///     class_name (str): Taxonomic class
///     area (float): Area in pixels², derived from the contour
///     genet (int | None): Lineage id, once computed
///
/// Example:
///     >>> region = PyRegion(1, [(0, 0), (4, 0), (4, 3)], "Acropora")
#[pyclass]
#[derive(Debug, Clone)]
pub struct PyRegion {
    #[pyo3(get, set)]
    pub id: u32,
    #[pyo3(get, set)]
    pub contour: Vec<(f64, f64)>,
    #[pyo3(get, set)]
    pub class_name: String,
    #[pyo3(get)]
    pub area: f64,
    #[pyo3(get)]
    pub genet: Option<u32>,
}

#[pymethods]
impl PyRegion {
    #[new]
    fn new(id: u32, contour: Vec<(f64, f64)>, class_name: String) -> Self {
        let region = Region::from_contour(
            id,
            contour.iter().copied().map(ContourPoint::from).collect(),
            class_name,
        );
        (&region).into()
    }

    fn __repr__(&self) -> String {
        format!(
            "Region(id={}, class={}, points={}, area={:.2}, genet={:?})",
            self.id,
            self.class_name,
            self.contour.len(),
            self.area,
            self.genet
        )
    }
}

impl From<&Region> for PyRegion {
    fn from(region: &Region) -> Self {
        Self {
            id: region.id,
            contour: region.contour.iter().map(|p| (p.x, p.y)).collect(),
            class_name: region.class_name.clone(),
            area: region.area,
            genet: region.genet.map(|g| g.0),
        }
    }
}

impl From<&PyRegion> for Region {
    fn from(region: &PyRegion) -> Self {
        Region::from_contour(
            region.id,
            region.contour.iter().copied().map(ContourPoint::from).collect(),
            region.class_name.clone(),
        )
    }
}

/// One transition event of a correspondence table
///
/// Attributes:
///     sources (list[int]): Region ids in the earlier image
///     targets (list[int]): Region ids in the later image
///     kind (str): persist, split, fuse, death or birth
///     manual (bool): Entered by hand
#[pyclass]
#[derive(Debug, Clone)]
pub struct PyCorrespondenceRow {
    #[pyo3(get)]
    pub sources: Vec<u32>,
    #[pyo3(get)]
    pub targets: Vec<u32>,
    #[pyo3(get)]
    pub kind: String,
    #[pyo3(get)]
    pub manual: bool,
}

#[pymethods]
impl PyCorrespondenceRow {
    fn __repr__(&self) -> String {
        format!(
            "Row({}, sources={:?}, targets={:?}, manual={})",
            self.kind, self.sources, self.targets, self.manual
        )
    }
}

impl From<&TableRow> for PyCorrespondenceRow {
    fn from(row: &TableRow) -> Self {
        Self {
            sources: row.row.sources(),
            targets: row.row.targets(),
            kind: row.row.kind().to_string(),
            manual: row.manual,
        }
    }
}

/// A tracking project: images, correspondence tables and genets
///
/// Example:
///     >>> project = PyProject()
///     >>> project.add_image("2019", 0.5, "2019-06-01")
///     >>> project.add_image("2020", 0.5, "2020-06-01")
///     >>> rows = project.compute_correspondences("2019", "2020", regions_2019, regions_2020)
#[pyclass]
pub struct PyProject {
    pub inner: Project,
}

#[pymethods]
impl PyProject {
    #[new]
    #[pyo3(signature = (config_path = None))]
    fn new(config_path: Option<&str>) -> PyResult<Self> {
        let config = match config_path {
            Some(path) => TrackConfig::from_file(path).map_err(to_py_err)?,
            None => TrackConfig::default(),
        };
        Ok(Self {
            inner: Project::new(config),
        })
    }

    #[staticmethod]
    fn load(path: &str) -> PyResult<Self> {
        Ok(Self {
            inner: load_project(path).map_err(to_py_err)?,
        })
    }

    fn save(&mut self, path: &str) -> PyResult<()> {
        save_project(&mut self.inner, path).map_err(to_py_err)
    }

    /// Adds an image; `acquisition_date` as ``YYYY-MM-DD``.
    fn add_image(&mut self, id: &str, scale_factor: f64, acquisition_date: &str) -> PyResult<()> {
        let date = NaiveDate::parse_from_str(acquisition_date, "%Y-%m-%d")
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        let image = ImageInfo::new(id, scale_factor, date).map_err(to_py_err)?;
        self.inner.add_image(image);
        Ok(())
    }

    fn remove_image(&mut self, id: &str) -> PyResult<()> {
        self.inner.remove_image(id).map(|_| ()).map_err(to_py_err)
    }

    fn image_ids(&self) -> Vec<String> {
        self.inner.images().iter().map(|i| i.id.clone()).collect()
    }

    fn compute_correspondences(
        &mut self,
        source: &str,
        target: &str,
        source_regions: Vec<PyRegion>,
        target_regions: Vec<PyRegion>,
    ) -> PyResult<Vec<PyCorrespondenceRow>> {
        let sources: Vec<Region> = source_regions.iter().map(Region::from).collect();
        let targets: Vec<Region> = target_regions.iter().map(Region::from).collect();
        self.inner
            .compute_correspondences(source, target, &sources, &targets, &CancelToken::new())
            .map_err(to_py_err)?;
        self.rows(source, target)
    }

    fn add_correspondence(
        &mut self,
        source: &str,
        target: &str,
        sources: Vec<u32>,
        targets: Vec<u32>,
    ) -> PyResult<()> {
        self.inner
            .add_correspondence(source, target, &sources, &targets)
            .map_err(to_py_err)
    }

    fn add_region(&mut self, image: &str, region: PyRegion) -> PyResult<()> {
        self.inner
            .add_region(image, &Region::from(&region))
            .map_err(to_py_err)
    }

    fn remove_region(&mut self, image: &str, id: u32) -> PyResult<bool> {
        self.inner.remove_region(image, id).map_err(to_py_err)
    }

    fn update_region(&mut self, image: &str, old_id: u32, region: PyRegion) -> PyResult<()> {
        self.inner
            .update_region(image, old_id, &Region::from(&region))
            .map_err(to_py_err)
    }

    /// Rows of a table in canonical order; empty if the pair was never matched.
    fn rows(&self, source: &str, target: &str) -> PyResult<Vec<PyCorrespondenceRow>> {
        Ok(self
            .inner
            .table(source, target)
            .map(|t| t.reorder().iter().map(PyCorrespondenceRow::from).collect())
            .unwrap_or_default())
    }

    /// Row containing a region, as seen from `side` ("source" or "target").
    fn row_of(&self, source: &str, target: &str, side: &str, id: u32) -> PyResult<Option<PyCorrespondenceRow>> {
        let side = parse_side(side)?;
        Ok(self
            .inner
            .table(source, target)
            .and_then(|t| t.row_of(side, id))
            .map(PyCorrespondenceRow::from))
    }

    fn genet_of(&self, image: &str, id: u32) -> PyResult<u32> {
        self.inner.genet_of(image, id).map(|g| g.0).map_err(to_py_err)
    }

    /// Returns `regions` with their genet filled in.
    fn assign_genets(&self, image: &str, regions: Vec<PyRegion>) -> Vec<PyRegion> {
        let mut plain: Vec<Region> = regions.iter().map(Region::from).collect();
        self.inner.genets().assign_to(image, &mut plain);
        plain.iter().map(PyRegion::from).collect()
    }

    /// Keys of the inconsistent tables, as "source-target".
    fn check_consistency(&mut self) -> Vec<String> {
        self.inner
            .check_consistency()
            .into_iter()
            .map(|(key, _)| key.to_string())
            .collect()
    }

    fn rebuild_genets(&mut self) {
        self.inner.rebuild_genets();
    }

    fn __repr__(&self) -> String {
        format!(
            "Project(images={}, tables={}, genets={})",
            self.inner.images().len(),
            self.inner.tables().count(),
            self.inner.genets().genet_count()
        )
    }
}
