pub mod classes;

use classes::{PyProject, PyRegion};
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use std::collections::HashMap;

use crate::entry::run_tracking;
use crate::io::input::read_regions_csv;

/// Reads region outlines from a CSV file.
///
/// CSV format:
///
/// .. code-block:: text
///
///    image_id, region_id, class_name, x, y
///    2019, 1, Acropora, 10.5, 20.0
///    ...
///
/// Returns:
///
/// A dict mapping image ids to lists of ``PyRegion``.
#[pyfunction]
pub fn read_regions(path: &str) -> PyResult<HashMap<String, Vec<PyRegion>>> {
    let regions = read_regions_csv(path).map_err(|e| PyRuntimeError::new_err(format!("{:#}", e)))?;
    Ok(regions
        .into_iter()
        .map(|(image, list)| (image, list.iter().map(PyRegion::from).collect()))
        .collect())
}

/// Tracks every consecutive image pair of a time series.
///
/// Arguments:
///
/// - ``images_path`` – CSV with ``image_id, scale_factor, acquisition_date``
/// - ``regions_path`` – CSV with ``image_id, region_id, class_name, x, y``
/// - ``config_path`` (default: None) – TOML configuration
/// - ``output_dir`` (default: "output") – correspondence CSVs, genets and project JSON
///
/// Example:
///
/// .. code-block:: python
///
///    import lineagers as lg
///    project = lg.track_time_series("images.csv", "regions.csv")
///    project.rows("2019", "2020")
#[pyfunction]
#[pyo3(signature = (images_path, regions_path, config_path = None, output_dir = "output"))]
pub fn track_time_series(
    images_path: &str,
    regions_path: &str,
    config_path: Option<&str>,
    output_dir: &str,
) -> PyResult<PyProject> {
    let project = run_tracking(images_path, regions_path, config_path, output_dir)
        .map_err(|e| PyRuntimeError::new_err(format!("{:#}", e)))?;
    Ok(PyProject { inner: project })
}
