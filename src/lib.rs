pub mod config;
pub mod entry;
pub mod error;
pub mod io;
pub mod processing;
pub mod tracking;

mod utils;

#[cfg(feature = "python")]
mod binding;

pub use config::TrackConfig;
pub use error::{Result, TrackError};
pub use io::input::{ContourPoint, ImageInfo, Region};
pub use processing::classify::{classify, AmbiguousMatch, Classification, Resolution};
pub use processing::overlap::{CancelToken, OverlapGraph, OverlapMatcher};
pub use tracking::genet::{GenetId, GenetLineageEngine, RegionKey};
pub use tracking::project::Project;
pub use tracking::table::{CorrespondenceRow, CorrespondenceTable, Side, TableKey};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// This is the module importable from Python:
///
/// ```python
/// import lineagers as lg
/// project = lg.track_time_series("images.csv", "regions.csv", output_dir="out")
/// project.genet_of("2020", 4)
/// ```
#[cfg(feature = "python")]
#[pymodule]
fn lineagers(_py: Python, m: Bound<'_, PyModule>) -> PyResult<()> {
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add_function(wrap_pyfunction!(binding::read_regions, m.clone())?)?;
    m.add_function(wrap_pyfunction!(binding::track_time_series, m.clone())?)?;

    m.add_class::<binding::classes::PyRegion>()?;
    m.add_class::<binding::classes::PyCorrespondenceRow>()?;
    m.add_class::<binding::classes::PyProject>()?;
    Ok(())
}
