//! Compiles declarative auditory paradigms into sample-accurate audio and TTL sequences.
//!
//! Pipeline, leaf to root: [`sampling`] → [`paradigm`] → [`pattern`] → [`generator`] →
//! [`compiler`] → [`artifact`]. The [`experiment`] module ties the stages together over an
//! ordered sequence of blocks.

pub mod artifact;
pub mod channel;
pub mod compiler;
pub mod error;
pub mod experiment;
pub mod generator;
pub mod paradigm;
pub mod pattern;
pub mod sampling;
pub mod trial;
pub mod utils;

#[cfg(feature = "python")]
pub mod python;

pub use artifact::*;
pub use channel::*;
pub use compiler::*;
pub use error::*;
pub use experiment::*;
pub use generator::*;
pub use paradigm::*;
pub use pattern::{build, ElementRow, ElementTable, TrialSpan};
pub use sampling::*;
pub use trial::*;
pub use utils::*;

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn expcompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<python::PyExperiment>()?;
    m.add_function(wrap_pyfunction!(python::load_manifest_json, m)?)?;
    Ok(())
}
