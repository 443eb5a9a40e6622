//! Plays compiled auditory sequences on NI-DAQmx hardware or through a dry-run simulator.
//!
//! Load a [`expcompiler_backend::SequenceArtifact`] into a [`DaqEngine`], configure it with a
//! [`DaqConfig`], and [`DaqEngine::play`] it to obtain a [`PlaybackResult`].

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;
pub mod result;
pub mod worker_cmd_chan;

#[cfg(feature = "python")]
pub mod python;

pub use crate::config::*;
pub use crate::driver::*;
pub use crate::engine::*;
pub use crate::error::*;
pub use crate::result::*;
pub use crate::worker_cmd_chan::*;

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn expctrl_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<python::PyDaqEngine>()?;
    Ok(())
}
