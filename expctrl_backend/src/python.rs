//! Python bindings (feature `python`): the engine is exposed as the `DaqEngine` class.
//!
//! Configurations cross as JSON strings and playback results come back as JSON. Engine errors
//! become `RuntimeError`.

use numpy::{IntoPyArray, PyArray1, PyArray2};
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;

use crate::config::DaqConfig;
use crate::engine::*;
use crate::error::DaqError;

pub fn to_py_err(err: DaqError) -> PyErr {
    PyRuntimeError::new_err(err.to_string())
}

#[pyclass(name = "DaqEngine")]
pub struct PyDaqEngine {
    inner: DaqEngine,
}

#[pymethods]
impl PyDaqEngine {
    #[new]
    pub fn new() -> Self {
        Self {
            inner: DaqEngine::new(),
        }
    }

    pub fn configure(&mut self, config_json: &str) -> PyResult<()> {
        let config = DaqConfig::from_json_str(config_json).map_err(to_py_err)?;
        self.inner.configure(config).map_err(to_py_err)
    }

    pub fn load_sequence(&mut self, path: &str) -> PyResult<()> {
        self.inner.load_sequence_from_path(path).map_err(to_py_err)
    }

    /// Blocks until the sequence has played; returns the playback result as JSON.
    pub fn play(&mut self, py: Python) -> PyResult<String> {
        let inner = &mut self.inner;
        let result = py.allow_threads(|| inner.play()).map_err(to_py_err)?;
        Ok(result.to_json())
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn reset(&mut self) -> PyResult<()> {
        self.inner.reset().map_err(to_py_err)
    }

    pub fn reset_device(&mut self) -> PyResult<()> {
        self.inner.reset_device().map_err(to_py_err)
    }

    /// Audio and TTL buffers of the loaded sequence.
    pub fn sequence_buffers<'py>(&self, py: Python<'py>) -> PyResult<(&'py PyArray2<f64>, &'py PyArray1<u32>)> {
        let artifact = self.inner.artifact().ok_or(DaqError::NoSequenceLoaded).map_err(to_py_err)?;
        Ok((
            artifact.audio.clone().into_pyarray(py),
            artifact.ttl.clone().into_pyarray(py),
        ))
    }

    pub fn state(&self) -> String {
        self.inner.state().to_string()
    }
}
