//! Python bindings (feature `python`).
//!
//! Python receives the [`Experiment`] as the `Experiment` class. Configurations cross the
//! boundary as JSON strings and buffers as numpy arrays; compiler errors become `ValueError`.

use numpy::{IntoPyArray, PyArray1, PyArray2};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::artifact::SequenceArtifact;
use crate::error::CompilerError;
use crate::experiment::*;
use crate::generator::StimulusDef;
use crate::paradigm::ParadigmConfig;

pub fn to_py_err(err: CompilerError) -> PyErr {
    PyValueError::new_err(err.to_string())
}

#[pyclass(name = "Experiment")]
pub struct PyExperiment {
    pub inner: Experiment,
}

#[pymethods]
impl PyExperiment {
    #[new]
    pub fn new(master_seed: u64, fs_hz: f64) -> Self {
        Self {
            inner: Experiment::new(master_seed, fs_hz),
        }
    }

    #[staticmethod]
    pub fn from_json(json: &str) -> PyResult<Self> {
        Ok(Self {
            inner: Experiment::from_json_str(json).map_err(to_py_err)?,
        })
    }

    pub fn add_stimulus(&mut self, name: &str, stimulus_json: &str) -> PyResult<()> {
        let def: StimulusDef = serde_json::from_str(stimulus_json)
            .map_err(|e| to_py_err(CompilerError::parse(name, e)))?;
        self.inner.add_stimulus(name, def);
        Ok(())
    }

    #[pyo3(signature = (paradigm_json, n_trials, gap_ms=0.))]
    pub fn add_block(&mut self, paradigm_json: &str, n_trials: usize, gap_ms: f64) -> PyResult<()> {
        let paradigm = ParadigmConfig::from_json_str(paradigm_json).map_err(to_py_err)?;
        self.inner.add_block(BlockSpec::new(paradigm, n_trials).with_gap_ms(gap_ms));
        Ok(())
    }

    pub fn n_blocks(&self) -> usize {
        self.inner.n_blocks()
    }

    pub fn validate(&self) -> PyResult<()> {
        self.inner.validate().map_err(to_py_err)
    }

    /// Trial plans of every block, as a JSON string.
    pub fn trial_plans_json(&self) -> PyResult<String> {
        let plans = self.inner.trial_plans().map_err(to_py_err)?;
        serde_json::to_string(&plans).map_err(|e| PyValueError::new_err(e.to_string()))
    }

    /// Compiles and writes the artifact container to `path`; returns the audio hash.
    pub fn compile_to(&self, path: &str) -> PyResult<String> {
        let artifact = self.inner.compile().map_err(to_py_err)?;
        artifact.save(path).map_err(to_py_err)?;
        Ok(artifact.manifest.audio_hash)
    }

    /// Compiles and returns `(audio, ttl)` as numpy arrays.
    pub fn compile_buffers<'py>(&self, py: Python<'py>) -> PyResult<(&'py PyArray2<f64>, &'py PyArray1<u32>)> {
        let SequenceArtifact { audio, ttl, .. } = self.inner.compile().map_err(to_py_err)?;
        Ok((audio.into_pyarray(py), ttl.into_pyarray(py)))
    }
}

/// Reads an artifact container and returns its manifest as a JSON string.
#[pyfunction]
pub fn load_manifest_json(path: &str) -> PyResult<String> {
    let artifact = SequenceArtifact::load(path).map_err(to_py_err)?;
    serde_json::to_string(&artifact.manifest).map_err(|e| PyValueError::new_err(e.to_string()))
}
