//! The compiled, playback-ready sequence and its on-disk container.
//!
//! ## Container layout
//!
//! ```text
//! +----------------+---------------------------------------------+
//! | b"EXPSEQ01"    | bincode(SequenceArtifact)                   |
//! +----------------+---------------------------------------------+
//! ```
//!
//! The payload holds the audio and TTL buffers, the events, trial and element tables and the
//! manifest. [`SequenceArtifact::load`] recomputes the audio hash and refuses a container whose
//! buffer no longer matches its manifest, so a successful load reproduces byte-identical buffers
//! and the same hash.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::*;
use crate::pattern::ElementTable;
use crate::utils::*;

pub const CONTAINER_MAGIC: &[u8; 8] = b"EXPSEQ01";
pub const ARTIFACT_VERSION: &str = "1.0";

/// One scheduled element as it lands in the buffers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub sample_index: usize,
    pub time_ms: f64,
    pub block_index: usize,
    pub trial_index: usize,
    pub element_index: usize,
    pub stimulus_ref: String,
    pub code: Option<u32>,
    pub is_omission: bool,
    /// Hash of the generated block, `None` for omissions.
    pub stimulus_hash: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialRow {
    pub block_index: usize,
    pub trial_index: usize,
    pub label: String,
    pub code: Option<u32>,
    pub start_sample: usize,
    pub end_sample: usize,
    pub start_ms: f64,
    pub end_ms: f64,
    pub n_elements: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub fs_hz: f64,
    pub n_channels: usize,
    pub n_trials: usize,
    pub n_elements: usize,
    pub duration_samples: usize,
    pub duration_ms: f64,
    pub compiled_at: DateTime<Utc>,
    pub audio_hash: String,
    pub ttl_hash: String,
    pub ttl_pulse_samples: usize,
    pub master_seed: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceArtifact {
    /// `samples × channels`
    pub audio: Array2<f64>,
    pub ttl: Array1<u32>,
    pub events: Vec<EventRow>,
    pub trial_table: Vec<TrialRow>,
    pub element_table: ElementTable,
    pub manifest: Manifest,
}

impl SequenceArtifact {
    pub fn fs_hz(&self) -> f64 {
        self.manifest.fs_hz
    }

    pub fn n_samples(&self) -> usize {
        self.audio.nrows()
    }

    pub fn n_channels(&self) -> usize {
        self.audio.ncols()
    }

    pub fn duration_ms(&self) -> f64 {
        self.manifest.duration_ms
    }

    pub fn audio_hash(&self) -> &str {
        &self.manifest.audio_hash
    }

    /// Hash of the audio buffer as it is now.
    pub fn compute_audio_hash(&self) -> String {
        hash_f64s(self.audio.iter().copied())
    }

    /// Rising edges of the TTL stream as `(sample_index, code)`.
    pub fn ttl_onsets(&self) -> Vec<(usize, u32)> {
        let mut onsets = Vec::new();
        let mut prev = 0;
        for (i, code) in self.ttl.iter().enumerate() {
            if *code != 0 && *code != prev {
                onsets.push((i, *code));
            }
            prev = *code;
        }
        onsets
    }

    /// Structural problems that make the artifact unfit for playback. Empty when well-formed.
    pub fn check(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let manifest = &self.manifest;
        if !(manifest.fs_hz > 0. && manifest.fs_hz.is_finite()) {
            issues.push(format!("manifest.fs_hz must be positive, got {}", manifest.fs_hz));
        }
        if self.audio.ncols() == 0 {
            issues.push("audio buffer has no channels".to_string());
        }
        if self.audio.nrows() != self.ttl.len() {
            issues.push(format!(
                "audio has {} samples but ttl has {}",
                self.audio.nrows(),
                self.ttl.len()
            ));
        }
        if manifest.duration_samples != self.audio.nrows() {
            issues.push(format!(
                "manifest.duration_samples is {} but audio has {} samples",
                manifest.duration_samples,
                self.audio.nrows()
            ));
        }
        if manifest.n_channels != self.audio.ncols() {
            issues.push(format!(
                "manifest.n_channels is {} but audio has {} channels",
                manifest.n_channels,
                self.audio.ncols()
            ));
        }
        if manifest.audio_hash.is_empty() {
            issues.push("manifest.audio_hash is empty".to_string());
        }
        if let Some(event) = self.events.iter().find(|e| e.sample_index >= self.audio.nrows().max(1)) {
            issues.push(format!(
                "event for trial {} element {} at sample {} is past the end of the buffer",
                event.trial_index, event.element_index, event.sample_index
            ));
        }
        issues
    }

    /// Writes the artifact container to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        writer.write_all(CONTAINER_MAGIC)?;
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        tracing::debug!(
            "Saved sequence artifact ({} samples, hash {}) to {}",
            self.n_samples(),
            self.audio_hash(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Reads an artifact container and verifies its audio hash.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path.as_ref())?.read_to_end(&mut bytes)?;
        if bytes.len() < CONTAINER_MAGIC.len() || &bytes[..CONTAINER_MAGIC.len()] != CONTAINER_MAGIC {
            return Err(CompilerError::BadMagic);
        }
        let artifact: SequenceArtifact = bincode::deserialize(&bytes[CONTAINER_MAGIC.len()..])?;
        let found = artifact.compute_audio_hash();
        if found != artifact.manifest.audio_hash {
            return Err(CompilerError::HashMismatch {
                expected: artifact.manifest.audio_hash.clone(),
                found,
            });
        }
        Ok(artifact)
    }
}
