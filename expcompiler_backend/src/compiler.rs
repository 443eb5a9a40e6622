//! Renders an [`ElementTable`] into a [`SequenceArtifact`].
//!
//! ## Overview
//!
//! Compilation proceeds in stages, and either produces a whole artifact or fails without
//! side effects on the caller's data:
//!
//! 1. **Reference check**: every non-omission row must name a stimulus of the library.
//! 2. **Generation**: for each row, the stimulus parameters are resolved through the
//!    sampling framework (per-block scope follows the row's block) and the generator renders a
//!    block. The block is registered on the [`AudioTrack`]s it is routed to, and the row's TTL
//!    code (if any) becomes a pulse on the [`TtlTrack`].
//! 3. **Sizing**: the buffer covers the last element end (rounded up to a whole sample), every
//!    rendered block and every TTL pulse; an empty table yields one second of silence.
//! 4. **Stitching**: blocks are added into the zero-filled audio buffer at their onset sample,
//!    TTL pulses are rendered, and the events/trial tables and the manifest (with the sha256 of
//!    the audio buffer) are built.
//!
//! Identical inputs, including the sampling context seed, give byte-identical buffers and hash.

use chrono::Utc;
use ndarray::Array2;

use crate::artifact::*;
use crate::channel::*;
use crate::error::*;
use crate::generator::*;
use crate::pattern::ElementTable;
use crate::sampling::SamplingContext;
use crate::utils::*;

pub const DEFAULT_TTL_PULSE_SAMPLES: usize = 10;
/// Length of the artifact compiled from an empty table.
pub const EMPTY_SEQUENCE_MS: f64 = 1000.;

/// A generated block waiting to be stitched.
struct RenderedBlock {
    start_pos: usize,
    channels: Vec<usize>,
    samples: Array2<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Compiler {
    pub fs_hz: f64,
    pub ttl_pulse_samples: usize,
}

impl Compiler {
    pub fn new(fs_hz: f64) -> Self {
        Self {
            fs_hz,
            ttl_pulse_samples: DEFAULT_TTL_PULSE_SAMPLES,
        }
    }

    pub fn with_ttl_pulse_samples(mut self, ttl_pulse_samples: usize) -> Self {
        self.ttl_pulse_samples = ttl_pulse_samples;
        self
    }

    fn validate(&self) -> Result<()> {
        let mut report = ValidationReport::new();
        if !(self.fs_hz > 0. && self.fs_hz.is_finite()) {
            report.push(
                ValidationIssue::new("fs_hz", IssueKind::InvalidValue, "sample rate must be positive")
                    .with_value(self.fs_hz),
            );
        }
        if self.ttl_pulse_samples == 0 {
            report.push(ValidationIssue::new(
                "ttl_pulse_samples",
                IssueKind::InvalidValue,
                "TTL pulses need at least one sample",
            ));
        }
        report.into_result()
    }

    fn check_references(table: &ElementTable, library: &StimulusLibrary) -> Result<()> {
        match table
            .rows
            .iter()
            .find(|row| !row.is_omission && library.get(&row.stimulus_ref).is_none())
        {
            Some(row) => Err(CompilerError::UnknownStimulus {
                stimulus_ref: row.stimulus_ref.clone(),
                trial_index: row.trial_index,
                element_index: row.element_index,
            }),
            None => Ok(()),
        }
    }

    pub fn compile(&self, table: &ElementTable, library: &StimulusLibrary, ctx: &mut SamplingContext) -> Result<SequenceArtifact> {
        let mut timer = TickTimer::new();
        self.validate()?;
        Self::check_references(table, library)?;

        let n_channels = table
            .rows
            .iter()
            .filter(|row| !row.is_omission)
            .filter_map(|row| library.get(&row.stimulus_ref))
            .flat_map(|def| def.routing.channels.iter().map(|ch| ch + 1))
            .max()
            .unwrap_or(1);
        let mut audio_tracks: Vec<AudioTrack> = (0..n_channels).map(AudioTrack::new).collect();
        let mut ttl_track = TtlTrack::new();

        // Generation
        let mut blocks: Vec<RenderedBlock> = Vec::new();
        let mut events: Vec<EventRow> = Vec::with_capacity(table.len());
        for (row_index, row) in table.rows.iter().enumerate() {
            let start_pos = ms_to_samples(row.absolute_onset_ms, self.fs_hz);
            let mut stimulus_hash = None;
            if let Some(def) = library.get(&row.stimulus_ref).filter(|_| !row.is_omission) {
                ctx.set_block(row.block_index);
                let duration_ms = if row.duration_ms > 0. { Some(row.duration_ms) } else { None };
                let mut gen_ctx = GeneratorContext::new(self.fs_hz, def.routing.channels.len(), ctx);
                let generator = def.resolve(&row.stimulus_ref, duration_ms, &mut gen_ctx)?;
                let (samples, metadata) = generator.generate(&mut gen_ctx)?;
                for ch in &def.routing.channels {
                    audio_tracks[*ch].add_placement(Placement::new(start_pos, start_pos + samples.nrows(), row_index));
                }
                stimulus_hash = Some(metadata.hash);
                blocks.push(RenderedBlock {
                    start_pos,
                    channels: def.routing.channels.clone(),
                    samples,
                });
            }
            if let Some(code) = row.ttl_code {
                ttl_track.pulse(start_pos, self.ttl_pulse_samples, code, row_index);
            }
            events.push(EventRow {
                sample_index: start_pos,
                time_ms: row.absolute_onset_ms,
                block_index: row.block_index,
                trial_index: row.trial_index,
                element_index: row.element_index,
                stimulus_ref: row.stimulus_ref.clone(),
                code: row.ttl_code,
                is_omission: row.is_omission,
                stimulus_hash,
            });
        }
        timer.tick_log("Generated stimulus blocks");

        // Sizing
        let mut length = (table.end_ms() * self.fs_hz / 1e3).ceil() as usize;
        length = audio_tracks
            .iter()
            .map(|track| track.end_pos())
            .chain(std::iter::once(ttl_track.end_pos()))
            .fold(length, usize::max);
        if table.is_empty() {
            length = length.max(ms_to_samples(EMPTY_SEQUENCE_MS, self.fs_hz));
        }

        // Stitching
        let mut audio = Array2::<f64>::zeros((length, n_channels));
        for block in &blocks {
            for (k, ch) in block.channels.iter().enumerate() {
                audio_tracks[*ch].mix_into(&mut audio, &block.samples.view(), k, block.start_pos);
            }
        }
        if audio.iter().any(|x| x.abs() > 1.) {
            tracing::warn!("Overlapping stimuli exceed full scale, clipping the mixed buffer");
            audio.mapv_inplace(|x| x.clamp(-1., 1.));
        }
        let ttl = ttl_track.render(length);
        timer.tick_log("Stitched buffers");

        let trial_table = table
            .trials
            .iter()
            .map(|span| TrialRow {
                block_index: span.block_index,
                trial_index: span.trial_index,
                label: span.label.clone(),
                code: span.code,
                start_sample: ms_to_samples(span.start_ms, self.fs_hz),
                end_sample: ms_to_samples(span.end_ms, self.fs_hz),
                start_ms: span.start_ms,
                end_ms: span.end_ms,
                n_elements: span.n_elements,
            })
            .collect::<Vec<TrialRow>>();

        let manifest = Manifest {
            version: ARTIFACT_VERSION.to_string(),
            fs_hz: self.fs_hz,
            n_channels,
            n_trials: trial_table.len(),
            n_elements: table.len(),
            duration_samples: length,
            duration_ms: samples_to_ms(length, self.fs_hz),
            compiled_at: Utc::now(),
            audio_hash: hash_f64s(audio.iter().copied()),
            ttl_hash: hash_u32s(ttl.iter().copied()),
            ttl_pulse_samples: self.ttl_pulse_samples,
            master_seed: Some(ctx.master_seed()),
        };
        tracing::debug!(
            "Compiled {} elements into {} samples x {} channels ({:.1} ms), hash {}",
            manifest.n_elements,
            manifest.duration_samples,
            manifest.n_channels,
            manifest.duration_ms,
            manifest.audio_hash
        );

        Ok(SequenceArtifact {
            audio,
            ttl,
            events,
            trial_table,
            element_table: table.clone(),
            manifest,
        })
    }
}

/// Compiles `table` at `fs_hz` with the default TTL pulse width.
pub fn compile(table: &ElementTable, library: &StimulusLibrary, fs_hz: f64, ctx: &mut SamplingContext) -> Result<SequenceArtifact> {
    Compiler::new(fs_hz).compile(table, library, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::ElementRow;
    use crate::sampling::*;

    fn library() -> StimulusLibrary {
        StimulusLibrary::new()
            .with(
                "std",
                StimulusDef::new(GeneratorKind::Tone)
                    .with_param("frequency_hz", 1000.)
                    .with_param("duration_ms", 50.),
            )
            .with(
                "dev",
                StimulusDef::new(GeneratorKind::Tone)
                    .with_param(
                        "frequency_hz",
                        NumericField::distribution(Distribution::Uniform { min: 1200., max: 1400. }, Scope::PerTrial),
                    )
                    .with_param("duration_ms", 50.)
                    .with_channels(vec![1]),
            )
    }

    fn table() -> ElementTable {
        ElementTable::from_rows(vec![
            ElementRow::new(0, 0, "std", 0., 50.).with_ttl_code(1),
            ElementRow::new(1, 0, "dev", 600., 50.).with_ttl_code(2),
            ElementRow::new(2, 0, "std", 1200., 50.).with_ttl_code(1),
        ])
    }

    #[test]
    fn same_seed_gives_identical_buffers() {
        let a = compile(&table(), &library(), 48000., &mut SamplingContext::new(7)).unwrap();
        let b = compile(&table(), &library(), 48000., &mut SamplingContext::new(7)).unwrap();
        assert_eq!(a.audio, b.audio);
        assert_eq!(a.ttl, b.ttl);
        assert_eq!(a.audio_hash(), b.audio_hash());
        let c = compile(&table(), &library(), 48000., &mut SamplingContext::new(8)).unwrap();
        assert_ne!(a.audio_hash(), c.audio_hash());
    }

    #[test]
    fn layout_follows_routing_and_onsets() {
        let artifact = compile(&table(), &library(), 48000., &mut SamplingContext::new(0)).unwrap();
        // 1250 ms at 48 kHz, two channels because "dev" routes to channel 1
        assert_eq!(artifact.audio.dim(), (60000, 2));
        assert_eq!(artifact.ttl.len(), 60000);
        assert!(artifact.audio.column(1).iter().take(28800).all(|x| *x == 0.));
        assert!(artifact.audio.column(0).iter().skip(28800).take(2400).all(|x| *x == 0.));
        assert!(artifact.check().is_empty());
        assert_eq!(artifact.manifest.n_trials, 3);
        assert_eq!(artifact.events[1].sample_index, 28800);
        assert!(artifact.events.iter().all(|e| e.stimulus_hash.is_some()));
    }

    #[test]
    fn ttl_pulse_round_trip() {
        let table = ElementTable::from_rows(vec![ElementRow::new(0, 0, "std", 10., 50.).with_ttl_code(5)]);
        let artifact = compile(&table, &library(), 48000., &mut SamplingContext::new(0)).unwrap();
        assert_eq!(artifact.ttl_onsets(), vec![(480, 5)]);
        assert!(artifact.ttl.iter().skip(480).take(10).all(|c| *c == 5));
        assert_eq!(artifact.ttl[490], 0);
        assert_eq!(artifact.ttl.iter().filter(|c| **c != 0).count(), 10);
    }

    #[test]
    fn custom_pulse_width_extends_buffer() {
        let table = ElementTable::from_rows(vec![ElementRow::new(0, 0, "std", 0., 1.).with_ttl_code(3)]);
        let artifact = Compiler::new(4000.)
            .with_ttl_pulse_samples(25)
            .compile(&table, &library(), &mut SamplingContext::new(0))
            .unwrap();
        assert_eq!(artifact.n_samples(), 25);
        assert_eq!(artifact.manifest.ttl_pulse_samples, 25);
    }

    #[test]
    fn empty_table_gives_one_second_of_silence() {
        let artifact = compile(&ElementTable::new(), &library(), 48000., &mut SamplingContext::new(0)).unwrap();
        assert!(artifact.n_samples() >= 48000);
        assert!(artifact.audio.iter().all(|x| *x == 0.));
        assert!(artifact.ttl.iter().all(|c| *c == 0));
        assert_eq!(artifact.manifest.n_elements, 0);
        assert!(artifact.check().is_empty());
    }

    #[test]
    fn unknown_stimulus_fails_before_rendering() {
        let table = ElementTable::from_rows(vec![
            ElementRow::new(0, 0, "std", 0., 50.),
            ElementRow::new(1, 0, "missing", 100., 50.),
        ]);
        let mut ctx = SamplingContext::new(0);
        let err = compile(&table, &library(), 48000., &mut ctx).unwrap_err();
        assert!(matches!(err, CompilerError::UnknownStimulus { ref stimulus_ref, trial_index: 1, .. } if stimulus_ref == "missing"));
        assert!(ctx.streams.stream_names().is_empty());
    }

    #[test]
    fn generator_errors_propagate() {
        let library = StimulusLibrary::new().with(
            "bad",
            StimulusDef::new(GeneratorKind::Tone)
                .with_param("frequency_hz", -440.)
                .with_param("duration_ms", 50.),
        );
        let table = ElementTable::from_rows(vec![ElementRow::new(0, 0, "bad", 0., 50.)]);
        let err = compile(&table, &library, 48000., &mut SamplingContext::new(0)).unwrap_err();
        assert!(matches!(err, CompilerError::Generator(GeneratorError::InvalidParameter { .. })));
    }

    #[test]
    fn omissions_keep_their_event_and_code() {
        let mut omission = ElementRow::new(0, 1, crate::trial::OMISSION_REF, 500., 0.).with_ttl_code(9);
        omission.is_omission = true;
        let table = ElementTable::from_rows(vec![ElementRow::new(0, 0, "std", 0., 50.), omission]);
        let artifact = compile(&table, &library(), 8000., &mut SamplingContext::new(0)).unwrap();
        assert_eq!(artifact.events.len(), 2);
        assert_eq!(artifact.events[1].stimulus_hash, None);
        assert_eq!(artifact.ttl_onsets(), vec![(4000, 9)]);
        assert!(artifact.audio.column(0).iter().skip(400).all(|x| *x == 0.));
    }

    #[test]
    fn rejects_bad_sample_rate() {
        let err = compile(&table(), &library(), 0., &mut SamplingContext::new(0)).unwrap_err();
        assert_eq!(err.issues()[0].field_path, "fs_hz");
    }
}
