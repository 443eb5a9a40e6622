//! Provides the stimulus generator contract consumed by the compiler.
//!
//! ## Main Structures and Enumerations:
//!
//! - [`GeneratorKind`]: closed set of built-in generators: `Tone`, `Noise` and `Silence`.
//!
//! - [`Generator`]: a generator kind together with its resolved arguments ([`GenArgs`]). It is
//!   validated on construction and evaluated in-place on a time array, the same way for every kind.
//!
//! - [`StimulusDef`] / [`StimulusLibrary`]: the stimulus library records (`type`, synthesis
//!   parameters as [`NumericField`]s, `level`, `envelope`, `routing.channels`).
//!
//! - [`GeneratorContext`]: what a generator may use while running: the sample rate, the number of
//!   routed channels, a `sample_field` helper and RNG streams, both bound to the session's
//!   [`SamplingContext`] so that every call is reproducible under a fixed seed.
//!
//! ## Contract
//!
//! [`Generator::generate`] returns a `samples × channels` block covering exactly `duration_ms` at
//! the context's sample rate, plus [`GeneratorMetadata`] (`peak`, `rms`, `hash`, `realized_params`).
//! Invalid physical parameters (e.g. a negative frequency) fail with a named [`GeneratorError`];
//! out-of-range levels are clipped to `[-1, 1]`, never overflowed.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;

use indexmap::IndexMap;
use maplit::hashmap;
use ndarray::{Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{CompilerError, IssueKind, ValidationIssue, ValidationReport};
use crate::sampling::*;
use crate::utils::*;

/// Resolved generator arguments: argument name to value.
pub type GenArgs = IndexMap<String, f64>;

/// Random stream used by noise generators without an explicit `seed`.
pub const NOISE_STREAM: &str = "noise";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorKind {
    Tone,
    Noise,
    Silence,
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                GeneratorKind::Tone => "tone",
                GeneratorKind::Noise => "noise",
                GeneratorKind::Silence => "silence",
            }
        )
    }
}

impl GeneratorKind {
    /// Arguments without which the generator cannot run.
    pub fn required_args(&self) -> &'static [&'static str] {
        match self {
            GeneratorKind::Tone => &["duration_ms", "frequency_hz"],
            GeneratorKind::Noise | GeneratorKind::Silence => &["duration_ms"],
        }
    }

    /// Values used for optional arguments that are not specified.
    pub fn default_args(&self) -> HashMap<&'static str, f64> {
        let common = hashmap! {"level_db" => 0., "rise_ms" => 0., "fall_ms" => 0.};
        match self {
            GeneratorKind::Tone => {
                let mut args = common;
                args.insert("phase", 0.);
                args
            }
            GeneratorKind::Noise | GeneratorKind::Silence => common,
        }
    }

    /// Every argument name the generator reads.
    pub fn accepts_arg(&self, arg: &str) -> bool {
        self.required_args().iter().any(|required| *required == arg)
            || self.default_args().contains_key(arg)
            || (*self == GeneratorKind::Noise && arg == "seed")
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum GeneratorError {
    #[error("{kind} generator requires argument '{arg}'")]
    MissingArgument { kind: GeneratorKind, arg: String },
    #[error("{kind} generator has no argument '{arg}'")]
    UnknownArgument { kind: GeneratorKind, arg: String },
    #[error("{kind} generator: invalid {arg} = {value} ({reason})")]
    InvalidParameter {
        kind: GeneratorKind,
        arg: String,
        value: f64,
        reason: String,
    },
    #[error("{kind} generator: routing must name at least one channel")]
    EmptyRouting { kind: GeneratorKind },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeShape {
    #[default]
    Cosine,
    Linear,
    None,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    #[serde(default)]
    pub shape: EnvelopeShape,
    #[serde(default)]
    pub rise_ms: Option<NumericField>,
    #[serde(default)]
    pub fall_ms: Option<NumericField>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Routing {
    pub channels: Vec<usize>,
}

impl Default for Routing {
    fn default() -> Self {
        Self { channels: vec![0] }
    }
}

/// What a generator may use while running.
pub struct GeneratorContext<'a> {
    pub fs_hz: f64,
    pub n_channels: usize,
    sampling: &'a mut SamplingContext,
}

impl<'a> GeneratorContext<'a> {
    pub fn new(fs_hz: f64, n_channels: usize, sampling: &'a mut SamplingContext) -> Self {
        Self {
            fs_hz,
            n_channels,
            sampling,
        }
    }

    /// Resolves a field through the session's sampling framework.
    pub fn sample_field(&mut self, field: &NumericField, param_name: &str) -> Result<f64, CompilerError> {
        self.sampling.sample(field, param_name)
    }

    pub fn stream(&mut self, name: &str) -> &mut Pcg64 {
        self.sampling.stream(name)
    }

    pub fn n_samples(&self, duration_ms: f64) -> usize {
        ms_to_samples(duration_ms, self.fs_hz)
    }
}

/// Summary of one generated block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratorMetadata {
    pub peak: f64,
    pub rms: f64,
    pub hash: String,
    pub realized_params: GenArgs,
    pub n_samples: usize,
    pub clipped: bool,
}

/// A generator kind with its resolved arguments.
///
/// ## Arguments per kind
/// 1. `GeneratorKind::Tone`:
///    - `duration_ms`, `frequency_hz`
///    - `phase` (radians): default `0.0`
/// 2. `GeneratorKind::Noise`:
///    - `duration_ms`
///    - `seed`: when present the noise is frozen to this seed, otherwise drawn from the
///      session's `"noise"` stream
/// 3. `GeneratorKind::Silence`:
///    - `duration_ms`
///
/// Every kind also accepts `level_db` (dBFS, default `0.0`), `rise_ms` and `fall_ms`
/// (envelope ramps, default `0.0`).
#[derive(Clone, Debug, PartialEq)]
pub struct Generator {
    pub kind: GeneratorKind,
    pub args: GenArgs,
    pub envelope: EnvelopeShape,
}

impl Generator {
    /// Constructs a generator, checking required arguments and physical validity.
    ///
    /// ```
    /// use expcompiler_backend::generator::*;
    ///
    /// let mut args = GenArgs::new();
    /// args.insert("duration_ms".to_string(), 10.0);
    /// args.insert("frequency_hz".to_string(), -5.0);
    /// assert!(matches!(
    ///     Generator::new(GeneratorKind::Tone, args, EnvelopeShape::None, 48000.),
    ///     Err(GeneratorError::InvalidParameter { .. })
    /// ));
    /// ```
    pub fn new(kind: GeneratorKind, mut args: GenArgs, envelope: EnvelopeShape, fs_hz: f64) -> Result<Self, GeneratorError> {
        for key in kind.required_args() {
            if !args.contains_key(*key) {
                return Err(GeneratorError::MissingArgument {
                    kind,
                    arg: key.to_string(),
                });
            }
        }
        if let Some(key) = args.keys().find(|key| !kind.accepts_arg(key)) {
            return Err(GeneratorError::UnknownArgument {
                kind,
                arg: key.clone(),
            });
        }
        let mut defaults: Vec<(&str, f64)> = kind.default_args().into_iter().collect();
        defaults.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in defaults {
            args.entry(key.to_string()).or_insert(value);
        }
        let invalid = |arg: &str, value: f64, reason: &str| GeneratorError::InvalidParameter {
            kind,
            arg: arg.to_string(),
            value,
            reason: reason.to_string(),
        };

        let duration_ms = args["duration_ms"];
        if !(duration_ms >= 0.) {
            return Err(invalid("duration_ms", duration_ms, "duration must be >= 0"));
        }
        for ramp in ["rise_ms", "fall_ms"] {
            if !(args[ramp] >= 0.) {
                return Err(invalid(ramp, args[ramp], "ramp must be >= 0"));
            }
        }
        if args["rise_ms"] + args["fall_ms"] > duration_ms {
            return Err(invalid(
                "rise_ms",
                args["rise_ms"],
                "rise_ms + fall_ms exceeds the stimulus duration",
            ));
        }
        if !args["level_db"].is_finite() {
            return Err(invalid("level_db", args["level_db"], "level must be finite"));
        }
        if kind == GeneratorKind::Tone {
            let freq = args["frequency_hz"];
            if !(freq > 0.) {
                return Err(invalid("frequency_hz", freq, "frequency must be positive"));
            }
            if freq >= fs_hz / 2. {
                return Err(invalid("frequency_hz", freq, "frequency must be below Nyquist"));
            }
        }
        Ok(Generator { kind, args, envelope })
    }

    /// Replaces the values of `t_arr` (seconds) with the unscaled waveform.
    /// Noise draws from `rng` and is silent without one; the other kinds ignore it.
    pub fn eval_inplace(&self, t_arr: &mut ndarray::ArrayViewMut1<f64>, rng: Option<&mut Pcg64>) {
        match self.kind {
            GeneratorKind::Tone => {
                let freq = self.args["frequency_hz"];
                let phase = self.args["phase"];
                t_arr.map_inplace(|t| *t = (2.0 * PI * freq * (*t) + phase).sin());
            }
            GeneratorKind::Noise => match rng {
                Some(rng) => t_arr.map_inplace(|t| *t = 2. * rng.random::<f64>() - 1.),
                None => t_arr.fill(0.),
            },
            GeneratorKind::Silence => t_arr.fill(0.),
        }
    }

    /// Multiplies `signal` by the onset/offset ramps.
    fn apply_envelope(&self, signal: &mut Array1<f64>, fs_hz: f64) {
        let n = signal.len();
        let rise = ms_to_samples(self.args["rise_ms"], fs_hz).min(n);
        let fall = ms_to_samples(self.args["fall_ms"], fs_hz).min(n);
        let gain = |x: f64| match self.envelope {
            EnvelopeShape::Cosine => 0.5 * (1. - (PI * x).cos()),
            EnvelopeShape::Linear => x,
            EnvelopeShape::None => 1.,
        };
        for i in 0..rise {
            signal[i] *= gain(i as f64 / rise as f64);
        }
        for i in 0..fall {
            signal[n - 1 - i] *= gain(i as f64 / fall as f64);
        }
    }

    /// Renders the block for `ctx.n_channels` routed channels.
    pub fn generate(&self, ctx: &mut GeneratorContext) -> Result<(Array2<f64>, GeneratorMetadata), GeneratorError> {
        if ctx.n_channels == 0 {
            return Err(GeneratorError::EmptyRouting { kind: self.kind });
        }
        let n_samples = ctx.n_samples(self.args["duration_ms"]);
        let fs_hz = ctx.fs_hz;
        let mut signal = Array1::from_shape_fn(n_samples, |i| i as f64 / fs_hz);
        let frozen = self.args.get("seed").map(|seed| Pcg64::seed_from_u64(*seed as u64));
        match (self.kind, frozen) {
            (GeneratorKind::Noise, Some(mut rng)) => self.eval_inplace(&mut signal.view_mut(), Some(&mut rng)),
            (GeneratorKind::Noise, None) => self.eval_inplace(&mut signal.view_mut(), Some(ctx.stream(NOISE_STREAM))),
            _ => self.eval_inplace(&mut signal.view_mut(), None),
        }
        self.apply_envelope(&mut signal, fs_hz);

        let amplitude = 10f64.powf(self.args["level_db"] / 20.);
        let mut clipped = false;
        signal.map_inplace(|x| {
            let scaled = *x * amplitude;
            if scaled.abs() > 1. {
                clipped = true;
            }
            *x = scaled.clamp(-1., 1.);
        });
        if clipped {
            tracing::warn!("{} at {} dBFS clipped to full scale", self.kind, self.args["level_db"]);
        }

        let block = signal
            .insert_axis(Axis(1))
            .broadcast((n_samples, ctx.n_channels))
            .map(|b| b.to_owned())
            .unwrap_or_else(|| Array2::zeros((n_samples, ctx.n_channels)));
        let metadata = GeneratorMetadata {
            peak: block.iter().fold(0., |acc: f64, x| acc.max(x.abs())),
            rms: rms(block.iter().copied()),
            hash: hash_f64s(block.iter().copied()),
            realized_params: self.args.clone(),
            n_samples,
            clipped,
        };
        Ok((block, metadata))
    }
}

/// One stimulus library record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StimulusDef {
    #[serde(rename = "type")]
    pub kind: GeneratorKind,
    /// Level in dBFS.
    #[serde(default)]
    pub level: Option<NumericField>,
    #[serde(default)]
    pub envelope: Option<Envelope>,
    #[serde(default)]
    pub routing: Routing,
    /// Synthesis parameters (`frequency_hz`, `duration_ms`, ...).
    #[serde(flatten)]
    pub params: IndexMap<String, NumericField>,
}

impl StimulusDef {
    pub fn new(kind: GeneratorKind) -> Self {
        Self {
            kind,
            level: None,
            envelope: None,
            routing: Routing::default(),
            params: IndexMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<NumericField>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn with_level(mut self, level_db: impl Into<NumericField>) -> Self {
        self.level = Some(level_db.into());
        self
    }

    pub fn with_channels(mut self, channels: Vec<usize>) -> Self {
        self.routing.channels = channels;
        self
    }

    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = Some(envelope);
        self
    }

    /// Resolves every parameter through the sampling framework and builds the generator.
    ///
    /// Parameters are sampled as `"<name>.<param>"`, so scope caching is per stimulus.
    /// `duration_ms`, when given, overrides the library duration (the schedule is authoritative).
    pub fn resolve(&self, name: &str, duration_ms: Option<f64>, ctx: &mut GeneratorContext) -> Result<Generator, CompilerError> {
        let mut args = GenArgs::new();
        for (param, field) in &self.params {
            args.insert(param.clone(), ctx.sample_field(field, &format!("{name}.{param}"))?);
        }
        if let Some(level) = &self.level {
            args.insert("level_db".into(), ctx.sample_field(level, &format!("{name}.level"))?);
        }
        let mut shape = EnvelopeShape::None;
        if let Some(envelope) = &self.envelope {
            shape = envelope.shape;
            if let Some(rise) = &envelope.rise_ms {
                args.insert("rise_ms".into(), ctx.sample_field(rise, &format!("{name}.rise_ms"))?);
            }
            if let Some(fall) = &envelope.fall_ms {
                args.insert("fall_ms".into(), ctx.sample_field(fall, &format!("{name}.fall_ms"))?);
            }
        }
        if let Some(duration_ms) = duration_ms {
            args.insert("duration_ms".into(), duration_ms);
        }
        Ok(Generator::new(self.kind, args, shape, ctx.fs_hz)?)
    }

    pub fn validate(&self, path: &str, report: &mut ValidationReport) {
        for (param, field) in &self.params {
            if !self.kind.accepts_arg(param) {
                report.push(
                    ValidationIssue::new(
                        format!("{path}.{param}"),
                        IssueKind::Unsupported,
                        format!("unknown field for a {} stimulus", self.kind),
                    )
                    .with_value(param),
                );
                continue;
            }
            field.validate(&format!("{path}.{param}"), report);
        }
        if let Some(level) = &self.level {
            level.validate(&format!("{path}.level"), report);
        }
        if self.routing.channels.is_empty() {
            report.push(ValidationIssue::new(
                format!("{path}.routing.channels"),
                IssueKind::Missing,
                "routing must name at least one channel",
            ));
        }
    }
}

/// Mapping from stimulus reference name to its definition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StimulusLibrary {
    stimuli: IndexMap<String, StimulusDef>,
}

impl StimulusLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, CompilerError> {
        let library: StimulusLibrary = serde_json::from_str(json).map_err(|e| CompilerError::parse("library", e))?;
        library.validate()?;
        Ok(library)
    }

    pub fn insert(&mut self, name: &str, def: StimulusDef) {
        self.stimuli.insert(name.to_string(), def);
    }

    pub fn with(mut self, name: &str, def: StimulusDef) -> Self {
        self.insert(name, def);
        self
    }

    pub fn get(&self, name: &str) -> Option<&StimulusDef> {
        self.stimuli.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.stimuli.keys().map(|k| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.stimuli.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stimuli.is_empty()
    }

    pub fn validate(&self) -> Result<(), CompilerError> {
        let mut report = ValidationReport::new();
        for (name, def) in &self.stimuli {
            def.validate(name, &mut report);
        }
        report.into_result()
    }
}
