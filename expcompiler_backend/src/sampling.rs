//! Deterministic, scope-aware sampling of numeric configuration fields.
//!
//! ## Overview
//!
//! Every random quantity in a paradigm (inter-trial intervals, foreperiods, stimulus
//! frequencies, ...) is described by a [`NumericField`]: either a fixed scalar or a
//! distribution descriptor carrying a [`Scope`]. Fields are resolved through a
//! [`SamplingContext`], which owns two pieces of state:
//!
//! 1. [`RngStreams`]: independent named generators, each derived from one master seed and the
//!    stream name. Adding draws to one stream never perturbs another.
//! 2. [`ScopeCache`]: remembers values sampled with `per_block` / `per_session` scope until the
//!    owning block or session changes.
//!
//! The context is passed explicitly (`&mut`) into adapters, the compiler and generators. There is
//! no process-wide state: one context per experiment session.
//!
//! ## Example
//!
//! ```
//! use expcompiler_backend::sampling::*;
//!
//! let mut ctx = SamplingContext::new(42);
//! let iti: NumericField =
//!     serde_json::from_str(r#"{"dist": "uniform", "min": 500, "max": 700, "scope": "per_block"}"#).unwrap();
//! let first = ctx.sample(&iti, "iti").unwrap();
//! // Cached within the block
//! assert_eq!(ctx.sample(&iti, "iti").unwrap(), first);
//! assert!((500.0..700.0).contains(&first));
//! ```

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::*;

/// Tolerance used for every probability-sum check in the crate.
pub const PROBABILITY_TOLERANCE: f64 = 1e-3;

/// Lifetime over which a sampled value is reused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    PerTrial,
    PerBlock,
    PerSession,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Scope::PerTrial => "per_trial",
                Scope::PerBlock => "per_block",
                Scope::PerSession => "per_session",
            }
        )
    }
}

/// Closed set of supported distributions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dist", rename_all = "snake_case", deny_unknown_fields)]
pub enum Distribution {
    Uniform { min: f64, max: f64 },
    Normal { mean: f64, std: f64 },
    Loguniform { min: f64, max: f64 },
    Categorical {
        categories: Vec<f64>,
        probabilities: Vec<f64>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistributionSpec {
    #[serde(flatten)]
    pub dist: Distribution,
    #[serde(default)]
    pub scope: Scope,
}

/// A configuration value that is either fixed or drawn from a distribution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumericField {
    Scalar(f64),
    Distribution(DistributionSpec),
}

impl From<f64> for NumericField {
    fn from(value: f64) -> Self {
        NumericField::Scalar(value)
    }
}

impl NumericField {
    pub fn distribution(dist: Distribution, scope: Scope) -> Self {
        NumericField::Distribution(DistributionSpec { dist, scope })
    }

    pub fn scope(&self) -> Option<Scope> {
        match self {
            NumericField::Scalar(_) => None,
            NumericField::Distribution(spec) => Some(spec.scope),
        }
    }

    /// Checks distribution parameters, appending one issue per violated invariant.
    pub fn validate(&self, path: &str, report: &mut ValidationReport) {
        let spec = match self {
            NumericField::Scalar(value) => {
                if !value.is_finite() {
                    report.push(
                        ValidationIssue::new(path, IssueKind::InvalidValue, "scalar must be finite")
                            .with_value(value),
                    );
                }
                return;
            }
            NumericField::Distribution(spec) => spec,
        };
        match &spec.dist {
            Distribution::Uniform { min, max } => {
                if !(min < max) {
                    report.push(
                        ValidationIssue::new(path, IssueKind::InvalidValue, "uniform requires min < max")
                            .with_value(format!("min={min}, max={max}"))
                            .with_expected("min < max"),
                    );
                }
            }
            Distribution::Loguniform { min, max } => {
                if !(*min > 0.) {
                    report.push(
                        ValidationIssue::new(path, IssueKind::InvalidValue, "loguniform requires min > 0")
                            .with_value(min)
                            .with_expected("> 0"),
                    );
                }
                if !(min < max) {
                    report.push(
                        ValidationIssue::new(path, IssueKind::InvalidValue, "loguniform requires min < max")
                            .with_value(format!("min={min}, max={max}"))
                            .with_expected("min < max"),
                    );
                }
            }
            Distribution::Normal { std, .. } => {
                if !(*std >= 0.) {
                    report.push(
                        ValidationIssue::new(path, IssueKind::InvalidValue, "normal requires std >= 0")
                            .with_value(std)
                            .with_expected(">= 0"),
                    );
                }
            }
            Distribution::Categorical {
                categories,
                probabilities,
            } => {
                if categories.is_empty() {
                    report.push(ValidationIssue::new(
                        format!("{path}.categories"),
                        IssueKind::Missing,
                        "categorical requires at least one category",
                    ));
                }
                if categories.len() != probabilities.len() {
                    report.push(
                        ValidationIssue::new(
                            format!("{path}.probabilities"),
                            IssueKind::InvalidValue,
                            "categories and probabilities must have equal length",
                        )
                        .with_value(probabilities.len())
                        .with_expected(categories.len().to_string()),
                    );
                }
                check_probabilities(&format!("{path}.probabilities"), probabilities, report);
            }
        }
    }
}

/// Appends issues when `probabilities` leave [0, 1] or do not sum to 1 within
/// [`PROBABILITY_TOLERANCE`].
pub fn check_probabilities(path: &str, probabilities: &[f64], report: &mut ValidationReport) {
    for (i, p) in probabilities.iter().enumerate() {
        if !(0.0..=1.0).contains(p) {
            report.push(
                ValidationIssue::new(
                    format!("{path}[{i}]"),
                    IssueKind::InvalidProbabilities,
                    "probability must lie in [0, 1]",
                )
                .with_value(p)
                .with_expected("[0, 1]"),
            );
        }
    }
    let sum: f64 = probabilities.iter().sum();
    if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
        report.push(
            ValidationIssue::new(path, IssueKind::InvalidProbabilities, "probabilities must sum to 1")
                .with_value(sum)
                .with_expected(format!("1 ± {PROBABILITY_TOLERANCE}")),
        );
    }
}

/// Summary statistics of a field, computed without drawing randomness.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Moments {
    pub mean: f64,
    pub std: Option<f64>,
    pub min: f64,
    pub max: f64,
}

/// Representative statistics of a field: midpoint for uniform, mean for normal,
/// geometric mean for loguniform and the first category for categorical.
pub fn compute_moments(field: &NumericField) -> Moments {
    let spec = match field {
        NumericField::Scalar(value) => {
            return Moments {
                mean: *value,
                std: Some(0.),
                min: *value,
                max: *value,
            }
        }
        NumericField::Distribution(spec) => spec,
    };
    match &spec.dist {
        Distribution::Uniform { min, max } => Moments {
            mean: 0.5 * (min + max),
            std: Some((max - min) / 12f64.sqrt()),
            min: *min,
            max: *max,
        },
        Distribution::Normal { mean, std } => Moments {
            mean: *mean,
            std: Some(*std),
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
        },
        Distribution::Loguniform { min, max } => Moments {
            mean: (min * max).sqrt(),
            std: None,
            min: *min,
            max: *max,
        },
        Distribution::Categorical { categories, .. } => Moments {
            mean: categories.first().copied().unwrap_or(0.),
            std: None,
            min: categories.iter().copied().fold(f64::INFINITY, f64::min),
            max: categories.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        },
    }
}

/// Derives the seed of stream `name` from `master_seed`.
fn derive_seed(master_seed: u64, name: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(master_seed.to_le_bytes());
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Named, independently seeded generators derived from one master seed.
pub struct RngStreams {
    master_seed: u64,
    streams: IndexMap<String, Pcg64>,
}

impl RngStreams {
    pub fn new(master_seed: u64) -> Self {
        Self {
            master_seed,
            streams: IndexMap::new(),
        }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Returns stream `name`, creating it on first use.
    pub fn stream(&mut self, name: &str) -> &mut Pcg64 {
        let master_seed = self.master_seed;
        self.streams
            .entry(name.to_string())
            .or_insert_with(|| Pcg64::seed_from_u64(derive_seed(master_seed, name)))
    }

    /// Replaces stream `name` with one derived from an explicit seed.
    pub fn reseed(&mut self, name: &str, seed: u64) {
        self.streams
            .insert(name.to_string(), Pcg64::seed_from_u64(derive_seed(seed, name)));
    }

    pub fn stream_names(&self) -> Vec<&str> {
        self.streams.keys().map(|k| k.as_str()).collect()
    }
}

/// Cache of values sampled with `per_block` or `per_session` scope.
#[derive(Default)]
pub struct ScopeCache {
    values: HashMap<(String, Scope), f64>,
    block: Option<usize>,
    session: Option<String>,
}

impl ScopeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self) -> Option<usize> {
        self.block
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Activates `block`; per-block values of any other block are dropped.
    pub fn set_block(&mut self, block: usize) {
        if self.block != Some(block) {
            self.values.retain(|(_, scope), _| *scope != Scope::PerBlock);
            self.block = Some(block);
        }
    }

    /// Activates `session`; per-session and per-block values are dropped on change.
    pub fn set_session(&mut self, session: &str) {
        if self.session.as_deref() != Some(session) {
            self.values.clear();
            self.block = None;
            self.session = Some(session.to_string());
        }
    }

    pub fn get(&self, name: &str, scope: Scope) -> Option<f64> {
        if scope == Scope::PerTrial {
            return None;
        }
        self.values.get(&(name.to_string(), scope)).copied()
    }

    pub fn insert(&mut self, name: &str, scope: Scope, value: f64) {
        if scope != Scope::PerTrial {
            self.values.insert((name.to_string(), scope), value);
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

fn draw_unit<R: Rng>(rng: &mut R) -> f64 {
    rng.random::<f64>()
}

/// Inverse-CDF categorical draw: first index whose cumulative probability reaches `r`.
///
/// Zero-probability categories are never returned, so `r == 0.0` selects the first category with
/// a positive probability rather than index 0.
pub fn inverse_cdf(probabilities: &[f64], r: f64) -> usize {
    let mut cumulative = 0.;
    for (i, p) in probabilities.iter().enumerate() {
        cumulative += p;
        if *p > 0. && cumulative >= r {
            return i;
        }
    }
    // Floating-point slack: r above the (slightly < 1) total falls on the last possible category
    probabilities
        .iter()
        .rposition(|p| *p > 0.)
        .unwrap_or_else(|| probabilities.len().saturating_sub(1))
}

fn draw<R: Rng>(dist: &Distribution, rng: &mut R) -> f64 {
    match dist {
        Distribution::Uniform { min, max } => min + (max - min) * draw_unit(rng),
        Distribution::Normal { mean, std } => {
            // Box-Muller, u1 in (0, 1]
            let u1 = 1. - draw_unit(rng);
            let u2 = draw_unit(rng);
            let z = (-2. * u1.ln()).sqrt() * (2. * std::f64::consts::PI * u2).cos();
            mean + std * z
        }
        Distribution::Loguniform { min, max } => {
            let (lo, hi) = (min.ln(), max.ln());
            (lo + (hi - lo) * draw_unit(rng)).exp()
        }
        Distribution::Categorical {
            categories,
            probabilities,
        } => categories[inverse_cdf(probabilities, draw_unit(rng))],
    }
}

/// Random-stream manager plus scope cache: the single entry point for randomness.
pub struct SamplingContext {
    pub streams: RngStreams,
    pub cache: ScopeCache,
}

impl SamplingContext {
    pub fn new(master_seed: u64) -> Self {
        Self {
            streams: RngStreams::new(master_seed),
            cache: ScopeCache::new(),
        }
    }

    pub fn master_seed(&self) -> u64 {
        self.streams.master_seed()
    }

    pub fn stream(&mut self, name: &str) -> &mut Pcg64 {
        self.streams.stream(name)
    }

    pub fn set_block(&mut self, block: usize) {
        self.cache.set_block(block);
    }

    pub fn set_session(&mut self, session: &str) {
        self.cache.set_session(session);
    }

    /// Resolves `field`, drawing from the stream named after `param_name`.
    pub fn sample(&mut self, field: &NumericField, param_name: &str) -> Result<f64> {
        self.sample_from(field, param_name, param_name)
    }

    /// Resolves `field` from stream `stream_name`, honoring its scope.
    ///
    /// Scalars never touch a stream. Cached values are returned without advancing anything;
    /// otherwise the stream advances by exactly one draw.
    pub fn sample_from(&mut self, field: &NumericField, param_name: &str, stream_name: &str) -> Result<f64> {
        let spec = match field {
            NumericField::Scalar(value) => return Ok(*value),
            NumericField::Distribution(spec) => spec,
        };
        if let Some(value) = self.cache.get(param_name, spec.scope) {
            return Ok(value);
        }
        let mut report = ValidationReport::new();
        field.validate(param_name, &mut report);
        report.into_result()?;

        let value = draw(&spec.dist, self.streams.stream(stream_name));
        self.cache.insert(param_name, spec.scope, value);
        Ok(value)
    }
}
