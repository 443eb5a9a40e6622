//! Paradigm adapters: turn a high-level probabilistic trial design into a [`TrialPlan`].
//!
//! ## Overview
//!
//! Three paradigms are supported, forming the closed set [`ParadigmKind`]:
//!
//! 1. [`OddballConfig`]: one stimulus per trial, chosen among weighted tokens.
//! 2. [`LocalGlobalConfig`]: a pattern string (e.g. `"AAAB"`) per trial, one element per symbol
//!    spaced by an inter-onset interval.
//! 3. [`ForeperiodConfig`]: a cue followed, after a sampled foreperiod, by an outcome which may be
//!    an omission.
//!
//! Every adapter implements [`ParadigmAdapter`]: [`ParadigmAdapter::validate`] collects every
//! configuration problem into one report, and [`ParadigmAdapter::generate_trial_plan`] validates
//! before touching any random stream, so a rejected configuration never consumes randomness.
//! [`ParadigmConfig`] wraps the three configurations and dispatches by a static `match`.
//!
//! Trial-type selection (`iid`, `balanced_shuffle`, `csv_preset`) and the `max_consecutive_<label>`
//! constraint repair are shared and live in [`selection`].

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

pub mod foreperiod;
pub mod local_global;
pub mod oddball;
pub mod selection;

pub use foreperiod::*;
pub use local_global::*;
pub use oddball::*;
pub use selection::*;

use crate::error::*;
use crate::sampling::*;
use crate::trial::*;

/// Name of the random stream used for trial-type selection.
pub const SELECTION_STREAM: &str = "selection";
/// Name of the random stream used for inter-trial intervals.
pub const ITI_STREAM: &str = "iti";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParadigmKind {
    Oddball,
    LocalGlobal,
    Foreperiod,
}

impl fmt::Display for ParadigmKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ParadigmKind::Oddball => "oddball",
                ParadigmKind::LocalGlobal => "local_global",
                ParadigmKind::Foreperiod => "foreperiod",
            }
        )
    }
}

/// Common interface of the paradigm adapters.
pub trait ParadigmAdapter {
    fn kind(&self) -> ParadigmKind;

    /// Checks the whole configuration, reporting every problem at once.
    fn validate(&self) -> Result<()>;

    /// Validates, then expands the configuration into `n_trials` trials.
    fn generate_trial_plan(&self, n_trials: usize, ctx: &mut SamplingContext) -> Result<TrialPlan>;
}

/// A paradigm configuration of any supported kind, tagged by `"paradigm"` in JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "paradigm", rename_all = "snake_case")]
pub enum ParadigmConfig {
    Oddball(OddballConfig),
    LocalGlobal(LocalGlobalConfig),
    Foreperiod(ForeperiodConfig),
}

impl ParadigmConfig {
    /// Parses a configuration; unknown or malformed fields become a configuration error.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CompilerError::parse("$", e))
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| CompilerError::parse("$", e))
    }
}

impl ParadigmAdapter for ParadigmConfig {
    fn kind(&self) -> ParadigmKind {
        match self {
            ParadigmConfig::Oddball(_) => ParadigmKind::Oddball,
            ParadigmConfig::LocalGlobal(_) => ParadigmKind::LocalGlobal,
            ParadigmConfig::Foreperiod(_) => ParadigmKind::Foreperiod,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            ParadigmConfig::Oddball(cfg) => cfg.validate(),
            ParadigmConfig::LocalGlobal(cfg) => cfg.validate(),
            ParadigmConfig::Foreperiod(cfg) => cfg.validate(),
        }
    }

    fn generate_trial_plan(&self, n_trials: usize, ctx: &mut SamplingContext) -> Result<TrialPlan> {
        match self {
            ParadigmConfig::Oddball(cfg) => cfg.generate_trial_plan(n_trials, ctx),
            ParadigmConfig::LocalGlobal(cfg) => cfg.generate_trial_plan(n_trials, ctx),
            ParadigmConfig::Foreperiod(cfg) => cfg.generate_trial_plan(n_trials, ctx),
        }
    }
}

static CONSTRAINT_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^max_consecutive_(.+)$").unwrap());

/// Extracts `<label>` from a `max_consecutive_<label>` constraint key.
pub fn constraint_label(key: &str) -> Option<&str> {
    CONSTRAINT_KEY
        .captures(key)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Validation shared by all paradigms: condition labels, probabilities, selection block,
/// ITI, refractory gap and constraint keys.
pub(crate) fn validate_design(
    kind: ParadigmKind,
    labels: &[&str],
    probabilities: &[f64],
    selection: &SelectionConfig,
    iti: &NumericField,
    refractory_ms: f64,
    constraints: &IndexMap<String, usize>,
    report: &mut ValidationReport,
) {
    let list_path = match kind {
        ParadigmKind::Oddball => "tokens",
        ParadigmKind::LocalGlobal => "patterns",
        ParadigmKind::Foreperiod => "outcomes",
    };
    if labels.is_empty() {
        report.push(ValidationIssue::new(
            list_path,
            IssueKind::Missing,
            format!("{kind} requires at least one entry in '{list_path}'"),
        ));
    } else {
        check_probabilities(&format!("{list_path}[*].probability"), probabilities, report);
    }
    for (i, label) in labels.iter().enumerate() {
        if label.is_empty() {
            report.push(ValidationIssue::new(
                format!("{list_path}[{i}].label"),
                IssueKind::Missing,
                "label must not be empty",
            ));
        }
        if labels[..i].contains(label) {
            report.push(
                ValidationIssue::new(format!("{list_path}[{i}].label"), IssueKind::InvalidValue, "duplicate label")
                    .with_value(label),
            );
        }
    }

    match selection.mode {
        SelectionMode::CsvPreset if kind != ParadigmKind::Oddball => {
            report.push(
                ValidationIssue::new("selection.mode", IssueKind::Unsupported, "csv_preset is only supported by oddball")
                    .with_value(selection.mode)
                    .with_expected("iid | balanced_shuffle"),
            );
        }
        SelectionMode::CsvPreset => match &selection.sequence {
            None => report.push(ValidationIssue::new(
                "selection.sequence",
                IssueKind::Missing,
                "csv_preset requires a sequence of token indices",
            )),
            Some(sequence) if sequence.is_empty() => report.push(ValidationIssue::new(
                "selection.sequence",
                IssueKind::InvalidValue,
                "csv_preset sequence must not be empty",
            )),
            Some(sequence) => {
                for (i, idx) in sequence.iter().enumerate() {
                    if *idx >= labels.len() {
                        report.push(
                            ValidationIssue::new(
                                format!("selection.sequence[{i}]"),
                                IssueKind::InvalidValue,
                                "token index out of range",
                            )
                            .with_value(idx)
                            .with_expected(format!("< {}", labels.len())),
                        );
                    }
                }
            }
        },
        SelectionMode::Iid | SelectionMode::BalancedShuffle => {}
    }

    iti.validate("iti", report);
    if !(refractory_ms >= 0.) {
        report.push(
            ValidationIssue::new("refractory_ms", IssueKind::InvalidValue, "refractory gap must be >= 0")
                .with_value(refractory_ms),
        );
    }

    for key in constraints.keys() {
        match constraint_label(key) {
            Some(label) if labels.contains(&label) => {}
            Some(label) => report.push(
                ValidationIssue::new(
                    format!("constraints.{key}"),
                    IssueKind::UnknownReference,
                    format!("constraint refers to unknown label '{label}'"),
                )
                .with_expected(labels.join(" | ")),
            ),
            None => report.push(
                ValidationIssue::new(
                    format!("constraints.{key}"),
                    IssueKind::Unsupported,
                    "unrecognized constraint",
                )
                .with_expected("max_consecutive_<label>"),
            ),
        }
    }
}

/// Picks the condition index of every trial and applies the constraint repairs.
///
/// Returns the sequence and whether every constraint ended up satisfied.
pub(crate) fn select_conditions(
    labels: &[&str],
    probabilities: &[f64],
    selection: &SelectionConfig,
    constraints: &IndexMap<String, usize>,
    n_trials: usize,
    ctx: &mut SamplingContext,
) -> (Vec<usize>, bool) {
    if let Some(seed) = selection.seed {
        ctx.streams.reseed(SELECTION_STREAM, seed);
    }
    let rng = ctx.stream(SELECTION_STREAM);
    let mut sequence = match selection.mode {
        SelectionMode::Iid => iid(probabilities, n_trials, rng),
        SelectionMode::BalancedShuffle => balanced_shuffle(probabilities, n_trials, rng),
        SelectionMode::CsvPreset => csv_preset(selection.sequence.as_deref().unwrap_or(&[]), n_trials),
    };

    let mut satisfied = true;
    for (key, limit) in constraints {
        let Some(target) = constraint_label(key).and_then(|label| labels.iter().position(|l| *l == label)) else {
            continue;
        };
        if !repair_max_consecutive(&mut sequence, target, *limit) {
            tracing::warn!(
                "Constraint {} = {} could not be fully repaired (longest run {})",
                key,
                limit,
                max_run(&sequence, target)
            );
            satisfied = false;
        }
    }
    (sequence, satisfied)
}

/// Draws the ITI of one trial, clamped at zero.
pub(crate) fn sample_iti(iti: &NumericField, ctx: &mut SamplingContext) -> Result<f64> {
    Ok(ctx.sample_from(iti, "iti", ITI_STREAM)?.max(0.))
}

pub(crate) fn label_counts(labels: &[&str], sequence: &[usize]) -> IndexMap<String, usize> {
    let mut counts: IndexMap<String, usize> = labels.iter().map(|l| (l.to_string(), 0)).collect();
    for &idx in sequence {
        if let Some(count) = counts.get_index_mut(idx).map(|(_, c)| c) {
            *count += 1;
        }
    }
    counts
}

pub(crate) fn default_constraints() -> IndexMap<String, usize> {
    IndexMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_keys_parse() {
        assert_eq!(constraint_label("max_consecutive_deviant"), Some("deviant"));
        assert_eq!(constraint_label("max_consecutive_"), None);
        assert_eq!(constraint_label("min_gap_deviant"), None);
    }

    #[test]
    fn constraint_keys_parse_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|i| std::thread::spawn(move || constraint_label(&format!("max_consecutive_tone_{i}")).map(str::to_string)))
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), Some(format!("tone_{i}")));
        }
    }

    #[test]
    fn config_is_tagged_by_paradigm() {
        let cfg = ParadigmConfig::from_json_str(
            r#"{
                "paradigm": "oddball",
                "tokens": [
                    {"label": "standard", "stimulus_ref": "std", "probability": 0.8, "code": 1, "duration_ms": 50},
                    {"label": "deviant", "stimulus_ref": "dev", "probability": 0.2, "code": 2, "duration_ms": 50}
                ],
                "selection": {"mode": "balanced_shuffle"},
                "iti": 500
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.kind(), ParadigmKind::Oddball);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_selection_mode_is_a_config_error() {
        let err = ParadigmConfig::from_json_str(
            r#"{"paradigm": "oddball", "tokens": [], "selection": {"mode": "roundrobin"}, "iti": 500}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompilerError::InvalidConfig(_)));
    }
}
