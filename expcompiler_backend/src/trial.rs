//! Trial plans: the output of the paradigm adapters, before absolute timing is assigned.
//!
//! A [`TrialPlan`] is an ordered sequence of [`Trial`]s, each holding its own [`Element`]s with
//! onsets relative to the trial start. The [`pattern`](crate::pattern) module turns a plan into an
//! absolutely-timed [`ElementTable`](crate::pattern::ElementTable).

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::paradigm::{ParadigmKind, SelectionMode};

/// Stimulus reference carried by omission outcomes; never looked up in the library.
pub const OMISSION_REF: &str = "__omission__";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Cue,
    Outcome,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Role::Cue => "cue",
                Role::Outcome => "outcome",
            }
        )
    }
}

/// Smallest schedulable unit: one stimulus presentation relative to its trial start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub stimulus_ref: String,
    pub scheduled_onset_ms: f64,
    pub duration_ms: f64,
    pub role: Option<Role>,
    pub symbol: Option<char>,
    pub ttl_code: Option<u32>,
    pub is_omission: bool,
}

impl Element {
    pub fn new(stimulus_ref: &str, scheduled_onset_ms: f64, duration_ms: f64) -> Self {
        Self {
            stimulus_ref: stimulus_ref.to_string(),
            scheduled_onset_ms,
            duration_ms,
            role: None,
            symbol: None,
            ttl_code: None,
            is_omission: false,
        }
    }

    /// Zero-duration placeholder for a probabilistically omitted outcome.
    pub fn omission(scheduled_onset_ms: f64) -> Self {
        Self {
            is_omission: true,
            ..Self::new(OMISSION_REF, scheduled_onset_ms, 0.)
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_symbol(mut self, symbol: char) -> Self {
        self.symbol = Some(symbol);
        self
    }

    pub fn with_ttl_code(mut self, code: Option<u32>) -> Self {
        self.ttl_code = code;
        self
    }

    pub fn end_ms(&self) -> f64 {
        self.scheduled_onset_ms + self.duration_ms
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub trial_index: usize,
    pub label: String,
    pub code: Option<u32>,
    /// ITI drawn for this trial; falls back to the plan's `iti_ms` when absent.
    pub iti_ms: Option<f64>,
    pub elements: Vec<Element>,
}

impl Trial {
    /// Span of the trial: latest element end relative to the trial start.
    pub fn span_ms(&self) -> f64 {
        self.elements
            .iter()
            .map(|el| el.end_ms())
            .fold(0., f64::max)
    }
}

/// Provenance of a plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub paradigm: ParadigmKind,
    pub selection_mode: SelectionMode,
    pub seed: Option<u64>,
    pub label_counts: IndexMap<String, usize>,
    /// `false` when a `max_consecutive_*` constraint could not be fully repaired.
    pub constraints_satisfied: bool,
}

/// Immutable result of one adapter invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialPlan {
    pub n_trials: usize,
    pub iti_ms: f64,
    pub refractory_ms: f64,
    pub trials: Vec<Trial>,
    pub metadata: PlanMetadata,
}

impl TrialPlan {
    pub fn labels(&self) -> Vec<&str> {
        self.trials.iter().map(|t| t.label.as_str()).collect()
    }

    pub fn count_label(&self, label: &str) -> usize {
        self.trials.iter().filter(|t| t.label == label).count()
    }

    pub fn n_elements(&self) -> usize {
        self.trials.iter().map(|t| t.elements.len()).sum()
    }
}
