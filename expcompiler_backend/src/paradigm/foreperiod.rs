//! Foreperiod paradigm: a cue, then after a sampled foreperiod an outcome (possibly omitted).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::*;

/// Name of the random stream used for foreperiods.
pub const FOREPERIOD_STREAM: &str = "foreperiod";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CueDef {
    pub stimulus_ref: String,
    pub duration_ms: NumericField,
    #[serde(default)]
    pub code: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutcomeDef {
    pub label: String,
    #[serde(default)]
    pub stimulus_ref: Option<String>,
    pub probability: f64,
    #[serde(default)]
    pub code: Option<u32>,
    #[serde(default)]
    pub duration_ms: Option<NumericField>,
    #[serde(default)]
    pub is_omission: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForeperiodConfig {
    pub cue: CueDef,
    pub outcomes: Vec<OutcomeDef>,
    pub foreperiod: NumericField,
    pub selection: SelectionConfig,
    pub iti: NumericField,
    #[serde(default = "default_constraints")]
    pub constraints: IndexMap<String, usize>,
    #[serde(default)]
    pub refractory_ms: f64,
}

impl ForeperiodConfig {
    fn labels(&self) -> Vec<&str> {
        self.outcomes.iter().map(|o| o.label.as_str()).collect()
    }

    fn probabilities(&self) -> Vec<f64> {
        self.outcomes.iter().map(|o| o.probability).collect()
    }

    fn outcome_element(outcome: &OutcomeDef, onset_ms: f64) -> Element {
        let element = match (&outcome.stimulus_ref, &outcome.duration_ms) {
            (Some(stimulus_ref), Some(duration)) if !outcome.is_omission => {
                Element::new(stimulus_ref, onset_ms, compute_moments(duration).mean)
            }
            _ => Element::omission(onset_ms),
        };
        element.with_role(Role::Outcome).with_ttl_code(outcome.code)
    }
}

impl ParadigmAdapter for ForeperiodConfig {
    fn kind(&self) -> ParadigmKind {
        ParadigmKind::Foreperiod
    }

    fn validate(&self) -> Result<()> {
        let mut report = ValidationReport::new();
        validate_design(
            self.kind(),
            &self.labels(),
            &self.probabilities(),
            &self.selection,
            &self.iti,
            self.refractory_ms,
            &self.constraints,
            &mut report,
        );
        if self.cue.stimulus_ref.is_empty() {
            report.push(ValidationIssue::new("cue.stimulus_ref", IssueKind::Missing, "cue needs a stimulus_ref"));
        }
        self.cue.duration_ms.validate("cue.duration_ms", &mut report);
        if !(compute_moments(&self.cue.duration_ms).mean > 0.) {
            report.push(ValidationIssue::new(
                "cue.duration_ms",
                IssueKind::InvalidValue,
                "cue duration must be positive",
            ));
        }
        self.foreperiod.validate("foreperiod", &mut report);
        for (i, outcome) in self.outcomes.iter().enumerate() {
            if outcome.is_omission {
                continue;
            }
            match (&outcome.stimulus_ref, &outcome.duration_ms) {
                (Some(stimulus_ref), Some(duration)) => {
                    if stimulus_ref.is_empty() {
                        report.push(ValidationIssue::new(
                            format!("outcomes[{i}].stimulus_ref"),
                            IssueKind::Missing,
                            "stimulus_ref must not be empty",
                        ));
                    }
                    duration.validate(&format!("outcomes[{i}].duration_ms"), &mut report);
                }
                (None, _) => report.push(ValidationIssue::new(
                    format!("outcomes[{i}].stimulus_ref"),
                    IssueKind::Missing,
                    "non-omission outcomes need a stimulus_ref",
                )),
                (_, None) => report.push(ValidationIssue::new(
                    format!("outcomes[{i}].duration_ms"),
                    IssueKind::Missing,
                    "non-omission outcomes need a duration_ms",
                )),
            }
        }
        report.into_result()
    }

    fn generate_trial_plan(&self, n_trials: usize, ctx: &mut SamplingContext) -> Result<TrialPlan> {
        self.validate()?;
        let labels = self.labels();
        let (sequence, constraints_satisfied) = select_conditions(
            &labels,
            &self.probabilities(),
            &self.selection,
            &self.constraints,
            n_trials,
            ctx,
        );
        let cue_duration = compute_moments(&self.cue.duration_ms).mean;

        let mut trials = Vec::with_capacity(sequence.len());
        for (trial_index, &outcome_idx) in sequence.iter().enumerate() {
            let outcome = &self.outcomes[outcome_idx];
            let foreperiod_ms = ctx
                .sample_from(&self.foreperiod, "foreperiod", FOREPERIOD_STREAM)?
                .max(0.);
            let cue = Element::new(&self.cue.stimulus_ref, 0., cue_duration)
                .with_role(Role::Cue)
                .with_ttl_code(self.cue.code);
            trials.push(Trial {
                trial_index,
                label: outcome.label.clone(),
                code: outcome.code,
                iti_ms: Some(sample_iti(&self.iti, ctx)?),
                elements: vec![cue, Self::outcome_element(outcome, foreperiod_ms)],
            });
        }
        tracing::debug!("Foreperiod plan: {} trials", trials.len());

        Ok(TrialPlan {
            n_trials: trials.len(),
            iti_ms: compute_moments(&self.iti).mean,
            refractory_ms: self.refractory_ms,
            metadata: PlanMetadata {
                paradigm: self.kind(),
                selection_mode: self.selection.mode,
                seed: self.selection.seed,
                label_counts: label_counts(&labels, &sequence),
                constraints_satisfied,
            },
            trials,
        })
    }
}
