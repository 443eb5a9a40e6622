//! Oddball paradigm: one stimulus per trial, drawn among weighted tokens.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::*;

/// One trial type of an oddball design.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OddballToken {
    pub label: String,
    /// `None` makes this an omission token: its trials contain no element.
    #[serde(default)]
    pub stimulus_ref: Option<String>,
    pub probability: f64,
    #[serde(default)]
    pub code: Option<u32>,
    #[serde(default = "default_duration")]
    pub duration_ms: NumericField,
}

fn default_duration() -> NumericField {
    NumericField::Scalar(0.)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OddballConfig {
    pub tokens: Vec<OddballToken>,
    pub selection: SelectionConfig,
    pub iti: NumericField,
    #[serde(default = "default_constraints")]
    pub constraints: IndexMap<String, usize>,
    #[serde(default)]
    pub refractory_ms: f64,
}

impl OddballConfig {
    fn labels(&self) -> Vec<&str> {
        self.tokens.iter().map(|t| t.label.as_str()).collect()
    }

    fn probabilities(&self) -> Vec<f64> {
        self.tokens.iter().map(|t| t.probability).collect()
    }
}

impl ParadigmAdapter for OddballConfig {
    fn kind(&self) -> ParadigmKind {
        ParadigmKind::Oddball
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
        for (i, token) in self.tokens.iter().enumerate() {
            let path = format!("tokens[{i}].duration_ms");
            token.duration_ms.validate(&path, &mut report);
            if token.stimulus_ref.is_some() && !(compute_moments(&token.duration_ms).mean > 0.) {
                report.push(
                    ValidationIssue::new(path, IssueKind::InvalidValue, "stimulus tokens need a positive duration")
                        .with_value(compute_moments(&token.duration_ms).mean),
                );
            }
            if matches!(&token.stimulus_ref, Some(r) if r.is_empty()) {
                report.push(ValidationIssue::new(
                    format!("tokens[{i}].stimulus_ref"),
                    IssueKind::Missing,
                    "stimulus_ref must not be empty",
                ));
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

        let mut trials = Vec::with_capacity(sequence.len());
        for (trial_index, &token_idx) in sequence.iter().enumerate() {
            let token = &self.tokens[token_idx];
            let elements = match &token.stimulus_ref {
                Some(stimulus_ref) => vec![Element::new(
                    stimulus_ref,
                    0.,
                    compute_moments(&token.duration_ms).mean,
                )
                .with_ttl_code(token.code)],
                None => Vec::new(),
            };
            trials.push(Trial {
                trial_index,
                label: token.label.clone(),
                code: token.code,
                iti_ms: Some(sample_iti(&self.iti, ctx)?),
                elements,
            });
        }
        tracing::debug!("Oddball plan: {} trials over {} tokens", trials.len(), labels.len());

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

#[cfg(test)]
mod tests {
    use super::*;

    fn standard_deviant(mode: SelectionMode) -> OddballConfig {
        OddballConfig {
            tokens: vec![
                OddballToken {
                    label: "standard".into(),
                    stimulus_ref: Some("std".into()),
                    probability: 0.8,
                    code: Some(1),
                    duration_ms: 50.0.into(),
                },
                OddballToken {
                    label: "deviant".into(),
                    stimulus_ref: Some("dev".into()),
                    probability: 0.2,
                    code: Some(2),
                    duration_ms: 50.0.into(),
                },
            ],
            selection: SelectionConfig::new(mode),
            iti: 500.0.into(),
            constraints: IndexMap::new(),
            refractory_ms: 0.,
        }
    }

    #[test]
    fn balanced_shuffle_gives_exact_counts_for_any_seed() {
        let cfg = standard_deviant(SelectionMode::BalancedShuffle);
        for seed in [0u64, 1, 17, 12345] {
            let mut ctx = SamplingContext::new(seed);
            let plan = cfg.generate_trial_plan(100, &mut ctx).unwrap();
            assert_eq!(plan.count_label("standard"), 80);
            assert_eq!(plan.count_label("deviant"), 20);
            assert_eq!(plan.metadata.label_counts["deviant"], 20);
        }
    }

    #[test]
    fn balanced_shuffle_keeps_trial_count_with_many_tokens() {
        let mut cfg = standard_deviant(SelectionMode::BalancedShuffle);
        cfg.tokens = (0..4)
            .map(|i| OddballToken {
                label: format!("t{i}"),
                stimulus_ref: Some("std".into()),
                probability: 0.25,
                code: Some(i),
                duration_ms: 50.0.into(),
            })
            .collect();
        for n_trials in 1..6 {
            let plan = cfg.generate_trial_plan(n_trials, &mut SamplingContext::new(5)).unwrap();
            assert_eq!(plan.trials.len(), n_trials);
        }
    }

    #[test]
    fn misspelled_keys_are_rejected() {
        let err = ParadigmConfig::from_json_str(
            r#"{"paradigm": "oddball",
                "tokens": [{"label": "standard", "stimulus_ref": "std", "probability": 0.8},
                           {"label": "deviant", "stimulus_ref": "dev", "probability": 0.2}],
                "selection": {"mode": "balanced_shuffle"}, "iti": 500,
                "constraint": {"max_consecutive_deviant": 1}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompilerError::InvalidConfig(_)));
        assert!(err.to_string().contains("constraint"));

        let token_typo = ParadigmConfig::from_json_str(
            r#"{"paradigm": "oddball",
                "tokens": [{"label": "standard", "stimulus": "std", "probability": 1.0}],
                "selection": {"mode": "iid"}, "iti": 500}"#,
        );
        assert!(token_typo.is_err());
    }

    #[test]
    fn one_element_per_trial_at_onset_zero() {
        let mut ctx = SamplingContext::new(3);
        let plan = standard_deviant(SelectionMode::Iid)
            .generate_trial_plan(20, &mut ctx)
            .unwrap();
        assert_eq!(plan.trials.len(), 20);
        for (i, trial) in plan.trials.iter().enumerate() {
            assert_eq!(trial.trial_index, i);
            assert_eq!(trial.elements.len(), 1);
            assert_eq!(trial.elements[0].scheduled_onset_ms, 0.);
            assert_eq!(trial.elements[0].ttl_code, trial.code);
        }
    }

    #[test]
    fn csv_preset_replays_sequence() {
        let mut cfg = standard_deviant(SelectionMode::CsvPreset);
        cfg.selection.sequence = Some(vec![0, 0, 1]);
        let mut ctx = SamplingContext::new(3);
        let plan = cfg.generate_trial_plan(7, &mut ctx).unwrap();
        assert_eq!(
            plan.labels(),
            vec!["standard", "standard", "deviant", "standard", "standard", "deviant", "standard"]
        );
    }

    #[test]
    fn csv_preset_rejects_out_of_range_indices() {
        let mut cfg = standard_deviant(SelectionMode::CsvPreset);
        cfg.selection.sequence = Some(vec![0, 2]);
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.issues()[0].field_path, "selection.sequence[1]");
    }

    #[test]
    fn rejects_probabilities_not_summing_to_one() {
        let mut cfg = standard_deviant(SelectionMode::Iid);
        cfg.tokens[1].probability = 0.25;
        let mut ctx = SamplingContext::new(0);
        let err = cfg.generate_trial_plan(10, &mut ctx).unwrap_err();
        assert!(matches!(err, CompilerError::InvalidProbabilities(_)));
        // Rejected before any stream was created
        assert!(ctx.streams.stream_names().is_empty());
    }

    #[test]
    fn collects_every_issue() {
        let mut cfg = standard_deviant(SelectionMode::Iid);
        cfg.tokens[1].probability = 0.5;
        cfg.constraints.insert("max_consecutive_target".into(), 2);
        cfg.refractory_ms = -1.;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, CompilerError::InvalidConfig(_)));
        assert_eq!(err.issues().len(), 3);
    }

    #[test]
    fn omission_tokens_have_no_elements() {
        let mut cfg = standard_deviant(SelectionMode::BalancedShuffle);
        cfg.tokens[1].stimulus_ref = None;
        let mut ctx = SamplingContext::new(8);
        let plan = cfg.generate_trial_plan(10, &mut ctx).unwrap();
        assert_eq!(plan.n_elements(), 8);
    }

    #[test]
    fn max_consecutive_constraint_is_applied() {
        let mut cfg = standard_deviant(SelectionMode::BalancedShuffle);
        cfg.constraints.insert("max_consecutive_standard".into(), 4);
        for seed in 0..10 {
            let mut ctx = SamplingContext::new(seed);
            let plan = cfg.generate_trial_plan(50, &mut ctx).unwrap();
            let seq: Vec<usize> = plan
                .trials
                .iter()
                .map(|t| if t.label == "standard" { 0 } else { 1 })
                .collect();
            if plan.metadata.constraints_satisfied {
                assert!(max_run(&seq, 0) <= 4);
            }
            assert_eq!(plan.count_label("deviant"), 10);
        }
    }

    #[test]
    fn same_seed_same_plan() {
        let cfg = standard_deviant(SelectionMode::Iid);
        let a = cfg.generate_trial_plan(40, &mut SamplingContext::new(99)).unwrap();
        let b = cfg.generate_trial_plan(40, &mut SamplingContext::new(99)).unwrap();
        assert_eq!(a, b);
        let c = cfg
            .clone()
            .generate_trial_plan(40, &mut SamplingContext::new(100))
            .unwrap();
        assert_ne!(a.labels(), c.labels());
    }
}
