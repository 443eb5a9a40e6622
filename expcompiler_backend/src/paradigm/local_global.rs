//! Local-global paradigm: each trial plays a pattern of symbols (e.g. `"AAAB"`), one element per
//! character, spaced by the inter-onset interval.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::*;

/// Name of the random stream used for the inter-onset interval.
pub const IOI_STREAM: &str = "ioi";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SymbolDef {
    pub stimulus_ref: String,
    pub duration_ms: NumericField,
    #[serde(default)]
    pub code: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternDef {
    pub label: String,
    pub pattern: String,
    pub probability: f64,
    /// TTL code of the trial, written on its first element.
    #[serde(default)]
    pub code: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalGlobalConfig {
    pub symbols: IndexMap<char, SymbolDef>,
    pub patterns: Vec<PatternDef>,
    pub ioi: NumericField,
    pub selection: SelectionConfig,
    pub iti: NumericField,
    #[serde(default = "default_constraints")]
    pub constraints: IndexMap<String, usize>,
    #[serde(default)]
    pub refractory_ms: f64,
}

impl LocalGlobalConfig {
    fn labels(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.label.as_str()).collect()
    }

    fn probabilities(&self) -> Vec<f64> {
        self.patterns.iter().map(|p| p.probability).collect()
    }

    fn expand_pattern(&self, pattern: &PatternDef, ioi_ms: f64) -> Vec<Element> {
        pattern
            .pattern
            .chars()
            .enumerate()
            .filter_map(|(k, symbol)| {
                let def = self.symbols.get(&symbol)?;
                let code = if k == 0 { pattern.code.or(def.code) } else { def.code };
                Some(
                    Element::new(&def.stimulus_ref, k as f64 * ioi_ms, compute_moments(&def.duration_ms).mean)
                        .with_symbol(symbol)
                        .with_ttl_code(code),
                )
            })
            .collect()
    }
}

impl ParadigmAdapter for LocalGlobalConfig {
    fn kind(&self) -> ParadigmKind {
        ParadigmKind::LocalGlobal
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
        if self.symbols.is_empty() {
            report.push(ValidationIssue::new("symbols", IssueKind::Missing, "at least one symbol is required"));
        }
        for (symbol, def) in &self.symbols {
            let path = format!("symbols.{symbol}.duration_ms");
            def.duration_ms.validate(&path, &mut report);
            if !(compute_moments(&def.duration_ms).mean > 0.) {
                report.push(ValidationIssue::new(path, IssueKind::InvalidValue, "symbol duration must be positive"));
            }
            if def.stimulus_ref.is_empty() {
                report.push(ValidationIssue::new(
                    format!("symbols.{symbol}.stimulus_ref"),
                    IssueKind::Missing,
                    "stimulus_ref must not be empty",
                ));
            }
        }
        for (i, pattern) in self.patterns.iter().enumerate() {
            if pattern.pattern.is_empty() {
                report.push(ValidationIssue::new(
                    format!("patterns[{i}].pattern"),
                    IssueKind::Missing,
                    "pattern must contain at least one symbol",
                ));
            }
            for symbol in pattern.pattern.chars() {
                if !self.symbols.contains_key(&symbol) {
                    report.push(
                        ValidationIssue::new(
                            format!("patterns[{i}].pattern"),
                            IssueKind::UnknownReference,
                            format!("symbol '{symbol}' is not defined"),
                        )
                        .with_value(&pattern.pattern)
                        .with_expected(self.symbols.keys().collect::<String>()),
                    );
                }
            }
        }
        self.ioi.validate("ioi", &mut report);
        if !(compute_moments(&self.ioi).mean >= 0.) {
            report.push(ValidationIssue::new("ioi", IssueKind::InvalidValue, "ioi must be >= 0"));
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
        for (trial_index, &pattern_idx) in sequence.iter().enumerate() {
            let pattern = &self.patterns[pattern_idx];
            let ioi_ms = ctx.sample_from(&self.ioi, "ioi", IOI_STREAM)?.max(0.);
            trials.push(Trial {
                trial_index,
                label: pattern.label.clone(),
                code: pattern.code,
                iti_ms: Some(sample_iti(&self.iti, ctx)?),
                elements: self.expand_pattern(pattern, ioi_ms),
            });
        }
        tracing::debug!(
            "Local-global plan: {} trials, {} elements",
            trials.len(),
            trials.iter().map(|t| t.elements.len()).sum::<usize>()
        );

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

    fn config() -> LocalGlobalConfig {
        serde_json::from_str(
            r#"{
                "symbols": {
                    "A": {"stimulus_ref": "tone_a", "duration_ms": 50, "code": 10},
                    "B": {"stimulus_ref": "tone_b", "duration_ms": 50, "code": 11}
                },
                "patterns": [
                    {"label": "global_standard", "pattern": "AAAB", "probability": 0.8, "code": 1},
                    {"label": "global_deviant", "pattern": "AAAA", "probability": 0.2, "code": 2}
                ],
                "ioi": 100,
                "selection": {"mode": "balanced_shuffle", "seed": 4},
                "iti": {"dist": "uniform", "min": 800, "max": 1200}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn aaab_expands_to_four_spaced_elements() {
        let mut cfg = config();
        cfg.patterns.truncate(1);
        cfg.patterns[0].probability = 1.;
        let plan = cfg.generate_trial_plan(3, &mut SamplingContext::new(0)).unwrap();
        let trial = &plan.trials[0];
        let onsets: Vec<f64> = trial.elements.iter().map(|e| e.scheduled_onset_ms).collect();
        let symbols: Vec<char> = trial.elements.iter().filter_map(|e| e.symbol).collect();
        assert_eq!(onsets, vec![0., 100., 200., 300.]);
        assert_eq!(symbols, vec!['A', 'A', 'A', 'B']);
        // First element carries the pattern code, the rest their symbol codes
        let codes: Vec<Option<u32>> = trial.elements.iter().map(|e| e.ttl_code).collect();
        assert_eq!(codes, vec![Some(1), Some(10), Some(10), Some(11)]);
    }

    #[test]
    fn balanced_patterns() {
        let plan = config().generate_trial_plan(50, &mut SamplingContext::new(1)).unwrap();
        assert_eq!(plan.count_label("global_standard"), 40);
        assert_eq!(plan.count_label("global_deviant"), 10);
        assert!(plan.trials.iter().all(|t| t.iti_ms.unwrap() >= 800. && t.iti_ms.unwrap() < 1200.));
    }

    #[test]
    fn undefined_symbols_are_rejected() {
        let mut cfg = config();
        cfg.patterns[1].pattern = "AAAC".into();
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.issues().len(), 1);
        assert_eq!(err.issues()[0].field_path, "patterns[1].pattern");
        assert_eq!(err.issues()[0].error_type, IssueKind::UnknownReference);
    }

    #[test]
    fn misspelled_keys_are_rejected() {
        let json = r#"{
            "symbols": {"A": {"stimulus_ref": "tone_a", "duration_ms": 50}},
            "patterns": [{"label": "x", "pattern": "AA", "probability": 1.0}],
            "ioi": 100, "selection": {"mode": "iid"}, "iti": 500, "refractory": 50
        }"#;
        let err = serde_json::from_str::<LocalGlobalConfig>(json).unwrap_err();
        assert!(err.to_string().contains("refractory"));

        let symbol_typo = r#"{
            "symbols": {"A": {"stimulus_ref": "tone_a", "duration_ms": 50, "ttl": 3}},
            "patterns": [{"label": "x", "pattern": "AA", "probability": 1.0}],
            "ioi": 100, "selection": {"mode": "iid"}, "iti": 500
        }"#;
        assert!(serde_json::from_str::<LocalGlobalConfig>(symbol_typo).is_err());
    }

    #[test]
    fn csv_preset_is_not_supported() {
        let mut cfg = config();
        cfg.selection.mode = SelectionMode::CsvPreset;
        assert!(cfg.validate().is_err());
    }
}
