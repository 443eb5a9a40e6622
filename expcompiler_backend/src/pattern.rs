//! Pattern builder: flattens a [`TrialPlan`] into an absolutely-timed [`ElementTable`].
//!
//! Trials are walked in order with a running trial-start cursor:
//!
//! - each element starts at `trial_start + scheduled_onset_ms`;
//! - a trial ends at `trial_start + max(onset + duration)` over its elements;
//! - the next trial starts at `trial_end + refractory_ms + iti_ms`.
//!
//! A trial without elements occupies no rows and advances the cursor by its ITI only.
//! Because trials are processed in order and onsets within a trial are non-negative, rows come
//! out sorted by trial and element; [`ElementTable::is_time_ordered`] checks the onset order.

use serde::{Deserialize, Serialize};

use crate::trial::*;

/// One element with absolute timing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementRow {
    pub block_index: usize,
    pub trial_index: usize,
    pub element_index: usize,
    pub stimulus_ref: String,
    pub absolute_onset_ms: f64,
    pub duration_ms: f64,
    pub role: Option<Role>,
    pub symbol: Option<char>,
    pub ttl_code: Option<u32>,
    pub is_omission: bool,
}

impl ElementRow {
    pub fn new(trial_index: usize, element_index: usize, stimulus_ref: &str, absolute_onset_ms: f64, duration_ms: f64) -> Self {
        Self {
            block_index: 0,
            trial_index,
            element_index,
            stimulus_ref: stimulus_ref.to_string(),
            absolute_onset_ms,
            duration_ms,
            role: None,
            symbol: None,
            ttl_code: None,
            is_omission: false,
        }
    }

    pub fn with_ttl_code(mut self, code: u32) -> Self {
        self.ttl_code = Some(code);
        self
    }

    pub fn end_ms(&self) -> f64 {
        self.absolute_onset_ms + self.duration_ms
    }
}

/// Absolute extent of one trial (including trials without elements).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialSpan {
    pub block_index: usize,
    pub trial_index: usize,
    pub label: String,
    pub code: Option<u32>,
    pub start_ms: f64,
    pub end_ms: f64,
    pub n_elements: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementTable {
    pub rows: Vec<ElementRow>,
    pub trials: Vec<TrialSpan>,
}

impl ElementTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from rows directly; one span is derived per distinct trial.
    pub fn from_rows(rows: Vec<ElementRow>) -> Self {
        let mut trials: Vec<TrialSpan> = Vec::new();
        for row in &rows {
            match trials
                .iter_mut()
                .find(|t| t.trial_index == row.trial_index && t.block_index == row.block_index)
            {
                Some(span) => {
                    span.start_ms = span.start_ms.min(row.absolute_onset_ms);
                    span.end_ms = span.end_ms.max(row.end_ms());
                    span.n_elements += 1;
                }
                None => trials.push(TrialSpan {
                    block_index: row.block_index,
                    trial_index: row.trial_index,
                    label: String::new(),
                    code: None,
                    start_ms: row.absolute_onset_ms,
                    end_ms: row.end_ms(),
                    n_elements: 1,
                }),
            }
        }
        Self { rows, trials }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn n_trials(&self) -> usize {
        self.trials.len()
    }

    /// Latest end time over all rows and trial spans, in ms.
    pub fn end_ms(&self) -> f64 {
        let rows_end = self.rows.iter().map(|r| r.end_ms()).fold(0., f64::max);
        let trials_end = self.trials.iter().map(|t| t.end_ms).fold(0., f64::max);
        rows_end.max(trials_end)
    }

    pub fn is_time_ordered(&self) -> bool {
        self.rows
            .windows(2)
            .all(|w| w[0].absolute_onset_ms <= w[1].absolute_onset_ms)
    }

    /// Appends `other` as block `block_index`, starting `gap_ms` after the end of this table.
    ///
    /// Trial indices of `other` are renumbered to continue after the last trial of `self`.
    pub fn append_block(&mut self, other: ElementTable, block_index: usize, gap_ms: f64) {
        let offset_ms = if self.trials.is_empty() && self.rows.is_empty() {
            0.
        } else {
            self.end_ms() + gap_ms
        };
        let first_trial = self.trials.iter().map(|t| t.trial_index + 1).max().unwrap_or(0);
        self.rows.extend(other.rows.into_iter().map(|mut row| {
            row.block_index = block_index;
            row.trial_index += first_trial;
            row.absolute_onset_ms += offset_ms;
            row
        }));
        self.trials.extend(other.trials.into_iter().map(|mut span| {
            span.block_index = block_index;
            span.trial_index += first_trial;
            span.start_ms += offset_ms;
            span.end_ms += offset_ms;
            span
        }));
    }
}

/// Flattens `plan` into an [`ElementTable`].
pub fn build(plan: &TrialPlan) -> ElementTable {
    let mut table = ElementTable::new();
    let mut trial_start = 0.;
    for trial in &plan.trials {
        let iti_ms = trial.iti_ms.unwrap_or(plan.iti_ms);
        for (element_index, element) in trial.elements.iter().enumerate() {
            table.rows.push(ElementRow {
                block_index: 0,
                trial_index: trial.trial_index,
                element_index,
                stimulus_ref: element.stimulus_ref.clone(),
                absolute_onset_ms: trial_start + element.scheduled_onset_ms,
                duration_ms: element.duration_ms,
                role: element.role,
                symbol: element.symbol,
                ttl_code: element.ttl_code,
                is_omission: element.is_omission,
            });
        }
        let trial_end = trial_start + trial.span_ms();
        table.trials.push(TrialSpan {
            block_index: 0,
            trial_index: trial.trial_index,
            label: trial.label.clone(),
            code: trial.code,
            start_ms: trial_start,
            end_ms: trial_end,
            n_elements: trial.elements.len(),
        });
        trial_start = if trial.elements.is_empty() {
            trial_start + iti_ms
        } else {
            trial_end + plan.refractory_ms + iti_ms
        };
    }
    tracing::debug!(
        "Built element table: {} rows over {} trials, ends at {} ms",
        table.len(),
        table.n_trials(),
        table.end_ms()
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paradigm::*;
    use crate::sampling::SamplingContext;
    use indexmap::IndexMap;

    fn plan(trials: Vec<Trial>, iti_ms: f64, refractory_ms: f64) -> TrialPlan {
        TrialPlan {
            n_trials: trials.len(),
            iti_ms,
            refractory_ms,
            trials,
            metadata: PlanMetadata {
                paradigm: ParadigmKind::Oddball,
                selection_mode: SelectionMode::Iid,
                seed: None,
                label_counts: IndexMap::new(),
                constraints_satisfied: true,
            },
        }
    }

    fn trial(trial_index: usize, elements: Vec<Element>) -> Trial {
        Trial {
            trial_index,
            label: "t".into(),
            code: None,
            iti_ms: None,
            elements,
        }
    }

    #[test]
    fn next_trial_starts_after_span_refractory_and_iti() {
        let p = plan(
            vec![
                trial(0, vec![Element::new("a", 0., 50.), Element::new("b", 100., 50.)]),
                trial(1, vec![Element::new("a", 0., 50.)]),
            ],
            500.,
            20.,
        );
        let table = build(&p);
        assert_eq!(table.len(), 3);
        assert_eq!(table.rows[1].absolute_onset_ms, 100.);
        assert_eq!(table.rows[1].element_index, 1);
        // 150 (span) + 20 (refractory) + 500 (iti)
        assert_eq!(table.rows[2].absolute_onset_ms, 670.);
        assert_eq!(table.trials[1].start_ms, 670.);
        assert!(table.is_time_ordered());
    }

    #[test]
    fn empty_trials_advance_by_iti_only() {
        let p = plan(
            vec![
                trial(0, vec![Element::new("a", 0., 50.)]),
                trial(1, vec![]),
                trial(2, vec![Element::new("a", 0., 50.)]),
            ],
            300.,
            10.,
        );
        let table = build(&p);
        assert_eq!(table.len(), 2);
        assert_eq!(table.n_trials(), 3);
        // trial 1 starts at 50+10+300 = 360, trial 2 at 360+300
        assert_eq!(table.trials[1].start_ms, 360.);
        assert_eq!(table.rows[1].absolute_onset_ms, 660.);
    }

    #[test]
    fn per_trial_iti_overrides_plan_iti() {
        let mut t0 = trial(0, vec![Element::new("a", 0., 10.)]);
        t0.iti_ms = Some(90.);
        let p = plan(vec![t0, trial(1, vec![Element::new("a", 0., 10.)])], 1000., 0.);
        assert_eq!(build(&p).rows[1].absolute_onset_ms, 100.);
    }

    #[test]
    fn preserves_role_and_symbol() {
        let p = plan(
            vec![trial(
                0,
                vec![
                    Element::new("cue", 0., 10.).with_role(Role::Cue),
                    Element::new("a", 20., 10.).with_symbol('A').with_ttl_code(Some(4)),
                ],
            )],
            0.,
            0.,
        );
        let table = build(&p);
        assert_eq!(table.rows[0].role, Some(Role::Cue));
        assert_eq!(table.rows[1].symbol, Some('A'));
        assert_eq!(table.rows[1].ttl_code, Some(4));
    }

    #[test]
    fn onsets_are_monotonic_for_generated_plans() {
        let cfg = ParadigmConfig::from_json_str(
            r#"{
                "paradigm": "local_global",
                "symbols": {"A": {"stimulus_ref": "a", "duration_ms": 50}, "B": {"stimulus_ref": "b", "duration_ms": 50}},
                "patterns": [{"label": "x", "pattern": "AAAB", "probability": 0.5}, {"label": "y", "pattern": "AB", "probability": 0.5}],
                "ioi": {"dist": "uniform", "min": 80, "max": 150},
                "selection": {"mode": "iid"},
                "iti": {"dist": "normal", "mean": 600, "std": 200},
                "refractory_ms": 25
            }"#,
        )
        .unwrap();
        for seed in 0..10 {
            let p = cfg.generate_trial_plan(30, &mut SamplingContext::new(seed)).unwrap();
            let table = build(&p);
            assert!(table.is_time_ordered());
            // Elements of different trials are separated by at least the refractory gap
            for pair in table.trials.windows(2) {
                assert!(pair[1].start_ms - pair[0].end_ms >= 25. - 1e-9);
            }
        }
    }

    #[test]
    fn append_block_renumbers_and_shifts() {
        let p = plan(vec![trial(0, vec![Element::new("a", 0., 100.)])], 0., 0.);
        let mut table = build(&p);
        table.append_block(build(&p), 1, 400.);
        assert_eq!(table.rows[1].trial_index, 1);
        assert_eq!(table.rows[1].block_index, 1);
        assert_eq!(table.rows[1].absolute_onset_ms, 500.);
    }
}
