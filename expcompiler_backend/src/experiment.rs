//! The experiment module provides the highest level of abstraction of the compiler: an ordered
//! sequence of paradigm blocks played with one stimulus library, compiled into a single
//! [`SequenceArtifact`].
//!
//! ## Overview
//!
//! The behavior of the [`Experiment`] struct is defined by the [`BaseExperiment`] trait through
//! default implementations; `Experiment` itself only provides field accessors.
//!
//! Compiling an experiment runs the whole pipeline:
//!
//! 1. A fresh [`SamplingContext`] is created from the experiment's master seed and bound to the
//!    session, so repeated compiles of the same experiment are identical.
//! 2. For each block `i` (in order), the per-block scope is set to `i`, the block's paradigm
//!    adapter generates its [`TrialPlan`], and the pattern builder turns it into an
//!    [`ElementTable`].
//! 3. Block tables are concatenated, each block starting `gap_ms` after the previous one ends.
//! 4. The [`Compiler`] renders the concatenated table.
//!
//! Blocks are always a sequence: a single-block experiment is simply a sequence of length one.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::artifact::SequenceArtifact;
use crate::compiler::*;
use crate::error::*;
use crate::generator::*;
use crate::paradigm::*;
use crate::pattern::{self, ElementTable};
use crate::sampling::SamplingContext;
use crate::trial::TrialPlan;

/// Session identifier used when none is configured.
pub const DEFAULT_SESSION: &str = "session";

/// One block of an experiment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockSpec {
    pub paradigm: ParadigmConfig,
    pub n_trials: usize,
    /// Silence between the end of the previous block and the start of this one.
    #[serde(default)]
    pub gap_ms: f64,
}

impl BlockSpec {
    pub fn new(paradigm: ParadigmConfig, n_trials: usize) -> Self {
        Self {
            paradigm,
            n_trials,
            gap_ms: 0.,
        }
    }

    pub fn with_gap_ms(mut self, gap_ms: f64) -> Self {
        self.gap_ms = gap_ms;
        self
    }
}

fn default_ttl_pulse_samples() -> usize {
    DEFAULT_TTL_PULSE_SAMPLES
}

fn default_session() -> String {
    DEFAULT_SESSION.to_string()
}

/// Serializable description of a whole experiment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Experiment {
    pub master_seed: u64,
    pub fs_hz: f64,
    #[serde(default = "default_session")]
    pub session: String,
    #[serde(default = "default_ttl_pulse_samples")]
    pub ttl_pulse_samples: usize,
    #[serde(default)]
    pub library: StimulusLibrary,
    #[serde(default)]
    pub blocks: Vec<BlockSpec>,
}

/// Defines the behavior of the [`Experiment`] struct through default trait implementations.
///
/// Trait methods are classified into the following categories:
/// 1. Editing: [`add_block`], [`add_stimulus`], [`clear_blocks`]
/// 2. Pipeline: [`validate`], [`trial_plans`], [`element_table`], [`compile`]
/// 3. Field accessors, implemented by the struct: [`blocks`], [`blocks_`], [`library`], [`library_`], ...
///
/// [`add_block`]: BaseExperiment::add_block
/// [`add_stimulus`]: BaseExperiment::add_stimulus
/// [`clear_blocks`]: BaseExperiment::clear_blocks
/// [`validate`]: BaseExperiment::validate
/// [`trial_plans`]: BaseExperiment::trial_plans
/// [`element_table`]: BaseExperiment::element_table
/// [`compile`]: BaseExperiment::compile
/// [`blocks`]: BaseExperiment::blocks
/// [`blocks_`]: BaseExperiment::blocks_
/// [`library`]: BaseExperiment::library
/// [`library_`]: BaseExperiment::library_
pub trait BaseExperiment {
    // FIELD methods
    fn master_seed(&self) -> u64;
    fn fs_hz(&self) -> f64;
    fn session(&self) -> &str;
    fn ttl_pulse_samples(&self) -> usize;
    fn blocks(&self) -> &Vec<BlockSpec>;
    fn blocks_(&mut self) -> &mut Vec<BlockSpec>;
    fn library(&self) -> &StimulusLibrary;
    fn library_(&mut self) -> &mut StimulusLibrary;

    fn add_block(&mut self, block: BlockSpec) {
        self.blocks_().push(block);
    }

    fn add_stimulus(&mut self, name: &str, def: StimulusDef) {
        self.library_().insert(name, def);
    }

    fn clear_blocks(&mut self) {
        self.blocks_().clear();
    }

    fn n_blocks(&self) -> usize {
        self.blocks().len()
    }

    /// Checks every block and the stimulus library, reporting every problem at once.
    ///
    /// Issue paths are prefixed with `blocks[i].` for block issues.
    fn validate(&self) -> Result<()> {
        let mut report = ValidationReport::new();
        for (i, block) in self.blocks().iter().enumerate() {
            if let Err(err) = block.paradigm.validate() {
                for issue in err.issues() {
                    let mut issue = issue.clone();
                    issue.field_path = format!("blocks[{i}].{}", issue.field_path);
                    report.push(issue);
                }
            }
            if block.gap_ms < 0. {
                report.push(
                    ValidationIssue::new(format!("blocks[{i}].gap_ms"), IssueKind::InvalidValue, "gap must be >= 0")
                        .with_value(block.gap_ms),
                );
            }
        }
        if let Err(err) = self.library().validate() {
            for issue in err.issues() {
                let mut issue = issue.clone();
                issue.field_path = format!("library.{}", issue.field_path);
                report.push(issue);
            }
        }
        report.into_result()
    }

    /// Fresh sampling context bound to this experiment's seed and session.
    fn sampling_context(&self) -> SamplingContext {
        let mut ctx = SamplingContext::new(self.master_seed());
        ctx.set_session(self.session());
        ctx
    }

    /// Generates every block's plan and the concatenated element table with `ctx`.
    fn plan_with(&self, ctx: &mut SamplingContext) -> Result<(Vec<TrialPlan>, ElementTable)> {
        self.validate()?;
        let mut plans = Vec::with_capacity(self.n_blocks());
        let mut table = ElementTable::new();
        for (i, block) in self.blocks().iter().enumerate() {
            ctx.set_block(i);
            let plan = block.paradigm.generate_trial_plan(block.n_trials, ctx)?;
            table.append_block(pattern::build(&plan), i, block.gap_ms);
            tracing::debug!("Block {} ({}): {} trials", i, block.paradigm.kind(), plan.n_trials);
            plans.push(plan);
        }
        Ok((plans, table))
    }

    fn trial_plans(&self) -> Result<Vec<TrialPlan>> {
        Ok(self.plan_with(&mut self.sampling_context())?.0)
    }

    fn element_table(&self) -> Result<ElementTable> {
        Ok(self.plan_with(&mut self.sampling_context())?.1)
    }

    /// Runs the whole pipeline. Compiling the same experiment twice gives identical buffers.
    fn compile(&self) -> Result<SequenceArtifact> {
        let mut ctx = self.sampling_context();
        let (_, table) = self.plan_with(&mut ctx)?;
        Compiler::new(self.fs_hz())
            .with_ttl_pulse_samples(self.ttl_pulse_samples())
            .compile(&table, self.library(), &mut ctx)
    }
}

impl BaseExperiment for Experiment {
    fn master_seed(&self) -> u64 {
        self.master_seed
    }
    fn fs_hz(&self) -> f64 {
        self.fs_hz
    }
    fn session(&self) -> &str {
        &self.session
    }
    fn ttl_pulse_samples(&self) -> usize {
        self.ttl_pulse_samples
    }
    fn blocks(&self) -> &Vec<BlockSpec> {
        &self.blocks
    }
    fn blocks_(&mut self) -> &mut Vec<BlockSpec> {
        &mut self.blocks
    }
    fn library(&self) -> &StimulusLibrary {
        &self.library
    }
    fn library_(&mut self) -> &mut StimulusLibrary {
        &mut self.library
    }
}

impl Experiment {
    pub fn new(master_seed: u64, fs_hz: f64) -> Self {
        Self {
            master_seed,
            fs_hz,
            session: default_session(),
            ttl_pulse_samples: DEFAULT_TTL_PULSE_SAMPLES,
            library: StimulusLibrary::new(),
            blocks: Vec::new(),
        }
    }

    pub fn with_library(mut self, library: StimulusLibrary) -> Self {
        self.library = library;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CompilerError::parse("experiment", e))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experiment() -> Experiment {
        Experiment::from_json_str(
            r#"{
                "master_seed": 11,
                "fs_hz": 16000,
                "library": {
                    "std": {"type": "tone", "frequency_hz": 1000, "duration_ms": 50},
                    "dev": {"type": "tone", "frequency_hz": {"dist": "uniform", "min": 1500, "max": 2500, "scope": "per_block"}, "duration_ms": 50}
                },
                "blocks": [
                    {"n_trials": 20, "paradigm": {"paradigm": "oddball",
                        "tokens": [{"label": "standard", "stimulus_ref": "std", "probability": 0.8, "code": 1, "duration_ms": 50},
                                   {"label": "deviant", "stimulus_ref": "dev", "probability": 0.2, "code": 2, "duration_ms": 50}],
                        "selection": {"mode": "balanced_shuffle"}, "iti": 200}},
                    {"n_trials": 10, "gap_ms": 1000, "paradigm": {"paradigm": "oddball",
                        "tokens": [{"label": "standard", "stimulus_ref": "std", "probability": 0.5, "code": 1, "duration_ms": 50},
                                   {"label": "deviant", "stimulus_ref": "dev", "probability": 0.5, "code": 2, "duration_ms": 50}],
                        "selection": {"mode": "balanced_shuffle"}, "iti": 200}}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn blocks_are_concatenated_in_order() {
        let exp = experiment();
        let plans = exp.trial_plans().unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].count_label("deviant"), 4);
        assert_eq!(plans[1].count_label("deviant"), 5);
        let table = exp.element_table().unwrap();
        assert_eq!(table.n_trials(), 30);
        assert!(table.is_time_ordered());
        let first_of_block_1 = table.trials.iter().find(|t| t.block_index == 1).unwrap();
        let last_of_block_0 = table.trials.iter().filter(|t| t.block_index == 0).last().unwrap();
        assert_eq!(first_of_block_1.trial_index, 20);
        assert!(first_of_block_1.start_ms - last_of_block_0.end_ms >= 1000.);
    }

    #[test]
    fn compile_is_repeatable() {
        let exp = experiment();
        let a = exp.compile().unwrap();
        let b = exp.compile().unwrap();
        assert_eq!(a.audio_hash(), b.audio_hash());
        assert_eq!(a.manifest.n_trials, 30);
        assert_eq!(a.manifest.master_seed, Some(11));
    }

    #[test]
    fn validation_issues_are_prefixed_by_block() {
        let mut exp = experiment();
        exp.blocks[1].gap_ms = -5.;
        if let ParadigmConfig::Oddball(cfg) = &mut exp.blocks[0].paradigm {
            cfg.tokens[0].probability = 0.7;
        }
        let err = exp.compile().unwrap_err();
        let paths: Vec<&str> = err.issues().iter().map(|i| i.field_path.as_str()).collect();
        assert!(paths.iter().any(|p| p.starts_with("blocks[0].")));
        assert!(paths.contains(&"blocks[1].gap_ms"));
    }
}
