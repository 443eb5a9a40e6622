use expcompiler_backend::*;
use tracing_subscriber::EnvFilter;

// Usage: expcompiler_backend_bin [experiment.json] [out.expseq]
// Without arguments, compiles a small oddball demo.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let exp = match args.get(1) {
        Some(path) => Experiment::from_path(path)?,
        None => demo(),
    };
    let artifact = exp.compile()?;
    tracing::info!(
        "Compiled {} trials / {} elements: {} samples x {} channels, hash {}",
        artifact.manifest.n_trials,
        artifact.manifest.n_elements,
        artifact.manifest.duration_samples,
        artifact.manifest.n_channels,
        artifact.manifest.audio_hash
    );
    if let Some(out) = args.get(2) {
        artifact.save(out)?;
        tracing::info!("Wrote {}", out);
    }
    Ok(())
}

fn demo() -> Experiment {
    let library = StimulusLibrary::new()
        .with(
            "standard",
            StimulusDef::new(GeneratorKind::Tone)
                .with_param("frequency_hz", 1000.)
                .with_param("duration_ms", 50.)
                .with_level(-6.),
        )
        .with(
            "deviant",
            StimulusDef::new(GeneratorKind::Tone)
                .with_param("frequency_hz", 1500.)
                .with_param("duration_ms", 50.)
                .with_level(-6.),
        );
    let token = |label: &str, stimulus: &str, probability: f64, code: u32| OddballToken {
        label: label.to_string(),
        stimulus_ref: Some(stimulus.to_string()),
        probability,
        code: Some(code),
        duration_ms: 50.0.into(),
    };
    let paradigm = ParadigmConfig::Oddball(OddballConfig {
        tokens: vec![token("standard", "standard", 0.8, 1), token("deviant", "deviant", 0.2, 2)],
        selection: SelectionConfig::new(SelectionMode::BalancedShuffle),
        iti: NumericField::distribution(Distribution::Uniform { min: 500., max: 700. }, Scope::PerTrial),
        constraints: Default::default(),
        refractory_ms: 0.,
    });
    let mut exp = Experiment::new(42, 48000.).with_library(library);
    exp.add_block(BlockSpec::new(paradigm, 100));
    exp
}
