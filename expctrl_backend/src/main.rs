use expcompiler_backend::*;
use expctrl_backend::*;
use tracing_subscriber::EnvFilter;

// Usage: expctrl_backend_bin [sequence.expseq] [daq_config.json]
// Without a sequence, compiles a short demo; without a config, dry-runs in real time.
fn main() -> std::result::Result<(), DaqError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let artifact = match args.get(1) {
        Some(path) => SequenceArtifact::load(path)?,
        None => demo()?,
    };
    let config = match args.get(2) {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|e| DaqError::InvalidConfig(vec![format!("{}: {}", path, e)]))?;
            DaqConfig::from_json_str(&json)?
        }
        None => DaqConfig::dry_run(artifact.fs_hz()).with_real_time(true),
    };

    let mut engine = DaqEngine::new();
    engine.configure(config)?;
    engine.load_sequence(artifact)?;
    let result = engine.play()?;
    tracing::info!("{}", result.to_json());
    Ok(())
}

fn demo() -> std::result::Result<SequenceArtifact, DaqError> {
    let library = StimulusLibrary::new().with(
        "click",
        StimulusDef::new(GeneratorKind::Tone)
            .with_param("frequency_hz", 2000.)
            .with_param("duration_ms", 10.)
            .with_level(-12.),
    );
    let rows = (0..5)
        .map(|i| ElementRow::new(i, 0, "click", 250. * i as f64, 10.).with_ttl_code(1))
        .collect();
    let table = ElementTable::from_rows(rows);
    let mut ctx = SamplingContext::new(0);
    Ok(compile(&table, &library, 48000., &mut ctx)?)
}
