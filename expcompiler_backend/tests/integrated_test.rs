use approx::assert_relative_eq;
use expcompiler_backend::*;

fn library() -> StimulusLibrary {
    StimulusLibrary::from_json_str(
        r#"{
            "std":  {"type": "tone", "frequency_hz": 1000, "duration_ms": 50, "level": -6,
                     "envelope": {"shape": "cosine", "rise_ms": 5, "fall_ms": 5}},
            "dev":  {"type": "tone", "frequency_hz": {"dist": "loguniform", "min": 1200, "max": 2400}, "duration_ms": 50,
                     "routing": {"channels": [0, 1]}},
            "cue":  {"type": "noise", "duration_ms": 100, "level": -12},
            "beep": {"type": "tone", "frequency_hz": 2000, "duration_ms": 80}
        }"#,
    )
    .unwrap()
}

fn oddball() -> ParadigmConfig {
    ParadigmConfig::from_json_str(
        r#"{
            "paradigm": "oddball",
            "tokens": [
                {"label": "standard", "stimulus_ref": "std", "probability": 0.8, "code": 1, "duration_ms": 50},
                {"label": "deviant", "stimulus_ref": "dev", "probability": 0.2, "code": 2, "duration_ms": 50}
            ],
            "selection": {"mode": "balanced_shuffle"},
            "iti": {"dist": "uniform", "min": 400, "max": 600},
            "constraints": {"max_consecutive_deviant": 1},
            "refractory_ms": 10
        }"#,
    )
    .unwrap()
}

fn foreperiod() -> ParadigmConfig {
    ParadigmConfig::from_json_str(
        r#"{
            "paradigm": "foreperiod",
            "cue": {"stimulus_ref": "cue", "duration_ms": 100, "code": 10},
            "outcomes": [
                {"label": "beep", "stimulus_ref": "beep", "probability": 0.75, "code": 11, "duration_ms": 80},
                {"label": "omission", "probability": 0.25, "code": 12, "is_omission": true}
            ],
            "foreperiod": {"dist": "categorical", "categories": [300, 600], "probabilities": [0.5, 0.5]},
            "selection": {"mode": "balanced_shuffle"},
            "iti": 800
        }"#,
    )
    .unwrap()
}

#[test]
fn oddball_counts_are_exact_for_any_seed() {
    for seed in 0..5 {
        let mut ctx = SamplingContext::new(seed);
        let plan = oddball().generate_trial_plan(100, &mut ctx).unwrap();
        assert_eq!(plan.count_label("standard"), 80);
        assert_eq!(plan.count_label("deviant"), 20);
    }
}

#[test]
fn whole_pipeline_is_deterministic() {
    let compile_once = |seed: u64| {
        let mut ctx = SamplingContext::new(seed);
        let plan = oddball().generate_trial_plan(30, &mut ctx).unwrap();
        let table = build(&plan);
        compile(&table, &library(), 16000., &mut ctx).unwrap()
    };
    let a = compile_once(3);
    let b = compile_once(3);
    assert_eq!(a.audio, b.audio);
    assert_eq!(a.ttl, b.ttl);
    assert_eq!(a.audio_hash(), b.audio_hash());
    assert_ne!(a.audio_hash(), compile_once(4).audio_hash());
}

#[test]
fn every_event_lands_in_the_ttl_stream() {
    let mut ctx = SamplingContext::new(21);
    let plan = foreperiod().generate_trial_plan(20, &mut ctx).unwrap();
    let table = build(&plan);
    assert!(table.is_time_ordered());
    let artifact = compile(&table, &library(), 16000., &mut ctx).unwrap();
    assert!(artifact.check().is_empty());

    let onsets = artifact.ttl_onsets();
    assert_eq!(onsets.len(), artifact.events.len());
    for (event, (sample, code)) in artifact.events.iter().zip(onsets) {
        assert_eq!(event.sample_index, sample);
        assert_eq!(event.code, Some(code));
    }
    // Omission outcomes are silent
    for event in artifact.events.iter().filter(|e| e.is_omission) {
        assert_eq!(event.code, Some(12));
        assert!(artifact
            .audio
            .column(0)
            .iter()
            .skip(event.sample_index)
            .take(160)
            .all(|x| *x == 0.));
    }
}

#[test]
fn levels_and_routing_are_applied() {
    let table = ElementTable::from_rows(vec![
        ElementRow::new(0, 0, "std", 0., 50.),
        ElementRow::new(1, 0, "dev", 100., 50.),
    ]);
    let artifact = compile(&table, &library(), 48000., &mut SamplingContext::new(0)).unwrap();
    assert_eq!(artifact.n_channels(), 2);
    let peak = artifact
        .audio
        .column(0)
        .iter()
        .take(2400)
        .fold(0., |acc: f64, x| acc.max(x.abs()));
    assert_relative_eq!(peak, 10f64.powf(-6. / 20.), epsilon = 1e-3);
    // "dev" is routed to both channels, "std" only to the first
    assert!(artifact.audio.column(1).iter().take(2400).all(|x| *x == 0.));
    assert_eq!(
        artifact.audio.column(0).iter().skip(4800).take(2400).collect::<Vec<_>>(),
        artifact.audio.column(1).iter().skip(4800).take(2400).collect::<Vec<_>>()
    );
}

#[test]
fn container_round_trip() {
    let mut exp = Experiment::new(5, 16000.).with_library(library());
    exp.add_block(BlockSpec::new(oddball(), 20));
    exp.add_block(BlockSpec::new(foreperiod(), 8).with_gap_ms(500.));
    let artifact = exp.compile().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.expseq");
    artifact.save(&path).unwrap();
    let loaded = SequenceArtifact::load(&path).unwrap();
    assert_eq!(loaded.audio, artifact.audio);
    assert_eq!(loaded.ttl, artifact.ttl);
    assert_eq!(loaded.audio_hash(), artifact.audio_hash());
    assert_eq!(loaded.compute_audio_hash(), artifact.audio_hash());
    assert_eq!(loaded, artifact);
}

#[test]
fn corrupted_container_is_rejected() {
    let table = ElementTable::from_rows(vec![ElementRow::new(0, 0, "std", 0., 50.)]);
    let mut artifact = compile(&table, &library(), 16000., &mut SamplingContext::new(0)).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let path = dir.path().join("bad_magic");
    std::fs::write(&path, b"NOTASEQ!rest").unwrap();
    assert!(matches!(SequenceArtifact::load(&path), Err(CompilerError::BadMagic)));

    artifact.audio[[10, 0]] += 0.5;
    let path = dir.path().join("tampered");
    artifact.save(&path).unwrap();
    assert!(matches!(
        SequenceArtifact::load(&path),
        Err(CompilerError::HashMismatch { .. })
    ));
}

#[test]
fn per_block_parameters_are_shared_within_a_block() {
    let library = StimulusLibrary::new().with(
        "jitter",
        StimulusDef::new(GeneratorKind::Tone)
            .with_param(
                "frequency_hz",
                NumericField::distribution(Distribution::Uniform { min: 500., max: 1500. }, Scope::PerBlock),
            )
            .with_param("duration_ms", 20.),
    );
    let mut rows = vec![
        ElementRow::new(0, 0, "jitter", 0., 20.),
        ElementRow::new(1, 0, "jitter", 100., 20.),
        ElementRow::new(2, 0, "jitter", 200., 20.),
    ];
    rows[2].block_index = 1;
    let artifact = compile(&ElementTable::from_rows(rows), &library, 8000., &mut SamplingContext::new(9)).unwrap();
    let hashes: Vec<&str> = artifact
        .events
        .iter()
        .filter_map(|e| e.stimulus_hash.as_deref())
        .collect();
    assert_eq!(hashes[0], hashes[1]);
    assert_ne!(hashes[1], hashes[2]);
}
