//! # Sequence playback with the `engine` Module
//!
//! [`DaqEngine`] plays one compiled [`SequenceArtifact`] at a time, either on hardware through an
//! [`OutputDriver`] or through a dry-run simulator that reports the scheduled timeline.
//!
//! ## State machine
//!
//! ```text
//! idle --configure/load_sequence--> ready --play--> playing --> completed
//!                                     ^                |            |
//!                                     +------stop------+            |
//!                                     +----------play again---------+
//! ```
//!
//! `reset()` returns to `idle` and discards both the configuration and the loaded sequence.
//! Every precondition of `play()` (configuration, loaded sequence, matching sample rate, available
//! driver) is checked before any output starts; none of these failures changes the state.
//!
//! ## Stopping
//!
//! `play()` blocks the calling thread. A [`StopHandle`] obtained beforehand can be moved to another
//! thread to interrupt a real-time dry run between events. Stopping is best effort: a hardware
//! write in flight always runs to completion.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;

use expcompiler_backend::SequenceArtifact;

use crate::config::*;
use crate::driver::*;
use crate::error::*;
use crate::result::*;
use crate::worker_cmd_chan::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Ready,
    Playing,
    Completed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                EngineState::Idle => "idle",
                EngineState::Ready => "ready",
                EngineState::Playing => "playing",
                EngineState::Completed => "completed",
            }
        )
    }
}

/// Cloneable handle that stops the engine's current playback from another thread.
#[derive(Clone)]
pub struct StopHandle {
    chan: CmdChan,
}

impl StopHandle {
    pub fn stop(&self) {
        self.chan.send(EngineCmd::Stop);
    }
}

pub struct DaqEngine {
    state: EngineState,
    config: Option<DaqConfig>,
    artifact: Option<SequenceArtifact>,
    driver: Option<Box<dyn OutputDriver>>,
    cmd_chan: CmdChan,
}

impl DaqEngine {
    /// Engine using the output driver compiled into this build, if any.
    pub fn new() -> Self {
        Self::from_parts(default_driver())
    }

    pub fn with_driver(driver: Box<dyn OutputDriver>) -> Self {
        Self::from_parts(Some(driver))
    }

    /// Engine that can only dry-run.
    pub fn without_driver() -> Self {
        Self::from_parts(None)
    }

    fn from_parts(driver: Option<Box<dyn OutputDriver>>) -> Self {
        Self {
            state: EngineState::Idle,
            config: None,
            artifact: None,
            driver,
            cmd_chan: CmdChan::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> Option<&DaqConfig> {
        self.config.as_ref()
    }

    pub fn artifact(&self) -> Option<&SequenceArtifact> {
        self.artifact.as_ref()
    }

    pub fn driver_name(&self) -> Option<&str> {
        self.driver.as_ref().map(|d| d.name())
    }

    fn require_not_playing(&self, action: &str) -> Result<()> {
        if self.state == EngineState::Playing {
            return Err(DaqError::InvalidState {
                action: action.to_string(),
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    pub fn configure(&mut self, config: DaqConfig) -> Result<()> {
        self.require_not_playing("configure")?;
        config.validate()?;
        tracing::info!(
            "Configured engine: mode={}, device={:?}, fs={} Hz",
            config.mode,
            config.device,
            config.fs_hz
        );
        self.config = Some(config);
        self.state = EngineState::Ready;
        Ok(())
    }

    /// Accepts an artifact after checking that its buffers, tables and manifest are consistent.
    pub fn load_sequence(&mut self, artifact: SequenceArtifact) -> Result<()> {
        self.require_not_playing("load a sequence")?;
        let issues = artifact.check();
        if !issues.is_empty() {
            return Err(DaqError::InvalidSequence(issues));
        }
        tracing::info!(
            "Loaded sequence: {} samples x {} channels, {} events, hash {}",
            artifact.n_samples(),
            artifact.n_channels(),
            artifact.events.len(),
            artifact.audio_hash()
        );
        self.artifact = Some(artifact);
        self.state = EngineState::Ready;
        Ok(())
    }

    pub fn load_sequence_from_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let artifact = SequenceArtifact::load(path)?;
        self.load_sequence(artifact)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            chan: self.cmd_chan.clone(),
        }
    }

    /// Posts a stop command. Only a playback started before this call can observe it.
    pub fn stop(&self) {
        tracing::info!("Stop requested (engine {})", self.state);
        self.cmd_chan.send(EngineCmd::Stop);
    }

    pub fn reset(&mut self) -> Result<()> {
        self.require_not_playing("reset")?;
        self.config = None;
        self.artifact = None;
        self.state = EngineState::Idle;
        Ok(())
    }

    /// Resets the configured hardware device through the driver. A no-op in dry-run mode.
    pub fn reset_device(&mut self) -> Result<()> {
        let config = self.config.as_ref().ok_or(DaqError::NotConfigured)?;
        if config.mode == PlaybackMode::DryRun {
            return Ok(());
        }
        let device = config.device.as_deref().ok_or(DaqError::NotConfigured)?;
        let driver = self.driver.as_mut().ok_or(DaqError::HardwareUnavailable)?;
        driver.reset_device(device)
    }

    /// Plays the loaded sequence and blocks until it has finished or was stopped.
    pub fn play(&mut self) -> Result<PlaybackResult> {
        let config = self.config.as_ref().ok_or(DaqError::NotConfigured)?;
        let artifact = self.artifact.as_ref().ok_or(DaqError::NoSequenceLoaded)?;
        self.require_not_playing("play")?;
        if (config.fs_hz - artifact.fs_hz()).abs() > 1e-9 {
            return Err(DaqError::SampleRateMismatch {
                configured: config.fs_hz,
                sequence: artifact.fs_hz(),
            });
        }
        if config.mode == PlaybackMode::Hardware {
            if self.driver.is_none() {
                return Err(DaqError::HardwareUnavailable);
            }
            if artifact.n_channels() > config.audio_channels.len() {
                return Err(DaqError::InvalidConfig(vec![format!(
                    "sequence routes {} audio channels but only {} outputs are configured",
                    artifact.n_channels(),
                    config.audio_channels.len()
                )]));
            }
            if let Some((sample, code)) = artifact.ttl.iter().enumerate().find(|(_, code)| !config.ttl_code_fits(**code)) {
                return Err(DaqError::InvalidSequence(vec![format!(
                    "ttl code {} at sample {} does not fit the {}-line port {}",
                    code, sample, config.ttl_port_width, config.ttl_port
                )]));
            }
        }

        // Commands posted before this point are not for this playback
        let mut recvr = self.cmd_chan.new_recvr();
        self.state = EngineState::Playing;
        tracing::info!(
            "Playing {} ms ({} events) in {} mode",
            artifact.duration_ms(),
            artifact.events.len(),
            config.mode
        );

        let start_time = Utc::now();
        let outcome = match config.mode {
            PlaybackMode::DryRun => Ok(simulate(config, artifact, &mut recvr)),
            PlaybackMode::Hardware => match self.driver.as_mut() {
                Some(driver) => driver
                    .play(config, artifact)
                    .map(|_| artifact.events.len()),
                None => Err(DaqError::HardwareUnavailable),
            },
        };
        let end_time = Utc::now();

        let events_played = match outcome {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Playback failed, engine back to ready: {}", e);
                self.state = EngineState::Ready;
                return Err(e);
            }
        };
        let stopped = events_played < artifact.events.len();
        let status = if stopped {
            PlaybackStatus::Stopped
        } else {
            PlaybackStatus::Completed
        };
        let duration_ms = if stopped {
            (end_time - start_time).num_microseconds().unwrap_or(0) as f64 / 1e3
        } else {
            artifact.duration_ms()
        };
        let result = PlaybackResult {
            success: !stopped,
            status,
            mode: config.mode,
            start_time,
            end_time,
            duration_ms,
            events_played,
            events: played_events(config, artifact, events_played),
            sequence_hash: artifact.audio_hash().to_string(),
        };
        self.state = if stopped {
            EngineState::Ready
        } else {
            EngineState::Completed
        };
        tracing::info!(
            "Playback {}: {}/{} events in {:.1} ms",
            status,
            events_played,
            artifact.events.len(),
            duration_ms
        );
        Ok(result)
    }
}

impl Default for DaqEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks the event timeline, waiting on the wall clock when `real_time` is set.
/// Returns the number of events reached before a stop command.
fn simulate(config: &DaqConfig, artifact: &SequenceArtifact, recvr: &mut CmdRecvr) -> usize {
    if !config.real_time {
        return artifact.events.len();
    }
    let origin = Instant::now();
    let deadline_of = |ms: f64| origin + Duration::from_secs_f64(ms.max(0.) / 1e3);
    for (n_played, event) in artifact.events.iter().enumerate() {
        if recvr.recv_until(deadline_of(event.time_ms)) == Some(EngineCmd::Stop) {
            return n_played;
        }
    }
    if recvr.recv_until(deadline_of(artifact.duration_ms())) == Some(EngineCmd::Stop) {
        tracing::info!("Stopped after the last event");
    }
    artifact.events.len()
}

fn played_events(config: &DaqConfig, artifact: &SequenceArtifact, n: usize) -> Vec<PlayedEvent> {
    artifact
        .events
        .iter()
        .take(n)
        .map(|ev| PlayedEvent {
            sample_index: ev.sample_index,
            scheduled_ms: ev.time_ms,
            realized_ms: ev.time_ms,
            trial_index: ev.trial_index,
            element_index: ev.element_index,
            code: ev.code,
            ttl_channel: ev
                .code
                .and_then(|c| config.ttl_line(c))
                .map(|s| s.to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use expcompiler_backend::*;

    fn artifact(fs_hz: f64) -> SequenceArtifact {
        let library = StimulusLibrary::new().with(
            "beep",
            StimulusDef::new(GeneratorKind::Tone)
                .with_param("duration_ms", 20.)
                .with_param("frequency_hz", 1000.),
        );
        let rows = [Some(1), None, Some(2)]
            .into_iter()
            .enumerate()
            .map(|(i, code)| {
                let row = ElementRow::new(i, 0, "beep", 100. * i as f64, 20.);
                match code {
                    Some(c) => row.with_ttl_code(c),
                    None => row,
                }
            })
            .collect();
        let table = ElementTable::from_rows(rows);
        let mut ctx = SamplingContext::new(3);
        compile(&table, &library, fs_hz, &mut ctx).unwrap()
    }

    #[test]
    fn states_follow_configure_load_play() {
        let mut engine = DaqEngine::without_driver();
        assert_eq!(engine.state(), EngineState::Idle);
        engine.configure(DaqConfig::dry_run(8000.)).unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        engine.load_sequence(artifact(8000.)).unwrap();
        let result = engine.play().unwrap();
        assert!(result.success);
        assert_eq!(engine.state(), EngineState::Completed);
        // Replaying a completed sequence is allowed
        assert!(engine.play().is_ok());
        engine.reset().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.artifact().is_none());
    }

    #[test]
    fn play_checks_preconditions_in_order() {
        let mut engine = DaqEngine::without_driver();
        assert!(matches!(engine.play(), Err(DaqError::NotConfigured)));
        engine.configure(DaqConfig::dry_run(8000.)).unwrap();
        assert!(matches!(engine.play(), Err(DaqError::NoSequenceLoaded)));
        engine.load_sequence(artifact(16000.)).unwrap();
        assert!(matches!(
            engine.play(),
            Err(DaqError::SampleRateMismatch { configured, sequence }) if configured == 8000. && sequence == 16000.
        ));
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn ttl_lines_are_reported() {
        let mut engine = DaqEngine::without_driver();
        engine
            .configure(DaqConfig::dry_run(8000.).with_ttl_line(2, "port0/line1"))
            .unwrap();
        engine.load_sequence(artifact(8000.)).unwrap();
        let result = engine.play().unwrap();
        let channels: Vec<_> = result.events.iter().map(|e| e.ttl_channel.clone()).collect();
        assert_eq!(channels, vec![None, None, Some("port0/line1".to_string())]);
    }

    #[test]
    fn stale_stop_does_not_affect_next_play() {
        let mut engine = DaqEngine::without_driver();
        engine
            .configure(DaqConfig::dry_run(8000.).with_real_time(true))
            .unwrap();
        engine.load_sequence(artifact(8000.)).unwrap();
        engine.stop();
        let result = engine.play().unwrap();
        assert_eq!(result.status, PlaybackStatus::Completed);
        assert_eq!(result.events_played, 3);
    }
}
