//! Hardware output drivers.
//!
//! The engine talks to hardware only through the [`OutputDriver`] trait. A driver receives the
//! validated configuration and the loaded sequence, and performs one blocking, synchronous
//! playback of the full buffers. Failures are returned as they are; the engine never retries.
//!
//! With the `nidaqmx` feature, [`NiDriver`] plays the audio on analog outputs and the TTL codes on
//! a digital port whose sample clock is the analog task's, so both streams stay sample-aligned.

use expcompiler_backend::SequenceArtifact;

use crate::config::DaqConfig;
use crate::error::*;

pub trait OutputDriver: Send {
    fn name(&self) -> &str;

    /// Writes the whole sequence and blocks until it has been generated.
    fn play(&mut self, config: &DaqConfig, artifact: &SequenceArtifact) -> Result<()>;

    fn reset_device(&mut self, _device: &str) -> Result<()> {
        Ok(())
    }
}

/// The driver available in this build, if any.
pub fn default_driver() -> Option<Box<dyn OutputDriver>> {
    #[cfg(feature = "nidaqmx")]
    {
        Some(Box::new(NiDriver::new()))
    }
    #[cfg(not(feature = "nidaqmx"))]
    {
        None
    }
}

#[cfg(feature = "nidaqmx")]
pub use self::ni::NiDriver;

#[cfg(feature = "nidaqmx")]
mod ni {
    use super::*;
    use crate::nidaqmx::*;
    use expcompiler_backend::TickTimer;

    pub struct NiDriver;

    impl NiDriver {
        pub fn new() -> Self {
            NiDriver
        }
    }

    impl Default for NiDriver {
        fn default() -> Self {
            Self::new()
        }
    }

    impl OutputDriver for NiDriver {
        fn name(&self) -> &str {
            "nidaqmx"
        }

        fn play(&mut self, config: &DaqConfig, artifact: &SequenceArtifact) -> Result<()> {
            let mut timer = TickTimer::new();
            let device = config.device.as_deref().ok_or(DaqError::NotConfigured)?;
            let physical = |name: &str| config.physical_channel(name).ok_or(DaqError::NotConfigured);
            let seq_len = artifact.n_samples() as u64;

            // Audio: one AO channel per routed column, on the onboard clock
            let ao_task = NiTask::new()?;
            for chan in config.audio_channels.iter().take(artifact.n_channels()) {
                ao_task.create_ao_chan(&physical(chan.as_str())?)?;
            }
            ao_task.cfg_sample_clk("", config.fs_hz, seq_len)?;

            // TTL: each code is written as a bitmask over the whole port, clocked by the AO sample clock
            let do_task = NiTask::new()?;
            do_task.create_do_chan(&physical(config.ttl_port.as_str())?)?;
            do_task.cfg_sample_clk(&physical("ao/SampleClock")?, config.fs_hz, seq_len)?;
            timer.tick_log(&format!("{} cfg (task channels, clk)", device));

            ao_task.write_analog(&artifact.audio)?;
            do_task.write_digital_port(&artifact.ttl)?;
            timer.tick_log(&format!("{} bufwrite", device));

            // The DO task waits on the AO clock, so it is armed first
            do_task.start()?;
            ao_task.start()?;
            let timeout = artifact.duration_ms() / 1e3 + config.timeout_s;
            ao_task.wait_until_done(timeout)?;
            do_task.wait_until_done(config.timeout_s)?;
            timer.tick_log(&format!("{} end", device));
            ao_task.stop()?;
            do_task.stop()?;
            Ok(())
        }

        fn reset_device(&mut self, device: &str) -> Result<()> {
            Ok(reset_ni_device(device)?)
        }
    }
}
