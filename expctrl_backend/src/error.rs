use thiserror::Error;

use expcompiler_backend::CompilerError;

/// A failed NI-DAQmx call: the negative status code and the driver's extended message.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("DAQmx error {code}: {message}")]
pub struct DaqmxError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum DaqError {
    #[error("invalid DAQ configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
    #[error("invalid sequence artifact: {}", .0.join("; "))]
    InvalidSequence(Vec<String>),
    #[error("engine is not configured")]
    NotConfigured,
    #[error("no sequence loaded")]
    NoSequenceLoaded,
    #[error("sample rate mismatch: configured {configured} Hz, sequence compiled at {sequence} Hz")]
    SampleRateMismatch { configured: f64, sequence: f64 },
    #[error("cannot {action} while the engine is {state}")]
    InvalidState { action: String, state: String },
    #[error("hardware mode requested but no output driver is available")]
    HardwareUnavailable,
    #[error(transparent)]
    Hardware(#[from] DaqmxError),
    #[error(transparent)]
    Artifact(#[from] CompilerError),
}

pub type Result<T> = std::result::Result<T, DaqError>;
