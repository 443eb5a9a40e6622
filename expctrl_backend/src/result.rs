use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PlaybackMode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    Completed,
    Stopped,
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                PlaybackStatus::Completed => "completed",
                PlaybackStatus::Stopped => "stopped",
            }
        )
    }
}

/// One event as it was played.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayedEvent {
    pub sample_index: usize,
    pub scheduled_ms: f64,
    /// Time since playback start. Equal to `scheduled_ms` in dry runs and for the
    /// hardware-clocked output.
    pub realized_ms: f64,
    pub trial_index: usize,
    pub element_index: usize,
    pub code: Option<u32>,
    pub ttl_channel: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlaybackResult {
    pub success: bool,
    pub status: PlaybackStatus,
    pub mode: PlaybackMode,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: f64,
    pub events_played: usize,
    pub events: Vec<PlayedEvent>,
    /// Audio hash of the played artifact.
    pub sequence_hash: String,
}

impl PlaybackResult {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
