//! Output tracks of a compiled sequence: one [`AudioTrack`] per audio channel and a single
//! [`TtlTrack`] for the digital code stream.
//!
//! ## Overview
//!
//! The compiler does not write into the output buffers blindly. Every element is first
//! registered as a [`Placement`] (a `[start_pos, end_pos)` sample interval tied to its element
//! row) on each track it touches. Tracks keep their placements in a `BTreeSet` ordered by
//! start position, which makes neighbour lookups for overlap detection a range query, exactly
//! like instruction books on a channel.
//!
//! Overlaps are legal (audio blocks are summed, later TTL pulses overwrite earlier ones) but are
//! logged, since in a well-formed design writes on one channel are disjoint in time.
//!
//! The [`BaseTrack`] trait carries the shared behavior; implementors only provide field
//! accessors.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use ndarray::{s, Array1, Array2, ArrayView2};

/// A sample interval occupied by one element row.
#[derive(Clone, Debug)]
pub struct Placement {
    pub start_pos: usize,
    pub end_pos: usize,
    pub row_index: usize,
    /// TTL code written over the interval; `None` for audio placements.
    pub code: Option<u32>,
}

impl Placement {
    pub fn new(start_pos: usize, end_pos: usize, row_index: usize) -> Self {
        Self {
            start_pos,
            end_pos,
            row_index,
            code: None,
        }
    }

    pub fn len(&self) -> usize {
        self.end_pos - self.start_pos
    }

    pub fn is_empty(&self) -> bool {
        self.end_pos <= self.start_pos
    }

    pub fn overlaps(&self, other: &Placement) -> bool {
        self.start_pos < other.end_pos && other.start_pos < self.end_pos
    }
}

// Ordered by start position, ties broken by row so that simultaneous placements coexist
impl Ord for Placement {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.start_pos, self.row_index).cmp(&(other.start_pos, other.row_index))
    }
}
impl PartialOrd for Placement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Placement {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Placement {}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "Placement(row {}, {}-{}, code {})", self.row_index, self.start_pos, self.end_pos, code),
            None => write!(f, "Placement(row {}, {}-{})", self.row_index, self.start_pos, self.end_pos),
        }
    }
}

pub trait BaseTrack {
    // Field methods
    fn name(&self) -> &str;
    fn placements(&self) -> &BTreeSet<Placement>;
    // Mutable field references
    fn placements_(&mut self) -> &mut BTreeSet<Placement>;

    /// End of the last-ending placement, in samples.
    fn end_pos(&self) -> usize {
        self.placements().iter().map(|p| p.end_pos).max().unwrap_or(0)
    }

    /// Placements already on the track that intersect `placement`.
    fn overlapping(&self, placement: &Placement) -> Vec<&Placement> {
        // Any earlier placement may still be running, later ones must start before our end
        let mut hits: Vec<&Placement> = self
            .placements()
            .range(..placement)
            .filter(|prev| prev.end_pos > placement.start_pos)
            .collect();
        hits.extend(
            self.placements()
                .range(placement..)
                .take_while(|next| next.start_pos < placement.end_pos),
        );
        hits
    }

    /// Registers `placement`, returning `true` if it overlaps an existing one.
    /// Zero-length placements are ignored.
    fn add_placement(&mut self, placement: Placement) -> bool {
        if placement.is_empty() {
            return false;
        }
        let overlapping = self.overlapping(&placement);
        let overlaps = !overlapping.is_empty();
        if overlaps {
            tracing::warn!(
                "Track {}: {} overlaps with {}",
                self.name(),
                placement,
                overlapping
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<String>>()
                    .join(", ")
            );
        }
        self.placements_().insert(placement);
        overlaps
    }
}

/// One audio output channel.
pub struct AudioTrack {
    name: String,
    pub channel: usize,
    placements: BTreeSet<Placement>,
}

impl BaseTrack for AudioTrack {
    fn name(&self) -> &str {
        &self.name
    }
    fn placements(&self) -> &BTreeSet<Placement> {
        &self.placements
    }
    fn placements_(&mut self) -> &mut BTreeSet<Placement> {
        &mut self.placements
    }
}

impl AudioTrack {
    pub fn new(channel: usize) -> Self {
        Self {
            name: format!("audio{}", channel),
            channel,
            placements: BTreeSet::new(),
        }
    }

    /// Adds column `block_column` of `block` into this track's column of `audio`, starting at
    /// `start_pos`. Samples past the end of `audio` are dropped.
    pub fn mix_into(&self, audio: &mut Array2<f64>, block: &ArrayView2<f64>, block_column: usize, start_pos: usize) {
        let end_pos = (start_pos + block.nrows()).min(audio.nrows());
        if end_pos <= start_pos {
            return;
        }
        let mut target = audio.slice_mut(s![start_pos..end_pos, self.channel]);
        target += &block.slice(s![..end_pos - start_pos, block_column]);
    }
}

/// The digital code stream.
pub struct TtlTrack {
    name: String,
    placements: BTreeSet<Placement>,
}

impl BaseTrack for TtlTrack {
    fn name(&self) -> &str {
        &self.name
    }
    fn placements(&self) -> &BTreeSet<Placement> {
        &self.placements
    }
    fn placements_(&mut self) -> &mut BTreeSet<Placement> {
        &mut self.placements
    }
}

impl TtlTrack {
    pub fn new() -> Self {
        Self {
            name: "ttl".to_string(),
            placements: BTreeSet::new(),
        }
    }

    pub fn pulse(&mut self, start_pos: usize, width: usize, code: u32, row_index: usize) -> bool {
        self.add_placement(Placement {
            start_pos,
            end_pos: start_pos + width,
            row_index,
            code: Some(code),
        })
    }

    /// Renders every pulse into a zero buffer of `length` samples.
    /// Pulses are written in start order, so a later pulse overwrites an earlier one where they meet.
    pub fn render(&self, length: usize) -> Array1<u32> {
        let mut ttl = Array1::<u32>::zeros(length);
        for placement in self.placements.iter() {
            let end_pos = placement.end_pos.min(length);
            if placement.start_pos < end_pos {
                ttl.slice_mut(s![placement.start_pos..end_pos])
                    .fill(placement.code.unwrap_or(0));
            }
        }
        ttl
    }
}

impl Default for TtlTrack {
    fn default() -> Self {
        Self::new()
    }
}
