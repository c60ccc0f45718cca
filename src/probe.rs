//! Probe geometry: acquisition channel → electrode index.
//!
//! The geometry file is the only probe information the pipeline needs; the
//! electrode index gives channels a physical order along the shank, and the
//! stitcher's channel neighborhood is defined as all channels within a fixed
//! electrode-index radius.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Probe geometry file not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },
}

/// Electrode positions for one probe. Element `i` of `electrode` is the
/// probe electrode index of acquisition channel `i`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeGeometry {
    pub electrode: Vec<i64>,
}

impl ProbeGeometry {
    pub fn load(path: &Path) -> Result<Self, ProbeError> {
        if !path.exists() {
            return Err(ProbeError::NotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| ProbeError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Electrode index of a channel, if the channel is on the probe.
    pub fn electrode_of(&self, channel: i64) -> Option<i64> {
        usize::try_from(channel)
            .ok()
            .and_then(|c| self.electrode.get(c))
            .copied()
    }

    /// All channels whose electrode index is within `±range` of the given
    /// channel's electrode. Includes the channel itself. A channel missing
    /// from the geometry is its own sole neighbor.
    pub fn neighborhood(&self, channel: i64, range: i64) -> Vec<i64> {
        let center = match self.electrode_of(channel) {
            Some(e) => e,
            None => return vec![channel],
        };
        self.electrode
            .iter()
            .enumerate()
            .filter(|(_, &e)| (e - center).abs() <= range)
            .map(|(c, _)| c as i64)
            .collect()
    }
}
