//! Per-recording timing metadata: probe-clock duration and the two affine
//! clock corrections.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("Timing metadata file not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },
}

/// Timing metadata for one recording.
///
/// `probe_to_aux` and `aux_to_behavioral` are `[intercept, slope]` pairs of
/// the two drift-correction stages. `aux_to_behavioral` may be absent when
/// the behavioral sync model was never fit for the recording; the reprojector
/// then falls back to auxiliary-clock output for that recording only.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingMeta {
    pub duration_samples: i64,
    pub sample_rate: f64,
    pub probe_to_aux: [f64; 2],
    pub aux_to_behavioral: Option<[f64; 2]>,
}

impl RecordingMeta {
    pub fn load(path: &Path) -> Result<Self, MetaError> {
        if !path.exists() {
            return Err(MetaError::NotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| MetaError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Probe-clock duration in seconds.
    pub fn duration_sec(&self) -> f64 {
        self.duration_samples as f64 / self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_full_meta() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("meta.towerA.1.toml");
        std::fs::write(
            &path,
            r#"
            duration_samples = 30000
            sample_rate = 30000.0
            probe_to_aux = [0.0, 1.0]
            aux_to_behavioral = [0.5, 1.0001]
            "#,
        )
        .unwrap();

        let meta = RecordingMeta::load(&path).unwrap();
        assert_eq!(meta.duration_samples, 30_000);
        assert_eq!(meta.duration_sec(), 1.0);
        assert_eq!(meta.aux_to_behavioral, Some([0.5, 1.0001]));
    }

    #[test]
    fn test_missing_behavioral_model() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("meta.towerA.1.toml");
        std::fs::write(
            &path,
            "duration_samples = 60000\nsample_rate = 30000.0\nprobe_to_aux = [0.0, 1.0]\n",
        )
        .unwrap();

        let meta = RecordingMeta::load(&path).unwrap();
        assert_eq!(meta.duration_sec(), 2.0);
        assert!(meta.aux_to_behavioral.is_none());
    }
}
