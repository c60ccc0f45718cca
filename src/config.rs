use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

/// Pipeline configuration loaded from TOML config file.
/// All fields have sensible defaults — the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root directory of the session data tree (overridable on the CLI).
    pub data_root: Option<PathBuf>,
    /// Custom database path (overrides the per-root default).
    pub db_path: Option<PathBuf>,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub isolation: IsolationConfig,
    pub stitching: StitchingConfig,
    pub raster: RasterConfig,
    pub curation: CurationConfig,
}

/// Parameters for isolation scoring.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Time-window length in seconds for per-window isolation frames.
    pub window_sec: f64,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self { window_sec: 100.0 }
    }
}

/// Parameters for cross-recording neuron stitching.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StitchingConfig {
    /// Minimum firing-rate-curve Pearson correlation to accept a match.
    pub fr_corr_threshold: f64,
    /// Minimum waveform Pearson correlation to accept a match.
    pub wf_corr_threshold: f64,
    /// Minimum number of recordings a neuron must appear in.
    pub min_recordings: usize,
    /// Electrode-index radius defining the channel neighborhood.
    pub channel_range: i64,
}

impl Default for StitchingConfig {
    fn default() -> Self {
        Self {
            fr_corr_threshold: 0.85,
            wf_corr_threshold: 0.85,
            min_recordings: 2,
            channel_range: 10,
        }
    }
}

/// Parameters for raster extraction and the stitcher's rate curves.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RasterConfig {
    /// Default alignment window [start, stop] in ms.
    pub time_window: [f64; 2],
    /// Gaussian smoothing std in ms for peri-event rate curves.
    pub smoothing: f64,
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            time_window: [-300.0, 500.0],
            smoothing: 10.0,
        }
    }
}

/// Thresholds consumed by the external curation step. The pipeline persists
/// them unchanged and never reads them back.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CurationConfig {
    pub l_ratio_threshold: f64,
    pub isi_violation_rate: f64,
    pub isolated_t_ratio: f64,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            l_ratio_threshold: 0.2,
            isi_violation_rate: 0.2,
            isolated_t_ratio: 0.6,
        }
    }
}

impl PipelineConfig {
    /// Load config from `~/.config/spikestitch/config.toml`.
    /// Returns default config if the file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<PipelineConfig>(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!(
                            "Failed to parse {}: {}. Using defaults.",
                            path.display(),
                            e
                        );
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!(
                        "Failed to read {}: {}. Using defaults.",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path: `<data_root>/spikestitch.db`.
pub fn default_db_path(data_root: &std::path::Path) -> PathBuf {
    data_root.join("spikestitch.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.isolation.window_sec, 100.0);
        assert_eq!(cfg.stitching.fr_corr_threshold, 0.85);
        assert_eq!(cfg.stitching.min_recordings, 2);
        assert_eq!(cfg.stitching.channel_range, 10);
        assert_eq!(cfg.raster.time_window, [-300.0, 500.0]);
        assert_eq!(cfg.raster.smoothing, 10.0);
    }

    #[test]
    fn test_parse_partial_toml() {
        let cfg: PipelineConfig = toml::from_str(
            r#"
            workers = 4

            [isolation]
            window_sec = 60.0

            [stitching]
            fr_corr_threshold = 0.9
            "#,
        )
        .unwrap();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.isolation.window_sec, 60.0);
        assert_eq!(cfg.stitching.fr_corr_threshold, 0.9);
        // Unspecified sections keep defaults
        assert_eq!(cfg.stitching.wf_corr_threshold, 0.85);
        assert_eq!(cfg.raster.smoothing, 10.0);
    }
}
