//! Path conventions for the session data tree.
//!
//! Centralizes the layout used throughout the pipeline so that individual
//! stages don't hardcode path construction:
//!
//! ```text
//! <data_root>/<day>/
//!     trials.json
//!     probe.<tower>.<probe>.toml
//!     sorter/<tower>.<probe>/group_<recs>/   sorter output (npy + tsv)
//!     <rec>/meta.<tower>.<probe>.toml        timing metadata per recording
//! ```

use std::path::{Path, PathBuf};

use regex::Regex;
use walkdir::WalkDir;

/// Identifies one probe within a session day.
#[derive(Debug, Clone)]
pub struct SessionKey {
    pub day: String,
    pub tower: String,
    pub probe: i64,
}

impl SessionKey {
    pub fn new(day: &str, tower: &str, probe: i64) -> Self {
        Self {
            day: day.to_string(),
            tower: tower.to_string(),
            probe,
        }
    }
}

/// Build the recording name string used in sorter directory names.
pub fn rec_name_str(recs: &[String]) -> String {
    recs.join("_")
}

/// Sorter output directory for a recording group.
///
/// `<data_root>/<day>/sorter/<tower>.<probe>/group_<recs>/`
pub fn sorter_dir(data_root: &Path, key: &SessionKey, recs: &[String]) -> PathBuf {
    data_root
        .join(&key.day)
        .join("sorter")
        .join(format!("{}.{}", key.tower, key.probe))
        .join(format!("group_{}", rec_name_str(recs)))
}

/// Timing metadata file for one recording.
///
/// `<data_root>/<day>/<rec>/meta.<tower>.<probe>.toml`
pub fn meta_file(data_root: &Path, key: &SessionKey, rec: &str) -> PathBuf {
    data_root
        .join(&key.day)
        .join(rec)
        .join(format!("meta.{}.{}.toml", key.tower, key.probe))
}

/// Trial store for a session day.
pub fn trials_file(data_root: &Path, day: &str) -> PathBuf {
    data_root.join(day).join("trials.json")
}

/// Probe geometry file for a session day.
pub fn probe_file(data_root: &Path, key: &SessionKey) -> PathBuf {
    data_root
        .join(&key.day)
        .join(format!("probe.{}.{}.toml", key.tower, key.probe))
}

/// List recording directories under a session day, sorted by name.
///
/// A recording directory is a direct child of the day directory whose name is
/// all digits (e.g. `001`, `002`). Used when the CLI is given no explicit
/// recording list.
pub fn list_recordings(data_root: &Path, day: &str) -> Vec<String> {
    let day_dir = data_root.join(day);
    let rec_pattern = Regex::new(r"^\d+$").unwrap();

    let mut recs: Vec<String> = WalkDir::new(&day_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .filter(|name| rec_pattern.is_match(name))
        .collect();
    recs.sort();
    recs
}
