//! Cluster quality labels from the sorter's `cluster_labels.tsv`.

use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Quality label assigned by the sorter (or a later manual pass).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityLabel {
    Noise,
    Mua,
    Good,
    Unsorted,
}

impl QualityLabel {
    pub fn from_str_label(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "noise" => Self::Noise,
            "mua" => Self::Mua,
            "good" => Self::Good,
            _ => Self::Unsorted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Noise => "noise",
            Self::Mua => "mua",
            Self::Good => "good",
            Self::Unsorted => "unsorted",
        }
    }
}

/// Read a tab- or comma-separated label file: `cluster_id<TAB>label`.
/// Header rows and blank lines are skipped. Returns (cluster_id, label)
/// pairs in file order; cluster ids are 0-indexed as in the sorter output.
pub fn read_cluster_labels(path: &Path) -> Result<Vec<(i64, QualityLabel)>, LabelError> {
    let contents = std::fs::read_to_string(path).map_err(|e| LabelError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut out = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split(['\t', ',']);
        let (Some(id_str), Some(label_str)) = (parts.next(), parts.next()) else {
            continue;
        };
        // A non-numeric first column is the header row
        let Ok(cid) = id_str.trim().parse::<i64>() else {
            continue;
        };
        out.push((cid, QualityLabel::from_str_label(label_str)));
    }
    Ok(out)
}
