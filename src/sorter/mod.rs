//! Loading the upstream sorter's output directory.
//!
//! The sorter writes one directory per recording group: spike times in
//! probe-clock samples, per-spike cluster/template assignments, template
//! waveforms, per-spike principal-component features with a per-template
//! local-channel index table, scaling amplitudes, the acquisition channel
//! map, and a quality-label table. All arrays are `.npy`; everything here is
//! read-only to the pipeline.

pub mod labels;
pub mod meta;

use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;

use ndarray::{Array1, Array2, Array3};
use ndarray_npy::{ReadNpyError, ReadNpyExt};
use serde::Deserialize;
use thiserror::Error;

use labels::{read_cluster_labels, LabelError, QualityLabel};

#[derive(Error, Debug)]
pub enum SorterError {
    #[error("Sorter output directory not found: {0}")]
    DirNotFound(String),
    #[error("Missing sorter file: {0}")]
    MissingFile(String),
    #[error("Failed to read {path}: {source}")]
    Npy {
        path: String,
        source: ReadNpyError,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse {path}: {message}")]
    Params { path: String, message: String },
    #[error("Label error: {0}")]
    Label(#[from] LabelError),
}

#[derive(Deserialize)]
struct SorterParams {
    sample_rate: f64,
}

/// Everything loaded from one sorter output directory.
///
/// Cluster and channel identifiers are 0-indexed throughout, matching the
/// sorter's own convention. Spike times are converted to probe-clock seconds
/// on load.
#[derive(Debug)]
pub struct SorterOutput {
    pub sample_rate: f64,
    /// Probe-clock spike times in seconds, ascending.
    pub spike_times_sec: Vec<f64>,
    /// Cluster assignment per spike.
    pub spike_clusters: Vec<i64>,
    /// Per-spike template scaling amplitudes.
    pub temp_scaling_amps: Vec<f64>,
    /// Template waveforms `[nTemplates][nSamples][nChannels]`.
    pub templates: Array3<f64>,
    /// PC features `[nSpikes][nComponents][nLocalChannels]`.
    pub pc_feat: Array3<f64>,
    /// Local-channel index table `[nTemplates][nLocalChannels]` mapping each
    /// PC column to a global channel.
    pub pc_feat_ind: Array2<i64>,
    /// Acquisition channel map, 0-indexed.
    pub chan_map: Vec<i64>,
    /// (cluster_id, quality) pairs from the label table.
    pub labels: Vec<(i64, QualityLabel)>,
}

impl SorterOutput {
    /// Cluster ids to process: the label table if present, otherwise the
    /// distinct ids appearing in the spike stream.
    pub fn cluster_ids(&self) -> Vec<i64> {
        if !self.labels.is_empty() {
            return self.labels.iter().map(|&(cid, _)| cid).collect();
        }
        let set: BTreeSet<i64> = self.spike_clusters.iter().copied().collect();
        set.into_iter().collect()
    }

    /// Quality label of a cluster; unsorted when absent from the label table.
    pub fn quality_of(&self, cluster_id: i64) -> QualityLabel {
        self.labels
            .iter()
            .find(|&&(cid, _)| cid == cluster_id)
            .map(|&(_, q)| q)
            .unwrap_or(QualityLabel::Unsorted)
    }

    /// Global channel of each PC column for a cluster's template.
    pub fn local_channels(&self, cluster_id: i64) -> Vec<i64> {
        let row = cluster_id as usize;
        if row >= self.pc_feat_ind.nrows() {
            return Vec::new();
        }
        self.pc_feat_ind.row(row).to_vec()
    }

    /// Indices of the spikes assigned to a cluster, in stream order.
    pub fn spikes_of(&self, cluster_id: i64) -> Vec<usize> {
        self.spike_clusters
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c == cluster_id)
            .map(|(i, _)| i)
            .collect()
    }
}

fn read_npy<T, D>(dir: &Path, name: &str) -> Result<ndarray::Array<T, D>, SorterError>
where
    T: ndarray_npy::ReadableElement,
    D: ndarray::Dimension,
{
    let path = dir.join(name);
    if !path.exists() {
        return Err(SorterError::MissingFile(path.display().to_string()));
    }
    let file = File::open(&path)?;
    ndarray::Array::<T, D>::read_npy(file).map_err(|e| SorterError::Npy {
        path: path.display().to_string(),
        source: e,
    })
}

/// Load a complete sorter output directory.
pub fn load_sorter_dir(dir: &Path) -> Result<SorterOutput, SorterError> {
    if !dir.is_dir() {
        return Err(SorterError::DirNotFound(dir.display().to_string()));
    }

    let params_path = dir.join("params.toml");
    let sample_rate = if params_path.exists() {
        let contents = std::fs::read_to_string(&params_path)?;
        let params: SorterParams =
            toml::from_str(&contents).map_err(|e| SorterError::Params {
                path: params_path.display().to_string(),
                message: e.to_string(),
            })?;
        params.sample_rate
    } else {
        log::warn!(
            "No params.toml in {}; assuming 30 kHz",
            dir.display()
        );
        30_000.0
    };

    let spike_samples: Array1<i64> = read_npy(dir, "spike_times.npy")?;
    let spike_clusters: Array1<i32> = read_npy(dir, "spike_clusters.npy")?;
    let amps: Array1<f32> = read_npy(dir, "amplitudes.npy")?;
    let templates: Array3<f32> = read_npy(dir, "templates.npy")?;
    let pc_feat: Array3<f32> = read_npy(dir, "pc_features.npy")?;
    let pc_feat_ind: Array2<i32> = read_npy(dir, "pc_feature_ind.npy")?;
    let chan_map: Array1<i32> = read_npy(dir, "channel_map.npy")?;

    let labels_path = dir.join("cluster_labels.tsv");
    let labels = if labels_path.exists() {
        read_cluster_labels(&labels_path)?
    } else {
        log::warn!(
            "No cluster_labels.tsv in {}; all clusters treated as unsorted",
            dir.display()
        );
        Vec::new()
    };

    Ok(SorterOutput {
        sample_rate,
        spike_times_sec: spike_samples
            .iter()
            .map(|&s| s as f64 / sample_rate)
            .collect(),
        spike_clusters: spike_clusters.iter().map(|&c| c as i64).collect(),
        temp_scaling_amps: amps.iter().map(|&a| a as f64).collect(),
        templates: templates.mapv(|v| v as f64),
        pc_feat: pc_feat.mapv(|v| v as f64),
        pc_feat_ind: pc_feat_ind.mapv(|v| v as i64),
        chan_map: chan_map.iter().map(|&c| c as i64).collect(),
        labels,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_npy::WriteNpyExt;

    fn write_npy<T: ndarray_npy::WritableElement, D: ndarray::Dimension>(
        dir: &Path,
        name: &str,
        arr: &ndarray::Array<T, D>,
    ) {
        let file = File::create(dir.join(name)).unwrap();
        arr.write_npy(file).unwrap();
    }

    #[test]
    fn test_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();

        write_npy(dir, "spike_times.npy", &Array1::from(vec![300_i64, 600, 900]));
        write_npy(dir, "spike_clusters.npy", &Array1::from(vec![0_i32, 1, 0]));
        write_npy(dir, "amplitudes.npy", &Array1::from(vec![1.0_f32, 2.0, 3.0]));
        write_npy(dir, "templates.npy", &Array3::<f32>::zeros((2, 61, 4)));
        write_npy(dir, "pc_features.npy", &Array3::<f32>::zeros((3, 3, 2)));
        write_npy(
            dir,
            "pc_feature_ind.npy",
            &Array2::from_shape_vec((2, 2), vec![0_i32, 1, 2, 3]).unwrap(),
        );
        write_npy(dir, "channel_map.npy", &Array1::from(vec![0_i32, 1, 2, 3]));
        std::fs::write(dir.join("params.toml"), "sample_rate = 30000.0\n").unwrap();
        std::fs::write(dir.join("cluster_labels.tsv"), "0\tgood\n1\tmua\n").unwrap();

        let sp = load_sorter_dir(dir).unwrap();
        assert_eq!(sp.sample_rate, 30_000.0);
        assert_eq!(sp.spike_times_sec, vec![0.01, 0.02, 0.03]);
        assert_eq!(sp.spike_clusters, vec![0, 1, 0]);
        assert_eq!(sp.quality_of(0), QualityLabel::Good);
        assert_eq!(sp.quality_of(1), QualityLabel::Mua);
        assert_eq!(sp.local_channels(1), vec![2, 3]);
        assert_eq!(sp.spikes_of(0), vec![0, 2]);
    }

    #[test]
    fn test_missing_file_reported() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("params.toml"), "sample_rate = 30000.0\n").unwrap();
        let err = load_sorter_dir(tmp.path()).unwrap_err();
        assert!(matches!(err, SorterError::MissingFile(_)));
    }

    #[test]
    fn test_cluster_ids_fall_back_to_stream() {
        let sp = test_support::synthetic(vec![0.1, 0.2, 0.3], vec![2, 0, 2], 0, 4, 2);
        assert_eq!(sp.cluster_ids(), vec![0, 2]);
        assert_eq!(sp.quality_of(2), QualityLabel::Unsorted);
    }
}
