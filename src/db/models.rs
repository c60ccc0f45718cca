use ndarray::Array3;

use crate::sorter::labels::QualityLabel;

/// A recording row. `aux_only` marks recordings whose spike times are still
/// on the auxiliary clock because the behavioral sync model was missing.
#[derive(Debug, Clone)]
pub struct RecordingRow {
    pub id: i64,
    pub day: String,
    pub rec: String,
    pub tower: String,
    pub probe: i64,
    pub grouped: bool,
    pub duration_samples: i64,
    pub sample_rate: f64,
    pub aux_only: bool,
}

/// A cluster row read from the database. Identifiers are 0-indexed here;
/// conversion to the persisted 1-indexed form happens in `queries.rs`.
#[derive(Debug, Clone)]
pub struct ClusterRow {
    pub cluster_id: i64,
    pub best_channel: i64,
    pub worst_channel: i64,
    pub quality: QualityLabel,
    pub local_channels: Vec<i64>,
    pub isolated: bool,
}

/// A reprojected spike stream read back from the database.
pub struct SpikeStream {
    pub spike_times: Vec<f64>,
    pub cluster_ids: Vec<i64>,
    pub temp_scaling_amps: Vec<f64>,
    pub pc_feat: Array3<f64>,
}

impl SpikeStream {
    /// Indices of the spikes assigned to a cluster, in stream order.
    pub fn spikes_of(&self, cluster_id: i64) -> Vec<usize> {
        self.cluster_ids
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c == cluster_id)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Per-recording artifact counts for the stats command.
#[derive(Debug)]
pub struct RecordingStats {
    pub day: String,
    pub rec: String,
    pub n_spikes: i64,
    pub n_clusters: i64,
    pub n_isolation_clusters: i64,
    pub n_rasters: i64,
}
