//! Timebase reprojection: probe clock → auxiliary clock → behavioral clock.
//!
//! Spike times arrive in probe-clock samples, possibly concatenated across
//! several recordings of one session. Each recording's segment is cut out of
//! the concatenated stream by cumulative duration, shifted to local
//! probe-clock seconds, and pushed through the two affine drift corrections.

use std::path::Path;

use ndarray::{s, Array3};
use thiserror::Error;

use crate::channels::select_channels;
use crate::config::PipelineConfig;
use crate::db::models::ClusterRow;
use crate::db::{Database, DbError};
use crate::paths::{self, SessionKey};
use crate::sorter::meta::{MetaError, RecordingMeta};
use crate::sorter::{load_sorter_dir, SorterError, SorterOutput};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Sorter error: {0}")]
    Sorter(#[from] SorterError),
    #[error("Timing metadata error: {0}")]
    Meta(#[from] MetaError),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

/// Reprojected spike stream for one recording of a group.
pub struct ReprojectedRecording {
    pub rec: String,
    /// Spike times in behavioral-clock seconds (auxiliary-clock seconds when
    /// `aux_only` is set).
    pub spike_times: Vec<f64>,
    /// Cluster assignment per spike, 0-indexed.
    pub spike_clusters: Vec<i64>,
    /// Per-spike PC records for the selected spikes.
    pub pc_feat: Array3<f64>,
    /// Per-spike scaling amplitudes for the selected spikes.
    pub temp_scaling_amps: Vec<f64>,
    /// Set when `aux_to_behavioral` was missing and the final affine stage
    /// was skipped for this recording.
    pub aux_only: bool,
}

/// Split a (possibly concatenated) sorter spike stream into per-recording
/// segments and apply the two-stage drift correction to each.
///
/// Boundary rule: a segment covers `Θ < t ≤ Θ + duration`, so a spike landing
/// exactly on a recording boundary belongs to the earlier recording. The very
/// first segment also admits `t = 0`. Within each recording the output
/// preserves input order; no ordering is promised across recordings.
pub fn reproject(
    sp: &SorterOutput,
    group: &[(String, RecordingMeta)],
) -> Vec<ReprojectedRecording> {
    let mut out = Vec::with_capacity(group.len());
    let mut offset = 0.0_f64;

    for (i_r, (rec, meta)) in group.iter().enumerate() {
        let duration = meta.duration_sec();
        let first = i_r == 0;

        let selected: Vec<usize> = sp
            .spike_times_sec
            .iter()
            .enumerate()
            .filter(|&(_, &t)| {
                let above = if first { t >= offset } else { t > offset };
                above && t <= offset + duration
            })
            .map(|(i, _)| i)
            .collect();

        let aux_only = meta.aux_to_behavioral.is_none();
        if aux_only {
            log::warn!(
                "Recording {rec}: no behavioral sync model; emitting auxiliary-clock times"
            );
        }
        let [a0, a1] = meta.probe_to_aux;

        let spike_times: Vec<f64> = selected
            .iter()
            .map(|&i| {
                let u = sp.spike_times_sec[i] - offset;
                let v = a0 + a1 * u;
                match meta.aux_to_behavioral {
                    Some([b0, b1]) => b0 + b1 * v,
                    None => v,
                }
            })
            .collect();

        let n_sel = selected.len();
        let n_pc = sp.pc_feat.shape()[1];
        let n_local = sp.pc_feat.shape()[2];
        let mut pc_feat = Array3::zeros((n_sel, n_pc, n_local));
        for (dst, &src) in selected.iter().enumerate() {
            pc_feat
                .slice_mut(s![dst, .., ..])
                .assign(&sp.pc_feat.slice(s![src, .., ..]));
        }

        out.push(ReprojectedRecording {
            rec: rec.clone(),
            spike_times,
            spike_clusters: selected.iter().map(|&i| sp.spike_clusters[i]).collect(),
            pc_feat,
            temp_scaling_amps: selected
                .iter()
                .map(|&i| sp.temp_scaling_amps[i])
                .collect(),
            aux_only,
        });

        offset += duration;
    }

    out
}

pub struct ExtractSummary {
    pub recordings: u64,
    pub spikes: u64,
    pub clusters: u64,
}

/// Stage driver: load the sorter output, pick channels, reproject, persist.
///
/// The cluster-to-channel table is computed once per group and written to
/// every member recording; the spike stream is split per recording. Timing
/// metadata must exist for every member because the partition depends on the
/// cumulative durations.
pub fn run_extract(
    db: &Database,
    cfg: &PipelineConfig,
    data_root: &Path,
    key: &SessionKey,
    recs: &[String],
) -> Result<ExtractSummary, ExtractError> {
    let grouped = recs.len() > 1;
    let dir = paths::sorter_dir(data_root, key, recs);
    log::info!("Loading sorter output from {}", dir.display());
    let sp = load_sorter_dir(&dir)?;

    let mut group = Vec::with_capacity(recs.len());
    for rec in recs {
        let meta = RecordingMeta::load(&paths::meta_file(data_root, key, rec))?;
        group.push((rec.clone(), meta));
    }

    let channels = select_channels(&sp);
    let cluster_rows: Vec<ClusterRow> = channels
        .iter()
        .map(|c| ClusterRow {
            cluster_id: c.cluster_id,
            best_channel: c.best_channel,
            worst_channel: c.worst_channel,
            quality: sp.quality_of(c.cluster_id),
            local_channels: sp.local_channels(c.cluster_id),
            isolated: false,
        })
        .collect();

    let parts = reproject(&sp, &group);

    let mut summary = ExtractSummary {
        recordings: 0,
        spikes: 0,
        clusters: cluster_rows.len() as u64,
    };
    for (part, (rec, meta)) in parts.iter().zip(&group) {
        let rid = db.upsert_recording(
            &key.day,
            rec,
            &key.tower,
            key.probe,
            grouped,
            meta.duration_samples,
            meta.sample_rate,
            part.aux_only,
        )?;
        db.store_spike_stream(rid, part, &sp.templates)?;
        db.replace_clusters(rid, &cluster_rows)?;
        log::info!(
            "{}/{}: stored {} spikes, {} clusters",
            key.day,
            rec,
            part.spike_times.len(),
            cluster_rows.len()
        );
        summary.recordings += 1;
        summary.spikes += part.spike_times.len() as u64;
    }

    db.store_curation_settings(&cfg.curation)?;
    Ok(summary)
}
