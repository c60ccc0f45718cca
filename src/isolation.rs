//! Per-cluster isolation scoring over fixed time windows.
//!
//! For every cluster, its reprojected spikes are cut into consecutive
//! windows; in each window the first-PC separation between the cluster's
//! best-channel projections and its worst-channel (noise) projections is
//! expressed in units of the noise standard deviation. Verdicts always start
//! as not-isolated; an external curation step flips them in the database.

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::s;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::db::models::{ClusterRow, SpikeStream};
use crate::db::{Database, DbError};
use crate::paths::SessionKey;
use crate::N_PC;

#[derive(Error, Debug)]
pub enum IsolationError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

/// Isolation verdict for one frame. The scorer always writes `NotIsolated`;
/// only external curation produces `Isolated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NotIsolated,
    Isolated,
}

impl Verdict {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::NotIsolated => 0,
            Self::Isolated => 1,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        if v == 1 {
            Self::Isolated
        } else {
            Self::NotIsolated
        }
    }
}

/// A neighbor cluster's contribution to one frame: identity, whether it
/// carries the good quality label, and its scaled first-three-PC vectors for
/// the spikes it fired inside the frame's window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborWindow {
    pub cluster_id: i64,
    pub good: bool,
    pub pc: Vec<[f64; 3]>,
}

/// One (cluster, time-window) isolation frame.
#[derive(Debug, Clone)]
pub struct IsolationFrame {
    pub t_start: f64,
    pub n_spikes: usize,
    /// `None` for an empty window; NaN on numeric degeneracy.
    pub score: Option<f64>,
    pub signal_mean: Vec<f64>,
    pub noise_mean: Vec<f64>,
    pub noise_std: Vec<f64>,
    pub verdict: Verdict,
    pub clu_wf: Vec<f64>,
    pub noise_wf: Vec<f64>,
    pub neighbors: Vec<NeighborWindow>,
}

/// A neighbor cluster's spikes prepared for window slicing.
pub struct NeighborData {
    pub cluster_id: i64,
    pub good: bool,
    pub spike_times: Vec<f64>,
    pub pc: Vec<[f64; 3]>,
}

/// Score one cluster's windows.
///
/// `spike_times` are behavioral-clock seconds; `p_signal`/`p_noise` are the
/// already-scaled PC 3-vectors on the best and worst channel. Windows cover
/// `[0, Δ·⌈max(T)/Δ⌉]` and are inclusive at both edges, so a spike exactly on
/// a window boundary contributes to both adjacent windows.
pub fn score_cluster(
    spike_times: &[f64],
    p_signal: &[[f64; 3]],
    p_noise: &[[f64; 3]],
    window_sec: f64,
    clu_wf: &[f64],
    noise_wf: &[f64],
    neighbors: &[NeighborData],
) -> Vec<IsolationFrame> {
    let empty_frame = |t_start: f64| IsolationFrame {
        t_start,
        n_spikes: 0,
        score: None,
        signal_mean: Vec::new(),
        noise_mean: Vec::new(),
        noise_std: Vec::new(),
        verdict: Verdict::NotIsolated,
        clu_wf: clu_wf.to_vec(),
        noise_wf: noise_wf.to_vec(),
        neighbors: neighbors
            .iter()
            .map(|n| NeighborWindow {
                cluster_id: n.cluster_id,
                good: n.good,
                pc: Vec::new(),
            })
            .collect(),
    };

    if spike_times.is_empty() {
        return vec![empty_frame(0.0)];
    }

    let max_t = spike_times.iter().cloned().fold(f64::MIN, f64::max);
    let n_frames = ((max_t / window_sec).ceil() as usize).max(1);

    let mut frames = Vec::with_capacity(n_frames);
    for w in 0..n_frames {
        let t0 = w as f64 * window_sec;
        let t1 = t0 + window_sec;

        let in_window: Vec<usize> = spike_times
            .iter()
            .enumerate()
            .filter(|&(_, &t)| t >= t0 && t <= t1)
            .map(|(i, _)| i)
            .collect();

        if in_window.is_empty() {
            frames.push(empty_frame(t0));
            continue;
        }

        let mut signal_mean = vec![0.0_f64; 3];
        let mut noise_mean = vec![0.0_f64; 3];
        let mut noise_std = vec![0.0_f64; 3];
        for k in 0..3 {
            let sig: Vec<f64> = in_window.iter().map(|&i| p_signal[i][k]).collect();
            let noi: Vec<f64> = in_window.iter().map(|&i| p_noise[i][k]).collect();
            signal_mean[k] = crate::stats::mean(&sig);
            noise_mean[k] = crate::stats::mean(&noi);
            noise_std[k] = crate::stats::sample_std(&noi);
        }

        // First PC only; zero noise variance is a degenerate NaN score
        let score = if noise_std[0] == 0.0 || noise_std[0].is_nan() {
            f64::NAN
        } else {
            (signal_mean[0] - noise_mean[0]).abs() / noise_std[0]
        };

        let neighbor_windows = neighbors
            .iter()
            .map(|n| NeighborWindow {
                cluster_id: n.cluster_id,
                good: n.good,
                pc: n
                    .spike_times
                    .iter()
                    .zip(&n.pc)
                    .filter(|&(&t, _)| t >= t0 && t <= t1)
                    .map(|(_, &pc)| pc)
                    .collect(),
            })
            .collect();

        frames.push(IsolationFrame {
            t_start: t0,
            n_spikes: in_window.len(),
            score: Some(score),
            signal_mean,
            noise_mean,
            noise_std,
            verdict: Verdict::NotIsolated,
            clu_wf: clu_wf.to_vec(),
            noise_wf: noise_wf.to_vec(),
            neighbors: neighbor_windows,
        });
    }

    frames
}

/// Scaled PC 3-vectors for a cluster's spikes on one global channel.
/// Channels the sorter never recorded for this template come back as zeros.
fn scaled_pc_on_channel(
    stream: &SpikeStream,
    spikes: &[usize],
    local_channels: &[i64],
    channel: i64,
) -> Vec<[f64; 3]> {
    let local_idx = local_channels.iter().position(|&c| c == channel);
    spikes
        .iter()
        .map(|&si| {
            let mut v = [0.0_f64; 3];
            if let Some(c) = local_idx {
                if c < stream.pc_feat.shape()[2] {
                    let amp = stream.temp_scaling_amps[si];
                    let n_pc = N_PC.min(stream.pc_feat.shape()[1]);
                    for (k, vk) in v.iter_mut().enumerate().take(n_pc) {
                        *vk = stream.pc_feat[[si, k, c]] * amp;
                    }
                }
            }
            v
        })
        .collect()
}

/// Template waveform on one global channel, or NaN when out of range.
fn waveform_on_channel(
    templates: &ndarray::Array3<f64>,
    cluster_id: i64,
    channel: i64,
) -> Vec<f64> {
    let row = cluster_id as usize;
    let col = channel as usize;
    let n_samples = templates.shape()[1];
    if row < templates.shape()[0] && col < templates.shape()[2] {
        templates.slice(s![row, .., col]).to_vec()
    } else {
        vec![f64::NAN; n_samples.max(1)]
    }
}

pub struct IsolationSummary {
    pub scored: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Score every cluster of every listed recording and persist the frames.
/// Clusters that already have frames are skipped unless `force` is set.
pub fn run_isolation(
    db: &Database,
    cfg: &PipelineConfig,
    key: &SessionKey,
    recs: &[String],
    force: bool,
    jobs: usize,
) -> Result<IsolationSummary, IsolationError> {
    let window_sec = cfg.isolation.window_sec;
    let mut summary = IsolationSummary {
        scored: 0,
        skipped: 0,
        failed: 0,
    };

    for rec in recs {
        let Some(recording) = db.find_recording(&key.day, rec, &key.tower, key.probe)? else {
            log::error!(
                "Recording {}/{} not in database; run extract first. Skipping.",
                key.day,
                rec
            );
            summary.failed += 1;
            continue;
        };
        let rid = recording.id;
        let (Some(stream), Some(templates)) =
            (db.load_spike_stream(rid)?, db.load_templates(rid)?)
        else {
            log::error!(
                "No spike stream for {}/{}; run extract first. Skipping.",
                key.day,
                rec
            );
            summary.failed += 1;
            continue;
        };
        let clusters = db.load_clusters(rid)?;

        let todo: Vec<&ClusterRow> = if force {
            clusters.iter().collect()
        } else {
            let mut pending = Vec::new();
            for c in &clusters {
                if db.has_isolation_frames(rid, c.cluster_id)? {
                    summary.skipped += 1;
                } else {
                    pending.push(c);
                }
            }
            pending
        };

        if todo.is_empty() {
            continue;
        }
        log::info!(
            "Scoring isolation for {} clusters in {}/{} (window {window_sec} s)",
            todo.len(),
            key.day,
            rec
        );

        let pb = ProgressBar::new(todo.len() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build()
            .unwrap();

        // Analyze a chunk in parallel, write to the DB, move on. Keeps memory
        // bounded and leaves completed clusters behind on a crash.
        let chunk_size = (jobs * 2).max(1);
        for chunk in todo.chunks(chunk_size) {
            let results: Vec<(i64, Vec<IsolationFrame>)> = pool.install(|| {
                chunk
                    .par_iter()
                    .map(|&cluster| {
                        let frames =
                            score_one(&stream, &templates, &clusters, cluster, window_sec);
                        pb.inc(1);
                        (cluster.cluster_id, frames)
                    })
                    .collect()
            });

            for (cid, frames) in results {
                match db.store_isolation_frames(rid, cid, &frames) {
                    Ok(()) => summary.scored += 1,
                    Err(e) => {
                        log::error!("DB error storing isolation for cluster {cid}: {e}");
                        summary.failed += 1;
                    }
                }
            }
        }
        pb.finish_with_message("done");
    }

    Ok(summary)
}

fn score_one(
    stream: &SpikeStream,
    templates: &ndarray::Array3<f64>,
    all_clusters: &[ClusterRow],
    cluster: &ClusterRow,
    window_sec: f64,
) -> Vec<IsolationFrame> {
    let spikes = stream.spikes_of(cluster.cluster_id);
    let times: Vec<f64> = spikes.iter().map(|&i| stream.spike_times[i]).collect();

    let p_signal = scaled_pc_on_channel(
        stream,
        &spikes,
        &cluster.local_channels,
        cluster.best_channel,
    );
    let p_noise = scaled_pc_on_channel(
        stream,
        &spikes,
        &cluster.local_channels,
        cluster.worst_channel,
    );

    let clu_wf = waveform_on_channel(templates, cluster.cluster_id, cluster.best_channel);
    let noise_wf = waveform_on_channel(templates, cluster.cluster_id, cluster.worst_channel);

    // Neighbors: every other cluster whose best channel matches
    let neighbors: Vec<NeighborData> = all_clusters
        .iter()
        .filter(|c| {
            c.cluster_id != cluster.cluster_id && c.best_channel == cluster.best_channel
        })
        .map(|c| {
            let n_spikes = stream.spikes_of(c.cluster_id);
            NeighborData {
                cluster_id: c.cluster_id,
                good: c.quality == crate::sorter::labels::QualityLabel::Good,
                spike_times: n_spikes.iter().map(|&i| stream.spike_times[i]).collect(),
                pc: scaled_pc_on_channel(
                    stream,
                    &n_spikes,
                    &c.local_channels,
                    cluster.best_channel,
                ),
            }
        })
        .collect();

    score_cluster(
        &times,
        &p_signal,
        &p_noise,
        window_sec,
        &clu_wf,
        &noise_wf,
        &neighbors,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_pc(vals: &[f64]) -> Vec<[f64; 3]> {
        vals.iter().map(|&v| [v, 0.0, 0.0]).collect()
    }

    #[test]
    fn test_constructed_score() {
        // Ten spikes in one window; signal first-PC all 10, noise five 0s and
        // five 1s. Expected sample std sqrt(2.5/9), score ≈ 18.02.
        let times: Vec<f64> = (0..10).map(|i| 1.0 + i as f64).collect();
        let p_signal = constant_pc(&[10.0; 10]);
        let p_noise = constant_pc(&[0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0]);

        let frames = score_cluster(&times, &p_signal, &p_noise, 100.0, &[], &[], &[]);
        assert_eq!(frames.len(), 1);
        let f = &frames[0];
        assert_eq!(f.n_spikes, 10);
        assert!((f.signal_mean[0] - 10.0).abs() < 1e-12);
        assert!((f.noise_mean[0] - 0.5).abs() < 1e-12);
        let expected_std = (2.5_f64 / 9.0).sqrt();
        assert!((f.noise_std[0] - expected_std).abs() < 1e-12);
        let expected_score = 9.5 / expected_std;
        assert!((f.score.unwrap() - expected_score).abs() < 1e-10);
        assert!((f.score.unwrap() - 18.02).abs() < 0.01);
        assert_eq!(f.verdict, Verdict::NotIsolated);
    }

    #[test]
    fn test_zero_variance_noise_is_nan() {
        let times = vec![1.0, 2.0, 3.0];
        let p_signal = constant_pc(&[5.0, 5.0, 5.0]);
        let p_noise = constant_pc(&[1.0, 1.0, 1.0]);
        let frames = score_cluster(&times, &p_signal, &p_noise, 100.0, &[], &[], &[]);
        assert!(frames[0].score.unwrap().is_nan());
    }

    #[test]
    fn test_single_spike_window_is_nan() {
        let frames = score_cluster(
            &[1.0],
            &constant_pc(&[5.0]),
            &constant_pc(&[1.0]),
            100.0,
            &[],
            &[],
            &[],
        );
        assert!(frames[0].score.unwrap().is_nan());
    }

    #[test]
    fn test_no_spikes_emits_single_empty_frame() {
        let frames = score_cluster(&[], &[], &[], 100.0, &[1.0, 2.0], &[0.1, 0.2], &[]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].n_spikes, 0);
        assert!(frames[0].score.is_none());
        assert!(frames[0].signal_mean.is_empty());
        assert_eq!(frames[0].verdict, Verdict::NotIsolated);
        assert_eq!(frames[0].clu_wf, vec![1.0, 2.0]);
    }

    #[test]
    fn test_window_partition_and_gaps() {
        // Spikes at 50 and 250 s with Δ=100: three windows, middle one empty.
        let times = vec![50.0, 250.0];
        let p = constant_pc(&[1.0, 2.0]);
        let frames = score_cluster(&times, &p, &p, 100.0, &[], &[], &[]);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].n_spikes, 1);
        assert_eq!(frames[1].n_spikes, 0);
        assert!(frames[1].score.is_none());
        assert_eq!(frames[2].n_spikes, 1);
        assert_eq!(frames[2].t_start, 200.0);
    }

    #[test]
    fn test_boundary_spike_counts_in_both_windows() {
        let times = vec![50.0, 100.0, 150.0];
        let p = constant_pc(&[1.0, 2.0, 3.0]);
        let frames = score_cluster(&times, &p, &p, 100.0, &[], &[], &[]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].n_spikes, 2);
        assert_eq!(frames[1].n_spikes, 2);
    }

    #[test]
    fn test_neighbor_pc_restricted_to_window() {
        let times = vec![50.0, 150.0];
        let p = constant_pc(&[1.0, 2.0]);
        let neighbors = vec![NeighborData {
            cluster_id: 7,
            good: true,
            spike_times: vec![10.0, 140.0, 160.0],
            pc: vec![[1.0, 0.0, 0.0], [2.0, 0.0, 0.0], [3.0, 0.0, 0.0]],
        }];
        let frames = score_cluster(&times, &p, &p, 100.0, &[], &[], &neighbors);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].neighbors[0].pc, vec![[1.0, 0.0, 0.0]]);
        assert_eq!(
            frames[1].neighbors[0].pc,
            vec![[2.0, 0.0, 0.0], [3.0, 0.0, 0.0]]
        );
        assert!(frames[0].neighbors[0].good);
        assert_eq!(frames[0].neighbors[0].cluster_id, 7);
    }

    #[test]
    fn test_idempotent_scoring() {
        let times = vec![1.0, 2.0, 3.0, 150.0, 160.0];
        let p_signal = constant_pc(&[4.0, 5.0, 6.0, 7.0, 8.0]);
        let p_noise = constant_pc(&[0.0, 1.0, 0.0, 1.0, 0.0]);
        let a = score_cluster(&times, &p_signal, &p_noise, 100.0, &[], &[], &[]);
        let b = score_cluster(&times, &p_signal, &p_noise, 100.0, &[], &[], &[]);
        assert_eq!(a.len(), b.len());
        for (fa, fb) in a.iter().zip(&b) {
            assert_eq!(fa.score, fb.score);
            assert_eq!(fa.signal_mean, fb.signal_mean);
            assert_eq!(fa.noise_std, fb.noise_std);
        }
    }
}
