//! Best/worst channel selection per cluster.
//!
//! The best channel carries the cluster's template energy peak and is where
//! signal PC projections are read; the worst channel is a low-energy
//! reference used as the noise side of the isolation score. Both picks are
//! guarded by PC feature coverage so that a channel the sorter rarely
//! populated cannot be selected.

use ndarray::s;

use crate::sorter::SorterOutput;

/// Weight of template energy vs PC coverage in the combined score.
const ALPHA: f64 = 1.0;
/// Minimum coverage for the best channel before the guard kicks in.
const BEST_COVERAGE_FLOOR: f64 = 0.5;
/// Minimum coverage for the worst channel before the guard kicks in.
const NOISE_COVERAGE_FLOOR: f64 = 0.1;

/// Channel assignment for one cluster. Channels are global 0-indexed
/// acquisition channels; the `*_local` fields are the corresponding columns
/// of the cluster's PC feature records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterChannels {
    pub cluster_id: i64,
    pub best_channel: i64,
    pub worst_channel: i64,
    pub best_local: usize,
    pub worst_local: usize,
}

/// Pick best and worst channels for every cluster with at least one spike.
/// Zero-spike clusters are omitted entirely.
pub fn select_channels(sp: &SorterOutput) -> Vec<ClusterChannels> {
    let mut out = Vec::new();

    for cid in sp.cluster_ids() {
        let spikes = sp.spikes_of(cid);
        if spikes.is_empty() {
            continue;
        }
        let row = cid as usize;
        if row >= sp.templates.shape()[0] || row >= sp.pc_feat_ind.nrows() {
            log::warn!("Cluster {cid} has no template; skipping channel selection");
            continue;
        }

        let local = sp.local_channels(cid);
        let n_local = local.len();
        if n_local == 0 {
            continue;
        }

        // Template energy per local channel
        let mut energy = vec![0.0_f64; n_local];
        for (c, &chan) in local.iter().enumerate() {
            let col = chan as usize;
            if col >= sp.templates.shape()[2] {
                continue;
            }
            energy[c] = sp
                .templates
                .slice(s![row, .., col])
                .iter()
                .map(|&w| w * w)
                .sum();
        }

        // Fraction of spikes with a non-zero PC column
        let mut coverage = vec![0.0_f64; n_local];
        for (c, cov) in coverage.iter_mut().enumerate() {
            if c >= sp.pc_feat.shape()[2] {
                continue;
            }
            let nonzero = spikes
                .iter()
                .filter(|&&si| sp.pc_feat.slice(s![si, .., c]).iter().any(|&v| v != 0.0))
                .count();
            *cov = nonzero as f64 / spikes.len() as f64;
        }

        let max_energy = energy.iter().cloned().fold(0.0_f64, f64::max).max(f64::MIN_POSITIVE);
        let max_cov = coverage.iter().cloned().fold(0.0_f64, f64::max).max(f64::MIN_POSITIVE);
        let combined: Vec<f64> = (0..n_local)
            .map(|c| ALPHA * energy[c] / max_energy + (1.0 - ALPHA) * coverage[c] / max_cov)
            .collect();

        let mut best = argmax(&combined, None);
        if coverage[best] < BEST_COVERAGE_FLOOR {
            let eligible: Vec<usize> = (0..n_local)
                .filter(|&c| coverage[c] >= BEST_COVERAGE_FLOOR)
                .collect();
            if !eligible.is_empty() {
                best = argmax(&combined, Some(&eligible));
            }
        }

        let mut worst = argmin(&energy, None);
        if coverage[worst] < NOISE_COVERAGE_FLOOR {
            let eligible: Vec<usize> = (0..n_local)
                .filter(|&c| coverage[c] >= NOISE_COVERAGE_FLOOR && energy[c] > 0.0)
                .collect();
            if !eligible.is_empty() {
                worst = argmin(&energy, Some(&eligible));
            }
        }

        out.push(ClusterChannels {
            cluster_id: cid,
            best_channel: local[best],
            worst_channel: local[worst],
            best_local: best,
            worst_local: worst,
        });
    }

    out
}

fn argmax(xs: &[f64], subset: Option<&[usize]>) -> usize {
    let mut best = subset.map(|s| s[0]).unwrap_or(0);
    let indices: Vec<usize> = match subset {
        Some(s) => s.to_vec(),
        None => (0..xs.len()).collect(),
    };
    for &i in &indices {
        if xs[i] > xs[best] {
            best = i;
        }
    }
    best
}

fn argmin(xs: &[f64], subset: Option<&[usize]>) -> usize {
    let mut best = subset.map(|s| s[0]).unwrap_or(0);
    let indices: Vec<usize> = match subset {
        Some(s) => s.to_vec(),
        None => (0..xs.len()).collect(),
    };
    for &i in &indices {
        if xs[i] < xs[best] {
            best = i;
        }
    }
    best
}
