//! Peri-event rate curves from trial-aligned spike lists.

/// Sort per-trial spike lists by reaction time, ascending, NaNs last.
/// Returns the sorted reaction times and the spike lists in the same order.
/// An empty RT vector leaves the trial order untouched.
pub fn sort_by_rt(rt: &[f64], trials: &[Vec<f64>]) -> (Vec<f64>, Vec<Vec<f64>>) {
    if rt.is_empty() {
        return (Vec::new(), trials.to_vec());
    }
    let n = rt.len().min(trials.len());
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| match (rt[a].is_nan(), rt[b].is_nan()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Greater,
        (false, true) => std::cmp::Ordering::Less,
        (false, false) => rt[a].partial_cmp(&rt[b]).unwrap_or(std::cmp::Ordering::Equal),
    });

    let sorted_rt = order.iter().map(|&i| rt[i]).collect();
    let sorted_trials = order.iter().map(|&i| trials[i].clone()).collect();
    (sorted_rt, sorted_trials)
}

/// Gaussian-smoothed peri-event time histogram.
///
/// Spike times are ms relative to the alignment event; the output is a rate
/// vector in spikes/second with one 1-ms sample per integer offset in
/// `[window[0], window[1]]` (length `stop - start + 1`). The smoothing kernel
/// is a normal pdf truncated at ±3σ. Zero trials yields an all-zero vector.
pub fn psth(trials: &[Vec<f64>], window: [f64; 2], sigma_ms: f64) -> Vec<f64> {
    let start = window[0];
    let stop = window[1];
    let n_bins = (stop - start) as usize + 1;
    let n_tr = trials.len();
    if n_tr == 0 {
        return vec![0.0; n_bins];
    }

    // Histogram over n_bins equal-width bins spanning [start, stop]
    let width = (stop - start) / n_bins as f64;
    let mut counts = vec![0.0_f64; n_bins];
    for trial in trials {
        for &t in trial {
            if t < start || t > stop {
                continue;
            }
            let mut bin = ((t - start) / width) as usize;
            if bin >= n_bins {
                bin = n_bins - 1;
            }
            counts[bin] += 1.0;
        }
    }

    // Gaussian kernel truncated at 3 sigma
    let half_width = (3.0 * sigma_ms) as usize;
    let norm = 1.0 / (sigma_ms * (2.0 * std::f64::consts::PI).sqrt());
    let kernel: Vec<f64> = (-(half_width as i64)..=half_width as i64)
        .map(|x| {
            let z = x as f64 / sigma_ms;
            norm * (-0.5 * z * z).exp()
        })
        .collect();

    // Full convolution, then trim back to n_bins
    let full_len = n_bins + kernel.len() - 1;
    let mut conv = vec![0.0_f64; full_len];
    for (i, &c) in counts.iter().enumerate() {
        if c == 0.0 {
            continue;
        }
        for (j, &k) in kernel.iter().enumerate() {
            conv[i + j] += c * k;
        }
    }

    let scale = 1000.0 / n_tr as f64;
    conv[half_width..half_width + n_bins]
        .iter()
        .map(|&v| v * scale)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_by_rt_ascending_nan_last() {
        let rt = vec![300.0, f64::NAN, 100.0, 200.0];
        let trials = vec![vec![3.0], vec![9.0], vec![1.0], vec![2.0]];
        let (srt, strials) = sort_by_rt(&rt, &trials);
        assert_eq!(&srt[..3], &[100.0, 200.0, 300.0]);
        assert!(srt[3].is_nan());
        assert_eq!(strials, vec![vec![1.0], vec![2.0], vec![3.0], vec![9.0]]);
    }

    #[test]
    fn test_empty_rt_keeps_order() {
        let trials = vec![vec![1.0], vec![2.0]];
        let (srt, strials) = sort_by_rt(&[], &trials);
        assert!(srt.is_empty());
        assert_eq!(strials, trials);
    }

    #[test]
    fn test_psth_length_and_scale() {
        let rate = psth(&[vec![0.0]], [-300.0, 500.0], 10.0);
        assert_eq!(rate.len(), 801);
        // One spike in one trial integrates to ~1000 * 1 spike worth of mass
        let mass: f64 = rate.iter().sum::<f64>() / 1000.0;
        assert!((mass - 1.0).abs() < 0.02, "mass = {mass}");
        // Peak sits at the event
        let peak = rate
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert!((peak as i64 - 300).abs() <= 1);
    }

    #[test]
    fn test_psth_zero_trials() {
        let rate = psth(&[], [-300.0, 500.0], 10.0);
        assert_eq!(rate.len(), 801);
        assert!(rate.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_psth_trial_normalization() {
        // Same spikes over twice the trials → half the rate
        let one = psth(&[vec![0.0, 10.0]], [-300.0, 500.0], 10.0);
        let two = psth(&[vec![0.0, 10.0], vec![]], [-300.0, 500.0], 10.0);
        let peak_one = one.iter().cloned().fold(0.0, f64::max);
        let peak_two = two.iter().cloned().fold(0.0, f64::max);
        assert!((peak_one - 2.0 * peak_two).abs() < 1e-9);
    }

    #[test]
    fn test_psth_out_of_window_spikes_ignored() {
        let with = psth(&[vec![0.0, 9999.0, -9999.0]], [-300.0, 500.0], 10.0);
        let without = psth(&[vec![0.0]], [-300.0, 500.0], 10.0);
        assert_eq!(with, without);
    }
}
