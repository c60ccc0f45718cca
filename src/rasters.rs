//! Trial-aligned raster extraction.
//!
//! For every cluster and every task type, spikes are sliced into per-trial
//! windows around an alignment event, expressed in ms relative to the event,
//! and concatenated across task types in a fixed order. Each cluster's record
//! also carries rasters for all neighbor clusters sharing its best channel.

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::path::Path;
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::db::models::{ClusterRow, SpikeStream};
use crate::db::{Database, DbError};
use crate::paths::{self, SessionKey};
use crate::trials::{Alignment, RtSpec, TaskKind, Trial};

#[derive(Error, Debug)]
pub enum RasterError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

/// The per-task window shared by every tag except Reach; the
/// `raster.time_window` config key overrides this one.
const DEFAULT_WINDOW: [f64; 2] = [-300.0, 500.0];

/// A cluster's trial-aligned record: one spike list and one reaction time per
/// trial, concatenated across task types in `TaskKind::RASTER_ORDER`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RasterData {
    pub trial_spikes: Vec<Vec<f64>>,
    pub rt: Vec<f64>,
}

/// Slice one cluster's spikes around one event time. Spike times are
/// behavioral seconds; the result is ms relative to the event, window edges
/// inclusive.
fn slice_around_event(spike_times: &[f64], event_ms: f64, window: [f64; 2]) -> Vec<f64> {
    spike_times
        .iter()
        .map(|&t| t * 1000.0 - event_ms)
        .filter(|&rel| rel >= window[0] && rel <= window[1])
        .collect()
}

fn effective_window(alignment: &Alignment, default_window: [f64; 2]) -> [f64; 2] {
    if alignment.window == DEFAULT_WINDOW {
        default_window
    } else {
        alignment.window
    }
}

/// Build the raster block for one task type.
///
/// The primary alignment event is used unless it is missing on every trial,
/// in which case the fallback (when the task has one) takes over. A trial
/// missing the chosen event contributes an empty slice and a NaN reaction
/// time, never an error.
fn build_task_block(
    trials: &[&Trial],
    spike_times: &[f64],
    task: TaskKind,
    neighbor: bool,
    default_window: [f64; 2],
) -> RasterData {
    if trials.is_empty() {
        return RasterData::default();
    }

    let alignment = if neighbor {
        task.neighbor_alignment()
    } else {
        task.alignment()
    };
    let window = effective_window(&alignment, default_window);

    let mut event = alignment.primary;
    if trials.iter().all(|t| t.event(event).is_none()) {
        if let Some(fb) = alignment.fallback {
            event = fb;
        }
    }

    let mut trial_spikes: Vec<Vec<f64>> = trials
        .iter()
        .map(|t| match t.event(event) {
            Some(e) => slice_around_event(spike_times, e, window),
            None => Vec::new(),
        })
        .collect();

    let mut rt: Vec<f64> = trials
        .iter()
        .map(|t| match task.rt_spec() {
            RtSpec::None => f64::NAN,
            RtSpec::FromAlignment { numerator } => {
                diff(t.event(numerator), t.event(event))
            }
            RtSpec::DisGoOrGo { numerator } => {
                let den = t.event("disGo").or_else(|| t.event("Go"));
                diff(t.event(numerator), den)
            }
            RtSpec::Fixed {
                numerator,
                denominator,
            } => diff(t.event(numerator), t.event(denominator)),
        })
        .collect();

    // Touch sessions without saccade events realign on StartOn and take the
    // trial-local StartOn - End difference instead.
    if task == TaskKind::Touch && !rt.is_empty() && rt.iter().all(|r| r.is_nan()) {
        trial_spikes = trials
            .iter()
            .map(|t| match t.event("StartOn") {
                Some(e) => slice_around_event(spike_times, e, window),
                None => Vec::new(),
            })
            .collect();
        rt = trials
            .iter()
            .map(|t| diff(t.event("StartOn"), t.event("End")))
            .collect();
    }

    RasterData { trial_spikes, rt }
}

fn diff(a: Option<f64>, b: Option<f64>) -> f64 {
    match (a, b) {
        (Some(x), Some(y)) => x - y,
        _ => f64::NAN,
    }
}

/// Build a cluster's full cross-task raster record.
pub fn build_cluster_raster(
    trials: &[Trial],
    spike_times: &[f64],
    neighbor: bool,
    default_window: [f64; 2],
) -> RasterData {
    let mut out = RasterData::default();
    for task in TaskKind::RASTER_ORDER {
        let task_trials: Vec<&Trial> = trials.iter().filter(|t| t.task == task).collect();
        if task_trials.is_empty() {
            continue;
        }
        let block = build_task_block(&task_trials, spike_times, task, neighbor, default_window);
        out.trial_spikes.extend(block.trial_spikes);
        out.rt.extend(block.rt);
    }
    out
}

pub struct RasterSummary {
    pub built: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Build and persist raster records for every cluster of every listed
/// recording. Clusters that already have a record are skipped unless `force`.
pub fn run_rasters(
    db: &Database,
    cfg: &PipelineConfig,
    data_root: &Path,
    key: &SessionKey,
    recs: &[String],
    force: bool,
    jobs: usize,
) -> Result<RasterSummary, RasterError> {
    let default_window = cfg.raster.time_window;
    let mut summary = RasterSummary {
        built: 0,
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
        let Some(stream) = db.load_spike_stream(rid)? else {
            log::error!(
                "No spike stream for {}/{}; run extract first. Skipping.",
                key.day,
                rec
            );
            summary.failed += 1;
            continue;
        };
        let clusters = db.load_clusters(rid)?;
        let trials = match crate::trials::load_trials(&paths::trials_file(data_root, &key.day), rec)
        {
            Ok(trials) => trials,
            Err(e) => {
                log::error!("{}/{}: {e}. Skipping recording.", key.day, rec);
                summary.failed += 1;
                continue;
            }
        };

        let todo: Vec<&ClusterRow> = if force {
            clusters.iter().collect()
        } else {
            let mut pending = Vec::new();
            for c in &clusters {
                if db.has_raster(rid, c.cluster_id)? {
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
            "Building rasters for {} clusters in {}/{} ({} trials)",
            todo.len(),
            key.day,
            rec,
            trials.len()
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

        let chunk_size = (jobs * 2).max(1);
        for chunk in todo.chunks(chunk_size) {
            type Built = (i64, RasterData, Vec<(i64, RasterData)>);
            let results: Vec<Built> = pool.install(|| {
                chunk
                    .par_iter()
                    .map(|&cluster| {
                        let built =
                            build_one(&stream, &clusters, cluster, &trials, default_window);
                        pb.inc(1);
                        built
                    })
                    .collect()
            });

            for (cid, own, neighbors) in results {
                match db.store_raster(rid, cid, &own, &neighbors) {
                    Ok(()) => summary.built += 1,
                    Err(e) => {
                        log::error!("DB error storing raster for cluster {cid}: {e}");
                        summary.failed += 1;
                    }
                }
            }
        }
        pb.finish_with_message("done");
    }

    Ok(summary)
}

fn build_one(
    stream: &SpikeStream,
    all_clusters: &[ClusterRow],
    cluster: &ClusterRow,
    trials: &[Trial],
    default_window: [f64; 2],
) -> (i64, RasterData, Vec<(i64, RasterData)>) {
    let times = |cid: i64| -> Vec<f64> {
        stream
            .spikes_of(cid)
            .iter()
            .map(|&i| stream.spike_times[i])
            .collect()
    };

    let own = build_cluster_raster(trials, &times(cluster.cluster_id), false, default_window);

    let neighbors: Vec<(i64, RasterData)> = all_clusters
        .iter()
        .filter(|c| {
            c.cluster_id != cluster.cluster_id && c.best_channel == cluster.best_channel
        })
        .map(|c| {
            (
                c.cluster_id,
                build_cluster_raster(trials, &times(c.cluster_id), true, default_window),
            )
        })
        .collect();

    (cluster.cluster_id, own, neighbors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trials::Trial;

    #[test]
    fn test_co_windowing() {
        // One CO trial, TargsOn at 1000 ms, spikes at 400..1600 ms
        let trials = vec![Trial::for_test(
            "001",
            0,
            TaskKind::Co,
            &[("TargsOn", 1000.0), ("SaccStart", 1234.0)],
        )];
        let spikes_sec = vec![0.4, 0.7, 0.9, 1.1, 1.4, 1.6];
        let r = build_cluster_raster(&trials, &spikes_sec, false, DEFAULT_WINDOW);
        assert_eq!(r.trial_spikes.len(), 1);
        assert_eq!(r.trial_spikes[0], vec![-300.0, -100.0, 100.0, 400.0]);
        assert_eq!(r.rt, vec![234.0]);
    }

    #[test]
    fn test_window_conformance() {
        let trials = vec![Trial::for_test("001", 0, TaskKind::Reach, &[
            ("ReachStart", 2000.0),
            ("TargsOn", 1500.0),
        ])];
        let spikes_sec: Vec<f64> = (0..400).map(|i| 1.5 + i as f64 * 0.005).collect();
        let r = build_cluster_raster(&trials, &spikes_sec, false, DEFAULT_WINDOW);
        for &rel in &r.trial_spikes[0] {
            assert!((-400.0..=400.0).contains(&rel));
        }
        assert_eq!(r.rt, vec![500.0]);
    }

    #[test]
    fn test_primary_fallback_when_missing_everywhere() {
        // No trial has TargsOn: CO falls back to disTargsOn
        let trials = vec![
            Trial::for_test("001", 0, TaskKind::Co, &[("disTargsOn", 1000.0)]),
            Trial::for_test("001", 1, TaskKind::Co, &[("disTargsOn", 5000.0)]),
        ];
        let spikes_sec = vec![1.0, 5.1];
        let r = build_cluster_raster(&trials, &spikes_sec, false, DEFAULT_WINDOW);
        assert_eq!(r.trial_spikes[0], vec![0.0]);
        assert_eq!(r.trial_spikes[1], vec![100.0]);
    }

    #[test]
    fn test_primary_used_when_any_trial_has_it() {
        // Second trial lacks the primary: it gets an empty slice, no fallback
        let trials = vec![
            Trial::for_test("001", 0, TaskKind::Co, &[("TargsOn", 1000.0)]),
            Trial::for_test("001", 1, TaskKind::Co, &[("disTargsOn", 5000.0)]),
        ];
        let spikes_sec = vec![1.0, 5.1];
        let r = build_cluster_raster(&trials, &spikes_sec, false, DEFAULT_WINDOW);
        assert_eq!(r.trial_spikes[0], vec![0.0]);
        assert!(r.trial_spikes[1].is_empty());
        assert!(r.rt[1].is_nan());
    }

    #[test]
    fn test_neighbor_co_swap() {
        // Both events present at different times; a neighbor raster aligns on
        // disTargsOn instead of TargsOn.
        let trials = vec![Trial::for_test("001", 0, TaskKind::Co, &[
            ("TargsOn", 1000.0),
            ("disTargsOn", 2000.0),
        ])];
        let spikes_sec = vec![1.05, 2.05];
        let own = build_cluster_raster(&trials, &spikes_sec, false, DEFAULT_WINDOW);
        let nb = build_cluster_raster(&trials, &spikes_sec, true, DEFAULT_WINDOW);
        assert_eq!(own.trial_spikes[0], vec![50.0]);
        assert_eq!(nb.trial_spikes[0], vec![50.0]);
        // Same relative time, but different absolute spike: own slices around
        // 1000 ms, neighbor around 2000 ms.
        assert_eq!(
            slice_around_event(&spikes_sec, 1000.0, DEFAULT_WINDOW),
            vec![50.0]
        );
    }

    #[test]
    fn test_touch_startons_fallback() {
        // No saccade or go events at all: the Touch block realigns on StartOn
        // and takes StartOn - End as the reaction time.
        let trials = vec![Trial::for_test("001", 0, TaskKind::Touch, &[
            ("disTargsOn", 1000.0),
            ("StartOn", 3000.0),
            ("End", 2900.0),
        ])];
        let spikes_sec = vec![1.1, 3.1];
        let r = build_cluster_raster(&trials, &spikes_sec, false, DEFAULT_WINDOW);
        assert_eq!(r.trial_spikes[0], vec![100.0]);
        assert_eq!(r.rt, vec![100.0]);
    }

    #[test]
    fn test_null_rt_is_length_matched_nan() {
        let trials = vec![
            Trial::for_test("001", 0, TaskKind::Null, &[("Pulse_start", 1000.0)]),
            Trial::for_test("001", 1, TaskKind::Null, &[("Pulse_start", 2000.0)]),
        ];
        let r = build_cluster_raster(&trials, &[1.0, 2.0], false, DEFAULT_WINDOW);
        assert_eq!(r.trial_spikes.len(), 2);
        assert_eq!(r.rt.len(), 2);
        assert!(r.rt.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_cross_task_concatenation_order() {
        // Trials arrive interleaved; blocks come out in RASTER_ORDER with
        // Reach before Null before Saccade.
        let trials = vec![
            Trial::for_test("001", 0, TaskKind::Saccade, &[("disTargsOn", 9000.0)]),
            Trial::for_test("001", 1, TaskKind::Reach, &[("ReachStart", 1000.0)]),
            Trial::for_test("001", 2, TaskKind::Null, &[("Pulse_start", 5000.0)]),
        ];
        let spikes_sec = vec![1.0, 5.0, 9.0];
        let r = build_cluster_raster(&trials, &spikes_sec, false, DEFAULT_WINDOW);
        assert_eq!(r.trial_spikes.len(), 3);
        assert_eq!(r.trial_spikes[0], vec![0.0]); // Reach trial
        assert_eq!(r.trial_spikes[1], vec![0.0]); // Null trial
        assert_eq!(r.trial_spikes[2], vec![0.0]); // Saccade trial
    }

    #[test]
    fn test_no_trials_emits_empty() {
        let r = build_cluster_raster(&[], &[1.0, 2.0], false, DEFAULT_WINDOW);
        assert!(r.trial_spikes.is_empty());
        assert!(r.rt.is_empty());
    }

    #[test]
    fn test_disgo_or_go_rt_per_trial() {
        let trials = vec![
            Trial::for_test("001", 0, TaskKind::Saccade, &[
                ("disTargsOn", 1000.0),
                ("SaccStart", 1400.0),
                ("disGo", 1100.0),
                ("Go", 1050.0),
            ]),
            Trial::for_test("001", 1, TaskKind::Saccade, &[
                ("disTargsOn", 2000.0),
                ("SaccStart", 2500.0),
                ("Go", 2100.0),
            ]),
        ];
        let r = build_cluster_raster(&trials, &[], false, DEFAULT_WINDOW);
        // disGo wins when present, Go otherwise
        assert_eq!(r.rt, vec![300.0, 400.0]);
    }
}
