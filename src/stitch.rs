//! Cross-recording neuron stitching.
//!
//! The same neuron recorded in several recordings of one session shows up as
//! different cluster ids. Candidates are paired by electrode neighborhood,
//! peri-event rate-curve correlation and waveform correlation; accepted rows
//! are deduplicated and filtered by a minimum appearance count.

use std::collections::BTreeSet;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::db::{Database, DbError};
use crate::paths::SessionKey;
use crate::probe::{ProbeError, ProbeGeometry};
use crate::psth::{psth, sort_by_rt};
use crate::sorter::labels::QualityLabel;
use crate::stats::pearson;

#[derive(Error, Debug)]
pub enum StitchError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Probe geometry error: {0}")]
    Probe(#[from] ProbeError),
    #[error("Recording {0} not in database; run extract first")]
    MissingRecording(String),
    #[error("No spike stream for recording {0}; run extract first")]
    MissingStream(String),
    #[error("Recording {rec} has no {scope} cluster data: {reason}")]
    ScopeUnavailable {
        rec: String,
        scope: String,
        reason: String,
    },
}

/// Which clusters participate in stitching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StitchScope {
    All,
    Good,
    Isolated,
}

impl StitchScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Good => "good",
            Self::Isolated => "isolated",
        }
    }
}

/// One tracked neuron per row; element `k` is its cluster id in recording
/// `k`, or None where the neuron was not found.
#[derive(Debug, Clone)]
pub struct StitchTable {
    pub day: String,
    pub tower: String,
    pub probe: i64,
    pub recordings: Vec<String>,
    pub scope: StitchScope,
    pub rows: Vec<Vec<Option<i64>>>,
}

/// A cluster prepared for matching: identity, location, and the two
/// similarity signatures.
pub(crate) struct StitchUnit {
    pub cluster_id: i64,
    pub best_channel: i64,
    pub waveform: Vec<f64>,
    pub rate: Vec<f64>,
}

/// Owns everything the matching loop needs; replaces the nest of closures
/// over shared state in older pipelines.
pub struct Stitcher {
    geometry: ProbeGeometry,
    fr_threshold: f64,
    wf_threshold: f64,
    min_recordings: usize,
    channel_range: i64,
    key: SessionKey,
    recs: Vec<String>,
    scope: StitchScope,
    units: Vec<Vec<StitchUnit>>,
}

impl Stitcher {
    /// Pre-compute per-recording unit data (best channel, waveform on that
    /// channel, RT-sorted rate curve) for every cluster in scope.
    pub fn new(
        db: &Database,
        cfg: &PipelineConfig,
        geometry: ProbeGeometry,
        key: &SessionKey,
        recs: &[String],
        scope: StitchScope,
    ) -> Result<Self, StitchError> {
        let rate_window = cfg.raster.time_window;
        let smoothing = cfg.raster.smoothing;
        let rate_len = (rate_window[1] - rate_window[0]) as usize + 1;

        let mut units: Vec<Vec<StitchUnit>> = Vec::with_capacity(recs.len());
        for rec in recs {
            let recording = db
                .find_recording(&key.day, rec, &key.tower, key.probe)?
                .ok_or_else(|| StitchError::MissingRecording(rec.clone()))?;
            let rid = recording.id;
            let templates = db
                .load_templates(rid)?
                .ok_or_else(|| StitchError::MissingStream(rec.clone()))?;
            let clusters = db.load_clusters(rid)?;

            if scope == StitchScope::Isolated && db.load_isolated_stream(rid)?.is_none() {
                return Err(StitchError::ScopeUnavailable {
                    rec: rec.clone(),
                    scope: scope.as_str().to_string(),
                    reason: "isolated-unit selection has not run".to_string(),
                });
            }

            let in_scope = clusters.into_iter().filter(|c| match scope {
                StitchScope::All => true,
                StitchScope::Good => c.quality == QualityLabel::Good,
                StitchScope::Isolated => c.isolated,
            });

            let mut rec_units = Vec::new();
            for c in in_scope {
                let row = c.cluster_id as usize;
                let col = c.best_channel as usize;
                let waveform = if row < templates.shape()[0] && col < templates.shape()[2] {
                    templates.slice(ndarray::s![row, .., col]).to_vec()
                } else {
                    vec![f64::NAN; templates.shape()[1].max(1)]
                };

                // Missing raster data degrades to a NaN curve, which can
                // never win the correlation argmax.
                let rate = match db.load_raster(rid, c.cluster_id)? {
                    Some(raster) => {
                        let (_, sorted) = sort_by_rt(&raster.rt, &raster.trial_spikes);
                        psth(&sorted, rate_window, smoothing)
                    }
                    None => vec![f64::NAN; rate_len],
                };

                rec_units.push(StitchUnit {
                    cluster_id: c.cluster_id,
                    best_channel: c.best_channel,
                    waveform,
                    rate,
                });
            }
            units.push(rec_units);
        }

        Ok(Self {
            geometry,
            fr_threshold: cfg.stitching.fr_corr_threshold,
            wf_threshold: cfg.stitching.wf_corr_threshold,
            min_recordings: cfg.stitching.min_recordings,
            channel_range: cfg.stitching.channel_range,
            key: key.clone(),
            recs: recs.to_vec(),
            scope,
            units,
        })
    }

    pub fn run(&self, jobs: usize) -> StitchTable {
        let rows = stitch_units(
            &self.units,
            &self.geometry,
            self.fr_threshold,
            self.wf_threshold,
            self.min_recordings,
            self.channel_range,
            jobs,
        );
        log::info!(
            "Stitching complete: {} neurons across {} recordings",
            rows.len(),
            self.recs.len()
        );
        StitchTable {
            day: self.key.day.clone(),
            tower: self.key.tower.clone(),
            probe: self.key.probe,
            recordings: self.recs.clone(),
            scope: self.scope,
            rows,
        }
    }
}

/// The matching loop over candidate channels.
pub(crate) fn stitch_units(
    units: &[Vec<StitchUnit>],
    geometry: &ProbeGeometry,
    fr_threshold: f64,
    wf_threshold: f64,
    min_recordings: usize,
    channel_range: i64,
    jobs: usize,
) -> Vec<Vec<Option<i64>>> {
    let num_recs = units.len();

    // Candidate channels: union of best channels of in-scope clusters
    let channels: BTreeSet<i64> = units
        .iter()
        .flat_map(|rec| rec.iter().map(|u| u.best_channel))
        .collect();
    let channels: Vec<i64> = channels.into_iter().collect();

    let pb = ProgressBar::new(channels.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} channels ({eta} remaining)")
            .unwrap()
            .progress_chars("=>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()
        .unwrap();

    // One candidate-row batch per channel; channel order keeps the final
    // table deterministic.
    let per_channel: Vec<Vec<Vec<Option<i64>>>> = pool.install(|| {
        channels
            .par_iter()
            .map(|&chan| {
                let rows = stitch_channel(
                    units,
                    geometry,
                    chan,
                    fr_threshold,
                    wf_threshold,
                    channel_range,
                );
                pb.inc(1);
                rows
            })
            .collect()
    });
    pb.finish_with_message("done");

    // Deduplicate (first occurrence wins), then apply the appearance filter
    let mut seen: std::collections::HashSet<Vec<Option<i64>>> = std::collections::HashSet::new();
    let mut out = Vec::new();
    for row in per_channel.into_iter().flatten() {
        debug_assert_eq!(row.len(), num_recs);
        let found = row.iter().filter(|e| e.is_some()).count();
        if !seen.insert(row.clone()) {
            continue;
        }
        if found >= min_recordings {
            out.push(row);
        }
    }
    out
}

/// Candidate rows for the clusters sitting on one channel.
fn stitch_channel(
    units: &[Vec<StitchUnit>],
    geometry: &ProbeGeometry,
    chan: i64,
    fr_threshold: f64,
    wf_threshold: f64,
    channel_range: i64,
) -> Vec<Vec<Option<i64>>> {
    let num_recs = units.len();
    let nearby: BTreeSet<i64> = geometry
        .neighborhood(chan, channel_range)
        .into_iter()
        .collect();

    // Per recording: every in-scope cluster whose best channel falls in the
    // neighborhood
    let candidates: Vec<Vec<&StitchUnit>> = units
        .iter()
        .map(|rec| {
            rec.iter()
                .filter(|u| nearby.contains(&u.best_channel))
                .collect()
        })
        .collect();

    let mut rows = Vec::new();
    for (i_rec, rec_units) in units.iter().enumerate() {
        for q in rec_units.iter().filter(|u| u.best_channel == chan) {
            let mut row: Vec<Option<i64>> = vec![None; num_recs];
            row[i_rec] = Some(q.cluster_id);

            for (other_rec, cands) in candidates.iter().enumerate() {
                if other_rec == i_rec || cands.is_empty() {
                    continue;
                }

                // NaN correlations become -inf so degenerate candidates
                // cannot win the argmax
                let fr_corrs: Vec<f64> = cands
                    .iter()
                    .map(|u| {
                        let r = pearson(&q.rate, &u.rate);
                        if r.is_nan() {
                            f64::NEG_INFINITY
                        } else {
                            r
                        }
                    })
                    .collect();
                let wf_corrs: Vec<f64> = cands
                    .iter()
                    .map(|u| pearson(&q.waveform, &u.waveform))
                    .collect();

                let mut best = 0;
                for i in 1..fr_corrs.len() {
                    if fr_corrs[i] > fr_corrs[best] {
                        best = i;
                    }
                }

                if fr_corrs[best] >= fr_threshold && wf_corrs[best] >= wf_threshold {
                    row[other_rec] = Some(cands[best].cluster_id);
                }
            }

            rows.push(row);
        }
    }
    rows
}

/// Stage driver: pre-compute, match, persist.
pub fn run_stitch(
    db: &Database,
    cfg: &PipelineConfig,
    data_root: &std::path::Path,
    key: &SessionKey,
    recs: &[String],
    scope: StitchScope,
    jobs: usize,
) -> Result<StitchTable, StitchError> {
    let geometry = ProbeGeometry::load(&crate::paths::probe_file(data_root, key))?;
    let stitcher = Stitcher::new(db, cfg, geometry, key, recs, scope)?;
    let table = stitcher.run(jobs);
    db.store_stitch_table(&table)?;
    Ok(table)
}
