//! Isolated-unit selection.
//!
//! Scans every cluster's frame-0 verdict (set by the external curation step)
//! and appends the isolated subset — spike stream and cluster table — to the
//! per-recording container.

use thiserror::Error;

use crate::db::{Database, DbError};
use crate::isolation::Verdict;
use crate::paths::SessionKey;

#[derive(Error, Debug)]
pub enum IsolatedError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

pub struct IsolatedSummary {
    pub recordings: u64,
    pub isolated_clusters: u64,
    pub isolated_spikes: u64,
}

/// Derive the isolated spike stream and cluster table for each recording.
pub fn run_isolated(
    db: &Database,
    key: &SessionKey,
    recs: &[String],
) -> Result<IsolatedSummary, IsolatedError> {
    let mut summary = IsolatedSummary {
        recordings: 0,
        isolated_clusters: 0,
        isolated_spikes: 0,
    };

    for rec in recs {
        let Some(recording) = db.find_recording(&key.day, rec, &key.tower, key.probe)? else {
            log::error!(
                "Recording {}/{} not in database; run extract first. Skipping.",
                key.day,
                rec
            );
            continue;
        };
        let rid = recording.id;
        let Some(stream) = db.load_spike_stream(rid)? else {
            log::error!(
                "No spike stream for {}/{}; run extract first. Skipping.",
                key.day,
                rec
            );
            continue;
        };

        // A cluster is isolated iff its frame-0 verdict says so
        let iso_ids: Vec<i64> = db
            .frame0_verdicts(rid)?
            .into_iter()
            .filter(|&(_, v)| v == Verdict::Isolated)
            .map(|(cid, _)| cid)
            .collect();

        let mut iso_times = Vec::new();
        let mut iso_clusters = Vec::new();
        for (i, &cid) in stream.cluster_ids.iter().enumerate() {
            if iso_ids.contains(&cid) {
                iso_times.push(stream.spike_times[i]);
                iso_clusters.push(cid);
            }
        }

        db.store_isolated_stream(rid, &iso_times, &iso_clusters)?;
        db.mark_isolated(rid, &iso_ids)?;

        log::info!(
            "{}/{}: {} isolated clusters, {} isolated spikes",
            key.day,
            rec,
            iso_ids.len(),
            iso_times.len()
        );
        summary.recordings += 1;
        summary.isolated_clusters += iso_ids.len() as u64;
        summary.isolated_spikes += iso_times.len() as u64;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ClusterRow;
    use crate::isolation::{score_cluster, Verdict};
    use crate::reproject::ReprojectedRecording;
    use crate::sorter::labels::QualityLabel;
    use ndarray::Array3;

    fn cluster_row(cid: i64) -> ClusterRow {
        ClusterRow {
            cluster_id: cid,
            best_channel: 0,
            worst_channel: 1,
            quality: QualityLabel::Good,
            local_channels: vec![0, 1],
            isolated: false,
        }
    }

    #[test]
    fn test_isolated_subset_derivation() {
        let db = Database::open_in_memory().unwrap();
        let key = SessionKey::new("240115", "towerA", 1);
        let rid = db
            .upsert_recording("240115", "001", "towerA", 1, false, 30_000, 30_000.0, false)
            .unwrap();

        let part = ReprojectedRecording {
            rec: "001".to_string(),
            spike_times: vec![0.1, 0.2, 0.3, 0.4],
            spike_clusters: vec![0, 1, 0, 1],
            pc_feat: Array3::zeros((4, 3, 2)),
            temp_scaling_amps: vec![1.0; 4],
            aux_only: false,
        };
        db.store_spike_stream(rid, &part, &Array3::zeros((2, 61, 4)))
            .unwrap();
        db.replace_clusters(rid, &[cluster_row(0), cluster_row(1)])
            .unwrap();

        // Frames for both clusters, then curation marks cluster 1 isolated
        for cid in 0..2 {
            let frames = score_cluster(
                &[0.1],
                &[[1.0, 0.0, 0.0]],
                &[[0.0, 0.0, 0.0]],
                100.0,
                &[],
                &[],
                &[],
            );
            db.store_isolation_frames(rid, cid, &frames).unwrap();
        }
        db.set_verdict(rid, 1, 0, Verdict::Isolated).unwrap();

        let summary = run_isolated(&db, &key, &["001".to_string()]).unwrap();
        assert_eq!(summary.isolated_clusters, 1);
        assert_eq!(summary.isolated_spikes, 2);

        let (times, ids) = db.load_isolated_stream(rid).unwrap().unwrap();
        assert_eq!(times, vec![0.2, 0.4]);
        assert_eq!(ids, vec![1, 1]);

        let clusters = db.load_clusters(rid).unwrap();
        assert!(!clusters[0].isolated);
        assert!(clusters[1].isolated);
    }

    #[test]
    fn test_unextracted_recording_is_skipped_not_fatal() {
        let db = Database::open_in_memory().unwrap();
        let key = SessionKey::new("240115", "towerA", 1);
        // Recording row exists but extract never stored its spike stream
        db.upsert_recording("240115", "001", "towerA", 1, false, 30_000, 30_000.0, false)
            .unwrap();
        let rid = db
            .upsert_recording("240115", "002", "towerA", 1, false, 30_000, 30_000.0, false)
            .unwrap();
        let part = ReprojectedRecording {
            rec: "002".to_string(),
            spike_times: vec![0.1],
            spike_clusters: vec![0],
            pc_feat: Array3::zeros((1, 3, 2)),
            temp_scaling_amps: vec![1.0],
            aux_only: false,
        };
        db.store_spike_stream(rid, &part, &Array3::zeros((1, 61, 4)))
            .unwrap();
        db.replace_clusters(rid, &[cluster_row(0)]).unwrap();

        // The missing stream in 001 is skipped; 002 still gets its subset
        let summary =
            run_isolated(&db, &key, &["001".to_string(), "002".to_string()]).unwrap();
        assert_eq!(summary.recordings, 1);
        assert!(db.load_isolated_stream(rid).unwrap().is_some());
    }

    #[test]
    fn test_no_isolated_clusters_yields_empty_subset() {
        let db = Database::open_in_memory().unwrap();
        let key = SessionKey::new("240115", "towerA", 1);
        let rid = db
            .upsert_recording("240115", "001", "towerA", 1, false, 30_000, 30_000.0, false)
            .unwrap();
        let part = ReprojectedRecording {
            rec: "001".to_string(),
            spike_times: vec![0.1],
            spike_clusters: vec![0],
            pc_feat: Array3::zeros((1, 3, 2)),
            temp_scaling_amps: vec![1.0],
            aux_only: false,
        };
        db.store_spike_stream(rid, &part, &Array3::zeros((1, 61, 4)))
            .unwrap();
        db.replace_clusters(rid, &[cluster_row(0)]).unwrap();

        let summary = run_isolated(&db, &key, &["001".to_string()]).unwrap();
        assert_eq!(summary.isolated_clusters, 0);
        let (times, ids) = db.load_isolated_stream(rid).unwrap().unwrap();
        assert!(times.is_empty());
        assert!(ids.is_empty());
    }
}
