//! Query methods on [`Database`].
//!
//! The persistence boundary owns the index convention: cluster ids are stored
//! 1-indexed and channels 0-indexed for compatibility with the legacy
//! containers, while everything in memory is 0-indexed. All `+1`/`-1`
//! conversion lives here.

use ndarray::Array3;
use rusqlite::{params, OptionalExtension};

use super::models::{ClusterRow, RecordingRow, RecordingStats, SpikeStream};
use super::{Database, DbError, Result};
use crate::config::CurationConfig;
use crate::isolation::{IsolationFrame, NeighborWindow, Verdict};
use crate::rasters::RasterData;
use crate::reproject::ReprojectedRecording;
use crate::sorter::labels::QualityLabel;
use crate::stitch::StitchTable;

// ---------------------------------------------------------------------------
// blob / json helpers

fn pack_f64(xs: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(xs.len() * 8);
    for &x in xs {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

fn unpack_f64(bytes: &[u8], table: &str) -> Result<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(DbError::Corrupt {
            table: table.to_string(),
            message: format!("f64 blob length {} not a multiple of 8", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn pack_i64(xs: &[i64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(xs.len() * 8);
    for &x in xs {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

fn unpack_i64(bytes: &[u8], table: &str) -> Result<Vec<i64>> {
    if bytes.len() % 8 != 0 {
        return Err(DbError::Corrupt {
            table: table.to_string(),
            message: format!("i64 blob length {} not a multiple of 8", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn pack_array3(arr: &Array3<f64>) -> (Vec<u8>, String) {
    let dims = serde_json::to_string(&arr.shape().to_vec()).unwrap_or_default();
    let flat: Vec<f64> = arr.iter().copied().collect();
    (pack_f64(&flat), dims)
}

fn unpack_array3(bytes: &[u8], dims_json: &str, table: &str) -> Result<Array3<f64>> {
    let dims: Vec<usize> =
        serde_json::from_str(dims_json).map_err(|e| DbError::Corrupt {
            table: table.to_string(),
            message: format!("bad dims {dims_json}: {e}"),
        })?;
    if dims.len() != 3 {
        return Err(DbError::Corrupt {
            table: table.to_string(),
            message: format!("expected 3 dims, got {dims_json}"),
        });
    }
    let flat = unpack_f64(bytes, table)?;
    Array3::from_shape_vec((dims[0], dims[1], dims[2]), flat).map_err(|e| DbError::Corrupt {
        table: table.to_string(),
        message: e.to_string(),
    })
}

/// Serialize an f64 vector to JSON with NaN mapped to null.
fn json_nullable(xs: &[f64]) -> String {
    let vals: Vec<Option<f64>> = xs
        .iter()
        .map(|&x| if x.is_nan() { None } else { Some(x) })
        .collect();
    serde_json::to_string(&vals).unwrap_or_else(|_| "[]".to_string())
}

/// Parse a nullable JSON vector; null becomes NaN.
fn parse_nullable(s: &str, table: &str) -> Result<Vec<f64>> {
    let vals: Vec<Option<f64>> = serde_json::from_str(s).map_err(|e| DbError::Corrupt {
        table: table.to_string(),
        message: e.to_string(),
    })?;
    Ok(vals.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}

fn json_trials(trials: &[Vec<f64>]) -> String {
    serde_json::to_string(trials).unwrap_or_else(|_| "[]".to_string())
}

fn parse_trials(s: &str, table: &str) -> Result<Vec<Vec<f64>>> {
    serde_json::from_str(s).map_err(|e| DbError::Corrupt {
        table: table.to_string(),
        message: e.to_string(),
    })
}

// ---------------------------------------------------------------------------

impl Database {
    // -- recordings ---------------------------------------------------------

    pub fn upsert_recording(
        &self,
        day: &str,
        rec: &str,
        tower: &str,
        probe: i64,
        grouped: bool,
        duration_samples: i64,
        sample_rate: f64,
        aux_only: bool,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO recordings
                (day, rec, tower, probe, grouped, duration_samples, sample_rate, aux_only)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(day, rec, tower, probe) DO UPDATE SET
                grouped = excluded.grouped,
                duration_samples = excluded.duration_samples,
                sample_rate = excluded.sample_rate,
                aux_only = excluded.aux_only",
            params![day, rec, tower, probe, grouped, duration_samples, sample_rate, aux_only],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT id FROM recordings WHERE day = ?1 AND rec = ?2 AND tower = ?3 AND probe = ?4",
            params![day, rec, tower, probe],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn find_recording(
        &self,
        day: &str,
        rec: &str,
        tower: &str,
        probe: i64,
    ) -> Result<Option<RecordingRow>> {
        self.conn
            .query_row(
                "SELECT id, day, rec, tower, probe, grouped, duration_samples,
                        sample_rate, aux_only
                 FROM recordings
                 WHERE day = ?1 AND rec = ?2 AND tower = ?3 AND probe = ?4",
                params![day, rec, tower, probe],
                row_to_recording,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_recordings(&self) -> Result<Vec<RecordingRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, day, rec, tower, probe, grouped, duration_samples,
                    sample_rate, aux_only
             FROM recordings ORDER BY day, rec",
        )?;
        let rows = stmt
            .query_map([], row_to_recording)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- spike streams ------------------------------------------------------

    /// Initial write of a recording's reprojected spike stream. The isolated
    /// subset columns stay NULL until the isolated-unit selector appends them.
    pub fn store_spike_stream(
        &self,
        recording_id: i64,
        part: &ReprojectedRecording,
        templates: &Array3<f64>,
    ) -> Result<()> {
        // Persisted cluster ids are 1-indexed
        let persisted_ids: Vec<i64> = part.spike_clusters.iter().map(|&c| c + 1).collect();
        let (pc_blob, pc_dims) = pack_array3(&part.pc_feat);
        let (tmpl_blob, tmpl_dims) = pack_array3(templates);

        self.conn.execute(
            "INSERT OR REPLACE INTO spike_streams
                (recording_id, n_spikes, spike_times, cluster_ids,
                 temp_scaling_amps, pc_feat, pc_dims, templates, template_dims)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                recording_id,
                part.spike_times.len() as i64,
                pack_f64(&part.spike_times),
                pack_i64(&persisted_ids),
                pack_f64(&part.temp_scaling_amps),
                pc_blob,
                pc_dims,
                tmpl_blob,
                tmpl_dims,
            ],
        )?;
        Ok(())
    }

    pub fn load_spike_stream(&self, recording_id: i64) -> Result<Option<SpikeStream>> {
        let row = self
            .conn
            .query_row(
                "SELECT spike_times, cluster_ids, temp_scaling_amps, pc_feat, pc_dims
                 FROM spike_streams WHERE recording_id = ?1",
                params![recording_id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((times, ids, amps, pc, pc_dims)) = row else {
            return Ok(None);
        };
        Ok(Some(SpikeStream {
            spike_times: unpack_f64(&times, "spike_streams")?,
            cluster_ids: unpack_i64(&ids, "spike_streams")?
                .into_iter()
                .map(|c| c - 1)
                .collect(),
            temp_scaling_amps: unpack_f64(&amps, "spike_streams")?,
            pc_feat: unpack_array3(&pc, &pc_dims, "spike_streams")?,
        }))
    }

    pub fn load_templates(&self, recording_id: i64) -> Result<Option<Array3<f64>>> {
        let row = self
            .conn
            .query_row(
                "SELECT templates, template_dims FROM spike_streams WHERE recording_id = ?1",
                params![recording_id],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        match row {
            Some((blob, dims)) => Ok(Some(unpack_array3(&blob, &dims, "spike_streams")?)),
            None => Ok(None),
        }
    }

    /// Append the isolated-subset fields to an existing spike stream.
    pub fn store_isolated_stream(
        &self,
        recording_id: i64,
        iso_times: &[f64],
        iso_cluster_ids: &[i64],
    ) -> Result<()> {
        let persisted: Vec<i64> = iso_cluster_ids.iter().map(|&c| c + 1).collect();
        let n = self.conn.execute(
            "UPDATE spike_streams
             SET iso_spike_times = ?2, iso_cluster_ids = ?3
             WHERE recording_id = ?1",
            params![recording_id, pack_f64(iso_times), pack_i64(&persisted)],
        )?;
        if n == 0 {
            return Err(DbError::Corrupt {
                table: "spike_streams".to_string(),
                message: format!("no spike stream for recording {recording_id}"),
            });
        }
        Ok(())
    }

    pub fn load_isolated_stream(
        &self,
        recording_id: i64,
    ) -> Result<Option<(Vec<f64>, Vec<i64>)>> {
        let row = self
            .conn
            .query_row(
                "SELECT iso_spike_times, iso_cluster_ids
                 FROM spike_streams WHERE recording_id = ?1",
                params![recording_id],
                |row| {
                    Ok((
                        row.get::<_, Option<Vec<u8>>>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((Some(times), Some(ids))) => Ok(Some((
                unpack_f64(&times, "spike_streams")?,
                unpack_i64(&ids, "spike_streams")?
                    .into_iter()
                    .map(|c| c - 1)
                    .collect(),
            ))),
            _ => Ok(None),
        }
    }

    // -- clusters -----------------------------------------------------------

    pub fn replace_clusters(&self, recording_id: i64, clusters: &[ClusterRow]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM clusters WHERE recording_id = ?1",
            params![recording_id],
        )?;
        for c in clusters {
            tx.execute(
                "INSERT INTO clusters
                    (recording_id, cluster_id, best_channel, worst_channel,
                     quality, local_channels, isolated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    recording_id,
                    c.cluster_id + 1,
                    c.best_channel,
                    c.worst_channel,
                    c.quality.as_str(),
                    serde_json::to_string(&c.local_channels).unwrap_or_default(),
                    c.isolated,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_clusters(&self, recording_id: i64) -> Result<Vec<ClusterRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT cluster_id, best_channel, worst_channel, quality, local_channels, isolated
             FROM clusters WHERE recording_id = ?1 ORDER BY cluster_id",
        )?;
        let rows = stmt.query_map(params![recording_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (cid, best, worst, quality, local_json, isolated) = row?;
            let local_channels: Vec<i64> =
                serde_json::from_str(&local_json).map_err(|e| DbError::Corrupt {
                    table: "clusters".to_string(),
                    message: e.to_string(),
                })?;
            out.push(ClusterRow {
                cluster_id: cid - 1,
                best_channel: best,
                worst_channel: worst,
                quality: QualityLabel::from_str_label(&quality),
                local_channels,
                isolated,
            });
        }
        Ok(out)
    }

    pub fn mark_isolated(&self, recording_id: i64, cluster_ids: &[i64]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE clusters SET isolated = 0 WHERE recording_id = ?1",
            params![recording_id],
        )?;
        for &cid in cluster_ids {
            tx.execute(
                "UPDATE clusters SET isolated = 1
                 WHERE recording_id = ?1 AND cluster_id = ?2",
                params![recording_id, cid + 1],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // -- isolation frames ---------------------------------------------------

    pub fn has_isolation_frames(&self, recording_id: i64, cluster_id: i64) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM isolation_frames
             WHERE recording_id = ?1 AND cluster_id = ?2",
            params![recording_id, cluster_id + 1],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn store_isolation_frames(
        &self,
        recording_id: i64,
        cluster_id: i64,
        frames: &[IsolationFrame],
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM isolation_frames WHERE recording_id = ?1 AND cluster_id = ?2",
            params![recording_id, cluster_id + 1],
        )?;
        for (i, f) in frames.iter().enumerate() {
            // Neighbor ids go to disk 1-indexed like every other cluster id
            let neighbors: Vec<NeighborWindow> = f
                .neighbors
                .iter()
                .map(|n| NeighborWindow {
                    cluster_id: n.cluster_id + 1,
                    good: n.good,
                    pc: n.pc.clone(),
                })
                .collect();
            tx.execute(
                "INSERT INTO isolation_frames
                    (recording_id, cluster_id, frame_index, t_start, n_spikes,
                     score, signal_mean, noise_mean, noise_std, verdict,
                     clu_wf, noise_wf, neighbors)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    recording_id,
                    cluster_id + 1,
                    i as i64,
                    f.t_start,
                    f.n_spikes as i64,
                    f.score,
                    json_nullable(&f.signal_mean),
                    json_nullable(&f.noise_mean),
                    json_nullable(&f.noise_std),
                    f.verdict.as_i64(),
                    pack_f64(&f.clu_wf),
                    pack_f64(&f.noise_wf),
                    serde_json::to_string(&neighbors).unwrap_or_else(|_| "[]".to_string()),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_isolation_frames(
        &self,
        recording_id: i64,
        cluster_id: i64,
    ) -> Result<Vec<IsolationFrame>> {
        let mut stmt = self.conn.prepare(
            "SELECT t_start, n_spikes, score, signal_mean, noise_mean, noise_std,
                    verdict, clu_wf, noise_wf, neighbors
             FROM isolation_frames
             WHERE recording_id = ?1 AND cluster_id = ?2
             ORDER BY frame_index",
        )?;
        let rows = stmt.query_map(params![recording_id, cluster_id + 1], |row| {
            Ok((
                row.get::<_, f64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Vec<u8>>(7)?,
                row.get::<_, Vec<u8>>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (t_start, n_spikes, score, sm, nm, ns, verdict, clu_wf, noise_wf, nb) = row?;
            let neighbors: Vec<NeighborWindow> =
                serde_json::from_str(&nb).map_err(|e| DbError::Corrupt {
                    table: "isolation_frames".to_string(),
                    message: e.to_string(),
                })?;
            out.push(IsolationFrame {
                t_start,
                n_spikes: n_spikes as usize,
                score,
                signal_mean: parse_nullable(&sm, "isolation_frames")?,
                noise_mean: parse_nullable(&nm, "isolation_frames")?,
                noise_std: parse_nullable(&ns, "isolation_frames")?,
                verdict: Verdict::from_i64(verdict),
                clu_wf: unpack_f64(&clu_wf, "isolation_frames")?,
                noise_wf: unpack_f64(&noise_wf, "isolation_frames")?,
                neighbors: neighbors
                    .into_iter()
                    .map(|n| NeighborWindow {
                        cluster_id: n.cluster_id - 1,
                        good: n.good,
                        pc: n.pc,
                    })
                    .collect(),
            });
        }
        Ok(out)
    }

    /// Frame-0 verdict per cluster, used by the isolated-unit selector.
    pub fn frame0_verdicts(&self, recording_id: i64) -> Result<Vec<(i64, Verdict)>> {
        let mut stmt = self.conn.prepare(
            "SELECT cluster_id, verdict FROM isolation_frames
             WHERE recording_id = ?1 AND frame_index = 0 ORDER BY cluster_id",
        )?;
        let rows = stmt
            .query_map(params![recording_id], |row| {
                Ok((row.get::<_, i64>(0)? - 1, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(cid, v)| (cid, Verdict::from_i64(v)))
            .collect())
    }

    /// Entry point for the external curation step: overwrite one frame's
    /// verdict.
    pub fn set_verdict(
        &self,
        recording_id: i64,
        cluster_id: i64,
        frame_index: i64,
        verdict: Verdict,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE isolation_frames SET verdict = ?4
             WHERE recording_id = ?1 AND cluster_id = ?2 AND frame_index = ?3",
            params![recording_id, cluster_id + 1, frame_index, verdict.as_i64()],
        )?;
        Ok(())
    }

    // -- rasters ------------------------------------------------------------

    pub fn has_raster(&self, recording_id: i64, cluster_id: i64) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM rasters WHERE recording_id = ?1 AND cluster_id = ?2",
            params![recording_id, cluster_id + 1],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn store_raster(
        &self,
        recording_id: i64,
        cluster_id: i64,
        own: &RasterData,
        neighbors: &[(i64, RasterData)],
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO rasters (recording_id, cluster_id, trial_spikes, rt)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                recording_id,
                cluster_id + 1,
                json_trials(&own.trial_spikes),
                json_nullable(&own.rt),
            ],
        )?;
        tx.execute(
            "DELETE FROM neighbor_rasters WHERE recording_id = ?1 AND cluster_id = ?2",
            params![recording_id, cluster_id + 1],
        )?;
        for (nid, data) in neighbors {
            tx.execute(
                "INSERT INTO neighbor_rasters
                    (recording_id, cluster_id, neighbor_id, trial_spikes, rt)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    recording_id,
                    cluster_id + 1,
                    nid + 1,
                    json_trials(&data.trial_spikes),
                    json_nullable(&data.rt),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_raster(&self, recording_id: i64, cluster_id: i64) -> Result<Option<RasterData>> {
        let row = self
            .conn
            .query_row(
                "SELECT trial_spikes, rt FROM rasters
                 WHERE recording_id = ?1 AND cluster_id = ?2",
                params![recording_id, cluster_id + 1],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        match row {
            Some((spikes, rt)) => Ok(Some(RasterData {
                trial_spikes: parse_trials(&spikes, "rasters")?,
                rt: parse_nullable(&rt, "rasters")?,
            })),
            None => Ok(None),
        }
    }

    // -- stitch tables ------------------------------------------------------

    pub fn store_stitch_table(&self, table: &StitchTable) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO stitch_tables (day, tower, probe, recordings, scope)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                table.day,
                table.tower,
                table.probe,
                serde_json::to_string(&table.recordings).unwrap_or_default(),
                table.scope.as_str(),
            ],
        )?;
        let stitch_id = tx.last_insert_rowid();
        for (i, row) in table.rows.iter().enumerate() {
            // Entries are 1-indexed on disk; ⊥ stays null
            let persisted: Vec<Option<i64>> = row.iter().map(|e| e.map(|c| c + 1)).collect();
            tx.execute(
                "INSERT INTO stitch_rows (stitch_id, row_index, entries) VALUES (?1, ?2, ?3)",
                params![
                    stitch_id,
                    i as i64,
                    serde_json::to_string(&persisted).unwrap_or_default(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(stitch_id)
    }

    pub fn load_stitch_rows(&self, stitch_id: i64) -> Result<Vec<Vec<Option<i64>>>> {
        let mut stmt = self.conn.prepare(
            "SELECT entries FROM stitch_rows WHERE stitch_id = ?1 ORDER BY row_index",
        )?;
        let rows = stmt
            .query_map(params![stitch_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut out = Vec::new();
        for entries in rows {
            let persisted: Vec<Option<i64>> =
                serde_json::from_str(&entries).map_err(|e| DbError::Corrupt {
                    table: "stitch_rows".to_string(),
                    message: e.to_string(),
                })?;
            out.push(persisted.into_iter().map(|e| e.map(|c| c - 1)).collect());
        }
        Ok(out)
    }

    // -- settings -----------------------------------------------------------

    /// Persist the curation thresholds unchanged; the external curation step
    /// reads them from here.
    pub fn store_curation_settings(&self, cfg: &CurationConfig) -> Result<()> {
        let pairs = [
            ("curation.l_ratio_threshold", cfg.l_ratio_threshold),
            ("curation.isi_violation_rate", cfg.isi_violation_rate),
            ("curation.isolated_t_ratio", cfg.isolated_t_ratio),
        ];
        for (key, value) in pairs {
            self.conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value.to_string()],
            )?;
        }
        Ok(())
    }

    // -- stats --------------------------------------------------------------

    pub fn recording_stats(&self) -> Result<Vec<RecordingStats>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.day, r.rec,
                    COALESCE(s.n_spikes, 0),
                    (SELECT COUNT(*) FROM clusters c WHERE c.recording_id = r.id),
                    (SELECT COUNT(DISTINCT cluster_id) FROM isolation_frames f
                     WHERE f.recording_id = r.id),
                    (SELECT COUNT(*) FROM rasters ra WHERE ra.recording_id = r.id)
             FROM recordings r
             LEFT JOIN spike_streams s ON s.recording_id = r.id
             ORDER BY r.day, r.rec",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RecordingStats {
                    day: row.get(0)?,
                    rec: row.get(1)?,
                    n_spikes: row.get(2)?,
                    n_clusters: row.get(3)?,
                    n_isolation_clusters: row.get(4)?,
                    n_rasters: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_recording(row: &rusqlite::Row) -> rusqlite::Result<RecordingRow> {
    Ok(RecordingRow {
        id: row.get(0)?,
        day: row.get(1)?,
        rec: row.get(2)?,
        tower: row.get(3)?,
        probe: row.get(4)?,
        grouped: row.get(5)?,
        duration_samples: row.get(6)?,
        sample_rate: row.get(7)?,
        aux_only: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::{IsolationFrame, Verdict};
    use crate::rasters::RasterData;
    use crate::stitch::{StitchScope, StitchTable};
    use ndarray::Array3;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn add_recording(db: &Database) -> i64 {
        db.upsert_recording("240115", "001", "towerA", 1, false, 30_000, 30_000.0, false)
            .unwrap()
    }

    #[test]
    fn test_upsert_recording_is_stable() {
        let db = test_db();
        let id1 = add_recording(&db);
        let id2 = add_recording(&db);
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_spike_stream_round_trip() {
        let db = test_db();
        let rid = add_recording(&db);
        let part = ReprojectedRecording {
            rec: "001".to_string(),
            spike_times: vec![0.01, 0.02, 0.03],
            spike_clusters: vec![0, 2, 0],
            pc_feat: Array3::from_elem((3, 3, 2), 1.5),
            temp_scaling_amps: vec![1.0, 2.0, 3.0],
            aux_only: false,
        };
        let templates = Array3::from_elem((3, 61, 4), 0.25);
        db.store_spike_stream(rid, &part, &templates).unwrap();

        let stream = db.load_spike_stream(rid).unwrap().unwrap();
        assert_eq!(stream.spike_times, vec![0.01, 0.02, 0.03]);
        // 1-indexed on disk, back to 0-indexed in memory
        assert_eq!(stream.cluster_ids, vec![0, 2, 0]);
        assert_eq!(stream.pc_feat.shape(), &[3, 3, 2]);
        assert_eq!(stream.spikes_of(0), vec![0, 2]);

        let tmpl = db.load_templates(rid).unwrap().unwrap();
        assert_eq!(tmpl.shape(), &[3, 61, 4]);
    }

    #[test]
    fn test_persisted_cluster_ids_are_one_indexed() {
        let db = test_db();
        let rid = add_recording(&db);
        let part = ReprojectedRecording {
            rec: "001".to_string(),
            spike_times: vec![0.5],
            spike_clusters: vec![4],
            pc_feat: Array3::zeros((1, 3, 2)),
            temp_scaling_amps: vec![1.0],
            aux_only: false,
        };
        db.store_spike_stream(rid, &part, &Array3::zeros((1, 1, 1)))
            .unwrap();

        let raw: Vec<u8> = db
            .conn
            .query_row(
                "SELECT cluster_ids FROM spike_streams WHERE recording_id = ?1",
                params![rid],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(i64::from_le_bytes(raw[..8].try_into().unwrap()), 5);
    }

    #[test]
    fn test_cluster_round_trip() {
        let db = test_db();
        let rid = add_recording(&db);
        let rows = vec![
            ClusterRow {
                cluster_id: 0,
                best_channel: 7,
                worst_channel: 2,
                quality: QualityLabel::Good,
                local_channels: vec![2, 5, 7],
                isolated: false,
            },
            ClusterRow {
                cluster_id: 3,
                best_channel: 1,
                worst_channel: 0,
                quality: QualityLabel::Mua,
                local_channels: vec![0, 1],
                isolated: false,
            },
        ];
        db.replace_clusters(rid, &rows).unwrap();

        let loaded = db.load_clusters(rid).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].cluster_id, 0);
        assert_eq!(loaded[0].quality, QualityLabel::Good);
        assert_eq!(loaded[0].local_channels, vec![2, 5, 7]);
        assert_eq!(loaded[1].cluster_id, 3);

        db.mark_isolated(rid, &[3]).unwrap();
        let loaded = db.load_clusters(rid).unwrap();
        assert!(!loaded[0].isolated);
        assert!(loaded[1].isolated);
    }

    #[test]
    fn test_isolation_frame_round_trip() {
        let db = test_db();
        let rid = add_recording(&db);
        let frames = vec![IsolationFrame {
            t_start: 0.0,
            n_spikes: 10,
            score: Some(18.02),
            signal_mean: vec![10.0, 0.0, 0.0],
            noise_mean: vec![0.5, 0.0, 0.0],
            noise_std: vec![0.527, f64::NAN, 0.0],
            verdict: Verdict::NotIsolated,
            clu_wf: vec![0.0, 1.0, -1.0],
            noise_wf: vec![0.0, 0.1, -0.1],
            neighbors: vec![NeighborWindow {
                cluster_id: 2,
                good: true,
                pc: vec![[1.0, 2.0, 3.0]],
            }],
        }];
        db.store_isolation_frames(rid, 0, &frames).unwrap();

        let loaded = db.load_isolation_frames(rid, 0).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].score, Some(18.02));
        assert!(loaded[0].noise_std[1].is_nan());
        assert_eq!(loaded[0].neighbors[0].cluster_id, 2);
        assert!(loaded[0].neighbors[0].good);

        assert!(db.has_isolation_frames(rid, 0).unwrap());
        assert!(!db.has_isolation_frames(rid, 1).unwrap());

        db.set_verdict(rid, 0, 0, Verdict::Isolated).unwrap();
        let verdicts = db.frame0_verdicts(rid).unwrap();
        assert_eq!(verdicts, vec![(0, Verdict::Isolated)]);
    }

    #[test]
    fn test_raster_round_trip_with_nan_rt() {
        let db = test_db();
        let rid = add_recording(&db);
        let own = RasterData {
            trial_spikes: vec![vec![-300.0, -100.0, 100.0, 400.0], vec![]],
            rt: vec![234.0, f64::NAN],
        };
        let nb = RasterData {
            trial_spikes: vec![vec![12.0], vec![34.0]],
            rt: vec![f64::NAN, f64::NAN],
        };
        db.store_raster(rid, 1, &own, &[(4, nb)]).unwrap();

        let loaded = db.load_raster(rid, 1).unwrap().unwrap();
        assert_eq!(loaded.trial_spikes[0], vec![-300.0, -100.0, 100.0, 400.0]);
        assert!(loaded.trial_spikes[1].is_empty());
        assert_eq!(loaded.rt[0], 234.0);
        assert!(loaded.rt[1].is_nan());
        assert!(db.has_raster(rid, 1).unwrap());
    }

    #[test]
    fn test_iso_stream_append() {
        let db = test_db();
        let rid = add_recording(&db);
        let part = ReprojectedRecording {
            rec: "001".to_string(),
            spike_times: vec![0.1, 0.2],
            spike_clusters: vec![0, 1],
            pc_feat: Array3::zeros((2, 3, 1)),
            temp_scaling_amps: vec![1.0, 1.0],
            aux_only: false,
        };
        db.store_spike_stream(rid, &part, &Array3::zeros((2, 1, 1)))
            .unwrap();
        assert!(db.load_isolated_stream(rid).unwrap().is_none());

        db.store_isolated_stream(rid, &[0.2], &[1]).unwrap();
        let (times, ids) = db.load_isolated_stream(rid).unwrap().unwrap();
        assert_eq!(times, vec![0.2]);
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_stitch_table_round_trip() {
        let db = test_db();
        let table = StitchTable {
            day: "240115".to_string(),
            tower: "towerA".to_string(),
            probe: 1,
            recordings: vec!["001".to_string(), "002".to_string()],
            scope: StitchScope::Good,
            rows: vec![vec![Some(3), Some(7)], vec![Some(0), None]],
        };
        let id = db.store_stitch_table(&table).unwrap();
        let rows = db.load_stitch_rows(id).unwrap();
        assert_eq!(rows, vec![vec![Some(3), Some(7)], vec![Some(0), None]]);
    }
}
