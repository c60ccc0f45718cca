//! Behavioral trial store and the task-type table.
//!
//! A trial is a task-type tag plus a mapping from event name to event time in
//! behavioral-clock ms; a missing event is represented explicitly (absent key
//! or null), never by exception. The closed task-type set is a sum type so
//! each tag carries its own alignment and reaction-time constants.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrialError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },
}

/// Closed set of behavioral task types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "CO")]
    Co,
    Lum,
    GazeAnchor,
    Saccade,
    TouchFeedback,
    Touch,
    Reach,
    Null,
}

/// Alignment constants for one task type.
pub struct Alignment {
    pub primary: &'static str,
    pub fallback: Option<&'static str>,
    /// [start, stop] around the event, ms.
    pub window: [f64; 2],
}

/// How the per-trial reaction time is computed: numerator minus denominator.
pub enum RtSpec {
    /// No reaction time for this task.
    None,
    /// Denominator is whichever alignment event was actually used.
    FromAlignment { numerator: &'static str },
    /// Denominator resolved per trial: `disGo` when present, else `Go`.
    DisGoOrGo { numerator: &'static str },
    /// Fixed denominator event.
    Fixed {
        numerator: &'static str,
        denominator: &'static str,
    },
}

impl TaskKind {
    /// Fixed order in which task blocks are concatenated into the
    /// cross-task raster record.
    pub const RASTER_ORDER: [TaskKind; 8] = [
        TaskKind::Co,
        TaskKind::Lum,
        TaskKind::Reach,
        TaskKind::Null,
        TaskKind::GazeAnchor,
        TaskKind::Saccade,
        TaskKind::TouchFeedback,
        TaskKind::Touch,
    ];

    pub fn alignment(&self) -> Alignment {
        match self {
            TaskKind::Co => Alignment {
                primary: "TargsOn",
                fallback: Some("disTargsOn"),
                window: [-300.0, 500.0],
            },
            TaskKind::Lum => Alignment {
                primary: "disGo",
                fallback: Some("Go"),
                window: [-300.0, 500.0],
            },
            TaskKind::GazeAnchor
            | TaskKind::Saccade
            | TaskKind::TouchFeedback
            | TaskKind::Touch => Alignment {
                primary: "disTargsOn",
                fallback: Some("TargsOn"),
                window: [-300.0, 500.0],
            },
            TaskKind::Reach => Alignment {
                primary: "ReachStart",
                fallback: None,
                window: [-400.0, 400.0],
            },
            TaskKind::Null => Alignment {
                primary: "Pulse_start",
                fallback: None,
                window: [-300.0, 500.0],
            },
        }
    }

    /// Alignment used when building a neighbor cluster's raster. Only the CO
    /// tag differs: the primary/fallback pair is swapped.
    pub fn neighbor_alignment(&self) -> Alignment {
        match self {
            TaskKind::Co => Alignment {
                primary: "disTargsOn",
                fallback: Some("TargsOn"),
                window: [-300.0, 500.0],
            },
            _ => self.alignment(),
        }
    }

    pub fn rt_spec(&self) -> RtSpec {
        match self {
            TaskKind::Co | TaskKind::Lum => RtSpec::FromAlignment {
                numerator: "SaccStart",
            },
            TaskKind::GazeAnchor
            | TaskKind::Saccade
            | TaskKind::TouchFeedback
            | TaskKind::Touch => RtSpec::DisGoOrGo {
                numerator: "SaccStart",
            },
            TaskKind::Reach => RtSpec::Fixed {
                numerator: "ReachStart",
                denominator: "TargsOn",
            },
            TaskKind::Null => RtSpec::None,
        }
    }
}

/// One behavioral trial. Event times are behavioral-clock ms.
#[derive(Debug, Clone, Deserialize)]
pub struct Trial {
    pub rec: String,
    pub trial: i64,
    pub task: TaskKind,
    #[serde(default)]
    events: BTreeMap<String, Option<f64>>,
}

impl Trial {
    /// Event time by name; absent, null and NaN all mean missing.
    pub fn event(&self, name: &str) -> Option<f64> {
        self.events
            .get(name)
            .copied()
            .flatten()
            .filter(|t| !t.is_nan())
    }

    #[cfg(test)]
    pub fn for_test(rec: &str, trial: i64, task: TaskKind, events: &[(&str, f64)]) -> Self {
        Self {
            rec: rec.to_string(),
            trial,
            task,
            events: events
                .iter()
                .map(|&(k, v)| (k.to_string(), Some(v)))
                .collect(),
        }
    }
}

/// Load the trial store for a session day, filtered to one recording.
/// A missing file is not an error: it yields an empty trial list (and the
/// raster builder then emits empty records for every cluster).
pub fn load_trials(path: &Path, rec: &str) -> Result<Vec<Trial>, TrialError> {
    if !path.exists() {
        log::warn!("No trial store found: {}", path.display());
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| TrialError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let trials: Vec<Trial> =
        serde_json::from_str(&contents).map_err(|e| TrialError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    Ok(trials.into_iter().filter(|t| t.rec == rec).collect())
}

pub fn tag_name(task: TaskKind) -> &'static str {
    match task {
        TaskKind::Co => "CO",
        TaskKind::Lum => "Lum",
        TaskKind::GazeAnchor => "GazeAnchor",
        TaskKind::Saccade => "Saccade",
        TaskKind::TouchFeedback => "TouchFeedback",
        TaskKind::Touch => "Touch",
        TaskKind::Reach => "Reach",
        TaskKind::Null => "Null",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_filter() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trials.json");
        std::fs::write(
            &path,
            r#"[
                {"rec": "001", "trial": 0, "task": "CO",
                 "events": {"TargsOn": 1000.0, "SaccStart": 1250.0}},
                {"rec": "001", "trial": 1, "task": "Reach",
                 "events": {"ReachStart": 2000.0, "TargsOn": null}},
                {"rec": "002", "trial": 0, "task": "Null", "events": {}}
            ]"#,
        )
        .unwrap();

        let trials = load_trials(&path, "001").unwrap();
        assert_eq!(trials.len(), 2);
        assert_eq!(trials[0].task, TaskKind::Co);
        assert_eq!(trials[0].event("TargsOn"), Some(1000.0));
        assert_eq!(trials[0].event("disTargsOn"), None);
        // null is missing, not zero
        assert_eq!(trials[1].event("TargsOn"), None);
    }

    #[test]
    fn test_missing_store_is_empty() {
        let trials = load_trials(Path::new("/nonexistent/trials.json"), "001").unwrap();
        assert!(trials.is_empty());
    }

    #[test]
    fn test_co_neighbor_swap() {
        let own = TaskKind::Co.alignment();
        let nb = TaskKind::Co.neighbor_alignment();
        assert_eq!(own.primary, "TargsOn");
        assert_eq!(own.fallback, Some("disTargsOn"));
        assert_eq!(nb.primary, "disTargsOn");
        assert_eq!(nb.fallback, Some("TargsOn"));
        // Other tags are unchanged for neighbors
        let r = TaskKind::Reach.neighbor_alignment();
        assert_eq!(r.primary, "ReachStart");
    }

    #[test]
    fn test_reach_window() {
        let a = TaskKind::Reach.alignment();
        assert_eq!(a.window, [-400.0, 400.0]);
        assert!(a.fallback.is_none());
    }

    #[test]
    fn test_raster_order() {
        let names: Vec<&str> = TaskKind::RASTER_ORDER.iter().map(|&t| tag_name(t)).collect();
        assert_eq!(
            names,
            vec!["CO", "Lum", "Reach", "Null", "GazeAnchor", "Saccade", "TouchFeedback", "Touch"]
        );
    }
}
