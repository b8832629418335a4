// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Owns the on-disk checkpoint directory of a run and the top-k
// retention policy over it.
//
// Layout:
//   <output_dir>/config.yaml, vocabularies.json   (shared by all)
//   <output_dir>/checkpoints/
//     epoch=2-step=400/         ← one dir per retained checkpoint
//       model.mpk, encoder.mpk, optimizer.mpk   (QeRecorder, f32)
//       checkpoint.json          ← step, epoch, metrics, primary
//     last/                      ← newest state, rewritten at every
//       ...                        validation boundary, for resume
//       training_state.json
//     best.json                  ← entry of the current best checkpoint
//
// Retention: a validation result enters the set when the set is
// not full or it is strictly better than the worst retained entry.
// When the set overflows the worst entry is deleted; among equally
// bad entries the older one goes. Retained entries are therefore
// never worse than a discarded one.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::{QeError, QeResult};
use crate::domain::metrics::{self, MetricValues};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const STATE_FILE:      &str = "training_state.json";
pub const BEST_FILE:       &str = "best.json";
pub const LAST_DIR:        &str = "last";

// ─── CheckpointEntry ──────────────────────────────────────────────────────────
/// Metadata of one persisted checkpoint (`checkpoint.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub name:    String,
    pub step:    usize,
    pub epoch:   usize,
    /// Name of the primary metric that ranked this checkpoint.
    pub metric:  String,
    pub value:   f64,
    pub metrics: MetricValues,
}

impl CheckpointEntry {
    pub fn new(step: usize, epoch: usize, metric: &str, value: f64, metrics: MetricValues) -> Self {
        Self {
            name: format!("epoch={epoch}-step={step}"),
            step,
            epoch,
            metric: metric.to_string(),
            value,
            metrics,
        }
    }

    /// True when `self` ranks strictly worse than `other`.
    fn worse_than(&self, other: &Self) -> bool {
        metrics::is_improvement(&self.metric, other.value, self.value)
    }
}

// ─── TopK ─────────────────────────────────────────────────────────────────────
/// Pure retention policy; no file system access.
#[derive(Debug, Clone, PartialEq)]
pub struct TopK {
    /// None keeps every checkpoint.
    capacity: Option<usize>,
    entries:  Vec<CheckpointEntry>,
}

impl TopK {
    /// `save_top_k` of -1 keeps all checkpoints.
    pub fn new(save_top_k: i64) -> Self {
        let capacity = usize::try_from(save_top_k).ok();
        Self { capacity, entries: Vec::new() }
    }

    pub fn with_entries(save_top_k: i64, entries: Vec<CheckpointEntry>) -> Self {
        Self { entries, ..Self::new(save_top_k) }
    }

    /// Non-finite values are never retained.
    pub fn admits(&self, metric: &str, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self.capacity {
            None => true,
            Some(k) if self.entries.len() < k => true,
            Some(_) => self
                .worst_index()
                .map(|i| metrics::is_improvement(metric, value, self.entries[i].value))
                .unwrap_or(true),
        }
    }

    /// Add `entry` and return the entries that fell out of the set.
    pub fn insert(&mut self, entry: CheckpointEntry) -> Vec<CheckpointEntry> {
        self.entries.push(entry);
        let mut pruned = Vec::new();
        if let Some(k) = self.capacity {
            while self.entries.len() > k {
                match self.worst_index() {
                    Some(i) => pruned.push(self.entries.remove(i)),
                    None => break,
                }
            }
        }
        pruned
    }

    /// Worst entry; ties resolve to the oldest.
    fn worst_index(&self) -> Option<usize> {
        let mut worst: Option<usize> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            worst = match worst {
                None => Some(i),
                Some(w) => {
                    let current = &self.entries[w];
                    let tie = !entry.worse_than(current) && !current.worse_than(entry);
                    if entry.worse_than(current) || (tie && entry.step < current.step) {
                        Some(i)
                    } else {
                        Some(w)
                    }
                }
            };
        }
        worst
    }

    /// Best entry; ties resolve to the oldest.
    pub fn best(&self) -> Option<&CheckpointEntry> {
        self.entries.iter().fold(None, |best: Option<&CheckpointEntry>, entry| match best {
            None => Some(entry),
            Some(b) if b.worse_than(entry) => Some(entry),
            Some(b) => Some(b),
        })
    }

    pub fn entries(&self) -> &[CheckpointEntry] {
        &self.entries
    }
}

// ─── TrainingState ────────────────────────────────────────────────────────────
/// Loop counters persisted next to the `last` checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Epoch in progress (1-based).
    pub epoch:              usize,
    pub batches_into_epoch: usize,
    pub global_step:        usize,
    pub early_stop_count:   usize,
    pub best_value:         Option<f64>,
    pub retained:           Vec<CheckpointEntry>,
    /// Canonical model/metric configuration the state was produced with.
    pub fingerprint:        String,
    pub saved_at:           DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointDecision {
    Saved { path: PathBuf, pruned: Vec<String> },
    Rejected,
}

// ─── CheckpointManager ────────────────────────────────────────────────────────
pub struct CheckpointManager {
    dir:  PathBuf,
    topk: TopK,
}

impl CheckpointManager {
    /// Create the manager and its directory under `output_dir`.
    pub fn new(output_dir: &Path, save_top_k: i64) -> QeResult<Self> {
        let dir = output_dir.join("checkpoints");
        fs::create_dir_all(&dir).map_err(|e| QeError::checkpoint_io(&dir, e))?;
        Ok(Self { dir, topk: TopK::new(save_top_k) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn last_dir(&self) -> PathBuf {
        self.dir.join(LAST_DIR)
    }

    pub fn retained(&self) -> &[CheckpointEntry] {
        self.topk.entries()
    }

    pub fn best(&self) -> Option<&CheckpointEntry> {
        self.topk.best()
    }

    pub fn path_of(&self, entry: &CheckpointEntry) -> PathBuf {
        self.dir.join(&entry.name)
    }

    /// Restore the retained set after a resume.
    pub fn restore_retained(&mut self, save_top_k: i64, entries: Vec<CheckpointEntry>) {
        let entries = entries
            .into_iter()
            .filter(|e| self.dir.join(&e.name).is_dir())
            .collect();
        self.topk = TopK::with_entries(save_top_k, entries);
    }

    /// Persist `candidate` through `persist` when it enters the top-k set,
    /// then delete whatever fell out.
    pub fn consider<F>(&mut self, candidate: CheckpointEntry, persist: F) -> QeResult<CheckpointDecision>
    where
        F: FnOnce(&Path) -> QeResult<()>,
    {
        if !self.topk.admits(&candidate.metric, candidate.value) {
            return Ok(CheckpointDecision::Rejected);
        }

        let path = self.path_of(&candidate);
        fs::create_dir_all(&path).map_err(|e| QeError::checkpoint_io(&path, e))?;
        persist(&path)?;
        write_json(&path.join(CHECKPOINT_FILE), &candidate)?;

        let pruned = self.topk.insert(candidate);
        for entry in &pruned {
            let old = self.path_of(entry);
            if old.exists() {
                fs::remove_dir_all(&old).map_err(|e| QeError::checkpoint_io(&old, e))?;
            }
            tracing::debug!("Pruned checkpoint '{}'", entry.name);
        }

        if let Some(best) = self.topk.best() {
            write_json(&self.dir.join(BEST_FILE), best)?;
        }

        Ok(CheckpointDecision::Saved {
            path,
            pruned: pruned.into_iter().map(|e| e.name).collect(),
        })
    }

    /// Rewrite `last/` with the current system state and loop counters.
    /// The new state is staged next to the old one and swapped in.
    pub fn save_last<F>(&self, state: &TrainingState, persist: F) -> QeResult<()>
    where
        F: FnOnce(&Path) -> QeResult<()>,
    {
        let staging = self.dir.join(format!("{LAST_DIR}.tmp"));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| QeError::checkpoint_io(&staging, e))?;
        }
        fs::create_dir_all(&staging).map_err(|e| QeError::checkpoint_io(&staging, e))?;
        persist(&staging)?;
        write_json(&staging.join(STATE_FILE), state)?;

        let last = self.last_dir();
        if last.exists() {
            fs::remove_dir_all(&last).map_err(|e| QeError::checkpoint_io(&last, e))?;
        }
        fs::rename(&staging, &last).map_err(|e| QeError::checkpoint_io(&last, e))?;
        tracing::debug!("Saved resumable state at step {}", state.global_step);
        Ok(())
    }

    /// The saved loop state, or None when no `last/` exists yet.
    pub fn load_last_state(&self) -> QeResult<Option<TrainingState>> {
        let path = self.last_dir().join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).map_err(|e| QeError::resume_state(&path, e.to_string()))?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| QeError::resume_state(&path, format!("corrupt state file: {e}")))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> QeResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).map_err(|e| QeError::checkpoint_io(path, e))
}

/// Read a checkpoint's `checkpoint.json`.
pub fn read_entry(dir: &Path) -> QeResult<CheckpointEntry> {
    let path = dir.join(CHECKPOINT_FILE);
    let text = fs::read_to_string(&path).map_err(|e| QeError::checkpoint_io(&path, e))?;
    Ok(serde_json::from_str(&text)?)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn entry(step: usize, value: f64) -> CheckpointEntry {
        CheckpointEntry::new(step, 1, "PEARSON", value, MetricValues::new())
    }

    #[test]
    fn test_top1_keeps_first_of_equal_values() {
        let mut topk = TopK::new(1);
        assert!(topk.admits("PEARSON", 0.5));
        topk.insert(entry(100, 0.5));
        assert!(!topk.admits("PEARSON", 0.5));
        assert!(!topk.admits("PEARSON", 0.49));
        assert_eq!(topk.best().unwrap().step, 100);
    }

    #[test]
    fn test_retained_never_worse_than_discarded() {
        let values = [0.3, 0.7, 0.1, 0.5, 0.9, 0.2, 0.6];
        let mut topk = TopK::new(3);
        let mut discarded = Vec::new();
        for (i, v) in values.iter().enumerate() {
            if topk.admits("PEARSON", *v) {
                discarded.extend(topk.insert(entry((i + 1) * 100, *v)));
            } else {
                discarded.push(entry((i + 1) * 100, *v));
            }
            assert!(topk.entries().len() <= 3);
        }
        let worst_kept = topk.entries().iter().map(|e| e.value).fold(f64::MAX, f64::min);
        assert!(discarded.iter().all(|d| d.value <= worst_kept));
        assert_eq!(worst_kept, 0.6);
    }

    #[test]
    fn test_ties_prune_the_older() {
        let mut topk = TopK::new(2);
        topk.insert(entry(100, 0.4));
        topk.insert(entry(200, 0.4));
        let pruned = topk.insert(entry(300, 0.8));
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].step, 100);
    }

    #[test]
    fn test_minimised_metric() {
        let mut topk = TopK::new(1);
        topk.insert(CheckpointEntry::new(1, 1, "RMSE", 0.3, MetricValues::new()));
        assert!(topk.admits("RMSE", 0.2));
        assert!(!topk.admits("RMSE", 0.4));
    }

    #[test]
    fn test_keep_all() {
        let mut topk = TopK::new(-1);
        for i in 0..10 {
            assert!(topk.insert(entry(i, 0.1)).is_empty());
        }
        assert_eq!(topk.entries().len(), 10);
    }

    #[test]
    fn test_non_finite_values_are_not_retained() {
        assert!(!TopK::new(-1).admits("PEARSON", f64::NAN));
        assert!(!TopK::new(3).admits("RMSE", f64::INFINITY));
    }

    #[test]
    fn test_manager_prunes_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = CheckpointManager::new(tmp.path(), 1).unwrap();

        let first = mgr.consider(entry(100, 0.2), |_| Ok(())).unwrap();
        let CheckpointDecision::Saved { path: first_path, .. } = first else {
            panic!("first checkpoint must be saved")
        };
        assert!(first_path.join(CHECKPOINT_FILE).exists());

        let second = mgr.consider(entry(200, 0.6), |_| Ok(())).unwrap();
        assert!(matches!(second, CheckpointDecision::Saved { ref pruned, .. } if pruned.len() == 1));
        assert!(!first_path.exists());
        assert_eq!(read_entry(&mgr.path_of(mgr.best().unwrap())).unwrap().step, 200);

        assert_eq!(mgr.consider(entry(300, 0.1), |_| Ok(())).unwrap(), CheckpointDecision::Rejected);
    }

    #[test]
    fn test_last_state_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::new(tmp.path(), 1).unwrap();
        assert!(mgr.load_last_state().unwrap().is_none());

        let state = TrainingState {
            epoch:              2,
            batches_into_epoch: 7,
            global_step:        57,
            early_stop_count:   1,
            best_value:         Some(0.4),
            retained:           vec![entry(50, 0.4)],
            fingerprint:        "abc".into(),
            saved_at:           Utc::now(),
        };
        mgr.save_last(&state, |dir| {
            fs::write(dir.join("model.mpk"), b"weights").map_err(QeError::from)
        })
        .unwrap();
        mgr.save_last(&state, |_| Ok(())).unwrap();

        assert_eq!(mgr.load_last_state().unwrap(), Some(state));
        assert!(!mgr.last_dir().join("model.mpk").exists());
    }
}
