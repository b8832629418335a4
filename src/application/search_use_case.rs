// ============================================================
// Layer 2 — SearchUseCase
// ============================================================
// Random hyperparameter search over full training runs:
//
//   Step 1: Read the search file, resolve its base config
//   Step 2: Open <directory>/<n>/ (n = entries already there)
//           and load the `load_trials` ledger, if any
//   Step 3: For each new trial:
//             sample parameters → rewrite the base config →
//             train into <n>/trial_<i>/ → score = best value of
//             the primary metric (-1 when the trial fails)
//           trials.json (loaded + new trials) is rewritten
//           after every trial
//   Step 4: Delete the checkpoints of all but the
//           `num_models_to_keep` best trials
//
// Trials are ranked with the primary metric's direction, so
// minimised metrics (RMSE, loss) search downwards. Loaded
// trials take part in the ranking, but their checkpoints live
// in the earlier search's folder and are never deleted here.
//
// Reference: Bergstra & Bengio (2012) Random Search for
//            Hyper-Parameter Optimization

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::application::train_use_case::TrainUseCase;
use crate::domain::config::ExperimentConfig;
use crate::domain::error::QeError;
use crate::domain::metrics;
use crate::domain::search::{SearchConfig, TrialParams, TrialSampler};
use crate::domain::traits::RunStatus;
use crate::infra::config_resolver::ConfigResolver;

pub const TRIALS_FILE:        &str = "trials.json";
pub const SEARCH_CONFIG_FILE: &str = "search_config.yaml";

/// Score of a trial that produced no validation result.
const FAILED_SCORE: f64 = -1.0;

// ─── Trial records ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub number:          usize,
    pub params:          TrialParams,
    pub status:          RunStatus,
    pub metric:          String,
    pub score:           f64,
    pub output_dir:      PathBuf,
    pub best_checkpoint: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id:          Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error:           Option<String>,
}

impl TrialRecord {
    fn succeeded(&self) -> bool {
        self.best_checkpoint.is_some() && self.score.is_finite()
    }
}

/// Best first; trials without a checkpoint rank last.
fn rank(trials: &[TrialRecord]) -> Vec<&TrialRecord> {
    let mut ranked: Vec<&TrialRecord> = trials.iter().collect();
    ranked.sort_by(|a, b| match (a.succeeded(), b.succeeded()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.number.cmp(&b.number),
        (true, true) if metrics::is_improvement(&a.metric, a.score, b.score) => Ordering::Less,
        (true, true) if metrics::is_improvement(&a.metric, b.score, a.score) => Ordering::Greater,
        (true, true) => a.number.cmp(&b.number),
    });
    ranked
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub directory: PathBuf,
    pub trials:    Vec<TrialRecord>,
}

impl SearchOutcome {
    pub fn best(&self) -> Option<&TrialRecord> {
        rank(&self.trials).into_iter().next().filter(|t| t.succeeded())
    }
}

// ─── SearchUseCase ────────────────────────────────────────────────────────────

pub struct SearchUseCase {
    search: SearchConfig,
    base:   ExperimentConfig,
}

impl SearchUseCase {
    /// Read a search file; a relative `base_config` resolves against its directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading search configuration '{}'", path.display()))?;
        let mut search: SearchConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing search configuration '{}'", path.display()))?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        if search.base_config.is_relative() {
            search.base_config = dir.join(&search.base_config);
        }
        if let Some(ledger) = search.load_trials.as_mut().filter(|p| p.is_relative()) {
            *ledger = dir.join(&*ledger);
        }
        let base = ConfigResolver::resolve_file(&search.base_config)
            .with_context(|| format!("resolving base config '{}'", search.base_config.display()))?;
        Self::new(search, base)
    }

    pub fn new(search: SearchConfig, base: ExperimentConfig) -> Result<Self> {
        search.validate()?;
        if base.trainer.main_metric.is_empty() {
            return Err(QeError::config(
                "trainer.main_metric",
                "the base config of a search must name the metric trials are ranked by",
            )
            .into());
        }
        Ok(Self { search, base })
    }

    pub fn execute(&self) -> Result<SearchOutcome> {
        let mut trials = match &self.search.load_trials {
            Some(path) => load_trials(path)?,
            None => Vec::new(),
        };
        let directory = open_numbered_dir(&self.search.directory)?;
        fs::write(directory.join(SEARCH_CONFIG_FILE), serde_yaml::to_string(&self.search)?)?;
        tracing::info!("Search writing to '{}'", directory.display());

        let updates_per_epoch = self.updates_per_epoch()?;
        let options = &self.search.options;
        let mut sampler = TrialSampler::new(self.search.seed);
        sampler.skip(trials.len(), options, &self.base);
        let first = trials.iter().map(|t| t.number + 1).max().unwrap_or(0);
        let experiment = self
            .search
            .search_name
            .clone()
            .unwrap_or_else(|| self.base.run.experiment_name.clone());
        trials.reserve(self.search.num_trials);

        for number in first..first + self.search.num_trials {
            let params = sampler.suggest(options, &self.base);
            let mut cfg = self.base.clone();
            params.apply(&mut cfg, updates_per_epoch);
            cfg.trainer.resume = false;
            cfg.trainer.checkpoint.early_stop_patience = options.patience;
            cfg.trainer.checkpoint.validation_steps    = options.validation_steps;
            cfg.run.experiment_name = experiment.clone();
            cfg.run.run_id          = None;
            cfg.run.output_dir      = Some(directory.join(format!("trial_{number}")));

            tracing::info!("Trial {number}: {}", serde_json::to_string(&params)?);
            let record = self.run_trial(number, params, cfg);
            tracing::info!("Trial {number} finished with {}={:.4}", record.metric, record.score);
            trials.push(record);
            fs::write(directory.join(TRIALS_FILE), serde_json::to_string_pretty(&trials)?)?;
        }

        let outcome = SearchOutcome { directory, trials };
        self.prune_checkpoints(&outcome)?;
        match outcome.best() {
            Some(best) => tracing::info!(
                "Best trial {}: {}={:.4} ('{}')",
                best.number, best.metric, best.score, best.output_dir.display(),
            ),
            None => tracing::warn!("No trial produced a checkpoint"),
        }
        Ok(outcome)
    }

    fn run_trial(&self, number: usize, params: TrialParams, cfg: ExperimentConfig) -> TrialRecord {
        let metric = self
            .base
            .trainer
            .main_metric
            .first()
            .cloned()
            .unwrap_or_else(|| metrics::LOSS.to_string());
        let output_dir = cfg.run.output_dir.clone().unwrap_or_default();
        let mut record = TrialRecord {
            number,
            params,
            status: RunStatus::Failed,
            metric,
            score: FAILED_SCORE,
            output_dir,
            best_checkpoint: None,
            run_id: None,
            error: None,
        };
        match TrainUseCase::new(cfg).execute() {
            Ok(outcome) => {
                record.run_id = Some(outcome.run_id);
                record.status = outcome.report.status;
                if let Some(best) = outcome.report.best {
                    record.metric = best.metric;
                    record.score  = best.value;
                }
                record.best_checkpoint = outcome.report.best_path;
            }
            Err(e) => {
                tracing::warn!("Trial {number} failed: {e:#}");
                record.error = Some(format!("{e:#}"));
            }
        }
        record
    }

    /// Optimizer updates one epoch of the base config takes.
    fn updates_per_epoch(&self) -> Result<usize> {
        let base = &self.base;
        let source = base
            .data
            .train
            .as_ref()
            .and_then(|files| files.input.source.as_ref())
            .ok_or_else(|| QeError::config("data.train.input.source", "is required for a search"))?;
        let lines = fs::read_to_string(source)
            .with_context(|| format!("counting lines of '{}'", source.display()))?
            .lines()
            .count();
        let lines = match (&base.data.valid, base.data.split) {
            (None, Some(fraction)) => (lines as f64 * fraction).round() as usize,
            _ => lines,
        };
        let batches = lines.div_ceil(base.system.batch_size.train().max(1));
        Ok(batches.div_ceil(base.trainer.gradient_accumulation_steps.max(1)).max(1))
    }

    fn prune_checkpoints(&self, outcome: &SearchOutcome) -> Result<()> {
        let keep = match usize::try_from(self.search.num_models_to_keep) {
            Ok(keep) if keep > 0 && outcome.trials.len() > keep => keep,
            _ => return Ok(()),
        };
        let ranked = rank(&outcome.trials);
        tracing::info!("Keeping the checkpoints of the {keep} best trials");
        let own = |t: &&TrialRecord| t.output_dir.starts_with(&outcome.directory);
        for trial in ranked.into_iter().skip(keep).filter(own) {
            let dir = trial.output_dir.join("checkpoints");
            if dir.exists() {
                tracing::debug!("Removing '{}'", dir.display());
                fs::remove_dir_all(&dir).with_context(|| format!("removing '{}'", dir.display()))?;
            }
        }
        Ok(())
    }
}

fn load_trials(path: &Path) -> Result<Vec<TrialRecord>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading trial ledger '{}'", path.display()))?;
    let trials: Vec<TrialRecord> = serde_json::from_str(&text)
        .with_context(|| format!("parsing trial ledger '{}'", path.display()))?;
    tracing::info!("Continuing from {} trials in '{}'", trials.len(), path.display());
    Ok(trials)
}

/// `<root>/<n>` where n counts the entries already in `root`; a folder
/// already holding that name is moved aside first.
fn open_numbered_dir(root: &Path) -> Result<PathBuf> {
    fs::create_dir_all(root).with_context(|| format!("creating '{}'", root.display()))?;
    let count = fs::read_dir(root)?.count();
    let dir = root.join(count.to_string());
    if dir.exists() {
        let backup = root.join(format!("{count}_backup_{}", Utc::now().format("%Y%m%dT%H%M%S")));
        tracing::warn!("Folder '{}' already exists; moving it to '{}'", dir.display(), backup.display());
        fs::rename(&dir, &backup)?;
    }
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::fixtures::tiny_experiment;
    use crate::domain::search::{ParamRange, SearchOptions};

    fn record(number: usize, metric: &str, score: f64, ok: bool) -> TrialRecord {
        TrialRecord {
            number,
            params: TrialParams::default(),
            status: if ok { RunStatus::Completed } else { RunStatus::Failed },
            metric: metric.into(),
            score,
            output_dir: PathBuf::from(format!("trial_{number}")),
            best_checkpoint: ok.then(|| PathBuf::from("ckpt")),
            run_id: None,
            error: None,
        }
    }

    #[test]
    fn test_ranking_follows_metric_direction() {
        let trials = vec![
            record(0, "PEARSON", 0.2, true),
            record(1, "PEARSON", FAILED_SCORE, false),
            record(2, "PEARSON", 0.6, true),
        ];
        let order: Vec<usize> = rank(&trials).iter().map(|t| t.number).collect();
        assert_eq!(order, vec![2, 0, 1]);

        let trials = vec![record(0, "RMSE", 0.4, true), record(1, "RMSE", 0.1, true)];
        let order: Vec<usize> = rank(&trials).iter().map(|t| t.number).collect();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_numbered_directories_and_backups() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("search");
        assert_eq!(open_numbered_dir(&root).unwrap(), root.join("0"));
        assert_eq!(open_numbered_dir(&root).unwrap(), root.join("1"));

        // one entry left, so the next number collides with "1"
        fs::remove_dir_all(root.join("0")).unwrap();
        assert_eq!(open_numbered_dir(&root).unwrap(), root.join("1"));
        let backups = fs::read_dir(&root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("1_backup_"))
            .count();
        assert_eq!(backups, 1);
    }

    #[test]
    fn test_base_config_needs_main_metric() {
        let tmp = tempfile::tempdir().unwrap();
        let search = SearchConfig { base_config: "base.yaml".into(), ..SearchConfig::default() };
        assert!(SearchUseCase::new(search, tiny_experiment(tmp.path())).is_err());
    }

    #[test]
    fn test_search_runs_trials_and_prunes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut base = tiny_experiment(tmp.path());
        base.trainer.main_metric = vec!["PEARSON".into()];

        let options = SearchOptions {
            learning_rate: Some(ParamRange::Choices(vec![1e-2, 1e-3])),
            freeze_epochs: None,
            ..SearchOptions::default()
        };
        let search = SearchConfig {
            base_config: "base.yaml".into(),
            directory: tmp.path().join("search"),
            num_trials: 2,
            num_models_to_keep: 1,
            options,
            ..SearchConfig::default()
        };
        let outcome = SearchUseCase::new(search, base).unwrap().execute().unwrap();

        assert_eq!(outcome.directory, tmp.path().join("search").join("0"));
        assert_eq!(outcome.trials.len(), 2);
        assert!(outcome.directory.join(TRIALS_FILE).exists());
        assert!(outcome.directory.join(SEARCH_CONFIG_FILE).exists());

        let best = outcome.best().unwrap();
        assert_eq!(best.metric, "PEARSON");
        let kept: Vec<bool> = outcome.trials.iter().map(|t| t.output_dir.join("checkpoints").exists()).collect();
        assert_eq!(kept.iter().filter(|k| **k).count(), 1);
        assert!(best.output_dir.join("checkpoints").exists());
    }

    fn learning_rate_search(tmp: &Path, num_trials: usize) -> SearchConfig {
        let options = SearchOptions {
            learning_rate: Some(ParamRange::Choices(vec![1e-2, 1e-3, 5e-3])),
            freeze_epochs: None,
            ..SearchOptions::default()
        };
        SearchConfig {
            base_config: "base.yaml".into(),
            directory: tmp.join("search"),
            num_trials,
            num_models_to_keep: -1,
            options,
            ..SearchConfig::default()
        }
    }

    #[test]
    fn test_search_continues_from_trial_ledger() {
        let tmp = tempfile::tempdir().unwrap();
        let mut base = tiny_experiment(tmp.path());
        base.trainer.main_metric = vec!["PEARSON".into()];

        let first = SearchUseCase::new(learning_rate_search(tmp.path(), 1), base.clone())
            .unwrap()
            .execute()
            .unwrap();
        let ledger = first.directory.join(TRIALS_FILE);

        let search = SearchConfig { load_trials: Some(ledger), ..learning_rate_search(tmp.path(), 1) };
        let options = search.options.clone();
        let resumed = SearchUseCase::new(search, base.clone()).unwrap().execute().unwrap();

        assert_eq!(resumed.directory, tmp.path().join("search").join("1"));
        assert_eq!(resumed.trials.len(), 2);
        let (earlier, new) = (&resumed.trials[0], &resumed.trials[1]);
        assert_eq!(earlier.number, 0);
        assert_eq!(earlier.params, first.trials[0].params);
        assert_eq!(earlier.output_dir, first.trials[0].output_dir);
        assert_eq!(new.number, 1);
        assert_eq!(new.output_dir, resumed.directory.join("trial_1"));
        assert!(new.run_id.is_some());

        // the second trial draws what an uninterrupted search would have drawn
        let mut sampler = TrialSampler::new(42);
        sampler.skip(1, &options, &base);
        assert_eq!(new.params, sampler.suggest(&options, &base));

        let text = fs::read_to_string(resumed.directory.join(TRIALS_FILE)).unwrap();
        let stored: Vec<TrialRecord> = serde_json::from_str(&text).unwrap();
        assert_eq!(stored.iter().map(|t| t.number).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_missing_trial_ledger_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut base = tiny_experiment(tmp.path());
        base.trainer.main_metric = vec!["PEARSON".into()];
        let search = SearchConfig {
            load_trials: Some(tmp.path().join("nowhere/trials.json")),
            ..learning_rate_search(tmp.path(), 1)
        };
        assert!(SearchUseCase::new(search, base).unwrap().execute().is_err());
        assert!(!tmp.path().join("search").exists());
    }

    #[test]
    fn test_search_name_groups_trial_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let mut base = tiny_experiment(tmp.path());
        base.trainer.main_metric = vec!["PEARSON".into()];
        base.run.use_mlflow = true;
        base.run.mlflow_tracking_uri = format!("file:{}", tmp.path().join("mlruns").display());

        let search = SearchConfig { search_name: Some("qe-sweep".into()), ..learning_rate_search(tmp.path(), 2) };
        let outcome = SearchUseCase::new(search, base).unwrap().execute().unwrap();

        for trial in &outcome.trials {
            let config = fs::read_to_string(trial.output_dir.join("config.yaml")).unwrap();
            assert!(config.contains("experiment_name: qe-sweep"));
        }

        let experiments: Vec<PathBuf> = fs::read_dir(tmp.path().join("mlruns"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.join("meta.yaml").exists())
            .collect();
        assert_eq!(experiments.len(), 1);
        let meta = fs::read_to_string(experiments[0].join("meta.yaml")).unwrap();
        assert!(meta.contains("name: qe-sweep"));
        let runs = fs::read_dir(&experiments[0]).unwrap().filter_map(|e| e.ok()).filter(|e| e.path().is_dir()).count();
        assert_eq!(runs, 2);
    }
}
