// ============================================================
// Layer 6 — Experiment Tracking
// ============================================================
// RunTracker implements ExperimentTracker for a single run:
//
//   always      → <output_dir>/config.yaml  (resolved config)
//                 <output_dir>/metrics.csv  (MetricsLogger)
//   use_mlflow  → MLflow file store under mlflow_tracking_uri:
//                   <root>/<experiment id>/meta.yaml
//                   <root>/<experiment id>/<run id>/
//                     meta.yaml, params/, metrics/, tags/, artifacts/
//
// An http(s) tracking URI needs an MLflow server client, which
// this crate does not ship; the tracker warns and keeps logging
// locally instead of failing the run.
//
// Reference: MLflow FileStore layout

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::domain::config::{ExperimentConfig, RunConfig};
use crate::domain::error::{QeError, QeResult};
use crate::domain::metrics::MetricValues;
use crate::domain::traits::{ExperimentTracker, RunStatus};
use crate::infra::config_resolver::to_yaml;
use crate::infra::metrics::MetricsLogger;

// ─── Run identity ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RunIdentity {
    pub run_id:     String,
    pub output_dir: PathBuf,
}

impl RunIdentity {
    /// Use the configured id/dir, or assign `runs/<experiment>/<uuid>`.
    pub fn assign(run: &RunConfig) -> Self {
        let run_id = run
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let output_dir = run
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("runs").join(&run.experiment_name).join(&run_id));
        Self { run_id, output_dir }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackingTarget {
    Local,
    FileStore(PathBuf),
}

pub fn tracking_target(uri: &str) -> TrackingTarget {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        tracing::warn!(
            "MLflow server URI '{}' is not supported without a server client; \
             continuing with local logging only",
            uri
        );
        return TrackingTarget::Local;
    }
    let path = uri
        .strip_prefix("file://")
        .or_else(|| uri.strip_prefix("file:"))
        .unwrap_or(uri);
    TrackingTarget::FileStore(PathBuf::from(path))
}

// ─── RunTracker ───────────────────────────────────────────────────────────────
pub struct RunTracker {
    output_dir:           PathBuf,
    csv:                  MetricsLogger,
    mlflow:               Option<MlflowFileStore>,
    always_log_artifacts: bool,
}

impl RunTracker {
    pub fn new(run: &RunConfig, identity: &RunIdentity) -> QeResult<Self> {
        fs::create_dir_all(&identity.output_dir)?;
        let csv = MetricsLogger::new(&identity.output_dir)?;

        let mlflow = match (run.use_mlflow, tracking_target(&run.mlflow_tracking_uri)) {
            (true, TrackingTarget::FileStore(root)) => Some(MlflowFileStore::open(
                &root,
                &run.experiment_name,
                &identity.run_id,
            )?),
            _ => None,
        };

        Ok(Self {
            output_dir: identity.output_dir.clone(),
            csv,
            mlflow,
            always_log_artifacts: run.mlflow_always_log_artifacts,
        })
    }

    pub fn mlflow_run_dir(&self) -> Option<&Path> {
        self.mlflow.as_ref().map(|m| m.run_dir.as_path())
    }
}

impl ExperimentTracker for RunTracker {
    fn log_config(&mut self, config: &ExperimentConfig) -> QeResult<()> {
        let path = self.output_dir.join("config.yaml");
        fs::write(&path, to_yaml(config)?)?;
        tracing::info!("Resolved configuration written to '{}'", path.display());

        if let Some(store) = &self.mlflow {
            let value = serde_json::to_value(config)?;
            let mut params = Vec::new();
            flatten("", &value, &mut params);
            for (key, value) in params {
                store.log_param(&key, &value)?;
            }
            store.set_tag("mlflow.runName", &config.run.experiment_name)?;
            store.set_tag("seed", &config.run.seed.to_string())?;
            store.log_artifact(&path)?;
        }
        Ok(())
    }

    fn log_metrics(&mut self, step: usize, metrics: &MetricValues) -> QeResult<()> {
        self.csv.log(step, metrics)?;
        if let Some(store) = &self.mlflow {
            for (name, value) in metrics {
                store.log_metric(name, *value, step)?;
            }
        }
        Ok(())
    }

    fn log_artifact(&mut self, path: &Path) -> QeResult<()> {
        match &self.mlflow {
            Some(store) if self.always_log_artifacts => store.log_artifact(path),
            _ => {
                tracing::debug!("Artifact available at '{}'", path.display());
                Ok(())
            }
        }
    }

    fn finish(&mut self, status: RunStatus) -> QeResult<()> {
        if let Some(store) = &mut self.mlflow {
            store.finish(status)?;
        }
        tracing::info!("Run finished with status {:?}", status);
        Ok(())
    }
}

/// Flatten nested JSON into dotted `key = value` parameters.
fn flatten(prefix: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let key = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
                flatten(&key, child, out);
            }
        }
        serde_json::Value::Null => {}
        serde_json::Value::String(s) => out.push((prefix.to_string(), s.clone())),
        other => out.push((prefix.to_string(), other.to_string())),
    }
}

// ─── MLflow file store ────────────────────────────────────────────────────────

// RUNNING=1, FINISHED=3, FAILED=4, KILLED=5
fn mlflow_status(status: RunStatus) -> u8 {
    match status {
        RunStatus::Completed | RunStatus::EarlyStopped => 3,
        RunStatus::Failed => 4,
        RunStatus::Interrupted => 5,
    }
}

#[derive(Debug, Serialize)]
struct ExperimentMeta {
    artifact_location: String,
    experiment_id:     String,
    lifecycle_stage:   String,
    name:              String,
    creation_time:     i64,
    last_update_time:  i64,
}

#[derive(Debug, Clone, Serialize)]
struct RunMeta {
    artifact_uri:     String,
    end_time:         Option<i64>,
    entry_point_name: String,
    experiment_id:    String,
    lifecycle_stage:  String,
    run_id:           String,
    run_name:         String,
    run_uuid:         String,
    source_name:      String,
    source_type:      u8,
    source_version:   String,
    start_time:       i64,
    status:           u8,
    tags:             Vec<String>,
    user_id:          String,
}

pub struct MlflowFileStore {
    run_dir: PathBuf,
    meta:    RunMeta,
}

impl MlflowFileStore {
    pub fn open(root: &Path, experiment_name: &str, run_id: &str) -> QeResult<Self> {
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let experiment_id = match find_experiment(&root, experiment_name)? {
            Some(id) => id,
            None => create_experiment(&root, experiment_name)?,
        };

        let run_dir = root.join(&experiment_id).join(run_id);
        for sub in ["metrics", "params", "tags", "artifacts"] {
            fs::create_dir_all(run_dir.join(sub))?;
        }

        let meta = RunMeta {
            artifact_uri:     format!("file://{}", run_dir.join("artifacts").display()),
            end_time:         None,
            entry_point_name: String::new(),
            experiment_id,
            lifecycle_stage:  "active".into(),
            run_id:           run_id.to_string(),
            run_name:         experiment_name.to_string(),
            run_uuid:         run_id.to_string(),
            source_name:      String::new(),
            source_type:      4,
            source_version:   String::new(),
            start_time:       Utc::now().timestamp_millis(),
            status:           1,
            tags:             Vec::new(),
            user_id:          std::env::var("USER").unwrap_or_else(|_| "unknown".into()),
        };
        let store = Self { run_dir, meta };
        store.write_meta()?;
        tracing::info!("MLflow run '{}' at '{}'", run_id, store.run_dir.display());
        Ok(store)
    }

    fn write_meta(&self) -> QeResult<()> {
        fs::write(self.run_dir.join("meta.yaml"), serde_yaml::to_string(&self.meta)?)?;
        Ok(())
    }

    pub fn log_param(&self, key: &str, value: &str) -> QeResult<()> {
        fs::write(self.run_dir.join("params").join(sanitize(key)), value)?;
        Ok(())
    }

    pub fn set_tag(&self, key: &str, value: &str) -> QeResult<()> {
        fs::write(self.run_dir.join("tags").join(sanitize(key)), value)?;
        Ok(())
    }

    pub fn log_metric(&self, name: &str, value: f64, step: usize) -> QeResult<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir.join("metrics").join(sanitize(name)))?;
        writeln!(f, "{} {} {}", Utc::now().timestamp_millis(), value, step)?;
        Ok(())
    }

    pub fn log_artifact(&self, path: &Path) -> QeResult<()> {
        let name = path
            .file_name()
            .ok_or_else(|| QeError::checkpoint_io(path, "artifact path has no file name"))?;
        copy_recursively(path, &self.run_dir.join("artifacts").join(name))
    }

    pub fn finish(&mut self, status: RunStatus) -> QeResult<()> {
        self.meta.status   = mlflow_status(status);
        self.meta.end_time = Some(Utc::now().timestamp_millis());
        self.write_meta()
    }
}

fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_alphanumeric() || "_-. ".contains(c) { c } else { '_' })
        .collect()
}

fn find_experiment(root: &Path, name: &str) -> QeResult<Option<String>> {
    for entry in fs::read_dir(root)? {
        let meta = entry?.path().join("meta.yaml");
        let Ok(text) = fs::read_to_string(&meta) else { continue };
        let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(&text) else { continue };
        if value.get("name").and_then(|v| v.as_str()) == Some(name) {
            let id = value.get("experiment_id").and_then(|v| match v {
                serde_yaml::Value::String(s) => Some(s.clone()),
                serde_yaml::Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            if id.is_some() {
                return Ok(id);
            }
        }
    }
    Ok(None)
}

fn create_experiment(root: &Path, name: &str) -> QeResult<String> {
    let next_id = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<u64>().ok()))
        .max()
        .map_or(1, |max| max + 1);
    let id = next_id.to_string();
    let dir = root.join(&id);
    fs::create_dir_all(&dir)?;

    let now = Utc::now().timestamp_millis();
    let meta = ExperimentMeta {
        artifact_location: format!("file://{}", dir.display()),
        experiment_id:     id.clone(),
        lifecycle_stage:   "active".into(),
        name:              name.to_string(),
        creation_time:     now,
        last_update_time:  now,
    };
    fs::write(dir.join("meta.yaml"), serde_yaml::to_string(&meta)?)?;
    tracing::info!("Created MLflow experiment '{}' with id {}", name, id);
    Ok(id)
}

fn copy_recursively(from: &Path, to: &Path) -> QeResult<()> {
    if from.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_recursively(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        fs::copy(from, to)?;
    }
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn run_config(root: &Path, use_mlflow: bool) -> RunConfig {
        RunConfig {
            experiment_name: "en_de".into(),
            mlflow_tracking_uri: format!("file:{}", root.join("mlruns").display()),
            output_dir: Some(root.join("out")),
            run_id: Some("run1".into()),
            use_mlflow,
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_tracking_target() {
        assert_eq!(tracking_target("http://mlflow:5000"), TrackingTarget::Local);
        assert_eq!(
            tracking_target("file:///tmp/mlruns"),
            TrackingTarget::FileStore(PathBuf::from("/tmp/mlruns"))
        );
        assert_eq!(tracking_target("mlruns/"), TrackingTarget::FileStore(PathBuf::from("mlruns/")));
    }

    #[test]
    fn test_assigned_output_dir() {
        let identity = RunIdentity::assign(&RunConfig::default());
        assert!(identity.output_dir.starts_with("runs/default"));
        assert_eq!(identity.run_id.len(), 32);
    }

    #[test]
    fn test_local_only_run_writes_config_and_csv() {
        let tmp = tempfile::tempdir().unwrap();
        let run = run_config(tmp.path(), false);
        let identity = RunIdentity::assign(&run);
        let mut tracker = RunTracker::new(&run, &identity).unwrap();

        tracker.log_config(&ExperimentConfig::default()).unwrap();
        tracker.log_metrics(10, &MetricValues::from([("loss".to_string(), 0.5)])).unwrap();
        tracker.finish(RunStatus::Completed).unwrap();

        assert!(tmp.path().join("out/config.yaml").exists());
        assert!(tmp.path().join("out/metrics.csv").exists());
        assert!(tracker.mlflow_run_dir().is_none());
        assert!(!tmp.path().join("mlruns").exists());
    }

    #[test]
    fn test_mlflow_file_store_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let run = run_config(tmp.path(), true);
        let identity = RunIdentity::assign(&run);
        let mut tracker = RunTracker::new(&run, &identity).unwrap();

        tracker.log_config(&ExperimentConfig::default()).unwrap();
        tracker.log_metrics(100, &MetricValues::from([("PEARSON".to_string(), 0.25)])).unwrap();
        tracker.finish(RunStatus::EarlyStopped).unwrap();

        let run_dir = tracker.mlflow_run_dir().unwrap().to_path_buf();
        let metric = fs::read_to_string(run_dir.join("metrics/PEARSON")).unwrap();
        assert!(metric.trim_end().ends_with("0.25 100"));
        assert_eq!(fs::read_to_string(run_dir.join("params/trainer.epochs")).unwrap(), "50");
        let meta = fs::read_to_string(run_dir.join("meta.yaml")).unwrap();
        assert!(meta.contains("status: 3"));

        // A second run of the same experiment reuses the experiment id.
        let again = MlflowFileStore::open(&tmp.path().join("mlruns"), "en_de", "run2").unwrap();
        assert_eq!(again.run_dir.parent(), run_dir.parent());
    }
}
