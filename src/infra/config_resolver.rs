// ============================================================
// Layer 6 — Config Resolver
// ============================================================
// Turns a root YAML document plus its `defaults` list into one
// fully resolved ExperimentConfig.
//
//   defaults:
//     - data: wmt20.qe.en_de        → <root>/data/wmt20.qe.en_de.yaml
//     - system/optimizer: adamw     → <root>/system/optimizer/adamw.yaml
//     - _self_                      → ignored
//
// Each fragment is deep-merged under its namespace; values the
// root document sets explicitly always win. Relative corpus paths
// inside a fragment are anchored at the configuration root's
// parent, so resolved documents no longer depend on where the
// fragment lived. Resolving an already resolved document is a
// no-op because the `defaults` key is consumed.
//
// Reference: serde_yaml crate documentation

use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::domain::config::ExperimentConfig;
use crate::domain::error::{QeError, QeResult};

const DEFAULTS_KEY: &str = "defaults";
const SELF_ENTRY:   &str = "_self_";
const MAX_DEPTH:    usize = 8;

/// Keys whose string values are filesystem paths inside fragments.
const PATH_KEYS: [&str; 9] = [
    "source", "target", "alignments",
    "target_tags", "source_tags", "sentence_scores",
    "load", "load_encoder", "load_vocabs",
];

pub struct ConfigResolver {
    config_root: PathBuf,
}

impl ConfigResolver {
    pub fn new(config_root: impl Into<PathBuf>) -> Self {
        Self { config_root: config_root.into() }
    }

    /// Resolver rooted at the directory holding `root_file`.
    pub fn for_file(root_file: &Path) -> Self {
        let dir = root_file.parent().unwrap_or_else(|| Path::new("."));
        let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
        Self::new(fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf()))
    }

    /// Load, resolve, deserialize and validate in one go.
    pub fn resolve_file(root_file: &Path) -> QeResult<ExperimentConfig> {
        let resolver = Self::for_file(root_file);
        let document = read_document(root_file)?;
        let resolved = resolver.resolve_document(document)?;
        parse_config(resolved)
    }

    /// Expand `defaults` in `document`. The result carries no `defaults` key.
    pub fn resolve_document(&self, document: Value) -> QeResult<Value> {
        self.resolve_at_depth(document, 0)
    }

    fn resolve_at_depth(&self, document: Value, depth: usize) -> QeResult<Value> {
        if depth > MAX_DEPTH {
            return Err(QeError::config(DEFAULTS_KEY, "fragments nest too deeply (cycle?)"));
        }
        let mut root = match document {
            Value::Mapping(map) => map,
            Value::Null => Mapping::new(),
            _ => return Err(QeError::config("<document>", "top level must be a mapping")),
        };

        let entries = match root.remove(DEFAULTS_KEY) {
            None | Some(Value::Null) => return Ok(Value::Mapping(root)),
            Some(Value::Sequence(entries)) => entries,
            Some(_) => return Err(QeError::config(DEFAULTS_KEY, "must be a list")),
        };

        let mut document = Value::Mapping(root);
        for entry in entries {
            let (namespace, name) = match entry {
                Value::String(s) if s == SELF_ENTRY => continue,
                Value::Mapping(map) if map.len() == 1 => {
                    let Some((key, value)) = map.into_iter().next() else { continue };
                    let namespace = key
                        .as_str()
                        .ok_or_else(|| QeError::config(DEFAULTS_KEY, "namespace must be a string"))?
                        .to_string();
                    match value {
                        Value::Null => continue,
                        Value::String(name) => (namespace, name),
                        other => {
                            let name = scalar_to_string(&other).ok_or_else(|| {
                                QeError::config(
                                    format!("{DEFAULTS_KEY}.{namespace}"),
                                    "fragment name must be a string",
                                )
                            })?;
                            (namespace, name)
                        }
                    }
                }
                _ => {
                    return Err(QeError::config(
                        DEFAULTS_KEY,
                        "entries must be `namespace: fragment` pairs or `_self_`",
                    ))
                }
            };

            let fragment = self.load_fragment(&namespace, &name, depth)?;
            merge_under(&mut document, &namespace, fragment);
            tracing::debug!("Merged fragment '{}/{}'", namespace, name);
        }
        Ok(document)
    }

    fn load_fragment(&self, namespace: &str, name: &str, depth: usize) -> QeResult<Value> {
        let dir = self.config_root.join(namespace);
        let path = ["yaml", "yml"]
            .iter()
            .map(|ext| dir.join(format!("{name}.{ext}")))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                QeError::config(
                    format!("{DEFAULTS_KEY}.{namespace}"),
                    format!("fragment '{name}' not found under '{}'", dir.display()),
                )
            })?;

        let fragment = self.resolve_at_depth(read_document(&path)?, depth + 1)?;
        Ok(anchor_paths(fragment, &self.path_base()))
    }

    fn path_base(&self) -> PathBuf {
        match self.config_root.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => self.config_root.clone(),
        }
    }
}

// ─── Parsing ──────────────────────────────────────────────────────────────────

pub fn read_document(path: &Path) -> QeResult<Value> {
    let text = fs::read_to_string(path).map_err(|e| {
        QeError::config("<document>", format!("cannot read '{}': {e}", path.display()))
    })?;
    serde_yaml::from_str(&text).map_err(|e| yaml_error(&e))
}

/// Deserialize a resolved document into a validated ExperimentConfig.
pub fn parse_config(document: Value) -> QeResult<ExperimentConfig> {
    let config: ExperimentConfig =
        serde_yaml::from_value(document.clone()).map_err(|e| yaml_error(&e))?;

    if let Ok(known) = serde_yaml::to_value(&config) {
        for key in unknown_keys(&document, &known, "") {
            tracing::debug!("Ignoring unknown configuration key `{}`", key);
        }
    }

    config.validate()?;
    Ok(config)
}

pub fn to_yaml(config: &ExperimentConfig) -> QeResult<String> {
    Ok(serde_yaml::to_string(config)?)
}

/// serde_yaml prefixes nested errors with the dotted field path.
fn yaml_error(err: &serde_yaml::Error) -> QeError {
    let text = err.to_string();
    match text.split_once(": ") {
        Some((path, message)) if !path.is_empty() && !path.contains(char::is_whitespace) => {
            QeError::config(path, message)
        }
        _ => QeError::config("<document>", text),
    }
}

fn unknown_keys(input: &Value, known: &Value, prefix: &str) -> Vec<String> {
    let (Value::Mapping(input), Value::Mapping(known)) = (input, known) else {
        return Vec::new();
    };
    let mut unknown = Vec::new();
    for (key, value) in input {
        let name = scalar_to_string(key).unwrap_or_default();
        let path = if prefix.is_empty() { name } else { format!("{prefix}.{name}") };
        match known.get(key) {
            None => unknown.push(path),
            Some(known_value) => unknown.extend(unknown_keys(value, known_value, &path)),
        }
    }
    unknown
}

// ─── Merging ──────────────────────────────────────────────────────────────────

fn merge_under(document: &mut Value, namespace: &str, fragment: Value) {
    let mut slot = document;
    for part in namespace.split('/') {
        if !slot.is_mapping() {
            *slot = Value::Mapping(Mapping::new());
        }
        let Some(map) = slot.as_mapping_mut() else { return };
        slot = map
            .entry(Value::String(part.to_string()))
            .or_insert(Value::Null);
    }
    let existing = std::mem::take(slot);
    *slot = match existing {
        Value::Null => fragment,
        explicit => deep_merge(fragment, explicit),
    };
}

/// Recursively merge `overlay` onto `base`; overlay values win.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        (_, overlay) => overlay,
    }
}

fn anchor_paths(value: Value, base: &Path) -> Value {
    match value {
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(key, value)| {
                    let is_path_key = key.as_str().is_some_and(|k| PATH_KEYS.contains(&k));
                    let value = match value {
                        Value::String(s) if is_path_key && Path::new(&s).is_relative() => {
                            Value::String(base.join(&s).to_string_lossy().into_owned())
                        }
                        other => anchor_paths(other, base),
                    };
                    (key, value)
                })
                .collect(),
        ),
        Value::Sequence(items) => {
            Value::Sequence(items.into_iter().map(|v| anchor_paths(v, base)).collect())
        }
        other => other,
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    const DATA_FRAGMENT: &str = r#"
train:
  input:
    source: data/train.src
    target: data/train.mt
  output:
    target_tags: data/train.tags
    sentence_scores: data/train.hter
valid:
  input:
    source: data/dev.src
    target: data/dev.mt
"#;

    const ROOT: &str = r#"
run:
  experiment_name: en_de
defaults:
  - data: wmt20.qe.en_de
  - _self_
data:
  valid:
    input:
      source: /explicit/dev.src
system:
  class_name: PredictorEstimator
  model:
    outputs:
      word_level:
        target: true
      sentence_level:
        hter: true
  data_processing:
    vocab:
      max_size: 60_000
  optimizer:
    learning_rate: 1e-05
"#;

    fn workspace() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join("config");
        fs::create_dir_all(config_dir.join("data")).unwrap();
        fs::write(config_dir.join("data/wmt20.qe.en_de.yaml"), DATA_FRAGMENT).unwrap();
        let root = config_dir.join("predest.yaml");
        fs::write(&root, ROOT).unwrap();
        (tmp, root)
    }

    #[test]
    fn test_fragment_merged_without_overriding_root() {
        let (_tmp, root) = workspace();
        let cfg = ConfigResolver::resolve_file(&root).unwrap();

        let valid = cfg.data.valid.unwrap();
        assert_eq!(valid.input.source.unwrap(), PathBuf::from("/explicit/dev.src"));
        let dev_mt = valid.input.target.unwrap();
        assert!(dev_mt.is_absolute());
        assert!(dev_mt.ends_with("data/dev.mt"));

        assert!(cfg.data.train.unwrap().output.sentence_scores.is_some());
        assert_eq!(cfg.system.data_processing.vocab.max_size, Some(60_000));
        assert_eq!(cfg.system.optimizer.learning_rate, 1e-5);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let (_tmp, root) = workspace();
        let resolver = ConfigResolver::for_file(&root);
        let once = resolver.resolve_document(read_document(&root).unwrap()).unwrap();
        let twice = resolver.resolve_document(once.clone()).unwrap();
        assert_eq!(once, twice);
        assert!(once.get(DEFAULTS_KEY).is_none());
    }

    #[test]
    fn test_missing_fragment_names_the_namespace() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root.yaml");
        fs::write(&root, "defaults:\n  - data: nowhere\nsystem:\n  class_name: Bert\n").unwrap();
        let err = ConfigResolver::resolve_file(&root).unwrap_err();
        assert!(matches!(err, QeError::Config { ref path, .. } if path == "defaults.data"));
    }

    #[test]
    fn test_non_string_fragment_names() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("data")).unwrap();
        fs::write(tmp.path().join("data/2020.yaml"), DATA_FRAGMENT).unwrap();
        let root = tmp.path().join("root.yaml");
        let system = "system:\n  class_name: Predictor\n  model:\n    outputs:\n      word_level:\n        target: true\n";
        fs::write(&root, format!("defaults:\n  - data: 2020\n{system}")).unwrap();
        let cfg = ConfigResolver::resolve_file(&root).unwrap();
        assert!(cfg.data.train.is_some());

        fs::write(&root, format!("defaults:\n  - data: [a, b]\n{system}")).unwrap();
        let err = ConfigResolver::resolve_file(&root).unwrap_err();
        assert!(matches!(err, QeError::Config { ref path, .. } if path == "defaults.data"));
    }

    #[test]
    fn test_both_class_name_and_load_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root.yaml");
        fs::write(
            &root,
            "system:\n  class_name: Bert\n  load: runs/best\n",
        )
        .unwrap();
        assert!(ConfigResolver::resolve_file(&root).is_err());
    }

    #[test]
    fn test_bad_numeric_field_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root.yaml");
        fs::write(&root, "trainer:\n  epochs: lots\nsystem:\n  class_name: Bert\n").unwrap();
        let err = ConfigResolver::resolve_file(&root).unwrap_err();
        assert!(matches!(err, QeError::Config { .. }));
    }

    #[test]
    fn test_deep_merge_overlay_wins() {
        let base: Value = serde_yaml::from_str("a: {b: 1, c: 2}").unwrap();
        let overlay: Value = serde_yaml::from_str("a: {c: 3}").unwrap();
        let merged = deep_merge(base, overlay);
        let expected: Value = serde_yaml::from_str("a: {b: 1, c: 3}").unwrap();
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_unknown_keys_are_reported() {
        let input: Value = serde_yaml::from_str("run: {seed: 1, colour: red}").unwrap();
        let known = serde_yaml::to_value(ExperimentConfig::default()).unwrap();
        assert_eq!(unknown_keys(&input, &known, ""), vec!["run.colour".to_string()]);
    }
}
