//! Typed training configuration.
//!
//! Uses `figment` for layered loading: configuration document -> environment
//! (`GANTRY_` prefix). Required keys have no default and fail the load when
//! absent; optional keys get their defaults here, once, so the rest of the
//! crate never has to guess.

use figment::{
    Figment,
    providers::{Env, Format, Json, Toml, Yaml},
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Hyperparameters and locations for one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Adam learning rate for both networks.
    pub lr: f64,
    pub batch_size: usize,
    /// Dimensionality of the generator's latent input.
    pub latent_dim: usize,
    /// Generator width factor.
    pub ngf: usize,
    /// Discriminator width factor.
    pub ndf: usize,
    /// Image channels.
    pub nc: usize,
    pub epochs: usize,
    /// Save a checkpoint when `epoch % checkpoint_interval == 0`.
    pub checkpoint_interval: usize,
    pub use_cuda: bool,
    pub beta1: f64,
    pub weight_decay: f64,
    /// Number of generator samples drawn for each evaluation grid.
    pub num_eval_samples: usize,
    pub image_size: usize,
    pub data_root: PathBuf,
    /// Project namespace for the telemetry sink.
    pub wandb_project: String,

    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    /// Train on a random subset of this many samples (full dataset if unset).
    #[serde(default)]
    pub subset_size: Option<usize>,
    /// Emit per-batch losses every N batches. Unset or `-1` disables it.
    #[serde(default, deserialize_with = "deserialize_interval")]
    pub log_interval: Option<usize>,
    #[serde(default = "default_resume_training")]
    pub resume_training: bool,
    #[serde(default)]
    pub run_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Seed for latent noise and data shuffling.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_telemetry_dir")]
    pub telemetry_dir: PathBuf,
    /// Number of decoded batches the data worker may run ahead.
    #[serde(default = "default_prefetch_batches")]
    pub prefetch_batches: usize,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_resume_training() -> bool {
    true
}

fn default_telemetry_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_prefetch_batches() -> usize {
    2
}

fn deserialize_interval<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<i64>::deserialize(deserializer)?;
    Ok(match raw {
        Some(n) if n >= 0 => Some(n as usize),
        _ => None,
    })
}

/// A single key whose value differs between two configurations.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDifference {
    pub key: String,
    /// Value stored in the checkpoint, `None` if the key was absent there.
    pub checkpoint: Option<serde_json::Value>,
    /// Value in the running configuration, `None` if the key is absent.
    pub current: Option<serde_json::Value>,
}

impl fmt::Display for ConfigDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show(v: &Option<serde_json::Value>) -> String {
            v.as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "<absent>".to_string())
        }
        write!(
            f,
            "{}: checkpoint={}, current={}",
            self.key,
            show(&self.checkpoint),
            show(&self.current)
        )
    }
}

impl TrainingConfig {
    /// Parse a YAML document, apply defaults and validate.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::from(Yaml::string(contents)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: TrainingConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail deep inside training.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("latent_dim", self.latent_dim),
            ("ngf", self.ngf),
            ("ndf", self.ndf),
            ("nc", self.nc),
            ("epochs", self.epochs),
            ("checkpoint_interval", self.checkpoint_interval),
            ("num_eval_samples", self.num_eval_samples),
            ("image_size", self.image_size),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(invalid(format!("{key} must be greater than zero")));
            }
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(invalid(format!("lr must be positive, got {}", self.lr)));
        }
        if !(0.0..1.0).contains(&self.beta1) {
            return Err(invalid(format!("beta1 must be in [0, 1), got {}", self.beta1)));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(invalid(format!(
                "weight_decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        if self.log_interval == Some(0) {
            return Err(invalid(
                "log_interval must be positive (use -1 to disable)".to_string(),
            ));
        }
        if self.subset_size == Some(0) {
            return Err(invalid("subset_size must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Normalized key -> value view used for persistence and comparison.
    pub fn to_map(&self) -> BTreeMap<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Key-wise differences between a stored configuration and this one.
    pub fn diff_against(
        &self,
        stored: &BTreeMap<String, serde_json::Value>,
    ) -> Vec<ConfigDifference> {
        let current = self.to_map();
        let keys: BTreeSet<&String> = stored.keys().chain(current.keys()).collect();
        keys.into_iter()
            .filter_map(|key| {
                let old = stored.get(key);
                let new = current.get(key);
                (old != new).then(|| ConfigDifference {
                    key: key.clone(),
                    checkpoint: old.cloned(),
                    current: new.cloned(),
                })
            })
            .collect()
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid { message }
}

/// Load configuration from a document plus environment overrides.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `GANTRY_`, e.g. `GANTRY_EPOCHS=3`)
/// 2. The configuration document (`.yaml`/`.yml`, `.toml` or `.json`)
/// 3. Built-in defaults for optional keys
pub fn load_config(path: &Path) -> Result<TrainingConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let figment = match extension.as_str() {
        "yaml" | "yml" => Figment::from(Yaml::file(path)),
        "toml" => Figment::from(Toml::file(path)),
        "json" => Figment::from(Json::file(path)),
        other => {
            return Err(invalid(format!(
                "unsupported configuration format '{other}' for {}",
                path.display()
            )));
        }
    };

    TrainingConfig::extract(figment.merge(Env::prefixed("GANTRY_")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) const SAMPLE_YAML: &str = r#"
lr: 0.0002
batch_size: 128
latent_dim: 100
ngf: 64
ndf: 64
nc: 3
epochs: 2
checkpoint_interval: 1
use_cuda: false
beta1: 0.5
weight_decay: 0.0
num_eval_samples: 16
image_size: 64
data_root: ./data
wandb_project: dcgan-celeba
"#;

    #[test]
    fn test_defaults_applied_once() {
        let config = TrainingConfig::from_yaml_str(SAMPLE_YAML).unwrap();
        assert_eq!(config.checkpoint_dir, PathBuf::from("checkpoints"));
        assert_eq!(config.subset_size, None);
        assert_eq!(config.log_interval, None);
        assert!(config.resume_training);
        assert!(config.tags.is_empty());
        assert_eq!(config.prefetch_batches, 2);
    }

    #[test]
    fn test_missing_required_key_is_fatal() {
        let yaml = SAMPLE_YAML.replace("latent_dim: 100\n", "");
        let err = TrainingConfig::from_yaml_str(&yaml).unwrap_err();
        match err {
            ConfigError::MissingField { field } => assert_eq!(field, "latent_dim"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_log_interval_minus_one_disables() {
        let yaml = format!("{SAMPLE_YAML}log_interval: -1\n");
        let config = TrainingConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.log_interval, None);

        let yaml = format!("{SAMPLE_YAML}log_interval: 10\n");
        let config = TrainingConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.log_interval, Some(10));
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let yaml = SAMPLE_YAML.replace("checkpoint_interval: 1", "checkpoint_interval: 0");
        assert!(matches!(
            TrainingConfig::from_yaml_str(&yaml),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_bad_beta() {
        let yaml = SAMPLE_YAML.replace("beta1: 0.5", "beta1: 1.5");
        assert!(TrainingConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_diff_reports_each_key() {
        let a = TrainingConfig::from_yaml_str(SAMPLE_YAML).unwrap();
        let mut b = a.clone();
        b.lr = 0.001;
        b.epochs = 5;

        let diffs = b.diff_against(&a.to_map());
        let keys: Vec<_> = diffs.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["epochs", "lr"]);
        assert_eq!(diffs[1].checkpoint, Some(serde_json::json!(0.0002)));
        assert_eq!(diffs[1].current, Some(serde_json::json!(0.001)));
        assert!(a.diff_against(&a.clone().to_map()).is_empty());
    }

    #[test]
    fn test_diff_reports_absent_keys() {
        let config = TrainingConfig::from_yaml_str(SAMPLE_YAML).unwrap();
        let mut stored = config.to_map();
        stored.remove("tags");
        stored.insert("legacy".into(), serde_json::json!(true));

        let diffs = config.diff_against(&stored);
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].key, "legacy");
        assert_eq!(diffs[0].current, None);
        assert_eq!(diffs[1].key, "tags");
        assert_eq!(diffs[1].checkpoint, None);
        assert!(diffs[1].to_string().contains("checkpoint=<absent>"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, SAMPLE_YAML).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.wandb_project, "dcgan-celeba");
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/gantry.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_config_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "lr = 1").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
