use facefindr_core::{EmbedderSettings, MatchCriterion, ModelPaths};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Engine and CLI configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Root directory of the event buckets.
    pub bucket_root: PathBuf,
    /// Path to the SQLite photo catalog.
    pub catalog_path: PathBuf,
    /// How selfie faces are compared with candidate faces.
    pub criterion: MatchCriterion,
    /// Keep only the N best matches; `None` keeps all.
    pub top_k: Option<usize>,
    /// Deadline for one match request, counted from acceptance.
    pub request_timeout_secs: u64,
    /// Candidates downloaded ahead of embedding. 0 disables prefetch.
    pub prefetch: usize,
    /// Faces embedded per image, most confident first.
    pub max_faces: Option<usize>,
}

/// Optional TOML file. Every key is optional; environment variables win.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    bucket_root: Option<PathBuf>,
    catalog_path: Option<PathBuf>,
    similarity_threshold: Option<f32>,
    max_distance: Option<f32>,
    top_k: Option<usize>,
    request_timeout_secs: Option<u64>,
    prefetch: Option<usize>,
    max_faces: Option<usize>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Load configuration from `FACEFINDR_*` environment variables, layered
    /// over the TOML file named by `FACEFINDR_CONFIG` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let file = match env("FACEFINDR_CONFIG") {
            Some(path) => {
                let path = PathBuf::from(path);
                tracing::debug!(path = %path.display(), "loading config file");
                FileConfig::load(&path)?
            }
            None => FileConfig::default(),
        };

        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facefindr");

        let model_dir = env("FACEFINDR_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));
        let bucket_root = env("FACEFINDR_BUCKET_ROOT")
            .map(PathBuf::from)
            .or(file.bucket_root)
            .unwrap_or_else(|| data_dir.join("buckets"));
        let catalog_path = env("FACEFINDR_CATALOG_PATH")
            .map(PathBuf::from)
            .or(file.catalog_path)
            .unwrap_or_else(|| data_dir.join("catalog.db"));

        let env_distance = parsed(&env, "FACEFINDR_MAX_DISTANCE");
        let env_threshold = parsed(&env, "FACEFINDR_SIMILARITY_THRESHOLD");
        let criterion = match (env_distance, env_threshold, file.max_distance, file.similarity_threshold) {
            (Some(max_distance), _, _, _) => MatchCriterion::Distance { max_distance },
            (None, Some(min_similarity), _, _) => MatchCriterion::Cosine { min_similarity },
            (None, None, Some(max_distance), _) => MatchCriterion::Distance { max_distance },
            (None, None, None, Some(min_similarity)) => MatchCriterion::Cosine { min_similarity },
            (None, None, None, None) => MatchCriterion::default(),
        };

        let top_k = parsed(&env, "FACEFINDR_TOP_K").or(file.top_k);
        let max_faces = parsed(&env, "FACEFINDR_MAX_FACES").or(file.max_faces);

        Ok(Self {
            model_dir,
            bucket_root,
            catalog_path,
            criterion,
            // 0 means unlimited
            top_k: top_k.filter(|&k| k > 0),
            request_timeout_secs: parsed(&env, "FACEFINDR_REQUEST_TIMEOUT_SECS")
                .or(file.request_timeout_secs)
                .unwrap_or(60),
            prefetch: parsed(&env, "FACEFINDR_PREFETCH")
                .or(file.prefetch)
                .unwrap_or(4),
            max_faces: max_faces.filter(|&n| n > 0),
        })
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }

    pub fn embedder_settings(&self) -> EmbedderSettings {
        EmbedderSettings {
            max_faces: self.max_faces,
            ..EmbedderSettings::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_lookup(lookup(&[("HOME", "/home/alice")])).unwrap();
        assert_eq!(cfg.model_dir, PathBuf::from("/home/alice/.local/share/facefindr/models"));
        assert_eq!(cfg.catalog_path, PathBuf::from("/home/alice/.local/share/facefindr/catalog.db"));
        assert_eq!(cfg.criterion, MatchCriterion::Cosine { min_similarity: 0.5 });
        assert_eq!(cfg.top_k, None);
        assert_eq!(cfg.request_timeout_secs, 60);
        assert_eq!(cfg.prefetch, 4);
        assert_eq!(cfg.max_faces, None);
    }

    #[test]
    fn test_env_values() {
        let cfg = Config::from_lookup(lookup(&[
            ("XDG_DATA_HOME", "/data"),
            ("FACEFINDR_BUCKET_ROOT", "/srv/buckets"),
            ("FACEFINDR_SIMILARITY_THRESHOLD", "0.35"),
            ("FACEFINDR_TOP_K", "10"),
            ("FACEFINDR_PREFETCH", "0"),
        ]))
        .unwrap();
        assert_eq!(cfg.model_dir, PathBuf::from("/data/facefindr/models"));
        assert_eq!(cfg.bucket_root, PathBuf::from("/srv/buckets"));
        assert_eq!(cfg.criterion, MatchCriterion::Cosine { min_similarity: 0.35 });
        assert_eq!(cfg.top_k, Some(10));
        assert_eq!(cfg.prefetch, 0);
    }

    #[test]
    fn test_distance_takes_precedence() {
        let cfg = Config::from_lookup(lookup(&[
            ("FACEFINDR_SIMILARITY_THRESHOLD", "0.35"),
            ("FACEFINDR_MAX_DISTANCE", "0.5"),
        ]))
        .unwrap();
        assert_eq!(cfg.criterion, MatchCriterion::Distance { max_distance: 0.5 });
    }

    #[test]
    fn test_unparsable_value_falls_back() {
        let cfg = Config::from_lookup(lookup(&[("FACEFINDR_REQUEST_TIMEOUT_SECS", "soon")])).unwrap();
        assert_eq!(cfg.request_timeout_secs, 60);
    }

    #[test]
    fn test_zero_top_k_is_unlimited() {
        let cfg = Config::from_lookup(lookup(&[("FACEFINDR_TOP_K", "0")])).unwrap();
        assert_eq!(cfg.top_k, None);
    }

    #[test]
    fn test_file_overlaid_by_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facefindr.toml");
        std::fs::write(
            &path,
            "model_dir = \"/opt/models\"\nmax_distance = 0.6\ntop_k = 3\nrequest_timeout_secs = 5\n",
        )
        .unwrap();

        let cfg = Config::from_lookup(lookup(&[
            ("FACEFINDR_CONFIG", path.to_str().unwrap()),
            ("FACEFINDR_TOP_K", "7"),
        ]))
        .unwrap();
        assert_eq!(cfg.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(cfg.criterion, MatchCriterion::Distance { max_distance: 0.6 });
        assert_eq!(cfg.top_k, Some(7));
        assert_eq!(cfg.request_timeout_secs, 5);
    }

    #[test]
    fn test_bad_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "unknown_key = 1\n").unwrap();
        let err = Config::from_lookup(lookup(&[("FACEFINDR_CONFIG", path.to_str().unwrap())])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        let missing = Config::from_lookup(lookup(&[("FACEFINDR_CONFIG", "/nonexistent/ff.toml")])).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
