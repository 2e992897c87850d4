use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "AVSHELF_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the media tree that gets indexed.
    #[serde(default = "default_media_path")]
    pub media_path: PathBuf,

    /// Catalogue database. Relative paths resolve against `media_path`.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Port of the browse front-end sharing this catalogue.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Extra file or directory names the scanner never descends into.
    #[serde(default)]
    pub ignore: Vec<String>,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub scorer: ScorerConfig,

    #[serde(default)]
    pub improver: ImproverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of probe workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    2
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Seconds between full ingest passes; zero runs a single pass.
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_secs: u64,
}

fn default_rescan_interval() -> u64 {
    600
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            rescan_interval_secs: default_rescan_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    #[serde(default = "default_scorer_enabled")]
    pub enabled: bool,

    /// Inference threads handed to the ONNX runtime and the preprocessing pool.
    #[serde(default = "default_scorer_threads")]
    pub threads: usize,

    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Detector model; downloaded into `models_dir` when unset and missing.
    #[serde(default)]
    pub detector_model: Option<PathBuf>,

    /// Optional face quality model (112x112 input). Quality is 1.0 without it.
    #[serde(default)]
    pub quality_model: Option<PathBuf>,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,

    /// Faces whose box area is at or below this many pixels are ignored.
    #[serde(default = "default_min_face_area")]
    pub min_face_area: i64,
}

fn default_scorer_enabled() -> bool {
    true
}

fn default_scorer_threads() -> usize {
    2
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("avshelf")
        .join("models")
}

fn default_confidence_threshold() -> f32 {
    0.6
}

fn default_nms_threshold() -> f32 {
    0.5
}

fn default_min_face_area() -> i64 {
    30 * 30
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scorer_enabled(),
            threads: default_scorer_threads(),
            models_dir: default_models_dir(),
            detector_model: None,
            quality_model: None,
            confidence_threshold: default_confidence_threshold(),
            nms_threshold: default_nms_threshold(),
            min_face_area: default_min_face_area(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImproverConfig {
    /// Files keep getting probed below this count regardless of score.
    #[serde(default = "default_min_probes")]
    pub min_probes: u32,

    /// Hard cap on probes per file.
    #[serde(default = "default_max_probes")]
    pub max_probes: u32,

    /// Thumbnails kept per file after an overflow cull.
    #[serde(default = "default_keep_thumbnails")]
    pub keep_thumbnails: u32,

    #[serde(default = "default_target_area")]
    pub target_area: f64,

    #[serde(default = "default_target_confidence")]
    pub target_confidence: f64,

    #[serde(default = "default_target_quality")]
    pub target_quality: f64,

    /// Upper bound of the random idle sleep between rounds.
    #[serde(default = "default_idle_max_secs")]
    pub idle_max_secs: u64,

    /// Upper bound of the random sleep after a locked database.
    #[serde(default = "default_locked_retry_max_secs")]
    pub locked_retry_max_secs: u64,
}

fn default_min_probes() -> u32 {
    10
}

fn default_max_probes() -> u32 {
    30
}

fn default_keep_thumbnails() -> u32 {
    4
}

fn default_target_area() -> f64 {
    30000.0
}

fn default_target_confidence() -> f64 {
    0.85
}

fn default_target_quality() -> f64 {
    0.6
}

fn default_idle_max_secs() -> u64 {
    60
}

fn default_locked_retry_max_secs() -> u64 {
    30
}

impl Default for ImproverConfig {
    fn default() -> Self {
        Self {
            min_probes: default_min_probes(),
            max_probes: default_max_probes(),
            keep_thumbnails: default_keep_thumbnails(),
            target_area: default_target_area(),
            target_confidence: default_target_confidence(),
            target_quality: default_target_quality(),
            idle_max_secs: default_idle_max_secs(),
            locked_retry_max_secs: default_locked_retry_max_secs(),
        }
    }
}

impl ImproverConfig {
    /// Score a file has to reach before the improver leaves it alone.
    pub fn target_score(&self) -> f64 {
        crate::faces::score_fn(self.target_area, self.target_confidence, self.target_quality)
    }
}

fn default_media_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("info.db")
}

fn default_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            media_path: default_media_path(),
            db_path: default_db_path(),
            port: default_port(),
            ignore: Vec::new(),
            dispatch: DispatchConfig::default(),
            scanner: ScannerConfig::default(),
            scorer: ScorerConfig::default(),
            improver: ImproverConfig::default(),
        }
    }
}

impl Config {
    /// Load from the default location (or `AVSHELF_CONFIG`). A missing file
    /// yields the defaults.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(Self::config_path);

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::warn!(path = %config_path.display(), "No config file, using defaults");
            Ok(Config::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("avshelf")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Catalogue path with relative paths anchored at the media root.
    pub fn resolved_db_path(&self) -> PathBuf {
        if self.db_path.is_absolute() {
            self.db_path.clone()
        } else {
            self.media_path.join(&self.db_path)
        }
    }

    /// Names the scanner skips: the configured list plus the catalogue file.
    pub fn ignore_names(&self) -> Vec<String> {
        let mut names = self.ignore.clone();
        if let Some(name) = self.resolved_db_path().file_name() {
            let name = name.to_string_lossy().to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.dispatch.workers, 2);
        assert_eq!(config.scorer.threads, 2);
        assert_eq!(config.improver.keep_thumbnails, 4);
        assert_eq!(config.improver.min_probes, 10);
        assert_eq!(config.improver.max_probes, 30);
        assert_eq!(config.db_path, PathBuf::from("info.db"));
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            media_path = "/srv/media"
            ignore = ["lost+found"]

            [dispatch]
            workers = 6

            [improver]
            keep_thumbnails = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.dispatch.workers, 6);
        assert_eq!(config.improver.keep_thumbnails, 2);
        assert_eq!(config.improver.max_probes, 30);
        assert_eq!(config.resolved_db_path(), PathBuf::from("/srv/media/info.db"));
        assert_eq!(config.ignore_names(), vec!["lost+found".to_string(), "info.db".to_string()]);
    }

    #[test]
    fn test_target_score() {
        let improver = ImproverConfig::default();
        let expected = 30000f64.sqrt() * 0.85 * 0.6;
        assert!((improver.target_score() - expected).abs() < 1e-9);
    }
}
