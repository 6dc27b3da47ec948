//! Configuration for Folio
//!
//! Loaded once at startup from TOML (`.toml`) or JSON (any other extension),
//! merged with defaults, overridden from the environment and validated. The
//! result is shared read-only as `Arc<FolioConfig>` for the whole run.

use crate::error::{FolioError, Result};
use crate::rules::{self, ConflictPolicy, Rule, RuleSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Main configuration for a Folio run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FolioConfig {
    #[serde(rename = "PATHS")]
    pub paths: PathsConfig,

    /// Gates every enrichment lookup. When false the classifier never sees
    /// enrichment data.
    #[serde(rename = "AI_ALLOWED")]
    pub ai_allowed: bool,

    #[serde(rename = "FEATURES")]
    pub features: FeaturesConfig,

    #[serde(rename = "API_KEYS")]
    pub api_keys: ApiKeys,

    #[serde(rename = "SYSTEM")]
    pub system: SystemConfig,

    #[serde(rename = "CACHE")]
    pub cache: CacheConfig,

    #[serde(rename = "ENRICHMENT")]
    pub enrichment: EnrichmentConfig,

    #[serde(rename = "CLASSIFICATION")]
    pub classification: ClassificationConfig,

    /// Replaces the built-in rule set when present.
    #[serde(rename = "RULES", skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<Rule>>,
}

impl Default for FolioConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            ai_allowed: false,
            features: FeaturesConfig::default(),
            api_keys: ApiKeys::default(),
            system: SystemConfig::default(),
            cache: CacheConfig::default(),
            enrichment: EnrichmentConfig::default(),
            classification: ClassificationConfig::default(),
            rules: None,
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PathsConfig {
    pub input_folder: PathBuf,
    pub output_base_folder: PathBuf,
    /// Checkpoint log. Relative paths resolve under `CACHE_DIR`.
    pub db_file: PathBuf,
    pub log_file: PathBuf,
    pub cache_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_folder: PathBuf::from("input"),
            output_base_folder: PathBuf::from("output"),
            db_file: PathBuf::from("checkpoint.jsonl"),
            log_file: PathBuf::from("logs/folio.log"),
            cache_dir: PathBuf::from(".folio_cache"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FeaturesConfig {
    pub dry_run: bool,
    pub resume_enabled: bool,
    pub cache_enabled: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            resume_enabled: true,
            cache_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SystemConfig {
    pub max_workers: usize,
    /// Checkpoint flush cadence, in completed items.
    pub save_interval: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            save_interval: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CacheConfig {
    pub ttl_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_days: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct EnrichmentConfig {
    pub endpoint: String,
    /// Which `API_KEYS` entry is sent as the bearer token.
    pub api_key_name: String,
    pub timeout_secs: u64,
    pub requests_per_minute: u32,
    pub cooldown_minutes: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key_name: "GOOGLE_API_KEY".to_string(),
            timeout_secs: 20,
            requests_per_minute: 30,
            cooldown_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ClassificationConfig {
    pub conflict_policy: ConflictPolicy,
    pub corroboration_bonus: f64,
    pub confidence_cap: f64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::FirstMatch,
            corroboration_bonus: 0.05,
            confidence_cap: 0.99,
        }
    }
}

/// Opaque credentials handed to the enrichment gateway. Values never appear in
/// `Debug` output.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ApiKeys(BTreeMap<String, String>);

impl ApiKeys {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }
}

impl fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|name| (name, "<redacted>")))
            .finish()
    }
}

// ============================================================================
// Loading
// ============================================================================

impl FolioConfig {
    /// Load, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, |name| std::env::var(name).ok())
    }

    /// Same as [`FolioConfig::load`] with an explicit environment lookup.
    pub fn load_with_env<F>(path: &Path, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FolioError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::parse(path, &content)?;
        config.apply_env_overrides(env);
        config.validate()?;
        Ok(config)
    }

    fn parse(path: &Path, content: &str) -> Result<Self> {
        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        if is_toml {
            toml::from_str(content).map_err(|e| {
                FolioError::Configuration(format!("invalid TOML in {}: {}", path.display(), e))
            })
        } else {
            serde_json::from_str(content).map_err(|e| {
                FolioError::Configuration(format!("invalid JSON in {}: {}", path.display(), e))
            })
        }
    }

    pub fn apply_env_overrides<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for key_name in ["GOOGLE_API_KEY", "FOLIO_API_KEY"] {
            if let Some(value) = env(key_name).filter(|v| !v.trim().is_empty()) {
                self.api_keys.insert(key_name, value);
            }
        }
        if let Some(input) = env("INPUT_FOLDER").filter(|v| !v.trim().is_empty()) {
            self.paths.input_folder = PathBuf::from(input);
        }
        if let Some(output) = env("OUTPUT_FOLDER").filter(|v| !v.trim().is_empty()) {
            self.paths.output_base_folder = PathBuf::from(output);
        }
        if let Some(flag) = env("DRY_RUN") {
            if matches!(flag.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes") {
                self.features.dry_run = true;
            }
        }
    }

    /// Apply command-line switches. Flags only ever narrow behaviour.
    pub fn apply_cli_overrides(&mut self, dry_run: bool, no_resume: bool, no_cache: bool) {
        if dry_run {
            self.features.dry_run = true;
        }
        if no_resume {
            self.features.resume_enabled = false;
        }
        if no_cache {
            self.features.cache_enabled = false;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(FolioError::Configuration(msg));

        if self.paths.input_folder.as_os_str().is_empty() {
            return invalid("PATHS.INPUT_FOLDER must not be empty".into());
        }
        if self.paths.output_base_folder.as_os_str().is_empty() {
            return invalid("PATHS.OUTPUT_BASE_FOLDER must not be empty".into());
        }
        if self.paths.cache_dir.as_os_str().is_empty() {
            return invalid("PATHS.CACHE_DIR must not be empty".into());
        }
        if self.paths.db_file.as_os_str().is_empty() {
            return invalid("PATHS.DB_FILE must not be empty".into());
        }
        if same_location(&self.paths.input_folder, &self.paths.output_base_folder) {
            return invalid(format!(
                "PATHS.OUTPUT_BASE_FOLDER must differ from PATHS.INPUT_FOLDER ({})",
                self.paths.input_folder.display()
            ));
        }
        if self.system.max_workers == 0 {
            return invalid("SYSTEM.MAX_WORKERS must be at least 1".into());
        }
        if self.system.save_interval == 0 {
            return invalid("SYSTEM.SAVE_INTERVAL must be at least 1".into());
        }
        if self.cache.ttl_days == 0 {
            return invalid("CACHE.TTL_DAYS must be at least 1".into());
        }
        if self.enrichment.timeout_secs == 0 {
            return invalid("ENRICHMENT.TIMEOUT_SECS must be at least 1".into());
        }
        if self.enrichment.requests_per_minute == 0 {
            return invalid("ENRICHMENT.REQUESTS_PER_MINUTE must be at least 1".into());
        }
        if self.ai_allowed && self.enrichment.endpoint.trim().is_empty() {
            return invalid("AI_ALLOWED is true but ENRICHMENT.ENDPOINT is not set".into());
        }

        let bonus = self.classification.corroboration_bonus;
        if !bonus.is_finite() || bonus < 0.0 {
            return invalid(format!(
                "CLASSIFICATION.CORROBORATION_BONUS must be >= 0, got {}",
                bonus
            ));
        }
        let cap = self.classification.confidence_cap;
        if !(0.0..=1.0).contains(&cap) {
            return invalid(format!(
                "CLASSIFICATION.CONFIDENCE_CAP must be within [0, 1], got {}",
                cap
            ));
        }

        if let Some(rules) = &self.rules {
            rules::validate_rules(rules).map_err(FolioError::Configuration)?;
        }
        Ok(())
    }

    // ========================================================================
    // Derived locations
    // ========================================================================

    pub fn checkpoint_path(&self) -> PathBuf {
        if self.paths.db_file.is_absolute() {
            self.paths.db_file.clone()
        } else {
            self.paths.cache_dir.join(&self.paths.db_file)
        }
    }

    pub fn cache_entries_dir(&self) -> PathBuf {
        self.paths.cache_dir.join("enrichment")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.paths.output_base_folder.join("reports")
    }

    /// Bearer credential for the enrichment endpoint, if configured.
    pub fn enrichment_api_key(&self) -> Option<&str> {
        self.api_keys
            .get(&self.enrichment.api_key_name)
            .or_else(|| self.api_keys.get("FOLIO_API_KEY"))
    }

    /// Rule set for this run: the configured rules or the built-in defaults.
    pub fn rule_set(&self) -> RuleSet {
        let rules = self.rules.clone().unwrap_or_else(rules::default_rules);
        RuleSet::new(
            rules,
            self.classification.conflict_policy,
            self.classification.corroboration_bonus,
            self.classification.confidence_cap,
        )
    }
}

/// Whether two configured folders name the same place. Existing folders are
/// compared after canonicalization, others component-wise.
fn same_location(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.components().eq(b.components()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Label, Predicate};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = FolioConfig::default();
        assert!(!config.ai_allowed);
        assert!(config.features.resume_enabled);
        assert!(config.features.cache_enabled);
        assert!(!config.features.dry_run);
        assert_eq!(config.system.max_workers, 10);
        assert_eq!(config.system.save_interval, 20);
        assert_eq!(config.cache.ttl_days, 30);
        assert_eq!(config.enrichment.cooldown_minutes, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_with_partial_sections() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "folio.toml",
            r#"
[PATHS]
INPUT_FOLDER = "books"
CACHE_DIR = "state"

[SYSTEM]
MAX_WORKERS = 3

[FEATURES]
DRY_RUN = true
"#,
        );

        let config = FolioConfig::load_with_env(&path, no_env).unwrap();
        assert_eq!(config.paths.input_folder, PathBuf::from("books"));
        assert_eq!(config.paths.output_base_folder, PathBuf::from("output"));
        assert_eq!(config.system.max_workers, 3);
        assert_eq!(config.system.save_interval, 20);
        assert!(config.features.dry_run);
        assert!(config.features.resume_enabled);
        assert_eq!(
            config.checkpoint_path(),
            PathBuf::from("state").join("checkpoint.jsonl")
        );
    }

    #[test]
    fn test_load_json() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "config.json",
            r#"{"PATHS": {"INPUT_FOLDER": "in"}, "AI_ALLOWED": true,
                "ENRICHMENT": {"ENDPOINT": "http://localhost:9/lookup"},
                "API_KEYS": {"GOOGLE_API_KEY": "abc"}}"#,
        );

        let config = FolioConfig::load_with_env(&path, no_env).unwrap();
        assert!(config.ai_allowed);
        assert_eq!(config.enrichment_api_key(), Some("abc"));
    }

    #[test]
    fn test_env_overrides() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "folio.toml", "");
        let env: HashMap<&str, &str> = [
            ("INPUT_FOLDER", "/data/in"),
            ("OUTPUT_FOLDER", "/data/out"),
            ("DRY_RUN", "TRUE"),
            ("GOOGLE_API_KEY", "secret-value"),
        ]
        .into_iter()
        .collect();

        let config =
            FolioConfig::load_with_env(&path, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.paths.input_folder, PathBuf::from("/data/in"));
        assert_eq!(config.paths.output_base_folder, PathBuf::from("/data/out"));
        assert!(config.features.dry_run);
        assert_eq!(config.enrichment_api_key(), Some("secret-value"));
    }

    #[test]
    fn test_api_keys_redacted_in_debug() {
        let mut config = FolioConfig::default();
        config.api_keys.insert("GOOGLE_API_KEY", "super-secret");
        let debug = format!("{:?}", config);
        assert!(debug.contains("GOOGLE_API_KEY"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = FolioConfig::default();
        config.system.max_workers = 0;
        assert!(matches!(
            config.validate(),
            Err(FolioError::Configuration(_))
        ));

        let mut config = FolioConfig::default();
        config.ai_allowed = true;
        assert!(config.validate().is_err());

        let mut config = FolioConfig::default();
        config.classification.confidence_cap = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_output_folder_must_differ_from_input() {
        let mut config = FolioConfig::default();
        config.paths.output_base_folder = config.paths.input_folder.clone();
        assert!(matches!(
            config.validate(),
            Err(FolioError::Configuration(_))
        ));

        let dir = TempDir::new().unwrap();
        let mut config = FolioConfig::default();
        config.paths.input_folder = dir.path().to_path_buf();
        config.paths.output_base_folder = dir.path().join(".");
        assert!(config.validate().is_err());

        config.paths.output_base_folder = dir.path().join("sorted");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_or_malformed_file_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            FolioConfig::load_with_env(&missing, no_env),
            Err(FolioError::Configuration(_))
        ));

        let broken = write(&dir, "broken.json", "{ not json");
        assert!(matches!(
            FolioConfig::load_with_env(&broken, no_env),
            Err(FolioError::Configuration(_))
        ));
    }

    #[test]
    fn test_rules_override_from_toml() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "folio.toml",
            r#"
[CLASSIFICATION]
CONFLICT_POLICY = "unclassified"

[[RULES]]
id = "human"
label = "human_translation"
base_confidence = 0.9
kind = "title_contains"
keywords = ["dịch"]
"#,
        );

        let config = FolioConfig::load_with_env(&path, no_env).unwrap();
        let rules = config.rules.as_ref().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].label, Label::HumanTranslation);
        assert_eq!(
            rules[0].predicate,
            Predicate::TitleContains {
                keywords: vec!["dịch".to_string()]
            }
        );
        assert_eq!(
            config.classification.conflict_policy,
            ConflictPolicy::Unclassified
        );
    }

    #[test]
    fn test_absolute_db_file_is_kept() {
        let mut config = FolioConfig::default();
        let abs = std::env::temp_dir().join("folio-checkpoint.jsonl");
        config.paths.db_file = abs.clone();
        assert_eq!(config.checkpoint_path(), abs);
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = FolioConfig::default();
        config.apply_cli_overrides(true, true, true);
        assert!(config.features.dry_run);
        assert!(!config.features.resume_enabled);
        assert!(!config.features.cache_enabled);
    }
}
