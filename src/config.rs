//! Configuration for tcmsync
//!
//! Configuration lives in a TOML file. Its location is, in order: the
//! `--config` flag, the `TCMSYNC_CONFIG` environment variable, or
//! `<config dir>/tcmsync/config.toml`. When a product configuration is given
//! and a global one exists, values missing from the product configuration
//! are taken from the global one.

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::entity::TcmsClass;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::ExistingResultPolicy;
use crate::users::UserPolicy;

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "TCMSYNC_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Product under test
    #[serde(default)]
    pub product: ProductConfig,

    /// Local test execution
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Extra environment variables for scripts; values may contain `$env[NAME]`
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// TCMS access and result mapping
    #[serde(default)]
    pub tcms: TcmsConfig,

    /// Import defaults
    #[serde(default)]
    pub import: ImportConfig,

    #[serde(default)]
    pub master_data: MasterDataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ProductConfig {
    #[serde(default)]
    pub name: String,

    /// Root of the product sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,

    /// Root of the test scripts (defaults to source-path)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RunnerConfig {
    /// Directory for logs, results and downloaded attachments
    #[serde(default = "default_working_path")]
    pub working_path: PathBuf,

    /// Base name of per-case output logs
    #[serde(default = "default_output_log")]
    pub output_log: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_assistant: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_assistant: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_assistant: Option<String>,

    /// Additional directory searched for relative script paths
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_script_path: Option<PathBuf>,

    /// Interpreter scripts are run with, e.g. "bash"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_driver: Option<String>,

    /// Plan properties exported to scripts as environment variables
    #[serde(default)]
    pub plan_properties: Vec<String>,

    /// Case properties exported to scripts as environment variables
    #[serde(default)]
    pub case_properties: Vec<String>,
}

fn default_working_path() -> PathBuf {
    std::env::temp_dir().join("tcmsync")
}

fn default_output_log() -> String {
    "console.log".to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            working_path: default_working_path(),
            output_log: default_output_log(),
            entity_assistant: None,
            plan_assistant: None,
            case_assistant: None,
            custom_script_path: None,
            test_driver: None,
            plan_properties: Vec::new(),
            case_properties: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TcmsConfig {
    /// Snapshot file of the local object store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,

    /// Result state name -> TCMS execution status name
    #[serde(default)]
    pub execution_states: BTreeMap<String, String>,

    /// Result state name -> weight (higher is more favorable)
    #[serde(default)]
    pub status_weights: BTreeMap<String, i32>,

    /// Patterns of runner output files uploaded with results
    #[serde(default)]
    pub result_attachments: Vec<String>,

    /// Patterns of plan/case attachments downloaded before a run
    #[serde(default)]
    pub spec_attachments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ImportConfig {
    #[serde(default)]
    pub auto_create: bool,

    #[serde(default)]
    pub user_references: UserPolicy,

    #[serde(default)]
    pub existing_results: ExistingResultPolicy,

    /// Abort on the first attachment failure
    #[serde(default)]
    pub strict_attachments: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct MasterDataConfig {
    /// Class name (e.g. "priority", "plan-type") -> may be created
    #[serde(default)]
    pub auto_creatable: BTreeMap<String, bool>,
}

impl MasterDataConfig {
    pub fn overrides(&self) -> SyncResult<BTreeMap<TcmsClass, bool>> {
        self.auto_creatable
            .iter()
            .map(|(name, flag)| {
                serde_json::from_value::<TcmsClass>(serde_json::Value::String(name.clone()))
                    .map(|class| (class, *flag))
                    .map_err(|_| {
                        SyncError::Configuration(format!("unknown master data class '{}'", name))
                    })
            })
            .collect()
    }
}

/// Global configuration file location.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tcmsync").join("config.toml"))
}

/// Recursively overlay `overlay` onto `base`; overlay values win.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(b)), toml::Value::Table(o)) => merge_tables(b, o),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn read_table(path: &Path) -> anyhow::Result<toml::Table> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse config {}", path.display()))
}

impl Config {
    /// Load a single configuration file. Returns defaults if it doesn't exist.
    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let table = read_table(path)?;
        toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load the product configuration merged over the global one.
    pub fn load_merged(product: Option<&Path>, global: Option<&Path>) -> anyhow::Result<Self> {
        let mut table = match global {
            Some(g) if g.exists() => read_table(g)?,
            _ => toml::Table::new(),
        };
        if let Some(p) = product
            && p.exists()
            && Some(p) != global
        {
            merge_tables(&mut table, read_table(p)?);
        }
        toml::Value::Table(table)
            .try_into()
            .context("Invalid merged configuration")
    }

    /// Resolve the config location (flag, env var, global) and load it.
    pub fn load(flag: Option<&Path>) -> anyhow::Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let product = flag.map(Path::to_path_buf).or(from_env);
        let global = global_config_path();
        Self::load_merged(product.as_deref(), global.as_deref())
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    /// `[env]` entries with `$env[NAME]` replaced by the process environment.
    pub fn resolved_env(&self) -> Vec<(String, String)> {
        let Ok(pattern) = Regex::new(r"\$env\[([A-Za-z_][A-Za-z0-9_]*)\]") else {
            return Vec::new();
        };
        self.env
            .iter()
            .map(|(name, value)| {
                let value = pattern.replace_all(value, |caps: &regex::Captures| {
                    std::env::var(&caps[1]).unwrap_or_default()
                });
                (name.clone(), value.into_owned())
            })
            .collect()
    }

    /// Compile attachment patterns, reporting the first invalid one.
    pub fn compile_patterns(patterns: &[String]) -> SyncResult<Vec<Regex>> {
        patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    SyncError::Configuration(format!("invalid attachment pattern '{}': {}", p, e))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.runner.output_log, "console.log");
        assert_eq!(config.import.user_references, UserPolicy::Missing);
        assert_eq!(config.import.existing_results, ExistingResultPolicy::Update);
        assert!(!config.import.auto_create);
    }

    #[test]
    fn test_load_missing_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_file(&temp_dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_full_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[product]
name = "demo"
source-path = "/src/demo"

[runner]
output-log = "out.log"
plan-assistant = "function:prepare"
case-properties = ["component"]

[env]
LANG = "C"

[tcms]
execution-states = { PASSED = "PASS" }
status-weights = { PASSED = 25 }

[import]
auto-create = true
user-references = "never"
existing-results = "skip"

[master-data]
auto-creatable = { priority = false, plan-type = false }
"#,
        )
        .unwrap();
        let config = Config::load_file(&path).unwrap();
        assert_eq!(config.product.name, "demo");
        assert_eq!(config.runner.output_log, "out.log");
        assert_eq!(config.runner.working_path, default_working_path());
        assert_eq!(
            config.tcms.execution_states.get("PASSED").map(String::as_str),
            Some("PASS")
        );
        assert_eq!(config.import.user_references, UserPolicy::Never);
        assert_eq!(config.import.existing_results, ExistingResultPolicy::Skip);
        let overrides = config.master_data.overrides().unwrap();
        assert_eq!(overrides.get(&TcmsClass::Priority), Some(&false));
        assert_eq!(overrides.get(&TcmsClass::PlanType), Some(&false));
    }

    #[test]
    fn test_unknown_master_data_class() {
        let mut config = Config::default();
        config
            .master_data
            .auto_creatable
            .insert("gizmo".to_string(), true);
        assert!(matches!(
            config.master_data.overrides(),
            Err(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn test_product_config_merged_over_global() {
        let temp_dir = TempDir::new().unwrap();
        let global = temp_dir.path().join("global.toml");
        let product = temp_dir.path().join("product.toml");
        fs::write(
            &global,
            "[runner]\noutput-log = \"global.log\"\ntest-driver = \"bash\"\n[import]\nauto-create = true\n",
        )
        .unwrap();
        fs::write(&product, "[runner]\noutput-log = \"product.log\"\n").unwrap();

        let config = Config::load_merged(Some(&product), Some(&global)).unwrap();
        assert_eq!(config.runner.output_log, "product.log");
        assert_eq!(config.runner.test_driver.as_deref(), Some("bash"));
        assert!(config.import.auto_create);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sub").join("config.toml");
        let mut config = Config::default();
        config.product.name = "demo".to_string();
        config.import.strict_attachments = true;
        config.save(&path).unwrap();
        assert_eq!(Config::load_file(&path).unwrap(), config);
    }

    #[test]
    #[serial]
    fn test_env_substitution() {
        unsafe { std::env::set_var("TCMSYNC_TEST_LANG", "de_DE") };
        let mut config = Config::default();
        config
            .env
            .insert("LANG".to_string(), "$env[TCMSYNC_TEST_LANG].UTF-8".to_string());
        config
            .env
            .insert("EMPTY".to_string(), "$env[TCMSYNC_TEST_UNSET_VAR]".to_string());
        let env = config.resolved_env();
        assert!(env.contains(&("LANG".to_string(), "de_DE.UTF-8".to_string())));
        assert!(env.contains(&("EMPTY".to_string(), String::new())));
        unsafe { std::env::remove_var("TCMSYNC_TEST_LANG") };
    }

    #[test]
    #[serial]
    fn test_config_env_var_is_used() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("env.toml");
        fs::write(&path, "[product]\nname = \"from-env\"\n").unwrap();
        unsafe { std::env::set_var(CONFIG_ENV, &path) };
        let config = Config::load(None).unwrap();
        unsafe { std::env::remove_var(CONFIG_ENV) };
        assert_eq!(config.product.name, "from-env");
    }

    #[test]
    fn test_invalid_pattern() {
        let err = Config::compile_patterns(&["(".to_string()]).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }
}
