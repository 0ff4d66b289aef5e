//! Execution configuration.
//!
//! A single immutable [`ExecutionConfig`] is built once per build from the
//! host configuration. Notebooks may override a whitelisted subset of fields
//! through their own metadata, producing a new per-document value.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::glob::compile_glob;
use crate::logger::{LogContext, NbLogger};
use crate::notebook::NotebookDocument;
use crate::paths::default_cache_path;

/// How notebooks are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Never execute; use outputs as stored.
    Off,
    /// Execute only notebooks with missing outputs.
    #[default]
    Auto,
    /// Always execute.
    Force,
    /// Execute on cache miss, reuse committed outputs otherwise.
    Cache,
    /// Execute cell by cell while rendering.
    Inline,
}

impl ExecutionMode {
    pub const ALL: [ExecutionMode; 5] = [
        ExecutionMode::Off,
        ExecutionMode::Auto,
        ExecutionMode::Force,
        ExecutionMode::Cache,
        ExecutionMode::Inline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Off => "off",
            ExecutionMode::Auto => "auto",
            ExecutionMode::Force => "force",
            ExecutionMode::Cache => "cache",
            ExecutionMode::Inline => "inline",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "unknown execution mode {s:?} (expected one of off, auto, force, cache, inline)"
                ))
            })
    }
}

/// Default pattern of permitted `eval_variable` names.
pub const DEFAULT_EVAL_NAME_REGEX: &str = r"^[a-zA-Z_][a-zA-Z0-9_]*$";

/// Default per-cell timeout in seconds.
pub const DEFAULT_TIMEOUT: u64 = 30;

/// Keys a notebook may override through `metadata[metadata_key]`.
pub const NOTEBOOK_OVERRIDABLE: &[&str] = &[
    "execution_mode",
    "execution_timeout",
    "execution_allow_errors",
    "execution_in_temp",
    "execution_raise_on_error",
    "execution_show_tb",
    "execution_cache_path",
    "merge_streams",
    "eval_name_regex",
];

/// `-1` or `null` in configuration files means no timeout.
mod timeout_seconds {
    use super::*;

    pub fn serialize<S: Serializer>(timeout: &Option<u64>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match timeout {
            Some(seconds) => serializer.serialize_u64(*seconds),
            None => serializer.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<u64>, D::Error> {
        let value = Option::<i64>::deserialize(deserializer)?;
        parse(value).map_err(serde::de::Error::custom)
    }

    pub fn parse(value: Option<i64>) -> std::result::Result<Option<u64>, String> {
        match value {
            None | Some(-1) => Ok(None),
            Some(seconds) => u64::try_from(seconds)
                .map(Some)
                .map_err(|_| format!("expected a positive number of seconds or -1, got {seconds}")),
        }
    }
}

/// Parse a timeout given as seconds, with `-1` meaning none.
pub fn parse_timeout(seconds: i64) -> Result<Option<u64>> {
    timeout_seconds::parse(Some(seconds))
        .map_err(|e| Error::Configuration(format!("execution_timeout: {e}")))
}

/// `pattern` anchored at both ends.
fn full_match_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

/// `pattern` anchored at the start of the text.
fn prefix_match_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})"))
}

/// Execution settings for a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Execution mode.
    #[serde(rename = "execution_mode")]
    pub mode: ExecutionMode,

    /// Per-cell timeout in seconds; `None` waits indefinitely.
    #[serde(rename = "execution_timeout", with = "timeout_seconds")]
    pub timeout: Option<u64>,

    /// Keep executing after a cell error.
    #[serde(rename = "execution_allow_errors")]
    pub allow_errors: bool,

    /// Run in a temporary working directory instead of the source's directory.
    #[serde(rename = "execution_in_temp")]
    pub in_temp: bool,

    /// Cache directory; `<base>/.folio_cache` when unset.
    #[serde(rename = "execution_cache_path")]
    pub cache_path: Option<PathBuf>,

    /// POSIX glob patterns of notebooks that are never executed.
    #[serde(rename = "execution_excludepatterns")]
    pub exclude_patterns: Vec<String>,

    /// Turn a failed execution into an error for the document.
    #[serde(rename = "execution_raise_on_error")]
    pub raise_on_error: bool,

    /// Echo failure tracebacks into the build log.
    #[serde(rename = "execution_show_tb")]
    pub show_tb: bool,

    /// Coalesce stream outputs before rendering.
    pub merge_streams: bool,

    /// Notebook metadata key holding per-notebook overrides.
    pub metadata_key: String,

    /// Kernel name regex -> replacement kernel name. A pattern must match the
    /// whole name.
    pub kernel_aliases: BTreeMap<String, String>,

    /// Regex a name passed to `eval_variable` must match from its start.
    pub eval_name_regex: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Auto,
            timeout: Some(DEFAULT_TIMEOUT),
            allow_errors: false,
            in_temp: false,
            cache_path: None,
            exclude_patterns: Vec::new(),
            raise_on_error: false,
            show_tb: false,
            merge_streams: false,
            metadata_key: "folio".to_string(),
            kernel_aliases: BTreeMap::new(),
            eval_name_regex: DEFAULT_EVAL_NAME_REGEX.to_string(),
        }
    }
}

impl ExecutionConfig {
    /// Configuration with a mode and defaults otherwise.
    pub fn with_mode(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.timeout == Some(0) {
            return Err(Error::Configuration(
                "execution_timeout must be greater than 0, or -1 for no timeout".to_string(),
            ));
        }
        if self.exclude_patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(Error::Configuration(
                "execution_excludepatterns must not contain empty patterns".to_string(),
            ));
        }
        for pattern in &self.exclude_patterns {
            compile_glob(pattern).map_err(|e| {
                Error::Configuration(format!("execution_excludepatterns: {e}"))
            })?;
        }
        for pattern in self.kernel_aliases.keys() {
            full_match_regex(pattern).map_err(|e| {
                Error::Configuration(format!("kernel_aliases: invalid pattern {pattern:?}: {e}"))
            })?;
        }
        prefix_match_regex(&self.eval_name_regex).map_err(|e| {
            Error::Configuration(format!("eval_name_regex: {e}"))
        })?;
        if self.metadata_key.is_empty() {
            return Err(Error::Configuration("metadata_key must not be empty".to_string()));
        }
        if let Some(path) = &self.cache_path
            && path.as_os_str().is_empty()
        {
            return Err(Error::Configuration(
                "execution_cache_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Cache directory, defaulting to `<base>/.folio_cache`.
    pub fn resolve_cache_path(&self, base: &Path) -> PathBuf {
        match &self.cache_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => base.join(path),
            None => default_cache_path(base),
        }
    }

    /// Per-cell timeout as a duration.
    pub fn timeout_duration(&self) -> Option<std::time::Duration> {
        self.timeout.map(std::time::Duration::from_secs)
    }

    /// Kernel name after applying `kernel_aliases`.
    ///
    /// The first pattern, in key order, matching the whole name wins. Invalid
    /// patterns never match; `validate` reports them.
    pub fn resolve_kernel_name(&self, name: &str) -> String {
        self.kernel_aliases
            .iter()
            .find(|(pattern, _)| full_match_regex(pattern).is_ok_and(|re| re.is_match(name)))
            .map(|(_, replacement)| replacement.clone())
            .unwrap_or_else(|| name.to_string())
    }

    /// Whether `name` is permitted for `eval_variable`.
    pub fn is_valid_eval_name(&self, name: &str) -> Result<bool> {
        let regex = prefix_match_regex(&self.eval_name_regex)
            .map_err(|e| Error::Configuration(format!("eval_name_regex: {e}")))?;
        Ok(regex.is_match(name))
    }

    /// Apply the notebook's whitelisted overrides.
    ///
    /// Unknown keys and invalid values are reported as `config` warnings and
    /// leave the corresponding field unchanged.
    pub fn with_notebook_overrides(&self, notebook: &NotebookDocument, logger: &dyn NbLogger) -> Self {
        let mut config = self.clone();
        let Some(overrides) = notebook.metadata.get(&self.metadata_key) else {
            return config;
        };
        let ctx = LogContext::subtype("config");
        let Some(overrides) = overrides.as_object() else {
            logger.warning(
                &format!("notebook metadata {:?} is not a mapping", self.metadata_key),
                &ctx,
            );
            return config;
        };

        for (key, value) in overrides {
            if !NOTEBOOK_OVERRIDABLE.contains(&key.as_str()) {
                logger.warning(&format!("'{key}' cannot be overridden by notebook metadata"), &ctx);
                continue;
            }
            if let Err(message) = config.apply_override(key, value) {
                logger.warning(&format!("invalid notebook metadata '{key}': {message}"), &ctx);
            }
        }
        config
    }

    fn apply_override(&mut self, key: &str, value: &Value) -> std::result::Result<(), String> {
        let as_bool = || value.as_bool().ok_or_else(|| format!("expected a boolean, got {value}"));
        match key {
            "execution_mode" => {
                let mode = value
                    .as_str()
                    .ok_or_else(|| format!("expected a string, got {value}"))?;
                self.mode = mode.parse().map_err(|e: Error| e.to_string())?;
            }
            "execution_timeout" => {
                let timeout = value
                    .as_i64()
                    .filter(|t| *t > 0 || *t == -1)
                    .ok_or_else(|| format!("expected a positive integer or -1, got {value}"))?;
                self.timeout = timeout_seconds::parse(Some(timeout))?;
            }
            "execution_allow_errors" => self.allow_errors = as_bool()?,
            "execution_in_temp" => self.in_temp = as_bool()?,
            "execution_raise_on_error" => self.raise_on_error = as_bool()?,
            "execution_show_tb" => self.show_tb = as_bool()?,
            "merge_streams" => self.merge_streams = as_bool()?,
            "execution_cache_path" => {
                let path = value
                    .as_str()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| format!("expected a non-empty string, got {value}"))?;
                self.cache_path = Some(PathBuf::from(path));
            }
            "eval_name_regex" => {
                let pattern = value
                    .as_str()
                    .ok_or_else(|| format!("expected a string, got {value}"))?;
                prefix_match_regex(pattern).map_err(|e| e.to_string())?;
                self.eval_name_regex = pattern.to_string();
            }
            _ => return Err("not overridable".to_string()),
        }
        Ok(())
    }
}
