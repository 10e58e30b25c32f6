//! Profile configuration for Multicon.
//!
//! Loads named connection profiles from a YAML document and merges
//! environment-variable overrides on top, producing a flat set of
//! [`ConnectionParams`].
//!
//! The document's top-level keys are profile names plus an optional
//! `default` key naming the profile used when none is requested:
//!
//! ```yaml
//! default: warehouse
//! warehouse:
//!   type: redshift
//!   host: example.abc123.eu-west-1.redshift.amazonaws.com
//!   user: analyst
//!   pass: hunter2
//!   dbname: analytics
//! ```

use crate::error::{ConnectorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory under the home directory holding the profile document.
pub const CONFIG_DIR: &str = ".multicon";

/// File name of the profile document.
pub const CONFIG_FILE: &str = "config.yml";

/// Prefix for environment-variable overrides (`MULTICON_HOST`, ...).
pub const ENV_PREFIX: &str = "MULTICON_";

/// Top-level key naming the default profile.
pub const DEFAULT_KEY: &str = "default";

/// Parameter keys that may be supplied through the environment even when
/// the profile does not mention them.
pub const KNOWN_KEYS: &[&str] = &[
    "type",
    "host",
    "port",
    "user",
    "pass",
    "dbname",
    "project",
    "token",
    "http_path",
    "catalog",
    "use_bastion",
    "bastion_server",
    "bastion_user",
    "bastion_host",
    "bastion_key",
    "bastion_key_passphrase",
    "iam_profile",
    "cluster_id",
    "db_user",
    "db_groups",
    "auto_create",
];

/// A single scalar (or list) profile value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl ParamValue {
    /// Renders the value as text. Lists are joined with commas.
    pub fn as_text(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.clone(),
            Self::List(items) => items.join(","),
        }
    }

    /// Interprets the value as a flag.
    ///
    /// Text is true only for `1`, `true`, `yes` or `on` (case-insensitive).
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Text(s) => parse_flag(s),
            Self::List(items) => !items.is_empty(),
        }
    }
}

fn parse_flag(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// A named bundle of connection parameters, as written in the document.
pub type Profile = BTreeMap<String, ParamValue>;

/// The parsed profile document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDocument {
    /// Name of the profile used when none is requested.
    pub default: Option<String>,

    /// Profiles keyed by name.
    pub profiles: BTreeMap<String, Profile>,
}

impl ConfigDocument {
    /// Returns the default document path (`~/.multicon/config.yml`).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR)
            .join(CONFIG_FILE)
    }

    /// Loads the document at `path`. Returns `None` when the file does not exist.
    pub fn load_from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConnectorError::config(format!("Failed to read {}: {e}", path.display()))
        })?;

        Self::parse_yaml(&content, path).map(Some)
    }

    /// Parses a document from YAML text. `path` is only used in error messages.
    pub fn parse_yaml(content: &str, path: &Path) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let raw: BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str(content).map_err(|e| {
                ConnectorError::config(format!("Invalid YAML in {}:\n  {e}", path.display()))
            })?;

        let mut document = Self::default();

        for (key, value) in raw {
            if key == DEFAULT_KEY {
                match value {
                    serde_yaml::Value::String(name) => document.default = Some(name),
                    serde_yaml::Value::Null => {}
                    _ => {
                        return Err(ConnectorError::config(format!(
                            "'{DEFAULT_KEY}' in {} must name a profile",
                            path.display()
                        )))
                    }
                }
                continue;
            }

            // Null entries are treated like missing keys
            let entries: BTreeMap<String, Option<ParamValue>> = serde_yaml::from_value(value)
                .map_err(|e| {
                    ConnectorError::config(format!(
                        "Profile '{key}' in {} must be a flat mapping: {e}",
                        path.display()
                    ))
                })?;

            let profile = entries
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect();

            document.profiles.insert(key, profile);
        }

        Ok(document)
    }

    /// Looks up a profile by name, falling back to the `default` entry.
    ///
    /// Returns the effective name together with the profile.
    pub fn profile(&self, name: Option<&str>) -> Result<(&str, &Profile)> {
        let name = match name {
            Some(name) => name,
            None => self
                .default
                .as_deref()
                .ok_or_else(|| ConnectorError::profile_not_found(DEFAULT_KEY))?,
        };

        self.profiles
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConnectorError::profile_not_found(name))
    }
}

/// The effective parameter set after environment overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionParams {
    profile: Option<String>,
    values: BTreeMap<String, ParamValue>,
}

impl ConnectionParams {
    /// Creates a parameter set from explicit values.
    pub fn new(profile: Option<String>, values: BTreeMap<String, ParamValue>) -> Self {
        Self { profile, values }
    }

    /// Creates an empty, all-false parameter set.
    pub fn empty(profile: Option<String>) -> Self {
        Self {
            profile,
            values: BTreeMap::new(),
        }
    }

    /// Returns the name of the profile these parameters came from.
    pub fn profile_name(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    /// Returns true if no parameters are set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the raw value for a key.
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    /// Returns the value for a key as text; missing or blank values are `None`.
    pub fn text(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .map(ParamValue::as_text)
            .filter(|s| !s.trim().is_empty())
    }

    /// Returns the value for a key as a flag; missing values are false.
    pub fn flag(&self, key: &str) -> bool {
        self.values.get(key).is_some_and(ParamValue::is_truthy)
    }

    /// Returns the value for a key as a port number.
    pub fn port(&self, key: &str) -> Result<Option<u16>> {
        let Some(raw) = self.text(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|_| ConnectorError::config(format!("Invalid port for '{key}': {raw}")))
    }

    /// Returns the value for a key as a list, splitting text on commas.
    pub fn list(&self, key: &str) -> Vec<String> {
        match self.values.get(key) {
            Some(ParamValue::List(items)) => items.clone(),
            Some(other) => other
                .as_text()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Sets a parameter, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: ParamValue) {
        self.values.insert(key.into(), value);
    }

    /// Returns the environment variable name overriding `key`.
    pub fn env_var_name(key: &str) -> String {
        format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())
    }

    /// Applies environment overrides read from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_with(|var| std::env::var(var).ok());
    }

    /// Applies overrides using `lookup` to read variables. Overrides win.
    pub fn apply_env_overrides_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut keys: Vec<String> = KNOWN_KEYS.iter().map(|k| k.to_string()).collect();
        keys.extend(self.values.keys().cloned());
        keys.sort();
        keys.dedup();

        for key in keys {
            let var = Self::env_var_name(&key);
            if let Some(value) = lookup(&var) {
                debug!("Parameter '{}' overridden by {}", key, var);
                self.values.insert(key, ParamValue::Text(value));
            }
        }
    }
}

/// Resolves a profile from the document at `path` (or the default path),
/// applying overrides from the process environment.
pub fn resolve(name: Option<&str>, path: Option<&Path>) -> Result<ConnectionParams> {
    resolve_with_env(name, path, |var| std::env::var(var).ok())
}

/// Resolves a profile, reading environment overrides through `lookup`.
///
/// A missing document yields an empty parameter set. A missing profile in
/// an existing document is a [`ConnectorError::ProfileNotFound`].
pub fn resolve_with_env<F>(
    name: Option<&str>,
    path: Option<&Path>,
    lookup: F,
) -> Result<ConnectionParams>
where
    F: Fn(&str) -> Option<String>,
{
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(ConfigDocument::default_path);

    let Some(document) = ConfigDocument::load_from_file(&path)? else {
        debug!("No profile document at {}", path.display());
        return Ok(ConnectionParams::empty(name.map(String::from)));
    };

    let (profile_name, profile) = document.profile(name)?;
    debug!("Resolved profile '{}' from {}", profile_name, path.display());

    let mut params = ConnectionParams::new(Some(profile_name.to_string()), profile.clone());
    params.apply_env_overrides_with(lookup);
    Ok(params)
}
