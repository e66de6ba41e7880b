//! Shell client configuration.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use vmshell_core::{ShellSize, output::DEFAULT_CAPACITY};

use crate::error::ShellError;

/// Default working directory inside the VM.
pub const DEFAULT_WORKING_DIR: &str = "/project/workspace";

/// Configuration shared by every shell a manager creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Working directory for new shells.
    pub working_dir: String,
    /// Terminal dimensions.
    pub size: ShellSize,
    /// Environment applied to every `run`, under per-run values.
    pub env: BTreeMap<String, String>,
    /// Output chunks retained per shell.
    pub output_capacity: usize,
    /// Deadline for `on_will_shutdown` listeners, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            working_dir: DEFAULT_WORKING_DIR.to_string(),
            size: ShellSize::default(),
            env: BTreeMap::new(),
            output_capacity: DEFAULT_CAPACITY,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ShellConfig {
    /// Create a new config builder.
    #[must_use]
    pub fn builder() -> ShellConfigBuilder {
        ShellConfigBuilder::default()
    }

    /// Defaults overlaid with `VMSHELL_*` environment variables.
    ///
    /// Recognised: `VMSHELL_WORKDIR`, `VMSHELL_COLS`, `VMSHELL_ROWS`,
    /// `VMSHELL_OUTPUT_CAPACITY`. Unparseable numbers are ignored with a warning.
    ///
    /// # Errors
    /// Returns error if the resulting configuration is invalid.
    pub fn from_env() -> Result<Self, ShellError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ShellError> {
        let mut config = Self::default();
        if let Some(dir) = lookup("VMSHELL_WORKDIR") {
            config.working_dir = dir;
        }
        if let Some(cols) = parse_var(&lookup, "VMSHELL_COLS") {
            config.size.cols = cols;
        }
        if let Some(rows) = parse_var(&lookup, "VMSHELL_ROWS") {
            config.size.rows = rows;
        }
        if let Some(capacity) = parse_var(&lookup, "VMSHELL_OUTPUT_CAPACITY") {
            config.output_capacity = capacity;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns error if a size or capacity is zero or the working directory is blank.
    pub fn validate(&self) -> Result<(), ShellError> {
        if self.working_dir.trim().is_empty() {
            return Err(ShellError::Config("working_dir is required".into()));
        }
        if self.size.cols == 0 || self.size.rows == 0 {
            return Err(ShellError::Config("size must be non-zero".into()));
        }
        if self.output_capacity == 0 {
            return Err(ShellError::Config("output_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Deadline for shutdown listeners.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable config variable");
            None
        }
    }
}

/// Builder for [`ShellConfig`].
#[derive(Debug, Default)]
pub struct ShellConfigBuilder {
    config: ShellConfig,
}

impl ShellConfigBuilder {
    /// Set the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.working_dir = dir.into();
        self
    }

    /// Set the terminal dimensions.
    #[must_use]
    pub const fn size(mut self, cols: u16, rows: u16) -> Self {
        self.config.size = ShellSize { cols, rows };
        self
    }

    /// Add a default environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Set the per-shell output capacity.
    #[must_use]
    pub const fn output_capacity(mut self, capacity: usize) -> Self {
        self.config.output_capacity = capacity;
        self
    }

    /// Set the shutdown broadcast deadline.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Build the configuration, validating all fields.
    ///
    /// # Errors
    /// Returns error if validation fails.
    pub fn build(self) -> Result<ShellConfig, ShellError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShellConfig::default();
        assert_eq!(config.working_dir, DEFAULT_WORKING_DIR);
        assert_eq!(config.output_capacity, 1000);
        assert_eq!(config.size, ShellSize { cols: 200, rows: 80 });
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_validates() {
        assert!(ShellConfig::builder().size(0, 24).build().is_err());
        assert!(ShellConfig::builder().output_capacity(0).build().is_err());
        assert!(ShellConfig::builder().working_dir(" ").build().is_err());

        let config = ShellConfig::builder()
            .working_dir("/srv")
            .env("NODE_ENV", "test")
            .shutdown_timeout(Duration::from_millis(250))
            .build()
            .unwrap();
        assert_eq!(config.working_dir, "/srv");
        assert_eq!(config.env.get("NODE_ENV").map(String::as_str), Some("test"));
        assert_eq!(config.shutdown_timeout_ms, 250);
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("VMSHELL_WORKDIR", "/home/user"),
            ("VMSHELL_COLS", "120"),
            ("VMSHELL_ROWS", "not-a-number"),
            ("VMSHELL_OUTPUT_CAPACITY", "50"),
        ]
        .into_iter()
        .collect();

        let config =
            ShellConfig::from_lookup(|key| vars.get(key).map(ToString::to_string)).unwrap();

        assert_eq!(config.working_dir, "/home/user");
        assert_eq!(config.size, ShellSize { cols: 120, rows: 80 });
        assert_eq!(config.output_capacity, 50);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ShellConfig =
            serde_json::from_str(r#"{"working_dir":"/tmp","output_capacity":10}"#).unwrap();
        assert_eq!(config.working_dir, "/tmp");
        assert_eq!(config.output_capacity, 10);
        assert_eq!(config.size, ShellSize::default());
    }
}
