//! Command-line composition for remote execution.

use std::collections::BTreeMap;

use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Command is empty")]
    EmptyCommand,
    #[error("Invalid environment variable name: {0}")]
    InvalidEnvName(String),
    #[error("Failed to quote value: {0}")]
    QuoteError(#[from] shlex::QuoteError),
}

/// Builder for a command string with explicit environment assignments.
///
/// Assignments are emitted through `env` in key order so the remote shell
/// receives a deterministic command line.
#[derive(Debug, Clone)]
pub struct CommandLine {
    /// Base command, passed through verbatim.
    pub base: String,
    /// Environment assignments.
    pub env: BTreeMap<String, String>,
}

impl CommandLine {
    /// Create a new command line.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            env: BTreeMap::new(),
        }
    }

    /// Add one assignment, replacing an earlier value for the same key.
    #[must_use]
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add several assignments; later ones win.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Build the final command string.
    ///
    /// # Errors
    /// Returns error if the command is blank, a variable name is not a valid
    /// shell identifier, or a value cannot be quoted.
    pub fn build(&self) -> Result<String, CommandBuildError> {
        let base = self.base.trim();
        if base.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        if self.env.is_empty() {
            return Ok(base.to_string());
        }

        let mut parts = vec!["env".to_string()];
        for (key, value) in &self.env {
            if !is_env_name(key) {
                return Err(CommandBuildError::InvalidEnvName(key.clone()));
            }
            parts.push(format!("{key}={}", shlex::try_quote(value)?));
        }
        parts.push(base.to_string());
        Ok(parts.join(" "))
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
