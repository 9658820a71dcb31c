//! Server configuration.
//!
//! The config file is YAML enumerating the merge groups to coordinate, plus
//! optional basic-auth credentials for the lease routes. `${VAR}`
//! placeholders anywhere in the file are replaced from the process
//! environment before parsing, so secrets can stay out of the file:
//!
//! ```yaml
//! repositories:
//!   - owner: acme
//!     name: widgets
//!     base_ref: main
//!     stabilize_duration_seconds: 30
//!     ttl_seconds: 200
//!     expected_request_count: 4
//!     delay_lease_assignment_by: 0
//! auth:
//!   basic:
//!     users:
//!       ci: "${CI_PASSWORD}"
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

/// How one repository's merge queue should be handled.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GithubRepositoryConfig {
    pub owner: String,
    pub name: String,
    pub base_ref: String,
    pub stabilize_duration_seconds: u64,
    pub ttl_seconds: u64,
    pub expected_request_count: usize,
    /// Number of acquire evaluations the elected candidate must survive
    /// before the lease actually transfers. Zero disables the feature.
    #[serde(default)]
    pub delay_lease_assignment_by: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BasicAuthConfig {
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub basic: Option<BasicAuthConfig>,
}

/// The server configuration file.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub repositories: Vec<GithubRepositoryConfig>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex is valid")
});

/// Replaces every `${VAR}` with the value of the environment variable `VAR`.
/// Unset variables substitute to the empty string.
fn substitute_env(raw: &str) -> String {
    PLACEHOLDER_REGEX
        .replace_all(raw, |captures: &regex::Captures<'_>| {
            env::var(&captures[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Opens the configuration file, performs environment substitution and
/// parses it.
pub fn load_server_config(path: &Path) -> Result<ServerConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {:?}", path))?;
    let templated = substitute_env(&raw);
    serde_yaml::from_str(&templated)
        .with_context(|| format!("failed to parse config file {:?}", path))
}
