//! Configuration for the update subsystem.

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// When a remote check runs at launch.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckOnLaunch {
    /// Check on every launch.
    #[default]
    Always,
    /// Never check at launch; the host triggers checks itself.
    Never,
    /// Check only when the previous launch recorded a fatal error.
    ErrorRecoveryOnly,
}

/// Update subsystem configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdatesConfig {
    /// Master switch. A disabled configuration cannot start a loader task.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Manifest endpoint.
    #[serde(default)]
    pub update_url: Option<Url>,
    /// Scope for persisted updates. Defaults to the origin of `update_url`.
    #[serde(default)]
    pub scope_key: Option<String>,
    /// Runtime version this binary can execute.
    #[serde(default)]
    pub runtime_version: Option<String>,
    /// Legacy SDK version, used when no runtime version is set.
    #[serde(default)]
    pub sdk_version: Option<String>,
    #[serde(default = "default_release_channel")]
    pub release_channel: String,
    /// How long the launch waits for a remote update before falling back.
    #[serde(default)]
    pub launch_wait_ms: u64,
    #[serde(default)]
    pub check_on_launch: CheckOnLaunch,
    /// Reject manifests that do not arrive in a signed envelope.
    #[serde(default)]
    pub expects_signed_manifest: bool,
    /// Where the manifest signing key is published.
    #[serde(default)]
    pub public_key_url: Option<Url>,
    /// Extra headers sent with every manifest request.
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    /// Directory holding downloaded asset files.
    #[serde(default = "default_updates_directory")]
    pub updates_directory: PathBuf,
    /// SQLite database path. Defaults to `updates.db` inside `updates_directory`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Older updates kept by the reaper besides the launched one.
    #[serde(default = "default_retain_older")]
    pub retain_older: usize,
    /// Whether the binary ships an embedded update package.
    #[serde(default = "default_true")]
    pub has_embedded_update: bool,
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_release_channel() -> String {
    "default".to_string()
}

fn default_updates_directory() -> PathBuf {
    PathBuf::from("./data/updates")
}

fn default_retain_older() -> usize {
    1
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            update_url: None,
            scope_key: None,
            runtime_version: None,
            sdk_version: None,
            release_channel: default_release_channel(),
            launch_wait_ms: 0,
            check_on_launch: CheckOnLaunch::default(),
            expects_signed_manifest: false,
            public_key_url: None,
            request_headers: BTreeMap::new(),
            updates_directory: default_updates_directory(),
            database_path: None,
            retain_older: default_retain_older(),
            has_embedded_update: true,
            platform: default_platform(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl UpdatesConfig {
    /// Load configuration from an optional TOML file layered under
    /// `UPDRAFT_`-prefixed environment variables (`__` separates nesting).
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("UPDRAFT_").split("__"))
            .extract()
            .map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.update_url.is_none() {
            return Err("update_url must be set".to_string());
        }
        if self.effective_runtime_version().is_none() {
            return Err("one of runtime_version or sdk_version must be set".to_string());
        }
        if self.effective_scope_key().is_none() {
            return Err(
                "scope_key must be set when update_url has no usable origin".to_string(),
            );
        }
        if self.expects_signed_manifest && self.public_key_url.is_none() {
            return Err("expects_signed_manifest requires public_key_url".to_string());
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Scope key used for persisted updates.
    pub fn effective_scope_key(&self) -> Option<String> {
        if let Some(key) = &self.scope_key {
            return Some(key.clone());
        }
        let origin = self.update_url.as_ref()?.origin();
        origin
            .is_tuple()
            .then(|| origin.ascii_serialization())
    }

    /// Runtime version, falling back to the SDK version.
    pub fn effective_runtime_version(&self) -> Option<&str> {
        self.runtime_version
            .as_deref()
            .or(self.sdk_version.as_deref())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.updates_directory.join("updates.db"))
    }

    pub fn launch_wait(&self) -> Duration {
        Duration::from_millis(self.launch_wait_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Points at a loopback URL that callers are
    /// expected to replace with their mock server.
    pub fn for_testing() -> Self {
        Self {
            update_url: Url::parse("http://127.0.0.1:1/manifest").ok(),
            runtime_version: Some("1.0.0".to_string()),
            platform: "test".to_string(),
            request_timeout_secs: 5,
            ..Self::default()
        }
    }
}
