use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub merge: MergeSettings,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Tuning for record matching and merge anchoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSettings {
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,
    #[serde(default = "default_float_tolerance")]
    pub float_tolerance: f64,
    #[serde(default = "default_anchor_type")]
    pub anchor_type: String,
    /// Case-insensitive path substrings excluded from match ratios.
    #[serde(default = "default_unsuitable_tokens")]
    pub unsuitable_path_tokens: Vec<String>,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
            float_tolerance: default_float_tolerance(),
            anchor_type: default_anchor_type(),
            unsuitable_path_tokens: default_unsuitable_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpSettings {
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSettings {
    #[serde(default = "default_fhir_base_url")]
    pub fhir_base_url: String,
    #[serde(default)]
    pub session_backend: SessionBackend,
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            fhir_base_url: default_fhir_base_url(),
            session_backend: SessionBackend::default(),
            session_dir: default_session_dir(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            filter: default_log_filter(),
        }
    }
}

fn default_match_threshold() -> f64 {
    0.8
}
fn default_float_tolerance() -> f64 {
    1e-4
}
fn default_anchor_type() -> String {
    "Patient".into()
}
fn default_unsuitable_tokens() -> Vec<String> {
    ["identifier", "system", "reference", "display", "text", "url", "div"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_http_port() -> u16 {
    8787
}
fn default_fhir_base_url() -> String {
    "http://localhost:3001".into()
}
fn default_session_dir() -> PathBuf {
    PathBuf::from(".chartmerge/sessions")
}
fn default_request_timeout() -> u64 {
    30
}
fn default_log_dir() -> PathBuf {
    PathBuf::from(".chartmerge/logs")
}
fn default_log_filter() -> String {
    "info".into()
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let threshold = self.merge.match_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            anyhow::bail!("matchThreshold must be in (0, 1], got {threshold}");
        }
        if !(self.merge.float_tolerance >= 0.0) {
            anyhow::bail!(
                "floatTolerance must be non-negative, got {}",
                self.merge.float_tolerance
            );
        }
        if self.merge.anchor_type.is_empty() {
            anyhow::bail!("anchorType must not be empty");
        }
        Ok(())
    }
}
