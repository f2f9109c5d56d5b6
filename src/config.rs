use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    capture::CaptureSettings,
    error::{UpliftError, UpliftResult},
    orchestrator::PollSettings,
    safety::SafetyScreen,
    template::DEFAULT_ANNOTATION_TAG,
    transfer::{DEFAULT_MAX_MESSAGE_SIZE, PREVIEW_MAX_SIZE},
    ws::WsHub,
};

/// Environment variable that overrides [`UpliftConfig::backend_address`].
pub const BACKEND_ENV_VAR: &str = "COMFYUI_SERVER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpliftConfig {
    /// `host:port` or a full `http(s)://` base URL.
    pub backend_address: String,
    pub templates_dir: PathBuf,
    pub default_template: String,
    pub annotation_tag: String,
    /// Term list for the safety screen; the bundled list is used when unset.
    pub blocked_terms_path: Option<PathBuf>,
    pub poll: PollConfig,
    pub capture: CaptureConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub allow_preview: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub frames_to_wait: u32,
    pub target_size: Option<[u32; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub max_message_size: usize,
    pub preview_max_size: u32,
}

impl Default for UpliftConfig {
    fn default() -> Self {
        Self {
            backend_address: "127.0.0.1:8188".to_string(),
            templates_dir: PathBuf::from("templates"),
            default_template: "default".to_string(),
            annotation_tag: DEFAULT_ANNOTATION_TAG.to_string(),
            blocked_terms_path: None,
            poll: PollConfig::default(),
            capture: CaptureConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            timeout_ms: 600_000,
            allow_preview: false,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frames_to_wait: crate::capture::FRAMES_TO_WAIT,
            target_size: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:8765".to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            preview_max_size: PREVIEW_MAX_SIZE,
        }
    }
}

impl UpliftConfig {
    /// Read a JSON config file and apply environment overrides.
    ///
    /// Relative paths in the file are resolved against the file's directory.
    pub fn load(path: &Path) -> UpliftResult<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))
            .map_err(|e| UpliftError::config(format!("{e:#}")))?;
        let mut config = Self::from_json_str(&text)?;

        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> UpliftResult<Self> {
        serde_json::from_str(text).map_err(|e| UpliftError::config(format!("invalid config: {e}")))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_backend_override(std::env::var(BACKEND_ENV_VAR).ok());
    }

    /// A non-empty override wins over the configured backend address.
    pub fn apply_backend_override(&mut self, value: Option<String>) {
        match value.filter(|v| !v.trim().is_empty()) {
            Some(addr) => {
                tracing::info!(backend = %addr, "backend address taken from {BACKEND_ENV_VAR}");
                self.backend_address = addr.trim().to_string();
            }
            None => {
                tracing::debug!(backend = %self.backend_address, "{BACKEND_ENV_VAR} not set; using config");
            }
        }
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        if self.templates_dir.is_relative() {
            self.templates_dir = base.join(&self.templates_dir);
        }
        if let Some(p) = self.blocked_terms_path.as_mut().filter(|p| p.is_relative()) {
            *p = base.join(&*p);
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.poll.interval_ms),
            timeout: Duration::from_millis(self.poll.timeout_ms),
            allow_preview: self.poll.allow_preview,
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            frames_to_wait: self.capture.frames_to_wait,
            target_size: self.capture.target_size,
        }
    }

    /// A hub with no clients yet, sized by the transfer section.
    pub fn transfer_hub(&self) -> WsHub {
        WsHub::new(self.transfer.max_message_size, self.transfer.preview_max_size)
    }

    pub fn safety_screen(&self) -> UpliftResult<SafetyScreen> {
        match &self.blocked_terms_path {
            Some(path) => SafetyScreen::load(path),
            None => Ok(SafetyScreen::bundled()),
        }
    }
}
