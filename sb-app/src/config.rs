//! Switchboard configuration loader.

use sb_core::{AggregatorConfig, CorrelatorConfig, DispatcherConfig, EmitterConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchboardConfig {
    pub whatsapp: WhatsAppConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub aggregator: AggregatorSection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub emitter: EmitterSection,
    #[serde(default)]
    pub echo: EchoSection,
    #[serde(default)]
    pub bindings: BindingsSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
    /// Token echoed during the webhook verification handshake.
    #[serde(default)]
    pub verify_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub assistant_id: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_run_timeout_seconds")]
    pub run_timeout_seconds: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_run_timeout_seconds() -> u64 {
    90
}

fn default_poll_interval_ms() -> u64 {
    750
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorSection {
    /// Quiet period before a buffered burst is flushed, in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for AggregatorSection {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    6000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    #[serde(default = "default_busy_notice")]
    pub busy_notice: String,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            max_attempts: default_max_attempts(),
            max_queue: default_max_queue(),
            busy_notice: default_busy_notice(),
        }
    }
}

fn default_cooldown_ms() -> u64 {
    3000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_queue() -> usize {
    8
}

fn default_busy_notice() -> String {
    "Still working through your previous messages, one moment please.".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmitterSection {
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_max_chunk_lines")]
    pub max_chunk_lines: usize,
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
}

impl Default for EmitterSection {
    fn default() -> Self {
        Self {
            max_chunk_chars: default_max_chunk_chars(),
            max_chunk_lines: default_max_chunk_lines(),
            pacing_ms: default_pacing_ms(),
        }
    }
}

fn default_max_chunk_chars() -> usize {
    1000
}

fn default_max_chunk_lines() -> usize {
    12
}

fn default_pacing_ms() -> u64 {
    150
}

#[derive(Debug, Clone, Deserialize)]
pub struct EchoSection {
    /// Retention window for self-echo ids, in seconds.
    #[serde(default = "default_echo_retention_secs")]
    pub retention_secs: u64,
}

impl Default for EchoSection {
    fn default() -> Self {
        Self {
            retention_secs: default_echo_retention_secs(),
        }
    }
}

fn default_echo_retention_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindingsSection {
    /// Idle time after which a thread binding is evicted, in seconds.
    #[serde(default = "default_binding_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

impl Default for BindingsSection {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_binding_idle_ttl_secs(),
        }
    }
}

fn default_binding_idle_ttl_secs() -> u64 {
    43_200
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8085".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    64
}

impl SwitchboardConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: SwitchboardConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WHATSAPP_ACCESS_TOKEN") {
            if !v.trim().is_empty() {
                self.whatsapp.access_token = v;
            }
        }
        if let Ok(v) = std::env::var("WHATSAPP_PHONE_NUMBER_ID") {
            if !v.trim().is_empty() {
                self.whatsapp.phone_number_id = v;
            }
        }
        if let Ok(v) = std::env::var("WHATSAPP_VERIFY_TOKEN") {
            if !v.trim().is_empty() {
                self.whatsapp.verify_token = v;
            }
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            if !v.trim().is_empty() {
                self.backend.api_key = v;
            }
        }
        if let Ok(v) = std::env::var("OPENAI_ASSISTANT_ID") {
            if !v.trim().is_empty() {
                self.backend.assistant_id = v;
            }
        }
    }

    /// Missing credentials abort the process before any traffic is served.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.whatsapp.access_token.trim().is_empty() {
            return Err(anyhow::anyhow!("whatsapp.access_token is required"));
        }
        if self.whatsapp.phone_number_id.trim().is_empty() {
            return Err(anyhow::anyhow!("whatsapp.phone_number_id is required"));
        }
        if self.whatsapp.verify_token.trim().is_empty() {
            return Err(anyhow::anyhow!("whatsapp.verify_token is required"));
        }
        if self.backend.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!("backend.api_key is required"));
        }
        if self.backend.assistant_id.trim().is_empty() {
            return Err(anyhow::anyhow!("backend.assistant_id is required"));
        }
        if self.aggregator.debounce_ms == 0 {
            return Err(anyhow::anyhow!("aggregator.debounce_ms must be > 0"));
        }
        if self.dispatcher.max_attempts == 0 {
            return Err(anyhow::anyhow!("dispatcher.max_attempts must be > 0"));
        }
        if self.dispatcher.max_queue == 0 {
            return Err(anyhow::anyhow!("dispatcher.max_queue must be > 0"));
        }
        if self.emitter.max_chunk_chars == 0 {
            return Err(anyhow::anyhow!("emitter.max_chunk_chars must be > 0"));
        }
        if self.emitter.max_chunk_lines == 0 {
            return Err(anyhow::anyhow!("emitter.max_chunk_lines must be > 0"));
        }
        Ok(())
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            debounce: Duration::from_millis(self.aggregator.debounce_ms),
        }
    }

    pub fn correlator_config(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            debounce: Duration::from_millis(self.aggregator.debounce_ms),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            cooldown: Duration::from_millis(self.dispatcher.cooldown_ms),
            max_attempts: self.dispatcher.max_attempts,
            max_queue: self.dispatcher.max_queue,
            busy_notice: self.dispatcher.busy_notice.clone(),
        }
    }

    pub fn emitter_config(&self) -> EmitterConfig {
        EmitterConfig {
            max_chunk_chars: self.emitter.max_chunk_chars,
            max_chunk_lines: self.emitter.max_chunk_lines,
            pacing: Duration::from_millis(self.emitter.pacing_ms),
        }
    }

    pub fn echo_retention(&self) -> Duration {
        Duration::from_secs(self.echo.retention_secs)
    }

    pub fn binding_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.bindings.idle_ttl_secs)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".switchboard").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[whatsapp]
access_token = "token"
phone_number_id = "12345"
verify_token = "verify"

[backend]
api_key = "sk-test"
assistant_id = "asst_test"
"#
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: SwitchboardConfig = toml::from_str(minimal_toml()).expect("parse minimal config");
        cfg.validate().expect("minimal config validates");
        assert_eq!(cfg.aggregator.debounce_ms, 6000);
        assert_eq!(cfg.dispatcher.cooldown_ms, 3000);
        assert_eq!(cfg.dispatcher.max_attempts, 3);
        assert_eq!(cfg.emitter.pacing_ms, 150);
        assert_eq!(cfg.echo.retention_secs, 300);
    }

    #[test]
    fn missing_credentials_fail_validation() {
        let cfg: SwitchboardConfig = toml::from_str(
            r#"
[whatsapp]
access_token = "token"
phone_number_id = "12345"
verify_token = "verify"

[backend]
assistant_id = "asst_test"
"#,
        )
        .expect("parse config");
        let err = cfg.validate().expect_err("missing api key must fail");
        assert!(err.to_string().contains("backend.api_key"));
    }

    #[test]
    fn zero_debounce_fails_validation() {
        let mut cfg: SwitchboardConfig =
            toml::from_str(minimal_toml()).expect("parse minimal config");
        cfg.aggregator.debounce_ms = 0;
        assert!(cfg.validate().is_err());
    }
}
