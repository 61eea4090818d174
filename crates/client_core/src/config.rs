use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::channel::ReconnectPolicy;

const API_PATH_SUFFIX: &str = "/api/v1";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub refresh_path: String,
    pub realtime_token_path: String,
    pub reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub reconnect_jitter: bool,
    pub reconnect_max_interval_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api/v1".into(),
            refresh_path: "/auth/refresh".into(),
            realtime_token_path: "/auth/ws-token".into(),
            reconnect: true,
            reconnect_interval_ms: 3000,
            reconnect_jitter: false,
            reconnect_max_interval_ms: 30_000,
        }
    }
}

impl ClientSettings {
    /// WebSocket origin matching the REST base: same host, `ws`/`wss` scheme,
    /// without the `/api/v1` prefix.
    pub fn ws_base_url(&self) -> anyhow::Result<String> {
        ws_base_from_api(&self.api_base_url)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let base = Duration::from_millis(self.reconnect_interval_ms);
        if self.reconnect_jitter {
            ReconnectPolicy::Jittered {
                base,
                max: Duration::from_millis(self.reconnect_max_interval_ms.max(self.reconnect_interval_ms)),
            }
        } else {
            ReconnectPolicy::Fixed(base)
        }
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new("client.toml"))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<ClientSettings>(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(path = %path.display(), "ignoring unreadable client settings: {err}");
                ClientSettings::default()
            }
        },
        Err(_) => ClientSettings::default(),
    };

    if let Ok(v) = std::env::var("API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Ok(v) = std::env::var("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Ok(v) = std::env::var("APP__RECONNECT_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_interval_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__RECONNECT_JITTER") {
        if let Ok(parsed) = v.parse::<bool>() {
            settings.reconnect_jitter = parsed;
        }
    }

    settings
}

fn ws_base_from_api(api_base_url: &str) -> anyhow::Result<String> {
    let trimmed = api_base_url.trim().trim_end_matches('/');
    let origin = trimmed.strip_suffix(API_PATH_SUFFIX).unwrap_or(trimmed);

    let ws_origin = if let Some(rest) = origin.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = origin.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!(
            "api base url must start with http:// or https://: {api_base_url}"
        ));
    };

    url::Url::parse(&ws_origin)
        .with_context(|| format!("invalid websocket origin derived from {api_base_url}"))?;
    Ok(ws_origin)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
