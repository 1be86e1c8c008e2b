use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;
use shared::domain::ClientInfo;
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "feed.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub server_url: String,
    pub database_url: String,
    pub locale: String,
    pub platform: String,
    pub app_version: String,
    /// Responses carry a leading varint byte count.
    pub length_prefixed_responses: bool,
    pub request_timeout_secs: u64,
    pub queue_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let client = ClientInfo::default();
        Self {
            server_url: "http://127.0.0.1:8080/feed".into(),
            database_url: "sqlite://./data/feed.db".into(),
            locale: client.locale,
            platform: client.platform,
            app_version: client.app_version,
            length_prefixed_responses: true,
            request_timeout_secs: 30,
            queue_capacity: 64,
        }
    }
}

impl EngineSettings {
    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            locale: self.locale.clone(),
            platform: self.platform.clone(),
            app_version: self.app_version.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn validated_server_url(&self) -> anyhow::Result<Url> {
        Url::parse(&self.server_url)
            .with_context(|| format!("invalid feed server url '{}'", self.server_url))
    }
}

pub fn load_settings() -> EngineSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the optional toml file, then environment overrides.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> EngineSettings {
    let mut settings = EngineSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            apply_file_settings(&mut settings, &file_cfg);
        }
    }

    if let Some(v) = env("FEED_SERVER_URL").or_else(|| env("APP__SERVER_URL")) {
        settings.server_url = v;
    }
    if let Some(v) = env("FEED_DATABASE_URL").or_else(|| env("APP__DATABASE_URL")) {
        settings.database_url = v;
    }
    if let Some(v) = env("FEED_LOCALE").or_else(|| env("APP__LOCALE")) {
        settings.locale = v;
    }
    if let Some(v) = env("APP__APP_VERSION") {
        settings.app_version = v;
    }
    if let Some(v) = env("APP__LENGTH_PREFIXED_RESPONSES") {
        if let Ok(parsed) = v.parse::<bool>() {
            settings.length_prefixed_responses = parsed;
        }
    }
    if let Some(v) = env("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = parsed;
        }
    }

    settings
}

fn apply_file_settings(settings: &mut EngineSettings, file_cfg: &HashMap<String, toml::Value>) {
    let string = |key: &str| file_cfg.get(key).and_then(|v| v.as_str()).map(str::to_string);

    if let Some(v) = string("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = string("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = string("locale") {
        settings.locale = v;
    }
    if let Some(v) = string("platform") {
        settings.platform = v;
    }
    if let Some(v) = string("app_version") {
        settings.app_version = v;
    }
    if let Some(v) = file_cfg
        .get("length_prefixed_responses")
        .and_then(|v| v.as_bool())
    {
        settings.length_prefixed_responses = v;
    }
    if let Some(v) = file_cfg
        .get("request_timeout_secs")
        .and_then(|v| v.as_integer())
    {
        settings.request_timeout_secs = v.max(1) as u64;
    }
    if let Some(v) = file_cfg.get("queue_capacity").and_then(|v| v.as_integer()) {
        settings.queue_capacity = v.max(1) as usize;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
