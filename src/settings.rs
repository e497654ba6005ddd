use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock, time::Duration};

pub const DEFAULT_SERVER_URL: &str = "https://simplify.informatik.tu-freiberg.de";
const SERVER_URL_ENV: &str = "KLARTEXT_SERVER_URL";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlushSettings {
    pub interval_secs: u64,
    pub startup_delay_secs: u64,
    /// Combined buffer size that triggers an upload right away.
    pub immediate_threshold: usize,
    pub chunk_size: usize,
    pub chunk_pause_ms: u64,
    pub default_retry_after_secs: u64,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10 * 60,
            startup_delay_secs: 15,
            immediate_threshold: 2000,
            chunk_size: 2000,
            chunk_pause_ms: 200,
            default_retry_after_secs: 60,
        }
    }
}

impl FlushSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn chunk_pause(&self) -> Duration {
        Duration::from_millis(self.chunk_pause_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceSettings {
    pub server_url: String,
    pub simplification_level: u8,
    pub include_block_containers: bool,
    pub auto_start: bool,
    pub study_group: String,
    pub flush: FlushSettings,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.into(),
            simplification_level: 3,
            include_block_containers: true,
            auto_start: true,
            study_group: "default".into(),
            flush: FlushSettings::default(),
        }
    }
}

impl ServiceSettings {
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<ServiceSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let mut data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            ServiceSettings::default()
        };

        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            if !url.trim().is_empty() {
                data.server_url = url.trim().to_string();
            }
        }

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn current(&self) -> ServiceSettings {
        self.data
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn update<F>(&self, apply: F) -> Result<ServiceSettings>
    where
        F: FnOnce(&mut ServiceSettings),
    {
        let mut guard = self
            .data
            .write()
            .map_err(|_| anyhow::anyhow!("settings lock poisoned"))?;
        apply(&mut guard);
        self.persist(&guard)?;
        Ok(guard.clone())
    }

    fn persist(&self, data: &ServiceSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
