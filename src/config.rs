use anyhow::{Context, Result};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "edradio";
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub last_station: Option<String>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub studio: StudioConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            muted: false,
            last_station: None,
            data_dir: None,
            studio: StudioConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudioConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_text_model")]
    pub text_model: String,
    #[serde(default = "default_speech_model")]
    pub speech_model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Fake generation locally instead of calling the endpoint.
    #[serde(default)]
    pub mock: bool,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            text_model: default_text_model(),
            speech_model: default_speech_model(),
            voice: default_voice(),
            sample_rate: default_sample_rate(),
            mock: false,
        }
    }
}

impl StudioConfig {
    /// Key from the environment first, then the config file. Blank keys count as missing.
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .or_else(|| self.api_key.clone())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }
}

fn default_volume() -> f32 {
    0.75
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_text_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_speech_model() -> String {
    "gemini-2.5-flash-preview-tts".to_string()
}

fn default_voice() -> String {
    "Kore".to_string()
}

fn default_sample_rate() -> u32 {
    24_000
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read config: {path:?}")),
        };
        let text = String::from_utf8_lossy(&bytes);
        toml::from_str(&text).with_context(|| format!("Invalid config TOML: {path:?}"))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let data = toml::to_string_pretty(self).context("Failed to serialize config")?;
        write_atomic(path, data.as_bytes())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }
}

/// Writes `data` to a sibling temp file, syncs it and renames it over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().context("Target path has no parent")?;
    ensure_private_dir(parent)?;

    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    let tmp = parent.join(format!(
        ".{}.tmp.{suffix}",
        path.file_name().and_then(|s| s.to_str()).unwrap_or("data")
    ));

    {
        let mut file = fs::File::create(&tmp).with_context(|| format!("Create temp file: {tmp:?}"))?;
        file.write_all(data)
            .with_context(|| format!("Write temp file: {tmp:?}"))?;
        file.sync_all()
            .with_context(|| format!("Sync temp file: {tmp:?}"))?;
    }

    fs::rename(&tmp, path).with_context(|| format!("Atomic rename to: {path:?}"))?;

    let dir_file = fs::File::open(parent).with_context(|| format!("Open dir: {parent:?}"))?;
    let _ = dir_file.sync_all();

    Ok(())
}

pub fn config_path() -> Result<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .context("Could not determine XDG config directory")?;
    Ok(base.join(APP_DIR).join("config.toml"))
}

fn default_data_dir() -> Result<PathBuf> {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local").join("share"))
        })
        .context("Could not determine XDG data directory")?;
    Ok(base.join(APP_DIR))
}

pub fn ensure_private_dir(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    fs::create_dir_all(path).with_context(|| format!("Create dir: {path:?}"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Set permissions on dir: {path:?}"))?;
    }
    Ok(())
}
