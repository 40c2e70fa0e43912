use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::color::is_valid_hex_color;
use crate::selector::{Selector, SelectorError};

pub const PRODUCT_NAME: &str = "slot-sentinel";

/// At most this many target texts are kept.
pub const MAX_TARGET_TEXTS: usize = 3;

pub const DEFAULT_SELECTOR: &str = "DIV.calander-display-block > DIV > MAT-CALENDAR";
pub const DEFAULT_TARGET_COLOR: &str = "#14a38b";
pub const DEFAULT_PUSH_API_URL: &str = "https://api.pushbullet.com/v2/pushes";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid targetColor format. Expected HEX format (#RRGGBB). Found: {0}")]
    InvalidTargetColor(String),
    #[error("Invalid selector {selector:?}: {source}")]
    InvalidSelector {
        selector: String,
        #[source]
        source: SelectorError,
    },
}

impl SettingsError {
    /// Short status reported back to the control surface.
    pub fn status(&self) -> &'static str {
        match self {
            SettingsError::InvalidTargetColor(_) => "Invalid targetColor format",
            SettingsError::InvalidSelector { .. } => "Invalid selector",
        }
    }
}

/// What to look for on the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub target_color: String,
    #[serde(default, deserialize_with = "lenient_target_texts")]
    pub target_texts: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            selector: DEFAULT_SELECTOR.to_string(),
            target_color: DEFAULT_TARGET_COLOR.to_string(),
            target_texts: Vec::new(),
        }
    }
}

fn lenient_target_texts<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect()),
        _ => {
            log::error!("[config] Invalid targetTexts format. Expected an array of texts.");
            Ok(Vec::new())
        }
    }
}

impl Settings {
    pub fn new(selector: &str, target_color: &str, target_texts: &[&str]) -> Self {
        Self {
            selector: selector.to_string(),
            target_color: target_color.to_string(),
            target_texts: target_texts.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Check the color and selector, and clean up the text list.
    ///
    /// Blank texts are dropped and the list is cut to [`MAX_TARGET_TEXTS`].
    /// Returns the parsed selector alongside the cleaned settings.
    pub fn validate(mut self) -> Result<(Settings, Selector), SettingsError> {
        if !is_valid_hex_color(&self.target_color) {
            log::error!(
                "[config] Invalid targetColor format. Expected HEX format (#RRGGBB). Found: {}",
                self.target_color
            );
            return Err(SettingsError::InvalidTargetColor(self.target_color));
        }

        let selector = Selector::parse(&self.selector).map_err(|source| {
            log::error!("[config] Invalid selector {:?}: {}", self.selector, source);
            SettingsError::InvalidSelector {
                selector: self.selector.clone(),
                source,
            }
        })?;

        self.target_texts.retain(|t| !t.trim().is_empty());
        if self.target_texts.is_empty() {
            log::error!("[config] No target texts provided.");
        } else if self.target_texts.len() > MAX_TARGET_TEXTS {
            log::warn!(
                "[config] More than {} target texts provided. Only the first {} will be used.",
                MAX_TARGET_TEXTS,
                MAX_TARGET_TEXTS
            );
            self.target_texts.truncate(MAX_TARGET_TEXTS);
        }

        Ok((self, selector))
    }
}

/// Split a comma separated text field the way the settings form does.
pub fn parse_target_texts_input(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(MAX_TARGET_TEXTS)
        .map(str::to_string)
        .collect()
}

/// The persisted key-value record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredState {
    #[serde(default)]
    pub settings: Option<Settings>,
    #[serde(default)]
    pub monitoring_state: bool,
    #[serde(default)]
    pub last_notification_time: i64,
}

impl Default for StoredState {
    fn default() -> Self {
        Self {
            settings: Some(Settings::default()),
            monitoring_state: false,
            last_notification_time: 0,
        }
    }
}

/// Channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            channels: ChannelsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub desktop: DesktopConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_push_api_url")]
    pub api_url: String,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            access_token: String::new(),
            api_url: default_push_api_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesktopConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u32,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_true() -> bool { true }
fn default_timeout_ms() -> u32 { 6000 }
fn default_push_api_url() -> String { DEFAULT_PUSH_API_URL.to_string() }

pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SLOT_SENTINEL_DATA_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    dirs::config_dir()
        .map(|dir| dir.join(PRODUCT_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn get_config_path() -> PathBuf {
    get_data_dir().join("config.json")
}

pub fn get_storage_path() -> PathBuf {
    get_data_dir().join("storage.json")
}

fn read_json_or_default<T>(path: &Path) -> Result<T, ConfigError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&get_config_path())
}

pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(&get_config_path(), config)
}

pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    read_json_or_default(path)
}

pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    write_json(path, config)?;
    log::info!("[config] saved {}", path.display());
    Ok(())
}

/// Flat key-value settings storage.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<StoredState, ConfigError>;

    fn save(&self, state: &StoredState) -> Result<(), ConfigError>;

    /// Read, modify and write back in one step.
    fn update(&self, f: &mut dyn FnMut(&mut StoredState)) -> Result<StoredState, ConfigError> {
        let mut state = self.load()?;
        f(&mut state);
        self.save(&state)?;
        Ok(state)
    }
}

/// JSON file backed store. A missing file reads as the install defaults.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn open_default() -> Self {
        Self::new(get_storage_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for FileStore {
    fn load(&self) -> Result<StoredState, ConfigError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        read_json_or_default(&self.path)
    }

    fn save(&self, state: &StoredState) -> Result<(), ConfigError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        write_json(&self.path, state)
    }

    fn update(&self, f: &mut dyn FnMut(&mut StoredState)) -> Result<StoredState, ConfigError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state: StoredState = read_json_or_default(&self.path)?;
        f(&mut state);
        write_json(&self.path, &state)?;
        Ok(state)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoredState>,
}

impl MemoryStore {
    pub fn new(state: StoredState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<StoredState, ConfigError> {
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, state: &StoredState) -> Result<(), ConfigError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state.clone();
        Ok(())
    }

    fn update(&self, f: &mut dyn FnMut(&mut StoredState)) -> Result<StoredState, ConfigError> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut *guard);
        Ok(guard.clone())
    }
}
