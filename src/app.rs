use crate::error::ChatError;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_BASE_URL: &str = "http://localhost:5001/api";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppState {
    pub base_url: String,
    /// Socket.IO server; derived from `base_url` when unset.
    pub socket_url: Option<String>,
    /// Own user id, sent to the socket server so it can route messages here.
    pub user_id: Option<String>,
    pub token: Option<String>,
    pub sound: bool,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            socket_url: None,
            user_id: None,
            token: None,
            sound: true,
        }
    }
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    // TOML is the primary format; an older JSON settings file is converted on first load
    pub fn toml_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join("chatline.toml"))
    }

    fn legacy_json_path() -> Option<PathBuf> {
        let proj = directories::ProjectDirs::from("com", "example", "Chatline")?;
        Some(proj.config_dir().join("state.json"))
    }

    pub fn load() -> Self {
        match (Self::toml_path(), Self::legacy_json_path()) {
            (Some(toml), legacy) => Self::load_from(&toml, legacy.as_deref()),
            (None, _) => Self::new(),
        }
    }

    pub fn load_from(toml_path: &Path, legacy: Option<&Path>) -> Self {
        if let Ok(text) = fs::read_to_string(toml_path) {
            match toml::from_str::<AppState>(&text) {
                Ok(state) => return state,
                Err(e) => log::warn!("ignoring unreadable {}: {e}", toml_path.display()),
            }
        }

        if let Some(legacy) = legacy {
            if let Ok(bytes) = fs::read(legacy) {
                if let Ok(state) = serde_json::from_slice::<AppState>(&bytes) {
                    if let Err(e) = state.save_to(toml_path) {
                        log::warn!("could not migrate {}: {e}", legacy.display());
                    }
                    return state;
                }
            }
        }

        Self::new()
    }

    pub fn save(&self) -> Result<(), ChatError> {
        let path = Self::toml_path().ok_or_else(|| ChatError::Config("no config dir".into()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ChatError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ChatError::Config(e.to_string()))?;
        }
        let toml = toml::to_string_pretty(self).map_err(|e| ChatError::Config(e.to_string()))?;
        fs::write(path, toml).map_err(|e| ChatError::Config(e.to_string()))
    }

    pub fn socket_base(&self) -> &str {
        self.socket_url.as_deref().unwrap_or(&self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::load_from(&dir.path().join("none.toml"), None);
        assert_eq!(state, AppState::default());
        assert_eq!(state.socket_base(), DEFAULT_BASE_URL);
    }

    #[test]
    fn save_then_load_round_trips_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join("chatline.toml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "base_url = \"https://chat.example.com/api\"\nuser_id = \"u1\"\n").unwrap();

        let state = AppState::load_from(&path, None);
        assert_eq!(state.base_url, "https://chat.example.com/api");
        assert_eq!(state.user_id.as_deref(), Some("u1"));
        assert!(state.sound);
    }

    #[test]
    fn legacy_json_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("chatline.toml");
        let legacy = dir.path().join("state.json");
        fs::write(&legacy, r#"{"base_url":"http://10.0.0.2:5001","token":"abc"}"#).unwrap();

        let state = AppState::load_from(&toml_path, Some(&legacy));
        assert_eq!(state.token.as_deref(), Some("abc"));
        assert!(toml_path.exists());
        assert_eq!(AppState::load_from(&toml_path, None), state);
    }
}
