use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub data_dir: PathBuf,
}

impl CacheConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn list_cache_path(&self) -> PathBuf {
        self.data_dir.join("cache.json")
    }

    pub fn content_cache_dir(&self) -> PathBuf {
        self.data_dir.join("content_cache")
    }

    pub fn series_cache_path(&self) -> PathBuf {
        self.data_dir.join("series_cache.json")
    }

    pub fn tag_cache_path(&self) -> PathBuf {
        self.data_dir.join("tag_cache.json")
    }

    pub fn favorites_path(&self) -> PathBuf {
        self.data_dir.join("favorites.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotkeySettings {
    pub new_memo: String,
    pub list_memos: String,
    pub quick_launcher: String,
}

impl Default for HotkeySettings {
    fn default() -> Self {
        Self {
            new_memo: "ctrl+1".to_string(),
            list_memos: "ctrl+2".to_string(),
            quick_launcher: "ctrl+p".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub spreadsheet_id: String,
    pub folder_id: String,
    pub page_size: u32,
    pub sync_interval_seconds: u64,
    pub verify_existence: bool,
    pub hotkeys: HotkeySettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            spreadsheet_id: String::new(),
            folder_id: String::new(),
            page_size: 30,
            sync_interval_seconds: 300,
            verify_existence: true,
            hotkeys: HotkeySettings::default(),
        }
    }
}

pub fn load_settings(config: &CacheConfig) -> CacheSettings {
    let path = config.settings_path();
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            let settings = CacheSettings::default();
            if let Err(error) = write_settings(&path, &settings) {
                tracing::warn!(path = %path.to_string_lossy(), error = %error, "failed to write default settings");
            }
            return settings;
        }
        Err(error) => {
            tracing::warn!(path = %path.to_string_lossy(), error = %error, "failed to read settings; using defaults");
            return CacheSettings::default();
        }
    };

    let stored: Value = match serde_json::from_slice(&raw) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(path = %path.to_string_lossy(), error = %error, "malformed settings file; using defaults");
            return CacheSettings::default();
        }
    };

    let mut merged = default_settings_value();
    merge_json(&mut merged, stored.clone());
    match serde_json::from_value::<CacheSettings>(merged.clone()) {
        Ok(settings) => {
            if merged != stored {
                if let Err(error) = crate::store::write_json_atomic(&path, &merged) {
                    tracing::warn!(path = %path.to_string_lossy(), error = %error, "failed to persist merged settings");
                }
            }
            settings
        }
        Err(error) => {
            // The file is left as written; only the bad keys fall back.
            tracing::warn!(path = %path.to_string_lossy(), error = %error, "invalid settings values; keeping the valid keys");
            salvage_settings(&stored)
        }
    }
}

fn default_settings_value() -> Value {
    serde_json::to_value(CacheSettings::default()).unwrap_or(Value::Object(Map::new()))
}

fn salvage_settings(stored: &Value) -> CacheSettings {
    let mut salvaged = default_settings_value();
    if let Value::Object(entries) = stored {
        for (key, value) in entries {
            let mut candidate = salvaged.clone();
            let mut patch = Map::new();
            patch.insert(key.clone(), value.clone());
            merge_json(&mut candidate, Value::Object(patch));
            if serde_json::from_value::<CacheSettings>(candidate.clone()).is_ok() {
                salvaged = candidate;
            } else {
                tracing::warn!(key = %key, "ignoring invalid settings value");
            }
        }
    }
    serde_json::from_value(salvaged).unwrap_or_default()
}

pub fn update_settings(config: &CacheConfig, update: Value) -> AppResult<CacheSettings> {
    if !update.is_object() {
        return Err(AppError::Invalid("settings update must be a JSON object".to_string()));
    }
    let current = load_settings(config);
    let mut merged = serde_json::to_value(current)?;
    merge_json(&mut merged, update);
    let settings: CacheSettings = serde_json::from_value(merged)
        .map_err(|error| AppError::Invalid(format!("invalid settings: {}", error)))?;
    write_settings(&config.settings_path(), &settings)?;
    Ok(settings)
}

fn write_settings(path: &Path, settings: &CacheSettings) -> AppResult<()> {
    crate::store::write_json_atomic(path, settings)
}

fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => merge_json(existing, value),
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(&CacheConfig::new(dir.path()));
        assert_eq!(settings, CacheSettings::default());
        assert!(dir.path().join(SETTINGS_FILE).exists());
    }

    #[test]
    fn missing_keys_are_filled_and_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, r#"{"pageSize": 50, "hotkeys": {"newMemo": "ctrl+n"}}"#).expect("write settings");

        let settings = load_settings(&CacheConfig::new(dir.path()));
        assert_eq!(settings.page_size, 50);
        assert_eq!(settings.hotkeys.new_memo, "ctrl+n");
        assert_eq!(settings.hotkeys.quick_launcher, "ctrl+p");
        assert_eq!(settings.sync_interval_seconds, 300);

        let rewritten: Value = serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        assert_eq!(rewritten["syncIntervalSeconds"], 300);
        assert_eq!(rewritten["hotkeys"]["listMemos"], "ctrl+2");
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(SETTINGS_FILE), "{not json").expect("write settings");
        assert_eq!(load_settings(&CacheConfig::new(dir.path())), CacheSettings::default());
    }

    #[test]
    fn mistyped_key_keeps_other_settings_and_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE);
        let original = r#"{"spreadsheetId":"my-sheet","folderId":"my-folder","pageSize":"50"}"#;
        fs::write(&path, original).expect("write settings");

        let settings = load_settings(&CacheConfig::new(dir.path()));
        assert_eq!(settings.spreadsheet_id, "my-sheet");
        assert_eq!(settings.folder_id, "my-folder");
        assert_eq!(settings.page_size, 30);
        assert_eq!(fs::read_to_string(&path).expect("read"), original);
    }

    #[test]
    fn unknown_keys_survive_the_defaults_rewrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, r#"{"folderId":"f","windowGeometry":[1,2]}"#).expect("write settings");

        let settings = load_settings(&CacheConfig::new(dir.path()));
        assert_eq!(settings.folder_id, "f");
        let rewritten: Value = serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        assert_eq!(rewritten["windowGeometry"], serde_json::json!([1, 2]));
        assert_eq!(rewritten["pageSize"], 30);
    }

    #[test]
    fn partial_update_merges_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let updated = update_settings(&CacheConfig::new(dir.path()), json!({"spreadsheetId": "sheet-1", "hotkeys": {"listMemos": "ctrl+l"}}))
            .expect("update settings");
        assert_eq!(updated.spreadsheet_id, "sheet-1");
        assert_eq!(updated.hotkeys.list_memos, "ctrl+l");
        assert_eq!(updated.hotkeys.new_memo, "ctrl+1");
        assert_eq!(load_settings(&CacheConfig::new(dir.path())), updated);

        let error = update_settings(&CacheConfig::new(dir.path()), json!({"pageSize": "many"})).expect_err("type mismatch");
        assert!(error.to_string().contains("INVALID_INPUT"));
        assert!(update_settings(&CacheConfig::new(dir.path()), json!(3)).is_err());
    }
}
