use crate::config::CacheConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{ContentKind, MemoRecord, SeriesMap, TagCounts};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

// Every read treats a missing or malformed file as empty. Writes go through a
// temp file and rename so an interrupted write leaves the previous version intact.
#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    config: CacheConfig,
}

impl LocalCacheStore {
    pub fn new(config: CacheConfig) -> AppResult<Self> {
        fs::create_dir_all(&config.data_dir).map_err(|error| AppError::Io(error.to_string()))?;
        fs::create_dir_all(config.content_cache_dir()).map_err(|error| AppError::Io(error.to_string()))?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn load(&self) -> Vec<MemoRecord> {
        read_json_or_default(&self.config.list_cache_path(), "memo list")
    }

    pub fn save(&self, records: &[MemoRecord]) -> AppResult<()> {
        write_json_atomic(&self.config.list_cache_path(), &records)
    }

    pub fn get_content(&self, id: &str, kind: ContentKind) -> Option<String> {
        let path = self.content_path(id, kind);
        match fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(error) if error.kind() == ErrorKind::NotFound => None,
            Err(error) => {
                tracing::warn!(path = %path.to_string_lossy(), error = %error, "unreadable content cache entry");
                None
            }
        }
    }

    pub fn put_content(&self, id: &str, kind: ContentKind, artifact: &str) -> AppResult<()> {
        write_atomic(&self.content_path(id, kind), artifact.as_bytes())
    }

    pub fn invalidate_content(&self, id: &str) -> AppResult<()> {
        for kind in ContentKind::ALL {
            let path = self.content_path(id, kind);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(AppError::Io(error.to_string())),
            }
        }
        Ok(())
    }

    pub fn has_content(&self, id: &str, kind: ContentKind) -> bool {
        self.content_path(id, kind).exists()
    }

    pub fn load_series(&self) -> SeriesMap {
        let mut series: SeriesMap = read_json_or_default(&self.config.series_cache_path(), "series cache");
        for (chapter_id, link) in series.iter_mut() {
            link.chapter_id = chapter_id.clone();
        }
        series
    }

    pub fn save_series(&self, series: &SeriesMap) -> AppResult<()> {
        write_json_atomic(&self.config.series_cache_path(), series)
    }

    pub fn load_tag_snapshot(&self) -> TagCounts {
        read_json_or_default(&self.config.tag_cache_path(), "tag snapshot")
    }

    pub fn save_tag_snapshot(&self, tags: &TagCounts) -> AppResult<()> {
        write_json_atomic(&self.config.tag_cache_path(), tags)
    }

    pub fn load_favorites(&self) -> Vec<String> {
        read_json_or_default(&self.config.favorites_path(), "favorites")
    }

    pub fn save_favorites(&self, favorites: &[String]) -> AppResult<()> {
        write_json_atomic(&self.config.favorites_path(), &favorites)
    }

    fn content_path(&self, id: &str, kind: ContentKind) -> PathBuf {
        self.config
            .content_cache_dir()
            .join(format!("{}.{}", sanitize_component(id), kind.extension()))
    }
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path, what: &str) -> T {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == ErrorKind::NotFound => return T::default(),
        Err(error) => {
            tracing::warn!(path = %path.to_string_lossy(), error = %error, cache = what, "unreadable cache file; treating as empty");
            return T::default();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(path = %path.to_string_lossy(), error = %error, cache = what, "malformed cache file; treating as empty");
            T::default()
        }
    }
}

pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> AppResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| AppError::Io(error.to_string()))?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "cache".to_string());
    let temp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));
    fs::write(&temp, bytes).map_err(|error| AppError::Io(error.to_string()))?;
    if let Err(error) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(AppError::Io(error.to_string()));
    }
    Ok(())
}

fn sanitize_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "item".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SeriesLink;

    fn temp_store() -> (tempfile::TempDir, LocalCacheStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalCacheStore::new(CacheConfig::new(dir.path())).expect("store");
        (dir, store)
    }

    #[test]
    fn missing_and_corrupt_list_load_as_empty() {
        let (_dir, store) = temp_store();
        assert!(store.load().is_empty());

        fs::write(store.config().list_cache_path(), "[[\"broken\"").expect("write corrupt cache");
        assert!(store.load().is_empty());
    }

    #[test]
    fn list_save_overwrites_and_leaves_no_temp_files() {
        let (dir, store) = temp_store();
        let first = vec![MemoRecord::new("A", "t1", "a", "#x")];
        let second = vec![
            MemoRecord::new("B", "t2", "b", ""),
            MemoRecord::new("A", "t1", "a", "#x"),
        ];
        store.save(&first).expect("save first");
        store.save(&second).expect("save second");
        assert_eq!(store.load(), second);

        let leftovers = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn content_snapshots_are_keyed_by_id_and_kind() {
        let (_dir, store) = temp_store();
        store.put_content("doc-1", ContentKind::Html, "<p>hi</p>").expect("put html");
        store.put_content("doc-1", ContentKind::Text, "hi").expect("put text");
        store.put_content("doc-2", ContentKind::Text, "other").expect("put other");

        assert_eq!(store.get_content("doc-1", ContentKind::Html).as_deref(), Some("<p>hi</p>"));
        assert_eq!(store.get_content("doc-1", ContentKind::Text).as_deref(), Some("hi"));

        store.invalidate_content("doc-1").expect("invalidate");
        assert!(store.get_content("doc-1", ContentKind::Html).is_none());
        assert!(store.get_content("doc-1", ContentKind::Text).is_none());
        assert_eq!(store.get_content("doc-2", ContentKind::Text).as_deref(), Some("other"));

        store.invalidate_content("never-cached").expect("invalidate absent id");
    }

    #[test]
    fn series_cache_reload_restores_chapter_ids() {
        let (_dir, store) = temp_store();
        let mut series = SeriesMap::new();
        series.insert(
            "c1".to_string(),
            SeriesLink {
                chapter_id: "c1".to_string(),
                parent_moc_id: "m".to_string(),
                parent_moc_title: "Series".to_string(),
                prev_chapter_id: None,
                next_chapter_id: None,
            },
        );
        store.save_series(&series).expect("save series");
        assert_eq!(store.load_series(), series);

        fs::write(store.config().series_cache_path(), "nope").expect("corrupt series");
        assert!(store.load_series().is_empty());
    }

    #[test]
    fn sanitize_keeps_remote_id_alphabet() {
        assert_eq!(sanitize_component("1AbC-d_9"), "1AbC-d_9");
        assert_eq!(sanitize_component("../etc"), "___etc");
        assert_eq!(sanitize_component(""), "item");
    }
}
