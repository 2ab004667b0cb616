use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MOC_TAG: &str = "moc";
pub const SERIES_TAG: &str = "시리즈";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "[String; 4]")]
pub struct MemoRecord {
    pub title: String,
    pub modified_at: String,
    pub id: String,
    pub tags: String,
}

impl MemoRecord {
    pub fn new(
        title: impl Into<String>,
        modified_at: impl Into<String>,
        id: impl Into<String>,
        tags: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            modified_at: modified_at.into(),
            id: id.into(),
            tags: tags.into(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        crate::tags::extract_tags(&self.tags).any(|name| name == tag)
    }

    pub fn is_moc(&self) -> bool {
        crate::tags::extract_tags(&self.tags).any(is_series_marker)
    }
}

pub fn is_series_marker(tag: &str) -> bool {
    tag.eq_ignore_ascii_case(MOC_TAG) || tag == SERIES_TAG
}

impl TryFrom<Vec<String>> for MemoRecord {
    type Error = String;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        let mut fields = value.into_iter();
        let (Some(title), Some(modified_at), Some(id)) = (fields.next(), fields.next(), fields.next()) else {
            return Err("memo row needs at least title, modified_at and id".to_string());
        };
        let tags = fields.next().unwrap_or_default();
        Ok(Self {
            title,
            modified_at,
            id,
            tags,
        })
    }
}

impl From<MemoRecord> for [String; 4] {
    fn from(value: MemoRecord) -> Self {
        [value.title, value.modified_at, value.id, value.tags]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    Html,
    Text,
}

impl ContentKind {
    pub const ALL: [ContentKind; 2] = [ContentKind::Html, ContentKind::Text];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Text => "text",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Text => "txt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub title: String,
    pub body: String,
    pub tags: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesLink {
    #[serde(skip_serializing, default)]
    pub chapter_id: String,
    pub parent_moc_id: String,
    pub parent_moc_title: String,
    pub prev_chapter_id: Option<String>,
    pub next_chapter_id: Option<String>,
}

pub type SeriesMap = BTreeMap<String, SeriesLink>;

pub type TagCounts = BTreeMap<String, usize>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterParent {
    pub moc_id: String,
    pub moc_title: String,
    // True when derived from the `"<MOC title> - "` title prefix rather than the series cache.
    pub inferred: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub level: StatusLevel,
    pub text: String,
    pub display_ms: u64,
}

impl StatusMessage {
    pub fn info(text: impl Into<String>, display_ms: u64) -> Self {
        Self {
            level: StatusLevel::Info,
            text: text.into(),
            display_ms,
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Warning,
            text: text.into(),
            display_ms: 5_000,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Error,
            text: text.into(),
            display_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    ListUpdated(Vec<MemoRecord>),
    TagsUpdated(TagCounts),
    SeriesUpdated { chapter_count: usize },
    Status(StatusMessage),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub changed: bool,
    pub record_count: usize,
    pub dropped_missing: usize,
    pub preserved_orphans: usize,
    pub invalidated_ids: Vec<String>,
}
