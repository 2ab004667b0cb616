use crate::errors::{AppError, AppResult};
use crate::models::{ContentKind, MemoRecord, RemoteDocument};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

/// Document store the cache mirrors. Calls block; callers run them off the UI thread.
pub trait RemoteStore: Send + Sync {
    fn list_memos(&self) -> AppResult<Vec<MemoRecord>>;
    fn load_content(&self, id: &str, kind: ContentKind) -> AppResult<RemoteDocument>;
    fn save(&self, title: &str, body: &str, tags: &str) -> AppResult<String>;
    fn update(&self, id: &str, title: &str, body: &str, tags: &str) -> AppResult<()>;
    fn delete(&self, id: &str) -> AppResult<()>;
    fn exists(&self, id: &str) -> AppResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RemoteOp {
    List,
    Load,
    Save,
    Update,
    Delete,
    Exists,
}

impl RemoteOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Load => "load",
            Self::Save => "save",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Exists => "exists",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredDocument {
    title: String,
    body: String,
    tags: String,
}

#[derive(Debug, Default)]
struct RemoteState {
    documents: BTreeMap<String, StoredDocument>,
    rows: Vec<MemoRecord>,
    next_id: u64,
    clock: i64,
    failing: HashSet<RemoteOp>,
    calls: BTreeMap<RemoteOp, usize>,
}

impl RemoteState {
    fn tick(&mut self) -> String {
        self.clock += 1;
        let epoch = NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .unwrap_or(NaiveDateTime::MIN);
        (epoch + Duration::seconds(self.clock))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    fn check(&mut self, op: RemoteOp) -> anyhow::Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        if self.failing.contains(&op) {
            anyhow::bail!("simulated {} failure", op.as_str());
        }
        Ok(())
    }
}

// Documents and sheet rows are kept apart so callers can reproduce a sheet
// that lags behind document creation or rows that outlive their document.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    state: Mutex<RemoteState>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, RemoteState>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("remote store mutex poisoned".to_string()))
    }

    pub fn insert_document(&self, title: &str, body: &str, tags: &str) -> String {
        let Ok(mut state) = self.lock() else {
            return String::new();
        };
        let id = next_document_id(&mut state);
        let modified_at = state.tick();
        state.documents.insert(
            id.clone(),
            StoredDocument {
                title: title.to_string(),
                body: body.to_string(),
                tags: tags.to_string(),
            },
        );
        state.rows.push(MemoRecord::new(title, modified_at, id.clone(), tags));
        id
    }

    // Sheet row removed, document kept: the sheet has not caught up yet.
    pub fn delist(&self, id: &str) {
        if let Ok(mut state) = self.lock() {
            state.rows.retain(|row| row.id != id);
        }
    }

    // Document removed, sheet row kept: deleted straight from the drive.
    pub fn remove_document_only(&self, id: &str) {
        if let Ok(mut state) = self.lock() {
            state.documents.remove(id);
        }
    }

    pub fn touch(&self, id: &str) {
        if let Ok(mut state) = self.lock() {
            let modified_at = state.tick();
            if let Some(row) = state.rows.iter_mut().find(|row| row.id == id) {
                row.modified_at = modified_at;
            }
        }
    }

    pub fn set_failing(&self, op: RemoteOp, failing: bool) {
        if let Ok(mut state) = self.lock() {
            if failing {
                state.failing.insert(op);
            } else {
                state.failing.remove(&op);
            }
        }
    }

    pub fn call_count(&self, op: RemoteOp) -> usize {
        self.lock()
            .map(|state| state.calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn body(&self, id: &str) -> Option<String> {
        self.lock()
            .ok()
            .and_then(|state| state.documents.get(id).map(|doc| doc.body.clone()))
    }

    pub fn row(&self, id: &str) -> Option<MemoRecord> {
        self.lock()
            .ok()
            .and_then(|state| state.rows.iter().find(|row| row.id == id).cloned())
    }
}

fn next_document_id(state: &mut RemoteState) -> String {
    state.next_id += 1;
    format!("doc-{:04}", state.next_id)
}

fn render_html(body: &str) -> String {
    let escaped = body
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!("<html><body><pre>{}</pre></body></html>", escaped)
}

impl RemoteStore for InMemoryRemoteStore {
    fn list_memos(&self) -> AppResult<Vec<MemoRecord>> {
        let mut state = self.lock()?;
        state.check(RemoteOp::List)?;
        Ok(state.rows.clone())
    }

    fn load_content(&self, id: &str, kind: ContentKind) -> AppResult<RemoteDocument> {
        let mut state = self.lock()?;
        state.check(RemoteOp::Load)?;
        let doc = state
            .documents
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("remote document {}", id)))?;
        let body = match kind {
            ContentKind::Text => doc.body.clone(),
            ContentKind::Html => render_html(&doc.body),
        };
        Ok(RemoteDocument {
            title: doc.title.clone(),
            body,
            tags: doc.tags.clone(),
        })
    }

    fn save(&self, title: &str, body: &str, tags: &str) -> AppResult<String> {
        let mut state = self.lock()?;
        state.check(RemoteOp::Save)?;
        let id = next_document_id(&mut state);
        let modified_at = state.tick();
        state.documents.insert(
            id.clone(),
            StoredDocument {
                title: title.to_string(),
                body: body.to_string(),
                tags: tags.to_string(),
            },
        );
        state.rows.push(MemoRecord::new(title, modified_at, id.clone(), tags));
        Ok(id)
    }

    fn update(&self, id: &str, title: &str, body: &str, tags: &str) -> AppResult<()> {
        let mut state = self.lock()?;
        state.check(RemoteOp::Update)?;
        let modified_at = state.tick();
        let doc = state
            .documents
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("remote document {}", id)))?;
        doc.title = title.to_string();
        doc.body = body.to_string();
        doc.tags = tags.to_string();
        if let Some(row) = state.rows.iter_mut().find(|row| row.id == id) {
            row.title = title.to_string();
            row.tags = tags.to_string();
            row.modified_at = modified_at;
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> AppResult<()> {
        let mut state = self.lock()?;
        state.check(RemoteOp::Delete)?;
        state.rows.retain(|row| row.id != id);
        if state.documents.remove(id).is_none() {
            return Err(AppError::NotFound(format!("remote document {}", id)));
        }
        Ok(())
    }

    fn exists(&self, id: &str) -> AppResult<bool> {
        let mut state = self.lock()?;
        state.check(RemoteOp::Exists)?;
        Ok(state.documents.contains_key(id))
    }
}
