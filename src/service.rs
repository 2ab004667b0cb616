use crate::config::{self, CacheConfig, CacheSettings};
use crate::errors::{AppError, AppResult};
use crate::models::{
    CacheEvent, ChapterParent, ContentKind, MemoRecord, SeriesLink, SeriesMap, StatusMessage, SyncReport, TagCounts,
};
use crate::reconcile::{self, Reconciliation};
use crate::remote::RemoteStore;
use crate::series;
use crate::store::LocalCacheStore;
use crate::tags;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const EVENT_CAPACITY: usize = 64;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// In-memory view guarded by a single mutex. The on-disk mirror is written
// while the lock is held so list and file never diverge between writers.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub(crate) records: Vec<MemoRecord>,
    pub(crate) tags: TagCounts,
    pub(crate) series: SeriesMap,
    pub(crate) favorites: Vec<String>,
}

impl CacheState {
    pub(crate) fn record(&self, id: &str) -> Option<&MemoRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    pub(crate) fn insert_head(&mut self, record: MemoRecord) -> bool {
        if self.record(&record.id).is_some() {
            return false;
        }
        self.records.insert(0, record);
        true
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<MemoRecord> {
        let index = self.records.iter().position(|record| record.id == id)?;
        Some(self.records.remove(index))
    }
}

#[derive(Clone)]
pub struct CacheService {
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) store: LocalCacheStore,
    settings: Arc<RwLock<CacheSettings>>,
    pub(crate) state: Arc<Mutex<CacheState>>,
    events: broadcast::Sender<CacheEvent>,
    // Bumped by every incremental series patch; a full rebuild started
    // before the latest bump is discarded instead of overwriting it.
    pub(crate) series_generation: Arc<AtomicU64>,
    followups: Arc<AtomicBool>,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService").field("store", &self.store).finish_non_exhaustive()
    }
}

impl CacheService {
    /// Loads the list, tag snapshot, series cache and favorites from disk.
    /// No remote call is made; the shell follows up with [`CacheService::sync`].
    pub fn open(config: CacheConfig, remote: Arc<dyn RemoteStore>) -> AppResult<Self> {
        let store = LocalCacheStore::new(config)?;
        let settings = config::load_settings(store.config());

        let records = store.load();
        let mut tag_counts = store.load_tag_snapshot();
        if tag_counts.is_empty() && !records.is_empty() {
            tag_counts = tags::compute(&records);
        }
        let state = CacheState {
            tags: tag_counts,
            series: store.load_series(),
            favorites: store.load_favorites(),
            records,
        };
        tracing::info!(
            records = state.records.len(),
            chapters = state.series.len(),
            "cache service opened"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            remote,
            store,
            settings: Arc::new(RwLock::new(settings)),
            state: Arc::new(Mutex::new(state)),
            events,
            series_generation: Arc::new(AtomicU64::new(0)),
            followups: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn set_background_followups(&self, enabled: bool) {
        self.followups.store(enabled, Ordering::SeqCst);
    }

    pub fn settings(&self) -> AppResult<CacheSettings> {
        self.settings
            .read()
            .map(|settings| settings.clone())
            .map_err(|_| AppError::Internal("settings lock poisoned".to_string()))
    }

    pub fn update_settings(&self, patch: Value) -> AppResult<CacheSettings> {
        let updated = config::update_settings(self.store.config(), patch)?;
        let mut settings = self
            .settings
            .write()
            .map_err(|_| AppError::Internal("settings lock poisoned".to_string()))?;
        *settings = updated.clone();
        Ok(updated)
    }

    pub fn records(&self) -> AppResult<Vec<MemoRecord>> {
        Ok(self.lock_state()?.records.clone())
    }

    pub fn record(&self, id: &str) -> AppResult<Option<MemoRecord>> {
        Ok(self.lock_state()?.record(id).cloned())
    }

    pub fn tags(&self) -> AppResult<TagCounts> {
        Ok(self.lock_state()?.tags.clone())
    }

    pub fn series(&self) -> AppResult<SeriesMap> {
        Ok(self.lock_state()?.series.clone())
    }

    pub fn series_link(&self, chapter_id: &str) -> AppResult<Option<SeriesLink>> {
        Ok(self.lock_state()?.series.get(chapter_id).cloned())
    }

    pub fn chapter_parent(&self, chapter_id: &str) -> AppResult<Option<ChapterParent>> {
        let state = self.lock_state()?;
        Ok(series::chapter_parent(&state.series, &state.records, chapter_id))
    }

    pub fn filter_by_title(&self, query: &str) -> AppResult<Vec<MemoRecord>> {
        let needle = query.trim().to_lowercase();
        let state = self.lock_state()?;
        Ok(state
            .records
            .iter()
            .filter(|record| needle.is_empty() || record.title.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    pub fn records_with_tag(&self, tag: &str) -> AppResult<Vec<MemoRecord>> {
        Ok(tags::records_with_tag(&self.lock_state()?.records, tag))
    }

    pub fn favorites(&self) -> AppResult<Vec<String>> {
        Ok(self.lock_state()?.favorites.clone())
    }

    pub fn toggle_favorite(&self, id: &str) -> AppResult<bool> {
        let mut state = self.lock_state()?;
        if state.record(id).is_none() {
            return Err(AppError::NotFound(format!("memo {}", id)));
        }
        let now_favorite = match state.favorites.iter().position(|fav| fav == id) {
            Some(index) => {
                state.favorites.remove(index);
                false
            }
            None => {
                state.favorites.push(id.to_string());
                true
            }
        };
        self.store.save_favorites(&state.favorites)?;
        Ok(now_favorite)
    }

    pub async fn load_content(&self, id: &str, kind: ContentKind) -> AppResult<String> {
        let id = id.to_string();
        self.run_blocking(move |service| service.load_content_inner(&id, kind))
            .await
    }

    pub async fn sync(&self) -> AppResult<SyncReport> {
        self.run_blocking(|service| service.sync_inner()).await
    }

    pub async fn rebuild_series(&self) -> AppResult<usize> {
        self.run_blocking(|service| service.rebuild_series_inner()).await
    }

    pub async fn save_memo(&self, title: &str, body: &str, tags: &str) -> AppResult<String> {
        let (title, body, tags) = (title.to_string(), body.to_string(), tags.to_string());
        self.run_blocking(move |service| service.save_memo_inner(&title, &body, &tags))
            .await
    }

    pub async fn update_memo(&self, id: &str, title: &str, body: &str, tags: &str) -> AppResult<()> {
        let (id, title, body, tags) = (id.to_string(), title.to_string(), body.to_string(), tags.to_string());
        self.run_blocking(move |service| service.update_memo_inner(&id, &title, &body, &tags))
            .await
    }

    pub async fn delete_memo(&self, id: &str) -> AppResult<()> {
        let id = id.to_string();
        self.run_blocking(move |service| service.delete_memo_inner(&id)).await
    }

    pub async fn backlinks(&self, id: &str) -> AppResult<Vec<MemoRecord>> {
        let id = id.to_string();
        self.run_blocking(move |service| {
            let records = service.records()?;
            Ok(series::backlinks(&records, &id, |record| {
                service.store.get_content(&record.id, ContentKind::Text)
            }))
        })
        .await
    }

    pub fn start_background_sync(&self) -> AppResult<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| AppError::Internal(format!("background sync needs a tokio runtime: {}", error)))?;
        let seconds = self.settings()?.sync_interval_seconds.max(1);
        let service = self.clone();
        Ok(runtime.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(seconds));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(error) = service.sync().await {
                    tracing::warn!(error = %error, "periodic sync failed");
                }
            }
        }))
    }

    pub(crate) async fn run_blocking<T, F>(&self, job: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(CacheService) -> AppResult<T> + Send + 'static,
    {
        let service = self.clone();
        tokio::task::spawn_blocking(move || job(service)).await?
    }

    pub(crate) fn lock_state(&self) -> AppResult<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("cache state mutex poisoned".to_string()))
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_status(&self, status: StatusMessage) {
        self.emit(CacheEvent::Status(status));
    }

    pub(crate) fn now_timestamp() -> String {
        chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
    }

    // Persists the list, recomputes tags and notifies subscribers. Disk
    // failures are logged; the in-memory list stays authoritative.
    pub(crate) fn commit_records(&self, state: &mut CacheState) {
        if let Err(error) = self.store.save(&state.records) {
            tracing::warn!(error = %error, "failed to persist memo list");
        }
        state.tags = tags::compute(&state.records);
        if let Err(error) = self.store.save_tag_snapshot(&state.tags) {
            tracing::warn!(error = %error, "failed to persist tag snapshot");
        }
        self.emit(CacheEvent::ListUpdated(state.records.clone()));
        self.emit(CacheEvent::TagsUpdated(state.tags.clone()));
    }

    pub(crate) fn commit_series(&self, state: &CacheState) {
        if let Err(error) = self.store.save_series(&state.series) {
            tracing::warn!(error = %error, "failed to persist series cache");
        }
        self.emit(CacheEvent::SeriesUpdated {
            chapter_count: state.series.len(),
        });
    }

    pub(crate) fn prune_id(&self, state: &mut CacheState, id: &str) {
        if let Err(error) = self.store.invalidate_content(id) {
            tracing::warn!(id, error = %error, "failed to prune content cache");
        }
        let before = state.favorites.len();
        state.favorites.retain(|fav| fav != id);
        if state.favorites.len() != before {
            if let Err(error) = self.store.save_favorites(&state.favorites) {
                tracing::warn!(id, error = %error, "failed to persist favorites");
            }
        }
        series::unlink_chapter(&mut state.series, id);
        series::drop_moc(&mut state.series, id);
    }

    pub(crate) fn invalidate(&self, id: &str) {
        if let Err(error) = self.store.invalidate_content(id) {
            tracing::warn!(id, error = %error, "failed to invalidate content cache");
        }
    }

    pub(crate) fn schedule_sync(&self) {
        self.spawn_followup("sync", |service| service.sync_inner().map(|_| ()));
    }

    pub(crate) fn schedule_rebuild(&self) {
        self.spawn_followup("series rebuild", |service| service.rebuild_series_inner().map(|_| ()));
    }

    fn spawn_followup(&self, what: &'static str, job: fn(&CacheService) -> AppResult<()>) {
        if !self.followups.load(Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(task = what, "no runtime available; follow-up skipped");
            return;
        };
        let service = self.clone();
        handle.spawn_blocking(move || {
            if let Err(error) = job(&service) {
                tracing::warn!(task = what, error = %error, "background follow-up failed");
            }
        });
    }

    pub(crate) fn text_body(&self, record: &MemoRecord) -> Option<String> {
        if let Some(body) = self.store.get_content(&record.id, ContentKind::Text) {
            return Some(body);
        }
        match self.remote.load_content(&record.id, ContentKind::Text) {
            Ok(document) => {
                if let Err(error) = self.store.put_content(&record.id, ContentKind::Text, &document.body) {
                    tracing::warn!(id = %record.id, error = %error, "failed to cache fetched body");
                }
                Some(document.body)
            }
            Err(error) => {
                tracing::warn!(id = %record.id, error = %error, "failed to fetch body");
                None
            }
        }
    }

    fn load_content_inner(&self, id: &str, kind: ContentKind) -> AppResult<String> {
        if let Some(artifact) = self.store.get_content(id, kind) {
            return Ok(artifact);
        }
        let document = self.remote.load_content(id, kind).inspect_err(|error| {
            tracing::warn!(id, kind = kind.as_str(), error = %error, "content load failed");
            self.emit_status(StatusMessage::error("Failed to load memo"));
        })?;
        if let Err(error) = self.store.put_content(id, kind, &document.body) {
            tracing::warn!(id, kind = kind.as_str(), error = %error, "failed to cache content");
        }
        Ok(document.body)
    }

    /// Ids among `rows` and the local list whose document is confirmed gone.
    /// A failing existence call counts as "exists".
    fn missing_ids(&self, rows: &[MemoRecord]) -> AppResult<HashSet<String>> {
        let local_ids: Vec<String> = self
            .lock_state()?
            .records
            .iter()
            .map(|record| record.id.clone())
            .collect();

        let mut seen = HashSet::new();
        let mut missing = HashSet::new();
        let candidates = rows
            .iter()
            .map(|row| row.id.as_str())
            .chain(local_ids.iter().map(String::as_str));
        for id in candidates {
            if id.trim().is_empty() || !seen.insert(id) {
                continue;
            }
            match self.remote.exists(id) {
                Ok(true) => {}
                Ok(false) => {
                    missing.insert(id.to_string());
                }
                Err(error) => {
                    tracing::warn!(id, error = %error, "existence check failed; keeping row");
                }
            }
        }
        Ok(missing)
    }

    pub(crate) fn sync_inner(&self) -> AppResult<SyncReport> {
        let rows = match self.remote.list_memos() {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(error = %error, "memo list fetch failed; local cache untouched");
                self.emit_status(StatusMessage::error("Sync failed"));
                return Err(error);
            }
        };

        // Remote round-trips happen outside the lock. Records inserted while
        // they run were never checked and count as existing.
        let missing = if self.settings()?.verify_existence {
            self.missing_ids(&rows)?
        } else {
            HashSet::new()
        };

        let (report, needs_rebuild) = {
            let mut state = self.lock_state()?;
            let Reconciliation {
                records,
                changed,
                stale_ids,
                removed_ids,
                dropped_missing,
                preserved_orphans,
            } = reconcile::reconcile(rows, &state.records, |id| !missing.contains(id));

            let mut invalidated_ids = Vec::new();
            if changed {
                state.records = records;
                for id in stale_ids {
                    self.invalidate(&id);
                    invalidated_ids.push(id);
                }
                for id in removed_ids {
                    self.prune_id(&mut state, &id);
                    invalidated_ids.push(id);
                }
                self.commit_records(&mut state);
            }

            let needs_rebuild = changed || (state.series.is_empty() && state.records.iter().any(MemoRecord::is_moc));
            let report = SyncReport {
                changed,
                record_count: state.records.len(),
                dropped_missing,
                preserved_orphans,
                invalidated_ids,
            };
            (report, needs_rebuild)
        };

        tracing::info!(
            changed = report.changed,
            records = report.record_count,
            dropped_missing = report.dropped_missing,
            preserved_orphans = report.preserved_orphans,
            invalidated = report.invalidated_ids.len(),
            "sync reconciled"
        );
        if needs_rebuild {
            self.rebuild_series_inner()?;
        }
        Ok(report)
    }

    pub(crate) fn rebuild_series_inner(&self) -> AppResult<usize> {
        let generation = self.series_generation.load(Ordering::SeqCst);
        let records = self.records()?;
        let rebuilt = series::rebuild(&records, |moc| self.text_body(moc));

        let mut state = self.lock_state()?;
        if self.series_generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("series changed during rebuild; discarding stale result");
            return Ok(state.series.len());
        }
        state.series = rebuilt;
        self.commit_series(&state);
        tracing::info!(chapters = state.series.len(), "series graph rebuilt");
        Ok(state.series.len())
    }

    fn save_memo_inner(&self, title: &str, body: &str, tags: &str) -> AppResult<String> {
        if title.trim().is_empty() || body.trim().is_empty() {
            return Err(AppError::Invalid("title and body are required".to_string()));
        }
        let id = self.remote.save(title, body, tags).inspect_err(|error| {
            tracing::warn!(error = %error, "memo save failed");
            self.emit_status(StatusMessage::error("Save failed"));
        })?;

        let record = MemoRecord::new(title, Self::now_timestamp(), id.clone(), tags);
        let is_moc = record.is_moc();
        {
            let mut state = self.lock_state()?;
            if state.insert_head(record) {
                self.commit_records(&mut state);
            }
        }
        if let Err(error) = self.store.put_content(&id, ContentKind::Text, body) {
            tracing::warn!(id = %id, error = %error, "failed to cache saved body");
        }
        self.emit_status(StatusMessage::info("Saved", 2_000));
        tracing::info!(id = %id, "memo saved");

        if is_moc {
            self.schedule_rebuild();
        }
        self.schedule_sync();
        Ok(id)
    }

    fn update_memo_inner(&self, id: &str, title: &str, body: &str, tags: &str) -> AppResult<()> {
        if title.trim().is_empty() {
            return Err(AppError::Invalid("title is required".to_string()));
        }
        self.remote.update(id, title, body, tags).inspect_err(|error| {
            tracing::warn!(id, error = %error, "memo update failed");
            self.emit_status(StatusMessage::error("Update failed"));
        })?;

        {
            let mut state = self.lock_state()?;
            if let Some(record) = state.records.iter_mut().find(|record| record.id == id) {
                record.title = title.to_string();
                record.tags = tags.to_string();
                record.modified_at = Self::now_timestamp();
            }
            self.invalidate(id);
            self.commit_records(&mut state);
        }
        tracing::info!(id, "memo updated");
        self.schedule_sync();
        Ok(())
    }

    fn delete_memo_inner(&self, id: &str) -> AppResult<()> {
        match self.remote.delete(id) {
            Ok(()) => {}
            Err(AppError::NotFound(detail)) => {
                tracing::warn!(id, detail = %detail, "remote document already gone");
            }
            Err(error) => {
                tracing::warn!(id, error = %error, "memo delete failed");
                self.emit_status(StatusMessage::error("Delete failed"));
                return Err(error);
            }
        }

        {
            let mut state = self.lock_state()?;
            state.remove(id);
            self.prune_id(&mut state, id);
            self.series_generation.fetch_add(1, Ordering::SeqCst);
            self.commit_series(&state);
            self.commit_records(&mut state);
        }
        tracing::info!(id, "memo deleted");
        self.schedule_sync();
        Ok(())
    }
}
