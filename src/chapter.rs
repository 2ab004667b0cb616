use crate::errors::{AppError, AppResult};
use crate::models::{ContentKind, MemoRecord, StatusMessage};
use crate::series;
use crate::service::{CacheService, CacheState};
use crate::tags;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::Ordering;

static LIST_HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*#{2,4}\s*목록\s*#*\s*$").expect("valid list heading regex"));
static LIST_ENTRY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\.\s*\[\[(.+?)\]\]").expect("valid list entry regex"));
static SECTION_END_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*#{1,6}\s").expect("valid heading regex"));

pub fn chapter_title(moc_title: &str, new_title: &str) -> String {
    format!("{} - {}", moc_title, new_title)
}

pub fn seed_body(moc_title: &str) -> String {
    format!("상위 문서: [[{}]]\n\n", moc_title)
}

fn list_section(lines: &[&str]) -> Option<(usize, usize)> {
    let heading = lines.iter().position(|line| LIST_HEADING_RE.is_match(line))?;
    let start = heading + 1;
    let end = lines[start..]
        .iter()
        .position(|line| SECTION_END_RE.is_match(line))
        .map_or(lines.len(), |offset| start + offset);
    Some((start, end))
}

// (line index, ordinal) of each numbered entry in `[start, end)`.
fn entries_in(lines: &[&str], start: usize, end: usize) -> Vec<(usize, u64)> {
    (start..end)
        .filter_map(|i| {
            let caps = LIST_ENTRY_RE.captures(lines[i])?;
            let number = caps.get(1)?.as_str().parse().unwrap_or(0);
            Some((i, number))
        })
        .collect()
}

fn is_descending(entries: &[(usize, u64)]) -> bool {
    match (entries.first(), entries.last()) {
        (Some((_, first)), Some((_, last))) => first > last,
        _ => false,
    }
}

// Adds `N. [[title]]` to the list section, N being one past the entry count.
// Descending lists get the entry on top, all others at the bottom. A body
// without a list section gets one appended.
pub fn insert_chapter_entry(body: &str, title: &str) -> String {
    let mut lines: Vec<&str> = body.split('\n').collect();
    let Some((start, end)) = list_section(&lines) else {
        let trimmed = body.trim_end();
        let section = format!("### 목록\n1. [[{}]]\n", title);
        return if trimmed.is_empty() {
            section
        } else {
            format!("{}\n\n{}", trimmed, section)
        };
    };

    let entries = entries_in(&lines, start, end);
    let entry = format!("{}. [[{}]]", entries.len() + 1, title);
    let position = if is_descending(&entries) {
        entries.first().map_or(start, |(i, _)| *i)
    } else {
        entries.last().map_or(start, |(i, _)| *i + 1)
    };
    lines.insert(position, &entry);
    lines.join("\n")
}

pub fn remove_chapter_entry(body: &str, title: &str) -> Option<String> {
    let mut lines: Vec<String> = body.split('\n').map(str::to_string).collect();
    let borrowed: Vec<&str> = lines.iter().map(String::as_str).collect();
    let (start, end) = list_section(&borrowed).unwrap_or((0, borrowed.len()));

    let entries = entries_in(&borrowed, start, end);
    let target = entries.iter().position(|(i, _)| {
        LIST_ENTRY_RE
            .captures(borrowed[*i])
            .and_then(|caps| caps.get(2))
            .is_some_and(|m| m.as_str().trim() == title)
    })?;
    let descending = is_descending(&entries);
    drop(borrowed);

    let removed_line = entries[target].0;
    let remaining: Vec<usize> = entries
        .iter()
        .map(|(i, _)| *i)
        .filter(|i| *i != removed_line)
        .collect();
    let count = remaining.len();
    for (rank, index) in remaining.into_iter().enumerate() {
        let number = if descending { count - rank } else { rank + 1 };
        lines[index] = renumber(&lines[index], number);
    }
    lines.remove(removed_line);
    Some(lines.join("\n"))
}

fn renumber(line: &str, number: usize) -> String {
    match LIST_ENTRY_RE.captures(line).and_then(|caps| caps.get(1)) {
        Some(digits) => format!("{}{}{}", &line[..digits.start()], number, &line[digits.end()..]),
        None => line.to_string(),
    }
}

impl CacheService {
    /// Creates `"<moc title> - <new_title>"` and lists it in the MOC.
    /// Only the remote create is a hard prerequisite. If linking fails the
    /// chapter is still recorded locally and `LINK_UPDATE_FAILED` is returned.
    pub async fn add_chapter(&self, moc_id: &str, new_title: &str) -> AppResult<String> {
        let (moc_id, new_title) = (moc_id.to_string(), new_title.to_string());
        self.run_blocking(move |service| service.add_chapter_inner(&moc_id, &new_title))
            .await
    }

    pub async fn delete_chapter(&self, chapter_id: &str) -> AppResult<()> {
        let chapter_id = chapter_id.to_string();
        self.run_blocking(move |service| service.delete_chapter_inner(&chapter_id))
            .await
    }

    fn add_chapter_inner(&self, moc_id: &str, new_title: &str) -> AppResult<String> {
        let new_title = new_title.trim();
        if new_title.is_empty() {
            return Err(AppError::Invalid("chapter title is required".to_string()));
        }
        let moc = self
            .record(moc_id)?
            .ok_or_else(|| AppError::NotFound(format!("memo {}", moc_id)))?;
        if !moc.is_moc() {
            return Err(AppError::Invalid(format!("{} is not a MOC", moc.title)));
        }

        let full_title = chapter_title(&moc.title, new_title);
        let body = seed_body(&moc.title);
        let chapter_tags = tags::inherited_tags(&moc.tags);
        let chapter_id = self.remote.save(&full_title, &body, &chapter_tags).inspect_err(|error| {
            tracing::warn!(moc_id, error = %error, "chapter create failed");
            self.emit_status(StatusMessage::error("Failed to create chapter"));
        })?;
        tracing::info!(moc_id, chapter_id = %chapter_id, "chapter created");

        let linked = self.link_into_moc(&moc, &full_title);

        {
            let mut state = self.lock_state()?;
            let record = MemoRecord::new(full_title.as_str(), Self::now_timestamp(), chapter_id.as_str(), chapter_tags.as_str());
            if state.insert_head(record) {
                self.commit_records(&mut state);
            }
            if let Ok(moc_body) = linked.as_deref() {
                self.series_generation.fetch_add(1, Ordering::SeqCst);
                let CacheState { records, series, .. } = &mut *state;
                series::relink_moc(series, records, &moc, moc_body);
                self.commit_series(&state);
            }
        }
        if let Err(error) = self.store.put_content(&chapter_id, ContentKind::Text, &body) {
            tracing::warn!(chapter_id = %chapter_id, error = %error, "failed to cache chapter body");
        }
        self.schedule_rebuild();

        match linked {
            Ok(_) => {
                self.emit_status(StatusMessage::info(format!("Added {}", full_title), 2_000));
                Ok(chapter_id)
            }
            Err(error) => {
                tracing::warn!(moc_id, chapter_id = %chapter_id, error = %error, "chapter created but not linked");
                self.emit_status(StatusMessage::warning("Chapter created, but adding the link failed"));
                Err(AppError::LinkUpdate(format!(
                    "chapter {} created but not linked into {}: {}",
                    chapter_id, moc_id, error
                )))
            }
        }
    }

    // Reads the MOC body fresh from the remote store so a stale cache never
    // overwrites newer edits. Returns the body as written.
    fn link_into_moc(&self, moc: &MemoRecord, full_title: &str) -> AppResult<String> {
        let document = self.remote.load_content(&moc.id, ContentKind::Text)?;
        let updated = insert_chapter_entry(&document.body, full_title);
        self.remote.update(&moc.id, &document.title, &updated, &document.tags)?;
        self.invalidate(&moc.id);
        Ok(updated)
    }

    fn delete_chapter_inner(&self, chapter_id: &str) -> AppResult<()> {
        let (chapter, parent) = {
            let state = self.lock_state()?;
            let chapter = state
                .record(chapter_id)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("memo {}", chapter_id)))?;
            let parent = series::chapter_parent(&state.series, &state.records, chapter_id);
            (chapter, parent)
        };

        match self.remote.delete(chapter_id) {
            Ok(()) => {}
            Err(AppError::NotFound(detail)) => {
                tracing::warn!(chapter_id, detail = %detail, "chapter document already gone");
            }
            Err(error) => {
                tracing::warn!(chapter_id, error = %error, "chapter delete failed");
                self.emit_status(StatusMessage::error("Failed to delete chapter"));
                return Err(error);
            }
        }

        {
            let mut state = self.lock_state()?;
            state.remove(chapter_id);
            self.prune_id(&mut state, chapter_id);
            self.series_generation.fetch_add(1, Ordering::SeqCst);
            self.commit_series(&state);
            self.commit_records(&mut state);
        }
        tracing::info!(chapter_id, "chapter deleted");

        let unlinked = match parent.as_ref() {
            Some(parent) => self.unlink_from_moc(&parent.moc_id, &chapter.title),
            None => Ok(()),
        };
        self.schedule_rebuild();

        unlinked.map_err(|error| {
            tracing::warn!(chapter_id, error = %error, "chapter deleted but MOC list not updated");
            self.emit_status(StatusMessage::warning("Chapter deleted, but updating the list failed"));
            AppError::LinkUpdate(format!("chapter {} deleted but its list entry remains: {}", chapter_id, error))
        })
    }

    fn unlink_from_moc(&self, moc_id: &str, chapter_title: &str) -> AppResult<()> {
        let document = self.remote.load_content(moc_id, ContentKind::Text)?;
        let Some(updated) = remove_chapter_entry(&document.body, chapter_title) else {
            tracing::debug!(moc_id, chapter_title, "no list entry for deleted chapter");
            return Ok(());
        };
        self.remote.update(moc_id, &document.title, &updated, &document.tags)?;
        self.invalidate(moc_id);
        Ok(())
    }
}
