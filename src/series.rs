use crate::models::{ChapterParent, MemoRecord, SeriesLink, SeriesMap};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

static WIKI_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[(.+?)\]\]").expect("valid wiki link regex"));

pub fn extract_links(body: &str) -> Vec<&str> {
    WIKI_LINK_RE
        .captures_iter(body)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|title| !title.is_empty())
        .collect()
}

// Title to id lookup. With duplicate titles the later record wins.
pub fn title_index(records: &[MemoRecord]) -> HashMap<&str, &str> {
    records
        .iter()
        .map(|record| (record.title.as_str(), record.id.as_str()))
        .collect()
}

pub fn resolve_chain(body: &str, moc_id: &str, titles: &HashMap<&str, &str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut chain = Vec::new();
    for title in extract_links(body) {
        let Some(id) = titles.get(title) else {
            tracing::debug!(moc_id, title, "unresolved wiki link skipped");
            continue;
        };
        if *id == moc_id || !seen.insert(*id) {
            continue;
        }
        chain.push((*id).to_string());
    }
    chain
}

// Rebuilds the full chapter graph from the records and MOC bodies.
// A MOC whose body cannot be fetched contributes nothing. When two MOCs list
// the same chapter, the MOC that appears first in `records` keeps it.
pub fn rebuild<F>(records: &[MemoRecord], mut body_fetcher: F) -> SeriesMap
where
    F: FnMut(&MemoRecord) -> Option<String>,
{
    let titles = title_index(records);
    let mut series = SeriesMap::new();

    for moc in records.iter().filter(|record| record.is_moc()) {
        let Some(body) = body_fetcher(moc) else {
            tracing::warn!(moc_id = %moc.id, "MOC body unavailable; skipping in series rebuild");
            continue;
        };
        let chain: Vec<String> = resolve_chain(&body, &moc.id, &titles)
            .into_iter()
            .filter(|chapter_id| match series.get(chapter_id) {
                Some(existing) => {
                    tracing::warn!(
                        chapter_id = %chapter_id,
                        kept_moc = %existing.parent_moc_id,
                        ignored_moc = %moc.id,
                        "chapter listed by more than one MOC; keeping the first"
                    );
                    false
                }
                None => true,
            })
            .collect();
        link_chain(&mut series, moc, &chain);
    }

    series
}

fn link_chain(series: &mut SeriesMap, moc: &MemoRecord, chain: &[String]) {
    for (index, chapter_id) in chain.iter().enumerate() {
        let prev = index.checked_sub(1).and_then(|i| chain.get(i)).cloned();
        let next = chain.get(index + 1).cloned();
        series.insert(
            chapter_id.clone(),
            SeriesLink {
                chapter_id: chapter_id.clone(),
                parent_moc_id: moc.id.clone(),
                parent_moc_title: moc.title.clone(),
                prev_chapter_id: prev,
                next_chapter_id: next,
            },
        );
    }
}

/// Recomputes one MOC's chain from its body, as `rebuild` would for that MOC.
/// Chapters another MOC already holds stay with it; the full rebuild settles such conflicts.
pub fn relink_moc(series: &mut SeriesMap, records: &[MemoRecord], moc: &MemoRecord, body: &str) {
    drop_moc(series, &moc.id);
    let titles = title_index(records);
    let chain: Vec<String> = resolve_chain(body, &moc.id, &titles)
        .into_iter()
        .filter(|chapter_id| !series.contains_key(chapter_id))
        .collect();
    link_chain(series, moc, &chain);
}

pub fn unlink_chapter(series: &mut SeriesMap, chapter_id: &str) -> Option<SeriesLink> {
    let removed = series.remove(chapter_id)?;
    if let Some(prev_id) = removed.prev_chapter_id.as_deref() {
        if let Some(prev) = series.get_mut(prev_id) {
            prev.next_chapter_id = removed.next_chapter_id.clone();
        }
    }
    if let Some(next_id) = removed.next_chapter_id.as_deref() {
        if let Some(next) = series.get_mut(next_id) {
            next.prev_chapter_id = removed.prev_chapter_id.clone();
        }
    }
    Some(removed)
}

pub fn drop_moc(series: &mut SeriesMap, moc_id: &str) -> usize {
    let before = series.len();
    series.retain(|_, link| link.parent_moc_id != moc_id);
    before - series.len()
}

// Parent MOC of a chapter.
// Falls back to the `"<MOC title> - "` title prefix only while the series
// cache is still empty; once populated the cache is authoritative.
pub fn chapter_parent(series: &SeriesMap, records: &[MemoRecord], chapter_id: &str) -> Option<ChapterParent> {
    if let Some(link) = series.get(chapter_id) {
        return Some(ChapterParent {
            moc_id: link.parent_moc_id.clone(),
            moc_title: link.parent_moc_title.clone(),
            inferred: false,
        });
    }
    if !series.is_empty() {
        return None;
    }

    let chapter = records.iter().find(|record| record.id == chapter_id)?;
    records
        .iter()
        .filter(|record| record.is_moc() && record.id != chapter.id)
        .filter(|moc| {
            chapter
                .title
                .strip_prefix(moc.title.as_str())
                .is_some_and(|rest| rest.starts_with(" - "))
        })
        .max_by_key(|moc| moc.title.len())
        .map(|moc| ChapterParent {
            moc_id: moc.id.clone(),
            moc_title: moc.title.clone(),
            inferred: true,
        })
}

pub fn backlinks<F>(records: &[MemoRecord], target_id: &str, mut body_of: F) -> Vec<MemoRecord>
where
    F: FnMut(&MemoRecord) -> Option<String>,
{
    let titles = title_index(records);
    records
        .iter()
        .filter(|record| record.id != target_id)
        .filter(|record| {
            body_of(*record).is_some_and(|body| {
                extract_links(&body)
                    .into_iter()
                    .any(|title| titles.get(title).is_some_and(|id| *id == target_id))
            })
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, title: &str, tags: &str) -> MemoRecord {
        MemoRecord::new(title, "2024-01-01 00:00:00", id, tags)
    }

    fn bodies(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(id, body)| (id.to_string(), body.to_string()))
            .collect()
    }

    fn sample_records() -> Vec<MemoRecord> {
        vec![
            record("moc", "Rust Book", "#moc"),
            record("c1", "Ch1", ""),
            record("c2", "Ch2", ""),
            record("c3", "Ch3", ""),
        ]
    }

    #[test]
    fn extracts_links_non_greedily_in_order() {
        let links = extract_links("see [[A]] and [[ B ]] then [[C]]]");
        assert_eq!(links, vec!["A", "B", "C"]);
    }

    #[test]
    fn ordered_list_produces_prev_next_chain() {
        let records = sample_records();
        let texts = bodies(&[("moc", "### 목록\n1. [[Ch1]]\n2. [[Ch2]]\n3. [[Ch3]]")]);
        let series = rebuild(&records, |moc| texts.get(&moc.id).cloned());

        let ch2 = series.get("c2").expect("ch2 linked");
        assert_eq!(ch2.prev_chapter_id.as_deref(), Some("c1"));
        assert_eq!(ch2.next_chapter_id.as_deref(), Some("c3"));
        assert_eq!(ch2.parent_moc_id, "moc");
        assert_eq!(ch2.parent_moc_title, "Rust Book");
        assert!(series["c1"].prev_chapter_id.is_none());
        assert!(series["c3"].next_chapter_id.is_none());
    }

    #[test]
    fn unresolved_titles_are_skipped() {
        let records = sample_records();
        let texts = bodies(&[("moc", "1. [[Ch1]]\n2. [[Nonexistent Title]]\n3. [[Ch3]]")]);
        let series = rebuild(&records, |moc| texts.get(&moc.id).cloned());

        assert_eq!(series.len(), 2);
        assert_eq!(series["c1"].next_chapter_id.as_deref(), Some("c3"));
        assert_eq!(series["c3"].prev_chapter_id.as_deref(), Some("c1"));
    }

    #[test]
    fn unavailable_moc_body_does_not_abort_other_mocs() {
        let mut records = sample_records();
        records.push(record("moc2", "Other Series", "#시리즈"));
        records.push(record("x1", "X1", ""));
        let texts = bodies(&[("moc2", "[[X1]]")]);
        let series = rebuild(&records, |moc| texts.get(&moc.id).cloned());

        assert_eq!(series.len(), 1);
        assert_eq!(series["x1"].parent_moc_id, "moc2");
    }

    #[test]
    fn first_moc_keeps_shared_chapter() {
        let mut records = sample_records();
        records.push(record("moc2", "Second", "#moc"));
        let texts = bodies(&[
            ("moc", "1. [[Ch1]]\n2. [[Ch2]]"),
            ("moc2", "1. [[Ch2]]\n2. [[Ch3]]"),
        ]);
        let series = rebuild(&records, |moc| texts.get(&moc.id).cloned());

        assert_eq!(series["c2"].parent_moc_id, "moc");
        assert_eq!(series["c2"].prev_chapter_id.as_deref(), Some("c1"));
        assert!(series["c2"].next_chapter_id.is_none());
        assert_eq!(series["c3"].parent_moc_id, "moc2");
        assert!(series["c3"].prev_chapter_id.is_none());
    }

    #[test]
    fn duplicate_titles_resolve_to_last_record() {
        let mut records = sample_records();
        records.push(record("c1-new", "Ch1", ""));
        let titles = title_index(&records);
        assert_eq!(titles.get("Ch1"), Some(&"c1-new"));
    }

    fn relink_agrees_with_rebuild(records: &[MemoRecord], before: &str, after: &str) {
        let texts = bodies(&[("moc", before)]);
        let mut patched = rebuild(records, |moc| texts.get(&moc.id).cloned());
        relink_moc(&mut patched, records, &records[0], after);

        let updated = bodies(&[("moc", after)]);
        let rebuilt = rebuild(records, |moc| updated.get(&moc.id).cloned());
        assert_eq!(patched, rebuilt);
    }

    #[test]
    fn relink_matches_rebuild_with_link_above_list() {
        let mut records = sample_records();
        records.push(record("intro", "Intro", ""));
        relink_agrees_with_rebuild(
            &records,
            "See also [[Intro]]\n\n## 목록\n1. [[Ch1]]\n",
            "See also [[Intro]]\n\n## 목록\n1. [[Ch1]]\n2. [[Ch2]]\n",
        );
    }

    #[test]
    fn relink_matches_rebuild_with_appended_list_section() {
        relink_agrees_with_rebuild(
            &sample_records(),
            "[[Ch1]]\n[[Ch2]]\n",
            "[[Ch1]]\n[[Ch2]]\n\n### 목록\n1. [[Ch3]]\n",
        );
    }

    #[test]
    fn relink_matches_rebuild_of_descending_list() {
        relink_agrees_with_rebuild(
            &sample_records(),
            "## 목록\n2. [[Ch2]]\n1. [[Ch1]]",
            "## 목록\n3. [[Ch3]]\n2. [[Ch2]]\n1. [[Ch1]]",
        );
    }

    #[test]
    fn relink_leaves_chapters_of_other_mocs_alone() {
        let mut records = sample_records();
        records.insert(0, record("first", "First", "#moc"));
        let texts = bodies(&[("first", "[[Ch1]]"), ("moc", "[[Ch2]]")]);
        let mut series = rebuild(&records, |moc| texts.get(&moc.id).cloned());

        let moc = records[1].clone();
        relink_moc(&mut series, &records, &moc, "[[Ch1]] [[Ch2]] [[Ch3]]");
        assert_eq!(series["c1"].parent_moc_id, "first");
        assert_eq!(series["c2"].next_chapter_id.as_deref(), Some("c3"));
        assert!(series["c2"].prev_chapter_id.is_none());
    }

    #[test]
    fn unlink_joins_neighbours() {
        let records = sample_records();
        let texts = bodies(&[("moc", "[[Ch1]] [[Ch2]] [[Ch3]]")]);
        let mut series = rebuild(&records, |moc| texts.get(&moc.id).cloned());

        let removed = unlink_chapter(&mut series, "c2").expect("c2 was linked");
        assert_eq!(removed.parent_moc_id, "moc");
        assert_eq!(series["c1"].next_chapter_id.as_deref(), Some("c3"));
        assert_eq!(series["c3"].prev_chapter_id.as_deref(), Some("c1"));
        assert!(unlink_chapter(&mut series, "c2").is_none());
        assert_eq!(drop_moc(&mut series, "moc"), 2);
    }

    #[test]
    fn title_prefix_heuristic_only_applies_to_empty_cache() {
        let records = vec![
            record("moc", "Rust", "#moc"),
            record("moc-long", "Rust Book", "#moc"),
            record("c1", "Rust Book - Ownership", ""),
            record("other", "Rustacean notes", ""),
        ];
        let empty = SeriesMap::new();
        let parent = chapter_parent(&empty, &records, "c1").expect("inferred parent");
        assert_eq!(parent.moc_id, "moc-long");
        assert!(parent.inferred);
        assert!(chapter_parent(&empty, &records, "other").is_none());

        let mut populated = SeriesMap::new();
        relink_moc(&mut populated, &records, &records[0], "[[Rustacean notes]]");
        assert!(chapter_parent(&populated, &records, "c1").is_none());
        let cached = chapter_parent(&populated, &records, "other").expect("cached parent");
        assert!(!cached.inferred);
    }

    #[test]
    fn backlinks_resolve_titles_to_target() {
        let records = sample_records();
        let texts = bodies(&[("moc", "[[Ch1]] [[Ch2]]"), ("c3", "see [[Ch2]]"), ("c1", "nothing")]);
        let linked = backlinks(&records, "c2", |record| texts.get(&record.id).cloned());
        let ids: Vec<&str> = linked.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["moc", "c3"]);
    }
}
