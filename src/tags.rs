use crate::models::{is_series_marker, MemoRecord, TagCounts};
use std::collections::BTreeSet;

fn tokens(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
}

pub fn extract_tags(raw: &str) -> impl Iterator<Item = &str> {
    tokens(raw)
        .filter_map(|token| token.strip_prefix('#'))
        .filter(|name| !name.is_empty())
}

pub fn compute(records: &[MemoRecord]) -> TagCounts {
    let mut counts = TagCounts::new();
    for record in records {
        let distinct: BTreeSet<&str> = extract_tags(&record.tags).collect();
        for name in distinct {
            *counts.entry(name.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

pub fn records_with_tag(records: &[MemoRecord], tag: &str) -> Vec<MemoRecord> {
    let tag = tag.strip_prefix('#').unwrap_or(tag);
    records
        .iter()
        .filter(|record| record.has_tag(tag))
        .cloned()
        .collect()
}

pub fn inherited_tags(moc_tags: &str) -> String {
    tokens(moc_tags)
        .filter(|token| !token.strip_prefix('#').is_some_and(is_series_marker))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, tags: &str) -> MemoRecord {
        MemoRecord::new(format!("title {}", id), "2024-01-01 00:00:00", id, tags)
    }

    #[test]
    fn duplicate_tokens_count_once_per_record() {
        let counts = compute(&[record("1", "#a, #b #a")]);
        assert_eq!(counts.len(), 2);
        assert_eq!(counts.get("a"), Some(&1));
        assert_eq!(counts.get("b"), Some(&1));
    }

    #[test]
    fn counts_accumulate_across_records_case_sensitively() {
        let counts = compute(&[
            record("1", "#rust,#notes"),
            record("2", "#rust plain #Rust"),
            record("3", ""),
        ]);
        assert_eq!(counts.get("rust"), Some(&2));
        assert_eq!(counts.get("Rust"), Some(&1));
        assert_eq!(counts.get("notes"), Some(&1));
        assert!(!counts.contains_key("plain"));
    }

    #[test]
    fn bare_hash_is_not_a_tag() {
        let tags: Vec<&str> = extract_tags("# #ok ,, #").collect();
        assert_eq!(tags, vec!["ok"]);
    }

    #[test]
    fn tag_filter_accepts_optional_hash() {
        let records = vec![record("1", "#a"), record("2", "#b"), record("3", "#a #b")];
        let with_a = records_with_tag(&records, "#a");
        assert_eq!(with_a.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["1", "3"]);
        assert_eq!(records_with_tag(&records, "b").len(), 2);
    }

    #[test]
    fn inherited_tags_drop_series_markers() {
        assert_eq!(inherited_tags("#moc, #study #시리즈 #MOC"), "#study");
        assert_eq!(inherited_tags("#시리즈"), "");
    }
}
