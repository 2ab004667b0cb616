use crate::models::MemoRecord;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub records: Vec<MemoRecord>,
    pub changed: bool,
    pub stale_ids: Vec<String>,
    pub removed_ids: Vec<String>,
    pub dropped_missing: usize,
    pub preserved_orphans: usize,
}

// Rows without an id are ignored and a repeated id keeps its first row.
pub fn validate_rows<F>(rows: Vec<MemoRecord>, mut exists: F) -> (Vec<MemoRecord>, usize)
where
    F: FnMut(&str) -> bool,
{
    let mut seen = HashSet::new();
    let mut dropped = 0usize;
    let mut validated = Vec::with_capacity(rows.len());
    for row in rows {
        if row.id.trim().is_empty() || !seen.insert(row.id.clone()) {
            continue;
        }
        if !exists(&row.id) {
            tracing::info!(id = %row.id, title = %row.title, "dropping metadata row for missing document");
            dropped += 1;
            continue;
        }
        validated.push(row);
    }
    (validated, dropped)
}

// Merges validated remote rows with the local list.
// Local records the remote list does not know yet are kept ahead of the
// remote rows as long as their document exists.
pub fn merge<F>(validated: Vec<MemoRecord>, local: &[MemoRecord], mut exists: F) -> Reconciliation
where
    F: FnMut(&str) -> bool,
{
    let validated_ids: HashSet<&str> = validated.iter().map(|row| row.id.as_str()).collect();
    let mut dropped_missing = 0usize;
    let orphans: Vec<MemoRecord> = local
        .iter()
        .filter(|record| !validated_ids.contains(record.id.as_str()))
        .filter(|record| {
            let keep = exists(&record.id);
            if !keep {
                dropped_missing += 1;
            }
            keep
        })
        .cloned()
        .collect();
    let preserved_orphans = orphans.len();

    let mut records = orphans;
    records.extend(validated);

    let previous: HashMap<&str, &MemoRecord> = local.iter().map(|record| (record.id.as_str(), record)).collect();
    let current_ids: HashSet<&str> = records.iter().map(|record| record.id.as_str()).collect();

    let stale_ids = records
        .iter()
        .filter(|record| {
            previous
                .get(record.id.as_str())
                .is_some_and(|old| old.modified_at != record.modified_at)
        })
        .map(|record| record.id.clone())
        .collect();
    let removed_ids = local
        .iter()
        .filter(|record| !current_ids.contains(record.id.as_str()))
        .map(|record| record.id.clone())
        .collect();

    let changed = records.as_slice() != local;
    Reconciliation {
        records,
        changed,
        stale_ids,
        removed_ids,
        dropped_missing,
        preserved_orphans,
    }
}

pub fn reconcile<F>(remote_rows: Vec<MemoRecord>, local: &[MemoRecord], mut existence_check: F) -> Reconciliation
where
    F: FnMut(&str) -> bool,
{
    let (validated, dropped) = validate_rows(remote_rows, &mut existence_check);
    let mut outcome = merge(validated, local, &mut existence_check);
    outcome.dropped_missing += dropped;
    outcome
}
