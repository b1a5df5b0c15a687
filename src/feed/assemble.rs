//! Change rows and result bodies.
//!
//! Row shape: `{"seq":N,"id":"...","changes":[{"rev":"..."}],"deleted":true?,"doc":{...}?}`.
//! With `style=all_docs` every leaf revision of the document is listed and
//! entries for the same document are merged into one row.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::feed::options::ChangesOptions;
use crate::store::{ChangeFilter, Database, DatabaseChange, Revision, Sequence};

/// Everything needed to turn revisions into rows for one request.
#[derive(Clone)]
pub struct FeedSource {
    db: Arc<dyn Database>,
    options: ChangesOptions,
    filter: Option<Arc<dyn ChangeFilter>>,
}

impl FeedSource {
    pub fn new(
        db: Arc<dyn Database>,
        options: ChangesOptions,
        filter: Option<Arc<dyn ChangeFilter>>,
    ) -> Self {
        Self { db, options, filter }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn options(&self) -> &ChangesOptions {
        &self.options
    }

    fn passes(&self, revision: &Revision) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |f| f.accepts(revision, &self.options.filter_params))
    }

    /// Row for a single revision.
    pub fn row(&self, revision: &Revision) -> Value {
        let mut row = Map::new();
        row.insert("seq".to_string(), json!(revision.sequence));
        row.insert("id".to_string(), json!(revision.doc_id));
        row.insert("changes".to_string(), json!([{ "rev": revision.rev_id }]));
        if revision.deleted {
            row.insert("deleted".to_string(), Value::Bool(true));
        }
        if self.options.include_docs {
            row.insert("doc".to_string(), revision.to_json());
        }
        Value::Object(row)
    }

    /// Row listing every current leaf of the revision's document.
    pub fn conflict_row(&self, revision: &Revision) -> Value {
        let leaves = self.db.leaf_revisions(&revision.doc_id);
        let winner = leaves.first().unwrap_or(revision);
        let changes: Vec<Value> = if leaves.is_empty() {
            vec![json!({ "rev": revision.rev_id })]
        } else {
            leaves.iter().map(|r| json!({ "rev": r.rev_id })).collect()
        };

        let mut row = Map::new();
        row.insert("seq".to_string(), json!(revision.sequence));
        row.insert("id".to_string(), json!(revision.doc_id));
        row.insert("changes".to_string(), Value::Array(changes));
        if winner.deleted {
            row.insert("deleted".to_string(), Value::Bool(true));
        }
        if self.options.include_docs {
            row.insert("doc".to_string(), winner.to_json());
        }
        Value::Object(row)
    }

    /// Qualifying revisions after `since`, merged per document when
    /// conflicts are requested, in sequence order.
    fn qualifying(&self, since: Sequence) -> Vec<Revision> {
        let revisions: Vec<Revision> = self
            .db
            .changes_since(since, self.options.include_conflicts)
            .into_iter()
            .filter(|r| self.passes(r))
            .collect();

        if !self.options.include_conflicts {
            return revisions;
        }

        let mut merged: Vec<Revision> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for rev in revisions {
            match index.get(&rev.doc_id) {
                Some(&i) => {
                    if rev.sequence > merged[i].sequence {
                        merged[i] = rev;
                    }
                }
                None => {
                    index.insert(rev.doc_id.clone(), merged.len());
                    merged.push(rev);
                }
            }
        }
        merged.sort_by_key(|r| r.sequence);
        merged
    }

    fn to_row(&self, revision: &Revision) -> Value {
        if self.options.include_conflicts {
            self.conflict_row(revision)
        } else {
            self.row(revision)
        }
    }

    /// Rows for a `normal`/`longpoll` reply, capped at `limit`.
    pub fn collect(&self, since: Sequence) -> (Vec<Value>, Sequence) {
        let mut revisions = self.qualifying(since);
        if let Some(limit) = self.options.limit {
            revisions.truncate(limit);
        }
        let last_seq = revisions.last().map_or(since, |r| r.sequence);
        let rows = revisions.iter().map(|r| self.to_row(r)).collect();
        (rows, last_seq)
    }

    /// Rows for a streaming feed catching up after `since`, uncapped.
    /// The returned sequence covers everything up to the moment of the call.
    pub fn catch_up(&self, since: Sequence) -> (Vec<Value>, Sequence) {
        let horizon = self.db.last_sequence();
        let revisions = self.qualifying(since);
        let last = revisions
            .last()
            .map_or(since, |r| r.sequence)
            .max(horizon)
            .max(since);
        let rows = revisions.iter().map(|r| self.to_row(r)).collect();
        (rows, last)
    }

    /// Row for a live change, or `None` if it does not qualify.
    pub fn row_for_change(&self, change: &DatabaseChange) -> Option<Value> {
        if !self.options.include_conflicts && !change.winning {
            return None;
        }
        if !self.passes(&change.revision) {
            return None;
        }
        Some(self.to_row(&change.revision))
    }
}

/// `{"results":[...],"last_seq":N}`.
pub fn results_body(rows: Vec<Value>, last_seq: Sequence) -> Value {
    json!({ "results": rows, "last_seq": last_seq })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentUpdate, FilterParams, MemoryDatabase};

    fn put(db: &MemoryDatabase, id: &str) -> Revision {
        let prev = db.get_document(id, None).ok().map(|r| r.rev_id);
        let mut update = DocumentUpdate::from_json(json!({"kind": id})).unwrap();
        update.rev = prev;
        db.put_document(id, update).unwrap()
    }

    /// Winning revisions end up at sequences 3, 5 and 9.
    fn seeded() -> Arc<MemoryDatabase> {
        let db = Arc::new(MemoryDatabase::new("db"));
        for id in ["a", "b", "c", "a", "b", "a", "a", "a", "a"] {
            put(&db, id);
        }
        db
    }

    fn source(db: Arc<MemoryDatabase>, options: ChangesOptions) -> FeedSource {
        FeedSource::new(db, options, None)
    }

    #[test]
    fn test_normal_results_since() {
        let src = source(seeded(), ChangesOptions::default());
        let (rows, last) = src.collect(3);
        let seqs: Vec<u64> = rows.iter().map(|r| r["seq"].as_u64().unwrap()).collect();
        assert_eq!(seqs, vec![5, 9]);
        assert_eq!(last, 9);

        let body = results_body(rows, last);
        assert_eq!(body["last_seq"], 9);
        assert_eq!(body["results"][0]["id"], "b");
    }

    #[test]
    fn test_limit_and_empty() {
        let options = ChangesOptions {
            limit: Some(1),
            ..Default::default()
        };
        let src = source(seeded(), options);
        let (rows, last) = src.collect(0);
        assert_eq!(rows.len(), 1);
        assert_eq!(last, 3);

        let (rows, last) = src.collect(9);
        assert!(rows.is_empty());
        assert_eq!(last, 9);
    }

    #[test]
    fn test_include_docs_and_deleted() {
        let db = Arc::new(MemoryDatabase::new("db"));
        let rev = put(&db, "gone");
        db.put_document("gone", DocumentUpdate::deletion(Some(rev.rev_id)))
            .unwrap();
        let options = ChangesOptions {
            include_docs: true,
            ..Default::default()
        };
        let (rows, _) = source(db, options).collect(0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["deleted"], true);
        assert_eq!(rows[0]["doc"]["_deleted"], true);
    }

    #[test]
    fn test_filter_applies() {
        let db = seeded();
        let filter: Arc<dyn ChangeFilter> =
            Arc::new(|rev: &Revision, params: &FilterParams| {
                params.get("only").map(String::as_str) == Some(rev.doc_id.as_str())
            });
        let mut options = ChangesOptions::default();
        options.filter_params.insert("only".into(), "c".into());
        let (rows, _) = FeedSource::new(db, options, Some(filter)).collect(0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "c");
    }

    #[test]
    fn test_conflicts_merged_into_one_row() {
        let db = Arc::new(MemoryDatabase::new("db"));
        let base = put(&db, "x");
        let suffix = base.rev_id.split_once('-').unwrap().1.to_string();
        for leaf in ["aaa", "bbb"] {
            let update = DocumentUpdate::from_json(json!({
                "_rev": format!("2-{}", leaf),
                "_revisions": {"start": 2, "ids": [leaf, suffix]},
            }))
            .unwrap();
            db.force_insert("x", update).unwrap();
        }
        put(&db, "y");

        let options = ChangesOptions {
            include_conflicts: true,
            ..Default::default()
        };
        let (rows, last) = source(db, options).collect(0);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], "x");
        assert_eq!(rows[0]["seq"], 3);
        assert_eq!(rows[0]["changes"].as_array().unwrap().len(), 2);
        assert_eq!(rows[0]["changes"][0]["rev"], "2-bbb");
        assert_eq!(last, 4);
    }

    #[test]
    fn test_live_change_winner_policy() {
        let db = seeded();
        let src = source(db.clone(), ChangesOptions::default());
        let revision = db.get_document("a", None).unwrap();

        let winning = DatabaseChange { revision: revision.clone(), winning: true };
        let losing = DatabaseChange { revision, winning: false };
        assert!(src.row_for_change(&winning).is_some());
        assert!(src.row_for_change(&losing).is_none());

        let all = source(
            db,
            ChangesOptions {
                include_conflicts: true,
                ..Default::default()
            },
        );
        assert!(all.row_for_change(&losing).is_some());
    }
}
