//! Storage and replication collaborators.
//!
//! # Data Flow
//! ```text
//! handlers ──▶ DatabaseManager ──▶ Database (documents, revisions, changes)
//!                                      │
//!                                      ├── changes_since(seq)      (backlog)
//!                                      └── subscribe() ──▶ DatabaseChange stream (commit order)
//!
//! POST /_replicate ──▶ Replicator ──▶ ReplicationSession (outcome future)
//! ```
//!
//! # Design Decisions
//! - Collaborators are synchronous; only the change stream is async
//! - The listener only ever sees these traits; `memory` is the bundled implementation

pub mod memory;
pub mod replication;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, oneshot};

use crate::error::{ListenerError, ListenerResult};

pub use memory::{MemoryDatabase, MemoryStore};
pub use replication::MemoryReplicator;

/// Database sequence number.
pub type Sequence = u64;

/// Parameters handed to a filter (every query parameter of the request).
pub type FilterParams = HashMap<String, String>;

/// A stored attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub content_type: String,
    pub data: Bytes,
    pub digest: String,
    pub revpos: u64,
}

impl Attachment {
    pub fn new(content_type: impl Into<String>, data: Bytes, revpos: u64) -> Self {
        let digest = format!("md5-{}", BASE64.encode(md5::compute(&data).0));
        Self {
            content_type: content_type.into(),
            data,
            digest,
            revpos,
        }
    }

    /// Metadata-only representation.
    pub fn stub_json(&self) -> Value {
        json!({
            "content_type": self.content_type,
            "digest": self.digest,
            "length": self.data.len(),
            "revpos": self.revpos,
            "stub": true,
        })
    }

    /// Representation with base64 data inline.
    pub fn inline_json(&self) -> Value {
        json!({
            "content_type": self.content_type,
            "digest": self.digest,
            "length": self.data.len(),
            "revpos": self.revpos,
            "data": BASE64.encode(&self.data),
        })
    }

    /// Representation for multipart replies, where data follows in its own part.
    pub fn follows_json(&self) -> Value {
        json!({
            "content_type": self.content_type,
            "digest": self.digest,
            "length": self.data.len(),
            "revpos": self.revpos,
            "follows": true,
        })
    }
}

/// How attachments are rendered in a document body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentStyle {
    Stub,
    Inline,
    Follows,
}

/// One revision of a document.
#[derive(Debug, Clone)]
pub struct Revision {
    pub doc_id: String,
    pub rev_id: String,
    pub sequence: Sequence,
    pub deleted: bool,
    /// User properties, without `_`-prefixed metadata.
    pub properties: Map<String, Value>,
    pub attachments: BTreeMap<String, Attachment>,
}

impl Revision {
    pub fn generation(&self) -> u64 {
        parse_generation(&self.rev_id).unwrap_or(0)
    }

    /// Document body with stub attachments.
    pub fn to_json(&self) -> Value {
        self.to_json_with(AttachmentStyle::Stub)
    }

    /// Document body with the given attachment rendering.
    pub fn to_json_with(&self, style: AttachmentStyle) -> Value {
        let mut doc = Map::new();
        doc.insert("_id".to_string(), Value::String(self.doc_id.clone()));
        doc.insert("_rev".to_string(), Value::String(self.rev_id.clone()));
        if self.deleted {
            doc.insert("_deleted".to_string(), Value::Bool(true));
        }
        for (k, v) in &self.properties {
            doc.insert(k.clone(), v.clone());
        }
        if !self.attachments.is_empty() {
            let atts: Map<String, Value> = self
                .attachments
                .iter()
                .map(|(name, att)| {
                    let rendered = match style {
                        AttachmentStyle::Stub => att.stub_json(),
                        AttachmentStyle::Inline => att.inline_json(),
                        AttachmentStyle::Follows => att.follows_json(),
                    };
                    (name.clone(), rendered)
                })
                .collect();
            doc.insert("_attachments".to_string(), Value::Object(atts));
        }
        Value::Object(doc)
    }
}

/// Generation prefix of a revision id (`3-abc` → 3).
pub fn parse_generation(rev_id: &str) -> Option<u64> {
    rev_id.split_once('-').and_then(|(g, _)| g.parse().ok())
}

/// A revision committed to a database, in commit order.
#[derive(Debug, Clone)]
pub struct DatabaseChange {
    pub revision: Revision,
    /// The added revision is now the document's winning revision.
    pub winning: bool,
}

/// A parsed document write.
#[derive(Debug, Clone, Default)]
pub struct DocumentUpdate {
    pub id: Option<String>,
    pub rev: Option<String>,
    pub deleted: bool,
    pub properties: Map<String, Value>,
    /// Raw `_attachments` object: stubs refer to the parent, `data` is base64.
    pub attachments: Option<Map<String, Value>>,
    /// Revision history from `_revisions`, newest first.
    pub history: Option<Vec<String>>,
}

impl DocumentUpdate {
    /// Split a JSON document into metadata and user properties.
    pub fn from_json(body: Value) -> ListenerResult<Self> {
        let Value::Object(map) = body else {
            return Err(ListenerError::BadRequest(
                "document must be a JSON object".to_string(),
            ));
        };

        let mut update = DocumentUpdate::default();
        for (key, value) in map {
            match key.as_str() {
                "_id" => update.id = value.as_str().map(str::to_string),
                "_rev" => update.rev = value.as_str().map(str::to_string),
                "_deleted" => update.deleted = value.as_bool().unwrap_or(false),
                "_attachments" => update.attachments = value.as_object().cloned(),
                "_revisions" => update.history = parse_revisions(&value),
                k if k.starts_with('_') => {}
                _ => {
                    update.properties.insert(key, value);
                }
            }
        }
        Ok(update)
    }

    /// Update for a deletion.
    pub fn deletion(rev: Option<String>) -> Self {
        Self {
            rev,
            deleted: true,
            ..Default::default()
        }
    }
}

/// `{"start": N, "ids": [...]}` → full revision ids, newest first.
fn parse_revisions(value: &Value) -> Option<Vec<String>> {
    let start = value.get("start")?.as_u64()?;
    let ids = value.get("ids")?.as_array()?;
    Some(
        ids.iter()
            .enumerate()
            .filter_map(|(i, id)| {
                let generation = start.checked_sub(i as u64)?;
                id.as_str().map(|digest| format!("{}-{}", generation, digest))
            })
            .collect(),
    )
}

/// Decide whether a revision passes a named filter.
pub trait ChangeFilter: Send + Sync {
    fn accepts(&self, revision: &Revision, params: &FilterParams) -> bool;
}

impl<F> ChangeFilter for F
where
    F: Fn(&Revision, &FilterParams) -> bool + Send + Sync,
{
    fn accepts(&self, revision: &Revision, params: &FilterParams) -> bool {
        self(revision, params)
    }
}

/// One database.
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    /// `{db_name, doc_count, update_seq, ...}`.
    fn info(&self) -> Value;

    fn last_sequence(&self) -> Sequence;

    fn document_count(&self) -> usize;

    /// Winning revision, or a specific one. A deleted winner is `Deleted`.
    fn get_document(&self, doc_id: &str, rev: Option<&str>) -> ListenerResult<Revision>;

    /// All leaf revisions, winner first.
    fn leaf_revisions(&self, doc_id: &str) -> Vec<Revision>;

    /// Revision ids from `rev_id` back to the root.
    fn revision_history(&self, doc_id: &str, rev_id: &str) -> Vec<String>;

    /// Create a child revision.
    fn put_document(&self, doc_id: &str, update: DocumentUpdate) -> ListenerResult<Revision>;

    /// Insert a revision with a known id and history (`new_edits=false`).
    fn force_insert(&self, doc_id: &str, update: DocumentUpdate) -> ListenerResult<()>;

    /// Revisions committed after `since`, in sequence order. Without
    /// conflicts only winning revisions are returned.
    fn changes_since(&self, since: Sequence, include_conflicts: bool) -> Vec<Revision>;

    /// Receive every future commit.
    fn subscribe(&self) -> broadcast::Receiver<DatabaseChange>;

    /// Named change filter.
    fn filter(&self, name: &str) -> Option<Arc<dyn ChangeFilter>>;

    /// Winning, non-deleted revisions ordered by document id.
    fn all_documents(&self) -> Vec<Revision>;

    /// For each document, the listed revisions this database lacks.
    fn revs_diff(&self, revs: &BTreeMap<String, Vec<String>>) -> BTreeMap<String, Vec<String>>;

    /// Drop the bodies of revisions that are no longer leaves.
    fn compact(&self) -> ListenerResult<()>;

    /// Permanently remove the listed revisions, with any ancestors no
    /// surviving leaf needs. `*` removes the whole document. Returns the
    /// revisions removed per document; unknown documents are skipped.
    fn purge(
        &self,
        revs: &BTreeMap<String, Vec<String>>,
    ) -> ListenerResult<BTreeMap<String, Vec<String>>>;

    fn get_attachment(
        &self,
        doc_id: &str,
        name: &str,
        rev: Option<&str>,
    ) -> ListenerResult<(Revision, Attachment)>;

    fn put_attachment(
        &self,
        doc_id: &str,
        name: &str,
        content_type: &str,
        data: Bytes,
        prev_rev: Option<&str>,
    ) -> ListenerResult<Revision>;

    fn delete_attachment(
        &self,
        doc_id: &str,
        name: &str,
        prev_rev: Option<&str>,
    ) -> ListenerResult<Revision>;

    /// `_local` documents live outside the sequence.
    fn get_local(&self, doc_id: &str) -> ListenerResult<Value>;

    fn put_local(&self, doc_id: &str, body: Value, prev_rev: Option<&str>) -> ListenerResult<String>;

    fn delete_local(&self, doc_id: &str, prev_rev: Option<&str>) -> ListenerResult<String>;
}

/// Owner of all databases.
pub trait DatabaseManager: Send + Sync {
    fn database_names(&self) -> Vec<String>;

    /// Existing database, or `NotFound("no_db_file")`.
    fn database(&self, name: &str) -> ListenerResult<Arc<dyn Database>>;

    /// New database. Existing → `PreconditionFailed`, bad name → `BadId`.
    fn create_database(&self, name: &str) -> ListenerResult<Arc<dyn Database>>;

    fn delete_database(&self, name: &str) -> ListenerResult<()>;
}

/// CouchDB database name rule: lowercase letter first, then `[a-z0-9_$()+/-]`.
pub fn is_valid_database_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_$()+-/".contains(c))
}

/// Body of `POST /_replicate`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplicationRequest {
    pub source: String,
    pub target: String,
    pub continuous: bool,
    pub create_target: bool,
    pub cancel: bool,
    #[serde(rename = "async")]
    pub run_async: bool,
    pub filter: Option<String>,
    pub query_params: HashMap<String, String>,
    pub doc_ids: Option<Vec<String>>,
}

/// Totals reported when a one-shot replication finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    pub docs_read: u64,
    pub docs_written: u64,
}

/// A started replication.
#[derive(Debug)]
pub struct ReplicationSession {
    pub session_id: String,
    pub continuous: bool,
    /// Resolves when a one-shot replication ends. Never resolves for
    /// continuous ones until they are cancelled.
    pub outcome: oneshot::Receiver<ListenerResult<ReplicationStats>>,
}

/// Replication engine.
pub trait Replicator: Send + Sync {
    fn start(&self, request: &ReplicationRequest) -> ListenerResult<ReplicationSession>;

    /// Stop the replication matching `request`'s source and target.
    fn cancel(&self, request: &ReplicationRequest) -> ListenerResult<()>;

    fn active_sessions(&self) -> Vec<String>;
}
