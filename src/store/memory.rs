//! In-memory reference store.
//!
//! Each document keeps a revision tree. The winning revision is picked from
//! the leaves: live before deleted, then highest generation, then highest id.
//! Every commit takes the next sequence number and is broadcast to
//! subscribers while the write lock is held, so subscribers see commit order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

use crate::error::{ListenerError, ListenerResult};
use crate::store::{
    is_valid_database_name, parse_generation, Attachment, ChangeFilter, Database,
    DatabaseChange, DatabaseManager, DocumentUpdate, Revision, Sequence,
};

/// Capacity of each database's change channel. Slow subscribers that fall
/// further behind see `Lagged` and backfill from `changes_since`.
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct RevNode {
    revision: Revision,
    parent: Option<String>,
    leaf: bool,
    /// Known only as an ancestor; no body.
    stub: bool,
}

#[derive(Debug, Default)]
struct DocEntry {
    revs: HashMap<String, RevNode>,
}

impl DocEntry {
    fn leaves(&self) -> Vec<&Revision> {
        let mut leaves: Vec<&Revision> = self
            .revs
            .values()
            .filter(|n| n.leaf && !n.stub)
            .map(|n| &n.revision)
            .collect();
        leaves.sort_by(|a, b| winner_order(b, a));
        leaves
    }

    fn winner(&self) -> Option<&Revision> {
        self.leaves().into_iter().next()
    }

    fn history(&self, rev_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut cursor = Some(rev_id.to_string());
        while let Some(id) = cursor {
            match self.revs.get(&id) {
                Some(node) => {
                    out.push(id);
                    cursor = node.parent.clone();
                }
                None => break,
            }
        }
        out
    }
}

/// Ordering used to choose the winning leaf (greater wins).
fn winner_order(a: &Revision, b: &Revision) -> std::cmp::Ordering {
    (!a.deleted, a.generation(), &a.rev_id).cmp(&(!b.deleted, b.generation(), &b.rev_id))
}

#[derive(Debug, Default)]
struct DbState {
    docs: BTreeMap<String, DocEntry>,
    last_seq: Sequence,
    purge_seq: u64,
    locals: HashMap<String, (String, Map<String, Value>)>,
}

/// One in-memory database.
pub struct MemoryDatabase {
    name: String,
    state: RwLock<DbState>,
    changes: RwLock<Option<broadcast::Sender<DatabaseChange>>>,
    filters: DashMap<String, Arc<dyn ChangeFilter>>,
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            state: RwLock::new(DbState::default()),
            changes: RwLock::new(Some(tx)),
            filters: DashMap::new(),
        }
    }

    /// Register a named change filter.
    pub fn register_filter(&self, name: impl Into<String>, filter: Arc<dyn ChangeFilter>) {
        self.filters.insert(name.into(), filter);
    }

    /// Close the change channel. Open subscriptions see it end.
    pub fn close(&self) {
        self.changes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn read(&self) -> RwLockReadGuard<'_, DbState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DbState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_rev_id(generation: u64) -> String {
        format!("{}-{}", generation, uuid::Uuid::new_v4().simple())
    }

    /// Assign a sequence, link into the tree and broadcast.
    fn commit(&self, state: &mut DbState, mut revision: Revision, parent: Option<String>) -> Revision {
        state.last_seq += 1;
        revision.sequence = state.last_seq;

        let entry = state.docs.entry(revision.doc_id.clone()).or_default();
        if let Some(parent_node) = parent.as_ref().and_then(|p| entry.revs.get_mut(p)) {
            parent_node.leaf = false;
        }
        entry.revs.insert(
            revision.rev_id.clone(),
            RevNode {
                revision: revision.clone(),
                parent,
                leaf: true,
                stub: false,
            },
        );

        let winning = entry
            .winner()
            .is_some_and(|w| w.rev_id == revision.rev_id);

        tracing::trace!(
            db = %self.name,
            doc_id = %revision.doc_id,
            rev = %revision.rev_id,
            seq = revision.sequence,
            "Revision committed"
        );

        if let Some(tx) = self
            .changes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            // No receivers is fine.
            let _ = tx.send(DatabaseChange {
                revision: revision.clone(),
                winning,
            });
        }
        revision
    }

    /// Resolve the parent for a new edit, enforcing MVCC rules.
    fn edit_parent(
        state: &DbState,
        doc_id: &str,
        prev_rev: Option<&str>,
        deleting: bool,
    ) -> ListenerResult<Option<Revision>> {
        let entry = state.docs.get(doc_id);
        match prev_rev {
            None => match entry.and_then(|e| e.winner()) {
                None if deleting => Err(ListenerError::missing()),
                None => Ok(None),
                Some(winner) if winner.deleted && !deleting => Ok(Some(winner.clone())),
                Some(_) => Err(ListenerError::Conflict),
            },
            Some(rev) => {
                let entry = entry.ok_or(ListenerError::Conflict)?;
                match entry.revs.get(rev) {
                    Some(node) if node.leaf && !node.stub => Ok(Some(node.revision.clone())),
                    _ => Err(ListenerError::Conflict),
                }
            }
        }
    }

    /// Build the attachment set for a child of `parent` from a raw `_attachments` object.
    fn merge_attachments(
        parent: Option<&Revision>,
        raw: Option<&Map<String, Value>>,
        generation: u64,
    ) -> ListenerResult<BTreeMap<String, Attachment>> {
        let mut out = BTreeMap::new();
        let Some(raw) = raw else {
            return Ok(out);
        };
        for (name, meta) in raw {
            if meta.get("stub").and_then(Value::as_bool).unwrap_or(false) {
                let existing = parent
                    .and_then(|p| p.attachments.get(name))
                    .ok_or_else(|| {
                        ListenerError::BadAttachment(format!("unknown attachment stub `{}`", name))
                    })?;
                out.insert(name.clone(), existing.clone());
            } else if let Some(data) = meta.get("data").and_then(Value::as_str) {
                let bytes = BASE64.decode(data).map_err(|e| {
                    ListenerError::BadAttachment(format!("invalid base64 for `{}`: {}", name, e))
                })?;
                let content_type = meta
                    .get("content_type")
                    .and_then(Value::as_str)
                    .unwrap_or("application/octet-stream");
                out.insert(
                    name.clone(),
                    Attachment::new(content_type, Bytes::from(bytes), generation),
                );
            } else {
                return Err(ListenerError::BadAttachment(format!(
                    "attachment `{}` has neither stub nor data",
                    name
                )));
            }
        }
        Ok(out)
    }
}

impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> Value {
        let state = self.read();
        let doc_count = state
            .docs
            .values()
            .filter(|d| d.winner().is_some_and(|w| !w.deleted))
            .count();
        json!({
            "db_name": self.name,
            "doc_count": doc_count,
            "update_seq": state.last_seq,
            "committed_update_seq": state.last_seq,
            "purge_seq": state.purge_seq,
            "disk_size": 0,
            "instance_start_time": 0,
            "disk_format_version": 1,
        })
    }

    fn last_sequence(&self) -> Sequence {
        self.read().last_seq
    }

    fn document_count(&self) -> usize {
        self.read()
            .docs
            .values()
            .filter(|d| d.winner().is_some_and(|w| !w.deleted))
            .count()
    }

    fn get_document(&self, doc_id: &str, rev: Option<&str>) -> ListenerResult<Revision> {
        let state = self.read();
        let entry = state.docs.get(doc_id).ok_or_else(ListenerError::missing)?;
        match rev {
            Some(rev) => entry
                .revs
                .get(rev)
                .filter(|n| !n.stub)
                .map(|n| n.revision.clone())
                .ok_or_else(ListenerError::missing),
            None => {
                let winner = entry.winner().ok_or_else(ListenerError::missing)?;
                if winner.deleted {
                    Err(ListenerError::Deleted)
                } else {
                    Ok(winner.clone())
                }
            }
        }
    }

    fn leaf_revisions(&self, doc_id: &str) -> Vec<Revision> {
        self.read()
            .docs
            .get(doc_id)
            .map(|e| e.leaves().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    fn revision_history(&self, doc_id: &str, rev_id: &str) -> Vec<String> {
        self.read()
            .docs
            .get(doc_id)
            .map(|e| e.history(rev_id))
            .unwrap_or_default()
    }

    fn put_document(&self, doc_id: &str, update: DocumentUpdate) -> ListenerResult<Revision> {
        if doc_id.is_empty() {
            return Err(ListenerError::BadId("empty document id".to_string()));
        }
        let mut state = self.write();
        let parent = Self::edit_parent(&state, doc_id, update.rev.as_deref(), update.deleted)?;
        let generation = parent.as_ref().map(|p| p.generation()).unwrap_or(0) + 1;

        let (properties, attachments) = if update.deleted {
            (Map::new(), BTreeMap::new())
        } else {
            let atts =
                Self::merge_attachments(parent.as_ref(), update.attachments.as_ref(), generation)?;
            (update.properties, atts)
        };

        let revision = Revision {
            doc_id: doc_id.to_string(),
            rev_id: Self::new_rev_id(generation),
            sequence: 0,
            deleted: update.deleted,
            properties,
            attachments,
        };
        Ok(self.commit(&mut state, revision, parent.map(|p| p.rev_id)))
    }

    fn force_insert(&self, doc_id: &str, update: DocumentUpdate) -> ListenerResult<()> {
        let history = match (update.history.clone(), update.rev.clone()) {
            (Some(history), _) if !history.is_empty() => history,
            (_, Some(rev)) => vec![rev],
            _ => {
                return Err(ListenerError::BadRequest(
                    "new_edits=false requires _rev".to_string(),
                ))
            }
        };
        let rev_id = history[0].clone();
        let generation = parse_generation(&rev_id)
            .ok_or_else(|| ListenerError::BadRequest(format!("invalid revision `{}`", rev_id)))?;

        let mut state = self.write();
        if state
            .docs
            .get(doc_id)
            .and_then(|e| e.revs.get(&rev_id))
            .is_some_and(|n| !n.stub)
        {
            return Ok(());
        }

        // Ancestors we do not know become stubs, oldest first.
        let entry = state.docs.entry(doc_id.to_string()).or_default();
        for i in (1..history.len()).rev() {
            let ancestor = &history[i];
            if !entry.revs.contains_key(ancestor) {
                let parent = history.get(i + 1).cloned();
                entry.revs.insert(
                    ancestor.clone(),
                    RevNode {
                        revision: Revision {
                            doc_id: doc_id.to_string(),
                            rev_id: ancestor.clone(),
                            sequence: 0,
                            deleted: false,
                            properties: Map::new(),
                            attachments: BTreeMap::new(),
                        },
                        parent,
                        leaf: false,
                        stub: true,
                    },
                );
            }
        }

        let parent_id = history.get(1).cloned();
        let parent_rev = parent_id
            .as_ref()
            .and_then(|p| entry.revs.get(p))
            .filter(|n| !n.stub)
            .map(|n| n.revision.clone());
        let attachments = if update.deleted {
            BTreeMap::new()
        } else {
            Self::merge_attachments(parent_rev.as_ref(), update.attachments.as_ref(), generation)
                .unwrap_or_default()
        };

        let revision = Revision {
            doc_id: doc_id.to_string(),
            rev_id,
            sequence: 0,
            deleted: update.deleted,
            properties: if update.deleted { Map::new() } else { update.properties },
            attachments,
        };
        self.commit(&mut state, revision, parent_id);
        Ok(())
    }

    fn changes_since(&self, since: Sequence, include_conflicts: bool) -> Vec<Revision> {
        let state = self.read();
        let mut out: Vec<Revision> = Vec::new();
        for entry in state.docs.values() {
            if include_conflicts {
                out.extend(
                    entry
                        .leaves()
                        .into_iter()
                        .filter(|r| r.sequence > since)
                        .cloned(),
                );
            } else if let Some(winner) = entry.winner().filter(|w| w.sequence > since) {
                out.push(winner.clone());
            }
        }
        out.sort_by_key(|r| r.sequence);
        out
    }

    fn subscribe(&self) -> broadcast::Receiver<DatabaseChange> {
        match self
            .changes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(tx) => tx.subscribe(),
            // Closed database: hand out a receiver that is already closed.
            None => broadcast::channel(1).1,
        }
    }

    fn filter(&self, name: &str) -> Option<Arc<dyn ChangeFilter>> {
        self.filters.get(name).map(|f| Arc::clone(f.value()))
    }

    fn all_documents(&self) -> Vec<Revision> {
        self.read()
            .docs
            .values()
            .filter_map(|e| e.winner().filter(|w| !w.deleted).cloned())
            .collect()
    }

    fn revs_diff(&self, revs: &BTreeMap<String, Vec<String>>) -> BTreeMap<String, Vec<String>> {
        let state = self.read();
        revs.iter()
            .filter_map(|(doc_id, rev_ids)| {
                let entry = state.docs.get(doc_id);
                let missing: Vec<String> = rev_ids
                    .iter()
                    .filter(|r| !entry.is_some_and(|e| e.revs.contains_key(*r)))
                    .cloned()
                    .collect();
                (!missing.is_empty()).then(|| (doc_id.clone(), missing))
            })
            .collect()
    }

    fn compact(&self) -> ListenerResult<()> {
        let mut state = self.write();
        let mut pruned = 0usize;
        for entry in state.docs.values_mut() {
            for node in entry.revs.values_mut().filter(|n| !n.leaf && !n.stub) {
                node.stub = true;
                node.revision.properties = Map::new();
                node.revision.attachments = BTreeMap::new();
                pruned += 1;
            }
        }
        tracing::info!(db = %self.name, pruned, "Database compacted");
        Ok(())
    }

    fn purge(
        &self,
        revs: &BTreeMap<String, Vec<String>>,
    ) -> ListenerResult<BTreeMap<String, Vec<String>>> {
        let mut state = self.write();
        let mut purged = BTreeMap::new();

        for (doc_id, rev_ids) in revs {
            let Some(entry) = state.docs.get_mut(doc_id) else {
                continue;
            };
            if rev_ids.iter().any(|r| r == "*") {
                state.docs.remove(doc_id);
                purged.insert(doc_id.clone(), vec!["*".to_string()]);
                continue;
            }

            let requested: HashSet<&str> = rev_ids.iter().map(String::as_str).collect();
            let keep: HashSet<String> = entry
                .revs
                .values()
                .filter(|n| n.leaf && !requested.contains(n.revision.rev_id.as_str()))
                .flat_map(|n| entry.history(&n.revision.rev_id))
                .collect();
            let doomed: HashSet<String> = rev_ids
                .iter()
                .filter(|r| entry.revs.contains_key(*r))
                .flat_map(|r| entry.history(r))
                .filter(|r| !keep.contains(r))
                .collect();

            entry.revs.retain(|id, _| !doomed.contains(id));
            if entry.revs.is_empty() {
                state.docs.remove(doc_id);
            }
            let removed: Vec<String> = rev_ids
                .iter()
                .filter(|r| doomed.contains(*r))
                .cloned()
                .collect();
            tracing::debug!(db = %self.name, doc_id = %doc_id, removed = doomed.len(), "Purged revisions");
            purged.insert(doc_id.clone(), removed);
        }

        if purged.values().any(|r| !r.is_empty()) {
            state.purge_seq += 1;
        }
        Ok(purged)
    }

    fn get_attachment(
        &self,
        doc_id: &str,
        name: &str,
        rev: Option<&str>,
    ) -> ListenerResult<(Revision, Attachment)> {
        let revision = self.get_document(doc_id, rev)?;
        let attachment = revision
            .attachments
            .get(name)
            .cloned()
            .ok_or_else(ListenerError::missing)?;
        Ok((revision, attachment))
    }

    fn put_attachment(
        &self,
        doc_id: &str,
        name: &str,
        content_type: &str,
        data: Bytes,
        prev_rev: Option<&str>,
    ) -> ListenerResult<Revision> {
        let mut state = self.write();
        let parent = Self::edit_parent(&state, doc_id, prev_rev, false)?;
        let generation = parent.as_ref().map(|p| p.generation()).unwrap_or(0) + 1;

        let (properties, mut attachments) = match &parent {
            Some(p) if !p.deleted => (p.properties.clone(), p.attachments.clone()),
            _ => (Map::new(), BTreeMap::new()),
        };
        attachments.insert(name.to_string(), Attachment::new(content_type, data, generation));

        let revision = Revision {
            doc_id: doc_id.to_string(),
            rev_id: Self::new_rev_id(generation),
            sequence: 0,
            deleted: false,
            properties,
            attachments,
        };
        Ok(self.commit(&mut state, revision, parent.map(|p| p.rev_id)))
    }

    fn delete_attachment(
        &self,
        doc_id: &str,
        name: &str,
        prev_rev: Option<&str>,
    ) -> ListenerResult<Revision> {
        let mut state = self.write();
        let parent = Self::edit_parent(&state, doc_id, prev_rev, false)?
            .filter(|p| !p.deleted)
            .ok_or_else(ListenerError::missing)?;
        if !parent.attachments.contains_key(name) {
            return Err(ListenerError::missing());
        }
        let generation = parent.generation() + 1;
        let mut attachments = parent.attachments.clone();
        attachments.remove(name);

        let revision = Revision {
            doc_id: doc_id.to_string(),
            rev_id: Self::new_rev_id(generation),
            sequence: 0,
            deleted: false,
            properties: parent.properties.clone(),
            attachments,
        };
        Ok(self.commit(&mut state, revision, Some(parent.rev_id)))
    }

    fn get_local(&self, doc_id: &str) -> ListenerResult<Value> {
        let state = self.read();
        let (rev, props) = state.locals.get(doc_id).ok_or_else(ListenerError::missing)?;
        let mut doc = props.clone();
        doc.insert("_id".to_string(), json!(format!("_local/{}", doc_id)));
        doc.insert("_rev".to_string(), json!(rev));
        Ok(Value::Object(doc))
    }

    fn put_local(&self, doc_id: &str, body: Value, prev_rev: Option<&str>) -> ListenerResult<String> {
        let update = DocumentUpdate::from_json(body)?;
        let prev_rev = prev_rev.map(str::to_string).or(update.rev);
        let mut state = self.write();

        let generation = match (state.locals.get(doc_id), prev_rev.as_deref()) {
            (None, None) => 0,
            (Some((current, _)), Some(given)) if current == given => {
                parse_generation(current).unwrap_or(0)
            }
            _ => return Err(ListenerError::Conflict),
        };
        let rev = format!("0-{}", generation + 1);
        state
            .locals
            .insert(doc_id.to_string(), (rev.clone(), update.properties));
        Ok(rev)
    }

    fn delete_local(&self, doc_id: &str, prev_rev: Option<&str>) -> ListenerResult<String> {
        let mut state = self.write();
        let current = state
            .locals
            .get(doc_id)
            .map(|(rev, _)| rev.clone())
            .ok_or_else(ListenerError::missing)?;
        match prev_rev {
            Some(given) if given == current => {
                state.locals.remove(doc_id);
                Ok(current)
            }
            _ => Err(ListenerError::Conflict),
        }
    }
}

/// In-memory [`DatabaseManager`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    databases: DashMap<String, Arc<MemoryDatabase>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with empty databases.
    pub fn with_databases<I, S>(names: I) -> ListenerResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let store = Self::new();
        for name in names {
            store.create_database(name.as_ref())?;
        }
        Ok(store)
    }

    /// Concrete handle, for registering filters.
    pub fn memory_database(&self, name: &str) -> Option<Arc<MemoryDatabase>> {
        self.databases.get(name).map(|db| Arc::clone(db.value()))
    }
}

impl DatabaseManager for MemoryStore {
    fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn database(&self, name: &str) -> ListenerResult<Arc<dyn Database>> {
        self.databases
            .get(name)
            .map(|db| Arc::clone(db.value()) as Arc<dyn Database>)
            .ok_or_else(|| ListenerError::NotFound("no_db_file".to_string()))
    }

    fn create_database(&self, name: &str) -> ListenerResult<Arc<dyn Database>> {
        if !is_valid_database_name(name) {
            return Err(ListenerError::BadId(format!("invalid database name `{}`", name)));
        }
        match self.databases.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ListenerError::PreconditionFailed(
                "The database could not be created, the file already exists.".to_string(),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let db = Arc::new(MemoryDatabase::new(name));
                slot.insert(Arc::clone(&db));
                tracing::info!(db = %name, "Database created");
                Ok(db)
            }
        }
    }

    fn delete_database(&self, name: &str) -> ListenerResult<()> {
        let (_, db) = self
            .databases
            .remove(name)
            .ok_or_else(|| ListenerError::NotFound("no_db_file".to_string()))?;
        db.close();
        tracing::info!(db = %name, "Database deleted");
        Ok(())
    }
}
