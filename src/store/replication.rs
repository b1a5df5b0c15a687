//! Local replicator.
//!
//! Copies revisions between databases of one [`DatabaseManager`]:
//! `changes_since` → `revs_diff` on the target → `force_insert` of the
//! missing revisions with their history. Continuous sessions keep following
//! the source's change stream until cancelled or the source closes.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot};
use tokio::task::AbortHandle;
use url::Url;

use crate::error::{ListenerError, ListenerResult};
use crate::store::{
    AttachmentStyle, ChangeFilter, Database, DatabaseManager, DocumentUpdate, FilterParams,
    ReplicationRequest, ReplicationSession, ReplicationStats, Replicator, Sequence,
};

#[derive(Debug)]
struct ActiveReplication {
    source: String,
    target: String,
    continuous: bool,
    handle: AbortHandle,
}

/// [`Replicator`] for databases held by the same manager.
pub struct MemoryReplicator {
    manager: Arc<dyn DatabaseManager>,
    sessions: Arc<DashMap<String, ActiveReplication>>,
}

struct Job {
    source: Arc<dyn Database>,
    target: Arc<dyn Database>,
    filter: Option<Arc<dyn ChangeFilter>>,
    params: FilterParams,
    doc_ids: Option<Vec<String>>,
}

impl MemoryReplicator {
    pub fn new(manager: Arc<dyn DatabaseManager>) -> Self {
        Self {
            manager,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Database name for a replication endpoint. Remote URLs are refused.
    fn local_name(endpoint: &str) -> ListenerResult<String> {
        if endpoint.is_empty() {
            return Err(ListenerError::BadRequest(
                "replication needs a source and a target".to_string(),
            ));
        }
        match Url::parse(endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Err(
                ListenerError::NotImplemented(format!("remote replication to {}", url.host_str().unwrap_or("?"))),
            ),
            Ok(url) => Err(ListenerError::BadRequest(format!(
                "unsupported replication scheme `{}`",
                url.scheme()
            ))),
            Err(_) => Ok(endpoint.trim_matches('/').to_string()),
        }
    }

    fn prepare(&self, request: &ReplicationRequest) -> ListenerResult<Job> {
        let source = self.manager.database(&Self::local_name(&request.source)?)?;
        let target_name = Self::local_name(&request.target)?;
        let target = match self.manager.database(&target_name) {
            Ok(db) => db,
            Err(ListenerError::NotFound(_)) if request.create_target => {
                self.manager.create_database(&target_name)?
            }
            Err(e) => return Err(e),
        };
        let filter = match &request.filter {
            Some(name) => Some(
                source
                    .filter(name)
                    .ok_or_else(|| ListenerError::NotFound(format!("filter `{}`", name)))?,
            ),
            None => None,
        };
        Ok(Job {
            source,
            target,
            filter,
            params: request.query_params.clone(),
            doc_ids: request.doc_ids.clone(),
        })
    }

    fn find_session(&self, request: &ReplicationRequest) -> Option<String> {
        self.sessions
            .iter()
            .find(|s| s.source == request.source && s.target == request.target)
            .map(|s| s.key().clone())
    }
}

impl Job {
    /// Copy everything after `since`. Returns totals and the last source sequence seen.
    fn pass(&self, since: Sequence) -> ListenerResult<(ReplicationStats, Sequence)> {
        let mut stats = ReplicationStats::default();
        let mut last_seq = since;
        let mut wanted: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for rev in self.source.changes_since(since, true) {
            last_seq = last_seq.max(rev.sequence);
            if let Some(ids) = &self.doc_ids {
                if !ids.contains(&rev.doc_id) {
                    continue;
                }
            }
            if let Some(filter) = &self.filter {
                if !filter.accepts(&rev, &self.params) {
                    continue;
                }
            }
            wanted.entry(rev.doc_id.clone()).or_default().push(rev.rev_id.clone());
        }

        for (doc_id, missing) in self.target.revs_diff(&wanted) {
            for rev_id in missing {
                let revision = self.source.get_document(&doc_id, Some(&rev_id))?;
                stats.docs_read += 1;
                let mut update =
                    DocumentUpdate::from_json(revision.to_json_with(AttachmentStyle::Inline))?;
                update.history = Some(self.source.revision_history(&doc_id, &rev_id));
                self.target.force_insert(&doc_id, update)?;
                stats.docs_written += 1;
            }
        }
        Ok((stats, last_seq))
    }

    async fn follow(self, mut changes: broadcast::Receiver<crate::store::DatabaseChange>, mut since: Sequence) {
        loop {
            match changes.recv().await {
                Ok(change) if change.revision.sequence <= since => continue,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => match self.pass(since) {
                    Ok((stats, last)) => {
                        since = last;
                        if stats.docs_written > 0 {
                            tracing::debug!(
                                source = %self.source.name(),
                                target = %self.target.name(),
                                docs_written = stats.docs_written,
                                "Continuous replication pass"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Continuous replication pass failed");
                    }
                },
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

impl Replicator for MemoryReplicator {
    fn start(&self, request: &ReplicationRequest) -> ListenerResult<ReplicationSession> {
        let job = self.prepare(request)?;
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (go_tx, go_rx) = oneshot::channel::<()>();

        let continuous = request.continuous;
        let sessions = Arc::clone(&self.sessions);
        let id = session_id.clone();
        let changes = continuous.then(|| job.source.subscribe());

        let task = tokio::spawn(async move {
            let _ = go_rx.await;
            let first = job.pass(0);
            let since = first.as_ref().map(|(_, seq)| *seq).unwrap_or(0);
            match &first {
                Ok((stats, _)) => tracing::info!(
                    session_id = %id,
                    source = %job.source.name(),
                    target = %job.target.name(),
                    docs_written = stats.docs_written,
                    "Replication pass complete"
                ),
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Replication failed"),
            }

            match changes {
                Some(changes) if first.is_ok() => job.follow(changes, since).await,
                _ => {
                    let _ = outcome_tx.send(first.map(|(stats, _)| stats));
                }
            }
            sessions.remove(&id);
        });

        self.sessions.insert(
            session_id.clone(),
            ActiveReplication {
                source: request.source.clone(),
                target: request.target.clone(),
                continuous,
                handle: task.abort_handle(),
            },
        );
        let _ = go_tx.send(());

        Ok(ReplicationSession {
            session_id,
            continuous,
            outcome: outcome_rx,
        })
    }

    fn cancel(&self, request: &ReplicationRequest) -> ListenerResult<()> {
        let id = self.find_session(request).ok_or_else(ListenerError::missing)?;
        if let Some((_, session)) = self.sessions.remove(&id) {
            session.handle.abort();
            tracing::info!(
                session_id = %id,
                continuous = session.continuous,
                "Replication cancelled"
            );
        }
        Ok(())
    }

    fn active_sessions(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryStore>, MemoryReplicator) {
        let store = Arc::new(MemoryStore::with_databases(["src"]).unwrap());
        let replicator = MemoryReplicator::new(store.clone());
        (store, replicator)
    }

    fn request(continuous: bool) -> ReplicationRequest {
        ReplicationRequest {
            source: "src".into(),
            target: "dst".into(),
            create_target: true,
            continuous,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_one_shot_copies_documents() {
        let (store, replicator) = setup();
        let src = store.database("src").unwrap();
        src.put_document("a", DocumentUpdate::from_json(json!({"v": 1})).unwrap())
            .unwrap();
        src.put_document("b", DocumentUpdate::from_json(json!({"v": 2})).unwrap())
            .unwrap();

        let session = replicator.start(&request(false)).unwrap();
        let stats = session.outcome.await.unwrap().unwrap();
        assert_eq!(stats.docs_written, 2);

        let dst = store.database("dst").unwrap();
        assert_eq!(dst.get_document("a", None).unwrap().properties["v"], 1);
    }

    #[tokio::test]
    async fn test_continuous_follows_and_cancels() {
        let (store, replicator) = setup();
        let session = replicator.start(&request(true)).unwrap();
        assert!(session.continuous);

        let src = store.database("src").unwrap();
        src.put_document("late", DocumentUpdate::from_json(json!({})).unwrap())
            .unwrap();

        let dst = store.database("dst").unwrap();
        let mut copied = false;
        for _ in 0..50 {
            if dst.get_document("late", None).is_ok() {
                copied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(copied);

        replicator.cancel(&request(true)).unwrap();
        assert!(replicator.active_sessions().is_empty());
        assert!(replicator.cancel(&request(true)).is_err());
    }

    #[test]
    fn test_remote_endpoints_refused() {
        assert!(matches!(
            MemoryReplicator::local_name("http://peer:4984/db"),
            Err(ListenerError::NotImplemented(_))
        ));
        assert_eq!(MemoryReplicator::local_name("db").unwrap(), "db");
    }
}
