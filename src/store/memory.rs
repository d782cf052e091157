// ============================================================================
// In-memory Store Gateway
// ============================================================================
//
// Snapshot isolation over persistent maps:
// - start_transaction clones the committed collections (O(1) with `im`)
// - mutations edit the private working copy and append to a change log
// - commit re-validates every replaced/deleted row against its committed
//   version and every inserted `_id` against committed ids, then replays
//   the log; a violation is a write-write conflict labeled
//   TransientTransactionError
//
// ============================================================================

use super::faults::{FaultPlan, FaultPoint};
use super::matcher;
use super::{
    DeleteOutcome, InsertOutcome, StoreGateway, StoreSession, UpdateOutcome, WriteConcern,
};
use crate::core::{StoreError, StoreResult};
use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, Document};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;

type RowId = u64;

#[derive(Debug, Clone)]
struct StoredRow {
    version: u64,
    document: Document,
}

type Collection = im::OrdMap<RowId, StoredRow>;
type Collections = im::HashMap<String, Collection>;

/// One recorded mutation, replayed against committed state at commit.
#[derive(Debug, Clone)]
enum Change {
    Insert {
        collection: String,
        row: RowId,
        document: Document,
    },
    Replace {
        collection: String,
        row: RowId,
        base_version: u64,
        document: Document,
    },
    Delete {
        collection: String,
        row: RowId,
        base_version: u64,
    },
}

/// Counters describing how the store has been driven.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub transactions_started: u64,
    pub commits: u64,
    pub aborts: u64,
    pub last_write_concern: Option<WriteConcern>,
}

#[derive(Debug, Default)]
struct Counters {
    sessions_started: AtomicU64,
    sessions_ended: AtomicU64,
    transactions_started: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    last_write_concern: Mutex<Option<WriteConcern>>,
}

#[derive(Debug, Default)]
struct Shared {
    committed: RwLock<Collections>,
    next_row: AtomicU64,
    commit_seq: AtomicU64,
    faults: FaultPlan,
    counters: Counters,
}

impl Shared {
    fn allocate_row(&self) -> RowId {
        self.next_row.fetch_add(1, Ordering::SeqCst)
    }
}

/// Document store living entirely in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripted failures applied to every session of this store.
    pub fn faults(&self) -> &FaultPlan {
        &self.shared.faults
    }

    pub fn stats(&self) -> StoreStats {
        let counters = &self.shared.counters;
        StoreStats {
            sessions_started: counters.sessions_started.load(Ordering::SeqCst),
            sessions_ended: counters.sessions_ended.load(Ordering::SeqCst),
            transactions_started: counters.transactions_started.load(Ordering::SeqCst),
            commits: counters.commits.load(Ordering::SeqCst),
            aborts: counters.aborts.load(Ordering::SeqCst),
            last_write_concern: *counters
                .last_write_concern
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Committed documents of `collection`, in insertion order.
    pub async fn documents(&self, collection: &str) -> Vec<Document> {
        let committed = self.shared.committed.read().await;
        committed
            .get(collection)
            .map(|rows| rows.values().map(|row| row.document.clone()).collect())
            .unwrap_or_default()
    }

    /// Committed documents of `collection` matching an equality filter.
    pub async fn find(&self, collection: &str, filter: &Document) -> StoreResult<Vec<Document>> {
        let mut found = Vec::new();
        for document in self.documents(collection).await {
            if matcher::matches(&document, filter)? {
                found.push(document);
            }
        }
        Ok(found)
    }

    pub async fn count(&self, collection: &str) -> usize {
        let committed = self.shared.committed.read().await;
        committed.get(collection).map(|rows| rows.len()).unwrap_or(0)
    }

    /// Insert documents directly as committed state, outside any transaction.
    pub async fn seed(&self, collection: &str, documents: Vec<Document>) -> Vec<Bson> {
        let mut committed = self.shared.committed.write().await;
        let version = self.shared.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let rows = committed.entry(collection.to_string()).or_insert_with(Collection::new);
        documents
            .into_iter()
            .map(|document| {
                let (id, document) = with_object_id(&document);
                rows.insert(self.shared.allocate_row(), StoredRow { version, document });
                id
            })
            .collect()
    }
}

#[async_trait]
impl StoreGateway for MemoryStore {
    async fn start_session(&self) -> StoreResult<Box<dyn StoreSession>> {
        self.shared.faults.check(&FaultPoint::StartSession)?;
        self.shared
            .counters
            .sessions_started
            .fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            shared: self.shared.clone(),
            transaction: None,
            ended: false,
        }))
    }
}

struct OpenTransaction {
    working: Collections,
    changes: Vec<Change>,
}

struct MemorySession {
    shared: Arc<Shared>,
    transaction: Option<OpenTransaction>,
    ended: bool,
}

impl MemorySession {
    fn transaction_mut(&mut self) -> StoreResult<&mut OpenTransaction> {
        if self.ended {
            return Err(StoreError::session("Session has already ended"));
        }
        self.transaction
            .as_mut()
            .ok_or_else(|| StoreError::transaction("No transaction started"))
    }

    fn insert_row(&mut self, collection: &str, document: &Document) -> StoreResult<Bson> {
        let row = self.shared.allocate_row();
        let transaction = self.transaction_mut()?;
        let (id, document) = with_object_id(document);

        let rows = transaction.working.entry(collection.to_string()).or_insert_with(Collection::new);
        if rows.values().any(|stored| stored.document.get("_id") == Some(&id)) {
            return Err(StoreError::write(format!(
                "E11000 duplicate key error collection: {collection} index: _id_ dup key: {{ _id: {id} }}"
            )));
        }

        rows.insert(
            row,
            StoredRow {
                version: 0,
                document: document.clone(),
            },
        );
        transaction.changes.push(Change::Insert {
            collection: collection.to_string(),
            row,
            document,
        });
        Ok(id)
    }

    fn first_match(
        transaction: &OpenTransaction,
        collection: &str,
        filter: &Document,
    ) -> StoreResult<Option<(RowId, StoredRow)>> {
        let Some(rows) = transaction.working.get(collection) else {
            return Ok(None);
        };
        for (row, stored) in rows.iter() {
            if matcher::matches(&stored.document, filter)? {
                return Ok(Some((*row, stored.clone())));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn start_transaction(&mut self, write_concern: WriteConcern) -> StoreResult<()> {
        if self.ended {
            return Err(StoreError::session("Session has already ended"));
        }
        if self.transaction.is_some() {
            return Err(StoreError::transaction("Transaction already in progress"));
        }
        self.shared.faults.check(&FaultPoint::StartTransaction)?;

        let working = self.shared.committed.read().await.clone();
        self.transaction = Some(OpenTransaction {
            working,
            changes: Vec::new(),
        });

        let counters = &self.shared.counters;
        counters.transactions_started.fetch_add(1, Ordering::SeqCst);
        *counters
            .last_write_concern
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(write_concern);
        Ok(())
    }

    async fn insert_one(
        &mut self,
        collection: &str,
        document: &Document,
    ) -> StoreResult<InsertOutcome> {
        self.transaction_mut()?;
        self.shared
            .faults
            .check(&FaultPoint::write(collection))?;
        let inserted_id = self.insert_row(collection, document)?;
        Ok(InsertOutcome { inserted_id })
    }

    async fn update_one(
        &mut self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome> {
        self.transaction_mut()?;
        self.shared
            .faults
            .check(&FaultPoint::write(collection))?;

        let transaction = self.transaction_mut()?;
        let Some((row, stored)) = Self::first_match(transaction, collection, filter)? else {
            matcher::validate_update(update)?;
            if !upsert {
                return Ok(UpdateOutcome {
                    matched: 0,
                    modified: 0,
                    upserted_id: None,
                });
            }
            let created = matcher::upsert_document(filter, update)?;
            let upserted_id = self.insert_row(collection, &created)?;
            return Ok(UpdateOutcome {
                matched: 0,
                modified: 0,
                upserted_id: Some(upserted_id),
            });
        };

        let mut document = stored.document.clone();
        let changed = matcher::apply_update(&mut document, update)?;
        if document.get("_id") != stored.document.get("_id") {
            return Err(StoreError::write(
                "Performing an update on the path '_id' would modify the immutable field '_id'",
            ));
        }
        if changed {
            if let Some(rows) = transaction.working.get_mut(collection) {
                rows.insert(
                    row,
                    StoredRow {
                        version: stored.version,
                        document: document.clone(),
                    },
                );
            }
            transaction.changes.push(Change::Replace {
                collection: collection.to_string(),
                row,
                base_version: stored.version,
                document,
            });
        }

        Ok(UpdateOutcome {
            matched: 1,
            modified: u64::from(changed),
            upserted_id: None,
        })
    }

    async fn delete_one(
        &mut self,
        collection: &str,
        filter: &Document,
    ) -> StoreResult<DeleteOutcome> {
        self.transaction_mut()?;
        self.shared
            .faults
            .check(&FaultPoint::write(collection))?;

        let transaction = self.transaction_mut()?;
        let Some((row, stored)) = Self::first_match(transaction, collection, filter)? else {
            return Ok(DeleteOutcome { deleted: 0 });
        };

        if let Some(rows) = transaction.working.get_mut(collection) {
            rows.remove(&row);
        }
        transaction.changes.push(Change::Delete {
            collection: collection.to_string(),
            row,
            base_version: stored.version,
        });
        Ok(DeleteOutcome { deleted: 1 })
    }

    async fn commit_transaction(&mut self) -> StoreResult<()> {
        if self.ended {
            return Err(StoreError::session("Session has already ended"));
        }
        let Some(transaction) = self.transaction.take() else {
            return Err(StoreError::commit("No transaction started"));
        };
        self.shared.faults.check(&FaultPoint::Commit)?;

        let mut committed = self.shared.committed.write().await;
        let deleted_here = |collection: &str, row: &RowId| {
            transaction.changes.iter().any(|other| {
                matches!(other, Change::Delete { collection: c, row: r, .. } if c == collection && r == row)
            })
        };
        for change in &transaction.changes {
            let (collection, row, base_version) = match change {
                Change::Insert {
                    collection,
                    row,
                    document,
                } => {
                    if deleted_here(collection.as_str(), row) {
                        continue;
                    }
                    let id = document.get("_id");
                    let taken = committed.get(collection).is_some_and(|rows| {
                        rows.iter().any(|(other, stored)| {
                            stored.document.get("_id") == id && !deleted_here(collection.as_str(), other)
                        })
                    });
                    if let (true, Some(id)) = (taken, id) {
                        return Err(StoreError::commit(format!(
                            "WriteConflict: _id {id} in collection '{collection}' was inserted by a concurrent transaction"
                        ))
                        .transient());
                    }
                    continue;
                }
                Change::Replace {
                    collection,
                    row,
                    base_version,
                    ..
                }
                | Change::Delete {
                    collection,
                    row,
                    base_version,
                } => (collection, row, *base_version),
            };

            let inserted_here = transaction.changes.iter().any(|other| {
                matches!(other, Change::Insert { row: r, .. } if r == row)
            });
            if inserted_here {
                continue;
            }

            let current = committed
                .get(collection)
                .and_then(|rows| rows.get(row))
                .map(|stored| stored.version);
            if current != Some(base_version) {
                return Err(StoreError::commit(format!(
                    "WriteConflict: document in collection '{collection}' was modified by a concurrent transaction"
                ))
                .transient());
            }
        }

        let version = self.shared.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        for change in transaction.changes {
            match change {
                Change::Insert {
                    collection,
                    row,
                    document,
                } => {
                    committed
                        .entry(collection)
                        .or_insert_with(Collection::new)
                        .insert(row, StoredRow { version, document });
                }
                Change::Replace {
                    collection,
                    row,
                    document,
                    ..
                } => {
                    committed
                        .entry(collection)
                        .or_insert_with(Collection::new)
                        .insert(row, StoredRow { version, document });
                }
                Change::Delete {
                    collection, row, ..
                } => {
                    if let Some(rows) = committed.get_mut(&collection) {
                        rows.remove(&row);
                    }
                }
            }
        }

        self.shared.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort_transaction(&mut self) -> StoreResult<()> {
        if self.transaction.take().is_none() {
            return Err(StoreError::abort("No transaction started"));
        }
        self.shared.counters.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end_session(&mut self) {
        if self.ended {
            return;
        }
        if self.transaction.take().is_some() {
            self.shared.counters.aborts.fetch_add(1, Ordering::SeqCst);
        }
        self.ended = true;
        self.shared
            .counters
            .sessions_ended
            .fetch_add(1, Ordering::SeqCst);
    }
}

/// Copy `document` with an `_id` in first position, generating one if absent.
fn with_object_id(document: &Document) -> (Bson, Document) {
    let id = document
        .get("_id")
        .cloned()
        .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));

    let mut stored = Document::new();
    stored.insert("_id", id.clone());
    for (key, value) in document {
        if key != "_id" {
            stored.insert(key.clone(), value.clone());
        }
    }
    (id, stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    async fn open(store: &MemoryStore) -> Box<dyn StoreSession> {
        let mut session = store.start_session().await.unwrap();
        session.start_transaction(WriteConcern::Majority).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let store = MemoryStore::new();
        let mut session = open(&store).await;

        session
            .insert_one("notes", &doc! { "text": "hi" })
            .await
            .unwrap();
        assert_eq!(store.count("notes").await, 0, "uncommitted insert leaked");

        session.commit_transaction().await.unwrap();
        session.end_session().await;

        let notes = store.documents("notes").await;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].get_str("text").unwrap(), "hi");
        assert!(notes[0].get_object_id("_id").is_ok());
    }

    #[tokio::test]
    async fn test_abort_discards_writes() {
        let store = MemoryStore::new();
        store.seed("notes", vec![doc! { "_id": 1, "text": "a" }]).await;

        let mut session = open(&store).await;
        session
            .update_one("notes", &doc! { "_id": 1 }, &doc! { "$set": { "text": "b" } }, false)
            .await
            .unwrap();
        session.delete_one("notes", &doc! { "_id": 1 }).await.unwrap();
        session.abort_transaction().await.unwrap();
        session.end_session().await;

        assert_eq!(store.documents("notes").await, vec![doc! { "_id": 1, "text": "a" }]);
        assert_eq!(store.stats().aborts, 1);
    }

    #[tokio::test]
    async fn test_transaction_reads_its_own_writes() {
        let store = MemoryStore::new();
        let mut session = open(&store).await;

        session
            .insert_one("notes", &doc! { "_id": "n1", "n": 1 })
            .await
            .unwrap();
        let outcome = session
            .update_one("notes", &doc! { "_id": "n1" }, &doc! { "$inc": { "n": 1 } }, false)
            .await
            .unwrap();
        assert_eq!((outcome.matched, outcome.modified), (1, 1));

        session.commit_transaction().await.unwrap();
        assert_eq!(store.documents("notes").await, vec![doc! { "_id": "n1", "n": 2 }]);
    }

    #[tokio::test]
    async fn test_update_counts() {
        let store = MemoryStore::new();
        store.seed("notes", vec![doc! { "_id": 1, "text": "a" }]).await;
        let mut session = open(&store).await;

        let missing = session
            .update_one("notes", &doc! { "_id": 2 }, &doc! { "$set": { "text": "z" } }, false)
            .await
            .unwrap();
        assert_eq!((missing.matched, missing.modified, missing.upserted_id), (0, 0, None));

        let unchanged = session
            .update_one("notes", &doc! { "_id": 1 }, &doc! { "$set": { "text": "a" } }, false)
            .await
            .unwrap();
        assert_eq!((unchanged.matched, unchanged.modified), (1, 0));

        let upserted = session
            .update_one("notes", &doc! { "_id": 2 }, &doc! { "$set": { "text": "z" } }, true)
            .await
            .unwrap();
        assert_eq!((upserted.matched, upserted.modified), (0, 0));
        assert_eq!(upserted.upserted_id, Some(Bson::Int32(2)));

        session.commit_transaction().await.unwrap();
        assert_eq!(store.count("notes").await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let store = MemoryStore::new();
        store.seed("notes", vec![doc! { "_id": 1 }]).await;
        let mut session = open(&store).await;

        let err = session.insert_one("notes", &doc! { "_id": 1 }).await.unwrap_err();
        assert!(err.message().starts_with("E11000"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_concurrent_update_conflicts_at_commit() {
        let store = MemoryStore::new();
        store.seed("counters", vec![doc! { "_id": "c", "n": 0 }]).await;

        let mut first = open(&store).await;
        let mut second = open(&store).await;
        let bump = doc! { "$inc": { "n": 1 } };

        first
            .update_one("counters", &doc! { "_id": "c" }, &bump, false)
            .await
            .unwrap();
        second
            .update_one("counters", &doc! { "_id": "c" }, &bump, false)
            .await
            .unwrap();

        first.commit_transaction().await.unwrap();
        let err = second.commit_transaction().await.unwrap_err();
        assert!(err.is_transient());

        assert_eq!(store.documents("counters").await, vec![doc! { "_id": "c", "n": 1 }]);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_do_not_conflict() {
        let store = MemoryStore::new();
        let mut first = open(&store).await;
        let mut second = open(&store).await;

        first.insert_one("audit_log", &doc! { "n": 1 }).await.unwrap();
        second.insert_one("audit_log", &doc! { "n": 2 }).await.unwrap();

        first.commit_transaction().await.unwrap();
        second.commit_transaction().await.unwrap();
        assert_eq!(store.count("audit_log").await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_of_same_id_conflict() {
        let store = MemoryStore::new();
        let mut first = open(&store).await;
        let mut second = open(&store).await;

        first.insert_one("notes", &doc! { "_id": "x", "by": 1 }).await.unwrap();
        second.insert_one("notes", &doc! { "_id": "x", "by": 2 }).await.unwrap();

        first.commit_transaction().await.unwrap();
        let err = second.commit_transaction().await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.message().starts_with("WriteConflict"));
        assert_eq!(store.documents("notes").await, vec![doc! { "_id": "x", "by": 1 }]);

        // A retry sees the committed row and fails for good.
        let mut retry = open(&store).await;
        let err = retry.insert_one("notes", &doc! { "_id": "x" }).await.unwrap_err();
        assert!(err.message().starts_with("E11000"));
    }

    #[tokio::test]
    async fn test_concurrent_upserts_create_one_document() {
        let store = MemoryStore::new();
        let mut first = open(&store).await;
        let mut second = open(&store).await;
        let filter = doc! { "_id": "p" };

        for (session, age) in [(&mut first, 40), (&mut second, 41)] {
            let outcome = session
                .update_one("profiles", &filter, &doc! { "$set": { "age": age } }, true)
                .await
                .unwrap();
            assert_eq!(outcome.upserted_id, Some(Bson::String("p".into())));
        }

        first.commit_transaction().await.unwrap();
        assert!(second.commit_transaction().await.unwrap_err().is_transient());
        assert_eq!(store.documents("profiles").await, vec![doc! { "_id": "p", "age": 40 }]);
    }

    #[tokio::test]
    async fn test_reinserting_deleted_id_in_same_transaction() {
        let store = MemoryStore::new();
        store.seed("notes", vec![doc! { "_id": 1, "v": "old" }]).await;
        let mut session = open(&store).await;

        session.delete_one("notes", &doc! { "_id": 1 }).await.unwrap();
        session.insert_one("notes", &doc! { "_id": 1, "v": "new" }).await.unwrap();
        session.commit_transaction().await.unwrap();

        assert_eq!(store.documents("notes").await, vec![doc! { "_id": 1, "v": "new" }]);
    }

    #[tokio::test]
    async fn test_mutation_outside_transaction_fails() {
        let store = MemoryStore::new();
        let mut session = store.start_session().await.unwrap();
        let err = session.insert_one("notes", &doc! {}).await.unwrap_err();
        assert_eq!(err.message(), "No transaction started");
    }

    #[tokio::test]
    async fn test_end_session_drops_open_transaction() {
        let store = MemoryStore::new();
        let mut session = open(&store).await;
        session.insert_one("notes", &doc! { "x": 1 }).await.unwrap();
        session.end_session().await;
        session.end_session().await;

        let stats = store.stats();
        assert_eq!(stats.sessions_started, 1);
        assert_eq!(stats.sessions_ended, 1);
        assert_eq!(stats.aborts, 1);
        assert_eq!(stats.last_write_concern, Some(WriteConcern::Majority));
        assert_eq!(store.count("notes").await, 0);
    }
}
