//! In-process document store for tests
//!
//! [`MemoryConnector`] keeps collections in a shared map and counts every
//! connection it hands out and takes back, so callers can check that each
//! scoped operation releases exactly what it acquired. Failures can be
//! injected at each lifecycle step.
//!
//! Filters support top-level equality only; updates support `$set` and
//! `$unset`. `sort`, `skip` and `limit` are honoured on reads and counts;
//! other options are accepted and ignored.

use async_trait::async_trait;
use bson::{oid::ObjectId, Bson, Document as BsonDocument, RawDocumentBuf};
use docstore_common::{Result, StoreError};
use mongodb::options::{
    CountOptions, DeleteOptions, FindOneOptions, FindOptions, InsertManyOptions,
    InsertOneOptions, UpdateOptions,
};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::session::{Connector, DocumentCursor, Namespace, StoreSession};

/// Failures to inject into subsequent calls
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Refuse to hand out connections
    pub connect: bool,
    /// Sleep before handing out a connection
    pub connect_stall: Option<Duration>,
    /// Fail the liveness check
    pub ping: bool,
    /// Fail every operation after a successful ping
    pub operation: bool,
    /// Fail cursor iteration after this many documents
    pub iteration_after: Option<usize>,
    /// Sleep before running each operation
    pub stall: Option<Duration>,
    /// Sleep before yielding each cursor document
    pub cursor_stall: Option<Duration>,
    /// Fail the release after counting it
    pub release: bool,
}

#[derive(Default)]
struct Shared {
    collections: RwLock<HashMap<Namespace, Vec<BsonDocument>>>,
    faults: Mutex<Faults>,
    acquired: AtomicUsize,
    released: AtomicUsize,
    cursors_opened: AtomicUsize,
    cursors_closed: AtomicUsize,
}

/// Connector over an in-memory store; clones share the same data and counters
#[derive(Clone, Default)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the injected failures
    pub fn set_faults(&self, faults: Faults) {
        *self.shared.faults.lock() = faults;
    }

    /// Connections handed out so far
    pub fn acquired(&self) -> usize {
        self.shared.acquired.load(AtomicOrdering::SeqCst)
    }

    /// Connections given back so far
    pub fn released(&self) -> usize {
        self.shared.released.load(AtomicOrdering::SeqCst)
    }

    /// Connections currently held by callers
    pub fn open_sessions(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }

    pub fn cursors_opened(&self) -> usize {
        self.shared.cursors_opened.load(AtomicOrdering::SeqCst)
    }

    pub fn cursors_closed(&self) -> usize {
        self.shared.cursors_closed.load(AtomicOrdering::SeqCst)
    }

    /// Snapshot of a collection's documents in insertion order
    pub fn documents(&self, ns: &Namespace) -> Vec<BsonDocument> {
        self.shared
            .collections
            .read()
            .get(ns)
            .cloned()
            .unwrap_or_default()
    }

    fn faults(&self) -> Faults {
        self.shared.faults.lock().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self, config: &ClientConfig) -> Result<MemorySession> {
        if config.uri().is_empty() {
            return Err(StoreError::Connection(
                "Connection URI cannot be empty".to_string(),
            ));
        }
        if let Some(stall) = self.faults().connect_stall {
            tokio::time::sleep(stall).await;
        }
        if self.faults().connect {
            return Err(StoreError::Connection(format!(
                "{}: connection refused",
                config.uri()
            )));
        }

        self.shared.acquired.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(MemorySession {
            shared: Arc::clone(&self.shared),
            faults: self.faults(),
        })
    }
}

/// Session against a [`MemoryConnector`]
pub struct MemorySession {
    shared: Arc<Shared>,
    faults: Faults,
}

impl MemorySession {
    async fn before_operation(&self) -> Result<()> {
        if let Some(stall) = self.faults.stall {
            tokio::time::sleep(stall).await;
        }
        if self.faults.operation {
            return Err(StoreError::Operation("injected operation failure".to_string()));
        }
        Ok(())
    }

    /// Matching documents in store order, after sort and skip
    fn select(
        &self,
        ns: &Namespace,
        filter: &BsonDocument,
        sort: Option<&BsonDocument>,
        skip: Option<u64>,
    ) -> Result<Vec<BsonDocument>> {
        validate_filter(filter)?;
        let collections = self.shared.collections.read();
        let mut selected = Vec::new();
        if let Some(documents) = collections.get(ns) {
            for document in documents {
                if matches(document, filter) {
                    selected.push(document.clone());
                }
            }
        }
        if let Some(sort) = sort {
            selected.sort_by(|a, b| compare_by(a, b, sort));
        }
        let skip = skip.unwrap_or(0) as usize;
        Ok(selected.into_iter().skip(skip).collect())
    }

    fn insert(&self, ns: &Namespace, document: BsonDocument) -> Result<Bson> {
        let document = with_id(document);
        let id = document.get("_id").cloned().unwrap_or(Bson::Null);

        let mut collections = self.shared.collections.write();
        let documents = collections.entry(ns.clone()).or_default();
        if documents.iter().any(|d| d.get("_id") == Some(&id)) {
            return Err(StoreError::Conflict(format!(
                "E11000 duplicate key error collection: {} dup key: {{ _id: {} }}",
                ns, id
            )));
        }
        documents.push(document);
        Ok(id)
    }

    fn update(
        &self,
        ns: &Namespace,
        filter: &BsonDocument,
        update: &BsonDocument,
        limit: Option<usize>,
    ) -> Result<u64> {
        validate_filter(filter)?;
        validate_update(update)?;

        let mut collections = self.shared.collections.write();
        let Some(documents) = collections.get_mut(ns) else {
            return Ok(0);
        };

        let mut matched = 0usize;
        let mut modified = 0u64;
        for document in documents.iter_mut() {
            if limit.is_some_and(|limit| matched >= limit) {
                break;
            }
            if !matches(document, filter) {
                continue;
            }
            matched += 1;
            if apply_update(document, update) {
                modified += 1;
            }
        }
        Ok(modified)
    }

    fn delete(&self, ns: &Namespace, filter: &BsonDocument, limit: Option<usize>) -> Result<u64> {
        validate_filter(filter)?;
        let mut collections = self.shared.collections.write();
        let Some(documents) = collections.get_mut(ns) else {
            return Ok(0);
        };

        let mut kept = Vec::with_capacity(documents.len());
        let mut deleted = 0u64;
        for document in documents.drain(..) {
            let under_limit = limit.map_or(true, |limit| (deleted as usize) < limit);
            if under_limit && matches(&document, filter) {
                deleted += 1;
            } else {
                kept.push(document);
            }
        }
        *documents = kept;
        Ok(deleted)
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    type Cursor = MemoryCursor;

    async fn ping(&mut self) -> Result<()> {
        if self.faults.ping {
            return Err(StoreError::Liveness(
                "server selection timeout: no primary available".to_string(),
            ));
        }
        Ok(())
    }

    async fn find_one(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        options: Option<FindOneOptions>,
    ) -> Result<Option<RawDocumentBuf>> {
        self.before_operation().await?;
        let options = options.unwrap_or_default();
        let selected = self.select(ns, &filter, options.sort.as_ref(), options.skip)?;
        selected.first().map(to_raw).transpose()
    }

    async fn find(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        options: Option<FindOptions>,
    ) -> Result<MemoryCursor> {
        self.before_operation().await?;
        let options = options.unwrap_or_default();
        let mut selected = self.select(ns, &filter, options.sort.as_ref(), options.skip)?;
        if let Some(limit) = options.limit.filter(|limit| *limit != 0) {
            selected.truncate(limit.unsigned_abs() as usize);
        }

        let pending = selected.iter().map(to_raw).collect::<Result<VecDeque<_>>>()?;
        self.shared.cursors_opened.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(MemoryCursor {
            shared: Arc::clone(&self.shared),
            pending,
            yielded: 0,
            fail_after: self.faults.iteration_after,
            stall: self.faults.cursor_stall,
        })
    }

    async fn insert_one(
        &mut self,
        ns: &Namespace,
        document: BsonDocument,
        _options: Option<InsertOneOptions>,
    ) -> Result<Bson> {
        self.before_operation().await?;
        self.insert(ns, document)
    }

    async fn insert_many(
        &mut self,
        ns: &Namespace,
        documents: Vec<BsonDocument>,
        options: Option<InsertManyOptions>,
    ) -> Result<Vec<Bson>> {
        self.before_operation().await?;
        if documents.is_empty() {
            return Err(StoreError::Operation(
                "insert_many requires at least one document".to_string(),
            ));
        }

        let ordered = options.and_then(|o| o.ordered).unwrap_or(true);
        let mut ids = Vec::with_capacity(documents.len());
        let mut first_error = None;
        for document in documents {
            match self.insert(ns, document) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    first_error.get_or_insert(e);
                    if ordered {
                        break;
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(ids),
        }
    }

    async fn update_one(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        update: BsonDocument,
        _options: Option<UpdateOptions>,
    ) -> Result<u64> {
        self.before_operation().await?;
        self.update(ns, &filter, &update, Some(1))
    }

    async fn update_many(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        update: BsonDocument,
        _options: Option<UpdateOptions>,
    ) -> Result<u64> {
        self.before_operation().await?;
        self.update(ns, &filter, &update, None)
    }

    async fn delete_one(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        _options: Option<DeleteOptions>,
    ) -> Result<u64> {
        self.before_operation().await?;
        self.delete(ns, &filter, Some(1))
    }

    async fn delete_many(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        _options: Option<DeleteOptions>,
    ) -> Result<u64> {
        self.before_operation().await?;
        self.delete(ns, &filter, None)
    }

    async fn count(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        options: Option<CountOptions>,
    ) -> Result<u64> {
        self.before_operation().await?;
        let options = options.unwrap_or_default();
        let mut total = self.select(ns, &filter, None, options.skip)?.len() as u64;
        if let Some(limit) = options.limit {
            total = total.min(limit);
        }
        Ok(total)
    }

    async fn release(self) -> Result<()> {
        self.shared.released.fetch_add(1, AtomicOrdering::SeqCst);
        if self.faults.release {
            return Err(StoreError::Connection(
                "connection reset during shutdown".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cursor over a precomputed result set
pub struct MemoryCursor {
    shared: Arc<Shared>,
    pending: VecDeque<RawDocumentBuf>,
    yielded: usize,
    fail_after: Option<usize>,
    stall: Option<Duration>,
}

#[async_trait]
impl DocumentCursor for MemoryCursor {
    async fn next_document(&mut self) -> Result<Option<RawDocumentBuf>> {
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        if self.fail_after.is_some_and(|n| self.yielded >= n) {
            return Err(StoreError::Iteration(
                "cursor killed by server".to_string(),
            ));
        }
        let next = self.pending.pop_front();
        if next.is_some() {
            self.yielded += 1;
        }
        Ok(next)
    }

    async fn close(self) {
        self.shared.cursors_closed.fetch_add(1, AtomicOrdering::SeqCst);
    }
}

fn to_raw(document: &BsonDocument) -> Result<RawDocumentBuf> {
    RawDocumentBuf::from_document(document).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Prepend a generated `_id` when the document has none
fn with_id(document: BsonDocument) -> BsonDocument {
    if document.contains_key("_id") {
        return document;
    }
    let mut stored = BsonDocument::new();
    stored.insert("_id", ObjectId::new());
    for (key, value) in document {
        stored.insert(key, value);
    }
    stored
}

/// Reject query operators this store does not evaluate
fn validate_filter(filter: &BsonDocument) -> Result<()> {
    for (key, expected) in filter {
        if key.starts_with('$') {
            return Err(StoreError::Operation(format!(
                "unknown top level operator: {}",
                key
            )));
        }
        if let Bson::Document(inner) = expected {
            if let Some(op) = inner.keys().find(|k| k.starts_with('$')) {
                return Err(StoreError::Operation(format!(
                    "unsupported query operator: {}",
                    op
                )));
            }
        }
    }
    Ok(())
}

fn matches(document: &BsonDocument, filter: &BsonDocument) -> bool {
    filter
        .iter()
        .all(|(key, expected)| document.get(key) == Some(expected))
}

fn validate_update(update: &BsonDocument) -> Result<()> {
    if update.is_empty() {
        return Err(StoreError::Operation(
            "update document must contain atomic operators".to_string(),
        ));
    }
    for (op, fields) in update {
        if op != "$set" && op != "$unset" {
            return Err(StoreError::Operation(format!(
                "unsupported update operator: {}",
                op
            )));
        }
        let Bson::Document(fields) = fields else {
            return Err(StoreError::Operation(format!(
                "modifier {} expects a document",
                op
            )));
        };
        if fields.contains_key("_id") {
            return Err(StoreError::Operation(
                "performing an update on the path '_id' would modify the immutable field '_id'"
                    .to_string(),
            ));
        }
    }
    Ok(())
}

/// Apply a validated update, returning whether anything changed
fn apply_update(document: &mut BsonDocument, update: &BsonDocument) -> bool {
    let mut changed = false;
    for (op, fields) in update {
        let Bson::Document(fields) = fields else {
            continue;
        };
        for (field, value) in fields {
            if op == "$set" {
                if document.get(field) != Some(value) {
                    document.insert(field.clone(), value.clone());
                    changed = true;
                }
            } else if document.remove(field).is_some() {
                changed = true;
            }
        }
    }
    changed
}

fn compare_by(a: &BsonDocument, b: &BsonDocument, sort: &BsonDocument) -> Ordering {
    for (field, direction) in sort {
        let descending = matches!(direction, Bson::Int32(d) if *d < 0)
            || matches!(direction, Bson::Int64(d) if *d < 0)
            || matches!(direction, Bson::Double(d) if *d < 0.0);
        let ordering = compare_values(a.get(field), b.get(field));
        let ordering = if descending { ordering.reverse() } else { ordering };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compare_values(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => match (a, b) {
                (Bson::String(x), Bson::String(y)) => x.cmp(y),
                (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
                (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
                (Bson::ObjectId(x), Bson::ObjectId(y)) => x.cmp(y),
                _ => Ordering::Equal,
            },
        },
    }
}

fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}
