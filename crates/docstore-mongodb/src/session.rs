//! Backend seam for scoped operations
//!
//! A [`Connector`] opens one [`StoreSession`] per call. The session performs a
//! single operation and is then consumed by [`StoreSession::release`]. Option
//! structs are the driver's own and are forwarded untouched.

use async_trait::async_trait;
use bson::{Bson, Document as BsonDocument, RawDocumentBuf};
use docstore_common::Result;
use mongodb::options::{
    CountOptions, DeleteOptions, FindOneOptions, FindOptions, InsertManyOptions,
    InsertOneOptions, UpdateOptions,
};
use std::fmt;

use crate::config::ClientConfig;

/// Database and collection a call targets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Opens connections to a document store
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: StoreSession + 'static;

    /// Acquire a connection. Nothing needs releasing if this fails.
    async fn connect(&self, config: &ClientConfig) -> Result<Self::Session>;
}

/// One acquired connection
#[async_trait]
pub trait StoreSession: Send + Sized {
    type Cursor: DocumentCursor + 'static;

    /// Confirm the primary is reachable
    async fn ping(&mut self) -> Result<()>;

    async fn find_one(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        options: Option<FindOneOptions>,
    ) -> Result<Option<RawDocumentBuf>>;

    /// Issue a query and hand back its server-side cursor
    async fn find(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        options: Option<FindOptions>,
    ) -> Result<Self::Cursor>;

    /// Returns the inserted document's `_id`
    async fn insert_one(
        &mut self,
        ns: &Namespace,
        document: BsonDocument,
        options: Option<InsertOneOptions>,
    ) -> Result<Bson>;

    /// Returns the inserted ids in input order
    async fn insert_many(
        &mut self,
        ns: &Namespace,
        documents: Vec<BsonDocument>,
        options: Option<InsertManyOptions>,
    ) -> Result<Vec<Bson>>;

    /// Returns the modified count
    async fn update_one(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        update: BsonDocument,
        options: Option<UpdateOptions>,
    ) -> Result<u64>;

    /// Returns the modified count
    async fn update_many(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        update: BsonDocument,
        options: Option<UpdateOptions>,
    ) -> Result<u64>;

    /// Returns the deleted count
    async fn delete_one(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        options: Option<DeleteOptions>,
    ) -> Result<u64>;

    /// Returns the deleted count
    async fn delete_many(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        options: Option<DeleteOptions>,
    ) -> Result<u64>;

    async fn count(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        options: Option<CountOptions>,
    ) -> Result<u64>;

    /// Tear the connection down
    async fn release(self) -> Result<()>;
}

/// Server-side cursor over raw documents
#[async_trait]
pub trait DocumentCursor: Send + Sized {
    /// Next document in arrival order, `None` once exhausted
    async fn next_document(&mut self) -> Result<Option<RawDocumentBuf>>;

    async fn close(self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_display() {
        let ns = Namespace::new("shop", "products");
        assert_eq!(ns.to_string(), "shop.products");
        assert_eq!(ns.database, "shop");
        assert_eq!(ns.collection, "products");
    }
}
