//! MongoDB connector: one driver client per scoped operation

use async_trait::async_trait;
use bson::{doc, Bson, Document as BsonDocument, RawDocumentBuf};
use docstore_common::{Result, StoreError};
use mongodb::{
    options::{
        ClientOptions, CountOptions, DeleteOptions, FindOneOptions, FindOptions,
        InsertManyOptions, InsertOneOptions, ReadPreference, SelectionCriteria, UpdateOptions,
    },
    Client, Collection, Cursor,
};

use std::time::Duration;

use crate::config::ClientConfig;
use crate::session::{Connector, DocumentCursor, Namespace, StoreSession};

/// Connects through the official MongoDB driver
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoConnector;

#[async_trait]
impl Connector for MongoConnector {
    type Session = MongoSession;

    /// Parse the URI and build a driver client. The driver connects lazily,
    /// so this step only fails on a bad URI or options; an unreachable
    /// server surfaces as a [`StoreError::Liveness`] from the ping.
    async fn connect(&self, config: &ClientConfig) -> Result<MongoSession> {
        if config.uri().is_empty() {
            return Err(StoreError::Connection(
                "Connection URI cannot be empty".to_string(),
            ));
        }

        let mut client_options = ClientOptions::parse(config.uri())
            .await
            .map_err(|e| StoreError::Connection(format!("Invalid connection URI: {}", e)))?;

        let timeouts = config.timeouts();
        client_options.connect_timeout = Some(timeouts.connect);
        client_options.server_selection_timeout = Some(selection_timeout(timeouts.ping));
        // One connection per call; nothing to keep warm
        client_options.min_pool_size = Some(0);
        client_options.max_pool_size = Some(1);
        if let Some(app) = config.app_name() {
            client_options.app_name = Some(app.to_string());
        }

        let client = Client::with_options(client_options)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(MongoSession { client })
    }
}

/// Server selection gives up before the ping step limit, so an unreachable
/// server is reported by the driver rather than by the step timer
fn selection_timeout(ping: Duration) -> Duration {
    ping * 9 / 10
}

/// A connected driver client, shut down on release
pub struct MongoSession {
    client: Client,
}

impl MongoSession {
    fn collection(&self, ns: &Namespace) -> Collection<BsonDocument> {
        self.client.database(&ns.database).collection(&ns.collection)
    }

    fn raw_collection(&self, ns: &Namespace) -> Collection<RawDocumentBuf> {
        self.client.database(&ns.database).collection(&ns.collection)
    }
}

#[async_trait]
impl StoreSession for MongoSession {
    type Cursor = MongoCursor;

    async fn ping(&mut self) -> Result<()> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .selection_criteria(SelectionCriteria::ReadPreference(ReadPreference::Primary))
            .await
            .map_err(|e| StoreError::Liveness(format!("Ping failed: {}", e)))?;
        Ok(())
    }

    async fn find_one(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        options: Option<FindOneOptions>,
    ) -> Result<Option<RawDocumentBuf>> {
        let found = self
            .raw_collection(ns)
            .find_one(filter)
            .with_options(options)
            .await?;
        Ok(found)
    }

    async fn find(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        options: Option<FindOptions>,
    ) -> Result<MongoCursor> {
        let cursor = self
            .raw_collection(ns)
            .find(filter)
            .with_options(options)
            .await?;
        Ok(MongoCursor { cursor })
    }

    async fn insert_one(
        &mut self,
        ns: &Namespace,
        document: BsonDocument,
        options: Option<InsertOneOptions>,
    ) -> Result<Bson> {
        let result = self
            .collection(ns)
            .insert_one(document)
            .with_options(options)
            .await?;
        Ok(result.inserted_id)
    }

    async fn insert_many(
        &mut self,
        ns: &Namespace,
        documents: Vec<BsonDocument>,
        options: Option<InsertManyOptions>,
    ) -> Result<Vec<Bson>> {
        let result = self
            .collection(ns)
            .insert_many(documents)
            .with_options(options)
            .await?;

        // The driver keys ids by input position
        let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
        ids.sort_by_key(|(index, _)| *index);
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn update_one(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        update: BsonDocument,
        options: Option<UpdateOptions>,
    ) -> Result<u64> {
        let result = self
            .collection(ns)
            .update_one(filter, update)
            .with_options(options)
            .await?;
        Ok(result.modified_count)
    }

    async fn update_many(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        update: BsonDocument,
        options: Option<UpdateOptions>,
    ) -> Result<u64> {
        let result = self
            .collection(ns)
            .update_many(filter, update)
            .with_options(options)
            .await?;
        Ok(result.modified_count)
    }

    async fn delete_one(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        options: Option<DeleteOptions>,
    ) -> Result<u64> {
        let result = self
            .collection(ns)
            .delete_one(filter)
            .with_options(options)
            .await?;
        Ok(result.deleted_count)
    }

    async fn delete_many(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        options: Option<DeleteOptions>,
    ) -> Result<u64> {
        let result = self
            .collection(ns)
            .delete_many(filter)
            .with_options(options)
            .await?;
        Ok(result.deleted_count)
    }

    async fn count(
        &mut self,
        ns: &Namespace,
        filter: BsonDocument,
        options: Option<CountOptions>,
    ) -> Result<u64> {
        let count = self
            .collection(ns)
            .count_documents(filter)
            .with_options(options)
            .await?;
        Ok(count)
    }

    async fn release(self) -> Result<()> {
        self.client.shutdown().await;
        Ok(())
    }
}

/// Driver cursor yielding undecoded documents
pub struct MongoCursor {
    cursor: Cursor<RawDocumentBuf>,
}

#[async_trait]
impl DocumentCursor for MongoCursor {
    async fn next_document(&mut self) -> Result<Option<RawDocumentBuf>> {
        let has_next = self
            .cursor
            .advance()
            .await
            .map_err(|e| StoreError::Iteration(e.to_string()))?;
        if !has_next {
            return Ok(None);
        }

        let current = self
            .cursor
            .deserialize_current()
            .map_err(|e| StoreError::Iteration(e.to_string()))?;
        Ok(Some(current))
    }

    async fn close(self) {
        // Dropping the driver cursor issues killCursors if it is still open
        drop(self.cursor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_uri_is_a_connection_error() {
        let result = MongoConnector.connect(&ClientConfig::new("")).await;
        assert!(matches!(result, Err(StoreError::Connection(_))));
    }

    #[tokio::test]
    async fn test_malformed_uri_is_a_connection_error() {
        let result = MongoConnector
            .connect(&ClientConfig::new("postgres://localhost:5432"))
            .await;
        assert!(matches!(result, Err(StoreError::Connection(_))));
    }

    #[test]
    fn test_selection_timeout_is_below_ping_limit() {
        let ping = Duration::from_millis(500);
        assert_eq!(selection_timeout(ping), Duration::from_millis(450));
        assert!(selection_timeout(Duration::from_secs(5)) < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connect_is_lazy() {
        // Building the driver client does no network I/O
        let session = MongoConnector
            .connect(&ClientConfig::new("mongodb://127.0.0.1:1"))
            .await
            .unwrap();
        session.release().await.unwrap();
    }
}
