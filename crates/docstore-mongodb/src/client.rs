//! Single-call document store helpers
//!
//! Every public method on [`DocumentStoreClient`] runs one scoped operation:
//!
//! 1. connect with the configured URI (bounded by `connect`)
//! 2. ping the primary (bounded by `ping`)
//! 3. run the operation (bounded by `operation`; cursor drains by `cursor`)
//! 4. release the connection
//!
//! Step 4 runs on every exit path once step 1 has succeeded. Nothing is
//! carried between calls, so a client can be shared freely across tasks.
//!
//! # Example
//!
//! ```ignore
//! use bson::doc;
//! use docstore_mongodb::DocumentStoreClient;
//!
//! let client = DocumentStoreClient::new("mongodb://localhost:27017");
//! let id = client.push_one("shop", "products", &doc! { "Name": "Apple" }, None).await?;
//! let found = client.get_one("shop", "products", doc! { "_id": id }, None).await?;
//! ```

use bson::{Bson, Document as BsonDocument, RawDocumentBuf};
use docstore_common::{Result, Step, StoreError};
use futures::future::BoxFuture;
use mongodb::options::{
    CountOptions, DeleteOptions, FindOneOptions, FindOptions, InsertManyOptions,
    InsertOneOptions, UpdateOptions,
};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::instrument::WithSubscriber;
use tracing::{debug, debug_span, warn, Dispatch, Instrument};

use crate::config::{ClientConfig, Timeouts};
use crate::connection::MongoConnector;
use crate::session::{Connector, DocumentCursor, Namespace, StoreSession};

/// Runs each operation on its own short-lived connection
pub struct DocumentStoreClient<C = MongoConnector> {
    config: ClientConfig,
    connector: C,
    logger: Option<Dispatch>,
}

impl DocumentStoreClient<MongoConnector> {
    /// Create a client for `uri` with default timeouts. No I/O happens here.
    pub fn new(uri: impl Into<String>) -> Self {
        Self::with_config(ClientConfig::new(uri))
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self::with_connector(config, MongoConnector)
    }
}

impl<C: Connector> DocumentStoreClient<C> {
    /// Create a client that acquires its connections from `connector`
    pub fn with_connector(config: ClientConfig, connector: C) -> Self {
        Self {
            config,
            connector,
            logger: None,
        }
    }

    /// Route this client's spans and events to `logger` instead of the
    /// caller's default subscriber
    pub fn with_logger(mut self, logger: impl Into<Dispatch>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// First document matching `filter`, or [`StoreError::NotFound`]
    pub async fn get_one(
        &self,
        database: &str,
        collection: &str,
        filter: BsonDocument,
        options: impl Into<Option<FindOneOptions>>,
    ) -> Result<RawDocumentBuf> {
        let options = options.into();
        let target = Namespace::new(database, collection);
        self.scoped("get_one", target, move |session, ns, timeouts| {
            Box::pin(async move {
                let found = bounded(
                    Step::Operation,
                    timeouts.operation,
                    session.find_one(&ns, filter, options),
                )
                .await?;
                found.ok_or(StoreError::NotFound {
                    database: ns.database,
                    collection: ns.collection,
                })
            })
        })
        .await
    }

    /// Every document matching `filter`, in cursor order
    pub async fn get_many(
        &self,
        database: &str,
        collection: &str,
        filter: BsonDocument,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Vec<RawDocumentBuf>> {
        let options = options.into();
        let target = Namespace::new(database, collection);
        self.scoped("get_many", target, move |session, ns, timeouts| {
            Box::pin(async move {
                let mut cursor = bounded(
                    Step::Operation,
                    timeouts.operation,
                    session.find(&ns, filter, options),
                )
                .await?;
                let drained = bounded(Step::Iteration, timeouts.cursor, drain(&mut cursor)).await;
                cursor.close().await;
                drained
            })
        })
        .await
    }

    /// [`get_one`](Self::get_one), decoded into `T`
    pub async fn get_one_as<T: DeserializeOwned>(
        &self,
        database: &str,
        collection: &str,
        filter: BsonDocument,
        options: impl Into<Option<FindOneOptions>>,
    ) -> Result<T> {
        let raw = self.get_one(database, collection, filter, options).await?;
        Ok(bson::from_slice(raw.as_bytes())?)
    }

    /// [`get_many`](Self::get_many), each document decoded into `T`
    pub async fn get_many_as<T: DeserializeOwned>(
        &self,
        database: &str,
        collection: &str,
        filter: BsonDocument,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Vec<T>> {
        let raw = self.get_many(database, collection, filter, options).await?;
        raw.iter()
            .map(|document| bson::from_slice(document.as_bytes()).map_err(StoreError::from))
            .collect()
    }

    /// Insert one document, returning its `_id`
    pub async fn push_one<D: Serialize + ?Sized>(
        &self,
        database: &str,
        collection: &str,
        document: &D,
        options: impl Into<Option<InsertOneOptions>>,
    ) -> Result<Bson> {
        let document = bson::to_document(document)?;
        let options = options.into();
        let target = Namespace::new(database, collection);
        self.scoped("push_one", target, move |session, ns, timeouts| {
            Box::pin(async move {
                bounded(
                    Step::Operation,
                    timeouts.operation,
                    session.insert_one(&ns, document, options),
                )
                .await
            })
        })
        .await
    }

    /// Insert a batch, returning ids in input order. Not atomic: what a
    /// partial failure leaves behind is up to the server.
    pub async fn push_many<I>(
        &self,
        database: &str,
        collection: &str,
        documents: I,
        options: impl Into<Option<InsertManyOptions>>,
    ) -> Result<Vec<Bson>>
    where
        I: IntoIterator,
        I::Item: Serialize,
    {
        let documents = documents
            .into_iter()
            .map(|d| bson::to_document(&d).map_err(StoreError::from))
            .collect::<Result<Vec<_>>>()?;
        let options = options.into();
        let target = Namespace::new(database, collection);
        self.scoped("push_many", target, move |session, ns, timeouts| {
            Box::pin(async move {
                bounded(
                    Step::Operation,
                    timeouts.operation,
                    session.insert_many(&ns, documents, options),
                )
                .await
            })
        })
        .await
    }

    /// Update at most one matching document; returns the modified count
    pub async fn update_one(
        &self,
        database: &str,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<u64> {
        let options = options.into();
        let target = Namespace::new(database, collection);
        self.scoped("update_one", target, move |session, ns, timeouts| {
            Box::pin(async move {
                bounded(
                    Step::Operation,
                    timeouts.operation,
                    session.update_one(&ns, filter, update, options),
                )
                .await
            })
        })
        .await
    }

    /// Update every matching document; returns the modified count
    pub async fn update_many(
        &self,
        database: &str,
        collection: &str,
        filter: BsonDocument,
        update: BsonDocument,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<u64> {
        let options = options.into();
        let target = Namespace::new(database, collection);
        self.scoped("update_many", target, move |session, ns, timeouts| {
            Box::pin(async move {
                bounded(
                    Step::Operation,
                    timeouts.operation,
                    session.update_many(&ns, filter, update, options),
                )
                .await
            })
        })
        .await
    }

    /// Delete at most one matching document; returns the deleted count
    pub async fn delete_one(
        &self,
        database: &str,
        collection: &str,
        filter: BsonDocument,
        options: impl Into<Option<DeleteOptions>>,
    ) -> Result<u64> {
        let options = options.into();
        let target = Namespace::new(database, collection);
        self.scoped("delete_one", target, move |session, ns, timeouts| {
            Box::pin(async move {
                bounded(
                    Step::Operation,
                    timeouts.operation,
                    session.delete_one(&ns, filter, options),
                )
                .await
            })
        })
        .await
    }

    /// Delete every matching document; returns the deleted count
    pub async fn delete_many(
        &self,
        database: &str,
        collection: &str,
        filter: BsonDocument,
        options: impl Into<Option<DeleteOptions>>,
    ) -> Result<u64> {
        let options = options.into();
        let target = Namespace::new(database, collection);
        self.scoped("delete_many", target, move |session, ns, timeouts| {
            Box::pin(async move {
                bounded(
                    Step::Operation,
                    timeouts.operation,
                    session.delete_many(&ns, filter, options),
                )
                .await
            })
        })
        .await
    }

    /// Number of documents matching `filter`
    pub async fn count(
        &self,
        database: &str,
        collection: &str,
        filter: BsonDocument,
        options: impl Into<Option<CountOptions>>,
    ) -> Result<u64> {
        let options = options.into();
        let target = Namespace::new(database, collection);
        self.scoped("count", target, move |session, ns, timeouts| {
            Box::pin(async move {
                bounded(
                    Step::Operation,
                    timeouts.operation,
                    session.count(&ns, filter, options),
                )
                .await
            })
        })
        .await
    }

    /// Connect, ping, run `operation`, release.
    ///
    /// The session is released whenever connect succeeded, whatever the
    /// ping or the operation returned. A release failure is logged and the
    /// operation's own outcome is returned.
    async fn scoped<T, F>(&self, op: &'static str, ns: Namespace, operation: F) -> Result<T>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut C::Session, Namespace, Timeouts) -> BoxFuture<'s, Result<T>>
            + Send,
    {
        let timeouts = self.config.timeouts();
        let task = async move {
            let span = debug_span!(
                "docstore",
                op,
                database = %ns.database,
                collection = %ns.collection
            );
            async move {
                let mut session = bounded(
                    Step::Connect,
                    timeouts.connect,
                    self.connector.connect(&self.config),
                )
                .await
                .inspect_err(|e| debug!(error = %e, "connect failed"))?;
                debug!("connected");

                let outcome = match bounded(Step::Ping, timeouts.ping, session.ping()).await {
                    Ok(()) => operation(&mut session, ns, timeouts).await,
                    Err(e) => Err(e),
                };

                self.release(session, timeouts.connect).await;

                match &outcome {
                    Ok(_) => debug!("completed"),
                    Err(e) => debug!(error = %e, step = ?e.step(), "failed"),
                }
                outcome
            }
            .instrument(span)
            .await
        };

        match &self.logger {
            Some(logger) => task.with_subscriber(logger.clone()).await,
            None => task.await,
        }
    }

    async fn release(&self, session: C::Session, limit: Duration) {
        match bounded(Step::Release, limit, session.release()).await {
            Ok(()) => debug!("connection released"),
            Err(e) => warn!(error = %e, "failed to release connection"),
        }
    }
}

/// Run `fut`, turning expiry of `limit` into [`StoreError::Timeout`]
async fn bounded<T, Fut>(step: Step, limit: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { step, limit }),
    }
}

/// Collect a cursor to exhaustion in arrival order
async fn drain<K: DocumentCursor>(cursor: &mut K) -> Result<Vec<RawDocumentBuf>> {
    let mut results = Vec::new();
    while let Some(document) = cursor.next_document().await? {
        results.push(document);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Faults, MemoryConnector};
    use bson::doc;

    fn memory_client() -> DocumentStoreClient<MemoryConnector> {
        DocumentStoreClient::with_connector(
            ClientConfig::new("memory://localhost"),
            MemoryConnector::new(),
        )
    }

    #[test]
    fn test_new_performs_no_io() {
        let client = DocumentStoreClient::new("mongodb://unreachable.invalid:27017");
        assert_eq!(client.config().uri(), "mongodb://unreachable.invalid:27017");
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let result = bounded(Step::Operation, Duration::from_secs(1), async { Ok(3) }).await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_bounded_reports_step_on_expiry() {
        let result: Result<()> = bounded(Step::Ping, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match result {
            Err(StoreError::Timeout { step, limit }) => {
                assert_eq!(step, Step::Ping);
                assert_eq!(limit, Duration::from_millis(10));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_failure_still_releases() {
        let client = memory_client();
        client.connector().set_faults(Faults {
            ping: true,
            ..Default::default()
        });

        let err = client
            .count("shop", "products", doc! {}, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Liveness(_)));
        assert_eq!(client.connector().acquired(), 1);
        assert_eq!(client.connector().released(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_releases_nothing() {
        let client = memory_client();
        client.connector().set_faults(Faults {
            connect: true,
            ..Default::default()
        });

        let err = client
            .get_one("shop", "products", doc! {}, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
        assert_eq!(client.connector().acquired(), 0);
        assert_eq!(client.connector().released(), 0);
    }
}
