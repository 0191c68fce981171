//! Integration tests against a live MongoDB server.
//!
//! These tests require MongoDB to be running.
//! Set MONGODB_URI (default mongodb://localhost:27017) and run with --ignored.

use bson::{doc, Bson, Document as BsonDocument};
use docstore_mongodb::{ClientConfig, DocumentStoreClient, StoreError, Timeouts};
use std::time::Duration;

const DB: &str = "docstore_integration";

fn live_client() -> DocumentStoreClient {
    let uri = std::env::var("MONGODB_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    DocumentStoreClient::with_config(ClientConfig::new(uri).with_app_name("docstore-tests"))
}

async fn reset(client: &DocumentStoreClient, collection: &str) {
    client
        .delete_many(DB, collection, doc! {}, None)
        .await
        .expect("failed to clear collection");
}

#[tokio::test]
#[ignore] // Only run with --ignored flag when MongoDB is available
async fn test_products_scenario() {
    let client = live_client();
    reset(&client, "products").await;

    let fruits = ["Orange", "Banana", "Watermelon", "Apple"]
        .map(|name| doc! { "Name": name, "Disabled": false });
    let ids = client.push_many(DB, "products", fruits, None).await.unwrap();
    assert_eq!(ids.len(), 4);

    assert_eq!(client.count(DB, "products", doc! {}, None).await.unwrap(), 4);

    let modified = client
        .update_many(
            DB,
            "products",
            doc! { "Disabled": false },
            doc! { "$set": { "Disabled": true } },
            None,
        )
        .await
        .unwrap();
    assert_eq!(modified, 4);

    let remaining = client
        .count(DB, "products", doc! { "Disabled": false }, None)
        .await
        .unwrap();
    assert_eq!(remaining, 0);

    reset(&client, "products").await;
}

#[tokio::test]
#[ignore]
async fn test_round_trip_and_ordering() {
    let client = live_client();
    reset(&client, "round_trip").await;

    let original = doc! { "Name": "Kiwi", "Price": 2.5 };
    let id = client.push_one(DB, "round_trip", &original, None).await.unwrap();
    let raw = client
        .get_one(DB, "round_trip", doc! { "_id": id.clone() }, None)
        .await
        .unwrap();
    let mut stored: BsonDocument = bson::from_slice(raw.as_bytes()).unwrap();
    assert_eq!(stored.remove("_id"), Some(id));
    assert_eq!(stored, original);

    let batch: Vec<BsonDocument> = (0..3).map(|i| doc! { "_id": i + 100 }).collect();
    let ids = client.push_many(DB, "round_trip", batch, None).await.unwrap();
    assert_eq!(ids, vec![Bson::Int32(100), Bson::Int32(101), Bson::Int32(102)]);

    let err = client
        .push_one(DB, "round_trip", &doc! { "_id": 100 }, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    assert_eq!(
        client
            .delete_one(DB, "round_trip", doc! {}, None)
            .await
            .unwrap(),
        1
    );
    reset(&client, "round_trip").await;
}

#[tokio::test]
#[ignore]
async fn test_missing_collection_is_not_found() {
    let client = live_client();
    let err = client
        .get_one(DB, "does_not_exist", doc! {}, None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let all = client
        .get_many(DB, "does_not_exist", doc! {}, None)
        .await
        .unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_unreachable_server_fails_liveness() {
    // Nothing listens on port 1; server selection gives up just before the ping limit
    let timeouts = Timeouts {
        ping: Duration::from_millis(500),
        ..Default::default()
    };
    let client = DocumentStoreClient::with_config(
        ClientConfig::new("mongodb://127.0.0.1:1/?directConnection=true").with_timeouts(timeouts),
    );

    let err = client.count(DB, "products", doc! {}, None).await.unwrap_err();
    assert!(matches!(err, StoreError::Liveness(_)), "unexpected error: {:?}", err);
}
