//! End-to-end behavior against an in-process server over real sockets

mod common;

use common::{config_for, MockServer};
use docwire::executor::FindOptions;
use docwire::{Client, DriverError, Operation, OperationResult, ServerState};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

async fn started(config: docwire::Config) -> Client {
    let client = Client::new(config).unwrap();
    client.startup().await.unwrap();
    client
}

#[tokio::test]
async fn insert_on_empty_pool_opens_one_connection() {
    let server = MockServer::start().await;
    let client = started(server.config()).await;
    let endpoint = server.endpoint();

    // Probes use their own connections
    assert!(client.topology().pool(&endpoint).is_none());

    let users = client.collection("app.users").unwrap();
    let id = assert_ok!(users.insert_one(json!({"name": "ada"})).await);

    let stats = client.topology().pool(&endpoint).unwrap().stats();
    assert_eq!(stats.opened, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.outstanding, 0);

    let stored = server.documents("app.users");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["_id"], id);
    client.shutdown();
}

#[tokio::test]
async fn pool_of_one_serializes_two_callers() {
    let server = MockServer::start().await;
    let mut config = server.config();
    config.pool.max_pool_size = 1;
    let client = started(config).await;
    let users = client.collection("app.users").unwrap();

    server.delay_next_commands(2, Duration::from_millis(150));
    let begin = Instant::now();
    let (first, second) = tokio::join!(
        users.insert_one(json!({"name": "ada"})),
        users.insert_one(json!({"name": "grace"})),
    );
    assert_ok!(first);
    assert_ok!(second);

    assert!(begin.elapsed() >= Duration::from_millis(300));
    let stats = client.topology().pool(&server.endpoint()).unwrap().stats();
    assert_eq!(stats.opened, 1);
    assert_eq!(stats.total(), 1);
    assert_eq!(server.documents("app.users").len(), 2);
    client.shutdown();
}

#[tokio::test]
async fn failed_handshake_makes_server_unselectable_until_probe_succeeds() {
    let server = MockServer::start().await;
    server.reject_handshakes(true);
    let mut config = server.config();
    config.timeouts.selection_timeout_ms = 300;
    let client = started(config).await;
    let endpoint = server.endpoint();

    let description = client.topology().description(&endpoint).unwrap();
    assert_eq!(description.state, ServerState::Unreachable);

    let users = client.collection("app.users").unwrap();
    let err = assert_err!(users.insert_one(json!({"name": "ada"})).await);
    assert!(matches!(err, DriverError::NoSuitableServer { .. }), "{}", err);
    assert!(server.documents("app.users").is_empty());

    // Selection requests a probe, which now succeeds
    server.reject_handshakes(false);
    assert_ok!(users.insert_one(json!({"name": "ada"})).await);
    assert_eq!(
        client.topology().description(&endpoint).unwrap().state,
        ServerState::Connected
    );
    client.shutdown();
}

#[tokio::test]
async fn socket_timeout_discards_connection_and_retries() {
    let server = MockServer::start().await;
    let mut config = server.config();
    config.timeouts.socket_timeout_ms = 200;
    let client = started(config).await;
    let users = client.collection("app.users").unwrap();

    server.stall_next_commands(1);
    assert_ok!(users.insert_one(json!({"_id": "u1", "name": "ada"})).await);

    assert_eq!(server.commands("insert"), 2);
    assert_eq!(server.documents("app.users").len(), 1);

    let stats = client.topology().pool(&server.endpoint()).unwrap().stats();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.opened, 2);
    assert_eq!(
        client.topology().description(&server.endpoint()).unwrap().state,
        ServerState::Connected
    );
    client.shutdown();
}

#[tokio::test]
async fn network_failure_is_retried_exactly_once() {
    let server = MockServer::start().await;
    let client = started(server.config()).await;
    let users = client.collection("app.users").unwrap();

    server.drop_next_commands(2);
    let err = assert_err!(users.insert_one(json!({"name": "ada"})).await);
    assert!(err.is_network_error(), "{}", err);
    assert_eq!(server.commands("insert"), 2);
    client.shutdown();
}

#[tokio::test]
async fn transient_server_error_is_retried() {
    let server = MockServer::start().await;
    let client = started(server.config()).await;
    let users = client.collection("app.users").unwrap();

    server.fail_next_commands(1, 91);
    assert_ok!(users.insert_one(json!({"name": "ada"})).await);
    assert_eq!(server.commands("insert"), 2);
    assert_eq!(server.documents("app.users").len(), 1);
    client.shutdown();
}

#[tokio::test]
async fn duplicate_key_is_not_retried() {
    let server = MockServer::start().await;
    let client = started(server.config()).await;
    let users = client.collection("app.users").unwrap();

    assert_ok!(users.insert_one(json!({"_id": 1, "name": "ada"})).await);
    let err = assert_err!(users.insert_one(json!({"_id": 1, "name": "grace"})).await);

    match err {
        DriverError::Server(server_error) => assert!(server_error.is_duplicate_key()),
        other => panic!("unexpected error {}", other),
    }
    assert_eq!(server.commands("insert"), 2);
    client.shutdown();
}

#[tokio::test]
async fn retries_can_be_disabled() {
    let server = MockServer::start().await;
    let mut config = server.config();
    config.client.retry_enabled = false;
    let client = started(config).await;
    let users = client.collection("app.users").unwrap();

    server.fail_next_commands(1, 91);
    assert_err!(users.insert_one(json!({"name": "ada"})).await);
    assert_eq!(server.commands("insert"), 1);
    client.shutdown();
}

#[tokio::test]
async fn collection_crud() {
    let server = MockServer::start().await;
    let client = started(server.config()).await;
    let orders = client.collection("shop.orders").unwrap();

    let inserted = orders
        .insert_many(
            vec![
                json!({"_id": 1, "status": "open"}),
                json!({"_id": 2, "status": "open"}),
                json!({"_id": 3, "status": "closed"}),
            ],
            true,
        )
        .await
        .unwrap();
    assert_eq!(inserted.inserted_count, 3);
    assert_eq!(inserted.inserted_ids, vec![json!(1), json!(2), json!(3)]);

    assert_eq!(orders.count_documents(json!({"status": "open"})).await.unwrap(), 2);

    let found = orders.find(json!({"status": "open"}), FindOptions::default()).await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(
        orders.find_one(json!({"_id": 3})).await.unwrap().unwrap()["status"],
        "closed"
    );

    let updated = orders
        .update_many(json!({"status": "open"}), json!({"$set": {"status": "shipped"}}), false)
        .await
        .unwrap();
    assert_eq!(updated.matched_count, 2);
    assert_eq!(updated.modified_count, 2);

    let upserted = orders
        .update_one(json!({"_id": 9}), json!({"$set": {"status": "new"}}), true)
        .await
        .unwrap();
    assert_eq!(upserted.upserted_id, Some(json!(9)));
    assert_eq!(upserted.matched_count, 0);

    let deleted = orders.delete_one(json!({"status": "shipped"})).await.unwrap();
    assert_eq!(deleted.deleted_count, 1);
    let deleted = orders.delete_many(json!({})).await.unwrap();
    assert_eq!(deleted.deleted_count, 3);

    let index = orders.create_index(json!({"status": 1, "created": -1}), false).await.unwrap();
    assert_eq!(index, "status_1_created_-1");
    client.shutdown();
}

#[tokio::test]
async fn reads_follow_read_preference() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start_secondary().await;
    let mut config = config_for(&[&primary, &secondary]);
    config.client.read_preference = "secondary".to_string();
    let client = started(config).await;

    let orders = client.collection("shop.orders").unwrap();
    orders.insert_one(json!({"_id": 1})).await.unwrap();
    orders.find(json!({}), FindOptions::default()).await.unwrap();

    assert_eq!(primary.commands("insert"), 1);
    assert_eq!(primary.commands("find"), 0);
    assert_eq!(secondary.commands("insert"), 0);
    assert_eq!(secondary.commands("find"), 1);
    client.shutdown();
}

#[tokio::test]
async fn unknown_command_surfaces_server_error() {
    let server = MockServer::start().await;
    let client = started(server.config()).await;

    let operation = Operation::Command {
        database: "admin".to_string(),
        command: json!({"frobnicate": 1}),
        retryable: true,
    };
    let err = assert_err!(client.execute(&operation, None).await);
    assert_eq!(err.server_code(), Some(59));
    assert_eq!(server.commands("frobnicate"), 1);

    let ping = Operation::Command {
        database: "admin".to_string(),
        command: json!({"ping": 1}),
        retryable: true,
    };
    let reply = assert_ok!(client.execute(&ping, None).await);
    assert!(matches!(reply, OperationResult::Command(ref doc) if doc["ok"] == 1));
    client.shutdown();
}

#[tokio::test]
async fn shutdown_closes_pools_and_fails_new_operations() {
    let server = MockServer::start().await;
    let client = started(server.config()).await;
    let users = client.collection("app.users").unwrap();
    users.insert_one(json!({"name": "ada"})).await.unwrap();
    let pool = client.topology().pool(&server.endpoint()).unwrap();

    client.shutdown();
    assert!(pool.is_closed());
    assert!(matches!(
        users.insert_one(json!({"name": "grace"})).await,
        Err(DriverError::Shutdown)
    ));
}

#[tokio::test]
async fn connection_string_client() {
    let server = MockServer::start().await;
    let uri = format!("mongodb://{}/?appName=scenarios&maxPoolSize=2", server.endpoint());
    let client = Client::from_uri(&uri).unwrap();
    client.startup().await.unwrap();

    assert_eq!(client.config().pool.max_pool_size, 2);
    let users = client.collection("app.users").unwrap();
    assert_ok!(users.insert_one(json!({"name": "ada"})).await);
    assert!(server.handshakes() >= 2);
    client.shutdown();
}
