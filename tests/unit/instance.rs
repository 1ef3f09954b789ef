use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wagate::config::ProviderConfig;
use wagate::db::{self, DbKind};
use wagate::error::Error;
use wagate::instance;
use wagate::provider::ProviderClient;
use wagate::store::SyncGenerations;
use wagate::types::ConnectionState;

async fn test_pool() -> AnyPool {
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect in-memory sqlite");
    db::init_db(&pool, DbKind::Sqlite).await.expect("init schema");
    pool
}

async fn mock_provider() -> (MockServer, ProviderClient) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/instances$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/instances/[^/]+/qr$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"qr": "2@abc"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/instances/[^/]+/disconnect$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = ProviderClient::new(&ProviderConfig {
        base_url: server.uri(),
        api_key: None,
        timeout_seconds: 5,
    });
    (server, client)
}

#[tokio::test]
async fn test_lifecycle_walk() {
    let pool = test_pool().await;
    let (_server, provider) = mock_provider().await;
    let sync = SyncGenerations::new();

    // create -> pairing
    let created = instance::create_instance(&pool, DbKind::Sqlite, &provider, "sales", None)
        .await
        .unwrap();
    assert_eq!(created.state, ConnectionState::Pairing);
    assert_eq!(
        instance::get_connection_state(&pool, DbKind::Sqlite, &created.id).await.unwrap(),
        ConnectionState::Pairing
    );

    // provider reports connected
    let applied = instance::apply_connection_event(
        &pool,
        DbKind::Sqlite,
        &sync,
        &created.id,
        ConnectionState::Connected,
    )
    .await
    .unwrap();
    assert!(applied);
    assert_eq!(
        instance::get_connection_state(&pool, DbKind::Sqlite, &created.id).await.unwrap(),
        ConnectionState::Connected
    );

    // disconnect is terminal and idempotent
    let state = instance::disconnect_instance(&pool, DbKind::Sqlite, &provider, &sync, &created.id)
        .await
        .unwrap();
    assert_eq!(state, ConnectionState::Disconnected);
    let state = instance::disconnect_instance(&pool, DbKind::Sqlite, &provider, &sync, &created.id)
        .await
        .unwrap();
    assert_eq!(state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_qr_while_pairing() {
    let pool = test_pool().await;
    let (_server, provider) = mock_provider().await;

    let created = instance::create_instance(&pool, DbKind::Sqlite, &provider, "sales", None)
        .await
        .unwrap();
    let qr = instance::get_qr_code(&pool, DbKind::Sqlite, &provider, &created.id)
        .await
        .unwrap();
    assert_eq!(qr, "2@abc");
}

#[tokio::test]
async fn test_qr_rejected_when_connected() {
    let pool = test_pool().await;
    let (_server, provider) = mock_provider().await;
    let sync = SyncGenerations::new();

    let created = instance::create_instance(&pool, DbKind::Sqlite, &provider, "sales", None)
        .await
        .unwrap();
    instance::apply_connection_event(
        &pool,
        DbKind::Sqlite,
        &sync,
        &created.id,
        ConnectionState::Connected,
    )
    .await
    .unwrap();

    let err = instance::get_qr_code(&pool, DbKind::Sqlite, &provider, &created.id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotPairing));
}

#[tokio::test]
async fn test_qr_reenters_pairing_after_disconnect() {
    let pool = test_pool().await;
    let (_server, provider) = mock_provider().await;
    let sync = SyncGenerations::new();

    let created = instance::create_instance(&pool, DbKind::Sqlite, &provider, "sales", None)
        .await
        .unwrap();
    instance::apply_connection_event(
        &pool,
        DbKind::Sqlite,
        &sync,
        &created.id,
        ConnectionState::Connected,
    )
    .await
    .unwrap();
    instance::disconnect_instance(&pool, DbKind::Sqlite, &provider, &sync, &created.id)
        .await
        .unwrap();

    instance::get_qr_code(&pool, DbKind::Sqlite, &provider, &created.id)
        .await
        .unwrap();
    assert_eq!(
        instance::get_connection_state(&pool, DbKind::Sqlite, &created.id).await.unwrap(),
        ConnectionState::Pairing
    );
}

#[tokio::test]
async fn test_unknown_instance() {
    let pool = test_pool().await;
    let (_server, provider) = mock_provider().await;
    let sync = SyncGenerations::new();

    let err = instance::get_connection_state(&pool, DbKind::Sqlite, "ghost")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound("instance")));

    let err = instance::get_qr_code(&pool, DbKind::Sqlite, &provider, "ghost")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound("instance")));

    let err = instance::disconnect_instance(&pool, DbKind::Sqlite, &provider, &sync, "ghost")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound("instance")));
}

#[tokio::test]
async fn test_illegal_transition_dropped() {
    let pool = test_pool().await;
    let (_server, provider) = mock_provider().await;
    let sync = SyncGenerations::new();

    let created = instance::create_instance(&pool, DbKind::Sqlite, &provider, "sales", None)
        .await
        .unwrap();
    instance::disconnect_instance(&pool, DbKind::Sqlite, &provider, &sync, &created.id)
        .await
        .unwrap();

    // connected straight from disconnected is not a legal transition
    let applied = instance::apply_connection_event(
        &pool,
        DbKind::Sqlite,
        &sync,
        &created.id,
        ConnectionState::Connected,
    )
    .await
    .unwrap();
    assert!(!applied);
    assert_eq!(
        instance::get_connection_state(&pool, DbKind::Sqlite, &created.id).await.unwrap(),
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_state_change_bumps_sync_generation() {
    let pool = test_pool().await;
    let (_server, provider) = mock_provider().await;
    let sync = SyncGenerations::new();

    let created = instance::create_instance(&pool, DbKind::Sqlite, &provider, "sales", None)
        .await
        .unwrap();
    assert_eq!(sync.current(&created.id).await, 0);

    instance::apply_connection_event(
        &pool,
        DbKind::Sqlite,
        &sync,
        &created.id,
        ConnectionState::Connected,
    )
    .await
    .unwrap();
    assert_eq!(sync.current(&created.id).await, 1);

    instance::disconnect_instance(&pool, DbKind::Sqlite, &provider, &sync, &created.id)
        .await
        .unwrap();
    assert_eq!(sync.current(&created.id).await, 2);
}

#[tokio::test]
async fn test_create_rejects_blank_name() {
    let pool = test_pool().await;
    let (_server, provider) = mock_provider().await;

    let err = instance::create_instance(&pool, DbKind::Sqlite, &provider, "   ", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}
