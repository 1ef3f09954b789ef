use chrono::{Duration, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use tokio::sync::broadcast;
use uuid::Uuid;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wagate::config::{DispatchConfig, ProviderConfig};
use wagate::db::{self, ChatRecord, ContactRecord, DbKind, InstanceRecord};
use wagate::dispatcher::{self, compute_backoff};
use wagate::error::Error;
use wagate::provider::ProviderClient;
use wagate::types::{ConnectionState, MediaRef, MessageStatus};
use wagate::ws::WsEvent;

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

async fn seed_chat(pool: &AnyPool) -> ChatRecord {
    let now = Utc::now();
    let inst = InstanceRecord {
        id: Uuid::new_v4().to_string(),
        name: "main".to_string(),
        state: ConnectionState::Connected,
        webhook_url: None,
        created_at: now,
        updated_at: now,
    };
    db::insert_instance(pool, DbKind::Sqlite, &inst).await.unwrap();
    let contact = ContactRecord {
        id: Uuid::new_v4().to_string(),
        instance_id: inst.id.clone(),
        phone: "+15550001111".to_string(),
        display_name: None,
        updated_at: now,
    };
    db::upsert_contact(pool, DbKind::Sqlite, &contact).await.unwrap();
    db::get_or_create_chat(pool, DbKind::Sqlite, &inst.id, &contact.id)
        .await
        .unwrap()
}

fn ws_channel() -> broadcast::Sender<WsEvent> {
    broadcast::channel(64).0
}

async fn wait_for_status(pool: &AnyPool, message_id: &str, wanted: MessageStatus) {
    for _ in 0..100 {
        let record = db::get_message(pool, DbKind::Sqlite, message_id)
            .await
            .unwrap()
            .unwrap();
        if record.status == wanted {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("message {message_id} never reached {wanted:?}");
}

#[test]
fn test_backoff_progression() {
    assert_eq!(compute_backoff(1), Duration::seconds(5));
    assert_eq!(compute_backoff(2), Duration::seconds(10));
    assert_eq!(compute_backoff(3), Duration::seconds(20));
    assert_eq!(compute_backoff(9), Duration::seconds(300));
    assert_eq!(compute_backoff(0), Duration::seconds(5));
}

#[tokio::test]
async fn test_send_text_queues_message() {
    let pool = test_pool().await;
    let chat = seed_chat(&pool).await;
    let ws_tx = ws_channel();

    let record = dispatcher::send_text(&pool, DbKind::Sqlite, &ws_tx, &chat.id, "hello there")
        .await
        .unwrap();
    assert_eq!(record.status, MessageStatus::Queued);
    assert_eq!(record.body, Some("hello there".to_string()));

    let batch = db::claim_due_outbound(&pool, DbKind::Sqlite, Utc::now(), 10)
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message_id, record.id);
}

#[tokio::test]
async fn test_send_text_validations() {
    let pool = test_pool().await;
    let chat = seed_chat(&pool).await;
    let ws_tx = ws_channel();

    let err = dispatcher::send_text(&pool, DbKind::Sqlite, &ws_tx, &chat.id, "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));

    let err = dispatcher::send_text(&pool, DbKind::Sqlite, &ws_tx, "ghost", "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound("chat")));
}

#[tokio::test]
async fn test_send_media_queues_with_mime() {
    let pool = test_pool().await;
    let chat = seed_chat(&pool).await;
    let ws_tx = ws_channel();

    let media = MediaRef {
        url: "https://cdn.example.com/invoice.pdf".to_string(),
        mime_type: Some("application/pdf".to_string()),
        filename: None,
    };
    let record = dispatcher::send_media(
        &pool,
        DbKind::Sqlite,
        &ws_tx,
        &chat.id,
        media,
        Some("your invoice".to_string()),
    )
    .await
    .unwrap();
    assert_eq!(record.status, MessageStatus::Queued);
    assert_eq!(record.media_url, Some("https://cdn.example.com/invoice.pdf".to_string()));
    assert_eq!(record.media_mime, Some("application/pdf".to_string()));
    assert_eq!(record.body, Some("your invoice".to_string()));
}

#[tokio::test]
async fn test_worker_marks_sent_on_ack() {
    let pool = test_pool().await;
    let chat = seed_chat(&pool).await;
    let ws_tx = ws_channel();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/instances/[^/]+/send$"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"message_id": "wamid.ok"})),
        )
        .mount(&server)
        .await;
    let provider = ProviderClient::new(&ProviderConfig {
        base_url: server.uri(),
        api_key: None,
        timeout_seconds: 5,
    });

    let record = dispatcher::send_text(&pool, DbKind::Sqlite, &ws_tx, &chat.id, "ping")
        .await
        .unwrap();

    let worker = tokio::spawn(dispatcher::start_dispatch_worker(
        pool.clone(),
        DbKind::Sqlite,
        provider,
        ws_tx,
        DispatchConfig {
            poll_seconds: 1,
            batch_size: 10,
            max_retries: 3,
        },
    ));

    wait_for_status(&pool, &record.id, MessageStatus::Sent).await;
    let sent = db::get_message(&pool, DbKind::Sqlite, &record.id).await.unwrap().unwrap();
    assert_eq!(sent.provider_message_id, Some("wamid.ok".to_string()));
    worker.abort();
}

#[tokio::test]
async fn test_worker_fails_terminally_on_rejection() {
    let pool = test_pool().await;
    let chat = seed_chat(&pool).await;
    let ws_tx = ws_channel();

    // a 4xx/5xx rejection is not a connection error, so no retry loop
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/instances/[^/]+/send$"))
        .respond_with(ResponseTemplate::new(500).set_body_string("broken pipe to phone"))
        .mount(&server)
        .await;
    let provider = ProviderClient::new(&ProviderConfig {
        base_url: server.uri(),
        api_key: None,
        timeout_seconds: 5,
    });

    let first = dispatcher::send_text(&pool, DbKind::Sqlite, &ws_tx, &chat.id, "doomed")
        .await
        .unwrap();
    let second = dispatcher::send_text(&pool, DbKind::Sqlite, &ws_tx, &chat.id, "also doomed")
        .await
        .unwrap();

    let worker = tokio::spawn(dispatcher::start_dispatch_worker(
        pool.clone(),
        DbKind::Sqlite,
        provider,
        ws_tx,
        DispatchConfig {
            poll_seconds: 1,
            batch_size: 10,
            max_retries: 3,
        },
    ));

    // per-message independent failure: both reach terminal failed
    wait_for_status(&pool, &first.id, MessageStatus::Failed).await;
    wait_for_status(&pool, &second.id, MessageStatus::Failed).await;

    let failed = db::get_message(&pool, DbKind::Sqlite, &first.id).await.unwrap().unwrap();
    assert!(failed.last_error.unwrap_or_default().contains("500"));
    worker.abort();
}
