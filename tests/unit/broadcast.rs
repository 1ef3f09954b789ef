use std::collections::HashMap;

use chrono::{Duration, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tokio::sync::broadcast;
use uuid::Uuid;

use wagate::broadcast::{broadcast_status, render_template, send_broadcast, send_schedule};
use wagate::db::{self, ContactRecord, DbKind, InstanceRecord, TemplateRecord};
use wagate::error::Error;
use wagate::types::ConnectionState;
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

fn ws_channel() -> broadcast::Sender<WsEvent> {
    broadcast::channel(64).0
}

async fn seed_instance(pool: &AnyPool) -> String {
    let now = Utc::now();
    let inst = InstanceRecord {
        id: Uuid::new_v4().to_string(),
        name: "sender".to_string(),
        state: ConnectionState::Connected,
        webhook_url: None,
        created_at: now,
        updated_at: now,
    };
    db::insert_instance(pool, DbKind::Sqlite, &inst).await.unwrap();
    inst.id
}

async fn seed_contacts(pool: &AnyPool, instance_id: &str, n: usize) -> Vec<String> {
    let mut ids = Vec::new();
    for i in 0..n {
        let contact = ContactRecord {
            id: Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            phone: format!("+1555000{:04}", i),
            display_name: Some(format!("Member {i}")),
            updated_at: Utc::now(),
        };
        db::upsert_contact(pool, DbKind::Sqlite, &contact).await.unwrap();
        ids.push(contact.id);
    }
    ids
}

async fn seed_list(pool: &AnyPool, members: &[String]) -> String {
    let list_id = Uuid::new_v4().to_string();
    db::insert_broadcast_list(pool, DbKind::Sqlite, &list_id, "leads").await.unwrap();
    db::replace_broadcast_members(pool, DbKind::Sqlite, &list_id, members)
        .await
        .unwrap();
    list_id
}

async fn seed_template(pool: &AnyPool, body: &str) -> String {
    let now = Utc::now();
    let template = TemplateRecord {
        id: Uuid::new_v4().to_string(),
        name: "promo".to_string(),
        body: body.to_string(),
        created_at: now,
        updated_at: now,
    };
    db::insert_template(pool, DbKind::Sqlite, &template).await.unwrap();
    template.id
}

#[test]
fn test_render_template_substitution() {
    let mut params = HashMap::new();
    params.insert("name".to_string(), "Ada".to_string());
    params.insert("code".to_string(), "X42".to_string());
    let out = render_template("Hi {{name}}, use {{code}}. Bye {{name}}!", &params);
    assert_eq!(out, "Hi Ada, use X42. Bye Ada!");
}

#[test]
fn test_render_template_leaves_unknown_placeholders() {
    let params = HashMap::new();
    let out = render_template("Hi {{name}}", &params);
    assert_eq!(out, "Hi {{name}}");
}

#[test]
fn test_schedule_spans_three_seconds_for_triple_rate() {
    // 3K messages at K per second can never finish in under 3 seconds
    for rate in [1u32, 7, 10, 50] {
        let n = (rate as usize) * 3;
        let offsets = send_schedule(n, rate);
        assert_eq!(offsets.len(), n);
        assert!(offsets[n - 1] >= Duration::seconds(3), "rate {rate}");
    }
}

#[test]
fn test_schedule_honors_rate_ceiling() {
    let rate = 10u32;
    let offsets = send_schedule(100, rate);
    for window_start in 0..9 {
        let lo = Duration::seconds(window_start);
        let hi = Duration::seconds(window_start + 1);
        let in_window = offsets.iter().filter(|o| **o >= lo && **o < hi).count();
        assert!(in_window <= rate as usize, "window {window_start}: {in_window}");
    }
}

#[test]
fn test_schedule_zero_rate_clamped() {
    let offsets = send_schedule(2, 0);
    assert_eq!(offsets[0], Duration::seconds(1));
    assert_eq!(offsets[1], Duration::seconds(2));
}

#[tokio::test]
async fn test_broadcast_fans_out_independent_messages() {
    let pool = test_pool().await;
    let ws_tx = ws_channel();
    let instance_id = seed_instance(&pool).await;
    let members = seed_contacts(&pool, &instance_id, 6).await;
    let list_id = seed_list(&pool, &members).await;
    let template_id = seed_template(&pool, "Hello {{name}}").await;

    let mut params = HashMap::new();
    params.insert("name".to_string(), "friend".to_string());
    let job = send_broadcast(&pool, DbKind::Sqlite, &ws_tx, &list_id, &template_id, &params, 2)
        .await
        .unwrap();
    assert_eq!(job.status, "running");
    assert_eq!(job.recipient_count, 6);

    let rows = sqlx::query(
        "SELECT chat_id, body, status, next_attempt_at FROM messages WHERE broadcast_job_id = ? ORDER BY next_attempt_at",
    )
    .bind(&job.id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 6);

    let mut chats = std::collections::HashSet::new();
    for row in &rows {
        assert_eq!(row.get::<Option<String>, _>("body").as_deref(), Some("Hello friend"));
        assert_eq!(row.get::<String, _>("status"), "queued");
        chats.insert(row.get::<String, _>("chat_id"));
    }
    // one message per member, each in its own chat
    assert_eq!(chats.len(), 6);

    // 6 sends at 2/s are staggered across at least 3 seconds
    let first = rows.first().unwrap().get::<i64, _>("next_attempt_at");
    let last = rows.last().unwrap().get::<i64, _>("next_attempt_at");
    assert!(last - first >= 2, "span {}s", last - first);
}

#[tokio::test]
async fn test_broadcast_missing_inputs() {
    let pool = test_pool().await;
    let ws_tx = ws_channel();
    let instance_id = seed_instance(&pool).await;
    let members = seed_contacts(&pool, &instance_id, 2).await;
    let list_id = seed_list(&pool, &members).await;
    let template_id = seed_template(&pool, "hi").await;
    let params = HashMap::new();

    let err = send_broadcast(&pool, DbKind::Sqlite, &ws_tx, "ghost", &template_id, &params, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound("broadcast list")));

    let err = send_broadcast(&pool, DbKind::Sqlite, &ws_tx, &list_id, "ghost", &params, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound("template")));

    let empty = seed_list(&pool, &[]).await;
    let err = send_broadcast(&pool, DbKind::Sqlite, &ws_tx, &empty, &template_id, &params, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}

#[tokio::test]
async fn test_broadcast_completes_when_no_sends_remain() {
    let pool = test_pool().await;
    let ws_tx = ws_channel();
    let instance_id = seed_instance(&pool).await;
    let members = seed_contacts(&pool, &instance_id, 3).await;
    let list_id = seed_list(&pool, &members).await;
    let template_id = seed_template(&pool, "ping").await;
    let params = HashMap::new();

    let job = send_broadcast(&pool, DbKind::Sqlite, &ws_tx, &list_id, &template_id, &params, 10)
        .await
        .unwrap();

    // still running while any message is queued
    db::sweep_completed_broadcasts(&pool, DbKind::Sqlite).await.unwrap();
    let (status, _) = broadcast_status(&pool, DbKind::Sqlite, &job.id).await.unwrap();
    assert_eq!(status.status, "running");

    let rows = sqlx::query("SELECT id FROM messages WHERE broadcast_job_id = ?")
        .bind(&job.id)
        .fetch_all(&pool)
        .await
        .unwrap();
    let ids: Vec<String> = rows.iter().map(|r| r.get("id")).collect();
    db::mark_message_sent(&pool, DbKind::Sqlite, &ids[0], "wamid.1").await.unwrap();
    db::mark_message_sent(&pool, DbKind::Sqlite, &ids[1], "wamid.2").await.unwrap();
    db::mark_message_failed(&pool, DbKind::Sqlite, &ids[2], 5, "number not on whatsapp")
        .await
        .unwrap();

    // a failed recipient does not block the rest from finishing the job
    db::sweep_completed_broadcasts(&pool, DbKind::Sqlite).await.unwrap();
    let (status, counts) = broadcast_status(&pool, DbKind::Sqlite, &job.id).await.unwrap();
    assert_eq!(status.status, "completed");
    let sent = counts.iter().find(|(s, _)| s == "sent").map(|(_, n)| *n);
    let failed = counts.iter().find(|(s, _)| s == "failed").map(|(_, n)| *n);
    assert_eq!(sent, Some(2));
    assert_eq!(failed, Some(1));
}
