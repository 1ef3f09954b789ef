use chrono::{Duration, Utc};
use sqlx::AnyPool;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::db::{self, DbKind, DispatchItem, MessageRecord};
use crate::error::{Error, Result};
use crate::provider::ProviderClient;
use crate::types::{Direction, MediaRef, MessageStatus};
use crate::ws::WsEvent;

pub fn compute_backoff(retry_count: i32) -> Duration {
    let exponent = (retry_count.max(1) - 1).min(8) as u32;
    let base = 2_i64.pow(exponent);
    Duration::seconds((base * 5).min(300))
}

/// Queue a text message for delivery. The message is persisted as `queued`
/// and picked up by the dispatch worker; the caller gets the id back
/// immediately.
pub async fn send_text(
    pool: &AnyPool,
    kind: DbKind,
    ws_tx: &broadcast::Sender<WsEvent>,
    chat_id: &str,
    body: &str,
) -> Result<MessageRecord> {
    if body.trim().is_empty() {
        return Err(Error::Invalid("message body is empty".to_string()));
    }
    enqueue(pool, kind, ws_tx, chat_id, Some(body.to_string()), None).await
}

pub async fn send_media(
    pool: &AnyPool,
    kind: DbKind,
    ws_tx: &broadcast::Sender<WsEvent>,
    chat_id: &str,
    media: MediaRef,
    caption: Option<String>,
) -> Result<MessageRecord> {
    if media.url.trim().is_empty() {
        return Err(Error::Invalid("media url is empty".to_string()));
    }
    enqueue(pool, kind, ws_tx, chat_id, caption, Some(media)).await
}

async fn enqueue(
    pool: &AnyPool,
    kind: DbKind,
    ws_tx: &broadcast::Sender<WsEvent>,
    chat_id: &str,
    body: Option<String>,
    media: Option<MediaRef>,
) -> Result<MessageRecord> {
    if db::get_chat(pool, kind, chat_id).await?.is_none() {
        return Err(Error::NotFound("chat"));
    }

    let now = Utc::now();
    let record = MessageRecord {
        id: Uuid::new_v4().to_string(),
        chat_id: chat_id.to_string(),
        broadcast_job_id: None,
        direction: Direction::Outbound,
        body,
        media_url: media.as_ref().map(|m| m.url.clone()),
        media_mime: media.as_ref().and_then(|m| m.mime_type.clone()),
        status: MessageStatus::Queued,
        provider_message_id: None,
        retry_count: 0,
        last_error: None,
        next_attempt_at: now,
        created_at: now,
    };
    db::insert_message(pool, kind, &record).await?;
    db::touch_chat(pool, kind, chat_id, now).await?;

    let _ = ws_tx.send(WsEvent {
        event: "message".to_string(),
        payload: serde_json::json!({"direction": "outbound", "message": record}),
    });
    Ok(record)
}

/// Dispatch loop: claim due queued messages, push them through the
/// provider, and advance their status. One failed message never blocks the
/// rest of the batch.
pub async fn start_dispatch_worker(
    pool: AnyPool,
    kind: DbKind,
    provider: ProviderClient,
    ws_tx: broadcast::Sender<WsEvent>,
    cfg: DispatchConfig,
) {
    info!("dispatch worker started");
    loop {
        let now = Utc::now();
        match db::claim_due_outbound(&pool, kind, now, cfg.batch_size).await {
            Ok(batch) => {
                for item in batch {
                    if let Err(err) =
                        dispatch_item(&pool, kind, &provider, &ws_tx, &cfg, &item).await
                    {
                        error!(message = %item.message_id, "dispatch error: {err}");
                    }
                }
                if let Ok(swept) = db::sweep_completed_broadcasts(&pool, kind).await {
                    if swept > 0 {
                        info!(jobs = swept, "broadcast jobs completed");
                    }
                }
            }
            Err(err) => error!("outbound claim error: {err}"),
        }
        sleep(std::time::Duration::from_secs(cfg.poll_seconds)).await;
    }
}

async fn dispatch_item(
    pool: &AnyPool,
    kind: DbKind,
    provider: &ProviderClient,
    ws_tx: &broadcast::Sender<WsEvent>,
    cfg: &DispatchConfig,
    item: &DispatchItem,
) -> Result<()> {
    let attempt = match item.media_url.as_deref() {
        Some(url) => {
            provider
                .send_media(
                    &item.instance_id,
                    &item.phone,
                    url,
                    item.media_mime.as_deref(),
                    item.body.as_deref(),
                )
                .await
        }
        None => {
            let body = item.body.as_deref().unwrap_or_default();
            provider.send_text(&item.instance_id, &item.phone, body).await
        }
    };

    match attempt {
        Ok(provider_message_id) => {
            db::mark_message_sent(pool, kind, &item.message_id, &provider_message_id).await?;
            let _ = ws_tx.send(WsEvent {
                event: "receipt".to_string(),
                payload: serde_json::json!({
                    "message_id": item.message_id,
                    "status": MessageStatus::Sent,
                }),
            });
            Ok(())
        }
        Err(err) => {
            let retry = item.retry_count + 1;
            if err.is_retryable() && retry < cfg.max_retries {
                let next = Utc::now() + compute_backoff(retry);
                db::schedule_message_retry(
                    pool,
                    kind,
                    &item.message_id,
                    retry,
                    next,
                    &err.to_string(),
                )
                .await?;
            } else {
                db::mark_message_failed(pool, kind, &item.message_id, retry, &err.to_string())
                    .await?;
                let _ = ws_tx.send(WsEvent {
                    event: "receipt".to_string(),
                    payload: serde_json::json!({
                        "message_id": item.message_id,
                        "status": MessageStatus::Failed,
                        "error": err.to_string(),
                    }),
                });
            }
            Err(err)
        }
    }
}
