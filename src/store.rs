use chrono::{TimeZone, Utc};
use sqlx::AnyPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::db::{self, ChatRecord, ContactRecord, DbKind, MessageRecord};
use crate::error::{Error, Result};
use crate::provider::{ProviderClient, ProviderContact};
use crate::types::{DeliveryReceipt, Direction, InboundMessage, MessageStatus};
use crate::ws::WsEvent;

/// Per-instance sync generation. A connection-state change bumps the
/// generation, and any read-through fetch started under an older one
/// discards its result instead of populating the cache.
#[derive(Clone, Default)]
pub struct SyncGenerations {
    inner: Arc<Mutex<HashMap<String, u64>>>,
}

impl SyncGenerations {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self, instance_id: &str) -> u64 {
        let map = self.inner.lock().await;
        map.get(instance_id).copied().unwrap_or(0)
    }

    pub async fn bump(&self, instance_id: &str) -> u64 {
        let mut map = self.inner.lock().await;
        let entry = map.entry(instance_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }
}

/// Commands applied by the store writer. All chat mutations are funneled
/// through one task so writes to a chat's message sequence are serialized.
pub enum StoreCommand {
    Inbound(InboundMessage),
    Receipt(DeliveryReceipt),
    MarkRead {
        chat_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    pub async fn apply_inbound(&self, msg: InboundMessage) -> Result<()> {
        self.tx
            .send(StoreCommand::Inbound(msg))
            .await
            .map_err(|_| Error::Internal("store writer unavailable".to_string()))
    }

    pub async fn apply_receipt(&self, receipt: DeliveryReceipt) -> Result<()> {
        self.tx
            .send(StoreCommand::Receipt(receipt))
            .await
            .map_err(|_| Error::Internal("store writer unavailable".to_string()))
    }

    /// Mark every inbound message in the chat read. Runs on the writer
    /// task, so an inbound message arriving concurrently is ordered
    /// strictly before or after this call, never marked read by mistake.
    pub async fn mark_as_read(&self, chat_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::MarkRead {
                chat_id: chat_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::Internal("store writer unavailable".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("store writer dropped reply".to_string()))?
    }
}

pub fn spawn_store_writer(
    pool: AnyPool,
    kind: DbKind,
    ws_tx: broadcast::Sender<WsEvent>,
) -> StoreHandle {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(run_store_writer(pool, kind, ws_tx, rx));
    StoreHandle { tx }
}

async fn run_store_writer(
    pool: AnyPool,
    kind: DbKind,
    ws_tx: broadcast::Sender<WsEvent>,
    mut rx: mpsc::Receiver<StoreCommand>,
) {
    info!("store writer started");
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::Inbound(msg) => {
                if let Err(err) = apply_inbound(&pool, kind, &ws_tx, msg).await {
                    error!("inbound apply error: {err}");
                }
            }
            StoreCommand::Receipt(receipt) => {
                if let Err(err) = apply_receipt(&pool, kind, &ws_tx, receipt).await {
                    error!("receipt apply error: {err}");
                }
            }
            StoreCommand::MarkRead { chat_id, reply } => {
                let result = mark_read(&pool, kind, &ws_tx, &chat_id).await;
                let _ = reply.send(result);
            }
        }
    }
    info!("store writer stopped");
}

async fn apply_inbound(
    pool: &AnyPool,
    kind: DbKind,
    ws_tx: &broadcast::Sender<WsEvent>,
    msg: InboundMessage,
) -> Result<()> {
    // Providers redeliver webhooks; the provider message id is the dedupe key.
    if db::find_message_by_provider_id(pool, kind, &msg.provider_message_id)
        .await?
        .is_some()
    {
        debug!(provider_id = %msg.provider_message_id, "duplicate inbound dropped");
        return Ok(());
    }

    let now = Utc::now();
    let contact = match db::get_contact_by_phone(pool, kind, &msg.instance_id, &msg.phone).await? {
        Some(existing) => {
            if msg.sender_name.is_some() && msg.sender_name != existing.display_name {
                let refreshed = ContactRecord {
                    display_name: msg.sender_name.clone(),
                    updated_at: now,
                    ..existing.clone()
                };
                db::upsert_contact(pool, kind, &refreshed).await?;
                refreshed
            } else {
                existing
            }
        }
        None => {
            let record = ContactRecord {
                id: Uuid::new_v4().to_string(),
                instance_id: msg.instance_id.clone(),
                phone: msg.phone.clone(),
                display_name: msg.sender_name.clone(),
                updated_at: now,
            };
            db::upsert_contact(pool, kind, &record).await?;
            record
        }
    };

    let chat = db::get_or_create_chat(pool, kind, &msg.instance_id, &contact.id).await?;
    let arrived_at = msg
        .timestamp
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or(now);

    let record = MessageRecord {
        id: Uuid::new_v4().to_string(),
        chat_id: chat.id.clone(),
        broadcast_job_id: None,
        direction: Direction::Inbound,
        body: msg.body,
        media_url: msg.media.as_ref().map(|m| m.url.clone()),
        media_mime: msg.media.as_ref().and_then(|m| m.mime_type.clone()),
        status: MessageStatus::Delivered,
        provider_message_id: Some(msg.provider_message_id),
        retry_count: 0,
        last_error: None,
        next_attempt_at: arrived_at,
        created_at: arrived_at,
    };
    db::insert_message(pool, kind, &record).await?;
    db::touch_chat(pool, kind, &chat.id, arrived_at).await?;
    db::recompute_unread(pool, kind, &chat.id).await?;

    let _ = ws_tx.send(WsEvent {
        event: "message".to_string(),
        payload: serde_json::json!({"direction": "inbound", "message": record}),
    });
    Ok(())
}

async fn apply_receipt(
    pool: &AnyPool,
    kind: DbKind,
    ws_tx: &broadcast::Sender<WsEvent>,
    receipt: DeliveryReceipt,
) -> Result<()> {
    let Some(message) =
        db::find_message_by_provider_id(pool, kind, &receipt.provider_message_id).await?
    else {
        debug!(provider_id = %receipt.provider_message_id, "receipt for unknown message");
        return Ok(());
    };

    if !message.status.can_advance(receipt.status) {
        debug!(
            message = %message.id,
            from = message.status.as_str(),
            to = receipt.status.as_str(),
            "stale receipt dropped"
        );
        return Ok(());
    }

    db::update_message_status(pool, kind, &message.id, receipt.status).await?;
    if message.direction == Direction::Inbound {
        db::recompute_unread(pool, kind, &message.chat_id).await?;
    }

    let _ = ws_tx.send(WsEvent {
        event: "receipt".to_string(),
        payload: serde_json::json!({
            "message_id": message.id,
            "chat_id": message.chat_id,
            "status": receipt.status,
        }),
    });
    Ok(())
}

async fn mark_read(
    pool: &AnyPool,
    kind: DbKind,
    ws_tx: &broadcast::Sender<WsEvent>,
    chat_id: &str,
) -> Result<()> {
    if db::get_chat(pool, kind, chat_id).await?.is_none() {
        return Err(Error::NotFound("chat"));
    }
    db::mark_chat_read(pool, kind, chat_id).await?;
    let _ = ws_tx.send(WsEvent {
        event: "chat_read".to_string(),
        payload: serde_json::json!({"chat_id": chat_id}),
    });
    Ok(())
}

/// Read-through contact fetch: an empty local set is a miss served from the
/// provider. A result fetched under a stale sync generation is discarded.
pub async fn fetch_contacts(
    pool: &AnyPool,
    kind: DbKind,
    provider: &ProviderClient,
    sync: &SyncGenerations,
    instance_id: &str,
) -> Result<Vec<ContactRecord>> {
    if db::count_contacts(pool, kind, instance_id).await? == 0 {
        let generation = sync.current(instance_id).await;
        let fetched = provider.fetch_contacts(instance_id).await?;
        populate_contacts(pool, kind, sync, instance_id, generation, fetched).await?;
    }
    db::list_contacts(pool, kind, instance_id, None).await
}

/// Writes a fetched contact set, re-checking the sync generation before
/// each upsert. A bump landing mid-population means the rest of the result
/// belongs to a dead session and is discarded.
pub async fn populate_contacts(
    pool: &AnyPool,
    kind: DbKind,
    sync: &SyncGenerations,
    instance_id: &str,
    generation: u64,
    fetched: Vec<ProviderContact>,
) -> Result<()> {
    let now = Utc::now();
    for contact in fetched {
        if sync.current(instance_id).await != generation {
            debug!(instance = %instance_id, "contact fetch superseded, result discarded");
            return Ok(());
        }
        let record = ContactRecord {
            id: Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            phone: contact.phone,
            display_name: contact.display_name,
            updated_at: now,
        };
        db::upsert_contact(pool, kind, &record).await?;
    }
    Ok(())
}

pub async fn search_contacts(
    pool: &AnyPool,
    kind: DbKind,
    provider: &ProviderClient,
    sync: &SyncGenerations,
    instance_id: &str,
    query: &str,
) -> Result<Vec<ContactRecord>> {
    // Populate on miss first so a search against a cold cache still works.
    fetch_contacts(pool, kind, provider, sync, instance_id).await?;
    db::list_contacts(pool, kind, instance_id, Some(query)).await
}

pub async fn fetch_chats(pool: &AnyPool, kind: DbKind, instance_id: &str) -> Result<Vec<ChatRecord>> {
    db::list_chats(pool, kind, instance_id).await
}

pub async fn fetch_messages(
    pool: &AnyPool,
    kind: DbKind,
    chat_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<MessageRecord>> {
    if db::get_chat(pool, kind, chat_id).await?.is_none() {
        return Err(Error::NotFound("chat"));
    }
    db::list_messages(pool, kind, chat_id, limit, offset).await
}
