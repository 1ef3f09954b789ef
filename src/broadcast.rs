use chrono::{Duration, Utc};
use sqlx::AnyPool;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, BroadcastJobRecord, DbKind, MessageRecord};
use crate::error::{Error, Result};
use crate::types::{Direction, MessageStatus};
use crate::ws::WsEvent;

/// Fill `{{param}}` placeholders from the params map. Placeholders with no
/// matching param are left verbatim so the gap is visible to the operator.
pub fn render_template(body: &str, params: &HashMap<String, String>) -> String {
    let mut out = body.to_string();
    for (key, value) in params {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

/// Release offsets for `n` sends under a ceiling of `rate_per_second`.
/// The i-th send is released at (i+1)/rate, so no one-second window ever
/// contains more than `rate_per_second` sends and a fan-out of 3K messages
/// at ceiling K spans at least 3 seconds.
pub fn send_schedule(n: usize, rate_per_second: u32) -> Vec<Duration> {
    let rate = rate_per_second.max(1) as i64;
    (0..n)
        .map(|i| Duration::milliseconds(((i as i64 + 1) * 1000) / rate))
        .collect()
}

/// Expand one template send into one independent outbound message per list
/// member, paced by staggered `next_attempt_at` values that the dispatch
/// worker honors.
pub async fn send_broadcast(
    pool: &AnyPool,
    kind: DbKind,
    ws_tx: &broadcast::Sender<WsEvent>,
    list_id: &str,
    template_id: &str,
    params: &HashMap<String, String>,
    rate_per_second: u32,
) -> Result<BroadcastJobRecord> {
    let list = db::get_broadcast_list(pool, kind, list_id)
        .await?
        .ok_or(Error::NotFound("broadcast list"))?;
    let template = db::get_template(pool, kind, template_id)
        .await?
        .ok_or(Error::NotFound("template"))?;

    let member_ids = db::list_broadcast_members(pool, kind, list_id).await?;
    if member_ids.is_empty() {
        return Err(Error::Invalid("broadcast list has no members".to_string()));
    }

    // Members referencing a contact deleted since the list was built are
    // skipped rather than aborting the whole fan-out.
    let mut contacts = Vec::new();
    for contact_id in &member_ids {
        match db::get_contact(pool, kind, contact_id).await? {
            Some(contact) => contacts.push(contact),
            None => warn!(list = %list_id, contact = %contact_id, "skipping missing contact"),
        }
    }
    if contacts.is_empty() {
        return Err(Error::Invalid("broadcast list has no resolvable members".to_string()));
    }

    let body = render_template(&template.body, params);
    let now = Utc::now();
    let job = BroadcastJobRecord {
        id: Uuid::new_v4().to_string(),
        list_id: list_id.to_string(),
        template_id: template_id.to_string(),
        status: "running".to_string(),
        recipient_count: contacts.len() as i64,
        created_at: now,
    };
    db::insert_broadcast_job(pool, kind, &job).await?;

    let offsets = send_schedule(contacts.len(), rate_per_second);
    for (contact, offset) in contacts.iter().zip(offsets) {
        let chat = db::get_or_create_chat(pool, kind, &contact.instance_id, &contact.id).await?;
        let record = MessageRecord {
            id: Uuid::new_v4().to_string(),
            chat_id: chat.id,
            broadcast_job_id: Some(job.id.clone()),
            direction: Direction::Outbound,
            body: Some(body.clone()),
            media_url: None,
            media_mime: None,
            status: MessageStatus::Queued,
            provider_message_id: None,
            retry_count: 0,
            last_error: None,
            next_attempt_at: now + offset,
            created_at: now,
        };
        db::insert_message(pool, kind, &record).await?;
    }

    info!(
        job = %job.id,
        list = %list.name,
        recipients = contacts.len(),
        "broadcast queued"
    );
    let _ = ws_tx.send(WsEvent {
        event: "broadcast".to_string(),
        payload: serde_json::json!({
            "job_id": job.id,
            "status": "running",
            "recipients": contacts.len(),
        }),
    });
    Ok(job)
}

/// Job record plus per-status message counts.
pub async fn broadcast_status(
    pool: &AnyPool,
    kind: DbKind,
    job_id: &str,
) -> Result<(BroadcastJobRecord, Vec<(String, i64)>)> {
    let job = db::get_broadcast_job(pool, kind, job_id)
        .await?
        .ok_or(Error::NotFound("broadcast job"))?;
    let counts = db::broadcast_status_counts(pool, kind, job_id).await?;
    Ok((job, counts))
}
