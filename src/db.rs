use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{AnyPool, Row};
use std::borrow::Cow;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{ConnectionState, Direction, MessageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub state: ConnectionState,
    pub webhook_url: Option<String>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: String,
    pub instance_id: String,
    pub phone: String,
    pub display_name: Option<String>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: String,
    pub instance_id: String,
    pub contact_id: String,
    pub unread_count: i64,
    pub last_message_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub chat_id: String,
    pub broadcast_job_id: Option<String>,
    pub direction: Direction,
    pub body: Option<String>,
    pub media_url: Option<String>,
    pub media_mime: Option<String>,
    pub status: MessageStatus,
    pub provider_message_id: Option<String>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub next_attempt_at: DateTime<Utc>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub id: String,
    pub name: String,
    pub body: String,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastListRecord {
    pub id: String,
    pub name: String,
    pub member_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastJobRecord {
    pub id: String,
    pub list_id: String,
    pub template_id: String,
    pub status: String,
    pub recipient_count: i64,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

/// One claimable outbound message joined with its routing data.
#[derive(Debug, Clone)]
pub struct DispatchItem {
    pub message_id: String,
    pub instance_id: String,
    pub phone: String,
    pub body: Option<String>,
    pub media_url: Option<String>,
    pub media_mime: Option<String>,
    pub retry_count: i32,
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS instances (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            state TEXT NOT NULL,
            webhook_url TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS contacts (
            id TEXT PRIMARY KEY,
            instance_id TEXT NOT NULL,
            phone TEXT NOT NULL,
            display_name TEXT,
            updated_at INTEGER NOT NULL,
            UNIQUE(instance_id, phone)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS chats (
            id TEXT PRIMARY KEY,
            instance_id TEXT NOT NULL,
            contact_id TEXT NOT NULL,
            unread_count INTEGER NOT NULL DEFAULT 0,
            last_message_at INTEGER,
            UNIQUE(instance_id, contact_id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            broadcast_job_id TEXT,
            direction TEXT NOT NULL,
            body TEXT,
            media_url TEXT,
            media_mime TEXT,
            status TEXT NOT NULL,
            provider_message_id TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            next_attempt_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, created_at)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_provider ON messages(provider_message_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_due ON messages(status, next_attempt_at)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_job ON messages(broadcast_job_id)"#,
        r#"CREATE TABLE IF NOT EXISTS templates (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS broadcast_lists (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS broadcast_members (
            list_id TEXT NOT NULL,
            contact_id TEXT NOT NULL,
            PRIMARY KEY (list_id, contact_id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS broadcast_jobs (
            id TEXT PRIMARY KEY,
            list_id TEXT NOT NULL,
            template_id TEXT NOT NULL,
            status TEXT NOT NULL,
            recipient_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

// --- instances ---

pub async fn insert_instance(pool: &AnyPool, kind: DbKind, record: &InstanceRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO instances (id, name, state, webhook_url, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.name)
        .bind(record.state.as_str())
        .bind(record.webhook_url.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

fn instance_from_row(row: &sqlx::any::AnyRow) -> Result<InstanceRecord> {
    let state: String = row.try_get("state")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(InstanceRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        state: ConnectionState::parse(&state).unwrap_or(ConnectionState::Disconnected),
        webhook_url: row.try_get("webhook_url")?,
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
    })
}

pub async fn get_instance(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<InstanceRecord>> {
    let sql = rewrite_sql(
        "SELECT id, name, state, webhook_url, created_at, updated_at FROM instances WHERE id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    match row {
        Some(row) => Ok(Some(instance_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn list_instances(pool: &AnyPool, kind: DbKind) -> Result<Vec<InstanceRecord>> {
    let sql = rewrite_sql(
        "SELECT id, name, state, webhook_url, created_at, updated_at FROM instances ORDER BY created_at ASC",
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).fetch_all(pool).await?;
    let mut result = Vec::new();
    for row in rows {
        result.push(instance_from_row(&row)?);
    }
    Ok(result)
}

pub async fn set_instance_state(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    state: ConnectionState,
) -> Result<()> {
    let sql = rewrite_sql("UPDATE instances SET state = ?, updated_at = ? WHERE id = ?", kind);
    sqlx::query(sql.as_ref())
        .bind(state.as_str())
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// --- contacts ---

pub async fn upsert_contact(pool: &AnyPool, kind: DbKind, record: &ContactRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO contacts (id, instance_id, phone, display_name, updated_at)
           VALUES (?, ?, ?, ?, ?)
           ON CONFLICT(instance_id, phone) DO UPDATE SET
               display_name=excluded.display_name,
               updated_at=excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.instance_id)
        .bind(&record.phone)
        .bind(record.display_name.as_deref())
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

fn contact_from_row(row: &sqlx::any::AnyRow) -> Result<ContactRecord> {
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(ContactRecord {
        id: row.try_get("id")?,
        instance_id: row.try_get("instance_id")?,
        phone: row.try_get("phone")?,
        display_name: row.try_get("display_name")?,
        updated_at: i64_to_datetime(updated_at),
    })
}

pub async fn get_contact(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<ContactRecord>> {
    let sql = rewrite_sql(
        "SELECT id, instance_id, phone, display_name, updated_at FROM contacts WHERE id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    match row {
        Some(row) => Ok(Some(contact_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn get_contact_by_phone(
    pool: &AnyPool,
    kind: DbKind,
    instance_id: &str,
    phone: &str,
) -> Result<Option<ContactRecord>> {
    let sql = rewrite_sql(
        "SELECT id, instance_id, phone, display_name, updated_at FROM contacts WHERE instance_id = ? AND phone = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(instance_id)
        .bind(phone)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(Some(contact_from_row(&row)?)),
        None => Ok(None),
    }
}

/// List contacts for an instance, optionally filtered by a case-insensitive
/// substring match on display name or phone.
pub async fn list_contacts(
    pool: &AnyPool,
    kind: DbKind,
    instance_id: &str,
    query: Option<&str>,
) -> Result<Vec<ContactRecord>> {
    let rows = match query {
        Some(q) if !q.trim().is_empty() => {
            let pattern = format!("%{}%", q.trim().to_lowercase());
            let sql = rewrite_sql(
                r#"SELECT id, instance_id, phone, display_name, updated_at
                   FROM contacts
                   WHERE instance_id = ?
                     AND (LOWER(COALESCE(display_name, '')) LIKE ? OR LOWER(phone) LIKE ?)
                   ORDER BY display_name ASC"#,
                kind,
            );
            sqlx::query(sql.as_ref())
                .bind(instance_id)
                .bind(&pattern)
                .bind(&pattern)
                .fetch_all(pool)
                .await?
        }
        _ => {
            let sql = rewrite_sql(
                r#"SELECT id, instance_id, phone, display_name, updated_at
                   FROM contacts WHERE instance_id = ? ORDER BY display_name ASC"#,
                kind,
            );
            sqlx::query(sql.as_ref()).bind(instance_id).fetch_all(pool).await?
        }
    };

    let mut result = Vec::new();
    for row in rows {
        result.push(contact_from_row(&row)?);
    }
    Ok(result)
}

pub async fn count_contacts(pool: &AnyPool, kind: DbKind, instance_id: &str) -> Result<i64> {
    let sql = rewrite_sql("SELECT COUNT(1) FROM contacts WHERE instance_id = ?", kind);
    let count = sqlx::query_scalar::<_, i64>(sql.as_ref())
        .bind(instance_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// --- chats ---

fn chat_from_row(row: &sqlx::any::AnyRow) -> Result<ChatRecord> {
    Ok(ChatRecord {
        id: row.try_get("id")?,
        instance_id: row.try_get("instance_id")?,
        contact_id: row.try_get("contact_id")?,
        unread_count: row.try_get("unread_count")?,
        last_message_at: row.try_get("last_message_at")?,
    })
}

pub async fn get_chat(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<ChatRecord>> {
    let sql = rewrite_sql(
        "SELECT id, instance_id, contact_id, unread_count, last_message_at FROM chats WHERE id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    match row {
        Some(row) => Ok(Some(chat_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn get_or_create_chat(
    pool: &AnyPool,
    kind: DbKind,
    instance_id: &str,
    contact_id: &str,
) -> Result<ChatRecord> {
    let sql = rewrite_sql(
        "SELECT id, instance_id, contact_id, unread_count, last_message_at FROM chats WHERE instance_id = ? AND contact_id = ?",
        kind,
    );
    if let Some(row) = sqlx::query(sql.as_ref())
        .bind(instance_id)
        .bind(contact_id)
        .fetch_optional(pool)
        .await?
    {
        return chat_from_row(&row);
    }

    let record = ChatRecord {
        id: Uuid::new_v4().to_string(),
        instance_id: instance_id.to_string(),
        contact_id: contact_id.to_string(),
        unread_count: 0,
        last_message_at: None,
    };
    let sql = rewrite_sql(
        "INSERT INTO chats (id, instance_id, contact_id, unread_count, last_message_at) VALUES (?, ?, ?, 0, NULL)",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.instance_id)
        .bind(&record.contact_id)
        .execute(pool)
        .await?;
    Ok(record)
}

/// Chat list ordered by latest message timestamp descending, as the UI
/// renders it.
pub async fn list_chats(pool: &AnyPool, kind: DbKind, instance_id: &str) -> Result<Vec<ChatRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, instance_id, contact_id, unread_count, last_message_at
           FROM chats WHERE instance_id = ?
           ORDER BY last_message_at DESC"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).bind(instance_id).fetch_all(pool).await?;
    let mut result = Vec::new();
    for row in rows {
        result.push(chat_from_row(&row)?);
    }
    Ok(result)
}

pub async fn touch_chat(pool: &AnyPool, kind: DbKind, chat_id: &str, at: DateTime<Utc>) -> Result<()> {
    let sql = rewrite_sql("UPDATE chats SET last_message_at = ? WHERE id = ?", kind);
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(at))
        .bind(chat_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Re-derive the unread counter from the message table, keeping the
/// counter equal to the count of inbound messages not yet read.
pub async fn recompute_unread(pool: &AnyPool, kind: DbKind, chat_id: &str) -> Result<()> {
    let sql = rewrite_sql(
        r#"UPDATE chats SET unread_count = (
               SELECT COUNT(1) FROM messages
               WHERE chat_id = ? AND direction = 'inbound' AND status != 'read'
           ) WHERE id = ?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(chat_id)
        .bind(chat_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark every inbound message in the chat read and zero the counter in one
/// transaction. Idempotent.
pub async fn mark_chat_read(pool: &AnyPool, kind: DbKind, chat_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;

    let sql = rewrite_sql(
        "UPDATE messages SET status = 'read' WHERE chat_id = ? AND direction = 'inbound' AND status != 'read'",
        kind,
    );
    sqlx::query(sql.as_ref()).bind(chat_id).execute(&mut *tx).await?;

    let sql = rewrite_sql("UPDATE chats SET unread_count = 0 WHERE id = ?", kind);
    sqlx::query(sql.as_ref()).bind(chat_id).execute(&mut *tx).await?;

    tx.commit().await?;
    Ok(())
}

// --- messages ---

pub async fn insert_message(pool: &AnyPool, kind: DbKind, record: &MessageRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO messages (
            id, chat_id, broadcast_job_id, direction, body, media_url, media_mime,
            status, provider_message_id, retry_count, last_error, next_attempt_at, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.chat_id)
        .bind(record.broadcast_job_id.as_deref())
        .bind(record.direction.as_str())
        .bind(record.body.as_deref())
        .bind(record.media_url.as_deref())
        .bind(record.media_mime.as_deref())
        .bind(record.status.as_str())
        .bind(record.provider_message_id.as_deref())
        .bind(record.retry_count as i64)
        .bind(record.last_error.as_deref())
        .bind(datetime_to_i64(record.next_attempt_at))
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

fn message_from_row(row: &sqlx::any::AnyRow) -> Result<MessageRecord> {
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;
    let next_attempt_at: i64 = row.try_get("next_attempt_at")?;
    let created_at: i64 = row.try_get("created_at")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        broadcast_job_id: row.try_get("broadcast_job_id")?,
        direction: Direction::parse(&direction).unwrap_or(Direction::Outbound),
        body: row.try_get("body")?,
        media_url: row.try_get("media_url")?,
        media_mime: row.try_get("media_mime")?,
        status: MessageStatus::parse(&status).unwrap_or(MessageStatus::Failed),
        provider_message_id: row.try_get("provider_message_id")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as i32,
        last_error: row.try_get("last_error")?,
        next_attempt_at: i64_to_datetime(next_attempt_at),
        created_at: i64_to_datetime(created_at),
    })
}

const MESSAGE_COLUMNS: &str = "id, chat_id, broadcast_job_id, direction, body, media_url, media_mime, status, provider_message_id, retry_count, last_error, next_attempt_at, created_at";

pub async fn get_message(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<MessageRecord>> {
    let sql = format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS);
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    match row {
        Some(row) => Ok(Some(message_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn find_message_by_provider_id(
    pool: &AnyPool,
    kind: DbKind,
    provider_message_id: &str,
) -> Result<Option<MessageRecord>> {
    let sql = format!(
        "SELECT {} FROM messages WHERE provider_message_id = ? LIMIT 1",
        MESSAGE_COLUMNS
    );
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(provider_message_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(Some(message_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn list_messages(
    pool: &AnyPool,
    kind: DbKind,
    chat_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<MessageRecord>> {
    let sql = format!(
        "SELECT {} FROM messages WHERE chat_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
        MESSAGE_COLUMNS
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(chat_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    let mut result = Vec::new();
    for row in rows {
        result.push(message_from_row(&row)?);
    }
    Ok(result)
}

pub async fn count_messages(pool: &AnyPool, kind: DbKind, chat_id: &str) -> Result<i64> {
    let sql = rewrite_sql("SELECT COUNT(1) FROM messages WHERE chat_id = ?", kind);
    let count = sqlx::query_scalar::<_, i64>(sql.as_ref())
        .bind(chat_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn update_message_status(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    status: MessageStatus,
) -> Result<()> {
    let sql = rewrite_sql("UPDATE messages SET status = ? WHERE id = ?", kind);
    sqlx::query(sql.as_ref())
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_message_sent(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    provider_message_id: &str,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE messages SET status = 'sent', provider_message_id = ?, last_error = NULL WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(provider_message_id)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn schedule_message_retry(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    retry_count: i32,
    next_attempt_at: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE messages SET retry_count = ?, next_attempt_at = ?, last_error = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(retry_count as i64)
        .bind(datetime_to_i64(next_attempt_at))
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_message_failed(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    retry_count: i32,
    error: &str,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE messages SET status = 'failed', retry_count = ?, last_error = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(retry_count as i64)
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Due outbound messages joined with their routing data, oldest first.
/// The dispatcher is the single claimer.
pub async fn claim_due_outbound(
    pool: &AnyPool,
    kind: DbKind,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<DispatchItem>> {
    let sql = rewrite_sql(
        r#"SELECT m.id AS message_id, c.instance_id AS instance_id, ct.phone AS phone,
                  m.body AS body, m.media_url AS media_url, m.media_mime AS media_mime,
                  m.retry_count AS retry_count
           FROM messages m
           JOIN chats c ON m.chat_id = c.id
           JOIN contacts ct ON c.contact_id = ct.id
           WHERE m.direction = 'outbound' AND m.status = 'queued' AND m.next_attempt_at <= ?
           ORDER BY m.next_attempt_at ASC, m.created_at ASC
           LIMIT ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(limit)
        .fetch_all(pool)
        .await?;

    let mut result = Vec::new();
    for row in rows {
        result.push(DispatchItem {
            message_id: row.try_get("message_id")?,
            instance_id: row.try_get("instance_id")?,
            phone: row.try_get("phone")?,
            body: row.try_get("body")?,
            media_url: row.try_get("media_url")?,
            media_mime: row.try_get("media_mime")?,
            retry_count: row.try_get::<i64, _>("retry_count")? as i32,
        });
    }
    Ok(result)
}

// --- templates ---

pub async fn insert_template(pool: &AnyPool, kind: DbKind, record: &TemplateRecord) -> Result<()> {
    let sql = rewrite_sql(
        "INSERT INTO templates (id, name, body, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.body)
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

fn template_from_row(row: &sqlx::any::AnyRow) -> Result<TemplateRecord> {
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(TemplateRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        body: row.try_get("body")?,
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
    })
}

pub async fn get_template(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<TemplateRecord>> {
    let sql = rewrite_sql(
        "SELECT id, name, body, created_at, updated_at FROM templates WHERE id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    match row {
        Some(row) => Ok(Some(template_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn list_templates(pool: &AnyPool, kind: DbKind) -> Result<Vec<TemplateRecord>> {
    let sql = rewrite_sql(
        "SELECT id, name, body, created_at, updated_at FROM templates ORDER BY name ASC",
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).fetch_all(pool).await?;
    let mut result = Vec::new();
    for row in rows {
        result.push(template_from_row(&row)?);
    }
    Ok(result)
}

pub async fn update_template(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    name: &str,
    body: &str,
) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE templates SET name = ?, body = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(name)
        .bind(body)
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_template(pool: &AnyPool, kind: DbKind, id: &str) -> Result<bool> {
    let sql = rewrite_sql("DELETE FROM templates WHERE id = ?", kind);
    let result = sqlx::query(sql.as_ref()).bind(id).execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

// --- broadcast lists ---

pub async fn insert_broadcast_list(pool: &AnyPool, kind: DbKind, id: &str, name: &str) -> Result<()> {
    let sql = rewrite_sql(
        "INSERT INTO broadcast_lists (id, name, created_at) VALUES (?, ?, ?)",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(id)
        .bind(name)
        .bind(datetime_to_i64(Utc::now()))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_broadcast_list(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
) -> Result<Option<BroadcastListRecord>> {
    let sql = rewrite_sql(
        r#"SELECT l.id AS id, l.name AS name,
                  (SELECT COUNT(1) FROM broadcast_members m WHERE m.list_id = l.id) AS member_count
           FROM broadcast_lists l WHERE l.id = ?"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    match row {
        Some(row) => Ok(Some(BroadcastListRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            member_count: row.try_get("member_count")?,
        })),
        None => Ok(None),
    }
}

pub async fn list_broadcast_lists(pool: &AnyPool, kind: DbKind) -> Result<Vec<BroadcastListRecord>> {
    let sql = rewrite_sql(
        r#"SELECT l.id AS id, l.name AS name,
                  (SELECT COUNT(1) FROM broadcast_members m WHERE m.list_id = l.id) AS member_count
           FROM broadcast_lists l ORDER BY l.name ASC"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).fetch_all(pool).await?;
    let mut result = Vec::new();
    for row in rows {
        result.push(BroadcastListRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            member_count: row.try_get("member_count")?,
        });
    }
    Ok(result)
}

pub async fn replace_broadcast_members(
    pool: &AnyPool,
    kind: DbKind,
    list_id: &str,
    contact_ids: &[String],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    let sql = rewrite_sql("DELETE FROM broadcast_members WHERE list_id = ?", kind);
    sqlx::query(sql.as_ref()).bind(list_id).execute(&mut *tx).await?;

    let sql = rewrite_sql(
        "INSERT INTO broadcast_members (list_id, contact_id) VALUES (?, ?)",
        kind,
    );
    for contact_id in contact_ids {
        sqlx::query(sql.as_ref())
            .bind(list_id)
            .bind(contact_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn list_broadcast_members(
    pool: &AnyPool,
    kind: DbKind,
    list_id: &str,
) -> Result<Vec<String>> {
    let sql = rewrite_sql(
        "SELECT contact_id FROM broadcast_members WHERE list_id = ? ORDER BY contact_id ASC",
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).bind(list_id).fetch_all(pool).await?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row.try_get("contact_id")?);
    }
    Ok(result)
}

// --- broadcast jobs ---

pub async fn insert_broadcast_job(pool: &AnyPool, kind: DbKind, record: &BroadcastJobRecord) -> Result<()> {
    let sql = rewrite_sql(
        "INSERT INTO broadcast_jobs (id, list_id, template_id, status, recipient_count, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.list_id)
        .bind(&record.template_id)
        .bind(&record.status)
        .bind(record.recipient_count)
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_broadcast_job(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
) -> Result<Option<BroadcastJobRecord>> {
    let sql = rewrite_sql(
        "SELECT id, list_id, template_id, status, recipient_count, created_at FROM broadcast_jobs WHERE id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    match row {
        Some(row) => {
            let created_at: i64 = row.try_get("created_at")?;
            Ok(Some(BroadcastJobRecord {
                id: row.try_get("id")?,
                list_id: row.try_get("list_id")?,
                template_id: row.try_get("template_id")?,
                status: row.try_get("status")?,
                recipient_count: row.try_get("recipient_count")?,
                created_at: i64_to_datetime(created_at),
            }))
        }
        None => Ok(None),
    }
}

/// Per-status message counts for one broadcast job.
pub async fn broadcast_status_counts(
    pool: &AnyPool,
    kind: DbKind,
    job_id: &str,
) -> Result<Vec<(String, i64)>> {
    let sql = rewrite_sql(
        "SELECT status, COUNT(1) AS n FROM messages WHERE broadcast_job_id = ? GROUP BY status",
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).bind(job_id).fetch_all(pool).await?;
    let mut result = Vec::new();
    for row in rows {
        let status: String = row.try_get("status")?;
        let n: i64 = row.try_get("n")?;
        result.push((status, n));
    }
    Ok(result)
}

/// Flip running jobs to completed once none of their messages is still
/// queued. Called from the dispatch loop after each batch.
pub async fn sweep_completed_broadcasts(pool: &AnyPool, kind: DbKind) -> Result<u64> {
    let sql = rewrite_sql(
        r#"UPDATE broadcast_jobs SET status = 'completed'
           WHERE status = 'running'
             AND NOT EXISTS (
                 SELECT 1 FROM messages
                 WHERE messages.broadcast_job_id = broadcast_jobs.id
                   AND messages.status = 'queued'
             )"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref()).execute(pool).await?;
    Ok(result.rows_affected())
}
