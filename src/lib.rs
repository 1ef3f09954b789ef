pub mod broadcast;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod instance;
pub mod provider;
pub mod store;
pub mod types;
pub mod ws;

pub use config::Config;
pub use error::Error;

use crate::config::{load_config, resolve_database_url};
use crate::db::DbKind;
use crate::provider::{ProviderClient, ProviderEvent, WebhookPayload};
use crate::store::{StoreHandle, SyncGenerations};
use crate::types::MediaRef;
use crate::ws::WsEvent;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use std::collections::HashMap;
use tokio::sync::broadcast as tokio_broadcast;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub db_kind: DbKind,
    pub provider: ProviderClient,
    pub store: StoreHandle,
    pub sync: SyncGenerations,
    pub ws_tx: tokio_broadcast::Sender<WsEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendTextRequest {
    pub chat_id: String,
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMediaRequest {
    pub chat_id: String,
    pub url: String,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateRequest {
    pub name: String,
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateListRequest {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembersRequest {
    pub contact_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendBroadcastRequest {
    pub list_id: String,
    pub template_id: String,
    pub params: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ContactQuery {
    pub q: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub instances: i64,
    pub chats: i64,
    pub messages: i64,
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    sqlx::any::install_default_drivers();

    let config = load_config();
    let db_url = resolve_database_url(&config);
    let pool = AnyPool::connect(&db_url).await?;
    let (state, app) = create_app_with(config, pool).await?;
    Ok((state, app))
}

/// Build the application over an existing pool. Split out so tests can run
/// the full router against an in-memory database.
pub async fn create_app_with(config: Config, pool: AnyPool) -> anyhow::Result<(AppState, Router)> {
    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    db::init_db(&pool, db_kind).await?;

    let (ws_tx, _) = tokio_broadcast::channel(256);
    let provider = ProviderClient::new(&config.provider);
    let store = store::spawn_store_writer(pool.clone(), db_kind, ws_tx.clone());
    let sync = SyncGenerations::new();

    let state = AppState {
        config: config.clone(),
        pool: pool.clone(),
        db_kind,
        provider: provider.clone(),
        store,
        sync,
        ws_tx: ws_tx.clone(),
    };

    tokio::spawn(dispatcher::start_dispatch_worker(
        pool,
        db_kind,
        provider,
        ws_tx,
        config.dispatch.clone(),
    ));

    let authed_routes = Router::new()
        .route("/v1/instances", post(create_instance).get(list_instances))
        .route("/v1/instances/:id/qr", get(instance_qr))
        .route("/v1/instances/:id/state", get(instance_state))
        .route("/v1/instances/:id/disconnect", post(instance_disconnect))
        .route("/v1/instances/:id/contacts", get(list_contacts))
        .route("/v1/instances/:id/chats", get(list_chats))
        .route("/v1/chats/:id/messages", get(list_chat_messages))
        .route("/v1/chats/:id/read", post(mark_chat_read))
        .route("/v1/messages/text", post(send_text_message))
        .route("/v1/messages/media", post(send_media_message))
        .route("/v1/templates", post(create_template).get(list_templates))
        .route(
            "/v1/templates/:id",
            get(get_template).put(update_template).delete(delete_template),
        )
        .route(
            "/v1/broadcast-lists",
            post(create_broadcast_list).get(list_broadcast_lists),
        )
        .route("/v1/broadcast-lists/:id/members", put(set_broadcast_members))
        .route("/v1/broadcasts", post(send_broadcast))
        .route("/v1/broadcasts/:id", get(get_broadcast))
        .route("/v1/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/provider/events", post(provider_events));

    let app = Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state.clone());

    Ok((state, app))
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = state.config.auth.token.as_ref() {
        let header = headers.get("X-Wagate-Token").and_then(|v| v.to_str().ok());
        if header != Some(token.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let instances = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM instances")
        .fetch_one(&state.pool)
        .await
        .unwrap_or(0);
    let chats = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM chats")
        .fetch_one(&state.pool)
        .await
        .unwrap_or(0);
    let messages = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM messages")
        .fetch_one(&state.pool)
        .await
        .unwrap_or(0);
    Json(StatusResponse {
        instances,
        chats,
        messages,
    })
}

async fn ws_handler(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    let rx = state.ws_tx.subscribe();
    let token = state.config.auth.token.clone();
    upgrade.on_upgrade(move |socket| ws::handle_ws(socket, rx, token))
}

// --- instances ---

async fn create_instance(
    State(state): State<AppState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<impl IntoResponse, Error> {
    let record = instance::create_instance(
        &state.pool,
        state.db_kind,
        &state.provider,
        &req.name,
        req.webhook_url,
    )
    .await?;
    let _ = state.ws_tx.send(WsEvent {
        event: "instance".to_string(),
        payload: json!({"instance_id": record.id, "state": record.state}),
    });
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_instances(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    let instances = db::list_instances(&state.pool, state.db_kind).await?;
    Ok(Json(instances))
}

async fn instance_qr(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let qr = instance::get_qr_code(&state.pool, state.db_kind, &state.provider, &id).await?;
    Ok(Json(json!({"instance_id": id, "qr": qr})))
}

async fn instance_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let conn = instance::get_connection_state(&state.pool, state.db_kind, &id).await?;
    Ok(Json(json!({"instance_id": id, "state": conn})))
}

async fn instance_disconnect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let conn = instance::disconnect_instance(
        &state.pool,
        state.db_kind,
        &state.provider,
        &state.sync,
        &id,
    )
    .await?;
    let _ = state.ws_tx.send(WsEvent {
        event: "instance".to_string(),
        payload: json!({"instance_id": id, "state": conn}),
    });
    Ok(Json(json!({"instance_id": id, "state": conn})))
}

// --- conversation store reads ---

async fn list_contacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ContactQuery>,
) -> Result<impl IntoResponse, Error> {
    let contacts = match query.q.as_deref() {
        Some(q) if !q.trim().is_empty() => {
            store::search_contacts(
                &state.pool,
                state.db_kind,
                &state.provider,
                &state.sync,
                &id,
                q,
            )
            .await?
        }
        _ => {
            store::fetch_contacts(&state.pool, state.db_kind, &state.provider, &state.sync, &id)
                .await?
        }
    };
    Ok(Json(contacts))
}

async fn list_chats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let chats = store::fetch_chats(&state.pool, state.db_kind, &id).await?;
    Ok(Json(chats))
}

async fn list_chat_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(page): Query<Pagination>,
) -> Result<impl IntoResponse, Error> {
    let limit = page.limit.unwrap_or(200).min(500);
    let offset = page.offset.unwrap_or(0);
    let messages = store::fetch_messages(&state.pool, state.db_kind, &id, limit, offset).await?;
    Ok(Json(messages))
}

async fn mark_chat_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.store.mark_as_read(&id).await?;
    Ok(Json(json!({"chat_id": id, "unread_count": 0})))
}

// --- outbound ---

async fn send_text_message(
    State(state): State<AppState>,
    Json(req): Json<SendTextRequest>,
) -> Result<impl IntoResponse, Error> {
    let record = dispatcher::send_text(
        &state.pool,
        state.db_kind,
        &state.ws_tx,
        &req.chat_id,
        &req.body,
    )
    .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"message_id": record.id, "status": record.status})),
    ))
}

async fn send_media_message(
    State(state): State<AppState>,
    Json(req): Json<SendMediaRequest>,
) -> Result<impl IntoResponse, Error> {
    let media = MediaRef {
        url: req.url,
        mime_type: req.mime_type,
        filename: None,
    };
    let record = dispatcher::send_media(
        &state.pool,
        state.db_kind,
        &state.ws_tx,
        &req.chat_id,
        media,
        req.caption,
    )
    .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"message_id": record.id, "status": record.status})),
    ))
}

// --- templates ---

async fn create_template(
    State(state): State<AppState>,
    Json(req): Json<TemplateRequest>,
) -> Result<impl IntoResponse, Error> {
    if req.name.trim().is_empty() {
        return Err(Error::Invalid("template name is empty".to_string()));
    }
    let now = chrono::Utc::now();
    let record = db::TemplateRecord {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name.trim().to_string(),
        body: req.body,
        created_at: now,
        updated_at: now,
    };
    db::insert_template(&state.pool, state.db_kind, &record).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_templates(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    let templates = db::list_templates(&state.pool, state.db_kind).await?;
    Ok(Json(templates))
}

async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let template = db::get_template(&state.pool, state.db_kind, &id)
        .await?
        .ok_or(Error::NotFound("template"))?;
    Ok(Json(template))
}

async fn update_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TemplateRequest>,
) -> Result<impl IntoResponse, Error> {
    if req.name.trim().is_empty() {
        return Err(Error::Invalid("template name is empty".to_string()));
    }
    let updated =
        db::update_template(&state.pool, state.db_kind, &id, req.name.trim(), &req.body).await?;
    if !updated {
        return Err(Error::NotFound("template"));
    }
    let template = db::get_template(&state.pool, state.db_kind, &id)
        .await?
        .ok_or(Error::NotFound("template"))?;
    Ok(Json(template))
}

async fn delete_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let deleted = db::delete_template(&state.pool, state.db_kind, &id).await?;
    if !deleted {
        return Err(Error::NotFound("template"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// --- broadcasts ---

async fn create_broadcast_list(
    State(state): State<AppState>,
    Json(req): Json<CreateListRequest>,
) -> Result<impl IntoResponse, Error> {
    if req.name.trim().is_empty() {
        return Err(Error::Invalid("list name is empty".to_string()));
    }
    let id = uuid::Uuid::new_v4().to_string();
    db::insert_broadcast_list(&state.pool, state.db_kind, &id, req.name.trim()).await?;
    let list = db::get_broadcast_list(&state.pool, state.db_kind, &id)
        .await?
        .ok_or(Error::NotFound("broadcast list"))?;
    Ok((StatusCode::CREATED, Json(list)))
}

async fn list_broadcast_lists(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    let lists = db::list_broadcast_lists(&state.pool, state.db_kind).await?;
    Ok(Json(lists))
}

async fn set_broadcast_members(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MembersRequest>,
) -> Result<impl IntoResponse, Error> {
    if db::get_broadcast_list(&state.pool, state.db_kind, &id)
        .await?
        .is_none()
    {
        return Err(Error::NotFound("broadcast list"));
    }
    for contact_id in &req.contact_ids {
        if db::get_contact(&state.pool, state.db_kind, contact_id)
            .await?
            .is_none()
        {
            return Err(Error::NotFound("contact"));
        }
    }
    db::replace_broadcast_members(&state.pool, state.db_kind, &id, &req.contact_ids).await?;
    let list = db::get_broadcast_list(&state.pool, state.db_kind, &id)
        .await?
        .ok_or(Error::NotFound("broadcast list"))?;
    Ok(Json(list))
}

async fn send_broadcast(
    State(state): State<AppState>,
    Json(req): Json<SendBroadcastRequest>,
) -> Result<impl IntoResponse, Error> {
    let params = req.params.unwrap_or_default();
    let job = broadcast::send_broadcast(
        &state.pool,
        state.db_kind,
        &state.ws_tx,
        &req.list_id,
        &req.template_id,
        &params,
        state.config.broadcast.rate_per_second,
    )
    .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn get_broadcast(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let (job, counts) = broadcast::broadcast_status(&state.pool, state.db_kind, &id).await?;
    let counts: HashMap<String, i64> = counts.into_iter().collect();
    Ok(Json(json!({
        "id": job.id,
        "list_id": job.list_id,
        "template_id": job.template_id,
        "status": job.status,
        "recipient_count": job.recipient_count,
        "counts": counts,
    })))
}

// --- provider webhook ---

async fn provider_events(
    State(state): State<AppState>,
    Json(payload): Json<WebhookPayload>,
) -> Result<impl IntoResponse, Error> {
    let event = provider::normalize_webhook(payload)?;
    match event {
        ProviderEvent::Inbound(msg) => {
            state.store.apply_inbound(msg).await?;
        }
        ProviderEvent::Receipt {
            provider_message_id,
            status,
        } => {
            state
                .store
                .apply_receipt(types::DeliveryReceipt {
                    provider_message_id,
                    status,
                })
                .await?;
        }
        ProviderEvent::Connection { instance_id, state: next } => {
            let applied = instance::apply_connection_event(
                &state.pool,
                state.db_kind,
                &state.sync,
                &instance_id,
                next,
            )
            .await;
            match applied {
                Ok(true) => {
                    let _ = state.ws_tx.send(WsEvent {
                        event: "instance".to_string(),
                        payload: json!({"instance_id": instance_id, "state": next}),
                    });
                }
                Ok(false) => {}
                Err(err) => error!("connection event error: {err}"),
            }
        }
    }
    Ok(Json(json!({"status": "accepted"})))
}
