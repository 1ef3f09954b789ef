use chrono::Utc;
use sqlx::AnyPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbKind, InstanceRecord};
use crate::error::{Error, Result};
use crate::provider::ProviderClient;
use crate::store::SyncGenerations;
use crate::types::ConnectionState;

/// Register a new instance with the provider and persist it in `pairing`
/// state, ready for a QR scan.
pub async fn create_instance(
    pool: &AnyPool,
    kind: DbKind,
    provider: &ProviderClient,
    name: &str,
    webhook_url: Option<String>,
) -> Result<InstanceRecord> {
    if name.trim().is_empty() {
        return Err(Error::Invalid("instance name is empty".to_string()));
    }

    let id = Uuid::new_v4().to_string();
    provider.register_instance(&id, name).await?;

    let now = Utc::now();
    let record = InstanceRecord {
        id,
        name: name.trim().to_string(),
        state: ConnectionState::Pairing,
        webhook_url,
        created_at: now,
        updated_at: now,
    };
    db::insert_instance(pool, kind, &record).await?;
    info!(instance = %record.id, "instance created, awaiting pairing");
    Ok(record)
}

/// Pairing payload for an instance. A connected instance has nothing to
/// pair; a disconnected one re-enters `pairing` first.
pub async fn get_qr_code(
    pool: &AnyPool,
    kind: DbKind,
    provider: &ProviderClient,
    instance_id: &str,
) -> Result<String> {
    let record = db::get_instance(pool, kind, instance_id)
        .await?
        .ok_or(Error::NotFound("instance"))?;

    match record.state {
        ConnectionState::Connected => return Err(Error::NotPairing),
        ConnectionState::Disconnected => {
            db::set_instance_state(pool, kind, instance_id, ConnectionState::Pairing).await?;
        }
        ConnectionState::Pairing => {}
    }

    provider.fetch_qr(instance_id).await
}

pub async fn get_connection_state(
    pool: &AnyPool,
    kind: DbKind,
    instance_id: &str,
) -> Result<ConnectionState> {
    let record = db::get_instance(pool, kind, instance_id)
        .await?
        .ok_or(Error::NotFound("instance"))?;
    Ok(record.state)
}

/// Tear down the provider session. Idempotent: a second call on an already
/// disconnected instance returns without touching the provider.
pub async fn disconnect_instance(
    pool: &AnyPool,
    kind: DbKind,
    provider: &ProviderClient,
    sync: &SyncGenerations,
    instance_id: &str,
) -> Result<ConnectionState> {
    let record = db::get_instance(pool, kind, instance_id)
        .await?
        .ok_or(Error::NotFound("instance"))?;

    if record.state == ConnectionState::Disconnected {
        return Ok(ConnectionState::Disconnected);
    }

    // Local state goes terminal even when the provider is unreachable;
    // the session is abandoned either way.
    if let Err(err) = provider.disconnect_instance(instance_id).await {
        warn!(instance = %instance_id, error = %err, "provider disconnect failed");
    }

    db::set_instance_state(pool, kind, instance_id, ConnectionState::Disconnected).await?;
    sync.bump(instance_id).await;
    info!(instance = %instance_id, "instance disconnected");
    Ok(ConnectionState::Disconnected)
}

/// Apply a provider-reported connection transition. Illegal transitions
/// (e.g. connected without pairing) are dropped. Any applied change bumps
/// the instance's sync generation, invalidating in-flight fetches.
pub async fn apply_connection_event(
    pool: &AnyPool,
    kind: DbKind,
    sync: &SyncGenerations,
    instance_id: &str,
    next: ConnectionState,
) -> Result<bool> {
    let record = db::get_instance(pool, kind, instance_id)
        .await?
        .ok_or(Error::NotFound("instance"))?;

    if record.state == next {
        return Ok(false);
    }
    if !record.state.can_transition(next) {
        warn!(
            instance = %instance_id,
            from = record.state.as_str(),
            to = next.as_str(),
            "ignoring illegal connection transition"
        );
        return Ok(false);
    }

    db::set_instance_state(pool, kind, instance_id, next).await?;
    sync.bump(instance_id).await;
    info!(instance = %instance_id, state = next.as_str(), "connection state changed");
    Ok(true)
}
