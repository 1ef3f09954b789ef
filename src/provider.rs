use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::types::{ConnectionState, InboundMessage, MediaRef, MessageStatus};

/// Thin client for the messaging provider's HTTP API. Instance management,
/// sends, and contact sync all go through here; inbound traffic arrives on
/// the webhook receiver instead.
#[derive(Clone)]
pub struct ProviderClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendAck {
    pub message_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QrPayload {
    pub qr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderContact {
    pub phone: String,
    pub display_name: Option<String>,
}

impl ProviderClient {
    pub fn new(cfg: &ProviderConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = self.api_key.as_ref() {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth,
            StatusCode::TOO_MANY_REQUESTS => Error::RateLimited,
            StatusCode::NOT_FOUND => Error::NotFound("provider resource"),
            _ => Error::Provider(format!("{} {}", status, body)),
        })
    }

    pub async fn register_instance(&self, instance_id: &str, name: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, "/instances")
            .json(&json!({"id": instance_id, "name": name}))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn fetch_qr(&self, instance_id: &str) -> Result<String> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/instances/{}/qr", instance_id))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let payload = resp.json::<QrPayload>().await?;
        Ok(payload.qr)
    }

    pub async fn disconnect_instance(&self, instance_id: &str) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/instances/{}/disconnect", instance_id),
            )
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn send_text(&self, instance_id: &str, to: &str, body: &str) -> Result<String> {
        let resp = self
            .request(reqwest::Method::POST, &format!("/instances/{}/send", instance_id))
            .json(&json!({"to": to, "text": body}))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let ack = resp.json::<SendAck>().await?;
        Ok(ack.message_id)
    }

    pub async fn send_media(
        &self,
        instance_id: &str,
        to: &str,
        url: &str,
        mime: Option<&str>,
        caption: Option<&str>,
    ) -> Result<String> {
        let resp = self
            .request(reqwest::Method::POST, &format!("/instances/{}/send", instance_id))
            .json(&json!({"to": to, "media_url": url, "mime_type": mime, "text": caption}))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let ack = resp.json::<SendAck>().await?;
        Ok(ack.message_id)
    }

    pub async fn fetch_contacts(&self, instance_id: &str) -> Result<Vec<ProviderContact>> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/instances/{}/contacts", instance_id),
            )
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let contacts = resp.json::<Vec<ProviderContact>>().await?;
        Ok(contacts)
    }
}

/// Webhook envelope the provider posts to `/v1/provider/events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookPayload {
    Message {
        instance_id: String,
        message_id: String,
        from: String,
        sender_name: Option<String>,
        text: Option<String>,
        media_url: Option<String>,
        mime_type: Option<String>,
        timestamp: Option<i64>,
    },
    Receipt {
        instance_id: String,
        message_id: String,
        status: String,
    },
    Connection {
        instance_id: String,
        state: String,
    },
}

/// Normalized form of a webhook payload, ready for the store writer.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    Inbound(InboundMessage),
    Receipt {
        provider_message_id: String,
        status: MessageStatus,
    },
    Connection {
        instance_id: String,
        state: ConnectionState,
    },
}

pub fn normalize_webhook(payload: WebhookPayload) -> Result<ProviderEvent> {
    match payload {
        WebhookPayload::Message {
            instance_id,
            message_id,
            from,
            sender_name,
            text,
            media_url,
            mime_type,
            timestamp,
        } => {
            let media = media_url.map(|url| MediaRef {
                url,
                mime_type,
                filename: None,
            });
            Ok(ProviderEvent::Inbound(InboundMessage {
                instance_id,
                provider_message_id: message_id,
                phone: from,
                sender_name,
                body: text,
                media,
                timestamp,
            }))
        }
        WebhookPayload::Receipt {
            message_id, status, ..
        } => {
            let status = MessageStatus::parse(&status)
                .ok_or_else(|| Error::Invalid(format!("unknown receipt status: {}", status)))?;
            Ok(ProviderEvent::Receipt {
                provider_message_id: message_id,
                status,
            })
        }
        WebhookPayload::Connection { instance_id, state } => {
            let state = ConnectionState::parse(&state)
                .ok_or_else(|| Error::Invalid(format!("unknown connection state: {}", state)))?;
            Ok(ProviderEvent::Connection { instance_id, state })
        }
    }
}
