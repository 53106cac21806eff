//! HTTP bridge transport
//!
//! Talks to a protocol bridge service that terminates the actual messaging
//! protocol. Outbound operations are plain REST calls; the per-tenant event
//! stream is consumed with a long-poll loop and forwarded into an mpsc
//! channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{
    ChatAddress, Connection, GroupMetadata, MediaPayload, MediaRef, MenuEntry, MessageKey,
    OutboundMedia, ProtocolClient, RawMessage, SessionEvent, Transport,
};
use crate::{Error, Result};

/// Capacity of the per-session event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Long-poll hold time requested from the bridge, in seconds
const POLL_TIMEOUT_SECS: u64 = 25;

/// Pause between polls after a transport-level poll failure
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Transport that dials sessions through an HTTP protocol bridge
pub struct BridgeTransport {
    base_url: String,
    api_token: Option<String>,
    client: Client,
}

impl BridgeTransport {
    /// Create a transport against the given bridge base URL
    #[must_use]
    pub fn new(base_url: String, api_token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            client: Client::new(),
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[derive(Serialize)]
struct ConnectRequest<'a> {
    credentials: Option<&'a str>,
}

#[derive(Deserialize)]
struct PollResponse {
    #[serde(default)]
    events: Vec<SessionEvent>,
    cursor: u64,
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn connect(&self, tenant_id: i64, credentials: Option<&str>) -> Result<Connection> {
        let url = format!("{}/v1/sessions/{tenant_id}/connect", self.base_url);
        let response = self
            .authorize(self.client.post(&url))
            .json(&ConnectRequest { credentials })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!(
                "bridge connect failed: {status} - {body}"
            )));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        spawn_poll_loop(
            self.client.clone(),
            self.base_url.clone(),
            self.api_token.clone(),
            tenant_id,
            tx,
        );

        let client = Arc::new(BridgeClient {
            base_url: self.base_url.clone(),
            api_token: self.api_token.clone(),
            tenant_id,
            client: self.client.clone(),
        });

        tracing::info!(tenant_id, "bridge session dialed");
        Ok(Connection { client, events: rx })
    }
}

/// Poll the bridge event stream and forward events until the receiver drops
/// or the session ends on the bridge side.
fn spawn_poll_loop(
    client: Client,
    base_url: String,
    api_token: Option<String>,
    tenant_id: i64,
    tx: mpsc::Sender<SessionEvent>,
) {
    tokio::spawn(async move {
        let mut cursor: u64 = 0;

        loop {
            if tx.is_closed() {
                return;
            }

            let url = format!(
                "{base_url}/v1/sessions/{tenant_id}/events?cursor={cursor}&timeout={POLL_TIMEOUT_SECS}"
            );
            let mut req = client.get(&url);
            if let Some(token) = &api_token {
                req = req.bearer_auth(token);
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(tenant_id, error = %e, "bridge poll failed");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                    continue;
                }
            };

            // 410 means the bridge dropped the session; the stream ends and
            // the supervisor decides what to do next.
            if response.status() == reqwest::StatusCode::GONE {
                tracing::info!(tenant_id, "bridge session gone, ending event stream");
                return;
            }
            if !response.status().is_success() {
                tracing::warn!(tenant_id, status = %response.status(), "bridge poll rejected");
                tokio::time::sleep(POLL_RETRY_DELAY).await;
                continue;
            }

            let poll: PollResponse = match response.json().await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(tenant_id, error = %e, "bridge poll body unreadable");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                    continue;
                }
            };

            cursor = poll.cursor;
            for event in poll.events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    });
}

/// Per-tenant capability handle against the bridge REST API
pub struct BridgeClient {
    base_url: String,
    api_token: Option<String>,
    tenant_id: i64,
    client: Client,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SendRequest<'a> {
    Text {
        to: &'a str,
        body: &'a str,
    },
    Buttons {
        to: &'a str,
        body: &'a str,
        buttons: &'a [MenuEntry],
    },
    List {
        to: &'a str,
        body: &'a str,
        button: &'a str,
        entries: &'a [MenuEntry],
    },
    Media {
        to: &'a str,
        filename: &'a str,
        mime_type: &'a str,
        caption: Option<&'a str>,
        /// Base64-encoded payload
        data: String,
    },
}

impl BridgeClient {
    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send_request(&self, request: SendRequest<'_>) -> Result<RawMessage> {
        let url = format!("{}/v1/sessions/{}/messages", self.base_url, self.tenant_id);
        let response = self
            .authorize(self.client.post(&url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!(
                "bridge send failed: {status} - {body}"
            )));
        }

        // The bridge echoes the sent message so it can be recorded exactly
        // like an inbound one.
        let value: serde_json::Value = response.json().await?;
        let mut message: RawMessage = serde_json::from_value(value.clone())?;
        message.payload = value;
        Ok(message)
    }

    async fn post_empty(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .authorize(self.client.post(&url))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!(
                "bridge call {path} failed: {status} - {text}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn send_text(&self, to: &ChatAddress, body: &str) -> Result<RawMessage> {
        self.send_request(SendRequest::Text { to: to.jid(), body }).await
    }

    async fn send_buttons(
        &self,
        to: &ChatAddress,
        body: &str,
        buttons: &[MenuEntry],
    ) -> Result<RawMessage> {
        self.send_request(SendRequest::Buttons {
            to: to.jid(),
            body,
            buttons,
        })
        .await
    }

    async fn send_list(
        &self,
        to: &ChatAddress,
        body: &str,
        button: &str,
        entries: &[MenuEntry],
    ) -> Result<RawMessage> {
        self.send_request(SendRequest::List {
            to: to.jid(),
            body,
            button,
            entries,
        })
        .await
    }

    async fn send_media(&self, to: &ChatAddress, media: &OutboundMedia) -> Result<RawMessage> {
        use base64::Engine as _;

        self.send_request(SendRequest::Media {
            to: to.jid(),
            filename: &media.filename,
            mime_type: &media.mime_type,
            caption: media.caption.as_deref(),
            data: base64::engine::general_purpose::STANDARD.encode(&media.bytes),
        })
        .await
    }

    async fn download_attachment(&self, media: &MediaRef) -> Result<MediaPayload> {
        let url = format!(
            "{}/v1/sessions/{}/media/{}",
            self.base_url,
            self.tenant_id,
            urlencoding::encode(&media.media_id)
        );
        let response = self.authorize(self.client.get(&url)).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Protocol(format!("media download failed: {status}")));
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(media.mime_type.as_str())
            .to_string();
        let filename = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_disposition_filename);

        let bytes = response.bytes().await?.to_vec();
        Ok(MediaPayload {
            bytes,
            mime_type,
            filename,
        })
    }

    async fn read_receipts(&self, keys: &[MessageKey]) -> Result<()> {
        let ids: Vec<&str> = keys.iter().map(|k| k.id.as_str()).collect();
        self.post_empty(
            &format!("/v1/sessions/{}/read", self.tenant_id),
            &serde_json::json!({ "message_ids": ids }),
        )
        .await
    }

    async fn group_metadata(&self, chat: &ChatAddress) -> Result<GroupMetadata> {
        let url = format!(
            "{}/v1/sessions/{}/groups/{}",
            self.base_url,
            self.tenant_id,
            urlencoding::encode(chat.jid())
        );
        let response = self.authorize(self.client.get(&url)).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Protocol(format!(
                "group metadata fetch failed: {status}"
            )));
        }

        Ok(response.json().await?)
    }

    async fn reject_call(&self, call_id: &str) -> Result<()> {
        self.post_empty(
            &format!("/v1/sessions/{}/calls/reject", self.tenant_id),
            &serde_json::json!({ "call_id": call_id }),
        )
        .await
    }

    async fn logout(&self) -> Result<()> {
        self.post_empty(
            &format!("/v1/sessions/{}/logout", self.tenant_id),
            &serde_json::Value::Null,
        )
        .await
    }
}

/// Pull a filename out of a Content-Disposition header value
fn parse_disposition_filename(value: &str) -> Option<String> {
    value.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("filename=")
            .map(|name| name.trim_matches('"').to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_filename_parsed() {
        assert_eq!(
            parse_disposition_filename("attachment; filename=\"report.pdf\""),
            Some("report.pdf".to_string())
        );
        assert_eq!(parse_disposition_filename("inline"), None);
    }

    #[test]
    fn send_request_serializes_tagged() {
        let req = SendRequest::Text {
            to: "5511999@s.whatsapp.net",
            body: "hello",
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["to"], "5511999@s.whatsapp.net");
    }

    #[test]
    fn poll_response_decodes_events() {
        let body = serde_json::json!({
            "cursor": 7,
            "events": [
                { "type": "open" },
                { "type": "pairing_code", "code": "XYZ-123" },
            ],
        });
        let poll: PollResponse = serde_json::from_value(body).unwrap();
        assert_eq!(poll.cursor, 7);
        assert_eq!(poll.events.len(), 2);
        assert!(matches!(poll.events[0], SessionEvent::Open));
    }
}
