//! Telegram Bot API relay.
//!
//! Every room shares one configured chat. A relayed message is a text
//! message whose body is `{"r": room, "p": payload}`; it is sent silently
//! and deleted once every participant has acknowledged it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use veil_core::{InboundRelayed, Relay, RelayError, Relayed};

use crate::config::RelayConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay adapter for the Telegram Bot API.
#[derive(Debug, Clone)]
pub struct TelegramRelay {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
    webhook_url: String,
    webhook_secret: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Value,
    description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RelayText {
    r: String,
    p: String,
}

#[derive(Debug, Deserialize)]
struct Update {
    message: Option<UpdateMessage>,
}

#[derive(Debug, Deserialize)]
struct UpdateMessage {
    message_id: i64,
    date: u64,
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

impl TelegramRelay {
    /// Create an adapter from configuration.
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
            webhook_url: config.webhook_url.clone(),
            webhook_secret: config.webhook_secret.clone(),
        }
    }

    /// Whether a bot token is configured.
    #[must_use]
    pub fn has_token(&self) -> bool {
        !self.bot_token.is_empty()
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RelayError> {
        if !self.has_token() {
            return Err(RelayError::NotConfigured);
        }

        let url = format!("{}/bot{}/{}", self.api_base, self.bot_token, method);
        let response: ApiResponse = self
            .http
            .post(url)
            .json(&params)
            .send()
            .await
            .map_err(|e| RelayError::Request(format!("{method}: {}", e.without_url())))?
            .json()
            .await
            .map_err(|e| RelayError::Request(format!("{method}: {}", e.without_url())))?;

        if response.ok {
            Ok(response.result)
        } else {
            let description = response
                .description
                .unwrap_or_else(|| "no description".to_string());
            error!(method, description = %description, "Telegram API error");
            Err(RelayError::Rejected(description))
        }
    }

    /// Fetch the bot's username.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or is rejected.
    pub async fn get_me(&self) -> Result<Option<String>, RelayError> {
        let me = self.call("getMe", json!({})).await?;
        Ok(me
            .get("username")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Register the configured webhook URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or is rejected.
    pub async fn set_webhook(&self) -> Result<(), RelayError> {
        self.call(
            "setWebhook",
            json!({
                "url": self.webhook_url,
                "secret_token": self.webhook_secret,
                "allowed_updates": ["message"],
            }),
        )
        .await?;
        info!(url = %self.webhook_url, "Telegram webhook set");
        Ok(())
    }

    /// Startup handshake: identify the bot and register the webhook.
    ///
    /// Failures are logged; the server runs without the relay if needed.
    pub async fn init(&self) {
        if self.webhook_secret.is_empty() {
            warn!("No webhook secret configured, accepting unauthenticated webhook calls");
        }
        if !self.has_token() {
            warn!("Telegram bot token not configured, messages are delivered live only");
            return;
        }
        if self.chat_id.is_empty() {
            warn!("Telegram chat ID not configured, messages are delivered live only");
        }

        match self.get_me().await {
            Ok(Some(username)) => info!("Telegram bot initialized: @{}", username),
            Ok(None) => info!("Telegram bot initialized"),
            Err(e) => warn!(error = %e, "Telegram getMe failed"),
        }

        if !self.webhook_url.is_empty() {
            if let Err(e) = self.set_webhook().await {
                warn!(error = %e, "Telegram setWebhook failed");
            }
        }
    }

    /// Check the secret header of a webhook call.
    ///
    /// With no secret configured every call is accepted.
    #[must_use]
    pub fn verify_secret(&self, header: Option<&str>) -> bool {
        if self.webhook_secret.is_empty() {
            return true;
        }
        header.is_some_and(|h| constant_time_eq(h.as_bytes(), self.webhook_secret.as_bytes()))
    }

    /// Extract a relayed message from a webhook update.
    ///
    /// Returns `None` for updates that are not relayed room messages.
    #[must_use]
    pub fn parse_update(update: Value) -> Option<InboundRelayed> {
        let message = serde_json::from_value::<Update>(update).ok()?.message?;
        let body: RelayText = serde_json::from_str(message.text.as_deref()?).ok()?;
        if body.r.is_empty() || body.p.is_empty() {
            return None;
        }

        Some(InboundRelayed {
            room_id: body.r,
            payload: body.p,
            relay_msg_id: message.message_id.to_string(),
            location: message.chat.id.to_string(),
            timestamp: message.date.saturating_mul(1000),
        })
    }
}

/// Compare two byte strings in time independent of where they differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[async_trait]
impl Relay for TelegramRelay {
    async fn relay(&self, room_id: &str, payload: &str) -> Result<Relayed, RelayError> {
        if !self.has_token() || self.chat_id.is_empty() {
            return Err(RelayError::NotConfigured);
        }

        let text = serde_json::to_string(&RelayText {
            r: room_id.to_string(),
            p: payload.to_string(),
        })
        .map_err(|e| RelayError::Request(e.to_string()))?;

        let result = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": self.chat_id,
                    "text": text,
                    "disable_notification": true,
                }),
            )
            .await?;

        let relay_msg_id = result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| RelayError::Rejected("sendMessage returned no message_id".to_string()))?;

        debug!(room = %room_id, relay_msg = relay_msg_id, "Relayed message");
        Ok(Relayed {
            relay_msg_id: relay_msg_id.to_string(),
            location: self.chat_id.clone(),
        })
    }

    async fn delete_relayed(&self, location: &str, relay_msg_id: &str) -> bool {
        if location.is_empty() || relay_msg_id.is_empty() {
            return false;
        }
        let Ok(message_id) = relay_msg_id.parse::<i64>() else {
            warn!(relay_msg = %relay_msg_id, "Relay message ID is not numeric");
            return false;
        };

        match self
            .call(
                "deleteMessage",
                json!({ "chat_id": location, "message_id": message_id }),
            )
            .await
        {
            Ok(_) => {
                debug!(location = %location, relay_msg = message_id, "Deleted relayed message");
                true
            }
            Err(e) => {
                warn!(location = %location, relay_msg = message_id, error = %e, "Relay deletion failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(api_base: &str) -> RelayConfig {
        RelayConfig {
            api_base: api_base.to_string(),
            bot_token: "123:abc".to_string(),
            chat_id: "-100".to_string(),
            webhook_url: "https://veil.example/webhook/telegram".to_string(),
            webhook_secret: "s3cret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_relay_sends_silent_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_partial_json(json!({
                "chat_id": "-100",
                "disable_notification": true,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": { "message_id": 42, "chat": { "id": -100 } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let relay = TelegramRelay::new(&config(&server.uri()));
        let relayed = relay.relay("METEOR-7291", "cipher").await.unwrap();
        assert_eq!(relayed.relay_msg_id, "42");
        assert_eq!(relayed.location, "-100");

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        let text: RelayText = serde_json::from_str(body["text"].as_str().unwrap()).unwrap();
        assert_eq!(text.r, "METEOR-7291");
        assert_eq!(text.p, "cipher");
    }

    #[tokio::test]
    async fn test_relay_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "description": "Bad Request: chat not found"
            })))
            .mount(&server)
            .await;

        let relay = TelegramRelay::new(&config(&server.uri()));
        let err = relay.relay("R-1", "x").await.unwrap_err();
        assert!(matches!(err, RelayError::Rejected(d) if d.contains("chat not found")));
    }

    #[tokio::test]
    async fn test_relay_not_configured() {
        let mut cfg = config("http://127.0.0.1:9");
        cfg.chat_id.clear();
        let relay = TelegramRelay::new(&cfg);
        assert!(matches!(
            relay.relay("R-1", "x").await,
            Err(RelayError::NotConfigured)
        ));

        let mut cfg = config("http://127.0.0.1:9");
        cfg.bot_token.clear();
        let relay = TelegramRelay::new(&cfg);
        assert!(!relay.has_token());
        assert!(!relay.delete_relayed("-100", "42").await);
    }

    #[tokio::test]
    async fn test_delete_relayed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/deleteMessage"))
            .and(body_partial_json(json!({ "chat_id": "-100", "message_id": 42 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": true })))
            .expect(1)
            .mount(&server)
            .await;

        let relay = TelegramRelay::new(&config(&server.uri()));
        assert!(relay.delete_relayed("-100", "42").await);
        assert!(!relay.delete_relayed("-100", "").await);
        assert!(!relay.delete_relayed("-100", "not-a-number").await);
    }

    #[tokio::test]
    async fn test_delete_relayed_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/deleteMessage"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "description": "Bad Request: message to delete not found"
            })))
            .mount(&server)
            .await;

        let relay = TelegramRelay::new(&config(&server.uri()));
        assert!(!relay.delete_relayed("-100", "42").await);
    }

    #[tokio::test]
    async fn test_init_registers_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/getMe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": { "id": 1, "username": "veil_bot" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/setWebhook"))
            .and(body_partial_json(json!({
                "url": "https://veil.example/webhook/telegram",
                "secret_token": "s3cret",
                "allowed_updates": ["message"],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": true })))
            .expect(1)
            .mount(&server)
            .await;

        let relay = TelegramRelay::new(&config(&server.uri()));
        assert_eq!(relay.get_me().await.unwrap().as_deref(), Some("veil_bot"));
        relay.init().await;
    }

    #[test]
    fn test_verify_secret() {
        let relay = TelegramRelay::new(&config("http://127.0.0.1:9"));
        assert!(relay.verify_secret(Some("s3cret")));
        assert!(!relay.verify_secret(Some("wrong")));
        assert!(!relay.verify_secret(None));

        let mut cfg = config("http://127.0.0.1:9");
        cfg.webhook_secret.clear();
        let open = TelegramRelay::new(&cfg);
        assert!(open.verify_secret(None));
        assert!(open.verify_secret(Some("anything")));
    }

    #[test]
    fn test_secret_compare_rejects_near_misses() {
        let relay = TelegramRelay::new(&config("http://127.0.0.1:9"));
        assert!(!relay.verify_secret(Some("s3cre")));
        assert!(!relay.verify_secret(Some("s3cret!")));
        assert!(!relay.verify_secret(Some("S3cret")));
        assert!(!relay.verify_secret(Some("")));

        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_parse_update() {
        let update = json!({
            "update_id": 9,
            "message": {
                "message_id": 77,
                "date": 1_700_000_000u64,
                "chat": { "id": -100 },
                "text": "{\"r\":\"METEOR-7291\",\"p\":\"cipher\"}"
            }
        });
        let inbound = TelegramRelay::parse_update(update).unwrap();
        assert_eq!(inbound.room_id, "METEOR-7291");
        assert_eq!(inbound.payload, "cipher");
        assert_eq!(inbound.relay_msg_id, "77");
        assert_eq!(inbound.location, "-100");
        assert_eq!(inbound.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_parse_update_ignores_foreign_updates() {
        let base = |text: Value| {
            json!({
                "message": {
                    "message_id": 1,
                    "date": 1,
                    "chat": { "id": -100 },
                    "text": text
                }
            })
        };

        assert!(TelegramRelay::parse_update(json!({ "edited_message": {} })).is_none());
        assert!(TelegramRelay::parse_update(json!({
            "message": { "message_id": 1, "date": 1, "chat": { "id": -100 } }
        }))
        .is_none());
        assert!(TelegramRelay::parse_update(base(json!("hello there"))).is_none());
        assert!(TelegramRelay::parse_update(base(json!("{\"r\":\"R-1\"}"))).is_none());
        assert!(TelegramRelay::parse_update(base(json!("{\"r\":\"\",\"p\":\"x\"}"))).is_none());
    }
}
