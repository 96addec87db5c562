//! Telegram Bot API gateway
//!
//! Sends JSON POST requests to `{api_base}/bot{token}/{method}` and turns the
//! Bot API's error envelopes into [`GatewayError`] classes the retry policy
//! understands.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};

use super::{Gateway, GatewayError, GatewayResult};
use crate::models::{ContentBody, ContentItem, Destination, MediaKind, MessageRef};

/// Descriptions that mean the target is already gone
const NOT_FOUND_MARKERS: &[&str] = &[
    "message to delete not found",
    "message not found",
    "message to unpin not found",
    "chat not found",
];

/// Descriptions that mean the message is still up but the bot may not touch it
const FORBIDDEN_MARKERS: &[&str] = &["message can't be deleted", "not enough rights to delete"];

const TRANSIENT_MARKERS: &[&str] = &["timeout", "timed out", "connection", "network"];

/// Telegram gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Bot token issued by BotFather
    #[serde(default)]
    pub bot_token: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,

    /// Notify members when a message is pinned
    #[serde(default)]
    pub pin_notification: bool,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            api_base: default_api_base(),
            bot_token: bot_token.into(),
            request_timeout_secs: default_timeout(),
            pin_notification: false,
        }
    }

    /// Point the gateway at a different API host
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.request_timeout_secs = timeout_secs;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.bot_token.is_empty() {
            return Err("Bot token cannot be empty".to_string());
        }

        if !self.api_base.starts_with("http://") && !self.api_base.starts_with("https://") {
            return Err("API base must start with http:// or https://".to_string());
        }

        if self.request_timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Bot API response envelope
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// Map a failed Bot API call onto a gateway error class
pub fn classify(status: Option<u16>, description: &str, retry_after: Option<u64>) -> GatewayError {
    if status == Some(429) || retry_after.is_some() {
        return GatewayError::RateLimited {
            retry_after: Duration::from_secs(retry_after.unwrap_or(1)),
        };
    }

    let lower = description.to_lowercase();
    if FORBIDDEN_MARKERS.iter().any(|m| lower.contains(m)) {
        return GatewayError::Forbidden(description.to_string());
    }
    if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
        return GatewayError::NotFound(description.to_string());
    }

    match status {
        Some(403) => GatewayError::Forbidden(description.to_string()),
        Some(code) if code >= 500 => GatewayError::Transient(description.to_string()),
        _ if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) => {
            GatewayError::Transient(description.to_string())
        }
        _ => GatewayError::InvalidContent(description.to_string()),
    }
}

/// Gateway backed by the Telegram Bot HTTP API
pub struct TelegramGateway {
    config: TelegramConfig,
    client: Client,
    closed: AtomicBool,
}

impl TelegramGateway {
    /// Create a new gateway
    pub fn new(config: TelegramConfig) -> GatewayResult<Self> {
        config.validate().map_err(GatewayError::InvalidContent)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Transient(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            closed: AtomicBool::new(false),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    #[instrument(skip(self, payload))]
    async fn call<T>(&self, method: &str, payload: Value) -> GatewayResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Closed);
        }

        let response = self
            .client
            .post(self.method_url(method))
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(method, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(method, e))?;

        let parsed: ApiResponse<T> = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) => return Err(classify_unparsed(status, &body)),
        };

        if parsed.ok {
            if let Some(result) = parsed.result {
                debug!(status = status.as_u16(), "Bot API call succeeded");
                return Ok(result);
            }
        }

        let description = parsed
            .description
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        let code = parsed.error_code.or(Some(status.as_u16()));
        let retry_after = parsed.parameters.and_then(|p| p.retry_after);

        Err(classify(code, &description, retry_after))
    }

    fn publish_request(content: &ContentItem, destination: &Destination) -> (&'static str, Value) {
        let mut payload = Map::new();
        payload.insert("chat_id".into(), json!(destination.address));

        let method = match &content.body {
            ContentBody::Copy {
                source_chat,
                source_message,
            } => {
                payload.insert("from_chat_id".into(), json!(source_chat));
                payload.insert("message_id".into(), json!(source_message));
                "copyMessage"
            }
            ContentBody::Text { text } => {
                payload.insert("text".into(), json!(text));
                "sendMessage"
            }
            ContentBody::Media {
                kind,
                file_id,
                caption,
            } => {
                payload.insert(kind.as_str().into(), json!(file_id));
                if let Some(caption) = caption {
                    payload.insert("caption".into(), json!(caption));
                }
                media_method(*kind)
            }
        };

        if let Some(buttons) = content.buttons.as_ref().filter(|b| !b.is_empty()) {
            payload.insert("reply_markup".into(), json!({ "inline_keyboard": buttons }));
        }

        (method, Value::Object(payload))
    }
}

fn media_method(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "sendPhoto",
        MediaKind::Video => "sendVideo",
        MediaKind::Animation => "sendAnimation",
        MediaKind::Document => "sendDocument",
    }
}

/// Transport failure, with the request URL (which embeds the bot token) stripped
fn transport_error(method: &str, err: reqwest::Error) -> GatewayError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    GatewayError::Transient(format!("{method} {kind}: {}", err.without_url()))
}

fn classify_unparsed(status: StatusCode, body: &str) -> GatewayError {
    let snippet: String = body.chars().take(200).collect();
    if status.is_server_error() {
        GatewayError::Transient(format!("HTTP {}: {}", status.as_u16(), snippet))
    } else {
        classify(Some(status.as_u16()), &snippet, None)
    }
}

#[async_trait]
impl Gateway for TelegramGateway {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn publish(&self, content: &ContentItem, destination: &Destination) -> GatewayResult<MessageRef> {
        let (method, payload) = Self::publish_request(content, destination);
        let sent: SentMessage = self.call(method, payload).await?;
        Ok(MessageRef(sent.message_id))
    }

    async fn pin(&self, destination: &Destination, message: MessageRef) -> GatewayResult<()> {
        let payload = json!({
            "chat_id": destination.address,
            "message_id": message.0,
            "disable_notification": !self.config.pin_notification,
        });
        self.call::<Value>("pinChatMessage", payload).await.map(|_| ())
    }

    async fn unpin(&self, destination: &Destination, message: MessageRef) -> GatewayResult<()> {
        let payload = json!({
            "chat_id": destination.address,
            "message_id": message.0,
        });
        self.call::<Value>("unpinChatMessage", payload).await.map(|_| ())
    }

    async fn delete(&self, destination: &Destination, message: MessageRef) -> GatewayResult<()> {
        let payload = json!({
            "chat_id": destination.address,
            "message_id": message.0,
        });
        self.call::<Value>("deleteMessage", payload).await.map(|_| ())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Button, ButtonLayout, DestinationStatus};

    fn destination() -> Destination {
        Destination {
            id: 1,
            address: "-100123".to_string(),
            title: "Deals".to_string(),
            status: DestinationStatus::Active,
            permissions_ok: true,
        }
    }

    #[test]
    fn test_classify_rate_limit() {
        let err = classify(Some(429), "Too Many Requests: retry after 7", Some(7));
        assert_eq!(
            err,
            GatewayError::RateLimited {
                retry_after: Duration::from_secs(7)
            }
        );
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify(Some(400), "Bad Request: message to delete not found", None);
        assert!(matches!(err, GatewayError::NotFound(_)));

    }

    #[test]
    fn test_undeletable_message_is_not_treated_as_gone() {
        let err = classify(Some(400), "Bad Request: message can't be deleted", None);
        assert!(matches!(err, GatewayError::Forbidden(_)));

        let err = classify(
            Some(400),
            "Bad Request: message can't be deleted for everyone",
            None,
        );
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[test]
    fn test_classify_permanent_and_transient() {
        assert!(matches!(
            classify(Some(403), "Forbidden: bot is not a member", None),
            GatewayError::Forbidden(_)
        ));
        assert!(matches!(
            classify(Some(400), "Bad Request: message text is empty", None),
            GatewayError::InvalidContent(_)
        ));
        assert!(matches!(
            classify(Some(502), "Bad Gateway", None),
            GatewayError::Transient(_)
        ));
        assert!(matches!(
            classify(None, "network unreachable", None),
            GatewayError::Transient(_)
        ));
    }

    #[test]
    fn test_publish_request_copy_with_buttons() {
        let content = ContentItem {
            id: 5,
            unit_id: Some(1),
            enabled: true,
            body: ContentBody::Copy {
                source_chat: "@library".to_string(),
                source_message: 42,
            },
            buttons: Some(ButtonLayout {
                rows: vec![vec![Button {
                    text: "Visit".to_string(),
                    url: Some("https://example.com".to_string()),
                    callback_data: None,
                }]],
            }),
        };

        let (method, payload) = TelegramGateway::publish_request(&content, &destination());
        assert_eq!(method, "copyMessage");
        assert_eq!(payload["from_chat_id"], "@library");
        assert_eq!(payload["message_id"], 42);
        assert_eq!(payload["reply_markup"]["inline_keyboard"][0][0]["text"], "Visit");
    }

    #[test]
    fn test_publish_request_media() {
        let content = ContentItem {
            id: 6,
            unit_id: Some(1),
            enabled: true,
            body: ContentBody::Media {
                kind: MediaKind::Photo,
                file_id: "AgAD".to_string(),
                caption: Some("Sale".to_string()),
            },
            buttons: None,
        };

        let (method, payload) = TelegramGateway::publish_request(&content, &destination());
        assert_eq!(method, "sendPhoto");
        assert_eq!(payload["photo"], "AgAD");
        assert_eq!(payload["caption"], "Sale");
        assert!(payload.get("reply_markup").is_none());
    }

    #[test]
    fn test_config_validate() {
        assert!(TelegramConfig::new("").validate().is_err());
        assert!(TelegramConfig::new("123:abc").validate().is_ok());
        assert!(TelegramConfig::new("123:abc")
            .with_api_base("ftp://nope")
            .validate()
            .is_err());
    }
}
