//! Telegram gateway against a mock Bot API server

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use slotcast::gateway::{
    Gateway, GatewayError, GatewayRegistry, RetryConfig, RetryingGateway, TelegramConfig,
    TelegramGateway,
};
use slotcast::models::{
    Button, ButtonLayout, ContentBody, ContentItem, Destination, DestinationStatus, MediaKind,
    MessageRef,
};

const TOKEN: &str = "42:TEST";

fn gateway(server: &MockServer) -> TelegramGateway {
    let config = TelegramConfig::new(TOKEN)
        .with_api_base(server.uri())
        .with_timeout(5);
    TelegramGateway::new(config).unwrap()
}

fn api_path(method: &str) -> String {
    format!("/bot{TOKEN}/{method}")
}

fn destination() -> Destination {
    Destination {
        id: 7,
        address: "-1001234567890".to_string(),
        title: "Deals".to_string(),
        status: DestinationStatus::Active,
        permissions_ok: true,
    }
}

fn content(body: ContentBody) -> ContentItem {
    ContentItem {
        id: 3,
        unit_id: Some(1),
        enabled: true,
        body,
        buttons: None,
    }
}

fn sent(message_id: i64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "ok": true,
        "result": { "message_id": message_id, "date": 1709251200 }
    }))
}

fn api_error(status: u16, description: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({
        "ok": false,
        "error_code": status,
        "description": description
    }))
}

#[tokio::test]
async fn test_text_publish_uses_send_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("sendMessage")))
        .and(body_partial_json(json!({
            "chat_id": "-1001234567890",
            "text": "Spring sale"
        })))
        .respond_with(sent(77))
        .expect(1)
        .mount(&server)
        .await;

    let item = content(ContentBody::Text {
        text: "Spring sale".to_string(),
    });
    let message = gateway(&server).publish(&item, &destination()).await.unwrap();
    assert_eq!(message, MessageRef(77));
}

#[tokio::test]
async fn test_copy_publish_with_buttons() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("copyMessage")))
        .and(body_partial_json(json!({
            "chat_id": "-1001234567890",
            "from_chat_id": "@source_channel",
            "message_id": 512,
            "reply_markup": {
                "inline_keyboard": [[{ "text": "Shop", "url": "https://example.com/shop" }]]
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": { "message_id": 901 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut item = content(ContentBody::Copy {
        source_chat: "@source_channel".to_string(),
        source_message: 512,
    });
    item.buttons = Some(ButtonLayout {
        rows: vec![vec![Button {
            text: "Shop".to_string(),
            url: Some("https://example.com/shop".to_string()),
            callback_data: None,
        }]],
    });

    let message = gateway(&server).publish(&item, &destination()).await.unwrap();
    assert_eq!(message, MessageRef(901));
}

#[tokio::test]
async fn test_media_publish_uses_kind_specific_method() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("sendPhoto")))
        .and(body_partial_json(json!({
            "photo": "AgACAgIAAxkBAAIC",
            "caption": "New arrivals"
        })))
        .respond_with(sent(12))
        .expect(1)
        .mount(&server)
        .await;

    let item = content(ContentBody::Media {
        kind: MediaKind::Photo,
        file_id: "AgACAgIAAxkBAAIC".to_string(),
        caption: Some("New arrivals".to_string()),
    });
    let message = gateway(&server).publish(&item, &destination()).await.unwrap();
    assert_eq!(message, MessageRef(12));
}

#[tokio::test]
async fn test_pin_is_silent_by_default() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("pinChatMessage")))
        .and(body_partial_json(json!({
            "chat_id": "-1001234567890",
            "message_id": 77,
            "disable_notification": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": true })))
        .expect(1)
        .mount(&server)
        .await;

    gateway(&server)
        .pin(&destination(), MessageRef(77))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("sendMessage")))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests: retry after 5",
            "parameters": { "retry_after": 5 }
        })))
        .mount(&server)
        .await;

    let item = content(ContentBody::Text {
        text: "hi".to_string(),
    });
    let err = gateway(&server)
        .publish(&item, &destination())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::RateLimited {
            retry_after: Duration::from_secs(5)
        }
    );
}

#[tokio::test]
async fn test_error_classification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("deleteMessage")))
        .respond_with(api_error(400, "Bad Request: message to delete not found"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("sendMessage")))
        .respond_with(api_error(403, "Forbidden: bot was kicked from the channel chat"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("pinChatMessage")))
        .respond_with(api_error(400, "Bad Request: not enough rights to pin a message"))
        .mount(&server)
        .await;

    let gw = gateway(&server);
    let dest = destination();

    let err = gw.delete(&dest, MessageRef(1)).await.unwrap_err();
    assert!(matches!(err, GatewayError::NotFound(_)));

    let item = content(ContentBody::Text {
        text: "hi".to_string(),
    });
    let err = gw.publish(&item, &dest).await.unwrap_err();
    assert!(matches!(err, GatewayError::Forbidden(_)));

    let err = gw.pin(&dest, MessageRef(1)).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidContent(_)));
}

#[tokio::test]
async fn test_retrying_gateway_treats_missing_message_as_deleted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("deleteMessage")))
        .respond_with(api_error(400, "Bad Request: message to delete not found"))
        .expect(1)
        .mount(&server)
        .await;

    let registry = Arc::new(GatewayRegistry::new(Arc::new(gateway(&server))));
    let retrying = RetryingGateway::new(registry, RetryConfig::immediate(3));

    retrying
        .delete(&destination(), MessageRef(5))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_server_errors_are_retried_then_surface() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("sendMessage")))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>Bad Gateway</html>"))
        .expect(3)
        .mount(&server)
        .await;

    let registry = Arc::new(GatewayRegistry::new(Arc::new(gateway(&server))));
    let retrying = RetryingGateway::new(registry, RetryConfig::immediate(2));

    let item = content(ContentBody::Text {
        text: "hi".to_string(),
    });
    let err = retrying.publish(&item, &destination()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Transient(_)));
}

#[tokio::test]
async fn test_closed_gateway_makes_no_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sent(1))
        .expect(0)
        .mount(&server)
        .await;

    let gw = gateway(&server);
    gw.close().await;

    let err = gw.unpin(&destination(), MessageRef(1)).await.unwrap_err();
    assert_eq!(err, GatewayError::Closed);
}

#[test]
fn test_missing_token_rejected() {
    let config = TelegramConfig::new("");
    assert!(TelegramGateway::new(config).is_err());
}

#[tokio::test]
async fn test_undeletable_message_surfaces_as_forbidden() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("deleteMessage")))
        .respond_with(api_error(400, "Bad Request: message can't be deleted"))
        .expect(1)
        .mount(&server)
        .await;

    let registry = Arc::new(GatewayRegistry::new(Arc::new(gateway(&server))));
    let retrying = RetryingGateway::new(registry, RetryConfig::immediate(3));

    let err = retrying
        .delete(&destination(), MessageRef(5))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Forbidden(_)));
}

#[tokio::test]
async fn test_timeout_error_does_not_leak_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("sendMessage")))
        .respond_with(sent(1).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let gw = TelegramGateway::new(
        TelegramConfig::new(TOKEN)
            .with_api_base(server.uri())
            .with_timeout(1),
    )
    .unwrap();

    let item = content(ContentBody::Text {
        text: "hi".to_string(),
    });
    let err = gw.publish(&item, &destination()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Transient(_)));
    assert!(!err.to_string().contains(TOKEN), "token leaked: {err}");
    assert!(!format!("{err:?}").contains(TOKEN));
}

#[tokio::test]
async fn test_connection_error_does_not_leak_token() {
    // Grab a free port, then close it so the connection is refused
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let token = "123456:SUPERSECRETTOKEN";
    let gw = TelegramGateway::new(
        TelegramConfig::new(token)
            .with_api_base(format!("http://127.0.0.1:{port}"))
            .with_timeout(2),
    )
    .unwrap();

    let item = content(ContentBody::Text {
        text: "hi".to_string(),
    });
    let err = gw.publish(&item, &destination()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Transient(_)));
    assert!(!err.to_string().contains("SUPERSECRETTOKEN"), "token leaked: {err}");
}
