// WhatsApp sender against a mocked provider API

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::services::{NotificationSender, OutboundMessage, SendError, WhatsAppSender};

fn message(body: &str) -> OutboundMessage {
    OutboundMessage {
        subject: Some("ignored for chat".to_string()),
        body: body.to_string(),
    }
}

#[tokio::test]
async fn sends_text_messages_with_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("authorization", "Bearer secret-token"))
        .and(body_json(json!({
            "messaging_product": "whatsapp",
            "to": "31612345678",
            "type": "text",
            "text": {"body": "Uw afspraak is morgen"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"messages": [{"id": "wamid.1"}]})))
        .expect(1)
        .mount(&server)
        .await;

    let sender = WhatsAppSender::new(format!("{}/v1/messages", server.uri()), "secret-token").unwrap();
    sender
        .send("+31612345678", &message("Uw afspraak is morgen"))
        .await
        .unwrap();
}

#[tokio::test]
async fn provider_rejections_surface_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("recipient not on whatsapp"))
        .mount(&server)
        .await;

    let sender = WhatsAppSender::new(server.uri(), "secret-token").unwrap();
    let err = sender.send("+31612345678", &message("hallo")).await.unwrap_err();
    match err {
        SendError::Rejected { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "recipient not on whatsapp");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn malformed_numbers_never_reach_the_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let sender = WhatsAppSender::new(server.uri(), "secret-token").unwrap();
    let err = sender.send("jan@example.com", &message("hallo")).await.unwrap_err();
    assert!(matches!(err, SendError::InvalidRecipient(_)));
}
