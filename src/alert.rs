//! Outbound alert delivery.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub title: String,
    /// Markdown body.
    pub body: String,
}

impl Alert {
    fn dedup_key(&self) -> String {
        format!("{}\n{}", self.title, self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDelivery {
    Sent,
    /// Identical content was already delivered; nothing was sent.
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("webhook rejected alert (status {status}): {message}")]
    Rejected { status: StatusCode, message: String },
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<AlertDelivery, AlertError>;
}

#[derive(Serialize)]
struct MarkdownMessage<'a> {
    msgtype: &'static str,
    markdown: MarkdownContent<'a>,
}

#[derive(Serialize)]
struct MarkdownContent<'a> {
    title: &'a str,
    text: &'a str,
}

/// Chat-robot reply. Robots answer HTTP 200 with a non-zero `errcode`
/// when they refuse a message.
#[derive(Deserialize, Default)]
#[serde(default)]
struct RobotResponse {
    errcode: i64,
    errmsg: String,
}

/// Posts markdown messages to a chat-robot webhook. Content already
/// delivered by this sink is not sent again.
pub struct WebhookAlertSink {
    client: Client,
    url: Url,
    delivered: Mutex<HashSet<String>>,
}

impl WebhookAlertSink {
    pub fn new(url: Url) -> Self {
        Self {
            client: Client::new(),
            url,
            delivered: Mutex::new(HashSet::new()),
        }
    }

    fn already_delivered(&self, key: &str) -> bool {
        match self.delivered.lock() {
            Ok(guard) => guard.contains(key),
            Err(poison) => poison.into_inner().contains(key),
        }
    }

    fn mark_delivered(&self, key: String) {
        match self.delivered.lock() {
            Ok(mut guard) => guard.insert(key),
            Err(poison) => poison.into_inner().insert(key),
        };
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &Alert) -> Result<AlertDelivery, AlertError> {
        let key = alert.dedup_key();
        if self.already_delivered(&key) {
            info!(title = %alert.title, "Skipping duplicate alert");
            return Ok(AlertDelivery::Duplicate);
        }

        let message = MarkdownMessage {
            msgtype: "markdown",
            markdown: MarkdownContent {
                title: &alert.title,
                text: &alert.body,
            },
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AlertError::Rejected { status, message });
        }

        let reply: RobotResponse = response.json().await.unwrap_or_default();
        if reply.errcode != 0 {
            return Err(AlertError::Rejected {
                status,
                message: format!("errcode {}: {}", reply.errcode, reply.errmsg),
            });
        }

        self.mark_delivered(key);
        info!(title = %alert.title, "Alert delivered");
        Ok(AlertDelivery::Sent)
    }
}

/// Used when no webhook is configured: alerts only reach the log.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> Result<AlertDelivery, AlertError> {
        warn!(title = %alert.title, body = %alert.body, "Alert raised (no webhook configured)");
        Ok(AlertDelivery::Sent)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;

    fn drift_alert() -> Alert {
        Alert {
            title: "[bridge] reserve drift".to_owned(),
            body: "WBTC: 12345.0000 USD".to_owned(),
        }
    }

    fn sink_for(server: &MockServer) -> WebhookAlertSink {
        WebhookAlertSink::new(Url::parse(&server.url("/robot/send")).unwrap())
    }

    #[tokio::test]
    async fn markdown_message_is_posted() {
        let server = MockServer::start();
        let robot = server.mock(|when, then| {
            when.method(POST).path("/robot/send").json_body(json!({
                "msgtype": "markdown",
                "markdown": {
                    "title": "[bridge] reserve drift",
                    "text": "WBTC: 12345.0000 USD"
                }
            }));
            then.status(200).json_body(json!({"errcode": 0, "errmsg": "ok"}));
        });
        let sink = sink_for(&server);

        let delivery = sink.send(&drift_alert()).await.unwrap();

        assert_eq!(delivery, AlertDelivery::Sent);
        robot.assert();
    }

    #[tokio::test]
    async fn identical_alert_is_delivered_once() {
        let server = MockServer::start();
        let robot = server.mock(|when, then| {
            when.method(POST).path("/robot/send");
            then.status(200).json_body(json!({"errcode": 0, "errmsg": "ok"}));
        });
        let sink = sink_for(&server);

        assert_eq!(sink.send(&drift_alert()).await.unwrap(), AlertDelivery::Sent);
        assert_eq!(
            sink.send(&drift_alert()).await.unwrap(),
            AlertDelivery::Duplicate
        );

        robot.assert_hits(1);
    }

    #[tokio::test]
    async fn failed_delivery_is_not_remembered() {
        let server = MockServer::start();
        let mut failing = server.mock(|when, then| {
            when.method(POST).path("/robot/send");
            then.status(502).body("bad gateway");
        });
        let sink = sink_for(&server);

        let err = sink.send(&drift_alert()).await.unwrap_err();
        assert!(matches!(
            err,
            AlertError::Rejected { status: StatusCode::BAD_GATEWAY, .. }
        ));

        failing.delete();
        let robot = server.mock(|when, then| {
            when.method(POST).path("/robot/send");
            then.status(200).json_body(json!({"errcode": 0, "errmsg": "ok"}));
        });

        assert_eq!(sink.send(&drift_alert()).await.unwrap(), AlertDelivery::Sent);
        robot.assert_hits(1);
    }

    #[tokio::test]
    async fn robot_error_code_is_a_rejection() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/robot/send");
            then.status(200)
                .json_body(json!({"errcode": 310000, "errmsg": "keywords not in content"}));
        });
        let sink = sink_for(&server);

        let err = sink.send(&drift_alert()).await.unwrap_err();

        assert!(
            matches!(err, AlertError::Rejected { ref message, .. } if message.contains("310000"))
        );
    }

    #[traced_test]
    #[tokio::test]
    async fn log_sink_writes_alert_to_log() {
        let delivery = LogAlertSink.send(&drift_alert()).await.unwrap();

        assert_eq!(delivery, AlertDelivery::Sent);
        assert!(logs_contain("reserve drift"));
    }
}
