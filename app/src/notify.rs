//! Notification boundary. Loggable events carry a tag; sinks subscribe to a
//! list of tags and receive matching messages. The only built-in sink is a
//! plain webhook; anything richer lives outside the daemon.

use std::time::Duration;

use common::config::NotificationsConfig;
use common::model::Event;
use flume::{Receiver, Sender};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const NOTIFY_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct Notification {
    pub account: String,
    pub event: Event,
    pub message: String,
}

/// Fans loggable events out to the configured sinks. Cheap to clone; the
/// consumer task runs until the queue closes or the scope is cancelled.
#[derive(Clone)]
pub struct Dispatcher {
    tx: Sender<Notification>,
    account: String,
}

impl Dispatcher {
    pub fn new(
        account: &str,
        config: NotificationsConfig,
        cancel: CancellationToken,
    ) -> Dispatcher {
        let (tx, rx) = flume::bounded(NOTIFY_QUEUE_CAPACITY);
        tokio::spawn(dispatch_loop(rx, config, cancel));
        Dispatcher {
            tx,
            account: account.to_owned(),
        }
    }

    /// Queues a notification; drops it when the queue is saturated rather
    /// than blocking an event handler.
    pub fn notify(&self, event: Event, message: impl Into<String>) {
        let notification = Notification {
            account: self.account.clone(),
            event,
            message: message.into(),
        };
        if self.tx.try_send(notification).is_err() {
            debug!(account = %self.account, "Notify queue full, dropping notification");
        }
    }
}

async fn dispatch_loop(
    rx: Receiver<Notification>,
    config: NotificationsConfig,
    cancel: CancellationToken,
) {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Building notify HTTP client");

    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => return,
            n = rx.recv_async() => match n {
                Ok(n) => n,
                Err(_) => return,
            },
        };

        if let Some(webhook) = &config.webhook {
            if webhook.enabled && webhook.events.contains(&notification.event) {
                let body = json!({
                    "account": notification.account,
                    "event": notification.event.to_string(),
                    "message": notification.message,
                });
                if let Err(err) = http.post(&webhook.endpoint).json(&body).send().await {
                    warn!(endpoint = %webhook.endpoint, "Webhook notification failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use common::config::WebhookConfig;

    use super::*;

    #[tokio::test]
    async fn notify_is_non_blocking_when_saturated() {
        let config = NotificationsConfig {
            webhook: Some(WebhookConfig {
                enabled: false,
                endpoint: String::new(),
                events: vec![],
            }),
        };
        let cancel = CancellationToken::new();
        cancel.cancel(); // consumer exits immediately, queue fills up
        let dispatcher = Dispatcher::new("acc", config, cancel);

        for i in 0..(NOTIFY_QUEUE_CAPACITY + 10) {
            dispatcher.notify(Event::BetWin, format!("message {i}"));
        }
        // Reaching this point without deadlock is the assertion.
    }
}
