use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::queue::NotificationJob;
use crate::services::queue::{
    Broker, Consumer, ConsumeOpts, Delivery, Disposition, QUEUE_NOTIFICATION_EMAIL,
    QUEUE_NOTIFICATION_WEBHOOK,
};

const WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// Email delivery consumer. Settlement mails are best-effort: the actual
/// mail relay sits behind an external pipeline, so this consumer records
/// the notification and never blocks a transaction on it.
pub struct EmailNotifier {
    broker: Arc<Broker>,
}

impl EmailNotifier {
    pub fn new(broker: Arc<Broker>) -> Self {
        EmailNotifier { broker }
    }

    pub fn start(self: Arc<Self>) -> Result<tokio::task::JoinHandle<()>, anyhow::Error> {
        let broker = self.broker.clone();
        broker.consume(QUEUE_NOTIFICATION_EMAIL, self, ConsumeOpts { prefetch: 8 })
    }
}

#[async_trait]
impl Consumer for EmailNotifier {
    async fn handle(&self, delivery: Delivery) -> Disposition {
        let job: NotificationJob = match serde_json::from_value(delivery.payload) {
            Ok(job) => job,
            Err(e) => return Disposition::DeadLetter(format!("malformed notification: {}", e)),
        };

        match job.target {
            Some(address) => {
                log::info!(
                    "email '{}' for transaction {} queued to {}",
                    job.subject,
                    job.transaction_id,
                    address
                );
            }
            None => {
                log::debug!(
                    "user {} has no email on file, dropping '{}' notification",
                    job.user_id,
                    job.subject
                );
            }
        }
        Disposition::Ack
    }
}

/// Webhook delivery consumer. POSTs the notification body to the partner
/// URL; transient delivery failures are redelivered with a bumped counter.
pub struct WebhookNotifier {
    client: reqwest::Client,
    broker: Arc<Broker>,
}

impl WebhookNotifier {
    pub fn new(broker: Arc<Broker>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        WebhookNotifier { client, broker }
    }

    pub fn start(self: Arc<Self>) -> Result<tokio::task::JoinHandle<()>, anyhow::Error> {
        let broker = self.broker.clone();
        broker.consume(QUEUE_NOTIFICATION_WEBHOOK, self, ConsumeOpts { prefetch: 8 })
    }

    fn retry_or_exhaust(&self, job: &NotificationJob, error: &str) -> Disposition {
        let next_retry = job.current_retry + 1;
        if next_retry >= self.broker.max_retries() {
            return Disposition::DeadLetter(format!(
                "webhook delivery exhausted after {} attempts: {}",
                next_retry, error
            ));
        }

        let mut retried = job.clone();
        retried.current_retry = next_retry;
        log::warn!(
            "webhook for {} failed (attempt {}/{}), retrying: {}",
            job.transaction_id,
            next_retry,
            self.broker.max_retries(),
            error
        );
        self.broker.schedule_retry(
            QUEUE_NOTIFICATION_WEBHOOK,
            Delivery {
                routing_key: QUEUE_NOTIFICATION_WEBHOOK.to_string(),
                payload: serde_json::to_value(&retried).expect("notification job serializes"),
                priority: 0,
                redelivered: true,
            },
            self.broker.retry_delay(),
        );
        Disposition::Ack
    }

    async fn deliver(&self, job: &NotificationJob, url: &str) -> Result<(), anyhow::Error> {
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({
                "event": job.subject,
                "transactionId": job.transaction_id,
                "data": job.body,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("partner returned {}", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for WebhookNotifier {
    async fn handle(&self, delivery: Delivery) -> Disposition {
        let job: NotificationJob = match serde_json::from_value(delivery.payload) {
            Ok(job) => job,
            Err(e) => return Disposition::DeadLetter(format!("malformed notification: {}", e)),
        };

        let url = match job.target.clone() {
            Some(url) => url,
            None => {
                // Nothing to call back; not an error.
                return Disposition::Ack;
            }
        };

        match self.deliver(&job, &url).await {
            Ok(()) => {
                log::info!(
                    "webhook '{}' for transaction {} delivered",
                    job.subject,
                    job.transaction_id
                );
                Disposition::Ack
            }
            Err(e) => self.retry_or_exhaust(&job, &e.to_string()),
        }
    }
}
