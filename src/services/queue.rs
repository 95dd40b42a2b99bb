use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;

use crate::settings::Queue as QueueSettings;

pub const QUEUE_DEPOSIT_PROCESSING: &str = "deposit-processing";
pub const QUEUE_BLOCKCHAIN_MINT: &str = "blockchain-mint";
pub const QUEUE_WITHDRAWAL_PROCESSING: &str = "withdrawal-processing";
pub const QUEUE_NOTIFICATION_EMAIL: &str = "notification-email";
pub const QUEUE_NOTIFICATION_WEBHOOK: &str = "notification-webhook";

const STANDARD_QUEUES: [&str; 5] = [
    QUEUE_DEPOSIT_PROCESSING,
    QUEUE_BLOCKCHAIN_MINT,
    QUEUE_WITHDRAWAL_PROCESSING,
    QUEUE_NOTIFICATION_EMAIL,
    QUEUE_NOTIFICATION_WEBHOOK,
];

#[derive(Clone, Debug)]
pub struct Delivery {
    pub routing_key: String,
    pub payload: serde_json::Value,
    pub priority: u8,
    pub redelivered: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct PublishOpts {
    pub persistent: bool,
    pub priority: u8,
}

impl Default for PublishOpts {
    fn default() -> Self {
        PublishOpts {
            persistent: true,
            priority: 0,
        }
    }
}

/// What a consumer tells the broker about a delivery. Delivery is
/// at-least-once; consumers are expected to be idempotent.
#[derive(Debug)]
pub enum Disposition {
    /// Done (or recognised as already done).
    Ack,
    /// Transient failure: redeliver after the retry delay. The consumer is
    /// responsible for bumping the message-embedded retry counter before
    /// returning this.
    Retry,
    /// Terminal: park in the DLQ for manual inspection.
    DeadLetter(String),
}

#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery) -> Disposition;
}

#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub delivery: Delivery,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug)]
pub struct ConsumeOpts {
    /// Number of deliveries processed concurrently. Mint runs with 1 so the
    /// admin signing key never races its own nonce.
    pub prefetch: usize,
}

struct QueueState {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    dead: Mutex<Vec<DeadLetter>>,
    consumers: AtomicUsize,
}

impl QueueState {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        QueueState {
            tx,
            rx: Mutex::new(Some(rx)),
            dead: Mutex::new(Vec::new()),
            consumers: AtomicUsize::new(0),
        }
    }
}

/// In-process topic broker: one queue per operation, at-least-once
/// delivery, manual ack via `Disposition`, a first-class delayed-retry
/// primitive (`schedule_retry`) and a DLQ per queue.
///
/// An AMQP deployment implements the same contract with a TTL retry queue
/// dead-lettering back into the primary queue; here the delay is a timer
/// task redelivering into the same channel.
pub struct Broker {
    queues: DashMap<String, Arc<QueueState>>,
    bindings: DashMap<String, Vec<String>>,
    settings: QueueSettings,
}

impl Broker {
    pub fn new(settings: QueueSettings) -> Arc<Self> {
        let broker = Broker {
            queues: DashMap::new(),
            bindings: DashMap::new(),
            settings,
        };
        for queue in STANDARD_QUEUES {
            broker.declare_queue(queue);
        }
        Arc::new(broker)
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Declares a queue and binds it to the routing key of the same name.
    pub fn declare_queue(&self, name: &str) {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::new()));
        self.bind(name, name);
    }

    pub fn bind(&self, queue: &str, routing_key: &str) {
        let mut targets = self
            .bindings
            .entry(routing_key.to_string())
            .or_default();
        if !targets.iter().any(|q| q == queue) {
            targets.push(queue.to_string());
        }
    }

    /// At-least-once publish to every queue bound to the routing key. A
    /// closed queue is retried on a fixed delay, capped, mirroring a broker
    /// reconnect loop.
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: serde_json::Value,
        opts: PublishOpts,
    ) -> Result<(), anyhow::Error> {
        let targets: Vec<String> = match self.bindings.get(routing_key) {
            Some(targets) => targets.value().clone(),
            None => {
                log::warn!("no queue bound to routing key {}, dropping", routing_key);
                return Ok(());
            }
        };

        for queue in targets {
            let delivery = Delivery {
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
                priority: opts.priority,
                redelivered: false,
            };
            self.deliver(&queue, delivery).await?;
        }

        Ok(())
    }

    async fn deliver(&self, queue: &str, delivery: Delivery) -> Result<(), anyhow::Error> {
        let state = self
            .queues
            .get(queue)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| anyhow::anyhow!("unknown queue: {}", queue))?;

        let mut delivery = delivery;
        let mut attempt = 0;
        loop {
            match state.tx.send(delivery) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    attempt += 1;
                    if attempt >= self.settings.publish_attempts {
                        anyhow::bail!(
                            "queue {} unavailable after {} publish attempts",
                            queue,
                            attempt
                        );
                    }
                    log::warn!(
                        "queue {} unavailable, retrying publish (attempt {})",
                        queue,
                        attempt
                    );
                    delivery = returned;
                    sleep(Duration::from_secs(self.settings.publish_retry_delay_secs)).await;
                }
            }
        }
    }

    /// Redelivers a message into its queue after `delay`. This is the
    /// delayed-retry capability the retry-TTL queue would otherwise provide.
    pub fn schedule_retry(self: &Arc<Self>, queue: &str, delivery: Delivery, delay: Duration) {
        let broker = self.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            sleep(delay).await;
            let delivery = Delivery {
                redelivered: true,
                ..delivery
            };
            if let Err(e) = broker.deliver(&queue, delivery).await {
                log::error!("retry redelivery into {} failed: {}", queue, e);
            }
        });
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.settings.retry_delay_secs)
    }

    pub fn max_retries(&self) -> u32 {
        self.settings.max_retries
    }

    /// Attaches the consumer to the queue and processes deliveries until
    /// the broker is dropped. At most one consumer group per queue.
    pub fn consume(
        self: &Arc<Self>,
        queue: &str,
        consumer: Arc<dyn Consumer>,
        opts: ConsumeOpts,
    ) -> Result<tokio::task::JoinHandle<()>, anyhow::Error> {
        let state = self
            .queues
            .get(queue)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| anyhow::anyhow!("unknown queue: {}", queue))?;

        let mut rx = state
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("queue {} already has a consumer", queue))?;

        state.consumers.fetch_add(1, Ordering::SeqCst);

        let broker = self.clone();
        let queue_name = queue.to_string();
        let prefetch = opts.prefetch.max(1);
        let handle = tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(prefetch));
            while let Some(delivery) = rx.recv().await {
                let permit = permits.clone().acquire_owned().await.unwrap();
                let broker = broker.clone();
                let consumer = consumer.clone();
                let queue_name = queue_name.clone();
                let queue_state = broker
                    .queues
                    .get(&queue_name)
                    .map(|s| Arc::clone(s.value()))
                    .expect("consumed queue disappeared");

                let work = async move {
                    let retained = delivery.clone();
                    match consumer.handle(delivery).await {
                        Disposition::Ack => {}
                        Disposition::Retry => {
                            broker.schedule_retry(&queue_name, retained, broker.retry_delay());
                        }
                        Disposition::DeadLetter(reason) => {
                            log::warn!(
                                "dead-lettering message from {}: {}",
                                queue_name,
                                reason
                            );
                            queue_state.dead.lock().unwrap().push(DeadLetter {
                                delivery: retained,
                                reason,
                                at: Utc::now(),
                            });
                        }
                    }
                    drop(permit);
                };

                if prefetch == 1 {
                    // Serialized: the next delivery waits for this one.
                    work.await;
                } else {
                    tokio::spawn(work);
                }
            }
            state.consumers.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(handle)
    }

    /// DLQ contents for manual inspection; messages stay parked until an
    /// operator republishes them.
    pub fn dead_letters(&self, queue: &str) -> Vec<DeadLetter> {
        self.queues
            .get(queue)
            .map(|state| state.dead.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map(|state| state.consumers.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use crate::models::queue::DepositProcessingJob;

    use super::*;

    fn test_settings() -> QueueSettings {
        QueueSettings {
            max_retries: 3,
            retry_delay_secs: 0,
            publish_attempts: 2,
            publish_retry_delay_secs: 0,
            prefetch: 1,
        }
    }

    struct Counting {
        seen: AtomicU32,
        fail_first: u32,
        done: mpsc::UnboundedSender<u32>,
    }

    #[async_trait]
    impl Consumer for Counting {
        async fn handle(&self, _delivery: Delivery) -> Disposition {
            let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.done.send(n);
            if n <= self.fail_first {
                Disposition::Retry
            } else {
                Disposition::Ack
            }
        }
    }

    #[tokio::test]
    async fn delivers_published_messages() {
        let broker = Broker::new(test_settings());
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .consume(
                QUEUE_BLOCKCHAIN_MINT,
                Arc::new(Counting {
                    seen: AtomicU32::new(0),
                    fail_first: 0,
                    done: tx,
                }),
                ConsumeOpts { prefetch: 1 },
            )
            .unwrap();

        broker
            .publish(
                QUEUE_BLOCKCHAIN_MINT,
                json!({"transactionId": "tx-1"}),
                PublishOpts::default(),
            )
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(1));
    }

    #[tokio::test]
    async fn retry_disposition_redelivers() {
        let broker = Broker::new(test_settings());
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .consume(
                QUEUE_BLOCKCHAIN_MINT,
                Arc::new(Counting {
                    seen: AtomicU32::new(0),
                    fail_first: 2,
                    done: tx,
                }),
                ConsumeOpts { prefetch: 1 },
            )
            .unwrap();

        broker
            .publish(
                QUEUE_BLOCKCHAIN_MINT,
                json!({"transactionId": "tx-1"}),
                PublishOpts::default(),
            )
            .await
            .unwrap();

        // Two retries, then the ack.
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    struct AlwaysDead;

    #[async_trait]
    impl Consumer for AlwaysDead {
        async fn handle(&self, _delivery: Delivery) -> Disposition {
            Disposition::DeadLetter("retries exhausted".to_string())
        }
    }

    #[tokio::test]
    async fn dead_letter_parks_the_message() {
        let broker = Broker::new(test_settings());
        broker
            .consume(
                QUEUE_WITHDRAWAL_PROCESSING,
                Arc::new(AlwaysDead),
                ConsumeOpts { prefetch: 1 },
            )
            .unwrap();

        broker
            .publish(
                QUEUE_WITHDRAWAL_PROCESSING,
                json!({"withdrawalId": "wd-1"}),
                PublishOpts::default(),
            )
            .await
            .unwrap();

        // Consumer loop runs on another task; poll until the DLQ fills.
        for _ in 0..50 {
            if !broker.dead_letters(QUEUE_WITHDRAWAL_PROCESSING).is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        let dead = broker.dead_letters(QUEUE_WITHDRAWAL_PROCESSING);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "retries exhausted");
        assert_eq!(dead[0].delivery.payload["withdrawalId"], "wd-1");
    }

    struct Paired {
        barrier: Arc<tokio::sync::Barrier>,
        done: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl Consumer for Paired {
        async fn handle(&self, _delivery: Delivery) -> Disposition {
            // Completes only when two deliveries are in flight at once.
            self.barrier.wait().await;
            let _ = self.done.send(());
            Disposition::Ack
        }
    }

    #[tokio::test]
    async fn configured_prefetch_allows_parallel_deliveries() {
        let broker = Broker::new(QueueSettings {
            prefetch: 2,
            ..test_settings()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .consume(
                QUEUE_NOTIFICATION_WEBHOOK,
                Arc::new(Paired {
                    barrier: Arc::new(tokio::sync::Barrier::new(2)),
                    done: tx,
                }),
                ConsumeOpts {
                    prefetch: broker.settings().prefetch,
                },
            )
            .unwrap();

        for _ in 0..2 {
            broker
                .publish(
                    QUEUE_NOTIFICATION_WEBHOOK,
                    json!({"transactionId": "tx-1"}),
                    PublishOpts::default(),
                )
                .await
                .unwrap();
        }

        // With prefetch 1 the first handler would block the second forever.
        let both = tokio::time::timeout(Duration::from_secs(2), async {
            rx.recv().await;
            rx.recv().await;
        })
        .await;
        assert!(both.is_ok());
    }

    #[tokio::test]
    async fn second_consumer_on_a_queue_is_rejected() {
        let broker = Broker::new(test_settings());
        let (tx, _rx) = mpsc::unbounded_channel();
        let consumer = Arc::new(Counting {
            seen: AtomicU32::new(0),
            fail_first: 0,
            done: tx,
        });

        broker
            .consume(
                QUEUE_NOTIFICATION_EMAIL,
                consumer.clone(),
                ConsumeOpts { prefetch: 1 },
            )
            .unwrap();
        assert!(broker
            .consume(QUEUE_NOTIFICATION_EMAIL, consumer, ConsumeOpts { prefetch: 1 })
            .is_err());
    }

    struct Typed {
        done: mpsc::UnboundedSender<DepositProcessingJob>,
    }

    #[async_trait]
    impl Consumer for Typed {
        async fn handle(&self, delivery: Delivery) -> Disposition {
            match serde_json::from_value(delivery.payload) {
                Ok(job) => {
                    let _ = self.done.send(job);
                    Disposition::Ack
                }
                Err(e) => Disposition::DeadLetter(format!("malformed job: {}", e)),
            }
        }
    }

    #[tokio::test]
    async fn republished_deposit_processing_job_round_trips() {
        let broker = Broker::new(test_settings());
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .consume(
                QUEUE_DEPOSIT_PROCESSING,
                Arc::new(Typed { done: tx }),
                ConsumeOpts { prefetch: 1 },
            )
            .unwrap();

        // The shape an operator republishes by hand; the retry counter is
        // optional and defaults to zero.
        broker
            .publish(
                QUEUE_DEPOSIT_PROCESSING,
                json!({"transactionId": "tx-1", "userId": "user-1", "amountInCents": 10_000}),
                PublishOpts::default(),
            )
            .await
            .unwrap();

        let job = rx.recv().await.unwrap();
        assert_eq!(job.transaction_id, "tx-1");
        assert_eq!(job.user_id, "user-1");
        assert_eq!(job.amount_in_cents, 10_000);
        assert_eq!(job.current_retry, 0);
    }

    #[tokio::test]
    async fn topic_binding_fans_out() {
        let broker = Broker::new(test_settings());
        broker.declare_queue("audit");
        broker.bind("audit", QUEUE_BLOCKCHAIN_MINT);

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        broker
            .consume(
                QUEUE_BLOCKCHAIN_MINT,
                Arc::new(Counting {
                    seen: AtomicU32::new(0),
                    fail_first: 0,
                    done: tx_a,
                }),
                ConsumeOpts { prefetch: 1 },
            )
            .unwrap();
        broker
            .consume(
                "audit",
                Arc::new(Counting {
                    seen: AtomicU32::new(0),
                    fail_first: 0,
                    done: tx_b,
                }),
                ConsumeOpts { prefetch: 1 },
            )
            .unwrap();

        broker
            .publish(
                QUEUE_BLOCKCHAIN_MINT,
                json!({"transactionId": "tx-1"}),
                PublishOpts::default(),
            )
            .await
            .unwrap();

        assert_eq!(rx_a.recv().await, Some(1));
        assert_eq!(rx_b.recv().await, Some(1));
    }
}
