use std::sync::Arc;

use async_trait::async_trait;

use crate::models::queue::MintJob;
use crate::models::transactions::{BlockchainConfirmation, LegStatus};
use crate::repositories::blockchain::ChainBridge;
use crate::services::deposits::DepositOrchestrator;
use crate::services::queue::{
    Broker, Consumer, ConsumeOpts, Delivery, Disposition, QUEUE_BLOCKCHAIN_MINT,
};
use crate::services::ServiceError;

use super::WorkerHealth;

pub const WORKER_NAME: &str = "mint-worker";

/// Consumes mint jobs and reports settlement back to the orchestrator.
///
/// Runs with the configured prefetch, 1 by default: every mint signs with
/// the single admin key, so execution is serialized to keep the nonce
/// sequence clean. Raise it only with external nonce coordination.
pub struct MintWorker {
    orchestrator: DepositOrchestrator,
    bridge: Arc<dyn ChainBridge>,
    broker: Arc<Broker>,
}

impl MintWorker {
    pub fn new(
        orchestrator: DepositOrchestrator,
        bridge: Arc<dyn ChainBridge>,
        broker: Arc<Broker>,
    ) -> Self {
        MintWorker {
            orchestrator,
            bridge,
            broker,
        }
    }

    pub fn start(self: Arc<Self>) -> Result<tokio::task::JoinHandle<()>, anyhow::Error> {
        let broker = self.broker.clone();
        let opts = ConsumeOpts {
            prefetch: broker.settings().prefetch,
        };
        broker.consume(QUEUE_BLOCKCHAIN_MINT, self, opts)
    }

    pub fn health(&self) -> WorkerHealth {
        WorkerHealth::snapshot(WORKER_NAME, self.broker.consumer_count(QUEUE_BLOCKCHAIN_MINT))
    }

    /// Schedules a redelivery with a bumped retry counter, or declares the
    /// job exhausted.
    fn retry_or_exhaust(&self, job: &MintJob, error: &str) -> Result<Disposition, Disposition> {
        let next_retry = job.current_retry + 1;
        if next_retry >= self.broker.max_retries() {
            let exhausted =
                ServiceError::RetryExhausted(job.transaction_id.clone(), error.to_string());
            return Err(Disposition::DeadLetter(exhausted.to_string()));
        }

        let mut retried = job.clone();
        retried.current_retry = next_retry;
        log::warn!(
            "mint for {} failed (attempt {}/{}), retrying: {}",
            job.transaction_id,
            next_retry,
            self.broker.max_retries(),
            error
        );
        self.broker.schedule_retry(
            QUEUE_BLOCKCHAIN_MINT,
            Delivery {
                routing_key: QUEUE_BLOCKCHAIN_MINT.to_string(),
                payload: serde_json::to_value(&retried).expect("mint job serializes"),
                priority: 0,
                redelivered: true,
            },
            self.broker.retry_delay(),
        );
        Ok(Disposition::Ack)
    }

    async fn process(&self, job: MintJob) -> Disposition {
        // Idempotency gate: a redelivered job for an already-settled mint
        // is dropped silently.
        match self.orchestrator.get_deposit_status(&job.transaction_id).await {
            Ok(status) if status.blockchain_status == Some(LegStatus::Confirmed) => {
                log::info!("mint for {} already settled, dropping job", job.transaction_id);
                return Disposition::Ack;
            }
            Ok(status) if status.status.is_terminal() => {
                return Disposition::DeadLetter(format!(
                    "transaction {} already terminal ({})",
                    job.transaction_id,
                    status.status.as_str()
                ));
            }
            Ok(_) => {}
            Err(ServiceError::NotFound(detail)) => {
                return Disposition::DeadLetter(format!("unknown transaction: {}", detail));
            }
            Err(e) => {
                log::warn!("status read for {} failed: {}", job.transaction_id, e);
                return Disposition::Retry;
            }
        }

        let receipt = match self
            .bridge
            .mint(&job.recipient_address, job.amount_in_cents, &job.network)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                let provider_error =
                    ServiceError::ExternalProvider("ChainBridge".to_string(), e.to_string());
                return match self.retry_or_exhaust(&job, &provider_error.to_string()) {
                    Ok(disposition) => disposition,
                    Err(dead) => {
                        let reason = provider_error.to_string();
                        if let Err(fail_err) = self
                            .orchestrator
                            .fail_blockchain_mint(&job.transaction_id, &reason)
                            .await
                        {
                            log::error!(
                                "could not mark {} failed: {}",
                                job.transaction_id,
                                fail_err
                            );
                        }
                        dead
                    }
                };
            }
        };

        match self
            .orchestrator
            .confirm_blockchain_mint(
                &job.transaction_id,
                BlockchainConfirmation {
                    tx_hash: receipt.tx_hash,
                    block_number: receipt.block_number,
                    gas_used: receipt.gas_used,
                },
            )
            .await
        {
            Ok(_) => Disposition::Ack,
            Err(ServiceError::StateConflict { detail, .. }) => {
                // The mint executed but the row moved under us; do not
                // retry a settled chain operation.
                Disposition::DeadLetter(format!(
                    "mint settled but row unconfirmable: {}",
                    detail
                ))
            }
            Err(e) => {
                log::warn!(
                    "confirmation write for {} failed, will retry: {}",
                    job.transaction_id,
                    e
                );
                Disposition::Retry
            }
        }
    }
}

#[async_trait]
impl Consumer for MintWorker {
    async fn handle(&self, delivery: Delivery) -> Disposition {
        let job: MintJob = match serde_json::from_value(delivery.payload) {
            Ok(job) => job,
            Err(e) => return Disposition::DeadLetter(format!("malformed mint job: {}", e)),
        };

        self.process(job).await
    }
}
