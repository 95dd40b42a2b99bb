use std::sync::Arc;

use async_trait::async_trait;

use crate::models::queue::WithdrawalJob;
use crate::models::transactions::{BlockchainConfirmation, LegStatus, PixConfirmation};
use crate::repositories::blockchain::ChainBridge;
use crate::repositories::pix::PixGateway;
use crate::services::queue::{
    Broker, Consumer, ConsumeOpts, Delivery, Disposition, QUEUE_WITHDRAWAL_PROCESSING,
};
use crate::services::withdrawals::WithdrawalOrchestrator;
use crate::services::ServiceError;

use super::WorkerHealth;

pub const WORKER_NAME: &str = "withdraw-worker";

/// Consumes withdrawal jobs: burn on-chain first, then the PIX payout.
///
/// The two sub-steps compensate differently. A burn failure aborts cleanly
/// (nothing moved, safe to retry or fail). A payout failure after a settled
/// burn means funds already left circulation: that path is flagged for
/// manual reconciliation and never re-run automatically.
pub struct WithdrawWorker {
    orchestrator: WithdrawalOrchestrator,
    bridge: Arc<dyn ChainBridge>,
    gateway: Arc<dyn PixGateway>,
    broker: Arc<Broker>,
    network: String,
}

impl WithdrawWorker {
    pub fn new(
        orchestrator: WithdrawalOrchestrator,
        bridge: Arc<dyn ChainBridge>,
        gateway: Arc<dyn PixGateway>,
        broker: Arc<Broker>,
        network: String,
    ) -> Self {
        WithdrawWorker {
            orchestrator,
            bridge,
            gateway,
            broker,
            network,
        }
    }

    pub fn start(self: Arc<Self>) -> Result<tokio::task::JoinHandle<()>, anyhow::Error> {
        let broker = self.broker.clone();
        let opts = ConsumeOpts {
            prefetch: broker.settings().prefetch,
        };
        broker.consume(QUEUE_WITHDRAWAL_PROCESSING, self, opts)
    }

    pub fn health(&self) -> WorkerHealth {
        WorkerHealth::snapshot(
            WORKER_NAME,
            self.broker.consumer_count(QUEUE_WITHDRAWAL_PROCESSING),
        )
    }

    fn retry_or_exhaust(&self, job: &WithdrawalJob, error: &str) -> Result<Disposition, Disposition> {
        let next_retry = job.current_retry + 1;
        if next_retry >= self.broker.max_retries() {
            let exhausted =
                ServiceError::RetryExhausted(job.withdrawal_id.clone(), error.to_string());
            return Err(Disposition::DeadLetter(exhausted.to_string()));
        }

        let mut retried = job.clone();
        retried.current_retry = next_retry;
        log::warn!(
            "burn for {} failed (attempt {}/{}), retrying: {}",
            job.withdrawal_id,
            next_retry,
            self.broker.max_retries(),
            error
        );
        self.broker.schedule_retry(
            QUEUE_WITHDRAWAL_PROCESSING,
            Delivery {
                routing_key: QUEUE_WITHDRAWAL_PROCESSING.to_string(),
                payload: serde_json::to_value(&retried).expect("withdrawal job serializes"),
                priority: 0,
                redelivered: true,
            },
            self.broker.retry_delay(),
        );
        Ok(Disposition::Ack)
    }

    async fn process(&self, job: WithdrawalJob) -> Disposition {
        let status = match self
            .orchestrator
            .get_withdrawal_status(&job.withdrawal_id)
            .await
        {
            Ok(status) => status,
            Err(ServiceError::NotFound(detail)) => {
                return Disposition::DeadLetter(format!("unknown withdrawal: {}", detail));
            }
            Err(e) => {
                log::warn!("status read for {} failed: {}", job.withdrawal_id, e);
                return Disposition::Retry;
            }
        };

        if status.status.is_terminal() {
            log::info!(
                "withdrawal {} already {}, dropping job",
                job.withdrawal_id,
                status.status.as_str()
            );
            return Disposition::Ack;
        }

        // Step 1: burn, unless a previous delivery already settled it.
        if status.blockchain_status != Some(LegStatus::Confirmed) {
            let receipt = match self
                .bridge
                .burn(&job.blockchain_address, job.amount_in_cents, &self.network)
                .await
            {
                Ok(receipt) => receipt,
                Err(e) => {
                    let provider_error =
                        ServiceError::ExternalProvider("ChainBridge".to_string(), e.to_string());
                    // Nothing moved: clean abort, retry or fail terminally.
                    return match self.retry_or_exhaust(&job, &provider_error.to_string()) {
                        Ok(disposition) => disposition,
                        Err(dead) => {
                            let reason = provider_error.to_string();
                            if let Err(fail_err) = self
                                .orchestrator
                                .fail_burn(&job.withdrawal_id, &reason)
                                .await
                            {
                                log::error!(
                                    "could not mark {} failed: {}",
                                    job.withdrawal_id,
                                    fail_err
                                );
                            }
                            dead
                        }
                    };
                }
            };

            if let Err(e) = self
                .orchestrator
                .confirm_burn(
                    &job.withdrawal_id,
                    BlockchainConfirmation {
                        tx_hash: receipt.tx_hash,
                        block_number: receipt.block_number,
                        gas_used: receipt.gas_used,
                    },
                )
                .await
            {
                // The burn is on-chain; never re-run it. Park for an
                // operator if the row cannot take the confirmation.
                return Disposition::DeadLetter(format!(
                    "burn settled but row unconfirmable: {}",
                    e
                ));
            }
        }

        // Step 2: fiat payout. From here on the burn has settled, so any
        // failure is a reconciliation case, not a retry.
        let payout = match self
            .gateway
            .payout(&job.withdrawal_id, &job.pix_key, status.net_amount_in_cents)
            .await
        {
            Ok(payout) => payout,
            Err(e) => {
                let provider_error =
                    ServiceError::ExternalProvider("PixGateway".to_string(), e.to_string());
                if let Err(flag_err) = self
                    .orchestrator
                    .flag_reconciliation(&job.withdrawal_id, &provider_error.to_string())
                    .await
                {
                    log::error!(
                        "could not flag {} for reconciliation: {}",
                        job.withdrawal_id,
                        flag_err
                    );
                }
                return Disposition::DeadLetter(format!(
                    "payout failed after settled burn: {}",
                    provider_error
                ));
            }
        };

        match self
            .orchestrator
            .confirm_payout(
                &job.withdrawal_id,
                PixConfirmation {
                    pix_transaction_id: payout.id,
                    payer_document: None,
                    payer_name: None,
                    paid_amount_in_cents: Some(status.net_amount_in_cents),
                },
            )
            .await
        {
            Ok(_) => Disposition::Ack,
            Err(e) => {
                log::warn!(
                    "payout confirmation write for {} failed, will retry: {}",
                    job.withdrawal_id,
                    e
                );
                Disposition::Retry
            }
        }
    }
}

#[async_trait]
impl Consumer for WithdrawWorker {
    async fn handle(&self, delivery: Delivery) -> Disposition {
        let job: WithdrawalJob = match serde_json::from_value(delivery.payload) {
            Ok(job) => job,
            Err(e) => return Disposition::DeadLetter(format!("malformed withdrawal job: {}", e)),
        };

        self.process(job).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use anyhow::bail;

    use crate::models::pix::PixPayout;
    use crate::models::transactions::TransactionStatus;
    use crate::repositories::blockchain::ChainReceipt;
    use crate::repositories::taxes::MemoryTaxStore;
    use crate::repositories::transactions::MemoryTransactionStore;
    use crate::repositories::users::{MemoryUserDirectory, UserAccount};
    use crate::services::deposits::tests::test_broker;
    use crate::services::fees::FeeCalculator;

    use super::*;

    struct ScriptedBridge {
        burns: Mutex<Vec<i64>>,
        fail: bool,
    }

    #[async_trait]
    impl ChainBridge for ScriptedBridge {
        async fn mint(
            &self,
            _recipient: &str,
            _amount_in_cents: i64,
            _network: &str,
        ) -> Result<ChainReceipt, anyhow::Error> {
            bail!("not a mint test");
        }

        async fn burn(
            &self,
            _holder: &str,
            amount_in_cents: i64,
            _network: &str,
        ) -> Result<ChainReceipt, anyhow::Error> {
            if self.fail {
                bail!("missing burner role");
            }
            self.burns.lock().unwrap().push(amount_in_cents);
            Ok(ChainReceipt {
                tx_hash: "0xburn".to_string(),
                block_number: 12,
                gas_used: 32000,
                delta_in_cents: amount_in_cents,
            })
        }
    }

    struct ScriptedGateway {
        payouts: Mutex<Vec<(String, i64)>>,
        fail: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PixGateway for ScriptedGateway {
        async fn payout(
            &self,
            withdrawal_id: &str,
            _pix_key: &str,
            amount_in_cents: i64,
        ) -> Result<PixPayout, anyhow::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("provider rejected payout");
            }
            self.payouts
                .lock()
                .unwrap()
                .push((withdrawal_id.to_string(), amount_in_cents));
            Ok(PixPayout {
                id: format!("payout-{}", withdrawal_id),
                end_to_end_id: Some("E2E123".to_string()),
                status: "settled".to_string(),
            })
        }
    }

    struct Fixture {
        orchestrator: WithdrawalOrchestrator,
        worker: WithdrawWorker,
        bridge: Arc<ScriptedBridge>,
        gateway: Arc<ScriptedGateway>,
    }

    fn fixture(burn_fails: bool, payout_fails: bool) -> Fixture {
        let store = Arc::new(MemoryTransactionStore::new());
        let users = Arc::new(MemoryUserDirectory::new());
        users.insert(UserAccount {
            id: "user-1".to_string(),
            company_id: Some("company-1".to_string()),
            wallet_address: Some("0x00000000000000000000000000000000000000aa".to_string()),
            email: Some("user@example.com".to_string()),
            webhook_url: None,
        });
        let broker = test_broker();
        let orchestrator = WithdrawalOrchestrator::new(
            store,
            users,
            FeeCalculator::new(Arc::new(MemoryTaxStore::new())),
            broker.clone(),
            "polygon".to_string(),
        );
        let bridge = Arc::new(ScriptedBridge {
            burns: Mutex::new(Vec::new()),
            fail: burn_fails,
        });
        let gateway = Arc::new(ScriptedGateway {
            payouts: Mutex::new(Vec::new()),
            fail: payout_fails,
            calls: AtomicU32::new(0),
        });
        let worker = WithdrawWorker::new(
            orchestrator.clone(),
            bridge.clone(),
            gateway.clone(),
            broker,
            "polygon".to_string(),
        );
        Fixture {
            orchestrator,
            worker,
            bridge,
            gateway,
        }
    }

    async fn initiated(f: &Fixture) -> WithdrawalJob {
        let receipt = f
            .orchestrator
            .initiate_withdrawal("user-1", 10_000, "payee@pix.example", "email")
            .await
            .unwrap();
        WithdrawalJob {
            withdrawal_id: receipt.withdrawal_id,
            user_id: "user-1".to_string(),
            amount_in_cents: receipt.amount_in_cents,
            pix_key: "payee@pix.example".to_string(),
            blockchain_address: "0x00000000000000000000000000000000000000aa".to_string(),
            user_email: Some("user@example.com".to_string()),
            webhook_url: None,
            current_retry: 0,
        }
    }

    #[tokio::test]
    async fn burn_then_payout_confirms_the_withdrawal() {
        let f = fixture(false, false);
        let job = initiated(&f).await;

        let disposition = f.worker.process(job.clone()).await;
        assert!(matches!(disposition, Disposition::Ack));

        let status = f
            .orchestrator
            .get_withdrawal_status(&job.withdrawal_id)
            .await
            .unwrap();
        assert_eq!(status.status, TransactionStatus::Confirmed);
        // Burn the gross, pay out the net.
        assert_eq!(f.bridge.burns.lock().unwrap()[0], 10_000);
        assert_eq!(f.gateway.payouts.lock().unwrap()[0].1, 9_750);
    }

    #[tokio::test]
    async fn burn_failure_retries_without_touching_the_payout() {
        let f = fixture(true, false);
        let job = initiated(&f).await;

        let disposition = f.worker.process(job.clone()).await;
        assert!(matches!(disposition, Disposition::Ack));
        assert_eq!(f.gateway.calls.load(Ordering::SeqCst), 0);

        let status = f
            .orchestrator
            .get_withdrawal_status(&job.withdrawal_id)
            .await
            .unwrap();
        assert_eq!(status.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn exhausted_burn_retries_fail_terminally() {
        let f = fixture(true, false);
        let mut job = initiated(&f).await;
        job.current_retry = 2;

        let disposition = f.worker.process(job.clone()).await;
        assert!(matches!(disposition, Disposition::DeadLetter(_)));

        let status = f
            .orchestrator
            .get_withdrawal_status(&job.withdrawal_id)
            .await
            .unwrap();
        assert_eq!(status.status, TransactionStatus::Failed);
        assert_eq!(status.blockchain_status, Some(LegStatus::Failed));
    }

    #[tokio::test]
    async fn payout_failure_after_burn_is_a_reconciliation_case() {
        let f = fixture(false, true);
        let job = initiated(&f).await;

        let disposition = f.worker.process(job.clone()).await;
        let reason = match disposition {
            Disposition::DeadLetter(reason) => reason,
            other => panic!("expected DeadLetter, got {:?}", other),
        };
        assert!(reason.contains("payout failed after settled burn"));

        // Burn stays settled, payout leg failed, row parked for an operator.
        let status = f
            .orchestrator
            .get_withdrawal_status(&job.withdrawal_id)
            .await
            .unwrap();
        assert_eq!(status.status, TransactionStatus::Failed);
        assert_eq!(status.blockchain_status, Some(LegStatus::Confirmed));
        assert_eq!(status.pix_status, LegStatus::Failed);
    }

    #[tokio::test]
    async fn redelivery_after_settled_burn_skips_straight_to_payout() {
        let f = fixture(false, true);
        let job = initiated(&f).await;

        // First delivery settles the burn, then dead-letters on payout.
        f.worker.process(job.clone()).await;
        assert_eq!(f.bridge.burns.lock().unwrap().len(), 1);

        // A redelivered job must not burn again. (The row is already
        // terminal here, so it is dropped outright.)
        let disposition = f.worker.process(job).await;
        assert!(matches!(disposition, Disposition::Ack));
        assert_eq!(f.bridge.burns.lock().unwrap().len(), 1);
    }
}
