use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::models::queue::{NotificationJob, NotificationKind, WithdrawalJob};
use crate::models::transactions::{
    BlockchainConfirmation, DepositStatus, Leg, NewTransaction, LegStatus, PixConfirmation,
    Transaction, TransactionType,
};
use crate::repositories::transactions::{SettleOutcome, TransactionStore};
use crate::repositories::users::UserDirectory;

use super::fees::FeeCalculator;
use super::queue::{
    Broker, PublishOpts, QUEUE_NOTIFICATION_EMAIL, QUEUE_NOTIFICATION_WEBHOOK,
    QUEUE_WITHDRAWAL_PROCESSING,
};
use super::{RequestHandler, Service, ServiceError};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalReceipt {
    pub withdrawal_id: String,
    pub amount_in_cents: i64,
    pub fee_in_cents: i64,
    pub net_amount_in_cents: i64,
    /// VIP gas subsidy applied to the burn, in percent.
    pub gas_subsidy_pct: i64,
}

pub enum WithdrawalRequest {
    Initiate {
        user_id: String,
        amount_in_cents: i64,
        pix_key: String,
        pix_key_type: String,
        response: oneshot::Sender<Result<WithdrawalReceipt, ServiceError>>,
    },
    Status {
        withdrawal_id: String,
        response: oneshot::Sender<Result<DepositStatus, ServiceError>>,
    },
}

/// Owns the withdrawal lifecycle: the mirror image of a deposit. The burn
/// leg is claimed at creation (blockchain first), the PIX payout follows,
/// and a payout failure after a settled burn is never retried as if the
/// burn had failed.
#[derive(Clone)]
pub struct WithdrawalOrchestrator {
    store: Arc<dyn TransactionStore>,
    users: Arc<dyn UserDirectory>,
    fees: FeeCalculator,
    broker: Arc<Broker>,
    network: String,
}

impl WithdrawalOrchestrator {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        users: Arc<dyn UserDirectory>,
        fees: FeeCalculator,
        broker: Arc<Broker>,
        network: String,
    ) -> Self {
        WithdrawalOrchestrator {
            store,
            users,
            fees,
            broker,
            network,
        }
    }

    pub async fn initiate_withdrawal(
        &self,
        user_id: &str,
        amount_in_cents: i64,
        pix_key: &str,
        pix_key_type: &str,
    ) -> Result<WithdrawalReceipt, ServiceError> {
        let repo_err =
            |e: anyhow::Error| ServiceError::Repository("WithdrawalOrchestrator".to_string(), e.to_string());

        let user = self
            .users
            .get_user(user_id)
            .await
            .map_err(repo_err)?
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", user_id)))?;
        if user.company_id.is_none() {
            return Err(ServiceError::UnassociatedUser(user_id.to_string()));
        }
        let holder_address = user.wallet_address.clone().ok_or_else(|| {
            ServiceError::Validation(format!("user {} has no wallet address", user_id))
        })?;

        let quote = self
            .fees
            .calculate_withdraw_fee(user_id, amount_in_cents)
            .await?;

        let withdrawal_id = Uuid::new_v4().hyphenated().to_string();
        let transaction = self
            .store
            .create(NewTransaction {
                id: withdrawal_id.clone(),
                user_id: user_id.to_string(),
                company_id: user.company_id.clone().unwrap_or_default(),
                transaction_type: TransactionType::Withdrawal,
                currency: "BRL".to_string(),
                amount_in_cents: quote.total_amount_in_cents,
                fee_in_cents: quote.fee_in_cents,
                net_amount_in_cents: quote.net_amount_in_cents,
                pix_key: Some(pix_key.to_string()),
                pix_key_type: Some(pix_key_type.to_string()),
                recipient_address: holder_address.clone(),
                // Burn runs first: the blockchain leg is claimed at creation.
                blockchain_status: Some(LegStatus::Pending),
                network: self.network.clone(),
            })
            .await
            .map_err(repo_err)?;

        let job = WithdrawalJob {
            withdrawal_id: transaction.id.clone(),
            user_id: user_id.to_string(),
            amount_in_cents: quote.total_amount_in_cents,
            pix_key: pix_key.to_string(),
            blockchain_address: holder_address,
            user_email: user.email,
            webhook_url: user.webhook_url,
            current_retry: 0,
        };
        self.broker
            .publish(
                QUEUE_WITHDRAWAL_PROCESSING,
                serde_json::to_value(&job).expect("withdrawal job serializes"),
                PublishOpts::default(),
            )
            .await
            .map_err(|e| {
                ServiceError::Communication(
                    "WithdrawalOrchestrator => Broker".to_string(),
                    e.to_string(),
                )
            })?;

        log::info!(
            "withdrawal {} initiated for user {}: {} cents ({} after fee)",
            transaction.id,
            user_id,
            quote.total_amount_in_cents,
            quote.net_amount_in_cents
        );

        Ok(WithdrawalReceipt {
            withdrawal_id: transaction.id,
            amount_in_cents: quote.total_amount_in_cents,
            fee_in_cents: quote.fee_in_cents,
            net_amount_in_cents: quote.net_amount_in_cents,
            gas_subsidy_pct: quote.gas_subsidy_pct,
        })
    }

    /// Burn settlement report. Leaves the overall status pending: the fiat
    /// payout has not happened yet.
    pub async fn confirm_burn(
        &self,
        withdrawal_id: &str,
        receipt: BlockchainConfirmation,
    ) -> Result<Transaction, ServiceError> {
        let outcome = self
            .store
            .confirm_blockchain(withdrawal_id, &receipt)
            .await
            .map_err(|e| {
                ServiceError::Repository("WithdrawalOrchestrator".to_string(), e.to_string())
            })?;

        match outcome {
            SettleOutcome::NotFound => {
                Err(ServiceError::NotFound(format!("withdrawal {}", withdrawal_id)))
            }
            SettleOutcome::Conflict(tx) => Err(ServiceError::StateConflict {
                transaction_id: withdrawal_id.to_string(),
                detail: format!(
                    "blockchain leg {}",
                    tx.blockchain_status.map(|s| s.as_str()).unwrap_or("unset")
                ),
            }),
            SettleOutcome::AlreadySettled(tx) => {
                log::info!("duplicate burn confirmation for {}", withdrawal_id);
                Ok(tx)
            }
            SettleOutcome::Settled(tx) => {
                log::info!("burn settled for withdrawal {}: {}", tx.id, receipt.tx_hash);
                Ok(tx)
            }
        }
    }

    /// Payout settlement report; finalizes the withdrawal and fires the
    /// single notification.
    pub async fn confirm_payout(
        &self,
        withdrawal_id: &str,
        pix: PixConfirmation,
    ) -> Result<Transaction, ServiceError> {
        let outcome = self
            .store
            .confirm_pix_payout(withdrawal_id, &pix)
            .await
            .map_err(|e| {
                ServiceError::Repository("WithdrawalOrchestrator".to_string(), e.to_string())
            })?;

        match outcome {
            SettleOutcome::NotFound => {
                Err(ServiceError::NotFound(format!("withdrawal {}", withdrawal_id)))
            }
            SettleOutcome::Conflict(tx) => Err(ServiceError::StateConflict {
                transaction_id: withdrawal_id.to_string(),
                detail: format!("pix leg {}", tx.pix_status.as_str()),
            }),
            SettleOutcome::AlreadySettled(tx) => {
                log::info!("duplicate payout confirmation for {}", withdrawal_id);
                Ok(tx)
            }
            SettleOutcome::Settled(tx) => {
                self.notify_confirmed(&tx).await;
                log::info!("withdrawal {} fully settled", tx.id);
                Ok(tx)
            }
        }
    }

    /// Burn never happened (or reverted cleanly): safe to fail terminally.
    pub async fn fail_burn(
        &self,
        withdrawal_id: &str,
        reason: &str,
    ) -> Result<Transaction, ServiceError> {
        let tx = self
            .store
            .fail_leg(withdrawal_id, Leg::Blockchain, reason)
            .await
            .map_err(|e| {
                ServiceError::Repository("WithdrawalOrchestrator".to_string(), e.to_string())
            })?
            .ok_or_else(|| ServiceError::NotFound(format!("withdrawal {}", withdrawal_id)))?;

        log::warn!("withdrawal {} burn failed terminally: {}", withdrawal_id, reason);
        Ok(tx)
    }

    /// Payout failed after the burn settled: funds are out of circulation
    /// but not paid out. This is not a retryable burn failure; it parks the
    /// row for manual reconciliation.
    pub async fn flag_reconciliation(
        &self,
        withdrawal_id: &str,
        reason: &str,
    ) -> Result<Transaction, ServiceError> {
        let tx = self
            .store
            .fail_leg(
                withdrawal_id,
                Leg::Pix,
                &format!("reconciliation required: {}", reason),
            )
            .await
            .map_err(|e| {
                ServiceError::Repository("WithdrawalOrchestrator".to_string(), e.to_string())
            })?
            .ok_or_else(|| ServiceError::NotFound(format!("withdrawal {}", withdrawal_id)))?;

        log::error!(
            "withdrawal {} needs manual reconciliation: burn settled, payout failed ({})",
            withdrawal_id,
            reason
        );
        Ok(tx)
    }

    pub async fn get_withdrawal_status(
        &self,
        withdrawal_id: &str,
    ) -> Result<DepositStatus, ServiceError> {
        let tx = self
            .store
            .find(withdrawal_id)
            .await
            .map_err(|e| {
                ServiceError::Repository("WithdrawalOrchestrator".to_string(), e.to_string())
            })?
            .ok_or_else(|| ServiceError::NotFound(format!("withdrawal {}", withdrawal_id)))?;

        Ok(DepositStatus::from(&tx))
    }

    async fn notify_confirmed(&self, tx: &Transaction) {
        let (email, webhook_url) = match self.users.get_user(&tx.user_id).await {
            Ok(Some(user)) => (user.email, user.webhook_url),
            _ => (None, None),
        };
        let body = json!({
            "amountInCents": tx.net_amount_in_cents,
            "pixKey": tx.pix_key,
        });

        self.publish_notification(
            QUEUE_NOTIFICATION_EMAIL,
            NotificationJob {
                kind: NotificationKind::Email,
                user_id: tx.user_id.clone(),
                transaction_id: tx.id.clone(),
                subject: "withdrawal-confirmed".to_string(),
                body: body.clone(),
                target: email,
                current_retry: 0,
            },
        )
        .await;

        if webhook_url.is_some() {
            self.publish_notification(
                QUEUE_NOTIFICATION_WEBHOOK,
                NotificationJob {
                    kind: NotificationKind::Webhook,
                    user_id: tx.user_id.clone(),
                    transaction_id: tx.id.clone(),
                    subject: "withdrawal-confirmed".to_string(),
                    body,
                    target: webhook_url,
                    current_retry: 0,
                },
            )
            .await;
        }
    }

    // Notifications are best-effort; settlement already committed.
    async fn publish_notification(&self, queue: &str, job: NotificationJob) {
        if let Err(e) = self
            .broker
            .publish(
                queue,
                serde_json::to_value(&job).expect("notification job serializes"),
                PublishOpts::default(),
            )
            .await
        {
            log::error!(
                "could not publish notification for {}: {}",
                job.transaction_id,
                e
            );
        }
    }
}

#[async_trait]
impl RequestHandler<WithdrawalRequest> for WithdrawalOrchestrator {
    async fn handle_request(&self, request: WithdrawalRequest) {
        match request {
            WithdrawalRequest::Initiate {
                user_id,
                amount_in_cents,
                pix_key,
                pix_key_type,
                response,
            } => {
                let result = self
                    .initiate_withdrawal(&user_id, amount_in_cents, &pix_key, &pix_key_type)
                    .await;
                let _ = response.send(result);
            }
            WithdrawalRequest::Status {
                withdrawal_id,
                response,
            } => {
                let result = self.get_withdrawal_status(&withdrawal_id).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct WithdrawalService;

impl WithdrawalService {
    pub fn new() -> Self {
        WithdrawalService {}
    }
}

#[async_trait]
impl Service<WithdrawalRequest, WithdrawalOrchestrator> for WithdrawalService {}

#[cfg(test)]
mod tests {
    use crate::models::transactions::TransactionStatus;
    use crate::repositories::taxes::MemoryTaxStore;
    use crate::repositories::transactions::MemoryTransactionStore;
    use crate::repositories::users::{MemoryUserDirectory, UserAccount};
    use crate::services::deposits::tests::{capture_queue, drain, test_broker};

    use super::*;

    fn orchestrator() -> (WithdrawalOrchestrator, Arc<Broker>) {
        let store = Arc::new(MemoryTransactionStore::new());
        let users = Arc::new(MemoryUserDirectory::new());
        users.insert(UserAccount {
            id: "user-1".to_string(),
            company_id: Some("company-1".to_string()),
            wallet_address: Some("0x00000000000000000000000000000000000000aa".to_string()),
            email: Some("user@example.com".to_string()),
            webhook_url: Some("https://partner.example/hooks/user-1".to_string()),
        });

        let broker = test_broker();
        let fees = FeeCalculator::new(Arc::new(MemoryTaxStore::new()));
        let orch = WithdrawalOrchestrator::new(
            store,
            users,
            fees,
            broker.clone(),
            "polygon".to_string(),
        );
        (orch, broker)
    }

    fn burn_receipt() -> BlockchainConfirmation {
        BlockchainConfirmation {
            tx_hash: "0xburn".to_string(),
            block_number: 9,
            gas_used: 30000,
        }
    }

    #[tokio::test]
    async fn initiation_publishes_one_job_and_claims_the_burn_leg() {
        let (orch, broker) = orchestrator();
        let mut jobs = capture_queue(&broker, QUEUE_WITHDRAWAL_PROCESSING);

        let receipt = orch
            .initiate_withdrawal("user-1", 10_000, "payee@pix.example", "email")
            .await
            .unwrap();
        assert_eq!(receipt.net_amount_in_cents, 9_750);
        // Tier 0 gets no gas subsidy.
        assert_eq!(receipt.gas_subsidy_pct, 0);

        let published = drain(&mut jobs).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["withdrawalId"], receipt.withdrawal_id.as_str());

        let status = orch.get_withdrawal_status(&receipt.withdrawal_id).await.unwrap();
        assert_eq!(status.blockchain_status, Some(LegStatus::Pending));
    }

    #[tokio::test]
    async fn burn_then_payout_settles_in_order() {
        let (orch, _) = orchestrator();
        let receipt = orch
            .initiate_withdrawal("user-1", 10_000, "payee@pix.example", "email")
            .await
            .unwrap();

        let tx = orch
            .confirm_burn(&receipt.withdrawal_id, burn_receipt())
            .await
            .unwrap();
        // Burn alone never finalizes the withdrawal.
        assert_eq!(tx.status, TransactionStatus::Pending);

        let tx = orch
            .confirm_payout(
                &receipt.withdrawal_id,
                PixConfirmation {
                    pix_transaction_id: "payout-1".to_string(),
                    payer_document: None,
                    payer_name: None,
                    paid_amount_in_cents: Some(9_750),
                },
            )
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Confirmed);
    }

    #[tokio::test]
    async fn settled_withdrawal_publishes_the_partner_webhook() {
        let (orch, broker) = orchestrator();
        let mut webhooks = capture_queue(&broker, QUEUE_NOTIFICATION_WEBHOOK);

        let receipt = orch
            .initiate_withdrawal("user-1", 10_000, "payee@pix.example", "email")
            .await
            .unwrap();
        orch.confirm_burn(&receipt.withdrawal_id, burn_receipt())
            .await
            .unwrap();
        orch.confirm_payout(
            &receipt.withdrawal_id,
            PixConfirmation {
                pix_transaction_id: "payout-1".to_string(),
                payer_document: None,
                payer_name: None,
                paid_amount_in_cents: Some(9_750),
            },
        )
        .await
        .unwrap();

        let jobs = drain(&mut webhooks).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["kind"], "webhook");
        assert_eq!(jobs[0]["target"], "https://partner.example/hooks/user-1");
    }

    #[tokio::test]
    async fn payout_failure_after_burn_flags_reconciliation() {
        let (orch, _) = orchestrator();
        let receipt = orch
            .initiate_withdrawal("user-1", 10_000, "payee@pix.example", "email")
            .await
            .unwrap();
        orch.confirm_burn(&receipt.withdrawal_id, burn_receipt())
            .await
            .unwrap();

        let tx = orch
            .flag_reconciliation(&receipt.withdrawal_id, "provider rejected the payout")
            .await
            .unwrap();

        assert_eq!(tx.status, TransactionStatus::Failed);
        // The burn leg stays confirmed: funds left circulation.
        assert_eq!(tx.blockchain_status, Some(LegStatus::Confirmed));
        let failures = tx.metadata["failures"].as_array().unwrap();
        assert!(failures[0]["reason"]
            .as_str()
            .unwrap()
            .starts_with("reconciliation required"));
    }

    #[tokio::test]
    async fn burn_failure_aborts_cleanly() {
        let (orch, _) = orchestrator();
        let receipt = orch
            .initiate_withdrawal("user-1", 10_000, "payee@pix.example", "email")
            .await
            .unwrap();

        let tx = orch
            .fail_burn(&receipt.withdrawal_id, "insufficient balance to burn")
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.blockchain_status, Some(LegStatus::Failed));
        // No funds moved: the pix leg was never started.
        assert_eq!(tx.pix_confirmed_at, None);
    }
}
