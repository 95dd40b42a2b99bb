use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::models::pix::PixPaymentInfo;
use crate::models::queue::{MintJob, NotificationJob, NotificationKind};
use crate::models::transactions::{
    BlockchainConfirmation, DepositStatus, Leg, LegStatus, NewTransaction, PixConfirmation,
    Transaction, TransactionType,
};
use crate::repositories::pix::payment_descriptor;
use crate::repositories::transactions::{ClaimOutcome, SettleOutcome, TransactionStore};
use crate::repositories::users::{UserAccount, UserDirectory};
use crate::settings::PixProvider;

use super::fees::FeeCalculator;
use super::queue::{
    Broker, PublishOpts, QUEUE_BLOCKCHAIN_MINT, QUEUE_NOTIFICATION_EMAIL,
    QUEUE_NOTIFICATION_WEBHOOK,
};
use super::{RequestHandler, Service, ServiceError};

// First-deposit ramp and daily cap, in cents.
const FIRST_DEPOSIT_CAPS: [i64; 3] = [250 * 100, 750 * 100, 1500 * 100];
const DAILY_DEPOSIT_CAP: i64 = 5000 * 100;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositReceipt {
    pub transaction_id: String,
    pub total_amount_in_cents: i64,
    pub net_amount_in_cents: i64,
    pub fee_in_cents: i64,
    /// VIP gas subsidy applied to the mint, in percent.
    pub gas_subsidy_pct: i64,
    pub pix_payment_info: PixPaymentInfo,
}

pub enum DepositRequest {
    Initiate {
        user_id: String,
        amount_in_cents: i64,
        response: oneshot::Sender<Result<DepositReceipt, ServiceError>>,
    },
    ConfirmPix {
        transaction_id: String,
        pix: PixConfirmation,
        response: oneshot::Sender<Result<Transaction, ServiceError>>,
    },
    FailPix {
        transaction_id: String,
        reason: String,
        response: oneshot::Sender<Result<Transaction, ServiceError>>,
    },
    Status {
        transaction_id: String,
        response: oneshot::Sender<Result<DepositStatus, ServiceError>>,
    },
}

/// Owns the deposit lifecycle. All coordination goes through the
/// transaction row: the store's conditional transitions decide every race,
/// so any number of orchestrator instances (or duplicate webhooks) behave
/// identically.
#[derive(Clone)]
pub struct DepositOrchestrator {
    store: Arc<dyn TransactionStore>,
    users: Arc<dyn UserDirectory>,
    fees: FeeCalculator,
    broker: Arc<Broker>,
    provider: PixProvider,
    network: String,
}

impl DepositOrchestrator {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        users: Arc<dyn UserDirectory>,
        fees: FeeCalculator,
        broker: Arc<Broker>,
        provider: PixProvider,
        network: String,
    ) -> Self {
        DepositOrchestrator {
            store,
            users,
            fees,
            broker,
            provider,
            network,
        }
    }

    async fn resolve_user(&self, user_id: &str) -> Result<UserAccount, ServiceError> {
        let user = self
            .users
            .get_user(user_id)
            .await
            .map_err(|e| ServiceError::Repository("DepositOrchestrator".to_string(), e.to_string()))?
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", user_id)))?;

        if user.company_id.is_none() {
            return Err(ServiceError::UnassociatedUser(user_id.to_string()));
        }

        Ok(user)
    }

    async fn check_deposit_limits(
        &self,
        user_id: &str,
        amount_in_cents: i64,
    ) -> Result<(), ServiceError> {
        let repo_err =
            |e: anyhow::Error| ServiceError::Repository("DepositOrchestrator".to_string(), e.to_string());

        let count = self
            .store
            .confirmed_deposit_count(user_id)
            .await
            .map_err(repo_err)?;
        if let Some(cap) = FIRST_DEPOSIT_CAPS.get(count as usize) {
            if amount_in_cents > *cap {
                return Err(ServiceError::Validation(format!(
                    "amount exceeds the cap of {} cents for deposit #{}",
                    cap,
                    count + 1
                )));
            }
        }

        let spent_today = self
            .store
            .daily_deposit_spending(user_id)
            .await
            .map_err(repo_err)?;
        if spent_today + amount_in_cents > DAILY_DEPOSIT_CAP {
            return Err(ServiceError::Validation(format!(
                "amount exceeds the daily cap of {} cents",
                DAILY_DEPOSIT_CAP
            )));
        }

        Ok(())
    }

    pub async fn initiate_deposit(
        &self,
        user_id: &str,
        amount_in_cents: i64,
    ) -> Result<DepositReceipt, ServiceError> {
        let user = self.resolve_user(user_id).await?;
        let recipient_address = user.wallet_address.clone().ok_or_else(|| {
            ServiceError::Validation(format!("user {} has no wallet address", user_id))
        })?;

        let quote = self
            .fees
            .calculate_deposit_fee(user_id, amount_in_cents)
            .await?;
        self.check_deposit_limits(user_id, quote.total_amount_in_cents)
            .await?;

        let transaction_id = Uuid::new_v4().hyphenated().to_string();
        let transaction = self
            .store
            .create(NewTransaction {
                id: transaction_id.clone(),
                user_id: user_id.to_string(),
                company_id: user.company_id.unwrap_or_default(),
                transaction_type: TransactionType::Deposit,
                currency: "BRL".to_string(),
                amount_in_cents: quote.total_amount_in_cents,
                fee_in_cents: quote.fee_in_cents,
                net_amount_in_cents: quote.net_amount_in_cents,
                pix_key: Some(self.provider.receiving_key.clone()),
                pix_key_type: Some(self.provider.receiving_key_type.clone()),
                recipient_address,
                network: self.network.clone(),
                blockchain_status: None,
            })
            .await
            .map_err(|e| ServiceError::Repository("DepositOrchestrator".to_string(), e.to_string()))?;

        let pix_payment_info = payment_descriptor(
            &transaction.id,
            transaction.amount_in_cents,
            &self.provider.receiving_key,
            &self.provider.receiving_key_type,
        );

        log::info!(
            "deposit {} initiated for user {}: {} cents (+{} fee)",
            transaction.id,
            user_id,
            quote.net_amount_in_cents,
            quote.fee_in_cents
        );

        Ok(DepositReceipt {
            transaction_id: transaction.id,
            total_amount_in_cents: quote.total_amount_in_cents,
            net_amount_in_cents: quote.net_amount_in_cents,
            fee_in_cents: quote.fee_in_cents,
            gas_subsidy_pct: quote.gas_subsidy_pct,
            pix_payment_info,
        })
    }

    /// PIX settlement webhook entry point. Under any number of concurrent
    /// or duplicate invocations for the same transaction, exactly one mint
    /// job is ever published: only the caller whose store transition wins
    /// gets to publish.
    pub async fn confirm_pix_deposit(
        &self,
        transaction_id: &str,
        pix: PixConfirmation,
    ) -> Result<Transaction, ServiceError> {
        let outcome = self
            .store
            .confirm_pix_and_claim_mint(transaction_id, &pix)
            .await
            .map_err(|e| ServiceError::Repository("DepositOrchestrator".to_string(), e.to_string()))?;

        match outcome {
            ClaimOutcome::NotFound => {
                Err(ServiceError::NotFound(format!("transaction {}", transaction_id)))
            }
            ClaimOutcome::Conflict(tx) => Err(ServiceError::StateConflict {
                transaction_id: transaction_id.to_string(),
                detail: format!("pix leg is {}", tx.pix_status.as_str()),
            }),
            ClaimOutcome::AlreadyClaimed(tx) => {
                // Duplicate webhook: the audit trail got the payload, no
                // second job.
                log::info!(
                    "duplicate pix confirmation for {}, blockchain leg already {}",
                    transaction_id,
                    tx.blockchain_status.map(|s| s.as_str()).unwrap_or("unset")
                );
                Ok(tx)
            }
            ClaimOutcome::Claimed(tx) => {
                let job = MintJob {
                    transaction_id: tx.id.clone(),
                    user_id: tx.user_id.clone(),
                    recipient_address: tx.recipient_address.clone(),
                    amount_in_cents: tx.net_amount_in_cents,
                    network: tx.network.clone(),
                    current_retry: 0,
                };
                self.broker
                    .publish(
                        QUEUE_BLOCKCHAIN_MINT,
                        serde_json::to_value(&job).expect("mint job serializes"),
                        PublishOpts::default(),
                    )
                    .await
                    .map_err(|e| {
                        ServiceError::Communication(
                            "DepositOrchestrator => Broker".to_string(),
                            e.to_string(),
                        )
                    })?;

                log::info!("pix confirmed for {}, mint job published", tx.id);
                Ok(tx)
            }
        }
    }

    /// Mint settlement report from the worker. Duplicate redeliveries
    /// short-circuit on the stored row and never re-fire the notification.
    pub async fn confirm_blockchain_mint(
        &self,
        transaction_id: &str,
        receipt: BlockchainConfirmation,
    ) -> Result<Transaction, ServiceError> {
        let outcome = self
            .store
            .confirm_blockchain(transaction_id, &receipt)
            .await
            .map_err(|e| ServiceError::Repository("DepositOrchestrator".to_string(), e.to_string()))?;

        match outcome {
            SettleOutcome::NotFound => {
                Err(ServiceError::NotFound(format!("transaction {}", transaction_id)))
            }
            SettleOutcome::Conflict(tx) => Err(ServiceError::StateConflict {
                transaction_id: transaction_id.to_string(),
                detail: format!(
                    "pix leg {} / blockchain leg {}",
                    tx.pix_status.as_str(),
                    tx.blockchain_status.map(|s| s.as_str()).unwrap_or("unset")
                ),
            }),
            SettleOutcome::AlreadySettled(tx) => {
                log::info!(
                    "duplicate mint confirmation for {}, keeping {}",
                    transaction_id,
                    tx.tx_hash.as_deref().unwrap_or("?")
                );
                Ok(tx)
            }
            SettleOutcome::Settled(tx) => {
                self.notify_confirmed(&tx).await;
                log::info!(
                    "deposit {} confirmed on-chain: {} (block {})",
                    tx.id,
                    receipt.tx_hash,
                    receipt.block_number
                );
                Ok(tx)
            }
        }
    }

    pub async fn fail_pix_deposit(
        &self,
        transaction_id: &str,
        reason: &str,
    ) -> Result<Transaction, ServiceError> {
        self.fail_leg(transaction_id, Leg::Pix, reason).await
    }

    pub async fn fail_blockchain_mint(
        &self,
        transaction_id: &str,
        reason: &str,
    ) -> Result<Transaction, ServiceError> {
        self.fail_leg(transaction_id, Leg::Blockchain, reason).await
    }

    async fn fail_leg(
        &self,
        transaction_id: &str,
        leg: Leg,
        reason: &str,
    ) -> Result<Transaction, ServiceError> {
        let tx = self
            .store
            .fail_leg(transaction_id, leg, reason)
            .await
            .map_err(|e| ServiceError::Repository("DepositOrchestrator".to_string(), e.to_string()))?
            .ok_or_else(|| ServiceError::NotFound(format!("transaction {}", transaction_id)))?;

        log::warn!("transaction {} marked failed: {}", transaction_id, reason);
        Ok(tx)
    }

    pub async fn get_deposit_status(
        &self,
        transaction_id: &str,
    ) -> Result<DepositStatus, ServiceError> {
        let tx = self
            .store
            .find(transaction_id)
            .await
            .map_err(|e| ServiceError::Repository("DepositOrchestrator".to_string(), e.to_string()))?
            .ok_or_else(|| ServiceError::NotFound(format!("transaction {}", transaction_id)))?;

        Ok(DepositStatus::from(&tx))
    }

    async fn notify_confirmed(&self, tx: &Transaction) {
        let (email, webhook_url) = match self.users.get_user(&tx.user_id).await {
            Ok(Some(user)) => (user.email, user.webhook_url),
            _ => (None, None),
        };
        let body = json!({
            "amountInCents": tx.net_amount_in_cents,
            "txHash": tx.tx_hash,
        });

        self.publish_notification(
            QUEUE_NOTIFICATION_EMAIL,
            NotificationJob {
                kind: NotificationKind::Email,
                user_id: tx.user_id.clone(),
                transaction_id: tx.id.clone(),
                subject: "deposit-confirmed".to_string(),
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
                    subject: "deposit-confirmed".to_string(),
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
impl RequestHandler<DepositRequest> for DepositOrchestrator {
    async fn handle_request(&self, request: DepositRequest) {
        match request {
            DepositRequest::Initiate {
                user_id,
                amount_in_cents,
                response,
            } => {
                let result = self.initiate_deposit(&user_id, amount_in_cents).await;
                let _ = response.send(result);
            }
            DepositRequest::ConfirmPix {
                transaction_id,
                pix,
                response,
            } => {
                let result = self.confirm_pix_deposit(&transaction_id, pix).await;
                let _ = response.send(result);
            }
            DepositRequest::FailPix {
                transaction_id,
                reason,
                response,
            } => {
                let result = self.fail_pix_deposit(&transaction_id, &reason).await;
                let _ = response.send(result);
            }
            DepositRequest::Status {
                transaction_id,
                response,
            } => {
                let result = self.get_deposit_status(&transaction_id).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct DepositService;

impl DepositService {
    pub fn new() -> Self {
        DepositService {}
    }
}

#[async_trait]
impl Service<DepositRequest, DepositOrchestrator> for DepositService {}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::sleep;

    use crate::models::taxes::UserTaxes;
    use crate::models::transactions::TransactionStatus;
    use crate::repositories::taxes::{MemoryTaxStore, TaxStore};
    use crate::repositories::transactions::MemoryTransactionStore;
    use crate::repositories::users::MemoryUserDirectory;
    use crate::services::queue::{Consumer, ConsumeOpts, Delivery, Disposition};
    use crate::settings::Queue as QueueSettings;

    use super::*;

    pub(crate) fn test_provider() -> PixProvider {
        PixProvider {
            url: "http://provider.test".to_string(),
            auth_token: "token".to_string(),
            receiving_key: "pix@bridge.example".to_string(),
            receiving_key_type: "email".to_string(),
        }
    }

    pub(crate) fn test_broker() -> Arc<Broker> {
        Broker::new(QueueSettings {
            max_retries: 3,
            retry_delay_secs: 0,
            publish_attempts: 2,
            publish_retry_delay_secs: 0,
            prefetch: 1,
        })
    }

    /// Captures every delivery on a queue so tests can count published jobs.
    pub(crate) struct Capture {
        tx: mpsc::UnboundedSender<serde_json::Value>,
    }

    #[async_trait]
    impl Consumer for Capture {
        async fn handle(&self, delivery: Delivery) -> Disposition {
            let _ = self.tx.send(delivery.payload);
            Disposition::Ack
        }
    }

    pub(crate) fn capture_queue(
        broker: &Arc<Broker>,
        queue: &str,
    ) -> mpsc::UnboundedReceiver<serde_json::Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        broker
            .consume(queue, Arc::new(Capture { tx }), ConsumeOpts { prefetch: 1 })
            .unwrap();
        rx
    }

    pub(crate) async fn drain(
        rx: &mut mpsc::UnboundedReceiver<serde_json::Value>,
    ) -> Vec<serde_json::Value> {
        // Consumer loops run on separate tasks; give them a beat.
        sleep(Duration::from_millis(50)).await;
        let mut out = Vec::new();
        while let Ok(v) = rx.try_recv() {
            out.push(v);
        }
        out
    }

    fn orchestrator() -> (DepositOrchestrator, Arc<Broker>, Arc<MemoryUserDirectory>) {
        let store = Arc::new(MemoryTransactionStore::new());
        let users = Arc::new(MemoryUserDirectory::new());
        users.insert(UserAccount {
            id: "user-1".to_string(),
            company_id: Some("company-1".to_string()),
            wallet_address: Some("0x00000000000000000000000000000000000000aa".to_string()),
            email: Some("user@example.com".to_string()),
            webhook_url: Some("https://partner.example/hooks/user-1".to_string()),
        });
        users.insert(UserAccount {
            id: "loner".to_string(),
            company_id: None,
            wallet_address: Some("0x00000000000000000000000000000000000000bb".to_string()),
            email: None,
            webhook_url: None,
        });

        let broker = test_broker();
        let fees = FeeCalculator::new(Arc::new(MemoryTaxStore::new()));
        let orchestrator = DepositOrchestrator::new(
            store,
            users.clone(),
            fees,
            broker.clone(),
            test_provider(),
            "polygon".to_string(),
        );
        (orchestrator, broker, users)
    }

    fn pix(pix_id: &str) -> PixConfirmation {
        PixConfirmation {
            pix_transaction_id: pix_id.to_string(),
            payer_document: Some("12345678900".to_string()),
            payer_name: Some("Payer".to_string()),
            paid_amount_in_cents: None,
        }
    }

    #[tokio::test]
    async fn full_deposit_flow_confirms_both_legs() {
        let (orch, broker, _) = orchestrator();
        let mut mint_jobs = capture_queue(&broker, QUEUE_BLOCKCHAIN_MINT);

        let receipt = orch.initiate_deposit("user-1", 10_000).await.unwrap();
        assert_eq!(receipt.net_amount_in_cents, 10_000);
        assert_eq!(
            receipt.total_amount_in_cents,
            10_000 + receipt.fee_in_cents
        );
        assert!(receipt.pix_payment_info.qr_copy_paste.contains("br.gov.bcb.pix"));

        orch.confirm_pix_deposit(&receipt.transaction_id, pix("e2e-1"))
            .await
            .unwrap();

        let jobs = drain(&mut mint_jobs).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["transactionId"], receipt.transaction_id.as_str());
        assert_eq!(jobs[0]["amountInCents"], 10_000);

        orch.confirm_blockchain_mint(
            &receipt.transaction_id,
            BlockchainConfirmation {
                tx_hash: "0xabc".to_string(),
                block_number: 1,
                gas_used: 21000,
            },
        )
        .await
        .unwrap();

        let status = orch.get_deposit_status(&receipt.transaction_id).await.unwrap();
        assert_eq!(status.status, TransactionStatus::Confirmed);
        assert_eq!(status.pix_status, LegStatus::Confirmed);
        assert_eq!(status.blockchain_status, Some(LegStatus::Confirmed));
        assert_eq!(status.blockchain_tx_hash.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn confirm_pix_on_unknown_id_is_not_found() {
        let (orch, _, _) = orchestrator();
        assert!(matches!(
            orch.confirm_pix_deposit("missing", pix("e2e-1")).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_pix_webhook_publishes_no_second_job() {
        let (orch, broker, _) = orchestrator();
        let mut mint_jobs = capture_queue(&broker, QUEUE_BLOCKCHAIN_MINT);

        let receipt = orch.initiate_deposit("user-1", 10_000).await.unwrap();
        orch.confirm_pix_deposit(&receipt.transaction_id, pix("e2e-1"))
            .await
            .unwrap();
        let tx = orch
            .confirm_pix_deposit(&receipt.transaction_id, pix("e2e-dup"))
            .await
            .unwrap();

        // Audit kept the first provider id, and only one job went out.
        assert_eq!(tx.pix_transaction_id.as_deref(), Some("e2e-1"));
        assert_eq!(drain(&mut mint_jobs).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pix_confirmations_publish_exactly_one_job() {
        let (orch, broker, _) = orchestrator();
        let mut mint_jobs = capture_queue(&broker, QUEUE_BLOCKCHAIN_MINT);

        let receipt = orch.initiate_deposit("user-1", 10_000).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..12 {
            let orch = orch.clone();
            let id = receipt.transaction_id.clone();
            handles.push(tokio::spawn(async move {
                orch.confirm_pix_deposit(&id, pix(&format!("e2e-{}", i))).await
            }));
        }
        for handle in handles {
            // Winner and duplicates both return Ok.
            handle.await.unwrap().unwrap();
        }

        assert_eq!(drain(&mut mint_jobs).await.len(), 1);
    }

    #[tokio::test]
    async fn mint_confirmation_before_pix_is_a_state_conflict() {
        let (orch, _, _) = orchestrator();
        let receipt = orch.initiate_deposit("user-1", 10_000).await.unwrap();

        let result = orch
            .confirm_blockchain_mint(
                &receipt.transaction_id,
                BlockchainConfirmation {
                    tx_hash: "0xabc".to_string(),
                    block_number: 1,
                    gas_used: 21000,
                },
            )
            .await;
        assert!(matches!(result, Err(ServiceError::StateConflict { .. })));
    }

    #[tokio::test]
    async fn duplicate_mint_confirmations_fire_one_notification() {
        let (orch, broker, _) = orchestrator();
        let mut notifications = capture_queue(&broker, QUEUE_NOTIFICATION_EMAIL);

        let receipt = orch.initiate_deposit("user-1", 10_000).await.unwrap();
        orch.confirm_pix_deposit(&receipt.transaction_id, pix("e2e-1"))
            .await
            .unwrap();

        let first = BlockchainConfirmation {
            tx_hash: "0xabc".to_string(),
            block_number: 1,
            gas_used: 21000,
        };
        let second = BlockchainConfirmation {
            tx_hash: "0xdef".to_string(),
            block_number: 2,
            gas_used: 21000,
        };
        orch.confirm_blockchain_mint(&receipt.transaction_id, first)
            .await
            .unwrap();
        let tx = orch
            .confirm_blockchain_mint(&receipt.transaction_id, second)
            .await
            .unwrap();

        // The first receipt sticks, and exactly one notification went out.
        assert_eq!(tx.tx_hash.as_deref(), Some("0xabc"));
        assert_eq!(drain(&mut notifications).await.len(), 1);
    }

    #[tokio::test]
    async fn confirmed_deposit_publishes_one_partner_webhook() {
        let (orch, broker, _) = orchestrator();
        let mut webhooks = capture_queue(&broker, QUEUE_NOTIFICATION_WEBHOOK);

        let receipt = orch.initiate_deposit("user-1", 10_000).await.unwrap();
        orch.confirm_pix_deposit(&receipt.transaction_id, pix("e2e-1"))
            .await
            .unwrap();
        let confirmation = BlockchainConfirmation {
            tx_hash: "0xabc".to_string(),
            block_number: 1,
            gas_used: 21000,
        };
        orch.confirm_blockchain_mint(&receipt.transaction_id, confirmation.clone())
            .await
            .unwrap();
        orch.confirm_blockchain_mint(&receipt.transaction_id, confirmation)
            .await
            .unwrap();

        let jobs = drain(&mut webhooks).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["kind"], "webhook");
        assert_eq!(jobs[0]["target"], "https://partner.example/hooks/user-1");
        assert_eq!(jobs[0]["transactionId"], receipt.transaction_id.as_str());
    }

    #[tokio::test]
    async fn receipt_carries_the_vip_gas_subsidy() {
        let store = Arc::new(MemoryTransactionStore::new());
        let users = Arc::new(MemoryUserDirectory::new());
        users.insert(UserAccount {
            id: "vip".to_string(),
            company_id: Some("company-1".to_string()),
            wallet_address: Some("0x00000000000000000000000000000000000000cc".to_string()),
            email: None,
            webhook_url: None,
        });
        let taxes = Arc::new(MemoryTaxStore::new());
        taxes
            .upsert(UserTaxes {
                vip_level: 5,
                ..UserTaxes::defaults_for("vip", chrono::Utc::now())
            })
            .await
            .unwrap();

        let orch = DepositOrchestrator::new(
            store,
            users,
            FeeCalculator::new(taxes),
            test_broker(),
            test_provider(),
            "polygon".to_string(),
        );

        let receipt = orch.initiate_deposit("vip", 10_000).await.unwrap();
        assert_eq!(receipt.gas_subsidy_pct, 100);
        // Tier 5 scales the flat deposit fee to 30%.
        assert_eq!(receipt.fee_in_cents, 60);
    }

    #[tokio::test]
    async fn user_without_company_cannot_deposit() {
        let (orch, _, _) = orchestrator();
        assert!(matches!(
            orch.initiate_deposit("loner", 10_000).await,
            Err(ServiceError::UnassociatedUser(_))
        ));
    }

    #[tokio::test]
    async fn failed_pix_leg_is_terminal() {
        let (orch, _, _) = orchestrator();
        let receipt = orch.initiate_deposit("user-1", 10_000).await.unwrap();

        orch.fail_pix_deposit(&receipt.transaction_id, "provider expired the charge")
            .await
            .unwrap();

        let status = orch.get_deposit_status(&receipt.transaction_id).await.unwrap();
        assert_eq!(status.status, TransactionStatus::Failed);

        // A late webhook no longer confirms anything.
        assert!(matches!(
            orch.confirm_pix_deposit(&receipt.transaction_id, pix("late")).await,
            Err(ServiceError::StateConflict { .. })
        ));
    }
}
