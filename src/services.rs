use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::repositories::blockchain::EvmBridge;
use crate::repositories::pix::PixProviderApi;
use crate::repositories::taxes::PgTaxStore;
use crate::repositories::transactions::PgTransactionStore;
use crate::repositories::users::PgUserDirectory;
use crate::settings::Settings;

pub mod deposits;
pub mod fees;
pub mod http;
pub mod notifications;
pub mod queue;
pub mod withdrawals;
pub mod workers;

/// Service-level error taxonomy. Validation and state errors surface
/// synchronously to the caller; idempotent duplicates are not errors and
/// short-circuit to the stored row; provider errors feed the queue retry
/// path; exhausted retries are terminal.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("User {0} has no company association")]
    UnassociatedUser(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("State conflict on transaction {transaction_id}: {detail}")]
    StateConflict {
        transaction_id: String,
        detail: String,
    },
    #[error("External provider error: {0} => {1}")]
    ExternalProvider(String, String),
    #[error("Retries exhausted for {0}: {1}")]
    RetryExhausted(String, String),
    #[error("Repository error: {0} - {1}")]
    Repository(String, String),
    #[error("Communication error: {0} - {1}")]
    Communication(String, String),
}

#[async_trait]
pub trait RequestHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle_request(&self, request: T);
}

#[async_trait]
pub trait Service<T, H>: Send + Sync + 'static
where
    T: Send + 'static,
    H: RequestHandler<T> + Clone + Send,
{
    async fn run(&mut self, handler: H, receiver: &mut mpsc::Receiver<T>) {
        while let Some(request) = receiver.recv().await {
            let handler = handler.clone();

            tokio::spawn(async move {
                handler.handle_request(request).await;
            });
        }
    }
}

pub async fn start_services(pool: PgPool, settings: Settings) -> Result<(), anyhow::Error> {
    let store = Arc::new(PgTransactionStore::new(pool.clone()));
    let users = Arc::new(PgUserDirectory::new(pool.clone()));
    let taxes = Arc::new(PgTaxStore::new(pool));
    let fee_calculator = fees::FeeCalculator::new(taxes);

    let broker = queue::Broker::new(settings.queue.clone());
    let bridge = Arc::new(EvmBridge::new(&settings.chain)?);
    let gateway = Arc::new(PixProviderApi::new(
        settings.provider.auth_token.clone(),
        settings.provider.url.clone(),
    ));

    let deposit_orchestrator = deposits::DepositOrchestrator::new(
        store.clone(),
        users.clone(),
        fee_calculator.clone(),
        broker.clone(),
        settings.provider.clone(),
        settings.chain.network.clone(),
    );
    let withdrawal_orchestrator = withdrawals::WithdrawalOrchestrator::new(
        store,
        users,
        fee_calculator,
        broker.clone(),
        settings.chain.network.clone(),
    );

    log::info!("starting queue workers");
    let mint_worker = Arc::new(workers::mint::MintWorker::new(
        deposit_orchestrator.clone(),
        bridge.clone(),
        broker.clone(),
    ));
    mint_worker.clone().start()?;

    let withdraw_worker = Arc::new(workers::withdraw::WithdrawWorker::new(
        withdrawal_orchestrator.clone(),
        bridge,
        gateway,
        broker.clone(),
        settings.chain.network.clone(),
    ));
    withdraw_worker.clone().start()?;

    Arc::new(notifications::EmailNotifier::new(broker.clone())).start()?;
    Arc::new(notifications::WebhookNotifier::new(broker.clone())).start()?;

    log::info!("starting deposit service");
    let (deposit_tx, mut deposit_rx) = mpsc::channel(512);
    let mut deposit_service = deposits::DepositService::new();
    let deposit_handler = deposit_orchestrator.clone();
    tokio::spawn(async move {
        deposit_service.run(deposit_handler, &mut deposit_rx).await;
    });

    log::info!("starting withdrawal service");
    let (withdrawal_tx, mut withdrawal_rx) = mpsc::channel(512);
    let mut withdrawal_service = withdrawals::WithdrawalService::new();
    let withdrawal_handler = withdrawal_orchestrator.clone();
    tokio::spawn(async move {
        withdrawal_service
            .run(withdrawal_handler, &mut withdrawal_rx)
            .await;
    });

    log::info!("starting HTTP server");
    http::start_http_server(
        &settings.http.bind,
        deposit_tx,
        withdrawal_tx,
        mint_worker,
        withdraw_worker,
        broker,
    )
    .await
}
