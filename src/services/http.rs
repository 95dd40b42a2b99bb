use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;

use crate::models::pix::PixWebhook;
use crate::models::transactions::PixConfirmation;

use super::deposits::DepositRequest;
use super::queue::Broker;
use super::withdrawals::WithdrawalRequest;
use super::workers::mint::MintWorker;
use super::workers::withdraw::WithdrawWorker;
use super::workers::WorkerStatus;
use super::ServiceError;

// Provider statuses that settle a charge, and those that kill it.
const SETTLED_STATUSES: [&str; 3] = ["paid", "confirmed", "completed"];
const FAILED_STATUSES: [&str; 4] = ["expired", "failed", "cancelled", "refunded"];

#[derive(Clone)]
struct AppState {
    deposit_channel: mpsc::Sender<DepositRequest>,
    withdrawal_channel: mpsc::Sender<WithdrawalRequest>,
    mint_worker: Arc<MintWorker>,
    withdraw_worker: Arc<WithdrawWorker>,
    broker: Arc<Broker>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewDepositRequest {
    user_id: String,
    amount_in_cents: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewWithdrawalRequest {
    user_id: String,
    amount_in_cents: i64,
    pix_key: String,
    pix_key_type: String,
}

fn error_response(error: &ServiceError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match error {
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::UnassociatedUser(_) => StatusCode::FORBIDDEN,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::StateConflict { .. } => StatusCode::CONFLICT,
        ServiceError::ExternalProvider(_, _) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"description": error.to_string()})))
}

fn channel_down(detail: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"description": format!("Failed to process request: {}", detail)})),
    )
}

async fn request_new_deposit(
    State(state): State<AppState>,
    Json(req): Json<NewDepositRequest>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();

    let sent = state
        .deposit_channel
        .send(DepositRequest::Initiate {
            user_id: req.user_id,
            amount_in_cents: req.amount_in_cents,
            response: tx,
        })
        .await;
    if let Err(e) = sent {
        return channel_down(e);
    }

    match rx.await {
        Ok(Ok(receipt)) => (StatusCode::CREATED, Json(json!(receipt))),
        Ok(Err(service_error)) => error_response(&service_error),
        Err(e) => channel_down(e),
    }
}

async fn get_deposit_status(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();

    let sent = state
        .deposit_channel
        .send(DepositRequest::Status {
            transaction_id,
            response: tx,
        })
        .await;
    if let Err(e) = sent {
        return channel_down(e);
    }

    match rx.await {
        Ok(Ok(status)) => (StatusCode::OK, Json(json!(status))),
        Ok(Err(service_error)) => error_response(&service_error),
        Err(e) => channel_down(e),
    }
}

async fn request_new_withdrawal(
    State(state): State<AppState>,
    Json(req): Json<NewWithdrawalRequest>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();

    let sent = state
        .withdrawal_channel
        .send(WithdrawalRequest::Initiate {
            user_id: req.user_id,
            amount_in_cents: req.amount_in_cents,
            pix_key: req.pix_key,
            pix_key_type: req.pix_key_type,
            response: tx,
        })
        .await;
    if let Err(e) = sent {
        return channel_down(e);
    }

    match rx.await {
        Ok(Ok(receipt)) => (StatusCode::CREATED, Json(json!(receipt))),
        Ok(Err(service_error)) => error_response(&service_error),
        Err(e) => channel_down(e),
    }
}

async fn get_withdrawal_status(
    State(state): State<AppState>,
    Path(withdrawal_id): Path<String>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();

    let sent = state
        .withdrawal_channel
        .send(WithdrawalRequest::Status {
            withdrawal_id,
            response: tx,
        })
        .await;
    if let Err(e) = sent {
        return channel_down(e);
    }

    match rx.await {
        Ok(Ok(status)) => (StatusCode::OK, Json(json!(status))),
        Ok(Err(service_error)) => error_response(&service_error),
        Err(e) => channel_down(e),
    }
}

/// PIX provider webhook. Delivery is at-least-once: duplicates and
/// post-terminal redeliveries are acknowledged with 200 so the provider
/// stops resending, and the row decides what actually changes.
async fn pix_webhook(
    State(state): State<AppState>,
    Json(webhook): Json<PixWebhook>,
) -> impl IntoResponse {
    let status = webhook.status.to_lowercase();
    let (tx, rx) = oneshot::channel();

    let request = if SETTLED_STATUSES.contains(&status.as_str()) {
        DepositRequest::ConfirmPix {
            transaction_id: webhook.transaction_id.clone(),
            pix: PixConfirmation {
                pix_transaction_id: webhook.pix_id,
                payer_document: webhook.payer_document,
                payer_name: webhook.payer_name,
                paid_amount_in_cents: webhook.paid_amount,
            },
            response: tx,
        }
    } else if FAILED_STATUSES.contains(&status.as_str()) {
        DepositRequest::FailPix {
            transaction_id: webhook.transaction_id.clone(),
            reason: format!("provider reported {}", status),
            response: tx,
        }
    } else {
        log::info!(
            "ignoring webhook status '{}' for {}",
            status,
            webhook.transaction_id
        );
        return (StatusCode::OK, Json(json!({"status": "ignored"})));
    };

    if let Err(e) = state.deposit_channel.send(request).await {
        return channel_down(e);
    }

    match rx.await {
        Ok(Ok(_)) => (StatusCode::OK, Json(json!({"status": "accepted"}))),
        Ok(Err(ServiceError::StateConflict { transaction_id, detail })) => {
            // Late webhook against a terminal row. Acknowledge it; a 4xx
            // would only make the provider redeliver forever.
            log::warn!("late webhook for {} ignored: {}", transaction_id, detail);
            (StatusCode::OK, Json(json!({"status": "ignored"})))
        }
        Ok(Err(service_error)) => error_response(&service_error),
        Err(e) => channel_down(e),
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let workers = vec![
        state.mint_worker.health(),
        state.withdraw_worker.health(),
    ];
    let all_running = workers
        .iter()
        .all(|w| w.status == WorkerStatus::Running);

    let code = if all_running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": if all_running { "ok" } else { "degraded" },
            "workers": workers,
        })),
    )
}

/// Parked messages for a queue, for operator inspection.
async fn dead_letters(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> impl IntoResponse {
    let parked: Vec<serde_json::Value> = state
        .broker
        .dead_letters(&queue)
        .into_iter()
        .map(|dead| {
            json!({
                "reason": dead.reason,
                "at": dead.at,
                "payload": dead.delivery.payload,
            })
        })
        .collect();

    (StatusCode::OK, Json(json!({"queue": queue, "messages": parked})))
}

pub async fn start_http_server(
    bind: &str,
    deposit_channel: mpsc::Sender<DepositRequest>,
    withdrawal_channel: mpsc::Sender<WithdrawalRequest>,
    mint_worker: Arc<MintWorker>,
    withdraw_worker: Arc<WithdrawWorker>,
    broker: Arc<Broker>,
) -> Result<(), anyhow::Error> {
    let app_state = AppState {
        deposit_channel,
        withdrawal_channel,
        mint_worker,
        withdraw_worker,
        broker,
    };

    let app = Router::new()
        .route("/deposit", post(request_new_deposit))
        .route("/deposit/{id}/status", get(get_deposit_status))
        .route("/withdraw", post(request_new_withdrawal))
        .route("/withdraw/{id}/status", get(get_withdrawal_status))
        .route("/webhooks/pix", post(pix_webhook))
        .route("/ops/dead-letters/{queue}", get(dead_letters))
        .route("/health", get(health))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(bind).await?;
    log::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
