use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
        }
    }
}

/// Overall transaction status. Terminal once confirmed or failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// Per-leg status, shared by the PIX and the blockchain leg. The blockchain
/// leg additionally starts out absent (`Transaction::blockchain_status` is
/// `None` until the fiat leg settles).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LegStatus {
    Pending,
    Confirmed,
    Failed,
}

impl LegStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegStatus::Pending => "pending",
            LegStatus::Confirmed => "confirmed",
            LegStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Leg {
    Pix,
    Blockchain,
}

/// One row per deposit or withdrawal, spanning both settlement rails.
/// All amounts are BRL cents.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub company_id: String,
    pub transaction_type: TransactionType,
    pub currency: String,
    pub amount_in_cents: i64,
    pub fee_in_cents: i64,
    pub net_amount_in_cents: i64,
    pub status: TransactionStatus,
    pub pix_status: LegStatus,
    pub pix_confirmed_at: Option<DateTime<Utc>>,
    pub pix_transaction_id: Option<String>,
    pub pix_key: Option<String>,
    pub pix_key_type: Option<String>,
    pub blockchain_status: Option<LegStatus>,
    pub blockchain_confirmed_at: Option<DateTime<Utc>>,
    pub tx_hash: Option<String>,
    pub block_number: Option<i64>,
    pub gas_used: Option<i64>,
    pub recipient_address: String,
    pub network: String,
    pub metadata: serde_json::Value,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewTransaction {
    pub id: String,
    pub user_id: String,
    pub company_id: String,
    pub transaction_type: TransactionType,
    pub currency: String,
    pub amount_in_cents: i64,
    pub fee_in_cents: i64,
    pub net_amount_in_cents: i64,
    pub pix_key: Option<String>,
    pub pix_key_type: Option<String>,
    pub recipient_address: String,
    pub network: String,
    /// Withdrawals claim the blockchain leg at creation (burn runs first);
    /// deposits leave it unset until the fiat leg settles.
    pub blockchain_status: Option<LegStatus>,
}

/// Audit fields carried by a PIX provider confirmation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PixConfirmation {
    pub pix_transaction_id: String,
    pub payer_document: Option<String>,
    pub payer_name: Option<String>,
    pub paid_amount_in_cents: Option<i64>,
}

/// On-chain settlement facts reported by a worker.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BlockchainConfirmation {
    pub tx_hash: String,
    pub block_number: i64,
    pub gas_used: i64,
}

/// Read-only projection served by the status endpoint.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositStatus {
    pub transaction_id: String,
    pub status: TransactionStatus,
    pub pix_status: LegStatus,
    pub blockchain_status: Option<LegStatus>,
    pub blockchain_tx_hash: Option<String>,
    pub amount_in_cents: i64,
    pub fee_in_cents: i64,
    pub net_amount_in_cents: i64,
    pub pix_confirmed_at: Option<DateTime<Utc>>,
    pub blockchain_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&Transaction> for DepositStatus {
    fn from(tx: &Transaction) -> Self {
        DepositStatus {
            transaction_id: tx.id.clone(),
            status: tx.status,
            pix_status: tx.pix_status,
            blockchain_status: tx.blockchain_status,
            blockchain_tx_hash: tx.tx_hash.clone(),
            amount_in_cents: tx.amount_in_cents,
            fee_in_cents: tx.fee_in_cents,
            net_amount_in_cents: tx.net_amount_in_cents,
            pix_confirmed_at: tx.pix_confirmed_at,
            blockchain_confirmed_at: tx.blockchain_confirmed_at,
            created_at: tx.created_at,
        }
    }
}
