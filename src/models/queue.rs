use serde::{Deserialize, Serialize};

/// Mint job, published once per confirmed PIX deposit.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MintJob {
    pub transaction_id: String,
    pub user_id: String,
    pub recipient_address: String,
    pub amount_in_cents: i64,
    pub network: String,
    #[serde(default)]
    pub current_retry: u32,
}

/// Wire schema of the `deposit-processing` queue. Deposits confirm through
/// the provider webhook, so nothing in-process produces these; the shape is
/// pinned down so operator republishes into the queue stay well-formed.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositProcessingJob {
    pub transaction_id: String,
    pub user_id: String,
    pub amount_in_cents: i64,
    #[serde(default)]
    pub current_retry: u32,
}

/// Withdrawal job: burn first, then PIX payout.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalJob {
    pub withdrawal_id: String,
    pub user_id: String,
    pub amount_in_cents: i64,
    pub pix_key: String,
    pub blockchain_address: String,
    pub user_email: Option<String>,
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub current_retry: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Email,
    Webhook,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    pub kind: NotificationKind,
    pub user_id: String,
    pub transaction_id: String,
    pub subject: String,
    pub body: serde_json::Value,
    pub target: Option<String>,
    #[serde(default)]
    pub current_retry: u32,
}
