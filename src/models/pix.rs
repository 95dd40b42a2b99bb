use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payment descriptor returned to the client after a deposit is initiated.
/// Pure data: the QR payload is generated locally, nothing is reserved at
/// the provider.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PixPaymentInfo {
    pub pix_key: String,
    pub pix_key_type: String,
    pub qr_copy_paste: String,
    pub amount_in_cents: i64,
    pub expires_at: DateTime<Utc>,
}

/// Webhook body delivered by the PIX provider. At-least-once, possibly
/// duplicated.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PixWebhook {
    pub transaction_id: String,
    pub pix_id: String,
    pub status: String,
    pub payer_document: Option<String>,
    pub payer_name: Option<String>,
    pub paid_amount: Option<i64>,
}

/// Provider response for an outbound payout (withdrawal leg).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PixPayout {
    pub id: String,
    pub end_to_end_id: Option<String>,
    pub status: String,
}
