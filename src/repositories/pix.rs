use anyhow::bail;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use crc::{Crc, CRC_16_IBM_3740};
use serde_json::json;
use uuid::Uuid;

use crate::models::pix::{PixPaymentInfo, PixPayout};

const QR_EXPIRY_MINUTES: i64 = 30;
const BR_CODE_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

fn emv_field(id: &str, value: &str) -> String {
    format!("{}{:02}{}", id, value.len(), value)
}

/// Builds the BR Code ("copia e cola") payload for a deposit. Pure data
/// transform: nothing is reserved at the provider, the charge is matched
/// later by the webhook's transaction id.
pub fn payment_descriptor(
    transaction_id: &str,
    amount_in_cents: i64,
    pix_key: &str,
    pix_key_type: &str,
) -> PixPaymentInfo {
    let amount = format!("{}.{:02}", amount_in_cents / 100, amount_in_cents % 100);
    let merchant_account = format!(
        "{}{}",
        emv_field("00", "br.gov.bcb.pix"),
        emv_field("01", pix_key)
    );
    // Payload format indicator, merchant account, category, currency (986 =
    // BRL), amount, country, merchant fields and the txid reference.
    let mut payload = String::new();
    payload.push_str(&emv_field("00", "01"));
    payload.push_str(&emv_field("26", &merchant_account));
    payload.push_str(&emv_field("52", "0000"));
    payload.push_str(&emv_field("53", "986"));
    payload.push_str(&emv_field("54", &amount));
    payload.push_str(&emv_field("58", "BR"));
    payload.push_str(&emv_field("59", "PIX BRIDGE"));
    payload.push_str(&emv_field("60", "SAO PAULO"));
    payload.push_str(&emv_field("62", &emv_field("05", transaction_id)));
    payload.push_str("6304");
    let crc = BR_CODE_CRC.checksum(payload.as_bytes());
    payload.push_str(&format!("{:04X}", crc));

    PixPaymentInfo {
        pix_key: pix_key.to_string(),
        pix_key_type: pix_key_type.to_string(),
        qr_copy_paste: payload,
        amount_in_cents,
        expires_at: Utc::now() + Duration::minutes(QR_EXPIRY_MINUTES),
    }
}

/// Outbound payouts (the fiat leg of a withdrawal).
#[async_trait]
pub trait PixGateway: Send + Sync + 'static {
    async fn payout(
        &self,
        withdrawal_id: &str,
        pix_key: &str,
        amount_in_cents: i64,
    ) -> Result<PixPayout, anyhow::Error>;
}

pub struct PixProviderApi {
    auth_token: String,
    url: String,
    client: reqwest::Client,
}

impl PixProviderApi {
    pub fn new(auth_token: String, url: String) -> Self {
        Self {
            auth_token,
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PixGateway for PixProviderApi {
    async fn payout(
        &self,
        withdrawal_id: &str,
        pix_key: &str,
        amount_in_cents: i64,
    ) -> Result<PixPayout, anyhow::Error> {
        let nonce = Uuid::new_v4().hyphenated().to_string();
        let payload = json!({
            "externalId": withdrawal_id,
            "pixKey": pix_key,
            "amountInCents": amount_in_cents,
        });

        let response = self
            .client
            .post(format!("{}/api/payout", self.url))
            .bearer_auth(&self.auth_token)
            .header("X-Nonce", nonce)
            .json(&payload)
            .send()
            .await?
            .text()
            .await?;

        let response_json: serde_json::Value = serde_json::from_str(&response)?;
        match response_json.get("response") {
            Some(r) => {
                let payout: PixPayout = serde_json::from_value(r.clone())?;
                Ok(payout)
            }
            None => bail!("Pix provider: bad payout response format."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_carries_key_amount_and_txid() {
        let info = payment_descriptor("tx-123", 10200, "pix@bridge.example", "email");

        assert_eq!(info.amount_in_cents, 10200);
        assert!(info.qr_copy_paste.contains("br.gov.bcb.pix"));
        assert!(info.qr_copy_paste.contains("pix@bridge.example"));
        assert!(info.qr_copy_paste.contains("tx-123"));
        assert!(info.qr_copy_paste.contains("102.00"));
        assert!(info.expires_at > Utc::now());
    }

    #[test]
    fn descriptor_checksum_is_stable() {
        let a = payment_descriptor("tx-1", 5000, "k", "evp");
        let b = payment_descriptor("tx-1", 5000, "k", "evp");
        assert_eq!(a.qr_copy_paste, b.qr_copy_paste);
        // Last four characters are the CRC over everything before them.
        let (body, crc) = a.qr_copy_paste.split_at(a.qr_copy_paste.len() - 4);
        assert_eq!(crc, format!("{:04X}", BR_CODE_CRC.checksum(body.as_bytes())));
    }
}
