use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-user fee profile. Percentages are basis points (1% = 100 bps) so the
/// arithmetic stays in integers, like every other amount in the system.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserTaxes {
    pub user_id: String,
    pub deposit_fee_in_cents: i64,
    pub withdraw_fee_bps: i64,
    pub exchange_fee_bps: i64,
    pub transfer_fee_bps: i64,
    pub vip_level: u8,
    pub valid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserTaxes {
    pub fn defaults_for(user_id: &str, now: DateTime<Utc>) -> Self {
        UserTaxes {
            user_id: user_id.to_string(),
            deposit_fee_in_cents: DEFAULT_DEPOSIT_FEE_IN_CENTS,
            withdraw_fee_bps: DEFAULT_WITHDRAW_FEE_BPS,
            exchange_fee_bps: DEFAULT_EXCHANGE_FEE_BPS,
            transfer_fee_bps: DEFAULT_TRANSFER_FEE_BPS,
            vip_level: 0,
            valid_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.valid_until, Some(until) if until < now)
    }
}

pub const DEFAULT_DEPOSIT_FEE_IN_CENTS: i64 = 200;
pub const DEFAULT_WITHDRAW_FEE_BPS: i64 = 250;
pub const DEFAULT_EXCHANGE_FEE_BPS: i64 = 150;
pub const DEFAULT_TRANSFER_FEE_BPS: i64 = 50;

/// Fee multiplier per VIP tier, in percent of the base fee.
pub const VIP_FEE_SCALE_PCT: [i64; 6] = [100, 90, 80, 65, 50, 30];

/// Gas subsidy per VIP tier, in percent. Tiers 0-2 pay their own gas.
pub const VIP_GAS_SUBSIDY_PCT: [i64; 6] = [0, 0, 0, 25, 50, 100];

/// Result of a fee calculation, handed back to the orchestrators.
///
/// Deposits are a flat surcharge: the user pays `total`, the principal
/// credited on-chain is `net == requested`. Withdraw/exchange/transfer
/// deduct a percentage: the user moves `total == requested` and receives
/// `net = requested - fee`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeQuote {
    pub total_amount_in_cents: i64,
    pub net_amount_in_cents: i64,
    pub fee_in_cents: i64,
    pub gas_subsidy_pct: i64,
}
