use std::sync::Arc;

use crate::models::taxes::{FeeQuote, UserTaxes, VIP_FEE_SCALE_PCT, VIP_GAS_SUBSIDY_PCT};
use crate::repositories::taxes::TaxStore;

use super::ServiceError;

/// Computes deposit/withdraw/exchange/transfer fees from the per-user tax
/// profile.
///
/// Deposits are the odd one out on purpose: a flat surcharge on top of the
/// requested amount (`total = amount + fee`, `net = amount`), while the
/// other operations deduct a percentage from the gross
/// (`net = amount - fee`).
#[derive(Clone)]
pub struct FeeCalculator {
    taxes: Arc<dyn TaxStore>,
}

impl FeeCalculator {
    pub fn new(taxes: Arc<dyn TaxStore>) -> Self {
        FeeCalculator { taxes }
    }

    /// Lazily creates the profile on first access; an expired profile has
    /// already been reset to defaults by the store.
    pub async fn get_user_taxes(&self, user_id: &str) -> Result<UserTaxes, ServiceError> {
        self.taxes
            .get_or_create(user_id)
            .await
            .map_err(|e| ServiceError::Repository("FeeCalculator".to_string(), e.to_string()))
    }

    pub async fn calculate_deposit_fee(
        &self,
        user_id: &str,
        amount_in_cents: i64,
    ) -> Result<FeeQuote, ServiceError> {
        let taxes = self.checked_taxes(user_id, amount_in_cents).await?;
        let fee = scale_for_vip(taxes.deposit_fee_in_cents, taxes.vip_level);

        Ok(FeeQuote {
            total_amount_in_cents: amount_in_cents + fee,
            net_amount_in_cents: amount_in_cents,
            fee_in_cents: fee,
            gas_subsidy_pct: gas_subsidy(taxes.vip_level),
        })
    }

    pub async fn calculate_withdraw_fee(
        &self,
        user_id: &str,
        amount_in_cents: i64,
    ) -> Result<FeeQuote, ServiceError> {
        let taxes = self.checked_taxes(user_id, amount_in_cents).await?;
        self.percentage_quote(amount_in_cents, taxes.withdraw_fee_bps, &taxes)
    }

    pub async fn calculate_exchange_fee(
        &self,
        user_id: &str,
        amount_in_cents: i64,
    ) -> Result<FeeQuote, ServiceError> {
        let taxes = self.checked_taxes(user_id, amount_in_cents).await?;
        self.percentage_quote(amount_in_cents, taxes.exchange_fee_bps, &taxes)
    }

    pub async fn calculate_transfer_fee(
        &self,
        user_id: &str,
        amount_in_cents: i64,
    ) -> Result<FeeQuote, ServiceError> {
        let taxes = self.checked_taxes(user_id, amount_in_cents).await?;
        self.percentage_quote(amount_in_cents, taxes.transfer_fee_bps, &taxes)
    }

    async fn checked_taxes(
        &self,
        user_id: &str,
        amount_in_cents: i64,
    ) -> Result<UserTaxes, ServiceError> {
        if amount_in_cents <= 0 {
            return Err(ServiceError::Validation(format!(
                "amount must be positive, got {}",
                amount_in_cents
            )));
        }
        self.get_user_taxes(user_id).await
    }

    fn percentage_quote(
        &self,
        amount_in_cents: i64,
        fee_bps: i64,
        taxes: &UserTaxes,
    ) -> Result<FeeQuote, ServiceError> {
        let base_fee = (amount_in_cents * fee_bps) / 10_000;
        let fee = scale_for_vip(base_fee, taxes.vip_level);
        if fee >= amount_in_cents {
            return Err(ServiceError::Validation(format!(
                "amount {} does not cover the fee {}",
                amount_in_cents, fee
            )));
        }

        Ok(FeeQuote {
            total_amount_in_cents: amount_in_cents,
            net_amount_in_cents: amount_in_cents - fee,
            fee_in_cents: fee,
            gas_subsidy_pct: gas_subsidy(taxes.vip_level),
        })
    }
}

fn scale_for_vip(fee: i64, vip_level: u8) -> i64 {
    let scale = VIP_FEE_SCALE_PCT[vip_level.min(5) as usize];
    (fee * scale) / 100
}

fn gas_subsidy(vip_level: u8) -> i64 {
    VIP_GAS_SUBSIDY_PCT[vip_level.min(5) as usize]
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::models::taxes::DEFAULT_DEPOSIT_FEE_IN_CENTS;
    use crate::repositories::taxes::MemoryTaxStore;

    use super::*;

    fn calculator() -> (FeeCalculator, Arc<MemoryTaxStore>) {
        let store = Arc::new(MemoryTaxStore::new());
        (FeeCalculator::new(store.clone()), store)
    }

    #[tokio::test]
    async fn deposit_fee_is_a_flat_surcharge() {
        let (calc, _) = calculator();
        let quote = calc.calculate_deposit_fee("u1", 10_000).await.unwrap();

        assert_eq!(quote.fee_in_cents, DEFAULT_DEPOSIT_FEE_IN_CENTS);
        assert_eq!(
            quote.total_amount_in_cents,
            10_000 + DEFAULT_DEPOSIT_FEE_IN_CENTS
        );
        // The principal credited on-chain is exactly what was asked for.
        assert_eq!(quote.net_amount_in_cents, 10_000);
    }

    #[tokio::test]
    async fn withdraw_fee_is_deducted_from_gross() {
        let (calc, _) = calculator();
        // Default 250 bps on R$100.00.
        let quote = calc.calculate_withdraw_fee("u1", 10_000).await.unwrap();

        assert_eq!(quote.fee_in_cents, 250);
        assert_eq!(quote.total_amount_in_cents, 10_000);
        assert_eq!(quote.net_amount_in_cents, 9_750);
    }

    #[tokio::test]
    async fn vip_tier_scales_fees_and_unlocks_gas_subsidy() {
        let (calc, store) = calculator();
        let mut taxes = store.get_or_create("vip").await.unwrap();
        taxes.vip_level = 4;
        store.upsert(taxes).await.unwrap();

        let deposit = calc.calculate_deposit_fee("vip", 10_000).await.unwrap();
        assert_eq!(
            deposit.fee_in_cents,
            DEFAULT_DEPOSIT_FEE_IN_CENTS * 50 / 100
        );
        assert_eq!(deposit.gas_subsidy_pct, 50);

        let withdraw = calc.calculate_withdraw_fee("vip", 10_000).await.unwrap();
        assert_eq!(withdraw.fee_in_cents, 125);

        // Tiers below 3 get no subsidy.
        let base = calc.calculate_deposit_fee("u1", 10_000).await.unwrap();
        assert_eq!(base.gas_subsidy_pct, 0);
    }

    #[tokio::test]
    async fn expired_profile_reverts_to_defaults() {
        let (calc, store) = calculator();
        let mut taxes = store.get_or_create("u1").await.unwrap();
        taxes.vip_level = 5;
        taxes.valid_until = Some(Utc::now() - Duration::days(1));
        store.upsert(taxes).await.unwrap();

        let refreshed = calc.get_user_taxes("u1").await.unwrap();
        assert_eq!(refreshed.vip_level, 0);
        assert_eq!(refreshed.valid_until, None);
    }

    #[tokio::test]
    async fn rejects_non_positive_amounts() {
        let (calc, _) = calculator();
        assert!(matches!(
            calc.calculate_deposit_fee("u1", 0).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            calc.calculate_transfer_fee("u1", -5).await,
            Err(ServiceError::Validation(_))
        ));
    }
}
