use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::taxes::UserTaxes;

/// UserTaxes persistence. `get_or_create` is the lazy-profile contract:
/// first access materialises the default row, an expired profile is reset
/// to defaults before being returned.
#[async_trait]
pub trait TaxStore: Send + Sync + 'static {
    async fn get_or_create(&self, user_id: &str) -> Result<UserTaxes, anyhow::Error>;

    async fn upsert(&self, taxes: UserTaxes) -> Result<UserTaxes, anyhow::Error>;
}

#[derive(sqlx::FromRow)]
struct UserTaxesRow {
    user_id: String,
    deposit_fee_in_cents: i64,
    withdraw_fee_bps: i64,
    exchange_fee_bps: i64,
    transfer_fee_bps: i64,
    vip_level: i16,
    valid_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserTaxesRow> for UserTaxes {
    fn from(row: UserTaxesRow) -> Self {
        UserTaxes {
            user_id: row.user_id,
            deposit_fee_in_cents: row.deposit_fee_in_cents,
            withdraw_fee_bps: row.withdraw_fee_bps,
            exchange_fee_bps: row.exchange_fee_bps,
            transfer_fee_bps: row.transfer_fee_bps,
            vip_level: row.vip_level.clamp(0, 5) as u8,
            valid_until: row.valid_until,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct PgTaxStore {
    conn: PgPool,
}

impl PgTaxStore {
    pub fn new(conn: PgPool) -> Self {
        PgTaxStore { conn }
    }
}

#[async_trait]
impl TaxStore for PgTaxStore {
    async fn get_or_create(&self, user_id: &str) -> Result<UserTaxes, anyhow::Error> {
        let existing = sqlx::query_as::<_, UserTaxesRow>(
            "SELECT user_id, deposit_fee_in_cents, withdraw_fee_bps, exchange_fee_bps, \
             transfer_fee_bps, vip_level, valid_until, created_at, updated_at \
             FROM user_taxes WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.conn)
        .await?;

        let now = Utc::now();
        match existing {
            Some(row) => {
                let taxes: UserTaxes = row.into();
                if taxes.is_expired(now) {
                    self.upsert(UserTaxes::defaults_for(user_id, now)).await
                } else {
                    Ok(taxes)
                }
            }
            None => self.upsert(UserTaxes::defaults_for(user_id, now)).await,
        }
    }

    async fn upsert(&self, taxes: UserTaxes) -> Result<UserTaxes, anyhow::Error> {
        let row = sqlx::query_as::<_, UserTaxesRow>(
            r#"INSERT INTO user_taxes
            (user_id, deposit_fee_in_cents, withdraw_fee_bps, exchange_fee_bps,
             transfer_fee_bps, vip_level, valid_until)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id) DO UPDATE SET
                deposit_fee_in_cents = EXCLUDED.deposit_fee_in_cents,
                withdraw_fee_bps = EXCLUDED.withdraw_fee_bps,
                exchange_fee_bps = EXCLUDED.exchange_fee_bps,
                transfer_fee_bps = EXCLUDED.transfer_fee_bps,
                vip_level = EXCLUDED.vip_level,
                valid_until = EXCLUDED.valid_until,
                updated_at = now()
            RETURNING user_id, deposit_fee_in_cents, withdraw_fee_bps, exchange_fee_bps,
                transfer_fee_bps, vip_level, valid_until, created_at, updated_at"#,
        )
        .bind(&taxes.user_id)
        .bind(taxes.deposit_fee_in_cents)
        .bind(taxes.withdraw_fee_bps)
        .bind(taxes.exchange_fee_bps)
        .bind(taxes.transfer_fee_bps)
        .bind(taxes.vip_level as i16)
        .bind(taxes.valid_until)
        .fetch_one(&self.conn)
        .await?;

        Ok(row.into())
    }
}

/// In-memory store for tests and local runs.
#[derive(Default)]
pub struct MemoryTaxStore {
    rows: Mutex<HashMap<String, UserTaxes>>,
}

impl MemoryTaxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaxStore for MemoryTaxStore {
    async fn get_or_create(&self, user_id: &str) -> Result<UserTaxes, anyhow::Error> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let taxes = rows
            .entry(user_id.to_string())
            .or_insert_with(|| UserTaxes::defaults_for(user_id, now));
        if taxes.is_expired(now) {
            *taxes = UserTaxes::defaults_for(user_id, now);
        }
        Ok(taxes.clone())
    }

    async fn upsert(&self, taxes: UserTaxes) -> Result<UserTaxes, anyhow::Error> {
        let mut rows = self.rows.lock().unwrap();
        rows.insert(taxes.user_id.clone(), taxes.clone());
        Ok(taxes)
    }
}
