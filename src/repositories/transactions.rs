use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;

use crate::models::transactions::{
    BlockchainConfirmation, Leg, LegStatus, NewTransaction, PixConfirmation, Transaction,
    TransactionStatus, TransactionType,
};

/// Outcome of the conditional PIX-confirm + mint-claim transition.
///
/// `Claimed` means this caller won the race: it observed the blockchain leg
/// unset and flipped it to pending in the same write. Only a `Claimed`
/// caller may publish the mint job.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(Transaction),
    /// Blockchain leg already set by an earlier call. Audit fields were
    /// updated; no job must be published.
    AlreadyClaimed(Transaction),
    NotFound,
    /// The PIX leg is not pending (failed or otherwise unconfirmable).
    Conflict(Transaction),
}

/// Outcome of a leg confirmation (mint, burn, payout).
#[derive(Debug)]
pub enum SettleOutcome {
    Settled(Transaction),
    AlreadySettled(Transaction),
    NotFound,
    Conflict(Transaction),
}

/// Persisted ledger of dual-rail transactions. The conditional transitions
/// are the coordination point between the orchestrators and the workers:
/// each one is a single atomic compare-and-set on the status columns, so a
/// caller either wins the transition or observes who did.
#[async_trait]
pub trait TransactionStore: Send + Sync + 'static {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, anyhow::Error>;

    async fn find(&self, id: &str) -> Result<Option<Transaction>, anyhow::Error>;

    /// Atomically set pix_status=confirmed and blockchain_status=pending,
    /// iff the PIX leg is pending and the blockchain leg unset.
    async fn confirm_pix_and_claim_mint(
        &self,
        id: &str,
        pix: &PixConfirmation,
    ) -> Result<ClaimOutcome, anyhow::Error>;

    /// Atomically flip the blockchain leg pending -> confirmed and record
    /// the receipt. The overall status becomes confirmed iff both legs are
    /// confirmed after the write.
    async fn confirm_blockchain(
        &self,
        id: &str,
        receipt: &BlockchainConfirmation,
    ) -> Result<SettleOutcome, anyhow::Error>;

    /// Withdrawal payout: flip the PIX leg pending -> confirmed after the
    /// burn has settled.
    async fn confirm_pix_payout(
        &self,
        id: &str,
        pix: &PixConfirmation,
    ) -> Result<SettleOutcome, anyhow::Error>;

    /// Terminal failure marker for one leg. No-op when the transaction is
    /// already terminal; `Ok(None)` when the id is unknown.
    async fn fail_leg(
        &self,
        id: &str,
        leg: Leg,
        reason: &str,
    ) -> Result<Option<Transaction>, anyhow::Error>;

    /// Spend of confirmed deposits for today, for the daily cap.
    async fn daily_deposit_spending(&self, user_id: &str) -> Result<i64, anyhow::Error>;

    /// Number of confirmed deposits ever made by the user, for the
    /// first-transactions caps.
    async fn confirmed_deposit_count(&self, user_id: &str) -> Result<i64, anyhow::Error>;
}

fn failure_entry(leg: Leg, reason: &str, now: DateTime<Utc>) -> serde_json::Value {
    json!({
        "leg": match leg {
            Leg::Pix => "pix",
            Leg::Blockchain => "blockchain",
        },
        "reason": reason,
        "at": now.to_rfc3339(),
    })
}

fn append_metadata(metadata: &mut serde_json::Value, key: &str, entry: serde_json::Value) {
    if !metadata.is_object() {
        *metadata = json!({});
    }
    let obj = metadata.as_object_mut().unwrap();
    let list = obj.entry(key).or_insert_with(|| json!([]));
    if let Some(arr) = list.as_array_mut() {
        arr.push(entry);
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Mutex-backed store. One lock hold per transition gives the same
/// atomicity the Postgres store gets from conditional UPDATEs, which makes
/// it a faithful stand-in for concurrency tests and local runs.
#[derive(Default)]
pub struct MemoryTransactionStore {
    rows: Mutex<HashMap<String, Transaction>>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, anyhow::Error> {
        let now = Utc::now();
        let tx = Transaction {
            id: new.id.clone(),
            user_id: new.user_id,
            company_id: new.company_id,
            transaction_type: new.transaction_type,
            currency: new.currency,
            amount_in_cents: new.amount_in_cents,
            fee_in_cents: new.fee_in_cents,
            net_amount_in_cents: new.net_amount_in_cents,
            status: TransactionStatus::Pending,
            pix_status: LegStatus::Pending,
            pix_confirmed_at: None,
            pix_transaction_id: None,
            pix_key: new.pix_key,
            pix_key_type: new.pix_key_type,
            blockchain_status: new.blockchain_status,
            blockchain_confirmed_at: None,
            tx_hash: None,
            block_number: None,
            gas_used: None,
            recipient_address: new.recipient_address,
            network: new.network,
            metadata: json!({}),
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&new.id) {
            bail!("duplicate transaction id: {}", new.id);
        }
        rows.insert(new.id, tx.clone());

        Ok(tx)
    }

    async fn find(&self, id: &str) -> Result<Option<Transaction>, anyhow::Error> {
        Ok(self.rows.lock().unwrap().get(id).cloned())
    }

    async fn confirm_pix_and_claim_mint(
        &self,
        id: &str,
        pix: &PixConfirmation,
    ) -> Result<ClaimOutcome, anyhow::Error> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let tx = match rows.get_mut(id) {
            Some(tx) => tx,
            None => return Ok(ClaimOutcome::NotFound),
        };

        if tx.blockchain_status.is_some() {
            // Duplicate webhook: keep the audit trail, never re-claim.
            if tx.pix_transaction_id.is_none() {
                tx.pix_transaction_id = Some(pix.pix_transaction_id.clone());
            }
            append_metadata(
                &mut tx.metadata,
                "pix_confirmations",
                json!({ "pixId": pix.pix_transaction_id, "at": now.to_rfc3339() }),
            );
            tx.version += 1;
            tx.updated_at = now;
            return Ok(ClaimOutcome::AlreadyClaimed(tx.clone()));
        }

        if tx.pix_status != LegStatus::Pending || tx.status.is_terminal() {
            return Ok(ClaimOutcome::Conflict(tx.clone()));
        }

        tx.pix_status = LegStatus::Confirmed;
        tx.pix_confirmed_at = Some(now);
        tx.pix_transaction_id = Some(pix.pix_transaction_id.clone());
        tx.blockchain_status = Some(LegStatus::Pending);
        append_metadata(
            &mut tx.metadata,
            "pix_confirmations",
            json!({
                "pixId": pix.pix_transaction_id,
                "payerDocument": pix.payer_document,
                "payerName": pix.payer_name,
                "paidAmountInCents": pix.paid_amount_in_cents,
                "at": now.to_rfc3339(),
            }),
        );
        tx.version += 1;
        tx.updated_at = now;

        Ok(ClaimOutcome::Claimed(tx.clone()))
    }

    async fn confirm_blockchain(
        &self,
        id: &str,
        receipt: &BlockchainConfirmation,
    ) -> Result<SettleOutcome, anyhow::Error> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let tx = match rows.get_mut(id) {
            Some(tx) => tx,
            None => return Ok(SettleOutcome::NotFound),
        };

        if tx.blockchain_status == Some(LegStatus::Confirmed) {
            return Ok(SettleOutcome::AlreadySettled(tx.clone()));
        }
        if tx.blockchain_status != Some(LegStatus::Pending) || tx.status.is_terminal() {
            return Ok(SettleOutcome::Conflict(tx.clone()));
        }

        tx.blockchain_status = Some(LegStatus::Confirmed);
        tx.blockchain_confirmed_at = Some(now);
        tx.tx_hash = Some(receipt.tx_hash.clone());
        tx.block_number = Some(receipt.block_number);
        tx.gas_used = Some(receipt.gas_used);
        if tx.pix_status == LegStatus::Confirmed {
            tx.status = TransactionStatus::Confirmed;
        }
        tx.version += 1;
        tx.updated_at = now;

        Ok(SettleOutcome::Settled(tx.clone()))
    }

    async fn confirm_pix_payout(
        &self,
        id: &str,
        pix: &PixConfirmation,
    ) -> Result<SettleOutcome, anyhow::Error> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let tx = match rows.get_mut(id) {
            Some(tx) => tx,
            None => return Ok(SettleOutcome::NotFound),
        };

        if tx.pix_status == LegStatus::Confirmed {
            return Ok(SettleOutcome::AlreadySettled(tx.clone()));
        }
        if tx.pix_status != LegStatus::Pending || tx.status.is_terminal() {
            return Ok(SettleOutcome::Conflict(tx.clone()));
        }

        tx.pix_status = LegStatus::Confirmed;
        tx.pix_confirmed_at = Some(now);
        tx.pix_transaction_id = Some(pix.pix_transaction_id.clone());
        if tx.blockchain_status == Some(LegStatus::Confirmed) {
            tx.status = TransactionStatus::Confirmed;
        }
        tx.version += 1;
        tx.updated_at = now;

        Ok(SettleOutcome::Settled(tx.clone()))
    }

    async fn fail_leg(
        &self,
        id: &str,
        leg: Leg,
        reason: &str,
    ) -> Result<Option<Transaction>, anyhow::Error> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let tx = match rows.get_mut(id) {
            Some(tx) => tx,
            None => return Ok(None),
        };

        if tx.status.is_terminal() {
            return Ok(Some(tx.clone()));
        }

        match leg {
            Leg::Pix => tx.pix_status = LegStatus::Failed,
            Leg::Blockchain => tx.blockchain_status = Some(LegStatus::Failed),
        }
        tx.status = TransactionStatus::Failed;
        append_metadata(&mut tx.metadata, "failures", failure_entry(leg, reason, now));
        tx.version += 1;
        tx.updated_at = now;

        Ok(Some(tx.clone()))
    }

    async fn daily_deposit_spending(&self, user_id: &str) -> Result<i64, anyhow::Error> {
        let today = Utc::now().date_naive();
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .filter(|tx| {
                tx.user_id == user_id
                    && tx.transaction_type == TransactionType::Deposit
                    && tx.status == TransactionStatus::Confirmed
                    && tx.created_at.date_naive() == today
            })
            .map(|tx| tx.amount_in_cents)
            .sum())
    }

    async fn confirmed_deposit_count(&self, user_id: &str) -> Result<i64, anyhow::Error> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .filter(|tx| {
                tx.user_id == user_id
                    && tx.transaction_type == TransactionType::Deposit
                    && tx.status == TransactionStatus::Confirmed
            })
            .count() as i64)
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: String,
    user_id: String,
    company_id: String,
    transaction_type: String,
    currency: String,
    amount_in_cents: i64,
    fee_in_cents: i64,
    net_amount_in_cents: i64,
    status: String,
    pix_status: String,
    pix_confirmed_at: Option<DateTime<Utc>>,
    pix_transaction_id: Option<String>,
    pix_key: Option<String>,
    pix_key_type: Option<String>,
    blockchain_status: Option<String>,
    blockchain_confirmed_at: Option<DateTime<Utc>>,
    tx_hash: Option<String>,
    block_number: Option<i64>,
    gas_used: Option<i64>,
    recipient_address: String,
    network: String,
    metadata: serde_json::Value,
    version: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl FromStr for TransactionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "confirmed" => Ok(TransactionStatus::Confirmed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(anyhow!("unknown transaction status: {}", other)),
        }
    }
}

impl FromStr for LegStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LegStatus::Pending),
            "confirmed" => Ok(LegStatus::Confirmed),
            "failed" => Ok(LegStatus::Failed),
            other => Err(anyhow!("unknown leg status: {}", other)),
        }
    }
}

impl FromStr for TransactionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            other => Err(anyhow!("unknown transaction type: {}", other)),
        }
    }
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = anyhow::Error;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: row.id,
            user_id: row.user_id,
            company_id: row.company_id,
            transaction_type: row.transaction_type.parse()?,
            currency: row.currency,
            amount_in_cents: row.amount_in_cents,
            fee_in_cents: row.fee_in_cents,
            net_amount_in_cents: row.net_amount_in_cents,
            status: row.status.parse()?,
            pix_status: row.pix_status.parse()?,
            pix_confirmed_at: row.pix_confirmed_at,
            pix_transaction_id: row.pix_transaction_id,
            pix_key: row.pix_key,
            pix_key_type: row.pix_key_type,
            blockchain_status: row.blockchain_status.as_deref().map(str::parse).transpose()?,
            blockchain_confirmed_at: row.blockchain_confirmed_at,
            tx_hash: row.tx_hash,
            block_number: row.block_number,
            gas_used: row.gas_used,
            recipient_address: row.recipient_address,
            network: row.network,
            metadata: row.metadata,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const ALL_COLUMNS: &str = "id, user_id, company_id, transaction_type, currency, amount_in_cents, \
     fee_in_cents, net_amount_in_cents, status, pix_status, pix_confirmed_at, pix_transaction_id, \
     pix_key, pix_key_type, blockchain_status, blockchain_confirmed_at, tx_hash, block_number, \
     gas_used, recipient_address, network, metadata, version, created_at, updated_at";

#[derive(Clone)]
pub struct PgTransactionStore {
    conn: PgPool,
}

impl PgTransactionStore {
    pub fn new(conn: PgPool) -> Self {
        PgTransactionStore { conn }
    }

    async fn fetch(&self, id: &str) -> Result<Option<Transaction>, anyhow::Error> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            ALL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.conn)
        .await?;

        row.map(Transaction::try_from).transpose()
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, anyhow::Error> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"INSERT INTO transactions
            (id, user_id, company_id, transaction_type, currency, amount_in_cents,
             fee_in_cents, net_amount_in_cents, status, pix_status, pix_key, pix_key_type,
             blockchain_status, recipient_address, network, metadata, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', 'pending', $9, $10, $11, $12, $13, '{{}}', 1)
            RETURNING {}"#,
            ALL_COLUMNS
        ))
        .bind(&new.id)
        .bind(&new.user_id)
        .bind(&new.company_id)
        .bind(new.transaction_type.as_str())
        .bind(&new.currency)
        .bind(new.amount_in_cents)
        .bind(new.fee_in_cents)
        .bind(new.net_amount_in_cents)
        .bind(&new.pix_key)
        .bind(&new.pix_key_type)
        .bind(new.blockchain_status.map(|s| s.as_str()))
        .bind(&new.recipient_address)
        .bind(&new.network)
        .fetch_one(&self.conn)
        .await?;

        row.try_into()
    }

    async fn find(&self, id: &str) -> Result<Option<Transaction>, anyhow::Error> {
        self.fetch(id).await
    }

    async fn confirm_pix_and_claim_mint(
        &self,
        id: &str,
        pix: &PixConfirmation,
    ) -> Result<ClaimOutcome, anyhow::Error> {
        let audit = json!({
            "pix_confirmations": [{
                "pixId": pix.pix_transaction_id,
                "payerDocument": pix.payer_document,
                "payerName": pix.payer_name,
                "paidAmountInCents": pix.paid_amount_in_cents,
            }]
        });

        // The WHERE clause is the whole idempotency contract: only the
        // caller whose UPDATE matches gets to publish the mint job.
        let won = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"UPDATE transactions
            SET pix_status = 'confirmed',
                pix_confirmed_at = now(),
                pix_transaction_id = $2,
                blockchain_status = 'pending',
                metadata = metadata || $3,
                version = version + 1,
                updated_at = now()
            WHERE id = $1 AND status = 'pending' AND pix_status = 'pending'
              AND blockchain_status IS NULL
            RETURNING {}"#,
            ALL_COLUMNS
        ))
        .bind(id)
        .bind(&pix.pix_transaction_id)
        .bind(&audit)
        .fetch_optional(&self.conn)
        .await?;

        if let Some(row) = won {
            return Ok(ClaimOutcome::Claimed(row.try_into()?));
        }

        let current = match self.fetch(id).await? {
            Some(tx) => tx,
            None => return Ok(ClaimOutcome::NotFound),
        };

        if current.blockchain_status.is_some() {
            let row = sqlx::query_as::<_, TransactionRow>(&format!(
                r#"UPDATE transactions
                SET pix_transaction_id = COALESCE(pix_transaction_id, $2),
                    metadata = metadata || $3,
                    version = version + 1,
                    updated_at = now()
                WHERE id = $1
                RETURNING {}"#,
                ALL_COLUMNS
            ))
            .bind(id)
            .bind(&pix.pix_transaction_id)
            .bind(&audit)
            .fetch_one(&self.conn)
            .await?;

            return Ok(ClaimOutcome::AlreadyClaimed(row.try_into()?));
        }

        Ok(ClaimOutcome::Conflict(current))
    }

    async fn confirm_blockchain(
        &self,
        id: &str,
        receipt: &BlockchainConfirmation,
    ) -> Result<SettleOutcome, anyhow::Error> {
        let won = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"UPDATE transactions
            SET blockchain_status = 'confirmed',
                blockchain_confirmed_at = now(),
                tx_hash = $2,
                block_number = $3,
                gas_used = $4,
                status = CASE WHEN pix_status = 'confirmed' THEN 'confirmed' ELSE status END,
                version = version + 1,
                updated_at = now()
            WHERE id = $1 AND status = 'pending' AND blockchain_status = 'pending'
            RETURNING {}"#,
            ALL_COLUMNS
        ))
        .bind(id)
        .bind(&receipt.tx_hash)
        .bind(receipt.block_number)
        .bind(receipt.gas_used)
        .fetch_optional(&self.conn)
        .await?;

        if let Some(row) = won {
            return Ok(SettleOutcome::Settled(row.try_into()?));
        }

        match self.fetch(id).await? {
            None => Ok(SettleOutcome::NotFound),
            Some(tx) if tx.blockchain_status == Some(LegStatus::Confirmed) => {
                Ok(SettleOutcome::AlreadySettled(tx))
            }
            Some(tx) => Ok(SettleOutcome::Conflict(tx)),
        }
    }

    async fn confirm_pix_payout(
        &self,
        id: &str,
        pix: &PixConfirmation,
    ) -> Result<SettleOutcome, anyhow::Error> {
        let won = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"UPDATE transactions
            SET pix_status = 'confirmed',
                pix_confirmed_at = now(),
                pix_transaction_id = $2,
                status = CASE WHEN blockchain_status = 'confirmed' THEN 'confirmed' ELSE status END,
                version = version + 1,
                updated_at = now()
            WHERE id = $1 AND status = 'pending' AND pix_status = 'pending'
            RETURNING {}"#,
            ALL_COLUMNS
        ))
        .bind(id)
        .bind(&pix.pix_transaction_id)
        .fetch_optional(&self.conn)
        .await?;

        if let Some(row) = won {
            return Ok(SettleOutcome::Settled(row.try_into()?));
        }

        match self.fetch(id).await? {
            None => Ok(SettleOutcome::NotFound),
            Some(tx) if tx.pix_status == LegStatus::Confirmed => {
                Ok(SettleOutcome::AlreadySettled(tx))
            }
            Some(tx) => Ok(SettleOutcome::Conflict(tx)),
        }
    }

    async fn fail_leg(
        &self,
        id: &str,
        leg: Leg,
        reason: &str,
    ) -> Result<Option<Transaction>, anyhow::Error> {
        let entry = json!({ "failures": [failure_entry(leg, reason, Utc::now())] });
        let leg_column = match leg {
            Leg::Pix => "pix_status",
            Leg::Blockchain => "blockchain_status",
        };

        let updated = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"UPDATE transactions
            SET {} = 'failed',
                status = 'failed',
                metadata = metadata || $2,
                version = version + 1,
                updated_at = now()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}"#,
            leg_column, ALL_COLUMNS
        ))
        .bind(id)
        .bind(&entry)
        .fetch_optional(&self.conn)
        .await?;

        match updated {
            Some(row) => Ok(Some(row.try_into()?)),
            None => self.fetch(id).await,
        }
    }

    async fn daily_deposit_spending(&self, user_id: &str) -> Result<i64, anyhow::Error> {
        let amount: i64 = sqlx::query_scalar(
            r#"SELECT COALESCE(SUM(amount_in_cents), 0) FROM transactions
            WHERE user_id = $1 AND transaction_type = 'deposit' AND status = 'confirmed'
              AND DATE(created_at) = CURRENT_DATE"#,
        )
        .bind(user_id)
        .fetch_one(&self.conn)
        .await?;

        Ok(amount)
    }

    async fn confirmed_deposit_count(&self, user_id: &str) -> Result<i64, anyhow::Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM transactions WHERE user_id = $1 AND transaction_type = 'deposit' AND status = 'confirmed'",
        )
        .bind(user_id)
        .fetch_one(&self.conn)
        .await?;

        Ok(count)
    }
}
