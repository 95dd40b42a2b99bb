use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;

/// The slice of the user record this service needs: company association
/// (deposits are refused without one), the settlement coordinates, and the
/// partner callback URL for settlement webhooks.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct UserAccount {
    pub id: String,
    pub company_id: Option<String>,
    pub wallet_address: Option<String>,
    pub email: Option<String>,
    pub webhook_url: Option<String>,
}

#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    async fn get_user(&self, id: &str) -> Result<Option<UserAccount>, anyhow::Error>;
}

#[derive(Clone)]
pub struct PgUserDirectory {
    conn: PgPool,
}

impl PgUserDirectory {
    pub fn new(conn: PgPool) -> Self {
        PgUserDirectory { conn }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn get_user(&self, id: &str) -> Result<Option<UserAccount>, anyhow::Error> {
        let user = sqlx::query_as::<_, UserAccount>(
            "SELECT id, company_id, wallet_address, email, webhook_url FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.conn)
        .await?;

        Ok(user)
    }
}

/// In-memory directory for tests and local runs.
#[derive(Default)]
pub struct MemoryUserDirectory {
    users: Mutex<HashMap<String, UserAccount>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserAccount) {
        self.users.lock().unwrap().insert(user.id.clone(), user);
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn get_user(&self, id: &str) -> Result<Option<UserAccount>, anyhow::Error> {
        Ok(self.users.lock().unwrap().get(id).cloned())
    }
}
