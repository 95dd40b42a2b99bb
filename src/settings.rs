use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Postgres {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PixProvider {
    pub url: String,
    pub auth_token: String,
    pub receiving_key: String,
    pub receiving_key_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chain {
    pub rpc_url: String,
    pub contract_address: String,
    pub admin_key: String,
    pub network: String,
    pub confirmation_delay_secs: u64,
    pub rpc_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Queue {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub publish_attempts: u32,
    pub publish_retry_delay_secs: u64,
    pub prefetch: usize,
}

impl Default for Queue {
    fn default() -> Self {
        Queue {
            max_retries: 5,
            retry_delay_secs: 30,
            publish_attempts: 10,
            publish_retry_delay_secs: 5,
            prefetch: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Http {
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub postgres: Postgres,
    pub provider: PixProvider,
    pub chain: Chain,
    #[serde(default)]
    pub queue: Queue,
    pub http: Http,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config.toml"))
            .build()?;

        config.try_deserialize()
    }
}
