use std::str::FromStr;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tokio::time::{sleep, timeout};

use crate::settings::Chain;

alloy::sol! {
    #[sol(rpc)]
    contract BridgeToken {
        function mint(address to, uint256 amount) external;
        function burnFrom(address from, uint256 amount) external;
        function balanceOf(address owner) external view returns (uint256);
    }
}

/// Token precision is 18 decimals, amounts arrive as BRL cents (2 decimals).
const CENTS_TO_BASE_UNITS: u32 = 16;

pub fn to_base_units(amount_in_cents: i64) -> Result<U256, anyhow::Error> {
    if amount_in_cents <= 0 {
        bail!("amount must be positive, got {}", amount_in_cents);
    }
    Ok(U256::from(amount_in_cents) * U256::from(10).pow(U256::from(CENTS_TO_BASE_UNITS)))
}

pub fn base_units_to_cents(amount: U256) -> Result<i64, anyhow::Error> {
    let cents = amount / U256::from(10).pow(U256::from(CENTS_TO_BASE_UNITS));
    let cents: u128 = cents
        .try_into()
        .map_err(|_| anyhow!("on-chain amount out of range"))?;
    i64::try_from(cents).context("on-chain amount out of range")
}

/// Settlement facts for one mint or burn, including the observed balance
/// delta of the affected address.
#[derive(Clone, Debug)]
pub struct ChainReceipt {
    pub tx_hash: String,
    pub block_number: i64,
    pub gas_used: i64,
    pub delta_in_cents: i64,
}

#[async_trait]
pub trait ChainBridge: Send + Sync + 'static {
    async fn mint(
        &self,
        recipient: &str,
        amount_in_cents: i64,
        network: &str,
    ) -> Result<ChainReceipt, anyhow::Error>;

    async fn burn(
        &self,
        holder: &str,
        amount_in_cents: i64,
        network: &str,
    ) -> Result<ChainReceipt, anyhow::Error>;
}

enum ChainOp {
    Mint,
    Burn,
}

/// Signed mint/burn against the bridge token contract. One admin key; the
/// consumer side keeps execution serialized (prefetch 1) so transactions
/// never race the nonce.
pub struct EvmBridge {
    provider: DynProvider,
    contract: Address,
    network: String,
    confirmation_delay: Duration,
    rpc_timeout: Duration,
}

impl EvmBridge {
    pub fn new(settings: &Chain) -> Result<Self, anyhow::Error> {
        let signer: PrivateKeySigner = settings
            .admin_key
            .parse()
            .context("invalid chain admin key")?;
        let wallet = EthereumWallet::from(signer);
        let url = settings
            .rpc_url
            .parse()
            .context("invalid chain rpc url")?;
        let provider = ProviderBuilder::new().wallet(wallet).connect_http(url).erased();
        let contract =
            Address::from_str(&settings.contract_address).context("invalid contract address")?;

        Ok(EvmBridge {
            provider,
            contract,
            network: settings.network.clone(),
            confirmation_delay: Duration::from_secs(settings.confirmation_delay_secs),
            rpc_timeout: Duration::from_secs(settings.rpc_timeout_secs),
        })
    }

    async fn execute(
        &self,
        op: ChainOp,
        address: &str,
        amount_in_cents: i64,
        network: &str,
    ) -> Result<ChainReceipt, anyhow::Error> {
        if network != self.network {
            bail!(
                "job targets network {} but this bridge signs for {}",
                network,
                self.network
            );
        }

        let address = Address::from_str(address).context("invalid account address")?;
        let amount = to_base_units(amount_in_cents)?;
        let token = BridgeToken::new(self.contract, self.provider.clone());

        let balance_before = timeout(self.rpc_timeout, token.balanceOf(address).call())
            .await
            .context("balanceOf timed out")??;

        let pending = match op {
            ChainOp::Mint => timeout(self.rpc_timeout, token.mint(address, amount).send()).await,
            ChainOp::Burn => {
                timeout(self.rpc_timeout, token.burnFrom(address, amount).send()).await
            }
        }
        .context("transaction submit timed out")??;
        let receipt = timeout(self.rpc_timeout, pending.get_receipt())
            .await
            .context("receipt wait timed out")??;

        if !receipt.status() {
            bail!("transaction {} reverted", receipt.transaction_hash);
        }

        // Let the node settle before the defensive balance read, then check
        // the delta really matches what was requested.
        sleep(self.confirmation_delay).await;
        let balance_after = timeout(self.rpc_timeout, token.balanceOf(address).call())
            .await
            .context("balanceOf timed out")??;

        let delta = match op {
            ChainOp::Mint => balance_after.saturating_sub(balance_before),
            ChainOp::Burn => balance_before.saturating_sub(balance_after),
        };
        if delta != amount {
            bail!(
                "balance delta mismatch for {}: expected {} base units, observed {}",
                receipt.transaction_hash,
                amount,
                delta
            );
        }

        Ok(ChainReceipt {
            tx_hash: receipt.transaction_hash.to_string(),
            block_number: receipt.block_number.unwrap_or_default() as i64,
            gas_used: receipt.gas_used as i64,
            delta_in_cents: base_units_to_cents(delta)?,
        })
    }
}

#[async_trait]
impl ChainBridge for EvmBridge {
    async fn mint(
        &self,
        recipient: &str,
        amount_in_cents: i64,
        network: &str,
    ) -> Result<ChainReceipt, anyhow::Error> {
        self.execute(ChainOp::Mint, recipient, amount_in_cents, network)
            .await
    }

    async fn burn(
        &self,
        holder: &str,
        amount_in_cents: i64,
        network: &str,
    ) -> Result<ChainReceipt, anyhow::Error> {
        self.execute(ChainOp::Burn, holder, amount_in_cents, network)
            .await
    }
}
