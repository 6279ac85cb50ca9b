//! Chain Access
//!
//! Read and write seams over the blockchain node, plus the alloy-backed
//! implementation used in production. The endpoint may be an HTTP(S) or
//! WS(S) URL or a local IPC socket path; connection is retried with
//! exponential backoff.

use alloy::network::{EthereumWallet, ReceiptResponse, TransactionBuilder};
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::{PendingTransactionConfig, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::BoxTransport;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;

/// Default time to wait for a submitted transfer to be mined
pub const DEFAULT_CONFIRMATION_TIMEOUT_SECS: u64 = 120;

/// Default number of blocks a transfer must be buried under
pub const DEFAULT_REQUIRED_CONFIRMATIONS: u64 = 1;

/// Errors that can occur talking to the chain node
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("IPC socket not found at path: {0}")]
    SocketNotFound(String),

    #[error("Invalid RPC endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Max connection attempts ({0}) exceeded")]
    MaxConnectAttemptsExceeded(u32),

    #[error("RPC call failed: {0}")]
    Rpc(String),

    #[error("Transfer submission failed: {0}")]
    Submission(String),

    #[error("Transfer confirmation failed: {0}")]
    Confirmation(String),

    #[error("No receipt for confirmed transfer {0}")]
    ReceiptMissing(TxHash),

    #[error("Transfer {0} reverted")]
    Reverted(TxHash),
}

/// Transport flavour of an RPC endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Http,
    Ws,
    Ipc,
}

impl EndpointKind {
    /// Classify an endpoint string
    pub fn of(endpoint: &str) -> Self {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            EndpointKind::Http
        } else if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            EndpointKind::Ws
        } else {
            EndpointKind::Ipc
        }
    }
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen("~", &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

/// Check if an IPC socket exists at the given path
pub fn socket_exists(path: &str) -> bool {
    Path::new(&expand_path(path)).exists()
}

/// Validate an endpoint and resolve it to the string handed to the provider
pub fn resolve_endpoint(endpoint: &str) -> Result<String, ChainError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(ChainError::InvalidEndpoint("endpoint cannot be empty".to_string()));
    }

    match EndpointKind::of(endpoint) {
        EndpointKind::Http | EndpointKind::Ws => Ok(endpoint.to_string()),
        EndpointKind::Ipc => {
            let expanded = expand_path(endpoint);
            if !expanded.ends_with(".ipc") {
                warn!("IPC path '{}' may not be a valid socket path", endpoint);
            }
            Ok(expanded)
        }
    }
}

/// Read-only lookups against the chain node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Look up the sender of a transaction
    ///
    /// # Returns
    /// `Ok(None)` when the node does not know the transaction, `Err` when the
    /// lookup itself failed
    async fn transaction_sender(&self, hash: TxHash) -> Result<Option<Address>, ChainError>;
}

/// A broadcast transfer that has not been confirmed yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTransfer {
    pub tx_hash: TxHash,
    pub to: Address,
    pub amount: U256,
}

/// A mined, successful transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReceipt {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
}

/// Value transfers signed by the tipping wallet
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainWriter: Send + Sync {
    /// Sign and broadcast a native-asset transfer
    async fn send_transfer(&self, to: Address, amount: U256) -> Result<PendingTransfer, ChainError>;

    /// Wait until a broadcast transfer is mined and check it succeeded
    async fn await_confirmation(&self, pending: PendingTransfer) -> Result<TransferReceipt, ChainError>;
}

/// How long and how deep to wait for a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub timeout: Duration,
    pub required_confirmations: u64,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_CONFIRMATION_TIMEOUT_SECS),
            required_confirmations: DEFAULT_REQUIRED_CONFIRMATIONS,
        }
    }
}

/// Connection manager for the RPC endpoint with retry support
pub struct RpcConnection {
    endpoint: String,
    backoff: BackoffPolicy,
    attempts: u32,
}

impl RpcConnection {
    pub fn new(endpoint: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            endpoint: endpoint.into(),
            backoff,
            attempts: 0,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempt a single connection with the given signer attached
    pub async fn connect(
        &mut self,
        signer: PrivateKeySigner,
    ) -> Result<impl Provider<BoxTransport> + Clone + 'static, ChainError> {
        let resolved = resolve_endpoint(&self.endpoint)?;

        if EndpointKind::of(&resolved) == EndpointKind::Ipc && !Path::new(&resolved).exists() {
            return Err(ChainError::SocketNotFound(resolved));
        }

        info!("Connecting to RPC endpoint ({:?})", EndpointKind::of(&resolved));

        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(EthereumWallet::from(signer))
            .on_builtin(&resolved)
            .await
            .map_err(|e| ChainError::ConnectionFailed(e.to_string()))?;

        self.attempts = 0;
        info!("Successfully connected to RPC endpoint");

        Ok(provider)
    }

    /// Connect, retrying with exponential backoff until the policy gives up
    pub async fn connect_with_retry(
        &mut self,
        signer: PrivateKeySigner,
    ) -> Result<impl Provider<BoxTransport> + Clone + 'static, ChainError> {
        loop {
            match self.connect(signer.clone()).await {
                Ok(provider) => return Ok(provider),
                Err(e @ ChainError::InvalidEndpoint(_)) => return Err(e),
                Err(e) => {
                    self.attempts += 1;
                    error!("Connection attempt {} failed: {}", self.attempts, e);
                }
            }

            if !self.backoff.allows(self.attempts) {
                return Err(ChainError::MaxConnectAttemptsExceeded(self.backoff.max_attempts));
            }

            let delay = self.backoff.delay(self.attempts - 1);
            warn!(
                "Attempting to reconnect (attempt {}/{}), waiting {:?}",
                self.attempts + 1,
                self.backoff.max_attempts,
                delay
            );
            sleep(delay).await;
        }
    }
}

/// Chain reader and writer backed by an alloy provider
pub struct RpcChain<P> {
    provider: P,
    tipper: Address,
    confirmation: ConfirmationPolicy,
}

impl<P> RpcChain<P>
where
    P: Provider<BoxTransport> + Send + Sync + 'static,
{
    pub fn new(provider: P, tipper: Address, confirmation: ConfirmationPolicy) -> Self {
        Self {
            provider,
            tipper,
            confirmation,
        }
    }

    /// Address of the wallet tips are paid from
    pub fn tipper_address(&self) -> Address {
        self.tipper
    }

    pub async fn chain_id(&self) -> Result<u64, ChainError> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    /// Native balance of the tipping wallet
    pub async fn tipper_balance(&self) -> Result<U256, ChainError> {
        self.provider
            .get_balance(self.tipper)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }
}

#[async_trait]
impl<P> ChainReader for RpcChain<P>
where
    P: Provider<BoxTransport> + Send + Sync + 'static,
{
    async fn transaction_sender(&self, hash: TxHash) -> Result<Option<Address>, ChainError> {
        let tx = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        Ok(tx.map(|tx| tx.from))
    }
}

#[async_trait]
impl<P> ChainWriter for RpcChain<P>
where
    P: Provider<BoxTransport> + Send + Sync + 'static,
{
    async fn send_transfer(&self, to: Address, amount: U256) -> Result<PendingTransfer, ChainError> {
        let request = TransactionRequest::default().with_to(to).with_value(amount);

        let pending = self
            .provider
            .send_transaction(request)
            .await
            .map_err(|e| ChainError::Submission(e.to_string()))?;

        let tx_hash = *pending.tx_hash();
        debug!(tx_hash = %tx_hash, to = %to, "Transfer broadcast");

        Ok(PendingTransfer { tx_hash, to, amount })
    }

    async fn await_confirmation(&self, pending: PendingTransfer) -> Result<TransferReceipt, ChainError> {
        let config = PendingTransactionConfig::new(pending.tx_hash)
            .with_required_confirmations(self.confirmation.required_confirmations)
            .with_timeout(Some(self.confirmation.timeout));

        let watcher = self
            .provider
            .watch_pending_transaction(config)
            .await
            .map_err(|e| ChainError::Confirmation(e.to_string()))?;

        let tx_hash = watcher
            .await
            .map_err(|e| ChainError::Confirmation(e.to_string()))?;

        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| ChainError::Confirmation(e.to_string()))?
            .ok_or(ChainError::ReceiptMissing(tx_hash))?;

        if !ReceiptResponse::status(&receipt) {
            return Err(ChainError::Reverted(tx_hash));
        }

        Ok(TransferReceipt {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
        })
    }
}
