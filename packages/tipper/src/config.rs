//! Configuration
//!
//! Everything is read from the environment once at startup. Secrets are
//! wrapped so they can be passed around and logged alongside the rest of the
//! config without ever being printed.

use alloy::primitives::utils::parse_ether;
use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use envconfig::Envconfig;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::chain::ConfirmationPolicy;
use crate::coordinator::CoordinatorSettings;
use crate::feed::poll::PollConfig;
use crate::feed::stream::StreamConfig;
use crate::feed::FeedMode;

/// Errors found while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envconfig::Error),

    #[error("Invalid tip amount '{0}': {1}")]
    TipAmount(String, String),

    #[error("Invalid wallet key")]
    WalletKey,

    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// A credential that never appears in logs
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    /// Access the raw value. Keep the result out of log statements.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl FromStr for Secret {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Secret(s.trim().to_string()))
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct TipperConfig {
    /// HTTP(S)/WS(S) URL or IPC socket path of the chain node
    #[envconfig(from = "TIPPER_RPC_URL")]
    pub rpc_url: String,

    /// Hex private key of the tipping wallet
    #[envconfig(from = "TIPPER_WALLET_KEY")]
    pub wallet_key: Secret,

    /// Tip size in whole native units, decimals allowed
    #[envconfig(from = "TIPPER_TIP_AMOUNT", default = "1")]
    pub tip_amount: String,

    /// Monitored account handle
    #[envconfig(from = "TIPPER_ACCOUNT", default = "ToDaMoon_Ava")]
    pub account: String,

    #[envconfig(from = "TIPPER_FEED_MODE", default = "poll")]
    pub feed_mode: FeedMode,

    #[envconfig(from = "TIPPER_POLL_INTERVAL_SECS", default = "30")]
    pub poll_interval_secs: u64,

    #[envconfig(from = "TIPPER_SEARCH_MAX_RESULTS", default = "10")]
    pub search_max_results: u32,

    #[envconfig(from = "TIPPER_SEARCH_QUERY_SUFFIX", default = "url:storyscan")]
    pub search_query_suffix: String,

    #[envconfig(from = "TIPPER_DEDUP_CAPACITY", default = "1000")]
    pub dedup_capacity: usize,

    #[envconfig(from = "TIPPER_CLEANUP_INTERVAL_SECS", default = "3600")]
    pub cleanup_interval_secs: u64,

    #[envconfig(from = "TIPPER_MAX_IN_FLIGHT", default = "4")]
    pub max_in_flight: usize,

    #[envconfig(from = "TIPPER_CONFIRMATION_TIMEOUT_SECS", default = "120")]
    pub confirmation_timeout_secs: u64,

    #[envconfig(from = "TIPPER_REQUIRED_CONFIRMATIONS", default = "1")]
    pub required_confirmations: u64,

    /// Explorer base used in reply links
    #[envconfig(from = "TIPPER_EXPLORER_URL", default = "https://aeneid.storyscan.xyz")]
    pub explorer_url: String,

    #[envconfig(from = "TIPPER_X_API_URL", default = "https://api.twitter.com")]
    pub x_api_url: String,

    /// App-only token for search and stream
    #[envconfig(from = "TIPPER_X_BEARER_TOKEN")]
    pub x_bearer_token: Secret,

    /// User-context token for posting replies
    #[envconfig(from = "TIPPER_X_USER_TOKEN")]
    pub x_user_token: Option<Secret>,

    #[envconfig(from = "TIPPER_STREAM_RULE_TAG", default = "tx_mentions")]
    pub stream_rule_tag: String,
}

impl TipperConfig {
    /// Check every derived value up front so the pipeline never starts half-configured
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tip_amount_wei()?;
        self.signer()?;

        if self.rpc_url.trim().is_empty() {
            return Err(ConfigError::Invalid("TIPPER_RPC_URL", "empty".to_string()));
        }
        if self.handle().is_empty() {
            return Err(ConfigError::Invalid("TIPPER_ACCOUNT", "empty".to_string()));
        }
        if !(10..=100).contains(&self.search_max_results) {
            return Err(ConfigError::Invalid(
                "TIPPER_SEARCH_MAX_RESULTS",
                format!("{} is outside 10..=100", self.search_max_results),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("TIPPER_POLL_INTERVAL_SECS", "must be positive".to_string()));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid("TIPPER_CLEANUP_INTERVAL_SECS", "must be positive".to_string()));
        }
        if self.dedup_capacity == 0 {
            return Err(ConfigError::Invalid("TIPPER_DEDUP_CAPACITY", "must be positive".to_string()));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid("TIPPER_MAX_IN_FLIGHT", "must be positive".to_string()));
        }
        if self.x_bearer_token.is_empty() {
            return Err(ConfigError::Invalid("TIPPER_X_BEARER_TOKEN", "empty".to_string()));
        }
        Ok(())
    }

    /// Tip amount converted to wei
    pub fn tip_amount_wei(&self) -> Result<U256, ConfigError> {
        let amount = parse_ether(self.tip_amount.trim())
            .map_err(|e| ConfigError::TipAmount(self.tip_amount.clone(), e.to_string()))?;
        if amount.is_zero() {
            return Err(ConfigError::TipAmount(self.tip_amount.clone(), "must be positive".to_string()));
        }
        Ok(amount)
    }

    /// Parse the wallet key into a signer. The key itself is never echoed back.
    pub fn signer(&self) -> Result<PrivateKeySigner, ConfigError> {
        self.wallet_key
            .expose()
            .parse::<PrivateKeySigner>()
            .map_err(|_| ConfigError::WalletKey)
    }

    /// Account handle without a leading `@`
    pub fn handle(&self) -> &str {
        self.account.trim().trim_start_matches('@')
    }

    /// Recent-search query selecting mentions of the account
    pub fn search_query(&self) -> String {
        let suffix = self.search_query_suffix.trim();
        if suffix.is_empty() {
            format!("@{}", self.handle())
        } else {
            format!("@{} {}", self.handle(), suffix)
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn confirmation_policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            timeout: Duration::from_secs(self.confirmation_timeout_secs),
            required_confirmations: self.required_confirmations,
        }
    }

    pub fn coordinator_settings(&self) -> Result<CoordinatorSettings, ConfigError> {
        Ok(CoordinatorSettings {
            tip_amount: self.tip_amount_wei()?,
            explorer_url: self.explorer_url.trim().to_string(),
            dedup_capacity: self.dedup_capacity,
            max_in_flight: self.max_in_flight,
            cleanup_interval: self.cleanup_interval(),
        })
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            query: self.search_query(),
            max_results: self.search_max_results,
            interval: self.poll_interval(),
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            rule_value: format!("@{}", self.handle()),
            rule_tag: self.stream_rule_tag.clone(),
            buffer: self.max_in_flight.max(1) * 16,
            max_batch: self.max_in_flight.max(1),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // Anvil's first dev account
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn base_env() -> HashMap<String, String> {
        HashMap::from([
            ("TIPPER_RPC_URL".to_string(), "http://127.0.0.1:8545".to_string()),
            ("TIPPER_WALLET_KEY".to_string(), DEV_KEY.to_string()),
            ("TIPPER_X_BEARER_TOKEN".to_string(), "bearer".to_string()),
        ])
    }

    fn config_from(env: &HashMap<String, String>) -> TipperConfig {
        TipperConfig::init_from_hashmap(env).unwrap()
    }

    // ==================== defaults tests ====================

    #[test]
    fn test_defaults() {
        let config = config_from(&base_env());
        assert_eq!(config.tip_amount, "1");
        assert_eq!(config.account, "ToDaMoon_Ava");
        assert_eq!(config.feed_mode, FeedMode::Poll);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.dedup_capacity, 1000);
        assert_eq!(config.cleanup_interval(), Duration::from_secs(3600));
        assert_eq!(config.search_max_results, 10);
        assert!(config.x_user_token.is_none());
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_coordinator_settings() {
        let mut env = base_env();
        env.insert("TIPPER_MAX_IN_FLIGHT".to_string(), "8".to_string());
        let settings = config_from(&env).coordinator_settings().unwrap();
        assert_eq!(settings.max_in_flight, 8);
        assert_eq!(settings.dedup_capacity, 1000);
        assert_eq!(settings.explorer_url, "https://aeneid.storyscan.xyz");
    }

    #[test]
    fn test_missing_required_key_fails() {
        let mut env = base_env();
        env.remove("TIPPER_RPC_URL");
        assert!(TipperConfig::init_from_hashmap(&env).is_err());
    }

    // ==================== derived value tests ====================

    #[test]
    fn test_tip_amount_wei_default_is_one_ether() {
        let config = config_from(&base_env());
        assert_eq!(
            config.tip_amount_wei().unwrap(),
            U256::from(1_000_000_000_000_000_000u128)
        );
    }

    #[test]
    fn test_tip_amount_fractional() {
        let mut env = base_env();
        env.insert("TIPPER_TIP_AMOUNT".to_string(), "0.5".to_string());
        let config = config_from(&env);
        assert_eq!(config.tip_amount_wei().unwrap(), U256::from(500_000_000_000_000_000u128));
    }

    #[test]
    fn test_tip_amount_invalid() {
        let mut env = base_env();
        env.insert("TIPPER_TIP_AMOUNT".to_string(), "lots".to_string());
        let config = config_from(&env);
        assert!(matches!(config.tip_amount_wei(), Err(ConfigError::TipAmount(_, _))));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tip_amount_zero_rejected() {
        let mut env = base_env();
        env.insert("TIPPER_TIP_AMOUNT".to_string(), "0".to_string());
        assert!(config_from(&env).tip_amount_wei().is_err());
    }

    #[test]
    fn test_signer_from_dev_key() {
        let config = config_from(&base_env());
        let signer = config.signer().unwrap();
        assert_eq!(
            signer.address().to_string().to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn test_invalid_wallet_key() {
        let mut env = base_env();
        env.insert("TIPPER_WALLET_KEY".to_string(), "0x1234".to_string());
        let config = config_from(&env);
        assert!(matches!(config.signer(), Err(ConfigError::WalletKey)));
    }

    #[test]
    fn test_search_query_strips_at() {
        let mut env = base_env();
        env.insert("TIPPER_ACCOUNT".to_string(), "@tipbot".to_string());
        let config = config_from(&env);
        assert_eq!(config.handle(), "tipbot");
        assert_eq!(config.search_query(), "@tipbot url:storyscan");
        assert_eq!(config.stream_config().rule_value, "@tipbot");
    }

    #[test]
    fn test_search_query_without_suffix() {
        let mut env = base_env();
        env.insert("TIPPER_SEARCH_QUERY_SUFFIX".to_string(), "".to_string());
        assert_eq!(config_from(&env).search_query(), "@ToDaMoon_Ava");
    }

    #[test]
    fn test_max_results_out_of_range() {
        let mut env = base_env();
        env.insert("TIPPER_SEARCH_MAX_RESULTS".to_string(), "5".to_string());
        assert!(matches!(
            config_from(&env).validate(),
            Err(ConfigError::Invalid("TIPPER_SEARCH_MAX_RESULTS", _))
        ));
    }

    #[test]
    fn test_zero_dedup_capacity_rejected() {
        let mut env = base_env();
        env.insert("TIPPER_DEDUP_CAPACITY".to_string(), "0".to_string());
        assert!(matches!(
            config_from(&env).validate(),
            Err(ConfigError::Invalid("TIPPER_DEDUP_CAPACITY", _))
        ));
    }

    #[test]
    fn test_zero_max_in_flight_rejected() {
        let mut env = base_env();
        env.insert("TIPPER_MAX_IN_FLIGHT".to_string(), "0".to_string());
        assert!(matches!(
            config_from(&env).validate(),
            Err(ConfigError::Invalid("TIPPER_MAX_IN_FLIGHT", _))
        ));
    }

    // ==================== Secret tests ====================

    #[test]
    fn test_secret_debug_is_redacted() {
        let config = config_from(&base_env());
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains(&DEV_KEY[2..]));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_secret_expose() {
        let secret: Secret = " token ".parse().unwrap();
        assert_eq!(secret.expose(), "token");
        assert!(!secret.is_empty());
        assert!(Secret::new("  ").is_empty());
    }
}
