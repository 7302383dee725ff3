//! Session configuration.

use std::env;
use std::time::Duration;

use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::types::parse_address;

/// Default receipt poll period.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;

/// Confirmations after which a withdrawal on the origin chain is settled.
pub const DEFAULT_WITHDRAWAL_CONFIRMATIONS: u64 = 10;

/// Which Ethereum gateways were deployed with a validator manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigConfig {
    pub main: bool,
    pub loom: bool,
}

impl MultisigConfig {
    pub fn any(&self) -> bool {
        self.main || self.loom
    }
}

/// Gateway session configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Main Ethereum gateway (native coin and ERC20 tokens).
    pub main_gateway: Address,
    /// Dedicated Ethereum gateway of the sidechain coin.
    pub loom_gateway: Address,
    pub multisig: MultisigConfig,
    /// Receipt poll period in milliseconds.
    pub poll_interval_ms: u64,
    /// Give up polling after this many consecutive transient failures.
    /// `None` keeps polling.
    pub max_consecutive_poll_failures: Option<u32>,
    pub withdrawal_confirmations: u64,
    /// Chain id used to qualify Ethereum addresses on the sidechain.
    pub ethereum_chain_id: String,
    /// Chain id of the sidechain itself.
    pub plasma_chain_id: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            main_gateway: Address::zero(),
            loom_gateway: Address::zero(),
            multisig: MultisigConfig::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_consecutive_poll_failures: None,
            withdrawal_confirmations: DEFAULT_WITHDRAWAL_CONFIRMATIONS,
            ethereum_chain_id: "eth".to_string(),
            plasma_chain_id: "default".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> GatewayResult<Self> {
        let defaults = Self::default();

        let main_gateway = parse_address(&required("MAIN_GATEWAY_ADDRESS")?)?;
        let loom_gateway = parse_address(&required("LOOM_GATEWAY_ADDRESS")?)?;

        let multisig = MultisigConfig {
            main: optional_parsed("MAIN_GATEWAY_MULTISIG")?.unwrap_or(false),
            loom: optional_parsed("LOOM_GATEWAY_MULTISIG")?.unwrap_or(false),
        };

        let config = Self {
            main_gateway,
            loom_gateway,
            multisig,
            poll_interval_ms: optional_parsed("RECEIPT_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval_ms),
            max_consecutive_poll_failures: optional_parsed("RECEIPT_POLL_MAX_FAILURES")?,
            withdrawal_confirmations: optional_parsed("WITHDRAWAL_CONFIRMATIONS")?
                .unwrap_or(defaults.withdrawal_confirmations),
            ethereum_chain_id: env::var("ETHEREUM_CHAIN_ID").unwrap_or(defaults.ethereum_chain_id),
            plasma_chain_id: env::var("PLASMA_CHAIN_ID").unwrap_or(defaults.plasma_chain_id),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(GatewayError::Config("poll interval must be positive".into()));
        }
        if !self.main_gateway.is_zero() && self.main_gateway == self.loom_gateway {
            return Err(GatewayError::Config(
                "main and loom gateways must be different contracts".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn required(key: &str) -> GatewayResult<String> {
    env::var(key).map_err(|_| GatewayError::Config(format!("{key} must be set")))
}

fn optional_parsed<T: std::str::FromStr>(key: &str) -> GatewayResult<Option<T>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| GatewayError::Config(format!("{key} has invalid value {value:?}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.withdrawal_confirmations, 10);
        assert!(config.max_consecutive_poll_failures.is_none());
        assert!(!config.multisig.any());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = GatewayConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));

        let config = GatewayConfig {
            main_gateway: Address::repeat_byte(1),
            loom_gateway: Address::repeat_byte(1),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = GatewayConfig {
            main_gateway: Address::repeat_byte(1),
            loom_gateway: Address::repeat_byte(2),
            multisig: MultisigConfig { main: true, loom: false },
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.main_gateway, config.main_gateway);
        assert_eq!(parsed.multisig, config.multisig);
    }

    #[test]
    fn test_from_env() {
        // Single test touching the process environment.
        env::set_var("MAIN_GATEWAY_ADDRESS", "0x0101010101010101010101010101010101010101");
        env::set_var("LOOM_GATEWAY_ADDRESS", "0x0202020202020202020202020202020202020202");
        env::set_var("MAIN_GATEWAY_MULTISIG", "true");
        env::set_var("RECEIPT_POLL_INTERVAL_MS", "500");
        env::set_var("RECEIPT_POLL_MAX_FAILURES", "4");

        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.main_gateway, Address::repeat_byte(1));
        assert_eq!(config.loom_gateway, Address::repeat_byte(2));
        assert!(config.multisig.main);
        assert!(!config.multisig.loom);
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.max_consecutive_poll_failures, Some(4));

        env::set_var("RECEIPT_POLL_MAX_FAILURES", "many");
        assert!(matches!(GatewayConfig::from_env(), Err(GatewayError::Config(_))));

        for key in [
            "MAIN_GATEWAY_ADDRESS",
            "LOOM_GATEWAY_ADDRESS",
            "MAIN_GATEWAY_MULTISIG",
            "RECEIPT_POLL_INTERVAL_MS",
            "RECEIPT_POLL_MAX_FAILURES",
        ] {
            env::remove_var(key);
        }
        assert!(matches!(GatewayConfig::from_env(), Err(GatewayError::Config(_))));
    }
}
