//! Error types for gateway operations.

use thiserror::Error;

use crate::types::{ForeignChain, WithdrawalReceipt};

/// Errors that can occur while resolving gateways, building withdrawal
/// proofs, polling receipts or reconciling history.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No adapter was added for the requested key.
    #[error("no gateway configured for {symbol} on {}", .chain.map(|c| c.as_str()).unwrap_or("ethereum"))]
    NotConfigured {
        chain: Option<ForeignChain>,
        symbol: String,
    },

    /// Token kind has no withdrawal prefix (or is not a known kind at all).
    #[error("unknown token kind: {0}")]
    UnknownTokenKind(u32),

    /// Signature blob cannot be split into single signatures.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// Fewer validator signatures than the caller requires.
    #[error("not enough validator signatures: have {have}, need {need}")]
    NoQuorum { have: usize, need: usize },

    /// Receipt token contract disagrees with the adapter's token contract.
    #[error("receipt token contract {actual} differs from adapter token contract {expected}")]
    ReceiptMismatch { expected: String, actual: String },

    /// Network/RPC failure while fetching a receipt or event logs.
    #[error("transient fetch failure: {0}")]
    TransientFetchFailure(String),

    /// An unconsumed receipt already exists for the account.
    #[error("a withdrawal is already outstanding for {} (ongoing: {ongoing})", .receipt.token_owner)]
    WithdrawalConflict {
        receipt: Box<WithdrawalReceipt>,
        ongoing: bool,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// ABI / packed encoding error.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Contract call reverted or returned unexpected data.
    #[error("contract error: {0}")]
    Contract(String),

    /// RPC transport error.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Token address or symbol unknown to the metadata service.
    #[error("unknown token: {0}")]
    UnknownToken(String),

    /// Operation not available on this gateway.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Errors that polling treats as "still pending" and history treats as
    /// isolated to one stream.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFetchFailure(_) | Self::Rpc(_))
    }

    /// Shorthand for a `NotConfigured` error.
    pub fn not_configured(chain: Option<ForeignChain>, symbol: impl Into<String>) -> Self {
        Self::NotConfigured {
            chain,
            symbol: symbol.into(),
        }
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::TransientFetchFailure("timeout".into()).is_transient());
        assert!(GatewayError::Rpc("502".into()).is_transient());
        assert!(!GatewayError::UnknownTokenKind(9).is_transient());
        assert!(!GatewayError::MalformedSignature("len 1".into()).is_transient());
    }

    #[test]
    fn test_not_configured_message() {
        let err = GatewayError::not_configured(Some(ForeignChain::Binance), "BNB");
        assert_eq!(err.to_string(), "no gateway configured for BNB on binance");

        let err = GatewayError::not_configured(None, "DAI");
        assert_eq!(err.to_string(), "no gateway configured for DAI on ethereum");
    }
}
