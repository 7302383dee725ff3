//! Off-chain collaborators: token metadata, token ledger, value transfers and
//! progress feedback.

use std::collections::HashMap;

use async_trait::async_trait;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::error::GatewayResult;
use crate::types::PendingTransaction;

/// Network a token address lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenNetwork {
    Ethereum,
    Plasma,
}

/// Metadata of a known token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub symbol: String,
    pub decimals: u8,
}

/// Token metadata lookups.
pub trait TokenMetadata: Send + Sync {
    fn symbol_to_address(&self, symbol: &str, network: TokenNetwork) -> Option<Address>;

    fn address_to_token(&self, address: Address, network: TokenNetwork) -> Option<TokenInfo>;

    fn decimals(&self, symbol: &str) -> Option<u8>;
}

/// ERC20 reads and approvals on behalf of the active account.
#[async_trait]
pub trait TokenLedger: Send + Sync {
    async fn allowance(
        &self,
        network: TokenNetwork,
        symbol: &str,
        owner: Address,
        spender: Address,
    ) -> GatewayResult<U256>;

    async fn approve(
        &self,
        network: TokenNetwork,
        symbol: &str,
        spender: Address,
        amount: U256,
    ) -> GatewayResult<PendingTransaction>;
}

/// Plain value transfers on the Ethereum side.
#[async_trait]
pub trait ValueTransfer: Send + Sync {
    async fn send_value(&self, from: Address, to: Address, value: U256) -> GatewayResult<PendingTransaction>;
}

/// Sink for task/step progress and user-facing notices.
pub trait Feedback: Send + Sync {
    fn set_task(&self, task: &str);
    fn set_step(&self, step: &str);
    fn end_task(&self);
    fn show_info(&self, message: &str);
    fn show_error(&self, message: &str);
    fn show_alert(&self, title: &str, message: &str);
}

/// Token table held in memory, keyed by symbol.
#[derive(Clone, Debug, Default)]
pub struct StaticTokenMetadata {
    decimals: HashMap<String, u8>,
    addresses: HashMap<(TokenNetwork, String), Address>,
}

impl StaticTokenMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token with its addresses on each network.
    pub fn with_token(
        mut self,
        symbol: impl Into<String>,
        decimals: u8,
        ethereum: Option<Address>,
        plasma: Option<Address>,
    ) -> Self {
        let symbol = symbol.into();
        if let Some(address) = ethereum {
            self.addresses
                .insert((TokenNetwork::Ethereum, symbol.clone()), address);
        }
        if let Some(address) = plasma {
            self.addresses
                .insert((TokenNetwork::Plasma, symbol.clone()), address);
        }
        self.decimals.insert(symbol, decimals);
        self
    }

    /// Symbols registered so far, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<_> = self.decimals.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

impl TokenMetadata for StaticTokenMetadata {
    fn symbol_to_address(&self, symbol: &str, network: TokenNetwork) -> Option<Address> {
        self.addresses.get(&(network, symbol.to_string())).copied()
    }

    fn address_to_token(&self, address: Address, network: TokenNetwork) -> Option<TokenInfo> {
        self.addresses
            .iter()
            .find(|((net, _), addr)| *net == network && **addr == address)
            .map(|((_, symbol), _)| TokenInfo {
                symbol: symbol.clone(),
                decimals: self.decimals.get(symbol).copied().unwrap_or(18),
            })
    }

    fn decimals(&self, symbol: &str) -> Option<u8> {
        self.decimals.get(symbol).copied()
    }
}
