//! Ethereum-side gateway adapters and their registry.
//!
//! Each token has its own deposit/withdraw calling convention (and the
//! sidechain coin its own gateway contract). [`EthereumAdapter`] makes those
//! uniform; [`EthereumGateways`] picks and caches the right one per symbol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ethers::types::{Address, U256};
use tracing::{debug, info, warn};

use crate::codec::decode_signature_bundle;
use crate::config::MultisigConfig;
use crate::contracts::{EthereumGatewayContract, GatewayEvent, ValidatorManagerContract};
use crate::error::{GatewayError, GatewayResult};
use crate::history::TrackedToken;
use crate::services::ValueTransfer;
use crate::types::{
    ConfirmedTransaction, PendingTransaction, TokenKind, WithdrawalReceipt, ETH_SYMBOL, LOOM_SYMBOL,
};

/// Block of the most recent confirmed withdrawal on the origin chain.
#[derive(Debug, Default)]
pub struct WithdrawalTracker {
    latest: AtomicU64,
}

impl WithdrawalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, block: u64) {
        self.latest.fetch_max(block, Ordering::SeqCst);
    }

    pub fn latest(&self) -> Option<u64> {
        match self.latest.load(Ordering::SeqCst) {
            0 => None,
            block => Some(block),
        }
    }

    /// Whether the last withdrawal still lacks `confirmations` blocks.
    pub fn is_in_confirmation_window(&self, current_block: u64, confirmations: u64) -> bool {
        self.latest()
            .map(|latest| current_block < latest.saturating_add(confirmations))
            .unwrap_or(false)
    }
}

/// Native coin: deposits are plain value transfers to the gateway.
pub struct NativeCoinAdapter {
    gateway: Arc<dyn EthereumGatewayContract>,
    validator_manager: Option<Arc<dyn ValidatorManagerContract>>,
    transfers: Arc<dyn ValueTransfer>,
    tracker: Arc<WithdrawalTracker>,
}

/// ERC20 tokens and the sidechain coin: deposits go through the gateway's
/// token entry point.
pub struct FungibleTokenAdapter {
    symbol: String,
    kind: TokenKind,
    token_address: Address,
    gateway: Arc<dyn EthereumGatewayContract>,
    validator_manager: Option<Arc<dyn ValidatorManagerContract>>,
    tracker: Arc<WithdrawalTracker>,
}

/// Adapter over one Ethereum gateway for one token.
pub enum EthereumAdapter {
    Native(NativeCoinAdapter),
    Fungible(FungibleTokenAdapter),
}

impl EthereumAdapter {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Native(_) => ETH_SYMBOL,
            Self::Fungible(adapter) => &adapter.symbol,
        }
    }

    pub fn token_kind(&self) -> TokenKind {
        match self {
            Self::Native(_) => TokenKind::Eth,
            Self::Fungible(adapter) => adapter.kind,
        }
    }

    /// Token contract, zero for the native coin.
    pub fn token_address(&self) -> Address {
        match self {
            Self::Native(_) => Address::zero(),
            Self::Fungible(adapter) => adapter.token_address,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn EthereumGatewayContract> {
        match self {
            Self::Native(adapter) => &adapter.gateway,
            Self::Fungible(adapter) => &adapter.gateway,
        }
    }

    pub fn validator_manager(&self) -> Option<&Arc<dyn ValidatorManagerContract>> {
        match self {
            Self::Native(adapter) => adapter.validator_manager.as_ref(),
            Self::Fungible(adapter) => adapter.validator_manager.as_ref(),
        }
    }

    fn tracker(&self) -> &WithdrawalTracker {
        match self {
            Self::Native(adapter) => &adapter.tracker,
            Self::Fungible(adapter) => &adapter.tracker,
        }
    }

    /// Deposit `amount` from `sender` into the gateway.
    pub async fn deposit(&self, amount: U256, sender: Address) -> GatewayResult<PendingTransaction> {
        match self {
            Self::Native(adapter) => {
                let to = adapter.gateway.address();
                debug!(from = ?sender, to = ?to, value = %amount, "ETH deposit");
                adapter.transfers.send_value(sender, to, amount).await
            }
            Self::Fungible(adapter) => {
                debug!(symbol = %adapter.symbol, amount = %amount, "token deposit");
                adapter
                    .gateway
                    .deposit_erc20(amount, adapter.token_address)
                    .await
            }
        }
    }

    /// Release funds on Ethereum for a signed receipt and record the
    /// confirming block.
    pub async fn withdraw(&self, receipt: &WithdrawalReceipt) -> GatewayResult<ConfirmedTransaction> {
        if let Self::Fungible(adapter) = self {
            adapter.check_receipt_contract(receipt);
        }

        let gateway = self.gateway().as_ref();
        let tx = match self.validator_manager() {
            Some(vmc) => {
                let signature = decode_signature_bundle(receipt, gateway, vmc.as_ref(), 1).await?;
                gateway.withdraw(receipt, Some(&signature)).await?
            }
            None => gateway.withdraw(receipt, None).await?,
        };

        self.tracker().record(tx.block_number);
        info!(
            symbol = %self.symbol(),
            tx = ?tx.transaction_hash,
            block = tx.block_number,
            "withdrawal confirmed"
        );
        Ok(tx)
    }
}

impl FungibleTokenAdapter {
    /// Consistency check only; a mismatch is logged, never fatal. The
    /// sidechain coin is exempt because its receipts account differently.
    fn check_receipt_contract(&self, receipt: &WithdrawalReceipt) {
        if receipt.token_kind == TokenKind::LoomCoin {
            return;
        }
        let actual = receipt.token_contract_local();
        if actual != self.token_address {
            let mismatch = GatewayError::ReceiptMismatch {
                expected: format!("{:?}", self.token_address),
                actual: format!("{:?}", actual),
            };
            warn!(symbol = %self.symbol, "{}", mismatch);
        }
    }
}

/// Registry of Ethereum adapters, one per symbol for the session's lifetime.
pub struct EthereumGateways {
    main_gateway: Arc<dyn EthereumGatewayContract>,
    loom_gateway: Arc<dyn EthereumGatewayContract>,
    validator_manager: Option<Arc<dyn ValidatorManagerContract>>,
    multisig: MultisigConfig,
    transfers: Arc<dyn ValueTransfer>,
    tracker: Arc<WithdrawalTracker>,
    adapters: HashMap<String, Arc<EthereumAdapter>>,
}

impl EthereumGateways {
    /// A multisig deployment must come with its validator manager; a
    /// single-signer deployment never gets one attached.
    pub fn new(
        main_gateway: Arc<dyn EthereumGatewayContract>,
        loom_gateway: Arc<dyn EthereumGatewayContract>,
        validator_manager: Option<Arc<dyn ValidatorManagerContract>>,
        multisig: MultisigConfig,
        transfers: Arc<dyn ValueTransfer>,
    ) -> GatewayResult<Self> {
        let validator_manager = match (multisig.any(), validator_manager) {
            (true, None) => {
                return Err(GatewayError::Config(
                    "multisig gateway configured without a validator manager".into(),
                ))
            }
            (false, Some(vmc)) => {
                debug!(vmc = ?vmc.address(), "single-signer gateways; validator manager unused");
                None
            }
            (_, vmc) => vmc,
        };

        info!(
            main = ?main_gateway.address(),
            loom = ?loom_gateway.address(),
            multisig_main = multisig.main,
            multisig_loom = multisig.loom,
            "ethereum gateways initialized"
        );

        Ok(Self {
            main_gateway,
            loom_gateway,
            validator_manager,
            multisig,
            transfers,
            tracker: Arc::new(WithdrawalTracker::new()),
            adapters: HashMap::new(),
        })
    }

    pub fn main_gateway(&self) -> &Arc<dyn EthereumGatewayContract> {
        &self.main_gateway
    }

    pub fn loom_gateway(&self) -> &Arc<dyn EthereumGatewayContract> {
        &self.loom_gateway
    }

    pub fn validator_manager(&self) -> Option<&Arc<dyn ValidatorManagerContract>> {
        self.validator_manager.as_ref()
    }

    pub fn tracker(&self) -> &Arc<WithdrawalTracker> {
        &self.tracker
    }

    /// Gateway contract that serves `symbol`.
    pub fn gateway_for(&self, symbol: &str) -> &Arc<dyn EthereumGatewayContract> {
        match symbol {
            LOOM_SYMBOL => &self.loom_gateway,
            _ => &self.main_gateway,
        }
    }

    /// Gateway contract that issued receipts of `kind`.
    pub fn gateway_for_kind(&self, kind: TokenKind) -> &Arc<dyn EthereumGatewayContract> {
        match kind {
            TokenKind::LoomCoin => &self.loom_gateway,
            _ => &self.main_gateway,
        }
    }

    fn vmc_if(&self, multisig: bool) -> Option<Arc<dyn ValidatorManagerContract>> {
        if multisig {
            self.validator_manager.clone()
        } else {
            None
        }
    }

    /// Return the adapter for `symbol`, constructing it on first use.
    ///
    /// An existing adapter is returned as is; use [`Self::invalidate`] to
    /// rebind.
    pub fn add(&mut self, symbol: &str, token_address: Address) -> Arc<EthereumAdapter> {
        if let Some(existing) = self.adapters.get(symbol) {
            warn!(symbol, "token gateway adapter already set");
            return Arc::clone(existing);
        }

        let adapter = match symbol {
            ETH_SYMBOL => EthereumAdapter::Native(NativeCoinAdapter {
                gateway: Arc::clone(&self.main_gateway),
                validator_manager: self.vmc_if(self.multisig.main),
                transfers: Arc::clone(&self.transfers),
                tracker: Arc::clone(&self.tracker),
            }),
            LOOM_SYMBOL => EthereumAdapter::Fungible(FungibleTokenAdapter {
                symbol: symbol.to_string(),
                kind: TokenKind::LoomCoin,
                token_address,
                gateway: Arc::clone(&self.loom_gateway),
                validator_manager: self.vmc_if(self.multisig.loom),
                tracker: Arc::clone(&self.tracker),
            }),
            _ => EthereumAdapter::Fungible(FungibleTokenAdapter {
                symbol: symbol.to_string(),
                kind: TokenKind::Erc20,
                token_address,
                gateway: Arc::clone(&self.main_gateway),
                validator_manager: self.vmc_if(self.multisig.main),
                tracker: Arc::clone(&self.tracker),
            }),
        };

        debug!(symbol, token = ?token_address, "ethereum adapter added");
        let adapter = Arc::new(adapter);
        self.adapters.insert(symbol.to_string(), Arc::clone(&adapter));
        adapter
    }

    pub fn get(&self, symbol: &str) -> GatewayResult<Arc<EthereumAdapter>> {
        self.adapters
            .get(symbol)
            .cloned()
            .ok_or_else(|| GatewayError::not_configured(None, symbol))
    }

    /// Drop the adapter for `symbol` so the next `add` rebuilds it.
    pub fn invalidate(&mut self, symbol: &str) -> Option<Arc<EthereumAdapter>> {
        self.adapters.remove(symbol)
    }

    /// Drop every cached adapter.
    pub fn destroy(&mut self) {
        self.adapters.clear();
    }

    /// Symbols with an adapter, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<_> = self.adapters.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// History streams for `symbol`: the deposit event its gateway emits plus
    /// withdrawals on the same gateway.
    pub fn tracked_token(&self, symbol: &str) -> TrackedToken {
        let deposit_event = match symbol {
            ETH_SYMBOL => GatewayEvent::EthReceived,
            LOOM_SYMBOL => GatewayEvent::LoomCoinReceived,
            _ => GatewayEvent::Erc20Received,
        };
        TrackedToken {
            symbol: symbol.to_string(),
            gateway: Arc::clone(self.gateway_for(symbol)),
            deposit_event,
        }
    }
}
