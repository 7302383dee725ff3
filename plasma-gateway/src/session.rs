//! Per-session gateway context.
//!
//! A [`GatewaySession`] is built once per signer/account pair and owns every
//! adapter and the history cache for that session. Dropping it, or calling
//! [`GatewaySession::destroy`], releases all contract bindings, so a signer
//! change always starts from fresh adapters.

use std::sync::Arc;

use ethers::types::{Address, H256, U256};
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::codec::{self, DecodedSignature};
use crate::config::GatewayConfig;
use crate::contracts::{EthereumGatewayContract, ValidatorManagerContract};
use crate::error::{GatewayError, GatewayResult};
use crate::ethereum::{EthereumAdapter, EthereumGateways};
use crate::history::{HistoryEntry, HistoryLog, HistoryReport, TrackedToken};
use crate::plasma::{PlasmaAdapter, PlasmaContracts, PlasmaGateways};
use crate::poll::{PollPolicy, ReceiptPoller};
use crate::services::{Feedback, TokenLedger, TokenMetadata, TokenNetwork, ValueTransfer};
use crate::types::{
    AddressMapping, ChainAddress, ConfirmedTransaction, ForeignChain, Funds, PendingTransaction,
    WithdrawalReceipt, ETH_SYMBOL,
};

/// Ethereum contracts of a session.
#[derive(Clone)]
pub struct EthereumContracts {
    pub main_gateway: Arc<dyn EthereumGatewayContract>,
    pub loom_gateway: Arc<dyn EthereumGatewayContract>,
    /// Required when either gateway is multisig.
    pub validator_manager: Option<Arc<dyn ValidatorManagerContract>>,
}

/// Off-chain collaborators of a session.
#[derive(Clone)]
pub struct SessionServices {
    pub tokens: Arc<dyn TokenMetadata>,
    pub ledger: Arc<dyn TokenLedger>,
    pub transfers: Arc<dyn ValueTransfer>,
    pub feedback: Arc<dyn Feedback>,
}

/// Adapter resolved for a chain side.
#[derive(Clone)]
pub enum Adapter {
    Ethereum(Arc<EthereumAdapter>),
    Plasma(Arc<PlasmaAdapter>),
}

pub struct GatewaySession {
    config: GatewayConfig,
    mapping: AddressMapping,
    ethereum: EthereumGateways,
    plasma: PlasmaGateways,
    services: SessionServices,
    history: HistoryLog,
}

impl GatewaySession {
    pub fn new(
        config: GatewayConfig,
        mapping: AddressMapping,
        ethereum: EthereumContracts,
        plasma: PlasmaContracts,
        services: SessionServices,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let ethereum_gateway = ChainAddress::new(
            config.ethereum_chain_id.clone(),
            ethereum.main_gateway.address(),
        );
        let ethereum = EthereumGateways::new(
            ethereum.main_gateway,
            ethereum.loom_gateway,
            ethereum.validator_manager,
            config.multisig,
            Arc::clone(&services.transfers),
        )?;
        let plasma = PlasmaGateways::new(plasma, ethereum_gateway, config.plasma_chain_id.clone());

        info!(from = %mapping.from, to = %mapping.to, "gateway session started");

        Ok(Self {
            config,
            mapping,
            ethereum,
            plasma,
            services,
            history: HistoryLog::new(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn mapping(&self) -> &AddressMapping {
        &self.mapping
    }

    pub fn ethereum(&self) -> &EthereumGateways {
        &self.ethereum
    }

    pub fn plasma(&self) -> &PlasmaGateways {
        &self.plasma
    }

    /// Add the adapters `symbol` needs to move between the sidechain and
    /// `chain`. Ethereum tokens get both sides; the alternate chain only has
    /// a sidechain adapter.
    pub fn register_token(&mut self, chain: ForeignChain, symbol: &str) -> GatewayResult<()> {
        let tokens = Arc::clone(&self.services.tokens);
        if chain == ForeignChain::Ethereum {
            let token_address = match symbol {
                ETH_SYMBOL => Address::zero(),
                _ => tokens
                    .symbol_to_address(symbol, TokenNetwork::Ethereum)
                    .ok_or_else(|| GatewayError::UnknownToken(format!("{symbol} has no Ethereum address")))?,
            };
            self.ethereum.add(symbol, token_address);
        }
        self.plasma.add(chain, symbol, tokens.as_ref())?;
        Ok(())
    }

    /// Look up an adapter; `None` selects the Ethereum side.
    pub fn resolve_adapter(&self, chain: Option<ForeignChain>, symbol: &str) -> GatewayResult<Adapter> {
        match chain {
            None => self.ethereum.get(symbol).map(Adapter::Ethereum),
            Some(chain) => self.plasma.get(chain, symbol).map(Adapter::Plasma),
        }
    }

    /// Deposit straight through the adapter; allowances are the caller's
    /// concern.
    pub async fn deposit(&self, symbol: &str, amount: U256, sender: Address) -> GatewayResult<PendingTransaction> {
        self.ethereum.get(symbol)?.deposit(amount, sender).await
    }

    /// Release funds on Ethereum through the adapter for `symbol`.
    pub async fn withdraw(&self, symbol: &str, receipt: &WithdrawalReceipt) -> GatewayResult<ConfirmedTransaction> {
        self.ethereum.get(symbol)?.withdraw(receipt).await
    }

    /// Deposit from Ethereum into the gateway, approving the gateway first
    /// when the current allowance is short.
    pub async fn ethereum_deposit(
        &self,
        symbol: &str,
        amount: U256,
        sender: Address,
    ) -> GatewayResult<PendingTransaction> {
        let feedback = &self.services.feedback;
        feedback.set_task(&format!("Depositing {symbol}"));

        let result = async {
            let adapter = self.ethereum.get(symbol)?;
            if symbol != ETH_SYMBOL {
                let spender = adapter.gateway().address();
                let allowance = self
                    .services
                    .ledger
                    .allowance(TokenNetwork::Ethereum, symbol, sender, spender)
                    .await?;
                if amount > allowance {
                    feedback.set_step("Approving gateway...");
                    debug!(symbol, allowance = %allowance, amount = %amount, "approving deposit");
                    self.services
                        .ledger
                        .approve(TokenNetwork::Ethereum, symbol, spender, amount)
                        .await?;
                }
            }
            feedback.set_step("Depositing to gateway...");
            adapter.deposit(amount, sender).await
        }
        .await;

        match result {
            Ok(tx) => {
                feedback.end_task();
                feedback.show_info("Deposit submitted.");
                info!(symbol, tx = ?tx.transaction_hash, "deposit submitted");
                Ok(tx)
            }
            Err(e) => Err(self.fail("Deposit failed, please try again.", e)),
        }
    }

    /// Redeem a signed receipt on Ethereum, resolving the token from the
    /// receipt itself.
    pub async fn ethereum_withdraw(&self, receipt: &WithdrawalReceipt) -> GatewayResult<ConfirmedTransaction> {
        let feedback = &self.services.feedback;
        feedback.set_task("Withdrawing from gateway");

        let result = async {
            let symbol = self.receipt_symbol(receipt)?;
            self.withdraw(&symbol, receipt).await
        }
        .await;

        match result {
            Ok(tx) => {
                feedback.end_task();
                feedback.show_info("Withdrawal confirmed.");
                Ok(tx)
            }
            Err(e) => Err(self.fail("Withdraw failed, please try again.", e)),
        }
    }

    /// Token symbol a receipt pays out. The native coin shows up either as
    /// no contract or as the main gateway itself.
    pub fn receipt_symbol(&self, receipt: &WithdrawalReceipt) -> GatewayResult<String> {
        let contract = receipt.token_contract_local();
        if contract.is_zero() || contract == self.ethereum.main_gateway().address() {
            return Ok(ETH_SYMBOL.to_string());
        }
        self.services
            .tokens
            .address_to_token(contract, TokenNetwork::Ethereum)
            .map(|info| info.symbol)
            .ok_or_else(|| GatewayError::UnknownToken(format!("{contract:?}")))
    }

    /// Move funds from the sidechain into its gateway and, for Ethereum, wait
    /// for the signed receipt.
    ///
    /// An outstanding receipt for the account is reported as
    /// `WithdrawalConflict`, never replaced.
    pub async fn plasma_withdraw(&self, funds: &Funds) -> GatewayResult<Option<WithdrawalReceipt>> {
        let feedback = &self.services.feedback;
        feedback.set_task("withdraw");
        feedback.set_step("Checking for pre-existing receipts...");

        let adapter = self
            .plasma
            .get(funds.chain, &funds.symbol)
            .map_err(|e| self.fail("Withdraw failed, please try again.", e))?;

        let existing = adapter
            .withdrawal_receipt(&self.mapping.to)
            .await
            .map_err(|e| self.fail("Withdraw failed, please try again.", e))?;

        if let Some(receipt) = existing {
            return Err(self.withdrawal_conflict(funds.chain, receipt).await);
        }

        let result = async {
            adapter.check_recipient(funds.recipient.as_ref())?;
            let spender = adapter.gateway().address().local;
            self.services
                .ledger
                .approve(TokenNetwork::Plasma, &funds.symbol, spender, funds.amount)
                .await?;

            feedback.set_step("Depositing to Plasmachain Gateway...");
            adapter.withdraw(funds.amount, funds.recipient.as_ref()).await?;

            if !adapter.needs_receipt() {
                return Ok(None);
            }

            feedback.set_step("Awaiting Oracle signature...");
            let source = adapter.receipts_for(self.mapping.to.clone());
            let mut poller = ReceiptPoller::new(&source, PollPolicy::from_config(&self.config));
            poller.poll_until_signed().await.map(Some)
        }
        .await;

        match result {
            Ok(receipt) => {
                feedback.end_task();
                if receipt.is_none() {
                    feedback.show_info(&format!(
                        "Withdrawal request sent. Your {} account will receive the funds in a moment.",
                        funds.chain
                    ));
                }
                Ok(receipt)
            }
            Err(e) => Err(self.fail("Withdraw failed, please try again.", e)),
        }
    }

    async fn withdrawal_conflict(&self, chain: ForeignChain, receipt: WithdrawalReceipt) -> GatewayError {
        let feedback = &self.services.feedback;
        feedback.end_task();

        let ongoing = match chain {
            ForeignChain::Binance => true,
            ForeignChain::Ethereum => match self.has_ongoing_withdrawal().await {
                Ok(ongoing) => ongoing,
                Err(e) => {
                    warn!("could not check the confirmation window: {}", e);
                    false
                }
            },
        };

        if ongoing {
            feedback.show_alert(
                "Withdrawal ongoing",
                "An existing withdrawal is currently being processed. Please try again later.",
            );
        } else {
            feedback.show_info("Withdrawal already in progress.");
        }
        warn!(owner = %receipt.token_owner, ongoing, "pre-existing withdrawal receipt");

        GatewayError::WithdrawalConflict {
            receipt: Box::new(receipt),
            ongoing,
        }
    }

    /// Wait for the mapped account's receipt on `(chain, symbol)` to be signed.
    pub async fn poll_for_signed_receipt(
        &self,
        chain: ForeignChain,
        symbol: &str,
    ) -> GatewayResult<WithdrawalReceipt> {
        let source = self.plasma.get(chain, symbol)?.receipts_for(self.mapping.to.clone());
        let mut poller = ReceiptPoller::new(&source, PollPolicy::from_config(&self.config));
        poller.poll_until_signed().await
    }

    /// Like [`Self::poll_for_signed_receipt`], stopping with `Ok(None)` once
    /// `shutdown` turns true.
    pub async fn poll_for_signed_receipt_until(
        &self,
        chain: ForeignChain,
        symbol: &str,
        shutdown: watch::Receiver<bool>,
    ) -> GatewayResult<Option<WithdrawalReceipt>> {
        let source = self.plasma.get(chain, symbol)?.receipts_for(self.mapping.to.clone());
        let mut poller = ReceiptPoller::new(&source, PollPolicy::from_config(&self.config));
        poller.poll_until_cancelled(shutdown).await
    }

    /// Canonical withdrawal hash against the gateway that issued the receipt.
    pub async fn build_withdrawal_hash(&self, receipt: &WithdrawalReceipt) -> GatewayResult<H256> {
        let gateway = self.ethereum.gateway_for_kind(receipt.token_kind);
        codec::build_withdrawal_hash(receipt, gateway.as_ref()).await
    }

    /// Decode the receipt's signature bundle against the live validator set.
    pub async fn decode_signature_bundle(
        &self,
        receipt: &WithdrawalReceipt,
        min_signatures: usize,
    ) -> GatewayResult<DecodedSignature> {
        let vmc = self
            .ethereum
            .validator_manager()
            .ok_or_else(|| GatewayError::Config("no validator manager configured".into()))?;
        let gateway = self.ethereum.gateway_for_kind(receipt.token_kind);
        codec::decode_signature_bundle(receipt, gateway.as_ref(), vmc.as_ref(), min_signatures).await
    }

    /// Whether the last withdrawal on Ethereum still lacks the configured
    /// number of confirmations.
    pub async fn has_ongoing_withdrawal(&self) -> GatewayResult<bool> {
        let tracker = self.ethereum.tracker();
        if tracker.latest().is_none() {
            return Ok(false);
        }
        let current = self.ethereum.main_gateway().latest_block().await?;
        Ok(tracker.is_in_confirmation_window(current, self.config.withdrawal_confirmations))
    }

    fn tracked_tokens(&self) -> Vec<TrackedToken> {
        self.ethereum
            .symbols()
            .iter()
            .map(|symbol| self.ethereum.tracked_token(symbol))
            .collect()
    }

    /// Rebuild the history of `account` for every registered Ethereum token.
    pub async fn refresh_history(&mut self, account: Address) -> HistoryReport {
        let tokens = self.tracked_tokens();
        self.history
            .refresh(&tokens, account, self.services.tokens.as_ref())
            .await
    }

    /// Fetch history of `account` newer than what is already cached.
    pub async fn sync_history(&mut self, account: Address) -> HistoryReport {
        let tokens = self.tracked_tokens();
        self.history
            .sync(&tokens, account, self.services.tokens.as_ref())
            .await
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.history.entries()
    }

    /// Positive allowances `owner` granted the gateways, per token symbol.
    pub async fn refresh_allowances(&self, owner: Address) -> GatewayResult<Vec<(String, U256)>> {
        let symbols: Vec<_> = self
            .ethereum
            .symbols()
            .into_iter()
            .filter(|symbol| symbol != ETH_SYMBOL)
            .collect();

        let reads = symbols.iter().map(|symbol| async move {
            let spender = self.ethereum.gateway_for(symbol).address();
            let amount = self
                .services
                .ledger
                .allowance(TokenNetwork::Ethereum, symbol, owner, spender)
                .await?;
            Ok::<_, GatewayError>((symbol.clone(), amount))
        });

        let mut allowances = Vec::new();
        for result in join_all(reads).await {
            let (symbol, amount) = result?;
            if !amount.is_zero() {
                allowances.push((symbol, amount));
            }
        }
        debug!(count = allowances.len(), "allowances refreshed");
        Ok(allowances)
    }

    /// Drop every adapter and the cached history.
    pub fn destroy(&mut self) {
        self.ethereum.destroy();
        self.plasma.destroy();
        self.history.clear();
        info!("gateway session destroyed");
    }

    fn fail(&self, message: &str, e: GatewayError) -> GatewayError {
        error!("{}: {}", message, e);
        self.services.feedback.end_task();
        self.services.feedback.show_error(message);
        e
    }
}
