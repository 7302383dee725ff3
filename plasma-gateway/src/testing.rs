//! In-memory fakes of the contract and service traits.
//!
//! Compiled for unit tests and, with the `test-utils` feature, for the
//! integration suites.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256, U256};

use crate::codec::DecodedSignature;
use crate::contracts::{
    EthereumGatewayContract, EventQuery, GatewayEvent, GatewayLog, PlasmaGatewayContract,
    ValidatorManagerContract,
};
use crate::error::{GatewayError, GatewayResult};
use crate::poll::ReceiptSource;
use crate::services::{Feedback, TokenLedger, TokenNetwork, ValueTransfer};
use crate::types::{ChainAddress, ConfirmedTransaction, PendingTransaction, WithdrawalReceipt};

/// Deterministic wallet whose private key is `seed` as a 256-bit integer.
pub fn test_wallet(seed: u8) -> LocalWallet {
    format!("{:064x}", seed)
        .parse::<LocalWallet>()
        .expect("valid test key")
}

/// Sign `hash` the way validators do and return the 65-byte signature.
pub async fn sign_hash(wallet: &LocalWallet, hash: H256) -> Vec<u8> {
    wallet
        .sign_message(hash.as_bytes())
        .await
        .expect("signing succeeds")
        .to_vec()
}

fn tx_hash(n: u64) -> H256 {
    H256::from_low_u64_be(n)
}

/// Ethereum gateway keeping nonces, deposits, withdrawals and logs in memory.
#[derive(Debug)]
pub struct FakeEthereumGateway {
    address: Address,
    nonces: Mutex<HashMap<Address, U256>>,
    nonce_reads: AtomicUsize,
    block: AtomicU64,
    deposits: Mutex<Vec<(U256, Address)>>,
    withdrawals: Mutex<Vec<(WithdrawalReceipt, Option<DecodedSignature>)>>,
    logs: Mutex<Vec<GatewayLog>>,
    failing_events: Mutex<HashSet<GatewayEvent>>,
    queries: Mutex<Vec<EventQuery>>,
}

impl FakeEthereumGateway {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            nonces: Mutex::new(HashMap::new()),
            nonce_reads: AtomicUsize::new(0),
            block: AtomicU64::new(100),
            deposits: Mutex::new(Vec::new()),
            withdrawals: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
            failing_events: Mutex::new(HashSet::new()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn set_nonce(&self, owner: Address, nonce: U256) {
        self.nonces.lock().unwrap().insert(owner, nonce);
    }

    pub fn nonce_reads(&self) -> usize {
        self.nonce_reads.load(Ordering::SeqCst)
    }

    pub fn set_block(&self, block: u64) {
        self.block.store(block, Ordering::SeqCst);
    }

    pub fn deposits(&self) -> Vec<(U256, Address)> {
        self.deposits.lock().unwrap().clone()
    }

    pub fn withdrawals(&self) -> Vec<(WithdrawalReceipt, Option<DecodedSignature>)> {
        self.withdrawals.lock().unwrap().clone()
    }

    pub fn push_log(&self, log: GatewayLog) {
        self.logs.lock().unwrap().push(log);
    }

    /// Make every query for `event` fail with a transient error.
    pub fn fail_event(&self, event: GatewayEvent) {
        self.failing_events.lock().unwrap().insert(event);
    }

    pub fn queries(&self) -> Vec<EventQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl EthereumGatewayContract for FakeEthereumGateway {
    fn address(&self) -> Address {
        self.address
    }

    async fn latest_block(&self) -> GatewayResult<u64> {
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn nonce(&self, owner: Address) -> GatewayResult<U256> {
        self.nonce_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .nonces
            .lock()
            .unwrap()
            .get(&owner)
            .copied()
            .unwrap_or_default())
    }

    async fn deposit_erc20(&self, amount: U256, token: Address) -> GatewayResult<PendingTransaction> {
        let mut deposits = self.deposits.lock().unwrap();
        deposits.push((amount, token));
        Ok(PendingTransaction {
            transaction_hash: tx_hash(deposits.len() as u64),
        })
    }

    async fn withdraw(
        &self,
        receipt: &WithdrawalReceipt,
        signature: Option<&DecodedSignature>,
    ) -> GatewayResult<ConfirmedTransaction> {
        let block = self.block.fetch_add(1, Ordering::SeqCst) + 1;
        let mut withdrawals = self.withdrawals.lock().unwrap();
        withdrawals.push((receipt.clone(), signature.cloned()));
        Ok(ConfirmedTransaction {
            transaction_hash: tx_hash(1000 + withdrawals.len() as u64),
            block_number: block,
        })
    }

    async fn past_events(&self, query: &EventQuery) -> GatewayResult<Vec<GatewayLog>> {
        self.queries.lock().unwrap().push(query.clone());
        if self.failing_events.lock().unwrap().contains(&query.event) {
            return Err(GatewayError::TransientFetchFailure(format!(
                "{} query timed out",
                query.event
            )));
        }
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                log.event == query.event
                    && log.account == query.account
                    && log.block_number >= query.from_block
            })
            .cloned()
            .collect())
    }
}

/// Validator manager with a fixed validator set.
#[derive(Debug)]
pub struct FakeValidatorManager {
    validators: Vec<Address>,
}

impl FakeValidatorManager {
    pub fn new(validators: Vec<Address>) -> Self {
        Self { validators }
    }
}

#[async_trait]
impl ValidatorManagerContract for FakeValidatorManager {
    fn address(&self) -> Address {
        Address::repeat_byte(0x7c)
    }

    async fn validators(&self) -> GatewayResult<Vec<Address>> {
        Ok(self.validators.clone())
    }
}

/// Withdraw call observed by a [`FakePlasmaGateway`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlasmaWithdrawCall {
    Eth { amount: U256, ethereum_gateway: ChainAddress },
    Erc20 { amount: U256, token: ChainAddress },
    LoomCoin { amount: U256, ethereum_token: ChainAddress },
    Token { amount: U256, token: ChainAddress, recipient: ChainAddress },
}

/// Sidechain gateway answering receipt reads from a script.
///
/// Each read pops the next scripted response; once the script is exhausted
/// the stored receipt is returned.
#[derive(Debug)]
pub struct FakePlasmaGateway {
    address: ChainAddress,
    script: Mutex<VecDeque<GatewayResult<Option<WithdrawalReceipt>>>>,
    stored: Mutex<Option<WithdrawalReceipt>>,
    reads: AtomicUsize,
    calls: Mutex<Vec<PlasmaWithdrawCall>>,
}

impl FakePlasmaGateway {
    pub fn new(address: ChainAddress) -> Self {
        Self {
            address,
            script: Mutex::new(VecDeque::new()),
            stored: Mutex::new(None),
            reads: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, response: GatewayResult<Option<WithdrawalReceipt>>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn store(&self, receipt: Option<WithdrawalReceipt>) {
        *self.stored.lock().unwrap() = receipt;
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<PlasmaWithdrawCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: PlasmaWithdrawCall) -> GatewayResult<()> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl PlasmaGatewayContract for FakePlasmaGateway {
    fn address(&self) -> ChainAddress {
        self.address.clone()
    }

    async fn withdrawal_receipt(&self, _owner: &ChainAddress) -> GatewayResult<Option<WithdrawalReceipt>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = self.script.lock().unwrap().pop_front() {
            return response;
        }
        Ok(self.stored.lock().unwrap().clone())
    }

    async fn withdraw_eth(&self, amount: U256, ethereum_gateway: &ChainAddress) -> GatewayResult<()> {
        self.record(PlasmaWithdrawCall::Eth {
            amount,
            ethereum_gateway: ethereum_gateway.clone(),
        })
    }

    async fn withdraw_erc20(&self, amount: U256, token: &ChainAddress) -> GatewayResult<()> {
        self.record(PlasmaWithdrawCall::Erc20 {
            amount,
            token: token.clone(),
        })
    }

    async fn withdraw_loom_coin(&self, amount: U256, ethereum_token: &ChainAddress) -> GatewayResult<()> {
        self.record(PlasmaWithdrawCall::LoomCoin {
            amount,
            ethereum_token: ethereum_token.clone(),
        })
    }

    async fn withdraw_token(
        &self,
        amount: U256,
        token: &ChainAddress,
        recipient: &ChainAddress,
    ) -> GatewayResult<()> {
        self.record(PlasmaWithdrawCall::Token {
            amount,
            token: token.clone(),
            recipient: recipient.clone(),
        })
    }
}

#[async_trait]
impl ReceiptSource for FakePlasmaGateway {
    async fn fetch_receipt(&self) -> GatewayResult<Option<WithdrawalReceipt>> {
        let owner = self.address.clone();
        self.withdrawal_receipt(&owner).await
    }
}

/// Token ledger with settable allowances that records approvals.
#[derive(Debug, Default)]
pub struct FakeLedger {
    allowances: Mutex<HashMap<(TokenNetwork, String), U256>>,
    approvals: Mutex<Vec<(TokenNetwork, String, Address, U256)>>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_allowance(&self, network: TokenNetwork, symbol: &str, amount: U256) {
        self.allowances
            .lock()
            .unwrap()
            .insert((network, symbol.to_string()), amount);
    }

    pub fn approvals(&self) -> Vec<(TokenNetwork, String, Address, U256)> {
        self.approvals.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenLedger for FakeLedger {
    async fn allowance(
        &self,
        network: TokenNetwork,
        symbol: &str,
        _owner: Address,
        _spender: Address,
    ) -> GatewayResult<U256> {
        Ok(self
            .allowances
            .lock()
            .unwrap()
            .get(&(network, symbol.to_string()))
            .copied()
            .unwrap_or_default())
    }

    async fn approve(
        &self,
        network: TokenNetwork,
        symbol: &str,
        spender: Address,
        amount: U256,
    ) -> GatewayResult<PendingTransaction> {
        let mut approvals = self.approvals.lock().unwrap();
        approvals.push((network, symbol.to_string(), spender, amount));
        Ok(PendingTransaction {
            transaction_hash: tx_hash(500 + approvals.len() as u64),
        })
    }
}

/// Value transfer recorder.
#[derive(Debug, Default)]
pub struct FakeValueTransfer {
    sends: Mutex<Vec<(Address, Address, U256)>>,
}

impl FakeValueTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sends(&self) -> Vec<(Address, Address, U256)> {
        self.sends.lock().unwrap().clone()
    }
}

#[async_trait]
impl ValueTransfer for FakeValueTransfer {
    async fn send_value(&self, from: Address, to: Address, value: U256) -> GatewayResult<PendingTransaction> {
        let mut sends = self.sends.lock().unwrap();
        sends.push((from, to, value));
        Ok(PendingTransaction {
            transaction_hash: tx_hash(800 + sends.len() as u64),
        })
    }
}

/// Feedback sink recording every call as a string.
#[derive(Debug, Default)]
pub struct RecordingFeedback {
    events: Mutex<Vec<String>>,
}

impl RecordingFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl Feedback for RecordingFeedback {
    fn set_task(&self, task: &str) {
        self.push(format!("task:{task}"));
    }

    fn set_step(&self, step: &str) {
        self.push(format!("step:{step}"));
    }

    fn end_task(&self) {
        self.push("end".to_string());
    }

    fn show_info(&self, message: &str) {
        self.push(format!("info:{message}"));
    }

    fn show_error(&self, message: &str) {
        self.push(format!("error:{message}"));
    }

    fn show_alert(&self, title: &str, message: &str) {
        self.push(format!("alert:{title}:{message}"));
    }
}
