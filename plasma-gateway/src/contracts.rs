//! On-chain collaborators.
//!
//! The session never talks to a node directly; every contract it needs is
//! reached through one of these traits. `crate::evm` implements the Ethereum
//! side on top of `ethers`.

use std::fmt;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

use crate::codec::DecodedSignature;
use crate::error::{GatewayError, GatewayResult};
use crate::types::{ChainAddress, ConfirmedTransaction, PendingTransaction, WithdrawalReceipt};

/// Events emitted by the Ethereum gateways that the history tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatewayEvent {
    /// `ETHReceived(address from, uint256 amount)`
    EthReceived,
    /// `ERC20Received(address from, uint256 amount, address contractAddress)`
    Erc20Received,
    /// `LoomCoinReceived(address from, uint256 amount, address loomCoinAddress)`
    LoomCoinReceived,
    /// `TokenWithdrawn(address owner, uint8 kind, address contractAddress, uint256 value)`
    TokenWithdrawn,
}

impl GatewayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::EthReceived => "ETHReceived",
            Self::Erc20Received => "ERC20Received",
            Self::LoomCoinReceived => "LoomCoinReceived",
            Self::TokenWithdrawn => "TokenWithdrawn",
        }
    }

    /// Solidity event signature, hashed into `topic0`.
    pub fn signature(&self) -> &'static str {
        match self {
            Self::EthReceived => "ETHReceived(address,uint256)",
            Self::Erc20Received => "ERC20Received(address,uint256,address)",
            Self::LoomCoinReceived => "LoomCoinReceived(address,uint256,address)",
            Self::TokenWithdrawn => "TokenWithdrawn(address,uint8,address,uint256)",
        }
    }

    pub fn is_deposit(&self) -> bool {
        !matches!(self, Self::TokenWithdrawn)
    }
}

impl fmt::Display for GatewayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Log query: one event, filtered on the sender (deposits) or owner
/// (withdrawals), from `from_block` inclusive to the latest block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventQuery {
    pub event: GatewayEvent,
    pub account: Address,
    pub from_block: u64,
}

/// Decoded gateway log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayLog {
    pub event: GatewayEvent,
    pub block_number: u64,
    pub transaction_hash: H256,
    pub log_index: u64,
    /// `from` for deposits, `owner` for withdrawals.
    pub account: Address,
    /// Token contract named in the log, when the event carries one.
    pub token_contract: Option<Address>,
    /// `amount` for deposits, `value` for withdrawals.
    pub value: U256,
}

/// Gateway contract on the Ethereum side.
#[async_trait]
pub trait EthereumGatewayContract: Send + Sync {
    /// Contract address.
    fn address(&self) -> Address;

    /// Latest block number of the chain the gateway lives on.
    async fn latest_block(&self) -> GatewayResult<u64>;

    /// Withdrawal nonce of `owner` at the latest confirmed block.
    async fn nonce(&self, owner: Address) -> GatewayResult<U256>;

    /// Deposit `amount` of the ERC20 `token` (allowance must already cover it).
    async fn deposit_erc20(&self, amount: U256, token: Address) -> GatewayResult<PendingTransaction>;

    /// Release funds for a signed receipt.
    ///
    /// Multisig gateways take the decoded bundle; single-signer gateways get
    /// `None` and forward the raw oracle signature.
    async fn withdraw(
        &self,
        receipt: &WithdrawalReceipt,
        signature: Option<&DecodedSignature>,
    ) -> GatewayResult<ConfirmedTransaction>;

    /// Fetch past events matching `query`.
    async fn past_events(&self, query: &EventQuery) -> GatewayResult<Vec<GatewayLog>>;
}

/// Validator manager contract of a multisig gateway.
#[async_trait]
pub trait ValidatorManagerContract: Send + Sync {
    fn address(&self) -> Address;

    /// Current validator set, in on-chain index order.
    async fn validators(&self) -> GatewayResult<Vec<Address>>;
}

/// Transfer gateway contract on the sidechain.
///
/// The main, sidechain-coin and alternate-chain gateways share the receipt
/// read but each supports only its own withdraw entry point; the defaults
/// reject the others.
#[async_trait]
pub trait PlasmaGatewayContract: Send + Sync {
    fn address(&self) -> ChainAddress;

    /// Outstanding receipt stored for `owner`, if any.
    async fn withdrawal_receipt(&self, owner: &ChainAddress) -> GatewayResult<Option<WithdrawalReceipt>>;

    async fn withdraw_eth(&self, amount: U256, ethereum_gateway: &ChainAddress) -> GatewayResult<()> {
        let _ = (amount, ethereum_gateway);
        Err(GatewayError::Unsupported(format!(
            "withdraw_eth on {}",
            self.address()
        )))
    }

    async fn withdraw_erc20(&self, amount: U256, token: &ChainAddress) -> GatewayResult<()> {
        let _ = (amount, token);
        Err(GatewayError::Unsupported(format!(
            "withdraw_erc20 on {}",
            self.address()
        )))
    }

    async fn withdraw_loom_coin(&self, amount: U256, ethereum_token: &ChainAddress) -> GatewayResult<()> {
        let _ = (amount, ethereum_token);
        Err(GatewayError::Unsupported(format!(
            "withdraw_loom_coin on {}",
            self.address()
        )))
    }

    async fn withdraw_token(
        &self,
        amount: U256,
        token: &ChainAddress,
        recipient: &ChainAddress,
    ) -> GatewayResult<()> {
        let _ = (amount, token, recipient);
        Err(GatewayError::Unsupported(format!(
            "withdraw_token on {}",
            self.address()
        )))
    }
}
