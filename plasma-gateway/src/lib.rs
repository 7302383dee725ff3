//! plasma-gateway
//!
//! Deposit and withdrawal plumbing between Ethereum and a plasma sidechain.
//!
//! # Overview
//!
//! Every token crosses the bridge through a gateway contract on each side,
//! and every token has its own calling convention: the native coin is a
//! plain value transfer, ERC20 tokens go through the gateway's token entry
//! point, the sidechain coin has a dedicated gateway, and the alternate
//! (Binance) chain skips the proof round trip entirely. Gateways also come in
//! two generations: single-signer, and multisig backed by a validator
//! manager.
//!
//! # Withdrawal flow
//!
//! ```text
//!   sidechain                               Ethereum
//!   ─────────                               ────────
//!   PlasmaAdapter::withdraw ──► receipt (unsigned)
//!                               │
//!   ReceiptPoller ◄─────────────┘ every poll period
//!        │  oracle signature present
//!        ▼
//!   codec::decode_signature_bundle ──► EthereumAdapter::withdraw
//!   (multisig gateways only)              │
//!                                         ▼
//!                                  WithdrawalTracker (confirmation window)
//! ```
//!
//! [`GatewaySession`] ties the pieces together for one signer/account pair.

pub mod codec;
pub mod config;
pub mod contracts;
pub mod error;
pub mod ethereum;
pub mod evm;
pub mod history;
pub mod plasma;
pub mod poll;
pub mod services;
pub mod session;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use codec::{build_withdrawal_hash, decode_signature_bundle, withdrawal_hash, DecodedSignature};
pub use config::{GatewayConfig, MultisigConfig};
pub use contracts::{
    EthereumGatewayContract, EventQuery, GatewayEvent, GatewayLog, PlasmaGatewayContract,
    ValidatorManagerContract,
};
pub use error::{GatewayError, GatewayResult};
pub use ethereum::{EthereumAdapter, EthereumGateways, WithdrawalTracker};
pub use history::{HistoryEntry, HistoryEventType, HistoryLog, HistoryReport, TrackedToken};
pub use plasma::{PlasmaAdapter, PlasmaContracts, PlasmaGateways};
pub use poll::{PollPolicy, PollState, ReceiptPoller, ReceiptSource};
pub use services::{Feedback, StaticTokenMetadata, TokenLedger, TokenMetadata, TokenNetwork, ValueTransfer};
pub use session::{Adapter, EthereumContracts, GatewaySession, SessionServices};
pub use types::*;
