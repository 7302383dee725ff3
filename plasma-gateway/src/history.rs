//! Deposit/withdrawal history reconciled from gateway event logs.
//!
//! Every tracked token contributes two streams: its deposit event filtered on
//! the sender and `TokenWithdrawn` filtered on the owner. All streams are
//! fetched concurrently; a failing stream is logged and reported without
//! holding back the others.

use std::collections::HashSet;
use std::sync::Arc;

use ethers::types::{Address, H256, U256};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::contracts::{EthereumGatewayContract, EventQuery, GatewayEvent, GatewayLog};
use crate::error::GatewayError;
use crate::services::{TokenMetadata, TokenNetwork};
use crate::types::ETH_SYMBOL;

/// Bucket for logs whose token contract is unknown.
pub const OTHER_TOKEN: &str = "other";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryEventType {
    Deposit,
    Withdrawal,
}

impl From<GatewayEvent> for HistoryEventType {
    fn from(event: GatewayEvent) -> Self {
        if event.is_deposit() {
            Self::Deposit
        } else {
            Self::Withdrawal
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub event_type: HistoryEventType,
    pub event: GatewayEvent,
    pub token: String,
    pub decimals: Option<u8>,
    pub amount: U256,
    pub block_number: u64,
    pub transaction_hash: H256,
    pub log_index: u64,
}

/// Token whose history is reconciled, with the gateway that emits its events.
#[derive(Clone)]
pub struct TrackedToken {
    pub symbol: String,
    pub gateway: Arc<dyn EthereumGatewayContract>,
    pub deposit_event: GatewayEvent,
}

/// Stream that could not be fetched during a pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamFailure {
    pub symbol: String,
    pub event: GatewayEvent,
    pub error: String,
}

/// Outcome of one reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HistoryReport {
    pub from_block: u64,
    /// Entries added by this pass.
    pub added: usize,
    pub failures: Vec<StreamFailure>,
}

impl HistoryReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// In-memory history, newest block first.
#[derive(Debug, Default)]
pub struct HistoryLog {
    entries: Vec<HistoryEntry>,
    seen: HashSet<(H256, u64)>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest block seen so far.
    pub fn latest_block(&self) -> Option<u64> {
        self.entries.first().map(|e| e.block_number)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.seen.clear();
    }

    /// Rebuild the history from block zero.
    pub async fn refresh(
        &mut self,
        tokens: &[TrackedToken],
        account: Address,
        metadata: &dyn TokenMetadata,
    ) -> HistoryReport {
        self.clear();
        self.sync(tokens, account, metadata).await
    }

    /// Fetch everything from the latest known block (inclusive) on.
    pub async fn sync(
        &mut self,
        tokens: &[TrackedToken],
        account: Address,
        metadata: &dyn TokenMetadata,
    ) -> HistoryReport {
        let from_block = self.latest_block().unwrap_or(0);
        debug!(from_block, tokens = tokens.len(), "syncing history");

        let streams = tokens.iter().flat_map(|token| {
            [token.deposit_event, GatewayEvent::TokenWithdrawn]
                .into_iter()
                .map(move |event| fetch_stream(token, event, account, from_block))
        });
        let results = join_all(streams).await;

        let mut report = HistoryReport {
            from_block,
            ..Default::default()
        };
        for (token, event, result) in results {
            match result {
                Ok(logs) => {
                    for log in logs {
                        if self.insert(to_entry(token, log, metadata)) {
                            report.added += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(symbol = %token.symbol, event = %event, "error loading history: {}", e);
                    report.failures.push(StreamFailure {
                        symbol: token.symbol.clone(),
                        event,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.entries.sort_by(|a, b| {
            b.block_number
                .cmp(&a.block_number)
                .then(b.log_index.cmp(&a.log_index))
        });

        info!(
            added = report.added,
            total = self.entries.len(),
            failures = report.failures.len(),
            "history synced"
        );
        report
    }

    fn insert(&mut self, entry: HistoryEntry) -> bool {
        if !self.seen.insert((entry.transaction_hash, entry.log_index)) {
            return false;
        }
        self.entries.push(entry);
        true
    }
}

async fn fetch_stream(
    token: &TrackedToken,
    event: GatewayEvent,
    account: Address,
    from_block: u64,
) -> (&TrackedToken, GatewayEvent, Result<Vec<GatewayLog>, GatewayError>) {
    let query = EventQuery {
        event,
        account,
        from_block,
    };
    let result = token.gateway.past_events(&query).await;
    (token, event, result)
}

fn to_entry(token: &TrackedToken, log: GatewayLog, metadata: &dyn TokenMetadata) -> HistoryEntry {
    let symbol = match log.token_contract {
        None => token.symbol.clone(),
        Some(contract) if contract.is_zero() => ETH_SYMBOL.to_string(),
        Some(contract) => metadata
            .address_to_token(contract, TokenNetwork::Ethereum)
            .map(|info| info.symbol)
            .unwrap_or_else(|| OTHER_TOKEN.to_string()),
    };
    HistoryEntry {
        event_type: log.event.into(),
        event: log.event,
        decimals: metadata.decimals(&symbol),
        token: symbol,
        amount: log.value,
        block_number: log.block_number,
        transaction_hash: log.transaction_hash,
        log_index: log.log_index,
    }
}
