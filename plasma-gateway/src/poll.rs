//! Receipt polling.
//!
//! After a withdrawal is accepted on the sidechain its receipt sits unsigned
//! until enough validators endorse it. [`ReceiptPoller`] re-reads the receipt
//! on a fixed period until the oracle signature shows up. Ticks are awaited
//! one after the other, so a slow read delays the next tick instead of
//! overlapping with it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{GatewayConfig, DEFAULT_POLL_INTERVAL_MS};
use crate::error::{GatewayError, GatewayResult};
use crate::types::WithdrawalReceipt;

/// Where a polled receipt is read from.
#[async_trait]
pub trait ReceiptSource: Send + Sync {
    async fn fetch_receipt(&self) -> GatewayResult<Option<WithdrawalReceipt>>;
}

/// Poll state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollState {
    NoReceipt,
    PendingUnsigned,
    /// Terminal: the signed receipt was handed to the caller.
    Signed,
    /// Terminal: cancelled or failed.
    Aborted,
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Signed | Self::Aborted)
    }
}

/// Poll period and failure tolerance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Consecutive transient failures after which polling aborts; `None`
    /// treats every transient failure as "still pending".
    pub max_consecutive_failures: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_consecutive_failures: None,
        }
    }
}

impl PollPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            max_consecutive_failures: config.max_consecutive_poll_failures,
        }
    }
}

enum Wake {
    Tick,
    Cancelled,
    Detached,
}

/// Drives one receipt slot until it is signed.
pub struct ReceiptPoller<'a, S: ReceiptSource + ?Sized> {
    source: &'a S,
    policy: PollPolicy,
    state: PollState,
    fetches: u64,
    consecutive_failures: u32,
}

impl<'a, S: ReceiptSource + ?Sized> ReceiptPoller<'a, S> {
    pub fn new(source: &'a S, policy: PollPolicy) -> Self {
        Self {
            source,
            policy,
            state: PollState::NoReceipt,
            fetches: 0,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// Receipt reads issued so far.
    pub fn fetches(&self) -> u64 {
        self.fetches
    }

    /// Poll until a signed receipt is observed.
    pub async fn poll_until_signed(&mut self) -> GatewayResult<WithdrawalReceipt> {
        match self.run(None).await? {
            Some(receipt) => Ok(receipt),
            None => Err(GatewayError::Unsupported("receipt poll ended without a receipt".into())),
        }
    }

    /// Poll until a signed receipt is observed or `shutdown` turns true.
    ///
    /// Returns `Ok(None)` on cancellation. Dropping the sender leaves the
    /// poll running.
    pub async fn poll_until_cancelled(
        &mut self,
        shutdown: watch::Receiver<bool>,
    ) -> GatewayResult<Option<WithdrawalReceipt>> {
        self.run(Some(shutdown)).await
    }

    async fn run(
        &mut self,
        mut shutdown: Option<watch::Receiver<bool>>,
    ) -> GatewayResult<Option<WithdrawalReceipt>> {
        if self.state.is_terminal() {
            return Err(GatewayError::Unsupported(format!(
                "receipt poll already finished ({:?})",
                self.state
            )));
        }

        let period = self.policy.interval;
        if period.is_zero() {
            return Err(GatewayError::Config("poll interval must be positive".into()));
        }
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = period.as_millis() as u64, "polling for signed receipt");

        loop {
            let wake = match shutdown.as_mut() {
                Some(rx) if *rx.borrow() => Wake::Cancelled,
                Some(rx) => tokio::select! {
                    biased;
                    changed = rx.changed() => match changed {
                        Ok(()) if *rx.borrow() => Wake::Cancelled,
                        Ok(()) => continue,
                        Err(_) => Wake::Detached,
                    },
                    _ = ticker.tick() => Wake::Tick,
                },
                None => {
                    ticker.tick().await;
                    Wake::Tick
                }
            };

            match wake {
                Wake::Cancelled => {
                    info!(fetches = self.fetches, "receipt poll cancelled");
                    self.state = PollState::Aborted;
                    return Ok(None);
                }
                Wake::Detached => {
                    shutdown = None;
                    continue;
                }
                Wake::Tick => {}
            }

            if let Some(receipt) = self.tick().await? {
                return Ok(Some(receipt));
            }
        }
    }

    async fn tick(&mut self) -> GatewayResult<Option<WithdrawalReceipt>> {
        self.fetches += 1;
        match self.source.fetch_receipt().await {
            Ok(Some(receipt)) if receipt.is_signed() => {
                info!(
                    owner = %receipt.token_owner,
                    fetches = self.fetches,
                    "withdrawal receipt signed"
                );
                self.state = PollState::Signed;
                Ok(Some(receipt))
            }
            Ok(found) => {
                self.consecutive_failures = 0;
                self.state = if found.is_some() {
                    PollState::PendingUnsigned
                } else {
                    PollState::NoReceipt
                };
                debug!(state = ?self.state, fetches = self.fetches, "receipt not signed yet");
                Ok(None)
            }
            Err(e) if e.is_transient() => {
                self.consecutive_failures += 1;
                match self.policy.max_consecutive_failures {
                    Some(max) if self.consecutive_failures >= max => {
                        error!(failures = self.consecutive_failures, "giving up on receipt poll: {}", e);
                        self.state = PollState::Aborted;
                        Err(e)
                    }
                    _ => {
                        warn!(failures = self.consecutive_failures, "receipt fetch failed, retrying: {}", e);
                        Ok(None)
                    }
                }
            }
            Err(e) => {
                error!("receipt poll aborted: {}", e);
                self.state = PollState::Aborted;
                Err(e)
            }
        }
    }
}
