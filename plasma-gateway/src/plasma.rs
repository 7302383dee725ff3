//! Sidechain-side gateway adapters and their per-chain registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, U256};
use tracing::{debug, info, warn};

use crate::contracts::PlasmaGatewayContract;
use crate::error::{GatewayError, GatewayResult};
use crate::poll::ReceiptSource;
use crate::services::{TokenMetadata, TokenNetwork};
use crate::types::{ChainAddress, ForeignChain, WithdrawalReceipt, BNB_SYMBOL, ETH_SYMBOL, LOOM_SYMBOL};

/// Adapter over one sidechain gateway for one token.
pub enum PlasmaAdapter {
    /// Native coin back to the Ethereum main gateway.
    Eth {
        gateway: Arc<dyn PlasmaGatewayContract>,
        ethereum_gateway: ChainAddress,
    },
    /// Sidechain coin through its dedicated gateway.
    LoomCoin {
        gateway: Arc<dyn PlasmaGatewayContract>,
        ethereum_token: ChainAddress,
    },
    /// Mapped ERC20 token.
    Erc20 {
        symbol: String,
        gateway: Arc<dyn PlasmaGatewayContract>,
        token: ChainAddress,
    },
    /// Alternate chain: a single call, no proof round trip.
    Binance {
        gateway: Arc<dyn PlasmaGatewayContract>,
        token: ChainAddress,
    },
}

impl PlasmaAdapter {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Eth { .. } => ETH_SYMBOL,
            Self::LoomCoin { .. } => LOOM_SYMBOL,
            Self::Erc20 { symbol, .. } => symbol,
            Self::Binance { .. } => BNB_SYMBOL,
        }
    }

    pub fn chain(&self) -> ForeignChain {
        match self {
            Self::Binance { .. } => ForeignChain::Binance,
            _ => ForeignChain::Ethereum,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn PlasmaGatewayContract> {
        match self {
            Self::Eth { gateway, .. }
            | Self::LoomCoin { gateway, .. }
            | Self::Erc20 { gateway, .. }
            | Self::Binance { gateway, .. } => gateway,
        }
    }

    /// Whether a withdrawal through this adapter ends with a signed receipt
    /// to redeem on Ethereum.
    pub fn needs_receipt(&self) -> bool {
        !matches!(self, Self::Binance { .. })
    }

    /// Recipient the gateway call will use; the alternate chain requires one.
    pub fn check_recipient<'a>(
        &self,
        recipient: Option<&'a ChainAddress>,
    ) -> GatewayResult<Option<&'a ChainAddress>> {
        match (self, recipient) {
            (Self::Binance { .. }, None) => Err(GatewayError::Config(
                "alternate-chain withdrawal needs a recipient".into(),
            )),
            _ => Ok(recipient),
        }
    }

    /// Hand `amount` to the sidechain gateway. Only the alternate chain uses
    /// `recipient`.
    pub async fn withdraw(&self, amount: U256, recipient: Option<&ChainAddress>) -> GatewayResult<()> {
        debug!(symbol = %self.symbol(), amount = %amount, "sidechain withdraw");
        match self {
            Self::Eth {
                gateway,
                ethereum_gateway,
            } => gateway.withdraw_eth(amount, ethereum_gateway).await,
            Self::LoomCoin {
                gateway,
                ethereum_token,
            } => gateway.withdraw_loom_coin(amount, ethereum_token).await,
            Self::Erc20 { gateway, token, .. } => gateway.withdraw_erc20(amount, token).await,
            Self::Binance { gateway, token } => match recipient {
                Some(recipient) => gateway.withdraw_token(amount, token, recipient).await,
                None => Err(GatewayError::Config(
                    "alternate-chain withdrawal needs a recipient".into(),
                )),
            },
        }
    }

    /// Outstanding receipt for `owner`.
    pub async fn withdrawal_receipt(&self, owner: &ChainAddress) -> GatewayResult<Option<WithdrawalReceipt>> {
        self.gateway().withdrawal_receipt(owner).await
    }

    /// Receipt source bound to `owner`, for polling.
    pub fn receipts_for(self: &Arc<Self>, owner: ChainAddress) -> AccountReceipts {
        AccountReceipts {
            adapter: Arc::clone(self),
            owner,
        }
    }
}

/// Receipt slot of one account on one sidechain gateway.
pub struct AccountReceipts {
    adapter: Arc<PlasmaAdapter>,
    owner: ChainAddress,
}

#[async_trait]
impl ReceiptSource for AccountReceipts {
    async fn fetch_receipt(&self) -> GatewayResult<Option<WithdrawalReceipt>> {
        self.adapter.withdrawal_receipt(&self.owner).await
    }
}

/// Sidechain gateway contracts adapters are built from.
#[derive(Clone)]
pub struct PlasmaContracts {
    pub main_gateway: Arc<dyn PlasmaGatewayContract>,
    pub loom_gateway: Arc<dyn PlasmaGatewayContract>,
    pub binance_gateway: Option<Arc<dyn PlasmaGatewayContract>>,
}

/// Registry of sidechain adapters keyed by destination chain and symbol.
pub struct PlasmaGateways {
    contracts: PlasmaContracts,
    /// Ethereum main gateway, the destination of native coin withdrawals.
    ethereum_gateway: ChainAddress,
    plasma_chain_id: String,
    adapters: HashMap<(ForeignChain, String), Arc<PlasmaAdapter>>,
}

impl PlasmaGateways {
    pub fn new(
        contracts: PlasmaContracts,
        ethereum_gateway: ChainAddress,
        plasma_chain_id: impl Into<String>,
    ) -> Self {
        info!(
            main = %contracts.main_gateway.address(),
            loom = %contracts.loom_gateway.address(),
            binance = contracts.binance_gateway.is_some(),
            "sidechain gateways initialized"
        );
        Self {
            contracts,
            ethereum_gateway,
            plasma_chain_id: plasma_chain_id.into(),
            adapters: HashMap::new(),
        }
    }

    /// Return the adapter for `(chain, symbol)`, constructing it on first use.
    pub fn add(
        &mut self,
        chain: ForeignChain,
        symbol: &str,
        tokens: &dyn TokenMetadata,
    ) -> GatewayResult<Arc<PlasmaAdapter>> {
        let key = (chain, symbol.to_string());
        if let Some(existing) = self.adapters.get(&key) {
            warn!(chain = %chain, symbol, "token gateway adapter already set");
            return Ok(Arc::clone(existing));
        }

        let adapter = Arc::new(self.build(chain, symbol, tokens)?);
        debug!(chain = %chain, symbol, "sidechain adapter added");
        self.adapters.insert(key, Arc::clone(&adapter));
        Ok(adapter)
    }

    fn build(
        &self,
        chain: ForeignChain,
        symbol: &str,
        tokens: &dyn TokenMetadata,
    ) -> GatewayResult<PlasmaAdapter> {
        let contracts = &self.contracts;
        let adapter = match (chain, symbol) {
            (_, ETH_SYMBOL) => PlasmaAdapter::Eth {
                gateway: Arc::clone(&contracts.main_gateway),
                ethereum_gateway: self.ethereum_gateway.clone(),
            },
            (_, LOOM_SYMBOL) => PlasmaAdapter::LoomCoin {
                gateway: Arc::clone(&contracts.loom_gateway),
                ethereum_token: ChainAddress::new(
                    self.ethereum_gateway.chain_id.clone(),
                    token_address(tokens, symbol, TokenNetwork::Ethereum)?,
                ),
            },
            (ForeignChain::Binance, BNB_SYMBOL) => {
                let gateway = contracts
                    .binance_gateway
                    .as_ref()
                    .ok_or_else(|| GatewayError::not_configured(Some(chain), symbol))?;
                PlasmaAdapter::Binance {
                    gateway: Arc::clone(gateway),
                    token: ChainAddress::new(
                        self.plasma_chain_id.clone(),
                        token_address(tokens, symbol, TokenNetwork::Plasma)?,
                    ),
                }
            }
            _ => PlasmaAdapter::Erc20 {
                symbol: symbol.to_string(),
                gateway: Arc::clone(&contracts.main_gateway),
                token: ChainAddress::new(
                    self.plasma_chain_id.clone(),
                    token_address(tokens, symbol, TokenNetwork::Plasma)?,
                ),
            },
        };
        Ok(adapter)
    }

    pub fn get(&self, chain: ForeignChain, symbol: &str) -> GatewayResult<Arc<PlasmaAdapter>> {
        self.adapters
            .get(&(chain, symbol.to_string()))
            .cloned()
            .ok_or_else(|| GatewayError::not_configured(Some(chain), symbol))
    }

    pub fn invalidate(&mut self, chain: ForeignChain, symbol: &str) -> Option<Arc<PlasmaAdapter>> {
        self.adapters.remove(&(chain, symbol.to_string()))
    }

    pub fn destroy(&mut self) {
        self.adapters.clear();
    }
}

fn token_address(tokens: &dyn TokenMetadata, symbol: &str, network: TokenNetwork) -> GatewayResult<Address> {
    tokens
        .symbol_to_address(symbol, network)
        .ok_or_else(|| GatewayError::UnknownToken(format!("{symbol} has no {network:?} address")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::StaticTokenMetadata;
    use crate::testing::{FakePlasmaGateway, PlasmaWithdrawCall};
    use crate::types::TokenKind;
    use ethers::types::Bytes;

    struct Fixture {
        main: Arc<FakePlasmaGateway>,
        loom: Arc<FakePlasmaGateway>,
        binance: Arc<FakePlasmaGateway>,
        tokens: StaticTokenMetadata,
    }

    fn plasma(byte: u8) -> ChainAddress {
        ChainAddress::new("default", Address::repeat_byte(byte))
    }

    impl Fixture {
        fn new() -> Self {
            let tokens = StaticTokenMetadata::new()
                .with_token("ETH", 18, Some(Address::zero()), Some(Address::repeat_byte(0xe0)))
                .with_token("LOOM", 18, Some(Address::repeat_byte(0x10)), Some(Address::repeat_byte(0x11)))
                .with_token("DAI", 18, Some(Address::repeat_byte(0xd0)), Some(Address::repeat_byte(0xd1)))
                .with_token("BNB", 8, None, Some(Address::repeat_byte(0xb1)));
            Self {
                main: Arc::new(FakePlasmaGateway::new(plasma(0x01))),
                loom: Arc::new(FakePlasmaGateway::new(plasma(0x02))),
                binance: Arc::new(FakePlasmaGateway::new(plasma(0x03))),
                tokens,
            }
        }

        fn gateways(&self, with_binance: bool) -> PlasmaGateways {
            PlasmaGateways::new(
                PlasmaContracts {
                    main_gateway: self.main.clone(),
                    loom_gateway: self.loom.clone(),
                    binance_gateway: with_binance
                        .then(|| self.binance.clone() as Arc<dyn PlasmaGatewayContract>),
                },
                ChainAddress::new("eth", Address::repeat_byte(0xa1)),
                "default",
            )
        }
    }

    #[test]
    fn test_add_is_idempotent_per_chain() {
        let fx = Fixture::new();
        let mut gateways = fx.gateways(true);

        let first = gateways.add(ForeignChain::Ethereum, "DAI", &fx.tokens).unwrap();
        let second = gateways.add(ForeignChain::Ethereum, "DAI", &fx.tokens).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other_chain = gateways.add(ForeignChain::Binance, "DAI", &fx.tokens).unwrap();
        assert!(!Arc::ptr_eq(&first, &other_chain));
    }

    #[test]
    fn test_get_unknown_key() {
        let fx = Fixture::new();
        let mut gateways = fx.gateways(true);
        gateways.add(ForeignChain::Ethereum, "ETH", &fx.tokens).unwrap();
        assert!(matches!(
            gateways.get(ForeignChain::Binance, "ETH"),
            Err(GatewayError::NotConfigured {
                chain: Some(ForeignChain::Binance),
                ..
            })
        ));
    }

    #[test]
    fn test_binance_only_on_matching_chain() {
        let fx = Fixture::new();
        let mut gateways = fx.gateways(true);

        let bnb = gateways.add(ForeignChain::Binance, "BNB", &fx.tokens).unwrap();
        assert!(matches!(*bnb, PlasmaAdapter::Binance { .. }));
        assert!(!bnb.needs_receipt());

        let bnb_on_eth = gateways.add(ForeignChain::Ethereum, "BNB", &fx.tokens).unwrap();
        assert!(matches!(*bnb_on_eth, PlasmaAdapter::Erc20 { .. }));
        assert_eq!(bnb_on_eth.gateway().address(), fx.main.address());
    }

    #[test]
    fn test_binance_without_gateway() {
        let fx = Fixture::new();
        let mut gateways = fx.gateways(false);
        assert!(matches!(
            gateways.add(ForeignChain::Binance, "BNB", &fx.tokens),
            Err(GatewayError::NotConfigured { .. })
        ));
    }

    #[test]
    fn test_unknown_token_address() {
        let fx = Fixture::new();
        let mut gateways = fx.gateways(true);
        assert!(matches!(
            gateways.add(ForeignChain::Ethereum, "XYZ", &fx.tokens),
            Err(GatewayError::UnknownToken(_))
        ));
        assert!(gateways.get(ForeignChain::Ethereum, "XYZ").is_err());
    }

    #[tokio::test]
    async fn test_withdraw_call_shapes() {
        let fx = Fixture::new();
        let mut gateways = fx.gateways(true);
        let amount = U256::from(42);

        gateways
            .add(ForeignChain::Ethereum, "ETH", &fx.tokens)
            .unwrap()
            .withdraw(amount, None)
            .await
            .unwrap();
        gateways
            .add(ForeignChain::Ethereum, "DAI", &fx.tokens)
            .unwrap()
            .withdraw(amount, None)
            .await
            .unwrap();
        gateways
            .add(ForeignChain::Ethereum, "LOOM", &fx.tokens)
            .unwrap()
            .withdraw(amount, None)
            .await
            .unwrap();

        assert_eq!(
            fx.main.calls(),
            vec![
                PlasmaWithdrawCall::Eth {
                    amount,
                    ethereum_gateway: ChainAddress::new("eth", Address::repeat_byte(0xa1)),
                },
                PlasmaWithdrawCall::Erc20 {
                    amount,
                    token: plasma(0xd1),
                },
            ]
        );
        assert_eq!(
            fx.loom.calls(),
            vec![PlasmaWithdrawCall::LoomCoin {
                amount,
                ethereum_token: ChainAddress::new("eth", Address::repeat_byte(0x10)),
            }]
        );
    }

    #[tokio::test]
    async fn test_binance_withdraw_requires_recipient() {
        let fx = Fixture::new();
        let mut gateways = fx.gateways(true);
        let bnb = gateways.add(ForeignChain::Binance, "BNB", &fx.tokens).unwrap();

        assert!(matches!(bnb.check_recipient(None), Err(GatewayError::Config(_))));
        assert!(bnb.withdraw(U256::one(), None).await.is_err());

        let recipient = ChainAddress::new("binance", Address::repeat_byte(0x77));
        assert_eq!(bnb.check_recipient(Some(&recipient)).unwrap(), Some(&recipient));
        let eth = gateways.add(ForeignChain::Ethereum, "ETH", &fx.tokens).unwrap();
        assert_eq!(eth.check_recipient(None).unwrap(), None);
        bnb.withdraw(U256::one(), Some(&recipient)).await.unwrap();
        assert_eq!(
            fx.binance.calls(),
            vec![PlasmaWithdrawCall::Token {
                amount: U256::one(),
                token: plasma(0xb1),
                recipient,
            }]
        );
    }

    #[tokio::test]
    async fn test_receipts_for_owner() {
        let fx = Fixture::new();
        let mut gateways = fx.gateways(true);
        let adapter = gateways.add(ForeignChain::Ethereum, "ETH", &fx.tokens).unwrap();

        let receipt = WithdrawalReceipt {
            token_owner: ChainAddress::new("eth", Address::repeat_byte(0x0e)),
            token_contract: None,
            token_kind: TokenKind::Eth,
            token_id: U256::zero(),
            token_amount: U256::from(5),
            withdrawal_nonce: U256::zero(),
            oracle_signature: Bytes::new(),
        };
        fx.main.store(Some(receipt.clone()));

        let source = adapter.receipts_for(plasma(0x42));
        assert_eq!(source.fetch_receipt().await.unwrap(), Some(receipt));
        assert_eq!(fx.main.reads(), 1);
    }
}
