//! Core types shared by adapters, the withdrawal codec and the session.

use std::fmt;
use std::str::FromStr;

use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Symbol of the native coin on the Ethereum side.
pub const ETH_SYMBOL: &str = "ETH";

/// Symbol of the sidechain-native coin.
pub const LOOM_SYMBOL: &str = "LOOM";

/// Symbol of the alternate-chain coin.
pub const BNB_SYMBOL: &str = "BNB";

/// Kind of token carried by a withdrawal receipt.
///
/// Discriminants are the on-chain ordinals used by the validator manager;
/// they index the withdrawal prefix table and must not be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum TokenKind {
    /// Native coin (ETH).
    Eth = 0,
    /// ERC20-like fungible token.
    Erc20 = 1,
    /// Non-fungible token.
    Erc721 = 2,
    /// Semi-fungible token.
    Erc721X = 3,
    /// Sidechain-native coin (LOOM).
    LoomCoin = 4,
    /// Alternate-chain coin (BNB).
    Bnb = 5,
}

impl TokenKind {
    /// On-chain ordinal.
    pub fn ordinal(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for TokenKind {
    type Error = GatewayError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Eth),
            1 => Ok(Self::Erc20),
            2 => Ok(Self::Erc721),
            3 => Ok(Self::Erc721X),
            4 => Ok(Self::LoomCoin),
            5 => Ok(Self::Bnb),
            _ => Err(GatewayError::UnknownTokenKind(value)),
        }
    }
}

/// Foreign chain a sidechain adapter moves funds to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForeignChain {
    Ethereum,
    Binance,
}

impl ForeignChain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ethereum => "ethereum",
            Self::Binance => "binance",
        }
    }
}

impl fmt::Display for ForeignChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForeignChain {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" | "eth" => Ok(Self::Ethereum),
            "binance" => Ok(Self::Binance),
            other => Err(GatewayError::Config(format!("unknown chain: {other}"))),
        }
    }
}

/// Address qualified by the chain it lives on, written `chain:0x…`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainAddress {
    pub chain_id: String,
    pub local: Address,
}

impl ChainAddress {
    pub fn new(chain_id: impl Into<String>, local: Address) -> Self {
        Self {
            chain_id: chain_id.into(),
            local,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.local.is_zero()
    }
}

impl fmt::Display for ChainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.chain_id, self.local)
    }
}

impl FromStr for ChainAddress {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (chain_id, local) = s
            .split_once(':')
            .ok_or_else(|| GatewayError::Config(format!("address missing chain prefix: {s}")))?;
        let local = local
            .parse::<Address>()
            .map_err(|e| GatewayError::Config(format!("invalid address {local}: {e}")))?;
        Ok(Self::new(chain_id, local))
    }
}

/// Account pair linking the user's Ethereum and sidechain identities.
///
/// Withdrawal receipts are stored under the `to` account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMapping {
    pub from: ChainAddress,
    pub to: ChainAddress,
}

/// Receipt of an accepted withdrawal request on the sidechain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalReceipt {
    pub token_owner: ChainAddress,
    /// Absent for the native coin.
    pub token_contract: Option<ChainAddress>,
    pub token_kind: TokenKind,
    #[serde(default)]
    pub token_id: U256,
    #[serde(default)]
    pub token_amount: U256,
    #[serde(default)]
    pub withdrawal_nonce: U256,
    /// Concatenated validator signatures; empty while pending.
    #[serde(default)]
    pub oracle_signature: Bytes,
}

impl WithdrawalReceipt {
    /// Whether validators have endorsed the receipt.
    pub fn is_signed(&self) -> bool {
        !self.oracle_signature.is_empty()
    }

    /// Amount for fungible withdrawals, token id otherwise.
    pub fn amount(&self) -> U256 {
        if self.token_amount.is_zero() {
            self.token_id
        } else {
            self.token_amount
        }
    }

    /// Token contract on the origin chain, zero when absent.
    pub fn token_contract_local(&self) -> Address {
        self.token_contract
            .as_ref()
            .map(|c| c.local)
            .unwrap_or_else(Address::zero)
    }
}

/// Request to move funds out of the sidechain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Funds {
    pub chain: ForeignChain,
    pub symbol: String,
    pub amount: U256,
    /// Recipient on the alternate chain; unused for Ethereum.
    pub recipient: Option<ChainAddress>,
}

impl Funds {
    pub fn new(chain: ForeignChain, symbol: impl Into<String>, amount: U256) -> Self {
        Self {
            chain,
            symbol: symbol.into(),
            amount,
            recipient: None,
        }
    }

    pub fn with_recipient(mut self, recipient: ChainAddress) -> Self {
        self.recipient = Some(recipient);
        self
    }
}

/// Submitted, not yet confirmed, transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub transaction_hash: H256,
}

/// Transaction included in a block on the origin chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedTransaction {
    pub transaction_hash: H256,
    pub block_number: u64,
}

/// Parse a `0x`-prefixed address, mapping failures to `Config`.
pub fn parse_address(value: &str) -> GatewayResult<Address> {
    value
        .trim()
        .parse::<Address>()
        .map_err(|e| GatewayError::Config(format!("invalid address {value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_kind_ordinals_roundtrip() {
        for ordinal in 0..=5u32 {
            let kind = TokenKind::try_from(ordinal).unwrap();
            assert_eq!(kind.ordinal(), ordinal);
        }
        assert!(matches!(
            TokenKind::try_from(6),
            Err(GatewayError::UnknownTokenKind(6))
        ));
    }

    #[test]
    fn test_chain_address_parse_and_display() {
        let addr: ChainAddress = "eth:0x00000000000000000000000000000000000000aa"
            .parse()
            .unwrap();
        assert_eq!(addr.chain_id, "eth");
        assert_eq!(
            addr.to_string(),
            "eth:0x00000000000000000000000000000000000000aa"
        );
        assert!("0x00000000000000000000000000000000000000aa"
            .parse::<ChainAddress>()
            .is_err());
    }

    #[test]
    fn test_receipt_amount_falls_back_to_token_id() {
        let mut receipt = WithdrawalReceipt {
            token_owner: ChainAddress::new("eth", Address::repeat_byte(1)),
            token_contract: None,
            token_kind: TokenKind::Erc721,
            token_id: U256::from(42),
            token_amount: U256::zero(),
            withdrawal_nonce: U256::zero(),
            oracle_signature: Bytes::default(),
        };
        assert_eq!(receipt.amount(), U256::from(42));
        assert!(!receipt.is_signed());
        assert_eq!(receipt.token_contract_local(), Address::zero());

        receipt.token_amount = U256::from(7);
        assert_eq!(receipt.amount(), U256::from(7));
    }

    #[test]
    fn test_foreign_chain_from_str() {
        assert_eq!("Binance".parse::<ForeignChain>().unwrap(), ForeignChain::Binance);
        assert_eq!("ethereum".parse::<ForeignChain>().unwrap(), ForeignChain::Ethereum);
        assert!("tron".parse::<ForeignChain>().is_err());
    }
}
