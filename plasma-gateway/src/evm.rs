//! `ethers`-backed Ethereum contracts.
//!
//! Calldata is built by hand from 4-byte selectors and ABI-encoded
//! arguments; reads go through `eth_call` at the latest block, writes through
//! the middleware's signer and wait for one confirmation.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::providers::Middleware;
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, BlockId, BlockNumber, Bytes, Filter, Log,
    TransactionRequest, H256, U256,
};
use ethers::utils::keccak256;
use tracing::{debug, info};

use crate::codec::DecodedSignature;
use crate::contracts::{
    EthereumGatewayContract, EventQuery, GatewayEvent, GatewayLog, ValidatorManagerContract,
};
use crate::error::{GatewayError, GatewayResult};
use crate::services::{TokenLedger, TokenMetadata, TokenNetwork, ValueTransfer};
use crate::types::{ConfirmedTransaction, PendingTransaction, TokenKind, WithdrawalReceipt};

/// Gateway deployment generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayGeneration {
    /// Single oracle signer; withdrawals carry the raw signature.
    SingleSigner,
    /// Validator manager; withdrawals carry the decoded signature arrays.
    Multisig,
}

/// 4-byte function selector.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Selector followed by the ABI-encoded arguments.
pub fn calldata(signature: &str, args: &[Token]) -> Bytes {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&abi::encode(args));
    Bytes::from(data)
}

fn signature_arrays(signature: &DecodedSignature) -> [Token; 4] {
    [
        Token::Array(
            signature
                .val_indexes
                .iter()
                .map(|i| Token::Uint(U256::from(*i)))
                .collect(),
        ),
        Token::Array(
            signature
                .vs
                .iter()
                .map(|v| Token::Uint(U256::from(*v)))
                .collect(),
        ),
        Token::Array(
            signature
                .rs
                .iter()
                .map(|r| Token::FixedBytes(r.as_bytes().to_vec()))
                .collect(),
        ),
        Token::Array(
            signature
                .ss
                .iter()
                .map(|s| Token::FixedBytes(s.as_bytes().to_vec()))
                .collect(),
        ),
    ]
}

/// Calldata of the withdraw entry point for `receipt`.
pub fn withdraw_calldata(
    generation: GatewayGeneration,
    receipt: &WithdrawalReceipt,
    signature: Option<&DecodedSignature>,
) -> GatewayResult<Bytes> {
    let contract = Token::Address(receipt.token_contract_local());
    let amount = Token::Uint(receipt.amount());

    match (generation, signature) {
        (GatewayGeneration::SingleSigner, _) => {
            let sig = Token::Bytes(receipt.oracle_signature.to_vec());
            match receipt.token_kind {
                TokenKind::Eth => Ok(calldata("withdrawETH(uint256,bytes)", &[amount, sig])),
                TokenKind::Erc20 | TokenKind::LoomCoin => Ok(calldata(
                    "withdrawERC20(uint256,bytes,address)",
                    &[amount, sig, contract],
                )),
                TokenKind::Erc721 => Ok(calldata(
                    "withdrawERC721(uint256,bytes,address)",
                    &[amount, sig, contract],
                )),
                TokenKind::Erc721X => Ok(calldata(
                    "withdrawERC721X(uint256,uint256,bytes,address)",
                    &[
                        Token::Uint(receipt.token_id),
                        Token::Uint(receipt.token_amount),
                        sig,
                        contract,
                    ],
                )),
                TokenKind::Bnb => Err(GatewayError::UnknownTokenKind(receipt.token_kind.ordinal())),
            }
        }
        (GatewayGeneration::Multisig, None) => Err(GatewayError::MalformedSignature(
            "multisig gateway needs a decoded signature".into(),
        )),
        (GatewayGeneration::Multisig, Some(signature)) => {
            let [indexes, vs, rs, ss] = signature_arrays(signature);
            match receipt.token_kind {
                TokenKind::Eth => Ok(calldata(
                    "withdrawETH(uint256,uint256[],uint8[],bytes32[],bytes32[])",
                    &[amount, indexes, vs, rs, ss],
                )),
                TokenKind::Erc20 | TokenKind::LoomCoin => Ok(calldata(
                    "withdrawERC20(uint256,address,uint256[],uint8[],bytes32[],bytes32[])",
                    &[amount, contract, indexes, vs, rs, ss],
                )),
                TokenKind::Erc721 => Ok(calldata(
                    "withdrawERC721(uint256,address,uint256[],uint8[],bytes32[],bytes32[])",
                    &[amount, contract, indexes, vs, rs, ss],
                )),
                TokenKind::Erc721X => Ok(calldata(
                    "withdrawERC721X(uint256,uint256,address,uint256[],uint8[],bytes32[],bytes32[])",
                    &[
                        Token::Uint(receipt.token_id),
                        Token::Uint(receipt.token_amount),
                        contract,
                        indexes,
                        vs,
                        rs,
                        ss,
                    ],
                )),
                TokenKind::Bnb => Err(GatewayError::UnknownTokenKind(receipt.token_kind.ordinal())),
            }
        }
    }
}

/// Topic0 of a gateway event.
pub fn event_topic(event: GatewayEvent) -> H256 {
    H256::from(keccak256(event.signature().as_bytes()))
}

/// Decode a raw gateway log.
///
/// Deposit events carry every field in the data section; `TokenWithdrawn`
/// indexes the owner.
pub fn decode_log(event: GatewayEvent, log: &Log) -> GatewayResult<GatewayLog> {
    let bad = |what: &str| GatewayError::Contract(format!("{event} log without {what}"));

    let (account, token_contract, value) = match event {
        GatewayEvent::EthReceived => {
            let tokens = decode(&[ParamType::Address, ParamType::Uint(256)], &log.data)?;
            (address_at(&tokens, 0)?, None, uint_at(&tokens, 1)?)
        }
        GatewayEvent::Erc20Received | GatewayEvent::LoomCoinReceived => {
            let tokens = decode(
                &[ParamType::Address, ParamType::Uint(256), ParamType::Address],
                &log.data,
            )?;
            (
                address_at(&tokens, 0)?,
                Some(address_at(&tokens, 2)?),
                uint_at(&tokens, 1)?,
            )
        }
        GatewayEvent::TokenWithdrawn => {
            let owner = log
                .topics
                .get(1)
                .map(|topic| Address::from(*topic))
                .ok_or_else(|| bad("owner topic"))?;
            let tokens = decode(
                &[ParamType::Uint(8), ParamType::Address, ParamType::Uint(256)],
                &log.data,
            )?;
            (owner, Some(address_at(&tokens, 1)?), uint_at(&tokens, 2)?)
        }
    };

    Ok(GatewayLog {
        event,
        block_number: log.block_number.ok_or_else(|| bad("block number"))?.as_u64(),
        transaction_hash: log.transaction_hash.ok_or_else(|| bad("transaction hash"))?,
        log_index: log.log_index.ok_or_else(|| bad("log index"))?.as_u64(),
        account,
        token_contract,
        value,
    })
}

fn decode(types: &[ParamType], data: &[u8]) -> GatewayResult<Vec<Token>> {
    abi::decode(types, data).map_err(|e| GatewayError::Contract(format!("cannot decode return data: {e}")))
}

fn address_at(tokens: &[Token], index: usize) -> GatewayResult<Address> {
    tokens
        .get(index)
        .cloned()
        .and_then(Token::into_address)
        .ok_or_else(|| GatewayError::Contract(format!("expected address at position {index}")))
}

fn uint_at(tokens: &[Token], index: usize) -> GatewayResult<U256> {
    tokens
        .get(index)
        .cloned()
        .and_then(Token::into_uint)
        .ok_or_else(|| GatewayError::Contract(format!("expected uint at position {index}")))
}

fn rpc_error(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Rpc(e.to_string())
}

async fn eth_call<M: Middleware>(client: &M, to: Address, data: Bytes) -> GatewayResult<Bytes> {
    let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
    client
        .call(&tx, Some(BlockId::Number(BlockNumber::Latest)))
        .await
        .map_err(rpc_error)
}

async fn send<M: Middleware>(client: &M, tx: TransactionRequest) -> GatewayResult<H256> {
    let pending = client.send_transaction(tx, None).await.map_err(rpc_error)?;
    Ok(pending.tx_hash())
}

async fn send_and_confirm<M: Middleware>(
    client: &M,
    tx: TransactionRequest,
) -> GatewayResult<ConfirmedTransaction> {
    let pending = client.send_transaction(tx, None).await.map_err(rpc_error)?;
    let tx_hash = pending.tx_hash();
    debug!(tx = ?tx_hash, "transaction submitted");

    let receipt = pending
        .await
        .map_err(rpc_error)?
        .ok_or_else(|| GatewayError::Contract(format!("transaction {tx_hash:?} dropped")))?;
    if receipt.status.map(|s| s.is_zero()).unwrap_or(false) {
        return Err(GatewayError::Contract(format!("transaction {tx_hash:?} reverted")));
    }
    let block_number = receipt
        .block_number
        .ok_or_else(|| GatewayError::Contract(format!("transaction {tx_hash:?} has no block")))?
        .as_u64();

    Ok(ConfirmedTransaction {
        transaction_hash: receipt.transaction_hash,
        block_number,
    })
}

/// Ethereum gateway contract.
#[derive(Debug)]
pub struct EvmGateway<M> {
    client: Arc<M>,
    address: Address,
    generation: GatewayGeneration,
}

impl<M: Middleware + 'static> EvmGateway<M> {
    pub fn new(client: Arc<M>, address: Address, generation: GatewayGeneration) -> Self {
        Self {
            client,
            address,
            generation,
        }
    }

    pub fn generation(&self) -> GatewayGeneration {
        self.generation
    }

    /// Validator manager a multisig gateway points at.
    pub async fn validator_manager_address(&self) -> GatewayResult<Address> {
        let data = eth_call(self.client.as_ref(), self.address, calldata("vmc()", &[])).await?;
        let tokens = decode(&[ParamType::Address], &data)?;
        address_at(&tokens, 0)
    }
}

#[async_trait]
impl<M: Middleware + 'static> EthereumGatewayContract for EvmGateway<M> {
    fn address(&self) -> Address {
        self.address
    }

    async fn latest_block(&self) -> GatewayResult<u64> {
        let block = self.client.get_block_number().await.map_err(rpc_error)?;
        Ok(block.as_u64())
    }

    async fn nonce(&self, owner: Address) -> GatewayResult<U256> {
        let data = eth_call(
            self.client.as_ref(),
            self.address,
            calldata("nonces(address)", &[Token::Address(owner)]),
        )
        .await?;
        let tokens = decode(&[ParamType::Uint(256)], &data)?;
        uint_at(&tokens, 0)
    }

    async fn deposit_erc20(&self, amount: U256, token: Address) -> GatewayResult<PendingTransaction> {
        let tx = TransactionRequest::new().to(self.address).data(calldata(
            "depositERC20(uint256,address)",
            &[Token::Uint(amount), Token::Address(token)],
        ));
        let transaction_hash = send(self.client.as_ref(), tx).await?;
        info!(gateway = ?self.address, tx = ?transaction_hash, "ERC20 deposit submitted");
        Ok(PendingTransaction { transaction_hash })
    }

    async fn withdraw(
        &self,
        receipt: &WithdrawalReceipt,
        signature: Option<&DecodedSignature>,
    ) -> GatewayResult<ConfirmedTransaction> {
        let data = withdraw_calldata(self.generation, receipt, signature)?;
        let tx = TransactionRequest::new().to(self.address).data(data);
        send_and_confirm(self.client.as_ref(), tx).await
    }

    async fn past_events(&self, query: &EventQuery) -> GatewayResult<Vec<GatewayLog>> {
        let mut filter = Filter::new()
            .address(self.address)
            .topic0(event_topic(query.event))
            .from_block(query.from_block)
            .to_block(BlockNumber::Latest);
        if query.event == GatewayEvent::TokenWithdrawn {
            filter = filter.topic1(H256::from(query.account));
        }

        let logs = self
            .client
            .get_logs(&filter)
            .await
            .map_err(|e| GatewayError::TransientFetchFailure(e.to_string()))?;

        let mut decoded = Vec::with_capacity(logs.len());
        for log in &logs {
            let log = decode_log(query.event, log)?;
            if log.account == query.account {
                decoded.push(log);
            }
        }
        debug!(event = %query.event, fetched = logs.len(), matched = decoded.len(), "gateway logs");
        Ok(decoded)
    }
}

/// Validator manager contract.
#[derive(Debug)]
pub struct EvmValidatorManager<M> {
    client: Arc<M>,
    address: Address,
}

impl<M: Middleware + 'static> EvmValidatorManager<M> {
    pub fn new(client: Arc<M>, address: Address) -> Self {
        Self { client, address }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ValidatorManagerContract for EvmValidatorManager<M> {
    fn address(&self) -> Address {
        self.address
    }

    async fn validators(&self) -> GatewayResult<Vec<Address>> {
        let data = eth_call(self.client.as_ref(), self.address, calldata("getValidators()", &[])).await?;
        let tokens = decode(&[ParamType::Array(Box::new(ParamType::Address))], &data)?;
        tokens
            .into_iter()
            .next()
            .and_then(Token::into_array)
            .ok_or_else(|| GatewayError::Contract("getValidators returned no array".into()))?
            .into_iter()
            .map(|token| {
                token
                    .into_address()
                    .ok_or_else(|| GatewayError::Contract("validator is not an address".into()))
            })
            .collect()
    }
}

/// Plain value transfers through the middleware's signer.
#[derive(Debug)]
pub struct EvmValueTransfer<M> {
    client: Arc<M>,
}

impl<M: Middleware + 'static> EvmValueTransfer<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ValueTransfer for EvmValueTransfer<M> {
    async fn send_value(&self, from: Address, to: Address, value: U256) -> GatewayResult<PendingTransaction> {
        let tx = TransactionRequest::new().from(from).to(to).value(value);
        let transaction_hash = send(self.client.as_ref(), tx).await?;
        Ok(PendingTransaction { transaction_hash })
    }
}

/// ERC20 allowances and approvals on Ethereum.
pub struct EvmTokenLedger<M> {
    client: Arc<M>,
    tokens: Arc<dyn TokenMetadata>,
}

impl<M: Middleware + 'static> EvmTokenLedger<M> {
    pub fn new(client: Arc<M>, tokens: Arc<dyn TokenMetadata>) -> Self {
        Self { client, tokens }
    }

    fn token(&self, network: TokenNetwork, symbol: &str) -> GatewayResult<Address> {
        if network != TokenNetwork::Ethereum {
            return Err(GatewayError::Unsupported(format!("{network:?} ledger over an Ethereum RPC")));
        }
        self.tokens
            .symbol_to_address(symbol, network)
            .ok_or_else(|| GatewayError::UnknownToken(symbol.to_string()))
    }
}

#[async_trait]
impl<M: Middleware + 'static> TokenLedger for EvmTokenLedger<M> {
    async fn allowance(
        &self,
        network: TokenNetwork,
        symbol: &str,
        owner: Address,
        spender: Address,
    ) -> GatewayResult<U256> {
        let token = self.token(network, symbol)?;
        let data = eth_call(
            self.client.as_ref(),
            token,
            calldata(
                "allowance(address,address)",
                &[Token::Address(owner), Token::Address(spender)],
            ),
        )
        .await?;
        let tokens = decode(&[ParamType::Uint(256)], &data)?;
        uint_at(&tokens, 0)
    }

    async fn approve(
        &self,
        network: TokenNetwork,
        symbol: &str,
        spender: Address,
        amount: U256,
    ) -> GatewayResult<PendingTransaction> {
        let token = self.token(network, symbol)?;
        let tx = TransactionRequest::new().to(token).data(calldata(
            "approve(address,uint256)",
            &[Token::Address(spender), Token::Uint(amount)],
        ));
        let transaction_hash = send(self.client.as_ref(), tx).await?;
        Ok(PendingTransaction { transaction_hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::StaticTokenMetadata;
    use crate::types::ChainAddress;
    use ethers::providers::Provider;
    use ethers::types::U64;

    fn receipt(kind: TokenKind) -> WithdrawalReceipt {
        WithdrawalReceipt {
            token_owner: ChainAddress::new("eth", Address::repeat_byte(0x0e)),
            token_contract: Some(ChainAddress::new("eth", Address::repeat_byte(0xda))),
            token_kind: kind,
            token_id: U256::from(3),
            token_amount: U256::from(1000),
            withdrawal_nonce: U256::zero(),
            oracle_signature: Bytes::from(vec![0xaa; 65]),
        }
    }

    #[test]
    fn test_known_selectors() {
        assert_eq!(hex::encode(selector("approve(address,uint256)")), "095ea7b3");
        assert_eq!(hex::encode(selector("allowance(address,address)")), "dd62ed3e");
    }

    #[test]
    fn test_single_signer_erc20_calldata() {
        let data = withdraw_calldata(GatewayGeneration::SingleSigner, &receipt(TokenKind::Erc20), None).unwrap();
        assert_eq!(&data[..4], &selector("withdrawERC20(uint256,bytes,address)"));

        let decoded = abi::decode(
            &[ParamType::Uint(256), ParamType::Bytes, ParamType::Address],
            &data[4..],
        )
        .unwrap();
        assert_eq!(decoded[0], Token::Uint(U256::from(1000)));
        assert_eq!(decoded[1], Token::Bytes(vec![0xaa; 65]));
        assert_eq!(decoded[2], Token::Address(Address::repeat_byte(0xda)));
    }

    #[test]
    fn test_multisig_eth_calldata() {
        let signature = DecodedSignature {
            hash: H256::repeat_byte(1),
            val_indexes: vec![0, 2],
            vs: vec![27, 28],
            rs: vec![H256::repeat_byte(2), H256::repeat_byte(3)],
            ss: vec![H256::repeat_byte(4), H256::repeat_byte(5)],
        };
        let data = withdraw_calldata(GatewayGeneration::Multisig, &receipt(TokenKind::Eth), Some(&signature)).unwrap();
        assert_eq!(
            &data[..4],
            &selector("withdrawETH(uint256,uint256[],uint8[],bytes32[],bytes32[])")
        );

        let decoded = abi::decode(
            &[
                ParamType::Uint(256),
                ParamType::Array(Box::new(ParamType::Uint(256))),
                ParamType::Array(Box::new(ParamType::Uint(8))),
                ParamType::Array(Box::new(ParamType::FixedBytes(32))),
                ParamType::Array(Box::new(ParamType::FixedBytes(32))),
            ],
            &data[4..],
        )
        .unwrap();
        assert_eq!(
            decoded[1],
            Token::Array(vec![Token::Uint(U256::zero()), Token::Uint(U256::from(2))])
        );
        assert_eq!(
            decoded[2],
            Token::Array(vec![Token::Uint(U256::from(27)), Token::Uint(U256::from(28))])
        );
    }

    #[test]
    fn test_multisig_without_signature() {
        assert!(matches!(
            withdraw_calldata(GatewayGeneration::Multisig, &receipt(TokenKind::Eth), None),
            Err(GatewayError::MalformedSignature(_))
        ));
        assert!(matches!(
            withdraw_calldata(GatewayGeneration::SingleSigner, &receipt(TokenKind::Bnb), None),
            Err(GatewayError::UnknownTokenKind(5))
        ));
    }

    fn raw_log(topics: Vec<H256>, data: Vec<u8>) -> Log {
        Log {
            topics,
            data: Bytes::from(data),
            block_number: Some(U64::from(77)),
            transaction_hash: Some(H256::repeat_byte(9)),
            log_index: Some(U256::from(4)),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_deposit_log() {
        let from = Address::repeat_byte(0x0e);
        let token = Address::repeat_byte(0xda);
        let data = abi::encode(&[Token::Address(from), Token::Uint(U256::from(55)), Token::Address(token)]);
        let log = raw_log(vec![event_topic(GatewayEvent::Erc20Received)], data);

        let decoded = decode_log(GatewayEvent::Erc20Received, &log).unwrap();
        assert_eq!(decoded.account, from);
        assert_eq!(decoded.token_contract, Some(token));
        assert_eq!(decoded.value, U256::from(55));
        assert_eq!(decoded.block_number, 77);
        assert_eq!(decoded.log_index, 4);
    }

    #[test]
    fn test_decode_withdrawn_log() {
        let owner = Address::repeat_byte(0x0e);
        let data = abi::encode(&[
            Token::Uint(U256::from(1)),
            Token::Address(Address::repeat_byte(0xda)),
            Token::Uint(U256::from(12)),
        ]);
        let log = raw_log(
            vec![event_topic(GatewayEvent::TokenWithdrawn), H256::from(owner)],
            data,
        );
        let decoded = decode_log(GatewayEvent::TokenWithdrawn, &log).unwrap();
        assert_eq!(decoded.account, owner);
        assert_eq!(decoded.value, U256::from(12));

        let missing_owner = raw_log(vec![event_topic(GatewayEvent::TokenWithdrawn)], log.data.to_vec());
        assert!(decode_log(GatewayEvent::TokenWithdrawn, &missing_owner).is_err());
    }

    #[tokio::test]
    async fn test_token_ledger_reads_allowance() {
        let (provider, mock) = Provider::mocked();
        let tokens = StaticTokenMetadata::new().with_token(
            "DAI",
            18,
            Some(Address::repeat_byte(0xda)),
            Some(Address::repeat_byte(0xdb)),
        );
        let ledger = EvmTokenLedger::new(Arc::new(provider), Arc::new(tokens));
        let owner = Address::repeat_byte(0x0e);
        let spender = Address::repeat_byte(0xa1);

        mock.push::<Bytes, _>(Bytes::from(abi::encode(&[Token::Uint(U256::from(42))])))
            .unwrap();
        let allowance = ledger
            .allowance(TokenNetwork::Ethereum, "DAI", owner, spender)
            .await
            .unwrap();
        assert_eq!(allowance, U256::from(42));

        assert!(matches!(
            ledger.allowance(TokenNetwork::Plasma, "DAI", owner, spender).await,
            Err(GatewayError::Unsupported(_))
        ));
        assert!(matches!(
            ledger.allowance(TokenNetwork::Ethereum, "XYZ", owner, spender).await,
            Err(GatewayError::UnknownToken(_))
        ));
    }
}
