//! Withdrawal hash and validator signature codec.
//!
//! Validators endorse a withdrawal by signing
//! `keccak256(prefix ‖ owner ‖ nonce ‖ gateway ‖ amountHash)` (Solidity packed
//! encoding). The destination gateway recomputes the same hash, so every byte
//! and the order of the tuple must match what validators signed.

use ethers::abi::{encode_packed, Token};
use ethers::types::{Address, RecoveryMessage, Signature, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::contracts::{EthereumGatewayContract, ValidatorManagerContract};
use crate::error::{GatewayError, GatewayResult};
use crate::types::{TokenKind, WithdrawalReceipt};

/// Size of one `r ‖ s ‖ v` signature in the oracle signature blob.
pub const SIGNATURE_SIZE: usize = 65;

/// Withdrawal prefixes indexed by token kind ordinal.
///
/// Order follows the validator manager's token kind enumeration. The
/// sidechain coin reuses the ERC20 prefix.
const WITHDRAWAL_PREFIXES: [&str; 5] = [
    "\x0eWithdraw ETH:\n",
    "\x10Withdraw ERC20:\n",
    "\x11Withdraw ERC721:\n",
    "\x12Withdraw ERC721X:\n",
    "\x10Withdraw ERC20:\n",
];

/// Withdrawal prefix for `kind`.
pub fn withdrawal_prefix(kind: TokenKind) -> GatewayResult<&'static str> {
    WITHDRAWAL_PREFIXES
        .get(kind.ordinal() as usize)
        .copied()
        .ok_or(GatewayError::UnknownTokenKind(kind.ordinal()))
}

/// `uint256` as Solidity packs it: a full 32-byte big-endian word.
/// `encode_packed` shrinks `Token::Uint` to its minimal width.
fn uint256(value: U256) -> Token {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    Token::FixedBytes(word.to_vec())
}

fn packed_keccak(tokens: &[Token]) -> GatewayResult<H256> {
    let packed = encode_packed(tokens).map_err(|e| GatewayError::Encoding(e.to_string()))?;
    Ok(H256::from(keccak256(packed)))
}

/// Hash of the withdrawn amount; every kind but the native coin binds the
/// token contract too.
pub fn amount_hash(receipt: &WithdrawalReceipt) -> GatewayResult<H256> {
    let amount = uint256(receipt.amount());
    match receipt.token_kind {
        TokenKind::Eth => packed_keccak(&[amount]),
        _ => packed_keccak(&[amount, Token::Address(receipt.token_contract_local())]),
    }
}

/// Canonical withdrawal hash for a known nonce.
pub fn withdrawal_hash(
    receipt: &WithdrawalReceipt,
    gateway: Address,
    nonce: U256,
) -> GatewayResult<H256> {
    let prefix = withdrawal_prefix(receipt.token_kind)?;
    let amount_hashed = amount_hash(receipt)?;
    let owner = receipt.token_owner.local;

    debug!(
        prefix = ?prefix,
        owner = ?owner,
        nonce = %nonce,
        gateway = ?gateway,
        amount_hash = ?amount_hashed,
        "withdrawal hash preimage"
    );

    packed_keccak(&[
        Token::String(prefix.to_string()),
        Token::Address(owner),
        uint256(nonce),
        Token::Address(gateway),
        Token::FixedBytes(amount_hashed.as_bytes().to_vec()),
    ])
}

/// Canonical withdrawal hash, reading the owner's current nonce from the
/// gateway that will release the funds.
pub async fn build_withdrawal_hash(
    receipt: &WithdrawalReceipt,
    gateway: &dyn EthereumGatewayContract,
) -> GatewayResult<H256> {
    // Fail on unknown kinds before touching the network.
    withdrawal_prefix(receipt.token_kind)?;
    let nonce = gateway.nonce(receipt.token_owner.local).await?;
    withdrawal_hash(receipt, gateway.address(), nonce)
}

/// Signature bundle in the shape multisig gateways expect: parallel arrays
/// ordered by ascending validator index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedSignature {
    /// Hash the signatures were checked against.
    pub hash: H256,
    pub val_indexes: Vec<u64>,
    pub vs: Vec<u8>,
    pub rs: Vec<H256>,
    pub ss: Vec<H256>,
}

impl DecodedSignature {
    /// Number of validators that signed.
    pub fn len(&self) -> usize {
        self.val_indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.val_indexes.is_empty()
    }
}

/// Split a concatenated signature blob into single signatures.
pub fn split_signatures(blob: &[u8]) -> GatewayResult<Vec<&[u8]>> {
    if blob.is_empty() {
        return Err(GatewayError::MalformedSignature("empty signature blob".into()));
    }
    if blob.len() % SIGNATURE_SIZE != 0 {
        return Err(GatewayError::MalformedSignature(format!(
            "blob length {} is not a multiple of {}",
            blob.len(),
            SIGNATURE_SIZE
        )));
    }
    Ok(blob.chunks_exact(SIGNATURE_SIZE).collect())
}

/// Recover the signer of `hash` from one 65-byte signature.
///
/// Validators sign the hash as an Ethereum personal message.
pub fn recover_signer(signature: &[u8], hash: H256) -> GatewayResult<Address> {
    recover(&parse_signature(signature)?, hash)
}

fn parse_signature(signature: &[u8]) -> GatewayResult<Signature> {
    Signature::try_from(signature).map_err(|e| GatewayError::MalformedSignature(e.to_string()))
}

fn recover(signature: &Signature, hash: H256) -> GatewayResult<Address> {
    signature
        .recover(RecoveryMessage::Data(hash.as_bytes().to_vec()))
        .map_err(|e| GatewayError::MalformedSignature(e.to_string()))
}

/// `v` in the 27/28 form gateways accept, whatever form the signer used.
fn normalized_v(signature: &Signature) -> GatewayResult<u8> {
    let id = signature
        .recovery_id()
        .map_err(|e| GatewayError::MalformedSignature(e.to_string()))?;
    Ok(27 + id.to_byte())
}

/// Split `signatures` into per-validator components, keeping only signers
/// present in `validators`.
pub fn decode_signatures(
    signatures: &[u8],
    hash: H256,
    validators: &[Address],
    min_signatures: usize,
) -> GatewayResult<DecodedSignature> {
    let mut signed: Vec<(u64, u8, H256, H256)> = Vec::new();

    for chunk in split_signatures(signatures)? {
        let signature = parse_signature(chunk)?;
        let signer = recover(&signature, hash)?;
        let Some(index) = validators.iter().position(|v| *v == signer) else {
            warn!(signer = ?signer, "signature from non-validator ignored");
            continue;
        };
        let index = index as u64;
        if signed.iter().any(|(i, ..)| *i == index) {
            warn!(signer = ?signer, index, "duplicate validator signature ignored");
            continue;
        }
        signed.push((
            index,
            normalized_v(&signature)?,
            H256::from_slice(&chunk[..32]),
            H256::from_slice(&chunk[32..64]),
        ));
    }

    if signed.len() < min_signatures {
        return Err(GatewayError::NoQuorum {
            have: signed.len(),
            need: min_signatures,
        });
    }

    signed.sort_by_key(|(index, ..)| *index);
    let mut decoded = DecodedSignature {
        hash,
        ..Default::default()
    };
    for (index, v, r, s) in signed {
        decoded.val_indexes.push(index);
        decoded.vs.push(v);
        decoded.rs.push(r);
        decoded.ss.push(s);
    }
    Ok(decoded)
}

/// Recompute the withdrawal hash, fetch the live validator set and decode the
/// receipt's oracle signature against both.
///
/// `min_signatures` only guards against short input; the destination
/// contract enforces the real threshold.
pub async fn decode_signature_bundle(
    receipt: &WithdrawalReceipt,
    gateway: &dyn EthereumGatewayContract,
    validator_manager: &dyn ValidatorManagerContract,
    min_signatures: usize,
) -> GatewayResult<DecodedSignature> {
    split_signatures(&receipt.oracle_signature)?;
    let hash = build_withdrawal_hash(receipt, gateway).await?;
    let validators = validator_manager.validators().await?;
    debug!(validators = validators.len(), hash = ?hash, "decoding signature bundle");
    decode_signatures(&receipt.oracle_signature, hash, &validators, min_signatures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sign_hash, test_wallet, FakeEthereumGateway, FakeValidatorManager};
    use crate::types::ChainAddress;
    use ethers::signers::Signer;
    use ethers::types::Bytes;
    use proptest::prelude::*;

    fn owner() -> Address {
        Address::repeat_byte(0x11)
    }

    fn token() -> Address {
        Address::repeat_byte(0x22)
    }

    fn gateway() -> Address {
        Address::repeat_byte(0x33)
    }

    fn receipt(kind: TokenKind, amount: u64) -> WithdrawalReceipt {
        WithdrawalReceipt {
            token_owner: ChainAddress::new("eth", owner()),
            token_contract: match kind {
                TokenKind::Eth => None,
                _ => Some(ChainAddress::new("eth", token())),
            },
            token_kind: kind,
            token_id: U256::zero(),
            token_amount: U256::from(amount),
            withdrawal_nonce: U256::zero(),
            oracle_signature: Bytes::default(),
        }
    }

    #[test]
    fn test_prefix_table_order() {
        assert_eq!(withdrawal_prefix(TokenKind::Eth).unwrap(), "\x0eWithdraw ETH:\n");
        assert_eq!(withdrawal_prefix(TokenKind::Erc20).unwrap(), "\x10Withdraw ERC20:\n");
        assert_eq!(withdrawal_prefix(TokenKind::Erc721).unwrap(), "\x11Withdraw ERC721:\n");
        assert_eq!(withdrawal_prefix(TokenKind::Erc721X).unwrap(), "\x12Withdraw ERC721X:\n");
        assert_eq!(
            withdrawal_prefix(TokenKind::LoomCoin).unwrap(),
            withdrawal_prefix(TokenKind::Erc20).unwrap()
        );
        // The length byte leading each prefix counts the rest of it.
        for prefix in WITHDRAWAL_PREFIXES {
            assert_eq!(prefix.as_bytes()[0] as usize, prefix.len() - 1);
        }
    }

    #[test]
    fn test_unknown_kind_has_no_prefix() {
        assert!(matches!(
            withdrawal_prefix(TokenKind::Bnb),
            Err(GatewayError::UnknownTokenKind(5))
        ));
        assert!(matches!(
            withdrawal_hash(&receipt(TokenKind::Bnb, 1), gateway(), U256::zero()),
            Err(GatewayError::UnknownTokenKind(5))
        ));
    }

    #[test]
    fn test_native_withdrawal_hash() {
        let r = receipt(TokenKind::Eth, 1000);

        // amountHash covers the amount alone.
        let mut amount_word = [0u8; 32];
        U256::from(1000).to_big_endian(&mut amount_word);
        assert_eq!(amount_hash(&r).unwrap(), H256::from(keccak256(amount_word)));

        // A token contract on a native receipt does not change the hash.
        let mut with_contract = r.clone();
        with_contract.token_contract = Some(ChainAddress::new("eth", token()));
        assert_eq!(amount_hash(&with_contract).unwrap(), amount_hash(&r).unwrap());

        let nonce = U256::from(3);
        let hash = withdrawal_hash(&r, gateway(), nonce).unwrap();
        assert_eq!(hash, withdrawal_hash(&r, gateway(), nonce).unwrap());

        let mut preimage = b"\x0eWithdraw ETH:\n".to_vec();
        preimage.extend_from_slice(owner().as_bytes());
        let mut nonce_word = [0u8; 32];
        nonce.to_big_endian(&mut nonce_word);
        preimage.extend_from_slice(&nonce_word);
        preimage.extend_from_slice(gateway().as_bytes());
        preimage.extend_from_slice(amount_hash(&r).unwrap().as_bytes());
        assert_eq!(hash, H256::from(keccak256(preimage)));
    }

    #[test]
    fn test_native_withdrawal_hash_vector() {
        let r = receipt(TokenKind::Eth, 1000);
        assert_eq!(
            amount_hash(&r).unwrap(),
            "0xef9d334ee3e15416314a60312ef616e881c3bfffe4b60b11befc2707c79b7d35"
                .parse::<H256>()
                .unwrap()
        );
        assert_eq!(
            withdrawal_hash(&r, gateway(), U256::from(3)).unwrap(),
            "0x7068701c690cf976aac7ece1b726a837aee23bd26cabc26d23fbe4c6de57c9d2"
                .parse::<H256>()
                .unwrap()
        );
    }

    #[test]
    fn test_erc20_amount_hash_binds_token() {
        let r = receipt(TokenKind::Erc20, 1000);
        let mut preimage = [0u8; 52];
        U256::from(1000).to_big_endian(&mut preimage[..32]);
        preimage[32..].copy_from_slice(token().as_bytes());
        assert_eq!(amount_hash(&r).unwrap(), H256::from(keccak256(preimage)));
    }

    #[test]
    fn test_nft_uses_token_id() {
        let mut r = receipt(TokenKind::Erc721, 0);
        r.token_id = U256::from(77);
        let mut by_amount = r.clone();
        by_amount.token_id = U256::zero();
        by_amount.token_amount = U256::from(77);
        assert_eq!(amount_hash(&r).unwrap(), amount_hash(&by_amount).unwrap());
    }

    #[tokio::test]
    async fn test_build_withdrawal_hash_reads_nonce() {
        let gw = FakeEthereumGateway::new(gateway());
        gw.set_nonce(owner(), U256::from(9));
        let r = receipt(TokenKind::Erc20, 5);
        let hash = build_withdrawal_hash(&r, &gw).await.unwrap();
        assert_eq!(hash, withdrawal_hash(&r, gateway(), U256::from(9)).unwrap());
    }

    #[tokio::test]
    async fn test_build_withdrawal_hash_rejects_kind_before_nonce_read() {
        let gw = FakeEthereumGateway::new(gateway());
        let r = receipt(TokenKind::Bnb, 5);
        assert!(matches!(
            build_withdrawal_hash(&r, &gw).await,
            Err(GatewayError::UnknownTokenKind(_))
        ));
        assert_eq!(gw.nonce_reads(), 0);
    }

    #[test]
    fn test_split_rejects_bad_lengths() {
        for len in [0, 1, SIGNATURE_SIZE - 1, SIGNATURE_SIZE + 1] {
            let blob = vec![1u8; len];
            assert!(
                matches!(split_signatures(&blob), Err(GatewayError::MalformedSignature(_))),
                "length {len} accepted"
            );
        }
        assert_eq!(split_signatures(&[1u8; SIGNATURE_SIZE * 3]).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_decode_bundle_rejects_bad_lengths() {
        let gw = FakeEthereumGateway::new(gateway());
        let vmc = FakeValidatorManager::new(vec![]);
        for len in [0, 1, SIGNATURE_SIZE - 1, SIGNATURE_SIZE + 1] {
            let mut r = receipt(TokenKind::Erc20, 5);
            r.oracle_signature = Bytes::from(vec![1u8; len]);
            assert!(matches!(
                decode_signature_bundle(&r, &gw, &vmc, 0).await,
                Err(GatewayError::MalformedSignature(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_decode_bundle_orders_by_validator_index() {
        let validators: Vec<_> = (1..=3u8).map(test_wallet).collect();
        let outsider = test_wallet(9);
        let gw = FakeEthereumGateway::new(gateway());
        gw.set_nonce(owner(), U256::from(1));
        let vmc = FakeValidatorManager::new(validators.iter().map(|w| w.address()).collect());

        let mut r = receipt(TokenKind::Erc20, 250);
        let hash = withdrawal_hash(&r, gateway(), U256::from(1)).unwrap();

        let mut blob = Vec::new();
        blob.extend(sign_hash(&validators[2], hash).await);
        blob.extend(sign_hash(&outsider, hash).await);
        blob.extend(sign_hash(&validators[0], hash).await);
        blob.extend(sign_hash(&validators[2], hash).await);
        r.oracle_signature = Bytes::from(blob.clone());

        let decoded = decode_signature_bundle(&r, &gw, &vmc, 2).await.unwrap();
        assert_eq!(decoded.hash, hash);
        assert_eq!(decoded.val_indexes, vec![0, 2]);
        assert_eq!(decoded.len(), 2);
        assert!(decoded.vs.iter().all(|v| *v == 27 || *v == 28));
        assert_eq!(decoded.rs[1], H256::from_slice(&blob[..32]));
        assert_eq!(decoded.ss[1], H256::from_slice(&blob[32..64]));
    }

    #[tokio::test]
    async fn test_decode_normalizes_chain_encoded_v() {
        let validator = test_wallet(1);
        let hash = withdrawal_hash(&receipt(TokenKind::Eth, 10), gateway(), U256::zero()).unwrap();
        let signature = sign_hash(&validator, hash).await;
        let expected_v = signature[64];

        // Same signature with v in its chain-id form (chain 1: 37/38).
        let mut chain_encoded = signature.clone();
        chain_encoded[64] = expected_v - 27 + 37;

        let decoded = decode_signatures(&chain_encoded, hash, &[validator.address()], 1).unwrap();
        assert_eq!(decoded.val_indexes, vec![0]);
        assert_eq!(decoded.vs, vec![expected_v]);
    }

    #[tokio::test]
    async fn test_decode_bundle_quorum() {
        let validator = test_wallet(1);
        let gw = FakeEthereumGateway::new(gateway());
        let vmc = FakeValidatorManager::new(vec![validator.address()]);

        let mut r = receipt(TokenKind::Eth, 10);
        let hash = withdrawal_hash(&r, gateway(), U256::zero()).unwrap();
        r.oracle_signature = Bytes::from(sign_hash(&validator, hash).await);

        assert!(matches!(
            decode_signature_bundle(&r, &gw, &vmc, 2).await,
            Err(GatewayError::NoQuorum { have: 1, need: 2 })
        ));
        assert_eq!(decode_signature_bundle(&r, &gw, &vmc, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_signature_over_stale_nonce_matches_nobody() {
        let validator = test_wallet(1);
        let gw = FakeEthereumGateway::new(gateway());
        gw.set_nonce(owner(), U256::from(2));
        let vmc = FakeValidatorManager::new(vec![validator.address()]);

        let mut r = receipt(TokenKind::Erc20, 10);
        let stale = withdrawal_hash(&r, gateway(), U256::from(1)).unwrap();
        r.oracle_signature = Bytes::from(sign_hash(&validator, stale).await);

        let decoded = decode_signature_bundle(&r, &gw, &vmc, 0).await.unwrap();
        assert!(decoded.is_empty());
    }

    fn arb_address() -> impl Strategy<Value = Address> {
        any::<[u8; 20]>().prop_map(Address::from)
    }

    proptest! {
        #[test]
        fn prop_hash_is_deterministic_and_field_sensitive(
            owner_a in arb_address(),
            owner_b in arb_address(),
            token_a in arb_address(),
            token_b in arb_address(),
            gateway_a in arb_address(),
            gateway_b in arb_address(),
            amount_a in 1u64..,
            amount_b in 1u64..,
            nonce_a in any::<u64>(),
            nonce_b in any::<u64>(),
        ) {
            let base = WithdrawalReceipt {
                token_owner: ChainAddress::new("eth", owner_a),
                token_contract: Some(ChainAddress::new("eth", token_a)),
                token_kind: TokenKind::Erc20,
                token_id: U256::zero(),
                token_amount: U256::from(amount_a),
                withdrawal_nonce: U256::zero(),
                oracle_signature: Bytes::default(),
            };
            let hash = withdrawal_hash(&base, gateway_a, U256::from(nonce_a)).unwrap();
            prop_assert_eq!(hash, withdrawal_hash(&base.clone(), gateway_a, U256::from(nonce_a)).unwrap());

            if owner_a != owner_b {
                let mut r = base.clone();
                r.token_owner.local = owner_b;
                prop_assert_ne!(hash, withdrawal_hash(&r, gateway_a, U256::from(nonce_a)).unwrap());
            }
            if token_a != token_b {
                let mut r = base.clone();
                r.token_contract = Some(ChainAddress::new("eth", token_b));
                prop_assert_ne!(hash, withdrawal_hash(&r, gateway_a, U256::from(nonce_a)).unwrap());
            }
            if amount_a != amount_b {
                let mut r = base.clone();
                r.token_amount = U256::from(amount_b);
                prop_assert_ne!(hash, withdrawal_hash(&r, gateway_a, U256::from(nonce_a)).unwrap());
            }
            if nonce_a != nonce_b {
                prop_assert_ne!(hash, withdrawal_hash(&base, gateway_a, U256::from(nonce_b)).unwrap());
            }
            if gateway_a != gateway_b {
                prop_assert_ne!(hash, withdrawal_hash(&base, gateway_b, U256::from(nonce_a)).unwrap());
            }

            let mut nft = base.clone();
            nft.token_kind = TokenKind::Erc721;
            prop_assert_ne!(hash, withdrawal_hash(&nft, gateway_a, U256::from(nonce_a)).unwrap());
        }
    }
}
