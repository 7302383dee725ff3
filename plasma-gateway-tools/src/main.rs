//! plasma-gateway-tools
//!
//! Operator commands against a live Ethereum endpoint:
//! 1. Reconcile deposit/withdrawal history for an account
//! 2. Print the canonical withdrawal hash of a receipt
//! 3. Decode a receipt's oracle signature against the validator set
//! 4. Read the token allowances an account granted the gateways

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::providers::{Http, Provider};
use ethers::types::Address;
use plasma_gateway::evm::{
    EvmGateway, EvmTokenLedger, EvmValidatorManager, EvmValueTransfer, GatewayGeneration,
};
use plasma_gateway::{
    build_withdrawal_hash, decode_signature_bundle, parse_address, EthereumGatewayContract,
    EthereumGateways, GatewayConfig, HistoryLog, StaticTokenMetadata, TokenKind, TokenLedger,
    TokenNetwork, WithdrawalReceipt, ETH_SYMBOL, LOOM_SYMBOL,
};
use serde::Serialize;
use tracing::info;

type Client = Provider<Http>;

#[derive(Parser)]
#[command(
    name = "plasma-gateway-tools",
    about = "Inspect plasma gateway withdrawals and history"
)]
struct Cli {
    /// Ethereum JSON-RPC endpoint.
    #[arg(long, env = "ETHEREUM_RPC_URL", default_value = "http://127.0.0.1:8545")]
    rpc_url: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the deposit/withdrawal history of an account and print it as JSON.
    History(HistoryArgs),
    /// Print the hash a receipt's oracle signature has to cover.
    WithdrawalHash(ReceiptArgs),
    /// Decode a receipt's oracle signature into the multisig argument arrays.
    DecodeSignature(DecodeArgs),
    /// Print the allowances an account granted the gateways.
    Allowances(AllowanceArgs),
}

#[derive(Args)]
struct HistoryArgs {
    /// Account whose gateway events are collected.
    #[arg(long)]
    address: String,
    /// Comma separated token symbols.
    #[arg(long, value_delimiter = ',', default_value = "ETH")]
    symbols: Vec<String>,
    /// Ethereum token contract as SYMBOL=0xADDRESS, repeatable.
    #[arg(long = "token")]
    tokens: Vec<String>,
}

#[derive(Args)]
struct AllowanceArgs {
    /// Token owner.
    #[arg(long)]
    owner: String,
    /// Ethereum token contract as SYMBOL=0xADDRESS, repeatable.
    #[arg(long = "token", required = true)]
    tokens: Vec<String>,
}

#[derive(Args)]
struct ReceiptArgs {
    /// Receipt as JSON.
    #[arg(long)]
    receipt: PathBuf,
}

#[derive(Args)]
struct DecodeArgs {
    #[command(flatten)]
    receipt: ReceiptArgs,
    #[arg(long, default_value_t = 1)]
    min_signatures: usize,
}

#[derive(Serialize)]
struct HashOutput {
    hash: String,
    gateway: Address,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plasma_gateway=info,plasma_gateway_tools=info".into()),
        )
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = GatewayConfig::from_env().context("loading gateway configuration")?;
    let client = Arc::new(
        Provider::<Http>::try_from(cli.rpc_url.as_str())
            .with_context(|| format!("invalid rpc url {}", cli.rpc_url))?,
    );
    info!(rpc = %cli.rpc_url, main = ?config.main_gateway, loom = ?config.loom_gateway, "connected");

    match cli.command {
        Commands::History(args) => history(&config, client, args).await,
        Commands::WithdrawalHash(args) => withdrawal_hash(&config, client, args).await,
        Commands::DecodeSignature(args) => decode_signature(&config, client, args).await,
        Commands::Allowances(args) => allowances(&config, client, args).await,
    }
}

fn generation(multisig: bool) -> GatewayGeneration {
    if multisig {
        GatewayGeneration::Multisig
    } else {
        GatewayGeneration::SingleSigner
    }
}

fn main_gateway(config: &GatewayConfig, client: &Arc<Client>) -> EvmGateway<Client> {
    EvmGateway::new(
        Arc::clone(client),
        config.main_gateway,
        generation(config.multisig.main),
    )
}

fn loom_gateway(config: &GatewayConfig, client: &Arc<Client>) -> EvmGateway<Client> {
    EvmGateway::new(
        Arc::clone(client),
        config.loom_gateway,
        generation(config.multisig.loom),
    )
}

/// Gateway that releases funds for `receipt`.
fn receipt_gateway(
    config: &GatewayConfig,
    client: &Arc<Client>,
    receipt: &WithdrawalReceipt,
) -> EvmGateway<Client> {
    match receipt.token_kind {
        TokenKind::LoomCoin => loom_gateway(config, client),
        _ => main_gateway(config, client),
    }
}

fn read_receipt(path: &PathBuf) -> Result<WithdrawalReceipt> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing receipt {}", path.display()))
}

fn parse_token_arg(arg: &str) -> Result<(String, Address)> {
    let (symbol, address) = arg
        .split_once('=')
        .with_context(|| format!("expected SYMBOL=0xADDRESS, got {arg:?}"))?;
    Ok((symbol.trim().to_uppercase(), parse_address(address.trim())?))
}

async fn history(config: &GatewayConfig, client: Arc<Client>, args: HistoryArgs) -> Result<()> {
    let account = parse_address(&args.address)?;

    let mut metadata = StaticTokenMetadata::new();
    let mut addresses = Vec::new();
    for arg in &args.tokens {
        let (symbol, address) = parse_token_arg(arg)?;
        metadata = metadata.with_token(symbol.clone(), 18, Some(address), None);
        addresses.push((symbol, address));
    }

    let mut gateways = EthereumGateways::new(
        Arc::new(main_gateway(config, &client)),
        Arc::new(loom_gateway(config, &client)),
        None,
        Default::default(),
        Arc::new(EvmValueTransfer::new(Arc::clone(&client))),
    )?;
    for symbol in &args.symbols {
        let symbol = symbol.trim().to_uppercase();
        let token_address = match symbol.as_str() {
            ETH_SYMBOL => Address::zero(),
            _ => match addresses.iter().find(|(s, _)| *s == symbol) {
                Some((_, address)) => *address,
                None => bail!("no --token address given for {symbol}"),
            },
        };
        gateways.add(&symbol, token_address);
    }
    let tracked: Vec<_> = gateways
        .symbols()
        .iter()
        .map(|symbol| gateways.tracked_token(symbol))
        .collect();

    let mut log = HistoryLog::new();
    let report = log.refresh(&tracked, account, &metadata).await;
    info!(
        entries = log.entries().len(),
        failures = report.failures.len(),
        "history reconciled"
    );

    let output = serde_json::json!({
        "report": report,
        "entries": log.entries(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn withdrawal_hash(config: &GatewayConfig, client: Arc<Client>, args: ReceiptArgs) -> Result<()> {
    let receipt = read_receipt(&args.receipt)?;
    let gateway = receipt_gateway(config, &client, &receipt);
    let hash = build_withdrawal_hash(&receipt, &gateway)
        .await
        .context("building withdrawal hash")?;

    let output = HashOutput {
        hash: format!("{hash:?}"),
        gateway: gateway.address(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn decode_signature(config: &GatewayConfig, client: Arc<Client>, args: DecodeArgs) -> Result<()> {
    let receipt = read_receipt(&args.receipt.receipt)?;
    let gateway = receipt_gateway(config, &client, &receipt);
    if gateway.generation() != GatewayGeneration::Multisig {
        bail!(
            "gateway {:?} is not configured as multisig",
            gateway.address()
        );
    }

    let vmc_address = gateway
        .validator_manager_address()
        .await
        .context("reading validator manager address")?;
    let validator_manager = EvmValidatorManager::new(Arc::clone(&client), vmc_address);
    let decoded = decode_signature_bundle(&receipt, &gateway, &validator_manager, args.min_signatures)
        .await
        .context("decoding oracle signature")?;

    println!("{}", serde_json::to_string_pretty(&decoded)?);
    Ok(())
}

async fn allowances(config: &GatewayConfig, client: Arc<Client>, args: AllowanceArgs) -> Result<()> {
    let owner = parse_address(&args.owner)?;

    let mut metadata = StaticTokenMetadata::new();
    for arg in &args.tokens {
        let (symbol, address) = parse_token_arg(arg)?;
        metadata = metadata.with_token(symbol, 18, Some(address), None);
    }
    let symbols = metadata.symbols();
    let ledger = EvmTokenLedger::new(Arc::clone(&client), Arc::new(metadata));

    let mut output = serde_json::Map::new();
    for symbol in symbols {
        let spender = match symbol.as_str() {
            LOOM_SYMBOL => config.loom_gateway,
            _ => config.main_gateway,
        };
        let amount = ledger
            .allowance(TokenNetwork::Ethereum, &symbol, owner, spender)
            .await
            .with_context(|| format!("reading {symbol} allowance"))?;
        output.insert(symbol, serde_json::Value::String(amount.to_string()));
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
