//! CLI command implementations

use anyhow::{Context, Result};
use dialoguer::Confirm;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::account::{Account, AccountEvent, AccountParams};
use crate::cda::{parse_cda_magnet, serialize_cda_magnet, CdaParams, CdaTransfer};
use crate::config::{seed_from_env, Config, SEED_ENV};
use crate::network::HttpNetwork;
use crate::persistence::{RangeOptions, Record, StoreEvent};
use crate::signing::{Security, Seed, SeedSigner};

/// Build the account for the seed in the environment
fn open_account(config: &Config) -> Result<Account> {
    let seed = seed_from_env()?;
    let network = HttpNetwork::new(config.node_settings())
        .with_context(|| format!("Failed to create node client for {}", config.node.provider))?;

    let mut params = AccountParams::new(Arc::new(SeedSigner::new(seed)), Arc::new(network))
        .with_file_persistence(&config.account.persistence_path);
    params.security = config.security()?;
    params.attachment = config.attachment_params();

    Ok(Account::new(params))
}

/// Run the account: replay pending work and attach bundles until Ctrl-C
pub async fn start(config: &Config) -> Result<()> {
    info!("Starting account against {}", config.node.provider);
    info!(
        "Attachment: depth {}, mwm {}, delay {}ms",
        config.attachment.depth, config.attachment.min_weight_magnitude, config.attachment.delay_ms
    );

    let account = open_account(config)?;
    let mut events = account.subscribe();
    account.start().await.context("Failed to start account")?;

    let deposits = account.deposits().await?;
    let pending = account.pending_bundles().await?;
    info!(
        "{} deposit(s) available, {} bundle(s) awaiting inclusion",
        deposits.len(),
        pending.len()
    );

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => log_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event stream lagged, {} event(s) skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    account.stop().await.context("Failed to stop account")?;
    Ok(())
}

fn log_event(event: &AccountEvent) {
    match event {
        AccountEvent::Ready => info!("Account ready"),
        AccountEvent::Data(StoreEvent::Written(Record::Cda(input))) => {
            info!("New deposit address at index {}", input.index);
        }
        AccountEvent::Data(StoreEvent::Written(Record::Bundle(bundle))) => {
            info!("Bundle {} queued for attachment", bundle.hash);
        }
        AccountEvent::Data(data) => debug!("Store event: {:?}", data),
        AccountEvent::SelectedInput { input, .. } => {
            debug!("Selected input {} ({:?})", input.address, input.balance);
        }
        AccountEvent::PreparedTransfer { transfer, bundle } => {
            info!("Prepared bundle {} sending {} to {}", bundle.hash, transfer.value, transfer.cda.address);
        }
        AccountEvent::AttachedToTangle(transactions) => {
            if let Some(tail) = transactions.iter().find(|tx| tx.is_tail()) {
                info!("Attached bundle {} (tail {})", tail.bundle, tail.hash);
            }
        }
        AccountEvent::Included(bundle) => info!("Bundle {} included", bundle.hash),
        AccountEvent::Error(e) => error!("Attachment error: {}", e),
    }
}

/// Generate a new conditional deposit address and print its magnet link
pub async fn generate(
    config: &Config,
    timeout_secs: u64,
    multi_use: bool,
    expected_amount: Option<u64>,
    security: Option<u8>,
) -> Result<()> {
    let security = security
        .map(Security::try_from)
        .transpose()
        .context("Invalid security level")?;

    let now = u64::try_from(chrono::Utc::now().timestamp()).context("System clock before epoch")?;
    let params = CdaParams {
        timeout_at: now + timeout_secs,
        multi_use,
        expected_amount,
        security,
    };

    let account = open_account(config)?;
    let cda = account.generate_cda(params).await?;
    account.stop().await?;

    println!("\nDeposit address: {}", cda.address);
    println!(
        "Expires:         {}",
        chrono::DateTime::from_timestamp(cda.timeout_at as i64, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| cda.timeout_at.to_string())
    );
    println!("Multi-use:       {}", cda.multi_use);
    if let Some(expected) = cda.expected_amount {
        println!("Expected amount: {}", expected);
    }
    println!("\nMagnet: {}\n", serialize_cda_magnet(&cda));

    Ok(())
}

/// Send `value` to the CDA behind a magnet link
pub async fn send(config: &Config, magnet: &str, value: u64, force: bool) -> Result<()> {
    let cda = parse_cda_magnet(magnet).context("Invalid magnet link")?;
    info!("Send command: value={}, address={}", value, cda.address);

    if !force {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Send {} to {}? This cannot be undone.",
                value, cda.address
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Send cancelled by user");
            return Ok(());
        }
    }

    let account = open_account(config)?;
    let result = account.send_to_cda(CdaTransfer { cda, value }).await;
    account.stop().await?;

    match result {
        Ok(bundle) => {
            println!("\nTransfer prepared!");
            println!("Bundle: {}", bundle.hash);
            println!("Run `account start` to attach it and wait for inclusion.\n");
            Ok(())
        }
        Err(e) => {
            error!("Send failed: {}", e);
            anyhow::bail!("Send failed: {}", e);
        }
    }
}

/// Show included deposits and transfers
pub async fn history(config: &Config, limit: usize) -> Result<()> {
    let account = open_account(config)?;
    account.ready().await?;

    let options = RangeOptions {
        limit: Some(limit),
        ..Default::default()
    };
    let deposits = account.read_included_deposits(options.clone()).await?;
    let transfers = account.read_included_transfers(options).await?;
    let pending = account.pending_bundles().await?;
    account.stop().await?;

    println!("\n=== DEPOSITS ===\n");
    if deposits.is_empty() {
        println!("No deposit history found.");
    } else {
        println!("{:<22} {:<8} {:<14} {:<12}", "DATE", "INDEX", "BALANCE", "ADDRESS");
        println!("{}", "-".repeat(60));
        for entry in &deposits {
            println!(
                "{:<22} {:<8} {:<14} {}...",
                entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                entry.index,
                entry.balance,
                short(&entry.cda.address)
            );
        }
    }

    println!("\n=== TRANSFERS ===\n");
    if transfers.is_empty() {
        println!("No transfer history found.");
    } else {
        println!("{:<22} {:<14} {:<12}", "DATE", "VALUE", "BUNDLE");
        println!("{}", "-".repeat(50));
        for entry in &transfers {
            let value: i64 = entry.bundle.outputs().map(|tx| tx.value).sum();
            println!(
                "{:<22} {:<14} {}...",
                entry.included_at.format("%Y-%m-%d %H:%M:%S"),
                value,
                short(&entry.bundle.hash)
            );
        }
    }

    if !pending.is_empty() {
        println!("\n{} bundle(s) awaiting inclusion", pending.len());
    }

    println!();
    Ok(())
}

fn short(trytes: &str) -> &str {
    trytes.get(..12).unwrap_or(trytes)
}

/// Show current configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    println!("Seed: read from {}", SEED_ENV);
    Ok(())
}

/// Generate a fresh random seed
pub fn seed(force: bool) -> Result<()> {
    if !force {
        let confirmed = Confirm::new()
            .with_prompt("Print a new seed to the terminal?")
            .default(true)
            .interact()?;

        if !confirmed {
            return Ok(());
        }
    }

    let seed = Seed::random();
    println!("\n{}\n", seed.expose());
    println!("WARNING: anyone holding this seed controls the funds of its addresses.");
    println!("Store it offline and export it as {} to use it.\n", SEED_ENV);
    Ok(())
}
