/*
[INPUT]:  Restored identity and the configured relays
[OUTPUT]: Wallet balances and spending history on stdout
[POS]:    CLI layer - wallet commands
[UPDATE]: When wallet views change
*/

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use console::style;

use nostr_gateway_adapter::{Direction, NostrSigner, Wallet};

use super::Gateway;

async fn open_wallet(gateway: &Gateway) -> Result<Wallet> {
    gateway.require_identity().await?;
    gateway.connect_relays().await?;
    let signer: Arc<dyn NostrSigner> = gateway.manager().signer().context("active signer")?;
    Ok(Wallet::new(signer, gateway.transport()))
}

pub async fn balance(gateway: &Gateway) -> Result<()> {
    let wallet = open_wallet(gateway).await?;
    let state = wallet.load().await.context("load wallet")?;
    let balances = state.balances().context("sum balances")?;
    if balances.is_empty() {
        println!("{}", style("no proofs held").dim());
        return Ok(());
    }
    for (mint, amount) in &balances {
        println!("{mint}: {amount} sat");
    }
    println!("{}", style(format!("total: {} sat", state.total_balance()?)).bold());
    Ok(())
}

pub async fn history(gateway: &Gateway) -> Result<()> {
    let wallet = open_wallet(gateway).await?;
    let entries = wallet.history().await.context("load history")?;
    if entries.is_empty() {
        println!("{}", style("no history").dim());
        return Ok(());
    }
    for entry in entries {
        let when = DateTime::<Utc>::from_timestamp(entry.created_at as i64, 0)
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| entry.created_at.to_string());
        let sign = match entry.record.direction {
            Direction::In => style("+").green(),
            Direction::Out => style("-").red(),
        };
        println!("{when} {sign}{} sat", entry.record.amount);
    }
    Ok(())
}
