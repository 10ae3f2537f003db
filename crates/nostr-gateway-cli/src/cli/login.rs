/*
[INPUT]:  Secret keys, public keys, bunker strings or a fresh pairing request
[OUTPUT]: A persisted session for the chosen signing method
[POS]:    CLI layer - login commands
[UPDATE]: When login methods change
*/

use anyhow::{Context, Result};
use console::style;
use dialoguer::Password;
use dialoguer::theme::ColorfulTheme;
use std::io::BufRead;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use nostr_gateway_adapter::auth::{BUNKER_SCHEME, HandshakeControls, handshake_triggers};
use nostr_gateway_adapter::{ClientContext, LoginParams, RemoteSignerHandshake};

use super::{Gateway, print_identity};

pub async fn login_key(gateway: &Gateway, secret: Option<String>) -> Result<()> {
    let secret = match secret {
        Some(secret) => secret,
        None => Password::with_theme(&ColorfulTheme::default())
            .with_prompt("Secret key (nsec or hex)")
            .interact()
            .context("read secret key")?,
    };
    login(gateway, LoginParams::LocalKey { secret }).await
}

pub async fn login_readonly(gateway: &Gateway, public_key: String) -> Result<()> {
    login(gateway, LoginParams::ReadOnly { public_key }).await
}

pub async fn login_bunker(gateway: &Gateway, uri: String) -> Result<()> {
    login(gateway, LoginParams::Bunker { uri }).await
}

/// Print a nostrconnect URI and wait for the signer app to answer.
///
/// While waiting, a pasted `bunker://` line completes the pairing through the
/// signer named in it, and an empty line re-checks the relays. Ctrl-C cancels.
pub async fn connect(gateway: &Gateway) -> Result<()> {
    let handshake = RemoteSignerHandshake::new(gateway.transport(), gateway.config().handshake_config()?)
        .context("prepare connection request")?;
    let presentation = handshake.present(ClientContext::Desktop);
    println!("{}", style("Paste this into your signer app:").bold());
    println!("{}", presentation.uri());
    println!(
        "{}",
        style(format!(
            "waiting up to {}s... (paste a bunker:// string, or press enter to re-check)",
            handshake.timeout().as_secs()
        ))
        .dim()
    );

    let (triggers, controls) = handshake_triggers();
    let cancel = {
        let controls = controls.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("received SIGINT, cancelling pairing");
                    controls.cancel();
                }
                Err(err) => warn!(error = %err, "failed to install SIGINT handler"),
            }
        })
    };
    let input = tokio::spawn(forward_input(stdin_lines(), controls));

    let result = login(gateway, LoginParams::RemoteSigner { handshake, triggers }).await;
    cancel.abort();
    input.abort();
    result
}

#[derive(Debug, PartialEq, Eq)]
enum PairingInput {
    Bunker(String),
    Recheck,
    Unknown,
}

fn classify(line: &str) -> PairingInput {
    let line = line.trim();
    if line.is_empty() {
        PairingInput::Recheck
    } else if line.starts_with(&format!("{BUNKER_SCHEME}://")) {
        PairingInput::Bunker(line.to_string())
    } else {
        PairingInput::Unknown
    }
}

// detached so a pending read never blocks runtime shutdown
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(4);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn forward_input(mut lines: mpsc::Receiver<String>, controls: HandshakeControls) {
    while let Some(line) = lines.recv().await {
        match classify(&line) {
            PairingInput::Bunker(uri) => {
                if controls.submit_bunker(uri).await.is_err() {
                    break;
                }
            }
            PairingInput::Recheck => controls.notify_focus(),
            PairingInput::Unknown => {
                debug!("ignoring input while pairing");
                println!("{}", style("expected a bunker:// string").yellow());
            }
        }
    }
}

async fn login(gateway: &Gateway, params: LoginParams) -> Result<()> {
    let method = params.method();
    let identity = gateway
        .manager()
        .login(params)
        .await
        .with_context(|| format!("{method} login"))?;
    println!("{}", style("logged in").bold().green());
    print_identity(&identity);
    Ok(())
}
