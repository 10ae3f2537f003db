/*
[INPUT]:  A throwaway local key and the in-process relay
[OUTPUT]: Wallet receive/spend walk-through and a signed request header
[POS]:    Examples - identity and wallet flow demonstration
[UPDATE]: When the login or wallet surface changes
*/

use std::sync::Arc;

use nostr_gateway_adapter::http::{build_auth_event, encode_header};
use nostr_gateway_adapter::*;
use reqwest::Method;
use url::Url;

/// Example: identity and wallet flow
///
/// 1. Log in with a fresh local key
/// 2. Sign an Authorization header for one request
/// 3. Receive proofs, then spend part of them
#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Nostr Gateway Wallet Example ===\n");

    let manager = IdentityManager::new(Arc::new(MemorySessionStore::new()));
    let keys = Keys::generate();
    let identity = manager
        .login(LoginParams::LocalKey {
            secret: keys.secret_key_hex(),
        })
        .await?;
    println!("✓ Logged in as {}", identity.display_id);

    let signer = manager.signer()?;
    let url = Url::parse("http://localhost:8080/api/mints")?;
    let event = signer
        .sign_event(build_auth_event(&url, &Method::GET, "application/json"))
        .await?;
    let header = encode_header(&event)?;
    println!("✓ Authorization: {}...", &header[..40.min(header.len())]);

    let relay = Arc::new(MemoryRelay::new());
    let wallet = Wallet::new(signer, relay.clone());
    let mint = "https://mint.example";
    wallet.init(vec![mint.to_string()]).await?;

    let c = "02698c4e2b5f9534cd0687d87513c759790cf829aa5739184a3e3735471fbda904";
    let received = wallet
        .receive(
            mint,
            vec![
                Proof::new("009a1f293253e41e", 64, "example-a", c),
                Proof::new("009a1f293253e41e", 32, "example-b", c),
            ],
            vec![],
        )
        .await?;
    println!("✓ Received {} sat in {}", received.amount, received.token_set_id);

    let spent = wallet
        .spend(
            mint,
            vec![Proof::new("009a1f293253e41e", 64, "example-a", c)],
            vec![Proof::new("009a1f293253e41e", 8, "example-change", c)],
        )
        .await?;
    for warning in &spent.warnings {
        println!("  warning: {warning}");
    }
    println!("✓ Spent {} sat, balance now {} sat", spent.amount, wallet.balance().await?);
    println!("  {} events on the relay", relay.events().len());

    println!("\n✓ Wallet example complete");
    Ok(())
}
