/*
[INPUT]:  Gateway configuration
[OUTPUT]: Wired identity manager, relay pool and HTTP client for one CLI invocation
[POS]:    CLI layer - command context
[UPDATE]: When commands need new collaborators
*/

pub mod login;
pub mod wallet;

use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use tracing::debug;

use nostr_gateway_adapter::http::LogNavigator;
use nostr_gateway_adapter::relay::RelayConfig;
use nostr_gateway_adapter::{
    FileSessionStore, GatewayClient, Identity, IdentityManager, RelayClient, RelayTransport,
    RequestAuthenticator,
};

use crate::config::GatewayConfig;

/// Everything a command needs, built once from the config.
pub struct Gateway {
    config: GatewayConfig,
    relays: Arc<RelayClient>,
    manager: Arc<IdentityManager>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let session_path = config.session_path();
        debug!(session = %session_path.display(), "using session file");
        let relays = Arc::new(RelayClient::new(RelayConfig::default()));
        let manager = IdentityManager::new(Arc::new(FileSessionStore::new(session_path)))
            .with_transport(relays.clone())
            .with_config(config.manager_config());
        Self {
            config,
            relays,
            manager: Arc::new(manager),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<IdentityManager> {
        &self.manager
    }

    pub fn transport(&self) -> Arc<dyn RelayTransport> {
        self.relays.clone()
    }

    /// Connect the configured relays; already connected ones are skipped.
    pub async fn connect_relays(&self) -> Result<()> {
        let relays = self.config.relay_urls()?;
        self.relays
            .add_relays(&relays)
            .await
            .context("connect relays")
    }

    /// Restore the persisted session, if any.
    pub async fn restore(&self) -> Result<Option<Identity>> {
        self.manager.initialize().await.context("restore session")
    }

    pub async fn require_identity(&self) -> Result<Identity> {
        self.restore()
            .await?
            .context("not logged in, run one of the login commands first")
    }

    pub fn http_client(&self) -> Result<GatewayClient> {
        let authenticator = RequestAuthenticator::new(self.manager.clone(), Arc::new(LogNavigator))
            .with_enabled(self.config.auth_enabled);
        Ok(GatewayClient::new(&self.config.base_url)
            .context("build HTTP client")?
            .with_authenticator(Arc::new(authenticator)))
    }

    pub async fn shutdown(&self) {
        self.manager.teardown().await;
    }
}

pub async fn whoami(gateway: &Gateway) -> Result<()> {
    let Some(identity) = gateway.restore().await? else {
        println!("{}", style("not logged in").yellow());
        return Ok(());
    };
    print_identity(&identity);
    if let Some(session) = gateway.manager().session() {
        println!("expires:  {}", session.expires_at().to_rfc3339());
    }
    Ok(())
}

pub async fn logout(gateway: &Gateway) -> Result<()> {
    gateway.restore().await?;
    gateway.manager().logout().await.context("logout")?;
    println!("{}", style("logged out").green());
    Ok(())
}

/// Authenticated GET, printed as pretty JSON.
pub async fn get(gateway: &Gateway, path: &str) -> Result<()> {
    gateway.restore().await?;
    let client = gateway.http_client()?;
    let body: serde_json::Value = client
        .get(path)
        .await
        .with_context(|| format!("GET {path}"))?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub fn print_identity(identity: &Identity) {
    println!("identity: {}", style(&identity.display_id).cyan());
    println!("pubkey:   {}", identity.public_key.to_hex());
    println!("method:   {}", identity.signing_method);
    if !identity.can_sign() {
        println!("{}", style("read-only: signing is unavailable").dim());
    }
}
