/*
[INPUT]:  CLI arguments, optional YAML configuration file
[OUTPUT]: Login, session and wallet commands against the gateway
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, subcommands, or startup flow
*/

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nostr_gateway_cli::cli::{self, login, wallet};
use nostr_gateway_cli::{Gateway, GatewayConfig};

#[derive(Parser, Debug)]
#[command(name = "nostr-gateway", version, about = "Nostr identity and wallet client for the gateway API")]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long = "dry-run")]
    dry_run: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in with a secret key (prompts when omitted)
    LoginKey {
        #[arg(long)]
        nsec: Option<String>,
    },
    /// Log in with a public key only; nothing can be signed
    LoginReadonly { public_key: String },
    /// Log in through a bunker:// string
    LoginBunker { uri: String },
    /// Pair with a signer app through a nostrconnect:// request
    Connect,
    Whoami,
    Logout,
    /// Authenticated GET against the gateway, printed as JSON
    Get { path: String },
    Balance,
    History,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(&args.log_level)?;

    let config = load_config(args.config_path.as_ref())?;
    info!(
        base_url = %config.base_url,
        relays = config.relays.len(),
        dry_run = args.dry_run,
        "configuration loaded"
    );

    if args.dry_run {
        info!(session = %config.session_path().display(), "dry-run requested; configuration validated");
        return Ok(());
    }

    let Some(command) = args.command else {
        return Err(anyhow!("no command given, see --help"));
    };

    let gateway = Gateway::new(config);
    let result = run(&gateway, command).await;
    gateway.shutdown().await;
    result
}

async fn run(gateway: &Gateway, command: Command) -> Result<()> {
    match command {
        Command::LoginKey { nsec } => login::login_key(gateway, nsec).await,
        Command::LoginReadonly { public_key } => login::login_readonly(gateway, public_key).await,
        Command::LoginBunker { uri } => login::login_bunker(gateway, uri).await,
        Command::Connect => login::connect(gateway).await,
        Command::Whoami => cli::whoami(gateway).await,
        Command::Logout => cli::logout(gateway).await,
        Command::Get { path } => cli::get(gateway, &path).await,
        Command::Balance => wallet::balance(gateway).await,
        Command::History => wallet::history(gateway).await,
    }
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<GatewayConfig> {
    match path {
        Some(path) => GatewayConfig::from_file(path).context("load config"),
        None => {
            let config = GatewayConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}
