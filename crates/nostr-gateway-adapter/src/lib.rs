/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public nostr gateway adapter crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod auth;
pub mod http;
pub mod relay;
pub mod types;
pub mod wallet;

// Re-export commonly used types from auth
pub use auth::{
    AuthState,
    ExtensionProvider,
    FileSessionStore,
    IdentityChange,
    IdentityManager,
    Keys,
    LoginParams,
    MemorySessionStore,
    NostrSigner,
    RemoteSignerHandshake,
    SessionStore,
    SignerBackend,
};

// Re-export commonly used types from http
pub use http::{
    ClientConfig,
    GatewayClient,
    GatewayError,
    LoginNavigator,
    RequestAuthenticator,
    Result,
};

// Re-export commonly used types from relay
pub use relay::{Filter, MemoryRelay, RelayClient, RelayTransport};

// Re-export all types
pub use types::*;

// Re-export commonly used types from wallet
pub use wallet::{ReconcileOutcome, ReconcileWarning, Wallet, WalletState};
