/*
[INPUT]:  Keys, signer providers, relay transport and persisted sessions
[OUTPUT]: Signer backends, remote signer pairing and the identity lifecycle
[POS]:    Auth layer - who the user is and what can sign for them
[UPDATE]: When a backend, the pairing flow or session rules change
*/

pub mod extension;
pub mod handshake;
pub mod keys;
pub mod local;
pub mod manager;
pub mod nip44;
pub mod observer;
pub mod read_only;
pub mod remote;
pub mod session;
pub mod signer;
pub mod uri;

pub use extension::{ExtensionProvider, ExtensionSigner, MockExtensionProvider};
pub use handshake::{
    DEFAULT_HANDSHAKE_TIMEOUT, HandshakeConfig, HandshakeControls, HandshakeTriggers, Presentation,
    RemoteSignerHandshake, handshake_triggers,
};
pub use keys::Keys;
pub use local::LocalKeySigner;
pub use manager::{AuthState, IdentityManager, LoginParams, ManagerConfig};
pub use observer::{IdentityChange, ObserverRegistry, Subscription};
pub use read_only::ReadOnlySigner;
pub use remote::{
    DEFAULT_REQUEST_TIMEOUT, RemoteBinding, RemoteSigner, RpcMessage, RpcRequest, RpcResponse,
    open_rpc, seal_rpc,
};
pub use session::{
    DEFAULT_SESSION_FILE, FileSessionStore, MemorySessionStore, Session, SessionCredential,
    SessionRecord, SessionStore, default_session_ttl,
};
pub use signer::{NostrSigner, SignerBackend};
pub use uri::{BUNKER_SCHEME, BunkerUri, ConnectionRequest, NOSTR_CONNECT_SCHEME, Permission};
