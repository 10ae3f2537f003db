/*
[INPUT]:  Handshake parameters or user-pasted connection strings
[OUTPUT]: nostrconnect:// requests and parsed bunker:// bindings
[POS]:    Auth layer - remote signer URI codecs
[UPDATE]: When URI parameters change
*/

use std::fmt;
use std::str::FromStr;

use url::Url;
use url::form_urlencoded;

use crate::http::{GatewayError, Result};
use crate::types::{Kind, PublicKey};

pub const NOSTR_CONNECT_SCHEME: &str = "nostrconnect";
pub const BUNKER_SCHEME: &str = "bunker";

/// A capability requested from the remote signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    SignEvent(Kind),
    Nip44Encrypt,
    Nip44Decrypt,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::SignEvent(kind) => write!(f, "sign_event:{kind}"),
            Permission::Nip44Encrypt => f.write_str("nip44_encrypt"),
            Permission::Nip44Decrypt => f.write_str("nip44_decrypt"),
        }
    }
}

impl FromStr for Permission {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nip44_encrypt" => Ok(Permission::Nip44Encrypt),
            "nip44_decrypt" => Ok(Permission::Nip44Decrypt),
            other => {
                let kind = other
                    .strip_prefix("sign_event:")
                    .and_then(|kind| kind.parse::<u16>().ok())
                    .ok_or_else(|| GatewayError::InvalidUri(format!("unknown permission {other}")))?;
                Ok(Permission::SignEvent(Kind(kind)))
            }
        }
    }
}

fn parse_relays(url: &Url) -> Result<Vec<Url>> {
    url.query_pairs()
        .filter(|(key, _)| key == "relay")
        .map(|(_, value)| {
            Url::parse(&value).map_err(|e| GatewayError::InvalidUri(format!("bad relay {value}: {e}")))
        })
        .collect()
}

fn query_value(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn host_key(url: &Url, scheme: &str) -> Result<PublicKey> {
    if url.scheme() != scheme {
        return Err(GatewayError::InvalidUri(format!(
            "expected {scheme}:// but got {}://",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| GatewayError::InvalidUri(format!("{scheme} uri without public key")))?;
    PublicKey::parse(host).map_err(|e| GatewayError::InvalidUri(format!("bad public key: {e}")))
}

/// Client-initiated connection request, shown as a QR code or handed to an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub client_pubkey: PublicKey,
    pub relays: Vec<Url>,
    pub secret: String,
    pub perms: Vec<Permission>,
    pub name: String,
    pub url: String,
}

impl ConnectionRequest {
    pub fn to_uri(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for relay in &self.relays {
            query.append_pair("relay", relay.as_str());
        }
        query.append_pair("secret", &self.secret);
        if !self.perms.is_empty() {
            let perms = self
                .perms
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            query.append_pair("perms", &perms);
        }
        query.append_pair("name", &self.name);
        query.append_pair("url", &self.url);
        format!(
            "{NOSTR_CONNECT_SCHEME}://{}?{}",
            self.client_pubkey.to_hex(),
            query.finish()
        )
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri.trim()).map_err(|e| GatewayError::InvalidUri(e.to_string()))?;
        let client_pubkey = host_key(&url, NOSTR_CONNECT_SCHEME)?;
        let relays = parse_relays(&url)?;
        if relays.is_empty() {
            return Err(GatewayError::InvalidUri("connection request without relay".into()));
        }
        let secret = query_value(&url, "secret")
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| GatewayError::InvalidUri("connection request without secret".into()))?;
        let perms = match query_value(&url, "perms") {
            Some(perms) if !perms.is_empty() => perms
                .split(',')
                .map(str::parse)
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };
        Ok(Self {
            client_pubkey,
            relays,
            secret,
            perms,
            name: query_value(&url, "name").unwrap_or_default(),
            url: query_value(&url, "url").unwrap_or_default(),
        })
    }
}

/// Signer-initiated connection string pasted by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerUri {
    pub remote_signer_pubkey: PublicKey,
    pub relays: Vec<Url>,
    pub secret: Option<String>,
}

impl BunkerUri {
    pub fn to_uri(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for relay in &self.relays {
            query.append_pair("relay", relay.as_str());
        }
        if let Some(secret) = &self.secret {
            query.append_pair("secret", secret);
        }
        format!(
            "{BUNKER_SCHEME}://{}?{}",
            self.remote_signer_pubkey.to_hex(),
            query.finish()
        )
    }
}

impl FromStr for BunkerUri {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s.trim()).map_err(|e| GatewayError::InvalidUri(e.to_string()))?;
        let remote_signer_pubkey = host_key(&url, BUNKER_SCHEME)?;
        let relays = parse_relays(&url)?;
        if relays.is_empty() {
            return Err(GatewayError::InvalidUri("bunker uri without relay".into()));
        }
        Ok(Self {
            remote_signer_pubkey,
            relays,
            secret: query_value(&url, "secret").filter(|secret| !secret.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Keys;
    use rstest::rstest;

    fn request(keys: &Keys) -> ConnectionRequest {
        ConnectionRequest {
            client_pubkey: keys.public_key(),
            relays: vec![
                Url::parse("wss://relay.one").unwrap(),
                Url::parse("wss://relay.two/path").unwrap(),
            ],
            secret: "5e4c1d".into(),
            perms: vec![
                Permission::SignEvent(Kind::HTTP_AUTH),
                Permission::Nip44Encrypt,
                Permission::Nip44Decrypt,
            ],
            name: "Gateway Client".into(),
            url: "https://app.example".into(),
        }
    }

    #[test]
    fn test_connection_request_uri_layout() {
        let keys = Keys::generate();
        let uri = request(&keys).to_uri();
        assert!(uri.starts_with(&format!("nostrconnect://{}?relay=", keys.public_key().to_hex())));
        assert!(uri.contains("secret=5e4c1d"));
        assert!(uri.contains("name=Gateway+Client"));
    }

    #[test]
    fn test_connection_request_parse_restores_fields() {
        let keys = Keys::generate();
        let original = request(&keys);
        let parsed = ConnectionRequest::parse(&original.to_uri()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_bunker_uri_parse() {
        let keys = Keys::generate();
        let raw = format!(
            "bunker://{}?relay=wss%3A%2F%2Frelay.one&relay=wss://relay.two&secret=abc",
            keys.public_key().to_hex()
        );
        let bunker: BunkerUri = raw.parse().unwrap();
        assert_eq!(bunker.remote_signer_pubkey, keys.public_key());
        assert_eq!(bunker.relays.len(), 2);
        assert_eq!(bunker.secret.as_deref(), Some("abc"));
    }

    #[test]
    fn test_bunker_secret_is_optional() {
        let keys = Keys::generate();
        let raw = format!("bunker://{}?relay=wss://relay.one", keys.public_key().to_hex());
        let bunker: BunkerUri = raw.parse().unwrap();
        assert!(bunker.secret.is_none());
    }

    #[rstest]
    #[case("https://example.com")]
    #[case("bunker://not-a-key?relay=wss://relay.one")]
    #[case("bunker://79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")]
    #[case("bunker://79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798?relay=%%%")]
    #[case("")]
    fn test_bunker_uri_rejects(#[case] raw: &str) {
        assert!(matches!(raw.parse::<BunkerUri>(), Err(GatewayError::InvalidUri(_))));
    }

    #[rstest]
    #[case("sign_event:27235", Permission::SignEvent(Kind::HTTP_AUTH))]
    #[case("nip44_encrypt", Permission::Nip44Encrypt)]
    #[case("nip44_decrypt", Permission::Nip44Decrypt)]
    fn test_permission_strings(#[case] raw: &str, #[case] expected: Permission) {
        assert_eq!(raw.parse::<Permission>().unwrap(), expected);
        assert_eq!(expected.to_string(), raw);
    }
}
