/*
[INPUT]:  Secret scalar, peer x-only public key, plaintext or base64 payload
[OUTPUT]: NIP-44 v2 payloads (ECDH + HKDF + ChaCha20 + HMAC-SHA256)
[POS]:    Auth layer - authenticated encryption for signer RPC and wallet content
[UPDATE]: When a new payload version is supported
*/

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use k256::NonZeroScalar;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::http::{GatewayError, Result};
use crate::types::PublicKey;

const VERSION: u8 = 2;
const SALT: &[u8] = b"nip44-v2";
const MIN_PLAINTEXT: usize = 1;
const MAX_PLAINTEXT: usize = 65_535;
// version(1) + nonce(32) + smallest padded block(2 + 32) + mac(32)
const MIN_PAYLOAD: usize = 99;
const MAX_PAYLOAD: usize = 65_603;

/// Shared secret between two keypairs, identical from either side.
#[derive(Clone, PartialEq, Eq)]
pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    pub fn derive(secret: &NonZeroScalar, peer: &PublicKey) -> Result<Self> {
        let mut sec1 = [0u8; 33];
        sec1[0] = 0x02;
        sec1[1..].copy_from_slice(peer.as_bytes());
        let point = k256::PublicKey::from_sec1_bytes(&sec1)
            .map_err(|_| GatewayError::Crypto(format!("peer key {peer} is not a curve point")))?;
        let shared = k256::ecdh::diffie_hellman(secret, point.as_affine());
        let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), shared.raw_secret_bytes().as_slice());
        Ok(Self(prk.into()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn message_keys(&self, nonce: &[u8; 32]) -> Result<MessageKeys> {
        let hkdf = Hkdf::<Sha256>::from_prk(&self.0)
            .map_err(|_| GatewayError::Crypto("conversation key has invalid length".into()))?;
        let mut okm = [0u8; 76];
        hkdf.expand(nonce, &mut okm)
            .map_err(|_| GatewayError::Crypto("message key expansion failed".into()))?;

        let mut keys = MessageKeys {
            chacha_key: [0u8; 32],
            chacha_nonce: [0u8; 12],
            hmac_key: [0u8; 32],
        };
        keys.chacha_key.copy_from_slice(&okm[..32]);
        keys.chacha_nonce.copy_from_slice(&okm[32..44]);
        keys.hmac_key.copy_from_slice(&okm[44..]);
        Ok(keys)
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey(..)")
    }
}

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

impl MessageKeys {
    fn apply_keystream(&self, buf: &mut [u8]) -> Result<()> {
        let mut cipher = ChaCha20::new_from_slices(&self.chacha_key, &self.chacha_nonce)
            .map_err(|_| GatewayError::Crypto("invalid chacha20 key or nonce".into()))?;
        cipher.apply_keystream(buf);
        Ok(())
    }

    fn mac(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Hmac<Sha256>> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.hmac_key)
            .map_err(|_| GatewayError::Crypto("invalid hmac key".into()))?;
        mac.update(nonce);
        mac.update(ciphertext);
        Ok(mac)
    }
}

/// Length of the padded plaintext block (excluding the 2-byte length prefix).
pub fn padded_len(unpadded: usize) -> usize {
    if unpadded <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (unpadded - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((unpadded - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT..=MAX_PLAINTEXT).contains(&len) {
        return Err(GatewayError::Crypto(format!(
            "plaintext length {len} outside {MIN_PLAINTEXT}..={MAX_PLAINTEXT}"
        )));
    }
    let mut padded = vec![0u8; 2 + padded_len(len)];
    padded[..2].copy_from_slice(&(len as u16).to_be_bytes());
    padded[2..2 + len].copy_from_slice(plaintext);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<String> {
    if padded.len() < 2 {
        return Err(GatewayError::Crypto("padded plaintext too short".into()));
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT || padded.len() != 2 + padded_len(len) {
        return Err(GatewayError::Crypto("invalid padding".into()));
    }
    String::from_utf8(padded[2..2 + len].to_vec())
        .map_err(|_| GatewayError::Crypto("decrypted plaintext is not utf-8".into()))
}

pub fn encrypt(key: &ConversationKey, plaintext: &str) -> Result<String> {
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    encrypt_with_nonce(key, plaintext, &nonce)
}

pub(crate) fn encrypt_with_nonce(key: &ConversationKey, plaintext: &str, nonce: &[u8; 32]) -> Result<String> {
    let keys = key.message_keys(nonce)?;
    let mut buffer = pad(plaintext.as_bytes())?;
    keys.apply_keystream(&mut buffer)?;
    let tag = keys.mac(nonce, &buffer)?.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + nonce.len() + buffer.len() + tag.len());
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&buffer);
    payload.extend_from_slice(&tag);
    Ok(STANDARD.encode(payload))
}

pub fn decrypt(key: &ConversationKey, payload: &str) -> Result<String> {
    if payload.is_empty() || payload.starts_with('#') {
        return Err(GatewayError::Crypto("unsupported encryption version".into()));
    }
    let data = STANDARD
        .decode(payload)
        .map_err(|e| GatewayError::Crypto(format!("invalid base64 payload: {e}")))?;
    if !(MIN_PAYLOAD..=MAX_PAYLOAD).contains(&data.len()) {
        return Err(GatewayError::Crypto(format!(
            "payload length {} out of range",
            data.len()
        )));
    }
    if data[0] != VERSION {
        return Err(GatewayError::Crypto(format!(
            "unsupported encryption version {}",
            data[0]
        )));
    }

    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&data[1..33]);
    let tag_start = data.len() - 32;
    let ciphertext = &data[33..tag_start];

    let keys = key.message_keys(&nonce)?;
    keys.mac(&nonce, ciphertext)?
        .verify_slice(&data[tag_start..])
        .map_err(|_| GatewayError::Crypto("payload authentication failed".into()))?;

    let mut buffer = ciphertext.to_vec();
    keys.apply_keystream(&mut buffer)?;
    unpad(&buffer)
}
