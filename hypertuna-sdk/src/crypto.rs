//! ECDH handshake secrets, the AES-CBC payload envelope, and token
//! derivation.
//!
//! # Envelope wire format
//!
//! Encrypted payloads (invite envelopes, challenge responses) are framed
//! as a single string:
//!
//! ```text
//! <base64(ciphertext)>?iv=<base64(iv)>
//! ```
//!
//! Encryption is AES-256-CBC with a random 16-byte IV; the key is the
//! 32-byte ECDH shared secret between the two parties; plaintext is UTF-8.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use k256::ecdh::diffie_hellman;
use k256::{PublicKey, SecretKey};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::keys::Keys;
use crate::Result;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Derive the 32-byte ECDH shared secret between our secret key and a
/// peer's x-only public key.
///
/// The peer key is lifted to a full point with the even-parity `0x02`
/// prefix; the shared secret is the x coordinate of the DH point.
pub fn shared_secret(keys: &Keys, peer_pubkey_hex: &str) -> Result<[u8; 32]> {
    let peer_x =
        hex::decode(peer_pubkey_hex).map_err(|e| Error::Key(format!("bad peer pubkey: {e}")))?;
    if peer_x.len() != 32 {
        return Err(Error::Key(format!(
            "peer pubkey is {} bytes, want 32",
            peer_x.len()
        )));
    }
    let mut sec1 = [0u8; 33];
    sec1[0] = 0x02;
    sec1[1..].copy_from_slice(&peer_x);
    let peer = PublicKey::from_sec1_bytes(&sec1)
        .map_err(|e| Error::Key(format!("peer pubkey not on curve: {e}")))?;

    let secret = SecretKey::from_bytes(&keys.secret_bytes().into())
        .map_err(|e| Error::Key(format!("bad secret scalar: {e}")))?;
    let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());

    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    Ok(out)
}

/// Encrypt a UTF-8 payload into the `<ct>?iv=<iv>` envelope.
pub fn encrypt_payload(key: &[u8; 32], plaintext: &str) -> String {
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);
    let cipher = Aes256CbcEnc::new_from_slices(key, &iv).expect("fixed-size key and iv");
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    format!("{}?iv={}", B64.encode(ciphertext), B64.encode(iv))
}

/// Decrypt a `<ct>?iv=<iv>` envelope back to UTF-8.
pub fn decrypt_payload(key: &[u8; 32], envelope: &str) -> Result<String> {
    let (ct_b64, iv_b64) = envelope
        .split_once("?iv=")
        .ok_or_else(|| Error::Envelope("missing ?iv= separator".into()))?;
    let ciphertext = B64
        .decode(ct_b64)
        .map_err(|e| Error::Envelope(format!("bad ciphertext base64: {e}")))?;
    let iv = B64
        .decode(iv_b64)
        .map_err(|e| Error::Envelope(format!("bad iv base64: {e}")))?;
    if iv.len() != 16 {
        return Err(Error::Envelope(format!("iv is {} bytes, want 16", iv.len())));
    }
    let cipher = Aes256CbcDec::new_from_slices(key, &iv).expect("fixed-size key and iv");
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Error::Envelope("decryption failed".into()))?;
    String::from_utf8(plaintext).map_err(|_| Error::Envelope("plaintext is not UTF-8".into()))
}

/// Generate a fresh 32-byte challenge, hex-encoded.
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Derive an opaque bearer token for a freshly authenticated client:
/// `SHA256(server_sk || client_pubkey_hex || now)`, hex-encoded.
pub fn derive_token(server_keys: &Keys, client_pubkey_hex: &str, now: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(server_keys.secret_bytes());
    hasher.update(client_pubkey_hex.as_bytes());
    hasher.update(now.to_be_bytes());
    hex::encode(hasher.finalize())
}
