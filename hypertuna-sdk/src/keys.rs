//! secp256k1 key pairs with npub/nsec encoding.
//!
//! Public keys travel as 32-byte x-only hex (BIP-340 convention); the
//! bech32 forms `npub1…`/`nsec1…` are used in relay URLs and config files.

use bech32::{Bech32, Hrp};
use k256::schnorr::signature::{Signer, Verifier};
use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::Error;
use crate::Result;

/// A secp256k1 key pair usable for event signing and ECDH.
#[derive(Clone)]
pub struct Keys {
    signing: SigningKey,
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret material.
        f.debug_struct("Keys")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

impl Keys {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    /// Restore from a 32-byte secret scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let signing =
            SigningKey::from_bytes(bytes).map_err(|e| Error::Key(format!("bad secret: {e}")))?;
        Ok(Self { signing })
    }

    /// Restore from a 64-char hex secret.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str).map_err(|e| Error::Key(format!("bad hex: {e}")))?;
        Self::from_secret_bytes(&bytes)
    }

    /// Restore from a bech32 `nsec1…` string.
    pub fn from_nsec(nsec: &str) -> Result<Self> {
        let (hrp, data) = bech32::decode(nsec).map_err(|e| Error::Key(format!("bad nsec: {e}")))?;
        if hrp.as_str() != "nsec" {
            return Err(Error::Key(format!("expected nsec, got {}", hrp.as_str())));
        }
        Self::from_secret_bytes(&data)
    }

    /// The x-only public key as lowercase hex (64 chars).
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    /// The public key as bech32 `npub1…`.
    pub fn npub(&self) -> String {
        let hrp = Hrp::parse("npub").expect("static hrp");
        bech32::encode::<Bech32>(hrp, &self.signing.verifying_key().to_bytes())
            .expect("32 bytes always encode")
    }

    /// The secret scalar bytes (for persistence and ECDH).
    pub fn secret_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.signing.to_bytes());
        out
    }

    /// Sign a message (BIP-340 Schnorr). For events the message is the
    /// 32-byte event id.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let sig: Signature = self.signing.sign(message);
        sig.to_bytes()
    }
}

/// Decode a bech32 `npub1…` to 64-char x-only hex.
pub fn npub_to_hex(npub: &str) -> Result<String> {
    let (hrp, data) = bech32::decode(npub).map_err(|e| Error::Key(format!("bad npub: {e}")))?;
    if hrp.as_str() != "npub" {
        return Err(Error::Key(format!("expected npub, got {}", hrp.as_str())));
    }
    if data.len() != 32 {
        return Err(Error::Key(format!("npub payload is {} bytes", data.len())));
    }
    Ok(hex::encode(data))
}

/// Encode a 64-char x-only hex public key as `npub1…`.
pub fn hex_to_npub(pubkey_hex: &str) -> Result<String> {
    let bytes = hex::decode(pubkey_hex).map_err(|e| Error::Key(format!("bad hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(Error::Key(format!("pubkey is {} bytes", bytes.len())));
    }
    let hrp = Hrp::parse("npub").expect("static hrp");
    bech32::encode::<Bech32>(hrp, &bytes).map_err(|e| Error::Key(format!("bech32: {e}")))
}

/// Verify a BIP-340 signature against an x-only hex public key.
pub fn verify_signature(pubkey_hex: &str, message: &[u8], sig: &[u8]) -> Result<()> {
    let pk_bytes = hex::decode(pubkey_hex).map_err(|_| Error::EventSignatureInvalid)?;
    let vk = VerifyingKey::from_bytes(&pk_bytes).map_err(|_| Error::EventSignatureInvalid)?;
    let sig = Signature::try_from(sig).map_err(|_| Error::EventSignatureInvalid)?;
    vk.verify(message, &sig)
        .map_err(|_| Error::EventSignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let keys = Keys::generate();
        let msg = [7u8; 32];
        let sig = keys.sign(&msg);
        verify_signature(&keys.public_key_hex(), &msg, &sig).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let keys = Keys::generate();
        let other = Keys::generate();
        let msg = [7u8; 32];
        let sig = keys.sign(&msg);
        assert!(verify_signature(&other.public_key_hex(), &msg, &sig).is_err());
    }

    #[test]
    fn secret_roundtrip() {
        let keys = Keys::generate();
        let restored = Keys::from_secret_bytes(&keys.secret_bytes()).unwrap();
        assert_eq!(keys.public_key_hex(), restored.public_key_hex());
    }

    #[test]
    fn npub_roundtrip() {
        let keys = Keys::generate();
        let npub = keys.npub();
        assert!(npub.starts_with("npub1"));
        assert_eq!(npub_to_hex(&npub).unwrap(), keys.public_key_hex());
        assert_eq!(hex_to_npub(&keys.public_key_hex()).unwrap(), npub);
    }

    #[test]
    fn nsec_rejects_wrong_hrp() {
        let keys = Keys::generate();
        assert!(Keys::from_nsec(&keys.npub()).is_err());
    }
}
