//! Shared-secret derivation and symmetric payload encryption for direct
//! messages (NIP-04 scheme).

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use rand::{thread_rng, RngCore};
use secp256k1::{ecdh, PublicKey};

use crate::error::{Error, Result};
use crate::event::Keys;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Separator between ciphertext and initialization vector on the wire.
const IV_SEPARATOR: &str = "?iv=";

/// Derive the conversation secret from my private key and the peer's x-only
/// public key: the x coordinate of the ECDH point, unhashed.
///
/// Symmetric by construction: `secret(privA, pubB) == secret(privB, pubA)`.
/// The secret is never persisted; callers recompute it on demand.
pub fn shared_secret(keys: &Keys, peer_pubkey: &str) -> Result<[u8; 32]> {
    let x = hex::decode(peer_pubkey).map_err(|e| Error::Crypto(e.to_string()))?;
    if x.len() != 32 {
        return Err(Error::InvalidKey);
    }
    // X-only keys lift to the even-parity point.
    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(&x);
    let pk = PublicKey::from_slice(&compressed)?;
    let point = ecdh::shared_secret_point(&pk, &keys.secret_key());
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&point[..32]);
    Ok(secret)
}

/// Encrypt a plaintext into wire form `base64(ciphertext) + "?iv=" + base64(iv)`
/// with AES-256-CBC under a fresh random IV.
pub fn seal(secret: &[u8; 32], plaintext: &str) -> String {
    let mut iv = [0u8; 16];
    thread_rng().fill_bytes(&mut iv);
    let ciphertext = Aes256CbcEnc::new(secret.into(), (&iv).into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    format!("{}{}{}", B64.encode(ciphertext), IV_SEPARATOR, B64.encode(iv))
}

/// Decrypt wire content produced by [`seal`].
///
/// Any failure (missing separator, bad base64, wrong key, tampered padding)
/// comes back as [`Error::Decryption`]; the ingest path treats that as
/// "not addressed to me" and drops the event without comment.
pub fn open(secret: &[u8; 32], content: &str) -> Result<String> {
    let (ciphertext_b64, iv_b64) = content.split_once(IV_SEPARATOR).ok_or(Error::Decryption)?;
    let ciphertext = B64.decode(ciphertext_b64).map_err(|_| Error::Decryption)?;
    let iv: [u8; 16] = B64
        .decode(iv_b64)
        .map_err(|_| Error::Decryption)?
        .as_slice()
        .try_into()
        .map_err(|_| Error::Decryption)?;
    let plaintext = Aes256CbcDec::new(secret.into(), (&iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Error::Decryption)?;
    String::from_utf8(plaintext).map_err(|_| Error::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Keys, Keys) {
        let a = Keys::from_hex(&"11".repeat(32)).unwrap();
        let b = Keys::from_hex(&"22".repeat(32)).unwrap();
        (a, b)
    }

    #[test]
    fn secret_is_symmetric() {
        let (a, b) = pair();
        let ab = shared_secret(&a, &b.pubkey).unwrap();
        let ba = shared_secret(&b, &a.pubkey).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn seal_open_round_trip() {
        let (a, b) = pair();
        let secret = shared_secret(&a, &b.pubkey).unwrap();
        let wire = seal(&secret, "the fox is in the henhouse");
        assert!(wire.contains("?iv="));
        let text = open(&secret, &wire).unwrap();
        assert_eq!(text, "the fox is in the henhouse");
    }

    #[test]
    fn fresh_iv_per_message() {
        let (a, b) = pair();
        let secret = shared_secret(&a, &b.pubkey).unwrap();
        assert_ne!(seal(&secret, "same"), seal(&secret, "same"));
    }

    #[test]
    fn open_with_wrong_secret_fails() {
        let (a, b) = pair();
        let c = Keys::from_hex(&"33".repeat(32)).unwrap();
        let secret = shared_secret(&a, &b.pubkey).unwrap();
        let other = shared_secret(&c, &b.pubkey).unwrap();
        let wire = seal(&secret, "secret text");
        // wrong-key decryption either trips the padding check or yields junk
        match open(&other, &wire) {
            Err(Error::Decryption) => {}
            Ok(text) => assert_ne!(text, "secret text"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn open_rejects_malformed_content() {
        let (a, b) = pair();
        let secret = shared_secret(&a, &b.pubkey).unwrap();
        assert!(open(&secret, "no separator here").is_err());
        assert!(open(&secret, "not-base64!?iv=also-not").is_err());
        assert!(open(&secret, "?iv=").is_err());
    }

    #[test]
    fn rejects_short_peer_key() {
        let (a, _) = pair();
        assert!(shared_secret(&a, "abcd").is_err());
        assert!(shared_secret(&a, "zz").is_err());
    }
}
