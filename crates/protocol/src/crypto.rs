//! ECDH key agreement, HKDF key derivation, and AES-256-GCM sealing.
//!
//! Every primitive here collapses its failure modes into one opaque
//! [`CryptoError`]. Callers must never branch on which step failed — an
//! adversary probing for a richer error signal should see the exact same
//! response whether the tag, the AAD, or the key was wrong.

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const SESSION_INFO: &[u8] = b"captcha-session-v1";
pub const CHALLENGE_INFO_PREFIX: &str = "captcha-challenge-v1";

#[derive(Debug, thiserror::Error)]
#[error("crypto operation failed")]
pub struct CryptoError;

type Result<T> = std::result::Result<T, CryptoError>;

/// Raw, uncompressed SEC1 P-256 public key (65 bytes: `0x04 || x || y`).
pub type RawPublicKey = [u8; 65];

/// A sealed AEAD payload, matching the wire shape `{iv, ciphertext, tag}`.
pub struct Sealed {
    pub iv: [u8; 12],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; 16],
}

/// Generates a fresh server ECDH keypair for one handshake.
pub fn generate_server_keypair() -> (SecretKey, RawPublicKey) {
    let secret = SecretKey::random(&mut rand::rngs::OsRng);
    let public = secret.public_key();
    (secret, encode_public_key(&public))
}

/// Serializes a [`PublicKey`] to its raw uncompressed 65-byte SEC1 form.
pub fn encode_public_key(key: &PublicKey) -> RawPublicKey {
    let point = key.to_encoded_point(false);
    let mut raw = [0u8; 65];
    raw.copy_from_slice(point.as_bytes());
    raw
}

fn decode_public_key(raw: &[u8]) -> Result<PublicKey> {
    PublicKey::from_sec1_bytes(raw).map_err(|_| CryptoError)
}

/// ECDH(server_priv, client_pub) -> HKDF-SHA256 -> 32-byte session master key.
///
/// `salt = serverPubRaw || utf8(hex(serverNonce))`, `info = "captcha-session-v1"`.
/// Server and client MUST agree on this exact ordering; any divergence fails
/// closed via [`CryptoError`], never a partial/degraded key.
pub fn derive_master(
    server_secret: &SecretKey,
    client_pub_raw: &[u8],
    server_pub_raw: &RawPublicKey,
    server_nonce: &[u8],
) -> Result<[u8; 32]> {
    let client_pub = decode_public_key(client_pub_raw)?;
    let shared = diffie_hellman(
        server_secret.to_nonzero_scalar(),
        client_pub.as_affine(),
    );

    let mut salt = Vec::with_capacity(65 + server_nonce.len() * 2);
    salt.extend_from_slice(server_pub_raw);
    salt.extend_from_slice(hex::encode(server_nonce).as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.raw_secret_bytes().as_slice());
    let mut key = [0u8; 32];
    hk.expand(SESSION_INFO, &mut key).map_err(|_| CryptoError)?;
    Ok(key)
}

/// Derives a per-challenge child key from the session master key.
///
/// `info = "captcha-challenge-v1:" + direction + ":" + hex(SHA256(challenge_id))`.
/// `direction` provides domain separation among the challenge body, the
/// solution body, verification metadata, and config responses — the labels
/// (`"encrypt"`, `"decrypt"`, `"metadata"`, `"config"`) are part of the
/// wire contract and must not be renamed for symmetry.
pub fn derive_child(master: &[u8; 32], challenge_id: &str, direction: &str) -> Result<[u8; 32]> {
    use sha2::Digest;
    let id_hash = hex::encode(Sha256::digest(challenge_id.as_bytes()));
    let info = format!("{CHALLENGE_INFO_PREFIX}:{direction}:{id_hash}");

    let hk = Hkdf::<Sha256>::new(None, master);
    let mut key = [0u8; 32];
    hk.expand(info.as_bytes(), &mut key).map_err(|_| CryptoError)?;
    Ok(key)
}

/// Encrypts `plaintext` under `key`, binding it to `aad` (always the owning
/// token id on the wire). Uses a fresh CSPRNG nonce per call.
pub fn aead_seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError)?;
    let mut iv = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let mut out = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError)?;
    let tag_start = out.len().checked_sub(16).ok_or(CryptoError)?;
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&out[tag_start..]);
    out.truncate(tag_start);

    Ok(Sealed { iv, ciphertext: out, tag })
}

/// Decrypts and authenticates a sealed payload. Any bit-flip in the
/// ciphertext, IV, tag, AAD, or key fails with [`CryptoError`].
pub fn aead_open(
    key: &[u8; 32],
    iv: &[u8; 12],
    ciphertext: &[u8],
    tag: &[u8; 16],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError)?;
    let nonce = Nonce::from_slice(iv);

    let mut combined = Vec::with_capacity(ciphertext.len() + 16);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(nonce, Payload { msg: &combined, aad })
        .map_err(|_| CryptoError)
}

/// Constant-time byte comparison, for PoW digests and HMAC tags.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_handshake_round_trips_and_agrees() {
        let (server_secret, server_pub) = generate_server_keypair();
        let client_secret = SecretKey::random(&mut rand::rngs::OsRng);
        let client_pub = encode_public_key(&client_secret.public_key());
        let server_nonce = b"0123456789abcdef";

        let server_master =
            derive_master(&server_secret, &client_pub, &server_pub, server_nonce).unwrap();

        // The client computes the same ECDH shared point from its own secret
        // and the server's public key, then runs the identical HKDF.
        let shared = diffie_hellman(
            client_secret.to_nonzero_scalar(),
            server_secret.public_key().as_affine(),
        );
        let mut salt = Vec::new();
        salt.extend_from_slice(&server_pub);
        salt.extend_from_slice(hex::encode(server_nonce).as_bytes());
        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.raw_secret_bytes().as_slice());
        let mut client_master = [0u8; 32];
        hk.expand(SESSION_INFO, &mut client_master).unwrap();

        assert_eq!(server_master, client_master);
    }

    #[test]
    fn mismatched_nonce_fails_closed_to_a_different_key() {
        let (server_secret, server_pub) = generate_server_keypair();
        let client_pub = encode_public_key(&SecretKey::random(&mut rand::rngs::OsRng).public_key());

        let a = derive_master(&server_secret, &client_pub, &server_pub, b"nonce-one").unwrap();
        let b = derive_master(&server_secret, &client_pub, &server_pub, b"nonce-two").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn direction_labels_produce_distinct_child_keys() {
        let master = [7u8; 32];
        let encrypt = derive_child(&master, "chal-1", "encrypt").unwrap();
        let decrypt = derive_child(&master, "chal-1", "decrypt").unwrap();
        let metadata = derive_child(&master, "chal-1", "metadata").unwrap();
        let config = derive_child(&master, "chal-1", "config").unwrap();

        assert_ne!(encrypt, decrypt);
        assert_ne!(decrypt, metadata);
        assert_ne!(metadata, config);
    }

    #[test]
    fn seal_then_open_round_trips() {
        let key = [3u8; 32];
        let sealed = aead_seal(&key, b"hello captcha", b"aad-token-id").unwrap();
        let opened = aead_open(&key, &sealed.iv, &sealed.ciphertext, &sealed.tag, b"aad-token-id")
            .unwrap();
        assert_eq!(opened, b"hello captcha");
    }

    #[test]
    fn wrong_aad_fails_to_open() {
        let key = [3u8; 32];
        let sealed = aead_seal(&key, b"hello captcha", b"aad-token-id").unwrap();
        let result = aead_open(&key, &sealed.iv, &sealed.ciphertext, &sealed.tag, b"other-aad");
        assert!(result.is_err());
    }

    #[test]
    fn bit_flip_in_ciphertext_fails_to_open() {
        let key = [3u8; 32];
        let sealed = aead_seal(&key, b"hello captcha", b"aad").unwrap();
        let mut ciphertext = sealed.ciphertext.clone();
        ciphertext[0] ^= 0x01;
        let result = aead_open(&key, &sealed.iv, &ciphertext, &sealed.tag, b"aad");
        assert!(result.is_err());
    }

    #[test]
    fn bit_flip_in_tag_fails_to_open() {
        let key = [3u8; 32];
        let sealed = aead_seal(&key, b"hello captcha", b"aad").unwrap();
        let mut tag = sealed.tag;
        tag[0] ^= 0x01;
        let result = aead_open(&key, &sealed.iv, &sealed.ciphertext, &tag, b"aad");
        assert!(result.is_err());
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let key = [3u8; 32];
        let other_key = [9u8; 32];
        let sealed = aead_seal(&key, b"hello captcha", b"aad").unwrap();
        let result = aead_open(&other_key, &sealed.iv, &sealed.ciphertext, &sealed.tag, b"aad");
        assert!(result.is_err());
    }
}
