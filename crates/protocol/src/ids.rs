//! Opaque identifier generation: sitekey/secretkey pairs and the 16-byte
//! random ids underlying the three token families.

use data_encoding::BASE32_NOPAD;
use rand::RngCore;

pub const SITEKEY_PREFIX: &str = "pk_";
pub const SECRETKEY_PREFIX: &str = "sk_";

fn random_hex(num_bytes: usize) -> String {
    let mut bytes = vec![0u8; num_bytes];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A fresh 256-bit, hex-encoded sitekey (`pk_<64hex>`).
pub fn new_sitekey() -> String {
    format!("{SITEKEY_PREFIX}{}", random_hex(32))
}

/// A fresh 256-bit, hex-encoded secret key (`sk_<64hex>`).
pub fn new_secretkey() -> String {
    format!("{SECRETKEY_PREFIX}{}", random_hex(32))
}

/// A fresh 16-byte random id, base32-encoded for opaque token strings.
pub fn new_token_id() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

pub fn encode_base32(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes)
}

pub fn decode_base32(value: &str) -> Option<Vec<u8>> {
    BASE32_NOPAD.decode(value.as_bytes()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sitekey_and_secretkey_have_expected_shape() {
        let pk = new_sitekey();
        let sk = new_secretkey();
        assert!(pk.starts_with(SITEKEY_PREFIX));
        assert!(sk.starts_with(SECRETKEY_PREFIX));
        assert_eq!(pk.len(), SITEKEY_PREFIX.len() + 64);
        assert_eq!(sk.len(), SECRETKEY_PREFIX.len() + 64);
    }

    #[test]
    fn base32_round_trips() {
        let id = new_token_id();
        let encoded = encode_base32(&id);
        let decoded = decode_base32(&encoded).unwrap();
        assert_eq!(decoded, id);
    }
}
