//! The outer `{data: base64(json)}` wrapper used by the enveloped HTTP
//! endpoints. This is obfuscation, not security — the AEAD layer in
//! [`crate::crypto`] is the real protection.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "encrypted-v1";

/// Fallback for browsers without Web Crypto (§4.11): `data` carries the
/// JSON body directly instead of base64(AEAD-free JSON). Still accepted,
/// but callers must score the request with a higher baseline risk.
pub const PLAINTEXT_PROTOCOL_VERSION: &str = "plaintext-v1";

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope encoding")]
    Encoding,
    #[error("malformed envelope payload")]
    Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub data: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    PROTOCOL_VERSION.to_string()
}

pub fn wrap<T: Serialize>(value: &T) -> Result<Envelope, EnvelopeError> {
    let json = serde_json::to_vec(value).map_err(|_| EnvelopeError::Payload)?;
    Ok(Envelope { data: STANDARD.encode(json), protocol: PROTOCOL_VERSION.to_string() })
}

pub fn unwrap<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, EnvelopeError> {
    let json = if envelope.protocol == PLAINTEXT_PROTOCOL_VERSION {
        envelope.data.clone().into_bytes()
    } else {
        STANDARD.decode(&envelope.data).map_err(|_| EnvelopeError::Encoding)?
    };
    serde_json::from_slice(&json).map_err(|_| EnvelopeError::Payload)
}

/// True when `envelope` used the plaintext fallback rather than the
/// base64-wrapped encrypted protocol.
pub fn is_plaintext(envelope: &Envelope) -> bool {
    envelope.protocol == PLAINTEXT_PROTOCOL_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Inner {
        n: u32,
    }

    #[test]
    fn wrap_then_unwrap_round_trips() {
        let inner = Inner { n: 7 };
        let envelope = wrap(&inner).unwrap();
        assert_eq!(envelope.protocol, PROTOCOL_VERSION);
        let back: Inner = unwrap(&envelope).unwrap();
        assert_eq!(inner, back);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let envelope = Envelope { data: "not base64!!".to_string(), protocol: PROTOCOL_VERSION.to_string() };
        let result: Result<Inner, _> = unwrap(&envelope);
        assert!(result.is_err());
    }

    #[test]
    fn plaintext_fallback_carries_raw_json() {
        let envelope = Envelope {
            data: serde_json::to_string(&Inner { n: 3 }).unwrap(),
            protocol: PLAINTEXT_PROTOCOL_VERSION.to_string(),
        };
        assert!(is_plaintext(&envelope));
        let back: Inner = unwrap(&envelope).unwrap();
        assert_eq!(back, Inner { n: 3 });
    }

    #[test]
    fn encrypted_envelope_is_not_plaintext() {
        let envelope = wrap(&Inner { n: 1 }).unwrap();
        assert!(!is_plaintext(&envelope));
    }
}
