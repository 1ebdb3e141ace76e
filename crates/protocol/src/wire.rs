//! Request/response bodies exchanged between the widget and the gateway,
//! after the enveloped/encrypted layers have been peeled off.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::crypto::Sealed;
use crate::pow::PowParams;
use crate::puzzle::{Puzzle, SolutionAnswer};

/// Base64 wire form of a [`Sealed`] AEAD payload — the real encryption
/// layer (§4.1), carried as a field inside an enveloped JSON body rather
/// than as the envelope's only content (the envelope itself is obfuscation,
/// see [`crate::envelope`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedWire {
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SealedWireError {
    #[error("invalid base64 in sealed payload")]
    Encoding,
    #[error("invalid field length")]
    Length,
}

impl From<&Sealed> for SealedWire {
    fn from(sealed: &Sealed) -> Self {
        Self {
            iv: STANDARD.encode(sealed.iv),
            ciphertext: STANDARD.encode(&sealed.ciphertext),
            tag: STANDARD.encode(sealed.tag),
        }
    }
}

impl TryFrom<&SealedWire> for Sealed {
    type Error = SealedWireError;

    fn try_from(wire: &SealedWire) -> Result<Self, Self::Error> {
        let iv = STANDARD.decode(&wire.iv).map_err(|_| SealedWireError::Encoding)?;
        let ciphertext = STANDARD.decode(&wire.ciphertext).map_err(|_| SealedWireError::Encoding)?;
        let tag = STANDARD.decode(&wire.tag).map_err(|_| SealedWireError::Encoding)?;
        let iv: [u8; 12] = iv.try_into().map_err(|_| SealedWireError::Length)?;
        let tag: [u8; 16] = tag.try_into().map_err(|_| SealedWireError::Length)?;
        Ok(Sealed { iv, ciphertext, tag })
    }
}

/// Body of the decrypted `/challenge` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponseBody {
    #[serde(flatten)]
    pub puzzle: Puzzle,
    #[serde(rename = "powParams")]
    pub pow_params: PowParams,
}

/// Body of the decrypted solution payload posted to `/verify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionBody {
    pub answer: SolutionAnswer,
    #[serde(rename = "powSolution")]
    pub pow_solution: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow;

    #[test]
    fn challenge_response_body_serializes_with_flattened_type_tag() {
        let body = ChallengeResponseBody {
            puzzle: Puzzle::Grid {
                size: 3,
                grid_emojis: vec!["🍎".to_string(); 9],
                target_emojis: vec!["🍎".to_string()],
            },
            pow_params: pow::generate(1),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "grid");
        assert!(json["puzzleData"]["gridEmojis"].is_array());
        assert!(json["puzzleData"]["targetEmojis"].is_array());
        assert!(json["powParams"].is_object());
    }

    #[test]
    fn sealed_wire_round_trips_through_base64() {
        use crate::crypto;

        let key = [4u8; 32];
        let sealed = crypto::aead_seal(&key, b"payload", b"aad").unwrap();
        let wire = SealedWire::from(&sealed);
        let back: Sealed = (&wire).try_into().unwrap();
        assert_eq!(back.iv, sealed.iv);
        assert_eq!(back.ciphertext, sealed.ciphertext);
        assert_eq!(back.tag, sealed.tag);
    }
}
