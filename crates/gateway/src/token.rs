//! Token service (C5): three opaque, HMAC-signed token families sharing one
//! generic implementation. A token string is `base32(id) "." base32(tag)`;
//! `tag = HMAC-SHA256(serverSecret, kindLabel || id)`. The kind label folded
//! into the tag means a verification token can never verify as a challenge
//! token and vice versa, closing the "legacy code mixes token kinds" gap
//! called out in §9 — without a store lookup.
//!
//! The store itself holds the record behind an `Arc` with an inner
//! `AtomicBool`, since `moka` gives lock-free get/insert but no
//! compare-and-swap on the value itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use moka::future::Cache;
use sha2::Sha256;

use captcha_protocol::ids;

use crate::error::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// Extracts the id portion of a token string (before the signature), with
/// no verification — callers that need the id for HKDF/AAD purposes after
/// already calling `verify`/`consume` use this instead of re-parsing.
pub fn token_id(token: &str) -> Option<&str> {
    token.split_once('.').map(|(id, _)| id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Challenge,
    Verification,
    Config,
}

impl TokenKind {
    fn label(self) -> &'static [u8] {
        match self {
            TokenKind::Challenge => b"challenge",
            TokenKind::Verification => b"verification",
            TokenKind::Config => b"config",
        }
    }
}

pub struct TokenRecord<P> {
    pub payload: P,
    consumed: AtomicBool,
}

impl<P> TokenRecord<P> {
    fn new(payload: P) -> Self {
        Self { payload, consumed: AtomicBool::new(false) }
    }

    /// Sets `consumed = true` iff it was `false`. Succeeds at most once
    /// across any interleaving of concurrent callers (§8).
    pub fn try_consume(&self) -> bool {
        self.consumed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }
}

#[derive(Clone)]
pub struct TokenService<P: Clone + Send + Sync + 'static> {
    secret: Arc<Vec<u8>>,
    kind: TokenKind,
    store: Cache<String, Arc<TokenRecord<P>>>,
}

impl<P: Clone + Send + Sync + 'static> TokenService<P> {
    pub fn new(secret: Arc<Vec<u8>>, kind: TokenKind, ttl: Duration) -> Self {
        let store = Cache::builder().time_to_live(ttl).build();
        Self { secret, kind, store }
    }

    fn sign(&self, id_b32: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(self.kind.label());
        mac.update(id_b32.as_bytes());
        ids::encode_base32(&mac.finalize().into_bytes())
    }

    /// Issues a fresh token, storing `payload` under its id. Returns the
    /// opaque id (used as AAD / HKDF `challenge_id` by callers) and the
    /// full signed token string handed to the client.
    pub async fn issue(&self, payload: P) -> (String, String) {
        let raw_id = ids::new_token_id();
        let id_b32 = ids::encode_base32(&raw_id);
        let tag_b32 = self.sign(&id_b32);
        self.store.insert(id_b32.clone(), Arc::new(TokenRecord::new(payload))).await;
        (id_b32.clone(), format!("{id_b32}.{tag_b32}"))
    }

    fn split_and_verify_signature(&self, token: &str) -> Option<String> {
        let (id_b32, tag_b32) = token.split_once('.')?;
        let expected = self.sign(id_b32);
        if captcha_protocol::crypto::ct_eq(expected.as_bytes(), tag_b32.as_bytes()) {
            Some(id_b32.to_string())
        } else {
            None
        }
    }

    /// Verifies signature and kind, returning the record without consuming
    /// it. Rejects forged tokens and tokens signed for a different kind.
    pub async fn verify(&self, token: &str) -> Result<Arc<TokenRecord<P>>, GatewayError> {
        let id_b32 =
            self.split_and_verify_signature(token).ok_or(GatewayError::InvalidOrUsedToken)?;
        self.store.get(&id_b32).await.ok_or(GatewayError::InvalidOrUsedToken)
    }

    /// Atomically consumes a token: verifies it, then flips `consumed`.
    /// Fails if the token is malformed, unknown, or already used.
    pub async fn consume(&self, token: &str) -> Result<Arc<TokenRecord<P>>, GatewayError> {
        let record = self.verify(token).await?;
        if record.try_consume() {
            Ok(record)
        } else {
            Err(GatewayError::InvalidOrUsedToken)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(kind: TokenKind) -> TokenService<&'static str> {
        TokenService::new(Arc::new(b"test-server-secret-please-32-bytes!".to_vec()), kind, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn issued_token_verifies_and_consumes_exactly_once() {
        let svc = service(TokenKind::Verification);
        let (_, token) = svc.issue("payload").await;

        assert!(svc.verify(&token).await.is_ok());
        assert!(svc.consume(&token).await.is_ok());
        assert!(matches!(svc.consume(&token).await, Err(GatewayError::InvalidOrUsedToken)));
    }

    #[tokio::test]
    async fn token_signed_for_one_kind_is_rejected_by_another() {
        let challenge_secret = Arc::new(b"shared-secret-across-both-services-32b".to_vec());
        let challenge_svc = TokenService::<&'static str>::new(
            challenge_secret.clone(),
            TokenKind::Challenge,
            Duration::from_secs(60),
        );
        let verification_svc = TokenService::<&'static str>::new(
            challenge_secret,
            TokenKind::Verification,
            Duration::from_secs(60),
        );

        let (_, token) = challenge_svc.issue("payload").await;
        assert!(matches!(
            verification_svc.verify(&token).await,
            Err(GatewayError::InvalidOrUsedToken)
        ));
    }

    #[tokio::test]
    async fn concurrent_consumes_only_one_wins() {
        let svc = Arc::new(service(TokenKind::Verification));
        let (_, token) = svc.issue("payload").await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = svc.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move { svc.consume(&token).await.is_ok() }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn tampered_token_string_is_rejected() {
        let svc = service(TokenKind::Config);
        let (_, token) = svc.issue("payload").await;
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(matches!(svc.verify(&tampered).await, Err(GatewayError::InvalidOrUsedToken)));
    }
}
