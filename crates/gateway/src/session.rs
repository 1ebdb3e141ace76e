//! Session store (C3): the ECDH-negotiated shared-key context between a
//! widget instance and the gateway. Keyed by `(sitekey, base64(clientPublicKey))`,
//! lock-free reads/writes via `moka`, hard-capped at one session per key —
//! a second handshake simply overwrites the first (§4.3).

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use moka::future::Cache;
use rand::RngCore;

use captcha_protocol::crypto::{self, RawPublicKey};

use crate::error::GatewayError;

const SESSION_TTL: Duration = Duration::from_secs(10 * 60);

pub struct Session {
    pub sitekey: String,
    pub master_key: [u8; 32],
    pub server_public_key: RawPublicKey,
    pub client_public_key: RawPublicKey,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

fn session_key(sitekey: &str, client_pub_raw: &[u8]) -> String {
    format!("{sitekey}:{}", STANDARD.encode(client_pub_raw))
}

pub struct SessionStore {
    sessions: Cache<String, Arc<Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self { sessions: Cache::builder().time_to_live(SESSION_TTL).build() }
    }

    /// Negotiates a new session key, replacing any prior session for this
    /// `(sitekey, clientPublicKey)` pair. The old session's in-flight
    /// challenges become unverifiable once this returns — their AAD still
    /// decodes, but the session lookup will miss (§5, intended).
    pub async fn handshake(
        &self,
        sitekey: &str,
        client_pub_raw: &[u8],
    ) -> Result<(RawPublicKey, [u8; 16], u64), GatewayError> {
        let (server_secret, server_pub) = crypto::generate_server_keypair();
        let mut server_nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut server_nonce);

        let master = crypto::derive_master(&server_secret, client_pub_raw, &server_pub, &server_nonce)
            .map_err(|_| GatewayError::HandshakeFailed)?;

        let mut client_pub = [0u8; 65];
        if client_pub_raw.len() != 65 {
            return Err(GatewayError::HandshakeFailed);
        }
        client_pub.copy_from_slice(client_pub_raw);

        let now = Utc::now();
        let session = Session {
            sitekey: sitekey.to_string(),
            master_key: master,
            server_public_key: server_pub,
            client_public_key: client_pub,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(SESSION_TTL.as_secs() as i64),
        };

        self.sessions.insert(session_key(sitekey, client_pub_raw), Arc::new(session)).await;
        Ok((server_pub, server_nonce, SESSION_TTL.as_secs()))
    }

    /// Read-only lookup; does not extend the session's lifetime (§4.3:
    /// `touch` is explicitly non-extending).
    pub async fn lookup(&self, sitekey: &str, client_pub_raw: &[u8]) -> Option<Arc<Session>> {
        let session = self.sessions.get(&session_key(sitekey, client_pub_raw)).await?;
        if Utc::now() > session.expires_at {
            self.sessions.invalidate(&session_key(sitekey, client_pub_raw)).await;
            return None;
        }
        Some(session)
    }

    /// Runs the cache's internal janitor; called on an interval by the
    /// owning task (§5's 60s sweep cadence) for deterministic test behavior.
    pub async fn sweep(&self) {
        self.sessions.run_pending_tasks().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::SecretKey;

    fn client_pub_raw() -> RawPublicKey {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        crypto::encode_public_key(&secret.public_key())
    }

    #[tokio::test]
    async fn handshake_then_lookup_finds_the_same_session() {
        let store = SessionStore::new();
        let client_pub = client_pub_raw();
        let (server_pub, _, _) = store.handshake("pk_test", &client_pub).await.unwrap();

        let session = store.lookup("pk_test", &client_pub).await.unwrap();
        assert_eq!(session.server_public_key, server_pub);
    }

    #[tokio::test]
    async fn second_handshake_replaces_the_first() {
        let store = SessionStore::new();
        let client_pub = client_pub_raw();
        let (first_pub, _, _) = store.handshake("pk_test", &client_pub).await.unwrap();
        let (second_pub, _, _) = store.handshake("pk_test", &client_pub).await.unwrap();

        assert_ne!(first_pub, second_pub);
        let session = store.lookup("pk_test", &client_pub).await.unwrap();
        assert_eq!(session.server_public_key, second_pub);
    }

    #[tokio::test]
    async fn lookup_misses_for_unknown_client_key() {
        let store = SessionStore::new();
        assert!(store.lookup("pk_test", &client_pub_raw()).await.is_none());
    }
}
