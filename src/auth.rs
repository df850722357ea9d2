//! Digest Authentication
//!
//! Single responsibility: Turn a server challenge and a password into proof values.
//!
//! # Authentication Flow
//!
//! 1. **Challenge** - the device rejects a call with code 401 and a
//!    `{nonce, realm, nc}` challenge, which is captured here.
//! 2. **User token** - derived once from `admin:<device id>:<password>`.
//! 3. **Proof** - for every later request:
//!    ```text
//!    ha2   = H("dummy_method:dummy_uri")
//!    proof = H(token:nonce:nc:cnonce:auth:ha2)
//!    ```
//!    The method/URI pair is fixed by the device protocol, not the RPC method called.
//!
//! The hash is supplied as a [`DigestHasher`] so callers can plug in a
//! hardware-backed or remote implementation. Digests are joined as lowercase hex.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::rpc::{AuthBlock, Challenge, Nonce};

/// Role every proof is computed for.
pub const ROLE_NAME: &str = "admin";

/// Algorithm name announced in the auth block.
pub const ALGORITHM: &str = "SHA-256";

const DIGEST_METHOD_URI: &str = "dummy_method:dummy_uri";
const QOP: &str = "auth";

/// One-way hash capability used for every digest.
#[async_trait]
pub trait DigestHasher: Send + Sync {
    async fn compute_digest(&self, data: &[u8]) -> Vec<u8>;
}

/// SHA-256, the algorithm the device announces.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

#[async_trait]
impl DigestHasher for Sha256Hasher {
    async fn compute_digest(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }
}

async fn hex_digest(hasher: &dyn DigestHasher, input: &str) -> String {
    hex::encode(hasher.compute_digest(input.as_bytes()).await)
}

/// `H(role:device_id:password)`
pub async fn derive_user_token(
    hasher: Option<&dyn DigestHasher>,
    role_name: &str,
    device_id: &str,
    password: &str,
) -> Result<String, TransportError> {
    let hasher = hasher.ok_or(TransportError::MissingHashFunction)?;
    Ok(hex_digest(hasher, &format!("{}:{}:{}", role_name, device_id, password)).await)
}

/// A computed proof together with the client nonce it was mixed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub client_nonce: u32,
    pub proof: String,
}

pub async fn build_proof(
    hasher: &dyn DigestHasher,
    user_token: &str,
    nonce: &Nonce,
    nonce_count: u64,
    client_nonce: u32,
) -> Proof {
    let inner_digest = hex_digest(hasher, DIGEST_METHOD_URI).await;
    let joined = [
        user_token.to_string(),
        nonce.to_string(),
        nonce_count.to_string(),
        client_nonce.to_string(),
        QOP.to_string(),
        inner_digest,
    ]
    .join(":");

    Proof {
        client_nonce,
        proof: hex_digest(hasher, &joined).await,
    }
}

#[derive(Default)]
struct AuthState {
    challenge: Option<Challenge>,
    user_token: Option<String>,
}

/// Holds the captured challenge, the user token and this instance's client nonce.
///
/// The client nonce is drawn once at construction and never shared with
/// other handlers.
pub struct AuthHandler {
    hasher: Option<Arc<dyn DigestHasher>>,
    client_nonce: u32,
    state: Mutex<AuthState>,
}

impl AuthHandler {
    pub fn new(hasher: Option<Arc<dyn DigestHasher>>) -> Self {
        Self::with_client_nonce(hasher, rand::random())
    }

    pub fn with_client_nonce(hasher: Option<Arc<dyn DigestHasher>>, client_nonce: u32) -> Self {
        Self {
            hasher,
            client_nonce,
            state: Mutex::new(AuthState::default()),
        }
    }

    pub fn client_nonce(&self) -> u32 {
        self.client_nonce
    }

    /// Derive and store the user token for `device_id`.
    pub async fn authenticate(&self, device_id: &str, password: &str) -> Result<(), TransportError> {
        let token =
            derive_user_token(self.hasher.as_deref(), ROLE_NAME, device_id, password).await?;
        self.lock_state().user_token = Some(token);
        info!(device_id = %device_id, "Credentials stored");
        Ok(())
    }

    /// Replace any prior challenge with `challenge`.
    pub fn capture_challenge(&self, challenge: Challenge) {
        debug!(realm = %challenge.realm, nc = challenge.nonce_count, "Captured auth challenge");
        self.lock_state().challenge = Some(challenge);
    }

    pub fn challenge(&self) -> Option<Challenge> {
        self.lock_state().challenge.clone()
    }

    pub fn has_challenge(&self) -> bool {
        self.lock_state().challenge.is_some()
    }

    /// Read the current nonce count and advance the stored one.
    ///
    /// Returns `None` while no challenge is on file.
    pub fn next_nonce_count(&self) -> Option<u64> {
        let mut state = self.lock_state();
        let challenge = state.challenge.as_mut()?;
        let current = challenge.nonce_count;
        challenge.nonce_count += 1;
        Some(current)
    }

    /// Build the auth block for a request sent with `nonce_count`.
    pub async fn regenerate_auth_block(&self, nonce_count: u64) -> Result<AuthBlock, TransportError> {
        let (challenge, user_token) = {
            let state = self.lock_state();
            let challenge = state
                .challenge
                .clone()
                .ok_or(TransportError::MissingChallenge)?;
            (challenge, state.user_token.clone())
        };
        let hasher = self
            .hasher
            .as_deref()
            .ok_or(TransportError::MissingHashFunction)?;
        let user_token = user_token.ok_or(TransportError::MissingCredentials)?;

        let proof = build_proof(
            hasher,
            &user_token,
            &challenge.nonce,
            nonce_count,
            self.client_nonce,
        )
        .await;

        Ok(AuthBlock {
            realm: challenge.realm,
            role_name: ROLE_NAME.to_string(),
            nonce: challenge.nonce,
            client_nonce: proof.client_nonce,
            proof: proof.proof,
            nonce_count,
            algorithm: ALGORITHM.to_string(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_ID: &str = "shellypro1-8cb1";
    const USER_TOKEN: &str = "c9063a862c2d8f594b55bd59ba70726e997537a888831c9cf6caf16d44cd8f5d";

    /// Hashes like SHA-256 but suspends first, standing in for an async backend.
    struct YieldingHasher;

    #[async_trait]
    impl DigestHasher for YieldingHasher {
        async fn compute_digest(&self, data: &[u8]) -> Vec<u8> {
            tokio::task::yield_now().await;
            Sha256::digest(data).to_vec()
        }
    }

    fn challenge(nonce_count: u64) -> Challenge {
        Challenge {
            nonce: Nonce::Number(1625038762),
            realm: DEVICE_ID.into(),
            nonce_count,
        }
    }

    #[tokio::test]
    async fn test_derive_user_token() {
        let token = derive_user_token(Some(&Sha256Hasher), ROLE_NAME, DEVICE_ID, "secret")
            .await
            .unwrap();
        assert_eq!(token, USER_TOKEN);
    }

    #[tokio::test]
    async fn test_derive_user_token_without_hasher() {
        let result = derive_user_token(None, ROLE_NAME, DEVICE_ID, "secret").await;
        assert_eq!(result, Err(TransportError::MissingHashFunction));
    }

    #[tokio::test]
    async fn test_build_proof_known_value() {
        let proof = build_proof(&Sha256Hasher, USER_TOKEN, &Nonce::Number(1625038762), 1, 123456).await;
        assert_eq!(proof.client_nonce, 123456);
        assert_eq!(
            proof.proof,
            "3940e4f3e435e0bad40252601dc9846d14e2c8e2bba8a95900a58f9a8ac98131"
        );
    }

    #[tokio::test]
    async fn test_build_proof_sensitive_to_every_input() {
        let nonce = Nonce::from("N1");
        let base = build_proof(&Sha256Hasher, USER_TOKEN, &nonce, 1, 7).await;
        assert_eq!(base, build_proof(&Sha256Hasher, USER_TOKEN, &nonce, 1, 7).await);

        let variants = [
            build_proof(&Sha256Hasher, "other-token", &nonce, 1, 7).await,
            build_proof(&Sha256Hasher, USER_TOKEN, &Nonce::from("N2"), 1, 7).await,
            build_proof(&Sha256Hasher, USER_TOKEN, &nonce, 2, 7).await,
            build_proof(&Sha256Hasher, USER_TOKEN, &nonce, 1, 8).await,
        ];
        for variant in variants {
            assert_ne!(variant.proof, base.proof);
        }
    }

    #[tokio::test]
    async fn test_async_hasher_matches_sync() {
        let nonce = Nonce::from("N1");
        let sync = build_proof(&Sha256Hasher, USER_TOKEN, &nonce, 3, 9).await;
        let suspended = build_proof(&YieldingHasher, USER_TOKEN, &nonce, 3, 9).await;
        assert_eq!(sync, suspended);
    }

    #[tokio::test]
    async fn test_auth_block_requires_challenge() {
        let handler = AuthHandler::new(Some(Arc::new(Sha256Hasher)));
        handler.authenticate(DEVICE_ID, "secret").await.unwrap();

        assert_eq!(
            handler.regenerate_auth_block(1).await,
            Err(TransportError::MissingChallenge)
        );

        handler.capture_challenge(challenge(1));
        let block = handler.regenerate_auth_block(5).await.unwrap();
        assert_eq!(block.nonce, Nonce::Number(1625038762));
        assert_eq!(block.realm, DEVICE_ID);
        assert_eq!(block.nonce_count, 5);
        assert_eq!(block.role_name, "admin");
        assert_eq!(block.algorithm, "SHA-256");
        assert_eq!(block.client_nonce, handler.client_nonce());
    }

    #[tokio::test]
    async fn test_auth_block_without_hasher() {
        let handler = AuthHandler::new(None);
        handler.capture_challenge(challenge(1));
        assert_eq!(
            handler.regenerate_auth_block(1).await,
            Err(TransportError::MissingHashFunction)
        );
    }

    #[tokio::test]
    async fn test_auth_block_without_credentials() {
        let handler = AuthHandler::new(Some(Arc::new(Sha256Hasher)));
        handler.capture_challenge(challenge(1));
        assert_eq!(
            handler.regenerate_auth_block(1).await,
            Err(TransportError::MissingCredentials)
        );
    }

    #[tokio::test]
    async fn test_auth_block_proof_matches_build_proof() {
        let handler = AuthHandler::with_client_nonce(Some(Arc::new(Sha256Hasher)), 123456);
        handler.authenticate(DEVICE_ID, "secret").await.unwrap();
        handler.capture_challenge(challenge(1));

        let block = handler.regenerate_auth_block(1).await.unwrap();
        assert_eq!(
            block.proof,
            "3940e4f3e435e0bad40252601dc9846d14e2c8e2bba8a95900a58f9a8ac98131"
        );
    }

    #[test]
    fn test_nonce_count_advances() {
        let handler = AuthHandler::new(None);
        assert_eq!(handler.next_nonce_count(), None);

        handler.capture_challenge(challenge(3));
        assert_eq!(handler.next_nonce_count(), Some(3));
        assert_eq!(handler.next_nonce_count(), Some(4));
        assert_eq!(handler.challenge().unwrap().nonce_count, 5);

        // A new challenge replaces the old one wholesale
        handler.capture_challenge(challenge(1));
        assert_eq!(handler.next_nonce_count(), Some(1));
    }

    #[test]
    fn test_client_nonce_is_per_instance() {
        let handler = AuthHandler::new(None);
        assert_eq!(handler.client_nonce(), handler.client_nonce());

        // Independent draws; a repeat across all of them would mean a shared nonce
        let nonces: std::collections::HashSet<u32> = (0..8)
            .map(|_| AuthHandler::new(None).client_nonce())
            .collect();
        assert!(nonces.len() > 1, "every handler drew {:?}", nonces);
    }
}
