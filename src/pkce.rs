use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::session::{PkceExchange, SessionStore};
use crate::types::FlowOrigin;

/// Generates a cryptographically random code verifier for PKCE.
///
/// Returns a 43-character URL-safe string (32 random bytes, RFC 7636 compliant).
#[must_use]
pub fn generate_code_verifier() -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Computes the S256 code challenge from a code verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
#[must_use]
pub fn generate_code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generates a cryptographically random state parameter for `OAuth2`.
///
/// Returns a 22-character URL-safe string (16 random bytes → base64url).
#[must_use]
pub fn generate_state() -> String {
    let random_bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Generates an opaque identifier for sessions and pending selections.
///
/// Returns a 32-character URL-safe string (24 random bytes → base64url).
#[must_use]
pub fn generate_opaque_id() -> String {
    let random_bytes: [u8; 24] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// A freshly started flow: what goes into the authorization URL.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PendingAuthorization {
    pub state: String,
    pub code_challenge: String,
    pub origin: FlowOrigin,
}

/// A redeemed callback, ready for the token endpoint.
#[derive(Debug)]
#[non_exhaustive]
pub struct RedeemedCode {
    pub code: String,
    pub code_verifier: String,
    pub origin: FlowOrigin,
}

/// Issues PKCE state handles and redeems them exactly once.
pub struct PkceFlowManager<S> {
    store: Arc<S>,
}

impl<S> Clone for PkceFlowManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: SessionStore> PkceFlowManager<S> {
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Generate a verifier/challenge pair and a state handle, and store the
    /// verifier under the state.
    pub async fn start(&self, origin: FlowOrigin) -> Result<PendingAuthorization, Error> {
        let state = generate_state();
        let code_verifier = generate_code_verifier();
        let code_challenge = generate_code_challenge(&code_verifier);

        self.store
            .insert_exchange(state.clone(), PkceExchange::new(code_verifier, origin))
            .await?;

        Ok(PendingAuthorization {
            state,
            code_challenge,
            origin,
        })
    }

    /// Consume the exchange stored under `state`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownOrExpiredState`] when the state was never
    /// issued, has expired, or was already redeemed.
    pub async fn redeem(&self, state: &str, code: &str) -> Result<RedeemedCode, Error> {
        let exchange = self
            .store
            .take_exchange(state)
            .await?
            .ok_or(Error::UnknownOrExpiredState)?;

        Ok(RedeemedCode {
            code: code.to_owned(),
            code_verifier: exchange.code_verifier,
            origin: exchange.origin,
        })
    }
}
