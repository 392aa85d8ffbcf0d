//! Team assertions: minting for secret-store login, and verification of
//! caller-signed assertions for the headless exchange.
//!
//! A minted assertion's subject is the team, not the person. The secret store
//! keys its identity entity on `sub`, so everyone on a team shares one entity;
//! the individual survives only in the `user`/`name` claims for audit.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::Error;
use crate::oauth::Profile;
use crate::types::{KeyId, TeamName};
use crate::well_known::JwkSet;

/// Lifetime of a minted assertion.
pub const ASSERTION_LIFETIME: Duration = Duration::hours(2);

/// Development-only HMAC secret used when no RSA key is available.
pub const DEV_SIGNING_SECRET: &str = "bazel-demo-jwt-signing-key-2024";

/// Clock skew tolerated when checking `exp`/`nbf` of caller assertions.
pub const VERIFY_LEEWAY_SECS: u64 = 30;

/// The `aud` claim: one audience or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    #[must_use]
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Self::One(one) => one == audience,
            Self::Many(many) => many.iter().any(|a| a == audience),
        }
    }
}

impl From<&str> for Audience {
    fn from(audience: &str) -> Self {
        Self::One(audience.to_owned())
    }
}

impl From<String> for Audience {
    fn from(audience: String) -> Self {
        Self::One(audience)
    }
}

/// Claims of a team assertion.
///
/// Minted assertions always carry `iat`; caller assertions may omit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct AssertionClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Audience,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
}

impl AssertionClaims {
    /// The caller's profile as carried in the claims.
    #[must_use]
    pub fn profile(&self) -> Profile {
        Profile {
            sub: Some(self.sub.clone()),
            email: self.user.clone(),
            name: self.name.clone(),
            groups: self.groups.clone(),
        }
    }
}

/// Signing posture reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningPosture {
    /// RS256 with the configured key.
    Asymmetric,
    /// No usable key; minting falls back to the development secret.
    Degraded,
    /// No usable key and the fallback is refused.
    Unavailable,
}

/// A signed assertion ready for federated login.
#[derive(Debug)]
#[non_exhaustive]
pub struct MintedAssertion {
    pub token: SecretString,
    pub algorithm: Algorithm,
    /// `true` when signed with the development secret.
    pub degraded: bool,
    pub expires_at: OffsetDateTime,
}

/// Builds and signs team assertions.
pub struct AssertionMinter {
    issuer: String,
    audience: String,
    kid: Option<KeyId>,
    key: Result<EncodingKey, String>,
    strict: bool,
    fallbacks: AtomicU64,
}

impl std::fmt::Debug for AssertionMinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssertionMinter")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("kid", &self.kid)
            .field("posture", &self.posture())
            .field("fallbacks", &self.fallback_count())
            .finish_non_exhaustive()
    }
}

impl AssertionMinter {
    /// A minter with no key loaded yet.
    #[must_use]
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            kid: None,
            key: Err("no signing key configured".into()),
            strict: false,
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Load the RSA key from PEM bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SigningKeyUnavailable`] if the PEM is not an RSA key.
    pub fn with_rsa_pem(mut self, pem: &[u8]) -> Result<Self, Error> {
        let key = EncodingKey::from_rsa_pem(pem)
            .map_err(|e| Error::SigningKeyUnavailable(e.to_string()))?;
        self.key = Ok(key);
        Ok(self)
    }

    /// Load the RSA key from a PEM file. A missing or unparseable file is
    /// recorded as the reason minting will fall back.
    #[must_use]
    pub fn with_key_file(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        self.key = std::fs::read(path)
            .map_err(|e| format!("{}: {e}", path.display()))
            .and_then(|pem| {
                EncodingKey::from_rsa_pem(&pem).map_err(|e| format!("{}: {e}", path.display()))
            });
        if let Err(reason) = &self.key {
            tracing::warn!(%reason, "Signing key unavailable");
        }
        self
    }

    #[must_use]
    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(KeyId(kid.into()));
        self
    }

    /// Refuse the development-secret fallback.
    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    #[must_use]
    pub fn posture(&self) -> SigningPosture {
        match (&self.key, self.strict) {
            (Ok(_), _) => SigningPosture::Asymmetric,
            (Err(_), false) => SigningPosture::Degraded,
            (Err(_), true) => SigningPosture::Unavailable,
        }
    }

    /// Number of assertions signed with the development secret so far.
    #[must_use]
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Sign an assertion for `team` on behalf of `profile`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SigningKeyUnavailable`] when RS256 signing is not
    /// possible and the minter is strict.
    pub fn mint(&self, profile: &Profile, team: &TeamName) -> Result<MintedAssertion, Error> {
        let issued_at = OffsetDateTime::now_utc();
        let expires_at = issued_at + ASSERTION_LIFETIME;
        let claims = AssertionClaims {
            iss: self.issuer.clone(),
            sub: team.to_string(),
            aud: Audience::from(self.audience.as_str()),
            iat: Some(issued_at.unix_timestamp()),
            exp: expires_at.unix_timestamp(),
            nbf: None,
            user: Some(profile.email_or_unknown().to_owned()),
            name: Some(profile.name_or_unknown().to_owned()),
            groups: profile.groups.clone(),
            team: Some(team.to_string()),
        };

        let reason = match &self.key {
            Ok(key) => {
                let mut header = Header::new(Algorithm::RS256);
                header.kid = self.kid.as_ref().map(ToString::to_string);
                match jsonwebtoken::encode(&header, &claims, key) {
                    Ok(token) => {
                        return Ok(MintedAssertion {
                            token: SecretString::from(token),
                            algorithm: Algorithm::RS256,
                            degraded: false,
                            expires_at,
                        });
                    }
                    Err(e) => e.to_string(),
                }
            }
            Err(reason) => reason.clone(),
        };

        self.mint_fallback(&claims, team, reason, expires_at)
    }

    fn mint_fallback(
        &self,
        claims: &AssertionClaims,
        team: &TeamName,
        reason: String,
        expires_at: OffsetDateTime,
    ) -> Result<MintedAssertion, Error> {
        if self.strict {
            tracing::error!(%team, %reason, "RS256 signing failed and fallback is disabled");
            return Err(Error::SigningKeyUnavailable(reason));
        }

        let count = self.fallbacks.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            %team,
            %reason,
            fallbacks = count,
            "Signing assertion with the development HS256 secret"
        );

        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(DEV_SIGNING_SECRET.as_bytes()),
        )
        .map_err(|e| Error::SigningKeyUnavailable(e.to_string()))?;

        Ok(MintedAssertion {
            token: SecretString::from(token),
            algorithm: Algorithm::HS256,
            degraded: true,
            expires_at,
        })
    }
}

/// Verifies caller-signed RS256 assertions against a JWKS.
pub struct AssertionVerifier {
    keys: HashMap<String, DecodingKey>,
    validation: Validation,
}

impl AssertionVerifier {
    /// Build a verifier from every RSA key in `jwks`. Keys of other types, or
    /// RSA keys missing `n`/`e`, are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationMissing`] if a key's modulus or exponent
    /// cannot be decoded.
    pub fn from_jwks(
        jwks: &JwkSet,
        issuer: &str,
        audience: &str,
    ) -> Result<Self, Error> {
        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            let Some((n, e)) = jwk.rsa_components() else {
                tracing::debug!(kid = %jwk.kid, kty = %jwk.kty, "Skipping non-RSA JWKS key");
                continue;
            };
            let key = DecodingKey::from_rsa_components(n, e)
                .map_err(|e| Error::ConfigurationMissing(format!("JWKS key {}: {e}", jwk.kid)))?;
            keys.insert(jwk.kid.clone(), key);
        }

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.validate_nbf = true;
        validation.leeway = VERIFY_LEEWAY_SECS;

        Ok(Self { keys, validation })
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Verify signature, algorithm, issuer, audience, and time window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssertionInvalid`] on any failure.
    pub fn verify(&self, token: &str) -> Result<AssertionClaims, Error> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| Error::AssertionInvalid(format!("malformed assertion: {e}")))?;
        if header.alg != Algorithm::RS256 {
            return Err(Error::AssertionInvalid(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| Error::AssertionInvalid("missing kid".into()))?;
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| Error::AssertionInvalid(format!("unknown kid {kid}")))?;

        jsonwebtoken::decode::<AssertionClaims>(token, key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| Error::AssertionInvalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    const SIGNING_KEY: &[u8] = include_bytes!("../tests/fixtures/signing_key.pem");
    const FOREIGN_KEY: &[u8] = include_bytes!("../tests/fixtures/foreign_key.pem");
    const JWKS: &str = include_str!("../tests/fixtures/jwks.json");

    fn profile() -> Profile {
        Profile::new("a@x.com")
            .with_name("Ada")
            .with_groups(["backend-developers"])
    }

    fn verifier() -> AssertionVerifier {
        let jwks = JwkSet::from_json(JWKS).unwrap();
        AssertionVerifier::from_jwks(&jwks, "ci-system", "bazel-vault").unwrap()
    }

    fn claims(offset_iat: i64, offset_exp: i64) -> AssertionClaims {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        AssertionClaims {
            iss: "ci-system".into(),
            sub: "pipeline-7".into(),
            aud: "bazel-vault".into(),
            iat: Some(now + offset_iat),
            exp: now + offset_exp,
            nbf: None,
            user: Some("ci@x.com".into()),
            name: None,
            groups: vec!["frontend-developers".into()],
            team: None,
        }
    }

    fn sign<T: Serialize>(claims: &T, pem: &[u8], kid: Option<&str>) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = kid.map(str::to_owned);
        jsonwebtoken::encode(&header, claims, &EncodingKey::from_rsa_pem(pem).unwrap()).unwrap()
    }

    #[test]
    fn mint_rs256_with_team_subject() {
        let minter = AssertionMinter::new("ci-system", "bazel-vault")
            .with_rsa_pem(SIGNING_KEY)
            .unwrap()
            .with_kid("test-kid-1");

        let minted = minter.mint(&profile(), &TeamName::from("backend-team")).unwrap();
        assert_eq!(minted.algorithm, Algorithm::RS256);
        assert!(!minted.degraded);
        assert_eq!(minter.posture(), SigningPosture::Asymmetric);

        let claims = verifier().verify(minted.token.expose_secret()).unwrap();
        assert_eq!(claims.sub, "backend-team");
        assert_eq!(claims.team.as_deref(), Some("backend-team"));
        assert_eq!(claims.user.as_deref(), Some("a@x.com"));
        assert_eq!(claims.name.as_deref(), Some("Ada"));
        assert_eq!(claims.groups, vec!["backend-developers"]);
        assert_eq!(claims.aud, Audience::from("bazel-vault"));
        assert_eq!(claims.iat.map(|iat| claims.exp - iat), Some(7200));
    }

    #[test]
    fn missing_key_falls_back_and_is_counted() {
        let minter = AssertionMinter::new("bazel-auth-broker", "bazel-vault")
            .with_key_file("/nonexistent/jwt_signing_key");
        assert_eq!(minter.posture(), SigningPosture::Degraded);

        let minted = minter.mint(&profile(), &TeamName::from("backend-team")).unwrap();
        assert!(minted.degraded);
        assert_eq!(minted.algorithm, Algorithm::HS256);
        assert_eq!(minter.fallback_count(), 1);

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&["bazel-vault"]);
        let decoded = jsonwebtoken::decode::<AssertionClaims>(
            minted.token.expose_secret(),
            &DecodingKey::from_secret(DEV_SIGNING_SECRET.as_bytes()),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims.sub, "backend-team");
    }

    #[test]
    fn strict_minter_refuses_fallback() {
        let minter = AssertionMinter::new("bazel-auth-broker", "bazel-vault").strict(true);
        assert_eq!(minter.posture(), SigningPosture::Unavailable);

        let err = minter
            .mint(&profile(), &TeamName::from("backend-team"))
            .unwrap_err();
        assert!(matches!(err, Error::SigningKeyUnavailable(_)));
        assert_eq!(minter.fallback_count(), 0);
    }

    #[test]
    fn invalid_pem_is_rejected() {
        let result = AssertionMinter::new("i", "a").with_rsa_pem(b"not a key");
        assert!(matches!(result, Err(Error::SigningKeyUnavailable(_))));
    }

    #[test]
    fn verify_accepts_caller_assertion() {
        let token = sign(&claims(0, 300), SIGNING_KEY, Some("test-kid-1"));
        let verified = verifier().verify(&token).unwrap();
        assert_eq!(verified.profile().email_or_unknown(), "ci@x.com");
        assert_eq!(verified.profile().groups, vec!["frontend-developers"]);
    }

    #[test]
    fn verify_rejects_unknown_or_missing_kid() {
        let unknown = sign(&claims(0, 300), SIGNING_KEY, Some("rotated-out"));
        let missing = sign(&claims(0, 300), SIGNING_KEY, None);

        assert!(matches!(verifier().verify(&unknown), Err(Error::AssertionInvalid(_))));
        assert!(matches!(verifier().verify(&missing), Err(Error::AssertionInvalid(_))));
    }

    #[test]
    fn verify_rejects_foreign_signature() {
        let token = sign(&claims(0, 300), FOREIGN_KEY, Some("test-kid-1"));
        assert!(matches!(verifier().verify(&token), Err(Error::AssertionInvalid(_))));
    }

    #[test]
    fn verify_rejects_wrong_audience_and_issuer() {
        let mut wrong_aud = claims(0, 300);
        wrong_aud.aud = "someone-else".into();
        let mut wrong_iss = claims(0, 300);
        wrong_iss.iss = "someone-else".into();

        for c in [wrong_aud, wrong_iss] {
            let token = sign(&c, SIGNING_KEY, Some("test-kid-1"));
            assert!(matches!(verifier().verify(&token), Err(Error::AssertionInvalid(_))));
        }
    }

    #[test]
    fn verifier_skips_non_rsa_keys() {
        let mut jwks = JwkSet::from_json(JWKS).unwrap();
        let extra = JwkSet::from_json(
            r#"{"keys": [{"kty": "EC", "kid": "ec-1", "crv": "P-256", "x": "f83O", "y": "x_FE"}]}"#,
        )
        .unwrap();
        jwks.keys.extend(extra.keys);

        let verifier = AssertionVerifier::from_jwks(&jwks, "ci-system", "bazel-vault").unwrap();
        assert_eq!(verifier.key_count(), 1);

        let token = sign(&claims(0, 300), SIGNING_KEY, Some("test-kid-1"));
        assert!(verifier.verify(&token).is_ok());
    }

    #[test]
    fn verify_accepts_assertion_without_iat() {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let token = sign(
            &serde_json::json!({
                "iss": "ci-system",
                "aud": "bazel-vault",
                "sub": "pipeline-7",
                "exp": now + 300,
            }),
            SIGNING_KEY,
            Some("test-kid-1"),
        );

        let verified = verifier().verify(&token).unwrap();
        assert_eq!(verified.iat, None);
        assert_eq!(verified.sub, "pipeline-7");
    }

    #[test]
    fn verify_accepts_audience_list() {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let listed = |aud: &[&str]| {
            sign(
                &serde_json::json!({
                    "iss": "ci-system",
                    "aud": aud,
                    "sub": "pipeline-7",
                    "iat": now,
                    "exp": now + 300,
                }),
                SIGNING_KEY,
                Some("test-kid-1"),
            )
        };

        let verified = verifier().verify(&listed(&["other", "bazel-vault"])).unwrap();
        assert!(verified.aud.contains("bazel-vault"));
        assert!(matches!(verified.aud, Audience::Many(_)));

        assert!(matches!(
            verifier().verify(&listed(&["other", "elsewhere"])),
            Err(Error::AssertionInvalid(_))
        ));
    }

    #[test]
    fn verify_enforces_time_window_with_leeway() {
        let expired = sign(&claims(-600, -120), SIGNING_KEY, Some("test-kid-1"));
        assert!(matches!(verifier().verify(&expired), Err(Error::AssertionInvalid(_))));

        let within_leeway = sign(&claims(-600, -10), SIGNING_KEY, Some("test-kid-1"));
        assert!(verifier().verify(&within_leeway).is_ok());

        let mut early = claims(0, 600);
        early.nbf = Some(OffsetDateTime::now_utc().unix_timestamp() + 300);
        let not_yet = sign(&early, SIGNING_KEY, Some("test-kid-1"));
        assert!(matches!(verifier().verify(&not_yet), Err(Error::AssertionInvalid(_))));
    }

    #[test]
    fn verify_rejects_symmetric_assertions() {
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims(0, 300),
            &EncodingKey::from_secret(DEV_SIGNING_SECRET.as_bytes()),
        )
        .unwrap();
        assert!(matches!(verifier().verify(&token), Err(Error::AssertionInvalid(_))));
    }

    #[test]
    fn verify_rejects_garbage() {
        assert!(matches!(verifier().verify("not.a.jwt"), Err(Error::AssertionInvalid(_))));
    }
}
