//! Environment configuration.
//!
//! Everything is read through a lookup function so tests can supply a map;
//! [`BrokerConfig::from_env`] plugs in the process environment. Empty values
//! count as unset.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::broker::Broker;
use crate::error::Error;
use crate::oauth::{IdpClient, OAuthConfig};
use crate::server::ServerSettings;
use crate::session::SessionStore;
use crate::teams::TeamTable;
use crate::token::AssertionMinter;
use crate::vault::{SecretStoreClient, VaultConfig};
use crate::well_known::JwkSet;

const DEFAULT_REDIRECT_URI: &str = "http://localhost:8081/auth/callback";
const DEFAULT_VAULT_ADDR: &str = "http://vault:8200";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8081";

/// How minted assertions are signed.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SigningConfig {
    pub key_path: PathBuf,
    pub kid: Option<String>,
    pub issuer: String,
    pub audience: String,
    pub strict: bool,
}

/// Trust settings for caller-signed assertions.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AssertionConfig {
    pub jwks_path: PathBuf,
    pub issuer: String,
    pub audience: String,
}

/// Full broker configuration.
#[derive(Debug)]
#[non_exhaustive]
pub struct BrokerConfig {
    pub oauth: OAuthConfig,
    pub vault: VaultConfig,
    pub signing: SigningConfig,
    /// `None` disables the assertion exchange.
    pub assertion: Option<AssertionConfig>,
    pub teams_file: Option<PathBuf>,
    /// `None` disables the background reaper.
    pub reaper_interval: Option<Duration>,
    pub bind_addr: SocketAddr,
    pub server: ServerSettings,
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, Error> {
    lookup(key).ok_or_else(|| Error::ConfigurationMissing(format!("{key} is required")))
}

fn parse_url(key: &str, value: &str) -> Result<Url, Error> {
    value
        .parse()
        .map_err(|e| Error::ConfigurationMissing(format!("{key}: {e}")))
}

impl BrokerConfig {
    /// Read configuration from the process environment.
    ///
    /// # Errors
    ///
    /// See [`BrokerConfig::from_lookup`].
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationMissing`] naming the first required
    /// variable that is absent or the first value that does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let domain = required(&lookup, "OKTA_DOMAIN")?;
        let client_id = required(&lookup, "OKTA_CLIENT_ID")?;
        let client_secret = required(&lookup, "OKTA_CLIENT_SECRET")?;
        let auth_server = lookup("OKTA_AUTH_SERVER_ID").unwrap_or_else(|| "default".into());
        let redirect_uri = parse_url(
            "OKTA_REDIRECT_URI",
            &lookup("OKTA_REDIRECT_URI").unwrap_or_else(|| DEFAULT_REDIRECT_URI.into()),
        )?;

        let oauth = match lookup("OKTA_BASE_URL") {
            Some(base) => OAuthConfig::from_base_url(
                parse_url("OKTA_BASE_URL", &base)?,
                client_id,
                redirect_uri,
            )?,
            None => OAuthConfig::okta(&domain, &auth_server, client_id, redirect_uri)?,
        }
        .with_client_secret(client_secret);

        let bootstrap_token = lookup("VAULT_TOKEN")
            .or_else(|| lookup("VAULT_ROOT_TOKEN"))
            .ok_or_else(|| {
                Error::ConfigurationMissing("VAULT_TOKEN or VAULT_ROOT_TOKEN is required".into())
            })?;
        let mut vault = VaultConfig::new(
            lookup("VAULT_ADDR").unwrap_or_else(|| DEFAULT_VAULT_ADDR.into()),
            bootstrap_token,
        );
        if let Some(mount) = lookup("VAULT_JWT_MOUNT") {
            vault = vault.with_jwt_mount(mount);
        }

        let signing = SigningConfig {
            key_path: lookup("BROKER_SIGNING_KEY_PATH")
                .unwrap_or_else(|| "jwt_signing_key".into())
                .into(),
            kid: lookup("BROKER_SIGNING_KID"),
            issuer: lookup("BROKER_ISSUER").unwrap_or_else(|| "bazel-auth-broker".into()),
            audience: lookup("BROKER_AUDIENCE").unwrap_or_else(|| "bazel-vault".into()),
            strict: matches!(lookup("BROKER_STRICT_SIGNING").as_deref(), Some("1" | "true")),
        };

        let assertion = lookup("BROKER_JWKS_PATH").map(|path| AssertionConfig {
            jwks_path: path.into(),
            issuer: lookup("ASSERTION_ISSUER").unwrap_or_else(|| signing.issuer.clone()),
            audience: lookup("ASSERTION_AUDIENCE").unwrap_or_else(|| signing.audience.clone()),
        });

        let reaper_secs = match lookup("BROKER_REAPER_INTERVAL_SECS") {
            Some(v) => v.parse::<u64>().map_err(|e| {
                Error::ConfigurationMissing(format!("BROKER_REAPER_INTERVAL_SECS: {e}"))
            })?,
            None => 60,
        };

        let bind_addr = lookup("BROKER_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.into())
            .parse()
            .map_err(|e| Error::ConfigurationMissing(format!("BROKER_BIND_ADDR: {e}")))?;

        Ok(Self {
            oauth,
            vault,
            signing,
            assertion,
            teams_file: lookup("BROKER_TEAMS_FILE").map(PathBuf::from),
            reaper_interval: (reaper_secs > 0).then(|| Duration::from_secs(reaper_secs)),
            bind_addr,
            server: ServerSettings::from_lookup(lookup)?,
        })
    }

    /// The minter described by the signing settings. A missing key file is
    /// not an error here; the minter records it and falls back (or refuses,
    /// when strict).
    #[must_use]
    pub fn minter(&self) -> AssertionMinter {
        let mut minter = AssertionMinter::new(&self.signing.issuer, &self.signing.audience)
            .with_key_file(&self.signing.key_path)
            .strict(self.signing.strict);
        if let Some(kid) = &self.signing.kid {
            minter = minter.with_kid(kid);
        }
        minter
    }

    /// The team table from `BROKER_TEAMS_FILE`, or the built-in one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationMissing`] if the file cannot be loaded.
    pub fn teams(&self) -> Result<TeamTable, Error> {
        match &self.teams_file {
            Some(path) => TeamTable::from_file(path),
            None => Ok(TeamTable::builtin()),
        }
    }

    /// Assemble a broker over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationMissing`] if the team table or JWKS
    /// cannot be loaded, or an HTTP client cannot be built.
    pub fn build_broker<S: SessionStore>(&self, store: Arc<S>) -> Result<Broker<S>, Error> {
        let mut broker = Broker::new(
            IdpClient::new(self.oauth.clone())?,
            SecretStoreClient::new(self.vault.clone())?,
            self.minter(),
            store,
        )
        .with_teams(self.teams()?);

        if let Some(assertion) = &self.assertion {
            let jwks = JwkSet::from_file(&assertion.jwks_path)?;
            broker = broker.with_assertion_keys(jwks, &assertion.issuer, &assertion.audience)?;
        }
        Ok(broker)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;
    use crate::session::MemorySessionStore;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const MINIMAL: &[(&str, &str)] = &[
        ("OKTA_DOMAIN", "dev.okta.example"),
        ("OKTA_CLIENT_ID", "cid"),
        ("OKTA_CLIENT_SECRET", "secret"),
        ("VAULT_TOKEN", "root"),
    ];

    #[test]
    fn minimal_env_uses_defaults() {
        let config = BrokerConfig::from_lookup(env(MINIMAL)).unwrap();

        assert_eq!(
            config.oauth.token_url().as_str(),
            "https://dev.okta.example/oauth2/default/v1/token"
        );
        assert_eq!(
            config.oauth.redirect_uri().as_str(),
            "http://localhost:8081/auth/callback"
        );
        assert_eq!(config.vault.address, "http://vault:8200");
        assert_eq!(config.vault.jwt_mount, "jwt");
        assert_eq!(config.vault.bootstrap_token.expose_secret(), "root");
        assert_eq!(config.signing.issuer, "bazel-auth-broker");
        assert_eq!(config.signing.audience, "bazel-vault");
        assert!(!config.signing.strict);
        assert!(config.assertion.is_none());
        assert_eq!(config.reaper_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.bind_addr.port(), 8081);
    }

    #[test]
    fn missing_required_values_are_named() {
        for key in ["OKTA_DOMAIN", "OKTA_CLIENT_ID", "OKTA_CLIENT_SECRET"] {
            let pairs: Vec<_> = MINIMAL.iter().copied().filter(|(k, _)| *k != key).collect();
            let err = BrokerConfig::from_lookup(env(&pairs)).unwrap_err();
            assert!(err.to_string().contains(key), "{err}");
        }

        let pairs: Vec<_> = MINIMAL
            .iter()
            .copied()
            .filter(|(k, _)| *k != "VAULT_TOKEN")
            .collect();
        let err = BrokerConfig::from_lookup(env(&pairs)).unwrap_err();
        assert!(matches!(err, Error::ConfigurationMissing(_)));
    }

    #[test]
    fn empty_values_count_as_missing() {
        let mut pairs = MINIMAL.to_vec();
        pairs.retain(|(k, _)| *k != "OKTA_CLIENT_ID");
        pairs.push(("OKTA_CLIENT_ID", "  "));
        assert!(BrokerConfig::from_lookup(env(&pairs)).is_err());
    }

    #[test]
    fn root_token_is_accepted_as_bootstrap() {
        let mut pairs: Vec<_> = MINIMAL
            .iter()
            .copied()
            .filter(|(k, _)| *k != "VAULT_TOKEN")
            .collect();
        pairs.push(("VAULT_ROOT_TOKEN", "legacy-root"));
        let config = BrokerConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(config.vault.bootstrap_token.expose_secret(), "legacy-root");
    }

    #[test]
    fn optional_settings_are_applied() {
        let mut pairs = MINIMAL.to_vec();
        pairs.extend([
            ("OKTA_BASE_URL", "http://127.0.0.1:9000/oauth2/custom"),
            ("VAULT_ADDR", "https://vault.internal:8200"),
            ("VAULT_JWT_MOUNT", "ci-jwt"),
            ("BROKER_STRICT_SIGNING", "true"),
            ("BROKER_SIGNING_KID", "k1"),
            ("BROKER_JWKS_PATH", "/etc/broker/jwks.json"),
            ("ASSERTION_ISSUER", "ci-system"),
            ("BROKER_REAPER_INTERVAL_SECS", "0"),
            ("BROKER_BIND_ADDR", "127.0.0.1:9090"),
        ]);
        let config = BrokerConfig::from_lookup(env(&pairs)).unwrap();

        assert_eq!(
            config.oauth.auth_url().as_str(),
            "http://127.0.0.1:9000/oauth2/custom/v1/authorize"
        );
        assert_eq!(config.vault.jwt_mount, "ci-jwt");
        assert!(config.signing.strict);
        assert_eq!(config.signing.kid.as_deref(), Some("k1"));
        let assertion = config.assertion.unwrap();
        assert_eq!(assertion.issuer, "ci-system");
        assert_eq!(assertion.audience, "bazel-vault");
        assert_eq!(config.reaper_interval, None);
        assert_eq!(config.bind_addr.port(), 9090);
    }

    #[test]
    fn bad_reaper_interval_is_rejected() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("BROKER_REAPER_INTERVAL_SECS", "soon"));
        assert!(BrokerConfig::from_lookup(env(&pairs)).is_err());
    }

    fn fixture(name: &str) -> String {
        format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
    }

    #[test]
    fn build_broker_loads_team_table_and_jwks() {
        let teams = fixture("teams.json");
        let jwks = fixture("jwks.json");
        let mut pairs = MINIMAL.to_vec();
        pairs.extend([
            ("BROKER_TEAMS_FILE", teams.as_str()),
            ("BROKER_JWKS_PATH", jwks.as_str()),
            ("ASSERTION_ISSUER", "ci-system"),
        ]);
        let config = BrokerConfig::from_lookup(env(&pairs)).unwrap();

        let broker = config
            .build_broker(Arc::new(MemorySessionStore::new()))
            .unwrap();

        assert!(broker.assertion_exchange_enabled());
        assert!(broker.jwks().find("test-kid-1").is_some());
        assert_eq!(broker.teams().fallback().team.as_str(), "guest-team");
        assert_eq!(
            broker.teams().role_for(&crate::types::TeamName::from("sre-team")),
            "sre-role"
        );
    }

    #[test]
    fn build_broker_defaults_to_builtin_table_without_assertions() {
        let config = BrokerConfig::from_lookup(env(MINIMAL)).unwrap();
        let broker = config
            .build_broker(Arc::new(MemorySessionStore::new()))
            .unwrap();

        assert!(!broker.assertion_exchange_enabled());
        assert!(broker.jwks().keys.is_empty());
        assert_eq!(broker.teams(), &TeamTable::builtin());
    }

    #[test]
    fn build_broker_fails_on_unreadable_files() {
        for (key, value) in [
            ("BROKER_TEAMS_FILE", "/nonexistent/teams.json"),
            ("BROKER_JWKS_PATH", "/nonexistent/jwks.json"),
        ] {
            let mut pairs = MINIMAL.to_vec();
            pairs.push((key, value));
            let config = BrokerConfig::from_lookup(env(&pairs)).unwrap();

            let err = config
                .build_broker(Arc::new(MemorySessionStore::new()))
                .err()
                .unwrap();
            assert!(matches!(err, Error::ConfigurationMissing(_)), "{key}: {err}");
        }
    }

    #[test]
    fn missing_signing_key_degrades_minter() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("BROKER_SIGNING_KEY_PATH", "/nonexistent/key.pem"));
        let config = BrokerConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(
            config.minter().posture(),
            crate::token::SigningPosture::Degraded
        );
    }
}
