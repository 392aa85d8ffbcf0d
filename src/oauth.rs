use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, UpstreamFailure};
use crate::pkce::PendingAuthorization;
use crate::session::IdentityTokens;
use crate::types::clone_secret;

/// Bound on every outbound call to the identity provider or secret store.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client whose requests give up after `timeout`.
///
/// # Errors
///
/// Returns [`Error::ConfigurationMissing`] if the client cannot be built
/// (for example, the TLS backend fails to initialize).
pub(crate) fn upstream_client(timeout: Duration) -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::ConfigurationMissing(format!("HTTP client: {e}")))
}

const DEFAULT_SCOPES: [&str; 4] = ["openid", "profile", "email", "groups"];

/// Identity provider `OAuth2` configuration.
///
/// Endpoints are derived from the authorization server's base URL
/// (`https://{domain}/oauth2/{server}/`) and can be overridden one by one.
///
/// ```rust,ignore
/// use credential_broker::OAuthConfig;
///
/// let config = OAuthConfig::okta("example.okta.com", "default", "client-id", redirect)?
///     .with_client_secret("s3cret");
/// ```
#[derive(Debug)]
#[non_exhaustive]
pub struct OAuthConfig {
    pub(crate) client_id: String,
    pub(crate) client_secret: Option<SecretString>,
    pub(crate) auth_url: Url,
    pub(crate) token_url: Url,
    pub(crate) userinfo_url: Url,
    pub(crate) redirect_uri: Url,
    pub(crate) scopes: Vec<String>,
}

impl Clone for OAuthConfig {
    fn clone(&self) -> Self {
        Self {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.as_ref().map(clone_secret),
            auth_url: self.auth_url.clone(),
            token_url: self.token_url.clone(),
            userinfo_url: self.userinfo_url.clone(),
            redirect_uri: self.redirect_uri.clone(),
            scopes: self.scopes.clone(),
        }
    }
}

impl OAuthConfig {
    /// Configuration for an Okta-style authorization server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationMissing`] if the domain or server id do
    /// not form a valid URL.
    pub fn okta(
        domain: &str,
        auth_server_id: &str,
        client_id: impl Into<String>,
        redirect_uri: Url,
    ) -> Result<Self, Error> {
        let base: Url = format!("https://{domain}/oauth2/{auth_server_id}/")
            .parse()
            .map_err(|e| Error::ConfigurationMissing(format!("OKTA_DOMAIN: {e}")))?;
        Self::from_base_url(base, client_id, redirect_uri)
    }

    /// Configuration whose endpoints live under `base` (`v1/authorize`,
    /// `v1/token`, `v1/userinfo`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationMissing`] if `base` cannot be a base URL.
    pub fn from_base_url(
        mut base: Url,
        client_id: impl Into<String>,
        redirect_uri: Url,
    ) -> Result<Self, Error> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = |path: &str| {
            base.join(path)
                .map_err(|e| Error::ConfigurationMissing(format!("identity provider URL: {e}")))
        };

        Ok(Self {
            client_id: client_id.into(),
            client_secret: None,
            auth_url: endpoint("v1/authorize")?,
            token_url: endpoint("v1/token")?,
            userinfo_url: endpoint("v1/userinfo")?,
            redirect_uri,
            scopes: DEFAULT_SCOPES.iter().map(|s| (*s).to_string()).collect(),
        })
    }

    /// Client secret sent with the code exchange (confidential clients).
    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(SecretString::from(secret.into()));
        self
    }

    #[must_use]
    pub fn with_auth_url(mut self, url: Url) -> Self {
        self.auth_url = url;
        self
    }

    #[must_use]
    pub fn with_token_url(mut self, url: Url) -> Self {
        self.token_url = url;
        self
    }

    #[must_use]
    pub fn with_userinfo_url(mut self, url: Url) -> Self {
        self.userinfo_url = url;
        self
    }

    /// Override the requested scopes (default: `openid profile email groups`).
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn auth_url(&self) -> &Url {
        &self.auth_url
    }

    #[must_use]
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    #[must_use]
    pub fn userinfo_url(&self) -> &Url {
        &self.userinfo_url
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }
}

/// Token response from the identity provider's token endpoint.
#[derive(Debug, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    pub access_token: SecretString,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub id_token: Option<SecretString>,
    #[serde(default)]
    pub refresh_token: Option<SecretString>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// The tokens the broker keeps alongside a session.
    #[must_use]
    pub fn into_identity_tokens(self) -> IdentityTokens {
        IdentityTokens {
            access_token: self.access_token,
            id_token: self.id_token,
        }
    }
}

/// Profile claims from the userinfo endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Group names, in the order the identity provider returned them.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Profile {
    #[must_use]
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_groups<I, G>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Email, or a placeholder when the identity provider omitted it.
    #[must_use]
    pub fn email_or_unknown(&self) -> &str {
        self.email.as_deref().unwrap_or("unknown@example.com")
    }

    /// Display name, or a placeholder when the identity provider omitted it.
    #[must_use]
    pub fn name_or_unknown(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown User")
    }
}

/// `OAuth2` client for the identity provider.
pub struct IdpClient {
    config: OAuthConfig,
    http: reqwest::Client,
}

impl IdpClient {
    /// Create a client whose requests time out after [`UPSTREAM_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationMissing`] if the HTTP client cannot be
    /// built.
    pub fn new(config: OAuthConfig) -> Result<Self, Error> {
        let http = upstream_client(UPSTREAM_TIMEOUT)?;
        Ok(Self { config, http })
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Build the authorization URL for a started PKCE flow.
    #[must_use]
    pub fn authorization_url(&self, pending: &PendingAuthorization) -> String {
        let scope = self.config.scopes.join(" ");

        let mut url = self.config.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", "code")
            .append_pair("scope", &scope)
            .append_pair("redirect_uri", self.config.redirect_uri.as_str())
            .append_pair("state", &pending.state)
            .append_pair("code_challenge", &pending.code_challenge)
            .append_pair("code_challenge_method", "S256");

        url.into()
    }

    /// Exchange an authorization code for tokens using PKCE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenExchangeFailed`] on a non-success response,
    /// a transport failure, or a timeout.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, Error> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.expose_secret()));
        }

        let response = self
            .http
            .post(self.config.token_url.clone())
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::TokenExchangeFailed(UpstreamFailure::transport(&e)))?;

        let response = ensure_success(response, Error::TokenExchangeFailed).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchangeFailed(UpstreamFailure::transport(&e)))
    }

    /// Fetch profile claims (email, name, groups) using an access token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProfileFetchFailed`] on a non-success response,
    /// a transport failure, or a timeout.
    pub async fn fetch_profile(&self, access_token: &str) -> Result<Profile, Error> {
        let response = self
            .http
            .get(self.config.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::ProfileFetchFailed(UpstreamFailure::transport(&e)))?;

        let response = ensure_success(response, Error::ProfileFetchFailed).await?;
        response
            .json::<Profile>()
            .await
            .map_err(|e| Error::ProfileFetchFailed(UpstreamFailure::transport(&e)))
    }
}

/// Checks HTTP response status; returns the response on success or the
/// caller's error kind carrying status and body.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    kind: fn(UpstreamFailure) -> Error,
) -> Result<reqwest::Response, Error> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(kind(UpstreamFailure::status(status, body)))
}
